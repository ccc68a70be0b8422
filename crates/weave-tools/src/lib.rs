mod broker;
mod fn_tool;

pub use broker::ToolBroker;
pub use fn_tool::FnTool;
