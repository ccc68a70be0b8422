use futures::future::BoxFuture;

use weave_core::error::Result;
use weave_core::traits::UnitRunner;
use weave_core::types::{UnitRequest, UnitResponse};

/// Completes every unit immediately with a synthetic output naming the
/// inputs and tools it would have received. No model is called.
pub struct DryRunRunner;

impl UnitRunner for DryRunRunner {
    fn run(&self, request: UnitRequest) -> BoxFuture<'_, Result<UnitResponse>> {
        Box::pin(async move { Ok(UnitResponse::complete(describe(&request))) })
    }
}

fn describe(request: &UnitRequest) -> String {
    let mut out = format!("[dry-run] {}", request.unit_id);
    if !request.inputs.is_empty() {
        let inputs: Vec<&str> = request.inputs.keys().map(String::as_str).collect();
        out.push_str(&format!(" inputs=[{}]", inputs.join(", ")));
    }
    if !request.tools.is_empty() {
        let tools: Vec<&str> = request.tools.iter().map(|t| t.name.as_str()).collect();
        out.push_str(&format!(" tools=[{}]", tools.join(", ")));
    }
    out
}
