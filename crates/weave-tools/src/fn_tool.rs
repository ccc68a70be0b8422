use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;

use weave_core::error::Result;
use weave_core::traits::Tool;

type Handler = Box<
    dyn Fn(serde_json::Map<String, serde_json::Value>) -> BoxFuture<'static, Result<serde_json::Value>>
        + Send
        + Sync,
>;

/// A tool backed by an async closure.
pub struct FnTool {
    name: String,
    description: String,
    schema: serde_json::Value,
    timeout: Option<Duration>,
    handler: Handler,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(serde_json::Map<String, serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({"type": "object"}),
            timeout: None,
            handler: Box::new(move |args| Box::pin(handler(args))),
        }
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    fn execute(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        (self.handler)(arguments)
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
