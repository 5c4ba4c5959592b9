//! Tool Registry: the external collaborator that resolves a step's
//! `uses` address to a callable tool (SPEC_FULL.md §6). Production
//! deployments supply an HTTP-backed implementation; this crate ships
//! only [`InMemoryToolRegistry`] as a reference implementation for
//! tests and local development — not a production registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub address: String,
    pub transport: String,
    pub endpoint: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub timeout_default_seconds: u64,
    pub scopes_required: Vec<String>,
}

/// Correlation fields attached to a tool call so a remote implementation
/// can tie the call back to the originating run (SPEC_FULL.md §6 "tool
/// wire protocol").
#[derive(Debug, Clone, Serialize)]
pub struct ToolContextHints {
    pub task_id: Uuid,
    pub run_id: Uuid,
    pub attempt: u32,
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("unknown tool address '{0}'")]
    UnknownTool(String),

    #[error("tool '{kind}' failed: {message}")]
    Failed {
        kind: String,
        message: String,
        retryable: bool,
    },
}

impl ToolError {
    pub fn retryable(&self) -> bool {
        matches!(self, ToolError::Failed { retryable: true, .. })
    }
}

#[async_trait]
pub trait ToolRegistry: Send + Sync {
    async fn describe(&self, address: &str) -> Result<ToolDescriptor, ToolError>;

    async fn invoke(
        &self,
        address: &str,
        args: Value,
        hints: ToolContextHints,
    ) -> Result<Value, ToolError>;
}

type Handler = dyn Fn(&Value) -> Result<Value, ToolError> + Send + Sync;

struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: Arc<Handler>,
}

/// A reference `ToolRegistry` holding handlers directly in memory. Ships
/// two stand-in tools (`echo`, `const`) that pass their input through
/// unchanged, sufficient to exercise template resolution and
/// conditional skipping without a real transport.
pub struct InMemoryToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl Default for InMemoryToolRegistry {
    fn default() -> Self {
        Self::with_reference_tools()
    }
}

impl InMemoryToolRegistry {
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn with_reference_tools() -> Self {
        let mut registry = Self::empty();
        registry.register_identity("echo");
        registry.register_identity("const");
        registry
    }

    pub fn register(
        &mut self,
        address: &str,
        descriptor: ToolDescriptor,
        handler: impl Fn(&Value) -> Result<Value, ToolError> + Send + Sync + 'static,
    ) {
        self.tools.insert(
            address.to_string(),
            RegisteredTool {
                descriptor,
                handler: Arc::new(handler),
            },
        );
    }

    /// Registers a tool that returns its `with` map unchanged — the
    /// simplest possible stand-in, used for `echo`/`const` above and
    /// reusable by tests that need a named no-op tool.
    pub fn register_identity(&mut self, address: &str) {
        self.register(
            address,
            permissive_descriptor(address),
            |input| Ok(input.clone()),
        );
    }
}

fn permissive_descriptor(address: &str) -> ToolDescriptor {
    ToolDescriptor {
        address: address.to_string(),
        transport: "in-memory".to_string(),
        endpoint: format!("memory://{address}"),
        input_schema: serde_json::json!({"type": "object"}),
        output_schema: serde_json::json!({"type": "object"}),
        timeout_default_seconds: 30,
        scopes_required: Vec::new(),
    }
}

#[async_trait]
impl ToolRegistry for InMemoryToolRegistry {
    async fn describe(&self, address: &str) -> Result<ToolDescriptor, ToolError> {
        self.tools
            .get(address)
            .map(|t| t.descriptor.clone())
            .ok_or_else(|| ToolError::UnknownTool(address.to_string()))
    }

    async fn invoke(
        &self,
        address: &str,
        args: Value,
        _hints: ToolContextHints,
    ) -> Result<Value, ToolError> {
        let tool = self
            .tools
            .get(address)
            .ok_or_else(|| ToolError::UnknownTool(address.to_string()))?;
        (tool.handler)(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hints() -> ToolContextHints {
        ToolContextHints {
            task_id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn identity_tool_returns_its_input_unchanged() {
        let registry = InMemoryToolRegistry::with_reference_tools();
        let output = registry
            .invoke("echo", serde_json::json!({"msg": "hi"}), hints())
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"msg": "hi"}));
    }

    #[tokio::test]
    async fn unknown_address_is_an_error() {
        let registry = InMemoryToolRegistry::with_reference_tools();
        let err = registry
            .invoke("does-not-exist", serde_json::json!({}), hints())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn custom_tool_can_signal_a_retryable_failure() {
        let mut registry = InMemoryToolRegistry::empty();
        registry.register(
            "flaky",
            permissive_descriptor("flaky"),
            |_input| {
                Err(ToolError::Failed {
                    kind: "temporary".to_string(),
                    message: "simulated outage".to_string(),
                    retryable: true,
                })
            },
        );
        let err = registry
            .invoke("flaky", serde_json::json!({}), hints())
            .await
            .unwrap_err();
        assert!(err.retryable());
    }
}
