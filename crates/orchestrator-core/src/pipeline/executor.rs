//! Pipeline execution: runs one attempt's steps in order against a
//! [`ToolRegistry`], applying template resolution, schema validation,
//! conditional skipping, per-step timeouts, and cooperative
//! cancellation (SPEC_FULL.md §4.4, §5).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::cancellation::CancellationHandle;

use super::schema::{CompiledSchema, SchemaError};
use super::template::{self, Context, TemplateError};
use super::tool_registry::{ToolContextHints, ToolError, ToolRegistry};
use super::{Pipeline, Step};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("template error in step '{step}': {source}")]
    Template { step: String, source: TemplateError },

    #[error("schema error in step '{step}': {source}")]
    Schema { step: String, source: SchemaError },

    #[error("tool error in step '{step}': {source}")]
    Tool { step: String, source: ToolError },

    #[error("step '{0}' exceeded its timeout")]
    Timeout(String),

    #[error("run was canceled")]
    Canceled,
}

impl ExecutorError {
    /// Whether the worker should count this as a retryable failure
    /// (SPEC_FULL.md §7 error kinds).
    pub fn retryable(&self) -> bool {
        match self {
            ExecutorError::Tool { source, .. } => source.retryable(),
            ExecutorError::Timeout(_) => true,
            ExecutorError::Template { .. }
            | ExecutorError::Schema { .. }
            | ExecutorError::Canceled => false,
        }
    }
}

/// The final execution context of a completed (or failed) attempt.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub context: Context,
}

impl ExecutionOutcome {
    /// The document persisted as `TaskRun.output`: the final `steps`
    /// map plus the execution instant, per SPEC_FULL.md §4.4 ("the
    /// final context ... is the TaskRun's output").
    pub fn output_document(&self) -> Value {
        serde_json::json!({
            "now": self.context.now.to_rfc3339(),
            "steps": Value::Object(self.context.steps.clone()),
        })
    }
}

pub struct PipelineExecutor {
    registry: Arc<dyn ToolRegistry>,
    /// Compiled schemas keyed by `"<tool address>:in"`/`"<tool
    /// address>:out"`, so a schema is compiled once per tool and reused
    /// across every step invocation that references it.
    schema_cache: RwLock<HashMap<String, Arc<CompiledSchema>>>,
}

impl PipelineExecutor {
    pub fn new(registry: Arc<dyn ToolRegistry>) -> Self {
        Self {
            registry,
            schema_cache: RwLock::new(HashMap::new()),
        }
    }

    fn compiled_schema(&self, key: &str, schema: &Value) -> Result<Arc<CompiledSchema>, SchemaError> {
        if let Some(cached) = self.schema_cache.read().get(key) {
            return Ok(Arc::clone(cached));
        }
        let compiled = Arc::new(CompiledSchema::compile(schema)?);
        self.schema_cache.write().insert(key.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    #[instrument(
        skip(self, pipeline, cancellation),
        fields(task_id = %hints.task_id, run_id = %hints.run_id, attempt = hints.attempt)
    )]
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        event: Option<Value>,
        now: DateTime<Utc>,
        hints: ToolContextHints,
        cancellation: &CancellationHandle,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let mut ctx = Context::new(now, pipeline.params.clone(), event);
        let mut seen_save_as: HashSet<String> = HashSet::new();

        for step in &pipeline.pipeline {
            if cancellation.is_canceled() {
                warn!(step = %step.id, "run canceled at step boundary");
                return Err(ExecutorError::Canceled);
            }

            if let Some(save_as) = &step.save_as {
                if !seen_save_as.insert(save_as.clone()) {
                    return Err(ExecutorError::Template {
                        step: step.id.clone(),
                        source: TemplateError::DuplicateSaveAs(save_as.clone()),
                    });
                }
            }

            if let Some(skipped) = self.evaluate_skip(step, &ctx)? {
                if skipped {
                    debug!(step = %step.id, "step skipped by condition");
                    continue;
                }
            }

            self.run_step(step, &mut ctx, &hints, cancellation).await?;
        }

        Ok(ExecutionOutcome { context: ctx })
    }

    fn evaluate_skip(&self, step: &Step, ctx: &Context) -> Result<Option<bool>, ExecutorError> {
        let Some(condition) = &step.if_expr else {
            return Ok(None);
        };
        let value = template::resolve_string(condition, ctx).map_err(|source| ExecutorError::Template {
            step: step.id.clone(),
            source,
        })?;
        match value {
            Value::Bool(b) => Ok(Some(!b)),
            _ => Err(ExecutorError::Template {
                step: step.id.clone(),
                source: TemplateError::NotBoolean(condition.clone()),
            }),
        }
    }

    async fn run_step(
        &self,
        step: &Step,
        ctx: &mut Context,
        hints: &ToolContextHints,
        cancellation: &CancellationHandle,
    ) -> Result<(), ExecutorError> {
        let resolved_with = template::resolve_value(&step.with, ctx).map_err(|source| ExecutorError::Template {
            step: step.id.clone(),
            source,
        })?;

        let descriptor = self
            .registry
            .describe(&step.uses)
            .await
            .map_err(|source| ExecutorError::Tool {
                step: step.id.clone(),
                source,
            })?;

        self.compiled_schema(&format!("{}:in", step.uses), &descriptor.input_schema)
            .and_then(|schema| schema.validate(&resolved_with))
            .map_err(|source| ExecutorError::Schema {
                step: step.id.clone(),
                source,
            })?;

        let call_hints = ToolContextHints {
            task_id: hints.task_id,
            run_id: hints.run_id,
            attempt: hints.attempt,
        };
        let call = self.registry.invoke(&step.uses, resolved_with, call_hints);

        let output = tokio::select! {
            biased;
            _ = wait_for_cancellation(cancellation) => {
                warn!(step = %step.id, "run canceled mid-step");
                return Err(ExecutorError::Canceled);
            }
            result = tokio::time::timeout(step.timeout(), call) => {
                match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(source)) => {
                        return Err(ExecutorError::Tool { step: step.id.clone(), source });
                    }
                    Err(_elapsed) => {
                        warn!(step = %step.id, "step timed out");
                        return Err(ExecutorError::Timeout(step.id.clone()));
                    }
                }
            }
        };

        self.compiled_schema(&format!("{}:out", step.uses), &descriptor.output_schema)
            .and_then(|schema| schema.validate(&output))
            .map_err(|source| ExecutorError::Schema {
                step: step.id.clone(),
                source,
            })?;

        if let Some(save_as) = &step.save_as {
            debug!(step = %step.id, save_as = %save_as, "step completed");
            ctx.steps.insert(save_as.clone(), output);
        } else {
            debug!(step = %step.id, "step completed");
        }

        Ok(())
    }
}

/// Polls the cancellation flag at a short, fixed interval so an
/// in-flight tool call can be raced against it without a dedicated
/// broadcast channel per run.
async fn wait_for_cancellation(handle: &CancellationHandle) {
    loop {
        if handle.is_canceled() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::InMemoryToolRegistry;
    use uuid::Uuid;

    fn hints() -> ToolContextHints {
        ToolContextHints {
            task_id: Uuid::now_v7(),
            run_id: Uuid::now_v7(),
            attempt: 1,
        }
    }

    fn pipeline_from(steps: Vec<Step>) -> Pipeline {
        Pipeline {
            params: Value::Null,
            pipeline: steps,
        }
    }

    #[tokio::test]
    async fn template_resolution_across_steps_preserves_numeric_type() {
        let registry = Arc::new(InMemoryToolRegistry::with_reference_tools());
        let executor = PipelineExecutor::new(registry);
        let steps = vec![
            Step {
                id: "a".into(),
                uses: "const".into(),
                with: serde_json::json!({"v": 42}),
                save_as: Some("A".into()),
                if_expr: None,
                timeout_seconds: None,
            },
            Step {
                id: "b".into(),
                uses: "echo".into(),
                with: serde_json::json!({"x": "${steps.A.v}"}),
                save_as: Some("B".into()),
                if_expr: None,
                timeout_seconds: None,
            },
        ];
        let outcome = executor
            .execute(&pipeline_from(steps), None, Utc::now(), hints(), &CancellationHandle::new())
            .await
            .unwrap();
        assert_eq!(
            outcome.context.steps.get("B").unwrap(),
            &serde_json::json!({"x": 42})
        );
    }

    #[tokio::test]
    async fn false_condition_skips_the_step_without_error() {
        let registry = Arc::new(InMemoryToolRegistry::with_reference_tools());
        let executor = PipelineExecutor::new(registry);
        let steps = vec![
            Step {
                id: "a".into(),
                uses: "const".into(),
                with: serde_json::json!({"v": 0}),
                save_as: Some("A".into()),
                if_expr: None,
                timeout_seconds: None,
            },
            Step {
                id: "b".into(),
                uses: "echo".into(),
                with: serde_json::json!({"y": 1}),
                save_as: Some("B".into()),
                if_expr: Some("${steps.A.v > 0}".into()),
                timeout_seconds: None,
            },
        ];
        let outcome = executor
            .execute(&pipeline_from(steps), None, Utc::now(), hints(), &CancellationHandle::new())
            .await
            .unwrap();
        assert!(!outcome.context.steps.contains_key("B"));
    }

    #[tokio::test]
    async fn duplicate_save_as_fails_the_step() {
        let registry = Arc::new(InMemoryToolRegistry::with_reference_tools());
        let executor = PipelineExecutor::new(registry);
        let steps = vec![
            Step {
                id: "a".into(),
                uses: "echo".into(),
                with: serde_json::json!({}),
                save_as: Some("r".into()),
                if_expr: None,
                timeout_seconds: None,
            },
            Step {
                id: "b".into(),
                uses: "echo".into(),
                with: serde_json::json!({}),
                save_as: Some("r".into()),
                if_expr: None,
                timeout_seconds: None,
            },
        ];
        let err = executor
            .execute(&pipeline_from(steps), None, Utc::now(), hints(), &CancellationHandle::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Template { .. }));
    }

    #[tokio::test]
    async fn already_canceled_run_fails_before_the_first_step() {
        let registry = Arc::new(InMemoryToolRegistry::with_reference_tools());
        let executor = PipelineExecutor::new(registry);
        let steps = vec![Step {
            id: "a".into(),
            uses: "echo".into(),
            with: serde_json::json!({}),
            save_as: None,
            if_expr: None,
            timeout_seconds: None,
        }];
        let cancellation = CancellationHandle::new();
        cancellation.cancel();
        let err = executor
            .execute(&pipeline_from(steps), None, Utc::now(), hints(), &cancellation)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Canceled));
    }

    #[tokio::test]
    async fn unknown_tool_address_fails_the_step() {
        let registry = Arc::new(InMemoryToolRegistry::empty());
        let executor = PipelineExecutor::new(registry);
        let steps = vec![Step {
            id: "a".into(),
            uses: "does-not-exist".into(),
            with: serde_json::json!({}),
            save_as: None,
            if_expr: None,
            timeout_seconds: None,
        }];
        let err = executor
            .execute(&pipeline_from(steps), None, Utc::now(), hints(), &CancellationHandle::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Tool { .. }));
    }
}
