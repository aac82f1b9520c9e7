use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{Result, SchedulerError},
    types::Params,
};

/// Everything a task body gets for one attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job_id: String,
    pub params: Params,
    /// Zero-based attempt index within the firing.
    pub attempt: u32,
    /// Fired when the attempt times out. Long-running tasks should select on
    /// `cancel.cancelled()`; the executor aborts them after a short grace period
    /// either way.
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

/// A unit of invocable work.
///
/// Implemented for any `Fn(TaskContext) -> impl Future<Output = anyhow::Result<Value>>`,
/// so plain async closures can be registered directly.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<Value> {
        (self)(ctx).await
    }
}

/// JSON kind a parameter value must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl ParamKind {
    fn accepts(self, v: &Value) -> bool {
        match self {
            ParamKind::String => v.is_string(),
            ParamKind::Integer => v.is_i64() || v.is_u64(),
            ParamKind::Number => v.is_number(),
            ParamKind::Boolean => v.is_boolean(),
            ParamKind::Object => v.is_object(),
            ParamKind::Array => v.is_array(),
            ParamKind::Any => true,
        }
    }
}

/// Declared task parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// A registered capability.
#[derive(Clone, Serialize)]
pub struct Task {
    pub name: String,
    pub title: String,
    pub description: Option<String>,
    pub params: Vec<ParamSpec>,
    #[serde(skip)]
    handler: Arc<dyn TaskHandler>,
}

impl Task {
    /// Declare a parameter. Chain after [`TaskRegistry::register`].
    pub fn param(&mut self, spec: ParamSpec) -> &mut Self {
        self.params.push(spec);
        self
    }

    pub fn handler(&self) -> Arc<dyn TaskHandler> {
        Arc::clone(&self.handler)
    }

    /// Check `params` against the declared parameters.
    pub fn validate_params(&self, params: &Params) -> Result<()> {
        for key in params.keys() {
            if !self.params.iter().any(|p| &p.name == key) {
                return Err(SchedulerError::validation(format!(
                    "task '{}' has no parameter '{key}'",
                    self.name
                )));
            }
        }
        for spec in &self.params {
            match params.get(&spec.name) {
                None if spec.required => {
                    return Err(SchedulerError::validation(format!(
                        "task '{}' requires parameter '{}'",
                        self.name, spec.name
                    )));
                }
                Some(v) if !spec.kind.accepts(v) => {
                    return Err(SchedulerError::validation(format!(
                        "parameter '{}' of task '{}' must be {:?}",
                        spec.name, self.name, spec.kind
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("title", &self.title)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Name → task map, populated at startup and read-only afterwards.
///
/// Share it as `Arc<TaskRegistry>` once registration is done; lookups need no
/// synchronisation.
#[derive(Default)]
pub struct TaskRegistry {
    /// Insertion order.
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Fails with `DuplicateTask` if the name is taken.
    pub fn register(
        &mut self,
        name: &str,
        title: &str,
        description: Option<&str>,
        handler: impl TaskHandler + 'static,
    ) -> Result<&mut Task> {
        if self.index.contains_key(name) {
            return Err(SchedulerError::DuplicateTask {
                name: name.to_string(),
            });
        }
        let idx = self.tasks.len();
        self.tasks.push(Task {
            name: name.to_string(),
            title: title.to_string(),
            description: description.map(str::to_string),
            params: Vec::new(),
            handler: Arc::new(handler),
        });
        self.index.insert(name.to_string(), idx);
        debug!(task = %name, "task registered");
        Ok(&mut self.tasks[idx])
    }

    pub fn lookup(&self, name: &str) -> Result<&Task> {
        self.index
            .get(name)
            .map(|&i| &self.tasks[i])
            .ok_or_else(|| SchedulerError::UnknownTask {
                name: name.to_string(),
            })
    }

    /// All tasks in registration order.
    pub fn list(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn noop(_ctx: TaskContext) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    fn params(v: Value) -> Params {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut reg = TaskRegistry::new();
        reg.register("ping", "Ping", None, noop).unwrap();
        let err = reg.register("ping", "Ping again", None, noop).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTask { ref name } if name == "ping"));
    }

    #[test]
    fn lookup_unknown_task_fails() {
        let reg = TaskRegistry::new();
        assert!(matches!(reg.lookup("ghost"), Err(SchedulerError::UnknownTask { .. })));
    }

    #[test]
    fn list_preserves_insertion_order() {
        let mut reg = TaskRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            reg.register(name, name, None, noop).unwrap();
        }
        let names: Vec<_> = reg.list().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn declared_params_are_enforced() {
        let mut reg = TaskRegistry::new();
        reg.register("fetch", "Fetch", Some("GET a URL"), noop)
            .unwrap()
            .param(ParamSpec::required("url", ParamKind::String))
            .param(ParamSpec::optional("retries", ParamKind::Integer));
        let task = reg.lookup("fetch").unwrap();

        assert!(task.validate_params(&params(json!({"url": "https://x"}))).is_ok());
        assert!(task
            .validate_params(&params(json!({"url": "https://x", "retries": 3})))
            .is_ok());
        // missing required
        assert!(task.validate_params(&params(json!({}))).is_err());
        // wrong kind
        assert!(task.validate_params(&params(json!({"url": 5}))).is_err());
        assert!(task
            .validate_params(&params(json!({"url": "x", "retries": 1.5})))
            .is_err());
        // undeclared
        assert!(task
            .validate_params(&params(json!({"url": "x", "verbose": true})))
            .is_err());
    }

    #[tokio::test]
    async fn closures_are_task_handlers() {
        let mut reg = TaskRegistry::new();
        reg.register("echo", "Echo", None, |ctx: TaskContext| async move {
            Ok::<_, anyhow::Error>(Value::Object(ctx.params))
        })
        .unwrap();

        let handler = reg.lookup("echo").unwrap().handler();
        let out = handler
            .run(TaskContext {
                job_id: "j".into(),
                params: params(json!({"a": 1})),
                attempt: 0,
                cancel: CancellationToken::new(),
            })
            .await
            .unwrap();
        assert_eq!(out, json!({"a": 1}));
    }
}
