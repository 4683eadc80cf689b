//! Task-type dispatch table.
//!
//! Maps a task kind to the handler that executes it — a strategy table
//! populated at startup, not conditionals scattered through the engine. The
//! registry holds no scheduling state; handlers are opaque to the scheduler
//! and any error they return is converted into a failed task result by the
//! worker, never propagated.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

/// A task handler.
///
/// `process` receives the task's payload and either returns a serializable
/// value or an error; it may run in-place on a worker's async context or be
/// driven to completion on an offload pool thread, so implementations must
/// not assume a particular runtime.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Handler name for logging.
    fn name(&self) -> &str;

    async fn process(&self, payload: serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

type HandlerFn = Box<
    dyn Fn(
            serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send>>
        + Send
        + Sync,
>;

/// Adapts a plain async closure into a [`Processor`].
struct FnProcessor {
    name: String,
    handler: HandlerFn,
}

#[async_trait]
impl Processor for FnProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, payload: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        (self.handler)(payload).await
    }
}

/// Registry of task-type handlers.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, Arc<dyn Processor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `kind`, replacing any existing mapping.
    pub fn register(&self, kind: impl Into<String>, processor: Arc<dyn Processor>) {
        let kind = kind.into();
        info!(kind = %kind, processor = processor.name(), "registered processor");
        self.processors
            .write()
            .expect("processor registry lock poisoned")
            .insert(kind, processor);
    }

    /// Register an async closure as the handler for `kind`.
    pub fn register_fn<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        let kind = kind.into();
        let processor = FnProcessor {
            name: kind.clone(),
            handler: Box::new(move |payload| Box::pin(handler(payload))),
        };
        self.register(kind, Arc::new(processor));
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Processor>> {
        self.processors
            .read()
            .expect("processor registry lock poisoned")
            .get(kind)
            .cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.processors
            .read()
            .expect("processor registry lock poisoned")
            .contains_key(kind)
    }
}
