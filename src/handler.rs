//! Service-side task registry.
//!
//! The registry maps command/request names to async handler functions. It
//! is populated through the server builder before startup and read-only
//! afterwards; every accepted connection consults the same table for both
//! inbound Commands and inbound Requests. A request handler is expected to
//! call [`Commander::response`] or [`Commander::error`] - the engine sends
//! nothing on its behalf, so a silent handler looks like a timeout to the
//! peer.
//!
//! Handlers run as spawned tasks: a slow handler never blocks the
//! connection loop, and a failing one is logged at the spawn boundary
//! without tearing the connection down.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::commander::{Commander, InboundDispatch};
use crate::error::Result;
use crate::payload::Envelope;

/// Result type for task functions.
pub type TaskResult = Result<()>;

/// Boxed future for task results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A named handler invoked for inbound Commands and Requests.
pub trait Task<S>: Send + Sync + 'static {
    /// Handle one envelope on behalf of the service.
    fn call(
        &self,
        service: Arc<S>,
        commander: Commander,
        envelope: Envelope,
    ) -> BoxFuture<'static, TaskResult>;
}

/// Adapter turning an async closure into a [`Task`].
struct TaskFn<F>(F);

impl<S, F, Fut> Task<S> for TaskFn<F>
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, Commander, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    fn call(
        &self,
        service: Arc<S>,
        commander: Commander,
        envelope: Envelope,
    ) -> BoxFuture<'static, TaskResult> {
        Box::pin((self.0)(service, commander, envelope))
    }
}

/// Registry mapping names to tasks. Read-only after startup.
pub struct TaskRegistry<S> {
    tasks: HashMap<String, Arc<dyn Task<S>>>,
}

impl<S: Send + Sync + 'static> TaskRegistry<S> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a task under a name. Re-registering a name replaces the
    /// previous task with a warning.
    pub fn register<F, Fut>(&mut self, name: &str, task: F)
    where
        F: Fn(Arc<S>, Commander, Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        if self
            .tasks
            .insert(name.to_string(), Arc::new(TaskFn(task)))
            .is_some()
        {
            tracing::warn!(task = %name, "task re-registered, replacing previous handler");
        }
    }

    /// Look up a task by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Task<S>>> {
        self.tasks.get(name)
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no tasks are registered.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Registered task names, unordered.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(|s| s.as_str())
    }
}

impl<S: Send + Sync + 'static> Default for TaskRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds a registry and a service instance to one connection's engine.
pub(crate) struct ServiceDispatch<S> {
    pub service: Arc<S>,
    pub registry: Arc<TaskRegistry<S>>,
}

impl<S: Send + Sync + 'static> InboundDispatch for ServiceDispatch<S> {
    fn dispatch(&self, commander: Commander, envelope: Envelope) -> bool {
        let Some(task) = self.registry.get(&envelope.name) else {
            return false;
        };

        let name = envelope.name.clone();
        let conn = commander.connection_id().to_string();
        let future = task.call(self.service.clone(), commander, envelope);
        tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::error!(conn = %conn, task = %name, "task failed: {}", e);
            }
        });
        true
    }
}
