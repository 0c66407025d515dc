//! Per-task cancellation registry
//!
//! The registry is an explicit object owned by the orchestrator instance,
//! so separate orchestrators (notably under test) never share cancellation
//! state. One handle exists per running task; tokens are cheap clones and
//! every clone trips when the handle is cancelled.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::debug;

use crate::types::TaskId;

/// Cancellation signal observed by in-flight pricing calls
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    // Keeps the sender alive for detached tokens so `cancelled()` stays pending
    _guard: Option<Arc<watch::Sender<bool>>>,
}

impl CancelToken {
    /// Token that never trips, for calls made outside a task run
    pub fn detached() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _guard: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the owning handle is cancelled. Never resolves if the
    /// handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
            _guard: None,
        }
    }
}

/// Table of cancellation handles keyed by task identity
#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<HashMap<TaskId, CancelHandle>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running task and obtain its token. Re-registering a task
    /// replaces any previous handle.
    pub fn register(&self, task_id: &TaskId) -> CancelToken {
        let (tx, _rx) = watch::channel(false);
        let handle = CancelHandle { tx };
        let token = handle.token();
        let mut inner = self.inner.lock().expect("cancel registry poisoned");
        inner.insert(task_id.clone(), handle);
        token
    }

    /// Trip every token registered for the task. Returns whether a handle
    /// was present.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let mut inner = self.inner.lock().expect("cancel registry poisoned");
        match inner.remove(task_id) {
            Some(handle) => {
                handle.cancel();
                debug!(task = %task_id, "cancellation handle tripped");
                true
            }
            None => false,
        }
    }

    /// Drop the handle for a task that reached a terminal state
    pub fn remove(&self, task_id: &TaskId) {
        let mut inner = self.inner.lock().expect("cancel registry poisoned");
        inner.remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cancel registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
