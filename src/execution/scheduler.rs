use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::AbortHandle;

struct Scheduled {
    generation: u64,
    handle: AbortHandle,
}

/// Cancellable background tasks keyed by instrument
///
/// At most one task exists per key: scheduling again aborts the previous
/// one. A finished task removes its own entry. Once [`cancel_all`] runs the
/// scheduler refuses new work.
///
/// [`cancel_all`]: ExitScheduler::cancel_all
#[derive(Clone, Default)]
pub struct ExitScheduler {
    tasks: Arc<Mutex<HashMap<String, Scheduled>>>,
    next_generation: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl ExitScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` for `key`, replacing any outstanding one
    ///
    /// Returns false when the scheduler is closed.
    pub fn schedule<F>(&self, key: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            tracing::debug!(key, "Scheduler closed, task not scheduled");
            return false;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let tasks = self.tasks.clone();
        let owned_key = key.to_string();

        let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(async move {
            task.await;
            let mut tasks = tasks.lock().unwrap_or_else(|e| e.into_inner());
            if tasks.get(&owned_key).map(|s| s.generation) == Some(generation) {
                tasks.remove(&owned_key);
            }
        })
        .abort_handle();

        if let Some(previous) = guard.insert(key.to_string(), Scheduled { generation, handle }) {
            previous.handle.abort();
            tracing::debug!(key, "Replaced outstanding task");
        }
        true
    }

    /// Abort the task for `key`, if any
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        match removed {
            Some(scheduled) => {
                scheduled.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Close the scheduler and abort everything outstanding
    pub fn cancel_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Scheduled> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, s)| s)
            .collect();
        for scheduled in &drained {
            scheduled.handle.abort();
        }
        drained.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
