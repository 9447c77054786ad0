//! Cooperative task scheduler with labeled classes.
//!
//! A single worker task executes posted closures strictly in order — the
//! overlay's "main thread". Tasks carry a class: normal tasks queue without
//! bound, droppable tasks are shed at enqueue time once the droppable
//! backlog exceeds its limit.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::router::TaskClass;

struct Task {
    name: String,
    class: TaskClass,
    run: Box<dyn FnOnce() + Send>,
}

/// Posting half of the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Task>,
    droppable_queued: Arc<AtomicUsize>,
    droppable_limit: usize,
    shed_total: Arc<AtomicU64>,
}

impl Scheduler {
    /// Create a scheduler and its worker. The worker must be driven (usually
    /// `tokio::spawn(worker.run())`) for posted tasks to execute.
    pub fn new(droppable_limit: usize) -> (Self, SchedulerWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let droppable_queued = Arc::new(AtomicUsize::new(0));
        let scheduler = Self {
            tx,
            droppable_queued: droppable_queued.clone(),
            droppable_limit,
            shed_total: Arc::new(AtomicU64::new(0)),
        };
        let worker = SchedulerWorker {
            rx,
            droppable_queued,
        };
        (scheduler, worker)
    }

    /// Post a task. Returns `false` if the task was shed (droppable backlog
    /// full) or the worker is gone.
    pub fn post(
        &self,
        name: impl Into<String>,
        class: TaskClass,
        run: impl FnOnce() + Send + 'static,
    ) -> bool {
        let name = name.into();
        if class == TaskClass::Droppable {
            let queued = self.droppable_queued.load(Ordering::Relaxed);
            if queued >= self.droppable_limit {
                self.shed_total.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(task = %name, queued, "shedding droppable task");
                return false;
            }
            self.droppable_queued.fetch_add(1, Ordering::Relaxed);
        }
        self.tx
            .send(Task {
                name,
                class,
                run: Box::new(run),
            })
            .is_ok()
    }

    /// Total droppable tasks shed since startup.
    pub fn shed_count(&self) -> u64 {
        self.shed_total.load(Ordering::Relaxed)
    }
}

/// Executing half of the scheduler.
pub struct SchedulerWorker {
    rx: mpsc::UnboundedReceiver<Task>,
    droppable_queued: Arc<AtomicUsize>,
}

impl SchedulerWorker {
    /// Run tasks in posting order until every `Scheduler` handle is dropped.
    pub async fn run(mut self) {
        while let Some(task) = self.rx.recv().await {
            if task.class == TaskClass::Droppable {
                self.droppable_queued.fetch_sub(1, Ordering::Relaxed);
            }
            tracing::trace!(task = %task.name, "running scheduled task");
            (task.run)();
        }
    }
}
