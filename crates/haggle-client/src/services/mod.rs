pub mod presence_service;
pub mod sync_service;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle to a group of background tasks with per-task shutdown channels.
///
/// Every loop is a `tokio::select!` over its work source and its shutdown
/// receiver, so `shutdown()` returns once all tasks have actually exited.
pub struct ServiceHandle {
    shutdowns: Vec<mpsc::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    pub(crate) fn new() -> Self {
        Self {
            shutdowns: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, shutdown: mpsc::Sender<()>, task: JoinHandle<()>) {
        self.shutdowns.push(shutdown);
        self.tasks.push(task);
    }

    /// Signal every task and wait for them to exit.
    pub async fn shutdown(mut self) {
        for tx in self.shutdowns.drain(..) {
            let _ = tx.send(()).await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
