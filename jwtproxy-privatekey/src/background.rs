use std::{future::Future, sync::Arc};

use tokio::{sync::Semaphore, task::JoinHandle};

/// Detached best-effort tasks (revocations, key saves) with a cap on how
/// many run at once. Nothing awaits their outcome; they log their own errors.
#[derive(Debug, Clone)]
pub(crate) struct Background {
    semaphore: Arc<Semaphore>,
}

impl Background {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
        }
    }

    pub(crate) fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            task.await;
        })
    }
}
