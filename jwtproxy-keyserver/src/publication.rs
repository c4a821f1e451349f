use std::{
    future::{pending, Future},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::sync::{oneshot, Notify};

use jwtproxy_slo::{errors, Result};

#[derive(Debug, Default)]
struct Cancellation {
    canceled: AtomicBool,
    notify: Notify,
}

/// Cloneable cancel side of a [`Publication`].
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<Cancellation>,
}

impl CancelHandle {
    /// Idempotent and never blocks.
    pub fn cancel(&self) {
        if !self.inner.canceled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Resolves once [`CancelHandle::cancel`] has been called.
    pub async fn canceled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_canceled() {
                return;
            }
            notified.await;
        }
    }
}

/// Handle on an in-flight "publish public key" call.
///
/// The result is observed at most once through [`Publication::result`]. A
/// canceled publication never yields, even if the remote call completed
/// first, so a select loop holding one never acts on a discarded result.
#[derive(Debug)]
pub struct Publication {
    result: Option<oneshot::Receiver<Result<()>>>,
    cancel: CancelHandle,
}

/// Producer side of a pending [`Publication`], held by the key server.
#[derive(Debug)]
pub struct Publisher {
    sender: oneshot::Sender<Result<()>>,
    cancel: CancelHandle,
}

impl Publication {
    /// A publication waiting on its [`Publisher`].
    pub fn pending() -> (Self, Publisher) {
        let (sender, receiver) = oneshot::channel();
        let cancel = CancelHandle::default();
        (
            Self {
                result: Some(receiver),
                cancel: cancel.clone(),
            },
            Publisher { sender, cancel },
        )
    }

    /// A placeholder that never yields a result.
    pub fn never() -> Self {
        Self {
            result: None,
            cancel: CancelHandle::default(),
        }
    }

    /// An already resolved publication.
    pub fn ready(result: Result<()>) -> Self {
        let (publication, publisher) = Self::pending();
        publisher.resolve(result);
        publication
    }

    /// Runs `call` as a detached task resolving the publication, the task
    /// stops early when the publication is canceled.
    pub fn spawn<F>(call: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (publication, publisher) = Self::pending();
        let cancel = publisher.cancel_handle();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.canceled() => {}
                result = call => publisher.resolve(result),
            }
        });
        publication
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    /// Waits for the publish outcome. Pends forever on a `never`
    /// publication, once canceled, and after the result was taken.
    pub async fn result(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();
        let outcome = match self.result.as_mut() {
            Some(receiver) => tokio::select! {
                biased;
                _ = cancel.canceled() => None,
                outcome = receiver => Some(outcome),
            },
            None => None,
        };
        match outcome {
            Some(outcome) => {
                self.result = None;
                outcome.unwrap_or_else(|_| {
                    Err(errors::publish("publisher dropped without a result"))
                })
            }
            None => pending().await,
        }
    }
}

impl Publisher {
    /// Delivers the outcome. Discarded when the publication was canceled.
    pub fn resolve(self, result: Result<()>) {
        if self.cancel.is_canceled() {
            return;
        }
        let _ = self.sender.send(result);
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_canceled()
    }

    pub async fn canceled(&self) {
        self.cancel.canceled().await
    }
}
