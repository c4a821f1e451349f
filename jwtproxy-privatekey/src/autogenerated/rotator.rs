use std::{future::pending, sync::Arc};

use tokio::{
    sync::oneshot,
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use jwtproxy_keyserver::Publication;

use super::Inner;

impl Inner {
    /// Rotation loop. Exactly one publication is live at a time: a timer
    /// tick cancels it before starting the next, and a confirmed one is
    /// replaced by a `never` placeholder until the next tick.
    pub(super) async fn publish_and_rotate(
        self: Arc<Self>,
        mut publication: Publication,
        mut stop: oneshot::Receiver<()>,
    ) {
        let mut ticker = self.ticker();

        loop {
            tokio::select! {
                _ = &mut stop => {
                    self.span().in_scope(|| info!("Shutting down key publisher"));
                    publication.cancel();
                    return;
                }
                _ = tick(&mut ticker) => {
                    self.span().in_scope(|| debug!("Generating new key"));
                    publication.cancel();
                    let signer = self.store.active().ok();
                    publication = self.attempt_publish(signer).await;
                }
                result = publication.result() => match result {
                    Err(err) => {
                        self.span().in_scope(|| error!("Error publishing key: {}", err));
                        (self.on_fatal)(&err);
                        return;
                    }
                    Ok(()) => {
                        match self.store.promote() {
                            Some(key) => {
                                self.span()
                                    .in_scope(|| debug!("Successfully published key"));
                                self.save_in_background(key);
                            }
                            None => warn!("Publication confirmed without a pending key"),
                        }
                        publication = Publication::never();
                    }
                },
            }
        }
    }

    fn ticker(&self) -> Option<Interval> {
        if self.rotate_every.is_zero() {
            info!("Key rotation is disabled");
            return None;
        }
        let mut ticker =
            interval_at(Instant::now() + self.rotate_every, self.rotate_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Some(ticker)
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}
