//! Handoff between the repository refresh worker and the view rebuild worker.
//!
//! The producer bumps a generation counter after a repository snapshot has
//! been persisted; the consumer blocks until it observes a generation newer
//! than the last one it consumed.  Signals that arrive while the consumer is
//! busy coalesce into one, so the producer never waits on the consumer and
//! the consumer always rebuilds from the newest snapshot.
//!
//! If repository refreshes keep failing no signal is sent and the view
//! rebuild stays parked until the next successful refresh.

use tokio::sync::watch;

use super::CacheError;

/// Monotonic id of a persisted repository snapshot. `0` means none yet.
pub type Generation = u64;

/// Create the producer/consumer pair. Neither half is `Clone`, so there is
/// exactly one of each.
pub fn refresh_gate() -> (RefreshSignal, RefreshWaiter) {
    let (tx, rx) = watch::channel(0);
    (RefreshSignal { tx }, RefreshWaiter { rx, last_seen: 0 })
}

#[derive(Debug)]
pub struct RefreshSignal {
    tx: watch::Sender<Generation>,
}

impl RefreshSignal {
    /// Announce that a new repository snapshot is in the store.
    pub fn notify(&self) -> Generation {
        self.tx.send_modify(|generation| *generation += 1);
        *self.tx.borrow()
    }
}

#[derive(Debug)]
pub struct RefreshWaiter {
    rx: watch::Receiver<Generation>,
    last_seen: Generation,
}

impl RefreshWaiter {
    /// Wait for a snapshot newer than the last one consumed and return its
    /// generation. Fails with [`CacheError::GateClosed`] once the signal has
    /// been dropped and nothing new is pending.
    pub async fn wait_for_fresh(&mut self) -> Result<Generation, CacheError> {
        self.rx
            .wait_for(|generation| *generation > self.last_seen)
            .await
            .map_err(|_| CacheError::GateClosed)?;
        let generation = *self.rx.borrow_and_update();
        self.last_seen = generation;
        Ok(generation)
    }

    #[cfg(test)]
    fn last_seen(&self) -> Generation {
        self.last_seen
    }
}
