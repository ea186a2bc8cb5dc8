//! Wiring between the replication session and the serving side: every
//! change landing on the session's channel is decoded just far enough to
//! route it, appended to the store, announced to the tracker, and
//! acknowledged back to the server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::envelope::ChangeEnvelope;
use crate::error::{Error, Result};
use crate::replication::session::{ReplicationSession, WalChange};
use crate::sequence::Sequence;
use crate::storage::ChangeStore;
use crate::tracker::ChangeTracker;

pub struct Relay {
    session: ReplicationSession,
    store: Arc<dyn ChangeStore>,
    tracker: ChangeTracker,
    healthy: Arc<AtomicBool>,
    /// Changes at or below this sequence were stored before a restart and
    /// are replayed by the server; they are skipped, not re-stored.
    first_sequence: Sequence,
}

impl Relay {
    pub fn new(
        session: ReplicationSession,
        store: Arc<dyn ChangeStore>,
        tracker: ChangeTracker,
        healthy: Arc<AtomicBool>,
        first_sequence: Sequence,
    ) -> Relay {
        Relay {
            session,
            store,
            tracker,
            healthy,
            first_sequence,
        }
    }

    /// Drain the change stream until it fails or `shutdown` fires. On a
    /// stream failure the health flag goes down and the tracker is closed
    /// so blocked long-polls return promptly.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                change = self.session.changes().recv() => match change {
                    Some(Ok(change)) => self.handle_change(change).await,
                    Some(Err(err)) => {
                        error!("replication stream failed: {err}");
                        self.healthy.store(false, Ordering::SeqCst);
                        self.tracker.close().await;
                        return Err(err);
                    }
                    None => {
                        self.healthy.store(false, Ordering::SeqCst);
                        return Err(Error::Closed("change stream ended".to_string()));
                    }
                },
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    self.session.stop().await;
                    self.tracker.close().await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_change(&mut self, change: WalChange) {
        let envelope = match ChangeEnvelope::decode(&change.data) {
            Ok(envelope) => envelope,
            Err(err) => {
                // A bad payload is dropped, never allowed to kill the stream.
                warn!(lsn = change.lsn, "discarding undecodable change: {err}");
                return;
            }
        };
        let seq = envelope.sequence();
        if seq <= self.first_sequence {
            debug!(%seq, "skipping already-stored change");
            return;
        }
        if let Err(err) = self
            .store
            .put(&envelope.scope, seq.lsn, seq.index, change.data.clone())
        {
            error!(%seq, "failed to store change: {err}");
            return;
        }
        self.tracker.update(seq, &envelope.scope).await;
        self.session.acknowledge(seq.lsn);
    }
}
