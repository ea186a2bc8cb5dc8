//! A multi-scope condition variable for change sequences.
//!
//! Callers record that a scope has reached a sequence, and other callers
//! block until a scope of interest reaches a threshold. All state is owned
//! by one task that processes commands from a queue, so there are no locks
//! and no window in which a registration can miss a concurrent update:
//! both pass through the same ordered channel.
//!
//! Waiters cost one oneshot channel each, so thousands of concurrent
//! long-poll requests are cheap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::debug;

use crate::sequence::Sequence;

const COMMAND_BUFFER: usize = 100;

enum TrackerCommand {
    Update {
        seq: Sequence,
        scope: String,
    },
    Register {
        key: u64,
        waiter: Waiter,
    },
    Cancel {
        key: u64,
    },
    Close,
}

struct Waiter {
    threshold: Sequence,
    scopes: Vec<String>,
    reply: oneshot::Sender<Sequence>,
}

/// Handle to a running tracker. Cloneable; all clones talk to the same
/// underlying task.
#[derive(Clone)]
pub struct ChangeTracker {
    cmd_tx: mpsc::Sender<TrackerCommand>,
    next_key: Arc<AtomicU64>,
}

impl ChangeTracker {
    /// Create a tracker with every scope at sequence zero.
    pub fn new() -> ChangeTracker {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run(cmd_rx));
        ChangeTracker {
            cmd_tx,
            next_key: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record that `scope` has reached `seq`, waking matching waiters.
    /// Updates are monotonic per scope; a lower or duplicate sequence is
    /// silently ignored.
    pub async fn update(&self, seq: Sequence, scope: &str) {
        let _ = self
            .cmd_tx
            .send(TrackerCommand::Update {
                seq,
                scope: scope.to_string(),
            })
            .await;
    }

    /// Block until any of `scopes` reaches at least `threshold`, returning
    /// the sequence that satisfied the wait. Returns immediately when a
    /// scope is already there. On tracker shutdown, returns the highest
    /// sequence known for the scope set, which may be below the threshold.
    pub async fn wait(&self, threshold: Sequence, scopes: &[String]) -> Sequence {
        let (_key, reply_rx) = self.register(threshold, scopes).await;
        reply_rx.await.unwrap_or_default()
    }

    /// Like [`ChangeTracker::wait`] but gives up after `max_wait`,
    /// returning the zero sequence as a "nothing new" sentinel. The waiter
    /// is removed on timeout; it can never be woken afterwards.
    pub async fn timed_wait(
        &self,
        threshold: Sequence,
        max_wait: Duration,
        scopes: &[String],
    ) -> Sequence {
        let (key, reply_rx) = self.register(threshold, scopes).await;
        tokio::select! {
            result = reply_rx => result.unwrap_or_default(),
            _ = tokio::time::sleep(max_wait) => {
                let _ = self.cmd_tx.send(TrackerCommand::Cancel { key }).await;
                Sequence::default()
            }
        }
    }

    /// Stop the tracker. Every waiter still registered is woken with the
    /// highest sequence known for its scope set.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(TrackerCommand::Close).await;
    }

    async fn register(
        &self,
        threshold: Sequence,
        scopes: &[String],
    ) -> (u64, oneshot::Receiver<Sequence>) {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        let waiter = Waiter {
            threshold,
            scopes: scopes.to_vec(),
            reply: reply_tx,
        };
        let _ = self
            .cmd_tx
            .send(TrackerCommand::Register { key, waiter })
            .await;
        (key, reply_rx)
    }
}

impl Default for ChangeTracker {
    fn default() -> ChangeTracker {
        ChangeTracker::new()
    }
}

/// The owning task. Nothing else touches these maps.
async fn run(mut cmd_rx: mpsc::Receiver<TrackerCommand>) {
    let mut last_sequences: HashMap<String, Sequence> = HashMap::new();
    let mut waiters: HashMap<u64, Waiter> = HashMap::new();

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            TrackerCommand::Update { seq, scope } => {
                let entry = last_sequences.entry(scope.clone()).or_default();
                if seq > *entry {
                    *entry = seq;
                }
                waiters.retain(|_, waiter| {
                    let satisfied =
                        seq >= waiter.threshold && waiter.scopes.iter().any(|s| *s == scope);
                    if satisfied {
                        // A dropped receiver (timed-out caller racing its
                        // cancel) is fine; the waiter is gone either way.
                        let _ = take_reply(waiter).send(seq);
                    }
                    !satisfied
                });
            }
            TrackerCommand::Register { key, waiter } => {
                let current = max_for_scopes(&last_sequences, &waiter.scopes);
                if current >= waiter.threshold {
                    let _ = waiter.reply.send(current);
                } else {
                    waiters.insert(key, waiter);
                }
            }
            TrackerCommand::Cancel { key } => {
                waiters.remove(&key);
            }
            TrackerCommand::Close => break,
        }
    }

    debug!(waiters = waiters.len(), "tracker closing");
    for (_, waiter) in waiters.drain() {
        let current = max_for_scopes(&last_sequences, &waiter.scopes);
        let _ = waiter.reply.send(current);
    }
}

fn max_for_scopes(last_sequences: &HashMap<String, Sequence>, scopes: &[String]) -> Sequence {
    scopes
        .iter()
        .filter_map(|scope| last_sequences.get(scope))
        .copied()
        .max()
        .unwrap_or_default()
}

// retain() gives us `&mut Waiter`, but oneshot senders are consumed by
// send. Swap in a dummy to move the real one out.
fn take_reply(waiter: &mut Waiter) -> oneshot::Sender<Sequence> {
    let (dummy, _) = oneshot::channel();
    std::mem::replace(&mut waiter.reply, dummy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::Sequence;
    use tokio::time::{timeout, Duration};

    fn scopes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn seq(lsn: u64, index: u32) -> Sequence {
        Sequence::new(lsn, index)
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_already_reached() {
        let tracker = ChangeTracker::new();
        tracker.update(seq(5, 0), "a").await;
        let got = timeout(Duration::from_secs(1), tracker.wait(seq(3, 0), &scopes(&["a"])))
            .await
            .unwrap();
        assert_eq!(got, seq(5, 0));
    }

    #[tokio::test]
    async fn wait_blocks_until_matching_update() {
        let tracker = ChangeTracker::new();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait(seq(10, 0), &scopes(&["a"])).await })
        };
        // An update below the threshold must not wake the waiter.
        tracker.update(seq(9, 0), "a").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tracker.update(seq(10, 0), "a").await;
        assert_eq!(waiter.await.unwrap(), seq(10, 0));
    }

    #[tokio::test]
    async fn update_for_other_scope_does_not_wake() {
        let tracker = ChangeTracker::new();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait(seq(1, 0), &scopes(&["a"])).await })
        };
        tracker.update(seq(5, 0), "b").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tracker.update(seq(1, 0), "a").await;
        assert_eq!(waiter.await.unwrap(), seq(1, 0));
    }

    #[tokio::test]
    async fn multi_scope_wait_woken_by_either() {
        let tracker = ChangeTracker::new();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait(seq(4, 0), &scopes(&["a", "b"])).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.update(seq(4, 2), "b").await;
        assert_eq!(waiter.await.unwrap(), seq(4, 2));
    }

    #[tokio::test]
    async fn multi_scope_immediate_return_uses_highest() {
        let tracker = ChangeTracker::new();
        tracker.update(seq(3, 0), "a").await;
        tracker.update(seq(7, 0), "b").await;
        let got = tracker.wait(seq(2, 0), &scopes(&["a", "b"])).await;
        assert_eq!(got, seq(7, 0));
    }

    #[tokio::test]
    async fn out_of_order_updates_are_ignored() {
        let tracker = ChangeTracker::new();
        tracker.update(seq(8, 0), "a").await;
        tracker.update(seq(2, 0), "a").await;
        let got = tracker.wait(seq(1, 0), &scopes(&["a"])).await;
        assert_eq!(got, seq(8, 0));
    }

    #[tokio::test]
    async fn timed_wait_returns_zero_sentinel_on_timeout() {
        let tracker = ChangeTracker::new();
        let got = tracker
            .timed_wait(seq(1, 0), Duration::from_millis(30), &scopes(&["a"]))
            .await;
        assert!(got.is_zero());
    }

    #[tokio::test]
    async fn timed_wait_returns_value_when_update_arrives_in_time() {
        let tracker = ChangeTracker::new();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .timed_wait(seq(2, 0), Duration::from_secs(5), &scopes(&["a"]))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.update(seq(2, 0), "a").await;
        assert_eq!(waiter.await.unwrap(), seq(2, 0));
    }

    #[tokio::test]
    async fn timed_out_waiter_never_sees_a_late_wake() {
        let tracker = ChangeTracker::new();
        let got = tracker
            .timed_wait(seq(5, 0), Duration::from_millis(20), &scopes(&["a"]))
            .await;
        assert!(got.is_zero());

        // The waiter is gone: this update must not panic or mis-deliver,
        // and a fresh wait observes it normally.
        tracker.update(seq(5, 0), "a").await;
        let got = tracker.wait(seq(5, 0), &scopes(&["a"])).await;
        assert_eq!(got, seq(5, 0));
    }

    #[tokio::test]
    async fn close_wakes_waiters_with_last_known() {
        let tracker = ChangeTracker::new();
        tracker.update(seq(3, 0), "a").await;
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait(seq(100, 0), &scopes(&["a"])).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tracker.close().await;
        // Below the threshold: the documented give-up-gracefully behavior.
        assert_eq!(waiter.await.unwrap(), seq(3, 0));
    }

    #[tokio::test]
    async fn many_concurrent_waiters() {
        let tracker = ChangeTracker::new();
        let mut handles = Vec::new();
        for i in 0..1000u64 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.wait(seq(i + 1, 0), &scopes(&["load"])).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.update(seq(1000, 0), "load").await;
        for handle in handles {
            assert_eq!(handle.await.unwrap(), seq(1000, 0));
        }
    }

    #[tokio::test]
    async fn waiter_registered_before_update_is_not_missed() {
        // Register and update race through the same command queue; the
        // update processed after the registration must see it.
        let tracker = ChangeTracker::new();
        for round in 1..=50u64 {
            let waiter = {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.wait(seq(round, 0), &scopes(&["r"])).await })
            };
            tracker.update(seq(round, 0), "r").await;
            let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
            assert!(got >= seq(round, 0));
        }
    }
}
