//! A long-lived logical-replication session against one named slot.
//!
//! The session owns a dedicated connection opened with
//! `replication=database`. After the `START_REPLICATION` handshake it
//! splits the connection and runs two loops: a read loop, the only reader
//! of the socket, which turns WAL frames into [`WalChange`] values on a
//! bounded channel; and an acknowledge loop which sends standby status
//! updates for the high-water LSN the consumer has durably applied.
//!
//! The output channel is bounded on purpose: a slow consumer blocks the
//! read loop, which the server sees as TCP backpressure. Replication
//! stalls instead of buffering without limit.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pgwire::codec::OutputMessage;
use crate::pgwire::connection::{parse_error_response, MessageReader, MessageWriter, PgConnection};
use crate::pgwire::types::{BackendTag, FrontendTag};
use crate::pgwire::ConnectConfig;
use crate::replication::messages::{
    parse_replication_frame, pg_epoch_micros_now, standby_status_update, ReplicationFrame,
};

/// Capacity of the change channel; when it is full the read loop blocks.
const CHANGE_BUFFER: usize = 100;

/// How often pending acknowledgements are flushed to the server.
const ACK_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// One decoded replication record. `lsn` marks the end of the WAL record;
/// `data` is the output plugin's payload, opaque at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalChange {
    pub lsn: u64,
    pub data: Bytes,
}

enum SessionCommand {
    /// Flush the current high-water LSN to the server immediately.
    AckNow,
    /// Shut the session down.
    Stop,
}

/// A running replication session. Consumers drain [`ReplicationSession::changes`]
/// until they see an `Err`, after which nothing further arrives.
pub struct ReplicationSession {
    changes_rx: mpsc::Receiver<Result<WalChange>>,
    ack_tx: watch::Sender<u64>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    stopped_rx: Option<oneshot::Receiver<()>>,
    read_handle: Option<JoinHandle<()>>,
}

impl ReplicationSession {
    /// Connect to the server and start streaming from `slot`, creating the
    /// slot with `plugin` if it does not exist yet.
    pub async fn start(
        config: &ConnectConfig,
        slot: &str,
        plugin: &str,
    ) -> Result<ReplicationSession> {
        let config = config.clone().replication_database();
        let conn = PgConnection::connect(&config).await?;
        ReplicationSession::start_on(conn, slot, plugin).await
    }

    /// Start streaming over an already-handshaked connection. Public so
    /// tests can run the session against in-memory or loopback servers.
    pub async fn start_on<S>(
        mut conn: PgConnection<S>,
        slot: &str,
        plugin: &str,
    ) -> Result<ReplicationSession>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let start_sql = format!("START_REPLICATION SLOT {slot} LOGICAL 0/0");
        let mut start_msg = OutputMessage::new(FrontendTag::Query);
        start_msg.write_str(&start_sql);
        conn.write_message(&start_msg).await?;

        // Read until CopyBothResponse. The first error is assumed to mean
        // the slot does not exist: create it and retry exactly once.
        let mut slot_created = false;
        loop {
            let mut msg = conn.read_message().await?;
            match BackendTag::from(msg.tag()) {
                BackendTag::CopyBothResponse => {
                    // Column-format preamble; the output plugin fixes the
                    // format, so nothing here is kept.
                    let _overall = msg.read_byte()?;
                    let columns = msg.read_i16()?;
                    for _ in 0..columns {
                        let _ = msg.read_i16()?;
                    }
                    break;
                }
                BackendTag::ErrorResponse => {
                    let server_err = parse_error_response(&mut msg)?;
                    if slot_created {
                        return Err(Error::Server(server_err));
                    }
                    debug!(
                        slot,
                        "START_REPLICATION failed ({}), creating slot", server_err.message
                    );
                    consume_till_ready(&mut conn).await?;
                    conn.simple_query(&format!(
                        "CREATE_REPLICATION_SLOT {slot} LOGICAL {plugin}"
                    ))
                    .await?;
                    slot_created = true;
                    conn.write_message(&start_msg).await?;
                }
                BackendTag::NoticeResponse => {
                    if let Ok(notice) = parse_error_response(&mut msg) {
                        info!("notice from server: {}", notice.message);
                    }
                }
                other => {
                    return Err(Error::Replication(format!(
                        "unexpected message while starting replication: {other:?}"
                    )));
                }
            }
        }
        info!(slot, "replication streaming started");

        let (reader, writer) = conn.into_split();
        let (changes_tx, changes_rx) = mpsc::channel(CHANGE_BUFFER);
        let (ack_tx, ack_rx) = watch::channel(0u64);
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (stopped_tx, stopped_rx) = oneshot::channel();

        let read_handle = tokio::spawn(read_loop(reader, changes_tx, cmd_tx.clone()));
        tokio::spawn(ack_loop(writer, ack_rx, cmd_rx, stopped_tx));

        Ok(ReplicationSession {
            changes_rx,
            ack_tx,
            cmd_tx,
            stopped_rx: Some(stopped_rx),
            read_handle: Some(read_handle),
        })
    }

    /// The stream of changes, in exactly the order the server sent them.
    /// After an `Err` is received the stream is dead.
    pub fn changes(&mut self) -> &mut mpsc::Receiver<Result<WalChange>> {
        &mut self.changes_rx
    }

    /// Record that everything up to and including `lsn` has been durably
    /// applied downstream. Never blocks; calls coalesce, only the highest
    /// value is eventually sent, and the value sent to the server never
    /// decreases.
    pub fn acknowledge(&self, lsn: u64) {
        self.ack_tx.send_modify(|current| {
            if lsn > *current {
                *current = lsn;
            }
        });
    }

    /// Shut down, blocking until the connection has been closed. Calling
    /// twice returns immediately the second time.
    pub async fn stop(&mut self) {
        let _ = self.cmd_tx.send(SessionCommand::Stop).await;
        if let Some(stopped) = self.stopped_rx.take() {
            let _ = stopped.await;
        }
        if let Some(handle) = self.read_handle.take() {
            // The read half may still be blocked on the socket.
            handle.abort();
        }
    }
}

async fn consume_till_ready<S: AsyncRead + AsyncWrite + Unpin>(
    conn: &mut PgConnection<S>,
) -> Result<()> {
    loop {
        let msg = conn.read_message().await?;
        if BackendTag::from(msg.tag()) == BackendTag::ReadyForQuery {
            return Ok(());
        }
    }
}

/// The read loop: sole reader of the socket once streaming starts. Ends
/// after delivering a terminal `Err`, or when the consumer goes away.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: MessageReader<R>,
    changes_tx: mpsc::Sender<Result<WalChange>>,
    cmd_tx: mpsc::Sender<SessionCommand>,
) {
    loop {
        let mut msg = match reader.read_message().await {
            Ok(msg) => msg,
            Err(err) => {
                warn!("error reading from server: {err}");
                let _ = changes_tx.send(Err(err)).await;
                let _ = cmd_tx.send(SessionCommand::Stop).await;
                return;
            }
        };

        match BackendTag::from(msg.tag()) {
            BackendTag::CopyData => match parse_replication_frame(&mut msg) {
                Ok(ReplicationFrame::WalData { end_lsn, data, .. }) => {
                    let change = WalChange { lsn: end_lsn, data };
                    if changes_tx.send(Ok(change)).await.is_err() {
                        // Consumer dropped the channel; nothing left to do.
                        return;
                    }
                }
                Ok(ReplicationFrame::Keepalive {
                    reply_requested, ..
                }) => {
                    debug!(reply_requested, "keepalive from server");
                    if reply_requested {
                        let _ = cmd_tx.send(SessionCommand::AckNow).await;
                    }
                }
                Err(err) => {
                    warn!("invalid CopyData frame: {err}");
                }
            },
            BackendTag::ErrorResponse => {
                let err = match parse_error_response(&mut msg) {
                    Ok(server_err) => Error::Server(server_err),
                    Err(err) => err,
                };
                warn!("server ended replication: {err}");
                let _ = changes_tx.send(Err(err)).await;
                let _ = cmd_tx.send(SessionCommand::Stop).await;
                return;
            }
            BackendTag::NoticeResponse => {
                if let Ok(notice) = parse_error_response(&mut msg) {
                    info!("notice from server: {}", notice.message);
                }
            }
            other => {
                debug!("ignoring message during replication: {other:?}");
            }
        }
    }
}

/// The acknowledge loop: flushes the high-water LSN on a timer, on demand
/// when the server requests a reply, and once more on shutdown.
async fn ack_loop<W: AsyncWrite + Unpin>(
    mut writer: MessageWriter<W>,
    ack_rx: watch::Receiver<u64>,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    stopped_tx: oneshot::Sender<()>,
) {
    let mut last_sent = 0u64;
    let mut flush = interval(ACK_FLUSH_INTERVAL);
    flush.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = flush.tick() => {
                send_status(&mut writer, &ack_rx, &mut last_sent, false).await;
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::AckNow) => {
                    // The server asked explicitly; answer even when nothing
                    // new has been acknowledged, or it will treat the
                    // standby as dead and drop the connection.
                    send_status(&mut writer, &ack_rx, &mut last_sent, true).await;
                }
                Some(SessionCommand::Stop) | None => {
                    // Final flush bounds the replay distance on restart.
                    send_status(&mut writer, &ack_rx, &mut last_sent, false).await;
                    writer.close().await;
                    let _ = stopped_tx.send(());
                    return;
                }
            }
        }
    }
}

/// Write a StandbyStatusUpdate for the current high-water LSN. The timer
/// path skips when nothing new has been acknowledged; `force` resends the
/// current value anyway, which keeps the reported position monotone.
async fn send_status<W: AsyncWrite + Unpin>(
    writer: &mut MessageWriter<W>,
    ack_rx: &watch::Receiver<u64>,
    last_sent: &mut u64,
    force: bool,
) {
    let target = *ack_rx.borrow();
    if !force && target <= *last_sent {
        return;
    }
    debug!(lsn = target, "sending standby status update");
    let msg = standby_status_update(target, pg_epoch_micros_now());
    match writer.write_message(&msg).await {
        Ok(()) => *last_sent = target,
        Err(err) => {
            // The read loop will observe the dead socket and end the stream.
            debug!("error sending status update: {err}");
        }
    }
}
