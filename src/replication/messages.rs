//! The CopyData sub-protocol used during logical replication streaming:
//! WAL data and keepalive frames from the server, standby status updates
//! back to it.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::pgwire::codec::{InputMessage, OutputMessage};
use crate::pgwire::types::{FrontendTag, SENDER_KEEPALIVE, STANDBY_STATUS_UPDATE, WAL_DATA};

/// One frame received inside a CopyData message while streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    /// A decoded change from the output plugin.
    WalData {
        /// WAL position where this record starts.
        start_lsn: u64,
        /// WAL position just past the end of this record.
        end_lsn: u64,
        /// Server clock, microseconds since 2000-01-01 UTC.
        server_time: i64,
        /// Opaque output-plugin payload.
        data: Bytes,
    },
    /// Server heartbeat.
    Keepalive {
        end_lsn: u64,
        server_time: i64,
        /// The server wants a StandbyStatusUpdate as soon as possible.
        reply_requested: bool,
    },
}

/// Parse the payload of a CopyData message received during streaming.
pub fn parse_replication_frame(msg: &mut InputMessage) -> Result<ReplicationFrame> {
    let kind = msg.read_byte()?;
    match kind {
        WAL_DATA => {
            let start_lsn = msg.read_u64()?;
            let end_lsn = msg.read_u64()?;
            let server_time = msg.read_i64()?;
            let data = msg.read_remaining();
            Ok(ReplicationFrame::WalData {
                start_lsn,
                end_lsn,
                server_time,
                data,
            })
        }
        SENDER_KEEPALIVE => {
            let end_lsn = msg.read_u64()?;
            let server_time = msg.read_i64()?;
            let reply_requested = msg.read_byte()? != 0;
            Ok(ReplicationFrame::Keepalive {
                end_lsn,
                server_time,
                reply_requested,
            })
        }
        other => Err(Error::Protocol(format!(
            "unknown replication frame kind 0x{other:02x}"
        ))),
    }
}

/// Build the CopyData message for a StandbyStatusUpdate. Written, flushed
/// and applied positions are all reported as `lsn`; this client does not
/// track them independently.
pub fn standby_status_update(lsn: u64, client_time: i64) -> OutputMessage {
    let mut msg = OutputMessage::new(FrontendTag::CopyData);
    msg.write_byte(STANDBY_STATUS_UPDATE);
    msg.write_u64(lsn); // written
    msg.write_u64(lsn); // flushed
    msg.write_u64(lsn); // applied
    msg.write_i64(client_time);
    msg.write_byte(0); // no reply requested
    msg
}

/// Microseconds between the Unix epoch and the Postgres epoch
/// (2000-01-01T00:00:00Z).
const PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// The current time expressed as the replication protocol expects:
/// microseconds since the Postgres epoch.
pub fn pg_epoch_micros_now() -> i64 {
    chrono::Utc::now().timestamp_micros() - PG_EPOCH_MICROS
}
