//! Logical replication: the CopyData sub-protocol in [`messages`] and the
//! streaming session state machine in [`session`].

pub mod messages;
pub mod session;

pub use messages::ReplicationFrame;
pub use session::{ReplicationSession, WalChange};
