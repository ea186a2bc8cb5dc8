pub mod config;
pub mod envelope;
pub mod error;
pub mod relay;
pub mod sequence;
pub mod server;
pub mod storage;
pub mod tracker;

pub mod pgwire;
pub mod replication;

pub use config::Config;
pub use error::{Error, Result};
pub use relay::Relay;
pub use sequence::{Lsn, Sequence};
