//! The Postgres wire protocol: pure message framing in [`codec`], tag and
//! constant definitions in [`types`], and the socket-owning connection in
//! [`connection`].

pub mod codec;
pub mod connection;
pub mod types;

pub use codec::{InputMessage, OutputMessage};
pub use connection::{
    ColumnInfo, ConnectConfig, CopyFormat, ExecuteOutcome, MessageReader, MessageWriter,
    PgConnection, QueryResult,
};
