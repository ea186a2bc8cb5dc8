//! A connection to Postgres speaking the version 3 wire protocol.
//!
//! [`PgConnection`] owns exactly one stream. The protocol state machine
//! (Ready, then one of the simple-query / extended-query / COPY sub-modes,
//! then Ready again) is enforced by ownership: every operation takes
//! `&mut self` and internally drains back to ReadyForQuery before it
//! returns, so only one exchange can be in flight at a time. Entering
//! continuous streaming consumes the connection via [`PgConnection::into_split`]
//! and it can never return to query mode.
//!
//! Failure semantics: socket I/O and framing errors are fatal to the
//! connection and are never retried here. Server-reported errors during a
//! query are captured, the exchange is drained to ReadyForQuery as the
//! protocol requires, and the error is returned with the connection still
//! usable.

use bytes::Bytes;
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{Error, Result, ServerError};
use crate::pgwire::codec::{InputMessage, OutputMessage};
use crate::pgwire::types::{BackendTag, FrontendTag, AUTH_OK, PROTOCOL_VERSION};

/// Parameters for opening a connection.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    /// Extra key/value pairs for the startup message.
    pub options: Vec<(String, String)>,
}

impl ConnectConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> ConnectConfig {
        ConnectConfig {
            host: host.into(),
            port,
            user: user.into(),
            database: database.into(),
            options: Vec::new(),
        }
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> ConnectConfig {
        self.options.push((key.into(), value.into()));
        self
    }

    /// Request a logical-replication connection.
    pub fn replication_database(self) -> ConnectConfig {
        self.option("replication", "database")
    }
}

/// Metadata for one column of a query result.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    /// Postgres type OID.
    pub type_oid: i32,
    /// Whether the server sent this column in binary format.
    pub binary: bool,
}

/// The result of a simple query. A `None` field value is SQL NULL.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<Option<String>>>,
}

/// The result of one Execute in the extended protocol.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOutcome {
    pub rows: Vec<Vec<Option<String>>>,
    /// True when the server returned PortalSuspended: more rows remain and
    /// the caller must Execute again or Sync to abandon the portal.
    pub suspended: bool,
}

/// Output format for COPY TO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFormat {
    Text,
    Csv,
    Binary,
}

pub struct PgConnection<S> {
    stream: S,
    backend_pid: i32,
    backend_key: i32,
}

impl PgConnection<TcpStream> {
    /// Open a TCP connection and run the startup/authentication handshake.
    /// Only "trust" authentication (auth code 0) is supported.
    pub async fn connect(config: &ConnectConfig) -> Result<PgConnection<TcpStream>> {
        debug!(host = %config.host, port = config.port, "connecting to Postgres");
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        stream.set_nodelay(true)?;
        PgConnection::handshake(stream, config).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PgConnection<S> {
    /// Run the startup handshake over an already-open stream. Split out of
    /// [`PgConnection::connect`] so tests can drive the protocol over
    /// in-memory streams.
    pub async fn handshake(stream: S, config: &ConnectConfig) -> Result<PgConnection<S>> {
        let mut conn = PgConnection {
            stream,
            backend_pid: 0,
            backend_key: 0,
        };
        conn.send_startup(config).await?;
        conn.authenticate().await?;
        conn.finish_connect().await?;
        debug!(pid = conn.backend_pid, "connection ready");
        Ok(conn)
    }

    async fn send_startup(&mut self, config: &ConnectConfig) -> Result<()> {
        let mut startup = OutputMessage::startup();
        startup.write_i32(PROTOCOL_VERSION);
        startup.write_str("user");
        startup.write_str(&config.user);
        startup.write_str("database");
        startup.write_str(&config.database);
        for (key, value) in &config.options {
            startup.write_str(key);
            startup.write_str(value);
        }
        startup.write_str("");
        self.write_message(&startup).await
    }

    async fn authenticate(&mut self) -> Result<()> {
        loop {
            let mut msg = self.read_message().await?;
            match BackendTag::from(msg.tag()) {
                BackendTag::Authentication => {
                    let code = msg.read_i32()?;
                    if code == AUTH_OK {
                        return Ok(());
                    }
                    return Err(Error::UnsupportedAuth(code));
                }
                BackendTag::ErrorResponse => {
                    return Err(Error::Server(parse_error_response(&mut msg)?));
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during authentication: {other:?}"
                    )));
                }
            }
        }
    }

    /// Drain ParameterStatus / BackendKeyData / NoticeResponse chatter
    /// until the server says ReadyForQuery.
    async fn finish_connect(&mut self) -> Result<()> {
        loop {
            let mut msg = self.read_standard_message().await?;
            match BackendTag::from(msg.tag()) {
                BackendTag::BackendKeyData => {
                    self.backend_pid = msg.read_i32()?;
                    self.backend_key = msg.read_i32()?;
                }
                BackendTag::ReadyForQuery => return Ok(()),
                BackendTag::ErrorResponse => {
                    return Err(Error::Server(parse_error_response(&mut msg)?));
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message while finishing connect: {other:?}"
                    )));
                }
            }
        }
    }

    /// Send one message without waiting for anything to come back.
    pub async fn write_message(&mut self, msg: &OutputMessage) -> Result<()> {
        let buf = msg.encode();
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read exactly one framed message, blocking.
    pub async fn read_message(&mut self) -> Result<InputMessage> {
        read_frame(&mut self.stream).await
    }

    /// Read a message, logging and discarding the asynchronous chatter
    /// (NoticeResponse, ParameterStatus) the server may emit at any time.
    async fn read_standard_message(&mut self) -> Result<InputMessage> {
        loop {
            let mut msg = self.read_message().await?;
            match BackendTag::from(msg.tag()) {
                BackendTag::NoticeResponse => {
                    if let Ok(err) = parse_error_response(&mut msg) {
                        info!("notice from server: {}", err.message);
                    }
                }
                BackendTag::ParameterStatus => {
                    let name = msg.read_str().unwrap_or_default();
                    let value = msg.read_str().unwrap_or_default();
                    debug!("parameter status: {name}={value}");
                }
                _ => return Ok(msg),
            }
        }
    }

    /// Execute a query with the simple-query protocol and collect its rows.
    pub async fn simple_query(&mut self, sql: &str) -> Result<QueryResult> {
        let (result, _) = self.exec(sql).await?;
        Ok(result)
    }

    /// Execute a statement with the simple-query protocol and return the
    /// affected-row count from CommandComplete.
    pub async fn simple_exec(&mut self, sql: &str) -> Result<u64> {
        let (_, count) = self.exec(sql).await?;
        Ok(count)
    }

    async fn exec(&mut self, sql: &str) -> Result<(QueryResult, u64)> {
        debug!(sql, "simple query");
        let mut query = OutputMessage::new(FrontendTag::Query);
        query.write_str(sql);
        self.write_message(&query).await?;

        let mut result = QueryResult::default();
        let mut row_count = 0u64;
        let mut cmd_err: Option<Error> = None;

        // The protocol requires draining to ReadyForQuery even on error.
        loop {
            let mut msg = self.read_standard_message().await?;
            match BackendTag::from(msg.tag()) {
                BackendTag::CommandComplete => {
                    row_count = parse_command_complete(&mut msg)?;
                }
                BackendTag::RowDescription => {
                    result.columns = parse_row_description(&mut msg)?;
                }
                BackendTag::DataRow => {
                    result.rows.push(parse_data_row(&mut msg)?);
                }
                BackendTag::EmptyQueryResponse => {}
                BackendTag::ReadyForQuery => {
                    return match cmd_err {
                        Some(err) => Err(err),
                        None => Ok((result, row_count)),
                    };
                }
                BackendTag::ErrorResponse => {
                    cmd_err = Some(Error::Server(parse_error_response(&mut msg)?));
                }
                BackendTag::CopyInResponse | BackendTag::CopyOutResponse => {
                    cmd_err = Some(Error::Protocol(
                        "COPY is not supported through simple_query".to_string(),
                    ));
                }
                other => {
                    cmd_err = Some(Error::Protocol(format!(
                        "unexpected message in query response: {other:?}"
                    )));
                }
            }
        }
    }

    /// Parse a statement under the given name (extended protocol). On a
    /// server error the exchange is synced back to ReadyForQuery before the
    /// error is returned.
    pub async fn prepare(&mut self, name: &str, sql: &str) -> Result<()> {
        let mut parse = OutputMessage::new(FrontendTag::Parse);
        parse.write_str(name);
        parse.write_str(sql);
        parse.write_i16(0); // no pre-specified parameter types
        self.write_message(&parse).await?;
        self.flush_and_expect(BackendTag::ParseComplete).await
    }

    /// Bind a prepared statement to a portal. All parameters are sent in
    /// text format; result format is left to the server.
    pub async fn bind(
        &mut self,
        portal: &str,
        statement: &str,
        params: &[Option<String>],
    ) -> Result<()> {
        let mut bind = OutputMessage::new(FrontendTag::Bind);
        bind.write_str(portal);
        bind.write_str(statement);
        bind.write_i16(0); // zero parameter-format codes: all text
        bind.write_i16(params.len() as i16);
        for param in params {
            match param {
                None => bind.write_i32(-1),
                Some(value) => {
                    bind.write_i32(value.len() as i32);
                    bind.write_bytes(value.as_bytes());
                }
            }
        }
        bind.write_i16(0); // zero result-format codes
        self.write_message(&bind).await?;
        self.flush_and_expect(BackendTag::BindComplete).await
    }

    /// Run a bound portal, fetching at most `max_rows` rows (0 for all).
    /// A suspended outcome means the caller must Execute again to continue
    /// or Sync to abandon.
    pub async fn execute(&mut self, portal: &str, max_rows: i32) -> Result<ExecuteOutcome> {
        let mut execute = OutputMessage::new(FrontendTag::Execute);
        execute.write_str(portal);
        execute.write_i32(max_rows);
        self.write_message(&execute).await?;
        self.write_message(&OutputMessage::new(FrontendTag::Flush))
            .await?;

        let mut outcome = ExecuteOutcome::default();
        loop {
            let mut msg = self.read_standard_message().await?;
            match BackendTag::from(msg.tag()) {
                BackendTag::DataRow => outcome.rows.push(parse_data_row(&mut msg)?),
                BackendTag::CommandComplete | BackendTag::EmptyQueryResponse => {
                    return Ok(outcome)
                }
                BackendTag::PortalSuspended => {
                    outcome.suspended = true;
                    return Ok(outcome);
                }
                BackendTag::ErrorResponse => {
                    let err = Error::Server(parse_error_response(&mut msg)?);
                    self.sync().await?;
                    return Err(err);
                }
                other => {
                    let err = Error::Protocol(format!(
                        "unexpected message during execute: {other:?}"
                    ));
                    self.sync().await?;
                    return Err(err);
                }
            }
        }
    }

    /// Close out an extended-protocol exchange, draining to ReadyForQuery.
    /// Must be issued after Parse even on the error path.
    pub async fn sync(&mut self) -> Result<()> {
        self.write_message(&OutputMessage::new(FrontendTag::Sync))
            .await?;
        let mut cmd_err: Option<Error> = None;
        loop {
            let mut msg = self.read_standard_message().await?;
            match BackendTag::from(msg.tag()) {
                BackendTag::ReadyForQuery => {
                    return match cmd_err {
                        Some(err) => Err(err),
                        None => Ok(()),
                    };
                }
                BackendTag::ErrorResponse => {
                    cmd_err = Some(Error::Server(parse_error_response(&mut msg)?));
                }
                // CloseComplete and friends arrive here when a Sync follows
                // portal cleanup; they carry nothing we need.
                _ => {}
            }
        }
    }

    async fn flush_and_expect(&mut self, want: BackendTag) -> Result<()> {
        self.write_message(&OutputMessage::new(FrontendTag::Flush))
            .await?;
        let mut msg = self.read_standard_message().await?;
        let tag = BackendTag::from(msg.tag());
        if tag == want {
            return Ok(());
        }
        if tag == BackendTag::ErrorResponse {
            let err = Error::Server(parse_error_response(&mut msg)?);
            // The server ignores everything until Sync after an error.
            self.sync().await?;
            return Err(err);
        }
        Err(Error::Protocol(format!(
            "expected {want:?}, server sent {tag:?}"
        )))
    }

    /// Stream the output of `COPY (query) TO STDOUT` into `sink`, returning
    /// the number of payload bytes written. A server error mid-stream
    /// aborts the copy and is returned.
    pub async fn copy_to<W: AsyncWrite + Unpin>(
        &mut self,
        sink: &mut W,
        query: &str,
        format: CopyFormat,
    ) -> Result<u64> {
        // The server rejects "WITH text", so plain text omits the clause.
        let cmd = match format {
            CopyFormat::Text => format!("COPY ({query}) TO STDOUT"),
            CopyFormat::Csv => format!("COPY ({query}) TO STDOUT WITH csv"),
            CopyFormat::Binary => format!("COPY ({query}) TO STDOUT WITH binary"),
        };
        debug!(cmd, "starting copy");
        let mut copy = OutputMessage::new(FrontendTag::Query);
        copy.write_str(&cmd);
        self.write_message(&copy).await?;

        let mut written = 0u64;
        loop {
            let mut msg = self.read_standard_message().await?;
            match BackendTag::from(msg.tag()) {
                BackendTag::CopyOutResponse => {
                    // Format preamble; nothing to keep.
                    let overall = msg.read_byte()?;
                    debug!(format = overall, "copy out started");
                }
                BackendTag::CopyData => {
                    let payload = msg.read_remaining();
                    sink.write_all(&payload).await?;
                    written += payload.len() as u64;
                }
                BackendTag::CopyDone | BackendTag::CommandComplete => {}
                BackendTag::ReadyForQuery => return Ok(written),
                BackendTag::ErrorResponse => {
                    return Err(Error::Server(parse_error_response(&mut msg)?));
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during copy: {other:?}"
                    )));
                }
            }
        }
    }

    /// Best-effort Terminate, then drop the socket. Never waits for a
    /// response.
    pub async fn close(mut self) {
        let terminate = OutputMessage::new(FrontendTag::Terminate);
        if let Err(err) = self.write_message(&terminate).await {
            debug!("error sending Terminate: {err}");
        }
        let _ = self.stream.shutdown().await;
    }

    /// Split into independent read/write halves for continuous streaming
    /// (CopyBoth). The connection can never return to query mode.
    pub fn into_split(self) -> (MessageReader<ReadHalf<S>>, MessageWriter<WriteHalf<S>>) {
        let (read_half, write_half) = split(self.stream);
        (
            MessageReader { stream: read_half },
            MessageWriter { stream: write_half },
        )
    }
}

/// The read half of a streaming connection. The sole reader of the socket
/// once replication starts.
pub struct MessageReader<R> {
    stream: R,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub async fn read_message(&mut self) -> Result<InputMessage> {
        read_frame(&mut self.stream).await
    }
}

/// The write half of a streaming connection.
pub struct MessageWriter<W> {
    stream: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub async fn write_message(&mut self, msg: &OutputMessage) -> Result<()> {
        let buf = msg.encode();
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Best-effort Terminate and socket shutdown.
    pub async fn close(mut self) {
        let terminate = OutputMessage::new(FrontendTag::Terminate);
        if let Err(err) = self.write_message(&terminate).await {
            debug!("error sending Terminate: {err}");
        }
        let _ = self.stream.shutdown().await;
    }
}

/// Read one framed message: tag byte, big-endian length (which includes
/// itself but not the tag), payload. A declared length below 4 or a stream
/// that ends mid-frame is a fatal framing error.
async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<InputMessage> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let tag = header[0];
    let len = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len < 4 {
        return Err(Error::Framing(format!("invalid message length {len}")));
    }
    let mut payload = vec![0u8; len as usize - 4];
    stream.read_exact(&mut payload).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Framing(format!(
                "stream ended inside a frame of declared length {len}"
            ))
        } else {
            Error::Io(err)
        }
    })?;
    Ok(InputMessage::new(tag, Bytes::from(payload)))
}

/// Decode the field list of an ErrorResponse or NoticeResponse.
pub fn parse_error_response(msg: &mut InputMessage) -> Result<ServerError> {
    let mut err = ServerError {
        severity: String::new(),
        code: String::new(),
        message: String::new(),
    };
    loop {
        let field = msg.read_byte()?;
        if field == 0 {
            return Ok(err);
        }
        let value = msg.read_str()?;
        match field {
            b'S' => err.severity = value,
            b'C' => err.code = value,
            b'M' => err.message = value,
            _ => {} // detail, hint, position... not kept
        }
    }
}

fn parse_row_description(msg: &mut InputMessage) -> Result<Vec<ColumnInfo>> {
    let field_count = msg.read_i16()?;
    let mut columns = Vec::with_capacity(field_count.max(0) as usize);
    for _ in 0..field_count {
        let name = msg.read_str()?;
        let _table_oid = msg.read_i32()?;
        let _column_attr = msg.read_i16()?;
        let type_oid = msg.read_i32()?;
        let _type_len = msg.read_i16()?;
        let _type_mod = msg.read_i32()?;
        let format = msg.read_i16()?;
        columns.push(ColumnInfo {
            name,
            type_oid,
            binary: format == 1,
        });
    }
    Ok(columns)
}

fn parse_data_row(msg: &mut InputMessage) -> Result<Vec<Option<String>>> {
    let field_count = msg.read_i16()?;
    let mut row = Vec::with_capacity(field_count.max(0) as usize);
    for _ in 0..field_count {
        let len = msg.read_i32()?;
        if len < 0 {
            row.push(None); // SQL NULL
        } else {
            let value = msg.read_bytes(len as usize)?;
            row.push(Some(String::from_utf8_lossy(&value).into_owned()));
        }
    }
    Ok(row)
}

/// Pull the affected-row count out of a CommandComplete tag like
/// "INSERT 0 42" or "SELECT 3".
fn parse_command_complete(msg: &mut InputMessage) -> Result<u64> {
    let tag = msg.read_str()?;
    let count = tag
        .rsplit(' ')
        .next()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);
    if count == 0 && !tag.is_empty() {
        debug!("command complete: {tag}");
    }
    Ok(count)
}
