#![allow(dead_code)]

//! A scripted Postgres stand-in for integration tests. It accepts one
//! connection, answers the trust-auth handshake, then hands the framed
//! stream to a per-test script.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub struct MockPg {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl MockPg {
    /// Bind on an ephemeral port and serve exactly one connection: the
    /// startup handshake, then whatever `script` does with the stream.
    pub async fn start<F, Fut>(script: F) -> MockPg
    where
        F: FnOnce(Framed) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed { stream };
            framed.read_startup().await;
            framed.auth_ok().await;
            framed.key_data(4242, 1717).await;
            framed.ready_for_query().await;
            script(framed).await;
        });
        MockPg { addr, handle }
    }

    /// Wait for the script to finish, propagating its panics (failed
    /// assertions on the server side) into the test.
    pub async fn finished(self) {
        self.handle.await.unwrap();
    }
}

/// One framed Postgres stream, server side.
pub struct Framed {
    stream: TcpStream,
}

impl Framed {
    /// Read the untagged startup message, returning its payload.
    pub async fn read_startup(&mut self) -> Vec<u8> {
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).await.unwrap();
        let len = i32::from_be_bytes(len) as usize;
        let mut payload = vec![0u8; len - 4];
        self.stream.read_exact(&mut payload).await.unwrap();
        payload
    }

    /// Read one tagged frame. `None` means the client closed the socket.
    pub async fn read_frame(&mut self) -> Option<(u8, Vec<u8>)> {
        let mut tag = [0u8; 1];
        match self.stream.read_exact(&mut tag).await {
            Ok(_) => {}
            Err(_) => return None,
        }
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).await.unwrap();
        let len = i32::from_be_bytes(len) as usize;
        let mut payload = vec![0u8; len - 4];
        self.stream.read_exact(&mut payload).await.unwrap();
        Some((tag[0], payload))
    }

    /// Read frames until a Query ('Q') arrives, returning its SQL text.
    /// Panics on connection close.
    pub async fn expect_query(&mut self) -> String {
        loop {
            let (tag, payload) = self.read_frame().await.expect("client closed early");
            if tag == b'Q' {
                return query_text(&payload);
            }
        }
    }

    pub async fn send(&mut self, tag: u8, payload: &[u8]) {
        let mut frame = Vec::with_capacity(payload.len() + 5);
        frame.push(tag);
        frame.extend_from_slice(&((payload.len() as i32 + 4).to_be_bytes()));
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn auth_ok(&mut self) {
        self.send(b'R', &0i32.to_be_bytes()).await;
    }

    pub async fn key_data(&mut self, pid: i32, key: i32) {
        let mut payload = Vec::new();
        payload.extend_from_slice(&pid.to_be_bytes());
        payload.extend_from_slice(&key.to_be_bytes());
        self.send(b'K', &payload).await;
    }

    pub async fn ready_for_query(&mut self) {
        self.send(b'Z', b"I").await;
    }

    pub async fn command_complete(&mut self, tag: &str) {
        let mut payload = tag.as_bytes().to_vec();
        payload.push(0);
        self.send(b'C', &payload).await;
    }

    pub async fn error_response(&mut self, code: &str, message: &str) {
        let mut payload = Vec::new();
        for (field, value) in [(b'S', "ERROR"), (b'C', code), (b'M', message)] {
            payload.push(field);
            payload.extend_from_slice(value.as_bytes());
            payload.push(0);
        }
        payload.push(0);
        self.send(b'E', &payload).await;
    }

    /// CopyBothResponse with zero columns, all text format.
    pub async fn copy_both_response(&mut self) {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&0i16.to_be_bytes());
        self.send(b'W', &payload).await;
    }

    pub async fn wal_data(&mut self, start_lsn: u64, end_lsn: u64, data: &[u8]) {
        let mut payload = vec![b'w'];
        payload.extend_from_slice(&start_lsn.to_be_bytes());
        payload.extend_from_slice(&end_lsn.to_be_bytes());
        payload.extend_from_slice(&0i64.to_be_bytes());
        payload.extend_from_slice(data);
        self.send(b'd', &payload).await;
    }

    pub async fn keepalive(&mut self, end_lsn: u64, reply_requested: bool) {
        let mut payload = vec![b'k'];
        payload.extend_from_slice(&end_lsn.to_be_bytes());
        payload.extend_from_slice(&0i64.to_be_bytes());
        payload.push(reply_requested as u8);
        self.send(b'd', &payload).await;
    }
}

/// SQL text of a Query payload (strips the trailing NUL).
pub fn query_text(payload: &[u8]) -> String {
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Decode a StandbyStatusUpdate payload into (written, flushed, applied).
pub fn parse_status_update(payload: &[u8]) -> Option<(u64, u64, u64)> {
    if payload.first() != Some(&b'r') || payload.len() < 34 {
        return None;
    }
    let read_u64 = |at: usize| u64::from_be_bytes(payload[at..at + 8].try_into().unwrap());
    Some((read_u64(1), read_u64(9), read_u64(17)))
}
