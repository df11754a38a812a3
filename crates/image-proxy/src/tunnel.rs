//! CONNECT tunnel lifecycle and byte plumbing.
//!
//! A tunnel starts `Accepted`, moves to `Handshaking` while the first client
//! bytes are inspected, then either terminates TLS (`Intercepting`) or
//! relays bytes untouched (`PlainTunnel`). Every tunnel ends `Closed` or
//! `ClosedWithError`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{HandshakeError, ProtocolError};

/// First byte of a TLS handshake record.
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

const PEEK_BUFFER_SIZE: usize = 4096;

/// Lifecycle state of a CONNECT tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Accepted,
    Handshaking,
    Intercepting,
    PlainTunnel,
    Closed,
    ClosedWithError,
}

impl TunnelState {
    pub fn name(self) -> &'static str {
        match self {
            TunnelState::Accepted => "Accepted",
            TunnelState::Handshaking => "Handshaking",
            TunnelState::Intercepting => "Intercepting",
            TunnelState::PlainTunnel => "PlainTunnel",
            TunnelState::Closed => "Closed",
            TunnelState::ClosedWithError => "ClosedWithError",
        }
    }

    /// Returns true if a tunnel may move from `self` to `next`.
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;

        matches!(
            (self, next),
            (Accepted, Handshaking)
                | (Accepted, ClosedWithError)
                | (Handshaking, Intercepting)
                | (Handshaking, PlainTunnel)
                | (Handshaking, ClosedWithError)
                | (Intercepting, Closed)
                | (Intercepting, ClosedWithError)
                | (PlainTunnel, Closed)
                | (PlainTunnel, ClosedWithError)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TunnelState::Closed | TunnelState::ClosedWithError)
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Tracks the state of one CONNECT tunnel.
#[derive(Debug)]
pub struct TunnelSession {
    host: String,
    port: u16,
    state: TunnelState,
}

impl TunnelSession {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            state: TunnelState::Accepted,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Moves the tunnel to `next`, rejecting transitions the lifecycle does
    /// not allow.
    pub fn transition(&mut self, next: TunnelState) -> Result<(), ProtocolError> {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                "Rejected tunnel transition {} -> {} for {}:{}",
                self.state,
                next,
                self.host,
                self.port
            );
            return Err(ProtocolError::IllegalTransition {
                from: self.state.name(),
                to: next.name(),
            });
        }

        tracing::debug!(
            "Tunnel {}:{} {} -> {}",
            self.host,
            self.port,
            self.state,
            next
        );
        self.state = next;
        Ok(())
    }

    /// Moves the tunnel to `Closed` or `ClosedWithError`. A session that has
    /// already ended keeps its state and the rejected move is logged.
    pub fn finish(&mut self, failed: bool) -> TunnelState {
        let end = if failed {
            TunnelState::ClosedWithError
        } else {
            TunnelState::Closed
        };
        if let Err(e) = self.transition(end) {
            tracing::debug!("Tunnel {}:{} already ended: {}", self.host, self.port, e);
        }
        self.state
    }
}

/// Returns true if the bytes open a TLS handshake record.
pub fn is_tls_client_hello(prefix: &[u8]) -> bool {
    prefix.first() == Some(&TLS_HANDSHAKE_RECORD)
}

/// Reads whatever the client sends first, waiting at most `wait`.
///
/// The bytes are consumed from `io`; replay them with [`Rewind`]. An empty
/// result means the client closed the tunnel without sending anything.
pub async fn read_prefix<T>(io: &mut T, wait: Duration) -> Result<Bytes, HandshakeError>
where
    T: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(PEEK_BUFFER_SIZE);
    timeout(wait, io.read_buf(&mut buf))
        .await
        .map_err(|_| HandshakeError::Timeout)?
        .map_err(HandshakeError::Peek)?;
    Ok(buf.freeze())
}

/// A stream that yields `prefix` before reading from the inner stream.
#[derive(Debug)]
pub struct Rewind<T> {
    prefix: Option<Bytes>,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(prefix: Bytes, inner: T) -> Self {
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            inner,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.prefix.take() {
            let n = prefix.len().min(buf.remaining());
            buf.put_slice(&prefix[..n]);
            prefix.advance(n);
            if !prefix.is_empty() {
                self.prefix = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Relays bytes between the client and `host:port` until either side
/// closes. `prefix` holds client bytes already consumed and is sent first.
///
/// Returns the byte counts (client to upstream, upstream to client),
/// excluding the prefix.
pub async fn relay<C>(
    client: &mut C,
    prefix: &[u8],
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut upstream = timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out"))??;

    if !prefix.is_empty() {
        upstream.write_all(prefix).await?;
    }

    let counts = copy_bidirectional(client, &mut upstream).await?;
    tracing::debug!(
        "Plain tunnel to {}:{} closed: {} bytes up, {} bytes down",
        host,
        port,
        counts.0,
        counts.1
    );
    Ok(counts)
}
