//! Transport boundary: the core sends and receives opaque byte buffers
//! through a `Transport`, never touching a socket directly. `UdpTransport`
//! wraps `tokio::net::UdpSocket` directly; tests use `MockTransport`, an
//! in-memory channel pair, to drive the listener and RTCP handler
//! deterministically.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    Received(usize),
    Timeout,
    InvalidSocket,
}

/// Trait objects are used so the session can hold one boxed transport per
/// port without a generic parameter; methods return boxed futures (the
/// pre-async-trait idiom) rather than pulling in `async-trait`, since
/// `futures` is already in the dependency tree for this purpose.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<(), CoreError>>;

    fn recv_timeout<'a>(
        &'a self,
        buf: &'a mut [u8],
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RecvOutcome, CoreError>>;

    fn close(&self);
}

pub struct UdpTransport {
    socket: UdpSocket,
    remote: SocketAddr,
    closed: std::sync::atomic::AtomicBool,
}

impl UdpTransport {
    pub async fn bind(local_port: u16, remote: SocketAddr) -> Result<Self, CoreError> {
        let bind_addr = format!("0.0.0.0:{local_port}");
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|_| CoreError::SocketClosed)?;
        Ok(UdpTransport {
            socket,
            remote,
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }
}

impl Transport for UdpTransport {
    fn send<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(CoreError::SocketClosed);
            }
            self.socket
                .send_to(bytes, self.remote)
                .await
                .map(|_| ())
                .map_err(|e| {
                    tracing::warn!("UDP send failed: {}", e);
                    CoreError::SocketClosed
                })
        })
    }

    fn recv_timeout<'a>(
        &'a self,
        buf: &'a mut [u8],
        timeout: Duration,
    ) -> BoxFuture<'a, Result<RecvOutcome, CoreError>> {
        Box::pin(async move {
            if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
                return Ok(RecvOutcome::InvalidSocket);
            }
            match tokio::time::timeout(timeout, self.socket.recv(buf)).await {
                Ok(Ok(n)) => Ok(RecvOutcome::Received(n)),
                Ok(Err(e)) => {
                    tracing::warn!("UDP recv error: {}", e);
                    Ok(RecvOutcome::InvalidSocket)
                }
                Err(_) => Ok(RecvOutcome::Timeout),
            }
        })
    }

    fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

/// In-memory transport for deterministic tests: `outbound` captures every
/// sent datagram, `inbound` is drained by `recv_timeout`.
pub struct MockTransport {
    outbound: Mutex<Vec<Vec<u8>>>,
    inbound: Arc<Mutex<std::collections::VecDeque<Vec<u8>>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            outbound: Mutex::new(Vec::new()),
            inbound: Arc::new(Mutex::new(std::collections::VecDeque::new())),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub async fn push_inbound(&self, datagram: Vec<u8>) {
        self.inbound.lock().await.push_back(datagram);
    }

    pub async fn sent_datagrams(&self) -> Vec<Vec<u8>> {
        self.outbound.lock().await.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn send<'a>(&'a self, bytes: &'a [u8]) -> BoxFuture<'a, Result<(), CoreError>> {
        Box::pin(async move {
            if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
                return Err(CoreError::SocketClosed);
            }
            self.outbound.lock().await.push(bytes.to_vec());
            Ok(())
        })
    }

    fn recv_timeout<'a>(
        &'a self,
        buf: &'a mut [u8],
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<RecvOutcome, CoreError>> {
        Box::pin(async move {
            if self.closed.load(std::sync::atomic::Ordering::Relaxed) {
                return Ok(RecvOutcome::InvalidSocket);
            }
            let mut inbound = self.inbound.lock().await;
            match inbound.pop_front() {
                Some(datagram) => {
                    let n = datagram.len().min(buf.len());
                    buf[..n].copy_from_slice(&datagram[..n]);
                    Ok(RecvOutcome::Received(n))
                }
                None => Ok(RecvOutcome::Timeout),
            }
        })
    }

    fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_transport_roundtrips_a_datagram() {
        let t = MockTransport::new();
        t.push_inbound(vec![1, 2, 3]).await;
        let mut buf = [0u8; 16];
        let outcome = t.recv_timeout(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, RecvOutcome::Received(3));
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn mock_transport_times_out_when_empty() {
        let t = MockTransport::new();
        let mut buf = [0u8; 16];
        let outcome = t.recv_timeout(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, RecvOutcome::Timeout);
    }

    #[tokio::test]
    async fn mock_transport_captures_sends() {
        let t = MockTransport::new();
        t.send(&[9, 9]).await.unwrap();
        assert_eq!(t.sent_datagrams().await, vec![vec![9, 9]]);
    }

    #[tokio::test]
    async fn closed_transport_rejects_send_and_recv() {
        let t = MockTransport::new();
        t.close();
        assert!(t.send(&[1]).await.is_err());
        let mut buf = [0u8; 4];
        let outcome = t.recv_timeout(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(outcome, RecvOutcome::InvalidSocket);
    }
}
