//! TCP transport to a remote shell.
//!
//! The transport moves bytes and nothing else: it never looks at what it
//! carries. Every read is bounded by a caller-supplied deadline, and
//! [`Transport::close`] may be called from any task, any number of times.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Endpoint;

/// Buffer size for reading from the socket.
const READ_BUFFER_SIZE: usize = 4096;

/// Upper bound on the write-side shutdown during close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors that can occur during transport operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connect attempt did not finish before the deadline.
    #[error("connection to {endpoint} timed out after {timeout_ms}ms")]
    ConnectTimeout { endpoint: Endpoint, timeout_ms: u64 },

    /// The connect attempt failed (refused, unreachable, unresolvable).
    #[error("connection to {endpoint} refused: {reason}")]
    ConnectRefused { endpoint: Endpoint, reason: String },

    /// The stream is no longer usable.
    #[error("transport closed")]
    TransportClosed,
}

/// Read side of the stream with its buffer.
struct ReadSide {
    stream: OwnedReadHalf,
    buffer: Box<[u8]>,
}

/// A connected byte stream to one endpoint.
pub struct Transport {
    endpoint: Endpoint,

    /// Taken on close; `None` afterwards.
    reader: Mutex<Option<ReadSide>>,

    /// Taken on close; `None` afterwards.
    writer: Mutex<Option<OwnedWriteHalf>>,

    /// Set exactly once by the first close.
    closed: AtomicBool,

    /// Interrupts pending reads and writes on close.
    shutdown: CancellationToken,
}

impl Transport {
    /// Connect to `endpoint`, giving up after `timeout`.
    ///
    /// On timeout the connect future is dropped, which releases the
    /// half-open socket.
    pub async fn open(endpoint: &Endpoint, timeout: Duration) -> Result<Self, TransportError> {
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));

        let stream = match tokio::time::timeout(timeout, connect).await {
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    endpoint: endpoint.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            Ok(Err(e)) => {
                return Err(TransportError::ConnectRefused {
                    endpoint: endpoint.clone(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(stream)) => stream,
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(endpoint = %endpoint, "Failed to set TCP_NODELAY: {}", e);
        }

        let (read_half, write_half) = stream.into_split();

        tracing::debug!(endpoint = %endpoint, "Transport connected");

        Ok(Self {
            endpoint: endpoint.clone(),
            reader: Mutex::new(Some(ReadSide {
                stream: read_half,
                buffer: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            })),
            writer: Mutex::new(Some(write_half)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// The endpoint this transport is connected to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write all of `bytes` and flush.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::TransportClosed);
        }

        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = self.shutdown.cancelled() => return Err(TransportError::TransportClosed),
        };
        let writer = guard.as_mut().ok_or(TransportError::TransportClosed)?;

        let write = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        };

        tokio::select! {
            result = write => result.map_err(|e| {
                tracing::debug!(endpoint = %self.endpoint, "Write failed: {}", e);
                TransportError::TransportClosed
            }),
            _ = self.shutdown.cancelled() => Err(TransportError::TransportClosed),
        }
    }

    /// Read whatever arrives within `timeout`.
    ///
    /// Returns an empty vector if nothing arrived in time. A zero timeout
    /// returns data that is already buffered without waiting. Peer EOF,
    /// read errors and a local close all yield `TransportClosed`.
    pub async fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::TransportClosed);
        }

        let read = async {
            let mut guard = self.reader.lock().await;
            let side = guard.as_mut().ok_or(TransportError::TransportClosed)?;
            match side.stream.read(&mut side.buffer).await {
                Ok(0) => {
                    tracing::debug!(endpoint = %self.endpoint, "Peer closed the connection");
                    Err(TransportError::TransportClosed)
                }
                Ok(n) => Ok(side.buffer[..n].to_vec()),
                Err(e) => {
                    tracing::debug!(endpoint = %self.endpoint, "Read failed: {}", e);
                    Err(TransportError::TransportClosed)
                }
            }
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(TransportError::TransportClosed),
            result = tokio::time::timeout(timeout, read) => result.unwrap_or(Ok(Vec::new())),
        }
    }

    /// Release the stream.
    ///
    /// Idempotent and safe under concurrent calls: only the first call
    /// releases anything, and it returns `true`; later calls return `false`.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shutdown.cancel();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown())
                .await
                .is_err()
            {
                tracing::debug!(endpoint = %self.endpoint, "Write shutdown timed out");
            }
        }
        drop(self.reader.lock().await.take());

        tracing::debug!(endpoint = %self.endpoint, "Transport closed");
        true
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Endpoint::new("127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_open_send_receive() {
        let (listener, endpoint) = listener().await;

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping\n");
            socket.write_all(b"pong\n").await.unwrap();
            socket
        });

        let transport = Transport::open(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(transport.endpoint(), &endpoint);

        transport.send(b"ping\n").await.unwrap();
        let data = transport.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(data, b"pong\n".to_vec());

        let _socket = server.await.unwrap();
        transport.close().await;
    }

    #[tokio::test]
    async fn test_receive_timeout_returns_empty() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let transport = Transport::open(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();
        let _socket = server.await.unwrap();

        let start = Instant::now();
        let data = transport.receive(Duration::from_millis(50)).await.unwrap();
        assert!(data.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(45));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_receive_after_peer_close() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let transport = Transport::open(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();
        server.await.unwrap();

        let result = transport.receive(Duration::from_secs(1)).await;
        assert_eq!(result, Err(TransportError::TransportClosed));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, endpoint) = listener().await;
        drop(listener);

        let result = Transport::open(&endpoint, Duration::from_secs(1)).await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectRefused { .. })
        ));
    }

    #[tokio::test]
    #[ignore = "needs 10.255.255.1 to be unroutable from the test host"]
    async fn test_connect_bounded_by_timeout() {
        // Non-routable address: either times out or fails fast, never hangs.
        let endpoint = Endpoint::new("10.255.255.1", 23);
        let start = Instant::now();
        let result = Transport::open(&endpoint, Duration::from_millis(100)).await;
        assert!(matches!(
            result,
            Err(TransportError::ConnectTimeout { timeout_ms: 100, .. })
                | Err(TransportError::ConnectRefused { .. })
        ));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let transport = Transport::open(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();
        let _socket = server.await.unwrap();

        assert!(transport.close().await);
        assert!(!transport.close().await);
        assert!(transport.is_closed());

        assert_eq!(
            transport.send(b"x").await,
            Err(TransportError::TransportClosed)
        );
        assert_eq!(
            transport.receive(Duration::from_millis(10)).await,
            Err(TransportError::TransportClosed)
        );
    }

    #[tokio::test]
    async fn test_concurrent_close_releases_once() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let transport = Arc::new(
            Transport::open(&endpoint, Duration::from_secs(1))
                .await
                .unwrap(),
        );
        let _socket = server.await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let transport = Arc::clone(&transport);
                tokio::spawn(async move { transport.close().await })
            })
            .collect();

        let mut released = 0;
        for handle in handles {
            if handle.await.unwrap() {
                released += 1;
            }
        }
        assert_eq!(released, 1);
    }

    #[tokio::test]
    async fn test_close_interrupts_pending_receive() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let transport = Arc::new(
            Transport::open(&endpoint, Duration::from_secs(1))
                .await
                .unwrap(),
        );
        let _socket = server.await.unwrap();

        let reader = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.receive(Duration::from_secs(10)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = Instant::now();
        transport.close().await;

        let result = reader.await.unwrap();
        assert_eq!(result, Err(TransportError::TransportClosed));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_zero_timeout_returns_buffered_data() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"banner").await.unwrap();
            socket
        });

        let transport = Transport::open(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();
        let _socket = server.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let data = transport.receive(Duration::ZERO).await.unwrap();
        assert_eq!(data, b"banner".to_vec());
        let data = transport.receive(Duration::ZERO).await.unwrap();
        assert!(data.is_empty());
    }
}
