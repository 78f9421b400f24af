//! Duplex transports carrying the framed protocol.
//!
//! Exactly one transport variant is active per engine. The pipe and TCP
//! variants are plain byte streams; the WebSocket variant is message
//! delimited, but the frame codec is still applied to every message payload
//! so all three carry identical bytes.
//!
//! Transport failures are terminal. There is no retry or reconnect; a
//! helper that loses its connection is expected to be restarted by the
//! host.

use std::{
    io::BufReader,
    os::fd::{
        FromRawFd,
        OwnedFd,
        RawFd,
    },
    path::PathBuf,
    sync::Arc,
};

use bytes::{
    Bytes,
    BytesMut,
};
use futures_util::{
    SinkExt,
    StreamExt,
};
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
        DuplexStream,
    },
    net::{
        TcpStream,
        unix::pipe,
    },
};
use tokio_tungstenite::{
    Connector,
    MaybeTlsStream,
    WebSocketStream,
    connect_async,
    connect_async_tls_with_config,
    tungstenite::Message,
};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport i/o error")]
    Io(#[from] std::io::Error),

    #[error("websocket error")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to load CA certificate {path}")]
    CaCertificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tls configuration error")]
    Tls(#[from] rustls::Error),
}

/// Credentials carried as query parameters on the WebSocket URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WsAuth {
    UserPassword { user: String, password: String },
    ApiKey { apikey: String },
}

/// Where to connect. Exactly one endpoint is chosen at construction.
#[derive(Clone, Debug)]
pub enum Endpoint {
    /// Descriptor pair handed over by the spawning host process.
    Pipe { in_fd: RawFd, out_fd: RawFd },

    /// Raw TCP stream to a remote host.
    Tcp { host: String, port: u16 },

    /// WebSocket connection to a remote host, optionally over TLS.
    WebSocket {
        host: String,
        port: u16,
        /// URI path of the remote capture endpoint.
        endpoint: String,
        auth: WsAuth,
        ssl: bool,
        /// CA certificate to validate the server against. `None` uses the
        /// platform trust roots.
        ca_certificate: Option<PathBuf>,
    },
}

/// An open duplex channel to the host.
#[derive(Debug)]
pub enum Transport {
    Pipe {
        receiver: pipe::Receiver,
        sender: pipe::Sender,
    },
    Tcp {
        stream: TcpStream,
    },
    WebSocket {
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    },
    /// In-memory duplex stream, for tests and embedding.
    Memory {
        stream: DuplexStream,
    },
}

impl Transport {
    /// Opens the transport described by `endpoint`.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        match endpoint {
            Endpoint::Pipe { in_fd, out_fd } => Self::from_fds(*in_fd, *out_fd),
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                tracing::debug!(host, port, "tcp transport connected");
                Ok(Self::Tcp { stream })
            }
            Endpoint::WebSocket {
                host,
                port,
                endpoint,
                auth,
                ssl,
                ca_certificate,
            } => {
                let scheme = if *ssl { "wss" } else { "ws" };
                let query = match auth {
                    WsAuth::UserPassword { user, password } => {
                        format!("user={user}&password={password}")
                    }
                    WsAuth::ApiKey { apikey } => format!("KISMET={apikey}"),
                };
                let uri = format!("{scheme}://{host}:{port}{endpoint}?{query}");

                let stream = if let Some(path) = ca_certificate {
                    let connector = rustls_connector_with_ca(path)?;
                    let (stream, _response) =
                        connect_async_tls_with_config(&uri, None, false, Some(connector)).await?;
                    stream
                }
                else {
                    let (stream, _response) = connect_async(&uri).await?;
                    stream
                };

                tracing::debug!(host, port, endpoint, "websocket transport connected");
                Ok(Self::WebSocket { stream })
            }
        }
    }

    /// Builds a pipe transport from an inherited descriptor pair.
    ///
    /// The descriptors are registered non-blocking with the reactor; "no
    /// data yet" never surfaces as an error.
    pub fn from_fds(in_fd: RawFd, out_fd: RawFd) -> Result<Self, TransportError> {
        // Safety: the host process hands us exclusive ownership of both
        // descriptors on the command line.
        let in_fd = unsafe { OwnedFd::from_raw_fd(in_fd) };
        let out_fd = unsafe { OwnedFd::from_raw_fd(out_fd) };

        Ok(Self::Pipe {
            receiver: pipe::Receiver::from_owned_fd(in_fd)?,
            sender: pipe::Sender::from_owned_fd(out_fd)?,
        })
    }

    /// An in-memory transport pair, both ends connected to each other.
    pub fn memory_pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(0x10000);
        (Self::Memory { stream: a }, Self::Memory { stream: b })
    }

    /// Reads the next chunk of bytes into `buffer`.
    ///
    /// Returns the number of bytes appended; `0` means the peer closed the
    /// connection. For the WebSocket variant a chunk is one complete
    /// message payload.
    pub async fn read_chunk(&mut self, buffer: &mut BytesMut) -> Result<usize, TransportError> {
        match self {
            Self::Pipe { receiver, .. } => Ok(receiver.read_buf(buffer).await?),
            Self::Tcp { stream } => Ok(stream.read_buf(buffer).await?),
            Self::Memory { stream } => Ok(stream.read_buf(buffer).await?),
            Self::WebSocket { stream } => {
                loop {
                    match stream.next().await {
                        None => return Ok(0),
                        Some(message) => {
                            if let Some(n) = websocket_chunk(buffer, message?) {
                                return Ok(n);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Writes one encoded frame.
    pub async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        match self {
            Self::Pipe { sender, .. } => {
                sender.write_all(&frame).await?;
            }
            Self::Tcp { stream } => {
                stream.write_all(&frame).await?;
                stream.flush().await?;
            }
            Self::Memory { stream } => {
                stream.write_all(&frame).await?;
            }
            Self::WebSocket { stream } => {
                stream.send(Message::Binary(frame)).await?;
            }
        }
        Ok(())
    }

    /// Closes the transport, ignoring errors from an already-dead peer.
    pub async fn close(&mut self) {
        let result: Result<(), TransportError> = match self {
            Self::Pipe { .. } => Ok(()),
            Self::Tcp { stream } => stream.shutdown().await.map_err(Into::into),
            Self::Memory { stream } => stream.shutdown().await.map_err(Into::into),
            Self::WebSocket { stream } => stream.close(None).await.map_err(Into::into),
        };

        if let Err(error) = result {
            tracing::debug!(?error, "error closing transport");
        }
    }
}

/// Appends one WebSocket message's payload to `buffer`.
///
/// `Some(0)` signals a peer close. `None` means the message carries no
/// stream data and reading must continue: control frames are handled by
/// the websocket layer itself, and empty payloads must not be confused
/// with the zero-byte read that marks a closed connection.
fn websocket_chunk(buffer: &mut BytesMut, message: Message) -> Option<usize> {
    match message {
        Message::Binary(data) => {
            if data.is_empty() {
                return None;
            }
            buffer.extend_from_slice(&data);
            Some(data.len())
        }
        Message::Text(text) => {
            if text.is_empty() {
                return None;
            }
            buffer.extend_from_slice(text.as_bytes());
            Some(text.len())
        }
        Message::Close(_) => Some(0),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
    }
}

fn rustls_connector_with_ca(path: &PathBuf) -> Result<Connector, TransportError> {
    let file = std::fs::File::open(path).map_err(|source| {
        TransportError::CaCertificate {
            path: path.clone(),
            source,
        }
    })?;
    let mut reader = BufReader::new(file);

    let mut roots = rustls::RootCertStore::empty();
    for certificate in rustls_pemfile::certs(&mut reader) {
        let certificate = certificate.map_err(|source| {
            TransportError::CaCertificate {
                path: path.clone(),
                source,
            }
        })?;
        roots.add(certificate)?;
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Connector::Rustls(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use bytes::{
        Bytes,
        BytesMut,
    };
    use tokio_tungstenite::tungstenite::Message;

    use super::{
        Transport,
        websocket_chunk,
    };

    #[tokio::test]
    async fn memory_pair_is_duplex() {
        let (mut a, mut b) = Transport::memory_pair();

        a.send(Bytes::from_static(b"hello")).await.unwrap();

        let mut buffer = BytesMut::new();
        let n = b.read_chunk(&mut buffer).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buffer[..], b"hello");

        b.send(Bytes::from_static(b"ack")).await.unwrap();
        let mut buffer = BytesMut::new();
        b.close().await;
        let n = a.read_chunk(&mut buffer).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buffer[..], b"ack");
    }

    #[test]
    fn empty_websocket_messages_are_not_a_close() {
        let mut buffer = BytesMut::new();

        assert_eq!(websocket_chunk(&mut buffer, Message::Binary(Bytes::new())), None);
        assert_eq!(websocket_chunk(&mut buffer, Message::Text("".into())), None);
        assert_eq!(websocket_chunk(&mut buffer, Message::Ping(Bytes::new())), None);
        assert!(buffer.is_empty());

        assert_eq!(
            websocket_chunk(&mut buffer, Message::Binary(Bytes::from_static(b"data"))),
            Some(4)
        );
        assert_eq!(&buffer[..], b"data");

        assert_eq!(websocket_chunk(&mut buffer, Message::Close(None)), Some(0));
    }

    #[tokio::test]
    async fn closed_peer_reads_zero() {
        let (mut a, b) = Transport::memory_pair();
        drop(b);

        let mut buffer = BytesMut::new();
        assert_eq!(a.read_chunk(&mut buffer).await.unwrap(), 0);
    }
}
