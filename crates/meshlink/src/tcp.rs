//! TCP transport
//!
//! The initiator listens on an ephemeral port and offers its address over
//! the signal link; the responder dials it. Both ends then exchange a hello
//! frame carrying their peer id so a stray dialer cannot hijack the offer.
//! Messages are framed with a big-endian u32 length prefix.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::keys::{PeerId, KEY_LENGTH};
use crate::signal::SignalPayload;
use crate::transport::{ConnectRequest, DuplexStream, Transport, TransportError};

/// Default cap on a single frame
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Host the initiator binds its listener on
    pub bind_host: String,
    /// Host advertised in offers; defaults to `bind_host`
    pub advertise_host: Option<String>,
    pub max_frame_len: usize,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            advertise_host: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    async fn listen(&self, request: ConnectRequest) -> Result<TcpDuplex, TransportError> {
        let listener = TcpListener::bind((self.config.bind_host.as_str(), 0))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?
            .port();
        let host = self
            .config
            .advertise_host
            .as_deref()
            .unwrap_or(&self.config.bind_host);
        let address = format!("{}:{}", host, port);
        request
            .link
            .send(SignalPayload::Offer {
                data: address.clone().into_bytes(),
            })
            .await?;
        debug!("offered tcp endpoint {} to {}", address, request.remote.short());

        loop {
            let (socket, from) = listener
                .accept()
                .await
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
            let (mut reader, mut writer) = socket.into_split();
            match read_hello(&mut reader).await {
                Ok(peer) if peer == request.remote => {
                    write_hello(&mut writer, &request.local).await?;
                    return Ok(TcpDuplex::new(request.remote, reader, writer, self.config.max_frame_len));
                }
                Ok(peer) => warn!("rejecting tcp dialer {} claiming {}", from, peer.short()),
                Err(e) => warn!("bad hello from {}: {}", from, e),
            }
        }
    }

    async fn dial(&self, mut request: ConnectRequest) -> Result<TcpDuplex, TransportError> {
        let offer = request.link.expect_offer().await?;
        let address = String::from_utf8(offer)
            .map_err(|_| TransportError::Handshake("offer is not an address".into()))?;
        let socket = TcpStream::connect(&address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", address, e)))?;
        let (mut reader, mut writer) = socket.into_split();
        write_hello(&mut writer, &request.local).await?;
        let peer = read_hello(&mut reader).await?;
        if peer != request.remote {
            return Err(TransportError::ConnectionFailed(format!(
                "expected {}, got {}",
                request.remote.short(),
                peer.short()
            )));
        }
        Ok(TcpDuplex::new(request.remote, reader, writer, self.config.max_frame_len))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn connect(&self, request: ConnectRequest) -> Result<Box<dyn DuplexStream>, TransportError> {
        let stream = if request.initiator {
            self.listen(request).await?
        } else {
            self.dial(request).await?
        };
        Ok(Box::new(stream))
    }
}

async fn write_hello(writer: &mut OwnedWriteHalf, peer: &PeerId) -> Result<(), TransportError> {
    writer
        .write_all(peer.as_bytes())
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

async fn read_hello(reader: &mut OwnedReadHalf) -> Result<PeerId, TransportError> {
    let mut bytes = [0u8; KEY_LENGTH];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    Ok(PeerId::from_bytes(bytes))
}

/// Length-prefixed framing over a TCP socket
pub struct TcpDuplex {
    remote: PeerId,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    open: AtomicBool,
    closed: watch::Sender<bool>,
    max_frame_len: usize,
}

impl TcpDuplex {
    fn new(remote: PeerId, reader: OwnedReadHalf, writer: OwnedWriteHalf, max_frame_len: usize) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            remote,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            open: AtomicBool::new(true),
            closed,
            max_frame_len,
        }
    }

    async fn read_frame(&self, reader: &mut OwnedReadHalf) -> Option<Vec<u8>> {
        let len = reader.read_u32().await.ok()? as usize;
        if len > self.max_frame_len {
            warn!("dropping tcp link to {}: frame of {} bytes", self.remote.short(), len);
            return None;
        }
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data).await.ok()?;
        Some(data)
    }
}

#[async_trait]
impl DuplexStream for TcpDuplex {
    fn remote(&self) -> &PeerId {
        &self.remote
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Disconnected);
        }
        if data.len() > self.max_frame_len {
            return Err(TransportError::SendFailed(format!("frame of {} bytes", data.len())));
        }
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_u32(data.len() as u32).await?;
            writer.write_all(&data).await?;
            writer.flush().await
        }
        .await;
        result.map_err(|e| {
            self.open.store(false, Ordering::SeqCst);
            TransportError::SendFailed(e.to_string())
        })
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        if !self.is_open() {
            return None;
        }
        let mut reader = self.reader.lock().await;
        let frame = tokio::select! {
            frame = self.read_frame(&mut reader) => frame,
            _ = closed.changed() => None,
        };
        if frame.is_none() {
            self.open.store(false, Ordering::SeqCst);
        }
        frame
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.closed.send_replace(true);
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
