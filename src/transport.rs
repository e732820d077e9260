//! Message-oriented duplex channels the protocol engine runs over.
//!
//! The engine only depends on [`Connector`] and [`Channel`]. [`WsConnector`]
//! implements them on top of WebSockets; tests substitute an in-memory pair.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector as TlsConnector, MaybeTlsStream, connect_async_tls_with_config};
use tracing::debug;
use url::Url;

use crate::error::{NdtError, Result};

/// Type alias for the WebSocket stream
pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connected, message-oriented duplex channel.
#[async_trait]
pub trait Channel: Send + 'static {
    /// Queue one binary message.
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Bytes handed to [`Channel::send`] that have not reached the network yet.
    fn buffered_amount(&self) -> usize {
        0
    }

    /// Next incoming message, or `None` once the peer closed the channel.
    ///
    /// Must be cancel safe: the engine races it against other events.
    async fn recv(&mut self) -> Option<Result<Bytes>>;

    /// Close the channel once queued messages are written.
    async fn close(&mut self) -> Result<()>;
}

/// Opens channels to an NDT server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Channels this connector opens.
    type Channel: Channel;

    /// Open a channel to `host:port` at `path`, negotiating `subprotocol`.
    async fn open(
        &self,
        host: &str,
        port: u16,
        path: &str,
        subprotocol: &str,
    ) -> Result<Self::Channel>;
}

/// URL scheme of the WebSocket channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    /// Plain WebSockets.
    #[default]
    Ws,
    /// WebSockets over TLS.
    Wss,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }
}

/// Opens WebSocket channels, over TLS when the scheme is `wss`.
pub struct WsConnector {
    scheme: Scheme,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl WsConnector {
    /// Fails when the TLS configuration for `wss` cannot be built.
    pub fn new(scheme: Scheme) -> Result<Self> {
        let tls = match scheme {
            Scheme::Ws => None,
            Scheme::Wss => Some(Arc::new(tls_config()?)),
        };
        Ok(WsConnector { scheme, tls })
    }

    fn url(&self, host: &str, port: u16, path: &str) -> Result<Url> {
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_owned()
        };
        Ok(Url::parse(&format!(
            "{}://{}:{}{}",
            self.scheme.as_str(),
            host,
            port,
            path
        ))?)
    }
}

fn tls_config() -> Result<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| NdtError::UnsupportedTransport(format!("TLS setup failed: {e}")))?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(config)
}

#[async_trait]
impl Connector for WsConnector {
    type Channel = WsChannel;

    async fn open(
        &self,
        host: &str,
        port: u16,
        path: &str,
        subprotocol: &str,
    ) -> Result<WsChannel> {
        let url = self.url(host, port, path)?;
        debug!(%url, subprotocol, "opening channel");

        // Build the HTTP request with the WebSocket subprotocol header.
        let mut request = url.as_str().into_client_request()?;
        let protocol = HeaderValue::from_str(subprotocol).map_err(|e| {
            NdtError::UnsupportedTransport(format!("bad subprotocol {subprotocol:?}: {e}"))
        })?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", protocol);

        let connector = self.tls.clone().map(TlsConnector::Rustls);
        let (ws_stream, _response) =
            connect_async_tls_with_config(request, None, false, connector).await?;

        Ok(WsChannel::new(ws_stream))
    }
}

/// A WebSocket whose outgoing frames are written by a background task, so
/// that [`Channel::buffered_amount`] reflects the bytes still queued.
pub struct WsChannel {
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    buffered: Arc<AtomicUsize>,
    incoming: SplitStream<WsStream>,
    writer: Option<JoinHandle<Result<()>>>,
}

impl WsChannel {
    fn new(ws: WsStream) -> Self {
        let (sink, incoming) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let writer = tokio::spawn(write_loop(sink, rx, Arc::clone(&buffered)));
        WsChannel {
            outgoing: Some(tx),
            buffered,
            incoming,
            writer: Some(writer),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    buffered: Arc<AtomicUsize>,
) -> Result<()> {
    while let Some(msg) = rx.recv().await {
        let len = msg.len();
        let sent = sink.send(msg).await;
        buffered.fetch_sub(len, Ordering::AcqRel);
        sent?;
    }
    // the sender side is gone: close the WebSocket
    match sink.close().await {
        Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        let outgoing = self
            .outgoing
            .as_ref()
            .ok_or_else(|| NdtError::ConnectionFailure("channel already closed".into()))?;
        self.buffered.fetch_add(frame.len(), Ordering::AcqRel);
        outgoing
            .send(Message::Binary(frame))
            .map_err(|_| NdtError::ConnectionFailure("channel writer stopped".into()))
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    async fn recv(&mut self) -> Option<Result<Bytes>> {
        while let Some(msg) = self.incoming.next().await {
            match msg {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Text(text)) => return Some(Ok(Bytes::copy_from_slice(text.as_bytes()))),
                Ok(Message::Close(_)) => return None,
                Ok(_) => {} // Ping/Pong handled automatically by tokio-tungstenite
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }

    async fn close(&mut self) -> Result<()> {
        self.outgoing.take();
        match self.writer.take() {
            Some(writer) => writer
                .await
                .map_err(|e| NdtError::ConnectionFailure(format!("channel writer failed: {e}")))?,
            None => Ok(()),
        }
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        // without close(), queued frames are discarded, not flushed
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}
