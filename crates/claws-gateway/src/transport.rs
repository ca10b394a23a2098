//! The socket seam. The connection manager only sees a pair of channels, so
//! the WebSocket implementation and the in-memory test double are
//! interchangeable.

use crate::error::TransportError;
use futures_util::{future::BoxFuture, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Error(String),
    Closed,
}

/// An open link. Dropping it closes the underlying socket.
#[derive(Debug)]
pub struct Transport {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Transport {
    /// Returns the client-side transport and the far ends of its two channels.
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }

    pub fn send(&self, text: String) -> Result<(), TransportError> {
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }
}

pub trait Connector: Send + Sync + 'static {
    /// Resolves once the transport reports open.
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Transport, TransportError>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: Url) -> BoxFuture<'static, Result<Transport, TransportError>> {
        Box::pin(async move {
            let (ws, _) = connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            let (transport, out_rx, in_tx) = Transport::pair();
            tokio::spawn(pump(ws, out_rx, in_tx));
            Ok(transport)
        })
    }
}

async fn pump<S>(
    ws: S,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    in_tx: mpsc::UnboundedSender<TransportEvent>,
) where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(TransportEvent::Text(text)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("ws_close_frame: {frame:?}");
                        let _ = in_tx.send(TransportEvent::Closed);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("ws_read_error: {err}");
                        let _ = in_tx.send(TransportEvent::Error(err.to_string()));
                        break;
                    }
                    None => {
                        let _ = in_tx.send(TransportEvent::Closed);
                        break;
                    }
                }
            }
            out = out_rx.recv() => {
                match out {
                    Some(text) => {
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            warn!("ws_write_error: {err}");
                            let _ = in_tx.send(TransportEvent::Error(err.to_string()));
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }
}
