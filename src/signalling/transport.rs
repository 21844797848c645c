//! WebSocket transport for the signalling session
//!
//! The transport only moves messages: it decodes inbound text frames into
//! [`InboundMessage`] values and reports open/close on an event channel.
//! Whether to reconnect after a close is decided by the controller.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest, http::HeaderValue, Message as WsMessage,
};
use tracing::{debug, info, warn};

use super::messages::{InboundMessage, OutboundMessage};
use crate::error::{AppError, Result};

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Peer is navigating away; never reconnect after this one
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Events reported by a signalling transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Connection established
    Open,
    /// Decoded inbound message
    Message(InboundMessage),
    /// Connection closed (always the last event)
    Close { code: u16, reason: String },
    /// Transport-level error; a `Close` follows
    Error(String),
}

/// An open signalling connection
#[async_trait]
pub trait SignallingTransport: Send + Sync {
    /// Queue a message for sending
    async fn send(&self, message: OutboundMessage) -> Result<()>;

    /// Close the connection with a code and reason
    async fn close(&self, code: u16, reason: &str);

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;
}

/// Factory for signalling connections
#[async_trait]
pub trait SignallingConnector: Send + Sync {
    /// Connect to `url`; events are delivered on `events`, starting with `Open`
    async fn connect(
        &self,
        url: &str,
        subprotocols: &[String],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn SignallingTransport>>;
}

/// tokio-tungstenite based connector
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl SignallingConnector for WebSocketConnector {
    async fn connect(
        &self,
        url: &str,
        subprotocols: &[String],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn SignallingTransport>> {
        let mut request = url.into_client_request()?;
        if !subprotocols.is_empty() {
            let value = HeaderValue::from_str(&subprotocols.join(", "))
                .map_err(|e| AppError::Signalling(format!("Invalid sub-protocol list: {}", e)))?;
            request.headers_mut().insert("Sec-WebSocket-Protocol", value);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        info!("Signalling connected to {}", url);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let open = Arc::new(AtomicBool::new(true));

        // Writer: drains queued frames until a close frame goes out
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = matches!(frame, WsMessage::Close(_));
                if let Err(e) = ws_tx.send(frame).await {
                    debug!("Signalling write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let _ = events.send(TransportEvent::Open);

        // Reader: decodes frames and reports the final close
        let reader_open = open.clone();
        tokio::spawn(async move {
            let mut code = CLOSE_ABNORMAL;
            let mut reason = String::new();

            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => deliver(&events, &text),
                    Ok(WsMessage::Binary(data)) => match std::str::from_utf8(&data) {
                        Ok(text) => deliver(&events, text),
                        Err(_) => debug!("Ignoring non-UTF8 binary signalling frame"),
                    },
                    Ok(WsMessage::Close(frame)) => {
                        if let Some(frame) = frame {
                            code = u16::from(frame.code);
                            reason = frame.reason.to_string();
                        } else {
                            code = 1005;
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        reason = e.to_string();
                        break;
                    }
                }
            }

            reader_open.store(false, Ordering::SeqCst);
            info!("Signalling closed: {} {}", code, reason);
            let _ = events.send(TransportEvent::Close { code, reason });
        });

        Ok(Arc::new(WebSocketTransport { out_tx, open }))
    }
}

fn deliver(events: &mpsc::UnboundedSender<TransportEvent>, text: &str) {
    match serde_json::from_str::<InboundMessage>(text) {
        Ok(message) => {
            debug!("Signalling <- {}", message.type_name());
            let _ = events.send(TransportEvent::Message(message));
        }
        Err(e) => warn!("Unrecognised signalling message ({}): {}", e, text),
    }
}

/// Handle to an open WebSocket connection
pub struct WebSocketTransport {
    out_tx: mpsc::UnboundedSender<WsMessage>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl SignallingTransport for WebSocketTransport {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        if !self.is_open() {
            return Err(AppError::Signalling("Connection is not open".to_string()));
        }
        let json = message.to_json()?;
        debug!("Signalling -> {}", json);
        self.out_tx
            .send(WsMessage::Text(json.into()))
            .map_err(|_| AppError::Signalling("Writer task has stopped".to_string()))
    }

    async fn close(&self, code: u16, reason: &str) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.out_tx.send(WsMessage::Close(Some(frame)));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deliver_decodes_known_messages() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        deliver(&tx, r#"{"type":"playerCount","count":4}"#);
        deliver(&tx, r#"{"type":"somethingNew"}"#);
        drop(tx);

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Message(InboundMessage::PlayerCount { count: 4 }))
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = WebSocketConnector
            .connect("ws://127.0.0.1:9", &[], tx)
            .await;
        assert!(result.is_err());
    }
}
