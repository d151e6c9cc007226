//! Client side of a BIDIRECTIONAL connection over a WebSocket.

use crate::connection::{DuplexCore, Outbound, Side};
use crate::error::{Result, RpcError};
use crate::shape::Shape;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Perform the handshake and start the socket pumps.
pub(crate) async fn open(
    url: &str,
    headers: &[(String, String)],
    procedure: String,
    send_shape: Shape,
    recv_shape: Shape,
) -> Result<Arc<DuplexCore>> {
    let mut request = url.into_client_request()?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| RpcError::Config {
            message: format!("Invalid header name {}: {}", name, e),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| RpcError::Config {
            message: format!("Invalid value for header {}: {}", name, e),
        })?;
        request.headers_mut().insert(name, value);
    }

    let (socket, _) = tokio_tungstenite::connect_async(request).await?;
    debug!("Duplex connection to {} established", procedure);

    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let core = Arc::new(DuplexCore::new(procedure, Side::Client, send_shape, recv_shape, tx));
    core.lifecycle().mark_open();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let message = match frame {
                Outbound::Text(text) => Message::Text(text),
                Outbound::Close => Message::Close(None),
            };
            if let Err(e) = sink.send(message).await {
                debug!("Duplex writer stopped: {}", e);
                return;
            }
        }
        let _ = sink.close().await;
    });

    let reader = Arc::clone(&core);
    tokio::spawn(async move {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => reader.dispatch_inbound(&text).await,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => reader.dispatch_inbound(&text).await,
                    Err(_) => reader.report_failure(RpcError::MalformedResponse {
                        message: "binary frame is not UTF-8".to_string(),
                    }),
                },
                Ok(Message::Close(_)) => {
                    reader.remote_closed();
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    reader.transport_lost(RpcError::from(e));
                    return;
                }
            }
        }
        reader.transport_lost(RpcError::ConnectionClosed);
    });

    Ok(core)
}
