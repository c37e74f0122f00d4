// WebSocket signaling server
//
// One task per connection. Inbound frames are handled in order; outbound
// events go through a bounded queue drained by a writer task. A connection
// whose queue overflows with a lifecycle event is closed.

use std::{net::SocketAddr, sync::Arc};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        Message,
    },
};

use super::{handler::ConnectionContext, next_connection_id, Channel, Outbound, Outbox, SignalingHandler};
use crate::{engine::CloseSignal, Result};

/// Capacity of each connection's outbound queue
pub const OUTBOX_CAPACITY: usize = 256;

/// Accepts signaling connections on both surfaces
pub struct SignalingServer {
    listener: TcpListener,
    handler: Arc<SignalingHandler>,
}

impl SignalingServer {
    /// Bind the listening socket
    pub async fn bind(addr: SocketAddr, handler: Arc<SignalingHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "Signaling server listening");
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires
    pub async fn run(self, shutdown: CloseSignal) -> Result<()> {
        let closed = shutdown.closed();
        tokio::pin!(closed);

        loop {
            tokio::select! {
                _ = &mut closed => {
                    tracing::info!("Signaling server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::warn!("Accept failed: {}", err);
                            continue;
                        }
                    };
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(stream, peer, handler).await {
                            tracing::debug!(peer = %peer, "Connection ended with error: {}", err);
                        }
                    });
                }
            }
        }
    }
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, handler: Arc<SignalingHandler>) -> Result<()> {
    let mut selected = None;
    let ws = accept_hdr_async(stream, |request: &Request, response: Response| {
        match Channel::from_path(request.uri().path()) {
            Some(channel) => {
                selected = Some(channel);
                Ok(response)
            }
            None => Err(reject(StatusCode::NOT_FOUND, "unknown signaling path")),
        }
    })
    .await?;
    let channel = selected.unwrap_or(Channel::Streaming);

    let connection_id = next_connection_id();
    tracing::info!(peer = %peer, connection_id, channel = ?channel, "Signaling connection opened");

    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOX_CAPACITY);
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let text = match outbound.to_json() {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(connection_id, "Failed to encode event: {}", err);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut ctx = ConnectionContext::new(Outbox::new(connection_id, channel, tx));
    let lagged = ctx.outbox().lagged().closed();
    tokio::pin!(lagged);
    loop {
        let frame = tokio::select! {
            _ = &mut lagged => {
                tracing::warn!(peer = %peer, connection_id, "Dropping connection that stopped reading events");
                break;
            }
            frame = source.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => handler.handle_text(&mut ctx, &text).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Binary(_))) => {
                tracing::debug!(connection_id, "Ignoring binary frame");
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                tracing::debug!(connection_id, "Read failed: {}", err);
                break;
            }
        }
    }

    handler.disconnect(ctx).await;
    writer.abort();
    tracing::info!(peer = %peer, connection_id, "Signaling connection closed");
    Ok(())
}
