//! WebSocket 网关：每个连接订阅事件总线，并把入站帧交给控制面
//!
//! message 帧在独立任务中执行，所以同一连接上的 approval_response 可以在 run 等待审批时送达。

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::gateway::{ControlPlane, FrameReply, InboundFrame};

pub struct GatewayServer {
    control: Arc<ControlPlane>,
    bind_addr: String,
}

impl GatewayServer {
    pub fn new(control: Arc<ControlPlane>, bind_addr: impl Into<String>) -> Self {
        Self {
            control,
            bind_addr: bind_addr.into(),
        }
    }

    /// 监听直到 token 被取消
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr: SocketAddr = self.bind_addr.parse()?;
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("Gateway listening on ws://{}", addr);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let control = Arc::clone(&self.control);
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, control, cancel).await {
                                tracing::warn!("Connection error from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
            }
        }
        tracing::info!("Gateway stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    control: Arc<ControlPlane>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tracing::info!("New WebSocket connection from {}", peer);

    // 写端：回复与事件共用一个队列
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // 事件转发；落后时丢弃最旧事件
    let mut events = control.kernel().bus().subscribe();
    let event_tx = tx.clone();
    let event_cancel = cancel.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = event_cancel.cancelled() => break,
                received = events.recv() => received,
            };
            match envelope {
                Ok(envelope) => {
                    if event_tx.send(envelope.to_json()).is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = ws_rx.next() => next,
        };
        let text = match next {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::warn!("WebSocket receive error: {}", e);
                break;
            }
        };

        let frame = match InboundFrame::parse(&text) {
            Ok(frame) => frame,
            Err(error) => {
                let reply = FrameReply::Error {
                    request_id: None,
                    session_id: None,
                    error,
                };
                let _ = tx.send(reply.to_json());
                continue;
            }
        };
        let control = Arc::clone(&control);
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = control.handle_frame(frame).await;
            let _ = tx.send(reply.to_json());
        });
    }

    cancel.cancel();
    drop(tx);
    let _ = forwarder.await;
    let _ = writer.await;
    tracing::info!("Connection from {} closed", peer);
    Ok(())
}
