//! Control channel: one WebSocket to the service plus its receive loop

use futures_util::{SinkExt, StreamExt};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::capabilities::{socket_uri, Capabilities};
use super::handle::{ChannelHandle, ChannelState};
use crate::core::codec::{STATUS_OK, STATUS_TIMEOUT};
use crate::core::{ControlMessage, PacketDecider, ServerMessage};
use crate::error::{render_payload, EzProxyError, Result};
use crate::logger::log;

/// Outcome of handling one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// An open control channel
///
/// Dropping the channel does not stop the receive task; call [`close`] and
/// [`join`] (or keep a [`ChannelHandle`] around and close through it).
///
/// [`close`]: ControlChannel::close
/// [`join`]: ControlChannel::join
pub struct ControlChannel {
    handle: ChannelHandle,
    uri: String,
    task: Option<JoinHandle<Result<()>>>,
}

impl ControlChannel {
    /// Connect to `<base>/api/2/socket` and start the receive loop
    pub async fn open(
        base_url: &str,
        key: &str,
        caps: Capabilities,
        decider: Arc<dyn PacketDecider>,
    ) -> Result<Self> {
        let url = socket_uri(base_url, key, &caps)?;
        let uri = url.to_string();

        let (handle, outbound) = ChannelHandle::new(caps);
        log::channel(&uri, "connecting");

        let (ws, _response) = tokio_tungstenite::connect_async(uri.as_str())
            .await
            .map_err(|e| {
                handle.set_state(ChannelState::Closed);
                EzProxyError::Connect(format!("{}: {}", uri, e))
            })?;

        handle.set_state(ChannelState::Open);
        log::channel(&uri, "open");

        let receiver = ReceiveLoop {
            ws,
            handle: handle.clone(),
            outbound,
            decider,
            uri: uri.clone(),
        };
        let task = tokio::spawn(receiver.run());

        Ok(Self {
            handle,
            uri,
            task: Some(task),
        })
    }

    pub fn handle(&self) -> &ChannelHandle {
        &self.handle
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> ChannelState {
        self.handle.state()
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    /// Stop the receive loop and close the connection. Idempotent.
    pub fn close(&self) {
        self.handle.close();
    }

    /// Wait for the receive loop to end, returning its terminal result.
    /// Fatal channel errors surface here.
    ///
    /// Cancel-safe: dropping the returned future leaves the loop joinable.
    pub async fn join(&mut self) -> Result<()> {
        let res = match self.task.as_mut() {
            Some(task) => task.await,
            None => return Ok(()),
        };
        self.task = None;
        flatten(res)
    }

    /// Like [`join`](ControlChannel::join), giving up after `timeout`.
    /// `None` means the loop is still running.
    pub async fn join_timeout(&mut self, timeout: Duration) -> Option<Result<()>> {
        tokio::time::timeout(timeout, self.join()).await.ok()
    }
}

fn flatten(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    res.map_err(|e| EzProxyError::Transport(format!("receive task failed: {}", e)))?
}

enum Event {
    Cancelled,
    Outbound(ControlMessage),
    Inbound(Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

struct ReceiveLoop<S> {
    ws: WebSocketStream<S>,
    handle: ChannelHandle,
    outbound: mpsc::UnboundedReceiver<ControlMessage>,
    decider: Arc<dyn PacketDecider>,
    uri: String,
}

impl<S> ReceiveLoop<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) -> Result<()> {
        let result = self.drive().await;

        self.handle.close();
        self.handle.set_state(ChannelState::Closing);
        if let Err(e) = self.ws.close(None).await {
            log::debug!(error = %e, "WebSocket close handshake failed");
        }
        self.handle.set_state(ChannelState::Closed);

        match &result {
            Ok(()) => log::channel(&self.uri, "closed"),
            Err(e) => log::warn!(uri = %self.uri, error = %e, "Channel failed"),
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        let cancel = self.handle.cancel_token();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                Some(msg) = self.outbound.recv() => Event::Outbound(msg),
                frame = self.ws.next() => Event::Inbound(frame),
            };

            match event {
                Event::Cancelled => {
                    // Sends accepted before close() still go out, ahead of the Close frame
                    if let Err(e) = self.flush().await {
                        log::debug!(error = %e, "Dropped queued messages on close");
                    }
                    return Ok(());
                }
                Event::Outbound(msg) => self.write(msg).await?,
                Event::Inbound(None) => return Ok(()),
                Event::Inbound(Some(Err(e))) => {
                    return Err(EzProxyError::Transport(e.to_string()));
                }
                Event::Inbound(Some(Ok(frame))) => {
                    if handle_frame(&self.handle, self.decider.as_ref(), frame)? == Flow::Stop {
                        return Ok(());
                    }
                    // Verdicts go out before the next frame is read
                    self.flush().await?;
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        while let Ok(msg) = self.outbound.try_recv() {
            self.write(msg).await?;
        }
        Ok(())
    }

    async fn write(&mut self, msg: ControlMessage) -> Result<()> {
        let text = msg.encode()?;
        self.ws
            .send(Message::text(text))
            .await
            .map_err(|e| EzProxyError::Transport(e.to_string()))
    }
}

/// Handle one inbound frame. Text only; binary frames are a protocol violation.
pub(crate) fn handle_frame(
    handle: &ChannelHandle,
    decider: &dyn PacketDecider,
    frame: Message,
) -> Result<Flow> {
    match frame {
        Message::Text(text) => {
            handle_text(handle, decider, text.as_str())?;
            Ok(Flow::Continue)
        }
        Message::Binary(_) => Err(EzProxyError::Protocol(
            "binary frames are not part of the protocol".to_string(),
        )),
        Message::Close(_) => Ok(Flow::Stop),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(Flow::Continue),
    }
}

pub(crate) fn handle_text(
    handle: &ChannelHandle,
    decider: &dyn PacketDecider,
    text: &str,
) -> Result<()> {
    match ServerMessage::decode(text)? {
        ServerMessage::Failure { status, .. } if status == STATUS_TIMEOUT => {
            log::debug!(status = status, "Service reported a timeout");
            Ok(())
        }
        ServerMessage::Failure { status, payload } => {
            debug_assert_ne!(status, STATUS_OK);
            Err(EzProxyError::Remote {
                status,
                payload: render_payload(&payload),
            })
        }
        ServerMessage::Packet(packet) => {
            log::packet(
                packet.pkt_num,
                packet.proxy_id,
                packet.data.len(),
                packet.is_injected(),
            );
            let verdict = panic::catch_unwind(AssertUnwindSafe(|| decider.decide(handle, &packet)))
                .unwrap_or_else(|_| {
                    log::error!(
                        pkt_num = packet.pkt_num,
                        proxy_id = packet.proxy_id,
                        "Filter hook panicked, dropping packet"
                    );
                    false
                });
            // Injected packets never waited on a verdict upstream
            if handle.capabilities().filter && !packet.is_injected() {
                handle.push(ControlMessage::filter(packet.pkt_num, verdict))?;
            }
            Ok(())
        }
    }
}
