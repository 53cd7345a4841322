//! Peer channels between hubs of different scopes, and between a hub and
//! its remote clients.
//!
//! A [`Peer`] is a cloneable handle over one full-duplex framed connection:
//! an outgoing frame queue drained by a writer task, a reader task that
//! wakes response/ack waiters by correlation id and hands everything else
//! to the owner's dispatch loop, and a stop signal that fails all pending
//! waits when the channel dies.

pub(crate) mod server;
pub(crate) mod tcp;
pub(crate) mod tls;

use std::sync::Arc;

use maitake_sync::WaitMap;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::HubError,
    message::{ApiRequest, ApiResponse, InterceptorId, Message, Metadata, RequestId, SubscriptionId},
    wire::{
        self, Frame, FrameKind, InterceptFrame, InterceptorAckFrame, PublishFrame,
        RegisterAckFrame, RegisterFrame, RegisterInterceptorFrame, ResponseFrame,
        SubscribeAckFrame, SubscribeFrame,
    },
};

/// Channel lifecycle, tracked by connectors and surfaced in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection yet.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Channel is up.
    Connected,
    /// Connection lost, bounded retries in progress.
    Reconnecting,
    /// Retries exhausted or torn down; pending requests have been failed.
    Closed,
}

/// Frames the reader hands to the channel owner's dispatch loop.
/// Responses and acks never show up here; they wake waiters directly.
pub(crate) enum Inbound {
    /// An endpoint invocation from the peer.
    Request(ApiRequest),
    /// A publish (client→hub) or a subscription delivery (hub→client).
    Publish(PublishFrame),
    /// The hub asks this side to run a registered interceptor.
    Intercept(InterceptFrame),
    /// Register or withdraw an endpoint.
    Register(RegisterFrame),
    /// Subscribe or unsubscribe a pattern.
    Subscribe(SubscribeFrame),
    /// Register or withdraw a message interceptor.
    RegisterInterceptor(RegisterInterceptorFrame),
}

/// Acknowledgement values for control transactions.
enum AckValue {
    Register(Result<(), String>),
    Subscribe(Result<SubscriptionId, String>),
    Interceptor(Result<InterceptorId, String>),
}

struct PeerShared {
    responses: WaitMap<RequestId, ApiResponse>,
    acks: WaitMap<RequestId, AckValue>,
    stopper: CancellationToken,
    identity: Option<String>,
}

/// One end of a framed channel. Cloneable; all clones share the connection.
#[derive(Clone)]
pub struct Peer {
    out: mpsc::Sender<Frame>,
    shared: Arc<PeerShared>,
}

/// Spawn reader and writer workers over a stream and return the peer
/// handle. `inbound` receives every frame that is not a response or ack.
pub(crate) fn spawn_peer<R, W>(
    read: R,
    write: W,
    inbound: mpsc::Sender<Inbound>,
    identity: Option<String>,
    outgoing_depth: usize,
) -> Peer
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel(outgoing_depth);
    let shared = Arc::new(PeerShared {
        responses: WaitMap::new(),
        acks: WaitMap::new(),
        stopper: CancellationToken::new(),
        identity,
    });
    tokio::spawn(out_worker(write, out_rx, shared.stopper.clone()));
    tokio::spawn(in_worker(read, shared.clone(), inbound));
    Peer {
        out: out_tx,
        shared,
    }
}

impl Peer {
    fn closed_err() -> HubError {
        HubError::Transport("channel closed".into())
    }

    /// The authenticated TLS identity of the other side, if any.
    pub fn identity(&self) -> Option<&str> {
        self.shared.identity.as_deref()
    }

    /// Queue a frame for transmission.
    pub(crate) async fn send(&self, frame: Frame) -> Result<(), HubError> {
        self.out.send(frame).await.map_err(|_| Self::closed_err())
    }

    /// Send a frame and await the correlated response.
    async fn send_and_wait(&self, id: RequestId, frame: Frame) -> Result<ApiResponse, HubError> {
        // Register the waiter before sending so the response cannot race
        // past us.
        let wait = self.shared.responses.wait(id);
        let mut wait = std::pin::pin!(wait);
        wait.as_mut()
            .enqueue()
            .await
            .map_err(|_| Self::closed_err())?;
        self.send(frame).await?;
        tokio::select! {
            _ = self.shared.stopper.cancelled() => Err(Self::closed_err()),
            response = wait => response.map_err(|_| Self::closed_err()),
        }
    }

    async fn send_and_wait_ack(&self, txn: RequestId, frame: Frame) -> Result<AckValue, HubError> {
        let wait = self.shared.acks.wait(txn);
        let mut wait = std::pin::pin!(wait);
        wait.as_mut()
            .enqueue()
            .await
            .map_err(|_| Self::closed_err())?;
        self.send(frame).await?;
        tokio::select! {
            _ = self.shared.stopper.cancelled() => Err(Self::closed_err()),
            ack = wait => ack.map_err(|_| Self::closed_err()),
        }
    }

    /// Invoke an endpoint on the other side and await its response.
    pub(crate) async fn request(&self, request: &ApiRequest) -> Result<ApiResponse, HubError> {
        self.send_and_wait(request.request_id, Frame::request(request)?)
            .await
    }

    /// Answer a request, publish, or intercept invocation.
    pub(crate) async fn respond(
        &self,
        request_id: RequestId,
        response: &ApiResponse,
    ) -> Result<(), HubError> {
        self.send(Frame::response(request_id, response)?).await
    }

    /// Publish through the other side and return its intercept result.
    pub(crate) async fn publish(
        &self,
        message: &Message,
        timeout: std::time::Duration,
    ) -> Result<Option<Vec<u8>>, HubError> {
        let publish_id = RequestId::new();
        let frame = Frame::publish(publish_id, message)?;
        let response = tokio::time::timeout(timeout, self.send_and_wait(publish_id, frame))
            .await
            .map_err(|_| HubError::Timeout(timeout))??;
        Ok(intercept_value(response))
    }

    /// Ask the other side to run a registered interceptor. `Ok(None)`
    /// means it passed through.
    pub(crate) async fn intercept(
        &self,
        message: &Message,
        timeout: std::time::Duration,
    ) -> Result<Option<Vec<u8>>, HubError> {
        let invocation_id = RequestId::new();
        let frame = Frame::intercept(invocation_id, message)?;
        let response = tokio::time::timeout(timeout, self.send_and_wait(invocation_id, frame))
            .await
            .map_err(|_| HubError::Timeout(timeout))??;
        Ok(intercept_value(response))
    }

    /// Best-effort subscription delivery; drops on a full queue.
    pub(crate) fn try_deliver(&self, message: &Message) -> bool {
        match Frame::publish(RequestId::new(), message) {
            Ok(frame) => self.out.try_send(frame).is_ok(),
            Err(_) => false,
        }
    }

    /// Register (or withdraw, with `remove`) an endpoint on the other
    /// side. The outer error is transport failure; the inner result is the
    /// hub's verdict.
    pub(crate) async fn register(
        &self,
        path: &str,
        metadata: &Metadata,
        remove: bool,
    ) -> Result<Result<(), String>, HubError> {
        let txn = RequestId::new();
        let frame = Frame::encode_payload(
            FrameKind::RegisterApi,
            &RegisterFrame {
                txn,
                path: path.to_string(),
                metadata: metadata.clone(),
                remove,
            },
        )?;
        match self.send_and_wait_ack(txn, frame).await? {
            AckValue::Register(result) => Ok(result),
            _ => Err(HubError::Transport("mismatched ack".into())),
        }
    }

    /// Subscribe a pattern on the other side.
    pub(crate) async fn subscribe(
        &self,
        pattern: &str,
        priority: i32,
    ) -> Result<Result<SubscriptionId, String>, HubError> {
        let txn = RequestId::new();
        let frame = Frame::encode_payload(
            FrameKind::Subscribe,
            &SubscribeFrame {
                txn,
                pattern: pattern.to_string(),
                priority,
                remove: None,
            },
        )?;
        match self.send_and_wait_ack(txn, frame).await? {
            AckValue::Subscribe(result) => Ok(result),
            _ => Err(HubError::Transport("mismatched ack".into())),
        }
    }

    /// Remove a subscription on the other side.
    pub(crate) async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), HubError> {
        let txn = RequestId::new();
        let frame = Frame::encode_payload(
            FrameKind::Subscribe,
            &SubscribeFrame {
                txn,
                pattern: String::new(),
                priority: 0,
                remove: Some(id),
            },
        )?;
        self.send_and_wait_ack(txn, frame).await.map(|_| ())
    }

    /// Register a message interceptor on the other side.
    pub(crate) async fn register_interceptor(
        &self,
        pattern: &str,
        priority: i32,
    ) -> Result<Result<InterceptorId, String>, HubError> {
        let txn = RequestId::new();
        let frame = Frame::encode_payload(
            FrameKind::RegisterInterceptor,
            &RegisterInterceptorFrame {
                txn,
                pattern: pattern.to_string(),
                priority,
                remove: None,
            },
        )?;
        match self.send_and_wait_ack(txn, frame).await? {
            AckValue::Interceptor(result) => Ok(result),
            _ => Err(HubError::Transport("mismatched ack".into())),
        }
    }

    /// Remove a message interceptor on the other side.
    pub(crate) async fn deregister_interceptor(&self, id: InterceptorId) -> Result<(), HubError> {
        let txn = RequestId::new();
        let frame = Frame::encode_payload(
            FrameKind::RegisterInterceptor,
            &RegisterInterceptorFrame {
                txn,
                pattern: String::new(),
                priority: 0,
                remove: Some(id),
            },
        )?;
        self.send_and_wait_ack(txn, frame).await.map(|_| ())
    }

    /// Tear the channel down, signalling the peer first.
    pub async fn close(&self) {
        let _ = self.out.send(Frame::shutdown()).await;
        self.shared.stopper.cancel();
    }

    /// Has the channel stopped?
    pub fn is_closed(&self) -> bool {
        self.shared.stopper.is_cancelled()
    }

    /// Wait for the channel to stop.
    pub async fn closed(&self) {
        self.shared.stopper.cancelled().await;
    }
}

fn intercept_value(response: ApiResponse) -> Option<Vec<u8>> {
    match response.status {
        crate::message::ResponseStatus::Intercepted => Some(response.payload),
        _ => None,
    }
}

/// Writer worker: drains the outgoing queue onto the wire.
async fn out_worker<W>(mut wire: W, mut queue: mpsc::Receiver<Frame>, stopper: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = stopper.cancelled() => return,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };
        if let Err(err) = wire::write_frame(&mut wire, &frame).await {
            tracing::warn!(%err, "outgoing frame write failed, closing channel");
            stopper.cancel();
            return;
        }
    }
}

/// Reader worker: wakes correlation waiters, forwards everything else.
async fn in_worker<R>(mut wire: R, shared: Arc<PeerShared>, inbound: mpsc::Sender<Inbound>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match wire::read_frame(&mut wire).await {
            Ok(frame) => frame,
            Err(crate::wire::WireError::Closed) => break,
            Err(err) => {
                tracing::warn!(%err, "frame read failed, closing channel");
                break;
            }
        };
        let forward = match frame.kind {
            FrameKind::Response => {
                match frame.decode_payload::<ResponseFrame>() {
                    Ok(rf) => {
                        let _ = shared.responses.wake(&rf.request_id, rf.response);
                    }
                    Err(err) => tracing::warn!(%err, "undecodable response frame"),
                }
                None
            }
            FrameKind::RegisterAck => match frame.decode_payload::<RegisterAckFrame>() {
                Ok(ack) => {
                    let _ = shared.acks.wake(&ack.txn, AckValue::Register(ack.result));
                    None
                }
                Err(err) => {
                    tracing::warn!(%err, "undecodable register ack");
                    None
                }
            },
            FrameKind::SubscribeAck => match frame.decode_payload::<SubscribeAckFrame>() {
                Ok(ack) => {
                    let _ = shared.acks.wake(&ack.txn, AckValue::Subscribe(ack.result));
                    None
                }
                Err(err) => {
                    tracing::warn!(%err, "undecodable subscribe ack");
                    None
                }
            },
            FrameKind::InterceptorAck => match frame.decode_payload::<InterceptorAckFrame>() {
                Ok(ack) => {
                    let _ = shared.acks.wake(&ack.txn, AckValue::Interceptor(ack.result));
                    None
                }
                Err(err) => {
                    tracing::warn!(%err, "undecodable interceptor ack");
                    None
                }
            },
            FrameKind::Shutdown => break,
            FrameKind::Request => decode_inbound(&frame, Inbound::Request),
            FrameKind::Publish => decode_inbound(&frame, Inbound::Publish),
            FrameKind::Intercept => decode_inbound(&frame, Inbound::Intercept),
            FrameKind::RegisterApi => decode_inbound(&frame, Inbound::Register),
            FrameKind::Subscribe => decode_inbound(&frame, Inbound::Subscribe),
            FrameKind::RegisterInterceptor => decode_inbound(&frame, Inbound::RegisterInterceptor),
        };
        if let Some(msg) = forward {
            if inbound.send(msg).await.is_err() {
                break;
            }
        }
    }
    shared.stopper.cancel();
    shared.responses.close();
    shared.acks.close();
}

fn decode_inbound<T: serde::de::DeserializeOwned>(
    frame: &Frame,
    wrap: impl FnOnce(T) -> Inbound,
) -> Option<Inbound> {
    match frame.decode_payload::<T>() {
        Ok(payload) => Some(wrap(payload)),
        Err(err) => {
            tracing::warn!(%err, kind = ?frame.kind, "undecodable frame payload");
            None
        }
    }
}
