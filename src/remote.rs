//! The remote node client: a participant talking to a hub over a framed
//! channel instead of attaching in-process.
//!
//! A [`RemoteNode`] can register endpoints (served locally, dispatched back
//! over the channel by the hub), call endpoints, publish, subscribe with a
//! local callback, and register message interceptors that the hub consults
//! with intercept-invocation frames. Handles are cloneable and share the
//! connection; closing one closes them all.

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;

use crate::{
    config::HubConfig,
    error::HubError,
    matching::pattern_matches,
    message::{
        handler, meta, now_ms, ApiHandler, ApiRequest, ApiResponse, ClientId, HubId,
        InterceptorFn, InterceptorId, Message, Metadata, SubscriberFn, SubscriptionId,
    },
    transport::{tcp::Connector, Inbound, Peer},
    wire::WireError,
};

struct LocalSubscription {
    id: SubscriptionId,
    pattern: String,
    priority: i32,
    seq: u64,
    callback: SubscriberFn,
}

struct LocalInterceptor {
    id: InterceptorId,
    pattern: String,
    priority: i32,
    seq: u64,
    interceptor: InterceptorFn,
}

#[derive(Default)]
struct RemoteShared {
    handlers: Mutex<HashMap<String, ApiHandler>>,
    subscriptions: Mutex<Vec<LocalSubscription>>,
    interceptors: Mutex<Vec<LocalInterceptor>>,
    next_seq: AtomicU64,
}

impl RemoteShared {
    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// A node connected to a hub over the wire.
#[derive(Clone)]
pub struct RemoteNode {
    client_id: ClientId,
    peer: Peer,
    shared: Arc<RemoteShared>,
    config: Arc<HubConfig>,
}

impl RemoteNode {
    /// Connect to a serving hub. TLS is used when the config carries a
    /// trust anchor; plain TCP requires explicit `insecure` mode.
    pub async fn connect(addr: impl Into<String>, config: HubConfig) -> Result<Self, HubError> {
        let config = Arc::new(config);
        let (in_tx, in_rx) = mpsc::channel(config.outgoing_depth);
        let mut connector = Connector::from_config(addr.into(), config.clone())?;
        let peer = connector.establish(in_tx).await?;
        let shared = Arc::new(RemoteShared::default());
        tokio::spawn(dispatch(peer.clone(), in_rx, shared.clone()));
        Ok(Self {
            client_id: ClientId::new(),
            peer,
            shared,
            config,
        })
    }

    /// This node's client id, stamped on everything it sends.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Register an endpoint served by this node. The hub dispatches
    /// matching requests back over the channel.
    pub async fn register_api<F, Fut>(
        &self,
        path: impl Into<String>,
        metadata: Metadata,
        f: F,
    ) -> Result<(), HubError>
    where
        F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, HubError>> + Send + 'static,
    {
        let path = path.into();
        {
            let mut handlers = self.shared.handlers.lock().expect("handler table poisoned");
            if handlers.contains_key(&path) {
                return Err(HubError::Conflict(path));
            }
            handlers.insert(path.clone(), handler(f));
        }
        match self.peer.register(&path, &metadata, false).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(rejection)) => {
                self.shared
                    .handlers
                    .lock()
                    .expect("handler table poisoned")
                    .remove(&path);
                Err(HubError::Conflict(rejection))
            }
            Err(err) => {
                self.shared
                    .handlers
                    .lock()
                    .expect("handler table poisoned")
                    .remove(&path);
                Err(err)
            }
        }
    }

    /// Withdraw an endpoint registration. Idempotent.
    pub async fn deregister_api(&self, path: impl Into<String>) -> Result<(), HubError> {
        let path = path.into();
        self.shared
            .handlers
            .lock()
            .expect("handler table poisoned")
            .remove(&path);
        self.peer.register(&path, &Metadata::new(), true).await?;
        Ok(())
    }

    /// Call an endpoint with typed request and response bodies.
    pub async fn call_api<T, R>(&self, path: impl Into<String>, body: &T) -> Result<R, HubError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let payload = postcard::to_stdvec(body).map_err(|e| HubError::from(WireError::Codec(e)))?;
        let response = self.call_api_raw(path, payload, Metadata::new()).await;
        let payload = response.into_result()?;
        postcard::from_bytes(&payload).map_err(|e| HubError::from(WireError::Codec(e)))
    }

    /// Call an endpoint and get the full response back.
    pub async fn call_api_raw(
        &self,
        path: impl Into<String>,
        payload: Vec<u8>,
        metadata: Metadata,
    ) -> ApiResponse {
        let mut request = ApiRequest::new(path, payload, metadata, self.client_id, HubId::new());
        let timeout = self.config.request_timeout();
        if request.deadline_ms().is_none() {
            let deadline = now_ms() + timeout.as_millis() as u64;
            request
                .metadata
                .insert(meta::DEADLINE_MS.into(), deadline.to_string());
        }
        match tokio::time::timeout(timeout, self.peer.request(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => ApiResponse::from(&err),
            Err(_) => ApiResponse::timed_out(timeout),
        }
    }

    /// Publish a typed message. Returns the intercept result, if any hub
    /// on the chain intercepted.
    pub async fn publish<T: Serialize>(
        &self,
        topic: impl Into<String>,
        body: &T,
        metadata: Metadata,
    ) -> Result<Option<Vec<u8>>, HubError> {
        let payload = postcard::to_stdvec(body).map_err(|e| HubError::from(WireError::Codec(e)))?;
        self.publish_raw(Message::new(topic, payload, metadata, self.client_id))
            .await
    }

    /// Publish a prebuilt message.
    pub async fn publish_raw(&self, message: Message) -> Result<Option<Vec<u8>>, HubError> {
        self.peer
            .publish(&message, self.config.request_timeout())
            .await
    }

    /// Subscribe a local callback to a pattern at the hub.
    pub async fn subscribe(
        &self,
        pattern: impl Into<String>,
        priority: i32,
        callback: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, HubError> {
        let pattern = pattern.into();
        let id = match self.peer.subscribe(&pattern, priority).await? {
            Ok(id) => id,
            Err(rejection) => {
                return Err(HubError::Transport(format!(
                    "hub refused subscription: {rejection}"
                )));
            }
        };
        let mut subs = self
            .shared
            .subscriptions
            .lock()
            .expect("subscription table poisoned");
        subs.push(LocalSubscription {
            id,
            pattern,
            priority,
            seq: self.shared.seq(),
            callback: Arc::new(callback),
        });
        subs.sort_by_key(|s| (std::cmp::Reverse(s.priority), s.seq));
        Ok(id)
    }

    /// Remove a subscription.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), HubError> {
        self.shared
            .subscriptions
            .lock()
            .expect("subscription table poisoned")
            .retain(|s| s.id != id);
        self.peer.unsubscribe(id).await
    }

    /// Register a message interceptor at the hub, served by this node.
    pub async fn register_interceptor(
        &self,
        pattern: impl Into<String>,
        priority: i32,
        interceptor: impl Fn(&Message) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Result<InterceptorId, HubError> {
        let pattern = pattern.into();
        let id = match self.peer.register_interceptor(&pattern, priority).await? {
            Ok(id) => id,
            Err(rejection) => {
                return Err(HubError::Transport(format!(
                    "hub refused interceptor: {rejection}"
                )));
            }
        };
        let mut interceptors = self
            .shared
            .interceptors
            .lock()
            .expect("interceptor table poisoned");
        interceptors.push(LocalInterceptor {
            id,
            pattern,
            priority,
            seq: self.shared.seq(),
            interceptor: Arc::new(interceptor),
        });
        interceptors.sort_by_key(|i| (std::cmp::Reverse(i.priority), i.seq));
        Ok(id)
    }

    /// Remove a message interceptor.
    pub async fn deregister_interceptor(&self, id: InterceptorId) -> Result<(), HubError> {
        self.shared
            .interceptors
            .lock()
            .expect("interceptor table poisoned")
            .retain(|i| i.id != id);
        self.peer.deregister_interceptor(id).await
    }

    /// Close the connection. All clones stop; in-flight calls fail with a
    /// transport error.
    pub async fn close(&self) {
        self.peer.close().await;
    }

    /// Has the connection stopped?
    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }

    /// Wait until the connection stops.
    pub async fn wait_closed(&self) {
        self.peer.closed().await;
    }
}

/// Serves hub-initiated traffic: endpoint dispatches, subscription
/// deliveries, and intercept invocations.
async fn dispatch(peer: Peer, mut inbound: mpsc::Receiver<Inbound>, shared: Arc<RemoteShared>) {
    while let Some(frame) = inbound.recv().await {
        match frame {
            Inbound::Request(request) => {
                let handler = shared
                    .handlers
                    .lock()
                    .expect("handler table poisoned")
                    .get(&request.path)
                    .cloned();
                let peer = peer.clone();
                tokio::spawn(async move {
                    let request_id = request.request_id;
                    let path = request.path.clone();
                    let response = match handler {
                        Some(h) => match h(request).await {
                            Ok(payload) => ApiResponse::success(payload),
                            Err(err) => ApiResponse::from(&err),
                        },
                        None => ApiResponse::not_found(&path),
                    };
                    let _ = peer.respond(request_id, &response).await;
                });
            }
            Inbound::Publish(delivery) => {
                let callbacks: Vec<SubscriberFn> = {
                    let subs = shared
                        .subscriptions
                        .lock()
                        .expect("subscription table poisoned");
                    subs.iter()
                        .filter(|s| pattern_matches(&s.pattern, &delivery.message.topic))
                        .map(|s| s.callback.clone())
                        .collect()
                };
                for callback in callbacks {
                    callback(delivery.message.clone());
                }
            }
            Inbound::Intercept(invocation) => {
                let chain: Vec<InterceptorFn> = {
                    let interceptors = shared
                        .interceptors
                        .lock()
                        .expect("interceptor table poisoned");
                    interceptors
                        .iter()
                        .filter(|i| pattern_matches(&i.pattern, &invocation.message.topic))
                        .map(|i| i.interceptor.clone())
                        .collect()
                };
                let response = chain
                    .iter()
                    .find_map(|f| f(&invocation.message))
                    .map(ApiResponse::intercepted)
                    .unwrap_or_else(|| ApiResponse::success(Vec::new()));
                let _ = peer.respond(invocation.invocation_id, &response).await;
            }
            Inbound::Register(_) | Inbound::Subscribe(_) | Inbound::RegisterInterceptor(_) => {
                tracing::warn!("unexpected control frame from hub");
            }
        }
    }
}
