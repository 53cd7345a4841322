//! The hub engine: one routing worker per scope.
//!
//! A hub owns four tables (the endpoint registry, the subscription table,
//! the message- and method-interceptor tables) and a pending-request map.
//! The tables are owned by a single worker task and mutated only by it;
//! everything else talks to the worker through a command queue. Work that
//! has to wait on handlers, peers or other hubs runs on spawned tasks fed
//! with snapshots, so no hub command ever suspends while the worker holds
//! the tables.
//!
//! Request resolution applies, in strict order: interception, local exact
//! match, parent escalation, fallback rewrite (bounded depth), similarity
//! approximation, `NotFound`. Publishes consult interceptors first (the
//! first non-null value short-circuits delivery here and above), then fan
//! out to matching subscribers and forward to the parent.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    config::HubConfig,
    error::HubError,
    matching::best_match,
    message::{
        handler, meta, now_ms, ApiHandler, ApiRequest, ApiResponse, ClientId, HubId, InterceptorFn,
        InterceptorId, Message, Metadata, RequestId, ResponseStatus, Scope, SubscriberFn,
        SubscriptionId,
    },
    proxy::{MethodInterceptorFn, TypeIdentity},
    registry::{HandlerRef, Registry},
    subscriptions::{
        InterceptorTable, InterceptorTarget, MethodInterceptorTable, SubscriberSink,
        SubscriptionTable,
    },
    transport::Peer,
};

const COMMAND_DEPTH: usize = 256;

/// Hub lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubState {
    /// Constructed but the worker has not started.
    Uninitialized,
    /// Worker starting up.
    Starting,
    /// Serving normally.
    Running,
    /// Refusing new registrations and publishes; completing pending
    /// requests until done or timed out.
    Draining,
    /// Worker exited; every command fails with `ShuttingDown`.
    Stopped,
}

/// A point-in-time view of a hub, served by `status()` and the
/// self-registered `/hub/health` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubStatus {
    /// The hub id, hyphenated.
    pub hub_id: String,
    /// The hub scope.
    pub scope: Scope,
    /// Lifecycle state.
    pub state: HubState,
    /// Registered endpoints.
    pub endpoints: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
    /// In-flight requests tracked by the pending map.
    pub pending: usize,
    /// Whether a parent link is set.
    pub has_parent: bool,
    /// Attached in-process children.
    pub children: usize,
}

/// Where a request entered this hub from. Requests handed down by the
/// parent never escalate back up, which keeps downward routes loop-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestOrigin {
    /// A node or caller attached to this hub.
    Local,
    /// Handed down by the parent hub.
    Parent,
    /// Escalated up by a child hub or sent by a connected client.
    Child,
}

/// The upward link of a hub.
#[derive(Clone)]
pub(crate) enum ParentLink {
    /// Parent lives in this process.
    Local(HubHandle),
    /// Parent is reached over a transport channel.
    Remote(Peer),
}

/// How a registration notice routes requests back down.
pub(crate) enum DownRoute {
    /// An in-process child hub.
    Child(HubHandle),
    /// A connected peer (remote node or child hub over the wire).
    Client(ClientId),
}

/// A resolved invocation route, snapshotted by the worker.
enum TargetRef {
    Handler(ApiHandler),
    Peer(Peer),
    Child(HubHandle),
}

/// One interceptor consultation step.
enum InterceptStep {
    Local(InterceptorFn),
    Remote(Peer),
}

/// One fan-out delivery target, in dispatch order.
enum Delivery {
    Local(mpsc::Sender<Message>),
    Remote(Peer),
}

/// In-flight request record.
struct PendingRequest {
    origin: ClientId,
    #[allow(dead_code)]
    deadline_ms: u64,
    cancel: CancellationToken,
}

/// The request-correlation map. Shared between the worker and the entry
/// points; guarded by a single mutex, never held across suspension.
#[derive(Clone, Default)]
pub(crate) struct PendingMap {
    inner: Arc<Mutex<HashMap<RequestId, PendingRequest>>>,
}

impl PendingMap {
    fn insert_if_absent(
        &self,
        id: RequestId,
        origin: ClientId,
        deadline_ms: u64,
        cancel: CancellationToken,
    ) -> bool {
        let mut map = self.inner.lock().expect("pending map poisoned");
        if map.contains_key(&id) {
            return false;
        }
        map.insert(
            id,
            PendingRequest {
                origin,
                deadline_ms,
                cancel,
            },
        );
        true
    }

    fn remove(&self, id: &RequestId) {
        self.inner.lock().expect("pending map poisoned").remove(id);
    }

    fn cancel(&self, id: &RequestId) {
        if let Some(rec) = self.inner.lock().expect("pending map poisoned").remove(id) {
            rec.cancel.cancel();
        }
    }

    fn cancel_for_origin(&self, origin: ClientId) {
        let mut map = self.inner.lock().expect("pending map poisoned");
        map.retain(|_, rec| {
            if rec.origin == origin {
                rec.cancel.cancel();
                false
            } else {
                true
            }
        });
    }

    fn len(&self) -> usize {
        self.inner.lock().expect("pending map poisoned").len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Payload served by the self-registered `/hub/health` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// The hub id, hyphenated.
    pub hub_id: String,
    /// The hub scope.
    pub scope: Scope,
}

struct HubShared {
    hub_id: HubId,
    scope: Scope,
    /// This hub's identity when acting as a client of its parent.
    as_client: ClientId,
    config: Arc<HubConfig>,
    pending: PendingMap,
    dropped: AtomicU64,
    tx: mpsc::Sender<HubCommand>,
}

/// Constructor namespace for hubs.
pub struct Hub;

impl Hub {
    /// Spawn a hub worker at the given scope and return its handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(scope: Scope, config: HubConfig) -> HubHandle {
        let (tx, rx) = mpsc::channel(COMMAND_DEPTH);
        let shared = Arc::new(HubShared {
            hub_id: HubId::new(),
            scope,
            as_client: ClientId::new(),
            config: Arc::new(config),
            pending: PendingMap::default(),
            dropped: AtomicU64::new(0),
            tx,
        });
        let handle = HubHandle {
            shared: shared.clone(),
        };

        let mut worker = HubWorker {
            shared,
            state: HubState::Starting,
            registry: Registry::default(),
            subscriptions: SubscriptionTable::default(),
            interceptors: InterceptorTable::default(),
            method_interceptors: MethodInterceptorTable::default(),
            clients: HashMap::new(),
            parent: None,
            children: HashMap::new(),
            drain_reply: None,
        };
        worker.register_health(&handle);
        tokio::spawn(worker.run(rx));
        handle
    }
}

/// Cloneable handle to a hub worker. All operations are asynchronous
/// commands into the worker's queue.
#[derive(Clone)]
pub struct HubHandle {
    shared: Arc<HubShared>,
}

impl fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubHandle")
            .field("hub_id", &self.shared.hub_id)
            .field("scope", &self.shared.scope)
            .finish()
    }
}

impl HubHandle {
    /// This hub's id.
    pub fn hub_id(&self) -> HubId {
        self.shared.hub_id
    }

    /// This hub's scope.
    pub fn scope(&self) -> Scope {
        self.shared.scope
    }

    /// The configuration the hub was spawned with.
    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    /// Deliveries dropped during publish fan-out since startup.
    pub fn dropped_deliveries(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    async fn command<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .tx
            .send(make(tx))
            .await
            .map_err(|_| HubError::ShuttingDown)?;
        rx.await.map_err(|_| HubError::ShuttingDown)
    }

    /// Register a local endpoint handler.
    pub async fn register_api(
        &self,
        path: impl Into<String>,
        handler: ApiHandler,
        metadata: Metadata,
        owner: ClientId,
    ) -> Result<(), HubError> {
        self.command(|reply| HubCommand::RegisterApi {
            path: path.into(),
            handler: HandlerRef::Local(handler),
            metadata,
            owner,
            reply,
        })
        .await?
    }

    /// Remove an endpoint registration. Idempotent.
    pub async fn deregister_api(&self, path: impl Into<String>) -> Result<(), HubError> {
        self.command(|reply| HubCommand::DeregisterApi {
            path: path.into(),
            reply,
        })
        .await
    }

    /// Resolve a request issued at this hub.
    pub async fn handle_request(&self, request: ApiRequest) -> ApiResponse {
        self.request_with_origin(request, RequestOrigin::Local).await
    }

    pub(crate) async fn resolve_from_child(&self, request: ApiRequest) -> ApiResponse {
        self.request_with_origin(request, RequestOrigin::Child).await
    }

    pub(crate) async fn resolve_from_parent(&self, request: ApiRequest) -> ApiResponse {
        self.request_with_origin(request, RequestOrigin::Parent).await
    }

    async fn request_with_origin(
        &self,
        mut request: ApiRequest,
        origin: RequestOrigin,
    ) -> ApiResponse {
        let now = now_ms();
        let deadline_ms = match request.deadline_ms() {
            Some(deadline) => deadline,
            None => {
                let deadline = now + self.shared.config.request_timeout().as_millis() as u64;
                request
                    .metadata
                    .insert(meta::DEADLINE_MS.into(), deadline.to_string());
                deadline
            }
        };
        if deadline_ms <= now {
            return ApiResponse::timed_out(Duration::ZERO);
        }
        let remaining = Duration::from_millis(deadline_ms - now);

        let request_id = request.request_id;
        let cancel = CancellationToken::new();
        let tracked = self.shared.pending.insert_if_absent(
            request_id,
            request.sender_id,
            deadline_ms,
            cancel.clone(),
        );

        let (tx, rx) = oneshot::channel();
        let sent = self
            .shared
            .tx
            .send(HubCommand::Resolve {
                request,
                origin,
                depth: 0,
                reply: tx,
            })
            .await
            .is_ok();
        if !sent {
            if tracked {
                self.shared.pending.remove(&request_id);
            }
            return ApiResponse::from(&HubError::ShuttingDown);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => ApiResponse::error("request cancelled"),
            res = tokio::time::timeout(remaining, rx) => match res {
                Ok(Ok(response)) => response,
                Ok(Err(_)) => ApiResponse::error("resolution aborted"),
                Err(_) => ApiResponse::timed_out(remaining),
            },
        };
        if tracked {
            self.shared.pending.remove(&request_id);
        }
        response
    }

    /// Cancel an in-flight request from the origin side. Best effort: the
    /// pending record is removed, handlers already running are not
    /// terminated.
    pub fn cancel_request(&self, request_id: RequestId) {
        self.shared.pending.cancel(&request_id);
    }

    /// Subscribe a callback to a topic pattern. The callback runs on its
    /// own drain task, preserving per-publisher delivery order.
    pub async fn subscribe(
        &self,
        pattern: impl Into<String>,
        priority: i32,
        callback: SubscriberFn,
        owner: ClientId,
    ) -> Result<SubscriptionId, HubError> {
        let (tx, mut rx) = mpsc::channel::<Message>(self.shared.config.subscription_depth);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                callback(message);
            }
        });
        self.command(|reply| HubCommand::Subscribe {
            pattern: pattern.into(),
            priority,
            sink: SubscriberSink::Local(tx),
            owner,
            reply,
        })
        .await?
    }

    /// Subscribe a connected peer to a topic pattern.
    pub(crate) async fn subscribe_remote(
        &self,
        pattern: impl Into<String>,
        priority: i32,
        owner: ClientId,
    ) -> Result<SubscriptionId, HubError> {
        self.command(|reply| HubCommand::Subscribe {
            pattern: pattern.into(),
            priority,
            sink: SubscriberSink::Remote(owner),
            owner,
            reply,
        })
        .await?
    }

    /// Remove a subscription. Returns whether it existed.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, HubError> {
        self.command(|reply| HubCommand::Unsubscribe { id, reply }).await
    }

    /// Register a message interceptor.
    pub async fn register_interceptor(
        &self,
        pattern: impl Into<String>,
        priority: i32,
        interceptor: InterceptorFn,
        owner: ClientId,
    ) -> Result<InterceptorId, HubError> {
        self.command(|reply| HubCommand::RegisterInterceptor {
            pattern: pattern.into(),
            priority,
            target: InterceptorTarget::Local(interceptor),
            owner,
            reply,
        })
        .await?
    }

    /// Register a message interceptor served by a connected peer.
    pub(crate) async fn register_remote_interceptor(
        &self,
        pattern: impl Into<String>,
        priority: i32,
        owner: ClientId,
    ) -> Result<InterceptorId, HubError> {
        self.command(|reply| HubCommand::RegisterInterceptor {
            pattern: pattern.into(),
            priority,
            target: InterceptorTarget::Remote(owner),
            owner,
            reply,
        })
        .await?
    }

    /// Remove a message interceptor. Returns whether it existed.
    pub async fn deregister_interceptor(&self, id: InterceptorId) -> Result<bool, HubError> {
        self.command(|reply| HubCommand::DeregisterInterceptor { id, reply })
            .await
    }

    /// Register a method interceptor for `(type_token, method)`.
    /// Registered against type `T`, it also matches every type whose
    /// lineage contains `T`.
    pub async fn register_method_interceptor(
        &self,
        type_token: impl Into<String>,
        method: impl Into<String>,
        priority: i32,
        interceptor: MethodInterceptorFn,
        owner: ClientId,
    ) -> Result<InterceptorId, HubError> {
        self.command(|reply| HubCommand::RegisterMethodInterceptor {
            type_token: type_token.into(),
            method: method.into(),
            priority,
            handler: interceptor,
            owner,
            reply,
        })
        .await?
    }

    /// Remove a method interceptor. Returns whether it existed.
    pub async fn deregister_method_interceptor(
        &self,
        id: InterceptorId,
    ) -> Result<bool, HubError> {
        self.command(|reply| HubCommand::DeregisterMethodInterceptor { id, reply })
            .await
    }

    /// The ordered interceptor chain for a method call, most specific type
    /// first, descending priority within each type.
    pub(crate) async fn method_interceptor_chain(
        &self,
        identity: &TypeIdentity,
        method: &str,
    ) -> Vec<MethodInterceptorFn> {
        let lineage = identity.chain();
        let method = method.to_string();
        self.command(|reply| HubCommand::MethodChain {
            lineage,
            method,
            reply,
        })
        .await
        .unwrap_or_default()
    }

    /// Publish a message. Returns the intercept result from the nearest
    /// intercepting hub, or `None` when the message fanned out normally.
    pub async fn publish(&self, message: Message) -> Result<Option<Vec<u8>>, HubError> {
        self.command(|reply| HubCommand::Publish { message, reply }).await?
    }

    /// Attach an in-process child hub beneath this hub. Fails if the child
    /// already has a parent or its scope is not below this hub's.
    pub async fn attach_child(&self, child: &HubHandle) -> Result<(), HubError> {
        if child.scope() >= self.scope() {
            return Err(HubError::Conflict(format!(
                "cannot attach a {} hub beneath a {} hub",
                child.scope(),
                self.scope()
            )));
        }
        child
            .set_parent(ParentLink::Local(self.clone()))
            .await?;
        self.command(|reply| HubCommand::AttachChild {
            handle: child.clone(),
            reply,
        })
        .await?
    }

    /// Detach a child hub. The child keeps running; its routes through this
    /// hub are removed.
    pub async fn detach_child(&self, hub_id: HubId) -> Result<(), HubError> {
        self.command(|reply| HubCommand::DetachChild { hub_id, reply }).await
    }

    pub(crate) async fn set_parent(&self, link: ParentLink) -> Result<(), HubError> {
        self.command(|reply| HubCommand::SetParent { link, reply }).await?
    }

    /// Swap the transport peer of a remote parent link after a reconnect
    /// and re-announce every registration.
    pub(crate) async fn parent_reconnected(&self, peer: Peer) -> Result<(), HubError> {
        self.command(|reply| HubCommand::ParentReconnected { peer, reply })
            .await
    }

    pub(crate) async fn registration_notice(
        &self,
        path: String,
        metadata: Metadata,
        route: DownRoute,
        owner: ClientId,
    ) -> Result<(), HubError> {
        self.command(|reply| HubCommand::RegistrationNotice {
            path,
            metadata,
            route,
            owner,
            reply,
        })
        .await?
    }

    pub(crate) async fn deregistration_notice(
        &self,
        path: String,
        owner: ClientId,
    ) -> Result<(), HubError> {
        self.command(|reply| HubCommand::DeregistrationNotice { path, owner, reply })
            .await
    }

    /// Track a connected peer so remote registrations can route to it.
    pub(crate) async fn client_connected(&self, id: ClientId, peer: Peer) -> Result<(), HubError> {
        self.command(|reply| HubCommand::ClientConnected { id, peer, reply })
            .await
    }

    /// Remove a participant and everything it registered, at this hub and,
    /// via deregistration notices, at every hub that learned of it.
    pub async fn disconnect_client(&self, id: ClientId) -> Result<(), HubError> {
        self.command(|reply| HubCommand::ClientDisconnected { id, reply })
            .await
    }

    /// A point-in-time status snapshot.
    pub async fn status(&self) -> Result<HubStatus, HubError> {
        self.command(|reply| HubCommand::Status { reply }).await
    }

    /// Drain the hub: refuse new work, finish pending requests (bounded by
    /// the request timeout), then stop the worker.
    pub async fn drain(&self) -> Result<(), HubError> {
        self.command(|reply| HubCommand::Drain { reply }).await
    }
}

enum HubCommand {
    RegisterApi {
        path: String,
        handler: HandlerRef,
        metadata: Metadata,
        owner: ClientId,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    DeregisterApi {
        path: String,
        reply: oneshot::Sender<()>,
    },
    Resolve {
        request: ApiRequest,
        origin: RequestOrigin,
        depth: u8,
        reply: oneshot::Sender<ApiResponse>,
    },
    Lookup {
        path: String,
        reply: oneshot::Sender<Option<TargetRef>>,
    },
    Subscribe {
        pattern: String,
        priority: i32,
        sink: SubscriberSink,
        owner: ClientId,
        reply: oneshot::Sender<Result<SubscriptionId, HubError>>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    RegisterInterceptor {
        pattern: String,
        priority: i32,
        target: InterceptorTarget,
        owner: ClientId,
        reply: oneshot::Sender<Result<InterceptorId, HubError>>,
    },
    DeregisterInterceptor {
        id: InterceptorId,
        reply: oneshot::Sender<bool>,
    },
    RegisterMethodInterceptor {
        type_token: String,
        method: String,
        priority: i32,
        handler: MethodInterceptorFn,
        owner: ClientId,
        reply: oneshot::Sender<Result<InterceptorId, HubError>>,
    },
    DeregisterMethodInterceptor {
        id: InterceptorId,
        reply: oneshot::Sender<bool>,
    },
    MethodChain {
        lineage: Vec<String>,
        method: String,
        reply: oneshot::Sender<Vec<MethodInterceptorFn>>,
    },
    Publish {
        message: Message,
        reply: oneshot::Sender<Result<Option<Vec<u8>>, HubError>>,
    },
    RegistrationNotice {
        path: String,
        metadata: Metadata,
        route: DownRoute,
        owner: ClientId,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    DeregistrationNotice {
        path: String,
        owner: ClientId,
        reply: oneshot::Sender<()>,
    },
    NoticeSynced {
        path: String,
    },
    AttachChild {
        handle: HubHandle,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    DetachChild {
        hub_id: HubId,
        reply: oneshot::Sender<()>,
    },
    SetParent {
        link: ParentLink,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    ParentReconnected {
        peer: Peer,
        reply: oneshot::Sender<()>,
    },
    ClientConnected {
        id: ClientId,
        peer: Peer,
        reply: oneshot::Sender<()>,
    },
    ClientDisconnected {
        id: ClientId,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<HubStatus>,
    },
    Drain {
        reply: oneshot::Sender<()>,
    },
    FinishDrain,
}

enum Flow {
    Continue,
    Stop,
}

struct HubWorker {
    shared: Arc<HubShared>,
    state: HubState,
    registry: Registry,
    subscriptions: SubscriptionTable,
    interceptors: InterceptorTable,
    method_interceptors: MethodInterceptorTable,
    clients: HashMap<ClientId, Peer>,
    parent: Option<ParentLink>,
    children: HashMap<HubId, HubHandle>,
    drain_reply: Option<oneshot::Sender<()>>,
}

impl HubWorker {
    fn register_health(&mut self, handle: &HubHandle) {
        let report = HealthReport {
            hub_id: handle.hub_id().to_string(),
            scope: handle.scope(),
        };
        let health = handler(move |_req| {
            let report = report.clone();
            async move {
                postcard::to_stdvec(&report)
                    .map_err(|e| HubError::Handler(format!("health encode failed: {e}")))
            }
        });
        let mut metadata = Metadata::new();
        metadata.insert(meta::LOCAL_ONLY.into(), "true".into());
        if let Err(err) = self.registry.insert(
            "/hub/health",
            HandlerRef::Local(health),
            metadata,
            self.shared.as_client,
            false,
        ) {
            tracing::warn!(%err, "health endpoint registration failed");
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        self.state = HubState::Running;
        tracing::debug!(hub = %self.shared.hub_id, scope = %self.shared.scope, "hub worker running");
        let mut sync_tick = tokio::time::interval(self.shared.config.reconnect_interval());
        sync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        if matches!(self.handle(cmd), Flow::Stop) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = sync_tick.tick() => self.retry_unsynced(),
            }
        }
        self.state = HubState::Stopped;
        if let Some(reply) = self.drain_reply.take() {
            let _ = reply.send(());
        }
        tracing::debug!(hub = %self.shared.hub_id, "hub worker stopped");
    }

    fn accepting(&self) -> bool {
        self.state == HubState::Running
    }

    fn handle(&mut self, cmd: HubCommand) -> Flow {
        match cmd {
            HubCommand::RegisterApi {
                path,
                handler,
                metadata,
                owner,
                reply,
            } => {
                if !self.accepting() {
                    let _ = reply.send(Err(HubError::ShuttingDown));
                    return Flow::Continue;
                }
                let announce =
                    self.parent.is_some() && !metadata.contains_key(meta::LOCAL_ONLY);
                let result =
                    self.registry
                        .insert(&path, handler, metadata.clone(), owner, announce);
                if result.is_ok() && announce {
                    self.spawn_notice(path, metadata);
                }
                let _ = reply.send(result);
            }
            HubCommand::DeregisterApi { path, reply } => {
                if let Some(entry) = self.registry.remove(&path) {
                    if !entry.metadata.contains_key(meta::LOCAL_ONLY) {
                        self.spawn_dereg_notice(path);
                    }
                }
                let _ = reply.send(());
            }
            HubCommand::Resolve {
                request,
                origin,
                depth,
                reply,
            } => {
                if !self.accepting() && depth == 0 {
                    let _ = reply.send(ApiResponse::from(&HubError::ShuttingDown));
                    return Flow::Continue;
                }
                let plan = self.plan_resolution(&request.path, origin);
                let ctx = ResolveCtx {
                    hub_id: self.shared.hub_id,
                    config: self.shared.config.clone(),
                    tx: self.shared.tx.clone(),
                    origin,
                    depth,
                };
                tokio::spawn(async move {
                    let response = resolve(plan, ctx, request).await;
                    let _ = reply.send(response);
                });
            }
            HubCommand::Lookup { path, reply } => {
                let _ = reply.send(self.target_for(&path));
            }
            HubCommand::Subscribe {
                pattern,
                priority,
                sink,
                owner,
                reply,
            } => {
                if !self.accepting() {
                    let _ = reply.send(Err(HubError::ShuttingDown));
                    return Flow::Continue;
                }
                let id = self.subscriptions.insert(pattern, priority, owner, sink);
                let _ = reply.send(Ok(id));
            }
            HubCommand::Unsubscribe { id, reply } => {
                let _ = reply.send(self.subscriptions.remove(id));
            }
            HubCommand::RegisterInterceptor {
                pattern,
                priority,
                target,
                owner,
                reply,
            } => {
                if !self.accepting() {
                    let _ = reply.send(Err(HubError::ShuttingDown));
                    return Flow::Continue;
                }
                let id = self.interceptors.insert(pattern, priority, owner, target);
                let _ = reply.send(Ok(id));
            }
            HubCommand::DeregisterInterceptor { id, reply } => {
                let _ = reply.send(self.interceptors.remove(id));
            }
            HubCommand::RegisterMethodInterceptor {
                type_token,
                method,
                priority,
                handler,
                owner,
                reply,
            } => {
                if !self.accepting() {
                    let _ = reply.send(Err(HubError::ShuttingDown));
                    return Flow::Continue;
                }
                let id = self
                    .method_interceptors
                    .insert(type_token, method, priority, owner, handler);
                let _ = reply.send(Ok(id));
            }
            HubCommand::DeregisterMethodInterceptor { id, reply } => {
                let _ = reply.send(self.method_interceptors.remove(id));
            }
            HubCommand::MethodChain {
                lineage,
                method,
                reply,
            } => {
                let _ = reply.send(self.method_interceptors.chain(&lineage, &method));
            }
            HubCommand::Publish { message, reply } => {
                if !self.accepting() {
                    let _ = reply.send(Err(HubError::ShuttingDown));
                    return Flow::Continue;
                }
                let plan = self.plan_publish(&message.topic);
                let dropped = DroppedCounter(self.shared.clone());
                let timeout = self.shared.config.request_timeout();
                let has_remote_gate = plan
                    .interceptors
                    .iter()
                    .any(|step| matches!(step, InterceptStep::Remote(_)));
                if has_remote_gate {
                    // Remote gates suspend, so the whole pipeline moves to
                    // a task; ordering across publishes is best-effort.
                    tokio::spawn(async move {
                        let result = run_publish(plan, message, timeout, dropped).await;
                        let _ = reply.send(Ok(result));
                    });
                } else {
                    // Gates are synchronous values and fan-out is
                    // non-blocking, so both run here on the worker. That
                    // keeps publisher-to-subscriber enqueue order intact
                    // across consecutive publishes.
                    if let Some(value) = eval_local_gates(&plan.interceptors, &message) {
                        let _ = reply.send(Ok(Some(value)));
                        return Flow::Continue;
                    }
                    fan_out(&plan.deliveries, &message, &dropped);
                    match plan.parent {
                        None => {
                            let _ = reply.send(Ok(None));
                        }
                        parent => {
                            tokio::spawn(async move {
                                let result = forward_up(parent, message, timeout).await;
                                let _ = reply.send(Ok(result));
                            });
                        }
                    }
                }
            }
            HubCommand::RegistrationNotice {
                path,
                metadata,
                route,
                owner,
                reply,
            } => {
                if !self.accepting() {
                    let _ = reply.send(Err(HubError::ShuttingDown));
                    return Flow::Continue;
                }
                let handler = match route {
                    DownRoute::Child(handle) => HandlerRef::Descendant(handle),
                    DownRoute::Client(id) => HandlerRef::Remote(id),
                };
                let announce =
                    self.parent.is_some() && !metadata.contains_key(meta::LOCAL_ONLY);
                let result =
                    self.registry
                        .insert(&path, handler, metadata.clone(), owner, announce);
                if result.is_ok() && announce {
                    self.spawn_notice(path, metadata);
                }
                let _ = reply.send(result);
            }
            HubCommand::DeregistrationNotice { path, owner, reply } => {
                let owned = self
                    .registry
                    .get(&path)
                    .is_some_and(|entry| entry.owner == owner);
                if owned {
                    self.registry.remove(&path);
                    self.spawn_dereg_notice(path);
                }
                let _ = reply.send(());
            }
            HubCommand::NoticeSynced { path } => {
                self.registry.mark_synced(&path);
            }
            HubCommand::AttachChild { handle, reply } => {
                self.children.insert(handle.hub_id(), handle);
                let _ = reply.send(Ok(()));
            }
            HubCommand::DetachChild { hub_id, reply } => {
                self.children.remove(&hub_id);
                for path in self.registry.remove_descendant(hub_id) {
                    self.spawn_dereg_notice(path);
                }
                let _ = reply.send(());
            }
            HubCommand::SetParent { link, reply } => {
                if self.parent.is_some() {
                    let _ = reply.send(Err(HubError::Conflict("parent link".into())));
                } else {
                    self.parent = Some(link);
                    self.registry.mark_all_unsynced();
                    self.retry_unsynced();
                    let _ = reply.send(Ok(()));
                }
            }
            HubCommand::ParentReconnected { peer, reply } => {
                if let Some(ParentLink::Remote(_)) = &self.parent {
                    self.parent = Some(ParentLink::Remote(peer));
                    self.registry.mark_all_unsynced();
                    self.retry_unsynced();
                } else {
                    tracing::warn!("parent reconnect on a hub without a remote parent link");
                }
                let _ = reply.send(());
            }
            HubCommand::ClientConnected { id, peer, reply } => {
                self.clients.insert(id, peer);
                let _ = reply.send(());
            }
            HubCommand::ClientDisconnected { id, reply } => {
                self.clients.remove(&id);
                for path in self.registry.remove_owned_by(id) {
                    self.spawn_dereg_notice(path);
                }
                self.subscriptions.remove_owned_by(id);
                self.interceptors.remove_owned_by(id);
                self.method_interceptors.remove_owned_by(id);
                self.shared.pending.cancel_for_origin(id);
                let _ = reply.send(());
            }
            HubCommand::Status { reply } => {
                let _ = reply.send(HubStatus {
                    hub_id: self.shared.hub_id.to_string(),
                    scope: self.shared.scope,
                    state: self.state,
                    endpoints: self.registry.len(),
                    subscriptions: self.subscriptions.len(),
                    pending: self.shared.pending.len(),
                    has_parent: self.parent.is_some(),
                    children: self.children.len(),
                });
            }
            HubCommand::Drain { reply } => {
                if self.state == HubState::Running {
                    self.state = HubState::Draining;
                    self.drain_reply = Some(reply);
                    let pending = self.shared.pending.clone();
                    let tx = self.shared.tx.clone();
                    let limit = self.shared.config.request_timeout();
                    tokio::spawn(async move {
                        let start = tokio::time::Instant::now();
                        while !pending.is_empty() && start.elapsed() < limit {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                        }
                        let _ = tx.send(HubCommand::FinishDrain).await;
                    });
                } else {
                    let _ = reply.send(());
                }
            }
            HubCommand::FinishDrain => {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    /// Resolve what serves `path` right now, if anything.
    fn target_for(&self, path: &str) -> Option<TargetRef> {
        let entry = self.registry.get(path)?;
        match &entry.handler {
            HandlerRef::Local(h) => Some(TargetRef::Handler(h.clone())),
            HandlerRef::Remote(client) => {
                self.clients.get(client).cloned().map(TargetRef::Peer)
            }
            HandlerRef::Descendant(handle) => Some(TargetRef::Child(handle.clone())),
        }
    }

    fn intercept_steps(&self, topic: &str) -> Vec<InterceptStep> {
        self.interceptors
            .matching(topic)
            .filter_map(|i| match &i.target {
                InterceptorTarget::Local(f) => Some(InterceptStep::Local(f.clone())),
                InterceptorTarget::Remote(client) => match self.clients.get(client) {
                    Some(peer) => Some(InterceptStep::Remote(peer.clone())),
                    None => {
                        tracing::warn!(%client, "interceptor owner is gone, skipping");
                        None
                    }
                },
            })
            .collect()
    }

    fn plan_resolution(&self, path: &str, origin: RequestOrigin) -> ResolvePlan {
        let local = self.target_for(path);
        let parent = if origin == RequestOrigin::Parent {
            None
        } else {
            self.parent.clone()
        };
        let (fallback, candidates) = if local.is_none() {
            (
                self.registry.fallback_for(path).map(str::to_string),
                self.registry.paths().map(str::to_string).collect(),
            )
        } else {
            (None, Vec::new())
        };
        ResolvePlan {
            interceptors: self.intercept_steps(path),
            local,
            parent,
            fallback,
            candidates,
        }
    }

    fn plan_publish(&self, topic: &str) -> PublishPlan {
        let deliveries = self
            .subscriptions
            .matching(topic)
            .filter_map(|s| match &s.sink {
                SubscriberSink::Local(tx) => Some(Delivery::Local(tx.clone())),
                SubscriberSink::Remote(client) => match self.clients.get(client) {
                    Some(peer) => Some(Delivery::Remote(peer.clone())),
                    None => None,
                },
            })
            .collect();
        PublishPlan {
            interceptors: self.intercept_steps(topic),
            deliveries,
            parent: self.parent.clone(),
        }
    }

    fn spawn_notice(&self, path: String, metadata: Metadata) {
        let Some(parent) = self.parent.clone() else {
            return;
        };
        let tx = self.shared.tx.clone();
        let owner = self.shared.as_client;
        let me = HubHandle {
            shared: self.shared.clone(),
        };
        tokio::spawn(async move {
            let synced = match parent {
                ParentLink::Local(handle) => match handle
                    .registration_notice(path.clone(), metadata, DownRoute::Child(me), owner)
                    .await
                {
                    Ok(()) => true,
                    // A conflicting path at the parent is a definitive
                    // rejection, not worth retrying.
                    Err(HubError::Conflict(_)) => true,
                    Err(err) => {
                        tracing::debug!(%err, %path, "registration notice failed, will retry");
                        false
                    }
                },
                ParentLink::Remote(peer) => match peer.register(&path, &metadata, false).await {
                    Ok(Ok(())) => true,
                    Ok(Err(rejection)) => {
                        tracing::debug!(%rejection, %path, "parent rejected registration notice");
                        true
                    }
                    Err(err) => {
                        tracing::debug!(%err, %path, "registration notice failed, will retry");
                        false
                    }
                },
            };
            if synced {
                let _ = tx.send(HubCommand::NoticeSynced { path }).await;
            }
        });
    }

    fn spawn_dereg_notice(&self, path: String) {
        let Some(parent) = self.parent.clone() else {
            return;
        };
        let owner = self.shared.as_client;
        tokio::spawn(async move {
            let result = match parent {
                ParentLink::Local(handle) => handle.deregistration_notice(path, owner).await,
                ParentLink::Remote(peer) => peer
                    .register(&path, &Metadata::new(), true)
                    .await
                    .map(|_| ()),
            };
            if let Err(err) = result {
                tracing::debug!(%err, "deregistration notice failed");
            }
        });
    }

    fn retry_unsynced(&mut self) {
        if self.parent.is_none() {
            return;
        }
        for (path, metadata) in self.registry.unsynced() {
            self.spawn_notice(path, metadata);
        }
    }
}

/// Counter wrapper so publish tasks can bump the hub's drop counter.
struct DroppedCounter(Arc<HubShared>);

impl DroppedCounter {
    fn bump(&self) {
        self.0.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

struct ResolvePlan {
    interceptors: Vec<InterceptStep>,
    local: Option<TargetRef>,
    parent: Option<ParentLink>,
    fallback: Option<String>,
    candidates: Vec<String>,
}

struct ResolveCtx {
    hub_id: HubId,
    config: Arc<HubConfig>,
    tx: mpsc::Sender<HubCommand>,
    origin: RequestOrigin,
    depth: u8,
}

async fn resolve(plan: ResolvePlan, ctx: ResolveCtx, request: ApiRequest) -> ApiResponse {
    // 1. Interception.
    if !plan.interceptors.is_empty() {
        let probe = Message::from_request(&request);
        for step in &plan.interceptors {
            let value = match step {
                InterceptStep::Local(f) => f(&probe),
                InterceptStep::Remote(peer) => {
                    match peer.intercept(&probe, ctx.config.request_timeout()).await {
                        Ok(value) => value,
                        Err(err) => {
                            tracing::warn!(%err, "remote interceptor unreachable, passing through");
                            None
                        }
                    }
                }
            };
            if let Some(payload) = value {
                return ApiResponse::intercepted(payload);
            }
        }
    }

    // 2. Local exact match.
    if let Some(target) = plan.local {
        return invoke_target(target, request).await;
    }

    // 3. Parent escalation. A `NotFound` from above does not end
    //    resolution; fallback and approximation still run here.
    if let Some(parent) = plan.parent {
        let mut escalated = request.clone();
        escalated
            .metadata
            .insert(meta::ESCALATED_FROM.into(), ctx.hub_id.to_string());
        let response = match parent {
            ParentLink::Local(handle) => handle.resolve_from_child(escalated).await,
            ParentLink::Remote(peer) => peer
                .request(&escalated)
                .await
                .unwrap_or_else(|err| ApiResponse::from(&err)),
        };
        if response.status != ResponseStatus::NotFound {
            let mut response = response;
            response
                .metadata
                .entry(meta::ESCALATED_FROM.into())
                .or_insert_with(|| ctx.hub_id.to_string());
            return response;
        }
    }

    // 4. Fallback rewrite, bounded by `fallback_max_depth`.
    if let Some(fallback) = plan.fallback {
        if ctx.depth >= ctx.config.fallback_max_depth {
            return ApiResponse::not_found(&request.path);
        }
        let mut rewritten = request.clone();
        rewritten.path = fallback;
        rewritten
            .metadata
            .insert(meta::ORIGINAL_PATH.into(), request.path.clone());
        let (tx, rx) = oneshot::channel();
        let sent = ctx
            .tx
            .send(HubCommand::Resolve {
                request: rewritten,
                origin: ctx.origin,
                depth: ctx.depth + 1,
                reply: tx,
            })
            .await
            .is_ok();
        if !sent {
            return ApiResponse::from(&HubError::ShuttingDown);
        }
        return match rx.await {
            Ok(response) => response,
            Err(_) => ApiResponse::error("resolution aborted"),
        };
    }

    // 5. Approximation over the registered paths.
    if let Some((best, _score)) = best_match(
        &request.path,
        plan.candidates.iter().map(String::as_str),
        ctx.config.approximation_threshold,
    ) {
        let matched = best.to_string();
        let (tx, rx) = oneshot::channel();
        let sent = ctx
            .tx
            .send(HubCommand::Lookup {
                path: matched.clone(),
                reply: tx,
            })
            .await
            .is_ok();
        if sent {
            if let Ok(Some(target)) = rx.await {
                let mut response = invoke_target(target, request.clone()).await;
                // Approximation reports only successful resolution; it
                // never masks a handler failure as an approximation.
                if response.status == ResponseStatus::Success {
                    response.status = ResponseStatus::Approximated;
                    response
                        .metadata
                        .insert(meta::MATCHED_PATH.into(), matched);
                }
                return response;
            }
        }
    }

    // 6. Nothing matched.
    ApiResponse::not_found(&request.path)
}

async fn invoke_target(target: TargetRef, request: ApiRequest) -> ApiResponse {
    match target {
        TargetRef::Handler(h) => match h(request).await {
            Ok(payload) => ApiResponse::success(payload),
            Err(err) => ApiResponse::from(&err),
        },
        TargetRef::Peer(peer) => peer
            .request(&request)
            .await
            .unwrap_or_else(|err| ApiResponse::from(&err)),
        TargetRef::Child(handle) => handle.resolve_from_parent(request).await,
    }
}

struct PublishPlan {
    interceptors: Vec<InterceptStep>,
    deliveries: Vec<Delivery>,
    parent: Option<ParentLink>,
}

/// Evaluate local gates in order; the first value short-circuits.
fn eval_local_gates(interceptors: &[InterceptStep], message: &Message) -> Option<Vec<u8>> {
    interceptors.iter().find_map(|step| match step {
        InterceptStep::Local(f) => f(message),
        InterceptStep::Remote(_) => None,
    })
}

/// Enqueue the message to every delivery target, in dispatch order.
/// Failed deliveries are dropped and counted, not retried.
fn fan_out(deliveries: &[Delivery], message: &Message, dropped: &DroppedCounter) {
    for delivery in deliveries {
        let delivered = match delivery {
            Delivery::Local(tx) => tx.try_send(message.clone()).is_ok(),
            Delivery::Remote(peer) => peer.try_deliver(message),
        };
        if !delivered {
            dropped.bump();
            tracing::warn!(topic = %message.topic, "subscriber delivery dropped");
        }
    }
}

/// Forward the message to the parent and return its intercept result.
async fn forward_up(
    parent: Option<ParentLink>,
    message: Message,
    timeout: Duration,
) -> Option<Vec<u8>> {
    match parent {
        Some(ParentLink::Local(handle)) => handle.publish(message).await.unwrap_or_default(),
        Some(ParentLink::Remote(peer)) => match peer.publish(&message, timeout).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(%err, "publish forward to parent failed");
                None
            }
        },
        None => None,
    }
}

/// The publish pipeline when a remote gate forces the whole thing off the
/// worker: interceptors (which short-circuit delivery at this hub and
/// above; hubs below have already delivered), fan-out, parent forward.
async fn run_publish(
    plan: PublishPlan,
    message: Message,
    timeout: Duration,
    dropped: DroppedCounter,
) -> Option<Vec<u8>> {
    for step in &plan.interceptors {
        let value = match step {
            InterceptStep::Local(f) => f(&message),
            InterceptStep::Remote(peer) => match peer.intercept(&message, timeout).await {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(%err, "remote interceptor unreachable, passing through");
                    None
                }
            },
        };
        if let Some(payload) = value {
            return Some(payload);
        }
    }

    fan_out(&plan.deliveries, &message, &dropped);
    forward_up(plan.parent, message, timeout).await
}
