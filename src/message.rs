//! The hub data model: scopes, identifiers, requests, responses and
//! published messages, plus the callable contracts handlers, subscribers and
//! interceptors are registered under.
//!
//! Bodies are opaque `Vec<u8>` payloads. Typed callers serialize at the edge
//! with `postcard` (see [`crate::node::Node::call_api`]); the hub itself
//! never inspects payload bytes.

use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HubError;

/// Well-known metadata keys written or consumed by the hub.
pub mod meta {
    /// Alternate path tried after parent escalation fails.
    pub const FALLBACK: &str = "fallback";
    /// The path the caller originally asked for, set on fallback rewrites.
    pub const ORIGINAL_PATH: &str = "original_path";
    /// The registered path an approximated request was routed to.
    pub const MATCHED_PATH: &str = "matched_path";
    /// Id of the hub a request escalated from.
    pub const ESCALATED_FROM: &str = "escalated_from";
    /// Handler failure message on `Error`-status responses.
    pub const ERROR: &str = "error";
    /// Set alongside `error` when the failure was a deadline expiry.
    pub const TIMED_OUT: &str = "timed_out";
    /// Set alongside `error` when an interceptor gate rejected the call.
    pub const POLICY: &str = "policy";
    /// TLS peer identity stamped on requests arriving over a verified channel.
    pub const AUTHENTICATED_IDENTITY: &str = "authenticated_identity";
    /// Absolute request deadline, milliseconds since the unix epoch.
    /// Inherited through escalation and fallback rewrites.
    pub const DEADLINE_MS: &str = "deadline_ms";
    /// Entries carrying this key are not announced to the parent hub.
    pub const LOCAL_ONLY: &str = "local_only";
}

macro_rules! uuid_id {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(Uuid);

        impl $name {
            /// Mint a fresh random id.
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

uuid_id! {
    /// Unique id of a hub, one per scope instance.
    HubId
}
uuid_id! {
    /// Unique id of a participant: an in-process node, a remote node, or a
    /// child hub speaking to its parent.
    ClientId
}
uuid_id! {
    /// Correlation id carried by a request across every hop it takes.
    RequestId
}
uuid_id! {
    /// Handle to a registered subscription.
    SubscriptionId
}
uuid_id! {
    /// Handle to a registered interceptor (message or method).
    InterceptorId
}

/// The placement of a hub in the hierarchy. Determines which transport its
/// parent link uses; `Thread` is the lowest scope, `Network` the highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    /// One hub per participant thread; nodes attach here.
    Thread,
    /// Shared by all threads of a process.
    Process,
    /// Shared by all processes of a machine.
    Machine,
    /// The root scope, reachable over the network.
    Network,
}

impl Scope {
    /// All scopes, lowest first.
    pub const ALL: [Scope; 4] = [Scope::Thread, Scope::Process, Scope::Machine, Scope::Network];

    /// The scope a hub of this scope escalates to, if any.
    pub fn parent(&self) -> Option<Scope> {
        match self {
            Scope::Thread => Some(Scope::Process),
            Scope::Process => Some(Scope::Machine),
            Scope::Machine => Some(Scope::Network),
            Scope::Network => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::Thread => "thread",
            Scope::Process => "process",
            Scope::Machine => "machine",
            Scope::Network => "network",
        };
        f.write_str(name)
    }
}

/// String key/value side data. A `BTreeMap` so the wire encoding is stable.
pub type Metadata = BTreeMap<String, String>;

/// A request for a named endpoint. Immutable once created; escalation and
/// fallback rewrites operate on copies and preserve `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Correlation id, preserved across every hop.
    pub request_id: RequestId,
    /// The endpoint path being addressed.
    pub path: String,
    /// Opaque request body.
    pub payload: Vec<u8>,
    /// Side data; see [`meta`] for the keys the hub itself reads and writes.
    pub metadata: Metadata,
    /// The participant that issued the request.
    pub sender_id: ClientId,
    /// The hub at which the request entered the hierarchy.
    pub origin_hub_id: HubId,
}

impl ApiRequest {
    /// Build a request with a fresh correlation id.
    pub fn new(
        path: impl Into<String>,
        payload: Vec<u8>,
        metadata: Metadata,
        sender_id: ClientId,
        origin_hub_id: HubId,
    ) -> Self {
        Self {
            request_id: RequestId::new(),
            path: path.into(),
            payload,
            metadata,
            sender_id,
            origin_hub_id,
        }
    }

    /// The absolute deadline carried in metadata, if any.
    pub fn deadline_ms(&self) -> Option<u64> {
        self.metadata.get(meta::DEADLINE_MS)?.parse().ok()
    }
}

/// How a request resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// A handler ran and returned a payload.
    Success,
    /// Nothing matched after all resolution steps.
    NotFound,
    /// The handler (or the hub on its behalf) failed; details in metadata.
    Error,
    /// An interceptor short-circuited the request.
    Intercepted,
    /// A similar registered path was invoked instead; see
    /// `metadata["matched_path"]`.
    Approximated,
}

/// The single response produced for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Outcome; `Intercepted` and `Approximated` are set iff those
    /// resolution paths were taken.
    pub status: ResponseStatus,
    /// Opaque response body.
    pub payload: Vec<u8>,
    /// Side data, including error details for `Error` responses.
    pub metadata: Metadata,
}

impl ApiResponse {
    /// A `Success` response carrying `payload`.
    pub fn success(payload: Vec<u8>) -> Self {
        Self {
            status: ResponseStatus::Success,
            payload,
            metadata: Metadata::new(),
        }
    }

    /// A `NotFound` response for `path`.
    pub fn not_found(path: &str) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(meta::ERROR.into(), format!("no endpoint matched path `{path}`"));
        Self {
            status: ResponseStatus::NotFound,
            payload: Vec::new(),
            metadata,
        }
    }

    /// An `Error` response with `message` preserved in metadata.
    pub fn error(message: impl Into<String>) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(meta::ERROR.into(), message.into());
        Self {
            status: ResponseStatus::Error,
            payload: Vec::new(),
            metadata,
        }
    }

    /// An `Error` response for an expired deadline.
    pub fn timed_out(elapsed: Duration) -> Self {
        let mut resp = Self::error(format!("request timed out after {elapsed:?}"));
        resp.metadata.insert(meta::TIMED_OUT.into(), "true".into());
        resp
    }

    /// An `Intercepted` response carrying the interceptor's value.
    pub fn intercepted(payload: Vec<u8>) -> Self {
        Self {
            status: ResponseStatus::Intercepted,
            payload,
            metadata: Metadata::new(),
        }
    }

    /// Convert into a payload result, rehydrating failure statuses into
    /// [`HubError`]s. `Intercepted` and `Approximated` count as success.
    pub fn into_result(self) -> Result<Vec<u8>, HubError> {
        match self.status {
            ResponseStatus::Success
            | ResponseStatus::Intercepted
            | ResponseStatus::Approximated => Ok(self.payload),
            ResponseStatus::NotFound => Err(HubError::NotFound(
                self.metadata.get(meta::ERROR).cloned().unwrap_or_default(),
            )),
            ResponseStatus::Error => {
                let message = self.metadata.get(meta::ERROR).cloned().unwrap_or_default();
                if self.metadata.contains_key(meta::TIMED_OUT) {
                    Err(HubError::Timeout(Duration::ZERO))
                } else if self.metadata.contains_key(meta::POLICY) {
                    Err(HubError::Policy(message))
                } else {
                    Err(HubError::Handler(message))
                }
            }
        }
    }
}

impl From<&HubError> for ApiResponse {
    fn from(err: &HubError) -> Self {
        match err {
            HubError::NotFound(path) => ApiResponse::not_found(path),
            HubError::Timeout(elapsed) => ApiResponse::timed_out(*elapsed),
            HubError::Policy(message) => {
                let mut resp = ApiResponse::error(message.clone());
                resp.metadata.insert(meta::POLICY.into(), "true".into());
                resp
            }
            other => ApiResponse::error(other.to_string()),
        }
    }
}

/// A published message. Also the shape interceptors see when a *request* is
/// probed for interception, with `topic` set to the request path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The topic the message was published on.
    pub topic: String,
    /// Opaque message body.
    pub payload: Vec<u8>,
    /// Side data.
    pub metadata: Metadata,
    /// The participant that published the message.
    pub sender_id: ClientId,
    /// Milliseconds since the unix epoch, assigned at creation.
    pub timestamp_ms: u64,
}

impl Message {
    /// Build a message stamped with the current time.
    pub fn new(
        topic: impl Into<String>,
        payload: Vec<u8>,
        metadata: Metadata,
        sender_id: ClientId,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload,
            metadata,
            sender_id,
            timestamp_ms: now_ms(),
        }
    }

    /// Reframe a request as a message for interceptor evaluation.
    pub fn from_request(request: &ApiRequest) -> Self {
        Self {
            topic: request.path.clone(),
            payload: request.payload.clone(),
            metadata: request.metadata.clone(),
            sender_id: request.sender_id,
            timestamp_ms: now_ms(),
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The future a handler returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, HubError>> + Send>>;

/// A registered endpoint handler. An `Err` becomes an `Error`-status
/// response with the message under `metadata["error"]`.
pub type ApiHandler = Arc<dyn Fn(ApiRequest) -> HandlerFuture + Send + Sync>;

/// A fire-and-forget topic subscriber. Return values are unobservable.
pub type SubscriberFn = Arc<dyn Fn(Message) + Send + Sync>;

/// A message interceptor. Returning `Some` short-circuits the publish or
/// request with that value; `None` means "not intercepted, continue".
pub type InterceptorFn = Arc<dyn Fn(&Message) -> Option<Vec<u8>> + Send + Sync>;

/// Wrap an async closure into an [`ApiHandler`].
pub fn handler<F, Fut>(f: F) -> ApiHandler
where
    F: Fn(ApiRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, HubError>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_chain_terminates_at_network() {
        assert_eq!(Scope::Thread.parent(), Some(Scope::Process));
        assert_eq!(Scope::Process.parent(), Some(Scope::Machine));
        assert_eq!(Scope::Machine.parent(), Some(Scope::Network));
        assert_eq!(Scope::Network.parent(), None);
    }

    #[test]
    fn error_response_round_trips_through_result() {
        let resp = ApiResponse::error("boom");
        match resp.into_result() {
            Err(HubError::Handler(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected: {other:?}"),
        }

        let resp = ApiResponse::timed_out(Duration::from_secs(1));
        assert!(matches!(resp.into_result(), Err(HubError::Timeout(_))));

        let resp = ApiResponse::not_found("/missing");
        assert!(matches!(resp.into_result(), Err(HubError::NotFound(_))));
    }

    #[test]
    fn messages_are_stamped_at_creation() {
        let msg = Message::new("/t", vec![], Metadata::new(), ClientId::new());
        assert!(msg.timestamp_ms > 0);
    }
}
