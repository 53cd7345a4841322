//! # network-hub
//!
//! A hierarchical request/publish hub. Participants ("nodes") register named
//! endpoints and message subscriptions against their thread-scope hub;
//! requests and messages escalate up a Thread → Process → Machine → Network
//! chain until they resolve, are intercepted, or have been delivered to every
//! matching subscriber.
//!
//! The pieces, bottom up:
//!
//! * [`registry`], [`subscriptions`], [`matching`]: the per-hub tables and
//!   the path/pattern machinery, including similarity-based approximation.
//! * [`hub`]: the routing engine at one scope, covering request resolution
//!   (intercept → local → escalate → fallback → approximate), publish
//!   fan-out, and the single-worker ownership model.
//! * [`wire`] and [`transport`]: the length-prefixed frame codec and the
//!   peer channels (TCP, optionally TLS) that connect hubs across scopes.
//! * [`node`] and [`remote`]: the in-process and over-the-wire client
//!   façades.
//! * [`proxy`]: method interception for plain callables.
//! * [`supervisor`]: owns the hubs of one process and wires up the chain.
//!
//! Registrations are ephemeral: a restarted hub starts empty.

pub mod config;
pub mod error;
pub mod hub;
pub mod matching;
pub mod message;
pub mod node;
pub mod proxy;
pub mod registry;
pub mod remote;
pub mod subscriptions;
pub mod supervisor;
pub mod transport;
pub mod wire;

pub use config::HubConfig;
pub use error::HubError;
pub use hub::{Hub, HubHandle, HubState, HubStatus};
pub use message::{
    ApiRequest, ApiResponse, ClientId, HubId, InterceptorId, Message, Metadata, RequestId,
    ResponseStatus, Scope, SubscriptionId,
};
pub use node::Node;
pub use proxy::{InterceptableCallable, InvocationContext, MethodDescriptor, TypeIdentity};
pub use remote::RemoteNode;
pub use supervisor::Supervisor;
