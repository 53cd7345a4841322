//! The in-process client façade.
//!
//! A [`Node`] binds a participant to its thread-scope hub: it owns a client
//! id, stamps it on everything it sends, and delegates to the hub handle.
//! Nodes have no state machine beyond connected/disconnected; disconnecting
//! removes every registration the node made, at this hub and (through
//! deregistration notices) at every ancestor that learned of them.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    error::HubError,
    hub::HubHandle,
    message::{
        handler, ApiRequest, ApiResponse, ClientId, InterceptorId, Message, Metadata,
        SubscriptionId,
    },
    proxy::{InterceptableCallable, MethodInterceptorFn, TypeIdentity},
    wire::WireError,
};

/// A participant attached to a thread-scope hub.
pub struct Node {
    client_id: ClientId,
    hub: HubHandle,
    connected: AtomicBool,
}

impl Node {
    /// Attach a fresh node to a hub.
    pub fn attach(hub: &HubHandle) -> Self {
        Self {
            client_id: ClientId::new(),
            hub: hub.clone(),
            connected: AtomicBool::new(true),
        }
    }

    /// This node's client id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// The hub this node is attached to.
    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Is the node still connected?
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn ensure_connected(&self) -> Result<(), HubError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(HubError::Transport("node is disconnected".into()))
        }
    }

    /// Register an endpoint handler under this node's ownership.
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
        self.ensure_connected()?;
        self.hub
            .register_api(path, handler(f), metadata, self.client_id)
            .await
    }

    /// Register an endpoint that always answers with a fixed payload.
    pub async fn register_static(
        &self,
        path: impl Into<String>,
        metadata: Metadata,
        payload: Vec<u8>,
    ) -> Result<(), HubError> {
        self.register_api(path, metadata, move |_req| {
            let payload = payload.clone();
            async move { Ok(payload) }
        })
        .await
    }

    /// Remove an endpoint registration. Idempotent.
    pub async fn deregister_api(&self, path: impl Into<String>) -> Result<(), HubError> {
        self.ensure_connected()?;
        self.hub.deregister_api(path).await
    }

    /// Call an endpoint with typed request and response bodies.
    pub async fn call_api<T, R>(&self, path: impl Into<String>, body: &T) -> Result<R, HubError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let payload = postcard::to_stdvec(body).map_err(|e| HubError::from(WireError::Codec(e)))?;
        let response = self.call_api_raw(path, payload, Metadata::new()).await?;
        let payload = response.into_result()?;
        postcard::from_bytes(&payload).map_err(|e| HubError::from(WireError::Codec(e)))
    }

    /// Call an endpoint and get the full response, metadata included.
    pub async fn call_api_raw(
        &self,
        path: impl Into<String>,
        payload: Vec<u8>,
        metadata: Metadata,
    ) -> Result<ApiResponse, HubError> {
        self.ensure_connected()?;
        let request = ApiRequest::new(
            path,
            payload,
            metadata,
            self.client_id,
            self.hub.hub_id(),
        );
        Ok(self.hub.handle_request(request).await)
    }

    /// Publish a typed message. Returns the intercept result from the
    /// nearest intercepting hub, or `None`.
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
        self.ensure_connected()?;
        self.hub.publish(message).await
    }

    /// Subscribe a callback to a topic pattern.
    pub async fn subscribe(
        &self,
        pattern: impl Into<String>,
        priority: i32,
        callback: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<SubscriptionId, HubError> {
        self.ensure_connected()?;
        self.hub
            .subscribe(pattern, priority, Arc::new(callback), self.client_id)
            .await
    }

    /// Remove a subscription.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, HubError> {
        self.hub.unsubscribe(id).await
    }

    /// Register a message interceptor.
    pub async fn register_interceptor(
        &self,
        pattern: impl Into<String>,
        priority: i32,
        interceptor: impl Fn(&Message) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Result<InterceptorId, HubError> {
        self.ensure_connected()?;
        self.hub
            .register_interceptor(pattern, priority, Arc::new(interceptor), self.client_id)
            .await
    }

    /// Remove a message interceptor.
    pub async fn deregister_interceptor(&self, id: InterceptorId) -> Result<bool, HubError> {
        self.hub.deregister_interceptor(id).await
    }

    /// Register a method interceptor for `(type_token, method)`.
    pub async fn register_method_interceptor(
        &self,
        type_token: impl Into<String>,
        method: impl Into<String>,
        priority: i32,
        interceptor: MethodInterceptorFn,
    ) -> Result<InterceptorId, HubError> {
        self.ensure_connected()?;
        self.hub
            .register_method_interceptor(type_token, method, priority, interceptor, self.client_id)
            .await
    }

    /// Remove a method interceptor.
    pub async fn deregister_method_interceptor(
        &self,
        id: InterceptorId,
    ) -> Result<bool, HubError> {
        self.hub.deregister_method_interceptor(id).await
    }

    /// Wrap a callable so invocations route through the hub's method
    /// interceptors.
    pub fn interceptable<Args, Ret>(
        &self,
        identity: TypeIdentity,
        method_name: &'static str,
        original: impl Fn(&Args) -> Ret + Send + Sync + 'static,
    ) -> InterceptableCallable<Args, Ret>
    where
        Args: Send + Sync + 'static,
        Ret: 'static,
    {
        InterceptableCallable::new(self.hub.clone(), identity, method_name, original)
    }

    /// Disconnect the node: everything it registered is removed from the
    /// hub, and further operations fail.
    pub async fn disconnect(&self) -> Result<(), HubError> {
        self.connected.store(false, Ordering::Relaxed);
        self.hub.disconnect_client(self.client_id).await
    }
}
