//! The hub-side listener: accepts connections from remote nodes and child
//! hubs, gives each one a client id, and turns its frames into hub
//! commands. When a connection dies, everything that client registered is
//! removed from the hub (and, through deregistration notices, from every
//! ancestor that learned of it).

use std::net::SocketAddr;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;

use crate::{
    error::HubError,
    hub::{DownRoute, HubHandle},
    message::{meta, ApiResponse, ClientId},
    transport::{spawn_peer, tls, Inbound},
    wire::{
        Frame, FrameKind, InterceptorAckFrame, RegisterAckFrame, SubscribeAckFrame,
    },
};

/// Bind a listener and serve the hub on it. Returns the bound address and
/// the accept-loop task.
pub(crate) async fn bind_and_serve(
    hub: HubHandle,
    addr: &str,
    acceptor: Option<TlsAcceptor>,
) -> Result<(SocketAddr, JoinHandle<()>), HubError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| HubError::Transport(format!("bind {addr} failed: {e}")))?;
    let local = listener
        .local_addr()
        .map_err(|e| HubError::Transport(format!("local addr: {e}")))?;
    tracing::info!(%local, scope = %hub.scope(), tls = acceptor.is_some(), "hub listening");
    let task = tokio::spawn(accept_loop(hub, listener, acceptor));
    Ok((local, task))
}

async fn accept_loop(hub: HubHandle, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                continue;
            }
        };
        let hub = hub.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => {
                        let identity = stream
                            .get_ref()
                            .1
                            .peer_certificates()
                            .and_then(|certs| certs.first())
                            .map(tls::fingerprint);
                        let (read, write) = tokio::io::split(stream);
                        run_connection(hub, read, write, identity).await;
                    }
                    Err(err) => {
                        tracing::warn!(%peer_addr, %err, "tls accept failed, refusing connection");
                    }
                },
                None => {
                    let (read, write) = stream.into_split();
                    run_connection(hub, read, write, None).await;
                }
            }
        });
    }
}

async fn run_connection<R, W>(hub: HubHandle, read: R, write: W, identity: Option<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let client_id = ClientId::new();
    let depth = hub.config().outgoing_depth;
    let (in_tx, mut in_rx) = mpsc::channel(depth);
    let peer = spawn_peer(read, write, in_tx, identity.clone(), depth);
    if hub.client_connected(client_id, peer.clone()).await.is_err() {
        peer.close().await;
        return;
    }
    tracing::debug!(%client_id, identity = ?identity, "client connected");

    while let Some(inbound) = in_rx.recv().await {
        match inbound {
            Inbound::Request(mut request) => {
                if let Some(identity) = &identity {
                    request
                        .metadata
                        .insert(meta::AUTHENTICATED_IDENTITY.into(), identity.clone());
                }
                // A plain client request enters the hierarchy here; an
                // escalated one keeps the origin stamped by the child.
                if !request.metadata.contains_key(meta::ESCALATED_FROM) {
                    request.origin_hub_id = hub.hub_id();
                }
                let hub = hub.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    let request_id = request.request_id;
                    let response = hub.resolve_from_child(request).await;
                    let _ = peer.respond(request_id, &response).await;
                });
            }
            Inbound::Publish(publish) => {
                let hub = hub.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    let response = match hub.publish(publish.message).await {
                        Ok(Some(value)) => ApiResponse::intercepted(value),
                        Ok(None) => ApiResponse::success(Vec::new()),
                        Err(err) => ApiResponse::from(&err),
                    };
                    let _ = peer.respond(publish.publish_id, &response).await;
                });
            }
            Inbound::Register(frame) => {
                let result = if frame.remove {
                    hub.deregistration_notice(frame.path, client_id)
                        .await
                        .map_err(|e| e.to_string())
                } else {
                    hub.registration_notice(
                        frame.path,
                        frame.metadata,
                        DownRoute::Client(client_id),
                        client_id,
                    )
                    .await
                    .map_err(|e| e.to_string())
                };
                let ack = Frame::encode_payload(
                    FrameKind::RegisterAck,
                    &RegisterAckFrame {
                        txn: frame.txn,
                        result,
                    },
                );
                if let Ok(ack) = ack {
                    let _ = peer.send(ack).await;
                }
            }
            Inbound::Subscribe(frame) => {
                let result = match frame.remove {
                    Some(id) => hub
                        .unsubscribe(id)
                        .await
                        .map(|_| id)
                        .map_err(|e| e.to_string()),
                    None => hub
                        .subscribe_remote(frame.pattern, frame.priority, client_id)
                        .await
                        .map_err(|e| e.to_string()),
                };
                let ack = Frame::encode_payload(
                    FrameKind::SubscribeAck,
                    &SubscribeAckFrame {
                        txn: frame.txn,
                        result,
                    },
                );
                if let Ok(ack) = ack {
                    let _ = peer.send(ack).await;
                }
            }
            Inbound::RegisterInterceptor(frame) => {
                let result = match frame.remove {
                    Some(id) => hub
                        .deregister_interceptor(id)
                        .await
                        .map(|_| id)
                        .map_err(|e| e.to_string()),
                    None => hub
                        .register_remote_interceptor(frame.pattern, frame.priority, client_id)
                        .await
                        .map_err(|e| e.to_string()),
                };
                let ack = Frame::encode_payload(
                    FrameKind::InterceptorAck,
                    &InterceptorAckFrame {
                        txn: frame.txn,
                        result,
                    },
                );
                if let Ok(ack) = ack {
                    let _ = peer.send(ack).await;
                }
            }
            Inbound::Intercept(frame) => {
                // Intercept invocations only flow hub→client.
                tracing::warn!(id = %frame.invocation_id, "unexpected intercept frame from client");
            }
        }
    }

    tracing::debug!(%client_id, "client disconnected");
    let _ = hub.disconnect_client(client_id).await;
    peer.close().await;
}
