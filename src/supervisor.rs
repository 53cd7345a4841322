//! Owns the hubs of one process and wires up the scope chain.
//!
//! The supervisor replaces any ambient "current hub" state: callers hold a
//! supervisor, ask it for scope-keyed handles, and pass those handles on
//! explicitly. It creates hubs on demand, links each new hub beneath the
//! nearest existing ancestor scope (and adopts an orphaned chain head below
//! it), serves listeners for hubs that accept remote peers, maintains the
//! upstream link to a remote parent, and tears everything down leaves-first.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    config::HubConfig,
    error::HubError,
    hub::{Hub, HubHandle, ParentLink},
    message::Scope,
    transport::{server, tcp::Connector, tls, Inbound, Peer},
};

/// Process-wide hub owner.
pub struct Supervisor {
    config: Arc<HubConfig>,
    hubs: BTreeMap<Scope, HubHandle>,
    listeners: Vec<JoinHandle<()>>,
    links: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// A supervisor with the given configuration.
    pub fn new(config: HubConfig) -> Self {
        Self {
            config: Arc::new(config),
            hubs: BTreeMap::new(),
            listeners: Vec::new(),
            links: Vec::new(),
        }
    }

    /// The configuration hubs are spawned with.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The hub at `scope`, if one exists already.
    pub fn get(&self, scope: Scope) -> Option<HubHandle> {
        self.hubs.get(&scope).cloned()
    }

    /// Get or create the hub at `scope`, linking it into the chain.
    pub async fn hub(&mut self, scope: Scope) -> Result<HubHandle, HubError> {
        if let Some(handle) = self.hubs.get(&scope) {
            return Ok(handle.clone());
        }
        let handle = Hub::spawn(scope, (*self.config).clone());

        // Link beneath the nearest existing ancestor scope.
        let mut cursor = scope;
        while let Some(up) = cursor.parent() {
            if let Some(parent) = self.hubs.get(&up) {
                parent.attach_child(&handle).await?;
                break;
            }
            cursor = up;
        }

        // Adopt the nearest chain head below, if it has no parent yet.
        for below in Scope::ALL.iter().rev().copied().filter(|s| *s < scope) {
            if let Some(child) = self.hubs.get(&below) {
                if !child.status().await?.has_parent {
                    handle.attach_child(child).await?;
                }
                break;
            }
        }

        self.hubs.insert(scope, handle.clone());
        Ok(handle)
    }

    /// Serve the hub at `scope` on the configured bind address, returning
    /// the bound socket address.
    pub async fn serve(&mut self, scope: Scope) -> Result<SocketAddr, HubError> {
        let hub = self.hub(scope).await?;
        let acceptor = tls::acceptor(&self.config)?;
        let addr = format!("{}:{}", self.config.bind_address, self.config.bind_port);
        let (local, task) = server::bind_and_serve(hub, &addr, acceptor).await?;
        self.listeners.push(task);
        Ok(local)
    }

    /// Attach the hub at `scope` beneath a remote parent, keeping the link
    /// alive across reconnects.
    pub async fn connect_upstream(
        &mut self,
        scope: Scope,
        addr: impl Into<String>,
    ) -> Result<(), HubError> {
        let hub = self.hub(scope).await?;
        let mut connector = Connector::from_config(addr.into(), self.config.clone())?;
        let (in_tx, in_rx) = mpsc::channel(self.config.outgoing_depth);
        let peer = connector.establish(in_tx).await?;
        hub.set_parent(ParentLink::Remote(peer.clone())).await?;
        self.links
            .push(tokio::spawn(upstream_link(hub, connector, peer, in_rx)));
        Ok(())
    }

    /// Drain every hub leaves-first, then stop listeners and links.
    pub async fn shutdown(mut self) {
        for scope in Scope::ALL {
            if let Some(hub) = self.hubs.get(&scope) {
                if let Err(err) = hub.drain().await {
                    tracing::warn!(%scope, %err, "hub drain failed");
                }
            }
        }
        for task in self.listeners.drain(..) {
            task.abort();
        }
        for task in self.links.drain(..) {
            task.abort();
        }
    }
}

/// Serves parent-initiated traffic on an upstream link and re-establishes
/// the channel when it drops. After the retry budget is spent the link
/// stays down; pending requests have already been failed by the peer's
/// stop signal.
async fn upstream_link(
    hub: HubHandle,
    mut connector: Connector,
    mut peer: Peer,
    mut inbound: mpsc::Receiver<Inbound>,
) {
    loop {
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(Inbound::Request(request)) => {
                        let hub = hub.clone();
                        let peer = peer.clone();
                        tokio::spawn(async move {
                            let request_id = request.request_id;
                            let response = hub.resolve_from_parent(request).await;
                            let _ = peer.respond(request_id, &response).await;
                        });
                    }
                    Some(_) => {
                        tracing::warn!("unexpected frame on upstream link");
                    }
                    None => break,
                },
                _ = peer.closed() => break,
            }
        }

        tracing::warn!(state = ?connector.state(), "upstream link lost, reconnecting");
        let (in_tx, in_rx) = mpsc::channel(hub.config().outgoing_depth);
        match connector.establish(in_tx).await {
            Ok(new_peer) => {
                inbound = in_rx;
                peer = new_peer.clone();
                if hub.parent_reconnected(new_peer).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::error!(%err, "upstream link closed, retry budget spent");
                return;
            }
        }
    }
}
