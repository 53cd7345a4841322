//! Outbound connections with bounded retry.
//!
//! A [`Connector`] owns the dial parameters for one upstream address and
//! walks the channel lifecycle: `Connecting` on first use, `Reconnecting`
//! after a drop, `Closed` once the retry budget (`reconnect_max_attempts`
//! spaced by `reconnect_interval_sec`) is spent. Pending requests on a dead
//! channel fail with a transport error when the peer's stop signal fires.

use std::sync::Arc;

use tokio::{net::TcpStream, sync::mpsc};

use crate::{
    config::HubConfig,
    error::HubError,
    transport::{
        spawn_peer,
        tls::{self, TlsClientContext},
        ChannelState, Inbound, Peer,
    },
};

/// Dials one address, with TLS when the config calls for it.
pub(crate) struct Connector {
    addr: String,
    tls: Option<TlsClientContext>,
    config: Arc<HubConfig>,
    state: ChannelState,
}

impl Connector {
    /// Build a connector from the config: TLS when a trust anchor is
    /// configured, plain TCP only in explicit insecure mode.
    pub(crate) fn from_config(addr: String, config: Arc<HubConfig>) -> Result<Self, HubError> {
        let tls = if config.tls_cert_path.is_some() || !config.insecure {
            let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr.as_str());
            Some(tls::client_context(host, &config)?)
        } else {
            None
        };
        Ok(Self {
            addr,
            tls,
            config,
            state: ChannelState::Disconnected,
        })
    }

    /// Current lifecycle state.
    pub(crate) fn state(&self) -> ChannelState {
        self.state
    }

    /// Establish (or re-establish) the channel, retrying up to the
    /// configured attempt budget with the reconnect interval between
    /// attempts.
    pub(crate) async fn establish(
        &mut self,
        inbound: mpsc::Sender<Inbound>,
    ) -> Result<Peer, HubError> {
        self.state = match self.state {
            ChannelState::Disconnected => ChannelState::Connecting,
            _ => ChannelState::Reconnecting,
        };
        let attempts = self.config.reconnect_max_attempts.max(1);
        let mut last_err = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.reconnect_interval()).await;
            }
            match self.connect_once(inbound.clone()).await {
                Ok(peer) => {
                    self.state = ChannelState::Connected;
                    tracing::debug!(addr = %self.addr, attempt, "channel connected");
                    return Ok(peer);
                }
                Err(err) => {
                    tracing::warn!(addr = %self.addr, attempt, %err, "connect attempt failed");
                    last_err = Some(err);
                }
            }
        }
        self.state = ChannelState::Closed;
        Err(last_err
            .unwrap_or_else(|| HubError::Transport(format!("cannot reach {}", self.addr))))
    }

    async fn connect_once(&self, inbound: mpsc::Sender<Inbound>) -> Result<Peer, HubError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| HubError::Transport(format!("connect to {} failed: {e}", self.addr)))?;
        match &self.tls {
            Some(ctx) => {
                let stream = ctx
                    .connector
                    .connect(ctx.server_name.clone(), stream)
                    .await
                    .map_err(|e| HubError::Transport(format!("tls handshake failed: {e}")))?;
                let (read, write) = tokio::io::split(stream);
                Ok(spawn_peer(
                    read,
                    write,
                    inbound,
                    None,
                    self.config.outgoing_depth,
                ))
            }
            None => {
                let (read, write) = stream.into_split();
                Ok(spawn_peer(
                    read,
                    write,
                    inbound,
                    None,
                    self.config.outgoing_depth,
                ))
            }
        }
    }
}
