//! Tunnel
//!
//! One tunnel session: a relay instance plus the routes installed on its
//! behalf. Start-up runs in a fixed order and rolls back on failure:
//!
//! ```text
//!   validate ──▶ UDP check ──▶ spawn relay ──▶ install routes ──▶ Running
//!                                   │                 │
//!                                   ▼ fail            ▼ fail
//!                                 Failed ◀── terminate relay ◀── remove routes
//! ```
//!
//! A tunnel is never restarted; the controller builds a fresh one instead.

use crate::config::ServerConfiguration;
use crate::error::{ErrorCode, ToErrorCode};
use crate::health::HealthProbe;
use crate::relay::{Relay, RelayHandle};
use crate::routing::RoutingTable;
use crate::subnet::NetworkSettings;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Built, not started
    Created,
    /// Start-up in progress
    Starting,
    /// Relay running and routes installed
    Running,
    /// Tear-down in progress
    Stopping,
    /// Torn down
    Stopped,
    /// Start-up failed and was rolled back
    Failed(ErrorCode),
}

impl TunnelState {
    pub fn is_running(&self) -> bool {
        matches!(self, TunnelState::Running)
    }
}

/// A single tunnel session
pub struct Tunnel {
    config: Arc<ServerConfiguration>,
    relay: Arc<dyn Relay>,
    routing: Arc<dyn RoutingTable>,
    state: TunnelState,
    /// Relay instance, set as soon as the spawn returns
    handle: Option<RelayHandle>,
    /// Settings handed to the routing table, set before the install starts
    settings: Option<NetworkSettings>,
}

impl Tunnel {
    /// Create a tunnel for a server
    pub fn new(
        config: Arc<ServerConfiguration>,
        relay: Arc<dyn Relay>,
        routing: Arc<dyn RoutingTable>,
    ) -> Self {
        Self {
            config,
            relay,
            routing,
            state: TunnelState::Created,
            handle: None,
            settings: None,
        }
    }

    pub fn config(&self) -> &Arc<ServerConfiguration> {
        &self.config
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Host app's tunnel id
    pub fn id(&self) -> Option<&str> {
        self.config.id.as_deref()
    }

    /// Bring the tunnel up
    ///
    /// On failure every completed step is undone and the state becomes
    /// `Failed(code)`.
    pub async fn start(&mut self) -> Result<(), ErrorCode> {
        if self.state != TunnelState::Created {
            warn!("Tunnel start ignored in state {:?}", self.state);
            return Err(ErrorCode::Undefined);
        }
        self.state = TunnelState::Starting;
        info!("Starting tunnel to {}", self.config.endpoint());

        if let Err(e) = self.config.validate() {
            warn!("Rejected server configuration: {}", e);
            return self.fail(e.error_code());
        }

        // Must be refused before any routing change
        if self.config.udp_required && !self.relay.udp_available(&self.config) {
            warn!("UDP forwarding required but the relay cannot provide it");
            return self.fail(ErrorCode::UdpRelayNotEnabled);
        }

        let handle = match self.relay.spawn(&self.config).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Relay start failed: {}", e);
                return self.fail(e.error_code());
            }
        };
        self.handle = Some(handle);

        let local = self.routing.local_addresses().await;
        let settings = NetworkSettings::for_remote(self.config.host.clone(), &local);
        debug!("Network settings: {:?}", settings);
        self.settings = Some(settings.clone());

        if let Err(e) = self.routing.install_routes(&settings).await {
            warn!("Route install failed: {}", e);
            let code = e.error_code();
            self.rollback().await;
            return self.fail(code);
        }

        self.state = TunnelState::Running;
        info!("Tunnel running ({} via {})", self.config.endpoint(), settings.address);
        Ok(())
    }

    /// Tear the tunnel down. Safe to call in any state, any number of times.
    pub async fn stop(&mut self) {
        if self.state == TunnelState::Stopped {
            return;
        }
        self.state = TunnelState::Stopping;
        self.rollback().await;
        self.state = TunnelState::Stopped;
        debug!("Tunnel to {} stopped", self.config.endpoint());
    }

    /// Relay alive and routes present
    pub async fn is_healthy(&self) -> bool {
        match self.probe() {
            Some(probe) => probe.run().await,
            None => false,
        }
    }

    /// Snapshot of the health check that can run on another task
    pub fn probe(&self) -> Option<HealthProbe> {
        if !self.state.is_running() {
            return None;
        }
        let handle = self.handle.clone()?;
        let settings = self.settings.clone()?;
        Some(HealthProbe::new(
            self.relay.clone(),
            self.routing.clone(),
            handle,
            settings,
        ))
    }

    fn fail(&mut self, code: ErrorCode) -> Result<(), ErrorCode> {
        self.state = TunnelState::Failed(code);
        Err(code)
    }

    /// Remove routes, then terminate the relay; errors are logged only
    async fn rollback(&mut self) {
        if let Some(settings) = self.settings.take() {
            if let Err(e) = self.routing.remove_routes(&settings).await {
                warn!("Failed to remove routes: {}", e);
            }
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.relay.terminate(&handle).await {
                warn!("Failed to terminate relay {}: {}", handle.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayError;
    use crate::routing::RouteError;
    use crate::testing::{FakeRelay, FakeRoutes, fakes, server};

    fn tunnel(config: ServerConfiguration, relay: &Arc<FakeRelay>, routes: &Arc<FakeRoutes>) -> Tunnel {
        Tunnel::new(Arc::new(config), relay.clone(), routes.clone())
    }

    #[tokio::test]
    async fn test_start_then_stop_leaves_nothing() {
        let (relay, routes) = fakes();
        let mut tunnel = tunnel(server(), &relay, &routes);

        tunnel.start().await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Running);
        assert!(tunnel.is_healthy().await);
        assert_eq!(tunnel.id(), Some("tunnel-1"));

        tunnel.stop().await;
        assert_eq!(tunnel.state(), TunnelState::Stopped);
        assert_eq!(relay.running_count(), 0);
        assert!(!routes.is_installed());
        assert_eq!(
            relay.log.events(),
            ["relay.spawn", "routes.install", "routes.remove", "relay.terminate"]
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (relay, routes) = fakes();
        let mut tunnel = tunnel(server(), &relay, &routes);

        // Never started
        tunnel.stop().await;
        tunnel.stop().await;
        assert_eq!(tunnel.state(), TunnelState::Stopped);
        assert!(relay.log.events().is_empty());

        let mut tunnel = Tunnel::new(Arc::new(server()), relay.clone(), routes.clone());
        tunnel.start().await.unwrap();
        tunnel.stop().await;
        tunnel.stop().await;
        assert_eq!(relay.log.events().iter().filter(|e| **e == "relay.terminate").count(), 1);
    }

    #[tokio::test]
    async fn test_route_failure_rolls_back_in_reverse() {
        let (relay, routes) = fakes();
        routes.fail_next_install(RouteError::ProxyConfiguration("hook exited 1".into()));
        let mut tunnel = tunnel(server(), &relay, &routes);

        assert_eq!(tunnel.start().await, Err(ErrorCode::ConfigureSystemProxyFailure));
        assert_eq!(
            tunnel.state(),
            TunnelState::Failed(ErrorCode::ConfigureSystemProxyFailure)
        );
        assert_eq!(
            relay.log.events(),
            ["relay.spawn", "routes.install", "routes.remove", "relay.terminate"]
        );
        assert_eq!(relay.running_count(), 0);
        assert!(!routes.is_installed());
    }

    #[tokio::test]
    async fn test_route_permission_codes() {
        let (relay, routes) = fakes();
        routes.fail_next_install(RouteError::EntitlementMissing);
        let mut first = tunnel(server(), &relay, &routes);
        assert_eq!(first.start().await, Err(ErrorCode::VpnPermissionNotGranted));

        routes.fail_next_install(RouteError::UnsupportedTable("no ipv4 table".into()));
        let mut second = tunnel(server(), &relay, &routes);
        assert_eq!(second.start().await, Err(ErrorCode::UnsupportedRoutingTable));
    }

    #[tokio::test]
    async fn test_route_hook_io_failure_rolls_back() {
        let (relay, routes) = fakes();
        routes.fail_next_install(RouteError::Io("route-up: No such file or directory".into()));
        let mut tunnel = tunnel(server(), &relay, &routes);

        assert_eq!(tunnel.start().await, Err(ErrorCode::ConfigureSystemProxyFailure));
        assert_eq!(relay.running_count(), 0);
        assert!(!routes.is_installed());
    }

    #[tokio::test]
    async fn test_missing_port_never_spawns() {
        let (relay, routes) = fakes();
        let mut config = server();
        config.port = None;
        let mut tunnel = tunnel(config, &relay, &routes);

        assert_eq!(tunnel.start().await, Err(ErrorCode::IllegalServerConfiguration));
        assert_eq!(relay.spawn_count(), 0);
        assert!(relay.log.events().is_empty());
    }

    #[tokio::test]
    async fn test_udp_required_but_unavailable() {
        let (relay, routes) = fakes();
        relay.set_udp(false);
        let mut tunnel = tunnel(server().with_udp_required(true), &relay, &routes);

        assert_eq!(tunnel.start().await, Err(ErrorCode::UdpRelayNotEnabled));
        assert!(relay.log.events().is_empty());
        assert!(!routes.is_installed());
    }

    #[tokio::test]
    async fn test_relay_failure_codes() {
        let (relay, routes) = fakes();

        relay.fail_next_spawn(RelayError::AuthenticationRejected);
        let mut tunnel = Tunnel::new(Arc::new(server()), relay.clone(), routes.clone());
        assert_eq!(tunnel.start().await, Err(ErrorCode::InvalidServerCredentials));
        assert!(!routes.is_installed());

        relay.fail_next_spawn(RelayError::Unreachable("timeout".into()));
        let mut tunnel = Tunnel::new(Arc::new(server()), relay.clone(), routes.clone());
        assert_eq!(tunnel.start().await, Err(ErrorCode::ServerUnreachable));

        relay.fail_next_spawn(RelayError::Exited { status: Some(1) });
        let mut tunnel = Tunnel::new(Arc::new(server()), relay.clone(), routes.clone());
        assert_eq!(tunnel.start().await, Err(ErrorCode::RelayStartFailure));
        assert_eq!(relay.running_count(), 0);
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let (relay, routes) = fakes();
        let mut tunnel = tunnel(server(), &relay, &routes);
        tunnel.start().await.unwrap();
        assert_eq!(tunnel.start().await, Err(ErrorCode::Undefined));
        assert_eq!(relay.spawn_count(), 1);
        assert_eq!(tunnel.state(), TunnelState::Running);
    }

    #[tokio::test]
    async fn test_probe_only_while_running() {
        let (relay, routes) = fakes();
        let mut tunnel = tunnel(server(), &relay, &routes);
        assert!(tunnel.probe().is_none());
        assert!(!tunnel.is_healthy().await);

        tunnel.start().await.unwrap();
        let probe = tunnel.probe().unwrap();
        routes.set_present(false);
        assert!(!probe.run().await);
        assert!(!tunnel.is_healthy().await);

        tunnel.stop().await;
        assert!(tunnel.probe().is_none());
    }
}
