//! Tunnel Lifecycle Controller
//!
//! Single owner of the active [`Tunnel`] and sole writer of the
//! [`TunnelStore`]. The controller runs as one task; OS lifecycle hooks and
//! the host app talk to it through a cloneable [`ControllerHandle`].
//!
//! ```text
//!                 start-requested
//!   Disconnected ─────────────────▶ Connecting ──start ok──▶ Connected
//!   Invalid      ◀──start fails────     │                      │  │
//!        ▲                              │ stop                 │  │ health fails /
//!        │ retry cap reached            ▼                      │  │ new config
//!        └──────────────────────── Disconnecting ◀──stop───────┘  ▼
//!                                       │                     Reasserting
//!                                       ▼                         │
//!                                  Disconnected        Connecting ◀┘
//! ```
//!
//! While a tunnel start or stop is in flight the controller keeps reading its
//! inbox: a stop is recorded and honored as soon as the transition finishes,
//! everything else is deferred in arrival order.

use crate::config::{ConfigError, ControllerPolicy, ServerConfiguration};
use crate::error::{ErrorCode, ToErrorCode};
use crate::health::{HealthMonitor, HealthReport};
use crate::message::{AppAction, AppRequest, AppResponse};
use crate::relay::Relay;
use crate::routing::RoutingTable;
use crate::status::{Status, StatusChannel, StatusReceiver};
use crate::store::TunnelStore;
use crate::tunnel::Tunnel;
use std::collections::VecDeque;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Why a tunnel is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The user turned the VPN off
    UserInitiated,
    /// The VPN configuration was removed from the system
    ConfigurationRemoved,
    /// Another VPN took over
    Superseded,
    /// The provider failed
    ProviderFailed,
    /// No network available
    NoNetwork,
    /// Device went to sleep
    Sleep,
    /// System shutdown or provider exit
    SystemShutdown,
    /// Any reason the OS does not name
    Other,
}

impl StopReason {
    /// Does this stop withdraw the user's intent to be connected?
    pub fn clears_intent(&self) -> bool {
        matches!(self, StopReason::UserInitiated | StopReason::ConfigurationRemoved)
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StopReason::UserInitiated => "user initiated",
            StopReason::ConfigurationRemoved => "configuration removed",
            StopReason::Superseded => "superseded",
            StopReason::ProviderFailed => "provider failed",
            StopReason::NoNetwork => "no network",
            StopReason::Sleep => "sleep",
            StopReason::SystemShutdown => "system shutdown",
            StopReason::Other => "other",
        };
        f.write_str(name)
    }
}

enum Command {
    Start {
        payload: Option<ServerConfiguration>,
        reply: oneshot::Sender<Result<(), ErrorCode>>,
    },
    UpdateConfiguration {
        config: ServerConfiguration,
        reply: oneshot::Sender<Result<(), ErrorCode>>,
    },
    Stop {
        reason: StopReason,
        reply: oneshot::Sender<()>,
    },
    Sleep {
        reply: oneshot::Sender<()>,
    },
    Wake {
        reply: oneshot::Sender<()>,
    },
    ActiveTunnelId {
        reply: oneshot::Sender<Option<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle used by the OS adapter and the host app channel
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    status: StatusChannel,
}

impl ControllerHandle {
    /// Start a tunnel. The stored configuration wins over `payload`.
    pub async fn start(&self, payload: Option<ServerConfiguration>) -> Result<(), ErrorCode> {
        self.request(|reply| Command::Start { payload, reply })
            .await
            .unwrap_or(Err(ErrorCode::VpnStartFailure))
    }

    /// Stop the tunnel; resolves once it is down
    pub async fn stop(&self, reason: StopReason) {
        self.request(|reply| Command::Stop { reason, reply }).await;
    }

    /// OS is about to sleep
    pub async fn handle_sleep(&self) {
        self.request(|reply| Command::Sleep { reply }).await;
    }

    /// OS woke up
    pub async fn handle_wake(&self) {
        self.request(|reply| Command::Wake { reply }).await;
    }

    /// Switch the tunnel to a new server configuration
    pub async fn update_configuration(&self, config: ServerConfiguration) -> Result<(), ErrorCode> {
        self.request(|reply| Command::UpdateConfiguration { config, reply })
            .await
            .unwrap_or(Err(ErrorCode::VpnStartFailure))
    }

    /// Host app's id for the running tunnel
    pub async fn active_tunnel_id(&self) -> Option<String> {
        self.request(|reply| Command::ActiveTunnelId { reply })
            .await
            .flatten()
    }

    /// Answer a JSON message from the host app
    pub async fn handle_app_message(&self, bytes: &[u8]) -> Vec<u8> {
        let request = match AppRequest::decode(bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!("Unreadable app message: {}", e);
                return AppResponse::from_code(ErrorCode::Undefined).encode();
            }
        };
        debug!("App message: {:?}", request.action);

        let response = match request.action {
            AppAction::Start => AppResponse::from_result(self.start(request.configuration()).await),
            AppAction::Restart => match request.configuration() {
                Some(config) => AppResponse::from_result(self.update_configuration(config).await),
                None => AppResponse::from_code(ErrorCode::IllegalServerConfiguration),
            },
            AppAction::Stop => {
                self.stop(StopReason::UserInitiated).await;
                AppResponse::ok()
            }
            AppAction::GetTunnelId => AppResponse::ok(),
        };

        response.with_tunnel_id(self.active_tunnel_id().await).encode()
    }

    /// Latest published status
    pub fn status(&self) -> Status {
        self.status.current()
    }

    /// Subscribe to status changes
    pub fn subscribe(&self) -> StatusReceiver {
        self.status.subscribe()
    }

    /// Tear down the tunnel (keeping the stored intent) and end the controller
    pub async fn shutdown(&self) {
        self.request(|reply| Command::Shutdown { reply }).await;
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, response) = oneshot::channel();
        if self.commands.send(command(reply)).await.is_err() {
            warn!("Tunnel controller is not running");
            return None;
        }
        response.await.ok()
    }
}

/// Commands received by the controller, including those that arrive while
/// a transition is in flight
struct Inbox {
    commands: mpsc::Receiver<Command>,
    open: bool,
    deferred: VecDeque<Command>,
    stops: Vec<(StopReason, oneshot::Sender<()>)>,
    status: StatusChannel,
}

impl Inbox {
    /// Run a transition to completion while still accepting commands
    async fn drive<F: Future>(&mut self, transition: F) -> F::Output {
        tokio::pin!(transition);
        loop {
            tokio::select! {
                biased;
                output = &mut transition => return output,
                command = self.commands.recv(), if self.open => match command {
                    Some(command) => self.hold(command),
                    None => self.open = false,
                },
            }
        }
    }

    fn hold(&mut self, command: Command) {
        match command {
            Command::Stop { reason, reply } => {
                info!("Stop requested ({}) during transition", reason);
                self.status.publish(Status::disconnecting());
                self.stops.push((reason, reply));
            }
            other => self.deferred.push_back(other),
        }
    }

    fn stop_pending(&self) -> bool {
        !self.stops.is_empty()
    }
}

enum Event {
    Command(Command),
    Health(HealthReport),
    Closed,
}

/// Outcome of one attempt to bring a tunnel up
enum Attempt {
    Connected,
    Failed(ErrorCode),
    /// A stop arrived mid-start and has been honored
    Interrupted,
}

/// Tunnel lifecycle state machine
pub struct TunnelLifecycleController {
    store: Arc<TunnelStore>,
    relay: Arc<dyn Relay>,
    routing: Arc<dyn RoutingTable>,
    policy: ControllerPolicy,
    status: StatusChannel,
    inbox: Inbox,
    reports_tx: mpsc::Sender<HealthReport>,
    reports: mpsc::Receiver<HealthReport>,
    tunnel: Option<Tunnel>,
    monitor: Option<HealthMonitor>,
    generation: u64,
    /// Consecutive failed health checks and reassert attempts
    failures: u32,
    sleeping: bool,
}

impl TunnelLifecycleController {
    /// Spawn the controller task
    ///
    /// A configuration left in the store by a previous process is resumed
    /// right away.
    pub fn spawn(
        store: Arc<TunnelStore>,
        relay: Arc<dyn Relay>,
        routing: Arc<dyn RoutingTable>,
        policy: ControllerPolicy,
    ) -> ControllerHandle {
        let (commands_tx, commands) = mpsc::channel(32);
        let (reports_tx, reports) = mpsc::channel(8);
        let status = StatusChannel::new(Status::disconnected());

        let controller = Self {
            store,
            relay,
            routing,
            policy,
            status: status.clone(),
            inbox: Inbox {
                commands,
                open: true,
                deferred: VecDeque::new(),
                stops: Vec::new(),
                status: status.clone(),
            },
            reports_tx,
            reports,
            tunnel: None,
            monitor: None,
            generation: 0,
            failures: 0,
            sleeping: false,
        };
        tokio::spawn(controller.run());

        ControllerHandle {
            commands: commands_tx,
            status,
        }
    }

    async fn run(mut self) {
        info!("Tunnel controller started");
        self.resume_session().await;

        loop {
            if self.inbox.stop_pending() {
                self.honor_stops(true).await;
            }

            let event = match self.inbox.deferred.pop_front() {
                Some(command) => Event::Command(command),
                None if !self.inbox.open => Event::Closed,
                None => tokio::select! {
                    command = self.inbox.commands.recv() => match command {
                        Some(command) => Event::Command(command),
                        None => Event::Closed,
                    },
                    Some(report) = self.reports.recv() => Event::Health(report),
                    else => Event::Closed,
                },
            };

            match event {
                Event::Command(command) => {
                    if self.handle(command).await.is_break() {
                        break;
                    }
                }
                Event::Health(report) => self.on_health(report).await,
                Event::Closed => {
                    info!("All controller handles dropped");
                    self.honor_stops(true).await;
                    break;
                }
            }
        }

        info!("Tunnel controller stopped");
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Start { payload, reply } => {
                let result = self.start_requested(payload).await;
                let _ = reply.send(result);
            }
            Command::UpdateConfiguration { config, reply } => {
                let result = self.update_configuration(config).await;
                let _ = reply.send(result);
            }
            Command::Stop { reason, reply } => {
                info!("Stop requested ({})", reason);
                self.inbox.stops.push((reason, reply));
                self.honor_stops(true).await;
            }
            Command::Sleep { reply } => {
                self.sleep();
                let _ = reply.send(());
            }
            Command::Wake { reply } => {
                self.wake();
                let _ = reply.send(());
            }
            Command::ActiveTunnelId { reply } => {
                let id = self.tunnel.as_ref().and_then(|t| t.id()).map(str::to_string);
                let _ = reply.send(id);
            }
            Command::Shutdown { reply } => {
                info!("Controller shutting down");
                self.inbox.stops.push((StopReason::SystemShutdown, reply));
                self.honor_stops(true).await;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn resume_session(&mut self) {
        match self.store.record() {
            Ok(record) => {
                info!("Last recorded status: {}", record.last_status);
                if record.configuration.is_some() {
                    info!("Resuming stored tunnel configuration");
                    if let Err(code) = self.start_requested(None).await {
                        warn!("Stored configuration did not start: {}", code);
                    }
                }
            }
            Err(e) => warn!("Tunnel store unreadable: {}", e),
        }
    }

    async fn start_requested(&mut self, payload: Option<ServerConfiguration>) -> Result<(), ErrorCode> {
        if let Some(active) = &self.tunnel {
            match payload {
                Some(config) if config != **active.config() => {
                    info!("Start requested for another server, replacing tunnel");
                    return self.replace(config).await;
                }
                _ => {
                    debug!("Tunnel already running");
                    return Ok(());
                }
            }
        }

        let Some(config) = self.store.load().or(payload) else {
            let missing = ConfigError::NoConfiguration;
            warn!("Start requested: {}", missing);
            return self.settle(Attempt::Failed(missing.error_code()));
        };

        let attempt = self.connect(Arc::new(config)).await;
        self.settle(attempt)
    }

    async fn update_configuration(&mut self, config: ServerConfiguration) -> Result<(), ErrorCode> {
        if self.tunnel.is_none() {
            info!("Configuration updated while idle, starting tunnel");
            let attempt = self.connect(Arc::new(config)).await;
            return self.settle(attempt);
        }
        info!("Configuration updated, recreating tunnel");
        self.replace(config).await
    }

    /// Tear down the running tunnel and bring one up for `config`
    async fn replace(&mut self, config: ServerConfiguration) -> Result<(), ErrorCode> {
        self.status.publish(Status::reasserting());
        if let Some(old) = self.deactivate() {
            if !self.shutdown_tunnel(old).await {
                return self.settle(Attempt::Failed(ErrorCode::Undefined));
            }
        }
        if self.inbox.stop_pending() {
            self.honor_stops(true).await;
            return self.settle(Attempt::Interrupted);
        }

        let attempt = self.connect(Arc::new(config)).await;
        self.settle(attempt)
    }

    /// Build and start a tunnel; publishes Connecting and, on success, Connected
    async fn connect(&mut self, config: Arc<ServerConfiguration>) -> Attempt {
        self.status.publish(Status::connecting());

        let mut tunnel = Tunnel::new(config, self.relay.clone(), self.routing.clone());
        let timeout = self.policy.transition_timeout;
        let started = self.inbox.drive(tokio::time::timeout(timeout, tunnel.start())).await;

        if self.inbox.stop_pending() {
            debug!("Discarding start result, stop requested");
            let clean = self.shutdown_tunnel(tunnel).await;
            self.honor_stops(clean).await;
            return Attempt::Interrupted;
        }

        match started {
            Ok(Ok(())) => {}
            Ok(Err(code)) => return Attempt::Failed(code),
            Err(_) => {
                error!("Tunnel start timed out after {:?}", timeout);
                self.shutdown_tunnel(tunnel).await;
                return Attempt::Failed(ErrorCode::Undefined);
            }
        }

        if let Err(e) = self.store.save_session(tunnel.config(), Status::connected()) {
            error!("Failed to persist tunnel configuration: {}", e);
            self.shutdown_tunnel(tunnel).await;
            return Attempt::Failed(e.error_code());
        }
        if let Err(e) = self.store.set_udp_supported(self.relay.udp_available(tunnel.config())) {
            warn!("Failed to persist UDP support: {}", e);
        }

        self.activate(tunnel);
        self.status.publish(Status::connected());
        Attempt::Connected
    }

    fn settle(&mut self, attempt: Attempt) -> Result<(), ErrorCode> {
        match attempt {
            Attempt::Connected => {
                self.failures = 0;
                Ok(())
            }
            Attempt::Failed(code) => {
                self.fail(code);
                Err(code)
            }
            Attempt::Interrupted => Err(ErrorCode::VpnStartFailure),
        }
    }

    fn fail(&mut self, code: ErrorCode) {
        error!("Tunnel failed: {}", code);
        self.status.publish(Status::invalid(code));
    }

    async fn on_health(&mut self, report: HealthReport) {
        let current = self.monitor.as_ref().map(HealthMonitor::generation);
        if current != Some(report.generation) {
            debug!("Discarding stale health report (generation {})", report.generation);
            return;
        }

        if report.healthy {
            if self.failures > 0 {
                info!("Tunnel healthy again");
            }
            self.failures = 0;
            return;
        }

        self.failures += 1;
        warn!(
            "Health check failed ({}/{})",
            self.failures, self.policy.max_reassert_attempts
        );

        if self.failures >= self.policy.max_reassert_attempts {
            error!("Tunnel still unhealthy after {} checks, giving up", self.failures);
            if let Some(tunnel) = self.deactivate() {
                self.shutdown_tunnel(tunnel).await;
            }
            self.fail(ErrorCode::ServerUnreachable);
            return;
        }

        self.reassert().await;
    }

    /// Stop the unhealthy tunnel and start a fresh one for the same server
    async fn reassert(&mut self) {
        let Some(old) = self.deactivate() else {
            return;
        };
        let config = old.config().clone();
        info!("Reasserting tunnel to {}", config.endpoint());
        self.status.publish(Status::reasserting());

        if !self.shutdown_tunnel(old).await {
            self.fail(ErrorCode::Undefined);
            return;
        }

        loop {
            if self.inbox.stop_pending() {
                self.honor_stops(true).await;
                return;
            }

            match self.connect(config.clone()).await {
                Attempt::Connected | Attempt::Interrupted => return,
                Attempt::Failed(code) if code.is_transient() => {
                    self.failures += 1;
                    if self.failures >= self.policy.max_reassert_attempts {
                        error!("Reassert failed {} times, giving up", self.failures);
                        self.fail(code);
                        return;
                    }
                    warn!(
                        "Reassert failed: {}, retrying in {:?}",
                        code, self.policy.reassert_delay
                    );
                    self.status.publish(Status::reasserting());
                    let delay = self.policy.reassert_delay;
                    self.inbox.drive(tokio::time::sleep(delay)).await;
                }
                Attempt::Failed(code) => {
                    if code.is_permission_failure() {
                        error!("Reassert lacks permissions, not retrying");
                    } else {
                        warn!("Reassert rejected the configuration, not retrying");
                    }
                    self.fail(code);
                    return;
                }
            }
        }
    }

    /// Stop the active tunnel and answer every recorded stop request
    async fn honor_stops(&mut self, clean: bool) {
        let mut clean = clean;
        if let Some(tunnel) = self.deactivate() {
            self.status.publish(Status::disconnecting());
            clean &= self.shutdown_tunnel(tunnel).await;
        }

        let stops = std::mem::take(&mut self.inbox.stops);
        self.failures = 0;

        if stops.iter().any(|(reason, _)| reason.clears_intent()) {
            if let Err(e) = self.store.clear() {
                warn!("Failed to clear stored configuration: {}", e);
            }
            if let Err(e) = self.store.set_last_status(Status::disconnected()) {
                warn!("Failed to persist status: {}", e);
            }
        }

        if clean {
            self.status.publish(Status::disconnected());
            info!("Tunnel disconnected");
        } else {
            self.fail(ErrorCode::Undefined);
        }

        for (_, reply) in stops {
            let _ = reply.send(());
        }
    }

    /// Stop a tunnel within the transition timeout; false if it timed out
    async fn shutdown_tunnel(&mut self, mut tunnel: Tunnel) -> bool {
        let timeout = self.policy.transition_timeout;
        match self.inbox.drive(tokio::time::timeout(timeout, tunnel.stop())).await {
            Ok(()) => true,
            Err(_) => {
                error!("Tunnel stop timed out after {:?}", timeout);
                false
            }
        }
    }

    fn activate(&mut self, tunnel: Tunnel) {
        self.generation += 1;
        self.monitor = tunnel.probe().map(|probe| {
            HealthMonitor::spawn(
                probe,
                self.generation,
                self.policy.health_check_interval,
                self.sleeping,
                self.reports_tx.clone(),
            )
        });
        self.tunnel = Some(tunnel);
    }

    fn deactivate(&mut self) -> Option<Tunnel> {
        // Dropping the monitor aborts its task
        self.monitor = None;
        self.tunnel.take()
    }

    fn sleep(&mut self) {
        info!("System sleeping, suspending health checks");
        self.sleeping = true;
        if let Some(monitor) = &self.monitor {
            monitor.pause();
        }
    }

    fn wake(&mut self) {
        info!("System awake, resuming health checks");
        self.sleeping = false;
        if let Some(monitor) = &self.monitor {
            monitor.resume();
        }
    }
}
