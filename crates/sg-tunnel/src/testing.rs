//! In-crate fakes for the relay and routing collaborators.

use crate::config::{Method, ServerConfiguration};
use crate::relay::{Relay, RelayError, RelayHandle};
use crate::routing::{RouteError, RoutingTable};
use crate::subnet::NetworkSettings;
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn server() -> ServerConfiguration {
    ServerConfiguration::new("203.0.113.7", 8388, Method::Chacha20IetfPoly1305, "secret")
        .with_id("tunnel-1")
}

/// Relay and routes sharing one event log
pub fn fakes() -> (Arc<FakeRelay>, Arc<FakeRoutes>) {
    let log = EventLog::default();
    (
        Arc::new(FakeRelay::new(log.clone())),
        Arc::new(FakeRoutes::new(log)),
    )
}

/// Ordered record of collaborator calls
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<&'static str>>>);

impl EventLog {
    pub fn push(&self, event: &'static str) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

pub struct FakeRelay {
    pub log: EventLog,
    udp: AtomicBool,
    healthy: AtomicBool,
    spawn_delay: Mutex<Duration>,
    spawn_failures: Mutex<VecDeque<RelayError>>,
    running: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    spawns: AtomicUsize,
}

impl FakeRelay {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            udp: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
            spawn_delay: Mutex::new(Duration::ZERO),
            spawn_failures: Mutex::new(VecDeque::new()),
            running: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            spawns: AtomicUsize::new(0),
        }
    }

    pub fn set_udp(&self, available: bool) {
        self.udp.store(available, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_spawn_delay(&self, delay: Duration) {
        *self.spawn_delay.lock().unwrap() = delay;
    }

    /// Queue a failure for the next spawn
    pub fn fail_next_spawn(&self, error: RelayError) {
        self.spawn_failures.lock().unwrap().push_back(error);
    }

    /// Every running instance dies; later spawns are healthy again
    pub fn crash_all(&self) {
        self.running.lock().unwrap().clear();
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }
}

#[async_trait]
impl Relay for FakeRelay {
    fn udp_available(&self, _config: &ServerConfiguration) -> bool {
        self.udp.load(Ordering::SeqCst)
    }

    async fn spawn(&self, _config: &ServerConfiguration) -> Result<RelayHandle, RelayError> {
        self.log.push("relay.spawn");
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let delay = *self.spawn_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.spawn_failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.running.lock().unwrap().insert(id);
        Ok(RelayHandle {
            id,
            pid: None,
            local_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 1080)),
        })
    }

    async fn terminate(&self, handle: &RelayHandle) -> Result<(), RelayError> {
        self.log.push("relay.terminate");
        if self.running.lock().unwrap().remove(&handle.id) {
            Ok(())
        } else {
            Err(RelayError::NotRunning)
        }
    }

    async fn health_probe(&self, handle: &RelayHandle) -> bool {
        self.healthy.load(Ordering::SeqCst) && self.running.lock().unwrap().contains(&handle.id)
    }
}

pub struct FakeRoutes {
    pub log: EventLog,
    installed: AtomicBool,
    present: AtomicBool,
    install_failures: Mutex<VecDeque<RouteError>>,
    local: Mutex<Vec<Ipv4Addr>>,
}

impl FakeRoutes {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            installed: AtomicBool::new(false),
            present: AtomicBool::new(true),
            install_failures: Mutex::new(VecDeque::new()),
            local: Mutex::new(vec![Ipv4Addr::new(10, 0, 0, 2)]),
        }
    }

    /// Simulate routes vanishing underneath the tunnel
    pub fn set_present(&self, present: bool) {
        self.present.store(present, Ordering::SeqCst);
    }

    pub fn fail_next_install(&self, error: RouteError) {
        self.install_failures.lock().unwrap().push_back(error);
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoutingTable for FakeRoutes {
    async fn install_routes(&self, _settings: &NetworkSettings) -> Result<(), RouteError> {
        self.log.push("routes.install");
        // A failed install may still leave some routes behind
        self.installed.store(true, Ordering::SeqCst);
        match self.install_failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn remove_routes(&self, _settings: &NetworkSettings) -> Result<(), RouteError> {
        self.log.push("routes.remove");
        self.installed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn routes_present(&self, _settings: &NetworkSettings) -> bool {
        self.present.load(Ordering::SeqCst) && self.is_installed()
    }

    async fn local_addresses(&self) -> Vec<Ipv4Addr> {
        self.local.lock().unwrap().clone()
    }
}
