//! ShadowGuard Tunnel - Packet tunnel control core
//!
//! Owns the lifecycle of a single VPN tunnel session: it starts and stops a
//! local proxy relay, installs the routes that send traffic through it,
//! re-establishes the tunnel when it drops, and reports one normalized
//! error code per failure to the host app.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Provider Process                        │
//! │                                                              │
//! │  OS hooks / app msgs      ┌──────────────────────────────┐   │
//! │  ───────────────────────▶ │  TunnelLifecycleController   │   │
//! │    ControllerHandle       │  (single task, mpsc inbox)   │   │
//! │  ◀─────────────────────── └──┬───────────┬───────────▲───┘   │
//! │    Status (watch)            │           │           │       │
//! │                     ┌────────▼───┐ ┌─────▼─────┐ ┌───┴────┐  │
//! │                     │ TunnelStore│ │  Tunnel   │ │ Health │  │
//! │                     │  (JSON)    │ │           │ │Monitor │  │
//! │                     └────────────┘ └──┬─────┬──┘ └────────┘  │
//! │                                       │     │                │
//! │                               ┌───────▼┐  ┌─▼────────────┐   │
//! │                               │ Relay  │  │ RoutingTable │   │
//! │                               └───┬────┘  └──────────────┘   │
//! └───────────────────────────────────│──────────────────────────┘
//!                                     ▼
//!                             ┌───────────────┐
//!                             │ Remote server │
//!                             └───────────────┘
//! ```
//!
//! # Features
//!
//! - **Ordered start with rollback**: validate, UDP check, relay, routes
//! - **Durable intent**: the active configuration survives process restarts
//! - **Bounded reassert**: unhealthy tunnels are rebuilt up to a retry cap
//! - **Stable error codes**: integers safe to persist and send to the app

mod config;
mod controller;
mod error;
mod health;
mod message;
mod relay;
mod routing;
mod status;
mod store;
mod subnet;
mod tunnel;
pub mod uri;

#[cfg(test)]
mod testing;

pub use config::{
    ConfigError, ControllerPolicy, HookSettings, Method, PolicyConfig, ProviderConfig,
    RelaySettings, ServerConfiguration,
};
pub use controller::{ControllerHandle, StopReason, TunnelLifecycleController};
pub use error::{ErrorCode, ToErrorCode, UnknownErrorCode};
pub use health::{HealthMonitor, HealthProbe, HealthReport};
pub use message::{AppAction, AppRequest, AppResponse};
pub use relay::{ProcessRelay, Relay, RelayError, RelayHandle, classify_exit};
pub use routing::{HookRoutes, RouteError, RoutingTable, hook_env};
pub use status::{ConnectionState, Status, StatusChannel, StatusReceiver};
pub use store::{StoreError, StoreRecord, TunnelStore};
pub use subnet::{NetworkSettings, Subnet, excluded_routes, select_vpn_address};
pub use tunnel::{Tunnel, TunnelState};
pub use uri::UriError;
