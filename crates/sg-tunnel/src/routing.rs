//! Routing Configuration
//!
//! Installs and removes the routes a tunnel needs. The OS side is reached
//! through the [`RoutingTable`] trait; [`HookRoutes`] delegates the actual
//! table edits to user-supplied up/down/check programs.

use crate::config::HookSettings;
use crate::subnet::{NetworkSettings, Subnet};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Mutex;
use std::sync::PoisonError;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Route configuration failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("VPN entitlement not granted")]
    EntitlementMissing,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported routing table: {0}")]
    UnsupportedTable(String),

    #[error("Proxy configuration failed: {0}")]
    ProxyConfiguration(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// OS routing configuration used by a tunnel
#[async_trait]
pub trait RoutingTable: Send + Sync {
    /// Apply the tunnel's routes, DNS and interface address
    async fn install_routes(&self, settings: &NetworkSettings) -> Result<(), RouteError>;

    /// Undo [`RoutingTable::install_routes`], including partial installs
    async fn remove_routes(&self, settings: &NetworkSettings) -> Result<(), RouteError>;

    /// Are the tunnel's routes still in place?
    async fn routes_present(&self, settings: &NetworkSettings) -> bool;

    /// IPv4 addresses currently assigned to local interfaces
    async fn local_addresses(&self) -> Vec<Ipv4Addr>;
}

/// Routing driven by up/down hook programs
///
/// Settings are exported to the hooks as environment variables:
/// `SG_REMOTE`, `SG_ADDRESS`, `SG_NETMASK`, `SG_INCLUDED_ROUTES`,
/// `SG_EXCLUDED_ROUTES` and `SG_DNS` (lists are comma separated).
pub struct HookRoutes {
    hooks: HookSettings,
    installed: Mutex<Option<NetworkSettings>>,
}

impl HookRoutes {
    pub fn new(hooks: HookSettings) -> Self {
        Self {
            hooks,
            installed: Mutex::new(None),
        }
    }

    fn set_installed(&self, settings: Option<NetworkSettings>) {
        *self.installed.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }
}

#[async_trait]
impl RoutingTable for HookRoutes {
    async fn install_routes(&self, settings: &NetworkSettings) -> Result<(), RouteError> {
        if let Some(up) = &self.hooks.up {
            run_hook(up, settings).await?;
        } else {
            debug!("No route up hook configured");
        }
        self.set_installed(Some(settings.clone()));
        info!(
            "Routes installed ({} via {}/{})",
            settings.tunnel_remote_address, settings.address, settings.subnet_mask
        );
        Ok(())
    }

    async fn remove_routes(&self, settings: &NetworkSettings) -> Result<(), RouteError> {
        self.set_installed(None);
        if let Some(down) = &self.hooks.down {
            run_hook(down, settings).await?;
        }
        info!("Routes removed ({})", settings.tunnel_remote_address);
        Ok(())
    }

    async fn routes_present(&self, settings: &NetworkSettings) -> bool {
        let installed = self
            .installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|installed| installed == settings);
        if !installed {
            return false;
        }

        match &self.hooks.check {
            Some(check) => match run_hook(check, settings).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Route check failed: {}", e);
                    false
                }
            },
            None => true,
        }
    }

    async fn local_addresses(&self) -> Vec<Ipv4Addr> {
        // Address of the default outbound interface; connect() sends nothing
        let probe = async {
            let socket = UdpSocket::bind("0.0.0.0:0").await?;
            socket.connect("198.51.100.1:9").await?;
            socket.local_addr()
        };
        match probe.await {
            Ok(addr) => match addr.ip() {
                IpAddr::V4(v4) if !v4.is_unspecified() => vec![v4],
                _ => Vec::new(),
            },
            Err(e) => {
                debug!("Local address lookup failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Environment handed to route hooks
pub fn hook_env(settings: &NetworkSettings) -> Vec<(&'static str, String)> {
    let join = |subnets: &[Subnet]| {
        subnets.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(",")
    };

    vec![
        ("SG_REMOTE", settings.tunnel_remote_address.clone()),
        ("SG_ADDRESS", settings.address.to_string()),
        ("SG_NETMASK", settings.subnet_mask.to_string()),
        ("SG_INCLUDED_ROUTES", join(&settings.included_routes)),
        ("SG_EXCLUDED_ROUTES", join(&settings.excluded_routes)),
        (
            "SG_DNS",
            settings
                .dns_servers
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(","),
        ),
    ]
}

async fn run_hook(program: &Path, settings: &NetworkSettings) -> Result<(), RouteError> {
    debug!("Running route hook {}", program.display());

    let status = Command::new(program)
        .envs(hook_env(settings))
        .status()
        .await
        .map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                RouteError::PermissionDenied(program.display().to_string())
            }
            _ => RouteError::Io(format!("{}: {}", program.display(), e)),
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(RouteError::ProxyConfiguration(format!(
            "{} exited with {}",
            program.display(),
            status
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn settings() -> NetworkSettings {
        NetworkSettings::for_remote("203.0.113.7", &[])
    }

    #[test]
    fn test_hook_env() {
        let settings = settings();
        let env = hook_env(&settings);

        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("SG_REMOTE"), "203.0.113.7");
        assert_eq!(get("SG_NETMASK"), "255.255.255.0");
        assert_eq!(get("SG_INCLUDED_ROUTES"), "0.0.0.0/0");
        assert!(get("SG_EXCLUDED_ROUTES").starts_with("10.0.0.0/8,100.64.0.0/10"));
        assert_eq!(get("SG_DNS"), "1.1.1.1,9.9.9.9,208.67.222.222,208.67.220.220");
    }

    #[tokio::test]
    async fn test_without_hooks() {
        let routes = HookRoutes::new(HookSettings::default());
        let settings = settings();

        assert!(!routes.routes_present(&settings).await);
        routes.install_routes(&settings).await.unwrap();
        assert!(routes.routes_present(&settings).await);
        routes.remove_routes(&settings).await.unwrap();
        assert!(!routes.routes_present(&settings).await);
    }

    #[tokio::test]
    async fn test_failing_hook() {
        let routes = HookRoutes::new(HookSettings {
            up: Some(PathBuf::from("false")),
            down: Some(PathBuf::from("true")),
            check: None,
        });
        let settings = settings();

        assert!(matches!(
            routes.install_routes(&settings).await,
            Err(RouteError::ProxyConfiguration(_))
        ));
        assert!(!routes.routes_present(&settings).await);
        assert!(routes.remove_routes(&settings).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_hook() {
        let routes = HookRoutes::new(HookSettings {
            up: Some(PathBuf::from("/nonexistent/route-up")),
            ..Default::default()
        });
        assert!(matches!(
            routes.install_routes(&settings()).await,
            Err(RouteError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_check_hook_decides_presence() {
        let settings = settings();

        let gone = HookRoutes::new(HookSettings {
            check: Some(PathBuf::from("false")),
            ..Default::default()
        });
        gone.install_routes(&settings).await.unwrap();
        assert!(!gone.routes_present(&settings).await);

        let present = HookRoutes::new(HookSettings {
            check: Some(PathBuf::from("true")),
            ..Default::default()
        });
        assert!(!present.routes_present(&settings).await);
        present.install_routes(&settings).await.unwrap();
        assert!(present.routes_present(&settings).await);
        present.remove_routes(&settings).await.unwrap();
        assert!(!present.routes_present(&settings).await);
    }
}
