//! Relay Control
//!
//! The relay is the local forwarding process that encrypts traffic and
//! carries it to the remote server. The tunnel only needs a narrow
//! start/stop/probe contract from it, expressed by the [`Relay`] trait.
//!
//! [`ProcessRelay`] drives an `ss-local` compatible executable:
//!
//! ```text
//! ss-local -s <host> -p <port> -k <password> -m <method>
//!          -l <local_port> -b <local_addr> [-u]
//!          [--plugin <plugin> [--plugin-opts <opts>]] [extra args...]
//! ```

use crate::config::{RelaySettings, ServerConfiguration};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Relay failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to launch relay: {0}")]
    Spawn(String),

    #[error("Relay exited during start-up (status {status:?})")]
    Exited { status: Option<i32> },

    #[error("Server rejected the credentials")]
    AuthenticationRejected,

    #[error("Server unreachable: {0}")]
    Unreachable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Relay not running")]
    NotRunning,
}

/// Handle to one running relay instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayHandle {
    /// Identifier assigned by the relay implementation
    pub id: u64,
    /// OS process id, when the relay is a process
    pub pid: Option<u32>,
    /// Local SOCKS5 endpoint
    pub local_addr: SocketAddr,
}

/// Start/stop contract for the proxy relay
#[async_trait]
pub trait Relay: Send + Sync {
    /// Can this relay forward UDP for the given server?
    fn udp_available(&self, config: &ServerConfiguration) -> bool;

    /// Launch a relay instance for the server
    async fn spawn(&self, config: &ServerConfiguration) -> Result<RelayHandle, RelayError>;

    /// Stop a relay instance
    async fn terminate(&self, handle: &RelayHandle) -> Result<(), RelayError>;

    /// Is the instance alive and serving?
    async fn health_probe(&self, handle: &RelayHandle) -> bool;
}

/// Local relay executed as a child process
pub struct ProcessRelay {
    settings: RelaySettings,
    children: Mutex<HashMap<u64, Child>>,
    next_id: AtomicU64,
}

impl ProcessRelay {
    /// Create a relay launcher
    pub fn new(settings: RelaySettings) -> Self {
        Self {
            settings,
            children: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Local SOCKS5 endpoint the relay listens on
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.settings.local_address, self.settings.local_port)
    }

    /// Command line passed to the relay program
    pub fn command_args(&self, config: &ServerConfiguration) -> Vec<String> {
        let mut args = vec![
            "-s".to_string(),
            config.host.clone(),
            "-p".to_string(),
            config.port.map(|p| p.to_string()).unwrap_or_default(),
            "-k".to_string(),
            config.password.clone(),
            "-m".to_string(),
            config.method.clone(),
            "-l".to_string(),
            self.settings.local_port.to_string(),
            "-b".to_string(),
            self.settings.local_address.to_string(),
        ];

        if self.udp_available(config) {
            args.push("-u".to_string());
        }

        if let Some(plugin) = config.extra.get("plugin") {
            args.push("--plugin".to_string());
            args.push(plugin.clone());
            if let Some(opts) = config.extra.get("plugin_opts") {
                args.push("--plugin-opts".to_string());
                args.push(opts.clone());
            }
        }

        args.extend(self.settings.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl Relay for ProcessRelay {
    fn udp_available(&self, config: &ServerConfiguration) -> bool {
        // SIP003 plugins only carry TCP
        self.settings.udp_relay && !config.extra.contains_key("plugin")
    }

    async fn spawn(&self, config: &ServerConfiguration) -> Result<RelayHandle, RelayError> {
        let program = &self.settings.program;
        info!("Launching relay {} for {}", program.display(), config.endpoint());

        let mut child = Command::new(program)
            .args(self.command_args(config))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => {
                    RelayError::PermissionDenied(program.display().to_string())
                }
                _ => RelayError::Spawn(format!("{}: {}", program.display(), e)),
            })?;

        // An exit within the grace period means the relay refused to start
        let grace = Duration::from_millis(self.settings.startup_grace_ms);
        if let Ok(waited) = tokio::time::timeout(grace, child.wait()).await {
            let status = waited.map_err(|e| RelayError::Spawn(e.to_string()))?;
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            warn!("Relay exited during start-up ({}): {}", status, stderr.trim());
            return Err(classify_exit(status.code(), &stderr));
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("relay: {}", line);
                }
            });
        }

        let handle = RelayHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            pid: child.id(),
            local_addr: self.local_addr(),
        };
        self.children.lock().await.insert(handle.id, child);

        info!("Relay running (pid {:?}, socks5 {})", handle.pid, handle.local_addr);
        Ok(handle)
    }

    async fn terminate(&self, handle: &RelayHandle) -> Result<(), RelayError> {
        let mut child = self
            .children
            .lock()
            .await
            .remove(&handle.id)
            .ok_or(RelayError::NotRunning)?;

        if let Err(e) = child.kill().await {
            // Already exited on its own
            debug!("Relay {} kill: {}", handle.id, e);
        }
        info!("Relay {} terminated", handle.id);
        Ok(())
    }

    async fn health_probe(&self, handle: &RelayHandle) -> bool {
        let alive = match self.children.lock().await.get_mut(&handle.id) {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        };
        if !alive {
            return false;
        }

        matches!(
            tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(handle.local_addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Map an early exit to the most specific relay error
pub fn classify_exit(status: Option<i32>, stderr: &str) -> RelayError {
    let text = stderr.to_ascii_lowercase();

    if text.contains("authentication") || text.contains("invalid password") {
        RelayError::AuthenticationRejected
    } else if text.contains("permission denied") || text.contains("operation not permitted") {
        RelayError::PermissionDenied(stderr.trim().to_string())
    } else if ["unreachable", "connection refused", "timed out", "could not resolve", "getaddrinfo"]
        .iter()
        .any(|needle| text.contains(needle))
    {
        RelayError::Unreachable(stderr.trim().to_string())
    } else {
        RelayError::Exited { status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Method;
    use std::path::PathBuf;

    fn config() -> ServerConfiguration {
        ServerConfiguration::new("203.0.113.7", 8388, Method::Aes256Gcm, "secret")
    }

    #[test]
    fn test_command_args() {
        let relay = ProcessRelay::new(RelaySettings::default());
        let args = relay.command_args(&config());

        assert_eq!(
            args,
            [
                "-s", "203.0.113.7", "-p", "8388", "-k", "secret", "-m", "aes-256-gcm", "-l",
                "1080", "-b", "127.0.0.1", "-u",
            ]
        );
    }

    #[test]
    fn test_plugin_args_disable_udp() {
        let relay = ProcessRelay::new(RelaySettings::default());
        let mut config = config();
        config.extra.insert("plugin".into(), "obfs-local".into());
        config.extra.insert("plugin_opts".into(), "obfs=http".into());

        assert!(!relay.udp_available(&config));
        let args = relay.command_args(&config);
        assert!(!args.contains(&"-u".to_string()));
        assert!(args.ends_with(&[
            "--plugin".to_string(),
            "obfs-local".to_string(),
            "--plugin-opts".to_string(),
            "obfs=http".to_string(),
        ]));
    }

    #[test]
    fn test_udp_disabled_by_settings() {
        let relay = ProcessRelay::new(RelaySettings {
            udp_relay: false,
            ..Default::default()
        });
        assert!(!relay.udp_available(&config()));
    }

    #[test]
    fn test_classify_exit() {
        assert_eq!(
            classify_exit(Some(1), "ERROR: authentication error"),
            RelayError::AuthenticationRejected
        );
        assert!(matches!(
            classify_exit(Some(1), "connect: Connection refused"),
            RelayError::Unreachable(_)
        ));
        assert!(matches!(
            classify_exit(Some(1), "bind: Permission denied"),
            RelayError::PermissionDenied(_)
        ));
        assert_eq!(classify_exit(Some(2), ""), RelayError::Exited { status: Some(2) });
    }

    #[tokio::test]
    async fn test_missing_program() {
        let relay = ProcessRelay::new(RelaySettings {
            program: PathBuf::from("/nonexistent/ss-local"),
            ..Default::default()
        });
        assert!(matches!(relay.spawn(&config()).await, Err(RelayError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_early_exit_is_start_failure() {
        let relay = ProcessRelay::new(RelaySettings {
            program: PathBuf::from("true"),
            startup_grace_ms: 2000,
            ..Default::default()
        });
        assert_eq!(
            relay.spawn(&config()).await,
            Err(RelayError::Exited { status: Some(0) })
        );
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let relay = ProcessRelay::new(RelaySettings::default());
        let handle = RelayHandle {
            id: 42,
            pid: None,
            local_addr: relay.local_addr(),
        };
        assert!(!relay.health_probe(&handle).await);
        assert_eq!(relay.terminate(&handle).await, Err(RelayError::NotRunning));
    }
}
