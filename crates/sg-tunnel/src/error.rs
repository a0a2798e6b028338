//! Error Taxonomy
//!
//! Every failure the tunnel can report to its host collapses into exactly
//! one [`ErrorCode`]. Codes carry a stable integer identity: they are
//! persisted in the tunnel store and sent to the host app as plain numbers,
//! so existing values must never be renumbered.
//!
//! Component errors (`ConfigError`, `RelayError`, `RouteError`,
//! `StoreError`) stay rich inside the crate and are translated through
//! [`ToErrorCode`] before crossing the host boundary.

use crate::config::ConfigError;
use crate::relay::RelayError;
use crate::routing::RouteError;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};

/// Failure codes surfaced to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum ErrorCode {
    /// Success marker, never reported as a failure
    NoError = 0,
    /// Failure without a more specific code
    Undefined = 1,
    /// The user did not grant the VPN entitlement
    VpnPermissionNotGranted = 2,
    /// The server rejected the credentials
    InvalidServerCredentials = 3,
    /// UDP forwarding is required but the relay cannot provide it
    UdpRelayNotEnabled = 4,
    /// The remote server could not be reached
    ServerUnreachable = 5,
    /// The host could not start the VPN session
    VpnStartFailure = 6,
    /// Missing or malformed server configuration
    IllegalServerConfiguration = 7,
    /// The local relay failed to launch
    RelayStartFailure = 8,
    /// System proxy/route configuration failed
    ConfigureSystemProxyFailure = 9,
    /// Administrator rights are required
    NoAdminPermissions = 10,
    /// The routing table cannot be managed on this system
    UnsupportedRoutingTable = 11,
    /// The system is in an unexpected state (e.g. storage failure)
    SystemMisconfigured = 12,
}

impl ErrorCode {
    /// All codes in numeric order
    pub fn all() -> &'static [ErrorCode] {
        &[
            ErrorCode::NoError,
            ErrorCode::Undefined,
            ErrorCode::VpnPermissionNotGranted,
            ErrorCode::InvalidServerCredentials,
            ErrorCode::UdpRelayNotEnabled,
            ErrorCode::ServerUnreachable,
            ErrorCode::VpnStartFailure,
            ErrorCode::IllegalServerConfiguration,
            ErrorCode::RelayStartFailure,
            ErrorCode::ConfigureSystemProxyFailure,
            ErrorCode::NoAdminPermissions,
            ErrorCode::UnsupportedRoutingTable,
            ErrorCode::SystemMisconfigured,
        ]
    }

    /// Stable integer identity
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Look up a code by its integer identity
    pub fn from_code(code: i32) -> Option<Self> {
        Self::all().iter().copied().find(|c| c.code() == code)
    }

    /// Locale-independent symbolic name
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::NoError => "NoError",
            ErrorCode::Undefined => "Undefined",
            ErrorCode::VpnPermissionNotGranted => "VpnPermissionNotGranted",
            ErrorCode::InvalidServerCredentials => "InvalidServerCredentials",
            ErrorCode::UdpRelayNotEnabled => "UdpRelayNotEnabled",
            ErrorCode::ServerUnreachable => "ServerUnreachable",
            ErrorCode::VpnStartFailure => "VpnStartFailure",
            ErrorCode::IllegalServerConfiguration => "IllegalServerConfiguration",
            ErrorCode::RelayStartFailure => "RelayStartFailure",
            ErrorCode::ConfigureSystemProxyFailure => "ConfigureSystemProxyFailure",
            ErrorCode::NoAdminPermissions => "NoAdminPermissions",
            ErrorCode::UnsupportedRoutingTable => "UnsupportedRoutingTable",
            ErrorCode::SystemMisconfigured => "SystemMisconfigured",
        }
    }

    /// Is this an actual failure?
    pub fn is_failure(self) -> bool {
        !matches!(self, ErrorCode::NoError)
    }

    /// Failures worth retrying through the reassert path
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorCode::ServerUnreachable | ErrorCode::RelayStartFailure)
    }

    /// Failures caused by missing rights; these are never retried
    pub fn is_permission_failure(self) -> bool {
        matches!(
            self,
            ErrorCode::VpnPermissionNotGranted | ErrorCode::NoAdminPermissions
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = UnknownErrorCode;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        ErrorCode::from_code(code).ok_or(UnknownErrorCode(code))
    }
}

/// Integer that does not name any [`ErrorCode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Unknown error code: {0}")]
pub struct UnknownErrorCode(pub i32);

/// Translation of an internal error into the host-facing taxonomy
pub trait ToErrorCode {
    /// The single code describing this failure. Never `NoError`.
    fn error_code(&self) -> ErrorCode;
}

impl ToErrorCode for ConfigError {
    fn error_code(&self) -> ErrorCode {
        if self.is_server_config() {
            ErrorCode::IllegalServerConfiguration
        } else {
            ErrorCode::SystemMisconfigured
        }
    }
}

impl ToErrorCode for RelayError {
    fn error_code(&self) -> ErrorCode {
        match self {
            RelayError::Spawn(_) | RelayError::Exited { .. } => ErrorCode::RelayStartFailure,
            RelayError::AuthenticationRejected => ErrorCode::InvalidServerCredentials,
            RelayError::Unreachable(_) => ErrorCode::ServerUnreachable,
            RelayError::PermissionDenied(_) => ErrorCode::NoAdminPermissions,
            RelayError::NotRunning => ErrorCode::Undefined,
        }
    }
}

impl ToErrorCode for RouteError {
    fn error_code(&self) -> ErrorCode {
        match self {
            RouteError::EntitlementMissing => ErrorCode::VpnPermissionNotGranted,
            RouteError::PermissionDenied(_) => ErrorCode::NoAdminPermissions,
            RouteError::UnsupportedTable(_) => ErrorCode::UnsupportedRoutingTable,
            RouteError::ProxyConfiguration(_) | RouteError::Io(_) => {
                ErrorCode::ConfigureSystemProxyFailure
            }
        }
    }
}

impl ToErrorCode for StoreError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::SystemMisconfigured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::NoError.code(), 0);
        assert_eq!(ErrorCode::UdpRelayNotEnabled.code(), 4);
        assert_eq!(ErrorCode::RelayStartFailure.code(), 8);
        assert_eq!(ErrorCode::SystemMisconfigured.code(), 12);

        for (index, code) in ErrorCode::all().iter().enumerate() {
            assert_eq!(code.code(), index as i32);
            assert_eq!(ErrorCode::from_code(code.code()), Some(*code));
        }
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(ErrorCode::from_code(13), None);
        assert_eq!(ErrorCode::try_from(-1), Err(UnknownErrorCode(-1)));
    }

    #[test]
    fn test_serializes_as_integer() {
        let json = serde_json::to_string(&ErrorCode::ServerUnreachable).unwrap();
        assert_eq!(json, "5");

        let parsed: ErrorCode = serde_json::from_str("11").unwrap();
        assert_eq!(parsed, ErrorCode::UnsupportedRoutingTable);
        assert!(serde_json::from_str::<ErrorCode>("99").is_err());
    }

    #[test]
    fn test_retry_classes() {
        assert!(ErrorCode::ServerUnreachable.is_transient());
        assert!(ErrorCode::RelayStartFailure.is_transient());
        assert!(!ErrorCode::IllegalServerConfiguration.is_transient());
        assert!(ErrorCode::NoAdminPermissions.is_permission_failure());
        assert!(!ErrorCode::NoError.is_failure());
    }

    #[test]
    fn test_component_mapping() {
        assert_eq!(
            RelayError::AuthenticationRejected.error_code(),
            ErrorCode::InvalidServerCredentials
        );
        assert_eq!(
            RelayError::Exited { status: Some(1) }.error_code(),
            ErrorCode::RelayStartFailure
        );
        assert_eq!(
            RouteError::UnsupportedTable("v6 only".into()).error_code(),
            ErrorCode::UnsupportedRoutingTable
        );
        assert_eq!(
            RouteError::Io("route-up: not found".into()).error_code(),
            ErrorCode::ConfigureSystemProxyFailure
        );
        assert_eq!(
            RouteError::EntitlementMissing.error_code(),
            ErrorCode::VpnPermissionNotGranted
        );
        assert_eq!(
            ConfigError::MissingPort.error_code(),
            ErrorCode::IllegalServerConfiguration
        );
    }
}
