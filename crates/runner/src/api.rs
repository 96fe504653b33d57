//! Wire-Typen der Compute-API.
//!
//! Die Typen spiegeln die Antworten des Compute-Dienstes wider, so wie
//! `list_servers()` sie liefert. Der eigentliche API-Client steht hinter
//! dem `ComputeBackend`-Trait in `lib.rs`.

use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Fehler eines Remote-Calls, mit numerischem Status-Code.
///
/// Service-Fehler sind Werte, keine Panics: der Reconciliation-Loop
/// verfüttert sie als `error:<code>` an dieselbe `update`-Logik wie
/// beobachtete Status-Übergänge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("service error {code}: {message}")]
pub struct ApiError {
    pub code: u16,
    pub message: String,
}

impl ApiError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Eine buchbare Instanzgröße.
#[derive(Debug, Clone, Deserialize)]
pub struct Flavor {
    pub id: String,
    /// Speichergröße in MiB. Der Flavor-Katalog einer Session ist danach
    /// aufsteigend sortiert.
    pub ram: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub id: String,
    pub name: String,
}

/// Ein Server, wie ihn ein Listing-Snapshot liefert.
///
/// Gelöschte Server tauchen im Listing schlicht nicht mehr auf; das Fehlen
/// eines bekannten Servers ist das einzige Signal für "deleted".
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub flavor_id: String,
}

/// Status eines Servers aus Sicht des Compute-Dienstes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Active,
    Build,
    Resize,
    VerifyResize,
    RevertResize,
    Rescue,
    Password,
    Deleted,
    Error,
    Unknown(String),
}

impl ServerStatus {
    /// Parst einen Status-String aus dem Listing.
    pub fn parse(s: &str) -> Self {
        match s {
            "ACTIVE" => Self::Active,
            "BUILD" => Self::Build,
            "RESIZE" => Self::Resize,
            "VERIFY_RESIZE" => Self::VerifyResize,
            "REVERT_RESIZE" => Self::RevertResize,
            "RESCUE" => Self::Rescue,
            "PASSWORD" => Self::Password,
            "DELETED" => Self::Deleted,
            "ERROR" => Self::Error,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "ACTIVE",
            Self::Build => "BUILD",
            Self::Resize => "RESIZE",
            Self::VerifyResize => "VERIFY_RESIZE",
            Self::RevertResize => "REVERT_RESIZE",
            Self::Rescue => "RESCUE",
            Self::Password => "PASSWORD",
            Self::Deleted => "DELETED",
            Self::Error => "ERROR",
            Self::Unknown(s) => s,
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_status_roundtrip() {
        for s in [
            "ACTIVE",
            "BUILD",
            "RESIZE",
            "VERIFY_RESIZE",
            "REVERT_RESIZE",
            "RESCUE",
            "PASSWORD",
            "DELETED",
            "ERROR",
        ] {
            assert_eq!(ServerStatus::parse(s).as_str(), s);
        }
    }

    #[test]
    fn test_server_status_unknown() {
        let status = ServerStatus::parse("MIGRATING");
        assert!(matches!(status, ServerStatus::Unknown(_)));
        assert_eq!(status.as_str(), "MIGRATING");
    }

    #[test]
    fn test_server_info_from_listing_json() {
        let listing: Vec<ServerInfo> = serde_json::from_str(
            r#"[
                {"id": "7f3a", "name": "stress-1", "status": "ACTIVE", "flavor_id": "f1"},
                {"id": "9c2b", "name": "stress-2", "status": "RESIZE", "flavor_id": "f2"}
            ]"#,
        )
        .unwrap();

        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].id, "7f3a");
        assert_eq!(ServerStatus::parse(&listing[1].status), ServerStatus::Resize);
    }

    #[test]
    fn test_api_error_display() {
        let err = ApiError::new(409, "instance not in ACTIVE state");
        assert_eq!(err.to_string(), "service error 409: instance not in ACTIVE state");
    }
}
