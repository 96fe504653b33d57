//! vmstress — randomisierter Konformitätstreiber für den Lebenszyklus von
//! Compute-Instanzen.
//!
//! Der Treiber würfelt zustandsabhängig Lifecycle-Operationen (create,
//! resize, confirm/revert, rescue/unrescue, set-password, delete) gegen
//! echte Instanzen und prüft per Polling, ob jede beobachtete Transition
//! zu der Erwartung passt, die die Operation beim Absetzen deklariert hat.
//! Eine Abweichung ist eine Protokollverletzung und beendet den gesamten
//! Lauf.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

pub mod api;
pub mod controller;
pub mod driver;
pub mod operation;
pub mod select;
pub mod session;
pub mod sim;

pub use api::{ApiError, Flavor, Image, ServerInfo, ServerStatus};
pub use controller::{ReconcileLoop, SessionStats};
pub use driver::SessionDriver;
pub use operation::{Expectation, OpKind, Operation, Outcome};
pub use select::weighted_sample;
pub use session::{Instance, Session};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("service call failed: {0}")]
    Api(#[from] ApiError),

    #[error(
        "protocol violation in session {session}: instance {alias} observed {observed}, expected {expected}"
    )]
    ProtocolViolation {
        session: String,
        alias: String,
        observed: String,
        expected: String,
    },

    #[error("aborted: another session reported a protocol violation")]
    Aborted,

    #[error("session {0}: compute catalog has no flavors or images")]
    EmptyCatalog(String),

    #[error("worker task failed: {0}")]
    Worker(String),
}

// ============================================================================
// ComputeBackend Trait - abstrahiert den Compute-Dienst für Tests
// ============================================================================

/// Schnittstelle zum Compute-Dienst.
///
/// Der echte Wire-Client (Verbindungsaufbau, Auth, HTTP) lebt außerhalb
/// dieses Crates; hier zählt nur die Semantik der Calls. Listings sind
/// vollständige Snapshots, Löschungen zeigen sich als Fehlen eines
/// Eintrags. Jeder Call kann mit einem `ApiError` samt numerischem Code
/// scheitern.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    async fn list_flavors(&self) -> Result<Vec<Flavor>, ApiError>;

    async fn list_images(&self) -> Result<Vec<Image>, ApiError>;

    /// Vollständiger Snapshot aller Server dieses Mandanten.
    async fn list_servers(&self) -> Result<Vec<ServerInfo>, ApiError>;

    async fn create_server(
        &self,
        name: &str,
        image_id: &str,
        flavor_id: &str,
    ) -> Result<ServerInfo, ApiError>;

    async fn set_password(&self, id: &str, password: &str) -> Result<(), ApiError>;

    async fn resize_server(&self, id: &str, flavor_id: &str) -> Result<(), ApiError>;

    async fn confirm_resize(&self, id: &str) -> Result<(), ApiError>;

    async fn revert_resize(&self, id: &str) -> Result<(), ApiError>;

    async fn rescue(&self, id: &str) -> Result<(), ApiError>;

    async fn unrescue(&self, id: &str) -> Result<(), ApiError>;

    async fn delete_server(&self, id: &str) -> Result<(), ApiError>;
}

// ============================================================================
// Run Options
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Laufzeit einer Session. Die Deadline ist der einzige reguläre
    /// Abbruchmechanismus.
    pub duration: Duration,
    /// Schlafintervall, wenn eine Iteration weder Zustandsänderung noch
    /// Dispatch produziert hat.
    pub poll_interval: Duration,
    /// Eine tokio-Task pro Session statt sequenzieller Abarbeitung.
    pub parallel: bool,
    /// Vor dem Start alle existierenden Server löschen.
    pub wipe: bool,
    /// Fester Seed für reproduzierbare Operationsfolgen.
    pub seed: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            parallel: false,
            wipe: false,
            seed: None,
        }
    }
}

impl RunOptions {
    pub fn from_config(run: &vmstress_config::RunConfig) -> Self {
        Self {
            duration: Duration::from_secs(run.duration_secs),
            poll_interval: Duration::from_secs(run.poll_interval_secs),
            parallel: run.parallel,
            wipe: run.wipe,
            seed: run.seed,
        }
    }
}

// ============================================================================
// Cleanup Sweep
// ============================================================================

/// Löscht alle aktuell gelisteten Server. Der explizite Aufräum-Pfad
/// außerhalb des Reconciliation-Loops: der Lauf selbst endet zeitgesteuert,
/// nicht zustandsgesteuert.
pub async fn wipe_servers(backend: &dyn ComputeBackend) -> Result<usize, ApiError> {
    let servers = backend.list_servers().await?;
    let mut deleted = 0;
    for server in &servers {
        // Einzelne Fehlschläge (z.B. bereits weg) brechen den Sweep nicht
        // ab, zählen aber auch nicht als gelöscht.
        match backend.delete_server(&server.id).await {
            Ok(()) => deleted += 1,
            Err(err) => warn!(id = %server.id, %err, "delete failed during wipe"),
        }
    }
    Ok(deleted)
}

// ============================================================================
// Test Utilities - exportiert für Integrationstests
// ============================================================================

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Mock-Backend für Tests: zeichnet alle Calls auf, transitioniert aber
    /// nichts von selbst. Tests steuern den Server-Status explizit über
    /// `set_status`/`purge`.
    #[derive(Default)]
    pub struct MockCompute {
        state: Mutex<MockState>,
    }

    #[derive(Default)]
    struct MockState {
        flavors: Vec<Flavor>,
        images: Vec<Image>,
        servers: Vec<ServerInfo>,
        calls: Vec<String>,
        fail_next: HashMap<&'static str, u16>,
        next_id: u32,
    }

    impl MockCompute {
        /// Mock mit kleinem Standard-Katalog.
        pub fn new() -> Self {
            let mock = Self::default();
            {
                let mut state = mock.state.lock().unwrap();
                state.flavors = vec![
                    Flavor { id: "f1".into(), ram: 512 },
                    Flavor { id: "f2".into(), ram: 2048 },
                    Flavor { id: "f3".into(), ram: 8192 },
                ];
                state.images = vec![
                    Image { id: "img-1".into(), name: "cirros".into() },
                    Image { id: "img-2".into(), name: "debian".into() },
                ];
            }
            mock
        }

        /// Mock ohne Katalog, für Bootstrap-Fehlerfälle.
        pub fn bare() -> Self {
            Self::default()
        }

        pub fn make_server(id: &str, name: &str, status: &str, flavor_id: &str) -> ServerInfo {
            ServerInfo {
                id: id.to_string(),
                name: name.to_string(),
                status: status.to_string(),
                flavor_id: flavor_id.to_string(),
            }
        }

        pub fn add_server(&self, info: ServerInfo) {
            self.state.lock().unwrap().servers.push(info);
        }

        pub fn set_status(&self, id: &str, status: &str) {
            let mut state = self.state.lock().unwrap();
            if let Some(server) = state.servers.iter_mut().find(|s| s.id == id) {
                server.status = status.to_string();
            }
        }

        /// Entfernt den Server aus dem Listing (Abschluss eines Deletes).
        pub fn purge(&self, id: &str) {
            self.state.lock().unwrap().servers.retain(|s| s.id != id);
        }

        pub fn server(&self, id: &str) -> Option<ServerInfo> {
            self.state
                .lock()
                .unwrap()
                .servers
                .iter()
                .find(|s| s.id == id)
                .cloned()
        }

        pub fn servers(&self) -> Vec<ServerInfo> {
            self.state.lock().unwrap().servers.clone()
        }

        pub fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        pub fn calls_for(&self, method: &str) -> Vec<String> {
            let prefix = format!("{method}:");
            self.calls()
                .into_iter()
                .filter(|c| c.starts_with(&prefix))
                .collect()
        }

        /// Lässt den nächsten Call der Methode mit dem Code scheitern.
        pub fn fail_next(&self, method: &'static str, code: u16) {
            self.state.lock().unwrap().fail_next.insert(method, code);
        }

        fn begin(&self, method: &'static str, call: String) -> Result<(), ApiError> {
            let mut state = self.state.lock().unwrap();
            if let Some(code) = state.fail_next.remove(method) {
                return Err(ApiError::new(code, format!("scripted failure for {method}")));
            }
            state.calls.push(call);
            Ok(())
        }

        fn require_server(&self, id: &str) -> Result<(), ApiError> {
            if self.server(id).is_none() {
                return Err(ApiError::new(404, format!("no server {id}")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ComputeBackend for MockCompute {
        async fn list_flavors(&self) -> Result<Vec<Flavor>, ApiError> {
            Ok(self.state.lock().unwrap().flavors.clone())
        }

        async fn list_images(&self) -> Result<Vec<Image>, ApiError> {
            Ok(self.state.lock().unwrap().images.clone())
        }

        async fn list_servers(&self) -> Result<Vec<ServerInfo>, ApiError> {
            Ok(self.state.lock().unwrap().servers.clone())
        }

        async fn create_server(
            &self,
            name: &str,
            image_id: &str,
            flavor_id: &str,
        ) -> Result<ServerInfo, ApiError> {
            self.begin("create", format!("create:{name}:{image_id}:{flavor_id}"))?;

            let mut state = self.state.lock().unwrap();
            state.next_id += 1;
            let info = ServerInfo {
                id: format!("srv{:05}", state.next_id),
                name: name.to_string(),
                status: "BUILD".to_string(),
                flavor_id: flavor_id.to_string(),
            };
            state.servers.push(info.clone());
            Ok(info)
        }

        async fn set_password(&self, id: &str, _password: &str) -> Result<(), ApiError> {
            self.begin("set_password", format!("set_password:{id}"))?;
            self.require_server(id)
        }

        async fn resize_server(&self, id: &str, flavor_id: &str) -> Result<(), ApiError> {
            self.begin("resize", format!("resize:{id}:{flavor_id}"))?;
            self.require_server(id)
        }

        async fn confirm_resize(&self, id: &str) -> Result<(), ApiError> {
            self.begin("confirm_resize", format!("confirm_resize:{id}"))?;
            self.require_server(id)
        }

        async fn revert_resize(&self, id: &str) -> Result<(), ApiError> {
            self.begin("revert_resize", format!("revert_resize:{id}"))?;
            self.require_server(id)
        }

        async fn rescue(&self, id: &str) -> Result<(), ApiError> {
            self.begin("rescue", format!("rescue:{id}"))?;
            self.require_server(id)
        }

        async fn unrescue(&self, id: &str) -> Result<(), ApiError> {
            self.begin("unrescue", format!("unrescue:{id}"))?;
            self.require_server(id)
        }

        async fn delete_server(&self, id: &str) -> Result<(), ApiError> {
            self.begin("delete", format!("delete:{id}"))?;
            self.require_server(id)?;
            // Bleibt als DELETED im Listing, bis der Test `purge` aufruft.
            self.set_status(id, "DELETED");
            Ok(())
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::MockCompute;

    #[tokio::test]
    async fn test_wipe_servers_deletes_everything() {
        let backend = MockCompute::new();
        backend.add_server(MockCompute::make_server("one1", "a", "ACTIVE", "f1"));
        backend.add_server(MockCompute::make_server("two2", "b", "RESCUE", "f2"));

        let deleted = wipe_servers(&backend).await.unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(backend.calls_for("delete").len(), 2);
    }

    #[tokio::test]
    async fn test_wipe_servers_counts_only_successful_deletes() {
        let backend = MockCompute::new();
        backend.add_server(MockCompute::make_server("one1", "a", "ACTIVE", "f1"));
        backend.add_server(MockCompute::make_server("two2", "b", "ACTIVE", "f1"));
        backend.fail_next("delete", 500);

        // Der erste Delete scheitert, der Sweep läuft trotzdem weiter.
        let deleted = wipe_servers(&backend).await.unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(backend.calls_for("delete").len(), 1);
    }

    #[tokio::test]
    async fn test_wipe_servers_empty_listing() {
        let backend = MockCompute::new();
        let deleted = wipe_servers(&backend).await.unwrap();
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn test_mock_scripted_failure_is_one_shot() {
        let backend = MockCompute::new();
        backend.add_server(MockCompute::make_server("one1", "a", "ACTIVE", "f1"));
        backend.fail_next("rescue", 409);

        let err = backend.rescue("one1").await.unwrap_err();
        assert_eq!(err.code, 409);

        // Der zweite Call geht wieder durch.
        backend.rescue("one1").await.unwrap();
        assert_eq!(backend.calls_for("rescue").len(), 1);
    }

    #[test]
    fn test_run_options_from_config() {
        let run = vmstress_config::RunConfig {
            duration_secs: 60,
            poll_interval_secs: 2,
            parallel: true,
            wipe: true,
            seed: Some(9),
        };
        let options = RunOptions::from_config(&run);

        assert_eq!(options.duration, Duration::from_secs(60));
        assert_eq!(options.poll_interval, Duration::from_secs(2));
        assert!(options.parallel);
        assert!(options.wipe);
        assert_eq!(options.seed, Some(9));
    }
}
