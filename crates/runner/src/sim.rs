//! In-Prozess-Simulation des Compute-Dienstes.
//!
//! Erlaubt einen vollständigen Lauf ohne echten Dienst dahinter: Server
//! durchlaufen ihre Zwischenzustände selbstständig (ein Schritt pro
//! Listing-Poll), Vorbedingungen werden mit denselben Fehlercodes
//! durchgesetzt, die der echte Dienst liefert. Taugt damit auch als
//! Gegenspieler für End-to-End-Tests des Reconciliation-Loops.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::api::{ApiError, Flavor, Image, ServerInfo};
use crate::ComputeBackend;

#[derive(Debug, Clone)]
enum Settle {
    /// Statuswechsel nach Ablauf der Ticks.
    Become(&'static str),
    /// Wie `Become("ACTIVE")`, zusätzlich den alten Flavor zurückdrehen.
    RestoreFlavor,
    /// Aus dem Listing verschwinden.
    Remove,
}

#[derive(Debug, Clone)]
struct SimServer {
    id: String,
    name: String,
    status: String,
    flavor_id: String,
    /// Flavor vor einem laufenden Resize, für revert.
    old_flavor: Option<String>,
    settle: Option<(u8, Settle)>,
}

impl SimServer {
    fn info(&self) -> ServerInfo {
        ServerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status.clone(),
            flavor_id: self.flavor_id.clone(),
        }
    }
}

#[derive(Default)]
struct SimState {
    servers: BTreeMap<String, SimServer>,
    next_id: u32,
}

impl SimState {
    /// Ein Simulationsschritt: alle terminierenden Übergänge um einen Tick
    /// weiterdrehen. Wird von jedem Listing-Poll getrieben.
    fn tick(&mut self) {
        let mut gone = Vec::new();
        for server in self.servers.values_mut() {
            let Some((ticks, settle)) = server.settle.take() else {
                continue;
            };
            if ticks > 1 {
                server.settle = Some((ticks - 1, settle));
                continue;
            }
            match settle {
                Settle::Become(status) => server.status = status.to_string(),
                Settle::RestoreFlavor => {
                    server.status = "ACTIVE".to_string();
                    if let Some(flavor) = server.old_flavor.take() {
                        server.flavor_id = flavor;
                    }
                }
                Settle::Remove => gone.push(server.id.clone()),
            }
        }
        for id in gone {
            self.servers.remove(&id);
        }
    }

    fn server_mut(&mut self, id: &str) -> Result<&mut SimServer, ApiError> {
        self.servers
            .get_mut(id)
            .ok_or_else(|| ApiError::new(404, format!("no server {id}")))
    }
}

pub struct SimCompute {
    state: Mutex<SimState>,
    flavors: Vec<Flavor>,
    images: Vec<Image>,
}

impl SimCompute {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            flavors: vec![
                Flavor { id: "sim-small".into(), ram: 512 },
                Flavor { id: "sim-medium".into(), ram: 2048 },
                Flavor { id: "sim-large".into(), ram: 8192 },
            ],
            images: vec![
                Image { id: "sim-img-1".into(), name: "cirros".into() },
                Image { id: "sim-img-2".into(), name: "debian".into() },
            ],
        }
    }

    fn require_active(server: &SimServer) -> Result<(), ApiError> {
        if server.status != "ACTIVE" {
            return Err(ApiError::new(
                409,
                format!("server {} is {}, not ACTIVE", server.id, server.status),
            ));
        }
        Ok(())
    }

    fn require_verify_resize(server: &SimServer) -> Result<(), ApiError> {
        if server.status != "VERIFY_RESIZE" {
            return Err(ApiError::new(
                409,
                format!("server {} is {}, not VERIFY_RESIZE", server.id, server.status),
            ));
        }
        Ok(())
    }
}

impl Default for SimCompute {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeBackend for SimCompute {
    async fn list_flavors(&self) -> Result<Vec<Flavor>, ApiError> {
        Ok(self.flavors.clone())
    }

    async fn list_images(&self) -> Result<Vec<Image>, ApiError> {
        Ok(self.images.clone())
    }

    async fn list_servers(&self) -> Result<Vec<ServerInfo>, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.tick();
        Ok(state.servers.values().map(SimServer::info).collect())
    }

    async fn create_server(
        &self,
        name: &str,
        _image_id: &str,
        flavor_id: &str,
    ) -> Result<ServerInfo, ApiError> {
        if !self.flavors.iter().any(|f| f.id == flavor_id) {
            return Err(ApiError::new(400, format!("unknown flavor {flavor_id}")));
        }

        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let server = SimServer {
            id: format!("{:08x}", 0x5e00_0000u32 + state.next_id),
            name: name.to_string(),
            status: "BUILD".to_string(),
            flavor_id: flavor_id.to_string(),
            old_flavor: None,
            settle: Some((2, Settle::Become("ACTIVE"))),
        };
        let info = server.info();
        state.servers.insert(server.id.clone(), server);
        Ok(info)
    }

    async fn set_password(&self, id: &str, password: &str) -> Result<(), ApiError> {
        if password.is_empty() {
            return Err(ApiError::new(400, "empty password"));
        }
        let mut state = self.state.lock().unwrap();
        let server = state.server_mut(id)?;
        // Passwort setzen ist aus jedem Zustand erlaubt und endet immer in
        // ACTIVE, passend zur vorbedingungslosen Operation.
        server.status = "PASSWORD".to_string();
        server.old_flavor = None;
        server.settle = Some((2, Settle::Become("ACTIVE")));
        Ok(())
    }

    async fn resize_server(&self, id: &str, flavor_id: &str) -> Result<(), ApiError> {
        if !self.flavors.iter().any(|f| f.id == flavor_id) {
            return Err(ApiError::new(400, format!("unknown flavor {flavor_id}")));
        }
        let mut state = self.state.lock().unwrap();
        let server = state.server_mut(id)?;
        Self::require_active(server)?;
        if server.flavor_id == flavor_id {
            return Err(ApiError::new(400, "resize to the current flavor"));
        }
        server.old_flavor = Some(server.flavor_id.clone());
        server.flavor_id = flavor_id.to_string();
        server.status = "RESIZE".to_string();
        server.settle = Some((2, Settle::Become("VERIFY_RESIZE")));
        Ok(())
    }

    async fn confirm_resize(&self, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        let server = state.server_mut(id)?;
        Self::require_verify_resize(server)?;
        server.old_flavor = None;
        server.status = "ACTIVE".to_string();
        server.settle = None;
        Ok(())
    }

    async fn revert_resize(&self, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        let server = state.server_mut(id)?;
        Self::require_verify_resize(server)?;
        server.status = "REVERT_RESIZE".to_string();
        server.settle = Some((2, Settle::RestoreFlavor));
        Ok(())
    }

    async fn rescue(&self, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        let server = state.server_mut(id)?;
        Self::require_active(server)?;
        server.status = "RESCUE".to_string();
        server.settle = None;
        Ok(())
    }

    async fn unrescue(&self, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        let server = state.server_mut(id)?;
        if server.status != "RESCUE" {
            return Err(ApiError::new(
                409,
                format!("server {} is {}, not RESCUE", id, server.status),
            ));
        }
        server.status = "ACTIVE".to_string();
        Ok(())
    }

    async fn delete_server(&self, id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        let server = state.server_mut(id)?;
        server.status = "DELETED".to_string();
        server.settle = Some((2, Settle::Remove));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_active(sim: &SimCompute) -> String {
        let info = sim
            .create_server("stress-1", "sim-img-1", "sim-small")
            .await
            .unwrap();
        assert_eq!(info.status, "BUILD");
        // Zwei Polls lassen den Build fertig werden.
        sim.list_servers().await.unwrap();
        sim.list_servers().await.unwrap();
        info.id
    }

    async fn status_of(sim: &SimCompute, id: &str) -> Option<String> {
        sim.list_servers()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.id == id)
            .map(|s| s.status)
    }

    #[tokio::test]
    async fn test_create_settles_to_active() {
        let sim = SimCompute::new();
        let id = create_active(&sim).await;
        assert_eq!(status_of(&sim, &id).await.as_deref(), Some("ACTIVE"));
    }

    #[tokio::test]
    async fn test_resize_flow_and_confirm() {
        let sim = SimCompute::new();
        let id = create_active(&sim).await;

        sim.resize_server(&id, "sim-large").await.unwrap();
        assert_eq!(status_of(&sim, &id).await.as_deref(), Some("RESIZE"));
        assert_eq!(status_of(&sim, &id).await.as_deref(), Some("VERIFY_RESIZE"));

        sim.confirm_resize(&id).await.unwrap();
        let server = sim
            .list_servers()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.id == id)
            .unwrap();
        assert_eq!(server.status, "ACTIVE");
        assert_eq!(server.flavor_id, "sim-large");
    }

    #[tokio::test]
    async fn test_revert_restores_old_flavor() {
        let sim = SimCompute::new();
        let id = create_active(&sim).await;

        sim.resize_server(&id, "sim-medium").await.unwrap();
        sim.list_servers().await.unwrap();
        sim.list_servers().await.unwrap();

        sim.revert_resize(&id).await.unwrap();
        sim.list_servers().await.unwrap();
        let server = sim
            .list_servers()
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.id == id)
            .unwrap();
        assert_eq!(server.status, "ACTIVE");
        assert_eq!(server.flavor_id, "sim-small");
    }

    #[tokio::test]
    async fn test_resize_preconditions_enforced() {
        let sim = SimCompute::new();
        let id = create_active(&sim).await;

        // Gleicher Flavor -> 400.
        let err = sim.resize_server(&id, "sim-small").await.unwrap_err();
        assert_eq!(err.code, 400);

        // Nicht ACTIVE -> 409.
        sim.rescue(&id).await.unwrap();
        let err = sim.resize_server(&id, "sim-large").await.unwrap_err();
        assert_eq!(err.code, 409);
    }

    #[tokio::test]
    async fn test_rescue_unrescue() {
        let sim = SimCompute::new();
        let id = create_active(&sim).await;

        let err = sim.unrescue(&id).await.unwrap_err();
        assert_eq!(err.code, 409);

        sim.rescue(&id).await.unwrap();
        assert_eq!(status_of(&sim, &id).await.as_deref(), Some("RESCUE"));
        sim.unrescue(&id).await.unwrap();
        assert_eq!(status_of(&sim, &id).await.as_deref(), Some("ACTIVE"));
    }

    #[tokio::test]
    async fn test_delete_disappears_from_listing() {
        let sim = SimCompute::new();
        let id = create_active(&sim).await;

        sim.delete_server(&id).await.unwrap();
        assert_eq!(status_of(&sim, &id).await.as_deref(), Some("DELETED"));
        assert_eq!(status_of(&sim, &id).await, None);
    }

    #[tokio::test]
    async fn test_confirm_without_resize_is_409() {
        let sim = SimCompute::new();
        let id = create_active(&sim).await;
        let err = sim.confirm_resize(&id).await.unwrap_err();
        assert_eq!(err.code, 409);
    }
}
