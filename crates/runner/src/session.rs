//! Session- und Instanz-Registry.
//!
//! Eine Session gehört zu genau einem Credential-Satz und besitzt ihre
//! Instanzen exklusiv. Die Id-Map ist die autoritative Registry; die
//! Alias-Map ist ein abgeleiteter Index von Kurz-Alias auf volle Id und
//! bleibt bei jeder Mutation konsistent.

use std::collections::BTreeMap;

use crate::api::{Flavor, Image, ServerInfo, ServerStatus};
use crate::operation::Operation;

/// Lokaler Schatten eines Remote-Servers.
#[derive(Debug)]
pub struct Instance {
    pub id: String,
    /// Kürzester eindeutiger Präfix der Id, für kompakte Logs.
    pub alias: String,
    /// Zuletzt beobachteter Status. Wird in jedem Poll-Zyklus vor dem
    /// nächsten Dispatch aktualisiert, damit nie gegen veralteten Zustand
    /// entschieden wird.
    pub status: ServerStatus,
    pub flavor_id: String,
    /// Höchstens eine laufende Operation pro Instanz.
    pub pending: Option<Operation>,
}

/// Registry aller Instanzen eines Credential-Satzes plus der einmalig beim
/// Session-Start geladene Katalog.
pub struct Session {
    pub name: String,
    pub tenant: String,
    /// Aufsteigend nach Speichergröße sortiert.
    pub flavors: Vec<Flavor>,
    pub images: Vec<Image>,
    instances: BTreeMap<String, Instance>,
    /// Alias -> volle Id. Abgeleiteter Index, nie autoritativ.
    aliases: BTreeMap<String, String>,
}

impl Session {
    pub fn new(
        name: impl Into<String>,
        tenant: impl Into<String>,
        mut flavors: Vec<Flavor>,
        images: Vec<Image>,
    ) -> Self {
        flavors.sort_by_key(|f| f.ram);
        Self {
            name: name.into(),
            tenant: tenant.into(),
            flavors,
            images,
            instances: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }

    /// Nimmt einen Server aus dem Listing in die Registry auf und vergibt
    /// den kürzesten freien Id-Präfix als Alias. Bestehende Aliase werden
    /// dabei nie verändert und beim Entfernen nie nachträglich verkürzt.
    pub fn adopt(&mut self, info: &ServerInfo, pending: Option<Operation>) -> String {
        let alias = self.assign_alias(&info.id);
        let instance = Instance {
            id: info.id.clone(),
            alias: alias.clone(),
            status: ServerStatus::parse(&info.status),
            flavor_id: info.flavor_id.clone(),
            pending,
        };
        self.aliases.insert(alias.clone(), info.id.clone());
        self.instances.insert(info.id.clone(), instance);
        alias
    }

    fn assign_alias(&self, id: &str) -> String {
        for len in 1..=id.len() {
            let prefix = &id[..len];
            if !self.aliases.contains_key(prefix) {
                return prefix.to_string();
            }
        }
        // Bei eindeutigen Ids nur erreichbar, wenn ein fremder Alias exakt
        // der vollen Id entspricht; dann bleibt nur die volle Id selbst.
        id.to_string()
    }

    pub fn remove(&mut self, id: &str) -> Option<Instance> {
        let instance = self.instances.remove(id)?;
        self.aliases.remove(&instance.alias);
        Some(instance)
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Instance> {
        self.instances.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Snapshot aller Ids, für Iterationen die zwischendurch mutieren.
    pub fn ids(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }
}
