//! Reconciliation-Controller einer Session.
//!
//! Architektur wie ein Kubernetes-Controller: beobachteten Zustand pollen,
//! gegen die ausstehenden Operationen abgleichen, daraus die nächsten
//! Aktionen ableiten. Der Loop besitzt seine Session exklusiv; zwischen
//! Sessions wird nichts geteilt außer dem Abbruchsignal.

use std::collections::BTreeMap;

mod reconcile_loop;

pub use reconcile_loop::ReconcileLoop;

/// Zähler über die Laufzeit einer Session, fürs Abschluss-Log.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub iterations: u64,
    /// Abgesetzte Operationen, Create eingeschlossen.
    pub dispatched: u64,
    pub created: u64,
    /// Über `update` als `next` abgeschlossene Operationen.
    pub completed: u64,
    /// Service-Fehler, die exakt der vorberechneten Erwartung entsprachen.
    pub expected_errors: u64,
    /// Aus dem Listing verschwundene (gelöschte) Instanzen.
    pub removed: u64,
    /// Dispatches pro Operationsart.
    pub per_op: BTreeMap<&'static str, u64>,
}

impl SessionStats {
    pub(crate) fn count_dispatch(&mut self, kind: &'static str) {
        self.dispatched += 1;
        *self.per_op.entry(kind).or_insert(0) += 1;
    }

    /// Kompakte Zusammenfassung wie `create=3 resize=2` fürs Abschluss-Log.
    pub fn per_op_summary(&self) -> String {
        self.per_op
            .iter()
            .map(|(kind, count)| format!("{kind}={count}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
