//! Der Poll-Diff-Dispatch-Zyklus über eine Session.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use crate::api::ServerStatus;
use crate::operation::{Expectation, OpKind, Operation, Outcome};
use crate::select::weighted_sample;
use crate::session::Session;
use crate::{ComputeBackend, RunnerError, SessionStats};

/// Treibt genau eine Session bis zur Deadline.
///
/// Pro Iteration: Listing holen, beobachtete Transitionen gegen die
/// ausstehenden Operationen klassifizieren, verschwundene Instanzen
/// austragen, freie Instanzen mit neu gewürfelten Operationen versorgen.
/// Eine Protokollverletzung setzt das geteilte Abbruchsignal und beendet
/// den Loop mit Fehler.
pub struct ReconcileLoop {
    backend: Arc<dyn ComputeBackend>,
    session: Session,
    rng: StdRng,
    abort_tx: Arc<watch::Sender<bool>>,
    abort_rx: watch::Receiver<bool>,
    deadline: Instant,
    poll_interval: Duration,
    stats: SessionStats,
}

impl ReconcileLoop {
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        session: Session,
        rng: StdRng,
        abort_tx: Arc<watch::Sender<bool>>,
        abort_rx: watch::Receiver<bool>,
        deadline: Instant,
        poll_interval: Duration,
    ) -> Self {
        Self {
            backend,
            session,
            rng,
            abort_tx,
            abort_rx,
            deadline,
            poll_interval,
            stats: SessionStats::default(),
        }
    }

    pub async fn run(mut self) -> Result<SessionStats, RunnerError> {
        if let Err(err) = self.adopt_existing().await {
            let _ = self.abort_tx.send(true);
            return Err(err);
        }

        loop {
            // Abbruch-Checkpoint: eine andere Session hat eine Verletzung
            // gemeldet.
            if *self.abort_rx.borrow() {
                info!(session = %self.session.name, "aborting, another session failed");
                return Err(RunnerError::Aborted);
            }
            if Instant::now() >= self.deadline {
                break;
            }

            let progress = match self.iteration().await {
                Ok(progress) => progress,
                Err(err) => {
                    let _ = self.abort_tx.send(true);
                    return Err(err);
                }
            };
            self.stats.iterations += 1;

            if !progress {
                sleep(self.poll_interval).await;
            }
        }

        info!(
            session = %self.session.name,
            iterations = self.stats.iterations,
            dispatched = self.stats.dispatched,
            completed = self.stats.completed,
            expected_errors = self.stats.expected_errors,
            removed = self.stats.removed,
            remaining = self.session.len(),
            per_op = %self.stats.per_op_summary(),
            "session deadline reached"
        );
        Ok(self.stats)
    }

    /// Übernimmt beim Start alle bereits existierenden Server und versucht,
    /// aus ihrem Status eine vermutlich laufende Operation abzuleiten:
    /// BUILD -> Create, RESIZE -> Resize, RESCUE -> Rescue. Eine abgeleitete
    /// Operation, deren Erwartung der beobachtete Status schon erfüllt,
    /// gilt sofort als abgeschlossen.
    async fn adopt_existing(&mut self) -> Result<(), RunnerError> {
        let listing = self.backend.list_servers().await?;
        for info in &listing {
            let status = ServerStatus::parse(&info.status);
            let pending = match status {
                ServerStatus::Build => Some(Operation::recovered(
                    OpKind::Create,
                    Expectation::State(ServerStatus::Active),
                    info,
                )),
                ServerStatus::Resize => Some(Operation::recovered(
                    OpKind::Resize,
                    Expectation::State(ServerStatus::VerifyResize),
                    info,
                )),
                ServerStatus::Rescue => Some(Operation::recovered(
                    OpKind::Rescue,
                    Expectation::State(ServerStatus::Rescue),
                    info,
                )),
                _ => None,
            };
            let pending = pending.filter(|op| {
                !matches!(
                    op.update(&Expectation::State(status.clone())),
                    Outcome::Next
                )
            });

            let recovered = pending.as_ref().map(Operation::kind);
            let alias = self.session.adopt(info, pending);
            info!(
                session = %self.session.name,
                instance = %alias,
                status = %status,
                recovered = recovered.map(|k| k.as_str()).unwrap_or("none"),
                "adopted existing server"
            );
        }
        Ok(())
    }

    /// Eine Reconciliation-Iteration. Gibt zurück, ob irgendetwas passiert
    /// ist (Transition, Entfernung oder Dispatch); falls nicht, schläft der
    /// Aufrufer ein Poll-Intervall.
    async fn iteration(&mut self) -> Result<bool, RunnerError> {
        // Bootstrap: ohne Instanzen darf der Lauf nie leerdrehen.
        if self.session.is_empty() {
            self.dispatch_create().await?;
            return Ok(true);
        }

        let mut progress = false;

        let listing = self.backend.list_servers().await?;
        let mut seen = BTreeSet::new();
        for info in &listing {
            // Unbekannte Ids (fremde oder gerade erst entstehende Server)
            // werden diesen Zyklus übersprungen.
            if !self.session.contains(&info.id) {
                continue;
            }
            seen.insert(info.id.clone());

            let observed = ServerStatus::parse(&info.status);
            let Some(instance) = self.session.get(&info.id) else {
                continue;
            };
            let alias = instance.alias.clone();

            if instance.status != observed {
                progress = true;
                let outcome = instance
                    .pending
                    .as_ref()
                    .map(|op| (op.describe(), op.update(&Expectation::State(observed.clone()))));

                match outcome {
                    Some((op, Outcome::Next)) => {
                        info!(
                            session = %self.session.name,
                            instance = %alias,
                            %op,
                            observed = %observed,
                            "operation complete"
                        );
                        self.stats.completed += 1;
                        if let Some(instance) = self.session.get_mut(&info.id) {
                            instance.pending = None;
                        }
                    }
                    Some((op, Outcome::Wait)) => {
                        debug!(
                            session = %self.session.name,
                            instance = %alias,
                            %op,
                            observed = %observed,
                            "intermediate state, still waiting"
                        );
                    }
                    Some((op, Outcome::Fail { expected })) => {
                        error!(
                            session = %self.session.name,
                            instance = %alias,
                            %op,
                            observed = %observed,
                            expected = %expected,
                            "UNEXPECTED state transition"
                        );
                        return Err(RunnerError::ProtocolViolation {
                            session: self.session.name.clone(),
                            alias,
                            observed: format!("state:{observed}"),
                            expected: expected.to_string(),
                        });
                    }
                    None => {
                        info!(
                            session = %self.session.name,
                            instance = %alias,
                            observed = %observed,
                            "state changed with no pending operation"
                        );
                    }
                }
            }

            // Schattenzustand auffrischen, damit der nächste Dispatch gegen
            // den frischen Stand entscheidet.
            if let Some(instance) = self.session.get_mut(&info.id) {
                instance.status = observed;
                instance.flavor_id = info.flavor_id.clone();
            }
        }

        // Löschung zeigt sich als Fehlen im Listing.
        for id in self.session.ids() {
            if !seen.contains(&id) {
                if let Some(instance) = self.session.remove(&id) {
                    info!(
                        session = %self.session.name,
                        instance = %instance.alias,
                        "gone from listing, removed"
                    );
                    self.stats.removed += 1;
                    progress = true;
                }
            }
        }

        // Jede freie Instanz bekommt genau eine neu gewürfelte Operation.
        for id in self.session.ids() {
            let idle = self
                .session
                .get(&id)
                .map(|i| i.pending.is_none())
                .unwrap_or(false);
            if !idle {
                continue;
            }

            let kind = weighted_sample(&OpKind::DISPATCH_WEIGHTS, 1, &mut self.rng)[0];
            let mut op = Operation::new(kind, &self.session, &mut self.rng);

            let (alias, result) = {
                let Some(instance) = self.session.get(&id) else {
                    continue;
                };
                let result = op.execute(self.backend.as_ref(), instance).await;
                (instance.alias.clone(), result)
            };
            self.stats.count_dispatch(kind.as_str());
            progress = true;

            match result {
                Ok(()) => {
                    info!(
                        session = %self.session.name,
                        instance = %alias,
                        op = %op.describe(),
                        "dispatched"
                    );
                    if let Some(instance) = self.session.get_mut(&id) {
                        instance.pending = Some(op);
                    }
                }
                Err(err) => match op.update(&Expectation::Error(err.code)) {
                    Outcome::Next => {
                        info!(
                            session = %self.session.name,
                            instance = %alias,
                            op = %op.describe(),
                            code = err.code,
                            "service refused as expected"
                        );
                        self.stats.expected_errors += 1;
                        self.stats.completed += 1;
                    }
                    Outcome::Wait => {
                        if let Some(instance) = self.session.get_mut(&id) {
                            instance.pending = Some(op);
                        }
                    }
                    Outcome::Fail { expected } => {
                        error!(
                            session = %self.session.name,
                            instance = %alias,
                            op = %op.describe(),
                            code = err.code,
                            expected = %expected,
                            "UNEXPECTED service error"
                        );
                        return Err(RunnerError::ProtocolViolation {
                            session: self.session.name.clone(),
                            alias,
                            observed: format!("error:{}", err.code),
                            expected: expected.to_string(),
                        });
                    }
                },
            }
        }

        Ok(progress)
    }

    async fn dispatch_create(&mut self) -> Result<(), RunnerError> {
        let op = Operation::new(OpKind::Create, &self.session, &mut self.rng);
        let info = op.execute_create(self.backend.as_ref()).await?;
        let alias = self.session.adopt(&info, Some(op));
        info!(
            session = %self.session.name,
            instance = %alias,
            id = %info.id,
            "created new server"
        );
        self.stats.created += 1;
        self.stats.count_dispatch(OpKind::Create.as_str());
        Ok(())
    }
}
