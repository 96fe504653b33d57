//! Startet eine Session pro Credential-Satz und sammelt die Ergebnisse ein.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

use vmstress_config::Credential;

use crate::controller::{ReconcileLoop, SessionStats};
use crate::session::Session;
use crate::{wipe_servers, ComputeBackend, RunOptions, RunnerError};

/// Fährt die Sessions, sequenziell oder je eine tokio-Task.
///
/// Sessions koordinieren sich nicht untereinander; das einzige geteilte
/// Stück ist der watch-Kanal, über den eine Protokollverletzung alle
/// anderen Loops an ihrem nächsten Checkpoint stoppt. Die Deadline läuft
/// pro Session ab deren Start, im sequenziellen Modus bekommt also jede
/// Session die volle Laufzeit.
pub struct SessionDriver {
    backends: Vec<(Credential, Arc<dyn ComputeBackend>)>,
    options: RunOptions,
}

impl SessionDriver {
    pub fn new(backends: Vec<(Credential, Arc<dyn ComputeBackend>)>, options: RunOptions) -> Self {
        Self { backends, options }
    }

    pub async fn run(self) -> Result<Vec<SessionStats>, RunnerError> {
        let (abort_tx, abort_rx) = watch::channel(false);
        let abort_tx = Arc::new(abort_tx);

        // Katalog und Registry jeder Session vollständig aufbauen, bevor
        // irgendein Worker startet.
        let mut prepared = Vec::new();
        for (index, (credential, backend)) in self.backends.into_iter().enumerate() {
            if self.options.wipe {
                let deleted = wipe_servers(backend.as_ref()).await?;
                info!(session = %credential.name, deleted, "wiped existing servers");
            }

            let flavors = backend.list_flavors().await?;
            let images = backend.list_images().await?;
            if flavors.is_empty() || images.is_empty() {
                return Err(RunnerError::EmptyCatalog(credential.name));
            }

            let rng = match self.options.seed {
                // Pro Worker ein eigener, aber reproduzierbar abgeleiteter
                // Strom.
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(index as u64)),
                None => StdRng::from_entropy(),
            };
            let session = Session::new(&credential.name, &credential.tenant, flavors, images);
            info!(
                session = %session.name,
                tenant = %session.tenant,
                flavors = session.flavors.len(),
                images = session.images.len(),
                "session prepared"
            );
            prepared.push((session, rng, backend));
        }

        let mut stats = Vec::with_capacity(prepared.len());
        let mut first_error: Option<RunnerError> = None;

        if self.options.parallel {
            let mut handles = Vec::with_capacity(prepared.len());
            for (session, rng, backend) in prepared {
                let reconcile = ReconcileLoop::new(
                    backend,
                    session,
                    rng,
                    abort_tx.clone(),
                    abort_rx.clone(),
                    Instant::now() + self.options.duration,
                    self.options.poll_interval,
                );
                handles.push(tokio::spawn(reconcile.run()));
            }
            for handle in handles {
                match handle.await {
                    Ok(Ok(session_stats)) => stats.push(session_stats),
                    Ok(Err(err)) => first_error = prefer(first_error, err),
                    Err(join_err) => {
                        first_error =
                            prefer(first_error, RunnerError::Worker(join_err.to_string()));
                    }
                }
            }
        } else {
            for (session, rng, backend) in prepared {
                let reconcile = ReconcileLoop::new(
                    backend,
                    session,
                    rng,
                    abort_tx.clone(),
                    abort_rx.clone(),
                    Instant::now() + self.options.duration,
                    self.options.poll_interval,
                );
                match reconcile.run().await {
                    Ok(session_stats) => stats.push(session_stats),
                    Err(err) => {
                        first_error = prefer(first_error, err);
                        break;
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }
}

/// Die eigentliche Verletzung schlägt den bloßen Mitabbruch: wer wegen des
/// Signals einer anderen Session stoppt, ist nicht die Ursache.
fn prefer(current: Option<RunnerError>, new: RunnerError) -> Option<RunnerError> {
    match (&current, &new) {
        (None, _) => Some(new),
        (Some(RunnerError::Aborted), RunnerError::ProtocolViolation { .. }) => Some(new),
        _ => current,
    }
}
