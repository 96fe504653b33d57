//! Lifecycle-Operationen und ihre Zustandsmaschine.
//!
//! Jede Operation deklariert beim Absetzen des Remote-Calls, welchen
//! Folgezustand (oder welchen Fehlercode) sie erwartet. `update` ordnet
//! jede danach beobachtete Transition einem von drei Ausgängen zu:
//! `Next` (fertig), `Wait` (legitimer Zwischenzustand) oder `Fail`
//! (Protokollverletzung, fatal). Die Übergangstabellen stehen explizit
//! pro Variante in `is_wait_state` und `expectation_for`.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::warn;

use crate::api::{ApiError, ServerInfo, ServerStatus};
use crate::session::{Instance, Session};
use crate::ComputeBackend;

/// Tag einer Operationsart, für die gewichtete Auswahl.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    SetPassword,
    Resize,
    ConfirmResize,
    RevertResize,
    Rescue,
    Unrescue,
    Delete,
}

impl OpKind {
    /// Kandidatenliste für den Dispatch an freie Instanzen. Create fehlt
    /// bewusst: neue Instanzen entstehen nur über den Bootstrap-Pfad des
    /// Reconciliation-Loops.
    pub const DISPATCH_WEIGHTS: [(u32, OpKind); 7] = [
        (1, OpKind::SetPassword),
        (1, OpKind::Resize),
        (1, OpKind::ConfirmResize),
        (1, OpKind::RevertResize),
        (1, OpKind::Rescue),
        (1, OpKind::Unrescue),
        (1, OpKind::Delete),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::SetPassword => "set_password",
            Self::Resize => "resize",
            Self::ConfirmResize => "confirm_resize",
            Self::RevertResize => "revert_resize",
            Self::Rescue => "rescue",
            Self::Unrescue => "unrescue",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Erwartetes Resultat einer Operation: entweder ein Zielzustand oder ein
/// Fehlercode, den der Dienst zurückgeben muss.
///
/// Derselbe Typ dient als Beobachtung: der Loop verfüttert sowohl
/// Status-Deltas als auch Service-Fehler als `Expectation` an `update`,
/// damit die fail/wait/next-Entscheidung nur einmal existiert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expectation {
    State(ServerStatus),
    Error(u16),
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(status) => write!(f, "state:{status}"),
            Self::Error(code) => write!(f, "error:{code}"),
        }
    }
}

/// Klassifikation einer beobachteten Transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Operation abgeschlossen, Instanz wieder frei.
    Next,
    /// Legitimer Zwischenzustand, Operation bleibt ausstehend.
    Wait,
    /// Protokollverletzung. Fatal für den gesamten Lauf.
    Fail { expected: Expectation },
}

/// Variantenspezifische Parameter, beim `setup` (Konstruktor) gewürfelt.
#[derive(Debug, Clone)]
enum Action {
    Create {
        name: String,
        image_id: String,
        flavor_id: String,
    },
    SetPassword {
        password: String,
    },
    Resize {
        flavor_id: String,
    },
    ConfirmResize,
    RevertResize,
    Rescue,
    Unrescue,
    Delete,
}

#[derive(Debug)]
pub struct Operation {
    action: Action,
    /// Wird spätestens in `execute` aus der Vorbedingung berechnet.
    /// Default ist `state:ACTIVE`.
    pub expected: Expectation,
}

impl Operation {
    /// setup(): würfelt die variantenspezifischen Parameter. Kein
    /// Remote-Effekt. Setzt einen nicht-leeren Katalog voraus (der Driver
    /// prüft das beim Session-Start).
    pub fn new(kind: OpKind, session: &Session, rng: &mut impl Rng) -> Self {
        let action = match kind {
            OpKind::Create => {
                let image = &session.images[rng.gen_range(0..session.images.len())];
                let flavor = &session.flavors[rng.gen_range(0..session.flavors.len())];
                Action::Create {
                    name: format!("{}-{:08x}", session.name, rng.gen::<u32>()),
                    image_id: image.id.clone(),
                    flavor_id: flavor.id.clone(),
                }
            }
            OpKind::SetPassword => {
                let password: String = (0..12)
                    .map(|_| rng.sample(Alphanumeric) as char)
                    .collect();
                Action::SetPassword { password }
            }
            OpKind::Resize => {
                // Darf auch der aktuelle Flavor sein: dann wird bewusst der
                // error:400-Pfad des Dienstes geprüft.
                let flavor = &session.flavors[rng.gen_range(0..session.flavors.len())];
                Action::Resize {
                    flavor_id: flavor.id.clone(),
                }
            }
            OpKind::ConfirmResize => Action::ConfirmResize,
            OpKind::RevertResize => Action::RevertResize,
            OpKind::Rescue => Action::Rescue,
            OpKind::Unrescue => Action::Unrescue,
            OpKind::Delete => Action::Delete,
        };

        Self {
            action,
            expected: Expectation::State(ServerStatus::Active),
        }
    }

    /// Rekonstruiert eine vermutlich laufende Operation nach einem Neustart.
    /// Rekonstruierte Operationen werden nie erneut ausgeführt, nur ihre
    /// `update`-Logik wird gebraucht; Parameter sind Platzhalter aus dem
    /// Listing.
    pub fn recovered(kind: OpKind, expected: Expectation, info: &ServerInfo) -> Self {
        let action = match kind {
            OpKind::Create => Action::Create {
                name: info.name.clone(),
                image_id: String::new(),
                flavor_id: info.flavor_id.clone(),
            },
            OpKind::SetPassword => Action::SetPassword {
                password: String::new(),
            },
            OpKind::Resize => Action::Resize {
                flavor_id: info.flavor_id.clone(),
            },
            OpKind::ConfirmResize => Action::ConfirmResize,
            OpKind::RevertResize => Action::RevertResize,
            OpKind::Rescue => Action::Rescue,
            OpKind::Unrescue => Action::Unrescue,
            OpKind::Delete => Action::Delete,
        };
        Self { action, expected }
    }

    pub fn kind(&self) -> OpKind {
        match self.action {
            Action::Create { .. } => OpKind::Create,
            Action::SetPassword { .. } => OpKind::SetPassword,
            Action::Resize { .. } => OpKind::Resize,
            Action::ConfirmResize => OpKind::ConfirmResize,
            Action::RevertResize => OpKind::RevertResize,
            Action::Rescue => OpKind::Rescue,
            Action::Unrescue => OpKind::Unrescue,
            Action::Delete => OpKind::Delete,
        }
    }

    pub fn describe(&self) -> String {
        format!("{} -> {}", self.kind(), self.expected)
    }

    /// Vorbedingungstabelle: berechnet aus dem zuletzt beobachteten Zustand
    /// der Instanz, was der Dienst auf diesen Call antworten muss.
    fn expectation_for(&self, instance: &Instance) -> Expectation {
        use Expectation::{Error, State};
        use ServerStatus as S;

        match &self.action {
            Action::Create { .. } | Action::SetPassword { .. } => State(S::Active),
            Action::Resize { flavor_id } => {
                if instance.status != S::Active {
                    Error(409)
                } else if *flavor_id == instance.flavor_id {
                    Error(400)
                } else {
                    State(S::VerifyResize)
                }
            }
            Action::ConfirmResize | Action::RevertResize => {
                if instance.status == S::VerifyResize {
                    State(S::Active)
                } else {
                    Error(409)
                }
            }
            Action::Rescue => {
                if instance.status == S::Active {
                    State(S::Rescue)
                } else {
                    Error(409)
                }
            }
            Action::Unrescue => {
                if instance.status == S::Rescue {
                    State(S::Active)
                } else {
                    Error(409)
                }
            }
            // Delete endet über das Verschwinden aus dem Listing, nicht über
            // einen Zielzustand; das Tag dient nur der Diagnose.
            Action::Delete => State(S::Active),
        }
    }

    /// Berechnet die Erwartung und setzt den Remote-Call ab.
    ///
    /// Eine verletzte Vorbedingung ist kein lokaler Fehler: die Erwartung
    /// wechselt auf den Fehlercode, den der Dienst zurückgeben muss, und
    /// der Call geht trotzdem raus. Für Create stattdessen
    /// `execute_create` verwenden.
    pub async fn execute(
        &mut self,
        backend: &dyn ComputeBackend,
        instance: &Instance,
    ) -> Result<(), ApiError> {
        self.expected = self.expectation_for(instance);
        if let Expectation::Error(code) = self.expected {
            warn!(
                instance = %instance.alias,
                op = %self.kind(),
                code,
                "precondition not met, expecting service error"
            );
        }

        match &self.action {
            Action::SetPassword { password } => {
                backend.set_password(&instance.id, password).await
            }
            Action::Resize { flavor_id } => backend.resize_server(&instance.id, flavor_id).await,
            Action::ConfirmResize => backend.confirm_resize(&instance.id).await,
            Action::RevertResize => backend.revert_resize(&instance.id).await,
            Action::Rescue => backend.rescue(&instance.id).await,
            Action::Unrescue => backend.unrescue(&instance.id).await,
            Action::Delete => backend.delete_server(&instance.id).await,
            Action::Create { .. } => Err(ApiError::new(
                0,
                "create has no target instance, use execute_create",
            )),
        }
    }

    /// Der Create-Pfad: einzige Variante, die eine neue Instanz liefert.
    /// Der Aufrufer registriert die Instanz und hängt diese Operation als
    /// pending an.
    pub async fn execute_create(
        &self,
        backend: &dyn ComputeBackend,
    ) -> Result<ServerInfo, ApiError> {
        match &self.action {
            Action::Create {
                name,
                image_id,
                flavor_id,
            } => backend.create_server(name, image_id, flavor_id).await,
            _ => Err(ApiError::new(0, "not a create operation")),
        }
    }

    /// Klassifiziert eine beobachtete Transition gegen die Erwartung.
    pub fn update(&self, observed: &Expectation) -> Outcome {
        // Delete kennt kein Erfolgs-Tag: ACTIVE und DELETED gelten beide
        // als "noch ausstehend" (Async-Delete-Semantik des Dienstes),
        // alles andere ist eine Verletzung.
        if self.kind() == OpKind::Delete {
            return match observed {
                Expectation::State(ServerStatus::Active | ServerStatus::Deleted) => Outcome::Wait,
                _ => Outcome::Fail {
                    expected: self.expected.clone(),
                },
            };
        }

        if *observed == self.expected {
            return Outcome::Next;
        }
        if let Expectation::State(status) = observed {
            if self.is_wait_state(status) {
                return Outcome::Wait;
            }
        }
        Outcome::Fail {
            expected: self.expected.clone(),
        }
    }

    /// Zwischenzustände, in denen die Operation legitim "noch läuft".
    fn is_wait_state(&self, status: &ServerStatus) -> bool {
        matches!(
            (self.kind(), status),
            (OpKind::SetPassword, ServerStatus::Password)
                | (OpKind::Resize, ServerStatus::Resize)
                | (OpKind::RevertResize, ServerStatus::RevertResize)
        )
    }
}
