//! Événements publiés vers la couche de notification (UI, bridge hôte)
//!
//! La livraison est best-effort : un notifier absent ou défaillant ne change
//! rien au fonctionnement du pipeline.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{AudioError, ErrorKind, SetupStage};

/// Événement de statut ou d'erreur
///
/// Sérialisé sous la forme `{"type": "error" | "music_state" | "music_position", ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Error { kind: ErrorKind, message: String },
    MusicState { playing: bool },
    MusicPosition { position_secs: f64, duration_secs: f64 },
}

impl Event {
    pub fn error(err: &AudioError) -> Self {
        Event::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// Erreur de setup : le message commence par l'étape en échec
    pub fn setup_error(stage: SetupStage, err: &AudioError) -> Self {
        Event::Error {
            kind: err.kind(),
            message: format!("{}: {}", stage, err),
        }
    }
}

/// Destination des événements
///
/// `notify` peut être appelée depuis le thread audio temps réel : une
/// implémentation ne doit jamais bloquer.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: Event);
}

/// Notifier qui se contente de tracer les événements
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: Event) {
        match &event {
            Event::Error { kind, message } => tracing::warn!(?kind, %message, "❌ erreur audio"),
            other => tracing::debug!(event = ?other, "événement audio"),
        }
    }
}

impl Notifier for mpsc::UnboundedSender<Event> {
    fn notify(&self, event: Event) {
        // Récepteur fermé = plus personne n'écoute, ce n'est pas une erreur
        let _ = self.send(event);
    }
}

/// Notifier partagé entre le contrôleur et le callback de capture
pub type SharedNotifier = Arc<dyn Notifier>;

/// Publie une erreur : toujours tracée, transmise au notifier s'il existe
pub(crate) fn report(notifier: Option<&SharedNotifier>, err: &AudioError) {
    tracing::warn!(kind = ?err.kind(), "❌ {}", err);
    if let Some(notifier) = notifier {
        notifier.notify(Event::error(err));
    }
}

/// Publie l'échec d'une étape du setup
pub(crate) fn report_setup(notifier: Option<&SharedNotifier>, stage: SetupStage, err: &AudioError) {
    tracing::warn!(kind = ?err.kind(), %stage, "❌ échec du setup: {}", err);
    if let Some(notifier) = notifier {
        notifier.notify(Event::setup_error(stage, err));
    }
}
