//! Traits abstraits pour le pipeline audio
//!
//! `AudioBackend` isole tout ce qui dépend de la plateforme : la session
//! audio, le moteur, le tap sur le nœud d'entrée et le nœud de lecture.
//! Deux implémentations existent :
//! - CpalBackend : périphériques réels via cpal
//! - MockBackend : backend en mémoire pour les tests

use async_trait::async_trait;

use crate::{AudioBuffer, AudioConfig, AudioFormat, AudioResult, HardwareFormat, SessionPolicy};

/// Callback de capture appelé par le thread audio temps réel
///
/// Il reçoit chaque buffer brut du périphérique d'entrée. Il ne doit jamais
/// bloquer.
pub type TapCallback = Box<dyn FnMut(&AudioBuffer) + Send + 'static>;

/// Paramètres consultatifs transmis à la session au moment du setup
#[derive(Clone, Debug, PartialEq)]
pub struct SessionRequest {
    pub preferred_sample_rate: f64,
    pub preferred_io_buffer_ms: f64,
    pub policy: SessionPolicy,
}

impl From<&AudioConfig> for SessionRequest {
    fn from(config: &AudioConfig) -> Self {
        Self {
            preferred_sample_rate: config.preferred_sample_rate,
            preferred_io_buffer_ms: config.preferred_io_buffer_ms,
            policy: config.policy.clone(),
        }
    }
}

impl SessionRequest {
    /// Taille de buffer d'E/S préférée, en frames, à la fréquence du périphérique
    pub fn io_buffer_frames(&self, sample_rate: f64) -> u32 {
        crate::config::frames_for_duration(sample_rate, self.preferred_io_buffer_ms)
    }
}

/// Session + moteur audio de la plateforme
///
/// Toutes les méthodes sont appelées depuis le thread de contrôle, jamais
/// depuis le callback de capture.
#[async_trait]
pub trait AudioBackend: Send {
    /// Applique catégorie, mode, options, fréquence et durée de buffer
    ///
    /// # Erreurs
    /// - `AudioError::SessionConfig` si le matériel refuse un paramètre
    async fn configure_session(&mut self, request: &SessionRequest) -> AudioResult<()>;

    /// Active la session ; le format matériel devient lisible
    async fn activate_session(&mut self) -> AudioResult<()>;

    /// Désactive la session et libère les périphériques
    async fn deactivate_session(&mut self) -> AudioResult<()>;

    /// Format réel du matériel, `None` tant que la session n'est pas active
    fn hardware_format(&self) -> Option<HardwareFormat>;

    /// Attache le nœud de lecture et le connecte au mixeur principal
    fn attach_player(&mut self, format: &AudioFormat) -> AudioResult<()>;

    /// Déconnecte et détache le nœud de lecture s'il est attaché
    fn detach_player(&mut self);

    /// Nombre de nœuds de lecture attachés
    fn attached_players(&self) -> usize;

    /// Active ou non l'annulation d'écho de la plateforme
    fn set_voice_processing(&mut self, enabled: bool) -> AudioResult<()>;

    /// Installe le callback de capture sur le nœud d'entrée
    fn install_tap(&mut self, callback: TapCallback) -> AudioResult<()>;

    /// Retire le callback de capture (sans effet s'il n'y en a pas)
    fn remove_tap(&mut self);

    /// Démarre le moteur
    ///
    /// # Erreurs
    /// - `AudioError::EngineStart` si le moteur refuse de démarrer
    async fn start(&mut self) -> AudioResult<()>;

    /// Arrête le moteur
    async fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Ajoute un buffer au format de mixage interne à la file de lecture
    ///
    /// File FIFO : les buffers sont joués dans l'ordre de soumission.
    fn schedule_buffer(&mut self, buffer: AudioBuffer) -> AudioResult<()>;

    /// Lance la lecture du nœud
    fn play_player(&mut self) -> AudioResult<()>;

    /// Arrête la lecture et vide la file
    fn stop_player(&mut self);

    fn is_player_playing(&self) -> bool;

    /// Informations sur les périphériques pour l'affichage
    fn device_info(&self) -> String {
        "Périphérique inconnu".to_string()
    }
}

/// Lecteur de musique de fond (collaborateur externe)
///
/// Il partage seulement le périphérique de sortie avec le pipeline. Il publie
/// lui-même son état via `Event::MusicState` et `Event::MusicPosition`.
pub trait BackgroundMusic: Send {
    fn stop(&mut self);

    fn is_playing(&self) -> bool;
}
