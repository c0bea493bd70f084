//! Configuration audio du pipeline
//!
//! Ces paramètres sont consultatifs : ils décrivent ce que l'application
//! souhaite (canaux, fréquence, durée de buffer, politique de routage), mais
//! les formats réellement utilisés viennent toujours du matériel une fois la
//! session active.

use serde::{Deserialize, Serialize};

/// Catégorie de session demandée à la plateforme
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionCategory {
    /// Capture et lecture simultanées
    PlayAndRecord,
    /// Lecture seule (pas de micro), refusée par `AudioConfig::validate`
    Playback,
}

/// Mode de session : oriente le traitement appliqué par la plateforme
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Default,
    /// Traitement adapté à la voix (AGC, annulation d'écho côté plateforme)
    VoiceChat,
}

/// Politique de routage souhaitée
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPolicy {
    pub category: SessionCategory,
    pub mode: SessionMode,
    /// Préférer le haut-parleur au récepteur
    pub prefer_speaker: bool,
    /// Autoriser les périphériques bluetooth
    pub allow_bluetooth: bool,
    /// Se mixer avec l'audio des autres applications
    pub mix_with_others: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            category: SessionCategory::PlayAndRecord,
            mode: SessionMode::Default,
            prefer_speaker: true,
            allow_bluetooth: true,
            mix_with_others: false,
        }
    }
}

/// Configuration principale du pipeline audio
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Nombre de canaux demandé, utilisé seulement avant activation de la session
    pub channels: u16,

    /// Fréquence préférée en Hz
    ///
    /// Sert de valeur par défaut tant que le matériel n'a pas rapporté sa
    /// fréquence réelle.
    pub preferred_sample_rate: f64,

    /// Durée de buffer d'E/S préférée en millisecondes
    ///
    /// Plus petit = moins de latence, plus de callbacks par seconde
    pub preferred_io_buffer_ms: f64,

    /// Active l'annulation d'écho de la plateforme si elle existe
    pub echo_cancellation: bool,

    /// Politique de routage (catégorie, mode, options)
    pub policy: SessionPolicy,

    /// Capacité du canal broadcast des chunks capturés
    ///
    /// Un abonné trop lent perd les chunks les plus anciens, jamais le callback.
    pub capture_channel_capacity: usize,
}

/// Frames couvertes par `duration_ms` à `sample_rate`, arrondi au plus proche
pub(crate) fn frames_for_duration(sample_rate: f64, duration_ms: f64) -> u32 {
    (sample_rate * duration_ms / 1000.0).round() as u32
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            preferred_sample_rate: 48_000.0,
            preferred_io_buffer_ms: 20.0,
            echo_cancellation: false,
            policy: SessionPolicy::default(),
            capture_channel_capacity: 64,
        }
    }
}

impl AudioConfig {
    /// Nombre de frames correspondant à la durée de buffer préférée
    ///
    /// Exemple : 20ms à 48 kHz = 960 frames
    pub fn io_buffer_frames(&self, sample_rate: f64) -> u32 {
        frames_for_duration(sample_rate, self.preferred_io_buffer_ms)
    }

    /// Valide que la configuration est cohérente
    pub fn validate(&self) -> Result<(), String> {
        if self.channels == 0 || self.channels > 8 {
            return Err(format!(
                "Nombre de canaux invalide: {} (doit être entre 1 et 8)",
                self.channels
            ));
        }

        if !(8_000.0..=192_000.0).contains(&self.preferred_sample_rate) {
            return Err(format!(
                "Sample rate invalide: {} (doit être entre 8000 et 192000)",
                self.preferred_sample_rate
            ));
        }

        if !(1.0..=500.0).contains(&self.preferred_io_buffer_ms) {
            return Err(format!(
                "Durée de buffer invalide: {}ms (doit être entre 1 et 500)",
                self.preferred_io_buffer_ms
            ));
        }

        // Le pipeline capture toujours le micro
        if self.policy.category != SessionCategory::PlayAndRecord {
            return Err(format!(
                "Catégorie de session non supportée: {:?} (une entrée micro est requise)",
                self.policy.category
            ));
        }

        if self.capture_channel_capacity == 0 {
            return Err("Capacité du canal de capture nulle".to_string());
        }

        Ok(())
    }

    /// Configuration pour un voice-bot : annulation d'écho, haut-parleur
    pub fn voice_bot() -> Self {
        Self {
            echo_cancellation: true,
            policy: SessionPolicy {
                mode: SessionMode::VoiceChat,
                ..SessionPolicy::default()
            },
            ..Default::default()
        }
    }

    /// Configuration optimisée pour faible latence
    pub fn low_latency() -> Self {
        Self {
            preferred_io_buffer_ms: 5.0,
            capture_channel_capacity: 32,
            ..Default::default()
        }
    }
}
