//! Gestion d'erreurs pour le pipeline audio temps réel
//!
//! Chaque échec du pipeline (session, négociation des formats, convertisseurs,
//! moteur, lecture) a sa propre variante. Les erreurs levées dans le callback
//! de capture ne remontent jamais : elles sont publiées sur le canal de
//! notification et le buffer courant est abandonné.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sens d'un convertisseur dans la paire capture/lecture
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConverterDirection {
    /// Format périphérique → format réseau
    Capture,
    /// Format réseau → format de mixage interne
    Playback,
}

impl fmt::Display for ConverterDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConverterDirection::Capture => write!(f, "capture"),
            ConverterDirection::Playback => write!(f, "lecture"),
        }
    }
}

/// Étape de `setup_engine()` qui a échoué
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStage {
    ConfigureSession,
    ActivateSession,
    NegotiateFormats,
    BuildConverters,
    AttachNodes,
    EchoCancellation,
    StartEngine,
    InstallTap,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStage::ConfigureSession => "configuration de la session",
            SetupStage::ActivateSession => "activation de la session",
            SetupStage::NegotiateFormats => "négociation des formats",
            SetupStage::BuildConverters => "construction des convertisseurs",
            SetupStage::AttachNodes => "attache des nœuds",
            SetupStage::EchoCancellation => "annulation d'écho",
            SetupStage::StartEngine => "démarrage du moteur",
            SetupStage::InstallTap => "installation du tap",
        };
        f.write_str(name)
    }
}

/// Catégorie d'erreur publiée dans `Event::Error`
///
/// C'est la taxonomie fermée vue par la couche de notification ; elle ne
/// transporte pas de détails, ceux-ci vont dans le message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SessionConfigError,
    NoInputChannels,
    ConverterInitError,
    EngineStartError,
    EngineUnavailable,
    MalformedChunk,
    BufferAllocationError,
    DeviceError,
    ConfigError,
}

/// Toutes les erreurs possibles du pipeline audio
#[derive(Error, Debug)]
pub enum AudioError {
    /// Catégorie, fréquence ou durée de buffer refusée par le matériel
    #[error("Configuration de session refusée: {0}")]
    SessionConfig(String),

    /// Le périphérique d'entrée ne rapporte aucun canal
    #[error("Aucun canal d'entrée disponible")]
    NoInputChannels,

    /// Impossible de construire un convertisseur pour la paire de formats
    #[error("Échec d'initialisation du convertisseur de {direction}: {reason}")]
    ConverterInit {
        direction: ConverterDirection,
        reason: String,
    },

    /// Le moteur audio refuse de démarrer
    #[error("Échec du démarrage du moteur: {0}")]
    EngineStart(String),

    /// Lecture tentée alors que le moteur ne tourne pas
    #[error("Moteur audio indisponible")]
    EngineUnavailable,

    /// Le chunk ne contient pas un nombre entier de frames
    #[error("Chunk malformé: {len} bytes n'est pas un multiple de {frame_bytes}")]
    MalformedChunk { len: usize, frame_bytes: usize },

    /// Allocation d'un buffer intermédiaire impossible
    #[error("Allocation de buffer impossible: {0}")]
    BufferAllocation(String),

    /// Le buffer fourni n'a pas le format attendu par le convertisseur
    #[error("Format inattendu: {0}")]
    FormatMismatch(String),

    /// Aucun périphérique audio (microphone ou haut-parleurs) n'a été trouvé
    #[error("Aucun périphérique audio trouvé")]
    NoDeviceFound,

    /// Erreur remontée par la librairie audio de la plateforme
    #[error("Erreur backend audio: {0}")]
    Backend(String),

    /// Configuration applicative incohérente
    #[error("Configuration audio invalide: {0}")]
    InvalidConfig(String),
}

impl AudioError {
    /// Catégorie publiée sur le canal de notification
    pub fn kind(&self) -> ErrorKind {
        match self {
            AudioError::SessionConfig(_) => ErrorKind::SessionConfigError,
            AudioError::NoInputChannels => ErrorKind::NoInputChannels,
            AudioError::ConverterInit { .. } | AudioError::FormatMismatch(_) => {
                ErrorKind::ConverterInitError
            }
            AudioError::EngineStart(_) => ErrorKind::EngineStartError,
            AudioError::EngineUnavailable => ErrorKind::EngineUnavailable,
            AudioError::MalformedChunk { .. } => ErrorKind::MalformedChunk,
            AudioError::BufferAllocation(_) => ErrorKind::BufferAllocationError,
            AudioError::NoDeviceFound | AudioError::Backend(_) => ErrorKind::DeviceError,
            AudioError::InvalidConfig(_) => ErrorKind::ConfigError,
        }
    }

    pub(crate) fn converter(direction: ConverterDirection, reason: impl Into<String>) -> Self {
        AudioError::ConverterInit {
            direction,
            reason: reason.into(),
        }
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AudioError::Backend(format!("construction du stream: {}", err))
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        AudioError::SessionConfig(format!("config par défaut: {}", err))
    }
}

impl From<cpal::SupportedStreamConfigsError> for AudioError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        AudioError::SessionConfig(format!("configs supportées: {}", err))
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(err: cpal::PlayStreamError) -> Self {
        AudioError::EngineStart(err.to_string())
    }
}

impl From<cpal::PauseStreamError> for AudioError {
    fn from(err: cpal::PauseStreamError) -> Self {
        AudioError::Backend(format!("pause du stream: {}", err))
    }
}

impl From<std::collections::TryReserveError> for AudioError {
    fn from(err: std::collections::TryReserveError) -> Self {
        AudioError::BufferAllocation(err.to_string())
    }
}

/// Type Result du crate
pub type AudioResult<T> = Result<T, AudioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AudioError::NoInputChannels;
        assert_eq!(error.to_string(), "Aucun canal d'entrée disponible");

        let error = AudioError::MalformedChunk { len: 7, frame_bytes: 2 };
        assert_eq!(
            error.to_string(),
            "Chunk malformé: 7 bytes n'est pas un multiple de 2"
        );

        let error = AudioError::converter(ConverterDirection::Playback, "canaux");
        assert_eq!(
            error.to_string(),
            "Échec d'initialisation du convertisseur de lecture: canaux"
        );
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(AudioError::EngineUnavailable.kind(), ErrorKind::EngineUnavailable);
        assert_eq!(
            AudioError::SessionConfig("x".into()).kind(),
            ErrorKind::SessionConfigError
        );
        assert_eq!(
            AudioError::converter(ConverterDirection::Capture, "x").kind(),
            ErrorKind::ConverterInitError
        );
        assert_eq!(
            AudioError::BufferAllocation("x".into()).kind(),
            ErrorKind::BufferAllocationError
        );
    }

    #[test]
    fn test_try_reserve_error_conversion() {
        let mut v: Vec<u8> = Vec::new();
        let err = v.try_reserve_exact(usize::MAX).unwrap_err();
        let audio_err: AudioError = err.into();
        assert_eq!(audio_err.kind(), ErrorKind::BufferAllocationError);
    }
}
