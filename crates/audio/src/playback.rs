//! Planification de la lecture des chunks reçus du réseau
//!
//! Soumission synchrone, lecture asynchrone : `play_chunk` convertit le chunk
//! vers le format de mixage interne et l'ajoute à la file FIFO du nœud de
//! lecture. Le nœud joue les buffers dans l'ordre de soumission.

use crate::converter::SampleConverter;
use crate::{AudioBackend, AudioChunk, AudioError, AudioResult, EngineState, SampleEncoding};

/// Ce dont la planification a besoin, emprunté au contexte du moteur
pub struct PlaybackTarget<'a> {
    pub state: &'a EngineState,
    pub converter: Option<&'a mut SampleConverter>,
    pub backend: &'a mut dyn AudioBackend,
}

/// Puits de chunks au format réseau
#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    scheduled: u64,
    rejected: u64,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convertit et planifie un chunk
    ///
    /// Retourne le nombre de frames du chunk au format réseau. Le premier
    /// chunk planifié démarre le nœud de lecture s'il est arrêté.
    ///
    /// # Erreurs
    /// - `AudioError::EngineUnavailable` si le moteur ne tourne pas ou si le
    ///   convertisseur de lecture n'existe pas ; rien n'est converti ni alloué
    /// - `AudioError::MalformedChunk` si le chunk n'est pas un nombre entier de frames
    /// - `AudioError::BufferAllocation` / erreurs de conversion et du backend
    pub fn play_chunk(&mut self, chunk: &AudioChunk, target: PlaybackTarget<'_>) -> AudioResult<usize> {
        let result = Self::schedule(chunk, target);
        match result {
            Ok(_) => self.scheduled += 1,
            Err(_) => self.rejected += 1,
        }
        result
    }

    fn schedule(chunk: &AudioChunk, target: PlaybackTarget<'_>) -> AudioResult<usize> {
        let PlaybackTarget {
            state,
            converter,
            backend,
        } = target;

        let converter = match converter {
            Some(converter) if state.is_running() => converter,
            _ => return Err(AudioError::EngineUnavailable),
        };

        let wire = *converter.input_format();
        let frame_bytes = SampleEncoding::Int16.bytes_per_sample() * wire.channels as usize;
        let frames = chunk.frame_count(wire.channels).ok_or(AudioError::MalformedChunk {
            len: chunk.len(),
            frame_bytes,
        })?;

        if frames == 0 {
            return Ok(0);
        }

        let wire_buffer = chunk.to_buffer(wire)?;
        let mixed = converter.convert(&wire_buffer)?;
        if mixed.is_empty() {
            return Ok(frames);
        }

        backend.schedule_buffer(mixed)?;
        if !backend.is_player_playing() {
            backend.play_player()?;
            tracing::debug!("▶️  nœud de lecture démarré");
        }

        Ok(frames)
    }

    /// Arrête la lecture et vide la file planifiée
    ///
    /// Les buffers déjà consommés par le matériel finissent de se vider.
    pub fn stop(&mut self, backend: &mut dyn AudioBackend) {
        backend.stop_player();
        tracing::debug!("⏹️  lecture arrêtée, file vidée");
    }

    /// Chunks planifiés avec succès
    pub fn scheduled(&self) -> u64 {
        self.scheduled
    }

    /// Chunks refusés
    pub fn rejected(&self) -> u64 {
        self.rejected
    }
}
