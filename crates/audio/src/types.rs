//! Types de données pour le pipeline audio
//!
//! Ce module définit les structures manipulées par tout le pipeline :
//! - AudioFormat : description immuable d'un format PCM
//! - AudioBuffer : buffer PCM brut accompagné de son format
//! - AudioChunk : bytes au format réseau (int16 entrelacé, 24 kHz)
//! - Formats / FormatTriple : les trois formats de travail négociés
//! - EngineState : état du cycle de vie du moteur

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{AudioError, AudioResult};

/// Fréquence du format réseau, fixée par le contrat avec le backend distant
pub const WIRE_SAMPLE_RATE: f64 = 24_000.0;

/// Encodage d'un échantillon PCM
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleEncoding {
    /// Flottant 32 bits, plage [-1.0, 1.0]
    Float32,
    /// Entier signé 16 bits
    Int16,
}

impl SampleEncoding {
    /// Taille d'un échantillon en bytes
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::Float32 => 4,
            SampleEncoding::Int16 => 2,
        }
    }
}

/// Description d'un format PCM
///
/// Immuable une fois construit : un changement de format produit une nouvelle
/// valeur, jamais une mutation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: f64,
    pub channels: u16,
    pub encoding: SampleEncoding,
    /// `true` : [L, R, L, R, ...], `false` : un bloc contigu par canal
    pub interleaved: bool,
}

impl AudioFormat {
    pub fn new(sample_rate: f64, channels: u16, encoding: SampleEncoding, interleaved: bool) -> Self {
        Self {
            sample_rate,
            channels,
            encoding,
            interleaved,
        }
    }

    /// Format réseau : int16 entrelacé à 24 kHz
    pub fn wire(channels: u16) -> Self {
        Self::new(WIRE_SAMPLE_RATE, channels, SampleEncoding::Int16, true)
    }

    /// Taille d'une frame (un échantillon par canal) en bytes
    pub fn bytes_per_frame(&self) -> usize {
        self.encoding.bytes_per_sample() * self.channels as usize
    }

    /// Vérifie qu'un convertisseur peut utiliser ce format
    pub fn validate(&self) -> AudioResult<()> {
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(AudioError::FormatMismatch(format!(
                "fréquence invalide: {}",
                self.sample_rate
            )));
        }
        if self.channels == 0 {
            return Err(AudioError::FormatMismatch("zéro canal".to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {:?}, {}",
            self.sample_rate,
            self.channels,
            self.encoding,
            if self.interleaved { "entrelacé" } else { "planaire" }
        )
    }
}

/// Échantillons bruts d'un buffer
#[derive(Clone, Debug, PartialEq)]
pub enum SampleData {
    F32(Vec<f32>),
    I16(Vec<i16>),
}

impl SampleData {
    /// Nombre total d'échantillons (tous canaux confondus)
    pub fn len(&self) -> usize {
        match self {
            SampleData::F32(samples) => samples.len(),
            SampleData::I16(samples) => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encoding(&self) -> SampleEncoding {
        match self {
            SampleData::F32(_) => SampleEncoding::Float32,
            SampleData::I16(_) => SampleEncoding::Int16,
        }
    }
}

/// Buffer PCM accompagné de son format
///
/// En layout planaire, le canal `c` occupe `data[c * frames .. (c + 1) * frames]`.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBuffer {
    format: AudioFormat,
    frames: usize,
    data: SampleData,
}

impl AudioBuffer {
    /// Crée un buffer en vérifiant la cohérence entre format et données
    ///
    /// # Erreurs
    /// - `AudioError::FormatMismatch` si l'encodage ne correspond pas ou si le
    ///   nombre d'échantillons n'est pas un multiple du nombre de canaux
    pub fn new(format: AudioFormat, data: SampleData) -> AudioResult<Self> {
        if format.channels == 0 {
            return Err(AudioError::FormatMismatch("zéro canal".to_string()));
        }
        if data.encoding() != format.encoding {
            return Err(AudioError::FormatMismatch(format!(
                "données {:?} pour un format {:?}",
                data.encoding(),
                format.encoding
            )));
        }
        let channels = format.channels as usize;
        if data.len() % channels != 0 {
            return Err(AudioError::FormatMismatch(format!(
                "{} échantillons pour {} canaux",
                data.len(),
                channels
            )));
        }
        Ok(Self {
            frames: data.len() / channels,
            format,
            data,
        })
    }

    /// Crée un buffer de silence
    pub fn silence(format: AudioFormat, frames: usize) -> Self {
        let len = frames * format.channels as usize;
        let data = match format.encoding {
            SampleEncoding::Float32 => SampleData::F32(vec![0.0; len]),
            SampleEncoding::Int16 => SampleData::I16(vec![0; len]),
        };
        Self { format, frames, data }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Nombre de frames (échantillons par canal)
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn data(&self) -> &SampleData {
        &self.data
    }

    pub fn into_data(self) -> SampleData {
        self.data
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Position d'un échantillon dans `data` selon le layout
    #[inline]
    pub(crate) fn index(&self, frame: usize, channel: usize) -> usize {
        if self.format.interleaved {
            frame * self.format.channels as usize + channel
        } else {
            channel * self.frames + frame
        }
    }

    /// Lit un échantillon normalisé en f32, quel que soit l'encodage
    #[inline]
    pub fn sample_f32(&self, frame: usize, channel: usize) -> f32 {
        let idx = self.index(frame, channel);
        match &self.data {
            SampleData::F32(samples) => samples[idx],
            SampleData::I16(samples) => crate::converter::i16_to_f32(samples[idx]),
        }
    }
}

/// Chunk audio au format réseau
///
/// Bytes int16 little-endian entrelacés. Le format est implicite : c'est le
/// format réseau courant. Un chunk est transféré par valeur d'une étape à la
/// suivante.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct AudioChunk {
    bytes: Vec<u8>,
}

impl AudioChunk {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Sérialise un buffer int16 entrelacé
    pub fn from_buffer(buffer: &AudioBuffer) -> AudioResult<Self> {
        let samples = match buffer.data() {
            SampleData::I16(samples) if buffer.format().interleaved => samples,
            _ => {
                return Err(AudioError::FormatMismatch(format!(
                    "un chunk réseau exige int16 entrelacé, reçu {}",
                    buffer.format()
                )));
            }
        };

        let mut bytes = Vec::new();
        bytes.try_reserve_exact(samples.len() * 2)?;
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(Self { bytes })
    }

    /// Décode le chunk en buffer dans le format réseau donné
    ///
    /// # Erreurs
    /// - `AudioError::MalformedChunk` si la taille n'est pas un nombre entier de frames
    pub fn to_buffer(&self, format: AudioFormat) -> AudioResult<AudioBuffer> {
        if format.encoding != SampleEncoding::Int16 || !format.interleaved {
            return Err(AudioError::FormatMismatch(format!(
                "format réseau attendu, reçu {}",
                format
            )));
        }
        let frame_bytes = format.bytes_per_frame();
        if frame_bytes == 0 || self.bytes.len() % frame_bytes != 0 {
            return Err(AudioError::MalformedChunk {
                len: self.bytes.len(),
                frame_bytes,
            });
        }

        let mut samples = Vec::new();
        samples.try_reserve_exact(self.bytes.len() / 2)?;
        samples.extend(
            self.bytes
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        );
        AudioBuffer::new(format, SampleData::I16(samples))
    }

    /// Nombre de frames pour `channels` canaux, `None` si la taille ne tombe pas juste
    pub fn frame_count(&self, channels: u16) -> Option<usize> {
        let frame_bytes = SampleEncoding::Int16.bytes_per_sample() * channels as usize;
        if frame_bytes == 0 || self.bytes.len() % frame_bytes != 0 {
            return None;
        }
        Some(self.bytes.len() / frame_bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl From<Vec<u8>> for AudioChunk {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// Les trois formats de travail issus d'une négociation
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormatTriple {
    /// Ce que le micro livre réellement (float32 entrelacé)
    pub device_input: AudioFormat,
    /// Format de mixage interne du moteur (float32 planaire stéréo)
    pub internal_mix: AudioFormat,
    /// Format réseau (int16 entrelacé 24 kHz)
    pub wire: AudioFormat,
}

/// Formats courants du pipeline
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Formats {
    /// Aucune négociation n'a encore réussi
    #[default]
    Unset,
    Ready(FormatTriple),
}

impl Formats {
    pub fn ready(&self) -> Option<&FormatTriple> {
        match self {
            Formats::Ready(triple) => Some(triple),
            Formats::Unset => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Formats::Ready(_))
    }
}

/// Format réellement rapporté par le matériel après activation de la session
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HardwareFormat {
    pub sample_rate: f64,
    pub input_channels: u16,
}

/// État du cycle de vie du moteur
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum EngineState {
    #[default]
    Uninitialized,
    SessionConfiguring,
    FormatsReady,
    Running,
    Suspended,
    Error(String),
}

impl EngineState {
    pub fn is_running(&self) -> bool {
        matches!(self, EngineState::Running)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Uninitialized => write!(f, "non initialisé"),
            EngineState::SessionConfiguring => write!(f, "configuration de la session"),
            EngineState::FormatsReady => write!(f, "formats prêts"),
            EngineState::Running => write!(f, "en marche"),
            EngineState::Suspended => write!(f, "suspendu"),
            EngineState::Error(reason) => write!(f, "erreur ({})", reason),
        }
    }
}

/// Statistiques du pipeline pour le monitoring
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Buffers livrés par le callback de capture
    pub buffers_received: u64,
    /// Chunks émis vers le réseau
    pub chunks_emitted: u64,
    /// Buffers reçus après l'arrêt de la capture
    pub dropped_inactive: u64,
    /// Buffers perdus suite à un échec de conversion
    pub dropped_conversion: u64,
    /// Conversions sans aucune frame en sortie
    pub dropped_empty: u64,
    /// Buffers perdus parce que le convertisseur était en cours de remplacement
    pub dropped_busy: u64,
    /// Reconstructions du convertisseur de capture dans le callback
    pub capture_rebuilds: u64,
    /// Chunks planifiés sur le nœud de lecture
    pub chunks_scheduled: u64,
    /// Chunks refusés par `play_chunk`
    pub chunks_rejected: u64,
}

impl PipelineStats {
    /// Total des buffers de capture perdus
    pub fn capture_drops(&self) -> u64 {
        self.dropped_inactive + self.dropped_conversion + self.dropped_empty + self.dropped_busy
    }
}
