//! Conversion de format PCM : fréquence, canaux et encodage en une passe
//!
//! Un `SampleConverter` est lié à une paire (format d'entrée, format de
//! sortie). Il rééchantillonne par interpolation linéaire, répartit les
//! canaux puis requantifie (float32 ↔ int16) sans buffer intermédiaire.
//!
//! `ConverterPair` possède le convertisseur de capture (périphérique → réseau)
//! et celui de lecture (réseau → mixage interne).

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::events::{SharedNotifier, report};
use crate::{AudioBuffer, AudioError, AudioFormat, AudioResult, ConverterDirection, SampleData, SampleEncoding};

/// Convertit un échantillon f32 vers i16
///
/// Écrêtage à [-1.0, 1.0], échelle symétrique 32767.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Convertit un échantillon i16 vers f32 dans [-1.0, 1.0]
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Nombre de frames en sortie pour `input_frames` frames en entrée
///
/// `round(input_frames × output_rate / input_rate)`. Cette règle est la même
/// pour la capture et la lecture, sinon les deux sens dérivent.
pub fn output_capacity(input_frames: usize, input_rate: f64, output_rate: f64) -> usize {
    if input_frames == 0 {
        return 0;
    }
    (input_frames as f64 * output_rate / input_rate).round() as usize
}

/// Convertisseur PCM pour une paire de formats donnée
#[derive(Debug)]
pub struct SampleConverter {
    input: AudioFormat,
    output: AudioFormat,
    /// Frames d'entrée avancées par frame de sortie
    step: f64,
    /// Une frame d'entrée interpolée, un slot par canal d'entrée
    scratch: Vec<f32>,
}

impl SampleConverter {
    /// Crée un convertisseur
    ///
    /// # Erreurs
    /// - `AudioError::FormatMismatch` si l'un des formats est inutilisable
    ///   (fréquence nulle ou non finie, zéro canal)
    pub fn new(input: AudioFormat, output: AudioFormat) -> AudioResult<Self> {
        input.validate()?;
        output.validate()?;

        Ok(Self {
            step: input.sample_rate / output.sample_rate,
            scratch: vec![0.0; input.channels as usize],
            input,
            output,
        })
    }

    pub fn input_format(&self) -> &AudioFormat {
        &self.input
    }

    pub fn output_format(&self) -> &AudioFormat {
        &self.output
    }

    /// Vrai si ce convertisseur accepte les buffers au format donné
    pub fn matches_input(&self, format: &AudioFormat) -> bool {
        self.input == *format
    }

    pub fn output_frames(&self, input_frames: usize) -> usize {
        output_capacity(input_frames, self.input.sample_rate, self.output.sample_rate)
    }

    /// Convertit un buffer complet
    ///
    /// Une entrée vide donne une sortie vide, sans erreur.
    ///
    /// # Erreurs
    /// - `AudioError::FormatMismatch` si le buffer n'est pas au format d'entrée
    /// - `AudioError::BufferAllocation` si le buffer de sortie ne peut pas être alloué
    pub fn convert(&mut self, input: &AudioBuffer) -> AudioResult<AudioBuffer> {
        if !self.matches_input(input.format()) {
            return Err(AudioError::FormatMismatch(format!(
                "convertisseur {} reçoit {}",
                self.input,
                input.format()
            )));
        }

        let out_frames = self.output_frames(input.frames());
        let data = match self.output.encoding {
            SampleEncoding::Float32 => SampleData::F32(self.render(input, out_frames, |s| s)?),
            SampleEncoding::Int16 => SampleData::I16(self.render(input, out_frames, f32_to_i16)?),
        };

        AudioBuffer::new(self.output, data)
    }

    fn render<T: Copy + Default>(
        &mut self,
        input: &AudioBuffer,
        out_frames: usize,
        encode: impl Fn(f32) -> T,
    ) -> AudioResult<Vec<T>> {
        let in_frames = input.frames();
        let in_channels = self.input.channels as usize;
        let out_channels = self.output.channels as usize;
        let total = out_frames * out_channels;

        let mut out = Vec::new();
        out.try_reserve_exact(total)?;
        out.resize(total, T::default());

        for frame in 0..out_frames {
            // Interpolation linéaire ; au-delà de la dernière frame on la répète
            let position = frame as f64 * self.step;
            let index = (position.floor() as usize).min(in_frames - 1);
            let next = (index + 1).min(in_frames - 1);
            let frac = (position - index as f64).clamp(0.0, 1.0) as f32;

            for channel in 0..in_channels {
                let s0 = input.sample_f32(index, channel);
                let s1 = input.sample_f32(next, channel);
                self.scratch[channel] = s0 + (s1 - s0) * frac;
            }

            for channel in 0..out_channels {
                let value = map_channel(&self.scratch, channel, out_channels);
                let idx = if self.output.interleaved {
                    frame * out_channels + channel
                } else {
                    channel * out_frames + frame
                };
                out[idx] = encode(value);
            }
        }

        Ok(out)
    }
}

/// Valeur du canal de sortie `channel` à partir d'une frame d'entrée
///
/// Upmix : le canal de sortie `c` recopie l'entrée `c % in`.
/// Downmix : moyenne des entrées `k` telles que `k % out == c`.
#[inline]
fn map_channel(frame: &[f32], channel: usize, out_channels: usize) -> f32 {
    let in_channels = frame.len();
    if out_channels >= in_channels {
        return frame[channel % in_channels];
    }

    let mut sum = 0.0;
    let mut count = 0usize;
    let mut k = channel;
    while k < in_channels {
        sum += frame[k];
        count += 1;
        k += out_channels;
    }
    sum / count as f32
}

/// Emplacement du convertisseur de capture partagé avec le callback
///
/// Le thread de contrôle le remplace avec `lock().await`, le callback le lit
/// avec `try_lock()` pour ne jamais bloquer.
pub type SharedConverter = Arc<Mutex<Option<SampleConverter>>>;

/// Paire de convertisseurs capture / lecture
pub struct ConverterPair {
    capture: SharedConverter,
    playback: Option<SampleConverter>,
}

impl ConverterPair {
    pub fn new() -> Self {
        Self {
            capture: Arc::new(Mutex::new(None)),
            playback: None,
        }
    }

    /// Reconstruit les deux convertisseurs et publie l'erreur éventuelle
    ///
    /// Retourne `false` si l'un des deux n'a pas pu être construit ; la paire
    /// est alors vide et aucune conversion ne doit être tentée.
    pub async fn rebuild(
        &mut self,
        capture_in: AudioFormat,
        capture_out: AudioFormat,
        playback_in: AudioFormat,
        playback_out: AudioFormat,
        notifier: Option<&SharedNotifier>,
    ) -> bool {
        match self
            .try_rebuild(capture_in, capture_out, playback_in, playback_out)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                report(notifier, &err);
                false
            }
        }
    }

    /// Variante de `rebuild` qui retourne l'erreur typée
    pub async fn try_rebuild(
        &mut self,
        capture_in: AudioFormat,
        capture_out: AudioFormat,
        playback_in: AudioFormat,
        playback_out: AudioFormat,
    ) -> AudioResult<()> {
        let built = SampleConverter::new(capture_in, capture_out)
            .map_err(|e| AudioError::converter(ConverterDirection::Capture, e.to_string()))
            .and_then(|capture| {
                SampleConverter::new(playback_in, playback_out)
                    .map(|playback| (capture, playback))
                    .map_err(|e| AudioError::converter(ConverterDirection::Playback, e.to_string()))
            });

        match built {
            Ok((capture, playback)) => {
                tracing::debug!(capture_in = %capture_in, playback_out = %playback_out, "🔄 convertisseurs reconstruits");
                *self.capture.lock().await = Some(capture);
                self.playback = Some(playback);
                Ok(())
            }
            Err(err) => {
                self.clear().await;
                Err(err)
            }
        }
    }

    /// Vide la paire
    pub async fn clear(&mut self) {
        *self.capture.lock().await = None;
        self.playback = None;
    }

    /// Emplacement partagé du convertisseur de capture
    pub fn capture_slot(&self) -> SharedConverter {
        Arc::clone(&self.capture)
    }

    pub fn playback(&self) -> Option<&SampleConverter> {
        self.playback.as_ref()
    }

    pub fn playback_mut(&mut self) -> Option<&mut SampleConverter> {
        self.playback.as_mut()
    }
}

impl Default for ConverterPair {
    fn default() -> Self {
        Self::new()
    }
}
