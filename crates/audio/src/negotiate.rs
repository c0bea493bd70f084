//! Négociation des trois formats de travail
//!
//! Les valeurs demandées (canaux, fréquence) ne servent que tant que la
//! session n'est pas active. Une fois la session active, seul le format
//! rapporté par le matériel compte.

use crate::{AudioConfig, AudioError, AudioFormat, AudioResult, FormatTriple, HardwareFormat, SampleEncoding};

/// Canaux du format de mixage interne du moteur
pub const INTERNAL_MIX_CHANNELS: u16 = 2;

/// Calcule les formats périphérique, mixage interne et réseau
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FormatNegotiator {
    requested_channels: u16,
    requested_sample_rate: f64,
}

impl FormatNegotiator {
    pub fn new(requested_channels: u16, requested_sample_rate: f64) -> Self {
        Self {
            requested_channels,
            requested_sample_rate,
        }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(config.channels, config.preferred_sample_rate)
    }

    /// Dérive le triplet de formats
    ///
    /// `hardware` vaut `None` avant l'activation de la session ; les valeurs
    /// demandées servent alors de repli.
    ///
    /// # Erreurs
    /// - `AudioError::NoInputChannels` si le matériel ne rapporte aucun canal d'entrée
    pub fn negotiate(&self, hardware: Option<HardwareFormat>) -> AudioResult<FormatTriple> {
        let (sample_rate, input_channels) = match hardware {
            Some(hw) => (hw.sample_rate, hw.input_channels),
            None => (self.requested_sample_rate, self.requested_channels),
        };

        if input_channels == 0 {
            return Err(AudioError::NoInputChannels);
        }
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(AudioError::SessionConfig(format!(
                "fréquence matérielle invalide: {}",
                sample_rate
            )));
        }

        let device_input = AudioFormat::new(sample_rate, input_channels, SampleEncoding::Float32, true);
        let internal_mix = AudioFormat::new(sample_rate, INTERNAL_MIX_CHANNELS, SampleEncoding::Float32, false);
        let wire = AudioFormat::wire(device_input.channels);

        tracing::info!(
            device = %device_input,
            mix = %internal_mix,
            wire = %wire,
            "📋 formats négociés"
        );

        Ok(FormatTriple {
            device_input,
            internal_mix,
            wire,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WIRE_SAMPLE_RATE;

    #[test]
    fn test_hardware_rate_wins_over_requested() {
        let negotiator = FormatNegotiator::new(1, 48_000.0);
        let triple = negotiator
            .negotiate(Some(HardwareFormat {
                sample_rate: 44_100.0,
                input_channels: 1,
            }))
            .unwrap();

        assert_eq!(triple.device_input.sample_rate, 44_100.0);
        assert_eq!(triple.wire.sample_rate, 24_000.0);
        assert_eq!(triple.wire.channels, 1);
        assert_eq!(triple.internal_mix.sample_rate, 44_100.0);
    }

    #[test]
    fn test_wire_tracks_device_channels() {
        let negotiator = FormatNegotiator::new(1, 48_000.0);
        for &rate in &[8_000.0, 16_000.0, 44_100.0, 48_000.0, 96_000.0] {
            for channels in 1..=8u16 {
                let triple = negotiator
                    .negotiate(Some(HardwareFormat {
                        sample_rate: rate,
                        input_channels: channels,
                    }))
                    .unwrap();
                assert_eq!(triple.wire.sample_rate, WIRE_SAMPLE_RATE);
                assert_eq!(triple.wire.channels, triple.device_input.channels);
                assert_eq!(triple.wire.encoding, SampleEncoding::Int16);
                assert!(triple.wire.interleaved);
            }
        }
    }

    #[test]
    fn test_internal_mix_is_planar_stereo_float() {
        let triple = FormatNegotiator::new(1, 48_000.0)
            .negotiate(Some(HardwareFormat {
                sample_rate: 48_000.0,
                input_channels: 1,
            }))
            .unwrap();

        assert_eq!(triple.internal_mix.channels, 2);
        assert_eq!(triple.internal_mix.encoding, SampleEncoding::Float32);
        assert!(!triple.internal_mix.interleaved);
        assert_eq!(triple.device_input.encoding, SampleEncoding::Float32);
        assert!(triple.device_input.interleaved);
    }

    #[test]
    fn test_requested_values_before_activation() {
        let triple = FormatNegotiator::new(2, 16_000.0).negotiate(None).unwrap();
        assert_eq!(triple.device_input.sample_rate, 16_000.0);
        assert_eq!(triple.device_input.channels, 2);
        assert_eq!(triple.wire.channels, 2);
    }

    #[test]
    fn test_no_input_channels() {
        let result = FormatNegotiator::new(1, 48_000.0).negotiate(Some(HardwareFormat {
            sample_rate: 48_000.0,
            input_channels: 0,
        }));
        assert!(matches!(result, Err(AudioError::NoInputChannels)));
    }
}
