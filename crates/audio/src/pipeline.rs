//! Cycle de vie du moteur audio
//!
//! `EngineContext` possède tout l'état du pipeline : session, moteur, formats
//! négociés, paire de convertisseurs, tap de capture et nœud de lecture. Les
//! opérations de contrôle passent toutes par `&mut self` et sont donc
//! sérialisées ; seul le callback de capture tourne en parallèle, via le
//! `CaptureTap` qu'il a reçu à l'installation.
//!
//! # Machine à états
//!
//! ```text
//! Uninitialized → SessionConfiguring → FormatsReady → Running
//!                        ↓ (échec)                      ↓ (changement de route, moteur arrêté)
//!                      Error  ←──────────────────── Suspended
//! ```

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::capture::{CaptureTap, ChunkStream, SharedFormats};
use crate::converter::ConverterPair;
use crate::events::{SharedNotifier, report, report_setup};
use crate::negotiate::FormatNegotiator;
use crate::playback::{PlaybackScheduler, PlaybackTarget};
use crate::traits::SessionRequest;
use crate::{
    AudioBackend, AudioChunk, AudioConfig, AudioError, AudioResult, BackgroundMusic, EngineState, FormatTriple,
    Formats, PipelineStats, SetupStage,
};

/// Contexte unique du pipeline audio
pub struct EngineContext {
    config: AudioConfig,
    backend: Box<dyn AudioBackend>,
    state: EngineState,
    formats: SharedFormats,
    converters: ConverterPair,
    tap: CaptureTap,
    playback: PlaybackScheduler,
    /// La capture doit survivre à une reconstruction du moteur
    capture_requested: bool,
    music: Option<Box<dyn BackgroundMusic>>,
    notifier: Option<SharedNotifier>,
}

impl EngineContext {
    /// Crée le contexte sans toucher au matériel
    ///
    /// # Erreurs
    /// - `AudioError::InvalidConfig` si la configuration est incohérente
    pub fn new(
        config: AudioConfig,
        backend: Box<dyn AudioBackend>,
        notifier: Option<SharedNotifier>,
    ) -> AudioResult<Self> {
        config.validate().map_err(AudioError::InvalidConfig)?;

        let formats: SharedFormats = Arc::new(RwLock::new(Formats::Unset));
        let converters = ConverterPair::new();
        let tap = CaptureTap::new(
            converters.capture_slot(),
            Arc::clone(&formats),
            ChunkStream::new(config.capture_channel_capacity),
            notifier.clone(),
        );

        tracing::debug!(backend = %backend.device_info(), "🔧 contexte audio créé");

        Ok(Self {
            config,
            backend,
            state: EngineState::Uninitialized,
            formats,
            converters,
            tap,
            playback: PlaybackScheduler::new(),
            capture_requested: false,
            music: None,
            notifier,
        })
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Formats négociés courants
    pub async fn formats(&self) -> Formats {
        *self.formats.read().await
    }

    pub fn is_capturing(&self) -> bool {
        self.tap.is_active()
    }

    pub fn device_info(&self) -> String {
        self.backend.device_info()
    }

    /// Instantané des compteurs de capture et de lecture
    pub fn stats(&self) -> PipelineStats {
        let mut stats = PipelineStats::default();
        self.tap.fill_stats(&mut stats);
        stats.chunks_scheduled = self.playback.scheduled();
        stats.chunks_rejected = self.playback.rejected();
        stats
    }

    /// Enregistre le lecteur de musique de fond, arrêté avec le pipeline
    pub fn set_background_music(&mut self, music: Box<dyn BackgroundMusic>) {
        self.music = Some(music);
    }

    /// Configure la session et démarre le moteur
    ///
    /// Idempotent : un appel sur un moteur déjà construit démonte d'abord le
    /// tap et le nœud de lecture, si bien qu'il n'y a jamais deux nœuds
    /// attachés ni deux taps installés. Si la capture était demandée, le tap
    /// est réinstallé une fois le moteur relancé.
    ///
    /// En cas d'échec, le graphe est démonté et le moteur arrêté, l'état passe
    /// à `Error`, l'erreur est publiée sur le notifier (préfixée par l'étape en
    /// échec) et retournée à l'appelant.
    pub async fn setup_engine(&mut self) -> AudioResult<()> {
        tracing::info!("🚀 Configuration du moteur audio...");

        match self.run_setup().await {
            Ok(triple) => {
                tracing::info!(
                    rate = triple.device_input.sample_rate,
                    channels = triple.device_input.channels,
                    capture = self.tap.is_active(),
                    "✅ Moteur audio démarré"
                );
                Ok(())
            }
            Err((stage, err)) => {
                // Le matériel ne doit pas tourner derrière un état `Error`
                self.teardown_graph().await;
                self.state = EngineState::Error(format!("{}: {}", stage, err));
                report_setup(self.notifier.as_ref(), stage, &err);
                Err(err)
            }
        }
    }

    async fn run_setup(&mut self) -> Result<FormatTriple, (SetupStage, AudioError)> {
        self.state = EngineState::SessionConfiguring;
        self.teardown_graph().await;

        let request = SessionRequest::from(&self.config);
        self.backend
            .configure_session(&request)
            .await
            .map_err(|e| (SetupStage::ConfigureSession, e))?;
        self.backend
            .activate_session()
            .await
            .map_err(|e| (SetupStage::ActivateSession, e))?;

        // Les formats précédents restent en place si la négociation échoue
        let triple = FormatNegotiator::from_config(&self.config)
            .negotiate(self.backend.hardware_format())
            .map_err(|e| (SetupStage::NegotiateFormats, e))?;
        *self.formats.write().await = Formats::Ready(triple);

        self.converters
            .try_rebuild(triple.device_input, triple.wire, triple.wire, triple.internal_mix)
            .await
            .map_err(|e| (SetupStage::BuildConverters, e))?;
        self.state = EngineState::FormatsReady;

        self.backend
            .attach_player(&triple.internal_mix)
            .map_err(|e| (SetupStage::AttachNodes, e))?;

        if self.config.echo_cancellation {
            self.backend
                .set_voice_processing(true)
                .map_err(|e| (SetupStage::EchoCancellation, e))?;
        }

        self.backend.start().await.map_err(|e| (SetupStage::StartEngine, e))?;
        self.state = EngineState::Running;

        if self.capture_requested {
            self.install_tap().map_err(|e| (SetupStage::InstallTap, e))?;
        }

        Ok(triple)
    }

    /// Retire le tap, arrête le moteur et détache le nœud de lecture
    async fn teardown_graph(&mut self) {
        self.tap.deactivate();
        self.backend.remove_tap();
        self.backend.stop_player();
        if self.backend.is_running() {
            self.backend.stop().await;
        }
        if self.backend.attached_players() > 0 {
            self.backend.detach_player();
        }
    }

    fn install_tap(&mut self) -> AudioResult<()> {
        let tap = self.tap.clone();
        self.tap.activate();
        if let Err(err) = self
            .backend
            .install_tap(Box::new(move |buffer| tap.on_device_buffer(buffer)))
        {
            self.tap.deactivate();
            return Err(err);
        }
        Ok(())
    }

    /// Démarre la capture et retourne le flux de chunks au format réseau
    ///
    /// Idempotent : tant que la capture est active, chaque appel retourne un
    /// handle sur le même flux et n'installe pas de second tap.
    ///
    /// # Erreurs
    /// - `AudioError::EngineUnavailable` si le moteur ne tourne pas
    pub async fn start_capture(&mut self) -> AudioResult<ChunkStream> {
        if self.tap.is_active() {
            tracing::debug!("🎤 capture déjà active");
            return Ok(self.tap.stream().clone());
        }

        let result = if self.state.is_running() {
            self.install_tap()
        } else {
            Err(AudioError::EngineUnavailable)
        };
        if let Err(err) = result {
            report(self.notifier.as_ref(), &err);
            return Err(err);
        }

        self.capture_requested = true;
        tracing::info!("🎤 Capture démarrée");
        Ok(self.tap.stream().clone())
    }

    /// Arrête la capture
    ///
    /// Le tap est désactivé avant d'être retiré : un buffer déjà en vol est
    /// abandonné plutôt qu'émis.
    pub fn stop_capture(&mut self) {
        self.capture_requested = false;
        if !self.tap.is_active() {
            return;
        }
        self.tap.deactivate();
        self.backend.remove_tap();
        tracing::info!("🔇 Capture arrêtée");
    }

    /// Planifie un chunk au format réseau sur le nœud de lecture
    ///
    /// Retourne le nombre de frames du chunk. Voir `PlaybackScheduler::play_chunk`.
    pub fn play_chunk(&mut self, chunk: &AudioChunk) -> AudioResult<usize> {
        let result = self.playback.play_chunk(
            chunk,
            PlaybackTarget {
                state: &self.state,
                converter: self.converters.playback_mut(),
                backend: self.backend.as_mut(),
            },
        );
        if let Err(err) = &result {
            report(self.notifier.as_ref(), err);
        }
        result
    }

    /// Arrête la lecture et vide la file ; le prochain chunk la relance
    pub fn stop_playback(&mut self) {
        self.playback.stop(self.backend.as_mut());
    }

    /// Réagit à une notification de changement de configuration
    ///
    /// Si le moteur tourne toujours, rien n'est fait : le tap revalide son
    /// convertisseur à chaque buffer. S'il a été arrêté par la plateforme, le
    /// setup complet est rejoué (la capture est réinstallée si elle était
    /// active). Un moteur en erreur retente aussi le setup.
    pub async fn handle_configuration_change(&mut self) -> AudioResult<()> {
        if self.backend.is_running() {
            tracing::info!("🔀 Changement de configuration audio, moteur toujours actif");
            return Ok(());
        }

        match self.state {
            EngineState::Uninitialized | EngineState::SessionConfiguring => {
                tracing::debug!(state = %self.state, "🔀 changement de configuration ignoré");
                return Ok(());
            }
            EngineState::Error(_) => {}
            _ => self.state = EngineState::Suspended,
        }

        tracing::warn!("🔀 Moteur arrêté par un changement de configuration, redémarrage...");
        self.setup_engine().await
    }

    /// Arrête capture, lecture, musique de fond et moteur, puis désactive la session
    ///
    /// Sans effet depuis `Uninitialized`. Depuis `Error`, le démontage est
    /// fait au mieux et les échecs sont seulement publiés.
    pub async fn shutdown(&mut self) {
        if self.state == EngineState::Uninitialized {
            return;
        }
        tracing::info!("🛑 Arrêt du pipeline audio...");

        self.stop_capture();
        self.stop_playback();
        if let Some(music) = self.music.as_mut() {
            if music.is_playing() {
                music.stop();
            }
        }

        self.teardown_graph().await;
        if let Err(err) = self.backend.deactivate_session().await {
            report(self.notifier.as_ref(), &err);
        }
        self.converters.clear().await;

        self.state = EngineState::Uninitialized;
        tracing::info!("✅ Pipeline audio arrêté");
    }
}
