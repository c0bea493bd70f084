//! Backend en mémoire
//!
//! Simule la session, le moteur et le graphe de nœuds sans matériel. Le
//! `MockHandle` reste entre les mains du test : il pilote le format matériel,
//! injecte des pannes, livre des buffers au tap et simule l'arrêt du moteur
//! lors d'un changement de route.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::traits::{SessionRequest, TapCallback};
use crate::{AudioBackend, AudioBuffer, AudioError, AudioFormat, AudioResult, HardwareFormat};

/// Étape du backend à faire échouer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MockFailure {
    ConfigureSession,
    ActivateSession,
    DeactivateSession,
    AttachPlayer,
    VoiceProcessing,
    InstallTap,
    Start,
    Schedule,
}

#[derive(Default)]
struct MockState {
    hardware: Option<HardwareFormat>,
    session_active: bool,
    last_request: Option<SessionRequest>,
    configure_calls: usize,
    start_calls: usize,
    players: usize,
    player_format: Option<AudioFormat>,
    voice_processing: bool,
    tap: Option<TapCallback>,
    tap_installs: usize,
    running: bool,
    player_playing: bool,
    queue: Vec<AudioBuffer>,
    failures: HashSet<MockFailure>,
}

impl MockState {
    fn check(&self, failure: MockFailure) -> AudioResult<()> {
        if !self.failures.contains(&failure) {
            return Ok(());
        }
        Err(match failure {
            MockFailure::ConfigureSession | MockFailure::ActivateSession | MockFailure::DeactivateSession => {
                AudioError::SessionConfig(format!("panne simulée: {:?}", failure))
            }
            MockFailure::Start => AudioError::EngineStart("panne simulée".to_string()),
            other => AudioError::Backend(format!("panne simulée: {:?}", other)),
        })
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Backend simulé
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    hardware: HardwareFormat,
}

/// Poignée de contrôle partagée avec le `MockBackend`
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    /// `hardware` est le format que rapportera la session une fois active
    pub fn new(hardware: HardwareFormat) -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let handle = MockHandle { state: state.clone() };
        (Self { state, hardware }, handle)
    }
}

#[async_trait]
impl AudioBackend for MockBackend {
    async fn configure_session(&mut self, request: &SessionRequest) -> AudioResult<()> {
        let mut state = lock(&self.state);
        state.configure_calls += 1;
        state.check(MockFailure::ConfigureSession)?;
        state.last_request = Some(request.clone());
        Ok(())
    }

    async fn activate_session(&mut self) -> AudioResult<()> {
        let mut state = lock(&self.state);
        state.check(MockFailure::ActivateSession)?;
        state.session_active = true;
        if state.hardware.is_none() {
            state.hardware = Some(self.hardware);
        }
        Ok(())
    }

    async fn deactivate_session(&mut self) -> AudioResult<()> {
        let mut state = lock(&self.state);
        state.session_active = false;
        state.check(MockFailure::DeactivateSession)
    }

    fn hardware_format(&self) -> Option<HardwareFormat> {
        let state = lock(&self.state);
        if state.session_active { state.hardware } else { None }
    }

    fn attach_player(&mut self, format: &AudioFormat) -> AudioResult<()> {
        let mut state = lock(&self.state);
        state.check(MockFailure::AttachPlayer)?;
        // Pas de garde : un double attachement se voit dans le compteur
        state.players += 1;
        state.player_format = Some(*format);
        Ok(())
    }

    fn detach_player(&mut self) {
        let mut state = lock(&self.state);
        state.players = state.players.saturating_sub(1);
        state.player_playing = false;
        state.queue.clear();
    }

    fn attached_players(&self) -> usize {
        lock(&self.state).players
    }

    fn set_voice_processing(&mut self, enabled: bool) -> AudioResult<()> {
        let mut state = lock(&self.state);
        state.check(MockFailure::VoiceProcessing)?;
        state.voice_processing = enabled;
        Ok(())
    }

    fn install_tap(&mut self, callback: TapCallback) -> AudioResult<()> {
        let mut state = lock(&self.state);
        state.check(MockFailure::InstallTap)?;
        if state.tap.is_some() {
            return Err(AudioError::Backend("un tap est déjà installé sur le nœud d'entrée".to_string()));
        }
        state.tap = Some(callback);
        state.tap_installs += 1;
        Ok(())
    }

    fn remove_tap(&mut self) {
        lock(&self.state).tap = None;
    }

    async fn start(&mut self) -> AudioResult<()> {
        let mut state = lock(&self.state);
        state.start_calls += 1;
        state.check(MockFailure::Start)?;
        state.running = true;
        Ok(())
    }

    async fn stop(&mut self) {
        let mut state = lock(&self.state);
        state.running = false;
        state.player_playing = false;
    }

    fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    fn schedule_buffer(&mut self, buffer: AudioBuffer) -> AudioResult<()> {
        let mut state = lock(&self.state);
        state.check(MockFailure::Schedule)?;
        if state.players == 0 {
            return Err(AudioError::Backend("aucun nœud de lecture attaché".to_string()));
        }
        state.queue.push(buffer);
        Ok(())
    }

    fn play_player(&mut self) -> AudioResult<()> {
        lock(&self.state).player_playing = true;
        Ok(())
    }

    fn stop_player(&mut self) {
        let mut state = lock(&self.state);
        state.player_playing = false;
        state.queue.clear();
    }

    fn is_player_playing(&self) -> bool {
        lock(&self.state).player_playing
    }

    fn device_info(&self) -> String {
        format!(
            "Backend simulé ({} Hz, {} canal(aux) d'entrée)",
            self.hardware.sample_rate, self.hardware.input_channels
        )
    }
}

impl MockHandle {
    /// Change le format rapporté par le matériel (changement de route)
    pub fn set_hardware(&self, hardware: HardwareFormat) {
        lock(&self.state).hardware = Some(hardware);
    }

    /// Fait échouer une étape jusqu'à `clear_failures`
    pub fn fail(&self, failure: MockFailure) {
        lock(&self.state).failures.insert(failure);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    /// Simule l'arrêt du moteur par la plateforme
    pub fn interrupt_engine(&self) {
        let mut state = lock(&self.state);
        state.running = false;
        state.player_playing = false;
    }

    /// Livre un buffer au tap comme le ferait le thread audio
    ///
    /// Retourne `false` si aucun tap n'est installé ou si le moteur est arrêté.
    pub fn deliver(&self, buffer: &AudioBuffer) -> bool {
        let mut state = lock(&self.state);
        if !state.running {
            return false;
        }
        match state.tap.as_mut() {
            Some(tap) => {
                tap(buffer);
                true
            }
            None => false,
        }
    }

    pub fn has_tap(&self) -> bool {
        lock(&self.state).tap.is_some()
    }

    pub fn tap_installs(&self) -> usize {
        lock(&self.state).tap_installs
    }

    pub fn players(&self) -> usize {
        lock(&self.state).players
    }

    pub fn player_format(&self) -> Option<AudioFormat> {
        lock(&self.state).player_format
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn is_session_active(&self) -> bool {
        lock(&self.state).session_active
    }

    pub fn is_player_playing(&self) -> bool {
        lock(&self.state).player_playing
    }

    pub fn voice_processing(&self) -> bool {
        lock(&self.state).voice_processing
    }

    pub fn last_request(&self) -> Option<SessionRequest> {
        lock(&self.state).last_request.clone()
    }

    pub fn configure_calls(&self) -> usize {
        lock(&self.state).configure_calls
    }

    pub fn start_calls(&self) -> usize {
        lock(&self.state).start_calls
    }

    /// Buffers en attente dans la file de lecture
    pub fn scheduled_count(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Taille en frames de chaque buffer en attente, dans l'ordre
    pub fn scheduled_frames(&self) -> Vec<usize> {
        lock(&self.state).queue.iter().map(|b| b.frames()).collect()
    }
}
