// Tests d'intégration du cycle de vie du pipeline audio
//
// Tous les scénarios tournent contre le MockBackend : la session, le moteur
// et le thread audio sont simulés, le MockHandle joue le rôle de la plateforme.

use std::sync::Arc;

use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::mpsc;

use audio::{
    AudioBuffer, AudioChunk, AudioConfig, AudioError, AudioFormat, EngineContext, EngineState, ErrorKind, Event,
    HardwareFormat, MockBackend, MockFailure, MockHandle, SampleEncoding, SharedNotifier,
};

fn hw(sample_rate: f64, input_channels: u16) -> HardwareFormat {
    HardwareFormat {
        sample_rate,
        input_channels,
    }
}

fn engine(hardware: HardwareFormat) -> (EngineContext, MockHandle, mpsc::UnboundedReceiver<Event>) {
    let (backend, handle) = MockBackend::new(hardware);
    let (tx, rx) = mpsc::unbounded_channel();
    let notifier: SharedNotifier = Arc::new(tx);
    let ctx = EngineContext::new(AudioConfig::default(), Box::new(backend), Some(notifier)).unwrap();
    (ctx, handle, rx)
}

fn mic_buffer(sample_rate: f64, channels: u16, frames: usize) -> AudioBuffer {
    let format = AudioFormat::new(sample_rate, channels, SampleEncoding::Float32, true);
    let samples = (0..frames * channels as usize)
        .map(|i| (i as f32 * 0.01).sin() * 0.5)
        .collect();
    AudioBuffer::new(format, audio::SampleData::F32(samples)).unwrap()
}

fn error_kinds(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<ErrorKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let Event::Error { kind, .. } = event {
            kinds.push(kind);
        }
    }
    kinds
}

#[tokio::test]
async fn setup_twice_leaves_one_player_and_one_engine() {
    let (mut ctx, handle, mut events) = engine(hw(48_000.0, 1));

    ctx.setup_engine().await.unwrap();
    ctx.setup_engine().await.unwrap();

    assert_eq!(handle.players(), 1);
    assert!(handle.is_running());
    assert_eq!(ctx.state(), &EngineState::Running);
    assert!(error_kinds(&mut events).is_empty());
}

#[tokio::test]
async fn setup_twice_keeps_single_tap_when_capturing() {
    let (mut ctx, handle, _events) = engine(hw(48_000.0, 1));
    ctx.setup_engine().await.unwrap();
    let stream = ctx.start_capture().await.unwrap();

    ctx.setup_engine().await.unwrap();

    assert!(handle.has_tap());
    assert!(ctx.is_capturing());
    let again = ctx.start_capture().await.unwrap();
    assert!(stream.same_stream(&again));
}

#[tokio::test]
async fn play_chunk_before_setup_is_unavailable() {
    let (mut ctx, handle, mut events) = engine(hw(48_000.0, 1));

    let result = ctx.play_chunk(&AudioChunk::new(vec![0; 480]));

    assert!(matches!(result, Err(AudioError::EngineUnavailable)));
    assert_eq!(handle.scheduled_count(), 0);
    assert_eq!(ctx.stats().chunks_rejected, 1);
    assert_eq!(error_kinds(&mut events), vec![ErrorKind::EngineUnavailable]);
}

#[tokio::test]
async fn play_chunk_frame_accounting() {
    for channels in [1u16, 2] {
        let (mut ctx, _handle, _events) = engine(hw(48_000.0, channels));
        ctx.setup_engine().await.unwrap();
        let frame_bytes = 2 * channels as usize;

        for len in 1..=64usize {
            let result = ctx.play_chunk(&AudioChunk::new(vec![0; len]));
            if len % frame_bytes == 0 {
                assert_eq!(result.unwrap(), len / frame_bytes);
            } else {
                assert!(matches!(result, Err(AudioError::MalformedChunk { .. })), "len {}", len);
            }
        }
    }
}

#[tokio::test]
async fn capture_start_is_idempotent() {
    let (mut ctx, handle, _events) = engine(hw(48_000.0, 1));
    ctx.setup_engine().await.unwrap();

    let first = ctx.start_capture().await.unwrap();
    let second = ctx.start_capture().await.unwrap();

    assert!(first.same_stream(&second));
    assert_eq!(handle.tap_installs(), 1);
}

#[tokio::test]
async fn no_chunk_after_stop_capture() {
    let (mut ctx, handle, _events) = engine(hw(48_000.0, 1));
    ctx.setup_engine().await.unwrap();
    let mut rx = ctx.start_capture().await.unwrap().subscribe();

    assert!(handle.deliver(&mic_buffer(48_000.0, 1, 480)));
    assert_eq!(rx.try_recv().unwrap().len(), 480);

    ctx.stop_capture();
    assert!(!handle.deliver(&mic_buffer(48_000.0, 1, 480)));
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn capture_feeds_playback() {
    let (mut ctx, handle, _events) = engine(hw(44_100.0, 1));
    ctx.setup_engine().await.unwrap();
    let mut rx = ctx.start_capture().await.unwrap().subscribe();

    handle.deliver(&mic_buffer(44_100.0, 1, 441));
    let chunk = rx.try_recv().unwrap();
    assert_eq!(chunk.frame_count(1), Some(240));

    assert_eq!(ctx.play_chunk(&chunk).unwrap(), 240);
    // 24 kHz → 44.1 kHz sur le nœud de lecture
    assert_eq!(handle.scheduled_frames(), vec![441]);
    assert!(handle.is_player_playing());
}

#[tokio::test]
async fn silent_route_change_rebuilds_capture_converter() {
    let (mut ctx, handle, mut events) = engine(hw(48_000.0, 1));
    ctx.setup_engine().await.unwrap();
    let mut rx = ctx.start_capture().await.unwrap().subscribe();

    // Le périphérique passe à 44.1 kHz sans notification
    handle.deliver(&mic_buffer(48_000.0, 1, 480));
    handle.deliver(&mic_buffer(44_100.0, 1, 441));
    handle.deliver(&mic_buffer(44_100.0, 1, 441));

    for _ in 0..3 {
        assert_eq!(rx.try_recv().unwrap().frame_count(1), Some(240));
    }
    let stats = ctx.stats();
    assert_eq!(stats.capture_rebuilds, 1);
    assert_eq!(stats.capture_drops(), 0);
    assert!(error_kinds(&mut events).is_empty());
}

#[tokio::test]
async fn configuration_change_recovers_and_reinstalls_tap() {
    let (mut ctx, handle, _events) = engine(hw(48_000.0, 1));
    ctx.setup_engine().await.unwrap();
    let mut rx = ctx.start_capture().await.unwrap().subscribe();

    handle.set_hardware(hw(44_100.0, 2));
    handle.interrupt_engine();
    ctx.handle_configuration_change().await.unwrap();

    assert_eq!(ctx.state(), &EngineState::Running);
    assert_eq!(handle.tap_installs(), 2);
    assert_eq!(handle.players(), 1);
    let triple = *ctx.formats().await.ready().unwrap();
    assert_eq!(triple.device_input.sample_rate, 44_100.0);
    assert_eq!(triple.wire.channels, 2);

    // L'ancien abonné continue de recevoir sur le même flux
    handle.deliver(&mic_buffer(44_100.0, 2, 441));
    assert_eq!(rx.try_recv().unwrap().frame_count(2), Some(240));
    assert_eq!(ctx.stats().capture_rebuilds, 0);
}

#[tokio::test]
async fn failed_recovery_degrades_to_error_then_retries() {
    let (mut ctx, handle, mut events) = engine(hw(48_000.0, 1));
    ctx.setup_engine().await.unwrap();

    handle.interrupt_engine();
    handle.fail(MockFailure::Start);
    let result = ctx.handle_configuration_change().await;

    assert!(matches!(result, Err(AudioError::EngineStart(_))));
    assert!(matches!(ctx.state(), EngineState::Error(_)));
    assert_eq!(error_kinds(&mut events), vec![ErrorKind::EngineStartError]);
    assert!(matches!(
        ctx.play_chunk(&AudioChunk::new(vec![0; 2])),
        Err(AudioError::EngineUnavailable)
    ));

    handle.clear_failures();
    ctx.handle_configuration_change().await.unwrap();
    assert_eq!(ctx.state(), &EngineState::Running);
    assert_eq!(handle.players(), 1);
}

#[tokio::test]
async fn shutdown_is_safe_from_any_state() {
    let (mut ctx, handle, mut events) = engine(hw(48_000.0, 1));
    ctx.shutdown().await;
    assert_eq!(ctx.state(), &EngineState::Uninitialized);

    handle.fail(MockFailure::ActivateSession);
    assert!(ctx.setup_engine().await.is_err());
    assert!(matches!(ctx.state(), EngineState::Error(_)));

    ctx.shutdown().await;
    assert_eq!(ctx.state(), &EngineState::Uninitialized);
    assert!(!handle.is_running());
    assert_eq!(error_kinds(&mut events), vec![ErrorKind::SessionConfigError]);

    handle.clear_failures();
    ctx.setup_engine().await.unwrap();
    assert_eq!(ctx.state(), &EngineState::Running);
}
