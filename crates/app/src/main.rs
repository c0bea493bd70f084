// Application de démonstration du pipeline audio Voxlink
//
// Cette application pilote un EngineContext contre les vrais périphériques
// (cpal) ou contre le backend simulé (--simulate) :
// - devices  : négocie les formats et les affiche
// - loopback : micro → format réseau → haut-parleurs
// - tone     : chunks synthétiques au format réseau → haut-parleurs

use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Instant, interval, sleep_until};
use tracing_subscriber::EnvFilter;

use audio::{
    AudioBuffer, AudioChunk, AudioConfig, AudioFormat, CpalBackend, EngineContext, Formats, HardwareFormat,
    LogNotifier, MockBackend, MockHandle, RouteChange, SampleData, SampleEncoding, SharedNotifier, list_devices,
};

#[derive(Parser, Debug)]
#[command(name = "voxlink", author, version, about = "Pipeline audio temps réel pour voice-bot")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Nombre de canaux demandé (avant activation de la session)
    #[arg(long, global = true, default_value_t = 1)]
    channels: u16,

    /// Fréquence préférée en Hz
    #[arg(long, global = true, default_value_t = 48_000.0)]
    sample_rate: f64,

    /// Durée de buffer d'E/S préférée en millisecondes
    #[arg(long, global = true, default_value_t = 20.0)]
    io_buffer_ms: f64,

    /// Active l'annulation d'écho de la plateforme
    #[arg(long, global = true)]
    echo_cancellation: bool,

    /// Utilise le backend simulé au lieu des périphériques réels
    #[arg(long, global = true)]
    simulate: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Liste les périphériques et affiche les formats négociés
    Devices,
    /// Renvoie le micro vers les haut-parleurs via le format réseau
    Loopback {
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
    },
    /// Joue une sinusoïde envoyée en chunks au format réseau
    Tone {
        #[arg(short, long, default_value_t = 440.0)]
        freq: f32,
        #[arg(short, long, default_value_t = 3)]
        seconds: u64,
    },
}

/// Contexte audio + sources d'événements externes
struct Harness {
    ctx: EngineContext,
    routes: Option<UnboundedReceiver<RouteChange>>,
    mock: Option<MockHandle>,
}

impl Harness {
    fn build(cli: &Cli) -> Result<Self> {
        let base = if cli.echo_cancellation {
            AudioConfig::voice_bot()
        } else {
            AudioConfig::default()
        };
        let config = AudioConfig {
            channels: cli.channels,
            preferred_sample_rate: cli.sample_rate,
            preferred_io_buffer_ms: cli.io_buffer_ms,
            ..base
        };
        let notifier: SharedNotifier = Arc::new(LogNotifier);

        if cli.simulate {
            let (backend, handle) = MockBackend::new(HardwareFormat {
                sample_rate: cli.sample_rate,
                input_channels: cli.channels,
            });
            let ctx = EngineContext::new(config, Box::new(backend), Some(notifier))?;
            Ok(Self {
                ctx,
                routes: None,
                mock: Some(handle),
            })
        } else {
            let mut backend = CpalBackend::new();
            let routes = backend.take_route_changes();
            let ctx = EngineContext::new(config, Box::new(backend), Some(notifier))?;
            Ok(Self {
                ctx,
                routes,
                mock: None,
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut harness = Harness::build(&cli)?;
    tracing::info!(simulate = cli.simulate, "🎤 Voxlink - {}", harness.ctx.device_info());

    let result = match cli.command {
        Commands::Devices => run_devices(&mut harness, cli.simulate).await,
        Commands::Loopback { seconds } => run_loopback(&mut harness, seconds).await,
        Commands::Tone { freq, seconds } => run_tone(&mut harness, freq, seconds).await,
    };

    harness.ctx.shutdown().await;
    let stats = harness.ctx.stats();
    tracing::info!(
        received = stats.buffers_received,
        emitted = stats.chunks_emitted,
        dropped = stats.capture_drops(),
        scheduled = stats.chunks_scheduled,
        rejected = stats.chunks_rejected,
        "📊 Statistiques"
    );
    result
}

async fn run_devices(harness: &mut Harness, simulate: bool) -> Result<()> {
    if !simulate {
        for device in list_devices()? {
            println!(
                "{} {}{} ({} Hz, {} canaux)",
                if device.is_input { "🎤" } else { "🔊" },
                device.name,
                if device.is_default { " [défaut]" } else { "" },
                device.sample_rate.map_or("?".to_string(), |r| r.to_string()),
                device.channels.map_or("?".to_string(), |c| c.to_string()),
            );
        }
    }

    harness.ctx.setup_engine().await.context("setup du moteur audio")?;
    if let Formats::Ready(triple) = harness.ctx.formats().await {
        println!("📋 Formats négociés :");
        println!("   Périphérique : {}", triple.device_input);
        println!("   Mixage       : {}", triple.internal_mix);
        println!("   Réseau       : {}", triple.wire);
    }
    Ok(())
}

async fn run_loopback(harness: &mut Harness, seconds: u64) -> Result<()> {
    harness.ctx.setup_engine().await.context("setup du moteur audio")?;
    let stream = harness.ctx.start_capture().await?;
    let mut chunks = stream.subscribe();

    let deadline = Instant::now() + Duration::from_secs(seconds);
    let mut mic = SimulatedMic::new(harness.ctx.config().preferred_io_buffer_ms);
    let mut ticker = interval(mic.period());

    tracing::info!("🔁 Loopback pendant {}s (Ctrl+C pour arrêter)", seconds);
    loop {
        tokio::select! {
            received = chunks.recv() => match received {
                Ok(chunk) => {
                    // L'erreur est déjà publiée sur le notifier
                    let _ = harness.ctx.play_chunk(&chunk);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("⚠️  {} chunks perdus par le loopback", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            Some(route) = next_route(&mut harness.routes) => {
                tracing::warn!("🔀 {}", route.reason);
                let _ = harness.ctx.handle_configuration_change().await;
            }
            _ = ticker.tick(), if harness.mock.is_some() => {
                if let (Some(handle), Formats::Ready(triple)) = (&harness.mock, harness.ctx.formats().await) {
                    let frames = harness.ctx.config().io_buffer_frames(triple.device_input.sample_rate) as usize;
                    handle.deliver(&mic.next_buffer(triple.device_input, frames));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("🛑 Arrêt demandé");
                break;
            }
            _ = sleep_until(deadline) => break,
        }
    }

    harness.ctx.stop_capture();
    Ok(())
}

async fn run_tone(harness: &mut Harness, freq: f32, seconds: u64) -> Result<()> {
    harness.ctx.setup_engine().await.context("setup du moteur audio")?;
    let Formats::Ready(triple) = harness.ctx.formats().await else {
        anyhow::bail!("formats non négociés");
    };

    // 20ms au format réseau, cadence d'un flux réseau réel
    let frames = (triple.wire.sample_rate * 0.02) as usize;
    let total = seconds * 50;
    let mut ticker = interval(Duration::from_millis(20));
    let mut phase = 0.0f32;
    let step = TAU * freq / triple.wire.sample_rate as f32;

    tracing::info!("🎵 Sinusoïde {} Hz pendant {}s", freq, seconds);
    let mut sent = 0;
    while sent < total {
        tokio::select! {
            _ = ticker.tick() => {
                let chunk = tone_chunk(triple.wire, frames, &mut phase, step)?;
                let _ = harness.ctx.play_chunk(&chunk);
                sent += 1;
            }
            Some(route) = next_route(&mut harness.routes) => {
                tracing::warn!("🔀 {}", route.reason);
                let _ = harness.ctx.handle_configuration_change().await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("🛑 Arrêt demandé");
                break;
            }
        }
    }

    harness.ctx.stop_playback();
    Ok(())
}

/// Chunk au format réseau contenant une sinusoïde
fn tone_chunk(wire: AudioFormat, frames: usize, phase: &mut f32, step: f32) -> Result<AudioChunk> {
    let channels = wire.channels as usize;
    let mut samples = Vec::with_capacity(frames * channels);
    for _ in 0..frames {
        let value = (phase.sin() * 0.3 * i16::MAX as f32) as i16;
        samples.extend(std::iter::repeat_n(value, channels));
        *phase = (*phase + step) % TAU;
    }
    let buffer = AudioBuffer::new(wire, SampleData::I16(samples))?;
    Ok(AudioChunk::from_buffer(&buffer)?)
}

async fn next_route(routes: &mut Option<UnboundedReceiver<RouteChange>>) -> Option<RouteChange> {
    match routes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Micro synthétique pour `--simulate` : une sinusoïde à 220 Hz
struct SimulatedMic {
    io_buffer_ms: f64,
    phase: f32,
}

impl SimulatedMic {
    fn new(io_buffer_ms: f64) -> Self {
        Self { io_buffer_ms, phase: 0.0 }
    }

    fn period(&self) -> Duration {
        Duration::from_secs_f64(self.io_buffer_ms / 1000.0)
    }

    fn next_buffer(&mut self, format: AudioFormat, frames: usize) -> AudioBuffer {
        let step = TAU * 220.0 / format.sample_rate as f32;
        let channels = format.channels as usize;

        let mut samples = Vec::with_capacity(frames * channels);
        for _ in 0..frames {
            samples.extend(std::iter::repeat_n(self.phase.sin() * 0.3, channels));
            self.phase = (self.phase + step) % TAU;
        }
        let format = AudioFormat::new(format.sample_rate, format.channels, SampleEncoding::Float32, true);
        AudioBuffer::new(format, SampleData::F32(samples)).unwrap_or_else(|_| AudioBuffer::silence(format, frames))
    }
}
