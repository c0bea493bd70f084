//! Tap de capture : buffers du micro → chunks au format réseau
//!
//! `CaptureTap::on_device_buffer` est appelé par le thread audio temps réel
//! pour chaque buffer du périphérique d'entrée. Il ne bloque jamais :
//! - l'état partagé est lu avec `try_lock()` / `try_read()`
//! - toute erreur est publiée sur le notifier et le buffer est abandonné
//! - les chunks partent sur un canal broadcast (un producteur, N abonnés)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{RwLock, broadcast};

use crate::converter::{SampleConverter, SharedConverter};
use crate::events::{SharedNotifier, report};
use crate::{AudioBuffer, AudioChunk, AudioError, AudioFormat, ConverterDirection, Formats, PipelineStats};

/// Formats courants, écrits par le thread de contrôle, lus par le callback
pub type SharedFormats = Arc<RwLock<Formats>>;

/// Flux de sortie des chunks capturés
///
/// Cloner le handle ne crée pas de nouveau flux : tous les clones partagent
/// le même canal.
#[derive(Clone, Debug)]
pub struct ChunkStream {
    sender: broadcast::Sender<AudioChunk>,
}

impl ChunkStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Nouvel abonné ; il reçoit les chunks émis à partir de maintenant
    pub fn subscribe(&self) -> broadcast::Receiver<AudioChunk> {
        self.sender.subscribe()
    }

    /// Vrai si les deux handles désignent le même flux
    pub fn same_stream(&self, other: &ChunkStream) -> bool {
        self.sender.same_channel(&other.sender)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn emit(&self, chunk: AudioChunk) {
        // Aucun abonné : le chunk est simplement perdu
        let _ = self.sender.send(chunk);
    }
}

/// Compteurs mis à jour depuis le callback
#[derive(Debug, Default)]
struct CaptureCounters {
    received: AtomicU64,
    emitted: AtomicU64,
    dropped_inactive: AtomicU64,
    dropped_conversion: AtomicU64,
    dropped_empty: AtomicU64,
    dropped_busy: AtomicU64,
    rebuilds: AtomicU64,
}

impl CaptureCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Source de chunks pilotée par le callback de capture
///
/// Clonable : le clone installé dans le callback partage tout son état avec
/// celui gardé par le contrôleur.
#[derive(Clone)]
pub struct CaptureTap {
    active: Arc<AtomicBool>,
    converter: SharedConverter,
    formats: SharedFormats,
    stream: ChunkStream,
    counters: Arc<CaptureCounters>,
    notifier: Option<SharedNotifier>,
}

impl CaptureTap {
    pub fn new(
        converter: SharedConverter,
        formats: SharedFormats,
        stream: ChunkStream,
        notifier: Option<SharedNotifier>,
    ) -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            converter,
            formats,
            stream,
            counters: Arc::new(CaptureCounters::default()),
            notifier,
        }
    }

    /// Traite un buffer brut du périphérique
    ///
    /// Appelé par le thread audio temps réel. Si le format du buffer ne
    /// correspond plus au convertisseur (changement de route sans
    /// notification), le convertisseur est reconstruit sur place avant la
    /// conversion.
    pub fn on_device_buffer(&self, buffer: &AudioBuffer) {
        CaptureCounters::bump(&self.counters.received);

        // Un buffer peut encore arriver entre stop() et le retrait effectif du tap
        if !self.active.load(Ordering::Acquire) {
            CaptureCounters::bump(&self.counters.dropped_inactive);
            return;
        }

        // Le thread de contrôle remplace le convertisseur : on perd ce buffer
        let Ok(mut slot) = self.converter.try_lock() else {
            tracing::trace!("convertisseur de capture occupé, buffer abandonné");
            CaptureCounters::bump(&self.counters.dropped_busy);
            return;
        };

        let stale = slot
            .as_ref()
            .is_none_or(|converter| !converter.matches_input(buffer.format()));
        if stale {
            match self.rebuild(buffer.format(), slot.as_ref().map(|c| *c.output_format())) {
                Some(converter) => {
                    CaptureCounters::bump(&self.counters.rebuilds);
                    *slot = Some(converter);
                }
                None => {
                    *slot = None;
                    CaptureCounters::bump(&self.counters.dropped_conversion);
                    return;
                }
            }
        }

        let Some(converter) = slot.as_mut() else {
            return;
        };

        let converted = match converter.convert(buffer) {
            Ok(converted) => converted,
            Err(err) => {
                report(self.notifier.as_ref(), &err);
                CaptureCounters::bump(&self.counters.dropped_conversion);
                return;
            }
        };
        drop(slot);

        // Certains ratios de fréquence donnent 0 frame pour un buffer très court
        if converted.is_empty() {
            CaptureCounters::bump(&self.counters.dropped_empty);
            return;
        }

        match AudioChunk::from_buffer(&converted) {
            Ok(chunk) => {
                CaptureCounters::bump(&self.counters.emitted);
                self.stream.emit(chunk);
            }
            Err(err) => {
                report(self.notifier.as_ref(), &err);
                CaptureCounters::bump(&self.counters.dropped_conversion);
            }
        }
    }

    /// Construit un convertisseur pour le format observé
    ///
    /// La sortie est le format réseau courant ; si les formats partagés sont
    /// en cours d'écriture, on garde la sortie du convertisseur précédent.
    fn rebuild(&self, observed: &AudioFormat, previous_output: Option<AudioFormat>) -> Option<SampleConverter> {
        let wire = self
            .formats
            .try_read()
            .ok()
            .and_then(|formats| formats.ready().map(|triple| triple.wire))
            .or(previous_output);

        let Some(wire) = wire else {
            report(
                self.notifier.as_ref(),
                &AudioError::converter(ConverterDirection::Capture, "format réseau non négocié"),
            );
            return None;
        };

        match SampleConverter::new(*observed, wire) {
            Ok(converter) => {
                tracing::debug!(input = %observed, output = %wire, "🔄 convertisseur de capture reconstruit");
                Some(converter)
            }
            Err(err) => {
                report(
                    self.notifier.as_ref(),
                    &AudioError::converter(ConverterDirection::Capture, err.to_string()),
                );
                None
            }
        }
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::Release);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Handle du flux de sortie
    pub fn stream(&self) -> &ChunkStream {
        &self.stream
    }

    /// Recopie les compteurs de capture dans `stats`
    pub fn fill_stats(&self, stats: &mut PipelineStats) {
        let c = &self.counters;
        stats.buffers_received = c.received.load(Ordering::Relaxed);
        stats.chunks_emitted = c.emitted.load(Ordering::Relaxed);
        stats.dropped_inactive = c.dropped_inactive.load(Ordering::Relaxed);
        stats.dropped_conversion = c.dropped_conversion.load(Ordering::Relaxed);
        stats.dropped_empty = c.dropped_empty.load(Ordering::Relaxed);
        stats.dropped_busy = c.dropped_busy.load(Ordering::Relaxed);
        stats.capture_rebuilds = c.rebuilds.load(Ordering::Relaxed);
    }

    /// Nombre de reconstructions du convertisseur faites dans le callback
    pub fn rebuild_count(&self) -> u64 {
        self.counters.rebuilds.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Notifier;
    use crate::{Event, FormatTriple, SampleData, SampleEncoding};
    use tokio::sync::Mutex;
    use tokio::sync::mpsc;

    fn device(rate: f64, channels: u16) -> AudioFormat {
        AudioFormat::new(rate, channels, SampleEncoding::Float32, true)
    }

    fn triple(rate: f64, channels: u16) -> FormatTriple {
        FormatTriple {
            device_input: device(rate, channels),
            internal_mix: AudioFormat::new(rate, 2, SampleEncoding::Float32, false),
            wire: AudioFormat::wire(channels),
        }
    }

    fn make_tap(formats: Formats, notifier: Option<SharedNotifier>) -> CaptureTap {
        let converter = formats
            .ready()
            .map(|t| SampleConverter::new(t.device_input, t.wire).unwrap());
        CaptureTap::new(
            Arc::new(Mutex::new(converter)),
            Arc::new(RwLock::new(formats)),
            ChunkStream::new(16),
            notifier,
        )
    }

    fn buffer(format: AudioFormat, frames: usize) -> AudioBuffer {
        AudioBuffer::new(
            format,
            SampleData::F32(vec![0.25; frames * format.channels as usize]),
        )
        .unwrap()
    }

    #[test]
    fn test_emits_wire_chunks() {
        let tap = make_tap(Formats::Ready(triple(48_000.0, 1)), None);
        let mut rx = tap.stream().subscribe();
        tap.activate();

        tap.on_device_buffer(&buffer(device(48_000.0, 1), 960));

        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.len(), 480 * 2);
        assert_eq!(chunk.frame_count(1), Some(480));
        assert_eq!(tap.rebuild_count(), 0);
    }

    #[test]
    fn test_inactive_tap_drops_buffers() {
        let tap = make_tap(Formats::Ready(triple(48_000.0, 1)), None);
        let mut rx = tap.stream().subscribe();

        tap.on_device_buffer(&buffer(device(48_000.0, 1), 960));

        assert!(rx.try_recv().is_err());
        let mut stats = PipelineStats::default();
        tap.fill_stats(&mut stats);
        assert_eq!(stats.dropped_inactive, 1);
        assert_eq!(stats.chunks_emitted, 0);
    }

    #[test]
    fn test_rebuild_only_on_format_change() {
        let tap = make_tap(Formats::Ready(triple(48_000.0, 1)), None);
        let mut rx = tap.stream().subscribe();
        tap.activate();

        tap.on_device_buffer(&buffer(device(48_000.0, 1), 480));
        tap.on_device_buffer(&buffer(device(48_000.0, 1), 480));
        assert_eq!(tap.rebuild_count(), 0);

        // Route changée sans notification : 44.1 kHz stéréo
        tap.on_device_buffer(&buffer(device(44_100.0, 2), 441));
        assert_eq!(tap.rebuild_count(), 1);
        tap.on_device_buffer(&buffer(device(44_100.0, 2), 441));
        assert_eq!(tap.rebuild_count(), 1);

        // Aucun buffer perdu pendant la reconstruction
        let mut received = 0;
        while let Ok(chunk) = rx.try_recv() {
            // Le format réseau garde le nombre de canaux négocié
            assert!(chunk.frame_count(1).is_some());
            received += 1;
        }
        assert_eq!(received, 4);
    }

    #[test]
    fn test_empty_conversion_is_silently_dropped() {
        let (tx, mut events) = mpsc::unbounded_channel::<Event>();
        let notifier: SharedNotifier = Arc::new(tx);
        let tap = make_tap(Formats::Ready(triple(96_000.0, 1)), Some(notifier));
        let mut rx = tap.stream().subscribe();
        tap.activate();

        // 1 frame à 96 kHz → 0.25 frame à 24 kHz → 0
        tap.on_device_buffer(&buffer(device(96_000.0, 1), 1));

        assert!(rx.try_recv().is_err());
        assert!(events.try_recv().is_err());
        let mut stats = PipelineStats::default();
        tap.fill_stats(&mut stats);
        assert_eq!(stats.dropped_empty, 1);
    }

    #[test]
    fn test_missing_formats_reported_and_dropped() {
        let (tx, mut events) = mpsc::unbounded_channel::<Event>();
        let tap = make_tap(Formats::Unset, Some(Arc::new(tx)));
        tap.activate();

        tap.on_device_buffer(&buffer(device(48_000.0, 1), 480));

        match events.try_recv().unwrap() {
            Event::Error { kind, .. } => assert_eq!(kind, crate::ErrorKind::ConverterInitError),
            other => panic!("événement inattendu: {:?}", other),
        }
        let mut stats = PipelineStats::default();
        tap.fill_stats(&mut stats);
        assert_eq!(stats.dropped_conversion, 1);
    }

    #[test]
    fn test_busy_converter_drops_single_buffer() {
        let tap = make_tap(Formats::Ready(triple(48_000.0, 1)), None);
        let mut rx = tap.stream().subscribe();
        tap.activate();

        let guard = tap.converter.try_lock().unwrap();
        tap.on_device_buffer(&buffer(device(48_000.0, 1), 480));
        drop(guard);
        tap.on_device_buffer(&buffer(device(48_000.0, 1), 480));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        let mut stats = PipelineStats::default();
        tap.fill_stats(&mut stats);
        assert_eq!(stats.dropped_busy, 1);
    }

    #[test]
    fn test_multiple_subscribers_share_stream() {
        let tap = make_tap(Formats::Ready(triple(24_000.0, 1)), None);
        let mut first = tap.stream().subscribe();
        let mut second = tap.stream().subscribe();
        tap.activate();

        tap.on_device_buffer(&buffer(device(24_000.0, 1), 240));

        assert_eq!(first.try_recv().unwrap(), second.try_recv().unwrap());
        assert!(tap.stream().same_stream(&tap.clone().stream().clone()));
    }

    struct Counting(std::sync::atomic::AtomicUsize);

    impl Notifier for Counting {
        fn notify(&self, _event: Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_unsupported_observed_format_is_reported() {
        let counting = Arc::new(Counting(Default::default()));
        let notifier: SharedNotifier = counting.clone();
        let tap = make_tap(Formats::Ready(triple(48_000.0, 1)), Some(notifier));
        tap.activate();

        tap.on_device_buffer(&AudioBuffer::silence(device(0.0, 1), 10));

        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
        assert!(tap.converter.try_lock().unwrap().is_none());
    }
}
