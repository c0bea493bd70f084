//! Crate audio pour Voxlink - pipeline audio temps réel d'un voice-bot
//!
//! Ce crate gère toute la chaîne audio entre le matériel et le réseau :
//! - Négociation des formats (périphérique, mixage interne, réseau 24 kHz int16)
//! - Capture micro → chunks au format réseau
//! - Chunks reçus du réseau → lecture sur le nœud de sortie
//! - Cycle de vie du moteur et reprise après changement de route

pub mod config;       // Configuration audio
pub mod types;        // Formats, buffers, chunks, états
pub mod error;        // Gestion d'erreurs
pub mod events;       // Événements vers la couche de notification
pub mod traits;       // Traits abstraits (backend, musique de fond)
pub mod converter;    // Conversion de format (fréquence, canaux, encodage)
pub mod negotiate;    // Négociation des formats
pub mod capture;      // Tap de capture
pub mod playback;     // Planification de la lecture
pub mod pipeline;     // Cycle de vie du moteur
pub mod cpal_backend; // Backend réel avec cpal
pub mod mock;         // Backend simulé

// Réexports pour faciliter l'utilisation
pub use config::*;
pub use types::*;
pub use traits::*;
pub use error::*;
pub use events::{Event, LogNotifier, Notifier, SharedNotifier};

// Réexports des implémentations principales
pub use capture::{CaptureTap, ChunkStream};
pub use converter::{ConverterPair, SampleConverter};
pub use cpal_backend::{CpalBackend, DeviceSummary, RouteChange, list_devices};
pub use mock::{MockBackend, MockFailure, MockHandle};
pub use negotiate::FormatNegotiator;
pub use pipeline::EngineContext;
pub use playback::PlaybackScheduler;
