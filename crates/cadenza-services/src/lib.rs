//! cadenza-services: Instruments, transcription and the session layer

mod error;
pub mod ensemble;
pub mod instrument;
pub mod listeners;
pub mod session;
pub mod transcriber;

pub use ensemble::{Ensemble, PlaybackFactory};
pub use error::{Result, SessionError};
pub use instrument::{Instrument, InstrumentId, NoteHandle, NoteId, NoteObserver, ObserverId, Playback, SilentPlayback};
pub use listeners::{KeyTracker, ListenerHandle, ListenerKey, ListenerRegistry, StopFn};
pub use session::{Session, MASTER_CLOCK_NAME};
pub use transcriber::{Performance, PerformanceNote, PerformancePart, TimeUnits, Transcriber};
