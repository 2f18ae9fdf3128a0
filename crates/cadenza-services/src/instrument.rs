//! Instruments: named parts that start and end notes on a clock

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cadenza_core::{current_clock, Clock, ClockError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Result, SessionError};

static NEXT_INSTRUMENT_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_NOTE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentId(pub u64);

/// Unique identifier for a started note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NoteId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Sound backend for an instrument
pub trait Playback: Send + Sync {
    fn note_on(&self, note: NoteId, pitch: f64, volume: f64);
    fn note_off(&self, note: NoteId);
}

/// Playback that makes no sound
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentPlayback;

impl Playback for SilentPlayback {
    fn note_on(&self, _note: NoteId, _pitch: f64, _volume: f64) {}
    fn note_off(&self, _note: NoteId) {}
}

/// Notified whenever an instrument starts or ends a note
pub trait NoteObserver: Send + Sync {
    fn note_started(&self, instrument: &Instrument, note: &NoteHandle);
    fn note_ended(&self, instrument: &Instrument, note: &NoteHandle);
}

/// A sounding note, returned by `start_note`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteHandle {
    pub id: NoteId,
    pub instrument: InstrumentId,
    pub pitch: f64,
    pub volume: f64,
}

struct InstrumentInner {
    id: InstrumentId,
    name: String,
    playback: Box<dyn Playback>,
    active: Mutex<HashMap<NoteId, NoteHandle>>,
    observers: RwLock<Vec<(ObserverId, Arc<dyn NoteObserver>)>>,
}

/// Shared handle to one part of an ensemble
#[derive(Clone)]
pub struct Instrument {
    inner: Arc<InstrumentInner>,
}

impl Instrument {
    pub fn new(name: impl Into<String>, playback: Box<dyn Playback>) -> Self {
        Self {
            inner: Arc::new(InstrumentInner {
                id: InstrumentId(NEXT_INSTRUMENT_ID.fetch_add(1, Ordering::Relaxed)),
                name: name.into(),
                playback,
                active: Mutex::new(HashMap::new()),
                observers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn silent(name: impl Into<String>) -> Self {
        Self::new(name, Box::new(SilentPlayback))
    }

    pub fn id(&self) -> InstrumentId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn active_notes(&self) -> Vec<NoteHandle> {
        self.inner.active.lock().values().copied().collect()
    }

    pub fn observe(&self, observer: Arc<dyn NoteObserver>) -> ObserverId {
        let id = ObserverId(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed));
        self.inner.observers.write().push((id, observer));
        id
    }

    pub fn unobserve(&self, id: ObserverId) -> bool {
        let mut observers = self.inner.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Start a note at `clock`'s current position
    pub fn start_note(&self, clock: &Clock, pitch: f64, volume: f64) -> Result<NoteHandle> {
        validate_note(pitch, volume)?;
        if clock.is_terminated() {
            return Err(ClockError::ClockTerminated(clock.name().to_string()).into());
        }
        let note = NoteHandle {
            id: NoteId(NEXT_NOTE_ID.fetch_add(1, Ordering::Relaxed)),
            instrument: self.id(),
            pitch,
            volume,
        };
        self.inner.active.lock().insert(note.id, note);
        self.inner.playback.note_on(note.id, pitch, volume);
        trace!(instrument = %self.name(), pitch, volume, beat = clock.beats(), "Note on");
        for (_, observer) in self.observers() {
            observer.note_started(self, &note);
        }
        Ok(note)
    }

    /// End a sounding note; returns false if it had already ended
    pub fn end_note(&self, note: &NoteHandle) -> bool {
        let Some(note) = self.inner.active.lock().remove(&note.id) else {
            return false;
        };
        self.inner.playback.note_off(note.id);
        trace!(instrument = %self.name(), pitch = note.pitch, "Note off");
        for (_, observer) in self.observers() {
            observer.note_ended(self, &note);
        }
        true
    }

    /// Start a note, wait `length` beats on `clock`, then end it
    pub fn play_note(&self, clock: &Clock, pitch: f64, volume: f64, length: f64) -> Result<()> {
        validate_length(length)?;
        let note = self.start_note(clock, pitch, volume)?;
        let waited = clock.wait(length);
        self.end_note(&note);
        waited.map_err(SessionError::from)
    }

    /// Play several pitches together for `length` beats
    pub fn play_chord(&self, clock: &Clock, pitches: &[f64], volume: f64, length: f64) -> Result<()> {
        validate_length(length)?;
        for &pitch in pitches {
            validate_note(pitch, volume)?;
        }
        let mut notes = Vec::with_capacity(pitches.len());
        for &pitch in pitches {
            notes.push(self.start_note(clock, pitch, volume)?);
        }
        let waited = clock.wait(length);
        for note in &notes {
            self.end_note(note);
        }
        waited.map_err(SessionError::from)
    }

    /// End every sounding note, returning how many were ended
    pub fn end_all_notes(&self) -> usize {
        let notes: Vec<NoteHandle> = self.inner.active.lock().drain().map(|(_, n)| n).collect();
        for note in &notes {
            self.inner.playback.note_off(note.id);
            for (_, observer) in self.observers() {
                observer.note_ended(self, note);
            }
        }
        notes.len()
    }

    pub fn start_note_on_current(&self, pitch: f64, volume: f64) -> Result<NoteHandle> {
        self.start_note(&ambient_clock()?, pitch, volume)
    }

    pub fn play_note_on_current(&self, pitch: f64, volume: f64, length: f64) -> Result<()> {
        self.play_note(&ambient_clock()?, pitch, volume, length)
    }

    pub fn play_chord_on_current(&self, pitches: &[f64], volume: f64, length: f64) -> Result<()> {
        self.play_chord(&ambient_clock()?, pitches, volume, length)
    }

    fn observers(&self) -> Vec<(ObserverId, Arc<dyn NoteObserver>)> {
        self.inner.observers.read().clone()
    }
}

impl PartialEq for Instrument {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

fn ambient_clock() -> Result<Clock> {
    current_clock().ok_or(SessionError::NoActiveClock)
}

fn validate_note(pitch: f64, volume: f64) -> Result<()> {
    if !pitch.is_finite() {
        return Err(SessionError::InvalidNote(format!("pitch must be finite, got {pitch}")));
    }
    if !(0.0..=1.0).contains(&volume) {
        return Err(SessionError::InvalidNote(format!("volume must be in [0, 1], got {volume}")));
    }
    Ok(())
}

fn validate_length(length: f64) -> Result<()> {
    if length.is_finite() && length >= 0.0 {
        Ok(())
    } else {
        Err(SessionError::InvalidNote(format!("length must be non-negative, got {length}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::ClockScope;

    /// Records backend calls for assertions
    #[derive(Default)]
    struct RecordingPlayback {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Playback for RecordingPlayback {
        fn note_on(&self, _note: NoteId, pitch: f64, volume: f64) {
            self.events.lock().push(format!("on {pitch} {volume}"));
        }

        fn note_off(&self, _note: NoteId) {
            self.events.lock().push("off".to_string());
        }
    }

    #[test]
    fn test_play_note_waits_and_ends() {
        let clock = Clock::new("root", 6000.0).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let piano = Instrument::new("piano", Box::new(RecordingPlayback { events: events.clone() }));

        piano.play_note(&clock, 60.0, 0.5, 2.0).unwrap();
        assert_eq!(clock.beats(), 2.0);
        assert_eq!(*events.lock(), vec!["on 60 0.5".to_string(), "off".to_string()]);
        assert!(piano.active_notes().is_empty());
    }

    #[test]
    fn test_rejects_invalid_notes() {
        let clock = Clock::new("root", 60.0).unwrap();
        let piano = Instrument::silent("piano");
        assert!(matches!(piano.start_note(&clock, f64::NAN, 0.5), Err(SessionError::InvalidNote(_))));
        assert!(matches!(piano.start_note(&clock, 60.0, 1.5), Err(SessionError::InvalidNote(_))));
        assert!(matches!(piano.play_note(&clock, 60.0, 0.5, -1.0), Err(SessionError::InvalidNote(_))));
        assert!(piano.active_notes().is_empty());
    }

    #[test]
    fn test_end_note_twice_is_harmless() {
        let clock = Clock::new("root", 60.0).unwrap();
        let piano = Instrument::silent("piano");
        let note = piano.start_note(&clock, 64.0, 0.8).unwrap();
        assert!(piano.end_note(&note));
        assert!(!piano.end_note(&note));
    }

    #[test]
    fn test_end_all_notes() {
        let clock = Clock::new("root", 60.0).unwrap();
        let organ = Instrument::silent("organ");
        for pitch in [48.0, 52.0, 55.0] {
            organ.start_note(&clock, pitch, 0.7).unwrap();
        }
        assert_eq!(organ.end_all_notes(), 3);
        assert_eq!(organ.end_all_notes(), 0);
    }

    #[test]
    fn test_ambient_variants_need_a_clock() {
        let piano = Instrument::silent("piano");
        assert!(matches!(piano.start_note_on_current(60.0, 0.5), Err(SessionError::NoActiveClock)));

        let clock = Clock::new("root", 6000.0).unwrap();
        let _scope = ClockScope::enter(&clock);
        piano.play_chord_on_current(&[60.0, 64.0, 67.0], 0.5, 1.0).unwrap();
        assert_eq!(clock.beats(), 1.0);
    }

    #[test]
    fn test_observers_see_start_and_end() {
        struct Counter(Mutex<(usize, usize)>);
        impl NoteObserver for Counter {
            fn note_started(&self, _: &Instrument, _: &NoteHandle) {
                self.0.lock().0 += 1;
            }
            fn note_ended(&self, _: &Instrument, _: &NoteHandle) {
                self.0.lock().1 += 1;
            }
        }

        let clock = Clock::new("root", 6000.0).unwrap();
        let piano = Instrument::silent("piano");
        let counter = Arc::new(Counter(Mutex::new((0, 0))));
        let id = piano.observe(counter.clone());
        piano.play_chord(&clock, &[60.0, 64.0], 0.5, 0.5).unwrap();
        assert_eq!(*counter.0.lock(), (2, 2));

        assert!(piano.unobserve(id));
        piano.play_note(&clock, 60.0, 0.5, 0.5).unwrap();
        assert_eq!(*counter.0.lock(), (2, 2));
    }
}
