//! Transcription of played notes into a performance

use std::collections::HashMap;
use std::sync::Arc;

use cadenza_core::Clock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, SessionError};
use crate::instrument::{Instrument, InstrumentId, NoteHandle, NoteId, NoteObserver, ObserverId};

/// Which of the recording clock's positions timestamps notes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeUnits {
    #[default]
    Beats,
    Time,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceNote {
    pub start: f64,
    pub length: f64,
    pub pitch: f64,
    pub volume: f64,
}

impl PerformanceNote {
    pub fn end(&self) -> f64 {
        self.start + self.length
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformancePart {
    pub instrument: String,
    pub instrument_id: InstrumentId,
    pub notes: Vec<PerformanceNote>,
}

/// Notes recorded per instrument, ordered by start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub units: TimeUnits,
    pub parts: Vec<PerformancePart>,
}

impl Performance {
    /// Position at which the last note ends
    pub fn end(&self) -> f64 {
        self.parts
            .iter()
            .flat_map(|p| p.notes.iter())
            .map(PerformanceNote::end)
            .fold(0.0, f64::max)
    }

    pub fn note_count(&self) -> usize {
        self.parts.iter().map(|p| p.notes.len()).sum()
    }

    pub fn part(&self, name: &str) -> Option<&PerformancePart> {
        self.parts.iter().find(|p| p.instrument == name)
    }
}

struct Take {
    instrument: Instrument,
    observer: ObserverId,
    notes: Vec<PerformanceNote>,
}

struct OpenNote {
    take: usize,
    start: f64,
    pitch: f64,
    volume: f64,
}

impl OpenNote {
    fn close(self, at: f64) -> PerformanceNote {
        PerformanceNote {
            start: self.start,
            length: (at - self.start).max(0.0),
            pitch: self.pitch,
            volume: self.volume,
        }
    }
}

struct Recording {
    clock: Clock,
    units: TimeUnits,
    origin: f64,
    takes: Vec<Take>,
    open: HashMap<NoteId, OpenNote>,
}

impl Recording {
    fn position(&self) -> f64 {
        let now = match self.units {
            TimeUnits::Beats => self.clock.beats(),
            TimeUnits::Time => self.clock.time(),
        };
        now - self.origin
    }

    fn take_index(&self, id: InstrumentId) -> Option<usize> {
        self.takes.iter().position(|t| t.instrument.id() == id)
    }
}

type Shared = Arc<Mutex<Option<Recording>>>;

struct TakeObserver {
    recording: Shared,
}

impl NoteObserver for TakeObserver {
    fn note_started(&self, instrument: &Instrument, note: &NoteHandle) {
        let mut guard = self.recording.lock();
        let Some(recording) = guard.as_mut() else {
            return;
        };
        if let Some(take) = recording.take_index(instrument.id()) {
            let start = recording.position();
            recording.open.insert(note.id, OpenNote { take, start, pitch: note.pitch, volume: note.volume });
        }
    }

    fn note_ended(&self, _instrument: &Instrument, note: &NoteHandle) {
        let mut guard = self.recording.lock();
        let Some(recording) = guard.as_mut() else {
            return;
        };
        if let Some(open) = recording.open.remove(&note.id) {
            let at = recording.position();
            let take = open.take;
            if let Some(take) = recording.takes.get_mut(take) {
                take.notes.push(open.close(at));
            }
        }
    }
}

/// Records notes of a set of instruments against one clock
#[derive(Default)]
pub struct Transcriber {
    recording: Shared,
}

impl Transcriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_transcribing(&self, instruments: &[Instrument], clock: &Clock, units: TimeUnits) -> Result<()> {
        if instruments.is_empty() {
            return Err(SessionError::EmptyEnsemble);
        }
        let mut guard = self.recording.lock();
        if guard.is_some() {
            return Err(SessionError::AlreadyTranscribing);
        }

        let mut recording = Recording {
            clock: clock.clone(),
            units,
            origin: 0.0,
            takes: Vec::with_capacity(instruments.len()),
            open: HashMap::new(),
        };
        recording.origin = recording.position();
        for instrument in instruments {
            if recording.take_index(instrument.id()).is_some() {
                continue;
            }
            let observer = instrument.observe(Arc::new(TakeObserver { recording: self.recording.clone() }));
            recording.takes.push(Take { instrument: instrument.clone(), observer, notes: Vec::new() });
        }

        info!(clock = %clock.name(), parts = recording.takes.len(), ?units, "Transcription started");
        *guard = Some(recording);
        Ok(())
    }

    pub fn is_transcribing(&self) -> bool {
        self.recording.lock().is_some()
    }

    /// Position relative to the start of the transcription
    pub fn current_position(&self) -> Option<f64> {
        self.recording.lock().as_ref().map(Recording::position)
    }

    /// Finish recording; notes still sounding are closed at the stop position
    pub fn stop_transcribing(&self) -> Result<Performance> {
        let recording = self.recording.lock().take().ok_or(SessionError::NotTranscribing)?;
        let stop = recording.position();
        let Recording { units, mut takes, open, .. } = recording;

        for note in open.into_values() {
            if let Some(take) = takes.get_mut(note.take) {
                take.notes.push(note.close(stop));
            }
        }

        let parts = takes
            .into_iter()
            .map(|take| {
                take.instrument.unobserve(take.observer);
                let mut notes = take.notes;
                notes.sort_by(|a, b| a.start.total_cmp(&b.start));
                PerformancePart {
                    instrument: take.instrument.name().to_string(),
                    instrument_id: take.instrument.id(),
                    notes,
                }
            })
            .collect();

        let performance = Performance { units, parts };
        info!(notes = performance.note_count(), end = performance.end(), "Transcription stopped");
        Ok(performance)
    }
}
