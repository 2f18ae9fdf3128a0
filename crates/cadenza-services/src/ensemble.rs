//! Ensemble: ordered registry of instruments

use std::sync::Arc;

use tracing::info;

use crate::error::{Result, SessionError};
use crate::instrument::{Instrument, Playback, SilentPlayback};

/// Builds the playback backend for a new part, given its name
pub type PlaybackFactory = Arc<dyn Fn(&str) -> Box<dyn Playback> + Send + Sync>;

pub struct Ensemble {
    parts: Vec<Instrument>,
    playback_factory: PlaybackFactory,
}

impl Ensemble {
    pub fn new() -> Self {
        Self::with_playback_factory(Arc::new(|_: &str| Box::new(SilentPlayback) as Box<dyn Playback>))
    }

    pub fn with_playback_factory(playback_factory: PlaybackFactory) -> Self {
        Self { parts: Vec::new(), playback_factory }
    }

    /// Add a part using the default playback backend
    pub fn new_part(&mut self, name: impl Into<String>) -> Instrument {
        let name = name.into();
        let playback = (self.playback_factory)(&name);
        self.add_part(Instrument::new(name, playback))
    }

    pub fn new_silent_part(&mut self, name: impl Into<String>) -> Instrument {
        self.add_part(Instrument::silent(name))
    }

    /// Register an existing instrument; adding the same instrument twice is a no-op
    pub fn add_part(&mut self, instrument: Instrument) -> Instrument {
        if !self.parts.contains(&instrument) {
            info!(part = %instrument.name(), "Part added");
            self.parts.push(instrument.clone());
        }
        instrument
    }

    /// First part whose name contains `query`, ignoring case
    pub fn get_part_by_name(&self, query: &str) -> Option<Instrument> {
        self.parts_matching(query).into_iter().next()
    }

    pub fn parts_matching(&self, query: &str) -> Vec<Instrument> {
        let query = query.to_lowercase();
        self.parts
            .iter()
            .filter(|p| p.name().to_lowercase().contains(&query))
            .cloned()
            .collect()
    }

    /// Remove the part with exactly this name
    pub fn remove_part(&mut self, name: &str) -> Result<Instrument> {
        let index = self
            .parts
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| SessionError::PartNotFound(name.to_string()))?;
        let part = self.parts.remove(index);
        part.end_all_notes();
        info!(part = %name, "Part removed");
        Ok(part)
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.parts
    }

    pub fn part_names(&self) -> Vec<String> {
        self.parts.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl Default for Ensemble {
    fn default() -> Self {
        Self::new()
    }
}
