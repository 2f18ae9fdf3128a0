//! Registry of input listeners that call into a session from outside threads

use std::collections::{HashMap, HashSet};
use std::fmt;

use tracing::{info, warn};

use crate::error::{Result, SessionError};

/// Identifies one input source; at most one listener per key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerKey {
    Midi(u32),
    Osc { address: String, port: u16 },
    Keyboard,
    Mouse,
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Midi(port) => write!(f, "midi:{port}"),
            Self::Osc { address, port } => write!(f, "osc:{address}:{port}"),
            Self::Keyboard => write!(f, "keyboard"),
            Self::Mouse => write!(f, "mouse"),
        }
    }
}

/// A running listener that can be shut down
pub trait ListenerHandle: Send {
    fn stop(&mut self);
}

/// Listener handle that runs a closure once when stopped
pub struct StopFn(Option<Box<dyn FnOnce() + Send>>);

impl StopFn {
    pub fn new(on_stop: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(on_stop)))
    }
}

impl ListenerHandle for StopFn {
    fn stop(&mut self) {
        if let Some(on_stop) = self.0.take() {
            on_stop();
        }
    }
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: HashMap<ListenerKey, Box<dyn ListenerHandle>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` under `key`, stopping any listener it replaces
    pub fn register(&mut self, key: ListenerKey, handle: Box<dyn ListenerHandle>) -> bool {
        let replaced = self.listeners.insert(key.clone(), handle);
        match replaced {
            Some(mut old) => {
                warn!(listener = %key, "Replacing existing listener");
                old.stop();
                true
            }
            None => {
                info!(listener = %key, "Listener registered");
                false
            }
        }
    }

    pub fn remove(&mut self, key: &ListenerKey) -> Result<()> {
        let mut handle = self
            .listeners
            .remove(key)
            .ok_or_else(|| SessionError::ListenerNotFound(key.to_string()))?;
        handle.stop();
        info!(listener = %key, "Listener removed");
        Ok(())
    }

    pub fn contains(&self, key: &ListenerKey) -> bool {
        self.listeners.contains_key(key)
    }

    pub fn keys(&self) -> Vec<ListenerKey> {
        self.listeners.keys().cloned().collect()
    }

    pub fn stop_all(&mut self) {
        for (key, mut handle) in self.listeners.drain() {
            handle.stop();
            info!(listener = %key, "Listener stopped");
        }
    }
}

/// Collapses key auto-repeat: a key is reported pressed once until released
#[derive(Debug, Default)]
pub struct KeyTracker {
    held: HashSet<String>,
}

impl KeyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if this press is new
    pub fn press(&mut self, key: &str) -> bool {
        self.held.insert(key.to_string())
    }

    /// True if the key was held
    pub fn release(&mut self, key: &str) -> bool {
        self.held.remove(key)
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }
}
