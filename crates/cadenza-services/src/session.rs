//! Session: the master clock, its ensemble and transcriber

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cadenza_core::{Clock, ClockError, CurveShape, ForkHandle, ForkOptions};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ensemble::Ensemble;
use crate::error::Result;
use crate::instrument::Instrument;
use crate::listeners::{ListenerHandle, ListenerKey, ListenerRegistry};
use crate::transcriber::{Performance, TimeUnits, Transcriber};

pub const MASTER_CLOCK_NAME: &str = "MASTER";

/// Persisted subset of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SessionSnapshot {
    tempo: f64,
    parts: Vec<String>,
}

pub struct Session {
    master: Clock,
    ensemble: RwLock<Ensemble>,
    transcriber: Transcriber,
    listeners: Mutex<ListenerRegistry>,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(tempo: f64) -> Result<Self> {
        Self::with_ensemble(tempo, Ensemble::new())
    }

    pub fn with_ensemble(tempo: f64, ensemble: Ensemble) -> Result<Self> {
        let master = Clock::new(MASTER_CLOCK_NAME, tempo)?;
        info!(tempo, parts = ensemble.len(), "Session started");
        Ok(Self {
            master,
            ensemble: RwLock::new(ensemble),
            transcriber: Transcriber::new(),
            listeners: Mutex::new(ListenerRegistry::new()),
            server: Mutex::new(None),
        })
    }

    pub fn master(&self) -> &Clock {
        &self.master
    }

    // Clock delegation

    pub fn fork<T, F>(&self, action: F) -> Result<ForkHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Clock) -> T + Send + 'static,
    {
        Ok(self.master.fork(action)?)
    }

    pub fn fork_with<T, F>(&self, options: ForkOptions, action: F) -> Result<ForkHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Clock) -> T + Send + 'static,
    {
        Ok(self.master.fork_with(options, action)?)
    }

    pub fn fork_unsynchronized<T, F>(&self, action: F) -> Result<ForkHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Clock) -> T + Send + 'static,
    {
        Ok(self.master.fork_unsynchronized(action)?)
    }

    pub fn wait(&self, beats: f64) -> Result<()> {
        Ok(self.master.wait(beats)?)
    }

    pub fn wait_forever(&self) -> Result<()> {
        Ok(self.master.wait_forever()?)
    }

    pub fn wait_for_children_to_finish(&self) -> Result<()> {
        Ok(self.master.wait_for_children_to_finish()?)
    }

    pub fn beats(&self) -> f64 {
        self.master.beats()
    }

    pub fn time(&self) -> f64 {
        self.master.time()
    }

    pub fn tempo(&self) -> f64 {
        self.master.tempo()
    }

    pub fn set_tempo(&self, tempo: f64) -> Result<()> {
        Ok(self.master.set_tempo(tempo)?)
    }

    pub fn set_tempo_target(&self, target: f64, duration: f64, shape: CurveShape) -> Result<()> {
        Ok(self.master.set_tempo_target(target, duration, shape)?)
    }

    // Ensemble delegation

    pub fn new_part(&self, name: impl Into<String>) -> Instrument {
        self.ensemble.write().new_part(name)
    }

    pub fn new_silent_part(&self, name: impl Into<String>) -> Instrument {
        self.ensemble.write().new_silent_part(name)
    }

    pub fn add_part(&self, instrument: Instrument) -> Instrument {
        self.ensemble.write().add_part(instrument)
    }

    pub fn get_part_by_name(&self, query: &str) -> Option<Instrument> {
        self.ensemble.read().get_part_by_name(query)
    }

    pub fn remove_part(&self, name: &str) -> Result<Instrument> {
        self.ensemble.write().remove_part(name)
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        self.ensemble.read().instruments().to_vec()
    }

    // Transcription

    /// Transcribe every part against the master clock, in beats
    pub fn start_transcribing(&self) -> Result<()> {
        let instruments = self.instruments();
        self.transcriber.start_transcribing(&instruments, &self.master, TimeUnits::Beats)
    }

    pub fn start_transcribing_with(&self, instruments: &[Instrument], clock: &Clock, units: TimeUnits) -> Result<()> {
        self.transcriber.start_transcribing(instruments, clock, units)
    }

    pub fn is_transcribing(&self) -> bool {
        self.transcriber.is_transcribing()
    }

    pub fn stop_transcribing(&self) -> Result<Performance> {
        self.transcriber.stop_transcribing()
    }

    // Outside interaction

    /// Keep the master alive on a background thread so other threads can call in
    pub fn run_as_server(&self) -> Result<()> {
        let mut server = self.server.lock();
        if server.is_some() {
            return Ok(());
        }
        let master = self.master.clone();
        let handle = thread::Builder::new()
            .name("cadenza-server".to_string())
            .spawn(move || match master.wait_forever() {
                Err(err) if err.is_terminated() => debug!("Server loop finished"),
                Err(err) => warn!(%err, "Server loop failed"),
                Ok(()) => {}
            })
            .map_err(ClockError::from)?;
        *server = Some(handle);
        info!("Session running as server");
        Ok(())
    }

    /// Wrap a listener callback so it runs roused on the master, at "now"
    ///
    /// The master is the current clock while the callback runs. A panicking
    /// callback is logged and its hold released.
    pub fn wrap_callback<A, F>(&self, callback: F) -> impl Fn(A) + Send + Sync + 'static
    where
        A: 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        let master = self.master.clone();
        move |arg: A| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| master.run_roused(|_| callback(arg))));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%err, "Listener callback skipped"),
                Err(_) => warn!("Listener callback panicked"),
            }
        }
    }

    /// Wrap a listener callback so it is queued onto the master's thread
    pub fn wrap_dispatched<A, F>(&self, callback: F) -> impl Fn(A) + Send + Sync + 'static
    where
        A: Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        let master = self.master.clone();
        let callback = Arc::new(callback);
        move |arg: A| {
            let callback = callback.clone();
            if let Err(err) = master.dispatch(move |_| callback(arg)) {
                warn!(%err, "Listener event dropped");
            }
        }
    }

    pub fn register_listener(&self, key: ListenerKey, handle: Box<dyn ListenerHandle>) {
        self.listeners.lock().register(key, handle);
    }

    pub fn remove_listener(&self, key: &ListenerKey) -> Result<()> {
        self.listeners.lock().remove(key)
    }

    pub fn listener_keys(&self) -> Vec<ListenerKey> {
        self.listeners.lock().keys()
    }

    // Persistence

    /// Tempo and part names only
    pub fn to_json(&self) -> Result<String> {
        let snapshot = SessionSnapshot {
            tempo: self.tempo(),
            parts: self.ensemble.read().part_names(),
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: SessionSnapshot = serde_json::from_str(json)?;
        let session = Self::new(snapshot.tempo)?;
        for name in snapshot.parts {
            session.new_part(name);
        }
        Ok(session)
    }

    /// Stop listeners, silence every part and terminate the master
    pub fn stop(&self) {
        self.listeners.lock().stop_all();
        if self.transcriber.is_transcribing() {
            let _ = self.transcriber.stop_transcribing();
        }
        for part in self.ensemble.read().instruments() {
            part.end_all_notes();
        }
        if !self.master.is_terminated() {
            self.master.terminate();
            info!(beat = self.master.beats(), "Session stopped");
        }
        if let Some(server) = self.server.lock().take() {
            let _ = server.join();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::listeners::StopFn;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_transcribes_forked_parts_on_master_beats() {
        let session = Session::new(6000.0).unwrap();
        let piano = session.new_part("piano");
        let bass = session.new_part("bass");
        session.start_transcribing().unwrap();

        let melody = piano.clone();
        session
            .fork(move |c| {
                melody.play_note(c, 60.0, 0.5, 1.0)?;
                melody.play_note(c, 62.0, 0.5, 1.0)
            })
            .unwrap();
        let line = bass.clone();
        session
            .fork_with(ForkOptions::synchronized().with_rate(2.0), move |c| line.play_note(c, 36.0, 0.7, 1.0))
            .unwrap();
        session.wait_for_children_to_finish().unwrap();

        let performance = session.stop_transcribing().unwrap();
        let starts: Vec<f64> = performance.part("piano").unwrap().notes.iter().map(|n| n.start).collect();
        assert_eq!(starts, vec![0.0, 1.0]);
        assert_eq!(performance.part("bass").unwrap().notes[0].length, 0.5);
        assert_eq!(performance.end(), 2.0);
        assert_eq!(session.beats(), 2.0);
    }

    #[test]
    fn test_wrapped_callback_runs_at_now() {
        let session = Session::new(600.0).unwrap();
        session.run_as_server().unwrap();
        thread::sleep(Duration::from_millis(100));

        let (tx, rx) = crossbeam_channel::bounded(1);
        let callback = session.wrap_callback(move |pitch: f64| {
            let beats = cadenza_core::current_clock().map(|c| c.beats());
            let _ = tx.send((pitch, beats));
        });
        callback(64.0);

        let (pitch, beats) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(pitch, 64.0);
        let beats = beats.unwrap();
        assert!(beats >= 0.9 && beats < 5.0, "roused at beat {beats}");
        assert_eq!(session.master().suspension_depth(), 0);
    }

    #[test]
    fn test_callback_forks_start_at_roused_beat() {
        let session = Session::new(600.0).unwrap();
        session.run_as_server().unwrap();
        thread::sleep(Duration::from_millis(100));

        let (tx, rx) = crossbeam_channel::bounded(1);
        let callback = session.wrap_callback(move |_: ()| {
            let Some(master) = cadenza_core::current_clock() else {
                return;
            };
            let roused = master.beats();
            let child = master.fork(|c| c.parent().map(|p| p.beats()));
            let nested = master.rouse_and_hold().map(|hold| {
                let depth = master.suspension_depth();
                drop(hold);
                depth
            });
            let _ = tx.send((roused, child, nested));
        });
        callback(());

        let (roused, child, nested) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(nested.unwrap(), 2);
        assert_eq!(session.master().suspension_depth(), 0);
        assert_eq!(child.unwrap().join().unwrap(), Some(roused));
    }

    #[test]
    fn test_callback_plays_on_idle_master() {
        let session = Session::new(6000.0).unwrap();
        let piano = session.new_part("piano");
        session.start_transcribing().unwrap();

        let part = piano.clone();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let callback = session.wrap_callback(move |pitch: f64| {
            let _ = tx.send(part.play_note_on_current(pitch, 0.5, 1.0).is_ok());
        });
        callback(60.0);

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(true));
        assert_eq!(session.beats(), 1.0);
        assert_eq!(session.master().suspension_depth(), 0);
        let performance = session.stop_transcribing().unwrap();
        assert_eq!(performance.part("piano").unwrap().notes[0].length, 1.0);
    }

    #[test]
    fn test_wrapped_callback_survives_panic() {
        let session = Session::new(600.0).unwrap();
        session.run_as_server().unwrap();
        let callback = session.wrap_callback(|_: ()| panic!("listener bug"));
        callback(());
        assert_eq!(session.master().suspension_depth(), 0);
        assert!(!session.master().is_terminated());
    }

    #[test]
    fn test_wrapped_dispatch_runs_on_server_thread() {
        let session = Session::new(600.0).unwrap();
        session.run_as_server().unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let callback = session.wrap_dispatched(move |label: &'static str| {
            let _ = tx.send((label, thread::current().name().map(str::to_string)));
        });
        callback("note");

        let (label, thread_name) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(label, "note");
        assert_eq!(thread_name.as_deref(), Some("cadenza-server"));
    }

    #[test]
    fn test_listener_registry() {
        let session = Session::new(60.0).unwrap();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        session.register_listener(ListenerKey::Keyboard, Box::new(StopFn::new(move || flag.store(true, Ordering::SeqCst))));
        assert_eq!(session.listener_keys(), vec![ListenerKey::Keyboard]);

        session.remove_listener(&ListenerKey::Keyboard).unwrap();
        assert!(stopped.load(Ordering::SeqCst));
        assert!(matches!(session.remove_listener(&ListenerKey::Mouse), Err(SessionError::ListenerNotFound(_))));
    }

    #[test]
    fn test_json_keeps_tempo_and_parts() {
        let session = Session::new(90.0).unwrap();
        session.new_part("Violin");
        session.new_silent_part("Viola");

        let json = session.to_json().unwrap();
        let restored = Session::from_json(&json).unwrap();
        assert_eq!(restored.tempo(), 90.0);
        let names: Vec<String> = restored.instruments().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["Violin".to_string(), "Viola".to_string()]);
        assert!(Session::from_json("{\"tempo\": 1.0}").is_err());
    }

    #[test]
    fn test_stop_terminates_forks() {
        let session = Session::new(6000.0).unwrap();
        let handle = session.fork(|c| c.wait(10.0)).unwrap();
        session.wait(1.0).unwrap();
        session.stop();

        assert!(matches!(handle.join().unwrap(), Err(ClockError::ClockTerminated(_))));
        assert!(session.master().is_terminated());
        assert!(matches!(session.wait(1.0), Err(SessionError::Clock(ClockError::ClockTerminated(_)))));
    }

    #[test]
    fn test_drop_joins_server() {
        let session = Session::new(60.0).unwrap();
        session.run_as_server().unwrap();
        let master = session.master().clone();
        drop(session);
        assert!(master.is_terminated());
    }
}
