//! Forking child clocks onto their own threads

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use tracing::{debug, warn};

use crate::clock::{Clock, Pacing};
use crate::context::ClockScope;
use crate::error::{ClockError, Result};
use crate::scheduler::{Phase, Scheduler, Slot};
use crate::tempo::TempoCurve;

/// Whether a fork is paced by its parent or by wall time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkKind {
    Synchronized,
    Unsynchronized,
}

/// Settings for a new child clock
#[derive(Debug, Clone)]
pub struct ForkOptions {
    pub name: Option<String>,
    pub synchronized: bool,
    /// Child beats per parent beat
    pub initial_rate: f64,
}

impl Default for ForkOptions {
    fn default() -> Self {
        Self { name: None, synchronized: true, initial_rate: 1.0 }
    }
}

impl ForkOptions {
    pub fn synchronized() -> Self {
        Self::default()
    }

    pub fn unsynchronized() -> Self {
        Self { synchronized: false, ..Self::default() }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.initial_rate = rate;
        self
    }

    fn kind(&self) -> ForkKind {
        if self.synchronized { ForkKind::Synchronized } else { ForkKind::Unsynchronized }
    }
}

/// Handle for a forked action's completion
///
/// Joining a synchronized fork blocks until its action finishes, which only
/// happens while the parent is waiting. Join after the parent has waited long
/// enough, or after `wait_for_children_to_finish`.
pub struct ForkHandle<T> {
    clock: Clock,
    kind: ForkKind,
    done_rx: Receiver<Result<T>>,
    thread: Option<JoinHandle<()>>,
}

impl<T> ForkHandle<T> {
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn kind(&self) -> ForkKind {
        self.kind
    }

    pub fn is_done(&self) -> bool {
        !self.done_rx.is_empty() || self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Block until the action has finished and return its output
    pub fn join(mut self) -> Result<T> {
        let outcome = self.done_rx.recv().unwrap_or_else(|_| {
            Err(ClockError::ActionFailed(format!(
                "fork '{}' exited without a result",
                self.clock.name()
            )))
        });
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        outcome
    }
}

impl<T, E: fmt::Display> ForkHandle<std::result::Result<T, E>> {
    /// Join an action that returns a `Result`, logging its error
    pub fn join_checked(self) -> Result<std::result::Result<T, E>> {
        let name = self.clock.name().to_string();
        let outcome = self.join()?;
        if let Err(err) = &outcome {
            warn!(clock = %name, %err, "Fork action failed");
        }
        Ok(outcome)
    }
}

impl Clock {
    /// Fork a synchronized child at rate 1
    pub fn fork<T, F>(&self, action: F) -> Result<ForkHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Clock) -> T + Send + 'static,
    {
        self.fork_with(ForkOptions::synchronized(), action)
    }

    /// Fork a child that runs on wall time at this clock's current absolute rate
    pub fn fork_unsynchronized<T, F>(&self, action: F) -> Result<ForkHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Clock) -> T + Send + 'static,
    {
        self.fork_with(ForkOptions::unsynchronized(), action)
    }

    /// Create a child clock and run `action` on it in a new thread
    ///
    /// A synchronized child starts at this clock's current beat, once this
    /// clock reaches its next scheduling point. An unsynchronized child starts
    /// immediately.
    pub fn fork_with<T, F>(&self, options: ForkOptions, action: F) -> Result<ForkHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Clock) -> T + Send + 'static,
    {
        let rate = options.initial_rate;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ClockError::invalid(format!(
                "fork rate must be positive and finite, got {rate}"
            )));
        }
        let tempo = TempoCurve::constant(rate * 60.0)?;
        let kind = options.kind();
        let name = options.name.clone().unwrap_or_else(|| {
            let index = self.children().len() + 1;
            format!("{}.{}", self.name(), index)
        });

        let child = match kind {
            ForkKind::Synchronized => self.spawn_synchronized(name, tempo)?,
            ForkKind::Unsynchronized => self.spawn_unsynchronized(name, tempo)?,
        };
        debug!(parent = %self.name(), child = %child.name(), ?kind, rate, "Forked clock");

        let (done_tx, done_rx) = bounded(1);
        let worker = child.clone();
        let spawned = thread::Builder::new()
            .name(format!("clock-{}", child.name()))
            .spawn(move || {
                let outcome = run_action(&worker, action);
                worker.terminate();
                let _ = done_tx.send(outcome);
            });

        match spawned {
            Ok(thread) => Ok(ForkHandle { clock: child, kind, done_rx, thread: Some(thread) }),
            Err(err) => {
                child.terminate();
                Err(ClockError::Spawn(err))
            }
        }
    }

    fn spawn_synchronized(&self, name: String, tempo: TempoCurve) -> Result<Clock> {
        let mut state = self.scheduler().state.lock();
        if self.is_pacing_root() {
            self.refresh_sleeping(&mut state);
        }
        let (beats, time) = {
            let slot = self.slot(&state)?;
            (slot.beats, slot.time)
        };
        let child = Clock::build(
            name,
            Pacing::Synchronized,
            Some(self),
            self.scheduler_arc(),
            tempo,
            time,
        );
        state.slots.insert(child.id(), Slot::new(time, beats, Phase::Parked));
        // the start request: resume at our current beat
        state.enqueue(self.id(), beats, 0.0, child.clone());
        self.slot_mut(&mut state)?.children.push(child.clone());
        self.condvar().notify_all();
        Ok(child)
    }

    fn spawn_unsynchronized(&self, name: String, tempo: TempoCurve) -> Result<Clock> {
        let mut state = self.scheduler().state.lock();
        if self.is_pacing_root() {
            self.refresh_sleeping(&mut state);
        }
        let time = self.slot(&state)?.time;
        let parent_rate = self.absolute_rate_locked(&state);
        let scheduler = Scheduler::new(time, 1.0 / parent_rate);
        let child = Clock::build(
            name,
            Pacing::Unsynchronized,
            Some(self),
            scheduler.into(),
            tempo,
            time,
        );
        child.install_root(Slot::new(time, 0.0, Phase::Running));
        self.slot_mut(&mut state)?.children.push(child.clone());
        Ok(child)
    }

    /// Block a fresh synchronized child until its parent first releases it
    fn await_start(&self) -> Result<()> {
        let mut state = self.scheduler().state.lock();
        while self.slot(&state)?.phase == Phase::Parked {
            self.condvar().wait(&mut state);
        }
        Ok(())
    }
}

fn run_action<T, F>(clock: &Clock, action: F) -> Result<T>
where
    F: FnOnce(&Clock) -> T,
{
    if clock.is_synchronized() {
        clock.await_start()?;
    }
    let _scope = ClockScope::enter(clock);
    panic::catch_unwind(AssertUnwindSafe(|| action(clock))).map_err(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        warn!(clock = %clock.name(), %message, "Fork action panicked");
        ClockError::ActionFailed(message)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockStatus;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Instant;

    fn fast_root(name: &str) -> Clock {
        // 100 beats per second keeps timing tests short
        Clock::new(name, 6000.0).unwrap()
    }

    #[test]
    fn test_synchronized_child_starts_at_parent_beat() {
        let root = fast_root("root");
        root.wait(2.0).unwrap();
        let handle = root.fork(|c| (c.beats(), c.parent().map(|p| p.beats()))).unwrap();
        root.wait(1.0).unwrap();

        let (beats, parent_beats) = handle.join().unwrap();
        assert_eq!(beats, 0.0);
        assert_eq!(parent_beats, Some(2.0));
    }

    #[test]
    fn test_child_rate_scales_wait() {
        let root = fast_root("root");
        let handle = root
            .fork_with(ForkOptions::synchronized().with_rate(2.0), |c| {
                c.wait(4.0)?;
                Ok::<_, ClockError>(c.beats())
            })
            .unwrap();
        root.wait(1.5).unwrap();
        assert_eq!(handle.clock().beats(), 0.0);
        root.wait(1.0).unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), 4.0);
        assert_eq!(root.beats(), 2.5);
    }

    #[test]
    fn test_child_never_runs_past_parent() {
        let root = fast_root("root");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let handle = root
            .fork(move |c| {
                for _ in 0..10 {
                    if c.wait(1.0).is_err() {
                        break;
                    }
                    log.lock().push(c.beats());
                }
            })
            .unwrap();

        root.wait(3.5).unwrap();
        assert_eq!(*seen.lock(), vec![1.0, 2.0, 3.0]);
        root.terminate();
        assert!(handle.join().is_ok());
        assert_eq!(seen.lock().len(), 3);
    }

    #[test]
    fn test_synchronized_wait_needs_parent_progress() {
        let root = fast_root("root");
        let handle = root
            .fork(|c| {
                c.wait(2.0)?;
                let parent_beats = c.parent().map(|p| p.beats()).unwrap_or(0.0);
                Ok::<_, ClockError>((c.beats(), parent_beats))
            })
            .unwrap();
        root.wait(1.0).unwrap();
        assert!(!handle.is_done());
        assert_eq!(handle.clock().status(), ClockStatus::Suspended);

        root.wait(1.0).unwrap();
        let (beats, parent_beats) = handle.join().unwrap().unwrap();
        assert_eq!(beats, 2.0);
        assert!(parent_beats >= 2.0);
    }

    #[test]
    fn test_equal_positions_resume_in_wait_order() {
        let root = fast_root("root");
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for label in ["a", "b", "c"] {
            let order = order.clone();
            handles.push(
                root.fork(move |c| {
                    c.wait(1.0)?;
                    order.lock().push(label);
                    Ok::<_, ClockError>(())
                })
                .unwrap(),
            );
        }
        root.wait_for_children_to_finish().unwrap();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        assert_eq!(root.beats(), 1.0);
    }

    #[test]
    fn test_terminating_parent_fails_child_waits() {
        let root = fast_root("root");
        let handle = root.fork(|c| c.wait(10.0)).unwrap();
        root.wait(1.0).unwrap();
        root.terminate();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(ClockError::ClockTerminated(_))));
        assert!(root.children().is_empty());
    }

    #[test]
    fn test_panicking_action_reports_failure() {
        let root = fast_root("root");
        let handle = root.fork(|_| -> () { panic!("boom") }).unwrap();
        let child = handle.clock().clone();
        root.wait_for_children_to_finish().unwrap();

        assert!(matches!(handle.join(), Err(ClockError::ActionFailed(m)) if m == "boom"));
        assert!(child.is_terminated());
        assert!(root.children().is_empty());
    }

    #[test]
    fn test_join_checked_passes_errors_through() {
        let root = fast_root("root");
        let failing = root.fork(|c| c.wait(-1.0)).unwrap();
        let passing = root.fork(|c| c.wait(1.0).map(|_| c.beats())).unwrap();
        root.wait_for_children_to_finish().unwrap();

        assert!(matches!(failing.join_checked(), Ok(Err(ClockError::InvalidArgument(_)))));
        assert!(matches!(passing.join_checked(), Ok(Ok(beats)) if beats == 1.0));
    }

    #[test]
    fn test_rejects_bad_rate() {
        let root = fast_root("root");
        let result = root.fork_with(ForkOptions::synchronized().with_rate(0.0), |_| ());
        assert!(matches!(result, Err(ClockError::InvalidArgument(_))));
        assert!(root.fork_with(ForkOptions::default().with_rate(f64::NAN), |_| ()).is_err());
    }

    #[test]
    fn test_unsynchronized_fork_runs_on_wall_time() {
        let root = Clock::new("root", 600.0).unwrap();
        let start = Instant::now();
        let handle = root
            .fork_with(ForkOptions::unsynchronized().named("free"), |c| {
                c.wait(2.0)?;
                Ok::<_, ClockError>((c.beats(), c.absolute_rate()))
            })
            .unwrap();
        assert_eq!(handle.kind(), ForkKind::Unsynchronized);
        assert_eq!(handle.clock().name(), "free");

        // the parent never waits, yet the free-running child finishes
        let (beats, rate) = handle.join().unwrap().unwrap();
        let elapsed = start.elapsed().as_secs_f64();
        assert_eq!(beats, 2.0);
        assert!((rate - 10.0).abs() < 1e-9);
        assert!(elapsed >= 0.19 && elapsed < 0.8, "elapsed {elapsed}");
    }

    #[test]
    fn test_unsynchronized_fork_ignores_later_parent_tempo() {
        let root = Clock::new("root", 600.0).unwrap();
        let handle = root
            .fork_unsynchronized(|c| {
                c.wait(1.0)?;
                Ok::<_, ClockError>(c.absolute_rate())
            })
            .unwrap();
        root.set_tempo(60.0).unwrap();
        let rate = handle.join().unwrap().unwrap();
        assert!((rate - 10.0).abs() < 1e-9);
        assert_eq!(root.absolute_rate(), 1.0);
    }

    #[test]
    fn test_nested_forks_share_ambient_clock() {
        let root = fast_root("root");
        let handle = root
            .fork(|c| {
                let inner = c
                    .fork(|g| crate::current_clock().map(|cur| cur == *g))
                    .map_err(|e| e.to_string())?;
                c.wait_for_children_to_finish().map_err(|e| e.to_string())?;
                inner.join().map_err(|e| e.to_string())
            })
            .unwrap();
        root.wait_for_children_to_finish().unwrap();
        assert_eq!(handle.join().unwrap(), Ok(Some(true)));
    }
}
