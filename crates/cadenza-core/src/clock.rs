//! Clock tree: virtual time at one level of a hierarchy

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::ClockScope;
use crate::error::{ClockError, Result};
use crate::scheduler::{Phase, Scheduler, Slot, TreeState, WaitGoal};
use crate::tempo::{CurveShape, TempoCurve};

static NEXT_CLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClockId(pub u64);

impl ClockId {
    fn next() -> Self {
        Self(NEXT_CLOCK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle state of a clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockStatus {
    Running,
    Suspended,
    Terminated,
}

/// How a clock is paced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pacing {
    /// Master clock, paced by wall time
    Root,
    /// Paced by its parent's progression
    Synchronized,
    /// Free-running on wall time from the moment it was forked
    Unsynchronized,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    beats: f64,
    time: f64,
}

pub(crate) struct ClockInner {
    id: ClockId,
    name: String,
    pacing: Pacing,
    parent: Option<Weak<ClockInner>>,
    scheduler: Arc<Scheduler>,
    cond: Condvar,
    tempo: RwLock<TempoCurve>,
    created_time: f64,
    retired: OnceLock<Position>,
}

/// Handle to a node of the clock tree
///
/// Cloning is cheap; all clones refer to the same clock. A parent owns its
/// children, while a child only keeps a weak reference to its parent.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

impl Clock {
    /// Create a master clock at the given tempo, paced by wall time
    pub fn new(name: impl Into<String>, initial_tempo: f64) -> Result<Self> {
        let tempo = TempoCurve::constant(initial_tempo)?;
        let scheduler = Arc::new(Scheduler::new(0.0, 1.0));
        let clock = Self::build(name.into(), Pacing::Root, None, scheduler, tempo, 0.0);
        clock.install_root(Slot::new(0.0, 0.0, Phase::Running));
        info!(clock = %clock.name(), tempo = initial_tempo, "Master clock created");
        Ok(clock)
    }

    pub(crate) fn build(
        name: String,
        pacing: Pacing,
        parent: Option<&Clock>,
        scheduler: Arc<Scheduler>,
        tempo: TempoCurve,
        created_time: f64,
    ) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                id: ClockId::next(),
                name,
                pacing,
                parent: parent.map(Clock::downgrade),
                scheduler,
                cond: Condvar::new(),
                tempo: RwLock::new(tempo),
                created_time,
                retired: OnceLock::new(),
            }),
        }
    }

    /// Register this clock as the pacing root of its own scheduler
    pub(crate) fn install_root(&self, slot: Slot) {
        self.scheduler().set_root(self);
        self.scheduler().state.lock().slots.insert(self.id(), slot);
    }

    pub fn id(&self) -> ClockId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parent(&self) -> Option<Clock> {
        self.inner.parent.as_ref().and_then(Clock::upgrade)
    }

    /// Whether this clock is paced by its parent
    pub fn is_synchronized(&self) -> bool {
        self.inner.pacing == Pacing::Synchronized
    }

    /// Live children, in fork order
    pub fn children(&self) -> Vec<Clock> {
        let state = self.scheduler().state.lock();
        self.slot(&state).map(|s| s.children.clone()).unwrap_or_default()
    }

    pub fn status(&self) -> ClockStatus {
        let state = self.scheduler().state.lock();
        match self.slot(&state) {
            Err(_) => ClockStatus::Terminated,
            Ok(slot) if slot.waiting || slot.phase != Phase::Running => ClockStatus::Suspended,
            Ok(_) if self.is_pacing_root() && state.hold_depth > 0 => ClockStatus::Suspended,
            Ok(_) => ClockStatus::Running,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.status() == ClockStatus::Terminated
    }

    /// Beats elapsed on this clock since it was created
    pub fn beats(&self) -> f64 {
        self.position().beats
    }

    /// Absolute session time in seconds at this clock's current position
    pub fn time(&self) -> f64 {
        self.position().time
    }

    /// Seconds elapsed on the master since this clock was created
    pub fn time_since_creation(&self) -> f64 {
        self.time() - self.inner.created_time
    }

    fn position(&self) -> Position {
        let state = self.scheduler().state.lock();
        match self.slot(&state) {
            Ok(slot) => Position { beats: slot.beats, time: slot.time },
            Err(_) => self
                .inner
                .retired
                .get()
                .copied()
                .unwrap_or(Position { beats: 0.0, time: self.inner.created_time }),
        }
    }

    /// Suspend until `beats` of this clock's time have elapsed
    ///
    /// Synchronized children and dispatched messages due in the meantime run
    /// inside this call. A synchronized clock fails with `ClockTerminated` if its
    /// parent chain terminates before the wait completes.
    pub fn wait(&self, beats: f64) -> Result<()> {
        if beats.is_nan() || beats < 0.0 {
            return Err(ClockError::invalid(format!(
                "wait duration must be non-negative, got {beats}"
            )));
        }
        self.run_wait(WaitGoal::Beats(beats))
    }

    /// Suspend until this clock is terminated
    ///
    /// Keeps serving children, dispatched messages and rouse/hold callbacks, and
    /// always ends with `ClockTerminated`.
    pub fn wait_forever(&self) -> Result<()> {
        self.run_wait(WaitGoal::Forever)?;
        Err(self.terminated_error())
    }

    /// Keep scheduling synchronized children until none is left alive
    pub fn wait_for_children_to_finish(&self) -> Result<()> {
        self.run_wait(WaitGoal::ChildrenDone)
    }

    /// Wake this clock's tree, bring its "now" up to date and hold it there
    ///
    /// Holds nest. The returned guard releases on drop, so a failing callback
    /// cannot leave the tree suspended. A hold pins the tree for every other
    /// thread; the holding thread may still wait on the pacing root.
    pub fn rouse_and_hold(&self) -> Result<HoldGuard> {
        let scheduler = self.scheduler();
        let mut state = scheduler.state.lock();
        self.slot(&state)?;
        let holder = thread::current().id();
        state.hold(holder);
        if let Some(root) = scheduler.root() {
            root.refresh_sleeping(&mut state);
            // held at the roused position until the root thread wakes
            if let Some(slot) = state.slots.get_mut(&root.id()) {
                if matches!(slot.phase, Phase::Sleeping { .. }) {
                    slot.phase = Phase::Running;
                }
            }
            root.condvar().notify_all();
        }
        debug!(clock = %self.name(), depth = state.hold_depth, "Roused and held");
        Ok(HoldGuard { clock: self.clone(), holder, released: false })
    }

    /// Undo one `rouse_and_hold`; normally done by dropping its guard
    pub fn release_from_suspension(&self) -> Result<()> {
        self.release_hold(thread::current().id())
    }

    fn release_hold(&self, holder: ThreadId) -> Result<()> {
        let scheduler = self.scheduler();
        let mut state = scheduler.state.lock();
        if !state.release_hold(holder) {
            return Err(ClockError::invalid(format!(
                "clock '{}' is not held",
                self.name()
            )));
        }
        if let Some(root) = scheduler.root() {
            root.condvar().notify_all();
        }
        debug!(clock = %self.name(), depth = state.hold_depth, "Released from suspension");
        Ok(())
    }

    /// Current hold depth of this clock's tree
    pub fn suspension_depth(&self) -> usize {
        self.scheduler().state.lock().hold_depth
    }

    /// Run `callback` attributed to "now" on this clock, from any thread
    ///
    /// Rouses and holds the tree, makes this the current clock for the
    /// duration, then releases, even if the callback panics.
    pub fn run_roused<R>(&self, callback: impl FnOnce(&Clock) -> R) -> Result<R> {
        let hold = self.rouse_and_hold()?;
        let output = {
            let _scope = ClockScope::enter(self);
            callback(self)
        };
        hold.release()?;
        Ok(output)
    }

    /// Queue `message` to run on the pacing root's thread at its next scheduling point
    pub fn dispatch(&self, message: impl FnOnce(&Clock) + Send + 'static) -> Result<()> {
        let scheduler = self.scheduler();
        let mut state = scheduler.state.lock();
        self.slot(&state)?;
        let root = scheduler.root().ok_or_else(|| self.terminated_error())?;
        root.refresh_sleeping(&mut state);
        scheduler.post(Box::new(message));
        root.condvar().notify_all();
        Ok(())
    }

    /// Instantaneous tempo in BPM
    pub fn tempo(&self) -> f64 {
        let beats = self.beats();
        self.tempo_curve_guard().tempo_at(beats)
    }

    /// Jump to `tempo` at the current beat, discarding any scheduled changes
    pub fn set_tempo(&self, tempo: f64) -> Result<()> {
        self.edit_tempo(|curve, beats| curve.set_tempo_at(beats, tempo))?;
        debug!(clock = %self.name(), tempo, "Tempo set");
        Ok(())
    }

    /// Ramp to `target` over the next `duration` beats
    pub fn set_tempo_target(&self, target: f64, duration: f64, shape: CurveShape) -> Result<()> {
        self.edit_tempo(|curve, beats| curve.ramp_to(beats, target, duration, shape))?;
        debug!(clock = %self.name(), target, duration, ?shape, "Tempo ramp scheduled");
        Ok(())
    }

    /// Replace the whole tempo curve
    pub fn set_tempo_curve(&self, curve: TempoCurve) -> Result<()> {
        self.edit_tempo(|current, _| {
            *current = curve;
            Ok(())
        })
    }

    /// Snapshot of the tempo curve
    pub fn tempo_curve(&self) -> TempoCurve {
        self.inner.tempo.read().clone()
    }

    pub(crate) fn tempo_curve_guard(&self) -> RwLockReadGuard<'_, TempoCurve> {
        self.inner.tempo.read()
    }

    fn edit_tempo(&self, edit: impl FnOnce(&mut TempoCurve, f64) -> Result<()>) -> Result<()> {
        let mut state = self.scheduler().state.lock();
        if self.is_pacing_root() {
            self.refresh_sleeping(&mut state);
        }
        let beats = self.slot(&state)?.beats;
        edit(&mut self.inner.tempo.write(), beats)?;
        // a sleeping root recomputes its deadline from the new curve
        self.condvar().notify_all();
        Ok(())
    }

    /// Beats of this clock per wall second at its current position
    pub fn absolute_rate(&self) -> f64 {
        let state = self.scheduler().state.lock();
        self.absolute_rate_locked(&state)
    }

    pub(crate) fn absolute_rate_locked(&self, state: &TreeState) -> f64 {
        let mut rate = 1.0;
        let mut current = self.clone();
        loop {
            let beats = current.slot(state).map(|s| s.beats).unwrap_or(0.0);
            rate *= current.tempo_curve_guard().rate_at(beats);
            if current.is_pacing_root() {
                return rate / current.scheduler().unit_seconds();
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => return rate,
            }
        }
    }

    /// Terminate this clock and cascade to its synchronized descendants
    ///
    /// Their pending waits resolve with `ClockTerminated`. Unsynchronized
    /// descendants keep running until their owner tears them down.
    pub fn terminate(&self) {
        {
            let mut state = self.scheduler().state.lock();
            self.terminate_locked(&mut state);
        }
        if self.inner.pacing == Pacing::Unsynchronized {
            if let Some(parent) = self.parent() {
                let mut state = parent.scheduler().state.lock();
                if let Some(slot) = state.slots.get_mut(&parent.id()) {
                    slot.children.retain(|c| c.id() != self.id());
                }
            }
        }
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub(crate) fn scheduler_arc(&self) -> Arc<Scheduler> {
        self.inner.scheduler.clone()
    }

    pub(crate) fn condvar(&self) -> &Condvar {
        &self.inner.cond
    }

    pub(crate) fn is_pacing_root(&self) -> bool {
        self.inner.pacing != Pacing::Synchronized
    }

    pub(crate) fn shares_scheduler(&self, other: &Clock) -> bool {
        Arc::ptr_eq(&self.inner.scheduler, &other.inner.scheduler)
    }

    pub(crate) fn retire(&self, beats: f64, time: f64) {
        let _ = self.inner.retired.set(Position { beats, time });
    }

    pub(crate) fn terminated_error(&self) -> ClockError {
        ClockError::ClockTerminated(self.inner.name.clone())
    }

    pub(crate) fn downgrade(&self) -> Weak<ClockInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<ClockInner>) -> Option<Clock> {
        weak.upgrade().map(|inner| Clock { inner })
    }
}

impl PartialEq for Clock {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Clock {}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("pacing", &self.inner.pacing)
            .finish()
    }
}

/// Scoped hold on a roused clock tree
#[must_use = "dropping the guard releases the hold immediately"]
pub struct HoldGuard {
    clock: Clock,
    holder: ThreadId,
    released: bool,
}

impl HoldGuard {
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Release the hold now, reporting any bookkeeping error
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.clock.release_hold(self.holder)
    }
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.clock.release_hold(self.holder);
        }
    }
}
