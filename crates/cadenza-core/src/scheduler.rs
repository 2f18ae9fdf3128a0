//! Cross-thread coordination for a tree of clocks
//!
//! Every pacing root (a master clock or an unsynchronized fork) owns one
//! `Scheduler`. A single mutex guards the mutable state of every clock paced by
//! that root, and each clock parks on its own condvar paired with that mutex.
//!
//! A synchronized clock never advances on its own: it files a wake request in
//! its parent's queue and parks. The parent serves requests from inside its own
//! wait, in `(position, sequence)` order, and blocks until the released child
//! parks again. Only the pacing root sleeps on wall time, so at most one thread
//! of a synchronized tree moves time forward at any moment.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{OnceLock, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::clock::{Clock, ClockId, ClockInner};
use crate::context::ClockScope;
use crate::error::{ClockError, Result};

/// A closure queued onto a pacing root's inbox
pub(crate) type Message = Box<dyn FnOnce(&Clock) + Send + 'static>;

pub(crate) struct Scheduler {
    pub(crate) state: Mutex<TreeState>,
    root: OnceLock<Weak<ClockInner>>,
    epoch: Instant,
    /// Absolute session time at `epoch`
    epoch_time: f64,
    /// Wall seconds per unit of the root's tempo curve
    unit_seconds: f64,
    inbox_tx: Sender<Message>,
    inbox_rx: Receiver<Message>,
}

impl Scheduler {
    pub(crate) fn new(epoch_time: f64, unit_seconds: f64) -> Self {
        let (inbox_tx, inbox_rx) = unbounded();
        Self {
            state: Mutex::new(TreeState::default()),
            root: OnceLock::new(),
            epoch: Instant::now(),
            epoch_time,
            unit_seconds,
            inbox_tx,
            inbox_rx,
        }
    }

    pub(crate) fn set_root(&self, root: &Clock) {
        let _ = self.root.set(root.downgrade());
    }

    pub(crate) fn root(&self) -> Option<Clock> {
        self.root.get().and_then(Clock::upgrade)
    }

    pub(crate) fn unit_seconds(&self) -> f64 {
        self.unit_seconds
    }

    /// Absolute session time now, as seen by this root's wall clock
    fn wall_time(&self) -> f64 {
        self.epoch_time + self.epoch.elapsed().as_secs_f64()
    }

    fn instant_at(&self, time: f64) -> Option<Instant> {
        let offset = Duration::try_from_secs_f64((time - self.epoch_time).max(0.0)).ok()?;
        self.epoch.checked_add(offset)
    }

    pub(crate) fn post(&self, message: Message) {
        // the receiver lives as long as the scheduler, so this cannot fail
        let _ = self.inbox_tx.send(message);
    }
}

#[derive(Default)]
pub(crate) struct TreeState {
    pub(crate) slots: HashMap<ClockId, Slot>,
    pub(crate) hold_depth: usize,
    /// Outstanding holds per holding thread
    holders: HashMap<ThreadId, usize>,
    next_seq: u64,
}

impl TreeState {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub(crate) fn hold(&mut self, thread: ThreadId) {
        self.hold_depth += 1;
        *self.holders.entry(thread).or_default() += 1;
    }

    /// Undo one hold, `thread`'s own if it has any; false if nothing is held
    pub(crate) fn release_hold(&mut self, thread: ThreadId) -> bool {
        let holder = if self.holders.contains_key(&thread) {
            thread
        } else {
            match self.holders.keys().next() {
                Some(other) => *other,
                None => return false,
            }
        };
        if let Some(count) = self.holders.get_mut(&holder) {
            *count -= 1;
            if *count == 0 {
                self.holders.remove(&holder);
            }
        }
        self.hold_depth -= 1;
        true
    }

    pub(crate) fn held_by(&self, thread: ThreadId) -> usize {
        self.holders.get(&thread).copied().unwrap_or(0)
    }

    /// Holds that pin the tree against `thread`
    fn held_by_others(&self, thread: ThreadId) -> usize {
        self.hold_depth - self.held_by(thread)
    }

    /// File a wake request in `parent`'s queue
    pub(crate) fn enqueue(&mut self, parent: ClockId, at: f64, target: f64, clock: Clock) -> bool {
        let seq = self.next_seq();
        let Some(slot) = self.slots.get_mut(&parent) else {
            return false;
        };
        slot.queue.push(WakeRequest { at, seq, target, clock });
        true
    }
}

/// Mutable per-clock state, guarded by the tree mutex
pub(crate) struct Slot {
    pub(crate) beats: f64,
    pub(crate) time: f64,
    /// Parent beat position matching `beats`
    pub(crate) anchor: f64,
    pub(crate) phase: Phase,
    pub(crate) waiting: bool,
    pub(crate) children: Vec<Clock>,
    queue: BinaryHeap<WakeRequest>,
}

impl Slot {
    pub(crate) fn new(time: f64, anchor: f64, phase: Phase) -> Self {
        Self {
            beats: 0.0,
            time,
            anchor,
            phase,
            waiting: false,
            children: Vec::new(),
            queue: BinaryHeap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Phase {
    Running,
    /// Queued in the parent, waiting to be released
    Parked,
    /// Pacing root blocked on wall time until `target`
    Sleeping { target: f64 },
}

/// A parked child's request to resume once its parent reaches `at`
struct WakeRequest {
    /// Parent beat position
    at: f64,
    seq: u64,
    /// Child beat position after resuming
    target: f64,
    clock: Clock,
}

impl PartialEq for WakeRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for WakeRequest {}

impl PartialOrd for WakeRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WakeRequest {
    // reversed: BinaryHeap pops the earliest position, then the earliest wait call
    fn cmp(&self, other: &Self) -> Ordering {
        other.at.total_cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}

/// What a wait is trying to reach
#[derive(Debug, Clone, Copy)]
pub(crate) enum WaitGoal {
    Beats(f64),
    Forever,
    ChildrenDone,
}

type Guard<'a> = MutexGuard<'a, TreeState>;

impl Clock {
    pub(crate) fn slot<'a>(&self, state: &'a TreeState) -> Result<&'a Slot> {
        state.slots.get(&self.id()).ok_or_else(|| self.terminated_error())
    }

    pub(crate) fn slot_mut<'a>(&self, state: &'a mut TreeState) -> Result<&'a mut Slot> {
        state.slots.get_mut(&self.id()).ok_or_else(|| self.terminated_error())
    }

    pub(crate) fn run_wait(&self, goal: WaitGoal) -> Result<()> {
        let mut state = self.scheduler().state.lock();
        if !self.is_pacing_root() && state.held_by(thread::current().id()) > 0 {
            // the root cannot release us while this thread pins it
            return Err(ClockError::invalid(format!(
                "clock '{}' cannot wait while this thread holds its tree",
                self.name()
            )));
        }
        {
            let slot = self.slot_mut(&mut state)?;
            if slot.waiting {
                return Err(ClockError::invalid(format!(
                    "clock '{}' is already waiting on another thread",
                    self.name()
                )));
            }
            slot.waiting = true;
        }

        let result = self.wait_loop(&mut state, goal);

        if let Some(slot) = state.slots.get_mut(&self.id()) {
            slot.waiting = false;
            slot.phase = Phase::Running;
        }
        result
    }

    fn wait_loop(&self, state: &mut Guard<'_>, goal: WaitGoal) -> Result<()> {
        let wait_seq = state.next_seq();
        let start = self.slot(state)?.beats;
        let target = match goal {
            WaitGoal::Beats(beats) => start + beats,
            WaitGoal::Forever | WaitGoal::ChildrenDone => f64::INFINITY,
        };
        // requests tied with our own target go first only if filed before this wait
        let eligible = |r: &WakeRequest| r.at < target || (r.at == target && r.seq < wait_seq);

        loop {
            if self.is_pacing_root() {
                self.serve_inbox(state)?;
            }

            let slot = self.slot_mut(state)?;
            let beats = slot.beats;

            let next = slot.queue.peek().filter(|r| eligible(*r)).map(|r| r.at);
            let step = match next {
                Some(at) if at <= beats => {
                    if let Some(request) = slot.queue.pop() {
                        self.release_child(state, request)?;
                    }
                    continue;
                }
                Some(at) => at,
                None => {
                    if beats >= target {
                        return Ok(());
                    }
                    if let WaitGoal::ChildrenDone = goal {
                        if !slot.children.iter().any(|c| c.shares_scheduler(self)) {
                            return Ok(());
                        }
                    }
                    target
                }
            };

            if self.is_pacing_root() {
                self.sleep_until(state, step)?;
            } else {
                self.park_in_parent(state, step)?;
            }
        }
    }

    /// Resume a parked child and block until it parks again or terminates
    fn release_child(&self, state: &mut Guard<'_>, request: WakeRequest) -> Result<()> {
        let (beats, time) = {
            let slot = self.slot(state)?;
            (slot.beats, slot.time)
        };
        let child = request.clock;
        let Some(child_slot) = state.slots.get_mut(&child.id()) else {
            return Ok(());
        };
        if child_slot.phase != Phase::Parked {
            return Ok(());
        }

        child_slot.beats = child_slot.beats.max(request.target);
        child_slot.anchor = beats;
        child_slot.time = time;
        child_slot.phase = Phase::Running;
        child.condvar().notify_all();
        debug!(clock = %self.name(), child = %child.name(), beat = beats, "Released child");

        loop {
            let running = matches!(
                state.slots.get(&child.id()).map(|s| s.phase),
                Some(Phase::Running)
            );
            if !running {
                return Ok(());
            }
            self.slot(state)?;
            self.condvar().wait(state);
        }
    }

    /// Queue this synchronized clock in its parent until it may stand at `target`
    fn park_in_parent(&self, state: &mut Guard<'_>, target: f64) -> Result<()> {
        let parent = self.parent().ok_or_else(|| self.terminated_error())?;
        let at = {
            let slot = self.slot(state)?;
            slot.anchor + self.tempo_curve_guard().span(slot.beats, target)
        };
        if !state.enqueue(parent.id(), at, target, self.clone()) {
            return Err(parent.terminated_error());
        }
        self.slot_mut(state)?.phase = Phase::Parked;
        parent.condvar().notify_all();
        trace!(clock = %self.name(), parent_beat = at, "Parked");

        while self.slot(state)?.phase == Phase::Parked {
            self.condvar().wait(state);
        }
        Ok(())
    }

    /// Block a pacing root until it reaches `target` or something needs it sooner
    fn sleep_until(&self, state: &mut Guard<'_>, target: f64) -> Result<()> {
        let scheduler = self.scheduler();
        let me = thread::current().id();
        loop {
            let interrupted = state.held_by_others(me) > 0 || !scheduler.inbox_rx.is_empty();
            let slot = self.slot_mut(state)?;
            let sooner = slot.queue.peek().is_some_and(|r| r.at < target);
            if interrupted || sooner {
                slot.phase = Phase::Running;
                return Ok(());
            }

            let deadline = slot.time
                + self.tempo_curve_guard().span(slot.beats, target) * scheduler.unit_seconds;
            if deadline <= scheduler.wall_time() {
                slot.beats = target;
                slot.time = deadline;
                slot.phase = Phase::Running;
                return Ok(());
            }

            slot.phase = Phase::Sleeping { target };
            match scheduler.instant_at(deadline) {
                Some(instant) => {
                    self.condvar().wait_until(state, instant);
                }
                None => self.condvar().wait(state),
            }
        }
    }

    /// Bring a sleeping pacing root's position up to the wall clock
    pub(crate) fn refresh_sleeping(&self, state: &mut TreeState) {
        let scheduler = self.scheduler();
        let Some(slot) = state.slots.get_mut(&self.id()) else {
            return;
        };
        let Phase::Sleeping { target } = slot.phase else {
            return;
        };

        let now = scheduler.wall_time();
        let elapsed = (now - slot.time) / scheduler.unit_seconds;
        if elapsed <= 0.0 {
            return;
        }
        let curve = self.tempo_curve_guard();
        let reached = curve.beats_after(slot.beats, elapsed).min(target);
        if reached >= target {
            slot.time += curve.span(slot.beats, target) * scheduler.unit_seconds;
        } else {
            slot.time = now;
        }
        slot.beats = reached;
    }

    /// Honour holds and run dispatched messages at a root's scheduling point
    ///
    /// Holds taken by the waiting thread itself do not block it.
    fn serve_inbox(&self, state: &mut Guard<'_>) -> Result<()> {
        let scheduler = self.scheduler();
        let me = thread::current().id();
        loop {
            self.slot(state)?;
            if state.held_by_others(me) > 0 {
                self.condvar().wait(state);
                continue;
            }
            let Ok(message) = scheduler.inbox_rx.try_recv() else {
                return Ok(());
            };
            MutexGuard::unlocked(state, || {
                let _scope = ClockScope::enter(self);
                if panic::catch_unwind(AssertUnwindSafe(|| message(self))).is_err() {
                    warn!(clock = %self.name(), "Dispatched message panicked");
                }
            });
        }
    }

    /// Retire this clock and every synchronized descendant
    pub(crate) fn terminate_locked(&self, state: &mut TreeState) {
        let Some(slot) = state.slots.remove(&self.id()) else {
            return;
        };
        self.retire(slot.beats, slot.time);

        for child in &slot.children {
            if child.shares_scheduler(self) {
                child.terminate_locked(state);
            }
        }

        if let Some(parent) = self.parent().filter(|p| p.shares_scheduler(self)) {
            if let Some(parent_slot) = state.slots.get_mut(&parent.id()) {
                parent_slot.queue.retain(|r| r.clock.id() != self.id());
                parent_slot.children.retain(|c| c.id() != self.id());
            }
            parent.condvar().notify_all();
        }
        self.condvar().notify_all();
        debug!(clock = %self.name(), beat = slot.beats, "Clock terminated");
    }
}
