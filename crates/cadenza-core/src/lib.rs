//! cadenza-core: Hierarchical musical clocks with tempo curves

mod clock;
mod context;
mod error;
mod fork;
mod scheduler;
pub mod tempo;

pub use clock::{Clock, ClockId, ClockStatus, HoldGuard};
pub use context::{current_clock, ClockScope};
pub use error::{ClockError, Result};
pub use fork::{ForkHandle, ForkKind, ForkOptions};
pub use tempo::{CurveShape, TempoCurve, TempoPoint};
