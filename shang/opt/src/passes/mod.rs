//! Passes run in order by the synthesis driver: scheduling, emission,
//! chain breaking and binding.
mod bind;
mod chain_break;
mod emit;
mod schedule;

pub use bind::{Binder, Binding};
pub use chain_break::{ChainBreaker, ChainReport, ChainState};
pub use emit::{
    BlockStates, EmittedSchedule, MicroOp, MicroOperand, MicroSource,
    MicroState, ScheduleEmitter,
};
pub use schedule::{BlockSchedule, Schedule, Scheduler};
