//! Analyses used by the scheduling and binding passes.
mod compat_graph;
mod distribution;
mod live_ranges;
mod recurrence;
mod reservation;
mod time_frame;

pub use compat_graph::{
    CompatGraph, Folded, LiveRange, MergeCost, PROHIBITIVE, RangeIdx,
    RangeOwner, Source,
};
pub use distribution::DistributionGraph;
pub use live_ranges::{
    DefCategory, DefIdx, LiveRanges, ReadIdx, ReadSite, Resolved, ValueDef,
};
pub use recurrence::Recurrences;
pub use reservation::{Demand, ReservationTable, ResourceKey};
pub use time_frame::{BlockInfo, Frame, TimeFrames};
