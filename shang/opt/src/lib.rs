//! Scheduling and binding passes over a [shang_ir::SchedGraph].
//!
//! [passes::Scheduler] assigns every node a slot, using force-directed
//! placement and modulo scheduling for pipelined blocks.
//! [passes::ScheduleEmitter] turns the slots into micro-states and value
//! links, [passes::ChainBreaker] inserts the copies that keep every read
//! within one initiation interval of its link, and [passes::Binder] shares
//! registers and functional units among ranges that never overlap.
//!
//! Every pass is built from an [shang_ir::Context] through
//! [traversal::ConstructPass], which reads its options from
//! `Context::extra_opts`.
pub mod analysis;
pub mod passes;
pub mod traversal;
