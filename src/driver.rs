//! Driver for the scheduling core: runs every pass over one function.
use serde_json::json;
use shang_ir as ir;
use shang_opt::analysis::LiveRanges;
use shang_opt::passes::{
    Binder, Binding, BlockSchedule, BlockStates, ChainBreaker, ChainReport,
    EmittedSchedule, ScheduleEmitter, Scheduler,
};
use shang_opt::traversal::{ConstructPass, Named};
use shang_utils::{ErrorKind, ShangResult};

/// Everything produced for one function.
#[derive(Debug, Clone)]
pub struct Synthesized {
    /// Placement of every block, in block order.
    pub schedule: Vec<BlockSchedule>,
    /// Micro-states of every block, in block order.
    pub states: Vec<BlockStates>,
    pub live_ranges: LiveRanges,
    pub binding: Binding,
    /// Loop-boundary merges of pipelined blocks.
    pub phis: Vec<ir::NodeIdx>,
    pub chains: ChainReport,
}

impl Synthesized {
    /// Number of slots of the whole function.
    pub fn total_slots(&self) -> u32 {
        self.schedule.last().map_or(0, BlockSchedule::end)
    }

    /// Summary of the schedule, the inserted links and the sharing.
    pub fn summary(&self) -> serde_json::Value {
        let blocks: Vec<_> = self
            .schedule
            .iter()
            .map(|bs| {
                json!({
                    "start": bs.start,
                    "total": bs.total,
                    "ii": bs.pipelined.then_some(bs.ii),
                })
            })
            .collect();
        json!({
            "blocks": blocks,
            "slots": self.total_slots(),
            "phis": self.phis.len(),
            "copies": self.chains.copies,
            "read-results": self.chains.read_results,
            "disables": self.chains.disables,
            "sharing": self.binding.share_report(),
        })
    }
}

/// Name the pass an error came from.
fn in_pass<P: Named, T>(res: ShangResult<T>) -> ShangResult<T> {
    res.map_err(|e| e.with_post_msg(Some(format!("in pass `{}'", P::name()))))
}

/// Schedule, emit, break chains and bind. Fails on the first error; the
/// graph may then hold partial schedules and must not be reused.
pub fn synthesize(
    graph: &mut ir::SchedGraph,
    ctx: &ir::Context,
) -> ShangResult<Synthesized> {
    ctx.config.validate()?;
    let schedule =
        in_pass::<Scheduler, _>(<Scheduler as ConstructPass>::from(ctx)?.schedule(graph))?;
    let mut emitted = in_pass::<ScheduleEmitter, _>(
        <ScheduleEmitter as ConstructPass>::from(ctx)?.emit(graph, &schedule),
    )?;
    let chains = in_pass::<ChainBreaker, _>(
        <ChainBreaker as ConstructPass>::from(ctx)?.run(graph, &schedule, &mut emitted),
    )?;
    let binding = in_pass::<Binder, _>(
        <Binder as ConstructPass>::from(ctx)?.bind(graph, &schedule, &emitted),
    )?;

    let EmittedSchedule {
        blocks, live, phis, ..
    } = emitted;
    let synthesized = Synthesized {
        schedule: schedule.blocks.values().cloned().collect(),
        states: blocks.values().cloned().collect(),
        live_ranges: live,
        binding,
        phis,
        chains,
    };
    log::info!(
        target: "synthesize",
        "{} blocks in {} slots",
        synthesized.schedule.len(),
        synthesized.total_slots()
    );
    Ok(synthesized)
}

/// Like [synthesize], but a pipelined block whose interval cannot be met
/// is retried with the interval the failure suggests, up to `attempts`
/// times.
pub fn synthesize_relaxed(
    graph: &mut ir::SchedGraph,
    ctx: &ir::Context,
    attempts: u32,
) -> ShangResult<Synthesized> {
    let mut left = attempts;
    loop {
        let err = match synthesize(graph, ctx) {
            Err(err) if left > 0 => err,
            res => return res,
        };
        let retry = match (err.retry_ii(), err.kind()) {
            (Some(ii), ErrorKind::InfeasibleII { block, .. }) => graph
                .blocks()
                .find(|(_, bb)| &bb.name == block)
                .map(|(idx, _)| (idx, ii)),
            _ => None,
        };
        let Some((block, ii)) = retry else {
            return Err(err);
        };
        log::info!(
            target: "synthesize",
            "retrying `{}' with II={ii}",
            graph.block(block).name
        );
        graph.set_pipeline(block, ii)?;
        left -= 1;
    }
}
