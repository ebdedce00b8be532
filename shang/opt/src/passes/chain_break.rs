use super::emit::{EmittedSchedule, MicroOp};
use super::schedule::{BlockSchedule, Schedule};
use crate::analysis::{
    DefCategory, DefIdx, LiveRanges, ReadIdx, ReadSite, Resolved, ValueDef,
};
use crate::traversal::{ConstructPass, Named, ParseVal, PassOpt};
use serde::Serialize;
use shang_ir::{self as ir, NodeIdx, NodeKind, Opcode, Operation, ValueId};
use shang_utils::{Error, ShangResult};
use std::collections::BTreeMap;

/// How far the chain of a value has been pushed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ChainState {
    /// Only the original link, never read combinationally.
    Fresh,
    /// Read by datapath logic without an intervening register.
    Chained,
    /// A copy restarted the chain.
    Broken,
}

impl ChainState {
    fn advance(self, next: ChainState) -> ChainState {
        std::cmp::max(self, next)
    }
}

/// What one run of the chain breaker did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub copies: usize,
    pub read_results: usize,
    pub disables: usize,
    pub states: BTreeMap<ValueId, ChainState>,
}

/// Inserts copies so that no value is read further than one initiation
/// interval away from the link serving it, and moves the outputs of
/// pre-bound units into general registers.
pub struct ChainBreaker {
    config: ir::FuConfig,
    verify: bool,
}

impl Named for ChainBreaker {
    fn name() -> &'static str {
        "chain-break"
    }

    fn description() -> &'static str {
        "bound the length of value chains by inserting copies"
    }

    fn opts() -> Vec<PassOpt> {
        vec![PassOpt::new(
            "verify",
            "check every read after breaking chains",
            ParseVal::Bool(true),
            PassOpt::parse_bool,
        )]
    }
}

impl ConstructPass for ChainBreaker {
    fn from(ctx: &ir::Context) -> ShangResult<Self> {
        let opts = Self::get_opts(ctx);
        Ok(ChainBreaker {
            config: ctx.config.clone(),
            verify: opts["verify"].bool(),
        })
    }
}

/// Whether the link `def` may serve `site` without a copy in between.
fn covered(bs: &BlockSchedule, def: &ValueDef, site: &ReadSite) -> bool {
    if site.slot >= bs.boundary_after(def.chain_start) + bs.ii {
        return false;
    }
    site.control || site.slot.saturating_sub(def.chain_start) <= bs.ii
}

/// The latest link of the value read by `site` visible at its slot,
/// ignoring the link the reader defines itself.
fn serving(live: &LiveRanges, site: &ReadSite) -> Option<DefIdx> {
    live.chain(site.block, site.value)
        .iter()
        .rev()
        .copied()
        .find(|d| {
            let def = live.def(*d);
            def.chain_start <= site.slot && def.node != site.reader
        })
}

impl ChainBreaker {
    pub fn run(
        &self,
        graph: &mut ir::SchedGraph,
        schedule: &Schedule,
        emitted: &mut EmittedSchedule,
    ) -> ShangResult<ChainReport> {
        let mut report = ChainReport::default();
        self.read_results(graph, schedule, emitted, &mut report)?;
        self.reresolve(graph, emitted)?;
        for bs in schedule.blocks.values() {
            self.break_block(graph, bs, emitted, &mut report)?;
        }
        if self.verify {
            self.check(graph, schedule, &emitted.live)?;
        }
        log::info!(
            target: Self::name(),
            "{} copies, {} read-results, {} disables",
            report.copies,
            report.read_results,
            report.disables
        );
        Ok(report)
    }

    /// Move the result of every unit that holds its output for one cycle
    /// only into a register, and release exclusive units once done.
    fn read_results(
        &self,
        graph: &mut ir::SchedGraph,
        schedule: &Schedule,
        emitted: &mut EmittedSchedule,
        report: &mut ChainReport,
    ) -> ShangResult<()> {
        let nodes: Vec<NodeIdx> = graph
            .nodes()
            .filter(|(_, n)| {
                !n.opcode().is_synthesized()
                    && (n.op.prebound.is_some()
                        || (n.latency > 0
                            && self.config.desc(n.fu_kind()).write_until_finish))
            })
            .map(|(idx, _)| idx)
            .collect();

        for n in nodes {
            let Some(slot) = schedule.slot_of(graph, n) else {
                return Err(Error::invariant(format!("{n} was never scheduled")));
            };
            let node = graph.node(n);
            let bs = schedule.block(node.block).clone();
            let done = slot + node.latency;
            let (result, prebound) = (node.result(), node.op.prebound);

            if let Some(value) = result {
                let origin = emitted.live.origin(value).ok_or_else(|| {
                    Error::invariant(format!("{value} has no original link"))
                })?;
                let has_rr = emitted.live.chain(bs.block, value).iter().any(|d| {
                    emitted.live.def(*d).category == DefCategory::ReadResult
                });
                if !has_rr {
                    emitted.insert_move(
                        graph,
                        &bs,
                        value,
                        origin,
                        done,
                        DefCategory::ReadResult,
                    );
                    emitted.live.def_mut(origin).chained_with_fu = true;
                    report.read_results += 1;
                    log::debug!(
                        target: Self::name(),
                        "{value}: read result of {n} at slot {done}"
                    );
                }
            }

            let Some(fu) = prebound else { continue };
            if !self.config.desc(fu.kind).exclusive
                || emitted.releases.contains_key(&n)
            {
                continue;
            }
            let release = done + 1;
            let disable = graph.add_synthesized(
                bs.block,
                Operation::new(Opcode::Disable, [], 0).bound_to(fu),
                0,
                release - bs.start,
            );
            emitted.push(
                &bs,
                MicroOp {
                    node: disable,
                    opcode: Opcode::Disable,
                    slot: release,
                    dest: None,
                    operands: Vec::new(),
                    guard: None,
                },
                NodeKind::Control,
            );
            emitted.releases.insert(n, disable);
            report.disables += 1;
            log::debug!(
                target: Self::name(),
                "{fu} released by {disable} at slot {release}"
            );
        }
        Ok(())
    }

    /// Serve every read from the latest link visible to it.
    fn reresolve(
        &self,
        graph: &ir::SchedGraph,
        emitted: &mut EmittedSchedule,
    ) -> ShangResult<()> {
        let live = &mut emitted.live;
        let reads: Vec<(ReadIdx, ReadSite)> =
            live.reads().map(|(i, r)| (i, r.clone())).collect();
        for (idx, site) in reads {
            let Some(def_node) = graph.value_def(site.value) else {
                return Err(Error::invariant(format!(
                    "{} reads {}, which has no definition",
                    site.reader, site.value
                )));
            };
            let def_block = graph.node(def_node).block;
            let def = if def_block == site.block {
                serving(live, &site)
            } else {
                live.last(def_block, site.value)
            };
            if let Some(def) = def {
                live.retarget(idx, def);
            }
        }
        Ok(())
    }

    fn break_block(
        &self,
        graph: &mut ir::SchedGraph,
        bs: &BlockSchedule,
        emitted: &mut EmittedSchedule,
        report: &mut ChainReport,
    ) -> ShangResult<()> {
        let values: Vec<ValueId> = graph
            .block(bs.block)
            .nodes
            .iter()
            .filter(|n| !graph.node(**n).opcode().is_synthesized())
            .filter_map(|n| graph.node(*n).result())
            .collect();

        for value in values {
            let mut state = report
                .states
                .get(&value)
                .copied()
                .unwrap_or(ChainState::Fresh);
            let mut reads: Vec<(u32, ReadIdx)> = emitted
                .live
                .reads()
                .filter(|(_, r)| r.value == value && r.block == bs.block)
                .filter(|(_, r)| !graph.node(r.reader).opcode().is_synthesized())
                .map(|(i, r)| (r.slot, i))
                .collect();
            reads.sort();

            for (_, read) in reads {
                let site = emitted.live.read(read).clone();
                if let Some(def) = serving(&emitted.live, &site) {
                    emitted.live.retarget(read, def);
                }
                loop {
                    let site = emitted.live.read(read).clone();
                    let def = emitted.live.def(site.def).clone();
                    if covered(bs, &def, &site) {
                        break;
                    }
                    let slot = std::cmp::min(def.chain_start + bs.ii, site.slot);
                    let copy = match emitted.live.find(
                        bs.block,
                        value,
                        slot,
                        DefCategory::Copy,
                    ) {
                        Some(copy) => copy,
                        None => {
                            let source = emitted
                                .live
                                .latest_at(bs.block, value, slot)
                                .unwrap_or(site.def);
                            let copy = emitted.insert_move(
                                graph,
                                bs,
                                value,
                                source,
                                slot,
                                DefCategory::Copy,
                            );
                            report.copies += 1;
                            log::debug!(
                                target: Self::name(),
                                "{value}: copy at slot {slot} for {}",
                                site.reader
                            );
                            copy
                        }
                    };
                    emitted.live.retarget(read, copy);
                    state = state.advance(ChainState::Broken);
                }
                if !site.control
                    && matches!(emitted.live.resolve(read), Resolved::Wire(_))
                {
                    state = state.advance(ChainState::Chained);
                }
            }
            report.states.insert(value, state);
        }
        Ok(())
    }

    /// Every read must be served by a link it can legally observe.
    fn check(
        &self,
        graph: &ir::SchedGraph,
        schedule: &Schedule,
        live: &LiveRanges,
    ) -> ShangResult<()> {
        for (idx, site) in live.reads() {
            let def = live.def(site.def);
            let fail = |what: &str| {
                Err(Error::invariant(format!(
                    "read {idx:?} of {} by {} at slot {}: {what}",
                    site.value, site.reader, site.slot
                )))
            };
            if def.value != site.value {
                return fail("served by a link of another value");
            }
            if def.block != site.block {
                if !def.registered {
                    return fail("crosses blocks on a wire");
                }
                if !graph.block_reaches(def.block, site.block) {
                    return fail("the defining block does not reach the reader");
                }
                continue;
            }
            let bs = schedule.block(site.block);
            if def.chain_start > site.slot {
                return fail("observes a link of a later iteration");
            }
            if !def.readable_at(site.slot) {
                return fail("the link is no longer driven");
            }
            if !covered(bs, def, site) {
                return fail("the chain was not broken");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::{ScheduleEmitter, Scheduler};
    use ir::{FuInstance, FuKind, Operand, SchedGraph};

    fn pipeline(
        g: &mut SchedGraph,
    ) -> ShangResult<(Schedule, EmittedSchedule, ChainReport)> {
        let ctx = ir::Context::default();
        let schedule = <Scheduler as ConstructPass>::from(&ctx)?.schedule(g)?;
        let mut emitted = <ScheduleEmitter as ConstructPass>::from(&ctx)?.emit(g, &schedule)?;
        let report = <ChainBreaker as ConstructPass>::from(&ctx)?.run(g, &schedule, &mut emitted)?;
        Ok((schedule, emitted, report))
    }

    fn not(v: ValueId) -> Operation {
        Operation::new(Opcode::Not, [Operand::value(v, 8)], 8)
    }

    #[test]
    fn chain_states_advance() {
        assert_eq!(
            ChainState::Chained.advance(ChainState::Fresh),
            ChainState::Chained
        );
        assert_eq!(
            ChainState::Chained.advance(ChainState::Broken),
            ChainState::Broken
        );
    }

    #[test]
    fn straight_line_blocks_need_no_copies() {
        let mut g = SchedGraph::new();
        let b = g.add_block("entry", None).unwrap();
        let x = g.add_argument(b, 8).unwrap();
        let a = g.add_node(b, not(x), 0, &[]).unwrap();
        let v = g.result_of(a).unwrap();
        let slow = g.add_node(b, not(v), 3, &[]).unwrap();
        let s = g.result_of(slow).unwrap();
        let both = |op, lhs, rhs| {
            Operation::new(op, [Operand::value(lhs, 8), Operand::value(rhs, 8)], 8)
        };
        // read combinationally right away, then from its register
        g.add_node(b, both(Opcode::Xor, v, x), 0, &[]).unwrap();
        g.add_node(b, both(Opcode::Or, v, s), 0, &[]).unwrap();

        let (_, _, report) = pipeline(&mut g).unwrap();
        assert_eq!(report.copies, 0);
        assert_eq!(report.states[&v], ChainState::Chained);
    }

    #[test]
    fn long_control_reads_get_one_copy() {
        let mut g = SchedGraph::new();
        let b = g.add_block("loop", Some(2)).unwrap();
        let x = g.add_argument(b, 8).unwrap();
        let a = g.add_node(b, not(x), 0, &[]).unwrap();
        let v = g.result_of(a).unwrap();
        let slow = g
            .add_node(
                b,
                Operation::new(Opcode::Or, [Operand::value(x, 8), Operand::imm(1, 8)], 8),
                5,
                &[],
            )
            .unwrap();
        let s = g.result_of(slow).unwrap();
        let reader = g
            .add_node(
                b,
                Operation::new(Opcode::Xor, [Operand::value(v, 8), Operand::value(s, 8)], 8),
                1,
                &[],
            )
            .unwrap();

        let ctx = ir::Context::default();
        let schedule = <Scheduler as ConstructPass>::from(&ctx).unwrap().schedule(&mut g).unwrap();
        assert_eq!(g.step(a), Some(0));
        assert_eq!(g.step(reader), Some(5));
        let mut emitted =
            <ScheduleEmitter as ConstructPass>::from(&ctx).unwrap().emit(&mut g, &schedule).unwrap();
        let breaker = <ChainBreaker as ConstructPass>::from(&ctx).unwrap();
        let report = breaker.run(&mut g, &schedule, &mut emitted).unwrap();
        assert_eq!(report.copies, 1);
        assert_eq!(report.states[&v], ChainState::Broken);

        let live = &emitted.live;
        let read = live.reads().find(|(_, r)| r.reader == reader && r.value == v);
        let copy = live.def(read.unwrap().1.def);
        assert_eq!(copy.category, DefCategory::Copy);
        assert_eq!(copy.chain_start, 2);

        let again = breaker.run(&mut g, &schedule, &mut emitted).unwrap();
        assert_eq!(again.copies, 0);
    }

    #[test]
    fn prebound_units_are_read_and_released() {
        let mut g = SchedGraph::new();
        let b = g.add_block("entry", None).unwrap();
        let addr = g.add_argument(b, 32).unwrap();
        let bus = FuInstance::new(FuKind::MemoryBus, 0);
        let load = g
            .add_node(
                b,
                Operation::new(Opcode::Load, [Operand::value(addr, 32)], 32)
                    .bound_to(bus),
                2,
                &[],
            )
            .unwrap();
        let v = g.result_of(load).unwrap();
        let use_v = g
            .add_node(b, Operation::new(Opcode::Not, [Operand::value(v, 32)], 32), 1, &[])
            .unwrap();

        let ctx = ir::Context::default();
        let schedule = <Scheduler as ConstructPass>::from(&ctx).unwrap().schedule(&mut g).unwrap();
        let mut emitted =
            <ScheduleEmitter as ConstructPass>::from(&ctx).unwrap().emit(&mut g, &schedule).unwrap();
        let breaker = <ChainBreaker as ConstructPass>::from(&ctx).unwrap();
        let report = breaker.run(&mut g, &schedule, &mut emitted).unwrap();
        assert_eq!(report.read_results, 1);
        assert_eq!(report.disables, 1);

        let live = &emitted.live;
        let origin = live.origin(v).unwrap();
        assert!(live.def(origin).chained_with_fu);
        let read = live
            .reads()
            .find(|(_, r)| r.reader == use_v)
            .map(|(_, r)| r.def)
            .unwrap();
        assert_eq!(live.def(read).category, DefCategory::ReadResult);

        let release = emitted.releases[&load];
        assert_eq!(g.node(release).op.prebound, Some(bus));
        assert_eq!(
            g.step(release),
            Some(g.step(load).unwrap() + 2 + 1)
        );

        // nothing left to do the second time around
        let again = breaker.run(&mut g, &schedule, &mut emitted).unwrap();
        assert_eq!((again.read_results, again.disables, again.copies), (0, 0, 0));
    }

    #[test]
    fn verification_rejects_stale_reads() {
        let mut g = SchedGraph::new();
        let b = g.add_block("entry", None).unwrap();
        let x = g.add_argument(b, 8).unwrap();
        let a = g.add_node(b, not(x), 0, &[]).unwrap();
        let v = g.result_of(a).unwrap();
        let late = g.add_node(b, not(v), 2, &[]).unwrap();
        let l = g.result_of(late).unwrap();
        g.add_node(b, not(l), 0, &[]).unwrap();
        let (schedule, mut emitted, _) = pipeline(&mut g).unwrap();
        let breaker = <ChainBreaker as ConstructPass>::from(&ir::Context::default()).unwrap();
        assert!(breaker.check(&g, &schedule, &emitted.live).is_ok());

        // a read far past the block, as if from a later iteration
        let live = &mut emitted.live;
        let (_, site) = live.reads().find(|(_, r)| r.value == v).unwrap();
        let mut stale = site.clone();
        stale.slot += 2 * schedule.block(b).total;
        live.add_read(stale);
        let err = breaker.check(&g, &schedule, live).unwrap_err();
        assert!(matches!(err.kind(), shang_utils::ErrorKind::Invariant(_)));
    }
}
