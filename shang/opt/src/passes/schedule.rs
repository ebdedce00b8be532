use crate::analysis::{
    BlockInfo, Demand, DistributionGraph, Frame, ReservationTable, TimeFrames,
};
use crate::traversal::{ConstructPass, Named, ParseVal, PassOpt};
use shang_idx::maps::IndexedMap;
use shang_ir::{self as ir, BlockIdx, NodeIdx, Opcode};
use shang_utils::{Error, ShangResult, ceil_div};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Placement of one basic block in the function-wide slot range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSchedule {
    pub block: BlockIdx,
    /// First slot of the block.
    pub start: u32,
    /// Number of slots. At least `ii` for pipelined blocks.
    pub total: u32,
    /// Initiation interval. Equal to `total` when the block is not
    /// pipelined.
    pub ii: u32,
    pub pipelined: bool,
}

impl BlockSchedule {
    /// One past the last slot of the block.
    pub fn end(&self) -> u32 {
        self.start + self.total
    }

    /// The slot at which the next iteration of a pipelined block starts.
    pub fn loop_op_slot(&self) -> Option<u32> {
        self.pipelined.then(|| self.start + self.ii)
    }

    /// Absolute slot of a block-relative step.
    pub fn slot(&self, step: u32) -> u32 {
        self.start + step
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.start <= slot && slot < self.end()
    }

    /// The first iteration boundary strictly after `slot`.
    pub fn boundary_after(&self, slot: u32) -> u32 {
        let rel = slot.saturating_sub(self.start);
        self.start + (rel / self.ii + 1) * self.ii
    }

    /// The state `slot` is executed in. Slots past the kernel of a
    /// pipelined block alias a slot inside it; other blocks clamp to their
    /// last state.
    pub fn fold(&self, slot: u32) -> u32 {
        let end = self.end();
        if slot < end {
            return slot;
        }
        if !self.pipelined {
            return end - 1;
        }
        let over = u64::from(slot - end + 1);
        slot - ceil_div(over, u64::from(self.ii)) as u32 * self.ii
    }
}

/// Result of scheduling a function.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub blocks: IndexedMap<BlockIdx, BlockSchedule>,
    /// Time frame every node had when it was committed.
    pub frames: HashMap<NodeIdx, Frame>,
}

impl Schedule {
    pub fn block(&self, block: BlockIdx) -> &BlockSchedule {
        &self.blocks[block]
    }

    /// Absolute slot of a committed node.
    pub fn slot_of(&self, graph: &ir::SchedGraph, node: NodeIdx) -> Option<u32> {
        let n = graph.node(node);
        n.step().map(|s| self.blocks[n.block].slot(s))
    }

    /// Number of slots of the whole function.
    pub fn total_slots(&self) -> u32 {
        self.blocks.values().map(BlockSchedule::end).max().unwrap_or(0)
    }
}

/// Resource-constrained list scheduling driven by force-directed
/// placement. Pipelined blocks are modulo scheduled at their requested
/// initiation interval.
pub struct Scheduler {
    config: ir::FuConfig,
    /// Pick the step with the smallest force instead of the earliest one.
    force_directed: bool,
    /// Number of times a block may grow before scheduling gives up.
    max_growth: Option<u64>,
}

impl Named for Scheduler {
    fn name() -> &'static str {
        "schedule"
    }

    fn description() -> &'static str {
        "assign every operation a step of its block"
    }

    fn opts() -> Vec<PassOpt> {
        vec![
            PassOpt::new(
                "force-directed",
                "place operations at the step with the smallest force",
                ParseVal::Bool(true),
                PassOpt::parse_bool,
            ),
            PassOpt::new(
                "max-growth",
                "how often a block may grow while looking for free resources (-1: derived from the block)",
                ParseVal::Num(-1),
                PassOpt::parse_num,
            ),
        ]
    }
}

impl ConstructPass for Scheduler {
    fn from(ctx: &ir::Context) -> ShangResult<Self> {
        let opts = Self::get_opts(ctx);
        Ok(Scheduler {
            config: ctx.config.clone(),
            force_directed: opts["force-directed"].bool(),
            max_growth: opts["max-growth"].pos_num(),
        })
    }
}

impl Scheduler {
    /// Schedule every block of `graph`, laying the blocks out back to back
    /// in block order.
    pub fn schedule(&self, graph: &mut ir::SchedGraph) -> ShangResult<Schedule> {
        let mut schedule = Schedule::default();
        let blocks: Vec<BlockIdx> = graph.blocks().map(|(b, _)| b).collect();
        let mut start = 0;
        for block in blocks {
            let (total, ii) = self.schedule_block(graph, block, &mut schedule.frames)?;
            let pipelined = graph.block(block).is_pipelined();
            log::info!(
                target: Self::name(),
                "`{}': slots [{start}, {}), II={ii}{}",
                graph.block(block).name,
                start + total,
                if pipelined { " (pipelined)" } else { "" },
            );
            schedule.blocks.push(BlockSchedule {
                block,
                start,
                total,
                ii,
                pipelined,
            });
            start += total;
        }
        Ok(schedule)
    }

    /// Slots after its start a node keeps the block busy: its latency, and
    /// one more to release an exclusive unit.
    fn tail(&self, node: &ir::OpNode) -> u32 {
        let release = node
            .op
            .prebound
            .is_some_and(|fu| self.config.desc(fu.kind).exclusive);
        node.latency + u32::from(release)
    }

    fn growth_budget(&self, graph: &ir::SchedGraph, info: &BlockInfo) -> u64 {
        self.max_growth.unwrap_or_else(|| {
            let busy: u64 = info
                .order
                .iter()
                .map(|n| {
                    let node = graph.node(*n);
                    let occupancy = Demand::of(node, &self.config)
                        .map_or(0, |d| d.occupancy);
                    u64::from(node.latency + occupancy)
                })
                .sum();
            busy + info.order.len() as u64 + 8
        })
    }

    /// Schedule one block. Returns its slot count and initiation interval.
    fn schedule_block(
        &self,
        graph: &mut ir::SchedGraph,
        block: BlockIdx,
        committed: &mut HashMap<NodeIdx, Frame>,
    ) -> ShangResult<(u32, u32)> {
        let info = BlockInfo::new(graph, block, &self.config)?;
        if let Some(ii) = info.ii {
            let rec = &info.recurrences;
            if ii < rec.min_ii() {
                return Err(Error::infeasible_ii(
                    &info.name,
                    ii,
                    rec.min_ii(),
                    format!(
                        "recurrences need II>={} and resources need II>={}",
                        rec.rec_mii, rec.res_mii
                    ),
                ));
            }
        }

        graph.clear_steps(block);
        let budget = self.growth_budget(graph, &info);
        let mut growth = 0;
        let mut target = 0;
        let mut table = ReservationTable::new(info.ii);
        let mut pending: BTreeSet<NodeIdx> = info.order.iter().copied().collect();

        while !pending.is_empty() {
            let frames = TimeFrames::compute(graph, &info, target)?;
            target = frames.target();

            let Some(node) = pending
                .iter()
                .copied()
                .filter(|n| info.is_ready(graph, *n))
                .min_by_key(|n| {
                    let f = frames.frame(*n);
                    (!f.is_forced(), f.alap, f.width(), *n)
                })
            else {
                return Err(Error::invariant(format!(
                    "no operation of `{}' is ready to be scheduled",
                    info.name
                )));
            };

            let frame = frames.frame(node);
            let demand = Demand::of(graph.node(node), &self.config);
            let free: Vec<u32> = frame
                .steps()
                .filter(|s| demand.as_ref().is_none_or(|d| table.is_free(d, *s)))
                .collect();

            if free.is_empty() {
                let hopeless =
                    frame.capped || info.ii.is_some_and(|ii| frame.width() >= ii);
                if let (Some(ii), true) = (info.ii, hopeless) {
                    let resource = demand.map(|d| d.key.to_string()).unwrap_or_default();
                    return Err(Error::infeasible_ii(
                        &info.name,
                        ii,
                        info.recurrences.min_ii(),
                        format!("no free {resource} for {node} within its window"),
                    ));
                }
                growth += 1;
                if growth > budget {
                    return Err(Error::diverged(&info.name));
                }
                target += 1;
                log::debug!(
                    target: Self::name(),
                    "no free step for {node} in [{}, {}], growing `{}' to {target}",
                    frame.asap,
                    frame.alap,
                    info.name
                );
                continue;
            }

            let step = if graph.node(node).opcode() == Opcode::Arg {
                frame.asap
            } else if self.force_directed && free.len() > 1 {
                let dg = DistributionGraph::build(graph, &info, &frames, &self.config);
                let mut best = (f64::INFINITY, free[0]);
                for &s in &free {
                    let force = self.force(graph, &info, &frames, &dg, node, s);
                    if force < best.0 - 1e-9 {
                        best = (force, s);
                    }
                }
                best.1
            } else {
                free[0]
            };

            log::debug!(
                target: Self::name(),
                "{node} -> step {step} of [{}, {}]",
                frame.asap,
                frame.alap
            );
            if let Some(d) = demand {
                table.reserve(&d, step);
            }
            graph.commit(node, step);
            committed.insert(node, frame);
            pending.remove(&node);
        }

        let mut total = info
            .order
            .iter()
            .filter_map(|n| {
                let node = graph.node(*n);
                node.step().map(|s| s + self.tail(node))
            })
            .max()
            .map_or(1, |last| last + 1);
        if let Some(ii) = info.ii {
            total = total.max(ii);
        }
        Ok((total, info.ii.unwrap_or(total)))
    }

    /// Force of placing `node` at `step`: the change in expected resource
    /// pressure of every node whose frame the placement narrows.
    fn force(
        &self,
        graph: &ir::SchedGraph,
        info: &BlockInfo,
        frames: &TimeFrames,
        dg: &DistributionGraph,
        node: NodeIdx,
        step: u32,
    ) -> f64 {
        let mut narrowed: BTreeMap<NodeIdx, Frame> = BTreeMap::new();
        narrowed.insert(node, Frame::fixed(step));
        let mut work = vec![node];
        let open = |n: NodeIdx| info.contains(n) && graph.step(n).is_none();

        while let Some(n) = work.pop() {
            let f = narrowed[&n];
            let lat = graph.node(n).latency;
            for (succ, dep) in graph.successors(n) {
                if dep.is_loop_carried() || !open(succ) {
                    continue;
                }
                let cur = narrowed.get(&succ).copied().unwrap_or_else(|| frames.frame(succ));
                let asap = (f.asap + dep.delay(lat)).min(cur.alap);
                if asap > cur.asap {
                    narrowed.insert(succ, Frame { asap, ..cur });
                    work.push(succ);
                }
            }
            for (pred, dep) in graph.predecessors(n) {
                if dep.is_loop_carried() || !open(pred) {
                    continue;
                }
                let cur = narrowed.get(&pred).copied().unwrap_or_else(|| frames.frame(pred));
                let delay = dep.delay(graph.node(pred).latency);
                let alap = f.alap.saturating_sub(delay).max(cur.asap);
                if alap < cur.alap {
                    narrowed.insert(pred, Frame { alap, ..cur });
                    work.push(pred);
                }
            }
        }

        narrowed
            .iter()
            .filter_map(|(n, new)| {
                let d = Demand::of(graph.node(*n), &self.config)?;
                let old = frames.frame(*n);
                Some((dg.average(&d, *new) - dg.average(&d, old)) / f64::from(d.capacity))
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::{DepKind, FuConfig, FuDesc, FuKind, Operand, Operation, SchedGraph};
    use shang_utils::ErrorKind;

    fn one_adder() -> FuConfig {
        FuConfig::new([(
            FuKind::Adder,
            FuDesc {
                latencies: vec![(u32::MAX, 1)],
                instances: Some(1),
                ..Default::default()
            },
        )])
        .unwrap()
    }

    fn scheduler(config: FuConfig) -> Scheduler {
        <Scheduler as ConstructPass>::from(&ir::Context::new(config)).unwrap()
    }

    #[test]
    fn block_geometry() {
        let bs = BlockSchedule {
            block: BlockIdx::from(0u32),
            start: 10,
            total: 6,
            ii: 2,
            pipelined: true,
        };
        assert_eq!(bs.loop_op_slot(), Some(12));
        assert_eq!(bs.boundary_after(10), 12);
        assert_eq!(bs.boundary_after(13), 14);
        assert_eq!(bs.fold(15), 15);
        assert_eq!(bs.fold(16), 14);
        assert_eq!(bs.fold(17), 15);
        assert_eq!(bs.fold(18), 14);
        assert!(bs.contains(15) && !bs.contains(16));

        let flat = BlockSchedule {
            pipelined: false,
            ii: 6,
            ..bs
        };
        assert_eq!(flat.loop_op_slot(), None);
        assert_eq!(flat.fold(20), 15);
    }

    #[test]
    fn serializes_on_a_single_adder() {
        let config = one_adder();
        let mut g = SchedGraph::new();
        let b = g.add_block("entry", None).unwrap();
        let x = g.add_argument(b, 32).unwrap();
        let adds: Vec<_> = (0..3)
            .map(|i| {
                g.add_node(
                    b,
                    Operation::new(
                        Opcode::Add,
                        [Operand::value(x, 32), Operand::imm(i, 32)],
                        32,
                    ),
                    1,
                    &[],
                )
                .unwrap()
            })
            .collect();

        let schedule = scheduler(config).schedule(&mut g).unwrap();
        let mut steps: Vec<_> = adds.iter().map(|n| g.step(*n).unwrap()).collect();
        steps.sort();
        assert_eq!(steps, vec![0, 1, 2]);
        assert_eq!(schedule.block(b).total, 4);
        assert_eq!(schedule.block(b).ii, 4);
        for n in adds {
            let f = schedule.frames[&n];
            assert!(f.contains(g.step(n).unwrap()));
        }
    }

    #[test]
    fn blocks_are_laid_out_back_to_back() {
        let mut g = SchedGraph::new();
        let a = g.add_block("a", None).unwrap();
        let b = g.add_block("b", None).unwrap();
        g.connect(a, b);
        let x = g.add_argument(a, 8).unwrap();
        g.add_node(a, Operation::new(Opcode::Xor, [Operand::value(x, 8)], 8), 2, &[])
            .unwrap();
        g.add_node(b, Operation::new(Opcode::Br, [], 0), 0, &[]).unwrap();

        let schedule = scheduler(FuConfig::default()).schedule(&mut g).unwrap();
        assert_eq!(schedule.block(a).start, 0);
        assert_eq!(schedule.block(a).total, 3);
        assert_eq!(schedule.block(b).start, 3);
        assert_eq!(schedule.total_slots(), 4);
    }

    #[test]
    fn interval_below_the_resource_bound_fails_early() {
        let mut g = SchedGraph::new();
        let b = g.add_block("loop", Some(1)).unwrap();
        let x = g.add_argument(b, 32).unwrap();
        for i in 0..2 {
            g.add_node(
                b,
                Operation::new(Opcode::Add, [Operand::value(x, 32), Operand::imm(i, 32)], 32),
                1,
                &[],
            )
            .unwrap();
        }
        let err = scheduler(one_adder()).schedule(&mut g).unwrap_err();
        assert_eq!(err.retry_ii(), Some(2));

        g.set_pipeline(b, 2).unwrap();
        let schedule = scheduler(one_adder()).schedule(&mut g).unwrap();
        assert_eq!(schedule.block(b).ii, 2);
        assert_eq!(schedule.block(b).loop_op_slot(), Some(2));
    }

    #[test]
    fn modulo_schedule_respects_the_recurrence() {
        let mut g = SchedGraph::new();
        let b = g.add_block("loop", Some(3)).unwrap();
        let acc = g.declare_value(8);
        let x = g.add_argument(b, 8).unwrap();
        let n1 = g
            .add_node(
                b,
                Operation::new(Opcode::Xor, [Operand::value(acc, 8), Operand::value(x, 8)], 8),
                1,
                &[],
            )
            .unwrap();
        let v1 = g.result_of(n1).unwrap();
        let n2 = g
            .add_node(
                b,
                Operation::new(Opcode::Or, [Operand::value(v1, 8), Operand::imm(1, 8)], 8)
                    .defining(acc),
                2,
                &[],
            )
            .unwrap();
        assert!(g.add_dep(n1, n2, DepKind::Control, 0).is_ok());

        let schedule = scheduler(FuConfig::default()).schedule(&mut g).unwrap();
        let (s1, s2) = (g.step(n1).unwrap(), g.step(n2).unwrap());
        assert!(s2 >= s1 + 1);
        // the next iteration's n1 starts after n2 finished
        assert!(s1 + 3 >= s2 + 2);
        assert_eq!(schedule.block(b).ii, 3);
    }

    /// Three multiplies chained through their results and two independent
    /// ones, on two multipliers.
    fn chain_and_two_free_multiplies(g: &mut SchedGraph) -> Vec<NodeIdx> {
        let b = g.add_block("entry", None).unwrap();
        let x = g.add_argument(b, 32).unwrap();
        let mul = |a: Operand, b: Operand| Operation::new(Opcode::Mul, [a, b], 32);
        let m1 = g
            .add_node(b, mul(Operand::value(x, 32), Operand::value(x, 32)), 2, &[])
            .unwrap();
        let v1 = g.result_of(m1).unwrap();
        let m2 = g
            .add_node(b, mul(Operand::value(v1, 32), Operand::value(x, 32)), 2, &[])
            .unwrap();
        let v2 = g.result_of(m2).unwrap();
        let m3 = g
            .add_node(b, mul(Operand::value(v2, 32), Operand::value(x, 32)), 2, &[])
            .unwrap();
        let m4 = g
            .add_node(b, mul(Operand::value(x, 32), Operand::imm(3, 32)), 2, &[])
            .unwrap();
        let m5 = g
            .add_node(b, mul(Operand::value(x, 32), Operand::imm(5, 32)), 2, &[])
            .unwrap();
        vec![m1, m2, m3, m4, m5]
    }

    fn two_multipliers() -> FuConfig {
        FuConfig::new([(
            FuKind::Multiplier,
            FuDesc {
                latencies: vec![(u32::MAX, 2)],
                instances: Some(2),
                ..Default::default()
            },
        )])
        .unwrap()
    }

    #[test]
    fn free_operations_fill_the_gaps_of_a_chain() {
        let mut g = SchedGraph::new();
        let muls = chain_and_two_free_multiplies(&mut g);
        scheduler(two_multipliers()).schedule(&mut g).unwrap();
        let steps: Vec<_> = muls.iter().map(|n| g.step(*n).unwrap()).collect();
        assert_eq!(steps, vec![0, 2, 4, 1, 3]);

        let mut g = SchedGraph::new();
        let muls = chain_and_two_free_multiplies(&mut g);
        let ctx = ir::Context::new(two_multipliers())
            .with_opt("schedule:force-directed=false");
        <Scheduler as ConstructPass>::from(&ctx)
            .unwrap()
            .schedule(&mut g)
            .unwrap();
        let steps: Vec<_> = muls.iter().map(|n| g.step(*n).unwrap()).collect();
        assert_eq!(steps, vec![0, 2, 4, 0, 1]);
    }

    #[test]
    fn exclusive_unit_is_free_only_after_its_release() {
        let mut g = SchedGraph::new();
        let b = g.add_block("entry", None).unwrap();
        let bus = ir::FuInstance::new(FuKind::MemoryBus, 0);
        let loads: Vec<_> = (0..2)
            .map(|_| {
                let addr = g.add_argument(b, 32).unwrap();
                let op = Operation::new(Opcode::Load, [Operand::value(addr, 32)], 32)
                    .bound_to(bus);
                g.add_node(b, op, 2, &[]).unwrap()
            })
            .collect();

        let schedule = scheduler(FuConfig::default()).schedule(&mut g).unwrap();
        let (s1, s2) = (g.step(loads[0]).unwrap(), g.step(loads[1]).unwrap());
        // the first load is disabled at s + 3
        assert!(s1.abs_diff(s2) >= 4);
        assert_eq!(schedule.block(b).total, s1.max(s2) + 4);
    }

    #[test]
    fn growth_budget_bounds_the_block() {
        let build = || {
            let mut g = SchedGraph::new();
            let b = g.add_block("entry", None).unwrap();
            let x = g.add_argument(b, 32).unwrap();
            for i in 0..3 {
                g.add_node(
                    b,
                    Operation::new(
                        Opcode::Mul,
                        [Operand::value(x, 32), Operand::imm(i + 2, 32)],
                        32,
                    ),
                    2,
                    &[],
                )
                .unwrap();
            }
            g
        };

        let ctx = ir::Context::default().with_opt("schedule:max-growth=0");
        let err = <Scheduler as ConstructPass>::from(&ctx)
            .unwrap()
            .schedule(&mut build())
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::Diverged("entry".to_string()));
        assert_eq!(err.retry_ii(), None);

        let mut g = build();
        let schedule = scheduler(FuConfig::default()).schedule(&mut g).unwrap();
        assert_eq!(schedule.block(BlockIdx::from(0u32)).total, 5);
    }
}
