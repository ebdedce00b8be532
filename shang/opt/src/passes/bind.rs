use super::emit::EmittedSchedule;
use super::schedule::Schedule;
use crate::analysis::{
    CompatGraph, DefIdx, Demand, Folded, LiveRange, MergeCost, RangeIdx,
    RangeOwner, Resolved, Source,
};
use crate::traversal::{ConstructPass, Named, ParseVal, PassOpt};
use itertools::Itertools;
use petgraph::unionfind::UnionFind;
use serde_json::json;
use shang_idx::{IndexRef, maps::IndexedMap};
use shang_ir::{
    self as ir, FuInstance, FuKind, NodeIdx, OperandValue,
};
use shang_utils::{Error, ShangResult};
use std::collections::{BTreeMap, BTreeSet};

/// Physical instance assigned to every live range.
#[derive(Debug, Clone, Default)]
pub struct Binding {
    ranges: IndexedMap<RangeIdx, LiveRange>,
    assignment: BTreeMap<RangeIdx, FuInstance>,
    counts: BTreeMap<FuKind, u32>,
    limits: BTreeMap<FuKind, Option<u32>>,
}

impl Binding {
    pub fn ranges(&self) -> impl Iterator<Item = (RangeIdx, &LiveRange)> + Clone {
        self.ranges.iter()
    }

    pub fn range(&self, idx: RangeIdx) -> &LiveRange {
        &self.ranges[idx]
    }

    pub fn instance_of(&self, range: RangeIdx) -> Option<FuInstance> {
        self.assignment.get(&range).copied()
    }

    /// Register holding the link `def`, if it needs one.
    pub fn register_of(&self, def: DefIdx) -> Option<u32> {
        self.assignment
            .iter()
            .find(|(r, _)| self.ranges[**r].owner == RangeOwner::Def(def))
            .map(|(_, inst)| inst.index)
    }

    /// Unit executing `node`, if it runs on a shared functional unit.
    pub fn unit_of(&self, node: NodeIdx) -> Option<FuInstance> {
        self.assignment
            .iter()
            .find(|(r, _)| self.ranges[**r].owner == RangeOwner::Node(node))
            .map(|(_, inst)| *inst)
    }

    pub fn instance_count(&self, kind: FuKind) -> u32 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// Ranges sharing `instance`, in time order.
    pub fn members(&self, instance: FuInstance) -> Vec<RangeIdx> {
        self.assignment
            .iter()
            .filter(|(_, inst)| **inst == instance)
            .map(|(r, _)| *r)
            .sorted_by_key(|r| (self.ranges[*r].begin, *r))
            .collect()
    }

    /// Summary of how much sharing took place, per resource class.
    pub fn share_report(&self) -> serde_json::Value {
        let mut report = serde_json::Map::new();
        for (kind, count) in &self.counts {
            let ranges = self
                .ranges
                .values()
                .filter(|r| r.kind == *kind)
                .count();
            report.insert(
                kind.name().to_string(),
                json!({
                    "ranges": ranges,
                    "instances": count,
                    "limit": self.limits.get(kind).copied().flatten(),
                }),
            );
        }
        serde_json::Value::Object(report)
    }
}

/// Merges live ranges that never overlap onto shared registers and
/// functional units.
pub struct Binder {
    config: ir::FuConfig,
    share_fu: bool,
    max_mux_fanin: Option<u64>,
}

impl Named for Binder {
    fn name() -> &'static str {
        "bind"
    }

    fn description() -> &'static str {
        "assign registers and functional units by compatibility-graph reduction"
    }

    fn opts() -> Vec<PassOpt> {
        vec![
            PassOpt::new(
                "share-fu",
                "let operations share functional units",
                ParseVal::Bool(true),
                PassOpt::parse_bool,
            ),
            PassOpt::new(
                "max-mux-fanin",
                "widest multiplexer a merge may create (-1 uses the unit table)",
                ParseVal::Num(-1),
                PassOpt::parse_num,
            ),
        ]
    }
}

impl ConstructPass for Binder {
    fn from(ctx: &ir::Context) -> ShangResult<Self> {
        let opts = Self::get_opts(ctx);
        Ok(Binder {
            config: ctx.config.clone(),
            share_fu: opts["share-fu"].bool(),
            max_mux_fanin: opts["max-mux-fanin"].pos_num(),
        })
    }
}

impl Binder {
    pub fn bind(
        &self,
        graph: &ir::SchedGraph,
        schedule: &Schedule,
        emitted: &EmittedSchedule,
    ) -> ShangResult<Binding> {
        let mut ranges = IndexedMap::new();
        self.register_ranges(graph, schedule, emitted, &mut ranges);
        self.unit_ranges(graph, schedule, &mut ranges)?;

        let mut binding = Binding {
            limits: FuKind::ALL
                .iter()
                .map(|k| (*k, self.config.instances(*k)))
                .collect(),
            ..Default::default()
        };
        let mut next_index: BTreeMap<FuKind, u32> = BTreeMap::new();
        self.bind_prebound(&ranges, &mut binding, &mut next_index);

        let free = ranges
            .iter()
            .filter(|(_, r)| r.prebound.is_none())
            .map(|(idx, r)| (r.kind, idx))
            .into_group_map();
        for (kind, members) in free.into_iter().sorted_by_key(|(k, _)| *k) {
            let desc = self.config.desc(kind);
            let groups = if kind == FuKind::Register || self.share_fu {
                let cost = MergeCost {
                    kind,
                    desc,
                    max_fanin: self
                        .max_mux_fanin
                        .map_or(desc.max_mux_fanin, |m| m as u32),
                };
                CompatGraph::new(&ranges, members, cost).reduce()
            } else {
                members.into_iter().map(|m| vec![m]).collect()
            };
            let next = next_index.entry(kind).or_insert(0);
            for group in groups {
                let instance = FuInstance::new(kind, *next);
                *next += 1;
                for idx in group {
                    binding.assignment.insert(idx, instance);
                }
            }
        }

        for (kind, count) in next_index {
            binding.counts.insert(kind, count);
            if let Some(limit) = self.config.instances(kind) {
                if kind.is_functional_unit() && count > limit {
                    log::warn!(
                        target: Self::name(),
                        "{count} instances of `{kind}' needed, only {limit} available"
                    );
                }
            }
            log::info!(target: Self::name(), "{kind}: {count} instances");
        }
        binding.ranges = ranges;
        Ok(binding)
    }

    /// One range per registered link, from the cycle it is written to its
    /// last read through the register. A link read by an earlier block in
    /// the next trip around a loop stays live for the whole schedule.
    fn register_ranges(
        &self,
        graph: &ir::SchedGraph,
        schedule: &Schedule,
        emitted: &EmittedSchedule,
        ranges: &mut IndexedMap<RangeIdx, LiveRange>,
    ) {
        let live = &emitted.live;
        let last_slot = schedule.total_slots().saturating_sub(1);
        for (d, def) in live.defs() {
            if !def.registered {
                continue;
            }
            let reads: Vec<_> = live
                .reads_of(d)
                .filter(|(r, _)| matches!(live.resolve(*r), Resolved::Register(_)))
                .map(|(_, site)| site)
                .collect();
            if reads.is_empty() {
                continue;
            }
            let bs = schedule.block(def.block);
            let crosses = reads.iter().any(|r| r.block != def.block);
            // read along a back edge, before the link is written again
            let wraps = reads
                .iter()
                .any(|r| r.block != def.block && r.slot < def.finish);
            let local_end = reads
                .iter()
                .filter(|r| r.block == def.block)
                .map(|r| r.slot)
                .max();

            let (begin, end, folded) = match (bs.pipelined, crosses, local_end) {
                (true, false, Some(last)) => {
                    let len = last.saturating_sub(def.finish) + 1;
                    let folded =
                        Folded::new(def.block, def.finish - bs.start, len, bs.ii);
                    (bs.start, bs.end() - 1, Some(folded))
                }
                _ => {
                    let begin = if wraps {
                        0
                    } else if bs.pipelined {
                        bs.start
                    } else {
                        def.finish
                    };
                    let end = if crosses {
                        last_slot
                    } else {
                        local_end.unwrap_or(begin)
                    };
                    (begin, std::cmp::max(begin, end), None)
                }
            };

            let written = graph.node(def.node).result().unwrap_or(def.value);
            ranges.push(LiveRange {
                owner: RangeOwner::Def(d),
                kind: FuKind::Register,
                width: graph.value_width(def.value),
                begin,
                end,
                folded,
                prebound: None,
                ports: vec![BTreeSet::from([Source::Value(written)])],
                consumers: reads.iter().map(|r| r.reader).collect(),
                commutative: false,
            });
        }
    }

    /// One range per operation running on a functional unit, for as long as
    /// it keeps the unit busy.
    fn unit_ranges(
        &self,
        graph: &ir::SchedGraph,
        schedule: &Schedule,
        ranges: &mut IndexedMap<RangeIdx, LiveRange>,
    ) -> ShangResult<()> {
        for (n, node) in graph.nodes() {
            let kind = node.fu_kind();
            if node.opcode().is_synthesized() || !kind.is_functional_unit() {
                continue;
            }
            let Some(slot) = schedule.slot_of(graph, n) else {
                return Err(Error::invariant(format!("{n} was never scheduled")));
            };
            let occupancy = Demand::of(node, &self.config)
                .map_or(self.config.desc(kind).occupancy, |d| d.occupancy);
            let bs = schedule.block(node.block);
            let (begin, end, folded) = if bs.pipelined {
                let folded =
                    Folded::new(node.block, slot - bs.start, occupancy, bs.ii);
                (bs.start, bs.end() - 1, Some(folded))
            } else {
                (slot, slot + occupancy - 1, None)
            };
            let ports = node
                .op
                .operands
                .iter()
                .map(|op| {
                    BTreeSet::from([match op.value {
                        OperandValue::Value(v) => Source::Value(v),
                        OperandValue::Imm(imm) => Source::Imm(imm),
                    }])
                })
                .collect();
            let consumers = node
                .result()
                .map(|v| graph.value_uses(v).iter().copied().collect())
                .unwrap_or_default();
            ranges.push(LiveRange {
                owner: RangeOwner::Node(n),
                kind,
                width: node.op.datapath_width(),
                begin,
                end,
                folded,
                prebound: node.op.prebound.map(|fu| fu.index),
                ports,
                consumers,
                commutative: node.opcode().is_commutative(),
            });
        }
        Ok(())
    }

    /// Ranges pre-bound to the same instance end up on it, whatever the
    /// compatibility graph would say.
    fn bind_prebound(
        &self,
        ranges: &IndexedMap<RangeIdx, LiveRange>,
        binding: &mut Binding,
        next_index: &mut BTreeMap<FuKind, u32>,
    ) {
        let mut sets = UnionFind::new(ranges.len());
        let mut first: BTreeMap<(FuKind, u32), RangeIdx> = BTreeMap::new();
        for (idx, range) in ranges.iter() {
            let Some(index) = range.prebound else { continue };
            let leader = *first.entry((range.kind, index)).or_insert(idx);
            sets.union(leader.index(), idx.index());
        }
        for ((kind, index), leader) in first {
            let instance = FuInstance::new(kind, index);
            let root = sets.find(leader.index());
            for (idx, _) in ranges.iter() {
                if sets.find(idx.index()) == root {
                    binding.assignment.insert(idx, instance);
                }
            }
            let next = next_index.entry(kind).or_insert(0);
            *next = std::cmp::max(*next, index + 1);
            log::debug!(target: Self::name(), "{instance} is pre-bound");
        }
    }
}
