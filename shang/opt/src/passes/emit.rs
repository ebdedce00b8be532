use super::schedule::{BlockSchedule, Schedule};
use crate::analysis::{
    DefCategory, DefIdx, LiveRanges, ReadIdx, ReadSite, ValueDef,
};
use crate::traversal::{ConstructPass, Named};
use shang_idx::maps::IndexedMap;
use shang_ir::{
    self as ir, BlockIdx, NodeIdx, NodeKind, Opcode, Operand, OperandValue,
    Operation, ValueId,
};
use shang_utils::{Error, ShangResult};
use std::collections::BTreeMap;

/// Where an operand of a micro-op comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicroSource {
    Read(ReadIdx),
    Imm(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicroOperand {
    pub source: MicroSource,
    pub width: u32,
    /// Read of the operand's predicate.
    pub predicate: Option<ReadIdx>,
}

/// An operation as executed in one state, with its operands resolved to
/// value links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicroOp {
    pub node: NodeIdx,
    pub opcode: Opcode,
    /// Slot the operation issues in, before folding onto the kernel.
    pub slot: u32,
    /// Link defined by the operation.
    pub dest: Option<DefIdx>,
    pub operands: Vec<MicroOperand>,
    pub guard: Option<ReadIdx>,
}

impl MicroOp {
    /// Every read performed by the operation.
    pub fn reads(&self) -> impl Iterator<Item = ReadIdx> + '_ {
        self.operands
            .iter()
            .flat_map(|op| {
                let value = match op.source {
                    MicroSource::Read(r) => Some(r),
                    MicroSource::Imm(_) => None,
                };
                value.into_iter().chain(op.predicate)
            })
            .chain(self.guard)
    }
}

/// Everything that happens in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MicroState {
    pub slot: u32,
    /// Operations sequenced by the FSM.
    pub control: Vec<MicroOp>,
    /// Combinational operations feeding them.
    pub datapath: Vec<MicroOp>,
}

impl MicroState {
    pub fn ops(&self) -> impl Iterator<Item = &MicroOp> {
        self.control.iter().chain(&self.datapath)
    }
}

/// The states of one block, one per slot.
#[derive(Debug, Clone)]
pub struct BlockStates {
    pub block: BlockIdx,
    pub states: Vec<MicroState>,
}

/// Output of the emitter, rewritten in place by the chain breaker.
#[derive(Debug, Clone)]
pub struct EmittedSchedule {
    pub blocks: IndexedMap<BlockIdx, BlockStates>,
    pub live: LiveRanges,
    /// Loop-boundary merges, in creation order.
    pub phis: Vec<NodeIdx>,
    /// The operation releasing the unit of each exclusive pre-bound node.
    pub(crate) releases: BTreeMap<NodeIdx, NodeIdx>,
}

impl EmittedSchedule {
    fn new(schedule: &Schedule) -> Self {
        let mut blocks = IndexedMap::new();
        for bs in schedule.blocks.values() {
            blocks.push(BlockStates {
                block: bs.block,
                states: (bs.start..bs.end())
                    .map(|slot| MicroState {
                        slot,
                        ..Default::default()
                    })
                    .collect(),
            });
        }
        EmittedSchedule {
            blocks,
            live: LiveRanges::new(),
            phis: Vec::new(),
            releases: BTreeMap::new(),
        }
    }

    pub fn states(&self, block: BlockIdx) -> &[MicroState] {
        &self.blocks[block].states
    }

    /// The state executing absolute `slot` of `block`.
    pub fn state(&self, block: BlockIdx, slot: u32) -> Option<&MicroState> {
        self.blocks[block].states.iter().find(|s| s.slot == slot)
    }

    /// Every micro-op of the function.
    pub fn ops(&self) -> impl Iterator<Item = &MicroOp> {
        self.blocks
            .values()
            .flat_map(|b| b.states.iter())
            .flat_map(MicroState::ops)
    }

    pub fn op_of(&self, node: NodeIdx) -> Option<&MicroOp> {
        self.ops().find(|op| op.node == node)
    }

    /// Place `op` in the state of its slot.
    pub(crate) fn push(&mut self, bs: &BlockSchedule, op: MicroOp, kind: NodeKind) {
        let idx = (bs.fold(op.slot) - bs.start) as usize;
        let state = &mut self.blocks[bs.block].states[idx];
        match kind {
            NodeKind::Control => state.control.push(op),
            NodeKind::Datapath => state.datapath.push(op),
        }
    }

    /// Add a synthesized node moving `source`, a link of `value`, into a new
    /// link that starts at `slot`.
    pub(crate) fn insert_move(
        &mut self,
        graph: &mut ir::SchedGraph,
        bs: &BlockSchedule,
        value: ValueId,
        source: DefIdx,
        slot: u32,
        category: DefCategory,
    ) -> DefIdx {
        let opcode = match category {
            DefCategory::Phi => Opcode::Phi,
            DefCategory::ReadResult => Opcode::ReadFu,
            DefCategory::Copy | DefCategory::Original => Opcode::Copy,
        };
        let width = graph.value_width(value);
        let node = graph.add_synthesized(
            bs.block,
            Operation::new(opcode, [Operand::value(value, width)], width),
            0,
            slot - bs.start,
        );
        let read = self.live.add_read(ReadSite {
            reader: node,
            value,
            block: bs.block,
            issue: slot,
            slot,
            distance: 0,
            control: true,
            def: source,
        });
        let finish = if category == DefCategory::Phi { slot } else { slot + 1 };
        let def = self.live.add_def(ValueDef {
            value,
            node,
            block: bs.block,
            chain_start: slot,
            finish,
            registered: true,
            chained_with_fu: false,
            category,
        });
        let op = MicroOp {
            node,
            opcode,
            slot,
            dest: Some(def),
            operands: vec![MicroOperand {
                source: MicroSource::Read(read),
                width,
                predicate: None,
            }],
            guard: None,
        };
        self.push(bs, op, NodeKind::Control);
        def
    }
}

/// Turns a scheduled graph into per-cycle micro-states and the value links
/// their operands are read from.
pub struct ScheduleEmitter {
    config: ir::FuConfig,
}

impl Named for ScheduleEmitter {
    fn name() -> &'static str {
        "emit"
    }

    fn description() -> &'static str {
        "build the micro-states of every block from the schedule"
    }
}

impl ConstructPass for ScheduleEmitter {
    fn from(ctx: &ir::Context) -> ShangResult<Self> {
        Ok(ScheduleEmitter {
            config: ctx.config.clone(),
        })
    }
}

impl ScheduleEmitter {
    pub fn emit(
        &self,
        graph: &mut ir::SchedGraph,
        schedule: &Schedule,
    ) -> ShangResult<EmittedSchedule> {
        let mut emitted = EmittedSchedule::new(schedule);
        let nodes: Vec<NodeIdx> = graph
            .blocks()
            .flat_map(|(_, bb)| bb.nodes.iter().copied())
            .filter(|n| !graph.node(*n).opcode().is_synthesized())
            .collect();

        for &n in &nodes {
            let Some(slot) = schedule.slot_of(graph, n) else {
                return Err(Error::invariant(format!("{n} was never scheduled")));
            };
            if let Some(value) = graph.node(n).result() {
                let def = self.define(graph, schedule, n, value, slot);
                emitted.live.add_def(def);
            }
        }

        for &n in &nodes {
            let op = self.micro_op(graph, schedule, &mut emitted, n)?;
            let node = graph.node(n);
            let bs = schedule.block(node.block);
            emitted.push(bs, op, node.kind);
        }

        for bs in schedule.blocks.values() {
            log::info!(
                target: Self::name(),
                "`{}': {} states",
                graph.block(bs.block).name,
                bs.total,
            );
        }
        log::debug!(
            target: Self::name(),
            "{} value links, {} phis",
            emitted.live.def_count(),
            emitted.phis.len()
        );
        Ok(emitted)
    }

    /// The slot `node` executes in. Dangling operations are emitted at the
    /// end of their block.
    fn issue_slot(
        &self,
        graph: &ir::SchedGraph,
        schedule: &Schedule,
        node: NodeIdx,
    ) -> Option<u32> {
        let n = graph.node(node);
        if n.op.dangling {
            Some(schedule.block(n.block).end() - 1)
        } else {
            schedule.slot_of(graph, node)
        }
    }

    /// Whether `value`, computed at `slot`, is needed after that slot.
    fn escapes(
        &self,
        graph: &ir::SchedGraph,
        schedule: &Schedule,
        def: NodeIdx,
        value: ValueId,
        slot: u32,
    ) -> bool {
        let block = graph.node(def).block;
        graph.value_uses(value).iter().any(|&user| {
            graph.node(user).block != block
                || graph.read_distance(user, value) > 0
                || self
                    .issue_slot(graph, schedule, user)
                    .is_some_and(|s| s > slot)
        })
    }

    /// The original link of `value`, defined by `node` issued at `slot`.
    fn define(
        &self,
        graph: &ir::SchedGraph,
        schedule: &Schedule,
        node: NodeIdx,
        value: ValueId,
        slot: u32,
    ) -> ValueDef {
        let n = graph.node(node);
        let lat = n.latency;
        let desc = self.config.desc(n.fu_kind());
        let (chain_start, finish, registered) = if lat > 0 && desc.write_until_finish {
            // the unit drives its output during one cycle only
            (slot + lat, slot + lat + 1, false)
        } else if lat == 0 {
            let escapes = self.escapes(graph, schedule, node, value, slot);
            (slot, slot + 1, escapes)
        } else {
            (slot + lat, slot + lat, true)
        };
        log::trace!(
            target: Self::name(),
            "{value}: {node} visible at {chain_start}, registered={registered}"
        );
        ValueDef {
            value,
            node,
            block: n.block,
            chain_start,
            finish,
            registered,
            chained_with_fu: false,
            category: DefCategory::Original,
        }
    }

    fn micro_op(
        &self,
        graph: &mut ir::SchedGraph,
        schedule: &Schedule,
        emitted: &mut EmittedSchedule,
        node: NodeIdx,
    ) -> ShangResult<MicroOp> {
        let Some(issue) = self.issue_slot(graph, schedule, node) else {
            return Err(Error::invariant(format!("{node} was never scheduled")));
        };
        let op = graph.node(node).op.clone();
        let control = !graph.node(node).is_datapath();

        let mut operands = Vec::with_capacity(op.operands.len());
        for operand in &op.operands {
            let source = match operand.value {
                OperandValue::Value(v) => MicroSource::Read(
                    self.read(graph, schedule, emitted, node, v, issue, control)?,
                ),
                OperandValue::Imm(imm) => MicroSource::Imm(imm),
            };
            let predicate = operand
                .predicate
                .map(|p| self.read(graph, schedule, emitted, node, p, issue, control))
                .transpose()?;
            operands.push(MicroOperand {
                source,
                width: operand.width,
                predicate,
            });
        }
        let guard = op
            .guard
            .map(|g| self.read(graph, schedule, emitted, node, g, issue, control))
            .transpose()?;

        Ok(MicroOp {
            node,
            opcode: op.opcode,
            slot: issue,
            dest: op.result.and_then(|v| emitted.live.origin(v)),
            operands,
            guard,
        })
    }

    /// Record the read of `value` by `reader` at `issue` and resolve it to
    /// the link serving it.
    #[allow(clippy::too_many_arguments)]
    fn read(
        &self,
        graph: &mut ir::SchedGraph,
        schedule: &Schedule,
        emitted: &mut EmittedSchedule,
        reader: NodeIdx,
        value: ValueId,
        issue: u32,
        control: bool,
    ) -> ShangResult<ReadIdx> {
        let Some(def_node) = graph.value_def(value) else {
            return Err(Error::broken_dependency(format!(
                "{reader} reads {value}, which is never defined"
            )));
        };
        let block = graph.node(reader).block;
        let def_block = graph.node(def_node).block;
        let distance = graph.read_distance(reader, value);
        let bs = schedule.block(block).clone();

        if def_block != block {
            if distance > 0 || !graph.block_reaches(def_block, block) {
                return Err(Error::broken_dependency(format!(
                    "{value} defined in `{}' does not reach {reader} in `{}'",
                    graph.block(def_block).name,
                    graph.block(block).name
                )));
            }
            let def = emitted.live.last(def_block, value).ok_or_else(|| {
                Error::invariant(format!("{value} has no link in its own block"))
            })?;
            return Ok(emitted.live.add_read(ReadSite {
                reader,
                value,
                block,
                issue,
                slot: issue,
                distance: 0,
                control,
                def,
            }));
        }

        if distance > 0 && !bs.pipelined {
            return Err(Error::broken_dependency(format!(
                "{reader} reads {value} of a previous iteration, but `{}' is not pipelined",
                graph.block(block).name
            )));
        }
        let slot = issue + distance * bs.ii;
        let origin = emitted.live.origin(value).ok_or_else(|| {
            Error::invariant(format!("{value} has no original link"))
        })?;
        let available = emitted.live.def(origin).chain_start;
        if slot < available {
            return Err(Error::broken_dependency(format!(
                "{reader} reads {value} at slot {slot}, before it is available at {available}"
            )));
        }
        if distance > 0 {
            self.insert_phis(graph, &bs, emitted, value, available, slot);
        }
        let def = emitted
            .live
            .latest_at(block, value, slot)
            .unwrap_or(origin);
        Ok(emitted.live.add_read(ReadSite {
            reader,
            value,
            block,
            issue,
            slot,
            distance,
            control,
            def,
        }))
    }

    /// Merge `value` at every iteration boundary between its definition and
    /// the loop-carried read at `slot`.
    fn insert_phis(
        &self,
        graph: &mut ir::SchedGraph,
        bs: &BlockSchedule,
        emitted: &mut EmittedSchedule,
        value: ValueId,
        defined: u32,
        slot: u32,
    ) {
        let mut boundary = bs.boundary_after(defined);
        while boundary <= slot {
            if emitted
                .live
                .find(bs.block, value, boundary, DefCategory::Phi)
                .is_none()
            {
                let source = emitted.live.latest_at(bs.block, value, boundary);
                if let Some(source) = source {
                    let phi = emitted.insert_move(
                        graph,
                        bs,
                        value,
                        source,
                        boundary,
                        DefCategory::Phi,
                    );
                    let node = emitted.live.def(phi).node;
                    log::debug!(
                        target: Self::name(),
                        "{value}: phi {node} at slot {boundary}"
                    );
                    emitted.phis.push(node);
                }
            }
            boundary += bs.ii;
        }
    }
}
