//! IR Builder. Provides convenience methods to construct a scheduling graph
//! with latencies taken from the functional-unit table.
use crate::{
    BlockIdx, DepKind, FuConfig, FuInstance, NodeIdx, Opcode, Operand,
    Operation, SchedGraph, ValueId,
};
use shang_utils::{Error, ShangResult};

/// Graph builder.
/// Holds the graph under construction and the table used to look up the
/// intrinsic latency of every operation. Operations are added to the
/// current insertion block.
pub struct GraphBuilder<'a> {
    /// Graph being constructed.
    pub graph: &'a mut SchedGraph,
    config: &'a FuConfig,
    block: Option<BlockIdx>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(graph: &'a mut SchedGraph, config: &'a FuConfig) -> Self {
        Self {
            graph,
            config,
            block: None,
        }
    }

    /// Add a block and make it the insertion point.
    pub fn add_block<S: ToString>(
        &mut self,
        name: S,
        pipeline: Option<u32>,
    ) -> ShangResult<BlockIdx> {
        let block = self.graph.add_block(name, pipeline)?;
        self.block = Some(block);
        Ok(block)
    }

    pub fn set_insertion_block(&mut self, block: BlockIdx) {
        self.block = Some(block);
    }

    fn insertion_block(&self) -> ShangResult<BlockIdx> {
        self.block.ok_or_else(|| {
            Error::misc("GraphBuilder has no insertion block")
        })
    }

    /// Intrinsic latency of `op`, keyed by its resource class and width.
    pub fn latency_of(&self, op: &Operation) -> u32 {
        let kind = op
            .prebound
            .map(|fu| fu.kind)
            .unwrap_or_else(|| op.opcode.fu_kind());
        self.config.desc(kind).latency(op.datapath_width())
    }

    /// Add `op` to the insertion block.
    pub fn build(
        &mut self,
        op: Operation,
        deps: &[(NodeIdx, DepKind, u32)],
    ) -> ShangResult<NodeIdx> {
        let block = self.insertion_block()?;
        let latency = self.latency_of(&op);
        self.graph.add_node(block, op, latency, deps)
    }

    pub fn argument(&mut self, width: u32) -> ShangResult<ValueId> {
        let block = self.insertion_block()?;
        self.graph.add_argument(block, width)
    }

    /// Add a two-operand operation and return its result. Comparisons yield a
    /// single bit, everything else the width of the widest operand.
    pub fn binary(
        &mut self,
        opcode: Opcode,
        lhs: Operand,
        rhs: Operand,
    ) -> ShangResult<ValueId> {
        let width = match opcode {
            Opcode::Cmp(_) => 1,
            _ => std::cmp::max(lhs.width, rhs.width),
        };
        let node = self.build(Operation::new(opcode, [lhs, rhs], width), &[])?;
        self.graph.result_of(node)
    }

    /// Load `width` bits from `addr` through the memory port `port`.
    pub fn load(
        &mut self,
        port: FuInstance,
        addr: Operand,
        width: u32,
        deps: &[(NodeIdx, DepKind, u32)],
    ) -> ShangResult<NodeIdx> {
        self.build(
            Operation::new(Opcode::Load, [addr], width).bound_to(port),
            deps,
        )
    }

    pub fn store(
        &mut self,
        port: FuInstance,
        addr: Operand,
        data: Operand,
        deps: &[(NodeIdx, DepKind, u32)],
    ) -> ShangResult<NodeIdx> {
        self.build(
            Operation::new(Opcode::Store, [addr, data], 0).bound_to(port),
            deps,
        )
    }

    /// Conditional branch on `cond`, or an unconditional one.
    pub fn branch(&mut self, cond: Option<ValueId>) -> ShangResult<NodeIdx> {
        let operands = cond.map(|c| Operand::value(c, 1));
        self.build(Operation::new(Opcode::Br, operands, 0), &[])
    }

    pub fn ret(&mut self, value: Option<Operand>) -> ShangResult<NodeIdx> {
        self.build(Operation::new(Opcode::Ret, value, 0), &[])
    }
}
