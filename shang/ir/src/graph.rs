use crate::node::{
    BlockIdx, NodeIdx, OpNode, Opcode, Operands, Operation, ValueId,
};
use petgraph::{
    Direction,
    algo::has_path_connecting,
    graph::{DiGraph, NodeIndex},
    visit::{EdgeFiltered, EdgeRef},
};
use shang_idx::{IndexRef, maps::IndexedMap};
use shang_utils::{Error, ShangResult};
use std::collections::{HashMap, HashSet, VecDeque};

/// Kind of a dependence between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepKind {
    /// The destination reads a value produced by the source.
    Data,
    /// The destination overwrites storage the source reads. The destination
    /// may start in the same step the source starts.
    Anti,
    Control,
    Memory,
}

/// Edge of the scheduling graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependence {
    pub kind: DepKind,
    /// Number of iterations between the source and the destination. Only
    /// loop-carried edges of pipelined blocks have a positive distance.
    pub distance: u32,
}

impl Dependence {
    pub fn new(kind: DepKind, distance: u32) -> Self {
        Dependence { kind, distance }
    }

    /// Minimum number of steps between the start of the source (with
    /// latency `src_latency`) and the start of the destination, ignoring the
    /// iteration distance.
    pub fn delay(&self, src_latency: u32) -> u32 {
        match self.kind {
            DepKind::Anti => 0,
            DepKind::Data | DepKind::Control | DepKind::Memory => src_latency,
        }
    }

    pub fn is_loop_carried(&self) -> bool {
        self.distance > 0
    }
}

/// A basic block: a set of nodes scheduled into one contiguous slot range.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub name: String,
    pub preds: Vec<BlockIdx>,
    pub succs: Vec<BlockIdx>,
    /// Nodes in program order.
    pub nodes: Vec<NodeIdx>,
    /// Requested initiation interval when the block is a pipelined loop.
    pub pipeline: Option<u32>,
}

impl BasicBlock {
    pub fn is_pipelined(&self) -> bool {
        self.pipeline.is_some()
    }
}

#[derive(Debug, Clone)]
struct ValueInfo {
    width: u32,
    def: Option<NodeIdx>,
    uses: Vec<NodeIdx>,
}

/// Structural identity of a pure operation, used to avoid creating the same
/// node twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Fingerprint {
    block: BlockIdx,
    opcode: Opcode,
    operands: Operands,
    width: u32,
    latency: u32,
}

/// The scheduling graph of one function.
///
/// Node indices of the dependence graph mirror [NodeIdx] one to one, nodes
/// are never removed.
#[derive(Debug, Clone, Default)]
pub struct SchedGraph {
    nodes: IndexedMap<NodeIdx, OpNode>,
    blocks: IndexedMap<BlockIdx, BasicBlock>,
    values: IndexedMap<ValueId, ValueInfo>,
    deps: DiGraph<NodeIdx, Dependence>,
    uniq: HashMap<Fingerprint, NodeIdx>,
}

fn graph_idx(node: NodeIdx) -> NodeIndex {
    NodeIndex::new(node.index())
}

impl SchedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /////////////// Blocks //////////////////

    /// Add a basic block. `pipeline` requests modulo scheduling with the
    /// given initiation interval.
    pub fn add_block<S: ToString>(
        &mut self,
        name: S,
        pipeline: Option<u32>,
    ) -> ShangResult<BlockIdx> {
        let name = name.to_string();
        if pipeline == Some(0) {
            return Err(Error::malformed_graph(format!(
                "block `{name}' requests an initiation interval of 0"
            )));
        }
        Ok(self.blocks.push(BasicBlock {
            name,
            preds: Vec::new(),
            succs: Vec::new(),
            nodes: Vec::new(),
            pipeline,
        }))
    }

    /// Add a control-flow edge between two blocks.
    pub fn connect(&mut self, from: BlockIdx, to: BlockIdx) {
        if !self.blocks[from].succs.contains(&to) {
            self.blocks[from].succs.push(to);
            self.blocks[to].preds.push(from);
        }
    }

    pub fn block(&self, block: BlockIdx) -> &BasicBlock {
        &self.blocks[block]
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockIdx, &BasicBlock)> {
        self.blocks.iter()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Change the requested initiation interval of a pipelined block. Used by
    /// callers retrying after an infeasible interval.
    pub fn set_pipeline(
        &mut self,
        block: BlockIdx,
        ii: u32,
    ) -> ShangResult<()> {
        if ii == 0 || !self.blocks[block].is_pipelined() {
            return Err(Error::malformed_graph(format!(
                "cannot pipeline block `{}' with II={ii}",
                self.blocks[block].name
            )));
        }
        self.blocks[block].pipeline = Some(ii);
        Ok(())
    }

    /// Whether control can flow from `from` to `to`. A block reaches itself.
    pub fn block_reaches(&self, from: BlockIdx, to: BlockIdx) -> bool {
        if from == to {
            return true;
        }
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(b) = queue.pop_front() {
            for &succ in &self.blocks[b].succs {
                if succ == to {
                    return true;
                }
                if seen.insert(succ) {
                    queue.push_back(succ);
                }
            }
        }
        false
    }

    /////////////// Values //////////////////

    /// Declare a value whose defining node is added later. Reads of a
    /// declared value in the block that later defines it are loop carried.
    pub fn declare_value(&mut self, width: u32) -> ValueId {
        self.values.push(ValueInfo {
            width,
            def: None,
            uses: Vec::new(),
        })
    }

    pub fn value_def(&self, value: ValueId) -> Option<NodeIdx> {
        self.values.get(value).and_then(|info| info.def)
    }

    pub fn value_uses(&self, value: ValueId) -> &[NodeIdx] {
        self.values
            .get(value)
            .map(|info| info.uses.as_slice())
            .unwrap_or(&[])
    }

    pub fn value_width(&self, value: ValueId) -> u32 {
        self.values[value].width
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Number of iterations between the definition of `value` and its read
    /// by `reader`.
    pub fn read_distance(&self, reader: NodeIdx, value: ValueId) -> u32 {
        let Some(def) = self.value_def(value) else {
            return 0;
        };
        let explicit = self
            .deps
            .edges_connecting(graph_idx(def), graph_idx(reader))
            .filter(|e| e.weight().kind == DepKind::Data)
            .map(|e| e.weight().distance)
            .min();
        if let Some(distance) = explicit {
            return distance;
        }
        let (def_block, read_block) =
            (self.nodes[def].block, self.nodes[reader].block);
        if def_block == read_block && def >= reader {
            1
        } else {
            0
        }
    }

    /////////////// Nodes //////////////////

    /// Add a function input to `block`. Arguments are available from the
    /// first step of the block.
    pub fn add_argument(
        &mut self,
        block: BlockIdx,
        width: u32,
    ) -> ShangResult<ValueId> {
        let node = self.add_node(
            block,
            Operation::new(Opcode::Arg, [], width),
            0,
            &[],
        )?;
        self.result_of(node)
    }

    /// Add an operation with intrinsic latency `latency` to `block`.
    ///
    /// Data dependences on values defined earlier in the same block are
    /// added automatically; `deps` adds further `(source, kind, distance)`
    /// edges into the new node. Structurally identical pure operations are
    /// only created once: the existing node is returned instead.
    ///
    /// Fails if an operand is unknown, the result is defined twice, or a
    /// distance-0 edge would close a cycle.
    pub fn add_node(
        &mut self,
        block: BlockIdx,
        op: Operation,
        latency: u32,
        deps: &[(NodeIdx, DepKind, u32)],
    ) -> ShangResult<NodeIdx> {
        if self.blocks.get(block).is_none() {
            return Err(Error::malformed_graph(format!(
                "unknown block {block}"
            )));
        }
        for value in op.reads() {
            if self.values.get(value).is_none() {
                return Err(Error::malformed_graph(format!(
                    "{:?} reads unknown value {value}",
                    op.opcode
                )));
            }
        }
        if let Some(result) = op.result {
            match self.values.get(result) {
                None => {
                    return Err(Error::malformed_graph(format!(
                        "{result} was never declared"
                    )));
                }
                Some(ValueInfo { def: Some(def), .. }) => {
                    return Err(Error::malformed_graph(format!(
                        "{result} is already defined by {def}"
                    )));
                }
                Some(_) => {}
            }
        }

        let fingerprint = (op.opcode.is_pure()
            && op.result.is_none()
            && op.guard.is_none()
            && op.prebound.is_none()
            && !op.dangling)
            .then(|| Fingerprint {
                block,
                opcode: op.opcode,
                operands: op.operands.clone(),
                width: op.width,
                latency,
            });
        if let Some(existing) =
            fingerprint.as_ref().and_then(|fp| self.uniq.get(fp)).copied()
        {
            log::trace!("reusing {existing} for {:?}", op.opcode);
            for &(src, kind, distance) in deps {
                self.add_dep(src, existing, kind, distance)?;
            }
            return Ok(existing);
        }

        let node = self.insert_node(block, op, latency, None);
        if let Some(fp) = fingerprint {
            self.uniq.insert(fp, node);
        }
        for &(src, kind, distance) in deps {
            self.add_dep(src, node, kind, distance)?;
        }
        Ok(node)
    }

    /// Add a node created after scheduling. Its step is committed right away
    /// and it has no dependence edges.
    pub fn add_synthesized(
        &mut self,
        block: BlockIdx,
        op: Operation,
        latency: u32,
        step: u32,
    ) -> NodeIdx {
        let node = self.nodes.push(OpNode::new(op, latency, block, Some(step)));
        let gidx = self.deps.add_node(node);
        debug_assert_eq!(gidx.index(), node.index());
        let result = self.nodes[node]
            .op
            .opcode
            .produces_value()
            .then(|| self.declare_value(self.nodes[node].op.width));
        if let Some(result) = result {
            self.nodes[node].op.result = Some(result);
            self.values[result].def = Some(node);
        }
        let reads: Vec<_> = self.nodes[node].op.reads().collect();
        for value in reads {
            self.values[value].uses.push(node);
        }
        self.blocks[block].nodes.push(node);
        node
    }

    fn insert_node(
        &mut self,
        block: BlockIdx,
        mut op: Operation,
        latency: u32,
        step: Option<u32>,
    ) -> NodeIdx {
        if op.result.is_none() && op.opcode.produces_value() {
            op.result = Some(self.declare_value(op.width));
        }
        let reads: Vec<_> = op.reads().collect();
        let result = op.result;
        let node = self.nodes.push(OpNode::new(op, latency, block, step));
        let gidx = self.deps.add_node(node);
        debug_assert_eq!(gidx.index(), node.index());

        // Edges from definitions earlier in this block.
        for value in reads.iter().copied() {
            if let Some(def) = self.values[value].def {
                if self.nodes[def].block == block
                    && !self.has_edge(def, node, DepKind::Data)
                {
                    self.deps.add_edge(
                        graph_idx(def),
                        graph_idx(node),
                        Dependence::new(DepKind::Data, 0),
                    );
                }
            }
            self.values[value].uses.push(node);
        }

        // Earlier readers of a declared value read the previous iteration.
        if let Some(result) = result {
            self.values[result].def = Some(node);
            if self.blocks[block].is_pipelined() {
                let readers: Vec<_> = self.values[result]
                    .uses
                    .iter()
                    .copied()
                    .filter(|r| self.nodes[*r].block == block)
                    .collect();
                for reader in readers {
                    self.deps.add_edge(
                        graph_idx(node),
                        graph_idx(reader),
                        Dependence::new(DepKind::Data, 1),
                    );
                }
            }
        }
        self.blocks[block].nodes.push(node);
        node
    }

    fn has_edge(&self, src: NodeIdx, dst: NodeIdx, kind: DepKind) -> bool {
        self.deps
            .edges_connecting(graph_idx(src), graph_idx(dst))
            .any(|e| e.weight().kind == kind)
    }

    /// Add a dependence edge `src -> dst`.
    pub fn add_dep(
        &mut self,
        src: NodeIdx,
        dst: NodeIdx,
        kind: DepKind,
        distance: u32,
    ) -> ShangResult<()> {
        let (Some(s), Some(d)) = (self.nodes.get(src), self.nodes.get(dst))
        else {
            return Err(Error::malformed_graph(format!(
                "dependence {src} -> {dst} refers to an unknown node"
            )));
        };
        if s.block != d.block {
            return Err(Error::malformed_graph(format!(
                "dependence {src} -> {dst} crosses blocks {} and {}",
                s.block, d.block
            )));
        }
        let block = &self.blocks[s.block];
        if distance > 0 {
            if !block.is_pipelined() {
                return Err(Error::malformed_graph(format!(
                    "loop-carried dependence {src} -> {dst} in block `{}' which is not pipelined",
                    block.name
                )));
            }
        } else if src == dst
            || has_path_connecting(
                &EdgeFiltered::from_fn(&self.deps, |e| {
                    e.weight().distance == 0
                }),
                graph_idx(dst),
                graph_idx(src),
                None,
            )
        {
            return Err(Error::malformed_graph(format!(
                "dependence {src} -> {dst} creates a cycle within one iteration of `{}'",
                block.name
            )));
        }
        self.deps.add_edge(
            graph_idx(src),
            graph_idx(dst),
            Dependence::new(kind, distance),
        );
        Ok(())
    }

    pub fn node(&self, node: NodeIdx) -> &OpNode {
        &self.nodes[node]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIdx, &OpNode)> {
        self.nodes.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The value defined by `node`.
    pub fn result_of(&self, node: NodeIdx) -> ShangResult<ValueId> {
        self.nodes[node].result().ok_or_else(|| {
            Error::malformed_graph(format!(
                "{node} ({:?}) does not define a value",
                self.nodes[node].opcode()
            ))
        })
    }

    /// Outgoing dependences of `node`.
    pub fn successors(
        &self,
        node: NodeIdx,
    ) -> impl Iterator<Item = (NodeIdx, Dependence)> + '_ {
        self.deps
            .edges_directed(graph_idx(node), Direction::Outgoing)
            .map(|e| (self.deps[e.target()], *e.weight()))
    }

    /// Incoming dependences of `node`.
    pub fn predecessors(
        &self,
        node: NodeIdx,
    ) -> impl Iterator<Item = (NodeIdx, Dependence)> + '_ {
        self.deps
            .edges_directed(graph_idx(node), Direction::Incoming)
            .map(|e| (self.deps[e.source()], *e.weight()))
    }

    /// The dependence graph. Node weights are the [NodeIdx] of the node.
    pub fn dep_graph(&self) -> &DiGraph<NodeIdx, Dependence> {
        &self.deps
    }

    /////////////// Schedule //////////////////

    /// Commit `node` to the block-relative `step`.
    pub fn commit(&mut self, node: NodeIdx, step: u32) {
        self.nodes[node].set_step(Some(step));
    }

    /// Forget the steps of every non-synthesized node of `block`.
    pub fn clear_steps(&mut self, block: BlockIdx) {
        for node in self.blocks[block].nodes.clone() {
            if !self.nodes[node].opcode().is_synthesized() {
                self.nodes[node].set_step(None);
            }
        }
    }

    pub fn step(&self, node: NodeIdx) -> Option<u32> {
        self.nodes[node].step()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Operand;

    fn add(g: &mut SchedGraph, b: BlockIdx, a: ValueId, c: ValueId) -> NodeIdx {
        g.add_node(
            b,
            Operation::new(
                Opcode::Add,
                [Operand::value(a, 8), Operand::value(c, 8)],
                8,
            ),
            1,
            &[],
        )
        .unwrap()
    }

    #[test]
    fn operands_create_data_edges() {
        let mut g = SchedGraph::new();
        let b = g.add_block("entry", None).unwrap();
        let x = g.add_argument(b, 8).unwrap();
        let n1 = add(&mut g, b, x, x);
        let v1 = g.result_of(n1).unwrap();
        let n2 = add(&mut g, b, v1, x);

        let preds: Vec<_> = g.predecessors(n2).map(|(n, _)| n).collect();
        assert!(preds.contains(&n1));
        assert_eq!(g.successors(n1).count(), 1);
        assert_eq!(g.value_uses(v1), &[n2]);
        assert_eq!(g.read_distance(n2, v1), 0);
    }

    #[test]
    fn identical_pure_nodes_are_shared() {
        let mut g = SchedGraph::new();
        let b = g.add_block("entry", None).unwrap();
        let x = g.add_argument(b, 8).unwrap();
        let y = g.add_argument(b, 8).unwrap();
        let n1 = add(&mut g, b, x, y);
        let n2 = add(&mut g, b, x, y);
        let n3 = add(&mut g, b, y, x);
        assert_eq!(n1, n2);
        assert_ne!(n1, n3);
        assert_eq!(g.block(b).nodes.len(), 4);
        assert_eq!((g.block_count(), g.value_count()), (1, 4));
    }

    #[test]
    fn rejects_intra_iteration_cycles() {
        let mut g = SchedGraph::new();
        let b = g.add_block("entry", None).unwrap();
        let x = g.add_argument(b, 8).unwrap();
        let n1 = add(&mut g, b, x, x);
        let v1 = g.result_of(n1).unwrap();
        let n2 = add(&mut g, b, v1, v1);
        let err = g.add_dep(n2, n1, DepKind::Control, 0).unwrap_err();
        assert!(err.message().contains("cycle"));
        assert!(g.add_dep(n1, n1, DepKind::Memory, 0).is_err());
        // loop-carried edges need a pipelined block
        assert!(g.add_dep(n2, n1, DepKind::Data, 1).is_err());
    }

    #[test]
    fn declared_values_are_loop_carried() {
        let mut g = SchedGraph::new();
        let b = g.add_block("loop", Some(2)).unwrap();
        g.connect(b, b);
        let acc = g.declare_value(8);
        let x = g.add_argument(b, 8).unwrap();
        let n1 = add(&mut g, b, acc, x);
        let v1 = g.result_of(n1).unwrap();
        let n2 = g
            .add_node(
                b,
                Operation::new(
                    Opcode::Add,
                    [Operand::value(v1, 8), Operand::imm(1, 8)],
                    8,
                )
                .defining(acc),
                1,
                &[],
            )
            .unwrap();
        assert_eq!(g.value_def(acc), Some(n2));
        let back: Vec<_> = g.successors(n2).collect();
        assert_eq!(back, vec![(n1, Dependence::new(DepKind::Data, 1))]);
        assert_eq!(g.read_distance(n1, acc), 1);

        // a second definition is rejected
        let dup = Operation::new(Opcode::Not, [Operand::value(x, 8)], 8)
            .defining(acc);
        assert!(g.add_node(b, dup, 0, &[]).is_err());
    }

    #[test]
    fn block_reachability() {
        let mut g = SchedGraph::new();
        let a = g.add_block("a", None).unwrap();
        let b = g.add_block("b", None).unwrap();
        let c = g.add_block("c", None).unwrap();
        g.connect(a, b);
        g.connect(b, c);
        assert!(g.block_reaches(a, c));
        assert!(!g.block_reaches(c, a));
        assert!(g.block_reaches(b, b));
        assert_eq!(g.block(b).preds, vec![a]);
    }
}
