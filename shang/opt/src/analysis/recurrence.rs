use super::reservation::{Demand, ResourceKey};
use petgraph::algo::{find_negative_cycle, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use shang_ir::{self as ir, BlockIdx, NodeIdx};
use shang_utils::ceil_div;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Dependence cycles of one block and the lower bounds they put on its
/// initiation interval.
#[derive(Debug, Clone, Default)]
pub struct Recurrences {
    /// Strongly connected component of every node in a cycle.
    scc_of: HashMap<NodeIdx, usize>,
    /// Members of each cyclic component.
    sccs: Vec<Vec<NodeIdx>>,
    /// Smallest interval allowed by the dependence cycles.
    pub rec_mii: u32,
    /// Smallest interval allowed by the resource counts.
    pub res_mii: u32,
}

impl Recurrences {
    /// Analyse the non-synthesized nodes of `block`.
    pub fn compute(
        graph: &ir::SchedGraph,
        block: BlockIdx,
        config: &ir::FuConfig,
    ) -> Self {
        let members: HashSet<NodeIdx> = graph
            .block(block)
            .nodes
            .iter()
            .copied()
            .filter(|n| !graph.node(*n).opcode().is_synthesized())
            .collect();

        let deps = graph.dep_graph();
        let mut scc_of = HashMap::new();
        let mut sccs = Vec::new();
        for comp in tarjan_scc(deps) {
            let nodes: Vec<NodeIdx> = comp
                .iter()
                .map(|idx| deps[*idx])
                .filter(|n| members.contains(n))
                .collect();
            let cyclic = nodes.len() > 1
                || nodes.first().is_some_and(|n| {
                    graph.successors(*n).any(|(succ, _)| succ == *n)
                });
            if nodes.is_empty() || !cyclic {
                continue;
            }
            for n in &nodes {
                scc_of.insert(*n, sccs.len());
            }
            sccs.push(nodes);
        }

        let mut rec = Recurrences {
            scc_of,
            sccs,
            rec_mii: 1,
            res_mii: 1,
        };
        if graph.block(block).is_pipelined() {
            rec.rec_mii = rec
                .sccs
                .iter()
                .map(|scc| recurrence_bound(graph, scc))
                .max()
                .unwrap_or(1);
            rec.res_mii = resource_bound(graph, &members, config);
        }
        rec
    }

    /// Whether `node` is part of a dependence cycle.
    pub fn in_cycle(&self, node: NodeIdx) -> bool {
        self.scc_of.contains_key(&node)
    }

    pub fn same_cycle(&self, a: NodeIdx, b: NodeIdx) -> bool {
        match (self.scc_of.get(&a), self.scc_of.get(&b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    pub fn cycles(&self) -> &[Vec<NodeIdx>] {
        &self.sccs
    }

    /// The smallest initiation interval worth trying.
    pub fn min_ii(&self) -> u32 {
        self.rec_mii.max(self.res_mii).max(1)
    }
}

/// Smallest `II` for which no cycle of `scc` has a positive total of
/// `delay - II * distance`. Edge weights are negated so that such a cycle
/// shows up as a negative cycle.
fn recurrence_bound(graph: &ir::SchedGraph, scc: &[NodeIdx]) -> u32 {
    let mut slack: DiGraph<NodeIdx, (f64, f64)> = DiGraph::new();
    let index: HashMap<NodeIdx, NodeIndex> =
        scc.iter().map(|n| (*n, slack.add_node(*n))).collect();
    for &src in scc {
        let lat = graph.node(src).latency;
        for (dst, dep) in graph.successors(src) {
            if let Some(&to) = index.get(&dst) {
                slack.add_edge(
                    index[&src],
                    to,
                    (f64::from(dep.delay(lat)), f64::from(dep.distance)),
                );
            }
        }
    }
    let upper: u32 = scc
        .iter()
        .map(|n| graph.node(*n).latency)
        .sum::<u32>()
        .max(1);
    (1..=upper)
        .find(|&ii| {
            let ii = f64::from(ii);
            let weighted =
                slack.map(|_, n| *n, |_, (delay, distance)| ii * distance - delay);
            find_negative_cycle(&weighted, index[&scc[0]]).is_none()
        })
        .unwrap_or(upper)
}

/// `max` over resources of `ceil(busy steps / capacity)`.
fn resource_bound(
    graph: &ir::SchedGraph,
    members: &HashSet<NodeIdx>,
    config: &ir::FuConfig,
) -> u32 {
    let mut usage: BTreeMap<ResourceKey, (u32, u32)> = BTreeMap::new();
    for n in members {
        if let Some(d) = Demand::of(graph.node(*n), config) {
            let entry = usage.entry(d.key).or_insert((0, d.capacity));
            entry.0 += d.occupancy;
        }
    }
    usage
        .values()
        .map(|(busy, capacity)| {
            ceil_div(u64::from(*busy), u64::from(*capacity)) as u32
        })
        .max()
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::{DepKind, FuConfig, Opcode, Operand, Operation, SchedGraph};

    fn op(g: &mut SchedGraph, b: BlockIdx, v: ir::ValueId, lat: u32) -> NodeIdx {
        g.add_node(
            b,
            Operation::new(Opcode::Xor, [Operand::value(v, 8), Operand::imm(3, 8)], 8),
            lat,
            &[],
        )
        .unwrap()
    }

    fn ring(distance: u32) -> (SchedGraph, BlockIdx, [NodeIdx; 3]) {
        let mut g = SchedGraph::new();
        let b = g.add_block("loop", Some(1)).unwrap();
        let x = g.add_argument(b, 8).unwrap();
        let n1 = op(&mut g, b, x, 2);
        let v1 = g.result_of(n1).unwrap();
        let n2 = op(&mut g, b, v1, 2);
        let v2 = g.result_of(n2).unwrap();
        let n3 = op(&mut g, b, v2, 1);
        g.add_dep(n3, n1, DepKind::Data, distance).unwrap();
        (g, b, [n1, n2, n3])
    }

    #[test]
    fn cycle_bounds_the_interval() {
        let (g, b, [n1, _, n3]) = ring(1);
        let rec = Recurrences::compute(&g, b, &FuConfig::default());
        assert!(rec.in_cycle(n1) && rec.same_cycle(n1, n3));
        let arg = g.block(b).nodes[0];
        assert!(!rec.in_cycle(arg));
        assert_eq!(rec.rec_mii, 5);
        assert_eq!(rec.cycles().len(), 1);

        // a distance of two spreads the latency over two iterations
        let (g, b, _) = ring(2);
        assert_eq!(Recurrences::compute(&g, b, &FuConfig::default()).rec_mii, 3);
    }

    #[test]
    fn self_loops_and_loose_cycles() {
        let mut g = SchedGraph::new();
        let b = g.add_block("loop", Some(1)).unwrap();
        let x = g.add_argument(b, 8).unwrap();
        let n = op(&mut g, b, x, 3);
        g.add_dep(n, n, DepKind::Data, 1).unwrap();
        let rec = Recurrences::compute(&g, b, &FuConfig::default());
        assert!(rec.in_cycle(n));
        assert_eq!(rec.rec_mii, 3);

        // a cycle that never needs more than one step per iteration
        let (mut g, b, [n1, _, n3]) = ring(8);
        g.add_dep(n1, n3, DepKind::Anti, 0).unwrap();
        assert_eq!(Recurrences::compute(&g, b, &FuConfig::default()).rec_mii, 1);
    }

    #[test]
    fn resources_bound_the_interval() {
        let mut g = SchedGraph::new();
        let b = g.add_block("loop", Some(1)).unwrap();
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
        let rec = Recurrences::compute(&g, b, &FuConfig::default());
        // one multiplier, three multiplies
        assert_eq!(rec.res_mii, 3);
        assert_eq!(rec.rec_mii, 1);
        assert_eq!(rec.min_ii(), 3);
    }
}
