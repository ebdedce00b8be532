use super::recurrence::Recurrences;
use shang_ir::{self as ir, BlockIdx, NodeIdx};
use shang_utils::{Error, ShangResult};
use std::collections::{BTreeSet, HashMap};

/// Facts about a block that stay fixed while it is being scheduled.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub block: BlockIdx,
    pub name: String,
    /// Requested initiation interval of a pipelined block.
    pub ii: Option<u32>,
    /// Non-synthesized nodes, topologically sorted over distance-0 edges.
    pub order: Vec<NodeIdx>,
    pub recurrences: Recurrences,
    position: HashMap<NodeIdx, usize>,
}

impl BlockInfo {
    pub fn new(
        graph: &ir::SchedGraph,
        block: BlockIdx,
        config: &ir::FuConfig,
    ) -> ShangResult<Self> {
        let bb = graph.block(block);
        let members: BTreeSet<NodeIdx> = bb
            .nodes
            .iter()
            .copied()
            .filter(|n| !graph.node(*n).opcode().is_synthesized())
            .collect();

        // Kahn's algorithm; the smallest ready index goes first.
        let mut indegree: HashMap<NodeIdx, usize> =
            members.iter().map(|n| (*n, 0)).collect();
        for &n in &members {
            for (succ, dep) in graph.successors(n) {
                if !dep.is_loop_carried() && members.contains(&succ) {
                    *indegree.entry(succ).or_default() += 1;
                }
            }
        }
        let mut ready: BTreeSet<NodeIdx> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut order = Vec::with_capacity(members.len());
        while let Some(n) = ready.pop_first() {
            order.push(n);
            for (succ, dep) in graph.successors(n) {
                if dep.is_loop_carried() || !members.contains(&succ) {
                    continue;
                }
                let d = indegree.entry(succ).or_default();
                *d -= 1;
                if *d == 0 {
                    ready.insert(succ);
                }
            }
        }
        if order.len() != members.len() {
            return Err(Error::malformed_graph(format!(
                "block `{}' has a cycle of distance-0 dependences",
                bb.name
            )));
        }

        let position = order.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        Ok(BlockInfo {
            block,
            name: bb.name.clone(),
            ii: bb.pipeline,
            order,
            recurrences: Recurrences::compute(graph, block, config),
            position,
        })
    }

    pub fn contains(&self, node: NodeIdx) -> bool {
        self.position.contains_key(&node)
    }

    /// A node may be placed once every predecessor it has to follow is
    /// committed. Loop-carried predecessors outside the node's own cycle must
    /// be placed first too: nothing else bounds them.
    pub fn is_ready(&self, graph: &ir::SchedGraph, node: NodeIdx) -> bool {
        graph.predecessors(node).all(|(pred, dep)| {
            if !self.contains(pred) || pred == node {
                return true;
            }
            if dep.is_loop_carried() && self.recurrences.same_cycle(pred, node)
            {
                return true;
            }
            graph.step(pred).is_some()
        })
    }
}

/// The steps a node may still start at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub asap: u32,
    pub alap: u32,
    /// The ALAP bound comes from a modulo recurrence cap, so a longer block
    /// cannot widen it.
    pub capped: bool,
}

impl Frame {
    pub fn fixed(step: u32) -> Self {
        Frame {
            asap: step,
            alap: step,
            capped: false,
        }
    }

    pub fn width(&self) -> u32 {
        self.alap + 1 - self.asap
    }

    pub fn is_forced(&self) -> bool {
        self.asap == self.alap
    }

    pub fn contains(&self, step: u32) -> bool {
        self.asap <= step && step <= self.alap
    }

    pub fn steps(&self) -> std::ops::RangeInclusive<u32> {
        self.asap..=self.alap
    }
}

/// ASAP/ALAP frames of every node of a block.
#[derive(Debug, Clone)]
pub struct TimeFrames {
    frames: HashMap<NodeIdx, Frame>,
    target: u32,
}

impl TimeFrames {
    /// Compute the frames of `info`'s nodes for a block of at least
    /// `target` steps. The target grows to the critical path if needed.
    pub fn compute(
        graph: &ir::SchedGraph,
        info: &BlockInfo,
        target: u32,
    ) -> ShangResult<Self> {
        let ii = info.ii.map(i64::from);
        let step_of = |n: NodeIdx| graph.step(n).map(i64::from);

        let mut asap: HashMap<NodeIdx, i64> = HashMap::new();
        for &n in &info.order {
            let value = step_of(n).unwrap_or_else(|| {
                graph
                    .predecessors(n)
                    .filter(|(p, _)| info.contains(*p))
                    .filter_map(|(p, dep)| {
                        let delay = i64::from(dep.delay(graph.node(p).latency));
                        if dep.is_loop_carried() {
                            let (ii, ps) = (ii?, step_of(p)?);
                            Some(ps + delay - ii * i64::from(dep.distance))
                        } else {
                            Some(asap[&p] + delay)
                        }
                    })
                    .fold(0, i64::max)
            });
            asap.insert(n, value);
        }

        let critical = info
            .order
            .iter()
            .map(|n| asap[n] + i64::from(graph.node(*n).latency))
            .max()
            .unwrap_or(0);
        let target = i64::from(target).max(critical);

        let mut alap: HashMap<NodeIdx, (i64, bool)> = HashMap::new();
        for &n in info.order.iter().rev() {
            if let Some(s) = step_of(n) {
                alap.insert(n, (s, false));
                continue;
            }
            let lat = i64::from(graph.node(n).latency);
            let mut best = (target - lat, false);
            let mut tighten = |cand: (i64, bool)| {
                if cand.0 < best.0 || (cand.0 == best.0 && cand.1) {
                    best = cand;
                }
            };
            for (succ, dep) in graph.successors(n) {
                if !info.contains(succ) {
                    continue;
                }
                if !dep.is_loop_carried() {
                    let (a, capped) = alap[&succ];
                    tighten((a - i64::from(dep.delay(graph.node(n).latency)), capped));
                } else if let Some(ii) = ii {
                    if info.recurrences.same_cycle(n, succ) {
                        let start = step_of(succ).unwrap_or(asap[&succ]);
                        tighten((start + ii * i64::from(dep.distance) - lat, true));
                    }
                }
            }
            alap.insert(n, best);
        }

        let mut frames = HashMap::with_capacity(info.order.len());
        for &n in &info.order {
            let (lo, (hi, capped)) = (asap[&n], alap[&n]);
            if hi < lo || hi < 0 {
                let Some(ii) = info.ii else {
                    return Err(Error::invariant(format!(
                        "{n} in `{}' has an empty time frame [{lo}, {hi}]",
                        info.name
                    )));
                };
                return Err(Error::infeasible_ii(
                    &info.name,
                    ii,
                    info.recurrences.min_ii(),
                    format!("the recurrence through {n} cannot close"),
                ));
            }
            frames.insert(
                n,
                Frame {
                    asap: lo as u32,
                    alap: hi as u32,
                    capped,
                },
            );
        }
        Ok(TimeFrames {
            frames,
            target: target as u32,
        })
    }

    pub fn frame(&self, node: NodeIdx) -> Frame {
        self.frames[&node]
    }

    pub fn get(&self, node: NodeIdx) -> Option<Frame> {
        self.frames.get(&node).copied()
    }

    /// Length the frames were computed for.
    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeIdx, Frame)> + '_ {
        self.frames.iter().map(|(n, f)| (*n, *f))
    }
}
