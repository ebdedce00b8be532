use super::live_ranges::DefIdx;
use itertools::Itertools;
use petgraph::{Direction, algo::toposort, graphmap::DiGraphMap};
use serde::Serialize;
use shang_idx::{IndexRef, impl_index, maps::IndexedMap};
use shang_ir::{BlockIdx, FuDesc, FuKind, NodeIdx, ValueId};
use shang_utils::bits_needed_for;
use std::collections::BTreeSet;

/// Index of a [LiveRange].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RangeIdx(u32);
impl_index!(RangeIdx);

/// What feeds an input of a shared resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
    Value(ValueId),
    Imm(u64),
}

/// What a live range belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RangeOwner {
    /// A registered value link.
    Def(DefIdx),
    /// An operation executing on a functional unit.
    Node(NodeIdx),
}

/// Position of a range of a pipelined block inside one initiation interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Folded {
    /// `[begin, end]` relative to the interval, `end < II`.
    Within { block: BlockIdx, begin: u32, end: u32 },
    /// The range wraps around the interval: it is busy in every step.
    Wrapping(BlockIdx),
}

impl Folded {
    /// Fold `[begin, begin + len)` (block relative) modulo `ii`.
    pub fn new(block: BlockIdx, begin: u32, len: u32, ii: u32) -> Self {
        let begin = begin % ii;
        if len == 0 || len > ii || begin + len > ii {
            Folded::Wrapping(block)
        } else {
            Folded::Within {
                block,
                begin,
                end: begin + len - 1,
            }
        }
    }

    fn block(&self) -> BlockIdx {
        match self {
            Folded::Within { block, .. } | Folded::Wrapping(block) => *block,
        }
    }
}

/// The time a resource is needed for, and what is connected to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveRange {
    pub owner: RangeOwner,
    pub kind: FuKind,
    pub width: u32,
    /// Absolute slots `[begin, end]`. Ranges of a pipelined block span the
    /// whole kernel here and carry their real position in `folded`.
    pub begin: u32,
    pub end: u32,
    pub folded: Option<Folded>,
    /// Instance the range must use.
    pub prebound: Option<u32>,
    /// Sources of every input port.
    pub ports: Vec<BTreeSet<Source>>,
    /// Operations reading the result.
    pub consumers: BTreeSet<NodeIdx>,
    pub commutative: bool,
}

impl LiveRange {
    /// `self` ends strictly before `other` begins. The relation is a strict
    /// partial order, so compatibility is transitive.
    pub fn precedes(&self, other: &LiveRange) -> bool {
        match (self.folded, other.folded) {
            (Some(a), Some(b)) if a.block() == b.block() => match (a, b) {
                (
                    Folded::Within { end, .. },
                    Folded::Within { begin, .. },
                ) => end < begin,
                _ => false,
            },
            _ => self.end < other.begin,
        }
    }

    pub fn overlaps(&self, other: &LiveRange) -> bool {
        !self.precedes(other) && !other.precedes(self)
    }
}

/// A node of the compatibility graph: ranges that will share one instance,
/// ordered in time.
#[derive(Debug, Clone)]
struct Group {
    members: Vec<RangeIdx>,
    width: u32,
    ports: Vec<BTreeSet<Source>>,
    consumers: BTreeSet<NodeIdx>,
    commutative: bool,
}

impl Group {
    fn new(idx: RangeIdx, range: &LiveRange) -> Self {
        Group {
            members: vec![idx],
            width: range.width,
            ports: range.ports.clone(),
            consumers: range.consumers.clone(),
            commutative: range.commutative,
        }
    }

    fn absorb(&mut self, other: Group) {
        self.members.extend(other.members);
        self.width = self.width.max(other.width);
        if self.ports.len() < other.ports.len() {
            self.ports.resize(other.ports.len(), BTreeSet::new());
        }
        for (port, sources) in self.ports.iter_mut().zip(other.ports) {
            port.extend(sources);
        }
        self.consumers.extend(other.consumers);
        self.commutative &= other.commutative;
    }
}

/// Weight returned for merges that must never happen.
pub const PROHIBITIVE: i64 = i64::MIN / 4;

/// Cost model of merging two groups of one resource class.
#[derive(Debug, Clone)]
pub struct MergeCost<'a> {
    pub kind: FuKind,
    pub desc: &'a FuDesc,
    pub max_fanin: u32,
}

fn union_len(a: &BTreeSet<Source>, b: &BTreeSet<Source>) -> usize {
    a.union(b).count()
}

impl MergeCost<'_> {
    fn mux(&self, fanin: usize, width: u32) -> i64 {
        self.desc.mux.cost(fanin, width) as i64
    }

    /// Mux cost saved on one input port by merging sources `a` and `b`.
    fn port_saving(
        &self,
        a: &BTreeSet<Source>,
        b: &BTreeSet<Source>,
        width: u32,
    ) -> Option<i64> {
        let merged = union_len(a, b);
        if merged > self.max_fanin as usize {
            return None;
        }
        Some(
            self.mux(a.len(), width) + self.mux(b.len(), width)
                - self.mux(merged, width),
        )
    }

    /// Saving over every input port, pairing port `i` of `a` with
    /// `map(i)` of `b`.
    fn ports_saving(
        &self,
        a: &Group,
        b: &Group,
        width: u32,
        map: impl Fn(usize) -> usize,
    ) -> Option<i64> {
        let empty = BTreeSet::new();
        let n = a.ports.len().max(b.ports.len());
        (0..n)
            .map(|i| {
                let pa = a.ports.get(i).unwrap_or(&empty);
                let pb = b.ports.get(map(i)).unwrap_or(&empty);
                self.port_saving(pa, pb, width)
            })
            .sum()
    }

    /// Fan-out saving: consumers reached from one unit need fewer inputs.
    fn fanout_saving(&self, a: &Group, b: &Group, width: u32) -> i64 {
        let shared = a.consumers.intersection(&b.consumers).count();
        self.mux(shared + 1, width) - self.mux(1, width)
    }

    /// Area saved by letting `a` and `b` share one instance.
    fn instance_saving(&self, a: &Group, b: &Group) -> i64 {
        let merged = self.desc.cost(a.width.max(b.width));
        (self.desc.cost(a.width) + self.desc.cost(b.width)) as i64 - merged as i64
    }

    fn register(&self, a: &Group, b: &Group) -> Option<i64> {
        let width = a.width.max(b.width);
        Some(
            self.instance_saving(a, b)
                + self.ports_saving(a, b, width, |i| i)?
                + self.fanout_saving(a, b, width),
        )
    }

    /// Adders and multipliers may swap the operands of commutative
    /// operations to line sources up.
    fn arithmetic(&self, a: &Group, b: &Group) -> Option<i64> {
        let width = a.width.max(b.width);
        let straight = self.ports_saving(a, b, width, |i| i);
        let swapped = (a.commutative && b.commutative && b.ports.len() == 2)
            .then(|| self.ports_saving(a, b, width, |i| 1 - i.min(1)))
            .flatten();
        let ports = straight.into_iter().chain(swapped).max()?;
        Some(self.instance_saving(a, b) + ports + self.fanout_saving(a, b, width))
    }

    /// Comparators produce a single bit, only their operands matter.
    fn comparator(&self, a: &Group, b: &Group) -> Option<i64> {
        let width = a.width.max(b.width);
        Some(self.instance_saving(a, b) + self.ports_saving(a, b, width, |i| i)?)
    }

    /// The shift amount port is narrow, and needs no mux at all when both
    /// groups shift by the same constant.
    fn shifter(&self, a: &Group, b: &Group) -> Option<i64> {
        let width = a.width.max(b.width);
        let empty = BTreeSet::new();
        let data = self.port_saving(
            a.ports.first().unwrap_or(&empty),
            b.ports.first().unwrap_or(&empty),
            width,
        )?;
        let (sa, sb) = (
            a.ports.get(1).unwrap_or(&empty),
            b.ports.get(1).unwrap_or(&empty),
        );
        let constant = |s: &BTreeSet<Source>| {
            s.len() == 1 && matches!(s.first(), Some(Source::Imm(_)))
        };
        let amount = if constant(sa) && sa == sb {
            0
        } else {
            self.port_saving(sa, sb, bits_needed_for(u64::from(width)) as u32)?
        };
        Some(
            self.instance_saving(a, b)
                + data
                + amount
                + self.fanout_saving(a, b, width),
        )
    }

    fn weight(&self, a: &Group, b: &Group) -> i64 {
        let weight = match self.kind {
            FuKind::Register => self.register(a, b),
            FuKind::Adder | FuKind::Multiplier => self.arithmetic(a, b),
            FuKind::Comparator => self.comparator(a, b),
            FuKind::Shifter => self.shifter(a, b),
            FuKind::MemoryBus | FuKind::Trivial => {
                let width = a.width.max(b.width);
                self.ports_saving(a, b, width, |i| i)
                    .map(|p| p + self.instance_saving(a, b))
            }
        };
        weight.unwrap_or(PROHIBITIVE)
    }
}

/// Compatibility graph of the ranges of one resource class.
///
/// Nodes are groups of ranges that will share an instance. An edge `u -> v`
/// exists when every range of `u` precedes every range of `v`; its weight
/// is the area saved by merging them.
pub struct CompatGraph<'a> {
    ranges: &'a IndexedMap<RangeIdx, LiveRange>,
    groups: Vec<Group>,
    cost: MergeCost<'a>,
}

impl<'a> CompatGraph<'a> {
    pub fn new<I>(
        ranges: &'a IndexedMap<RangeIdx, LiveRange>,
        members: I,
        cost: MergeCost<'a>,
    ) -> Self
    where
        I: IntoIterator<Item = RangeIdx>,
    {
        let groups = members
            .into_iter()
            .map(|idx| Group::new(idx, &ranges[idx]))
            .collect();
        CompatGraph {
            ranges,
            groups,
            cost,
        }
    }

    fn first(&self, g: &Group) -> &LiveRange {
        &self.ranges[g.members[0]]
    }

    fn last(&self, g: &Group) -> &LiveRange {
        &self.ranges[*g.members.last().unwrap_or(&g.members[0])]
    }

    /// Members of a group are ordered in time, so comparing the boundary
    /// members decides the whole group by transitivity.
    fn precedes(&self, a: &Group, b: &Group) -> bool {
        self.last(a).precedes(self.first(b))
    }

    /// Edges with a positive weight.
    fn build(&self) -> DiGraphMap<usize, i64> {
        let mut graph = DiGraphMap::new();
        for i in 0..self.groups.len() {
            graph.add_node(i);
        }
        for (i, j) in (0..self.groups.len()).tuple_combinations() {
            let (a, b) = (&self.groups[i], &self.groups[j]);
            let (src, dst) = if self.precedes(a, b) {
                (i, j)
            } else if self.precedes(b, a) {
                (j, i)
            } else {
                continue;
            };
            let w = self.cost.weight(&self.groups[src], &self.groups[dst]);
            if w > 0 {
                graph.add_edge(src, dst, w);
            }
        }
        graph
    }

    /// The maximum-weight path, if its weight is positive.
    fn heaviest_path(graph: &DiGraphMap<usize, i64>) -> Option<Vec<usize>> {
        let order = toposort(graph, None).ok()?;
        let mut best: Vec<(i64, Option<usize>)> = vec![(0, None); graph.node_count()];
        for &v in &order {
            for u in graph.neighbors_directed(v, Direction::Incoming) {
                let w = graph.edge_weight(u, v).copied().unwrap_or(0);
                let cand = best[u].0 + w;
                if cand > best[v].0 {
                    best[v] = (cand, Some(u));
                }
            }
        }
        let (end, (weight, _)) = best
            .iter()
            .enumerate()
            .max_by_key(|(i, (w, _))| (*w, std::cmp::Reverse(*i)))?;
        if *weight <= 0 {
            return None;
        }
        let mut path = vec![end];
        let mut cur = end;
        while let Some(prev) = best[cur].1 {
            path.push(prev);
            cur = prev;
        }
        path.reverse();
        Some(path)
    }

    /// Repeatedly merge the nodes of the heaviest path until no merge
    /// saves anything. Returns the final groups in time order of their
    /// first member.
    pub fn reduce(mut self) -> Vec<Vec<RangeIdx>> {
        loop {
            let graph = self.build();
            let Some(path) = Self::heaviest_path(&graph) else {
                break;
            };
            log::trace!(target: "bind", "merging {} groups of {}", path.len(), self.cost.kind);
            let mut taken: Vec<Option<Group>> =
                self.groups.drain(..).map(Some).collect();
            let mut merged = taken[path[0]].take();
            for &i in &path[1..] {
                if let (Some(m), Some(g)) = (merged.as_mut(), taken[i].take()) {
                    m.absorb(g);
                }
            }
            self.groups = merged.into_iter().chain(taken.into_iter().flatten()).collect();
        }
        let mut groups: Vec<Vec<RangeIdx>> =
            self.groups.into_iter().map(|g| g.members).collect();
        groups.sort_by_key(|g| (self.ranges[g[0]].begin, g[0].index()));
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shang_ir::FuConfig;

    fn range(begin: u32, end: u32, srcs: &[u64]) -> LiveRange {
        LiveRange {
            owner: RangeOwner::Node(NodeIdx::from(begin)),
            kind: FuKind::Adder,
            width: 8,
            begin,
            end,
            folded: None,
            prebound: None,
            ports: vec![
                srcs.iter().map(|s| Source::Imm(*s)).collect(),
                BTreeSet::from([Source::Imm(0)]),
            ],
            consumers: BTreeSet::new(),
            commutative: true,
        }
    }

    #[test]
    fn precedence_and_folding() {
        let a = range(0, 1, &[1]);
        let b = range(2, 2, &[2]);
        assert!(a.precedes(&b) && !b.precedes(&a));
        assert!(!a.overlaps(&b));
        assert!(range(0, 2, &[1]).overlaps(&b));

        let blk = BlockIdx::from(0u32);
        let mut f1 = range(0, 9, &[1]);
        f1.folded = Some(Folded::new(blk, 4, 1, 3));
        let mut f2 = range(0, 9, &[1]);
        f2.folded = Some(Folded::new(blk, 2, 1, 3));
        // 4 mod 3 = 1 comes before 2
        assert!(f1.precedes(&f2));
        assert_eq!(Folded::new(blk, 2, 2, 3), Folded::Wrapping(blk));
        // ranges outside the block compare against the kernel extent
        assert!(f1.overlaps(&range(5, 5, &[1])));
        assert!(f1.precedes(&range(10, 10, &[1])));
    }

    #[test]
    fn disjoint_ranges_share() {
        let config = FuConfig::default();
        let mut ranges = IndexedMap::new();
        let r0 = ranges.push(range(0, 0, &[1]));
        let r1 = ranges.push(range(0, 0, &[2]));
        let r2 = ranges.push(range(1, 1, &[3]));
        let cost = MergeCost {
            kind: FuKind::Adder,
            desc: config.desc(FuKind::Adder),
            max_fanin: 16,
        };
        let groups = CompatGraph::new(&ranges, [r0, r1, r2], cost).reduce();
        assert_eq!(groups.len(), 2);
        let shared = groups.iter().find(|g| g.len() == 2).unwrap();
        assert_eq!(shared[1], r2);
    }

    #[test]
    fn fanin_limit_prevents_merges() {
        let config = FuConfig::default();
        let mut ranges = IndexedMap::new();
        let r0 = ranges.push(range(0, 0, &[1, 2]));
        let r1 = ranges.push(range(1, 1, &[3]));
        let cost = MergeCost {
            kind: FuKind::Adder,
            desc: config.desc(FuKind::Adder),
            max_fanin: 2,
        };
        let groups = CompatGraph::new(&ranges, [r0, r1], cost).reduce();
        assert_eq!(groups, vec![vec![r0], vec![r1]]);
    }

    proptest::proptest! {
        #[test]
        fn reduction_keeps_groups_disjoint(
            spans in proptest::collection::vec((0..12u32, 0..4u32, 0..3u64), 1..10)
        ) {
            let config = FuConfig::default();
            let mut ranges = IndexedMap::new();
            let members: Vec<RangeIdx> = spans
                .iter()
                .map(|(begin, len, src)| ranges.push(range(*begin, begin + len, &[*src])))
                .collect();
            let cost = MergeCost {
                kind: FuKind::Adder,
                desc: config.desc(FuKind::Adder),
                max_fanin: 16,
            };
            let groups = CompatGraph::new(&ranges, members.clone(), cost).reduce();

            let mut seen: Vec<RangeIdx> = groups.iter().flatten().copied().collect();
            seen.sort();
            proptest::prop_assert_eq!(seen, members);
            for group in &groups {
                for (a, b) in group.iter().tuple_combinations() {
                    proptest::prop_assert!(!ranges[*a].overlaps(&ranges[*b]));
                }
            }
        }
    }
}
