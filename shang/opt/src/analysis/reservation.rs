use shang_ir::{self as ir, FuInstance, FuKind};
use std::collections::BTreeMap;

/// What a node competes for while it executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    /// Any instance of a class.
    Class(FuKind),
    /// One specific, pre-bound instance.
    Instance(FuInstance),
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKey::Class(kind) => write!(f, "{kind}"),
            ResourceKey::Instance(fu) => write!(f, "{fu}"),
        }
    }
}

/// The resource demand of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Demand {
    pub key: ResourceKey,
    /// Number of nodes that may use `key` in the same step.
    pub capacity: u32,
    /// Number of consecutive steps the node keeps the resource busy.
    pub occupancy: u32,
}

impl Demand {
    /// The demand of `node`, or `None` when it is not resource constrained.
    /// An exclusive unit stays reserved until the cycle after its result,
    /// when it is disabled.
    pub fn of(node: &ir::OpNode, config: &ir::FuConfig) -> Option<Demand> {
        if let Some(fu) = node.op.prebound {
            let desc = config.desc(fu.kind);
            let occupancy = if desc.exclusive {
                desc.occupancy.max(node.latency + 2)
            } else {
                desc.occupancy
            };
            return Some(Demand {
                key: ResourceKey::Instance(fu),
                capacity: 1,
                occupancy,
            });
        }
        let kind = node.fu_kind();
        if !kind.is_functional_unit() {
            return None;
        }
        let capacity = config.instances(kind)?;
        Some(Demand {
            key: ResourceKey::Class(kind),
            capacity,
            occupancy: config.desc(kind).occupancy,
        })
    }

    /// The steps (or modulo buckets) the node occupies when started at
    /// `step`, with their multiplicity.
    fn footprint(&self, step: u32, fold: Option<u32>) -> BTreeMap<usize, u32> {
        let mut counts = BTreeMap::new();
        for t in step..step + self.occupancy {
            *counts.entry(bucket(t, fold)).or_insert(0) += 1;
        }
        counts
    }
}

/// Bucket of step `t` in a table that is optionally folded modulo `II`.
pub(crate) fn bucket(t: u32, fold: Option<u32>) -> usize {
    match fold {
        Some(ii) => (t % ii) as usize,
        None => t as usize,
    }
}

/// Usage of every resource per step. Pipelined blocks fold the table
/// modulo their initiation interval, so alias steps share one entry.
#[derive(Debug, Clone, Default)]
pub struct ReservationTable {
    fold: Option<u32>,
    busy: BTreeMap<ResourceKey, Vec<u32>>,
}

impl ReservationTable {
    pub fn new(fold: Option<u32>) -> Self {
        Self {
            fold,
            busy: BTreeMap::new(),
        }
    }

    fn used(&self, key: &ResourceKey, bucket: usize) -> u32 {
        self.busy
            .get(key)
            .and_then(|v| v.get(bucket))
            .copied()
            .unwrap_or(0)
    }

    /// Whether a node with `demand` can start at `step`.
    pub fn is_free(&self, demand: &Demand, step: u32) -> bool {
        demand
            .footprint(step, self.fold)
            .into_iter()
            .all(|(b, n)| self.used(&demand.key, b) + n <= demand.capacity)
    }

    pub fn reserve(&mut self, demand: &Demand, step: u32) {
        let usage = self.busy.entry(demand.key).or_default();
        for (b, n) in demand.footprint(step, self.fold) {
            if usage.len() <= b {
                usage.resize(b + 1, 0);
            }
            usage[b] += n;
        }
    }
}
