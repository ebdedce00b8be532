use super::reservation::{Demand, ResourceKey, bucket};
use super::time_frame::{BlockInfo, Frame, TimeFrames};
use shang_ir as ir;
use std::collections::BTreeMap;

/// Expected usage of every resource per step, assuming every node is
/// equally likely to start anywhere in its frame.
#[derive(Debug, Clone, Default)]
pub struct DistributionGraph {
    fold: Option<u32>,
    density: BTreeMap<ResourceKey, Vec<f64>>,
}

impl DistributionGraph {
    pub fn build(
        graph: &ir::SchedGraph,
        info: &BlockInfo,
        frames: &TimeFrames,
        config: &ir::FuConfig,
    ) -> Self {
        let mut dg = DistributionGraph {
            fold: info.ii,
            density: BTreeMap::new(),
        };
        for &n in &info.order {
            if let Some(demand) = Demand::of(graph.node(n), config) {
                dg.add(&demand, frames.frame(n));
            }
        }
        dg
    }

    fn add(&mut self, demand: &Demand, frame: Frame) {
        let p = 1.0 / f64::from(frame.width());
        let fold = self.fold;
        let column = self.density.entry(demand.key).or_default();
        for s in frame.steps() {
            for t in s..s + demand.occupancy {
                let b = bucket(t, fold);
                if column.len() <= b {
                    column.resize(b + 1, 0.0);
                }
                column[b] += p;
            }
        }
    }

    /// Expected number of users of `key` in step `t`.
    pub fn density(&self, key: &ResourceKey, t: u32) -> f64 {
        self.density
            .get(key)
            .and_then(|column| column.get(bucket(t, self.fold)))
            .copied()
            .unwrap_or(0.0)
    }

    /// Density seen by a node with `demand` whose start is spread uniformly
    /// over `frame`.
    pub fn average(&self, demand: &Demand, frame: Frame) -> f64 {
        let total: f64 = frame
            .steps()
            .map(|s| {
                (s..s + demand.occupancy)
                    .map(|t| self.density(&demand.key, t))
                    .sum::<f64>()
            })
            .sum();
        total / f64::from(frame.width())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ir::FuKind;

    fn demand(occupancy: u32) -> Demand {
        Demand {
            key: ResourceKey::Class(FuKind::Adder),
            capacity: 1,
            occupancy,
        }
    }

    fn frame(asap: u32, alap: u32) -> Frame {
        Frame {
            asap,
            alap,
            capped: false,
        }
    }

    #[test]
    fn spreads_probability_over_the_frame() {
        let mut dg = DistributionGraph::default();
        dg.add(&demand(1), frame(0, 1));
        dg.add(&demand(1), frame(1, 1));
        let key = ResourceKey::Class(FuKind::Adder);
        assert_eq!(dg.density(&key, 0), 0.5);
        assert_eq!(dg.density(&key, 1), 1.5);
        assert_eq!(dg.density(&key, 7), 0.0);
        assert_eq!(dg.average(&demand(1), frame(0, 1)), 1.0);
        assert_eq!(dg.average(&demand(1), frame(0, 0)), 0.5);
    }

    #[test]
    fn folds_alias_steps() {
        let mut dg = DistributionGraph {
            fold: Some(2),
            density: BTreeMap::new(),
        };
        dg.add(&demand(2), frame(3, 3));
        let key = ResourceKey::Class(FuKind::Adder);
        assert_eq!(dg.density(&key, 0), 1.0);
        assert_eq!(dg.density(&key, 5), 1.0);
    }
}
