//! Functional-unit and register classes, and the cost/latency table that
//! describes them.
use serde::{Deserialize, Serialize};
use shang_utils::{Error, ShangResult, bits_needed_for};
use std::collections::BTreeMap;

/// A sharable resource kind.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum FuKind {
    /// General purpose register holding a value across states.
    Register,
    Adder,
    Comparator,
    Multiplier,
    Shifter,
    /// External memory port. Usually pre-bound.
    MemoryBus,
    /// Glue logic (bitwise operations, copies, branches). Never shared and
    /// never resource constrained.
    Trivial,
}

impl FuKind {
    pub const ALL: [FuKind; 7] = [
        FuKind::Register,
        FuKind::Adder,
        FuKind::Comparator,
        FuKind::Multiplier,
        FuKind::Shifter,
        FuKind::MemoryBus,
        FuKind::Trivial,
    ];

    /// Functional units that carry out operations, as opposed to storage.
    pub fn is_functional_unit(&self) -> bool {
        !matches!(self, FuKind::Register | FuKind::Trivial)
    }

    pub fn name(&self) -> &'static str {
        match self {
            FuKind::Register => "register",
            FuKind::Adder => "adder",
            FuKind::Comparator => "comparator",
            FuKind::Multiplier => "multiplier",
            FuKind::Shifter => "shifter",
            FuKind::MemoryBus => "memory-bus",
            FuKind::Trivial => "trivial",
        }
    }
}

impl std::fmt::Display for FuKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A concrete instance of a functional unit an operation is pre-bound to,
/// e.g. "memory port 0".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FuInstance {
    pub kind: FuKind,
    pub index: u32,
}

impl FuInstance {
    pub fn new(kind: FuKind, index: u32) -> Self {
        Self { kind, index }
    }
}

impl std::fmt::Display for FuInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.index)
    }
}

/// Cost of a multiplexer in front of a shared resource as a function of its
/// fan-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxCost {
    /// Cost per select bit.
    pub base: u64,
    /// Cost per data input bit.
    pub per_input: u64,
}

impl MuxCost {
    /// Cost of a `fanin`-to-1 multiplexer of `width` bits. A single input needs
    /// no multiplexer.
    pub fn cost(&self, fanin: usize, width: u32) -> u64 {
        if fanin <= 1 {
            return 0;
        }
        let fanin = fanin as u64;
        self.base * bits_needed_for(fanin)
            + self.per_input * fanin * u64::from(width)
    }
}

impl Default for MuxCost {
    fn default() -> Self {
        MuxCost {
            base: 2,
            per_input: 1,
        }
    }
}

/// Description of one resource class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuDesc {
    /// `(maximum operand width, latency)` pairs, sorted by width. Operations
    /// wider than every entry use the last latency.
    pub latencies: Vec<(u32, u32)>,
    /// Number of cycles an instance is busy after accepting an operation.
    pub occupancy: u32,
    /// Number of available instances. `None` means unbounded.
    pub instances: Option<u32>,
    /// Area cost of one instance: `base_cost + cost_per_bit * width`.
    pub base_cost: u64,
    pub cost_per_bit: u64,
    pub mux: MuxCost,
    /// Merges that would need a wider multiplexer are never performed.
    pub max_mux_fanin: u32,
    /// The unit must be explicitly disabled after its result is read.
    pub exclusive: bool,
    /// The unit only drives its result during the finishing cycle, so the
    /// result must be copied into a register at that cycle.
    pub write_until_finish: bool,
}

impl Default for FuDesc {
    fn default() -> Self {
        FuDesc {
            latencies: vec![(u32::MAX, 0)],
            occupancy: 1,
            instances: None,
            base_cost: 0,
            cost_per_bit: 0,
            mux: MuxCost::default(),
            max_mux_fanin: 16,
            exclusive: false,
            write_until_finish: false,
        }
    }
}

impl FuDesc {
    /// Latency of an operation whose widest operand is `width` bits.
    pub fn latency(&self, width: u32) -> u32 {
        self.latencies
            .iter()
            .find(|(max_width, _)| width <= *max_width)
            .or(self.latencies.last())
            .map(|(_, lat)| *lat)
            .unwrap_or(0)
    }

    /// Area of one instance of `width` bits.
    pub fn cost(&self, width: u32) -> u64 {
        self.base_cost + self.cost_per_bit * u64::from(width)
    }

    fn check(&self, kind: FuKind) -> ShangResult<()> {
        if self.occupancy == 0 {
            return Err(Error::invalid_config(format!(
                "occupancy of `{kind}' must be positive"
            )));
        }
        if self.instances == Some(0) {
            return Err(Error::invalid_config(format!(
                "`{kind}' needs at least one instance"
            )));
        }
        if self.latencies.is_empty() {
            return Err(Error::invalid_config(format!(
                "`{kind}' has an empty latency table"
            )));
        }
        if !self.latencies.windows(2).all(|w| w[0].0 < w[1].0) {
            return Err(Error::invalid_config(format!(
                "latency table of `{kind}' is not sorted by width"
            )));
        }
        Ok(())
    }
}

/// The functional-unit cost/latency table. Read-only once handed to the
/// scheduler; shared by every decision made for one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FuConfig {
    units: BTreeMap<FuKind, FuDesc>,
}

impl Default for FuConfig {
    fn default() -> Self {
        let units = [
            (
                FuKind::Register,
                FuDesc {
                    cost_per_bit: 6,
                    max_mux_fanin: 8,
                    ..Default::default()
                },
            ),
            (
                FuKind::Adder,
                FuDesc {
                    latencies: vec![(16, 0), (u32::MAX, 1)],
                    instances: Some(2),
                    base_cost: 8,
                    cost_per_bit: 12,
                    ..Default::default()
                },
            ),
            (
                FuKind::Comparator,
                FuDesc {
                    latencies: vec![(u32::MAX, 0)],
                    instances: Some(2),
                    base_cost: 4,
                    cost_per_bit: 8,
                    ..Default::default()
                },
            ),
            (
                FuKind::Multiplier,
                FuDesc {
                    latencies: vec![(8, 1), (32, 2), (u32::MAX, 4)],
                    instances: Some(1),
                    base_cost: 64,
                    cost_per_bit: 96,
                    ..Default::default()
                },
            ),
            (
                FuKind::Shifter,
                FuDesc {
                    latencies: vec![(32, 0), (u32::MAX, 1)],
                    instances: Some(1),
                    base_cost: 16,
                    cost_per_bit: 20,
                    ..Default::default()
                },
            ),
            (
                FuKind::MemoryBus,
                FuDesc {
                    latencies: vec![(u32::MAX, 2)],
                    instances: Some(1),
                    base_cost: 128,
                    exclusive: true,
                    write_until_finish: true,
                    max_mux_fanin: 32,
                    ..Default::default()
                },
            ),
            (FuKind::Trivial, FuDesc::default()),
        ];
        FuConfig {
            units: units.into_iter().collect(),
        }
    }
}

impl FuConfig {
    /// Build a table from explicit descriptions. Classes that are not given
    /// fall back to the default table.
    pub fn new<I>(units: I) -> ShangResult<Self>
    where
        I: IntoIterator<Item = (FuKind, FuDesc)>,
    {
        let mut config = FuConfig::default();
        for (kind, desc) in units {
            config.units.insert(kind, desc);
        }
        config.validate()?;
        Ok(config)
    }

    /// Check that every description is usable.
    pub fn validate(&self) -> ShangResult<()> {
        for kind in FuKind::ALL {
            let Some(desc) = self.units.get(&kind) else {
                return Err(Error::invalid_config(format!(
                    "no description for `{kind}'"
                )));
            };
            desc.check(kind)?;
        }
        Ok(())
    }

    /// The description for `kind`. A deserialized table may omit classes, in
    /// which case the trivial default is used.
    pub fn desc(&self, kind: FuKind) -> &FuDesc {
        static FALLBACK: std::sync::OnceLock<FuDesc> =
            std::sync::OnceLock::new();
        self.units
            .get(&kind)
            .unwrap_or_else(|| FALLBACK.get_or_init(FuDesc::default))
    }

    /// Number of instances available for `kind`, if bounded.
    pub fn instances(&self, kind: FuKind) -> Option<u32> {
        if kind == FuKind::Trivial {
            None
        } else {
            self.desc(kind).instances
        }
    }
}
