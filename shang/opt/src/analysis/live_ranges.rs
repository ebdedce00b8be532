//! Value definitions and the reads that consume them.
//!
//! Every value starts out with one [ValueDef] (its `Original` link). Later
//! passes append links that carry the same value further in time: loop
//! boundary merges, register copies and read-results of pre-bound units.
//! The links of one `(block, value)` pair form a chain sorted by the slot
//! they become visible at; the successor of a link is its neighbour in that
//! chain.
use serde::Serialize;
use shang_idx::{impl_index, maps::IndexedMap};
use shang_ir::{BlockIdx, NodeIdx, ValueId};
use std::collections::{BTreeMap, HashMap};

/// Index of a [ValueDef].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DefIdx(u32);
impl_index!(DefIdx);

/// Index of a [ReadSite].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ReadIdx(u32);
impl_index!(ReadIdx);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefCategory {
    /// Produced by the operation that defines the value.
    Original,
    /// Register-to-register copy restarting a chain.
    Copy,
    /// Loop-boundary merge of a pipelined block.
    Phi,
    /// Output of a pre-bound unit moved into a general register.
    ReadResult,
}

/// One link of a value chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueDef {
    /// The value carried by the link.
    pub value: ValueId,
    /// The node writing the link.
    pub node: NodeIdx,
    pub block: BlockIdx,
    /// First slot the link can be read in, combinationally.
    pub chain_start: u32,
    /// First slot the link can be read from a register.
    pub finish: u32,
    /// The link is held in a register from `finish` on. Unregistered links
    /// are wires that only exist during `chain_start`.
    pub registered: bool,
    /// The value is driven by a pre-bound unit and was moved out of it.
    pub chained_with_fu: bool,
    pub category: DefCategory,
}

impl ValueDef {
    pub fn readable_at(&self, slot: u32) -> bool {
        slot == self.chain_start || (self.registered && slot >= self.finish)
    }
}

/// A read of a value by an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSite {
    pub reader: NodeIdx,
    pub value: ValueId,
    /// Block of the reader.
    pub block: BlockIdx,
    /// Slot of the state the reader executes in.
    pub issue: u32,
    /// Slot of the read as seen by the iteration that defines the value.
    /// Equal to `issue` unless the read is loop carried.
    pub slot: u32,
    pub distance: u32,
    /// The reader is sequenced by the FSM.
    pub control: bool,
    /// The link the read is served by.
    pub def: DefIdx,
}

/// How a read obtains its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    /// Combinationally, in the slot the link is computed.
    Wire(DefIdx),
    /// From the register holding the link.
    Register(DefIdx),
}

impl Resolved {
    pub fn def(&self) -> DefIdx {
        match self {
            Resolved::Wire(d) | Resolved::Register(d) => *d,
        }
    }
}

/// All value links and reads of a function.
#[derive(Debug, Clone, Default)]
pub struct LiveRanges {
    defs: IndexedMap<DefIdx, ValueDef>,
    reads: IndexedMap<ReadIdx, ReadSite>,
    chains: BTreeMap<(BlockIdx, ValueId), Vec<DefIdx>>,
    origins: HashMap<ValueId, DefIdx>,
}

impl LiveRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a link. It is placed after every link of its chain that starts
    /// no later than it does.
    pub fn add_def(&mut self, def: ValueDef) -> DefIdx {
        let key = (def.block, def.value);
        let (start, category, value) = (def.chain_start, def.category, def.value);
        let idx = self.defs.push(def);
        let chain = self.chains.entry(key).or_default();
        let at = chain.partition_point(|d| self.defs[*d].chain_start <= start);
        chain.insert(at, idx);
        if category == DefCategory::Original {
            self.origins.insert(value, idx);
        }
        idx
    }

    pub fn def(&self, idx: DefIdx) -> &ValueDef {
        &self.defs[idx]
    }

    pub fn def_mut(&mut self, idx: DefIdx) -> &mut ValueDef {
        &mut self.defs[idx]
    }

    pub fn defs(&self) -> impl Iterator<Item = (DefIdx, &ValueDef)> {
        self.defs.iter()
    }

    pub fn def_count(&self) -> usize {
        self.defs.len()
    }

    /// The link created by the operation defining `value`.
    pub fn origin(&self, value: ValueId) -> Option<DefIdx> {
        self.origins.get(&value).copied()
    }

    pub fn chain(&self, block: BlockIdx, value: ValueId) -> &[DefIdx] {
        self.chains
            .get(&(block, value))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The link following `idx` in its chain.
    pub fn next(&self, idx: DefIdx) -> Option<DefIdx> {
        let def = &self.defs[idx];
        let chain = self.chain(def.block, def.value);
        let pos = chain.iter().position(|d| *d == idx)?;
        chain.get(pos + 1).copied()
    }

    /// The last link of `value` in `block`.
    pub fn last(&self, block: BlockIdx, value: ValueId) -> Option<DefIdx> {
        self.chain(block, value).last().copied()
    }

    /// The latest link of `value` in `block` visible at `slot`.
    pub fn latest_at(
        &self,
        block: BlockIdx,
        value: ValueId,
        slot: u32,
    ) -> Option<DefIdx> {
        let chain = self.chain(block, value);
        let at = chain.partition_point(|d| self.defs[*d].chain_start <= slot);
        at.checked_sub(1).map(|i| chain[i])
    }

    /// The link of `value` in `block` starting exactly at `slot`.
    pub fn find(
        &self,
        block: BlockIdx,
        value: ValueId,
        slot: u32,
        category: DefCategory,
    ) -> Option<DefIdx> {
        self.chain(block, value).iter().copied().find(|d| {
            let def = &self.defs[*d];
            def.chain_start == slot && def.category == category
        })
    }

    pub fn add_read(&mut self, read: ReadSite) -> ReadIdx {
        self.reads.push(read)
    }

    pub fn read(&self, idx: ReadIdx) -> &ReadSite {
        &self.reads[idx]
    }

    pub fn reads(&self) -> impl Iterator<Item = (ReadIdx, &ReadSite)> {
        self.reads.iter()
    }

    pub fn read_count(&self) -> usize {
        self.reads.len()
    }

    /// Serve `read` from `def` instead.
    pub fn retarget(&mut self, read: ReadIdx, def: DefIdx) {
        self.reads[read].def = def;
    }

    /// Reads currently served by `def`.
    pub fn reads_of(&self, def: DefIdx) -> impl Iterator<Item = (ReadIdx, &ReadSite)> {
        self.reads.iter().filter(move |(_, r)| r.def == def)
    }

    /// How `read` obtains its value.
    pub fn resolve(&self, read: ReadIdx) -> Resolved {
        let site = &self.reads[read];
        let def = &self.defs[site.def];
        if def.block == site.block
            && site.slot == def.chain_start
            && !(def.registered && site.slot >= def.finish)
        {
            Resolved::Wire(site.def)
        } else {
            Resolved::Register(site.def)
        }
    }
}
