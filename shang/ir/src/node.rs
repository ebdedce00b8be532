use crate::resource::{FuInstance, FuKind};
use serde::Serialize;
use shang_idx::impl_index;
use smallvec::SmallVec;

/// Index of an operation node in a [SchedGraph](crate::SchedGraph).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
)]
pub struct NodeIdx(u32);
impl_index!(NodeIdx, "n");

/// Index of a basic block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
)]
pub struct BlockIdx(u32);
impl_index!(BlockIdx, "bb");

/// An SSA value produced by at most one node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
)]
pub struct ValueId(u32);
impl_index!(ValueId, "v");

/// Predicate of a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CmpPred {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Opcode of an operation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    /// Function input, available from the first state of the entry block.
    Arg,
    Add,
    Sub,
    Mul,
    Shl,
    Lshr,
    Ashr,
    Cmp(CmpPred),
    And,
    Or,
    Xor,
    Not,
    Select,
    Load,
    Store,
    Br,
    Ret,
    /// Register-to-register move inserted to restart a chain.
    Copy,
    /// Loop-carried merge at an iteration boundary.
    Phi,
    /// Moves the output of a pre-bound unit into a general register.
    ReadFu,
    /// Releases an exclusive unit.
    Disable,
}

impl Opcode {
    /// The resource class that executes this opcode.
    pub fn fu_kind(&self) -> FuKind {
        match self {
            Opcode::Add | Opcode::Sub => FuKind::Adder,
            Opcode::Mul => FuKind::Multiplier,
            Opcode::Shl | Opcode::Lshr | Opcode::Ashr => FuKind::Shifter,
            Opcode::Cmp(_) => FuKind::Comparator,
            Opcode::Load | Opcode::Store => FuKind::MemoryBus,
            Opcode::Arg
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Not
            | Opcode::Select
            | Opcode::Br
            | Opcode::Ret
            | Opcode::Copy
            | Opcode::Phi
            | Opcode::ReadFu
            | Opcode::Disable => FuKind::Trivial,
        }
    }

    /// Whether the opcode defines a value.
    pub fn produces_value(&self) -> bool {
        !matches!(
            self,
            Opcode::Store | Opcode::Br | Opcode::Ret | Opcode::Disable
        )
    }

    /// Operations the FSM must sequence explicitly, independently of their
    /// latency.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Opcode::Load
                | Opcode::Store
                | Opcode::Br
                | Opcode::Ret
                | Opcode::Copy
                | Opcode::Phi
                | Opcode::ReadFu
                | Opcode::Disable
        )
    }

    /// Operations that can be merged with a structurally identical twin.
    pub fn is_pure(&self) -> bool {
        !self.is_control() && !matches!(self, Opcode::Arg)
    }

    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Mul
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Cmp(CmpPred::Eq)
                | Opcode::Cmp(CmpPred::Ne)
        )
    }

    /// Opcodes only created by the scheduling passes themselves.
    pub fn is_synthesized(&self) -> bool {
        matches!(
            self,
            Opcode::Copy | Opcode::Phi | Opcode::ReadFu | Opcode::Disable
        )
    }
}

/// Whether a node is sequenced by the FSM or is pure combinational logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Control,
    Datapath,
}

/// The value an operand reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperandValue {
    Value(ValueId),
    Imm(u64),
}

/// One operand of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub value: OperandValue,
    pub width: u32,
    pub signed: bool,
    /// The operand is only meaningful when this 1-bit value is set.
    pub predicate: Option<ValueId>,
}

impl Operand {
    pub fn value(value: ValueId, width: u32) -> Self {
        Operand {
            value: OperandValue::Value(value),
            width,
            signed: false,
            predicate: None,
        }
    }

    pub fn imm(value: u64, width: u32) -> Self {
        Operand {
            value: OperandValue::Imm(value),
            width,
            signed: false,
            predicate: None,
        }
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn with_predicate(mut self, pred: ValueId) -> Self {
        self.predicate = Some(pred);
        self
    }

    /// Every value this operand reads, the predicate included.
    pub fn reads(&self) -> impl Iterator<Item = ValueId> {
        let value = match self.value {
            OperandValue::Value(v) => Some(v),
            OperandValue::Imm(_) => None,
        };
        value.into_iter().chain(self.predicate)
    }
}

pub type Operands = SmallVec<[Operand; 3]>;

/// An operation as supplied by the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub opcode: Opcode,
    pub operands: Operands,
    /// Width of the result.
    pub width: u32,
    /// The value this operation defines. When `None` and the opcode defines
    /// a value, a fresh one is allocated by the graph.
    pub result: Option<ValueId>,
    /// The whole operation is guarded by this 1-bit value.
    pub guard: Option<ValueId>,
    /// The operation must execute on this unit instance.
    pub prebound: Option<FuInstance>,
    /// The result is not read by anything reachable but the operation must
    /// still be emitted.
    pub dangling: bool,
}

impl Operation {
    pub fn new<I>(opcode: Opcode, operands: I, width: u32) -> Self
    where
        I: IntoIterator<Item = Operand>,
    {
        Operation {
            opcode,
            operands: operands.into_iter().collect(),
            width,
            result: None,
            guard: None,
            prebound: None,
            dangling: false,
        }
    }

    pub fn defining(mut self, value: ValueId) -> Self {
        self.result = Some(value);
        self
    }

    pub fn guarded(mut self, guard: ValueId) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn bound_to(mut self, fu: FuInstance) -> Self {
        self.prebound = Some(fu);
        self
    }

    pub fn dangling(mut self) -> Self {
        self.dangling = true;
        self
    }

    /// Width used to look up latency and cost: the widest operand or the
    /// result, whichever is larger.
    pub fn datapath_width(&self) -> u32 {
        self.operands
            .iter()
            .map(|op| op.width)
            .chain(std::iter::once(self.width))
            .max()
            .unwrap_or(self.width)
    }

    /// Every value read by this operation, in operand order, guard last.
    pub fn reads(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.operands
            .iter()
            .flat_map(Operand::reads)
            .chain(self.guard)
    }
}

/// A node of the scheduling graph: an operation plus what the scheduler
/// knows about it.
#[derive(Debug, Clone)]
pub struct OpNode {
    pub op: Operation,
    /// Intrinsic latency, fixed when the node is created.
    pub latency: u32,
    pub kind: NodeKind,
    pub block: BlockIdx,
    /// Committed block-relative step.
    step: Option<u32>,
}

impl OpNode {
    pub(crate) fn new(
        op: Operation,
        latency: u32,
        block: BlockIdx,
        step: Option<u32>,
    ) -> Self {
        let kind = if op.opcode.is_control()
            || latency > 0
            || op.prebound.is_some()
        {
            NodeKind::Control
        } else {
            NodeKind::Datapath
        };
        OpNode {
            op,
            latency,
            kind,
            block,
            step,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.op.opcode
    }

    pub fn result(&self) -> Option<ValueId> {
        self.op.result
    }

    pub fn fu_kind(&self) -> FuKind {
        self.op
            .prebound
            .map(|fu| fu.kind)
            .unwrap_or_else(|| self.op.opcode.fu_kind())
    }

    /// The committed block-relative step, if any.
    pub fn step(&self) -> Option<u32> {
        self.step
    }

    pub(crate) fn set_step(&mut self, step: Option<u32>) {
        self.step = step;
    }

    pub fn is_datapath(&self) -> bool {
        self.kind == NodeKind::Datapath
    }
}
