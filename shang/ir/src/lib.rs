//! Data model of the scheduling core: operation nodes, dependences, basic
//! blocks and the functional-unit table they are scheduled against.
mod builder;
mod context;
mod graph;
mod node;
mod resource;

pub use builder::GraphBuilder;
pub use context::Context;
pub use graph::{BasicBlock, DepKind, Dependence, SchedGraph};
pub use node::{
    BlockIdx, CmpPred, NodeIdx, NodeKind, OpNode, Opcode, Operand,
    OperandValue, Operands, Operation, ValueId,
};
pub use resource::{FuConfig, FuDesc, FuInstance, FuKind, MuxCost};
