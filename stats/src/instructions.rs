use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(
    Debug,
    strum::EnumIter,
    strum::EnumCount,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum OpcodeKind {
    StreamRead,
    IndirectRead,
    IndirectWrite,
    IndirectReadModifyWrite,
    RangeGenerate,
    AluScalar,
    AluVector,
    Invalidate,
}

/// Number of instructions dispatched and retired, per opcode.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionCounts(pub HashMap<OpcodeKind, u64>);

impl InstructionCounts {
    pub fn inc(&mut self, opcode: OpcodeKind, count: u64) {
        *self.0.entry(opcode).or_insert(0) += count;
    }

    #[must_use]
    pub fn get_total(&self, opcode: OpcodeKind) -> u64 {
        self.0.get(&opcode).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }
}

impl std::ops::AddAssign for InstructionCounts {
    fn add_assign(&mut self, other: Self) {
        for (opcode, count) in other.0 {
            *self.0.entry(opcode).or_insert(0) += count;
        }
    }
}
