//! Vector/scalar ALU over scratchpad tiles. Elements stream through
//! `num_lanes` parallel lanes, each lane taking `lane_latency` cycles.

use super::{ExecContext, Retired};
use crate::instruction::{DataType, Instruction, OpType, Opcode};

/// Apply one ALU operation to two 32-bit words.
///
/// Comparison results are 0/1 in both data types; integer overflow wraps and
/// division by zero yields 0.
#[must_use]
pub fn apply(op: OpType, datatype: DataType, lhs: u32, rhs: u32) -> u32 {
    match datatype {
        DataType::Int32 => {
            let (a, b) = (lhs as i32, rhs as i32);
            match op {
                OpType::Add => a.wrapping_add(b) as u32,
                OpType::Sub => a.wrapping_sub(b) as u32,
                OpType::Mul => a.wrapping_mul(b) as u32,
                OpType::Div => a.checked_div(b).unwrap_or(0) as u32,
                OpType::Min => a.min(b) as u32,
                OpType::Max => a.max(b) as u32,
                OpType::Gt => u32::from(a > b),
                OpType::Gte => u32::from(a >= b),
                OpType::Lt => u32::from(a < b),
                OpType::Lte => u32::from(a <= b),
                OpType::Eq => u32::from(a == b),
            }
        }
        DataType::Float32 => {
            let (a, b) = (f32::from_bits(lhs), f32::from_bits(rhs));
            match op {
                OpType::Add => (a + b).to_bits(),
                OpType::Sub => (a - b).to_bits(),
                OpType::Mul => (a * b).to_bits(),
                OpType::Div => (a / b).to_bits(),
                OpType::Min => a.min(b).to_bits(),
                OpType::Max => a.max(b).to_bits(),
                OpType::Gt => u32::from(a > b),
                OpType::Gte => u32::from(a >= b),
                OpType::Lt => u32::from(a < b),
                OpType::Lte => u32::from(a <= b),
                OpType::Eq => u32::from(a == b),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Decode,
    Work { done_at: u64 },
}

#[derive(Debug)]
pub struct AluUnit {
    unit_id: usize,
    num_lanes: usize,
    lane_latency: u64,
    state: State,
    instruction: Option<Instruction>,
    my_max: usize,
}

impl AluUnit {
    #[must_use]
    pub fn new(unit_id: usize, num_lanes: usize, lane_latency: u64) -> Self {
        Self {
            unit_id,
            num_lanes,
            lane_latency,
            state: State::Idle,
            instruction: None,
            my_max: 0,
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    pub fn assign(&mut self, instruction: Instruction) {
        assert!(self.is_idle());
        log::debug!("A[{}] assigned {}", self.unit_id, instruction);
        self.instruction = Some(instruction);
        self.state = State::Decode;
    }

    pub fn cycle(&mut self, ctx: &mut ExecContext) -> Option<Retired> {
        match self.state {
            State::Idle => None,
            State::Decode => {
                let instruction = self.instruction.as_ref().unwrap();
                // dispatch gating covers src1/src2; the condition tile is
                // checked here and simply stalls the unit until produced
                if let Some(cond) = instruction.cond_tile {
                    if !ctx.spd.get_ready(cond) {
                        return None;
                    }
                }
                let src1 = instruction.src1_tile.expect("ALU without src1 tile");
                self.my_max = ctx.spd.get_size(src1) as usize;
                if let Some(src2) = instruction.src2_tile {
                    assert_eq!(
                        self.my_max,
                        ctx.spd.get_size(src2) as usize,
                        "src1/src2 size mismatch"
                    );
                }
                let inputs = 1 + instruction.src2_tile.is_some() as u64
                    + instruction.cond_tile.is_some() as u64;
                let accesses = self.my_max as u64 * inputs;
                let (read_done, conflict) = ctx.spd.book_read(ctx.cycle, accesses);
                ctx.stats.spd.reads += accesses;
                ctx.stats.spd.port_conflicts += u64::from(conflict);
                let lanes = self.num_lanes as u64;
                let work = (self.my_max as u64).div_ceil(lanes) * self.lane_latency;
                let done_at = if instruction.opcode == Opcode::AluVector {
                    let (write_done, _) = ctx.spd.book_write(read_done + work, self.my_max as u64);
                    ctx.stats.spd.writes += self.my_max as u64;
                    write_done
                } else {
                    read_done + work
                };
                self.state = State::Work { done_at };
                None
            }
            State::Work { done_at } => {
                if ctx.cycle < done_at {
                    return None;
                }
                let instruction = self.instruction.take().unwrap();
                match instruction.opcode {
                    Opcode::AluVector => self.execute_vector(&instruction, ctx),
                    Opcode::AluScalar => self.execute_scalar(&instruction, ctx),
                    opcode => unreachable!("ALU given {opcode:?}"),
                }
                log::debug!("A[{}] finished {}", self.unit_id, instruction);
                self.state = State::Idle;
                Some(Retired {
                    slot: instruction.slot,
                    opcode: instruction.opcode,
                    dst1_tile: instruction.dst1_tile,
                    dst2_tile: None,
                })
            }
        }
    }

    /// Elementwise over one or two tiles (or a tile and a scalar register);
    /// the condition tile gates which destination elements are written.
    fn execute_vector(&self, instruction: &Instruction, ctx: &mut ExecContext) {
        let op = instruction.op.unwrap();
        let src1 = instruction.src1_tile.unwrap();
        let dst = instruction.dst1_tile.expect("vector ALU without dst tile");
        for i in 0..self.my_max {
            if let Some(cond) = instruction.cond_tile {
                if ctx.spd.get_data(cond, i) == 0 {
                    continue;
                }
            }
            let lhs = ctx.spd.get_data(src1, i);
            let rhs = match instruction.src2_tile {
                Some(src2) => ctx.spd.get_data(src2, i),
                None => ctx.rf.get(instruction.src1_reg.expect("vector ALU scalar operand")),
            };
            ctx.spd.set_data(dst, i, apply(op, instruction.datatype, lhs, rhs));
        }
        ctx.spd.set_size(dst, self.my_max as u16);
    }

    /// Reduce the source tile through the operation into a register.
    fn execute_scalar(&self, instruction: &Instruction, ctx: &mut ExecContext) {
        let op = instruction.op.unwrap();
        let src1 = instruction.src1_tile.unwrap();
        let dst_reg = instruction.dst1_reg.expect("scalar ALU without dst reg");
        let mut acc: Option<u32> = None;
        for i in 0..self.my_max {
            if let Some(cond) = instruction.cond_tile {
                if ctx.spd.get_data(cond, i) == 0 {
                    continue;
                }
            }
            let value = ctx.spd.get_data(src1, i);
            acc = Some(match acc {
                None => value,
                Some(acc) => apply(op, instruction.datatype, acc, value),
            });
        }
        ctx.rf.set(dst_reg, acc.unwrap_or(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_ops_wrap_and_compare_to_flags() {
        assert_eq!(apply(OpType::Add, DataType::Int32, 3, 4), 7);
        assert_eq!(
            apply(OpType::Add, DataType::Int32, i32::MAX as u32, 1),
            i32::MIN as u32
        );
        assert_eq!(apply(OpType::Div, DataType::Int32, 7, 0), 0);
        assert_eq!(apply(OpType::Lt, DataType::Int32, (-1i32) as u32, 1), 1);
        assert_eq!(apply(OpType::Eq, DataType::Int32, 5, 5), 1);
    }

    #[test]
    fn float_ops_work_on_bit_patterns() {
        let a = 1.5f32.to_bits();
        let b = 2.25f32.to_bits();
        assert_eq!(apply(OpType::Add, DataType::Float32, a, b), 3.75f32.to_bits());
        assert_eq!(apply(OpType::Max, DataType::Float32, a, b), b);
        assert_eq!(apply(OpType::Gte, DataType::Float32, a, b), 0);
    }
}
