//! Range unit: fuses a two-level loop nest described by per-element
//! (min, max) tiles and a stride register into flat (i, j) index tiles.
//! No downstream memory traffic; the loop cursors persist in the
//! destination registers so a follow-up instruction resumes where a full
//! output tile stopped the loop.

use super::{ExecContext, Retired};
use crate::instruction::Instruction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Decode,
    Work { done_at: u64 },
}

#[derive(Debug)]
pub struct RangeUnit {
    unit_id: usize,
    num_tile_elements: usize,
    state: State,
    instruction: Option<Instruction>,
}

impl RangeUnit {
    #[must_use]
    pub fn new(unit_id: usize, num_tile_elements: usize) -> Self {
        Self {
            unit_id,
            num_tile_elements,
            state: State::Idle,
            instruction: None,
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    pub fn assign(&mut self, instruction: Instruction) {
        assert!(self.is_idle());
        log::debug!("R[{}] assigned {}", self.unit_id, instruction);
        self.instruction = Some(instruction);
        self.state = State::Decode;
    }

    pub fn cycle(&mut self, ctx: &mut ExecContext) -> Option<Retired> {
        match self.state {
            State::Idle => None,
            State::Decode => {
                let instruction = self.instruction.as_ref().unwrap();
                if let Some(cond) = instruction.cond_tile {
                    if !ctx.spd.get_ready(cond) {
                        return None;
                    }
                }
                let min_tile = instruction.src1_tile.expect("range without min tile");
                let max_i = ctx.spd.get_size(min_tile) as u64;
                let (read_done, conflict) = ctx.spd.book_read(ctx.cycle, 2 * max_i);
                ctx.stats.spd.reads += 2 * max_i;
                ctx.stats.spd.port_conflicts += u64::from(conflict);
                let (write_done, _) =
                    ctx.spd.book_write(read_done, 2 * self.num_tile_elements as u64);
                ctx.stats.spd.writes += 2 * self.num_tile_elements as u64;
                self.state = State::Work {
                    done_at: write_done,
                };
                None
            }
            State::Work { done_at } => {
                if ctx.cycle < done_at {
                    return None;
                }
                let instruction = self.instruction.take().unwrap();
                self.execute(&instruction, ctx);
                self.state = State::Idle;
                Some(Retired {
                    slot: instruction.slot,
                    opcode: instruction.opcode,
                    dst1_tile: instruction.dst1_tile,
                    dst2_tile: instruction.dst2_tile,
                })
            }
        }
    }

    fn execute(&self, instruction: &Instruction, ctx: &mut ExecContext) {
        let dst_i = instruction.dst1_tile.expect("range without dst i tile");
        let dst_j = instruction.dst2_tile.expect("range without dst j tile");
        let min_tile = instruction.src1_tile.unwrap();
        let max_tile = instruction.src2_tile.expect("range without max tile");
        let last_i_reg = instruction.dst1_reg.expect("range without i cursor reg");
        let last_j_reg = instruction.dst2_reg.expect("range without j cursor reg");
        let stride_reg = instruction.src1_reg.expect("range without stride reg");

        let mut last_i = i64::from(ctx.rf.get_signed(last_i_reg));
        // -1 marks "restart j from the min tile"
        let mut last_j = i64::from(ctx.rf.get_signed(last_j_reg));
        let stride = i64::from(ctx.rf.get_signed(stride_reg));
        assert!(stride > 0, "range stride must be positive");

        let max_i = i64::from(ctx.spd.get_size(min_tile));
        assert_eq!(
            max_i,
            i64::from(ctx.spd.get_size(max_tile)),
            "min/max tile size mismatch"
        );

        let mut idx_j = 0usize;
        while last_i < max_i && idx_j < self.num_tile_elements {
            let i = last_i as usize;
            let taken = instruction
                .cond_tile
                .map_or(true, |cond| ctx.spd.get_data(cond, i) != 0);
            if taken {
                if last_j == -1 {
                    last_j = i64::from(ctx.spd.get_data(min_tile, i));
                }
                let max_j = i64::from(ctx.spd.get_data(max_tile, i));
                while last_j < max_j && idx_j < self.num_tile_elements {
                    ctx.spd.set_data(dst_i, idx_j, last_i as u32);
                    ctx.spd.set_data(dst_j, idx_j, last_j as u32);
                    last_j += stride;
                    idx_j += 1;
                }
                if last_j >= max_j {
                    last_j = -1;
                } else {
                    // output tiles are full mid-row; the cursors resume here
                    break;
                }
            }
            last_i += 1;
        }

        ctx.rf.set_signed(last_i_reg, last_i as i32);
        ctx.rf.set_signed(last_j_reg, last_j as i32);
        ctx.spd.set_size(dst_i, idx_j as u16);
        ctx.spd.set_size(dst_j, idx_j as u16);
        log::debug!(
            "R[{}] produced {} pairs, cursors i={} j={}",
            self.unit_id,
            idx_j,
            last_i,
            last_j
        );
    }
}
