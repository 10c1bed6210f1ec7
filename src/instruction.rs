//! Decoded accelerator instructions and the instruction file holding them
//! between the CPU-side push and dispatch to an execution unit.

use super::address;

pub const NONE_BYTE: u8 = 0xff;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::EnumIter,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum Opcode {
    StreamRead = 0,
    IndirectRead = 1,
    IndirectWrite = 2,
    IndirectReadModifyWrite = 3,
    RangeGenerate = 4,
    AluScalar = 5,
    AluVector = 6,
    Invalidate = 7,
}

impl Opcode {
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Opcode::StreamRead),
            1 => Some(Opcode::IndirectRead),
            2 => Some(Opcode::IndirectWrite),
            3 => Some(Opcode::IndirectReadModifyWrite),
            4 => Some(Opcode::RangeGenerate),
            5 => Some(Opcode::AluScalar),
            6 => Some(Opcode::AluVector),
            7 => Some(Opcode::Invalidate),
            _ => None,
        }
    }

    #[must_use]
    pub fn func_unit(self) -> FuncUnitKind {
        match self {
            Opcode::StreamRead => FuncUnitKind::Stream,
            Opcode::IndirectRead | Opcode::IndirectWrite | Opcode::IndirectReadModifyWrite => {
                FuncUnitKind::Indirect
            }
            Opcode::RangeGenerate => FuncUnitKind::Range,
            Opcode::AluScalar | Opcode::AluVector => FuncUnitKind::Alu,
            Opcode::Invalidate => FuncUnitKind::Invalidator,
        }
    }
}

impl From<Opcode> for stats::instructions::OpcodeKind {
    fn from(opcode: Opcode) -> Self {
        match opcode {
            Opcode::StreamRead => Self::StreamRead,
            Opcode::IndirectRead => Self::IndirectRead,
            Opcode::IndirectWrite => Self::IndirectWrite,
            Opcode::IndirectReadModifyWrite => Self::IndirectReadModifyWrite,
            Opcode::RangeGenerate => Self::RangeGenerate,
            Opcode::AluScalar => Self::AluScalar,
            Opcode::AluVector => Self::AluVector,
            Opcode::Invalidate => Self::Invalidate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OpType {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Min = 4,
    Max = 5,
    Gt = 6,
    Gte = 7,
    Lt = 8,
    Lte = 9,
    Eq = 10,
}

impl OpType {
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(OpType::Add),
            1 => Some(OpType::Sub),
            2 => Some(OpType::Mul),
            3 => Some(OpType::Div),
            4 => Some(OpType::Min),
            5 => Some(OpType::Max),
            6 => Some(OpType::Gt),
            7 => Some(OpType::Gte),
            8 => Some(OpType::Lt),
            9 => Some(OpType::Lte),
            10 => Some(OpType::Eq),
            _ => None,
        }
    }

    /// Comparison results are 0/1 regardless of data type.
    #[must_use]
    pub fn is_compare(self) -> bool {
        matches!(
            self,
            OpType::Gt | OpType::Gte | OpType::Lt | OpType::Lte | OpType::Eq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DataType {
    Int32 = 0,
    Float32 = 1,
}

impl DataType {
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(DataType::Int32),
            1 => Some(DataType::Float32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::EnumIter)]
pub enum FuncUnitKind {
    Alu,
    Stream,
    Indirect,
    Range,
    Invalidator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    Service,
    Finish,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid opcode byte {0:#x}")]
    BadOpcode(u8),
    #[error("invalid ALU op byte {0:#x}")]
    BadOpType(u8),
    #[error("invalid data type byte {0:#x}")]
    BadDataType(u8),
    #[error("opcode {opcode:?} requires an ALU op")]
    MissingOpType { opcode: Opcode },
    #[error("tile index {tile_id} out of range (num_tiles={num_tiles})")]
    TileIndex { tile_id: usize, num_tiles: usize },
    #[error("register index {reg_id} out of range (num_regs={num_regs})")]
    RegisterIndex { reg_id: usize, num_regs: usize },
    #[error("instruction word {offset} written before words 0..{offset}")]
    WordOrder { offset: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub op: Option<OpType>,
    pub datatype: DataType,
    pub base_addr: address,
    pub src1_tile: Option<usize>,
    pub src2_tile: Option<usize>,
    pub cond_tile: Option<usize>,
    pub dst1_tile: Option<usize>,
    pub dst2_tile: Option<usize>,
    pub src1_reg: Option<usize>,
    pub src2_reg: Option<usize>,
    pub src3_reg: Option<usize>,
    pub dst1_reg: Option<usize>,
    pub dst2_reg: Option<usize>,
    pub state: State,
    pub src1_ready: bool,
    pub src2_ready: bool,
    /// Slot in the instruction file, assigned at push.
    pub slot: usize,
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "INSTR[{:?}", self.opcode)?;
        if let Some(op) = self.op {
            write!(f, " op({op:?})")?;
        }
        for (name, id) in [
            ("srcSPD1", self.src1_tile),
            ("srcSPD2", self.src2_tile),
            ("condSPD", self.cond_tile),
            ("dstSPD1", self.dst1_tile),
            ("dstSPD2", self.dst2_tile),
        ] {
            if let Some(id) = id {
                write!(f, " {name}({id})")?;
            }
        }
        write!(f, " state({:?})]", self.state)
    }
}

fn opt_byte(byte: u8) -> Option<usize> {
    (byte != NONE_BYTE).then_some(byte as usize)
}

fn check_tile(tile: Option<usize>, num_tiles: usize) -> Result<Option<usize>, DecodeError> {
    match tile {
        Some(tile_id) if tile_id >= num_tiles => Err(DecodeError::TileIndex { tile_id, num_tiles }),
        tile => Ok(tile),
    }
}

fn check_reg(reg: Option<usize>, num_regs: usize) -> Result<Option<usize>, DecodeError> {
    match reg {
        Some(reg_id) if reg_id >= num_regs => Err(DecodeError::RegisterIndex { reg_id, num_regs }),
        reg => Ok(reg),
    }
}

/// The three 8-byte control words the CPU writes to program one instruction.
///
/// Word 0 packs (low to high bytes) dst2 tile, dst1 tile, ALU op, data type,
/// opcode. Word 1 packs cond tile, src3 reg, src2 reg, src1 reg, dst2 reg,
/// dst1 reg, src2 tile, src1 tile. Word 2 is the base address. 0xff encodes
/// "none".
#[derive(Debug, Default, Clone)]
pub struct Staged {
    words: [Option<u64>; 3],
}

impl Staged {
    pub fn write_word(&mut self, word_id: usize, data: u64) -> Result<(), DecodeError> {
        assert!(word_id < 3);
        if self.words[..word_id].iter().any(Option::is_none) {
            return Err(DecodeError::WordOrder { offset: word_id });
        }
        self.words[word_id] = Some(data);
        Ok(())
    }

    #[must_use]
    pub fn complete(&self) -> bool {
        self.words.iter().all(Option::is_some)
    }

    /// Decode the staged words, validating every index against the
    /// configured geometry. Clears the staging area on success.
    pub fn decode(
        &mut self,
        num_tiles: usize,
        num_regs: usize,
    ) -> Result<Instruction, DecodeError> {
        assert!(self.complete());
        let word0 = self.words[0].unwrap_or_default().to_le_bytes();
        let word1 = self.words[1].unwrap_or_default().to_le_bytes();
        let base_addr = self.words[2].unwrap_or_default();
        self.words = [None; 3];

        let opcode = Opcode::from_byte(word0[4]).ok_or(DecodeError::BadOpcode(word0[4]))?;
        let datatype = DataType::from_byte(word0[3]).ok_or(DecodeError::BadDataType(word0[3]))?;
        let op = match word0[2] {
            NONE_BYTE => None,
            byte => Some(OpType::from_byte(byte).ok_or(DecodeError::BadOpType(byte))?),
        };
        if op.is_none() && matches!(opcode, Opcode::AluScalar | Opcode::AluVector) {
            return Err(DecodeError::MissingOpType { opcode });
        }

        Ok(Instruction {
            opcode,
            op,
            datatype,
            base_addr,
            dst2_tile: check_tile(opt_byte(word0[0]), num_tiles)?,
            dst1_tile: check_tile(opt_byte(word0[1]), num_tiles)?,
            cond_tile: check_tile(opt_byte(word1[0]), num_tiles)?,
            src3_reg: check_reg(opt_byte(word1[1]), num_regs)?,
            src2_reg: check_reg(opt_byte(word1[2]), num_regs)?,
            src1_reg: check_reg(opt_byte(word1[3]), num_regs)?,
            dst2_reg: check_reg(opt_byte(word1[4]), num_regs)?,
            dst1_reg: check_reg(opt_byte(word1[5]), num_regs)?,
            src2_tile: check_tile(opt_byte(word1[6]), num_tiles)?,
            src1_tile: check_tile(opt_byte(word1[7]), num_tiles)?,
            state: State::Idle,
            src1_ready: true,
            src2_ready: true,
            slot: usize::MAX,
        })
    }
}

/// Pack the three control words for an instruction, the inverse of
/// [`Staged::decode`]. The CPU-side runtime does this in hardware; tests and
/// the command-trace loader use it here.
#[must_use]
pub fn encode(instruction: &EncodedFields) -> [u64; 3] {
    fn byte(field: Option<usize>) -> u64 {
        field.map_or(u64::from(NONE_BYTE), |id| id as u64)
    }
    let word0 = byte(instruction.dst2_tile)
        | byte(instruction.dst1_tile) << 8
        | instruction.op.map_or(u64::from(NONE_BYTE), |op| op as u64) << 16
        | (instruction.datatype as u64) << 24
        | (instruction.opcode as u64) << 32;
    let word1 = byte(instruction.cond_tile)
        | byte(instruction.src3_reg) << 8
        | byte(instruction.src2_reg) << 16
        | byte(instruction.src1_reg) << 24
        | byte(instruction.dst2_reg) << 32
        | byte(instruction.dst1_reg) << 40
        | byte(instruction.src2_tile) << 48
        | byte(instruction.src1_tile) << 56;
    [word0, word1, instruction.base_addr]
}

/// Field-level description of one instruction for [`encode`].
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EncodedFields {
    pub opcode: Opcode,
    pub op: Option<OpType>,
    pub datatype: DataType,
    pub base_addr: address,
    pub src1_tile: Option<usize>,
    pub src2_tile: Option<usize>,
    pub cond_tile: Option<usize>,
    pub dst1_tile: Option<usize>,
    pub dst2_tile: Option<usize>,
    pub src1_reg: Option<usize>,
    pub src2_reg: Option<usize>,
    pub src3_reg: Option<usize>,
    pub dst1_reg: Option<usize>,
    pub dst2_reg: Option<usize>,
}

impl Default for Opcode {
    fn default() -> Self {
        Opcode::StreamRead
    }
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Int32
    }
}

/// Why the instruction file refused a push. The CPU-side write is nacked and
/// retried; neither case is a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushRefused {
    /// All slots occupied.
    Full,
    /// The new destination collides with a pending instruction's tiles.
    DestinationHazard { slot: usize },
}

#[derive(Debug)]
pub struct InstructionFile {
    slots: Vec<Option<Instruction>>,
    /// Push order, for oldest-first dispatch.
    ages: Vec<u64>,
    next_age: u64,
}

impl InstructionFile {
    #[must_use]
    pub fn new(num_instructions: usize) -> Self {
        Self {
            slots: vec![None; num_instructions],
            ages: vec![0; num_instructions],
            next_age: 0,
        }
    }

    #[must_use]
    pub fn occupancy(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&Instruction> {
        self.slots[slot].as_ref()
    }

    /// Push a decoded instruction into a free slot.
    ///
    /// Refused when no slot is free or when the instruction's destination
    /// tiles collide with any pending instruction's sources or destinations.
    pub fn push(&mut self, mut instruction: Instruction) -> Result<usize, PushRefused> {
        for (slot, pending) in self.slots.iter().enumerate() {
            let Some(pending) = pending else { continue };
            for dst in [instruction.dst1_tile, instruction.dst2_tile] {
                let Some(dst) = dst else { continue };
                let collides = [
                    pending.dst1_tile,
                    pending.dst2_tile,
                    pending.src1_tile,
                    pending.src2_tile,
                ]
                .contains(&Some(dst));
                if collides {
                    return Err(PushRefused::DestinationHazard { slot });
                }
            }
        }
        let free = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(PushRefused::Full)?;
        instruction.slot = free;
        self.slots[free] = Some(instruction);
        self.ages[free] = self.next_age;
        self.next_age += 1;
        Ok(free)
    }

    /// Take the oldest dispatchable instruction for a unit kind, marking its
    /// slot in service. The slot stays occupied until [`Self::finish`].
    pub fn get_ready(&mut self, kind: FuncUnitKind) -> Option<Instruction> {
        let slot = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, pending)| {
                let pending = pending.as_ref()?;
                let ready = pending.state == State::Idle
                    && pending.opcode.func_unit() == kind
                    && pending.src1_ready
                    && pending.src2_ready;
                ready.then_some(slot)
            })
            .min_by_key(|slot| self.ages[*slot])?;
        let instruction = self.slots[slot].as_mut().unwrap();
        instruction.state = State::Service;
        Some(instruction.clone())
    }

    /// Retire an instruction and wake up instructions waiting on the tiles it
    /// produced.
    pub fn finish(&mut self, slot: usize, dst1_tile: Option<usize>, dst2_tile: Option<usize>) {
        let finished = self.slots[slot].take();
        debug_assert!(matches!(
            finished.map(|instruction| instruction.state),
            Some(State::Service)
        ));
        for pending in self.slots.iter_mut().flatten() {
            for dst in [dst1_tile, dst2_tile].into_iter().flatten() {
                if pending.src1_tile == Some(dst) {
                    pending.src1_ready = true;
                }
                if pending.src2_tile == Some(dst) {
                    pending.src2_ready = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoded(fields: EncodedFields) -> Instruction {
        let words = encode(&fields);
        let mut staged = Staged::default();
        for (word_id, word) in words.into_iter().enumerate() {
            staged.write_word(word_id, word).unwrap();
        }
        staged.decode(32, 32).unwrap()
    }

    #[test]
    fn encode_decode_roundtrips_fields() {
        let instruction = decoded(EncodedFields {
            opcode: Opcode::IndirectReadModifyWrite,
            op: Some(OpType::Add),
            datatype: DataType::Float32,
            base_addr: 0x1000_0000,
            src1_tile: Some(3),
            src2_tile: Some(4),
            cond_tile: Some(5),
            dst1_tile: Some(6),
            src1_reg: Some(7),
            ..EncodedFields::default()
        });
        assert_eq!(instruction.opcode, Opcode::IndirectReadModifyWrite);
        assert_eq!(instruction.op, Some(OpType::Add));
        assert_eq!(instruction.datatype, DataType::Float32);
        assert_eq!(instruction.base_addr, 0x1000_0000);
        assert_eq!(instruction.src1_tile, Some(3));
        assert_eq!(instruction.src2_tile, Some(4));
        assert_eq!(instruction.cond_tile, Some(5));
        assert_eq!(instruction.dst1_tile, Some(6));
        assert_eq!(instruction.src1_reg, Some(7));
        assert_eq!(instruction.dst2_tile, None);
        assert_eq!(instruction.opcode.func_unit(), FuncUnitKind::Indirect);
    }

    #[test]
    fn decode_rejects_out_of_range_tile() {
        let words = encode(&EncodedFields {
            opcode: Opcode::AluVector,
            op: Some(OpType::Mul),
            src1_tile: Some(9),
            dst1_tile: Some(1),
            ..EncodedFields::default()
        });
        let mut staged = Staged::default();
        for (word_id, word) in words.into_iter().enumerate() {
            staged.write_word(word_id, word).unwrap();
        }
        assert_eq!(
            staged.decode(8, 8),
            Err(DecodeError::TileIndex {
                tile_id: 9,
                num_tiles: 8
            })
        );
    }

    #[test]
    fn word_order_is_enforced() {
        let mut staged = Staged::default();
        assert_eq!(
            staged.write_word(2, 0),
            Err(DecodeError::WordOrder { offset: 2 })
        );
        staged.write_word(0, 0).unwrap();
        staged.write_word(1, 0).unwrap();
        assert!(staged.write_word(2, 0).is_ok());
        assert!(staged.complete());
    }

    #[test]
    fn alu_opcode_requires_op() {
        let words = encode(&EncodedFields {
            opcode: Opcode::AluVector,
            op: None,
            ..EncodedFields::default()
        });
        let mut staged = Staged::default();
        for (word_id, word) in words.into_iter().enumerate() {
            staged.write_word(word_id, word).unwrap();
        }
        assert_eq!(
            staged.decode(8, 8),
            Err(DecodeError::MissingOpType {
                opcode: Opcode::AluVector
            })
        );
    }

    fn simple(opcode: Opcode, dst1_tile: Option<usize>, src1_tile: Option<usize>) -> Instruction {
        decoded(EncodedFields {
            opcode,
            op: (opcode.func_unit() == FuncUnitKind::Alu).then_some(OpType::Add),
            dst1_tile,
            src1_tile,
            ..EncodedFields::default()
        })
    }

    #[test]
    fn push_refuses_destination_hazards() {
        let mut ifile = InstructionFile::new(4);
        ifile
            .push(simple(Opcode::StreamRead, Some(1), None))
            .unwrap();
        // writing tile 1 again while it is a pending destination
        assert_eq!(
            ifile.push(simple(Opcode::StreamRead, Some(1), None)),
            Err(PushRefused::DestinationHazard { slot: 0 })
        );
        // reading tile 1 is fine
        ifile
            .push(simple(Opcode::AluVector, Some(2), Some(1)))
            .unwrap();
        // but writing a tile someone reads is not
        assert_eq!(
            ifile.push(simple(Opcode::StreamRead, Some(1), None)),
            Err(PushRefused::DestinationHazard { slot: 0 })
        );
    }

    #[test]
    fn push_refuses_when_full() {
        let mut ifile = InstructionFile::new(2);
        ifile
            .push(simple(Opcode::RangeGenerate, None, None))
            .unwrap();
        ifile
            .push(simple(Opcode::RangeGenerate, None, None))
            .unwrap();
        assert_eq!(
            ifile.push(simple(Opcode::RangeGenerate, None, None)),
            Err(PushRefused::Full)
        );
    }

    #[test]
    fn dispatch_is_oldest_first_and_ready_gated() {
        let mut ifile = InstructionFile::new(4);
        let mut first = simple(Opcode::AluVector, Some(2), Some(1));
        first.src1_ready = false;
        ifile.push(first).unwrap();
        ifile
            .push(simple(Opcode::AluVector, Some(3), None))
            .unwrap();

        // the older instruction waits on tile 1, the younger one dispatches
        let dispatched = ifile.get_ready(FuncUnitKind::Alu).unwrap();
        assert_eq!(dispatched.slot, 1);
        assert!(ifile.get_ready(FuncUnitKind::Alu).is_none());

        // finishing the producer of tile 1 wakes the older instruction
        ifile.finish(1, Some(1), None);
        let woken = ifile.get_ready(FuncUnitKind::Alu).unwrap();
        assert_eq!(woken.slot, 0);
        assert!(woken.src1_ready);
    }

    #[test]
    fn slots_are_reused_after_finish() {
        let mut ifile = InstructionFile::new(1);
        let slot = ifile
            .push(simple(Opcode::RangeGenerate, None, None))
            .unwrap();
        let _ = ifile.get_ready(FuncUnitKind::Range).unwrap();
        ifile.finish(slot, None, None);
        assert!(ifile.is_empty());
        assert!(ifile.push(simple(Opcode::RangeGenerate, None, None)).is_ok());
    }
}
