//! Closed-loop harness: couples the accelerator to a flat functional memory
//! that answers both downstream ports after a fixed latency. This is test
//! and demo plumbing, not a DRAM model.

use super::addrdec::{Region, WORD_SIZE};
use super::instruction::{encode, EncodedFields};
use super::packet::{Kind, Reply, Request, WORDS_PER_BLOCK};
use super::{address, Config, Maa, UpstreamError, WriteOutcome};
use std::collections::{HashMap, VecDeque};

/// Word-addressed backing store with a fixed reply latency.
#[derive(Debug)]
pub struct FunctionalMemory {
    words: HashMap<address, u32>,
    pub reply_latency: u64,
}

impl FunctionalMemory {
    #[must_use]
    pub fn new(reply_latency: u64) -> Self {
        Self {
            words: HashMap::new(),
            reply_latency,
        }
    }

    #[must_use]
    pub fn read_word(&self, addr: address) -> u32 {
        debug_assert_eq!(addr % WORD_SIZE, 0);
        self.words.get(&addr).copied().unwrap_or(0)
    }

    pub fn write_word(&mut self, addr: address, value: u32) {
        debug_assert_eq!(addr % WORD_SIZE, 0);
        self.words.insert(addr, value);
    }

    /// Service one request, producing its reply.
    pub fn service(&mut self, request: Request) -> Reply {
        let mut data = [0u32; WORDS_PER_BLOCK];
        match request.kind {
            Kind::ReadRequest => {
                for (wid, word) in data.iter_mut().enumerate() {
                    *word = self.read_word(request.addr + wid as address * WORD_SIZE);
                }
            }
            Kind::WriteRequest => {
                for wid in request.word_mask.iter_ones() {
                    self.write_word(
                        request.addr + wid as address * WORD_SIZE,
                        request.data[wid],
                    );
                }
            }
            Kind::InvalidateRequest => {}
            kind => unreachable!("memory asked to service {kind:?}"),
        }
        request.into_reply(data)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("accelerator still busy after {max_cycles} cycles")]
pub struct Deadlock {
    pub max_cycles: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyPort {
    Cache,
    Mem,
}

/// Accelerator plus functional backend, advanced cycle by cycle.
pub struct Simulator {
    pub maa: Maa,
    pub memory: FunctionalMemory,
    in_flight: VecDeque<(u64, ReplyPort, Reply)>,
}

impl Simulator {
    pub fn new(config: Config) -> Result<Self, super::config::ConfigError> {
        Ok(Self {
            maa: Maa::new(config)?,
            memory: FunctionalMemory::new(4),
            in_flight: VecDeque::new(),
        })
    }

    /// One cycle: clock the accelerator, move port requests into the
    /// backend, deliver replies that have aged out.
    pub fn step(&mut self) {
        self.maa.cycle();
        let now = self.maa.current_cycle();
        while let Some(request) = self.maa.pop_cache_request() {
            let reply = self.memory.service(request);
            self.in_flight
                .push_back((now + self.memory.reply_latency, ReplyPort::Cache, reply));
        }
        while let Some(request) = self.maa.pop_mem_request() {
            let reply = self.memory.service(request);
            self.in_flight
                .push_back((now + self.memory.reply_latency, ReplyPort::Mem, reply));
        }
        while let Some((due, _, _)) = self.in_flight.front() {
            if *due > now {
                break;
            }
            let (_, port, reply) = self.in_flight.pop_front().unwrap();
            match port {
                ReplyPort::Cache => self.maa.cache_reply(reply),
                ReplyPort::Mem => self.maa.mem_reply(reply),
            }
            .expect("backend delivered unmatched reply");
        }
    }

    /// Clock until the accelerator drains, failing after `max_cycles`.
    pub fn run_until_idle(&mut self, max_cycles: u64) -> Result<u64, Deadlock> {
        let start = self.maa.current_cycle();
        while self.maa.busy() || !self.in_flight.is_empty() {
            if self.maa.current_cycle() - start >= max_cycles {
                return Err(Deadlock { max_cycles });
            }
            self.step();
        }
        Ok(self.maa.current_cycle() - start)
    }

    // -------------------------------------------------------------------
    // Program helpers (the CPU side of the upstream port)
    // -------------------------------------------------------------------

    pub fn write_reg(&mut self, reg_id: usize, value: i32) -> Result<(), UpstreamError> {
        let base = self.maa.address_map().range(Region::Scalar).start;
        self.maa
            .upstream_write(base + reg_id as address * WORD_SIZE, value as u32 as u64, 4)?;
        Ok(())
    }

    pub fn write_tile(&mut self, tile_id: usize, values: &[u32]) -> Result<(), UpstreamError> {
        let base = self
            .maa
            .address_map()
            .range(Region::SpdDataNoncacheable)
            .start;
        let tile_bytes = self.maa.config().num_tile_elements as address * WORD_SIZE;
        for (element_id, value) in values.iter().enumerate() {
            let addr = base + tile_id as address * tile_bytes + element_id as address * WORD_SIZE;
            self.maa.upstream_write(addr, u64::from(*value), 4)?;
        }
        Ok(())
    }

    pub fn read_tile(&mut self, tile_id: usize, len: usize) -> Result<Vec<u32>, UpstreamError> {
        let base = self.maa.address_map().range(Region::SpdDataCacheable).start;
        let tile_bytes = self.maa.config().num_tile_elements as address * WORD_SIZE;
        (0..len)
            .map(|element_id| {
                let addr =
                    base + tile_id as address * tile_bytes + element_id as address * WORD_SIZE;
                Ok(self.maa.upstream_read(addr, 4)? as u32)
            })
            .collect()
    }

    pub fn tile_size(&mut self, tile_id: usize) -> Result<u16, UpstreamError> {
        let base = self.maa.address_map().range(Region::SpdSize).start;
        Ok(self.maa.upstream_read(base + tile_id as address * 2, 2)? as u16)
    }

    pub fn tile_ready(&mut self, tile_id: usize) -> Result<bool, UpstreamError> {
        let base = self.maa.address_map().range(Region::SpdReady).start;
        Ok(self.maa.upstream_read(base + tile_id as address * 2, 2)? != 0)
    }

    /// Program one instruction through the three control-word writes.
    pub fn push_instruction(
        &mut self,
        fields: &EncodedFields,
    ) -> Result<WriteOutcome, UpstreamError> {
        let base = self
            .maa
            .address_map()
            .range(Region::InstructionFile)
            .start;
        let words = encode(fields);
        let mut outcome = WriteOutcome::Ack;
        for (word_id, word) in words.into_iter().enumerate() {
            outcome = self.maa.upstream_write(base + 8 * word_id as u64, word, 8)?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{DataType, OpType, Opcode};
    use color_eyre::eyre;
    use pretty_assertions_sorted::assert_eq;

    fn small_config() -> Config {
        Config {
            num_tiles: 8,
            num_tile_elements: 64,
            num_regs: 16,
            num_instructions: 8,
            num_row_table_banks: 2,
            num_row_table_rows_per_bank: 4,
            num_row_table_entries_per_row: 4,
            ..Config::default()
        }
    }

    fn sim() -> Simulator {
        Simulator::new(small_config()).unwrap()
    }

    #[test]
    fn stream_read_gathers_strided_memory() -> eyre::Result<()> {
        let mut sim = sim();
        let base = 0x10_0000u64;
        for i in 0..256 {
            sim.memory.write_word(base + 4 * i, (1000 + i) as u32);
        }
        // min=0, max=32, stride=2 -> elements 0,2,4,..,62
        sim.write_reg(0, 0)?;
        sim.write_reg(1, 32)?;
        sim.write_reg(2, 2)?;
        let outcome = sim.push_instruction(&EncodedFields {
            opcode: Opcode::StreamRead,
            base_addr: base,
            dst1_tile: Some(1),
            src1_reg: Some(0),
            src2_reg: Some(1),
            src3_reg: Some(2),
            ..EncodedFields::default()
        })?;
        assert_eq!(outcome, WriteOutcome::Ack);
        assert!(!sim.tile_ready(1)?);

        sim.run_until_idle(10_000).unwrap();
        assert!(sim.tile_ready(1)?);
        assert_eq!(sim.tile_size(1)?, 16);
        let tile = sim.read_tile(1, 16)?;
        let expected: Vec<u32> = (0..16).map(|i| 1000 + 2 * i).collect();
        assert_eq!(tile, expected);
        Ok(())
    }

    #[test]
    fn indirect_read_coalesces_one_row_into_one_drain() -> eyre::Result<()> {
        let mut sim = sim();
        let base = 0x20_0000u64;
        for i in 0..1024 {
            sim.memory.write_word(base + 4 * i, 7000 + i as u32);
        }
        // indices 0, 32, 64, 96 touch four lines; the address map keeps
        // them in one DRAM row (the channel bit sits below the column bits)
        let indices = [0u32, 32, 64, 96];
        sim.write_tile(0, &indices)?;
        sim.push_instruction(&EncodedFields {
            opcode: Opcode::IndirectRead,
            base_addr: base,
            src1_tile: Some(0),
            dst1_tile: Some(2),
            ..EncodedFields::default()
        })?;
        sim.run_until_idle(10_000).unwrap();

        assert!(sim.tile_ready(2)?);
        assert_eq!(sim.tile_size(2)?, 4);
        assert_eq!(
            sim.read_tile(2, 4)?,
            vec![7000, 7000 + 32, 7000 + 64, 7000 + 96]
        );
        let stats = sim.maa.collected_stats();
        assert_eq!(stats.coalescing[0].rows_inserted, 1);
        assert_eq!(stats.coalescing[0].cache_lines_inserted, 4);
        assert_eq!(stats.coalescing[0].drains, 1);
        assert_eq!(stats.coalescing[0].rows_evicted, 0);
        Ok(())
    }

    #[test]
    fn indirect_rmw_adds_into_memory_with_duplicates() -> eyre::Result<()> {
        let mut sim = sim();
        let base = 0x30_0000u64;
        sim.memory.write_word(base, 100);
        sim.memory.write_word(base + 4, 200);

        // two updates hit word 0, one hits word 1
        sim.write_tile(0, &[0, 1, 0])?;
        sim.write_tile(1, &[5, 6, 7])?;
        sim.push_instruction(&EncodedFields {
            opcode: Opcode::IndirectReadModifyWrite,
            op: Some(OpType::Add),
            base_addr: base,
            src1_tile: Some(0),
            src2_tile: Some(1),
            ..EncodedFields::default()
        })?;
        sim.run_until_idle(10_000).unwrap();

        assert_eq!(sim.memory.read_word(base), 100 + 5 + 7);
        assert_eq!(sim.memory.read_word(base + 4), 200 + 6);
        Ok(())
    }

    #[test]
    fn indirect_write_scatters_tile_to_memory() -> eyre::Result<()> {
        let mut sim = sim();
        let base = 0x40_0000u64;
        sim.write_tile(0, &[3, 1, 4])?;
        sim.write_tile(1, &[30, 10, 40])?;
        sim.push_instruction(&EncodedFields {
            opcode: Opcode::IndirectWrite,
            base_addr: base,
            src1_tile: Some(0),
            src2_tile: Some(1),
            ..EncodedFields::default()
        })?;
        sim.run_until_idle(10_000).unwrap();

        assert_eq!(sim.memory.read_word(base + 4 * 3), 30);
        assert_eq!(sim.memory.read_word(base + 4 * 1), 10);
        assert_eq!(sim.memory.read_word(base + 4 * 4), 40);
        assert_eq!(sim.memory.read_word(base), 0);
        Ok(())
    }

    #[test]
    fn row_table_eviction_drains_before_new_rows_fill() -> eyre::Result<()> {
        // 2 banks x 4 rows x 4 lines; 64 spread-out indices force evictions
        let mut sim = sim();
        let base = 0x50_0000u64;
        let indices: Vec<u32> = (0..64u32).map(|i| i * 1024).collect();
        for &index in &indices {
            sim.memory.write_word(base + 4 * u64::from(index), index);
        }
        sim.write_tile(0, &indices)?;
        sim.push_instruction(&EncodedFields {
            opcode: Opcode::IndirectRead,
            base_addr: base,
            src1_tile: Some(0),
            dst1_tile: Some(2),
            ..EncodedFields::default()
        })?;
        sim.run_until_idle(100_000).unwrap();

        assert_eq!(sim.read_tile(2, 64)?, indices);
        let stats = sim.maa.collected_stats();
        assert!(stats.coalescing[0].rows_evicted > 0);
        assert_eq!(stats.coalescing[0].words_inserted, 64);
        Ok(())
    }

    #[test]
    fn vector_alu_adds_two_tiles_under_condition() -> eyre::Result<()> {
        let mut sim = sim();
        sim.write_tile(0, &[1, 2, 3, 4])?;
        sim.write_tile(1, &[10, 20, 30, 40])?;
        sim.write_tile(2, &[1, 0, 1, 0])?;
        sim.push_instruction(&EncodedFields {
            opcode: Opcode::AluVector,
            op: Some(OpType::Add),
            src1_tile: Some(0),
            src2_tile: Some(1),
            cond_tile: Some(2),
            dst1_tile: Some(3),
            ..EncodedFields::default()
        })?;
        sim.run_until_idle(1_000).unwrap();

        let tile = sim.read_tile(3, 4)?;
        // gated elements keep their previous (zero) contents
        assert_eq!(tile, vec![11, 0, 33, 0]);
        assert_eq!(sim.tile_size(3)?, 4);
        Ok(())
    }

    #[test]
    fn scalar_alu_reduces_into_register() -> eyre::Result<()> {
        let mut sim = sim();
        sim.write_tile(0, &[9, 3, 27, 12])?;
        sim.push_instruction(&EncodedFields {
            opcode: Opcode::AluScalar,
            op: Some(OpType::Max),
            src1_tile: Some(0),
            dst1_reg: Some(5),
            ..EncodedFields::default()
        })?;
        sim.run_until_idle(1_000).unwrap();

        let scalar_base = sim.maa.address_map().range(Region::Scalar).start;
        assert_eq!(sim.maa.upstream_read(scalar_base + 4 * 5, 4)?, 27);
        Ok(())
    }

    #[test]
    fn float_vector_alu_multiplies() -> eyre::Result<()> {
        let mut sim = sim();
        sim.write_tile(0, &[1.5f32.to_bits(), 2.0f32.to_bits()])?;
        sim.write_tile(1, &[4.0f32.to_bits(), 0.5f32.to_bits()])?;
        sim.push_instruction(&EncodedFields {
            opcode: Opcode::AluVector,
            op: Some(OpType::Mul),
            datatype: DataType::Float32,
            src1_tile: Some(0),
            src2_tile: Some(1),
            dst1_tile: Some(2),
            ..EncodedFields::default()
        })?;
        sim.run_until_idle(1_000).unwrap();

        let tile = sim.read_tile(2, 2)?;
        assert_eq!(tile, vec![6.0f32.to_bits(), 1.0f32.to_bits()]);
        Ok(())
    }

    #[test]
    fn range_generate_fuses_loop_nest() -> eyre::Result<()> {
        let mut sim = sim();
        // rows 0..3 with j in [min[i], max[i])
        sim.write_tile(0, &[0, 5, 9])?;
        sim.write_tile(1, &[2, 8, 10])?;
        sim.write_reg(0, 1)?; // stride
        sim.write_reg(1, 0)?; // i cursor
        sim.write_reg(2, -1)?; // j cursor
        sim.push_instruction(&EncodedFields {
            opcode: Opcode::RangeGenerate,
            src1_tile: Some(0),
            src2_tile: Some(1),
            dst1_tile: Some(2),
            dst2_tile: Some(3),
            src1_reg: Some(0),
            dst1_reg: Some(1),
            dst2_reg: Some(2),
            ..EncodedFields::default()
        })?;
        sim.run_until_idle(1_000).unwrap();

        assert_eq!(sim.tile_size(2)?, 6);
        assert_eq!(sim.read_tile(2, 6)?, vec![0, 0, 1, 1, 1, 2]);
        assert_eq!(sim.read_tile(3, 6)?, vec![0, 1, 5, 6, 7, 9]);
        Ok(())
    }

    #[test]
    fn invalidate_chases_cached_lines_out() -> eyre::Result<()> {
        let mut sim = sim();
        sim.write_tile(1, &[11, 22, 33])?;
        // CPU reads pull the tile's first line into the caches
        let _ = sim.read_tile(1, 3)?;
        assert!(sim.maa.invalidator.is_cached(1, 0));

        sim.push_instruction(&EncodedFields {
            opcode: Opcode::Invalidate,
            dst1_tile: Some(1),
            ..EncodedFields::default()
        })?;
        sim.run_until_idle(1_000).unwrap();

        assert!(!sim.maa.invalidator.is_cached(1, 0));
        assert!(sim.tile_ready(1)?);
        let stats = sim.maa.collected_stats();
        assert_eq!(stats.ports.mem_side.issued, 1);
        assert_eq!(stats.ports.mem_side.completed, 1);
        Ok(())
    }

    #[test]
    fn dependent_instructions_chain_through_tile_ready() -> eyre::Result<()> {
        let mut sim = sim();
        let base = 0x60_0000u64;
        for i in 0..64 {
            sim.memory.write_word(base + 4 * i, i as u32);
        }
        // stream 16 words into tile 1, then double them into tile 2
        sim.write_reg(0, 0)?;
        sim.write_reg(1, 16)?;
        sim.write_reg(2, 1)?;
        sim.push_instruction(&EncodedFields {
            opcode: Opcode::StreamRead,
            base_addr: base,
            dst1_tile: Some(1),
            src1_reg: Some(0),
            src2_reg: Some(1),
            src3_reg: Some(2),
            ..EncodedFields::default()
        })?;
        sim.push_instruction(&EncodedFields {
            opcode: Opcode::AluVector,
            op: Some(OpType::Add),
            src1_tile: Some(1),
            src2_tile: Some(1),
            dst1_tile: Some(2),
            ..EncodedFields::default()
        })?;
        // the ALU instruction waits for tile 1
        assert_eq!(sim.maa.ifile.occupancy(), 2);

        sim.run_until_idle(10_000).unwrap();
        let expected: Vec<u32> = (0..16).map(|i| 2 * i).collect();
        assert_eq!(sim.read_tile(2, 16)?, expected);
        let stats = sim.maa.collected_stats();
        assert_eq!(stats.sim.instructions_finished, 2);
        assert_eq!(stats.instructions.total(), 2);
        Ok(())
    }

    #[test]
    fn hazardous_push_is_nacked_until_retire() -> eyre::Result<()> {
        let mut sim = sim();
        sim.write_tile(0, &[1, 2, 3, 4])?;
        sim.push_instruction(&EncodedFields {
            opcode: Opcode::AluVector,
            op: Some(OpType::Add),
            src1_tile: Some(0),
            src2_tile: Some(0),
            dst1_tile: Some(3),
            ..EncodedFields::default()
        })?;
        // another writer of tile 3 while the first is pending
        let outcome = sim.push_instruction(&EncodedFields {
            opcode: Opcode::AluVector,
            op: Some(OpType::Sub),
            src1_tile: Some(0),
            src2_tile: Some(0),
            dst1_tile: Some(3),
            ..EncodedFields::default()
        })?;
        assert_eq!(outcome, WriteOutcome::Nack);

        sim.run_until_idle(1_000).unwrap();
        // after retirement the same instruction is accepted
        let outcome = sim.push_instruction(&EncodedFields {
            opcode: Opcode::AluVector,
            op: Some(OpType::Sub),
            src1_tile: Some(0),
            src2_tile: Some(0),
            dst1_tile: Some(3),
            ..EncodedFields::default()
        })?;
        assert_eq!(outcome, WriteOutcome::Ack);
        sim.run_until_idle(1_000).unwrap();
        assert_eq!(sim.maa.collected_stats().sim.instructions_refused, 1);
        Ok(())
    }

    #[test]
    fn outstanding_counters_return_to_zero() -> eyre::Result<()> {
        let mut sim = sim();
        let base = 0x70_0000u64;
        let indices: Vec<u32> = (0..64u32).rev().map(|i| i * 16).collect();
        sim.write_tile(0, &indices)?;
        sim.push_instruction(&EncodedFields {
            opcode: Opcode::IndirectRead,
            base_addr: base,
            src1_tile: Some(0),
            dst1_tile: Some(2),
            ..EncodedFields::default()
        })?;
        sim.run_until_idle(100_000).unwrap();

        assert_eq!(sim.maa.cache_port.outstanding(), 0);
        assert_eq!(sim.maa.mem_port.outstanding(), 0);
        let stats = sim.maa.collected_stats();
        assert_eq!(stats.ports.cache_side.issued, stats.ports.cache_side.completed);
        assert!(
            stats.ports.cache_side.max_outstanding_seen
                <= sim.maa.cache_port.max_outstanding() as u64
        );
        Ok(())
    }
}
