#![allow(
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation
)]

pub mod addrdec;
pub mod config;
pub mod fifo;
pub mod instruction;
pub mod packet;
pub mod ports;
pub mod row_table;
pub mod sim;
pub mod spd;
pub mod units;

pub use config::Config;

pub type address = u64;

use addrdec::{AddressMap, DramAddressMap, Fault, Region};
use config::ConfigError;
use console::style;
use instruction::{FuncUnitKind, Instruction, InstructionFile, PushRefused, Staged};
use packet::{Issuer, Reply, Request};
use ports::{DownstreamPort, PortError, PortKind};
use spd::{RegisterFile, Scratchpad};
use units::{AluUnit, ExecContext, IndirectUnit, Invalidator, RangeUnit, Retired, StreamUnit};

/// Errors surfaced on the upstream (CPU-facing) port.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error(transparent)]
    Fault(#[from] Fault),
    #[error(transparent)]
    Decode(#[from] instruction::DecodeError),
}

/// Acknowledgment for an upstream write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Ack,
    /// Instruction refused (file full or destination hazard); retried by
    /// the CPU, never silently dropped.
    Nack,
}

/// The memory access accelerator: address-mapped scratchpad surface,
/// instruction-driven execution units, row-table coalescing, and two
/// budgeted downstream ports.
///
/// Derived configuration (the address map and both port budgets) is
/// computed once here and immutable for the accelerator's lifetime.
pub struct Maa {
    config: Config,
    address_map: AddressMap,
    cycle: u64,

    pub spd: Scratchpad,
    pub rf: RegisterFile,
    pub ifile: InstructionFile,
    staged: Staged,

    pub stream_units: Vec<StreamUnit>,
    pub indirect_units: Vec<IndirectUnit>,
    pub range_units: Vec<RangeUnit>,
    pub alu_units: Vec<AluUnit>,
    pub invalidator: Invalidator,

    pub cache_port: DownstreamPort,
    pub mem_port: DownstreamPort,

    pub stats: stats::Stats,
}

impl Maa {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let address_map = config.address_map();
        let dram_map = DramAddressMap::new(config.dram.clone());
        log::info!(
            "{} ranges {:#x}..{:#x}, budgets cache={} mem={}",
            style("MAA").bold(),
            address_map.start(),
            address_map.end(),
            config.max_outstanding_cache_side(),
            config.max_outstanding_mem_side(),
        );

        let stream_units = (0..config.num_stream_access_units)
            .map(|unit_id| {
                StreamUnit::new(
                    unit_id,
                    config.num_tile_elements,
                    config.translation.clone(),
                )
            })
            .collect();
        let indirect_units = (0..config.num_indirect_access_units)
            .map(|unit_id| {
                IndirectUnit::new(
                    unit_id,
                    config.num_tile_elements,
                    config.num_row_table_banks,
                    config.num_row_table_rows_per_bank,
                    config.num_row_table_entries_per_row,
                    config.num_row_table_config_cache_entries,
                    dram_map.clone(),
                    config.translation.clone(),
                )
            })
            .collect();
        let range_units = (0..config.num_range_units)
            .map(|unit_id| RangeUnit::new(unit_id, config.num_tile_elements))
            .collect();
        let alu_units = (0..config.num_alu_units)
            .map(|unit_id| AluUnit::new(unit_id, config.num_alu_lanes, config.alu_lane_latency))
            .collect();
        let invalidator = Invalidator::new(
            config.num_tiles,
            config.num_tile_elements,
            address_map.range(Region::SpdDataCacheable).start,
        );

        Ok(Self {
            spd: Scratchpad::new(
                config.num_tiles,
                config.num_tile_elements,
                config.spd_read_latency,
                config.spd_write_latency,
                config.num_spd_read_ports,
                config.num_spd_write_ports,
            ),
            rf: RegisterFile::new(config.num_regs),
            ifile: InstructionFile::new(config.num_instructions),
            staged: Staged::default(),
            stream_units,
            indirect_units,
            range_units,
            alu_units,
            invalidator,
            cache_port: DownstreamPort::new(
                PortKind::CacheSide,
                config.max_outstanding_cache_side(),
            ),
            mem_port: DownstreamPort::new(PortKind::MemSide, config.max_outstanding_mem_side()),
            stats: stats::Stats::new(config.num_indirect_access_units),
            cycle: 0,
            address_map,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The six computed ranges, for the surrounding system integrator.
    #[must_use]
    pub fn address_map(&self) -> &AddressMap {
        &self.address_map
    }

    #[must_use]
    pub fn current_cycle(&self) -> u64 {
        self.cycle
    }

    /// Snapshot of all counters, including the per-port ledgers.
    #[must_use]
    pub fn collected_stats(&self) -> stats::Stats {
        let mut collected = self.stats.clone();
        collected.ports.cache_side = self.cache_port.stats.clone();
        collected.ports.mem_side = self.mem_port.stats.clone();
        collected
    }

    /// Anything still in flight?
    #[must_use]
    pub fn busy(&self) -> bool {
        !self.ifile.is_empty()
            || self.cache_port.busy()
            || self.mem_port.busy()
            || !self.stream_units.iter().all(StreamUnit::is_idle)
            || !self.indirect_units.iter().all(IndirectUnit::is_idle)
            || !self.range_units.iter().all(RangeUnit::is_idle)
            || !self.alu_units.iter().all(AluUnit::is_idle)
            || !self.invalidator.is_idle()
    }

    // -------------------------------------------------------------------
    // Upstream (CPU-facing) port
    // -------------------------------------------------------------------

    /// Handle an upstream write packet.
    pub fn upstream_write(
        &mut self,
        addr: address,
        data: u64,
        size: usize,
    ) -> Result<WriteOutcome, UpstreamError> {
        assert!(matches!(size, 2 | 4 | 8), "unsupported access size {size}");
        let (region, offset) = self.address_map.resolve(addr)?;
        if offset % size as address != 0 {
            return Err(Fault::Misaligned {
                addr,
                required: size as address,
            }
            .into());
        }
        match region {
            Region::SpdDataNoncacheable if size == 4 => {
                let tile_bytes = self.config.num_tile_elements as address * addrdec::WORD_SIZE;
                let tile_id = (offset / tile_bytes) as usize;
                let element_id = ((offset % tile_bytes) / addrdec::WORD_SIZE) as usize;
                log::trace!("upstream: TILE[{tile_id}][{element_id}] = {data}");
                self.spd.set_data(tile_id, element_id, data as u32);
                // CPU-filled tiles track the highest element written
                let size = self.spd.get_size(tile_id).max(element_id as u16 + 1);
                self.spd.set_size(tile_id, size);
                Ok(WriteOutcome::Ack)
            }
            Region::Scalar if size == 4 => {
                let reg_id = (offset / addrdec::WORD_SIZE) as usize;
                log::trace!("upstream: REG[{reg_id}] = {data}");
                self.rf.set(reg_id, data as u32);
                Ok(WriteOutcome::Ack)
            }
            Region::InstructionFile if size == 8 => {
                let word_id = (offset / 8) as usize;
                if word_id > 2 {
                    return Err(Fault::IllegalAccess {
                        region,
                        cmd: "write beyond instruction words",
                    }
                    .into());
                }
                self.staged.write_word(word_id, data)?;
                if !self.staged.complete() {
                    return Ok(WriteOutcome::Ack);
                }
                let decoded = self
                    .staged
                    .decode(self.config.num_tiles, self.config.num_regs)?;
                Ok(self.push_instruction(decoded))
            }
            // Writes to cacheable data go through the cache hierarchy; size
            // and ready tables are read-only from the CPU side.
            _ => Err(Fault::IllegalAccess {
                region,
                cmd: "write",
            }
            .into()),
        }
    }

    /// Handle an upstream read packet, returning the value.
    pub fn upstream_read(&mut self, addr: address, size: usize) -> Result<u64, UpstreamError> {
        assert!(matches!(size, 2 | 4 | 8), "unsupported access size {size}");
        let (region, offset) = self.address_map.resolve(addr)?;
        if offset % size as address != 0 {
            return Err(Fault::Misaligned {
                addr,
                required: size as address,
            }
            .into());
        }
        match region {
            Region::SpdDataCacheable if size == 4 => {
                let tile_bytes = self.config.num_tile_elements as address * addrdec::WORD_SIZE;
                let tile_id = (offset / tile_bytes) as usize;
                let element_id = ((offset % tile_bytes) / addrdec::WORD_SIZE) as usize;
                // this line now lives in the cache hierarchy; the
                // invalidator will chase it out before tile reuse
                self.invalidator.note_cached(tile_id, element_id);
                Ok(u64::from(self.spd.get_data(tile_id, element_id)))
            }
            Region::SpdSize if size == 2 => {
                let tile_id = (offset / 2) as usize;
                Ok(u64::from(self.spd.get_size(tile_id)))
            }
            Region::SpdReady if size == 2 => {
                let tile_id = (offset / 2) as usize;
                Ok(u64::from(self.spd.get_ready(tile_id)))
            }
            Region::Scalar if size == 4 => {
                let reg_id = (offset / addrdec::WORD_SIZE) as usize;
                Ok(u64::from(self.rf.get(reg_id)))
            }
            _ => Err(Fault::IllegalAccess {
                region,
                cmd: "read",
            }
            .into()),
        }
    }

    fn push_instruction(&mut self, instruction: Instruction) -> WriteOutcome {
        let mut instruction = instruction;
        for dst in [instruction.dst1_tile, instruction.dst2_tile] {
            let Some(dst) = dst else { continue };
            assert_ne!(instruction.src1_tile, Some(dst), "dst aliases src1");
            assert_ne!(instruction.src2_tile, Some(dst), "dst aliases src2");
        }
        instruction.src1_ready = instruction
            .src1_tile
            .map_or(true, |tile_id| self.spd.get_ready(tile_id));
        instruction.src2_ready = instruction
            .src2_tile
            .map_or(true, |tile_id| self.spd.get_ready(tile_id));
        match self.ifile.push(instruction) {
            Ok(slot) => {
                let pushed = self.ifile.get(slot).unwrap();
                log::debug!("{} {} into slot {slot}", style("pushed").bold(), pushed);
                for dst in [pushed.dst1_tile, pushed.dst2_tile] {
                    if let Some(dst) = dst {
                        self.spd.unset_ready(dst);
                    }
                }
                self.stats.sim.instructions_pushed += 1;
                self.dispatch();
                WriteOutcome::Ack
            }
            Err(refused) => {
                log::warn!("instruction push refused: {refused:?}");
                debug_assert!(matches!(
                    refused,
                    PushRefused::Full | PushRefused::DestinationHazard { .. }
                ));
                self.stats.sim.instructions_refused += 1;
                WriteOutcome::Nack
            }
        }
    }

    // -------------------------------------------------------------------
    // Downstream ports
    // -------------------------------------------------------------------

    /// Next request for the cache-side peer.
    pub fn pop_cache_request(&mut self) -> Option<Request> {
        self.cache_port.pop_request()
    }

    /// Next request for the memory-side peer.
    pub fn pop_mem_request(&mut self) -> Option<Request> {
        self.mem_port.pop_request()
    }

    /// Completion from the cache-side peer.
    pub fn cache_reply(&mut self, reply: Reply) -> Result<(), PortError> {
        let issuer = self.cache_port.complete(reply.uid)?;
        self.route_reply(issuer, &reply);
        Ok(())
    }

    /// Completion from the memory-side peer.
    pub fn mem_reply(&mut self, reply: Reply) -> Result<(), PortError> {
        let issuer = self.mem_port.complete(reply.uid)?;
        self.route_reply(issuer, &reply);
        Ok(())
    }

    fn route_reply(&mut self, issuer: Issuer, reply: &Reply) {
        log::trace!("route {} back to {}", reply, issuer);
        let retired = {
            let now = self.cycle;
            let Self {
                spd,
                rf,
                stream_units,
                indirect_units,
                invalidator,
                cache_port,
                mem_port,
                stats,
                ..
            } = self;
            let mut ctx = ExecContext {
                cycle: now,
                spd,
                rf,
                cache_port,
                mem_port,
                stats,
            };
            match issuer {
                Issuer::Stream(unit_id) => stream_units[unit_id].accept_reply(reply, &mut ctx),
                Issuer::Indirect(unit_id) => indirect_units[unit_id].accept_reply(reply, &mut ctx),
                Issuer::Invalidator => invalidator.accept_reply(reply, &mut ctx),
            }
        };
        if let Some(retired) = retired {
            self.retire(retired);
        }
    }

    // -------------------------------------------------------------------
    // Clock
    // -------------------------------------------------------------------

    /// Advance the accelerator by one cycle.
    pub fn cycle(&mut self) {
        self.cycle += 1;
        self.stats.sim.cycles += 1;
        let mut retired_list = Vec::new();
        {
            let now = self.cycle;
            let Self {
                spd,
                rf,
                stream_units,
                indirect_units,
                range_units,
                alu_units,
                invalidator,
                cache_port,
                mem_port,
                stats,
                ..
            } = self;
            let mut ctx = ExecContext {
                cycle: now,
                spd,
                rf,
                cache_port,
                mem_port,
                stats,
            };
            for unit in stream_units.iter_mut() {
                retired_list.extend(unit.cycle(&mut ctx));
            }
            for unit in indirect_units.iter_mut() {
                retired_list.extend(unit.cycle(&mut ctx));
            }
            for unit in range_units.iter_mut() {
                retired_list.extend(unit.cycle(&mut ctx));
            }
            for unit in alu_units.iter_mut() {
                retired_list.extend(unit.cycle(&mut ctx));
            }
            retired_list.extend(invalidator.cycle(&mut ctx));
        }
        for retired in retired_list {
            self.retire(retired);
        }
    }

    fn retire(&mut self, retired: Retired) {
        log::debug!(
            "{} slot {} ({:?})",
            style("retire").bold(),
            retired.slot,
            retired.opcode
        );
        for dst in [retired.dst1_tile, retired.dst2_tile] {
            if let Some(dst) = dst {
                self.spd.set_ready(dst);
            }
        }
        self.stats.instructions.inc(retired.opcode.into(), 1);
        self.stats.sim.instructions_finished += 1;
        self.ifile
            .finish(retired.slot, retired.dst1_tile, retired.dst2_tile);
        self.dispatch();
    }

    /// Hand ready instructions to idle units of the matching type.
    fn dispatch(&mut self) {
        for unit_id in 0..self.stream_units.len() {
            if self.stream_units[unit_id].is_idle() {
                if let Some(instruction) = self.ifile.get_ready(FuncUnitKind::Stream) {
                    self.stream_units[unit_id].assign(instruction);
                }
            }
        }
        for unit_id in 0..self.indirect_units.len() {
            if self.indirect_units[unit_id].is_idle() {
                if let Some(instruction) = self.ifile.get_ready(FuncUnitKind::Indirect) {
                    self.indirect_units[unit_id].assign(instruction);
                }
            }
        }
        for unit_id in 0..self.range_units.len() {
            if self.range_units[unit_id].is_idle() {
                if let Some(instruction) = self.ifile.get_ready(FuncUnitKind::Range) {
                    self.range_units[unit_id].assign(instruction);
                }
            }
        }
        for unit_id in 0..self.alu_units.len() {
            if self.alu_units[unit_id].is_idle() {
                if let Some(instruction) = self.ifile.get_ready(FuncUnitKind::Alu) {
                    self.alu_units[unit_id].assign(instruction);
                }
            }
        }
        if self.invalidator.is_idle() {
            if let Some(instruction) = self.ifile.get_ready(FuncUnitKind::Invalidator) {
                self.invalidator.assign(instruction);
            }
        }
    }
}
