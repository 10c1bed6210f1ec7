//! Indirect access unit: gathers, scatters, and read-modify-writes through
//! an index tile. Generated addresses flow through per-unit row-table banks
//! so lines in the same DRAM row leave as one drained batch.
//!
//! The state machine mirrors the hardware phases: Fill inserts decoded
//! addresses into the row table, Drain flushes a full bank mid-fill, Build
//! turns the finished table into per-row batches, Request issues them under
//! the port budgets, Response retires once every reply is home.

use super::alu::apply;
use super::{ExecContext, Retired};
use crate::addrdec::{block_align, DramAddressMap, Translation, WORD_SIZE};
use crate::fifo::Fifo;
use crate::instruction::{Instruction, Opcode};
use crate::packet::{Builder, Issuer, Kind, Reply, Request};
use crate::row_table::{
    DrainEntry, InsertOutcome, OffsetChainLink, OffsetTable, RowDecodeCache, RowTable,
};
use crate::address;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Decode,
    Fill,
    Drain,
    Build,
    Request,
    Response,
}

/// A drained line in flight: where its words go once the reply arrives.
#[derive(Debug)]
struct PendingLine {
    chain: Vec<OffsetChainLink>,
}

#[derive(Debug)]
pub struct IndirectUnit {
    unit_id: usize,
    /// Inserts and drain issues per cycle, one per bank.
    per_cycle: usize,
    dram_map: DramAddressMap,
    translation: Translation,

    banks: Vec<RowTable>,
    offset_table: OffsetTable,
    decode_cache: RowDecodeCache,

    state: State,
    instruction: Option<Instruction>,
    my_i: usize,
    my_max: usize,
    drain_queue: Fifo<DrainEntry>,
    pending_reads: HashMap<u64, PendingLine>,
    /// RMW writebacks built from read replies, awaiting a port slot.
    writeback_queue: Fifo<Request>,
    expected: usize,
    received: usize,
}

impl IndirectUnit {
    #[must_use]
    pub fn new(
        unit_id: usize,
        num_tile_elements: usize,
        num_banks: usize,
        num_rows_per_bank: usize,
        num_entries_per_row: usize,
        num_decode_cache_entries: usize,
        dram_map: DramAddressMap,
        translation: Translation,
    ) -> Self {
        Self {
            unit_id,
            per_cycle: num_banks,
            dram_map,
            translation,
            banks: (0..num_banks)
                .map(|_| RowTable::new(num_rows_per_bank, num_entries_per_row))
                .collect(),
            offset_table: OffsetTable::new(num_tile_elements),
            decode_cache: RowDecodeCache::new(num_decode_cache_entries),
            state: State::Idle,
            instruction: None,
            my_i: 0,
            my_max: 0,
            drain_queue: Fifo::new(None),
            pending_reads: HashMap::new(),
            writeback_queue: Fifo::new(None),
            expected: 0,
            received: 0,
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    pub fn assign(&mut self, instruction: Instruction) {
        assert!(self.is_idle());
        log::debug!("I[{}] assigned {}", self.unit_id, instruction);
        self.instruction = Some(instruction);
        self.state = State::Decode;
    }

    pub fn cycle(&mut self, ctx: &mut ExecContext) -> Option<Retired> {
        self.flush_writebacks(ctx);
        match self.state {
            State::Idle => None,
            State::Decode => {
                self.decode(ctx);
                None
            }
            State::Fill => {
                self.fill(ctx);
                None
            }
            State::Drain => {
                self.issue_drained(ctx);
                if self.drain_queue.is_empty() {
                    self.state = State::Fill;
                }
                None
            }
            State::Build => {
                self.build(ctx);
                None
            }
            State::Request => {
                self.issue_drained(ctx);
                self.try_finish()
            }
            State::Response => {
                let instruction = self.instruction.take().unwrap();
                if instruction.opcode == Opcode::IndirectRead {
                    let dst = instruction.dst1_tile.expect("indirect read without dst");
                    ctx.spd.set_size(dst, self.my_max as u16);
                }
                assert!(self.offset_table.is_drained());
                assert!(self.banks.iter().all(RowTable::is_empty));
                log::debug!("I[{}] finished {}", self.unit_id, instruction);
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

    fn decode(&mut self, ctx: &mut ExecContext) {
        let instruction = self.instruction.as_ref().unwrap();
        if let Some(cond) = instruction.cond_tile {
            if !ctx.spd.get_ready(cond) {
                return;
            }
        }
        let idx_tile = instruction.src1_tile.expect("indirect without index tile");
        self.my_max = ctx.spd.get_size(idx_tile) as usize;
        if let Some(src) = instruction.src2_tile {
            assert_eq!(
                self.my_max,
                ctx.spd.get_size(src) as usize,
                "index/source size mismatch"
            );
        }
        self.my_i = 0;
        self.expected = 0;
        self.received = 0;
        self.state = State::Fill;
        log::debug!(
            "I[{}] filling {} elements through {} banks",
            self.unit_id,
            self.my_max,
            self.banks.len()
        );
    }

    fn fill(&mut self, ctx: &mut ExecContext) {
        let instruction = self.instruction.clone().unwrap();
        let idx_tile = instruction.src1_tile.unwrap();
        let mut accesses = 0u64;
        for _ in 0..self.per_cycle {
            if self.my_i == self.my_max {
                self.state = State::Build;
                break;
            }
            let i = self.my_i;
            let taken = match instruction.cond_tile {
                Some(cond) => {
                    accesses += 1;
                    ctx.spd.get_data(cond, i) != 0
                }
                None => true,
            };
            if !taken {
                if instruction.opcode == Opcode::IndirectRead {
                    let dst = instruction.dst1_tile.unwrap();
                    ctx.spd.set_data(dst, i, 0);
                    ctx.stats.spd.writes += 1;
                }
                self.my_i += 1;
                continue;
            }
            let index = ctx.spd.get_data(idx_tile, i);
            accesses += 1;
            let vaddr = instruction.base_addr + WORD_SIZE * address::from(index);
            let paddr = self
                .translation
                .translate(vaddr)
                .expect("indirect address outside translated range");
            let block_addr = block_align(paddr);
            let wid = ((paddr - block_addr) / WORD_SIZE) as usize;

            let coalescing = &mut ctx.stats.coalescing[self.unit_id];
            let (row_tag, bank) = match self.decode_cache.get(block_addr, ctx.cycle) {
                Some(decoded) => {
                    coalescing.decode_cache_hits += 1;
                    decoded
                }
                None => {
                    coalescing.decode_cache_misses += 1;
                    let coord = self.dram_map.decode(block_addr);
                    let decoded = (
                        self.dram_map.global_row(coord),
                        self.dram_map.row_table_bank(coord, self.banks.len()),
                    );
                    self.decode_cache
                        .put(block_addr, decoded.0, decoded.1, ctx.cycle);
                    decoded
                }
            };

            match self.banks[bank].insert(
                row_tag,
                block_addr,
                i,
                wid,
                ctx.cycle,
                &mut self.offset_table,
            ) {
                Ok(outcome) => {
                    coalescing.words_inserted += 1;
                    match outcome {
                        InsertOutcome::CoalescedWord => {}
                        InsertOutcome::CoalescedLine => coalescing.cache_lines_inserted += 1,
                        InsertOutcome::NewRow => {
                            coalescing.cache_lines_inserted += 1;
                            coalescing.rows_inserted += 1;
                        }
                    }
                    self.my_i += 1;
                }
                Err(_) => {
                    // least-recently-filled row makes room; its lines go
                    // downstream before the new tag starts filling
                    let batch = self.banks[bank]
                        .evict_oldest()
                        .expect("full bank with no evictable row");
                    log::trace!(
                        "I[{}] bank {bank} full, evicting row {:#x} ({} lines)",
                        self.unit_id,
                        batch.row_tag,
                        batch.entries.len()
                    );
                    coalescing.rows_evicted += 1;
                    coalescing.drains += 1;
                    for entry in batch.entries {
                        self.drain_queue.enqueue(entry);
                    }
                    self.state = State::Drain;
                    break;
                }
            }
        }
        if accesses > 0 {
            let (_, conflict) = ctx.spd.book_read(ctx.cycle, accesses);
            ctx.stats.spd.reads += accesses;
            ctx.stats.spd.port_conflicts += u64::from(conflict);
        }
    }

    fn build(&mut self, ctx: &mut ExecContext) {
        let coalescing = &mut ctx.stats.coalescing[self.unit_id];
        for bank in &mut self.banks {
            for batch in bank.drain_all() {
                coalescing.drains += 1;
                for entry in batch.entries {
                    self.drain_queue.enqueue(entry);
                }
            }
        }
        log::debug!(
            "I[{}] built {} drained lines",
            self.unit_id,
            self.drain_queue.len()
        );
        self.state = State::Request;
    }

    /// Issue drained lines, at most one per bank per cycle, blocking on the
    /// port budget.
    fn issue_drained(&mut self, ctx: &mut ExecContext) {
        let instruction = self.instruction.clone().unwrap();
        for _ in 0..self.per_cycle {
            if self.drain_queue.is_empty() {
                break;
            }
            let port = match instruction.opcode {
                Opcode::IndirectRead => &mut *ctx.cache_port,
                Opcode::IndirectWrite | Opcode::IndirectReadModifyWrite => &mut *ctx.mem_port,
                opcode => unreachable!("indirect unit given {opcode:?}"),
            };
            if !port.can_issue(Issuer::Indirect(self.unit_id)) {
                port.stats.stalls += 1;
                break;
            }
            let entry = self.drain_queue.dequeue().unwrap();
            let chain = self.offset_table.take_chain(entry.first_itr);
            let request = match instruction.opcode {
                Opcode::IndirectRead | Opcode::IndirectReadModifyWrite => {
                    let mut builder = Builder::read(entry.addr, Issuer::Indirect(self.unit_id));
                    for link in &chain {
                        builder.word_mask.set(link.wid, true);
                    }
                    let request = builder.build();
                    self.pending_reads
                        .insert(request.uid, PendingLine { chain });
                    request
                }
                Opcode::IndirectWrite => {
                    let src = instruction.src2_tile.expect("indirect write without src");
                    let mut builder = Builder::write(entry.addr, Issuer::Indirect(self.unit_id));
                    for link in &chain {
                        builder.word_mask.set(link.wid, true);
                        builder.data[link.wid] = ctx.spd.get_data(src, link.itr);
                    }
                    ctx.stats.spd.reads += chain.len() as u64;
                    builder.build()
                }
                _ => unreachable!(),
            };
            self.expected += 1;
            port.try_issue(request).expect("issue after can_issue check");
        }
    }

    fn flush_writebacks(&mut self, ctx: &mut ExecContext) {
        while let Some(request) = self.writeback_queue.first() {
            if !ctx.mem_port.can_issue(request.issuer) {
                ctx.mem_port.stats.stalls += 1;
                break;
            }
            let request = self.writeback_queue.dequeue().unwrap();
            self.expected += 1;
            ctx.mem_port
                .try_issue(request)
                .expect("issue after can_issue check");
        }
    }

    /// Route a reply back through the offset chains.
    pub fn accept_reply(&mut self, reply: &Reply, ctx: &mut ExecContext) -> Option<Retired> {
        let instruction = self.instruction.clone().unwrap();
        match reply.kind {
            Kind::ReadReply => {
                let pending = self
                    .pending_reads
                    .remove(&reply.uid)
                    .expect("read reply for unknown uid");
                match instruction.opcode {
                    Opcode::IndirectRead => {
                        let dst = instruction.dst1_tile.unwrap();
                        let (_, conflict) =
                            ctx.spd.book_write(ctx.cycle, pending.chain.len() as u64);
                        ctx.stats.spd.writes += pending.chain.len() as u64;
                        ctx.stats.spd.port_conflicts += u64::from(conflict);
                        for link in &pending.chain {
                            ctx.spd.set_data(dst, link.itr, reply.data[link.wid]);
                        }
                    }
                    Opcode::IndirectReadModifyWrite => {
                        let src = instruction.src2_tile.expect("indirect rmw without src");
                        let op = instruction.op.expect("indirect rmw without op");
                        let mut builder =
                            Builder::write(reply.addr, Issuer::Indirect(self.unit_id));
                        builder.data = reply.data;
                        for link in &pending.chain {
                            builder.word_mask.set(link.wid, true);
                            builder.data[link.wid] = apply(
                                op,
                                instruction.datatype,
                                builder.data[link.wid],
                                ctx.spd.get_data(src, link.itr),
                            );
                        }
                        ctx.stats.spd.reads += pending.chain.len() as u64;
                        self.writeback_queue.enqueue(builder.build());
                    }
                    _ => unreachable!("read reply for {:?}", instruction.opcode),
                }
            }
            Kind::WriteAck => {}
            kind => unreachable!("indirect unit received {kind:?}"),
        }
        self.received += 1;
        self.flush_writebacks(ctx);
        self.try_finish()
    }

    fn try_finish(&mut self) -> Option<Retired> {
        let done = self.state == State::Request
            && self.drain_queue.is_empty()
            && self.writeback_queue.is_empty()
            && self.pending_reads.is_empty()
            && self.received == self.expected;
        if done {
            self.state = State::Response;
        }
        None
    }
}
