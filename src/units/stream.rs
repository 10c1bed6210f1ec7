//! Stream access unit: strided memory-to-scratchpad reads. Per-element
//! requests falling in one cache block are merged through a fixed-geometry
//! request table before they reach the cache-side port.

use super::{ExecContext, Retired};
use crate::addrdec::{block_align, Translation, WORD_SIZE};
use crate::instruction::Instruction;
use crate::packet::{Builder, Issuer, Reply, Request, WordMask};
use crate::address;

pub const NUM_REQUEST_TABLE_ADDRESSES: usize = 32;
pub const NUM_REQUEST_TABLE_ENTRIES_PER_ADDRESS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTableEntry {
    /// Destination element in the tile.
    pub itr: usize,
    /// Word within the cache block.
    pub wid: usize,
}

/// Block-granularity merge table: up to 32 in-flight block addresses with
/// 16 word entries each (one per block word).
#[derive(Debug)]
pub struct RequestTable {
    addresses: [Option<address>; NUM_REQUEST_TABLE_ADDRESSES],
    entries: [[Option<RequestTableEntry>; NUM_REQUEST_TABLE_ENTRIES_PER_ADDRESS];
        NUM_REQUEST_TABLE_ADDRESSES],
}

impl Default for RequestTable {
    fn default() -> Self {
        Self {
            addresses: [None; NUM_REQUEST_TABLE_ADDRESSES],
            entries: [[None; NUM_REQUEST_TABLE_ENTRIES_PER_ADDRESS];
                NUM_REQUEST_TABLE_ADDRESSES],
        }
    }
}

impl RequestTable {
    /// Track `(itr, wid)` under a block address. False when all address rows
    /// are taken by other blocks; the caller must wait for replies.
    pub fn add_entry(&mut self, itr: usize, block_addr: address, wid: usize) -> bool {
        let row = match self
            .addresses
            .iter()
            .position(|addr| *addr == Some(block_addr))
        {
            Some(row) => row,
            None => match self.addresses.iter().position(Option::is_none) {
                Some(row) => {
                    self.addresses[row] = Some(block_addr);
                    row
                }
                None => return false,
            },
        };
        let free = self.entries[row]
            .iter()
            .position(Option::is_none)
            .expect("block has more entries than words");
        self.entries[row][free] = Some(RequestTableEntry { itr, wid });
        true
    }

    /// Take all entries merged under a block address, freeing its row.
    pub fn take_entries(&mut self, block_addr: address) -> Vec<RequestTableEntry> {
        let Some(row) = self
            .addresses
            .iter()
            .position(|addr| *addr == Some(block_addr))
        else {
            return Vec::new();
        };
        self.addresses[row] = None;
        self.entries[row]
            .iter_mut()
            .filter_map(Option::take)
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.iter().all(Option::is_none)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Decode,
    Request,
    Response,
}

#[derive(Debug)]
pub struct StreamUnit {
    unit_id: usize,
    num_tile_elements: usize,
    translation: Translation,
    state: State,
    instruction: Option<Instruction>,
    request_table: RequestTable,

    my_i: i64,
    my_max: i64,
    my_stride: i64,
    my_idx: usize,
    my_base_addr: address,
    current_block: Option<address>,
    current_mask: WordMask,
    /// Packet the port refused; retried before any new work.
    deferred: Option<Request>,
    issued: usize,
    received: usize,
}

impl StreamUnit {
    #[must_use]
    pub fn new(unit_id: usize, num_tile_elements: usize, translation: Translation) -> Self {
        Self {
            unit_id,
            num_tile_elements,
            translation,
            state: State::Idle,
            instruction: None,
            request_table: RequestTable::default(),
            my_i: 0,
            my_max: 0,
            my_stride: 1,
            my_idx: 0,
            my_base_addr: 0,
            current_block: None,
            current_mask: WordMask::ZERO,
            deferred: None,
            issued: 0,
            received: 0,
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    pub fn assign(&mut self, instruction: Instruction) {
        assert!(self.is_idle());
        log::debug!("S[{}] assigned {}", self.unit_id, instruction);
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
                self.my_i = i64::from(
                    ctx.rf
                        .get_signed(instruction.src1_reg.expect("stream without min reg")),
                );
                self.my_max = i64::from(
                    ctx.rf
                        .get_signed(instruction.src2_reg.expect("stream without max reg")),
                );
                self.my_stride = i64::from(
                    ctx.rf
                        .get_signed(instruction.src3_reg.expect("stream without stride reg")),
                );
                assert!(self.my_stride > 0, "stream stride must be positive");
                self.my_base_addr = instruction.base_addr;
                self.my_idx = 0;
                self.current_block = None;
                self.current_mask = WordMask::ZERO;
                self.issued = 0;
                self.received = 0;
                self.state = State::Request;
                None
            }
            State::Request => {
                self.run_request(ctx);
                self.try_finish(ctx)
            }
            State::Response => self.try_finish(ctx),
        }
    }

    fn run_request(&mut self, ctx: &mut ExecContext) {
        if !self.flush_deferred(ctx) {
            return;
        }
        let instruction = self.instruction.clone().unwrap();
        let dst = instruction.dst1_tile.expect("stream without dst tile");
        while self.my_i < self.my_max && self.my_idx < self.num_tile_elements {
            let taken = match instruction.cond_tile {
                Some(cond) => {
                    ctx.stats.spd.reads += 1;
                    ctx.spd.get_data(cond, self.my_idx) != 0
                }
                None => true,
            };
            if taken {
                let vaddr = self.my_base_addr + WORD_SIZE * self.my_i as address;
                let paddr = self
                    .translation
                    .translate(vaddr)
                    .expect("stream address outside translated range");
                let block_addr = block_align(paddr);
                let wid = ((paddr - block_addr) / WORD_SIZE) as usize;
                if self.current_block.is_some() && self.current_block != Some(block_addr) {
                    if !self.issue_current_block(ctx) {
                        return;
                    }
                }
                if !self.request_table.add_entry(self.my_idx, block_addr, wid) {
                    log::trace!(
                        "S[{}] request table full at element {}",
                        self.unit_id,
                        self.my_idx
                    );
                    return;
                }
                self.current_block = Some(block_addr);
                self.current_mask.set(wid, true);
            } else {
                // gap in the output tile; size still covers it
                ctx.spd.set_data(dst, self.my_idx, 0);
                ctx.stats.spd.writes += 1;
            }
            self.my_i += self.my_stride;
            self.my_idx += 1;
        }
        if self.issue_current_block(ctx) {
            log::debug!(
                "S[{}] all {} requests issued, awaiting {} replies",
                self.unit_id,
                self.issued,
                self.issued - self.received
            );
            self.state = State::Response;
        }
    }

    /// Send the read for the block being accumulated. True when nothing was
    /// pending or the port took it.
    fn issue_current_block(&mut self, ctx: &mut ExecContext) -> bool {
        let Some(block_addr) = self.current_block.take() else {
            return true;
        };
        let mut builder = Builder::read(block_addr, Issuer::Stream(self.unit_id));
        builder.word_mask = self.current_mask;
        self.current_mask = WordMask::ZERO;
        let request = builder.build();
        self.issued += 1;
        match ctx.cache_port.try_issue(request) {
            Ok(()) => true,
            Err(request) => {
                self.deferred = Some(request);
                false
            }
        }
    }

    fn flush_deferred(&mut self, ctx: &mut ExecContext) -> bool {
        let Some(request) = self.deferred.take() else {
            return true;
        };
        match ctx.cache_port.try_issue(request) {
            Ok(()) => true,
            Err(request) => {
                self.deferred = Some(request);
                false
            }
        }
    }

    /// Scatter a cache-side reply into the destination tile.
    pub fn accept_reply(&mut self, reply: &Reply, ctx: &mut ExecContext) -> Option<Retired> {
        debug_assert!(matches!(self.state, State::Request | State::Response));
        let instruction = self.instruction.clone().unwrap();
        let dst = instruction.dst1_tile.expect("stream without dst tile");
        let entries = self.request_table.take_entries(reply.addr);
        assert!(!entries.is_empty(), "stream reply for unknown block");
        let (_, conflict) = ctx.spd.book_write(ctx.cycle, entries.len() as u64);
        ctx.stats.spd.writes += entries.len() as u64;
        ctx.stats.spd.port_conflicts += u64::from(conflict);
        for entry in entries {
            ctx.spd.set_data(dst, entry.itr, reply.data[entry.wid]);
        }
        self.received += 1;
        self.try_finish(ctx)
    }

    fn try_finish(&mut self, ctx: &mut ExecContext) -> Option<Retired> {
        let done = self.state == State::Response
            && self.deferred.is_none()
            && self.received == self.issued
            && self.request_table.is_empty();
        if !done {
            return None;
        }
        let instruction = self.instruction.take().unwrap();
        let dst = instruction.dst1_tile.unwrap();
        ctx.spd.set_size(dst, self.my_idx as u16);
        log::debug!("S[{}] finished {}", self.unit_id, instruction);
        self.state = State::Idle;
        Some(Retired {
            slot: instruction.slot,
            opcode: instruction.opcode,
            dst1_tile: instruction.dst1_tile,
            dst2_tile: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_table_merges_words_per_block() {
        let mut table = RequestTable::default();
        assert!(table.add_entry(0, 0x1000, 0));
        assert!(table.add_entry(1, 0x1000, 1));
        assert!(table.add_entry(2, 0x1040, 0));

        let entries = table.take_entries(0x1000);
        assert_eq!(
            entries,
            vec![
                RequestTableEntry { itr: 0, wid: 0 },
                RequestTableEntry { itr: 1, wid: 1 },
            ]
        );
        assert!(!table.is_empty());
        table.take_entries(0x1040);
        assert!(table.is_empty());
    }

    #[test]
    fn request_table_refuses_when_all_rows_taken() {
        let mut table = RequestTable::default();
        for row in 0..NUM_REQUEST_TABLE_ADDRESSES {
            assert!(table.add_entry(row, (row as u64) * 0x40, 0));
        }
        assert!(!table.add_entry(99, 0xffff_0000, 0));
        // an already-tracked block still accepts entries
        assert!(table.add_entry(100, 0, 1));
    }
}
