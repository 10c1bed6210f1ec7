//! Invalidator: evicts stale copies of scratchpad-backed cache lines from
//! the cache hierarchy before a tile is reused. Its packets ride the
//! memory-side port, on the budget slot reserved for it.

use super::{ExecContext, Retired};
use crate::addrdec::BLOCK_SIZE;
use crate::instruction::Instruction;
use crate::packet::{Builder, Issuer, Kind, Reply, Request};
use crate::packet::WORDS_PER_BLOCK;
use crate::address;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Decode,
    Request,
    Response,
}

#[derive(Debug)]
pub struct Invalidator {
    num_tiles: usize,
    blocks_per_tile: usize,
    /// Start of the cacheable scratchpad data range.
    spd_base: address,
    /// Which scratchpad-backed lines the cache hierarchy may hold.
    cl_cached: Vec<bool>,

    state: State,
    instruction: Option<Instruction>,
    my_cl: usize,
    deferred: Option<Request>,
    expected: usize,
    received: usize,
}

impl Invalidator {
    #[must_use]
    pub fn new(num_tiles: usize, num_tile_elements: usize, spd_base: address) -> Self {
        let blocks_per_tile = num_tile_elements.div_ceil(WORDS_PER_BLOCK);
        Self {
            num_tiles,
            blocks_per_tile,
            spd_base,
            cl_cached: vec![false; num_tiles * blocks_per_tile],
            state: State::Idle,
            instruction: None,
            my_cl: 0,
            deferred: None,
            expected: 0,
            received: 0,
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    fn cl_id(&self, tile_id: usize, block: usize) -> usize {
        tile_id * self.blocks_per_tile + block
    }

    fn cl_addr(&self, cl_id: usize) -> address {
        self.spd_base + cl_id as address * BLOCK_SIZE
    }

    /// Record that the CPU pulled a scratchpad line through the caches.
    pub fn note_cached(&mut self, tile_id: usize, element_id: usize) {
        let cl_id = self.cl_id(tile_id, element_id / WORDS_PER_BLOCK);
        self.cl_cached[cl_id] = true;
    }

    #[must_use]
    pub fn is_cached(&self, tile_id: usize, element_id: usize) -> bool {
        self.cl_cached[self.cl_id(tile_id, element_id / WORDS_PER_BLOCK)]
    }

    pub fn assign(&mut self, instruction: Instruction) {
        assert!(self.is_idle());
        log::debug!("INV assigned {}", instruction);
        self.instruction = Some(instruction);
        self.state = State::Decode;
    }

    pub fn cycle(&mut self, ctx: &mut ExecContext) -> Option<Retired> {
        match self.state {
            State::Idle => None,
            State::Decode => {
                self.my_cl = 0;
                self.expected = 0;
                self.received = 0;
                self.state = State::Request;
                None
            }
            State::Request => {
                self.run_request(ctx);
                self.try_finish()
            }
            State::Response => {
                let instruction = self.instruction.take().unwrap();
                log::debug!("INV finished {}", instruction);
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

    fn run_request(&mut self, ctx: &mut ExecContext) {
        if let Some(request) = self.deferred.take() {
            if let Err(request) = ctx.mem_port.try_issue(request) {
                self.deferred = Some(request);
                return;
            }
        }
        let instruction = self.instruction.as_ref().unwrap();
        let tile_id = instruction.dst1_tile.expect("invalidate without tile");
        while self.my_cl < self.blocks_per_tile {
            let cl_id = self.cl_id(tile_id, self.my_cl);
            if self.cl_cached[cl_id] {
                let request =
                    Builder::invalidate(self.cl_addr(cl_id), Issuer::Invalidator).build();
                self.expected += 1;
                if let Err(request) = ctx.mem_port.try_issue(request) {
                    self.deferred = Some(request);
                    return;
                }
            }
            self.my_cl += 1;
        }
    }

    pub fn accept_reply(&mut self, reply: &Reply, _ctx: &mut ExecContext) -> Option<Retired> {
        assert_eq!(reply.kind, Kind::InvalidateAck);
        let cl_id = ((reply.addr - self.spd_base) / BLOCK_SIZE) as usize;
        assert!(cl_id < self.num_tiles * self.blocks_per_tile);
        self.cl_cached[cl_id] = false;
        self.received += 1;
        self.try_finish()
    }

    fn try_finish(&mut self) -> Option<Retired> {
        let done = self.state == State::Request
            && self.deferred.is_none()
            && self.my_cl == self.blocks_per_tile
            && self.received == self.expected;
        if done {
            self.state = State::Response;
        }
        None
    }
}
