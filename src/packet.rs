//! Downstream request/reply packets exchanged with the cache-side and
//! memory-side ports. Every request carries a unique id; outstanding-packet
//! accounting and reply routing match on it.

use super::address;
use bitvec::BitArr;
use once_cell::sync::Lazy;
use std::sync::atomic;

pub const WORDS_PER_BLOCK: usize = (super::addrdec::BLOCK_SIZE / super::addrdec::WORD_SIZE) as usize;

/// Which words of a 64-byte block a packet actually touches.
pub type WordMask = BitArr!(for WORDS_PER_BLOCK);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    ReadRequest,
    WriteRequest,
    InvalidateRequest,
    ReadReply,
    WriteAck,
    InvalidateAck,
}

impl Kind {
    #[must_use]
    pub fn is_reply(self) -> bool {
        matches!(self, Kind::ReadReply | Kind::WriteAck | Kind::InvalidateAck)
    }
}

/// The execution unit a packet originates from, used to route its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Issuer {
    Stream(usize),
    Indirect(usize),
    Invalidator,
}

impl std::fmt::Display for Issuer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Issuer::Stream(id) => write!(f, "S[{id}]"),
            Issuer::Indirect(id) => write!(f, "I[{id}]"),
            Issuer::Invalidator => write!(f, "INV"),
        }
    }
}

static PACKET_UID: Lazy<atomic::AtomicU64> = Lazy::new(|| atomic::AtomicU64::new(0));

/// Generate a unique id for matching requests with replies.
pub fn generate_uid() -> u64 {
    PACKET_UID.fetch_add(1, atomic::Ordering::SeqCst)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub uid: u64,
    /// Block-aligned physical address.
    pub addr: address,
    pub kind: Kind,
    pub word_mask: WordMask,
    /// Write payload; ignored for reads and invalidates.
    pub data: [u32; WORDS_PER_BLOCK],
    pub issuer: Issuer,
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:?}(uid={}, addr={:#x}, {} from {})",
            self.kind,
            self.uid,
            self.addr,
            self.word_mask.count_ones(),
            self.issuer
        )
    }
}

#[derive(Debug, Clone)]
pub struct Builder {
    pub addr: address,
    pub kind: Kind,
    pub word_mask: WordMask,
    pub data: [u32; WORDS_PER_BLOCK],
    pub issuer: Issuer,
}

impl Builder {
    #[must_use]
    pub fn read(addr: address, issuer: Issuer) -> Self {
        Self {
            addr,
            kind: Kind::ReadRequest,
            word_mask: WordMask::ZERO,
            data: [0; WORDS_PER_BLOCK],
            issuer,
        }
    }

    #[must_use]
    pub fn write(addr: address, issuer: Issuer) -> Self {
        Self {
            kind: Kind::WriteRequest,
            ..Self::read(addr, issuer)
        }
    }

    #[must_use]
    pub fn invalidate(addr: address, issuer: Issuer) -> Self {
        Self {
            kind: Kind::InvalidateRequest,
            ..Self::read(addr, issuer)
        }
    }

    #[must_use]
    pub fn build(self) -> Request {
        debug_assert_eq!(self.addr, super::addrdec::block_align(self.addr));
        assert!(!self.kind.is_reply());
        Request {
            uid: generate_uid(),
            addr: self.addr,
            kind: self.kind,
            word_mask: self.word_mask,
            data: self.data,
            issuer: self.issuer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub uid: u64,
    pub addr: address,
    pub kind: Kind,
    pub word_mask: WordMask,
    pub data: [u32; WORDS_PER_BLOCK],
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}(uid={}, addr={:#x})", self.kind, self.uid, self.addr)
    }
}

impl Request {
    /// Turn a serviced request into its reply, carrying `data` for reads.
    #[must_use]
    pub fn into_reply(self, data: [u32; WORDS_PER_BLOCK]) -> Reply {
        let kind = match self.kind {
            Kind::ReadRequest => Kind::ReadReply,
            Kind::WriteRequest => Kind::WriteAck,
            Kind::InvalidateRequest => Kind::InvalidateAck,
            Kind::ReadReply | Kind::WriteAck | Kind::InvalidateAck => {
                unreachable!("reply kinds are never issued")
            }
        };
        Reply {
            uid: self.uid,
            addr: self.addr,
            kind,
            word_mask: self.word_mask,
            data,
        }
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.kind == Kind::WriteRequest
    }
}
