//! Fixed-size query slot table
//!
//! 65,536 slots, one per DNS transaction id; the slot's array index *is*
//! the id it represents. Every slot is on exactly one of two index-linked
//! doubly linked lists: `free` (available ids) or `outstanding` (in
//! flight). The outstanding list is kept in send-time order: newly sent
//! slots prepend, so the tail is always the oldest outstanding request
//! and timeout pruning walks from the tail and stops at the first young
//! slot. All moves are O(1).
//!
//! The table is only ever touched under the worker mutex.

use thiserror::Error;

use super::NQIDS;

/// Timestamp sentinel for a slot that is allocated but not yet
/// transmitted; a reply matching such a slot is unexpected.
pub const UNSENT: u64 = u64::MAX;

/// Socket marker for a slot that has not been assigned a socket yet.
pub const NO_SOCKET: u32 = u32::MAX;

const NIL: u32 = u32::MAX;

/// Which list currently holds a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Free,
    Outstanding,
}

/// Where a released slot re-enters the free list: the front for a
/// rollback before commit (keeps ids dense for the next send attempt),
/// the back for normal completion and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseTo {
    FreeFront,
    FreeBack,
}

/// The free list is empty; the caller must apply backpressure.
#[derive(Debug, Error)]
#[error("no free query slots")]
pub struct Exhausted;

#[derive(Debug)]
struct Slot {
    timestamp: u64,
    sock: u32,
    desc: Option<Box<str>>,
    list: Membership,
    prev: u32,
    next: u32,
}

#[derive(Debug)]
pub struct QueryTable {
    slots: Vec<Slot>,
    free_head: u32,
    free_tail: u32,
    out_head: u32,
    out_tail: u32,
    out_len: usize,
}

impl QueryTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NQIDS);
        for i in 0..NQIDS as u32 {
            slots.push(Slot {
                timestamp: UNSENT,
                sock: NO_SOCKET,
                desc: None,
                list: Membership::Free,
                prev: if i == 0 { NIL } else { i - 1 },
                next: if i == NQIDS as u32 - 1 { NIL } else { i + 1 },
            });
        }
        QueryTable {
            slots,
            free_head: 0,
            free_tail: NQIDS as u32 - 1,
            out_head: NIL,
            out_tail: NIL,
            out_len: 0,
        }
    }

    /// Take the head of the free list, prepend it to outstanding and
    /// stamp the unsent sentinel. The returned index is the transaction
    /// id to send with.
    pub fn allocate(&mut self) -> Result<u16, Exhausted> {
        let idx = self.free_head;
        if idx == NIL {
            return Err(Exhausted);
        }
        self.unlink(idx);
        self.push_front(Membership::Outstanding, idx);
        let slot = &mut self.slots[idx as usize];
        slot.timestamp = UNSENT;
        slot.sock = NO_SOCKET;
        slot.desc = None;
        Ok(idx as u16)
    }

    /// Record the send timestamp. The slot stays at the head of
    /// outstanding, preserving send-time order.
    pub fn commit(&mut self, qid: u16, now: u64) {
        debug_assert_eq!(self.slots[qid as usize].list, Membership::Outstanding);
        self.slots[qid as usize].timestamp = now;
    }

    pub fn set_socket(&mut self, qid: u16, sock: u32) {
        self.slots[qid as usize].sock = sock;
    }

    pub fn set_desc(&mut self, qid: u16, desc: &str) {
        self.slots[qid as usize].desc = Some(desc.into());
    }

    /// Unlink from outstanding and return to the free list, detaching
    /// the description (the caller owns it from here).
    pub fn release(&mut self, qid: u16, to: ReleaseTo) -> Option<Box<str>> {
        let idx = qid as u32;
        debug_assert_eq!(self.slots[qid as usize].list, Membership::Outstanding);
        self.unlink(idx);
        match to {
            ReleaseTo::FreeFront => self.push_front(Membership::Free, idx),
            ReleaseTo::FreeBack => self.push_back(Membership::Free, idx),
        }
        self.slots[qid as usize].desc.take()
    }

    /// Tail of the outstanding list: the oldest sent request.
    pub fn oldest(&self) -> Option<u16> {
        if self.out_tail == NIL {
            None
        } else {
            Some(self.out_tail as u16)
        }
    }

    pub fn timestamp(&self, qid: u16) -> u64 {
        self.slots[qid as usize].timestamp
    }

    pub fn socket(&self, qid: u16) -> u32 {
        self.slots[qid as usize].sock
    }

    pub fn membership(&self, qid: u16) -> Membership {
        self.slots[qid as usize].list
    }

    pub fn outstanding_len(&self) -> usize {
        self.out_len
    }

    pub fn free_len(&self) -> usize {
        NQIDS - self.out_len
    }

    /// Outstanding ids from head (newest) to tail (oldest).
    pub fn outstanding_ids(&self) -> Vec<u16> {
        let mut ids = Vec::with_capacity(self.out_len);
        let mut cur = self.out_head;
        while cur != NIL {
            ids.push(cur as u16);
            cur = self.slots[cur as usize].next;
        }
        ids
    }

    fn head(&self, list: Membership) -> u32 {
        match list {
            Membership::Free => self.free_head,
            Membership::Outstanding => self.out_head,
        }
    }

    fn set_head(&mut self, list: Membership, idx: u32) {
        match list {
            Membership::Free => self.free_head = idx,
            Membership::Outstanding => self.out_head = idx,
        }
    }

    fn tail(&self, list: Membership) -> u32 {
        match list {
            Membership::Free => self.free_tail,
            Membership::Outstanding => self.out_tail,
        }
    }

    fn set_tail(&mut self, list: Membership, idx: u32) {
        match list {
            Membership::Free => self.free_tail = idx,
            Membership::Outstanding => self.out_tail = idx,
        }
    }

    fn unlink(&mut self, idx: u32) {
        let i = idx as usize;
        let prev = self.slots[i].prev;
        let next = self.slots[i].next;
        let list = self.slots[i].list;
        if prev != NIL {
            self.slots[prev as usize].next = next;
        } else {
            self.set_head(list, next);
        }
        if next != NIL {
            self.slots[next as usize].prev = prev;
        } else {
            self.set_tail(list, prev);
        }
        self.slots[i].prev = NIL;
        self.slots[i].next = NIL;
        if list == Membership::Outstanding {
            self.out_len -= 1;
        }
    }

    fn push_front(&mut self, list: Membership, idx: u32) {
        let head = self.head(list);
        let i = idx as usize;
        self.slots[i].prev = NIL;
        self.slots[i].next = head;
        self.slots[i].list = list;
        if head != NIL {
            self.slots[head as usize].prev = idx;
        } else {
            self.set_tail(list, idx);
        }
        self.set_head(list, idx);
        if list == Membership::Outstanding {
            self.out_len += 1;
        }
    }

    fn push_back(&mut self, list: Membership, idx: u32) {
        let tail = self.tail(list);
        let i = idx as usize;
        self.slots[i].next = NIL;
        self.slots[i].prev = tail;
        self.slots[i].list = list;
        if tail != NIL {
            self.slots[tail as usize].next = idx;
        } else {
            self.set_head(list, idx);
        }
        self.set_tail(list, idx);
        if list == Membership::Outstanding {
            self.out_len += 1;
        }
    }
}

impl Default for QueryTable {
    fn default() -> Self {
        Self::new()
    }
}
