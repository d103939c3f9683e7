//! Block headers linking the large blocks an allocator obtained from its
//! delegate.
//!
//! Each block starts with a [`Chain`] header recording the next block, the
//! block length and the allocator the block came from, so a block is always
//! returned to its own delegate even if the owner's delegate changes later.

use std::ptr::NonNull;

use super::allocator::{Allocator, MAX_ALIGN};
use super::error::AllocError;
use crate::sync::Arc;

#[repr(C)]
pub(crate) struct Chain {
    next: Option<NonNull<Chain>>,
    /// Whole block length, header included.
    len: usize,
    alloc: Arc<dyn Allocator>,
}

pub const CHAIN_HEADER: usize = std::mem::size_of::<Chain>();

const _: () = assert!(CHAIN_HEADER % MAX_ALIGN == 0);

/// Intrusive singly-linked list of blocks, newest first.
pub(crate) struct ChainList {
    head: Option<NonNull<Chain>>,
    count: usize,
    bytes: usize,
}

// Safety: the list exclusively owns its blocks; the delegates are Send + Sync.
unsafe impl Send for ChainList {}

impl Default for ChainList {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainList {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            count: 0,
            bytes: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Total bytes held, headers included.
    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    /// Acquire a block with `payload` usable bytes from `alloc` and link it at
    /// the head. Returns the payload start.
    pub(crate) fn push(
        &mut self,
        alloc: &Arc<dyn Allocator>,
        payload: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let chain = Self::acquire(alloc, payload)?;
        // Safety: `chain` was just initialised by `acquire`.
        unsafe { (*chain.as_ptr()).next = self.head };
        self.head = Some(chain);
        self.count += 1;
        self.bytes += CHAIN_HEADER + payload;
        Ok(Self::payload(chain))
    }

    /// Like [`push`](Self::push) but links the block behind the head, leaving
    /// the head block current.
    pub(crate) fn push_second(
        &mut self,
        alloc: &Arc<dyn Allocator>,
        payload: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let Some(head) = self.head else {
            return self.push(alloc, payload);
        };
        let chain = Self::acquire(alloc, payload)?;
        // Safety: both headers are live and owned by this list.
        unsafe {
            (*chain.as_ptr()).next = (*head.as_ptr()).next;
            (*head.as_ptr()).next = Some(chain);
        }
        self.count += 1;
        self.bytes += CHAIN_HEADER + payload;
        Ok(Self::payload(chain))
    }

    fn acquire(alloc: &Arc<dyn Allocator>, payload: usize) -> Result<NonNull<Chain>, AllocError> {
        let len = CHAIN_HEADER
            .checked_add(payload)
            .ok_or(AllocError::OutOfMemory { size: payload })?;
        let chain = alloc.alloc(len)?.cast::<Chain>();
        // Safety: the delegate returned `len >= CHAIN_HEADER` bytes aligned to
        // at least MAX_ALIGN.
        unsafe {
            chain.as_ptr().write(Chain {
                next: None,
                len,
                alloc: Arc::clone(alloc),
            });
        }
        log::debug!("acquired {len} byte block from {}", alloc.name());
        Ok(chain)
    }

    fn payload(chain: NonNull<Chain>) -> NonNull<u8> {
        // Safety: every block is at least CHAIN_HEADER bytes long.
        unsafe { chain.cast::<u8>().add(CHAIN_HEADER) }
    }

    /// Payload start and payload length of every block, newest first.
    pub(crate) fn blocks(&self) -> impl Iterator<Item = (NonNull<u8>, usize)> + '_ {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let chain = cur?;
            // Safety: the list owns every linked header.
            let (next, len) = unsafe { ((*chain.as_ptr()).next, (*chain.as_ptr()).len) };
            cur = next;
            Some((Self::payload(chain), len - CHAIN_HEADER))
        })
    }

    /// Unlink and release the block whose payload starts at `payload`.
    /// Returns the released payload length.
    pub(crate) fn remove(&mut self, payload: NonNull<u8>) -> Option<usize> {
        let mut prev: Option<NonNull<Chain>> = None;
        let mut cur = self.head;
        while let Some(chain) = cur {
            // Safety: the list owns every linked header.
            let next = unsafe { (*chain.as_ptr()).next };
            if Self::payload(chain) == payload {
                match prev {
                    // Safety: as above.
                    Some(p) => unsafe { (*p.as_ptr()).next = next },
                    None => self.head = next,
                }
                let len = Self::release(chain);
                self.count -= 1;
                self.bytes -= len;
                return Some(len - CHAIN_HEADER);
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Return every block to the allocator it came from.
    pub(crate) fn release_all(&mut self) {
        let mut cur = self.head.take();
        while let Some(chain) = cur {
            // Safety: the list owns every linked header.
            cur = unsafe { (*chain.as_ptr()).next };
            Self::release(chain);
        }
        self.count = 0;
        self.bytes = 0;
    }

    fn release(chain: NonNull<Chain>) -> usize {
        // Safety: the header is live; it is moved out before the block memory
        // is handed back, so the delegate handle outlives the block.
        let Chain { len, alloc, .. } = unsafe { chain.as_ptr().read() };
        // Safety: the block came from `alloc` and is no longer linked.
        if let Err(e) = unsafe { alloc.free(chain.cast()) } {
            log::error!("failed to release {len} byte block to {}: {e}", alloc.name());
        }
        len
    }
}

impl Drop for ChainList {
    fn drop(&mut self) {
        self.release_all();
    }
}
