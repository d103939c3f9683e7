use std::fmt;
use std::ptr::NonNull;

use super::BufferError;
use crate::memory::{Allocator, MAX_ALIGN};
use crate::sync::Arc;
use crate::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Bytes at the start of every buffer allocation reserved for its header.
pub const BUFFER_HEADER: usize = MAX_ALIGN;

/// Life cycle of a [`Buffer`].
///
/// `New`, `Locked` and `Used` belong to the producer; `Ready` and `Pending`
/// to the consumer side.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BufState {
    Free = 0,
    New = 1,
    Locked = 2,
    Used = 4,
    Ready = 8,
    /// Output buffer waiting to be sent.
    Pending = 16,
}

impl BufState {
    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Self::New,
            2 => Self::Locked,
            4 => Self::Used,
            8 => Self::Ready,
            16 => Self::Pending,
            _ => Self::Free,
        }
    }
}

#[repr(C)]
struct Header {
    state: AtomicU32,
    id: u16,
    queue: u16,
    num_bytes: u32,
}

const _: () = assert!(size_of::<Header>() <= BUFFER_HEADER);

/// Fixed-size I/O buffer minted by a [`BufferQueue`](super::BufferQueue) or
/// [`ThreadQueue`](super::ThreadQueue).
///
/// The header lives at the front of the allocation, followed by the data
/// area. A `Buffer` is owned: submitting it moves it into a ready queue and
/// processing moves it out again, so it is never on two lists at once.
/// Dropping it returns the memory to the allocator it came from.
pub struct Buffer {
    header: NonNull<Header>,
    data_size: usize,
    alloc: Arc<dyn Allocator>,
    outstanding: Arc<AtomicUsize>,
}

// Safety: the buffer exclusively owns its allocation; the allocator is Sync.
unsafe impl Send for Buffer {}

impl Buffer {
    /// Allocate `buf_size` bytes from `alloc` and construct a `New` buffer.
    pub(crate) fn new_in(
        alloc: Arc<dyn Allocator>,
        buf_size: usize,
        outstanding: Arc<AtomicUsize>,
    ) -> Result<Self, BufferError> {
        let data_size = buf_size
            .checked_sub(BUFFER_HEADER)
            .filter(|&n| n > 0 && u32::try_from(n).is_ok())
            .ok_or(BufferError::BadBufSize { size: buf_size })?;
        // Counted before the memory exists so `empty` never releases blocks
        // under a buffer still being built.
        outstanding.fetch_add(1, Ordering::AcqRel);
        let raw = match alloc.alloc(buf_size) {
            Ok(raw) => raw,
            Err(e) => {
                outstanding.fetch_sub(1, Ordering::AcqRel);
                return Err(e.into());
            }
        };
        let header = raw.cast::<Header>();
        // Safety: `raw` spans `buf_size` bytes, more than a header, and every
        // allocator aligns to at least a word.
        unsafe {
            header.as_ptr().write(Header {
                state: AtomicU32::new(BufState::New as u32),
                id: 0,
                queue: 0,
                num_bytes: data_size as u32,
            });
        }
        log::trace!("new buffer @ {raw:p}, {data_size} data bytes");
        Ok(Self {
            header,
            data_size,
            alloc,
            outstanding,
        })
    }

    fn header(&self) -> &Header {
        // Safety: the header lives as long as the buffer.
        unsafe { self.header.as_ref() }
    }

    fn header_mut(&mut self) -> &mut Header {
        // Safety: as above, and `&mut self` is exclusive.
        unsafe { self.header.as_mut() }
    }

    /// Allocator slot or caller-defined identifier.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.header().id
    }

    pub fn set_id(&mut self, id: u16) {
        self.header_mut().id = id;
    }

    /// Ready queue the buffer goes to on submit.
    #[must_use]
    pub fn queue(&self) -> u16 {
        self.header().queue
    }

    pub fn set_queue(&mut self, queue: u16) {
        self.header_mut().queue = queue;
    }

    #[must_use]
    pub fn state(&self) -> BufState {
        BufState::from_bits(self.header().state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: BufState) {
        self.header().state.store(state as u32, Ordering::Release);
    }

    /// Move to `new` only if the buffer is currently in `test`.
    pub fn test_set_state(&self, new: BufState, test: BufState) -> bool {
        self.header()
            .state
            .compare_exchange(test as u32, new as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Bytes of the data area in use. Starts at the full data size.
    #[must_use]
    pub fn num_bytes(&self) -> usize {
        self.header().num_bytes as usize
    }

    /// # Errors
    /// `BufferSize` when `n` exceeds the data area.
    pub fn set_num_bytes(&mut self, n: usize) -> Result<(), BufferError> {
        if n > self.data_size {
            return Err(BufferError::BufferSize {
                requested: n,
                capacity: self.data_size,
            });
        }
        self.header_mut().num_bytes = n as u32;
        Ok(())
    }

    /// Size of the data area.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data_size
    }

    /// The used part of the data area.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        // Safety: the data area follows the header and holds `data_size`
        // bytes; `num_bytes` never exceeds it.
        unsafe { std::slice::from_raw_parts(self.data_ptr(), self.num_bytes()) }
    }

    /// The whole data area.
    pub fn data_mut(&mut self) -> &mut [u8] {
        // Safety: as for `data`, and `&mut self` is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr(), self.data_size) }
    }

    fn data_ptr(&self) -> *mut u8 {
        // Safety: the allocation is `BUFFER_HEADER + data_size` bytes.
        unsafe { self.header.cast::<u8>().as_ptr().add(BUFFER_HEADER) }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.set_state(BufState::Free);
        let raw = self.header.cast::<u8>();
        // Safety: the header was written in `new_in` and is not used again.
        unsafe { self.header.as_ptr().drop_in_place() };
        // Safety: `raw` came from `alloc` and this is its only release.
        if let Err(e) = unsafe { self.alloc.free(raw) } {
            log::error!("buffer @ {raw:p}: {e}");
        }
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id())
            .field("queue", &self.queue())
            .field("state", &self.state())
            .field("num_bytes", &self.num_bytes())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::{AllocOptions, FixedLenAllocator};

    fn buffer(size: usize) -> (Arc<FixedLenAllocator>, Arc<AtomicUsize>, Buffer) {
        let alloc = Arc::new(FixedLenAllocator::with_options(size, 4, AllocOptions::DEFAULT_ALIGN, None).unwrap());
        let outstanding = Arc::new(AtomicUsize::new(0));
        let buf = Buffer::new_in(alloc.clone(), size, outstanding.clone()).unwrap();
        (alloc, outstanding, buf)
    }

    #[test]
    fn new_buffer_is_new_and_full_size() {
        let (_alloc, outstanding, buf) = buffer(256);
        assert_eq!(buf.state(), BufState::New);
        assert_eq!(buf.num_bytes(), 256 - BUFFER_HEADER);
        assert_eq!(buf.capacity(), 256 - BUFFER_HEADER);
        assert_eq!((buf.id(), buf.queue()), (0, 0));
        assert_eq!(outstanding.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn data_area_is_writable_and_trimmed_by_num_bytes() {
        let (_alloc, _outstanding, mut buf) = buffer(64);
        buf.data_mut()[..5].copy_from_slice(b"hello");
        buf.set_num_bytes(5).unwrap();
        assert_eq!(buf.data(), b"hello");
        assert!(matches!(buf.set_num_bytes(49), Err(BufferError::BufferSize { requested: 49, .. })));
    }

    #[test]
    fn test_set_state_only_moves_from_the_expected_state() {
        let (_alloc, _outstanding, buf) = buffer(64);
        assert!(!buf.test_set_state(BufState::Ready, BufState::Used));
        assert!(buf.test_set_state(BufState::Used, BufState::New));
        assert!(buf.test_set_state(BufState::Ready, BufState::Used));
        assert_eq!(buf.state(), BufState::Ready);
        assert!(BufState::Ready >= BufState::Used);
    }

    #[test]
    fn drop_returns_the_memory() {
        let (alloc, outstanding, buf) = buffer(64);
        assert_eq!(alloc.live_count(), 1);
        drop(buf);
        assert_eq!(alloc.live_count(), 0);
        assert_eq!(outstanding.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn header_sized_buffers_are_rejected() {
        let alloc: Arc<dyn Allocator> = Arc::new(FixedLenAllocator::new(16, 4).unwrap());
        let outstanding = Arc::new(AtomicUsize::new(0));
        assert!(matches!(
            Buffer::new_in(alloc, BUFFER_HEADER, outstanding),
            Err(BufferError::BadBufSize { .. })
        ));
    }
}
