use thiserror::Error;

/// Failures reported by every allocator in the hierarchy.
///
/// Misuse that would corrupt the heap (foreign pointers, double frees,
/// oversize requests to fixed-length pools) is caught in every build profile
/// and reported here instead of being left undefined.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("out of memory requesting {size} bytes")]
    OutOfMemory { size: usize },

    #[error("request of {size} bytes exceeds the element size of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("{allocator} cannot grow an allocation to {size} bytes (capacity {limit})")]
    CannotGrow {
        allocator: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("pointer {addr:#x} was not allocated by this {allocator}")]
    NotOwned { addr: usize, allocator: &'static str },

    #[error("pointer {addr:#x} is not on an element boundary")]
    Misaligned { addr: usize },

    #[error("double free of pointer {addr:#x}")]
    DoubleFree { addr: usize },

    #[error("allocator still has {live} live allocations")]
    InUse { live: usize },

    #[error("allocator is owned by another thread")]
    WrongThread,

    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),

    #[error("OS heap operation failed: {0}")]
    Os(#[from] std::io::Error),
}

impl AllocError {
    pub(crate) fn not_owned(ptr: *const u8, allocator: &'static str) -> Self {
        Self::NotOwned {
            addr: ptr.addr(),
            allocator,
        }
    }
}
