//! Aligned, zero-initialized memory for instruction bodies

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{CodeError, Result};
use crate::globals::{Address, CODE_ALIGNMENT, round_up};

/// Owned block of code memory aligned to [`CODE_ALIGNMENT`].
///
/// The block is zeroed on allocation, so any byte the owner never writes is
/// deterministic padding.
pub struct CodeBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: the buffer exclusively owns its allocation; shared access only
// hands out `&[u8]` and mutation requires `&mut self`.
unsafe impl Send for CodeBuffer {}
// SAFETY: see above, `&CodeBuffer` only permits reads.
unsafe impl Sync for CodeBuffer {}

impl CodeBuffer {
    /// Allocate `len` zeroed bytes. The allocation is rounded up to the code
    /// alignment and never empty, so even a zero-length buffer has a unique
    /// address.
    pub fn new(len: usize) -> Result<Self> {
        let size = round_up(len.max(1), CODE_ALIGNMENT);
        let layout =
            Layout::from_size_align(size, CODE_ALIGNMENT).map_err(|_| CodeError::AllocationFailed(len))?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(CodeError::AllocationFailed(len))?;
        Ok(Self { ptr, len, layout })
    }

    /// Allocate and copy `bytes` in
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut buffer = Self::new(bytes.len())?;
        buffer.as_mut_slice().copy_from_slice(bytes);
        Ok(buffer)
    }

    /// Usable length
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length buffer
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte
    #[inline]
    pub fn address(&self) -> Address {
        self.ptr.as_ptr() as Address
    }

    /// Contents
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for `layout.size() >= len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable contents
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for CodeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeBuffer")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len)
            .finish()
    }
}

/// Make freshly written instructions in `[start, start + size)` visible to
/// instruction fetch. Must run before first execution and after every patch.
pub fn flush_instruction_cache(start: Address, size: usize) {
    if size == 0 {
        return;
    }
    flush_range(start, size);
    tracing::trace!(
        target: "otter::code",
        start = format_args!("{start:#x}"),
        size,
        "flushed instruction cache"
    );
}

#[cfg(target_arch = "aarch64")]
fn flush_range(start: Address, size: usize) {
    use std::arch::asm;

    let ctr: u64;
    // SAFETY: CTR_EL0 is readable from EL0 on every supported OS.
    unsafe { asm!("mrs {0}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags)) };
    let dcache_line = 4usize << ((ctr >> 16) & 0xF);
    let icache_line = 4usize << (ctr & 0xF);
    let end = start + size;

    let mut line = start & !(dcache_line - 1);
    while line < end {
        // SAFETY: cache maintenance on mapped memory owned by the caller.
        unsafe { asm!("dc cvau, {0}", in(reg) line, options(nostack, preserves_flags)) };
        line += dcache_line;
    }
    // SAFETY: barrier only.
    unsafe { asm!("dsb ish", options(nostack, preserves_flags)) };

    let mut line = start & !(icache_line - 1);
    while line < end {
        // SAFETY: as above.
        unsafe { asm!("ic ivau, {0}", in(reg) line, options(nostack, preserves_flags)) };
        line += icache_line;
    }
    // SAFETY: barriers only.
    unsafe { asm!("dsb ish", "isb", options(nostack, preserves_flags)) };
}

#[cfg(not(target_arch = "aarch64"))]
fn flush_range(_start: Address, _size: usize) {
    // x86 keeps instruction fetch coherent with stores; only keep the
    // compiler from sinking the writes past this point.
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_and_zeroing() {
        let buffer = CodeBuffer::new(70).unwrap();
        assert_eq!(buffer.address() % CODE_ALIGNMENT, 0);
        assert_eq!(buffer.len(), 70);
        assert!(buffer.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_empty_buffer_has_address() {
        let a = CodeBuffer::new(0).unwrap();
        let b = CodeBuffer::new(0).unwrap();
        assert!(a.is_empty());
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn test_flush_preserves_content() {
        let buffer = CodeBuffer::from_slice(&[0x90, 0xC3]).unwrap();
        flush_instruction_cache(buffer.address(), buffer.len());
        assert_eq!(buffer.as_slice(), &[0x90, 0xC3]);
    }
}
