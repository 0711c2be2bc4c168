//! Hardware substrate interface boundary.
//!
//! The control plane never talks to real hardware directly; it issues
//! work through the traits in this module. The substrate guarantees that
//! commands execute in submission order on one in-order queue, and that
//! `wait_idle` completes all previously submitted commands before any
//! CPU-side buffer read.
//!
//! `hw::stub` provides a host-memory implementation that records and
//! interprets every command word, used by the test harness and for
//! dry-run command inspection.

pub mod stub;

use crate::error::{EncodeError, Result};
use std::ops::{Deref, DerefMut};

/// Opaque handle to a substrate-owned buffer or surface allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Opaque handle to a caller-owned picture surface.
///
/// The caller's surface registry resolves this to pixel-buffer metadata;
/// the control plane only attaches derived resources to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u32);

/// Allocation categories understood by the substrate.
///
/// The kind selects placement and alignment policy on real hardware; the
/// control plane treats it as an opaque tag plus a debug aid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Tiled 2D pixel surface (pyramid levels, weighted-prediction output).
    Surface2d,
    /// Linear byte buffer (scratch, slice maps).
    Linear,
    /// Motion-vector store.
    MotionVector,
    /// Distortion / statistics store read back by software.
    Statistics,
    /// Coded bitstream output.
    Bitstream,
    /// Kernel parameter-block (curbe) region.
    KernelState,
}

/// Pixel-buffer metadata for a registered surface.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceInfo {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    /// Byte offset of the chroma plane within the surface allocation.
    pub chroma_offset: u32,
}

/// Command stream opcodes.
///
/// One header word per command (`opcode` then payload length), payload
/// words following. The stub interprets these; a real backend would
/// translate them into its native command formats.
pub mod ops {
    /// Pipeline flush barrier between producer and consumer stages.
    pub const PIPE_FLUSH: u32 = 0x01;
    /// Kernel dispatch: payload = stage id, variant id, grid w, grid h, walker.
    pub const KERNEL_DISPATCH: u32 = 0x02;
    /// Picture-level image state load: payload = qp, pass index.
    pub const IMAGE_STATE: u32 = 0x03;
    /// Reset the hardware image-status register: payload = value.
    pub const STATUS_RESET: u32 = 0x04;
    /// Conditional early exit: payload = target byte budget. Skips the
    /// remainder of the current command group when the status register
    /// reports a coded size within budget.
    pub const COND_PASS_SKIP: u32 = 0x05;
    /// Packetization execute: payload = output buffer handle (lo, hi).
    pub const PAK_EXECUTE: u32 = 0x06;
    /// Store status into a buffer: payload = buffer handle (lo, hi),
    /// dword offset, pass index.
    pub const STATUS_READBACK: u32 = 0x07;
}

/// In-order hardware command queue.
///
/// Commands between `begin` and `end` form one command group. A group is
/// executed atomically in submission order; `COND_PASS_SKIP` can skip the
/// remainder of its own group only.
pub trait CommandStream {
    /// Open a command group. `size_hint` is the expected payload size in
    /// words; the substrate may over-allocate.
    fn begin(&mut self, size_hint: usize);

    /// Append raw command words to the open group.
    fn emit(&mut self, words: &[u32]);

    /// Close the open group.
    fn end(&mut self);

    /// Discard the open group without queueing it (frame abort).
    fn abort(&mut self);

    /// Submit all closed groups for execution.
    fn submit(&mut self) -> Result<()>;

    /// Block until all submitted commands have completed. Required before
    /// any CPU-side read of a buffer the hardware wrote.
    fn wait_idle(&mut self) -> Result<()>;
}

/// Buffer allocation and mapping.
pub trait Allocator {
    fn alloc(
        &mut self,
        kind: BufferKind,
        size: usize,
        align: usize,
        tag: &'static str,
    ) -> Result<BufferHandle>;

    fn free(&mut self, handle: BufferHandle);

    /// Map a buffer for CPU access. Returns `None` when the region is not
    /// mappable. Implies that prior hardware writes to the buffer have
    /// completed (the substrate inserts the wait).
    fn map(&mut self, handle: BufferHandle) -> Option<(*mut u8, usize)>;

    fn unmap(&mut self, handle: BufferHandle);
}

/// Caller-side surface registry: resolves opaque picture handles to
/// pixel-buffer metadata.
pub trait SurfaceRegistry {
    fn surface_info(&self, id: SurfaceId) -> Option<SurfaceInfo>;
}

/// Full substrate surface the session is generic over.
pub trait HwDevice: CommandStream + Allocator + SurfaceRegistry {}
impl<T: CommandStream + Allocator + SurfaceRegistry> HwDevice for T {}

/// Scoped buffer mapping with guaranteed unmap on all exit paths.
pub struct MapGuard<'a, A: Allocator + ?Sized> {
    alloc: &'a mut A,
    handle: BufferHandle,
    ptr: *mut u8,
    len: usize,
}

impl<'a, A: Allocator + ?Sized> MapGuard<'a, A> {
    /// Map `handle`, returning `MapFailure` naming `what` if the region is
    /// not mappable.
    pub fn new(alloc: &'a mut A, handle: BufferHandle, what: &str) -> Result<Self> {
        let (ptr, len) = alloc
            .map(handle)
            .ok_or_else(|| EncodeError::MapFailure(what.to_string()))?;
        Ok(Self {
            alloc,
            handle,
            ptr,
            len,
        })
    }

    /// Reinterpret the mapping as little-endian dwords and overwrite the
    /// leading `words.len()` entries.
    pub fn write_words(&mut self, words: &[u32]) {
        let bytes: &mut [u8] = self;
        for (i, w) in words.iter().enumerate() {
            let at = i * 4;
            if at + 4 > bytes.len() {
                break;
            }
            bytes[at..at + 4].copy_from_slice(&w.to_le_bytes());
        }
    }

    /// Read the dword at `index`.
    pub fn read_word(&self, index: usize) -> u32 {
        let bytes: &[u8] = self;
        let at = index * 4;
        if at + 4 > bytes.len() {
            return 0;
        }
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }
}

impl<A: Allocator + ?Sized> Deref for MapGuard<'_, A> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        // Valid for the lifetime of the guard: the allocator keeps the
        // mapping alive until unmap, and the guard holds the allocator
        // borrow exclusively.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<A: Allocator + ?Sized> DerefMut for MapGuard<'_, A> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl<A: Allocator + ?Sized> Drop for MapGuard<'_, A> {
    fn drop(&mut self) {
        self.alloc.unmap(self.handle);
    }
}
