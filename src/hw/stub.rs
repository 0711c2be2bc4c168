//! Host-memory stub substrate.
//!
//! Implements the `hw` traits over plain heap buffers and interprets the
//! command stream at submit time, maintaining the image-status register
//! the way the hardware would (including the conditional pass skip).
//! The interpreted log is what integration tests inspect.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::error::{EncodeError, Result};
use crate::hw::{
    ops, Allocator, BufferHandle, BufferKind, CommandStream, SurfaceId, SurfaceInfo,
    SurfaceRegistry,
};

/// Default coded size reported per PAK execute when no result is queued.
pub const DEFAULT_PAK_BYTES: u32 = 48_000;

/// One command as interpreted by the stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutedOp {
    PipeFlush,
    KernelDispatch {
        stage: u32,
        variant: u32,
        grid_w: u32,
        grid_h: u32,
        walker: u32,
    },
    ImageState {
        qp: u32,
        pass: u32,
    },
    StatusReset(u32),
    /// `taken` is true when the remainder of the group was skipped.
    CondPassSkip {
        target: u32,
        taken: bool,
    },
    PakExecute {
        output: BufferHandle,
        bytes: u32,
    },
    StatusReadback {
        buffer: BufferHandle,
        dword_offset: u32,
        pass: u32,
    },
}

struct StubBuffer {
    data: Vec<u8>,
    kind: BufferKind,
    tag: &'static str,
    mapped: bool,
    mappable: bool,
}

/// Stub device: allocator + command interpreter + surface registry.
pub struct StubDevice {
    buffers: HashMap<u64, StubBuffer>,
    next_handle: u64,
    surfaces: HashMap<SurfaceId, SurfaceInfo>,

    open_group: Option<Vec<u32>>,
    pending_groups: Vec<Vec<u32>>,
    /// Everything the interpreter has run, across all submits.
    executed: Vec<ExecutedOp>,

    status_register: u32,
    /// Coded sizes to report for upcoming PAK executes, front first.
    pak_results: VecDeque<u32>,

    /// Failure injection.
    allocs_until_failure: Option<u32>,
    fail_submit: bool,

    total_allocs: u64,
    total_frees: u64,
}

impl StubDevice {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
            next_handle: 1,
            surfaces: HashMap::new(),
            open_group: None,
            pending_groups: Vec::new(),
            executed: Vec::new(),
            status_register: 0,
            pak_results: VecDeque::new(),
            allocs_until_failure: None,
            fail_submit: false,
            total_allocs: 0,
            total_frees: 0,
        }
    }

    /// Register a caller surface with the stub registry.
    pub fn register_surface(&mut self, id: SurfaceId, width: u32, height: u32) {
        self.surfaces.insert(
            id,
            SurfaceInfo {
                width,
                height,
                pitch: (width + 63) & !63,
                chroma_offset: ((width + 63) & !63) * height,
            },
        );
    }

    /// Queue the coded size the next PAK executes will report.
    pub fn queue_pak_result(&mut self, bytes: u32) {
        self.pak_results.push_back(bytes);
    }

    /// Make mapping `handle` fail, to exercise the builder abort path.
    pub fn poison_mapping(&mut self, handle: BufferHandle) {
        if let Some(buf) = self.buffers.get_mut(&handle.0) {
            buf.mappable = false;
        }
    }

    /// Fail the allocation after `n` more successes.
    pub fn fail_alloc_after(&mut self, n: u32) {
        self.allocs_until_failure = Some(n);
    }

    pub fn clear_alloc_failure(&mut self) {
        self.allocs_until_failure = None;
    }

    pub fn set_fail_submit(&mut self, fail: bool) {
        self.fail_submit = fail;
    }

    /// Interpreted command log, across all submits so far.
    pub fn executed(&self) -> &[ExecutedOp] {
        &self.executed
    }

    pub fn clear_log(&mut self) {
        self.executed.clear();
    }

    /// Number of live (allocated and not freed) buffers.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn total_allocs(&self) -> u64 {
        self.total_allocs
    }

    pub fn total_frees(&self) -> u64 {
        self.total_frees
    }

    /// Copy out a buffer's contents (test inspection).
    pub fn buffer_bytes(&self, handle: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&handle.0).map(|b| b.data.as_slice())
    }

    /// Number of live buffers of the given kind (test inspection).
    pub fn live_by_kind(&self, kind: BufferKind) -> usize {
        self.buffers.values().filter(|b| b.kind == kind).count()
    }

    fn write_dword(&mut self, handle: u64, dword_offset: usize, value: u32) {
        if let Some(buf) = self.buffers.get_mut(&handle) {
            let at = dword_offset * 4;
            if at + 4 <= buf.data.len() {
                buf.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }

    fn run_group(&mut self, words: &[u32]) {
        let mut i = 0;
        // Uniform encoding: [opcode, payload_len, payload...].
        while i + 1 < words.len() {
            let opcode = words[i];
            let len = words[i + 1] as usize;
            let payload_at = i + 2;
            if payload_at + len > words.len() {
                debug!(opcode, "stub: truncated command, stopping group");
                return;
            }
            let payload = &words[payload_at..payload_at + len];

            match opcode {
                ops::PIPE_FLUSH => self.executed.push(ExecutedOp::PipeFlush),
                ops::KERNEL_DISPATCH => {
                    self.executed.push(ExecutedOp::KernelDispatch {
                        stage: payload[0],
                        variant: payload[1],
                        grid_w: payload[2],
                        grid_h: payload[3],
                        walker: payload[4],
                    });
                }
                ops::IMAGE_STATE => {
                    self.executed.push(ExecutedOp::ImageState {
                        qp: payload[0],
                        pass: payload[1],
                    });
                }
                ops::STATUS_RESET => {
                    self.status_register = payload[0];
                    self.executed.push(ExecutedOp::StatusReset(payload[0]));
                }
                ops::COND_PASS_SKIP => {
                    let target = payload[0];
                    let taken = self.status_register != 0 && self.status_register <= target;
                    self.executed.push(ExecutedOp::CondPassSkip { target, taken });
                    if taken {
                        // Hardware drops the remainder of this group.
                        return;
                    }
                }
                ops::PAK_EXECUTE => {
                    let output =
                        BufferHandle((payload[0] as u64) | ((payload[1] as u64) << 32));
                    let bytes = self.pak_results.pop_front().unwrap_or(DEFAULT_PAK_BYTES);
                    self.status_register = bytes;
                    self.executed.push(ExecutedOp::PakExecute { output, bytes });
                }
                ops::STATUS_READBACK => {
                    let buffer =
                        BufferHandle((payload[0] as u64) | ((payload[1] as u64) << 32));
                    let dword_offset = payload[2];
                    let pass = payload[3];
                    let status = self.status_register;
                    self.write_dword(buffer.0, dword_offset as usize, status);
                    self.write_dword(buffer.0, dword_offset as usize + 1, 1);
                    self.executed.push(ExecutedOp::StatusReadback {
                        buffer,
                        dword_offset,
                        pass,
                    });
                }
                other => {
                    debug!(opcode = other, "stub: unknown opcode, skipping");
                }
            }

            i = payload_at + len;
        }
    }
}

impl Default for StubDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for StubDevice {
    fn alloc(
        &mut self,
        kind: BufferKind,
        size: usize,
        _align: usize,
        tag: &'static str,
    ) -> Result<BufferHandle> {
        if let Some(remaining) = self.allocs_until_failure {
            if remaining == 0 {
                return Err(EncodeError::AllocationFailure(format!(
                    "injected failure allocating {tag}"
                )));
            }
            self.allocs_until_failure = Some(remaining - 1);
        }

        let handle = self.next_handle;
        self.next_handle += 1;
        self.buffers.insert(
            handle,
            StubBuffer {
                data: vec![0u8; size],
                kind,
                tag,
                mapped: false,
                mappable: true,
            },
        );
        self.total_allocs += 1;
        debug!(handle, ?kind, size, tag, "stub: alloc");
        Ok(BufferHandle(handle))
    }

    fn free(&mut self, handle: BufferHandle) {
        if let Some(buf) = self.buffers.remove(&handle.0) {
            self.total_frees += 1;
            debug!(handle = handle.0, tag = buf.tag, "stub: free");
        }
    }

    fn map(&mut self, handle: BufferHandle) -> Option<(*mut u8, usize)> {
        let buf = self.buffers.get_mut(&handle.0)?;
        if !buf.mappable || buf.mapped {
            return None;
        }
        buf.mapped = true;
        Some((buf.data.as_mut_ptr(), buf.data.len()))
    }

    fn unmap(&mut self, handle: BufferHandle) {
        if let Some(buf) = self.buffers.get_mut(&handle.0) {
            buf.mapped = false;
        }
    }
}

impl CommandStream for StubDevice {
    fn begin(&mut self, size_hint: usize) {
        debug_assert!(self.open_group.is_none(), "nested command group");
        self.open_group = Some(Vec::with_capacity(size_hint));
    }

    fn emit(&mut self, words: &[u32]) {
        if let Some(group) = self.open_group.as_mut() {
            group.extend_from_slice(words);
        }
    }

    fn end(&mut self) {
        if let Some(group) = self.open_group.take() {
            self.pending_groups.push(group);
        }
    }

    fn abort(&mut self) {
        self.open_group = None;
    }

    fn submit(&mut self) -> Result<()> {
        if self.fail_submit {
            self.pending_groups.clear();
            return Err(EncodeError::SubmissionFailure(
                "injected submit failure".to_string(),
            ));
        }
        let groups = std::mem::take(&mut self.pending_groups);
        for group in groups {
            self.run_group(&group);
        }
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        // Interpretation happens synchronously at submit; nothing pending.
        Ok(())
    }
}

impl SurfaceRegistry for StubDevice {
    fn surface_info(&self, id: SurfaceId) -> Option<SurfaceInfo> {
        self.surfaces.get(&id).copied()
    }
}
