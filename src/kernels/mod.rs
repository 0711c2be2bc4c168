//! Kernel execution contexts, parameter blocks, and binding tables.
//!
//! One builder per kernel stage lives in a submodule; each produces a
//! fixed-size parameter block plus a surface binding table for one
//! dispatch. Kernel contexts are long-lived: allocated once at session
//! init, their binding tables reset before every dispatch.

pub mod aux_stages;
pub mod brc;
pub mod hme;
pub mod mbenc;
pub mod scale;

use std::collections::HashMap;

use crate::error::Result;
use crate::hw::{ops, Allocator, BufferHandle, BufferKind, CommandStream, MapGuard, SurfaceId};

/// Kernel pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelStage {
    Scale4x,
    Scale16x,
    Scale32x,
    Hme32x,
    Hme16x,
    Hme4x,
    MbEnc,
    BrcInit,
    BrcFrameUpdate,
    BrcMbUpdate,
    StaticSceneDetect,
    WeightedPred,
}

impl KernelStage {
    pub fn id(self) -> u32 {
        match self {
            KernelStage::Scale4x => 0,
            KernelStage::Scale16x => 1,
            KernelStage::Scale32x => 2,
            KernelStage::Hme32x => 3,
            KernelStage::Hme16x => 4,
            KernelStage::Hme4x => 5,
            KernelStage::MbEnc => 6,
            KernelStage::BrcInit => 7,
            KernelStage::BrcFrameUpdate => 8,
            KernelStage::BrcMbUpdate => 9,
            KernelStage::StaticSceneDetect => 10,
            KernelStage::WeightedPred => 11,
        }
    }

    /// Scaling stage for an octave index (0 = 4x).
    pub fn scale_for_octave(octave: usize) -> KernelStage {
        match octave {
            0 => KernelStage::Scale4x,
            1 => KernelStage::Scale16x,
            _ => KernelStage::Scale32x,
        }
    }

    /// Motion-estimation stage for an octave index (0 = 4x).
    pub fn hme_for_octave(octave: usize) -> KernelStage {
        match octave {
            0 => KernelStage::Hme4x,
            1 => KernelStage::Hme16x,
            _ => KernelStage::Hme32x,
        }
    }
}

/// Inter-macroblock data-dependency hint consumed by the hardware
/// thread scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkerPattern {
    /// No cross-MB dependency (scaling, BRC kernels).
    Independent,
    /// 26-degree wavefront: each MB depends on its left and upper-right
    /// neighbors (motion estimation).
    Wavefront26,
    /// 45-degree wavefront: left and upper neighbors (MB encode).
    Wavefront45,
}

impl WalkerPattern {
    pub fn id(self) -> u32 {
        match self {
            WalkerPattern::Independent => 0,
            WalkerPattern::Wavefront26 => 1,
            WalkerPattern::Wavefront45 => 2,
        }
    }
}

/// Hardware kernel generation the parameter blocks are laid out for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceGen {
    Gen9,
    Gen11,
}

/// Parameter-block (curbe) size in dwords for a stage on a generation.
///
/// The literal field layouts are static data from the hardware
/// description; only the sizes matter to the control plane.
pub fn curbe_dwords(gen: DeviceGen, stage: KernelStage) -> usize {
    let base = match stage {
        KernelStage::Scale4x | KernelStage::Scale16x | KernelStage::Scale32x => 12,
        KernelStage::Hme4x | KernelStage::Hme16x | KernelStage::Hme32x => 40,
        KernelStage::MbEnc => 88,
        KernelStage::BrcInit => 24,
        KernelStage::BrcFrameUpdate => 32,
        KernelStage::BrcMbUpdate => 16,
        KernelStage::StaticSceneDetect => 12,
        KernelStage::WeightedPred => 16,
    };
    match gen {
        DeviceGen::Gen9 => base,
        // Gen11 widened the MB-encode and HME curbes.
        DeviceGen::Gen11 => match stage {
            KernelStage::MbEnc => base + 8,
            KernelStage::Hme4x | KernelStage::Hme16x | KernelStage::Hme32x => base + 4,
            _ => base,
        },
    }
}

/// A fixed-size kernel parameter block, tagged by the hardware
/// generation whose layout it follows. Callers stay generation-agnostic:
/// they construct through [`ParameterBlock::new`] and poke dwords.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterBlock {
    Gen9 { stage: KernelStage, words: Vec<u32> },
    Gen11 { stage: KernelStage, words: Vec<u32> },
}

impl ParameterBlock {
    pub fn new(gen: DeviceGen, stage: KernelStage) -> Self {
        let words = vec![0u32; curbe_dwords(gen, stage)];
        match gen {
            DeviceGen::Gen9 => ParameterBlock::Gen9 { stage, words },
            DeviceGen::Gen11 => ParameterBlock::Gen11 { stage, words },
        }
    }

    pub fn gen(&self) -> DeviceGen {
        match self {
            ParameterBlock::Gen9 { .. } => DeviceGen::Gen9,
            ParameterBlock::Gen11 { .. } => DeviceGen::Gen11,
        }
    }

    pub fn stage(&self) -> KernelStage {
        match self {
            ParameterBlock::Gen9 { stage, .. } | ParameterBlock::Gen11 { stage, .. } => *stage,
        }
    }

    pub fn words(&self) -> &[u32] {
        match self {
            ParameterBlock::Gen9 { words, .. } | ParameterBlock::Gen11 { words, .. } => words,
        }
    }

    fn words_mut(&mut self) -> &mut [u32] {
        match self {
            ParameterBlock::Gen9 { words, .. } | ParameterBlock::Gen11 { words, .. } => words,
        }
    }

    /// Set dword `index`; out-of-layout writes are a builder bug.
    pub fn set(&mut self, index: usize, value: u32) {
        let words = self.words_mut();
        debug_assert!(index < words.len(), "curbe write past layout");
        if index < words.len() {
            words[index] = value;
        }
    }

    pub fn get(&self, index: usize) -> u32 {
        self.words().get(index).copied().unwrap_or(0)
    }

    /// Pack two u16 values into one dword (lo, hi).
    pub fn set_pair(&mut self, index: usize, lo: u16, hi: u16) {
        self.set(index, (lo as u32) | ((hi as u32) << 16));
    }
}

/// One entry in a surface binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Binding {
    /// Optional surface absent for this dispatch.
    #[default]
    None,
    Buffer(BufferHandle),
    Surface(SurfaceId),
}

impl Binding {
    pub fn is_bound(&self) -> bool {
        !matches!(self, Binding::None)
    }
}

/// Ordered mapping from a stage-local slot index to a concrete resource.
#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    slots: Vec<Binding>,
}

impl BindingTable {
    pub fn with_slots(count: usize) -> Self {
        Self {
            slots: vec![Binding::None; count],
        }
    }

    pub fn bind(&mut self, slot: usize, binding: Binding) {
        debug_assert!(slot < self.slots.len(), "binding past table");
        if slot < self.slots.len() {
            self.slots[slot] = binding;
        }
    }

    pub fn get(&self, slot: usize) -> Binding {
        self.slots.get(slot).copied().unwrap_or(Binding::None)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn bound_count(&self) -> usize {
        self.slots.iter().filter(|b| b.is_bound()).count()
    }

    /// Clear every slot back to the not-bound sentinel.
    pub fn reset(&mut self) {
        self.slots.fill(Binding::None);
    }
}

/// Long-lived execution context for one kernel stage variant.
pub struct KernelContext {
    pub stage: KernelStage,
    /// Hardware kernel variant id (preset/frame-type selection for MB
    /// encode, octave for motion estimation).
    pub variant: u16,
    /// Parameter-block region in kernel-state memory.
    pub curbe: BufferHandle,
    pub curbe_bytes: usize,
    /// Reset before every dispatch.
    pub bindings: BindingTable,
    pub walker: WalkerPattern,
}

impl KernelContext {
    pub fn new<A: Allocator + ?Sized>(
        alloc: &mut A,
        gen: DeviceGen,
        stage: KernelStage,
        variant: u16,
        walker: WalkerPattern,
        binding_slots: usize,
    ) -> Result<Self> {
        let curbe_bytes = curbe_dwords(gen, stage) * 4;
        let curbe = alloc.alloc(BufferKind::KernelState, curbe_bytes, 64, "kernel curbe")?;
        Ok(Self {
            stage,
            variant,
            curbe,
            curbe_bytes,
            bindings: BindingTable::with_slots(binding_slots),
            walker,
        })
    }

    /// Write a built parameter block into the context's curbe region.
    ///
    /// An unmappable region aborts the stage (`MapFailure`); the caller
    /// treats this as fatal for the frame and does not retry.
    pub fn load_parameter_block<A: Allocator + ?Sized>(
        &mut self,
        alloc: &mut A,
        block: &ParameterBlock,
    ) -> Result<()> {
        debug_assert_eq!(block.stage(), self.stage);
        let mut guard = MapGuard::new(alloc, self.curbe, "kernel parameter block")?;
        guard.write_words(block.words());
        Ok(())
    }

    /// Emit the dispatch command for this context over `grid` macroblock
    /// units.
    pub fn emit_dispatch<C: CommandStream + ?Sized>(&self, cs: &mut C, grid_w: u32, grid_h: u32) {
        cs.emit(&[
            ops::KERNEL_DISPATCH,
            5,
            self.stage.id(),
            self.variant as u32,
            grid_w,
            grid_h,
            self.walker.id(),
        ]);
    }
}

/// All kernel contexts for a session, keyed by (stage, variant).
#[derive(Default)]
pub struct KernelContexts {
    map: HashMap<(KernelStage, u16), KernelContext>,
}

impl KernelContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ctx: KernelContext) {
        self.map.insert((ctx.stage, ctx.variant), ctx);
    }

    pub fn get_mut(&mut self, stage: KernelStage, variant: u16) -> Option<&mut KernelContext> {
        self.map.get_mut(&(stage, variant))
    }

    pub fn get(&self, stage: KernelStage, variant: u16) -> Option<&KernelContext> {
        self.map.get(&(stage, variant))
    }

    pub fn release_all<A: Allocator + ?Sized>(&mut self, alloc: &mut A) {
        for (_, ctx) in self.map.drain() {
            alloc.free(ctx.curbe);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::stub::StubDevice;

    #[test]
    fn parameter_block_is_generation_tagged_and_sized() {
        let g9 = ParameterBlock::new(DeviceGen::Gen9, KernelStage::MbEnc);
        let g11 = ParameterBlock::new(DeviceGen::Gen11, KernelStage::MbEnc);
        assert_eq!(g9.gen(), DeviceGen::Gen9);
        assert_eq!(g11.gen(), DeviceGen::Gen11);
        assert!(g11.words().len() > g9.words().len());
        assert_eq!(g9.words().len(), curbe_dwords(DeviceGen::Gen9, KernelStage::MbEnc));
    }

    #[test]
    fn binding_table_reset_restores_sentinels() {
        let mut table = BindingTable::with_slots(4);
        table.bind(0, Binding::Buffer(BufferHandle(1)));
        table.bind(2, Binding::Surface(SurfaceId(5)));
        assert_eq!(table.bound_count(), 2);
        table.reset();
        assert_eq!(table.bound_count(), 0);
        assert_eq!(table.get(0), Binding::None);
    }

    #[test]
    fn context_loads_curbe_through_scoped_map() {
        let mut dev = StubDevice::new();
        let mut ctx = KernelContext::new(
            &mut dev,
            DeviceGen::Gen9,
            KernelStage::BrcInit,
            0,
            WalkerPattern::Independent,
            4,
        )
        .unwrap();
        let mut block = ParameterBlock::new(DeviceGen::Gen9, KernelStage::BrcInit);
        block.set(0, 0xaabbccdd);
        block.set_pair(1, 120, 68);
        ctx.load_parameter_block(&mut dev, &block).unwrap();

        let bytes = dev.buffer_bytes(ctx.curbe).unwrap();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 0xaabbccdd);
        assert_eq!(
            u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            120 | (68 << 16)
        );
    }

    #[test]
    fn unmappable_curbe_aborts_the_stage() {
        let mut dev = StubDevice::new();
        let mut ctx = KernelContext::new(
            &mut dev,
            DeviceGen::Gen9,
            KernelStage::MbEnc,
            0,
            WalkerPattern::Wavefront45,
            8,
        )
        .unwrap();
        dev.poison_mapping(ctx.curbe);
        let block = ParameterBlock::new(DeviceGen::Gen9, KernelStage::MbEnc);
        let err = ctx.load_parameter_block(&mut dev, &block).unwrap_err();
        assert!(matches!(err, crate::error::EncodeError::MapFailure(_)));
    }
}
