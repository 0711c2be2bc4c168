//! Static-scene detection and weighted-prediction builders.
//!
//! Both are optional tail stages: scene detection only follows a frame
//! where hierarchical motion estimation ran, and weighted prediction
//! produces one pre-weighted reference view per (frame, reference)
//! combination for the MB-encode kernel to sample instead of the raw
//! reconstruction.

use crate::derive::FramePlan;
use crate::kernels::{Binding, BindingTable, DeviceGen, KernelStage, ParameterBlock};

/// Scene-detect binding slots.
pub const SFD_SLOT_MV_IN: usize = 0;
pub const SFD_SLOT_DIST_IN: usize = 1;
pub const SFD_SLOT_RESULT: usize = 2;
pub const SFD_SLOT_COUNT: usize = 3;

const SFD_GRID_DIMS: usize = 0;
const SFD_MV_THRESHOLD: usize = 1;
const SFD_DIST_THRESHOLD: usize = 2;
const SFD_FLAGS: usize = 3;

const SFD_FLAG_ALT_VARIANT: u32 = 1 << 0;

/// Motion below this magnitude (quarter-pel units, summed per MB) reads
/// as static.
const SFD_DEFAULT_MV_THRESHOLD: u32 = 4;
const SFD_DEFAULT_DIST_THRESHOLD: u32 = 128;

/// Weighted-prediction binding slots.
pub const WP_SLOT_REF_IN: usize = 0;
pub const WP_SLOT_WEIGHTED_OUT: usize = 1;
pub const WP_SLOT_COUNT: usize = 2;

const WP_GRID_DIMS: usize = 0;
const WP_WEIGHT_OFFSET: usize = 1;
const WP_LOG2_DENOM: usize = 2;
const WP_REF_ID: usize = 3;

pub struct SfdInput {
    /// Finest-octave motion-estimation outputs.
    pub hme_mv: Binding,
    pub hme_dist: Binding,
    /// One-dword decision written for the next frame's plan.
    pub result: Binding,
}

pub fn build_sfd(gen: DeviceGen, plan: &FramePlan, input: &SfdInput) -> (ParameterBlock, BindingTable) {
    let mut block = ParameterBlock::new(gen, KernelStage::StaticSceneDetect);
    block.set_pair(
        SFD_GRID_DIMS,
        plan.geometry.mb_w as u16,
        plan.geometry.mb_h as u16,
    );
    block.set(SFD_MV_THRESHOLD, SFD_DEFAULT_MV_THRESHOLD);
    block.set(SFD_DIST_THRESHOLD, SFD_DEFAULT_DIST_THRESHOLD);
    let mut flags = 0;
    if plan.preset.features().scene_detect_variant != 0 {
        flags |= SFD_FLAG_ALT_VARIANT;
    }
    block.set(SFD_FLAGS, flags);

    let mut table = BindingTable::with_slots(SFD_SLOT_COUNT);
    table.bind(SFD_SLOT_MV_IN, input.hme_mv);
    table.bind(SFD_SLOT_DIST_IN, input.hme_dist);
    table.bind(SFD_SLOT_RESULT, input.result);
    (block, table)
}

pub struct WpInput {
    pub reference: Binding,
    pub weighted_out: Binding,
    /// Explicit weight/offset pair for this reference, signed.
    pub weight: i16,
    pub offset: i16,
    pub log2_denom: u8,
    /// 0 = list 0, 1 = list 1.
    pub list: u8,
    pub ref_idx: u8,
}

pub fn build_wp(gen: DeviceGen, plan: &FramePlan, input: &WpInput) -> (ParameterBlock, BindingTable) {
    let mut block = ParameterBlock::new(gen, KernelStage::WeightedPred);
    block.set_pair(
        WP_GRID_DIMS,
        plan.geometry.mb_w as u16,
        plan.geometry.mb_h as u16,
    );
    block.set(
        WP_WEIGHT_OFFSET,
        (input.weight as u16 as u32) | ((input.offset as u16 as u32) << 16),
    );
    block.set(WP_LOG2_DENOM, input.log2_denom as u32);
    block.set_pair(WP_REF_ID, input.list as u16, input.ref_idx as u16);

    let mut table = BindingTable::with_slots(WP_SLOT_COUNT);
    table.bind(WP_SLOT_REF_IN, input.reference);
    table.bind(WP_SLOT_WEIGHTED_OUT, input.weighted_out);
    (block, table)
}
