//! Macroblock-encode kernel builder.
//!
//! The kernel variant is keyed by (preset tier, frame type) through a
//! lookup table rather than nested branching; the table is validated
//! exhaustively in tests. A separate intra-only distortion-estimation
//! variant seeds the rate-control frame update on intra frames.

use crate::derive::{FramePlan, FrameType};
use crate::kernels::{Binding, BindingTable, DeviceGen, KernelStage, ParameterBlock};

/// Binding table slots.
pub const SLOT_MB_RECORD_OUT: usize = 0;
pub const SLOT_MV_OUT: usize = 1;
pub const SLOT_CUR_PIC: usize = 2;
pub const SLOT_HME_MV: usize = 3;
pub const SLOT_HME_DIST: usize = 4;
pub const SLOT_REF_L0_0: usize = 5;
pub const SLOT_REF_L0_1: usize = 6;
pub const SLOT_REF_L1_0: usize = 7;
pub const SLOT_MB_BRC_QP: usize = 8;
pub const SLOT_ROI: usize = 9;
pub const SLOT_QP_OVERRIDE: usize = 10;
pub const SLOT_DISTORTION_OUT: usize = 11;
pub const SLOT_COUNT: usize = 12;

/// Curbe dword offsets.
const CURBE_GRID_DIMS: usize = 0;
const CURBE_QP: usize = 1;
const CURBE_FLAGS: usize = 2;
const CURBE_REF_QP: usize = 3;
const CURBE_BIAS: usize = 4;
const CURBE_SLICE_COUNT: usize = 5;

const FLAG_HME_SEED: u32 = 1 << 0;
const FLAG_TRELLIS: u32 = 1 << 1;
const FLAG_MB_BRC: u32 = 1 << 2;
const FLAG_ROI: u32 = 1 << 3;
const FLAG_QP_OVERRIDE: u32 = 1 << 4;
const FLAG_B_BIAS: u32 = 1 << 5;
const FLAG_INTRA_DIST_ONLY: u32 = 1 << 6;

/// Kernel variant id for (preset, frame type) on a generation.
///
/// Gen11 rebased its MB-encode kernel set at 0x20.
pub fn variant(gen: DeviceGen, preset: crate::params::Preset, frame_type: FrameType) -> u16 {
    use crate::params::Preset::*;
    let offset = match (preset, frame_type) {
        (Quality, FrameType::I) => 0,
        (Quality, FrameType::P) => 1,
        (Quality, FrameType::B) => 2,
        (Normal, FrameType::I) => 3,
        (Normal, FrameType::P) => 4,
        (Normal, FrameType::B) => 5,
        (Performance, FrameType::I) => 6,
        (Performance, FrameType::P) => 7,
        (Performance, FrameType::B) => 8,
    };
    match gen {
        DeviceGen::Gen9 => offset,
        DeviceGen::Gen11 => 0x20 + offset,
    }
}

/// Intra-only distortion-estimation variant used to seed the BRC frame
/// update; one per generation, preset-independent.
pub fn intra_dist_variant(gen: DeviceGen) -> u16 {
    match gen {
        DeviceGen::Gen9 => 0x10,
        DeviceGen::Gen11 => 0x30,
    }
}

/// Stage-specific input for one MB-encode dispatch.
pub struct MbEncInput {
    pub mb_record_out: Binding,
    pub mv_out: Binding,
    pub cur_pic: Binding,
    /// Finest-octave HME outputs; unbound when HME did not run.
    pub hme_mv: Option<Binding>,
    pub hme_dist: Option<Binding>,
    pub refs_l0: Vec<Binding>,
    pub refs_l1: Vec<Binding>,
    /// Per-MB QP map from the BRC MB update; bound when MB RC is active.
    pub mb_brc_qp: Option<Binding>,
    pub roi: Option<Binding>,
    pub qp_override: Option<Binding>,
    pub distortion_out: Option<Binding>,
    /// Build the intra-only distortion-estimation variant.
    pub intra_dist_only: bool,
}

pub fn build(gen: DeviceGen, plan: &FramePlan, input: &MbEncInput) -> (ParameterBlock, BindingTable) {
    let mut block = ParameterBlock::new(gen, KernelStage::MbEnc);
    block.set_pair(
        CURBE_GRID_DIMS,
        plan.geometry.mb_w as u16,
        plan.geometry.mb_h as u16,
    );
    block.set(CURBE_QP, plan.qp as u32);

    let mut flags = 0;
    if input.hme_mv.is_some() {
        flags |= FLAG_HME_SEED;
    }
    if plan.features.trellis_rounding {
        flags |= FLAG_TRELLIS;
    }
    if input.mb_brc_qp.is_some() {
        flags |= FLAG_MB_BRC;
    }
    if input.roi.is_some() {
        flags |= FLAG_ROI;
    }
    if input.qp_override.is_some() {
        flags |= FLAG_QP_OVERRIDE;
    }
    if plan.features.b_frame_bias {
        flags |= FLAG_B_BIAS;
    }
    if input.intra_dist_only {
        flags |= FLAG_INTRA_DIST_ONLY;
    }
    block.set(CURBE_FLAGS, flags);

    // Per-reference resolved QPs live in the surface pool; the sequencer
    // fills them in through set_reference_qps after the build.
    block.set(CURBE_REF_QP, 0);

    // Signed bias-adjustment terms for forward/backward blending.
    if plan.features.b_frame_bias {
        let w = plan
            .refs_l0
            .first()
            .map(|r| r.blend_weight as i32)
            .unwrap_or(32);
        let fwd_bias = (64 - w - 32) as i8;
        let bwd_bias = (w - 32) as i8;
        block.set(
            CURBE_BIAS,
            (fwd_bias as u8 as u32) | ((bwd_bias as u8 as u32) << 8),
        );
    }
    block.set(CURBE_SLICE_COUNT, plan.slices.len() as u32);

    let mut table = BindingTable::with_slots(SLOT_COUNT);
    table.bind(SLOT_MB_RECORD_OUT, input.mb_record_out);
    table.bind(SLOT_MV_OUT, input.mv_out);
    table.bind(SLOT_CUR_PIC, input.cur_pic);
    if let Some(b) = input.hme_mv {
        table.bind(SLOT_HME_MV, b);
    }
    if let Some(b) = input.hme_dist {
        table.bind(SLOT_HME_DIST, b);
    }
    for (slot, r) in [SLOT_REF_L0_0, SLOT_REF_L0_1]
        .into_iter()
        .zip(input.refs_l0.iter())
    {
        table.bind(slot, *r);
    }
    if let Some(r) = input.refs_l1.first() {
        table.bind(SLOT_REF_L1_0, *r);
    }
    if let Some(b) = input.mb_brc_qp {
        table.bind(SLOT_MB_BRC_QP, b);
    }
    if let Some(b) = input.roi {
        table.bind(SLOT_ROI, b);
    }
    if let Some(b) = input.qp_override {
        table.bind(SLOT_QP_OVERRIDE, b);
    }
    if let Some(b) = input.distortion_out {
        table.bind(SLOT_DISTORTION_OUT, b);
    }

    (block, table)
}

/// Write the per-reference resolved QPs into an already-built block.
/// Separated because the reconstruction QPs live in the surface pool,
/// which the builders do not reach into.
pub fn set_reference_qps(block: &mut ParameterBlock, qp_l0: u8, qp_l1: u8) {
    block.set(CURBE_REF_QP, (qp_l0 as u32) | ((qp_l1 as u32) << 8));
}
