//! Hierarchical motion-estimation kernel builder.
//!
//! Runs coarsest-first. Each octave searches the current frame's pyramid
//! level against every active reference's matching level, seeded by the
//! next-coarser octave's motion vectors when hierarchical refinement is
//! on.

use crate::derive::FramePlan;
use crate::error::{EncodeError, Result};
use crate::kernels::{Binding, BindingTable, DeviceGen, KernelStage, ParameterBlock};
use crate::params::{MAX_REFS_L0, MAX_REFS_L1};

/// Binding table slots.
pub const SLOT_CUR_PYRAMID: usize = 0;
pub const SLOT_MV_OUT: usize = 1;
pub const SLOT_DIST_OUT: usize = 2;
/// MV seed from the next-coarser octave; unbound at the coarsest level.
pub const SLOT_SEED_MV: usize = 3;
pub const SLOT_REF_L0_BASE: usize = 4;
pub const SLOT_REF_L1_BASE: usize = SLOT_REF_L0_BASE + MAX_REFS_L0;
pub const SLOT_COUNT: usize = SLOT_REF_L1_BASE + MAX_REFS_L1;

/// Curbe dword offsets.
const CURBE_GRID_DIMS: usize = 0;
const CURBE_SEARCH_WINDOW: usize = 1;
const CURBE_FLAGS: usize = 2;
const CURBE_REF_COUNTS: usize = 3;

const FLAG_USE_SEED: u32 = 1 << 0;
const FLAG_ADAPTIVE_SEARCH: u32 = 1 << 1;
const FLAG_BIDIRECTIONAL: u32 = 1 << 2;

/// Stage-specific input for one motion-estimation dispatch.
pub struct HmeInput {
    pub octave: usize,
    pub cur_pyramid: Binding,
    /// Matching pyramid level of each active list-0/list-1 reference.
    pub refs_l0: Vec<Binding>,
    pub refs_l1: Vec<Binding>,
    /// Coarser-octave MV data, `None` at the coarsest enabled level.
    pub seed_mv: Option<Binding>,
    pub mv_out: Binding,
    pub dist_out: Binding,
}

pub fn build(
    gen: DeviceGen,
    plan: &FramePlan,
    input: &HmeInput,
) -> Result<(ParameterBlock, BindingTable)> {
    let stage = KernelStage::hme_for_octave(input.octave);
    let oct = plan.geometry.octaves[input.octave].ok_or_else(|| {
        EncodeError::InvalidParameter(format!(
            "motion search dispatch for disabled octave {}",
            input.octave
        ))
    })?;
    let (sw_w, sw_h) = plan.preset.search_window(input.octave);

    let mut block = ParameterBlock::new(gen, stage);
    block.set_pair(CURBE_GRID_DIMS, oct.mb_w as u16, oct.mb_h as u16);
    block.set_pair(CURBE_SEARCH_WINDOW, sw_w as u16, sw_h as u16);

    let mut flags = 0;
    if input.seed_mv.is_some() {
        flags |= FLAG_USE_SEED;
    }
    if plan.features.adaptive_search {
        flags |= FLAG_ADAPTIVE_SEARCH;
    }
    if plan.frame_type.is_bidirectional() {
        flags |= FLAG_BIDIRECTIONAL;
    }
    block.set(CURBE_FLAGS, flags);
    block.set_pair(
        CURBE_REF_COUNTS,
        input.refs_l0.len() as u16,
        input.refs_l1.len() as u16,
    );

    let mut table = BindingTable::with_slots(SLOT_COUNT);
    table.bind(SLOT_CUR_PYRAMID, input.cur_pyramid);
    table.bind(SLOT_MV_OUT, input.mv_out);
    table.bind(SLOT_DIST_OUT, input.dist_out);
    if let Some(seed) = input.seed_mv {
        table.bind(SLOT_SEED_MV, seed);
    }
    for (i, r) in input.refs_l0.iter().take(MAX_REFS_L0).enumerate() {
        table.bind(SLOT_REF_L0_BASE + i, *r);
    }
    for (i, r) in input.refs_l1.iter().take(MAX_REFS_L1).enumerate() {
        table.bind(SLOT_REF_L1_BASE + i, *r);
    }

    Ok((block, table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{BufferHandle, SurfaceId};
    use crate::params::{
        FrameParams, PictureParams, Preset, RefPic, SequenceParams, SliceParams, SliceType,
    };

    fn p_plan() -> FramePlan {
        let mut slice = SliceParams::full_frame(SliceType::P, 68);
        slice.refs_l0.push(RefPic {
            surface: SurfaceId(3),
            poc: 0,
        });
        let params = FrameParams {
            seq: SequenceParams::new(1920, 1088),
            pic: PictureParams {
                source: SurfaceId(1),
                recon: SurfaceId(2),
                poc: 2,
                base_qp: 26,
                is_reference: true,
                coded_output: BufferHandle(9),
            },
            slices: vec![slice],
            roi: Vec::new(),
            mb_qp_override: None,
        };
        FramePlan::derive(&params, Preset::Quality).unwrap()
    }

    #[test]
    fn coarsest_octave_has_no_seed() {
        let plan = p_plan();
        let input = HmeInput {
            octave: 2,
            cur_pyramid: Binding::Buffer(BufferHandle(1)),
            refs_l0: vec![Binding::Buffer(BufferHandle(2))],
            refs_l1: vec![],
            seed_mv: None,
            mv_out: Binding::Buffer(BufferHandle(3)),
            dist_out: Binding::Buffer(BufferHandle(4)),
        };
        let (block, table) = build(DeviceGen::Gen9, &plan, &input).unwrap();
        assert_eq!(block.stage(), KernelStage::Hme32x);
        assert_eq!(block.get(CURBE_FLAGS) & FLAG_USE_SEED, 0);
        assert_eq!(table.get(SLOT_SEED_MV), Binding::None);
        assert_eq!(table.get(SLOT_REF_L1_BASE), Binding::None);
    }

    #[test]
    fn finer_octave_takes_coarser_seed() {
        let plan = p_plan();
        let input = HmeInput {
            octave: 0,
            cur_pyramid: Binding::Buffer(BufferHandle(1)),
            refs_l0: vec![Binding::Buffer(BufferHandle(2))],
            refs_l1: vec![],
            seed_mv: Some(Binding::Buffer(BufferHandle(7))),
            mv_out: Binding::Buffer(BufferHandle(3)),
            dist_out: Binding::Buffer(BufferHandle(4)),
        };
        let (block, table) = build(DeviceGen::Gen9, &plan, &input).unwrap();
        assert_eq!(block.stage(), KernelStage::Hme4x);
        assert_ne!(block.get(CURBE_FLAGS) & FLAG_USE_SEED, 0);
        assert_eq!(table.get(SLOT_SEED_MV), Binding::Buffer(BufferHandle(7)));
        // 4x grid of a 1920x1088 frame: 480x272 -> 30x17 MBs.
        assert_eq!(block.get(CURBE_GRID_DIMS), 30 | (17 << 16));
    }

    #[test]
    fn search_window_comes_from_preset_tables() {
        let plan = p_plan();
        let input = HmeInput {
            octave: 1,
            cur_pyramid: Binding::Buffer(BufferHandle(1)),
            refs_l0: vec![Binding::Buffer(BufferHandle(2))],
            refs_l1: vec![],
            seed_mv: Some(Binding::Buffer(BufferHandle(7))),
            mv_out: Binding::Buffer(BufferHandle(3)),
            dist_out: Binding::Buffer(BufferHandle(4)),
        };
        let (block, _) = build(DeviceGen::Gen9, &plan, &input).unwrap();
        let (w, h) = Preset::Quality.search_window(1);
        assert_eq!(block.get(CURBE_SEARCH_WINDOW), (w as u32) | ((h as u32) << 16));
    }
}
