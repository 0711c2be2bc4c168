//! Downscale (pyramid) kernel builder.
//!
//! Each octave is produced by one dispatch: full resolution feeds the 4x
//! level, each coarser level reads the previous one. The finest octave
//! optionally writes per-MB flatness/variance statistics consumed by
//! adaptive search and MB-level rate control.

use crate::derive::FramePlan;
use crate::error::{EncodeError, Result};
use crate::kernels::{Binding, BindingTable, DeviceGen, KernelStage, ParameterBlock};

/// Binding table slots.
pub const SLOT_SRC: usize = 0;
pub const SLOT_DST: usize = 1;
pub const SLOT_MB_STATS: usize = 2;
pub const SLOT_COUNT: usize = 3;

/// Curbe dword offsets shared by both generations.
const CURBE_INPUT_DIMS: usize = 0;
const CURBE_OUTPUT_DIMS: usize = 1;
const CURBE_FLAGS: usize = 2;

const FLAG_FLATNESS_CHECK: u32 = 1 << 0;
const FLAG_VARIANCE_OUTPUT: u32 = 1 << 1;

/// Stage-specific input for one scaling dispatch.
pub struct ScaleInput {
    /// Octave index being produced (0 = 4x).
    pub octave: usize,
    /// Full-resolution source picture or the previous octave's surface.
    pub src: Binding,
    /// Destination pyramid surface.
    pub dst: Binding,
    /// Flatness/variance output, bound only when the features want it.
    pub mb_stats: Option<Binding>,
    pub src_width: u32,
    pub src_height: u32,
}

/// Whether this octave should emit per-MB statistics for the plan.
pub fn wants_mb_stats(plan: &FramePlan, octave: usize) -> bool {
    octave == 0 && (plan.features.adaptive_search || plan.features.mb_rate_control)
}

pub fn build(
    gen: DeviceGen,
    plan: &FramePlan,
    input: &ScaleInput,
) -> Result<(ParameterBlock, BindingTable)> {
    let stage = KernelStage::scale_for_octave(input.octave);
    let oct = plan.geometry.octaves[input.octave].ok_or_else(|| {
        EncodeError::InvalidParameter(format!("scale dispatch for disabled octave {}", input.octave))
    })?;

    let mut block = ParameterBlock::new(gen, stage);
    block.set_pair(
        CURBE_INPUT_DIMS,
        input.src_width as u16,
        input.src_height as u16,
    );
    block.set_pair(CURBE_OUTPUT_DIMS, oct.width as u16, oct.height as u16);

    let mut flags = 0;
    if input.mb_stats.is_some() {
        flags |= FLAG_FLATNESS_CHECK | FLAG_VARIANCE_OUTPUT;
    }
    block.set(CURBE_FLAGS, flags);

    let mut table = BindingTable::with_slots(SLOT_COUNT);
    table.bind(SLOT_SRC, input.src);
    table.bind(SLOT_DST, input.dst);
    if let Some(stats) = input.mb_stats {
        table.bind(SLOT_MB_STATS, stats);
    }

    Ok((block, table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::FramePlan;
    use crate::hw::{BufferHandle, SurfaceId};
    use crate::params::{
        FrameParams, PictureParams, Preset, SequenceParams, SliceParams, SliceType,
    };

    fn plan(preset: Preset) -> FramePlan {
        let params = FrameParams {
            seq: SequenceParams::new(1920, 1088),
            pic: PictureParams {
                source: SurfaceId(1),
                recon: SurfaceId(2),
                poc: 0,
                base_qp: 26,
                is_reference: true,
                coded_output: BufferHandle(9),
            },
            slices: vec![SliceParams::full_frame(SliceType::I, 68)],
            roi: Vec::new(),
            mb_qp_override: None,
        };
        FramePlan::derive(&params, preset).unwrap()
    }

    #[test]
    fn stats_slot_stays_unbound_when_feature_off() {
        let plan = plan(Preset::Performance);
        assert!(!wants_mb_stats(&plan, 0));
        let input = ScaleInput {
            octave: 0,
            src: Binding::Surface(SurfaceId(1)),
            dst: Binding::Buffer(BufferHandle(10)),
            mb_stats: None,
            src_width: 1920,
            src_height: 1088,
        };
        let (block, table) = build(DeviceGen::Gen9, &plan, &input).unwrap();
        assert_eq!(table.get(SLOT_MB_STATS), Binding::None);
        assert_eq!(block.get(CURBE_FLAGS), 0);
    }

    #[test]
    fn finest_octave_carries_dims_and_stats() {
        let plan = plan(Preset::Quality);
        assert!(wants_mb_stats(&plan, 0));
        let input = ScaleInput {
            octave: 0,
            src: Binding::Surface(SurfaceId(1)),
            dst: Binding::Buffer(BufferHandle(10)),
            mb_stats: Some(Binding::Buffer(BufferHandle(11))),
            src_width: 1920,
            src_height: 1088,
        };
        let (block, table) = build(DeviceGen::Gen9, &plan, &input).unwrap();
        assert_eq!(block.stage(), KernelStage::Scale4x);
        assert_eq!(block.get(CURBE_INPUT_DIMS), 1920 | (1088 << 16));
        assert_eq!(block.get(CURBE_OUTPUT_DIMS), 480 | (272 << 16));
        assert!(table.get(SLOT_MB_STATS).is_bound());
    }
}
