//! Rate-control kernel builders: init/reset, frame update, MB update.
//!
//! The init builder derives the VBV buffer model and the deviation
//! threshold tables the hardware kernels steer QP with. The threshold
//! curves are closed-form over the normalized bits-per-frame ratio, so
//! the same table shape adapts from low-latency to high-buffer setups.

use crate::derive::{FramePlan, FrameType, RcPlan};
use crate::kernels::{Binding, BindingTable, DeviceGen, KernelStage, ParameterBlock};

/// Init/reset binding slots.
pub const INIT_SLOT_HISTORY: usize = 0;
pub const INIT_SLOT_DISTORTION: usize = 1;
pub const INIT_SLOT_COUNT: usize = 2;

/// Frame-update binding slots.
pub const FRAME_SLOT_HISTORY: usize = 0;
pub const FRAME_SLOT_PAK_STATS: usize = 1;
/// MB-encode curbe region; the update kernel rewrites it in place
/// before the MB-encode dispatch.
pub const FRAME_SLOT_MBENC_CURBE: usize = 2;
pub const FRAME_SLOT_DISTORTION: usize = 3;
pub const FRAME_SLOT_COUNT: usize = 4;

/// MB-update binding slots.
pub const MB_SLOT_HISTORY: usize = 0;
pub const MB_SLOT_QP_OUT: usize = 1;
pub const MB_SLOT_ROI: usize = 2;
pub const MB_SLOT_COUNT: usize = 3;

// Init curbe layout.
const INIT_TARGET_BPS: usize = 0;
const INIT_MAX_BPS: usize = 1;
const INIT_FRAME_RATE_NUM: usize = 2;
const INIT_FRAME_RATE_DEN: usize = 3;
const INIT_GOP: usize = 4;
const INIT_BUFFER_BITS: usize = 5;
const INIT_FULLNESS_BITS: usize = 6;
const INIT_FLAGS: usize = 7;
const INIT_THRESH_PB: usize = 8; // 2 dwords
const INIT_THRESH_I: usize = 10; // 2 dwords
const INIT_THRESH_VBR: usize = 12; // 2 dwords

const INIT_FLAG_CBR: u32 = 1 << 0;
const INIT_FLAG_VBR: u32 = 1 << 1;
const INIT_FLAG_MB_RC: u32 = 1 << 2;
const INIT_FLAG_RESET: u32 = 1 << 3;

// Frame-update curbe layout.
const FRAME_BITS_PER_FRAME: usize = 0;
const FRAME_FULLNESS: usize = 1;
const FRAME_SKIP_BITS: usize = 2;
const FRAME_TYPE: usize = 3;
const FRAME_QP_CLAMPS: usize = 4;
const FRAME_FLAGS: usize = 5;
const FRAME_PASS_COUNT: usize = 6;
const FRAME_CUR_QP: usize = 7;

const FRAME_FLAG_MB_RC: u32 = 1 << 0;
const FRAME_FLAG_QP_CLAMPS: u32 = 1 << 1;

// MB-update curbe layout.
const MB_GRID_DIMS: usize = 0;
const MB_BASE_QP: usize = 1;
const MB_FLAGS: usize = 2;
const MB_ROI_COUNT: usize = 3;

const MB_FLAG_ROI: u32 = 1 << 0;

/// Threshold curve bases, negative half steering QP up (overshoot),
/// positive half steering it down.
const THRESH_PB: [f64; 8] = [-45.0, -33.0, -23.0, -15.0, 15.0, 23.0, 35.0, 45.0];
const THRESH_I: [f64; 8] = [-40.0, -30.0, -17.0, -10.0, 10.0, 17.0, 30.0, 40.0];
const THRESH_VBR: [f64; 8] = [-45.0, -35.0, -25.0, -15.0, 15.0, 25.0, 35.0, 45.0];

/// Exponents for the normalized-ratio curves. Overshoot thresholds
/// flatten slower than undershoot ones.
const NEG_EXPONENT: f64 = 0.3;
const POS_EXPONENT: f64 = 0.6;

/// Reference frame rate the buffer model is normalized against.
const DEV_STD_FPS: f64 = 30.0;

/// Cross-frame rate-control state carried by the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct RcState {
    /// History buffer holds a valid model; set by PAK finalize.
    pub initialized: bool,
    /// An init/reset dispatch is owed before the next frame update.
    pub reset_pending: bool,
    /// Accumulated VBV fullness in bits.
    pub fullness: u64,
    /// Frames dropped upstream since the last update; their budget
    /// folds into fullness on the next frame update.
    pub pending_skip_frames: u32,
    /// Frames since the last I-frame.
    pub frames_in_gop: u32,
}

/// Per-frame-type QP clamps applied by the frame-update kernel.
pub fn qp_clamps(frame_type: FrameType) -> (u8, u8) {
    match frame_type {
        FrameType::I => (10, 50),
        FrameType::P => (10, 51),
        FrameType::B => (12, 51),
    }
}

/// Normalized bits-per-frame ratio: nominal frame budget against the
/// per-frame share of the VBV buffer at the reference frame rate.
pub fn normalized_bits_ratio(bits_per_frame: u32, buffer_bits: u32) -> f64 {
    if buffer_bits == 0 {
        return 1.0;
    }
    let per_frame_share = buffer_bits as f64 / DEV_STD_FPS;
    (bits_per_frame as f64 / per_frame_share).clamp(0.1, 3.5)
}

/// Evaluate one threshold curve at the given normalized ratio.
pub fn deviation_thresholds(base: &[f64; 8], ratio: f64) -> [i8; 8] {
    let mut out = [0i8; 8];
    for (dst, b) in out.iter_mut().zip(base.iter()) {
        let exp = if *b < 0.0 { NEG_EXPONENT } else { POS_EXPONENT };
        *dst = (b * ratio.powf(exp)).clamp(-128.0, 127.0) as i8;
    }
    out
}

fn pack_thresholds(block: &mut ParameterBlock, at: usize, t: [i8; 8]) {
    for (i, chunk) in t.chunks(4).enumerate() {
        let mut word = 0u32;
        for (j, v) in chunk.iter().enumerate() {
            word |= (*v as u8 as u32) << (8 * j);
        }
        block.set(at + i, word);
    }
}

/// VBV buffer size in bits. One second at the VBR ceiling, falling back
/// to the target rate under CBR.
pub fn buffer_bits(rc: &RcPlan) -> u32 {
    rc.max_bps.max(rc.target_bps)
}

pub struct BrcInitInput {
    pub history: Binding,
    pub distortion: Binding,
    /// True on a reset (history carries over), false on first init.
    pub is_reset: bool,
    pub mb_rate_control: bool,
    pub intra_period: u32,
    pub ip_period: u32,
}

pub fn build_init(gen: DeviceGen, rc: &RcPlan, input: &BrcInitInput) -> (ParameterBlock, BindingTable) {
    let mut block = ParameterBlock::new(gen, KernelStage::BrcInit);
    block.set(INIT_TARGET_BPS, rc.target_bps);
    block.set(INIT_MAX_BPS, rc.max_bps.max(rc.target_bps));
    block.set(INIT_FRAME_RATE_NUM, rc.frame_rate_num);
    block.set(INIT_FRAME_RATE_DEN, rc.frame_rate_den);
    block.set_pair(INIT_GOP, input.intra_period as u16, input.ip_period as u16);

    let buffer = buffer_bits(rc);
    block.set(INIT_BUFFER_BITS, buffer);
    // Start the model half full.
    block.set(INIT_FULLNESS_BITS, buffer / 2);

    let mut flags = 0;
    match rc.mode {
        crate::params::BitrateControl::ConstantBitrate => flags |= INIT_FLAG_CBR,
        crate::params::BitrateControl::VariableBitrate => flags |= INIT_FLAG_VBR,
        crate::params::BitrateControl::ConstantQp => {}
    }
    if input.mb_rate_control {
        flags |= INIT_FLAG_MB_RC;
    }
    if input.is_reset {
        flags |= INIT_FLAG_RESET;
    }
    block.set(INIT_FLAGS, flags);

    let ratio = normalized_bits_ratio(rc.bits_per_frame(), buffer);
    pack_thresholds(&mut block, INIT_THRESH_PB, deviation_thresholds(&THRESH_PB, ratio));
    pack_thresholds(&mut block, INIT_THRESH_I, deviation_thresholds(&THRESH_I, ratio));
    pack_thresholds(&mut block, INIT_THRESH_VBR, deviation_thresholds(&THRESH_VBR, ratio));

    let mut table = BindingTable::with_slots(INIT_SLOT_COUNT);
    table.bind(INIT_SLOT_HISTORY, input.history);
    table.bind(INIT_SLOT_DISTORTION, input.distortion);
    (block, table)
}

pub struct BrcFrameInput {
    pub history: Binding,
    pub pak_stats: Binding,
    pub mbenc_curbe: Binding,
    /// Intra distortion estimate, present when the seeding pass ran.
    pub distortion: Option<Binding>,
}

pub fn build_frame_update(
    gen: DeviceGen,
    plan: &FramePlan,
    state: &RcState,
    input: &BrcFrameInput,
) -> (ParameterBlock, BindingTable) {
    let mut block = ParameterBlock::new(gen, KernelStage::BrcFrameUpdate);
    let bits_per_frame = plan.rc.bits_per_frame();
    block.set(FRAME_BITS_PER_FRAME, bits_per_frame);
    block.set(FRAME_FULLNESS, state.fullness.min(u32::MAX as u64) as u32);
    // Skipped frames spent no bits but still drained the buffer; fold
    // their whole budget back in.
    block.set(
        FRAME_SKIP_BITS,
        (state.pending_skip_frames as u64 * bits_per_frame as u64).min(u32::MAX as u64) as u32,
    );
    block.set(FRAME_TYPE, plan.frame_type as u32);

    let (min_qp, max_qp) = qp_clamps(plan.frame_type);
    block.set_pair(FRAME_QP_CLAMPS, min_qp as u16, max_qp as u16);

    let mut flags = FRAME_FLAG_QP_CLAMPS;
    if plan.features.mb_rate_control {
        flags |= FRAME_FLAG_MB_RC;
    }
    block.set(FRAME_FLAGS, flags);
    block.set(FRAME_PASS_COUNT, plan.rc.num_passes);
    block.set(FRAME_CUR_QP, plan.qp as u32);

    let mut table = BindingTable::with_slots(FRAME_SLOT_COUNT);
    table.bind(FRAME_SLOT_HISTORY, input.history);
    table.bind(FRAME_SLOT_PAK_STATS, input.pak_stats);
    table.bind(FRAME_SLOT_MBENC_CURBE, input.mbenc_curbe);
    if let Some(b) = input.distortion {
        table.bind(FRAME_SLOT_DISTORTION, b);
    }
    (block, table)
}

pub struct BrcMbInput {
    pub history: Binding,
    pub mb_qp_out: Binding,
    pub roi: Option<Binding>,
}

pub fn build_mb_update(
    gen: DeviceGen,
    plan: &FramePlan,
    input: &BrcMbInput,
) -> (ParameterBlock, BindingTable) {
    let mut block = ParameterBlock::new(gen, KernelStage::BrcMbUpdate);
    block.set_pair(
        MB_GRID_DIMS,
        plan.geometry.mb_w as u16,
        plan.geometry.mb_h as u16,
    );
    block.set(MB_BASE_QP, plan.qp as u32);
    let mut flags = 0;
    if input.roi.is_some() {
        flags |= MB_FLAG_ROI;
    }
    block.set(MB_FLAGS, flags);
    block.set(MB_ROI_COUNT, if plan.features.roi { 1 } else { 0 });

    let mut table = BindingTable::with_slots(MB_SLOT_COUNT);
    table.bind(MB_SLOT_HISTORY, input.history);
    table.bind(MB_SLOT_QP_OUT, input.mb_qp_out);
    if let Some(b) = input.roi {
        table.bind(MB_SLOT_ROI, b);
    }
    (block, table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::BufferHandle;
    use crate::params::BitrateControl;

    fn rc_plan(target: u32, max: u32) -> RcPlan {
        RcPlan {
            enabled: true,
            mode: BitrateControl::VariableBitrate,
            num_passes: crate::params::MAX_PAK_PASSES,
            target_bps: target,
            max_bps: max,
            frame_rate_num: 30,
            frame_rate_den: 1,
        }
    }

    #[test]
    fn threshold_curves_keep_sign_and_order() {
        for ratio in [0.1, 0.5, 1.0, 2.0, 3.5] {
            let t = deviation_thresholds(&THRESH_PB, ratio);
            for w in t.windows(2) {
                assert!(w[0] < w[1], "thresholds not increasing at ratio {ratio}");
            }
            assert!(t[..4].iter().all(|v| *v < 0));
            assert!(t[4..].iter().all(|v| *v > 0));
        }
    }

    #[test]
    fn ratio_is_clamped_to_curve_domain() {
        assert_eq!(normalized_bits_ratio(0, 1_000_000), 0.1);
        assert_eq!(normalized_bits_ratio(u32::MAX, 1_000), 3.5);
        // 1 Mbps at 30 fps against a 1 Mbit buffer is exactly nominal.
        let r = normalized_bits_ratio(1_000_000 / 30, 1_000_000);
        assert!((r - 1.0).abs() < 0.01);
    }

    #[test]
    fn init_starts_half_full_and_prefers_max_rate() {
        let rc = rc_plan(4_000_000, 6_000_000);
        let input = BrcInitInput {
            history: Binding::Buffer(BufferHandle(1)),
            distortion: Binding::Buffer(BufferHandle(2)),
            is_reset: false,
            mb_rate_control: false,
            intra_period: 30,
            ip_period: 1,
        };
        let (block, table) = build_init(DeviceGen::Gen9, &rc, &input);
        assert_eq!(block.get(INIT_BUFFER_BITS), 6_000_000);
        assert_eq!(block.get(INIT_FULLNESS_BITS), 3_000_000);
        assert_ne!(block.get(INIT_FLAGS) & INIT_FLAG_VBR, 0);
        assert_eq!(block.get(INIT_FLAGS) & INIT_FLAG_RESET, 0);
        assert_eq!(table.bound_count(), 2);
    }

    #[test]
    fn frame_update_folds_pending_skip_frames() {
        let rc = rc_plan(3_000_000, 3_000_000);
        let params = crate::params::FrameParams {
            seq: {
                let mut s = crate::params::SequenceParams::new(640, 480)
                    .with_bitrate(BitrateControl::VariableBitrate, 3_000_000, 3_000_000);
                s.frame_rate_num = 30;
                s
            },
            pic: crate::params::PictureParams {
                source: crate::hw::SurfaceId(1),
                recon: crate::hw::SurfaceId(2),
                poc: 0,
                base_qp: 28,
                is_reference: true,
                coded_output: BufferHandle(9),
            },
            slices: vec![crate::params::SliceParams::full_frame(
                crate::params::SliceType::I,
                30,
            )],
            roi: Vec::new(),
            mb_qp_override: None,
        };
        let plan = FramePlan::derive(&params, crate::params::Preset::Normal).unwrap();
        let state = RcState {
            initialized: true,
            fullness: 1_500_000,
            pending_skip_frames: 2,
            ..Default::default()
        };
        let input = BrcFrameInput {
            history: Binding::Buffer(BufferHandle(1)),
            pak_stats: Binding::Buffer(BufferHandle(2)),
            mbenc_curbe: Binding::Buffer(BufferHandle(3)),
            distortion: None,
        };
        let (block, table) = build_frame_update(DeviceGen::Gen9, &plan, &state, &input);
        assert_eq!(block.get(FRAME_SKIP_BITS), 2 * rc.bits_per_frame());
        assert_eq!(block.get(FRAME_FULLNESS), 1_500_000);
        assert_eq!(table.get(FRAME_SLOT_DISTORTION), Binding::None);
        let clamps = block.get(FRAME_QP_CLAMPS);
        assert_eq!(clamps & 0xffff, 10);
        assert_eq!(clamps >> 16, 50);
    }

    #[test]
    fn qp_clamps_vary_by_frame_type() {
        assert_ne!(qp_clamps(FrameType::I), qp_clamps(FrameType::B));
        for t in [FrameType::I, FrameType::P, FrameType::B] {
            let (lo, hi) = qp_clamps(t);
            assert!(lo < hi && hi <= 51);
        }
    }
}
