//! Codec parameter records and encoder presets.
//!
//! Sequence/picture/slice records arrive already validated at the
//! container level; the control plane re-checks only what it structurally
//! depends on (reference counts, slice coverage, dimensions).

use crate::hw::{BufferHandle, SurfaceId};

// Hardware limits and defaults.

/// Macroblock size in pixels.
pub const MB_SIZE: u32 = 16;

/// Minimum pyramid dimension in pixels per axis after scaling. An octave
/// that would fall below this in either axis is disabled; the finest
/// octave is clamped up to it instead.
pub const MIN_PYRAMID_DIM: u32 = 48;

/// Maximum packetization passes per frame under rate control.
pub const MAX_PAK_PASSES: u32 = 4;

/// Maximum list-0 references the motion-estimation hardware accepts.
pub const MAX_REFS_L0: usize = 2;

/// Maximum list-1 references the motion-estimation hardware accepts.
pub const MAX_REFS_L1: usize = 1;

/// Frame-store slots available for reference surfaces.
pub const MAX_FRAME_STORES: usize = 16;

/// Default base quantization parameter when none is derivable.
pub const DEFAULT_QP: u8 = 26;

/// Requested bitrate-control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitrateControl {
    /// Fixed quantization; no feedback loop.
    #[default]
    ConstantQp,
    /// Constant bitrate.
    ConstantBitrate,
    /// Variable bitrate bounded by a maximum.
    VariableBitrate,
}

/// Slice type, already collapsed from the codec-level slice-type space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    I,
    P,
    B,
}

/// Sequence-level parameters.
#[derive(Debug, Clone)]
pub struct SequenceParams {
    pub width: u32,
    pub height: u32,
    /// Frames between intra refreshes (GOP length).
    pub intra_period: u32,
    /// Distance between anchor (I/P) frames; >1 implies B-frames.
    pub ip_period: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub bitrate_control: BitrateControl,
    /// Target bitrate in bits per second. Zero means "not provided".
    pub target_bps: u32,
    /// Maximum bitrate in bits per second (VBR ceiling).
    pub max_bps: u32,
    pub num_ref_frames: u32,
}

impl SequenceParams {
    /// Fixed-QP sequence with sane defaults for the given dimensions.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            intra_period: 30,
            ip_period: 1,
            frame_rate_num: 30,
            frame_rate_den: 1,
            bitrate_control: BitrateControl::ConstantQp,
            target_bps: 0,
            max_bps: 0,
            num_ref_frames: 2,
        }
    }

    pub fn with_bitrate(mut self, mode: BitrateControl, target_bps: u32, max_bps: u32) -> Self {
        self.bitrate_control = mode;
        self.target_bps = target_bps;
        self.max_bps = max_bps;
        self
    }

    pub fn with_frame_rate(mut self, num: u32, den: u32) -> Self {
        self.frame_rate_num = num;
        self.frame_rate_den = den;
        self
    }

    pub fn with_gop(mut self, intra_period: u32, ip_period: u32) -> Self {
        self.intra_period = intra_period;
        self.ip_period = ip_period;
        self
    }

    pub fn with_ref_frames(mut self, count: u32) -> Self {
        self.num_ref_frames = count;
        self
    }
}

/// Picture-level parameters for one frame.
#[derive(Debug, Clone)]
pub struct PictureParams {
    /// Source picture to encode.
    pub source: SurfaceId,
    /// Reconstruction target surface.
    pub recon: SurfaceId,
    /// Picture order count of the current picture.
    pub poc: i32,
    /// Base quantization parameter for the picture.
    pub base_qp: u8,
    /// Whether the reconstructed picture joins the reference window.
    pub is_reference: bool,
    /// Coded bitstream destination, caller-allocated.
    pub coded_output: BufferHandle,
}

/// A reference picture entry in a slice's list.
#[derive(Debug, Clone, Copy)]
pub struct RefPic {
    pub surface: SurfaceId,
    pub poc: i32,
}

/// Slice-level parameters.
#[derive(Debug, Clone)]
pub struct SliceParams {
    pub slice_type: SliceType,
    /// First macroblock row covered by this slice.
    pub first_mb_row: u32,
    /// Macroblock rows covered by this slice.
    pub mb_row_count: u32,
    pub qp_delta: i8,
    pub refs_l0: Vec<RefPic>,
    pub refs_l1: Vec<RefPic>,
}

impl SliceParams {
    /// Single full-frame slice of the given type.
    pub fn full_frame(slice_type: SliceType, mb_rows: u32) -> Self {
        Self {
            slice_type,
            first_mb_row: 0,
            mb_row_count: mb_rows,
            qp_delta: 0,
            refs_l0: Vec::new(),
            refs_l1: Vec::new(),
        }
    }
}

/// Region-of-interest rectangle in macroblock units with a QP adjustment.
#[derive(Debug, Clone, Copy)]
pub struct RoiRect {
    pub mb_left: u32,
    pub mb_top: u32,
    pub mb_right: u32,
    pub mb_bottom: u32,
    pub qp_delta: i8,
}

/// Everything the caller delivers for one `encode_frame` call.
#[derive(Debug, Clone)]
pub struct FrameParams {
    pub seq: SequenceParams,
    pub pic: PictureParams,
    pub slices: Vec<SliceParams>,
    /// Optional region-of-interest QP deltas, folded into MB-level rate
    /// control when it is active.
    pub roi: Vec<RoiRect>,
    /// Optional externally supplied per-macroblock QP override surface.
    pub mb_qp_override: Option<BufferHandle>,
}

/// Encoder quality preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Preset {
    Quality,
    #[default]
    Normal,
    Performance,
}

/// Per-preset feature toggles.
///
/// `scene_detect_variant` and `rolling_intra_refresh` are wired through
/// the builders but have no external control surface; they keep their
/// defaults on every path.
#[derive(Debug, Clone, Copy)]
pub struct PresetFeatures {
    /// Hierarchical motion-estimation octave count requested (0..=3).
    pub hme_octaves: u8,
    pub static_scene_detect: bool,
    pub adaptive_search: bool,
    pub trellis_rounding: bool,
    /// Signed bias-adjustment blending for B-frames.
    pub b_frame_bias: bool,
    /// Macroblock-level rate control (when frame rate control is on).
    pub mb_rate_control: bool,
    /// Weighted prediction against faded references.
    pub weighted_pred: bool,
    pub scene_detect_variant: u8,
    pub rolling_intra_refresh: bool,
}

impl Preset {
    pub fn features(self) -> PresetFeatures {
        match self {
            Preset::Quality => PresetFeatures {
                hme_octaves: 3,
                static_scene_detect: true,
                adaptive_search: true,
                trellis_rounding: true,
                b_frame_bias: true,
                mb_rate_control: true,
                weighted_pred: true,
                scene_detect_variant: 0,
                rolling_intra_refresh: false,
            },
            Preset::Normal => PresetFeatures {
                hme_octaves: 2,
                static_scene_detect: true,
                adaptive_search: true,
                trellis_rounding: false,
                b_frame_bias: true,
                mb_rate_control: true,
                weighted_pred: false,
                scene_detect_variant: 0,
                rolling_intra_refresh: false,
            },
            Preset::Performance => PresetFeatures {
                hme_octaves: 1,
                static_scene_detect: false,
                adaptive_search: false,
                trellis_rounding: false,
                b_frame_bias: false,
                mb_rate_control: false,
                weighted_pred: false,
                scene_detect_variant: 0,
                rolling_intra_refresh: false,
            },
        }
    }

    /// Motion search window (width, height) in pixels for the given
    /// octave index (0 = finest / 4x).
    pub fn search_window(self, octave: usize) -> (u8, u8) {
        match (self, octave) {
            (Preset::Performance, _) => (28, 28),
            (_, 0) => (48, 40),
            (_, 1) => (48, 40),
            (_, _) => (64, 40),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_builder_chaining() {
        let seq = SequenceParams::new(1920, 1088)
            .with_bitrate(BitrateControl::ConstantBitrate, 6_000_000, 6_000_000)
            .with_frame_rate(60, 1)
            .with_gop(60, 1)
            .with_ref_frames(1);

        assert_eq!(seq.bitrate_control, BitrateControl::ConstantBitrate);
        assert_eq!(seq.target_bps, 6_000_000);
        assert_eq!(seq.frame_rate_num, 60);
        assert_eq!(seq.intra_period, 60);
        assert_eq!(seq.num_ref_frames, 1);
    }

    #[test]
    fn preset_octave_counts() {
        assert_eq!(Preset::Quality.features().hme_octaves, 3);
        assert_eq!(Preset::Normal.features().hme_octaves, 2);
        assert_eq!(Preset::Performance.features().hme_octaves, 1);
    }

    #[test]
    fn performance_preset_disables_quality_features() {
        let f = Preset::Performance.features();
        assert!(!f.static_scene_detect);
        assert!(!f.adaptive_search);
        assert!(!f.trellis_rounding);
        assert!(!f.b_frame_bias);
    }

    #[test]
    fn search_window_widens_at_coarse_octaves() {
        let (w0, _) = Preset::Quality.search_window(0);
        let (w2, _) = Preset::Quality.search_window(2);
        assert!(w2 >= w0);
    }
}
