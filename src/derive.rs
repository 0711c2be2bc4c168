//! Parameter derivation: codec parameters + preset -> per-frame plan.
//!
//! Everything here is pure computation over the delivered records; no
//! hardware resource is touched. Structural problems are rejected with
//! `InvalidParameter` before the resource manager or any builder runs.

use tracing::{debug, warn};

use crate::error::{EncodeError, Result};
use crate::params::{
    BitrateControl, FrameParams, Preset, PresetFeatures, RefPic, SliceType, MAX_PAK_PASSES,
    MAX_REFS_L0, MAX_REFS_L1, MB_SIZE, MIN_PYRAMID_DIM,
};

/// Frame type after collapsing slice types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    I,
    P,
    B,
}

impl FrameType {
    pub fn is_intra(self) -> bool {
        matches!(self, FrameType::I)
    }

    pub fn is_bidirectional(self) -> bool {
        matches!(self, FrameType::B)
    }
}

/// Geometry of one downscaled pyramid octave.
#[derive(Debug, Clone, Copy)]
pub struct OctaveGeometry {
    /// Right-shift from full resolution (2 for 4x, 4 for 16x, 5 for 32x).
    pub shift: u8,
    pub width: u32,
    pub height: u32,
    pub mb_w: u32,
    pub mb_h: u32,
    /// True when either axis was raised to `MIN_PYRAMID_DIM`.
    pub clamped: bool,
    /// True when the next-coarser octave exists and seeds this one.
    pub seeds_from_coarser: bool,
}

/// Downscale shifts for the 4x, 16x, and 32x octaves.
pub const OCTAVE_SHIFTS: [u8; 3] = [2, 4, 5];

/// Macroblock-grid geometry at full resolution and per octave.
#[derive(Debug, Clone)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub mb_w: u32,
    pub mb_h: u32,
    /// Index 0 is the finest octave (4x). A disabled octave is `None`.
    pub octaves: [Option<OctaveGeometry>; 3],
}

impl FrameGeometry {
    pub fn mb_count(&self) -> u32 {
        self.mb_w * self.mb_h
    }

    pub fn enabled_octaves(&self) -> usize {
        self.octaves.iter().filter(|o| o.is_some()).count()
    }
}

/// One reference with its derived temporal weighting.
#[derive(Debug, Clone, Copy)]
pub struct RefPlan {
    pub pic: RefPic,
    /// Temporal distance scale factor, clipped to [-1024, 1023].
    pub dist_scale: i16,
    /// Blend weight for bi-prediction biasing; 32 is an even split.
    pub blend_weight: u8,
}

/// Rate-control decisions for the frame.
#[derive(Debug, Clone, Copy)]
pub struct RcPlan {
    pub enabled: bool,
    pub mode: BitrateControl,
    /// 1 when rate control is disabled, `MAX_PAK_PASSES` otherwise.
    pub num_passes: u32,
    pub target_bps: u32,
    pub max_bps: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
}

impl RcPlan {
    /// Nominal bits per frame at the target bitrate.
    pub fn bits_per_frame(&self) -> u32 {
        if self.frame_rate_num == 0 {
            return 0;
        }
        ((self.target_bps as u64 * self.frame_rate_den as u64) / self.frame_rate_num as u64)
            as u32
    }
}

/// Feature toggles resolved for this specific frame.
#[derive(Debug, Clone, Copy)]
pub struct ActiveFeatures {
    /// Hierarchical motion estimation runs this frame.
    pub hme: bool,
    pub static_scene_detect: bool,
    pub adaptive_search: bool,
    pub trellis_rounding: bool,
    pub b_frame_bias: bool,
    pub mb_rate_control: bool,
    pub weighted_pred: bool,
    pub roi: bool,
    pub mb_qp_override: bool,
}

/// A slice's macroblock coverage, carried into the builders.
#[derive(Debug, Clone, Copy)]
pub struct SlicePlan {
    pub first_mb_row: u32,
    pub mb_row_count: u32,
    pub qp_delta: i8,
}

/// Complete per-frame encode plan (the frame encode descriptor).
///
/// Created once per input frame by [`FramePlan::derive`], consumed by the
/// resource manager, the builders, the sequencer, and the PAK loop.
#[derive(Debug, Clone)]
pub struct FramePlan {
    pub frame_type: FrameType,
    pub geometry: FrameGeometry,
    pub rc: RcPlan,
    /// Resolved picture quantization parameter.
    pub qp: u8,
    pub refs_l0: Vec<RefPlan>,
    pub refs_l1: Vec<RefPlan>,
    pub slices: Vec<SlicePlan>,
    pub features: ActiveFeatures,
    pub preset: Preset,
}

impl FramePlan {
    /// Derive a complete frame plan. Pure; touches no hardware resources.
    pub fn derive(params: &FrameParams, preset: Preset) -> Result<FramePlan> {
        let seq = &params.seq;
        if seq.width == 0 || seq.height == 0 {
            return Err(EncodeError::InvalidParameter(format!(
                "zero frame dimension {}x{}",
                seq.width, seq.height
            )));
        }

        let frame_type = classify_frame(params)?;
        let features_tbl = preset.features();
        let geometry = derive_geometry(seq.width, seq.height, features_tbl.hme_octaves);
        validate_slices(params, geometry.mb_h)?;
        validate_refs(params, frame_type)?;

        let rc = derive_rc(seq);
        let qp = resolve_qp(params);

        let (refs_l0, refs_l1) = derive_reference_plans(params, frame_type);

        let hme = !frame_type.is_intra() && geometry.enabled_octaves() > 0;
        let features = ActiveFeatures {
            hme,
            static_scene_detect: features_tbl.static_scene_detect
                && hme
                && frame_type == FrameType::P,
            adaptive_search: features_tbl.adaptive_search,
            trellis_rounding: features_tbl.trellis_rounding,
            b_frame_bias: features_tbl.b_frame_bias && frame_type.is_bidirectional(),
            mb_rate_control: features_tbl.mb_rate_control && rc.enabled,
            weighted_pred: features_tbl.weighted_pred
                && frame_type == FrameType::P
                && !params.slices.iter().all(|s| s.refs_l0.is_empty()),
            roi: !params.roi.is_empty() && features_tbl.mb_rate_control && rc.enabled,
            mb_qp_override: params.mb_qp_override.is_some(),
        };

        let slices = params
            .slices
            .iter()
            .map(|s| SlicePlan {
                first_mb_row: s.first_mb_row,
                mb_row_count: s.mb_row_count,
                qp_delta: s.qp_delta,
            })
            .collect();

        debug!(
            ?frame_type,
            mb_w = geometry.mb_w,
            mb_h = geometry.mb_h,
            octaves = geometry.enabled_octaves(),
            rc_enabled = rc.enabled,
            num_passes = rc.num_passes,
            qp,
            "derived frame plan"
        );

        Ok(FramePlan {
            frame_type,
            geometry,
            rc,
            qp,
            refs_l0,
            refs_l1,
            slices,
            features,
            preset,
        })
    }

    /// Preset feature table backing this plan.
    pub fn preset_features(&self) -> PresetFeatures {
        self.preset.features()
    }
}

fn classify_frame(params: &FrameParams) -> Result<FrameType> {
    let mut iter = params.slices.iter();
    let first = iter
        .next()
        .ok_or_else(|| EncodeError::InvalidParameter("frame has no slices".to_string()))?;
    if iter.any(|s| s.slice_type != first.slice_type) {
        return Err(EncodeError::InvalidParameter(
            "mixed slice types within a frame".to_string(),
        ));
    }
    Ok(match first.slice_type {
        SliceType::I => FrameType::I,
        SliceType::P => FrameType::P,
        SliceType::B => FrameType::B,
    })
}

fn mb_dim(pixels: u32) -> u32 {
    pixels.div_ceil(MB_SIZE)
}

/// Compute the full-resolution MB grid and per-octave pyramid geometry.
///
/// The finest requested octave is clamped up to the hardware minimum; a
/// coarser octave that would fall below the minimum in either axis is
/// disabled outright, and the next finer octave loses its coarser seed.
pub fn derive_geometry(width: u32, height: u32, requested_octaves: u8) -> FrameGeometry {
    let mut octaves: [Option<OctaveGeometry>; 3] = [None, None, None];

    for (i, &shift) in OCTAVE_SHIFTS.iter().enumerate() {
        if (i as u8) >= requested_octaves {
            break;
        }
        let raw_w = width >> shift;
        let raw_h = height >> shift;

        if i > 0 && (raw_w < MIN_PYRAMID_DIM / 2 || raw_h < MIN_PYRAMID_DIM / 2) {
            // A coarse level this small is no longer a meaningful
            // downscale; skip it rather than clamp it.
            break;
        }

        let w = raw_w.max(MIN_PYRAMID_DIM);
        let h = raw_h.max(MIN_PYRAMID_DIM);
        octaves[i] = Some(OctaveGeometry {
            shift,
            width: w,
            height: h,
            mb_w: mb_dim(w),
            mb_h: mb_dim(h),
            clamped: w != raw_w || h != raw_h,
            seeds_from_coarser: false,
        });
    }

    for i in 0..2 {
        let coarser_enabled = octaves[i + 1].is_some();
        if let Some(oct) = octaves[i].as_mut() {
            oct.seeds_from_coarser = coarser_enabled;
        }
    }

    FrameGeometry {
        width,
        height,
        mb_w: mb_dim(width),
        mb_h: mb_dim(height),
        octaves,
    }
}

fn validate_slices(params: &FrameParams, mb_h: u32) -> Result<()> {
    for (i, s) in params.slices.iter().enumerate() {
        if s.mb_row_count == 0 {
            return Err(EncodeError::InvalidParameter(format!(
                "slice {i} covers zero macroblock rows"
            )));
        }
        if s.first_mb_row + s.mb_row_count > mb_h {
            return Err(EncodeError::InvalidParameter(format!(
                "slice {i} rows {}..{} exceed frame height of {} MB rows",
                s.first_mb_row,
                s.first_mb_row + s.mb_row_count,
                mb_h
            )));
        }
    }
    Ok(())
}

fn validate_refs(params: &FrameParams, frame_type: FrameType) -> Result<()> {
    for (i, s) in params.slices.iter().enumerate() {
        if s.refs_l0.len() > MAX_REFS_L0 || s.refs_l1.len() > MAX_REFS_L1 {
            return Err(EncodeError::InvalidParameter(format!(
                "slice {i} references {}/{} exceed hardware maxima {}/{}",
                s.refs_l0.len(),
                s.refs_l1.len(),
                MAX_REFS_L0,
                MAX_REFS_L1
            )));
        }
        match frame_type {
            FrameType::I => {
                if !s.refs_l0.is_empty() || !s.refs_l1.is_empty() {
                    return Err(EncodeError::InvalidParameter(format!(
                        "slice {i}: I-frame carries reference lists"
                    )));
                }
            }
            FrameType::P => {
                if s.refs_l0.is_empty() {
                    return Err(EncodeError::InvalidParameter(format!(
                        "slice {i}: P-frame without a list-0 reference"
                    )));
                }
            }
            FrameType::B => {
                if s.refs_l0.is_empty() || s.refs_l1.is_empty() {
                    return Err(EncodeError::InvalidParameter(format!(
                        "slice {i}: B-frame missing a list-0 or list-1 reference"
                    )));
                }
            }
        }
    }
    Ok(())
}

fn derive_rc(seq: &crate::params::SequenceParams) -> RcPlan {
    let wants_rc = !matches!(seq.bitrate_control, BitrateControl::ConstantQp);
    let complete = seq.target_bps > 0 && seq.frame_rate_num > 0 && seq.frame_rate_den > 0;

    let enabled = if wants_rc && !complete {
        warn!(
            mode = ?seq.bitrate_control,
            target_bps = seq.target_bps,
            frame_rate_num = seq.frame_rate_num,
            "rate control requested with incomplete parameters, falling back to fixed QP"
        );
        false
    } else {
        wants_rc
    };

    let max_bps = if seq.max_bps == 0 {
        seq.target_bps
    } else {
        seq.max_bps
    };

    RcPlan {
        enabled,
        mode: if enabled {
            seq.bitrate_control
        } else {
            BitrateControl::ConstantQp
        },
        num_passes: if enabled { MAX_PAK_PASSES } else { 1 },
        target_bps: seq.target_bps,
        max_bps,
        frame_rate_num: seq.frame_rate_num,
        frame_rate_den: seq.frame_rate_den,
    }
}

fn resolve_qp(params: &FrameParams) -> u8 {
    let delta = params.slices.first().map(|s| s.qp_delta).unwrap_or(0);
    (params.pic.base_qp as i32 + delta as i32).clamp(1, 51) as u8
}

/// Temporal distance scale factor from picture-order-count deltas, per
/// the temporal-direct formula. `td == 0` substitutes a divisor of 1.
///
/// Result is clipped to [-1024, 1023].
pub fn distance_scale_factor(poc_cur: i32, poc_ref: i32, poc_anchor: i32) -> i16 {
    let tb = (poc_cur - poc_ref).clamp(-128, 127);
    let td = {
        let d = (poc_anchor - poc_ref).clamp(-128, 127);
        if d == 0 {
            1
        } else {
            d
        }
    };
    let tx = (16384 + td.abs() / 2) / td;
    (((tb * tx + 32) >> 6).clamp(-1024, 1023)) as i16
}

/// Bi-prediction blend weight from a distance scale factor.
///
/// `dsf >> 2` when it lands in the usable range [0, 128); otherwise 32
/// (an even split).
pub fn blend_weight(dist_scale: i16) -> u8 {
    let w = (dist_scale >> 2) as i32;
    if (0..128).contains(&w) {
        w as u8
    } else {
        32
    }
}

fn derive_reference_plans(
    params: &FrameParams,
    frame_type: FrameType,
) -> (Vec<RefPlan>, Vec<RefPlan>) {
    let slice = match params.slices.first() {
        Some(s) => s,
        None => return (Vec::new(), Vec::new()),
    };
    let poc_cur = params.pic.poc;

    if frame_type != FrameType::B {
        let unity = |pic: &RefPic| RefPlan {
            pic: *pic,
            dist_scale: 256,
            blend_weight: 32,
        };
        return (
            slice.refs_l0.iter().map(unity).collect(),
            slice.refs_l1.iter().map(unity).collect(),
        );
    }

    // B-frame: weight each list-0 reference against the first list-1
    // reference as the opposite anchor, and vice versa.
    let anchor_l1 = slice.refs_l1.first().map(|r| r.poc).unwrap_or(poc_cur);
    let anchor_l0 = slice.refs_l0.first().map(|r| r.poc).unwrap_or(poc_cur);

    let l0 = slice
        .refs_l0
        .iter()
        .map(|r| {
            let dsf = distance_scale_factor(poc_cur, r.poc, anchor_l1);
            RefPlan {
                pic: *r,
                dist_scale: dsf,
                blend_weight: blend_weight(dsf),
            }
        })
        .collect();
    let l1 = slice
        .refs_l1
        .iter()
        .map(|r| {
            let dsf = distance_scale_factor(poc_cur, r.poc, anchor_l0);
            RefPlan {
                pic: *r,
                dist_scale: dsf,
                blend_weight: blend_weight(dsf),
            }
        })
        .collect();
    (l0, l1)
}
