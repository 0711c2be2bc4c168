//! Multi-pass packetization loop with conditional early exit.
//!
//! Each pass is submitted as its own command group. Pass 0 resets the
//! hardware status register and loads fresh picture state; every later
//! pass opens with a conditional-skip command so hardware drops the
//! whole pass once the previous one already landed within the byte
//! budget. After the loop the statistics buffer holds one byte-count
//! and completion-marker pair per executed pass; the highest completed
//! pass is the frame's coded size and the feedback rate control reads
//! next frame.

use tracing::{debug, trace};

use crate::derive::FramePlan;
use crate::error::{EncodeError, Result};
use crate::hw::{ops, HwDevice, MapGuard};
use crate::kernels::brc::{qp_clamps, RcState};
use crate::params::FrameParams;
use crate::resources::{SessionBuffers, PAK_STATS_SIZE};

/// Outcome of the packetization loop for one frame.
#[derive(Debug, Clone, Copy)]
pub struct PakOutcome {
    /// Passes emitted to hardware (skipped ones included).
    pub passes_emitted: u32,
    /// Highest pass whose completion marker landed.
    pub last_completed_pass: u32,
    pub coded_bytes: u32,
    /// QP the surviving pass was packetized with; becomes the recon
    /// surface's resolved QP.
    pub final_qp: u8,
}

/// Per-pass QP for a rate-controlled frame: the frame-update decision
/// applied to the previous pass, modeled as a fixed step per retry and
/// clamped to the frame-type range.
fn pass_qp(plan: &FramePlan, pass: u32) -> u32 {
    if !plan.rc.enabled {
        return plan.qp as u32;
    }
    let (min_qp, max_qp) = qp_clamps(plan.frame_type);
    (plan.qp as u32 + pass * 2).clamp(min_qp as u32, max_qp as u32)
}

/// Byte budget a pass must land within for later passes to be skipped.
fn pass_budget_bytes(plan: &FramePlan) -> u32 {
    // Half a frame of headroom over the nominal budget.
    let nominal = plan.rc.bits_per_frame() / 8;
    nominal + nominal / 2
}

pub fn run_pak_loop<D: HwDevice + ?Sized>(
    dev: &mut D,
    plan: &FramePlan,
    params: &FrameParams,
    bufs: &SessionBuffers,
) -> Result<PakOutcome> {
    let stats = bufs.pak_stats.ok_or_else(|| {
        EncodeError::InvalidParameter("session buffer not allocated: pak statistics".to_string())
    })?;

    // Clear stale markers from the previous frame.
    {
        let mut guard = MapGuard::new(dev, stats, "pak statistics")?;
        guard.write_words(&[0u32; PAK_STATS_SIZE / 4]);
    }

    let output = params.pic.coded_output;
    let budget = pass_budget_bytes(plan);

    for pass in 0..plan.rc.num_passes {
        dev.begin(64);
        if pass == 0 {
            dev.emit(&[ops::STATUS_RESET, 1, 0]);
        } else {
            dev.emit(&[ops::COND_PASS_SKIP, 1, budget]);
        }
        dev.emit(&[ops::IMAGE_STATE, 2, pass_qp(plan, pass), pass]);
        dev.emit(&[
            ops::PAK_EXECUTE,
            2,
            output.0 as u32,
            (output.0 >> 32) as u32,
        ]);
        dev.emit(&[
            ops::STATUS_READBACK,
            4,
            stats.0 as u32,
            (stats.0 >> 32) as u32,
            2 * pass,
            pass,
        ]);
        dev.end();
        dev.submit()?;
        trace!(pass, budget, "pak pass submitted");
    }

    dev.wait_idle()?;

    // Scan completion markers for the last pass that ran.
    let (last_pass, coded_bytes) = {
        let guard = MapGuard::new(dev, stats, "pak statistics")?;
        let mut found = None;
        for pass in 0..plan.rc.num_passes {
            if guard.read_word((2 * pass + 1) as usize) != 0 {
                found = Some((pass, guard.read_word((2 * pass) as usize)));
            }
        }
        found.ok_or_else(|| {
            EncodeError::SubmissionFailure("no pak pass completed".to_string())
        })?
    };

    debug!(
        passes = plan.rc.num_passes,
        last_pass, coded_bytes, "pak loop complete"
    );
    Ok(PakOutcome {
        passes_emitted: plan.rc.num_passes,
        last_completed_pass: last_pass,
        coded_bytes,
        final_qp: pass_qp(plan, last_pass) as u8,
    })
}

/// Post-loop bookkeeping: mark the rate-control model live, clear a
/// pending reset, and roll the coded size into the buffer model.
pub fn finalize(rc: &mut RcState, plan: &FramePlan, outcome: &PakOutcome) {
    if plan.rc.enabled {
        rc.initialized = true;
        rc.reset_pending = false;
        let coded_bits = outcome.coded_bytes as u64 * 8;
        let budget_bits = plan.rc.bits_per_frame() as u64;
        rc.fullness = (rc.fullness + coded_bits).saturating_sub(budget_bits);
        rc.pending_skip_frames = 0;
    }
    if plan.frame_type.is_intra() {
        rc.frames_in_gop = 1;
    } else {
        rc.frames_in_gop += 1;
    }
}
