//! Encode session: owns the device, the kernel contexts, the resource
//! pools, and the cross-frame rate-control state. One frame in flight
//! at a time; `encode_frame` is synchronous through PAK readback.

use tracing::{debug, info, warn};

use crate::derive::{FramePlan, FrameType};
use crate::error::Result;
use crate::hw::{BufferHandle, HwDevice, SurfaceId};
use crate::kernels::brc::RcState;
use crate::kernels::{
    aux_stages, brc, hme, mbenc, scale, DeviceGen, KernelContext, KernelContexts, KernelStage,
    WalkerPattern,
};
use crate::pak;
use crate::params::{FrameParams, Preset};
use crate::pipeline::{FrameReport, Sequencer};
use crate::resources::{SessionBuffers, SurfacePool};

pub struct EncodeSession<D: HwDevice> {
    dev: D,
    gen: DeviceGen,
    preset: Preset,
    pool: SurfacePool,
    bufs: SessionBuffers,
    contexts: KernelContexts,
    rc: RcState,
    /// Output handle and size of the most recent completed frame; the
    /// coded size is only answerable for that one handle.
    last_coded: Option<(BufferHandle, u32)>,
    frames_encoded: u64,
}

impl<D: HwDevice> EncodeSession<D> {
    /// Create a session and allocate every kernel context up front:
    /// one per scaling/motion octave, the MB-encode variant for each
    /// frame type at the session preset plus the intra distortion
    /// estimator, the three rate-control kernels, and the optional
    /// tail stages.
    pub fn new(mut dev: D, gen: DeviceGen, preset: Preset) -> Result<Self> {
        let mut contexts = KernelContexts::new();

        for octave in 0..3 {
            contexts.insert(KernelContext::new(
                &mut dev,
                gen,
                KernelStage::scale_for_octave(octave),
                0,
                WalkerPattern::Independent,
                scale::SLOT_COUNT,
            )?);
            contexts.insert(KernelContext::new(
                &mut dev,
                gen,
                KernelStage::hme_for_octave(octave),
                0,
                WalkerPattern::Wavefront26,
                hme::SLOT_COUNT,
            )?);
        }

        for frame_type in [FrameType::I, FrameType::P, FrameType::B] {
            contexts.insert(KernelContext::new(
                &mut dev,
                gen,
                KernelStage::MbEnc,
                mbenc::variant(gen, preset, frame_type),
                WalkerPattern::Wavefront45,
                mbenc::SLOT_COUNT,
            )?);
        }
        contexts.insert(KernelContext::new(
            &mut dev,
            gen,
            KernelStage::MbEnc,
            mbenc::intra_dist_variant(gen),
            WalkerPattern::Wavefront45,
            mbenc::SLOT_COUNT,
        )?);

        contexts.insert(KernelContext::new(
            &mut dev,
            gen,
            KernelStage::BrcInit,
            0,
            WalkerPattern::Independent,
            brc::INIT_SLOT_COUNT,
        )?);
        contexts.insert(KernelContext::new(
            &mut dev,
            gen,
            KernelStage::BrcFrameUpdate,
            0,
            WalkerPattern::Independent,
            brc::FRAME_SLOT_COUNT,
        )?);
        contexts.insert(KernelContext::new(
            &mut dev,
            gen,
            KernelStage::BrcMbUpdate,
            0,
            WalkerPattern::Independent,
            brc::MB_SLOT_COUNT,
        )?);
        contexts.insert(KernelContext::new(
            &mut dev,
            gen,
            KernelStage::StaticSceneDetect,
            0,
            WalkerPattern::Independent,
            aux_stages::SFD_SLOT_COUNT,
        )?);
        contexts.insert(KernelContext::new(
            &mut dev,
            gen,
            KernelStage::WeightedPred,
            0,
            WalkerPattern::Independent,
            aux_stages::WP_SLOT_COUNT,
        )?);

        info!(?gen, ?preset, contexts = contexts.len(), "encode session created");
        Ok(Self {
            dev,
            gen,
            preset,
            pool: SurfacePool::new(),
            bufs: SessionBuffers::new(),
            contexts,
            rc: RcState::default(),
            last_coded: None,
            frames_encoded: 0,
        })
    }

    pub fn preset(&self) -> Preset {
        self.preset
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    pub fn rc_state(&self) -> &RcState {
        &self.rc
    }

    /// Flag the rate-control model for re-initialization before the
    /// next frame, e.g. after a bitrate change.
    pub fn request_brc_reset(&mut self) {
        self.rc.reset_pending = true;
    }

    /// Record a frame dropped upstream; its bit budget folds into the
    /// buffer model on the next frame update.
    pub fn note_skipped_frame(&mut self) {
        self.rc.pending_skip_frames += 1;
    }

    /// Encode one frame synchronously: derive the plan, sequence the
    /// kernel phase, run the packetization loop, and read the coded
    /// size back. An error aborts the frame and leaves the rate-control
    /// history untouched.
    pub fn encode_frame(&mut self, params: &FrameParams) -> Result<FrameReport> {
        let plan = FramePlan::derive(params, self.preset)?;
        debug!(
            frame = self.frames_encoded,
            ty = ?plan.frame_type,
            qp = plan.qp,
            passes = plan.rc.num_passes,
            "frame plan derived"
        );

        self.dev.begin(256);
        let mut sequencer = Sequencer {
            dev: &mut self.dev,
            gen: self.gen,
            pool: &mut self.pool,
            bufs: &mut self.bufs,
            contexts: &mut self.contexts,
        };
        let mut report = match sequencer.run(&plan, params, &self.rc) {
            Ok(report) => report,
            Err(e) => {
                warn!(frame = self.frames_encoded, error = %e, "kernel phase aborted");
                self.dev.abort();
                return Err(e);
            }
        };
        self.dev.end();
        self.dev.submit()?;

        let outcome = pak::run_pak_loop(&mut self.dev, &plan, params, &self.bufs)?;
        pak::finalize(&mut self.rc, &plan, &outcome);
        report.passes_emitted = outcome.passes_emitted;
        report.coded_bytes = outcome.coded_bytes;

        if let Some(record) = self.pool.get_mut(params.pic.recon) {
            record.resolved_qp = outcome.final_qp;
            record.is_reference = params.pic.is_reference;
        }

        self.last_coded = Some((params.pic.coded_output, outcome.coded_bytes));
        self.frames_encoded += 1;
        info!(
            frame = self.frames_encoded,
            bytes = outcome.coded_bytes,
            pass = outcome.last_completed_pass,
            "frame encoded"
        );
        Ok(report)
    }

    /// Coded size of `output`, valid only for the most recent frame's
    /// output buffer.
    pub fn coded_size(&self, output: BufferHandle) -> Option<u32> {
        match self.last_coded {
            Some((h, bytes)) if h == output => Some(bytes),
            _ => None,
        }
    }

    /// Drop a surface from the reference window and free its derived
    /// resources.
    pub fn retire_surface(&mut self, id: SurfaceId) {
        self.pool.release_surface_resources(&mut self.dev, id);
    }

    /// Mutable device access, mainly for inspection in tests.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    /// Tear the session down, freeing every allocation it made, and
    /// hand the device back.
    pub fn destroy(mut self) -> D {
        self.contexts.release_all(&mut self.dev);
        self.bufs.release(&mut self.dev);
        self.pool.release_all(&mut self.dev);
        debug!(frames = self.frames_encoded, "encode session destroyed");
        self.dev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EncodeError;
    use crate::hw::stub::StubDevice;
    use crate::params::{PictureParams, SequenceParams, SliceParams, SliceType};

    fn cqp_i_frame(output: BufferHandle) -> FrameParams {
        FrameParams {
            seq: SequenceParams::new(640, 480),
            pic: PictureParams {
                source: SurfaceId(1),
                recon: SurfaceId(2),
                poc: 0,
                base_qp: 30,
                is_reference: true,
                coded_output: output,
            },
            slices: vec![SliceParams::full_frame(SliceType::I, 30)],
            roi: Vec::new(),
            mb_qp_override: None,
        }
    }

    #[test]
    fn session_preallocates_kernel_state() {
        let mut session =
            EncodeSession::new(StubDevice::new(), DeviceGen::Gen9, Preset::Normal).unwrap();
        // 3 scale + 3 hme + 4 mbenc + 3 brc + sfd + wp.
        let curbes = session
            .device_mut()
            .live_by_kind(crate::hw::BufferKind::KernelState);
        assert_eq!(curbes, 15);
    }

    #[test]
    fn coded_size_is_only_valid_for_the_last_output() {
        let mut session =
            EncodeSession::new(StubDevice::new(), DeviceGen::Gen9, Preset::Performance).unwrap();
        let out_a = BufferHandle(1001);
        let out_b = BufferHandle(1002);

        session.encode_frame(&cqp_i_frame(out_a)).unwrap();
        assert!(session.coded_size(out_a).is_some());

        let mut second = cqp_i_frame(out_b);
        second.pic.recon = SurfaceId(3);
        second.pic.poc = 1;
        session.encode_frame(&second).unwrap();
        assert!(session.coded_size(out_a).is_none());
        assert_eq!(
            session.coded_size(out_b),
            Some(crate::hw::stub::DEFAULT_PAK_BYTES)
        );
    }

    #[test]
    fn aborted_frame_leaves_rc_history_untouched() {
        let dev = StubDevice::new();
        let mut session = EncodeSession::new(dev, DeviceGen::Gen9, Preset::Normal).unwrap();

        let mut params = cqp_i_frame(BufferHandle(1001));
        params.seq = params
            .seq
            .with_bitrate(
                crate::params::BitrateControl::ConstantBitrate,
                2_000_000,
                2_000_000,
            )
            .with_frame_rate(30, 1);

        // Exhaust allocations so the session-buffer ensure fails.
        session.device_mut().fail_alloc_after(2);
        let err = session.encode_frame(&params).unwrap_err();
        assert!(matches!(err, EncodeError::AllocationFailure(_)));
        assert!(!session.rc_state().initialized);

        // Recovery: the same frame goes through once allocations work.
        session.device_mut().clear_alloc_failure();
        session.encode_frame(&params).unwrap();
        assert!(session.rc_state().initialized);
    }

    #[test]
    fn failed_submission_is_fatal_for_the_frame_only() {
        let mut session =
            EncodeSession::new(StubDevice::new(), DeviceGen::Gen9, Preset::Normal).unwrap();

        let mut params = cqp_i_frame(BufferHandle(1001));
        params.seq = params
            .seq
            .with_bitrate(
                crate::params::BitrateControl::ConstantBitrate,
                2_000_000,
                2_000_000,
            )
            .with_frame_rate(30, 1);

        session.device_mut().set_fail_submit(true);
        let err = session.encode_frame(&params).unwrap_err();
        assert!(matches!(err, EncodeError::SubmissionFailure(_)));
        assert!(!session.rc_state().initialized);
        assert_eq!(session.frames_encoded(), 0);

        // The session stays usable once the queue recovers.
        session.device_mut().set_fail_submit(false);
        session.encode_frame(&params).unwrap();
        assert!(session.rc_state().initialized);
        assert_eq!(session.frames_encoded(), 1);
    }

    #[test]
    fn retiring_a_surface_frees_its_derived_record() {
        let mut session =
            EncodeSession::new(StubDevice::new(), DeviceGen::Gen9, Preset::Performance).unwrap();
        session.encode_frame(&cqp_i_frame(BufferHandle(1001))).unwrap();

        let live_before = session.device_mut().live_buffers();
        session.retire_surface(SurfaceId(2));
        assert!(session.device_mut().live_buffers() < live_before);
    }

    #[test]
    fn teardown_releases_every_allocation() {
        let mut session =
            EncodeSession::new(StubDevice::new(), DeviceGen::Gen9, Preset::Quality).unwrap();
        session.encode_frame(&cqp_i_frame(BufferHandle(1001))).unwrap();
        let dev = session.destroy();
        assert_eq!(dev.live_buffers(), 0);
    }
}
