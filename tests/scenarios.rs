//! End-to-end session scenarios against the stub command substrate.

use vmeforge::hw::stub::{ExecutedOp, StubDevice};
use vmeforge::hw::BufferKind;
use vmeforge::kernels::mbenc;
use vmeforge::{
    BitrateControl, BufferHandle, DeviceGen, EncodeSession, FrameParams, FrameType, KernelStage,
    PictureParams, Preset, SequenceParams, SliceParams, SliceType, SurfaceId,
};

fn trace_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn frame_params(
    seq: SequenceParams,
    frame_no: u32,
    slice_type: SliceType,
    ref_recon: Option<SurfaceId>,
) -> FrameParams {
    let mb_rows = seq.height.div_ceil(16);
    let mut slice = SliceParams::full_frame(slice_type, mb_rows);
    if let Some(r) = ref_recon {
        slice.refs_l0.push(vmeforge::params::RefPic {
            surface: r,
            poc: frame_no as i32 - 1,
        });
    }
    FrameParams {
        seq,
        pic: PictureParams {
            source: SurfaceId(100 + frame_no),
            recon: SurfaceId(200 + frame_no),
            poc: frame_no as i32,
            base_qp: 28,
            is_reference: true,
            coded_output: BufferHandle(10_000 + frame_no as u64),
        },
        slices: vec![slice],
        roi: Vec::new(),
        mb_qp_override: None,
    }
}

fn dispatches_of(dev: &StubDevice, stage: KernelStage) -> Vec<(usize, u32)> {
    dev.executed()
        .iter()
        .enumerate()
        .filter_map(|(i, op)| match op {
            ExecutedOp::KernelDispatch { stage: s, variant, .. } if *s == stage.id() => {
                Some((i, *variant))
            }
            _ => None,
        })
        .collect()
}

#[test]
fn scenario_a_full_hd_quality_fixed_qp() {
    trace_init();
    let mut session =
        EncodeSession::new(StubDevice::new(), DeviceGen::Gen9, Preset::Quality).unwrap();
    let params = frame_params(SequenceParams::new(1920, 1088), 0, SliceType::I, None);

    let report = session.encode_frame(&params).unwrap();
    assert_eq!(report.passes_emitted, 1);

    let dev = session.device_mut();
    // All three octave levels scaled.
    for stage in [
        KernelStage::Scale4x,
        KernelStage::Scale16x,
        KernelStage::Scale32x,
    ] {
        assert_eq!(dispatches_of(dev, stage).len(), 1, "{stage:?} missing");
    }

    // MB encode ran the quality/I variant.
    let mbenc_dispatches = dispatches_of(dev, KernelStage::MbEnc);
    assert_eq!(mbenc_dispatches.len(), 1);
    assert_eq!(
        mbenc_dispatches[0].1,
        mbenc::variant(DeviceGen::Gen9, Preset::Quality, FrameType::I) as u32
    );

    // Exactly one unconditional packetization pass.
    let paks = dev
        .executed()
        .iter()
        .filter(|op| matches!(op, ExecutedOp::PakExecute { .. }))
        .count();
    assert_eq!(paks, 1);
    assert!(!dev
        .executed()
        .iter()
        .any(|op| matches!(op, ExecutedOp::CondPassSkip { .. })));
}

#[test]
fn scenario_b_rate_controlled_first_frame_ordering() {
    trace_init();
    let mut session =
        EncodeSession::new(StubDevice::new(), DeviceGen::Gen9, Preset::Quality).unwrap();
    let seq = SequenceParams::new(1920, 1088)
        .with_bitrate(BitrateControl::ConstantBitrate, 8_000_000, 8_000_000)
        .with_frame_rate(30, 1);

    session
        .encode_frame(&frame_params(seq.clone(), 0, SliceType::I, None))
        .unwrap();

    let real_variant = mbenc::variant(DeviceGen::Gen9, Preset::Quality, FrameType::I) as u32;
    {
        let dev = session.device_mut();
        let init_at = dispatches_of(dev, KernelStage::BrcInit)[0].0;
        let update_at = dispatches_of(dev, KernelStage::BrcFrameUpdate)[0].0;
        let encode_at = dispatches_of(dev, KernelStage::MbEnc)
            .into_iter()
            .find(|(_, v)| *v == real_variant)
            .expect("real mb-encode dispatch")
            .0;
        assert!(init_at < update_at, "init/reset must precede frame update");
        assert!(update_at < encode_at, "frame update must precede encode");
    }

    // Persistent rate-control buffers were allocated exactly once: a
    // second frame triggers neither a new init nor new statistics.
    let stats_live = session.device_mut().live_by_kind(BufferKind::Statistics);
    session.device_mut().clear_log();
    session
        .encode_frame(&frame_params(seq, 1, SliceType::P, Some(SurfaceId(200))))
        .unwrap();
    let dev = session.device_mut();
    assert!(dispatches_of(dev, KernelStage::BrcInit).is_empty());
    assert_eq!(dev.live_by_kind(BufferKind::Statistics), stats_live);
}

#[test]
fn scenario_c_tiny_input_clamps_instead_of_failing() {
    trace_init();
    let mut session =
        EncodeSession::new(StubDevice::new(), DeviceGen::Gen9, Preset::Quality).unwrap();
    let params = frame_params(SequenceParams::new(64, 64), 0, SliceType::I, None);

    session.encode_frame(&params).unwrap();

    let dev = session.device_mut();
    // Only the clamped 4x octave is scaled; its grid covers the
    // 48x48 minimum pyramid, not the raw 16x16 downscale.
    let scale4x = dispatches_of(dev, KernelStage::Scale4x);
    assert_eq!(scale4x.len(), 1);
    assert!(dispatches_of(dev, KernelStage::Scale16x).is_empty());
    assert!(dispatches_of(dev, KernelStage::Scale32x).is_empty());

    let grid = dev
        .executed()
        .iter()
        .find_map(|op| match op {
            ExecutedOp::KernelDispatch {
                stage,
                grid_w,
                grid_h,
                ..
            } if *stage == KernelStage::Scale4x.id() => Some((*grid_w, *grid_h)),
            _ => None,
        })
        .unwrap();
    assert_eq!(grid, (3, 3));
}

#[test]
fn gop_boundaries_reset_first_frame_bookkeeping() {
    trace_init();
    let mut session =
        EncodeSession::new(StubDevice::new(), DeviceGen::Gen9, Preset::Normal).unwrap();
    let seq = SequenceParams::new(640, 480)
        .with_bitrate(BitrateControl::ConstantBitrate, 2_000_000, 2_000_000)
        .with_frame_rate(30, 1)
        .with_gop(3, 1);

    let plan = [
        (SliceType::I, None),
        (SliceType::P, Some(SurfaceId(200))),
        (SliceType::P, Some(SurfaceId(201))),
        (SliceType::I, None),
    ];
    let mut stats_live_after_first = 0;
    for (i, (ty, r)) in plan.into_iter().enumerate() {
        session.device_mut().clear_log();
        session
            .encode_frame(&frame_params(seq.clone(), i as u32, ty, r))
            .unwrap();
        let inits = dispatches_of(session.device_mut(), KernelStage::BrcInit).len();
        if i == 0 {
            assert_eq!(inits, 1, "first rate-controlled frame initializes");
            stats_live_after_first = session.device_mut().live_by_kind(BufferKind::Statistics);
        } else {
            assert_eq!(inits, 0, "frame {i} must not re-initialize");
            assert_eq!(
                session.device_mut().live_by_kind(BufferKind::Statistics),
                stats_live_after_first,
                "persistent buffers must survive the group boundary"
            );
        }
    }
    // The second group's opening I-frame restarted the counter.
    assert_eq!(session.rc_state().frames_in_gop, 1);
    assert!(session.rc_state().initialized);
}

#[test]
fn early_exit_emits_nothing_past_the_conditional_check() {
    trace_init();
    let mut session =
        EncodeSession::new(StubDevice::new(), DeviceGen::Gen9, Preset::Normal).unwrap();
    let seq = SequenceParams::new(640, 480)
        .with_bitrate(BitrateControl::ConstantBitrate, 2_000_000, 2_000_000)
        .with_frame_rate(30, 1);

    // Pass 0 overshoots the ~12.5 KB budget, pass 1 converges.
    {
        let dev = session.device_mut();
        dev.queue_pak_result(90_000);
        dev.queue_pak_result(10_000);
    }
    let report = session
        .encode_frame(&frame_params(seq, 0, SliceType::I, None))
        .unwrap();
    assert_eq!(report.coded_bytes, 10_000);

    let dev = session.device_mut();
    let skips: Vec<bool> = dev
        .executed()
        .iter()
        .filter_map(|op| match op {
            ExecutedOp::CondPassSkip { taken, .. } => Some(*taken),
            _ => None,
        })
        .collect();
    assert_eq!(skips, vec![false, true, true]);

    // Passes 2 and 3 issued nothing beyond their conditional check.
    let paks = dev
        .executed()
        .iter()
        .filter(|op| matches!(op, ExecutedOp::PakExecute { .. }))
        .count();
    assert_eq!(paks, 2);
    let last_op = dev.executed().last().unwrap();
    assert!(matches!(
        last_op,
        ExecutedOp::CondPassSkip { taken: true, .. }
    ));
}

#[test]
fn unseen_reference_surface_gets_resources_before_dispatch() {
    trace_init();
    let mut session =
        EncodeSession::new(StubDevice::new(), DeviceGen::Gen9, Preset::Quality).unwrap();

    // The reference was decoded elsewhere; this session never had it as
    // a reconstruction target, so its pyramid and MV buffers must be
    // created on the way into the kernel phase.
    let params = frame_params(
        SequenceParams::new(640, 480),
        0,
        SliceType::P,
        Some(SurfaceId(50)),
    );
    session.encode_frame(&params).unwrap();

    let dev = session.device_mut();
    assert!(!dispatches_of(dev, KernelStage::Hme4x).is_empty());

    // Both the recon target and the reference carry derived records;
    // retiring the reference frees real allocations.
    let live_before = dev.live_buffers();
    session.retire_surface(SurfaceId(50));
    assert!(session.device_mut().live_buffers() < live_before);
}
