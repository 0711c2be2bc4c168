//! Per-frame kernel pipeline sequencer.
//!
//! Walks the fixed stage order for one frame, gating optional stages on
//! the derived plan: init/reset, scaling octaves fine to coarse, motion
//! estimation coarse to fine, scene detection, the rate-control update
//! pair around MB encode, and weighted prediction. Every dispatched
//! stage is followed by a pipeline flush so consumer kernels observe
//! producer output. Any builder or map error aborts the frame; nothing
//! dispatched so far is rolled back, but the rate-control history is
//! only advanced by PAK finalize, so an aborted frame leaves it
//! untouched.

use tracing::debug;

use crate::derive::FramePlan;
use crate::error::{EncodeError, Result};
use crate::hw::{ops, BufferHandle, HwDevice, MapGuard, SurfaceId};
use crate::kernels::brc::RcState;
use crate::kernels::{
    aux_stages, brc, hme, mbenc, scale, Binding, BindingTable, DeviceGen, KernelContexts,
    KernelStage, ParameterBlock,
};
use crate::params::{FrameParams, RoiRect};
use crate::resources::{SessionBuffers, SurfacePool, SurfaceResources};

/// Default weighted-prediction denominator; weight 64 is identity.
const WP_LOG2_DENOM: u8 = 6;

/// What actually ran for one frame, in dispatch order. The MB-encode
/// stage can appear twice: once for the intra distortion-estimation
/// seeding variant and once for the real encode.
#[derive(Debug, Default, Clone)]
pub struct FrameReport {
    pub stages: Vec<KernelStage>,
    /// Filled in by the PAK loop.
    pub passes_emitted: u32,
    pub coded_bytes: u32,
}

impl FrameReport {
    pub fn ran(&self, stage: KernelStage) -> bool {
        self.stages.contains(&stage)
    }

    fn position(&self, stage: KernelStage) -> Option<usize> {
        self.stages.iter().position(|s| *s == stage)
    }

    /// True when `before` was dispatched ahead of `after`.
    pub fn ordered(&self, before: KernelStage, after: KernelStage) -> bool {
        match (self.position(before), self.position(after)) {
            (Some(b), Some(a)) => b < a,
            _ => false,
        }
    }
}

/// Drives the kernel phase of one frame into an open command group.
pub struct Sequencer<'a, D: HwDevice + ?Sized> {
    pub dev: &'a mut D,
    pub gen: DeviceGen,
    pub pool: &'a mut SurfacePool,
    pub bufs: &'a mut SessionBuffers,
    pub contexts: &'a mut KernelContexts,
}

impl<'a, D: HwDevice + ?Sized> Sequencer<'a, D> {
    pub fn run(
        &mut self,
        plan: &FramePlan,
        params: &FrameParams,
        rc: &RcState,
    ) -> Result<FrameReport> {
        let mut report = FrameReport::default();

        self.bufs.ensure(self.dev, &plan.geometry)?;
        self.pool
            .ensure_surface_resources(self.dev, params.pic.recon, &plan.geometry)?;
        // References too, before any builder touches them: a surface the
        // caller hands in as a reference may never have been this
        // session's reconstruction target, or may carry a record left
        // not-ready by an earlier allocation failure.
        for r in plan.refs_l0.iter().chain(plan.refs_l1.iter()) {
            self.pool
                .ensure_surface_resources(self.dev, r.pic.surface, &plan.geometry)?;
        }

        if plan.rc.enabled && (!rc.initialized || rc.reset_pending) {
            self.run_brc_init(plan, params, rc, &mut report)?;
        }

        self.run_scaling(plan, params, &mut report)?;
        let hme_ran = self.run_hme(plan, params, &mut report)?;
        if hme_ran && plan.features.static_scene_detect {
            self.run_sfd(plan, &mut report)?;
        }
        self.run_mbenc(plan, params, rc, hme_ran, &mut report)?;
        if plan.features.weighted_pred && !plan.frame_type.is_intra() {
            self.run_weighted_pred(plan, &mut report)?;
        }

        debug!(stages = report.stages.len(), "kernel phase sequenced");
        Ok(report)
    }

    fn dispatch(
        &mut self,
        stage: KernelStage,
        variant: u16,
        block: &ParameterBlock,
        table: BindingTable,
        grid: (u32, u32),
        report: &mut FrameReport,
    ) -> Result<()> {
        let ctx = self.contexts.get_mut(stage, variant).ok_or_else(|| {
            EncodeError::InvalidParameter(format!(
                "no kernel context for {stage:?} variant {variant}"
            ))
        })?;
        ctx.load_parameter_block(self.dev, block)?;
        ctx.bindings = table;
        ctx.emit_dispatch(self.dev, grid.0, grid.1);
        self.dev.emit(&[ops::PIPE_FLUSH, 0]);
        report.stages.push(stage);
        Ok(())
    }

    fn session_buf(b: Option<BufferHandle>, what: &str) -> Result<Binding> {
        b.map(Binding::Buffer).ok_or_else(|| {
            EncodeError::InvalidParameter(format!("session buffer not allocated: {what}"))
        })
    }

    fn record_for(&self, id: SurfaceId) -> Result<&SurfaceResources> {
        self.pool.get(id).ok_or_else(|| {
            EncodeError::InvalidParameter(format!("surface {} has no derived resources", id.0))
        })
    }

    fn pyramid_of(&self, id: SurfaceId, octave: usize) -> Result<Binding> {
        self.record_for(id)?.pyramid[octave]
            .map(Binding::Buffer)
            .ok_or_else(|| {
                EncodeError::InvalidParameter(format!(
                    "surface {} has no pyramid level {octave}",
                    id.0
                ))
            })
    }

    fn run_brc_init(
        &mut self,
        plan: &FramePlan,
        params: &FrameParams,
        rc: &RcState,
        report: &mut FrameReport,
    ) -> Result<()> {
        let input = brc::BrcInitInput {
            history: Self::session_buf(self.bufs.brc_history, "brc history")?,
            distortion: Self::session_buf(self.bufs.brc_distortion, "brc distortion")?,
            is_reset: rc.initialized,
            mb_rate_control: plan.features.mb_rate_control,
            intra_period: params.seq.intra_period,
            ip_period: params.seq.ip_period,
        };
        let (block, table) = brc::build_init(self.gen, &plan.rc, &input);
        self.dispatch(KernelStage::BrcInit, 0, &block, table, (1, 1), report)
    }

    fn run_scaling(
        &mut self,
        plan: &FramePlan,
        params: &FrameParams,
        report: &mut FrameReport,
    ) -> Result<()> {
        for octave in 0..3 {
            let Some(oct) = plan.geometry.octaves[octave] else {
                continue;
            };
            let (src, src_w, src_h) = if octave == 0 {
                (
                    Binding::Surface(params.pic.source),
                    plan.geometry.width,
                    plan.geometry.height,
                )
            } else {
                // Octave enablement is monotonic: a coarser level always
                // has the finer one below it to read from.
                let finer = plan.geometry.octaves[octave - 1].ok_or_else(|| {
                    EncodeError::InvalidParameter(format!(
                        "octave {octave} enabled without octave {}",
                        octave - 1
                    ))
                })?;
                (
                    self.pyramid_of(params.pic.recon, octave - 1)?,
                    finer.width,
                    finer.height,
                )
            };
            let mb_stats = if scale::wants_mb_stats(plan, octave) {
                Some(Self::session_buf(self.bufs.scale_stats, "scale statistics")?)
            } else {
                None
            };
            let input = scale::ScaleInput {
                octave,
                src,
                dst: self.pyramid_of(params.pic.recon, octave)?,
                mb_stats,
                src_width: src_w,
                src_height: src_h,
            };
            let (block, table) = scale::build(self.gen, plan, &input)?;
            self.dispatch(
                KernelStage::scale_for_octave(octave),
                0,
                &block,
                table,
                (oct.mb_w, oct.mb_h),
                report,
            )?;
        }
        Ok(())
    }

    /// Motion estimation, coarsest enabled octave first so finer levels
    /// can take the coarser output as a predictor seed.
    fn run_hme(
        &mut self,
        plan: &FramePlan,
        params: &FrameParams,
        report: &mut FrameReport,
    ) -> Result<bool> {
        if !plan.features.hme || plan.frame_type.is_intra() || plan.refs_l0.is_empty() {
            return Ok(false);
        }
        for octave in (0..3).rev() {
            let Some(oct) = plan.geometry.octaves[octave] else {
                continue;
            };
            let seed_mv = if oct.seeds_from_coarser {
                Some(Self::session_buf(
                    self.bufs.hme_mv[octave + 1],
                    "coarser hme mv",
                )?)
            } else {
                None
            };
            let mut refs_l0 = Vec::with_capacity(plan.refs_l0.len());
            for r in &plan.refs_l0 {
                refs_l0.push(self.pyramid_of(r.pic.surface, octave)?);
            }
            let mut refs_l1 = Vec::with_capacity(plan.refs_l1.len());
            for r in &plan.refs_l1 {
                refs_l1.push(self.pyramid_of(r.pic.surface, octave)?);
            }
            let input = hme::HmeInput {
                octave,
                cur_pyramid: self.pyramid_of(params.pic.recon, octave)?,
                refs_l0,
                refs_l1,
                seed_mv,
                mv_out: Self::session_buf(self.bufs.hme_mv[octave], "hme mv")?,
                dist_out: Self::session_buf(self.bufs.hme_dist[octave], "hme distortion")?,
            };
            let (block, table) = hme::build(self.gen, plan, &input)?;
            self.dispatch(
                KernelStage::hme_for_octave(octave),
                0,
                &block,
                table,
                (oct.mb_w, oct.mb_h),
                report,
            )?;
        }
        Ok(true)
    }

    fn run_sfd(&mut self, plan: &FramePlan, report: &mut FrameReport) -> Result<()> {
        let input = aux_stages::SfdInput {
            hme_mv: Self::session_buf(self.bufs.hme_mv[0], "hme mv")?,
            hme_dist: Self::session_buf(self.bufs.hme_dist[0], "hme distortion")?,
            result: Self::session_buf(self.bufs.sfd_decision, "sfd decision")?,
        };
        let (block, table) = aux_stages::build_sfd(self.gen, plan, &input);
        self.dispatch(
            KernelStage::StaticSceneDetect,
            0,
            &block,
            table,
            (plan.geometry.mb_w, plan.geometry.mb_h),
            report,
        )
    }

    /// MB encode with the rate-control update pair wrapped around it.
    ///
    /// For a rate-controlled frame the real encode's parameter block is
    /// loaded first, then the frame-update kernel runs with that curbe
    /// region bound so it can rewrite the QP fields in place, and only
    /// then is the encode dispatch emitted.
    fn run_mbenc(
        &mut self,
        plan: &FramePlan,
        params: &FrameParams,
        rc: &RcState,
        hme_ran: bool,
        report: &mut FrameReport,
    ) -> Result<()> {
        let variant = mbenc::variant(self.gen, plan.preset, plan.frame_type);
        let grid = (plan.geometry.mb_w, plan.geometry.mb_h);

        let qp_l0 = match plan.refs_l0.first() {
            Some(r) => self.record_for(r.pic.surface)?.resolved_qp,
            None => plan.qp,
        };
        let qp_l1 = match plan.refs_l1.first() {
            Some(r) => self.record_for(r.pic.surface)?.resolved_qp,
            None => plan.qp,
        };

        let use_mb_rc = plan.rc.enabled && plan.features.mb_rate_control;
        let roi_active = use_mb_rc && plan.features.roi && !params.roi.is_empty();
        if roi_active {
            self.write_roi_map(plan, &params.roi)?;
        }

        let mb_record_out = Self::session_buf(self.bufs.mb_records, "mb records")?;
        let mv_out = {
            let rec = self.record_for(params.pic.recon)?;
            rec.mv_forward.map(Binding::Buffer).ok_or_else(|| {
                EncodeError::InvalidParameter("recon surface has no mv buffer".to_string())
            })?
        };
        let hme_mv = if hme_ran {
            Some(Self::session_buf(self.bufs.hme_mv[0], "hme mv")?)
        } else {
            None
        };
        let hme_dist = if hme_ran {
            Some(Self::session_buf(self.bufs.hme_dist[0], "hme distortion")?)
        } else {
            None
        };
        let mb_brc_qp = if use_mb_rc {
            Some(Self::session_buf(self.bufs.mb_qp_map, "mb qp map")?)
        } else {
            None
        };
        let roi = if roi_active {
            Some(Self::session_buf(self.bufs.roi_map, "roi map")?)
        } else {
            None
        };
        let qp_override = if plan.features.mb_qp_override {
            params.mb_qp_override.map(Binding::Buffer)
        } else {
            None
        };

        let input = mbenc::MbEncInput {
            mb_record_out,
            mv_out,
            cur_pic: Binding::Surface(params.pic.source),
            hme_mv,
            hme_dist,
            refs_l0: plan
                .refs_l0
                .iter()
                .map(|r| Binding::Surface(r.pic.surface))
                .collect(),
            refs_l1: plan
                .refs_l1
                .iter()
                .map(|r| Binding::Surface(r.pic.surface))
                .collect(),
            mb_brc_qp,
            roi,
            qp_override,
            distortion_out: None,
            intra_dist_only: false,
        };
        let (mut block, table) = mbenc::build(self.gen, plan, &input);
        mbenc::set_reference_qps(&mut block, qp_l0, qp_l1);

        if !plan.rc.enabled {
            return self.dispatch(KernelStage::MbEnc, variant, &block, table, grid, report);
        }

        // Intra frames have no motion history to seed the frame update
        // with; run the distortion-estimation variant first.
        let mut fu_distortion = None;
        if plan.frame_type.is_intra() {
            let seed_input = mbenc::MbEncInput {
                mb_record_out: Self::session_buf(self.bufs.mb_records, "mb records")?,
                mv_out,
                cur_pic: Binding::Surface(params.pic.source),
                hme_mv: None,
                hme_dist: None,
                refs_l0: Vec::new(),
                refs_l1: Vec::new(),
                mb_brc_qp: None,
                roi: None,
                qp_override: None,
                distortion_out: Some(Self::session_buf(
                    self.bufs.brc_distortion,
                    "brc distortion",
                )?),
                intra_dist_only: true,
            };
            let (seed_block, seed_table) = mbenc::build(self.gen, plan, &seed_input);
            self.dispatch(
                KernelStage::MbEnc,
                mbenc::intra_dist_variant(self.gen),
                &seed_block,
                seed_table,
                grid,
                report,
            )?;
            fu_distortion = Some(Self::session_buf(self.bufs.brc_distortion, "brc distortion")?);
        }

        // Load the real encode's curbe now; the frame update rewrites it
        // in place before the dispatch below.
        let curbe = {
            let ctx = self.contexts.get_mut(KernelStage::MbEnc, variant).ok_or_else(|| {
                EncodeError::InvalidParameter(format!("no mb-encode context for variant {variant}"))
            })?;
            ctx.load_parameter_block(self.dev, &block)?;
            ctx.bindings = table;
            ctx.curbe
        };

        let fu_input = brc::BrcFrameInput {
            history: Self::session_buf(self.bufs.brc_history, "brc history")?,
            pak_stats: Self::session_buf(self.bufs.pak_stats, "pak statistics")?,
            mbenc_curbe: Binding::Buffer(curbe),
            distortion: fu_distortion,
        };
        let (fu_block, fu_table) = brc::build_frame_update(self.gen, plan, rc, &fu_input);
        self.dispatch(KernelStage::BrcFrameUpdate, 0, &fu_block, fu_table, (1, 1), report)?;

        if use_mb_rc {
            let mb_input = brc::BrcMbInput {
                history: Self::session_buf(self.bufs.brc_history, "brc history")?,
                mb_qp_out: Self::session_buf(self.bufs.mb_qp_map, "mb qp map")?,
                roi: if roi_active {
                    Some(Self::session_buf(self.bufs.roi_map, "roi map")?)
                } else {
                    None
                },
            };
            let (mb_block, mb_table) = brc::build_mb_update(self.gen, plan, &mb_input);
            self.dispatch(KernelStage::BrcMbUpdate, 0, &mb_block, mb_table, grid, report)?;
        }

        let ctx = self.contexts.get_mut(KernelStage::MbEnc, variant).ok_or_else(|| {
            EncodeError::InvalidParameter(format!("no mb-encode context for variant {variant}"))
        })?;
        ctx.emit_dispatch(self.dev, grid.0, grid.1);
        self.dev.emit(&[ops::PIPE_FLUSH, 0]);
        report.stages.push(KernelStage::MbEnc);
        Ok(())
    }

    /// One weighted-prediction dispatch per list-0 reference, producing
    /// a pre-weighted view the encode kernel samples instead of the raw
    /// reconstruction.
    fn run_weighted_pred(&mut self, plan: &FramePlan, report: &mut FrameReport) -> Result<()> {
        for (idx, r) in plan.refs_l0.iter().enumerate() {
            let weighted =
                self.pool
                    .ensure_weighted_output(self.dev, r.pic.surface, &plan.geometry)?;
            let input = aux_stages::WpInput {
                reference: Binding::Surface(r.pic.surface),
                weighted_out: Binding::Buffer(weighted),
                weight: 1 << WP_LOG2_DENOM,
                offset: 0,
                log2_denom: WP_LOG2_DENOM,
                list: 0,
                ref_idx: idx as u8,
            };
            let (block, table) = aux_stages::build_wp(self.gen, plan, &input);
            self.dispatch(
                KernelStage::WeightedPred,
                0,
                &block,
                table,
                (plan.geometry.mb_w, plan.geometry.mb_h),
                report,
            )?;
        }
        Ok(())
    }

    /// Rasterize region-of-interest deltas into the per-MB byte map.
    /// Later rectangles win where regions overlap.
    fn write_roi_map(&mut self, plan: &FramePlan, rois: &[RoiRect]) -> Result<()> {
        let handle = self.bufs.roi_map.ok_or_else(|| {
            EncodeError::InvalidParameter("session buffer not allocated: roi map".to_string())
        })?;
        let mb_w = plan.geometry.mb_w;
        let mb_h = plan.geometry.mb_h;
        let mut guard = MapGuard::new(self.dev, handle, "roi map")?;
        guard.fill(0);
        for r in rois {
            let right = r.mb_right.min(mb_w);
            let bottom = r.mb_bottom.min(mb_h);
            for y in r.mb_top..bottom {
                for x in r.mb_left..right {
                    let at = (y * mb_w + x) as usize;
                    if at < guard.len() {
                        guard[at] = r.qp_delta as u8;
                    }
                }
            }
        }
        Ok(())
    }
}
