//! Per-surface derived resources and session-persistent buffers.
//!
//! Each reconstructed/reference surface carries a side record of derived
//! resources: its downscaled pyramid, a motion-vector buffer pair, a
//! resolved QP, and a frame-store slot. Records are created lazily on
//! first use and freed unconditionally when the surface is retired. A
//! record is never shared between live surfaces.
//!
//! Session-persistent buffers (rate-control history and statistics,
//! per-MB QP, scaling statistics) are allocated once on the first frame
//! that needs them and reallocated only when the frame dimensions change.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::derive::FrameGeometry;
use crate::error::{EncodeError, Result};
use crate::hw::{Allocator, BufferHandle, BufferKind, SurfaceId};
use crate::params::{MAX_FRAME_STORES, MAX_PAK_PASSES};

/// Rate-control history buffer size in bytes. Fixed by the kernel ABI,
/// independent of frame dimensions.
pub const BRC_HISTORY_SIZE: usize = 960;

/// Per-pass PAK statistics: byte count + completion marker dword pairs,
/// plus headroom for frame-level counters.
pub const PAK_STATS_SIZE: usize = (MAX_PAK_PASSES as usize * 2 + 8) * 4;

fn align_up(v: u32, to: u32) -> u32 {
    (v + to - 1) & !(to - 1)
}

/// Derived resources attached to one surface.
#[derive(Debug, Default)]
pub struct SurfaceResources {
    /// All allocations present and usable. Left false when a partial
    /// allocation failed; the next ensure call resumes from what exists.
    pub ready: bool,
    /// Downscaled pyramid surface per octave (index 0 = 4x).
    pub pyramid: [Option<BufferHandle>; 3],
    pub mv_forward: Option<BufferHandle>,
    pub mv_backward: Option<BufferHandle>,
    /// Weighted-prediction output, created only when the stage runs
    /// against this surface.
    pub weighted: Option<BufferHandle>,
    /// QP the surface was reconstructed with.
    pub resolved_qp: u8,
    pub frame_store_slot: u8,
    pub is_reference: bool,
}

impl SurfaceResources {
    fn handles(&self) -> impl Iterator<Item = BufferHandle> + '_ {
        self.pyramid
            .iter()
            .flatten()
            .copied()
            .chain(self.mv_forward)
            .chain(self.mv_backward)
            .chain(self.weighted)
    }
}

/// Explicit mapping from surface handle to derived-resource record.
#[derive(Debug, Default)]
pub struct SurfacePool {
    records: BTreeMap<SurfaceId, SurfaceResources>,
}

impl SurfacePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: SurfaceId) -> Option<&SurfaceResources> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: SurfaceId) -> Option<&mut SurfaceResources> {
        self.records.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn next_free_slot(&self) -> Option<u8> {
        (0..MAX_FRAME_STORES as u8)
            .find(|slot| !self.records.values().any(|r| r.frame_store_slot == *slot))
    }

    /// Idempotent: allocates whatever is missing from the surface's
    /// derived record, sized for `geo`. A failed allocation leaves the
    /// record present but not ready; completed pieces are kept and the
    /// next call resumes from them.
    pub fn ensure_surface_resources<A: Allocator + ?Sized>(
        &mut self,
        alloc: &mut A,
        id: SurfaceId,
        geo: &FrameGeometry,
    ) -> Result<&SurfaceResources> {
        if !self.records.contains_key(&id) {
            let slot = self.next_free_slot().ok_or_else(|| {
                EncodeError::AllocationFailure(format!(
                    "frame-store slots exhausted ({MAX_FRAME_STORES} live surfaces)"
                ))
            })?;
            let record = SurfaceResources {
                frame_store_slot: slot,
                ..Default::default()
            };
            debug!(surface = id.0, slot, "creating derived-resource record");
            self.records.insert(id, record);
        }

        // Allocate missing pieces; bail on the first failure with the
        // record left in the not-ready state.
        let record = self.records.get_mut(&id).ok_or_else(|| {
            EncodeError::InvalidParameter(format!("no record for surface {}", id.0))
        })?;
        match Self::fill_record(alloc, record, geo) {
            Ok(()) => {
                record.ready = true;
                Ok(&*record)
            }
            Err(e) => {
                record.ready = false;
                Err(e)
            }
        }
    }

    fn fill_record<A: Allocator + ?Sized>(
        alloc: &mut A,
        record: &mut SurfaceResources,
        geo: &FrameGeometry,
    ) -> Result<()> {
        for (i, oct) in geo.octaves.iter().enumerate() {
            let Some(oct) = oct else { continue };
            if record.pyramid[i].is_none() {
                let pitch = align_up(oct.width, 64);
                let size = (pitch * oct.height * 3 / 2) as usize;
                record.pyramid[i] =
                    Some(alloc.alloc(BufferKind::Surface2d, size, 4096, "pyramid level")?);
            }
        }

        let mv_size = (geo.mb_count() as usize) * 32;
        if record.mv_forward.is_none() {
            record.mv_forward =
                Some(alloc.alloc(BufferKind::MotionVector, mv_size, 64, "mv forward")?);
        }
        if record.mv_backward.is_none() {
            record.mv_backward =
                Some(alloc.alloc(BufferKind::MotionVector, mv_size, 64, "mv backward")?);
        }
        Ok(())
    }

    /// Create the weighted-prediction output for a surface if absent.
    pub fn ensure_weighted_output<A: Allocator + ?Sized>(
        &mut self,
        alloc: &mut A,
        id: SurfaceId,
        geo: &FrameGeometry,
    ) -> Result<BufferHandle> {
        let record = self.records.get_mut(&id).ok_or_else(|| {
            EncodeError::InvalidParameter(format!(
                "weighted output requested for unknown surface {}",
                id.0
            ))
        })?;
        if let Some(h) = record.weighted {
            return Ok(h);
        }
        let pitch = align_up(geo.width, 64);
        let size = (pitch * geo.height * 3 / 2) as usize;
        let h = alloc.alloc(BufferKind::Surface2d, size, 4096, "weighted pred output")?;
        record.weighted = Some(h);
        Ok(h)
    }

    /// Free a retired surface's derived resources unconditionally.
    pub fn release_surface_resources<A: Allocator + ?Sized>(
        &mut self,
        alloc: &mut A,
        id: SurfaceId,
    ) {
        if let Some(record) = self.records.remove(&id) {
            debug!(
                surface = id.0,
                slot = record.frame_store_slot,
                "releasing derived-resource record"
            );
            for h in record.handles() {
                alloc.free(h);
            }
        }
    }

    /// Release everything (session teardown).
    pub fn release_all<A: Allocator + ?Sized>(&mut self, alloc: &mut A) {
        let ids: Vec<SurfaceId> = self.records.keys().copied().collect();
        for id in ids {
            self.release_surface_resources(alloc, id);
        }
    }
}

/// Session-persistent buffers, allocated once and reused across frames.
#[derive(Debug, Default)]
pub struct SessionBuffers {
    pub brc_history: Option<BufferHandle>,
    /// Per-MB distortion accumulation read by the BRC kernels.
    pub brc_distortion: Option<BufferHandle>,
    /// Per-pass PAK byte counts and completion markers.
    pub pak_stats: Option<BufferHandle>,
    /// Per-MB QP map written by the MB-update kernel.
    pub mb_qp_map: Option<BufferHandle>,
    /// MB-encode output records consumed by PAK within the same frame.
    pub mb_records: Option<BufferHandle>,
    /// Rasterized region-of-interest QP deltas, one byte per MB.
    pub roi_map: Option<BufferHandle>,
    /// Per-MB flatness/variance output of the scaling kernels.
    pub scale_stats: Option<BufferHandle>,
    /// Hierarchical motion-estimation MV output per octave (0 = 4x).
    pub hme_mv: [Option<BufferHandle>; 3],
    /// Hierarchical motion-estimation distortion output per octave.
    pub hme_dist: [Option<BufferHandle>; 3],
    /// Static-scene decision word written by the detection kernel.
    pub sfd_decision: Option<BufferHandle>,
    sized_for: Option<(u32, u32)>,
}

impl SessionBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocated(&self) -> bool {
        self.sized_for.is_some()
    }

    /// Allocate on first use; free and reallocate when the frame
    /// dimensions no longer match; otherwise a no-op.
    pub fn ensure<A: Allocator + ?Sized>(
        &mut self,
        alloc: &mut A,
        geo: &FrameGeometry,
    ) -> Result<()> {
        let dims = (geo.width, geo.height);
        match self.sized_for {
            Some(existing) if existing == dims => return Ok(()),
            Some(existing) => {
                info!(
                    from = ?existing,
                    to = ?dims,
                    "frame dimensions changed, reallocating session buffers"
                );
                self.release(alloc);
            }
            None => {}
        }

        // Allocate only what is missing so a retry after a partial
        // failure resumes instead of leaking the completed pieces.
        let mb_count = geo.mb_count() as usize;
        if self.brc_history.is_none() {
            self.brc_history = Some(alloc.alloc(
                BufferKind::Statistics,
                BRC_HISTORY_SIZE,
                64,
                "brc history",
            )?);
        }
        if self.brc_distortion.is_none() {
            self.brc_distortion = Some(alloc.alloc(
                BufferKind::Statistics,
                mb_count * 16,
                64,
                "brc distortion",
            )?);
        }
        if self.pak_stats.is_none() {
            self.pak_stats = Some(alloc.alloc(
                BufferKind::Statistics,
                PAK_STATS_SIZE,
                64,
                "pak statistics",
            )?);
        }
        if self.mb_qp_map.is_none() {
            self.mb_qp_map = Some(alloc.alloc(BufferKind::Linear, mb_count, 64, "mb qp map")?);
        }
        if self.mb_records.is_none() {
            self.mb_records =
                Some(alloc.alloc(BufferKind::Linear, mb_count * 64, 64, "mb records")?);
        }
        if self.roi_map.is_none() {
            self.roi_map = Some(alloc.alloc(BufferKind::Linear, mb_count, 64, "roi map")?);
        }
        if self.scale_stats.is_none() {
            self.scale_stats = Some(alloc.alloc(
                BufferKind::Statistics,
                mb_count * 4,
                64,
                "scale statistics",
            )?);
        }
        if self.sfd_decision.is_none() {
            self.sfd_decision =
                Some(alloc.alloc(BufferKind::Statistics, 64, 64, "sfd decision")?);
        }
        for (i, oct) in geo.octaves.iter().enumerate() {
            let Some(oct) = oct else { continue };
            let oct_mbs = (oct.mb_w * oct.mb_h) as usize;
            if self.hme_mv[i].is_none() {
                self.hme_mv[i] =
                    Some(alloc.alloc(BufferKind::MotionVector, oct_mbs * 32, 64, "hme mv")?);
            }
            if self.hme_dist[i].is_none() {
                self.hme_dist[i] =
                    Some(alloc.alloc(BufferKind::Statistics, oct_mbs * 8, 64, "hme distortion")?);
            }
        }
        self.sized_for = Some(dims);
        Ok(())
    }

    pub fn release<A: Allocator + ?Sized>(&mut self, alloc: &mut A) {
        let mut handles = vec![
            self.brc_history.take(),
            self.brc_distortion.take(),
            self.pak_stats.take(),
            self.mb_qp_map.take(),
            self.mb_records.take(),
            self.roi_map.take(),
            self.scale_stats.take(),
            self.sfd_decision.take(),
        ];
        for i in 0..3 {
            handles.push(self.hme_mv[i].take());
            handles.push(self.hme_dist[i].take());
        }
        for h in handles.into_iter().flatten() {
            alloc.free(h);
        }
        self.sized_for = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::derive_geometry;
    use crate::hw::stub::StubDevice;

    fn geo_1080p() -> FrameGeometry {
        derive_geometry(1920, 1088, 3)
    }

    #[test]
    fn ensure_surface_resources_is_idempotent() {
        let mut dev = StubDevice::new();
        let mut pool = SurfacePool::new();
        let geo = geo_1080p();

        pool.ensure_surface_resources(&mut dev, SurfaceId(7), &geo)
            .expect("first ensure");
        let allocs_after_first = dev.total_allocs();
        let slot = pool.get(SurfaceId(7)).unwrap().frame_store_slot;

        pool.ensure_surface_resources(&mut dev, SurfaceId(7), &geo)
            .expect("second ensure");
        assert_eq!(dev.total_allocs(), allocs_after_first);
        assert_eq!(pool.get(SurfaceId(7)).unwrap().frame_store_slot, slot);
        assert!(pool.get(SurfaceId(7)).unwrap().ready);
    }

    #[test]
    fn partial_failure_leaves_record_not_ready_and_resumes() {
        let mut dev = StubDevice::new();
        let mut pool = SurfacePool::new();
        let geo = geo_1080p();

        // 3 pyramid levels + 2 MV buffers; fail on the fourth allocation.
        dev.fail_alloc_after(3);
        let err = pool
            .ensure_surface_resources(&mut dev, SurfaceId(1), &geo)
            .unwrap_err();
        assert!(matches!(err, EncodeError::AllocationFailure(_)));
        let record = pool.get(SurfaceId(1)).unwrap();
        assert!(!record.ready);
        assert_eq!(record.pyramid.iter().flatten().count(), 3);
        assert!(record.mv_forward.is_none());

        // Next attempt completes from where it stopped.
        dev.clear_alloc_failure();
        let allocs_before = dev.total_allocs();
        pool.ensure_surface_resources(&mut dev, SurfaceId(1), &geo)
            .expect("retry succeeds");
        assert!(pool.get(SurfaceId(1)).unwrap().ready);
        assert_eq!(dev.total_allocs(), allocs_before + 2); // only the MV pair
    }

    #[test]
    fn release_frees_everything_and_recycles_slot() {
        let mut dev = StubDevice::new();
        let mut pool = SurfacePool::new();
        let geo = geo_1080p();

        pool.ensure_surface_resources(&mut dev, SurfaceId(1), &geo)
            .unwrap();
        pool.ensure_surface_resources(&mut dev, SurfaceId(2), &geo)
            .unwrap();
        assert_eq!(pool.get(SurfaceId(1)).unwrap().frame_store_slot, 0);
        assert_eq!(pool.get(SurfaceId(2)).unwrap().frame_store_slot, 1);

        pool.release_surface_resources(&mut dev, SurfaceId(1));
        assert!(pool.get(SurfaceId(1)).is_none());

        // The freed slot is reused for the next surface.
        pool.ensure_surface_resources(&mut dev, SurfaceId(3), &geo)
            .unwrap();
        assert_eq!(pool.get(SurfaceId(3)).unwrap().frame_store_slot, 0);

        pool.release_all(&mut dev);
        assert_eq!(dev.live_buffers(), 0);
    }

    #[test]
    fn frame_store_exhaustion_is_an_allocation_failure() {
        let mut dev = StubDevice::new();
        let mut pool = SurfacePool::new();
        let geo = derive_geometry(64, 64, 1);

        for i in 0..MAX_FRAME_STORES as u32 {
            pool.ensure_surface_resources(&mut dev, SurfaceId(i), &geo)
                .unwrap();
        }
        let err = pool
            .ensure_surface_resources(&mut dev, SurfaceId(999), &geo)
            .unwrap_err();
        assert!(matches!(err, EncodeError::AllocationFailure(_)));
    }

    #[test]
    fn session_buffers_allocate_once_and_track_dimension_changes() {
        let mut dev = StubDevice::new();
        let mut bufs = SessionBuffers::new();
        let geo = geo_1080p();

        bufs.ensure(&mut dev, &geo).unwrap();
        assert!(bufs.allocated());
        let allocs = dev.total_allocs();

        // Same dimensions: no-op.
        bufs.ensure(&mut dev, &geo).unwrap();
        assert_eq!(dev.total_allocs(), allocs);

        // New dimensions: freed and reallocated.
        let geo2 = derive_geometry(1280, 720, 3);
        bufs.ensure(&mut dev, &geo2).unwrap();
        assert!(dev.total_allocs() > allocs);
        assert!(dev.total_frees() >= 5);

        bufs.release(&mut dev);
        assert!(!bufs.allocated());
        assert_eq!(dev.live_buffers(), 0);
    }
}
