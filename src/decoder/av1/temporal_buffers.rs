// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-reference auxiliary buffers and their recycling.
//!
//! Every frame in the DPB owns a [`TemporalBundle`]: the collocated motion vectors it wrote, its
//! segment id map and its backward-adapted CDF tables. Later frames read some of these buffers
//! instead of their own (the segment id map of the primary reference frame when the map is not
//! updated, the adapted CDF tables of the primary reference frame as initial CDF state), so the
//! shareable ones are [`SharedResource`]s and the links to them are counted.
//!
//! Bundles live in an arena owned by [`TemporalBufferPool`] and are identified by [`BundleId`].
//! Links between bundles are [`SharedBufferId`]s, which name a buffer by its owner rather than
//! pointing at it. A bundle is only handed to a new frame once no other bundle links to its
//! buffers anymore.

use std::collections::BTreeMap;

use crate::backend::BufferAllocator;
use crate::backend::BufferKind;
use crate::backend::BufferSizeParams;
use crate::backend::BufferSizer;
use crate::backend::CacheHint;
use crate::backend::GpuBuffer;
use crate::backend::MemoryHint;
use crate::codec::av1::picture_params::PicParams;
use crate::decoder::av1::shared_buffer::SharedResource;
use crate::decoder::av1::DpbError;
use crate::decoder::av1::DpbResult;
use crate::utils::align_up;
use crate::utils::PAGE_SIZE;

/// Number of default CDF tables, one per coefficient quantizer context.
pub const DEFAULT_CDF_TABLE_NUM: usize = 4;
/// Size of a full set of CDF tables, before page alignment.
pub const CDF_MAX_NUM_BYTES: usize = 15104;
/// Number of released bundles kept around for reuse before they get destroyed.
pub const MAX_IDLE_BUNDLES: usize = 8;

/// Returns the default CDF table to use for a frame with quantizer index `base_q_idx`.
pub fn coeff_cdf_q_ctx(base_q_idx: u8) -> usize {
    match base_q_idx {
        0..=20 => 0,
        21..=60 => 1,
        61..=120 => 2,
        _ => 3,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// The platform guarantees that frames complete in submission order. Bundles are then
    /// considered reusable as soon as they are released, whatever their reference counts.
    pub out_of_order_completion: bool,
    /// Fail with [`DpbError::RefCountUnderflow`] instead of clamping when a shared buffer is
    /// released more often than it was referenced.
    pub strict_ref_counting: bool,
    pub cdf_max_num_bytes: usize,
    pub max_idle_bundles: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            out_of_order_completion: false,
            strict_ref_counting: cfg!(debug_assertions) && !cfg!(fuzzing),
            cdf_max_num_bytes: CDF_MAX_NUM_BYTES,
            max_idle_bundles: MAX_IDLE_BUNDLES,
        }
    }
}

/// Counters of the anomalies the pool recovered from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolDiagnostics {
    /// Releases of a shared buffer that had no reference left.
    pub ref_count_underflows: u32,
    /// Shared buffers destroyed while still referenced.
    pub forced_releases: u32,
    /// Links to buffers of bundles that no longer exist.
    pub dangling_links: u32,
}

/// Index of a bundle in the pool's arena. Ids are only reused after
/// [`TemporalBufferPool::destroy_all`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BundleId(usize);

/// Names a shareable buffer by its owner.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SharedBufferId {
    SegmentWrite(BundleId),
    BackwardAdaptedCdf(BundleId),
    /// One of the pool's default CDF tables, by quantizer context.
    DefaultCdf(usize),
}

impl SharedBufferId {
    /// Bundle owning the buffer, `None` for default tables.
    pub fn owner(&self) -> Option<BundleId> {
        match self {
            SharedBufferId::SegmentWrite(id) | SharedBufferId::BackwardAdaptedCdf(id) => Some(*id),
            SharedBufferId::DefaultCdf(_) => None,
        }
    }
}

/// Where the initial CDF tables of a frame come from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CdfProvenance {
    /// No primary reference frame: default tables for the given quantizer context.
    DefaultTable(usize),
    /// The tables adapted at the end of the primary reference frame.
    AdaptedFrom(BundleId),
    /// The primary reference frame did not adapt its tables, so its own initial tables are used.
    /// `buffer` is where those came from.
    InheritedFrom {
        primary: BundleId,
        buffer: SharedBufferId,
    },
}

impl CdfProvenance {
    /// The buffer actually holding the tables.
    pub fn buffer(&self) -> SharedBufferId {
        match self {
            CdfProvenance::DefaultTable(ctx) => SharedBufferId::DefaultCdf(*ctx),
            CdfProvenance::AdaptedFrom(id) => SharedBufferId::BackwardAdaptedCdf(*id),
            CdfProvenance::InheritedFrom { buffer, .. } => *buffer,
        }
    }
}

/// What the pool needs to know about the frame a bundle is set up for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameBufferParams {
    pub size: BufferSizeParams,
    /// DPB frame index of the primary reference frame.
    pub primary_frame_idx: Option<u8>,
    pub segmentation_enabled: bool,
    pub segmentation_update_map: bool,
    /// The segment id map of the primary reference frame matches the frame's geometry.
    pub segmentation_compatible: bool,
    pub disable_frame_end_update_cdf: bool,
    /// Default CDF table used when there is no primary reference frame.
    pub cdf_q_ctx: usize,
}

impl FrameBufferParams {
    pub fn new(
        pic: &PicParams,
        primary_frame_idx: Option<u8>,
        segmentation_compatible: bool,
    ) -> Self {
        let (width_in_sb, height_in_sb) = pic.size_in_superblocks();

        Self {
            size: BufferSizeParams {
                width_in_sb,
                height_in_sb,
                use_128x128_superblock: pic.use_128x128_superblock,
                bit_depth_idc: pic.bit_depth_idx,
            },
            primary_frame_idx,
            segmentation_enabled: pic.segmentation.enabled,
            segmentation_update_map: pic.segmentation.update_map,
            segmentation_compatible,
            disable_frame_end_update_cdf: pic.disable_frame_end_update_cdf,
            cdf_q_ctx: coeff_cdf_q_ctx(pic.base_q_idx),
        }
    }
}

/// Auxiliary buffers of one reference frame.
#[derive(Debug)]
pub struct TemporalBundle {
    mv_buf: GpuBuffer,
    mv_buf_size: usize,
    segment_write_buf: SharedResource,
    segment_write_buf_size: usize,
    backward_adapted_cdf_buf: SharedResource,
    /// Segment id map read by the frame: its own write buffer or an ancestor's.
    segment_id_buf: Option<SharedBufferId>,
    init_cdf_buf: Option<CdfProvenance>,
    disable_frame_end_update: bool,
}

impl TemporalBundle {
    pub fn mv_buf(&self) -> GpuBuffer {
        self.mv_buf
    }

    pub fn mv_buf_size(&self) -> usize {
        self.mv_buf_size
    }

    pub fn segment_write_buf(&self) -> &SharedResource {
        &self.segment_write_buf
    }

    pub fn segment_write_buf_size(&self) -> usize {
        self.segment_write_buf_size
    }

    pub fn backward_adapted_cdf_buf(&self) -> &SharedResource {
        &self.backward_adapted_cdf_buf
    }

    pub fn segment_id_buf(&self) -> Option<SharedBufferId> {
        self.segment_id_buf
    }

    pub fn init_cdf_buf(&self) -> Option<CdfProvenance> {
        self.init_cdf_buf
    }

    pub fn disable_frame_end_update(&self) -> bool {
        self.disable_frame_end_update
    }

    /// Links this bundle currently holds a reference through.
    fn held_links(&self) -> impl Iterator<Item = SharedBufferId> {
        self.segment_id_buf
            .into_iter()
            .chain(self.init_cdf_buf.map(|p| p.buffer()))
    }

    fn owned_resource_mut(&mut self, link: SharedBufferId) -> Option<&mut SharedResource> {
        match link {
            SharedBufferId::SegmentWrite(_) => Some(&mut self.segment_write_buf),
            SharedBufferId::BackwardAdaptedCdf(_) => Some(&mut self.backward_adapted_cdf_buf),
            SharedBufferId::DefaultCdf(_) => None,
        }
    }
}

/// Owns the bundles of a decode context and decides when they can be recycled.
pub struct TemporalBufferPool<A: BufferAllocator, S: BufferSizer> {
    allocator: A,
    sizer: S,
    config: PoolConfig,
    bundles: Vec<Option<TemporalBundle>>,
    /// Bundles attached to a DPB frame index.
    active: BTreeMap<u8, BundleId>,
    /// Released bundles, in release order.
    available: Vec<BundleId>,
    current: Option<BundleId>,
    default_cdf_tables: Vec<SharedResource>,
    diagnostics: PoolDiagnostics,
}

impl<A: BufferAllocator, S: BufferSizer> TemporalBufferPool<A, S> {
    pub fn new(allocator: A, sizer: S, config: PoolConfig) -> Self {
        Self {
            allocator,
            sizer,
            config,
            bundles: Vec::new(),
            active: BTreeMap::new(),
            available: Vec::new(),
            current: None,
            default_cdf_tables: Vec::new(),
            diagnostics: Default::default(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    pub fn diagnostics(&self) -> PoolDiagnostics {
        self.diagnostics
    }

    pub fn bundle(&self, id: BundleId) -> Option<&TemporalBundle> {
        self.bundles.get(id.0).and_then(Option::as_ref)
    }

    fn bundle_mut(&mut self, id: BundleId) -> Option<&mut TemporalBundle> {
        self.bundles.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Bundle of the frame currently being decoded.
    pub fn current(&self) -> Option<BundleId> {
        self.current
    }

    pub fn current_bundle(&self) -> Option<&TemporalBundle> {
        self.current.and_then(|id| self.bundle(id))
    }

    pub fn get_buffer_by_frame_index(&self, frame_idx: u8) -> Option<BundleId> {
        self.active.get(&frame_idx).copied()
    }

    /// Frame indices with an attached bundle, in increasing order.
    pub fn active_frames(&self) -> impl Iterator<Item = (u8, BundleId)> + '_ {
        self.active.iter().map(|(idx, id)| (*idx, *id))
    }

    pub fn num_available(&self) -> usize {
        self.available.len()
    }

    /// Number of bundles that have not been destroyed.
    pub fn num_bundles(&self) -> usize {
        self.bundles.iter().flatten().count()
    }

    /// Allocates the default CDF tables if needed.
    pub fn init_default_cdf_tables(&mut self) -> DpbResult<()> {
        if !self.default_cdf_tables.is_empty() {
            return Ok(());
        }

        let size = align_up(self.config.cdf_max_num_bytes, PAGE_SIZE);
        let mut tables = Vec::with_capacity(DEFAULT_CDF_TABLE_NUM);
        for _ in 0..DEFAULT_CDF_TABLE_NUM {
            match self.allocator.allocate_buffer(
                size,
                "DefaultCdfTableBuffer",
                CacheHint::InternalRead,
                MemoryHint::LockableVideoMem,
            ) {
                Ok(buffer) => tables.push(SharedResource::new(buffer)),
                Err(e) => {
                    for table in tables {
                        self.allocator.destroy(table.buffer());
                    }
                    return Err(DpbError::Allocation(e));
                }
            }
        }

        log::debug!("allocated {} default CDF tables of {} bytes", tables.len(), size);
        self.default_cdf_tables = tables;

        Ok(())
    }

    pub fn default_cdf_table(&self, ctx: usize) -> Option<&SharedResource> {
        self.default_cdf_tables.get(ctx)
    }

    fn required_sizes(&self, frame: &FrameBufferParams) -> DpbResult<(usize, usize)> {
        let mv_size = self
            .sizer
            .required_buffer_size(BufferKind::MvTemporal, &frame.size)
            .map_err(DpbError::Sizing)?;
        let segment_size = self
            .sizer
            .required_buffer_size(BufferKind::SegmentId, &frame.size)
            .map_err(DpbError::Sizing)?;

        Ok((mv_size, segment_size))
    }

    /// Allocates the buffers of a new bundle, releasing them all if one allocation fails.
    fn allocate_buffers(
        &mut self,
        requests: &[(usize, &'static str)],
    ) -> DpbResult<Vec<GpuBuffer>> {
        let mut buffers = Vec::with_capacity(requests.len());
        for &(size, name) in requests {
            match self.allocator.allocate_buffer(
                size,
                name,
                CacheHint::InternalReadWrite,
                MemoryHint::NotLockableVideoMem,
            ) {
                Ok(buffer) => buffers.push(buffer),
                Err(e) => {
                    for buffer in buffers {
                        self.allocator.destroy(buffer);
                    }
                    return Err(DpbError::Allocation(e));
                }
            }
        }

        Ok(buffers)
    }

    /// Creates a new bundle sized for `frame`. The bundle holds no link yet.
    pub fn allocate(&mut self, frame: &FrameBufferParams) -> DpbResult<BundleId> {
        let (mv_size, segment_size) = self.required_sizes(frame)?;
        let cdf_size = align_up(self.config.cdf_max_num_bytes, PAGE_SIZE);

        let buffers = self.allocate_buffers(&[
            (mv_size, "MvTemporalBuffer"),
            (segment_size, "SegmentIdWriteBuffer"),
            (cdf_size, "CdfTableBuffer"),
        ])?;

        let id = BundleId(self.bundles.len());
        self.bundles.push(Some(TemporalBundle {
            mv_buf: buffers[0],
            mv_buf_size: mv_size,
            segment_write_buf: SharedResource::new(buffers[1]),
            segment_write_buf_size: segment_size,
            backward_adapted_cdf_buf: SharedResource::new(buffers[2]),
            segment_id_buf: None,
            init_cdf_buf: None,
            disable_frame_end_update: frame.disable_frame_end_update_cdf,
        }));
        log::debug!(
            "allocated {:?}: mv {} bytes, segment ids {} bytes, cdf {} bytes",
            id,
            mv_size,
            segment_size,
            cdf_size
        );

        Ok(id)
    }

    /// Prepares `bundle` for `frame`, allocating a new one if `None`.
    ///
    /// Existing buffers are grown in place when the frame needs more space, so their handles and
    /// the links other bundles hold to them stay valid. The segment id and initial CDF links are
    /// always derived again from the frame's primary reference.
    pub fn resize(
        &mut self,
        bundle: Option<BundleId>,
        frame: &FrameBufferParams,
    ) -> DpbResult<BundleId> {
        self.init_default_cdf_tables()?;

        let id = match bundle {
            None => self.allocate(frame)?,
            Some(id) => {
                self.grow(id, frame)?;
                // Links held for a previous frame are stale now.
                self.deactive(id)?;
                id
            }
        };

        if let Some(bundle) = self.bundle_mut(id) {
            bundle.disable_frame_end_update = frame.disable_frame_end_update_cdf;
        }
        self.record_seg_id_buf_info(id, frame)?;
        self.record_cdf_table_buf_info(id, frame)?;

        Ok(id)
    }

    fn grow(&mut self, id: BundleId, frame: &FrameBufferParams) -> DpbResult<()> {
        let (mv_size, segment_size) = self.required_sizes(frame)?;
        let bundle = self.bundle(id).ok_or(DpbError::MissingBundle(id))?;
        let (mv_buf, cur_mv_size) = (bundle.mv_buf, bundle.mv_buf_size);
        let (segment_buf, cur_segment_size) = (
            bundle.segment_write_buf.buffer(),
            bundle.segment_write_buf_size,
        );

        if mv_size > cur_mv_size {
            self.allocator
                .resize(mv_buf, mv_size, MemoryHint::NotLockableVideoMem, false)
                .map_err(DpbError::Resize)?;
        }
        if segment_size > cur_segment_size {
            self.allocator
                .resize(segment_buf, segment_size, MemoryHint::NotLockableVideoMem, false)
                .map_err(DpbError::Resize)?;
        }

        if let Some(bundle) = self.bundle_mut(id) {
            bundle.mv_buf_size = bundle.mv_buf_size.max(mv_size);
            bundle.segment_write_buf_size = bundle.segment_write_buf_size.max(segment_size);
        }

        Ok(())
    }

    fn primary_bundle(&self, frame: &FrameBufferParams) -> Option<(BundleId, &TemporalBundle)> {
        let frame_idx = frame.primary_frame_idx?;
        let found = self
            .get_buffer_by_frame_index(frame_idx)
            .and_then(|id| self.bundle(id).map(|bundle| (id, bundle)));
        if found.is_none() {
            log::warn!("primary reference frame {} has no temporal buffers", frame_idx);
        }
        found
    }

    /// Links the bundle to the segment id map the frame reads.
    ///
    /// A frame that updates its map reads what it writes. A frame that keeps the map of its
    /// primary reference reads whatever that frame read, provided the geometries match.
    pub fn record_seg_id_buf_info(
        &mut self,
        id: BundleId,
        frame: &FrameBufferParams,
    ) -> DpbResult<()> {
        if self.bundle(id).is_none() {
            return Err(DpbError::MissingBundle(id));
        }

        let link = if !frame.segmentation_enabled {
            None
        } else if frame.segmentation_update_map {
            Some(SharedBufferId::SegmentWrite(id))
        } else if frame.segmentation_compatible {
            self.primary_bundle(frame)
                .and_then(|(_, primary)| primary.segment_id_buf)
        } else {
            None
        };

        if let Some(link) = link {
            self.ref_shared_buffer(link);
        }
        let previous = self
            .bundle_mut(id)
            .and_then(|bundle| std::mem::replace(&mut bundle.segment_id_buf, link));
        if let Some(previous) = previous {
            self.deref_shared_buffer(previous)?;
        }

        Ok(())
    }

    /// Links the bundle to the CDF tables the frame starts from.
    pub fn record_cdf_table_buf_info(
        &mut self,
        id: BundleId,
        frame: &FrameBufferParams,
    ) -> DpbResult<()> {
        if self.bundle(id).is_none() {
            return Err(DpbError::MissingBundle(id));
        }

        let default = CdfProvenance::DefaultTable(frame.cdf_q_ctx);
        let provenance = match frame.primary_frame_idx {
            None => default,
            Some(_) => match self.primary_bundle(frame) {
                None => default,
                Some((primary, bundle)) if bundle.disable_frame_end_update => {
                    match bundle.init_cdf_buf {
                        Some(parent) => CdfProvenance::InheritedFrom {
                            primary,
                            buffer: parent.buffer(),
                        },
                        None => {
                            log::warn!("{:?} has no initial CDF tables to inherit", primary);
                            default
                        }
                    }
                }
                Some((primary, _)) => CdfProvenance::AdaptedFrom(primary),
            },
        };

        self.ref_shared_buffer(provenance.buffer());
        let previous = self
            .bundle_mut(id)
            .and_then(|bundle| bundle.init_cdf_buf.replace(provenance));
        if let Some(previous) = previous {
            self.deref_shared_buffer(previous.buffer())?;
        }
        log::trace!("{:?} initial CDF tables: {:?}", id, provenance);

        Ok(())
    }

    pub fn shared_resource(&self, link: SharedBufferId) -> Option<&SharedResource> {
        match link {
            SharedBufferId::SegmentWrite(id) => self.bundle(id).map(|b| &b.segment_write_buf),
            SharedBufferId::BackwardAdaptedCdf(id) => {
                self.bundle(id).map(|b| &b.backward_adapted_cdf_buf)
            }
            SharedBufferId::DefaultCdf(ctx) => self.default_cdf_tables.get(ctx),
        }
    }

    fn shared_resource_mut(&mut self, link: SharedBufferId) -> Option<&mut SharedResource> {
        match link {
            SharedBufferId::DefaultCdf(ctx) => self.default_cdf_tables.get_mut(ctx),
            other => other
                .owner()
                .and_then(|id| self.bundle_mut(id))
                .and_then(|bundle| bundle.owned_resource_mut(other)),
        }
    }

    pub fn shared_buffer_handle(&self, link: SharedBufferId) -> Option<GpuBuffer> {
        self.shared_resource(link).map(SharedResource::buffer)
    }

    /// Buffer holding the initial CDF tables of bundle `id`.
    pub fn init_cdf_buffer(&self, id: BundleId) -> Option<GpuBuffer> {
        let provenance = self.bundle(id)?.init_cdf_buf?;
        self.shared_buffer_handle(provenance.buffer())
    }

    /// Buffer holding the segment id map read by bundle `id`.
    pub fn segment_id_buffer(&self, id: BundleId) -> Option<GpuBuffer> {
        let link = self.bundle(id)?.segment_id_buf?;
        self.shared_buffer_handle(link)
    }

    pub fn ref_shared_buffer(&mut self, link: SharedBufferId) {
        match self.shared_resource_mut(link) {
            Some(resource) => resource.add_ref(),
            None => {
                self.diagnostics.dangling_links += 1;
                log::warn!("cannot reference {:?}, its owner is gone", link);
            }
        }
    }

    pub fn deref_shared_buffer(&mut self, link: SharedBufferId) -> DpbResult<()> {
        let released = match self.shared_resource_mut(link) {
            Some(resource) => resource.release(),
            None => {
                self.diagnostics.dangling_links += 1;
                log::warn!("cannot release {:?}, its owner is gone", link);
                return Ok(());
            }
        };

        if !released {
            self.diagnostics.ref_count_underflows += 1;
            if self.config.strict_ref_counting {
                log::error!("{:?} released while not referenced", link);
                return Err(DpbError::RefCountUnderflow(link));
            }
            log::warn!("{:?} released while not referenced, count kept at zero", link);
        }

        Ok(())
    }

    /// Drops the links bundle `id` holds to other buffers. Calling it again is a no-op.
    pub fn deactive(&mut self, id: BundleId) -> DpbResult<()> {
        let links: Vec<SharedBufferId> = match self.bundle_mut(id) {
            Some(bundle) => bundle
                .segment_id_buf
                .take()
                .into_iter()
                .chain(bundle.init_cdf_buf.take().map(|p| p.buffer()))
                .collect(),
            None => return Ok(()),
        };

        let mut result = Ok(());
        for link in links {
            if let Err(e) = self.deref_shared_buffer(link) {
                result = result.and(Err(e));
            }
        }

        result
    }

    /// Whether bundle `id` can be handed to a new frame, i.e. no frame reads its buffers anymore.
    pub fn is_available(&self, id: BundleId) -> bool {
        if self.config.out_of_order_completion {
            return true;
        }

        match self.bundle(id) {
            Some(bundle) => {
                !bundle.segment_write_buf.is_referenced()
                    && !bundle.backward_adapted_cdf_buf.is_referenced()
            }
            None => true,
        }
    }

    /// Frees the buffers of bundle `id`. Always succeeds; outstanding references to them are
    /// logged and dropped.
    pub fn destroy(&mut self, id: BundleId) {
        let Some(mut bundle) = self.bundles.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        self.active.retain(|_, active| *active != id);
        self.available.retain(|available| *available != id);
        if self.current == Some(id) {
            self.current = None;
        }

        let held: Vec<SharedBufferId> = bundle.held_links().collect();
        for link in held {
            if link.owner() == Some(id) {
                if let Some(resource) = bundle.owned_resource_mut(link) {
                    let _ = resource.release();
                }
            } else if let Err(e) = self.deref_shared_buffer(link) {
                log::warn!("while destroying {:?}: {}", id, e);
            }
        }

        for (name, resource) in [
            ("segment id", &mut bundle.segment_write_buf),
            ("backward adapted CDF", &mut bundle.backward_adapted_cdf_buf),
        ] {
            let outstanding = resource.force_release();
            if outstanding > 0 {
                self.diagnostics.forced_releases += 1;
                log::warn!(
                    "destroying {} buffer {:?} of {:?} with {} outstanding references",
                    name,
                    resource.buffer(),
                    id,
                    outstanding
                );
            }
        }

        self.allocator.destroy(bundle.mv_buf);
        self.allocator.destroy(bundle.segment_write_buf.buffer());
        self.allocator.destroy(bundle.backward_adapted_cdf_buf.buffer());
        log::debug!("destroyed {:?}", id);
    }

    /// Detaches the bundle of `frame_idx` and queues it for reuse.
    pub fn release_frame(&mut self, frame_idx: u8) -> DpbResult<()> {
        let Some(id) = self.active.remove(&frame_idx) else {
            return Ok(());
        };
        if self.current == Some(id) {
            self.current = None;
        }

        log::debug!("releasing {:?} of frame {}", id, frame_idx);
        self.available.push(id);
        let result = self.deactive(id);
        self.trim_available();

        result
    }

    /// Destroys the oldest reusable bundles beyond the idle limit.
    fn trim_available(&mut self) {
        while self.available.len() > self.config.max_idle_bundles {
            let Some(pos) = self.available.iter().position(|id| self.is_available(*id)) else {
                break;
            };
            let id = self.available.remove(pos);
            self.destroy(id);
        }
    }

    fn activate_new_bundle(
        &mut self,
        frame_idx: u8,
        frame: &FrameBufferParams,
    ) -> DpbResult<BundleId> {
        let candidate = self
            .available
            .iter()
            .position(|id| self.is_available(*id))
            .map(|pos| self.available.remove(pos));

        match self.resize(candidate, frame) {
            Ok(id) => {
                self.active.insert(frame_idx, id);
                Ok(id)
            }
            Err(e) => {
                if let Some(candidate) = candidate {
                    self.available.push(candidate);
                }
                Err(e)
            }
        }
    }

    /// Sets up the bundle of frame `cur_frame_idx`.
    ///
    /// Bundles of frames that are neither the current frame nor in `ref_frame_indices` are
    /// released first. The current frame then keeps its bundle if it already had one, or gets a
    /// reusable released bundle, or a newly allocated one.
    pub fn update_picture(
        &mut self,
        cur_frame_idx: u8,
        ref_frame_indices: &[u8],
        frame: &FrameBufferParams,
    ) -> DpbResult<BundleId> {
        let stale: Vec<u8> = self
            .active
            .keys()
            .copied()
            .filter(|idx| *idx != cur_frame_idx && !ref_frame_indices.contains(idx))
            .collect();
        for frame_idx in stale {
            self.release_frame(frame_idx)?;
        }

        let id = match self.get_buffer_by_frame_index(cur_frame_idx) {
            Some(id) => self.resize(Some(id), frame)?,
            None => self.activate_new_bundle(cur_frame_idx, frame)?,
        };
        self.current = Some(id);

        Ok(id)
    }

    /// Bundle to read collocated motion vectors from when a reference has none: the first
    /// reference with a bundle, or the current frame's.
    pub fn get_valid_buffer_for_reference(&self, ref_frame_indices: &[u8]) -> Option<BundleId> {
        ref_frame_indices
            .iter()
            .find_map(|idx| self.get_buffer_by_frame_index(*idx))
            .or(self.current)
    }

    /// Releases every link, then every buffer of the pool.
    pub fn destroy_all(&mut self) {
        let ids: Vec<BundleId> = (0..self.bundles.len())
            .map(BundleId)
            .filter(|id| self.bundle(*id).is_some())
            .collect();

        for id in &ids {
            if let Err(e) = self.deactive(*id) {
                log::warn!("while deactivating {:?}: {}", id, e);
            }
        }
        for id in ids {
            self.destroy(id);
        }

        for table in self.default_cdf_tables.drain(..) {
            if table.is_referenced() {
                log::warn!(
                    "destroying default CDF table {:?} with {} outstanding references",
                    table.buffer(),
                    table.ref_count()
                );
            }
            self.allocator.destroy(table.buffer());
        }

        // No id survives a teardown, the arena can start over.
        self.bundles.clear();
        self.active.clear();
        self.available.clear();
        self.current = None;
    }
}

impl<A: BufferAllocator, S: BufferSizer> Drop for TemporalBufferPool<A, S> {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
