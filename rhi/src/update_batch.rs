//! Resource update batches.
//!
//! A [`ResourceUpdateBatch`] collects buffer updates, texture uploads, copies,
//! readbacks and mipmap generation. Nothing happens while recording into a
//! batch; the operations run when the batch is handed to a command buffer
//! (`begin_pass`, `end_pass`, the compute variants or `resource_update`).
//!
//! Batches come from a fixed pool of [`MAX_UPDATE_BATCHES`]. Consuming,
//! releasing or dropping a batch returns it to the pool. Released batches keep
//! their operation storage so steady-state frames do not allocate.

use std::fmt;
use std::sync::{Arc, Weak};

use image::RgbaImage;
use parking_lot::Mutex;

use crate::backend::Feature;
use crate::resource::RhiResource;
use crate::resources::{Buffer, Texture};
use crate::rhi::RhiShared;
use crate::types::{size_for_mip_level, BufferType, Point, Size, TextureFlags, TextureFormat};

/// Number of batches that can be alive at once.
pub const MAX_UPDATE_BATCHES: usize = 64;

// ============================================================================
// Readback results
// ============================================================================

/// Bytes produced by a completed readback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadbackData {
    /// Texture format, `None` for buffer readbacks.
    pub format: Option<TextureFormat>,
    pub pixel_size: Size,
    /// Empty when the readback could not be performed.
    pub data: Vec<u8>,
}

type CompletedCallback = Box<dyn FnOnce(&ReadbackData) + Send>;

#[derive(Default)]
struct ReadbackInner {
    data: Mutex<Option<ReadbackData>>,
    completed: Mutex<Option<CompletedCallback>>,
}

/// Handle receiving the result of an asynchronous readback.
///
/// Cloning shares the same result. The callback, if any, runs once the data
/// is available, which is at the earliest a full frames-in-flight cycle after
/// the frame that recorded the readback, or when an offscreen frame ends.
#[derive(Clone, Default)]
pub struct ReadbackResult {
    inner: Arc<ReadbackInner>,
}

impl ReadbackResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completed(callback: impl FnOnce(&ReadbackData) + Send + 'static) -> Self {
        let result = Self::default();
        *result.inner.completed.lock() = Some(Box::new(callback));
        result
    }

    pub fn is_ready(&self) -> bool {
        self.inner.data.lock().is_some()
    }

    pub fn data(&self) -> Option<ReadbackData> {
        self.inner.data.lock().clone()
    }

    pub fn take_data(&self) -> Option<ReadbackData> {
        self.inner.data.lock().take()
    }

    pub(crate) fn complete(&self, data: ReadbackData) {
        *self.inner.data.lock() = Some(data.clone());
        let callback = self.inner.completed.lock().take();
        if let Some(callback) = callback {
            callback(&data);
        }
    }
}

impl fmt::Debug for ReadbackResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadbackResult")
            .field("ready", &self.is_ready())
            .finish()
    }
}

// ============================================================================
// Descriptions
// ============================================================================

/// Data for one subresource (layer + level) upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubresourceUpload {
    pub data: Vec<u8>,
    /// Bytes per row of `data`; 0 means tightly packed.
    pub data_stride: u32,
    pub destination_top_left: Point,
    /// Region size; `None` uploads the whole mip level.
    pub size: Option<Size>,
}

impl SubresourceUpload {
    pub fn from_data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Tightly packed RGBA8 pixels of `image`, sized to the image.
    pub fn from_image(image: &RgbaImage) -> Self {
        Self {
            data: image.as_raw().clone(),
            data_stride: 0,
            destination_top_left: Point::default(),
            size: Some(Size::new(image.width(), image.height())),
        }
    }

    pub fn with_data_stride(mut self, stride: u32) -> Self {
        self.data_stride = stride;
        self
    }

    pub fn with_destination_top_left(mut self, point: Point) -> Self {
        self.destination_top_left = point;
        self
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.size = Some(size);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureUploadEntry {
    pub layer: u32,
    pub level: u32,
    pub description: SubresourceUpload,
}

impl TextureUploadEntry {
    pub fn new(layer: u32, level: u32, description: SubresourceUpload) -> Self {
        Self {
            layer,
            level,
            description,
        }
    }
}

/// Uploads for any number of subresources of one texture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextureUploadDescription {
    pub entries: Vec<TextureUploadEntry>,
}

impl TextureUploadDescription {
    pub fn new(entries: Vec<TextureUploadEntry>) -> Self {
        Self { entries }
    }

    /// Layer 0, level 0.
    pub fn single(description: SubresourceUpload) -> Self {
        Self::new(vec![TextureUploadEntry::new(0, 0, description)])
    }

    pub fn from_image(image: &RgbaImage) -> Self {
        Self::single(SubresourceUpload::from_image(image))
    }
}

/// Texture-to-texture copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextureCopyDescription {
    /// `None` copies the whole source level.
    pub pixel_size: Option<Size>,
    pub source_layer: u32,
    pub source_level: u32,
    pub source_top_left: Point,
    pub destination_layer: u32,
    pub destination_level: u32,
    pub destination_top_left: Point,
}

/// What to read back. `texture: None` reads the current swapchain backbuffer.
#[derive(Debug, Clone, Default)]
pub struct ReadbackDescription {
    pub texture: Option<Arc<Texture>>,
    pub layer: u32,
    pub level: u32,
}

impl ReadbackDescription {
    pub fn texture(texture: &Arc<Texture>) -> Self {
        Self {
            texture: Some(texture.clone()),
            layer: 0,
            level: 0,
        }
    }

    pub fn backbuffer() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, layer: u32) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }
}

// ============================================================================
// Recorded operations
// ============================================================================

/// Upload validated against the texture, with the region resolved.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedUpload {
    pub layer: u32,
    pub level: u32,
    pub origin: Point,
    pub size: Size,
    pub stride: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub(crate) enum UpdateOp {
    DynamicBufferUpdate {
        buffer: Arc<Buffer>,
        offset: u32,
        data: Vec<u8>,
    },
    StaticBufferUpload {
        buffer: Arc<Buffer>,
        offset: u32,
        data: Vec<u8>,
    },
    BufferReadback {
        buffer: Arc<Buffer>,
        offset: u32,
        size: u32,
        result: ReadbackResult,
        /// Capability gap found at record time; completes empty.
        unsupported: bool,
    },
    TextureUpload {
        texture: Arc<Texture>,
        uploads: Vec<ResolvedUpload>,
    },
    TextureCopy {
        destination: Arc<Texture>,
        source: Arc<Texture>,
        description: TextureCopyDescription,
        size: Size,
    },
    TextureReadback {
        description: ReadbackDescription,
        result: ReadbackResult,
        unsupported: bool,
    },
    GenerateMips {
        texture: Arc<Texture>,
    },
}

// ============================================================================
// Pool
// ============================================================================

/// Storage for idle batches.
#[derive(Debug)]
pub(crate) struct BatchPool {
    free: Vec<Vec<UpdateOp>>,
    in_use: usize,
}

impl BatchPool {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            in_use: 0,
        }
    }

    pub fn acquire(&mut self) -> Option<Vec<UpdateOp>> {
        if self.in_use >= MAX_UPDATE_BATCHES {
            return None;
        }
        self.in_use += 1;
        Some(self.free.pop().unwrap_or_default())
    }

    pub fn release(&mut self, mut ops: Vec<UpdateOp>) {
        ops.clear();
        self.in_use = self.in_use.saturating_sub(1);
        self.free.push(ops);
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }
}

// ============================================================================
// Batch
// ============================================================================

/// A list of resource updates applied by a command buffer.
///
/// Obtained from [`Rhi::next_resource_update_batch`](crate::Rhi::next_resource_update_batch).
/// Invalid operations are rejected with a warning when recorded and never
/// reach the GPU.
pub struct ResourceUpdateBatch {
    shared: Weak<RhiShared>,
    ops: Vec<UpdateOp>,
}

impl ResourceUpdateBatch {
    pub(crate) fn new(shared: &Arc<RhiShared>, ops: Vec<UpdateOp>) -> Self {
        Self {
            shared: Arc::downgrade(shared),
            ops,
        }
    }

    fn warn(&self, args: fmt::Arguments<'_>) {
        match self.shared.upgrade() {
            Some(shared) => shared.validation_warning(args),
            None => log::warn!("{args}"),
        }
    }

    fn feature(&self, feature: Feature) -> bool {
        self.shared
            .upgrade()
            .map(|s| s.is_feature_supported(feature))
            .unwrap_or(false)
    }

    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append a copy of every operation in `other`.
    pub fn merge(&mut self, other: &ResourceUpdateBatch) {
        self.ops.extend(other.ops.iter().cloned());
    }

    /// Return the batch to the pool without applying anything.
    pub fn release(self) {}

    pub(crate) fn drain_ops(&mut self) -> std::vec::Drain<'_, UpdateOp> {
        self.ops.drain(..)
    }

    /// Update part of a `Dynamic` buffer. Applied host-side when the batch is
    /// committed; the other frame slots catch up when they become current.
    pub fn update_dynamic_buffer(&mut self, buffer: &Arc<Buffer>, offset: u32, data: &[u8]) {
        if buffer.buffer_type() != BufferType::Dynamic {
            self.warn(format_args!(
                "update_dynamic_buffer on non-dynamic buffer {}",
                buffer.core().label()
            ));
            return;
        }
        if !self.check_range(buffer, offset, data.len() as u64) {
            return;
        }
        self.ops.push(UpdateOp::DynamicBufferUpdate {
            buffer: buffer.clone(),
            offset,
            data: data.to_vec(),
        });
    }

    /// Upload into part of an `Immutable` or `Static` buffer.
    pub fn upload_static_buffer(&mut self, buffer: &Arc<Buffer>, offset: u32, data: &[u8]) {
        if buffer.buffer_type() == BufferType::Dynamic {
            self.warn(format_args!(
                "upload_static_buffer on dynamic buffer {}",
                buffer.core().label()
            ));
            return;
        }
        if !self.check_range(buffer, offset, data.len() as u64) {
            return;
        }
        self.ops.push(UpdateOp::StaticBufferUpload {
            buffer: buffer.clone(),
            offset,
            data: data.to_vec(),
        });
    }

    /// Upload the whole buffer from the start of `data`.
    pub fn upload_static_buffer_full(&mut self, buffer: &Arc<Buffer>, data: &[u8]) {
        let size = buffer.size() as usize;
        if data.len() < size {
            self.warn(format_args!(
                "{} bytes are not enough to fill buffer {} of size {size}",
                data.len(),
                buffer.core().label()
            ));
            return;
        }
        self.upload_static_buffer(buffer, 0, &data[..size]);
    }

    /// Read `size` bytes at `offset` back into `result`.
    pub fn read_back_buffer(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: u32,
        size: u32,
        result: ReadbackResult,
    ) {
        if !self.check_range(buffer, offset, u64::from(size)) {
            return;
        }
        let uniform_only = buffer.usage() == crate::types::BufferUsage::UNIFORM;
        let unsupported = !uniform_only && !self.feature(Feature::ReadBackNonUniformBuffer);
        if unsupported {
            self.warn(format_args!(
                "reading back non-uniform buffer {} is not supported",
                buffer.core().label()
            ));
        }
        self.ops.push(UpdateOp::BufferReadback {
            buffer: buffer.clone(),
            offset,
            size,
            result,
            unsupported,
        });
    }

    fn check_range(&self, buffer: &Buffer, offset: u32, len: u64) -> bool {
        if len == 0 {
            self.warn(format_args!(
                "zero-sized update of buffer {}",
                buffer.core().label()
            ));
            return false;
        }
        if u64::from(offset) + len > u64::from(buffer.size()) {
            self.warn(format_args!(
                "range {offset}+{len} exceeds buffer {} of size {}",
                buffer.core().label(),
                buffer.size()
            ));
            return false;
        }
        true
    }

    /// Upload image data. Consecutive uploads to the same texture merge into
    /// one operation.
    pub fn upload_texture(&mut self, texture: &Arc<Texture>, description: TextureUploadDescription) {
        let descriptor = texture.descriptor();
        let format = descriptor.format;
        let mut uploads = Vec::with_capacity(description.entries.len());
        for entry in description.entries {
            if entry.layer >= descriptor.layer_count() || entry.level >= descriptor.mip_level_count()
            {
                self.warn(format_args!(
                    "upload to layer {} level {} out of range for texture {}",
                    entry.layer,
                    entry.level,
                    texture.core().label()
                ));
                return;
            }
            let level_size = size_for_mip_level(entry.level, descriptor.pixel_size);
            let sub = entry.description;
            let size = sub.size.unwrap_or(level_size);
            let origin = sub.destination_top_left;
            if size.is_empty() || !region_fits(origin, size, level_size) {
                self.warn(format_args!(
                    "upload region {}x{} at ({}, {}) exceeds level {} of texture {}",
                    size.width,
                    size.height,
                    origin.x,
                    origin.y,
                    entry.level,
                    texture.core().label()
                ));
                return;
            }
            let (bw, bh) = format.block_dimensions();
            if origin.x % bw != 0 || origin.y % bh != 0 {
                self.warn(format_args!(
                    "compressed upload origin must be aligned to {bw}x{bh} blocks"
                ));
                return;
            }
            let row = format.bytes_per_line(size.width);
            let stride = if sub.data_stride == 0 {
                row
            } else {
                sub.data_stride
            };
            let lines = format.line_count(size.height);
            let needed = u64::from(stride) * u64::from(lines - 1) + u64::from(row);
            if stride < row || (sub.data.len() as u64) < needed {
                self.warn(format_args!(
                    "upload to texture {} needs {needed} bytes with stride {stride}, got {}",
                    texture.core().label(),
                    sub.data.len()
                ));
                return;
            }
            uploads.push(ResolvedUpload {
                layer: entry.layer,
                level: entry.level,
                origin,
                size,
                stride,
                data: sub.data,
            });
        }
        if uploads.is_empty() {
            return;
        }
        if let Some(UpdateOp::TextureUpload {
            texture: previous,
            uploads: merged,
        }) = self.ops.last_mut()
        {
            if Arc::ptr_eq(previous, texture) {
                merged.extend(uploads);
                return;
            }
        }
        self.ops.push(UpdateOp::TextureUpload {
            texture: texture.clone(),
            uploads,
        });
    }

    /// Copy between two textures of the same format. The source must have
    /// [`TextureFlags::USED_AS_TRANSFER_SOURCE`].
    pub fn copy_texture(
        &mut self,
        destination: &Arc<Texture>,
        source: &Arc<Texture>,
        description: TextureCopyDescription,
    ) {
        let src = source.descriptor();
        let dst = destination.descriptor();
        if src.format != dst.format {
            self.warn(format_args!(
                "copy between different formats {:?} and {:?}",
                src.format, dst.format
            ));
            return;
        }
        if !src.flags.contains(TextureFlags::USED_AS_TRANSFER_SOURCE) {
            self.warn(format_args!(
                "copy source {} lacks USED_AS_TRANSFER_SOURCE",
                source.core().label()
            ));
            return;
        }
        if description.source_level >= src.mip_level_count()
            || description.destination_level >= dst.mip_level_count()
            || description.source_layer >= src.layer_count()
            || description.destination_layer >= dst.layer_count()
        {
            self.warn(format_args!("copy subresource out of range"));
            return;
        }
        let src_size = size_for_mip_level(description.source_level, src.pixel_size);
        let dst_size = size_for_mip_level(description.destination_level, dst.pixel_size);
        let size = description.pixel_size.unwrap_or(src_size);
        if size.is_empty()
            || !region_fits(description.source_top_left, size, src_size)
            || !region_fits(description.destination_top_left, size, dst_size)
        {
            self.warn(format_args!(
                "copy region {}x{} out of bounds",
                size.width, size.height
            ));
            return;
        }
        self.ops.push(UpdateOp::TextureCopy {
            destination: destination.clone(),
            source: source.clone(),
            description,
            size,
        });
    }

    /// Read a texture subresource, or the current backbuffer, into `result`.
    pub fn read_back_texture(&mut self, description: ReadbackDescription, result: ReadbackResult) {
        let mut unsupported = false;
        if let Some(texture) = &description.texture {
            let desc = texture.descriptor();
            if description.layer >= desc.layer_count() || description.level >= desc.mip_level_count()
            {
                self.warn(format_args!(
                    "readback subresource out of range for texture {}",
                    texture.core().label()
                ));
                return;
            }
            if desc.format.is_compressed() {
                self.warn(format_args!(
                    "reading back compressed texture {} is not supported",
                    texture.core().label()
                ));
                unsupported = true;
            } else if desc.sample_count > 1 {
                self.warn(format_args!(
                    "reading back multisample texture {} is not supported",
                    texture.core().label()
                ));
                unsupported = true;
            } else if description.level > 0 && !self.feature(Feature::ReadBackNonBaseMipLevel) {
                self.warn(format_args!("reading back non-base mip levels is not supported"));
                unsupported = true;
            }
        }
        self.ops.push(UpdateOp::TextureReadback {
            description,
            result,
            unsupported,
        });
    }

    /// Regenerate all mip levels below the base level.
    pub fn generate_mips(&mut self, texture: &Arc<Texture>) {
        let flags = texture.flags();
        if !flags.contains(TextureFlags::MIP_MAPPED | TextureFlags::USED_WITH_GENERATE_MIPS) {
            self.warn(format_args!(
                "generate_mips on texture {} without MIP_MAPPED and USED_WITH_GENERATE_MIPS",
                texture.core().label()
            ));
            return;
        }
        self.ops.push(UpdateOp::GenerateMips {
            texture: texture.clone(),
        });
    }
}

/// Whether `size` texels at `origin` stay inside `level`. Coordinates near
/// `u32::MAX` do not wrap.
fn region_fits(origin: Point, size: Size, level: Size) -> bool {
    let right = origin.x.checked_add(size.width);
    let bottom = origin.y.checked_add(size.height);
    matches!((right, bottom), (Some(r), Some(b)) if r <= level.width && b <= level.height)
}

impl Drop for ResourceUpdateBatch {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.release_batch(std::mem::take(&mut self.ops));
        }
    }
}

impl fmt::Debug for ResourceUpdateBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceUpdateBatch")
            .field("ops", &self.ops.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(ResourceUpdateBatch: Send, Sync);
static_assertions::assert_impl_all!(ReadbackResult: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BufferDescriptor, BufferUsage, TextureDescriptor};
    use crate::{BackendKind, InitParams, Rhi, RhiFlags};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn rhi() -> Rhi {
        Rhi::create(BackendKind::Null, InitParams::default(), RhiFlags::empty()).unwrap()
    }

    #[test]
    fn test_pool_limit() {
        let mut pool = BatchPool::new();
        let held: Vec<_> = (0..MAX_UPDATE_BATCHES).map(|_| pool.acquire().unwrap()).collect();
        assert!(pool.acquire().is_none());
        let mut held = held;
        pool.release(held.pop().unwrap());
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn test_invalid_ops_are_dropped() {
        let rhi = rhi();
        let dynamic = rhi.new_buffer(BufferDescriptor::new(BufferType::Dynamic, BufferUsage::UNIFORM, 64));
        let static_buf = rhi.new_buffer(BufferDescriptor::new(BufferType::Static, BufferUsage::VERTEX, 64));
        let mut batch = rhi.next_resource_update_batch().unwrap();

        batch.update_dynamic_buffer(&static_buf, 0, &[0; 4]);
        batch.update_dynamic_buffer(&dynamic, 60, &[0; 8]);
        batch.upload_static_buffer(&dynamic, 0, &[0; 4]);
        batch.upload_static_buffer(&static_buf, 0, &[]);
        assert!(batch.is_empty());
        assert_eq!(rhi.statistics().validation_warnings, 4);

        batch.update_dynamic_buffer(&dynamic, 0, &[1; 64]);
        batch.upload_static_buffer(&static_buf, 16, &[2; 16]);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_consecutive_texture_uploads_merge() {
        let rhi = rhi();
        let texture = rhi.new_texture(TextureDescriptor::new_2d(
            8,
            8,
            TextureFormat::Rgba8,
            TextureFlags::empty(),
        ));
        let mut batch = rhi.next_resource_update_batch().unwrap();
        let quarter = SubresourceUpload::from_data(vec![0u8; 4 * 4 * 4]).with_size(Size::new(4, 4));
        batch.upload_texture(&texture, TextureUploadDescription::single(quarter.clone()));
        batch.upload_texture(
            &texture,
            TextureUploadDescription::single(
                quarter.with_destination_top_left(Point::new(4, 4)),
            ),
        );
        assert_eq!(batch.len(), 1);

        batch.upload_texture(
            &texture,
            TextureUploadDescription::single(
                SubresourceUpload::from_data(vec![0u8; 16]).with_size(Size::new(8, 8)),
            ),
        );
        assert_eq!(batch.len(), 1);
        assert_eq!(rhi.statistics().validation_warnings, 1);
    }

    #[test]
    fn test_regions_past_u32_max_are_rejected() {
        let rhi = rhi();
        let source = rhi.new_texture(TextureDescriptor::new_2d(
            8,
            8,
            TextureFormat::Rgba8,
            TextureFlags::USED_AS_TRANSFER_SOURCE,
        ));
        let destination = rhi.new_texture(TextureDescriptor::new_2d(
            8,
            8,
            TextureFormat::Rgba8,
            TextureFlags::empty(),
        ));
        let mut batch = rhi.next_resource_update_batch().unwrap();

        let far = Point::new(u32::MAX - 1, 0);
        batch.upload_texture(
            &destination,
            TextureUploadDescription::single(
                SubresourceUpload::from_data(vec![0u8; 4 * 4 * 4])
                    .with_size(Size::new(4, 4))
                    .with_destination_top_left(far),
            ),
        );
        batch.copy_texture(
            &destination,
            &source,
            TextureCopyDescription {
                pixel_size: Some(Size::new(4, 4)),
                source_top_left: far,
                ..Default::default()
            },
        );
        batch.copy_texture(
            &destination,
            &source,
            TextureCopyDescription {
                pixel_size: Some(Size::new(4, 4)),
                destination_top_left: Point::new(0, u32::MAX),
                ..Default::default()
            },
        );
        assert!(batch.is_empty());
        assert_eq!(rhi.statistics().validation_warnings, 3);

        batch.copy_texture(
            &destination,
            &source,
            TextureCopyDescription {
                pixel_size: Some(Size::new(4, 4)),
                destination_top_left: Point::new(4, 4),
                ..Default::default()
            },
        );
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_merge_and_release() {
        let rhi = rhi();
        let buffer = rhi.new_buffer(BufferDescriptor::new(BufferType::Dynamic, BufferUsage::UNIFORM, 64));
        let mut a = rhi.next_resource_update_batch().unwrap();
        let mut b = rhi.next_resource_update_batch().unwrap();
        b.update_dynamic_buffer(&buffer, 0, &[1; 16]);
        b.update_dynamic_buffer(&buffer, 16, &[2; 16]);
        a.merge(&b);
        assert_eq!(a.len(), 2);
        assert_eq!(rhi.statistics().update_batches_in_use, 2);
        b.release();
        drop(a);
        assert_eq!(rhi.statistics().update_batches_in_use, 0);
    }

    #[test]
    fn test_readback_result_callback() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let result = ReadbackResult::with_completed(move |data| {
            assert_eq!(data.data, vec![1, 2, 3]);
            flag.store(true, Ordering::SeqCst);
        });
        assert!(!result.is_ready());
        result.clone().complete(ReadbackData {
            format: None,
            pixel_size: Size::default(),
            data: vec![1, 2, 3],
        });
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(result.data().unwrap().data, vec![1, 2, 3]);
    }
}
