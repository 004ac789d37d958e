//! The fixed ring of pre-rendered slots and its upload backends.
//!
//! The ring itself ([`FrameCache`]) is plain metadata: which frame sits in
//! which slot, filled strictly round-robin with the display index trailing
//! the fill index. Pixel bytes go through a [`SlotUploader`], either the wgpu
//! backend (texture + render-target pair per slot, touched only by the
//! presentation thread) or an in-memory backend for tests and CPU-only
//! simulated runs.

use anyhow::{anyhow, Context, Result};

use crate::config::Margins;
use crate::frame::{Frame, TrackSnapshot};

/// GPU upload contract: BGRA, 4 bytes per pixel, full-image re-specification
/// per upload (no sub-image path; re-creating the image is faster for this
/// write-once-read-once access pattern).
pub trait SlotUploader {
    /// Bulk-allocate `slots` slots for `width x height` frames. Failure here
    /// is fatal to the run.
    fn allocate(&mut self, slots: usize, width: u32, height: u32) -> Result<()>;

    /// Upload one frame's bytes into `slot`.
    fn upload(&mut self, slot: usize, width: u32, height: u32, bytes: &[u8]) -> Result<()>;

    /// Free all slot resources.
    fn release(&mut self);
}

/// Metadata of the frame most recently uploaded into a slot. The display
/// pass swaps these values in for the one draw of that slot.
#[derive(Debug, Clone, Copy)]
pub struct SlotMeta {
    pub frame_number: u64,
    pub serial: u64,
    pub margins: Margins,
    pub background: f32,
    pub displacement: (i32, i32),
    pub track: TrackSnapshot,
}

/// Fixed-depth metadata ring over the uploader's slots.
pub struct FrameCache {
    slots: Vec<Option<SlotMeta>>,
    fill_index: usize,
    display_index: usize,
    filled: u64,
    displayed: u64,
}

impl FrameCache {
    pub fn new(depth: usize) -> Self {
        Self {
            slots: vec![None; depth.max(1)],
            fill_index: 0,
            display_index: 0,
            filled: 0,
            displayed: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Slots filled but not yet displayed.
    pub fn ready(&self) -> u64 {
        self.filled - self.displayed
    }

    /// True if filling one more slot would overwrite an undisplayed frame.
    pub fn is_full(&self) -> bool {
        self.ready() >= self.slots.len() as u64
    }

    pub fn frames_displayed(&self) -> u64 {
        self.displayed
    }

    /// Record `frame`'s metadata in the next ring slot and return the slot
    /// index plus the frame number assigned at upload.
    pub fn store(&mut self, frame: &Frame) -> (usize, u64) {
        let slot = self.fill_index;
        let frame_number = self.filled;
        self.slots[slot] = Some(SlotMeta {
            frame_number,
            serial: frame.serial,
            margins: frame.margins,
            background: frame.background,
            displacement: frame.displacement,
            track: frame.track,
        });
        self.fill_index = (self.fill_index + 1) % self.slots.len();
        self.filled += 1;
        (slot, frame_number)
    }

    /// Take the next slot for display, in strict upload order.
    pub fn take_display_slot(&mut self) -> Option<(usize, SlotMeta)> {
        if self.displayed == self.filled {
            return None;
        }
        let slot = self.display_index;
        let meta = self.slots[slot]?;
        self.display_index = (self.display_index + 1) % self.slots.len();
        self.displayed += 1;
        Some((slot, meta))
    }
}

/// In-memory uploader: byte-for-byte slot copies plus an upload log, used by
/// tests and `run` without `--gpu`.
#[derive(Debug, Default)]
pub struct MemorySlotCache {
    slots: Vec<Vec<u8>>,
    width: u32,
    height: u32,
    upload_log: Vec<usize>,
}

impl MemorySlotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot_bytes(&self, slot: usize) -> Option<&[u8]> {
        self.slots.get(slot).map(|s| s.as_slice())
    }

    /// Sequence of slot indices in upload order.
    pub fn upload_log(&self) -> &[usize] {
        &self.upload_log
    }
}

impl SlotUploader for MemorySlotCache {
    fn allocate(&mut self, slots: usize, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(anyhow!("cannot allocate {width}x{height} slots"));
        }
        self.width = width;
        self.height = height;
        self.slots = vec![Vec::new(); slots];
        self.upload_log.clear();
        Ok(())
    }

    fn upload(&mut self, slot: usize, width: u32, height: u32, bytes: &[u8]) -> Result<()> {
        let expected = width as usize * height as usize * 4;
        if bytes.len() != expected {
            return Err(anyhow!(
                "slot {slot}: expected {expected} bytes for {width}x{height}, got {}",
                bytes.len()
            ));
        }
        let dest = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| anyhow!("slot {slot} out of range"))?;
        dest.clear();
        dest.extend_from_slice(bytes);
        self.upload_log.push(slot);
        Ok(())
    }

    fn release(&mut self) {
        self.slots.clear();
        self.upload_log.clear();
    }
}

struct GpuSlot {
    stimulus: Option<wgpu::Texture>,
    // Render target the presentation pass composites into; allocated once at
    // init and kept for the life of the run.
    _render_target: wgpu::Texture,
}

/// wgpu-backed slot cache. Only the presentation thread holds this; producer
/// threads never see a GPU handle.
pub struct WgpuSlotCache {
    device: wgpu::Device,
    queue: wgpu::Queue,
    slots: Vec<GpuSlot>,
}

impl WgpuSlotCache {
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| anyhow!("no suitable GPU adapter found"))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("checkflicker-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .context("failed to request wgpu device")?;

        Ok(Self {
            device,
            queue,
            slots: Vec::new(),
        })
    }

    /// Texture currently bound to `slot`, for the presentation draw pass.
    pub fn stimulus(&self, slot: usize) -> Option<&wgpu::Texture> {
        self.slots.get(slot).and_then(|s| s.stimulus.as_ref())
    }

    fn stimulus_texture(&self, slot: usize, width: u32, height: u32) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&format!("checkflicker-slot-{slot}")),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Bgra8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }
}

impl SlotUploader for WgpuSlotCache {
    fn allocate(&mut self, slots: usize, width: u32, height: u32) -> Result<()> {
        let limit = self.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > limit || height > limit {
            return Err(anyhow!(
                "slot dimensions {width}x{height} unsupported (device limit {limit})"
            ));
        }

        self.slots.clear();
        for slot in 0..slots {
            let render_target = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&format!("checkflicker-slot-target-{slot}")),
                size: wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Bgra8Unorm,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
                view_formats: &[],
            });
            self.slots.push(GpuSlot {
                stimulus: None,
                _render_target: render_target,
            });
        }
        Ok(())
    }

    fn upload(&mut self, slot: usize, width: u32, height: u32, bytes: &[u8]) -> Result<()> {
        let expected = width as usize * height as usize * 4;
        if bytes.len() != expected {
            return Err(anyhow!(
                "slot {slot}: expected {expected} bytes for {width}x{height}, got {}",
                bytes.len()
            ));
        }
        if slot >= self.slots.len() {
            return Err(anyhow!("slot {slot} out of range"));
        }

        // Full-image re-specification: a fresh texture each upload beats a
        // sub-image update for this access pattern.
        let texture = self.stimulus_texture(slot, width, height);
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytes,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.slots[slot].stimulus = Some(texture);
        Ok(())
    }

    fn release(&mut self) {
        self.slots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Margins;
    use crate::frame::{PixelBuffer, TrackMode, TrackSnapshot};

    fn dummy_frame(serial: u64) -> Frame {
        Frame {
            pixels: PixelBuffer::for_grid(4, 4),
            nx: 4,
            ny: 4,
            display_width: 40,
            display_height: 40,
            margins: Margins::default(),
            background: 0.5,
            displacement: (0, 0),
            track: TrackSnapshot {
                enabled: false,
                x: 0,
                y: 0,
                size: 20,
                mode: TrackMode::Off,
            },
            serial,
        }
    }

    #[test]
    fn slots_fill_strictly_round_robin() {
        let mut cache = FrameCache::new(3);
        let mut order = Vec::new();
        for i in 0..7 {
            let (slot, number) = cache.store(&dummy_frame(0));
            assert_eq!(number, i as u64);
            // Keep the display index moving so the ring never overflows.
            cache.take_display_slot();
            order.push(slot);
        }
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn display_order_matches_upload_order() {
        let mut cache = FrameCache::new(4);
        for serial in 0..3 {
            cache.store(&dummy_frame(serial));
        }
        assert_eq!(cache.ready(), 3);

        let serials: Vec<u64> = std::iter::from_fn(|| cache.take_display_slot())
            .map(|(_, meta)| meta.serial)
            .collect();
        assert_eq!(serials, vec![0, 1, 2]);
        assert!(cache.take_display_slot().is_none());
        assert_eq!(cache.frames_displayed(), 3);
    }

    #[test]
    fn memory_uploader_checks_lengths_and_logs_order() {
        let mut uploader = MemorySlotCache::new();
        uploader.allocate(2, 4, 4).unwrap();

        let bytes = vec![7u8; 4 * 4 * 4];
        uploader.upload(0, 4, 4, &bytes).unwrap();
        uploader.upload(1, 4, 4, &bytes).unwrap();
        uploader.upload(0, 4, 4, &bytes).unwrap();
        assert_eq!(uploader.upload_log(), &[0, 1, 0]);
        assert_eq!(uploader.slot_bytes(1).unwrap().len(), 64);

        assert!(uploader.upload(0, 4, 4, &bytes[..10]).is_err());
        assert!(uploader.upload(5, 4, 4, &bytes).is_err());
    }
}
