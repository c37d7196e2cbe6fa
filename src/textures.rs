//! Packs same-shaped textures into a small number of native array objects.
//!
//! Every logical texture is a [`TextureHandle`] naming an array record and a
//! layer in it. Native objects are only created by [`TextureAllocator::sync`],
//! which must run on the device thread; `alloc`/`update` just queue work.

use std::path::Path;

use bitflags::bitflags;
use log::{debug, error, warn};

use crate::codecs;
use crate::config::CoreConfig;
use crate::device::{Device, DeviceThread, ResourceId};
use crate::error::{CoreError, Result};
use crate::handles::TextureHandle;

pub const CUBE_FACES: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8,
    Rg8,
    Rgb8,
    Rgba8,
    Srgb8,
    R16F,
    Rg16F,
    Rgb16F,
    Rgba16F,
    R32F,
    Rg32F,
    Rgb32F,
    Rgba32F,
    Depth,
    DepthStencil,
}

impl TextureFormat {
    pub fn channels(self) -> u32 {
        match self {
            TextureFormat::R8 | TextureFormat::R16F | TextureFormat::R32F => 1,
            TextureFormat::Rg8 | TextureFormat::Rg16F | TextureFormat::Rg32F => 2,
            TextureFormat::Rgb8
            | TextureFormat::Srgb8
            | TextureFormat::Rgb16F
            | TextureFormat::Rgb32F => 3,
            TextureFormat::Rgba8 | TextureFormat::Rgba16F | TextureFormat::Rgba32F => 4,
            TextureFormat::Depth | TextureFormat::DepthStencil => 1,
        }
    }

    pub fn bytes_per_channel(self) -> u32 {
        match self {
            TextureFormat::R8
            | TextureFormat::Rg8
            | TextureFormat::Rgb8
            | TextureFormat::Rgba8
            | TextureFormat::Srgb8 => 1,
            TextureFormat::R16F
            | TextureFormat::Rg16F
            | TextureFormat::Rgb16F
            | TextureFormat::Rgba16F => 2,
            TextureFormat::R32F
            | TextureFormat::Rg32F
            | TextureFormat::Rgb32F
            | TextureFormat::Rgba32F
            | TextureFormat::Depth
            | TextureFormat::DepthStencil => 4,
        }
    }

    #[inline]
    pub fn bytes_per_pixel(self) -> u32 {
        self.channels() * self.bytes_per_channel()
    }

    pub fn is_float(self) -> bool {
        self.bytes_per_channel() > 1
    }
}

/// Textures may share an array object only when their shapes are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureShape {
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub levels: u32,
}

impl TextureShape {
    pub fn new(format: TextureFormat, width: u32, height: u32, levels: u32) -> Self {
        Self {
            format,
            width,
            height,
            levels,
        }
    }

    pub fn mip_size(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    /// Bytes of one native layer at `mip`.
    pub fn mip_byte_size(&self, mip: u32) -> usize {
        let (w, h) = self.mip_size(mip);
        w as usize * h as usize * self.format.bytes_per_pixel() as usize
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureFlags: u8 {
        /// Rebuild the mip chain from level 0 after it is uploaded.
        const GEN_MIPMAPS = 1;
        const FLIP_VERTICALLY = 1 << 1;
        /// Six faces per logical texture, stored in a cubemap array.
        const CUBEMAP = 1 << 2;
    }
}

/// Pixel data for one mip level: one buffer for plain textures, six (in face
/// order +X, -X, +Y, -Y, +Z, -Z) for cubemaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureImage {
    pub mip: u32,
    pub faces: Vec<Box<[u8]>>,
}

impl TextureImage {
    pub fn new(mip: u32, pixels: Vec<u8>) -> Self {
        Self {
            mip,
            faces: vec![pixels.into_boxed_slice()],
        }
    }

    pub fn cube(mip: u32, faces: [Vec<u8>; 6]) -> Self {
        Self {
            mip,
            faces: faces.into_iter().map(Vec::into_boxed_slice).collect(),
        }
    }
}

#[derive(Debug)]
enum PendingUpdate {
    /// Storage allocation for an array that was just (re)assigned a shape.
    Storage { cubemap: bool, array: u16 },
    Pixels { handle: TextureHandle, image: TextureImage },
}

#[derive(Debug, Clone)]
struct TextureArray {
    shape: TextureShape,
    next_layer: u16,
    free_layers: Vec<u16>,
    id: Option<ResourceId>,
}

impl TextureArray {
    fn new(shape: TextureShape) -> Self {
        Self {
            shape,
            next_layer: 0,
            free_layers: Vec::new(),
            id: None,
        }
    }

    fn live_layers(&self) -> usize {
        self.next_layer as usize - self.free_layers.len()
    }

    fn has_room(&self, capacity: u16) -> bool {
        !self.free_layers.is_empty() || self.next_layer < capacity
    }

    fn take_layer(&mut self) -> u16 {
        if let Some(layer) = self.free_layers.pop() {
            return layer;
        }
        let layer = self.next_layer;
        self.next_layer += 1;
        layer
    }

    fn is_live(&self, layer: u16) -> bool {
        layer < self.next_layer && !self.free_layers.contains(&layer)
    }
}

#[derive(Debug)]
struct ArrayTable {
    arrays: Vec<TextureArray>,
    capacity: u16,
    limit: usize,
    what: &'static str,
}

impl ArrayTable {
    fn new(capacity: u16, limit: usize, what: &'static str) -> Self {
        Self {
            arrays: Vec::new(),
            capacity,
            limit,
            what,
        }
    }
}

/// Occupancy summary of one array record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayInfo {
    pub shape: TextureShape,
    pub cubemap: bool,
    pub live_layers: usize,
    pub id: Option<ResourceId>,
}

#[derive(Debug)]
pub struct TextureAllocator {
    plain: ArrayTable,
    cubemaps: ArrayTable,
    updates: Vec<PendingUpdate>,
    retired: Vec<ResourceId>,
}

impl Default for TextureAllocator {
    fn default() -> Self {
        Self::new(&CoreConfig::default())
    }
}

impl TextureAllocator {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            plain: ArrayTable::new(config.tex_array_layers, config.max_tex_arrays, "texture array"),
            cubemaps: ArrayTable::new(
                config.cubemap_array_layers,
                config.max_cubemap_arrays,
                "cubemap array",
            ),
            updates: Vec::new(),
            retired: Vec::new(),
        }
    }

    fn table(&self, cubemap: bool) -> &ArrayTable {
        if cubemap {
            &self.cubemaps
        } else {
            &self.plain
        }
    }

    /// Returns a free layer in an array of `shape`, creating the array record
    /// when none has room.
    pub fn alloc(&mut self, shape: TextureShape, flags: TextureFlags) -> Result<TextureHandle> {
        let cubemap = flags.contains(TextureFlags::CUBEMAP);
        let table = if cubemap {
            &mut self.cubemaps
        } else {
            &mut self.plain
        };

        let capacity = table.capacity;
        if let Some((index, array)) = table
            .arrays
            .iter_mut()
            .enumerate()
            .find(|(_, array)| array.shape == shape && array.has_room(capacity))
        {
            let layer = array.take_layer();
            return Ok(TextureHandle {
                array: index as u16,
                layer,
                flags,
            });
        }

        let index = if let Some(index) = table.arrays.iter().position(|a| a.live_layers() == 0) {
            let old = std::mem::replace(&mut table.arrays[index], TextureArray::new(shape));
            debug!(
                "reusing empty {} {} ({:?} -> {:?})",
                table.what, index, old.shape, shape
            );
            if let Some(id) = old.id {
                self.retired.push(id);
            }
            self.updates.retain(|update| match update {
                PendingUpdate::Storage { cubemap: c, array } => !(*c == cubemap && *array as usize == index),
                PendingUpdate::Pixels { handle, .. } => {
                    !(handle.is_cubemap() == cubemap && handle.array as usize == index)
                }
            });
            index
        } else if table.arrays.len() < table.limit {
            table.arrays.push(TextureArray::new(shape));
            table.arrays.len() - 1
        } else {
            return Err(CoreError::OutOfCapacity {
                what: table.what,
                limit: table.limit,
            });
        };

        debug!("new {} {} for {:?}", table.what, index, shape);
        let layer = table.arrays[index].take_layer();
        self.updates.push(PendingUpdate::Storage {
            cubemap,
            array: index as u16,
        });
        Ok(TextureHandle {
            array: index as u16,
            layer,
            flags,
        })
    }

    /// Queues pixel data for one mip level of `handle`. The buffers are
    /// dropped once `sync` has uploaded them.
    pub fn update(&mut self, handle: TextureHandle, image: TextureImage) {
        let expected_faces = if handle.is_cubemap() { CUBE_FACES as usize } else { 1 };
        assert_eq!(image.faces.len(), expected_faces, "wrong face count for {handle:?}");
        debug_assert!(
            self.array(handle).is_live(handle.layer),
            "updating a released texture layer"
        );
        debug_assert!(image.mip < self.array(handle).shape.levels.max(1));
        self.updates.push(PendingUpdate::Pixels { handle, image });
    }

    /// Decodes the image at `path` on the calling thread, then allocates and
    /// queues it like `alloc` + `update`.
    pub fn load(
        &mut self,
        path: impl AsRef<Path>,
        format: TextureFormat,
        levels: u32,
        flags: TextureFlags,
    ) -> Result<TextureHandle> {
        let image = codecs::decode_image(path.as_ref(), format, flags)?;
        let handle = self.alloc(TextureShape::new(format, image.width, image.height, levels), flags)?;
        self.update(handle, TextureImage::new(0, image.pixels));
        Ok(handle)
    }

    /// Returns the layer to its array. Once an array has no live layers it
    /// may be handed to a different shape by a later `alloc`.
    pub fn release(&mut self, handle: TextureHandle) {
        let table = if handle.is_cubemap() {
            &mut self.cubemaps
        } else {
            &mut self.plain
        };
        let array = &mut table.arrays[handle.array as usize];
        assert!(array.is_live(handle.layer), "releasing a free texture layer");
        array.free_layers.push(handle.layer);
    }

    /// Creates missing native arrays, then applies every queued update in
    /// submission order. The queue is always emptied; the first upload error,
    /// if any, is returned after the rest have been applied.
    pub fn sync<D: Device>(&mut self, device: &mut DeviceThread<D>) -> Result<()> {
        let device = device.get_mut();

        for id in self.retired.drain(..) {
            device.release_texture_array(id);
        }

        for (table, cubemap) in [(&mut self.cubemaps, true), (&mut self.plain, false)] {
            for (index, array) in table.arrays.iter_mut().enumerate() {
                if array.id.is_none() {
                    let id = device.create_texture_array(&array.shape, cubemap)?;
                    debug!("created {} {} as {:?}", table.what, index, id);
                    array.id = Some(id);
                }
            }
        }

        let mut first_error = None;
        for update in std::mem::take(&mut self.updates) {
            match update {
                PendingUpdate::Storage { cubemap, array } => {
                    let table = self.table(cubemap);
                    let record = &table.arrays[array as usize];
                    let faces = if cubemap { CUBE_FACES } else { 1 };
                    if let Some(id) = record.id {
                        device.allocate_storage(id, &record.shape, table.capacity as u32 * faces);
                    }
                }
                PendingUpdate::Pixels { handle, image } => {
                    let record = &self.table(handle.is_cubemap()).arrays[handle.array as usize];
                    let Some(id) = record.id else {
                        warn!("dropping update for {handle:?}: array has no native object");
                        continue;
                    };
                    let faces = image.faces.len() as u32;
                    for (face, pixels) in image.faces.iter().enumerate() {
                        let layer = handle.layer as u32 * faces + face as u32;
                        if let Err(e) = device.upload_layer(id, &record.shape, layer, image.mip, pixels) {
                            error!("texture upload for {handle:?} failed: {e}");
                            first_error.get_or_insert(e);
                        }
                    }
                    if image.mip == 0 && handle.flags.contains(TextureFlags::GEN_MIPMAPS) {
                        device.generate_mipmaps(id);
                    }
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn array(&self, handle: TextureHandle) -> &TextureArray {
        &self.table(handle.is_cubemap()).arrays[handle.array as usize]
    }

    pub fn shape(&self, handle: TextureHandle) -> TextureShape {
        self.array(handle).shape
    }

    /// Native array object backing `handle`, once synced.
    pub fn native_id(&self, handle: TextureHandle) -> Option<ResourceId> {
        self.array(handle).id
    }

    pub fn pending_updates(&self) -> usize {
        self.updates.len()
    }

    pub fn arrays(&self, cubemap: bool) -> impl Iterator<Item = ArrayInfo> + '_ {
        self.table(cubemap).arrays.iter().map(move |array| ArrayInfo {
            shape: array.shape,
            cubemap,
            live_layers: array.live_layers(),
            id: array.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCall, HeadlessDevice};

    fn rgba(size: u32) -> TextureShape {
        TextureShape::new(TextureFormat::Rgba8, size, size, 1)
    }

    fn small_config() -> CoreConfig {
        CoreConfig {
            tex_array_layers: 4,
            max_tex_arrays: 2,
            cubemap_array_layers: 2,
            max_cubemap_arrays: 1,
            loader_threads: 1,
        }
    }

    fn creates(device: &DeviceThread<HeadlessDevice>) -> usize {
        device
            .get()
            .count(|c| matches!(c, DeviceCall::CreateTextureArray { .. }))
    }

    #[test]
    fn same_shape_shares_one_array() {
        let mut textures = TextureAllocator::default();
        let mut device = DeviceThread::new(HeadlessDevice::new());

        let handles: Vec<_> = (0..9)
            .map(|_| textures.alloc(rgba(256), TextureFlags::empty()).unwrap())
            .collect();
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.array, 0);
            assert_eq!(handle.layer as usize, i);
        }

        textures.sync(&mut device).unwrap();
        assert_eq!(creates(&device), 1);
        assert_eq!(
            device.get().calls()[1],
            DeviceCall::AllocateStorage {
                id: ResourceId(1),
                layers: 256
            }
        );
        assert_eq!(textures.arrays(false).next().unwrap().live_layers, 9);
    }

    #[test]
    fn new_shape_gets_its_own_array() {
        let mut textures = TextureAllocator::default();
        let a = textures.alloc(rgba(64), TextureFlags::empty()).unwrap();
        let b = textures.alloc(rgba(128), TextureFlags::empty()).unwrap();
        let c = textures
            .alloc(TextureShape::new(TextureFormat::Rgb8, 64, 64, 1), TextureFlags::empty())
            .unwrap();
        assert_eq!((a.array, a.layer), (0, 0));
        assert_eq!((b.array, b.layer), (1, 0));
        assert_eq!((c.array, c.layer), (2, 0));
    }

    #[test]
    fn full_array_spills_into_a_second_one() {
        let mut textures = TextureAllocator::new(&small_config());
        let handles: Vec<_> = (0..5)
            .map(|_| textures.alloc(rgba(8), TextureFlags::empty()).unwrap())
            .collect();
        assert!(handles[..4].iter().all(|h| h.array == 0));
        assert_eq!((handles[4].array, handles[4].layer), (1, 0));
    }

    #[test]
    fn table_exhaustion_is_an_error() {
        let mut textures = TextureAllocator::new(&small_config());
        textures.alloc(rgba(8), TextureFlags::empty()).unwrap();
        textures.alloc(rgba(16), TextureFlags::empty()).unwrap();
        let err = textures.alloc(rgba(32), TextureFlags::empty()).unwrap_err();
        assert!(matches!(err, CoreError::OutOfCapacity { limit: 2, .. }));
    }

    #[test]
    fn sync_uploads_in_submission_order() {
        let mut textures = TextureAllocator::default();
        let mut device = DeviceThread::new(HeadlessDevice::new());
        let shape = TextureShape::new(TextureFormat::Rgba8, 4, 4, 2);

        let a = textures.alloc(shape, TextureFlags::empty()).unwrap();
        let b = textures.alloc(shape, TextureFlags::empty()).unwrap();
        textures.update(b, TextureImage::new(0, vec![0; 64]));
        textures.update(a, TextureImage::new(1, vec![0; 16]));
        assert_eq!(textures.pending_updates(), 3);

        textures.sync(&mut device).unwrap();
        assert_eq!(textures.pending_updates(), 0);
        let id = ResourceId(1);
        assert_eq!(
            device.get().calls(),
            &[
                DeviceCall::CreateTextureArray {
                    id,
                    shape,
                    cubemap: false
                },
                DeviceCall::AllocateStorage { id, layers: 256 },
                DeviceCall::UploadLayer {
                    id,
                    layer: 1,
                    mip: 0,
                    bytes: 64
                },
                DeviceCall::UploadLayer {
                    id,
                    layer: 0,
                    mip: 1,
                    bytes: 16
                },
            ]
        );
    }

    #[test]
    fn sync_with_empty_queue_is_a_no_op() {
        let mut textures = TextureAllocator::default();
        let mut device = DeviceThread::new(HeadlessDevice::new());
        textures.alloc(rgba(4), TextureFlags::empty()).unwrap();
        textures.sync(&mut device).unwrap();
        let calls = device.get().calls().len();

        textures.sync(&mut device).unwrap();
        assert_eq!(device.get().calls().len(), calls);
    }

    #[test]
    fn cubemaps_use_six_layers_each() {
        let mut textures = TextureAllocator::new(&small_config());
        let mut device = DeviceThread::new(HeadlessDevice::new());
        let shape = TextureShape::new(TextureFormat::Rgb16F, 2, 2, 1);

        textures.alloc(shape, TextureFlags::CUBEMAP).unwrap();
        let second = textures.alloc(shape, TextureFlags::CUBEMAP).unwrap();
        assert_eq!(second.layer, 1);
        let face = vec![0u8; 2 * 2 * 6];
        textures.update(second, TextureImage::cube(0, std::array::from_fn(|_| face.clone())));
        textures.sync(&mut device).unwrap();

        let calls = device.get().calls();
        assert!(matches!(
            calls[0],
            DeviceCall::CreateTextureArray { cubemap: true, .. }
        ));
        assert!(matches!(calls[1], DeviceCall::AllocateStorage { layers: 12, .. }));
        let layers: Vec<u32> = calls
            .iter()
            .filter_map(|c| match c {
                DeviceCall::UploadLayer { layer, .. } => Some(*layer),
                _ => None,
            })
            .collect();
        assert_eq!(layers, vec![6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn released_layer_is_reused() {
        let mut textures = TextureAllocator::default();
        let handles: Vec<_> = (0..4)
            .map(|_| textures.alloc(rgba(4), TextureFlags::empty()).unwrap())
            .collect();
        textures.release(handles[2]);
        let again = textures.alloc(rgba(4), TextureFlags::empty()).unwrap();
        assert_eq!(again, handles[2]);
        let next = textures.alloc(rgba(4), TextureFlags::empty()).unwrap();
        assert_eq!(next.layer, 4);
    }

    #[test]
    fn empty_array_is_recycled_for_a_new_shape() {
        let mut textures = TextureAllocator::new(&CoreConfig {
            max_tex_arrays: 1,
            ..small_config()
        });
        let mut device = DeviceThread::new(HeadlessDevice::new());

        let old = textures.alloc(rgba(8), TextureFlags::empty()).unwrap();
        textures.sync(&mut device).unwrap();
        let old_id = textures.native_id(old).unwrap();
        textures.release(old);

        let new = textures.alloc(rgba(16), TextureFlags::empty()).unwrap();
        assert_eq!((new.array, new.layer), (0, 0));
        assert_eq!(textures.native_id(new), None);

        device.get_mut().clear();
        textures.sync(&mut device).unwrap();
        let calls = device.get().calls();
        assert_eq!(calls[0], DeviceCall::ReleaseTextureArray { id: old_id });
        assert!(matches!(calls[1], DeviceCall::CreateTextureArray { shape, .. } if shape == rgba(16)));
        assert_eq!(creates(&device), 1);
    }

    #[test]
    #[should_panic(expected = "releasing a free texture layer")]
    fn double_release_panics() {
        let mut textures = TextureAllocator::default();
        let h = textures.alloc(rgba(4), TextureFlags::empty()).unwrap();
        textures.release(h);
        textures.release(h);
    }

    #[test]
    fn gen_mipmaps_follows_base_level_upload() {
        let mut textures = TextureAllocator::default();
        let mut device = DeviceThread::new(HeadlessDevice::new());
        let shape = TextureShape::new(TextureFormat::R8, 4, 4, 3);
        let h = textures.alloc(shape, TextureFlags::GEN_MIPMAPS).unwrap();
        textures.update(h, TextureImage::new(0, vec![0; 16]));
        textures.sync(&mut device).unwrap();
        assert_eq!(
            device.get().calls().last(),
            Some(&DeviceCall::GenerateMipmaps { id: ResourceId(1) })
        );
    }

    #[test]
    fn load_decodes_then_queues_one_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("white.png");
        image::RgbaImage::from_pixel(4, 2, image::Rgba([255; 4])).save(&path).unwrap();

        let mut textures = TextureAllocator::default();
        let handle = textures
            .load(&path, TextureFormat::Rgb8, 1, TextureFlags::FLIP_VERTICALLY)
            .unwrap();
        assert_eq!(textures.shape(handle), TextureShape::new(TextureFormat::Rgb8, 4, 2, 1));
        // storage + pixels
        assert_eq!(textures.pending_updates(), 2);

        let mut device = DeviceThread::new(HeadlessDevice::new());
        textures.sync(&mut device).unwrap();
        assert_eq!(
            device.get().calls().last(),
            Some(&DeviceCall::UploadLayer {
                id: ResourceId(1),
                layer: 0,
                mip: 0,
                bytes: 24
            })
        );
    }

    #[test]
    fn mip_sizes_clamp_to_one() {
        let shape = TextureShape::new(TextureFormat::Rgb16F, 256, 128, 9);
        assert_eq!(shape.mip_size(8), (1, 1));
        assert_eq!(shape.mip_byte_size(1), 128 * 64 * 6);
    }
}
