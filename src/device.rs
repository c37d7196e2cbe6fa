//! The narrow interface between the resource core and a native graphics API.
//!
//! Everything in here runs on the device thread only. [`DeviceThread`] pins a
//! backend to the thread that constructed it.

use std::thread::{self, ThreadId};

use crate::draw::DrawState;
use crate::error::{CoreError, Result};
use crate::sync::VertexAttribs;
use crate::textures::TextureShape;

/// Native object name handed out by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Mesh,
    Pipeline,
    Framebuffer,
}

/// Content re-uploaded whenever a record is dirty.
#[derive(Debug, Clone, Copy)]
pub enum ResourceContent<'a> {
    Mesh {
        vertices: &'a [f32],
        indices: &'a [u32],
        attribs: VertexAttribs,
    },
    Pipeline {
        name: &'a str,
        vertex: &'a str,
        fragment: &'a str,
    },
}

impl ResourceContent<'_> {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceContent::Mesh { .. } => ResourceKind::Mesh,
            ResourceContent::Pipeline { .. } => ResourceKind::Pipeline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attachment {
    Color(u8),
    Depth,
    Stencil,
    DepthStencil,
}

/// A framebuffer target after its texture handle has been resolved to the
/// native array object and layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundTarget {
    pub texture_array: ResourceId,
    pub layer: u32,
    pub attachment: Attachment,
    pub mip_level: u32,
}

/// Render target selected at the start of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassTarget {
    /// Leave whatever target is bound.
    Keep,
    /// The window's default framebuffer.
    Default,
    Framebuffer(ResourceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCall {
    pub mesh: ResourceId,
    pub pipeline: ResourceId,
    pub element_count: u32,
    pub instances: u32,
}

pub trait Device {
    /// Creates one array object able to hold layers of `shape`.
    fn create_texture_array(&mut self, shape: &TextureShape, cubemap: bool) -> Result<ResourceId>;

    /// Allocates immutable storage for `layers` native layers.
    fn allocate_storage(&mut self, id: ResourceId, shape: &TextureShape, layers: u32);

    /// Uploads one native layer of one mip level.
    fn upload_layer(
        &mut self,
        id: ResourceId,
        shape: &TextureShape,
        layer: u32,
        mip: u32,
        pixels: &[u8],
    ) -> Result<()>;

    /// Rebuilds every mip level from level 0.
    fn generate_mipmaps(&mut self, id: ResourceId);

    fn release_texture_array(&mut self, id: ResourceId);

    fn create_resource(&mut self, kind: ResourceKind) -> Result<ResourceId>;

    fn upload_resource_content(&mut self, id: ResourceId, content: ResourceContent<'_>) -> Result<()>;

    fn bind_framebuffer_target(&mut self, framebuffer: ResourceId, slot: usize, target: &BoundTarget);

    /// Detaches whatever texture `slot` left on `attachment`.
    fn unbind_framebuffer_target(&mut self, framebuffer: ResourceId, slot: usize, attachment: Attachment);

    /// Selects the render target and applies clear and fixed-function state.
    fn begin_pass(&mut self, target: PassTarget, state: &DrawState);

    fn draw(&mut self, call: &DrawCall);
}

/// Owns a [`Device`] and checks that every access comes from the thread that
/// created it.
#[derive(Debug)]
pub struct DeviceThread<D> {
    device: D,
    owner: ThreadId,
}

impl<D: Device> DeviceThread<D> {
    /// Binds `device` to the calling thread.
    pub fn new(device: D) -> Self {
        Self {
            device,
            owner: thread::current().id(),
        }
    }

    #[inline]
    fn check_thread(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "graphics device accessed off its owning thread"
        );
    }

    pub fn get(&self) -> &D {
        self.check_thread();
        &self.device
    }

    pub fn get_mut(&mut self) -> &mut D {
        self.check_thread();
        &mut self.device
    }

    pub fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub fn into_inner(self) -> D {
        self.device
    }
}

/// Every call a [`HeadlessDevice`] received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    CreateTextureArray { id: ResourceId, shape: TextureShape, cubemap: bool },
    AllocateStorage { id: ResourceId, layers: u32 },
    UploadLayer { id: ResourceId, layer: u32, mip: u32, bytes: usize },
    GenerateMipmaps { id: ResourceId },
    ReleaseTextureArray { id: ResourceId },
    CreateResource { id: ResourceId, kind: ResourceKind },
    UploadResource { id: ResourceId, kind: ResourceKind },
    BindFramebufferTarget { framebuffer: ResourceId, slot: usize, target: BoundTarget },
    UnbindFramebufferTarget { framebuffer: ResourceId, slot: usize, attachment: Attachment },
    BeginPass { target: PassTarget },
    Draw(DrawCall),
}

/// Backend without a GPU: hands out sequential ids and records calls.
///
/// Used by the `nyas` binary for dry runs and by the tests to observe how
/// often the core reaches the device.
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    next_id: u32,
    calls: Vec<DeviceCall>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &[DeviceCall] {
        &self.calls
    }

    pub fn count(&self, predicate: impl Fn(&DeviceCall) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }

    pub fn clear(&mut self) {
        self.calls.clear();
    }

    fn next_id(&mut self) -> ResourceId {
        self.next_id += 1;
        ResourceId(self.next_id)
    }
}

impl Device for HeadlessDevice {
    fn create_texture_array(&mut self, shape: &TextureShape, cubemap: bool) -> Result<ResourceId> {
        let id = self.next_id();
        self.calls.push(DeviceCall::CreateTextureArray {
            id,
            shape: *shape,
            cubemap,
        });
        Ok(id)
    }

    fn allocate_storage(&mut self, id: ResourceId, _shape: &TextureShape, layers: u32) {
        self.calls.push(DeviceCall::AllocateStorage { id, layers });
    }

    fn upload_layer(
        &mut self,
        id: ResourceId,
        shape: &TextureShape,
        layer: u32,
        mip: u32,
        pixels: &[u8],
    ) -> Result<()> {
        let expected = shape.mip_byte_size(mip);
        if pixels.len() != expected {
            return Err(CoreError::Device(format!(
                "layer {layer} mip {mip}: expected {expected} bytes, got {}",
                pixels.len()
            )));
        }
        self.calls.push(DeviceCall::UploadLayer {
            id,
            layer,
            mip,
            bytes: pixels.len(),
        });
        Ok(())
    }

    fn generate_mipmaps(&mut self, id: ResourceId) {
        self.calls.push(DeviceCall::GenerateMipmaps { id });
    }

    fn release_texture_array(&mut self, id: ResourceId) {
        self.calls.push(DeviceCall::ReleaseTextureArray { id });
    }

    fn create_resource(&mut self, kind: ResourceKind) -> Result<ResourceId> {
        let id = self.next_id();
        self.calls.push(DeviceCall::CreateResource { id, kind });
        Ok(id)
    }

    fn upload_resource_content(&mut self, id: ResourceId, content: ResourceContent<'_>) -> Result<()> {
        self.calls.push(DeviceCall::UploadResource {
            id,
            kind: content.kind(),
        });
        Ok(())
    }

    fn bind_framebuffer_target(&mut self, framebuffer: ResourceId, slot: usize, target: &BoundTarget) {
        self.calls.push(DeviceCall::BindFramebufferTarget {
            framebuffer,
            slot,
            target: *target,
        });
    }

    fn unbind_framebuffer_target(&mut self, framebuffer: ResourceId, slot: usize, attachment: Attachment) {
        self.calls.push(DeviceCall::UnbindFramebufferTarget {
            framebuffer,
            slot,
            attachment,
        });
    }

    fn begin_pass(&mut self, target: PassTarget, _state: &DrawState) {
        self.calls.push(DeviceCall::BeginPass { target });
    }

    fn draw(&mut self, call: &DrawCall) {
        self.calls.push(DeviceCall::Draw(*call));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::textures::TextureFormat;

    #[test]
    fn headless_ids_are_unique() {
        let mut device = HeadlessDevice::new();
        let a = device.create_resource(ResourceKind::Mesh).unwrap();
        let b = device.create_resource(ResourceKind::Pipeline).unwrap();
        let shape = TextureShape::new(TextureFormat::Rgba8, 4, 4, 1);
        let c = device.create_texture_array(&shape, false).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(device.calls().len(), 3);
    }

    #[test]
    fn headless_rejects_wrong_upload_size() {
        let mut device = HeadlessDevice::new();
        let shape = TextureShape::new(TextureFormat::Rgba8, 4, 4, 3);
        let id = device.create_texture_array(&shape, false).unwrap();
        assert!(device.upload_layer(id, &shape, 0, 0, &[0; 64]).is_ok());
        assert!(device.upload_layer(id, &shape, 0, 1, &[0; 16]).is_ok());
        assert!(device.upload_layer(id, &shape, 0, 1, &[0; 64]).is_err());
    }

    #[test]
    fn device_thread_allows_owner() {
        let mut device = DeviceThread::new(HeadlessDevice::new());
        assert!(device.is_owner());
        device.get_mut().clear();
        assert!(device.get().calls().is_empty());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn device_thread_rejects_other_threads() {
        let mut device = DeviceThread::new(HeadlessDevice::new());
        let result = thread::spawn(move || {
            device.get_mut().clear();
        })
        .join();
        assert!(result.is_err());
    }
}
