//! Lazy creation and upload of GPU-backed records.
//!
//! A record starts [`SyncState::Uncreated`]. The first `ensure_created` asks
//! the device for a native object; `ensure_synced` additionally re-uploads the
//! content whenever it changed since the last upload. Records that are never
//! drawn never reach the device.

use std::fs;
use std::path::PathBuf;

use bitflags::bitflags;
use log::{debug, warn};

use crate::codecs::MeshData;
use crate::device::{Attachment, BoundTarget, Device, DeviceThread, ResourceContent, ResourceId, ResourceKind};
use crate::error::{CoreError, Result};
use crate::handles::TextureHandle;
use crate::textures::{TextureAllocator, CUBE_FACES};

pub const MAX_FRAMEBUFFER_TARGETS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Uncreated,
    /// Native object exists and matches the record.
    Clean(ResourceId),
    /// Native object exists but the record changed since the last upload.
    Dirty(ResourceId),
}

impl SyncState {
    pub fn id(self) -> Option<ResourceId> {
        match self {
            SyncState::Uncreated => None,
            SyncState::Clean(id) | SyncState::Dirty(id) => Some(id),
        }
    }

    /// Content changed. An uncreated record stays uncreated; its first sync
    /// uploads anyway.
    pub fn mark_dirty(&mut self) {
        if let SyncState::Clean(id) = *self {
            *self = SyncState::Dirty(id);
        }
    }

    pub fn needs_upload(self) -> bool {
        !matches!(self, SyncState::Clean(_))
    }
}

/// A record mirrored by one native object.
pub trait Synchronize {
    const KIND: ResourceKind;

    fn sync_state(&self) -> SyncState;

    fn sync_state_mut(&mut self) -> &mut SyncState;

    /// Pushes the current content to the native object `id`.
    fn upload<D: Device>(&self, id: ResourceId, device: &mut D, textures: &TextureAllocator) -> Result<()>;

    /// Called once `upload` succeeded, before the record turns clean.
    fn uploaded(&mut self, _textures: &TextureAllocator) {}

    /// Creates the native object on first use. Never creates twice.
    fn ensure_created<D: Device>(&mut self, device: &mut DeviceThread<D>) -> Result<ResourceId> {
        match self.sync_state() {
            SyncState::Clean(id) | SyncState::Dirty(id) => Ok(id),
            SyncState::Uncreated => {
                let id = device.get_mut().create_resource(Self::KIND)?;
                debug!("created {:?} {:?}", Self::KIND, id);
                *self.sync_state_mut() = SyncState::Dirty(id);
                Ok(id)
            }
        }
    }

    /// Creates if needed and uploads if dirty. The record only becomes clean
    /// after a successful upload.
    fn ensure_synced<D: Device>(
        &mut self,
        device: &mut DeviceThread<D>,
        textures: &TextureAllocator,
    ) -> Result<ResourceId> {
        let id = self.ensure_created(device)?;
        if self.sync_state().needs_upload() {
            self.upload(id, device.get_mut(), textures)?;
            self.uploaded(textures);
            *self.sync_state_mut() = SyncState::Clean(id);
        }
        Ok(id)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VertexAttribs: u8 {
        const POSITION = 1;
        const NORMAL = 1 << 1;
        const TANGENT = 1 << 2;
        const BITANGENT = 1 << 3;
        const UV = 1 << 4;
        const COLOR = 1 << 5;
    }
}

impl VertexAttribs {
    /// Float components per attribute, in interleaving order.
    pub const LAYOUT: [(VertexAttribs, usize); 6] = [
        (VertexAttribs::POSITION, 3),
        (VertexAttribs::NORMAL, 3),
        (VertexAttribs::TANGENT, 3),
        (VertexAttribs::BITANGENT, 3),
        (VertexAttribs::UV, 2),
        (VertexAttribs::COLOR, 4),
    ];

    /// Floats per interleaved vertex.
    pub fn stride(self) -> usize {
        Self::LAYOUT
            .iter()
            .filter(|(attrib, _)| self.contains(*attrib))
            .map(|(_, size)| size)
            .sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    state: SyncState,
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
    pub attribs: VertexAttribs,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: MeshData) -> Self {
        let mut mesh = Self::new();
        mesh.set_data(data);
        mesh
    }

    pub fn set_data(&mut self, data: MeshData) {
        self.vertices = data.vertices;
        self.indices = data.indices;
        self.attribs = data.attribs;
        self.state.mark_dirty();
    }

    pub fn element_count(&self) -> usize {
        self.indices.len()
    }

    pub fn state(&self) -> SyncState {
        self.state
    }
}

impl Synchronize for Mesh {
    const KIND: ResourceKind = ResourceKind::Mesh;

    fn sync_state(&self) -> SyncState {
        self.state
    }

    fn sync_state_mut(&mut self) -> &mut SyncState {
        &mut self.state
    }

    fn upload<D: Device>(&self, id: ResourceId, device: &mut D, _textures: &TextureAllocator) -> Result<()> {
        device.upload_resource_content(
            id,
            ResourceContent::Mesh {
                vertices: &self.vertices,
                indices: &self.indices,
                attribs: self.attribs,
            },
        )
    }
}

/// Where a pipeline's stage sources live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineDesc {
    pub name: String,
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    state: SyncState,
    pub desc: PipelineDesc,
    pub vertex_source: String,
    pub fragment_source: String,
}

impl Pipeline {
    pub fn new(desc: PipelineDesc) -> Self {
        Self {
            state: SyncState::Uncreated,
            desc,
            vertex_source: String::new(),
            fragment_source: String::new(),
        }
    }

    /// Replaces the stage sources; the program is rebuilt on next use.
    pub fn set_sources(&mut self, vertex: String, fragment: String) {
        self.vertex_source = vertex;
        self.fragment_source = fragment;
        self.state.mark_dirty();
    }

    /// Re-reads both stage files.
    pub fn reload(&mut self) -> Result<()> {
        let vertex = fs::read_to_string(&self.desc.vertex)?;
        let fragment = fs::read_to_string(&self.desc.fragment)?;
        self.set_sources(vertex, fragment);
        Ok(())
    }

    pub fn state(&self) -> SyncState {
        self.state
    }
}

impl Synchronize for Pipeline {
    const KIND: ResourceKind = ResourceKind::Pipeline;

    fn sync_state(&self) -> SyncState {
        self.state
    }

    fn sync_state_mut(&mut self) -> &mut SyncState {
        &mut self.state
    }

    fn upload<D: Device>(&self, id: ResourceId, device: &mut D, _textures: &TextureAllocator) -> Result<()> {
        device.upload_resource_content(
            id,
            ResourceContent::Pipeline {
                name: &self.desc.name,
                vertex: &self.vertex_source,
                fragment: &self.fragment_source,
            },
        )
    }
}

/// One render target of a framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferTarget {
    pub texture: TextureHandle,
    /// Cubemap face (0..6); ignored for plain textures.
    pub face: u8,
    pub attachment: Attachment,
    pub mip_level: u32,
}

impl FramebufferTarget {
    pub fn new(texture: TextureHandle, attachment: Attachment) -> Self {
        Self {
            texture,
            face: 0,
            attachment,
            mip_level: 0,
        }
    }

    /// Native layer inside the texture's array object.
    pub fn native_layer(&self) -> u32 {
        if self.texture.is_cubemap() {
            self.texture.layer as u32 * CUBE_FACES + self.face as u32
        } else {
            self.texture.layer as u32
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Framebuffer {
    state: SyncState,
    targets: [Option<FramebufferTarget>; MAX_FRAMEBUFFER_TARGETS],
    /// Attachment each slot holds on the native object as of the last upload.
    attached: [Option<Attachment>; MAX_FRAMEBUFFER_TARGETS],
    /// Native array each slot was bound to at the last upload.
    bound_arrays: [Option<ResourceId>; MAX_FRAMEBUFFER_TARGETS],
}

impl Framebuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebinds `slot`; takes effect the next time the framebuffer is used.
    pub fn set_target(&mut self, slot: usize, target: Option<FramebufferTarget>) {
        self.targets[slot] = target;
        self.state.mark_dirty();
    }

    pub fn targets(&self) -> &[Option<FramebufferTarget>] {
        &self.targets
    }

    /// Marks the record dirty if a target's texture now lives in a different
    /// native array than the one bound, which happens when an attached
    /// texture was released and its array recycled.
    pub fn revalidate(&mut self, textures: &TextureAllocator) {
        if !matches!(self.state, SyncState::Clean(_)) {
            return;
        }
        for (slot, (target, bound)) in self.targets.iter().zip(&self.bound_arrays).enumerate() {
            let Some(target) = target else { continue };
            let current = textures.native_id(target.texture);
            if current != *bound {
                warn!(
                    "framebuffer slot {slot}: texture {:?} moved from {bound:?} to {current:?}; was it released while attached?",
                    target.texture
                );
                self.state.mark_dirty();
                return;
            }
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }
}

impl Synchronize for Framebuffer {
    const KIND: ResourceKind = ResourceKind::Framebuffer;

    fn sync_state(&self) -> SyncState {
        self.state
    }

    fn sync_state_mut(&mut self) -> &mut SyncState {
        &mut self.state
    }

    fn upload<D: Device>(&self, id: ResourceId, device: &mut D, textures: &TextureAllocator) -> Result<()> {
        // Detach first so a point moved to another slot is not cleared after its rebind.
        for (slot, (attached, target)) in self.attached.iter().zip(&self.targets).enumerate() {
            if let Some(attachment) = *attached {
                if target.map(|t| t.attachment) != Some(attachment) {
                    device.unbind_framebuffer_target(id, slot, attachment);
                }
            }
        }
        for (slot, target) in self.targets.iter().enumerate() {
            let Some(target) = target else { continue };
            let texture_array = textures.native_id(target.texture).ok_or_else(|| {
                CoreError::Device(format!(
                    "framebuffer target {:?} has no native texture yet",
                    target.texture
                ))
            })?;
            device.bind_framebuffer_target(
                id,
                slot,
                &BoundTarget {
                    texture_array,
                    layer: target.native_layer(),
                    attachment: target.attachment,
                    mip_level: target.mip_level,
                },
            );
        }
        Ok(())
    }

    fn uploaded(&mut self, textures: &TextureAllocator) {
        self.attached = self.targets.map(|target| target.map(|t| t.attachment));
        self.bound_arrays = self
            .targets
            .map(|target| target.and_then(|t| textures.native_id(t.texture)));
    }
}
