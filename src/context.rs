//! The resource tables of one renderer instance.

use std::path::Path;

use log::debug;

use crate::codecs::{self, EnvTexture, EnvironmentData, MeshData};
use crate::config::CoreConfig;
use crate::error::Result;
use crate::handles::{FramebufferHandle, MeshHandle, PipelineHandle, TextureHandle};
use crate::pool::Pool;
use crate::sync::{Framebuffer, FramebufferTarget, Mesh, Pipeline, PipelineDesc};
use crate::textures::TextureAllocator;

/// Textures produced from one `.env` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentHandles {
    pub sky: TextureHandle,
    pub irradiance: TextureHandle,
    pub prefilter: TextureHandle,
    pub lut: TextureHandle,
}

/// Owns every pool and the texture allocator. Callers pass it around by
/// reference; there is no global instance.
#[derive(Debug)]
pub struct ResourceContext {
    pub meshes: Pool<MeshHandle, Mesh>,
    pub pipelines: Pool<PipelineHandle, Pipeline>,
    pub framebuffers: Pool<FramebufferHandle, Framebuffer>,
    pub textures: TextureAllocator,
    config: CoreConfig,
}

impl Default for ResourceContext {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

impl ResourceContext {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            meshes: Pool::new(),
            pipelines: Pool::new(),
            framebuffers: Pool::new(),
            textures: TextureAllocator::new(&config),
            config,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// An empty mesh record; give it geometry before drawing it.
    pub fn create_mesh(&mut self) -> MeshHandle {
        self.meshes.add(Mesh::new())
    }

    pub fn add_mesh(&mut self, data: MeshData) -> MeshHandle {
        self.meshes.add(Mesh::from_data(data))
    }

    pub fn load_mesh(&mut self, path: impl AsRef<Path>) -> Result<MeshHandle> {
        let data = codecs::decode_mesh(path.as_ref())?;
        Ok(self.add_mesh(data))
    }

    /// Replaces the geometry of `mesh` with the file at `path`. On failure
    /// the record keeps its previous geometry.
    pub fn reload_mesh(&mut self, mesh: MeshHandle, path: impl AsRef<Path>) -> Result<()> {
        let data = codecs::decode_mesh(path.as_ref())?;
        self.meshes[mesh].set_data(data);
        debug!("reloaded {mesh:?} from {}", path.as_ref().display());
        Ok(())
    }

    /// Reads both stage sources and registers the pipeline. Nothing is
    /// compiled until it is first drawn with.
    pub fn create_pipeline(&mut self, desc: PipelineDesc) -> Result<PipelineHandle> {
        let mut pipeline = Pipeline::new(desc);
        pipeline.reload()?;
        Ok(self.pipelines.add(pipeline))
    }

    pub fn reload_pipeline(&mut self, pipeline: PipelineHandle) -> Result<()> {
        self.pipelines[pipeline].reload()
    }

    pub fn create_framebuffer(&mut self) -> FramebufferHandle {
        self.framebuffers.add(Framebuffer::new())
    }

    pub fn set_framebuffer_target(
        &mut self,
        framebuffer: FramebufferHandle,
        slot: usize,
        target: Option<FramebufferTarget>,
    ) {
        self.framebuffers[framebuffer].set_target(slot, target);
    }

    /// Allocates the four environment textures and queues all their levels.
    pub fn add_environment(&mut self, env: EnvironmentData) -> Result<EnvironmentHandles> {
        Ok(EnvironmentHandles {
            sky: self.add_env_texture(env.sky)?,
            irradiance: self.add_env_texture(env.irradiance)?,
            prefilter: self.add_env_texture(env.prefilter)?,
            lut: self.add_env_texture(env.lut)?,
        })
    }

    fn add_env_texture(&mut self, texture: EnvTexture) -> Result<TextureHandle> {
        let handle = self.textures.alloc(texture.shape, texture.flags())?;
        for image in texture.images {
            self.textures.update(handle, image);
        }
        Ok(handle)
    }
}
