use crate::textures::TextureFlags;

/// Index type stored in a [`crate::Pool`].
pub trait PoolHandle: Copy {
    fn from_index(index: usize) -> Self;
    fn index(self) -> usize;
}

macro_rules! pool_handle {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub usize);

            impl PoolHandle for $name {
                #[inline]
                fn from_index(index: usize) -> Self {
                    Self(index)
                }

                #[inline]
                fn index(self) -> usize {
                    self.0
                }
            }
        )*
    };
}

pool_handle! {
    MeshHandle,
    /// Shader program / pipeline record.
    PipelineHandle,
    FramebufferHandle,
}

/// A layer inside one of the allocator's array objects.
///
/// For cubemaps `layer` counts logical cubemaps; the native layer of face `f`
/// is `layer * 6 + f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle {
    pub array: u16,
    pub layer: u16,
    pub flags: TextureFlags,
}

impl TextureHandle {
    #[inline]
    pub fn is_cubemap(&self) -> bool {
        self.flags.contains(TextureFlags::CUBEMAP)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetHandle {
    Texture(TextureHandle),
    Mesh(MeshHandle),
    Pipeline(PipelineHandle),
    Framebuffer(FramebufferHandle),
}

impl AssetHandle {
    pub fn as_mesh_handle(&self) -> Option<MeshHandle> {
        if let AssetHandle::Mesh(handle) = *self {
            Some(handle)
        } else {
            None
        }
    }

    pub fn as_texture_handle(&self) -> Option<TextureHandle> {
        if let AssetHandle::Texture(handle) = *self {
            Some(handle)
        } else {
            None
        }
    }

    pub fn as_pipeline_handle(&self) -> Option<PipelineHandle> {
        if let AssetHandle::Pipeline(handle) = *self {
            Some(handle)
        } else {
            None
        }
    }

    pub fn as_framebuffer_handle(&self) -> Option<FramebufferHandle> {
        if let AssetHandle::Framebuffer(handle) = *self {
            Some(handle)
        } else {
            None
        }
    }
}
