//! Resource core of the nyas renderer: handle pools, texture array packing,
//! lazy GPU synchronization and batched asset loading.

pub mod codecs;
pub mod config;
pub mod context;
pub mod device;
pub mod draw;
pub mod error;
pub mod handles;
pub mod loader;
pub mod opengl;
pub mod pool;
pub mod scheduler;
pub mod sync;
pub mod textures;

pub use config::CoreConfig;
pub use context::{EnvironmentHandles, ResourceContext};
pub use device::{Device, DeviceThread, HeadlessDevice, ResourceId};
pub use draw::{DrawBatch, DrawCommand, DrawState, DrawUnit, RenderTarget};
pub use error::{CoreError, Result};
pub use handles::{AssetHandle, FramebufferHandle, MeshHandle, PipelineHandle, PoolHandle, TextureHandle};
pub use loader::{AssetLoader, LoadReport, LoaderJob, Pending};
pub use pool::Pool;
pub use scheduler::Scheduler;
pub use sync::{PipelineDesc, SyncState, Synchronize};
pub use textures::{TextureAllocator, TextureFlags, TextureFormat, TextureImage, TextureShape};
