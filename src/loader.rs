//! Batched asset loading.
//!
//! Requests are split into two lists. Async requests (textures, meshes,
//! environment maps) only decode files and may run on any worker. Sequential
//! requests (pipelines and user jobs that need the context) run inline on the
//! calling thread while the workers decode. Decoded data comes back over a
//! channel and is turned into records after the workers are done, so worker
//! threads never touch a pool.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info};

use crate::codecs::{self, EnvLayout, EnvironmentData, MeshData};
use crate::context::{EnvironmentHandles, ResourceContext};
use crate::error::{CoreError, Result};
use crate::handles::{AssetHandle, MeshHandle, PipelineHandle, TextureHandle};
use crate::scheduler::{Job, Scheduler};
use crate::sync::PipelineDesc;
use crate::textures::{TextureFlags, TextureFormat, TextureImage, TextureShape};

/// A handle that becomes available once [`AssetLoader::load`] has returned.
///
/// Stays empty if the asset failed to load.
#[derive(Debug)]
pub struct Pending<T>(Arc<OnceLock<T>>);

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Copy> Pending<T> {
    fn new() -> Self {
        Self(Arc::new(OnceLock::new()))
    }

    pub fn get(&self) -> Option<T> {
        self.0.get().copied()
    }

    pub fn is_ready(&self) -> bool {
        self.0.get().is_some()
    }

    fn fill(&self, value: T) {
        let _ = self.0.set(value);
    }
}

pub type SequentialJob = Box<dyn FnOnce(&mut ResourceContext) -> Result<()>>;

/// User work added with [`AssetLoader::add_job`].
pub enum LoaderJob {
    /// Runs on the thread calling `load`, with the context.
    Sequential(SequentialJob),
    /// Runs on a worker; must not touch the context.
    Async(Job),
}

type SequentialStep = Box<dyn FnOnce(&mut ResourceContext) -> Result<Option<AssetHandle>>>;

enum Payload {
    Texture {
        slot: Pending<TextureHandle>,
        shape: TextureShape,
        flags: TextureFlags,
        image: TextureImage,
    },
    Mesh {
        slot: Pending<MeshHandle>,
        data: MeshData,
    },
    Environment {
        slot: Pending<EnvironmentHandles>,
        data: EnvironmentData,
    },
}

struct Decoded {
    /// Submission order; results are applied in this order.
    index: usize,
    path: PathBuf,
    result: Result<Payload>,
}

/// Summary of one [`AssetLoader::load`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<AssetHandle>,
    pub failed: usize,
}

pub struct AssetLoader {
    sequential: Vec<SequentialStep>,
    asynchronous: Vec<Job>,
    result_tx: Sender<Decoded>,
    result_rx: Receiver<Decoded>,
    next_index: usize,
    env_layout: EnvLayout,
}

impl Default for AssetLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetLoader {
    pub fn new() -> Self {
        let (result_tx, result_rx) = unbounded();
        Self {
            sequential: Vec::new(),
            asynchronous: Vec::new(),
            result_tx,
            result_rx,
            next_index: 0,
            env_layout: EnvLayout::default(),
        }
    }

    /// Overrides the texture sizes expected in `.env` files.
    pub fn with_env_layout(mut self, layout: EnvLayout) -> Self {
        self.env_layout = layout;
        self
    }

    /// Requests queued and not yet loaded.
    pub fn queued(&self) -> usize {
        self.sequential.len() + self.asynchronous.len()
    }

    fn push_decode<F>(&mut self, path: PathBuf, decode: F)
    where
        F: FnOnce(&Path) -> Result<Payload> + Send + 'static,
    {
        let index = self.next_index;
        self.next_index += 1;
        let tx = self.result_tx.clone();
        self.asynchronous.push(Box::new(move || {
            debug!("decoding {}", path.display());
            let result = panic::catch_unwind(AssertUnwindSafe(|| decode(&path)))
                .unwrap_or_else(|payload| Err(CoreError::DecodePanic(panic_message(payload.as_ref()))));
            let _ = tx.send(Decoded { index, path, result });
        }));
    }

    pub fn add_mesh(&mut self, path: impl Into<PathBuf>) -> Pending<MeshHandle> {
        let slot = Pending::new();
        let ticket = slot.clone();
        self.push_decode(path.into(), move |path| {
            Ok(Payload::Mesh {
                slot,
                data: codecs::decode_mesh(path)?,
            })
        });
        ticket
    }

    /// Loads an image as a single-level texture of `format`. `levels` sizes
    /// the mip chain; combine with [`TextureFlags::GEN_MIPMAPS`] to fill it.
    pub fn add_tex(
        &mut self,
        path: impl Into<PathBuf>,
        format: TextureFormat,
        levels: u32,
        flags: TextureFlags,
    ) -> Pending<TextureHandle> {
        let slot = Pending::new();
        let ticket = slot.clone();
        self.push_decode(path.into(), move |path| {
            let image = codecs::decode_image(path, format, flags)?;
            Ok(Payload::Texture {
                slot,
                shape: TextureShape::new(format, image.width, image.height, levels.max(1)),
                flags,
                image: TextureImage::new(0, image.pixels),
            })
        });
        ticket
    }

    pub fn add_env(&mut self, path: impl Into<PathBuf>) -> Pending<EnvironmentHandles> {
        let slot = Pending::new();
        let ticket = slot.clone();
        let layout = self.env_layout;
        self.push_decode(path.into(), move |path| {
            Ok(Payload::Environment {
                slot,
                data: codecs::decode_env(path, &layout)?,
            })
        });
        ticket
    }

    /// Pipelines are registered on the loading thread.
    pub fn add_shader(&mut self, desc: PipelineDesc) -> Pending<PipelineHandle> {
        let slot = Pending::new();
        let ticket = slot.clone();
        self.sequential.push(Box::new(move |ctx| {
            let name = desc.name.clone();
            let handle = ctx.create_pipeline(desc).map_err(|e| {
                error!("failed to load pipeline `{name}`: {e}");
                e
            })?;
            slot.fill(handle);
            Ok(Some(AssetHandle::Pipeline(handle)))
        }));
        ticket
    }

    pub fn add_job(&mut self, job: LoaderJob) {
        match job {
            LoaderJob::Sequential(job) => self.sequential.push(Box::new(move |ctx| {
                job(ctx).map(|()| None).map_err(|e| {
                    error!("sequential loader job failed: {e}");
                    e
                })
            })),
            LoaderJob::Async(job) => self.asynchronous.push(job),
        }
    }

    /// Runs every queued request with `threads` workers and fills the
    /// tickets. Failures are logged and counted, never fatal; only a failure
    /// to start the workers is returned as an error.
    ///
    /// Texture data is queued on `ctx.textures`; it reaches the device at the
    /// next sync.
    pub fn load(&mut self, ctx: &mut ResourceContext, threads: usize) -> Result<LoadReport> {
        let asynchronous = std::mem::take(&mut self.asynchronous);
        let sequential = std::mem::take(&mut self.sequential);
        let mut report = LoadReport::default();
        info!(
            "loading {} async and {} sequential request(s) on {threads} thread(s)",
            asynchronous.len(),
            sequential.len()
        );

        {
            let scheduler = Scheduler::new(threads)?;
            for job in asynchronous {
                scheduler.submit_boxed(job);
            }
            for step in sequential {
                match step(ctx) {
                    Ok(Some(handle)) => report.loaded.push(handle),
                    Ok(None) => {}
                    Err(_) => report.failed += 1,
                }
            }
            scheduler.wait();
        }

        let mut decoded: Vec<Decoded> = self.result_rx.try_iter().collect();
        decoded.sort_by_key(|d| d.index);
        for Decoded { path, result, .. } in decoded {
            match result.and_then(|payload| apply(ctx, payload, &path, &mut report.loaded)) {
                Ok(()) => {}
                Err(e) => {
                    error!("failed to load {}: {e}", path.display());
                    report.failed += 1;
                }
            }
        }

        info!("loaded {} asset(s), {} failure(s)", report.loaded.len(), report.failed);
        Ok(report)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

fn apply(
    ctx: &mut ResourceContext,
    payload: Payload,
    path: &Path,
    loaded: &mut Vec<AssetHandle>,
) -> Result<()> {
    match payload {
        Payload::Texture {
            slot,
            shape,
            flags,
            image,
        } => {
            let handle = ctx.textures.alloc(shape, flags)?;
            ctx.textures.update(handle, image);
            slot.fill(handle);
            loaded.push(AssetHandle::Texture(handle));
        }
        Payload::Mesh { slot, data } => {
            if data.indices.is_empty() {
                return Err(CoreError::MalformedMesh {
                    path: path.to_path_buf(),
                    reason: "no elements".into(),
                });
            }
            let handle = ctx.add_mesh(data);
            slot.fill(handle);
            loaded.push(AssetHandle::Mesh(handle));
        }
        Payload::Environment { slot, data } => {
            let handles = ctx.add_environment(data)?;
            slot.fill(handles);
            loaded.extend(
                [handles.sky, handles.irradiance, handles.prefilter, handles.lut].map(AssetHandle::Texture),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn empty_loader_reports_nothing() {
        let mut ctx = ResourceContext::default();
        let report = AssetLoader::new().load(&mut ctx, 2).unwrap();
        assert_eq!(report, LoadReport::default());
    }

    #[test]
    fn missing_files_are_counted_not_fatal() {
        let mut ctx = ResourceContext::default();
        let mut loader = AssetLoader::new();
        let tex = loader.add_tex("/nonexistent/a.png", TextureFormat::Rgba8, 1, TextureFlags::empty());
        let mesh = loader.add_mesh("/nonexistent/a.msh");
        let env = loader.add_env("/nonexistent/a.env");
        let shader = loader.add_shader(PipelineDesc {
            name: "missing".into(),
            vertex: "/nonexistent/a.vert".into(),
            fragment: "/nonexistent/a.frag".into(),
        });

        let report = loader.load(&mut ctx, 2).unwrap();
        assert_eq!(report.failed, 4);
        assert!(report.loaded.is_empty());
        assert!(!tex.is_ready() && !mesh.is_ready() && !env.is_ready() && !shader.is_ready());
        assert_eq!(loader.queued(), 0);
    }

    #[test]
    fn user_jobs_run_in_both_lists() {
        let mut ctx = ResourceContext::default();
        let mut loader = AssetLoader::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            loader.add_job(LoaderJob::Async(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })));
        }
        loader.add_job(LoaderJob::Sequential(Box::new(|ctx| {
            ctx.add_mesh(MeshData::quad());
            Ok(())
        })));

        let report = loader.load(&mut ctx, 3).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert_eq!(ctx.meshes.count(), 1);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn panicking_decoder_is_counted_as_failure() {
        let mut ctx = ResourceContext::default();
        let mut loader = AssetLoader::new();
        loader.push_decode("boom.msh".into(), |_| panic!("bad accessor"));
        let good = Pending::new();
        let slot = good.clone();
        loader.push_decode("quad.msh".into(), move |_| {
            Ok(Payload::Mesh {
                slot,
                data: MeshData::quad(),
            })
        });

        let report = loader.load(&mut ctx, 2).unwrap();
        assert_eq!(report.failed, 1);
        assert!(good.is_ready());
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&3u8), "non-string panic payload");
    }

    #[test]
    fn pending_is_shared_between_clones() {
        let a = Pending::<u32>::new();
        let b = a.clone();
        assert_eq!(b.get(), None);
        a.fill(3);
        a.fill(4);
        assert_eq!(b.get(), Some(3));
    }
}
