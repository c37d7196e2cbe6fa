//! Per-frame draw submission.
//!
//! A [`DrawBatch`] only stores handles. `submit` is where lazy
//! synchronization happens: textures first, then every framebuffer, mesh and
//! pipeline the batch references, right before the draw that needs it.

use bitflags::bitflags;
use log::trace;

use crate::context::ResourceContext;
use crate::device::{Device, DeviceThread, DrawCall, PassTarget};
use crate::error::Result;
use crate::handles::{FramebufferHandle, MeshHandle, PipelineHandle};
use crate::sync::Synchronize;

bitflags! {
    /// Fixed-function toggles applied at the start of a pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DrawFlags: u16 {
        const DEPTH_TEST = 1;
        const DEPTH_WRITE = 1 << 1;
        const BLEND = 1 << 2;
        const FACE_CULLING = 1 << 3;
        const SCISSOR_TEST = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClearFlags: u8 {
        const COLOR = 1;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }
}

/// State set before the units of a command are drawn. Flags in neither
/// `enable` nor `disable` keep their previous value.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DrawState {
    pub enable: DrawFlags,
    pub disable: DrawFlags,
    pub clear: ClearFlags,
    pub clear_color: [f32; 4],
    pub viewport: Option<Rect>,
    pub scissor: Option<Rect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderTarget {
    /// Whatever the previous command rendered to.
    #[default]
    Keep,
    Default,
    Framebuffer(FramebufferHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawUnit {
    pub mesh: MeshHandle,
    pub pipeline: PipelineHandle,
    pub instances: u32,
}

impl DrawUnit {
    pub fn new(mesh: MeshHandle, pipeline: PipelineHandle) -> Self {
        Self {
            mesh,
            pipeline,
            instances: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DrawCommand {
    pub target: RenderTarget,
    pub state: DrawState,
    pub units: Vec<DrawUnit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrawStats {
    pub passes: usize,
    pub draws: usize,
    pub instances: u64,
}

#[derive(Debug, Default)]
pub struct DrawBatch {
    commands: Vec<DrawCommand>,
}

impl DrawBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: DrawCommand) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Synchronizes every referenced resource and issues the draws in push
    /// order. The batch is empty afterwards, even on error.
    ///
    /// # Panics
    /// If a unit references a mesh without elements, or any handle is stale.
    pub fn submit<D: Device>(
        &mut self,
        ctx: &mut ResourceContext,
        device: &mut DeviceThread<D>,
    ) -> Result<DrawStats> {
        let commands = std::mem::take(&mut self.commands);
        ctx.textures.sync(device)?;

        let mut stats = DrawStats::default();
        for command in &commands {
            let target = match command.target {
                RenderTarget::Keep => PassTarget::Keep,
                RenderTarget::Default => PassTarget::Default,
                RenderTarget::Framebuffer(fb) => {
                    let framebuffer = &mut ctx.framebuffers[fb];
                    framebuffer.revalidate(&ctx.textures);
                    PassTarget::Framebuffer(framebuffer.ensure_synced(device, &ctx.textures)?)
                }
            };
            device.get_mut().begin_pass(target, &command.state);
            stats.passes += 1;

            for unit in &command.units {
                let mesh = &mut ctx.meshes[unit.mesh];
                assert!(
                    mesh.element_count() > 0,
                    "drawing {:?} which has no elements",
                    unit.mesh
                );
                let element_count = mesh.element_count() as u32;
                let mesh_id = mesh.ensure_synced(device, &ctx.textures)?;
                let pipeline_id = ctx.pipelines[unit.pipeline].ensure_synced(device, &ctx.textures)?;

                trace!("draw {:?} with {:?} x{}", unit.mesh, unit.pipeline, unit.instances);
                device.get_mut().draw(&DrawCall {
                    mesh: mesh_id,
                    pipeline: pipeline_id,
                    element_count,
                    instances: unit.instances,
                });
                stats.draws += 1;
                stats.instances += unit.instances as u64;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::MeshData;
    use crate::device::{DeviceCall, HeadlessDevice, ResourceKind};
    use crate::sync::{Pipeline, PipelineDesc};

    fn pipeline(ctx: &mut ResourceContext) -> PipelineHandle {
        let mut pipeline = Pipeline::new(PipelineDesc {
            name: "flat".into(),
            vertex: "flat.vert".into(),
            fragment: "flat.frag".into(),
        });
        pipeline.set_sources("void main(){}".into(), "void main(){}".into());
        ctx.pipelines.add(pipeline)
    }

    fn one_unit(mesh: MeshHandle, pipeline: PipelineHandle) -> DrawCommand {
        DrawCommand {
            target: RenderTarget::Default,
            state: DrawState::default(),
            units: vec![DrawUnit::new(mesh, pipeline)],
        }
    }

    #[test]
    fn resources_are_created_on_first_draw_only() {
        let mut ctx = ResourceContext::default();
        let mut device = DeviceThread::new(HeadlessDevice::new());
        let mesh = ctx.add_mesh(MeshData::cube());
        let unused = ctx.add_mesh(MeshData::quad());
        let flat = pipeline(&mut ctx);

        let mut batch = DrawBatch::new();
        for _ in 0..3 {
            batch.push(one_unit(mesh, flat));
            let stats = batch.submit(&mut ctx, &mut device).unwrap();
            assert_eq!(stats.draws, 1);
            assert!(batch.is_empty());
        }

        let dev = device.get();
        assert_eq!(dev.count(|c| matches!(c, DeviceCall::CreateResource { kind: ResourceKind::Mesh, .. })), 1);
        assert_eq!(dev.count(|c| matches!(c, DeviceCall::UploadResource { .. })), 2);
        assert_eq!(dev.count(|c| matches!(c, DeviceCall::Draw(_))), 3);
        assert_eq!(ctx.meshes[unused].state().id(), None);
    }

    #[test]
    fn draw_call_carries_element_count_and_instances() {
        let mut ctx = ResourceContext::default();
        let mut device = DeviceThread::new(HeadlessDevice::new());
        let mesh = ctx.add_mesh(MeshData::quad());
        let flat = pipeline(&mut ctx);

        let mut batch = DrawBatch::new();
        batch.push(DrawCommand {
            units: vec![DrawUnit {
                instances: 5,
                ..DrawUnit::new(mesh, flat)
            }],
            ..DrawCommand::default()
        });
        let stats = batch.submit(&mut ctx, &mut device).unwrap();
        assert_eq!(stats.instances, 5);

        let calls = device.get().calls();
        assert_eq!(calls[0], DeviceCall::BeginPass { target: PassTarget::Keep });
        let Some(DeviceCall::Draw(call)) = calls.last() else {
            panic!("last call was not a draw");
        };
        assert_eq!(call.element_count, 6);
        assert_eq!(call.instances, 5);
    }

    #[test]
    fn dirty_mesh_is_reuploaded_before_next_draw() {
        let mut ctx = ResourceContext::default();
        let mut device = DeviceThread::new(HeadlessDevice::new());
        let mesh = ctx.add_mesh(MeshData::quad());
        let flat = pipeline(&mut ctx);
        let mut batch = DrawBatch::new();

        batch.push(one_unit(mesh, flat));
        batch.submit(&mut ctx, &mut device).unwrap();
        ctx.meshes[mesh].set_data(MeshData::cube());
        device.get_mut().clear();

        batch.push(one_unit(mesh, flat));
        batch.submit(&mut ctx, &mut device).unwrap();
        let calls = device.get().calls();
        assert!(matches!(calls[1], DeviceCall::UploadResource { kind: ResourceKind::Mesh, .. }));
        let DeviceCall::Draw(call) = calls[2] else {
            panic!("expected draw after upload");
        };
        assert_eq!(call.element_count, 36);
    }

    #[test]
    #[should_panic(expected = "has no elements")]
    fn empty_mesh_draw_panics() {
        let mut ctx = ResourceContext::default();
        let mut device = DeviceThread::new(HeadlessDevice::new());
        let mesh = ctx.create_mesh();
        let flat = pipeline(&mut ctx);
        let mut batch = DrawBatch::new();
        batch.push(one_unit(mesh, flat));
        let _ = batch.submit(&mut ctx, &mut device);
    }
}
