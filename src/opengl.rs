//! OpenGL backend on top of `glow`.
//!
//! Texture arrays are bound to consecutive texture units when they are
//! created and stay bound; shaders index them by unit.

use std::collections::HashMap;
use std::sync::Arc;

use glow::*;
use log::{debug, warn};

use crate::device::{Attachment, BoundTarget, Device, DrawCall, PassTarget, ResourceContent, ResourceId, ResourceKind};
use crate::draw::{ClearFlags, DrawFlags, DrawState};
use crate::error::{CoreError, Result};
use crate::sync::VertexAttribs;
use crate::textures::{TextureFormat, TextureShape};

/// Attribute names bound to fixed locations, in `VertexAttribs::LAYOUT` order.
pub const ATTRIB_NAMES: [&str; 6] = ["a_position", "a_normal", "a_tangent", "a_bitangent", "a_uv", "a_color"];

#[derive(Debug, Clone)]
pub struct Layout {
    pub index: u32,
    pub size: i32,
    pub gl_type: u32,
    pub normalized: bool,
    pub offset: usize,
}

impl Layout {
    pub fn new(index: u32, size: i32, gl_type: u32, normalized: bool, offset: usize) -> Self {
        Self {
            index,
            size,
            gl_type,
            normalized,
            offset,
        }
    }
}

/// Interleaved float layouts for `attribs`, plus the stride in bytes.
pub fn vertex_layouts(attribs: VertexAttribs) -> (Vec<Layout>, i32) {
    let mut layouts = Vec::new();
    let mut offset = 0;
    for (index, (attrib, size)) in VertexAttribs::LAYOUT.iter().enumerate() {
        if attribs.contains(*attrib) {
            layouts.push(Layout::new(index as u32, *size as i32, glow::FLOAT, false, offset));
            offset += size * std::mem::size_of::<f32>();
        }
    }
    (layouts, offset as i32)
}

/// `(internal format, pixel format, pixel type)` of `format`.
pub fn gl_format(format: TextureFormat) -> (u32, u32, u32) {
    match format {
        TextureFormat::R8 => (glow::R8, glow::RED, glow::UNSIGNED_BYTE),
        TextureFormat::Rg8 => (glow::RG8, glow::RG, glow::UNSIGNED_BYTE),
        TextureFormat::Rgb8 => (glow::RGB8, glow::RGB, glow::UNSIGNED_BYTE),
        TextureFormat::Rgba8 => (glow::RGBA8, glow::RGBA, glow::UNSIGNED_BYTE),
        TextureFormat::Srgb8 => (glow::SRGB8, glow::RGB, glow::UNSIGNED_BYTE),
        TextureFormat::R16F => (glow::R16F, glow::RED, glow::HALF_FLOAT),
        TextureFormat::Rg16F => (glow::RG16F, glow::RG, glow::HALF_FLOAT),
        TextureFormat::Rgb16F => (glow::RGB16F, glow::RGB, glow::HALF_FLOAT),
        TextureFormat::Rgba16F => (glow::RGBA16F, glow::RGBA, glow::HALF_FLOAT),
        TextureFormat::R32F => (glow::R32F, glow::RED, glow::FLOAT),
        TextureFormat::Rg32F => (glow::RG32F, glow::RG, glow::FLOAT),
        TextureFormat::Rgb32F => (glow::RGB32F, glow::RGB, glow::FLOAT),
        TextureFormat::Rgba32F => (glow::RGBA32F, glow::RGBA, glow::FLOAT),
        TextureFormat::Depth => (glow::DEPTH_COMPONENT32F, glow::DEPTH_COMPONENT, glow::FLOAT),
        TextureFormat::DepthStencil => (glow::DEPTH24_STENCIL8, glow::DEPTH_STENCIL, glow::UNSIGNED_INT_24_8),
    }
}

fn attachment_point(attachment: Attachment) -> u32 {
    match attachment {
        Attachment::Color(i) => glow::COLOR_ATTACHMENT0 + i as u32,
        Attachment::Depth => glow::DEPTH_ATTACHMENT,
        Attachment::Stencil => glow::STENCIL_ATTACHMENT,
        Attachment::DepthStencil => glow::DEPTH_STENCIL_ATTACHMENT,
    }
}

const CAPABILITIES: [(DrawFlags, u32); 4] = [
    (DrawFlags::DEPTH_TEST, glow::DEPTH_TEST),
    (DrawFlags::BLEND, glow::BLEND),
    (DrawFlags::FACE_CULLING, glow::CULL_FACE),
    (DrawFlags::SCISSOR_TEST, glow::SCISSOR_TEST),
];

#[derive(Debug)]
struct GlTexture {
    texture: NativeTexture,
    target: u32,
    unit: u32,
}

#[derive(Debug)]
struct GlMesh {
    vao: NativeVertexArray,
    vbo: NativeBuffer,
    ebo: NativeBuffer,
}

#[derive(Debug)]
struct GlFramebuffer {
    framebuffer: NativeFramebuffer,
    color_slots: Vec<u32>,
}

fn device_error(what: &str) -> impl FnOnce(String) -> CoreError + '_ {
    move |e| CoreError::Device(format!("{what}: {e}"))
}

/// Texture units, one per live array. Released units are handed out again
/// before fresh ones.
#[derive(Debug)]
struct TextureUnits {
    next: u32,
    free: Vec<u32>,
    limit: u32,
}

impl TextureUnits {
    fn new(limit: u32) -> Self {
        Self {
            next: 0,
            free: Vec::new(),
            limit,
        }
    }

    fn alloc(&mut self) -> Option<u32> {
        if let Some(unit) = self.free.pop() {
            return Some(unit);
        }
        if self.next == self.limit {
            return None;
        }
        self.next += 1;
        Some(self.next - 1)
    }

    fn release(&mut self, unit: u32) {
        self.free.push(unit);
    }
}

pub struct GlDevice {
    gl: Arc<glow::Context>,
    next_id: u32,
    units: TextureUnits,
    textures: HashMap<ResourceId, GlTexture>,
    meshes: HashMap<ResourceId, GlMesh>,
    programs: HashMap<ResourceId, NativeProgram>,
    framebuffers: HashMap<ResourceId, GlFramebuffer>,
}

impl GlDevice {
    pub fn new(gl: Arc<glow::Context>) -> Self {
        let limit = unsafe { gl.get_parameter_i32(glow::MAX_COMBINED_TEXTURE_IMAGE_UNITS) };
        Self {
            units: TextureUnits::new(limit.max(1) as u32),
            gl,
            next_id: 0,
            textures: HashMap::new(),
            meshes: HashMap::new(),
            programs: HashMap::new(),
            framebuffers: HashMap::new(),
        }
    }

    fn next_id(&mut self) -> ResourceId {
        self.next_id += 1;
        ResourceId(self.next_id)
    }

    /// Texture unit the array `id` is bound to.
    pub fn texture_unit(&self, id: ResourceId) -> Option<u32> {
        self.textures.get(&id).map(|t| t.unit)
    }

    unsafe fn compile_stage(&self, stage: u32, source: &str, name: &str) -> Result<NativeShader> {
        let gl = &self.gl;
        let shader = gl.create_shader(stage).map_err(device_error("create shader"))?;
        gl.shader_source(shader, source);
        gl.compile_shader(shader);

        if !gl.get_shader_compile_status(shader) {
            let log = gl.get_shader_info_log(shader);
            gl.delete_shader(shader);
            return Err(CoreError::Device(format!("compiling `{name}`: {log}")));
        }
        Ok(shader)
    }

    unsafe fn link_program(&self, program: NativeProgram, name: &str, vertex: &str, fragment: &str) -> Result<()> {
        let gl = &self.gl;
        let vertex_shader = self.compile_stage(glow::VERTEX_SHADER, vertex, name)?;
        let fragment_shader = match self.compile_stage(glow::FRAGMENT_SHADER, fragment, name) {
            Ok(shader) => shader,
            Err(e) => {
                gl.delete_shader(vertex_shader);
                return Err(e);
            }
        };

        for (index, attrib) in ATTRIB_NAMES.iter().enumerate() {
            gl.bind_attrib_location(program, index as u32, attrib);
        }
        gl.attach_shader(program, vertex_shader);
        gl.attach_shader(program, fragment_shader);
        gl.link_program(program);

        gl.detach_shader(program, vertex_shader);
        gl.detach_shader(program, fragment_shader);
        gl.delete_shader(vertex_shader);
        gl.delete_shader(fragment_shader);

        if !gl.get_program_link_status(program) {
            return Err(CoreError::Device(format!(
                "linking `{name}`: {}",
                gl.get_program_info_log(program)
            )));
        }
        Ok(())
    }

    unsafe fn upload_mesh(&self, mesh: &GlMesh, vertices: &[f32], indices: &[u32], attribs: VertexAttribs) {
        let gl = &self.gl;
        gl.bind_vertex_array(Some(mesh.vao));
        gl.bind_buffer(glow::ARRAY_BUFFER, Some(mesh.vbo));
        gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, bytemuck::cast_slice(vertices), glow::STATIC_DRAW);
        gl.bind_buffer(glow::ELEMENT_ARRAY_BUFFER, Some(mesh.ebo));
        gl.buffer_data_u8_slice(
            glow::ELEMENT_ARRAY_BUFFER,
            bytemuck::cast_slice(indices),
            glow::STATIC_DRAW,
        );

        let (layouts, stride) = vertex_layouts(attribs);
        for index in 0..ATTRIB_NAMES.len() as u32 {
            gl.disable_vertex_attrib_array(index);
        }
        for layout in &layouts {
            gl.vertex_attrib_pointer_f32(
                layout.index,
                layout.size,
                layout.gl_type,
                layout.normalized,
                stride,
                layout.offset as i32,
            );
            gl.enable_vertex_attrib_array(layout.index);
        }
        gl.bind_vertex_array(None);
    }
}

impl Device for GlDevice {
    fn create_texture_array(&mut self, shape: &TextureShape, cubemap: bool) -> Result<ResourceId> {
        let target = if cubemap {
            glow::TEXTURE_CUBE_MAP_ARRAY
        } else {
            glow::TEXTURE_2D_ARRAY
        };
        let unit = self.units.alloc().ok_or_else(|| {
            CoreError::Device(format!("all {} texture units are in use", self.units.limit))
        })?;
        let texture = unsafe {
            let gl = &self.gl;
            let texture = match gl.create_texture() {
                Ok(texture) => texture,
                Err(e) => {
                    self.units.release(unit);
                    return Err(device_error("create texture array")(e));
                }
            };
            gl.active_texture(glow::TEXTURE0 + unit);
            gl.bind_texture(target, Some(texture));

            let min_filter = if shape.levels > 1 {
                glow::LINEAR_MIPMAP_LINEAR
            } else {
                glow::LINEAR
            };
            gl.tex_parameter_i32(target, glow::TEXTURE_MIN_FILTER, min_filter as i32);
            gl.tex_parameter_i32(target, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
            let wrap = if cubemap { glow::CLAMP_TO_EDGE } else { glow::REPEAT };
            gl.tex_parameter_i32(target, glow::TEXTURE_WRAP_S, wrap as i32);
            gl.tex_parameter_i32(target, glow::TEXTURE_WRAP_T, wrap as i32);
            texture
        };
        let id = self.next_id();
        debug!("texture array {id:?} on unit {unit} for {shape:?}");
        self.textures.insert(id, GlTexture { texture, target, unit });
        Ok(id)
    }

    fn allocate_storage(&mut self, id: ResourceId, shape: &TextureShape, layers: u32) {
        let Some(texture) = self.textures.get(&id) else {
            warn!("storage for unknown texture array {id:?}");
            return;
        };
        let (internal, _, _) = gl_format(shape.format);
        unsafe {
            self.gl.bind_texture(texture.target, Some(texture.texture));
            self.gl.tex_storage_3d(
                texture.target,
                shape.levels.max(1) as i32,
                internal,
                shape.width as i32,
                shape.height as i32,
                layers as i32,
            );
        }
    }

    fn upload_layer(
        &mut self,
        id: ResourceId,
        shape: &TextureShape,
        layer: u32,
        mip: u32,
        pixels: &[u8],
    ) -> Result<()> {
        let texture = self
            .textures
            .get(&id)
            .ok_or_else(|| CoreError::Device(format!("upload to unknown texture array {id:?}")))?;
        let expected = shape.mip_byte_size(mip);
        if pixels.len() != expected {
            return Err(CoreError::Device(format!(
                "layer {layer} mip {mip}: expected {expected} bytes, got {}",
                pixels.len()
            )));
        }
        let (width, height) = shape.mip_size(mip);
        let (_, format, ty) = gl_format(shape.format);
        unsafe {
            self.gl.bind_texture(texture.target, Some(texture.texture));
            self.gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
            self.gl.tex_sub_image_3d(
                texture.target,
                mip as i32,
                0,
                0,
                layer as i32,
                width as i32,
                height as i32,
                1,
                format,
                ty,
                glow::PixelUnpackData::Slice(Some(pixels)),
            );
        }
        Ok(())
    }

    fn generate_mipmaps(&mut self, id: ResourceId) {
        if let Some(texture) = self.textures.get(&id) {
            unsafe {
                self.gl.bind_texture(texture.target, Some(texture.texture));
                self.gl.generate_mipmap(texture.target);
            }
        }
    }

    fn release_texture_array(&mut self, id: ResourceId) {
        if let Some(texture) = self.textures.remove(&id) {
            unsafe { self.gl.delete_texture(texture.texture) };
            self.units.release(texture.unit);
        }
    }

    fn create_resource(&mut self, kind: ResourceKind) -> Result<ResourceId> {
        let id = self.next_id();
        unsafe {
            let gl = &self.gl;
            match kind {
                ResourceKind::Mesh => {
                    let vao = gl.create_vertex_array().map_err(device_error("create VAO"))?;
                    let vbo = gl.create_buffer().map_err(device_error("create VBO"))?;
                    let ebo = gl.create_buffer().map_err(device_error("create EBO"))?;
                    self.meshes.insert(id, GlMesh { vao, vbo, ebo });
                }
                ResourceKind::Pipeline => {
                    let program = gl.create_program().map_err(device_error("create program"))?;
                    self.programs.insert(id, program);
                }
                ResourceKind::Framebuffer => {
                    let framebuffer = gl.create_framebuffer().map_err(device_error("create framebuffer"))?;
                    self.framebuffers.insert(
                        id,
                        GlFramebuffer {
                            framebuffer,
                            color_slots: Vec::new(),
                        },
                    );
                }
            }
        }
        Ok(id)
    }

    fn upload_resource_content(&mut self, id: ResourceId, content: ResourceContent<'_>) -> Result<()> {
        match content {
            ResourceContent::Mesh {
                vertices,
                indices,
                attribs,
            } => {
                let mesh = self
                    .meshes
                    .get(&id)
                    .ok_or_else(|| CoreError::Device(format!("unknown mesh {id:?}")))?;
                unsafe { self.upload_mesh(mesh, vertices, indices, attribs) };
                Ok(())
            }
            ResourceContent::Pipeline {
                name,
                vertex,
                fragment,
            } => {
                let program = *self
                    .programs
                    .get(&id)
                    .ok_or_else(|| CoreError::Device(format!("unknown program {id:?}")))?;
                unsafe { self.link_program(program, name, vertex, fragment) }
            }
        }
    }

    fn bind_framebuffer_target(&mut self, framebuffer: ResourceId, slot: usize, target: &BoundTarget) {
        let Some(texture) = self.textures.get(&target.texture_array) else {
            warn!("framebuffer {framebuffer:?} slot {slot}: unknown texture array");
            return;
        };
        let Some(fb) = self.framebuffers.get_mut(&framebuffer) else {
            warn!("unknown framebuffer {framebuffer:?}");
            return;
        };
        let point = attachment_point(target.attachment);
        if let Attachment::Color(_) = target.attachment {
            if !fb.color_slots.contains(&point) {
                fb.color_slots.push(point);
                fb.color_slots.sort_unstable();
            }
        }
        unsafe {
            let gl = &self.gl;
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fb.framebuffer));
            gl.framebuffer_texture_layer(
                glow::FRAMEBUFFER,
                point,
                Some(texture.texture),
                target.mip_level as i32,
                target.layer as i32,
            );
            gl.draw_buffers(&fb.color_slots);
            if gl.check_framebuffer_status(glow::FRAMEBUFFER) != glow::FRAMEBUFFER_COMPLETE {
                debug!("framebuffer {framebuffer:?} incomplete after binding slot {slot}");
            }
        }
    }

    fn unbind_framebuffer_target(&mut self, framebuffer: ResourceId, slot: usize, attachment: Attachment) {
        let Some(fb) = self.framebuffers.get_mut(&framebuffer) else {
            warn!("unknown framebuffer {framebuffer:?}");
            return;
        };
        let point = attachment_point(attachment);
        fb.color_slots.retain(|&p| p != point);
        unsafe {
            let gl = &self.gl;
            gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fb.framebuffer));
            gl.framebuffer_texture_layer(glow::FRAMEBUFFER, point, None, 0, 0);
            if let Attachment::Color(_) = attachment {
                gl.draw_buffers(&fb.color_slots);
            }
        }
        debug!("framebuffer {framebuffer:?} slot {slot} detached");
    }

    fn begin_pass(&mut self, target: PassTarget, state: &DrawState) {
        unsafe {
            let gl = &self.gl;
            match target {
                PassTarget::Keep => {}
                PassTarget::Default => gl.bind_framebuffer(glow::FRAMEBUFFER, None),
                PassTarget::Framebuffer(id) => match self.framebuffers.get(&id) {
                    Some(fb) => gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fb.framebuffer)),
                    None => warn!("pass targets unknown framebuffer {id:?}"),
                },
            }

            if let Some(rect) = state.viewport {
                gl.viewport(rect.x, rect.y, rect.width, rect.height);
            }
            if let Some(rect) = state.scissor {
                gl.scissor(rect.x, rect.y, rect.width, rect.height);
            }
            for (flag, capability) in CAPABILITIES {
                if state.enable.contains(flag) {
                    gl.enable(capability);
                } else if state.disable.contains(flag) {
                    gl.disable(capability);
                }
            }
            if state.enable.contains(DrawFlags::DEPTH_WRITE) {
                gl.depth_mask(true);
            } else if state.disable.contains(DrawFlags::DEPTH_WRITE) {
                gl.depth_mask(false);
            }

            let mut mask = 0;
            if state.clear.contains(ClearFlags::COLOR) {
                let [r, g, b, a] = state.clear_color;
                gl.clear_color(r, g, b, a);
                mask |= glow::COLOR_BUFFER_BIT;
            }
            if state.clear.contains(ClearFlags::DEPTH) {
                mask |= glow::DEPTH_BUFFER_BIT;
            }
            if state.clear.contains(ClearFlags::STENCIL) {
                mask |= glow::STENCIL_BUFFER_BIT;
            }
            if mask != 0 {
                gl.clear(mask);
            }
        }
    }

    fn draw(&mut self, call: &DrawCall) {
        let (Some(mesh), Some(program)) = (self.meshes.get(&call.mesh), self.programs.get(&call.pipeline)) else {
            warn!("draw with unknown mesh {:?} or program {:?}", call.mesh, call.pipeline);
            return;
        };
        unsafe {
            let gl = &self.gl;
            gl.use_program(Some(*program));
            gl.bind_vertex_array(Some(mesh.vao));
            gl.draw_elements_instanced(
                glow::TRIANGLES,
                call.element_count as i32,
                glow::UNSIGNED_INT,
                0,
                call.instances as i32,
            );
        }
    }
}

impl Drop for GlDevice {
    fn drop(&mut self) {
        unsafe {
            let gl = &self.gl;
            for (_, texture) in self.textures.drain() {
                gl.delete_texture(texture.texture);
            }
            for (_, mesh) in self.meshes.drain() {
                gl.delete_vertex_array(mesh.vao);
                gl.delete_buffer(mesh.vbo);
                gl.delete_buffer(mesh.ebo);
            }
            for (_, program) in self.programs.drain() {
                gl.delete_program(program);
            }
            for (_, fb) in self.framebuffers.drain() {
                gl.delete_framebuffer(fb.framebuffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_follow_attribute_order() {
        let (layouts, stride) = vertex_layouts(VertexAttribs::POSITION | VertexAttribs::UV);
        assert_eq!(stride, 20);
        assert_eq!(layouts.len(), 2);
        assert_eq!((layouts[0].index, layouts[0].size, layouts[0].offset), (0, 3, 0));
        assert_eq!((layouts[1].index, layouts[1].size, layouts[1].offset), (4, 2, 12));
    }

    #[test]
    fn half_float_formats_use_half_type() {
        assert_eq!(gl_format(TextureFormat::Rgb16F), (glow::RGB16F, glow::RGB, glow::HALF_FLOAT));
        assert_eq!(gl_format(TextureFormat::Srgb8).0, glow::SRGB8);
    }

    #[test]
    fn released_units_are_reused_before_fresh_ones() {
        let mut units = TextureUnits::new(2);
        assert_eq!(units.alloc(), Some(0));
        assert_eq!(units.alloc(), Some(1));
        assert_eq!(units.alloc(), None);

        // An array recycled for a new shape over and over stays on one unit.
        for _ in 0..100 {
            units.release(1);
            assert_eq!(units.alloc(), Some(1));
        }
        assert_eq!(units.alloc(), None);
    }

    #[test]
    fn color_attachments_are_offset_from_zero() {
        assert_eq!(attachment_point(Attachment::Color(2)), glow::COLOR_ATTACHMENT0 + 2);
        assert_eq!(attachment_point(Attachment::Depth), glow::DEPTH_ATTACHMENT);
    }
}
