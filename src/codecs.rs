//! File decoders used by the loader's async jobs.
//!
//! Everything here is plain CPU work producing owned buffers; nothing touches
//! the device, so these functions are safe to call from any worker thread.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use gltf::{buffer::Source, Gltf};
use half::f16;
use image::DynamicImage;

use crate::error::{CoreError, Result};
use crate::sync::VertexAttribs;
use crate::textures::{TextureFlags, TextureFormat, TextureImage, TextureShape, CUBE_FACES};

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Decodes `path` and converts it to the byte layout of `format`.
pub fn decode_image(path: &Path, format: TextureFormat, flags: TextureFlags) -> Result<DecodedImage> {
    let mut img = image::open(path)?;
    if flags.contains(TextureFlags::FLIP_VERTICALLY) {
        img = img.flipv();
    }
    let (width, height) = (img.width(), img.height());
    let pixels = convert_pixels(&img, format)?;
    Ok(DecodedImage {
        width,
        height,
        pixels,
    })
}

fn convert_pixels(img: &DynamicImage, format: TextureFormat) -> Result<Vec<u8>> {
    let pixels = match format {
        TextureFormat::R8 => img.to_luma8().into_raw(),
        TextureFormat::Rg8 => img.to_luma_alpha8().into_raw(),
        TextureFormat::Rgb8 | TextureFormat::Srgb8 => img.to_rgb8().into_raw(),
        TextureFormat::Rgba8 => img.to_rgba8().into_raw(),
        TextureFormat::R16F | TextureFormat::Rg16F | TextureFormat::Rgb16F | TextureFormat::Rgba16F => {
            let rgba = img.to_rgba32f();
            take_channels(&rgba, format.channels() as usize)
                .flat_map(|v| f16::from_f32(v).to_bits().to_ne_bytes())
                .collect()
        }
        TextureFormat::R32F | TextureFormat::Rg32F | TextureFormat::Rgb32F | TextureFormat::Rgba32F => {
            let rgba = img.to_rgba32f();
            let floats: Vec<f32> = take_channels(&rgba, format.channels() as usize).collect();
            bytemuck::cast_slice(&floats).to_vec()
        }
        TextureFormat::Depth | TextureFormat::DepthStencil => {
            return Err(CoreError::UnsupportedFormat(format!(
                "{format:?} textures cannot be decoded from images"
            )))
        }
    };
    Ok(pixels)
}

fn take_channels(rgba: &[f32], channels: usize) -> impl Iterator<Item = f32> + '_ {
    rgba.chunks_exact(4)
        .flat_map(move |px| px[..channels].iter().copied())
}

/// Interleaved geometry ready to become a [`crate::sync::Mesh`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
    pub attribs: VertexAttribs,
}

impl MeshData {
    pub fn vertex_count(&self) -> usize {
        match self.attribs.stride() {
            0 => 0,
            stride => self.vertices.len() / stride,
        }
    }

    /// Unit quad in the XY plane facing +Z.
    pub fn quad() -> Self {
        #[rustfmt::skip]
        let vertices = vec![
            -0.5, -0.5, 0.0,  0.0, 0.0, 1.0,  0.0, 0.0,
             0.5, -0.5, 0.0,  0.0, 0.0, 1.0,  1.0, 0.0,
             0.5,  0.5, 0.0,  0.0, 0.0, 1.0,  1.0, 1.0,
            -0.5,  0.5, 0.0,  0.0, 0.0, 1.0,  0.0, 1.0,
        ];
        Self {
            vertices,
            indices: vec![0, 1, 2, 0, 2, 3],
            attribs: VertexAttribs::POSITION | VertexAttribs::NORMAL | VertexAttribs::UV,
        }
    }

    /// Unit cube centred on the origin, four vertices per face.
    pub fn cube() -> Self {
        // (normal, u axis, v axis) with u x v == normal
        const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ];
        const CORNERS: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];

        let mut vertices = Vec::with_capacity(6 * 4 * 8);
        let mut indices = Vec::with_capacity(6 * 6);
        for (face, (n, u, v)) in FACES.iter().enumerate() {
            for (su, sv) in CORNERS {
                for axis in 0..3 {
                    vertices.push(0.5 * (n[axis] + su * u[axis] + sv * v[axis]));
                }
                vertices.extend_from_slice(n);
                vertices.extend_from_slice(&[(su + 1.0) * 0.5, (sv + 1.0) * 0.5]);
            }
            let base = face as u32 * 4;
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self {
            vertices,
            indices,
            attribs: VertexAttribs::POSITION | VertexAttribs::NORMAL | VertexAttribs::UV,
        }
    }

    /// Unit UV sphere. `x_segments` columns around the Y axis and
    /// `y_segments` rows from pole to pole; the seam column is duplicated so
    /// UVs wrap cleanly.
    ///
    /// # Panics
    /// If either count is below 3.
    pub fn sphere(x_segments: u32, y_segments: u32) -> Self {
        assert!(x_segments > 2 && y_segments > 2, "sphere needs at least 3x3 segments");
        use std::f32::consts::{FRAC_PI_2, PI, TAU};

        let u_step = 1.0 / (x_segments - 1) as f32;
        let v_step = 1.0 / (y_segments - 1) as f32;
        let mut vertices = Vec::with_capacity((x_segments * y_segments * 8) as usize);
        for y in 0..y_segments {
            let v = y as f32 * v_step;
            let py = (-FRAC_PI_2 + PI * v).sin();
            let ring = (PI * v).sin();
            for x in 0..x_segments {
                let u = x as f32 * u_step;
                let (px, pz) = ((TAU * u).cos() * ring, (TAU * u).sin() * ring);
                vertices.extend_from_slice(&[px, py, pz, px, py, pz, u, v]);
            }
        }

        let mut indices = Vec::with_capacity(((x_segments - 1) * (y_segments - 1) * 6) as usize);
        for y in 0..y_segments - 1 {
            for x in 0..x_segments - 1 {
                let a = y * x_segments + x;
                let b = a + x_segments;
                indices.extend_from_slice(&[a, a + 1, b + 1, a, b + 1, b]);
            }
        }
        Self {
            vertices,
            indices,
            attribs: VertexAttribs::POSITION | VertexAttribs::NORMAL | VertexAttribs::UV,
        }
    }
}

/// Attributes stored in every `.msh` vertex.
pub const MSH_ATTRIBS: VertexAttribs = VertexAttribs::POSITION
    .union(VertexAttribs::NORMAL)
    .union(VertexAttribs::TANGENT)
    .union(VertexAttribs::BITANGENT)
    .union(VertexAttribs::UV);

/// Dispatches on the file extension: `.msh`, `.gltf` or `.glb`.
pub fn decode_mesh(path: &Path) -> Result<MeshData> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "msh" => decode_msh(path, &fs::read(path)?),
        "gltf" | "glb" => decode_gltf(path),
        _ => Err(CoreError::UnsupportedFormat(format!(
            "mesh extension `{extension}` of {}",
            path.display()
        ))),
    }
}

/// `.msh` layout: `u64` vertex byte count, interleaved `f32` vertices,
/// `u64` index byte count, `u16` indices. All little endian.
pub fn decode_msh(path: &Path, bytes: &[u8]) -> Result<MeshData> {
    let malformed = |reason: String| CoreError::MalformedMesh {
        path: path.to_path_buf(),
        reason,
    };
    let mut cursor = bytes;

    let vertex_bytes = read_len(&mut cursor).ok_or_else(|| malformed("missing vertex size".into()))?;
    let stride_bytes = MSH_ATTRIBS.stride() * 4;
    if vertex_bytes % stride_bytes != 0 {
        return Err(malformed(format!(
            "vertex block of {vertex_bytes} bytes is not a multiple of {stride_bytes}"
        )));
    }
    let vertex_block = take(&mut cursor, vertex_bytes).ok_or_else(|| malformed("truncated vertex block".into()))?;
    let vertices = vertex_block
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect::<Vec<_>>();

    let index_bytes = read_len(&mut cursor).ok_or_else(|| malformed("missing index size".into()))?;
    if index_bytes % 2 != 0 {
        return Err(malformed(format!("odd index block size {index_bytes}")));
    }
    let index_block = take(&mut cursor, index_bytes).ok_or_else(|| malformed("truncated index block".into()))?;
    let indices = index_block
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]) as u32)
        .collect::<Vec<_>>();

    let vertex_count = vertices.len() / MSH_ATTRIBS.stride();
    if let Some(bad) = indices.iter().find(|&&i| i as usize >= vertex_count) {
        return Err(malformed(format!("index {bad} out of range for {vertex_count} vertices")));
    }

    Ok(MeshData {
        vertices,
        indices,
        attribs: MSH_ATTRIBS,
    })
}

fn read_len(cursor: &mut &[u8]) -> Option<usize> {
    let bytes = take(cursor, 8)?;
    let mut len = [0u8; 8];
    len.copy_from_slice(bytes);
    usize::try_from(u64::from_le_bytes(len)).ok()
}

fn take<'a>(cursor: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if cursor.len() < n {
        return None;
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Some(head)
}

struct Primitive {
    positions: Vec<[f32; 3]>,
    normals: Option<Vec<[f32; 3]>>,
    tangents: Option<Vec<[f32; 4]>>,
    uvs: Option<Vec<[f32; 2]>>,
    colors: Option<Vec<[f32; 4]>>,
    indices: Vec<u32>,
}

impl Primitive {
    /// Every attribute must cover every position and every index must hit one.
    fn validate(&self) -> std::result::Result<(), String> {
        let vertex_count = self.positions.len();
        let lengths = [
            ("NORMAL", self.normals.as_ref().map(Vec::len)),
            ("TANGENT", self.tangents.as_ref().map(Vec::len)),
            ("TEXCOORD_0", self.uvs.as_ref().map(Vec::len)),
            ("COLOR_0", self.colors.as_ref().map(Vec::len)),
        ];
        for (name, len) in lengths {
            if let Some(len) = len.filter(|&len| len != vertex_count) {
                return Err(format!("{name} has {len} values for {vertex_count} positions"));
            }
        }
        match self.indices.iter().find(|&&i| i as usize >= vertex_count) {
            Some(bad) => Err(format!("index {bad} out of range for {vertex_count} vertices")),
            None => Ok(()),
        }
    }
}

/// Merges every primitive of every mesh in the document into one indexed
/// mesh. An attribute is kept only if all primitives provide it.
pub fn decode_gltf(path: &Path) -> Result<MeshData> {
    let gltf = Gltf::open(path)?;
    let malformed = |reason: &str| CoreError::MalformedMesh {
        path: path.to_path_buf(),
        reason: reason.to_owned(),
    };

    let mut buffers = Vec::new();
    for buffer in gltf.buffers() {
        let data = match buffer.source() {
            Source::Uri(uri) if uri.starts_with("data:") => decode_data_uri(uri).map_err(|e| malformed(&e))?,
            Source::Uri(uri) => {
                let dir = path.parent().map(Path::to_path_buf).unwrap_or_else(PathBuf::new);
                fs::read(dir.join(uri))?
            }
            Source::Bin => gltf
                .blob
                .clone()
                .ok_or_else(|| malformed("GLB binary chunk missing"))?,
        };
        buffers.push(data);
    }

    let mut primitives = Vec::new();
    for mesh in gltf.meshes() {
        for primitive in mesh.primitives() {
            let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(Vec::as_slice));
            let positions: Vec<[f32; 3]> = reader
                .read_positions()
                .ok_or_else(|| malformed("primitive without positions"))?
                .collect();
            let indices = match reader.read_indices() {
                Some(indices) => indices.into_u32().collect(),
                None => (0..positions.len() as u32).collect(),
            };
            let primitive = Primitive {
                normals: reader.read_normals().map(Iterator::collect),
                tangents: reader.read_tangents().map(Iterator::collect),
                uvs: reader.read_tex_coords(0).map(|uv| uv.into_f32().collect()),
                colors: reader.read_colors(0).map(|c| c.into_rgba_f32().collect()),
                positions,
                indices,
            };
            primitive.validate().map_err(|reason| CoreError::MalformedMesh {
                path: path.to_path_buf(),
                reason,
            })?;
            primitives.push(primitive);
        }
    }
    if primitives.is_empty() {
        return Err(malformed("document has no mesh primitives"));
    }

    let mut attribs = VertexAttribs::POSITION;
    if primitives.iter().all(|p| p.normals.is_some()) {
        attribs |= VertexAttribs::NORMAL;
        if primitives.iter().all(|p| p.tangents.is_some()) {
            attribs |= VertexAttribs::TANGENT | VertexAttribs::BITANGENT;
        }
    }
    if primitives.iter().all(|p| p.uvs.is_some()) {
        attribs |= VertexAttribs::UV;
    }
    if primitives.iter().all(|p| p.colors.is_some()) {
        attribs |= VertexAttribs::COLOR;
    }

    let mut data = MeshData {
        attribs,
        ..MeshData::default()
    };
    for p in &primitives {
        let base = data.vertex_count() as u32;
        for (i, position) in p.positions.iter().enumerate() {
            data.vertices.extend_from_slice(position);
            let normal = p.normals.as_ref().map(|n| n[i]);
            if let Some(n) = normal.filter(|_| attribs.contains(VertexAttribs::NORMAL)) {
                data.vertices.extend_from_slice(&n);
                if let Some(t) = p.tangents.as_ref().map(|t| t[i]).filter(|_| attribs.contains(VertexAttribs::TANGENT)) {
                    data.vertices.extend_from_slice(&t[..3]);
                    let b = cross(n, [t[0], t[1], t[2]]);
                    data.vertices.extend_from_slice(&[b[0] * t[3], b[1] * t[3], b[2] * t[3]]);
                }
            }
            if let Some(uvs) = p.uvs.as_ref().filter(|_| attribs.contains(VertexAttribs::UV)) {
                data.vertices.extend_from_slice(&uvs[i]);
            }
            if let Some(colors) = p.colors.as_ref().filter(|_| attribs.contains(VertexAttribs::COLOR)) {
                data.vertices.extend_from_slice(&colors[i]);
            }
        }
        data.indices.extend(p.indices.iter().map(|i| base + i));
    }
    Ok(data)
}

/// Embedded buffers: `data:application/octet-stream;base64,...` or the
/// `application/gltf-buffer` media type.
fn decode_data_uri(uri: &str) -> std::result::Result<Vec<u8>, String> {
    let data = ["data:application/octet-stream;base64,", "data:application/gltf-buffer;base64,"]
        .iter()
        .find_map(|prefix| uri.strip_prefix(prefix))
        .ok_or_else(|| format!("unsupported data URI `{}`", uri.chars().take(48).collect::<String>()))?;
    STANDARD.decode(data).map_err(|e| format!("bad base64 buffer: {e}"))
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub const ENV_MAGIC: &[u8; 8] = b"NYAS_ENV";

/// Dimensions of the textures stored in a `.env` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvLayout {
    pub sky_size: u32,
    pub irradiance_size: u32,
    pub prefilter_size: u32,
    pub prefilter_levels: u32,
    pub lut_size: u32,
}

impl Default for EnvLayout {
    fn default() -> Self {
        Self {
            sky_size: 1024,
            irradiance_size: 1024,
            prefilter_size: 256,
            prefilter_levels: 9,
            lut_size: 512,
        }
    }
}

/// One decoded texture with all of its mip levels.
#[derive(Debug, Clone)]
pub struct EnvTexture {
    pub shape: TextureShape,
    pub cubemap: bool,
    pub images: Vec<TextureImage>,
}

impl EnvTexture {
    pub fn flags(&self) -> TextureFlags {
        if self.cubemap {
            TextureFlags::CUBEMAP
        } else {
            TextureFlags::empty()
        }
    }
}

/// Image-based lighting set baked offline.
#[derive(Debug, Clone)]
pub struct EnvironmentData {
    pub sky: EnvTexture,
    pub irradiance: EnvTexture,
    pub prefilter: EnvTexture,
    pub lut: EnvTexture,
}

/// Reads a `.env` file: the magic, then the sky, irradiance and prefiltered
/// RGB16F cubemaps (faces innermost, mips outermost), then the RG16F BRDF LUT.
pub fn decode_env(path: &Path, layout: &EnvLayout) -> Result<EnvironmentData> {
    let invalid = |reason: String| CoreError::InvalidEnvironment {
        path: path.to_path_buf(),
        reason,
    };
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .map_err(|_| invalid("file shorter than header".into()))?;
    if &magic != ENV_MAGIC {
        return Err(invalid("bad header".into()));
    }

    let mut read_texture = |name: &str, shape: TextureShape, cubemap: bool| -> Result<EnvTexture> {
        let faces = if cubemap { CUBE_FACES as usize } else { 1 };
        let mut images = Vec::with_capacity(shape.levels as usize);
        for mip in 0..shape.levels {
            let mut buffers = Vec::with_capacity(faces);
            for _ in 0..faces {
                let mut pixels = vec![0u8; shape.mip_byte_size(mip)];
                reader.read_exact(&mut pixels).map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => invalid(format!("truncated in {name} mip {mip}")),
                    _ => CoreError::Io(e),
                })?;
                buffers.push(pixels.into_boxed_slice());
            }
            images.push(TextureImage { mip, faces: buffers });
        }
        Ok(EnvTexture {
            shape,
            cubemap,
            images,
        })
    };

    let sky = read_texture(
        "sky",
        TextureShape::new(TextureFormat::Rgb16F, layout.sky_size, layout.sky_size, 1),
        true,
    )?;
    let irradiance = read_texture(
        "irradiance",
        TextureShape::new(TextureFormat::Rgb16F, layout.irradiance_size, layout.irradiance_size, 1),
        true,
    )?;
    let prefilter = read_texture(
        "prefilter",
        TextureShape::new(
            TextureFormat::Rgb16F,
            layout.prefilter_size,
            layout.prefilter_size,
            layout.prefilter_levels,
        ),
        true,
    )?;
    let lut = read_texture(
        "lut",
        TextureShape::new(TextureFormat::Rg16F, layout.lut_size, layout.lut_size, 1),
        false,
    )?;

    Ok(EnvironmentData {
        sky,
        irradiance,
        prefilter,
        lut,
    })
}
