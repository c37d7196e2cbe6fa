use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{error, info, warn};

use nyas_core::device::DeviceCall;
use nyas_core::draw::{ClearFlags, DrawFlags};
use nyas_core::{
    AssetLoader, CoreConfig, CoreError, DeviceThread, DrawBatch, DrawCommand, DrawState, DrawUnit,
    HeadlessDevice, LoadReport, PipelineDesc, RenderTarget, ResourceContext, TextureFlags, TextureFormat,
};

fn cli() -> Command {
    Command::new("nyas")
        .about("Loads a batch of assets into the resource core and drives one headless frame")
        .arg(
            Arg::new("threads")
                .short('j')
                .long("threads")
                .help("Loader worker threads (0 runs every job inline)")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("tex-layers")
                .long("tex-layers")
                .help("Layers per 2D texture array")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("max-arrays")
                .long("max-arrays")
                .help("Maximum number of 2D texture arrays")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("shader")
                .long("shader")
                .help("Pipeline as NAME:VERTEX:FRAGMENT")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("assets")
                .help("Textures (png, jpg, ...), meshes (msh, gltf, glb) and environments (env)")
                .num_args(0..)
                .value_parser(value_parser!(PathBuf)),
        )
}

fn config_from(matches: &ArgMatches) -> CoreConfig {
    let mut config = CoreConfig::default();
    if let Some(&threads) = matches.get_one::<usize>("threads") {
        config.loader_threads = threads;
    }
    if let Some(&layers) = matches.get_one::<u16>("tex-layers") {
        config.tex_array_layers = layers;
    }
    if let Some(&arrays) = matches.get_one::<usize>("max-arrays") {
        config.max_tex_arrays = arrays;
    }
    config
}

fn parse_shader(spec: &str) -> Option<PipelineDesc> {
    let mut parts = spec.splitn(3, ':');
    let (name, vertex, fragment) = (parts.next()?, parts.next()?, parts.next()?);
    if name.is_empty() {
        return None;
    }
    Some(PipelineDesc {
        name: name.to_owned(),
        vertex: vertex.into(),
        fragment: fragment.into(),
    })
}

fn queue_asset(loader: &mut AssetLoader, path: &Path) {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "msh" | "gltf" | "glb" => {
            loader.add_mesh(path);
        }
        "env" => {
            loader.add_env(path);
        }
        "png" | "jpg" | "jpeg" | "bmp" | "tga" => {
            loader.add_tex(
                path,
                TextureFormat::Rgba8,
                1,
                TextureFlags::FLIP_VERTICALLY,
            );
        }
        "hdr" | "exr" => {
            loader.add_tex(path, TextureFormat::Rgb16F, 1, TextureFlags::FLIP_VERTICALLY);
        }
        _ => warn!("skipping {}: unknown asset type", path.display()),
    }
}

fn run(matches: &ArgMatches) -> Result<LoadReport, CoreError> {
    let config = config_from(matches);
    let threads = config.loader_threads;
    let mut ctx = ResourceContext::new(config);
    let mut loader = AssetLoader::new();

    if let Some(shaders) = matches.get_many::<String>("shader") {
        for spec in shaders {
            match parse_shader(spec) {
                Some(desc) => {
                    loader.add_shader(desc);
                }
                None => warn!("ignoring malformed --shader `{spec}`"),
            }
        }
    }
    if let Some(assets) = matches.get_many::<PathBuf>("assets") {
        for path in assets {
            queue_asset(&mut loader, path);
        }
    }

    let report = loader.load(&mut ctx, threads)?;

    let mut device = DeviceThread::new(HeadlessDevice::new());
    let mut batch = DrawBatch::new();
    if let Some((pipeline, _)) = ctx.pipelines.iter().next() {
        let units: Vec<_> = ctx
            .meshes
            .iter()
            .map(|(mesh, _)| DrawUnit::new(mesh, pipeline))
            .collect();
        batch.push(DrawCommand {
            target: RenderTarget::Default,
            state: DrawState {
                enable: DrawFlags::DEPTH_TEST | DrawFlags::DEPTH_WRITE | DrawFlags::FACE_CULLING,
                clear: ClearFlags::COLOR | ClearFlags::DEPTH,
                ..DrawState::default()
            },
            units,
        });
    } else if ctx.meshes.count() > 0 {
        warn!("no pipeline given, meshes will not be drawn");
    }
    let stats = batch.submit(&mut ctx, &mut device)?;

    for cubemap in [false, true] {
        for array in ctx.textures.arrays(cubemap) {
            info!(
                "{} {:?} {}x{} x{} levels: {} live layer(s)",
                if cubemap { "cubemap array" } else { "texture array" },
                array.shape.format,
                array.shape.width,
                array.shape.height,
                array.shape.levels,
                array.live_layers
            );
        }
    }
    let device = device.get();
    info!(
        "frame: {} pass(es), {} draw(s); device: {} array(s), {} layer upload(s), {} resource(s)",
        stats.passes,
        stats.draws,
        device.count(|c| matches!(c, DeviceCall::CreateTextureArray { .. })),
        device.count(|c| matches!(c, DeviceCall::UploadLayer { .. })),
        device.count(|c| matches!(c, DeviceCall::CreateResource { .. })),
    );
    Ok(report)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let matches = cli().get_matches();

    match run(&matches) {
        Ok(report) if report.failed == 0 => ExitCode::SUCCESS,
        Ok(report) => {
            error!("{} asset(s) failed to load", report.failed);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_spec_splits_into_three_parts() {
        let desc = parse_shader("pbr:shaders/pbr.vert:shaders/pbr.frag").unwrap();
        assert_eq!(desc.name, "pbr");
        assert_eq!(desc.vertex, PathBuf::from("shaders/pbr.vert"));
        assert_eq!(desc.fragment, PathBuf::from("shaders/pbr.frag"));
        assert!(parse_shader("pbr:only.vert").is_none());
        assert!(parse_shader(":a:b").is_none());
    }

    #[test]
    fn flags_override_config() {
        let matches = cli().get_matches_from(["nyas", "-j", "0", "--tex-layers", "32", "a.png"]);
        let config = config_from(&matches);
        assert_eq!(config.loader_threads, 0);
        assert_eq!(config.tex_array_layers, 32);
        assert_eq!(config.max_tex_arrays, CoreConfig::default().max_tex_arrays);
    }
}
