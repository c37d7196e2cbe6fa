/// Fixed limits of the resource core.
///
/// The texture tables are sized once at start-up; running past them is a
/// configuration problem, reported as [`crate::CoreError::OutOfCapacity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Layers per plain 2D texture array.
    pub tex_array_layers: u16,
    /// Number of distinct 2D array objects.
    pub max_tex_arrays: usize,
    /// Logical cubemaps per cubemap array (each one takes 6 layers).
    pub cubemap_array_layers: u16,
    /// Number of distinct cubemap array objects.
    pub max_cubemap_arrays: usize,
    /// Worker count the `nyas` binary hands to [`crate::AssetLoader::load`].
    pub loader_threads: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tex_array_layers: 256,
            max_tex_arrays: 16,
            cubemap_array_layers: 8,
            max_cubemap_arrays: 4,
            loader_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}
