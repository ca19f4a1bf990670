use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "scenestream")]
#[command(about = "Streams models into a live, rendering scene without stalling the frame loop")]
pub struct CliArgs {
    /// Models to load, one scene slot each. Paths are interpreted by the
    /// configured loader; the built-in one understands `quad`, `cube`,
    /// `underlay`, `overlay` and `paged:<path>`.
    pub paths: Vec<String>,

    /// Number of background loader threads.
    #[arg(short = 'n', long, default_value_t = 16, env = "SCENESTREAM_THREADS")]
    pub threads: usize,

    /// Number of reusable compile contexts; bounds how many device uploads
    /// run concurrently.
    #[arg(long, default_value_t = 4, env = "SCENESTREAM_POOL_SIZE")]
    pub pool_size: usize,

    /// Stop after this many frames, -1 to run until the scene has settled.
    #[arg(short = 'f', long, default_value_t = -1)]
    pub frames: i64,

    /// JSON file with minimum descriptor-pool sizing hints.
    #[arg(long, env = "SCENESTREAM_RESOURCE_HINTS")]
    pub resource: Option<String>,
}
