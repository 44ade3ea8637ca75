use clap::Parser;

/// Wireit - incremental script runner for package.json projects
///
/// Wireit upgrades npm scripts with dependency graphs, input/output
/// fingerprinting, caching, long-running services, and watch mode. It is
/// expected to be invoked through the package manager (`npm run <script>`),
/// which supplies the script name and manifest path via environment variables.
#[derive(Parser, Debug)]
#[command(name = "wireit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Incremental script runner for package.json projects", long_about = None)]
pub struct Cli {
    /// Re-run affected scripts when watched files change
    #[arg(long)]
    pub watch: bool,

    /// Extra arguments from the package-manager runner ("watch" selects watch
    /// mode, matching `npm run <script> watch`)
    pub extra: Vec<String>,

    /// Number of scripts to run at once (0 = unbounded)
    #[arg(long, env = "WIREIT_PARALLEL")]
    pub parallel: Option<String>,

    /// What to do when a script fails (continue|no-new|kill)
    #[arg(long, env = "WIREIT_FAILURES")]
    pub failures: Option<String>,

    /// Cache backend (local|none)
    #[arg(long, env = "WIREIT_CACHE")]
    pub cache: Option<String>,
}

impl Cli {
    /// Watch mode is selected by `--watch` or by a trailing `watch` argument.
    pub fn watch_mode(&self) -> bool {
        self.watch || self.extra.iter().any(|a| a == "watch")
    }
}
