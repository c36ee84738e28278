use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result, bail};

/// Docker refuses images deeper than this.
pub const DEFAULT_MAX_DEPTH: usize = 127;
pub const DEFAULT_RUNTIME: &str = "docker";
pub const DEFAULT_REGISTRY: &str = "registry";

pub const ENV_RUNTIME: &str = "LAYERPUSH_RUNTIME";
pub const ENV_REGISTRY: &str = "LAYERPUSH_REGISTRY";
pub const ENV_KEY: &str = "LAYERPUSH_KEY";
pub const ENV_MAX_DEPTH: &str = "LAYERPUSH_MAX_DEPTH";

static CONFIG: OnceLock<PushConfig> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConfig {
    /// Container runtime binary used for `save`.
    pub runtime: String,
    /// Root directory of the filesystem registry.
    pub registry: PathBuf,
    /// PKCS#8 PEM signing key. A fresh key is generated per push when unset.
    pub key: Option<PathBuf>,
    pub max_depth: usize,
    pub progress: bool,
    pub dry_run: bool,
}

/// Values given on the command line. These win over the environment.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub runtime: Option<String>,
    pub registry: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub max_depth: Option<usize>,
    pub no_progress: bool,
    pub dry_run: bool,
}

impl PushConfig {
    /// Merge CLI values over environment values over defaults.
    pub fn resolve(cli: CliOverrides, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |name: &str| env(name).filter(|v| !v.trim().is_empty());
        let cli_runtime = cli.runtime.filter(|v| !v.trim().is_empty());
        let cli_registry = cli.registry.filter(|v| !v.as_os_str().is_empty());
        let cli_key = cli.key.filter(|v| !v.as_os_str().is_empty());

        let max_depth = match cli.max_depth {
            Some(depth) => depth,
            None => match non_empty(ENV_MAX_DEPTH) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{ENV_MAX_DEPTH}={raw:?} is not a number"))?,
                None => DEFAULT_MAX_DEPTH,
            },
        };
        if max_depth == 0 {
            bail!("maximum layer depth must be at least 1");
        }

        Ok(Self {
            runtime: cli_runtime
                .or_else(|| non_empty(ENV_RUNTIME))
                .unwrap_or_else(|| DEFAULT_RUNTIME.to_string()),
            registry: cli_registry
                .or_else(|| non_empty(ENV_REGISTRY).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY)),
            key: cli_key.or_else(|| non_empty(ENV_KEY).map(PathBuf::from)),
            max_depth,
            progress: !cli.no_progress,
            dry_run: cli.dry_run,
        })
    }
}

/// Resolve the process-wide configuration from CLI flags and the environment.
pub fn init_from_cli(cli: CliOverrides) -> Result<&'static PushConfig> {
    let mut config = PushConfig::resolve(cli, |name| std::env::var(name).ok())?;
    config.progress &= std::io::stderr().is_terminal();
    tracing::debug!(?config, "Resolved configuration");

    if CONFIG.set(config).is_err() {
        bail!("configuration already initialized");
    }
    Ok(get())
}

/// The active configuration. Falls back to environment defaults if
/// [`init_from_cli`] was never called.
pub fn get() -> &'static PushConfig {
    CONFIG.get_or_init(|| {
        PushConfig::resolve(CliOverrides::default(), |name| std::env::var(name).ok()).unwrap_or(
            PushConfig {
                runtime: DEFAULT_RUNTIME.to_string(),
                registry: PathBuf::from(DEFAULT_REGISTRY),
                key: None,
                max_depth: DEFAULT_MAX_DEPTH,
                progress: false,
                dry_run: false,
            },
        )
    })
}
