use anyhow::{bail, Context, Result};
use clap::Parser;
use mirror::MigrationOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "to-opus", version)]
#[command(about = "Mirror a music library, transcoding audio files to Opus")]
struct Cli {
    /// TOML file holding any of the options below
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the source directory
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Path to the target directory
    #[arg(short, long)]
    target: Option<PathBuf>,

    /// Number of concurrent conversions
    #[arg(long)]
    threads: Option<usize>,

    /// Delete target files whose source no longer exists
    #[arg(long = "del-removed")]
    del_removed: bool,

    /// Extra encoder argument; single quotes are stripped (e.g. "'--bitrate'")
    #[arg(long = "opusenc-args", allow_hyphen_values = true)]
    opusenc_args: Vec<String>,

    /// Path to the metadata database file
    #[arg(long)]
    database: Option<PathBuf>,

    /// Print debug information
    #[arg(short, long)]
    verbose: bool,

    /// Glob pattern for destination file names to leave alone
    #[arg(long)]
    exclude: Vec<String>,

    /// Save the database every this many files (0 = only at the end)
    #[arg(long)]
    checkpoint_every: Option<usize>,

    /// Encoder program
    #[arg(long)]
    encoder: Option<String>,

    /// Wait for every conversion before looking at the next file
    #[arg(long)]
    wait_per_task: bool,

    /// Maximum seconds to wait for one conversion with --wait-per-task
    #[arg(long)]
    task_timeout: Option<u64>,
}

/// Contents of a `--config` file. Keys are the long option names.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct FileSettings {
    source: Option<PathBuf>,
    target: Option<PathBuf>,
    threads: Option<usize>,
    del_removed: Option<bool>,
    #[serde(default)]
    opusenc_args: Vec<String>,
    database: Option<PathBuf>,
    verbose: Option<bool>,
    #[serde(default)]
    exclude: Vec<String>,
    checkpoint_every: Option<usize>,
    encoder: Option<String>,
    wait_per_task: Option<bool>,
    task_timeout: Option<u64>,
}

impl FileSettings {
    async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(settings)
    }
}

/// Command line values win over file values; lists from the command line
/// replace the file's lists rather than extending them.
fn merge(cli: Cli, file: FileSettings) -> Result<(MigrationOptions, bool)> {
    let Some(source) = cli.source.or(file.source) else {
        bail!("the source directory is required (--source or `source` in the config file)");
    };
    let Some(target) = cli.target.or(file.target) else {
        bail!("the target directory is required (--target or `target` in the config file)");
    };

    let defaults = MigrationOptions::default();
    let threads = cli.threads.or(file.threads).unwrap_or(defaults.threads);
    if threads == 0 {
        bail!("--threads must be at least 1");
    }

    let encoder_args = if cli.opusenc_args.is_empty() { file.opusenc_args } else { cli.opusenc_args };
    let exclude = if cli.exclude.is_empty() { file.exclude } else { cli.exclude };

    let options = MigrationOptions {
        source,
        target,
        threads,
        delete_removed: cli.del_removed || file.del_removed.unwrap_or(false),
        encoder: cli.encoder.or(file.encoder).unwrap_or(defaults.encoder),
        encoder_args: encoder_args.iter().map(|arg| arg.replace('\'', "")).collect(),
        database: cli.database.or(file.database),
        exclude,
        checkpoint_every: cli
            .checkpoint_every
            .or(file.checkpoint_every)
            .unwrap_or(defaults.checkpoint_every),
        wait_per_task: cli.wait_per_task || file.wait_per_task.unwrap_or(false),
        task_timeout_secs: cli
            .task_timeout
            .or(file.task_timeout)
            .unwrap_or(defaults.task_timeout_secs),
    };
    let verbose = cli.verbose || file.verbose.unwrap_or(false);

    Ok((options, verbose))
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => FileSettings::load(path).await?,
        None => FileSettings::default(),
    };
    let (options, verbose) = merge(cli, file)?;

    init_logging(verbose);
    debug!(?options, "config");

    let report = mirror::migrate(options).await.context("Migration failed")?;
    info!(
        migrated = report.migrated(),
        failed = report.failed,
        "done"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("to-opus").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_command_line_only() {
        let cli = parse(&[
            "-s", "/music",
            "-t", "/mirror",
            "--threads", "3",
            "--del-removed",
            "--opusenc-args", "'--bitrate'",
            "--opusenc-args", "'96'",
            "--exclude", "*.jpg",
            "-v",
        ]);
        let (options, verbose) = merge(cli, FileSettings::default()).unwrap();

        assert_eq!(options.source, PathBuf::from("/music"));
        assert_eq!(options.target, PathBuf::from("/mirror"));
        assert_eq!(options.threads, 3);
        assert!(options.delete_removed);
        assert_eq!(options.encoder_args, vec!["--bitrate", "96"]);
        assert_eq!(options.exclude, vec!["*.jpg"]);
        assert_eq!(options.encoder, "opusenc");
        assert_eq!(options.database, None);
        assert!(verbose);
    }

    #[test]
    fn test_unquoted_hyphen_values_are_accepted() {
        let cli = parse(&["-s", "a", "-t", "b", "--opusenc-args", "--vbr"]);
        let (options, _) = merge(cli, FileSettings::default()).unwrap();
        assert_eq!(options.encoder_args, vec!["--vbr"]);
    }

    #[test]
    fn test_missing_roots_are_rejected() {
        assert!(merge(parse(&["-s", "/music"]), FileSettings::default()).is_err());
        assert!(merge(parse(&["-t", "/mirror"]), FileSettings::default()).is_err());
    }

    #[test]
    fn test_zero_threads_is_rejected() {
        let cli = parse(&["-s", "a", "-t", "b", "--threads", "0"]);
        assert!(merge(cli, FileSettings::default()).is_err());
    }

    #[tokio::test]
    async fn test_config_file_with_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("to-opus.toml");
        std::fs::write(
            &path,
            r#"
source = "/music"
target = "/mirror"
threads = 2
database = "/var/lib/to-opus/db.json"
opusenc-args = ["'--bitrate'", "'128'"]
exclude = ["*.log"]
checkpoint-every = 10
"#,
        )
        .unwrap();

        let file = FileSettings::load(&path).await.unwrap();
        let cli = parse(&["-c", path.to_str().unwrap(), "-t", "/elsewhere", "--exclude", "*.tmp"]);
        let (options, verbose) = merge(cli, file).unwrap();

        assert_eq!(options.source, PathBuf::from("/music"));
        assert_eq!(options.target, PathBuf::from("/elsewhere"));
        assert_eq!(options.threads, 2);
        assert_eq!(options.database, Some(PathBuf::from("/var/lib/to-opus/db.json")));
        assert_eq!(options.encoder_args, vec!["--bitrate", "128"]);
        assert_eq!(options.exclude, vec!["*.tmp"]);
        assert_eq!(options.checkpoint_every, 10);
        assert!(!verbose);
    }

    #[tokio::test]
    async fn test_unknown_config_key_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.toml");
        std::fs::write(&path, "sourse = \"/music\"\n").unwrap();

        assert!(FileSettings::load(&path).await.is_err());
    }
}
