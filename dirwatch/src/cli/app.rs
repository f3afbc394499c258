use clap::{Parser, Subcommand};
use dirwatch_core::BackendPreference;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "dirwatch",
    version,
    about = "Dirwatch - Watch files and directories for changes",
    long_about = "Dirwatch reports creation, deletion and modification of files and directories, using kernel notification where available and polling elsewhere. Paths that do not exist yet can be watched too."
)]
pub struct Cli {
    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch paths and print events until interrupted
    #[command(about = "Watch files or directories and print change events")]
    Watch(WatchArgs),

    /// List notification mechanisms available on this host
    #[command(about = "Show which notification mechanisms this host supports")]
    Backends,

    /// Show what the engine sees for a path
    #[command(about = "Print the metadata snapshot the engine compares")]
    Stat(StatArgs),

    /// Print or write the effective configuration
    #[command(about = "Print the effective configuration as TOML")]
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct WatchArgs {
    /// Paths to watch; they need not exist
    #[arg(required = true, help = "Files or directories to watch")]
    pub paths: Vec<PathBuf>,

    /// Treat every path as a directory even if it does not exist yet
    #[arg(long)]
    pub dir: bool,

    /// Report changes to files inside watched directories
    #[arg(long)]
    pub files: bool,

    /// Report changes to subdirectories inside watched directories
    #[arg(long)]
    pub subdirs: bool,

    /// Preferred notification mechanism
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Polling interval in milliseconds
    #[arg(long)]
    pub interval: Option<u64>,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct StatArgs {
    #[arg(help = "Path to inspect")]
    pub path: PathBuf,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Write the configuration to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Notification mechanism argument for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendArg {
    Kernel,
    Daemon,
    WatcherService,
    Polling,
}

impl From<BackendArg> for BackendPreference {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Kernel => BackendPreference::Kernel,
            BackendArg::Daemon => BackendPreference::Daemon,
            BackendArg::WatcherService => BackendPreference::WatcherService,
            BackendArg::Polling => BackendPreference::Polling,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_watch_command() {
        let cli = Cli::try_parse_from([
            "dirwatch", "-vv", "watch", "/tmp/a", "/tmp/b", "--files", "--backend", "watcher-service", "--json",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);

        let Commands::Watch(args) = cli.command else {
            panic!("expected watch command");
        };
        assert_eq!(args.paths.len(), 2);
        assert!(args.files);
        assert!(!args.subdirs);
        assert_eq!(args.backend, Some(BackendArg::WatcherService));
        assert!(args.json);
    }

    #[test]
    fn test_watch_requires_a_path() {
        assert!(Cli::try_parse_from(["dirwatch", "watch"]).is_err());
    }

    #[test]
    fn test_backend_conversion() {
        let preference: BackendPreference = BackendArg::Polling.into();
        assert_eq!(preference, BackendPreference::Polling);
    }
}
