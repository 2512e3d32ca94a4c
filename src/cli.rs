//! Command-line surface: argument parsing via `clap`'s derive API, plus
//! the `Config` conversion that resolves defaults before handing settings
//! to the correlator.

use std::path::PathBuf;

use clap::Parser;

use crate::profile::ThreadAttachMode;

/// `correlator [-v[N]] [-V] [-h] [-I <searchpath>]... [-S <structure-file>]...
///            [-o <db-path>] [--dump-cct] <executable> <profile-file>...`
#[derive(Debug, Parser)]
#[command(name = "correlator", version, about = "Call-path profile correlator", disable_version_flag = true)]
pub struct Cli {
    /// Increase logging verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print version and exit.
    #[arg(short = 'V', long = "version-info")]
    pub version_info: bool,

    /// Source search path; may be repeated.
    #[arg(short = 'I', long = "include", value_name = "searchpath")]
    pub search_paths: Vec<PathBuf>,

    /// Static structure file; may be repeated.
    #[arg(short = 'S', long = "structure", value_name = "structure-file")]
    pub structure_files: Vec<PathBuf>,

    /// Output experiment database directory.
    #[arg(short = 'o', long = "output", value_name = "db-path")]
    pub output: Option<PathBuf>,

    /// Dump the calling-context tree to stderr before correlation and
    /// again after, instead of (in addition to) writing the experiment
    /// database.
    #[arg(long = "dump-cct")]
    pub dump_cct: bool,

    /// Merge per-thread profiles into one combined tree rather than
    /// keeping each under its own `Group` node.
    #[arg(long = "thread-attach", value_enum, default_value = "combined")]
    pub thread_attach: ThreadAttachArg,

    /// The profiled executable.
    pub executable: PathBuf,

    /// One or more sampled profile files to correlate and merge.
    #[arg(required = true)]
    pub profiles: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ThreadAttachArg {
    Separate,
    Combined,
}

impl From<ThreadAttachArg> for ThreadAttachMode {
    fn from(a: ThreadAttachArg) -> Self {
        match a {
            ThreadAttachArg::Separate => ThreadAttachMode::Separate,
            ThreadAttachArg::Combined => ThreadAttachMode::Combined,
        }
    }
}

/// Resolved, validated settings handed from the CLI layer to the
/// correlator, keeping the derive `Cli` struct (and clap's own global
/// state) out of the core (A.3).
#[derive(Debug, Clone)]
pub struct Config {
    pub executable: PathBuf,
    pub profiles: Vec<PathBuf>,
    pub search_paths: Vec<PathBuf>,
    pub structure_files: Vec<PathBuf>,
    pub output: PathBuf,
    pub dump_cct: bool,
    pub thread_attach: ThreadAttachMode,
}

const DEFAULT_OUTPUT: &str = "experiment-db";

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Config {
            executable: cli.executable,
            profiles: cli.profiles,
            search_paths: cli.search_paths,
            structure_files: cli.structure_files,
            output: cli.output.unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT)),
            dump_cct: cli.dump_cct,
            thread_attach: cli.thread_attach.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["correlator", "a.out", "a.out.prof"]);
        assert_eq!(cli.executable, PathBuf::from("a.out"));
        assert_eq!(cli.profiles, vec![PathBuf::from("a.out.prof")]);
        assert!(cli.search_paths.is_empty());
        assert_eq!(cli.thread_attach, ThreadAttachArg::Combined);
    }

    #[test]
    fn accumulates_repeated_search_paths_and_structure_files() {
        let cli = Cli::parse_from([
            "correlator", "-I", "src", "-I", "include", "-S", "a.hpcstruct", "a.out", "a.out.prof",
        ]);
        assert_eq!(cli.search_paths, vec![PathBuf::from("src"), PathBuf::from("include")]);
        assert_eq!(cli.structure_files, vec![PathBuf::from("a.hpcstruct")]);
    }

    #[test]
    fn default_output_directory_is_experiment_db() {
        let cli = Cli::parse_from(["correlator", "a.out", "a.out.prof"]);
        let config: Config = cli.into();
        assert_eq!(config.output, PathBuf::from("experiment-db"));
    }

    #[test]
    fn counts_repeated_verbose_flags() {
        let cli = Cli::parse_from(["correlator", "-vvv", "a.out", "a.out.prof"]);
        assert_eq!(cli.verbose, 3);
    }
}
