//! `correlator`: reads one or more sampled `.csprof` profiles for an
//! executable, correlates every sample against static program structure,
//! merges threads/files into one calling-context tree, and writes an
//! experiment database. Argument handling and exit-code mapping live
//! here; everything else is a library call.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use memmap2::Mmap;

use xcsprof::cli::{Cli, Config};
use xcsprof::core::vma::FlatIsa;
use xcsprof::correlator::{self, ModuleStructure};
use xcsprof::error::ReaderError;
use xcsprof::profile::Profile;
use xcsprof::reader;
use xcsprof::sources::SourceMirror;
use xcsprof::structure::tree::{parse_structure_file, StructureTree};
use xcsprof::writer;

fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.version_info {
        println!("correlator {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::from(0);
    }
    let verbosity = cli.verbose;
    let config: Config = cli.into();
    init_logger(verbosity);

    match run(&config) {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            eprintln!("correlator: {e:#}");
            ExitCode::from(classify_error(&e))
        }
    }
}

fn init_logger(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();
}

fn classify_error(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ReaderError>().is_some() {
        return 1;
    }
    if let Some(io) = err.downcast_ref::<std::io::Error>() {
        return match io.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput => 1,
            _ => 2,
        };
    }
    2
}

fn run(config: &Config) -> anyhow::Result<()> {
    let isa = FlatIsa;

    let mut profile_paths = config.profiles.iter();
    let first_path = profile_paths.next().expect("clap requires at least one profile");
    let mut profile = read_one_profile(first_path, &config.executable, &isa)?;

    for path in profile_paths {
        let next = read_one_profile(path, &config.executable, &isa)?;
        profile.merge(next);
    }

    if config.dump_cct {
        if let Some(root) = profile.cct.root() {
            eprintln!("-- calling-context tree before correlation --");
            eprintln!("{}", xcsprof::cct::dump::dump(&profile.cct, root));
        }
    }

    let structure_trees = load_structure_trees(&config.structure_files)?;
    let modules: Vec<ModuleStructure> = profile
        .epoch
        .modules()
        .iter()
        .filter(|lm| lm.is_used())
        .map(|lm| ModuleStructure {
            lm_id: lm.id(),
            module_name: lm.name().to_string(),
            tree: find_structure_for_module(&structure_trees, lm.name()),
        })
        .collect();

    let root = if let Some(root) = profile.cct.root() {
        correlator::correlate(&mut profile.cct, &profile.epoch, &modules);
        if config.dump_cct {
            eprintln!("-- calling-context tree after correlation --");
            eprintln!("{}", xcsprof::cct::dump::dump(&profile.cct, root));
        }
        root
    } else {
        anyhow::bail!("profile has no calling-context tree root");
    };

    let output_dir = pick_output_dir(&config.output)?;
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating experiment database directory {}", output_dir.display()))?;

    let xml_path = output_dir.join("experiment.xml");
    let file = std::fs::File::create(&xml_path).with_context(|| format!("creating {}", xml_path.display()))?;
    writer::write_experiment(
        std::io::BufWriter::new(file),
        &profile.name,
        &profile.metrics,
        &profile.cct,
        root,
        &xml_path,
    )?;

    let mut mirror = SourceMirror::new(config.search_paths.clone());
    mirror.mirror(&mut profile.cct, root, &profile.epoch, &output_dir)?;

    info!("wrote experiment database to {}", output_dir.display());
    Ok(())
}

fn read_one_profile(path: &Path, executable: &Path, isa: &FlatIsa) -> anyhow::Result<Profile> {
    let file = std::fs::File::open(path).with_context(|| format!("opening profile {}", path.display()))?;
    let mmap = unsafe { Mmap::map(&file) }.with_context(|| format!("mapping profile {}", path.display()))?;
    let cursor = std::io::Cursor::new(&mmap[..]);
    let profile = reader::read_profile(cursor, path, executable, isa)?;
    let sample_count = profile.cct.root().map(|r| profile.cct.preorder(r).len()).unwrap_or(0);
    info!("read {} node(s) from {}", sample_count, path.display());
    Ok(profile)
}

fn load_structure_trees(paths: &[PathBuf]) -> anyhow::Result<Vec<StructureTree>> {
    let mut all = Vec::new();
    for path in paths {
        let trees = parse_structure_file(path)?;
        all.extend(trees);
    }
    Ok(all)
}

fn find_structure_for_module<'a>(trees: &'a [StructureTree], module_name: &str) -> Option<&'a StructureTree> {
    let module_file = Path::new(module_name).file_name()?.to_string_lossy().to_string();
    trees.iter().find(|t| {
        Path::new(&t.load_module_name)
            .file_name()
            .map(|n| n.to_string_lossy() == module_file)
            .unwrap_or(false)
    })
}

/// `-o` defaults to `./experiment-db`; if that directory already exists,
/// retry once with a `-<pid>` suffix before failing fatally.
fn pick_output_dir(requested: &Path) -> anyhow::Result<PathBuf> {
    if !requested.exists() {
        return Ok(requested.to_path_buf());
    }
    let pid = std::process::id();
    let suffixed = PathBuf::from(format!("{}-{}", requested.display(), pid));
    if suffixed.exists() {
        anyhow::bail!(
            "output directory {} and fallback {} both already exist",
            requested.display(),
            suffixed.display()
        );
    }
    warn!(
        "output directory {} already exists; writing to {} instead",
        requested.display(),
        suffixed.display()
    );
    Ok(suffixed)
}
