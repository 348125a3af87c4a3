//! Tern bundle inspection tool
//!
//! Command-line access to the overlay, resolver, and extraction cache:
//! list merged bundle contents, read files, materialize an extraction root,
//! resolve dotted module names, and print a binary's declared dependencies.

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use tern_archive::{BundleSource, Overlay, VersionStore};
use tern_loader::elf;
use tern_loader::resolver::{Loaders, Located, Resolver, UnitKind};

#[derive(Parser)]
#[command(name = "tern")]
#[command(about = "Inspect and extract Tern application bundles", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the merged directory contents of one or more bundles
    List {
        /// Bundle files, in overlay order
        #[arg(required = true)]
        bundles: Vec<PathBuf>,
        /// Directory to list, bundle-internal
        #[arg(short, long, default_value = "")]
        dir: String,
    },

    /// Print a file from the first bundle that contains it
    Cat {
        /// Bundle-internal path to read
        path: String,
        /// Bundle files, in overlay order
        #[arg(required = true)]
        bundles: Vec<PathBuf>,
    },

    /// Materialize bundle contents into an extraction root
    Extract {
        /// Bundle files, in overlay order
        #[arg(required = true)]
        bundles: Vec<PathBuf>,
        /// Output directory (holds the extraction root and version stamps)
        #[arg(short, long)]
        out: PathBuf,
        /// Directory to extract, bundle-internal
        #[arg(short, long, default_value = "")]
        dir: String,
        /// Extract loadable units and versioned libraries too
        #[arg(long)]
        all: bool,
    },

    /// Resolve a dotted module name against the overlay
    Resolve {
        /// Dotted module name, e.g. "pkg.codec"
        name: String,
        /// Bundle files, in overlay order
        #[arg(required = true)]
        bundles: Vec<PathBuf>,
        /// Also materialize the located unit into this directory
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print the shared libraries a native binary declares
    Needed {
        /// Path to an ELF shared object
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::List { bundles, dir } => {
            let (overlay, _tmp) = open_overlay(&bundles, None)?;
            for name in overlay.list_dir(&dir)? {
                let child = tern_archive::overlay::join(&dir, &name);
                if overlay.is_dir(&child) {
                    println!("{name}/");
                } else {
                    println!("{name}");
                }
            }
        }

        Commands::Cat { path, bundles } => {
            let (overlay, _tmp) = open_overlay(&bundles, None)?;
            let bytes = overlay.read(&path)?;
            std::io::stdout().write_all(&bytes)?;
        }

        Commands::Extract {
            bundles,
            out,
            dir,
            all,
        } => {
            let (overlay, _tmp) = open_overlay(&bundles, Some(&out))?;
            if all {
                overlay.extract_dir(&dir, true, &|_| true)?;
            } else {
                let resolver = Resolver::new(overlay.clone(), Loaders::default());
                resolver.extract_data_dir(&dir, true)?;
            }
            println!("extracted to {}", overlay.extract_root().display());
        }

        Commands::Resolve { name, bundles, out } => {
            let (overlay, _tmp) = open_overlay(&bundles, out.as_deref())?;
            let resolver = Resolver::new(overlay, Loaders::default());
            match resolver.resolve(&name)? {
                Some(Located::Unit {
                    kind,
                    archive,
                    zip_path,
                    is_package,
                }) => {
                    let kind = match kind {
                        UnitKind::Source => "source",
                        UnitKind::Bytecode => "bytecode",
                        UnitKind::Native => "native",
                    };
                    let role = if is_package { "package" } else { "module" };
                    let bundle = bundles[archive].display();
                    println!("{name}: {kind} {role} at {zip_path} (from {bundle})");
                    if out.is_some() {
                        let local = resolver.overlay().materialize(&zip_path)?;
                        println!("materialized: {}", local.display());
                    }
                }
                Some(Located::Namespace { dir_path }) => {
                    println!("{name}: namespace candidate at {}", dir_path.display());
                }
                None => bail!("'{name}' not found in the given bundles"),
            }
        }

        Commands::Needed { file } => {
            let needed = elf::needed_libraries(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            for soname in needed {
                println!("{soname}");
            }
        }
    }

    Ok(())
}

/// Open the bundles as an overlay. With `out` the extraction root and
/// version stamps persist there; otherwise they live in a throwaway
/// directory that only needs to survive the command.
fn open_overlay(
    bundles: &[PathBuf],
    out: Option<&Path>,
) -> Result<(Overlay, Option<tempfile::TempDir>)> {
    let (base, guard) = match out {
        Some(out) => (out.to_path_buf(), None),
        None => {
            let dir = tempfile::Builder::new().prefix("tern-cli.").tempdir()?;
            (dir.path().to_path_buf(), Some(dir))
        }
    };
    fs::create_dir_all(&base)?;

    let mut store = VersionStore::load(base.join("versions.json"))?;
    let mut sources = Vec::new();
    for path in bundles {
        let bytes =
            fs::read(path).with_context(|| format!("reading bundle {}", path.display()))?;
        let token = format!("{:08x}", crc32fast::hash(&bytes));
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bundle".to_string());
        sources.push(BundleSource {
            name,
            reader: Box::new(Cursor::new(bytes)),
            token,
        });
    }

    let overlay = Overlay::open(sources, base.join("root"), &mut store)?;
    Ok((overlay, guard))
}
