//! offscan CLI - offset discovery over process dumps.
//!
//! This binary provides a command-line interface for the offscan library:
//! analyze a dump, run a declarative search configuration against it, and
//! optionally sync the discovered ranges back into the configuration.

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use offscan::handlers;
use offscan::{DumpReader, Mode, OffsetFinder};

/// Offset-discovery engine for 64-bit Windows executable dumps.
#[derive(Parser)]
#[command(name = "offscan")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find offsets in a dump using a search configuration
    Find {
        /// Dump file to analyze
        #[arg(short, long)]
        file: PathBuf,

        /// Search configuration file (JSON, comments allowed)
        #[arg(short, long)]
        config: PathBuf,

        /// Write the findings as JSON to this file
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Sync the matched ranges back into the search configuration
        #[arg(long)]
        sync: bool,

        /// Treat the dump as a raw on-disk image instead of a region dump
        #[arg(long)]
        sparse: bool,
    },

    /// Show dump metadata: sections, function count, file version
    Info {
        /// Dump file to analyze
        #[arg(short, long)]
        file: PathBuf,

        /// Treat the dump as a raw on-disk image instead of a region dump
        #[arg(long)]
        sparse: bool,
    },
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Find {
            file,
            config,
            out,
            sync,
            sparse,
        } => find(file, config, out, sync, sparse),
        Commands::Info { file, sparse } => info(file, sparse),
    }
}

fn mode_for(sparse: bool) -> Mode {
    if sparse {
        Mode::Sparse
    } else {
        Mode::Regions
    }
}

fn find(
    file: PathBuf,
    config: PathBuf,
    out: Option<PathBuf>,
    sync: bool,
    sparse: bool,
) -> anyhow::Result<()> {
    println!("Analyzing dump: {}", file.display());

    let mut finder = OffsetFinder::init_with_mode(&file, mode_for(sparse))?;

    finder.use_region_handler(handlers::region_handler);
    finder.use_search_handlers(handlers::default_search_handlers());

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    spinner.set_message(format!("Searching with {}", config.display()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    finder.find_config_file(&config, sync)?;
    finder.sync_search_config()?;

    spinner.finish_and_clear();

    let findings = finder.findings();
    println!("Found {} offset(s):", findings.len());

    for finding in findings {
        println!("  {:<32} {}", finding.target.search_id, finding.value);
    }

    if let Some(out) = out {
        std::fs::write(&out, serde_json::to_string_pretty(findings)?)?;
        println!("Findings written to {}", out.display());
    }

    Ok(())
}

fn info(file: PathBuf, sparse: bool) -> anyhow::Result<()> {
    use bytesize::ByteSize;

    let mut reader = DumpReader::open(&file)?;
    reader.analyze(mode_for(sparse))?;

    let file_size = std::fs::metadata(&file)?.len();
    println!("Dump: {} ({})", file.display(), ByteSize::b(file_size));

    if reader.mode() == Mode::Regions {
        let metadata = reader.metadata();
        println!("Base address: 0x{:016X}", metadata.base_address);
        println!(
            "Regions: {} ({} of payload)",
            reader.regions().len(),
            ByteSize::b(metadata.dump_section_size)
        );
    }

    match reader.pe_sections() {
        Some(sections) => {
            println!("{:<10} {:>12} {:>12}", "Section", "Offset", "Size");

            if let Some(header) = reader.pe_header() {
                println!(
                    "{:<10} {:>12} {:>12}",
                    header.name,
                    format!("0x{:X}", header.virtual_offset),
                    format!("0x{:X}", header.virtual_size)
                );
            }

            for section in sections.all() {
                println!(
                    "{:<10} {:>12} {:>12}",
                    section.name,
                    format!("0x{:X}", section.virtual_offset),
                    format!("0x{:X}", section.virtual_size)
                );
            }
        }
        None => println!("No PE headers found"),
    }

    println!("Functions discovered: {}", reader.functions().len());

    if let Some(version) = reader.file_version() {
        println!("File version: {}", version);
    }

    Ok(())
}
