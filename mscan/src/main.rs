//! # mscan - Main Entry Point
//!
//! Scans one trace log and writes a JSON report:
//! - **Analyses** (default): call intervals, summary, serial sections
//! - **Dump** (`--dump`): every decoded record as one JSON dict
//!
//! Fatal trace or state errors exit with status 1; bad configuration with 2.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::fs::File;
use std::io::{self, Write};

use mscan::analysis;
use mscan::cli::Args;
use mscan::decode::TraceReader;
use mscan::dispatch::Dispatcher;
use mscan::domain::{DecodeError, ScanError};
use mscan::export::JsonStream;
use mscan::objects::load_nm_file;
use mscan::symbolization::Symbolizer;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.chain().any(|cause| cause.is::<ScanError>() || cause.is::<DecodeError>()) {
        EXIT_ERROR
    } else if err.to_string().to_lowercase().contains("config") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;
    let config = args.scan_config()?;

    // ── Collaborators ───────────────────────────────────────────────────
    let mut ctx = analysis::context(&config, args.dump);
    if let Some(ref vmlinux) = args.vmlinux {
        let symbolizer = Symbolizer::new(vmlinux).context("Failed to create symbolizer")?;
        ctx = ctx.with_symbols(Box::new(symbolizer));
    }
    // Static objects only matter to the analyses
    if let Some(symbols) = args.symbols.as_ref().filter(|_| !args.dump) {
        let loaded = load_nm_file(symbols, &mut ctx.objects)?;
        if !quiet {
            eprintln!(
                "symbols: {} static objects, {} per-cpu templates ({} skipped)",
                loaded.statics, loaded.templates, loaded.skipped
            );
        }
    }

    // ── Input and output ────────────────────────────────────────────────
    let mut reader = TraceReader::open(&args.trace)?;
    let sink: Box<dyn Write> = match args.output {
        Some(ref path) => Box::new(
            File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    };
    let stream = JsonStream::new(sink)?;
    let root = stream.root();

    if !quiet {
        eprintln!("mscan v{}", env!("CARGO_PKG_VERSION"));
        eprintln!("trace: {}", args.trace.display());
    }

    // ── Scan ────────────────────────────────────────────────────────────
    let mut dispatcher = Dispatcher::new(ctx).with_progress_interval(config.progress_interval);
    analysis::register(&mut dispatcher, &config, args.dump);

    let stats = dispatcher.run(&mut reader, &root)?.clone();
    root.done()?;
    stream.finish().context("Failed to write report")?;

    info!(
        "{} bytes decoded, {} live objects at end of log",
        reader.offset(),
        dispatcher.context().objects.live_count()
    );
    if !quiet {
        eprintln!("scanned: {} entries, last access {}", stats.entries, stats.last_access_count);
        if let Some(ref path) = args.output {
            eprintln!("saved: {}", path.display());
        }
    }

    Ok(())
}
