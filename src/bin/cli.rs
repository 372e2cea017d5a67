//! unimod CLI: identify a tracker module and print what the loader sees.
//!
//! Usage:
//!   um-cli path/to/file.xm
//!   um-cli path/to/file.it --title-only
//!   um-cli path/to/file.s3m --track 0
//!   um-cli --formats

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info};
use um_formats::{load_module, LoadOptions, MemReader, Registry, SamplePolicy};
use um_ir::{Module, Track, LAST_PATTERN, POS_SKIP};

/// Load a tracker module and print its structure
#[derive(Parser, Debug)]
#[command(name = "um-cli")]
#[command(about = "Load a tracker module and print its structure")]
struct Args {
    /// Module file to load
    #[arg(required_unless_present = "formats")]
    file: Option<PathBuf>,

    /// Accept known-buggy files that would otherwise be rejected
    #[arg(long)]
    curious: bool,

    /// Voice budget of the player (0 = no limit)
    #[arg(long, default_value_t = 0)]
    max_channels: u8,

    /// Leave samples that fail to decode empty instead of failing the load
    #[arg(long)]
    skip_bad_samples: bool,

    /// Print only the song title
    #[arg(long)]
    title_only: bool,

    /// Dump the decoded bytecode of one track
    #[arg(long, value_name = "N")]
    track: Option<usize>,

    /// List the supported formats and exit
    #[arg(long)]
    formats: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let mut registry = Registry::with_all();
    if args.formats {
        println!("{}", registry.info());
        return Ok(());
    }

    let Some(path) = &args.file else {
        bail!("no module file given");
    };
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    debug!("read {} bytes from {}", data.len(), path.display());

    if args.title_only {
        let title = registry.load_title(&mut MemReader::new(&data));
        return match title {
            Some(t) => {
                println!("{t}");
                Ok(())
            }
            None => bail!(
                "{}: {}",
                path.display(),
                registry
                    .last_error()
                    .map(|e| e.to_string())
                    .unwrap_or_default()
            ),
        };
    }

    let policy = if args.skip_bad_samples {
        SamplePolicy::SkipBad
    } else {
        SamplePolicy::Fatal
    };
    let opts = LoadOptions::default()
        .curious(args.curious)
        .max_channels(args.max_channels)
        .sample_policy(policy);

    let loaded = load_module(&data, opts)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    info!("loaded {} as {}", path.display(), loaded.loader);
    if !loaded.skipped_samples.is_empty() {
        info!("skipped samples: {:?}", loaded.skipped_samples);
    }

    let m = &loaded.module;
    match args.track {
        Some(n) => dump_track(m, n),
        None => {
            print_summary(m);
            Ok(())
        }
    }
}

fn print_summary(m: &Module) {
    println!("Format:      {}", m.format);
    println!("Title:       {}", m.title);
    println!("Channels:    {}", m.num_channels);
    println!("Patterns:    {}", m.num_patterns);
    println!("Tracks:      {}", m.num_tracks);
    println!("Orders:      {}", m.num_positions);
    println!("Instruments: {}", m.num_instruments);
    println!("Samples:     {}", m.num_samples);
    println!(
        "Tempo:       {} BPM, Speed: {}, Volume: {}",
        m.initial_tempo, m.initial_speed, m.initial_volume
    );
    println!("Flags:       {:?}", m.flags);
    if let Some(comment) = &m.comment {
        println!();
        println!("{comment}");
    }

    println!();
    let orders: Vec<String> = m
        .order()
        .iter()
        .map(|&p| match p {
            LAST_PATTERN => "--".to_string(),
            POS_SKIP => "++".to_string(),
            p => format!("{p:02X}"),
        })
        .collect();
    println!("Order: {}", orders.join(" "));

    println!();
    println!(" #   Name                          Length  Loop            Vol  Rate");
    for (i, s) in m.samples.iter().enumerate() {
        let lp = if s.has_loop() {
            format!("{}-{}", s.loop_start, s.loop_end)
        } else {
            String::new()
        };
        println!(
            "{:3} {:<29} {:>7} {:<15} {:>3} {:>5}",
            i + 1,
            s.name,
            s.length,
            lp,
            s.volume,
            s.speed
        );
    }
}

fn dump_track(m: &Module, n: usize) -> Result<()> {
    let Some(slot) = m.tracks.get(n) else {
        bail!("track {n} out of range (module has {})", m.tracks.len());
    };
    let Some(track) = slot else {
        println!("Track {n}: empty");
        return Ok(());
    };
    println!("Track {n}: {} rows", track.row_count());
    print_rows(track);
    Ok(())
}

fn print_rows(track: &Track) {
    let mut row = 0usize;
    for r in track.rows() {
        let events: Vec<String> = r
            .events()
            .map(|e| match e.opcode.operand_width() {
                0 => format!("{:?}", e.opcode),
                1 => format!("{:?}({:02X})", e.opcode, e.operand),
                _ => format!("{:?}({:04X})", e.opcode, e.operand),
            })
            .collect();
        let span = r.repeat as usize + 1;
        if span > 1 {
            println!("{row:02X}-{:02X} {}", row + span - 1, events.join(" "));
        } else {
            println!("{row:02X}    {}", events.join(" "));
        }
        row += span;
    }
}
