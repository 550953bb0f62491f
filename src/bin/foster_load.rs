//! Loads a batch of keys into an in-memory foster B-tree and reports what
//! the structure did.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use fosterdb::storage::btree::BTreeStatsSnapshot;
use fosterdb::{BTree, BTreeOptions, Result, StorageEnv, VerifyReport};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "foster-load",
    version,
    about = "Load keys into a foster B-tree and print split/adopt statistics"
)]
struct Cli {
    #[arg(long, short = 'n', default_value_t = 100_000, help = "Number of keys to insert")]
    count: u64,

    #[arg(long, value_enum, default_value_t = Order::Seq, help = "Insertion order")]
    order: Order,

    #[arg(long, default_value_t = 42, help = "Seed for --order random")]
    seed: u64,

    #[arg(long, default_value_t = 16, help = "Element size in bytes")]
    element_size: usize,

    #[arg(long, value_name = "N", help = "Cap on records per page")]
    cap: Option<u16>,

    #[arg(long, value_name = "BYTES", help = "Override the page size")]
    page_size: Option<u32>,

    #[arg(long, help = "Follow foster chains instead of adopting during descents")]
    lazy_adopt: bool,

    #[arg(long, value_name = "FILE", env = "FOSTERDB_CONFIG", help = "TOML options file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,

    #[arg(long, help = "Skip the full tree verification at the end")]
    no_verify: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Order {
    Seq,
    Reverse,
    Random,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Serialize)]
struct LoadReport {
    keys: u64,
    elapsed_ms: u128,
    stats: BTreeStatsSnapshot,
    verify: Option<VerifyReport>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(report) => {
            let healthy = report.verify.as_ref().map_or(true, VerifyReport::is_ok);
            if let Err(err) = print_report(&report, cli.format) {
                eprintln!("foster-load: {err}");
                return ExitCode::FAILURE;
            }
            if healthy {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }
        Err(err) => {
            eprintln!("foster-load: {err}");
            ExitCode::FAILURE
        }
    }
}

fn options_from(cli: &Cli) -> Result<BTreeOptions> {
    let mut options = match &cli.config {
        Some(path) => BTreeOptions::load(path)?,
        None => BTreeOptions::default(),
    };
    if let Some(page_size) = cli.page_size {
        options.page_size = page_size;
    }
    if cli.cap.is_some() {
        options.max_records_per_page = cli.cap;
    }
    if cli.lazy_adopt {
        options.adopt_eagerly = false;
    }
    options.validate()?;
    Ok(options)
}

fn keys_in_order(cli: &Cli) -> Vec<u64> {
    let mut keys: Vec<u64> = (0..cli.count).collect();
    match cli.order {
        Order::Seq => {}
        Order::Reverse => keys.reverse(),
        Order::Random => keys.shuffle(&mut ChaCha8Rng::seed_from_u64(cli.seed)),
    }
    keys
}

fn run(cli: &Cli) -> Result<LoadReport> {
    let options = options_from(cli)?;
    let tree = BTree::create(StorageEnv::in_memory(1, &options)?, options)?;
    let element = vec![0x5A; cli.element_size];
    let keys = keys_in_order(cli);

    let started = Instant::now();
    for key in &keys {
        tree.insert(key, &element)?;
    }
    let elapsed_ms = started.elapsed().as_millis();
    tree.emit_stats();

    let verify = if cli.no_verify { None } else { Some(tree.verify()?) };
    Ok(LoadReport {
        keys: cli.count,
        elapsed_ms,
        stats: tree.stats_snapshot(),
        verify,
    })
}

fn print_report(report: &LoadReport, format: Format) -> serde_json::Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(report)?),
        Format::Text => {
            let stats = &report.stats;
            println!("keys loaded      {}", report.keys);
            println!("elapsed          {} ms", report.elapsed_ms);
            println!("splits           {} ({} no-record)", stats.splits, stats.norecord_splits);
            println!("adopts           {}", stats.adopts);
            println!("grows            {}", stats.grows);
            println!("foster hops      {}", stats.foster_hops);
            println!("defrags          {}", stats.defrags);
            if let Some(verify) = &report.verify {
                println!(
                    "tree             {} pages, {} leaves, depth {}, {} foster links",
                    verify.pages, verify.leaves, verify.depth, verify.foster_links
                );
                for error in &verify.errors {
                    println!("  error: {error}");
                }
            }
        }
    }
    Ok(())
}
