// spacetime-miner — Proof of Space-Time miner control
//
// Plot lifecycle (create/list/delete) plus the mining daemon itself.
// Exit codes: 0 success, 1 runtime error, 2 invalid arguments.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use colored::*;
use uuid::Uuid;

use spacetime::config::MinerConfig;
use spacetime::consensus::chain::{ChainConfig, ChainStore};
use spacetime::crypto::keys::Secp256k1Signer;
use spacetime::mempool::{Mempool, MempoolConfig};
use spacetime::miner::runner::Miner;
use spacetime::miner::strategy::Strategy;
use spacetime::node::db::RocksKv;
use spacetime::node::session::LoopbackConnector;
use spacetime::plot::file::{self, PlotCreateParams};
use spacetime::plot::manager::{PlotManager, PlotStatus};

const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

fn print_usage() {
    println!("{}", "spacetime-miner — proof of space-time mining".bold());
    println!();
    println!("{}", "  Usage: spacetime-miner <command> [args...]".bright_yellow());
    println!();
    println!("{}", "  Commands:".bright_white().bold());
    let rows = [
        (
            "create-plot --size <GiB> [--output <path>] [--cache] [--cache-levels <0..20>]",
            "Build a new plot file",
        ),
        ("list-plots [--verbose]", "Show the plot registry"),
        (
            "delete-plot <id> [--delete-file] [--force]",
            "Remove a plot from the registry",
        ),
        ("start [--daemon]", "Run the miner"),
        ("stop", "Ask a running miner to shut down"),
        ("status", "Print the last status report"),
    ];
    for (cmd, desc) in rows {
        println!("  {} {:<74} {}", "❯".bright_black(), cmd.bright_green(), desc.white());
    }
    println!();
    println!(
        "  {} every command accepts {} to point at a config file",
        "note:".bright_black(),
        "--config <path>".bright_green()
    );
}

/// Tiny flag walker: positionals in order, `--flag` and `--flag value`.
struct Args {
    positional: Vec<String>,
    flags: Vec<(String, Option<String>)>,
}

impl Args {
    fn parse(raw: &[String]) -> Result<Self, String> {
        let mut positional = Vec::new();
        let mut flags = Vec::new();
        let mut iter = raw.iter().peekable();
        while let Some(arg) = iter.next() {
            if let Some(name) = arg.strip_prefix("--") {
                let value = match iter.peek() {
                    Some(next) if !next.starts_with("--") => Some(iter.next().unwrap().clone()),
                    _ => None,
                };
                flags.push((name.to_string(), value));
            } else {
                positional.push(arg.clone());
            }
        }
        Ok(Args { positional, flags })
    }

    fn flag_present(&self, name: &str) -> bool {
        self.flags.iter().any(|(n, _)| n == name)
    }

    fn flag_value(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_deref())
    }
}

fn fail(message: impl AsRef<str>, code: i32) -> ! {
    eprintln!("{} {}", "error:".bright_red().bold(), message.as_ref());
    std::process::exit(code);
}

fn load_config(args: &Args) -> MinerConfig {
    let path = args.flag_value("config").map(PathBuf::from);
    match MinerConfig::load(path.as_deref()) {
        Ok(config) => config,
        Err(e) => fail(e.to_string(), EXIT_ERROR),
    }
}

fn cmd_create_plot(args: &Args) -> i32 {
    let config = load_config(args);

    let Some(size_gib) = args.flag_value("size") else {
        fail("create-plot requires --size <GiB>", EXIT_USAGE);
    };
    let Ok(size_gib) = size_gib.parse::<u64>() else {
        fail("--size must be a whole number of GiB", EXIT_USAGE);
    };
    if size_gib == 0 || !size_gib.is_power_of_two() {
        fail("--size must be a power-of-two number of GiB", EXIT_USAGE);
    }

    let cache_levels = match args.flag_value("cache-levels") {
        Some(raw) => match raw.parse::<u8>() {
            Ok(levels) if levels <= 20 => Some(levels),
            _ => fail("--cache-levels must be within 0..20", EXIT_USAGE),
        },
        None if args.flag_present("cache") => Some(8),
        None => None,
    };

    let signer = match Secp256k1Signer::load_or_generate(&config.private_key_path) {
        Ok(signer) => signer,
        Err(e) => fail(format!("loading miner key: {e}"), EXIT_ERROR),
    };

    let mut seed = [0u8; 32];
    if getrandom::getrandom(&mut seed).is_err() {
        fail("system RNG unavailable", EXIT_ERROR);
    }

    if std::fs::create_dir_all(&config.plot_directory).is_err() {
        fail("cannot create plot directory", EXIT_ERROR);
    }
    let output_path = match args.flag_value("output") {
        Some(path) => PathBuf::from(path),
        None => config
            .plot_directory
            .join(format!("plot-{}.plot", Uuid::new_v4())),
    };

    let params = PlotCreateParams {
        size_bytes: size_gib * (1 << 30),
        miner_key: signer.address(),
        seed,
        output_path: output_path.clone(),
        cache_levels,
        created_at: spacetime::consensus::chain::unix_now() as u64,
    };

    println!(
        "{} building {} GiB plot at {}",
        "[plot]".bright_blue().bold(),
        size_gib,
        output_path.display()
    );
    let mut last_mark = 0u32;
    let result = file::create(&params, &mut |fraction| {
        let mark = (fraction * 20.0) as u32; // every 5%
        if mark > last_mark {
            last_mark = mark;
            eprintln!("{} {:>3}%", "[plot]".bright_blue().bold(), mark * 5);
        }
    });

    match result {
        Ok(created) => {
            println!(
                "{} done, merkle root {}",
                "[plot]".bright_green().bold(),
                hex::encode(created.header.merkle_root)
            );
            let manager = PlotManager::new(config.plot_metadata_path.clone(), 1);
            let _ = manager.load_metadata();
            match manager.add_plot(&created.path, None) {
                Ok(meta) => {
                    println!("{} registered as {}", "[plot]".bright_green().bold(), meta.id);
                    0
                }
                Err(e) => {
                    eprintln!("{} built but not registered: {e}", "warn:".yellow().bold());
                    0
                }
            }
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".bright_red().bold());
            EXIT_ERROR
        }
    }
}

fn cmd_list_plots(args: &Args) -> i32 {
    let config = load_config(args);
    let manager = PlotManager::new(config.plot_metadata_path.clone(), 1);
    if let Err(e) = manager.load_metadata() {
        fail(e.to_string(), EXIT_ERROR);
    }

    let plots = manager.plots();
    if plots.is_empty() {
        println!("no plots registered");
        return 0;
    }

    for plot in plots {
        let status = match plot.status {
            PlotStatus::Valid => "valid".bright_green(),
            PlotStatus::Missing => "missing".yellow(),
            PlotStatus::Corrupt => "corrupt".bright_red(),
        };
        println!(
            "{}  {:>8}  {:>12} bytes  {}",
            plot.id,
            status,
            plot.size_bytes,
            plot.file_path.display()
        );
        if args.flag_present("verbose") {
            println!("    leaves: {}  root: {}", plot.leaf_count, plot.merkle_root);
            if let Some(cache) = &plot.cache_path {
                println!("    cache: {}", cache.display());
            }
        }
    }
    0
}

fn cmd_delete_plot(args: &Args) -> i32 {
    let config = load_config(args);
    let Some(raw_id) = args.positional.get(1) else {
        fail("delete-plot requires a plot id", EXIT_USAGE);
    };
    let Ok(id) = Uuid::parse_str(raw_id) else {
        fail("plot id must be a UUID", EXIT_USAGE);
    };
    let delete_file = args.flag_present("delete-file");

    if !args.flag_present("force") {
        eprint!(
            "delete plot {}{}? [y/N] ",
            id,
            if delete_file { " and its file" } else { "" }
        );
        let mut answer = String::new();
        let _ = std::io::stdin().read_line(&mut answer);
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("aborted");
            return 0;
        }
    }

    let manager = PlotManager::new(config.plot_metadata_path.clone(), 1);
    if let Err(e) = manager.load_metadata() {
        fail(e.to_string(), EXIT_ERROR);
    }
    match manager.delete_plot(&id, delete_file) {
        Ok(()) => {
            println!("{} removed {}", "[plot]".bright_green().bold(), id);
            0
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".bright_red().bold());
            EXIT_ERROR
        }
    }
}

async fn cmd_start(args: &Args) -> i32 {
    let config = load_config(args);
    if args.flag_present("daemon") {
        eprintln!(
            "{} --daemon: run under a supervisor; no fork performed",
            "note:".bright_black()
        );
    }

    let signer = match Secp256k1Signer::load_or_generate(&config.private_key_path) {
        Ok(signer) => Arc::new(signer),
        Err(e) => fail(format!("loading miner key: {e}"), EXIT_ERROR),
    };

    let data_dir = config
        .plot_metadata_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    if std::fs::create_dir_all(&data_dir).is_err() {
        fail("cannot create data directory", EXIT_ERROR);
    }
    let kv = match RocksKv::open(&data_dir.join("chaindata")) {
        Ok(kv) => Arc::new(kv),
        Err(e) => fail(format!("opening chain store: {e}"), EXIT_ERROR),
    };
    let chain_config = ChainConfig {
        network_id: config.network_id.clone(),
        ..Default::default()
    };
    let chain = match ChainStore::open(kv, chain_config) {
        Ok(chain) => Arc::new(chain),
        Err(e) => fail(format!("loading chain state: {e}"), EXIT_ERROR),
    };

    let manager = Arc::new(PlotManager::new(
        config.plot_metadata_path.clone(),
        config.max_concurrent_proofs,
    ));
    let mempool = Arc::new(Mempool::new(MempoolConfig::default()));
    let miner = Arc::new(Miner::new(
        config,
        manager,
        chain.clone(),
        mempool,
        signer,
        Strategy::Full,
    ));

    // Ctrl-C flips the shutdown flag; the loop drains its scan and exits.
    let shutdown = miner.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} shutdown requested", "[miner]".bright_red().bold());
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    println!("{} mining started", "[miner]".bright_green().bold());
    let connector = LoopbackConnector::new(chain);
    match miner.run(&connector).await {
        Ok(()) => {
            println!("{} stopped", "[miner]".bright_green().bold());
            0
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".bright_red().bold());
            EXIT_ERROR
        }
    }
}

fn cmd_stop(args: &Args) -> i32 {
    let config = load_config(args);
    let stop_file = config.stop_file_path();
    if let Some(dir) = stop_file.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    match std::fs::write(&stop_file, b"stop\n") {
        Ok(()) => {
            println!("stop requested via {}", stop_file.display());
            0
        }
        Err(e) => {
            eprintln!("{} {e}", "error:".bright_red().bold());
            EXIT_ERROR
        }
    }
}

fn cmd_status(args: &Args) -> i32 {
    let config = load_config(args);
    match std::fs::read_to_string(config.status_file_path()) {
        Ok(report) => {
            println!("{report}");
            0
        }
        Err(_) => {
            eprintln!(
                "{} no status report at {} — is the miner running?",
                "error:".bright_red().bold(),
                config.status_file_path().display()
            );
            EXIT_ERROR
        }
    }
}

#[tokio::main]
async fn main() {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    if raw.is_empty() {
        print_usage();
        std::process::exit(EXIT_USAGE);
    }

    let args = match Args::parse(&raw) {
        Ok(args) => args,
        Err(e) => fail(e, EXIT_USAGE),
    };

    let code = match args.positional.first().map(String::as_str) {
        Some("create-plot") => cmd_create_plot(&args),
        Some("list-plots") => cmd_list_plots(&args),
        Some("delete-plot") => cmd_delete_plot(&args),
        Some("start") => cmd_start(&args).await,
        Some("stop") => cmd_stop(&args),
        Some("status") => cmd_status(&args),
        Some(other) => {
            eprintln!("{} unknown command {other:?}", "error:".bright_red().bold());
            print_usage();
            EXIT_USAGE
        }
        None => {
            print_usage();
            EXIT_USAGE
        }
    };
    std::process::exit(code);
}
