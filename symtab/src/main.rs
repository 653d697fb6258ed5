use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use symtab::{CacheOptions, GCacheOptions, SymbolCache, SymbolOptions};

#[derive(Parser, Debug)]
#[command(name = "symtab-dump")]
#[command(about = "Resolve instruction addresses of a running process to function names")]
struct Args {
    /// Target process ID
    #[arg(short, long)]
    pid: u32,

    /// Addresses to resolve, in hex (0x prefix optional)
    addresses: Vec<String>,

    /// Resolve the addresses this many times, starting a new cache round each time
    #[arg(short, long, default_value = "1")]
    rounds: u32,

    /// Number of processes kept in the pid cache
    #[arg(long, default_value = "256")]
    pid_cache_size: usize,

    /// Number of binaries kept in the build ID and same file caches
    #[arg(long, default_value = "1024")]
    elf_cache_size: usize,

    /// Rounds an unused entry survives outside the LRU
    #[arg(long, default_value = "3")]
    keep_rounds: u64,

    /// Keep Rust symbol names mangled
    #[arg(long)]
    no_demangle: bool,

    /// Print the cache contents as JSON when done
    #[arg(long)]
    dump_caches: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_address(s: &str) -> Result<u64> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid address {:?}", s))
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let addresses = args
        .addresses
        .iter()
        .map(|a| parse_address(a))
        .collect::<Result<Vec<_>>>()?;
    if addresses.is_empty() && !args.dump_caches {
        return Err(anyhow!("nothing to do: pass addresses or --dump-caches"));
    }

    let elf = GCacheOptions {
        size: args.elf_cache_size,
        keep_rounds: args.keep_rounds,
    };
    let options = CacheOptions {
        pid_cache: GCacheOptions {
            size: args.pid_cache_size,
            keep_rounds: args.keep_rounds,
        },
        build_id_cache: elf,
        same_file_cache: elf,
    };
    let symbols = SymbolOptions {
        demangle: !args.no_demangle,
    };
    let mut cache = SymbolCache::with_symbol_options(options, symbols);

    for round in 0..args.rounds.max(1) {
        if round > 0 {
            cache.next_round();
        }
        info!("round {}: resolving {} addresses in {}", round, addresses.len(), args.pid);
        for &addr in &addresses {
            let sym = cache.resolve(args.pid, addr);
            println!("0x{:016x} {}", addr, sym);
        }
        cache.cleanup();
    }

    if args.dump_caches {
        if addresses.is_empty() {
            // load the process maps so there is something to show
            cache.resolve(args.pid, 0);
        }
        let dump = serde_json::json!({
            "pid_cache": cache.pid_cache_debug_info(),
            "elf_cache": cache.elf_cache_debug_info(),
        });
        println!("{}", serde_json::to_string_pretty(&dump)?);
    }

    Ok(())
}
