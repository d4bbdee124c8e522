use std::process::ExitCode;

use bytesize::ByteSize;
use clap::Parser;
use thousands::Separable;

use fixmalloc::{Allocator, ArenaId, Config, Mode, SizeClass, page_size};

/// Print the memory layout of a fixmalloc configuration.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// none, coarse or fine. Defaults to FIXMALLOC_MODE, then fine.
    #[arg(long)]
    mode: Option<String>,

    /// Defaults to FIXMALLOC_MAX_THREADS, then 8.
    #[arg(long)]
    max_threads: Option<usize>,

    /// Bytes reserved per private arena.
    #[arg(long)]
    arena_bytes: Option<usize>,

    /// Bytes reserved for the shared overflow arena.
    #[arg(long)]
    overflow_bytes: Option<usize>,

    /// Actually reserve and carve the regions, then report what came out.
    #[arg(long)]
    reserve: bool,
}

fn conv(size: usize) -> String {
    ByteSize::b(size as u64).to_string_as(true) // true for binary units (KiB, MiB, GiB, etc.)
}

fn convsum(size: usize) -> String {
    format!("{} ({})", size.separate_with_commas(), conv(size))
}

fn layout_map(config: &Config) {
    let private_arenas = config.mode.binding_limit(config.max_threads);
    println!("mode {}, up to {} threads, {} private arenas ({} with memory of their own)",
        config.mode, config.max_threads, private_arenas, config.backed_arenas());

    println!("{:>6} {:>8} {:>7} {:>14} {:>14} {:>18}", "class", "payload", "stride", "slots/arena", "overflow", "total slots");
    println!("{:>6} {:>8} {:>7} {:>14} {:>14} {:>18}", "-----", "-------", "------", "-----------", "--------", "-----------");
    for class in SizeClass::ALL {
        let (per_arena, overflow) = config.slots(class);
        let total = per_arena * config.backed_arenas() + overflow;
        println!("{:>6} {:>8} {:>7} {:>14} {:>14} {:>18}",
            class.to_string(), conv(class.payload()), class.stride(),
            per_arena.separate_with_commas(), overflow.separate_with_commas(), total.separate_with_commas());
    }

    let reserved = config.arena_bytes * config.backed_arenas() + config.overflow_bytes;
    println!("Each private arena is {}, the overflow arena {}.", convsum(config.arena_bytes), convsum(config.overflow_bytes));
    println!("Total reserved: {} (before rounding each region up to {} pages).", convsum(reserved), conv(page_size()));
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut config = Config::from_env();
    if let Some(mode) = &args.mode {
        config.mode = Mode::from_str_loose(mode);
    }
    if let Some(n) = args.max_threads {
        config.max_threads = n;
    }
    if let Some(b) = args.arena_bytes {
        config.arena_bytes = b;
    }
    if let Some(b) = args.overflow_bytes {
        config.overflow_bytes = b;
    }

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        return ExitCode::FAILURE;
    }
    layout_map(&config);

    if args.reserve {
        let mut a = match Allocator::with_config(config) {
            Ok(a) => a,
            Err(e) => {
                eprintln!("error: {e}");
                return ExitCode::FAILURE;
            }
        };
        println!("{:>16} {:>22} {:>22}", "arena", "small free/carved", "large free/carved");
        let ids = (0..config.mode.binding_limit(config.max_threads)).map(|i| ArenaId::Thread(i as u16));
        for id in ids.chain([ArenaId::Overflow]) {
            if let Some(c) = a.census(id) {
                println!("{:>16} {:>22} {:>22}", id.to_string(),
                    format!("{}/{}", c.small.free, c.small.carved),
                    format!("{}/{}", c.large.free, c.large.carved));
            }
        }
    }

    ExitCode::SUCCESS
}
