use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use heap::{CollectorKind, MemoryConfig, ObjectMemory};
use vm::process::{codes, execute_process, exit_code};
use vm::{image, Runtime};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Collector {
    TwoSpace,
    Generational,
    NonCollecting,
}

impl From<Collector> for CollectorKind {
    fn from(collector: Collector) -> Self {
        match collector {
            Collector::TwoSpace => CollectorKind::TwoSpace,
            Collector::Generational => CollectorKind::Generational,
            Collector::NonCollecting => CollectorKind::NonCollecting,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "plauder", about = "Image-based Smalltalk-family VM")]
struct Args {
    /// Path to the image snapshot.
    image: PathBuf,

    /// Semispace size in bytes.
    #[arg(long, default_value_t = 4 << 20)]
    heap_size: usize,

    /// Growth cap for the semispaces, in bytes.
    #[arg(long, default_value_t = 64 << 20)]
    max_heap_size: usize,

    /// Static heap chunk size in bytes.
    #[arg(long, default_value_t = 4 << 20)]
    static_heap_size: usize,

    #[arg(long, value_enum, default_value_t = Collector::TwoSpace)]
    collector: Collector,

    /// Young collections between full collections (generational mode).
    #[arg(long, default_value_t = 8)]
    right_collection_delay: u32,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = MemoryConfig {
        heap_size: args.heap_size,
        max_heap_size: args.max_heap_size,
        static_heap_size: args.static_heap_size,
        collector: args.collector.into(),
        right_collection_delay: args.right_collection_delay,
        ..MemoryConfig::default()
    };

    let mut memory = match ObjectMemory::new(config) {
        Ok(memory) => memory,
        Err(e) => {
            tracing::error!(error = e, "invalid memory configuration");
            return ExitCode::from(codes::INITIALIZATION_FAILED as u8);
        }
    };

    let file = match File::open(&args.image) {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(path = %args.image.display(), error = %e, "cannot open image");
            return ExitCode::from(codes::INITIALIZATION_FAILED as u8);
        }
    };
    let globals = match image::load_image(&mut memory, file) {
        Ok(globals) => globals,
        Err(e) => {
            tracing::error!(error = %e, "image load failed");
            return ExitCode::from(codes::INITIALIZATION_FAILED as u8);
        }
    };

    let mut rt = Runtime::new(memory, globals);
    let outcome = execute_process(&mut rt);

    let stats = rt.stats();
    tracing::info!(
        messages = stats.counters.messages_dispatched,
        objects = stats.counters.objects_allocated,
        blocks = stats.counters.blocks_invoked,
        method_cache_hits = stats.method_cache.hits,
        method_cache_misses = stats.method_cache.misses,
        block_cache_hits = stats.block_cache.hits,
        block_cache_misses = stats.block_cache.misses,
        collections = stats.memory.collections_count,
        "runtime statistics"
    );

    ExitCode::from(exit_code(&outcome) as u8)
}
