#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use bptree::query::{SerialisationState, Value, print_value};
use bptree::schema::{ColumnSpec, ColumnType, Schema, TableSpec};
use bptree::storage::Allocator;
use bptree::{Column, ColumnError, EngineConfig, IntegerColumn, MemoryOutputStream, SlabArena};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Seed for the demo's random mutations, so runs are reproducible.
const DEMO_SEED: u64 = 0x5EED;

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bptree=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: max_node_size={}, arena_blocks={}, demo_elements={}",
        config.max_node_size,
        config.arena_blocks,
        config.demo_elements
    );

    if let Err(e) = run(&config) {
        tracing::error!("Demo failed: {e}");
        std::process::exit(1);
    }
}

fn run(config: &EngineConfig) -> Result<(), ColumnError> {
    let mut arena = SlabArena::with_config(config);
    let mut rng = StdRng::seed_from_u64(DEMO_SEED);

    let mut column = IntegerColumn::create(&mut arena, 0, config.demo_elements, 0, config.max_node_size)?;
    for _ in 0..config.max_node_size * 2 {
        column.add(&mut arena, rng.random_range(0..1_000_000))?;
    }
    for _ in 0..config.max_node_size {
        let size = column.size(&arena)?;
        let ndx = rng.random_range(0..=size);
        column.insert(&mut arena, ndx, -1)?;
    }
    column.verify(&arena);

    let size = column.size(&arena)?;
    let height = column.tree().height(&arena)?;
    tracing::info!(
        "Column holds {} rows in a tree of height {} ({} blocks in use)",
        size,
        height,
        arena.allocated_count()
    );

    let mut out = MemoryOutputStream::new();
    let offset = size / 4;
    let root = column.write_slice(&arena, offset, size / 2, &mut out)?;
    tracing::info!(
        "Compacted rows {}..{} into {} bytes (root {}, crc32 {:08x})",
        offset,
        offset + size / 2,
        out.len(),
        root,
        out.checksum()
    );

    let schema = Schema::new(vec![TableSpec::new("demo", vec![ColumnSpec::new("value", ColumnType::Int)])]);
    let state = SerialisationState::new(&schema);
    if let Some(table) = schema.table("demo") {
        let first = column.get(&arena, 0)?;
        match print_value(&Value::Int(first)) {
            Ok(text) => tracing::info!("Query form: {} == {}", state.describe_column(Some(table), Some(0)), text),
            Err(e) => tracing::warn!("Cannot describe first row: {e}"),
        }
    }

    column.destroy(&mut arena);
    Ok(())
}
