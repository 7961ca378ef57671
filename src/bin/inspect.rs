//! AtlasMV Inspect Binary
//!
//! Looks into a store file: header, chunks, maps and raw map contents.
//! Everything but `compact` opens the file read-only.

use std::path::PathBuf;

use atlasmv::{BytesType, Config, MvStore};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// AtlasMV store inspector
#[derive(Parser, Debug)]
#[command(name = "atlasmv-inspect")]
#[command(about = "Inspect and compact AtlasMV store files")]
#[command(version)]
struct Args {
    /// Store file
    file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the store header
    Header,

    /// List all chunks
    Chunks,

    /// List map names, ids and entry counts
    Maps,

    /// Print the entries of a bytes/bytes map
    Dump {
        /// Map name
        map: String,
    },

    /// Compact the file in place
    Compact {
        /// Time budget in milliseconds
        #[arg(short, long, default_value = "10000")]
        millis: u64,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atlasmv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::debug!("AtlasMV Inspect v{}", atlasmv::VERSION);

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> atlasmv::Result<()> {
    let read_only = !matches!(args.command, Commands::Compact { .. });
    let mut builder = Config::builder()
        .file_path(&args.file)
        .auto_commit_disabled();
    if read_only {
        builder = builder.read_only();
    }
    let store = MvStore::open(builder.build())?;

    match args.command {
        Commands::Header => print_header(&store),
        Commands::Chunks => print_chunks(&store),
        Commands::Maps => print_maps(&store)?,
        Commands::Dump { map } => dump_map(&store, &map)?,
        Commands::Compact { millis } => {
            let before = store.file_size();
            store.compact_file(millis)?;
            println!(
                "compacted {}: {} -> {} bytes, fill rate {}%",
                args.file.display(),
                before,
                store.file_size(),
                store.fill_rate()
            );
        }
    }

    if read_only {
        store.close_immediately();
        Ok(())
    } else {
        store.close()
    }
}

fn print_header(store: &MvStore) {
    let header = store.store_header();
    println!("format:             {} (read {})", header.format, header.format_read);
    println!("block size:         {}", header.block_size);
    println!("creation time:      {}", header.creation_time);
    println!("last chunk:         {} (version {})", header.last_chunk_id, header.last_chunk_version);
    println!("last block:         {}", header.last_block);
    println!("clean shutdown:     {}", header.clean_shutdown);
    println!("current version:    {}", store.current_version());
    println!("file size:          {}", store.file_size());
    println!("fill rate:          {}%", store.fill_rate());
    println!("chunks fill rate:   {}%", store.chunks_fill_rate());
}

fn print_chunks(store: &MvStore) {
    println!(
        "{:>8} {:>10} {:>10} {:>8} {:>14} {:>6}",
        "id", "version", "block", "blocks", "pages", "fill"
    );
    for chunk in store.chunks() {
        let block = if chunk.is_saved() {
            chunk.block.to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:>8} {:>10} {:>10} {:>8} {:>14} {:>5}%",
            chunk.id,
            chunk.version,
            block,
            chunk.len,
            format!("{}/{}", chunk.page_count_live, chunk.page_count),
            chunk.fill_rate()
        );
    }
}

fn print_maps(store: &MvStore) -> atlasmv::Result<()> {
    let meta = store.meta_map()?;
    println!("{:>6} {:>10}  name", "id", "entries");
    for entry in meta.cursor(None)? {
        let (name, metadata) = entry?;
        // only bytes/bytes maps can be opened without knowing their types
        let entries = match store.open_map::<BytesType, BytesType>(&name) {
            Ok(map) => map.size().to_string(),
            Err(_) => "?".to_string(),
        };
        println!("{:>6} {:>10}  {}", metadata.id, entries, name);
    }
    Ok(())
}

fn dump_map(store: &MvStore, name: &str) -> atlasmv::Result<()> {
    if !store.has_map(name)? {
        println!("no map named {}", name);
        return Ok(());
    }
    let map = store.open_map::<BytesType, BytesType>(name)?;
    for entry in map.cursor(None)? {
        let (key, value) = entry?;
        println!(
            "{} = {}",
            String::from_utf8_lossy(&key),
            String::from_utf8_lossy(&value)
        );
    }
    Ok(())
}
