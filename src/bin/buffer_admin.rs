use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tiered_buffer::core::disk::dir_size;
use tiered_buffer::core::segment::DEFAULT_SEGMENT_SIZE;
use tiered_buffer::store::{DiskStore, PartitionedQueueStore, SpillPolicy};
use tiered_buffer::{StatsRegistry, Tier};

/// Both commands open the buffer directory exclusively; stop the agent first.
#[derive(Parser)]
#[command(name = "buffer-admin", version, about = "Disk buffer inspection and recovery")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the backlog of every queue in a disk buffer.
    Stats {
        #[arg(long = "dir")]
        dir: PathBuf,
        #[arg(long = "segment-size", default_value_t = DEFAULT_SEGMENT_SIZE as u64)]
        segment_size: u64,
    },
    /// Discard the backlog of every queue not marked active.
    Truncate {
        #[arg(long = "dir")]
        dir: PathBuf,
        #[arg(long = "segment-size", default_value_t = DEFAULT_SEGMENT_SIZE as u64)]
        segment_size: u64,
        /// Required; truncation cannot be undone.
        #[arg(long = "yes")]
        yes: bool,
    },
}

fn admin_policy() -> SpillPolicy {
    SpillPolicy {
        max_disk_usage_percent: 100.0,
        ..SpillPolicy::default()
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Stats { dir, segment_size } => {
            if !dir.is_dir() {
                bail!("{} is not a directory", dir.display());
            }
            let store = DiskStore::new("disk", &dir, admin_policy(), segment_size)?;
            store
                .open()
                .with_context(|| format!("opening buffer at {}", dir.display()))?;
            writeln!(
                out,
                "{:<32} {:>10} {:>12} {:>14} {:>14} {:>5}",
                "queue", "records", "points", "bytes", "on-disk", "parts"
            )?;
            for queue in store.queues() {
                let usage = store.usage(&queue);
                let queue_dir = dir.join(&queue);
                let mut on_disk = 0;
                for entry in std::fs::read_dir(&queue_dir)? {
                    on_disk += dir_size(&entry?.path())?;
                }
                writeln!(
                    out,
                    "{:<32} {:>10} {:>12} {:>14} {:>14} {:>5}",
                    queue,
                    usage.records,
                    usage.points,
                    usage.bytes,
                    on_disk,
                    store.partition_count(&queue)
                )?;
            }
            if let Some(disk) = store.disk_usage() {
                writeln!(
                    out,
                    "segments: {} bytes, filesystem {:.1}% used",
                    disk.used_bytes, disk.fs_used_percent
                )?;
            }
            store.close()?;
        }
        Commands::Truncate { dir, segment_size, yes } => {
            if !yes {
                bail!("truncate discards buffered data; pass --yes to proceed");
            }
            let stats = Arc::new(StatsRegistry::new());
            let tier = Tier::disk("disk", 0, &dir, admin_policy(), segment_size, stats)?;
            tier.start()
                .with_context(|| format!("opening buffer at {}", dir.display()))?;
            let purged = tier.truncate()?;
            if purged.is_empty() {
                writeln!(out, "nothing to truncate")?;
            }
            for queue in purged {
                writeln!(
                    out,
                    "{}: {} records, {} points discarded",
                    queue.queue, queue.records, queue.points
                )?;
            }
            tier.stop();
        }
    }
    out.flush()?;
    Ok(())
}
