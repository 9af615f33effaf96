use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use fat_salvage::check::{check_volume, repair_chains};
use fat_salvage::image::DiskImage;
use fat_salvage::partition;
use fat_salvage::undelete;
use fat_salvage::volume::{RebuildOptions, Volume};

#[derive(Parser)]
#[command(name = "fat-salvage")]
#[command(about = "In-place repair and undelete for FAT32 disk images", long_about = None)]
struct Cli {
    /// Path to the raw disk image
    image: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the partition table, repairing it first if it is broken
    Info,
    /// Reconcile the FAT against the directory tree
    Check {
        /// Write the repaired FAT back to the image
        #[arg(long)]
        fix: bool,
        #[command(flatten)]
        target: Target,
    },
    /// Rebuild broken allocation chains for entries under a directory
    RepairChains {
        #[command(flatten)]
        target: Target,
    },
    /// List deleted entries in a directory with their recoverability
    ListDeleted {
        #[command(flatten)]
        target: Target,
    },
    /// Restore one deleted entry in place
    Restore {
        /// Slot index reported by list-deleted
        index: usize,
        /// Replacement for the lost first filename byte
        #[arg(long, default_value_t = '_')]
        first_char: char,
        #[command(flatten)]
        target: Target,
    },
    /// Restore a deleted directory entry and its whole subtree
    RestoreTree {
        /// Slot index reported by list-deleted
        index: usize,
        /// Replacement for the lost first filename byte
        #[arg(long, default_value_t = '_')]
        first_char: char,
        #[command(flatten)]
        target: Target,
    },
    /// Copy a deleted file's clusters out of the image without modifying it
    Extract {
        /// Slot index reported by list-deleted
        index: usize,
        /// Output file for the extracted data
        output: PathBuf,
        #[command(flatten)]
        target: Target,
    },
    /// Carve every deleted file under a directory tree into a host folder
    ExtractTree {
        /// Output directory; the on-image structure is mirrored beneath it
        output: PathBuf,
        #[command(flatten)]
        target: Target,
    },
}

#[derive(clap::Args)]
struct Target {
    /// Partition slot to operate on
    #[arg(long, default_value_t = 0)]
    partition: usize,
    /// Directory cluster (defaults to the volume's root)
    #[arg(long)]
    cluster: Option<u32>,
    /// Pin sectors-per-cluster during boot sector reconstruction
    #[arg(long)]
    spc: Option<u8>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Info => info(&cli.image),
        Commands::Check { fix, target } => {
            let mut vol = open_volume(&cli.image, &target)?;
            let report = check_volume(&mut vol, fix)?;
            println!(
                "{} directories visited, {} orphaned clusters freed, {} missing starts patched{}",
                report.directories_visited,
                report.orphans_freed,
                report.starts_patched,
                if fix { "" } else { " (dry run)" }
            );
            Ok(())
        }
        Commands::RepairChains { target } => {
            let mut vol = open_volume(&cli.image, &target)?;
            let dir = target.cluster.unwrap_or(vol.root_cluster());
            let report = repair_chains(&mut vol, dir)?;
            println!(
                "{} entries scanned, {} chains rebuilt, {} unrepairable",
                report.entries_scanned, report.chains_rebuilt, report.unrepairable
            );
            Ok(())
        }
        Commands::ListDeleted { target } => {
            let mut vol = open_volume(&cli.image, &target)?;
            let dir = target.cluster.unwrap_or(vol.root_cluster());
            let candidates = undelete::analyze(&mut vol, dir)?;
            if candidates.is_empty() {
                println!("No deleted entries in cluster {dir}.");
                return Ok(());
            }
            println!(
                "{:<6} {:<14} {:<6} {:>10}  {:<20} {:<8} Reason",
                "Index", "Name", "Type", "Size", "Last write", "Status"
            );
            for c in &candidates {
                println!(
                    "{:<6} {:<14} {:<6} {:>10}  {:<20} {:<8} {:?}",
                    c.entry_index,
                    c.name,
                    if c.is_directory { "<DIR>" } else { "FILE" },
                    c.size,
                    c.last_write
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default(),
                    if c.recoverable { "GOOD" } else { "LOST" },
                    c.status,
                );
            }
            Ok(())
        }
        Commands::Restore {
            index,
            first_char,
            target,
        } => {
            let mut vol = open_volume(&cli.image, &target)?;
            let dir = target.cluster.unwrap_or(vol.root_cluster());
            let restored =
                undelete::restore_file(&mut vol, dir, index, replacement_byte(first_char)?)?;
            println!(
                "Restored {} ({} bytes, {} clusters claimed)",
                restored.name, restored.size, restored.clusters_claimed
            );
            Ok(())
        }
        Commands::RestoreTree {
            index,
            first_char,
            target,
        } => {
            let mut vol = open_volume(&cli.image, &target)?;
            let dir = target.cluster.unwrap_or(vol.root_cluster());
            let report =
                undelete::restore_tree(&mut vol, dir, index, replacement_byte(first_char)?)?;
            println!(
                "Restored {} entries ({} skipped)",
                report.restored, report.skipped
            );
            Ok(())
        }
        Commands::Extract {
            index,
            output,
            target,
        } => {
            let mut vol = open_volume(&cli.image, &target)?;
            let dir = target.cluster.unwrap_or(vol.root_cluster());
            let candidates = undelete::analyze(&mut vol, dir)?;
            let candidate = candidates
                .iter()
                .find(|c| c.entry_index == index)
                .with_context(|| format!("no deleted entry at index {index}"))?;
            if candidate.is_directory {
                bail!("{} is a directory; use restore-tree", candidate.name);
            }

            let mut out = File::create(&output)
                .with_context(|| format!("failed to create {}", output.display()))?;
            let written = undelete::extract_file(
                &mut vol,
                candidate.start_cluster,
                candidate.size,
                &mut out,
            )?;
            println!(
                "Extracted {} bytes of {} to {}",
                written,
                candidate.name,
                output.display()
            );
            Ok(())
        }
        Commands::ExtractTree { output, target } => {
            let mut vol = open_volume(&cli.image, &target)?;
            let dir = target.cluster.unwrap_or(vol.root_cluster());
            let report = undelete::extract_tree(&mut vol, dir, &output)?;
            println!(
                "Carved {} files into {} ({} directories visited, {} entries skipped)",
                report.files_carved,
                output.display(),
                report.directories_visited,
                report.skipped
            );
            Ok(())
        }
    }
}

fn info(path: &Path) -> Result<()> {
    let mut image =
        DiskImage::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mbr = partition::init_mbr(&mut image)?;

    let infos = partition::list_partitions(&mbr);
    if infos.is_empty() {
        println!("No partitions found.");
        return Ok(());
    }
    for p in infos {
        println!(
            "Partition {}: type {:#04x} ({}), LBA {}, {} sectors ({}){}{}",
            p.index,
            p.partition_type,
            p.type_name,
            p.start_lba,
            p.num_sectors,
            p.size,
            if p.bootable { ", bootable" } else { "" },
            if p.fat32 { ", FAT32" } else { "" },
        );
    }
    Ok(())
}

fn open_volume(path: &Path, target: &Target) -> Result<Volume<File>> {
    let mut image =
        DiskImage::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mbr = partition::init_mbr(&mut image)?;

    let entry = *mbr
        .partitions
        .get(target.partition)
        .with_context(|| format!("no partition slot {}", target.partition))?;
    if entry.is_empty() {
        bail!("partition {} is empty", target.partition);
    }

    let opts = RebuildOptions {
        spc_override: target.spc,
    };
    let mut volume = Volume::bind(image, entry, &opts)?;
    volume.load_fat()?;
    Ok(volume)
}

fn replacement_byte(c: char) -> Result<u8> {
    if !c.is_ascii_graphic() {
        bail!("replacement character must be printable ASCII");
    }
    Ok(c as u8)
}
