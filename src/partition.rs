//! Partition table management: validation, fix-up of suspect fields, and
//! full table reconstruction by scanning the image for FAT32 volumes.

use std::io::{Read, Seek, Write};

use log::{info, warn};
use serde::Serialize;

use crate::error::SalvageError;
use crate::image::DiskImage;
use crate::layout::bpb::{self, BootSector};
use crate::layout::mbr::{Mbr, PartitionEntry, TYPE_FAT32_LBA};
use crate::layout::{BOOT_SIGNATURE, SECTOR_SIZE};

/// Read sector 0 and decode it. No validation; short images decode as a
/// zero-filled table.
pub fn load_mbr<S: Read + Write + Seek>(image: &mut DiskImage<S>) -> Result<Mbr, SalvageError> {
    let mut sector = [0u8; SECTOR_SIZE];
    image.read_at(0, &mut sector)?;
    Ok(Mbr::decode(&sector))
}

pub fn persist_mbr<S: Read + Write + Seek>(
    image: &mut DiskImage<S>,
    mbr: &Mbr,
) -> Result<(), SalvageError> {
    image.write_at(0, &mbr.encode())
}

/// A table is usable when it carries the boot signature and at least one
/// FAT32-typed entry whose boot sector passes strict validation.
pub fn is_usable<S: Read + Write + Seek>(image: &mut DiskImage<S>, mbr: &Mbr) -> bool {
    if !mbr.has_signature() {
        return false;
    }
    mbr.partitions
        .iter()
        .any(|p| !p.is_empty() && p.is_fat32() && boot_sector_valid_at(image, p.lba_first as u64))
}

fn boot_sector_valid_at<S: Read + Write + Seek>(image: &mut DiskImage<S>, lba: u64) -> bool {
    let mut sector = [0u8; SECTOR_SIZE];
    matches!(
        image.read_at(lba * SECTOR_SIZE as u64, &mut sector),
        Ok(n) if n == SECTOR_SIZE
    ) && bpb::validate(&sector)
}

/// Present a usable MBR: keep a valid on-disk table (fixing suspect fields),
/// otherwise rebuild it from a whole-image scan.
pub fn init_mbr<S: Read + Write + Seek>(image: &mut DiskImage<S>) -> Result<Mbr, SalvageError> {
    let mut mbr = load_mbr(image)?;
    if is_usable(image, &mbr) {
        fixup(image, &mut mbr)?;
        return Ok(mbr);
    }
    warn!("partition table failed validation, scanning image for FAT32 volumes");
    rebuild(image)
}

/// Rebuild the partition table by sweeping the image for valid FAT32 boot
/// sectors. The existing bootstrap bytes are preserved; only the table and
/// signature are replaced. The first volume found becomes the active entry,
/// and the sweep skips each discovered volume's full extent. A sweep that
/// finds no volume at all fails with `InvalidMbr` and writes nothing.
pub fn rebuild<S: Read + Write + Seek>(image: &mut DiskImage<S>) -> Result<Mbr, SalvageError> {
    let mut mbr = load_mbr(image)?;
    mbr.partitions = [PartitionEntry::decode(&[0u8; 16]); 4];
    mbr.signature = BOOT_SIGNATURE;

    let total_sectors = image.len() / SECTOR_SIZE as u64;
    let mut sector = [0u8; SECTOR_SIZE];
    let mut lba = 1u64;
    let mut slot = 0usize;

    while lba < total_sectors && slot < 4 {
        let n = image.read_at(lba * SECTOR_SIZE as u64, &mut sector)?;
        if n == SECTOR_SIZE && bpb::validate(&sector) {
            let boot = BootSector::decode(&sector);
            info!(
                "found FAT32 volume at LBA {lba}: {} sectors, {} per cluster",
                boot.total_sectors_32, boot.sectors_per_cluster
            );
            mbr.partitions[slot] = PartitionEntry {
                status: if slot == 0 { 0x80 } else { 0x00 },
                chs_first: [0; 3],
                partition_type: TYPE_FAT32_LBA,
                chs_last: [0; 3],
                lba_first: lba as u32,
                num_sectors: boot.total_sectors_32,
            };
            slot += 1;
            lba += boot.total_sectors_32.max(1) as u64;
        } else {
            lba += 1;
        }
    }

    if slot == 0 {
        // leave the on-disk table as it was: persisting an empty table
        // would destroy it without gaining a mountable volume
        return Err(SalvageError::InvalidMbr(
            "image scan found no FAT32 volumes".into(),
        ));
    }
    persist_mbr(image, &mbr)?;
    Ok(mbr)
}

/// Repair suspect fields of an otherwise valid table: a wrong type byte on a
/// slot whose boot sector parses, or a sector count disagreeing with the
/// volume's own geometry. Persists when anything changed.
pub fn fixup<S: Read + Write + Seek>(
    image: &mut DiskImage<S>,
    mbr: &mut Mbr,
) -> Result<bool, SalvageError> {
    let mut dirty = false;

    if !mbr.has_signature() {
        warn!("MBR signature missing, restoring 0xAA55");
        mbr.signature = BOOT_SIGNATURE;
        dirty = true;
    }

    for i in 0..mbr.partitions.len() {
        let p = mbr.partitions[i];
        if p.is_empty() || p.lba_first == 0 {
            continue;
        }

        let mut sector = [0u8; SECTOR_SIZE];
        let n = image.read_at(p.lba_first as u64 * SECTOR_SIZE as u64, &mut sector)?;
        if n != SECTOR_SIZE || !bpb::validate(&sector) {
            continue;
        }
        let boot = BootSector::decode(&sector);

        if !p.is_fat32() {
            info!(
                "partition {i}: type {:#04x} -> FAT32 LBA (0x0C)",
                p.partition_type
            );
            mbr.partitions[i].partition_type = TYPE_FAT32_LBA;
            dirty = true;
        }
        if p.num_sectors != boot.total_sectors_32 {
            info!(
                "partition {i}: sector count {} -> {}",
                p.num_sectors, boot.total_sectors_32
            );
            mbr.partitions[i].num_sectors = boot.total_sectors_32;
            dirty = true;
        }
    }

    if dirty {
        persist_mbr(image, mbr)?;
    }
    Ok(dirty)
}

/// Display record for one partition slot.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionInfo {
    pub index: usize,
    pub type_name: &'static str,
    pub partition_type: u8,
    pub start_lba: u32,
    pub num_sectors: u32,
    pub size: String,
    pub bootable: bool,
    pub fat32: bool,
}

pub fn list_partitions(mbr: &Mbr) -> Vec<PartitionInfo> {
    mbr.active_entries()
        .map(|(index, p)| PartitionInfo {
            index,
            type_name: p.partition_type_name(),
            partition_type: p.partition_type,
            start_lba: p.lba_first,
            num_sectors: p.num_sectors,
            size: format_size(p.size_bytes()),
            bootable: p.is_bootable(),
            fat32: p.is_fat32(),
        })
        .collect()
}

pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
