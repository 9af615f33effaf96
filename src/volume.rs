//! A bound FAT32 volume: the image handle, the boot sector, derived
//! geometry, and the in-memory FAT.

use std::io::{Read, Seek, Write};

use log::{info, warn};

use crate::error::SalvageError;
use crate::fat::{self, FatTable};
use crate::image::DiskImage;
use crate::layout::bpb::{self, BootSector};
use crate::layout::mbr::PartitionEntry;
use crate::layout::SECTOR_SIZE;

/// Relative sector of the conventional backup boot sector.
const BACKUP_BOOT_OFFSET: u64 = 6;

/// How far past the partition start the reconstruction scan looks for FAT
/// signatures.
const FAT_SCAN_SECTORS: u64 = 4000;

/// First four bytes of a FAT32 copy on fixed media: entry 0 = 0x0FFFFFF8.
const FAT_SIGNATURE: [u8; 4] = [0xF8, 0xFF, 0xFF, 0x0F];

/// Sectors-per-cluster candidates, most common first.
const SPC_CANDIDATES: [u8; 8] = [8, 16, 32, 64, 1, 2, 4, 128];

/// Knobs for boot sector reconstruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct RebuildOptions {
    /// Pin sectors-per-cluster instead of probing for it.
    pub spc_override: Option<u8>,
}

/// An initialized FAT32 volume. Owns the image handle exclusively; the
/// in-memory FAT is authoritative until `write_fat` persists it.
pub struct Volume<S> {
    image: DiskImage<S>,
    partition: PartitionEntry,
    boot: BootSector,
    fat: FatTable,
    fat_begin: u64,
    data_begin: u64,
    total_clusters: u32,
}

impl<S: Read + Write + Seek> Volume<S> {
    /// Bind a partition: parse the main boot sector, fall back to the backup
    /// at sector 6 (healing the main copy from it), and finally reconstruct
    /// the geometry from on-disk evidence.
    pub fn bind(
        mut image: DiskImage<S>,
        partition: PartitionEntry,
        opts: &RebuildOptions,
    ) -> Result<Self, SalvageError> {
        if partition.is_empty() || partition.lba_first == 0 {
            return Err(SalvageError::InvalidBootSector(
                "partition entry is empty or starts at LBA 0".into(),
            ));
        }

        let boot = Self::bind_boot_sector(&mut image, &partition, opts)?;
        let mut volume = Self {
            image,
            partition,
            boot,
            fat: FatTable::default(),
            fat_begin: 0,
            data_begin: 0,
            total_clusters: 0,
        };
        volume.recompute_geometry();
        Ok(volume)
    }

    fn bind_boot_sector(
        image: &mut DiskImage<S>,
        partition: &PartitionEntry,
        opts: &RebuildOptions,
    ) -> Result<BootSector, SalvageError> {
        let part_offset = partition.lba_first as u64 * SECTOR_SIZE as u64;
        let mut sector = [0u8; SECTOR_SIZE];

        if image.read_at(part_offset, &mut sector)? == SECTOR_SIZE && bpb::validate(&sector) {
            info!("main boot sector OK");
            return Ok(BootSector::decode(&sector));
        }

        warn!("main boot sector invalid, trying backup at sector {BACKUP_BOOT_OFFSET}");
        let backup_offset = part_offset + BACKUP_BOOT_OFFSET * SECTOR_SIZE as u64;
        if image.read_at(backup_offset, &mut sector)? == SECTOR_SIZE && bpb::validate(&sector) {
            image.write_at(part_offset, &sector)?;
            info!("restored main boot sector from backup");
            return Ok(BootSector::decode(&sector));
        }

        warn!("backup boot sector also invalid, reconstructing geometry");
        let boot = reconstruct_boot_sector(image, partition, opts)?;
        image.write_at(part_offset, &boot.encode_fresh())?;
        info!(
            "reconstructed boot sector: reserved {}, {} sectors per FAT, {} per cluster",
            boot.reserved_sectors, boot.sectors_per_fat, boot.sectors_per_cluster
        );
        Ok(boot)
    }

    fn recompute_geometry(&mut self) {
        let bps = self.boot.bytes_per_sector as u64;
        let part_offset = self.partition.lba_first as u64 * SECTOR_SIZE as u64;

        self.fat_begin = part_offset + self.boot.reserved_sectors as u64 * bps;
        self.data_begin = self.fat_begin
            + self.boot.num_fats as u64 * self.boot.sectors_per_fat as u64 * bps;

        let overhead = self.boot.reserved_sectors as u32
            + self.boot.num_fats as u32 * self.boot.sectors_per_fat;
        let data_sectors = self.boot.total_sectors_32.saturating_sub(overhead);
        self.total_clusters = data_sectors / self.boot.sectors_per_cluster as u32;
    }

    /// Load the FAT: copy #1, falling back to copy #2 and mirroring the good
    /// copy back. When every copy is dead, a minimal table (media entry, EOC
    /// entry, root as a single-cluster chain) is written so the next pass
    /// can mount, and the load fails.
    pub fn load_fat(&mut self) -> Result<(), SalvageError> {
        let fat_bytes = self.fat_size_bytes();
        let mut buf = vec![0u8; fat_bytes as usize];

        // a short read counts as a failed copy, not a failed load
        if self.image.read_at(self.fat_begin, &mut buf)? == buf.len() {
            let first = FatTable::from_raw(&buf);
            if first.media_intact() {
                self.fat = first;
                info!("FAT #1 OK: {} entries", self.fat.len());
                return Ok(());
            }
        }
        warn!("FAT #1 failed structural validation");

        if self.boot.num_fats > 1 {
            if self.image.read_at(self.fat_begin + fat_bytes, &mut buf)? == buf.len() {
                let second = FatTable::from_raw(&buf);
                if second.media_intact() {
                    info!("FAT #2 OK, mirroring it over FAT #1");
                    self.image.write_at(self.fat_begin, &buf)?;
                    self.fat = second;
                    return Ok(());
                }
            }
            warn!("FAT #2 failed structural validation");
        }

        let mut seed = FatTable::with_len(fat_bytes as usize / 4);
        seed.set(0, 0x0FFF_FF00 | self.boot.media_descriptor as u32);
        seed.set(1, fat::EOC);
        if self.boot.root_cluster < seed.len() as u32 {
            seed.set(self.boot.root_cluster, fat::EOC);
        }
        self.fat = seed;
        self.write_fat()?;

        Err(SalvageError::FatUnreadable(
            "both FAT copies failed validation".into(),
        ))
    }

    /// Persist the in-memory FAT: every copy is written in order, flushed
    /// copy by copy, so a crash between copies leaves copy #1 complete.
    pub fn write_fat(&mut self) -> Result<(), SalvageError> {
        let raw = self.fat.to_raw();
        for i in 0..self.boot.num_fats as u64 {
            self.image
                .write_at(self.fat_begin + i * raw.len() as u64, &raw)?;
        }
        Ok(())
    }

    pub fn fat(&self) -> &FatTable {
        &self.fat
    }

    pub fn fat_mut(&mut self) -> &mut FatTable {
        &mut self.fat
    }

    pub fn boot(&self) -> &BootSector {
        &self.boot
    }

    pub fn partition(&self) -> &PartitionEntry {
        &self.partition
    }

    pub fn root_cluster(&self) -> u32 {
        self.boot.root_cluster
    }

    pub fn total_clusters(&self) -> u32 {
        self.total_clusters
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.boot.sectors_per_cluster as u32 * self.boot.bytes_per_sector as u32
    }

    /// Clusters needed to hold `size` bytes.
    pub fn clusters_needed(&self, size: u32) -> u32 {
        size.div_ceil(self.bytes_per_cluster())
    }

    /// Absolute byte offset of a data cluster.
    pub fn cluster_offset(&self, cluster: u32) -> Result<u64, SalvageError> {
        if cluster < 2 || cluster >= self.total_clusters + 2 {
            return Err(SalvageError::InvalidCluster(cluster));
        }
        Ok(self.data_begin + (cluster as u64 - 2) * self.bytes_per_cluster() as u64)
    }

    pub fn read_cluster(&mut self, cluster: u32) -> Result<Vec<u8>, SalvageError> {
        let offset = self.cluster_offset(cluster)?;
        let mut buf = vec![0u8; self.bytes_per_cluster() as usize];
        self.image.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    pub fn write_cluster(&mut self, cluster: u32, data: &[u8]) -> Result<(), SalvageError> {
        let offset = self.cluster_offset(cluster)?;
        self.image.write_at(offset, data)
    }

    /// The directory's cluster chain, falling back to the start cluster
    /// alone when the FAT gives nothing to follow.
    pub fn dir_chain(&self, dir_cluster: u32) -> Vec<u32> {
        let chain = self.fat.follow(dir_cluster);
        if chain.is_empty() {
            vec![dir_cluster]
        } else {
            chain
        }
    }

    pub fn flush(&mut self) -> Result<(), SalvageError> {
        self.image.flush()
    }

    /// Release the volume and hand the image handle back.
    pub fn into_image(self) -> DiskImage<S> {
        self.image
    }

    fn fat_size_bytes(&self) -> u64 {
        self.boot.sectors_per_fat as u64 * self.boot.bytes_per_sector as u64
    }
}

/// Geometry brute-force for a partition whose boot sectors are both dead:
/// locate the FAT copies by signature, infer sectors-per-cluster by probing
/// the root directory, and fall back to conventional defaults.
fn reconstruct_boot_sector<S: Read + Write + Seek>(
    image: &mut DiskImage<S>,
    partition: &PartitionEntry,
    opts: &RebuildOptions,
) -> Result<BootSector, SalvageError> {
    let part_offset = partition.lba_first as u64 * SECTOR_SIZE as u64;

    let mut boot = BootSector {
        bytes_per_sector: SECTOR_SIZE as u16,
        sectors_per_cluster: 8,
        reserved_sectors: 32,
        num_fats: 2,
        media_descriptor: 0xF8,
        hidden_sectors: partition.lba_first,
        total_sectors_32: partition.num_sectors,
        sectors_per_fat: 0,
        ext_flags: 0,
        root_cluster: 2,
        fsinfo_sector: 1,
        backup_boot_sector: 6,
    };

    let mut fat_starts: Vec<u64> = Vec::new();
    let mut sector = [0u8; SECTOR_SIZE];
    for rel in 1..FAT_SCAN_SECTORS {
        if image.read_at(part_offset + rel * SECTOR_SIZE as u64, &mut sector)? != SECTOR_SIZE {
            break;
        }
        if sector[..4] == FAT_SIGNATURE {
            fat_starts.push(rel);
            if fat_starts.len() == 2 {
                break;
            }
        }
    }

    match fat_starts.as_slice() {
        [first, second] => {
            boot.reserved_sectors = *first as u16;
            boot.sectors_per_fat = (second - first) as u32;
            info!("FAT copies found at relative sectors {first} and {second}");
        }
        [first] => {
            boot.reserved_sectors = *first as u16;
            boot.sectors_per_fat = estimate_sectors_per_fat(&boot);
            warn!(
                "single FAT signature at relative sector {first}; estimated {} sectors per FAT",
                boot.sectors_per_fat
            );
        }
        _ => {
            boot.sectors_per_fat = estimate_sectors_per_fat(&boot);
            warn!(
                "no FAT signatures within {FAT_SCAN_SECTORS} sectors; using defaults \
                 (reserved {}, {} sectors per FAT)",
                boot.reserved_sectors, boot.sectors_per_fat
            );
        }
    }

    boot.sectors_per_cluster = match opts.spc_override {
        Some(spc) => {
            info!("sectors-per-cluster pinned to {spc}");
            spc
        }
        None => probe_sectors_per_cluster(image, part_offset, &boot)?,
    };

    Ok(boot)
}

/// Sectors-per-FAT large enough to map the whole data area at the current
/// cluster-size guess.
fn estimate_sectors_per_fat(boot: &BootSector) -> u32 {
    let data_sectors = boot
        .total_sectors_32
        .saturating_sub(boot.reserved_sectors as u32) as u64;
    let clusters = data_sectors / boot.sectors_per_cluster.max(1) as u64;
    (((clusters + 2) * 4).div_ceil(SECTOR_SIZE as u64)).max(1) as u32
}

/// Try each candidate: derive the data region start, read the first sector
/// of cluster 2, and accept when any 32-byte window carries a plausible
/// directory attribute byte.
fn probe_sectors_per_cluster<S: Read + Write + Seek>(
    image: &mut DiskImage<S>,
    part_offset: u64,
    boot: &BootSector,
) -> Result<u8, SalvageError> {
    let mut sector = [0u8; SECTOR_SIZE];

    for &candidate in &SPC_CANDIDATES {
        let data_begin = part_offset
            + (boot.reserved_sectors as u64
                + boot.num_fats as u64 * boot.sectors_per_fat as u64)
                * boot.bytes_per_sector as u64;
        if image.read_at(data_begin, &mut sector)? != SECTOR_SIZE {
            continue;
        }
        if plausible_directory_sector(&sector) {
            info!("sectors-per-cluster probe accepted {candidate}");
            return Ok(candidate);
        }
    }

    warn!("no sectors-per-cluster candidate matched, defaulting to 8");
    Ok(8)
}

fn plausible_directory_sector(sector: &[u8; SECTOR_SIZE]) -> bool {
    use crate::layout::dir::{ATTR_ARCHIVE, ATTR_DIRECTORY, ATTR_VOLUME_ID};

    sector.chunks_exact(32).any(|window| {
        let attr = window[11];
        attr & (ATTR_DIRECTORY | ATTR_VOLUME_ID) != 0 || attr == ATTR_ARCHIVE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::dir::ATTR_ARCHIVE;
    use std::io::Cursor;

    const PART_LBA: u32 = 4;
    const RESERVED: u16 = 2;
    const SPF: u32 = 1;
    const NUM_FATS: u8 = 2;
    const SPC: u8 = 1;
    const CLUSTERS: u32 = 16;

    fn total_sectors() -> u32 {
        RESERVED as u32 + NUM_FATS as u32 * SPF + CLUSTERS * SPC as u32
    }

    fn boot_sector() -> BootSector {
        BootSector {
            bytes_per_sector: 512,
            sectors_per_cluster: SPC,
            reserved_sectors: RESERVED,
            num_fats: NUM_FATS,
            media_descriptor: 0xF8,
            hidden_sectors: PART_LBA,
            total_sectors_32: total_sectors(),
            sectors_per_fat: SPF,
            ext_flags: 0,
            root_cluster: 2,
            fsinfo_sector: 1,
            backup_boot_sector: 6,
        }
    }

    fn partition() -> PartitionEntry {
        PartitionEntry {
            status: 0x80,
            chs_first: [0; 3],
            partition_type: 0x0C,
            chs_last: [0; 3],
            lba_first: PART_LBA,
            num_sectors: total_sectors(),
        }
    }

    fn fat_offset(copy: usize) -> usize {
        (PART_LBA as usize + RESERVED as usize + copy * SPF as usize) * SECTOR_SIZE
    }

    fn set_fat(img: &mut [u8], copy: usize, cluster: u32, value: u32) {
        let off = fat_offset(copy) + cluster as usize * 4;
        img[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn build_image() -> Vec<u8> {
        let size = (PART_LBA + total_sectors()) as usize * SECTOR_SIZE;
        let mut img = vec![0u8; size];

        let bs = boot_sector().encode_fresh();
        let main = PART_LBA as usize * SECTOR_SIZE;
        img[main..main + SECTOR_SIZE].copy_from_slice(&bs);
        let backup = (PART_LBA as usize + 6) * SECTOR_SIZE;
        img[backup..backup + SECTOR_SIZE].copy_from_slice(&bs);

        for copy in 0..NUM_FATS as usize {
            set_fat(&mut img, copy, 0, 0x0FFF_FFF8);
            set_fat(&mut img, copy, 1, fat::EOC);
            set_fat(&mut img, copy, 2, fat::EOC);
        }

        // root directory: one archive entry so the SPC probe has something
        // to recognize
        let data_begin = (PART_LBA as usize + RESERVED as usize + NUM_FATS as usize) * SECTOR_SIZE;
        img[data_begin..data_begin + 11].copy_from_slice(b"README  TXT");
        img[data_begin + 11] = ATTR_ARCHIVE;

        img
    }

    fn volume_from(img: Vec<u8>) -> Volume<Cursor<Vec<u8>>> {
        let image = DiskImage::new(Cursor::new(img)).unwrap();
        Volume::bind(image, partition(), &RebuildOptions::default()).unwrap()
    }

    #[test]
    fn test_bind_main_boot_sector() {
        let vol = volume_from(build_image());
        assert_eq!(vol.boot(), &boot_sector());
        assert_eq!(vol.total_clusters(), CLUSTERS);
        assert_eq!(vol.bytes_per_cluster(), 512);
        assert_eq!(
            vol.fat_begin,
            (PART_LBA as u64 + RESERVED as u64) * SECTOR_SIZE as u64
        );
        assert_eq!(
            vol.data_begin,
            (PART_LBA as u64 + RESERVED as u64 + NUM_FATS as u64) * SECTOR_SIZE as u64
        );
    }

    #[test]
    fn test_bind_falls_back_to_backup_and_heals_main() {
        let mut img = build_image();
        let main = PART_LBA as usize * SECTOR_SIZE;
        img[main..main + SECTOR_SIZE].fill(0);

        let vol = volume_from(img);
        assert_eq!(vol.boot(), &boot_sector());

        // main sector now equals the backup byte for byte
        let img = vol.into_image().into_inner().into_inner();
        let backup = (PART_LBA as usize + 6) * SECTOR_SIZE;
        assert_eq!(
            &img[main..main + SECTOR_SIZE],
            &img[backup..backup + SECTOR_SIZE]
        );
    }

    #[test]
    fn test_bind_reconstructs_when_both_dead() {
        let mut img = build_image();
        let main = PART_LBA as usize * SECTOR_SIZE;
        let backup = (PART_LBA as usize + 6) * SECTOR_SIZE;
        img[main..main + SECTOR_SIZE].fill(0);
        img[backup..backup + SECTOR_SIZE].fill(0);

        let vol = volume_from(img);
        let boot = vol.boot();
        assert_eq!(boot.reserved_sectors, RESERVED);
        assert_eq!(boot.sectors_per_fat, SPF);
        assert_eq!(boot.num_fats, 2);
        assert_eq!(boot.sectors_per_cluster, 8);
        assert_eq!(boot.hidden_sectors, PART_LBA);
        assert_eq!(boot.total_sectors_32, total_sectors());

        // the reconstructed sector is persisted and passes validation
        let img = vol.into_image().into_inner().into_inner();
        let sector: [u8; SECTOR_SIZE] = img[main..main + SECTOR_SIZE].try_into().unwrap();
        assert!(bpb::validate(&sector));
    }

    #[test]
    fn test_reconstruct_honors_spc_override() {
        let mut img = build_image();
        let main = PART_LBA as usize * SECTOR_SIZE;
        let backup = (PART_LBA as usize + 6) * SECTOR_SIZE;
        img[main..main + SECTOR_SIZE].fill(0);
        img[backup..backup + SECTOR_SIZE].fill(0);

        let image = DiskImage::new(Cursor::new(img)).unwrap();
        let opts = RebuildOptions {
            spc_override: Some(4),
        };
        let vol = Volume::bind(image, partition(), &opts).unwrap();
        assert_eq!(vol.boot().sectors_per_cluster, 4);
    }

    #[test]
    fn test_load_fat_first_copy() {
        let mut vol = volume_from(build_image());
        vol.load_fat().unwrap();
        assert_eq!(vol.fat().entry(0), 0x0FFF_FFF8);
        assert_eq!(vol.fat().entry(2), fat::EOC);
        assert_eq!(vol.fat().len(), SECTOR_SIZE / 4);
    }

    #[test]
    fn test_load_fat_falls_back_to_second_copy() {
        let mut img = build_image();
        // kill entry 0 of copy #1 only
        set_fat(&mut img, 0, 0, 0);
        set_fat(&mut img, 0, 2, 0);

        let mut vol = volume_from(img);
        vol.load_fat().unwrap();
        assert_eq!(vol.fat().entry(0), 0x0FFF_FFF8);
        assert_eq!(vol.fat().entry(2), fat::EOC);

        // copy #1 on disk was rewritten from copy #2
        let img = vol.into_image().into_inner().into_inner();
        let off = fat_offset(0);
        assert_eq!(&img[off..off + 4], &[0xF8, 0xFF, 0xFF, 0x0F]);
        let off2 = off + 2 * 4;
        assert_eq!(&img[off2..off2 + 4], &fat::EOC.to_le_bytes());
    }

    #[test]
    fn test_load_fat_both_dead_seeds_and_fails() {
        let mut img = build_image();
        for copy in 0..NUM_FATS as usize {
            set_fat(&mut img, copy, 0, 0);
        }

        let mut vol = volume_from(img);
        let err = vol.load_fat().unwrap_err();
        assert!(matches!(err, SalvageError::FatUnreadable(_)));

        // a minimal table was written so the next mount succeeds
        let mut vol2 = volume_from(vol.into_image().into_inner().into_inner());
        vol2.load_fat().unwrap();
        assert_eq!(vol2.fat().entry(vol2.root_cluster()), fat::EOC);
    }

    #[test]
    fn test_write_fat_mirrors_all_copies() {
        let mut vol = volume_from(build_image());
        vol.load_fat().unwrap();
        vol.fat_mut().set(5, 6);
        vol.fat_mut().set(6, fat::EOC);
        vol.write_fat().unwrap();

        let img = vol.into_image().into_inner().into_inner();
        let c0 = &img[fat_offset(0)..fat_offset(0) + SECTOR_SIZE];
        let c1 = &img[fat_offset(1)..fat_offset(1) + SECTOR_SIZE];
        assert_eq!(c0, c1);
        assert_eq!(&c0[5 * 4..5 * 4 + 4], &6u32.to_le_bytes());
    }

    #[test]
    fn test_cluster_io_and_bounds() {
        let mut vol = volume_from(build_image());
        vol.write_cluster(3, &vec![0xAB; 512]).unwrap();
        assert_eq!(vol.read_cluster(3).unwrap(), vec![0xAB; 512]);

        assert!(matches!(
            vol.read_cluster(0),
            Err(SalvageError::InvalidCluster(0))
        ));
        assert!(matches!(
            vol.read_cluster(CLUSTERS + 2),
            Err(SalvageError::InvalidCluster(_))
        ));
    }

    #[test]
    fn test_clusters_needed() {
        let vol = volume_from(build_image());
        assert_eq!(vol.clusters_needed(0), 0);
        assert_eq!(vol.clusters_needed(1), 1);
        assert_eq!(vol.clusters_needed(512), 1);
        assert_eq!(vol.clusters_needed(513), 2);
    }
}
