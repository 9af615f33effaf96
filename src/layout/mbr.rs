use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;
use std::io::Cursor;

use super::{BOOT_SIGNATURE, SECTOR_SIZE};

pub const PARTITION_TABLE_OFFSET: usize = 446;
pub const PARTITION_ENTRY_SIZE: usize = 16;

/// MBR type bytes under which a FAT32 volume is recognized.
pub const TYPE_FAT32_CHS: u8 = 0x0B;
pub const TYPE_FAT32_LBA: u8 = 0x0C;

/// A single MBR partition table entry.
///
/// The CHS triples are carried opaquely; the engine addresses everything
/// through the LBA fields.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PartitionEntry {
    pub status: u8,
    pub chs_first: [u8; 3],
    pub partition_type: u8,
    pub chs_last: [u8; 3],
    pub lba_first: u32,
    pub num_sectors: u32,
}

impl PartitionEntry {
    pub fn decode(data: &[u8; PARTITION_ENTRY_SIZE]) -> Self {
        let mut cursor = Cursor::new(&data[8..16]);
        let lba_first = cursor.read_u32::<LittleEndian>().unwrap();
        let num_sectors = cursor.read_u32::<LittleEndian>().unwrap();

        Self {
            status: data[0],
            chs_first: [data[1], data[2], data[3]],
            partition_type: data[4],
            chs_last: [data[5], data[6], data[7]],
            lba_first,
            num_sectors,
        }
    }

    pub fn encode(&self) -> [u8; PARTITION_ENTRY_SIZE] {
        let mut out = [0u8; PARTITION_ENTRY_SIZE];
        out[0] = self.status;
        out[1..4].copy_from_slice(&self.chs_first);
        out[4] = self.partition_type;
        out[5..8].copy_from_slice(&self.chs_last);
        out[8..12].copy_from_slice(&self.lba_first.to_le_bytes());
        out[12..16].copy_from_slice(&self.num_sectors.to_le_bytes());
        out
    }

    /// An entry is empty iff both its first LBA and its sector count are zero.
    pub fn is_empty(&self) -> bool {
        self.lba_first == 0 && self.num_sectors == 0
    }

    pub fn is_fat32(&self) -> bool {
        matches!(self.partition_type, TYPE_FAT32_CHS | TYPE_FAT32_LBA)
    }

    pub fn is_bootable(&self) -> bool {
        self.status == 0x80
    }

    pub fn size_bytes(&self) -> u64 {
        self.num_sectors as u64 * SECTOR_SIZE as u64
    }

    pub fn partition_type_name(&self) -> &'static str {
        match self.partition_type {
            0x00 => "Empty",
            0x01 => "FAT12",
            0x04 | 0x06 => "FAT16",
            0x05 | 0x0F => "Extended",
            0x07 => "NTFS/exFAT",
            0x0B => "FAT32 (CHS)",
            0x0C => "FAT32 (LBA)",
            0x0E => "FAT16 (LBA)",
            0x1B => "Hidden FAT32 (CHS)",
            0x1C => "Hidden FAT32 (LBA)",
            0x82 => "Linux swap",
            0x83 => "Linux",
            0xEE => "GPT Protective",
            0xEF => "EFI System",
            _ => "Unknown",
        }
    }
}

/// Parsed MBR: 446 opaque bootstrap bytes, four partition entries, and the
/// trailing signature.
#[derive(Debug, Clone)]
pub struct Mbr {
    pub bootstrap: [u8; PARTITION_TABLE_OFFSET],
    pub partitions: [PartitionEntry; 4],
    pub signature: u16,
}

impl Mbr {
    /// Decode from exactly 512 bytes. Total: no field is validated here.
    pub fn decode(data: &[u8; SECTOR_SIZE]) -> Self {
        let mut bootstrap = [0u8; PARTITION_TABLE_OFFSET];
        bootstrap.copy_from_slice(&data[..PARTITION_TABLE_OFFSET]);

        let partitions = std::array::from_fn(|i| {
            let offset = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
            let entry: [u8; PARTITION_ENTRY_SIZE] =
                data[offset..offset + PARTITION_ENTRY_SIZE].try_into().unwrap();
            PartitionEntry::decode(&entry)
        });

        let signature = u16::from_le_bytes([data[510], data[511]]);

        Self {
            bootstrap,
            partitions,
            signature,
        }
    }

    pub fn encode(&self) -> [u8; SECTOR_SIZE] {
        let mut out = [0u8; SECTOR_SIZE];
        out[..PARTITION_TABLE_OFFSET].copy_from_slice(&self.bootstrap);
        for (i, entry) in self.partitions.iter().enumerate() {
            let offset = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
            out[offset..offset + PARTITION_ENTRY_SIZE].copy_from_slice(&entry.encode());
        }
        out[510..512].copy_from_slice(&self.signature.to_le_bytes());
        out
    }

    pub fn has_signature(&self) -> bool {
        self.signature == BOOT_SIGNATURE
    }

    /// Non-empty partition entries with their slot indexes.
    pub fn active_entries(&self) -> impl Iterator<Item = (usize, &PartitionEntry)> {
        self.partitions
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_mbr_bytes(entries: &[(u8, u8, u32, u32)], signature: u16) -> [u8; SECTOR_SIZE] {
        let mut data = [0u8; SECTOR_SIZE];
        for (i, (status, ptype, start_lba, sectors)) in entries.iter().enumerate() {
            let offset = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
            data[offset] = *status;
            data[offset + 4] = *ptype;
            data[offset + 8..offset + 12].copy_from_slice(&start_lba.to_le_bytes());
            data[offset + 12..offset + 16].copy_from_slice(&sectors.to_le_bytes());
        }
        data[510..512].copy_from_slice(&signature.to_le_bytes());
        data
    }

    #[test]
    fn test_decode_single_fat32() {
        let data = make_mbr_bytes(&[(0x80, 0x0C, 2048, 1048576)], 0xAA55);
        let mbr = Mbr::decode(&data);

        assert!(mbr.has_signature());
        assert!(mbr.partitions[0].is_bootable());
        assert!(mbr.partitions[0].is_fat32());
        assert_eq!(mbr.partitions[0].partition_type_name(), "FAT32 (LBA)");
        assert_eq!(mbr.partitions[0].lba_first, 2048);
        assert_eq!(mbr.partitions[0].num_sectors, 1048576);
        assert_eq!(mbr.partitions[0].size_bytes(), 1048576 * 512);
        assert!(!mbr.partitions[0].is_empty());
        assert!(mbr.partitions[1].is_empty());
        assert_eq!(mbr.active_entries().count(), 1);
    }

    #[test]
    fn test_missing_signature_decodes() {
        let data = make_mbr_bytes(&[], 0x0000);
        let mbr = Mbr::decode(&data);
        assert!(!mbr.has_signature());
        assert_eq!(mbr.active_entries().count(), 0);
    }

    #[test]
    fn test_encode_round_trip() {
        let mut data = make_mbr_bytes(
            &[(0x80, 0x0B, 63, 1024000), (0x00, 0x0C, 1024063, 2048000)],
            0xAA55,
        );
        // bootstrap bytes must survive the trip
        data[0] = 0xFA;
        data[445] = 0x33;

        let mbr = Mbr::decode(&data);
        assert_eq!(mbr.encode(), data);
    }

    #[test]
    fn test_is_empty_requires_both_zero() {
        let entry = PartitionEntry::decode(&[0u8; 16]);
        assert!(entry.is_empty());

        let data = make_mbr_bytes(&[(0, 0, 0, 100)], 0xAA55);
        let mbr = Mbr::decode(&data);
        assert!(!mbr.partitions[0].is_empty());
    }
}
