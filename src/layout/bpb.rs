use super::{BOOT_SIGNATURE, SECTOR_SIZE};

/// Byte offset of the "FAT32" filesystem-type tag within the boot sector.
pub const FS_TYPE_OFFSET: usize = 82;

/// FAT32 boot sector (BPB) fields the engine reads and rewrites.
///
/// Only semantic fields are modeled. `patch_into` writes them back into an
/// existing sector buffer so boot code and reserved bytes survive a rewrite;
/// `encode_fresh` builds a minimal sector from scratch for reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub media_descriptor: u8,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
    pub sectors_per_fat: u32,
    pub ext_flags: u16,
    pub root_cluster: u32,
    pub fsinfo_sector: u16,
    pub backup_boot_sector: u16,
}

impl BootSector {
    pub fn decode(data: &[u8; SECTOR_SIZE]) -> Self {
        Self {
            bytes_per_sector: u16::from_le_bytes([data[11], data[12]]),
            sectors_per_cluster: data[13],
            reserved_sectors: u16::from_le_bytes([data[14], data[15]]),
            num_fats: data[16],
            media_descriptor: data[21],
            hidden_sectors: u32::from_le_bytes([data[28], data[29], data[30], data[31]]),
            total_sectors_32: u32::from_le_bytes([data[32], data[33], data[34], data[35]]),
            sectors_per_fat: u32::from_le_bytes([data[36], data[37], data[38], data[39]]),
            ext_flags: u16::from_le_bytes([data[40], data[41]]),
            root_cluster: u32::from_le_bytes([data[44], data[45], data[46], data[47]]),
            fsinfo_sector: u16::from_le_bytes([data[48], data[49]]),
            backup_boot_sector: u16::from_le_bytes([data[50], data[51]]),
        }
    }

    /// Write the semantic fields into an existing sector, preserving every
    /// byte this struct does not model. Also restores the signature.
    pub fn patch_into(&self, sector: &mut [u8; SECTOR_SIZE]) {
        sector[11..13].copy_from_slice(&self.bytes_per_sector.to_le_bytes());
        sector[13] = self.sectors_per_cluster;
        sector[14..16].copy_from_slice(&self.reserved_sectors.to_le_bytes());
        sector[16] = self.num_fats;
        sector[21] = self.media_descriptor;
        sector[28..32].copy_from_slice(&self.hidden_sectors.to_le_bytes());
        sector[32..36].copy_from_slice(&self.total_sectors_32.to_le_bytes());
        sector[36..40].copy_from_slice(&self.sectors_per_fat.to_le_bytes());
        sector[40..42].copy_from_slice(&self.ext_flags.to_le_bytes());
        sector[44..48].copy_from_slice(&self.root_cluster.to_le_bytes());
        sector[48..50].copy_from_slice(&self.fsinfo_sector.to_le_bytes());
        sector[50..52].copy_from_slice(&self.backup_boot_sector.to_le_bytes());
        sector[510..512].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
    }

    /// Build a complete sector from scratch: jump stub, semantic fields,
    /// "FAT32" tag, signature. Everything else is explicitly zero.
    pub fn encode_fresh(&self) -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[0] = 0xEB;
        sector[1] = 0x58;
        sector[2] = 0x90;
        sector[FS_TYPE_OFFSET..FS_TYPE_OFFSET + 8].copy_from_slice(b"FAT32   ");
        self.patch_into(&mut sector);
        sector
    }

    /// Index of the active FAT copy (lower 4 bits of the extended flags).
    pub fn active_fat(&self) -> u8 {
        (self.ext_flags & 0x0F) as u8
    }
}

/// Strict FAT32 boot sector validation.
///
/// A buffer passes iff the signature and "FAT32" tag are present and every
/// geometry field is in its legal range. Used both for partition probing and
/// for the three-tier boot sector load.
pub fn validate(data: &[u8; SECTOR_SIZE]) -> bool {
    let signature = u16::from_le_bytes([data[510], data[511]]);
    if signature != BOOT_SIGNATURE {
        return false;
    }

    if &data[FS_TYPE_OFFSET..FS_TYPE_OFFSET + 5] != b"FAT32" {
        return false;
    }

    let bs = BootSector::decode(data);

    if !matches!(bs.bytes_per_sector, 512 | 1024 | 2048 | 4096) {
        return false;
    }
    if bs.sectors_per_cluster == 0
        || bs.sectors_per_cluster > 128
        || !bs.sectors_per_cluster.is_power_of_two()
    {
        return false;
    }
    if bs.reserved_sectors < 1 {
        return false;
    }
    if bs.num_fats < 1 || bs.num_fats > 2 {
        return false;
    }
    if bs.sectors_per_fat == 0 {
        return false;
    }
    if bs.root_cluster < 2 {
        return false;
    }
    if bs.total_sectors_32 == 0 {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BootSector {
        BootSector {
            bytes_per_sector: 512,
            sectors_per_cluster: 8,
            reserved_sectors: 32,
            num_fats: 2,
            media_descriptor: 0xF8,
            hidden_sectors: 2048,
            total_sectors_32: 262144,
            sectors_per_fat: 256,
            ext_flags: 0,
            root_cluster: 2,
            fsinfo_sector: 1,
            backup_boot_sector: 6,
        }
    }

    #[test]
    fn test_fresh_sector_validates_and_round_trips() {
        let bs = sample();
        let sector = bs.encode_fresh();
        assert!(validate(&sector));
        assert_eq!(BootSector::decode(&sector), bs);
        assert_eq!(&sector[..3], &[0xEB, 0x58, 0x90]);
    }

    #[test]
    fn test_patch_preserves_unmodeled_bytes() {
        let mut sector = sample().encode_fresh();
        // boot code and OEM name are outside the modeled fields
        sector[3..11].copy_from_slice(b"MSWIN4.1");
        sector[90] = 0xFA;
        sector[91] = 0x31;

        let mut patched = sector;
        let mut bs = BootSector::decode(&sector);
        bs.total_sectors_32 = 999_999;
        bs.patch_into(&mut patched);

        assert_eq!(&patched[3..11], b"MSWIN4.1");
        assert_eq!(patched[90], 0xFA);
        assert_eq!(patched[91], 0x31);
        assert_eq!(BootSector::decode(&patched).total_sectors_32, 999_999);
    }

    #[test]
    fn test_validate_rejects_each_bad_field() {
        let good = sample();

        let mut s = good.encode_fresh();
        s[510] = 0;
        assert!(!validate(&s));

        let mut s = good.encode_fresh();
        s[FS_TYPE_OFFSET] = b'N';
        assert!(!validate(&s));

        let mut bad = good;
        bad.bytes_per_sector = 513;
        assert!(!validate(&bad.encode_fresh()));

        let mut bad = good;
        bad.sectors_per_cluster = 3;
        assert!(!validate(&bad.encode_fresh()));

        let mut bad = good;
        bad.sectors_per_cluster = 0;
        assert!(!validate(&bad.encode_fresh()));

        let mut bad = good;
        bad.reserved_sectors = 0;
        assert!(!validate(&bad.encode_fresh()));

        let mut bad = good;
        bad.num_fats = 3;
        assert!(!validate(&bad.encode_fresh()));

        let mut bad = good;
        bad.sectors_per_fat = 0;
        assert!(!validate(&bad.encode_fresh()));

        let mut bad = good;
        bad.root_cluster = 1;
        assert!(!validate(&bad.encode_fresh()));

        let mut bad = good;
        bad.total_sectors_32 = 0;
        assert!(!validate(&bad.encode_fresh()));
    }

    #[test]
    fn test_active_fat_from_ext_flags() {
        let mut bs = sample();
        bs.ext_flags = 0x0081;
        assert_eq!(bs.active_fat(), 1);
    }
}
