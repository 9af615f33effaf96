//! Deleted-entry analysis and in-place restoration.
//!
//! The analyzer enumerates entries tagged deleted, builds a cluster-claim
//! map under the contiguous-layout assumption, and arbitrates collisions.
//! The restorer re-lives a single entry by rewriting its first name byte and
//! claiming its clusters in the FAT, deferring every on-disk write until the
//! pre-flight checks pass.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{Read, Seek, Write};
use std::path::Path;

use chrono::NaiveDateTime;
use log::{info, warn};
use serde::Serialize;

use crate::error::SalvageError;
use crate::fat::EOC;
use crate::layout::dir::{DirEntry, DIR_ENTRY_SIZE, ENTRY_DELETED};
use crate::volume::Volume;

/// Depth cap for recursive subtree restoration and carving.
pub const MAX_RESTORE_DEPTH: usize = 64;

/// Sanity bound on a deleted entry's declared size during carving.
const MAX_CARVE_SIZE: u32 = 500 * 1024 * 1024;

/// Why a deleted entry is or is not recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CandidateStatus {
    /// Every claimed cluster is free and uncontested.
    Good,
    /// The claimed cluster range falls outside the volume.
    InvalidRange,
    /// A live file owns at least one claimed cluster.
    OverwrittenByLive,
    /// Another deleted entry won the claim arbitration.
    CollisionLost,
}

/// One deleted directory entry, as reported by the analyzer.
#[derive(Debug, Clone, Serialize)]
pub struct DeletedCandidate {
    /// 32-byte slot index within the directory's cluster chain.
    pub entry_index: usize,
    pub name: String,
    pub size: u32,
    pub start_cluster: u32,
    pub is_directory: bool,
    pub last_write: Option<NaiveDateTime>,
    pub created: Option<NaiveDateTime>,
    pub recoverable: bool,
    pub status: CandidateStatus,
    #[serde(skip)]
    write_stamp: u32,
    #[serde(skip)]
    creation_stamp: u32,
    #[serde(skip)]
    raw_name: [u8; 11],
}

/// Scan a directory for deleted entries and decide, per candidate, whether
/// its clusters can still be claimed.
pub fn analyze<S: Read + Write + Seek>(
    volume: &mut Volume<S>,
    dir_cluster: u32,
) -> Result<Vec<DeletedCandidate>, SalvageError> {
    let mut candidates = Vec::new();
    let entries_per_cluster = volume.bytes_per_cluster() as usize / DIR_ENTRY_SIZE;

    for (chain_index, cluster) in volume.dir_chain(dir_cluster).into_iter().enumerate() {
        let data = match volume.read_cluster(cluster) {
            Ok(data) => data,
            Err(e) => {
                warn!("skipping unreadable directory cluster {cluster}: {e}");
                continue;
            }
        };

        for (slot, raw) in data.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            let entry = DirEntry::decode(raw.try_into().unwrap());
            if entry.is_end_marker() {
                break;
            }
            if !entry.is_deleted() || entry.is_lfn() {
                continue;
            }

            candidates.push(DeletedCandidate {
                entry_index: chain_index * entries_per_cluster + slot,
                name: entry.restored_name(b'_'),
                size: entry.size,
                start_cluster: entry.start_cluster(),
                is_directory: entry.is_directory(),
                last_write: entry.write_datetime(),
                created: entry.creation_datetime(),
                recoverable: true,
                status: CandidateStatus::Good,
                write_stamp: entry.write_stamp(),
                creation_stamp: entry.creation_stamp(),
                raw_name: entry.name,
            });
        }
    }

    arbitrate_claims(volume, &mut candidates);
    Ok(candidates)
}

/// Build the cluster-claim map and run the four-tier arbitration.
fn arbitrate_claims<S: Read + Write + Seek>(
    volume: &Volume<S>,
    candidates: &mut [DeletedCandidate],
) {
    let limit = volume.total_clusters() as u64 + 2;
    let mut claims: BTreeMap<u32, Vec<usize>> = BTreeMap::new();

    for (i, candidate) in candidates.iter_mut().enumerate() {
        let needed = volume.clusters_needed(candidate.size);
        if needed == 0 {
            continue;
        }
        let start = candidate.start_cluster;
        if start < 2 || start as u64 + needed as u64 > limit {
            candidate.status = CandidateStatus::InvalidRange;
            candidate.recoverable = false;
            continue;
        }
        for cluster in start..start + needed {
            claims.entry(cluster).or_default().push(i);
        }
    }

    for (&cluster, claimants) in &claims {
        if volume.fat().entry(cluster) != 0 {
            for &i in claimants {
                candidates[i].status = CandidateStatus::OverwrittenByLive;
                candidates[i].recoverable = false;
            }
            continue;
        }

        let alive: Vec<usize> = claimants
            .iter()
            .copied()
            .filter(|&i| candidates[i].recoverable)
            .collect();
        if alive.len() < 2 {
            continue;
        }

        let mut winner = alive[0];
        for &challenger in &alive[1..] {
            winner = arbitrate_pair(candidates, winner, challenger);
        }
        for &i in &alive {
            if i != winner {
                candidates[i].status = CandidateStatus::CollisionLost;
                candidates[i].recoverable = false;
            }
        }
    }
}

/// Two-phase collision rule: a candidate created after the other finished
/// writing came later and wins; otherwise the later last-write wins. `a`
/// keeps its slot on full ties, so arbitration stays deterministic.
fn arbitrate_pair(candidates: &[DeletedCandidate], a: usize, b: usize) -> usize {
    let (ca, cb) = (&candidates[a], &candidates[b]);
    if ca.creation_stamp > cb.write_stamp {
        return a;
    }
    if cb.creation_stamp > ca.write_stamp {
        return b;
    }
    if cb.write_stamp > ca.write_stamp {
        b
    } else {
        a
    }
}

/// Result of a single-entry restore.
#[derive(Debug, Clone, Serialize)]
pub struct RestoredEntry {
    pub name: String,
    pub start_cluster: u32,
    pub size: u32,
    pub is_directory: bool,
    pub clusters_claimed: u32,
}

/// Restore one deleted entry in place.
///
/// Pre-flight re-checks that the entry is still deleted and every claimed
/// cluster is in range and free; nothing is written until they all pass.
/// Commit order: name byte in the buffer, FAT chain, FAT write-back,
/// directory cluster, flush.
pub fn restore_file<S: Read + Write + Seek>(
    volume: &mut Volume<S>,
    dir_cluster: u32,
    entry_index: usize,
    replacement: u8,
) -> Result<RestoredEntry, SalvageError> {
    let (cluster, offset) = locate_entry(volume, dir_cluster, entry_index)?;
    let mut data = volume.read_cluster(cluster)?;

    if data[offset] != ENTRY_DELETED {
        return Err(SalvageError::NotDeleted { index: entry_index });
    }
    let entry = DirEntry::decode(&data[offset..offset + DIR_ENTRY_SIZE].try_into().unwrap());

    let needed = volume.clusters_needed(entry.size);
    let start = entry.start_cluster();
    let limit = volume.total_clusters() as u64 + 2;
    if needed > 0 {
        if start < 2 || start as u64 + needed as u64 > limit {
            return Err(SalvageError::InvalidCluster(start));
        }
        for c in start..start + needed {
            if !volume.fat().is_free(c) {
                return Err(SalvageError::RestoreConflict { cluster: c });
            }
        }
        sniff_content(volume, &entry, start)?;
    }

    data[offset] = replacement;
    if needed > 0 {
        for i in 0..needed {
            let c = start + i;
            let next = if i + 1 == needed { EOC } else { c + 1 };
            volume.fat_mut().set(c, next);
        }
        volume.write_fat()?;
    }
    volume.write_cluster(cluster, &data)?;
    volume.flush()?;

    let restored = RestoredEntry {
        name: entry.restored_name(replacement),
        start_cluster: start,
        size: entry.size,
        is_directory: entry.is_directory(),
        clusters_claimed: needed,
    };
    info!(
        "restored {} ({} bytes, {} clusters from {})",
        restored.name, restored.size, needed, start
    );
    Ok(restored)
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TreeReport {
    pub restored: usize,
    pub skipped: usize,
}

/// Restore a deleted entry and, when it is a directory, every recoverable
/// entry beneath it. Children take `_` as their replacement first byte.
pub fn restore_tree<S: Read + Write + Seek>(
    volume: &mut Volume<S>,
    parent_dir_cluster: u32,
    entry_index: usize,
    replacement: u8,
) -> Result<TreeReport, SalvageError> {
    let restored = restore_file(volume, parent_dir_cluster, entry_index, replacement)?;
    let mut report = TreeReport {
        restored: 1,
        skipped: 0,
    };

    if restored.is_directory {
        // re-read for the authoritative start cluster
        let entry = read_entry(volume, parent_dir_cluster, entry_index)?;
        let start = entry.start_cluster();
        if start >= 2 {
            let mut visited = HashSet::new();
            visited.insert(parent_dir_cluster);
            restore_children(volume, start, &mut visited, 1, &mut report)?;
        }
    }

    Ok(report)
}

fn restore_children<S: Read + Write + Seek>(
    volume: &mut Volume<S>,
    dir_cluster: u32,
    visited: &mut HashSet<u32>,
    depth: usize,
    report: &mut TreeReport,
) -> Result<(), SalvageError> {
    if depth >= MAX_RESTORE_DEPTH {
        warn!("restore depth cap reached at cluster {dir_cluster}");
        return Ok(());
    }
    if !visited.insert(dir_cluster) {
        warn!("directory cycle at cluster {dir_cluster}, not descending");
        return Ok(());
    }

    let candidates = analyze(volume, dir_cluster)?;
    for candidate in candidates.iter().filter(|c| c.recoverable) {
        if is_dot_name(&candidate.raw_name) {
            continue;
        }

        match restore_file(volume, dir_cluster, candidate.entry_index, b'_') {
            Ok(child) => {
                report.restored += 1;
                if child.is_directory {
                    let entry = read_entry(volume, dir_cluster, candidate.entry_index)?;
                    let start = entry.start_cluster();
                    if start >= 2 && start != dir_cluster {
                        restore_children(volume, start, visited, depth + 1, report)?;
                    }
                }
            }
            Err(e) => {
                warn!("skipping {}: {e}", candidate.name);
                report.skipped += 1;
            }
        }
    }
    Ok(())
}

/// Copy a deleted file's data out of the image without modifying it.
///
/// Walks forward from the start cluster under the contiguous assumption,
/// reading the start cluster and every free cluster after it, and skipping
/// clusters a live file has since claimed. Returns bytes written.
pub fn extract_file<S: Read + Write + Seek>(
    volume: &mut Volume<S>,
    start_cluster: u32,
    size: u32,
    out: &mut dyn Write,
) -> Result<u64, SalvageError> {
    let bytes_per_cluster = volume.bytes_per_cluster();
    let limit = volume.total_clusters() + 2;
    let mut current = start_cluster;
    let mut remaining = size as u64;
    let mut written = 0u64;

    while remaining > 0 {
        if current < 2 || current >= limit {
            warn!("extraction reached the end of the data area at cluster {current}");
            break;
        }
        let usable = current == start_cluster || volume.fat().is_free(current);
        if usable {
            let data = volume.read_cluster(current)?;
            let chunk = remaining.min(bytes_per_cluster as u64) as usize;
            out.write_all(&data[..chunk])?;
            written += chunk as u64;
            remaining -= chunk as u64;
        }
        current += 1;
    }

    Ok(written)
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CarveReport {
    pub files_carved: usize,
    pub directories_visited: usize,
    pub skipped: usize,
}

/// Carve every deleted file under a live directory tree out to a host
/// folder, mirroring the on-image directory structure. The image itself is
/// never modified.
///
/// Deleted directories are not descended into; only files are carved, each
/// through the same contiguous-run walk as `extract_file`.
pub fn extract_tree<S: Read + Write + Seek>(
    volume: &mut Volume<S>,
    dir_cluster: u32,
    output_dir: &Path,
) -> Result<CarveReport, SalvageError> {
    let mut report = CarveReport::default();
    let mut visited = HashSet::new();
    carve_directory(volume, dir_cluster, output_dir, &mut visited, 0, &mut report)?;
    Ok(report)
}

fn carve_directory<S: Read + Write + Seek>(
    volume: &mut Volume<S>,
    dir_cluster: u32,
    host_dir: &Path,
    visited: &mut HashSet<u32>,
    depth: usize,
    report: &mut CarveReport,
) -> Result<(), SalvageError> {
    if depth >= MAX_RESTORE_DEPTH {
        warn!("carve depth cap reached at cluster {dir_cluster}");
        return Ok(());
    }
    if !visited.insert(dir_cluster) {
        warn!("directory cycle at cluster {dir_cluster}, not descending");
        return Ok(());
    }
    fs::create_dir_all(host_dir)?;
    report.directories_visited += 1;

    for cluster in volume.dir_chain(dir_cluster) {
        let data = match volume.read_cluster(cluster) {
            Ok(data) => data,
            Err(e) => {
                warn!("skipping unreadable directory cluster {cluster}: {e}");
                continue;
            }
        };

        for raw in data.chunks_exact(DIR_ENTRY_SIZE) {
            let entry = DirEntry::decode(raw.try_into().unwrap());
            if entry.is_end_marker() {
                break;
            }
            if entry.is_lfn() || entry.is_volume_label() || entry.is_dot_entry() {
                continue;
            }

            let start = entry.start_cluster();
            if entry.is_deleted() {
                if entry.is_directory()
                    || start < 2
                    || entry.size == 0
                    || entry.size > MAX_CARVE_SIZE
                {
                    report.skipped += 1;
                    continue;
                }
                let name = entry.restored_name(b'_');
                let path = host_dir.join(&name);
                let mut out = fs::File::create(&path)?;
                let written = extract_file(volume, start, entry.size, &mut out)?;
                info!("carved {name} ({written} bytes) to {}", path.display());
                report.files_carved += 1;
            } else if entry.is_directory() && start >= 2 && start != dir_cluster {
                let sub = host_dir.join(entry.short_name());
                carve_directory(volume, start, &sub, visited, depth + 1, report)?;
            }
        }
    }
    Ok(())
}

/// Map a slot index within a directory's chain to its cluster and byte
/// offset.
fn locate_entry<S: Read + Write + Seek>(
    volume: &Volume<S>,
    dir_cluster: u32,
    entry_index: usize,
) -> Result<(u32, usize), SalvageError> {
    let entries_per_cluster = volume.bytes_per_cluster() as usize / DIR_ENTRY_SIZE;
    let chain = volume.dir_chain(dir_cluster);
    let cluster = *chain
        .get(entry_index / entries_per_cluster)
        .ok_or(SalvageError::NoSuchEntry { index: entry_index })?;
    Ok((cluster, (entry_index % entries_per_cluster) * DIR_ENTRY_SIZE))
}

fn read_entry<S: Read + Write + Seek>(
    volume: &mut Volume<S>,
    dir_cluster: u32,
    entry_index: usize,
) -> Result<DirEntry, SalvageError> {
    let (cluster, offset) = locate_entry(volume, dir_cluster, entry_index)?;
    let data = volume.read_cluster(cluster)?;
    Ok(DirEntry::decode(
        &data[offset..offset + DIR_ENTRY_SIZE].try_into().unwrap(),
    ))
}

fn is_dot_name(raw: &[u8; 11]) -> bool {
    raw[0] == b'.'
}

/// Leading-byte signatures keyed by extension. A mismatch is reported as a
/// warning, never a veto: the table exists to flag doubtful restores.
const MAGIC_TABLE: &[(&[u8], &[u8])] = &[
    (b"JPG", &[0xFF, 0xD8]),
    (b"PNG", &[0x89, 0x50, 0x4E, 0x47]),
    (b"GIF", b"GIF8"),
    (b"PDF", b"%PDF"),
    (b"ZIP", &[0x50, 0x4B, 0x03, 0x04]),
    (b"BMP", b"BM"),
];

fn sniff_content<S: Read + Write + Seek>(
    volume: &mut Volume<S>,
    entry: &DirEntry,
    start: u32,
) -> Result<(), SalvageError> {
    let ext = entry.extension().to_vec();
    let Some((_, magic)) = MAGIC_TABLE.iter().find(|(e, _)| *e == ext.as_slice()) else {
        return Ok(());
    };
    let data = volume.read_cluster(start)?;
    if !data.starts_with(magic) {
        warn!(
            "{}: first cluster does not match the {} signature; contents may be stale",
            entry.restored_name(b'_'),
            String::from_utf8_lossy(&ext)
        );
    }
    Ok(())
}
