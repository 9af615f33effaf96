//! Cross-table consistency: reconcile FAT-reachable clusters against the
//! directory tree, and rebuild allocation chains that no longer cover their
//! entry's declared size.

use std::collections::{BTreeSet, HashSet};
use std::io::{Read, Seek, Write};

use log::{info, warn};
use serde::Serialize;

use crate::error::SalvageError;
use crate::fat::{self, BAD_CLUSTER, EOC, EOC_MIN};
use crate::layout::dir::{DirEntry, DIR_ENTRY_SIZE};
use crate::volume::Volume;

/// Depth cap for directory traversal on hostile images.
pub const MAX_DIR_DEPTH: usize = 64;

#[derive(Debug, Default, Clone, Serialize)]
pub struct CheckReport {
    pub directories_visited: usize,
    pub orphans_freed: usize,
    pub starts_patched: usize,
}

/// Reconcile the FAT against the directory tree.
///
/// Clusters marked in the FAT but unreachable from any directory entry are
/// freed; start clusters referenced by a directory entry but free in the FAT
/// become single-cluster chains so their first cluster is readable again.
/// Truncated chains beyond the first cluster are the repairer's job.
pub fn check_volume<S: Read + Write + Seek>(
    volume: &mut Volume<S>,
    write_back: bool,
) -> Result<CheckReport, SalvageError> {
    let mut report = CheckReport::default();

    let (referenced, starts) = collect_directory_referenced(volume, &mut report)?;

    let upper = (volume.total_clusters() + 2).min(volume.fat().len() as u32);
    let marked: Vec<u32> = (2..upper)
        .filter(|&c| volume.fat().entry(c) != 0)
        .collect();

    for start in marked {
        if referenced.contains(&start) || volume.fat().entry(start) == 0 {
            continue;
        }
        let mut walk_visited = HashSet::new();
        let mut current = start;
        loop {
            if !walk_visited.insert(current) {
                break;
            }
            let next = volume.fat().entry(current);
            volume.fat_mut().set(current, fat::FREE);
            report.orphans_freed += 1;

            if next == 0 || next >= EOC_MIN || next == BAD_CLUSTER || next == current {
                break;
            }
            if next < 2 || next >= upper {
                break;
            }
            // a cross-linked orphan must not eat into a live chain
            if referenced.contains(&next) {
                break;
            }
            current = next;
        }
    }

    // only literal start clusters are patched: a chain that merely ends on
    // the free marker is the repairer's to reallocate
    for &cluster in &starts {
        if cluster >= 2 && cluster < upper && volume.fat().entry(cluster) == 0 {
            volume.fat_mut().set(cluster, EOC);
            report.starts_patched += 1;
        }
    }

    if report.orphans_freed > 0 || report.starts_patched > 0 {
        info!(
            "consistency: freed {} orphaned clusters, patched {} missing starts",
            report.orphans_freed, report.starts_patched
        );
    }
    if write_back {
        volume.write_fat()?;
    }
    Ok(report)
}

/// Depth-first sweep of the directory tree. Returns two sets: every cluster
/// reachable from a live entry (full chains, including the directories'
/// own), and the narrower set of literal start-cluster values. Orphan
/// detection needs the former; the missing-starts patch must only ever see
/// the latter.
fn collect_directory_referenced<S: Read + Write + Seek>(
    volume: &mut Volume<S>,
    report: &mut CheckReport,
) -> Result<(BTreeSet<u32>, BTreeSet<u32>), SalvageError> {
    let mut referenced = BTreeSet::new();
    let mut starts = BTreeSet::new();
    let mut visited = HashSet::new();
    let mut stack = vec![(volume.root_cluster(), 0usize)];
    starts.insert(volume.root_cluster());

    while let Some((dir, depth)) = stack.pop() {
        if depth >= MAX_DIR_DEPTH {
            warn!("directory depth cap reached at cluster {dir}");
            continue;
        }
        if !visited.insert(dir) {
            continue;
        }
        report.directories_visited += 1;

        let chain = volume.dir_chain(dir);
        referenced.extend(chain.iter().copied());

        for cluster in chain {
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
                if entry.is_deleted()
                    || entry.is_lfn()
                    || entry.is_volume_label()
                    || entry.is_dot_entry()
                {
                    continue;
                }

                let start = entry.start_cluster();
                if start < 2 {
                    continue;
                }
                starts.insert(start);
                if entry.is_directory() {
                    stack.push((start, depth + 1));
                } else {
                    referenced.extend(volume.fat().follow(start));
                }
            }
        }
    }

    Ok((referenced, starts))
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RepairReport {
    pub entries_scanned: usize,
    pub chains_rebuilt: usize,
    pub unrepairable: usize,
}

/// Rebuild the allocation chain of every live entry under `dir_cluster`
/// whose chain is missing, short, or broken, by claiming a contiguous free
/// run that fits the declared size.
pub fn repair_chains<S: Read + Write + Seek>(
    volume: &mut Volume<S>,
    dir_cluster: u32,
) -> Result<RepairReport, SalvageError> {
    let mut report = RepairReport::default();
    let mut fat_dirty = false;

    for dir_c in volume.dir_chain(dir_cluster) {
        let mut data = volume.read_cluster(dir_c)?;
        let mut cluster_dirty = false;

        for offset in (0..data.len()).step_by(DIR_ENTRY_SIZE) {
            let raw: [u8; DIR_ENTRY_SIZE] =
                data[offset..offset + DIR_ENTRY_SIZE].try_into().unwrap();
            let mut entry = DirEntry::decode(&raw);

            if entry.is_end_marker() {
                break;
            }
            if entry.is_deleted()
                || entry.is_lfn()
                || entry.is_volume_label()
                || entry.is_dot_entry()
            {
                continue;
            }
            report.entries_scanned += 1;

            let needed = volume.clusters_needed(entry.size);
            if needed == 0 {
                continue;
            }

            let start = entry.start_cluster();
            let chain = if start == 0 {
                Vec::new()
            } else {
                volume.fat().follow(start)
            };
            let broken_end = chain
                .last()
                .is_some_and(|&c| volume.fat().entry(c) == fat::FREE);
            let bad = chain.is_empty() || (chain.len() as u32) < needed || broken_end;
            if !bad {
                continue;
            }

            let hint = if start >= 2 { start } else { 2 };
            let Some(run) = volume
                .fat()
                .free_run(hint, needed, volume.total_clusters())
            else {
                let err = SalvageError::NoFreeRun { needed };
                warn!("cannot rebuild chain for {}: {err}", entry.short_name());
                report.unrepairable += 1;
                continue;
            };

            for &c in &chain {
                volume.fat_mut().set(c, fat::FREE);
            }
            for i in 0..needed {
                let c = run + i;
                let next = if i + 1 == needed { EOC } else { c + 1 };
                volume.fat_mut().set(c, next);
            }
            entry.set_start_cluster(run);
            data[offset..offset + DIR_ENTRY_SIZE].copy_from_slice(&entry.encode());

            info!(
                "rebuilt chain for {}: start {run}, {needed} clusters",
                entry.short_name()
            );
            cluster_dirty = true;
            fat_dirty = true;
            report.chains_rebuilt += 1;
        }

        if cluster_dirty {
            volume.write_cluster(dir_c, &data)?;
        }
    }

    if fat_dirty {
        volume.write_fat()?;
    }
    Ok(report)
}
