use super::{ChunkTask, FetchError};
use crate::config::DEFAULT_CHUNK;
use crate::net::capacity::LaneChoices;
use std::collections::HashMap;
use std::net::IpAddr;

/// Slice `[0, total_size-1]` into ordered, contiguous, inclusive ranges
/// distributed across the snapshot's (interface, slot) entries in proportion
/// to their weights.
///
/// A single running cursor owns the partition: each entry receives
/// `floor(weight/total * size)` bytes, emitted as best-chunk-sized tasks
/// while at least two chunks remain in the share and one final task for the
/// rest, and the last entry absorbs all rounding slack up to `total_size-1`.
pub fn plan(
    total_size: u64,
    choices: &LaneChoices,
    best_chunks: &HashMap<IpAddr, u64>,
) -> Result<Vec<ChunkTask>, FetchError> {
    if total_size == 0 {
        return Err(FetchError::Planning("object size is zero".to_string()));
    }
    if choices.chunks.is_empty() {
        return Err(FetchError::Planning(
            "no chunk-lane entries in snapshot".to_string(),
        ));
    }

    // Before the first capacity tick every weight is zero; split evenly so
    // the first download still partitions.
    let uniform = choices.total_chunks <= 0.0;
    let total_weight = if uniform {
        choices.chunks.len() as f64
    } else {
        choices.total_chunks
    };

    let mut tasks: Vec<ChunkTask> = Vec::new();
    let mut cursor: u64 = 0;
    let last_idx = choices.chunks.len() - 1;

    for (i, entry) in choices.chunks.iter().enumerate() {
        if cursor >= total_size {
            break;
        }
        let remaining_total = total_size - cursor;

        let share = if i == last_idx {
            remaining_total
        } else {
            let weight = if uniform { 1.0 } else { entry.weight };
            let ideal = (weight / total_weight * total_size as f64).floor() as u64;
            ideal.min(remaining_total)
        };
        if share == 0 {
            continue;
        }

        let best = best_chunks
            .get(&entry.ip)
            .copied()
            .unwrap_or(DEFAULT_CHUNK)
            .max(1);

        let share_end = cursor + share; // exclusive
        while share_end - cursor >= 2 * best {
            tasks.push(ChunkTask {
                index: 0,
                start: cursor,
                end: cursor + best - 1,
                attempt: 0,
                nic_ip: entry.ip,
                slot: entry.slot,
            });
            cursor += best;
        }
        if share_end > cursor {
            tasks.push(ChunkTask {
                index: 0,
                start: cursor,
                end: share_end - 1,
                attempt: 0,
                nic_ip: entry.ip,
                slot: entry.slot,
            });
            cursor = share_end;
        }
    }

    debug_assert_eq!(cursor, total_size);
    for (index, task) in tasks.iter_mut().enumerate() {
        task.index = index;
    }
    Ok(tasks)
}
