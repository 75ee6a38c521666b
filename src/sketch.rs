//! Minmer sketching: canonical k-mer hashing, windowed minmer extraction for
//! the reference, and whole-fragment sketching for queries.
//!
//! Windows are tracked by their start offset. A minmer window `[wpos,
//! wpos_end)` is the maximal run of position windows in which a hash stays
//! within the s smallest distinct hashes of the window.

use std::collections::BTreeMap;

use crate::error::{MapError, Result};
use crate::types::{MinmerInfo, Offset, QuerySketch, SeqId, STRAND_FWD, STRAND_REV};

#[inline]
fn base_code(b: u8) -> Option<u64> {
    match b.to_ascii_uppercase() {
        b'A' => Some(0),
        b'C' => Some(1),
        b'G' => Some(2),
        b'T' => Some(3),
        _ => None,
    }
}

/// Invertible 64-bit mixer (murmur3 finalizer) applied to the packed
/// canonical k-mer code to remove positional bias in the ordering.
#[inline]
pub fn hash64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

/// Canonical hash and strand for every k-mer start position.
///
/// `None` marks positions whose k-mer spans a non-ACGT base. The canonical
/// form is the numerically smaller of the 2-bit packed forward and
/// reverse-complement codes, which coincides with lexicographic comparison.
fn kmer_canonical_hashes(seq: &[u8], k: usize) -> Vec<Option<(u64, i8)>> {
    let num_kmers = seq.len() - k + 1;
    let mut hashes = Vec::with_capacity(num_kmers);
    let mask: u64 = if k == 32 { u64::MAX } else { (1u64 << (2 * k)) - 1 };
    let rc_shift = 2 * (k - 1);

    let mut fwd: u64 = 0;
    let mut rev: u64 = 0;
    let mut valid_run = 0usize;

    for (i, &base) in seq.iter().enumerate() {
        if let Some(code) = base_code(base) {
            fwd = ((fwd << 2) | code) & mask;
            rev = (rev >> 2) | ((3 ^ code) << rc_shift);
            valid_run += 1;
        } else {
            valid_run = 0;
            fwd = 0;
            rev = 0;
        }
        if i + 1 >= k {
            if valid_run >= k {
                let (canonical, strand) = if fwd <= rev {
                    (fwd, STRAND_FWD)
                } else {
                    (rev, STRAND_REV)
                };
                hashes.push(Some((hash64(canonical), strand)));
            } else {
                hashes.push(None);
            }
        }
    }
    debug_assert_eq!(hashes.len(), num_kmers);
    hashes
}

#[derive(Debug)]
struct WindowEntry {
    count: u32,
    strand_sum: i32,
    /// Window index at which the hash entered the bottom set; -1 if outside.
    open_since: i64,
}

#[inline]
fn strand_of(sum: i32) -> i8 {
    if sum >= 0 {
        STRAND_FWD
    } else {
        STRAND_REV
    }
}

/// Streaming minmer extraction over position windows of width `seg_len`.
///
/// Appends one `MinmerInfo` per (hash, window-run) to `out`; output order is
/// close-time order, not `(seq_id, wpos)` order. Sequences shorter than
/// `seg_len` are treated as one window.
pub fn add_minmers(
    out: &mut Vec<MinmerInfo>,
    seq: &[u8],
    k: usize,
    seg_len: i64,
    sketch_size: usize,
    seq_id: SeqId,
) -> Result<()> {
    if seq.len() < k {
        return Err(MapError::InputTooShort { len: seq.len(), k });
    }
    let hashes = kmer_canonical_hashes(seq, k);
    let num_kmers = hashes.len();
    let seg_len = seg_len as usize;
    let (num_windows, kmers_per_window) = if seq.len() >= seg_len {
        (seq.len() - seg_len + 1, seg_len - k + 1)
    } else {
        (1, num_kmers)
    };

    let mut window: BTreeMap<u64, WindowEntry> = BTreeMap::new();
    let mut prev_active: Vec<u64> = Vec::with_capacity(sketch_size);
    let mut active: Vec<u64> = Vec::with_capacity(sketch_size);

    let mut add_kmer = |window: &mut BTreeMap<u64, WindowEntry>, idx: usize| {
        if let Some((hash, strand)) = hashes[idx] {
            let e = window.entry(hash).or_insert(WindowEntry {
                count: 0,
                strand_sum: 0,
                open_since: -1,
            });
            e.count += 1;
            e.strand_sum += strand as i32;
        }
    };

    for w in 0..num_windows {
        if w == 0 {
            for idx in 0..kmers_per_window {
                add_kmer(&mut window, idx);
            }
        } else {
            // Slide: the k-mer starting at w - 1 leaves, w + span - 1 enters.
            if let Some((hash, strand)) = hashes[w - 1] {
                let mut expired = false;
                if let Some(e) = window.get_mut(&hash) {
                    let old_sum = e.strand_sum;
                    e.count -= 1;
                    e.strand_sum -= strand as i32;
                    if e.count == 0 {
                        if e.open_since >= 0 {
                            out.push(MinmerInfo {
                                hash,
                                wpos: e.open_since as Offset,
                                wpos_end: w as Offset,
                                seq_id,
                                strand: strand_of(old_sum),
                            });
                        }
                        expired = true;
                    }
                }
                if expired {
                    window.remove(&hash);
                }
            }
            add_kmer(&mut window, w + kmers_per_window - 1);
        }

        // Diff the bottom set against the previous window's.
        active.clear();
        active.extend(window.keys().take(sketch_size).copied());
        let mut pi = 0;
        let mut ai = 0;
        while pi < prev_active.len() || ai < active.len() {
            if ai >= active.len()
                || (pi < prev_active.len() && prev_active[pi] < active[ai])
            {
                // Dropped out of the bottom set.
                let hash = prev_active[pi];
                if let Some(e) = window.get_mut(&hash) {
                    if e.open_since >= 0 {
                        out.push(MinmerInfo {
                            hash,
                            wpos: e.open_since as Offset,
                            wpos_end: w as Offset,
                            seq_id,
                            strand: strand_of(e.strand_sum),
                        });
                        e.open_since = -1;
                    }
                }
                pi += 1;
            } else if pi >= prev_active.len() || active[ai] < prev_active[pi] {
                // Entered the bottom set.
                if let Some(e) = window.get_mut(&active[ai]) {
                    if e.open_since < 0 {
                        e.open_since = w as i64;
                    }
                }
                ai += 1;
            } else {
                // Same hash in both bottom sets. If its last instance left
                // and a new one entered during this slide, the entry was
                // recreated closed and must be reopened at this window.
                if let Some(e) = window.get_mut(&active[ai]) {
                    if e.open_since < 0 {
                        e.open_since = w as i64;
                    }
                }
                pi += 1;
                ai += 1;
            }
        }
        std::mem::swap(&mut prev_active, &mut active);
    }

    // Close every run still open at the end of the sequence.
    for (&hash, e) in window.iter() {
        if e.open_since >= 0 {
            out.push(MinmerInfo {
                hash,
                wpos: e.open_since as Offset,
                wpos_end: num_windows as Offset,
                seq_id,
                strand: strand_of(e.strand_sum),
            });
        }
    }
    Ok(())
}

/// Whole-fragment sketch for the query path: the s smallest distinct
/// canonical hashes, ascending by hash, plus the k-mer complexity estimate.
pub fn sketch_sequence(
    seq: &[u8],
    k: usize,
    sketch_size: usize,
    seq_id: SeqId,
) -> Result<QuerySketch> {
    if seq.len() < k {
        return Err(MapError::InputTooShort { len: seq.len(), k });
    }
    let mut kmers: Vec<(u64, Offset, i8)> = kmer_canonical_hashes(seq, k)
        .into_iter()
        .enumerate()
        .filter_map(|(pos, h)| h.map(|(hash, strand)| (hash, pos as Offset, strand)))
        .collect();
    kmers.sort_unstable_by_key(|&(hash, pos, _)| (hash, pos));
    kmers.dedup_by_key(|e| e.0);
    kmers.truncate(sketch_size);

    let minmers: Vec<MinmerInfo> = kmers
        .iter()
        .map(|&(hash, pos, strand)| MinmerInfo {
            hash,
            wpos: pos,
            wpos_end: pos + 1,
            seq_id,
            strand,
        })
        .collect();

    let kmer_complexity = match minmers.last() {
        Some(last) if last.hash > 0 => {
            let max_hash_01 = last.hash as f64 / u64::MAX as f64;
            (minmers.len() as f64 / max_hash_01) / (((seq.len() - k + 1) * 2) as f64)
        }
        Some(_) => 1.0,
        None => 0.0,
    };

    Ok(QuerySketch {
        sketch_size: minmers.len() as i64,
        minmers,
        kmer_complexity,
    })
}

pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&b| match b.to_ascii_uppercase() {
            b'A' => b'T',
            b'C' => b'G',
            b'G' => b'C',
            b'T' => b'A',
            other => other,
        })
        .collect()
}
