//! L2 refinement: slide a min-heap of reference minmer windows across each
//! L1 candidate range and locate the position of maximum shared-sketch size.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rustc_hash::FxHashMap;

use crate::index::ReferenceIndex;
use crate::l1::FragmentContext;
use crate::params::{Parameters, CONFIDENCE_INTERVAL};
use crate::slide_map::SlideMap;
use crate::stats::{j2md, md2j, md_lower_bound};
use crate::types::{
    L1Candidate, L2Locus, MappingResult, MinmerInfo, Offset, QuerySketch, STRAND_FWD,
    STRAND_REV,
};

/// Heap entry ordered by window end so the earliest-expiring minmer pops
/// first.
#[derive(PartialEq, Eq)]
struct ByWposEnd(MinmerInfo);

impl PartialOrd for ByWposEnd {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ByWposEnd {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.wpos_end, self.0.wpos, self.0.hash).cmp(&(
            other.0.wpos_end,
            other.0.wpos,
            other.0.hash,
        ))
    }
}

/// Close the open locus and either append it or merge it into the previous
/// one when they sit within a segment length of each other.
fn flush_locus(l2_out: &mut Vec<L2Locus>, mut locus: L2Locus, seg_len: Offset) {
    locus.mean_optimal_pos = (locus.optimal_start + locus.optimal_end) / 2;
    match l2_out.last_mut() {
        Some(last) if last.optimal_end + seg_len >= locus.optimal_start => {
            last.optimal_end = locus.optimal_end;
            last.mean_optimal_pos = (last.optimal_start + last.optimal_end) / 2;
        }
        _ => l2_out.push(locus),
    }
}

/// Scan the reference windows intersecting one L1 candidate and record the
/// positions of maximum shared-sketch size.
pub fn compute_l2_mapped_regions(
    sketch: &QuerySketch,
    frag: &FragmentContext,
    candidate: &L1Candidate,
    index: &ReferenceIndex,
    params: &Parameters,
    l2_out: &mut Vec<L2Locus>,
) {
    let window_len: Offset = (frag.len - params.segment_length).max(0);
    let windows = &index.by_window;

    // First window that could still be open at the candidate range start.
    let probe = (candidate.seq_id, candidate.range_start - params.segment_length - 1);
    let mut cursor = windows.partition_point(|m| (m.seq_id, m.wpos) < probe);

    let mut heap: BinaryHeap<Reverse<ByWposEnd>> = BinaryHeap::new();
    let mut freq: FxHashMap<u64, i64> = FxHashMap::default();
    let mut slide_map = SlideMap::new(sketch);

    // Seed with windows already open at the range start.
    while cursor < windows.len()
        && windows[cursor].seq_id == candidate.seq_id
        && windows[cursor].wpos < candidate.range_start
    {
        let mi = windows[cursor];
        if mi.wpos_end > candidate.range_start {
            let f = freq.entry(mi.hash).or_insert(0);
            *f += 1;
            if *f == 1 {
                slide_map.insert_minmer(&mi);
            }
            heap.push(Reverse(ByWposEnd(mi)));
        }
        cursor += 1;
    }

    let mut best_sketch_size: i64 = 1;
    let mut in_candidate = false;
    let mut locus = L2Locus::default();

    while cursor < windows.len()
        && windows[cursor].seq_id == candidate.seq_id
        && windows[cursor].wpos <= candidate.range_end + window_len
    {
        let mi = windows[cursor];
        cursor += 1;
        let prev_strand_votes = slide_map.strand_votes;

        // Expire windows that ended before the sliding range.
        while let Some(Reverse(top)) = heap.peek() {
            if top.0.wpos_end > mi.wpos - window_len {
                break;
            }
            let expired = heap.pop().unwrap().0 .0;
            let f = freq.entry(expired.hash).or_insert(0);
            *f -= 1;
            if *f == 0 {
                slide_map.delete_minmer(&expired);
            }
        }

        let f = freq.entry(mi.hash).or_insert(0);
        *f += 1;
        let newly_open = *f == 1;
        heap.push(Reverse(ByWposEnd(mi)));
        if !newly_open {
            // The hash is already represented in the sliding set; the shared
            // count cannot change at this position.
            continue;
        }
        slide_map.insert_minmer(&mi);

        let shared = slide_map.shared_sketch_elements;
        if shared > best_sketch_size {
            l2_out.clear();
            in_candidate = true;
            best_sketch_size = shared;
            locus.shared_sketch_size = shared;
            locus.optimal_start = mi.wpos - window_len;
            locus.optimal_end = mi.wpos - window_len;
        } else if shared == best_sketch_size {
            if !in_candidate {
                locus.shared_sketch_size = shared;
                locus.optimal_start = mi.wpos - window_len;
            }
            in_candidate = true;
            locus.optimal_end = mi.wpos - window_len;
        } else if in_candidate {
            locus.seq_id = candidate.seq_id;
            locus.strand = if prev_strand_votes >= 0 {
                STRAND_FWD
            } else {
                STRAND_REV
            };
            flush_locus(l2_out, locus, params.segment_length);
            locus = L2Locus::default();
            in_candidate = false;
        }
    }

    if in_candidate {
        locus.seq_id = candidate.seq_id;
        locus.strand = if slide_map.strand_votes >= 0 {
            STRAND_FWD
        } else {
            STRAND_REV
        };
        flush_locus(l2_out, locus, params.segment_length);
    }
}

/// Run L2 over a group of L1 candidates, best intersection first, with the
/// top-ANI early exit, and convert surviving loci into mapping results.
#[allow(clippy::too_many_arguments)]
pub fn do_l2_mapping(
    sketch: &QuerySketch,
    frag: &FragmentContext,
    candidates: &mut [L1Candidate],
    index: &ReferenceIndex,
    params: &Parameters,
    out: &mut Vec<MappingResult>,
) {
    if params.stage1_topani_filter {
        // Visit candidates in decreasing intersection order so the early
        // exit sees the best first.
        candidates.sort_unstable_by_key(|c| Reverse(c.intersection_size));
    }

    let sketch_size = sketch.sketch_size;
    if sketch_size == 0 {
        return;
    }
    let mut best_jaccard_numerator: f64 = 0.0;
    let mut l2_vec: Vec<L2Locus> = Vec::new();

    for candidate in candidates.iter() {
        if params.stage1_topani_filter {
            let best_ani =
                1.0 - j2md(best_jaccard_numerator / sketch_size as f64, params.kmer_size);
            let cutoff_ani = (best_ani - params.ani_diff).max(0.0);
            let cutoff_j = md2j(1.0 - cutoff_ani, params.kmer_size);
            if (candidate.intersection_size as f64) / (sketch_size as f64) < cutoff_j {
                break;
            }
        }

        l2_vec.clear();
        compute_l2_mapped_regions(sketch, frag, candidate, index, params, &mut l2_vec);

        for l2 in &l2_vec {
            let jaccard = l2.shared_sketch_size as f64 / sketch_size as f64;
            let mash_dist = j2md(jaccard, params.kmer_size);
            let nuc_identity = 1.0 - mash_dist;
            let nuc_identity_upper_bound = 1.0
                - md_lower_bound(
                    mash_dist,
                    sketch_size as usize,
                    params.kmer_size,
                    CONFIDENCE_INTERVAL,
                );

            let passes = nuc_identity >= params.percentage_identity
                || (params.keep_low_pct_id
                    && nuc_identity_upper_bound >= params.percentage_identity);
            if !passes {
                continue;
            }
            best_jaccard_numerator =
                best_jaccard_numerator.max(l2.shared_sketch_size as f64);

            let ref_start = l2.mean_optimal_pos;
            let ref_end = l2.mean_optimal_pos + frag.len;
            let block_length = (ref_end - ref_start).max(frag.len);
            let mut res = MappingResult {
                query_seq_id: frag.seq_counter,
                query_len: frag.len,
                query_start: 0,
                query_end: frag.len,
                ref_seq_id: l2.seq_id,
                ref_start,
                ref_end,
                strand: l2.strand,
                sketch_size,
                conserved_sketches: l2.shared_sketch_size,
                nuc_identity,
                nuc_identity_upper_bound,
                block_length,
                kmer_complexity: sketch.kmer_complexity,
                ..MappingResult::default()
            };
            res.approx_matches =
                (res.nuc_identity * res.block_length as f64 / 100.0).round() as i64;
            out.push(res);
        }
    }

    out.sort_unstable_by_key(|m| (m.ref_seq_id, m.ref_start));
}
