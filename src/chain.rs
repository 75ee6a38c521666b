//! Chain merging: link colinear fragment mappings through a disjoint-set
//! union, split overlong chains at clean boundaries, and merge each chain
//! fragment into a single reported mapping.

use crate::dset::DisjointSets;
use crate::params::Parameters;
use crate::types::{MappingResult, Offset, STRAND_FWD};

/// Snap adjacent colinear mappings to the midpoint of their gap so query and
/// reference halves line up.
fn adjust_consecutive_mappings(mappings: &mut [MappingResult], threshold: Offset) {
    for i in 1..mappings.len() {
        let (head, tail) = mappings.split_at_mut(i);
        let prev = &mut head[i - 1];
        let curr = &mut tail[0];

        if prev.ref_seq_id != curr.ref_seq_id || prev.strand != curr.strand {
            continue;
        }
        let query_gap = curr.query_start - prev.query_end;
        let ref_gap = curr.ref_start - prev.ref_end;
        if query_gap > 0 && ref_gap > 0 && query_gap <= threshold && ref_gap <= threshold {
            let query_mid = (prev.query_end + curr.query_start) / 2;
            let ref_mid = (prev.ref_end + curr.ref_start) / 2;
            prev.query_end = query_mid;
            prev.ref_end = ref_mid;
            curr.query_start = query_mid;
            curr.ref_start = ref_mid;

            prev.block_length = (prev.ref_end - prev.ref_start)
                .max(prev.query_end - prev.query_start);
            curr.block_length = (curr.ref_end - curr.ref_start)
                .max(curr.query_end - curr.query_start);
            prev.approx_matches =
                (prev.nuc_identity * prev.block_length as f64 / 100.0).round() as i64;
            curr.approx_matches =
                (curr.nuc_identity * curr.block_length as f64 / 100.0).round() as i64;
        }
    }
}

/// Collapse one chain fragment into its first member; the rest are flagged
/// for discard.
fn process_mapping_fragment(fragment: &mut [MappingResult]) {
    if fragment.is_empty() {
        return;
    }
    let mut query_start = Offset::MAX;
    let mut query_end = Offset::MIN;
    let mut ref_start = Offset::MAX;
    let mut ref_end = Offset::MIN;
    let mut identity_sum = 0.0;
    let mut complexity_sum = 0.0;
    for m in fragment.iter() {
        query_start = query_start.min(m.query_start);
        query_end = query_end.max(m.query_end);
        ref_start = ref_start.min(m.ref_start);
        ref_end = ref_end.max(m.ref_end);
        identity_sum += m.nuc_identity;
        complexity_sum += m.kmer_complexity;
    }
    let n = fragment.len() as i64;

    let head = &mut fragment[0];
    head.query_start = query_start;
    head.query_end = query_end;
    head.ref_start = ref_start;
    head.ref_end = ref_end;
    head.block_length = (ref_end - ref_start).max(query_end - query_start);
    head.n_merged = n;
    head.nuc_identity = identity_sum / n as f64;
    head.kmer_complexity = complexity_sum / n as f64;
    head.approx_matches =
        (head.nuc_identity * head.block_length as f64 / 100.0).round() as i64;

    for m in fragment.iter_mut().skip(1) {
        m.discard = true;
    }
}

/// Write the chain-global block length and identity back into every member.
fn compute_chain_statistics(chain: &mut [MappingResult]) {
    if chain.is_empty() {
        return;
    }
    let mut query_start = Offset::MAX;
    let mut query_end = Offset::MIN;
    let mut ref_start = Offset::MAX;
    let mut ref_end = Offset::MIN;
    let mut identity_sum = 0.0;
    for m in chain.iter() {
        query_start = query_start.min(m.query_start);
        query_end = query_end.max(m.query_end);
        ref_start = ref_start.min(m.ref_start);
        ref_end = ref_end.max(m.ref_end);
        identity_sum += m.nuc_identity;
    }
    let n = chain.len() as i64;
    let block_length = (query_end - query_start).max(ref_end - ref_start);
    let chain_identity = identity_sum / n as f64;
    for m in chain.iter_mut() {
        m.n_merged = n;
        m.block_length = block_length;
        m.block_nuc_identity = chain_identity;
    }
}

/// Split one chain into fragments of roughly `max_mapping_length`, cutting
/// only where successive members are colinear, then merge each fragment.
fn process_chain_with_splits(chain: &mut [MappingResult], params: &Parameters) {
    if chain.is_empty() {
        return;
    }
    let mut is_cuttable = vec![true; chain.len()];
    for i in 1..chain.len() {
        let prev = &chain[i - 1];
        let curr = &chain[i];
        if curr.query_start - prev.query_end > params.segment_length / 5
            || curr.ref_start - prev.ref_end > params.segment_length / 5
        {
            is_cuttable[i - 1] = false;
            is_cuttable[i] = false;
        }
    }

    adjust_consecutive_mappings(chain, params.segment_length);

    let mut fragment_start = 0usize;
    let mut accumulated: Offset = 0;
    for i in 0..chain.len() {
        accumulated += chain[i].query_end - chain[i].query_start;
        if accumulated >= params.max_mapping_length && is_cuttable[i] {
            process_mapping_fragment(&mut chain[fragment_start..=i]);
            fragment_start = i + 1;
            accumulated = 0;
        }
    }
    if fragment_start < chain.len() {
        process_mapping_fragment(&mut chain[fragment_start..]);
    }

    compute_chain_statistics(chain);
}

/// Group colinear fragment mappings into chains by 2D proximity.
///
/// On return `mappings` holds the surviving per-fragment mappings (chain
/// splits applied, subsidiary members removed) relabelled with their chain
/// representative, and the returned vector holds one maximally merged
/// mapping per chain for chain-level filtering.
pub fn merge_mappings_in_range(
    mappings: &mut Vec<MappingResult>,
    max_dist: Offset,
    params: &Parameters,
) -> Vec<MappingResult> {
    if mappings.len() < 2 {
        return mappings.clone();
    }

    mappings.sort_unstable_by_key(|m| (m.query_start, m.ref_seq_id, m.ref_start));
    for (idx, m) in mappings.iter_mut().enumerate() {
        m.split_mapping_id = idx as u64;
        m.discard = false;
        m.chain_pair_score = f64::MAX;
        m.chain_pair_id = i64::MIN;
    }

    let dsu = DisjointSets::new(mappings.len());

    for i in 0..mappings.len() {
        if mappings[i].chain_pair_score != f64::MAX {
            dsu.unite(
                mappings[i].split_mapping_id as u32,
                mappings[i].chain_pair_id as u32,
            );
        }
        let a_query_start = mappings[i].query_start;
        let a_query_end = mappings[i].query_end;
        let a_ref_start = mappings[i].ref_start;
        let a_ref_end = mappings[i].ref_end;
        let a_ref_seq = mappings[i].ref_seq_id;
        let a_strand = mappings[i].strand;
        let a_split_id = mappings[i].split_mapping_id;

        let mut best_score = f64::MAX;
        let mut best_j: Option<usize> = None;
        for j in (i + 1)..mappings.len() {
            if mappings[j].ref_seq_id != a_ref_seq {
                continue;
            }
            if mappings[j].query_start == a_query_start {
                continue;
            }
            if mappings[j].query_start > a_query_end + max_dist {
                break;
            }
            if mappings[j].strand != a_strand {
                continue;
            }
            // Query always moves forward; the reference gap is oriented.
            let query_dist = mappings[j].query_start - a_query_end;
            let ref_dist = if a_strand == STRAND_FWD {
                mappings[j].ref_start - a_ref_end
            } else {
                a_ref_start - mappings[j].ref_end
            };
            if query_dist >= 0
                && ref_dist >= -params.segment_length / 5
                && ref_dist <= max_dist
            {
                let dist =
                    ((query_dist * query_dist + ref_dist * ref_dist) as f64).sqrt();
                if dist < max_dist as f64
                    && best_score > dist
                    && mappings[j].chain_pair_score > dist
                {
                    best_j = Some(j);
                    best_score = dist;
                }
            }
        }
        if let Some(j) = best_j {
            mappings[j].chain_pair_score = best_score;
            mappings[j].chain_pair_id = a_split_id as i64;
        }
    }

    for m in mappings.iter_mut() {
        m.split_mapping_id = dsu.find(m.split_mapping_id as u32) as u64;
    }

    mappings.sort_unstable_by_key(|m| {
        (m.split_mapping_id, m.query_start, m.ref_seq_id, m.ref_start)
    });

    // One maximally merged mapping per chain.
    let mut maximally_merged: Vec<MappingResult> = Vec::new();
    let mut begin = 0usize;
    while begin < mappings.len() {
        let chain_id = mappings[begin].split_mapping_id;
        let end = mappings[begin..]
            .iter()
            .position(|m| m.split_mapping_id != chain_id)
            .map(|off| begin + off)
            .unwrap_or(mappings.len());

        let chain = &mappings[begin..end];
        let mut merged = chain[0].clone();
        let mut identity_sum = 0.0;
        let mut complexity_sum = 0.0;
        let mut conserved_sum = 0;
        let mut sketch_sum = 0;
        for m in chain {
            merged.query_start = merged.query_start.min(m.query_start);
            merged.query_end = merged.query_end.max(m.query_end);
            merged.ref_start = merged.ref_start.min(m.ref_start);
            merged.ref_end = merged.ref_end.max(m.ref_end);
            identity_sum += m.nuc_identity;
            complexity_sum += m.kmer_complexity;
            conserved_sum += m.conserved_sketches;
            sketch_sum += m.sketch_size;
        }
        merged.n_merged = chain.len() as i64;
        merged.block_length = (merged.ref_end - merged.ref_start)
            .max(merged.query_end - merged.query_start);
        merged.nuc_identity = identity_sum / merged.n_merged as f64;
        merged.kmer_complexity = complexity_sum / merged.n_merged as f64;
        merged.conserved_sketches = conserved_sum;
        merged.sketch_size = sketch_sum;
        merged.block_nuc_identity = merged.nuc_identity;
        merged.approx_matches =
            (merged.nuc_identity * merged.block_length as f64 / 100.0).round() as i64;
        merged.discard = false;
        merged.overlapped = false;
        merged.chain_pair_score = f64::MAX;
        merged.chain_pair_id = i64::MIN;
        maximally_merged.push(merged);

        process_chain_with_splits(&mut mappings[begin..end], params);
        begin = end;
    }

    mappings.retain(|m| !m.discard);
    maximally_merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::STRAND_REV;

    fn fragment(
        query_start: Offset,
        query_end: Offset,
        ref_start: Offset,
        ref_end: Offset,
        strand: i8,
        identity: f64,
    ) -> MappingResult {
        MappingResult {
            query_len: 900,
            query_start,
            query_end,
            ref_start,
            ref_end,
            strand,
            nuc_identity: identity,
            block_length: (ref_end - ref_start).max(query_end - query_start),
            sketch_size: 10,
            conserved_sketches: 9,
            kmer_complexity: 1.0,
            ..MappingResult::default()
        }
    }

    fn test_params() -> Parameters {
        Parameters {
            segment_length: 300,
            max_mapping_length: 50_000,
            ..Parameters::default()
        }
    }

    #[test]
    fn colinear_fragments_merge_into_one_chain() {
        let params = test_params();
        let mut mappings = vec![
            fragment(0, 300, 0, 300, STRAND_FWD, 1.0),
            fragment(300, 600, 300, 600, STRAND_FWD, 0.98),
            fragment(600, 900, 600, 900, STRAND_FWD, 1.0),
        ];
        let merged = merge_mappings_in_range(&mut mappings, 1000, &params);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].n_merged, 3);
        assert_eq!(merged[0].query_start, 0);
        assert_eq!(merged[0].query_end, 900);
        assert_eq!(merged[0].ref_start, 0);
        assert_eq!(merged[0].ref_end, 900);
        assert!((merged[0].nuc_identity - (1.0 + 0.98 + 1.0) / 3.0).abs() < 1e-9);

        // Split-level survivors collapse to one mapping below the length cap.
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].query_start, 0);
        assert_eq!(mappings[0].query_end, 900);
    }

    #[test]
    fn reverse_chain_coordinates_use_min_max() {
        let params = test_params();
        let mut mappings = vec![
            fragment(0, 300, 600, 900, STRAND_REV, 1.0),
            fragment(300, 600, 300, 600, STRAND_REV, 1.0),
            fragment(600, 900, 0, 300, STRAND_REV, 1.0),
        ];
        let merged = merge_mappings_in_range(&mut mappings, 1000, &params);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].n_merged, 3);
        assert_eq!(merged[0].ref_start, 0);
        assert_eq!(merged[0].ref_end, 900);
        assert!(merged[0].ref_start <= merged[0].ref_end);
    }

    #[test]
    fn distant_mappings_stay_separate() {
        let params = test_params();
        let mut mappings = vec![
            fragment(0, 300, 0, 300, STRAND_FWD, 1.0),
            fragment(300, 600, 50_000, 50_300, STRAND_FWD, 1.0),
        ];
        let merged = merge_mappings_in_range(&mut mappings, 1000, &params);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().all(|m| m.n_merged == 1));
    }

    #[test]
    fn opposite_strands_never_chain() {
        let params = test_params();
        let mut mappings = vec![
            fragment(0, 300, 0, 300, STRAND_FWD, 1.0),
            fragment(300, 600, 300, 600, STRAND_REV, 1.0),
        ];
        let merged = merge_mappings_in_range(&mut mappings, 1000, &params);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn long_chains_split_at_length_bound() {
        let mut params = test_params();
        params.max_mapping_length = 600;
        let mut mappings = vec![
            fragment(0, 300, 0, 300, STRAND_FWD, 1.0),
            fragment(300, 600, 300, 600, STRAND_FWD, 1.0),
            fragment(600, 900, 600, 900, STRAND_FWD, 1.0),
            fragment(900, 1200, 900, 1200, STRAND_FWD, 1.0),
        ];
        let merged = merge_mappings_in_range(&mut mappings, 1000, &params);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].n_merged, 4);

        // Two split fragments survive, sharing the chain id and statistics.
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].split_mapping_id, mappings[1].split_mapping_id);
        assert_eq!(mappings[0].block_length, mappings[1].block_length);
        assert_eq!(mappings[0].n_merged, mappings[1].n_merged);
        assert!(
            (mappings[0].block_nuc_identity - mappings[1].block_nuc_identity).abs() < 1e-12
        );
    }

    #[test]
    fn chain_statistics_are_uniform() {
        let params = test_params();
        let mut mappings = vec![
            fragment(0, 300, 0, 300, STRAND_FWD, 0.95),
            fragment(300, 600, 320, 620, STRAND_FWD, 0.90),
        ];
        merge_mappings_in_range(&mut mappings, 1000, &params);
        for m in &mappings {
            assert_eq!(m.n_merged, 2);
            assert!((m.block_nuc_identity - 0.925).abs() < 1e-9);
        }
    }
}
