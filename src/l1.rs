//! L1 candidate discovery: merge the interval-point streams of every query
//! minmer and sweep them to find reference windows whose sketch intersection
//! clears the statistical minimum.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rustc_hash::FxHashMap;

use crate::index::ReferenceIndex;
use crate::params::Parameters;
use crate::seq_registry::SequenceRegistry;
use crate::stats::cutoff_index;
use crate::types::{IntervalPoint, L1Candidate, Offset, QuerySketch, SeqCoord, SeqId, Side};

/// Per-fragment context the mapping stages need besides the sketch.
#[derive(Debug, Clone, Copy)]
pub struct FragmentContext<'a> {
    pub name: &'a str,
    pub seq_counter: SeqId,
    /// Fragment length (not the full query length).
    pub len: Offset,
    /// Full query length, for the self-mapping length comparison.
    pub full_len: Offset,
    pub ref_group: i32,
}

/// Cursor into one hash's interval-point run, ordered by its current point.
struct Cursor<'a> {
    points: &'a [IntervalPoint],
    idx: usize,
}

impl Cursor<'_> {
    #[inline]
    fn current(&self) -> &IntervalPoint {
        &self.points[self.idx]
    }
}

impl PartialEq for Cursor<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.current() == other.current()
    }
}
impl Eq for Cursor<'_> {}
impl PartialOrd for Cursor<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Cursor<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.current().cmp(other.current())
    }
}

/// Drain the per-hash point streams into one (seqId, pos)-ordered vector,
/// dropping points excluded by the symmetry filters.
pub fn collect_seed_interval_points(
    sketch: &QuerySketch,
    frag: &FragmentContext,
    index: &ReferenceIndex,
    registry: &SequenceRegistry,
    params: &Parameters,
    out: &mut Vec<IntervalPoint>,
) {
    if sketch.minmers.is_empty() {
        return;
    }
    let mut heap: BinaryHeap<Reverse<Cursor>> = BinaryHeap::with_capacity(sketch.minmers.len());
    for mi in &sketch.minmers {
        if let Some(points) = index.lookup(mi.hash) {
            heap.push(Reverse(Cursor { points, idx: 0 }));
        }
    }

    while let Some(Reverse(mut cursor)) = heap.pop() {
        let point = *cursor.current();
        let mut skip = false;
        if params.skip_self && frag.name == registry.name(point.seq_id) {
            skip = true;
        }
        if params.skip_prefix && registry.ref_group(point.seq_id) == frag.ref_group {
            skip = true;
        }
        if params.lower_triangular && frag.seq_counter <= point.seq_id {
            skip = true;
        }
        if !skip {
            out.push(point);
        }
        cursor.idx += 1;
        if cursor.idx < cursor.points.len() {
            heap.push(Reverse(cursor));
        }
    }
}

/// Distinct-(hash, seqId) overlap bookkeeping for the sweep. Openings and
/// closings for a prior sequence always drain fully before the next
/// sequence's points are counted, so a per-hash map suffices.
#[inline]
fn count_open(freq: &mut FxHashMap<u64, i64>, hash: u64, overlap: &mut i64) {
    let f = freq.entry(hash).or_insert(0);
    if *f == 0 {
        *overlap += 1;
    }
    *f += 1;
}

#[inline]
fn count_close(freq: &mut FxHashMap<u64, i64>, hash: u64, overlap: &mut i64) {
    let f = freq.entry(hash).or_insert(0);
    *f -= 1;
    if *f == 0 {
        *overlap -= 1;
    }
}

/// Two-pass sweep over one group of interval points.
///
/// The first pass (under the top-ANI filter) finds the best intersection
/// size and refines the hit floor through the sketch-cutoff table; the
/// second records candidate loci wherever the trailing overlap stays above
/// the floor.
#[allow(clippy::too_many_arguments)]
pub fn compute_l1_candidate_regions(
    sketch: &QuerySketch,
    frag: &FragmentContext,
    points: &[IntervalPoint],
    mut minimum_hits: i64,
    params: &Parameters,
    cutoffs: &[i64],
    l1_out: &mut Vec<L1Candidate>,
) {
    if points.is_empty() {
        return;
    }
    let window_len: Offset = (frag.len - params.segment_length).max(0);
    let cluster_len = params.segment_length;
    let mut freq: FxHashMap<u64, i64> = FxHashMap::default();

    if params.stage1_topani_filter {
        let mut best_intersection: i64 = 0;
        let mut overlap: i64 = 0;
        let mut trailing = 0usize;
        let mut leading = 0usize;
        while leading < points.len() {
            while trailing < points.len()
                && (points[trailing].seq_id < points[leading].seq_id
                    || (points[trailing].seq_id == points[leading].seq_id
                        && points[trailing].pos <= points[leading].pos - window_len))
            {
                if points[trailing].side == Side::Close {
                    count_close(&mut freq, points[trailing].hash, &mut overlap);
                }
                trailing += 1;
            }
            let current = SeqCoord {
                seq_id: points[leading].seq_id,
                pos: points[leading].pos,
            };
            while leading < points.len()
                && points[leading].seq_id == current.seq_id
                && points[leading].pos == current.pos
            {
                if points[leading].side == Side::Open {
                    count_open(&mut freq, points[leading].hash, &mut overlap);
                }
                leading += 1;
            }
            best_intersection = best_intersection.max(overlap);
        }

        if best_intersection < minimum_hits {
            return;
        }
        let idx = cutoff_index(best_intersection, sketch.sketch_size, params.sketch_size);
        minimum_hits = cutoffs[idx.min(cutoffs.len() - 1)].max(minimum_hits);
        freq.clear();
    }

    let mut local_opts: Vec<L1Candidate> = Vec::new();
    let mut in_candidate = false;
    let mut l1 = L1Candidate {
        seq_id: 0,
        range_start: 0,
        range_end: 0,
        intersection_size: 0,
    };

    let mut overlap: i64 = 0;
    let mut trailing = 0usize;
    let mut leading = 0usize;
    let mut current = SeqCoord {
        seq_id: points[0].seq_id,
        pos: points[0].pos,
    };
    let mut prev_pos = current;

    while leading < points.len() {
        let prev_overlap = overlap;
        while trailing < points.len()
            && (points[trailing].seq_id < points[leading].seq_id
                || (points[trailing].seq_id == points[leading].seq_id
                    && points[trailing].pos <= points[leading].pos - window_len))
        {
            if points[trailing].side == Side::Close {
                count_close(&mut freq, points[trailing].hash, &mut overlap);
            }
            trailing += 1;
        }
        if points[leading].pos != current.pos || points[leading].seq_id != current.seq_id {
            prev_pos = current;
            current = SeqCoord {
                seq_id: points[leading].seq_id,
                pos: points[leading].pos,
            };
        }
        while leading < points.len()
            && points[leading].seq_id == current.seq_id
            && points[leading].pos == current.pos
        {
            if points[leading].side == Side::Open {
                count_open(&mut freq, points[leading].hash, &mut overlap);
            }
            leading += 1;
        }

        if prev_overlap >= minimum_hits {
            // Crossing a sequence boundary flushes the open locus.
            if in_candidate && l1.seq_id != prev_pos.seq_id {
                local_opts.push(l1);
                in_candidate = false;
            }
            if !in_candidate {
                l1 = L1Candidate {
                    seq_id: prev_pos.seq_id,
                    range_start: prev_pos.pos - window_len,
                    range_end: prev_pos.pos - window_len,
                    intersection_size: prev_overlap,
                };
                in_candidate = true;
            } else if params.stage2_full_scan {
                l1.intersection_size = l1.intersection_size.max(prev_overlap);
                l1.range_end = prev_pos.pos - window_len;
            } else if l1.intersection_size < prev_overlap {
                l1.intersection_size = prev_overlap;
                l1.range_start = prev_pos.pos - window_len;
                l1.range_end = prev_pos.pos - window_len;
            }
        } else if in_candidate {
            local_opts.push(l1);
            in_candidate = false;
        }
    }
    if in_candidate {
        local_opts.push(l1);
    }

    // Join proximal local optima into one locus.
    for cand in local_opts {
        match l1_out.last_mut() {
            Some(last)
                if cand.seq_id == last.seq_id
                    && cand.range_start <= last.range_end + cluster_len =>
            {
                last.range_end = cand.range_end.max(last.range_end);
                last.intersection_size = last.intersection_size.max(cand.intersection_size);
            }
            _ => l1_out.push(cand),
        }
    }
}

/// Full L1 stage for one query fragment: seed collection, per-group sweeps,
/// candidate list.
#[allow(clippy::too_many_arguments)]
pub fn do_l1_mapping(
    sketch: &QuerySketch,
    frag: &FragmentContext,
    index: &ReferenceIndex,
    registry: &SequenceRegistry,
    params: &Parameters,
    cutoffs: &[i64],
    minimum_hits: i64,
    interval_points: &mut Vec<IntervalPoint>,
    l1_out: &mut Vec<L1Candidate>,
) {
    collect_seed_interval_points(sketch, frag, index, registry, params, interval_points);
    if interval_points.is_empty() {
        return;
    }

    let mut begin = 0usize;
    while begin < interval_points.len() {
        let end = if params.skip_prefix {
            let group = registry.ref_group(interval_points[begin].seq_id);
            interval_points[begin..]
                .iter()
                .position(|p| registry.ref_group(p.seq_id) != group)
                .map(|off| begin + off)
                .unwrap_or(interval_points.len())
        } else {
            interval_points.len()
        };
        compute_l1_candidate_regions(
            sketch,
            frag,
            &interval_points[begin..end],
            minimum_hits,
            params,
            cutoffs,
            l1_out,
        );
        begin = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{prepare_ref_inputs, RefSeqInput, ReferenceIndex};
    use crate::sketch::sketch_sequence;

    const REF_SEQ: &[u8] = b"ACGTGCTAGCTTAGCGGATCCATTGCGAATCGGCTAAGCTTACGATCGA";

    fn setup() -> (Parameters, ReferenceIndex, SequenceRegistry) {
        let params = Parameters {
            kmer_size: 7,
            segment_length: 20,
            sketch_size: 4,
            stage1_topani_filter: false,
            ..Parameters::default()
        };
        let mut registry = SequenceRegistry::new();
        let inputs = prepare_ref_inputs(
            &mut registry,
            &params,
            vec![("chrA".to_string(), REF_SEQ.to_vec())],
        );
        let index = ReferenceIndex::build(&params, inputs).unwrap();
        (params, index, registry)
    }

    fn frag<'a>(name: &'a str, len: i64) -> FragmentContext<'a> {
        FragmentContext {
            name,
            seq_counter: 0,
            len,
            full_len: len,
            ref_group: -1,
        }
    }

    #[test]
    fn finds_candidate_for_exact_subsequence() {
        let (params, index, registry) = setup();
        let query = &REF_SEQ[5..25];
        let sketch = sketch_sequence(query, 7, 4, 0).unwrap();
        let f = frag("query1", query.len() as i64);

        let mut points = Vec::new();
        let mut l1 = Vec::new();
        let cutoffs = vec![1i64; params.sketch_size + 1];
        do_l1_mapping(
            &sketch, &f, &index, &registry, &params, &cutoffs, 1, &mut points, &mut l1,
        );
        assert!(!l1.is_empty());
        for cand in &l1 {
            assert_eq!(cand.seq_id, 0);
            assert!(cand.range_start <= cand.range_end);
            assert!(cand.intersection_size >= 1);
            assert!(cand.intersection_size <= sketch.sketch_size);
        }
    }

    #[test]
    fn unrelated_query_yields_no_high_count_candidate() {
        let (params, index, registry) = setup();
        // Same alphabet, unrelated composition.
        let query = b"AAAAAAAAAACCCCCCCCCC";
        let sketch = sketch_sequence(query, 7, 4, 0).unwrap();
        let f = frag("query2", query.len() as i64);

        let mut points = Vec::new();
        let mut l1 = Vec::new();
        let cutoffs = vec![1i64; params.sketch_size + 1];
        do_l1_mapping(
            &sketch, &f, &index, &registry, &params, &cutoffs, 3, &mut points, &mut l1,
        );
        assert!(l1.is_empty());
    }

    #[test]
    fn skip_self_drops_all_points() {
        let (mut params, index, registry) = setup();
        params.skip_self = true;
        let query = &REF_SEQ[0..20];
        let sketch = sketch_sequence(query, 7, 4, 0).unwrap();
        // Query carries the same name as the reference contig.
        let f = frag("chrA", query.len() as i64);

        let mut points = Vec::new();
        collect_seed_interval_points(&sketch, &f, &index, &registry, &params, &mut points);
        assert!(points.is_empty());
    }

    #[test]
    fn lower_triangular_respects_seq_counter() {
        let (mut params, index, registry) = setup();
        params.lower_triangular = true;
        let query = &REF_SEQ[0..20];
        let sketch = sketch_sequence(query, 7, 4, 0).unwrap();

        // seq_counter 0 <= ref seq id 0: all points skipped.
        let f0 = frag("q", 20);
        let mut points = Vec::new();
        collect_seed_interval_points(&sketch, &f0, &index, &registry, &params, &mut points);
        assert!(points.is_empty());

        // seq_counter 1 > ref seq id 0: points survive.
        let f1 = FragmentContext {
            seq_counter: 1,
            ..f0
        };
        collect_seed_interval_points(&sketch, &f1, &index, &registry, &params, &mut points);
        assert!(!points.is_empty());
    }

    #[test]
    fn collected_points_are_sorted() {
        let params = Parameters {
            kmer_size: 7,
            segment_length: 20,
            sketch_size: 4,
            ..Parameters::default()
        };
        let mut registry = SequenceRegistry::new();
        let seq_b: Vec<u8> = REF_SEQ.iter().rev().copied().collect();
        let inputs: Vec<RefSeqInput> = prepare_ref_inputs(
            &mut registry,
            &params,
            vec![
                ("c1".to_string(), REF_SEQ.to_vec()),
                ("c2".to_string(), seq_b),
            ],
        );
        let index = ReferenceIndex::build(&params, inputs).unwrap();
        let sketch = sketch_sequence(&REF_SEQ[0..30], 7, 8, 0).unwrap();
        let f = frag("q", 30);
        let mut points = Vec::new();
        collect_seed_interval_points(&sketch, &f, &index, &registry, &params, &mut points);
        for pair in points.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }
}
