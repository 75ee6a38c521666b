//! Mapping filters: weak-mapping and length-consistency culls, hash
//! sparsification, and the per-group plane-sweep top-k filter applied on the
//! query or reference axis.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use rand::Rng;

use crate::params::Parameters;
use crate::seq_registry::SequenceRegistry;
use crate::types::{MappingResult, Offset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Query,
    Reference,
}

#[inline]
fn axis_span(m: &MappingResult, axis: Axis) -> (Offset, Offset) {
    match axis {
        Axis::Query => (m.query_start, m.query_end),
        Axis::Reference => (m.ref_start, m.ref_end),
    }
}

/// Sweep score: identity-weighted log length, so long confident mappings
/// dominate short ones without letting length swamp identity.
fn sweep_score(m: &MappingResult) -> f64 {
    let len = m.block_length.max(1) as f64;
    m.nuc_identity * len.ln()
}

fn axis_overlap(a: &MappingResult, b: &MappingResult, axis: Axis) -> f64 {
    let (a_start, a_end) = axis_span(a, axis);
    let (b_start, b_end) = axis_span(b, axis);
    let overlap = (a_end.min(b_end) - a_start.max(b_start)).max(0) as f64;
    let min_len = (a_end - a_start).min(b_end - b_start) as f64;
    if min_len > 0.0 {
        overlap / min_len
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Begin,
    End,
}

/// Active-set order: best score first, then start position, then index for
/// determinism.
#[derive(Debug, Clone, Copy)]
struct SweepOrder {
    idx: usize,
    score_bits: u64,
    start_pos: Offset,
}

impl PartialEq for SweepOrder {
    fn eq(&self, other: &Self) -> bool {
        self.idx == other.idx
    }
}
impl Eq for SweepOrder {}
impl PartialOrd for SweepOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SweepOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score_bits
            .cmp(&self.score_bits)
            .then_with(|| self.start_pos.cmp(&other.start_pos))
            .then_with(|| self.idx.cmp(&other.idx))
    }
}

fn order_of(mappings: &[MappingResult], idx: usize, axis: Axis) -> SweepOrder {
    SweepOrder {
        idx,
        // Scores are non-negative, so the raw bit pattern orders correctly.
        score_bits: sweep_score(&mappings[idx]).to_bits(),
        start_pos: axis_span(&mappings[idx], axis).0,
    }
}

/// Keep the best `to_keep` active mappings at the current sweep position and
/// suppress others that overlap them beyond the threshold.
fn mark_good(
    active: &BTreeSet<SweepOrder>,
    mappings: &mut [MappingResult],
    to_keep: usize,
    overlap_threshold: f64,
    axis: Axis,
    drop_rand: bool,
) {
    if active.is_empty() {
        return;
    }

    let mut kept: Vec<usize> = active.iter().take(to_keep).map(|o| o.idx).collect();

    if drop_rand && kept.len() == to_keep && active.len() > to_keep {
        // Uniformly re-draw the slots occupied by boundary-score ties.
        let boundary = active.iter().nth(to_keep - 1).unwrap().score_bits;
        let tied: Vec<usize> = active
            .iter()
            .filter(|o| o.score_bits == boundary)
            .map(|o| o.idx)
            .collect();
        if tied.len() > 1 {
            let tied_slots = kept.iter().filter(|idx| tied.contains(idx)).count();
            let mut pool = tied;
            let mut rng = rand::thread_rng();
            for slot in 0..tied_slots {
                let pick = rng.gen_range(slot..pool.len());
                pool.swap(slot, pick);
            }
            kept.retain(|idx| !pool.contains(idx));
            kept.extend_from_slice(&pool[..tied_slots]);
        }
    }

    for &idx in &kept {
        mappings[idx].discard = false;
    }

    if overlap_threshold < 1.0 {
        for order in active.iter() {
            if kept.contains(&order.idx) {
                continue;
            }
            for &kept_idx in &kept {
                if axis_overlap(&mappings[order.idx], &mappings[kept_idx], axis)
                    > overlap_threshold
                {
                    mappings[order.idx].overlapped = true;
                    mappings[order.idx].discard = true;
                    break;
                }
            }
        }
    }
}

/// Plane sweep over one axis, retaining up to `secondaries + 1` best
/// mappings per position interval.
pub fn plane_sweep_filter(
    mappings: &mut Vec<MappingResult>,
    axis: Axis,
    secondaries: usize,
    overlap_threshold: f64,
    drop_rand: bool,
) {
    if mappings.len() <= 1 {
        return;
    }
    for m in mappings.iter_mut() {
        m.discard = true;
        m.overlapped = false;
    }

    let mut events: Vec<(Offset, EventKind, usize)> = Vec::with_capacity(mappings.len() * 2);
    for (idx, m) in mappings.iter().enumerate() {
        let (start, end) = axis_span(m, axis);
        events.push((start, EventKind::Begin, idx));
        events.push((end, EventKind::End, idx));
    }
    events.sort_unstable_by_key(|&(pos, kind, idx)| (pos, kind as u8, idx));

    let to_keep = secondaries + 1;
    let mut active: BTreeSet<SweepOrder> = BTreeSet::new();
    let mut i = 0;
    while i < events.len() {
        let pos = events[i].0;
        let mut j = i;
        while j < events.len() && events[j].0 == pos {
            let (_, kind, idx) = events[j];
            let order = order_of(mappings, idx, axis);
            match kind {
                EventKind::Begin => {
                    active.insert(order);
                }
                EventKind::End => {
                    active.remove(&order);
                }
            }
            j += 1;
        }
        mark_good(&active, mappings, to_keep, overlap_threshold, axis, drop_rand);
        i = j;
    }

    mappings.retain(|m| !m.discard && !m.overlapped);
}

/// Group-wise plane sweep: partition by reference prefix group when enabled,
/// filter each group independently, and restore query order.
pub fn filter_by_group(
    mappings: &mut Vec<MappingResult>,
    secondaries: usize,
    filter_ref: bool,
    params: &Parameters,
    registry: &SequenceRegistry,
) {
    if mappings.is_empty() {
        return;
    }
    mappings.sort_unstable_by_key(|m| (m.ref_seq_id, m.ref_start));

    let axis = if filter_ref {
        Axis::Reference
    } else {
        Axis::Query
    };
    let mut filtered: Vec<MappingResult> = Vec::with_capacity(mappings.len());
    let mut begin = 0usize;
    while begin < mappings.len() {
        let end = if params.skip_prefix {
            let group = registry.ref_group(mappings[begin].ref_seq_id);
            mappings[begin..]
                .iter()
                .position(|m| registry.ref_group(m.ref_seq_id) != group)
                .map(|off| begin + off)
                .unwrap_or(mappings.len())
        } else {
            mappings.len()
        };

        let mut group: Vec<MappingResult> = mappings[begin..end].to_vec();
        group.sort_unstable_by_key(|m| (m.query_start, m.ref_seq_id, m.ref_start));
        plane_sweep_filter(
            &mut group,
            axis,
            secondaries,
            params.overlap_threshold,
            params.drop_rand,
        );
        filtered.append(&mut group);
        begin = end;
    }

    filtered.sort_unstable_by_key(|m| (m.query_start, m.ref_seq_id, m.ref_start));
    *mappings = filtered;
}

/// Discard merged mappings that are too short or carry too few members.
pub fn filter_weak_mappings(mappings: &mut Vec<MappingResult>, params: &Parameters) {
    let min_count = if params.segment_length > 0 {
        params.block_length / params.segment_length
    } else {
        0
    };
    mappings.retain(|m| m.block_length >= params.block_length && m.n_merged >= min_count);
}

/// Discard mappings whose identity is inconsistent with the length
/// difference of their query and reference extents.
pub fn filter_false_high_identity(mappings: &mut Vec<MappingResult>, params: &Parameters) {
    let bound = 0.7f64.min(params.percentage_identity.powi(3));
    mappings.retain(|m| {
        let q_len = m.query_end - m.query_start;
        let r_len = m.ref_end - m.ref_start;
        let delta = (r_len - q_len).abs() as f64;
        let mean = (q_len + r_len) as f64 / 2.0;
        if mean <= 0.0 {
            return false;
        }
        1.0 - delta / mean >= bound
    });
}

/// Deterministic hash-based sparsification.
pub fn sparsify_mappings(mappings: &mut Vec<MappingResult>, params: &Parameters) {
    if params.sparsity_hash_threshold < u64::MAX {
        mappings.retain(|m| m.digest() <= params.sparsity_hash_threshold);
    }
}
