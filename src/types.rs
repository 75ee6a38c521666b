//! Core data model shared across the sketching, indexing and mapping stages.

/// Reference/query offsets. Signed because candidate range starts
/// (`pos - windowLen`) and pre-clamp mapping coordinates can go negative.
pub type Offset = i64;

/// Dense sequence id assigned by the registry in input order.
pub type SeqId = u32;

/// 64-bit hash of a canonicalized k-mer.
pub type KmerHash = u64;

/// Orientation that produced the minimal hash.
pub const STRAND_FWD: i8 = 1;
pub const STRAND_REV: i8 = -1;

/// One window of the sketch: `hash` is among the s smallest hashes for every
/// position window starting in `[wpos, wpos_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinmerInfo {
    pub hash: KmerHash,
    pub wpos: Offset,
    pub wpos_end: Offset,
    pub seq_id: SeqId,
    pub strand: i8,
}

/// Endpoint kind of a minmer window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Side {
    Open,
    Close,
}

/// One endpoint of a minmer window, used for sweep-line overlap counting.
///
/// Field order gives the derived ordering `(seq_id, pos, side, hash)`, the
/// natural order in which the L1 sweep consumes points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IntervalPoint {
    pub seq_id: SeqId,
    pub pos: Offset,
    pub side: Side,
    pub hash: KmerHash,
}

/// Coordinate pair used while sweeping interval points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqCoord {
    pub seq_id: SeqId,
    pub pos: Offset,
}

/// Stage L1 predicted candidate location: the query could begin anywhere in
/// `[range_start, range_end]` on sequence `seq_id`.
#[derive(Debug, Clone, Copy)]
pub struct L1Candidate {
    pub seq_id: SeqId,
    pub range_start: Offset,
    pub range_end: Offset,
    pub intersection_size: i64,
}

/// Stage L2 refined location within one L1 candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Locus {
    pub seq_id: SeqId,
    pub mean_optimal_pos: Offset,
    pub optimal_start: Offset,
    pub optimal_end: Offset,
    pub shared_sketch_size: i64,
    pub strand: i8,
}

/// A single reported mapping, produced by L2 and reshaped by chain merging.
#[derive(Debug, Clone)]
pub struct MappingResult {
    pub query_seq_id: SeqId,
    pub query_len: Offset,
    pub query_start: Offset,
    pub query_end: Offset,
    pub ref_seq_id: SeqId,
    pub ref_start: Offset,
    pub ref_end: Offset,
    pub strand: i8,
    pub sketch_size: i64,
    pub conserved_sketches: i64,
    /// Fraction in [0, 1].
    pub nuc_identity: f64,
    pub nuc_identity_upper_bound: f64,
    pub block_length: Offset,
    pub approx_matches: i64,
    pub kmer_complexity: f64,
    pub split_mapping_id: u64,
    pub chain_pair_id: i64,
    pub chain_pair_score: f64,
    pub n_merged: i64,
    pub block_nuc_identity: f64,
    pub discard: bool,
    pub overlapped: bool,
}

impl MappingResult {
    pub fn query_span(&self) -> Offset {
        self.query_end - self.query_start
    }

    pub fn ref_span(&self) -> Offset {
        self.ref_end - self.ref_start
    }

    /// Deterministic 64-bit digest of the mapping's identity fields, used by
    /// the sparsification filter.
    pub fn digest(&self) -> u64 {
        use rustc_hash::FxHasher;
        use std::hash::{Hash, Hasher};
        let mut h = FxHasher::default();
        self.query_seq_id.hash(&mut h);
        self.ref_seq_id.hash(&mut h);
        self.query_start.hash(&mut h);
        self.query_end.hash(&mut h);
        self.ref_start.hash(&mut h);
        self.ref_end.hash(&mut h);
        self.strand.hash(&mut h);
        h.finish()
    }
}

impl Default for MappingResult {
    fn default() -> Self {
        MappingResult {
            query_seq_id: 0,
            query_len: 0,
            query_start: 0,
            query_end: 0,
            ref_seq_id: 0,
            ref_start: 0,
            ref_end: 0,
            strand: STRAND_FWD,
            sketch_size: 0,
            conserved_sketches: 0,
            nuc_identity: 0.0,
            nuc_identity_upper_bound: 0.0,
            block_length: 0,
            approx_matches: 0,
            kmer_complexity: 0.0,
            split_mapping_id: 0,
            chain_pair_id: i64::MIN,
            chain_pair_score: f64::MAX,
            n_merged: 1,
            block_nuc_identity: 0.0,
            discard: false,
            overlapped: false,
        }
    }
}

/// Query sketch plus the per-fragment statistics derived from it.
#[derive(Debug, Default)]
pub struct QuerySketch {
    /// Distinct minmer hashes, ascending by hash.
    pub minmers: Vec<MinmerInfo>,
    /// Number of retained minmers (s' <= configured sketch size).
    pub sketch_size: i64,
    pub kmer_complexity: f64,
}

/// One accepted query sequence travelling through the pipeline.
#[derive(Debug)]
pub struct InputSeqRecord {
    pub name: String,
    pub seq: Vec<u8>,
    pub seq_counter: SeqId,
}

/// Per-query result bundle handed from a worker to the writer.
#[derive(Debug)]
pub struct MapModuleOutput {
    pub query_name: String,
    pub query_len: Offset,
    pub mappings: Vec<MappingResult>,
}
