//! Algorithm parameters and fixed constants.

use crate::error::{MapError, Result};

/// Confidence interval used for the minimum-hits relaxation and the
/// identity upper bound.
pub const CONFIDENCE_INTERVAL: f64 = 0.75;

/// Cap on the sketch-cutoff table size; larger sketch sizes index the table
/// by a scaled best-intersection value.
pub const SS_TABLE_MAX: usize = 1000;

/// How the per-group plane-sweep filter is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Filter mappings on the query axis only.
    Map,
    /// Query-axis filter per query, then a reference-axis pass over the
    /// aggregate at the end of the run.
    OneToOne,
    /// No group filtering.
    None,
}

#[derive(Debug, Clone)]
pub struct Parameters {
    pub kmer_size: usize,
    pub segment_length: i64,
    pub sketch_size: usize,
    /// Minimum nucleotide identity to report, as a fraction in [0, 1].
    pub percentage_identity: f64,
    pub num_mappings_for_segment: usize,
    /// Minimum merged block length; also sets the merged-count floor.
    pub block_length: i64,
    /// Maximum gap bridged when chaining fragment mappings.
    pub chain_gap: i64,
    /// Chains longer than this are split at cuttable positions.
    pub max_mapping_length: i64,
    pub split: bool,
    pub merge_mappings: bool,
    pub filter_mode: FilterMode,
    /// Report mappings whose identity upper bound passes the threshold even
    /// when the point estimate does not.
    pub keep_low_pct_id: bool,
    pub filter_length_mismatches: bool,
    pub kmer_complexity_threshold: f64,
    /// Mappings whose digest exceeds this are dropped; `u64::MAX` keeps all.
    pub sparsity_hash_threshold: u64,
    pub overlap_threshold: f64,
    pub drop_rand: bool,
    pub skip_self: bool,
    pub skip_prefix: bool,
    pub prefix_delim: char,
    pub lower_triangular: bool,
    /// With `skip_self`, query names starting with this prefix are skipped.
    pub target_prefix: String,
    pub stage1_topani_filter: bool,
    pub stage2_full_scan: bool,
    pub ani_diff: f64,
    pub ani_diff_conf: f64,
    pub threads: usize,
    pub legacy_output: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            kmer_size: 19,
            segment_length: 5000,
            sketch_size: 25,
            percentage_identity: 0.85,
            num_mappings_for_segment: 1,
            block_length: 0,
            chain_gap: 10_000,
            max_mapping_length: 50_000,
            split: true,
            merge_mappings: true,
            filter_mode: FilterMode::Map,
            keep_low_pct_id: false,
            filter_length_mismatches: false,
            kmer_complexity_threshold: 0.0,
            sparsity_hash_threshold: u64::MAX,
            overlap_threshold: 0.5,
            drop_rand: false,
            skip_self: false,
            skip_prefix: false,
            prefix_delim: '#',
            lower_triangular: false,
            target_prefix: String::new(),
            stage1_topani_filter: true,
            stage2_full_scan: true,
            ani_diff: 0.0,
            ani_diff_conf: 0.999,
            threads: 4,
            legacy_output: false,
        }
    }
}

impl Parameters {
    /// Reject contradictory or out-of-range parameter combinations before
    /// any work starts.
    pub fn validate(&self) -> Result<()> {
        if self.kmer_size == 0 || self.kmer_size > 32 {
            return Err(MapError::Config(format!(
                "kmer size must be in [1, 32], got {}",
                self.kmer_size
            )));
        }
        if self.segment_length < self.kmer_size as i64 {
            return Err(MapError::Config(format!(
                "segment length {} is smaller than kmer size {}",
                self.segment_length, self.kmer_size
            )));
        }
        if self.sketch_size == 0 {
            return Err(MapError::Config("sketch size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.percentage_identity) {
            return Err(MapError::Config(format!(
                "identity threshold must be a fraction in [0, 1], got {}",
                self.percentage_identity
            )));
        }
        if self.num_mappings_for_segment == 0 {
            return Err(MapError::Config(
                "number of mappings per segment must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.overlap_threshold) {
            return Err(MapError::Config(format!(
                "overlap threshold must be in [0, 1], got {}",
                self.overlap_threshold
            )));
        }
        if self.threads == 0 {
            return Err(MapError::Config("thread count must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_parameters_validate() {
        assert!(Parameters::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_kmer() {
        let mut p = Parameters::default();
        p.kmer_size = 33;
        assert!(p.validate().is_err());
        p.kmer_size = 0;
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_segment_shorter_than_kmer() {
        let mut p = Parameters::default();
        p.segment_length = 10;
        p.kmer_size = 19;
        assert!(p.validate().is_err());
    }
}
