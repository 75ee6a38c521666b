//! PAF-style output formatting.

use std::io::Write;

use crate::error::Result;
use crate::params::Parameters;
use crate::seq_registry::SequenceRegistry;
use crate::types::{MappingResult, STRAND_FWD};

/// Mapping quality surrogate derived from the identity estimate.
fn map_quality(nuc_identity: f64) -> u32 {
    if nuc_identity >= 1.0 {
        255
    } else {
        (-10.0 * (1.0 - nuc_identity).log10()).round() as u32
    }
}

/// Write one query's mappings.
///
/// `query_name` resolves the output name: `Some` for per-query reporting,
/// `None` to look the name up from `qmetadata` order (one-to-one mode).
pub fn report_read_mappings<W: Write>(
    mappings: &[MappingResult],
    query_name: Option<&str>,
    qmetadata: &[(String, i64)],
    registry: &SequenceRegistry,
    params: &Parameters,
    out: &mut W,
) -> Result<()> {
    let sep = if params.legacy_output { " " } else { "\t" };
    let end_adjust = if params.legacy_output { 1 } else { 0 };

    for m in mappings {
        let name = match query_name {
            Some(n) => n,
            None => qmetadata[m.query_seq_id as usize].0.as_str(),
        };
        write!(
            out,
            "{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}",
            name,
            m.query_len,
            m.query_start,
            m.query_end - end_adjust,
            if m.strand == STRAND_FWD { "+" } else { "-" },
            registry.name(m.ref_seq_id),
            registry.seq_len(m.ref_seq_id),
            m.ref_start,
            m.ref_end - end_adjust,
        )?;

        if !params.legacy_output {
            write!(
                out,
                "{sep}{}{sep}{}{sep}{}{sep}id:f:{}{sep}kc:f:{}",
                m.conserved_sketches,
                m.block_length,
                map_quality(m.nuc_identity),
                m.nuc_identity,
                m.kmer_complexity,
            )?;
            if !params.merge_mappings {
                write!(
                    out,
                    "{sep}jc:f:{}",
                    m.conserved_sketches as f64 / m.sketch_size.max(1) as f64
                )?;
            } else {
                write!(out, "{sep}chain:i:{}", m.split_mapping_id)?;
            }
        } else {
            write!(out, "{sep}{}", m.nuc_identity * 100.0)?;
        }
        writeln!(out)?;
    }
    Ok(())
}
