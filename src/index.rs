//! Reference minmer index: a hash-keyed interval-point map for the L1 sweep
//! plus a flat window list for the L2 scan, with binary persistence.

use std::io::{Read, Write};
use std::path::Path;

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::error::{MapError, Result};
use crate::params::Parameters;
use crate::seq_registry::SequenceRegistry;
use crate::sketch::add_minmers;
use crate::types::{IntervalPoint, MinmerInfo, SeqId, Side};

pub const INDEX_MAGIC: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// A reference sequence queued for sketching.
pub struct RefSeqInput {
    pub seq_id: SeqId,
    pub seq: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct ReferenceIndex {
    /// Interval points per hash, in (seqId, pos) order with contiguous runs
    /// coalesced.
    by_hash: FxHashMap<u64, Vec<IntervalPoint>>,
    /// All minmer windows sorted by (seqId, wpos).
    pub by_window: Vec<MinmerInfo>,
    pub segment_length: i64,
    pub sketch_size: i32,
    pub kmer_size: i32,
}

impl ReferenceIndex {
    /// Sketch all reference sequences (in parallel) and fold the windows
    /// into the positional map and the flat window list.
    ///
    /// `inputs` must be ordered by `seq_id`. Sequences shorter than the
    /// segment length are expected to have been skipped by the caller.
    pub fn build(params: &Parameters, inputs: Vec<RefSeqInput>) -> Result<Self> {
        let per_seq: Vec<Result<Vec<MinmerInfo>>> = inputs
            .par_iter()
            .map(|input| {
                let mut windows = Vec::new();
                add_minmers(
                    &mut windows,
                    &input.seq,
                    params.kmer_size,
                    params.segment_length,
                    params.sketch_size,
                    input.seq_id,
                )?;
                Ok(windows)
            })
            .collect();

        let mut index = ReferenceIndex {
            by_hash: FxHashMap::default(),
            by_window: Vec::new(),
            segment_length: params.segment_length,
            sketch_size: params.sketch_size as i32,
            kmer_size: params.kmer_size as i32,
        };

        for result in per_seq {
            let mut windows = result?;
            // Per-hash interval points must be appended in increasing
            // position order.
            windows.sort_unstable_by_key(|m| (m.hash, m.wpos));
            for mi in &windows {
                index.push_window_points(mi);
            }
            index.by_window.append(&mut windows);
        }
        index
            .by_window
            .sort_unstable_by_key(|m| (m.seq_id, m.wpos));

        if index.by_window.is_empty() {
            return Err(MapError::Config(
                "reference sketch is empty; sequences shorter than the segment length are not indexed"
                    .into(),
            ));
        }
        Ok(index)
    }

    /// Append OPEN/CLOSE points for one window, extending the previous CLOSE
    /// when the new window starts exactly where the prior one ended.
    fn push_window_points(&mut self, mi: &MinmerInfo) {
        let points = self.by_hash.entry(mi.hash).or_default();
        match points.last_mut() {
            Some(last) if last.seq_id == mi.seq_id && last.pos == mi.wpos => {
                last.pos = mi.wpos_end;
            }
            _ => {
                points.push(IntervalPoint {
                    seq_id: mi.seq_id,
                    pos: mi.wpos,
                    side: Side::Open,
                    hash: mi.hash,
                });
                points.push(IntervalPoint {
                    seq_id: mi.seq_id,
                    pos: mi.wpos_end,
                    side: Side::Close,
                    hash: mi.hash,
                });
            }
        }
    }

    pub fn lookup(&self, hash: u64) -> Option<&[IntervalPoint]> {
        self.by_hash.get(&hash).map(|v| v.as_slice())
    }

    pub fn num_hashes(&self) -> usize {
        self.by_hash.len()
    }

    pub fn num_windows(&self) -> usize {
        self.by_window.len()
    }

    /// Average interval points per hash, used to presize L1 scratch space.
    pub fn mean_points_per_hash(&self) -> usize {
        if self.by_hash.is_empty() {
            0
        } else {
            2 * self.by_window.len() / self.by_hash.len()
        }
    }

    pub fn check_params(&self, params: &Parameters) -> Result<()> {
        if self.segment_length != params.segment_length
            || self.sketch_size != params.sketch_size as i32
            || self.kmer_size != params.kmer_size as i32
        {
            return Err(MapError::IndexFormat(format!(
                "index parameters (segLength={}, sketchSize={}, kmerSize={}) differ from \
                 requested (segLength={}, sketchSize={}, kmerSize={})",
                self.segment_length,
                self.sketch_size,
                self.kmer_size,
                params.segment_length,
                params.sketch_size,
                params.kmer_size
            )));
        }
        Ok(())
    }

    /// Serialize one sub-index: header with sequence names, parameter block,
    /// flat window list, then the positional map with keys in ascending
    /// order so the dump is canonical.
    pub fn write_to<W: Write>(&self, w: &mut W, names: &[String]) -> Result<()> {
        w.write_u64::<LE>(INDEX_MAGIC)?;
        w.write_u64::<LE>(names.len() as u64)?;
        for name in names {
            w.write_u64::<LE>(name.len() as u64)?;
            w.write_all(name.as_bytes())?;
        }
        w.write_i32::<LE>(self.segment_length as i32)?;
        w.write_i32::<LE>(self.sketch_size)?;
        w.write_i32::<LE>(self.kmer_size)?;

        w.write_u64::<LE>(self.by_window.len() as u64)?;
        for mi in &self.by_window {
            write_minmer(w, mi)?;
        }

        w.write_u64::<LE>(self.by_hash.len() as u64)?;
        let mut keys: Vec<u64> = self.by_hash.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            let points = &self.by_hash[&key];
            w.write_u64::<LE>(key)?;
            w.write_u64::<LE>(points.len() as u64)?;
            for p in points {
                write_point(w, p)?;
            }
        }
        Ok(())
    }

    pub fn write_index(&self, path: &Path, names: &[String]) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        self.write_to(&mut writer, names)?;
        writer.flush()?;
        Ok(())
    }

    /// Read a concatenation of one or more sub-indices, validating magic,
    /// parameters, and the combined sequence-name list.
    pub fn read_from<R: Read>(
        r: &mut R,
        params: &Parameters,
        expected_names: &[String],
    ) -> Result<Self> {
        let mut merged: Option<ReferenceIndex> = None;
        let mut names: Vec<String> = Vec::new();

        loop {
            let magic = match r.read_u64::<LE>() {
                Ok(magic) => magic,
                // Clean end of stream at a sub-index boundary.
                Err(e)
                    if e.kind() == std::io::ErrorKind::UnexpectedEof
                        && merged.is_some() =>
                {
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            if magic != INDEX_MAGIC {
                return Err(MapError::IndexFormat(format!(
                    "bad magic number {magic:#x}"
                )));
            }
            let (sub, sub_names) = Self::read_sub_index_body(r, params)?;
            names.extend(sub_names);
            merged = Some(match merged {
                None => sub,
                Some(mut acc) => {
                    acc.merge(sub);
                    acc
                }
            });
        }

        if names != expected_names {
            return Err(MapError::IndexFormat(
                "sequences in the index do not match the expected target sequences".into(),
            ));
        }
        let mut index = merged.expect("at least one sub-index was read");
        index
            .by_window
            .sort_unstable_by_key(|m| (m.seq_id, m.wpos));
        Ok(index)
    }

    /// Read one sub-index after its magic word.
    fn read_sub_index_body<R: Read>(
        r: &mut R,
        params: &Parameters,
    ) -> Result<(Self, Vec<String>)> {
        let num_names = r.read_u64::<LE>()? as usize;
        let mut names = Vec::with_capacity(num_names);
        for _ in 0..num_names {
            let len = r.read_u64::<LE>()? as usize;
            let mut buf = vec![0u8; len];
            r.read_exact(&mut buf)?;
            names.push(String::from_utf8(buf).map_err(|_| {
                MapError::IndexFormat("sequence name is not valid UTF-8".into())
            })?);
        }

        let mut index = ReferenceIndex {
            by_hash: FxHashMap::default(),
            by_window: Vec::new(),
            segment_length: r.read_i32::<LE>()? as i64,
            sketch_size: r.read_i32::<LE>()?,
            kmer_size: r.read_i32::<LE>()?,
        };
        index.check_params(params)?;

        let num_windows = r.read_u64::<LE>()? as usize;
        index.by_window.reserve(num_windows);
        for _ in 0..num_windows {
            index.by_window.push(read_minmer(r)?);
        }

        let num_keys = r.read_u64::<LE>()? as usize;
        index.by_hash.reserve(num_keys);
        for _ in 0..num_keys {
            let key = r.read_u64::<LE>()?;
            let size = r.read_u64::<LE>()? as usize;
            let mut points = Vec::with_capacity(size);
            for _ in 0..size {
                points.push(read_point(r)?);
            }
            index.by_hash.insert(key, points);
        }
        Ok((index, names))
    }

    /// Fold another sub-index (covering disjoint sequences) into this one.
    fn merge(&mut self, other: ReferenceIndex) {
        self.by_window.extend(other.by_window);
        for (hash, points) in other.by_hash {
            self.by_hash.entry(hash).or_default().extend(points);
        }
    }

    pub fn read_index(
        path: &Path,
        params: &Parameters,
        expected_names: &[String],
    ) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut reader = std::io::BufReader::new(file);
        Self::read_from(&mut reader, params, expected_names)
    }
}

fn write_minmer<W: Write>(w: &mut W, mi: &MinmerInfo) -> Result<()> {
    w.write_u64::<LE>(mi.hash)?;
    w.write_i64::<LE>(mi.wpos)?;
    w.write_i64::<LE>(mi.wpos_end)?;
    w.write_u32::<LE>(mi.seq_id)?;
    w.write_i8(mi.strand)?;
    Ok(())
}

fn read_minmer<R: Read>(r: &mut R) -> Result<MinmerInfo> {
    Ok(MinmerInfo {
        hash: r.read_u64::<LE>()?,
        wpos: r.read_i64::<LE>()?,
        wpos_end: r.read_i64::<LE>()?,
        seq_id: r.read_u32::<LE>()?,
        strand: r.read_i8()?,
    })
}

fn write_point<W: Write>(w: &mut W, p: &IntervalPoint) -> Result<()> {
    w.write_i64::<LE>(p.pos)?;
    w.write_u64::<LE>(p.hash)?;
    w.write_u32::<LE>(p.seq_id)?;
    w.write_u8(match p.side {
        Side::Open => 0,
        Side::Close => 1,
    })?;
    Ok(())
}

fn read_point<R: Read>(r: &mut R) -> Result<IntervalPoint> {
    let pos = r.read_i64::<LE>()?;
    let hash = r.read_u64::<LE>()?;
    let seq_id = r.read_u32::<LE>()?;
    let side = match r.read_u8()? {
        0 => Side::Open,
        1 => Side::Close,
        other => {
            return Err(MapError::IndexFormat(format!(
                "invalid interval point side {other}"
            )))
        }
    };
    Ok(IntervalPoint {
        seq_id,
        pos,
        side,
        hash,
    })
}

/// Collect reference inputs from already-loaded sequences, registering them
/// and warning about those too short to index.
pub fn prepare_ref_inputs(
    registry: &mut SequenceRegistry,
    params: &Parameters,
    sequences: Vec<(String, Vec<u8>)>,
) -> Vec<RefSeqInput> {
    let mut inputs = Vec::with_capacity(sequences.len());
    for (name, seq) in sequences {
        if (seq.len() as i64) < params.segment_length {
            eprintln!(
                "[sketchmap::index] WARNING, skipping short sequence: {} ({} bp)",
                name,
                seq.len()
            );
            continue;
        }
        let seq_id = registry.add(&name, seq.len() as i64);
        inputs.push(RefSeqInput { seq_id, seq });
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> Parameters {
        Parameters {
            kmer_size: 7,
            segment_length: 20,
            sketch_size: 4,
            ..Parameters::default()
        }
    }

    fn build_test_index() -> (ReferenceIndex, SequenceRegistry) {
        let params = test_params();
        let mut registry = SequenceRegistry::new();
        let seqs = vec![
            (
                "chrA".to_string(),
                b"ACGTGCTAGCTTAGCGGATCCATTGCGAATCGGCTAAGCTT".to_vec(),
            ),
            (
                "chrB".to_string(),
                b"TTGACCGTAAGCTAGCGATCGATTGCACCGTTAGCAATCGG".to_vec(),
            ),
        ];
        let inputs = prepare_ref_inputs(&mut registry, &params, seqs);
        let index = ReferenceIndex::build(&params, inputs).unwrap();
        (index, registry)
    }

    #[test]
    fn windows_are_sorted() {
        let (index, _) = build_test_index();
        for pair in index.by_window.windows(2) {
            assert!((pair[0].seq_id, pair[0].wpos) <= (pair[1].seq_id, pair[1].wpos));
        }
    }

    #[test]
    fn interval_points_pair_up() {
        let (index, _) = build_test_index();
        for mi in &index.by_window {
            let points = index.lookup(mi.hash).expect("hash must be indexed");
            // Points alternate OPEN/CLOSE and are ordered.
            assert_eq!(points.len() % 2, 0);
            for chunk in points.chunks(2) {
                assert_eq!(chunk[0].side, Side::Open);
                assert_eq!(chunk[1].side, Side::Close);
                assert!(chunk[0].pos < chunk[1].pos);
                assert_eq!(chunk[0].seq_id, chunk[1].seq_id);
            }
            for pair in points.windows(2) {
                assert!((pair[0].seq_id, pair[0].pos) <= (pair[1].seq_id, pair[1].pos));
            }
        }
    }

    #[test]
    fn empty_reference_is_fatal() {
        let params = test_params();
        assert!(ReferenceIndex::build(&params, Vec::new()).is_err());
    }

    #[test]
    fn short_sequences_are_skipped() {
        let params = test_params();
        let mut registry = SequenceRegistry::new();
        let inputs = prepare_ref_inputs(
            &mut registry,
            &params,
            vec![("tiny".to_string(), b"ACGTACGT".to_vec())],
        );
        assert!(inputs.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn roundtrip_preserves_contents() {
        let (index, registry) = build_test_index();
        let names: Vec<String> = registry.names().map(|s| s.to_string()).collect();
        let params = test_params();

        let mut buf = Vec::new();
        index.write_to(&mut buf, &names).unwrap();
        let restored =
            ReferenceIndex::read_from(&mut buf.as_slice(), &params, &names).unwrap();

        assert_eq!(index.by_window, restored.by_window);
        assert_eq!(index.by_hash.len(), restored.by_hash.len());
        for (hash, points) in &index.by_hash {
            assert_eq!(restored.lookup(*hash), Some(points.as_slice()));
        }

        // Writing the restored index again must be byte-identical.
        let mut buf2 = Vec::new();
        restored.write_to(&mut buf2, &names).unwrap();
        assert_eq!(buf, buf2);
    }

    #[test]
    fn concatenated_sub_indices_merge_into_one() {
        let params = test_params();
        let mut registry = SequenceRegistry::new();
        let mut inputs = prepare_ref_inputs(
            &mut registry,
            &params,
            vec![
                (
                    "chrA".to_string(),
                    b"ACGTGCTAGCTTAGCGGATCCATTGCGAATCGGCTAAGCTT".to_vec(),
                ),
                (
                    "chrB".to_string(),
                    b"TTGACCGTAAGCTAGCGATCGATTGCACCGTTAGCAATCGG".to_vec(),
                ),
            ],
        );
        let input_b = inputs.split_off(1);
        let sub_a = ReferenceIndex::build(&params, inputs).unwrap();
        let sub_b = ReferenceIndex::build(&params, input_b).unwrap();

        let mut buf = Vec::new();
        sub_a.write_to(&mut buf, &["chrA".to_string()]).unwrap();
        sub_b.write_to(&mut buf, &["chrB".to_string()]).unwrap();

        let names = vec!["chrA".to_string(), "chrB".to_string()];
        let merged =
            ReferenceIndex::read_from(&mut buf.as_slice(), &params, &names).unwrap();

        let (single, _) = build_test_index();
        assert_eq!(merged.by_window, single.by_window);
        assert_eq!(merged.num_hashes(), single.num_hashes());
        for mi in &single.by_window {
            assert_eq!(merged.lookup(mi.hash), single.lookup(mi.hash));
        }
    }

    #[test]
    fn mismatched_names_are_rejected() {
        let (index, registry) = build_test_index();
        let names: Vec<String> = registry.names().map(|s| s.to_string()).collect();
        let mut buf = Vec::new();
        index.write_to(&mut buf, &names).unwrap();

        let wrong = vec!["other".to_string()];
        assert!(matches!(
            ReferenceIndex::read_from(&mut buf.as_slice(), &test_params(), &wrong),
            Err(MapError::IndexFormat(_))
        ));
    }

    #[test]
    fn mismatched_params_are_rejected() {
        let (index, registry) = build_test_index();
        let names: Vec<String> = registry.names().map(|s| s.to_string()).collect();
        let mut buf = Vec::new();
        index.write_to(&mut buf, &names).unwrap();

        let mut other = test_params();
        other.kmer_size = 11;
        other.segment_length = 20;
        assert!(matches!(
            ReferenceIndex::read_from(&mut buf.as_slice(), &other, &names),
            Err(MapError::IndexFormat(_))
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let buf = vec![0u8; 16];
        let names: Vec<String> = Vec::new();
        assert!(matches!(
            ReferenceIndex::read_from(&mut buf.as_slice(), &test_params(), &names),
            Err(MapError::IndexFormat(_))
        ));
    }
}
