//! Mapping pipeline: one reader thread streaming query sequences, N worker
//! threads running the L1/L2/chain/filter stages, and one writer thread
//! draining results, all connected by bounded channels.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::bounded;
use indicatif::{ProgressBar, ProgressStyle};
use rustc_hash::FxHashSet;

use crate::chain::merge_mappings_in_range;
use crate::error::Result;
use crate::fasta::{enumerate_input, for_each_seq, InputFilters};
use crate::filter::{
    filter_by_group, filter_false_high_identity, filter_weak_mappings, sparsify_mappings,
};
use crate::index::ReferenceIndex;
use crate::l1::{do_l1_mapping, FragmentContext};
use crate::l2::do_l2_mapping;
use crate::output::report_read_mappings;
use crate::params::{FilterMode, Parameters, CONFIDENCE_INTERVAL};
use crate::seq_registry::SequenceRegistry;
use crate::sketch::sketch_sequence;
use crate::stats::{estimate_minimum_hits_relaxed, sketch_cutoffs};
use crate::types::{
    InputSeqRecord, L1Candidate, MapModuleOutput, MappingResult, Offset, SeqId,
};

const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Default, Clone)]
pub struct MappingStats {
    pub total_queries: u64,
    pub queries_picked: u64,
    pub queries_mapped: u64,
    pub total_query_length: u64,
}

pub struct Mapper {
    params: Parameters,
    index: Arc<ReferenceIndex>,
    registry: Arc<SequenceRegistry>,
    cutoffs: Vec<i64>,
}

impl Mapper {
    pub fn new(
        params: Parameters,
        index: ReferenceIndex,
        registry: SequenceRegistry,
    ) -> Result<Self> {
        params.validate()?;
        index.check_params(&params)?;
        let cutoffs = if params.stage1_topani_filter {
            sketch_cutoffs(
                params.sketch_size,
                params.kmer_size,
                params.ani_diff,
                params.ani_diff_conf,
            )
        } else {
            vec![1; params.sketch_size + 1]
        };
        Ok(Mapper {
            params,
            index: Arc::new(index),
            registry: Arc::new(registry),
            cutoffs,
        })
    }

    pub fn registry(&self) -> &SequenceRegistry {
        &self.registry
    }

    /// Map all query sequences from `query_files` and write mappings to
    /// `out`. Returns run statistics.
    pub fn map_queries<W: std::io::Write + Send>(
        &self,
        query_files: &[PathBuf],
        filters: &InputFilters,
        out: &mut W,
    ) -> Result<MappingStats> {
        let (_total_seqs, total_len) = enumerate_input(query_files, filters)?;
        let progress = ProgressBar::new(total_len);
        progress.set_style(
            ProgressStyle::default_bar()
                .template(
                    "[sketchmap::map] {bar:30.cyan/blue} {bytes}/{total_bytes} bp {msg}",
                )
                .unwrap(),
        );

        let picked = AtomicU64::new(0);
        let mapped = AtomicU64::new(0);
        let seq_counter = AtomicU64::new(0);
        let qmetadata: Mutex<Vec<(String, Offset)>> = Mutex::new(Vec::new());
        let busy: Vec<AtomicBool> =
            (0..self.params.threads).map(|_| AtomicBool::new(false)).collect();

        let (seq_tx, seq_rx) = bounded::<InputSeqRecord>(QUEUE_CAPACITY);
        let (out_tx, out_rx) = bounded::<MapModuleOutput>(QUEUE_CAPACITY);

        let mut one_to_one_buffer: Vec<MappingResult> = Vec::new();
        let mut reader_result: Result<()> = Ok(());
        let mut writer_result: Result<()> = Ok(());

        std::thread::scope(|scope| {
            let reader = scope.spawn(|| -> Result<()> {
                let seq_tx = seq_tx;
                for path in query_files {
                    for_each_seq(path, filters, |name, seq| {
                        if self.params.skip_self
                            && !self.params.target_prefix.is_empty()
                            && name.starts_with(&self.params.target_prefix)
                        {
                            return;
                        }
                        let counter = seq_counter.fetch_add(1, Ordering::Relaxed) as SeqId;
                        if self.params.filter_mode == FilterMode::OneToOne {
                            qmetadata
                                .lock()
                                .unwrap()
                                .push((name.to_string(), seq.len() as Offset));
                        }
                        if seq.len() < self.params.kmer_size {
                            eprintln!(
                                "[sketchmap::map] WARNING, query {} of {} bp is too short \
                                 to map at kmer size {}",
                                name,
                                seq.len(),
                                self.params.kmer_size
                            );
                            progress.inc(seq.len() as u64);
                            return;
                        }
                        picked.fetch_add(1, Ordering::Relaxed);
                        let record = InputSeqRecord {
                            name: name.to_string(),
                            seq,
                            seq_counter: counter,
                        };
                        // Send blocks while the queue is full.
                        let _ = seq_tx.send(record);
                    })?;
                }
                Ok(())
            });

            for worker_id in 0..self.params.threads {
                let seq_rx = seq_rx.clone();
                let out_tx = out_tx.clone();
                let busy = &busy;
                let progress = &progress;
                let mapped = &mapped;
                scope.spawn(move || {
                    while let Ok(input) = seq_rx.recv() {
                        busy[worker_id].store(true, Ordering::Relaxed);
                        let output = self.map_module(&input);
                        if !output.mappings.is_empty() {
                            mapped.fetch_add(1, Ordering::Relaxed);
                        }
                        progress.inc(input.seq.len() as u64);
                        busy[worker_id].store(false, Ordering::Relaxed);
                        if out_tx.send(output).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(seq_rx);
            drop(out_tx);

            let writer = scope.spawn(|| -> Result<Vec<MappingResult>> {
                let mut buffered = Vec::new();
                let mut out = std::io::BufWriter::new(&mut *out);
                while let Ok(output) = out_rx.recv() {
                    if self.params.filter_mode == FilterMode::OneToOne {
                        buffered.extend(output.mappings);
                    } else {
                        report_read_mappings(
                            &output.mappings,
                            Some(&output.query_name),
                            &[],
                            &self.registry,
                            &self.params,
                            &mut out,
                        )?;
                    }
                    let n_busy = busy.iter().filter(|b| b.load(Ordering::Relaxed)).count();
                    progress.set_message(format!("({n_busy} workers busy)"));
                }
                use std::io::Write as _;
                out.flush()?;
                Ok(buffered)
            });

            reader_result = reader.join().expect("reader thread panicked");
            match writer.join().expect("writer thread panicked") {
                Ok(buffered) => one_to_one_buffer = buffered,
                Err(e) => writer_result = Err(e),
            }
        });
        reader_result?;
        writer_result?;
        progress.finish_and_clear();

        if self.params.filter_mode == FilterMode::OneToOne {
            self.finish_one_to_one(one_to_one_buffer, &qmetadata.lock().unwrap(), out)?;
        }

        let stats = MappingStats {
            total_queries: seq_counter.load(Ordering::Relaxed),
            queries_picked: picked.load(Ordering::Relaxed),
            queries_mapped: mapped.load(Ordering::Relaxed),
            total_query_length: total_len,
        };
        eprintln!(
            "[sketchmap::map] count of mapped reads = {}, reads qualified for mapping = {}, \
             total input reads = {}, total input bp = {}",
            stats.queries_mapped, stats.queries_picked, stats.total_queries, stats.total_query_length
        );
        Ok(stats)
    }

    /// Reference-axis filtering pass over the aggregated mappings, then the
    /// final deterministic sort and report.
    fn finish_one_to_one<W: std::io::Write>(
        &self,
        mut all: Vec<MappingResult>,
        qmetadata: &[(String, Offset)],
        out: &mut W,
    ) -> Result<()> {
        let secondaries = self.params.num_mappings_for_segment - 1;
        all.sort_unstable_by_key(|m| m.query_seq_id);

        let mut filtered: Vec<MappingResult> = Vec::with_capacity(all.len());
        let mut begin = 0usize;
        while begin < all.len() {
            let end = if self.params.skip_prefix {
                let group = self.registry.query_group(
                    &qmetadata[all[begin].query_seq_id as usize].0,
                    self.params.prefix_delim,
                );
                all[begin..]
                    .iter()
                    .position(|m| {
                        self.registry.query_group(
                            &qmetadata[m.query_seq_id as usize].0,
                            self.params.prefix_delim,
                        ) != group
                    })
                    .map(|off| begin + off)
                    .unwrap_or(all.len())
            } else {
                all.len()
            };
            let mut group: Vec<MappingResult> = all[begin..end].to_vec();
            filter_by_group(&mut group, secondaries, true, &self.params, &self.registry);
            filtered.append(&mut group);
            begin = end;
        }

        filtered.sort_unstable_by_key(|m| {
            (m.query_seq_id, m.query_start, m.ref_seq_id, m.ref_start)
        });
        report_read_mappings(
            &filtered,
            None,
            qmetadata,
            &self.registry,
            &self.params,
            out,
        )
    }

    /// Map one query sequence: fragment splitting, L1 + L2 per fragment,
    /// chain merging, and the per-query filters.
    pub fn map_module(&self, input: &InputSeqRecord) -> MapModuleOutput {
        let params = &self.params;
        let len = input.seq.len() as Offset;
        let ref_group = if params.skip_prefix {
            self.registry.query_group(&input.name, params.prefix_delim)
        } else {
            -1
        };

        let mut interval_points = Vec::with_capacity(
            2 * params.sketch_size * self.index.mean_points_per_hash().max(1),
        );
        let mut l1_buf: Vec<L1Candidate> = Vec::new();
        let mut unfiltered: Vec<MappingResult> = Vec::new();

        if !params.split || len <= params.segment_length {
            let frag = FragmentContext {
                name: &input.name,
                seq_counter: input.seq_counter,
                len,
                full_len: len,
                ref_group,
            };
            let mut l2 = self.map_single_query_frag(
                &input.seq,
                &frag,
                &mut interval_points,
                &mut l1_buf,
            );
            for m in &mut l2 {
                m.query_len = len;
            }
            unfiltered.append(&mut l2);
            self.filter_non_merged(&mut unfiltered);
        } else {
            let seg = params.segment_length;
            let fragment_count = (len / seg) as usize;
            for i in 0..fragment_count {
                let start = i as Offset * seg;
                let frag = FragmentContext {
                    name: &input.name,
                    seq_counter: input.seq_counter,
                    len: seg,
                    full_len: len,
                    ref_group,
                };
                interval_points.clear();
                l1_buf.clear();
                let mut l2 = self.map_single_query_frag(
                    &input.seq[start as usize..(start + seg) as usize],
                    &frag,
                    &mut interval_points,
                    &mut l1_buf,
                );
                for m in &mut l2 {
                    m.query_len = len;
                    m.query_start = start;
                    m.query_end = start + seg;
                }
                unfiltered.append(&mut l2);
            }

            // One overlapping tail fragment covers the remainder.
            if fragment_count >= 1 && len % seg != 0 {
                let start = len - seg;
                let frag = FragmentContext {
                    name: &input.name,
                    seq_counter: input.seq_counter,
                    len: seg,
                    full_len: len,
                    ref_group,
                };
                interval_points.clear();
                l1_buf.clear();
                let mut l2 = self.map_single_query_frag(
                    &input.seq[start as usize..],
                    &frag,
                    &mut interval_points,
                    &mut l1_buf,
                );
                for m in &mut l2 {
                    m.query_len = len;
                    m.query_start = start;
                    m.query_end = len;
                }
                unfiltered.append(&mut l2);
            }

            if params.merge_mappings {
                let mut maximally_merged =
                    merge_mappings_in_range(&mut unfiltered, params.chain_gap, params);
                self.filter_maximally_merged(&mut maximally_merged);
                let kept_chains: FxHashSet<u64> = maximally_merged
                    .iter()
                    .map(|m| m.split_mapping_id)
                    .collect();
                unfiltered.retain(|m| kept_chains.contains(&m.split_mapping_id));
            } else {
                self.filter_non_merged(&mut unfiltered);
            }
        }

        self.boundary_sanity_check(len, &mut unfiltered);
        if params.filter_length_mismatches {
            filter_false_high_identity(&mut unfiltered, params);
        }
        sparsify_mappings(&mut unfiltered, params);

        MapModuleOutput {
            query_name: input.name.clone(),
            query_len: len,
            mappings: unfiltered,
        }
    }

    /// L1 + L2 for one fragment; empty when the sketch is empty or below the
    /// complexity threshold.
    fn map_single_query_frag(
        &self,
        seq: &[u8],
        frag: &FragmentContext,
        interval_points: &mut Vec<crate::types::IntervalPoint>,
        l1_buf: &mut Vec<L1Candidate>,
    ) -> Vec<MappingResult> {
        let params = &self.params;
        let sketch = match sketch_sequence(
            seq,
            params.kmer_size,
            params.sketch_size,
            frag.seq_counter,
        ) {
            Ok(sketch) => sketch,
            Err(_) => return Vec::new(),
        };
        if sketch.sketch_size == 0 || sketch.kmer_complexity < params.kmer_complexity_threshold
        {
            eprintln!(
                "[sketchmap::map] WARNING, query {} has an empty or low-complexity sketch \
                 (complexity {:.4}); fragment skipped",
                frag.name, sketch.kmer_complexity
            );
            return Vec::new();
        }

        let minimum_hits = estimate_minimum_hits_relaxed(
            sketch.sketch_size as usize,
            params.kmer_size,
            params.percentage_identity,
            CONFIDENCE_INTERVAL,
        )
        .max(1);

        do_l1_mapping(
            &sketch,
            frag,
            &self.index,
            &self.registry,
            params,
            &self.cutoffs,
            minimum_hits,
            interval_points,
            l1_buf,
        );
        if l1_buf.is_empty() {
            return Vec::new();
        }

        // L2 runs per reference group so the top-ANI heap never mixes groups.
        let mut l2_mappings: Vec<MappingResult> = Vec::new();
        let mut begin = 0usize;
        while begin < l1_buf.len() {
            let end = if params.skip_prefix {
                let group = self.registry.ref_group(l1_buf[begin].seq_id);
                l1_buf[begin..]
                    .iter()
                    .position(|c| self.registry.ref_group(c.seq_id) != group)
                    .map(|off| begin + off)
                    .unwrap_or(l1_buf.len())
            } else {
                l1_buf.len()
            };
            do_l2_mapping(
                &sketch,
                frag,
                &mut l1_buf[begin..end],
                &self.index,
                params,
                &mut l2_mappings,
            );
            begin = end;
        }
        l2_mappings
    }

    fn filter_non_merged(&self, mappings: &mut Vec<MappingResult>) {
        if matches!(
            self.params.filter_mode,
            FilterMode::Map | FilterMode::OneToOne
        ) {
            filter_by_group(
                mappings,
                self.params.num_mappings_for_segment - 1,
                false,
                &self.params,
                &self.registry,
            );
        }
    }

    fn filter_maximally_merged(&self, mappings: &mut Vec<MappingResult>) {
        filter_weak_mappings(mappings, &self.params);
        if matches!(
            self.params.filter_mode,
            FilterMode::Map | FilterMode::OneToOne
        ) {
            filter_by_group(
                mappings,
                self.params.num_mappings_for_segment - 1,
                false,
                &self.params,
                &self.registry,
            );
        }
    }

    /// Clamp mapping coordinates into the valid sequence ranges.
    fn boundary_sanity_check(&self, query_len: Offset, mappings: &mut [MappingResult]) {
        for m in mappings {
            let ref_len = self.registry.seq_len(m.ref_seq_id);
            m.ref_start = m.ref_start.clamp(0, ref_len);
            m.ref_end = m.ref_end.clamp(m.ref_start, ref_len);
            m.query_start = m.query_start.clamp(0, query_len);
            m.query_end = m.query_end.clamp(m.query_start, query_len);
        }
    }
}
