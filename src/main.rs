use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use sketchmap::fasta::{read_name_list, read_sequences, InputFilters};
use sketchmap::index::{prepare_ref_inputs, ReferenceIndex};
use sketchmap::params::{FilterMode, Parameters};
use sketchmap::pipeline::Mapper;
use sketchmap::seq_registry::SequenceRegistry;

/// sketchmap - approximate whole-genome mapping via minmer sketches
///
/// Builds (or loads) a minmer index of the reference collection, then finds
/// candidate homologous regions for each query with a two-stage
/// locate-and-refine search and reports per-region approximate identity.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Reference FASTA file(s)
    #[clap(short = 'r', long = "ref", required = true, num_args = 1..)]
    reference: Vec<PathBuf>,

    /// Query FASTA file(s)
    #[clap(short = 'q', long = "query", required = true, num_args = 1..)]
    query: Vec<PathBuf>,

    /// Output file (stdout if not specified)
    #[clap(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// K-mer size
    #[clap(short = 'k', long = "kmer", default_value = "19")]
    kmer: usize,

    /// Segment length (sketching window and query split unit)
    #[clap(short = 's', long = "segment-length", default_value = "5000")]
    segment_length: i64,

    /// Sketch size (minmers retained per window)
    #[clap(long = "sketch-size", default_value = "25")]
    sketch_size: usize,

    /// Minimum identity to report, as a percentage
    #[clap(long = "perc-identity", default_value = "85.0")]
    perc_identity: f64,

    /// Mappings to retain per query segment
    #[clap(short = 'n', long = "num-mappings", default_value = "1")]
    num_mappings: usize,

    /// Minimum merged block length (0 disables the length filter)
    #[clap(short = 'b', long = "block-length", default_value = "0")]
    block_length: i64,

    /// Maximum gap bridged when chaining fragment mappings
    #[clap(long = "chain-gap", default_value = "10000")]
    chain_gap: i64,

    /// Split chains longer than this into separate mappings
    #[clap(long = "max-mapping-length", default_value = "50000")]
    max_mapping_length: i64,

    /// Map each query in one piece instead of splitting into segments
    #[clap(long = "no-split")]
    no_split: bool,

    /// Report fragment mappings without chain merging
    #[clap(short = 'M', long = "no-merge")]
    no_merge: bool,

    /// Filter mode: map, one-to-one, or none
    #[clap(short = 'f', long = "filter-mode", default_value = "map")]
    filter_mode: String,

    /// Keep mappings whose identity upper bound passes the threshold
    #[clap(long = "keep-low-identity")]
    keep_low_identity: bool,

    /// Discard mappings whose query/reference lengths disagree
    #[clap(long = "filter-length-mismatches")]
    filter_length_mismatches: bool,

    /// Minimum k-mer complexity per fragment
    #[clap(long = "kmer-complexity", default_value = "0.0")]
    kmer_complexity: f64,

    /// Keep approximately this fraction of mappings (hash sparsification)
    #[clap(short = 'x', long = "sparsify", default_value = "1.0")]
    sparsify: f64,

    /// Maximum overlap kept between secondary mappings in the plane sweep
    #[clap(short = 'O', long = "overlap", default_value = "0.5")]
    overlap: f64,

    /// Break plane-sweep ties randomly instead of deterministically
    #[clap(long = "drop-rand")]
    drop_rand: bool,

    /// Skip mappings of a sequence onto itself (by name)
    #[clap(long = "skip-self")]
    skip_self: bool,

    /// Skip mappings between sequences sharing a name prefix
    #[clap(long = "skip-prefix")]
    skip_prefix: bool,

    /// Prefix delimiter for grouping
    #[clap(long = "prefix-delim", default_value = "#")]
    prefix_delim: char,

    /// Map only lower-triangular pairs (query id > reference id)
    #[clap(long = "lower-triangular")]
    lower_triangular: bool,

    /// With --skip-self, also skip queries starting with this prefix
    #[clap(long = "target-prefix", default_value = "")]
    target_prefix: String,

    /// Disable the stage-1 top-ANI candidate filter
    #[clap(long = "no-hg-filter")]
    no_hg_filter: bool,

    /// Maximum ANI difference from the best mapping for reported secondaries
    #[clap(long = "ani-diff", default_value = "0.0")]
    ani_diff: f64,

    /// Confidence for the ANI-difference cutoff
    #[clap(long = "ani-diff-conf", default_value = "0.999")]
    ani_diff_conf: f64,

    /// Restrict queries to names listed in this file
    #[clap(long = "query-list")]
    query_list: Option<PathBuf>,

    /// Restrict references to names listed in this file
    #[clap(long = "target-list")]
    target_list: Option<PathBuf>,

    /// Restrict queries to names starting with one of these prefixes
    #[clap(long = "query-prefix", num_args = 0..)]
    query_prefix: Vec<String>,

    /// Save the reference index to this file after building
    #[clap(long = "save-index")]
    save_index: Option<PathBuf>,

    /// Load the reference index from this file instead of building
    #[clap(long = "load-index")]
    load_index: Option<PathBuf>,

    /// Space-delimited legacy output format
    #[clap(long = "legacy")]
    legacy: bool,

    /// Number of worker threads
    #[clap(short = 't', long = "threads", default_value = "4")]
    threads: usize,
}

fn parse_filter_mode(mode: &str) -> Result<FilterMode> {
    match mode.to_lowercase().as_str() {
        "map" => Ok(FilterMode::Map),
        "one-to-one" | "onetoone" | "1:1" => Ok(FilterMode::OneToOne),
        "none" => Ok(FilterMode::None),
        other => bail!("unknown filter mode '{other}' (expected map, one-to-one, or none)"),
    }
}

fn build_parameters(args: &Args) -> Result<Parameters> {
    let perc_identity = if args.perc_identity > 1.0 {
        args.perc_identity / 100.0
    } else {
        args.perc_identity
    };
    let sparsity_hash_threshold = if args.sparsify >= 1.0 {
        u64::MAX
    } else {
        (args.sparsify.max(0.0) * u64::MAX as f64) as u64
    };
    let params = Parameters {
        kmer_size: args.kmer,
        segment_length: args.segment_length,
        sketch_size: args.sketch_size,
        percentage_identity: perc_identity,
        num_mappings_for_segment: args.num_mappings,
        block_length: args.block_length,
        chain_gap: args.chain_gap,
        max_mapping_length: args.max_mapping_length,
        split: !args.no_split,
        merge_mappings: !args.no_merge && !args.no_split,
        filter_mode: parse_filter_mode(&args.filter_mode)?,
        keep_low_pct_id: args.keep_low_identity,
        filter_length_mismatches: args.filter_length_mismatches,
        kmer_complexity_threshold: args.kmer_complexity,
        sparsity_hash_threshold,
        overlap_threshold: args.overlap,
        drop_rand: args.drop_rand,
        skip_self: args.skip_self,
        skip_prefix: args.skip_prefix,
        prefix_delim: args.prefix_delim,
        lower_triangular: args.lower_triangular,
        target_prefix: args.target_prefix.clone(),
        stage1_topani_filter: !args.no_hg_filter,
        ani_diff: args.ani_diff,
        ani_diff_conf: args.ani_diff_conf,
        threads: args.threads,
        legacy_output: args.legacy,
        ..Parameters::default()
    };
    params.validate()?;
    Ok(params)
}

fn load_or_build_index(
    args: &Args,
    params: &Parameters,
    registry: &mut SequenceRegistry,
) -> Result<ReferenceIndex> {
    let ref_filters = InputFilters {
        allowed: match &args.target_list {
            Some(path) => Some(read_name_list(path)?),
            None => None,
        },
        prefixes: Vec::new(),
    };
    let sequences = read_sequences(&args.reference, &ref_filters)
        .context("failed to read reference sequences")?;
    let inputs = prepare_ref_inputs(registry, params, sequences);
    let names: Vec<String> = registry.names().map(|s| s.to_string()).collect();

    let index = if let Some(path) = &args.load_index {
        eprintln!("[sketchmap::index] loading index from {}", path.display());
        ReferenceIndex::read_index(path, params, &names)?
    } else {
        eprintln!(
            "[sketchmap::index] sketching {} reference sequences",
            inputs.len()
        );
        let index = ReferenceIndex::build(params, inputs)?;
        eprintln!(
            "[sketchmap::index] unique minmer hashes = {}, total minmer windows = {}",
            index.num_hashes(),
            index.num_windows()
        );
        index
    };

    if let Some(path) = &args.save_index {
        index.write_index(path, &names)?;
        eprintln!("[sketchmap::index] wrote index to {}", path.display());
    }
    Ok(index)
}

fn run(args: Args) -> Result<()> {
    let params = build_parameters(&args)?;
    if params.threads > 1 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(params.threads)
            .build_global()
            .ok();
    }

    let mut registry = SequenceRegistry::new();
    let index = load_or_build_index(&args, &params, &mut registry)?;
    if params.skip_prefix {
        registry.compute_ref_groups(params.prefix_delim);
    }

    let query_filters = InputFilters {
        allowed: match &args.query_list {
            Some(path) => Some(read_name_list(path)?),
            None => None,
        },
        prefixes: args.query_prefix.clone(),
    };

    let mapper = Mapper::new(params, index, registry)?;

    match &args.output {
        Some(path) => {
            let mut file = File::create(path)
                .with_context(|| format!("cannot create output file {}", path.display()))?;
            mapper.map_queries(&args.query, &query_filters, &mut file)?;
            file.flush()?;
        }
        None => {
            let mut stdout = std::io::stdout();
            mapper.map_queries(&args.query, &query_filters, &mut stdout)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("[sketchmap] ERROR: {e:#}");
        std::process::exit(1);
    }
}
