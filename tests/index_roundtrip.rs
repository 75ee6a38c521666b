//! On-disk index round-trip: write, re-read, and compare against the
//! freshly built structures; a second write must be byte-identical.

use std::fs;

use sketchmap::index::{prepare_ref_inputs, ReferenceIndex};
use sketchmap::params::Parameters;
use sketchmap::seq_registry::SequenceRegistry;

fn random_dna(seed: u64, len: usize) -> Vec<u8> {
    const BASES: [u8; 4] = [b'A', b'C', b'G', b'T'];
    let mut state = seed.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(1);
    let mut seq = Vec::with_capacity(len);
    for _ in 0..len {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        seq.push(BASES[(state >> 33) as usize % 4]);
    }
    seq
}

fn test_params() -> Parameters {
    Parameters {
        kmer_size: 15,
        segment_length: 200,
        sketch_size: 10,
        ..Parameters::default()
    }
}

fn build() -> (ReferenceIndex, SequenceRegistry, Vec<String>) {
    let params = test_params();
    let mut registry = SequenceRegistry::new();
    let inputs = prepare_ref_inputs(
        &mut registry,
        &params,
        vec![
            ("contig1".to_string(), random_dna(1, 1500)),
            ("contig2".to_string(), random_dna(2, 800)),
            ("contig3".to_string(), random_dna(3, 400)),
        ],
    );
    let index = ReferenceIndex::build(&params, inputs).unwrap();
    let names: Vec<String> = registry.names().map(|s| s.to_string()).collect();
    (index, registry, names)
}

#[test]
fn file_roundtrip_preserves_index() {
    let (index, _registry, names) = build();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ref.idx");

    index.write_index(&path, &names).unwrap();
    let restored = ReferenceIndex::read_index(&path, &test_params(), &names).unwrap();

    assert_eq!(index.by_window, restored.by_window);
    assert_eq!(index.num_hashes(), restored.num_hashes());
    for mi in &index.by_window {
        assert_eq!(index.lookup(mi.hash), restored.lookup(mi.hash));
    }
    assert_eq!(index.segment_length, restored.segment_length);
    assert_eq!(index.sketch_size, restored.sketch_size);
    assert_eq!(index.kmer_size, restored.kmer_size);
}

#[test]
fn rewrite_is_byte_identical() {
    let (index, _registry, names) = build();
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.idx");
    let second = dir.path().join("b.idx");

    index.write_index(&first, &names).unwrap();
    let restored = ReferenceIndex::read_index(&first, &test_params(), &names).unwrap();
    restored.write_index(&second, &names).unwrap();

    let bytes_a = fs::read(&first).unwrap();
    let bytes_b = fs::read(&second).unwrap();
    assert_eq!(bytes_a, bytes_b);
}

#[test]
fn truncated_index_is_rejected() {
    let (index, _registry, names) = build();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ref.idx");
    index.write_index(&path, &names).unwrap();

    let bytes = fs::read(&path).unwrap();
    let truncated = dir.path().join("short.idx");
    fs::write(&truncated, &bytes[..bytes.len() / 2]).unwrap();
    assert!(ReferenceIndex::read_index(&truncated, &test_params(), &names).is_err());
}
