//! FASTA input: sequence streaming with allowed-name and prefix filters,
//! plus `.fai` sidecar exploitation for fast length enumeration.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use bio::io::fasta;
use rustc_hash::FxHashSet;

use crate::error::{MapError, Result};

/// Name-based input filters shared by the reference and query paths.
#[derive(Debug, Default, Clone)]
pub struct InputFilters {
    /// Explicit allow-list of sequence names; `None` allows all.
    pub allowed: Option<FxHashSet<String>>,
    /// Keep only names starting with one of these prefixes; empty keeps all.
    pub prefixes: Vec<String>,
}

impl InputFilters {
    pub fn accept(&self, name: &str) -> bool {
        if let Some(allowed) = &self.allowed {
            if allowed.contains(name) {
                return true;
            }
            if self.prefixes.is_empty() {
                return false;
            }
        }
        if !self.prefixes.is_empty() {
            return self.prefixes.iter().any(|p| name.starts_with(p.as_str()));
        }
        true
    }
}

/// Load a newline-delimited allow-list of sequence names.
pub fn read_name_list(path: &Path) -> Result<FxHashSet<String>> {
    let file = File::open(path)?;
    let mut names = FxHashSet::default();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            names.insert(trimmed.to_string());
        }
    }
    Ok(names)
}

/// Stream sequences from one FASTA file through `f`, applying the filters.
pub fn for_each_seq<F>(path: &Path, filters: &InputFilters, mut f: F) -> Result<()>
where
    F: FnMut(&str, Vec<u8>),
{
    let file = File::open(path)?;
    let reader = fasta::Reader::new(BufReader::new(file));
    for record in reader.records() {
        let record = record.map_err(|e| {
            MapError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;
        if filters.accept(record.id()) {
            f(record.id(), record.seq().to_vec());
        }
    }
    Ok(())
}

/// Read all accepted sequences from the given files.
pub fn read_sequences(paths: &[PathBuf], filters: &InputFilters) -> Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    for path in paths {
        for_each_seq(path, filters, |name, seq| {
            out.push((name.to_string(), seq));
        })?;
    }
    Ok(out)
}

/// Total count and length of accepted sequences, using the `.fai` sidecar
/// when present and falling back to reading the FASTA otherwise.
pub fn enumerate_input(paths: &[PathBuf], filters: &InputFilters) -> Result<(u64, u64)> {
    let mut total_seqs = 0u64;
    let mut total_len = 0u64;
    for path in paths {
        let fai = PathBuf::from(format!("{}.fai", path.display()));
        if fai.exists() {
            let file = File::open(&fai)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                let mut fields = line.split('\t');
                let (Some(name), Some(len)) = (fields.next(), fields.next()) else {
                    return Err(MapError::IndexFormat(format!(
                        "malformed .fai line in {}",
                        fai.display()
                    )));
                };
                if filters.accept(name) {
                    total_seqs += 1;
                    total_len += len.parse::<u64>().map_err(|_| {
                        MapError::IndexFormat(format!(
                            "malformed sequence length in {}",
                            fai.display()
                        ))
                    })?;
                }
            }
        } else {
            eprintln!(
                "[sketchmap::map] WARNING, no .fai index found for {}, reading the file to \
                 enumerate sequences (slow)",
                path.display()
            );
            for_each_seq(path, filters, |_, seq| {
                total_seqs += 1;
                total_len += seq.len() as u64;
            })?;
        }
    }
    Ok((total_seqs, total_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fasta(dir: &Path, name: &str, entries: &[(&str, &str)]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        for (id, seq) in entries {
            writeln!(file, ">{id}").unwrap();
            writeln!(file, "{seq}").unwrap();
        }
        path
    }

    #[test]
    fn reads_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fasta(
            dir.path(),
            "in.fa",
            &[("s1", "ACGTACGT"), ("s2", "TTTTACGT")],
        );
        let seqs = read_sequences(&[path], &InputFilters::default()).unwrap();
        assert_eq!(seqs.len(), 2);
        assert_eq!(seqs[0].0, "s1");
        assert_eq!(seqs[0].1, b"ACGTACGT");
        assert_eq!(seqs[1].0, "s2");
    }

    #[test]
    fn allowed_names_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fasta(
            dir.path(),
            "in.fa",
            &[("keep", "ACGTACGT"), ("drop", "TTTTACGT")],
        );
        let mut allowed = FxHashSet::default();
        allowed.insert("keep".to_string());
        let filters = InputFilters {
            allowed: Some(allowed),
            prefixes: Vec::new(),
        };
        let seqs = read_sequences(&[path], &filters).unwrap();
        assert_eq!(seqs.len(), 1);
        assert_eq!(seqs[0].0, "keep");
    }

    #[test]
    fn prefix_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fasta(
            dir.path(),
            "in.fa",
            &[("genomeA#chr1", "ACGTACGT"), ("genomeB#chr1", "TTTTACGT")],
        );
        let filters = InputFilters {
            allowed: None,
            prefixes: vec!["genomeA".to_string()],
        };
        let seqs = read_sequences(&[path], &filters).unwrap();
        assert_eq!(seqs.len(), 1);
        assert_eq!(seqs[0].0, "genomeA#chr1");
    }

    #[test]
    fn fai_sidecar_is_used_for_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fasta(dir.path(), "in.fa", &[("s1", "ACGT")]);
        let fai = PathBuf::from(format!("{}.fai", path.display()));
        let mut file = File::create(&fai).unwrap();
        // Deliberately different from the FASTA content to prove the
        // sidecar takes precedence.
        writeln!(file, "s1\t1000\t4\t4\t5").unwrap();
        writeln!(file, "s2\t2000\t12\t4\t5").unwrap();

        let (count, len) = enumerate_input(&[path], &InputFilters::default()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(len, 3000);
    }

    #[test]
    fn enumeration_without_fai_reads_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fasta(dir.path(), "in.fa", &[("s1", "ACGTACGTAA")]);
        let (count, len) = enumerate_input(&[path], &InputFilters::default()).unwrap();
        assert_eq!(count, 1);
        assert_eq!(len, 10);
    }

    #[test]
    fn name_list_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.txt");
        std::fs::write(&path, "alpha\nbeta\n\n").unwrap();
        let names = read_name_list(&path).unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.contains("alpha"));
        assert!(names.contains("beta"));
    }
}
