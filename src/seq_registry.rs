//! Registry of reference sequences: dense ids assigned in input order, name
//! and length metadata, and prefix-based grouping for the symmetry filters.

use rustc_hash::FxHashMap;

use crate::types::{Offset, SeqId};

#[derive(Debug, Clone)]
pub struct ContigInfo {
    pub name: String,
    pub len: Offset,
}

#[derive(Debug, Default)]
pub struct SequenceRegistry {
    contigs: Vec<ContigInfo>,
    name_to_id: FxHashMap<String, SeqId>,
    /// Group index per sequence id; sequences with the same name prefix share
    /// a group. Empty until `compute_ref_groups` runs.
    ref_groups: Vec<i32>,
}

/// Name prefix up to (excluding) the last occurrence of `delim`; `None` when
/// the delimiter is absent.
fn prefix(name: &str, delim: char) -> Option<&str> {
    name.rfind(delim).map(|idx| &name[..idx])
}

impl SequenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sequence, assigning the next dense id.
    pub fn add(&mut self, name: &str, len: Offset) -> SeqId {
        if let Some(&id) = self.name_to_id.get(name) {
            return id;
        }
        let id = self.contigs.len() as SeqId;
        self.contigs.push(ContigInfo {
            name: name.to_string(),
            len,
        });
        self.name_to_id.insert(name.to_string(), id);
        id
    }

    pub fn len(&self) -> usize {
        self.contigs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contigs.is_empty()
    }

    pub fn name(&self, id: SeqId) -> &str {
        &self.contigs[id as usize].name
    }

    pub fn seq_len(&self, id: SeqId) -> Offset {
        self.contigs[id as usize].len
    }

    pub fn id_of(&self, name: &str) -> Option<SeqId> {
        self.name_to_id.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.contigs.iter().map(|c| c.name.as_str())
    }

    /// Assign group numbers to runs of consecutive sequences sharing the
    /// same name prefix.
    pub fn compute_ref_groups(&mut self, delim: char) {
        self.ref_groups = vec![0; self.contigs.len()];
        let mut group = 0;
        let mut start = 0;
        while start < self.contigs.len() {
            let curr = prefix(&self.contigs[start].name, delim);
            let mut idx = start;
            while idx < self.contigs.len() && prefix(&self.contigs[idx].name, delim) == curr {
                self.ref_groups[idx] = group;
                idx += 1;
            }
            group += 1;
            start = idx;
        }
    }

    pub fn ref_group(&self, id: SeqId) -> i32 {
        if self.ref_groups.is_empty() {
            -1
        } else {
            self.ref_groups[id as usize]
        }
    }

    /// Group of a query by prefix match against the reference names; a query
    /// name without the delimiter belongs to no group (-1).
    pub fn query_group(&self, name: &str, delim: char) -> i32 {
        let Some(query_prefix) = prefix(name, delim) else {
            return -1;
        };
        for (idx, contig) in self.contigs.iter().enumerate() {
            if prefix(&contig.name, delim) == Some(query_prefix) {
                return self.ref_group(idx as SeqId);
            }
        }
        -1
    }
}
