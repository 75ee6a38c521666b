//! Sliding union-sketch tracker for the L2 refinement stage.
//!
//! Holds the union of the query sketch and the reference minmers currently
//! inside the sliding window, ordered by hash. The shared-sketch count and
//! strand votes are evaluated over the s' smallest elements of that union,
//! where s' is the query sketch size.

use std::collections::BTreeMap;

use crate::types::{MinmerInfo, QuerySketch};

#[derive(Debug)]
struct SlideEntry {
    in_query: bool,
    q_strand: i8,
    ref_count: u32,
    r_strand: i8,
}

#[derive(Debug)]
pub struct SlideMap {
    entries: BTreeMap<u64, SlideEntry>,
    sketch_size: usize,
    /// Shared hashes among the bottom s' union elements.
    pub shared_sketch_elements: i64,
    /// Query hashes currently present in the reference window, regardless of
    /// rank in the union.
    pub intersection_size: i64,
    /// Signed strand agreement summed over the shared bottom elements.
    pub strand_votes: i64,
}

impl SlideMap {
    pub fn new(query: &QuerySketch) -> Self {
        let mut entries = BTreeMap::new();
        for mi in &query.minmers {
            entries.insert(
                mi.hash,
                SlideEntry {
                    in_query: true,
                    q_strand: mi.strand,
                    ref_count: 0,
                    r_strand: 0,
                },
            );
        }
        SlideMap {
            sketch_size: query.minmers.len(),
            entries,
            shared_sketch_elements: 0,
            intersection_size: 0,
            strand_votes: 0,
        }
    }

    /// A reference minmer window slides in.
    pub fn insert_minmer(&mut self, mi: &MinmerInfo) {
        let entry = self.entries.entry(mi.hash).or_insert(SlideEntry {
            in_query: false,
            q_strand: 0,
            ref_count: 0,
            r_strand: 0,
        });
        if entry.ref_count == 0 {
            entry.r_strand = mi.strand;
            if entry.in_query {
                self.intersection_size += 1;
            }
        }
        entry.ref_count += 1;
        self.recompute();
    }

    /// A reference minmer window slides out.
    pub fn delete_minmer(&mut self, mi: &MinmerInfo) {
        let remove = if let Some(entry) = self.entries.get_mut(&mi.hash) {
            debug_assert!(entry.ref_count > 0);
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                if entry.in_query {
                    self.intersection_size -= 1;
                }
                !entry.in_query
            } else {
                false
            }
        } else {
            false
        };
        if remove {
            self.entries.remove(&mi.hash);
        }
        self.recompute();
    }

    /// Re-evaluate the shared count and strand votes over the bottom s'
    /// union elements. O(s') per update, mirroring the ordered-map walk of
    /// the sliding sketch.
    fn recompute(&mut self) {
        let mut shared = 0;
        let mut votes = 0;
        for entry in self.entries.values().take(self.sketch_size) {
            if entry.in_query && entry.ref_count > 0 {
                shared += 1;
                votes += if entry.q_strand == entry.r_strand { 1 } else { -1 };
            }
        }
        self.shared_sketch_elements = shared;
        self.strand_votes = votes;
    }
}
