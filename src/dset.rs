//! Lock-free disjoint sets (union-find) with path compression and union by
//! rank, after Anderson & Woll's wait-free algorithm.
//!
//! Each cell packs rank (high 32 bits) and parent (low 32 bits) into one
//! `AtomicU64`, so every update is a single-word CAS. Failed CASes are
//! tolerated everywhere: compression and rank bumps are opportunistic and
//! progress stays monotone toward shallow trees. Chain merging uses one
//! arena per query today, but the structure is safe to share across threads.

use std::sync::atomic::{AtomicU64, Ordering};

pub struct DisjointSets {
    cells: Vec<AtomicU64>,
}

#[inline]
fn parent_of(cell: u64) -> u32 {
    cell as u32
}

#[inline]
fn rank_of(cell: u64) -> u32 {
    (cell >> 32) as u32
}

#[inline]
fn pack(rank: u32, parent: u32) -> u64 {
    ((rank as u64) << 32) | parent as u64
}

impl DisjointSets {
    pub fn new(n: usize) -> Self {
        assert!(n <= u32::MAX as usize, "disjoint set arena too large");
        let cells = (0..n as u32).map(|i| AtomicU64::new(pack(0, i))).collect();
        DisjointSets { cells }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn rank(&self, id: u32) -> u32 {
        rank_of(self.cells[id as usize].load(Ordering::Acquire))
    }

    pub fn parent(&self, id: u32) -> u32 {
        parent_of(self.cells[id as usize].load(Ordering::Acquire))
    }

    /// Representative of `id`'s set, compressing paths opportunistically.
    /// Never blocks.
    pub fn find(&self, mut id: u32) -> u32 {
        loop {
            let cell = self.cells[id as usize].load(Ordering::Acquire);
            let parent = parent_of(cell);
            if parent == id {
                return id;
            }
            let grandparent = parent_of(self.cells[parent as usize].load(Ordering::Acquire));
            if grandparent != parent {
                // Hoist our parent pointer one level; losing the race is fine.
                let _ = self.cells[id as usize].compare_exchange_weak(
                    cell,
                    (cell & 0xFFFF_FFFF_0000_0000) | grandparent as u64,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
            id = grandparent;
        }
    }

    /// True iff `id1` and `id2` are currently in the same set.
    pub fn same(&self, mut id1: u32, mut id2: u32) -> bool {
        loop {
            id1 = self.find(id1);
            id2 = self.find(id2);
            if id1 == id2 {
                return true;
            }
            if self.parent(id1) == id1 {
                return false;
            }
        }
    }

    /// Merge the sets of `id1` and `id2`, returning the surviving
    /// representative. Ties are deterministic: lower rank attaches under
    /// higher rank; on equal ranks the larger id attaches under the smaller.
    pub fn unite(&self, mut id1: u32, mut id2: u32) -> u32 {
        loop {
            id1 = self.find(id1);
            id2 = self.find(id2);
            if id1 == id2 {
                return id1;
            }

            let mut r1 = self.rank(id1);
            let mut r2 = self.rank(id2);
            if r1 > r2 || (r1 == r2 && id1 < id2) {
                std::mem::swap(&mut r1, &mut r2);
                std::mem::swap(&mut id1, &mut id2);
            }

            // Attach id1 (loser) under id2.
            let old = pack(r1, id1);
            let new = pack(r1, id2);
            if self.cells[id1 as usize]
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            if r1 == r2 {
                // Try to bump the winner's rank; a failed bump is harmless.
                let old = pack(r2, id2);
                let new = pack(r2 + 1, id2);
                let _ = self.cells[id2 as usize].compare_exchange(
                    old,
                    new,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
            return id2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn singletons_are_their_own_roots() {
        let ds = DisjointSets::new(8);
        for i in 0..8 {
            assert_eq!(ds.find(i), i);
            assert_eq!(ds.rank(i), 0);
        }
    }

    #[test]
    fn unite_links_classes() {
        let ds = DisjointSets::new(10);
        ds.unite(0, 1);
        ds.unite(2, 3);
        assert!(ds.same(0, 1));
        assert!(ds.same(2, 3));
        assert!(!ds.same(1, 2));
        ds.unite(1, 3);
        assert!(ds.same(0, 2));
    }

    #[test]
    fn find_is_idempotent_and_rank_monotone() {
        let ds = DisjointSets::new(64);
        let mut ranks = vec![0u32; 64];
        for i in 0..63u32 {
            ds.unite(i, i + 1);
            for j in 0..64u32 {
                let r = ds.rank(j);
                assert!(r >= ranks[j as usize], "rank decreased on {j}");
                ranks[j as usize] = r;
                let root = ds.find(j);
                assert_eq!(ds.find(root), root);
            }
        }
        let root = ds.find(0);
        for j in 0..64 {
            assert_eq!(ds.find(j), root);
        }
    }

    #[test]
    fn equal_rank_ties_attach_larger_under_smaller() {
        let ds = DisjointSets::new(4);
        assert_eq!(ds.unite(2, 1), 1);
        assert_eq!(ds.unite(3, 3), 3);
        let ds2 = DisjointSets::new(4);
        assert_eq!(ds2.unite(0, 3), 0);
    }

    #[test]
    fn matches_naive_union_find() {
        // Deterministic pseudo-random union sequence checked against a
        // straightforward reference implementation.
        let n = 128usize;
        let ds = DisjointSets::new(n);
        let mut naive: Vec<usize> = (0..n).collect();
        fn naive_find(p: &mut Vec<usize>, x: usize) -> usize {
            let mut root = x;
            while p[root] != root {
                root = p[root];
            }
            let mut cur = x;
            while p[cur] != root {
                let next = p[cur];
                p[cur] = root;
                cur = next;
            }
            root
        }

        let mut state = 0x9E3779B97F4A7C15u64;
        for _ in 0..400 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let a = (state >> 33) as usize % n;
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let b = (state >> 33) as usize % n;
            ds.unite(a as u32, b as u32);
            let (ra, rb) = (naive_find(&mut naive, a), naive_find(&mut naive, b));
            naive[ra.max(rb)] = ra.min(rb);
        }

        for a in 0..n {
            for b in (a + 1)..n {
                let same_naive = naive_find(&mut naive, a) == naive_find(&mut naive, b);
                assert_eq!(ds.same(a as u32, b as u32), same_naive, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn concurrent_unions_converge() {
        let n = 256u32;
        let ds = Arc::new(DisjointSets::new(n as usize));
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let ds = Arc::clone(&ds);
            handles.push(std::thread::spawn(move || {
                // Each thread links a strided chain; all chains overlap at 0.
                let mut prev = 0u32;
                let mut i = t + 1;
                while i < n {
                    ds.unite(prev, i);
                    prev = i;
                    i += 4;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let root = ds.find(0);
        for i in 0..n {
            assert_eq!(ds.find(i), root);
        }
    }
}
