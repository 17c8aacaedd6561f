use crate::core::models::complex::{Complex, Strand};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Calls `f` with the prefix and suffix sub-complexes of every split point.
///
/// For a key of `len` strands and split `n` in `0..len-1` the prefix is
/// `key[0..len-n-1]` and the suffix `key[n+1..len]`. A single strand has no
/// dependencies.
pub fn for_each_dependency(key: &Complex, mut f: impl FnMut(Complex)) {
    let len = key.len();
    for n in 0..len.saturating_sub(1) {
        f(key.slice(0..len - n - 1));
        f(key.slice(n + 1..len));
    }
}

pub fn dependencies(key: &Complex) -> Vec<Complex> {
    let mut out = Vec::with_capacity(2 * key.len().saturating_sub(1));
    for_each_dependency(key, |k| out.push(k));
    out
}

/// Blocks and strands one finalize step needs, in the order its finalizer
/// reads them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Root {
    /// Requested blocks with their full-request flag.
    pub blocks: Vec<(Complex, bool)>,
    pub strands: Vec<Strand>,
}

impl Root {
    pub fn single(complex: Complex, full: bool) -> Self {
        Self {
            blocks: vec![(complex, full)],
            strands: Vec::new(),
        }
    }
}

/// Complexes with more strands first, ties broken by descending content.
///
/// Consumers sort before their sub-blocks, which makes this the order both
/// for visiting blocks and for acquiring their locks.
pub(crate) fn largest_first(a: &Complex, b: &Complex) -> Ordering {
    (b.len(), b).cmp(&(a.len(), a))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LargestFirst(pub Complex);

impl Ord for LargestFirst {
    fn cmp(&self, other: &Self) -> Ordering {
        largest_first(&self.0, &other.0)
    }
}

impl PartialOrd for LargestFirst {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-root registration queue.
///
/// Blocks are visited largest first. Visiting a block may enqueue its
/// sub-blocks, which are always strictly smaller and therefore still ahead
/// of the cursor. The visit order is recorded so compute tasks can be
/// created in reverse, smallest first.
#[derive(Debug, Default)]
pub(crate) struct BlockQueue {
    pending: BTreeMap<LargestFirst, bool>,
}

impl BlockQueue {
    pub fn from_root(root: &Root) -> Self {
        let mut queue = Self::default();
        for (complex, full) in &root.blocks {
            queue.request(complex.clone(), *full);
        }
        queue
    }

    /// Requests `complex`, upgrading an existing request to full if asked.
    pub fn request(&mut self, complex: Complex, full: bool) {
        *self.pending.entry(LargestFirst(complex)).or_insert(false) |= full;
    }

    /// Removes and returns the largest pending block.
    pub fn pop_largest(&mut self) -> Option<(Complex, bool)> {
        self.pending.pop_first().map(|(k, full)| (k.0, full))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complex(seqs: &[&str]) -> Complex {
        Complex::from_sequences(seqs).unwrap()
    }

    #[test]
    fn dependencies_are_prefixes_and_suffixes() {
        let x = complex(&["A", "C", "G"]);
        assert_eq!(
            dependencies(&x),
            vec![
                complex(&["A", "C"]),
                complex(&["C", "G"]),
                complex(&["A"]),
                complex(&["G"]),
            ]
        );
        assert!(dependencies(&complex(&["ACGU"])).is_empty());
    }

    #[test]
    fn queue_pops_larger_blocks_first() {
        let mut queue = BlockQueue::default();
        queue.request(complex(&["A"]), false);
        queue.request(complex(&["A", "C", "G"]), false);
        queue.request(complex(&["C", "G"]), true);
        queue.request(complex(&["A"]), true);

        let order: Vec<_> = std::iter::from_fn(|| queue.pop_largest()).collect();
        assert_eq!(
            order,
            vec![
                (complex(&["A", "C", "G"]), false),
                (complex(&["C", "G"]), true),
                (complex(&["A"]), true),
            ]
        );
    }

    #[test]
    fn requests_enqueued_while_draining_are_still_visited() {
        let mut queue = BlockQueue::from_root(&Root::single(complex(&["A", "C", "G"]), true));
        let mut visited = Vec::new();
        while let Some((key, _)) = queue.pop_largest() {
            for_each_dependency(&key, |dep| queue.request(dep, true));
            visited.push(key);
        }
        assert_eq!(visited.len(), 6);
        assert!(visited.windows(2).all(|w| w[0].len() >= w[1].len()));
    }
}
