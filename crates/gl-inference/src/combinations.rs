//! Lazy lexicographic k-combinations.
//!
//! Candidate groups and placebo sets are both enumerated from here, so the
//! order (and therefore truncation at a cap) is deterministic.

/// Iterator over `k`-subsets of `items`, in lexicographic order of positions.
///
/// `k = 0` yields a single empty subset.
#[derive(Debug, Clone)]
pub struct Combinations {
    items: Vec<usize>,
    idx: Vec<usize>,
    done: bool,
}

impl Combinations {
    /// Combinations of size `k` drawn from `items`.
    pub fn new(items: &[usize], k: usize) -> Self {
        Self { items: items.to_vec(), idx: (0..k).collect(), done: k > items.len() }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.done {
            return None;
        }
        let out = self.idx.iter().map(|&i| self.items[i]).collect();

        let n = self.items.len();
        let k = self.idx.len();
        match (0..k).rev().find(|&i| self.idx[i] != i + n - k) {
            Some(i) => {
                self.idx[i] += 1;
                for j in i + 1..k {
                    self.idx[j] = self.idx[j - 1] + 1;
                }
            }
            None => self.done = true,
        }
        Some(out)
    }
}

/// Binomial coefficient `C(n, k)`, saturating at `usize::MAX`.
pub fn n_choose_k(n: usize, k: usize) -> usize {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut acc: u128 = 1;
    for i in 0..k {
        acc = acc * (n - i) as u128 / (i + 1) as u128;
        if acc > usize::MAX as u128 {
            return usize::MAX;
        }
    }
    acc as usize
}
