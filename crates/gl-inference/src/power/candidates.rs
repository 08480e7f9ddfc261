//! Candidate treatment groups.

use std::collections::BTreeSet;

use gl_core::Panel;

use crate::combinations::Combinations;
use crate::config::CandidateStrategy;
use crate::numeric::pearson;

/// Lazy stream of candidate groups (sorted location indices) of one size.
#[derive(Debug, Clone)]
pub enum Candidates {
    /// Includes plus lexicographic combinations of the remaining pool.
    Exhaustive {
        /// Locations every group contains.
        includes: Vec<usize>,
        /// Remaining members.
        rest: std::iter::Take<Combinations>,
    },
    /// Precomputed similarity groups.
    Correlation(std::vec::IntoIter<Vec<usize>>),
}

impl Candidates {
    /// Groups of `size` locations from `pool`, all containing `includes`, at most `cap` of them.
    ///
    /// `includes` must be a subset of `pool` with `includes.len() <= size <= pool.len()`.
    pub fn new(
        panel: &Panel,
        pool: &[usize],
        includes: &[usize],
        size: usize,
        strategy: CandidateStrategy,
        cap: usize,
    ) -> Self {
        let rest: Vec<usize> = pool.iter().copied().filter(|l| !includes.contains(l)).collect();
        let k = size.saturating_sub(includes.len());
        match strategy {
            CandidateStrategy::Exhaustive => Candidates::Exhaustive {
                includes: includes.to_vec(),
                rest: Combinations::new(&rest, k).take(cap),
            },
            CandidateStrategy::Correlation => Candidates::Correlation(
                similarity_groups(panel, &rest, includes, k, cap).into_iter(),
            ),
        }
    }
}

impl Iterator for Candidates {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        match self {
            Candidates::Exhaustive { includes, rest } => {
                let extra = rest.next()?;
                let mut group: Vec<usize> = includes.iter().copied().chain(extra).collect();
                group.sort_unstable();
                Some(group)
            }
            Candidates::Correlation(groups) => groups.next(),
        }
    }
}

/// For each anchor in `rest`: includes, the anchor and its `k - 1` most correlated peers.
fn similarity_groups(
    panel: &Panel,
    rest: &[usize],
    includes: &[usize],
    k: usize,
    cap: usize,
) -> Vec<Vec<usize>> {
    if k == 0 {
        return vec![includes.to_vec()];
    }
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for &anchor in rest {
        let mut peers: Vec<(usize, f64)> = rest
            .iter()
            .filter(|&&l| l != anchor)
            .map(|&l| (l, pearson(panel.series(anchor), panel.series(l))))
            .collect();
        peers.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut group: Vec<usize> = includes.to_vec();
        group.push(anchor);
        group.extend(peers.iter().take(k - 1).map(|(l, _)| *l));
        group.sort_unstable();
        if seen.insert(group.clone()) {
            out.push(group);
            if out.len() == cap {
                break;
            }
        }
    }
    out
}
