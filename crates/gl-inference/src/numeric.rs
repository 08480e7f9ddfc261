//! Small numerical helpers shared by the fitters.

use nalgebra::{DMatrix, DVector};
use statrs::statistics::Statistics;

/// Euclidean projection of `v` onto the probability simplex (in place).
///
/// Sort-based algorithm of Duchi et al. (2008), `O(n log n)`.
pub fn project_simplex(v: &mut [f64]) {
    if v.is_empty() {
        return;
    }
    let mut u = v.to_vec();
    u.sort_by(|a, b| b.total_cmp(a));
    let mut cum = 0.0;
    let mut theta = 0.0;
    for (j, &uj) in u.iter().enumerate() {
        cum += uj;
        let t = (cum - 1.0) / (j + 1) as f64;
        if uj - t > 0.0 {
            theta = t;
        }
    }
    for x in v.iter_mut() {
        *x = (*x - theta).max(0.0);
    }
}

/// Largest eigenvalue of a symmetric matrix (0 for an empty matrix).
pub fn largest_eigenvalue(gram: &DMatrix<f64>) -> f64 {
    if gram.is_empty() {
        return 0.0;
    }
    gram.clone().symmetric_eigen().eigenvalues.iter().copied().fold(0.0_f64, f64::max)
}

/// Solve `(A + lambda I) x = b` for symmetric positive semi-definite `A`.
///
/// Returns `None` when the shifted matrix is not positive definite.
pub fn solve_ridge(a: &DMatrix<f64>, b: &DVector<f64>, lambda: f64) -> Option<DVector<f64>> {
    let n = a.nrows();
    let shifted = a + DMatrix::<f64>::identity(n, n) * lambda;
    let chol = shifted.cholesky()?;
    let x = chol.solve(b);
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Quantile for sorted data via linear interpolation.
///
/// - `q=0` returns min
/// - `q=1` returns max
/// - empty input returns `NaN`
pub fn quantile_linear_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let i = pos.floor() as usize;
    let j = pos.ceil() as usize;
    if i == j {
        return sorted[i];
    }
    let t = pos - i as f64;
    (1.0 - t) * sorted[i] + t * sorted[j]
}

/// Split `times` into `k` contiguous, nearly equal blocks (earlier blocks get the remainder).
pub fn contiguous_folds(times: &[usize], k: usize) -> Vec<Vec<usize>> {
    let k = k.min(times.len()).max(1);
    let base = times.len() / k;
    let extra = times.len() % k;
    let mut out = Vec::with_capacity(k);
    let mut pos = 0;
    for f in 0..k {
        let len = base + usize::from(f < extra);
        out.push(times[pos..pos + len].to_vec());
        pos += len;
    }
    out
}

/// `times` minus the (sorted) `holdout` times.
pub fn complement(times: &[usize], holdout: &[usize]) -> Vec<usize> {
    times.iter().copied().filter(|t| holdout.binary_search(t).is_err()).collect()
}

/// Pearson correlation; 0 when either series is constant.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let sa = a.std_dev();
    let sb = b.std_dev();
    if !(sa > 0.0 && sb > 0.0) || a.len() < 2 {
        return 0.0;
    }
    let ma = a.mean();
    let mb = b.mean();
    let cov: f64 =
        a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum::<f64>() / (a.len() - 1) as f64;
    cov / (sa * sb)
}

/// Scaled L2 imbalance: `l2 / baseline` clipped to `[0, 1]`.
///
/// With a vanishing baseline the ratio is 0 for a vanishing `l2` and 1 otherwise.
pub fn scaled_imbalance(l2: f64, baseline: f64, tol: f64) -> f64 {
    if baseline <= tol {
        return if l2 <= tol { 0.0 } else { 1.0 };
    }
    (l2 / baseline).clamp(0.0, 1.0)
}
