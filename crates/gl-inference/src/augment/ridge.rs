//! Ridge-augmented Synthetic Control (Ben-Michael, Feller & Rothstein 2021).
//!
//! The Synthetic Control residual on the fitting times is regressed on the
//! (demeaned, under fixed effects) donor outcomes with an L2 penalty. The
//! coefficients `δ` act as an additive, unconstrained correction to the simplex
//! weights: the augmented weights are `w + δ`.

use gl_core::{Error, Result};
use nalgebra::{DMatrix, DVector};

use crate::numeric::{complement, contiguous_folds, solve_ridge};
use crate::series::SeriesMatrix;
use crate::weights::SyntheticControlFit;

/// Penalty grid, as multiples of the mean eigenvalue of the Gram matrix.
const PENALTY_SCALES: [f64; 8] = [1e-4, 1e-3, 1e-2, 1e-1, 1.0, 10.0, 100.0, 1e3];

/// Fitted ridge correction.
#[derive(Debug, Clone, PartialEq)]
pub struct RidgeFit {
    /// Additive donor coefficients.
    pub coefficients: Vec<f64>,
    /// Selected penalty.
    pub penalty: f64,
}

impl RidgeFit {
    /// Correction at time `t`.
    pub fn adjustment(&self, data: &SeriesMatrix, sc: &SyntheticControlFit, t: usize) -> f64 {
        self.coefficients
            .iter()
            .zip(&sc.donor_means)
            .enumerate()
            .map(|(j, (&d, &m))| d * (data.donor_at(j, t) - m))
            .sum()
    }
}

/// Fit the ridge correction on `times`, choosing the penalty by `folds`-fold CV.
pub fn fit(
    data: &SeriesMatrix,
    sc: &SyntheticControlFit,
    times: &[usize],
    folds: usize,
) -> Result<RidgeFit> {
    let j = data.n_donors();
    if times.len() < j {
        return Err(Error::Augmentation(format!(
            "ridge needs at least {j} periods for {j} donors, got {}",
            times.len()
        )));
    }
    let k = folds.min(times.len() / 2);
    if k < 2 {
        return Err(Error::Augmentation(format!(
            "{} periods are too few for cross-validation",
            times.len()
        )));
    }

    let (z, r) = design(data, sc, times);
    let gram = z.transpose() * &z;
    let mean_eig = gram.trace() / j as f64;
    if !(mean_eig > 0.0 && mean_eig.is_finite()) {
        return Err(Error::Augmentation("donor design has no variation".into()));
    }

    let blocks = contiguous_folds(&(0..times.len()).collect::<Vec<_>>(), k);
    let mut best: Option<(f64, f64)> = None;
    for scale in PENALTY_SCALES {
        let lambda = scale * mean_eig;
        let mut sse = 0.0;
        let mut ok = true;
        for held in &blocks {
            let train = complement(&(0..times.len()).collect::<Vec<_>>(), held);
            let zt = z.select_rows(train.iter());
            let rt = r.select_rows(train.iter());
            let Some(delta) = solve_ridge(&(zt.transpose() * &zt), &(zt.transpose() * &rt), lambda)
            else {
                ok = false;
                break;
            };
            let zh = z.select_rows(held.iter());
            let rh = r.select_rows(held.iter());
            sse += (rh - zh * delta).norm_squared();
        }
        if ok && best.is_none_or(|(_, s)| sse < s) {
            best = Some((lambda, sse));
        }
    }
    let (penalty, _) = best
        .ok_or_else(|| Error::Augmentation("ridge system is singular for every penalty".into()))?;

    let delta = solve_ridge(&gram, &(z.transpose() * &r), penalty)
        .ok_or_else(|| Error::Augmentation("ridge system is singular".into()))?;
    log::debug!("ridge augmentation: penalty={penalty:.4e}");
    Ok(RidgeFit { coefficients: delta.iter().copied().collect(), penalty })
}

/// Demeaned donor design and SC residual on `times`.
fn design(
    data: &SeriesMatrix,
    sc: &SyntheticControlFit,
    times: &[usize],
) -> (DMatrix<f64>, DVector<f64>) {
    let z = DMatrix::from_fn(times.len(), data.n_donors(), |r, c| {
        data.donor_at(c, times[r]) - sc.donor_means[c]
    });
    let r = DVector::from_iterator(
        times.len(),
        times.iter().map(|&t| data.treated_at(t) - sc.predict(data, t)),
    );
    (z, r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::WeightFitter;

    #[test]
    fn test_ridge_reduces_in_sample_residual() {
        // Treated unit lies outside the donors' convex hull: SC cannot match it.
        let n = 40;
        let d1: Vec<f64> = (0..n).map(|t| 10.0 + (t as f64 * 0.5).sin()).collect();
        let d2: Vec<f64> = (0..n).map(|t| 12.0 + (t as f64 * 0.9).cos()).collect();
        let d3: Vec<f64> = (0..n).map(|t| 11.0 + 0.1 * t as f64).collect();
        let treated: Vec<f64> = (0..n).map(|t| 2.0 * d1[t] - 0.5 * d2[t]).collect();
        let data = SeriesMatrix::from_parts(treated, vec![1, 2, 3], vec![d1, d2, d3]).unwrap();
        let times: Vec<usize> = (1..=30).collect();
        let sc = WeightFitter::new(false).fit(&data, &times).unwrap();
        let fit = fit(&data, &sc, &times, 5).unwrap();

        let sse = |adj: &dyn Fn(usize) -> f64| -> f64 {
            times
                .iter()
                .map(|&t| (data.treated_at(t) - sc.predict(&data, t) - adj(t)).powi(2))
                .sum()
        };
        let base = sse(&|_| 0.0);
        let aug = sse(&|t| fit.adjustment(&data, &sc, t));
        assert!(fit.penalty > 0.0);
        assert!(aug < base, "aug={aug} base={base}");
    }

    #[test]
    fn test_too_few_periods() {
        let data =
            SeriesMatrix::from_parts(vec![1.0; 6], vec![1, 2], vec![vec![1.0; 6], vec![2.0; 6]])
                .unwrap();
        let sc = WeightFitter::new(false).fit(&data, &[1, 2, 3]).unwrap();
        assert!(matches!(fit(&data, &sc, &[1, 2, 3], 5), Err(Error::Augmentation(_))));
    }
}
