//! Covariate residualization.
//!
//! Each unit is summarized by its covariate means over the pre-period. For
//! every time `t`, donor outcomes are regressed on `[1, x̄_j]` across donors;
//! the Synthetic Control is then fitted on the residuals and the regression
//! prediction for the treated aggregate is added back to its counterfactual.
//! The design matrix is the same for every `t`, so the hat operator is solved
//! once.

use gl_core::{Error, Panel, Result, TreatmentSpec};
use nalgebra::{DMatrix, DVector};

use crate::numeric::solve_ridge;
use crate::series::SeriesMatrix;

/// Residualized outcomes plus the covariate prediction for the treated aggregate.
#[derive(Debug, Clone)]
pub struct Residualized {
    /// Residual outcome matrix.
    pub data: SeriesMatrix,
    /// Covariate prediction for the treated aggregate, times `1..=T`.
    pub treated_fitted: Vec<f64>,
}

/// Residualize `data` on the pre-period covariate means of `spec`'s units.
pub fn residualize(
    panel: &Panel,
    spec: &TreatmentSpec,
    data: &SeriesMatrix,
) -> Result<Residualized> {
    let k = panel.n_covariates();
    if k == 0 {
        return Err(Error::Validation("panel has no covariates".into()));
    }
    let j = data.n_donors();
    if j <= k + 1 {
        return Err(Error::InsufficientData(format!(
            "{j} donors cannot identify {} covariate coefficients",
            k + 1
        )));
    }

    let pre = spec.pre_times();
    let unit_means = |loc: usize| -> Vec<f64> {
        let mut acc = vec![0.0; k];
        for &t in &pre {
            if let Some(x) = panel.covariates(loc, t) {
                for (a, v) in acc.iter_mut().zip(x) {
                    *a += v;
                }
            }
        }
        acc.iter().map(|a| a / pre.len() as f64).collect()
    };

    let donor_x: Vec<Vec<f64>> = data.donor_ids().iter().map(|&d| unit_means(d)).collect();
    let mut treated_x = vec![0.0; k];
    for &l in spec.treated() {
        for (a, v) in treated_x.iter_mut().zip(unit_means(l)) {
            *a += v / spec.treated().len() as f64;
        }
    }

    let design = DMatrix::from_fn(j, k + 1, |r, c| if c == 0 { 1.0 } else { donor_x[r][c - 1] });
    let gram = design.transpose() * &design;
    let treated_row =
        DVector::from_iterator(k + 1, std::iter::once(1.0).chain(treated_x.iter().copied()));

    let n_times = data.n_times();
    let mut donor_resid = vec![vec![0.0; n_times]; j];
    let mut treated_resid = vec![0.0; n_times];
    let mut treated_fitted = vec![0.0; n_times];
    for t in 1..=n_times {
        let y = DVector::from_iterator(j, (0..j).map(|d| data.donor_at(d, t)));
        let beta = solve_ridge(&gram, &(design.transpose() * &y), 0.0).ok_or_else(|| {
            Error::InsufficientData("donor covariate means are collinear".into())
        })?;
        let fitted = &design * &beta;
        for d in 0..j {
            donor_resid[d][t - 1] = y[d] - fitted[d];
        }
        let pred = treated_row.dot(&beta);
        treated_fitted[t - 1] = pred;
        treated_resid[t - 1] = data.treated_at(t) - pred;
    }

    let data = SeriesMatrix::from_parts(treated_resid, data.donor_ids().to_vec(), donor_resid)?;
    Ok(Residualized { data, treated_fitted })
}
