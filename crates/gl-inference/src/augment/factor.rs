//! Generalized Synthetic Control (Xu 2017): interactive fixed effects.
//!
//! Donor outcomes over the whole horizon follow
//! `y_jt = α_j + ξ_t + λ_jᵀ f_t + ε_jt`. Unit effects are taken over the
//! fitting times, time effects across donors, and the factors `f_t` from the
//! leading right singular vectors of the two-way demeaned donor matrix. The
//! treated aggregate's loadings are estimated by least squares on the fitting
//! times only, so post-period treated outcomes never enter the fit.
//!
//! The factor rank is chosen by leave-one-block-out cross-validation over the
//! fitting times (rank 0 is the two-way fixed-effects model).

use gl_core::{Error, Result};
use nalgebra::{DMatrix, DVector};

use crate::numeric::{complement, contiguous_folds, solve_ridge};
use crate::series::SeriesMatrix;

/// Fitted factor model for the treated aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorFit {
    /// Selected rank.
    pub rank: usize,
    /// Counterfactual for times `1..=T`.
    pub counterfactual: Vec<f64>,
}

struct Factors {
    /// Time effects `ξ_t` (index `t - 1`).
    time_effects: Vec<f64>,
    /// `T × r_max` factor matrix, columns ordered by singular value.
    f: DMatrix<f64>,
}

/// Fit the factor model on `times`, trying ranks `0..=max_rank`.
pub fn fit(
    data: &SeriesMatrix,
    times: &[usize],
    max_rank: usize,
    folds: usize,
) -> Result<FactorFit> {
    let j = data.n_donors();
    if j < 2 {
        return Err(Error::Augmentation("factor model needs at least 2 donors".into()));
    }
    let max_rank = max_rank.min(j - 1).min(times.len().saturating_sub(2));
    let factors = extract_factors(data, times, max_rank)?;

    let k = folds.min(times.len() / 2);
    let rank = if max_rank == 0 || k < 2 {
        0
    } else {
        let blocks = contiguous_folds(times, k);
        let mut best = (0usize, f64::INFINITY);
        for r in 0..=max_rank {
            let mut sse = 0.0;
            for held in &blocks {
                let train = complement(times, held);
                match predict(data, &factors, &train, r) {
                    Ok(cf) => {
                        sse += held
                            .iter()
                            .map(|&t| (data.treated_at(t) - cf[t - 1]).powi(2))
                            .sum::<f64>();
                    }
                    Err(_) => {
                        sse = f64::INFINITY;
                        break;
                    }
                }
            }
            if sse < best.1 {
                best = (r, sse);
            }
        }
        best.0
    };

    let counterfactual = predict(data, &factors, times, rank)?;
    log::debug!("gsc augmentation: rank={rank} (max {max_rank})");
    Ok(FactorFit { rank, counterfactual })
}

fn extract_factors(data: &SeriesMatrix, times: &[usize], max_rank: usize) -> Result<Factors> {
    let j = data.n_donors();
    let n_times = data.n_times();
    let nf = times.len() as f64;
    let unit: Vec<f64> =
        (0..j).map(|d| times.iter().map(|&t| data.donor_at(d, t)).sum::<f64>() / nf).collect();
    let time_effects: Vec<f64> = (1..=n_times)
        .map(|t| (0..j).map(|d| data.donor_at(d, t) - unit[d]).sum::<f64>() / j as f64)
        .collect();

    if max_rank == 0 {
        return Ok(Factors { time_effects, f: DMatrix::zeros(n_times, 0) });
    }

    let resid =
        DMatrix::from_fn(j, n_times, |d, c| data.donor_at(d, c + 1) - unit[d] - time_effects[c]);
    let svd = resid.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::Augmentation("SVD did not return singular vectors".into()))?;

    let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
    order.sort_by(|&a, &b| svd.singular_values[b].total_cmp(&svd.singular_values[a]));
    let r = max_rank.min(order.len());
    let f = DMatrix::from_fn(n_times, r, |t, c| v_t[(order[c], t)] * svd.singular_values[order[c]]);
    Ok(Factors { time_effects, f })
}

/// Counterfactual over the full horizon using loadings fitted on `train`.
fn predict(
    data: &SeriesMatrix,
    factors: &Factors,
    train: &[usize],
    rank: usize,
) -> Result<Vec<f64>> {
    if train.is_empty() {
        return Err(Error::Augmentation("no fitting periods".into()));
    }
    let n = train.len() as f64;
    let level =
        train.iter().map(|&t| data.treated_at(t) - factors.time_effects[t - 1]).sum::<f64>() / n;
    let base = |t: usize| level + factors.time_effects[t - 1];

    if rank == 0 {
        return Ok((1..=data.n_times()).map(base).collect());
    }
    if train.len() <= rank {
        return Err(Error::Augmentation(format!(
            "{} periods cannot identify {rank} loadings",
            train.len()
        )));
    }

    // Loadings on factors demeaned over the training times, matching the unit effect above.
    let f = factors.f.columns(0, rank);
    let f_mean: Vec<f64> =
        (0..rank).map(|c| train.iter().map(|&t| f[(t - 1, c)]).sum::<f64>() / n).collect();
    let x = DMatrix::from_fn(train.len(), rank, |r, c| f[(train[r] - 1, c)] - f_mean[c]);
    let y =
        DVector::from_iterator(train.len(), train.iter().map(|&t| data.treated_at(t) - base(t)));
    let gram = x.transpose() * &x;
    let tiny = 1e-12 * gram.trace().max(1.0);
    let loadings = solve_ridge(&gram, &(x.transpose() * &y), tiny)
        .ok_or_else(|| Error::Augmentation("factor loadings are not identified".into()))?;

    Ok((1..=data.n_times())
        .map(|t| {
            base(t) + (0..rank).map(|c| (f[(t - 1, c)] - f_mean[c]) * loadings[c]).sum::<f64>()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovers_single_factor_structure() {
        let n = 60;
        let factor: Vec<f64> = (0..n).map(|t| (t as f64 * 0.37).sin() * 5.0).collect();
        let loadings = [0.5, 1.0, 1.5, -0.5, 2.0, 0.8];
        let donors: Vec<Vec<f64>> = loadings
            .iter()
            .enumerate()
            .map(|(i, l)| {
                (0..n).map(|t| 20.0 + i as f64 + 0.05 * t as f64 + l * factor[t]).collect()
            })
            .collect();
        // Loading 3.0 lies outside the donors' range: no convex combination matches.
        let treated: Vec<f64> = (0..n).map(|t| 30.0 + 0.05 * t as f64 + 3.0 * factor[t]).collect();
        let data = SeriesMatrix::from_parts(treated, (1..=6).collect(), donors).unwrap();
        let times: Vec<usize> = (1..=45).collect();

        let fit = fit(&data, &times, 3, 5).unwrap();
        assert!(fit.rank >= 1);
        for t in 46..=n {
            let err = (fit.counterfactual[t - 1] - data.treated_at(t)).abs();
            assert!(err < 1e-6, "t={t} err={err}");
        }
    }

    #[test]
    fn test_rank_zero_is_two_way_fixed_effects() {
        let donors = vec![vec![1.0, 2.0, 3.0, 4.0, 5.0], vec![3.0, 4.0, 5.0, 6.0, 7.0]];
        let treated = vec![10.0, 11.0, 12.0, 13.0, 14.0];
        let data = SeriesMatrix::from_parts(treated, vec![1, 2], donors).unwrap();
        let fit = fit(&data, &[1, 2, 3], 0, 2).unwrap();
        assert_eq!(fit.rank, 0);
        for t in 1..=5 {
            assert!((fit.counterfactual[t - 1] - data.treated_at(t)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_single_donor_rejected() {
        let data = SeriesMatrix::from_parts(vec![1.0; 4], vec![1], vec![vec![1.0; 4]]).unwrap();
        assert!(matches!(fit(&data, &[1, 2, 3], 2, 2), Err(Error::Augmentation(_))));
    }
}
