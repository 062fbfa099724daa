//! Checklist likelihood kernel.
//!
//! For every cell `c` with occupancy probability `ψ_c = σ(env_logit_c)` and
//! checklists `i ∈ c` with detection probability `p_i = σ(obs_logit_i)`, the
//! kernel returns the marginal log-probability of the cell's whole history,
//! integrating out the latent occupancy state:
//!
//! ```text
//! log L_c = log( ψ_c · Π_i [p_i if m_i = 0 else 1 − p_i]  +  (1 − ψ_c) · Π_i m_i )
//! ```
//!
//! where `m_i = 1` marks a non-detection. The computation is carried out in
//! log space: per-cell sums of `log p_i` / `log(1 − p_i)` are accumulated by
//! cell id, and the absence branch is `−∞` for any cell with a detection.
//! Cells without checklists contribute exactly `0`.
//!
//! Gradients are analytic. Writing `w_c = exp(present_c − log L_c)` for the
//! posterior probability that cell `c` is occupied given its history,
//!
//! ```text
//! ∂ log L_c / ∂ env_logit_c = w_c − ψ_c
//! ∂ log L_c / ∂ obs_logit_i = w_c · ((1 − m_i) − p_i)
//! ```
//!
//! `w_c` is always in `[0, 1]`, so nothing here produces NaN when `ψ_c`
//! saturates at either end.

use crate::errors::{OccuError, Result};
use crate::link::{log_add_exp, log_sigmoid, segment_sum, sigmoid};
use ndarray::{Array1, ArrayView1};

/// Validated mapping from checklists to cells.
#[derive(Debug, Clone, PartialEq)]
pub struct CellIndex {
    cell_ids: Vec<usize>,
    n_cells: usize,
    checklists_per_cell: Vec<usize>,
}

impl CellIndex {
    /// Check that every id lies in `[0, n_cells)` and count checklists per cell.
    pub fn new(cell_ids: &[usize], n_cells: usize) -> Result<Self> {
        if let Some((checklist, &cell_id)) =
            cell_ids.iter().enumerate().find(|&(_, &c)| c >= n_cells)
        {
            return Err(OccuError::CellIdOutOfRange {
                checklist,
                cell_id,
                n_cells,
            });
        }
        let ones: Array1<f64> = Array1::ones(cell_ids.len());
        let checklists_per_cell = segment_sum(ones.view(), cell_ids, n_cells)
            .iter()
            .map(|&n| n as usize)
            .collect();
        Ok(Self {
            cell_ids: cell_ids.to_vec(),
            n_cells,
            checklists_per_cell,
        })
    }

    pub fn n_cells(&self) -> usize {
        self.n_cells
    }

    pub fn n_checklists(&self) -> usize {
        self.cell_ids.len()
    }

    pub fn cell_ids(&self) -> &[usize] {
        &self.cell_ids
    }

    /// Number of checklists recorded in each cell.
    pub fn checklists_per_cell(&self) -> &[usize] {
        &self.checklists_per_cell
    }
}

/// Reusable buffers for one kernel evaluation stream.
///
/// A workspace is sized for one [`CellIndex`]; optimizers evaluate the
/// kernel thousands of times per species, so the buffers are allocated once
/// and overwritten on every call to [`KernelWorkspace::evaluate`].
#[derive(Debug, Clone)]
pub struct KernelWorkspace {
    occupied: Array1<f64>,
    detections: Array1<f64>,
    cell_loglik: Array1<f64>,
    occupied_weight: Array1<f64>,
    env_grad: Array1<f64>,
    obs_grad: Array1<f64>,
}

impl KernelWorkspace {
    pub fn new(cells: &CellIndex) -> Self {
        let n_cells = cells.n_cells();
        let n_checklists = cells.n_checklists();
        Self {
            occupied: Array1::zeros(n_cells),
            detections: Array1::zeros(n_cells),
            cell_loglik: Array1::zeros(n_cells),
            occupied_weight: Array1::zeros(n_cells),
            env_grad: Array1::zeros(n_cells),
            obs_grad: Array1::zeros(n_checklists),
        }
    }

    /// Number of f64 slots held by this workspace.
    pub fn len(&self) -> usize {
        5 * self.occupied.len() + self.obs_grad.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evaluate the kernel and return the total log-likelihood `Σ_c log L_c`.
    ///
    /// # Arguments
    /// * `env_logit` - occupancy logits, one per cell
    /// * `obs_logit` - detection logits, one per checklist
    /// * `not_detected` - `m_i`, 1.0 for a non-detection, 0.0 for a detection
    /// * `cells` - checklist-to-cell mapping the workspace was built for
    /// * `with_grad` - also fill [`env_grad`](Self::env_grad) and
    ///   [`obs_grad`](Self::obs_grad)
    ///
    /// Lengths are the caller's responsibility and are only checked in debug
    /// builds; models validate them once before fitting.
    pub fn evaluate(
        &mut self,
        env_logit: ArrayView1<f64>,
        obs_logit: ArrayView1<f64>,
        not_detected: ArrayView1<f64>,
        cells: &CellIndex,
        with_grad: bool,
    ) -> f64 {
        debug_assert_eq!(env_logit.len(), cells.n_cells());
        debug_assert_eq!(obs_logit.len(), cells.n_checklists());
        debug_assert_eq!(not_detected.len(), cells.n_checklists());
        debug_assert_eq!(self.occupied.len(), cells.n_cells());

        self.occupied.fill(0.0);
        self.detections.fill(0.0);
        for ((&c, &x), &m) in cells.cell_ids().iter().zip(&obs_logit).zip(&not_detected) {
            self.occupied[c] += m * log_sigmoid(-x) + (1.0 - m) * log_sigmoid(x);
            self.detections[c] += 1.0 - m;
        }

        let mut total = 0.0;
        for c in 0..cells.n_cells() {
            if cells.checklists_per_cell()[c] == 0 {
                self.cell_loglik[c] = 0.0;
                self.occupied_weight[c] = 0.0;
                self.env_grad[c] = 0.0;
                continue;
            }
            let eta = env_logit[c];
            let present = log_sigmoid(eta) + self.occupied[c];
            let absent = if self.detections[c] > 0.5 {
                f64::NEG_INFINITY
            } else {
                log_sigmoid(-eta)
            };
            let ll = log_add_exp(present, absent);
            self.cell_loglik[c] = ll;
            total += ll;
            if with_grad {
                let w = (present - ll).exp().min(1.0);
                self.occupied_weight[c] = w;
                self.env_grad[c] = w - sigmoid(eta);
            }
        }

        if with_grad {
            for (i, ((&c, &x), &m)) in cells
                .cell_ids()
                .iter()
                .zip(&obs_logit)
                .zip(&not_detected)
                .enumerate()
            {
                self.obs_grad[i] = self.occupied_weight[c] * ((1.0 - m) - sigmoid(x));
            }
        }
        total
    }

    /// Per-cell log-likelihood from the last evaluation.
    pub fn cell_log_likelihood(&self) -> ArrayView1<'_, f64> {
        self.cell_loglik.view()
    }

    /// `∂ Σ log L / ∂ env_logit` from the last evaluation with gradients.
    pub fn env_grad(&self) -> ArrayView1<'_, f64> {
        self.env_grad.view()
    }

    /// `∂ Σ log L / ∂ obs_logit` from the last evaluation with gradients.
    pub fn obs_grad(&self) -> ArrayView1<'_, f64> {
        self.obs_grad.view()
    }
}

/// Per-cell marginal log-likelihood of every cell's checklist history.
///
/// Convenience wrapper that allocates a fresh [`KernelWorkspace`].
pub fn checklist_log_likelihood(
    env_logit: ArrayView1<f64>,
    obs_logit: ArrayView1<f64>,
    not_detected: ArrayView1<f64>,
    cells: &CellIndex,
) -> Array1<f64> {
    let mut ws = KernelWorkspace::new(cells);
    ws.evaluate(env_logit, obs_logit, not_detected, cells, false);
    ws.cell_loglik
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::array;
    use proptest::prelude::*;

    fn logit(p: f64) -> f64 {
        (p / (1.0 - p)).ln()
    }

    #[test]
    fn rejects_out_of_range_cell_ids() {
        let err = CellIndex::new(&[0, 1, 3], 3).unwrap_err();
        assert!(matches!(
            err,
            OccuError::CellIdOutOfRange {
                checklist: 2,
                cell_id: 3,
                n_cells: 3
            }
        ));
    }

    #[test]
    fn empty_cell_contributes_zero() {
        let cells = CellIndex::new(&[0, 0], 2).unwrap();
        let ll = checklist_log_likelihood(
            array![0.3, 25.0].view(),
            array![0.0, 1.0].view(),
            array![1.0, 0.0].view(),
            &cells,
        );
        assert_eq!(ll[1], 0.0);
    }

    #[test]
    fn five_non_detections_at_high_occupancy() {
        let cells = CellIndex::new(&[0; 5], 1).unwrap();
        let obs = Array1::from_elem(5, logit(0.9));
        let m = Array1::ones(5);
        let ll = checklist_log_likelihood(array![logit(0.9)].view(), obs.view(), m.view(), &cells);
        let expected = (0.9 * 0.1f64.powi(5) + 0.1).ln();
        assert_abs_diff_eq!(ll[0], expected, epsilon = 1e-12);
        assert_abs_diff_eq!(ll[0], 0.10001f64.ln(), epsilon = 1e-6);
    }

    #[test]
    fn detection_removes_absence_branch() {
        let cells = CellIndex::new(&[0, 0, 0], 1).unwrap();
        let (psi, p) = (0.4, 0.3);
        let ll = checklist_log_likelihood(
            array![logit(psi)].view(),
            Array1::from_elem(3, logit(p)).view(),
            array![1.0, 0.0, 1.0].view(),
            &cells,
        );
        let expected = psi.ln() + 2.0 * (1.0 - p).ln() + p.ln();
        assert_relative_eq!(ll[0], expected, max_relative = 1e-12);
    }

    #[test]
    fn saturated_occupancy_gives_finite_gradients() {
        let cells = CellIndex::new(&[0, 0, 1, 1], 2).unwrap();
        let mut ws = KernelWorkspace::new(&cells);
        for &eta in &[-60.0, -20.0, 20.0, 60.0] {
            let total = ws.evaluate(
                array![eta, eta].view(),
                array![-40.0, 40.0, -40.0, 40.0].view(),
                array![1.0, 1.0, 0.0, 1.0].view(),
                &cells,
                true,
            );
            assert!(total.is_finite() || total == f64::NEG_INFINITY);
            assert!(ws.env_grad().iter().all(|g| g.is_finite()));
            assert!(ws.obs_grad().iter().all(|g| g.is_finite()));
        }
    }

    fn total_ll(env: &Array1<f64>, obs: &Array1<f64>, m: &Array1<f64>, cells: &CellIndex) -> f64 {
        checklist_log_likelihood(env.view(), obs.view(), m.view(), cells).sum()
    }

    proptest! {
        #[test]
        fn all_non_detection_cells_match_closed_form(
            eta in -6.0f64..6.0,
            obs in proptest::collection::vec(-6.0f64..6.0, 1..6),
        ) {
            let n = obs.len();
            let cells = CellIndex::new(&vec![0; n], 1).unwrap();
            let obs = Array1::from(obs);
            let ll = checklist_log_likelihood(
                array![eta].view(), obs.view(), Array1::ones(n).view(), &cells,
            );
            let sum_log_miss: f64 = obs.iter().map(|&x| (1.0 - sigmoid(x)).ln()).sum();
            let expected = log_add_exp(sigmoid(eta).ln() + sum_log_miss, (1.0 - sigmoid(eta)).ln());
            prop_assert!((ll[0] - expected).abs() < 1e-9);
        }

        #[test]
        fn empty_cells_ignore_their_logit(eta in -50.0f64..50.0) {
            let cells = CellIndex::new(&[0, 2], 3).unwrap();
            let env = array![0.0, eta, 0.0];
            let obs = array![0.5, -0.5];
            let m = array![0.0, 1.0];
            let ll = checklist_log_likelihood(env.view(), obs.view(), m.view(), &cells);
            prop_assert_eq!(ll[1], 0.0);
        }

        #[test]
        fn gradient_matches_finite_differences(
            env in proptest::collection::vec(-3.0f64..3.0, 3),
            obs in proptest::collection::vec(-3.0f64..3.0, 5),
            m in proptest::collection::vec(0u8..2, 5),
        ) {
            let ids = [0, 0, 1, 1, 1];
            let cells = CellIndex::new(&ids, 3).unwrap();
            let env = Array1::from(env);
            let obs = Array1::from(obs);
            let m = Array1::from_iter(m.into_iter().map(f64::from));
            let mut ws = KernelWorkspace::new(&cells);
            ws.evaluate(env.view(), obs.view(), m.view(), &cells, true);
            let h = 1e-6;
            for c in 0..3 {
                let (mut up, mut dn) = (env.clone(), env.clone());
                up[c] += h;
                dn[c] -= h;
                let fd = (total_ll(&up, &obs, &m, &cells) - total_ll(&dn, &obs, &m, &cells))
                    / (2.0 * h);
                prop_assert!((fd - ws.env_grad()[c]).abs() < 1e-5);
            }
            for i in 0..5 {
                let (mut up, mut dn) = (obs.clone(), obs.clone());
                up[i] += h;
                dn[i] -= h;
                let fd = (total_ll(&env, &up, &m, &cells) - total_ll(&env, &dn, &m, &cells))
                    / (2.0 * h);
                prop_assert!((fd - ws.obs_grad()[i]).abs() < 1e-5);
            }
        }
    }
}
