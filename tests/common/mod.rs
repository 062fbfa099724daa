//! Synthetic checklist surveys with known occupancy and detection.

#![allow(dead_code)]

use ndarray::Array2;
use occu::design::{CovariateTable, DetectionTable};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// True coefficients of one simulated species.
#[derive(Debug, Clone, Copy)]
pub struct SpeciesTruth {
    pub name: &'static str,
    pub env_intercept: f64,
    pub env_slope: f64,
    pub obs_intercept: f64,
    pub obs_slope: f64,
}

impl SpeciesTruth {
    /// Constant occupancy `psi` and detection `p`.
    pub fn constant(name: &'static str, psi: f64, p: f64) -> Self {
        Self {
            name,
            env_intercept: logit(psi),
            env_slope: 0.0,
            obs_intercept: logit(p),
            obs_slope: 0.0,
        }
    }
}

pub struct Survey {
    /// One row per cell, numeric column `elevation`.
    pub env: CovariateTable,
    /// One row per checklist, numeric column `effort`.
    pub checklists: CovariateTable,
    pub detections: DetectionTable,
    pub cell_ids: Vec<usize>,
    /// Latent occupancy, `[cell, species]`.
    pub occupied: Array2<bool>,
}

impl Survey {
    /// Environment rows repeated so row `i` pairs with checklist `i`.
    pub fn env_per_checklist(&self) -> CovariateTable {
        self.env.select_rows(&self.cell_ids).unwrap()
    }
}

pub fn simulate(
    n_cells: usize,
    visits_per_cell: usize,
    species: &[SpeciesTruth],
    seed: u64,
) -> Survey {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();

    let elevation: Vec<f64> = (0..n_cells).map(|_| rng.sample(normal)).collect();
    let cell_ids: Vec<usize> = (0..n_cells)
        .flat_map(|c| std::iter::repeat_n(c, visits_per_cell))
        .collect();
    let effort: Vec<f64> = (0..cell_ids.len()).map(|_| rng.sample(normal)).collect();

    let mut occupied = Array2::from_elem((n_cells, species.len()), false);
    for (s, truth) in species.iter().enumerate() {
        for c in 0..n_cells {
            let psi = sigmoid(truth.env_intercept + truth.env_slope * elevation[c]);
            occupied[[c, s]] = rng.gen_bool(psi);
        }
    }
    let mut y = Array2::zeros((cell_ids.len(), species.len()));
    for (s, truth) in species.iter().enumerate() {
        for (i, &c) in cell_ids.iter().enumerate() {
            let p = sigmoid(truth.obs_intercept + truth.obs_slope * effort[i]);
            if occupied[[c, s]] && rng.gen_bool(p) {
                y[[i, s]] = 1.0;
            }
        }
    }

    Survey {
        env: CovariateTable::with_rows(n_cells)
            .with_numeric("elevation", elevation)
            .unwrap(),
        checklists: CovariateTable::with_rows(cell_ids.len())
            .with_numeric("effort", effort)
            .unwrap(),
        detections: DetectionTable::new(species.iter().map(|s| s.name.to_string()).collect(), y)
            .unwrap(),
        cell_ids,
        occupied,
    }
}
