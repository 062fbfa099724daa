//! Partial pooling in the hierarchical multi-species model.

mod common;

use common::{SpeciesTruth, simulate};
use occu::design::CovariateTable;
use occu::inference::{AdviOptions, ChainMethod, McmcOptions};
use occu::models::hierarchical::{OBS_COEF_PRIOR_MEANS, OBS_COEF_PRIOR_SDS, OBS_COEFS};
use occu::models::{ChecklistModel, MaxLikOccu, MultiSpeciesOccuAdvi, MultiSpeciesOccuMcmc};

fn spread(values: &[f64]) -> f64 {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

fn three_species() -> [SpeciesTruth; 3] {
    [
        SpeciesTruth {
            name: "kestrel",
            env_intercept: 0.5,
            env_slope: 0.8,
            obs_intercept: -0.2,
            obs_slope: 0.6,
        },
        SpeciesTruth {
            name: "merlin",
            env_intercept: -0.3,
            env_slope: -0.4,
            obs_intercept: 0.1,
            obs_slope: 0.4,
        },
        SpeciesTruth {
            name: "hobby",
            env_intercept: 0.0,
            env_slope: 0.2,
            obs_intercept: 0.0,
            obs_slope: 0.5,
        },
    ]
}

#[test]
fn detection_coefficients_are_pulled_together() {
    // Few visits per cell keep the per-species estimates noisy.
    let survey = simulate(150, 2, &three_species(), 21);

    let mut mle = MaxLikOccu::new("~ elevation", "~ effort");
    mle.fit(&survey.env, &survey.checklists, &survey.detections, &survey.cell_ids)
        .unwrap();
    let mle_slopes: Vec<f64> = mle.fits().unwrap().iter().map(|f| f.obs_coefs[1]).collect();

    let mut advi =
        MultiSpeciesOccuAdvi::new("~ elevation", "~ effort").with_options(AdviOptions {
            m: 30,
            n_draws: 400,
            ..AdviOptions::default()
        });
    advi.fit(&survey.env, &survey.checklists, &survey.detections, &survey.cell_ids)
        .unwrap();
    let draws = advi.draws().unwrap();

    let sds = draws.block(OBS_COEF_PRIOR_SDS).unwrap();
    assert_eq!(sds.ncols(), 2);
    assert!(sds.iter().all(|&v| v > 0.0 && v.is_finite()));

    // Columns are laid out `[K_obs, S]` row-major; row 1 is the effort slope.
    let obs = draws.block(OBS_COEFS).unwrap();
    let n_species = 3;
    let posterior_slopes: Vec<f64> = (0..n_species)
        .map(|s| obs.column(n_species + s).mean().unwrap_or(f64::NAN))
        .collect();

    assert!(
        spread(&posterior_slopes) <= spread(&mle_slopes) + 0.05,
        "posterior {posterior_slopes:?} vs point estimates {mle_slopes:?}"
    );

    // Each species lands between its own estimate and the pooled mean.
    let pooled = draws
        .block(OBS_COEF_PRIOR_MEANS)
        .unwrap()
        .column(1)
        .mean()
        .unwrap_or(f64::NAN);
    for (s, (&post, &own)) in posterior_slopes.iter().zip(&mle_slopes).enumerate() {
        let (lo, hi) = if own < pooled { (own, pooled) } else { (pooled, own) };
        assert!(
            post >= lo - 0.1 && post <= hi + 0.1,
            "species {s}: posterior {post} outside [{lo}, {hi}]"
        );
    }
    let diagnostics = advi.diagnostics().unwrap();
    assert_eq!(diagnostics.n_components, 30);
    assert_eq!(diagnostics.means.len(), draws.layout().dim());
    assert!(diagnostics.elbo.is_finite());
}

#[test]
fn environment_slopes_exclude_the_intercept() {
    let survey = simulate(60, 2, &three_species(), 4);
    let mut advi =
        MultiSpeciesOccuAdvi::new("~ elevation", "~ effort").with_options(AdviOptions {
            m: 3,
            n_draws: 20,
            max_iter: 30,
            ..AdviOptions::default()
        });
    advi.fit(&survey.env, &survey.checklists, &survey.detections, &survey.cell_ids)
        .unwrap();
    let layout = advi.draws().unwrap().layout().clone();
    assert_eq!(layout.require("env_intercepts").unwrap().shape(), &[3]);
    assert_eq!(layout.require("env_slopes").unwrap().shape(), &[1, 3]);
    assert_eq!(layout.require("obs_coefs").unwrap().shape(), &[2, 3]);
}

#[test]
fn sampled_population_scales_stay_positive() {
    let survey = simulate(150, 2, &three_species(), 21);
    let mut mcmc =
        MultiSpeciesOccuMcmc::new("~ elevation", "~ effort").with_options(McmcOptions {
            n_draws: 60,
            n_tune: 60,
            n_chains: 2,
            chain_method: ChainMethod::Sequential,
            seed: 3,
            ..McmcOptions::default()
        });
    mcmc.fit(&survey.env, &survey.checklists, &survey.detections, &survey.cell_ids)
        .unwrap();
    let draws = mcmc.draws().unwrap();
    assert_eq!(draws.n_draws(), 120);
    let sds = draws.block(OBS_COEF_PRIOR_SDS).unwrap();
    assert_eq!(sds.ncols(), 2);
    assert!(sds.iter().all(|&v| v > 0.0 && v.is_finite()));
}

#[test]
fn posterior_detection_rises_with_effort() {
    let truth = SpeciesTruth {
        name: "whinchat",
        env_intercept: 0.4,
        env_slope: 0.0,
        obs_intercept: -0.2,
        obs_slope: 1.0,
    };
    let survey = simulate(400, 4, &[truth], 19);
    let mut advi =
        MultiSpeciesOccuAdvi::new("~ elevation", "~ effort").with_options(AdviOptions {
            m: 10,
            n_draws: 200,
            ..AdviOptions::default()
        });
    advi.fit(&survey.env, &survey.checklists, &survey.detections, &survey.cell_ids)
        .unwrap();
    // `[K_obs, S]` with one species: column 1 is the effort slope.
    let slopes = advi.draws().unwrap().block(OBS_COEFS).unwrap();
    assert!(slopes.column(1).iter().all(|&b| b > 0.0));

    let env = CovariateTable::with_rows(7)
        .with_numeric("elevation", vec![0.5; 7])
        .unwrap();
    let checklists = CovariateTable::with_rows(7)
        .with_numeric("effort", vec![-3.0, -2.0, -1.0, 0.0, 1.0, 2.0, 3.0])
        .unwrap();
    let joint = advi
        .predict_marginal_probabilities_obs(&env, &checklists)
        .unwrap();
    let column = joint.species_column("whinchat").unwrap();
    assert!(column.windows(2).into_iter().all(|w| w[0] <= w[1]));
}
