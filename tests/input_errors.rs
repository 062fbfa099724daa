//! Malformed inputs fail before any fitting work starts.

mod common;

use common::{SpeciesTruth, simulate};
use ndarray::array;
use occu::OccuError;
use occu::design::{CovariateTable, DesignError, DetectionTable};
use occu::models::{ChecklistModel, MaxLikOccu, MultiSpeciesOccuMcmc};

fn survey() -> common::Survey {
    simulate(20, 2, &[SpeciesTruth::constant("rail", 0.5, 0.5)], 1)
}

#[test]
fn cell_ids_must_cover_every_checklist_and_stay_in_range() {
    let s = survey();
    let mut model = MaxLikOccu::new("~ 1", "~ 1");
    assert!(matches!(
        model.fit(&s.env, &s.checklists, &s.detections, &s.cell_ids[1..]),
        Err(OccuError::ShapeMismatch { .. })
    ));

    let mut bad_ids = s.cell_ids.clone();
    bad_ids[5] = 20;
    assert!(matches!(
        model.fit(&s.env, &s.checklists, &s.detections, &bad_ids),
        Err(OccuError::CellIdOutOfRange {
            checklist: 5,
            cell_id: 20,
            n_cells: 20
        })
    ));
}

#[test]
fn detection_rows_must_match_checklists() {
    let s = survey();
    let short = DetectionTable::new(vec!["rail".into()], array![[0.0], [1.0]]).unwrap();
    let mut model = MultiSpeciesOccuMcmc::new("~ 1", "~ 1");
    assert!(matches!(
        model.fit(&s.env, &s.checklists, &short, &s.cell_ids),
        Err(OccuError::ShapeMismatch { .. })
    ));
}

#[test]
fn detections_must_be_binary() {
    assert!(matches!(
        DetectionTable::new(vec!["rail".into()], array![[0.0], [2.0]]),
        Err(OccuError::InvalidDetection { checklist: 1, .. })
    ));
    assert!(matches!(
        DetectionTable::new(vec!["rail".into(), "rail".into()], array![[0.0, 1.0]]),
        Err(OccuError::InvalidSpecies(_))
    ));
}

#[test]
fn prediction_tables_must_pair_rows() {
    let s = survey();
    let mut model = MaxLikOccu::new("~ elevation", "~ effort");
    model
        .fit(&s.env, &s.checklists, &s.detections, &s.cell_ids)
        .unwrap();
    assert!(matches!(
        model.predict_marginal_probabilities_obs(&s.env, &s.checklists),
        Err(OccuError::ShapeMismatch { .. })
    ));
}

#[test]
fn unseen_levels_are_reported_at_prediction() {
    let s = survey();
    let habitat: Vec<&str> = (0..20).map(|c| if c % 2 == 0 { "forest" } else { "marsh" }).collect();
    let env = s.env.clone().with_categorical("habitat", habitat).unwrap();
    let mut model = MaxLikOccu::new("~ habitat", "~ 1");
    model
        .fit(&env, &s.checklists, &s.detections, &s.cell_ids)
        .unwrap();

    let new_sites = CovariateTable::with_rows(1)
        .with_categorical("habitat", ["desert"])
        .unwrap();
    match model.predict_marginal_probabilities_direct(&new_sites) {
        Err(OccuError::Design(DesignError::UnknownLevel { column, level })) => {
            assert_eq!(column, "habitat");
            assert_eq!(level, "desert");
        }
        other => panic!("expected an unknown-level error, got {other:?}"),
    }
}

#[test]
fn predicting_before_fitting_fails() {
    let s = survey();
    let model = MaxLikOccu::new("~ 1", "~ 1");
    assert!(matches!(
        model.predict_marginal_probabilities_direct(&s.env),
        Err(OccuError::NotFitted)
    ));
}
