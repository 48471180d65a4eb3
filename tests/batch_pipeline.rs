//! End-to-end: ensemble JSON and claims CSV on disk, through validation,
//! batch scoring, financial roll-up and layout highlighting.

use std::fs;
use std::path::PathBuf;

use claimscore::claims::{dataset_manifest, file_sha256, validate, BatchProcessor, ClaimsTable};
use claimscore::financial::{aggregate, enrich_with_amounts};
use claimscore::layout::{highlight_trace, LayoutEngine};
use claimscore::trace::{FaultKind, RiskLevel, TraceEngine};
use claimscore::tree::{Ensemble, TreeType};

const ENSEMBLE_JSON: &str = r#"{
  "id": "motor-2024-01",
  "name": "Motor fraud v1",
  "treeType": "motor",
  "createdAt": "2024-01-15T10:00:00Z",
  "structure": [
    {
      "title": "Driver age",
      "root": {
        "condition": "Driver Age < 25",
        "true_branch": { "value": 1.5 },
        "false_branch": {
          "condition": "Region in [North, East]",
          "true_branch": { "value": 0.25 },
          "false_branch": { "value": -1.25 }
        }
      }
    },
    {
      "title": "Repair cost",
      "root": {
        "condition": "Repair Cost > 5000",
        "true_branch": { "value": 1.0 },
        "false_branch": { "value": -0.5 }
      }
    }
  ]
}"#;

const CLAIMS_CSV: &str = "Claim No,Driver Age,Region,Repair Cost,Estimated Amount
C-100,21,North,8000,\"$12,500\"
C-101,45,West,1200,900
C-102,38,East,6000,$4000
C-103,,South,300,pending
C-104,52,West,abc,2500
";

fn write_inputs(dir: &tempfile::TempDir) -> (PathBuf, PathBuf) {
    let ensemble = dir.path().join("ensemble.json");
    let claims = dir.path().join("claims.csv");
    fs::write(&ensemble, ENSEMBLE_JSON).unwrap();
    fs::write(&claims, CLAIMS_CSV).unwrap();
    (ensemble, claims)
}

#[test]
fn pipeline_scores_every_row_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (ensemble_path, claims_path) = write_inputs(&dir);

    let ensemble = Ensemble::from_json_path(&ensemble_path).unwrap();
    assert_eq!(ensemble.tree_type, TreeType::Motor);
    assert_eq!(ensemble.trees.len(), 2);
    assert!(ensemble.created_at.is_some());

    let table = ClaimsTable::from_csv_path(&claims_path).unwrap();
    let validation = validate(&ensemble, &table, Some("Claim No")).unwrap();
    assert!(validation.is_valid, "{:?}", validation);
    assert!(validation.required_columns.contains("Region"));

    let outcome = BatchProcessor::new(TraceEngine::default())
        .process(&ensemble, &table, &validation)
        .unwrap();
    let claims: Vec<&str> = outcome.results.iter().map(|r| r.claim_number.as_str()).collect();
    assert_eq!(claims, vec!["C-100", "C-101", "C-102", "C-103", "C-104"]);

    let c100 = &outcome.results[0];
    assert_eq!(c100.total_score, 1.5 + 1.0);
    assert_eq!(c100.risk_level, RiskLevel::High);

    let c101 = &outcome.results[1];
    assert_eq!(c101.total_score, -1.25 + -0.5);
    assert_eq!(c101.risk_level, RiskLevel::Low);

    let c102 = &outcome.results[2];
    assert_eq!(c102.paths[0].leaf_value, 0.25);
    assert_eq!(c102.paths[1].leaf_value, 1.0);

    for r in &outcome.results {
        let sum: f64 = r.paths.iter().map(|p| p.leaf_value).sum();
        assert_eq!(r.total_score, sum);
        assert!((0.0..=1.0).contains(&r.probability));
    }

    // C-103 has no age; C-104 has a non-numeric repair cost.
    let kinds: Vec<(usize, &str, FaultKind)> =
        outcome.faults.iter().map(|f| (f.row, f.column.as_str(), f.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            (3, "Driver Age", FaultKind::MissingValue),
            (4, "Repair Cost", FaultKind::UncoercibleValue),
        ]
    );
}

#[test]
fn pipeline_rolls_up_amounts_and_highlights_a_claim() {
    let dir = tempfile::tempdir().unwrap();
    let (ensemble_path, claims_path) = write_inputs(&dir);
    let ensemble = Ensemble::from_json_path(&ensemble_path).unwrap();
    let table = ClaimsTable::from_csv_path(&claims_path).unwrap();
    let validation = validate(&ensemble, &table, Some("Claim No")).unwrap();
    let outcome = BatchProcessor::new(TraceEngine::default())
        .with_workers(3)
        .process_parallel(&ensemble, &table, &validation)
        .unwrap();

    let enriched = enrich_with_amounts(&outcome.results, &table, "Estimated Amount").unwrap();
    let amounts: Vec<Option<f64>> = enriched.iter().map(|e| e.estimated_amount).collect();
    assert_eq!(amounts, vec![Some(12500.0), Some(900.0), Some(4000.0), None, Some(2500.0)]);

    let metrics = aggregate(&enriched, 10);
    assert_eq!(metrics.claim_count, 4);
    assert_eq!(metrics.excluded_count, 1);
    assert_eq!(metrics.total_value, 12500.0 + 900.0 + 4000.0 + 2500.0);
    let tiers = &metrics.by_risk;
    assert_eq!(tiers.low.count + tiers.moderate.count + tiers.high.count, 4);
    assert_eq!(metrics.price_distribution.high.len(), 10);
    assert_eq!(metrics.price_distribution.low.len(), 10);

    let mut graph = LayoutEngine::default().layout_ensemble(&ensemble);
    highlight_trace(&mut graph, &outcome.results[1]);
    let lit: Vec<&str> = graph
        .nodes
        .iter()
        .filter(|n| n.highlighted)
        .map(|n| n.id.as_str())
        .collect();
    assert_eq!(
        lit,
        vec!["tree-0-node-0", "tree-0-node-2", "tree-0-node-4", "tree-1-node-0", "tree-1-node-2"]
    );
}

#[test]
fn missing_column_blocks_processing() {
    let ensemble = Ensemble::from_json_str("inline", ENSEMBLE_JSON).unwrap();
    let table =
        ClaimsTable::from_csv_str("inline", "Claim No,Driver Age,Region\nC-1,30,North\n").unwrap();

    let validation = validate(&ensemble, &table, None).unwrap();
    assert!(!validation.is_valid);
    assert_eq!(validation.missing_columns.iter().collect::<Vec<_>>(), vec!["Repair Cost"]);
    assert_eq!(validation.claim_number_column, None);

    let err = BatchProcessor::new(TraceEngine::default())
        .process(&ensemble, &table, &validation)
        .unwrap_err();
    assert_eq!(err.kind(), "precondition");
}

#[test]
fn manifest_hashes_the_file_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let (_, claims_path) = write_inputs(&dir);
    let manifest = dataset_manifest(&claims_path).unwrap();
    assert_eq!(manifest.row_count, 5);
    assert_eq!(manifest.hash_sha256, file_sha256(&claims_path).unwrap());
    assert_eq!(manifest.hash_sha256.len(), 64);

    fs::write(&claims_path, CLAIMS_CSV.replace("C-104", "C-105")).unwrap();
    assert_ne!(file_sha256(&claims_path).unwrap(), manifest.hash_sha256);
}

#[test]
fn malformed_ensemble_is_a_load_error() {
    let err = Ensemble::from_json_str("broken.json", "{\"name\": \"x\"").unwrap_err();
    assert_eq!(err.kind(), "load");
    assert!(err.to_string().contains("broken.json"));
}
