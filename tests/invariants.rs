//! Randomized invariant checks over generated ensembles and claims.
//! Seeds are fixed so failures reproduce.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use claimscore::claims::{validate, BatchProcessor, ClaimsTable};
use claimscore::financial::{aggregate, histogram, EnrichedResult};
use claimscore::layout::LayoutEngine;
use claimscore::trace::{sigmoid, ClaimRecord, RiskThresholds, Scalar, TraceEngine};
use claimscore::tree::{ComponentTree, Ensemble, TreeNode, TreeType};

const FEATURES: [&str; 4] = ["Age", "Vehicle Value", "Prior Claims", "Region"];

fn random_condition(rng: &mut StdRng) -> String {
    match rng.gen_range(0..5) {
        0 => format!("Age < {}", rng.gen_range(18..80)),
        1 => format!("Vehicle Value >= {}", rng.gen_range(1..50) * 1000),
        2 => format!("Prior Claims > {}", rng.gen_range(0..4)),
        3 => "Region in [North, East]".to_string(),
        _ => "Region != South".to_string(),
    }
}

fn random_tree(rng: &mut StdRng, depth: usize) -> TreeNode {
    if depth == 0 || rng.gen_bool(0.25) {
        let value = rng.gen_range(-200..=200) as f64 / 100.0;
        return TreeNode::leaf(value);
    }
    let condition = random_condition(rng);
    let t = random_tree(rng, depth - 1);
    let f = random_tree(rng, depth - 1);
    TreeNode::decision(&condition, t, f)
}

fn random_ensemble(rng: &mut StdRng) -> Ensemble {
    let count = rng.gen_range(1..6);
    let trees = (0..count)
        .map(|i| ComponentTree::new(&format!("tree {}", i), random_tree(rng, 5)))
        .collect();
    Ensemble::new("generated", TreeType::Medical, trees)
}

fn random_cell(rng: &mut StdRng, feature: &str) -> Scalar {
    if rng.gen_bool(0.1) {
        return Scalar::Null;
    }
    match feature {
        "Region" => {
            let regions = ["North", "South", "East", "West"];
            Scalar::Text(regions[rng.gen_range(0..regions.len())].to_string())
        }
        "Age" => Scalar::Text(rng.gen_range(16..90).to_string()),
        "Vehicle Value" => Scalar::Text(format!("{}", rng.gen_range(500..60_000))),
        _ => Scalar::Text(rng.gen_range(0..6).to_string()),
    }
}

fn random_table(rng: &mut StdRng, rows: usize) -> ClaimsTable {
    let mut columns = vec!["Claim No".to_string()];
    columns.extend(FEATURES.iter().map(|f| f.to_string()));
    let rows = (0..rows)
        .map(|i| {
            let mut row = vec![Scalar::Text(format!("C-{}", i))];
            row.extend(FEATURES.iter().map(|f| random_cell(rng, f)));
            row
        })
        .collect();
    ClaimsTable::new(columns, rows)
}

#[test]
fn trace_results_are_consistent() {
    let mut rng = StdRng::seed_from_u64(7);
    let engine = TraceEngine::default();
    for _ in 0..50 {
        let ensemble = random_ensemble(&mut rng);
        let mut record = ClaimRecord::new("C-1");
        for f in FEATURES {
            record = record.with(f, random_cell(&mut rng, f));
        }

        let first = engine.evaluate(&ensemble, &record).unwrap();
        let again = engine.evaluate(&ensemble, &record).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&again).unwrap()
        );

        let sum: f64 = first.paths.iter().map(|p| p.leaf_value).sum();
        assert_eq!(first.total_score, sum);
        assert_eq!(first.paths.len(), ensemble.trees.len());
        assert!((0.0..=1.0).contains(&first.probability));
        assert_eq!(first.risk_level, engine.thresholds.classify(first.probability));
        for (i, p) in first.paths.iter().enumerate() {
            assert_eq!(p.tree_index, i);
            assert_eq!(p.node_path.first(), Some(&0));
        }
    }
}

#[test]
fn probability_is_monotone_in_score() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut scores: Vec<f64> = (0..500).map(|_| rng.gen_range(-40.0..40.0)).collect();
    scores.extend([-1000.0, 1000.0, 0.0]);
    scores.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let thresholds = RiskThresholds::default();
    let mut last_p = 0.0;
    let mut last_tier = thresholds.classify(0.0);
    for s in scores {
        let p = sigmoid(s);
        assert!((0.0..=1.0).contains(&p));
        assert!(p >= last_p);
        let tier = thresholds.classify(p);
        assert!(tier >= last_tier);
        last_p = p;
        last_tier = tier;
    }
}

#[test]
fn parallel_batches_match_sequential() {
    let mut rng = StdRng::seed_from_u64(23);
    for rows in [0, 1, 7, 64, 131] {
        let ensemble = random_ensemble(&mut rng);
        let table = random_table(&mut rng, rows);
        let validation = validate(&ensemble, &table, Some("Claim No")).unwrap();
        assert!(validation.is_valid);

        let processor = BatchProcessor::new(TraceEngine::default());
        let seq = processor.process(&ensemble, &table, &validation).unwrap();
        let par = processor
            .with_workers(4)
            .process_parallel(&ensemble, &table, &validation)
            .unwrap();
        assert_eq!(seq, par);
        assert_eq!(seq.results.len(), rows);
    }
}

#[test]
fn layouts_have_expected_shape() {
    let mut rng = StdRng::seed_from_u64(31);
    let engine = LayoutEngine::default();
    for _ in 0..30 {
        let ensemble = random_ensemble(&mut rng);
        let cols = rng.gen_range(1..4);
        let graph = engine.layout_ensemble_grid(&ensemble.trees, cols);

        let nodes: usize = ensemble.trees.iter().map(|t| t.root.node_count()).sum();
        let leaves: usize = ensemble.trees.iter().map(|t| t.root.leaf_count()).sum();
        assert_eq!(graph.nodes.len(), nodes);
        assert_eq!(graph.edges.len(), (nodes - leaves) * 2);

        let ids: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids.len(), nodes);
        for e in &graph.edges {
            assert!(ids.contains(e.source.as_str()));
            assert!(ids.contains(e.target.as_str()));
        }

        // Identical layout on repeat.
        assert_eq!(graph, engine.layout_ensemble_grid(&ensemble.trees, cols));
    }
}

#[test]
fn histogram_places_each_amount_once() {
    let mut rng = StdRng::seed_from_u64(43);
    for _ in 0..40 {
        let n = rng.gen_range(1..200);
        let amounts: Vec<f64> = (0..n)
            .map(|_| rng.gen_range(0..1_000_000) as f64 / 100.0)
            .collect();
        let bins_n = rng.gen_range(1..20);
        let bins = histogram(&amounts, bins_n);
        assert_eq!(bins.len(), bins_n);
        assert_eq!(bins.iter().map(|b| b.count).sum::<usize>(), amounts.len());
        let max = amounts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(bins[bins_n - 1].max_value, max);
    }
}

#[test]
fn tier_counts_cover_contributing_rows() {
    let mut rng = StdRng::seed_from_u64(59);
    let ensemble = random_ensemble(&mut rng);
    let table = random_table(&mut rng, 120);
    let validation = validate(&ensemble, &table, Some("Claim No")).unwrap();
    let outcome = BatchProcessor::new(TraceEngine::default())
        .process(&ensemble, &table, &validation)
        .unwrap();

    let enriched: Vec<EnrichedResult> = outcome
        .results
        .into_iter()
        .map(|trace| {
            let estimated_amount = match rng.gen_range(0..4) {
                0 => None,
                1 => Some(-5.0),
                _ => Some(rng.gen_range(100..50_000) as f64),
            };
            EnrichedResult { trace, estimated_amount }
        })
        .collect();
    let valid = enriched
        .iter()
        .filter(|e| matches!(e.estimated_amount, Some(a) if a >= 0.0))
        .count();

    let m = aggregate(&enriched, 10);
    assert_eq!(m.claim_count, valid);
    assert_eq!(m.excluded_count, enriched.len() - valid);
    assert_eq!(m.by_risk.low.count + m.by_risk.moderate.count + m.by_risk.high.count, valid);
}
