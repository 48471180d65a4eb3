use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::json;

use claimscore::claims::{validate, BatchProcessor, ClaimsTable};
use claimscore::config::Config;
use claimscore::layout::{highlight_trace, LayoutEngine};
use claimscore::logging::{log, obj, v_num, v_str, Domain, Level};
use claimscore::tree::Ensemble;

const USAGE: &str = "usage: layout_ensemble [--tree <index>] <ensemble.json> \
                     [<claims.csv> <claim-number-column> <claim-number>]";

/// Prints the grid layout of an ensemble, or of one component tree with
/// `--tree`. With a claims file, claim-number column and claim number, the
/// layout also carries that claim's highlighted path.
fn main() -> Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let mut tree_index = None;
    if let Some(pos) = args.iter().position(|a| a == "--tree") {
        let Some(raw) = args.get(pos + 1) else {
            bail!(USAGE);
        };
        let index: usize = raw.parse().with_context(|| format!("bad tree index '{}'", raw))?;
        tree_index = Some(index);
        args.drain(pos..pos + 2);
    }
    let Some(ensemble_path) = args.first().map(PathBuf::from) else {
        bail!(USAGE);
    };

    let cfg = Config::from_env();
    let ensemble = Ensemble::from_json_path(&ensemble_path)
        .with_context(|| format!("loading ensemble {}", ensemble_path.display()))?;
    let engine = LayoutEngine::new(cfg.layout);
    let mut graph = match tree_index {
        Some(i) => match engine.layout_component(&ensemble, i) {
            Some(g) => g,
            None => bail!("ensemble has {} trees; no tree {}", ensemble.trees.len(), i),
        },
        None => engine.layout_ensemble(&ensemble),
    };

    let mut trace = None;
    if let [_, claims, column, claim, ..] = args.as_slice() {
        let table = ClaimsTable::from_csv_path(&PathBuf::from(claims))
            .with_context(|| format!("loading claims {}", claims))?;
        let validation = validate(&ensemble, &table, Some(column.as_str()))?;
        let outcome = BatchProcessor::from_config(&cfg).process(&ensemble, &table, &validation)?;
        let Some(result) = outcome.results.into_iter().find(|r| &r.claim_number == claim) else {
            bail!("claim '{}' not found in {}", claim, claims);
        };
        highlight_trace(&mut graph, &result);
        trace = Some(result);
    }

    log(
        Level::Info,
        Domain::Layout,
        "layout_written",
        obj(&[
            ("ensemble", v_str(&ensemble.name)),
            ("nodes", v_num(graph.nodes.len() as f64)),
            ("edges", v_num(graph.edges.len() as f64)),
        ]),
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ensemble": ensemble.summary(),
            "graph": graph,
            "trace": trace,
        }))?
    );
    Ok(())
}
