use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::json;

use claimscore::claims::{dataset_manifest, validate, BatchProcessor, ClaimsTable};
use claimscore::config::Config;
use claimscore::financial::{aggregate, enrich_with_amounts};
use claimscore::logging::{log, obj, run_id, v_num, v_str, Domain, Level, ProfileScope};
use claimscore::tree::Ensemble;

const USAGE: &str =
    "usage: claimscore <ensemble.json> <claims.csv> <claim-number-column> [amount-column]";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.len() < 3 {
        bail!(USAGE);
    }
    let ensemble_path = PathBuf::from(&args[0]);
    let claims_path = PathBuf::from(&args[1]);
    let claim_column = args[2].as_str();
    let amount_column = args.get(3).map(String::as_str);

    let cfg = Config::from_env();
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("ensemble_path", v_str(&ensemble_path.display().to_string())),
            ("claims_path", v_str(&claims_path.display().to_string())),
            ("workers", v_num(cfg.workers as f64)),
            ("moderate_at", v_num(cfg.thresholds.moderate_at)),
            ("high_at", v_num(cfg.thresholds.high_at)),
        ]),
    );
    let profile = ProfileScope::new("claimscore.main");

    let ensemble = Ensemble::from_json_path(&ensemble_path)
        .with_context(|| format!("loading ensemble {}", ensemble_path.display()))?;
    let table = ClaimsTable::from_csv_path(&claims_path)
        .with_context(|| format!("loading claims {}", claims_path.display()))?;
    let manifest = dataset_manifest(&claims_path).context("hashing claims dataset")?;

    let validation = validate(&ensemble, &table, Some(claim_column)).context("validating dataset")?;
    if !validation.is_valid {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "runId": run_id(),
                "dataset": manifest,
                "validation": validation,
            }))?
        );
        bail!("dataset is missing columns: {:?}", validation.missing_columns);
    }

    let processor = BatchProcessor::from_config(&cfg);
    let outcome = if processor.workers > 1 {
        processor.process_parallel(&ensemble, &table, &validation)?
    } else {
        processor.process(&ensemble, &table, &validation)?
    };

    let metrics = match amount_column {
        Some(col) => {
            let enriched =
                enrich_with_amounts(&outcome.results, &table, col).context("joining amounts")?;
            Some(aggregate(&enriched, cfg.histogram_bins))
        }
        None => None,
    };

    let report = json!({
        "runId": run_id(),
        "ensemble": ensemble.summary(),
        "dataset": manifest,
        "validation": validation,
        "results": outcome.results,
        "faults": outcome.faults,
        "financialMetrics": metrics,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    log(
        Level::Info,
        Domain::System,
        "report_written",
        obj(&[
            ("ensemble", v_str(&ensemble.name)),
            ("rows", v_num(outcome.results.len() as f64)),
            ("faults", v_num(outcome.faults.len() as f64)),
            ("elapsed_ms", v_num(profile.elapsed_ms())),
        ]),
    );
    Ok(())
}
