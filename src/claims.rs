//! Claims tables and batch scoring.
//!
//! A batch run is two steps: [`validate`] compares the columns an ensemble
//! needs against the table's header, then [`BatchProcessor::process`] scores
//! every row. Row-level data problems are collected as [`RowFault`]s; only
//! configuration and precondition failures stop a batch.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Read;
use std::ops::Range;
use std::path::Path;
use std::thread;

use crate::config::Config;
use crate::error::ScoringError;
use crate::logging::{
    log, log_batch_summary, log_row_fault, obj, ts_now, v_num, v_str, Domain, Level, ProfileScope,
};
use crate::trace::{ClaimRecord, FaultKind, Scalar, TraceEngine, TraceResult};
use crate::tree::{compile, CompiledEnsemble, Ensemble};

// =============================================================================
// Claims table
// =============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClaimsTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
}

impl ClaimsTable {
    /// Rows shorter than the header are padded with nulls.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Scalar>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut r| {
                if r.len() < width {
                    r.resize(width, Scalar::Null);
                }
                r
            })
            .collect();
        Self { columns, rows }
    }

    /// Header line first; blank lines and `#` comments are skipped. Fields may
    /// be double-quoted with `""` as an escaped quote; quoted fields cannot
    /// span lines.
    pub fn from_csv_str(source: &str, text: &str) -> Result<Self, ScoringError> {
        let mut columns: Option<Vec<String>> = None;
        let mut rows = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let cells = split_csv_line(line).ok_or_else(|| {
                ScoringError::load(source, format!("line {}: unterminated quote", line_no + 1))
            })?;
            match &columns {
                None => {
                    let header = cells
                        .iter()
                        .map(|c| c.trim().trim_start_matches('\u{feff}').to_string())
                        .collect();
                    columns = Some(header);
                }
                Some(header) => {
                    if cells.len() > header.len() {
                        return Err(ScoringError::load(
                            source,
                            format!(
                                "line {}: expected {} columns, got {}",
                                line_no + 1,
                                header.len(),
                                cells.len()
                            ),
                        ));
                    }
                    rows.push(cells.iter().map(|c| Scalar::from_cell(c)).collect());
                }
            }
        }
        let columns = columns.ok_or_else(|| ScoringError::load(source, "missing header"))?;
        Ok(Self::new(columns, rows))
    }

    pub fn from_csv_path(path: &Path) -> Result<Self, ScoringError> {
        let source = path.display().to_string();
        let text =
            fs::read_to_string(path).map_err(|e| ScoringError::load(&source, e.to_string()))?;
        Self::from_csv_str(&source, &text)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn cell(&self, row: usize, col: usize) -> &Scalar {
        self.rows[row].get(col).unwrap_or(&Scalar::Null)
    }
}

fn split_csv_line(line: &str) -> Option<Vec<String>> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else {
            match c {
                '"' if current.trim().is_empty() => {
                    current.clear();
                    in_quotes = true;
                }
                ',' => cells.push(std::mem::take(&mut current)),
                '\r' => {}
                _ => current.push(c),
            }
        }
    }
    if in_quotes {
        return None;
    }
    cells.push(current);
    Some(cells)
}

// =============================================================================
// Dataset manifest
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetManifest {
    pub path: String,
    pub hash_sha256: String,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub generated_at: String,
}

pub fn file_sha256(path: &Path) -> Result<String, ScoringError> {
    let source = path.display().to_string();
    let mut file = File::open(path).map_err(|e| ScoringError::load(&source, e.to_string()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(|e| ScoringError::load(&source, e.to_string()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn dataset_manifest(path: &Path) -> Result<DatasetManifest, ScoringError> {
    let table = ClaimsTable::from_csv_path(path)?;
    Ok(DatasetManifest {
        path: path.display().to_string(),
        hash_sha256: file_sha256(path)?,
        row_count: table.len(),
        columns: table.columns,
        generated_at: ts_now(),
    })
}

// =============================================================================
// Validation
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub required_columns: BTreeSet<String>,
    pub available_columns: BTreeSet<String>,
    pub missing_columns: BTreeSet<String>,
    pub claim_number_column: Option<String>,
    pub is_valid: bool,
}

/// Exact, case- and punctuation-sensitive column check. The table is not touched.
pub fn validate(
    ensemble: &Ensemble,
    table: &ClaimsTable,
    claim_number_column: Option<&str>,
) -> Result<ValidationResult, ScoringError> {
    let compiled = compile(ensemble)?;
    Ok(validate_compiled(&compiled, table, claim_number_column))
}

pub fn validate_compiled(
    compiled: &CompiledEnsemble,
    table: &ClaimsTable,
    claim_number_column: Option<&str>,
) -> ValidationResult {
    let claim_number_column = claim_number_column.filter(|c| !c.is_empty()).map(str::to_string);
    let mut required = compiled.features();
    if let Some(col) = &claim_number_column {
        required.insert(col.clone());
    }
    let available: BTreeSet<String> = table.columns.iter().cloned().collect();
    let missing: BTreeSet<String> = required.difference(&available).cloned().collect();
    let is_valid = missing.is_empty() && claim_number_column.is_some();

    log(
        Level::Info,
        Domain::Batch,
        "validation",
        obj(&[
            ("ensemble", v_str(&compiled.name)),
            ("required", v_num(required.len() as f64)),
            ("missing", serde_json::json!(missing)),
            (
                "claim_number_column",
                claim_number_column.as_deref().map(v_str).unwrap_or(serde_json::Value::Null),
            ),
            ("is_valid", serde_json::json!(is_valid)),
        ]),
    );

    ValidationResult {
        required_columns: required,
        available_columns: available,
        missing_columns: missing,
        claim_number_column,
        is_valid,
    }
}

// =============================================================================
// Batch processing
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowFault {
    /// Zero-based data row index.
    pub row: usize,
    pub claim_number: String,
    pub column: String,
    pub kind: FaultKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub results: Vec<TraceResult>,
    pub faults: Vec<RowFault>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchProcessor {
    pub engine: TraceEngine,
    pub workers: usize,
}

struct Prepared {
    compiled: CompiledEnsemble,
    claim_col: usize,
    feature_cols: Vec<(String, usize)>,
}

impl BatchProcessor {
    pub fn new(engine: TraceEngine) -> Self {
        Self { engine, workers: 1 }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self { engine: TraceEngine::from_config(cfg), workers: cfg.workers.max(1) }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    fn prepare(
        &self,
        ensemble: &Ensemble,
        table: &ClaimsTable,
        validation: &ValidationResult,
    ) -> Result<Prepared, ScoringError> {
        if !validation.is_valid {
            let detail = match &validation.claim_number_column {
                None => "no claim-number column chosen".to_string(),
                Some(_) => format!("missing columns {:?}", validation.missing_columns),
            };
            return Err(ScoringError::precondition(format!(
                "dataset failed validation: {}",
                detail
            )));
        }
        let claim_name = validation
            .claim_number_column
            .as_deref()
            .ok_or_else(|| ScoringError::precondition("no claim-number column chosen"))?;
        let claim_col = table.column_index(claim_name).ok_or_else(|| {
            ScoringError::precondition(format!(
                "claim-number column '{}' not in table",
                claim_name
            ))
        })?;

        let compiled = compile(ensemble)?;
        let mut feature_cols = Vec::new();
        for feature in compiled.features() {
            let idx = table.column_index(&feature).ok_or_else(|| {
                ScoringError::precondition(format!(
                    "column '{}' not in table; validation is stale",
                    feature
                ))
            })?;
            feature_cols.push((feature, idx));
        }
        Ok(Prepared { compiled, claim_col, feature_cols })
    }

    /// Score every row in order on the calling thread.
    pub fn process(
        &self,
        ensemble: &Ensemble,
        table: &ClaimsTable,
        validation: &ValidationResult,
    ) -> Result<BatchOutcome, ScoringError> {
        let prepared = self.prepare(ensemble, table, validation)?;
        let scope =
            ProfileScope::with_context("batch.process", &[("ensemble", v_str(&ensemble.name))]);
        let outcome = self.score_rows(&prepared, table, 0..table.len());
        log_batch_summary(
            &ensemble.name,
            outcome.results.len(),
            outcome.faults.len(),
            scope.elapsed_ms(),
        );
        Ok(outcome)
    }

    /// Same output as [`process`](Self::process), with rows split into
    /// contiguous chunks across `self.workers` scoped threads and reassembled
    /// in chunk order.
    pub fn process_parallel(
        &self,
        ensemble: &Ensemble,
        table: &ClaimsTable,
        validation: &ValidationResult,
    ) -> Result<BatchOutcome, ScoringError> {
        let prepared = self.prepare(ensemble, table, validation)?;
        let scope = ProfileScope::with_context(
            "batch.process_parallel",
            &[("ensemble", v_str(&ensemble.name))],
        );
        let workers = self.workers.min(table.len()).max(1);
        let chunk = (table.len() + workers - 1) / workers;

        let parts: Vec<BatchOutcome> = thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|w| {
                    let start = (w * chunk).min(table.len());
                    let end = ((w + 1) * chunk).min(table.len());
                    let prepared = &prepared;
                    s.spawn(move || self.score_rows(prepared, table, start..end))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut outcome = BatchOutcome::default();
        for part in parts {
            outcome.results.extend(part.results);
            outcome.faults.extend(part.faults);
        }
        log_batch_summary(
            &ensemble.name,
            outcome.results.len(),
            outcome.faults.len(),
            scope.elapsed_ms(),
        );
        Ok(outcome)
    }

    fn score_rows(
        &self,
        prepared: &Prepared,
        table: &ClaimsTable,
        rows: Range<usize>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            results: Vec::with_capacity(rows.len()),
            faults: Vec::new(),
        };
        for row in rows {
            let claim_cell = table.cell(row, prepared.claim_col);
            let (claim_number, claim_fault) = match claim_cell.canonical_text() {
                Some(c) => (c, None),
                None => {
                    let fallback = format!("#{}", row + 1);
                    let fault = RowFault {
                        row,
                        claim_number: fallback.clone(),
                        column: table.columns[prepared.claim_col].clone(),
                        kind: FaultKind::MissingClaimNumber,
                        detail: "blank claim number".to_string(),
                    };
                    (fallback, Some(fault))
                }
            };

            let mut fields = BTreeMap::new();
            for (name, col) in &prepared.feature_cols {
                fields.insert(name.clone(), table.cell(row, *col).clone());
            }
            let record = ClaimRecord { claim_number, fields };
            let (result, field_faults) = self.engine.evaluate_compiled(&prepared.compiled, &record);

            let mut seen: BTreeSet<(String, FaultKind)> = BTreeSet::new();
            let row_faults = claim_fault.into_iter().chain(field_faults.into_iter().filter_map(|f| {
                if !seen.insert((f.feature.clone(), f.kind)) {
                    return None;
                }
                let detail = match &f.observed {
                    Some(v) => format!("'{}' cannot be compared", v),
                    None => "no value".to_string(),
                };
                Some(RowFault {
                    row,
                    claim_number: record.claim_number.clone(),
                    column: f.feature,
                    kind: f.kind,
                    detail,
                })
            }));
            for fault in row_faults {
                log_row_fault(fault.row, &fault.claim_number, &fault.column, fault.kind.as_str());
                outcome.faults.push(fault);
            }
            outcome.results.push(result);
        }
        outcome
    }
}
