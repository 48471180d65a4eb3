//! Trace engine: walks every component tree of an ensemble for one claim
//! record and turns the summed leaf contributions into a probability and a
//! risk tier.
//!
//! Missing or uncoercible values never abort an evaluation. The decision
//! falls to the branch chosen by [`MissingValuePolicy`] (false branch unless
//! configured otherwise), the step is marked `defaulted`, and a
//! [`FieldFault`] is reported next to the result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::condition::{coerce_number, format_number, Operand, Operator, Predicate};
use crate::config::Config;
use crate::error::ScoringError;
use crate::logging::{enabled, log, obj, v_num, v_str, Domain, Level};
use crate::tree::{compile, CompiledEnsemble, CompiledNode, Ensemble, Test};

// =============================================================================
// Claim values
// =============================================================================

/// One cell of a claims table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Scalar {
    /// Raw CSV cell: blank becomes `Null`, everything else stays text and is
    /// coerced when a predicate asks for a type.
    pub fn from_cell(raw: &str) -> Self {
        if raw.trim().is_empty() {
            Scalar::Null
        } else {
            Scalar::Text(raw.to_string())
        }
    }

    pub fn is_missing(&self) -> bool {
        match self {
            Scalar::Null => true,
            Scalar::Text(s) => s.trim().is_empty(),
            Scalar::Bool(_) | Scalar::Number(_) => false,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) if n.is_finite() => Some(*n),
            Scalar::Number(_) | Scalar::Null => None,
            Scalar::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Scalar::Text(s) => coerce_number(s),
        }
    }

    /// Text used for equality and set membership. Integral numbers print
    /// without a fraction.
    pub fn canonical_text(&self) -> Option<String> {
        match self {
            Scalar::Null => None,
            Scalar::Bool(b) => Some(b.to_string()),
            Scalar::Number(n) => Some(format_number(*n)),
            Scalar::Text(s) => {
                let t = s.trim();
                if t.is_empty() {
                    None
                } else {
                    Some(t.to_string())
                }
            }
        }
    }

    pub fn truthy(&self) -> Option<bool> {
        match self {
            Scalar::Null => None,
            Scalar::Bool(b) => Some(*b),
            Scalar::Number(n) => Some(*n != 0.0),
            Scalar::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Some(true),
                "false" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRecord {
    pub claim_number: String,
    pub fields: BTreeMap<String, Scalar>,
}

impl ClaimRecord {
    pub fn new(claim_number: &str) -> Self {
        Self { claim_number: claim_number.to_string(), fields: BTreeMap::new() }
    }

    pub fn with(mut self, column: &str, value: Scalar) -> Self {
        self.fields.insert(column.to_string(), value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Scalar> {
        self.fields.get(column)
    }
}

// =============================================================================
// Score -> probability -> risk
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Moderate => "moderate",
            RiskLevel::High => "high",
        }
    }
}

/// `p < moderate_at` is low, `moderate_at <= p < high_at` moderate, the rest high.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskThresholds {
    pub moderate_at: f64,
    pub high_at: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self { moderate_at: 0.3, high_at: 0.7 }
    }
}

impl RiskThresholds {
    /// Requires `0 <= moderate_at < high_at <= 1`.
    pub fn new(moderate_at: f64, high_at: f64) -> Option<Self> {
        let ordered = moderate_at.is_finite() && high_at.is_finite() && moderate_at < high_at;
        if ordered && moderate_at >= 0.0 && high_at <= 1.0 {
            Some(Self { moderate_at, high_at })
        } else {
            None
        }
    }

    pub fn classify(&self, probability: f64) -> RiskLevel {
        if probability >= self.high_at {
            RiskLevel::High
        } else if probability >= self.moderate_at {
            RiskLevel::Moderate
        } else {
            RiskLevel::Low
        }
    }
}

/// Logistic function, evaluated so neither branch overflows.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingValuePolicy {
    #[default]
    FalseBranch,
    TrueBranch,
}

impl MissingValuePolicy {
    pub fn branch(&self) -> bool {
        matches!(self, MissingValuePolicy::TrueBranch)
    }
}

// =============================================================================
// Trace output
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathStep {
    /// Pre-order index of the decision node.
    pub node: usize,
    pub feature: String,
    pub observed: Option<String>,
    pub outcome: bool,
    pub defaulted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreePath {
    pub tree_index: usize,
    pub tree_title: String,
    pub leaf_value: f64,
    /// Pre-order indices from root to leaf.
    pub node_path: Vec<usize>,
    pub steps: Vec<PathStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceResult {
    pub claim_number: String,
    pub total_score: f64,
    pub probability: f64,
    pub risk_level: RiskLevel,
    pub paths: Vec<TreePath>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    MissingValue,
    UncoercibleValue,
    MissingClaimNumber,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::MissingValue => "missing_value",
            FaultKind::UncoercibleValue => "uncoercible_value",
            FaultKind::MissingClaimNumber => "missing_claim_number",
        }
    }
}

/// A decision that fell back to the default branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldFault {
    pub tree_index: usize,
    pub node: usize,
    pub feature: String,
    pub kind: FaultKind,
    pub observed: Option<String>,
}

// =============================================================================
// Predicate evaluation
// =============================================================================

enum Outcome {
    Branch(bool),
    Missing,
    Uncoercible,
}

fn text_in_set(cell: &Scalar, items: &[String]) -> Option<bool> {
    let text = cell.canonical_text()?;
    if items.iter().any(|i| *i == text) {
        return Some(true);
    }
    let numeric = cell.as_number().map(format_number);
    Some(numeric.map(|n| items.iter().any(|i| *i == n)).unwrap_or(false))
}

fn check_predicate(p: &Predicate, cell: &Scalar) -> Outcome {
    let result = match (&p.operator, &p.operand) {
        // Ordering is numeric only; a cell that is not a number is uncoercible.
        (op, operand) if op.is_ordering() => {
            let rhs = operand_number(operand);
            cell.as_number().zip(rhs).map(|(lhs, rhs)| match op {
                Operator::Gt => lhs > rhs,
                Operator::Ge => lhs >= rhs,
                Operator::Lt => lhs < rhs,
                _ => lhs <= rhs,
            })
        }
        (op, Operand::Number(rhs)) if !op.is_set() => cell.as_number().map(|lhs| match op {
            Operator::Ne => lhs != *rhs,
            _ => lhs == *rhs,
        }),
        (op, Operand::Text(rhs)) if !op.is_set() => cell.canonical_text().map(|lhs| match op {
            Operator::Ne => lhs != *rhs,
            _ => lhs == *rhs,
        }),
        (Operator::NotIn, Operand::Set(items)) => text_in_set(cell, items).map(|hit| !hit),
        (_, Operand::Set(items)) => text_in_set(cell, items),
        (Operator::NotIn, operand) => text_in_set(cell, &[operand_text(operand)]).map(|hit| !hit),
        (_, operand) => text_in_set(cell, &[operand_text(operand)]),
    };
    match result {
        Some(b) => Outcome::Branch(b),
        None => Outcome::Uncoercible,
    }
}

fn operand_number(operand: &Operand) -> Option<f64> {
    match operand {
        Operand::Number(n) => Some(*n),
        Operand::Text(s) => coerce_number(s),
        Operand::Set(_) => None,
    }
}

fn operand_text(operand: &Operand) -> String {
    match operand {
        Operand::Number(n) => format_number(*n),
        Operand::Text(s) => s.clone(),
        Operand::Set(items) => items.join(","),
    }
}

fn check(test: &Test, cell: Option<&Scalar>) -> Outcome {
    let cell = match cell {
        Some(c) if !c.is_missing() => c,
        _ => return Outcome::Missing,
    };
    match test {
        Test::Predicate(p) => check_predicate(p, cell),
        Test::Flag(_) => match cell.truthy() {
            Some(b) => Outcome::Branch(b),
            None => Outcome::Uncoercible,
        },
    }
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TraceEngine {
    pub thresholds: RiskThresholds,
    pub missing_policy: MissingValuePolicy,
}

impl Default for TraceEngine {
    fn default() -> Self {
        Self {
            thresholds: RiskThresholds::default(),
            missing_policy: MissingValuePolicy::default(),
        }
    }
}

impl TraceEngine {
    pub fn new(thresholds: RiskThresholds, missing_policy: MissingValuePolicy) -> Self {
        Self { thresholds, missing_policy }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.thresholds, cfg.missing_policy)
    }

    pub fn evaluate(
        &self,
        ensemble: &Ensemble,
        record: &ClaimRecord,
    ) -> Result<TraceResult, ScoringError> {
        self.evaluate_with_faults(ensemble, record).map(|(result, _)| result)
    }

    pub fn evaluate_with_faults(
        &self,
        ensemble: &Ensemble,
        record: &ClaimRecord,
    ) -> Result<(TraceResult, Vec<FieldFault>), ScoringError> {
        let compiled = compile(ensemble)?;
        Ok(self.evaluate_compiled(&compiled, record))
    }

    /// Walk an already compiled ensemble. Cannot fail: every condition was
    /// resolved at compile time.
    pub fn evaluate_compiled(
        &self,
        compiled: &CompiledEnsemble,
        record: &ClaimRecord,
    ) -> (TraceResult, Vec<FieldFault>) {
        let mut paths = Vec::with_capacity(compiled.trees.len());
        let mut faults = Vec::new();

        for (tree_index, tree) in compiled.trees.iter().enumerate() {
            let mut id = tree.root_id();
            let mut node_path = Vec::new();
            let mut steps = Vec::new();
            loop {
                node_path.push(id);
                match tree.node(id) {
                    CompiledNode::Leaf { value } => {
                        paths.push(TreePath {
                            tree_index,
                            tree_title: tree.title.clone(),
                            leaf_value: *value,
                            node_path,
                            steps,
                        });
                        break;
                    }
                    CompiledNode::Split { test, true_id, false_id, .. } => {
                        let cell = record.get(test.feature());
                        let observed = cell.and_then(|c| c.canonical_text());
                        let fault = match check(test, cell) {
                            Outcome::Branch(b) => Err(b),
                            Outcome::Missing => Ok(FaultKind::MissingValue),
                            Outcome::Uncoercible => Ok(FaultKind::UncoercibleValue),
                        };
                        let (outcome, defaulted) = match fault {
                            Err(b) => (b, false),
                            Ok(kind) => {
                                faults.push(FieldFault {
                                    tree_index,
                                    node: id,
                                    feature: test.feature().to_string(),
                                    kind,
                                    observed: observed.clone(),
                                });
                                (self.missing_policy.branch(), true)
                            }
                        };
                        steps.push(PathStep {
                            node: id,
                            feature: test.feature().to_string(),
                            observed,
                            outcome,
                            defaulted,
                        });
                        id = if outcome { *true_id } else { *false_id };
                    }
                }
            }
        }

        let total_score: f64 = paths.iter().map(|p| p.leaf_value).sum();
        let probability = sigmoid(total_score);
        let risk_level = self.thresholds.classify(probability);

        if enabled(Level::Trace, Domain::Trace) {
            log(
                Level::Trace,
                Domain::Trace,
                "claim_scored",
                obj(&[
                    ("ensemble", v_str(&compiled.name)),
                    ("claim_number", v_str(&record.claim_number)),
                    ("total_score", v_num(total_score)),
                    ("probability", v_num(probability)),
                    ("risk_level", v_str(risk_level.as_str())),
                    ("faults", v_num(faults.len() as f64)),
                ]),
            );
        }

        let result = TraceResult {
            claim_number: record.claim_number.clone(),
            total_score,
            probability,
            risk_level,
            paths,
        };
        (result, faults)
    }
}
