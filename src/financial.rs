//! Financial roll-ups over scored claims.
//!
//! Only rows with a present, finite, non-negative estimated amount count.
//! Everything else is left out of every total and histogram.

use serde::{Deserialize, Serialize};

use crate::claims::ClaimsTable;
use crate::error::ScoringError;
use crate::logging::{log, obj, v_num, Domain, Level};
use crate::trace::{RiskLevel, Scalar, TraceResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedResult {
    #[serde(flatten)]
    pub trace: TraceResult,
    pub estimated_amount: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStats {
    pub total_value: f64,
    pub avg_value: f64,
    pub count: usize,
}

impl TierStats {
    fn from_amounts(amounts: &[f64]) -> Self {
        let total_value: f64 = amounts.iter().sum();
        let count = amounts.len();
        let avg_value = if count == 0 { 0.0 } else { total_value / count as f64 };
        Self { total_value, avg_value, count }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RiskBreakdown {
    pub low: TierStats,
    pub moderate: TierStats,
    pub high: TierStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBin {
    pub bin_label: String,
    pub count: usize,
    pub min_value: f64,
    pub max_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceDistribution {
    pub high: Vec<PriceBin>,
    pub low: Vec<PriceBin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialMetrics {
    pub total_value: f64,
    pub average_value: f64,
    pub claim_count: usize,
    pub excluded_count: usize,
    pub by_risk: RiskBreakdown,
    pub price_distribution: PriceDistribution,
}

fn valid_amount(amount: Option<f64>) -> Option<f64> {
    amount.filter(|a| a.is_finite() && *a >= 0.0)
}

pub fn aggregate(enriched: &[EnrichedResult], bin_count: usize) -> FinancialMetrics {
    let bin_count = bin_count.max(1);
    let mut all = Vec::new();
    let mut low = Vec::new();
    let mut moderate = Vec::new();
    let mut high = Vec::new();

    for row in enriched {
        let Some(amount) = valid_amount(row.estimated_amount) else {
            continue;
        };
        all.push(amount);
        match row.trace.risk_level {
            RiskLevel::Low => low.push(amount),
            RiskLevel::Moderate => moderate.push(amount),
            RiskLevel::High => high.push(amount),
        }
    }

    let overall = TierStats::from_amounts(&all);
    let metrics = FinancialMetrics {
        total_value: overall.total_value,
        average_value: overall.avg_value,
        claim_count: overall.count,
        excluded_count: enriched.len() - all.len(),
        by_risk: RiskBreakdown {
            low: TierStats::from_amounts(&low),
            moderate: TierStats::from_amounts(&moderate),
            high: TierStats::from_amounts(&high),
        },
        price_distribution: PriceDistribution {
            high: histogram(&high, bin_count),
            low: histogram(&low, bin_count),
        },
    };

    log(
        Level::Info,
        Domain::Metrics,
        "financial_aggregate",
        obj(&[
            ("claims", v_num(metrics.claim_count as f64)),
            ("excluded", v_num(metrics.excluded_count as f64)),
            ("total_value", v_num(metrics.total_value)),
            ("high_value", v_num(metrics.by_risk.high.total_value)),
        ]),
    );
    metrics
}

/// Fixed-count histogram. Bins are right-exclusive except the last, whose
/// upper edge is exactly the maximum. An empty input yields zeroed bins; a
/// single-valued input lands entirely in the first bin.
pub fn histogram(amounts: &[f64], bin_count: usize) -> Vec<PriceBin> {
    let bin_count = bin_count.max(1);
    if amounts.is_empty() {
        return (0..bin_count)
            .map(|_| PriceBin {
                bin_label: bin_label(0.0, 0.0),
                count: 0,
                min_value: 0.0,
                max_value: 0.0,
            })
            .collect();
    }

    let min = amounts.iter().copied().fold(f64::INFINITY, f64::min);
    let max = amounts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let width = (max - min) / bin_count as f64;

    let mut bins: Vec<PriceBin> = (0..bin_count)
        .map(|i| {
            let lo = min + width * i as f64;
            let hi = if i + 1 == bin_count { max } else { min + width * (i + 1) as f64 };
            PriceBin { bin_label: bin_label(lo, hi), count: 0, min_value: lo, max_value: hi }
        })
        .collect();

    for &amount in amounts {
        let idx = if width > 0.0 {
            (((amount - min) / width).floor() as usize).min(bin_count - 1)
        } else {
            0
        };
        bins[idx].count += 1;
    }
    bins
}

pub fn bin_label(lo: f64, hi: f64) -> String {
    format!("{}–{}", compact_currency(lo), compact_currency(hi))
}

/// `$950`, `$1.2K`, `$15K`, `$3.4M`, `$1.1B`. One decimal below ten units of
/// a suffix, whole units above.
pub fn compact_currency(value: f64) -> String {
    const SUFFIXES: [(f64, &str); 4] = [(1e12, "T"), (1e9, "B"), (1e6, "M"), (1e3, "K")];
    let sign = if value < 0.0 { "-" } else { "" };
    let abs = value.abs();

    let mut scaled = abs;
    let mut suffix = "";
    for (i, (scale, s)) in SUFFIXES.iter().enumerate() {
        if abs >= *scale {
            scaled = abs / scale;
            suffix = s;
            // 999_950 rounds to 1000K; promote to the next suffix instead.
            if round_compact(scaled) >= 1000.0 && i > 0 {
                let (up_scale, up_suffix) = SUFFIXES[i - 1];
                scaled = abs / up_scale;
                suffix = up_suffix;
            }
            break;
        }
    }

    let rounded = round_compact(scaled);
    let digits = if rounded < 10.0 && rounded.fract() != 0.0 {
        format!("{:.1}", rounded)
    } else {
        format!("{:.0}", rounded)
    };
    format!("{}${}{}", sign, digits, suffix)
}

fn round_compact(v: f64) -> f64 {
    if v < 10.0 {
        (v * 10.0).round() / 10.0
    } else {
        v.round()
    }
}

/// Parse a monetary cell such as `$1,250.00` or `1250`.
pub fn parse_amount(cell: &Scalar) -> Option<f64> {
    match cell {
        Scalar::Number(n) if n.is_finite() => Some(*n),
        Scalar::Text(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| !matches!(c, '$' | '€' | '£' | '¥' | ',' | ' '))
                .collect();
            cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        Scalar::Number(_) | Scalar::Bool(_) | Scalar::Null => None,
    }
}

/// Join batch output back to a monetary column by row position.
pub fn enrich_with_amounts(
    results: &[TraceResult],
    table: &ClaimsTable,
    amount_column: &str,
) -> Result<Vec<EnrichedResult>, ScoringError> {
    let col = table.column_index(amount_column).ok_or_else(|| {
        ScoringError::precondition(format!("amount column '{}' not in table", amount_column))
    })?;
    if results.len() != table.len() {
        return Err(ScoringError::precondition(format!(
            "{} results for {} rows; results must come from this table",
            results.len(),
            table.len()
        )));
    }
    Ok(results
        .iter()
        .enumerate()
        .map(|(row, trace)| EnrichedResult {
            trace: trace.clone(),
            estimated_amount: parse_amount(table.cell(row, col)),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(claim: &str, risk: RiskLevel, amount: Option<f64>) -> EnrichedResult {
        EnrichedResult {
            trace: TraceResult {
                claim_number: claim.to_string(),
                total_score: 0.0,
                probability: 0.5,
                risk_level: risk,
                paths: vec![],
            },
            estimated_amount: amount,
        }
    }

    #[test]
    fn test_ten_values_ten_bins() {
        let amounts: Vec<f64> = (1..=10).map(|i| i as f64 * 10.0).collect();
        let bins = histogram(&amounts, 10);
        assert_eq!(bins.len(), 10);
        for b in &bins {
            assert_eq!(b.count, 1, "bin {}", b.bin_label);
        }
        assert_eq!(bins[0].min_value, 10.0);
        assert_eq!(bins[9].max_value, 100.0);
    }

    #[test]
    fn test_histogram_counts_every_amount_once() {
        let amounts = [3.0, 3.5, 7.25, 100.0, 42.0, 42.0, 0.0, 99.99, 55.5];
        for bins_n in [1, 3, 7, 10] {
            let bins = histogram(&amounts, bins_n);
            assert_eq!(bins.len(), bins_n);
            assert_eq!(bins.iter().map(|b| b.count).sum::<usize>(), amounts.len());
            for &a in &amounts {
                let hits = bins
                    .iter()
                    .enumerate()
                    .filter(|(i, b)| {
                        if i + 1 == bins.len() {
                            a >= b.min_value && a <= b.max_value
                        } else {
                            a >= b.min_value && a < b.max_value
                        }
                    })
                    .count();
                assert_eq!(hits, 1, "amount {} with {} bins", a, bins_n);
            }
        }
    }

    #[test]
    fn test_empty_and_single_valued_histograms() {
        let empty = histogram(&[], 10);
        assert_eq!(empty.len(), 10);
        assert!(empty.iter().all(|b| b.count == 0 && b.min_value == 0.0 && b.max_value == 0.0));

        let single = histogram(&[250.0, 250.0], 4);
        assert_eq!(single.len(), 4);
        assert_eq!(single[0].count, 2);
        assert!(single.iter().all(|b| b.min_value == 250.0 && b.max_value == 250.0));
    }

    #[test]
    fn test_aggregate_partitions_by_tier() {
        let rows = vec![
            result("a", RiskLevel::High, Some(1000.0)),
            result("b", RiskLevel::High, Some(3000.0)),
            result("c", RiskLevel::Low, Some(500.0)),
            result("d", RiskLevel::Moderate, None),
            result("e", RiskLevel::Low, Some(-20.0)),
            result("f", RiskLevel::Low, Some(f64::NAN)),
        ];
        let m = aggregate(&rows, 10);
        assert_eq!(m.claim_count, 3);
        assert_eq!(m.excluded_count, 3);
        assert_eq!(m.total_value, 4500.0);
        assert_eq!(m.average_value, 1500.0);
        assert_eq!(m.by_risk.high, TierStats { total_value: 4000.0, avg_value: 2000.0, count: 2 });
        assert_eq!(m.by_risk.low, TierStats { total_value: 500.0, avg_value: 500.0, count: 1 });
        assert_eq!(m.by_risk.moderate, TierStats::default());
        let tier_total = m.by_risk.low.count + m.by_risk.moderate.count + m.by_risk.high.count;
        assert_eq!(tier_total, m.claim_count);
        assert_eq!(m.price_distribution.high.iter().map(|b| b.count).sum::<usize>(), 2);
        assert_eq!(m.price_distribution.low.iter().map(|b| b.count).sum::<usize>(), 1);
    }

    #[test]
    fn test_aggregate_with_no_valid_rows_is_zeroed() {
        let rows = vec![result("a", RiskLevel::High, None)];
        let empty: Vec<EnrichedResult> = Vec::new();
        for input in [&rows[..], &empty[..]] {
            let m = aggregate(input, 10);
            assert_eq!(m.total_value, 0.0);
            assert_eq!(m.average_value, 0.0);
            assert_eq!(m.claim_count, 0);
            assert_eq!(m.price_distribution.high.len(), 10);
            assert_eq!(m.price_distribution.low.len(), 10);
            assert!(m.price_distribution.high.iter().all(|b| b.count == 0));
        }
    }

    #[test]
    fn test_compact_currency() {
        assert_eq!(compact_currency(0.0), "$0");
        assert_eq!(compact_currency(950.0), "$950");
        assert_eq!(compact_currency(9.5), "$9.5");
        assert_eq!(compact_currency(1234.0), "$1.2K");
        assert_eq!(compact_currency(15_000.0), "$15K");
        assert_eq!(compact_currency(3_400_000.0), "$3.4M");
        assert_eq!(compact_currency(999_950.0), "$1M");
        assert_eq!(compact_currency(1_100_000_000.0), "$1.1B");
        assert_eq!(bin_label(10.0, 19.0), "$10–$19");
    }

    #[test]
    fn test_parse_amount_cells() {
        assert_eq!(parse_amount(&Scalar::Text("$1,250.00".into())), Some(1250.0));
        assert_eq!(parse_amount(&Scalar::Text(" 800 ".into())), Some(800.0));
        assert_eq!(parse_amount(&Scalar::Number(12.5)), Some(12.5));
        assert_eq!(parse_amount(&Scalar::Text("pending".into())), None);
        assert_eq!(parse_amount(&Scalar::Null), None);
    }

    #[test]
    fn test_enrich_requires_matching_rows() {
        let table = ClaimsTable::new(
            vec!["Amount".into()],
            vec![vec![Scalar::Text("$10".into())], vec![Scalar::Null]],
        );
        let results = vec![
            result("a", RiskLevel::Low, None).trace,
            result("b", RiskLevel::High, None).trace,
        ];
        let enriched = enrich_with_amounts(&results, &table, "Amount").unwrap();
        assert_eq!(enriched[0].estimated_amount, Some(10.0));
        assert_eq!(enriched[1].estimated_amount, None);

        let err = enrich_with_amounts(&results[..1], &table, "Amount").unwrap_err();
        assert_eq!(err.kind(), "precondition");
        assert!(enrich_with_amounts(&results, &table, "Cost").is_err());
    }
}
