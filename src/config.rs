use std::str::FromStr;

use crate::layout::LayoutConfig;
use crate::logging::{log, obj, v_num, Domain, Level};
use crate::trace::{MissingValuePolicy, RiskThresholds};

pub const DEFAULT_HISTOGRAM_BINS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub thresholds: RiskThresholds,
    pub missing_policy: MissingValuePolicy,
    pub histogram_bins: usize,
    pub layout: LayoutConfig,
    /// Worker threads for batch scoring; 1 means sequential.
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thresholds: RiskThresholds::default(),
            missing_policy: MissingValuePolicy::default(),
            histogram_bins: DEFAULT_HISTOGRAM_BINS,
            layout: LayoutConfig::default(),
            workers: 1,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn or<T: FromStr>(raw: Option<String>, default: T) -> T {
            raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        }

        let base = Config::default();
        let moderate_at = or(lookup("RISK_MODERATE_AT"), base.thresholds.moderate_at);
        let high_at = or(lookup("RISK_HIGH_AT"), base.thresholds.high_at);
        let thresholds = match RiskThresholds::new(moderate_at, high_at) {
            Some(t) => t,
            None => {
                log(
                    Level::Warn,
                    Domain::System,
                    "invalid_thresholds",
                    obj(&[
                        ("moderate_at", v_num(moderate_at)),
                        ("high_at", v_num(high_at)),
                        ("msg", serde_json::json!("falling back to default risk thresholds")),
                    ]),
                );
                base.thresholds
            }
        };
        let missing_policy = match lookup("MISSING_BRANCH").as_deref().map(str::trim) {
            Some("true") => MissingValuePolicy::TrueBranch,
            Some("false") => MissingValuePolicy::FalseBranch,
            _ => base.missing_policy,
        };
        let layout = LayoutConfig {
            min_x: or(lookup("LAYOUT_MIN_X"), base.layout.min_x),
            max_x: or(lookup("LAYOUT_MAX_X"), base.layout.max_x),
            row_height: or(lookup("LAYOUT_ROW_HEIGHT"), base.layout.row_height),
            cell_width: or(lookup("LAYOUT_CELL_WIDTH"), base.layout.cell_width),
            cell_height: or(lookup("LAYOUT_CELL_HEIGHT"), base.layout.cell_height),
            columns_per_row: or(lookup("LAYOUT_COLUMNS"), base.layout.columns_per_row).max(1),
        };
        Self {
            thresholds,
            missing_policy,
            histogram_bins: or(lookup("HIST_BINS"), base.histogram_bins).max(1),
            layout,
            workers: or(lookup("WORKERS"), num_cpus::get().min(8)).max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.histogram_bins, 10);
        assert_eq!(cfg.missing_policy, MissingValuePolicy::FalseBranch);
        assert!(cfg.thresholds.moderate_at < cfg.thresholds.high_at);
        assert_eq!(cfg.workers, 1);
    }

    #[test]
    fn test_inverted_thresholds_fall_back() {
        let cfg = Config::from_lookup(lookup(&[
            ("RISK_MODERATE_AT", "0.8"),
            ("RISK_HIGH_AT", "0.2"),
        ]));
        assert_eq!(cfg.thresholds, RiskThresholds::default());
        assert_eq!((cfg.thresholds.moderate_at, cfg.thresholds.high_at), (0.3, 0.7));

        let cfg = Config::from_lookup(lookup(&[
            ("RISK_MODERATE_AT", "0.25"),
            ("RISK_HIGH_AT", "0.9"),
        ]));
        assert_eq!((cfg.thresholds.moderate_at, cfg.thresholds.high_at), (0.25, 0.9));
    }

    #[test]
    fn test_missing_branch_selects_policy() {
        let cfg = Config::from_lookup(lookup(&[("MISSING_BRANCH", "true")]));
        assert_eq!(cfg.missing_policy, MissingValuePolicy::TrueBranch);
        let cfg = Config::from_lookup(lookup(&[("MISSING_BRANCH", "false")]));
        assert_eq!(cfg.missing_policy, MissingValuePolicy::FalseBranch);
        let cfg = Config::from_lookup(lookup(&[("MISSING_BRANCH", "sometimes")]));
        assert_eq!(cfg.missing_policy, MissingValuePolicy::FalseBranch);
    }

    #[test]
    fn test_numeric_keys_and_floors() {
        let cfg = Config::from_lookup(lookup(&[
            ("HIST_BINS", "0"),
            ("WORKERS", "3"),
            ("LAYOUT_COLUMNS", "0"),
            ("LAYOUT_ROW_HEIGHT", " 120 "),
            ("LAYOUT_MAX_X", "wide"),
        ]));
        assert_eq!(cfg.histogram_bins, 1);
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.layout.columns_per_row, 1);
        assert_eq!(cfg.layout.row_height, 120.0);
        assert_eq!(cfg.layout.max_x, LayoutConfig::default().max_x);
    }

    #[test]
    fn test_empty_lookup_is_well_formed() {
        let cfg = Config::from_lookup(|_| None);
        assert!(cfg.workers >= 1 && cfg.workers <= 8);
        assert_eq!(cfg.histogram_bins, DEFAULT_HISTOGRAM_BINS);
        assert_eq!(cfg.layout, LayoutConfig::default());
    }
}
