//! Split-condition parsing.
//!
//! Tree sources write conditions as `<feature> <op> <operand>`, e.g.
//! `Claim Amount > 5000`, `Region == 'North'`, `Vehicle Type not in [SUV, Van]`.
//! A condition that does not match the grammar is reported as a [`ParseFailure`]
//! value; callers decide whether to fall back to a flag lookup or a plain label.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    In,
    NotIn,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::In => "in",
            Operator::NotIn => "not in",
        }
    }

    /// Operator of the false branch.
    pub fn negate(&self) -> Operator {
        match self {
            Operator::Gt => Operator::Le,
            Operator::Ge => Operator::Lt,
            Operator::Lt => Operator::Ge,
            Operator::Le => Operator::Gt,
            Operator::Eq => Operator::Ne,
            Operator::Ne => Operator::Eq,
            Operator::In => Operator::NotIn,
            Operator::NotIn => Operator::In,
        }
    }

    pub fn is_ordering(&self) -> bool {
        matches!(self, Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le)
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Number(f64),
    Text(String),
    Set(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub feature: String,
    pub operator: Operator,
    pub operand: Operand,
}

impl Predicate {
    pub fn new(feature: &str, operator: Operator, operand: Operand) -> Self {
        Self { feature: feature.to_string(), operator, operand }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_label(&self.feature, self.operator, &self.operand))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub condition: String,
    pub reason: &'static str,
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot parse condition '{}': {}", self.condition, self.reason)
    }
}

const OPERATOR_CHARS: [char; 4] = ['<', '>', '=', '!'];
const SPECIAL_CHARS: [char; 13] =
    [',', '[', ']', '(', ')', '{', '}', '<', '>', '=', '!', '\'', '"'];

fn fail(condition: &str, reason: &'static str) -> ParseFailure {
    ParseFailure { condition: condition.to_string(), reason }
}

fn normalize(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed.strip_suffix('?').unwrap_or(trimmed).trim_end()
}

/// Parse a textual split condition into a [`Predicate`].
pub fn parse_condition(text: &str) -> Result<Predicate, ParseFailure> {
    let body = normalize(text);
    if body.is_empty() {
        return Err(fail(text, "empty condition"));
    }

    let (feature, operator, operand_text) = if let Some((idx, op, len)) = find_symbolic_op(body) {
        (&body[..idx], op, &body[idx + len..])
    } else if let Some((feature_end, op, operand_start)) = find_word_op(body) {
        (&body[..feature_end], op, &body[operand_start..])
    } else {
        return Err(fail(text, "no comparison operator"));
    };

    let feature = feature.trim();
    let operand_text = operand_text.trim();
    if feature.is_empty() {
        return Err(fail(text, "missing feature name"));
    }
    if operand_text.is_empty() {
        return Err(fail(text, "missing operand"));
    }
    if operand_text.starts_with(OPERATOR_CHARS) {
        return Err(fail(text, "malformed operator"));
    }

    let operand = if operator.is_set() {
        let items = parse_set(operand_text).ok_or_else(|| fail(text, "unterminated quote in set"))?;
        if items.is_empty() {
            return Err(fail(text, "empty set operand"));
        }
        Operand::Set(items)
    } else {
        parse_scalar_operand(operand_text).ok_or_else(|| fail(text, "unterminated quote"))?
    };
    // Ordering always compares numbers: `'30'` and `1,000` are numeric operands.
    let operand = match operand {
        Operand::Text(s) if operator.is_ordering() => Operand::Number(
            coerce_number(&s).ok_or_else(|| fail(text, "ordering needs a numeric operand"))?,
        ),
        other => other,
    };

    Ok(Predicate { feature: feature.to_string(), operator, operand })
}

/// Label shown on the branch taken when the predicate holds.
pub fn format_true_label(predicate: &Predicate) -> String {
    format_label(&predicate.feature, predicate.operator, &predicate.operand)
}

/// Label for the other branch: the logical negation of the predicate.
pub fn format_false_label(predicate: &Predicate) -> String {
    format_label(&predicate.feature, predicate.operator.negate(), &predicate.operand)
}

/// Feature name in front of the first operator, for conditions that did not
/// parse. Returns `None` when nothing precedes the operator.
pub fn extract_feature_name(text: &str) -> Option<String> {
    let body = normalize(text);
    let end = match (find_first_operator_char(body), find_word_op(body)) {
        (Some(a), Some((b, _, _))) => a.min(b),
        (Some(a), None) => a,
        (None, Some((b, _, _))) => b,
        (None, None) => body.len(),
    };
    let name = body[..end].trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// A condition that is nothing but a feature name reads as a boolean flag
/// lookup (`is_weekend?`). Anything carrying operator or quoting characters
/// is not a flag.
pub fn flag_feature(text: &str) -> Option<String> {
    let body = normalize(text);
    if body.is_empty() || body.contains(SPECIAL_CHARS) || find_word_op(body).is_some() {
        return None;
    }
    Some(body.to_string())
}

/// Canonical text for a number: integral values print without a fraction.
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

fn format_label(feature: &str, operator: Operator, operand: &Operand) -> String {
    let rhs = match operand {
        Operand::Number(n) => format_number(*n),
        Operand::Text(s) => quote_if_needed(s, true),
        Operand::Set(items) => {
            let parts: Vec<String> = items.iter().map(|s| quote_if_needed(s, false)).collect();
            format!("[{}]", parts.join(", "))
        }
    };
    format!("{} {} {}", feature, operator.symbol(), rhs)
}

fn quote_if_needed(s: &str, numeric_sensitive: bool) -> String {
    let needs = s.is_empty()
        || s.trim() != s
        || s.contains(SPECIAL_CHARS)
        || (numeric_sensitive && parse_number(s).is_some());
    if !needs {
        return s.to_string();
    }
    if s.contains('\'') {
        format!("\"{}\"", s)
    } else {
        format!("'{}'", s)
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Numeric reading of operand or cell text: trimmed, thousands separators
/// removed.
pub fn coerce_number(s: &str) -> Option<f64> {
    let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
    parse_number(&cleaned)
}

fn is_quote(c: char) -> bool {
    c == '\'' || c == '"'
}

/// Position, operator and byte length of the first symbolic operator outside quotes.
fn find_symbolic_op(body: &str) -> Option<(usize, Operator, usize)> {
    let bytes = body.as_bytes();
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        if b == b'\'' || b == b'"' {
            quote = Some(b);
            continue;
        }
        let next = bytes.get(i + 1).copied();
        let found = match (b, next) {
            (b'>', Some(b'=')) => Some((Operator::Ge, 2)),
            (b'<', Some(b'=')) => Some((Operator::Le, 2)),
            (b'!', Some(b'=')) => Some((Operator::Ne, 2)),
            (b'=', Some(b'=')) => Some((Operator::Eq, 2)),
            (b'>', _) => Some((Operator::Gt, 1)),
            (b'<', _) => Some((Operator::Lt, 1)),
            (b'=', _) => Some((Operator::Eq, 1)),
            _ => None,
        };
        if let Some((op, len)) = found {
            return Some((i, op, len));
        }
    }
    None
}

fn find_first_operator_char(body: &str) -> Option<usize> {
    find_symbolic_op(body).map(|(i, _, _)| i).or_else(|| body.find('!'))
}

/// Locate the whitespace-delimited `in` outside quotes and brackets that
/// starts the operand, and widen it to `not in` when preceded by `not`.
/// The last `in` followed by a bracketed list wins, so feature names may
/// contain the word. Without brackets the first `in` wins, so bare set items
/// may contain it. Returns (feature end, operator, operand start).
fn find_word_op(body: &str) -> Option<(usize, Operator, usize)> {
    let lower = body.to_ascii_lowercase();
    let bytes = lower.as_bytes();
    let mut quote: Option<u8> = None;
    let mut depth = 0usize;
    let mut candidates: Vec<usize> = Vec::new();
    for (i, &b) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'[' | b'(' | b'{' => depth += 1,
            b']' | b')' | b'}' => depth = depth.saturating_sub(1),
            b'i' if depth == 0 => {
                let before_ok = i > 0 && bytes[i - 1].is_ascii_whitespace();
                let after = bytes.get(i + 2).copied();
                let after_ok = match after {
                    None => true,
                    Some(c) => c.is_ascii_whitespace() || c == b'[' || c == b'(' || c == b'{',
                };
                if before_ok && bytes.get(i + 1) == Some(&b'n') && after_ok {
                    candidates.push(i);
                }
            }
            _ => {}
        }
    }
    let bracketed = |i: &&usize| lower[**i + 2..].trim_start().starts_with(['[', '(', '{']);
    let at = *candidates.iter().rev().find(bracketed).or_else(|| candidates.first())?;
    let head = lower[..at].trim_end();
    if head.ends_with(" not") || head == "not" {
        let not_at = head.len() - 3;
        Some((not_at, Operator::NotIn, at + 2))
    } else {
        Some((at, Operator::In, at + 2))
    }
}

fn unquote(s: &str) -> Option<&str> {
    let s = s.trim();
    match s.chars().next() {
        Some(c) if is_quote(c) => {
            if s.len() >= 2 && s.ends_with(c) {
                Some(&s[1..s.len() - 1])
            } else {
                None
            }
        }
        _ => Some(s),
    }
}

fn parse_scalar_operand(text: &str) -> Option<Operand> {
    let quoted = text.starts_with(is_quote);
    let inner = unquote(text)?;
    if quoted {
        return Some(Operand::Text(inner.to_string()));
    }
    match parse_number(inner) {
        Some(n) => Some(Operand::Number(n)),
        None => Some(Operand::Text(inner.to_string())),
    }
}

/// Comma-separated items, optionally wrapped in one pair of brackets. Unquoted
/// numeric items are stored in canonical form so `3.0` and `3` match alike.
fn parse_set(text: &str) -> Option<Vec<String>> {
    let inner = match (text.chars().next(), text.chars().last()) {
        (Some('['), Some(']')) | (Some('('), Some(')')) | (Some('{'), Some('}'))
            if text.len() >= 2 =>
        {
            &text[1..text.len() - 1]
        }
        _ => text,
    };

    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    for c in inner.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if is_quote(c) => {
                quote = Some(c);
                current.push(c);
            }
            None if c == ',' => {
                items.push(std::mem::take(&mut current));
            }
            None => current.push(c),
        }
    }
    if quote.is_some() {
        return None;
    }
    items.push(current);

    let mut out = Vec::with_capacity(items.len());
    for raw in items {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let quoted = raw.starts_with(is_quote);
        let item = unquote(raw)?;
        if !quoted {
            if let Some(n) = parse_number(item) {
                out.push(format_number(n));
                continue;
            }
        }
        out.push(item.to_string());
    }
    Some(out)
}
