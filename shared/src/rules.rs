//! Constraint rules both ends can evaluate.
//!
//! The server attaches constraints to scalar cells and stays
//! authoritative; the built-in rules are additionally shipped to the
//! owning client as `(name, args)` pairs so it can pre-clamp or
//! pre-reject an edit locally instead of waiting a round trip. Custom
//! server-side constraints are never shipped and never appear here.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A shareable constraint: a built-in rule name plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub args: Vec<Value>,
}

/// The rule table entry for one scalar cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRules {
    pub path: Vec<String>,
    pub rules: Vec<RuleSpec>,
}

/// Result of running one rule over a candidate value.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    /// The value (possibly transformed) passes.
    Pass(Value),
    /// The write must not happen.
    Reject,
    /// The rule name is not a built-in this side knows how to run.
    Unknown,
}

/// Turns an f64 back into a JSON number, preferring integer form.
fn number(x: f64) -> Value {
    if x.fract() == 0.0 && x >= i64::MIN as f64 && x <= i64::MAX as f64 {
        Value::from(x as i64)
    } else {
        serde_json::Number::from_f64(x)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl RuleSpec {
    pub fn min(n: f64) -> Self {
        RuleSpec {
            name: "min".to_string(),
            args: vec![number(n)],
        }
    }

    pub fn max(n: f64) -> Self {
        RuleSpec {
            name: "max".to_string(),
            args: vec![number(n)],
        }
    }

    pub fn int() -> Self {
        RuleSpec {
            name: "int".to_string(),
            args: Vec::new(),
        }
    }

    pub fn ban(values: Vec<Value>) -> Self {
        RuleSpec {
            name: "ban".to_string(),
            args: values,
        }
    }

    /// Runs the rule over a candidate value.
    ///
    /// `min`/`max` clamp numbers toward the bound and reject anything
    /// that is not a number (a clamp has no meaning there); `int`
    /// truncates; `ban` rejects listed values structurally.
    pub fn apply(&self, value: &Value) -> RuleOutcome {
        match self.name.as_str() {
            "min" => match (value.as_f64(), self.args.first().and_then(Value::as_f64)) {
                (Some(x), Some(bound)) if x < bound => RuleOutcome::Pass(number(bound)),
                (Some(_), Some(_)) => RuleOutcome::Pass(value.clone()),
                _ => RuleOutcome::Reject,
            },
            "max" => match (value.as_f64(), self.args.first().and_then(Value::as_f64)) {
                (Some(x), Some(bound)) if x > bound => RuleOutcome::Pass(number(bound)),
                (Some(_), Some(_)) => RuleOutcome::Pass(value.clone()),
                _ => RuleOutcome::Reject,
            },
            "int" => match value.as_f64() {
                Some(x) => RuleOutcome::Pass(number(x.trunc())),
                None => RuleOutcome::Reject,
            },
            "ban" => {
                if self.args.contains(value) {
                    RuleOutcome::Reject
                } else {
                    RuleOutcome::Pass(value.clone())
                }
            }
            _ => RuleOutcome::Unknown,
        }
    }
}

/// Applies a cell's rule chain in attachment order.
///
/// The first rejection aborts the chain; unknown rules are skipped so a
/// client holding a table from a newer server still predicts what it
/// can. Returns the final value, or `None` when the write would be
/// rejected.
pub fn run_chain(rules: &[RuleSpec], value: &Value) -> Option<Value> {
    let mut current = value.clone();
    for rule in rules {
        match rule.apply(&current) {
            RuleOutcome::Pass(v) => current = v,
            RuleOutcome::Reject => return None,
            RuleOutcome::Unknown => {}
        }
    }
    Some(current)
}
