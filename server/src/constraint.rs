use serde_json::Value;
use shared::{RuleOutcome, RuleSpec};
use std::fmt;
use std::sync::Arc;

type CustomFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// A write filter attached to a scalar cell.
///
/// Built-in constraints carry a `RuleSpec` that is also shipped to the
/// owning client for local prediction. Custom constraints are arbitrary
/// server-side closures and never leave the server; remote mirrors only
/// learn their outcome through the resulting edits.
#[derive(Clone)]
pub enum Constraint {
    Builtin(RuleSpec),
    Custom { name: String, func: CustomFn },
}

impl Constraint {
    pub fn min(bound: f64) -> Self {
        Constraint::Builtin(RuleSpec::min(bound))
    }

    pub fn max(bound: f64) -> Self {
        Constraint::Builtin(RuleSpec::max(bound))
    }

    pub fn int() -> Self {
        Constraint::Builtin(RuleSpec::int())
    }

    pub fn ban(values: Vec<Value>) -> Self {
        Constraint::Builtin(RuleSpec::ban(values))
    }

    pub fn custom<F>(name: &str, func: F) -> Self
    where
        F: Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    {
        Constraint::Custom {
            name: name.to_string(),
            func: Arc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Constraint::Builtin(spec) => &spec.name,
            Constraint::Custom { name, .. } => name,
        }
    }

    /// The shareable half, if any. Custom constraints return `None` and
    /// are therefore absent from distributed rule tables.
    pub fn spec(&self) -> Option<&RuleSpec> {
        match self {
            Constraint::Builtin(spec) => Some(spec),
            Constraint::Custom { .. } => None,
        }
    }

    /// Runs the constraint: `Some(value)` to store, `None` to reject.
    pub fn apply(&self, value: &Value) -> Option<Value> {
        match self {
            Constraint::Builtin(spec) => match spec.apply(value) {
                RuleOutcome::Pass(v) => Some(v),
                // An unnamed builtin cannot be validated, so it rejects.
                RuleOutcome::Reject | RuleOutcome::Unknown => None,
            },
            Constraint::Custom { func, .. } => func(value),
        }
    }
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::Builtin(spec) => write!(f, "Constraint::Builtin({:?})", spec),
            Constraint::Custom { name, .. } => write!(f, "Constraint::Custom({name})"),
        }
    }
}

/// Runs a cell's whole chain in attachment order. The first rejection
/// wins; otherwise each constraint sees the previous one's output.
pub fn apply_chain(constraints: &[Constraint], value: &Value) -> Option<Value> {
    let mut current = value.clone();
    for constraint in constraints {
        current = constraint.apply(&current)?;
    }
    Some(current)
}

/// The distributable rule list for one cell: builtin specs in order,
/// customs skipped.
pub fn shared_specs(constraints: &[Constraint]) -> Vec<RuleSpec> {
    constraints
        .iter()
        .filter_map(|c| c.spec().cloned())
        .collect()
}
