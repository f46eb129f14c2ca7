//! Local constraint prediction. The server distributes the shareable
//! rules of every cell this client owns or co-owns; running a write
//! through them before sending shows the value the server will store,
//! or that it will refuse. Server-only custom constraints are not in
//! the table, so the server's echo stays authoritative.

use crate::mirror::Mirror;
use serde_json::Value;
use shared::run_chain;
use shared::update::{Update, WireValue};

/// The value the server is expected to store for this write, or `None`
/// when the known rules reject it outright.
pub fn predict(mirror: &Mirror, path: &[String], value: &Value) -> Option<Value> {
    match mirror.rules_for(path) {
        Some(rules) => run_chain(rules, value),
        None => Some(value.clone()),
    }
}

/// Applies the predicted outcome to the mirror ahead of the server's
/// echo. Returns the applied value, or `None` when the write would be
/// rejected and nothing was changed.
pub fn apply_optimistic(mirror: &mut Mirror, path: &[String], value: &Value) -> Option<Value> {
    let predicted = predict(mirror, path, value)?;
    mirror.apply(Update::Edit {
        path: path.to_vec(),
        value: WireValue::Json(predicted.clone()),
    });
    Some(predicted)
}
