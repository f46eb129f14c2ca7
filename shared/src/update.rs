use serde_json::Value;

/// A value carried by an [`Update::Edit`].
///
/// The wire format has to tell "the value is JSON `null`" apart from
/// "there is no value here anymore": a tombstone edit instructs the
/// receiver to purge its local copy of the path, while a `null` edit
/// stores a real null. `Absent` is also used for optional update fields
/// such as the active space in [`Update::Initialize`].
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Json(Value),
    Absent,
}

impl WireValue {
    pub fn is_absent(&self) -> bool {
        matches!(self, WireValue::Absent)
    }

    /// The carried JSON value, if any.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            WireValue::Json(v) => Some(v),
            WireValue::Absent => None,
        }
    }
}

impl From<Value> for WireValue {
    fn from(v: Value) -> Self {
        WireValue::Json(v)
    }
}

/// One wire message between server and client.
///
/// Every variant encodes to exactly one self-contained unit; a tick's
/// flush is a batch of such units sent together.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// A differential write at `path`. `WireValue::Absent` removes the
    /// node; anything else replaces its value.
    Edit { path: Vec<String>, value: WireValue },
    /// Compact reindex instruction for a list: move the cached elements
    /// at `from..` by `delta` before applying any later per-index edits
    /// from the same batch. `delta == 0` is reserved for "reverse the
    /// elements starting at `from`" since a real shift always moves.
    Shift {
        path: Vec<String>,
        from: usize,
        delta: i64,
    },
    /// A property of the receiving client itself (controller listen
    /// set, assigned id, constraint-table delta, active space). Only
    /// ever sent to the client that owns the property.
    SelfProperty { property: String, data: Value },
    /// Another client joined, with its snapshot as visible to the
    /// receiver.
    Connect { id: String, snapshot: Value },
    /// Another client left; the receiver purges everything under `id`.
    Disconnect { id: String },
    /// A named message, used in both directions: client requests and
    /// server replies correlate by `name`.
    Response { name: String, payload: Value },
    /// Full snapshot sent exactly once, at connection time. Supersedes
    /// anything else queued for the receiver.
    Initialize {
        self_id: String,
        tick_rate: u32,
        constraints: Value,
        clients: Value,
        teams: Value,
        space: Option<String>,
    },
}

impl Update {
    /// Edits and self-properties collapse during compaction; shifts
    /// order-depend on them; everything else passes through untouched.
    pub fn is_collapsible(&self) -> bool {
        matches!(
            self,
            Update::Edit { .. } | Update::Shift { .. } | Update::SelfProperty { .. }
        )
    }
}
