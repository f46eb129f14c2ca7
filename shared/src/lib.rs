pub mod codec;
pub mod rules;
pub mod update;

pub use codec::{decode, decode_batch, encode, encode_batch, DecodeError};
pub use rules::{run_chain, CellRules, RuleOutcome, RuleSpec};
pub use update::{Update, WireValue};

/// Default broadcast rate in ticks per second.
pub const DEFAULT_TICK_RATE: u32 = 30;

/// Self-property names understood by both ends of a connection.
pub const PROP_CONTROLLER: &str = "controller";
pub const PROP_ID: &str = "id";
pub const PROP_CONSTRAINT: &str = "constraint";
pub const PROP_SPACE: &str = "space";

/// Reserved key addressing a list's derived length.
pub const LENGTH_KEY: &str = "length";
