//! Per-client update queues and the tick-time flush.
//!
//! Nothing is written to a connection when state changes. Every
//! mutation appends addressed updates to an outbox, the scheduler files
//! them into one ordered queue per client, and once per tick each
//! non-empty queue is compacted, encoded into a single batch payload
//! and handed to the transport. A client whose socket is still draining
//! keeps its queue for the next tick instead of losing updates.

use crate::transport::Transport;
use crate::tree::Outbox;
use log::{debug, trace};
use shared::codec;
use shared::update::Update;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct ClientQueue {
    pending: Vec<Update>,
    network_issues: u64,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    queues: BTreeMap<String, ClientQueue>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client(&mut self, client: &str) {
        self.queues.insert(client.to_string(), ClientQueue::default());
    }

    /// Drops the queue outright; a disconnected client's pending
    /// updates are never flushed.
    pub fn remove_client(&mut self, client: &str) {
        self.queues.remove(client);
    }

    /// Appends an update to a client's queue. A full snapshot clears
    /// whatever was pending first, since the snapshot already reflects
    /// it. Updates addressed to unknown clients are dropped.
    pub fn enqueue(&mut self, client: &str, update: Update) {
        if let Some(queue) = self.queues.get_mut(client) {
            if matches!(update, Update::Initialize { .. }) {
                queue.pending.clear();
            }
            queue.pending.push(update);
        }
    }

    pub fn enqueue_outbox(&mut self, outbox: Outbox) {
        for (client, update) in outbox {
            self.enqueue(&client, update);
        }
    }

    pub fn pending_count(&self, client: &str) -> usize {
        self.queues.get(client).map(|q| q.pending.len()).unwrap_or(0)
    }

    /// Times a backpressure skip happened for this client so far.
    pub fn network_issues(&self, client: &str) -> u64 {
        self.queues.get(client).map(|q| q.network_issues).unwrap_or(0)
    }

    /// One broadcast pass: compact, check backpressure, encode, send.
    pub fn flush(&mut self, transport: &dyn Transport, high_water: usize) {
        for (client, queue) in self.queues.iter_mut() {
            if queue.pending.is_empty() {
                continue;
            }
            let compacted = compact(std::mem::take(&mut queue.pending));
            if compacted.is_empty() {
                continue;
            }
            if transport.buffered_amount(client) > high_water {
                queue.network_issues += 1;
                debug!(
                    "Backpressure on {}: holding {} updates for next tick",
                    client,
                    compacted.len()
                );
                queue.pending = compacted;
                continue;
            }
            trace!("Flushing {} updates to {}", compacted.len(), client);
            transport.send(client, codec::encode_batch(&compacted));
        }
    }
}

/// Collapses a queue without changing what the receiving mirror ends up
/// with.
///
/// Rules, applied in one forward pass:
/// - everything before the latest `Initialize` is superseded by it;
/// - per path, only the newest edit survives, at its latest position;
/// - a tombstone that cancels a queued value edit erases both, while a
///   tombstone with nothing to cancel flows through (the mirror may
///   hold the branch from an earlier flush);
/// - `SelfProperty` collapses per property name, except constraint
///   tables, which collapse per cell;
/// - a `Shift` fences the list and every path under it, because edits
///   on the two sides of a reindexing mean different slots;
/// - connection notices and messages keep their relative order after
///   the collapsed block.
pub fn compact(queue: Vec<Update>) -> Vec<Update> {
    let start = queue
        .iter()
        .rposition(|u| matches!(u, Update::Initialize { .. }))
        .unwrap_or(0);

    let mut slots: Vec<Option<Update>> = Vec::new();
    let mut trailing: Vec<Update> = Vec::new();
    let mut last_edit: HashMap<Vec<String>, usize> = HashMap::new();
    let mut last_prop: HashMap<String, usize> = HashMap::new();

    for update in queue.into_iter().skip(start) {
        match update {
            Update::Edit { path, value } => {
                let erased_value = match last_edit.remove(&path) {
                    Some(slot) => {
                        let was_value = matches!(
                            &slots[slot],
                            Some(Update::Edit { value, .. }) if !value.is_absent()
                        );
                        slots[slot] = None;
                        was_value
                    }
                    None => false,
                };
                if value.is_absent() && erased_value {
                    continue;
                }
                last_edit.insert(path.clone(), slots.len());
                slots.push(Some(Update::Edit { path, value }));
            }
            Update::Shift { path, from, delta } => {
                last_edit.retain(|p, _| !p.starts_with(&path));
                slots.push(Some(Update::Shift { path, from, delta }));
            }
            Update::SelfProperty { property, data } => {
                // Constraint tables are per cell and must not collapse
                // across cells; their data carries the cell path.
                let key = match data.get("path") {
                    Some(path) => format!("{}@{}", property, path),
                    None => property.clone(),
                };
                if let Some(slot) = last_prop.remove(&key) {
                    slots[slot] = None;
                }
                last_prop.insert(key, slots.len());
                slots.push(Some(Update::SelfProperty { property, data }));
            }
            update @ Update::Initialize { .. } => {
                slots.push(Some(update));
            }
            other => trailing.push(other),
        }
    }

    let mut result: Vec<Update> = slots.into_iter().flatten().collect();
    result.extend(trailing);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use shared::update::WireValue;

    fn p(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    fn edit(path: &[&str], value: serde_json::Value) -> Update {
        Update::Edit {
            path: p(path),
            value: WireValue::Json(value),
        }
    }

    fn tombstone(path: &[&str]) -> Update {
        Update::Edit {
            path: p(path),
            value: WireValue::Absent,
        }
    }

    #[test]
    fn last_write_wins_at_latest_position() {
        let compacted = compact(vec![
            edit(&["a", "p"], json!(1)),
            edit(&["a", "q"], json!(2)),
            edit(&["a", "p"], json!(3)),
        ]);
        assert_eq!(
            compacted,
            vec![edit(&["a", "q"], json!(2)), edit(&["a", "p"], json!(3))]
        );
    }

    #[test]
    fn tombstone_cancels_queued_edit() {
        assert_eq!(
            compact(vec![edit(&["a", "p"], json!(1)), tombstone(&["a", "p"])]),
            vec![]
        );
    }

    #[test]
    fn lone_tombstone_flows_through() {
        assert_eq!(
            compact(vec![tombstone(&["a", "p"])]),
            vec![tombstone(&["a", "p"])]
        );
        // Duplicates collapse to one.
        assert_eq!(
            compact(vec![tombstone(&["a", "p"]), tombstone(&["a", "p"])]),
            vec![tombstone(&["a", "p"])]
        );
    }

    #[test]
    fn edit_after_cancellation_survives() {
        let compacted = compact(vec![
            edit(&["a", "p"], json!(1)),
            tombstone(&["a", "p"]),
            edit(&["a", "p"], json!(2)),
        ]);
        assert_eq!(compacted, vec![edit(&["a", "p"], json!(2))]);
    }

    #[test]
    fn shift_fences_paths_under_the_list() {
        let shift = Update::Shift {
            path: p(&["a", "xs"]),
            from: 0,
            delta: 1,
        };
        let compacted = compact(vec![
            edit(&["a", "xs", "0"], json!("old")),
            edit(&["a", "other"], json!(1)),
            shift.clone(),
            edit(&["a", "xs", "0"], json!("new")),
        ]);
        // Same index, different slots; both edits must survive around
        // the shift. The unrelated path still collapses normally.
        assert_eq!(
            compacted,
            vec![
                edit(&["a", "xs", "0"], json!("old")),
                edit(&["a", "other"], json!(1)),
                shift,
                edit(&["a", "xs", "0"], json!("new")),
            ]
        );
    }

    #[test]
    fn edits_collapse_when_no_shift_intervenes() {
        let compacted = compact(vec![
            edit(&["a", "xs", "0"], json!("old")),
            edit(&["a", "xs", "0"], json!("new")),
        ]);
        assert_eq!(compacted, vec![edit(&["a", "xs", "0"], json!("new"))]);
    }

    #[test]
    fn self_property_collapses_per_name() {
        let compacted = compact(vec![
            Update::SelfProperty {
                property: "space".to_string(),
                data: json!("lobby"),
            },
            Update::SelfProperty {
                property: "controller".to_string(),
                data: json!(["keys"]),
            },
            Update::SelfProperty {
                property: "space".to_string(),
                data: json!("arena"),
            },
        ]);
        assert_eq!(
            compacted,
            vec![
                Update::SelfProperty {
                    property: "controller".to_string(),
                    data: json!(["keys"]),
                },
                Update::SelfProperty {
                    property: "space".to_string(),
                    data: json!("arena"),
                },
            ]
        );
    }

    #[test]
    fn constraint_tables_survive_for_every_cell() {
        let table = |cell: &str, rule: &str| Update::SelfProperty {
            property: "constraint".to_string(),
            data: json!({"path": ["me", cell], "rules": [{"name": rule, "args": []}]}),
        };
        let compacted = compact(vec![
            table("hp", "int"),
            table("name", "ban"),
            table("hp", "min"),
        ]);
        assert_eq!(compacted, vec![table("name", "ban"), table("hp", "min")]);
    }

    #[test]
    fn notices_trail_in_original_order() {
        let compacted = compact(vec![
            Update::Connect {
                id: "new".to_string(),
                snapshot: json!({}),
            },
            edit(&["a", "p"], json!(1)),
            Update::Response {
                name: "ping".to_string(),
                payload: json!(1),
            },
            Update::Disconnect {
                id: "old".to_string(),
            },
            edit(&["a", "p"], json!(2)),
        ]);
        assert_eq!(
            compacted,
            vec![
                edit(&["a", "p"], json!(2)),
                Update::Connect {
                    id: "new".to_string(),
                    snapshot: json!({}),
                },
                Update::Response {
                    name: "ping".to_string(),
                    payload: json!(1),
                },
                Update::Disconnect {
                    id: "old".to_string(),
                },
            ]
        );
    }

    fn initialize(marker: u32) -> Update {
        Update::Initialize {
            self_id: "me".to_string(),
            tick_rate: marker,
            constraints: json!([]),
            clients: json!({}),
            teams: json!({}),
            space: None,
        }
    }

    #[test]
    fn initialize_discards_everything_before_it() {
        let compacted = compact(vec![
            edit(&["a", "p"], json!(1)),
            initialize(1),
            edit(&["a", "p"], json!(2)),
            initialize(2),
            edit(&["a", "q"], json!(3)),
        ]);
        assert_eq!(compacted, vec![initialize(2), edit(&["a", "q"], json!(3))]);
    }

    #[test]
    fn enqueueing_initialize_clears_the_queue() {
        let mut scheduler = Scheduler::new();
        scheduler.add_client("c");
        scheduler.enqueue("c", edit(&["a", "p"], json!(1)));
        scheduler.enqueue("c", initialize(1));
        scheduler.enqueue("c", edit(&["a", "q"], json!(2)));
        assert_eq!(scheduler.pending_count("c"), 2);
    }

    #[test]
    fn flush_sends_one_batch_per_client() {
        let mut scheduler = Scheduler::new();
        scheduler.add_client("c");
        scheduler.enqueue("c", edit(&["a", "p"], json!(1)));
        scheduler.enqueue("c", edit(&["a", "q"], json!(2)));

        let transport = MemoryTransport::new();
        scheduler.flush(&transport, 64 * 1024);

        let payloads = transport.payloads_to("c");
        assert_eq!(payloads.len(), 1);
        let units: Vec<Update> = shared::decode_batch(&payloads[0])
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(units, vec![edit(&["a", "p"], json!(1)), edit(&["a", "q"], json!(2))]);
        assert_eq!(scheduler.pending_count("c"), 0);

        // Nothing pending, nothing sent.
        scheduler.flush(&transport, 64 * 1024);
        assert_eq!(transport.payloads_to("c").len(), 1);
    }

    #[test]
    fn backpressure_holds_the_queue_intact() {
        let mut scheduler = Scheduler::new();
        scheduler.add_client("c");
        scheduler.enqueue("c", edit(&["a", "p"], json!(1)));
        scheduler.enqueue("c", edit(&["a", "p"], json!(2)));

        let transport = MemoryTransport::new();
        transport.set_buffered("c", 1_000_000);
        scheduler.flush(&transport, 1024);

        assert!(transport.payloads_to("c").is_empty());
        assert_eq!(scheduler.network_issues("c"), 1);
        // Already compacted while held.
        assert_eq!(scheduler.pending_count("c"), 1);

        transport.set_buffered("c", 0);
        scheduler.flush(&transport, 1024);
        let payloads = transport.payloads_to("c");
        assert_eq!(payloads.len(), 1);
        let units: Vec<Update> = shared::decode_batch(&payloads[0])
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(units, vec![edit(&["a", "p"], json!(2))]);
        assert_eq!(scheduler.network_issues("c"), 1);
    }

    #[test]
    fn removed_clients_lose_their_queue() {
        let mut scheduler = Scheduler::new();
        scheduler.add_client("c");
        scheduler.enqueue("c", edit(&["a", "p"], json!(1)));
        scheduler.remove_client("c");
        scheduler.enqueue("c", edit(&["a", "p"], json!(2)));

        let transport = MemoryTransport::new();
        scheduler.flush(&transport, 1024);
        assert!(transport.payloads_to("c").is_empty());
    }
}
