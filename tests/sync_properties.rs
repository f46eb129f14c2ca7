//! Server-to-mirror convergence tests
//!
//! Every test here runs the authoritative engine on one side and a
//! client mirror on the other, shuttling real wire payloads between
//! them, and asserts that the mirror ends up byte-for-byte where the
//! server is.

use client::mirror::Mirror;
use client::predict;
use serde_json::{json, Value};
use server::constraint::Constraint;
use server::engine::{Engine, EngineConfig};
use server::transport::MemoryTransport;
use shared::update::{Update, WireValue};
use std::sync::Arc;

/// LIST REPLICATION TESTS
mod list_replication_tests {
    use super::*;

    /// Tests that an unshift costs one shift plus one edit on the wire,
    /// never an edit per displaced element.
    #[test]
    fn unshift_travels_as_one_shift_and_one_edit() {
        let (mut engine, transport) = new_engine();
        let id = engine.client_connected();
        let items = path(&[&id, "items"]);
        engine.set(&items, json!([1, 2, 3])).unwrap();
        engine.tick();
        let mut mirror = drained_mirror(&transport, &id);
        assert_eq!(mirror.value(&items), Some(&json!([1, 2, 3])));

        engine.list_unshift(&items, json!(9)).unwrap();
        engine.tick();

        let payloads = transport.take_payloads(&id);
        assert_eq!(payloads.len(), 1);
        let units: Vec<Update> = shared::decode_batch(&payloads[0])
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            units,
            vec![
                Update::Shift {
                    path: items.clone(),
                    from: 0,
                    delta: 1,
                },
                Update::Edit {
                    path: path(&[&id, "items", "0"]),
                    value: WireValue::Json(json!(9)),
                },
            ]
        );

        mirror.apply_payload(&payloads[0]);
        assert_eq!(mirror.value(&items), Some(&server_list(&engine, &items)));
    }

    /// Tests that a splice leaves the mirror exactly where the server
    /// is, with the removed values reported back.
    #[test]
    fn splice_keeps_the_mirror_exact() {
        let (mut engine, transport) = new_engine();
        let id = engine.client_connected();
        let items = path(&[&id, "items"]);
        engine.set(&items, json!([1, 2, 3, 4, 5])).unwrap();
        engine.tick();
        let mut mirror = drained_mirror(&transport, &id);

        let removed = engine.list_splice(&items, 1, 2, vec![json!(9)]).unwrap();
        assert_eq!(removed, vec![json!(2), json!(3)]);
        engine.tick();
        sync(&mut mirror, &transport, &id);

        assert_eq!(engine.list_values(&items).unwrap(), vec![json!(1), json!(9), json!(4), json!(5)]);
        assert_eq!(mirror.value(&items), Some(&server_list(&engine, &items)));
    }

    /// Tests the two wire forms real splices never produce: the
    /// zero-delta reversal and the length edit.
    #[test]
    fn reverse_and_truncate_converge() {
        let (mut engine, transport) = new_engine();
        let id = engine.client_connected();
        let items = path(&[&id, "items"]);
        engine.set(&items, json!(["a", "b", "c", "d"])).unwrap();
        engine.tick();
        let mut mirror = drained_mirror(&transport, &id);

        engine.list_reverse(&items).unwrap();
        engine.tick();
        sync(&mut mirror, &transport, &id);
        assert_eq!(mirror.value(&items), Some(&json!(["d", "c", "b", "a"])));

        engine.list_truncate(&items, 2).unwrap();
        engine.tick();
        sync(&mut mirror, &transport, &id);
        assert_eq!(mirror.value(&items), Some(&json!(["d", "c"])));
        assert_eq!(mirror.value(&items), Some(&server_list(&engine, &items)));
    }

    /// Tests that a tick full of redundant churn compacts on the wire
    /// yet lands the mirror on the same final state.
    #[test]
    fn a_busy_tick_compacts_without_changing_the_outcome() {
        let (mut engine, transport) = new_engine();
        let id = engine.client_connected();
        let items = path(&[&id, "items"]);
        let label = path(&[&id, "label"]);
        engine.tick();
        let mut mirror = drained_mirror(&transport, &id);

        let mut issued = 0;
        for n in 0..8 {
            engine.set(&label, json!(format!("round {}", n))).unwrap();
            issued += 1;
        }
        engine.set(&items, json!([1, 2])).unwrap();
        issued += 1;
        engine.list_push(&items, json!(3)).unwrap();
        issued += 1;
        engine.list_shift(&items).unwrap();
        issued += 1;

        engine.tick();
        let payloads = transport.take_payloads(&id);
        assert_eq!(payloads.len(), 1);
        assert!(shared::decode_batch(&payloads[0]).len() < issued);

        mirror.apply_payload(&payloads[0]);
        assert_eq!(mirror.value(&label), Some(&json!("round 7")));
        assert_eq!(mirror.value(&items), Some(&server_list(&engine, &items)));
    }
}

/// PARTIAL VISIBILITY TESTS
mod visibility_tests {
    use super::*;

    /// Tests that a viewer granted one list element keeps that element
    /// at the right index through a reindexing, padded with nulls for
    /// everything it cannot see.
    #[test]
    fn granted_elements_stay_index_aligned() {
        let (mut engine, transport) = new_engine();
        let owner = engine.client_connected();
        let viewer = engine.client_connected();
        let items = path(&[&owner, "items"]);
        engine.set(&items, json!([10, 20, 30])).unwrap();
        engine
            .add_public(&path(&[&owner, "items", "1"]), &viewer)
            .unwrap();
        engine.tick();

        let mut mirror = drained_mirror(&transport, &viewer);
        assert_eq!(mirror.value(&items), Some(&json!([null, 20])));

        engine.list_unshift(&items, json!(5)).unwrap();
        engine.tick();
        sync(&mut mirror, &transport, &viewer);

        assert_eq!(mirror.value(&items), Some(&json!([null, null, 20])));
        assert_eq!(
            engine.list_values(&items).unwrap(),
            vec![json!(5), json!(10), json!(20), json!(30)]
        );
    }

    /// Tests that splicing out an element a viewer could only see
    /// individually tells that viewer the element is gone.
    #[test]
    fn splices_purge_viewers_of_removed_elements() {
        let (mut engine, transport) = new_engine();
        let owner = engine.client_connected();
        let viewer = engine.client_connected();
        let items = path(&[&owner, "items"]);
        engine.set(&items, json!([10, 20, 30])).unwrap();
        engine
            .add_public(&path(&[&owner, "items", "1"]), &viewer)
            .unwrap();
        engine.tick();
        let mut mirror = drained_mirror(&transport, &viewer);
        assert_eq!(mirror.value(&items), Some(&json!([null, 20])));

        engine.list_splice(&items, 1, 1, vec![]).unwrap();
        engine.tick();
        sync(&mut mirror, &transport, &viewer);

        // The viewer is outside the shift audience; the removal arrives
        // as a tombstone for the element itself.
        assert_eq!(mirror.value(&path(&[&owner, "items", "1"])), None);
        assert_eq!(mirror.value(&items), Some(&json!([null])));
        assert_eq!(
            engine.list_values(&items).unwrap(),
            vec![json!(10), json!(30)]
        );
    }

    /// Tests that welcome snapshots carry grants made before the
    /// connection, filtered per viewer.
    #[test]
    fn initialize_snapshots_are_filtered_per_viewer() {
        let (mut engine, transport) = new_engine();
        let owner = engine.client_connected();
        let viewer = engine.client_connected();
        let gold = path(&[&owner, "gold"]);
        engine.set(&gold, json!(100)).unwrap();
        engine.add_public(&gold, &viewer).unwrap();

        let late = engine.client_connected();
        engine.tick();

        let viewer_mirror = drained_mirror(&transport, &viewer);
        assert_eq!(viewer_mirror.value(&gold), Some(&json!(100)));

        let late_mirror = drained_mirror(&transport, &late);
        assert_eq!(late_mirror.value(&gold), None);
        assert_eq!(late_mirror.value(&path(&[&owner])), Some(&json!({})));
    }
}

/// PREDICTION TESTS
mod prediction_tests {
    use super::*;

    /// Tests that a mirror holding the distributed rules predicts the
    /// exact value the server will come back with.
    #[test]
    fn local_prediction_matches_the_server_echo() {
        let (mut engine, transport) = new_engine();
        let id = engine.client_connected();
        let power = path(&[&id, "power"]);
        engine.set(&power, json!(0)).unwrap();
        engine.add_constraint(&power, Constraint::int()).unwrap();
        engine.add_constraint(&power, Constraint::max(3.0)).unwrap();
        engine.tick();
        let mut mirror = drained_mirror(&transport, &id);
        assert!(mirror.rules_for(&power).is_some());

        let sent = json!(7.9);
        let predicted = predict::apply_optimistic(&mut mirror, &power, &sent).unwrap();
        assert_eq!(predicted, json!(3));
        assert_eq!(mirror.value(&power), Some(&json!(3)));

        // The client ships the original value; the server's echo must
        // agree with what the mirror already shows.
        let raw = shared::encode(&Update::Edit {
            path: power.clone(),
            value: WireValue::Json(sent),
        });
        engine.handle_message(&id, &raw);
        engine.tick();
        sync(&mut mirror, &transport, &id);

        assert_eq!(engine.get(&power), Some(json!(3)));
        assert_eq!(mirror.value(&power), Some(&json!(3)));
    }

    /// Tests that a mirror without the server's private rules applies
    /// optimistically, then settles on the corrective edit.
    #[test]
    fn stale_mirrors_settle_on_the_corrective_edit() {
        let (mut engine, transport) = new_engine();
        let id = engine.client_connected();
        let word = path(&[&id, "word"]);
        engine.set(&word, json!("ok")).unwrap();
        engine
            .add_constraint(
                &word,
                Constraint::custom("short", |v| {
                    v.as_str().filter(|s| s.len() <= 3).map(|_| v.clone())
                }),
            )
            .unwrap();
        engine.tick();
        let mut mirror = drained_mirror(&transport, &id);

        // Custom rules never reach the mirror, so the write looks fine
        // locally.
        assert!(mirror.rules_for(&word).is_none());
        let sent = json!("toolong");
        assert_eq!(
            predict::apply_optimistic(&mut mirror, &word, &sent),
            Some(sent.clone())
        );
        assert_eq!(mirror.value(&word), Some(&json!("toolong")));

        let raw = shared::encode(&Update::Edit {
            path: word.clone(),
            value: WireValue::Json(sent),
        });
        engine.handle_message(&id, &raw);
        engine.tick();
        sync(&mut mirror, &transport, &id);

        assert_eq!(engine.get(&word), Some(json!("ok")));
        assert_eq!(mirror.value(&word), Some(&json!("ok")));
    }
}

fn new_engine() -> (Engine, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let engine = Engine::new(EngineConfig::default(), Arc::clone(&transport) as Arc<_>);
    (engine, transport)
}

fn path(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| s.to_string()).collect()
}

/// Feeds every pending payload for `id` into `mirror`.
fn sync(mirror: &mut Mirror, transport: &MemoryTransport, id: &str) {
    for payload in transport.take_payloads(id) {
        mirror.apply_payload(&payload);
    }
}

/// A fresh mirror caught up with everything queued for `id` so far.
fn drained_mirror(transport: &MemoryTransport, id: &str) -> Mirror {
    let mut mirror = Mirror::new();
    sync(&mut mirror, transport, id);
    mirror
}

/// The server's current list value, shaped for comparison against a
/// mirror.
fn server_list(engine: &Engine, path: &[String]) -> Value {
    Value::Array(engine.list_values(path).unwrap())
}
