//! End-to-end client scenarios: snapshots, restricted deltas, permission
//! changes, dedup, reset.

use std::sync::Arc;
use std::time::Duration;

use plenum::autoupdate::{AutoupdateLoop, Frame};
use plenum::config::Config;
use plenum::core::{ChangeId, Key, Shutdown, UserId};
use plenum::run::{Service, build_service};
use plenum::test_harness::{ScriptedFeed, VecSink};

const WAIT: Duration = Duration::from_secs(5);

/// Groups: 1 default (can_see), 2 admin, 20 internal viewers, 21 name
/// viewers. Users: 5 plain, 6 internal viewer, 9 admin.
const BASE: &[(&str, &str)] = &[
    (
        "users/group:1",
        r#"{"id":1,"permissions":["agenda.can_see"]}"#,
    ),
    ("users/group:2", r#"{"id":2,"permissions":[]}"#),
    (
        "users/group:20",
        r#"{"id":20,"permissions":["agenda.can_see_internal_items"]}"#,
    ),
    (
        "users/group:21",
        r#"{"id":21,"permissions":["users.can_see_name"]}"#,
    ),
    ("users/user:5", r#"{"id":5,"groups_id":[1]}"#),
    ("users/user:6", r#"{"id":6,"groups_id":[1,20]}"#),
    ("users/user:9", r#"{"id":9,"groups_id":[2]}"#),
];

fn service_with(elements: &[(&str, &str)], max: u64, min: u64) -> (Arc<ScriptedFeed>, Service) {
    let feed = Arc::new(ScriptedFeed::new());
    let mut all = BASE.to_vec();
    all.extend_from_slice(elements);
    feed.set_full_data(&all, max, min);
    let service = build_service(Box::new(Arc::clone(&feed)), &Config::default())
        .expect("bootstrap from scripted feed");
    (feed, service)
}

fn connect(service: &Service, uid: UserId, change_id: ChangeId, shutdown: &Shutdown) -> VecSink {
    let sink = VecSink::new();
    let mut autoupdate = AutoupdateLoop::new(
        Arc::clone(&service.datastore),
        Arc::clone(&service.restricter),
        uid,
        change_id,
        sink.clone(),
    );
    let shutdown = shutdown.clone();
    std::thread::spawn(move || {
        let _ = autoupdate.run(&shutdown);
    });
    sink
}

/// Run one receive-task step: block for the next batch and fan it out.
fn step(service: &Service, shutdown: &Shutdown) {
    let outcome = service.datastore.keys_changed(shutdown).unwrap();
    service.datastore.notify(&outcome);
}

fn key(raw: &str) -> Key {
    Key::parse(raw).unwrap()
}

fn value(frame: &Frame, raw_key: &str) -> Option<serde_json::Value> {
    frame
        .changed
        .get(&key(raw_key))
        .and_then(|value| value.as_ref())
        .map(|raw| serde_json::from_str(raw.get()).unwrap())
}

#[test]
fn bootstrap_snapshot_then_tick() {
    let (feed, service) = service_with(&[("agenda/item:1", r#"{"id":1,"title":"One"}"#)], 5, 1);
    let shutdown = Shutdown::new();
    let sink = connect(&service, 5, 0, &shutdown);

    let frames = sink.wait_for_frames(1, WAIT);
    assert_eq!(frames.len(), 1);
    assert!(frames[0].all_data);
    assert_eq!(frames[0].change_id, 5);
    assert_eq!(value(&frames[0], "agenda/item:1").unwrap()["title"], "One");

    feed.push_update(6, &[("agenda/item:1", Some(r#"{"id":1,"title":"One b"}"#))]);
    step(&service, &shutdown);

    let frames = sink.wait_for_frames(2, WAIT);
    assert_eq!(frames.len(), 2);
    assert!(!frames[1].all_data);
    assert_eq!(frames[1].change_id, 6);
    assert_eq!(value(&frames[1], "agenda/item:1").unwrap()["title"], "One b");

    shutdown.trigger();
}

#[test]
fn snapshot_strips_fields_the_viewer_may_not_see() {
    let item = r#"{"id":7,"title":"Report","comment":"x","duration":30}"#;
    let (_feed, service) = service_with(&[("agenda/item:7", item)], 5, 1);
    let shutdown = Shutdown::new();

    // Plain viewer: comment and duration are stripped.
    let sink = connect(&service, 5, 0, &shutdown);
    let frames = sink.wait_for_frames(1, WAIT);
    let element = value(&frames[0], "agenda/item:7").unwrap();
    assert_eq!(element["title"], "Report");
    assert!(element.get("comment").is_none());
    assert!(element.get("duration").is_none());

    // Internal viewer keeps duration but not comment.
    let sink = connect(&service, 6, 0, &shutdown);
    let frames = sink.wait_for_frames(1, WAIT);
    let element = value(&frames[0], "agenda/item:7").unwrap();
    assert_eq!(element["duration"], 30);
    assert!(element.get("comment").is_none());

    // Admins see the element verbatim.
    let sink = connect(&service, 9, 0, &shutdown);
    let frames = sink.wait_for_frames(1, WAIT);
    let element = value(&frames[0], "agenda/item:7").unwrap();
    assert_eq!(element["comment"], "x");

    shutdown.trigger();
}

#[test]
fn internal_items_are_invisible_without_the_permission() {
    let item = r#"{"id":7,"title":"Internal","is_internal":true}"#;
    let (_feed, service) = service_with(&[("agenda/item:7", item)], 5, 1);
    let shutdown = Shutdown::new();

    let sink = connect(&service, 5, 0, &shutdown);
    let frames = sink.wait_for_frames(1, WAIT);
    assert!(!frames[0].changed.contains_key(&key("agenda/item:7")));

    let sink = connect(&service, 6, 0, &shutdown);
    let frames = sink.wait_for_frames(1, WAIT);
    assert!(frames[0].changed.contains_key(&key("agenda/item:7")));

    shutdown.trigger();
}

#[test]
fn permission_revocation_tombstones_unchanged_keys() {
    let item = r#"{"id":7,"title":"Internal","is_internal":true}"#;
    let (feed, service) = service_with(&[("agenda/item:7", item)], 5, 1);
    let shutdown = Shutdown::new();

    let sink = connect(&service, 6, 0, &shutdown);
    let frames = sink.wait_for_frames(1, WAIT);
    assert!(frames[0].changed.contains_key(&key("agenda/item:7")));

    // Revoke the internal-items group. The agenda item itself is not part
    // of the batch, yet the viewer must lose it.
    feed.push_update(6, &[("users/user:6", Some(r#"{"id":6,"groups_id":[1]}"#))]);
    step(&service, &shutdown);

    let frames = sink.wait_for_frames(2, WAIT);
    let frame = &frames[1];
    assert!(!frame.all_data);
    assert!(frame.tombstones(&key("agenda/item:7")));

    shutdown.trigger();
}

#[test]
fn byte_identical_updates_are_deduplicated() {
    let (feed, service) = service_with(&[("agenda/item:1", r#"{"id":1,"title":"One"}"#)], 5, 1);
    let shutdown = Shutdown::new();
    let sink = connect(&service, 5, 0, &shutdown);
    sink.wait_for_frames(1, WAIT);

    // Same bytes again: nothing to tell the client.
    feed.push_update(6, &[("agenda/item:1", Some(r#"{"id":1,"title":"One"}"#))]);
    step(&service, &shutdown);
    // A real change afterwards still arrives, and nothing was emitted for
    // the no-op batch.
    feed.push_update(7, &[("agenda/item:1", Some(r#"{"id":1,"title":"Two"}"#))]);
    step(&service, &shutdown);

    let frames = sink.wait_for_frames(2, WAIT);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].change_id, 7);

    shutdown.trigger();
}

#[test]
fn deleted_key_reaches_the_client_as_tombstone() {
    let (feed, service) = service_with(&[("agenda/item:1", r#"{"id":1,"title":"One"}"#)], 5, 1);
    let shutdown = Shutdown::new();
    let sink = connect(&service, 5, 0, &shutdown);
    sink.wait_for_frames(1, WAIT);

    feed.push_update(6, &[("agenda/item:1", None)]);
    step(&service, &shutdown);

    let frames = sink.wait_for_frames(2, WAIT);
    assert!(frames[1].tombstones(&key("agenda/item:1")));

    // Recreated under the same id: the client sees the value again.
    feed.push_update(7, &[("agenda/item:1", Some(r#"{"id":1,"title":"Back"}"#))]);
    step(&service, &shutdown);
    let frames = sink.wait_for_frames(3, WAIT);
    assert_eq!(value(&frames[2], "agenda/item:1").unwrap()["title"], "Back");

    shutdown.trigger();
}

#[test]
fn required_user_becomes_visible_with_minimal_fields() {
    let user = r#"{"id":8,"username":"mk","first_name":"Mina","email":"mk@example.org"}"#;
    let (feed, service) = service_with(&[("users/user:8", user)], 5, 1);
    let shutdown = Shutdown::new();
    let sink = connect(&service, 5, 0, &shutdown);

    let frames = sink.wait_for_frames(1, WAIT);
    assert!(!frames[0].changed.contains_key(&key("users/user:8")));

    // A new motion names user 8 as submitter; viewer 5 cannot see the
    // motion but must now see the minimal user record.
    feed.push_update(
        6,
        &[(
            "motions/motion:1",
            Some(r#"{"id":1,"title":"M","submitters":[{"user_id":8}]}"#),
        )],
    );
    step(&service, &shutdown);

    let frames = sink.wait_for_frames(2, WAIT);
    let frame = &frames[1];
    assert!(!frame.changed.contains_key(&key("motions/motion:1")));
    let element = value(frame, "users/user:8").unwrap();
    assert_eq!(element["first_name"], "Mina");
    assert!(element.get("username").is_none());
    assert!(element.get("email").is_none());

    shutdown.trigger();
}

#[test]
fn reset_resends_a_full_snapshot() {
    let (feed, service) = service_with(&[("agenda/item:1", r#"{"id":1,"title":"One"}"#)], 5, 1);
    let shutdown = Shutdown::new();
    let sink = connect(&service, 5, 0, &shutdown);
    sink.wait_for_frames(1, WAIT);

    let mut fresh = BASE.to_vec();
    fresh.push(("agenda/item:2", r#"{"id":2,"title":"Fresh"}"#));
    feed.set_full_data(&fresh, 500, 400);
    feed.push_update(500, &[("agenda/item:1", Some(r#"{"id":1}"#))]);
    step(&service, &shutdown);

    let frames = sink.wait_for_frames(2, WAIT);
    let frame = &frames[1];
    assert!(frame.all_data);
    assert_eq!(frame.change_id, 500);
    assert!(frame.changed.contains_key(&key("agenda/item:2")));

    shutdown.trigger();
}

#[test]
fn reconnect_inside_the_window_gets_a_delta() {
    let (feed, service) = service_with(&[("agenda/item:1", r#"{"id":1,"title":"One"}"#)], 5, 1);
    feed.set_changed_keys(4, 5, &["agenda/item:1"]);
    let shutdown = Shutdown::new();

    let sink = connect(&service, 5, 4, &shutdown);
    let frames = sink.wait_for_frames(1, WAIT);
    assert_eq!(frames.len(), 1);
    assert!(!frames[0].all_data);
    assert_eq!(frames[0].change_id, 5);
    assert!(frames[0].changed.contains_key(&key("agenda/item:1")));

    shutdown.trigger();
}

#[test]
fn reconnect_below_the_window_gets_a_snapshot() {
    let (_feed, service) = service_with(&[("agenda/item:1", r#"{"id":1,"title":"One"}"#)], 5, 3);
    let shutdown = Shutdown::new();

    let sink = connect(&service, 5, 2, &shutdown);
    let frames = sink.wait_for_frames(1, WAIT);
    assert!(frames[0].all_data);
    assert_eq!(frames[0].change_id, 5);

    shutdown.trigger();
}

#[test]
fn applause_level_flows_as_synthetic_element() {
    let (feed, service) = service_with(
        &[(
            "core/config:9",
            r#"{"id":9,"key":"general_system_applause_enable","value":true}"#,
        )],
        5,
        1,
    );
    let shutdown = Shutdown::new();
    let sink = connect(&service, 5, 0, &shutdown);
    sink.wait_for_frames(1, WAIT);

    feed.push_update(6, &[("users/applause:5", Some(r#"{"id":5}"#))]);
    step(&service, &shutdown);

    let frames = sink.wait_for_frames(2, WAIT);
    let element = value(&frames[1], "applause:1").unwrap();
    assert_eq!(element["level"], 1);

    shutdown.trigger();
}

#[test]
fn frames_are_strictly_ordered_per_client() {
    let (feed, service) = service_with(&[("agenda/item:1", r#"{"id":1,"v":0}"#)], 5, 1);
    let shutdown = Shutdown::new();
    let sink = connect(&service, 5, 0, &shutdown);
    sink.wait_for_frames(1, WAIT);

    for change_id in 6..=10 {
        let element = format!(r#"{{"id":1,"v":{change_id}}}"#);
        feed.push_update(change_id, &[("agenda/item:1", Some(&element))]);
        step(&service, &shutdown);
    }

    let frames = sink.wait_for_frames(6, WAIT);
    let ids: Vec<ChangeId> = frames.iter().map(|frame| frame.change_id).collect();
    assert_eq!(ids, vec![5, 6, 7, 8, 9, 10]);

    shutdown.trigger();
}
