//! Cache registry behaviour against a scripted remote and in-process peers.

mod support;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Map, Value};
use support::{registry, settings, ScriptedRemote};
use timekeep_core::remote::HttpMethod;
use timekeep_core::{
    CacheChannel, ChangeCause, MemoryChannel, MutationOutcome, Project, RemoteError, Settings,
    SyncError,
};
use timekeep_protocol::{ChangeNotice, EntityKind, NoticeReason};

fn project(id: &str, name: &str) -> Project {
    Project {
        id: id.to_string(),
        name: name.to_string(),
        client_id: None,
        color: None,
        archived: false,
        extra: Map::new(),
    }
}

fn projects_json() -> Value {
    json!([
        {"id": "p1", "name": "Atlas"},
        {"id": "p2", "name": "Borealis"},
        {"id": "p3", "name": "Cirrus"}
    ])
}

fn memory_channel() -> Arc<dyn CacheChannel> {
    Arc::new(MemoryChannel::new())
}

fn names(items: &[Project]) -> Vec<String> {
    items.iter().map(|p| p.name.clone()).collect()
}

#[test]
fn fresh_snapshot_is_served_without_network() {
    let remote = ScriptedRemote::new(|_, _, _| Ok(projects_json()));
    let registry = registry(Arc::clone(&remote), memory_channel(), settings());
    let projects = registry.entity::<Project>();

    let first = projects.fetch(false).expect("first fetch");
    let second = projects.fetch(false).expect("second fetch");
    assert_eq!(first, second);
    assert_eq!(remote.calls(), 1);

    projects.fetch(true).expect("forced fetch");
    assert_eq!(remote.calls(), 2);

    projects.invalidate();
    projects.fetch(false).expect("fetch after invalidate");
    assert_eq!(remote.calls(), 3);
}

#[test]
fn concurrent_fetches_share_one_request() {
    let remote = ScriptedRemote::new(|_, _, _| {
        thread::sleep(Duration::from_millis(150));
        Ok(projects_json())
    });
    let registry = registry(Arc::clone(&remote), memory_channel(), settings());

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let projects = registry.entity::<Project>();
            thread::spawn(move || projects.fetch(false))
        })
        .collect();
    for handle in handles {
        let items = handle.join().expect("join").expect("fetch");
        assert_eq!(items.len(), 3);
    }
    assert_eq!(remote.calls(), 1);
}

#[test]
fn failed_fetch_keeps_stale_snapshot() {
    let remote = ScriptedRemote::new(|_, _, n| {
        if n == 0 {
            Ok(projects_json())
        } else {
            Err(RemoteError::Status {
                status: 502,
                message: "bad gateway".to_string(),
            })
        }
    });
    let registry = registry(Arc::clone(&remote), memory_channel(), settings());
    let projects = registry.entity::<Project>();
    projects.fetch(false).expect("initial fetch");

    let err = projects.fetch(true).expect_err("refresh fails");
    assert!(matches!(err, SyncError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(projects.snapshot().len(), 3);
    assert!(!projects.is_fetching());
}

#[test]
fn optimistic_update_rolls_back_on_rejection() {
    let remote = ScriptedRemote::new(|request, _, _| match request.method {
        HttpMethod::Get => Ok(projects_json()),
        _ => {
            thread::sleep(Duration::from_millis(100));
            Err(RemoteError::Status {
                status: 422,
                message: "name taken".to_string(),
            })
        }
    });
    let registry = registry(Arc::clone(&remote), memory_channel(), settings());
    let projects = registry.entity::<Project>();
    projects.fetch(false).expect("fetch");
    let before = projects.snapshot();
    let events = projects.subscribe();

    let pending = projects.update(project("p2", "Zephyr")).expect("submit");
    assert_eq!(pending.optimistic().map(|p| p.name.as_str()), Some("Zephyr"));
    assert_eq!(projects.get("p2").map(|p| p.name), Some("Zephyr".to_string()));

    let err = pending.wait().expect_err("rejected");
    assert!(matches!(err, SyncError::Validation { status: 422, .. }));
    assert_eq!(projects.snapshot(), before);

    let causes: Vec<ChangeCause> = events.try_iter().map(|event| event.cause).collect();
    assert_eq!(causes, vec![ChangeCause::Optimistic, ChangeCause::RolledBack]);
}

#[test]
fn rolled_back_delete_restores_position() {
    let remote = ScriptedRemote::new(|request, _, _| match request.method {
        HttpMethod::Get => Ok(projects_json()),
        _ => Err(RemoteError::Status {
            status: 409,
            message: "project has entries".to_string(),
        }),
    });
    let registry = registry(Arc::clone(&remote), memory_channel(), settings());
    let projects = registry.entity::<Project>();
    projects.fetch(false).expect("fetch");

    let pending = projects.delete("p2").expect("submit");
    assert!(pending.wait().is_err());
    assert_eq!(
        names(&projects.snapshot()),
        vec!["Atlas", "Borealis", "Cirrus"]
    );
}

#[test]
fn create_is_reconciled_with_server_id() {
    let remote = ScriptedRemote::new(|request, _, _| match request.method {
        HttpMethod::Post => Ok(json!({"data": {"id": 99, "name": "Nimbus", "color": "#00aaff"}})),
        _ => Ok(json!([])),
    });
    let registry = registry(Arc::clone(&remote), memory_channel(), settings());
    let projects = registry.entity::<Project>();

    let pending = projects.create(project("", "Nimbus")).expect("submit");
    let provisional = pending.id().to_string();
    assert!(provisional.starts_with("tmp-"));
    assert!(projects.get(&provisional).is_some());

    match pending.wait().expect("reconciled") {
        MutationOutcome::Reconciled(Some(created)) => {
            assert_eq!(created.id, "99");
            assert_eq!(created.color.as_deref(), Some("#00aaff"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(projects.get(&provisional).is_none());
    assert_eq!(projects.get("99").map(|p| p.name), Some("Nimbus".to_string()));
}

#[test]
fn create_reconciles_once_when_fetch_already_returned_server_id() {
    let remote = ScriptedRemote::new(|request, _, _| match request.method {
        HttpMethod::Get => Ok(json!([{"id": 99, "name": "Nimbus"}])),
        _ => {
            thread::sleep(Duration::from_millis(300));
            Ok(json!({"id": 99, "name": "Nimbus"}))
        }
    });
    let registry = registry(Arc::clone(&remote), memory_channel(), settings());
    let projects = registry.entity::<Project>();

    let pending = projects.create(project("", "Nimbus")).expect("submit");
    projects.fetch(true).expect("fetch while create is in flight");
    pending.wait().expect("reconciled");

    let ids: Vec<String> = projects.snapshot().into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec!["99"]);
}

#[test]
fn create_returning_cached_id_does_not_duplicate_it() {
    let remote = ScriptedRemote::new(|request, _, _| match request.method {
        HttpMethod::Get => Ok(projects_json()),
        _ => Ok(json!({"id": "p1", "name": "Atlas"})),
    });
    let registry = registry(Arc::clone(&remote), memory_channel(), settings());
    let projects = registry.entity::<Project>();
    projects.fetch(false).expect("fetch");

    let pending = projects.create(project("", "Atlas")).expect("submit");
    pending.wait().expect("reconciled");

    let ids: Vec<String> = projects.snapshot().into_iter().map(|p| p.id).collect();
    assert_eq!(ids, vec!["p1", "p2", "p3"]);
}

#[test]
fn failed_create_rolls_back_to_pre_mutation_snapshot() {
    let remote = ScriptedRemote::new(|request, _, _| match request.method {
        HttpMethod::Get => Ok(projects_json()),
        _ => {
            thread::sleep(Duration::from_millis(100));
            Err(RemoteError::Status {
                status: 422,
                message: "name is required".to_string(),
            })
        }
    });
    let registry = registry(Arc::clone(&remote), memory_channel(), settings());
    let projects = registry.entity::<Project>();
    projects.fetch(false).expect("fetch");
    let before = projects.snapshot();

    let pending = projects.create(project("", "")).expect("submit");
    let provisional = pending.id().to_string();
    assert!(projects.get(&provisional).is_some());
    assert_eq!(projects.snapshot().len(), before.len() + 1);

    let err = pending.wait().expect_err("rejected");
    assert!(matches!(err, SyncError::Validation { status: 422, .. }));
    assert!(projects.get(&provisional).is_none());
    assert_eq!(projects.snapshot(), before);
}

#[test]
fn settings_update_targets_the_singleton_route() {
    let remote = ScriptedRemote::new(|request, _, _| match request.method {
        HttpMethod::Get => Ok(json!({"id": "settings", "theme": "dark"})),
        _ => Ok(json!({"id": "settings", "theme": "light"})),
    });
    let registry = registry(Arc::clone(&remote), memory_channel(), settings());
    let cache = registry.entity::<Settings>();

    let fetched = cache.fetch(false).expect("fetch");
    assert_eq!(fetched.len(), 1);
    let mut updated = fetched[0].clone();
    updated
        .values
        .insert("theme".to_string(), Value::String("light".to_string()));

    cache.update(updated).expect("submit").wait().expect("saved");

    assert_eq!(remote.paths(HttpMethod::Put), vec!["/api/settings"]);
    let saved = cache.snapshot();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].values.get("theme"), Some(&json!("light")));
}

#[test]
fn stale_response_does_not_overwrite_newer_mutation() {
    let remote = ScriptedRemote::new(|request, _, _| match request.method {
        HttpMethod::Get => Ok(projects_json()),
        _ => {
            let body = request.body.clone().unwrap_or(Value::Null);
            if body["name"] == "first" {
                thread::sleep(Duration::from_millis(300));
            }
            Ok(body)
        }
    });
    let registry = registry(Arc::clone(&remote), memory_channel(), settings());
    let projects = registry.entity::<Project>();
    projects.fetch(false).expect("fetch");

    let first = projects.update(project("p1", "first")).expect("first");
    let second = projects.update(project("p1", "second")).expect("second");
    assert!(second.logical_ts() > first.logical_ts());

    assert!(matches!(
        second.wait().expect("second applied"),
        MutationOutcome::Reconciled(Some(_))
    ));
    assert_eq!(first.wait().expect("first resolved"), MutationOutcome::Superseded);
    assert_eq!(projects.get("p1").map(|p| p.name), Some("second".to_string()));
}

#[test]
fn failed_older_mutation_does_not_undo_newer_one() {
    let remote = ScriptedRemote::new(|request, _, _| match request.method {
        HttpMethod::Get => Ok(projects_json()),
        _ => {
            let body = request.body.clone().unwrap_or(Value::Null);
            if body["name"] == "first" {
                thread::sleep(Duration::from_millis(200));
                return Err(RemoteError::Status {
                    status: 400,
                    message: "bad".to_string(),
                });
            }
            thread::sleep(Duration::from_millis(400));
            Ok(body)
        }
    });
    let registry = registry(Arc::clone(&remote), memory_channel(), settings());
    let projects = registry.entity::<Project>();
    projects.fetch(false).expect("fetch");

    let first = projects.update(project("p1", "first")).expect("first");
    let second = projects.update(project("p1", "second")).expect("second");

    assert!(first.wait().is_err());
    assert_eq!(projects.get("p1").map(|p| p.name), Some("second".to_string()));
    assert!(second.wait().is_ok());
    assert_eq!(projects.get("p1").map(|p| p.name), Some("second".to_string()));
}

#[test]
fn peer_adopts_fetched_snapshot_without_refetching() {
    let channel = memory_channel();
    let remote_a = ScriptedRemote::new(|_, _, _| Ok(projects_json()));
    let remote_b = ScriptedRemote::new(|_, _, _| Ok(json!([])));
    let instance_a = registry(Arc::clone(&remote_a), Arc::clone(&channel), settings());
    let instance_b = registry(Arc::clone(&remote_b), Arc::clone(&channel), settings());

    let peer_projects = instance_b.entity::<Project>();
    let events = peer_projects.subscribe();

    instance_a.entity::<Project>().fetch(false).expect("fetch on a");

    let event = events
        .recv_timeout(Duration::from_secs(2))
        .expect("peer notice adopted");
    assert_eq!(event.cause, ChangeCause::Adopted);
    assert_eq!(event.len, 3);

    let items = peer_projects.fetch(false).expect("served from adopted snapshot");
    assert_eq!(items.len(), 3);
    assert_eq!(remote_b.calls(), 0);
}

#[test]
fn peer_notice_without_snapshot_leaves_cache_alone() {
    let channel = memory_channel();
    let remote = ScriptedRemote::new(|_, _, _| Ok(projects_json()));
    let instance = registry(Arc::clone(&remote), Arc::clone(&channel), settings());
    let projects = instance.entity::<Project>();
    projects.fetch(false).expect("fetch");
    let events = projects.subscribe();

    channel
        .publish(ChangeNotice {
            kind: EntityKind::Projects,
            origin: "peer".to_string(),
            reason: NoticeReason::Mutated,
            snapshot: None,
            updated_at: chrono::Utc::now(),
        })
        .expect("publish");

    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(names(&projects.snapshot()), vec!["Atlas", "Borealis", "Cirrus"]);
}

#[test]
fn fetch_waits_for_peer_in_flight_fetch() {
    let channel = memory_channel();
    let remote_a = ScriptedRemote::new(|_, _, _| {
        thread::sleep(Duration::from_millis(300));
        Ok(projects_json())
    });
    let remote_b = ScriptedRemote::new(|_, _, _| Ok(json!([])));
    let instance_a = registry(Arc::clone(&remote_a), Arc::clone(&channel), settings());
    let instance_b = registry(Arc::clone(&remote_b), Arc::clone(&channel), settings());
    let peer_projects = instance_b.entity::<Project>();

    let leader = {
        let projects = instance_a.entity::<Project>();
        thread::spawn(move || projects.fetch(false))
    };
    thread::sleep(Duration::from_millis(100));

    let items = peer_projects.fetch(false).expect("joined peer fetch");
    assert_eq!(items.len(), 3);
    assert_eq!(remote_b.calls(), 0);
    assert!(leader.join().expect("join").is_ok());
    assert_eq!(remote_a.calls(), 1);
}

#[test]
fn reconciled_mutation_reaches_peers() {
    let channel = memory_channel();
    let remote_a = ScriptedRemote::new(|request, _, _| match request.method {
        HttpMethod::Get => Ok(projects_json()),
        _ => Ok(request.body.clone().unwrap_or(Value::Null)),
    });
    let remote_b = ScriptedRemote::new(|_, _, _| Ok(projects_json()));
    let instance_a = registry(Arc::clone(&remote_a), Arc::clone(&channel), settings());
    let instance_b = registry(Arc::clone(&remote_b), Arc::clone(&channel), settings());

    let ours = instance_a.entity::<Project>();
    let theirs = instance_b.entity::<Project>();
    theirs.fetch(false).expect("peer fetch");
    ours.fetch(false).expect("our fetch");
    let events = theirs.subscribe();

    ours.update(project("p3", "Cumulus"))
        .expect("submit")
        .wait()
        .expect("reconciled");

    // An adoption of the earlier fetch may still be in the listener's queue.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while theirs.get("p3").map(|p| p.name) != Some("Cumulus".to_string()) {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        let event = events.recv_timeout(remaining).expect("peer sees mutation");
        assert_eq!(event.cause, ChangeCause::Adopted);
    }
    assert_eq!(remote_b.count(HttpMethod::Put), 0);
}

#[test]
fn new_cache_hydrates_from_channel() {
    let channel = memory_channel();
    let remote = ScriptedRemote::new(|_, _, _| Ok(projects_json()));
    let first = registry(Arc::clone(&remote), Arc::clone(&channel), settings());
    first.entity::<Project>().fetch(false).expect("fetch");

    let late_remote = ScriptedRemote::new(|_, _, _| Ok(json!([])));
    let late = registry(Arc::clone(&late_remote), channel, settings());
    let items = late.entity::<Project>().fetch(false).expect("hydrated");
    assert_eq!(items.len(), 3);
    assert_eq!(late_remote.calls(), 0);
}
