#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kew_core::ChangeType;
use kew_kubehub::{classify, ObjectCache};
use kube::runtime::{reflector, watcher};

fn ev(ns: &str, name: &str, rv: &str) -> Event {
    Event {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            resource_version: Some(rv.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[test]
fn applied_then_modified_then_deleted() {
    let (store, mut writer) = reflector::store::<Event>();

    let add = watcher::Event::Applied(ev("default", "a", "1"));
    assert_eq!(classify(&store, &add), vec![(ChangeType::Added, "default/a".to_string())]);
    writer.apply_watcher_event(&add);
    assert!(store.get_by_key("default/a").is_some());

    let replay = watcher::Event::Applied(ev("default", "a", "1"));
    assert!(classify(&store, &replay).is_empty(), "same resourceVersion is not a change");

    let update = watcher::Event::Applied(ev("default", "a", "2"));
    assert_eq!(classify(&store, &update), vec![(ChangeType::Modified, "default/a".to_string())]);
    writer.apply_watcher_event(&update);

    let delete = watcher::Event::Deleted(ev("default", "a", "2"));
    assert_eq!(classify(&store, &delete), vec![(ChangeType::Deleted, "default/a".to_string())]);
    writer.apply_watcher_event(&delete);
    assert!(store.get_by_key("default/a").is_none());
}

#[test]
fn relist_reports_adds_updates_and_vanished_keys() {
    let (store, mut writer) = reflector::store::<Event>();
    writer.apply_watcher_event(&watcher::Event::Restarted(vec![ev("ns", "keep", "1"), ev("ns", "gone", "1"), ev("ns", "bump", "1")]));

    let relist = watcher::Event::Restarted(vec![ev("ns", "keep", "1"), ev("ns", "bump", "2"), ev("ns", "new", "1")]);
    let mut changes = classify(&store, &relist);
    changes.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(
        changes,
        vec![
            (ChangeType::Modified, "ns/bump".to_string()),
            (ChangeType::Deleted, "ns/gone".to_string()),
            (ChangeType::Added, "ns/new".to_string()),
        ]
    );
}

#[test]
fn cache_lookup_misses_unknown_keys() {
    let (store, _writer) = reflector::store::<Event>();
    assert!(store.get_by_key("default/nope").is_none());
    assert!(store.get_by_key("cluster-scoped").is_none());
}
