//! kew kubehub: cluster client, event watch source and its local cache.
//!
//! The watch source lists and watches `v1/Event` objects for one scope,
//! keeps a reflector store current, and reports each observed change as a
//! `(ChangeType, key)` pair after the store has been updated.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use kew_core::{object_key, split_key, ChangeType, FieldSelector, SelectorMode};
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{
        reflector::{self, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Client, Config, ResourceExt,
};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Build a client from an explicit kubeconfig path, or infer one
/// (`$KUBECONFIG`, `~/.kube/config`, then in-cluster service account).
pub async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let client = match kubeconfig {
        Some(path) => {
            info!(path = %path.display(), "using kubeconfig");
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("building client config from kubeconfig")?;
            Client::try_from(cfg).context("creating kube client")?
        }
        None => Client::try_default().await.context("inferring kube client config")?,
    };
    Ok(client)
}

/// Render field selector terms as a server-side selector string.
/// `include` maps to `key=value`, `exclude` to `key!=value`; unknown modes are skipped.
pub fn field_selector(terms: &[FieldSelector]) -> Option<String> {
    let mut parts = Vec::with_capacity(terms.len());
    for t in terms {
        match t.mode {
            SelectorMode::Include => parts.push(format!("{}={}", t.key, t.value)),
            SelectorMode::Exclude => parts.push(format!("{}!={}", t.key, t.value)),
            SelectorMode::Unknown => warn!(key = %t.key, "skipping field selector with unknown type"),
        }
    }
    if parts.is_empty() { None } else { Some(parts.join(",")) }
}

/// Read access to the watch source's local cache.
pub trait ObjectCache: Send + Sync {
    fn get_by_key(&self, key: &str) -> Option<Arc<Event>>;
}

impl ObjectCache for Store<Event> {
    fn get_by_key(&self, key: &str) -> Option<Arc<Event>> {
        let (ns, name) = split_key(key);
        let mut oref = ObjectRef::<Event>::new(name);
        if let Some(ns) = ns {
            oref = oref.within(ns);
        }
        self.get(&oref)
    }
}

fn key_of(ev: &Event) -> String { object_key(ev.namespace().as_deref(), &ev.name_any()) }

fn cached(store: &Store<Event>, ev: &Event) -> Option<Arc<Event>> { store.get(&ObjectRef::from_obj(ev)) }

/// Classify a watcher event against the cache state *before* it is applied.
///
/// New keys are `Added`; known keys with a different `resourceVersion` are
/// `Modified` (identical versions are replays and yield nothing); a relist
/// additionally reports every cached key missing from the new list as `Deleted`.
pub fn classify(store: &Store<Event>, event: &watcher::Event<Event>) -> Vec<(ChangeType, String)> {
    let applied = |obj: &Event| -> Option<(ChangeType, String)> {
        match cached(store, obj) {
            None => Some((ChangeType::Added, key_of(obj))),
            Some(prev) if prev.resource_version() != obj.resource_version() => Some((ChangeType::Modified, key_of(obj))),
            Some(_) => None,
        }
    };
    match event {
        watcher::Event::Applied(obj) => applied(obj).into_iter().collect(),
        watcher::Event::Deleted(obj) => vec![(ChangeType::Deleted, key_of(obj))],
        watcher::Event::Restarted(list) => {
            let mut out: Vec<_> = list.iter().filter_map(applied).collect();
            let live: HashSet<String> = list.iter().map(key_of).collect();
            for prev in store.state() {
                let k = key_of(&prev);
                if !live.contains(&k) {
                    out.push((ChangeType::Deleted, k));
                }
            }
            out
        }
    }
}

/// A running watch for one scope.
pub struct EventWatch {
    pub store: Store<Event>,
    pub handle: JoinHandle<()>,
}

/// Start list+watch of events in `namespace` (all when `None`).
///
/// `on_change` runs on the watch task for every classified change and must
/// not block. The task exits when `stop` is cancelled.
pub fn spawn_event_watch<F>(
    client: Client,
    namespace: Option<&str>,
    fields: Option<String>,
    scope: String,
    on_change: F,
    stop: CancellationToken,
) -> EventWatch
where
    F: Fn(ChangeType, String) + Send + 'static,
{
    let api: Api<Event> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let mut cfg = watcher::Config::default();
    if let Some(f) = fields.as_deref() {
        cfg = cfg.fields(f);
    }
    let (store, mut writer) = reflector::store::<Event>();
    let reader = store.clone();
    let ns_label = namespace.map(|s| s.to_string());

    let handle = tokio::spawn(async move {
        let stream = watcher::watcher(api, cfg).default_backoff();
        futures::pin_mut!(stream);
        info!(scope = %scope, ns = ?ns_label, fields = ?fields, "event watch started");
        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(ev)) => {
                    let changes = classify(&reader, &ev);
                    writer.apply_watcher_event(&ev);
                    if let watcher::Event::Restarted(list) = &ev {
                        debug!(scope = %scope, count = list.len(), "watch relisted");
                    }
                    for (change, key) in changes {
                        on_change(change, key);
                    }
                }
                Some(Err(e)) => {
                    counter!("kew_watch_errors_total", 1u64, "scope" => scope.clone());
                    warn!(scope = %scope, error = %e, "watch error; backing off");
                }
                None => {
                    warn!(scope = %scope, "watch stream ended");
                    break;
                }
            }
        }
        info!(scope = %scope, "event watch stopped");
    });

    EventWatch { store, handle }
}
