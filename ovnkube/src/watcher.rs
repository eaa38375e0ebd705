use std::{collections::HashMap, fmt::Debug, pin::pin, sync::Arc};

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::serde::de::DeserializeOwned;
use kube::{
    runtime::{
        reflector::store::Writer,
        watcher::{watcher, Config, Event},
    },
    Api, Resource, ResourceExt,
};
use log::{debug, info, warn};
use ovnkube_core::{helpers::pretty_type_name, kubernetes::object_key, nbdb::backoff::Backoff};
use tokio_util::sync::CancellationToken;

/// What happened to a single object, as seen by the reconcilers.
#[derive(Debug, Clone)]
pub enum ObjectEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K: Resource> ObjectEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            ObjectEvent::Added(object) | ObjectEvent::Deleted(object) => object,
            ObjectEvent::Updated { new, .. } => new,
        }
    }

    pub fn key(&self) -> String {
        key_of(self.object())
    }
}

/// Turns raw watch events into per-object added/updated/deleted callbacks.
/// A restarted watch replays every current object as added and reports the
/// ones that disappeared during the gap as deleted.
pub struct EventTranslator<K> {
    known: HashMap<String, Arc<K>>,
}

impl<K> Default for EventTranslator<K> {
    fn default() -> Self {
        Self {
            known: HashMap::new(),
        }
    }
}

impl<K: Resource + Clone> EventTranslator<K> {
    /// Starts out knowing `objects`, so that ones deleted before the first
    /// restart are still reported.
    pub fn seeded(objects: impl IntoIterator<Item = Arc<K>>) -> Self {
        Self {
            known: objects
                .into_iter()
                .map(|object| (key_of(object.as_ref()), object))
                .collect(),
        }
    }

    pub fn translate(&mut self, event: Event<K>) -> Vec<ObjectEvent<K>> {
        match event {
            Event::Applied(object) => {
                let key = key_of(&object);
                let new = Arc::new(object);

                match self.known.insert(key, new.clone()) {
                    // same version delivered twice
                    Some(old) if same_version(old.as_ref(), new.as_ref()) => vec![],
                    Some(old) => vec![ObjectEvent::Updated { old, new }],
                    None => vec![ObjectEvent::Added(new)],
                }
            }
            Event::Deleted(object) => {
                let key = key_of(&object);

                match self.known.remove(&key) {
                    Some(_) => vec![ObjectEvent::Deleted(Arc::new(object))],
                    None => vec![],
                }
            }
            Event::Restarted(objects) => {
                let mut current = HashMap::with_capacity(objects.len());
                let mut events = Vec::with_capacity(objects.len());

                for object in objects {
                    let object = Arc::new(object);
                    events.push(ObjectEvent::Added(object.clone()));
                    current.insert(key_of(object.as_ref()), object);
                }

                let mut vanished = self
                    .known
                    .iter()
                    .filter(|(key, _)| !current.contains_key(*key))
                    .map(|(key, object)| (key.clone(), object.clone()))
                    .collect::<Vec<_>>();
                vanished.sort_by(|first, second| first.0.cmp(&second.0));

                events.extend(vanished.into_iter().map(|(_, object)| ObjectEvent::Deleted(object)));
                self.known = current;

                events
            }
        }
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }
}

/// Streams `api` into the reflector `writer` and hands every translated event
/// to `callback` until `cancel` fires. Whatever the writer's store already
/// holds counts as known. Stream errors are retried with backoff; the
/// underlying watcher re-lists after them.
pub async fn watch_kind<K, F>(
    api: Api<K>,
    mut writer: Writer<K>,
    cancel: CancellationToken,
    backoff: Backoff,
    mut callback: F,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
    F: FnMut(ObjectEvent<K>),
{
    let kind = pretty_type_name::<K>();
    let stream = watcher(api, Config::default()).map_ok(|event| {
        event.modify(|object| {
            object.managed_fields_mut().clear();
        })
    });
    let mut stream = pin!(stream);
    let mut translator = EventTranslator::seeded(writer.as_reader().state());
    let mut failures = 0u32;

    info!("Watching {kind} objects...");

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                failures = 0;
                writer.apply_watcher_event(&event);

                for event in translator.translate(event) {
                    debug!("{kind} event for '{}'", event.key());
                    callback(event);
                }
            }
            Some(Err(error)) => {
                failures = failures.saturating_add(1);
                let delay = backoff.delay(failures);

                warn!("{kind} watch failed, resyncing in {delay:?}! {error}");

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => (),
                }
            }
            None => break,
        }
    }

    info!("Stopped watching {kind} objects ({} known)", translator.len());
}

pub fn key_of<K: Resource>(object: &K) -> String {
    object_key(
        object.meta().namespace.as_deref(),
        object.meta().name.as_deref().unwrap_or_default(),
    )
}

fn same_version<K: Resource>(old: &K, new: &K) -> bool {
    match (&old.meta().resource_version, &new.meta().resource_version) {
        (Some(old), Some(new)) => old == new,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::{Node, Pod};
    use kube::{
        core::ObjectMeta,
        runtime::{reflector, watcher::Event},
    };

    use super::{EventTranslator, ObjectEvent};

    fn pod(name: &str, version: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some("default".to_owned()),
                resource_version: Some(version.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn applied_objects_become_added_then_updated() {
        let mut translator = EventTranslator::default();

        let events = translator.translate(Event::Applied(pod("web", "1")));
        assert!(matches!(events.as_slice(), [ObjectEvent::Added(_)]));
        assert_eq!(events[0].key(), "default/web");

        let events = translator.translate(Event::Applied(pod("web", "2")));
        match events.as_slice() {
            [ObjectEvent::Updated { old, new }] => {
                assert_eq!(old.metadata.resource_version.as_deref(), Some("1"));
                assert_eq!(new.metadata.resource_version.as_deref(), Some("2"));
            }
            other => panic!("unexpected events {other:?}"),
        }
    }

    #[test]
    fn repeated_versions_are_dropped() {
        let mut translator = EventTranslator::default();

        translator.translate(Event::Applied(pod("web", "1")));

        assert!(translator.translate(Event::Applied(pod("web", "1"))).is_empty());
    }

    #[test]
    fn unknown_deletions_are_dropped() {
        let mut translator = EventTranslator::<Pod>::default();

        assert!(translator.translate(Event::Deleted(pod("web", "1"))).is_empty());
    }

    #[test]
    fn restart_replays_everything_and_reports_the_gap() {
        let mut translator = EventTranslator::default();

        translator.translate(Event::Applied(pod("web", "1")));
        translator.translate(Event::Applied(pod("db", "1")));

        let events = translator.translate(Event::Restarted(vec![pod("web", "5"), pod("cache", "6")]));
        let summary = events
            .iter()
            .map(|event| match event {
                ObjectEvent::Added(_) => format!("+{}", event.key()),
                ObjectEvent::Updated { .. } => format!("~{}", event.key()),
                ObjectEvent::Deleted(_) => format!("-{}", event.key()),
            })
            .collect::<Vec<_>>();

        assert_eq!(summary, ["+default/web", "+default/cache", "-default/db"]);
        assert_eq!(translator.len(), 2);
    }

    #[test]
    fn objects_known_before_the_first_restart_are_reported_gone() {
        let node_a = Node {
            metadata: ObjectMeta {
                name: Some("node-a".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut node_b = node_a.clone();
        node_b.metadata.name = Some("node-b".to_owned());

        let mut translator = EventTranslator::seeded([Arc::new(node_a)]);
        let events = translator.translate(Event::Restarted(vec![node_b]));

        let deleted = events
            .iter()
            .filter(|event| matches!(event, ObjectEvent::Deleted(_)))
            .map(ObjectEvent::key)
            .collect::<Vec<_>>();
        assert_eq!(deleted, ["node-a"]);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn translator_is_seeded_from_a_hydrated_store() {
        let (store, mut writer) = reflector::store::<Pod>();
        writer.apply_watcher_event(&Event::Restarted(vec![pod("web", "1"), pod("db", "1")]));

        let mut translator = EventTranslator::seeded(store.state());

        assert_eq!(translator.len(), 2);
        assert!(translator.translate(Event::Applied(pod("web", "1"))).is_empty());

        let events = translator.translate(Event::Restarted(vec![pod("web", "2")]));
        assert!(matches!(events.as_slice(), [ObjectEvent::Added(_), ObjectEvent::Deleted(_)]));
        assert_eq!(events[1].key(), "default/db");
    }
}
