use {
    super::stat_of,
    crate::{
        namespace::{WatchEventType, WatchedEvent},
        paths,
        retry::retry_etcd,
        Revision,
    },
    etcd_client::{EventType, KeyValue, WatchOptions},
    retry::delay::Exponential,
    tokio::sync::oneshot,
    tokio_stream::StreamExt,
    tracing::{error, trace, warn},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchTarget {
    /// Creation, data change or deletion of the node itself.
    Node,
    /// Addition or removal of an immediate child, or deletion of the node itself.
    Children,
}

fn classify(path: &str, target: WatchTarget, event_type: EventType, kv: &KeyValue) -> Option<WatchedEvent> {
    let key = kv.key_str().ok()?;
    match target {
        WatchTarget::Node => {
            if key != path {
                return None;
            }
            match event_type {
                EventType::Put if kv.version() == 1 => Some(
                    WatchedEvent::new(WatchEventType::NodeCreated, path)
                        .with_node(kv.value().to_vec(), stat_of(kv)),
                ),
                EventType::Put => Some(
                    WatchedEvent::new(WatchEventType::NodeDataChanged, path)
                        .with_node(kv.value().to_vec(), stat_of(kv)),
                ),
                EventType::Delete => Some(WatchedEvent::new(WatchEventType::NodeDeleted, path)),
            }
        }
        WatchTarget::Children => {
            if key == path {
                return (event_type == EventType::Delete)
                    .then(|| WatchedEvent::new(WatchEventType::NodeDeleted, path));
            }
            let name = key.strip_prefix(paths::child_prefix(path).as_str())?;
            if name.is_empty() || name.contains(paths::PATH_SEPARATOR) {
                return None;
            }
            let membership_changed = match event_type {
                EventType::Put => kv.version() == 1,
                EventType::Delete => true,
            };
            membership_changed.then(|| WatchedEvent::new(WatchEventType::NodeChildrenChanged, path))
        }
    }
}

///
/// Spawns a task firing `tx` with the first relevant change at or after `start_revision`.
///
/// The task reopens its watch stream on error from the last revision it saw. It stops, dropping
/// `tx`, if the receiving [`crate::namespace::Watch`] goes away or the watch gets cancelled by etcd,
/// which happens when `start_revision` got compacted.
///
pub(crate) fn spawn_one_shot(
    etcd: etcd_client::Client,
    path: String,
    target: WatchTarget,
    start_revision: Revision,
    mut tx: oneshot::Sender<WatchedEvent>,
) {
    tokio::spawn(async move {
        let wopts_prototype = match target {
            WatchTarget::Node => WatchOptions::new(),
            WatchTarget::Children => WatchOptions::new().with_prefix(),
        };
        let mut next_revision = start_revision;
        'outer: loop {
            let wopts = wopts_prototype.clone().with_start_revision(next_revision);
            let retry_strategy = Exponential::from_millis_with_factor(10, 10.0).take(3);
            let watch_result = tokio::select! {
                _ = tx.closed() => break 'outer,
                result = retry_etcd(retry_strategy, || {
                    let mut wc = etcd.watch_client();
                    let key = path.clone();
                    let wopts = wopts.clone();
                    async move { wc.watch(key, Some(wopts)).await }
                }) => result,
            };
            let (mut watcher, mut stream) = match watch_result {
                Ok(pair) => pair,
                Err(e) => {
                    error!("failed to watch {path}: {e:?}");
                    break 'outer;
                }
            };

            'inner: loop {
                let watch_resp = tokio::select! {
                    _ = tx.closed() => {
                        let _ = watcher.cancel().await;
                        break 'outer;
                    }
                    watch_resp = stream.next() => watch_resp,
                };
                match watch_resp {
                    Some(Ok(watch_resp)) => {
                        if watch_resp.canceled() {
                            // This is probably because the compaction_revision < initial revision
                            warn!("watch on {path} cancelled: {watch_resp:?}");
                            break 'outer;
                        }
                        for event in watch_resp.events() {
                            let Some(kv) = event.kv() else {
                                continue;
                            };
                            next_revision = kv.mod_revision() + 1;
                            if let Some(fired) = classify(&path, target, event.event_type(), kv) {
                                trace!("watch on {path} fired {:?}", fired.event_type);
                                let _ = tx.send(fired);
                                let _ = watcher.cancel().await;
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("watch stream error: {:?}", e);
                        break 'inner;
                    }
                    None => break 'inner,
                }
            }
            let _ = watcher.cancel().await;
        }
        trace!("watch on {path} ended without firing");
    });
}
