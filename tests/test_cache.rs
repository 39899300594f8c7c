use {
    common::{eventually, memory_client, random_str, within},
    rust_etcd_recipes::{
        cache::{NodeCache, NodeCacheEvent, PathChildrenCache, PathChildrenCacheEvent},
        memory::MemoryServer,
        sync::listeners::Subscription,
        CreateMode, Error,
    },
    std::{
        sync::{Arc, Mutex},
        time::Duration,
    },
};
mod common;

async fn next_node_event(events: &mut Subscription<NodeCacheEvent>) -> NodeCacheEvent {
    loop {
        match within("node cache event", events.recv()).await {
            Some(NodeCacheEvent::Error(_)) => continue,
            Some(event) => return event,
            None => panic!("node cache stopped emitting"),
        }
    }
}

async fn next_children_event(
    events: &mut Subscription<PathChildrenCacheEvent>,
) -> PathChildrenCacheEvent {
    loop {
        match within("children cache event", events.recv()).await {
            Some(PathChildrenCacheEvent::Error(_)) => continue,
            Some(event) => return event,
            None => panic!("children cache stopped emitting"),
        }
    }
}

#[tokio::test]
async fn node_cache_should_report_every_change() {
    let server = MemoryServer::new();
    let (client, _) = memory_client(&server);
    let path = format!("/config/{}", random_str(10));
    client
        .create_with_parents(&path, b"v1".to_vec(), CreateMode::Persistent)
        .await
        .expect("failed to create");

    let cache = NodeCache::new(client.clone(), path.clone());
    let mut events = cache.subscribe();
    cache.start(true).await.expect("failed to start");
    let entry = cache.current_data().expect("node should be cached");
    assert_eq!(entry.data.as_deref(), Some(&b"v1"[..]));

    client
        .set_data(&path, b"v2".to_vec(), None)
        .await
        .expect("failed to set");
    match next_node_event(&mut events).await {
        NodeCacheEvent::Changed(entry) => assert_eq!(entry.data.as_deref(), Some(&b"v2"[..])),
        event => panic!("unexpected {event:?}"),
    }

    client.delete(&path, None).await.expect("failed to delete");
    match next_node_event(&mut events).await {
        NodeCacheEvent::Deleted(deleted) => assert_eq!(deleted, path),
        event => panic!("unexpected {event:?}"),
    }
    assert!(cache.current_data().is_none());

    client
        .create(&path, b"v3".to_vec(), CreateMode::Persistent)
        .await
        .expect("failed to create again");
    match next_node_event(&mut events).await {
        NodeCacheEvent::Created(entry) => assert_eq!(entry.data.as_deref(), Some(&b"v3"[..])),
        event => panic!("unexpected {event:?}"),
    }
    cache.close().await;
}

#[tokio::test]
async fn node_cache_should_initialize_in_the_background() {
    let server = MemoryServer::new();
    let (client, _) = memory_client(&server);
    let path = format!("/{}", random_str(10));
    let cache = NodeCache::new(client.clone(), path.clone());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    let _handle = cache.add_listener(move |event| seen2.lock().unwrap().push(event));
    let mut events = cache.subscribe();
    cache.start(false).await.expect("failed to start");

    assert!(matches!(
        next_node_event(&mut events).await,
        NodeCacheEvent::Initialized
    ));
    client
        .create(&path, b"hello".to_vec(), CreateMode::Persistent)
        .await
        .expect("failed to create");
    assert!(matches!(
        next_node_event(&mut events).await,
        NodeCacheEvent::Created(_)
    ));
    eventually("listener to see both events", || async {
        seen.lock().unwrap().len() == 2
    })
    .await;
    cache.close().await;
}

#[tokio::test]
async fn node_cache_should_start_once() {
    let server = MemoryServer::new();
    let (client, _) = memory_client(&server);
    let cache = NodeCache::new(client, "/once");
    cache.start(false).await.expect("failed to start");
    assert!(matches!(
        cache.start(false).await,
        Err(Error::IllegalState(_))
    ));
    cache.close().await;
    assert!(cache.is_closed());
    assert!(matches!(cache.start(false).await, Err(Error::Closed(_))));
}

#[tokio::test]
async fn node_cache_should_catch_up_after_reconnecting() {
    let server = MemoryServer::new();
    let (client, session) = memory_client(&server);
    let (writer, _) = memory_client(&server);
    let path = format!("/{}", random_str(10));
    writer
        .create(&path, b"v1".to_vec(), CreateMode::Persistent)
        .await
        .expect("failed to create");

    let cache = NodeCache::new(client, path.clone());
    let mut events = cache.subscribe();
    cache.start(true).await.expect("failed to start");

    session.suspend();
    writer
        .set_data(&path, b"v2".to_vec(), None)
        .await
        .expect("failed to set");
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.resume();

    match next_node_event(&mut events).await {
        NodeCacheEvent::Changed(entry) => assert_eq!(entry.data.as_deref(), Some(&b"v2"[..])),
        event => panic!("unexpected {event:?}"),
    }
    writer
        .set_data(&path, b"v3".to_vec(), None)
        .await
        .expect("failed to set");
    eventually("cache to see v3", || async {
        cache
            .current_data()
            .is_some_and(|entry| entry.data.as_deref() == Some(&b"v3"[..]))
    })
    .await;
    cache.close().await;
}

#[tokio::test]
async fn children_cache_should_report_additions_updates_and_removals() {
    let server = MemoryServer::new();
    let (client, _) = memory_client(&server);
    let parent = format!("/services/{}", random_str(10));
    for name in ["a", "b"] {
        client
            .create_with_parents(
                &format!("{parent}/{name}"),
                name.as_bytes().to_vec(),
                CreateMode::Persistent,
            )
            .await
            .expect("failed to create child");
    }

    let cache = PathChildrenCache::new(client.clone(), parent.clone(), true);
    let mut events = cache.subscribe();
    cache.start(true).await.expect("failed to start");
    let children = cache.current_children();
    assert_eq!(children.len(), 2);
    assert_eq!(
        cache.current_data("a").and_then(|entry| entry.data),
        Some(b"a".to_vec())
    );

    client
        .create(&format!("{parent}/c"), b"c".to_vec(), CreateMode::Persistent)
        .await
        .expect("failed to create child");
    match next_children_event(&mut events).await {
        PathChildrenCacheEvent::ChildAdded(entry) => assert_eq!(entry.path, format!("{parent}/c")),
        event => panic!("unexpected {event:?}"),
    }

    client
        .set_data(&format!("{parent}/a"), b"a2".to_vec(), None)
        .await
        .expect("failed to set");
    match next_children_event(&mut events).await {
        PathChildrenCacheEvent::ChildUpdated(entry) => {
            assert_eq!(entry.path, format!("{parent}/a"));
            assert_eq!(entry.data, Some(b"a2".to_vec()));
        }
        event => panic!("unexpected {event:?}"),
    }

    client
        .delete(&format!("{parent}/b"), None)
        .await
        .expect("failed to delete");
    match next_children_event(&mut events).await {
        PathChildrenCacheEvent::ChildRemoved(entry) => assert_eq!(entry.path, format!("{parent}/b")),
        event => panic!("unexpected {event:?}"),
    }
    let mut names: Vec<_> = cache
        .current_children()
        .into_iter()
        .map(|entry| entry.path)
        .collect();
    names.sort();
    assert_eq!(names, vec![format!("{parent}/a"), format!("{parent}/c")]);
    cache.close().await;
}

#[tokio::test]
async fn children_cache_should_announce_initial_children_then_initialized() {
    let server = MemoryServer::new();
    let (client, _) = memory_client(&server);
    let parent = format!("/{}", random_str(10));
    for name in ["x", "y"] {
        client
            .create_with_parents(&format!("{parent}/{name}"), Vec::new(), CreateMode::Persistent)
            .await
            .expect("failed to create child");
    }
    let cache = PathChildrenCache::new(client, parent, false);
    let mut events = cache.subscribe();
    cache.start(false).await.expect("failed to start");

    for _ in 0..2 {
        match next_children_event(&mut events).await {
            PathChildrenCacheEvent::ChildAdded(entry) => assert!(entry.data.is_none()),
            event => panic!("unexpected {event:?}"),
        }
    }
    assert!(matches!(
        next_children_event(&mut events).await,
        PathChildrenCacheEvent::Initialized
    ));
    cache.close().await;
}

#[tokio::test]
async fn children_cache_should_wait_for_its_parent() {
    let server = MemoryServer::new();
    let (client, _) = memory_client(&server);
    let parent = format!("/{}", random_str(10));
    let cache = PathChildrenCache::new(client.clone(), parent.clone(), true);
    let mut events = cache.subscribe();
    cache.start(false).await.expect("failed to start");
    assert!(matches!(
        next_children_event(&mut events).await,
        PathChildrenCacheEvent::Initialized
    ));

    client
        .create_with_parents(&format!("{parent}/late"), b"1".to_vec(), CreateMode::Persistent)
        .await
        .expect("failed to create child");
    match next_children_event(&mut events).await {
        PathChildrenCacheEvent::ChildAdded(entry) => assert_eq!(entry.path, format!("{parent}/late")),
        event => panic!("unexpected {event:?}"),
    }
    cache.close().await;
}

#[tokio::test]
async fn children_cache_should_keep_children_while_suspended() {
    let server = MemoryServer::new();
    let (client, session) = memory_client(&server);
    let (writer, _) = memory_client(&server);
    let parent = format!("/{}", random_str(10));
    for name in ["a", "b"] {
        writer
            .create_with_parents(&format!("{parent}/{name}"), Vec::new(), CreateMode::Persistent)
            .await
            .expect("failed to create child");
    }
    let cache = PathChildrenCache::new(client, parent.clone(), true);
    let mut events = cache.subscribe();
    cache.start(true).await.expect("failed to start");

    session.suspend();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.current_children().len(), 2);
    while let Some(event) = events.try_recv() {
        assert!(
            matches!(event, PathChildrenCacheEvent::Error(_)),
            "unexpected {event:?} while suspended"
        );
    }

    writer
        .delete(&format!("{parent}/a"), None)
        .await
        .expect("failed to delete");
    session.resume();
    match next_children_event(&mut events).await {
        PathChildrenCacheEvent::ChildRemoved(entry) => assert_eq!(entry.path, format!("{parent}/a")),
        event => panic!("unexpected {event:?}"),
    }
    assert_eq!(cache.current_children().len(), 1);
    cache.close().await;
}

#[tokio::test]
async fn children_cache_should_drop_ephemerals_of_an_expired_session() {
    let server = MemoryServer::new();
    let (client, _) = memory_client(&server);
    let (member, member_session) = memory_client(&server);
    let parent = format!("/{}", random_str(10));
    client.ensure_path(&parent).await.expect("failed to ensure");
    member
        .create(&format!("{parent}/member"), Vec::new(), CreateMode::Ephemeral)
        .await
        .expect("failed to create member");

    let cache = PathChildrenCache::new(client, parent.clone(), true);
    let mut events = cache.subscribe();
    cache.start(true).await.expect("failed to start");
    assert_eq!(cache.current_children().len(), 1);

    member_session.expire();
    match next_children_event(&mut events).await {
        PathChildrenCacheEvent::ChildRemoved(entry) => {
            assert_eq!(entry.path, format!("{parent}/member"))
        }
        event => panic!("unexpected {event:?}"),
    }
    cache.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn children_cache_should_follow_a_recreated_child() {
    let server = MemoryServer::new();
    let (client, _) = memory_client(&server);
    let (writer, _) = memory_client(&server);
    let parent = format!("/{}", random_str(10));
    let child = format!("{parent}/c");
    writer
        .create_with_parents(&child, b"0".to_vec(), CreateMode::Persistent)
        .await
        .expect("failed to create child");
    let cache = PathChildrenCache::new(client, parent, true);
    cache.start(true).await.expect("failed to start");

    for round in 1..=20 {
        let data = round.to_string().into_bytes();
        writer.delete(&child, None).await.expect("failed to delete");
        writer
            .create(&child, data.clone(), CreateMode::Persistent)
            .await
            .expect("failed to recreate");
        eventually("cache to hold the recreated child", || async {
            cache
                .current_data("c")
                .is_some_and(|entry| entry.data.as_deref() == Some(&data[..]))
        })
        .await;
    }
    // Later changes still reach the cache, so the data watch follows the live node.
    writer
        .set_data(&child, b"last".to_vec(), None)
        .await
        .expect("failed to set");
    eventually("cache to see the last update", || async {
        cache
            .current_data("c")
            .is_some_and(|entry| entry.data.as_deref() == Some(&b"last"[..]))
    })
    .await;
    cache.close().await;
}
