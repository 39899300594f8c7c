use {
    common::{eventually, faulty_client, memory_client, random_str},
    rust_etcd_recipes::{
        leader::{listener_fn, BoxError, LeaderSelector, LeadershipTerm},
        lock::DistributedMutex,
        memory::MemoryServer,
        Error,
    },
    std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::sync::Notify,
};
mod common;

fn election_path() -> String {
    format!("/election/{}", random_str(10))
}

#[tokio::test]
async fn selector_should_lead_once_without_requeue() {
    let server = MemoryServer::new();
    let (client, _) = memory_client(&server);
    let terms = Arc::new(AtomicUsize::new(0));
    let stop = Arc::new(Notify::new());

    let terms2 = Arc::clone(&terms);
    let stop2 = Arc::clone(&stop);
    let selector = LeaderSelector::new(
        client,
        election_path(),
        listener_fn(move |term: LeadershipTerm| {
            let terms = Arc::clone(&terms2);
            let stop = Arc::clone(&stop2);
            async move {
                terms.fetch_add(1, Ordering::SeqCst);
                assert_eq!(term.number(), 1);
                stop.notified().await;
                Ok::<_, BoxError>(())
            }
        }),
    );
    selector.start().expect("failed to start");
    eventually("leadership", || async { selector.has_leadership() }).await;
    assert!(matches!(selector.start(), Err(Error::IllegalState(_))));

    stop.notify_one();
    eventually("leadership to end", || async { !selector.has_leadership() }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(terms.load(Ordering::SeqCst), 1);
    selector.close().await;
    assert!(matches!(selector.requeue(), Err(Error::Closed(_))));
}

#[tokio::test]
async fn requeue_should_start_another_term() {
    let server = MemoryServer::new();
    let (client, _) = memory_client(&server);
    let terms = Arc::new(AtomicUsize::new(0));
    let terms2 = Arc::clone(&terms);
    let selector = LeaderSelector::new(
        client,
        election_path(),
        listener_fn(move |_term: LeadershipTerm| {
            let terms = Arc::clone(&terms2);
            async move {
                terms.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        }),
    );
    assert!(matches!(selector.requeue(), Err(Error::IllegalState(_))));
    selector.start().expect("failed to start");
    eventually("first term", || async { terms.load(Ordering::SeqCst) == 1 }).await;
    eventually("requeue to be accepted", || async {
        selector.requeue().expect("failed to requeue")
    })
    .await;
    eventually("second term", || async { terms.load(Ordering::SeqCst) == 2 }).await;
    selector.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contenders_should_lead_one_at_a_time() {
    let server = MemoryServer::new();
    let path = election_path();
    let leading = Arc::new(AtomicUsize::new(0));
    let terms = Arc::new(AtomicUsize::new(0));
    let overlap = Arc::new(AtomicBool::new(false));
    let mut selectors = Vec::new();
    for _ in 0..3 {
        let (client, _) = memory_client(&server);
        let leading = Arc::clone(&leading);
        let terms = Arc::clone(&terms);
        let overlap = Arc::clone(&overlap);
        let selector = LeaderSelector::new(
            client,
            path.clone(),
            listener_fn(move |_term: LeadershipTerm| {
                let leading = Arc::clone(&leading);
                let terms = Arc::clone(&terms);
                let overlap = Arc::clone(&overlap);
                async move {
                    if leading.fetch_add(1, Ordering::SeqCst) != 0 {
                        overlap.store(true, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    leading.fetch_sub(1, Ordering::SeqCst);
                    terms.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                }
            }),
        );
        selector.auto_requeue();
        selector.start().expect("failed to start");
        selectors.push(selector);
    }
    eventually("several terms", || async { terms.load(Ordering::SeqCst) >= 9 }).await;
    for selector in &selectors {
        selector.close().await;
    }
    assert!(!overlap.load(Ordering::SeqCst));
}

#[tokio::test]
async fn participants_should_list_the_leader_first() {
    let server = MemoryServer::new();
    let path = election_path();
    let mut selectors = Vec::new();
    for id in ["first", "second"] {
        let (client, _) = memory_client(&server);
        let selector = LeaderSelector::with_id(
            client,
            path.clone(),
            id,
            listener_fn(|term: LeadershipTerm| async move {
                term.cancelled().await;
                Ok::<_, BoxError>(())
            }),
        );
        selector.start().expect("failed to start");
        // Queue in a known order.
        eventually("selector to queue", || async {
            selector.participants().await.expect("participants").len() == selectors.len() + 1
        })
        .await;
        selectors.push(selector);
    }
    let participants = selectors[0].participants().await.expect("participants");
    assert_eq!(participants.len(), 2);
    assert_eq!(participants[0].id, "first");
    assert!(participants[0].is_leader);
    assert_eq!(participants[1].id, "second");
    assert!(!participants[1].is_leader);
    assert_eq!(
        selectors[1].leader().await.expect("leader").map(|p| p.id),
        Some("first".to_string())
    );
    assert!(selectors[0].has_leadership());

    selectors[0].close().await;
    eventually("second to lead", || async { selectors[1].has_leadership() }).await;
    selectors[1].close().await;
}

#[tokio::test]
async fn leader_should_be_the_first_participant_still_present() {
    let server = MemoryServer::new();
    let path = election_path();
    let mut selectors = Vec::new();
    for id in ["first", "second"] {
        let (client, _) = memory_client(&server);
        let selector = LeaderSelector::with_id(
            client,
            path.clone(),
            id,
            listener_fn(|term: LeadershipTerm| async move {
                term.cancelled().await;
                Ok::<_, BoxError>(())
            }),
        );
        selector.start().expect("failed to start");
        eventually("selector to queue", || async {
            selector.participants().await.expect("participants").len() == selectors.len() + 1
        })
        .await;
        selectors.push(selector);
    }

    let (client, faults) = faulty_client(&server);
    let nodes = DistributedMutex::new(client.clone(), path.clone())
        .participant_nodes()
        .await
        .expect("participants");
    assert_eq!(nodes.len(), 2);
    // The head vanishes between listing the candidates and reading them.
    faults.lock().unwrap().vanished.insert(nodes[0].clone());
    let observer = LeaderSelector::with_id(
        client,
        path,
        "observer",
        listener_fn(|_term: LeadershipTerm| async move { Ok::<_, BoxError>(()) }),
    );
    let participants = observer.participants().await.expect("participants");
    assert_eq!(participants.len(), 1);
    assert_eq!(participants[0].id, "second");
    assert!(participants[0].is_leader);

    for selector in selectors {
        selector.close().await;
    }
}

#[tokio::test]
async fn failed_term_should_release_leadership() {
    let server = MemoryServer::new();
    let path = election_path();
    let (client1, _) = memory_client(&server);
    let (client2, _) = memory_client(&server);
    let failing = LeaderSelector::new(
        client1,
        path.clone(),
        listener_fn(|_term: LeadershipTerm| async move {
            Err::<(), BoxError>("leader crashed".into())
        }),
    );
    failing.start().expect("failed to start");

    let led = Arc::new(AtomicBool::new(false));
    let led2 = Arc::clone(&led);
    let next = LeaderSelector::new(
        client2,
        path,
        listener_fn(move |_term: LeadershipTerm| {
            let led = Arc::clone(&led2);
            async move {
                led.store(true, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        }),
    );
    next.start().expect("failed to start");
    eventually("next selector to lead", || async { led.load(Ordering::SeqCst) }).await;
    failing.close().await;
    next.close().await;
}

#[tokio::test]
async fn suspension_should_cancel_the_term() {
    let server = MemoryServer::new();
    let path = election_path();
    let (client1, session1) = memory_client(&server);
    let (client2, _) = memory_client(&server);
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancelled2 = Arc::clone(&cancelled);
    let first = LeaderSelector::new(
        client1,
        path.clone(),
        listener_fn(move |term: LeadershipTerm| {
            let cancelled = Arc::clone(&cancelled2);
            async move {
                term.cancelled().await;
                assert!(term.is_cancelled());
                cancelled.store(true, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            }
        }),
    );
    first.start().expect("failed to start");
    eventually("first to lead", || async { first.has_leadership() }).await;

    let second = LeaderSelector::new(
        client2,
        path,
        listener_fn(|term: LeadershipTerm| async move {
            term.cancelled().await;
            Ok::<_, BoxError>(())
        }),
    );
    second.start().expect("failed to start");

    session1.suspend();
    eventually("term to be cancelled", || async { cancelled.load(Ordering::SeqCst) }).await;
    session1.resume();
    eventually("second to lead", || async { second.has_leadership() }).await;
    assert!(!first.has_leadership());
    first.close().await;
    second.close().await;
}
