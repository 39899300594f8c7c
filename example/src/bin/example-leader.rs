use core::time::Duration;

use rust_etcd_recipes::{
    etcd::{EtcdConfig, EtcdNamespace},
    leader::{listener_fn, BoxError, LeaderSelector, LeadershipTerm},
    Client, RetryPolicy,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut selectors = Vec::new();
    for i in 0..3 {
        let ns = EtcdNamespace::connect(EtcdConfig::default())
            .await
            .expect("failed to connect to etcd");
        let client = Client::new(ns, RetryPolicy::default());
        let id = format!("participant-{i}");
        let selector = LeaderSelector::with_id(
            client,
            "/example/leader",
            id.clone(),
            listener_fn(move |term: LeadershipTerm| {
                let id = id.clone();
                async move {
                    println!("{id} is now the leader (term {})", term.number());
                    // Lead for a while, or until the connection becomes unreliable.
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                        _ = term.cancelled() => println!("{id} lost its leadership"),
                    }
                    println!("{id} relinquishes leadership");
                    Ok::<_, BoxError>(())
                }
            }),
        );
        selector.auto_requeue();
        selector.start().expect("failed to start selector");
        selectors.push(selector);
    }

    println!("Press Ctrl-C to stop");
    let _ = tokio::signal::ctrl_c().await;

    for selector in &selectors {
        selector.close().await;
    }
    println!("Finished!");
}
