use core::time::Duration;

use rust_etcd_recipes::{
    etcd::{EtcdConfig, EtcdNamespace},
    lock::DistributedMutex,
    Client, RetryPolicy,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let ns = EtcdNamespace::connect(EtcdConfig::default())
        .await
        .expect("failed to connect to etcd");
    let client = Client::new(ns, RetryPolicy::default());

    let lock_path = "/example/lock";
    let mutex = DistributedMutex::new(client.clone(), lock_path);
    mutex.acquire(None).await.expect("failed to lock");
    println!("Lock acquired in main task!");

    // Every task is its own lock holder, even on the same mutex.
    let mutex2 = mutex.clone();
    let h = tokio::spawn(async move {
        mutex2
            .scope(None, || async {
                println!("Lock acquired in task 2!");
            })
            .await
            .expect("failed to lock");
    });

    println!("Sleeping for 5 second...");
    for i in 1..=5 {
        println!("{}...", i);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    println!("Releasing lock!");
    mutex.release().await.expect("failed to release");

    println!("Waiting for task 2 to acquire lock...");
    h.await.expect("task 2 failed to acquire lock");
    println!("Finished!");
}
