use core::time::Duration;

use rand::Rng;
use rust_etcd_recipes::{
    barrier::DistributedDoubleBarrier,
    etcd::{EtcdConfig, EtcdNamespace},
    Client, RetryPolicy,
};

const PARTICIPANTS: usize = 5;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let ns = EtcdNamespace::connect(EtcdConfig::default())
        .await
        .expect("failed to connect to etcd");
    let client = Client::new(ns, RetryPolicy::default());

    let mut handles = Vec::new();
    for i in 0..PARTICIPANTS {
        let barrier = DistributedDoubleBarrier::new(client.clone(), "/example/barrier", PARTICIPANTS);
        handles.push(tokio::spawn(async move {
            let delay = rand::thread_rng().gen_range(100..3000);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            println!("participant {i} enters");
            barrier.enter(None).await.expect("failed to enter");
            println!("participant {i} is working");
            tokio::time::sleep(Duration::from_millis(delay)).await;
            barrier.leave(None).await.expect("failed to leave");
            println!("participant {i} left");
        }));
    }
    for h in handles {
        h.await.expect("participant failed");
    }
    println!("Finished!");
}
