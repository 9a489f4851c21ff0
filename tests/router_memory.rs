// tests/router_memory.rs

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use mom_pipe::{
    // ---
    deploy_router_with,
    BrokerKind,
    Payload,
    PipeError,
    Responder,
    Router,
    RouterBuilder,
    RouterExt,
    RouterPtr,
    Settings,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    id: u32,
    owner: Option<String>,
    parent: Option<Box<Job>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Sum {
    terms: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Total(i64);

fn setup() {
    // ---
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    mom_pipe::enable::<Job>("router.it.job").unwrap();
    mom_pipe::enable::<Sum>("router.it.sum").unwrap();
    mom_pipe::enable::<Total>("router.it.total").unwrap();
}

async fn memory_router(node: &str) -> RouterPtr {
    let settings = Settings::default().with_node_id(node);
    deploy_router_with(BrokerKind::Memory, &settings)
        .await
        .expect("memory router")
}

/// Accept `pipe` on `router`, forwarding every payload to the returned channel.
async fn collect(router: &RouterPtr, pipe: &str) -> mpsc::UnboundedReceiver<Payload> {
    // ---
    let (tx, rx) = mpsc::unbounded_channel();
    router
        .accept_as(pipe, move |payload| {
            let _ = tx.send(payload);
        })
        .await
        .expect("accept failed");
    rx
}

async fn next_job(rx: &mut mpsc::UnboundedReceiver<Payload>) -> Job {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("delivery channel closed")
        .into_inner::<Job>()
        .expect("payload is not a Job")
}

fn job(id: u32) -> Job {
    Job {
        id,
        owner: None,
        parent: None,
    }
}

#[tokio::test]
async fn distribute_reaches_accepted_pipe() {
    // ---
    // Arrange
    // ---
    setup();
    let consumer = memory_router("consumer").await;
    let producer = memory_router("producer").await;
    let mut rx = collect(&consumer, "it.distribute").await;

    // ---
    // Act
    // ---
    producer.distribute_as("it.distribute", &job(1)).await.unwrap();

    // ---
    // Assert
    // ---
    assert_eq!(next_job(&mut rx).await, job(1));

    consumer.close().await.unwrap();
    producer.close().await.unwrap();
}

#[tokio::test]
async fn composite_payloads_arrive_in_send_order() {
    // ---
    setup();
    let router = memory_router("ordered").await;
    let mut rx = collect(&router, "it.ordered").await;

    let root = Job {
        id: 0,
        owner: Some("ops".into()),
        parent: None,
    };
    let jobs: Vec<Job> = (1..=5)
        .map(|id| Job {
            id,
            owner: (id % 2 == 0).then(|| format!("worker-{id}")),
            parent: Some(Box::new(root.clone())),
        })
        .collect();

    for job in &jobs {
        router.dispatch_as("it.ordered", job).await.unwrap();
    }

    for expected in &jobs {
        assert_eq!(&next_job(&mut rx).await, expected);
    }

    router.close().await.unwrap();
}

#[tokio::test]
async fn remove_only_affects_its_own_pipe() {
    // ---
    setup();
    let router = memory_router("remover").await;
    let mut kept = collect(&router, "it.remove.kept").await;
    let _dropped = collect(&router, "it.remove.dropped").await;

    assert!(matches!(
        router.remove("it.remove.never").await,
        Err(PipeError::Unsubscribed(_))
    ));

    router.remove("it.remove.dropped").await.unwrap();
    router.distribute_as("it.remove.kept", &job(7)).await.unwrap();

    assert_eq!(next_job(&mut kept).await, job(7));
    router.close().await.unwrap();
}

#[tokio::test]
async fn pipe_can_be_accepted_again_after_remove() {
    // ---
    setup();
    let router = memory_router("reaccept").await;

    let _first = collect(&router, "it.reaccept").await;
    router.remove("it.reaccept").await.unwrap();

    let mut second = collect(&router, "it.reaccept").await;
    router.distribute_as("it.reaccept", &job(2)).await.unwrap();

    assert_eq!(next_job(&mut second).await, job(2));
    router.close().await.unwrap();
}

#[tokio::test]
async fn second_accept_on_same_pipe_is_rejected() {
    // ---
    setup();
    let router = memory_router("twice").await;
    let _rx = collect(&router, "it.twice").await;

    let again = router.accept_as("it.twice", |_| {}).await;
    assert!(matches!(again, Err(PipeError::AlreadyAccepted(_))));

    router.close().await.unwrap();
}

#[tokio::test]
async fn closed_router_rejects_every_operation() {
    // ---
    setup();
    let router = memory_router("closing").await;
    let _rx = collect(&router, "it.closed").await;

    router.close().await.unwrap();
    router.close().await.unwrap();

    assert!(matches!(
        router.distribute_as("it.closed", &job(1)).await,
        Err(PipeError::Closed)
    ));
    assert!(matches!(
        router.accept_as("it.closed.other", |_| {}).await,
        Err(PipeError::Closed)
    ));
    assert!(matches!(
        router.remove("it.closed").await,
        Err(PipeError::Closed)
    ));
}

#[tokio::test]
async fn get_is_answered_by_registered_service() {
    // ---
    setup();
    let server = RouterBuilder::new(BrokerKind::Memory)
        .settings(Settings::default().with_node_id("adder"))
        .service(
            "it.service.sum",
            Responder::new(|sum: Sum| async move { Ok(Total(sum.terms.iter().sum())) }),
        )
        .build()
        .await
        .unwrap();
    let client = memory_router("asker").await;

    let total: Total = client
        .get_as("it.service.sum", &Sum { terms: vec![4, -1, 10] })
        .await
        .unwrap();
    assert_eq!(total, Total(13));

    server.close().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn get_times_out_before_slow_reply() {
    // ---
    setup();
    let server = RouterBuilder::new(BrokerKind::Memory)
        .settings(Settings::default())
        .service(
            "it.service.slow",
            Responder::new(|sum: Sum| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(Total(sum.terms.len() as i64))
            }),
        )
        .build()
        .await
        .unwrap();
    let client = memory_router("impatient").await;

    let result = client
        .get_within::<_, Total>(
            "it.service.slow",
            &Sum { terms: vec![1] },
            Duration::from_millis(30),
        )
        .await;
    assert!(matches!(result, Err(PipeError::Timeout)));

    let nobody = client
        .get_within::<_, Total>(
            "it.service.nobody",
            &Sum { terms: vec![] },
            Duration::from_millis(30),
        )
        .await;
    assert!(matches!(nobody, Err(PipeError::Timeout)));

    server.close().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn subscribers_of_one_pipe_share_the_load() {
    // ---
    setup();
    let left = memory_router("left").await;
    let right = memory_router("right").await;
    let producer = memory_router("balancer").await;

    let mut left_rx = collect(&left, "it.balanced").await;
    let mut right_rx = collect(&right, "it.balanced").await;

    for id in 0..4 {
        producer.distribute_as("it.balanced", &job(id)).await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..2 {
        seen.push(next_job(&mut left_rx).await.id);
        seen.push(next_job(&mut right_rx).await.id);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3]);

    // Each message went to exactly one subscriber.
    assert!(left_rx.try_recv().is_err());
    assert!(right_rx.try_recv().is_err());

    for router in [left, right, producer] {
        router.close().await.unwrap();
    }
}
