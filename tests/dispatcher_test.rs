mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sl4a_rpc::connection::{Connection, UNKNOWN_UID};
use sl4a_rpc::dispatcher::{Event, EventDispatcher};
use sl4a_rpc::error::Sl4aError;
use sl4a_rpc::port::Ports;
use sl4a_rpc::rpc_client::{ConnectionFactory, ErrorCallback, RpcClient};

use support::{spawn_mock_agent, LoopbackAdb, Step};

fn no_op_error_callback() -> ErrorCallback {
    Arc::new(|_ports| Box::pin(async {}))
}

async fn build_dispatcher(steps: Vec<Step>) -> Arc<EventDispatcher> {
    let port = spawn_mock_agent(1, steps).await;
    let adb = LoopbackAdb::new("test-serial", port);

    let factory: ConnectionFactory = Arc::new(move |uid: i64| {
        let adb = adb.clone();
        Box::pin(async move {
            let ports = Ports::new(0, port, 0);
            let connection = Connection::connect(adb, ports, uid, Duration::from_secs(60)).await?;
            connection.open().await?;
            Ok(connection)
        })
    });

    let rpc_client = RpcClient::new(
        UNKNOWN_UID,
        "test-serial",
        no_op_error_callback(),
        factory,
        Some(1),
    )
    .await
    .unwrap();

    EventDispatcher::new("test-serial", rpc_client, 60_000, Duration::from_secs(120))
}

#[tokio::test]
async fn handler_wins_over_queue() {
    let event = json!({"name": "Foo", "time": 1, "data": {"v": 1}});
    let dispatcher = build_dispatcher(vec![Step::Result(event)]).await;

    let seen: Arc<parking_lot::Mutex<Vec<Event>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen_for_handler = seen.clone();
    dispatcher
        .register_handler(
            "Foo",
            Arc::new(move |event: Event| {
                let seen = seen_for_handler.clone();
                Box::pin(async move {
                    seen.lock().push(event);
                })
            }),
        )
        .await
        .unwrap();

    dispatcher.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(seen.lock().len(), 1);
    assert_eq!(seen.lock()[0].name, "Foo");

    // The event went to the handler, not the queue: a short pop finds nothing.
    let queued = dispatcher
        .pop_event("Foo", Some(Duration::from_millis(50)))
        .await;
    assert!(matches!(queued, Err(Sl4aError::EmptyQueue(_))));

    dispatcher.close().await;
}

#[tokio::test]
async fn pop_events_matches_by_regex_and_sorts_by_time() {
    let alpha = json!({"name": "Alpha", "time": 5, "data": null});
    let beta = json!({"name": "Beta", "time": 2, "data": null});
    let dispatcher = build_dispatcher(vec![Step::Result(alpha), Step::Result(beta)]).await;

    dispatcher.start().await.unwrap();
    // Let both events land in their queues before popping, since pop_events
    // returns as soon as it finds any match rather than waiting for all of
    // them.
    tokio::time::sleep(Duration::from_millis(150)).await;

    let results = dispatcher
        .pop_events("^(Alpha|Beta)$", Duration::from_secs(2), Duration::from_millis(10))
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].name, "Beta");
    assert_eq!(results[0].time, 2);
    assert_eq!(results[1].name, "Alpha");
    assert_eq!(results[1].time, 5);

    dispatcher.close().await;
}

#[tokio::test]
async fn clear_events_empties_the_named_queue_unconditionally() {
    let event = json!({"name": "Foo", "time": 1, "data": null});
    let dispatcher = build_dispatcher(vec![Step::Result(event)]).await;
    dispatcher.start().await.unwrap();

    // Let the event land in the queue, then clear it twice in a row: the
    // second clear on an already-empty queue must not error or panic.
    tokio::time::sleep(Duration::from_millis(100)).await;
    dispatcher.clear_events("Foo");
    dispatcher.clear_events("Foo");

    let queued = dispatcher
        .pop_event("Foo", Some(Duration::from_millis(50)))
        .await;
    assert!(matches!(queued, Err(Sl4aError::EmptyQueue(_))));

    dispatcher.close().await;
}
