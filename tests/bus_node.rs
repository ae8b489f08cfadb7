//! Integration tests for node pub/sub, service correlation and connection lifecycle

mod support;

use std::time::Duration;

use busnode::bus::{DispatchExit, DispatchState, Node};
use busnode::engine_core::errors::BusError;
use busnode::engine_core::models::InboundMessage;
use serde_json::{json, Value};
use support::{running_node, start, within, FakeDaemon};
use tokio::sync::mpsc;

#[tokio::test]
async fn test_publish_reaches_every_handler_of_the_topic_only() {
    let daemon = FakeDaemon::start().await;

    let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, InboundMessage)>();
    let listener = Node::new("listener", daemon.config());
    for (label, topic) in [("first", "/alerts"), ("second", "/alerts"), ("other", "/metrics")] {
        let tx = tx.clone();
        listener
            .subscribe(topic, move |msg: InboundMessage| {
                let tx = tx.clone();
                async move {
                    tx.send((label, msg))?;
                    anyhow::Ok(())
                }
            })
            .await
            .unwrap();
    }
    let listener = start(listener).await;
    daemon.wait_for_subscription("/alerts").await;
    daemon.wait_for_subscription("/metrics").await;

    let publisher = running_node(&daemon, "publisher").await;
    publisher
        .node
        .publish("/alerts", json!({"level": "critical"}))
        .await
        .unwrap();

    let mut labels = Vec::new();
    for _ in 0..2 {
        let (label, msg) = within(rx.recv()).await.unwrap();
        assert_eq!(msg.topic, "/alerts");
        assert_eq!(msg.payload, json!({"level": "critical"}));
        assert_eq!(msg.sender.as_deref(), Some("publisher"));
        labels.push(label);
    }
    labels.sort();
    assert_eq!(labels, vec!["first", "second"]);

    // Nothing for the /metrics handler.
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.is_err());

    // A single wire subscription per topic despite two handlers.
    let subscribes = daemon
        .records()
        .into_iter()
        .filter(|r| r["op"] == "subscribe" && r["topic"] == "/alerts")
        .count();
    assert_eq!(subscribes, 1);

    listener.handle.shutdown();
    assert_eq!(within(listener.dispatch).await.unwrap(), DispatchExit::Cancelled);
}

#[tokio::test]
async fn test_concurrent_calls_resolve_their_own_caller() {
    let daemon = FakeDaemon::start().await;

    let server = Node::new("server", daemon.config());
    server
        .register_service("/double", |payload: Value| async move {
            let n = payload["n"].as_i64().unwrap_or_default();
            // Finish out of order.
            tokio::time::sleep(Duration::from_millis((20 - n as u64) * 2)).await;
            anyhow::Ok(json!({"n": n, "doubled": n * 2}))
        })
        .await
        .unwrap();
    let _server = start(server).await;
    daemon.wait_for_service("/double").await;

    let client = running_node(&daemon, "client").await;
    let calls: Vec<_> = (0..10)
        .map(|n| {
            let node = client.node.clone();
            tokio::spawn(async move { (n, node.call_service("/double", json!({"n": n}), None).await) })
        })
        .collect();

    for call in calls {
        let (n, result) = within(call).await.unwrap();
        let response = result.unwrap();
        assert_eq!(response, json!({"n": n, "doubled": n * 2}));
    }

    // Each call went out with its own request id.
    let mut ids: Vec<String> = daemon
        .records()
        .into_iter()
        .filter(|r| r["op"] == "call_service")
        .map(|r| r["request_id"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10);
}

#[tokio::test]
async fn test_failing_handlers_still_answer_exactly_once() {
    let daemon = FakeDaemon::start().await;

    let server = Node::new("server", daemon.config());
    server
        .register_service("/fails", |_payload: Value| async move {
            Err::<Value, _>(anyhow::anyhow!("database unavailable"))
        })
        .await
        .unwrap();
    server
        .register_service("/panics", |_payload: Value| async move {
            if true {
                panic!("handler bug");
            }
            anyhow::Ok(Value::Null)
        })
        .await
        .unwrap();
    let server = start(server).await;
    daemon.wait_for_service("/fails").await;
    daemon.wait_for_service("/panics").await;

    let client = running_node(&daemon, "client").await;

    let err = within(client.node.call_service("/fails", json!({}), None))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, BusError::Remote { service, message } if service == "/fails" && message.contains("database unavailable")),
        "unexpected error: {:?}",
        err
    );

    let err = within(client.node.call_service("/panics", json!({}), None))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Remote { .. }));

    let responses = daemon
        .records()
        .into_iter()
        .filter(|r| r["op"] == "service_response")
        .count();
    assert_eq!(responses, 2);

    // The serving loop survived both failures.
    assert_eq!(server.handle.state(), DispatchState::Running);
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    let daemon = FakeDaemon::start().await;
    let client = running_node(&daemon, "client").await;

    // No node advertises /nobody, so the daemon drops the call.
    let err = within(client.node.call_service("/nobody", json!({}), Some(Duration::from_millis(50))))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Timeout { ref service, .. } if service == "/nobody"));
}

#[tokio::test]
async fn test_connection_loss_fails_pending_calls() {
    let daemon = FakeDaemon::start().await;

    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
    let server = Node::new("server", daemon.config());
    server
        .register_service("/stuck", move |_payload: Value| {
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                std::future::pending::<()>().await;
                anyhow::Ok(Value::Null)
            }
        })
        .await
        .unwrap();
    let _server = start(server).await;
    daemon.wait_for_service("/stuck").await;

    let client = running_node(&daemon, "client").await;
    let node = client.node.clone();
    let call = tokio::spawn(async move { node.call_service("/stuck", json!({}), None).await });

    within(started_rx.recv()).await.unwrap();
    daemon.kill_connections();

    let result = within(call).await.unwrap();
    assert!(matches!(result, Err(BusError::ConnectionLost)));
    assert_eq!(within(client.dispatch).await.unwrap(), DispatchExit::ConnectionClosed);
    assert!(!client.node.is_connected());
    assert!(matches!(
        client.node.publish("/t", json!(1)).await,
        Err(BusError::NotConnected)
    ));
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_handlers() {
    let daemon = FakeDaemon::start().await;

    let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
    let server = Node::new("server", daemon.config());
    server
        .register_service("/slow", move |payload: Value| {
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_millis(100)).await;
                anyhow::Ok(payload)
            }
        })
        .await
        .unwrap();
    let server = start(server).await;
    daemon.wait_for_service("/slow").await;

    let client = running_node(&daemon, "client").await;
    let node = client.node.clone();
    let call = tokio::spawn(async move { node.call_service("/slow", json!("kept"), None).await });

    within(started_rx.recv()).await.unwrap();
    server.handle.shutdown();

    // The in-flight handler finishes and its answer still goes out.
    assert_eq!(within(call).await.unwrap().unwrap(), json!("kept"));
    assert_eq!(within(server.dispatch).await.unwrap(), DispatchExit::Cancelled);
    within(server.handle.wait_for(DispatchState::Stopped)).await;
    assert!(!server.node.is_connected());
}

#[tokio::test]
async fn test_late_subscription_is_announced_on_live_connection() {
    let daemon = FakeDaemon::start().await;
    let listener = running_node(&daemon, "listener").await;

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    listener
        .node
        .subscribe("/late", move |msg: InboundMessage| {
            let tx = tx.clone();
            async move {
                tx.send(msg.payload)?;
                anyhow::Ok(())
            }
        })
        .await
        .unwrap();
    daemon.wait_for_subscription("/late").await;

    let publisher = running_node(&daemon, "publisher").await;
    publisher.node.publish("/late", json!(42)).await.unwrap();
    assert_eq!(within(rx.recv()).await.unwrap(), json!(42));
}
