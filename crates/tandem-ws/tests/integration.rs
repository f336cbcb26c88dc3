//! End-to-end tests over real WebSocket connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tandem_core::{CloseReason, HandlerError, RpcError};
use tandem_ws::{
    Broker, BrokerConfig, BrokerError, BrokerOptions, Client, ClientConfig, ClientError,
    LifecycleHooks,
};
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn boot_broker() -> Broker {
    boot_broker_with(BrokerConfig::default()).await
}

async fn boot_broker_with(config: BrokerConfig) -> Broker {
    Broker::create(BrokerOptions::new(config)).await.unwrap()
}

fn client() -> Client {
    Client::new(ClientConfig::default())
}

/// Poll `cond` until it holds or the timeout elapses.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn upper(args: Vec<Value>) -> Result<Value, HandlerError> {
    let text = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::invalid_args("expected a string"))?;
    Ok::<_, HandlerError>(json!(text.to_uppercase()))
}

type RawSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_json(ws: &mut RawSocket) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

// ── Endpoint semantics over the wire ────────────────────────────────

#[tokio::test]
async fn call_without_handler_resolves_none() {
    let broker = boot_broker().await;
    let ep = client().create(&broker.url()).await.unwrap();
    let res = timeout(TIMEOUT, ep.call("say", vec![json!("hello")])).await.unwrap();
    assert_eq!(res.unwrap(), None);
    broker.close().await;
}

#[tokio::test]
async fn call_with_broker_handler_returns_data() {
    let broker = boot_broker().await;
    let _ = broker.on_call("say", upper);
    let ep = client().create(&broker.url()).await.unwrap();
    assert_eq!(ep.call("say", vec![json!("hi")]).await.unwrap(), Some(json!("HI")));
    broker.close().await;
}

#[tokio::test]
async fn registration_fans_out_to_live_peers() {
    let broker = boot_broker().await;
    let ep = client().create(&broker.url()).await.unwrap();
    wait_until(|| broker.connection_count() == 1).await;

    // Registered after the peer connected.
    let id = broker.on_call("say", upper);
    assert_eq!(broker.handler_count("say"), 1);
    assert_eq!(ep.call("say", vec![json!("late")]).await.unwrap(), Some(json!("LATE")));

    assert!(broker.remove_handler("say", id));
    assert!(!broker.remove_handler("say", id));
    assert_eq!(broker.handler_count("say"), 0);
    assert_eq!(ep.call("say", vec![json!("late")]).await.unwrap(), None);
    broker.close().await;
}

#[tokio::test]
async fn concurrent_calls_resolve_with_their_own_results() {
    let broker = boot_broker().await;
    let _ = broker.on_call("delay", |args: Vec<Value>| async move {
        let n = args[0].as_u64().unwrap_or_default();
        tokio::time::sleep(Duration::from_millis(80 - n * 10)).await;
        Ok::<_, HandlerError>(json!(format!("r{n}")))
    });
    let ep = client().create(&broker.url()).await.unwrap();

    let calls = (0..8u64).map(|n| {
        let ep = ep.clone();
        async move { (n, ep.call("delay", vec![json!(n)]).await) }
    });
    for (n, res) in futures::future::join_all(calls).await {
        assert_eq!(res.unwrap(), Some(json!(format!("r{n}"))));
    }
    broker.close().await;
}

#[tokio::test]
async fn broker_calls_every_peer() {
    let broker = boot_broker().await;
    let hits = Arc::new(Mutex::new(Vec::new()));

    let mut peers = Vec::new();
    for tag in ["a", "b"] {
        let ep = client().create(&broker.url()).await.unwrap();
        let hits = hits.clone();
        let _ = ep.on_call("say", move |args: Vec<Value>| {
            hits.lock().push((tag, args.clone()));
            async move {
                let text = args[0].as_str().unwrap_or_default();
                Ok::<_, HandlerError>(json!(format!("{tag}:{text}")))
            }
        });
        peers.push(ep);
    }
    wait_until(|| broker.connection_count() == 2).await;

    let mut results = broker.call("say", vec![json!("hello")]).await.unwrap();
    results.sort_by_key(|v| v.as_ref().map(ToString::to_string));
    assert_eq!(results, vec![Some(json!("a:hello")), Some(json!("b:hello"))]);

    let mut seen = hits.lock().clone();
    seen.sort_by_key(|(tag, _)| *tag);
    assert_eq!(
        seen,
        vec![("a", vec![json!("hello")]), ("b", vec![json!("hello")])]
    );
    broker.close().await;
}

#[tokio::test]
async fn broker_call_with_no_peers_is_empty() {
    let broker = boot_broker().await;
    assert!(broker.call("anything", vec![]).await.unwrap().is_empty());
    broker.close().await;
}

#[tokio::test]
async fn call_settled_reports_each_peer() {
    let broker = boot_broker().await;
    let answering = client().create(&broker.url()).await.unwrap();
    let _ = answering.on_call("ping", |_args: Vec<Value>| async {
        Ok::<_, HandlerError>(json!("pong"))
    });
    let silent = client().create(&broker.url()).await.unwrap();
    wait_until(|| broker.connection_count() == 2).await;

    let settled = broker.call_settled("ping", vec![]).await;
    assert_eq!(settled.len(), 2);
    let mut values: Vec<Option<Value>> = settled.into_iter().map(|(_, r)| r.unwrap()).collect();
    values.sort_by_key(Option::is_some);
    assert_eq!(values, vec![None, Some(json!("pong"))]);
    drop(silent);
    broker.close().await;
}

#[tokio::test]
async fn broker_wait_for_returns_first_call_args() {
    let broker = boot_broker().await;
    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.wait_for("hello").await })
    };
    wait_until(|| broker.handler_count("hello") == 1).await;

    let ep = client().create(&broker.url()).await.unwrap();
    assert_eq!(ep.call("hello", vec![json!("world")]).await.unwrap(), None);
    assert_eq!(waiter.await.unwrap().unwrap(), vec![json!("world")]);
    assert_eq!(broker.handler_count("hello"), 0);
    broker.close().await;
}

#[tokio::test]
async fn broker_wait_for_fails_on_close() {
    let broker = boot_broker().await;
    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.wait_for("never").await })
    };
    wait_until(|| broker.handler_count("never") == 1).await;
    broker.close().await;
    assert_matches!(waiter.await.unwrap(), Err(BrokerError::Closed));
}

#[tokio::test]
async fn pending_call_rejected_when_broker_closes() {
    let broker = boot_broker().await;
    let _ = broker.on_call("hang", |_args: Vec<Value>| async {
        futures::future::pending::<()>().await;
        Ok::<_, HandlerError>(Value::Null)
    });
    let ep = client().create(&broker.url()).await.unwrap();
    let call = {
        let ep = ep.clone();
        tokio::spawn(async move { ep.call("hang", vec![]).await })
    };
    wait_until(|| broker.connection_count() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.close().await;

    assert_matches!(
        timeout(TIMEOUT, call).await.unwrap().unwrap(),
        Err(RpcError::ConnectionClosed)
    );
    timeout(TIMEOUT, ep.closed()).await.unwrap();
    assert_matches!(ep.call("x", vec![]).await, Err(RpcError::NotOpen));
}

#[tokio::test]
async fn handler_failure_sends_no_response() {
    let broker = boot_broker().await;
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    let _ = broker.on_call_with_error(
        "fail",
        |_args: Vec<Value>| async { Err::<Value, _>(HandlerError::failed("nope")) },
        move |_err| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        },
    );
    let ep = client().create(&broker.url()).await.unwrap();
    let pending = timeout(Duration::from_millis(200), ep.call("fail", vec![])).await;
    assert!(pending.is_err());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    broker.close().await;
}

// ── Raw sockets ─────────────────────────────────────────────────────

#[tokio::test]
async fn raw_peer_gets_bare_ack_and_binary_is_text() {
    let broker = boot_broker().await;
    let _ = broker.on_call("say", upper);
    let (mut ws, _) = connect_async(broker.url()).await.unwrap();

    ws.send(Message::text(r#"{"_id":1,"name":"nobody","args":[]}"#)).await.unwrap();
    assert_eq!(next_json(&mut ws).await, json!({"_id": 1}));

    ws.send(Message::binary(br#"{"_id":2,"name":"say","args":["bin"]}"#.to_vec())).await.unwrap();
    assert_eq!(next_json(&mut ws).await, json!({"_id": 2, "responseData": "BIN"}));
    broker.close().await;
}

#[tokio::test]
async fn malformed_frames_do_not_break_the_connection() {
    let broker = boot_broker().await;
    let _ = broker.on_call("say", upper);
    let (mut ws, _) = connect_async(broker.url()).await.unwrap();

    ws.send(Message::text("garbage")).await.unwrap();
    ws.send(Message::text(r#"{"name":"say","args":["x"]}"#)).await.unwrap();
    ws.send(Message::text(r#"{"_id":9,"name":"say","args":["still"]}"#)).await.unwrap();
    assert_eq!(next_json(&mut ws).await, json!({"_id": 9, "responseData": "STILL"}));
    assert_eq!(broker.connection_count(), 1);
    broker.close().await;
}

// ── Heartbeat ───────────────────────────────────────────────────────

#[tokio::test]
async fn silent_peer_terminated_within_two_intervals() {
    let broker = boot_broker_with(BrokerConfig {
        heartbeat_interval_ms: 100,
        ..BrokerConfig::default()
    })
    .await;

    // Never polled, so it never answers pings.
    let (_silent, _) = connect_async(broker.url()).await.unwrap();
    wait_until(|| broker.connection_count() == 1).await;

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(broker.connection_count(), 0);
    broker.close().await;
}

#[tokio::test]
async fn responsive_peer_survives_heartbeats() {
    let broker = boot_broker_with(BrokerConfig {
        heartbeat_interval_ms: 50,
        ..BrokerConfig::default()
    })
    .await;
    let ep = client().create(&broker.url()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(ep.is_open());
    assert_eq!(broker.connection_count(), 1);
    broker.close().await;
}

// ── Client lifecycle ────────────────────────────────────────────────

#[tokio::test]
async fn connect_returns_continuation_result() {
    let broker = boot_broker().await;
    let _ = broker.on_call("say", upper);
    let (value, ep) = client()
        .connect(&broker.url(), |ep| async move {
            let value = ep.call("say", vec![json!("cont")]).await?;
            Ok::<_, ClientError>((value, ep))
        })
        .await
        .unwrap();
    assert_eq!(value, Some(json!("CONT")));
    assert!(ep.is_open());
    broker.close().await;
}

#[tokio::test]
async fn connect_reports_closed_when_connection_drops() {
    let broker = boot_broker().await;
    let started = Arc::new(Notify::new());
    let task = {
        let url = broker.url();
        let started = started.clone();
        tokio::spawn(async move {
            client()
                .connect(&url, |_ep| async move {
                    started.notify_one();
                    futures::future::pending::<Result<(), ClientError>>().await
                })
                .await
        })
    };
    started.notified().await;
    broker.close().await;
    assert_matches!(timeout(TIMEOUT, task).await.unwrap().unwrap(), Err(ClientError::Closed));
}

#[tokio::test]
async fn connect_propagates_continuation_error_and_closes() {
    let broker = boot_broker().await;
    let err = client()
        .connect(&broker.url(), |_ep| async {
            Err::<(), ClientError>(anyhow::anyhow!("bad input").into())
        })
        .await
        .unwrap_err();
    assert_matches!(err, ClientError::Other(_));
    wait_until(|| broker.connection_count() == 0).await;
    broker.close().await;
}

#[tokio::test]
async fn create_against_closed_port_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let err = client().create(&format!("ws://{addr}")).await.unwrap_err();
    assert_matches!(err, ClientError::Connect { .. });
}

#[tokio::test]
async fn auto_reconnect_waits_for_listener_to_appear() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let attempts = Arc::new(AtomicUsize::new(0));
    let task = {
        let attempts = attempts.clone();
        tokio::spawn(async move {
            client()
                .auto_reconnect(
                    &format!("ws://{addr}"),
                    move |ep| {
                        let _ = attempts.fetch_add(1, Ordering::SeqCst);
                        async move {
                            Ok::<_, ClientError>(ep.call("say", vec![json!("late")]).await?)
                        }
                    },
                    Duration::from_millis(100),
                )
                .await
        })
    };

    // Nothing is listening yet; the client keeps dialing.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!task.is_finished());
    assert_eq!(attempts.load(Ordering::SeqCst), 0);

    let broker = boot_broker_with(BrokerConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..BrokerConfig::default()
    })
    .await;
    let _ = broker.on_call("say", upper);

    let res = timeout(TIMEOUT, task).await.unwrap().unwrap();
    assert_eq!(res.unwrap(), Some(json!("LATE")));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    broker.close().await;
}

#[tokio::test]
async fn auto_reconnect_rejects_unusable_url() {
    let attempts = AtomicUsize::new(0);
    let res = timeout(
        TIMEOUT,
        client().auto_reconnect(
            "http://127.0.0.1/",
            |_ep| {
                let _ = attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), ClientError>(()) }
            },
            Duration::from_millis(10),
        ),
    )
    .await
    .unwrap();
    assert_matches!(res, Err(ClientError::Connect { .. }));
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn auto_reconnect_does_not_retry_continuation_errors() {
    let broker = boot_broker().await;
    let attempts = AtomicUsize::new(0);
    let res: Result<(), _> = client()
        .auto_reconnect(
            &broker.url(),
            |_ep| {
                let _ = attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), ClientError>(anyhow::anyhow!("fatal").into()) }
            },
            Duration::from_millis(10),
        )
        .await;
    assert_matches!(res, Err(ClientError::Other(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    broker.close().await;
}

#[tokio::test]
async fn auto_reconnect_survives_listener_restart() {
    let first = boot_broker().await;
    let addr = first.local_addr();
    let url = first.url();

    let attempts = Arc::new(AtomicUsize::new(0));
    let connected = Arc::new(Notify::new());
    let task = {
        let attempts = attempts.clone();
        let connected = connected.clone();
        tokio::spawn(async move {
            client()
                .auto_reconnect(
                    &url,
                    move |ep| {
                        let n = attempts.fetch_add(1, Ordering::SeqCst);
                        let connected = connected.clone();
                        async move {
                            if n == 0 {
                                connected.notify_one();
                                futures::future::pending::<()>().await;
                            }
                            Ok::<_, ClientError>(ep.call("say", vec![json!("again")]).await?)
                        }
                    },
                    Duration::from_millis(500),
                )
                .await
        })
    };

    connected.notified().await;
    first.close().await;

    // Restart on the same address while the client is backing off.
    let second = boot_broker_with(BrokerConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..BrokerConfig::default()
    })
    .await;
    let _ = second.on_call("say", upper);

    let res = timeout(TIMEOUT, task).await.unwrap().unwrap();
    assert_eq!(res.unwrap(), Some(json!("AGAIN")));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    second.close().await;
}

// ── Broker surface ──────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_connections() {
    let broker = boot_broker().await;
    let _ = broker.on_call("say", upper);
    let _ep = client().create(&broker.url()).await.unwrap();
    wait_until(|| broker.connection_count() == 1).await;

    let body: Value = reqwest::get(format!("http://{}/health", broker.local_addr()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
    assert_eq!(body["max_connections"], 1024);
    assert_eq!(body["pending_calls"], 0);
    assert_eq!(body["handlers"], 1);
    assert_eq!(body["operations"], json!(["say"]));
    broker.close().await;
}

#[tokio::test]
async fn bind_conflict_is_reported() {
    let first = boot_broker().await;
    let addr = first.local_addr();
    let err = Broker::create(BrokerOptions::new(BrokerConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        ..BrokerConfig::default()
    }))
    .await
    .unwrap_err();
    assert_matches!(err, BrokerError::Bind { .. });
    first.close().await;
}

#[tokio::test]
async fn pre_bound_listener_is_adopted() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = Broker::create(BrokerOptions::default().with_listener(listener)).await.unwrap();
    assert_eq!(broker.local_addr(), addr);
    let ep = client().create(&broker.url()).await.unwrap();
    assert!(ep.is_open());
    broker.close().await;
}

#[tokio::test]
async fn connections_over_limit_are_refused() {
    let broker = boot_broker_with(BrokerConfig {
        max_connections: 1,
        ..BrokerConfig::default()
    })
    .await;
    let _first = client().create(&broker.url()).await.unwrap();
    wait_until(|| broker.connection_count() == 1).await;
    assert_matches!(client().create(&broker.url()).await, Err(ClientError::Connect { .. }));
    broker.close().await;
}

#[tokio::test]
async fn lifecycle_hooks_fire_on_broker() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let (opened, closed) = (events.clone(), events.clone());
    let hooks = LifecycleHooks::new()
        .on_open(move |_ep| opened.lock().push("open".to_owned()))
        .on_close(move |_ep, reason| closed.lock().push(format!("close {reason:?}")));
    let broker = Broker::create(BrokerOptions::default().with_hooks(hooks)).await.unwrap();

    let ep = client().create(&broker.url()).await.unwrap();
    wait_until(|| broker.connection_count() == 1).await;
    ep.close();
    wait_until(|| events.lock().len() == 2).await;
    assert_eq!(broker.connection_count(), 0);

    let events = events.lock().clone();
    assert_eq!(events[0], "open");
    assert!(events[1].starts_with("close"));
    assert_ne!(events[1], format!("close {:?}", CloseReason::Local));
    broker.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_drops_peers() {
    let broker = boot_broker().await;
    let ep = client().create(&broker.url()).await.unwrap();
    wait_until(|| broker.connection_count() == 1).await;
    broker.close().await;
    broker.close().await;
    assert!(broker.is_closed());
    timeout(TIMEOUT, ep.closed()).await.unwrap();
    wait_until(|| broker.connection_count() == 0).await;
    assert!(client().create(&broker.url()).await.is_err());
}
