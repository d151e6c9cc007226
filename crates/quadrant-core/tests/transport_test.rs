//! End-to-end tests of the four exchange modes over a real server.

use axum::routing::get;
use axum::{Json, Router};
use quadrant_core::{
    ApiSchema, ClientConfig, ConnectionState, EventRegistry, PushConnection, RpcClient, RpcError,
    RpcServer, ServerConfig, ServerHandle, Service, ServiceImplementation, Shape, StreamEvent,
    Subscription,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Word {
    word: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Empty {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tick {
    n: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchInput {
    even_only: bool,
    limit: u32,
}

fn word_shape() -> Shape {
    Shape::object()
        .field("word", Shape::string().min_len(1))
        .into()
}

fn tick_shape() -> Shape {
    Shape::object().field("n", Shape::integer().min(0.0)).into()
}

quadrant_core::procedure! {
    struct Shout: Query in "Lab" as "Shout" {
        description: "Upper-case a word",
        input: Word = word_shape(),
        output: Word = word_shape(),
    }
}

quadrant_core::procedure! {
    struct Fail: Mutation in "Lab" as "Fail" {
        description: "Always fails",
        input: Word = word_shape(),
        output: Word = word_shape(),
    }
}

quadrant_core::procedure! {
    struct Drift: Query in "Lab" as "Drift" {
        description: "Returns a value its own schema rejects",
        input: Empty = Shape::object(),
        output: Word = word_shape(),
    }
}

quadrant_core::procedure! {
    struct Ticks: Subscription in "Lab" as "Ticks" {
        description: "Published ticks up to a limit",
        input: WatchInput = Shape::object()
            .field("evenOnly", Shape::bool())
            .field("limit", Shape::integer().min(0.0)),
        output: Tick = tick_shape(),
    }
}

quadrant_core::procedure! {
    struct Chat: Bidirectional in "Lab" as "Chat" {
        description: "Shouts every word back",
        input: Word = word_shape(),
        output: Word = word_shape(),
    }
}

const TOPIC: &str = "ticks";

struct Lab {
    handle: ServerHandle,
    client: RpcClient,
    ticks: Arc<EventRegistry<u32>>,
    /// Server-side close listener runs for Chat connections.
    chat_closes: Arc<AtomicUsize>,
}

fn lab_service() -> Service {
    Service::builder("Lab")
        .rpc::<Shout>()
        .rpc::<Fail>()
        .rpc::<Drift>()
        .rpc::<Ticks>()
        .rpc::<Chat>()
        .build()
        .unwrap()
}

async fn start_lab() -> Lab {
    let service = lab_service();
    let schema = ApiSchema::builder().service(service.clone()).build().unwrap();
    let ticks = Arc::new(EventRegistry::new());

    let chat_closes = Arc::new(AtomicUsize::new(0));

    let registry = Arc::clone(&ticks);
    let closes = Arc::clone(&chat_closes);
    let implementation = ServiceImplementation::builder(&service)
        .query::<Shout, _, _>(|input: Word| async move {
            Ok(Word {
                word: input.word.to_uppercase(),
            })
        })
        .mutation::<Fail, _, _>(|_input: Word| async move {
            Err(RpcError::procedure("Lab is closed for maintenance"))
        })
        .query::<Drift, _, _>(|_input: Empty| async move {
            Ok(Word {
                word: String::new(),
            })
        })
        .subscription::<Ticks, _, _>(move |input: WatchInput, conn: PushConnection<Tick>| {
            let registry = Arc::clone(&registry);
            async move {
                let writer = conn.clone();
                let key = registry.subscribe_filtered(
                    TOPIC,
                    move |n: &u32| !input.even_only || n % 2 == 0,
                    move |n: &u32| {
                        let _ = writer.write(&Tick { n: *n });
                        if *n >= input.limit {
                            writer.close();
                        }
                    },
                );
                conn.on_close(move || {
                    registry.unsubscribe(&key);
                });
                Ok(())
            }
        })
        .bidirectional::<Chat, _, _>(move |_context, conn| {
            let closes = Arc::clone(&closes);
            async move {
                conn.on_close(move || {
                    closes.fetch_add(1, Ordering::SeqCst);
                });
                conn.on_message("shout", |conn, message: Word| async move {
                    match message.word.as_str() {
                        "bye" => conn.close(),
                        "fail" => return Err(RpcError::procedure("cannot chat about fail")),
                        word => conn.send(&Word {
                            word: word.to_uppercase(),
                        })?,
                    }
                    Ok(())
                });
                Ok(())
            }
        })
        .build()
        .unwrap();

    let config = ServerConfig::default().with_keep_alive(Duration::from_millis(50));
    let handle = RpcServer::new(schema, vec![implementation])
        .unwrap()
        .start(&config)
        .await
        .unwrap();
    let client = RpcClient::new(ClientConfig::new(&handle.base_url()).unwrap()).unwrap();

    Lab {
        handle,
        client,
        ticks,
        chat_closes,
    }
}

async fn next<T>(subscription: &mut Subscription<T>) -> StreamEvent<T> {
    timeout(Duration::from_secs(5), subscription.next())
        .await
        .expect("timed out waiting for stream event")
        .expect("stream ended")
}

async fn wait_for_count(count: &AtomicUsize, expected: usize) {
    for _ in 0..250 {
        if count.load(Ordering::SeqCst) == expected {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected count {}, found {}",
        expected,
        count.load(Ordering::SeqCst)
    );
}

async fn wait_for_subscribers(registry: &EventRegistry<u32>, expected: usize) {
    for _ in 0..250 {
        if registry.subscriber_count(TOPIC) == expected {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected {} subscribers, found {}",
        expected,
        registry.subscriber_count(TOPIC)
    );
}

// ========================================
// QUERY / MUTATION
// ========================================

#[tokio::test]
async fn test_query_roundtrip_is_repeatable() {
    let lab = start_lab().await;
    let input = Word {
        word: "quiet".into(),
    };

    let first = lab.client.query::<Shout>(&input).await.unwrap();
    let second = lab.client.query::<Shout>(&input).await.unwrap();

    assert_eq!(first.word, "QUIET");
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_remote_error_text_is_verbatim() {
    let lab = start_lab().await;
    let err = lab
        .client
        .mutate::<Fail>(&Word { word: "x".into() })
        .await
        .unwrap_err();

    match err {
        RpcError::Remote { status, message } => {
            assert_eq!(status, Some(500));
            assert_eq!(message, "Lab is closed for maintenance");
        }
        other => panic!("Expected Remote error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_server_refuses_to_send_invalid_output() {
    let lab = start_lab().await;
    let err = lab.client.query::<Drift>(&Empty {}).await.unwrap_err();

    match err {
        RpcError::Remote { status, message } => {
            assert_eq!(status, Some(500));
            assert!(message.starts_with("Invalid output from Lab.Drift"));
        }
        other => panic!("Expected Remote error, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_input_never_reaches_the_network() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    {
        let accepted = Arc::clone(&accepted);
        tokio::spawn(async move {
            while listener.accept().await.is_ok() {
                accepted.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    let client = RpcClient::new(ClientConfig::new(&format!("http://{}", addr)).unwrap()).unwrap();

    let err = client
        .query::<Shout>(&Word {
            word: String::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidInput { .. }));

    let err = client
        .mutate::<Fail>(&Word {
            word: String::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidInput { .. }));

    sleep(Duration::from_millis(50)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_and_drifted_responses() {
    let app = Router::new()
        .route(
            "/_api/Lab/Shout",
            get(|| async { Json(json!({"result": {"word": "X"}})) }),
        )
        .route(
            "/_api/Lab/Drift",
            get(|| async { Json(json!({"data": {"word": 5}})) }),
        );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = RpcClient::new(ClientConfig::new(&format!("http://{}", addr)).unwrap()).unwrap();

    let err = client
        .query::<Shout>(&Word { word: "x".into() })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::MalformedResponse { .. }));

    let err = client.query::<Drift>(&Empty {}).await.unwrap_err();
    assert!(matches!(err, RpcError::InvalidOutput { .. }));
}

#[tokio::test]
async fn test_wire_status_codes() {
    let lab = start_lab().await;
    let base = lab.handle.base_url();
    let http = reqwest::Client::new();

    // MUTATION endpoint used as a QUERY, and vice versa
    let response = http
        .post(format!("{}/_api/Lab/Shout", base))
        .json(&json!({"word": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 405);

    let response = http.get(format!("{}/_api/Lab/Fail", base)).send().await.unwrap();
    assert_eq!(response.status(), 405);

    // BIDIRECTIONAL without an upgrade
    let response = http.get(format!("{}/_api/Lab/Chat", base)).send().await.unwrap();
    assert_eq!(response.status(), 405);

    let response = http.get(format!("{}/_api/Lab/Nope", base)).send().await.unwrap();
    assert_eq!(response.status(), 404);

    // Missing payload is `{}`, which lacks the required field
    let response = http.get(format!("{}/_api/Lab/Shout", base)).send().await.unwrap();
    assert_eq!(response.status(), 400);

    let response = http
        .get(format!("{}/_api/Lab/Shout", base))
        .query(&[("payload", r#"{"word":"hey"}"#)])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, json!({"data": {"word": "HEY"}}));

    let response = http.post(format!("{}/_webhook", base)).send().await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_health_and_schema_endpoints() {
    let lab = start_lab().await;
    let base = lab.handle.base_url();

    let health: serde_json::Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, json!({"status": "ok"}));

    let schema: serde_json::Value = reqwest::get(format!("{}/_api/_schema", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let service = &schema["services"][0];
    assert_eq!(service["name"], "Lab");
    assert_eq!(service["procedures"][0]["name"], "Shout");
    assert_eq!(service["procedures"][0]["kind"], "QUERY");
    assert_eq!(service["procedures"][3]["kind"], "SUBSCRIPTION");
    assert_eq!(service["procedures"][4]["kind"], "BIDIRECTIONAL");
}

// ========================================
// SUBSCRIPTION
// ========================================

#[tokio::test]
async fn test_subscription_receives_filtered_events_then_close() {
    let lab = start_lab().await;
    let mut ticks = lab
        .client
        .subscribe::<Ticks>(&WatchInput {
            even_only: true,
            limit: 4,
        })
        .await
        .unwrap();

    assert!(matches!(next(&mut ticks).await, StreamEvent::Opened));
    assert!(ticks.is_connected());
    wait_for_subscribers(&lab.ticks, 1).await;

    for n in 0..=4 {
        lab.ticks.publish(TOPIC, &n);
    }

    let mut received = Vec::new();
    loop {
        match next(&mut ticks).await {
            StreamEvent::Message(tick) => received.push(tick.n),
            StreamEvent::Closed => break,
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    assert_eq!(received, vec![0, 2, 4]);
    assert_eq!(ticks.state(), ConnectionState::Closed);

    // The server-side close listener deregistered the subscriber
    wait_for_subscribers(&lab.ticks, 0).await;

    // Closing an already closed stream is a no-op
    ticks.close();
    ticks.close();
}

#[tokio::test]
async fn test_client_close_releases_server_subscriber() {
    let lab = start_lab().await;
    let mut ticks = lab
        .client
        .subscribe::<Ticks>(&WatchInput {
            even_only: false,
            limit: 1000,
        })
        .await
        .unwrap();
    assert!(matches!(next(&mut ticks).await, StreamEvent::Opened));
    wait_for_subscribers(&lab.ticks, 1).await;

    let closed = Arc::new(AtomicUsize::new(0));
    {
        let closed = Arc::clone(&closed);
        ticks.on_close(move || {
            closed.fetch_add(1, Ordering::SeqCst);
        });
    }

    ticks.close();
    ticks.close();
    assert_eq!(ticks.state(), ConnectionState::Closed);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    drop(ticks);

    wait_for_subscribers(&lab.ticks, 0).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_subscription_rejects_invalid_input_remotely() {
    let lab = start_lab().await;
    let response = reqwest::Client::new()
        .get(format!("{}/_api/Lab/Ticks", lab.handle.base_url()))
        .query(&[("payload", r#"{"evenOnly":"yes","limit":1}"#)])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(lab.ticks.subscriber_count(TOPIC), 0);
}

// ========================================
// BIDIRECTIONAL
// ========================================

#[tokio::test]
async fn test_duplex_exchange_failure_and_close() {
    let lab = start_lab().await;
    let conn = lab.client.connect::<Chat>().await.unwrap();
    assert!(conn.is_open());

    let (tx, mut replies) = mpsc::unbounded_channel();
    conn.on_message("collect", move |_conn, message: Word| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message.word);
            Ok(())
        }
    });
    let (etx, mut errors) = mpsc::unbounded_channel();
    conn.on_error(move |err| {
        let _ = etx.send(err.to_string());
    });

    conn.send(&Word { word: "hi".into() }).unwrap();
    let reply = timeout(Duration::from_secs(5), replies.recv()).await.unwrap();
    assert_eq!(reply.as_deref(), Some("HI"));

    // A failing listener is reported on the live connection
    conn.send(&Word {
        word: "fail".into(),
    })
    .unwrap();
    let failure = timeout(Duration::from_secs(5), errors.recv()).await.unwrap();
    assert_eq!(failure.as_deref(), Some("cannot chat about fail"));
    assert!(conn.is_open());

    // Local validation, nothing is sent
    assert!(matches!(
        conn.send(&Word {
            word: String::new()
        }),
        Err(RpcError::InvalidInput { .. })
    ));

    // Server-initiated close
    conn.send(&Word { word: "bye".into() }).unwrap();
    timeout(Duration::from_secs(5), conn.closed()).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);

    assert!(matches!(
        conn.send(&Word {
            word: "again".into()
        }),
        Err(RpcError::ConnectionClosed)
    ));
    conn.close();
}

#[tokio::test]
async fn test_client_initiated_duplex_close() {
    let lab = start_lab().await;
    let conn = lab.client.connect::<Chat>().await.unwrap();

    let closed = Arc::new(AtomicUsize::new(0));
    {
        let closed = Arc::clone(&closed);
        conn.on_close(move || {
            closed.fetch_add(1, Ordering::SeqCst);
        });
    }

    conn.close();
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    // The server sees the close frame and runs its listeners once
    wait_for_count(&lab.chat_closes, 1).await;

    conn.close();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(lab.chat_closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropping_duplex_handle_closes_socket() {
    let lab = start_lab().await;
    let conn = lab.client.connect::<Chat>().await.unwrap();

    let (tx, mut replies) = mpsc::unbounded_channel();
    conn.on_message("collect", move |_conn, message: Word| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message.word);
            Ok(())
        }
    });
    let copy = conn.clone();
    copy.send(&Word { word: "hi".into() }).unwrap();
    let reply = timeout(Duration::from_secs(5), replies.recv()).await.unwrap();
    assert_eq!(reply.as_deref(), Some("HI"));

    // A surviving clone keeps the socket open
    drop(conn);
    sleep(Duration::from_millis(200)).await;
    assert!(copy.is_open());
    assert_eq!(lab.chat_closes.load(Ordering::SeqCst), 0);

    drop(copy);
    wait_for_count(&lab.chat_closes, 1).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(lab.chat_closes.load(Ordering::SeqCst), 1);
}

// ========================================
// Shutdown
// ========================================

#[tokio::test]
async fn test_shutdown_closes_live_connections() {
    let mut lab = start_lab().await;
    let mut ticks = lab
        .client
        .subscribe::<Ticks>(&WatchInput {
            even_only: false,
            limit: 1000,
        })
        .await
        .unwrap();
    assert!(matches!(next(&mut ticks).await, StreamEvent::Opened));
    wait_for_subscribers(&lab.ticks, 1).await;

    let chat = lab.client.connect::<Chat>().await.unwrap();

    lab.handle.shutdown();

    assert!(matches!(next(&mut ticks).await, StreamEvent::Closed));
    timeout(Duration::from_secs(5), chat.closed()).await.unwrap();
    wait_for_subscribers(&lab.ticks, 0).await;
}
