//! Integration tests for buffered calls.
//!
//! The first half runs against a mock hyper server through the default
//! reqwest fetcher; the second half uses a scripted fetcher with paused
//! time to exercise timeouts and cancellation.

#![cfg(feature = "reqwest")]

mod common;

use std::{convert::Infallible, net::SocketAddr, time::Duration};

use chrono::{TimeZone, Utc};
use common::{Script, ScriptedFetch};
use hpx_rpc::{Call, ErrorCode, RpcClient, RpcValue, SuccessPredicate};
use http_body_util::{BodyExt, Full};
use hyper::{
    Method, Request, Response,
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Mock server helpers
// ---------------------------------------------------------------------------

/// What the mock server saw.
#[derive(Debug)]
struct Captured {
    method: Method,
    path: String,
    authorization: Option<String>,
    body: Value,
}

/// Start a mock server answering every request with `status` and a JSON
/// `body`. Received requests are forwarded on the returned channel.
async fn start_server(status: u16, body: Value) -> (SocketAddr, mpsc::UnboundedReceiver<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = mpsc::unbounded_channel();
    let body = Bytes::from(body.to_string());

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            let body = body.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let tx = tx.clone();
                    let body = body.clone();
                    async move {
                        let method = req.method().clone();
                        let path = req.uri().path().to_string();
                        let authorization = req
                            .headers()
                            .get("authorization")
                            .and_then(|value| value.to_str().ok())
                            .map(str::to_string);
                        let received = req
                            .into_body()
                            .collect()
                            .await
                            .map(|collected| collected.to_bytes())
                            .unwrap_or_default();
                        let _ = tx.send(Captured {
                            method,
                            path,
                            authorization,
                            body: serde_json::from_slice(&received).unwrap_or(Value::Null),
                        });

                        let resp = Response::builder()
                            .status(status)
                            .header("content-type", "application/json")
                            .body(Full::new(body))
                            .expect("build response");
                        Ok::<_, Infallible>(resp)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, rx)
}

fn live_client(addr: SocketAddr) -> RpcClient {
    RpcClient::builder(format!("http://{addr}/rpc/"))
        .header("authorization", "Bearer secret")
        .build()
        .expect("build client")
}

// ---------------------------------------------------------------------------
// Live round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_query_restores_tagged_values() {
    let (addr, mut requests) = start_server(
        200,
        json!({
            "json": {
                "id": "9007199254740993",
                "createdAt": "2024-01-01T00:00:00.000Z",
                "tags": ["rocky", "cold"],
                "name": "Hoth"
            },
            "meta": [[0, "id"], [1, "createdAt"], [6, "tags"]]
        }),
    )
    .await;
    let client = live_client(addr);

    let planet = client
        .query(["planet", "find"], json!({"id": 1}))
        .await
        .expect("query succeeds");

    assert_eq!(planet.get("id"), Some(&RpcValue::BigInt(9_007_199_254_740_993)));
    assert_eq!(
        planet.get("createdAt"),
        Some(&RpcValue::Date(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()))
    );
    assert_eq!(
        planet.get("tags"),
        Some(&RpcValue::Set(vec![
            RpcValue::String("rocky".to_string()),
            RpcValue::String("cold".to_string()),
        ]))
    );
    assert_eq!(planet.get("name").and_then(RpcValue::as_str), Some("Hoth"));

    let captured = requests.recv().await.expect("request captured");
    assert_eq!(captured.method, Method::POST);
    assert_eq!(captured.path, "/rpc/planet/find");
    assert_eq!(captured.authorization.as_deref(), Some("Bearer secret"));
    assert_eq!(captured.body, json!({"json": {"id": 1}}));
}

#[tokio::test]
async fn test_error_envelope_is_classified() {
    let (addr, _requests) = start_server(
        404,
        json!({"json": {"code": "NOT_FOUND", "message": "Planet not found", "data": {"id": 42}}}),
    )
    .await;

    let err = live_client(addr)
        .query(["planet", "find"], json!({"id": 42}))
        .await
        .unwrap_err();

    assert_eq!(err.code(), &ErrorCode::NotFound);
    assert_eq!(err.status(), 404);
    assert_eq!(err.message(), "Planet not found");
    assert_eq!(err.data(), Some(&json!({"id": 42})));
}

#[tokio::test]
async fn test_unknown_code_falls_back_to_status() {
    let (addr, _requests) = start_server(503, json!({"code": "WEIRD"})).await;

    let err = live_client(addr)
        .query(["planet", "list"], Value::Null)
        .await
        .unwrap_err();

    assert_eq!(err.code(), &ErrorCode::ServiceUnavailable);
    assert_eq!(err.status(), 503);
    assert!(err.message().starts_with("HTTP 503"));
}

#[tokio::test]
async fn test_business_code_fails_success_predicate() {
    let (addr, _requests) = start_server(
        200,
        json!({"json": {"code": 1001, "message": "Insufficient balance", "data": {"balance": 3}}}),
    )
    .await;
    let client = RpcClient::builder(format!("http://{addr}/rpc"))
        .success_predicate(SuccessPredicate::sentinel(0))
        .build()
        .expect("build client");

    let err = client.query(["wallet", "pay"], json!({"amount": 5})).await.unwrap_err();
    assert_eq!(err.code(), &ErrorCode::Other("1001".to_string()));
    assert_eq!(err.message(), "Insufficient balance");
    assert_eq!(err.data(), Some(&json!({"balance": 3})));
}

#[tokio::test]
async fn test_success_sentinel_passes() {
    let (addr, _requests) = start_server(200, json!({"json": {"code": 0, "balance": 2}})).await;
    let client = RpcClient::builder(format!("http://{addr}/rpc"))
        .success_predicate(SuccessPredicate::sentinel(0))
        .build()
        .expect("build client");

    let value = client.query(["wallet", "pay"], json!({"amount": 1})).await.expect("query");
    assert_eq!(value.get("balance").and_then(RpcValue::as_i64), Some(2));
}

#[tokio::test]
async fn test_refused_connection_is_service_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let err = live_client(addr).query(["ping"], Value::Null).await.unwrap_err();
    assert_eq!(err.code(), &ErrorCode::ServiceUnavailable);
    assert!(err.cause().is_some());
}

// ---------------------------------------------------------------------------
// Timeouts and cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_timeout() {
    let client = RpcClient::builder("http://localhost:3000/rpc")
        .fetch(ScriptedFetch::new([Script::Stall]))
        .timeout(Some(Duration::from_millis(100)))
        .build()
        .expect("build client");

    let err = client.query(["slow"], Value::Null).await.unwrap_err();
    assert_eq!(err.code(), &ErrorCode::Timeout);
    assert_eq!(err.message(), "Request timed out after 100ms");
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_buffered_call() {
    let fetch = ScriptedFetch::new([Script::Stall]);
    let client = RpcClient::builder("http://localhost:3000/rpc")
        .fetch(fetch.clone())
        .timeout(None)
        .build()
        .expect("build client");
    let signal = CancellationToken::new();

    let cancel = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
    });

    let err = client
        .call(Call::new(["slow"], Value::Null).with_signal(signal))
        .await
        .unwrap_err();
    assert!(err.is_client_closed());
    assert_eq!(fetch.request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_null_payload() {
    let fetch = ScriptedFetch::new([Script::json(200, json!({"json": null}))]);
    let client = RpcClient::builder("http://localhost:3000/rpc")
        .fetch(fetch)
        .build()
        .expect("build client");

    let value = client.query(["empty"], Value::Null).await.expect("query");
    assert!(value.is_null());
}
