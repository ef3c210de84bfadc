//! Example streaming price ticks over SSE next to a buffered query.
//!
//! Starts a local server that answers `POST /rpc/market/quote` with a JSON
//! envelope and `POST /rpc/market/ticks` with an event stream, then calls
//! both through one client.
//!
//! ```text
//! RUST_LOG=hpx_rpc=debug cargo run -p hpx-rpc --example stream_ticks
//! ```

use std::{convert::Infallible, net::SocketAddr};

use futures_util::StreamExt;
use hpx_rpc::{EventSourceConfig, LoggingInterceptor, RpcClient};
use http_body_util::Full;
use hyper::{
    Request, Response,
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    let addr = run_server().await?;
    let client = RpcClient::builder(format!("http://{addr}/rpc"))
        .header("authorization", "Bearer demo")
        .event_source(EventSourceConfig::new().max_reconnects(3))
        .interceptor(LoggingInterceptor::info())
        .build()?;

    let quote = client.query(["market", "quote"], json!({"symbol": "BTC"})).await?;
    tracing::info!(?quote, "Quote");

    let mut ticks = client
        .subscribe(["market", "ticks"], json!({"symbol": "BTC"}))
        .await?;
    while let Some(tick) = ticks.next().await {
        let tick = tick?;
        tracing::info!(?tick, "Tick");
    }
    tracing::info!("Stream finished");

    Ok(())
}

async fn run_server() -> eyre::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(respond))
                    .await;
            });
        }
    });

    Ok(addr)
}

async fn respond(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let (content_type, body) = if req.uri().path().ends_with("/ticks") {
        let mut body = String::new();
        for (id, price) in [42_000.5, 42_001.0, 41_999.25].iter().enumerate() {
            body.push_str(&format!(
                "id: {id}\ndata: {}\n\n",
                json!({"json": {"symbol": "BTC", "price": price}})
            ));
        }
        body.push_str("data: [DONE]\n\n");
        ("text/event-stream", body)
    } else {
        let quote = json!({
            "json": {"symbol": "BTC", "volume": "184467440737095516150", "at": "2024-05-01T12:00:00.000Z"},
            "meta": [[0, "volume"], [1, "at"]]
        });
        ("application/json", quote.to_string())
    };

    let resp = Response::builder()
        .header("content-type", content_type)
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())));
    Ok(resp)
}
