#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tablecast::{RunningStreamer, StreamConfig, TableStreamer};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const HEADER: &str = "Date,Store ID,Product ID,Category,Region,Inventory Level,Units Sold,Units Ordered,Demand Forecast,Price,Discount,Weather Condition,Holiday/Promotion,Competitor Pricing,Seasonality";

/// One `S001` row per `(product, units_sold, price)`.
pub fn inventory_csv(rows: &[(&str, i64, f64)]) -> String {
    let mut out = format!("{HEADER}\n");
    for (product, units_sold, price) in rows {
        out.push_str(&format!(
            "2024-01-01,S001,{product},Groceries,North,120,{units_sold},50,110.5,{price},10,Sunny,0,31.2,Winter\n"
        ));
    }
    out
}

/// Replace `path` through a rename so no reader ever sees a partial file.
pub fn replace_file(path: &Path, contents: &str) {
    let staging = path.with_extension("staging");
    std::fs::write(&staging, contents).expect("write staging file");
    std::fs::rename(&staging, path).expect("rename into place");
}

/// Fast debounce, polling on, every broadcaster on an ephemeral port.
pub fn test_config(dir: &Path) -> StreamConfig {
    let mut config = StreamConfig::default();
    config.csv_path = dir.join("inventory.csv");
    config.debounce_ms = 50;
    config.poll_interval_ms = Some(100);
    for broadcaster in [&mut config.socket, &mut config.channels, &mut config.pull_push] {
        broadcaster.bind = SocketAddr::from(([127, 0, 0, 1], 0));
        broadcaster.send_timeout_ms = 1000;
    }
    config
}

pub async fn start(config: StreamConfig) -> (TableStreamer, RunningStreamer) {
    let streamer = TableStreamer::new(config).expect("valid config");
    let running = streamer.start().await.expect("streamer starts");
    (streamer, running)
}

pub fn ws_url(running: &RunningStreamer, broadcaster: &str, path: &str) -> String {
    let addr = running.local_addr(broadcaster).expect("broadcaster running");
    format!("ws://{addr}{path}")
}

pub fn http_url(running: &RunningStreamer, path: &str) -> String {
    let addr = running.local_addr("pull_push").expect("pull/push running");
    format!("http://{addr}{path}")
}

pub async fn connect(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("ws connect");
    ws
}

/// Next text frame as JSON, failing the test after 5s.
pub async fn next_json(ws: &mut Ws) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("frame is JSON");
        }
    }
}

/// Skip frames until one matches `pred`.
pub async fn next_matching(ws: &mut Ws, pred: impl Fn(&Value) -> bool) -> Value {
    loop {
        let doc = next_json(ws).await;
        if pred(&doc) {
            return doc;
        }
    }
}

pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// GET `url`; returns (status, JSON body or `Null`).
pub async fn http_get(url: &str) -> (u16, Value) {
    let response = reqwest::get(url).await.expect("http request");
    let status = response.status().as_u16();
    let body = response.json().await.unwrap_or(Value::Null);
    (status, body)
}
