//! Live analyser WebSocket: JSON messages `{type, params}`. One active
//! stream per connection; a new request aborts the previous one. Records are
//! paced at one per 100 ms so a bursty window close cannot flood the client.

use super::AppState;
use crate::analyzer::{self, AnalyzerParams};
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use log::{debug, warn};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const STREAM_TYPE: &str = "NumLatencyFrequency";
const EMIT_PACING: Duration = Duration::from_millis(100);

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

async fn send_json(sender: &WsSender, value: Value) -> bool {
    sender
        .lock()
        .await
        .send(Message::Text(value.to_string().into()))
        .await
        .is_ok()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sink, mut incoming) = socket.split();
    let sender: WsSender = Arc::new(Mutex::new(sink));
    let mut active: Option<JoinHandle<()>> = None;

    while let Some(Ok(message)) = incoming.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let request: Value = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(err) => {
                send_json(
                    &sender,
                    json!({"type": "unknown", "error": format!("bad message: {err}")}),
                )
                .await;
                continue;
            }
        };

        let stream_type = request
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();
        if stream_type != STREAM_TYPE {
            send_json(
                &sender,
                json!({"type": stream_type, "error": "Unknown stream type"}),
            )
            .await;
            continue;
        }

        let params = request.get("params").cloned().unwrap_or(json!({}));
        let params = match AnalyzerParams::validate(&params) {
            Ok(params) => params,
            Err(details) => {
                send_json(
                    &sender,
                    json!({
                        "type": stream_type,
                        "error": "Validation failed",
                        "details": details,
                    }),
                )
                .await;
                continue;
            }
        };

        // One stream per connection: a new request cancels the old one.
        if let Some(task) = active.take() {
            task.abort();
            debug!("[ws] previous stream aborted");
        }

        let Some(context) = state.analyzer.clone() else {
            send_json(
                &sender,
                json!({
                    "type": stream_type,
                    "error": "Kernel tracing capabilities not available",
                }),
            )
            .await;
            continue;
        };

        match analyzer::spawn_stream(&context, params) {
            Ok(mut records) => {
                let sender = Arc::clone(&sender);
                active = Some(tokio::spawn(async move {
                    while let Some(record) = records.recv().await {
                        let frame = json!({"type": STREAM_TYPE, "data": record});
                        if !send_json(&sender, frame).await {
                            return;
                        }
                        tokio::time::sleep(EMIT_PACING).await;
                    }
                }));
            }
            Err(err) => {
                warn!("[ws] stream setup failed: {err}");
                send_json(
                    &sender,
                    json!({"type": stream_type, "error": err.to_string()}),
                )
                .await;
            }
        }
    }

    if let Some(task) = active.take() {
        task.abort();
    }
    debug!("[ws] client disconnected");
}
