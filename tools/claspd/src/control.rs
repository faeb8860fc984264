//! Control surface
//!
//! Line-oriented JSON over stdio for the desktop shell (or a human with
//! a pipe). One request per line in, one JSON object per line out.
//! Emits `ready` once at startup, then `signal` monitor traffic,
//! `bridge_event` state transitions and periodic `stats` interleaved
//! with request replies.

use clasp_bridge::{BridgeRuntime, BridgeSpec};
use clasp_core::Value;
use clasp_router::{Dispatcher, RouterEvent};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const STATS_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
enum Request {
    CreateBridge {
        id: String,
        source: String,
        #[serde(default)]
        source_addr: String,
        /// Always "clasp" in this direction; kept for shell symmetry.
        #[serde(default)]
        target: String,
        target_addr: String,
        #[serde(default)]
        config: serde_json::Value,
    },
    DeleteBridge {
        id: String,
    },
    SendSignal {
        bridge_id: String,
        address: String,
        value: serde_json::Value,
    },
    ListBridges,
    Shutdown,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Ready,
    Ok {
        #[serde(skip_serializing_if = "serde_json::Value::is_null")]
        data: serde_json::Value,
    },
    Error {
        message: String,
    },
    Signal {
        bridge_id: String,
        address: String,
        value: serde_json::Value,
    },
    BridgeEvent {
        bridge_id: String,
        state: clasp_bridge::BridgeState,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Stats {
        stats: clasp_router::StatsSnapshot,
    },
}

/// Run the control surface until stdin closes or a shutdown request
/// arrives. Sends on `shutdown_tx` exactly once to stop the daemon.
pub async fn run(
    dispatcher: Arc<Dispatcher>,
    runtime: Arc<BridgeRuntime>,
    shutdown_tx: mpsc::Sender<()>,
) {
    let (out_tx, mut out_rx) = mpsc::channel::<Reply>(256);

    // Single writer keeps output line-atomic.
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = out_rx.recv().await {
            let Ok(mut line) = serde_json::to_vec(&reply) else {
                continue;
            };
            line.push(b'\n');
            if stdout.write_all(&line).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    // Signal monitor feed.
    {
        let out_tx = out_tx.clone();
        let runtime = runtime.clone();
        let mut events = dispatcher.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let RouterEvent::Signal {
                    session,
                    address,
                    value,
                    ..
                } = event
                {
                    let bridge_id = runtime
                        .bridge_for_session(&session)
                        .unwrap_or_else(|| session.clone());
                    let _ = out_tx.try_send(Reply::Signal {
                        bridge_id,
                        address,
                        value: clasp_bridge::json::value_to_json(&value.unwrap_or(Value::Null)),
                    });
                }
            }
        });
    }

    // Bridge state transitions.
    {
        let out_tx = out_tx.clone();
        let mut events = runtime.subscribe_events();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let _ = out_tx.try_send(Reply::BridgeEvent {
                    bridge_id: event.bridge_id,
                    state: event.state,
                    detail: event.detail,
                });
            }
        });
    }

    // Periodic statistics.
    {
        let out_tx = out_tx.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_PERIOD);
            loop {
                ticker.tick().await;
                let stats = dispatcher.stats.snapshot(
                    dispatcher.sessions.len(),
                    dispatcher.store.len(),
                    dispatcher.subscriptions.len(),
                );
                if out_tx.send(Reply::Stats { stats }).await.is_err() {
                    break;
                }
            }
        });
    }

    let _ = out_tx.send(Reply::Ready).await;

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                let _ = out_tx
                    .send(Reply::Error {
                        message: format!("bad request: {e}"),
                    })
                    .await;
                continue;
            }
        };
        debug!(?request, "control request");
        let reply = handle(&runtime, request, &shutdown_tx).await;
        let done = reply.is_none();
        if let Some(reply) = reply {
            let _ = out_tx.send(reply).await;
        }
        if done {
            break;
        }
    }

    drop(out_tx);
    let _ = writer.await;
}

async fn handle(
    runtime: &Arc<BridgeRuntime>,
    request: Request,
    shutdown_tx: &mpsc::Sender<()>,
) -> Option<Reply> {
    match request {
        Request::CreateBridge {
            id,
            source,
            source_addr,
            target,
            target_addr,
            config,
        } => {
            if !target.is_empty() && target != "clasp" {
                return Some(Reply::Error {
                    message: format!("unsupported target: {target}"),
                });
            }
            let spec = BridgeSpec {
                id: id.clone(),
                kind: source,
                source_addr,
                target_addr,
                config,
            };
            match runtime.create(spec).await {
                Ok(()) => Some(Reply::Ok {
                    data: json!({ "id": id }),
                }),
                Err(e) => Some(Reply::Error {
                    message: e.to_string(),
                }),
            }
        }
        Request::DeleteBridge { id } => {
            if runtime.delete(&id).await {
                Some(Reply::Ok {
                    data: serde_json::Value::Null,
                })
            } else {
                Some(Reply::Error {
                    message: format!("unknown bridge: {id}"),
                })
            }
        }
        Request::SendSignal {
            bridge_id,
            address,
            value,
        } => {
            let value = clasp_bridge::json::json_to_value(&value);
            if runtime.send_signal(&bridge_id, &address, value).await {
                Some(Reply::Ok {
                    data: serde_json::Value::Null,
                })
            } else {
                Some(Reply::Error {
                    message: format!("unknown bridge: {bridge_id}"),
                })
            }
        }
        Request::ListBridges => {
            let bridges = runtime.list();
            Some(Reply::Ok {
                data: serde_json::to_value(bridges).unwrap_or(serde_json::Value::Null),
            })
        }
        Request::Shutdown => {
            warn!("shutdown requested over control surface");
            let _ = shutdown_tx.send(()).await;
            None
        }
    }
}
