//! The push socket: a long-lived subscription to the node's websocket
//! gateway with liveness detection.
//!
//! The loop holds one connection at a time: obtain a socket URL from
//! `POST /ws/start` (safe to retry, it only mints a URL), connect with a
//! bounded handshake, subscribe to the `transactions` event, then pump
//! frames. Any frame refreshes the liveness clock; 30 seconds of silence,
//! a read error, or a peer close all signal status=down on the bus and
//! re-enter the reopen loop. Each new connection reseeds the id generator
//! with its URL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use kst_api::{retry_idempotent, ApiTransaction, KristClient, Transaction};
use kst_state::{Bus, StreamEvent};

use crate::assembler::TransactionStream;
use crate::idgen::RefSource;

const PING_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Borrowed stream internals the socket task runs against.
pub(crate) struct SocketContext<'a> {
    pub client: &'a KristClient,
    pub bus: &'a Bus,
    pub assembler: &'a TransactionStream,
    pub refs: &'a StdMutex<RefSource>,
    pub up: &'a AtomicBool,
    pub shutdown: watch::Receiver<bool>,
}

pub(crate) async fn run_push_socket(ctx: SocketContext<'_>) -> Result<()> {
    let SocketContext {
        client,
        bus,
        assembler,
        refs,
        up,
        mut shutdown,
    } = ctx;
    let set_status = |value: bool| {
        up.store(value, Ordering::Relaxed);
        bus.publish(StreamEvent::SocketStatus { up: value });
    };

    'reopen: loop {
        if *shutdown.borrow() {
            set_status(false);
            return Ok(());
        }

        let url = tokio::select! {
            result = retry_idempotent(None, || client.ws_start()) => result?,
            _ = shutdown.changed() => continue 'reopen,
        };

        let ws = match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(err)) => {
                warn!(%err, "websocket connect failed");
                set_status(false);
                sleep(REOPEN_DELAY).await;
                continue;
            }
            Err(_elapsed) => {
                warn!("websocket connect timed out");
                set_status(false);
                continue;
            }
        };
        refs.lock().expect("ref source mutex poisoned").reseed(&url);
        info!("push socket connected");

        let (mut sink, mut source) = ws.split();
        let subscribe =
            serde_json::json!({ "id": 0, "type": "subscribe", "event": "transactions" });
        if let Err(err) = sink.send(Message::Text(subscribe.to_string())).await {
            warn!(%err, "subscribe frame failed");
            set_status(false);
            sleep(REOPEN_DELAY).await;
            continue;
        }
        set_status(true);

        let mut last_ping = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        set_status(false);
                        return Ok(());
                    }
                }
                message = source.next() => match message {
                    Some(Ok(message)) => {
                        last_ping = Instant::now();
                        match message {
                            Message::Text(text) => handle_frame(assembler, &text).await,
                            Message::Ping(payload) => {
                                let _ = sink.send(Message::Pong(payload)).await;
                            }
                            Message::Close(_) => {
                                warn!("push socket closed by peer");
                                set_status(false);
                                continue 'reopen;
                            }
                            _ => {}
                        }
                        // Every frame re-asserts liveness and wakes waiters.
                        set_status(true);
                    }
                    Some(Err(err)) => {
                        warn!(%err, "push socket read error");
                        set_status(false);
                        continue 'reopen;
                    }
                    None => {
                        warn!("push socket stream ended");
                        set_status(false);
                        continue 'reopen;
                    }
                },
                _ = sleep_until(last_ping + PING_TIMEOUT) => {
                    warn!("no socket traffic within the liveness window; reopening");
                    set_status(false);
                    continue 'reopen;
                }
            }
        }
    }
}

/// Decode one text frame, handing pushed transactions to the assembler.
/// Malformed frames are logged and skipped; a push subscription must not
/// die because one frame was odd.
async fn handle_frame(assembler: &TransactionStream, text: &str) {
    #[derive(Deserialize)]
    struct Frame {
        #[serde(rename = "type", default)]
        kind: Option<String>,
        #[serde(default)]
        event: Option<String>,
        #[serde(default)]
        transaction: Option<ApiTransaction>,
    }

    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(%err, "unparseable socket frame");
            return;
        }
    };
    if frame.kind.as_deref() != Some("event") || frame.event.as_deref() != Some("transaction") {
        return;
    }
    let Some(raw) = frame.transaction else {
        return;
    };
    match Transaction::decode(raw) {
        Ok(tx) => {
            let id = tx.id;
            let accepted = assembler.push_live(tx).await;
            debug!(id, accepted, "live transaction push");
        }
        Err(err) => warn!(%err, "undecodable pushed transaction"),
    }
}
