use std::time::Duration;

use axum::{
    body::Bytes,
    debug_handler,
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::{
    sync::mpsc,
    time::{interval, timeout},
};

use super::{ConnectionId, Presence};

/// Larger than any valid join frame, so oversized avatars are still answered
/// with `avatar_invalid`. Anything past it closes the socket with 1009.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_TOO_BIG: u16 = 1009;

/// How long the writer may keep flushing after the reader is done.
const WRITER_GRACE: Duration = Duration::from_secs(1);

#[debug_handler(state = crate::AppState)]
pub async fn presence_ws(State(presence): State<Presence>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| run_connection(socket, presence))
}

async fn run_connection(socket: WebSocket, presence: Presence) {
    let (sender, mut receiver) = socket.split();
    let (mut conn, rx) = presence.connect();
    tracing::info!(conn = conn.id(), connections = presence.hub().len(), "client connected");

    let mut writer = tokio::spawn(writer_task(sender, rx));

    let (pong_tx, pong_rx) = mpsc::unbounded_channel();
    let mut beat = tokio::spawn(heartbeat(
        presence.clone(),
        conn.id(),
        pong_rx,
        PING_INTERVAL,
        PONG_TIMEOUT,
    ));

    loop {
        let msg = tokio::select! {
            msg = receiver.next() => msg,
            _ = &mut beat => {
                tracing::warn!(conn = conn.id(), "heartbeat lost, dropping connection");
                break;
            }
        };

        let msg = match msg {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                if is_oversized(&err) {
                    tracing::warn!(conn = conn.id(), error = %err, "frame too large");
                    close(&presence, conn.id(), CLOSE_TOO_BIG, "message too big");
                } else {
                    tracing::debug!(conn = conn.id(), error = %err, "websocket receive error");
                }
                break;
            }
            None => break,
        };

        let flow = match msg {
            Message::Text(text) => presence.handle_frame(&mut conn, text.as_str()),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => presence.handle_frame(&mut conn, text),
                Err(_) => continue,
            },
            Message::Pong(_) => {
                let _ = pong_tx.send(());
                continue;
            }
            Message::Close(_) => break,
            Message::Ping(_) => continue,
        };

        if flow.is_break() {
            break;
        }
    }

    beat.abort();
    presence.disconnect(&mut conn);
    tracing::info!(conn = conn.id(), "client disconnected");

    // unregistering dropped the queue sender, so the writer ends once it has flushed
    if timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn writer_task(mut sender: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sender.send(msg).await.is_err() || closing {
            return;
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

/// Pings the connection every `every` and returns once a ping goes
/// unanswered for `wait`, or once the connection can no longer be written to.
async fn heartbeat(
    presence: Presence,
    id: ConnectionId,
    mut pongs: mpsc::UnboundedReceiver<()>,
    every: Duration,
    wait: Duration,
) {
    let mut ticks = interval(every);
    ticks.tick().await;

    loop {
        ticks.tick().await;

        while pongs.try_recv().is_ok() {}
        if !presence.hub().send_to(id, Message::Ping(Bytes::from_static(b"geochat"))) {
            return;
        }

        match timeout(wait, pongs.recv()).await {
            Ok(Some(())) => {}
            _ => {
                tracing::warn!(conn = id, "pong timeout, closing connection");
                close(&presence, id, CLOSE_GOING_AWAY, "pong timeout");
                return;
            }
        }
    }
}

fn close(presence: &Presence, id: ConnectionId, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    presence.hub().send_to(id, Message::Close(Some(frame)));
}

// tungstenite reports size limits as capacity errors
fn is_oversized(err: &axum::Error) -> bool {
    err.to_string().contains("Space limit exceeded")
}
