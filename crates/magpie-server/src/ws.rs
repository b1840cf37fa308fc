use std::collections::HashSet;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use magpie_types::ResearchEvent;

use crate::AppState;

/// Room-scoped realtime surface. Clients send
/// `{"type":"subscribe","session_id":"…"}` /
/// `{"type":"unsubscribe","session_id":"…"}`; the server forwards the
/// session's events as long as the subscription holds. Delivery is
/// at-most-once with no backlog; clients that reconnect refetch state over
/// REST.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_stream(socket, state))
}

async fn ws_stream(mut socket: WebSocket, state: AppState) {
    let mut events = state.services.bus.subscribe();
    let mut rooms: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };
                match message {
                    WsMessage::Text(text) => {
                        if let Some(reply) = handle_client_frame(&text, &mut rooms) {
                            if socket
                                .send(WsMessage::Text(reply.to_string().into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if !rooms.contains(&event.session_id) {
                            continue;
                        }
                        let payload = event_frame(&event).to_string();
                        if socket.send(WsMessage::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "websocket subscriber lagged, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

fn handle_client_frame(text: &str, rooms: &mut HashSet<String>) -> Option<Value> {
    let frame: Value = serde_json::from_str(text).ok()?;
    let kind = frame.get("type").and_then(|v| v.as_str())?;
    let session_id = frame
        .get("session_id")
        .or_else(|| frame.get("sessionId"))
        .and_then(|v| v.as_str())?
        .to_string();
    match kind {
        "subscribe" => {
            rooms.insert(session_id.clone());
            Some(json!({"type": "subscribed", "session_id": session_id}))
        }
        "unsubscribe" => {
            rooms.remove(&session_id);
            Some(json!({"type": "unsubscribed", "session_id": session_id}))
        }
        other => Some(json!({
            "type": "error",
            "message": format!("unknown frame type `{other}`"),
        })),
    }
}

fn event_frame(event: &ResearchEvent) -> Value {
    json!({
        "type": event.kind.as_str(),
        "session_id": event.session_id,
        "payload": event.payload,
        "emitted_at": event.emitted_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_unsubscribe_manage_rooms() {
        let mut rooms = HashSet::new();
        let reply =
            handle_client_frame(r#"{"type":"subscribe","session_id":"s-1"}"#, &mut rooms)
                .expect("reply");
        assert_eq!(reply["type"], "subscribed");
        assert!(rooms.contains("s-1"));

        let reply =
            handle_client_frame(r#"{"type":"unsubscribe","session_id":"s-1"}"#, &mut rooms)
                .expect("reply");
        assert_eq!(reply["type"], "unsubscribed");
        assert!(rooms.is_empty());
    }

    #[test]
    fn malformed_frames_are_ignored() {
        let mut rooms = HashSet::new();
        assert!(handle_client_frame("not json", &mut rooms).is_none());
        assert!(handle_client_frame(r#"{"type":"subscribe"}"#, &mut rooms).is_none());
    }

    #[test]
    fn event_frames_carry_the_wire_type() {
        let event = ResearchEvent::progress("s-1", 33, "analyze");
        let frame = event_frame(&event);
        assert_eq!(frame["type"], "progress_update");
        assert_eq!(frame["session_id"], "s-1");
        assert_eq!(frame["payload"]["percent"], 33);
    }
}
