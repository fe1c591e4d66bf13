//! Push channels for dashboards.
//!
//! `/sse` is the one-way event stream dashboards listen on. `/ws` is the
//! bidirectional socket; besides change notices it answers `client:test`
//! frames with an echo to the sender and a broadcast to every other socket.
//! Both register with the same [`Notifier`](crate::notifier::Notifier).

use std::convert::Infallible;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderName, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    notifier::{Notification, SocketMessage, Subscription, Transport},
    state::AppState,
};

pub const WELCOME_EVENT: &str = "server:welcome";
pub const ECHO_EVENT: &str = "server:echo";
pub const CLIENT_TEST_EVENT: &str = "client:test";

pub async fn sse_handler(State(state): State<AppState>) -> Response {
    let subscription = state.notifier.subscribe(Transport::EventStream);

    (
        [(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        )],
        Sse::new(event_stream(subscription)).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

/// `:connected` comment first, then one event per notification. The
/// subscription lives inside the stream, so the subscriber is unregistered
/// as soon as the client goes away and axum drops the stream.
fn event_stream(subscription: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    let connected =
        stream::once(async { Ok::<_, Infallible>(Event::default().comment("connected")) });

    let notifications = stream::unfold(subscription, |mut subscription| async move {
        let notification = subscription.recv().await?;
        Some((notification, subscription))
    })
    .filter_map(|notification| async move {
        stream_event(&notification).map(Ok::<_, Infallible>)
    });

    connected.chain(notifications)
}

fn stream_event(notification: &Notification) -> Option<Event> {
    let (name, payload) = notification.to_stream_payload()?;
    Some(Event::default().event(name).data(payload.to_string()))
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut subscription = state.notifier.subscribe(Transport::Socket);
    let id = subscription.id();

    let welcome = SocketMessage::new(
        WELCOME_EVENT,
        json!({ "message": "Welcome! socket.io connected." }),
    );
    if socket.send(Message::Text(welcome.to_text())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_client_frame(&state, &subscription, &text) {
                        if socket.send(Message::Text(reply.to_text())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(subscriber = %id, "socket error: {e}");
                    break;
                }
            },
            outgoing = subscription.recv() => match outgoing {
                Some(notification) => {
                    let frame = notification.to_socket_message();
                    if socket.send(Message::Text(frame.to_text())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    debug!(subscriber = %id, "socket closed");
}

/// React to one client frame. Returns the reply for the sender, if any.
fn handle_client_frame(
    state: &AppState,
    subscription: &Subscription,
    text: &str,
) -> Option<SocketMessage> {
    let message: SocketMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(subscriber = %subscription.id(), "ignoring unparseable frame: {e}");
            return None;
        }
    };

    match message.event.as_str() {
        CLIENT_TEST_EVENT => {
            debug!(subscriber = %subscription.id(), data = %message.data, "received client:test");
            state.notifier.broadcast(Notification::Peer {
                from: subscription.id(),
                data: message.data.clone(),
            });
            Some(echo(message.data))
        }
        other => {
            debug!(subscriber = %subscription.id(), event = other, "ignoring unknown event");
            None
        }
    }
}

fn echo(data: Value) -> SocketMessage {
    SocketMessage::new(ECHO_EVENT, json!({ "received": data }))
}
