//! One WebSocket to one agent endpoint.
//!
//! The connection reports its lifecycle on a watch channel and forwards every
//! inbound text frame on a broadcast channel. It never reconnects on its own;
//! that policy belongs to the supervisor.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::{Error, Failure, FailureReason, Result};

const MESSAGE_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 64;

type AgentStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "failure")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(Failure),
}

pub struct StreamingConnection {
    state: Arc<watch::Sender<ConnectionState>>,
    messages: broadcast::Sender<String>,
    outbound: Option<mpsc::Sender<Message>>,
    pump: Option<JoinHandle<()>>,
    settle_delay: Duration,
}

impl StreamingConnection {
    pub fn new(settle_delay: Duration) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (messages, _) = broadcast::channel(MESSAGE_BUFFER);
        Self {
            state: Arc::new(state),
            messages,
            outbound: None,
            pump: None,
            settle_delay,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Inbound text frames. Subscribe before `connect` to see the agent's
    /// greeting.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<String> {
        self.messages.subscribe()
    }

    /// Open a fresh socket, replacing any existing one.
    ///
    /// Resolves once the socket has survived the settle delay; a socket the
    /// agent drops during that window is reported as a failure.
    pub async fn connect(&mut self, endpoint: &str, token: &str) -> Result<()> {
        self.disconnect().await;

        let endpoint = Endpoint::parse(endpoint)?;
        let request = handshake_request(&endpoint, token)?;

        self.state.send_replace(ConnectionState::Connecting);
        debug!(url = %endpoint.stream_url(), "opening agent stream");

        let ws = match tokio_tungstenite::connect_async(request).await {
            Ok((ws, _)) => ws,
            Err(e) => return Err(self.fail(Failure::from_transport(&e))),
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        self.outbound = Some(outbound_tx);
        self.pump = Some(tokio::spawn(pump(
            ws,
            outbound_rx,
            self.state.clone(),
            self.messages.clone(),
        )));

        tokio::time::sleep(self.settle_delay).await;

        let alive = self.pump.as_ref().is_some_and(|p| !p.is_finished());
        let promoted = alive
            && self.state.send_if_modified(|state| {
                if matches!(state, ConnectionState::Connecting) {
                    *state = ConnectionState::Connected;
                    true
                } else {
                    false
                }
            });
        if promoted {
            info!(url = %endpoint.stream_url(), "agent stream connected");
            return Ok(());
        }

        let failure = match self.state() {
            ConnectionState::Failed(failure) => failure,
            _ => Failure::closed(),
        };
        self.stop_pump().await;
        Err(self.fail(failure))
    }

    /// Queue one text frame for the agent.
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        if !matches!(*self.state.borrow(), ConnectionState::Connected) {
            return Err(Error::NotConnected);
        }
        let outbound = self.outbound.as_ref().ok_or(Error::NotConnected)?;
        outbound
            .send(Message::text(text.into()))
            .await
            .map_err(|_| Error::NotConnected)
    }

    /// Stop the receive loop and drop the socket. Safe to call at any time;
    /// no message is forwarded after this returns.
    pub async fn disconnect(&mut self) {
        let had_socket = self.pump.is_some();
        self.stop_pump().await;
        if had_socket {
            debug!("agent stream disconnected");
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    async fn stop_pump(&mut self) {
        self.outbound = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
    }

    fn fail(&self, failure: Failure) -> Error {
        self.state
            .send_replace(ConnectionState::Failed(failure.clone()));
        Error::Connection(failure)
    }
}

impl Drop for StreamingConnection {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

fn handshake_request(endpoint: &Endpoint, token: &str) -> Result<Request> {
    let mut request = endpoint
        .with_token(token)
        .as_str()
        .into_client_request()
        .map_err(|e| Error::InvalidEndpoint(e.to_string()))?;

    let bearer = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
        Error::Connection(Failure::new(
            FailureReason::Unauthorized,
            "token is not a valid header value",
        ))
    })?;
    request.headers_mut().insert(header::AUTHORIZATION, bearer);
    Ok(request)
}

async fn pump(
    ws: AgentStream,
    mut outbound: mpsc::Receiver<Message>,
    state: Arc<watch::Sender<ConnectionState>>,
    messages: broadcast::Sender<String>,
) {
    let (mut sink, mut stream) = ws.split();

    let failure = loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        break Failure::from_transport(&e);
                    }
                }
                None => return,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = messages.send(text.to_string());
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => {
                        let _ = messages.send(text);
                    }
                    Err(e) => warn!(len = data.len(), error = %e, "dropping undecodable binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "agent closed the stream");
                    break Failure::closed();
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Failure::from_transport(&e),
                None => break Failure::closed(),
            },
        }
    };

    warn!(reason = ?failure.reason, error = %failure, "agent stream failed");
    state.send_replace(ConnectionState::Failed(failure));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::AgentServer;

    const SETTLE: Duration = Duration::from_millis(30);

    async fn next_message(rx: &mut broadcast::Receiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("message stream closed")
    }

    #[tokio::test]
    async fn connects_receives_greeting_and_echoes() {
        let server = AgentServer::start("s3cret").await;
        let mut conn = StreamingConnection::new(SETTLE);
        let mut messages = conn.subscribe_messages();
        let mut states = conn.subscribe_state();

        conn.connect(&server.stream_url("m1"), "s3cret").await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(states.has_changed().unwrap());

        assert_eq!(next_message(&mut messages).await, "Connected to agent m1\r\n");

        conn.send("uname -a\n").await.unwrap();
        assert_eq!(next_message(&mut messages).await, "echo:uname -a\n");

        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(matches!(conn.send("ls").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn resize_frames_reach_the_agent_as_control() {
        let server = AgentServer::start("s3cret").await;
        let mut conn = StreamingConnection::new(SETTLE);
        let mut messages = conn.subscribe_messages();
        conn.connect(&server.stream_url("m1"), "s3cret").await.unwrap();
        next_message(&mut messages).await;

        let frame = crate::frame::ControlMessage::Resize { rows: 40, cols: 120 }.to_frame().unwrap();
        conn.send(frame).await.unwrap();
        conn.send("pwd\n").await.unwrap();
        assert_eq!(next_message(&mut messages).await, "echo:pwd\n");
        assert_eq!(server.resizes(), vec![(40, 120)]);
    }

    #[tokio::test]
    async fn send_before_connect_is_rejected() {
        let conn = StreamingConnection::new(SETTLE);
        assert!(matches!(conn.send("ls").await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn malformed_endpoint_fails_fast() {
        let mut conn = StreamingConnection::new(SETTLE);
        let err = conn.connect("agents.fly.dev/stream", "t").await.unwrap_err();
        assert!(matches!(err, Error::InvalidEndpoint(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn rejected_token_is_unauthorized() {
        let server = AgentServer::start("s3cret").await;
        let mut conn = StreamingConnection::new(SETTLE);

        let err = conn.connect(&server.stream_url("m1"), "wrong").await.unwrap_err();
        assert_eq!(err.failure().reason, FailureReason::Unauthorized);
        assert!(matches!(conn.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn socket_dropped_during_settle_window_is_a_failure() {
        let server = AgentServer::start("s3cret").await;
        server.close_after_greeting(true);
        let mut conn = StreamingConnection::new(Duration::from_millis(200));

        let err = conn.connect(&server.stream_url("m1"), "s3cret").await.unwrap_err();
        assert_eq!(err.failure().reason, FailureReason::Closed);
        assert!(matches!(conn.state(), ConnectionState::Failed(_)));
    }

    #[tokio::test]
    async fn peer_close_after_connect_is_reported_once() {
        let server = AgentServer::start("s3cret").await;
        let mut conn = StreamingConnection::new(SETTLE);
        let mut states = conn.subscribe_state();
        conn.connect(&server.stream_url("m1"), "s3cret").await.unwrap();
        let _ = states.borrow_and_update();

        server.kick();
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|s| matches!(s, ConnectionState::Failed(_))),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        match state {
            ConnectionState::Failed(failure) => assert_eq!(failure.reason, FailureReason::Closed),
            other => panic!("unexpected state {other:?}"),
        }
        assert!(matches!(conn.send("ls").await, Err(Error::NotConnected)));

        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
