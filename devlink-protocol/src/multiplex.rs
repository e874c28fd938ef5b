//! Request/response multiplexing over a single socket.
//!
//! The control connection between a UI and the bridge carries concurrent
//! remote calls, their responses and unsolicited push events, all as JSON
//! frames tagged with an `event` discriminant. [`RequestMultiplexer`]
//! allocates monotonically increasing request ids, pairs responses with
//! their callers and enforces per-request deadlines.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};

/// Deadline applied by [`RequestMultiplexer::exec`].
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(45);

/// Tighter deadline callers apply to the first call on a fresh connection,
/// where a stalled peer should be detected quickly.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames exchanged on a multiplexed socket. The `event` field selects the
/// variant; unknown discriminants fail to parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum SocketMessage {
    /// Remote call issued by this side
    Exec {
        id: u64,
        command: String,
        args: Vec<Value>,
    },
    /// Successful answer to an `exec`
    ExecResponse { id: u64, data: Value },
    /// Failed answer to an `exec`
    ExecResponseError { id: u64, data: Value },
    /// Unsolicited push event from the peer
    ServerEvent { event: String, data: Value },
}

/// A push event forwarded to the multiplexer's subscriber.
pub type PushEvent = (String, Value);

struct PendingRequest {
    command: String,
    tx: oneshot::Sender<Result<Value>>,
}

struct Inner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<PushEvent>,
}

/// Correlates remote calls with their responses. Clones share one id space
/// and one pending-request table.
#[derive(Clone)]
pub struct RequestMultiplexer {
    inner: Arc<Inner>,
}

impl RequestMultiplexer {
    /// Creates a multiplexer writing serialized frames into `outbound`.
    /// Push events arriving from the peer come out of the returned
    /// receiver.
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
    ) -> (Self, mpsc::UnboundedReceiver<PushEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(Inner {
                    next_id: AtomicU64::new(1),
                    pending: Mutex::new(HashMap::new()),
                    outbound,
                    events: events_tx,
                }),
            },
            events_rx,
        )
    }

    /// Issues a remote call with the default deadline.
    pub async fn exec(&self, command: &str, args: Vec<Value>) -> Result<Value> {
        self.exec_with_timeout(DEFAULT_EXEC_TIMEOUT, command, args)
            .await
    }

    /// Issues a remote call, failing with [`ProtocolError::Timeout`] if no
    /// response arrives within `deadline`. The timed-out request id is
    /// forgotten; a late response for it is dropped like any unmatched id.
    pub async fn exec_with_timeout(
        &self,
        deadline: Duration,
        command: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_string(&SocketMessage::Exec {
            id,
            command: command.to_string(),
            args,
        })?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(
            id,
            PendingRequest {
                command: command.to_string(),
                tx,
            },
        );

        if self.inner.outbound.send(frame).is_err() {
            self.inner.pending.lock().await.remove(&id);
            return Err(ProtocolError::Disconnected(format!(
                "socket closed before '{command}' could be sent"
            )));
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::Disconnected(format!(
                "request '{command}' was abandoned"
            ))),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                Err(ProtocolError::Timeout(format!(
                    "no response for '{command}' within {deadline:?}"
                )))
            }
        }
    }

    /// Feeds one inbound frame into the multiplexer.
    ///
    /// Responses settle their pending request; responses with an id nobody
    /// waits for are logged and dropped. Push events go to the subscriber.
    /// Frames that do not match the message contract are an error the
    /// caller decides how to surface.
    pub async fn handle_frame(&self, raw: &str) -> Result<()> {
        let message: SocketMessage = serde_json::from_str(raw)
            .map_err(|error| ProtocolError::InvalidMessage(error.to_string()))?;

        match message {
            SocketMessage::ExecResponse { id, data } => self.settle(id, Ok(data)).await,
            SocketMessage::ExecResponseError { id, data } => {
                self.settle(id, Err(ProtocolError::ExecFailed(data))).await
            }
            SocketMessage::ServerEvent { event, data } => {
                if self.inner.events.send((event, data)).is_err() {
                    debug!("push event dropped, subscriber is gone");
                }
            }
            SocketMessage::Exec { command, .. } => {
                warn!(%command, "peer sent an exec frame to the requesting side, ignoring");
            }
        }
        Ok(())
    }

    /// Rejects every in-flight request, used when the socket disconnects.
    pub async fn fail_all(&self, reason: &str) {
        let mut pending = self.inner.pending.lock().await;
        for (id, request) in pending.drain() {
            debug!(id, command = %request.command, "failing request: {reason}");
            let _ = request
                .tx
                .send(Err(ProtocolError::Disconnected(format!(
                    "'{}' failed: {reason}",
                    request.command
                ))));
        }
    }

    /// Number of requests currently awaiting a response.
    pub async fn pending_requests(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    async fn settle(&self, id: u64, result: Result<Value>) {
        let Some(request) = self.inner.pending.lock().await.remove(&id) else {
            warn!(id, "dropping response with no matching request");
            return;
        };
        let _ = request.tx.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn multiplexer() -> (
        RequestMultiplexer,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedReceiver<PushEvent>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (mux, events_rx) = RequestMultiplexer::new(out_tx);
        (mux, out_rx, events_rx)
    }

    #[tokio::test]
    async fn test_exec_round_trip() {
        let (mux, mut out_rx, _events) = multiplexer();

        let responder = mux.clone();
        let task = tokio::spawn(async move {
            let frame = out_rx.recv().await.unwrap();
            let message: SocketMessage = serde_json::from_str(&frame).unwrap();
            let SocketMessage::Exec { id, command, args } = message else {
                panic!("expected an exec frame");
            };
            assert_eq!(id, 1);
            assert_eq!(command, "getState");
            assert_eq!(args, vec![json!("verbose")]);

            let response = serde_json::to_string(&SocketMessage::ExecResponse {
                id,
                data: json!({"clients": 2}),
            })
            .unwrap();
            responder.handle_frame(&response).await.unwrap();
        });

        let result = mux.exec("getState", vec![json!("verbose")]).await.unwrap();
        assert_eq!(result, json!({"clients": 2}));
        assert_eq!(mux.pending_requests().await, 0);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_exec_ids_are_monotonic() {
        let (mux, mut out_rx, _events) = multiplexer();

        for expected_id in 1..=3u64 {
            let responder = mux.clone();
            let waiter = mux.clone();
            let task = tokio::spawn(async move { waiter.exec("noop", vec![]).await });

            let frame = out_rx.recv().await.unwrap();
            let SocketMessage::Exec { id, .. } = serde_json::from_str(&frame).unwrap() else {
                panic!("expected an exec frame");
            };
            assert_eq!(id, expected_id);

            responder
                .handle_frame(
                    &serde_json::to_string(&SocketMessage::ExecResponse {
                        id,
                        data: json!(null),
                    })
                    .unwrap(),
                )
                .await
                .unwrap();
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_exec_error_response_rejects() {
        let (mux, mut out_rx, _events) = multiplexer();

        let responder = mux.clone();
        tokio::spawn(async move {
            let frame = out_rx.recv().await.unwrap();
            let SocketMessage::Exec { id, .. } = serde_json::from_str(&frame).unwrap() else {
                panic!("expected an exec frame");
            };
            responder
                .handle_frame(
                    &serde_json::to_string(&SocketMessage::ExecResponseError {
                        id,
                        data: json!({"message": "no such command"}),
                    })
                    .unwrap(),
                )
                .await
                .unwrap();
        });

        assert!(matches!(
            mux.exec("bogusCommand", vec![]).await,
            Err(ProtocolError::ExecFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_exec_times_out_and_names_the_command() {
        let (mux, _out_rx, _events) = multiplexer();

        let error = mux
            .exec_with_timeout(Duration::from_millis(20), "slowCommand", vec![])
            .await
            .unwrap_err();

        assert!(matches!(error, ProtocolError::Timeout(_)));
        assert!(error.to_string().contains("slowCommand"));
        assert_eq!(mux.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_fail_all_rejects_in_flight_requests() {
        let (mux, mut out_rx, _events) = multiplexer();

        let waiter = mux.clone();
        let task = tokio::spawn(async move { waiter.exec("getState", vec![]).await });
        out_rx.recv().await.unwrap();

        mux.fail_all("socket disconnected").await;

        assert!(matches!(
            task.await.unwrap(),
            Err(ProtocolError::Disconnected(_))
        ));
        assert_eq!(mux.pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_unmatched_response_is_dropped() {
        let (mux, _out_rx, _events) = multiplexer();

        let frame = serde_json::to_string(&SocketMessage::ExecResponse {
            id: 42,
            data: json!(null),
        })
        .unwrap();
        assert!(mux.handle_frame(&frame).await.is_ok());
    }

    #[tokio::test]
    async fn test_push_events_reach_the_subscriber() {
        let (mux, _out_rx, mut events) = multiplexer();

        mux.handle_frame(
            r#"{"event":"server-event","payload":{"event":"client-connected","data":{"id":"c1"}}}"#,
        )
        .await
        .unwrap();

        let (event, data) = events.recv().await.unwrap();
        assert_eq!(event, "client-connected");
        assert_eq!(data, json!({"id": "c1"}));
    }

    #[tokio::test]
    async fn test_unknown_event_discriminant_is_an_error() {
        let (mux, _out_rx, _events) = multiplexer();

        assert!(matches!(
            mux.handle_frame(r#"{"event":"teleport","payload":{}}"#).await,
            Err(ProtocolError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_wire_shape() {
        let frame = serde_json::to_value(SocketMessage::Exec {
            id: 7,
            command: "getState".to_string(),
            args: vec![],
        })
        .unwrap();
        assert_eq!(
            frame,
            json!({"event": "exec", "payload": {"id": 7, "command": "getState", "args": []}})
        );
    }
}
