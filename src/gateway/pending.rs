use crate::core::errors::GatewayError;
use crate::gateway::codec::ResponseFrame;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type RequestResult = Result<Value, GatewayError>;
pub type Reply = oneshot::Sender<RequestResult>;

#[derive(Debug)]
struct PendingRequest {
    method: String,
    issued_at: Instant,
    /// `None` for fire-and-forget requests; the outcome is only logged
    reply: Option<Reply>,
}

impl PendingRequest {
    fn complete(self, id: &str, result: RequestResult) {
        match self.reply {
            Some(reply) => {
                // The waiter may have given up already
                let _ = reply.send(result);
            }
            None => match result {
                Ok(_) => debug!(id, method = %self.method, "Request acknowledged"),
                Err(e) => warn!(id, method = %self.method, "Request failed: {}", e),
            },
        }
    }
}

/// Outstanding requests keyed by id
///
/// Ids come from a counter that lives as long as the client, so they keep
/// increasing across reconnects and are never reused.
#[derive(Debug, Default)]
pub struct PendingRequests {
    last_id: u64,
    slots: HashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> String {
        self.last_id += 1;
        self.last_id.to_string()
    }

    pub fn register(&mut self, id: impl Into<String>, method: impl Into<String>, reply: Option<Reply>) {
        self.slots.insert(
            id.into(),
            PendingRequest {
                method: method.into(),
                issued_at: Instant::now(),
                reply,
            },
        );
    }

    /// Deliver a response to its slot. Returns false for unknown ids.
    pub fn resolve(&mut self, response: ResponseFrame) -> bool {
        let Some(request) = self.slots.remove(&response.id) else {
            debug!(id = %response.id, "Discarding response for unknown request");
            return false;
        };
        debug!(
            id = %response.id,
            method = %request.method,
            elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
            ok = response.ok,
            "Response received"
        );
        let id = response.id.clone();
        let result = response.into_result(&request.method);
        request.complete(&id, result);
        true
    }

    /// Time out a request if it is still outstanding
    pub fn expire(&mut self, id: &str, timeout: Duration) -> bool {
        let Some(request) = self.slots.remove(id) else {
            return false;
        };
        let error = GatewayError::RequestTimeout {
            method: request.method.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        request.complete(id, Err(error));
        true
    }

    /// Fail one request, e.g. when its frame could not be written
    pub fn fail(&mut self, id: &str, error: GatewayError) -> bool {
        match self.slots.remove(id) {
            Some(request) => {
                request.complete(id, Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request with `ConnectionLost`
    pub fn fail_all(&mut self) -> usize {
        let drained: Vec<_> = self.slots.drain().collect();
        let count = drained.len();
        for (id, request) in drained {
            request.complete(&id, Err(GatewayError::ConnectionLost));
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Caller side of a blocking-style request
#[derive(Debug)]
pub struct ResponseHandle {
    method: String,
    rx: oneshot::Receiver<RequestResult>,
}

impl ResponseHandle {
    pub(crate) fn new(method: impl Into<String>, rx: oneshot::Receiver<RequestResult>) -> Self {
        Self {
            method: method.into(),
            rx,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Block the current thread until the request resolves.
    ///
    /// The protocol loop enforces the timeout, so this always returns.
    /// Must not be called from inside an async runtime; use [`recv`](Self::recv) there.
    pub fn wait(self) -> RequestResult {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(GatewayError::ChannelClosed))
    }

    pub async fn recv(self) -> RequestResult {
        self.rx.await.unwrap_or(Err(GatewayError::ChannelClosed))
    }

    /// Non-blocking poll; `None` while the request is still in flight
    pub fn try_result(&mut self) -> Option<RequestResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(GatewayError::ChannelClosed)),
        }
    }
}
