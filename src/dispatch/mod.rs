//! Transport dispatcher
//!
//! Correlates backend replies with the requests that caused them. Every
//! request gets a process-unique query id; callers that care about the
//! reply hold a [`QueryHandle`] future, while plain payload sends leave
//! a stateless completion behind that turns the eventual reply into
//! counters.
//!
//! The completion is always registered before the request leaves, so
//! the receive loop can never observe a reply for an unknown id that
//! was actually ours.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::backend::{Backend, Inbound, MessageSummary, PushEvent, Request, Response};
use crate::stats::Stats;

/// Dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("query dropped before a response arrived")]
    Dropped,

    #[error("backend error {code}: {message}")]
    Backend { code: i32, message: String },
}

/// What to do with the reply for a registered query
enum Completion {
    /// Wake the caller holding the matching [`QueryHandle`]
    Resolve(oneshot::Sender<Response>),
    /// Nobody is waiting; fold the outcome into send counters
    SendReport,
}

/// Future side of a correlated query
pub struct QueryHandle {
    rx: oneshot::Receiver<Response>,
}

impl QueryHandle {
    /// Wait for the reply. Fails only if the dispatcher was dropped
    /// before the reply arrived.
    pub async fn response(self) -> Result<Response, DispatchError> {
        self.rx.await.map_err(|_| DispatchError::Dropped)
    }
}

/// Request/reply correlator shared by every loop
pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    pending: Mutex<HashMap<u64, Completion>>,
    next_query_id: AtomicU64,
    stats: Arc<Stats>,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn Backend>, stats: Arc<Stats>) -> Self {
        Self {
            backend,
            pending: Mutex::new(HashMap::new()),
            next_query_id: AtomicU64::new(0),
            stats,
        }
    }

    /// Query ids start at 1; 0 is reserved for uncorrelated frames.
    fn next_id(&self) -> u64 {
        self.next_query_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Send a request and get a handle resolving to its reply.
    pub fn query(&self, request: Request) -> QueryHandle {
        let query_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(query_id, Completion::Resolve(tx));
        self.backend.send(query_id, request);
        QueryHandle { rx }
    }

    /// Send a request whose reply nobody needs.
    pub fn send(&self, request: Request) {
        self.backend.send(self.next_id(), request);
    }

    /// Send a tunnel payload as a chat message. The reply is consumed
    /// by the receive loop and lands in the `out_send_*` counters.
    pub fn send_payload(&self, chat_id: i64, text: String) {
        let query_id = self.next_id();
        self.pending
            .lock()
            .unwrap()
            .insert(query_id, Completion::SendReport);
        self.backend
            .send(query_id, Request::SendTextMessage { chat_id, text });
    }

    /// Wait up to `timeout` for one inbound item from the backend.
    pub async fn receive(&self, timeout: Duration) -> Option<Inbound> {
        self.backend.receive(timeout).await
    }

    /// Route one inbound item. Replies resolve their completion and
    /// return `None`; push events are handed back to the caller.
    pub fn dispatch(&self, inbound: Inbound) -> Option<PushEvent> {
        match inbound {
            Inbound::Reply { query_id, response } => {
                let completion = self.pending.lock().unwrap().remove(&query_id);
                match completion {
                    Some(Completion::Resolve(tx)) => {
                        // the caller may have given up; that is fine
                        let _ = tx.send(response);
                    }
                    Some(Completion::SendReport) => self.report_send(&response),
                    None => trace!("dropping reply for unknown query {}", query_id),
                }
                None
            }
            Inbound::Push(event) => Some(event),
        }
    }

    fn report_send(&self, response: &Response) {
        match response {
            Response::Ok => self.stats.incr("out_send_ok"),
            Response::Error { code, message } => {
                debug!("payload send failed with code {}: {}", code, message);
                self.stats.incr("out_send_error");
            }
            Response::Message { outgoing: true, .. } => self.stats.incr("out_send_outgoing"),
            Response::Message { .. } => self.stats.incr("out_send_other"),
            _ => self.stats.incr("out_send_unknown"),
        }
    }

    /// Queries whose replies have not arrived yet
    pub fn pending_queries(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Page backward through a chat history, newest first.
    ///
    /// Fetches up to `total` messages in pages of `page_size`, handing
    /// each page to `on_page`. Stops early when the history runs out or
    /// a page comes back shorter than requested. Returns the number of
    /// messages seen.
    pub async fn fetch_history<F>(
        &self,
        chat_id: i64,
        total: i32,
        page_size: i32,
        mut on_page: F,
    ) -> Result<usize, DispatchError>
    where
        F: FnMut(&[MessageSummary]),
    {
        let mut from_message_id = 0i64;
        let mut remaining = total;
        let mut seen = 0usize;
        while remaining > 0 {
            let limit = remaining.min(page_size);
            let response = self
                .query(Request::GetChatHistory {
                    chat_id,
                    from_message_id,
                    offset: 0,
                    limit,
                    only_local: false,
                })
                .response()
                .await?;
            let messages = match response {
                Response::Messages { messages } => messages,
                Response::Error { code, message } => {
                    return Err(DispatchError::Backend { code, message })
                }
                other => {
                    warn!("unexpected history response: {:?}", other);
                    break;
                }
            };
            let Some(last) = messages.last() else { break };
            from_message_id = last.id;
            let short_page = (messages.len() as i32) < limit;
            remaining -= messages.len() as i32;
            seen += messages.len();
            on_page(&messages);
            if short_page {
                break;
            }
        }
        Ok(seen)
    }
}
