//! In-memory backend for tests.
//!
//! Records every request, lets tests push inbound items by hand, and
//! optionally answers requests through a scripted responder closure.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use super::{Backend, Inbound, Request, Response};

type Responder = Box<dyn Fn(u64, &Request) -> Option<Inbound> + Send + Sync>;

/// Scriptable backend double
pub struct MockBackend {
    sent: StdMutex<Vec<(u64, Request)>>,
    responder: StdMutex<Option<Responder>>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            sent: StdMutex::new(Vec::new()),
            responder: StdMutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
        }
    }

    /// Queue an inbound item as if the service had sent it.
    pub fn push(&self, inbound: Inbound) {
        let _ = self.inbound_tx.send(inbound);
    }

    /// Script replies: the closure sees each sent request and may queue
    /// an inbound item in response.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(u64, &Request) -> Option<Inbound> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// Acknowledge every text message send with `Response::Ok`.
    pub fn ack_sends(&self) {
        self.set_responder(|query_id, request| {
            matches!(request, Request::SendTextMessage { .. }).then(|| Inbound::Reply {
                query_id,
                response: Response::Ok,
            })
        });
    }

    /// Every request sent so far, in order.
    pub fn sent(&self) -> Vec<(u64, Request)> {
        self.sent.lock().unwrap().clone()
    }

    /// Chat id and text of every `SendTextMessage` sent so far.
    pub fn sent_texts(&self) -> Vec<(i64, String)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, request)| match request {
                Request::SendTextMessage { chat_id, text } => Some((*chat_id, text.clone())),
                _ => None,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    fn send(&self, query_id: u64, request: Request) {
        let scripted = self
            .responder
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|responder| responder(query_id, &request));
        self.sent.lock().unwrap().push((query_id, request));
        if let Some(inbound) = scripted {
            let _ = self.inbound_tx.send(inbound);
        }
    }

    async fn receive(&self, timeout: Duration) -> Option<Inbound> {
        let mut inbound = self.inbound_rx.lock().await;
        tokio::time::timeout(timeout, inbound.recv())
            .await
            .ok()
            .flatten()
    }
}
