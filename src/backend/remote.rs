//! Bridge connection
//!
//! Connects to the local messaging bridge over TCP and exchanges
//! newline-delimited JSON frames. Outbound frames carry the query id and
//! the request; inbound frames carry either a correlated response or a
//! pushed event:
//!
//! ```text
//! -> {"query_id":7,"request":{"type":"get_me"}}
//! <- {"query_id":7,"response":{"type":"user","id":42}}
//! <- {"event":{"type":"new_message","chat_id":1,"sender_id":1,"text":"..."}}
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::{Backend, BackendError, Inbound, PushEvent, Request, Response};

#[derive(Serialize)]
struct OutboundFrame<'a> {
    query_id: u64,
    request: &'a Request,
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(default)]
    query_id: u64,
    #[serde(default)]
    response: Option<Response>,
    #[serde(default)]
    event: Option<PushEvent>,
}

/// Backend implementation talking to a bridge process over TCP
pub struct RemoteBackend {
    outbound: mpsc::UnboundedSender<String>,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

impl RemoteBackend {
    /// Connect to the bridge and spawn its reader and writer tasks.
    ///
    /// The tasks run for the lifetime of the connection; when the bridge
    /// closes the socket the inbound stream ends and `receive` only
    /// times out from then on.
    pub async fn connect(addr: &str) -> Result<Self, BackendError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();

        tokio::spawn(async move {
            while let Some(mut line) = out_rx.recv().await {
                line.push('\n');
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    warn!("bridge write failed: {}", e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_frame(&line) {
                        Ok(inbound) => {
                            if in_tx.send(inbound).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("dropping malformed bridge frame: {}", e),
                    },
                    Ok(None) => {
                        debug!("bridge closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("bridge read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
        })
    }
}

fn parse_frame(line: &str) -> Result<Inbound, BackendError> {
    let frame: InboundFrame =
        serde_json::from_str(line).map_err(|e| BackendError::Protocol(e.to_string()))?;
    match (frame.response, frame.event) {
        (Some(response), None) => Ok(Inbound::Reply {
            query_id: frame.query_id,
            response,
        }),
        (None, Some(event)) => Ok(Inbound::Push(event)),
        _ => Err(BackendError::Protocol(
            "frame carries neither a response nor an event".into(),
        )),
    }
}

#[async_trait::async_trait]
impl Backend for RemoteBackend {
    fn send(&self, query_id: u64, request: Request) {
        let frame = OutboundFrame {
            query_id,
            request: &request,
        };
        match serde_json::to_string(&frame) {
            // a closed writer is reported by the writer task, not here
            Ok(line) => {
                let _ = self.outbound.send(line);
            }
            Err(e) => warn!("failed to serialize request: {}", e),
        }
    }

    async fn receive(&self, timeout: Duration) -> Option<Inbound> {
        let mut inbound = self.inbound.lock().await;
        tokio::time::timeout(timeout, inbound.recv())
            .await
            .ok()
            .flatten()
    }
}
