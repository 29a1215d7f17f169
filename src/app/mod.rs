//! Command loop
//!
//! Wires the configuration, backend, dispatcher, session gate and
//! engine together, then runs an interactive loop on stdin. Until the
//! session is ready the loop pumps backend items itself so the
//! authorization exchange can progress; once ready it starts the engine
//! and reads commands.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::backend::{Backend, Request, SessionParameters};
use crate::cache::PacketCache;
use crate::codec::PayloadKind;
use crate::config::Config;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::engine::{Engine, EngineConfig};
use crate::session::{CredentialSource, SessionDriver};
use crate::stats::Stats;
use crate::tun::TunInterface;

/// Poll interval while waiting for authorization
const AUTH_POLL: Duration = Duration::from_millis(10);

/// History page size used by the cleanup command
const HISTORY_PAGE: i32 = 100;

/// Messages deleted per request
const DELETE_CHUNK: usize = 100;

const HELP: &str = "Help:\n\
    [start/stop] tunnel loops,\n\
    [on/off] the listening,\n\
    [close] connection,\n\
    [me] show self,\n\
    [welcome] send welcome message,\n\
    [clean] tunnel messages in the peer chat,\n\
    [l] logout,\n\
    [q] quit";

/// The assembled tunnel application
pub struct App {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    session: Arc<SessionDriver>,
    engine: Arc<Engine>,
}

impl App {
    pub fn new(
        config: Config,
        backend: Arc<dyn Backend>,
        tun: Box<dyn TunInterface + Send>,
        credentials: Box<dyn CredentialSource>,
    ) -> Self {
        let stats = Arc::new(Stats::new());
        let cache = Arc::new(PacketCache::new());
        let dispatcher = Arc::new(Dispatcher::new(backend, Arc::clone(&stats)));

        let parameters = SessionParameters {
            database_directory: config.backend.database_directory.clone(),
            api_id: config.backend.api_id,
            api_hash: config.backend.api_hash.clone(),
            database_encryption_key: config.backend.database_encryption_key.clone(),
            device_model: "Desktop".to_string(),
            application_version: crate::VERSION.to_string(),
        };
        let session = Arc::new(SessionDriver::new(
            Arc::clone(&dispatcher),
            credentials,
            parameters,
        ));

        let engine = Engine::new(
            EngineConfig {
                send_to_chat_id: config.send_to_chat_id,
                receive_from_user_id: config.receive_from_user_id,
                cache_flush_rate: config.cache_flush_rate,
                mtu: tun.mtu(),
                tun_name: tun.name().to_string(),
                tun_ip: config.tun.ip.to_string(),
            },
            Arc::clone(&dispatcher),
            cache,
            stats,
            Arc::clone(&session),
            tun,
        );

        // probe the backend so the first inbound items start flowing
        dispatcher.send(Request::GetOption {
            name: "version".to_string(),
        });

        Self {
            config,
            dispatcher,
            session,
            engine,
        }
    }

    /// Run until the user quits or the session closes.
    pub async fn run(&self) -> crate::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            if self.session.need_restart() {
                info!("backend session closed, exiting");
                break;
            }
            if !self.session.is_ready() {
                self.engine.pump_once(AUTH_POLL).await;
                if self.session.is_ready() {
                    self.engine.start().await;
                }
                continue;
            }

            println!("{HELP}");
            let Some(line) = lines.next_line().await? else {
                break;
            };
            let Some(action) = line.split_whitespace().next() else {
                continue;
            };
            match action {
                "q" => break,
                "start" => self.engine.start().await,
                "stop" => self.engine.stop().await,
                "on" => self.engine.set_listen(true),
                "off" => self.engine.set_listen(false),
                "welcome" => self.engine.welcome(),
                "close" => {
                    println!("Closing...");
                    self.dispatcher.send(Request::Close);
                }
                "me" => {
                    let handle = self.dispatcher.query(Request::GetMe);
                    tokio::spawn(async move {
                        match handle.response().await {
                            Ok(response) => println!("{response:?}"),
                            Err(e) => warn!("me failed: {}", e),
                        }
                    });
                }
                "l" => {
                    println!("Logging out...");
                    self.dispatcher.send(Request::LogOut);
                }
                "clean" => self.spawn_clean(),
                _ => println!("Unsupported action: {action}"),
            }
        }
        if self.engine.is_running() {
            self.engine.stop().await;
        }
        Ok(())
    }

    fn spawn_clean(&self) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let chat_id = self.config.send_to_chat_id;
        tokio::spawn(async move {
            match clean_chat(&dispatcher, chat_id).await {
                Ok(count) => println!("Cleaned {count} messages!"),
                Err(e) => warn!("clean failed: {}", e),
            }
        });
    }
}

/// Delete every tunnel payload message from the peer chat.
///
/// Walks the whole history, collects ids of messages whose text starts
/// with a tunnel header tag and deletes them in chunks. Returns how
/// many messages were deleted.
pub async fn clean_chat(
    dispatcher: &Dispatcher,
    chat_id: i64,
) -> Result<usize, DispatchError> {
    let mut tagged: Vec<i64> = Vec::new();
    dispatcher
        .fetch_history(chat_id, i32::MAX, HISTORY_PAGE, |page| {
            tagged.extend(page.iter().filter_map(|message| {
                let text = message.text.as_deref()?;
                PayloadKind::classify(text).map(|_| message.id)
            }));
        })
        .await?;

    let mut cleaned = 0;
    for chunk in tagged.chunks(DELETE_CHUNK) {
        let response = dispatcher
            .query(Request::DeleteMessages {
                chat_id,
                message_ids: chunk.to_vec(),
                revoke: true,
            })
            .response()
            .await?;
        if matches!(response, crate::backend::Response::Ok) {
            cleaned += chunk.len();
        }
    }
    Ok(cleaned)
}
