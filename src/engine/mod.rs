//! Tunnel engine
//!
//! Owns the four loops that move packets once the session is ready:
//!
//! - capture: polls the TUN device and turns packets into payloads
//! - receive: pumps backend items through the dispatcher
//! - flush: drains the batch cache on its configured rate
//! - telemetry: logs the counter table every few seconds
//!
//! All loops share one `running` flag; `listen` pauses traffic without
//! tearing the loops down. Start and stop are idempotent.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::PushEvent;
use crate::cache::PacketCache;
use crate::codec::{self, PayloadKind};
use crate::dispatch::Dispatcher;
use crate::session::SessionDriver;
use crate::stats::Stats;
use crate::tun::TunInterface;
use crate::{MESSAGE_MAX_SIZE, PACKET_HEADER_SLACK};

/// Poll interval of the capture and receive loops
const POLL_TICK: Duration = Duration::from_millis(1);

/// Telemetry logging interval
const TELEMETRY_TICK: Duration = Duration::from_secs(5);

/// Static engine parameters taken from the configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Chat that receives our payloads
    pub send_to_chat_id: i64,
    /// Peer whose messages we accept
    pub receive_from_user_id: i64,
    /// Batch flushes per second; zero or less sends each packet directly
    pub cache_flush_rate: f32,
    /// TUN device MTU
    pub mtu: usize,
    /// TUN device name, for the announcement
    pub tun_name: String,
    /// TUN device address, for the announcement
    pub tun_ip: String,
}

impl EngineConfig {
    fn batching(&self) -> bool {
        self.cache_flush_rate > 0.0
    }
}

/// The packet tunnel engine
pub struct Engine {
    cfg: EngineConfig,
    dispatcher: Arc<Dispatcher>,
    cache: Arc<PacketCache>,
    stats: Arc<Stats>,
    session: Arc<SessionDriver>,
    tun: StdMutex<Box<dyn TunInterface + Send>>,
    running: AtomicBool,
    listen: AtomicBool,
    stopping: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        dispatcher: Arc<Dispatcher>,
        cache: Arc<PacketCache>,
        stats: Arc<Stats>,
        session: Arc<SessionDriver>,
        tun: Box<dyn TunInterface + Send>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            dispatcher,
            cache,
            stats,
            session,
            tun: StdMutex::new(tun),
            running: AtomicBool::new(false),
            listen: AtomicBool::new(true),
            stopping: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Pause or resume traffic without touching the loops.
    pub fn set_listen(&self, on: bool) {
        self.listen.store(on, Ordering::SeqCst);
        info!("listening {}", if on { "enabled" } else { "disabled" });
    }

    /// Spawn the tunnel loops and announce the device to the peer.
    /// Calling start on a running engine does nothing.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("engine already started");
            return;
        }
        info!("starting tunnel loops");
        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(Arc::clone(self).receive_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).capture_loop()));
        if self.cfg.batching() {
            tasks.push(tokio::spawn(Arc::clone(self).flush_loop()));
        }
        tasks.push(tokio::spawn(Arc::clone(self).telemetry_loop()));
        drop(tasks);
        self.welcome();
    }

    /// Clear the running flag and join every loop. Calling stop on a
    /// stopped engine does nothing.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("engine already stopped");
            return;
        }
        self.stopping.notify_waiters();
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        info!("tunnel loops stopped");
    }

    /// Announce the device to the peer chat.
    pub fn welcome(&self) {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".into());
        let text = format!(
            "{}{} started tun device: {} dev {}",
            codec::HEADER_WELCOME,
            host,
            self.cfg.tun_ip,
            self.cfg.tun_name
        );
        self.dispatcher.send_payload(self.cfg.send_to_chat_id, text);
    }

    /// Pump one inbound backend item, if any arrives within `timeout`.
    ///
    /// The receive loop calls this continuously while the engine runs;
    /// before the session is ready the command loop calls it instead so
    /// authorization can make progress without the loops.
    pub async fn pump_once(&self, timeout: Duration) {
        if let Some(inbound) = self.dispatcher.receive(timeout).await {
            if let Some(event) = self.dispatcher.dispatch(inbound) {
                self.route_push(event);
            }
        }
    }

    fn route_push(&self, event: PushEvent) {
        match event {
            PushEvent::AuthState { phase } => self.session.handle_phase(phase),
            PushEvent::SendAcknowledged => self.stats.incr("out_send_acknowledged"),
            PushEvent::SendSucceeded => self.stats.incr("out_send_succeeded"),
            PushEvent::NewMessage {
                chat_id,
                sender_id,
                text,
            } => self.handle_message(chat_id, sender_id, &text),
            PushEvent::Other { kind } => debug!("ignoring backend event: {}", kind),
        }
    }

    fn handle_message(&self, chat_id: i64, sender_id: i64, text: &str) {
        self.stats.incr("in_receive");
        // both the hosting chat and the author must be the configured peer
        if chat_id != self.cfg.receive_from_user_id || sender_id != self.cfg.receive_from_user_id {
            return;
        }
        match PayloadKind::classify(text) {
            Some((PayloadKind::Single, body)) => match codec::decode_single(body) {
                Ok(packet) => self.write_inbound(&packet),
                Err(e) => warn!("undecodable single-packet payload ({}): {}", e, text),
            },
            Some((PayloadKind::Multiple, body)) => match codec::decode_batch(body) {
                Ok(batch) => {
                    if let Some(corruption) = &batch.corruption {
                        warn!("corrupted batch frame ({}): {}", corruption, text);
                    }
                    for packet in &batch.packets {
                        self.write_inbound(packet);
                    }
                }
                Err(e) => warn!("undecodable batch payload ({}): {}", e, text),
            },
            Some((PayloadKind::Welcome, body)) => info!("peer announcement: {}", body),
            None => {}
        }
    }

    fn write_inbound(&self, packet: &[u8]) {
        let result = self.tun.lock().unwrap().write_packet(packet);
        match result {
            Ok(n) if n == packet.len() => self.stats.incr("in_write_ok"),
            Ok(n) => {
                warn!("short write to tun device: {} of {} bytes", n, packet.len());
                self.stats.incr("in_write_error");
            }
            Err(e) => {
                warn!("failed to write packet to tun device: {}", e);
                self.stats.incr("in_write_error");
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        debug!("receive loop started");
        while self.running.load(Ordering::SeqCst) {
            self.pump_once(POLL_TICK).await;
        }
        debug!("receive loop stopped");
    }

    async fn capture_loop(self: Arc<Self>) {
        debug!("capture loop started");
        let mut tick = tokio::time::interval(POLL_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut buf = vec![0u8; self.cfg.mtu + PACKET_HEADER_SLACK];
        while self.running.load(Ordering::SeqCst) {
            tick.tick().await;
            if !self.listen.load(Ordering::SeqCst) {
                continue;
            }
            let read = self.tun.lock().unwrap().read_packet(&mut buf);
            let len = match read {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!("tun read failed: {}", e);
                    self.stats.incr("out_tun_read_error");
                    continue;
                }
            };
            self.stats.incr("out_tun_read_ok");
            let packet = Bytes::copy_from_slice(&buf[..len]);
            if self.cfg.batching() {
                self.cache.append(packet);
                self.stats.incr("out_cache_inserted");
            } else {
                self.dispatcher
                    .send_payload(self.cfg.send_to_chat_id, codec::encode_single(&packet));
            }
        }
        debug!("capture loop stopped");
    }

    async fn flush_loop(self: Arc<Self>) {
        debug!("flush loop started");
        // floor at the poll tick: a sub-millisecond period rounds down
        // to zero, which interval_at rejects
        let period =
            Duration::from_secs_f64(1.0 / self.cfg.cache_flush_rate as f64).max(POLL_TICK);
        // first flush happens a full period after start
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.stopping.notified() => continue,
            }
            if !self.listen.load(Ordering::SeqCst) {
                continue;
            }
            self.flush_cache();
        }
        debug!("flush loop stopped");
    }

    /// Drain the cache and send its packets as batch payloads.
    pub fn flush_cache(&self) {
        let packets = self.cache.drain_all();
        if packets.is_empty() {
            return;
        }
        for payload in codec::encode_batches(&packets, MESSAGE_MAX_SIZE) {
            self.dispatcher.send_payload(self.cfg.send_to_chat_id, payload);
        }
    }

    async fn telemetry_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval_at(
            tokio::time::Instant::now() + TELEMETRY_TICK,
            TELEMETRY_TICK,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.stopping.notified() => continue,
            }
            if !self.listen.load(Ordering::SeqCst) {
                continue;
            }
            info!("stats: {}", self.stats.render());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::backend::{Backend, SessionParameters};
    use crate::session::StaticCredentials;
    use crate::tun::MockTun;

    fn make_engine(
        cache_flush_rate: f32,
    ) -> (Arc<Engine>, Arc<MockBackend>, MockTun, Arc<Stats>) {
        let backend = Arc::new(MockBackend::new());
        let stats = Arc::new(Stats::new());
        let dispatcher = Arc::new(Dispatcher::new(
            backend.clone() as Arc<dyn Backend>,
            stats.clone(),
        ));
        let session = Arc::new(SessionDriver::new(
            dispatcher.clone(),
            Box::new(StaticCredentials {
                phone_number: "+15550100".into(),
                code: "12345".into(),
                password: "hunter2".into(),
            }),
            SessionParameters::default(),
        ));
        let tun = MockTun::new("tun0", 1500);
        let engine = Engine::new(
            EngineConfig {
                send_to_chat_id: 100,
                receive_from_user_id: 200,
                cache_flush_rate,
                mtu: 1500,
                tun_name: "tun0".into(),
                tun_ip: "10.0.0.1".into(),
            },
            dispatcher,
            Arc::new(PacketCache::new()),
            stats.clone(),
            session,
            Box::new(tun.clone()),
        );
        (engine, backend, tun, stats)
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (engine, _, _, _) = make_engine(0.0);
        assert!(!engine.is_running());
        engine.start().await;
        engine.start().await;
        assert!(engine.is_running());
        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_welcome_announcement() {
        let (engine, backend, _, _) = make_engine(0.0);
        engine.welcome();
        let sent = backend.sent_texts();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 100);
        assert!(sent[0].1.starts_with(codec::HEADER_WELCOME));
        assert!(sent[0].1.ends_with("started tun device: 10.0.0.1 dev tun0"));
    }

    #[tokio::test]
    async fn test_inbound_from_wrong_peer_is_dropped() {
        let (engine, _, tun, stats) = make_engine(0.0);
        let payload = codec::encode_single(&[1, 2, 3]);
        engine.handle_message(200, 999, &payload);
        engine.handle_message(999, 200, &payload);
        assert_eq!(stats.get("in_receive"), 2);
        assert_eq!(stats.get("in_write_ok"), 0);
        assert!(tun.written().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_single_written_to_tun() {
        let (engine, _, tun, stats) = make_engine(0.0);
        let packet = vec![0x45, 0, 0, 40];
        engine.handle_message(200, 200, &codec::encode_single(&packet));
        assert_eq!(tun.written(), vec![packet]);
        assert_eq!(stats.get("in_write_ok"), 1);
    }

    #[tokio::test]
    async fn test_inbound_batch_written_in_order() {
        let (engine, _, tun, _) = make_engine(2.0);
        let packets = vec![Bytes::from(vec![1u8; 10]), Bytes::from(vec![2u8; 20])];
        let payload = codec::encode_batch(&packets);
        engine.handle_message(200, 200, &payload);
        assert_eq!(tun.written(), vec![vec![1u8; 10], vec![2u8; 20]]);
    }

    #[tokio::test]
    async fn test_inbound_garbage_ignored() {
        let (engine, _, tun, stats) = make_engine(0.0);
        engine.handle_message(200, 200, "#iotts @@not-base64@@");
        engine.handle_message(200, 200, "just chatting");
        assert!(tun.written().is_empty());
        assert_eq!(stats.get("in_receive"), 2);
        assert_eq!(stats.get("in_write_error"), 0);
    }

    #[tokio::test]
    async fn test_high_flush_rate_still_flushes() {
        // a rate above 1000 used to collapse the flush period to zero
        let (engine, backend, tun, _) = make_engine(2000.0);
        engine.start().await;
        tun.inject(vec![4u8; 12]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.stop().await;

        let batches: Vec<String> = backend
            .sent_texts()
            .into_iter()
            .filter(|(_, text)| text.starts_with(codec::HEADER_MULTIPLE))
            .map(|(_, text)| text)
            .collect();
        assert_eq!(batches.len(), 1);
        let (_, body) = PayloadKind::classify(&batches[0]).unwrap();
        let decoded = codec::decode_batch(body).unwrap();
        assert_eq!(decoded.packets, vec![Bytes::from(vec![4u8; 12])]);
        assert!(engine.cache.is_empty());
    }

    #[tokio::test]
    async fn test_flush_cache_sends_batches() {
        let (engine, backend, _, _) = make_engine(2.0);
        engine.cache.append(Bytes::from(vec![1u8; 10]));
        engine.cache.append(Bytes::from(vec![2u8; 20]));
        engine.flush_cache();
        // empty cache flushes silently
        engine.flush_cache();

        let sent = backend.sent_texts();
        assert_eq!(sent.len(), 1);
        let (kind, body) = PayloadKind::classify(&sent[0].1).unwrap();
        assert_eq!(kind, PayloadKind::Multiple);
        let decoded = codec::decode_batch(body).unwrap();
        assert_eq!(decoded.packets.len(), 2);
    }
}
