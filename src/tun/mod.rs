//! TUN device abstraction
//!
//! The engine reads and writes raw IP packets through [`TunInterface`].
//! Reads are non-blocking polls so the capture loop can share its tick
//! with the stop flag. [`MockTun`] is the in-memory double used by
//! tests; the real Linux device lives in [`linux`].

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

/// Raw packet interface of a TUN device
pub trait TunInterface: Send {
    /// Poll for one packet. `Ok(0)` or `ErrorKind::WouldBlock` means no
    /// packet is ready right now.
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet, returning the bytes written.
    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize>;

    /// Interface name
    fn name(&self) -> &str;

    /// Maximum transmission unit
    fn mtu(&self) -> usize;
}

/// In-memory TUN device for tests.
///
/// Clones share state, so a test can keep a handle for injecting and
/// inspecting packets after moving a clone into the engine.
#[derive(Debug, Clone)]
pub struct MockTun {
    name: String,
    mtu: usize,
    incoming: Arc<Mutex<VecDeque<Vec<u8>>>>,
    written: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockTun {
    pub fn new(name: &str, mtu: usize) -> Self {
        Self {
            name: name.to_string(),
            mtu,
            incoming: Arc::new(Mutex::new(VecDeque::new())),
            written: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a packet for the next `read_packet` call.
    pub fn inject(&self, packet: Vec<u8>) {
        self.incoming.lock().unwrap().push_back(packet);
    }

    /// Every packet written to the device so far, in order.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }
}

impl TunInterface for MockTun {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(packet) = self.incoming.lock().unwrap().pop_front() else {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no packet ready"));
        };
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().push(packet.to_vec());
        Ok(packet.len())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}
