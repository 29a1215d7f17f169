//! Linux TUN device.
//!
//! Creating the device requires CAP_NET_ADMIN. The device is switched
//! to non-blocking mode so the capture loop can poll it on its tick.

use std::io::{self, Read, Write};
use std::net::Ipv4Addr;

use tun::AbstractDevice;

use super::TunInterface;

/// Kernel TUN device configured with an address, netmask and MTU
pub struct LinuxTun {
    device: tun::Device,
    name: String,
    mtu: usize,
}

impl LinuxTun {
    /// Create and bring up a TUN device.
    ///
    /// An empty `name` lets the kernel pick one.
    pub fn open(name: &str, ip: Ipv4Addr, prefix: u8, mtu: u16) -> io::Result<Self> {
        let mut config = tun::Configuration::default();
        if !name.is_empty() {
            config.tun_name(name);
        }
        config.address(ip);
        config.netmask(prefix_to_netmask(prefix));
        config.mtu(mtu);
        config.up();

        let device = tun::create(&config)
            .map_err(|e| io::Error::other(format!("failed to create tun device: {e}")))?;
        device.set_nonblock()?;
        let actual_name = device
            .tun_name()
            .map_err(|e| io::Error::other(format!("failed to get tun name: {e}")))?;

        Ok(Self {
            device,
            name: actual_name,
            mtu: mtu as usize,
        })
    }
}

impl TunInterface for LinuxTun {
    fn read_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.read(buf)
    }

    fn write_packet(&mut self, packet: &[u8]) -> io::Result<usize> {
        self.device.write(packet)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

fn prefix_to_netmask(prefix: u8) -> Ipv4Addr {
    let mask = if prefix == 0 {
        0
    } else if prefix >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix)
    };
    Ipv4Addr::from(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_to_netmask() {
        assert_eq!(prefix_to_netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_netmask(16), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(prefix_to_netmask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(prefix_to_netmask(0), Ipv4Addr::new(0, 0, 0, 0));
    }

    // Creating a real device needs CAP_NET_ADMIN.
    #[test]
    #[ignore = "requires root privileges"]
    fn test_open_tun_device() {
        let result = LinuxTun::open("gramtun-test0", Ipv4Addr::new(10, 99, 0, 1), 24, 1500);
        if let Err(e) = result {
            eprintln!("expected to fail without root: {e}");
        }
    }
}
