//! An in-memory tap backend.
//!
//! `MemTap` implements the full [`Tap`] surface without touching the OS.
//! Frames delivered from the overlay via `put` are buffered for the
//! embedder to drain; frames the stack wants to transmit are injected with
//! [`MemTap::inject_frame`], which forwards them to the service's frame
//! sink. This is the backend used when the userspace IP stack consumes the
//! tap directly, and it doubles as the test double for the service crate.

use crate::{FrameSink, MacAddr, MulticastGroup, Tap, TapFactory};
use ipnet::IpNet;
use parking_lot::Mutex;
use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
};

/// A frame delivered from the overlay into the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub src: MacAddr,
    pub dst: MacAddr,
    pub ethertype: u16,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct MulticastState {
    subscribed: Vec<MulticastGroup>,
    pending_add: Vec<MulticastGroup>,
    pending_remove: Vec<MulticastGroup>,
}

pub struct MemTap {
    name: String,
    friendly_name: String,
    nwid: u64,
    mac: MacAddr,
    mtu: AtomicU32,
    ips: Mutex<Vec<IpNet>>,
    multicast: Mutex<MulticastState>,
    network_status: AtomicBool,
    sink: FrameSink,
    delivered: Mutex<Vec<Frame>>,
}

impl MemTap {
    pub fn nwid(&self) -> u64 {
        self.nwid
    }

    pub fn mac(&self) -> MacAddr {
        self.mac
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    /// Injects a frame as if the stack had written it to the device,
    /// forwarding it to the service's frame sink.
    pub fn inject_frame(&self, src: MacAddr, dst: MacAddr, ethertype: u16, data: &[u8]) {
        (self.sink)(src, dst, ethertype, data);
    }

    /// Drains frames the overlay has delivered via `put`.
    pub fn drain_delivered(&self) -> Vec<Frame> {
        std::mem::take(&mut self.delivered.lock())
    }

    /// Registers a multicast subscription; it is reported as added by the
    /// next `scan_multicast_groups`.
    pub fn subscribe_multicast(&self, group: MulticastGroup) {
        let mut state = self.multicast.lock();
        if !state.subscribed.contains(&group) {
            state.subscribed.push(group);
            state.pending_add.push(group);
        }
    }

    pub fn unsubscribe_multicast(&self, group: MulticastGroup) {
        let mut state = self.multicast.lock();
        if let Some(pos) = state.subscribed.iter().position(|g| *g == group) {
            state.subscribed.remove(pos);
            state.pending_remove.push(group);
        }
    }
}

impl Tap for MemTap {
    fn device_name(&self) -> String {
        self.name.clone()
    }

    fn add_ip(&self, addr: IpNet) -> io::Result<()> {
        let mut ips = self.ips.lock();
        if let Err(pos) = ips.binary_search(&addr) {
            ips.insert(pos, addr);
        }
        Ok(())
    }

    fn remove_ip(&self, addr: IpNet) -> io::Result<()> {
        let mut ips = self.ips.lock();
        match ips.binary_search(&addr) {
            Ok(pos) => {
                ips.remove(pos);
                Ok(())
            },
            Err(_) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{addr} is not installed on {}", self.name),
            )),
        }
    }

    fn ips(&self) -> Vec<IpNet> {
        self.ips.lock().clone()
    }

    fn set_mtu(&self, mtu: u32) {
        self.mtu.store(mtu, Ordering::Relaxed);
    }

    fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Relaxed)
    }

    fn put(&self, src: MacAddr, dst: MacAddr, ethertype: u16, data: &[u8]) {
        self.delivered.lock().push(Frame {
            src,
            dst,
            ethertype,
            data: data.to_vec(),
        });
    }

    fn scan_multicast_groups(&self, added: &mut Vec<MulticastGroup>, removed: &mut Vec<MulticastGroup>) {
        let mut state = self.multicast.lock();
        added.append(&mut state.pending_add);
        removed.append(&mut state.pending_remove);
    }

    fn set_network_status(&self, up: bool) {
        self.network_status.store(up, Ordering::Relaxed);
    }

    fn network_status(&self) -> bool {
        self.network_status.load(Ordering::Relaxed)
    }
}

/// Opens `MemTap` devices with sequentially numbered names (`tm0`, `tm1`, …).
#[derive(Default)]
pub struct MemTapFactory {
    next_index: AtomicUsize,
    opened: Mutex<Vec<Arc<MemTap>>>,
}

impl MemTapFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Taps opened so far, in creation order. Handles stay valid after the
    /// service drops its own reference.
    pub fn opened(&self) -> Vec<Arc<MemTap>> {
        self.opened.lock().clone()
    }
}

impl TapFactory for MemTapFactory {
    fn open(
        &self,
        nwid: u64,
        mac: MacAddr,
        mtu: u32,
        friendly_name: &str,
        sink: FrameSink,
    ) -> io::Result<Arc<dyn Tap>> {
        let name = format!("tm{}", self.next_index.fetch_add(1, Ordering::Relaxed));
        if name.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tap device name would exceed the system interface name limit",
            ));
        }
        log::debug!("opening tap {name} for network {nwid:016x} ({friendly_name})");
        let tap = Arc::new(MemTap {
            name,
            friendly_name: friendly_name.to_string(),
            nwid,
            mac,
            mtu: AtomicU32::new(mtu),
            ips: Mutex::new(Vec::new()),
            multicast: Mutex::new(MulticastState::default()),
            network_status: AtomicBool::new(false),
            sink,
            delivered: Mutex::new(Vec::new()),
        });
        self.opened.lock().push(tap.clone());
        Ok(tap as Arc<dyn Tap>)
    }
}
