//! The inbound packet plane: a fixed pool of reusable buffers, a bounded
//! queue, and per-socket receive threads.
//!
//! Receive threads never allocate: a datagram that arrives while the pool
//! is empty (or the queue is full) is dropped and counted. Workers that
//! drain the queue into the engine live in the service module, since they
//! need the engine handle.

use crate::binder::BoundSocket;
use crate::engine::SocketId;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Large enough for any overlay datagram plus slack.
pub(crate) const PACKET_BUF_SIZE: usize = 2048;

const PACKET_QUEUE_DEPTH: usize = 256;
const PACKET_POOL_SIZE: usize = 128;

pub(crate) type PacketBuf = Box<[u8; PACKET_BUF_SIZE]>;

pub(crate) struct InboundPacket {
    pub socket: SocketId,
    pub from: SocketAddr,
    pub buf: PacketBuf,
    pub len: usize,
}

pub(crate) struct PacketPlane {
    pool: Mutex<Vec<PacketBuf>>,
    tx: Sender<InboundPacket>,
    rx: Receiver<InboundPacket>,
    pub dropped: AtomicU64,
}

impl PacketPlane {
    pub fn new() -> Self {
        let (tx, rx) = bounded(PACKET_QUEUE_DEPTH);
        let pool = (0..PACKET_POOL_SIZE)
            .map(|_| Box::new([0u8; PACKET_BUF_SIZE]))
            .collect();
        Self {
            pool: Mutex::new(pool),
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn queue(&self) -> Receiver<InboundPacket> {
        self.rx.clone()
    }

    pub fn return_buffer(&self, buf: PacketBuf) {
        let mut pool = self.pool.lock();
        if pool.len() < PACKET_POOL_SIZE {
            pool.push(buf);
        }
    }

    fn take_buffer(&self) -> Option<PacketBuf> {
        self.pool.lock().pop()
    }

    fn drop_packet(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped % 1000 == 1 {
            log::warn!("inbound packet dropped (pool/queue exhausted, {dropped} total)");
        }
    }

    /// Blocking receive loop for one bound socket; runs until the socket is
    /// retired. Datagrams are pushed into the queue for the worker pool.
    pub fn receive_loop(&self, socket: Arc<BoundSocket>) {
        // Scratch space so a full pool still drains the socket.
        let mut scratch = [0u8; PACKET_BUF_SIZE];
        while socket.live.load(Ordering::Relaxed) {
            match self.take_buffer() {
                Some(mut buf) => match socket.sock.recv_from(&mut buf[..]) {
                    Ok((len, from)) => {
                        let packet = InboundPacket {
                            socket: socket.id,
                            from,
                            buf,
                            len,
                        };
                        if let Err(TrySendError::Full(packet) | TrySendError::Disconnected(packet)) =
                            self.tx.try_send(packet)
                        {
                            self.drop_packet();
                            self.return_buffer(packet.buf);
                        }
                    },
                    Err(e) => {
                        self.return_buffer(buf);
                        if !recv_error_is_benign(&e) {
                            log::debug!("recv on {} failed: {}", socket.local, e);
                        }
                    },
                },
                None => {
                    if socket.sock.recv_from(&mut scratch).is_ok() {
                        self.drop_packet();
                    }
                },
            }
        }
        log::debug!("receive thread for {} exiting", socket.local);
    }
}

fn recv_error_is_benign(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::RECV_TIMEOUT;
    use std::{
        net::{Ipv4Addr, UdpSocket},
        sync::atomic::AtomicBool,
        thread,
        time::Duration,
    };

    fn bound_socket() -> Arc<BoundSocket> {
        let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sock.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
        let local = sock.local_addr().unwrap();
        Arc::new(BoundSocket {
            id: SocketId(7),
            sock,
            local,
            interface: "lo-test".into(),
            live: AtomicBool::new(true),
        })
    }

    #[test]
    fn test_datagram_reaches_queue() {
        let plane = Arc::new(PacketPlane::new());
        let socket = bound_socket();
        let local = socket.local;

        let thread_plane = plane.clone();
        let thread_socket = socket.clone();
        let handle = thread::spawn(move || thread_plane.receive_loop(thread_socket));

        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sender.send_to(b"sixteen byte msg", local).unwrap();

        let packet = plane
            .queue()
            .recv_timeout(Duration::from_secs(5))
            .expect("packet should arrive");
        assert_eq!(packet.socket, SocketId(7));
        assert_eq!(&packet.buf[..packet.len], b"sixteen byte msg");
        plane.return_buffer(packet.buf);

        socket.live.store(false, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_buffer_pool_cycles() {
        let plane = Arc::new(PacketPlane::new());
        let buf = plane.take_buffer().unwrap();
        plane.return_buffer(buf);
        assert_eq!(plane.dropped.load(Ordering::Relaxed), 0);
    }
}
