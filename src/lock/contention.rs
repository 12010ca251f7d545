//! Lock Contention Handler
//!
//! Lets a process waiting for a lock ask the current holder to release it.
//!
//! # Protocol
//!
//! UDP on the loopback interface, 9-byte packets `[type][lock id (i64 BE)]`:
//!
//! ```text
//! waiter                                 holder
//!   │ ── UnlockRequest(lock id) ──────────▶ │  invoke "when contended" action
//!   │ ◀── UnlockRequestConfirmation ─────── │
//!   │                                       │  ... releases when idle ...
//!   │ ◀── LockReleaseConfirmation ───────── │  ReleaseSignal::trigger()
//!   │  wake backoff, retry now              │
//! ```
//!
//! Everything is best effort: lost packets only mean the waiter falls back
//! to its normal backoff schedule.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Minimum time between two pings to the same holder
pub const PING_DELAY: Duration = Duration::from_secs(1);

/// Poll interval of the listener thread, bounds shutdown latency
const RECEIVE_TIMEOUT: Duration = Duration::from_millis(200);

const PACKET_SIZE: usize = 9;

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PacketType {
    UnlockRequest = 0,
    UnlockRequestConfirmation = 1,
    LockReleaseConfirmation = 2,
}

impl PacketType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PacketType::UnlockRequest),
            1 => Some(PacketType::UnlockRequestConfirmation),
            2 => Some(PacketType::LockReleaseConfirmation),
            _ => None,
        }
    }
}

fn encode(kind: PacketType, lock_id: i64) -> [u8; PACKET_SIZE] {
    let mut packet = [0u8; PACKET_SIZE];
    packet[0] = kind as u8;
    packet[1..].copy_from_slice(&lock_id.to_be_bytes());
    packet
}

fn decode(packet: &[u8]) -> Option<(PacketType, i64)> {
    if packet.len() != PACKET_SIZE {
        return None;
    }
    let kind = PacketType::from_byte(packet[0])?;
    let mut id = [0u8; 8];
    id.copy_from_slice(&packet[1..]);
    Some((kind, i64::from_be_bytes(id)))
}

/// Action invoked on the holder side when somebody asks for the lock
pub type WhenContended = Arc<dyn Fn(ReleaseSignal) + Send + Sync>;

/// Handed to a "when contended" action; triggering it tells every waiter
/// that the lock has been released
#[derive(Clone)]
pub struct ReleaseSignal {
    lock_id: i64,
    handler: Arc<HandlerShared>,
}

impl ReleaseSignal {
    /// Notify all requesters of this lock that it is free now
    pub fn trigger(&self) {
        let requesters = {
            let mut contended = self.handler.contended.lock();
            match contended.get_mut(&self.lock_id) {
                Some(entry) => {
                    entry.pending = false;
                    std::mem::take(&mut entry.requesters)
                }
                None => HashSet::new(),
            }
        };
        for addr in requesters {
            self.handler
                .send(addr, PacketType::LockReleaseConfirmation, self.lock_id);
        }
    }

    pub fn lock_id(&self) -> i64 {
        self.lock_id
    }
}

impl std::fmt::Debug for ReleaseSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseSignal")
            .field("lock_id", &self.lock_id)
            .finish()
    }
}

/// Holder-side registration of a lock that reacts to contention
struct ContendedLock {
    action: WhenContended,
    requesters: HashSet<SocketAddr>,
    /// The action has been invoked and has not released yet
    pending: bool,
}

struct HandlerShared {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    contended: Mutex<HashMap<i64, ContendedLock>>,
    /// Waiters to wake when a holder confirms release, keyed by holder lock id
    waiters: Mutex<HashMap<i64, Vec<Sender<()>>>>,
    stopped: AtomicBool,
}

impl HandlerShared {
    fn send(&self, addr: SocketAddr, kind: PacketType, lock_id: i64) {
        let socket = self.socket.lock().clone();
        if let Some(socket) = socket {
            if let Err(e) = socket.send_to(&encode(kind, lock_id), addr) {
                debug!("Failed to send {:?} for lock {} to {}: {}", kind, lock_id, addr, e);
            }
        }
    }
}

/// Process-wide listener for contention pings
pub struct ContentionHandler {
    shared: Arc<HandlerShared>,
    enabled: bool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ContentionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentionHandler {
    /// Handler that listens for pings once a port is reserved
    pub fn new() -> Self {
        Self::with_pings(true)
    }

    /// Handler that never pings nor listens
    pub fn disabled() -> Self {
        Self::with_pings(false)
    }

    fn with_pings(enabled: bool) -> Self {
        Self {
            shared: Arc::new(HandlerShared {
                socket: Mutex::new(None),
                contended: Mutex::new(HashMap::new()),
                waiters: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
            }),
            enabled,
            listener: Mutex::new(None),
        }
    }

    /// Port on which this process accepts pings, binding lazily; -1 when
    /// pings are disabled or the socket cannot be bound
    pub fn reserve_port(&self) -> i32 {
        if !self.enabled || self.shared.stopped.load(Ordering::SeqCst) {
            return -1;
        }
        match self.ensure_socket() {
            Ok(port) => i32::from(port),
            Err(e) => {
                warn!("Cannot listen for file lock contention pings: {}", e);
                -1
            }
        }
    }

    fn ensure_socket(&self) -> io::Result<u16> {
        let mut guard = self.shared.socket.lock();
        if let Some(socket) = guard.as_ref() {
            return Ok(socket.local_addr()?.port());
        }
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
        socket.set_read_timeout(Some(RECEIVE_TIMEOUT))?;
        let socket = Arc::new(socket);
        let port = socket.local_addr()?.port();
        *guard = Some(socket.clone());
        drop(guard);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("file-lock-contention".to_string())
            .spawn(move || listen(shared, socket))?;
        *self.listener.lock() = Some(handle);
        debug!("Listening for file lock contention pings on port {}", port);
        Ok(port)
    }

    /// Start reacting to unlock requests for `lock_id`
    pub fn start(&self, lock_id: i64, action: WhenContended) {
        self.shared.contended.lock().insert(
            lock_id,
            ContendedLock {
                action,
                requesters: HashSet::new(),
                pending: false,
            },
        );
    }

    /// Stop reacting to unlock requests for `lock_id`.
    ///
    /// Requesters still waiting are told the lock is gone.
    pub fn stop(&self, lock_id: i64) {
        let removed = self.shared.contended.lock().remove(&lock_id);
        if let Some(entry) = removed {
            for addr in entry.requesters {
                self.shared
                    .send(addr, PacketType::LockReleaseConfirmation, lock_id);
            }
        }
    }

    /// Ping the holder listening on `port` unless it was pinged recently.
    ///
    /// `wake` is fired when the holder confirms the release. Returns true if a
    /// ping was sent.
    pub fn maybe_ping_owner(
        &self,
        port: i32,
        lock_id: i64,
        display_name: &str,
        since_last_ping: Duration,
        wake: &Sender<()>,
    ) -> bool {
        if port <= 0 || port > i32::from(u16::MAX) || since_last_ping < PING_DELAY {
            return false;
        }
        if self.reserve_port() == -1 {
            return false;
        }
        {
            let mut waiters = self.shared.waiters.lock();
            let senders = waiters.entry(lock_id).or_default();
            if !senders.iter().any(|s| s.same_channel(wake)) {
                senders.push(wake.clone());
            }
        }
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port as u16));
        debug!("Pinging owner of lock {} on port {} ({})", lock_id, port, display_name);
        self.shared.send(addr, PacketType::UnlockRequest, lock_id);
        true
    }

    /// Drop every wake-up registered through `wake`, once its waiter has
    /// stopped waiting
    pub fn forget_waiter(&self, wake: &Sender<()>) {
        self.shared.waiters.lock().retain(|_, senders| {
            senders.retain(|s| !s.same_channel(wake));
            !senders.is_empty()
        });
    }

    /// Stop the listener thread
    pub fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.listener.lock().take() {
            let _ = handle.join();
        }
        self.shared.socket.lock().take();
    }
}

impl Drop for ContentionHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn listen(shared: Arc<HandlerShared>, socket: Arc<UdpSocket>) {
    let mut buf = [0u8; 64];
    while !shared.stopped.load(Ordering::SeqCst) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue
            }
            Err(e) => {
                debug!("Contention listener receive failed: {}", e);
                continue;
            }
        };
        let Some((kind, lock_id)) = decode(&buf[..len]) else {
            debug!("Ignoring malformed contention packet from {}", from);
            continue;
        };
        match kind {
            PacketType::UnlockRequest => on_unlock_request(&shared, lock_id, from),
            PacketType::UnlockRequestConfirmation => {
                debug!("Holder of lock {} acknowledged our unlock request", lock_id);
            }
            PacketType::LockReleaseConfirmation => {
                let waiters = shared.waiters.lock().remove(&lock_id).unwrap_or_default();
                for waiter in waiters {
                    let _ = waiter.send(());
                }
            }
        }
    }
}

fn on_unlock_request(shared: &Arc<HandlerShared>, lock_id: i64, from: SocketAddr) {
    let action = {
        let mut contended = shared.contended.lock();
        let Some(entry) = contended.get_mut(&lock_id) else {
            return;
        };
        entry.requesters.insert(from);
        if entry.pending {
            None
        } else {
            entry.pending = true;
            Some(entry.action.clone())
        }
    };
    shared.send(from, PacketType::UnlockRequestConfirmation, lock_id);

    if let Some(action) = action {
        let signal = ReleaseSignal {
            lock_id,
            handler: shared.clone(),
        };
        let spawned = std::thread::Builder::new()
            .name(format!("file-lock-release-{}", lock_id))
            .spawn(move || action(signal));
        if let Err(e) = spawned {
            warn!("Cannot run contention action for lock {}: {}", lock_id, e);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
