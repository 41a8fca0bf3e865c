//! In-process unreliable-datagram fabric.
//!
//! Models the parts of an RDMA UD verbs stack the driver relies on: queue
//! pairs addressed by `(lid, qpn)`, receive buffers that must be posted
//! before anything can land in them, a completion queue per queue pair,
//! and a 40-byte global routing header in front of every delivered
//! datagram. A datagram sent to a queue pair with no posted buffers is
//! silently lost, as on real hardware.
//!
//! All receive-side state of a queue pair sits behind one mutex, which is
//! the only lock shared between a driver's poll loop and the worker
//! threads re-posting buffers.

use crate::address::QueuePairAddress;
use crate::error::{DriverError, DriverResult, PoolError};
use crate::received::PacketBuf;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Global routing header prepended to every received datagram.
pub const GRH_SIZE: usize = 40;

/// Size of every receive buffer (fabric MTU).
pub const UD_MTU: usize = 2048;

/// First queue pair number handed out.
const FIRST_QPN: u32 = 0x100;

/// What happened to a posted send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Landed in a receive buffer
    Delivered,
    /// Destination had no posted receive buffers
    NoReceiveBuffer,
    /// No queue pair at that address
    UnknownDestination,
    /// Datagram plus routing header exceeds the destination's buffer
    TooLarge,
}

/// A delivered datagram waiting to be polled.
#[derive(Debug)]
pub struct Completion {
    /// Buffer holding the datagram; its payload excludes the routing header
    pub buf: PacketBuf,
    /// Sending queue pair
    pub src: QueuePairAddress,
}

#[derive(Default)]
struct QpState {
    /// Buffers armed for incoming datagrams, in posting order
    posted: VecDeque<PacketBuf>,
    /// Delivered datagrams not yet polled
    completions: VecDeque<Completion>,
    /// Buffers handed out by `poll_completions` and not yet re-posted
    loaned: usize,
    /// Datagrams lost for lack of a posted buffer
    dropped: u64,
}

/// One queue pair on the fabric.
pub struct QueuePair {
    addr: QueuePairAddress,
    state: Mutex<QpState>,
}

impl QueuePair {
    fn state(&self) -> MutexGuard<'_, QpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fabric address.
    pub fn address(&self) -> QueuePairAddress {
        self.addr
    }

    /// Arm a fresh receive buffer.
    pub fn post_receive(&self, mut buf: PacketBuf) {
        buf.reset();
        self.state().posted.push_back(buf);
    }

    /// Re-arm a buffer previously handed out by
    /// [`poll_completions`](Self::poll_completions).
    ///
    /// Fails with [`PoolError::Underflow`] if no buffers are on loan.
    pub fn repost(&self, mut buf: PacketBuf) -> Result<(), PoolError> {
        let mut state = self.state();
        state.loaned = state.loaned.checked_sub(1).ok_or(PoolError::Underflow)?;
        buf.reset();
        state.posted.push_back(buf);
        Ok(())
    }

    /// Move up to `max` completions into `out`, oldest first. The buffers
    /// are on loan until re-posted.
    pub fn poll_completions(&self, max: usize, out: &mut Vec<Completion>) -> usize {
        let mut state = self.state();
        let n = max.min(state.completions.len());
        out.extend(state.completions.drain(..n));
        state.loaned += n;
        n
    }

    /// Buffers currently armed.
    pub fn posted(&self) -> usize {
        self.state().posted.len()
    }

    /// Buffers handed out and not yet re-posted.
    pub fn loaned(&self) -> usize {
        self.state().loaned
    }

    /// Datagrams lost because nothing was posted.
    pub fn dropped(&self) -> u64 {
        self.state().dropped
    }

    fn deliver(&self, src: QueuePairAddress, data: &[u8]) -> SendOutcome {
        let mut state = self.state();
        let Some(mut buf) = state.posted.pop_front() else {
            state.dropped += 1;
            return SendOutcome::NoReceiveBuffer;
        };
        if GRH_SIZE + data.len() > buf.capacity() {
            state.posted.push_front(buf);
            return SendOutcome::TooLarge;
        }
        let storage = buf.storage_mut();
        storage[..GRH_SIZE].fill(0);
        storage[GRH_SIZE..GRH_SIZE + data.len()].copy_from_slice(data);
        buf.set_payload(GRH_SIZE, data.len());
        state.completions.push_back(Completion { buf, src });
        SendOutcome::Delivered
    }
}

impl std::fmt::Debug for QueuePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePair").field("addr", &self.addr).finish()
    }
}

struct FabricInner {
    device_count: u16,
    queue_pairs: Mutex<HashMap<QueuePairAddress, Arc<QueuePair>>>,
    next_qpn: AtomicU32,
    lost: AtomicU64,
}

/// A UD fabric shared by every driver attached to it.
///
/// Cloning yields another handle to the same fabric.
#[derive(Clone)]
pub struct UdFabric {
    inner: Arc<FabricInner>,
}

impl UdFabric {
    /// Create a fabric with `device_count` adapters. Adapter `i` has
    /// LID `i + 1`.
    pub fn new(device_count: u16) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                device_count,
                queue_pairs: Mutex::new(HashMap::new()),
                next_qpn: AtomicU32::new(FIRST_QPN),
                lost: AtomicU64::new(0),
            }),
        }
    }

    fn queue_pairs(&self) -> MutexGuard<'_, HashMap<QueuePairAddress, Arc<QueuePair>>> {
        self.inner
            .queue_pairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of adapters.
    pub fn device_count(&self) -> usize {
        usize::from(self.inner.device_count)
    }

    /// Create a queue pair on adapter `device`.
    pub fn create_queue_pair(&self, device: u16) -> DriverResult<Arc<QueuePair>> {
        if device >= self.inner.device_count {
            return Err(DriverError::NoDevice(format!(
                "RDMA device {device} (fabric has {})",
                self.inner.device_count
            )));
        }
        let addr = QueuePairAddress {
            lid: device + 1,
            qpn: self.inner.next_qpn.fetch_add(1, Ordering::Relaxed),
        };
        let qp = Arc::new(QueuePair {
            addr,
            state: Mutex::new(QpState::default()),
        });
        self.queue_pairs().insert(addr, Arc::clone(&qp));
        Ok(qp)
    }

    /// Detach a queue pair. Datagrams sent to it afterwards are lost.
    pub fn destroy_queue_pair(&self, addr: QueuePairAddress) {
        self.queue_pairs().remove(&addr);
    }

    /// Send one datagram from `src` to `dst`. The data is copied before
    /// this returns.
    pub fn post_send(&self, src: QueuePairAddress, dst: QueuePairAddress, data: &[u8]) -> SendOutcome {
        let target = self.queue_pairs().get(&dst).cloned();
        let outcome = match target {
            Some(qp) => qp.deliver(src, data),
            None => SendOutcome::UnknownDestination,
        };
        if outcome != SendOutcome::Delivered {
            self.inner.lost.fetch_add(1, Ordering::Relaxed);
        }
        outcome
    }

    /// Datagrams the fabric failed to deliver.
    pub fn lost_datagrams(&self) -> u64 {
        self.inner.lost.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for UdFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdFabric")
            .field("device_count", &self.inner.device_count)
            .field("lost", &self.lost_datagrams())
            .finish()
    }
}
