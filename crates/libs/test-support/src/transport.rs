//! In-memory transports speaking the poll-style collaborator interface.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use canopy_mesh::{Transport, TransportEvent, TransportFactory};

type Inbox = Arc<Mutex<VecDeque<TransportEvent>>>;

/// One end of an in-memory duplex link. Writes surface as `Data` events in
/// the peer's inbox on its next poll.
pub struct LinkedTransport {
    inbox: Inbox,
    peer_inbox: Inbox,
    up: Arc<AtomicBool>,
    space: usize,
}

/// Test-side controls for one link endpoint: inject events, cut the link.
#[derive(Clone)]
pub struct LinkHandle {
    inbox: Inbox,
    up: Arc<AtomicBool>,
}

impl LinkHandle {
    pub fn inject(&self, event: TransportEvent) {
        self.inbox.lock().expect("link inbox").push_back(event);
    }

    /// Simulate the peer vanishing: the endpoint sees `Disconnected`.
    pub fn sever(&self) {
        self.up.store(false, Ordering::SeqCst);
        self.inject(TransportEvent::Disconnected);
    }
}

/// A connected pair of endpoints plus their control handles.
pub fn linked_pair() -> (LinkedTransport, LinkedTransport, LinkHandle, LinkHandle) {
    let a_inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
    let b_inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
    let a_up = Arc::new(AtomicBool::new(true));
    let b_up = Arc::new(AtomicBool::new(true));

    let a = LinkedTransport {
        inbox: Arc::clone(&a_inbox),
        peer_inbox: Arc::clone(&b_inbox),
        up: Arc::clone(&a_up),
        space: usize::MAX,
    };
    let b = LinkedTransport {
        inbox: Arc::clone(&b_inbox),
        peer_inbox: Arc::clone(&a_inbox),
        up: Arc::clone(&b_up),
        space: usize::MAX,
    };
    let a_handle = LinkHandle { inbox: a_inbox, up: a_up };
    let b_handle = LinkHandle { inbox: b_inbox, up: b_up };
    (a, b, a_handle, b_handle)
}

impl LinkedTransport {
    /// Restrict write capacity to exercise partial frame serves.
    pub fn with_space(mut self, space: usize) -> Self {
        self.space = space;
        self
    }
}

impl Transport for LinkedTransport {
    fn poll(&mut self) -> Vec<TransportEvent> {
        self.inbox.lock().expect("link inbox").drain(..).collect()
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        if !self.connected() {
            return 0;
        }
        self.peer_inbox
            .lock()
            .expect("peer inbox")
            .push_back(TransportEvent::Data(bytes.to_vec()));
        bytes.len()
    }

    fn flush(&mut self) {}

    fn space(&self) -> usize {
        self.space
    }

    fn can_send(&self) -> bool {
        self.connected()
    }

    fn connected(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        if self.up.swap(false, Ordering::SeqCst) {
            self.peer_inbox
                .lock()
                .expect("peer inbox")
                .push_back(TransportEvent::Disconnected);
        }
    }

    fn abort(&mut self) {
        self.up.store(false, Ordering::SeqCst);
    }

    fn freeable(&self) -> bool {
        true
    }
}

/// Factory handing out pre-staged transports in order; connect attempts
/// beyond the staged set yield endpoints that fail immediately.
#[derive(Clone, Default)]
pub struct QueueConnector {
    staged: Arc<Mutex<VecDeque<Box<dyn Transport>>>>,
    attempts: Arc<Mutex<Vec<[u8; 4]>>>,
}

impl QueueConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, transport: Box<dyn Transport>) {
        self.staged.lock().expect("staged transports").push_back(transport);
    }

    /// Target addresses of every connect attempt so far.
    pub fn attempts(&self) -> Vec<[u8; 4]> {
        self.attempts.lock().expect("connect attempts").clone()
    }
}

impl TransportFactory for QueueConnector {
    fn connect(&mut self, ip: [u8; 4], _port: u16) -> Box<dyn Transport> {
        self.attempts.lock().expect("connect attempts").push(ip);
        self.staged
            .lock()
            .expect("staged transports")
            .pop_front()
            .unwrap_or_else(|| Box::new(FailingTransport::default()))
    }
}

/// A connect attempt that errors on first poll.
#[derive(Default)]
pub struct FailingTransport {
    reported: bool,
}

impl Transport for FailingTransport {
    fn poll(&mut self) -> Vec<TransportEvent> {
        if self.reported {
            Vec::new()
        } else {
            self.reported = true;
            vec![TransportEvent::Error(-13)]
        }
    }

    fn write(&mut self, _bytes: &[u8]) -> usize {
        0
    }

    fn flush(&mut self) {}

    fn space(&self) -> usize {
        0
    }

    fn can_send(&self) -> bool {
        false
    }

    fn connected(&self) -> bool {
        false
    }

    fn close(&mut self) {}

    fn abort(&mut self) {}

    fn freeable(&self) -> bool {
        true
    }
}
