//! TCP transport over tokio.
//!
//! Each transport owns one background task that runs the socket: it
//! connects (station side), reads into `TransportEvent::Data`, and applies
//! write/flush/close commands. Completions cross to the synchronous core
//! over a std channel drained by `poll()`; commands cross back over an
//! unbounded tokio channel, so no call here ever blocks the mesh loop.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use canopy_mesh::{Transport, TransportEvent, TransportFactory};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// Soft cap on bytes queued toward the socket; `space()` reports what is
/// left under it.
const WRITE_WINDOW: usize = 16 * 1024;

const READ_CHUNK: usize = 2 * 1024;

enum Command {
    Write(Vec<u8>),
    Flush,
    Close,
}

struct Shared {
    connected: AtomicBool,
    finished: AtomicBool,
    queued: AtomicUsize,
}

pub struct TcpTransport {
    events: mpsc::Receiver<TransportEvent>,
    commands: UnboundedSender<Command>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl TcpTransport {
    /// Station side: begin an async connect toward `addr`.
    pub fn connect(handle: &Handle, addr: SocketAddr) -> Self {
        Self::spawn(handle, None, Some(addr))
    }

    /// AP side: adopt an already accepted stream.
    pub fn from_stream(handle: &Handle, stream: TcpStream) -> Self {
        Self::spawn(handle, Some(stream), None)
    }

    fn spawn(handle: &Handle, stream: Option<TcpStream>, addr: Option<SocketAddr>) -> Self {
        let (event_tx, event_rx) = mpsc::channel();
        let (command_tx, command_rx) = unbounded_channel();
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(stream.is_some()),
            finished: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();

        let task_shared = Arc::clone(&shared);
        let task_cancel = cancel.clone();
        handle.spawn(async move {
            run_socket(stream, addr, event_tx, command_rx, task_shared.clone(), task_cancel).await;
            task_shared.connected.store(false, Ordering::SeqCst);
            task_shared.finished.store(true, Ordering::SeqCst);
        });

        Self { events: event_rx, commands: command_tx, shared, cancel }
    }
}

async fn run_socket(
    stream: Option<TcpStream>,
    addr: Option<SocketAddr>,
    events: mpsc::Sender<TransportEvent>,
    mut commands: UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut stream = match stream {
        Some(stream) => stream,
        None => {
            let Some(addr) = addr else {
                return;
            };
            let connect = tokio::select! {
                _ = cancel.cancelled() => return,
                result = TcpStream::connect(addr) => result,
            };
            match connect {
                Ok(stream) => {
                    shared.connected.store(true, Ordering::SeqCst);
                    let _ = events.send(TransportEvent::Connected);
                    stream
                }
                Err(err) => {
                    log::debug!("tcp: connect {addr} failed: {err}");
                    let _ = events.send(TransportEvent::Error(
                        err.raw_os_error().unwrap_or(-1),
                    ));
                    return;
                }
            }
        }
    };

    let mut read_buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = stream.shutdown().await;
                return;
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Write(bytes)) => {
                        let len = bytes.len();
                        let result = stream.write_all(&bytes).await;
                        shared.queued.fetch_sub(len, Ordering::SeqCst);
                        match result {
                            Ok(()) => {
                                let _ = events.send(TransportEvent::Sent(len));
                            }
                            Err(err) => {
                                log::debug!("tcp: write failed: {err}");
                                let _ = events.send(TransportEvent::Error(
                                    err.raw_os_error().unwrap_or(-1),
                                ));
                                return;
                            }
                        }
                    }
                    Some(Command::Flush) => {
                        let _ = stream.flush().await;
                    }
                    Some(Command::Close) | None => {
                        let _ = stream.shutdown().await;
                        let _ = events.send(TransportEvent::Disconnected);
                        return;
                    }
                }
            }
            read = stream.read(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        let _ = events.send(TransportEvent::Disconnected);
                        return;
                    }
                    Ok(n) => {
                        let _ = events.send(TransportEvent::Data(read_buf[..n].to_vec()));
                    }
                    Err(err) => {
                        log::debug!("tcp: read failed: {err}");
                        let _ = events.send(TransportEvent::Error(
                            err.raw_os_error().unwrap_or(-1),
                        ));
                        return;
                    }
                }
            }
        }
    }
}

impl Transport for TcpTransport {
    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        if !self.connected() || bytes.is_empty() {
            return 0;
        }
        let granted = bytes.len().min(self.space());
        if granted == 0 {
            return 0;
        }
        self.shared.queued.fetch_add(granted, Ordering::SeqCst);
        if self.commands.send(Command::Write(bytes[..granted].to_vec())).is_err() {
            self.shared.queued.fetch_sub(granted, Ordering::SeqCst);
            return 0;
        }
        granted
    }

    fn flush(&mut self) {
        let _ = self.commands.send(Command::Flush);
    }

    fn space(&self) -> usize {
        WRITE_WINDOW.saturating_sub(self.shared.queued.load(Ordering::SeqCst))
    }

    fn can_send(&self) -> bool {
        self.connected() && self.space() > 0
    }

    fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        let _ = self.commands.send(Command::Close);
    }

    fn abort(&mut self) {
        self.cancel.cancel();
    }

    fn freeable(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Factory the mesh uses to dial peer APs.
pub struct TcpConnector {
    handle: Handle,
}

impl TcpConnector {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl TransportFactory for TcpConnector {
    fn connect(&mut self, ip: [u8; 4], port: u16) -> Box<dyn Transport> {
        let addr = SocketAddr::from((ip, port));
        Box::new(TcpTransport::connect(&self.handle, addr))
    }
}

/// AP-side listener: accepted sockets surface as ready transports for
/// `MeshCore::accept_connection`.
pub struct TcpAcceptor {
    accepted: mpsc::Receiver<TcpTransport>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl TcpAcceptor {
    pub fn bind(handle: &Handle, addr: SocketAddr) -> std::io::Result<Self> {
        let listener = {
            let _guard = handle.enter();
            let std_listener = std::net::TcpListener::bind(addr)?;
            std_listener.set_nonblocking(true)?;
            TcpListener::from_std(std_listener)?
        };
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel();
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        let task_handle = handle.clone();
        handle.spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                log::debug!("tcp: accepted {peer}");
                                let transport = TcpTransport::from_stream(&task_handle, stream);
                                if tx.send(transport).is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                log::warn!("tcp: accept failed: {err}");
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { accepted: rx, local_addr, cancel })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next accepted transport, if one is waiting.
    pub fn try_accept(&mut self) -> Option<TcpTransport> {
        self.accepted.try_recv().ok()
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for<F: FnMut() -> bool>(mut ready: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !ready() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn loopback_roundtrip() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let handle = runtime.handle().clone();

        let mut acceptor =
            TcpAcceptor::bind(&handle, "127.0.0.1:0".parse().expect("addr")).expect("bind");
        let mut station = TcpTransport::connect(&handle, acceptor.local_addr());

        let mut events = Vec::new();
        wait_for(|| {
            events.extend(station.poll());
            events.iter().any(|e| *e == TransportEvent::Connected)
        });

        let mut ap = None;
        wait_for(|| {
            ap = acceptor.try_accept();
            ap.is_some()
        });
        let mut ap = ap.expect("accepted transport");
        assert!(ap.connected());

        let written = station.write(b"ping\0");
        assert_eq!(written, 5);
        station.flush();

        let mut received = Vec::new();
        wait_for(|| {
            for event in ap.poll() {
                if let TransportEvent::Data(bytes) = event {
                    received.extend_from_slice(&bytes);
                }
            }
            received.ends_with(b"ping\0")
        });

        station.close();
        wait_for(|| {
            ap.poll().iter().any(|e| *e == TransportEvent::Disconnected) || !station.connected()
        });
    }

    #[test]
    fn connect_to_dead_port_reports_error() {
        let runtime = tokio::runtime::Runtime::new().expect("runtime");
        let handle = runtime.handle().clone();

        // Bind-then-drop to get a port nothing listens on.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
            probe.local_addr().expect("probe addr").port()
        };
        let mut transport =
            TcpTransport::connect(&handle, format!("127.0.0.1:{port}").parse().expect("addr"));

        let mut saw_error = false;
        wait_for(|| {
            saw_error = transport
                .poll()
                .iter()
                .any(|e| matches!(e, TransportEvent::Error(_)))
                || saw_error;
            saw_error
        });
        wait_for(|| transport.freeable());
    }
}
