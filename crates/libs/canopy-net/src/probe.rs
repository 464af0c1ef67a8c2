//! Internet health probe: one timed TCP connect per check.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use canopy_mesh::InternetProbe;
use tokio::net::TcpStream;
use tokio::runtime::Handle;

pub struct TcpProbe {
    handle: Handle,
    outcome: Option<mpsc::Receiver<Result<u32, String>>>,
}

impl TcpProbe {
    pub fn new(handle: Handle) -> Self {
        Self { handle, outcome: None }
    }
}

impl InternetProbe for TcpProbe {
    fn start(&mut self, host: &str, port: u16, timeout_ms: u32) {
        let (tx, rx) = mpsc::channel();
        self.outcome = Some(rx);
        let target = format!("{host}:{port}");
        self.handle.spawn(async move {
            let started = Instant::now();
            let attempt = tokio::time::timeout(
                Duration::from_millis(timeout_ms as u64),
                TcpStream::connect(&target),
            )
            .await;
            let result = match attempt {
                Ok(Ok(_stream)) => Ok(started.elapsed().as_millis() as u32),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err(format!("connect to {target} timed out")),
            };
            let _ = tx.send(result);
        });
    }

    fn poll(&mut self) -> Option<Result<u32, String>> {
        let outcome = self.outcome.as_ref()?.try_recv().ok()?;
        self.outcome = None;
        Some(outcome)
    }
}
