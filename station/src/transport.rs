//! transport.rs — serial link into the head of a chain
//!
//! Whole-packet framed I/O over a UART with no flow control: `send` writes
//! one encoded packet, `receive` blocks until exactly one packet's worth
//! of bytes or the deadline. The port's RTS line is the chain power pin,
//! so `power_on`/`power_off` open and close the port around driving it.
//!
//! serialport I/O is blocking; every port operation runs on the blocking
//! pool so dispatcher tasks never stall the runtime.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chain_types::{ChainLink, LinkError, Packet, PACKET_LEN};
use serialport::SerialPort;
use tracing::{debug, info};

type SharedPort = Arc<Mutex<Box<dyn SerialPort>>>;

pub struct SerialLink {
    path: String,
    baud: u32,
    settle: Duration,
    port: Option<SharedPort>,
}

impl SerialLink {
    pub fn new(path: &str, baud: u32, settle: Duration) -> Self {
        Self {
            path: path.to_string(),
            baud,
            settle,
            port: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn shared_port(&self) -> Result<SharedPort, LinkError> {
        self.port.clone().ok_or(LinkError::PoweredOff)
    }
}

fn lock(port: &SharedPort) -> Result<std::sync::MutexGuard<'_, Box<dyn SerialPort>>, LinkError> {
    port.lock()
        .map_err(|_| LinkError::Port("serial port mutex poisoned".to_string()))
}

async fn on_blocking<T, F>(job: F) -> Result<T, LinkError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, LinkError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| LinkError::Port(format!("serial worker: {e}")))?
}

#[async_trait::async_trait]
impl ChainLink for SerialLink {
    async fn send(&mut self, packet: &Packet) -> Result<(), LinkError> {
        let port = self.shared_port()?;
        let bytes = packet.encode()?;
        on_blocking(move || {
            let mut guard = lock(&port)?;
            guard.write_all(&bytes)?;
            guard.flush()?;
            Ok(())
        })
        .await
    }

    async fn receive(&mut self, deadline: Duration) -> Result<Packet, LinkError> {
        let port = self.shared_port()?;
        on_blocking(move || {
            let mut guard = lock(&port)?;
            let mut buf = [0u8; PACKET_LEN];
            let mut fill = 0usize;
            let deadline_at = Instant::now() + deadline;
            while fill < PACKET_LEN {
                let remaining = deadline_at.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    // Partial bytes are abandoned; the next receive starts
                    // from a clean buffer.
                    return Err(LinkError::TimedOut);
                }
                guard
                    .set_timeout(remaining)
                    .map_err(|e| LinkError::Port(e.to_string()))?;
                match guard.read(&mut buf[fill..]) {
                    Ok(0) => return Err(LinkError::TimedOut),
                    Ok(n) => fill += n,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::TimedOut
                            || e.kind() == std::io::ErrorKind::WouldBlock =>
                    {
                        return Err(LinkError::TimedOut)
                    }
                    Err(e) => return Err(LinkError::Io(e)),
                }
            }
            Ok(Packet::decode(&buf)?)
        })
        .await
    }

    async fn power_on(&mut self) -> Result<(), LinkError> {
        if self.port.is_some() {
            debug!("{} already powered", self.path);
            return Ok(());
        }
        let path = self.path.clone();
        let baud = self.baud;
        let port = on_blocking(move || {
            let mut port = serialport::new(&path, baud)
                .timeout(Duration::from_millis(500))
                .open()
                .map_err(|e| LinkError::Port(format!("open {path}: {e}")))?;
            port.write_request_to_send(true)
                .map_err(|e| LinkError::Port(format!("rts on {path}: {e}")))?;
            Ok(port)
        })
        .await?;
        info!("{} powered on at {} baud", self.path, self.baud);
        self.port = Some(Arc::new(Mutex::new(port)));
        Ok(())
    }

    async fn power_off(&mut self) -> Result<(), LinkError> {
        if let Some(port) = self.port.take() {
            on_blocking(move || {
                let mut guard = lock(&port)?;
                guard
                    .write_request_to_send(false)
                    .map_err(|e| LinkError::Port(format!("rts: {e}")))?;
                Ok(())
            })
            .await?;
            info!("{} powered off", self.path);
        }
        Ok(())
    }

    async fn power_cycle(&mut self) -> Result<(), LinkError> {
        self.power_off().await?;
        tokio::time::sleep(self.settle).await;
        self.power_on().await
    }

    fn is_powered(&self) -> bool {
        self.port.is_some()
    }
}
