//! Reverse tunnels to devices through the `balena` CLI.
//!
//! A [`Tunnel`] owns the `balena device tunnel` child process. Closing or
//! dropping it kills and reaps the process, including when the code using
//! the tunnel panics.

use crate::error::{CacheError, Result};
use std::ffi::OsString;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_PROGRAM: &str = "balena";
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for opening a [`Tunnel`].
#[derive(Debug, Clone)]
pub struct TunnelBuilder {
    program: OsString,
    ready_timeout: Duration,
    poll_interval: Duration,
    local_port: Option<u16>,
}

impl Default for TunnelBuilder {
    fn default() -> Self {
        TunnelBuilder {
            program: OsString::from(DEFAULT_PROGRAM),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: Duration::from_millis(100),
            local_port: None,
        }
    }
}

impl TunnelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path or name of the balena CLI.
    pub fn program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    /// How long to wait for the local port to accept connections.
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Use a fixed local port instead of picking a free one.
    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn open(&self, device: &str, remote_port: u16) -> Result<Tunnel> {
        let local_port = match self.local_port {
            Some(port) => port,
            None => free_local_port()?,
        };

        log::info!("Opening tunnel to {device}:{remote_port} on 127.0.0.1:{local_port}");
        let child = Command::new(&self.program)
            .arg("device")
            .arg("tunnel")
            .arg(device)
            .arg("-p")
            .arg(format!("{remote_port}:{local_port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                CacheError::Tunnel(format!(
                    "cannot start {}: {e}",
                    self.program.to_string_lossy()
                ))
            })?;

        let mut tunnel = Tunnel {
            device: device.to_string(),
            remote_port,
            local_port,
            child: Some(child),
        };
        // On error the tunnel is dropped here, which kills the child
        tunnel.wait_ready(self.ready_timeout, self.poll_interval)?;
        log::debug!("Tunnel to {device} ready on port {local_port}");
        Ok(tunnel)
    }
}

/// A running tunnel from a local port to a port on a device.
#[derive(Debug)]
pub struct Tunnel {
    device: String,
    remote_port: u16,
    local_port: u16,
    child: Option<Child>,
}

impl Tunnel {
    /// Open a tunnel with default options.
    pub fn open(device: &str, remote_port: u16) -> Result<Tunnel> {
        TunnelBuilder::new().open(device, remote_port)
    }

    pub fn builder() -> TunnelBuilder {
        TunnelBuilder::new()
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_port))
    }

    /// Whether the tunnel process is still alive.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stop the tunnel process and wait for it to exit.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn wait_ready(&mut self, timeout: Duration, poll_interval: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let addr = self.local_addr();
        loop {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait()? {
                    self.child = None;
                    return Err(CacheError::Tunnel(format!(
                        "tunnel to {} exited with {status} before port {} opened",
                        self.device, self.local_port
                    )));
                }
            }

            let attempt = poll_interval.max(Duration::from_millis(10));
            if TcpStream::connect_timeout(&addr, attempt).is_ok() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(CacheError::Tunnel(format!(
                    "tunnel to {} not ready on port {} after {:.1}s",
                    self.device,
                    self.local_port,
                    timeout.as_secs_f64()
                )));
            }
            thread::sleep(poll_interval);
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_none() {
            if let Err(e) = child.kill() {
                // Exited between the check and the kill
                if e.kind() != std::io::ErrorKind::InvalidInput {
                    return Err(CacheError::Tunnel(format!(
                        "cannot stop tunnel to {}: {e}",
                        self.device
                    )));
                }
            }
            child.wait()?;
        }
        log::debug!("Closed tunnel to {}", self.device);
        Ok(())
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("Failed to close tunnel to {}: {e}", self.device);
        }
    }
}

/// Run `f` with an open tunnel, closing it afterwards.
pub fn with_tunnel<T>(device: &str, remote_port: u16, f: impl FnOnce(&Tunnel) -> T) -> Result<T> {
    with_tunnel_using(&TunnelBuilder::new(), device, remote_port, f)
}

pub fn with_tunnel_using<T>(
    builder: &TunnelBuilder,
    device: &str,
    remote_port: u16,
    f: impl FnOnce(&Tunnel) -> T,
) -> Result<T> {
    let tunnel = builder.open(device, remote_port)?;
    let result = f(&tunnel);
    tunnel.close()?;
    Ok(result)
}

/// Ask the OS for a currently unused local port.
pub fn free_local_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| CacheError::Tunnel(format!("cannot find a free local port: {e}")))?;
    Ok(listener.local_addr()?.port())
}
