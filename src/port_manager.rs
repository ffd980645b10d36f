use super::Result;
use crate::error::HarnessError;
use eyre::eyre;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Pause between attempts when every free port turned out to be bound by
/// something outside the harness.
const PROBE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Configuration for the port pool
#[derive(Debug, Clone)]
pub struct PortPoolConfig {
    /// First port in the pool
    pub start: u16,
    /// Number of consecutive ports in the pool
    pub count: u16,
    /// Address used when probing whether a port is really free
    pub bind_address: IpAddr,
    /// How long `next()` may wait for a port before giving up
    pub acquire_timeout: Duration,
    /// Whether to probe-bind ports before handing them out
    pub probe: bool,
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self {
            start: 8000,
            count: 64,
            bind_address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            acquire_timeout: Duration::from_secs(30),
            probe: true,
        }
    }
}

/// Hands out ports to concurrently running scenarios.
///
/// Every port lives either in the free queue or inside exactly one
/// [`PortLease`]. The semaphore has one permit per queued port, so a caller
/// holding a permit is guaranteed to find a port in the queue.
pub struct PortManager {
    config: PortPoolConfig,
    free: Arc<Mutex<VecDeque<u16>>>,
    permits: Arc<Semaphore>,
}

impl PortManager {
    /// Creates a new port pool
    ///
    /// # Arguments
    /// * `config` - Range and wait policy for the pool
    ///
    /// # Returns
    /// * `Result<Self>` - The pool, or a configuration error for an empty or
    ///   overflowing range
    pub fn new(config: PortPoolConfig) -> Result<Self> {
        if config.count == 0 {
            return Err(HarnessError::config("port pool must contain at least one port").into());
        }
        let end = u32::from(config.start) + u32::from(config.count);
        if config.start == 0 || end > u32::from(u16::MAX) + 1 {
            return Err(HarnessError::config(format!(
                "port range {}..{} is outside 1..=65535",
                config.start, end
            ))
            .into());
        }

        let ports: VecDeque<u16> = (config.start..=(end - 1) as u16).collect();
        info!("Port pool {}..{} ({} ports)", config.start, end, ports.len());

        Ok(Self {
            permits: Arc::new(Semaphore::new(ports.len())),
            free: Arc::new(Mutex::new(ports)),
            config,
        })
    }

    /// Leases the next free port
    ///
    /// Waits up to `acquire_timeout` for a port to be returned by another
    /// scenario.
    ///
    /// # Returns
    /// * `Result<PortLease>` - The lease, or `HarnessError::Exhausted`
    pub async fn next(&self) -> Result<PortLease> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let permit = match timeout(remaining, self.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(eyre!("port pool semaphore closed")),
                Err(_) => return Err(self.exhausted()),
            };

            if let Some(port) = self.take_free_port() {
                debug!("Leased port {}", port);
                return Ok(PortLease {
                    port,
                    free: self.free.clone(),
                    _permit: permit,
                });
            }

            // Every queued port is held by a foreign process right now.
            drop(permit);
            if Instant::now() >= deadline {
                return Err(self.exhausted());
            }
            sleep(PROBE_RETRY_DELAY).await;
        }
    }

    /// Number of ports currently in the pool, leased or not
    pub fn pool_size(&self) -> usize {
        usize::from(self.config.count)
    }

    /// Number of ports not currently leased
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Pops the first queued port that can actually be bound, rotating busy
    /// ones to the back.
    fn take_free_port(&self) -> Option<u16> {
        let mut free = lock(&self.free);
        for _ in 0..free.len() {
            let port = free.pop_front()?;
            if !self.config.probe || is_bindable(self.config.bind_address, port) {
                return Some(port);
            }
            warn!("Port {} is in use outside the harness, skipping", port);
            free.push_back(port);
        }
        None
    }

    fn exhausted(&self) -> eyre::Report {
        HarnessError::Exhausted {
            waited: self.config.acquire_timeout,
            pool_size: self.pool_size(),
        }
        .into()
    }
}

/// A port held by one scenario. Dropping it returns the port to the pool.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    free: Arc<Mutex<VecDeque<u16>>>,
    _permit: OwnedSemaphorePermit,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        // The port goes back before the permit is released.
        lock(&self.free).push_back(self.port);
        debug!("Released port {}", self.port);
    }
}

fn lock(free: &Mutex<VecDeque<u16>>) -> MutexGuard<'_, VecDeque<u16>> {
    free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Checks whether a listening socket could be bound to the port
fn is_bindable(bind_address: IpAddr, port: u16) -> bool {
    let domain = match bind_address {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
        Ok(socket) => socket,
        Err(_) => return false,
    };
    // Ports left in TIME_WAIT by a previous scenario are fine to reuse.
    if socket.set_reuse_address(true).is_err() {
        return false;
    }
    socket.bind(&SocketAddr::new(bind_address, port).into()).is_ok()
}
