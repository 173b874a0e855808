use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Down,
    Up { local_ip: IpAddr },
}

impl LinkStatus {
    #[must_use]
    pub fn is_up(self) -> bool {
        matches!(self, Self::Up { .. })
    }
}

/// Network link as seen by the update engine.
#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Start maintaining the link. Calling it again while the link is being
    /// maintained is a no-op.
    fn up(&self);

    /// Poll until the link reports ready or `timeout` elapses.
    async fn wait_until_up(&self, timeout: Duration) -> bool;

    fn ip_address(&self) -> Option<String>;
}

/// Background link maintenance.
///
/// `up` spawns a task that periodically probes TCP reachability of the update
/// host and publishes the result on a watch channel; the boot sequence only
/// ever reads that channel.
pub struct LinkMonitor {
    probe_host: String,
    probe_port: u16,
    interval: Duration,
    status_tx: watch::Sender<LinkStatus>,
    status_rx: watch::Receiver<LinkStatus>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LinkMonitor {
    #[must_use]
    pub fn new(probe_host: impl Into<String>, probe_port: u16, interval: Duration) -> Self {
        let (status_tx, status_rx) = watch::channel(LinkStatus::Down);
        Self {
            probe_host: probe_host.into(),
            probe_port,
            interval,
            status_tx,
            status_rx,
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn status(&self) -> LinkStatus {
        *self.status_rx.borrow()
    }
}

async fn probe_once(host: &str, port: u16) -> LinkStatus {
    let connect = tokio::net::TcpStream::connect((host, port));
    match tokio::time::timeout(PROBE_CONNECT_TIMEOUT, connect).await {
        Ok(Ok(stream)) => match stream.local_addr() {
            Ok(addr) => LinkStatus::Up {
                local_ip: addr.ip(),
            },
            Err(error) => {
                debug!("Link probe connected but local address is unknown: {error}");
                LinkStatus::Down
            }
        },
        Ok(Err(error)) => {
            debug!("Link probe to {host}:{port} failed: {error}");
            LinkStatus::Down
        }
        Err(_) => {
            debug!("Link probe to {host}:{port} timed out");
            LinkStatus::Down
        }
    }
}

async fn maintain_link(
    host: String,
    port: u16,
    interval: Duration,
    status_tx: watch::Sender<LinkStatus>,
) {
    loop {
        let status = probe_once(&host, port).await;
        let changed = status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            match status {
                LinkStatus::Up { local_ip } => info!("Network link up, IP: {local_ip}"),
                LinkStatus::Down => warn!("Network link down"),
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[async_trait]
impl NetworkManager for LinkMonitor {
    fn up(&self) {
        let mut task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        info!(
            "Starting network link task (probe {}:{})",
            self.probe_host, self.probe_port
        );
        *task = Some(tokio::spawn(maintain_link(
            self.probe_host.clone(),
            self.probe_port,
            self.interval,
            self.status_tx.clone(),
        )));
    }

    async fn wait_until_up(&self, timeout: Duration) -> bool {
        info!("Waiting for network connection (timeout: {}s)", timeout.as_secs());
        self.up();

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.status().is_up() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Network connection timed out");
                return false;
            }
            tokio::time::sleep(READINESS_POLL_INTERVAL).await;
        }
    }

    fn ip_address(&self) -> Option<String> {
        match self.status() {
            LinkStatus::Up { local_ip } => Some(local_ip.to_string()),
            LinkStatus::Down => None,
        }
    }
}

impl Drop for LinkMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self
            .task
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
