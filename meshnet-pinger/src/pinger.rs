use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use surge_ping::{Client, Config, PingIdentifier, PingSequence};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::stats::RttStats;
use crate::{Error, Result};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_CONSECUTIVE_LOSS: u32 = 5;
// Samples kept for statistics before the buffer restarts.
const RTT_BUFFER_CAPACITY: usize = 1000;
const PAYLOAD_SIZE: usize = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Connected,
    Error,
}

/// Formatted round-trip statistics taken from one consistent snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RttInfo {
    pub last: String,
    pub min: String,
    pub average: String,
    pub max: String,
    pub std_dev: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyInfo {
    pub connection_status: ConnectionStatus,
    pub connection_error: String,
    pub rtt: RttInfo,
}

#[derive(Debug, Clone)]
pub struct PingerConfig {
    pub target: IpAddr,
    pub interval: Duration,
    pub max_consecutive_loss: u32,
}

impl PingerConfig {
    pub fn new(target: IpAddr) -> Self {
        Self {
            target,
            interval: DEFAULT_INTERVAL,
            max_consecutive_loss: DEFAULT_MAX_CONSECUTIVE_LOSS,
        }
    }
}

/// Continuously probes one target with ICMP echo requests. The probe loop
/// runs on its own task owning the socket; readers take a locked snapshot,
/// so `latency_info` is safe to call concurrently with the loop.
pub struct Pinger {
    target: IpAddr,
    interval: Duration,
    max_consecutive_loss: u32,
    state: Arc<Mutex<ProbeState>>,
    task: Mutex<Option<CancellationToken>>,
}

struct ProbeState {
    status: ConnectionStatus,
    failure_msg: String,
    stats: RttStats,
    packets_sent: u32,
    packets_received: u32,
}

impl ProbeState {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::default(),
            failure_msg: String::new(),
            stats: RttStats::new(RTT_BUFFER_CAPACITY),
            packets_sent: 0,
            packets_received: 0,
        }
    }

    // Outstanding sends beyond the limit mean the connection is gone.
    fn loss_exceeded(&self, limit: u32) -> bool {
        self.packets_sent - self.packets_received > limit
    }

    /// Resets the counters so loss detection resumes from a clean baseline,
    /// giving "N consecutive misses" semantics rather than a loss ratio.
    fn record_success(&mut self, rtt: Duration) {
        self.status = ConnectionStatus::Connected;
        self.failure_msg.clear();
        self.stats.update(rtt.as_nanos() as u64);
        self.packets_sent = 0;
        self.packets_received = 0;
    }
}

impl Pinger {
    pub fn new(config: PingerConfig) -> Self {
        Self {
            target: config.target,
            interval: config.interval,
            max_consecutive_loss: config.max_consecutive_loss,
            state: Arc::new(Mutex::new(ProbeState::new())),
            task: Mutex::new(None),
        }
    }

    pub fn target(&self) -> IpAddr {
        self.target
    }

    /// Spawns the probe loop. Idempotent while a loop is running; after
    /// `stop` a new loop may be started.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap();
        if let Some(cancel) = task.as_ref()
            && !cancel.is_cancelled()
        {
            return;
        }

        info!("starting pinger for {}", self.target);

        {
            let mut state = self.state.lock().unwrap();
            state.packets_sent = 0;
            state.packets_received = 0;
        }

        let cancel = CancellationToken::new();
        tokio::spawn(run(
            self.target,
            self.interval,
            self.max_consecutive_loss,
            Arc::clone(&self.state),
            cancel.clone(),
        ));
        *task = Some(cancel);
    }

    /// Signals the probe loop to terminate at the next send boundary.
    /// Idempotent.
    pub fn stop(&self) {
        let task = self.task.lock().unwrap();
        if let Some(cancel) = task.as_ref() {
            cancel.cancel();
        }
    }

    pub fn latency_info(&self) -> LatencyInfo {
        let state = self.state.lock().unwrap();
        LatencyInfo {
            connection_status: state.status,
            connection_error: state.failure_msg.clone(),
            rtt: RttInfo {
                last: format_nanos(state.stats.last),
                min: format_nanos(state.stats.min),
                average: format_nanos(state.stats.mean),
                max: format_nanos(state.stats.max),
                std_dev: format_nanos(state.stats.std_dev),
            },
        }
    }
}

fn format_nanos(nanos: u64) -> String {
    format!("{:?}", Duration::from_nanos(nanos))
}

fn new_client() -> Result<Client> {
    Client::new(&Config::default()).map_err(|e| Error::SocketCreation(e.to_string()))
}

fn loss_failure_message(target: IpAddr) -> String {
    format!("failed to successfully ping the remote endpoint IP {target}")
}

async fn run(
    target: IpAddr,
    interval: Duration,
    max_consecutive_loss: u32,
    state: Arc<Mutex<ProbeState>>,
    cancel: CancellationToken,
) {
    let client = match new_client() {
        Ok(client) => client,
        Err(e) => {
            error!("failed to create the icmp client for {}: {}", target, e);
            let mut state = state.lock().unwrap();
            state.status = ConnectionStatus::Unknown;
            state.failure_msg =
                format!("failed to create the pinger for the remote endpoint IP {target}: {e}");
            return;
        }
    };

    let mut pinger = client.pinger(target, PingIdentifier(std::process::id() as u16)).await;
    pinger.timeout(interval);

    let payload = [0u8; PAYLOAD_SIZE];
    let mut sequence: u16 = 0;
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("pinger for {} stopped", target);
                return;
            }
            _ = ticker.tick() => {}
        }

        {
            let mut state = state.lock().unwrap();
            if state.loss_exceeded(max_consecutive_loss) {
                error!("exceeded {} consecutive losses pinging {}", max_consecutive_loss, target);
                state.status = ConnectionStatus::Error;
                state.failure_msg = loss_failure_message(target);
                return;
            }
            state.packets_sent += 1;
        }

        match pinger.ping(PingSequence(sequence), &payload).await {
            Ok((_, rtt)) => {
                state.lock().unwrap().record_success(rtt);
            }
            Err(e) => {
                debug!("no reply from {}: {}", target, e);
            }
        }

        sequence = sequence.wrapping_add(1);
    }
}
