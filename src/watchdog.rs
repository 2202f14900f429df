//! Reachability watchdog
//!
//! Some link failures (an unplugged cable, a dead Wi-Fi access point) are
//! never noticed by the socket, which keeps claiming to be open. While a
//! connection is up, the watchdog probes the server host on a fixed interval
//! and clears a shared flag on an explicit negative answer. The client reads
//! the flag on every tick and forces the close itself.

use crate::error::{PostmanError, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use surge_ping::{Client, Config, PingIdentifier, PingSequence, SurgeError, ICMP};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A network-layer liveness check
#[async_trait]
pub trait Probe: Send + Sync {
    /// `Ok(true)` reachable, `Ok(false)` explicitly unreachable,
    /// `Err` inconclusive
    async fn probe(&self, host: &str) -> Result<bool>;
}

/// ICMP echo probe
///
/// Hostnames are resolved and the first IPv4 address is pinged. Opening the
/// ICMP socket may need privileges; failing to do so is inconclusive.
#[derive(Debug, Clone)]
pub struct IcmpProbe {
    timeout: Duration,
}

impl IcmpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn resolve(host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| PostmanError::Probe(format!("resolve {}: {}", host, e)))?;

        addrs
            .map(|addr| addr.ip())
            .find(IpAddr::is_ipv4)
            .ok_or_else(|| PostmanError::Probe(format!("no IPv4 address for {}", host)))
    }
}

#[async_trait]
impl Probe for IcmpProbe {
    async fn probe(&self, host: &str) -> Result<bool> {
        let addr = Self::resolve(host).await?;

        let config = match addr {
            IpAddr::V4(_) => Config::default(),
            IpAddr::V6(_) => Config::builder().kind(ICMP::V6).build(),
        };
        let client = Client::new(&config)
            .map_err(|e| PostmanError::Probe(format!("icmp socket: {}", e)))?;

        let mut pinger = client.pinger(addr, PingIdentifier(rand::random())).await;
        pinger.timeout(self.timeout);

        match pinger.ping(PingSequence(0), &[0; 32]).await {
            Ok((_packet, rtt)) => {
                debug!(host = %host, rtt = ?rtt, "Probe answered");
                Ok(true)
            }
            Err(SurgeError::Timeout { .. }) => Ok(false),
            Err(e) => Err(PostmanError::Probe(e.to_string())),
        }
    }
}

/// Probing task bound to one connection
///
/// Cancelled on [`Watchdog::cancel`] or when dropped.
#[derive(Debug)]
pub struct Watchdog {
    cancel: CancellationToken,
    reachable: Arc<AtomicBool>,
}

impl Watchdog {
    pub fn spawn(
        runtime: &Handle,
        probe: Arc<dyn Probe>,
        host: String,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let reachable = Arc::new(AtomicBool::new(true));

        runtime.spawn(run_probes(
            probe,
            host,
            interval,
            reachable.clone(),
            cancel.clone(),
        ));

        Self { cancel, reachable }
    }

    /// False once a probe got an explicit negative answer
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_probes(
    probe: Arc<dyn Probe>,
    host: String,
    interval: Duration,
    reachable: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    debug!(host = %host, interval = ?interval, "Watchdog started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = probe.probe(&host) => outcome,
        };

        match outcome {
            Ok(true) => {}
            Ok(false) => {
                warn!(host = %host, "Server not reachable");
                reachable.store(false, Ordering::SeqCst);
                break;
            }
            Err(e) => debug!(host = %host, error = %e, "Probe inconclusive"),
        }
    }

    debug!(host = %host, "Watchdog stopped");
}


#[cfg(test)]
mod tests {
    use super::mock::ScriptedProbe;
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(3000);

    async fn advance(by: Duration) {
        tokio::time::sleep(by).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_answer_clears_flag() {
        let probe = Arc::new(ScriptedProbe::new([Some(true), Some(false)]));
        let watchdog = Watchdog::spawn(&Handle::current(), probe.clone(), "h".into(), INTERVAL);

        advance(INTERVAL + Duration::from_millis(1)).await;
        assert_eq!(probe.calls(), 1);
        assert!(watchdog.is_reachable());

        advance(INTERVAL).await;
        assert_eq!(probe.calls(), 2);
        assert!(!watchdog.is_reachable());

        // The task stops probing once the link is declared dead
        advance(INTERVAL * 3).await;
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_is_inconclusive() {
        let probe = Arc::new(ScriptedProbe::new([None, None, None]));
        let watchdog = Watchdog::spawn(&Handle::current(), probe.clone(), "h".into(), INTERVAL);

        advance(INTERVAL * 3 + Duration::from_millis(1)).await;
        assert_eq!(probe.calls(), 3);
        assert!(watchdog.is_reachable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_probing() {
        let probe = Arc::new(ScriptedProbe::new([]));
        let watchdog = Watchdog::spawn(&Handle::current(), probe.clone(), "h".into(), INTERVAL);

        advance(INTERVAL + Duration::from_millis(1)).await;
        assert_eq!(probe.calls(), 1);

        watchdog.cancel();
        assert!(watchdog.is_cancelled());
        advance(INTERVAL * 5).await;
        assert_eq!(probe.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_probing() {
        let probe = Arc::new(ScriptedProbe::new([]));
        let watchdog = Watchdog::spawn(&Handle::current(), probe.clone(), "h".into(), INTERVAL);
        drop(watchdog);

        advance(INTERVAL * 5).await;
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_resolve_ip_literals_without_lookup() {
        let v4 = IcmpProbe::resolve("192.0.2.7").await.unwrap();
        assert_eq!(v4, "192.0.2.7".parse::<IpAddr>().unwrap());

        let v6 = IcmpProbe::resolve("::1").await.unwrap();
        assert!(v6.is_ipv6());
    }
}
