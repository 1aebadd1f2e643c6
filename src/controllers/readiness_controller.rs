use std::time::Duration;

use async_trait::async_trait;
use tokio::{net::TcpStream, time::Instant};

use crate::{error::ReadinessError, models::dependency_target::DependencyTarget};

/// How the gate paces its probes. `timeout: None` waits forever.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessPolicy {
    pub interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub timeout: Option<Duration>,
    /// Upper bound for a single connection attempt.
    pub connect_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        ReadinessPolicy {
            interval: Duration::from_millis(100),
            multiplier: 1.0,
            max_interval: Duration::from_secs(5),
            timeout: None,
            connect_timeout: Duration::from_millis(100),
        }
    }
}

impl ReadinessPolicy {
    /// Sleep after the `failures`-th failed probe (1-indexed).
    pub fn next_delay(&self, failures: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(failures.saturating_sub(1) as i32);
        let nanos = (self.interval.as_nanos() as f64 * factor).round();
        let delay = Duration::from_nanos(nanos.min(u64::MAX as f64) as u64);
        // a cap below the base interval would make the gate spin faster than asked
        delay.min(self.max_interval.max(self.interval))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessReport {
    pub attempts: u32,
    pub elapsed: Duration,
}

#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, target: &DependencyTarget) -> std::io::Result<()>;
}

/// Succeeds once the port accepts a connection; says nothing about the protocol behind it.
pub struct TcpProbe {
    pub connect_timeout: Duration,
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, target: &DependencyTarget) -> std::io::Result<()> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(target.address())).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            )),
        }
    }
}

/// Probes `target` until it succeeds, returning right after the first success.
pub async fn wait_until_ready(
    target: &DependencyTarget,
    probe: &dyn Probe,
    policy: &ReadinessPolicy,
) -> Result<ReadinessReport, ReadinessError> {
    let started = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match probe.probe(target).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                tracing::info!("{} is accepting connections after {} attempt(s)", target, attempts);
                return Ok(ReadinessReport { attempts, elapsed });
            }
            Err(err) => {
                tracing::debug!("waiting for {} (attempt {}): {}", target, attempts, err);
            }
        }
        let delay = policy.next_delay(attempts);
        if let Some(timeout) = policy.timeout {
            let elapsed = started.elapsed();
            if elapsed + delay > timeout {
                return Err(ReadinessError::Timeout {
                    target: target.clone(),
                    attempts,
                    elapsed,
                });
            }
        }
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::net::TcpListener;

    use super::*;

    /// Refuses the first `failures` probes.
    struct ScriptedProbe {
        failures: u32,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(failures: u32) -> Self {
            ScriptedProbe {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, _target: &DependencyTarget) -> std::io::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_after_first_success_without_further_probes() {
        for failures in [0, 1, 5] {
            let probe = ScriptedProbe::new(failures);
            let report = wait_until_ready(&DependencyTarget::new("db", 5432), &probe, &ReadinessPolicy::default())
                .await
                .unwrap();
            assert_eq!(report.attempts, failures + 1);
            assert_eq!(probe.calls.load(Ordering::SeqCst), failures + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn three_refusals_at_fixed_interval_take_three_hundred_millis() {
        let probe = ScriptedProbe::new(3);
        let report = wait_until_ready(&DependencyTarget::new("db", 5432), &probe, &ReadinessPolicy::default())
            .await
            .unwrap();
        assert_eq!(report.attempts, 4);
        assert!(report.elapsed >= Duration::from_millis(300));
        assert!(report.elapsed < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_with_a_timeout_error() {
        let probe = ScriptedProbe::new(u32::MAX);
        let policy = ReadinessPolicy {
            timeout: Some(Duration::from_millis(450)),
            ..Default::default()
        };
        let err = wait_until_ready(&DependencyTarget::new("db", 5432), &probe, &policy)
            .await
            .unwrap_err();
        match err {
            ReadinessError::Timeout { attempts, elapsed, .. } => {
                assert_eq!(attempts, 5);
                assert!(elapsed <= Duration::from_millis(450));
            }
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = ReadinessPolicy {
            interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_millis(500),
            ..Default::default()
        };
        assert_eq!(policy.next_delay(1), Duration::from_millis(100));
        assert_eq!(policy.next_delay(2), Duration::from_millis(200));
        assert_eq!(policy.next_delay(3), Duration::from_millis(400));
        assert_eq!(policy.next_delay(4), Duration::from_millis(500));
        assert_eq!(ReadinessPolicy::default().next_delay(10), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tcp_probe_sees_an_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe {
            connect_timeout: Duration::from_millis(500),
        };
        let report = wait_until_ready(&DependencyTarget::new("127.0.0.1", port), &probe, &ReadinessPolicy::default())
            .await
            .unwrap();
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn tcp_probe_times_out_on_a_closed_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let probe = TcpProbe {
            connect_timeout: Duration::from_millis(100),
        };
        let policy = ReadinessPolicy {
            timeout: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        let result = wait_until_ready(&DependencyTarget::new("127.0.0.1", port), &probe, &policy).await;
        assert!(matches!(result, Err(ReadinessError::Timeout { .. })));
    }
}
