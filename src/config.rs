//! Command-line and client configuration
//!
//! Every flag can also be set through the environment. Durations are given
//! in whole units so they stay readable in a Deployment manifest.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::info;

use crate::queue::BackoffConfig;
use crate::Error;

/// Kubernetes controller reconciling Foo resources into Deployments
#[derive(Parser, Debug, Clone)]
#[command(name = "sample-controller", version, about, long_about = None)]
pub struct Cli {
    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Address of the Kubernetes API server. Overrides any value in kubeconfig.
    #[arg(long, env = "SAMPLE_CONTROLLER_MASTER")]
    pub master: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "SAMPLE_CONTROLLER_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Seconds to wait for the informer caches before giving up
    #[arg(long, env = "SAMPLE_CONTROLLER_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 120)]
    pub cache_sync_timeout_secs: u64,

    /// Seconds between periodic resyncs of the caches; 0 disables resync
    #[arg(long, env = "SAMPLE_CONTROLLER_RESYNC_PERIOD_SECS", default_value_t = 30)]
    pub resync_period_secs: u64,

    /// Initial per-item retry delay in milliseconds
    #[arg(long, env = "SAMPLE_CONTROLLER_BASE_DELAY_MS", default_value_t = 5)]
    pub base_delay_ms: u64,

    /// Maximum per-item retry delay in seconds
    #[arg(long, env = "SAMPLE_CONTROLLER_MAX_DELAY_SECS", default_value_t = 1000)]
    pub max_delay_secs: u64,

    /// Overall retry rate across all items, per second
    #[arg(long, env = "SAMPLE_CONTROLLER_QPS", default_value_t = 50.0)]
    pub qps: f64,

    /// Retry burst allowed above the overall rate
    #[arg(long, env = "SAMPLE_CONTROLLER_BURST", default_value_t = 300)]
    pub burst: u32,

    /// Emit logs as JSON lines
    #[arg(long, env = "SAMPLE_CONTROLLER_LOG_JSON")]
    pub log_json: bool,

    /// Print the Foo CRD manifest and exit
    #[arg(long)]
    pub crd: bool,
}

/// Validated runtime settings for the controller
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Time allowed for the initial cache sync
    pub cache_sync_timeout: Duration,
    /// Periodic resync interval; zero disables resync
    pub resync_period: Duration,
    /// Retry back-off policy
    pub backoff: BackoffConfig,
}

impl Cli {
    /// Validate the flags into controller settings
    pub fn controller_config(&self) -> Result<ControllerConfig, Error> {
        if self.workers == 0 {
            return Err(Error::config("--workers must be at least 1"));
        }
        if !(self.qps.is_finite() && self.qps > 0.0) {
            return Err(Error::config("--qps must be a positive number"));
        }
        if self.burst == 0 {
            return Err(Error::config("--burst must be at least 1"));
        }
        let base_delay = Duration::from_millis(self.base_delay_ms);
        let max_delay = Duration::from_secs(self.max_delay_secs);
        if base_delay > max_delay {
            return Err(Error::config(
                "--base-delay-ms must not exceed --max-delay-secs",
            ));
        }

        Ok(ControllerConfig {
            workers: self.workers,
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            resync_period: Duration::from_secs(self.resync_period_secs),
            backoff: BackoffConfig {
                base_delay,
                max_delay,
                qps: self.qps,
                burst: self.burst,
            },
        })
    }

    /// Build an API client from `--kubeconfig` and `--master`
    ///
    /// Without a kubeconfig path the usual inference applies: `KUBECONFIG`,
    /// `~/.kube/config`, then the in-cluster service account.
    pub async fn client(&self) -> Result<Client, Error> {
        let mut config = match &self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::config(format!("failed to read kubeconfig {}: {e}", path.display()))
                })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::config(format!("invalid kubeconfig: {e}")))?
            }
            None => kube::Config::infer()
                .await
                .map_err(|e| Error::config(format!("failed to infer client config: {e}")))?,
        };

        if let Some(master) = &self.master {
            config.cluster_url = master
                .parse()
                .map_err(|e| Error::config(format!("invalid --master {master:?}: {e}")))?;
        }
        info!(cluster_url = %config.cluster_url, "connecting to API server");

        Ok(Client::try_from(config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("sample-controller").chain(args.iter().copied()))
            .expect("valid arguments")
    }

    #[test]
    fn defaults_match_backoff_defaults() {
        let config = parse(&[]).controller_config().unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.cache_sync_timeout, Duration::from_secs(120));
        assert_eq!(config.resync_period, Duration::from_secs(30));
        assert_eq!(config.backoff, BackoffConfig::default());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = parse(&[
            "--workers",
            "8",
            "--resync-period-secs",
            "0",
            "--base-delay-ms",
            "100",
            "--max-delay-secs",
            "60",
            "--qps",
            "10",
            "--burst",
            "20",
            "--master",
            "https://10.0.0.1:6443",
        ]);
        let config = cli.controller_config().unwrap();

        assert_eq!(cli.master.as_deref(), Some("https://10.0.0.1:6443"));
        assert_eq!(config.workers, 8);
        assert!(config.resync_period.is_zero());
        assert_eq!(config.backoff.base_delay, Duration::from_millis(100));
        assert_eq!(config.backoff.max_delay, Duration::from_secs(60));
        assert_eq!(config.backoff.qps, 10.0);
        assert_eq!(config.backoff.burst, 20);
    }

    #[test]
    fn crd_flag_parses() {
        assert!(parse(&["--crd"]).crd);
        assert!(!parse(&[]).crd);
    }

    #[test]
    fn zero_workers_rejected() {
        let err = parse(&["--workers", "0"]).controller_config().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn non_positive_qps_rejected() {
        assert!(parse(&["--qps", "0"]).controller_config().is_err());
    }

    #[test]
    fn base_delay_above_max_rejected() {
        let cli = parse(&["--base-delay-ms", "5000", "--max-delay-secs", "1"]);
        assert!(cli.controller_config().is_err());
    }

    #[test]
    fn unknown_flag_is_an_error() {
        assert!(Cli::try_parse_from(["sample-controller", "--bogus"]).is_err());
    }
}
