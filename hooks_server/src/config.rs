//! Server configuration — command line flags with environment fallbacks.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "cyhooks", about = "Push-driven build hooks with a realtime dashboard")]
pub struct Cli {
    /// Server port
    #[arg(short, long, env = "HOOKS_PORT", default_value_t = 8081)]
    pub port: u16,

    /// Branch whose pushes trigger a build
    #[arg(long, env = "HOOKS_TARGET_BRANCH", default_value = "dev")]
    pub target_branch: String,

    /// Directory holding working copies and the snapshot
    #[arg(long, env = "HOOKS_WORKDIR", default_value = "cache")]
    pub workdir: PathBuf,

    /// Snapshot file (defaults to <workdir>/dump.json)
    #[arg(long, env = "HOOKS_SNAPSHOT_PATH")]
    pub snapshot_path: Option<PathBuf>,

    /// Shell command run inside the working copy after sync
    #[arg(long, env = "HOOKS_PROVISION_COMMAND", default_value = "./provision.sh")]
    pub provision_command: String,

    /// Timeout for a single sync or provision step, in seconds
    #[arg(long, env = "HOOKS_STEP_TIMEOUT", default_value_t = 600)]
    pub step_timeout_secs: u64,

    /// Directory served under /webhook/static
    #[arg(long, env = "HOOKS_STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    /// Slack team subdomain for build notifications
    #[arg(long, env = "SLACK_COMPANY")]
    pub slack_company: Option<String>,

    /// Slack incoming-webhook token
    #[arg(long, env = "SLACK_TOKEN", hide_env_values = true)]
    pub slack_token: Option<String>,

    /// Realtime messages buffered per subscriber before the oldest are dropped
    /// (rounded up to a power of two)
    #[arg(long, env = "HOOKS_QUEUE_CAPACITY", default_value_t = 256)]
    pub queue_capacity: usize,

    /// Interval between duration updates, in milliseconds
    #[arg(long, env = "HOOKS_TICK_INTERVAL_MS", default_value_t = 100)]
    pub tick_interval_ms: u64,

    /// Address for the Prometheus exporter; disabled when unset
    #[arg(long, env = "HOOKS_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Clone, Debug)]
pub struct SlackConfig {
    pub company: String,
    pub token: String,
}

#[derive(Clone, Debug)]
pub struct HookConfig {
    pub port: u16,
    pub target_branch: String,
    pub workdir: PathBuf,
    pub snapshot_path: PathBuf,
    pub provision_command: String,
    pub step_timeout: Duration,
    pub static_dir: PathBuf,
    /// Notifications are disabled when `None`.
    pub slack: Option<SlackConfig>,
    pub queue_capacity: usize,
    pub tick_interval: Duration,
    pub metrics_addr: Option<SocketAddr>,
}

impl HookConfig {
    pub fn from_cli(cli: Cli) -> Self {
        let snapshot_path = cli
            .snapshot_path
            .unwrap_or_else(|| cli.workdir.join("dump.json"));

        let slack = match (cli.slack_company, cli.slack_token) {
            (Some(company), Some(token)) if !company.is_empty() && !token.is_empty() => {
                Some(SlackConfig { company, token })
            }
            _ => {
                tracing::warn!("SLACK_COMPANY/SLACK_TOKEN not set -- build notifications disabled");
                None
            }
        };

        Self {
            port: cli.port,
            target_branch: cli.target_branch,
            workdir: cli.workdir,
            snapshot_path,
            provision_command: cli.provision_command,
            step_timeout: Duration::from_secs(cli.step_timeout_secs),
            static_dir: cli.static_dir,
            slack,
            // the broadcast ring only comes in powers of two
            queue_capacity: cli.queue_capacity.max(1).next_power_of_two(),
            tick_interval: Duration::from_millis(cli.tick_interval_ms.max(1)),
            metrics_addr: cli.metrics_addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["cyhooks"]);
        let config = HookConfig::from_cli(cli);
        assert_eq!(config.port, 8081);
        assert_eq!(config.target_branch, "dev");
        assert_eq!(config.snapshot_path, PathBuf::from("cache/dump.json"));
        assert_eq!(config.tick_interval, Duration::from_millis(100));
        assert_eq!(config.queue_capacity, 256);
    }

    #[test]
    fn slack_needs_company_and_token() {
        let only_company = Cli::parse_from(["cyhooks", "--slack-company", "cydev"]);
        assert!(HookConfig::from_cli(only_company).slack.is_none());

        let both = Cli::parse_from([
            "cyhooks",
            "--slack-company",
            "cydev",
            "--slack-token",
            "t0k3n",
            "--snapshot-path",
            "/var/lib/hooks.json",
        ]);
        let config = HookConfig::from_cli(both);
        assert_eq!(config.slack.unwrap().company, "cydev");
        assert_eq!(config.snapshot_path, PathBuf::from("/var/lib/hooks.json"));
    }

    #[test]
    fn queue_capacity_is_rounded_up_to_what_is_buffered() {
        let cli = Cli::parse_from(["cyhooks", "--queue-capacity", "100"]);
        assert_eq!(HookConfig::from_cli(cli).queue_capacity, 128);

        let cli = Cli::parse_from(["cyhooks", "--queue-capacity", "0"]);
        assert_eq!(HookConfig::from_cli(cli).queue_capacity, 1);
    }
}
