//! Build event — one push-triggered build attempt and its lifecycle.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle states of a build event.
///
/// The legal paths are
/// `Starting → Filtering → {Skipped | Syncing → Provisioning → {Succeeded, Failed}}`,
/// with `Failed` also reachable directly from `Syncing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStatus {
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "filtering")]
    Filtering,
    #[serde(rename = "updating")]
    Syncing,
    #[serde(rename = "provisioning")]
    Provisioning,
    #[serde(rename = "ok")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "skipped")]
    Skipped,
}

impl BuildStatus {
    /// Name used on the wire and in the dashboard.
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Starting => "starting",
            BuildStatus::Filtering => "filtering",
            BuildStatus::Syncing => "updating",
            BuildStatus::Provisioning => "provisioning",
            BuildStatus::Succeeded => "ok",
            BuildStatus::Failed => "failed",
            BuildStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Skipped
        )
    }

    /// Outcome carried by a terminal status. `None` while still running.
    pub fn outcome(self) -> Option<bool> {
        match self {
            BuildStatus::Succeeded | BuildStatus::Skipped => Some(true),
            BuildStatus::Failed => Some(false),
            _ => None,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        matches!(
            (self, next),
            (Starting, Filtering)
                | (Filtering, Skipped)
                | (Filtering, Syncing)
                | (Syncing, Provisioning)
                | (Syncing, Failed)
                | (Provisioning, Succeeded)
                | (Provisioning, Failed)
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEvent {
    pub id: u64,
    pub repository: String,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub output: Vec<String>,
    pub succeeded: bool,
}

impl BuildEvent {
    pub fn new(id: u64, repository: impl Into<String>) -> Self {
        Self {
            id,
            repository: repository.into(),
            status: BuildStatus::Starting,
            started_at: Utc::now(),
            stopped_at: None,
            output: Vec::new(),
            succeeded: false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped_at.is_some()
    }

    /// Elapsed build time, truncated to 100ms. Measured against now while running.
    pub fn duration(&self) -> Duration {
        let end = self.stopped_at.unwrap_or_else(Utc::now);
        let millis = (end - self.started_at).num_milliseconds().max(0) as u64;
        Duration::from_millis(millis / 100 * 100)
    }

    /// Start time as shown in notifications.
    pub fn date(&self) -> String {
        self.started_at.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    pub fn output_text(&self) -> String {
        self.output.concat()
    }
}

/// Render a duration the way the dashboard shows it: `300ms`, `4.2s`, `2m5.1s`.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        return format!("{millis}ms");
    }
    let minutes = millis / 60_000;
    let rest = millis % 60_000;
    let seconds = format!("{}.{}s", rest / 1000, (rest % 1000) / 100);
    if minutes == 0 {
        seconds
    } else {
        format!("{minutes}m{seconds}")
    }
}
