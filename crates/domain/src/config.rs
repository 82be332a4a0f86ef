//! Runtime tunables the spec leaves as "implementation-chosen": round
//! caps, sliding-window parameters, the bus-wait bound, and persistence
//! paths. Shaped like the teacher's `sa_domain::config::Config` — a single
//! `#[serde(default)]`-heavy struct loaded from TOML, plus a `validate()`
//! that returns warnings/errors instead of panicking.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub context_window: ContextWindowConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            turn: TurnConfig::default(),
            scheduler: SchedulerConfig::default(),
            context_window: ContextWindowConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "d_runtime_dir")]
    pub runtime_dir: PathBuf,
}

fn d_runtime_dir() -> PathBuf {
    PathBuf::from("./runtime")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            runtime_dir: d_runtime_dir(),
        }
    }
}

impl StorageConfig {
    pub fn org_path(&self) -> PathBuf {
        self.runtime_dir.join("org.json")
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.runtime_dir.join("conversations")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TurnConfig {
    #[serde(default = "d_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Enable the heuristic "described a tool but didn't call it" retry
    /// (spec §9, Open Question #1). Disabled by default since it second-
    /// guesses the model's own judgement about whether to call a tool.
    #[serde(default)]
    pub retry_on_described_tool_call: bool,
}

fn d_max_tool_rounds() -> u32 {
    25
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: d_max_tool_rounds(),
            retry_on_described_tool_call: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound for `bus.waitForMessage` — spec §5 requires ≤ 100ms so
    /// delayed-delivery and idle-collapse run on a steady cadence.
    #[serde(default = "d_bus_wait_timeout_ms")]
    pub bus_wait_timeout_ms: u64,
    /// Short sleep when work exists elsewhere but nothing progressed this
    /// tick, to avoid a busy spin.
    #[serde(default = "d_yield_sleep_ms")]
    pub yield_sleep_ms: u64,
}

fn d_bus_wait_timeout_ms() -> u64 {
    100
}

fn d_yield_sleep_ms() -> u64 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bus_wait_timeout_ms: d_bus_wait_timeout_ms(),
            yield_sleep_ms: d_yield_sleep_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextWindowConfig {
    #[serde(default = "d_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "d_keep_ratio")]
    pub keep_ratio: f32,
    #[serde(default = "d_max_slide_loops")]
    pub max_slide_loops: u32,
}

fn d_max_tokens() -> u32 {
    128_000
}

fn d_keep_ratio() -> f32 {
    0.7
}

fn d_max_slide_loops() -> u32 {
    50
}

impl Default for ContextWindowConfig {
    fn default() -> Self {
        Self {
            max_tokens: d_max_tokens(),
            keep_ratio: d_keep_ratio(),
            max_slide_loops: d_max_slide_loops(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.turn.max_tool_rounds == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "turn.max_tool_rounds".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.bus_wait_timeout_ms > 100 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "scheduler.bus_wait_timeout_ms".into(),
                message: "must be <= 100ms so delayed delivery and idle collapse run on a \
                          steady cadence (spec §5)"
                    .into(),
            });
        }

        if !(0.0..1.0).contains(&self.context_window.keep_ratio) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "context_window.keep_ratio".into(),
                message: "must be in [0, 1)".into(),
            });
        } else if self.context_window.keep_ratio > 0.9 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "context_window.keep_ratio".into(),
                message: "a keep_ratio this close to 1.0 leaves little room for the sliding \
                          window to make progress before max_slide_loops is reached"
                    .into(),
            });
        }

        if self.context_window.max_slide_loops == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "context_window.max_slide_loops".into(),
                message: "must be at least 1".into(),
            });
        }

        issues
    }
}
