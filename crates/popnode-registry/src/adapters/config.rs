use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::domain::RegistryConfig;
use crate::error::ConfigError;
use crate::ports::ConfigProvider;

// ============================================================================
// StaticConfigProvider
// ============================================================================

/// Configuration fixed in code. Useful for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigProvider {
    config: RegistryConfig,
}

impl StaticConfigProvider {
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self { config }
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn registry_config(&self) -> RegistryConfig {
        self.config.clone()
    }
}

// ============================================================================
// TomlConfigProvider
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    index: IndexSection,
    #[serde(default)]
    gossip: GossipSection,
    #[serde(default)]
    liveness: LivenessSection,
    #[serde(default)]
    pose: PoseSection,
    #[serde(default)]
    recovery: RecoverySection,
    #[serde(default)]
    tasks: TasksSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct IndexSection {
    max_expected_size: Option<usize>,
    min_rebuild_secs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GossipSection {
    list_request_interval_secs: Option<i64>,
    entry_request_interval_secs: Option<i64>,
    last_paid_scan_blocks: Option<u64>,
    max_signature_drift_secs: Option<i64>,
    max_ping_block_depth: Option<u64>,
    required_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LivenessSection {
    check_interval_secs: Option<i64>,
    min_announce_interval_secs: Option<i64>,
    min_ping_interval_secs: Option<i64>,
    expiration_secs: Option<i64>,
    watchdog_max_secs: Option<i64>,
    new_start_required_secs: Option<i64>,
    new_start_removal_grace_secs: Option<i64>,
    min_payments_protocol: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoseSection {
    ban_max_score: Option<i32>,
    min_protocol: Option<u32>,
    max_rank: Option<usize>,
    max_blocks: Option<u64>,
    max_connections: Option<usize>,
    request_expiry_secs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecoverySection {
    quorum_total: Option<usize>,
    quorum_required: Option<usize>,
    max_ask_entries: Option<usize>,
    wait_secs: Option<i64>,
    retry_secs: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TasksSection {
    sweep_interval_secs: Option<u64>,
    verification_interval_secs: Option<u64>,
    connection_drain_interval_secs: Option<u64>,
}

fn apply<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

/// Registry configuration loaded from a TOML file.
///
/// Every key is optional and falls back to [`RegistryConfig::default`].
///
/// # Config File Format
///
/// ```toml
/// [index]
/// max_expected_size = 30000
/// min_rebuild_secs = 3600
///
/// [gossip]
/// list_request_interval_secs = 10800
/// required_port = 9888
///
/// [liveness]
/// expiration_secs = 3900
/// new_start_required_secs = 10800
///
/// [pose]
/// ban_max_score = 5
/// max_rank = 10
///
/// [recovery]
/// quorum_total = 10
/// quorum_required = 6
///
/// [tasks]
/// sweep_interval_secs = 60
/// ```
#[derive(Debug, Clone)]
pub struct TomlConfigProvider {
    config: RegistryConfig,
}

impl TomlConfigProvider {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        let mut c = RegistryConfig::default();
        apply(&mut c.max_expected_index_size, file.index.max_expected_size);
        apply(&mut c.min_index_rebuild_secs, file.index.min_rebuild_secs);

        let g = file.gossip;
        apply(&mut c.list_request_interval_secs, g.list_request_interval_secs);
        apply(&mut c.entry_request_interval_secs, g.entry_request_interval_secs);
        apply(&mut c.last_paid_scan_blocks, g.last_paid_scan_blocks);
        apply(&mut c.max_signature_drift_secs, g.max_signature_drift_secs);
        apply(&mut c.max_ping_block_depth, g.max_ping_block_depth);
        if g.required_port.is_some() {
            c.required_port = g.required_port;
        }

        let l = file.liveness;
        apply(&mut c.check_interval_secs, l.check_interval_secs);
        apply(&mut c.min_announce_interval_secs, l.min_announce_interval_secs);
        apply(&mut c.min_ping_interval_secs, l.min_ping_interval_secs);
        apply(&mut c.expiration_secs, l.expiration_secs);
        apply(&mut c.watchdog_max_secs, l.watchdog_max_secs);
        apply(&mut c.new_start_required_secs, l.new_start_required_secs);
        apply(&mut c.new_start_removal_grace_secs, l.new_start_removal_grace_secs);
        apply(&mut c.min_payments_protocol, l.min_payments_protocol);

        let p = file.pose;
        apply(&mut c.pose_ban_max_score, p.ban_max_score);
        apply(&mut c.min_pose_protocol, p.min_protocol);
        apply(&mut c.max_pose_rank, p.max_rank);
        apply(&mut c.max_pose_blocks, p.max_blocks);
        apply(&mut c.max_pose_connections, p.max_connections);
        apply(&mut c.verification_request_expiry_secs, p.request_expiry_secs);

        let r = file.recovery;
        apply(&mut c.recovery_quorum_total, r.quorum_total);
        apply(&mut c.recovery_quorum_required, r.quorum_required);
        apply(&mut c.recovery_max_ask_entries, r.max_ask_entries);
        apply(&mut c.recovery_wait_secs, r.wait_secs);
        apply(&mut c.recovery_retry_secs, r.retry_secs);

        let t = file.tasks;
        apply(&mut c.sweep_interval_secs, t.sweep_interval_secs);
        apply(&mut c.verification_interval_secs, t.verification_interval_secs);
        apply(&mut c.connection_drain_interval_secs, t.connection_drain_interval_secs);

        validate(&c)?;
        Ok(Self { config: c })
    }
}

fn validate(c: &RegistryConfig) -> Result<(), ConfigError> {
    if c.recovery_quorum_required == 0 || c.recovery_quorum_required > c.recovery_quorum_total {
        return Err(ConfigError::Invalid(format!(
            "recovery quorum {} of {} is not satisfiable",
            c.recovery_quorum_required, c.recovery_quorum_total
        )));
    }
    if c.pose_ban_max_score <= 0 {
        return Err(ConfigError::Invalid(
            "pose.ban_max_score must be positive".to_string(),
        ));
    }
    if c.expiration_secs >= c.new_start_required_secs {
        return Err(ConfigError::Invalid(
            "liveness.expiration_secs must be below new_start_required_secs".to_string(),
        ));
    }
    if c.min_ping_interval_secs <= 60 {
        return Err(ConfigError::Invalid(
            "liveness.min_ping_interval_secs must exceed 60".to_string(),
        ));
    }
    Ok(())
}

impl ConfigProvider for TomlConfigProvider {
    fn registry_config(&self) -> RegistryConfig {
        self.config.clone()
    }
}
