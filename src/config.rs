use std::path::PathBuf;
use std::time::Duration;

use ulid::Ulid;

/// Autopilot and background-scan settings.
#[derive(Debug, Clone)]
pub struct AutopilotConfig {
    /// How often each business gets a lifecycle cycle.
    pub interval: Duration,
    /// Delay between consecutive START/END tasks inside one cycle.
    pub pacing: Duration,
    /// Let a free provider start their next appointment a few minutes early.
    pub early_start: bool,
    /// How often active sessions are checked for overruns.
    pub overrun_interval: Duration,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            pacing: Duration::from_millis(1_000),
            early_start: false,
            overrun_interval: Duration::from_secs(60),
        }
    }
}

/// Process configuration, read from `SHIFTLINE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: String,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// Identity used for the autopilot leadership lease.
    pub instance_id: String,
    pub autopilot: AutopilotConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        let defaults = AutopilotConfig::default();

        let autopilot = AutopilotConfig {
            interval: parsed("SHIFTLINE_AUTOPILOT_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            pacing: parsed("SHIFTLINE_AUTOPILOT_PACING_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.pacing),
            early_start: lookup("SHIFTLINE_EARLY_START")
                .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(defaults.early_start),
            overrun_interval: parsed("SHIFTLINE_OVERRUN_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.overrun_interval),
        };

        Self {
            port: lookup("SHIFTLINE_PORT").unwrap_or_else(|| "5433".into()),
            bind: lookup("SHIFTLINE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("SHIFTLINE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("SHIFTLINE_PASSWORD").unwrap_or_else(|| "shiftline".into()),
            max_connections: parsed("SHIFTLINE_MAX_CONNECTIONS")
                .map(|n| n as usize)
                .unwrap_or(256),
            compact_threshold: parsed("SHIFTLINE_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: lookup("SHIFTLINE_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            tls_cert: lookup("SHIFTLINE_TLS_CERT"),
            tls_key: lookup("SHIFTLINE_TLS_KEY"),
            instance_id: lookup("SHIFTLINE_INSTANCE_ID").unwrap_or_else(|| Ulid::new().to_string()),
            autopilot,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("shiftline.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = config_from(&[]);
        assert_eq!(cfg.port, "5433");
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert!(cfg.metrics_port.is_none());
        assert!(!cfg.autopilot.early_start);
        assert_eq!(cfg.autopilot.interval, Duration::from_secs(15));
        assert_eq!(cfg.autopilot.pacing, Duration::from_millis(1000));
        assert!(!cfg.instance_id.is_empty());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config_from(&[
            ("SHIFTLINE_PORT", "6000"),
            ("SHIFTLINE_DATA_DIR", "/var/lib/shiftline"),
            ("SHIFTLINE_AUTOPILOT_INTERVAL_SECS", "30"),
            ("SHIFTLINE_AUTOPILOT_PACING_MS", "0"),
            ("SHIFTLINE_EARLY_START", "true"),
            ("SHIFTLINE_INSTANCE_ID", "node-a"),
            ("SHIFTLINE_METRICS_PORT", "9100"),
        ]);
        assert_eq!(cfg.port, "6000");
        assert_eq!(cfg.wal_path(), PathBuf::from("/var/lib/shiftline/shiftline.wal"));
        assert_eq!(cfg.autopilot.interval, Duration::from_secs(30));
        assert_eq!(cfg.autopilot.pacing, Duration::ZERO);
        assert!(cfg.autopilot.early_start);
        assert_eq!(cfg.instance_id, "node-a");
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let cfg = config_from(&[
            ("SHIFTLINE_MAX_CONNECTIONS", "lots"),
            ("SHIFTLINE_AUTOPILOT_INTERVAL_SECS", "0"),
        ]);
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.autopilot.interval, Duration::from_secs(15));
    }
}
