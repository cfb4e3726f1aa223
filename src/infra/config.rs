//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section is optional; missing keys take the defaults below.

use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Samples with a worse accuracy radius than this are dropped
    #[serde(default = "default_accuracy_threshold_m")]
    pub accuracy_threshold_m: f64,
    /// Jump allowed regardless of elapsed time
    #[serde(default = "default_max_jump_m")]
    pub max_jump_m: f64,
    /// Plausible travel speed used to widen the jump allowance over time
    #[serde(default = "default_max_speed_m_per_ms")]
    pub max_speed_m_per_ms: f64,
    /// Weight of the new sample in the exponential smoother (0-1)
    #[serde(default = "default_smoothing_factor")]
    pub smoothing_factor: f64,
}

fn default_accuracy_threshold_m() -> f64 {
    30.0
}

fn default_max_jump_m() -> f64 {
    20.0
}

fn default_max_speed_m_per_ms() -> f64 {
    0.002 // ~2 m/s, brisk walking
}

fn default_smoothing_factor() -> f64 {
    0.7
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold_m: default_accuracy_threshold_m(),
            max_jump_m: default_max_jump_m(),
            max_speed_m_per_ms: default_max_speed_m_per_ms(),
            smoothing_factor: default_smoothing_factor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadingConfig {
    /// Heading changes at or below this are treated as compass jitter
    #[serde(default = "default_debounce_deg")]
    pub debounce_deg: f64,
}

fn default_debounce_deg() -> f64 {
    2.0
}

impl Default for HeadingConfig {
    fn default() -> Self {
        Self { debounce_deg: default_debounce_deg() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RadarConfig {
    /// Real-world distance represented by the radar edge
    #[serde(default = "default_max_range_m")]
    pub max_range_m: f64,
    /// Radius of the radar in display units
    #[serde(default = "default_display_radius")]
    pub display_radius: f64,
}

fn default_max_range_m() -> f64 {
    50.0
}

fn default_display_radius() -> f64 {
    1.0
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self { max_range_m: default_max_range_m(), display_radius: default_display_radius() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProximityConfig {
    /// Observer displacement that triggers a refetch
    #[serde(default = "default_refetch_distance_m")]
    pub refetch_distance_m: f64,
    /// Fetch radius as a multiple of the radar range
    #[serde(default = "default_fetch_radius_factor")]
    pub fetch_radius_factor: f64,
}

fn default_refetch_distance_m() -> f64 {
    30.0
}

fn default_fetch_radius_factor() -> f64 {
    2.0
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            refetch_distance_m: default_refetch_distance_m(),
            fetch_radius_factor: default_fetch_radius_factor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectionConfig {
    /// How close the observer must be to auto-collect
    #[serde(default = "default_collection_radius_m")]
    pub radius_m: f64,
}

fn default_collection_radius_m() -> f64 {
    10.0
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self { radius_m: default_collection_radius_m() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_remote_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_remote_base_url() -> String {
    "http://localhost:54321".to_string()
}

fn default_remote_timeout_ms() -> u64 {
    5000
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_remote_base_url(),
            api_key: None,
            timeout_ms: default_remote_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the durable key-value files shared by both contexts
    #[serde(default = "default_storage_dir")]
    pub dir: String,
}

fn default_storage_dir() -> String {
    "data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { dir: default_storage_dir() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// File path for collection events (JSONL format)
    #[serde(default = "default_events_file")]
    pub file: String,
}

fn default_events_file() -> String {
    "collections.jsonl".to_string()
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { file: default_events_file() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

fn default_metrics_interval_secs() -> u64 {
    30
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs(), prometheus_port: 0 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub heading: HeadingConfig,
    #[serde(default)]
    pub radar: RadarConfig,
    #[serde(default)]
    pub proximity: ProximityConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    filter: FilterConfig,
    heading_debounce_deg: f64,
    radar_max_range_m: f64,
    radar_display_radius: f64,
    refetch_distance_m: f64,
    fetch_radius_factor: f64,
    collection_radius_m: f64,
    remote_base_url: String,
    remote_api_key: Option<String>,
    remote_timeout_ms: u64,
    storage_dir: String,
    events_file: String,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            filter: toml_config.filter,
            heading_debounce_deg: toml_config.heading.debounce_deg,
            radar_max_range_m: toml_config.radar.max_range_m,
            radar_display_radius: toml_config.radar.display_radius,
            refetch_distance_m: toml_config.proximity.refetch_distance_m,
            fetch_radius_factor: toml_config.proximity.fetch_radius_factor,
            collection_radius_m: toml_config.collection.radius_m,
            remote_base_url: toml_config.remote.base_url,
            remote_api_key: toml_config.remote.api_key,
            remote_timeout_ms: toml_config.remote.timeout_ms,
            storage_dir: toml_config.storage.dir,
            events_file: toml_config.events.file,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    /// Load configuration - tries TOML file first, falls back to defaults
    pub fn load(args: &[String]) -> Self {
        Self::load_from_path(&Self::resolve_config_path(args))
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    /// Settings that are legal but defeat the intended behavior
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.refetch_distance_m >= self.radar_max_range_m {
            warnings.push(format!(
                "refetch_distance_m ({}) should be below radar max_range_m ({}) or crates pop in late",
                self.refetch_distance_m, self.radar_max_range_m
            ));
        }
        if !(0.0..=1.0).contains(&self.filter.smoothing_factor) {
            warnings.push(format!(
                "smoothing_factor ({}) outside 0..=1 overshoots the raw fix",
                self.filter.smoothing_factor
            ));
        }
        if self.collection_radius_m > self.radar_max_range_m {
            warnings.push(format!(
                "collection radius_m ({}) exceeds radar max_range_m ({})",
                self.collection_radius_m, self.radar_max_range_m
            ));
        }
        warnings
    }

    pub fn filter(&self) -> &FilterConfig {
        &self.filter
    }

    pub fn heading_debounce_deg(&self) -> f64 {
        self.heading_debounce_deg
    }

    pub fn radar_max_range_m(&self) -> f64 {
        self.radar_max_range_m
    }

    pub fn radar_display_radius(&self) -> f64 {
        self.radar_display_radius
    }

    pub fn refetch_distance_m(&self) -> f64 {
        self.refetch_distance_m
    }

    /// Radius requested from the remote store on each refetch
    pub fn fetch_radius_m(&self) -> f64 {
        self.radar_max_range_m * self.fetch_radius_factor
    }

    pub fn collection_radius_m(&self) -> f64 {
        self.collection_radius_m
    }

    pub fn remote_base_url(&self) -> &str {
        &self.remote_base_url
    }

    pub fn remote_api_key(&self) -> Option<&str> {
        self.remote_api_key.as_deref()
    }

    pub fn remote_timeout_ms(&self) -> u64 {
        self.remote_timeout_ms
    }

    pub fn storage_dir(&self) -> &str {
        &self.storage_dir
    }

    pub fn events_file(&self) -> &str {
        &self.events_file
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method to override the refetch distance
    pub fn with_refetch_distance_m(mut self, meters: f64) -> Self {
        self.refetch_distance_m = meters;
        self
    }

    /// Builder method to override the radar range
    pub fn with_radar_max_range_m(mut self, meters: f64) -> Self {
        self.radar_max_range_m = meters;
        self
    }

    /// Builder method to override the collection radius
    pub fn with_collection_radius_m(mut self, meters: f64) -> Self {
        self.collection_radius_m = meters;
        self
    }

    /// Builder method to point durable storage at another directory
    pub fn with_storage_dir(mut self, dir: &str) -> Self {
        self.storage_dir = dir.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.filter().accuracy_threshold_m, 30.0);
        assert_eq!(config.filter().max_jump_m, 20.0);
        assert_eq!(config.filter().max_speed_m_per_ms, 0.002);
        assert_eq!(config.filter().smoothing_factor, 0.7);
        assert_eq!(config.heading_debounce_deg(), 2.0);
        assert_eq!(config.radar_max_range_m(), 50.0);
        assert_eq!(config.refetch_distance_m(), 30.0);
        assert_eq!(config.fetch_radius_m(), 100.0);
        assert_eq!(config.collection_radius_m(), 10.0);
        assert_eq!(config.prometheus_port(), 0);
        assert!(config.warnings().is_empty());
    }

    #[test]
    fn test_refetch_beyond_range_warns() {
        let config = Config::default().with_refetch_distance_m(100.0);
        let warnings = config.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("refetch_distance_m"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
[radar]
max_range_m = 80.0

[filter]
smoothing_factor = 0.5
"#,
        )
        .unwrap();
        let config = Config::from_toml(toml_config, "inline".to_string());
        assert_eq!(config.radar_max_range_m(), 80.0);
        assert_eq!(config.radar_display_radius(), 1.0);
        assert_eq!(config.filter().smoothing_factor, 0.5);
        assert_eq!(config.filter().accuracy_threshold_m, 30.0);
        assert_eq!(config.fetch_radius_m(), 160.0);
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["crate-drop".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> =
            vec!["crate-drop".to_string(), "--config".to_string(), "config/park.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/park.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["crate-drop".to_string(), "--config=config/city.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/city.toml");
    }
}
