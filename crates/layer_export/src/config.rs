use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::platform::DEFAULT_API_BASE;

/// `layer_export` - batch-upload vector layers to a remote geoprocessing
/// platform and merge them into one asset per layer.
///
/// Each layer is cut into fixed-size batches, every batch is exported as its
/// own table asset, the batches are merged server-side, degenerate
/// geometries are filtered out, the result is exported as
/// `<layer>_merged` and the batch assets are deleted.
#[derive(Parser, Debug, Clone)]
#[command(name = "layer_export", version, about, long_about = None)]
pub struct Config {
    /// Project namespace that owns the assets, e.g. `projects/ee-ronnyale`.
    #[arg(long, env = "LAYER_EXPORT_PROJECT")]
    pub project: String,

    /// A layer to process as `NAME=PATH` to a GeoJSON FeatureCollection.
    ///
    /// Repeat the flag (or comma-separate in the environment variable) to
    /// process several layers; they run one after another, in order.
    #[arg(
        long = "layer",
        env = "LAYER_EXPORT_LAYERS",
        value_delimiter = ',',
        required_unless_present = "layers_file"
    )]
    pub layers: Vec<LayerSpec>,

    /// JSON file listing layers, each with its own columns, z handling and
    /// row filter.
    ///
    /// Its layers run after the ones given with `--layer`.
    #[arg(long, env = "LAYER_EXPORT_LAYERS_FILE")]
    pub layers_file: Option<PathBuf>,

    /// Attribute columns to keep (after name cleaning). Empty keeps all.
    /// A layer's own `columns` take precedence.
    #[arg(long, env = "LAYER_EXPORT_COLUMNS", value_delimiter = ',')]
    pub columns: Vec<String>,

    /// Rows per uploaded batch.
    #[arg(long, env = "LAYER_EXPORT_BATCH_SIZE", default_value_t = 500)]
    pub batch_size: usize,

    /// Seconds between task status sweeps.
    #[arg(long, env = "LAYER_EXPORT_POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Give up waiting on a set of tasks after this many seconds.
    #[arg(long, env = "LAYER_EXPORT_MAX_WAIT_SECS")]
    pub max_wait_secs: Option<u64>,

    /// Maximum number of collections merged into one group.
    #[arg(long, env = "LAYER_EXPORT_MERGE_GROUP_CAP", default_value_t = 100)]
    pub merge_group_cap: usize,

    /// Drop z values from polygon geometries before upload. A layer's own
    /// `strip_z` takes precedence.
    #[arg(long, default_value_t = false)]
    pub strip_z: bool,

    /// Treat cancelled tasks as finished instead of failing the layer.
    #[arg(long, default_value_t = false)]
    pub accept_cancelled: bool,

    /// Treat a failed asset existence check as "missing" and export anyway.
    #[arg(long, default_value_t = false)]
    pub probe_errors_as_missing: bool,

    /// Keep the per-batch assets after the merged export.
    #[arg(long, default_value_t = false)]
    pub keep_batches: bool,

    /// Run against an in-memory platform; nothing is sent over the network.
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Base URL of the platform REST API.
    #[arg(long, env = "EE_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// OAuth bearer token sent with every request.
    #[arg(long, env = "EE_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Per-request HTTP timeout in seconds.
    #[arg(long, default_value_t = 60)]
    pub http_timeout_secs: u64,

    /// Write the Prometheus text exposition here when the run ends.
    #[arg(long, env = "LAYER_EXPORT_METRICS_FILE")]
    pub metrics_file: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable lines.
    Text,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogFormat::Json => "json",
            LogFormat::Text => "text",
        };

        f.write_str(s)
    }
}

/// A layer to export and the options that apply to it alone.
///
/// On the command line only `NAME=PATH` can be given. A layers file holds a
/// JSON array of entries such as:
///
/// ```json
/// [{ "name": "fires", "path": "NFDB_poly.geojson",
///    "columns": ["fire_id", "rep_date"], "strip_z": true,
///    "where": { "column": "src_agency", "value": "AB" } }]
/// ```
///
/// Unset options fall back to the global flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerSpec {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub strip_z: Option<bool>,
    /// Keep only rows whose attribute equals a value.
    #[serde(default, rename = "where")]
    pub filter: Option<RowFilter>,
}

/// `column == value`, matched after attribute names are cleaned.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowFilter {
    pub column: String,
    pub value: String,
}

fn check_layer_name(name: &str) -> Result<(), String> {
    if name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Ok(())
    } else {
        Err(format!(
            "layer name '{}' may only contain ASCII letters, digits, '_' and '-'",
            name
        ))
    }
}

impl FromStr for LayerSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, path) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=PATH, got '{}'", s))?;
        let name = name.trim();
        let path = path.trim();
        if name.is_empty() || path.is_empty() {
            return Err(format!("expected NAME=PATH, got '{}'", s));
        }
        check_layer_name(name)?;
        Ok(Self {
            name: name.to_owned(),
            path: PathBuf::from(path),
            ..Default::default()
        })
    }
}

/// Reads a layers file. Relative paths resolve against the file's directory.
pub fn read_layers_file(path: &Path) -> anyhow::Result<Vec<LayerSpec>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read layers file '{}'", path.display()))?;
    let mut layers: Vec<LayerSpec> = serde_json::from_str(&text)
        .with_context(|| format!("Invalid layers file '{}'", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new(""));
    for layer in &mut layers {
        if layer.name.is_empty() {
            bail!("layers file '{}' has an entry without a name", path.display());
        }
        check_layer_name(&layer.name).map_err(anyhow::Error::msg)?;
        if layer.path.is_relative() {
            layer.path = base.join(&layer.path);
        }
    }
    Ok(layers)
}

/// Validated settings the pipeline runs with.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub project: String,
    pub layers: Vec<LayerSpec>,
    pub columns: Vec<String>,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_wait: Option<Duration>,
    pub merge_group_cap: usize,
    pub strip_z: bool,
    pub accept_cancelled: bool,
    pub probe_errors_as_missing: bool,
    pub keep_batches: bool,
}

impl Config {
    /// Checks the parsed values and turns them into [`RunSettings`].
    pub fn settings(&self) -> anyhow::Result<RunSettings> {
        let project = self.project.trim().trim_end_matches('/');
        if project.is_empty() {
            bail!("--project must not be empty");
        }
        if self.batch_size == 0 {
            bail!("--batch-size must be greater than zero");
        }
        if self.merge_group_cap == 0 {
            bail!("--merge-group-cap must be greater than zero");
        }
        if self.poll_interval_secs == 0 {
            bail!("--poll-interval-secs must be greater than zero");
        }

        let mut layers = self.layers.clone();
        if let Some(path) = &self.layers_file {
            layers.extend(read_layers_file(path)?);
        }
        if layers.is_empty() {
            bail!("no layers configured");
        }

        let mut names = HashSet::new();
        for layer in &layers {
            if !names.insert(layer.name.as_str()) {
                bail!("layer '{}' is listed more than once", layer.name);
            }
        }

        let columns = self
            .columns
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_owned)
            .collect();

        Ok(RunSettings {
            project: project.to_owned(),
            layers,
            columns,
            batch_size: self.batch_size,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_wait: self.max_wait_secs.map(Duration::from_secs),
            merge_group_cap: self.merge_group_cap,
            strip_z: self.strip_z,
            accept_cancelled: self.accept_cancelled,
            probe_errors_as_missing: self.probe_errors_as_missing,
            keep_batches: self.keep_batches,
        })
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Parses a config from an argument list; used by tests and tooling.
pub fn parse_args<I, T>(args: I) -> anyhow::Result<Config>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Config::try_parse_from(args).context("Failed to parse command line")
}
