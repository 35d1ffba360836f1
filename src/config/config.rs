use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use config::{Config, File, FileFormat};
use serde::Deserialize;

/// ClickHouse connection and write-retry configuration.
///
/// `hosts` is a shard-major matrix: `hosts[shard]` lists the replicas of
/// that shard in failover order.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClickHouseSettings {
    pub hosts: Vec<Vec<String>>,
    pub port: u16,
    pub cluster: String,
    pub db: String,
    pub username: String,
    pub password: String,
    /// Template selecting a tenant database from a record field,
    /// e.g. `"${tenant}_db"`. Empty disables multi-tenancy.
    pub db_key: String,
    /// Write attempts per batch; `<= 0` retries indefinitely.
    pub retry_times: i32,
    /// "native" or "http"; only affects the generated INSERT template.
    pub protocol: String,
    pub secure: bool,
    pub insecure_skip_verify: bool,
    pub async_insert: bool,
    #[serde(default)]
    pub async_settings: HashMap<String, String>,
}

impl Default for ClickHouseSettings {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            port: 8123,
            cluster: String::new(),
            db: "default".to_owned(),
            username: "default".to_owned(),
            password: String::new(),
            db_key: String::new(),
            retry_times: 0,
            protocol: "native".to_owned(),
            secure: false,
            insecure_skip_verify: false,
            async_insert: false,
            async_settings: HashMap::new(),
        }
    }
}

/// Kafka consumer-group tuning knobs, all in milliseconds.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KafkaProperties {
    pub heartbeat_interval: u64,
    pub session_timeout: u64,
    pub rebalance_timeout: u64,
    pub request_timeout_overhead: u64,
    pub max_poll_interval: u64,
}

impl Default for KafkaProperties {
    fn default() -> Self {
        Self {
            heartbeat_interval: 3_000,
            session_timeout: 30_000,
            rebalance_timeout: 60_000,
            request_timeout_overhead: 10_000,
            max_poll_interval: 300_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GssapiSettings {
    pub service_name: String,
    pub realm: String,
    pub username: String,
    pub password: String,
    pub key_tab_path: String,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SaslSettings {
    pub enable: bool,
    /// PLAIN, SCRAM-SHA-256, SCRAM-SHA-512 or GSSAPI.
    pub mechanism: String,
    pub username: String,
    pub password: String,
    pub gssapi: GssapiSettings,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsSettings {
    pub enable: bool,
    pub ca_cert_files: String,
    pub client_cert_file: String,
    pub client_key_file: String,
    pub trust_store_location: String,
    pub trust_store_password: String,
    pub keystore_location: String,
    pub keystore_password: String,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KafkaSettings {
    pub brokers: String,
    pub properties: KafkaProperties,
    pub sasl: SaslSettings,
    pub tls: TlsSettings,
    pub reset_sasl_realm: bool,
    /// Fleet assignment cadence, seconds. Consumed by the config source.
    pub assign_interval: u64,
    pub calc_lag_interval: u64,
    pub rebalance_by_lags: bool,
}

impl Default for KafkaSettings {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_owned(),
            properties: KafkaProperties::default(),
            sasl: SaslSettings::default(),
            tls: TlsSettings::default(),
            reset_sasl_realm: false,
            assign_interval: 300,
            calc_lag_interval: 300,
            rebalance_by_lags: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DimSettings {
    pub name: String,
    #[serde(rename = "type")]
    pub typ: String,
    pub source_name: String,
}

impl Default for DimSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            typ: "String".to_owned(),
            source_name: String::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DynamicSchemaSettings {
    pub enable: bool,
    /// Upper bound on total columns after dynamic additions.
    pub max_dims: usize,
    pub white_list: String,
    pub black_list: String,
    /// Emit bare (non-nullable) column types on ALTER.
    pub not_nullable: bool,
}

impl Default for DynamicSchemaSettings {
    fn default() -> Self {
        Self {
            enable: false,
            max_dims: 1 << 15,
            white_list: String::new(),
            black_list: String::new(),
            not_nullable: false,
        }
    }
}

/// One ingestion task: a topic consumed into a table.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskSettings {
    pub name: String,
    pub topic: String,
    pub consumer_group: String,
    /// `"table"` or `"db.table"`.
    pub table_name: String,
    pub series_table_name: String,
    /// "fastjson", "gjson" or "csv".
    pub parser: String,
    pub csv_format: Vec<String>,
    pub delimiter: String,
    /// IANA timezone for unzoned record timestamps; empty means UTC.
    pub timezone: String,
    /// Scale applied to numeric timestamps to get seconds.
    pub time_unit: f64,
    pub auto_schema: bool,
    pub exclude_columns: Vec<String>,
    pub dims: Vec<DimSettings>,
    pub sharding_key: String,
    pub sharding_stripe: u64,
    pub buffer_size: usize,
    pub min_buffer_size: usize,
    /// Seconds between forced flushes.
    pub flush_interval: u64,
    pub prometheus_schema: bool,
    pub dynamic_schema: DynamicSchemaSettings,
    pub prom_labels_black_list: String,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            topic: String::new(),
            consumer_group: String::new(),
            table_name: String::new(),
            series_table_name: String::new(),
            parser: "fastjson".to_owned(),
            csv_format: Vec::new(),
            delimiter: ",".to_owned(),
            timezone: String::new(),
            time_unit: 1.0,
            auto_schema: true,
            exclude_columns: Vec::new(),
            dims: Vec::new(),
            sharding_key: String::new(),
            sharding_stripe: 0,
            buffer_size: 1 << 18,
            min_buffer_size: 1,
            flush_interval: 10,
            prometheus_schema: false,
            dynamic_schema: DynamicSchemaSettings::default(),
            prom_labels_black_list: String::new(),
        }
    }
}

impl TaskSettings {
    /// Splits `table_name` into an optional database override and the
    /// bare table. The override is ignored when multi-tenancy is active.
    pub fn split_table_name(&self) -> (Option<&str>, &str) {
        match self.table_name.split_once('.') {
            Some((db, tbl)) if !db.is_empty() => (Some(db), tbl),
            _ => (None, self.table_name.as_str()),
        }
    }
}

/// Root configuration snapshot. Immutable once loaded; reloads build a
/// fresh instance and diff against the running one.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub clickhouse: ClickHouseSettings,
    pub kafka: KafkaSettings,
    pub tasks: Vec<Arc<TaskSettings>>,
    /// Capacity of the global record gate.
    pub record_pool_size: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            clickhouse: ClickHouseSettings::default(),
            kafka: KafkaSettings::default(),
            tasks: Vec::new(),
            record_pool_size: 1 << 21,
        }
    }
}

impl Settings {
    pub fn from_file(path: &str) -> Result<Self> {
        let s = Config::builder()
            .add_source(File::new(path, FileFormat::Json))
            .build()?;
        let mut settings: Settings = s.try_deserialize()?;
        settings.normalize()?;
        Ok(settings)
    }

    pub fn from_json(body: &str) -> Result<Self> {
        let mut settings: Settings = serde_json::from_str(body)?;
        settings.normalize()?;
        Ok(settings)
    }

    /// Validate and fill derived defaults. Buffer sizes are used as-is;
    /// the sharder derives its offset shift from the raw value.
    pub fn normalize(&mut self) -> Result<()> {
        if self.clickhouse.hosts.is_empty() || self.clickhouse.hosts.iter().any(Vec::is_empty) {
            bail!("clickhouse.hosts must list at least one replica per shard");
        }
        match self.clickhouse.protocol.as_str() {
            "native" | "http" => {}
            other => bail!("unknown clickhouse protocol {other:?}"),
        }

        let mut tasks = Vec::with_capacity(self.tasks.len());
        for task in self.tasks.drain(..) {
            let mut task = TaskSettings::clone(&task);
            if task.name.is_empty() || task.topic.is_empty() || task.table_name.is_empty() {
                bail!("task requires name, topic and tableName");
            }
            if task.consumer_group.is_empty() {
                task.consumer_group = task.name.clone();
            }
            match task.parser.as_str() {
                "fastjson" | "gjson" => {}
                "csv" => {
                    if task.csv_format.is_empty() {
                        bail!("task {}: csv parser requires csvFormat", task.name);
                    }
                }
                other => bail!("task {}: unknown parser {other:?}", task.name),
            }
            if task.delimiter.chars().count() != 1 {
                bail!("task {}: delimiter must be a single character", task.name);
            }
            if !task.timezone.is_empty() && task.timezone.parse::<chrono_tz::Tz>().is_err() {
                bail!("task {}: unknown timezone {:?}", task.name, task.timezone);
            }
            if task.time_unit <= 0.0 {
                task.time_unit = 1.0;
            }
            if task.buffer_size < task.min_buffer_size {
                task.buffer_size = task.min_buffer_size;
            }
            if task.buffer_size == 0 {
                task.buffer_size = 1;
            }
            if task.flush_interval == 0 {
                task.flush_interval = TaskSettings::default().flush_interval;
            }
            if task.dynamic_schema.max_dims == 0 {
                task.dynamic_schema.max_dims = DynamicSchemaSettings::default().max_dims;
            }
            if task.prometheus_schema && task.series_table_name.is_empty() {
                let (_, tbl) = task.split_table_name();
                task.series_table_name = format!("{tbl}_series");
            }
            tasks.push(Arc::new(task));
        }
        self.tasks = tasks;
        Ok(())
    }
}
