pub mod config;
pub mod source;

pub use config::{
    ClickHouseSettings, DimSettings, DynamicSchemaSettings, KafkaSettings, SaslSettings, Settings,
    TaskSettings, TlsSettings,
};
pub use source::{ConfigSource, ConfigUpdate, LocalFileSource};
