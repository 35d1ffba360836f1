pub mod config;
pub mod db;
pub mod model;
pub mod parser;
pub mod statistics;
pub mod task;
pub mod util;

pub use config::{ConfigSource, LocalFileSource, Settings};
pub use db::{ClickHouseSink, ShardConnPool};
pub use task::{Consumer, Sinker, Task};
