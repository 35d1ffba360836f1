pub mod clickhouse;

pub use clickhouse::{ClickHouseSink, ReplicaConn, ShardConn, ShardConnPool};
