pub mod pool;
pub mod schema;
pub mod writer;

pub use pool::{ReplicaConn, ShardConn, ShardConnPool};
pub use writer::ClickHouseSink;
