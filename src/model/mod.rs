//! Core data model shared between the parsers, the sharder and the
//! ClickHouse writer.

mod column;
mod state;
mod value;

pub use column::{ColumnType, ColumnWithType, TypeCode};
pub use state::{
    Batch, DbState, InputMessage, MsgRow, Row, SeriesQuota, OFFSET_SHARDING, WR_SERIES_QUOTA,
};
pub use value::Value;
