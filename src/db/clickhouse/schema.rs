use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clickhouse::Row;
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::config::{Settings, TaskSettings};
use crate::model::{ColumnWithType, DbState, TypeCode, OFFSET_SHARDING};
use crate::parser::get_source_name;
use crate::util::{compare_clickhouse_version, template_references};

use super::pool::{ReplicaConn, ShardConnPool};

/// Synthetic column carrying the hash of the sorting-key tuple for
/// `Replacing*` tables without a configured sharding key.
pub const SHARDING_KEY_COLUMN: &str = "__shardingkey";

static DIST_ENGINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(Distributed\s*\(\s*'[^']*',\s*')[^']*(')").unwrap());
static CREATE_TABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^CREATE TABLE( IF NOT EXISTS)?\s+\S+?\.(`[^`]+`|\S+)").unwrap());

#[derive(Row, Deserialize)]
struct ColumnRow {
    name: String,
    #[serde(rename = "type")]
    typ: String,
    default_kind: String,
}

#[derive(Row, Deserialize)]
struct ReferencedColumnRow {
    name: String,
    referenced_type: String,
}

#[derive(Row, Deserialize)]
struct DistTblRow {
    name: String,
    cluster: String,
}

/// Metadata resolved from the series table of a Prometheus-flavored task.
#[derive(Debug, Clone, Default)]
pub struct SeriesMeta {
    pub dim_ser_id: String,
    pub dim_mgmt_id: String,
    /// Label carrying the metric name; excluded from the labels JSON.
    pub name_key: String,
}

/// Table introspection and DDL for one task: builds `DbState` layouts,
/// clones per-tenant schemas and applies dynamic `ADD COLUMN`s.
pub struct SchemaManager {
    cfg: Arc<Settings>,
    task: Arc<TaskSettings>,
    pool: Arc<ShardConnPool>,
    pub base_db: String,
    pub table_name: String,
    pub series_tbl: String,
    pub dist_metric_tbls: Vec<String>,
    pub dist_series_tbls: Vec<String>,
    pub key_dim: Option<ColumnWithType>,
    pub series_meta: SeriesMeta,
    pub sorting_keys: Vec<ColumnWithType>,
    /// Effective sharding settings, after the `__shardingkey` bootstrap.
    pub sharding_key: String,
    pub sharding_stripe: u64,
}

impl SchemaManager {
    /// Introspect the target tables and run the one-off bootstrap DDL.
    /// Returns the manager together with the base-layout state.
    pub async fn new(
        cfg: Arc<Settings>,
        task: Arc<TaskSettings>,
        pool: Arc<ShardConnPool>,
    ) -> Result<(Self, DbState)> {
        let (db_override, table) = task.split_table_name();
        let base_db = if !cfg.clickhouse.db_key.is_empty() {
            cfg.clickhouse.db.clone()
        } else {
            db_override.unwrap_or(&cfg.clickhouse.db).to_owned()
        };

        let mut mgr = Self {
            base_db: base_db.clone(),
            table_name: table.to_owned(),
            series_tbl: task.series_table_name.clone(),
            dist_metric_tbls: Vec::new(),
            dist_series_tbls: Vec::new(),
            key_dim: None,
            series_meta: SeriesMeta::default(),
            sorting_keys: Vec::new(),
            sharding_key: task.sharding_key.clone(),
            sharding_stripe: task.sharding_stripe,
            cfg,
            task,
            pool,
        };

        if !mgr.cfg.clickhouse.cluster.is_empty() {
            let table = mgr.table_name.clone();
            mgr.dist_metric_tbls = mgr.require_dist_tbls(&base_db, &table).await?;
            if mgr.task.prometheus_schema {
                let series = mgr.series_tbl.clone();
                mgr.dist_series_tbls = mgr.require_dist_tbls(&base_db, &series).await?;
            }
        }

        mgr.ensure_sharding_key().await?;
        if !mgr.sorting_keys.is_empty() {
            mgr.sharding_key = SHARDING_KEY_COLUMN.to_owned();
            mgr.sharding_stripe = 1;
        }

        let (state, meta) = mgr.build_state(&base_db).await?;
        mgr.series_meta = meta;
        mgr.key_dim = state.dims.iter().find(|d| d.is_db_key).cloned();
        info!(
            "task {}: prepare sql => {}",
            mgr.task.name, state.prepare_sql
        );
        if !state.prom_ser_sql.is_empty() {
            info!(
                "task {}: series sql => {}",
                mgr.task.name, state.prom_ser_sql
            );
        }
        Ok((mgr, state))
    }

    /// Key identifying the series quota shared by tasks writing the same
    /// series table; empty for non-Prometheus tasks.
    pub fn series_quota_key(&self, db: &str) -> String {
        if !self.task.prometheus_schema {
            return String::new();
        }
        let db = if db.is_empty() { &self.base_db } else { db };
        if !self.cfg.clickhouse.cluster.is_empty() {
            if let Some(dist) = self.dist_series_tbls.last() {
                return format!("{db}.{dist}");
            }
        }
        format!("{db}.{}", self.series_tbl)
    }

    async fn conn(&self) -> Result<Arc<ReplicaConn>> {
        let shard = self.pool.shard_conn(0);
        let (replica, _) = shard.next_good_replica(0)?;
        Ok(replica)
    }

    /// Introspect `db` and assemble a fresh state with INSERT templates.
    pub async fn build_state(&self, db: &str) -> Result<(DbState, SeriesMeta)> {
        let conn = self.conn().await?;
        let mut dims = if self.task.auto_schema {
            get_dims(
                conn.client(),
                db,
                &self.table_name,
                &self.task.exclude_columns,
                &self.cfg.clickhouse.db_key,
                &self.task.parser,
            )
            .await?
        } else {
            let mut dims = Vec::with_capacity(self.task.dims.len());
            for dim in &self.task.dims {
                let Some(typ) = TypeCode::from_clickhouse(&dim.typ) else {
                    bail!("task {}: unsupported dim type {}", self.task.name, dim.typ);
                };
                let source = if dim.source_name.is_empty() {
                    get_source_name(&self.task.parser, &dim.name)
                } else {
                    dim.source_name.clone()
                };
                let mut col = ColumnWithType::new(dim.name.clone(), typ, source);
                col.is_db_key = template_references(&self.cfg.clickhouse.db_key, &col.name);
                dims.push(col);
            }
            dims
        };

        let mut idx_ser_id = -1i32;
        let mut prom_ser_sql = String::new();
        let mut meta = SeriesMeta::default();
        if self.task.prometheus_schema {
            let series_dims = get_dims(
                conn.client(),
                db,
                &self.series_tbl,
                &[],
                &self.cfg.clickhouse.db_key,
                &self.task.parser,
            )
            .await
            .with_context(|| {
                format!(
                    "please create series table {db}.{} for {db}.{}",
                    self.series_tbl, self.table_name
                )
            })?;
            meta = series_meta_of(&series_dims, db, &self.series_tbl)?;

            // move the series id column to the end of the metric dims
            let Some(pos) = dims
                .iter()
                .position(|d| d.name == meta.dim_ser_id && d.typ.code == TypeCode::Int64)
            else {
                bail!(
                    "metric table {db}.{} shall have column `{} Int64`",
                    self.table_name,
                    meta.dim_ser_id
                );
            };
            let ser_dim = dims.remove(pos);
            idx_ser_id = dims.len() as i32;
            dims.push(ser_dim);
            // series-table columns (mgmt id, labels, label strings) follow
            dims.extend(series_dims.iter().skip(1).cloned());

            prom_ser_sql = build_insert_sql(
                &self.cfg.clickhouse.protocol,
                db,
                &self.series_tbl,
                &series_dims,
                series_dims.len(),
            );
        }

        let num_dims = dims.len();
        let insert_cols = if idx_ser_id >= 0 {
            idx_ser_id as usize + 1
        } else {
            num_dims
        };
        let prepare_sql = build_insert_sql(
            &self.cfg.clickhouse.protocol,
            db,
            &self.table_name,
            &dims,
            insert_cols,
        );

        Ok((
            DbState {
                db: db.to_owned(),
                dims,
                num_dims,
                idx_ser_id,
                sharding_col_seq: OFFSET_SHARDING,
                prepare_sql,
                prom_ser_sql,
                new_key: false,
                buf_length: Default::default(),
                processed: Default::default(),
            },
            meta,
        ))
    }

    /// Make sure the tenant database exists with clones of the base
    /// tables, then introspect it into a usable state.
    pub async fn ensure_schema(&self, db: &str) -> Result<DbState> {
        let conn = self.conn().await?;
        let count: u64 = conn
            .client()
            .query("SELECT count() FROM system.tables WHERE database = ? AND table = ?")
            .bind(db)
            .bind(&self.table_name)
            .fetch_one()
            .await
            .context("failed to check table existence")?;

        if count == 0 {
            info!("tenant {db}: tables missing, cloning schema of {}", self.base_db);
            let create_db = format!(
                "CREATE DATABASE IF NOT EXISTS {db}{}",
                on_cluster(&self.cfg.clickhouse.cluster)
            );
            info!("executing sql => {create_db}");
            conn.client().query(&create_db).execute().await?;

            let mut tables = vec![self.table_name.clone()];
            if !self.series_tbl.is_empty() && self.task.prometheus_schema {
                tables.push(self.series_tbl.clone());
            }
            tables.extend(self.dist_metric_tbls.iter().cloned());
            tables.extend(self.dist_series_tbls.iter().cloned());

            for tbl in &tables {
                let create_sql = self.gen_create_sql(conn.client(), tbl, db).await?;
                info!("executing sql => {create_sql}");
                conn.client()
                    .query(&create_sql)
                    .execute()
                    .await
                    .with_context(|| format!("failed to clone table {tbl} into {db}"))?;
            }
        }

        let (state, _) = self.build_state(db).await?;
        Ok(state)
    }

    /// Read the base table's DDL and rewrite it for the tenant database.
    async fn gen_create_sql(
        &self,
        client: &clickhouse::Client,
        table: &str,
        target_db: &str,
    ) -> Result<String> {
        let create_sql: String = client
            .query("SELECT create_table_query FROM system.tables WHERE database = ? AND table = ?")
            .bind(&self.base_db)
            .bind(table)
            .fetch_one()
            .await
            .with_context(|| format!("missing base table {}.{table}", self.base_db))?;
        Ok(rewrite_create_sql(
            &create_sql,
            &self.base_db,
            table,
            target_db,
            &self.cfg.clickhouse.cluster,
        ))
    }

    /// Apply dynamic `ADD COLUMN`s for freshly observed keys. Returns the
    /// number of columns added.
    pub async fn change_schema(
        &self,
        state: &DbState,
        new_keys: &BTreeMap<String, TypeCode>,
    ) -> Result<usize> {
        let (alter_series, alter_metric) = build_alter_clauses(
            &self.task,
            state.dims.len(),
            new_keys,
            &self.series_meta.dim_mgmt_id,
        )?;
        if alter_series.is_empty() && alter_metric.is_empty() {
            return Ok(0);
        }

        let conn = self.conn().await?;
        let version = server_version(conn.client()).await;
        let alter_sync = compare_clickhouse_version(&version, "23.3") >= std::cmp::Ordering::Equal;

        let added = alter_series.len() + alter_metric.len();
        if !alter_series.is_empty() {
            let columns = alter_series.join(",");
            self.alter_table(conn.client(), &state.db, &self.series_tbl, &columns, alter_sync)
                .await?;
            for dist in &self.dist_series_tbls {
                self.alter_table(conn.client(), &state.db, dist, &columns, alter_sync)
                    .await?;
            }
        }
        if !alter_metric.is_empty() {
            let columns = alter_metric.join(",");
            self.alter_table(conn.client(), &state.db, &self.table_name, &columns, alter_sync)
                .await?;
            for dist in &self.dist_metric_tbls {
                self.alter_table(conn.client(), &state.db, dist, &columns, alter_sync)
                    .await?;
            }
        }
        Ok(added)
    }

    async fn alter_table(
        &self,
        client: &clickhouse::Client,
        db: &str,
        table: &str,
        columns: &str,
        alter_sync: bool,
    ) -> Result<()> {
        let mut query = format!(
            "ALTER TABLE `{db}`.`{table}`{} {columns}",
            on_cluster(&self.cfg.clickhouse.cluster)
        );
        if alter_sync {
            query.push_str(" SETTINGS alter_sync = 0");
        }
        info!("executing sql => {query}");
        client
            .query(&query)
            .execute()
            .await
            .with_context(|| format!("ALTER TABLE {db}.{table} failed"))
    }

    /// For a `Replacing*` table without a configured sharding key, add a
    /// `__shardingkey` column holding the hash of the sorting-key tuple.
    async fn ensure_sharding_key(&mut self) -> Result<()> {
        if !self.task.sharding_key.is_empty() || self.task.prometheus_schema {
            return Ok(());
        }
        let conn = self.conn().await?;
        let engine: String = conn
            .client()
            .query("SELECT engine FROM system.tables WHERE database = ? AND table = ?")
            .bind(&self.base_db)
            .bind(&self.table_name)
            .fetch_one()
            .await
            .with_context(|| {
                format!(
                    "table {}.{} does not exist, please create it",
                    self.base_db, self.table_name
                )
            })?;
        if !engine.contains("Replacing") {
            return Ok(());
        }

        let rows: Vec<ColumnRow> = conn
            .client()
            .query(
                "SELECT name, type, default_kind FROM system.columns \
                 WHERE database = ? AND table = ? AND is_in_sorting_key = 1",
            )
            .bind(&self.base_db)
            .bind(&self.table_name)
            .fetch_all()
            .await?;
        for row in rows {
            let Some(typ) = TypeCode::from_clickhouse(&row.typ) else {
                continue;
            };
            self.sorting_keys.push(ColumnWithType::new(
                row.name.clone(),
                typ,
                get_source_name(&self.task.parser, &row.name),
            ));
        }
        info!(
            "task {}: sorting keys {:?}",
            self.task.name,
            self.sorting_keys.iter().map(|d| &d.name).collect::<Vec<_>>()
        );

        let version = server_version(conn.client()).await;
        let alter_sync = compare_clickhouse_version(&version, "23.3") >= std::cmp::Ordering::Equal;
        let clause = format!("ADD COLUMN IF NOT EXISTS `{SHARDING_KEY_COLUMN}` Int64");
        self.alter_table(conn.client(), &self.base_db, &self.table_name, &clause, alter_sync)
            .await?;
        for dist in &self.dist_metric_tbls {
            self.alter_table(conn.client(), &self.base_db, dist, &clause, alter_sync)
                .await?;
        }
        Ok(())
    }

    /// List distributed tables over `(db, table)`; the one in the local
    /// cluster must exist and sorts last.
    async fn require_dist_tbls(&self, db: &str, table: &str) -> Result<Vec<String>> {
        let cluster = &self.cfg.clickhouse.cluster;
        let conn = self.conn().await?;
        let pattern = format!("Distributed\\('.*', '{db}', '{table}'.*\\)");
        let rows: Vec<DistTblRow> = conn
            .client()
            .query(
                "SELECT name, (extractAllGroups(engine_full, \
                 '(Distributed\\(\\')(.*)\\',\\s+\\'(.*)\\',\\s+\\'(.*)\\'(.*)')[1])[2] AS cluster \
                 FROM system.tables WHERE engine = 'Distributed' AND database = ? \
                 AND match(engine_full, ?)",
            )
            .bind(db)
            .bind(&pattern)
            .fetch_all()
            .await?;

        let mut local = None;
        let mut tbls = Vec::new();
        for row in rows {
            if &row.cluster == cluster {
                local = Some(row.name);
            } else {
                // cross-cluster "logic" table, altered but not required
                tbls.push(row.name);
            }
        }
        let Some(local) = local else {
            bail!("please create a distributed table for {db}.{table} in cluster '{cluster}'");
        };
        tbls.push(local);
        Ok(tbls)
    }
}

fn on_cluster(cluster: &str) -> String {
    if cluster.is_empty() {
        String::new()
    } else {
        format!(" ON CLUSTER `{cluster}`")
    }
}

async fn server_version(client: &clickhouse::Client) -> String {
    client
        .query("SELECT version()")
        .fetch_one::<String>()
        .await
        .unwrap_or_else(|_| "1.0.0.0".to_owned())
}

/// Read the projected columns of a table from `system.columns`.
///
/// Materialized columns and excluded columns are skipped; alias columns
/// whose default expression names another column take that column's type.
pub async fn get_dims(
    client: &clickhouse::Client,
    db: &str,
    table: &str,
    exclude: &[String],
    db_key_template: &str,
    parser: &str,
) -> Result<Vec<ColumnWithType>> {
    let rows: Vec<ColumnRow> = client
        .query("SELECT name, type, default_kind FROM system.columns WHERE database = ? AND table = ?")
        .bind(db)
        .bind(table)
        .fetch_all()
        .await?;
    if rows.is_empty() {
        bail!("table {db}.{table} does not exist, please create it");
    }

    let referenced: Vec<ReferencedColumnRow> = client
        .query(
            "SELECT current_col.name, referenced_col.type AS referenced_type \
             FROM system.columns AS current_col \
             JOIN system.columns AS referenced_col \
             ON current_col.database = referenced_col.database \
             AND current_col.table = referenced_col.table \
             AND current_col.default_expression = referenced_col.name \
             WHERE current_col.database = ? AND current_col.table = ?",
        )
        .bind(db)
        .bind(table)
        .fetch_all()
        .await
        .unwrap_or_default();
    let referenced: std::collections::HashMap<String, String> = referenced
        .into_iter()
        .map(|r| (r.name, r.referenced_type))
        .collect();

    let mut dims = Vec::with_capacity(rows.len());
    for row in rows {
        if row.default_kind == "MATERIALIZED" || exclude.contains(&row.name) {
            continue;
        }
        let type_str = referenced.get(&row.name).unwrap_or(&row.typ);
        let Some(typ) = TypeCode::from_clickhouse(type_str) else {
            warn!("skipping column {db}.{table}.{} of unsupported type {type_str}", row.name);
            continue;
        };
        let mut col =
            ColumnWithType::new(row.name.clone(), typ, get_source_name(parser, &row.name));
        col.is_db_key = template_references(db_key_template, &col.name);
        dims.push(col);
    }
    Ok(dims)
}

/// Resolve the fixed leading columns of a series table.
fn series_meta_of(series_dims: &[ColumnWithType], db: &str, series_tbl: &str) -> Result<SeriesMeta> {
    let mut meta = SeriesMeta::default();
    for dim in series_dims {
        if dim.name.contains("series_id") {
            meta.dim_ser_id = dim.name.clone();
        }
        if dim.name.contains("mgmt_id") {
            meta.dim_mgmt_id = dim.name.clone();
        }
    }
    let bad_first = series_dims.len() < 3
        || series_dims[0].name != meta.dim_ser_id
        || series_dims[0].typ.code != TypeCode::Int64
        || series_dims[1].name != meta.dim_mgmt_id
        || series_dims[1].typ.code != TypeCode::Int64
        || series_dims[2].name != "labels"
        || series_dims[2].typ.code != TypeCode::String;
    if bad_first || meta.dim_ser_id.is_empty() || meta.dim_mgmt_id.is_empty() {
        bail!(
            "first columns of {db}.{series_tbl} are expected to be `<series_id> Int64, <mgmt_id> Int64, labels String`"
        );
    }
    // prometheus uses the internal __name__ label; opentsdb-style tables
    // carry the metric name in their first extra string column
    meta.name_key = "__name__".to_owned();
    for dim in &series_dims[3..] {
        if dim.typ.code == TypeCode::String {
            meta.name_key = dim.name.clone();
            break;
        }
    }
    Ok(meta)
}

/// Build the INSERT template. The HTTP protocol uses positional
/// placeholders; the native protocol carries the column list only and the
/// writer appends the rendered tuples.
pub fn build_insert_sql(
    protocol: &str,
    db: &str,
    table: &str,
    dims: &[ColumnWithType],
    num: usize,
) -> String {
    let quoted: Vec<String> = dims[..num].iter().map(|d| format!("`{}`", d.name)).collect();
    if protocol == "http" {
        let params = vec!["?"; num];
        format!(
            "INSERT INTO `{db}`.`{table}` ({}) VALUES ({})",
            quoted.join(","),
            params.join(",")
        )
    } else {
        format!("INSERT INTO `{db}`.`{table}` ({})", quoted.join(","))
    }
}

/// Rewrite a base table's `create_table_query` for a tenant database:
/// qualified name, ZooKeeper path and the Distributed engine's database
/// argument.
pub fn rewrite_create_sql(
    create_sql: &str,
    base_db: &str,
    table: &str,
    target_db: &str,
    cluster: &str,
) -> String {
    let head = format!(
        "CREATE TABLE IF NOT EXISTS {target_db}.{table}{}",
        on_cluster(cluster)
    );
    let mut sql = CREATE_TABLE_RE.replace(create_sql, head.as_str()).into_owned();
    sql = sql.replace(
        &format!("/clickhouse/tables/{{cluster}}/{base_db}/"),
        &format!("/clickhouse/tables/{{cluster}}/{target_db}/"),
    );
    if sql.contains("Distributed") {
        sql = sql.replace(
            &format!("Distributed('{cluster}', '{base_db}'"),
            &format!("Distributed('{cluster}', '{target_db}'"),
        );
        sql = DIST_ENGINE_RE
            .replace_all(&sql, |caps: &regex::Captures<'_>| {
                format!("{}{target_db}{}", &caps[1], &caps[2])
            })
            .into_owned();
    }
    sql
}

/// ClickHouse type for a dynamically added column.
fn ddl_type(code: TypeCode, not_nullable: bool) -> String {
    let base = match code {
        TypeCode::Bool => "Bool",
        TypeCode::Int64 => "Int64",
        TypeCode::Float64 => "Float64",
        TypeCode::String => "String",
        TypeCode::DateTime => "DateTime64(3)",
        TypeCode::Object => "Object('json')",
    };
    if not_nullable {
        base.to_owned()
    } else {
        format!("Nullable({base})")
    }
}

/// Assemble `ADD COLUMN` clauses for the series and metric tables,
/// honoring the `max_dims` budget and the Prometheus routing rules.
fn build_alter_clauses(
    task: &TaskSettings,
    current_dims: usize,
    new_keys: &BTreeMap<String, TypeCode>,
    dim_mgmt_id: &str,
) -> Result<(Vec<String>, Vec<String>)> {
    let max_dims = task.dynamic_schema.max_dims;
    let quota = max_dims.saturating_sub(current_dims);
    if quota == 0 {
        warn!(
            "task {}: number of columns reaches the limit of {max_dims}, dropping {} new keys",
            task.name,
            new_keys.len()
        );
        return Ok((Vec::new(), Vec::new()));
    }

    let mut alter_series = Vec::new();
    let mut alter_metric = Vec::new();
    for (i, (key, code)) in new_keys.iter().enumerate() {
        if i >= quota {
            warn!(
                "task {}: number of columns reaches the limit of {max_dims}, dropping {} new keys",
                task.name,
                new_keys.len() - i
            );
            break;
        }
        let typ = ddl_type(*code, task.dynamic_schema.not_nullable);
        let clause = format!("ADD COLUMN IF NOT EXISTS `{key}` {typ}");
        if task.prometheus_schema {
            match code {
                TypeCode::String => alter_series.push(clause),
                // metric values are numeric; the mgmt id is a fixed
                // series column and never re-added
                TypeCode::Float64 => alter_metric.push(clause),
                TypeCode::Int64 if key != dim_mgmt_id => alter_metric.push(clause),
                TypeCode::Int64 | TypeCode::Bool => {}
                TypeCode::DateTime | TypeCode::Object => bail!(
                    "task {}: unsupported metric value type {typ} for key {key}",
                    task.name
                ),
            }
        } else {
            alter_metric.push(clause);
        }
    }
    alter_series.sort();
    alter_metric.sort();
    Ok((alter_series, alter_metric))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ColumnType;

    fn col(name: &str, code: TypeCode) -> ColumnWithType {
        ColumnWithType::new(name, ColumnType::plain(code), name)
    }

    #[test]
    fn insert_sql_http_and_native() {
        let dims = vec![
            col("level", TypeCode::String),
            col("timestamp", TypeCode::DateTime),
            col("message", TypeCode::String),
        ];
        assert_eq!(
            build_insert_sql("http", "logs", "app", &dims, 3),
            "INSERT INTO `logs`.`app` (`level`,`timestamp`,`message`) VALUES (?,?,?)"
        );
        assert_eq!(
            build_insert_sql("native", "logs", "app", &dims, 3),
            "INSERT INTO `logs`.`app` (`level`,`timestamp`,`message`)"
        );
        // a prometheus task only inserts the metric prefix
        assert_eq!(
            build_insert_sql("native", "logs", "app", &dims, 2),
            "INSERT INTO `logs`.`app` (`level`,`timestamp`)"
        );
    }

    #[test]
    fn create_sql_rewrite_replicated() {
        let base = "CREATE TABLE metrics.cpu (`ts` DateTime, `v` Float64) \
                    ENGINE = ReplicatedReplacingMergeTree('/clickhouse/tables/{cluster}/metrics/cpu', '{replica}') \
                    ORDER BY ts";
        let sql = rewrite_create_sql(base, "metrics", "cpu", "acme_db", "main");
        assert!(sql.starts_with(
            "CREATE TABLE IF NOT EXISTS acme_db.cpu ON CLUSTER `main` (`ts` DateTime"
        ));
        assert!(sql.contains("/clickhouse/tables/{cluster}/acme_db/cpu"));
    }

    #[test]
    fn create_sql_rewrite_distributed() {
        let base = "CREATE TABLE metrics.dist_cpu (`ts` DateTime, `v` Float64) \
                    ENGINE = Distributed('main', 'metrics', 'cpu', rand())";
        let sql = rewrite_create_sql(base, "metrics", "dist_cpu", "acme_db", "main");
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS acme_db.dist_cpu ON CLUSTER `main`"));
        assert!(sql.contains("Distributed('main', 'acme_db', 'cpu', rand())"), "{sql}");
    }

    #[test]
    fn series_meta_detection() {
        let dims = vec![
            col("__series_id__", TypeCode::Int64),
            col("__mgmt_id__", TypeCode::Int64),
            col("labels", TypeCode::String),
            col("metric", TypeCode::String),
        ];
        let meta = series_meta_of(&dims, "db", "tbl_series").unwrap();
        assert_eq!(meta.dim_ser_id, "__series_id__");
        assert_eq!(meta.dim_mgmt_id, "__mgmt_id__");
        // opentsdb-style: first extra string column names the metric
        assert_eq!(meta.name_key, "metric");

        let three = &dims[..3];
        let meta = series_meta_of(three, "db", "tbl_series").unwrap();
        assert_eq!(meta.name_key, "__name__");

        let bad = vec![col("labels", TypeCode::String)];
        assert!(series_meta_of(&bad, "db", "tbl_series").is_err());
    }

    fn task_with(prom: bool, not_nullable: bool, max_dims: usize) -> TaskSettings {
        let mut task = TaskSettings {
            name: "t".into(),
            prometheus_schema: prom,
            ..TaskSettings::default()
        };
        task.dynamic_schema.not_nullable = not_nullable;
        task.dynamic_schema.max_dims = max_dims;
        task
    }

    #[test]
    fn alter_clauses_plain_task() {
        let task = task_with(false, false, 10);
        let mut keys = BTreeMap::new();
        keys.insert("c".to_owned(), TypeCode::Float64);
        keys.insert("b".to_owned(), TypeCode::DateTime);
        keys.insert("a".to_owned(), TypeCode::Object);
        let (series, metric) = build_alter_clauses(&task, 2, &keys, "").unwrap();
        assert!(series.is_empty());
        assert_eq!(
            metric,
            vec![
                "ADD COLUMN IF NOT EXISTS `a` Nullable(Object('json'))",
                "ADD COLUMN IF NOT EXISTS `b` Nullable(DateTime64(3))",
                "ADD COLUMN IF NOT EXISTS `c` Nullable(Float64)",
            ]
        );
    }

    #[test]
    fn alter_clauses_prometheus_routing() {
        let task = task_with(true, true, 100);
        let mut keys = BTreeMap::new();
        keys.insert("device".to_owned(), TypeCode::String);
        keys.insert("value2".to_owned(), TypeCode::Float64);
        keys.insert("count2".to_owned(), TypeCode::Int64);
        keys.insert("__mgmt_id__".to_owned(), TypeCode::Int64);
        let (series, metric) = build_alter_clauses(&task, 5, &keys, "__mgmt_id__").unwrap();
        assert_eq!(series, vec!["ADD COLUMN IF NOT EXISTS `device` String"]);
        assert_eq!(
            metric,
            vec![
                "ADD COLUMN IF NOT EXISTS `count2` Int64",
                "ADD COLUMN IF NOT EXISTS `value2` Float64",
            ]
        );

        // non-numeric metric keys are rejected in prometheus mode
        let mut keys = BTreeMap::new();
        keys.insert("when".to_owned(), TypeCode::DateTime);
        assert!(build_alter_clauses(&task, 5, &keys, "__mgmt_id__").is_err());
    }

    #[test]
    fn alter_clauses_respect_max_dims() {
        let task = task_with(false, false, 3);
        let mut keys = BTreeMap::new();
        for name in ["k1", "k2", "k3", "k4"] {
            keys.insert(name.to_owned(), TypeCode::Int64);
        }
        let (_, metric) = build_alter_clauses(&task, 2, &keys, "").unwrap();
        assert_eq!(metric.len(), 1);

        let (_, metric) = build_alter_clauses(&task, 3, &keys, "").unwrap();
        assert!(metric.is_empty());
    }
}
