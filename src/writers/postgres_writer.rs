//! `postgres_writer`: statistics rows inserted into a PostgreSQL table

use async_trait::async_trait;
use chrono::{DateTime, Local};
use regex::Regex;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::{check_kwargs, Kwargs, ResultWriter, RunInfo};
use crate::error::{ProbeError, Result};
use crate::stats::StatisticsRecord;

pub const NAME: &str = "postgres_writer";
pub const DESCRIPTION: &str = "Inserts results into a PostgreSQL table.";
pub const DEFAULT_TABLE: &str = "query_stats";

pub struct PostgresWriter {
    database_url: String,
    table: String,
    pool: Option<PgPool>,
    run_id: Option<Uuid>,
}

impl PostgresWriter {
    pub fn new(database_url: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        let ident = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$")
            .map_err(|e| ProbeError::Config(e.to_string()))?;
        if !ident.is_match(&table) {
            return Err(ProbeError::Config(format!(
                "postgres_writer table must be a plain identifier, got '{}'",
                table
            )));
        }
        Ok(Self {
            database_url: database_url.into(),
            table,
            pool: None,
            run_id: None,
        })
    }

    /// kwargs `url` (else `DATABASE_URL`) and `table`
    pub fn from_kwargs(kwargs: &Kwargs) -> Result<Box<dyn ResultWriter>> {
        check_kwargs(NAME, kwargs, &["url", "table"])?;
        let url = match kwargs.get("url") {
            Some(url) => url.clone(),
            None => std::env::var("DATABASE_URL").map_err(|_| {
                ProbeError::Config("postgres_writer needs a url argument or DATABASE_URL".into())
            })?,
        };
        let table = kwargs
            .get("table")
            .cloned()
            .unwrap_or_else(|| DEFAULT_TABLE.to_string());
        Ok(Box::new(Self::new(url, table)?))
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn create_table_sql(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id UUID PRIMARY KEY,
                run_id UUID NOT NULL,
                name TEXT NOT NULL,
                base_name TEXT NOT NULL,
                service_kind TEXT NOT NULL,
                access_url TEXT NOT NULL,
                start_time TIMESTAMPTZ,
                end_time TIMESTAMPTZ,
                ra DOUBLE PRECISION,
                dec DOUBLE PRECISION,
                sr DOUBLE PRECISION,
                adql TEXT,
                do_query_duration DOUBLE PRECISION,
                stream_to_file_duration DOUBLE PRECISION,
                query_total_duration DOUBLE PRECISION,
                status INTEGER,
                size BIGINT,
                num_rows BIGINT,
                num_columns BIGINT,
                errmsg TEXT NOT NULL,
                row_values JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.table
        )
    }

    fn insert_sql(&self) -> String {
        format!(
            r#"
            INSERT INTO {} (
                id, run_id, name, base_name, service_kind, access_url,
                start_time, end_time, ra, dec, sr, adql,
                do_query_duration, stream_to_file_duration, query_total_duration,
                status, size, num_rows, num_columns, errmsg, row_values
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                      $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
            self.table
        )
    }
}

fn meta_i64(stats: &StatisticsRecord, key: &str) -> Option<i64> {
    stats.result_meta(key).and_then(Value::as_i64)
}

#[async_trait]
impl ResultWriter for PostgresWriter {
    fn name(&self) -> &str {
        NAME
    }

    async fn begin(&mut self, run: &RunInfo) -> Result<()> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&self.database_url)
            .await
            .map_err(|e| ProbeError::DatabaseError(format!("Failed to connect: {}", e)))?;

        sqlx::query(&self.create_table_sql()).execute(&pool).await?;

        info!(table = %self.table, "Database writer ready");
        self.pool = Some(pool);
        self.run_id = Some(run.run_id);
        Ok(())
    }

    async fn one_result(&mut self, stats: &StatisticsRecord) -> Result<()> {
        let (Some(pool), Some(run_id)) = (&self.pool, self.run_id) else {
            return Err(ProbeError::Config("postgres_writer used before begin".into()));
        };

        let params = stats.params();
        let start: Option<DateTime<Local>> = stats.start_time();
        let end: Option<DateTime<Local>> = stats.end_time();

        sqlx::query(&self.insert_sql())
            .bind(Uuid::new_v4())
            .bind(run_id)
            .bind(stats.name())
            .bind(stats.base_name())
            .bind(stats.service_kind().as_str())
            .bind(stats.access_url())
            .bind(start)
            .bind(end)
            .bind(params.ra)
            .bind(params.dec)
            .bind(params.sr)
            .bind(params.adql.as_deref())
            .bind(stats.do_query_duration())
            .bind(stats.stream_to_file_duration())
            .bind(stats.query_total_duration())
            .bind(meta_i64(stats, "status").map(|s| s as i32))
            .bind(meta_i64(stats, "size"))
            .bind(meta_i64(stats, "num_rows"))
            .bind(meta_i64(stats, "num_columns"))
            .bind(stats.errmsg())
            .bind(Json(Value::Object(stats.row_values())))
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_validation() {
        assert!(PostgresWriter::new("postgres://localhost/db", "query_stats").is_ok());
        assert!(PostgresWriter::new("postgres://localhost/db", "_stats2").is_ok());
        assert!(PostgresWriter::new("postgres://localhost/db", "stats; DROP TABLE x").is_err());
        assert!(PostgresWriter::new("postgres://localhost/db", "1stats").is_err());
        assert!(PostgresWriter::new("postgres://localhost/db", "").is_err());
    }

    #[test]
    fn test_sql_uses_table() {
        let writer = PostgresWriter::new("postgres://localhost/db", "probe_runs").unwrap();
        assert!(writer.create_table_sql().contains("CREATE TABLE IF NOT EXISTS probe_runs"));
        assert!(writer.insert_sql().contains("INSERT INTO probe_runs"));
        assert!(writer.insert_sql().contains("$21"));
    }

    #[test]
    fn test_kwargs() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("url".into(), "postgres://localhost/db".into());
        kwargs.insert("table".into(), "t1".into());
        assert!(PostgresWriter::from_kwargs(&kwargs).is_ok());

        kwargs.insert("table".into(), "bad-name".into());
        assert!(PostgresWriter::from_kwargs(&kwargs).is_err());

        kwargs.remove("table");
        kwargs.insert("schema".into(), "x".into());
        assert!(PostgresWriter::from_kwargs(&kwargs).is_err());
    }
}
