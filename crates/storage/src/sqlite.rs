//! SQLite repository
//!
//! Layout:
//! - `obd`: one REAL column per logged value plus `time` and `trip`
//! - `trip`: `tripid`, `start`, `end` (-1 while the trip is open)
//!
//! Opening an existing database adds any missing value columns, so the
//! logged column set can grow between runs without losing rows.

use crate::sink::{Sample, SampleSink, TripRecord};
use crate::StorageError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use tracing::{debug, info};

/// Columns every `obd` row carries regardless of configuration
const FIXED_COLUMNS: [&str; 2] = ["time", "trip"];

fn validate_column(name: &str) -> Result<(), StorageError> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !FIXED_COLUMNS.contains(&name);
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidColumn(name.to_string()))
    }
}

/// Repository backed by a SQLite database file
pub struct SqliteRepository {
    pool: SqlitePool,
    columns: Vec<String>,
}

impl SqliteRepository {
    /// Open or create the database at `path` with room for `columns`
    pub async fn open(path: impl AsRef<Path>, columns: &[&str]) -> Result<Self, StorageError> {
        let path = path.as_ref();
        info!("Opening database {}", path.display());

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, columns).await
    }

    /// Database that lives as long as the repository
    pub async fn in_memory(columns: &[&str]) -> Result<Self, StorageError> {
        let options: SqliteConnectOptions = "sqlite::memory:".parse()?;
        // A second connection would see a different, empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, columns).await
    }

    async fn with_pool(pool: SqlitePool, columns: &[&str]) -> Result<Self, StorageError> {
        for column in columns {
            validate_column(column)?;
        }
        let repo = Self {
            pool,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        };
        repo.create_schema().await?;
        Ok(repo)
    }

    async fn create_schema(&self) -> Result<(), StorageError> {
        let existing = self.column_names().await?;

        if existing.is_empty() {
            let mut defs: Vec<String> = self.columns.iter().map(|c| format!("{} REAL", c)).collect();
            defs.push("time REAL".to_string());
            defs.push("trip INTEGER".to_string());
            let sql = format!("CREATE TABLE obd ({})", defs.join(", "));
            debug!("{}", sql);
            sqlx::query(&sql).execute(&self.pool).await?;
        } else {
            for column in self.columns.iter().filter(|c| !existing.contains(c)) {
                info!("Adding column {} to obd table", column);
                let sql = format!("ALTER TABLE obd ADD {} REAL", column);
                sqlx::query(&sql).execute(&self.pool).await?;
            }
        }

        sqlx::query("CREATE INDEX IF NOT EXISTS IDX_OBDTIME ON obd (time)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS IDX_OBDTRIP ON obd (trip)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS trip (tripid INTEGER PRIMARY KEY, start REAL, "end" REAL DEFAULT -1)"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Columns currently present in the `obd` table, fixed ones included
    pub async fn column_names(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("PRAGMA table_info(obd)")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(StorageError::from))
            .collect()
    }

    pub async fn sample_count(&self) -> Result<i64, StorageError> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM obd")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn trips(&self) -> Result<Vec<TripRecord>, StorageError> {
        let rows = sqlx::query_as::<_, (i64, f64, f64)>(
            r#"SELECT tripid, start, "end" FROM trip ORDER BY tripid"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, start, end)| TripRecord { id, start, end })
            .collect())
    }

    /// Values of `column` for one trip, oldest first. Unlogged values are `None`.
    pub async fn column_values(
        &self,
        column: &str,
        trip: i64,
    ) -> Result<Vec<Option<f64>>, StorageError> {
        validate_column(column)?;
        let sql = format!("SELECT {} FROM obd WHERE trip = ? ORDER BY time", column);
        Ok(sqlx::query_scalar::<_, Option<f64>>(&sql)
            .bind(trip)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Flush and close every connection
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SampleSink for SqliteRepository {
    async fn start_trip(&self, start: f64) -> Result<i64, StorageError> {
        let result = sqlx::query("INSERT INTO trip (start) VALUES (?)")
            .bind(start)
            .execute(&self.pool)
            .await?;
        let id = result.last_insert_rowid();
        info!("Started trip {}", id);
        Ok(id)
    }

    async fn update_trip_end(&self, trip: i64, end: f64) -> Result<(), StorageError> {
        let result = sqlx::query(r#"UPDATE trip SET "end" = ? WHERE tripid = ?"#)
            .bind(end)
            .bind(trip)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn insert_sample(&self, sample: &Sample) -> Result<(), StorageError> {
        let names: Vec<&str> = self
            .columns
            .iter()
            .map(String::as_str)
            .chain(FIXED_COLUMNS)
            .collect();
        let placeholders = vec!["?"; names.len()].join(",");
        let sql = format!(
            "INSERT INTO obd ({}) VALUES ({})",
            names.join(","),
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for column in &self.columns {
            query = query.bind(sample.values.get(column).copied());
        }
        query
            .bind(sample.time)
            .bind(sample.trip)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(time: f64, trip: i64, values: &[(&str, f64)]) -> Sample {
        Sample {
            values: values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            time,
            trip,
        }
    }

    #[tokio::test]
    async fn test_schema_created() {
        let repo = SqliteRepository::in_memory(&["rpm", "vss"]).await.unwrap();
        let columns = repo.column_names().await.unwrap();
        assert_eq!(columns, vec!["rpm", "vss", "time", "trip"]);
        assert_eq!(repo.sample_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_column_rejected() {
        for bad in ["rpm; DROP TABLE obd", "1rpm", "", "time"] {
            assert!(matches!(
                SqliteRepository::in_memory(&[bad]).await,
                Err(StorageError::InvalidColumn(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_trip_lifecycle() {
        let repo = SqliteRepository::in_memory(&["rpm"]).await.unwrap();
        let trip = repo.start_trip(1000.0).await.unwrap();

        let trips = repo.trips().await.unwrap();
        assert_eq!(trips, vec![TripRecord { id: trip, start: 1000.0, end: -1.0 }]);

        repo.update_trip_end(trip, 1060.5).await.unwrap();
        assert_eq!(repo.trips().await.unwrap()[0].end, 1060.5);

        assert!(matches!(
            repo.update_trip_end(trip + 1, 1.0).await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_insert_with_missing_values() {
        let repo = SqliteRepository::in_memory(&["rpm", "vss"]).await.unwrap();
        let trip = repo.start_trip(0.0).await.unwrap();

        repo.insert_sample(&sample(1.0, trip, &[("rpm", 800.0), ("vss", 0.0)]))
            .await
            .unwrap();
        repo.insert_sample(&sample(2.0, trip, &[("rpm", 1664.0)]))
            .await
            .unwrap();

        assert_eq!(repo.sample_count().await.unwrap(), 2);
        assert_eq!(
            repo.column_values("rpm", trip).await.unwrap(),
            vec![Some(800.0), Some(1664.0)]
        );
        assert_eq!(
            repo.column_values("vss", trip).await.unwrap(),
            vec![Some(0.0), None]
        );
    }

    #[tokio::test]
    async fn test_reopen_adds_columns() {
        let path = std::env::temp_dir().join(format!(
            "obd-storage-test-{}-{}.db",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));

        let repo = SqliteRepository::open(&path, &["rpm"]).await.unwrap();
        let trip = repo.start_trip(0.0).await.unwrap();
        repo.insert_sample(&sample(1.0, trip, &[("rpm", 900.0)]))
            .await
            .unwrap();
        repo.close().await;

        let repo = SqliteRepository::open(&path, &["rpm", "temp"]).await.unwrap();
        let columns = repo.column_names().await.unwrap();
        assert!(columns.contains(&"temp".to_string()));
        assert_eq!(repo.sample_count().await.unwrap(), 1);
        assert_eq!(repo.column_values("temp", trip).await.unwrap(), vec![None]);
        assert_eq!(repo.trips().await.unwrap().len(), 1);
        repo.close().await;

        let _ = std::fs::remove_file(&path);
    }
}
