use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Metadata extracted from one bag directory, shaped for insertion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BagMetadata {
    pub file_path: String,
    pub file_name: String,
    pub file_type: String,
    pub map_category: String,
    pub start_time: String,
    pub end_time: String,
    pub duration: f64,
    pub size_mb: f64,
    pub message_count: i64,
    pub topic_count: i64,
    pub topics_json: String,
    pub metadata_json: String,
}

/// A bag row as read back from the store. `topics` and `metadata` are the
/// decoded forms of the persisted JSON columns.
#[derive(Debug, Clone, Serialize)]
pub struct BagRecord {
    pub id: i64,
    pub file_path: String,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub map_category: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub duration: Option<f64>,
    pub size_mb: Option<f64>,
    pub message_count: Option<i64>,
    pub topic_count: Option<i64>,
    pub topics: serde_json::Value,
    pub metadata: serde_json::Value,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub bag_count: i64,
    pub column_count: i64,
}

const FIXED_INSERT_COLUMNS: [&str; 12] = [
    "file_path",
    "file_name",
    "file_type",
    "map_category",
    "start_time",
    "end_time",
    "duration",
    "size_mb",
    "message_count",
    "topic_count",
    "topics_json",
    "metadata_json",
];

const SELECT_COLUMNS: &str = "id, file_path, file_name, file_type, map_category, start_time, \
     end_time, duration, size_mb, message_count, topic_count, topics_json, metadata_json, \
     created_at";

#[derive(Debug, Clone)]
pub struct BagStore {
    db_path: PathBuf,
}

impl BagStore {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Insert or update a bag row. Additional metadata keys get their own
    /// columns, added on first sight with a type inferred from the value.
    pub fn insert_bag(&self, bag: &BagMetadata) -> Result<()> {
        let additional: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&bag.metadata_json).unwrap_or_default();

        self.with_connection(|conn| {
            for (key, value) in &additional {
                add_column_if_not_exists(conn, key, sqlite_type_for(value))?;
            }

            let mut columns: Vec<String> = FIXED_INSERT_COLUMNS
                .iter()
                .map(|name| name.to_string())
                .collect();
            let mut values: Vec<SqlValue> = vec![
                SqlValue::Text(bag.file_path.clone()),
                SqlValue::Text(bag.file_name.clone()),
                SqlValue::Text(bag.file_type.clone()),
                SqlValue::Text(bag.map_category.clone()),
                SqlValue::Text(bag.start_time.clone()),
                SqlValue::Text(bag.end_time.clone()),
                SqlValue::Real(bag.duration),
                SqlValue::Real(bag.size_mb),
                SqlValue::Integer(bag.message_count),
                SqlValue::Integer(bag.topic_count),
                SqlValue::Text(bag.topics_json.clone()),
                SqlValue::Text(bag.metadata_json.clone()),
            ];
            for (key, value) in &additional {
                columns.push(key.clone());
                values.push(sql_value_for(value));
            }

            let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
            let updates: Vec<String> = columns
                .iter()
                .filter(|name| name.as_str() != "file_path")
                .map(|name| format!("{name} = excluded.{name}"))
                .collect();

            let sql = format!(
                "INSERT INTO rosbags ({}) VALUES ({}) ON CONFLICT(file_path) DO UPDATE SET {}",
                columns.join(", "),
                placeholders.join(", "),
                updates.join(", "),
            );

            conn.execute(&sql, params_from_iter(values))
                .with_context(|| format!("failed to upsert bag row: {}", bag.file_path))?;

            debug!(file_path = %bag.file_path, "stored bag metadata");
            Ok(())
        })
    }

    pub fn bag_by_path(&self, file_path: &str) -> Result<Option<BagRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM rosbags WHERE file_path = ?1"
            ))?;
            let mut rows = stmt.query_map(params![file_path], row_to_record)?;
            match rows.next() {
                Some(row) => Ok(Some(row?)),
                None => Ok(None),
            }
        })
    }

    pub fn all_bags(&self) -> Result<Vec<BagRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM rosbags ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map([], row_to_record)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read bag rows")
        })
    }

    pub fn bags_by_category(&self, category: &str) -> Result<Vec<BagRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM rosbags WHERE map_category = ?1 \
                 ORDER BY created_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![category], row_to_record)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read bag rows by category")
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.with_connection(|conn| {
            let bag_count: i64 = conn
                .query_row("SELECT COUNT(*) FROM rosbags", [], |row| row.get(0))
                .context("failed to count bag rows")?;
            let column_count = existing_columns(conn)?.len() as i64;
            Ok(StoreStats {
                bag_count,
                column_count,
            })
        })
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS rosbags (
                    id INTEGER PRIMARY KEY,
                    file_path TEXT NOT NULL UNIQUE,
                    file_name TEXT,
                    file_type TEXT,
                    map_category TEXT,
                    start_time TEXT,
                    end_time TEXT,
                    duration REAL,
                    size_mb REAL,
                    message_count INTEGER,
                    topic_count INTEGER,
                    topics_json TEXT,
                    metadata_json TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                 );
                 CREATE INDEX IF NOT EXISTS idx_rosbags_map_category ON rosbags(map_category);",
            )
            .with_context(|| {
                format!(
                    "failed to initialize bag store schema: {}",
                    self.db_path.display()
                )
            })?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open bag store: {}", self.db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("failed to set bag store busy timeout")?;
        op(&conn)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<BagRecord> {
    let topics_json: Option<String> = row.get(11)?;
    let metadata_json: Option<String> = row.get(12)?;

    Ok(BagRecord {
        id: row.get(0)?,
        file_path: row.get(1)?,
        file_name: row.get(2)?,
        file_type: row.get(3)?,
        map_category: row.get(4)?,
        start_time: row.get(5)?,
        end_time: row.get(6)?,
        duration: row.get(7)?,
        size_mb: row.get(8)?,
        message_count: row.get(9)?,
        topic_count: row.get(10)?,
        topics: decode_json_column(topics_json.as_deref()),
        metadata: decode_json_column(metadata_json.as_deref()),
        created_at: row.get(13)?,
    })
}

fn decode_json_column(raw: Option<&str>) -> serde_json::Value {
    raw.and_then(|encoded| serde_json::from_str(encoded).ok())
        .unwrap_or(serde_json::Value::Null)
}

fn existing_columns(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info('rosbags')")
        .context("failed to inspect rosbags columns")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    names
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to collect rosbags columns")
}

fn add_column_if_not_exists(conn: &Connection, column_name: &str, data_type: &str) -> Result<bool> {
    if !is_valid_column_name(column_name) {
        bail!("invalid dynamic column name: {column_name}");
    }

    let columns = existing_columns(conn)?;
    if columns.iter().any(|existing| existing == column_name) {
        return Ok(false);
    }

    conn.execute(
        &format!("ALTER TABLE rosbags ADD COLUMN {column_name} {data_type}"),
        [],
    )
    .with_context(|| format!("failed to add column: {column_name}"))?;
    info!(column = column_name, data_type, "added dynamic metadata column");
    Ok(true)
}

/// Dynamic column names come from bag metadata keys; only plain
/// identifiers are allowed into the schema.
fn is_valid_column_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn sqlite_type_for(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Number(number) if number.is_i64() || number.is_u64() => "INTEGER",
        serde_json::Value::Number(_) => "REAL",
        serde_json::Value::Bool(_) => "INTEGER",
        _ => "TEXT",
    }
}

fn sql_value_for(value: &serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        serde_json::Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                SqlValue::Integer(integer)
            } else {
                SqlValue::Real(number.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bag(path: &str, category: &str) -> BagMetadata {
        BagMetadata {
            file_path: path.to_string(),
            file_name: "run_0.db3".to_string(),
            file_type: "db3".to_string(),
            map_category: category.to_string(),
            start_time: "2023-01-01-00-00-00".to_string(),
            end_time: "2023-01-01-00-00-17".to_string(),
            duration: 17.5,
            size_mb: 42.0,
            message_count: 4200,
            topic_count: 2,
            topics_json: r#"[{"name":"/vehicle/odom","message_type":"nav_msgs/msg/Odometry","message_count":1750}]"#.to_string(),
            metadata_json: r#"{"topic__vehicle_odom_count":1750}"#.to_string(),
        }
    }

    fn temp_store() -> (tempfile::TempDir, BagStore) {
        let temp = tempfile::tempdir().expect("temp dir should be created");
        let store = BagStore::new(&temp.path().join("bags.db")).expect("store should initialize");
        (temp, store)
    }

    #[test]
    fn insert_and_fetch_roundtrip() {
        let (_temp, store) = temp_store();
        store.insert_bag(&sample_bag("/bags/skidpad/run_0", "skidpad")).unwrap();

        let record = store
            .bag_by_path("/bags/skidpad/run_0")
            .unwrap()
            .expect("record should exist");
        assert_eq!(record.file_path, "/bags/skidpad/run_0");
        assert_eq!(record.map_category.as_deref(), Some("skidpad"));
        assert_eq!(record.message_count, Some(4200));
        assert_eq!(record.topics[0]["name"], "/vehicle/odom");
        assert_eq!(record.metadata["topic__vehicle_odom_count"], 1750);
        assert!(record.created_at.is_some());
    }

    #[test]
    fn missing_path_returns_none() {
        let (_temp, store) = temp_store();
        assert!(store.bag_by_path("/nope").unwrap().is_none());
    }

    #[test]
    fn reinsert_updates_existing_row() {
        let (_temp, store) = temp_store();
        store.insert_bag(&sample_bag("/bags/autox/run_1", "autox")).unwrap();

        let mut updated = sample_bag("/bags/autox/run_1", "autox");
        updated.message_count = 9000;
        store.insert_bag(&updated).unwrap();

        let all = store.all_bags().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].message_count, Some(9000));
    }

    #[test]
    fn dynamic_columns_added_once() {
        let (_temp, store) = temp_store();
        let before = store.stats().unwrap().column_count;

        store.insert_bag(&sample_bag("/bags/skidpad/run_0", "skidpad")).unwrap();
        let after_first = store.stats().unwrap().column_count;
        assert_eq!(after_first, before + 1);

        store.insert_bag(&sample_bag("/bags/skidpad/run_1", "skidpad")).unwrap();
        let after_second = store.stats().unwrap().column_count;
        assert_eq!(after_second, after_first);
    }

    #[test]
    fn dynamic_column_type_follows_value() {
        assert_eq!(sqlite_type_for(&serde_json::json!(5)), "INTEGER");
        assert_eq!(sqlite_type_for(&serde_json::json!(2.5)), "REAL");
        assert_eq!(sqlite_type_for(&serde_json::json!("text")), "TEXT");
        assert_eq!(sqlite_type_for(&serde_json::json!([1, 2])), "TEXT");
        assert_eq!(sqlite_type_for(&serde_json::json!(true)), "INTEGER");
    }

    #[test]
    fn malformed_metadata_key_is_rejected() {
        let (_temp, store) = temp_store();
        let mut bag = sample_bag("/bags/skidpad/run_0", "skidpad");
        bag.metadata_json = r#"{"bad-key; DROP TABLE rosbags": 1}"#.to_string();

        let err = store.insert_bag(&bag).unwrap_err().to_string();
        assert!(err.contains("invalid dynamic column name"), "unexpected error: {err}");
    }

    #[test]
    fn bags_by_category_filters() {
        let (_temp, store) = temp_store();
        store.insert_bag(&sample_bag("/bags/skidpad/run_0", "skidpad")).unwrap();
        store.insert_bag(&sample_bag("/bags/autox/run_1", "autox")).unwrap();

        let skidpad = store.bags_by_category("skidpad").unwrap();
        assert_eq!(skidpad.len(), 1);
        assert_eq!(skidpad[0].file_path, "/bags/skidpad/run_0");

        assert!(store.bags_by_category("acceleration").unwrap().is_empty());
    }

    #[test]
    fn stats_counts_rows_and_columns() {
        let (_temp, store) = temp_store();
        let initial = store.stats().unwrap();
        assert_eq!(initial.bag_count, 0);
        // 14 fixed columns before any dynamic ones
        assert_eq!(initial.column_count, 14);

        store.insert_bag(&sample_bag("/bags/skidpad/run_0", "skidpad")).unwrap();
        let after = store.stats().unwrap();
        assert_eq!(after.bag_count, 1);
        assert_eq!(after.column_count, 15);
    }

    #[test]
    fn column_name_validation() {
        assert!(is_valid_column_name("topic__vehicle_odom_count"));
        assert!(is_valid_column_name("_leading"));
        assert!(!is_valid_column_name("1starts_with_digit"));
        assert!(!is_valid_column_name("has space"));
        assert!(!is_valid_column_name(""));
        assert!(!is_valid_column_name("semi;colon"));
    }
}
