#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use burp2caido_core::HistoryEntry;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

pub const MAIN_DATABASE_FILE: &str = "database.caido";
pub const RAW_DATABASE_FILE: &str = "database_raw.caido";

const INTERCEPT_SOURCE: &str = "intercept";
const NO_ALTERATION: &str = "none";
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const RAW_TABLES: &[(&str, &[&str])] = &[
    ("requests_raw", &["id", "data", "source", "alteration"]),
    ("responses_raw", &["id", "data", "source", "alteration"]),
];

const MAIN_TABLES: &[(&str, &[&str])] = &[
    (
        "responses",
        &[
            "id",
            "status_code",
            "raw_id",
            "length",
            "alteration",
            "edited",
            "roundtrip_time",
            "created_at",
        ],
    ),
    ("requests_metadata", &["id"]),
    (
        "requests",
        &[
            "id",
            "host",
            "method",
            "path",
            "length",
            "port",
            "is_tls",
            "raw_id",
            "query",
            "response_id",
            "source",
            "created_at",
            "metadata_id",
        ],
    ),
    ("intercept_entries", &["id", "request_id"]),
];

const SCHEMA_RAW_FIXTURE: &str = r"
CREATE TABLE IF NOT EXISTS requests_raw (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  data BLOB NOT NULL,
  source TEXT NOT NULL,
  alteration TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS responses_raw (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  data BLOB NOT NULL,
  source TEXT NOT NULL,
  alteration TEXT NOT NULL
);
";

const SCHEMA_MAIN_FIXTURE: &str = r"
CREATE TABLE IF NOT EXISTS responses (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  status_code INTEGER NOT NULL,
  raw_id INTEGER NOT NULL,
  length INTEGER NOT NULL,
  alteration TEXT NOT NULL,
  edited INTEGER NOT NULL DEFAULT 0 CHECK (edited IN (0, 1)),
  roundtrip_time INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS requests_metadata (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  color TEXT
);

CREATE TABLE IF NOT EXISTS requests (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  host TEXT NOT NULL,
  method TEXT NOT NULL,
  path TEXT NOT NULL,
  length INTEGER NOT NULL,
  port INTEGER NOT NULL,
  is_tls INTEGER NOT NULL CHECK (is_tls IN (0, 1)),
  raw_id INTEGER NOT NULL,
  query TEXT NOT NULL DEFAULT '',
  response_id INTEGER REFERENCES responses(id),
  source TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  metadata_id INTEGER NOT NULL REFERENCES requests_metadata(id)
);

CREATE TABLE IF NOT EXISTS intercept_entries (
  id INTEGER PRIMARY KEY,
  request_id INTEGER NOT NULL UNIQUE REFERENCES requests(id)
);
";

/// The two SQLite files of a Caido project.
///
/// `raw` holds payload bytes and `main` holds the history rows. Each write
/// commits the raw store before touching the main store, so a failure in the
/// main store leaves committed raw rows that nothing references.
pub struct CaidoStores {
    raw: Connection,
    main: Connection,
}

/// Identifiers assigned to one written history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrittenEntry {
    pub raw_request_id: i64,
    pub raw_response_id: i64,
    pub response_id: i64,
    pub request_id: i64,
}

impl CaidoStores {
    /// Opens `database_raw.caido` and `database.caido` inside a Caido project
    /// directory. Neither file is created when missing.
    pub fn open(project_dir: &Path) -> Result<Self> {
        let raw = open_existing(&project_dir.join(RAW_DATABASE_FILE))?;
        let main = open_existing(&project_dir.join(MAIN_DATABASE_FILE))?;
        Self::from_connections(raw, main)
    }

    pub fn from_connections(raw: Connection, main: Connection) -> Result<Self> {
        for conn in [&raw, &main] {
            conn.execute_batch("PRAGMA foreign_keys = ON;")
                .context("failed to configure sqlite pragmas")?;
            conn.busy_timeout(BUSY_TIMEOUT)
                .context("failed to configure sqlite busy timeout")?;
        }

        Ok(Self { raw, main })
    }

    /// Checks that both stores carry the tables and columns written to.
    pub fn verify_schema(&self) -> Result<()> {
        for (table, columns) in RAW_TABLES {
            ensure_table_has_columns(&self.raw, RAW_DATABASE_FILE, table, columns)?;
        }
        for (table, columns) in MAIN_TABLES {
            ensure_table_has_columns(&self.main, MAIN_DATABASE_FILE, table, columns)?;
        }
        Ok(())
    }

    /// Writes one history entry across both stores.
    ///
    /// The raw payloads are committed first. The response, metadata, request
    /// and intercept rows then go into a single main-store transaction that is
    /// rolled back as a whole on failure. The metadata row is inserted with an
    /// id that is unused in `requests_metadata`, `requests` and
    /// `intercept_entries`, and the request row takes the same id, so
    /// `requests.id`, `requests.metadata_id`, `intercept_entries.id` and
    /// `intercept_entries.request_id` are equal.
    pub fn write_entry(&mut self, entry: &HistoryEntry) -> Result<WrittenEntry> {
        let request_length = i64::try_from(entry.request_length())
            .context("request payload length does not fit in an INTEGER column")?;

        let (raw_request_id, raw_response_id) = self.write_raw(entry)?;

        match self.write_history(entry, request_length, raw_request_id, raw_response_id) {
            Ok((response_id, request_id)) => {
                tracing::debug!(
                    raw_request_id,
                    raw_response_id,
                    response_id,
                    request_id,
                    "history entry written"
                );
                Ok(WrittenEntry {
                    raw_request_id,
                    raw_response_id,
                    response_id,
                    request_id,
                })
            }
            Err(err) => {
                tracing::warn!(
                    raw_request_id,
                    raw_response_id,
                    error = %format!("{err:#}"),
                    "history transaction rolled back; committed raw rows are unreferenced"
                );
                Err(err.context(format!(
                    "requests_raw {raw_request_id} and responses_raw {raw_response_id} were committed but are unreferenced"
                )))
            }
        }
    }

    fn write_raw(&mut self, entry: &HistoryEntry) -> Result<(i64, i64)> {
        let tx = self
            .raw
            .transaction()
            .context("failed to start raw store transaction")?;

        tx.execute(
            "INSERT INTO requests_raw (data, source, alteration) VALUES (?1, ?2, ?3)",
            params![entry.request_bytes, INTERCEPT_SOURCE, NO_ALTERATION],
        )
        .context("failed to insert raw request")?;
        let raw_request_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO responses_raw (data, source, alteration) VALUES (?1, ?2, ?3)",
            params![entry.response_bytes, INTERCEPT_SOURCE, NO_ALTERATION],
        )
        .context("failed to insert raw response")?;
        let raw_response_id = tx.last_insert_rowid();

        tx.commit().context("failed to commit raw store transaction")?;
        Ok((raw_request_id, raw_response_id))
    }

    fn write_history(
        &mut self,
        entry: &HistoryEntry,
        request_length: i64,
        raw_request_id: i64,
        raw_response_id: i64,
    ) -> Result<(i64, i64)> {
        let tx = self
            .main
            .transaction()
            .context("failed to start history transaction")?;

        tx.execute(
            "INSERT INTO responses (status_code, raw_id, length, alteration, edited, roundtrip_time, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, 0, ?5)",
            params![
                entry.status_code,
                raw_response_id,
                entry.response_length,
                NO_ALTERATION,
                entry.created_at_ms,
            ],
        )
        .context("failed to insert response row")?;
        let response_id = tx.last_insert_rowid();

        let request_id = next_request_id(&tx)?;
        tx.execute(
            "INSERT INTO requests_metadata (id) VALUES (?1)",
            params![request_id],
        )
        .with_context(|| format!("failed to insert request metadata row {request_id}"))?;

        tx.execute(
            "INSERT INTO requests (
                id, host, method, path, length, port, is_tls,
                raw_id, query, response_id, source, created_at, metadata_id
             ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10, ?11, ?12, ?1
             )",
            params![
                request_id,
                entry.host,
                entry.method,
                entry.path,
                request_length,
                entry.port,
                bool_to_sql(entry.is_tls),
                raw_request_id,
                entry.query,
                response_id,
                INTERCEPT_SOURCE,
                entry.created_at_ms,
            ],
        )
        .with_context(|| format!("failed to insert request row {request_id}"))?;

        tx.execute(
            "INSERT INTO intercept_entries (id, request_id) VALUES (?1, ?1)",
            params![request_id],
        )
        .context("failed to insert intercept entry")?;

        tx.commit().context("failed to commit history transaction")?;
        Ok((response_id, request_id))
    }

    #[must_use]
    pub fn raw_connection(&self) -> &Connection {
        &self.raw
    }

    #[must_use]
    pub fn main_connection(&self) -> &Connection {
        &self.main
    }

    /// Closes both stores, reporting the first close failure.
    pub fn close(self) -> Result<()> {
        let Self { raw, main } = self;
        let raw_result = raw
            .close()
            .map_err(|(_, err)| anyhow!(err))
            .context("failed to close raw store");
        let main_result = main
            .close()
            .map_err(|(_, err)| anyhow!(err))
            .context("failed to close history store");
        raw_result.and(main_result)
    }
}

fn open_existing(path: &Path) -> Result<Connection> {
    if !path.is_file() {
        return Err(anyhow!("Caido database {} does not exist", path.display()));
    }

    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("failed to open sqlite database at {}", path.display()))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

// Ids are never reused: the floor covers rows deleted since the last
// AUTOINCREMENT assignment as well as tables whose ids ran ahead of the others.
fn next_request_id(conn: &Connection) -> Result<i64> {
    let mut floor: i64 = conn
        .query_row(
            "SELECT MAX(
                COALESCE((SELECT MAX(id) FROM requests_metadata), 0),
                COALESCE((SELECT MAX(id) FROM requests), 0),
                COALESCE((SELECT MAX(id) FROM intercept_entries), 0)
             )",
            [],
            |row| row.get(0),
        )
        .context("failed to read highest request id")?;

    if table_exists(conn, "sqlite_sequence")? {
        let sequence: Option<i64> = conn
            .query_row(
                "SELECT MAX(seq)
                 FROM sqlite_sequence
                 WHERE name IN ('requests_metadata', 'requests')",
                [],
                |row| row.get(0),
            )
            .context("failed to read request id sequence")?;
        floor = floor.max(sequence.unwrap_or(0));
    }

    floor
        .checked_add(1)
        .ok_or_else(|| anyhow!("request id space is exhausted"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(
    conn: &Connection,
    store: &str,
    table_name: &str,
    columns: &[&str],
) -> Result<()> {
    if !table_exists(conn, table_name)? {
        return Err(anyhow!(
            "Caido schema check failed: {store} has no table {table_name}"
        ));
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "Caido schema check failed: {store} is missing column {table_name}.{required}"
            ));
        }
    }

    Ok(())
}

/// Creates the subset of the Caido schema this crate writes to.
///
/// Intended for tests and fixtures; real projects already carry the schema.
pub fn seed_destination_schema(raw: &Connection, main: &Connection) -> Result<()> {
    raw.execute_batch(SCHEMA_RAW_FIXTURE)
        .context("failed to create raw store fixture schema")?;
    main.execute_batch(SCHEMA_MAIN_FIXTURE)
        .context("failed to create history store fixture schema")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::manual_let_else)]

    use super::*;
    use burp2caido_core::encode_payload;
    use proptest::prelude::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_stores() -> CaidoStores {
        let raw = must(Connection::open_in_memory().map_err(Into::into));
        let main = must(Connection::open_in_memory().map_err(Into::into));
        must(seed_destination_schema(&raw, &main));
        must(CaidoStores::from_connections(raw, main))
    }

    fn fixture_entry() -> HistoryEntry {
        HistoryEntry {
            url: "https://example.com/".to_string(),
            created_at_ms: 1_709_648_521_000,
            host: "example.com".to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
            query: String::new(),
            port: 443,
            is_tls: true,
            request_bytes: b"GET / HTTP/1.1\r\n\r\n".to_vec(),
            status_code: 200,
            response_bytes: b"HTTP/1.1 200 OK\r\n\r\n".to_vec(),
            response_length: 19,
        }
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        must(
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })
            .map_err(Into::into),
        )
    }

    fn assert_cross_references(stores: &CaidoStores, written: WrittenEntry) {
        let main = stores.main_connection();
        let (raw_id, response_id, metadata_id): (i64, i64, i64) = must(
            main.query_row(
                "SELECT raw_id, response_id, metadata_id FROM requests WHERE id = ?1",
                params![written.request_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(Into::into),
        );
        assert_eq!(raw_id, written.raw_request_id);
        assert_eq!(response_id, written.response_id);
        assert_eq!(metadata_id, written.request_id);

        let response_raw_id: i64 = must(
            main.query_row(
                "SELECT raw_id FROM responses WHERE id = ?1",
                params![response_id],
                |row| row.get(0),
            )
            .map_err(Into::into),
        );
        assert_eq!(response_raw_id, written.raw_response_id);

        let (intercept_id, intercept_request_id): (i64, i64) = must(
            main.query_row(
                "SELECT id, request_id FROM intercept_entries WHERE request_id = ?1",
                params![written.request_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(Into::into),
        );
        assert_eq!(intercept_id, written.request_id);
        assert_eq!(intercept_request_id, written.request_id);

        let raw = stores.raw_connection();
        for (table, id) in [
            ("requests_raw", written.raw_request_id),
            ("responses_raw", written.raw_response_id),
        ] {
            let found: Option<i64> = must(
                raw.query_row(
                    &format!("SELECT id FROM {table} WHERE id = ?1"),
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(Into::into),
            );
            assert_eq!(found, Some(id), "missing {table} row {id}");
        }
    }

    #[test]
    fn write_entry_links_all_rows() {
        let mut stores = fixture_stores();
        must(stores.verify_schema());

        let written = must(stores.write_entry(&fixture_entry()));
        assert_cross_references(&stores, written);

        let main = stores.main_connection();
        let (host, method, is_tls, length, source, created_at): (String, String, i64, i64, String, i64) =
            must(
                main.query_row(
                    "SELECT host, method, is_tls, length, source, created_at FROM requests WHERE id = ?1",
                    params![written.request_id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    },
                )
                .map_err(Into::into),
            );
        assert_eq!(host, "example.com");
        assert_eq!(method, "GET");
        assert_eq!(is_tls, 1);
        assert_eq!(length, 18);
        assert_eq!(source, "intercept");
        assert_eq!(created_at, 1_709_648_521_000);

        let (status, response_length, alteration, edited): (i64, i64, String, i64) = must(
            main.query_row(
                "SELECT status_code, length, alteration, edited FROM responses WHERE id = ?1",
                params![written.response_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .map_err(Into::into),
        );
        assert_eq!(status, 200);
        assert_eq!(response_length, 19);
        assert_eq!(alteration, "none");
        assert_eq!(edited, 0);

        let (data, source): (Vec<u8>, String) = must(
            stores
                .raw_connection()
                .query_row(
                    "SELECT data, source FROM requests_raw WHERE id = ?1",
                    params![written.raw_request_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(Into::into),
        );
        assert_eq!(data, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(source, "intercept");
    }

    #[test]
    fn request_id_follows_metadata_id_when_sequences_diverge() {
        let mut stores = fixture_stores();
        for _ in 0..5 {
            must(
                stores
                    .main_connection()
                    .execute("INSERT INTO requests_metadata DEFAULT VALUES", [])
                    .map_err(Into::into),
            );
        }

        let written = must(stores.write_entry(&fixture_entry()));
        assert_eq!(written.request_id, 6);
        assert_eq!(written.response_id, 1);
        assert_cross_references(&stores, written);
    }

    #[test]
    fn history_failure_rolls_back_main_store_only() {
        let mut stores = fixture_stores();
        must(
            stores
                .main_connection()
                .execute_batch("DROP TABLE intercept_entries;")
                .map_err(Into::into),
        );

        let result = stores.write_entry(&fixture_entry());
        let err = match result {
            Ok(written) => panic!("expected failure, wrote {written:?}"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("unreferenced"));

        assert_eq!(count(stores.raw_connection(), "requests_raw"), 1);
        assert_eq!(count(stores.raw_connection(), "responses_raw"), 1);
        assert_eq!(count(stores.main_connection(), "responses"), 0);
        assert_eq!(count(stores.main_connection(), "requests_metadata"), 0);
        assert_eq!(count(stores.main_connection(), "requests"), 0);
    }

    #[test]
    fn request_id_skips_ids_already_taken_by_requests() {
        let mut stores = fixture_stores();
        must(
            stores
                .main_connection()
                .execute_batch(
                    "INSERT INTO requests_metadata (id) VALUES (1);
                     INSERT INTO requests (id, host, method, path, length, port, is_tls, raw_id, query, response_id, source, created_at, metadata_id)
                     VALUES (2, 'h', 'GET', '/', 0, 80, 0, 0, '', NULL, 'intercept', 0, 1);",
                )
                .map_err(Into::into),
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            let written = must(stores.write_entry(&fixture_entry()));
            assert_cross_references(&stores, written);
            ids.push(written.request_id);
        }
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(count(stores.raw_connection(), "requests_raw"), 3);
    }

    #[test]
    fn request_id_is_not_reused_after_metadata_delete() {
        let mut stores = fixture_stores();
        must(
            stores
                .main_connection()
                .execute_batch(
                    "INSERT INTO requests_metadata DEFAULT VALUES;
                     INSERT INTO requests_metadata DEFAULT VALUES;
                     INSERT INTO requests_metadata DEFAULT VALUES;
                     DELETE FROM requests_metadata;",
                )
                .map_err(Into::into),
        );

        let written = must(stores.write_entry(&fixture_entry()));
        assert_eq!(written.request_id, 4);
        assert_cross_references(&stores, written);
    }

    #[test]
    fn store_remains_usable_after_failed_write() {
        let mut stores = fixture_stores();
        must(
            stores
                .main_connection()
                .execute_batch(
                    "CREATE TEMP TRIGGER reject_intercept BEFORE INSERT ON intercept_entries
                     BEGIN SELECT RAISE(ABORT, 'intercept rejected'); END;",
                )
                .map_err(Into::into),
        );

        assert!(stores.write_entry(&fixture_entry()).is_err());
        assert!(stores.write_entry(&fixture_entry()).is_err());
        assert_eq!(count(stores.main_connection(), "requests_metadata"), 0);

        must(
            stores
                .main_connection()
                .execute_batch("DROP TRIGGER reject_intercept;")
                .map_err(Into::into),
        );
        let written = must(stores.write_entry(&fixture_entry()));
        assert_eq!(written.request_id, 1);
        assert_cross_references(&stores, written);
        assert_eq!(count(stores.raw_connection(), "requests_raw"), 3);
    }

    #[test]
    fn verify_schema_reports_missing_column() {
        let raw = must(Connection::open_in_memory().map_err(Into::into));
        let main = must(Connection::open_in_memory().map_err(Into::into));
        must(seed_destination_schema(&raw, &main));
        must(
            main.execute_batch(
                "DROP TABLE intercept_entries;
                 CREATE TABLE intercept_entries (id INTEGER PRIMARY KEY);",
            )
            .map_err(Into::into),
        );
        let stores = must(CaidoStores::from_connections(raw, main));

        let err = match stores.verify_schema() {
            Ok(()) => panic!("expected schema check failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("intercept_entries.request_id"));
    }

    #[test]
    fn verify_schema_reports_missing_table() {
        let raw = must(Connection::open_in_memory().map_err(Into::into));
        let main = must(Connection::open_in_memory().map_err(Into::into));
        must(seed_destination_schema(&raw, &main));
        must(raw.execute_batch("DROP TABLE responses_raw;").map_err(Into::into));
        let stores = must(CaidoStores::from_connections(raw, main));

        let err = match stores.verify_schema() {
            Ok(()) => panic!("expected schema check failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("database_raw.caido has no table responses_raw"));
    }

    #[test]
    fn open_requires_existing_database_files() {
        let dir = must(tempfile::tempdir().map_err(Into::into));
        let err = match CaidoStores::open(dir.path()) {
            Ok(_) => panic!("expected open failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("does not exist"));
        assert!(!dir.path().join(RAW_DATABASE_FILE).exists());
        assert!(!dir.path().join(MAIN_DATABASE_FILE).exists());
    }

    #[test]
    fn open_and_close_on_disk_project() {
        let dir = must(tempfile::tempdir().map_err(Into::into));
        {
            let raw = must(Connection::open(dir.path().join(RAW_DATABASE_FILE)).map_err(Into::into));
            let main = must(Connection::open(dir.path().join(MAIN_DATABASE_FILE)).map_err(Into::into));
            must(seed_destination_schema(&raw, &main));
        }

        let mut stores = must(CaidoStores::open(dir.path()));
        must(stores.verify_schema());
        let written = must(stores.write_entry(&fixture_entry()));
        must(stores.close());

        let reopened = must(CaidoStores::open(dir.path()));
        assert_cross_references(&reopened, written);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn written_payloads_round_trip_and_rows_stay_linked(
            request in proptest::collection::vec(any::<u8>(), 0..256),
            response in proptest::collection::vec(any::<u8>(), 0..256),
            status in 100_i64..600,
            writes in 1_usize..4,
        ) {
            let mut stores = fixture_stores();
            let mut entry = fixture_entry();
            entry.request_bytes = request.clone();
            entry.response_bytes = response;
            entry.status_code = status;

            for _ in 0..writes {
                let written = must(stores.write_entry(&entry));
                assert_cross_references(&stores, written);

                let stored: Vec<u8> = must(
                    stores
                        .raw_connection()
                        .query_row(
                            "SELECT data FROM requests_raw WHERE id = ?1",
                            params![written.raw_request_id],
                            |row| row.get(0),
                        )
                        .map_err(Into::into),
                );
                prop_assert_eq!(encode_payload(&stored), encode_payload(&request));
            }

            prop_assert_eq!(count(stores.main_connection(), "requests"), i64::try_from(writes).unwrap_or(i64::MAX));
        }
    }
}
