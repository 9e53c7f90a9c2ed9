//! SQLite-backed store
//!
//! Every table carries a `version` column. Conditional updates are a single
//! `UPDATE ... WHERE id = ? AND version = ?`, so the guard also holds when
//! other processes share the database file.
//!
//! ## Tables
//!
//! - `requests` - assistance requests
//! - `assignments` - request/volunteer join rows (no foreign key: orphans
//!   must stay representable so they can be detected)
//! - `profiles` - volunteer availability

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info, trace};

use super::{AssignmentFilter, RequestFilter, StoreAdapter};
use crate::error::StoreError;
use crate::models::*;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS requests (
    id TEXT PRIMARY KEY,
    requester_id TEXT NOT NULL,
    category TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    assignment_method TEXT NOT NULL,
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    version INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_requests_method_status ON requests(assignment_method, status);

CREATE TABLE IF NOT EXISTS assignments (
    id TEXT PRIMARY KEY,
    request_id TEXT NOT NULL,
    volunteer_id TEXT NOT NULL,
    pilgrim_id TEXT NOT NULL,
    status TEXT NOT NULL,
    assigned_at TEXT NOT NULL,
    completed_at TEXT,
    version INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_assignments_request ON assignments(request_id, status);
CREATE INDEX IF NOT EXISTS idx_assignments_volunteer ON assignments(volunteer_id, status);

CREATE TABLE IF NOT EXISTS profiles (
    id TEXT PRIMARY KEY,
    duty_status TEXT NOT NULL,
    volunteer_status TEXT NOT NULL,
    last_lat REAL,
    last_lng REAL,
    location_updated_at TEXT,
    version INTEGER NOT NULL DEFAULT 1
);
"#;

const REQUEST_COLUMNS: &str =
    "id, requester_id, category, description, status, assignment_method, created_at, resolved_at, version";
const ASSIGNMENT_COLUMNS: &str =
    "id, request_id, volunteer_id, pilgrim_id, status, assigned_at, completed_at, version";
const PROFILE_COLUMNS: &str =
    "id, duty_status, volunteer_status, last_lat, last_lng, location_updated_at, version";

// Enum columns are stored as their snake_case names

macro_rules! text_enum_sql {
    ($($ty:ty),*) => {$(
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: String| FromSqlError::Other(e.into()))
            }
        }
    )*};
}

text_enum_sql!(LifecycleStatus, AssignmentMethod, DutyStatus, VolunteerStatus);

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<AssistanceRequest> {
    Ok(AssistanceRequest {
        id: row.get(0)?,
        requester_id: row.get(1)?,
        category: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        assignment_method: row.get(5)?,
        created_at: row.get(6)?,
        resolved_at: row.get(7)?,
        version: row.get::<_, i64>(8)? as u64,
    })
}

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<Assignment> {
    Ok(Assignment {
        id: row.get(0)?,
        request_id: row.get(1)?,
        volunteer_id: row.get(2)?,
        pilgrim_id: row.get(3)?,
        status: row.get(4)?,
        assigned_at: row.get(5)?,
        completed_at: row.get(6)?,
        version: row.get::<_, i64>(7)? as u64,
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<VolunteerProfile> {
    let lat: Option<f64> = row.get(3)?;
    let lng: Option<f64> = row.get(4)?;
    Ok(VolunteerProfile {
        id: row.get(0)?,
        duty_status: row.get(1)?,
        volunteer_status: row.get(2)?,
        last_location: lat.zip(lng).map(|(lat, lng)| GeoPoint { lat, lng }),
        location_updated_at: row.get(5)?,
        version: row.get::<_, i64>(6)? as u64,
    })
}

/// Undecodable columns surface as a corrupt row of `table`
fn decode_error(table: Table) -> impl Fn(rusqlite::Error) -> StoreError {
    move |err| match err {
        rusqlite::Error::FromSqlConversionFailure(column, _, source) => StoreError::Corrupt {
            table,
            reason: format!("column {}: {}", column, source),
        },
        other => StoreError::from(other),
    }
}

/// Builds `WHERE` clauses with positional parameters
#[derive(Default)]
struct Conditions {
    clauses: Vec<String>,
    params: Vec<Box<dyn ToSql>>,
}

impl Conditions {
    fn push(&mut self, clause: &str, param: impl ToSql + 'static) {
        self.clauses.push(clause.to_string());
        self.params.push(Box::new(param));
    }

    fn push_in(&mut self, column: &str, statuses: &[LifecycleStatus]) {
        if statuses.is_empty() {
            self.clauses.push("0".to_string());
            return;
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        self.clauses.push(format!("{} IN ({})", column, placeholders));
        for status in statuses {
            self.params.push(Box::new(*status));
        }
    }

    fn where_clause(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }
}

/// SQLite store for the three collections
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Internal(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        info!(path = %path.display(), "Opening SQLite store");

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_millis(250))?;

        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory SQLite store");
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn current_version(conn: &Connection, table: Table, id: &str) -> Result<Option<u64>, StoreError> {
        let sql = format!("SELECT version FROM {} WHERE id = ?1", table);
        let version = conn
            .query_row(&sql, [id], |row| row.get::<_, i64>(0))
            .optional()?;
        Ok(version.map(|v| v as u64))
    }
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    async fn list_requests(&self, filter: &RequestFilter) -> Result<Vec<AssistanceRequest>, StoreError> {
        let mut conditions = Conditions::default();
        if let Some(method) = filter.method {
            conditions.push("assignment_method = ?", method);
        }
        if let Some(statuses) = &filter.statuses {
            conditions.push_in("status", statuses);
        }
        if let Some(since) = filter.created_since {
            conditions.push("created_at >= ?", since);
        }
        if let Some(until) = filter.created_until {
            conditions.push("created_at < ?", until);
        }

        let sql = format!(
            "SELECT {} FROM requests{} ORDER BY id",
            REQUEST_COLUMNS,
            conditions.where_clause()
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(conditions.params.iter()), request_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(decode_error(Table::Requests))?;
        Ok(rows)
    }

    async fn list_assignments(&self, filter: &AssignmentFilter) -> Result<Vec<Assignment>, StoreError> {
        let mut conditions = Conditions::default();
        if let Some(request_id) = &filter.request_id {
            conditions.push("request_id = ?", request_id.clone());
        }
        if let Some(volunteer_id) = &filter.volunteer_id {
            conditions.push("volunteer_id = ?", volunteer_id.clone());
        }
        if let Some(statuses) = &filter.statuses {
            conditions.push_in("status", statuses);
        }

        let sql = format!(
            "SELECT {} FROM assignments{} ORDER BY id",
            ASSIGNMENT_COLUMNS,
            conditions.where_clause()
        );
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(conditions.params.iter()), assignment_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(decode_error(Table::Assignments))?;
        Ok(rows)
    }

    async fn list_profiles(&self) -> Result<Vec<VolunteerProfile>, StoreError> {
        let sql = format!("SELECT {} FROM profiles ORDER BY id", PROFILE_COLUMNS);
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map([], profile_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(decode_error(Table::Profiles))?;
        Ok(rows)
    }

    async fn get_request(&self, id: &str) -> Result<Option<AssistanceRequest>, StoreError> {
        let sql = format!("SELECT {} FROM requests WHERE id = ?1", REQUEST_COLUMNS);
        let conn = self.lock()?;
        conn.query_row(&sql, [id], request_from_row)
            .optional()
            .map_err(decode_error(Table::Requests))
    }

    async fn get_assignment(&self, id: &str) -> Result<Option<Assignment>, StoreError> {
        let sql = format!("SELECT {} FROM assignments WHERE id = ?1", ASSIGNMENT_COLUMNS);
        let conn = self.lock()?;
        conn.query_row(&sql, [id], assignment_from_row)
            .optional()
            .map_err(decode_error(Table::Assignments))
    }

    async fn get_profile(&self, id: &str) -> Result<Option<VolunteerProfile>, StoreError> {
        let sql = format!("SELECT {} FROM profiles WHERE id = ?1", PROFILE_COLUMNS);
        let conn = self.lock()?;
        conn.query_row(&sql, [id], profile_from_row)
            .optional()
            .map_err(decode_error(Table::Profiles))
    }

    async fn conditional_update(
        &self,
        table: Table,
        id: &str,
        expected_version: u64,
        patch: &Patch,
    ) -> Result<UpdateOutcome, StoreError> {
        if patch.table() != table {
            return Err(StoreError::PatchMismatch {
                table,
                patch: patch.table(),
            });
        }

        let conn = self.lock()?;
        let expected = expected_version as i64;

        // Patches only touch a couple of columns; read-apply-write keeps the
        // partial-update rules in one place (the model's `apply`).
        let changed = match patch {
            Patch::Request(p) => {
                let sql = format!("SELECT {} FROM requests WHERE id = ?1", REQUEST_COLUMNS);
                let Some(mut row) = conn
                    .query_row(&sql, [id], request_from_row)
                    .optional()
                    .map_err(decode_error(Table::Requests))?
                else {
                    return Ok(UpdateOutcome::Conflict { current: None });
                };
                p.apply(&mut row);
                conn.execute(
                    "UPDATE requests SET status = ?1, resolved_at = ?2, version = version + 1
                     WHERE id = ?3 AND version = ?4",
                    params![row.status, row.resolved_at, id, expected],
                )?
            }
            Patch::Assignment(p) => {
                let sql = format!("SELECT {} FROM assignments WHERE id = ?1", ASSIGNMENT_COLUMNS);
                let Some(mut row) = conn
                    .query_row(&sql, [id], assignment_from_row)
                    .optional()
                    .map_err(decode_error(Table::Assignments))?
                else {
                    return Ok(UpdateOutcome::Conflict { current: None });
                };
                p.apply(&mut row);
                conn.execute(
                    "UPDATE assignments SET status = ?1, completed_at = ?2, version = version + 1
                     WHERE id = ?3 AND version = ?4",
                    params![row.status, row.completed_at, id, expected],
                )?
            }
            Patch::Profile(p) => {
                let sql = format!("SELECT {} FROM profiles WHERE id = ?1", PROFILE_COLUMNS);
                let Some(mut row) = conn
                    .query_row(&sql, [id], profile_from_row)
                    .optional()
                    .map_err(decode_error(Table::Profiles))?
                else {
                    return Ok(UpdateOutcome::Conflict { current: None });
                };
                p.apply(&mut row);
                conn.execute(
                    "UPDATE profiles SET duty_status = ?1, volunteer_status = ?2, version = version + 1
                     WHERE id = ?3 AND version = ?4",
                    params![row.duty_status, row.volunteer_status, id, expected],
                )?
            }
        };

        let outcome = if changed == 1 {
            UpdateOutcome::Applied {
                version: expected_version + 1,
            }
        } else {
            UpdateOutcome::Conflict {
                current: Self::current_version(&conn, table, id)?,
            }
        };
        trace!(%table, id, expected_version, ?outcome, "Conditional update");
        Ok(outcome)
    }

    async fn insert_request(&self, request: AssistanceRequest) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO requests ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                REQUEST_COLUMNS
            ),
            params![
                request.id,
                request.requester_id,
                request.category,
                request.description,
                request.status,
                request.assignment_method,
                request.created_at,
                request.resolved_at,
                request.version as i64,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Duplicate {
                table: Table::Requests,
                id: request.id,
            });
        }
        Ok(())
    }

    async fn insert_assignment(&self, assignment: Assignment) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO assignments ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                ASSIGNMENT_COLUMNS
            ),
            params![
                assignment.id,
                assignment.request_id,
                assignment.volunteer_id,
                assignment.pilgrim_id,
                assignment.status,
                assignment.assigned_at,
                assignment.completed_at,
                assignment.version as i64,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Duplicate {
                table: Table::Assignments,
                id: assignment.id,
            });
        }
        Ok(())
    }

    async fn insert_profile(&self, profile: VolunteerProfile) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO profiles ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                PROFILE_COLUMNS
            ),
            params![
                profile.id,
                profile.duty_status,
                profile.volunteer_status,
                profile.last_location.map(|p| p.lat),
                profile.last_location.map(|p| p.lng),
                profile.location_updated_at,
                profile.version as i64,
            ],
        )?;
        if inserted == 0 {
            return Err(StoreError::Duplicate {
                table: Table::Profiles,
                id: profile.id,
            });
        }
        Ok(())
    }

    async fn delete_request(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM requests WHERE id = ?1", [id])?;
        Ok(removed > 0)
    }
}
