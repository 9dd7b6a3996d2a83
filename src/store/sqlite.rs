//! SQLite-backed store.
//!
//! Records are kept as JSON text in a `body` column next to the columns
//! queries filter on. rusqlite is synchronous, so every call runs on the
//! blocking pool behind a shared connection.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::{check_execution_update, check_step_update, ChainStore, ExecutionFilter};
use crate::domain::{
    ChainDefinition, ChainDefinitionId, ChainEntityMapping, ChainExecution, ChainExecutionId,
    ExecutionStatus, FamilyId, StepExecution,
};
use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chain_definitions (
    id                 TEXT PRIMARY KEY,
    family_id          TEXT NOT NULL,
    is_enabled         INTEGER NOT NULL,
    is_template        INTEGER NOT NULL,
    template_name      TEXT,
    trigger_event_type TEXT NOT NULL,
    trigger_module     TEXT NOT NULL,
    version            INTEGER NOT NULL,
    created_at         TEXT NOT NULL,
    body               TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_definitions_trigger
    ON chain_definitions (family_id, trigger_event_type, trigger_module);

CREATE TABLE IF NOT EXISTS chain_executions (
    id                  TEXT PRIMARY KEY,
    chain_definition_id TEXT NOT NULL,
    family_id           TEXT NOT NULL,
    correlation_id      TEXT NOT NULL,
    status              TEXT NOT NULL,
    started_at          TEXT NOT NULL,
    body                TEXT NOT NULL,
    UNIQUE (chain_definition_id, correlation_id)
);
CREATE INDEX IF NOT EXISTS idx_executions_family ON chain_executions (family_id, started_at);

CREATE TABLE IF NOT EXISTS step_executions (
    chain_execution_id TEXT NOT NULL,
    step_alias         TEXT NOT NULL,
    position           INTEGER NOT NULL,
    status             TEXT NOT NULL,
    body               TEXT NOT NULL,
    PRIMARY KEY (chain_execution_id, step_alias)
);

CREATE TABLE IF NOT EXISTS chain_entity_mappings (
    seq                INTEGER PRIMARY KEY AUTOINCREMENT,
    chain_execution_id TEXT NOT NULL,
    step_alias         TEXT NOT NULL,
    entity_type        TEXT NOT NULL,
    entity_id          TEXT NOT NULL,
    module             TEXT NOT NULL,
    created_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_mappings_entity ON chain_entity_mappings (entity_id, entity_type);
"#;

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Backend(format!("create {}: {}", dir.display(), e)))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {}", e)))?
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn decode<T: serde::de::DeserializeOwned>(bodies: Vec<String>) -> Result<Vec<T>, StoreError> {
    bodies
        .iter()
        .map(|body| serde_json::from_str(body).map_err(StoreError::from))
        .collect()
}

fn load_steps(
    conn: &Connection,
    execution_id: &str,
) -> Result<Vec<StepExecution>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT body FROM step_executions
         WHERE chain_execution_id = ?1
         ORDER BY position ASC",
    )?;
    let bodies = stmt
        .query_map(params![execution_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    decode(bodies)
}

fn load_definitions(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<ChainDefinition>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let bodies = stmt
        .query_map(args, |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    decode(bodies)
}

fn read_mapping(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChainEntityMapping> {
    let execution_raw: String = row.get(0)?;
    let chain_execution_id = execution_raw
        .parse::<ChainExecutionId>()
        .map_err(|e| conversion_error(0, format!("invalid execution id {}: {}", execution_raw, e)))?;

    let created_raw: String = row.get(5)?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map_err(|e| conversion_error(5, format!("invalid created_at {}: {}", created_raw, e)))?
        .with_timezone(&Utc);

    Ok(ChainEntityMapping {
        chain_execution_id,
        step_alias: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        module: row.get(4)?,
        created_at,
    })
}

const MAPPING_COLUMNS: &str =
    "chain_execution_id, step_alias, entity_type, entity_id, module, created_at";

#[async_trait]
impl ChainStore for SqliteStore {
    async fn insert_definition(&self, definition: &ChainDefinition) -> Result<(), StoreError> {
        let definition = definition.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chain_definitions
                    (id, family_id, is_enabled, is_template, template_name,
                     trigger_event_type, trigger_module, version, created_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    definition.id.to_string(),
                    definition.family_id.to_string(),
                    definition.is_enabled,
                    definition.is_template,
                    definition.template_name,
                    definition.trigger_event_type,
                    definition.trigger_module,
                    definition.version,
                    timestamp(&definition.created_at),
                    serde_json::to_string(&definition)?,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_definition(
        &self,
        definition: &ChainDefinition,
        expected_version: u32,
    ) -> Result<(), StoreError> {
        let definition = definition.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let stored: Option<u32> = tx
                .query_row(
                    "SELECT version FROM chain_definitions WHERE id = ?1 AND family_id = ?2",
                    params![definition.id.to_string(), definition.family_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;

            let actual = stored
                .ok_or_else(|| StoreError::NotFound(format!("chain definition {}", definition.id)))?;
            if actual != expected_version {
                return Err(StoreError::ConcurrencyConflict {
                    id: definition.id,
                    expected: expected_version,
                    actual,
                });
            }

            tx.execute(
                "UPDATE chain_definitions
                 SET is_enabled = ?2, is_template = ?3, template_name = ?4,
                     trigger_event_type = ?5, trigger_module = ?6, version = ?7, body = ?8
                 WHERE id = ?1",
                params![
                    definition.id.to_string(),
                    definition.is_enabled,
                    definition.is_template,
                    definition.template_name,
                    definition.trigger_event_type,
                    definition.trigger_module,
                    definition.version,
                    serde_json::to_string(&definition)?,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_definition(
        &self,
        family_id: FamilyId,
        id: ChainDefinitionId,
    ) -> Result<Option<ChainDefinition>, StoreError> {
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM chain_definitions WHERE id = ?1 AND family_id = ?2",
                    params![id.to_string(), family_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn list_definitions(
        &self,
        family_id: FamilyId,
        enabled: Option<bool>,
    ) -> Result<Vec<ChainDefinition>, StoreError> {
        self.with_conn(move |conn| {
            let family = family_id.to_string();
            match enabled {
                Some(enabled) => load_definitions(
                    conn,
                    "SELECT body FROM chain_definitions
                     WHERE family_id = ?1 AND is_enabled = ?2
                     ORDER BY created_at ASC",
                    params![family, enabled],
                ),
                None => load_definitions(
                    conn,
                    "SELECT body FROM chain_definitions
                     WHERE family_id = ?1
                     ORDER BY created_at ASC",
                    params![family],
                ),
            }
        })
        .await
    }

    async fn find_enabled_by_trigger(
        &self,
        family_id: FamilyId,
        event_type: &str,
        module: &str,
    ) -> Result<Vec<ChainDefinition>, StoreError> {
        let event_type = event_type.to_string();
        let module = module.to_string();
        self.with_conn(move |conn| {
            load_definitions(
                conn,
                "SELECT body FROM chain_definitions
                 WHERE family_id = ?1 AND trigger_event_type = ?2 AND trigger_module = ?3
                   AND is_enabled = 1 AND is_template = 0
                 ORDER BY created_at ASC",
                params![family_id.to_string(), event_type, module],
            )
        })
        .await
    }

    async fn find_template(
        &self,
        template_name: &str,
    ) -> Result<Option<ChainDefinition>, StoreError> {
        let template_name = template_name.to_string();
        self.with_conn(move |conn| {
            let mut found = load_definitions(
                conn,
                "SELECT body FROM chain_definitions
                 WHERE is_template = 1 AND template_name = ?1
                 ORDER BY created_at ASC LIMIT 1",
                params![template_name],
            )?;
            Ok(found.pop())
        })
        .await
    }

    async fn insert_execution(&self, execution: &ChainExecution) -> Result<(), StoreError> {
        let mut row = execution.clone();
        let steps = std::mem::take(&mut row.step_executions);
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO chain_executions
                    (id, chain_definition_id, family_id, correlation_id, status, started_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id.to_string(),
                    row.chain_definition_id.to_string(),
                    row.family_id.to_string(),
                    row.correlation_id.to_string(),
                    row.status.as_str(),
                    timestamp(&row.started_at),
                    serde_json::to_string(&row)?,
                ],
            );
            match inserted {
                Err(ref err) if is_constraint_violation(err) => {
                    return Err(StoreError::DuplicateExecution {
                        definition_id: row.chain_definition_id,
                        correlation_id: row.correlation_id,
                    });
                }
                other => {
                    other?;
                }
            }

            for step in &steps {
                tx.execute(
                    "INSERT INTO step_executions
                        (chain_execution_id, step_alias, position, status, body)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        step.chain_execution_id.to_string(),
                        step.step_alias,
                        step.position,
                        step.status.as_str(),
                        serde_json::to_string(step)?,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_execution(&self, execution: &ChainExecution) -> Result<(), StoreError> {
        let mut row = execution.clone();
        row.step_executions.clear();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let stored: Option<String> = tx
                .query_row(
                    "SELECT status FROM chain_executions WHERE id = ?1",
                    params![row.id.to_string()],
                    |r| r.get(0),
                )
                .optional()?;

            let stored = stored
                .ok_or_else(|| StoreError::NotFound(format!("chain execution {}", row.id)))?;
            let stored: ExecutionStatus = stored.parse().map_err(StoreError::Backend)?;
            check_execution_update(stored, row.status)?;

            tx.execute(
                "UPDATE chain_executions SET status = ?2, body = ?3 WHERE id = ?1",
                params![row.id.to_string(), row.status.as_str(), serde_json::to_string(&row)?],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_execution(
        &self,
        family_id: FamilyId,
        id: ChainExecutionId,
    ) -> Result<Option<ChainExecution>, StoreError> {
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM chain_executions WHERE id = ?1 AND family_id = ?2",
                    params![id.to_string(), family_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(body) = body else {
                return Ok(None);
            };
            let mut execution: ChainExecution = serde_json::from_str(&body)?;
            execution.step_executions = load_steps(conn, &id.to_string())?;
            Ok(Some(execution))
        })
        .await
    }

    async fn list_executions(
        &self,
        family_id: FamilyId,
        filter: &ExecutionFilter,
    ) -> Result<Vec<ChainExecution>, StoreError> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut sql = String::from("SELECT body FROM chain_executions WHERE family_id = ?1");
            let mut args: Vec<String> = vec![family_id.to_string()];
            if let Some(definition_id) = filter.definition_id {
                args.push(definition_id.to_string());
                sql.push_str(&format!(" AND chain_definition_id = ?{}", args.len()));
            }
            if let Some(status) = filter.status {
                args.push(status.as_str().to_string());
                sql.push_str(&format!(" AND status = ?{}", args.len()));
            }
            sql.push_str(" ORDER BY started_at DESC");

            let mut stmt = conn.prepare(&sql)?;
            let bodies = stmt
                .query_map(rusqlite::params_from_iter(args.iter()), |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut executions: Vec<ChainExecution> = decode(bodies)?;
            for execution in &mut executions {
                execution.step_executions = load_steps(conn, &execution.id.to_string())?;
            }
            Ok(executions)
        })
        .await
    }

    async fn count_executions(
        &self,
        family_id: FamilyId,
        definition_id: ChainDefinitionId,
    ) -> Result<u64, StoreError> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chain_executions
                 WHERE chain_definition_id = ?1 AND family_id = ?2",
                params![definition_id.to_string(), family_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn upsert_step_execution(&self, step: &StepExecution) -> Result<(), StoreError> {
        let step = step.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let execution_id = step.chain_execution_id.to_string();

            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM chain_executions WHERE id = ?1",
                    params![execution_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!(
                    "chain execution {}",
                    step.chain_execution_id
                )));
            }

            let stored: Option<String> = tx
                .query_row(
                    "SELECT body FROM step_executions
                     WHERE chain_execution_id = ?1 AND step_alias = ?2",
                    params![execution_id, step.step_alias],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(body) = stored {
                let stored: StepExecution = serde_json::from_str(&body)?;
                check_step_update(&stored, &step)?;
            }

            tx.execute(
                "INSERT INTO step_executions (chain_execution_id, step_alias, position, status, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (chain_execution_id, step_alias)
                 DO UPDATE SET position = excluded.position,
                               status = excluded.status,
                               body = excluded.body",
                params![
                    execution_id,
                    step.step_alias,
                    step.position,
                    step.status.as_str(),
                    serde_json::to_string(&step)?,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn append_mapping(&self, mapping: &ChainEntityMapping) -> Result<(), StoreError> {
        let mapping = mapping.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO chain_entity_mappings ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    MAPPING_COLUMNS
                ),
                params![
                    mapping.chain_execution_id.to_string(),
                    mapping.step_alias,
                    mapping.entity_type,
                    mapping.entity_id,
                    mapping.module,
                    timestamp(&mapping.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn mappings_for_entity(
        &self,
        family_id: FamilyId,
        entity_id: &str,
        entity_type: Option<&str>,
    ) -> Result<Vec<ChainEntityMapping>, StoreError> {
        let entity_id = entity_id.to_string();
        let entity_type = entity_type.map(str::to_string);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM chain_entity_mappings
                 WHERE entity_id = ?1 AND (?2 IS NULL OR entity_type = ?2)
                   AND chain_execution_id IN
                       (SELECT id FROM chain_executions WHERE family_id = ?3)
                 ORDER BY seq ASC",
                MAPPING_COLUMNS
            ))?;
            let mappings = stmt
                .query_map(
                    params![entity_id, entity_type, family_id.to_string()],
                    read_mapping,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(mappings)
        })
        .await
    }

    async fn mappings_for_execution(
        &self,
        execution_id: ChainExecutionId,
    ) -> Result<Vec<ChainEntityMapping>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM chain_entity_mappings
                 WHERE chain_execution_id = ?1
                 ORDER BY seq ASC",
                MAPPING_COLUMNS
            ))?;
            let mappings = stmt
                .query_map(params![execution_id.to_string()], read_mapping)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(mappings)
        })
        .await
    }
}
