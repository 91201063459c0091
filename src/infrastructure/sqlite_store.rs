use crate::domain::models::{
    BackgroundMusicType, PomodoroSession, SessionType, Tag, TimerMode, TimerSettings,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::record_store::{
    ChangeEvent, Filter, Query, RecordKind, RecordStore, SortDescriptor, SortKey, StoredRecord,
    WriteBatch, WriteOp, CHANGE_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Transaction};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const TAG_COLUMNS: &str = "id, name, color_hex, sort, created_at, updated_at";
const SETTINGS_COLUMNS: &str = "id, work_minutes, short_break_minutes, long_break_minutes, \
     session_cycle, timer_mode, background_music_type, current_tag_id";
const SESSION_COLUMNS: &str =
    "id, session_type, tag_id, tag_snapshot, start_at, end_at, created_at, updated_at";

/// Record store backed by one SQLite file. Every call opens its own connection
/// on the blocking pool.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    db_path: PathBuf,
    changes: broadcast::Sender<ChangeEvent>,
}

impl SqliteRecordStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            changes,
        }
    }

    async fn run_blocking<T, F>(&self, work: F) -> Result<T, InfraError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, InfraError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut connection = Connection::open(&db_path)?;
            work(&mut connection)
        })
        .await
        .map_err(|error| InfraError::StoreFailure(format!("store task failed: {error}")))?
    }

    fn broadcast(&self, event: ChangeEvent) {
        if self.changes.send(event).is_err() {
            debug!("no subscribers for record change");
        }
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn write(&self, batch: WriteBatch) -> Result<(), InfraError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut kinds = batch.ops.iter().map(WriteOp::kind).collect::<Vec<_>>();
        kinds.sort();
        kinds.dedup();

        self.run_blocking(move |connection| {
            let transaction = connection.transaction()?;
            for op in &batch.ops {
                apply_op(&transaction, op)?;
            }
            transaction.commit()?;
            Ok(())
        })
        .await?;

        self.broadcast(ChangeEvent { kinds });
        Ok(())
    }

    async fn query(&self, kind: RecordKind, query: Query) -> Result<Vec<StoredRecord>, InfraError> {
        self.run_blocking(move |connection| load_records(connection, kind, &query))
            .await
    }

    async fn delete_by_id(&self, kind: RecordKind, id: &str) -> Result<(), InfraError> {
        let owned_id = id.to_string();
        let removed = self
            .run_blocking(move |connection| {
                let sql = format!("DELETE FROM {} WHERE id = ?1", table_name(kind));
                Ok(connection.execute(&sql, params![owned_id])?)
            })
            .await?;
        if removed == 0 {
            return Err(InfraError::NotFound {
                kind,
                id: id.to_string(),
            });
        }
        self.broadcast(ChangeEvent { kinds: vec![kind] });
        Ok(())
    }

    fn observe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

fn table_name(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Tag => "tags",
        RecordKind::TimerSettings => "timer_settings",
        RecordKind::PomodoroSession => "pomodoro_sessions",
    }
}

fn select_columns(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Tag => TAG_COLUMNS,
        RecordKind::TimerSettings => SETTINGS_COLUMNS,
        RecordKind::PomodoroSession => SESSION_COLUMNS,
    }
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn apply_op(transaction: &Transaction<'_>, op: &WriteOp) -> Result<(), InfraError> {
    match op {
        WriteOp::Upsert(StoredRecord::Tag(tag)) => {
            transaction.execute(
                "INSERT INTO tags (id, name, color_hex, sort, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   color_hex = excluded.color_hex,
                   sort = excluded.sort,
                   updated_at = excluded.updated_at",
                params![
                    tag.id,
                    tag.name,
                    tag.color_hex,
                    tag.sort,
                    format_timestamp(tag.created_at),
                    format_timestamp(tag.updated_at),
                ],
            )?;
        }
        WriteOp::Upsert(record @ StoredRecord::TimerSettings(settings)) => {
            transaction.execute(
                "INSERT INTO timer_settings (id, work_minutes, short_break_minutes,
                   long_break_minutes, session_cycle, timer_mode, background_music_type,
                   current_tag_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                   work_minutes = excluded.work_minutes,
                   short_break_minutes = excluded.short_break_minutes,
                   long_break_minutes = excluded.long_break_minutes,
                   session_cycle = excluded.session_cycle,
                   timer_mode = excluded.timer_mode,
                   background_music_type = excluded.background_music_type,
                   current_tag_id = excluded.current_tag_id",
                params![
                    record.id(),
                    settings.work_minutes,
                    settings.short_break_minutes,
                    settings.long_break_minutes,
                    settings.session_cycle,
                    settings.timer_mode.as_str(),
                    settings.background_music_type.as_str(),
                    settings.current_tag.as_ref().map(|tag| tag.id.as_str()),
                ],
            )?;
        }
        WriteOp::Upsert(StoredRecord::PomodoroSession(session)) => {
            let tag_snapshot = session
                .tag
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            transaction.execute(
                "INSERT INTO pomodoro_sessions (id, session_type, tag_id, tag_snapshot,
                   start_at, end_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                   session_type = excluded.session_type,
                   tag_id = excluded.tag_id,
                   tag_snapshot = excluded.tag_snapshot,
                   start_at = excluded.start_at,
                   end_at = excluded.end_at,
                   updated_at = excluded.updated_at",
                params![
                    session.id,
                    session.session_type.as_str(),
                    session.tag.as_ref().map(|tag| tag.id.as_str()),
                    tag_snapshot,
                    format_timestamp(session.start_at),
                    session.end_at.map(format_timestamp),
                    format_timestamp(session.created_at),
                    format_timestamp(session.updated_at),
                ],
            )?;
        }
        WriteOp::Delete { kind, id } => {
            let sql = format!("DELETE FROM {} WHERE id = ?1", table_name(*kind));
            transaction.execute(&sql, params![id])?;
        }
    }
    Ok(())
}

fn where_clause(kind: RecordKind, filter: Option<&Filter>) -> (String, Vec<String>) {
    match (filter, kind) {
        (None, _) => (String::new(), Vec::new()),
        (Some(Filter::Id(id)), _) => (" WHERE id = ?".to_string(), vec![id.clone()]),
        (Some(Filter::OngoingSession), RecordKind::PomodoroSession) => {
            (" WHERE end_at IS NULL".to_string(), Vec::new())
        }
        (Some(Filter::StartedBetween { start, end }), RecordKind::PomodoroSession) => (
            " WHERE start_at >= ? AND start_at < ?".to_string(),
            vec![format_timestamp(*start), format_timestamp(*end)],
        ),
        // Session-only filters match nothing elsewhere.
        (Some(_), _) => (" WHERE 0".to_string(), Vec::new()),
    }
}

fn order_clause(kind: RecordKind, sort: &[SortDescriptor]) -> String {
    let terms = sort
        .iter()
        .filter_map(|descriptor| {
            let column = match (descriptor.key, kind) {
                (SortKey::Sort, RecordKind::Tag) => "sort",
                (SortKey::CreatedAt, RecordKind::Tag | RecordKind::PomodoroSession) => {
                    "created_at"
                }
                (SortKey::StartAt, RecordKind::PomodoroSession) => "start_at",
                _ => return None,
            };
            let direction = if descriptor.ascending { "ASC" } else { "DESC" };
            Some(format!("{column} {direction}"))
        })
        .collect::<Vec<_>>();
    if terms.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", terms.join(", "))
    }
}

fn load_records(
    connection: &Connection,
    kind: RecordKind,
    query: &Query,
) -> Result<Vec<StoredRecord>, InfraError> {
    let (clause, bindings) = where_clause(kind, query.filter.as_ref());
    let sql = format!(
        "SELECT {} FROM {}{}{}",
        select_columns(kind),
        table_name(kind),
        clause,
        order_clause(kind, &query.sort)
    );
    let rows = read_rows(connection, &sql, bindings)?;

    let mut records = Vec::with_capacity(rows.len());
    for values in rows {
        match decode_record(connection, kind, &values) {
            Ok(record) => records.push(record),
            Err(error) => warn!(kind = %kind, error = %error, "skipping malformed record"),
        }
        if query.limit.is_some_and(|limit| records.len() >= limit) {
            break;
        }
    }
    Ok(records)
}

fn read_rows(
    connection: &Connection,
    sql: &str,
    bindings: Vec<String>,
) -> Result<Vec<Vec<Value>>, InfraError> {
    let mut statement = connection.prepare(sql)?;
    let column_count = statement.column_count();
    let rows = statement.query_map(params_from_iter(bindings), |row| {
        (0..column_count)
            .map(|index| row.get::<_, Value>(index))
            .collect::<Result<Vec<_>, _>>()
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(InfraError::from)
}

fn decode_record(
    connection: &Connection,
    kind: RecordKind,
    values: &[Value],
) -> Result<StoredRecord, InfraError> {
    match kind {
        RecordKind::Tag => decode_tag(connection, values).map(StoredRecord::Tag),
        RecordKind::TimerSettings => {
            decode_settings(connection, values).map(StoredRecord::TimerSettings)
        }
        RecordKind::PomodoroSession => decode_session(values).map(StoredRecord::PomodoroSession),
    }
}

fn decode_tag(connection: &Connection, values: &[Value]) -> Result<Tag, InfraError> {
    let id = text(values, 0, "tags.id")?;
    let session_ids = read_rows(
        connection,
        "SELECT id FROM pomodoro_sessions WHERE tag_id = ? ORDER BY id",
        vec![id.clone()],
    )?
    .iter()
    .map(|row| text(row, 0, "pomodoro_sessions.id"))
    .collect::<Result<Vec<_>, _>>()?;

    let tag = Tag {
        id,
        name: text(values, 1, "tags.name")?,
        color_hex: text(values, 2, "tags.color_hex")?,
        sort: small_integer(values, 3, "tags.sort")?,
        session_ids,
        created_at: timestamp(values, 4, "tags.created_at")?,
        updated_at: timestamp(values, 5, "tags.updated_at")?,
    };
    tag.validate().map_err(InfraError::Decode)?;
    Ok(tag)
}

fn decode_settings(connection: &Connection, values: &[Value]) -> Result<TimerSettings, InfraError> {
    let timer_mode_raw = text(values, 5, "timer_settings.timer_mode")?;
    let music_raw = text(values, 6, "timer_settings.background_music_type")?;
    let current_tag = match optional_text(values, 7, "timer_settings.current_tag_id")? {
        Some(tag_id) => load_tag(connection, &tag_id)?,
        None => None,
    };
    Ok(TimerSettings {
        work_minutes: small_integer(values, 1, "timer_settings.work_minutes")?,
        short_break_minutes: small_integer(values, 2, "timer_settings.short_break_minutes")?,
        long_break_minutes: small_integer(values, 3, "timer_settings.long_break_minutes")?,
        session_cycle: small_integer(values, 4, "timer_settings.session_cycle")?,
        timer_mode: TimerMode::from_raw(&timer_mode_raw).ok_or_else(|| {
            InfraError::Decode(format!("unknown timer_mode '{timer_mode_raw}'"))
        })?,
        background_music_type: BackgroundMusicType::from_raw(&music_raw).ok_or_else(|| {
            InfraError::Decode(format!("unknown background_music_type '{music_raw}'"))
        })?,
        current_tag,
    })
}

fn load_tag(connection: &Connection, tag_id: &str) -> Result<Option<Tag>, InfraError> {
    let sql = format!("SELECT {TAG_COLUMNS} FROM tags WHERE id = ?");
    let Some(values) = read_rows(connection, &sql, vec![tag_id.to_string()])?
        .into_iter()
        .next()
    else {
        return Ok(None);
    };
    match decode_tag(connection, &values) {
        Ok(tag) => Ok(Some(tag)),
        Err(error) => {
            warn!(tag_id, error = %error, "current tag is malformed");
            Ok(None)
        }
    }
}

fn decode_session(values: &[Value]) -> Result<PomodoroSession, InfraError> {
    let session_type_raw = text(values, 1, "pomodoro_sessions.session_type")?;
    let tag = optional_text(values, 3, "pomodoro_sessions.tag_snapshot")?
        .map(|raw| serde_json::from_str::<Tag>(&raw))
        .transpose()
        .map_err(|error| InfraError::Decode(format!("invalid tag_snapshot: {error}")))?;
    let end_at = optional_text(values, 5, "pomodoro_sessions.end_at")?
        .map(|raw| parse_timestamp(&raw, "pomodoro_sessions.end_at"))
        .transpose()?;

    let session = PomodoroSession {
        id: text(values, 0, "pomodoro_sessions.id")?,
        session_type: SessionType::from_raw(&session_type_raw).ok_or_else(|| {
            InfraError::Decode(format!("unknown session_type '{session_type_raw}'"))
        })?,
        tag,
        start_at: timestamp(values, 4, "pomodoro_sessions.start_at")?,
        end_at,
        created_at: timestamp(values, 6, "pomodoro_sessions.created_at")?,
        updated_at: timestamp(values, 7, "pomodoro_sessions.updated_at")?,
    };
    session.validate().map_err(InfraError::Decode)?;
    Ok(session)
}

fn optional_text(
    values: &[Value],
    index: usize,
    field: &str,
) -> Result<Option<String>, InfraError> {
    match values.get(index) {
        Some(Value::Text(value)) => Ok(Some(value.clone())),
        Some(Value::Null) => Ok(None),
        Some(_) => Err(InfraError::Decode(format!("{field} must be text"))),
        None => Err(InfraError::Decode(format!("{field} is missing"))),
    }
}

fn text(values: &[Value], index: usize, field: &str) -> Result<String, InfraError> {
    optional_text(values, index, field)?
        .ok_or_else(|| InfraError::Decode(format!("{field} must not be null")))
}

fn small_integer(values: &[Value], index: usize, field: &str) -> Result<i32, InfraError> {
    match values.get(index) {
        Some(Value::Integer(value)) => i32::try_from(*value)
            .map_err(|_| InfraError::Decode(format!("{field} is out of range: {value}"))),
        Some(Value::Null) => Err(InfraError::Decode(format!("{field} must not be null"))),
        _ => Err(InfraError::Decode(format!("{field} must be an integer"))),
    }
}

fn timestamp(values: &[Value], index: usize, field: &str) -> Result<DateTime<Utc>, InfraError> {
    parse_timestamp(&text(values, index, field)?, field)
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| InfraError::Decode(format!("invalid {field} '{raw}': {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::initialize_database;
    use chrono::Duration;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-16T09:00:00Z")
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn open_store() -> (TempDir, SqliteRecordStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("pomodolog.sqlite");
        initialize_database(&path).expect("init schema");
        (dir, SqliteRecordStore::new(path))
    }

    async fn sessions(store: &SqliteRecordStore, query: Query) -> Vec<PomodoroSession> {
        store
            .query(RecordKind::PomodoroSession, query)
            .await
            .expect("query sessions")
            .into_iter()
            .filter_map(|record| match record {
                StoredRecord::PomodoroSession(session) => Some(session),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn sessions_persist_with_tag_snapshot_and_ongoing_filter() {
        let (_dir, store) = open_store();
        let tag = Tag::new("study", "Study", "#34C759", 1, t0());
        let closed = PomodoroSession::start(SessionType::Work, Some(&tag), t0())
            .closed_at(t0() + Duration::minutes(25));
        let open = PomodoroSession::start(SessionType::Break, None, t0() + Duration::minutes(25));

        store
            .write(
                WriteBatch::default()
                    .upsert(StoredRecord::Tag(tag.clone()))
                    .upsert(StoredRecord::PomodoroSession(closed.clone()))
                    .upsert(StoredRecord::PomodoroSession(open.clone())),
            )
            .await
            .expect("write batch");

        let ongoing = sessions(
            &store,
            Query {
                filter: Some(Filter::OngoingSession),
                ..Query::default()
            },
        )
        .await;
        assert_eq!(ongoing, vec![open.clone()]);

        let all = sessions(
            &store,
            Query {
                sort: vec![SortDescriptor::asc(SortKey::StartAt)],
                ..Query::default()
            },
        )
        .await;
        assert_eq!(all, vec![closed.clone(), open]);
        assert_eq!(all[0].tag.as_ref().map(|tag| tag.name.as_str()), Some("Study"));

        let tags = store
            .query(RecordKind::Tag, Query::by_id("study"))
            .await
            .expect("query tag");
        let StoredRecord::Tag(stored) = &tags[0] else {
            panic!("expected tag");
        };
        assert_eq!(stored.session_ids, vec![closed.id]);
    }

    #[tokio::test]
    async fn upsert_keeps_original_created_at() {
        let (_dir, store) = open_store();
        let tag = Tag::new("study", "Study", "#34C759", 1, t0());
        store
            .write(WriteBatch::default().upsert(StoredRecord::Tag(tag.clone())))
            .await
            .expect("insert");

        let later = t0() + Duration::hours(1);
        let edited = Tag {
            name: "Deep Study".to_string(),
            created_at: later,
            updated_at: later,
            ..tag
        };
        store
            .write(WriteBatch::default().upsert(StoredRecord::Tag(edited)))
            .await
            .expect("update");

        let tags = store
            .query(RecordKind::Tag, Query::default())
            .await
            .expect("query");
        assert_eq!(tags.len(), 1);
        let StoredRecord::Tag(stored) = &tags[0] else {
            panic!("expected tag");
        };
        assert_eq!(stored.name, "Deep Study");
        assert_eq!(stored.created_at, t0());
        assert_eq!(stored.updated_at, later);
    }

    #[tokio::test]
    async fn settings_resolve_current_tag_by_id() {
        let (_dir, store) = open_store();
        let tag = Tag::new("reading", "Reading", "#FF9500", 2, t0());
        let settings = TimerSettings {
            timer_mode: TimerMode::CountUp,
            background_music_type: BackgroundMusicType::Rain,
            current_tag: Some(tag.clone()),
            ..TimerSettings::default()
        };
        store
            .write(
                WriteBatch::default()
                    .upsert(StoredRecord::Tag(tag.clone()))
                    .upsert(StoredRecord::TimerSettings(settings.clone())),
            )
            .await
            .expect("write settings");

        let stored = store
            .query(RecordKind::TimerSettings, Query::default())
            .await
            .expect("query settings");
        assert_eq!(stored, vec![StoredRecord::TimerSettings(settings)]);
    }

    #[tokio::test]
    async fn malformed_rows_are_skipped() {
        let (dir, store) = open_store();
        let good = PomodoroSession::start(SessionType::Work, None, t0());
        store
            .write(WriteBatch::default().upsert(StoredRecord::PomodoroSession(good.clone())))
            .await
            .expect("write session");

        let connection =
            Connection::open(dir.path().join("pomodolog.sqlite")).expect("open database");
        connection
            .execute(
                "INSERT INTO pomodoro_sessions (id, session_type, start_at)
                 VALUES ('bad-1', 'work', NULL)",
                [],
            )
            .expect("insert null start");
        connection
            .execute(
                "INSERT INTO pomodoro_sessions (id, session_type, start_at, created_at, updated_at)
                 VALUES ('bad-2', 'longBreak', '2026-02-16T09:00:00Z',
                         '2026-02-16T09:00:00Z', '2026-02-16T09:00:00Z')",
                [],
            )
            .expect("insert unknown type");

        assert_eq!(sessions(&store, Query::default()).await, vec![good]);
    }

    #[tokio::test]
    async fn delete_reports_missing_and_batch_delete_is_idempotent() {
        let (_dir, store) = open_store();
        let mut changes = store.observe_changes();

        store
            .write(WriteBatch::default().delete(RecordKind::PomodoroSession, "missing"))
            .await
            .expect("idempotent delete");
        let event = changes.recv().await.expect("change event");
        assert_eq!(event.kinds, vec![RecordKind::PomodoroSession]);

        let result = store
            .delete_by_id(RecordKind::PomodoroSession, "missing")
            .await;
        assert!(matches!(result, Err(InfraError::NotFound { .. })));
    }

    #[tokio::test]
    async fn started_between_is_half_open() {
        let (_dir, store) = open_store();
        let first = PomodoroSession::start(SessionType::Work, None, t0());
        let second = PomodoroSession::start(SessionType::Work, None, t0() + Duration::hours(1));
        store
            .write(
                WriteBatch::default()
                    .upsert(StoredRecord::PomodoroSession(first.clone()))
                    .upsert(StoredRecord::PomodoroSession(second)),
            )
            .await
            .expect("write sessions");

        let found = sessions(
            &store,
            Query {
                filter: Some(Filter::StartedBetween {
                    start: t0(),
                    end: t0() + Duration::hours(1),
                }),
                ..Query::default()
            },
        )
        .await;
        assert_eq!(found, vec![first]);
    }
}
