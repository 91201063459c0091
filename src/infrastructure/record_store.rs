use crate::domain::models::{PomodoroSession, Tag, TimerSettings, TIMER_SETTINGS_ID};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::debug;

pub const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Tag,
    TimerSettings,
    PomodoroSession,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tag => "tag",
            Self::TimerSettings => "timer_settings",
            Self::PomodoroSession => "pomodoro_session",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredRecord {
    Tag(Tag),
    TimerSettings(TimerSettings),
    PomodoroSession(PomodoroSession),
}

impl StoredRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Tag(_) => RecordKind::Tag,
            Self::TimerSettings(_) => RecordKind::TimerSettings,
            Self::PomodoroSession(_) => RecordKind::PomodoroSession,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Tag(tag) => &tag.id,
            Self::TimerSettings(_) => TIMER_SETTINGS_ID,
            Self::PomodoroSession(session) => &session.id,
        }
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Tag(tag) => Some(tag.created_at),
            Self::TimerSettings(_) => None,
            Self::PomodoroSession(session) => Some(session.created_at),
        }
    }

    fn sort_value(&self, key: SortKey) -> Option<SortValue> {
        match (key, self) {
            (SortKey::Sort, Self::Tag(tag)) => Some(SortValue::Int(i64::from(tag.sort))),
            (SortKey::StartAt, Self::PomodoroSession(session)) => {
                Some(SortValue::Time(session.start_at))
            }
            (SortKey::CreatedAt, record) => record.created_at().map(SortValue::Time),
            _ => None,
        }
    }
}

/// Typed view of a [`StoredRecord`] variant.
pub trait Record: Clone + Send + Sync + 'static {
    const KIND: RecordKind;

    fn into_stored(self) -> StoredRecord;
    fn from_stored(record: StoredRecord) -> Option<Self>;
}

impl Record for Tag {
    const KIND: RecordKind = RecordKind::Tag;

    fn into_stored(self) -> StoredRecord {
        StoredRecord::Tag(self)
    }

    fn from_stored(record: StoredRecord) -> Option<Self> {
        match record {
            StoredRecord::Tag(tag) => Some(tag),
            _ => None,
        }
    }
}

impl Record for TimerSettings {
    const KIND: RecordKind = RecordKind::TimerSettings;

    fn into_stored(self) -> StoredRecord {
        StoredRecord::TimerSettings(self)
    }

    fn from_stored(record: StoredRecord) -> Option<Self> {
        match record {
            StoredRecord::TimerSettings(settings) => Some(settings),
            _ => None,
        }
    }
}

impl Record for PomodoroSession {
    const KIND: RecordKind = RecordKind::PomodoroSession;

    fn into_stored(self) -> StoredRecord {
        StoredRecord::PomodoroSession(self)
    }

    fn from_stored(record: StoredRecord) -> Option<Self> {
        match record {
            StoredRecord::PomodoroSession(session) => Some(session),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Id(String),
    /// Sessions with no `end_at`.
    OngoingSession,
    /// Sessions whose `start_at` falls in `[start, end)`.
    StartedBetween {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl Filter {
    pub fn matches(&self, record: &StoredRecord) -> bool {
        match (self, record) {
            (Self::Id(id), record) => record.id() == id,
            (Self::OngoingSession, StoredRecord::PomodoroSession(session)) => session.is_ongoing(),
            (Self::StartedBetween { start, end }, StoredRecord::PomodoroSession(session)) => {
                session.start_at >= *start && session.start_at < *end
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Sort,
    CreatedAt,
    StartAt,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SortValue {
    Int(i64),
    Time(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortDescriptor {
    pub key: SortKey,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn asc(key: SortKey) -> Self {
        Self {
            key,
            ascending: true,
        }
    }

    pub fn desc(key: SortKey) -> Self {
        Self {
            key,
            ascending: false,
        }
    }

    fn compare(&self, left: &StoredRecord, right: &StoredRecord) -> Ordering {
        let ordering = left.sort_value(self.key).cmp(&right.sort_value(self.key));
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub filter: Option<Filter>,
    pub sort: Vec<SortDescriptor>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            filter: Some(Filter::Id(id.into())),
            sort: Vec::new(),
            limit: Some(1),
        }
    }

    pub fn apply(&self, records: impl IntoIterator<Item = StoredRecord>) -> Vec<StoredRecord> {
        let mut matched = records
            .into_iter()
            .filter(|record| self.filter.as_ref().is_none_or(|filter| filter.matches(record)))
            .collect::<Vec<_>>();
        matched.sort_by(|left, right| {
            self.sort
                .iter()
                .map(|descriptor| descriptor.compare(left, right))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        });
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Upsert(StoredRecord),
    /// Deleting a missing record inside a batch is not an error.
    Delete { kind: RecordKind, id: String },
}

impl WriteOp {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Upsert(record) => record.kind(),
            Self::Delete { kind, .. } => *kind,
        }
    }
}

/// Operations committed together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn upsert(mut self, record: StoredRecord) -> Self {
        self.ops.push(WriteOp::Upsert(record));
        self
    }

    pub fn delete(mut self, kind: RecordKind, id: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Delete {
            kind,
            id: id.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn touched_kinds(&self) -> Vec<RecordKind> {
        let mut kinds = self.ops.iter().map(WriteOp::kind).collect::<Vec<_>>();
        kinds.sort();
        kinds.dedup();
        kinds
    }
}

/// Something changed in the store. Consumers re-fetch; no payload is promised
/// beyond the record kinds that were touched, which may be empty for remote imports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kinds: Vec<RecordKind>,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn write(&self, batch: WriteBatch) -> Result<(), InfraError>;
    async fn query(&self, kind: RecordKind, query: Query) -> Result<Vec<StoredRecord>, InfraError>;
    async fn delete_by_id(&self, kind: RecordKind, id: &str) -> Result<(), InfraError>;
    fn observe_changes(&self) -> broadcast::Receiver<ChangeEvent>;
}

type RecordKey = (RecordKind, String);

#[derive(Debug)]
pub struct InMemoryRecordStore {
    records: Mutex<HashMap<RecordKey, StoredRecord>>,
    changes: broadcast::Sender<ChangeEvent>,
    failing: AtomicBool,
    queries: AtomicUsize,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            records: Mutex::new(HashMap::new()),
            changes,
            failing: AtomicBool::new(false),
            queries: AtomicUsize::new(0),
        }
    }
}

impl InMemoryRecordStore {
    /// Makes every subsequent call fail with [`InfraError::StoreFailure`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, AtomicOrdering::SeqCst);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(AtomicOrdering::SeqCst)
    }

    /// Emits a change event without a local write, as a sync import would.
    pub fn notify_remote_change(&self) {
        self.broadcast(ChangeEvent::default());
    }

    fn broadcast(&self, event: ChangeEvent) {
        if self.changes.send(event).is_err() {
            debug!("no subscribers for record change");
        }
    }

    fn check_available(&self) -> Result<(), InfraError> {
        if self.failing.load(AtomicOrdering::SeqCst) {
            return Err(InfraError::StoreFailure(
                "in-memory store unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<RecordKey, StoredRecord>>, InfraError> {
        self.records
            .lock()
            .map_err(|error| {
                InfraError::StoreFailure(format!("record store lock poisoned: {error}"))
            })
    }

    fn hydrate(records: &HashMap<RecordKey, StoredRecord>, record: StoredRecord) -> StoredRecord {
        match record {
            StoredRecord::Tag(tag) => StoredRecord::Tag(Self::with_session_ids(records, tag)),
            StoredRecord::TimerSettings(mut settings) => {
                settings.current_tag = settings.current_tag.and_then(|tag| {
                    match records.get(&(RecordKind::Tag, tag.id)) {
                        Some(StoredRecord::Tag(live)) => {
                            Some(Self::with_session_ids(records, live.clone()))
                        }
                        _ => None,
                    }
                });
                StoredRecord::TimerSettings(settings)
            }
            session @ StoredRecord::PomodoroSession(_) => session,
        }
    }

    fn with_session_ids(records: &HashMap<RecordKey, StoredRecord>, mut tag: Tag) -> Tag {
        let mut session_ids = records
            .values()
            .filter_map(|record| match record {
                StoredRecord::PomodoroSession(session)
                    if session.tag.as_ref().is_some_and(|snapshot| snapshot.id == tag.id) =>
                {
                    Some(session.id.clone())
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        session_ids.sort();
        tag.session_ids = session_ids;
        tag
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn write(&self, batch: WriteBatch) -> Result<(), InfraError> {
        self.check_available()?;
        if batch.is_empty() {
            return Ok(());
        }
        let kinds = batch.touched_kinds();
        {
            let mut records = self.lock()?;
            for op in batch.ops {
                match op {
                    WriteOp::Upsert(record) => {
                        let key = (record.kind(), record.id().to_string());
                        let record = match (records.get(&key), record) {
                            (Some(StoredRecord::Tag(existing)), StoredRecord::Tag(mut tag)) => {
                                tag.created_at = existing.created_at;
                                StoredRecord::Tag(tag)
                            }
                            (
                                Some(StoredRecord::PomodoroSession(existing)),
                                StoredRecord::PomodoroSession(mut session),
                            ) => {
                                session.created_at = existing.created_at;
                                StoredRecord::PomodoroSession(session)
                            }
                            (_, record) => record,
                        };
                        let record = match record {
                            StoredRecord::Tag(mut tag) => {
                                tag.session_ids.clear();
                                StoredRecord::Tag(tag)
                            }
                            other => other,
                        };
                        records.insert(key, record);
                    }
                    WriteOp::Delete { kind, id } => {
                        records.remove(&(kind, id));
                    }
                }
            }
        }
        self.broadcast(ChangeEvent { kinds });
        Ok(())
    }

    async fn query(&self, kind: RecordKind, query: Query) -> Result<Vec<StoredRecord>, InfraError> {
        self.queries.fetch_add(1, AtomicOrdering::SeqCst);
        self.check_available()?;
        let records = self.lock()?;
        let candidates = records
            .iter()
            .filter(|((record_kind, _), _)| *record_kind == kind)
            .map(|(_, record)| Self::hydrate(&records, record.clone()))
            .collect::<Vec<_>>();
        Ok(query.apply(candidates))
    }

    async fn delete_by_id(&self, kind: RecordKind, id: &str) -> Result<(), InfraError> {
        self.check_available()?;
        let removed = self.lock()?.remove(&(kind, id.to_string()));
        if removed.is_none() {
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
