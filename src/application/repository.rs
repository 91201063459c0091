use crate::domain::models::{PomodoroSession, TimerSettings, TIMER_SETTINGS_ID};
use crate::domain::timer_engine::{SessionSnapshot, SessionWrite, WriteSet};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::record_store::{
    ChangeEvent, Filter, Query, Record, RecordKind, RecordStore, SortDescriptor, SortKey,
    WriteBatch,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Typed access to a [`RecordStore`].
pub struct SessionRepository<S>
where
    S: RecordStore,
{
    store: Arc<S>,
}

impl<S> Clone for SessionRepository<S>
where
    S: RecordStore,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S> SessionRepository<S>
where
    S: RecordStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn insert<R: Record>(&self, record: R) -> Result<(), InfraError> {
        self.store
            .write(WriteBatch::default().upsert(record.into_stored()))
            .await
    }

    pub async fn insert_batch<R: Record>(&self, records: Vec<R>) -> Result<(), InfraError> {
        let batch = records
            .into_iter()
            .fold(WriteBatch::default(), |batch, record| {
                batch.upsert(record.into_stored())
            });
        self.store.write(batch).await
    }

    pub async fn fetch<R: Record>(&self, query: Query) -> Result<Vec<R>, InfraError> {
        let records = self.store.query(R::KIND, query).await?;
        Ok(records.into_iter().filter_map(R::from_stored).collect())
    }

    pub async fn fetch_all<R: Record>(
        &self,
        sort: Vec<SortDescriptor>,
    ) -> Result<Vec<R>, InfraError> {
        self.fetch(Query {
            sort,
            ..Query::default()
        })
        .await
    }

    pub async fn fetch_by_id<R: Record>(&self, id: &str) -> Result<Option<R>, InfraError> {
        Ok(self.fetch(Query::by_id(id)).await?.into_iter().next())
    }

    pub async fn delete_by_id<R: Record>(&self, id: &str) -> Result<(), InfraError> {
        self.store.delete_by_id(R::KIND, id).await
    }

    pub fn observe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.store.observe_changes()
    }

    /// The open session with the latest `start_at`. More than one open session
    /// should not exist; if it does the newest wins.
    pub async fn ongoing_session(&self) -> Result<Option<PomodoroSession>, InfraError> {
        let open = self
            .fetch::<PomodoroSession>(Query {
                filter: Some(Filter::OngoingSession),
                sort: vec![SortDescriptor::desc(SortKey::StartAt)],
                limit: None,
            })
            .await?;
        if open.len() > 1 {
            warn!(count = open.len(), "more than one ongoing session");
        }
        Ok(open.into_iter().next())
    }

    /// Persisted settings, or defaults when none were saved yet.
    pub async fn timer_settings(&self) -> Result<TimerSettings, InfraError> {
        Ok(self
            .fetch_by_id::<TimerSettings>(TIMER_SETTINGS_ID)
            .await?
            .unwrap_or_default())
    }

    pub async fn save_settings(&self, settings: TimerSettings) -> Result<(), InfraError> {
        settings.validate().map_err(InfraError::InvalidConfig)?;
        self.insert(settings).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, InfraError> {
        let ongoing = self.ongoing_session().await?;
        let settings = self.timer_settings().await?;
        Ok(SessionSnapshot { ongoing, settings })
    }

    pub async fn apply(&self, writes: &WriteSet) -> Result<(), InfraError> {
        let batch = writes
            .writes
            .iter()
            .fold(WriteBatch::default(), |batch, write| match write {
                SessionWrite::Upsert(session) => batch.upsert(session.clone().into_stored()),
                SessionWrite::Delete { id } => batch.delete(RecordKind::PomodoroSession, id),
            });
        self.store.write(batch).await
    }
}
