use crate::application::repository::SessionRepository;
use crate::domain::models::{PomodoroSession, SessionType};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::record_store::{Filter, Query, RecordStore, SortDescriptor, SortKey};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

pub const UNTAGGED_LABEL: &str = "Untagged";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFocus {
    pub tag_id: Option<String>,
    pub tag_name: String,
    pub focus: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusSummary {
    pub completed_work_sessions: usize,
    pub total_focus: Duration,
    /// Largest total first.
    pub per_tag: Vec<TagFocus>,
}

/// Work sessions starting in `[start, end)`. An ongoing session counts up to `now`.
pub fn summarize(
    sessions: &[PomodoroSession],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    now: DateTime<Utc>,
) -> FocusSummary {
    let mut completed_work_sessions = 0;
    let mut total_focus = Duration::zero();
    let mut per_tag: BTreeMap<Option<String>, TagFocus> = BTreeMap::new();

    for session in sessions.iter().filter(|session| {
        session.session_type == SessionType::Work
            && session.start_at >= start
            && session.start_at < end
    }) {
        let focus = session.duration(now);
        if !session.is_ongoing() {
            completed_work_sessions += 1;
        }
        total_focus += focus;

        let tag_id = session.tag.as_ref().map(|tag| tag.id.clone());
        let entry = per_tag.entry(tag_id.clone()).or_insert_with(|| TagFocus {
            tag_id,
            tag_name: session
                .tag
                .as_ref()
                .map_or_else(|| UNTAGGED_LABEL.to_string(), |tag| tag.name.clone()),
            focus: Duration::zero(),
        });
        entry.focus += focus;
    }

    let mut per_tag = per_tag.into_values().collect::<Vec<_>>();
    per_tag.sort_by(|left, right| {
        right
            .focus
            .cmp(&left.focus)
            .then_with(|| left.tag_name.cmp(&right.tag_name))
    });

    FocusSummary {
        completed_work_sessions,
        total_focus,
        per_tag,
    }
}

pub struct HistoryService<S>
where
    S: RecordStore,
{
    repository: SessionRepository<S>,
}

impl<S> HistoryService<S>
where
    S: RecordStore,
{
    pub fn new(repository: SessionRepository<S>) -> Self {
        Self { repository }
    }

    /// Newest first.
    pub async fn list_sessions(&self) -> Result<Vec<PomodoroSession>, InfraError> {
        self.repository
            .fetch_all(vec![SortDescriptor::desc(SortKey::CreatedAt)])
            .await
    }

    pub async fn summary(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FocusSummary, InfraError> {
        let sessions = self
            .repository
            .fetch::<PomodoroSession>(Query {
                filter: Some(Filter::StartedBetween { start, end }),
                ..Query::default()
            })
            .await?;
        Ok(summarize(&sessions, start, end, now))
    }
}
