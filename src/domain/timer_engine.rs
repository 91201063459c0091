//! Pure timer derivations: which phase the timer is in, what the ring shows,
//! and which session records a user action writes.

use crate::domain::models::{
    clamp_non_negative, PomodoroSession, SessionType, Tag, TimerMode, TimerSettings,
};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

pub const CANCEL_DELETE_THRESHOLD_SECONDS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionData {
    pub session: PomodoroSession,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Working(SessionData),
    OnBreak(SessionData),
}

impl Phase {
    pub fn is_ongoing(&self) -> bool {
        !matches!(self, Self::Idle)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working(_) => "working",
            Self::OnBreak(_) => "on_break",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerDisplay {
    pub elapsed: Duration,
    /// Time left on a countdown, or the counted-up time once overtime or in count-up mode.
    pub remaining: Duration,
    /// Ring fill in `[0, 1]`.
    pub progress: f64,
    pub is_overtime: bool,
}

impl TimerDisplay {
    pub fn idle(settings: &TimerSettings) -> Self {
        let remaining = match settings.timer_mode {
            TimerMode::CountDown => settings.work_duration(),
            TimerMode::CountUp => Duration::zero(),
        };
        Self {
            elapsed: Duration::zero(),
            remaining,
            progress: 1.0,
            is_overtime: false,
        }
    }

    /// `mm:ss`, prefixed with `+` while overtime.
    pub fn timer_text(&self) -> String {
        let total = self.remaining.num_seconds().max(0);
        let prefix = if self.is_overtime { "+" } else { "" };
        format!("{prefix}{:02}:{:02}", total / 60, total % 60)
    }
}

/// Ongoing session and settings as read together from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub ongoing: Option<PomodoroSession>,
    pub settings: TimerSettings,
}

impl SessionSnapshot {
    pub fn phase(&self) -> Phase {
        derive_phase(self.ongoing.as_ref())
    }

    pub fn display(&self, now: DateTime<Utc>) -> TimerDisplay {
        compute_timer_display(self.ongoing.as_ref(), &self.settings, now)
    }

    /// Tag shown on the ring: the running session's snapshot, else the selected tag.
    pub fn display_tag(&self) -> Option<&Tag> {
        self.ongoing
            .as_ref()
            .and_then(|session| session.tag.as_ref())
            .or(self.settings.current_tag.as_ref())
    }
}

pub fn derive_phase(ongoing: Option<&PomodoroSession>) -> Phase {
    match ongoing.filter(|session| session.is_ongoing()) {
        None => Phase::Idle,
        Some(session) => {
            let data = SessionData {
                session: session.clone(),
            };
            match session.session_type {
                SessionType::Work => Phase::Working(data),
                SessionType::Break => Phase::OnBreak(data),
            }
        }
    }
}

pub fn compute_timer_display(
    ongoing: Option<&PomodoroSession>,
    settings: &TimerSettings,
    now: DateTime<Utc>,
) -> TimerDisplay {
    let Some(session) = ongoing.filter(|session| session.is_ongoing()) else {
        return TimerDisplay::idle(settings);
    };

    let elapsed = session.elapsed(now);
    match (session.session_type, settings.timer_mode) {
        (SessionType::Work, TimerMode::CountUp) => TimerDisplay {
            elapsed,
            remaining: elapsed,
            progress: ratio(elapsed, settings.work_duration()),
            is_overtime: false,
        },
        (SessionType::Work, TimerMode::CountDown) => countdown(elapsed, settings.work_duration()),
        // TODO: pick long_break_duration every `session_cycle` work sessions.
        (SessionType::Break, _) => countdown(elapsed, settings.short_break_duration()),
    }
}

fn countdown(elapsed: Duration, target: Duration) -> TimerDisplay {
    let target = clamp_non_negative(target);
    if elapsed < target {
        let remaining = target - elapsed;
        return TimerDisplay {
            elapsed,
            remaining,
            progress: ratio(remaining, target),
            is_overtime: false,
        };
    }

    TimerDisplay {
        elapsed,
        remaining: elapsed - target,
        progress: 0.0,
        is_overtime: true,
    }
}

fn ratio(part: Duration, whole: Duration) -> f64 {
    let whole_ms = whole.num_milliseconds();
    if whole_ms <= 0 {
        return 1.0;
    }
    (part.num_milliseconds() as f64 / whole_ms as f64).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Start,
    AdvancePhase,
    /// Long-press abandon.
    Cancel,
}

impl TimerAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::AdvancePhase => "advance_phase",
            Self::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionWrite {
    Upsert(PomodoroSession),
    Delete { id: String },
}

/// Session writes that must be persisted in one atomic batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    pub writes: Vec<SessionWrite>,
}

impl WriteSet {
    pub fn opened(&self) -> Option<&PomodoroSession> {
        self.upserts().find(|session| session.is_ongoing())
    }

    pub fn closed(&self) -> Option<&PomodoroSession> {
        self.upserts().find(|session| !session.is_ongoing())
    }

    pub fn deleted_id(&self) -> Option<&str> {
        self.writes.iter().find_map(|write| match write {
            SessionWrite::Delete { id } => Some(id.as_str()),
            SessionWrite::Upsert(_) => None,
        })
    }

    fn upserts(&self) -> impl Iterator<Item = &PomodoroSession> {
        self.writes.iter().filter_map(|write| match write {
            SessionWrite::Upsert(session) => Some(session),
            SessionWrite::Delete { .. } => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("session already ongoing: {0}")]
    SessionAlreadyOngoing(String),
    #[error("no ongoing session")]
    NoOngoingSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPolicy {
    /// Cancelled sessions at or under this age are deleted instead of closed.
    pub cancel_delete_threshold: Duration,
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self {
            cancel_delete_threshold: Duration::seconds(CANCEL_DELETE_THRESHOLD_SECONDS),
        }
    }
}

impl TransitionPolicy {
    pub fn plan(
        &self,
        action: TimerAction,
        ongoing: Option<&PomodoroSession>,
        settings: &TimerSettings,
        now: DateTime<Utc>,
    ) -> Result<WriteSet, TransitionError> {
        let ongoing = ongoing.filter(|session| session.is_ongoing());
        let writes = match (action, ongoing) {
            (TimerAction::Start, Some(session)) => {
                return Err(TransitionError::SessionAlreadyOngoing(session.id.clone()));
            }
            (TimerAction::Start, None) => vec![SessionWrite::Upsert(PomodoroSession::start(
                SessionType::Work,
                settings.current_tag.as_ref(),
                now,
            ))],
            (TimerAction::AdvancePhase | TimerAction::Cancel, None) => {
                return Err(TransitionError::NoOngoingSession);
            }
            (TimerAction::AdvancePhase, Some(session)) => match session.session_type {
                SessionType::Work => vec![
                    SessionWrite::Upsert(session.closed_at(now)),
                    SessionWrite::Upsert(PomodoroSession::start(
                        SessionType::Break,
                        session.tag.as_ref(),
                        now,
                    )),
                ],
                SessionType::Break => vec![SessionWrite::Upsert(session.closed_at(now))],
            },
            (TimerAction::Cancel, Some(session)) => {
                if session.elapsed(now) <= self.cancel_delete_threshold {
                    vec![SessionWrite::Delete {
                        id: session.id.clone(),
                    }]
                } else {
                    vec![SessionWrite::Upsert(session.closed_at(now))]
                }
            }
        };
        Ok(WriteSet { writes })
    }
}

pub fn plan_transition(
    action: TimerAction,
    ongoing: Option<&PomodoroSession>,
    settings: &TimerSettings,
    now: DateTime<Utc>,
) -> Result<WriteSet, TransitionError> {
    TransitionPolicy::default().plan(action, ongoing, settings, now)
}
