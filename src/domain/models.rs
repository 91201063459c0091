use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const FOCUS_TAG_ID: &str = "focus";
pub const TIMER_SETTINGS_ID: &str = "0";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub color_hex: String,
    pub sort: i32,
    /// Ids of sessions recorded under this tag. Filled in by the store on read.
    #[serde(default)]
    pub session_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tag {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        color_hex: impl Into<String>,
        sort: i32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color_hex: color_hex.into(),
            sort,
            session_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn focus() -> Self {
        Self::new(FOCUS_TAG_ID, "Focus", "#007AFF", 0, DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Tags seeded on first launch.
    pub fn default_tags(now: DateTime<Utc>) -> Vec<Tag> {
        vec![
            Self::new(FOCUS_TAG_ID, "Focus", "#007AFF", 0, now),
            Self::new("study", "Study", "#34C759", 1, now),
            Self::new("reading", "Reading", "#FF9500", 2, now),
            Self::new("exercise", "Exercise", "#FF2D55", 3, now),
        ]
    }

    /// Copy stored on a session; later edits to the tag do not reach it.
    pub fn snapshot(&self) -> Tag {
        Tag {
            session_ids: Vec::new(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "tag.id")?;
        validate_non_empty(&self.name, "tag.name")?;
        validate_color_hex(&self.color_hex, "tag.color_hex")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SessionType {
    Work,
    Break,
}

impl SessionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Work => "work",
            Self::Break => "break",
        }
    }

    pub fn from_raw(value: &str) -> Option<Self> {
        match value {
            "work" => Some(Self::Work),
            "break" => Some(Self::Break),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum TimerMode {
    CountUp,
    #[default]
    CountDown,
}

impl TimerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CountUp => "countUp",
            Self::CountDown => "countDown",
        }
    }

    pub fn from_raw(value: &str) -> Option<Self> {
        match value {
            "countUp" => Some(Self::CountUp),
            "countDown" => Some(Self::CountDown),
            _ => None,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::CountUp => "Count Up",
            Self::CountDown => "Count Down",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum BackgroundMusicType {
    Bird,
    Clock,
    Insect,
    OpenFire,
    Rain,
    River,
    Wave,
    #[default]
    Random,
}

impl BackgroundMusicType {
    pub const TRACKS: [BackgroundMusicType; 7] = [
        Self::Bird,
        Self::Clock,
        Self::Insect,
        Self::OpenFire,
        Self::Rain,
        Self::River,
        Self::Wave,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bird => "bird",
            Self::Clock => "clock",
            Self::Insect => "insect",
            Self::OpenFire => "openFire",
            Self::Rain => "rain",
            Self::River => "river",
            Self::Wave => "wave",
            Self::Random => "random",
        }
    }

    pub fn from_raw(value: &str) -> Option<Self> {
        Self::TRACKS
            .into_iter()
            .chain([Self::Random])
            .find(|candidate| candidate.as_str() == value)
    }

    /// Picks a concrete track for `Random`; other values resolve to themselves.
    pub fn resolve<R: Rng + ?Sized>(self, rng: &mut R) -> BackgroundMusicType {
        match self {
            Self::Random => Self::TRACKS.choose(rng).copied().unwrap_or(Self::Rain),
            track => track,
        }
    }

    pub fn file_name(self) -> Option<String> {
        match self {
            Self::Random => None,
            track => Some(format!("{}.mp3", track.as_str())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerSettings {
    pub work_minutes: i32,
    pub short_break_minutes: i32,
    pub long_break_minutes: i32,
    /// Work sessions before a long break. Stored, not yet consulted by transitions.
    pub session_cycle: i32,
    pub timer_mode: TimerMode,
    pub background_music_type: BackgroundMusicType,
    pub current_tag: Option<Tag>,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            work_minutes: 25,
            short_break_minutes: 5,
            long_break_minutes: 15,
            session_cycle: 4,
            timer_mode: TimerMode::default(),
            background_music_type: BackgroundMusicType::default(),
            current_tag: Some(Tag::focus()),
        }
    }
}

impl TimerSettings {
    pub fn work_duration(&self) -> Duration {
        minutes(self.work_minutes)
    }

    pub fn short_break_duration(&self) -> Duration {
        minutes(self.short_break_minutes)
    }

    pub fn long_break_duration(&self) -> Duration {
        minutes(self.long_break_minutes)
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_positive(self.work_minutes, "settings.work_minutes")?;
        validate_positive(self.short_break_minutes, "settings.short_break_minutes")?;
        validate_positive(self.long_break_minutes, "settings.long_break_minutes")?;
        validate_positive(self.session_cycle, "settings.session_cycle")?;
        if let Some(tag) = &self.current_tag {
            tag.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PomodoroSession {
    pub id: String,
    pub session_type: SessionType,
    pub tag: Option<Tag>,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PomodoroSession {
    /// Opens a new session starting at `now`.
    pub fn start(session_type: SessionType, tag: Option<&Tag>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_type,
            tag: tag.map(Tag::snapshot),
            start_at: now,
            end_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn closed_at(&self, now: DateTime<Utc>) -> Self {
        Self {
            end_at: Some(now),
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn is_ongoing(&self) -> bool {
        self.end_at.is_none()
    }

    /// Time since `start_at`, never negative.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        clamp_non_negative(now - self.start_at)
    }

    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        self.elapsed(self.end_at.unwrap_or(now))
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "session.id")?;
        if let Some(end_at) = self.end_at {
            if end_at < self.start_at {
                return Err("session.end_at must be >= session.start_at".to_string());
            }
        }
        Ok(())
    }
}

pub(crate) fn clamp_non_negative(value: Duration) -> Duration {
    value.max(Duration::zero())
}

fn minutes(value: i32) -> Duration {
    Duration::seconds(i64::from(value.max(0)) * 60)
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}

fn validate_positive(value: i32, field_name: &str) -> Result<(), String> {
    if value <= 0 {
        return Err(format!("{field_name} must be > 0"));
    }
    Ok(())
}

fn validate_color_hex(value: &str, field_name: &str) -> Result<(), String> {
    let Some(digits) = value.strip_prefix('#') else {
        return Err(format!("{field_name} must be #RRGGBB or #RRGGBBAA"));
    };
    if !matches!(digits.len(), 6 | 8) || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("{field_name} must be #RRGGBB or #RRGGBBAA"));
    }
    Ok(())
}
