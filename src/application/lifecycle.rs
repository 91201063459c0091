//! Owns the display state of the timer: fetches the ongoing session and
//! settings, re-fetches on store changes, ticks the countdown between fetches
//! and turns user actions into session writes.

use crate::application::repository::SessionRepository;
use crate::domain::models::{Tag, TimerMode, TimerSettings};
use crate::domain::timer_engine::{
    Phase, SessionSnapshot, TimerAction, TimerDisplay, TransitionError, TransitionPolicy,
};
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::effects::{NoopSoundEffects, SoundEffects};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::record_store::RecordStore;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub type NowProvider = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

const FOCUS_ANNOUNCEMENT: &str = "Focus time";
const BREAK_ANNOUNCEMENT: &str = "Time for a break";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub tick_interval: Duration,
    pub debounce_window: Duration,
    pub transition_policy: TransitionPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
            debounce_window: Duration::from_millis(500),
            transition_policy: TransitionPolicy::default(),
        }
    }
}

impl From<&AppConfig> for ControllerConfig {
    fn from(config: &AppConfig) -> Self {
        let defaults = TransitionPolicy::default();
        let cancel_delete_threshold = i64::try_from(config.cancel_threshold_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(defaults.cancel_delete_threshold);
        Self {
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            debounce_window: Duration::from_millis(config.debounce_ms),
            transition_policy: TransitionPolicy {
                cancel_delete_threshold,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimerSnapshot {
    pub phase: Phase,
    pub display: TimerDisplay,
    pub timer_mode: TimerMode,
    pub current_tag: Option<Tag>,
}

impl TimerSnapshot {
    pub fn at(snapshot: &SessionSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            phase: snapshot.phase(),
            display: snapshot.display(now),
            timer_mode: snapshot.settings.timer_mode,
            current_tag: snapshot.display_tag().cloned(),
        }
    }
}

/// What went wrong, as far as the display is concerned. Store errors are only
/// logged; they never reach the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The ongoing session or the settings could not be read.
    StoreUnavailable,
    /// A timer action could not be saved.
    SaveFailed,
}

impl FailureKind {
    pub fn user_message(self) -> &'static str {
        match self {
            Self::StoreUnavailable => {
                "Your sessions could not be loaded. They will reload on the next change."
            }
            Self::SaveFailed => "The timer change could not be saved. Try again.",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayState {
    Loading,
    Success(TimerSnapshot),
    Failure(FailureKind),
}

impl DisplayState {
    pub fn snapshot(&self) -> Option<&TimerSnapshot> {
        match self {
            Self::Success(snapshot) => Some(snapshot),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] InfraError),
}

impl ControllerError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Transition(TransitionError::SessionAlreadyOngoing(_)) => {
                "A session is already running."
            }
            Self::Transition(TransitionError::NoOngoingSession) => "No session is running.",
            Self::Store(_) => FailureKind::SaveFailed.user_message(),
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Gate {
    epoch: u64,
    active: bool,
}

/// The display slot plus the tick loop feeding it. Every publication bumps or
/// checks the gate under its lock, so a cancelled tick loop can never publish
/// and nothing publishes while the controller is inactive.
struct Publisher {
    display: watch::Sender<DisplayState>,
    gate: Mutex<Gate>,
    ticker: Mutex<Option<AbortOnDrop>>,
}

impl Publisher {
    fn new() -> Self {
        let (display, _) = watch::channel(DisplayState::Loading);
        Self {
            display,
            gate: Mutex::new(Gate::default()),
            ticker: Mutex::new(None),
        }
    }

    fn open(&self) {
        lock(&self.gate).active = true;
    }

    fn close(&self) {
        let mut gate = lock(&self.gate);
        gate.active = false;
        gate.epoch += 1;
        *lock(&self.ticker) = None;
    }

    fn show_snapshot(
        self: &Arc<Self>,
        snapshot: SessionSnapshot,
        now_provider: &NowProvider,
        tick_interval: Duration,
    ) {
        let mut gate = lock(&self.gate);
        if !gate.active {
            debug!("inactive; dropping snapshot");
            return;
        }
        gate.epoch += 1;
        let mut ticker = lock(&self.ticker);
        *ticker = None;

        self.display.send_replace(DisplayState::Success(TimerSnapshot::at(
            &snapshot,
            now_provider(),
        )));
        if snapshot.phase().is_ongoing() {
            debug!(epoch = gate.epoch, "starting tick loop");
            *ticker = Some(AbortOnDrop(tokio::spawn(Self::tick_loop(
                Arc::clone(self),
                snapshot,
                Arc::clone(now_provider),
                tick_interval,
                gate.epoch,
            ))));
        }
    }

    fn show_failure(&self, kind: FailureKind) {
        let mut gate = lock(&self.gate);
        if !gate.active {
            return;
        }
        gate.epoch += 1;
        *lock(&self.ticker) = None;
        self.display.send_replace(DisplayState::Failure(kind));
    }

    fn publish_if_current(&self, epoch: u64, state: DisplayState) -> bool {
        let gate = lock(&self.gate);
        if !gate.active || gate.epoch != epoch {
            return false;
        }
        self.display.send_replace(state);
        true
    }

    async fn tick_loop(
        publisher: Arc<Self>,
        snapshot: SessionSnapshot,
        now_provider: NowProvider,
        period: Duration,
        epoch: u64,
    ) {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let state = DisplayState::Success(TimerSnapshot::at(&snapshot, now_provider()));
            if !publisher.publish_if_current(epoch, state) {
                break;
            }
        }
    }
}

/// Everything the subscription task needs, cloned out of the controller.
struct Worker<S>
where
    S: RecordStore,
{
    repository: SessionRepository<S>,
    publisher: Arc<Publisher>,
    now_provider: NowProvider,
    config: ControllerConfig,
}

impl<S> Worker<S>
where
    S: RecordStore + 'static,
{
    async fn refresh_snapshot(&self) {
        match self.repository.snapshot().await {
            Ok(snapshot) => {
                self.publisher
                    .show_snapshot(snapshot, &self.now_provider, self.config.tick_interval)
            }
            Err(error) => {
                warn!(error = %error, "failed to fetch session snapshot");
                self.publisher.show_failure(FailureKind::StoreUnavailable);
            }
        }
    }

    async fn run(self) {
        let mut changes = self.repository.observe_changes();
        self.refresh_snapshot().await;

        let mut deadline: Option<Instant> = None;
        let mut listening = true;
        loop {
            tokio::select! {
                received = changes.recv(), if listening => match received {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        if deadline.is_none() {
                            debug!("store changed; waiting for debounce window");
                            deadline = Some(Instant::now() + self.config.debounce_window);
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("change channel closed");
                        listening = false;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    self.refresh_snapshot().await;
                }
                else => break,
            }
        }
    }
}

pub struct SessionLifecycleController<S>
where
    S: RecordStore + 'static,
{
    repository: SessionRepository<S>,
    config: ControllerConfig,
    now_provider: NowProvider,
    effects: Arc<dyn SoundEffects>,
    publisher: Arc<Publisher>,
    subscription: Mutex<Option<AbortOnDrop>>,
}

impl<S> SessionLifecycleController<S>
where
    S: RecordStore + 'static,
{
    pub fn new(repository: SessionRepository<S>, config: ControllerConfig) -> Self {
        Self {
            repository,
            config,
            now_provider: Arc::new(Utc::now),
            effects: Arc::new(NoopSoundEffects),
            publisher: Arc::new(Publisher::new()),
            subscription: Mutex::new(None),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn with_effects(mut self, effects: Arc<dyn SoundEffects>) -> Self {
        self.effects = effects;
        self
    }

    /// Starts listening for store changes. Must be called inside a tokio runtime.
    pub fn activate(&self) {
        let mut subscription = lock(&self.subscription);
        if subscription.is_some() {
            return;
        }
        let worker = Worker {
            repository: self.repository.clone(),
            publisher: Arc::clone(&self.publisher),
            now_provider: Arc::clone(&self.now_provider),
            config: self.config,
        };
        self.publisher.open();
        *subscription = Some(AbortOnDrop(tokio::spawn(worker.run())));
        info!("session lifecycle activated");
    }

    pub fn deactivate(&self) {
        if lock(&self.subscription).take().is_some() {
            info!("session lifecycle deactivated");
        }
        self.publisher.close();
    }

    pub fn subscribe(&self) -> watch::Receiver<DisplayState> {
        self.publisher.display.subscribe()
    }

    pub fn display_state(&self) -> DisplayState {
        self.publisher.display.borrow().clone()
    }

    /// Plans and saves one action, then shows its outcome right away. The
    /// store's change event still drives the single debounced re-fetch.
    pub async fn handle(&self, action: TimerAction) -> Result<(), ControllerError> {
        let snapshot = self.repository.snapshot().await.inspect_err(|error| {
            warn!(action = action.as_str(), error = %error, "failed to read session snapshot");
            self.publisher.show_failure(FailureKind::StoreUnavailable);
        })?;
        let writes = self.config.transition_policy.plan(
            action,
            snapshot.ongoing.as_ref(),
            &snapshot.settings,
            (self.now_provider)(),
        )?;

        info!(
            action = action.as_str(),
            phase = snapshot.phase().as_str(),
            writes = writes.writes.len(),
            "applying timer action"
        );
        if let Err(write_error) = self.repository.apply(&writes).await {
            error!(
                action = action.as_str(),
                error = %write_error,
                "failed to persist timer action"
            );
            self.publisher.show_failure(FailureKind::SaveFailed);
            return Err(write_error.into());
        }

        self.fire_effects(action, &snapshot);
        let after = SessionSnapshot {
            ongoing: writes.opened().cloned(),
            settings: snapshot.settings,
        };
        self.publisher
            .show_snapshot(after, &self.now_provider, self.config.tick_interval);
        Ok(())
    }

    pub async fn update_settings(&self, settings: TimerSettings) -> Result<(), ControllerError> {
        self.repository.save_settings(settings).await?;
        Ok(())
    }

    fn fire_effects(&self, action: TimerAction, before: &SessionSnapshot) {
        match (action, before.phase()) {
            (TimerAction::Start, _) => {
                let track = before
                    .settings
                    .background_music_type
                    .resolve(&mut rand::thread_rng());
                if let Some(file_name) = track.file_name() {
                    self.effects.play(&file_name, true);
                }
                self.effects.speak(FOCUS_ANNOUNCEMENT);
            }
            (TimerAction::AdvancePhase, Phase::Working(_)) => {
                self.effects.speak(BREAK_ANNOUNCEMENT);
            }
            _ => {
                self.effects.stop();
                self.effects.stop_speaking();
            }
        }
    }
}

impl<S> Drop for SessionLifecycleController<S>
where
    S: RecordStore + 'static,
{
    fn drop(&mut self) {
        self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{BackgroundMusicType, PomodoroSession, SessionType};
    use crate::infrastructure::effects::{EffectCall, RecordingSoundEffects};
    use crate::infrastructure::record_store::{
        ChangeEvent, Filter, InMemoryRecordStore, Query, RecordKind, StoredRecord, WriteBatch,
    };
    use async_trait::async_trait;
    use std::future::Future;
    use tokio::sync::{broadcast, Semaphore};

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-16T09:00:00Z")
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    /// Wall clock driven by tokio's paused clock.
    fn paused_clock() -> NowProvider {
        let origin = Instant::now();
        Arc::new(move || {
            t0() + chrono::Duration::from_std(origin.elapsed()).expect("elapsed fits")
        })
    }

    fn controller(
        store: &Arc<InMemoryRecordStore>,
    ) -> SessionLifecycleController<InMemoryRecordStore> {
        SessionLifecycleController::new(
            SessionRepository::new(Arc::clone(store)),
            ControllerConfig::default(),
        )
        .with_now_provider(paused_clock())
    }

    async fn within_a_minute<T>(future: impl Future<Output = T>) -> T {
        tokio::time::timeout(Duration::from_secs(60), future)
            .await
            .expect("condition reached in time")
    }

    async fn wait_for_phase(receiver: &mut watch::Receiver<DisplayState>, phase: &'static str) {
        within_a_minute(receiver.wait_for(|state| {
            state
                .snapshot()
                .is_some_and(|snapshot| snapshot.phase.as_str() == phase)
        }))
        .await
        .expect("display sender alive");
    }

    /// Holds every write until [`HeldWrites::release`] lets one through.
    struct HeldWrites {
        inner: InMemoryRecordStore,
        released: Semaphore,
    }

    impl HeldWrites {
        fn new() -> Self {
            Self {
                inner: InMemoryRecordStore::default(),
                released: Semaphore::new(0),
            }
        }

        fn release(&self) {
            self.released.add_permits(1);
        }
    }

    #[async_trait]
    impl RecordStore for HeldWrites {
        async fn write(&self, batch: WriteBatch) -> Result<(), InfraError> {
            let _permit = self
                .released
                .acquire()
                .await
                .map_err(|error| InfraError::StoreFailure(error.to_string()))?;
            self.inner.write(batch).await
        }

        async fn query(
            &self,
            kind: RecordKind,
            query: Query,
        ) -> Result<Vec<StoredRecord>, InfraError> {
            self.inner.query(kind, query).await
        }

        async fn delete_by_id(&self, kind: RecordKind, id: &str) -> Result<(), InfraError> {
            self.inner.delete_by_id(kind, id).await
        }

        fn observe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
            self.inner.observe_changes()
        }
    }

    async fn open_sessions(store: &InMemoryRecordStore) -> usize {
        store
            .query(
                crate::infrastructure::record_store::RecordKind::PomodoroSession,
                Query {
                    filter: Some(Filter::OngoingSession),
                    ..Query::default()
                },
            )
            .await
            .expect("query open sessions")
            .len()
    }

    #[tokio::test(start_paused = true)]
    async fn activation_publishes_idle_with_work_duration() {
        let store = Arc::new(InMemoryRecordStore::default());
        let controller = controller(&store);
        assert_eq!(controller.display_state(), DisplayState::Loading);

        let mut receiver = controller.subscribe();
        controller.activate();
        controller.activate();
        wait_for_phase(&mut receiver, "idle").await;

        let state = controller.display_state();
        let snapshot = state.snapshot().expect("success state");
        assert_eq!(snapshot.display.timer_text(), "25:00");
        assert_eq!(snapshot.display.progress, 1.0);
        assert_eq!(snapshot.timer_mode, TimerMode::CountDown);
    }

    #[tokio::test(start_paused = true)]
    async fn start_then_ticks_count_down() {
        let store = Arc::new(InMemoryRecordStore::default());
        let controller = controller(&store);
        let mut receiver = controller.subscribe();
        controller.activate();
        wait_for_phase(&mut receiver, "idle").await;

        controller.handle(TimerAction::Start).await.expect("start");
        wait_for_phase(&mut receiver, "working").await;

        tokio::time::sleep(Duration::from_secs(600)).await;
        let state = controller.display_state();
        let snapshot = state.snapshot().expect("success state");
        assert_eq!(snapshot.display.timer_text(), "15:00");
        assert!(!snapshot.display.is_overtime);

        tokio::time::sleep(Duration::from_secs(960)).await;
        let state = controller.display_state();
        let snapshot = state.snapshot().expect("success state");
        assert!(snapshot.display.is_overtime);
        let text = snapshot.display.timer_text();
        assert!(matches!(text.as_str(), "+00:59" | "+01:00"), "unexpected {text}");
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_session_is_open_through_a_full_cycle() {
        let store = Arc::new(InMemoryRecordStore::default());
        let controller = controller(&store);
        controller.activate();

        controller.handle(TimerAction::Start).await.expect("start");
        assert_eq!(open_sessions(&store).await, 1);

        tokio::time::sleep(Duration::from_secs(1500)).await;
        controller
            .handle(TimerAction::AdvancePhase)
            .await
            .expect("advance to break");
        assert_eq!(open_sessions(&store).await, 1);

        tokio::time::sleep(Duration::from_secs(300)).await;
        controller
            .handle(TimerAction::AdvancePhase)
            .await
            .expect("advance to idle");
        assert_eq!(open_sessions(&store).await, 0);

        let result = controller.handle(TimerAction::Cancel).await;
        assert!(matches!(
            result,
            Err(ControllerError::Transition(TransitionError::NoOngoingSession))
        ));
        assert_eq!(open_sessions(&store).await, 0);

        let start_again = controller.handle(TimerAction::Start).await;
        assert!(start_again.is_ok());
        let duplicate = controller.handle(TimerAction::Start).await;
        assert!(matches!(
            duplicate,
            Err(ControllerError::Transition(TransitionError::SessionAlreadyOngoing(_)))
        ));
        assert_eq!(open_sessions(&store).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_deletes_short_sessions_and_closes_long_ones() {
        let store = Arc::new(InMemoryRecordStore::default());
        let controller = controller(&store);
        let repository = SessionRepository::new(Arc::clone(&store));

        controller.handle(TimerAction::Start).await.expect("start");
        tokio::time::sleep(Duration::from_secs(10)).await;
        controller.handle(TimerAction::Cancel).await.expect("cancel");
        let sessions = repository
            .fetch_all::<PomodoroSession>(Vec::new())
            .await
            .expect("sessions");
        assert!(sessions.is_empty());

        controller.handle(TimerAction::Start).await.expect("start");
        tokio::time::sleep(Duration::from_secs(40)).await;
        controller.handle(TimerAction::Cancel).await.expect("cancel");
        let sessions = repository
            .fetch_all::<PomodoroSession>(Vec::new())
            .await
            .expect("sessions");
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].is_ongoing());
    }

    #[tokio::test(start_paused = true)]
    async fn notification_storm_collapses_into_one_fetch() {
        let store = Arc::new(InMemoryRecordStore::default());
        let controller = controller(&store);
        let repository = SessionRepository::new(Arc::clone(&store));
        let mut receiver = controller.subscribe();
        controller.activate();
        wait_for_phase(&mut receiver, "idle").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let baseline = store.query_count();
        repository
            .insert(PomodoroSession::start(SessionType::Work, None, t0()))
            .await
            .expect("insert remote session");
        for _ in 0..9 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            store.notify_remote_change();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        // One snapshot reads the ongoing session and the settings.
        assert_eq!(store.query_count() - baseline, 2);
        let state = controller.display_state();
        assert_eq!(
            state.snapshot().map(|snapshot| snapshot.phase.as_str()),
            Some("working")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_publishes_failure_and_recovers() {
        let store = Arc::new(InMemoryRecordStore::default());
        let controller = controller(&store);
        let mut receiver = controller.subscribe();
        controller.activate();
        wait_for_phase(&mut receiver, "idle").await;

        store.set_failing(true);
        store.notify_remote_change();
        within_a_minute(receiver.wait_for(|state| {
            *state == DisplayState::Failure(FailureKind::StoreUnavailable)
        }))
        .await
        .expect("display sender alive");

        store.set_failing(false);
        store.notify_remote_change();
        wait_for_phase(&mut receiver, "idle").await;
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_stops_all_publication() {
        let store = Arc::new(InMemoryRecordStore::default());
        let controller = controller(&store);
        let mut receiver = controller.subscribe();
        controller.activate();
        controller.handle(TimerAction::Start).await.expect("start");
        wait_for_phase(&mut receiver, "working").await;

        controller.deactivate();
        let _ = receiver.borrow_and_update();
        store.notify_remote_change();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!receiver.has_changed().expect("display sender alive"));
    }

    #[tokio::test(start_paused = true)]
    async fn action_shows_outcome_at_once_and_refetches_once() {
        let store = Arc::new(InMemoryRecordStore::default());
        let controller = controller(&store);
        let mut receiver = controller.subscribe();
        controller.activate();
        wait_for_phase(&mut receiver, "idle").await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        for (action, phase) in [
            (TimerAction::Start, "working"),
            (TimerAction::AdvancePhase, "on_break"),
            (TimerAction::AdvancePhase, "idle"),
        ] {
            let baseline = store.query_count();
            controller.handle(action).await.expect("action applied");
            assert_eq!(
                controller
                    .display_state()
                    .snapshot()
                    .map(|snapshot| snapshot.phase.as_str()),
                Some(phase)
            );

            tokio::time::sleep(Duration::from_secs(2)).await;
            // The planning read plus one debounced refresh, two queries each.
            assert_eq!(store.query_count() - baseline, 4, "after {}", action.as_str());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_show_a_fixed_kind_not_the_store_error() {
        let store = Arc::new(InMemoryRecordStore::default());
        let controller = controller(&store);
        let mut receiver = controller.subscribe();
        controller.activate();
        wait_for_phase(&mut receiver, "idle").await;

        store.set_failing(true);
        let error = controller
            .handle(TimerAction::Start)
            .await
            .expect_err("store is down");
        assert!(matches!(error, ControllerError::Store(_)));
        assert_eq!(
            controller.display_state(),
            DisplayState::Failure(FailureKind::StoreUnavailable)
        );
        assert!(!error.user_message().contains("in-memory"));
    }

    #[tokio::test(start_paused = true)]
    async fn action_finishing_after_deactivate_publishes_nothing() {
        let store = Arc::new(HeldWrites::new());
        let controller = SessionLifecycleController::new(
            SessionRepository::new(Arc::clone(&store)),
            ControllerConfig::default(),
        )
        .with_now_provider(paused_clock());
        let mut receiver = controller.subscribe();
        controller.activate();
        wait_for_phase(&mut receiver, "idle").await;

        let (result, ()) = tokio::join!(controller.handle(TimerAction::Start), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            controller.deactivate();
            let _ = receiver.borrow_and_update();
            store.release();
        });
        result.expect("start persisted");
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!receiver.has_changed().expect("display sender alive"));
        assert_eq!(
            controller
                .display_state()
                .snapshot()
                .map(|snapshot| snapshot.phase.as_str()),
            Some("idle")
        );
    }

    #[test]
    fn stale_ticks_and_closed_gate_cannot_publish() {
        let publisher = Publisher::new();
        let receiver = publisher.display.subscribe();
        assert!(!publisher.publish_if_current(0, DisplayState::Loading));

        publisher.open();
        assert!(publisher.publish_if_current(0, DisplayState::Loading));
        publisher.show_failure(FailureKind::StoreUnavailable);
        assert!(!publisher.publish_if_current(0, DisplayState::Loading));
        assert_eq!(
            *receiver.borrow(),
            DisplayState::Failure(FailureKind::StoreUnavailable)
        );

        publisher.close();
        publisher.show_failure(FailureKind::SaveFailed);
        assert!(!publisher.publish_if_current(2, DisplayState::Loading));
        assert_eq!(
            *receiver.borrow(),
            DisplayState::Failure(FailureKind::StoreUnavailable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn actions_fire_sound_effects() {
        let store = Arc::new(InMemoryRecordStore::default());
        let effects = Arc::new(RecordingSoundEffects::default());
        let controller = controller(&store).with_effects(effects.clone());
        controller
            .update_settings(TimerSettings {
                background_music_type: BackgroundMusicType::Rain,
                ..TimerSettings::default()
            })
            .await
            .expect("save settings");

        controller.handle(TimerAction::Start).await.expect("start");
        controller
            .handle(TimerAction::AdvancePhase)
            .await
            .expect("advance to break");
        controller
            .handle(TimerAction::AdvancePhase)
            .await
            .expect("advance to idle");

        assert_eq!(
            effects.calls(),
            vec![
                EffectCall::Play {
                    url: "rain.mp3".to_string(),
                    looped: true,
                },
                EffectCall::Speak(FOCUS_ANNOUNCEMENT.to_string()),
                EffectCall::Speak(BREAK_ANNOUNCEMENT.to_string()),
                EffectCall::Stop,
                EffectCall::StopSpeaking,
            ]
        );
    }

    #[test]
    fn config_maps_from_app_config() {
        let config = ControllerConfig::from(&AppConfig {
            tick_interval_ms: 100,
            debounce_ms: 750,
            cancel_threshold_seconds: 45,
            ..AppConfig::default()
        });
        assert_eq!(config.tick_interval, Duration::from_millis(100));
        assert_eq!(config.debounce_window, Duration::from_millis(750));
        assert_eq!(
            config.transition_policy.cancel_delete_threshold,
            chrono::Duration::seconds(45)
        );
    }
}
