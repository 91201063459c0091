use chrono::{Duration, Utc};
use pomodolog::application::bootstrap::{bootstrap_workspace, launch};
use pomodolog::application::history::HistoryService;
use pomodolog::application::lifecycle::{
    ControllerConfig, ControllerError, DisplayState, SessionLifecycleController,
};
use pomodolog::application::repository::SessionRepository;
use pomodolog::application::tags::TagService;
use pomodolog::domain::timer_engine::TimerAction;
use pomodolog::infrastructure::credential_store::KeyringStringStore;
use pomodolog::infrastructure::sqlite_store::SqliteRecordStore;
use pomodolog::logging::init_tracing;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::error;

const WORKSPACE_ENV: &str = "POMODOLOG_WORKSPACE";
const HELP: &str = "commands: start | next | cancel | tags | tag <id> | history | quit";

fn describe(state: &DisplayState) -> String {
    match state {
        DisplayState::Loading => "loading".to_string(),
        DisplayState::Failure(kind) => format!("error: {}", kind.user_message()),
        DisplayState::Success(snapshot) => {
            let tag = snapshot
                .current_tag
                .as_ref()
                .map_or("-", |tag| tag.name.as_str());
            format!(
                "{:<8} {:>7}  {}  [{}]",
                snapshot.phase.as_str(),
                snapshot.display.timer_text(),
                tag,
                snapshot.timer_mode.title()
            )
        }
    }
}

/// Prints a line whenever the shown text changes.
async fn print_display(mut receiver: watch::Receiver<DisplayState>) {
    let mut last_line = String::new();
    while receiver.changed().await.is_ok() {
        let line = describe(&receiver.borrow_and_update());
        if line != last_line {
            println!("{line}");
            last_line = line;
        }
    }
}

fn report(result: Result<(), ControllerError>) {
    if let Err(error) = result {
        println!("! {}", error.user_message());
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let workspace_root = match std::env::var_os(WORKSPACE_ENV) {
        Some(path) => PathBuf::from(path),
        None => std::env::current_dir()?,
    };
    let bootstrap = bootstrap_workspace(&workspace_root)?;
    init_tracing(&bootstrap.config.log_filter);

    let repository = SessionRepository::new(Arc::new(SqliteRecordStore::new(
        &bootstrap.database_path,
    )));
    let outcome = match launch(&repository, &KeyringStringStore::default(), Utc::now()).await {
        Ok(outcome) => outcome,
        Err(launch_error) => {
            error!(error = %launch_error, "launch failed");
            eprintln!("{}", launch_error.user_message());
            return Err(launch_error.into());
        }
    };
    println!(
        "{} ({}launch, user {})",
        bootstrap.config.app_name,
        if outcome.first_launch { "first " } else { "" },
        outcome.user_id
    );
    println!("{HELP}");

    let controller = SessionLifecycleController::new(
        repository.clone(),
        ControllerConfig::from(&bootstrap.config),
    );
    let printer = tokio::spawn(print_display(controller.subscribe()));
    controller.activate();

    let tags = TagService::new(repository.clone());
    let history = HistoryService::new(repository);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (None, _) => {}
            (Some("start"), _) => report(controller.handle(TimerAction::Start).await),
            (Some("next"), _) => report(controller.handle(TimerAction::AdvancePhase).await),
            (Some("cancel"), _) => report(controller.handle(TimerAction::Cancel).await),
            (Some("tags"), _) => match tags.list_tags().await {
                Ok(list) => {
                    for tag in list {
                        println!("{:<38} {:<12} {}", tag.id, tag.name, tag.color_hex);
                    }
                }
                Err(error) => println!("! {error}"),
            },
            (Some("tag"), Some(id)) => match tags.select_tag(id).await {
                Ok(tag) => println!("selected {}", tag.name),
                Err(error) => println!("! {error}"),
            },
            (Some("history"), _) => {
                let now = Utc::now();
                match history.list_sessions().await {
                    Ok(sessions) => {
                        for session in sessions.iter().take(10) {
                            println!(
                                "{} {:<5} {:>4} min  {}",
                                session.start_at.format("%Y-%m-%d %H:%M"),
                                session.session_type.as_str(),
                                session.duration(now).num_minutes(),
                                session.tag.as_ref().map_or("-", |tag| tag.name.as_str())
                            );
                        }
                    }
                    Err(error) => println!("! {error}"),
                }
                match history.summary(now - Duration::days(1), now, now).await {
                    Ok(summary) => println!(
                        "last 24h: {} pomodoros, {} min focused",
                        summary.completed_work_sessions,
                        summary.total_focus.num_minutes()
                    ),
                    Err(error) => println!("! {error}"),
                }
            }
            (Some("quit"), _) => break,
            _ => println!("{HELP}"),
        }
    }

    controller.deactivate();
    printer.abort();
    Ok(())
}
