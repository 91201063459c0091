use crate::application::repository::SessionRepository;
use crate::domain::models::{Tag, TimerSettings};
use crate::infrastructure::config::{ensure_default_configs, load_app_config, AppConfig};
use crate::infrastructure::credential_store::{SecureStringStore, USER_ID_KEY};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::record_store::RecordStore;
use crate::infrastructure::storage::initialize_database;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub logs_dir: PathBuf,
    pub database_path: PathBuf,
    pub config: AppConfig,
}

pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join("pomodolog.sqlite");

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;
    fs::create_dir_all(&logs_dir)?;

    ensure_default_configs(&config_dir)?;
    let config = load_app_config(&config_dir)?;
    initialize_database(&database_path)?;

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        logs_dir,
        database_path,
        config,
    })
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("secure store unreadable: {0}")]
    UnreadableSecureStore(#[source] InfraError),
    #[error("launch setup failed: {0}")]
    SetupFailed(#[source] InfraError),
}

impl LaunchError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::UnreadableSecureStore(_) => {
                "Your account information could not be read. Unlock your device and restart the app."
            }
            Self::SetupFailed(_) => {
                "Setup failed. Check your network connection and restart the app."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub user_id: String,
    pub first_launch: bool,
    pub settings: TimerSettings,
}

/// Resolves the local user. The first launch seeds default tags and settings
/// before the user id is stored, so an interrupted first launch seeds again.
pub async fn launch<S>(
    repository: &SessionRepository<S>,
    secure_store: &dyn SecureStringStore,
    now: DateTime<Utc>,
) -> Result<LaunchOutcome, LaunchError>
where
    S: RecordStore,
{
    let stored_user_id = secure_store
        .get(USER_ID_KEY)
        .map_err(LaunchError::UnreadableSecureStore)?;

    if let Some(user_id) = stored_user_id {
        let settings = repository
            .timer_settings()
            .await
            .map_err(LaunchError::SetupFailed)?;
        info!(user_id = %user_id, "returning launch");
        return Ok(LaunchOutcome {
            user_id,
            first_launch: false,
            settings,
        });
    }

    let user_id = Uuid::new_v4().to_string();
    let settings = TimerSettings::default();
    let seeded = async {
        repository.insert_batch(Tag::default_tags(now)).await?;
        repository.save_settings(settings.clone()).await?;
        secure_store.set(USER_ID_KEY, &user_id)
    }
    .await;
    if let Err(error) = seeded {
        warn!(error = %error, "first launch setup failed");
        return Err(LaunchError::SetupFailed(error));
    }

    info!(user_id = %user_id, "first launch seeded defaults");
    Ok(LaunchOutcome {
        user_id,
        first_launch: true,
        settings,
    })
}
