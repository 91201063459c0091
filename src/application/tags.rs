use crate::application::lifecycle::NowProvider;
use crate::application::repository::SessionRepository;
use crate::domain::models::Tag;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::record_store::{RecordKind, RecordStore, SortDescriptor, SortKey};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct TagService<S>
where
    S: RecordStore,
{
    repository: SessionRepository<S>,
    now_provider: NowProvider,
}

impl<S> TagService<S>
where
    S: RecordStore,
{
    pub fn new(repository: SessionRepository<S>) -> Self {
        Self {
            repository,
            now_provider: Arc::new(Utc::now),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub async fn list_tags(&self) -> Result<Vec<Tag>, InfraError> {
        self.repository
            .fetch_all(vec![
                SortDescriptor::asc(SortKey::Sort),
                SortDescriptor::asc(SortKey::CreatedAt),
            ])
            .await
    }

    /// New tags go to the end of the list.
    pub async fn add_tag(&self, name: &str, color_hex: &str) -> Result<Tag, InfraError> {
        let count = self.list_tags().await?.len();
        let sort = i32::try_from(count)
            .map_err(|_| InfraError::InvalidConfig(format!("too many tags: {count}")))?;
        let tag = Tag::new(
            Uuid::new_v4().to_string(),
            name.trim(),
            color_hex.trim(),
            sort,
            (self.now_provider)(),
        );
        tag.validate().map_err(InfraError::InvalidConfig)?;

        self.repository.insert(tag.clone()).await?;
        info!(tag_id = %tag.id, sort, "tag added");
        Ok(tag)
    }

    pub async fn edit_tag(&self, id: &str, name: &str, color_hex: &str) -> Result<Tag, InfraError> {
        let existing = self
            .repository
            .fetch_by_id::<Tag>(id)
            .await?
            .ok_or_else(|| InfraError::NotFound {
                kind: RecordKind::Tag,
                id: id.to_string(),
            })?;
        let edited = Tag {
            name: name.trim().to_string(),
            color_hex: color_hex.trim().to_string(),
            updated_at: (self.now_provider)(),
            ..existing
        };
        edited.validate().map_err(InfraError::InvalidConfig)?;

        self.repository.insert(edited.clone()).await?;
        info!(tag_id = %edited.id, "tag edited");
        Ok(edited)
    }

    /// Makes `id` the tag recorded on the next started session.
    pub async fn select_tag(&self, id: &str) -> Result<Tag, InfraError> {
        let tag = self
            .repository
            .fetch_by_id::<Tag>(id)
            .await?
            .ok_or_else(|| InfraError::NotFound {
                kind: RecordKind::Tag,
                id: id.to_string(),
            })?;
        let mut settings = self.repository.timer_settings().await?;
        settings.current_tag = Some(tag.clone());
        self.repository.save_settings(settings).await?;
        info!(tag_id = %tag.id, "tag selected");
        Ok(tag)
    }
}
