//! Process-local backends for `STORAGE_BACKEND=memory`.
//!
//! Handy for running the API without LocalStack, and the backing store for
//! the test suite. Nothing here survives a restart.

use crate::{
    domain::{
        Chronology, EngagementRepository, Eligibility, FileStorage, MemeRepository, StoredFile,
        TemplateRepository, UserRepository,
    },
    errors::{RepoError, StorageError},
    models::{Comment, Like, Meme, Template, User},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One handle per in-memory store, shared with the [`crate::AppState`] built from it.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    pub memes: Arc<InMemoryMemeRepository>,
    pub users: Arc<InMemoryUserRepository>,
    pub engagement: Arc<InMemoryEngagementRepository>,
    pub templates: Arc<InMemoryTemplateRepository>,
    pub files: Arc<InMemoryFileStorage>,
}

#[derive(Debug, Default)]
pub struct InMemoryMemeRepository {
    memes: RwLock<HashMap<String, Meme>>,
}

impl InMemoryMemeRepository {
    async fn eligible(&self, filter: &Eligibility) -> Vec<Meme> {
        self.memes
            .read()
            .await
            .values()
            .filter(|m| filter.admits(m.visibility, Some(m.creator.as_str())))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MemeRepository for InMemoryMemeRepository {
    async fn create(&self, meme: &Meme) -> Result<(), RepoError> {
        let mut memes = self.memes.write().await;
        if memes.contains_key(&meme.public_id) {
            return Err(RepoError::Conflict(format!("meme {}", meme.public_id)));
        }
        memes.insert(meme.public_id.clone(), meme.clone());
        Ok(())
    }

    async fn find_by_public_id(&self, public_id: &str) -> Result<Vec<Meme>, RepoError> {
        let memes = self.memes.read().await;
        Ok(memes.get(public_id).cloned().into_iter().collect())
    }

    async fn find_eligible(&self, filter: &Eligibility) -> Result<Vec<Meme>, RepoError> {
        Ok(self.eligible(filter).await)
    }

    async fn find_ordered(&self, filter: &Eligibility, order: Chronology, count: usize) -> Result<Vec<Meme>, RepoError> {
        let mut memes = self.eligible(filter).await;
        order.sort(&mut memes);
        memes.truncate(count);
        Ok(memes)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<String, User>>,
}

impl InMemoryUserRepository {
    pub async fn insert(&self, user: User) -> Result<(), RepoError> {
        let mut users = self.users.write().await;
        if users.contains_key(&user.username) {
            return Err(RepoError::Conflict(format!("user {}", user.username)));
        }
        users.insert(user.username.clone(), user);
        Ok(())
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, RepoError> {
        Ok(self.users.read().await.get(username).cloned())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryEngagementRepository {
    likes: RwLock<Vec<Like>>,
    comments: RwLock<Vec<Comment>>,
}

impl InMemoryEngagementRepository {
    pub async fn add_like(&self, like: Like) {
        self.likes.write().await.push(like);
    }

    pub async fn add_comment(&self, comment: Comment) {
        self.comments.write().await.push(comment);
    }
}

fn count_by<'a>(ids: &[String], keys: impl Iterator<Item = &'a str>) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    for key in keys {
        if ids.iter().any(|id| id == key) {
            *counts.entry(key.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

#[async_trait]
impl EngagementRepository for InMemoryEngagementRepository {
    async fn like_counts(&self, meme_ids: &[String]) -> Result<HashMap<String, u64>, RepoError> {
        let likes = self.likes.read().await;
        Ok(count_by(meme_ids, likes.iter().map(|l| l.meme_public_id.as_str())))
    }

    async fn comment_counts(&self, meme_ids: &[String]) -> Result<HashMap<String, u64>, RepoError> {
        let comments = self.comments.read().await;
        Ok(count_by(meme_ids, comments.iter().map(|c| c.meme_public_id.as_str())))
    }

    async fn comments_for(&self, meme_id: &str) -> Result<Vec<Comment>, RepoError> {
        let comments = self.comments.read().await;
        let mut found: Vec<Comment> = comments
            .iter()
            .filter(|c| c.meme_public_id == meme_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTemplateRepository {
    templates: RwLock<HashMap<String, Template>>,
}

impl InMemoryTemplateRepository {
    pub async fn insert(&self, template: Template) -> Result<(), RepoError> {
        let mut templates = self.templates.write().await;
        if templates.contains_key(&template.public_id) {
            return Err(RepoError::Conflict(format!("template {}", template.public_id)));
        }
        templates.insert(template.public_id.clone(), template);
        Ok(())
    }
}

#[async_trait]
impl TemplateRepository for InMemoryTemplateRepository {
    async fn find_eligible(&self, filter: &Eligibility) -> Result<Vec<Template>, RepoError> {
        let templates = self.templates.read().await;
        let mut found: Vec<Template> = templates
            .values()
            .filter(|t| filter.admits(t.visibility, t.creator.as_deref()))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn find_by_public_id(&self, public_id: &str) -> Result<Option<Template>, RepoError> {
        Ok(self.templates.read().await.get(public_id).cloned())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFileStorage {
    files: RwLock<HashMap<String, StoredFile>>,
}

impl InMemoryFileStorage {
    /// Stored keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.files.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl FileStorage for InMemoryFileStorage {
    async fn upload(&self, key: &str, data: Vec<u8>, content_type: Option<String>) -> Result<(), StorageError> {
        tracing::debug!(key = %key, size = data.len(), "Memory: storing file");
        self.files.write().await.insert(
            key.to_string(),
            StoredFile { data: Bytes::from(data), content_type },
        );
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<StoredFile, StorageError> {
        self.files
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        tracing::debug!(key = %key, "Memory: deleting file");
        self.files.write().await.remove(key);
        Ok(())
    }
}
