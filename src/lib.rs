//! Backend for a meme-sharing site: visibility-aware meme queries rendered as
//! JSON, ZIP archives, raw images or shareable links.

pub mod caller;
pub mod config;
pub mod domain;
pub mod errors;
pub mod format;
pub mod handlers;
pub mod memory;
pub mod models;
pub mod query;
pub mod repositories;
pub mod retrieval;
pub mod routes;
pub mod startup;
pub mod storage;

use crate::{
    config::Config,
    domain::{EngagementRepository, FileStorage, MemeRepository, TemplateRepository, UserRepository},
    format::ResponseFormatter,
};
use std::sync::Arc;

/// AppState holds shared resources for the web server.
pub struct AppState {
    pub config: Config,
    pub meme_repo: Arc<dyn MemeRepository>,
    pub user_repo: Arc<dyn UserRepository>,
    pub engagement: Arc<dyn EngagementRepository>,
    pub template_repo: Arc<dyn TemplateRepository>,
    pub file_storage: Arc<dyn FileStorage>,
    pub formatter: ResponseFormatter,
}

impl AppState {
    pub fn new(
        config: Config,
        meme_repo: Arc<dyn MemeRepository>,
        user_repo: Arc<dyn UserRepository>,
        engagement: Arc<dyn EngagementRepository>,
        template_repo: Arc<dyn TemplateRepository>,
        file_storage: Arc<dyn FileStorage>,
    ) -> Self {
        let formatter = ResponseFormatter::new(
            config.links.clone(),
            engagement.clone(),
            file_storage.clone(),
            config.archive_fetch_concurrency,
        );
        Self {
            config,
            meme_repo,
            user_repo,
            engagement,
            template_repo,
            file_storage,
            formatter,
        }
    }

    /// State wired to a [`memory::MemoryBackend`].
    pub fn in_memory(config: Config, backend: &memory::MemoryBackend) -> Self {
        Self::new(
            config,
            backend.memes.clone(),
            backend.users.clone(),
            backend.engagement.clone(),
            backend.templates.clone(),
            backend.files.clone(),
        )
    }
}
