use crate::{
    caller::Caller,
    errors::{internal_error, AppError},
    format::{MemeView, OutputFormat},
    models::{Meme, Template, TextOverlay, Visibility},
    query::{MemeQuery, RawMemeQuery},
    retrieval::{self, Selection},
    domain::Eligibility,
    AppState,
};
use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use mime_guess;
use serde::Serialize;
use std::sync::Arc;
use tracing;
use uuid::Uuid;

/// Normalize, retrieve, render.
async fn find_and_render(state: &AppState, query: MemeQuery, caller: &Caller) -> Result<Response, AppError> {
    let format: OutputFormat = query.format.parse()?;
    let selection = retrieval::retrieve(state.meme_repo.as_ref(), &query, caller.username()).await?;
    tracing::debug!(count = selection.memes().len(), ?format, caller = ?caller.username(), "Memes retrieved");
    state.formatter.render(selection, format).await
}

/// Handler for GET /memes
pub async fn list_memes(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Query(raw): Query<RawMemeQuery>,
) -> Result<Response, AppError> {
    let query = raw.normalize(state.config.limits);
    find_and_render(&state, query, &caller).await
}

/// Handler for GET /users/{username}/memes
pub async fn list_user_memes(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(username): Path<String>,
    Query(raw): Query<RawMemeQuery>,
) -> Result<Response, AppError> {
    let mut query = raw.normalize(state.config.limits);
    query.creator = Some(username);
    find_and_render(&state, query, &caller).await
}

/// Handler for GET /me/memes
pub async fn list_own_memes(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Query(raw): Query<RawMemeQuery>,
) -> Result<Response, AppError> {
    let username = caller
        .username()
        .ok_or_else(|| AppError::InvalidInput("Username not specified".to_string()))?;

    if state.user_repo.find_by_username(username).await?.is_none() {
        tracing::warn!(%username, "Caller has no user record");
        return Err(AppError::UserNotFound(username.to_string()));
    }

    let mut query = raw.normalize(state.config.limits);
    query.creator = Some(username.to_string());
    find_and_render(&state, query, &caller).await
}

/// Handler for POST /memes (multipart: name, visibility, image)
pub async fn upload_meme(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let creator = caller
        .username()
        .ok_or_else(|| AppError::Unauthorized("Uploading requires a signed-in user".to_string()))?
        .to_string();

    let public_id = Uuid::new_v4().to_string();
    let mut name = None;
    let mut visibility = None;
    let mut image_data: Option<Vec<u8>> = None;
    let mut image_filename: Option<String> = None;
    let mut image_content_type: Option<String> = None;

    while let Some(field) = multipart.next_field().await? {
        let field_name = match field.name() {
            Some(name) => name.to_string(),
            None => continue,
        };
        match field_name.as_str() {
            "name" => name = Some(field.text().await.map_err(|e| AppError::InvalidInput(format!("Failed to read name: {}", e)))?),
            "visibility" => visibility = Some(field.text().await.map_err(|e| AppError::InvalidInput(format!("Failed to read visibility: {}", e)))?),
            "image" => {
                image_filename = field.file_name().map(|s| s.to_string());
                image_content_type = field.content_type().map(|m| m.to_string());
                image_data = Some(field.bytes().await?.to_vec());
            }
            _ => tracing::debug!("Ignoring unknown multipart field: {}", field_name),
        }
    }

    let name = name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| AppError::MissingFormField("name".to_string()))?;
    let visibility: Visibility = match visibility.as_deref().map(str::trim) {
        None | Some("") => Visibility::default(),
        Some(raw) => raw.parse().map_err(AppError::InvalidInput)?,
    };
    let image_data = image_data.ok_or_else(|| AppError::MissingFormField("image".to_string()))?;
    if image_data.is_empty() {
        return Err(AppError::InvalidInput("image data cannot be empty".to_string()));
    }

    let guessed = image_filename
        .as_deref()
        .and_then(|file| mime_guess::from_path(file).first_raw())
        .map(str::to_string);
    let content_type = image_content_type
        .filter(|ct| ct != "application/octet-stream")
        .or(guessed)
        .ok_or_else(|| AppError::InvalidInput("could not determine the image content type".to_string()))?;
    if !content_type.starts_with("image/") {
        return Err(AppError::InvalidInput(format!("expected an image, got {}", content_type)));
    }

    let extension = image_filename
        .as_ref()
        .and_then(|file| file.rsplit_once('.').map(|(_, ext)| ext.to_lowercase()))
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| content_type.trim_start_matches("image/").split(['+', ';']).next().unwrap_or("bin").to_string());
    let image_key = format!("memes/{}.{}", public_id, extension);

    state
        .file_storage
        .upload(&image_key, image_data, Some(content_type.clone()))
        .await?;

    let meme = Meme {
        public_id,
        name,
        creator,
        visibility,
        content_type,
        image_key,
        created_at: Utc::now(),
    };
    if let Err(e) = state.meme_repo.create(&meme).await {
        tracing::error!(meme_id = %meme.public_id, image_key = %meme.image_key, error = %e, "Meme metadata not stored; removing uploaded image");
        if let Err(cleanup) = state.file_storage.delete(&meme.image_key).await {
            tracing::error!(image_key = %meme.image_key, error = %cleanup, "Failed to remove orphaned image");
        }
        return Err(e.into());
    }

    tracing::info!(meme_id = %meme.public_id, creator = %meme.creator, visibility = %meme.visibility, "Meme created successfully via handler");
    let view: MemeView = state
        .formatter
        .views(std::slice::from_ref(&meme))
        .await?
        .pop()
        .ok_or_else(|| internal_error!("no view rendered for new meme {}", meme.public_id))?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// Handler for GET /memes/{id}: one meme, rendered as a single entity.
pub async fn get_meme(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(meme_id): Path<String>,
    Query(raw): Query<RawMemeQuery>,
) -> Result<Response, AppError> {
    let format: OutputFormat = raw.normalize(state.config.limits).format.parse()?;
    let meme = retrieval::retrieve_one(state.meme_repo.as_ref(), &meme_id, caller.username()).await?;
    state.formatter.render(Selection::One(meme), format).await
}

/// Handler for GET /memes/{id}/comments
pub async fn list_comments(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(meme_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    retrieval::retrieve_one(state.meme_repo.as_ref(), &meme_id, caller.username()).await?;
    let comments = state.engagement.comments_for(&meme_id).await?;
    tracing::debug!(%meme_id, count = comments.len(), "Comments listed");
    Ok(Json(comments))
}

/// Handler for GET /resources/images/{id}
pub async fn get_image(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(meme_id): Path<String>,
) -> Result<Response, AppError> {
    tracing::debug!(%meme_id, "Fetching meme image via handler");
    let meme = retrieval::retrieve_one(state.meme_repo.as_ref(), &meme_id, caller.username()).await?;
    state.formatter.image_response(&meme.image_key, &meme.content_type).await
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TemplateView {
    pub public_id: String,
    pub name: String,
    pub creator: Option<String>,
    pub visibility: Visibility,
    pub image_url: String,
    pub texts: Vec<TextOverlay>,
    pub created_at: DateTime<Utc>,
}

impl TemplateView {
    fn new(template: Template, state: &AppState) -> Self {
        Self {
            image_url: state.formatter.links().template_image_url(&template.public_id),
            public_id: template.public_id,
            name: template.name,
            creator: template.creator,
            visibility: template.visibility,
            texts: template.texts,
            created_at: template.created_at,
        }
    }
}

/// Handler for GET /templates
pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    caller: Caller,
) -> Result<impl IntoResponse, AppError> {
    let filter = Eligibility::new(caller.username(), None);
    let templates = state.template_repo.find_eligible(&filter).await?;
    tracing::debug!(count = templates.len(), "Templates listed");
    let views: Vec<TemplateView> = templates
        .into_iter()
        .map(|t| TemplateView::new(t, &state))
        .collect();
    Ok(Json(views))
}

/// Handler for GET /resources/templates/{id}
pub async fn get_template_image(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(template_id): Path<String>,
) -> Result<Response, AppError> {
    let template = state
        .template_repo
        .find_by_public_id(&template_id)
        .await?
        .ok_or_else(|| AppError::TemplateNotFound(template_id.clone()))?;

    let owned = matches!(
        (template.creator.as_deref(), caller.username()),
        (Some(owner), Some(me)) if owner == me
    );
    if template.visibility == Visibility::Private && !owned {
        return Err(AppError::Unauthorized(format!("Template {} is private", template_id)));
    }
    state.formatter.image_response(&template.image_key, &template.content_type).await
}

/// Handler for GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
