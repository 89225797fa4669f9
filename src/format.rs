//! Renders retrieved memes as JSON, a ZIP archive, raw image bytes or links.

use crate::{
    config::LinkConfig,
    domain::{EngagementRepository, FileStorage, StoredFile},
    errors::{internal_error, AppError},
    models::{Meme, Visibility},
    retrieval::Selection,
};
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    io::Write,
    path::Path,
    str::FromStr,
    sync::Arc,
};

pub const ARCHIVE_NAME: &str = "memes.zip";
pub const METADATA_ENTRY: &str = "meta-data.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Zip,
    Image,
    SingleView,
}

impl FromStr for OutputFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(OutputFormat::Json),
            "zip" | "download" => Ok(OutputFormat::Zip),
            "image" => Ok(OutputFormat::Image),
            "single-view" => Ok(OutputFormat::SingleView),
            other => Err(AppError::InvalidInput(format!(
                "Invalid response format requested: {}",
                other
            ))),
        }
    }
}

/// A meme as clients see it: no image bytes, no storage key.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemeView {
    pub public_id: String,
    pub name: String,
    pub creator: String,
    pub visibility: Visibility,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub image_url: String,
    pub single_view_url: String,
    pub likes: u64,
    pub comments: u64,
}

#[derive(Serialize, Debug)]
pub struct UrlList {
    pub urls: Vec<String>,
}

pub struct ResponseFormatter {
    links: LinkConfig,
    engagement: Arc<dyn EngagementRepository>,
    file_storage: Arc<dyn FileStorage>,
    fetch_concurrency: usize,
}

impl ResponseFormatter {
    pub fn new(
        links: LinkConfig,
        engagement: Arc<dyn EngagementRepository>,
        file_storage: Arc<dyn FileStorage>,
        fetch_concurrency: usize,
    ) -> Self {
        Self {
            links,
            engagement,
            file_storage,
            fetch_concurrency: fetch_concurrency.max(1),
        }
    }

    pub fn links(&self) -> &LinkConfig {
        &self.links
    }

    pub async fn render(&self, selection: Selection, format: OutputFormat) -> Result<Response, AppError> {
        tracing::debug!(?format, count = selection.memes().len(), "Rendering memes");
        match format {
            OutputFormat::Json => self.render_json(selection).await,
            OutputFormat::Zip => self.render_zip(selection.into_memes()).await,
            OutputFormat::Image => self.render_image(selection).await,
            OutputFormat::SingleView => Ok(self.render_single_view(selection)),
        }
    }

    /// Builds client views for a batch, with one count query per counter.
    pub async fn views(&self, memes: &[Meme]) -> Result<Vec<MemeView>, AppError> {
        if memes.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = memes.iter().map(|m| m.public_id.clone()).collect();
        let (likes, comments) = tokio::try_join!(
            self.engagement.like_counts(&ids),
            self.engagement.comment_counts(&ids),
        )?;
        Ok(memes.iter().map(|m| self.view(m, &likes, &comments)).collect())
    }

    fn view(&self, meme: &Meme, likes: &HashMap<String, u64>, comments: &HashMap<String, u64>) -> MemeView {
        MemeView {
            public_id: meme.public_id.clone(),
            name: meme.name.clone(),
            creator: meme.creator.clone(),
            visibility: meme.visibility,
            content_type: meme.content_type.clone(),
            created_at: meme.created_at,
            image_url: self.links.image_url(&meme.public_id),
            single_view_url: self.links.single_view_url(&meme.public_id),
            likes: likes.get(&meme.public_id).copied().unwrap_or(0),
            comments: comments.get(&meme.public_id).copied().unwrap_or(0),
        }
    }

    async fn render_json(&self, selection: Selection) -> Result<Response, AppError> {
        let mut views = self.views(selection.memes()).await?;
        Ok(match selection {
            Selection::One(_) => match views.pop() {
                Some(view) => Json(view).into_response(),
                None => return Err(internal_error!("rendered no view for a single meme")),
            },
            Selection::Many(_) => Json(views).into_response(),
        })
    }

    /// The archive is assembled in memory before any byte is sent, so a
    /// failed image fetch yields a clean 500 instead of a truncated zip.
    async fn render_zip(&self, memes: Vec<Meme>) -> Result<Response, AppError> {
        let views = self.views(&memes).await?;
        let metadata = serde_json::to_vec_pretty(&views)
            .map_err(|e| internal_error!("failed to serialize archive metadata: {}", e))?;

        let storage = self.file_storage.clone();
        let keys: Vec<(String, String)> = memes
            .iter()
            .map(|m| (m.public_id.clone(), m.image_key.clone()))
            .collect();
        let images: Vec<StoredFile> = stream::iter(keys)
            .map(move |(meme_id, image_key)| {
                let storage = storage.clone();
                async move {
                    storage.download(&image_key).await.map_err(|e| {
                        tracing::error!(%meme_id, %image_key, error = %e, "Archive image fetch failed");
                        e
                    })
                }
            })
            .buffered(self.fetch_concurrency)
            .try_collect()
            .await?;

        let names = archive_entry_names(&memes);
        let entries: Vec<(String, &[u8])> = names
            .into_iter()
            .zip(images.iter().map(|img| img.data.as_ref()))
            .collect();
        let archive = build_zip(&entries, &metadata)
            .map_err(|e| internal_error!("failed to build zip archive: {}", e))?;

        tracing::info!(entries = entries.len(), bytes = archive.len(), "Built meme archive");
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/zip")
            .header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", ARCHIVE_NAME),
            )
            .body(Body::from(archive))
            .map_err(|e| AppError::InternalServerError(format!("Failed to build archive response: {}", e)))
    }

    async fn render_image(&self, selection: Selection) -> Result<Response, AppError> {
        match selection {
            Selection::One(meme) => self.image_response(&meme.image_key, &meme.content_type).await,
            Selection::Many(memes) => Ok(Json(UrlList {
                urls: memes.iter().map(|m| self.links.image_url(&m.public_id)).collect(),
            })
            .into_response()),
        }
    }

    /// Raw bytes of a stored image with its content type.
    pub async fn image_response(&self, image_key: &str, fallback_type: &str) -> Result<Response, AppError> {
        let file = self.file_storage.download(image_key).await?;
        let content_type = file.content_type.as_deref().unwrap_or(fallback_type);

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(file.data))
            .map_err(|e| AppError::InternalServerError(format!("Failed to build image response: {}", e)))
    }

    fn render_single_view(&self, selection: Selection) -> Response {
        match selection {
            Selection::One(meme) => (
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                self.links.single_view_url(&meme.public_id),
            )
                .into_response(),
            Selection::Many(memes) => Json(UrlList {
                urls: memes.iter().map(|m| self.links.single_view_url(&m.public_id)).collect(),
            })
            .into_response(),
        }
    }
}

/// File extension for a content type, e.g. `image/svg+xml` -> `svg`.
fn extension_for(content_type: &str) -> String {
    content_type
        .split('/')
        .nth(1)
        .and_then(|sub| sub.split(['+', ';']).next())
        .map(|ext| ext.trim().to_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "bin".to_string())
}

/// Strips path components so an entry can't escape the archive root.
fn sanitize_entry_stem(name: &str, fallback: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
        .unwrap_or(fallback)
        .to_string()
}

/// `a.png, b.png, a.png` -> `a.png, b.png, a (1).png`. Works on whole file
/// names, so `a.png` and `a.gif` never clash. A generated name never collides
/// with one that appears literally in the input, and none may take the
/// metadata entry's name.
pub fn unique_entry_names(names: &[String]) -> Vec<String> {
    let mut taken: HashSet<String> = names.iter().cloned().collect();
    taken.insert(METADATA_ENTRY.to_string());
    let mut used: HashSet<String> = HashSet::from([METADATA_ENTRY.to_string()]);
    let mut next_suffix: HashMap<&str, u32> = HashMap::new();
    let mut out = Vec::with_capacity(names.len());

    for name in names {
        if used.insert(name.clone()) {
            out.push(name.clone());
            continue;
        }
        let (stem, ext) = match name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{}", ext)),
            _ => (name.as_str(), String::new()),
        };
        let n = next_suffix.entry(name.as_str()).or_insert(1);
        let candidate = loop {
            let candidate = format!("{} ({}){}", stem, n, ext);
            *n += 1;
            if !taken.contains(&candidate) {
                break candidate;
            }
        };
        taken.insert(candidate.clone());
        used.insert(candidate.clone());
        out.push(candidate);
    }
    out
}

fn archive_entry_names(memes: &[Meme]) -> Vec<String> {
    let names: Vec<String> = memes
        .iter()
        .map(|m| {
            format!(
                "{}.{}",
                sanitize_entry_stem(&m.name, &m.public_id),
                extension_for(&m.content_type)
            )
        })
        .collect();
    unique_entry_names(&names)
}

fn build_zip(entries: &[(String, &[u8])], metadata: &[u8]) -> zip::result::ZipResult<Vec<u8>> {
    use zip::write::{FileOptions, ZipWriter};
    use zip::CompressionMethod;

    let mut buffer = Vec::new();
    {
        let mut zip = ZipWriter::new(std::io::Cursor::new(&mut buffer));
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .unix_permissions(0o644);

        for (name, data) in entries {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(data)?;
        }
        zip.start_file(METADATA_ENTRY, options)?;
        zip.write_all(metadata)?;
        zip.finish()?;
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryEngagementRepository, InMemoryFileStorage};
    use crate::models::Like;
    use axum::body::to_bytes;
    use chrono::TimeZone;
    use std::io::{Cursor, Read};

    fn links() -> LinkConfig {
        LinkConfig {
            public_base_url: "http://api.test".into(),
            frontend_base_url: "http://web.test".into(),
        }
    }

    fn meme(id: &str, name: &str, content_type: &str) -> Meme {
        Meme {
            public_id: id.into(),
            name: name.into(),
            creator: "alice".into(),
            visibility: Visibility::Public,
            content_type: content_type.into(),
            image_key: format!("memes/{}", id),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    async fn formatter_with(files: &[(&str, &[u8])]) -> (ResponseFormatter, Arc<InMemoryEngagementRepository>) {
        let engagement = Arc::new(InMemoryEngagementRepository::default());
        let storage = Arc::new(InMemoryFileStorage::default());
        for (key, data) in files {
            storage.upload(key, data.to_vec(), Some("image/png".into())).await.unwrap();
        }
        (ResponseFormatter::new(links(), engagement.clone(), storage, 2), engagement)
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    #[test]
    fn format_names_parse() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("zip".parse::<OutputFormat>().unwrap(), OutputFormat::Zip);
        assert_eq!("download".parse::<OutputFormat>().unwrap(), OutputFormat::Zip);
        assert_eq!("image".parse::<OutputFormat>().unwrap(), OutputFormat::Image);
        assert_eq!("single-view".parse::<OutputFormat>().unwrap(), OutputFormat::SingleView);
        assert!(matches!("xml".parse::<OutputFormat>(), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn duplicate_names_are_disambiguated() {
        let names: Vec<String> = ["cat.png", "dog.png", "cat.png", "cat.png", "cat (1).png"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            unique_entry_names(&names),
            vec!["cat.png", "dog.png", "cat (2).png", "cat (3).png", "cat (1).png"]
        );

        let mixed: Vec<String> = ["a.png", "a.gif", "a.png"].iter().map(|s| s.to_string()).collect();
        assert_eq!(unique_entry_names(&mixed), vec!["a.png", "a.gif", "a (1).png"]);
    }

    #[test]
    fn metadata_entry_name_is_reserved() {
        let names: Vec<String> = ["meta-data.json", "meta-data.json", "meta-data (1).json"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            unique_entry_names(&names),
            vec!["meta-data (2).json", "meta-data (3).json", "meta-data (1).json"]
        );
    }

    #[test]
    fn extensions_come_from_the_subtype() {
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("image/svg+xml"), "svg");
        assert_eq!(extension_for("image/jpeg; charset=binary"), "jpeg");
        assert_eq!(extension_for("garbage"), "bin");
    }

    #[test]
    fn entry_names_cannot_traverse() {
        assert_eq!(sanitize_entry_stem("../../etc/passwd", "id"), "passwd");
        assert_eq!(sanitize_entry_stem("..", "id"), "id");
        assert_eq!(sanitize_entry_stem("   ", "id"), "id");
    }

    #[tokio::test]
    async fn json_views_carry_links_and_counts() {
        let (formatter, engagement) = formatter_with(&[]).await;
        engagement.add_like(Like { username: "bob".into(), meme_public_id: "m1".into() }).await;

        let response = formatter
            .render(Selection::One(meme("m1", "first", "image/png")), OutputFormat::Json)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(value["publicId"], "m1");
        assert_eq!(value["imageUrl"], "http://api.test/resources/images/m1");
        assert_eq!(value["singleViewUrl"], "http://web.test/memes/m1");
        assert_eq!(value["likes"], 1);
        assert_eq!(value["comments"], 0);
        assert!(value.get("imageKey").is_none());
        assert!(value.get("image").is_none());
    }

    #[tokio::test]
    async fn zip_contains_images_and_metadata() {
        let (formatter, _) = formatter_with(&[("memes/a", b"AAA"), ("memes/b", b"BBB")]).await;
        let selection = Selection::Many(vec![meme("a", "same", "image/png"), meme("b", "same", "image/gif")]);

        let response = formatter.render(selection, OutputFormat::Zip).await.unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
        assert!(response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains(ARCHIVE_NAME));

        let mut archive = zip::ZipArchive::new(Cursor::new(body_bytes(response).await)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["meta-data.json", "same.gif", "same.png"]);

        let mut content = String::new();
        archive.by_name("same.gif").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "BBB");

        let mut metadata = String::new();
        archive.by_name(METADATA_ENTRY).unwrap().read_to_string(&mut metadata).unwrap();
        let metadata: serde_json::Value = serde_json::from_str(&metadata).unwrap();
        assert_eq!(metadata.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn meme_named_like_the_metadata_keeps_its_own_entry() {
        let (formatter, _) = formatter_with(&[("memes/a", b"not really json")]).await;
        let selection = Selection::Many(vec![meme("a", "meta-data", "image/json")]);

        let response = formatter.render(selection, OutputFormat::Zip).await.unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(body_bytes(response).await)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["meta-data (1).json", "meta-data.json"]);

        let mut image = String::new();
        archive.by_name("meta-data (1).json").unwrap().read_to_string(&mut image).unwrap();
        assert_eq!(image, "not really json");

        let mut metadata = String::new();
        archive.by_name(METADATA_ENTRY).unwrap().read_to_string(&mut metadata).unwrap();
        let metadata: serde_json::Value = serde_json::from_str(&metadata).unwrap();
        assert_eq!(metadata[0]["publicId"], "a");
    }

    #[tokio::test]
    async fn zip_fails_whole_when_one_image_is_missing() {
        let (formatter, _) = formatter_with(&[("memes/a", b"AAA")]).await;
        let selection = Selection::Many(vec![meme("a", "one", "image/png"), meme("b", "two", "image/png")]);

        let result = formatter.render(selection, OutputFormat::Zip).await;
        let err = result.expect_err("archive must not be produced");
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn image_format_depends_on_selection_size() {
        let (formatter, _) = formatter_with(&[("memes/a", b"PNGDATA")]).await;

        let single = formatter
            .render(Selection::One(meme("a", "one", "image/png")), OutputFormat::Image)
            .await
            .unwrap();
        assert_eq!(single.headers()[header::CONTENT_TYPE], "image/png");
        assert_eq!(body_bytes(single).await, b"PNGDATA");

        let many = formatter
            .render(Selection::Many(vec![meme("a", "one", "image/png")]), OutputFormat::Image)
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body_bytes(many).await).unwrap();
        assert_eq!(value["urls"][0], "http://api.test/resources/images/a");
    }

    #[tokio::test]
    async fn single_view_links() {
        let (formatter, _) = formatter_with(&[]).await;

        let one = formatter
            .render(Selection::One(meme("a", "one", "image/png")), OutputFormat::SingleView)
            .await
            .unwrap();
        assert_eq!(body_bytes(one).await, b"http://web.test/memes/a");

        let many = formatter
            .render(
                Selection::Many(vec![meme("a", "one", "image/png"), meme("b", "two", "image/png")]),
                OutputFormat::SingleView,
            )
            .await
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body_bytes(many).await).unwrap();
        assert_eq!(value["urls"][1], "http://web.test/memes/b");
    }
}
