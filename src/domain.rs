use crate::errors::{RepoError, StorageError};
use crate::models::{Comment, Meme, Template, User, Visibility};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

/// Which records a caller may list.
///
/// A record is eligible when it is public, or when it is private/unlisted and
/// owned by the caller. `creator` narrows the result further; it is always
/// ANDed with the visibility rule and never replaces it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eligibility {
    pub caller: Option<String>,
    pub creator: Option<String>,
}

impl Eligibility {
    pub fn new(caller: Option<&str>, creator: Option<&str>) -> Self {
        Self {
            caller: caller.map(str::to_owned),
            creator: creator.map(str::to_owned),
        }
    }

    pub fn admits(&self, visibility: Visibility, owner: Option<&str>) -> bool {
        let visible = match visibility {
            Visibility::Public => true,
            Visibility::Private | Visibility::Unlisted => {
                matches!((owner, self.caller.as_deref()), (Some(o), Some(c)) if o == c)
            }
        };
        let restricted = match self.creator.as_deref() {
            Some(wanted) => owner == Some(wanted),
            None => true,
        };
        visible && restricted
    }
}

/// Trait defining operations for storing and retrieving Meme metadata.
#[async_trait]
pub trait MemeRepository: Send + Sync + 'static {
    /// Stores a new meme. Fails with `RepoError::Conflict` if the public id is taken.
    async fn create(&self, meme: &Meme) -> Result<(), RepoError>;

    /// All memes carrying this public id. Ids are unique, so this is zero or one.
    async fn find_by_public_id(&self, public_id: &str) -> Result<Vec<Meme>, RepoError>;

    /// Every meme the filter admits, in no particular order.
    async fn find_eligible(&self, filter: &Eligibility) -> Result<Vec<Meme>, RepoError>;

    /// The first `count` memes the filter admits, in `order`. Backends stop
    /// reading once they have `count`.
    async fn find_ordered(&self, filter: &Eligibility, order: Chronology, count: usize) -> Result<Vec<Meme>, RepoError>;
}

/// Direction of a chronological listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chronology {
    Oldest,
    Newest,
}

impl Chronology {
    /// Orders by creation time. Public id breaks ties so the two directions
    /// are exact inverses.
    pub fn sort(self, memes: &mut [Meme]) {
        memes.sort_by(|a, b| {
            let oldest_first = a
                .created_at
                .cmp(&b.created_at)
                .then_with(|| a.public_id.cmp(&b.public_id));
            match self {
                Chronology::Oldest => oldest_first,
                Chronology::Newest => oldest_first.reverse(),
            }
        });
    }
}

#[async_trait]
pub trait UserRepository: Send + Sync + 'static {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, RepoError>;
}

/// Likes and comments attached to memes.
#[async_trait]
pub trait EngagementRepository: Send + Sync + 'static {
    /// Like counts keyed by meme public id. Memes without likes may be absent.
    async fn like_counts(&self, meme_ids: &[String]) -> Result<HashMap<String, u64>, RepoError>;

    /// Comment counts keyed by meme public id. Memes without comments may be absent.
    async fn comment_counts(&self, meme_ids: &[String]) -> Result<HashMap<String, u64>, RepoError>;

    /// Comments on one meme, oldest first.
    async fn comments_for(&self, meme_id: &str) -> Result<Vec<Comment>, RepoError>;
}

#[async_trait]
pub trait TemplateRepository: Send + Sync + 'static {
    async fn find_eligible(&self, filter: &Eligibility) -> Result<Vec<Template>, RepoError>;

    async fn find_by_public_id(&self, public_id: &str) -> Result<Option<Template>, RepoError>;
}

/// A downloaded object.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub data: Bytes,
    pub content_type: Option<String>,
}

/// Trait defining operations for storing and retrieving file data (meme images).
#[async_trait]
pub trait FileStorage: Send + Sync + 'static {
    /// Uploads file data to the storage backend.
    async fn upload(&self, key: &str, data: Vec<u8>, content_type: Option<String>) -> Result<(), StorageError>;

    /// Downloads a whole object into memory.
    async fn download(&self, key: &str) -> Result<StoredFile, StorageError>;

    /// Deletes an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}
