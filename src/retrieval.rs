//! Visibility-aware meme retrieval: by id, random sample, or chronological pages.

use crate::{
    domain::{Chronology, Eligibility, MemeRepository},
    errors::{AppError, RepoError},
    models::{Meme, Visibility},
    query::MemeQuery,
};
use rand::seq::IndexedRandom;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Meme not found with ID: {0}")]
    NotFound(String),
    #[error("Meme {0} is private")]
    Unauthorized(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Backend(#[from] RepoError),
}

impl From<RetrievalError> for AppError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::NotFound(id) => AppError::MemeNotFound(id),
            RetrievalError::Unauthorized(id) => {
                AppError::Unauthorized(format!("Meme {} is private", id))
            }
            RetrievalError::BadRequest(msg) => AppError::InvalidInput(msg),
            RetrievalError::Backend(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    Random,
    Newest,
    Oldest,
    All,
}

impl FromStr for SortMode {
    type Err = RetrievalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(SortMode::Random),
            "newest" => Ok(SortMode::Newest),
            "oldest" => Ok(SortMode::Oldest),
            "all" => Ok(SortMode::All),
            other => Err(RetrievalError::BadRequest(format!("Unsupported sort mode: {}", other))),
        }
    }
}

/// What a retrieval produced: one addressed meme, or an ordered list.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    One(Meme),
    Many(Vec<Meme>),
}

impl Selection {
    pub fn memes(&self) -> &[Meme] {
        match self {
            Selection::One(meme) => std::slice::from_ref(meme),
            Selection::Many(memes) => memes,
        }
    }

    pub fn into_memes(self) -> Vec<Meme> {
        match self {
            Selection::One(meme) => vec![meme],
            Selection::Many(memes) => memes,
        }
    }
}

/// Fetches the memes a query asks for, as seen by `caller`. The result is
/// always a list; an `id` query yields the matches for that id.
pub async fn retrieve(
    repo: &dyn MemeRepository,
    query: &MemeQuery,
    caller: Option<&str>,
) -> Result<Selection, RetrievalError> {
    if let Some(id) = query.id.as_deref() {
        return Ok(Selection::Many(retrieve_by_id(repo, id, caller).await?));
    }

    let sort: SortMode = query.sort.parse()?;
    let filter = Eligibility::new(caller, query.creator.as_deref());
    let limit = query.limit as usize;
    let skip = query.skip as usize;

    let memes = match sort {
        SortMode::Random => {
            let eligible = repo.find_eligible(&filter).await?;
            tracing::debug!(eligible = eligible.len(), ?filter, "Sampling memes");
            let mut rng = rand::rng();
            eligible.choose_multiple(&mut rng, limit).cloned().collect()
        }
        SortMode::Oldest | SortMode::Newest => {
            let order = if sort == SortMode::Newest { Chronology::Newest } else { Chronology::Oldest };
            let page = repo.find_ordered(&filter, order, skip.saturating_add(limit)).await?;
            tracing::debug!(?order, fetched = page.len(), skip, limit, ?filter, "Paging memes");
            page.into_iter().skip(skip).take(limit).collect()
        }
        SortMode::All => {
            let mut eligible = repo.find_eligible(&filter).await?;
            Chronology::Oldest.sort(&mut eligible);
            eligible
        }
    };
    Ok(Selection::Many(memes))
}

/// Looks a meme up by public id. Only `private` memes are refused to
/// non-owners here; `unlisted` memes are reachable by anyone holding the id.
pub async fn retrieve_by_id(
    repo: &dyn MemeRepository,
    public_id: &str,
    caller: Option<&str>,
) -> Result<Vec<Meme>, RetrievalError> {
    let found = repo.find_by_public_id(public_id).await?;

    if found.is_empty() {
        return Err(RetrievalError::NotFound(public_id.to_string()));
    }
    for meme in &found {
        if meme.visibility == Visibility::Private && caller != Some(meme.creator.as_str()) {
            tracing::debug!(meme_id = %public_id, ?caller, "Refusing private meme to non-owner");
            return Err(RetrievalError::Unauthorized(public_id.to_string()));
        }
    }
    if found.len() > 1 {
        tracing::warn!(meme_id = %public_id, count = found.len(), "Public id is not unique");
    }
    Ok(found)
}

/// The single meme behind an id, with the same access rules as [`retrieve_by_id`].
pub async fn retrieve_one(
    repo: &dyn MemeRepository,
    public_id: &str,
    caller: Option<&str>,
) -> Result<Meme, RetrievalError> {
    retrieve_by_id(repo, public_id, caller)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| RetrievalError::NotFound(public_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::QueryLimits, memory::InMemoryMemeRepository, query::RawMemeQuery};
    use chrono::{Duration, TimeZone, Utc};

    fn meme(id: &str, creator: &str, visibility: Visibility, day: i64) -> Meme {
        Meme {
            public_id: id.to_string(),
            name: format!("meme {}", id),
            creator: creator.to_string(),
            visibility,
            content_type: "image/png".to_string(),
            image_key: format!("memes/{}.png", id),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day),
        }
    }

    async fn repo_with(memes: Vec<Meme>) -> InMemoryMemeRepository {
        let repo = InMemoryMemeRepository::default();
        for m in memes {
            repo.create(&m).await.unwrap();
        }
        repo
    }

    fn query(pairs: &[(&str, &str)]) -> MemeQuery {
        let mut raw = RawMemeQuery::default();
        for (k, v) in pairs {
            let v = Some(v.to_string());
            match *k {
                "sort" => raw.sort = v,
                "id" => raw.id = v,
                "limit" => raw.limit = v,
                "creator" => raw.creator = v,
                "skip" => raw.skip = v,
                _ => unreachable!(),
            }
        }
        raw.normalize(QueryLimits::default())
    }

    fn ids(selection: &Selection) -> Vec<&str> {
        selection.memes().iter().map(|m| m.public_id.as_str()).collect()
    }

    #[tokio::test]
    async fn newest_hides_other_peoples_private_memes() {
        let repo = repo_with(vec![
            meme("A", "alice", Visibility::Public, 1),
            meme("B", "bob", Visibility::Private, 2),
        ])
        .await;

        let as_alice = retrieve(&repo, &query(&[("sort", "newest")]), Some("alice")).await.unwrap();
        assert_eq!(ids(&as_alice), vec!["A"]);

        let as_bob = retrieve(&repo, &query(&[("sort", "newest")]), Some("bob")).await.unwrap();
        assert_eq!(ids(&as_bob), vec!["B", "A"]);
    }

    #[tokio::test]
    async fn by_id_respects_private_visibility() {
        let repo = repo_with(vec![
            meme("A", "alice", Visibility::Public, 1),
            meme("B", "bob", Visibility::Private, 2),
            meme("C", "bob", Visibility::Unlisted, 3),
        ])
        .await;

        let public = retrieve(&repo, &query(&[("id", "A")]), None).await.unwrap();
        assert!(matches!(public, Selection::Many(_)));
        assert_eq!(ids(&public), vec!["A"]);

        let denied = retrieve(&repo, &query(&[("id", "B")]), Some("alice")).await;
        assert!(matches!(denied, Err(RetrievalError::Unauthorized(_))));
        let denied = retrieve(&repo, &query(&[("id", "B")]), None).await;
        assert!(matches!(denied, Err(RetrievalError::Unauthorized(_))));

        let owner = retrieve(&repo, &query(&[("id", "B")]), Some("bob")).await.unwrap();
        assert_eq!(ids(&owner), vec!["B"]);

        let unlisted = retrieve(&repo, &query(&[("id", "C")]), None).await.unwrap();
        assert_eq!(ids(&unlisted), vec!["C"]);

        let missing = retrieve(&repo, &query(&[("id", "nope")]), None).await;
        assert!(matches!(missing, Err(RetrievalError::NotFound(_))));
    }

    #[tokio::test]
    async fn newest_and_oldest_are_inverses() {
        let repo = repo_with(vec![
            meme("a", "alice", Visibility::Public, 3),
            meme("b", "alice", Visibility::Public, 1),
            meme("c", "bob", Visibility::Public, 1),
            meme("d", "bob", Visibility::Unlisted, 2),
            meme("e", "carol", Visibility::Public, 5),
        ])
        .await;

        let newest = retrieve(&repo, &query(&[("sort", "newest"), ("limit", "100")]), Some("bob"))
            .await
            .unwrap()
            .into_memes();
        let mut oldest = retrieve(&repo, &query(&[("sort", "oldest"), ("limit", "100")]), Some("bob"))
            .await
            .unwrap()
            .into_memes();
        oldest.reverse();
        assert_eq!(newest, oldest);
        assert_eq!(newest.len(), 5);
    }

    #[tokio::test]
    async fn skip_then_limit() {
        let repo = repo_with((0..10).map(|i| meme(&format!("m{}", i), "alice", Visibility::Public, i)).collect()).await;

        let page = retrieve(&repo, &query(&[("sort", "oldest"), ("skip", "3"), ("limit", "4")]), None)
            .await
            .unwrap();
        assert_eq!(ids(&page), vec!["m3", "m4", "m5", "m6"]);

        let tail = retrieve(&repo, &query(&[("sort", "newest"), ("skip", "8"), ("limit", "5")]), None)
            .await
            .unwrap();
        assert_eq!(ids(&tail), vec!["m1", "m0"]);
    }

    #[tokio::test]
    async fn random_stays_within_limit_and_eligible_set() {
        let mut memes: Vec<Meme> = (0..30)
            .map(|i| meme(&format!("pub{}", i), "alice", Visibility::Public, i))
            .collect();
        memes.extend((0..10).map(|i| meme(&format!("hidden{}", i), "bob", Visibility::Private, i)));
        let repo = repo_with(memes).await;

        for _ in 0..20 {
            let sample = retrieve(&repo, &query(&[("sort", "random"), ("limit", "7")]), Some("alice"))
                .await
                .unwrap();
            let sample = sample.memes();
            assert_eq!(sample.len(), 7);
            assert!(sample.iter().all(|m| m.visibility == Visibility::Public));
        }

        let small = retrieve(&repo, &query(&[("sort", "random"), ("limit", "50"), ("creator", "bob")]), None)
            .await
            .unwrap();
        assert!(small.memes().is_empty());
    }

    #[tokio::test]
    async fn creator_filter_is_anded_with_visibility() {
        let repo = repo_with(vec![
            meme("A", "alice", Visibility::Public, 1),
            meme("B", "bob", Visibility::Private, 2),
            meme("C", "bob", Visibility::Public, 3),
        ])
        .await;

        let result = retrieve(&repo, &query(&[("sort", "all"), ("creator", "bob")]), Some("alice"))
            .await
            .unwrap();
        assert_eq!(ids(&result), vec!["C"]);

        let own = retrieve(&repo, &query(&[("sort", "all"), ("creator", "bob")]), Some("bob"))
            .await
            .unwrap();
        assert_eq!(ids(&own), vec!["B", "C"]);
    }

    #[tokio::test]
    async fn all_ignores_pagination() {
        let repo = repo_with((0..15).map(|i| meme(&format!("m{:02}", i), "alice", Visibility::Public, i)).collect()).await;
        let everything = retrieve(&repo, &query(&[("sort", "all"), ("limit", "2"), ("skip", "5")]), None)
            .await
            .unwrap();
        assert_eq!(everything.memes().len(), 15);
    }

    #[tokio::test]
    async fn single_lookup_follows_id_rules() {
        let repo = repo_with(vec![
            meme("A", "alice", Visibility::Public, 1),
            meme("B", "bob", Visibility::Private, 2),
        ])
        .await;

        let found = retrieve_one(&repo, "A", None).await.unwrap();
        assert_eq!(found.public_id, "A");
        assert!(matches!(retrieve_one(&repo, "B", Some("alice")).await, Err(RetrievalError::Unauthorized(_))));
        assert!(matches!(retrieve_one(&repo, "Z", None).await, Err(RetrievalError::NotFound(_))));
    }

    #[tokio::test]
    async fn unknown_sort_is_a_bad_request() {
        let repo = repo_with(vec![]).await;
        let result = retrieve(&repo, &query(&[("sort", "popular")]), None).await;
        assert!(matches!(result, Err(RetrievalError::BadRequest(_))));
    }
}
