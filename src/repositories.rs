use crate::{
    domain::{Chronology, Eligibility, EngagementRepository, MemeRepository, TemplateRepository, UserRepository},
    errors::RepoError,
    models::{parse_overlays, Comment, Meme, Template, User, Visibility},
};
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::SdkError,
    types::{AttributeValue, Select},
    Client as DynamoDbClient,
};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use std::collections::HashMap;
use tracing::{self, info};

type Item = HashMap<String, AttributeValue>;

/// GSI on `visibility`; meme entries are ranged by [`CREATED_SORT_ATTR`].
pub const BY_VISIBILITY_INDEX: &str = "by_visibility";
/// GSI on `creator`; meme entries are ranged by [`CREATED_SORT_ATTR`].
pub const BY_CREATOR_INDEX: &str = "by_creator";
/// GSI on `meme_public_id` for likes and comments.
pub const BY_MEME_INDEX: &str = "by_meme";
/// `{created_at}#{public_id}`: chronological, with the id as tie-breaker.
pub const CREATED_SORT_ATTR: &str = "created_sort";

// Concurrent per-meme count queries.
const COUNT_CONCURRENCY: usize = 8;

/// A Query against one GSI partition, with an optional filter.
#[derive(Debug, Clone)]
struct IndexQuery {
    index: &'static str,
    key_condition: String,
    filter: Option<String>,
    names: HashMap<String, String>,
    values: Item,
    newest_first: bool,
}

impl IndexQuery {
    fn partition(index: &'static str, attr: &str, value: &str) -> Self {
        Self {
            index,
            key_condition: "#pk = :pk".to_string(),
            filter: None,
            names: HashMap::from([("#pk".to_string(), attr.to_string())]),
            values: HashMap::from([(":pk".to_string(), s(value))]),
            newest_first: false,
        }
    }

    fn only_public(mut self) -> Self {
        self.names.insert("#vis".into(), "visibility".into());
        self.values.insert(":public".into(), s(Visibility::Public.as_str()));
        self.filter = Some("#vis = :public".into());
        self
    }

    fn only_hidden(mut self) -> Self {
        self.names.insert("#vis".into(), "visibility".into());
        self.values.insert(":private".into(), s(Visibility::Private.as_str()));
        self.values.insert(":unlisted".into(), s(Visibility::Unlisted.as_str()));
        self.filter = Some("#vis IN (:private, :unlisted)".into());
        self
    }

    fn newest_first(mut self, newest_first: bool) -> Self {
        self.newest_first = newest_first;
        self
    }
}

/// The index partitions holding everything `filter` admits. They are
/// disjoint, so their union needs no de-duplication.
fn eligibility_queries(filter: &Eligibility) -> Vec<IndexQuery> {
    match filter.creator.as_deref() {
        Some(creator) => {
            let query = IndexQuery::partition(BY_CREATOR_INDEX, "creator", creator);
            if filter.caller.as_deref() == Some(creator) {
                vec![query]
            } else {
                vec![query.only_public()]
            }
        }
        None => {
            let mut queries = vec![IndexQuery::partition(BY_VISIBILITY_INDEX, "visibility", Visibility::Public.as_str())];
            if let Some(caller) = filter.caller.as_deref() {
                queries.push(IndexQuery::partition(BY_CREATOR_INDEX, "creator", caller).only_hidden());
            }
            queries
        }
    }
}

/// Runs a Query, following `LastEvaluatedKey` until `wanted` items passed
/// the filter or the partition is exhausted.
async fn query_items(
    client: &DynamoDbClient,
    table_name: &str,
    query: &IndexQuery,
    wanted: Option<usize>,
) -> Result<Vec<Item>, RepoError> {
    tracing::debug!(table_name = %table_name, index = query.index, filter = ?query.filter, ?wanted, "DynamoDB: Querying index");
    let mut items: Vec<Item> = Vec::new();
    let mut last_evaluated_key: Option<Item> = None;

    loop {
        let mut request_builder = client
            .query()
            .table_name(table_name)
            .index_name(query.index)
            .key_condition_expression(&query.key_condition)
            .set_filter_expression(query.filter.clone())
            .set_expression_attribute_names(Some(query.names.clone()))
            .set_expression_attribute_values(Some(query.values.clone()))
            .scan_index_forward(!query.newest_first)
            .set_exclusive_start_key(last_evaluated_key.take());

        if let Some(wanted) = wanted {
            let remaining = wanted.saturating_sub(items.len()).clamp(1, 1000);
            request_builder = request_builder.limit(remaining as i32);
        }

        let resp = request_builder
            .send()
            .await
            .context(format!("DynamoDB: Failed to query index '{}' of table '{}'", query.index, table_name))
            .map_err(RepoError::BackendError)?;

        if let Some(page) = resp.items {
            items.extend(page);
        }

        last_evaluated_key = resp.last_evaluated_key;
        let satisfied = wanted.is_some_and(|wanted| items.len() >= wanted);
        if satisfied || last_evaluated_key.is_none() {
            break;
        }
    }

    if let Some(wanted) = wanted {
        items.truncate(wanted);
    }
    Ok(items)
}

/// Counts the items of an index partition without reading them.
async fn count_items(client: &DynamoDbClient, table_name: &str, query: &IndexQuery) -> Result<u64, RepoError> {
    let mut total: u64 = 0;
    let mut last_evaluated_key: Option<Item> = None;

    loop {
        let resp = client
            .query()
            .table_name(table_name)
            .index_name(query.index)
            .key_condition_expression(&query.key_condition)
            .set_expression_attribute_names(Some(query.names.clone()))
            .set_expression_attribute_values(Some(query.values.clone()))
            .select(Select::Count)
            .set_exclusive_start_key(last_evaluated_key.take())
            .send()
            .await
            .context(format!("DynamoDB: Failed to count index '{}' of table '{}'", query.index, table_name))
            .map_err(RepoError::BackendError)?;

        total += u64::try_from(resp.count).unwrap_or(0);
        last_evaluated_key = resp.last_evaluated_key;
        if last_evaluated_key.is_none() {
            break;
        }
    }
    Ok(total)
}

fn parse_items<T>(
    items: &[Item],
    table_name: &str,
    kind: &str,
    parse: impl Fn(&Item) -> Option<T>,
) -> Result<Vec<T>, RepoError> {
    items
        .iter()
        .map(|item| {
            parse(item).ok_or_else(|| {
                let item_id = item.get("public_id").and_then(|v| v.as_s().ok());
                tracing::error!(item.id = ?item_id, table_name = %table_name, "DynamoDB: Failed to parse {} item", kind);
                RepoError::DataCorruption(format!("{} {:?} in table '{}'", kind, item_id, table_name))
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct DynamoDbMemeRepository {
    client: DynamoDbClient,
    table_name: String,
}

impl DynamoDbMemeRepository {
    /// Creates a new repository instance configured for a specific table.
    pub fn new(client: DynamoDbClient, table_name: String) -> Self {
        info!(%table_name, "Initializing DynamoDbMemeRepository");
        Self { client, table_name }
    }
}

#[async_trait]
impl MemeRepository for DynamoDbMemeRepository {
    /// Conditional PutItem: refuses to overwrite an existing public id.
    async fn create(&self, meme: &Meme) -> Result<(), RepoError> {
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(meme_to_item(meme)))
            .condition_expression("attribute_not_exists(public_id)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(service_err)) if service_err.err().is_conditional_check_failed_exception() => {
                tracing::warn!(meme_id = %meme.public_id, "DynamoDB: public id already taken");
                Err(RepoError::Conflict(format!("meme {}", meme.public_id)))
            }
            Err(e) => Err(RepoError::BackendError(anyhow::Error::new(e).context(format!(
                "DynamoDB (table: {}): Failed to put meme (id: {})",
                self.table_name, meme.public_id
            )))),
        }
    }

    async fn find_by_public_id(&self, public_id: &str) -> Result<Vec<Meme>, RepoError> {
        let resp = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("public_id", s(public_id))
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to get meme (id: {})", self.table_name, public_id))
            .map_err(RepoError::BackendError)?;

        match resp.item {
            Some(item) => match item_to_meme(&item) {
                Some(meme) => Ok(vec![meme]),
                None => {
                    tracing::error!(meme_id = %public_id, table_name = %self.table_name, "DynamoDB: Retrieved item but failed to parse into Meme");
                    Err(RepoError::DataCorruption(format!("meme {} in table '{}'", public_id, self.table_name)))
                }
            },
            None => Ok(Vec::new()),
        }
    }

    async fn find_eligible(&self, filter: &Eligibility) -> Result<Vec<Meme>, RepoError> {
        let mut memes = Vec::new();
        for query in eligibility_queries(filter) {
            let items = query_items(&self.client, &self.table_name, &query, None).await?;
            memes.extend(parse_items(&items, &self.table_name, "meme", item_to_meme)?);
        }
        tracing::debug!(table_name = %self.table_name, count = memes.len(), "DynamoDB: eligible memes loaded");
        Ok(memes)
    }

    /// Reads at most `count` items from each eligible partition, in index
    /// order, then merges.
    async fn find_ordered(&self, filter: &Eligibility, order: Chronology, count: usize) -> Result<Vec<Meme>, RepoError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut memes = Vec::new();
        for query in eligibility_queries(filter) {
            let query = query.newest_first(order == Chronology::Newest);
            let items = query_items(&self.client, &self.table_name, &query, Some(count)).await?;
            memes.extend(parse_items(&items, &self.table_name, "meme", item_to_meme)?);
        }
        order.sort(&mut memes);
        memes.truncate(count);
        Ok(memes)
    }
}

#[derive(Debug, Clone)]
pub struct DynamoDbUserRepository {
    client: DynamoDbClient,
    table_name: String,
}

impl DynamoDbUserRepository {
    pub fn new(client: DynamoDbClient, table_name: String) -> Self {
        info!(%table_name, "Initializing DynamoDbUserRepository");
        Self { client, table_name }
    }
}

#[async_trait]
impl UserRepository for DynamoDbUserRepository {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, RepoError> {
        let resp = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("username", s(username))
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to get user '{}'", self.table_name, username))
            .map_err(RepoError::BackendError)?;

        resp.item
            .map(|item| {
                item_to_user(&item)
                    .ok_or_else(|| RepoError::DataCorruption(format!("user '{}' in table '{}'", username, self.table_name)))
            })
            .transpose()
    }
}

#[derive(Debug, Clone)]
pub struct DynamoDbEngagementRepository {
    client: DynamoDbClient,
    likes_table: String,
    comments_table: String,
}

impl DynamoDbEngagementRepository {
    pub fn new(client: DynamoDbClient, likes_table: String, comments_table: String) -> Self {
        info!(%likes_table, %comments_table, "Initializing DynamoDbEngagementRepository");
        Self { client, likes_table, comments_table }
    }

    /// One `Select::Count` query per meme on the `by_meme` index, a few in flight at once.
    async fn count_references(&self, table_name: &str, meme_ids: &[String]) -> Result<HashMap<String, u64>, RepoError> {
        let client = self.client.clone();
        let table_name = table_name.to_string();
        stream::iter(meme_ids.to_vec())
            .map(move |meme_id| {
                let client = client.clone();
                let table_name = table_name.clone();
                async move {
                    let query = IndexQuery::partition(BY_MEME_INDEX, "meme_public_id", &meme_id);
                    let count = count_items(&client, &table_name, &query).await?;
                    Ok::<_, RepoError>((meme_id, count))
                }
            })
            .buffer_unordered(COUNT_CONCURRENCY)
            .try_collect()
            .await
    }
}

#[async_trait]
impl EngagementRepository for DynamoDbEngagementRepository {
    async fn like_counts(&self, meme_ids: &[String]) -> Result<HashMap<String, u64>, RepoError> {
        self.count_references(&self.likes_table, meme_ids).await
    }

    async fn comment_counts(&self, meme_ids: &[String]) -> Result<HashMap<String, u64>, RepoError> {
        self.count_references(&self.comments_table, meme_ids).await
    }

    async fn comments_for(&self, meme_id: &str) -> Result<Vec<Comment>, RepoError> {
        let query = IndexQuery::partition(BY_MEME_INDEX, "meme_public_id", meme_id);
        let items = query_items(&self.client, &self.comments_table, &query, None).await?;
        let mut comments = parse_items(&items, &self.comments_table, "comment", item_to_comment)?;
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(comments)
    }
}

#[derive(Debug, Clone)]
pub struct DynamoDbTemplateRepository {
    client: DynamoDbClient,
    table_name: String,
}

impl DynamoDbTemplateRepository {
    pub fn new(client: DynamoDbClient, table_name: String) -> Self {
        info!(%table_name, "Initializing DynamoDbTemplateRepository");
        Self { client, table_name }
    }
}

#[async_trait]
impl TemplateRepository for DynamoDbTemplateRepository {
    async fn find_eligible(&self, filter: &Eligibility) -> Result<Vec<Template>, RepoError> {
        let mut templates = Vec::new();
        for query in eligibility_queries(filter) {
            let items = query_items(&self.client, &self.table_name, &query, None).await?;
            templates.extend(parse_items(&items, &self.table_name, "template", item_to_template)?);
        }
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }

    async fn find_by_public_id(&self, public_id: &str) -> Result<Option<Template>, RepoError> {
        let resp = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("public_id", s(public_id))
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to get template (id: {})", self.table_name, public_id))
            .map_err(RepoError::BackendError)?;

        resp.item
            .map(|item| {
                item_to_template(&item)
                    .ok_or_else(|| RepoError::DataCorruption(format!("template {} in table '{}'", public_id, self.table_name)))
            })
            .transpose()
    }
}

// --- Item conversion helpers ---

fn s(value: &str) -> AttributeValue {
    AttributeValue::S(value.to_string())
}

fn get_s<'a>(item: &'a Item, key: &str) -> Option<&'a str> {
    item.get(key)?.as_s().ok().map(String::as_str)
}

// Fixed-width UTC so string order is chronological order.
fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn get_time(item: &Item, key: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(get_s(item, key)?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn meme_to_item(meme: &Meme) -> Item {
    HashMap::from([
        ("public_id".to_string(), s(&meme.public_id)),
        ("name".to_string(), s(&meme.name)),
        ("creator".to_string(), s(&meme.creator)),
        ("visibility".to_string(), s(meme.visibility.as_str())),
        ("content_type".to_string(), s(&meme.content_type)),
        ("image_key".to_string(), s(&meme.image_key)),
        ("created_at".to_string(), s(&timestamp(&meme.created_at))),
        (
            CREATED_SORT_ATTR.to_string(),
            s(&format!("{}#{}", timestamp(&meme.created_at), meme.public_id)),
        ),
    ])
}

fn item_to_meme(item: &Item) -> Option<Meme> {
    Some(Meme {
        public_id: get_s(item, "public_id")?.to_string(),
        name: get_s(item, "name")?.to_string(),
        creator: get_s(item, "creator")?.to_string(),
        visibility: get_s(item, "visibility").map_or(Ok(Visibility::default()), |v| v.parse::<Visibility>()).ok()?,
        content_type: get_s(item, "content_type").unwrap_or("image/png").to_string(),
        image_key: get_s(item, "image_key")?.to_string(),
        created_at: get_time(item, "created_at")?,
    })
}

fn item_to_user(item: &Item) -> Option<User> {
    Some(User {
        username: get_s(item, "username")?.to_string(),
        display_name: get_s(item, "display_name")?.to_string(),
        password_hash: get_s(item, "password_hash")?.to_string(),
        created_at: get_time(item, "created_at")?,
    })
}

fn item_to_comment(item: &Item) -> Option<Comment> {
    Some(Comment {
        public_id: get_s(item, "public_id")?.to_string(),
        content: get_s(item, "content")?.to_string(),
        username: get_s(item, "username")?.to_string(),
        meme_public_id: get_s(item, "meme_public_id")?.to_string(),
        created_at: get_time(item, "created_at")?,
    })
}

fn item_to_template(item: &Item) -> Option<Template> {
    let texts = match get_s(item, "texts") {
        Some(raw) => parse_overlays(raw).ok()?,
        None => Vec::new(),
    };
    Some(Template {
        public_id: get_s(item, "public_id")?.to_string(),
        name: get_s(item, "name")?.to_string(),
        creator: get_s(item, "creator").map(str::to_string),
        visibility: get_s(item, "visibility").map_or(Ok(Visibility::default()), |v| v.parse::<Visibility>()).ok()?,
        content_type: get_s(item, "content_type").unwrap_or("image/png").to_string(),
        image_key: get_s(item, "image_key")?.to_string(),
        texts,
        created_at: get_time(item, "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn meme_items_round_trip() {
        let meme = Meme {
            public_id: "abc".into(),
            name: "cat".into(),
            creator: "alice".into(),
            visibility: Visibility::Unlisted,
            content_type: "image/gif".into(),
            image_key: "memes/abc.gif".into(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap(),
        };
        assert_eq!(item_to_meme(&meme_to_item(&meme)), Some(meme));
    }

    #[test]
    fn legacy_items_fall_back_to_defaults() {
        let mut item = meme_to_item(&Meme {
            public_id: "abc".into(),
            name: "cat".into(),
            creator: "alice".into(),
            visibility: Visibility::Private,
            content_type: "image/jpeg".into(),
            image_key: "memes/abc.jpg".into(),
            created_at: Utc::now(),
        });
        item.remove("visibility");
        item.remove("content_type");
        let meme = item_to_meme(&item).unwrap();
        assert_eq!(meme.visibility, Visibility::Public);
        assert_eq!(meme.content_type, "image/png");

        item.insert("visibility".into(), s("secret"));
        assert!(item_to_meme(&item).is_none());
    }

    #[test]
    fn sort_key_orders_like_the_timeline() {
        let at = |id: &str, micros: i64| {
            let created_at = Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap() + chrono::Duration::microseconds(micros);
            meme_to_item(&Meme {
                public_id: id.into(),
                name: "n".into(),
                creator: "alice".into(),
                visibility: Visibility::Public,
                content_type: "image/png".into(),
                image_key: "k".into(),
                created_at,
            })[CREATED_SORT_ATTR]
                .as_s()
                .unwrap()
                .clone()
        };
        assert!(at("z", 0) < at("a", 1));
        assert!(at("a", 1) < at("b", 1));
        assert!(at("b", 999_999) < at("a", 1_000_000));
    }

    #[test]
    fn anonymous_callers_read_only_the_public_partition() {
        let queries = eligibility_queries(&Eligibility::default());
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].index, BY_VISIBILITY_INDEX);
        assert_eq!(queries[0].values[":pk"], s("public"));
        assert!(queries[0].filter.is_none());
    }

    #[test]
    fn signed_in_callers_add_their_hidden_memes() {
        let queries = eligibility_queries(&Eligibility::new(Some("alice"), None));
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[1].index, BY_CREATOR_INDEX);
        assert_eq!(queries[1].values[":pk"], s("alice"));
        assert_eq!(queries[1].filter.as_deref(), Some("#vis IN (:private, :unlisted)"));
    }

    #[test]
    fn creator_restriction_keeps_visibility_rule() {
        let peeking = eligibility_queries(&Eligibility::new(Some("alice"), Some("bob")));
        assert_eq!(peeking.len(), 1);
        assert_eq!(peeking[0].index, BY_CREATOR_INDEX);
        assert_eq!(peeking[0].values[":pk"], s("bob"));
        assert_eq!(peeking[0].filter.as_deref(), Some("#vis = :public"));

        let own = eligibility_queries(&Eligibility::new(Some("bob"), Some("bob")));
        assert!(own[0].filter.is_none());
    }

    #[test]
    fn ordering_flips_the_index_direction() {
        let query = IndexQuery::partition(BY_VISIBILITY_INDEX, "visibility", "public").newest_first(true);
        assert!(query.newest_first);
        assert_eq!(query.key_condition, "#pk = :pk");
        assert_eq!(query.names["#pk"], "visibility");
    }
}
