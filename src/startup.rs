use crate::{
    config::{Config, StorageBackend},
    errors::AppError,
    memory::MemoryBackend,
    repositories::{
        DynamoDbEngagementRepository, DynamoDbMemeRepository, DynamoDbTemplateRepository,
        DynamoDbUserRepository, BY_CREATOR_INDEX, BY_MEME_INDEX, BY_VISIBILITY_INDEX,
        CREATED_SORT_ATTR,
    },
    storage::S3FileStorage,
    AppState,
};
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_smithy_types::error::operation::BuildError;
use aws_sdk_dynamodb::{
    error::SdkError as DynamoSdkError,
    types::{
        AttributeDefinition, BillingMode, GlobalSecondaryIndex, KeySchemaElement, KeyType, Projection,
        ProjectionType, ScalarAttributeType,
    },
    Client as DynamoDbClient,
};
use aws_sdk_s3::{
    error::SdkError as S3SdkError,
    types::{BucketLocationConstraint, CreateBucketConfiguration},
    Client as S3Client,
};
use backoff::{future::retry, ExponentialBackoffBuilder};
use std::{sync::Arc, time::Duration};
use tracing;

// How long startup keeps retrying while LocalStack / AWS is unreachable.
const INIT_RETRY_WINDOW: Duration = Duration::from_secs(30);

/// Key layout of one table or index. Every key attribute is a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KeySpec {
    hash_key: &'static str,
    range_key: Option<&'static str>,
}

impl KeySpec {
    fn hash(hash_key: &'static str) -> Self {
        Self { hash_key, range_key: None }
    }

    fn ranged(hash_key: &'static str, range_key: &'static str) -> Self {
        Self { hash_key, range_key: Some(range_key) }
    }

    fn attributes(&self) -> impl Iterator<Item = (&'static str, KeyType)> {
        std::iter::once((self.hash_key, KeyType::Hash))
            .chain(self.range_key.map(|range| (range, KeyType::Range)))
    }
}

#[derive(Debug, Clone)]
struct TableSpec {
    name: String,
    key: KeySpec,
    indexes: Vec<(&'static str, KeySpec)>,
}

fn table_specs(config: &Config) -> Vec<TableSpec> {
    vec![
        TableSpec {
            name: config.table_name("memes"),
            key: KeySpec::hash("public_id"),
            indexes: vec![
                (BY_VISIBILITY_INDEX, KeySpec::ranged("visibility", CREATED_SORT_ATTR)),
                (BY_CREATOR_INDEX, KeySpec::ranged("creator", CREATED_SORT_ATTR)),
            ],
        },
        TableSpec { name: config.table_name("users"), key: KeySpec::hash("username"), indexes: vec![] },
        TableSpec {
            name: config.table_name("comments"),
            key: KeySpec::hash("public_id"),
            indexes: vec![(BY_MEME_INDEX, KeySpec::ranged("meme_public_id", "created_at"))],
        },
        TableSpec {
            name: config.table_name("likes"),
            key: KeySpec::ranged("username", "meme_public_id"),
            indexes: vec![(BY_MEME_INDEX, KeySpec::ranged("meme_public_id", "username"))],
        },
        TableSpec {
            name: config.table_name("templates"),
            key: KeySpec::hash("public_id"),
            indexes: vec![
                (BY_VISIBILITY_INDEX, KeySpec::hash("visibility")),
                (BY_CREATOR_INDEX, KeySpec::hash("creator")),
            ],
        },
    ]
}

/// Wires repositories and storage to the configured backend.
pub async fn build_state(config: Config) -> Result<Arc<AppState>, AppError> {
    match config.backend {
        StorageBackend::Memory => {
            tracing::warn!("Startup: using the in-memory backend; data is lost on restart");
            let backend = MemoryBackend::default();
            Ok(Arc::new(AppState::in_memory(config, &backend)))
        }
        StorageBackend::Aws => {
            let sdk_config = create_sdk_config(&config).await;
            let db_client = DynamoDbClient::new(&sdk_config);
            let s3_client = create_s3_client(&sdk_config);

            init_resources(&db_client, &s3_client, &config).await?;

            let state = AppState::new(
                config.clone(),
                Arc::new(DynamoDbMemeRepository::new(db_client.clone(), config.table_name("memes"))),
                Arc::new(DynamoDbUserRepository::new(db_client.clone(), config.table_name("users"))),
                Arc::new(DynamoDbEngagementRepository::new(
                    db_client.clone(),
                    config.table_name("likes"),
                    config.table_name("comments"),
                )),
                Arc::new(DynamoDbTemplateRepository::new(db_client, config.table_name("templates"))),
                Arc::new(S3FileStorage::new(s3_client, config.meme_bucket_name.clone())),
            );
            Ok(Arc::new(state))
        }
    }
}

// Region and optional endpoint come from `Config`; credentials from the
// default provider chain.
async fn create_sdk_config(config: &Config) -> SdkConfig {
    tracing::info!(sdk_region = %config.aws_region, "Setting SDK region");
    let mut config_loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.aws_region.clone()));

    if let Some(endpoint_url) = &config.localstack_endpoint {
        tracing::info!("Using localstack endpoint override: {}", endpoint_url);
        config_loader = config_loader.endpoint_url(endpoint_url);
    } else {
        tracing::info!("Using default AWS endpoints and credential resolution.");
    }

    config_loader.load().await
}

fn create_s3_client(sdk_config: &SdkConfig) -> S3Client {
    let s3_config = aws_sdk_s3::config::Builder::from(sdk_config)
        .force_path_style(true)
        .build();
    S3Client::from_conf(s3_config)
}

fn transient(context: String) -> backoff::Error<AppError> {
    tracing::warn!("{} (will retry)", context);
    backoff::Error::transient(AppError::InitError(context))
}

fn permanent(context: String) -> backoff::Error<AppError> {
    tracing::error!("{}", context);
    backoff::Error::permanent(AppError::InitError(context))
}

fn key_schema_for(key: &KeySpec) -> Result<Vec<KeySchemaElement>, BuildError> {
    key.attributes()
        .map(|(attribute, key_type)| {
            KeySchemaElement::builder()
                .attribute_name(attribute)
                .key_type(key_type)
                .build()
        })
        .collect()
}

/// Creates the DynamoDB table and its indexes if it doesn't exist. An
/// existing table is left as is.
async fn create_table_if_not_exists(client: &DynamoDbClient, spec: &TableSpec) -> Result<(), backoff::Error<AppError>> {
    let permanent_build = |e: BuildError| backoff::Error::permanent(AppError::from(e));

    let mut attribute_names: Vec<&'static str> = Vec::new();
    for key in std::iter::once(&spec.key).chain(spec.indexes.iter().map(|(_, key)| key)) {
        for (attribute, _) in key.attributes() {
            if !attribute_names.contains(&attribute) {
                attribute_names.push(attribute);
            }
        }
    }
    let attribute_definitions = attribute_names
        .into_iter()
        .map(|attribute| {
            AttributeDefinition::builder()
                .attribute_name(attribute)
                .attribute_type(ScalarAttributeType::S)
                .build()
                .map_err(permanent_build)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let key_schema = key_schema_for(&spec.key).map_err(permanent_build)?;

    let mut indexes = Vec::new();
    for (index_name, key) in &spec.indexes {
        indexes.push(
            GlobalSecondaryIndex::builder()
                .index_name(*index_name)
                .set_key_schema(Some(key_schema_for(key).map_err(permanent_build)?))
                .projection(Projection::builder().projection_type(ProjectionType::All).build())
                .build()
                .map_err(permanent_build)?,
        );
    }

    let result = client
        .create_table()
        .table_name(&spec.name)
        .set_attribute_definitions(Some(attribute_definitions))
        .set_key_schema(Some(key_schema))
        .set_global_secondary_indexes((!indexes.is_empty()).then_some(indexes))
        .billing_mode(BillingMode::PayPerRequest)
        .send()
        .await;

    match result {
        Ok(_) => {
            tracing::info!("Startup: Table '{}' created.", spec.name);
            Ok(())
        }
        Err(DynamoSdkError::ServiceError(service_err)) if service_err.err().is_resource_in_use_exception() => {
            tracing::info!("Startup: Table '{}' already exists, no action needed.", spec.name);
            Ok(())
        }
        Err(e @ (DynamoSdkError::DispatchFailure(_) | DynamoSdkError::TimeoutError(_))) => {
            Err(transient(format!("Startup: DynamoDB unreachable while creating table '{}': {}", spec.name, e)))
        }
        Err(e) => Err(permanent(format!("Startup: Error creating DynamoDB table '{}': {}", spec.name, e))),
    }
}

/// Ensures the S3 bucket exists, creating it with the correct location constraint if needed.
async fn ensure_s3_bucket_exists(client: &S3Client, bucket_name: &str, region_str: &str) -> Result<(), backoff::Error<AppError>> {
    let mut create_bucket_req_builder = client.create_bucket().bucket(bucket_name);
    if region_str != "us-east-1" {
        create_bucket_req_builder = create_bucket_req_builder.create_bucket_configuration(
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region_str))
                .build(),
        );
    }

    match create_bucket_req_builder.send().await {
        Ok(_) => {
            tracing::info!("Startup: S3 bucket '{}' created.", bucket_name);
            Ok(())
        }
        Err(S3SdkError::ServiceError(service_err))
            if service_err.err().is_bucket_already_owned_by_you() || service_err.err().is_bucket_already_exists() =>
        {
            tracing::info!("Startup: S3 bucket '{}' already exists.", bucket_name);
            Ok(())
        }
        Err(e @ (S3SdkError::DispatchFailure(_) | S3SdkError::TimeoutError(_))) => {
            Err(transient(format!("Startup: S3 unreachable while creating bucket '{}': {}", bucket_name, e)))
        }
        Err(e) => Err(permanent(format!("Startup: Error creating S3 bucket '{}': {}", bucket_name, e))),
    }
}

/// Initializes required AWS resources (DynamoDB tables, S3 bucket).
pub async fn init_resources(db_client: &DynamoDbClient, s3_client: &S3Client, config: &Config) -> Result<(), AppError> {
    tracing::info!("Startup: Initializing AWS resources...");
    let policy = || {
        ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(INIT_RETRY_WINDOW))
            .build()
    };

    for spec in table_specs(config) {
        retry(policy(), || create_table_if_not_exists(db_client, &spec)).await?;
    }
    retry(policy(), || {
        ensure_s3_bucket_exists(s3_client, &config.meme_bucket_name, &config.aws_region)
    })
    .await?;

    tracing::info!("Startup: AWS resource initialization complete.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_table_is_prefixed() {
        let config = Config { table_prefix: "test_".into(), ..Config::default() };
        let specs = table_specs(&config);
        assert_eq!(specs.len(), 5);
        assert!(specs.iter().all(|s| s.name.starts_with("test_")));

        let likes = specs.iter().find(|s| s.name == "test_likes").unwrap();
        assert_eq!(likes.key, KeySpec::ranged("username", "meme_public_id"));
    }

    #[test]
    fn engagement_tables_are_indexed_by_meme() {
        let specs = table_specs(&Config::default());
        for table in ["likes", "comments"] {
            let spec = specs.iter().find(|s| s.name == table).unwrap();
            let (index, key) = spec.indexes[0];
            assert_eq!(index, BY_MEME_INDEX);
            assert_eq!(key.hash_key, "meme_public_id");
        }

        let memes = specs.iter().find(|s| s.name == "memes").unwrap();
        assert!(memes.indexes.iter().all(|(_, key)| key.range_key == Some(CREATED_SORT_ATTR)));
    }

    #[tokio::test]
    async fn memory_backend_needs_no_aws() {
        let state = build_state(Config::default()).await.unwrap();
        assert_eq!(state.config.backend, StorageBackend::Memory);
    }
}
