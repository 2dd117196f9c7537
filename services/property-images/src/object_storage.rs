use crate::best_effort::best_effort;
use crate::config::S3Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Blob written by [`ObjectStorage::put`]
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    /// Full object key, `{property}/{name}`
    pub path: String,
    /// Object name within the property prefix
    pub name: String,
    pub url: String,
    pub content_type: String,
    pub size_bytes: usize,
}

/// Listing entry under a property prefix
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub name: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Bucket of property images, partitioned by property id
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `data` under a fresh name whose extension follows `content_type`, else `file_name`
    async fn put(
        &self,
        property_id: &str,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<StoredBlob>;

    async fn list(&self, property_id: &str) -> Result<Vec<StoredObject>>;

    fn public_url(&self, property_id: &str, name: &str) -> String;

    async fn remove(&self, property_id: &str, name: &str) -> Result<()>;
}

/// S3-compatible object storage
pub struct S3ObjectStorage {
    client: S3Client,
    bucket: String,
    public_url_base: String,
    bucket_ready: OnceCell<()>,
}

impl S3ObjectStorage {
    /// Create a new S3 storage adapter
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        let public_url_base = config
            .public_url_base
            .clone()
            .unwrap_or_else(|| format!("https://s3.{}.amazonaws.com", config.region))
            .trim_end_matches('/')
            .to_string();

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "Object storage initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            public_url_base,
            bucket_ready: OnceCell::new(),
        })
    }

    /// Create the bucket once per process; failures (usually "already exists") are ignored
    async fn ensure_bucket(&self) {
        self.bucket_ready
            .get_or_init(|| async {
                let created = best_effort("create_bucket", async {
                    match self.client.create_bucket().bucket(&self.bucket).send().await {
                        Ok(_) => Ok(true),
                        Err(e)
                            if e.as_service_error().is_some_and(|se| {
                                se.is_bucket_already_owned_by_you()
                                    || se.is_bucket_already_exists()
                            }) =>
                        {
                            Ok(false)
                        }
                        Err(e) => Err(e).context("Failed to create bucket"),
                    }
                })
                .await;

                if created == Some(true) {
                    info!(bucket = %self.bucket, "Created image bucket");
                }
            })
            .await;
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn put(
        &self,
        property_id: &str,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<StoredBlob> {
        self.ensure_bucket().await;

        let name = generate_object_name(file_name, content_type, Utc::now());
        let path = object_key(property_id, &name);
        let size_bytes = data.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&path)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .metadata("property-id", property_id)
            .send()
            .await
            .context("Failed to upload image to object storage")?;

        info!(path = %path, size_bytes, "Image stored");

        Ok(StoredBlob {
            url: self.public_url(property_id, &name),
            path,
            name,
            content_type: content_type.to_string(),
            size_bytes,
        })
    }

    #[instrument(skip(self))]
    async fn list(&self, property_id: &str) -> Result<Vec<StoredObject>> {
        let prefix = object_key(property_id, "");
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .context("Failed to list property images")?;

            for obj in response.contents() {
                let Some(name) = obj.key().and_then(|k| k.strip_prefix(prefix.as_str())) else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }
                let updated_at = obj
                    .last_modified()
                    .and_then(|t| Utc.timestamp_opt(t.secs(), t.subsec_nanos()).single());
                objects.push(StoredObject {
                    name: name.to_string(),
                    updated_at,
                });
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(count = objects.len(), "Listed stored images");
        Ok(objects)
    }

    fn public_url(&self, property_id: &str, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.public_url_base,
            self.bucket,
            object_key(property_id, name)
        )
    }

    #[instrument(skip(self))]
    async fn remove(&self, property_id: &str, name: &str) -> Result<()> {
        let key = object_key(property_id, name);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .context("Failed to delete stored image")?;

        debug!(key = %key, "Stored image deleted");
        Ok(())
    }
}

/// Object key for a name under the property's prefix
pub fn object_key(property_id: &str, name: &str) -> String {
    format!("{}/{}", encode_path_component(property_id), name)
}

/// `{timestamp_millis}-{random}.{ext}`
pub fn generate_object_name(file_name: &str, content_type: &str, now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    let extension = extension_for(content_type)
        .map(str::to_string)
        .or_else(|| file_extension(file_name))
        .unwrap_or_else(|| "bin".to_string());
    format!("{}-{}.{}", now.timestamp_millis(), &random[..8], extension)
}

/// Lowercased extension, restricted to alphanumerics
pub fn file_extension(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    (!ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())).then_some(ext)
}

/// Content type inferred from the file extension
pub fn content_type_for(file_name: &str) -> &'static str {
    match file_extension(file_name).as_deref() {
        Some("jpeg" | "jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Extension for the image content types we recognize
fn extension_for(content_type: &str) -> Option<&'static str> {
    match content_type.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/svg+xml" => Some("svg"),
        _ => None,
    }
}

/// Encode a property id as a single key segment.
///
/// `[A-Za-z0-9_-]` pass through and every other byte becomes `~XX`, so distinct
/// ids never share a prefix and no id can escape its segment.
fn encode_path_component(component: &str) -> String {
    let mut encoded = String::with_capacity(component.len());
    for byte in component.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("~{byte:02X}")),
        }
    }
    encoded
}
