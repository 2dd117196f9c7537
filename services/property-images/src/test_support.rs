//! In-memory backends for exercising the fallback chain without network I/O.

use crate::metadata_store::{ImageMetadataStore, ImageRecord, NewImageRecord};
use crate::object_storage::{
    generate_object_name, object_key, ObjectStorage, StoredBlob, StoredObject,
};
use crate::provider_client::{
    ImageOrder, ProviderError, ProviderImage, ProviderImageService, ProviderImageUpload,
};
use crate::resolver::{PropertyDirectory, ProviderPropertyId};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryDirectory {
    pub mappings: HashMap<String, i64>,
}

impl InMemoryDirectory {
    pub fn with(property_id: &str, provider_id: i64) -> Self {
        Self {
            mappings: HashMap::from([(property_id.to_string(), provider_id)]),
        }
    }
}

#[async_trait]
impl PropertyDirectory for InMemoryDirectory {
    async fn provider_id(&self, property_id: &str) -> Result<Option<i64>> {
        Ok(self.mappings.get(property_id).copied())
    }
}

/// Provider whose answers are scripted per test; `Err(status)` simulates a failure
pub struct FakeProvider {
    pub list: Mutex<std::result::Result<Vec<ProviderImage>, u16>>,
    pub upload: Mutex<std::result::Result<ProviderImage, u16>>,
    pub reorder: Mutex<std::result::Result<Vec<ProviderImage>, u16>>,
    pub uploads: Mutex<Vec<(i64, ProviderImageUpload)>>,
    pub calls: AtomicUsize,
}

impl Default for FakeProvider {
    fn default() -> Self {
        Self {
            list: Mutex::new(Ok(Vec::new())),
            upload: Mutex::new(Err(500)),
            reorder: Mutex::new(Ok(Vec::new())),
            uploads: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }
}

impl FakeProvider {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn scripted<T: Clone>(
    answer: &Mutex<std::result::Result<T, u16>>,
) -> std::result::Result<T, ProviderError> {
    answer.lock().clone().map_err(|status| ProviderError::Status {
        status,
        details: serde_json::json!({ "UserMessage": "scripted failure" }),
    })
}

#[async_trait]
impl ProviderImageService for FakeProvider {
    async fn list_images(
        &self,
        _property: ProviderPropertyId,
    ) -> std::result::Result<Vec<ProviderImage>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        scripted(&self.list)
    }

    async fn upload_image(
        &self,
        property: ProviderPropertyId,
        upload: ProviderImageUpload,
    ) -> std::result::Result<ProviderImage, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.uploads.lock().push((property.get(), upload));
        scripted(&self.upload)
    }

    async fn reorder_images(
        &self,
        _property: ProviderPropertyId,
        _order: ImageOrder,
    ) -> std::result::Result<Vec<ProviderImage>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        scripted(&self.reorder)
    }
}

#[derive(Default)]
pub struct InMemoryMetadataStore {
    pub rows: Mutex<Vec<ImageRecord>>,
    pub fail: bool,
}

impl InMemoryMetadataStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn rows_for(&self, property_id: &str) -> Vec<ImageRecord> {
        self.rows
            .lock()
            .iter()
            .filter(|r| r.property_id == property_id)
            .cloned()
            .collect()
    }

    pub fn seed(&self, property_id: &str, href: &str) {
        let now = Utc::now();
        self.rows.lock().push(ImageRecord {
            id: Uuid::new_v4(),
            property_id: property_id.to_string(),
            buildium_image_id: None,
            name: Some("seeded.jpg".to_string()),
            description: None,
            file_type: Some("image/jpeg".to_string()),
            file_size: None,
            is_private: Some(false),
            href: Some(href.to_string()),
            sort_index: Some(0),
            created_at: now,
            updated_at: now,
        });
    }
}

#[async_trait]
impl ImageMetadataStore for InMemoryMetadataStore {
    async fn upsert_single(&self, property_id: &str, record: NewImageRecord) -> Result<ImageRecord> {
        if self.fail {
            bail!("metadata table unavailable");
        }
        let now = Utc::now();
        let row = ImageRecord {
            id: Uuid::new_v4(),
            property_id: property_id.to_string(),
            buildium_image_id: record.buildium_image_id,
            name: record.name,
            description: record.description,
            file_type: record.file_type,
            file_size: record.file_size,
            is_private: record.is_private,
            href: record.href,
            sort_index: record.sort_index,
            created_at: now,
            updated_at: now,
        };
        let mut rows = self.rows.lock();
        rows.retain(|r| r.property_id != property_id);
        rows.push(row.clone());
        Ok(row)
    }

    async fn most_recent(&self, property_id: &str) -> Result<Option<ImageRecord>> {
        if self.fail {
            bail!("metadata table unavailable");
        }
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|r| r.property_id == property_id)
            .max_by_key(|r| r.updated_at)
            .cloned())
    }

    async fn delete_for_property(&self, property_id: &str) -> Result<u64> {
        if self.fail {
            bail!("metadata table unavailable");
        }
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|r| r.property_id != property_id);
        Ok((before - rows.len()) as u64)
    }
}

/// Metadata store whose first `upsert_single` parks until released.
///
/// `entered` fires when that write is reached; it then waits on `release`.
pub struct GatedMetadataStore {
    pub inner: Arc<InMemoryMetadataStore>,
    pub entered: Notify,
    pub release: Notify,
    armed: AtomicBool,
}

impl GatedMetadataStore {
    pub fn new(inner: Arc<InMemoryMetadataStore>) -> Self {
        Self {
            inner,
            entered: Notify::new(),
            release: Notify::new(),
            armed: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl ImageMetadataStore for GatedMetadataStore {
    async fn upsert_single(&self, property_id: &str, record: NewImageRecord) -> Result<ImageRecord> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.upsert_single(property_id, record).await
    }

    async fn most_recent(&self, property_id: &str) -> Result<Option<ImageRecord>> {
        self.inner.most_recent(property_id).await
    }

    async fn delete_for_property(&self, property_id: &str) -> Result<u64> {
        self.inner.delete_for_property(property_id).await
    }
}

pub const STORAGE_BASE_URL: &str = "https://storage.test/property-images";

/// Bucket kept in a map keyed by object key
#[derive(Default)]
pub struct InMemoryObjectStorage {
    pub objects: Mutex<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
    pub fail_put: bool,
    tick: AtomicUsize,
}

impl InMemoryObjectStorage {
    pub fn failing_puts() -> Self {
        Self {
            fail_put: true,
            ..Default::default()
        }
    }

    pub fn keys_for(&self, property_id: &str) -> Vec<String> {
        let prefix = object_key(property_id, "");
        self.objects
            .lock()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Seed an object with an explicit modification time offset (seconds)
    pub fn seed(&self, property_id: &str, name: &str, age_secs: i64) {
        self.objects.lock().insert(
            object_key(property_id, name),
            (b"seed".to_vec(), Utc::now() - Duration::seconds(age_secs)),
        );
    }

    pub fn read_url(&self, url: &str) -> Option<Vec<u8>> {
        let key = url.strip_prefix(STORAGE_BASE_URL)?.strip_prefix('/')?;
        self.objects.lock().get(key).map(|(data, _)| data.clone())
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn put(
        &self,
        property_id: &str,
        file_name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<StoredBlob> {
        if self.fail_put {
            bail!("bucket unavailable");
        }
        // Strictly increasing modification times
        let tick = self.tick.fetch_add(1, Ordering::SeqCst) as i64;
        let now = Utc::now() + Duration::milliseconds(tick);
        let name = generate_object_name(file_name, content_type, now);
        let path = object_key(property_id, &name);
        let size_bytes = data.len();
        self.objects.lock().insert(path.clone(), (data, now));

        Ok(StoredBlob {
            url: self.public_url(property_id, &name),
            path,
            name,
            content_type: content_type.to_string(),
            size_bytes,
        })
    }

    async fn list(&self, property_id: &str) -> Result<Vec<StoredObject>> {
        let prefix = object_key(property_id, "");
        Ok(self
            .objects
            .lock()
            .iter()
            .filter_map(|(key, (_, updated_at))| {
                key.strip_prefix(prefix.as_str()).map(|name| StoredObject {
                    name: name.to_string(),
                    updated_at: Some(*updated_at),
                })
            })
            .collect())
    }

    fn public_url(&self, property_id: &str, name: &str) -> String {
        format!("{}/{}", STORAGE_BASE_URL, object_key(property_id, name))
    }

    async fn remove(&self, property_id: &str, name: &str) -> Result<()> {
        self.objects.lock().remove(&object_key(property_id, name));
        Ok(())
    }
}

pub fn provider_image(id: i64, href: &str) -> ProviderImage {
    ProviderImage {
        id: Some(id),
        name: Some(format!("image-{id}.jpg")),
        description: None,
        file_type: Some("image/jpeg".to_string()),
        file_size: Some(2048),
        is_private: Some(false),
        href: Some(href.to_string()),
        sort_order: Some(0),
    }
}
