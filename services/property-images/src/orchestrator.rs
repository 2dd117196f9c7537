//! Fallback chain across the provider, the metadata table and object storage.
//!
//! Reads prefer the provider, then the metadata table, then the newest stored
//! blob. Uploads prefer the provider and fall back to object storage. Every
//! result is tagged with the [`ImageSource`] that produced it.

use crate::best_effort::best_effort;
use crate::error::ImageServiceError;
use crate::metadata_store::{ImageMetadataStore, ImageRecord, NewImageRecord};
use crate::object_storage::{content_type_for, ObjectStorage};
use crate::provider_client::{ImageOrder, ProviderImage, ProviderImageService, ProviderImageUpload};
use crate::resolver::{IdentifierResolver, ProviderPropertyId, ResolveError};
use crate::validation::ValidatedUpload;
use anyhow::anyhow;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

/// Backend that answered a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Provider,
    MetadataTable,
    ObjectStorage,
    None,
}

impl ImageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageSource::Provider => "provider",
            ImageSource::MetadataTable => "metadata_table",
            ImageSource::ObjectStorage => "object_storage",
            ImageSource::None => "none",
        }
    }
}

/// A result together with the backend that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub source: ImageSource,
    pub data: T,
}

impl<T> Sourced<T> {
    fn new(source: ImageSource, data: T) -> Self {
        Self { source, data }
    }
}

/// One property image as returned to callers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: Option<String>,
    pub href: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i32>,
}

impl From<ProviderImage> for ImageDescriptor {
    fn from(image: ProviderImage) -> Self {
        Self {
            id: image.id,
            name: image.name,
            href: image.href,
            description: image.description,
            file_type: image.file_type,
            file_size: image.file_size,
            sort_order: image.sort_order,
        }
    }
}

impl From<ImageRecord> for ImageDescriptor {
    fn from(record: ImageRecord) -> Self {
        Self {
            id: record.buildium_image_id,
            name: record.name,
            href: record.href,
            description: record.description,
            file_type: record.file_type,
            file_size: record.file_size,
            sort_order: record.sort_index,
        }
    }
}

impl ImageDescriptor {
    fn to_record(&self) -> NewImageRecord {
        NewImageRecord {
            buildium_image_id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            file_type: self.file_type.clone(),
            file_size: self.file_size,
            is_private: None,
            href: self.href.clone(),
            sort_index: self.sort_order,
        }
    }
}

/// Result of an upload that landed in object storage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalUpload {
    pub storage: &'static str,
    pub path: String,
    pub url: String,
    /// Metadata row, absent when recording it failed
    pub image: Option<ImageRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UploadOutcome {
    Provider(ProviderImage),
    Local(LocalUpload),
}

/// Per-property async locks; entries disappear once nobody holds them
#[derive(Default)]
pub struct PropertyLocks {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl PropertyLocks {
    fn lock_for(&self, property_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.retain(|_, weak| weak.strong_count() > 0);
        match locks.get(property_id).and_then(Weak::upgrade) {
            Some(lock) => lock,
            None => {
                let lock = Arc::new(tokio::sync::Mutex::new(()));
                locks.insert(property_id.to_string(), Arc::downgrade(&lock));
                lock
            }
        }
    }

    pub async fn acquire(&self, property_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(property_id).lock_owned().await
    }

    /// The lock if nobody holds it right now
    pub fn try_acquire(&self, property_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(property_id).try_lock_owned().ok()
    }
}

/// Serves property images from whichever backend can answer
pub struct PropertyImageService {
    resolver: IdentifierResolver,
    provider: Arc<dyn ProviderImageService>,
    metadata: Arc<dyn ImageMetadataStore>,
    storage: Option<Arc<dyn ObjectStorage>>,
    property_locks: PropertyLocks,
}

impl PropertyImageService {
    pub fn new(
        resolver: IdentifierResolver,
        provider: Arc<dyn ProviderImageService>,
        metadata: Arc<dyn ImageMetadataStore>,
        storage: Option<Arc<dyn ObjectStorage>>,
    ) -> Self {
        Self {
            resolver,
            provider,
            metadata,
            storage,
            property_locks: PropertyLocks::default(),
        }
    }

    fn storage(&self) -> Result<&dyn ObjectStorage, ImageServiceError> {
        self.storage
            .as_deref()
            .ok_or(ImageServiceError::StorageNotConfigured)
    }

    /// Provider id, or `None` for local-only mode
    async fn provider_id(&self, property_id: &str) -> Option<ProviderPropertyId> {
        match self.resolver.resolve(property_id).await {
            Ok(id) => Some(id),
            Err(ResolveError::Unmapped(_)) => {
                debug!(property_id, "No provider mapping; using local storage only");
                None
            }
            Err(e) => {
                warn!(property_id, error = %e, "Provider id lookup failed; using local storage only");
                None
            }
        }
    }

    /// List the images of a property
    #[instrument(skip(self))]
    pub async fn list_images(
        &self,
        property_id: &str,
    ) -> Result<Sourced<Vec<ImageDescriptor>>, ImageServiceError> {
        // Held from listing through write-back so no upload can replace what we saw.
        // Reads never wait: while an upload runs they answer without writing back.
        let write_back = self.property_locks.try_acquire(property_id);

        let result = match self.provider_id(property_id).await {
            Some(provider_id) => self.list_with_provider(property_id, provider_id).await?,
            None => self.newest_stored_image(property_id).await?,
        };

        metrics::counter!("property_images.read.source", "source" => result.source.as_str())
            .increment(1);

        // Warm the metadata table so the next read stops there
        if result.source != ImageSource::MetadataTable {
            if let Some(first) = result.data.first() {
                if write_back.is_some() {
                    best_effort(
                        "mirror_listing",
                        self.metadata.upsert_single(property_id, first.to_record()),
                    )
                    .await;
                } else {
                    debug!("Upload in progress; skipping listing write-back");
                }
            }
        }
        drop(write_back);

        debug!(
            source = result.source.as_str(),
            count = result.data.len(),
            "Listed property images"
        );
        Ok(result)
    }

    async fn list_with_provider(
        &self,
        property_id: &str,
        provider_id: ProviderPropertyId,
    ) -> Result<Sourced<Vec<ImageDescriptor>>, ImageServiceError> {
        match self.provider.list_images(provider_id).await {
            Ok(images) if !images.is_empty() => {
                return Ok(Sourced::new(
                    ImageSource::Provider,
                    images.into_iter().map(ImageDescriptor::from).collect(),
                ));
            }
            Ok(_) => debug!(%provider_id, "Provider has no images"),
            Err(e) => warn!(%provider_id, error = %e, "Provider image listing failed"),
        }

        match self.metadata.most_recent(property_id).await {
            Ok(Some(record)) if record.href.is_some() => {
                return Ok(Sourced::new(
                    ImageSource::MetadataTable,
                    vec![ImageDescriptor::from(record)],
                ));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %format!("{e:#}"), "Metadata table read failed"),
        }

        self.newest_stored_image(property_id).await
    }

    /// Single-element list built from the most recently updated blob
    async fn newest_stored_image(
        &self,
        property_id: &str,
    ) -> Result<Sourced<Vec<ImageDescriptor>>, ImageServiceError> {
        let storage = self.storage()?;

        let objects = match storage.list(property_id).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Object storage listing failed");
                Vec::new()
            }
        };

        // Names start with a millisecond timestamp, so they break ties chronologically
        let newest = objects.into_iter().max_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.name.cmp(&b.name))
        });

        Ok(match newest {
            Some(object) => Sourced::new(
                ImageSource::ObjectStorage,
                vec![ImageDescriptor {
                    href: Some(storage.public_url(property_id, &object.name)),
                    file_type: Some(content_type_for(&object.name).to_string()),
                    name: Some(object.name),
                    ..Default::default()
                }],
            ),
            None => Sourced::new(ImageSource::None, Vec::new()),
        })
    }

    /// Upload a new image, replacing the property's current one
    #[instrument(skip(self, upload), fields(file_name = %upload.file_name, size_bytes = upload.bytes.len()))]
    pub async fn upload_image(
        &self,
        property_id: &str,
        upload: ValidatedUpload,
    ) -> Result<Sourced<UploadOutcome>, ImageServiceError> {
        let _guard = self.property_locks.acquire(property_id).await;

        let Some(provider_id) = self.provider_id(property_id).await else {
            let local = self.store_locally(property_id, &upload).await?;
            return Ok(self.uploaded(ImageSource::ObjectStorage, UploadOutcome::Local(local)));
        };

        let request = ProviderImageUpload {
            file_name: upload.file_name.clone(),
            file_data: upload.base64.clone(),
            description: upload.description.clone(),
        };

        match self.provider.upload_image(provider_id, request).await {
            Ok(image) => {
                best_effort(
                    "mirror_upload",
                    self.metadata
                        .upsert_single(property_id, mirrored_record(&image, &upload)),
                )
                .await;

                info!(%provider_id, image_id = ?image.id, "Image uploaded to provider");
                Ok(self.uploaded(ImageSource::Provider, UploadOutcome::Provider(image)))
            }
            Err(remote) => {
                warn!(
                    %provider_id,
                    error = %remote,
                    "Provider upload failed; falling back to local storage"
                );
                match self.store_locally(property_id, &upload).await {
                    Ok(local) => {
                        Ok(self.uploaded(ImageSource::ObjectStorage, UploadOutcome::Local(local)))
                    }
                    Err(local) => Err(ImageServiceError::UploadFailed {
                        remote,
                        local: anyhow!(local),
                    }),
                }
            }
        }
    }

    fn uploaded(&self, source: ImageSource, outcome: UploadOutcome) -> Sourced<UploadOutcome> {
        metrics::counter!("property_images.upload.source", "source" => source.as_str())
            .increment(1);
        Sourced::new(source, outcome)
    }

    /// Replace the property's row and blobs with the new upload
    async fn store_locally(
        &self,
        property_id: &str,
        upload: &ValidatedUpload,
    ) -> Result<LocalUpload, ImageServiceError> {
        let storage = self.storage()?;

        best_effort(
            "clear_image_rows",
            self.metadata.delete_for_property(property_id),
        )
        .await;
        best_effort(
            "clear_stored_images",
            remove_stored_images(storage, property_id),
        )
        .await;

        let blob = storage
            .put(
                property_id,
                &upload.file_name,
                &upload.mime_type,
                upload.bytes.clone(),
            )
            .await
            .map_err(ImageServiceError::Storage)?;

        let record = NewImageRecord {
            buildium_image_id: None,
            name: Some(upload.file_name.clone()),
            description: upload.description.clone(),
            file_type: Some(upload.mime_type.clone()),
            file_size: Some(blob.size_bytes as i64),
            is_private: Some(false),
            href: Some(blob.url.clone()),
            sort_index: Some(0),
        };
        let image = best_effort(
            "record_local_image",
            self.metadata.upsert_single(property_id, record),
        )
        .await;

        info!(path = %blob.path, "Image stored locally");

        Ok(LocalUpload {
            storage: "object_storage",
            path: blob.path,
            url: blob.url,
            image,
        })
    }

    /// Reorder a property's images at the provider
    #[instrument(skip(self))]
    pub async fn reorder_images(
        &self,
        property_id: &str,
        order: ImageOrder,
    ) -> Result<Vec<ProviderImage>, ImageServiceError> {
        // Local mode holds a single image, so there is nothing to reorder there
        let provider_id = match self.resolver.resolve(property_id).await {
            Ok(id) => id,
            Err(ResolveError::Unmapped(id)) => return Err(ImageServiceError::UnmappedProperty(id)),
            Err(ResolveError::Lookup(e)) => return Err(ImageServiceError::Lookup(e)),
        };

        let images = self.provider.reorder_images(provider_id, order).await?;

        info!(%provider_id, count = images.len(), "Images reordered");
        Ok(images)
    }
}

/// Local row mirroring what the provider stored
fn mirrored_record(image: &ProviderImage, upload: &ValidatedUpload) -> NewImageRecord {
    NewImageRecord {
        buildium_image_id: image.id,
        name: image.name.clone().or_else(|| Some(upload.file_name.clone())),
        description: image
            .description
            .clone()
            .or_else(|| upload.description.clone()),
        file_type: image
            .file_type
            .clone()
            .or_else(|| Some(upload.mime_type.clone())),
        file_size: image.file_size.or(Some(upload.bytes.len() as i64)),
        is_private: image.is_private,
        href: image.href.clone(),
        sort_index: image.sort_order,
    }
}

/// Delete every blob under the property prefix, attempting all before reporting
async fn remove_stored_images(storage: &dyn ObjectStorage, property_id: &str) -> anyhow::Result<()> {
    let objects = storage.list(property_id).await?;
    let results = futures::future::join_all(
        objects
            .iter()
            .map(|object| storage.remove(property_id, &object.name)),
    )
    .await;

    let failures = results.iter().filter(|r| r.is_err()).count();
    if failures > 0 {
        return Err(anyhow!(
            "failed to remove {failures} of {} stored images",
            results.len()
        ));
    }

    if !objects.is_empty() {
        debug!(removed = objects.len(), "Removed previous stored images");
    }
    Ok(())
}
