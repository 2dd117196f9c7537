use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Last-known image reference for a property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ImageRecord {
    pub id: Uuid,
    pub property_id: String,
    /// Image id assigned by the provider, when the image lives there
    pub buildium_image_id: Option<i64>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub file_type: Option<String>,
    pub file_size: Option<i64>,
    pub is_private: Option<bool>,
    pub href: Option<String>,
    pub sort_index: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields written by [`ImageMetadataStore::upsert_single`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewImageRecord {
    pub buildium_image_id: Option<i64>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub file_type: Option<String>,
    pub file_size: Option<i64>,
    pub is_private: Option<bool>,
    pub href: Option<String>,
    pub sort_index: Option<i32>,
}

/// One-row-per-property image metadata table
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageMetadataStore: Send + Sync {
    /// Replace whatever row the property has with `record`
    async fn upsert_single(&self, property_id: &str, record: NewImageRecord)
        -> Result<ImageRecord>;

    /// Newest row for the property
    async fn most_recent(&self, property_id: &str) -> Result<Option<ImageRecord>>;

    /// Remove every row for the property, returning how many were deleted
    async fn delete_for_property(&self, property_id: &str) -> Result<u64>;
}

/// Metadata store for property images in PostgreSQL
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    /// Create a new metadata store with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks and the property directory)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ImageMetadataStore for MetadataStore {
    #[instrument(skip(self, record))]
    async fn upsert_single(
        &self,
        property_id: &str,
        record: NewImageRecord,
    ) -> Result<ImageRecord> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        // Serializes writers for the same property across processes
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(property_id)
            .execute(&mut *tx)
            .await
            .context("Failed to lock property images")?;

        let deleted = sqlx::query("DELETE FROM property_images WHERE property_id = $1")
            .bind(property_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete previous image rows")?
            .rows_affected();

        let row = sqlx::query_as::<_, ImageRecord>(
            r#"
            INSERT INTO property_images (
                id, property_id, buildium_image_id, name, description,
                file_type, file_size, is_private, href, sort_index,
                created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10,
                NOW(), NOW()
            )
            RETURNING id, property_id, buildium_image_id, name, description,
                      file_type, file_size, is_private, href, sort_index,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(property_id)
        .bind(record.buildium_image_id)
        .bind(&record.name)
        .bind(&record.description)
        .bind(&record.file_type)
        .bind(record.file_size)
        .bind(record.is_private)
        .bind(&record.href)
        .bind(record.sort_index)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to insert image row")?;

        tx.commit().await.context("Failed to commit transaction")?;

        debug!(image_id = %row.id, replaced = deleted, "Image row stored");
        Ok(row)
    }

    async fn most_recent(&self, property_id: &str) -> Result<Option<ImageRecord>> {
        let row = sqlx::query_as::<_, ImageRecord>(
            r#"
            SELECT id, property_id, buildium_image_id, name, description,
                   file_type, file_size, is_private, href, sort_index,
                   created_at, updated_at
            FROM property_images
            WHERE property_id = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(property_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query image row")?;

        Ok(row)
    }

    #[instrument(skip(self))]
    async fn delete_for_property(&self, property_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM property_images WHERE property_id = $1")
            .bind(property_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete image rows")?;

        Ok(result.rows_affected())
    }
}
