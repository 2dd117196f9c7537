use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

/// The provider's own numeric id for a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderPropertyId(i64);

impl ProviderPropertyId {
    /// Accepts only strictly positive ids
    pub fn new(id: i64) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    pub fn get(self) -> i64 {
        self.0
    }

    /// Parse an id that is syntactically a positive integer (ASCII digits only)
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        raw.parse::<i64>().ok().and_then(Self::new)
    }
}

impl fmt::Display for ProviderPropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The property has no provider mapping. Callers decide whether this is fatal.
    #[error("property {0} is not mapped to a provider id")]
    Unmapped(String),

    #[error("failed to look up provider id: {0:#}")]
    Lookup(#[source] anyhow::Error),
}

/// Stored mapping from local property ids to provider ids
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PropertyDirectory: Send + Sync {
    /// Raw stored provider id for the property, if any
    async fn provider_id(&self, property_id: &str) -> Result<Option<i64>>;
}

/// `properties` table backed directory
pub struct PgPropertyDirectory {
    pool: PgPool,
}

impl PgPropertyDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PropertyDirectory for PgPropertyDirectory {
    #[instrument(skip(self))]
    async fn provider_id(&self, property_id: &str) -> Result<Option<i64>> {
        let row: Option<(Option<i64>,)> = sqlx::query_as(
            r#"
            SELECT buildium_property_id::bigint
            FROM properties
            WHERE id::text = $1
            "#,
        )
        .bind(property_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query property mapping")?;

        Ok(row.and_then(|(id,)| id))
    }
}

/// Maps local property ids to provider ids
#[derive(Clone)]
pub struct IdentifierResolver {
    directory: Arc<dyn PropertyDirectory>,
}

impl IdentifierResolver {
    pub fn new(directory: Arc<dyn PropertyDirectory>) -> Self {
        Self { directory }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, property_id: &str) -> Result<ProviderPropertyId, ResolveError> {
        // Callers may already pass provider ids
        if let Some(id) = ProviderPropertyId::parse(property_id) {
            return Ok(id);
        }

        let stored = self
            .directory
            .provider_id(property_id)
            .await
            .map_err(ResolveError::Lookup)?;

        match stored.and_then(ProviderPropertyId::new) {
            Some(id) => {
                debug!(provider_id = %id, "Resolved provider property id");
                Ok(id)
            }
            None => Err(ResolveError::Unmapped(property_id.to_string())),
        }
    }
}
