//! Property Images Service
//!
//! Serves and accepts property photos for the property management UI. Images
//! live at the Buildium provider when a property is linked to it; otherwise, or
//! whenever the provider misbehaves, they fall back to a local metadata table
//! and an object storage bucket.
//!
//! ## Features
//!
//! - **Fallback Reads**: provider listing, then the most recent metadata row,
//!   then the newest stored blob, then an empty list
//! - **Fallback Uploads**: provider upload, then a local blob plus metadata row
//!   that replace the property's previous image
//! - **Provider Reordering**: display order changes for linked properties
//! - **Source Tagging**: every response names the backend that answered
//!
//! ## Architecture
//!
//! ```text
//!   HTTP request
//!        │
//!        ▼
//! ┌──────────────┐   ┌──────────────┐
//! │ Rate Limit   │──▶│ Session      │
//! └──────────────┘   └──────────────┘
//!                           │
//!                           ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Identifier   │◀──│ Fallback     │──▶│ Buildium     │
//! │ Resolver     │   │ Orchestrator │   │ Provider     │
//! └──────────────┘   └──────────────┘   └──────────────┘
//!                      │         │
//!                      ▼         ▼
//!            ┌──────────────┐ ┌──────────────┐
//!            │ PostgreSQL   │ │ S3 Bucket    │
//!            │ property_    │ │ {property}/  │
//!            │ images       │ │   {blob}     │
//!            └──────────────┘ └──────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod best_effort;
pub mod config;
pub mod error;
pub mod metadata_store;
pub mod object_storage;
pub mod orchestrator;
pub mod provider_client;
pub mod rate_limit;
pub mod resolver;
pub mod validation;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{ApiError, ImageServiceError};
pub use orchestrator::{ImageDescriptor, ImageSource, PropertyImageService, Sourced, UploadOutcome};
