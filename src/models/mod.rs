//! Core data models for the tender document store.
//!
//! These types describe objects in the bucket, the plans used to move them,
//! and the JSON index document that catalogs tender groups. The index types
//! serialize with `serde` in exactly the layout stored at
//! `bucket_metadata.json`.

pub mod index;
pub mod object;
pub mod transfer;
