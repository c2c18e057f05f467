//! Storage services: the retrying bucket client and the layers built on it.

pub mod content_type;
pub mod group_manager;
pub mod metadata_index;
pub mod retry;
pub mod storage_client;
pub mod transfer_planner;
