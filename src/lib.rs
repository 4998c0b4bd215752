// ABOUTME: Library root for listing-replicator
// ABOUTME: Exposes the incremental sync engine and its collaborator seams

pub mod cursor;
pub mod engine;
pub mod entity;
pub mod error;
pub mod feed;
pub mod mapper;
pub mod referential;
pub mod schema;
pub mod store;

pub use engine::{EngineConfig, SyncEngine};
pub use entity::EntityType;
