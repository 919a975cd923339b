//! # kb-sync core
//!
//! Runtime-free logic shared by every kb-sync frontend: data models, the
//! [`backend::IndexBackend`] and [`backend::MetadataStore`] collaborator
//! traits, the job/pointer store abstraction, in-memory implementations of
//! all of them, and the multi-slice retrieval merge.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O.

pub mod backend;
pub mod error;
pub mod merge;
pub mod models;
pub mod store;
