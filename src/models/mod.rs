//! Core data models for the transfer pipeline.
//!
//! `location` and `metadata` describe a single transfer; `bucket` and
//! `object` map onto the tables of the local project store via
//! `sqlx::FromRow`.

pub mod bucket;
pub mod location;
pub mod metadata;
pub mod object;
