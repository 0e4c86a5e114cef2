//! Clinical-trial and literature aggregation pipeline: one query fans out to
//! heterogeneous registries, results normalize into a single canonical record
//! shape, cross-source duplicates collapse into merged records, and an
//! optional AI relevance stage scores what survives before tabular export.

pub mod app;
pub mod classify;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod export;
pub mod normalize;
pub mod output;
pub mod registry;

pub mod ctgov;
pub mod euctis;
pub mod europepmc;
pub mod pubmed;
