// src/services/mod.rs

//! Clients for the collaborating services.
//!
//! - Archive (`ArchiveClient`): WARC text and WARC listings
//! - Search engine (`SolrClient`): record writes, partial updates, queries
//! - Rule feed (`HttpRuleFeed`): the authoritative restriction rules
//!
//! Each client sits behind a trait so the pipeline can be driven by
//! in-memory implementations in tests.

mod archive;
mod rules;
mod search;

pub use archive::{ArchiveClient, ArchiveSource};
pub use rules::{HttpRuleFeed, RuleFeed};
pub use search::{
    IndexedHit, PartialUpdate, QueryFilter, QueryPage, START_CURSOR, SearchEngine, SearchQuery,
    SearchRecord, SolrClient, escape_query_chars,
};
