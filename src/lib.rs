// src/lib.rs

//! WARC full-text indexer library

pub mod error;
pub mod models;
pub mod pipeline;
pub mod restrictions;
pub mod services;
pub mod storage;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;
