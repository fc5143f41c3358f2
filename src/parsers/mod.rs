//! Parsers for vendor metadata formats

pub mod feed;
pub mod oval_stream;
pub mod repo_cpe_map;
