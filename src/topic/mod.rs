//! Topic names and filters
//!
//! Validation of configured topics and wildcard matching of received topic
//! names against subscription filters.

mod validation;

pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};
