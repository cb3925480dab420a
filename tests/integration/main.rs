//! Integration tests

mod common;
mod lifecycle_tests;
mod scrape_tests;
