//! Crawl configuration types and builder.

pub mod builder;
pub mod types;

pub use builder::CrawlConfigBuilder;
pub use types::CrawlConfig;
