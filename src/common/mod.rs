//! Common utilities and types

pub mod cache_file;
pub mod error;
pub mod metadata;
pub mod singleflight;

pub use cache_file::CacheFile;
pub use error::{Error, Result};
pub use metadata::{DnsMode, Metadata, Network, SourceType};
pub use singleflight::SingleFlight;
