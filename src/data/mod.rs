//! Signal processing and storage modules.

pub mod rss;
pub mod storage;
