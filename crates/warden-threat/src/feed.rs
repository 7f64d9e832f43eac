//! Threat Feed Ingestion (JSON Lines)
//!
//! The feed-sync collaborator delivers raw indicator tuples on its own
//! schedule; this module only parses them. One JSON object per line,
//! blank lines and `#` comments skipped, malformed lines dropped with a
//! warning rather than failing the whole batch.

use crate::indicator::{IndicatorType, Severity};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read};
use thiserror::Error;
use tracing::{info, warn};

/// Errors during feed loading
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Empty feed")]
    Empty,
}

/// One raw indicator tuple as delivered by the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub indicator: String,
    pub indicator_type: IndicatorType,
    pub threat_type: String,
    pub severity: Severity,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: u8,
}

fn default_confidence() -> u8 {
    50
}

/// Parse a feed from a reader.
pub fn load_feed<R: Read>(reader: R) -> Result<Vec<FeedRecord>, FeedError> {
    let buf_reader = BufReader::new(reader);
    let mut records = Vec::new();
    let mut skipped = 0usize;

    for line in buf_reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        match serde_json::from_str::<FeedRecord>(trimmed) {
            Ok(record) => records.push(record),
            Err(e) => {
                skipped += 1;
                warn!("Skipping malformed feed line: {}", e);
            }
        }
    }

    if records.is_empty() {
        return Err(FeedError::Empty);
    }

    info!(
        "Loaded threat feed: {} records, {} malformed lines skipped",
        records.len(),
        skipped
    );

    Ok(records)
}
