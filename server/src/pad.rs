//! Shared text pad
//!
//! A short, in-memory history of text snippets passed between devices on the
//! LAN. Nothing is persisted; the history lives as long as the process.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

pub const MAX_TEXT_CHARS: usize = 8000;
pub const MAX_ENTRIES: usize = 500;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PadEntry {
    pub timestamp: DateTime<Local>,
    pub text: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PadError {
    #[error("text is required.")]
    Empty,
    #[error("text is too long.")]
    TooLong,
}

#[derive(Clone)]
pub struct TextPad {
    history: Arc<RwLock<VecDeque<PadEntry>>>,
    capacity: usize,
}

impl Default for TextPad {
    fn default() -> Self {
        Self::with_capacity(MAX_ENTRIES)
    }
}

impl TextPad {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut history = VecDeque::new();
        history.push_back(PadEntry {
            timestamp: Local::now(),
            text: "Started".to_string(),
        });
        Self {
            history: Arc::new(RwLock::new(history)),
            capacity: capacity.max(1),
        }
    }

    /// Oldest first.
    pub async fn entries(&self) -> Vec<PadEntry> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn add(&self, text: &str) -> Result<PadEntry, PadError> {
        if text.trim().is_empty() {
            return Err(PadError::Empty);
        }
        if text.chars().count() > MAX_TEXT_CHARS {
            return Err(PadError::TooLong);
        }

        let entry = PadEntry {
            timestamp: Local::now(),
            text: text.to_string(),
        };

        let mut history = self.history.write().await;
        history.push_back(entry.clone());
        while history.len() > self.capacity {
            history.pop_front();
        }
        tracing::info!(chars = text.chars().count(), "text saved");
        Ok(entry)
    }
}
