//! Append-only run journal with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL), one file per run
//! under `{journal_dir}/{process_id}/events.jsonl`, for easy inspection.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::domain::{Event, EventType, ProcessId};

const EVENTS_FILE: &str = "events.jsonl";

/// File-based event store using JSONL format
pub struct EventStore {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,
}

impl EventStore {
    /// Create or open the journal of one run
    pub async fn open(base_dir: &Path, process_id: &ProcessId) -> Result<Self> {
        let run_dir = base_dir.join(process_id.as_str());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let events_path = run_dir.join(EVENTS_FILE);

        Ok(Self {
            run_dir,
            events_path,
        })
    }

    /// Open an existing journal without creating anything
    pub fn existing(base_dir: &Path, process_id: &ProcessId) -> Option<Self> {
        let run_dir = base_dir.join(process_id.as_str());
        let events_path = run_dir.join(EVENTS_FILE);
        events_path.exists().then_some(Self {
            run_dir,
            events_path,
        })
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// The event that closed the run, if it has finished
    pub async fn terminal_event(&self) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(Event::is_terminal))
    }

    /// List all journaled process ids, sorted
    pub async fn list_runs(base_dir: &Path) -> Result<Vec<ProcessId>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(base_dir)
            .await
            .with_context(|| format!("Failed to read journal directory: {}", base_dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() && entry.path().join(EVENTS_FILE).exists() {
                if let Some(name) = entry.file_name().to_str() {
                    runs.push(ProcessId::external(name));
                }
            }
        }

        runs.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(runs)
    }
}

/// Generate an idempotency key for one tool invocation.
///
/// Retries of the same invocation reuse the same arguments and therefore
/// the same key.
pub fn generate_idempotency_key(process_id: &ProcessId, tool: &str, args: &str) -> String {
    format!("{}:{}:{}", process_id, tool, hash_input(args))
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
