//! Append-only record of reconciliation attempts.
//!
//! The file sink writes JSON Lines.  Each entry carries the hash of its
//! predecessor and of itself, so external tooling can tell if the log was
//! edited or truncated in the middle.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::AuditError;
use crate::types::{Outcome, ReconciliationResult, Trigger};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub trigger: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub diagnostic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    pub routes: usize,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl AuditEntry {
    fn seal(
        sequence: u64,
        cycle: u64,
        trigger: &Trigger,
        result: &ReconciliationResult,
        previous_hash: Option<String>,
    ) -> Self {
        let mut entry = AuditEntry {
            sequence,
            timestamp: result.timestamp,
            cycle,
            trigger: trigger.to_string(),
            outcome: result.outcome,
            container: result.container.clone(),
            diagnostic: result.diagnostic.clone(),
            digest: result.digest.clone(),
            routes: result.routes,
            previous_hash,
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash();
        entry
    }

    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |s: &str| {
            hasher.update(s.as_bytes());
            hasher.update([0u8]);
        };
        field(&self.sequence.to_string());
        field(&self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true));
        field(&self.cycle.to_string());
        field(&self.trigger);
        field(&self.outcome.to_string());
        field(self.container.as_deref().unwrap_or(""));
        field(&self.diagnostic);
        field(self.digest.as_deref().unwrap_or(""));
        field(&self.routes.to_string());
        field(self.previous_hash.as_deref().unwrap_or(""));
        hex::encode(hasher.finalize())
    }
}

/// Check that every entry hashes correctly and links to its predecessor.
/// Returns the index of the first broken entry.
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), usize> {
    let mut previous: Option<&str> = None;
    for (i, entry) in entries.iter().enumerate() {
        if entry.entry_hash != entry.compute_hash() {
            return Err(i);
        }
        if i > 0 && entry.previous_hash.as_deref() != previous {
            return Err(i);
        }
        previous = Some(entry.entry_hash.as_str());
    }
    Ok(())
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(
        &self,
        cycle: u64,
        trigger: &Trigger,
        result: &ReconciliationResult,
    ) -> Result<AuditEntry, AuditError>;
}

#[derive(Debug, Default)]
struct ChainHead {
    last_hash: Option<String>,
    count: u64,
}

impl ChainHead {
    fn seal(&self, cycle: u64, trigger: &Trigger, result: &ReconciliationResult) -> AuditEntry {
        AuditEntry::seal(self.count, cycle, trigger, result, self.last_hash.clone())
    }

    fn advance(&mut self, entry: &AuditEntry) {
        self.last_hash = Some(entry.entry_hash.clone());
        self.count = entry.sequence + 1;
    }
}

/// In-memory sink, used in tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    inner: Mutex<(ChainHead, Vec<AuditEntry>)>,
}

#[cfg(test)]
impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.inner.lock().await.1.clone()
    }
}

#[cfg(test)]
#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(
        &self,
        cycle: u64,
        trigger: &Trigger,
        result: &ReconciliationResult,
    ) -> Result<AuditEntry, AuditError> {
        let mut inner = self.inner.lock().await;
        let entry = inner.0.seal(cycle, trigger, result);
        inner.0.advance(&entry);
        inner.1.push(entry.clone());
        Ok(entry)
    }
}

/// JSON Lines file sink.  Appends only; resumes the chain on reopen.
pub struct FileAuditSink {
    path: PathBuf,
    head: Mutex<ChainHead>,
}

impl FileAuditSink {
    /// Open (or create) the log and pick the chain up from its last entry.
    ///
    /// A trailing line that does not parse is what an interrupted append
    /// leaves behind; it is cut off with a warning.  A broken chain is
    /// reported but does not stop the sink from opening.
    pub async fn open(path: PathBuf) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut head = ChainHead::default();
        if tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read_to_string(&path).await?;
            let parsed = parse_log(&raw)?;
            if parsed.intact < raw.len() {
                warn!(
                    "Discarding torn trailing entry in {} ({} bytes)",
                    path.display(),
                    raw.len() - parsed.intact
                );
                truncate(&path, parsed.intact).await?;
            }
            if let Err(index) = verify_chain(&parsed.entries) {
                warn!(
                    "Audit chain in {} does not verify at entry {}",
                    path.display(),
                    index
                );
            }
            if let Some(last) = parsed.entries.last() {
                head.advance(last);
                info!(
                    "Resuming audit log {} at sequence {}",
                    path.display(),
                    head.count
                );
            }
        }

        Ok(Self {
            path,
            head: Mutex::new(head),
        })
    }

    #[cfg(test)]
    pub async fn read_all(&self) -> Result<Vec<AuditEntry>, AuditError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        Ok(parse_log(&raw)?.entries)
    }
}

struct ParsedLog {
    entries: Vec<AuditEntry>,
    /// Length of the prefix made of complete, parseable lines.
    intact: usize,
}

fn parse_log(raw: &str) -> Result<ParsedLog, AuditError> {
    let mut entries = Vec::new();
    let mut intact = 0;

    for line in raw.split_inclusive('\n') {
        let next = intact + line.len();
        if !line.ends_with('\n') {
            // An append that never finished; always the last piece.
            break;
        }
        if !line.trim().is_empty() {
            match serde_json::from_str::<AuditEntry>(line.trim_end()) {
                Ok(entry) => entries.push(entry),
                Err(_) if raw[next..].trim().is_empty() => break,
                Err(e) => return Err(e.into()),
            }
        }
        intact = next;
    }

    Ok(ParsedLog { entries, intact })
}

async fn truncate(path: &Path, len: usize) -> Result<(), AuditError> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len as u64).await?;
    file.sync_all().await?;
    Ok(())
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn record(
        &self,
        cycle: u64,
        trigger: &Trigger,
        result: &ReconciliationResult,
    ) -> Result<AuditEntry, AuditError> {
        // Held across the write so entries land in chain order.
        let mut head = self.head.lock().await;
        let entry = head.seal(cycle, trigger, result);
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        head.advance(&entry);
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied() -> ReconciliationResult {
        ReconciliationResult::new(Outcome::Applied, "applied 1 route")
            .with_digest("ab12")
            .with_routes(1)
    }

    #[tokio::test]
    async fn memory_sink_chains_entries() {
        let sink = MemoryAuditSink::new();
        let first = sink.record(1, &Trigger::Startup, &applied()).await.unwrap();
        let second = sink
            .record(
                2,
                &Trigger::Resync,
                &ReconciliationResult::skipped("web", "bad label"),
            )
            .await
            .unwrap();

        assert_eq!(first.sequence, 0);
        assert_eq!(first.previous_hash, None);
        assert_eq!(second.previous_hash, Some(first.entry_hash.clone()));
        assert_eq!(second.container.as_deref(), Some("web"));
        assert_eq!(verify_chain(&sink.entries().await), Ok(()));
    }

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log/reconcile.jsonl");
        let sink = FileAuditSink::open(path.clone()).await.unwrap();

        sink.record(1, &Trigger::Startup, &applied()).await.unwrap();
        sink.record(
            2,
            &Trigger::Container {
                action: "die".into(),
                name: "web".into(),
            },
            &ReconciliationResult::new(Outcome::Rejected, "emerg: unexpected \"}\""),
        )
        .await
        .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.lines().nth(1).unwrap().contains("\"outcome\":\"rejected\""));
        assert!(raw.contains("\"trigger\":\"container die web\""));

        let entries = sink.read_all().await.unwrap();
        assert_eq!(entries[1].diagnostic, "emerg: unexpected \"}\"");
        assert_eq!(verify_chain(&entries), Ok(()));
    }

    #[tokio::test]
    async fn file_sink_resumes_chain_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reconcile.jsonl");

        {
            let sink = FileAuditSink::open(path.clone()).await.unwrap();
            sink.record(1, &Trigger::Startup, &applied()).await.unwrap();
            sink.record(2, &Trigger::Resync, &applied()).await.unwrap();
        }

        let sink = FileAuditSink::open(path.clone()).await.unwrap();
        let third = sink.record(1, &Trigger::Startup, &applied()).await.unwrap();
        assert_eq!(third.sequence, 2);

        let entries = sink.read_all().await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(verify_chain(&entries), Ok(()));
    }

    #[tokio::test]
    async fn reopen_discards_torn_trailing_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reconcile.jsonl");

        let first = {
            let sink = FileAuditSink::open(path.clone()).await.unwrap();
            sink.record(1, &Trigger::Startup, &applied()).await.unwrap()
        };
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, b"{\"sequence\":1,\"timest").unwrap();
        drop(file);

        let sink = FileAuditSink::open(path.clone()).await.unwrap();
        let second = sink.record(2, &Trigger::Resync, &applied()).await.unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(second.previous_hash, Some(first.entry_hash));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("\"timest{"));
        let entries = sink.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(verify_chain(&entries), Ok(()));
    }

    #[tokio::test]
    async fn reopen_rejects_corruption_before_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reconcile.jsonl");
        {
            let sink = FileAuditSink::open(path.clone()).await.unwrap();
            sink.record(1, &Trigger::Startup, &applied()).await.unwrap();
        }
        let raw = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, format!("not json\n{}", raw)).unwrap();

        assert!(matches!(
            FileAuditSink::open(path).await,
            Err(AuditError::Json(_))
        ));
    }

    #[test]
    fn parse_log_keeps_only_complete_lines() {
        let parsed = parse_log("").unwrap();
        assert!(parsed.entries.is_empty());
        assert_eq!(parsed.intact, 0);

        let parsed = parse_log("\n\n{\"seq").unwrap();
        assert!(parsed.entries.is_empty());
        assert_eq!(parsed.intact, 2);
    }

    #[tokio::test]
    async fn tampering_is_detected() {
        let sink = MemoryAuditSink::new();
        for cycle in 1..=3 {
            sink.record(cycle, &Trigger::Resync, &applied()).await.unwrap();
        }
        let mut entries = sink.entries().await;
        entries[1].diagnostic = "nothing to see".into();
        assert_eq!(verify_chain(&entries), Err(1));

        let mut entries = sink.entries().await;
        entries.remove(1);
        assert_eq!(verify_chain(&entries), Err(1));
    }
}
