//! Core domain types for the clipper pipeline.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ClipError, Result};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Row id of a transcript segment.
pub type SegmentId = i64;

/// Blake3 hash of a file's raw bytes. Identity of a stored File.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint an in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Fingerprint a file, streaming it in 64 KiB reads.
    pub fn of_file(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    /// Parse a lowercase or uppercase hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| ClipError::invalid_input(format!("bad fingerprint '{}': {}", s, e)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ClipError::invalid_input(format!("bad fingerprint length: {}", s)))?;
        Ok(Self(arr))
    }

    /// Lowercase hex encoding, as stored in the database.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for labels.
    pub fn short(&self) -> String {
        let mut s = self.to_hex();
        s.truncate(12);
        s
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_hex().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Canonical identity of an unordered segment pair: smaller id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    a: SegmentId,
    b: SegmentId,
}

impl PairKey {
    /// Canonicalize two segment ids. Returns `None` for a segment paired with itself.
    pub fn new(x: SegmentId, y: SegmentId) -> Option<Self> {
        match x.cmp(&y) {
            std::cmp::Ordering::Less => Some(Self { a: x, b: y }),
            std::cmp::Ordering::Greater => Some(Self { a: y, b: x }),
            std::cmp::Ordering::Equal => None,
        }
    }

    pub fn a(&self) -> SegmentId {
        self.a
    }

    pub fn b(&self) -> SegmentId {
        self.b
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.a, self.b)
    }
}

/// Pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Transcribe,
    Embed,
    Detect,
    Compile,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::Fetch,
        Stage::Transcribe,
        Stage::Embed,
        Stage::Detect,
        Stage::Compile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Transcribe => "transcribe",
            Self::Embed => "embed",
            Self::Detect => "detect",
            Self::Compile => "compile",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = ClipError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "fetch" => Ok(Self::Fetch),
            "transcribe" => Ok(Self::Transcribe),
            "embed" => Ok(Self::Embed),
            "detect" => Ok(Self::Detect),
            "compile" => Ok(Self::Compile),
            other => Err(ClipError::invalid_input(format!("unknown stage: {}", other))),
        }
    }
}

/// A registered input URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHandle {
    pub id: i64,

    /// Canonicalized URL (unique).
    pub canonical_url: String,

    /// Linked File once fetched.
    pub file: Option<Fingerprint>,

    /// First sighting (Unix millis).
    pub discovered_at: u64,
}

/// A stored, deduplicated media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHandle {
    pub fingerprint: Fingerprint,
    pub size_bytes: u64,
    pub stored_path: PathBuf,

    /// Identifier reported by the fetcher (e.g. platform video id).
    pub media_id: Option<String>,

    pub first_seen_at: u64,
}

impl FileHandle {
    /// Human-readable label: media id if known, else the short fingerprint.
    pub fn label(&self) -> String {
        self.media_id
            .clone()
            .unwrap_or_else(|| self.fingerprint.short())
    }
}

/// Result of a Content Ledger commit.
#[derive(Debug, Clone, PartialEq)]
pub struct FileCommit {
    pub handle: FileHandle,

    /// False when the fingerprint was already known and the caller's copy was discarded.
    pub created: bool,
}

/// One timestamped piece of text produced by the transcription collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDraft {
    /// Start time in seconds.
    pub start_ts: f64,

    /// End time in seconds.
    pub end_ts: f64,

    pub text: String,
}

/// A persisted transcript segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub file: Fingerprint,
    pub sequence_index: u32,
    pub start_ts: f64,
    pub end_ts: f64,
    pub text: String,
}

/// A stored contradiction score for one cross-File pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContradictionRecord {
    pub pair: PairKey,
    pub score: f32,
    pub detected_at: u64,
}

/// One side of a contradiction, joined with its segment and file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContradictionSide {
    pub segment: Segment,
    pub file: FileHandle,
}

/// A contradiction record with both sides resolved, for compilation and summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContradictionDetail {
    pub record: ContradictionRecord,
    pub a: ContradictionSide,
    pub b: ContradictionSide,
}

/// The smallest addressable piece of pending work for a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkUnit {
    /// Download a registered source.
    Fetch { source_id: i64, url: String },

    /// Transcribe one stored file.
    Transcribe {
        fingerprint: Fingerprint,
        path: PathBuf,
    },

    /// Embed one segment.
    Embed { segment_id: SegmentId, text: String },

    /// Score one cross-File segment pair.
    Detect {
        pair: PairKey,
        text_a: String,
        text_b: String,
    },
}

impl WorkUnit {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Fetch { .. } => Stage::Fetch,
            Self::Transcribe { .. } => Stage::Transcribe,
            Self::Embed { .. } => Stage::Embed,
            Self::Detect { .. } => Stage::Detect,
        }
    }

    /// Stable identity used for claims and reports.
    pub fn key(&self) -> String {
        match self {
            Self::Fetch { url, .. } => format!("fetch:{}", url),
            Self::Transcribe { fingerprint, .. } => format!("transcribe:{}", fingerprint),
            Self::Embed { segment_id, .. } => format!("embed:{}", segment_id),
            Self::Detect { pair, .. } => format!("detect:{}", pair),
        }
    }
}

/// How a unit's result landed in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// New rows were written.
    Created,
    /// The unique key already existed; our result was discarded.
    Duplicate,
}

/// What a fetcher leaves behind in the staging directory.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedMedia {
    pub path: PathBuf,
    pub media_id: Option<String>,
}

/// One clip cut from a stored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipSpec {
    pub source: PathBuf,
    pub start_ts: f64,
    pub end_ts: f64,

    /// Position of the owning contradiction in the selection (0-based).
    pub rank: usize,
}

/// Ordered list of clips handed to the compilation collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MontagePlan {
    pub clips: Vec<ClipSpec>,
    pub output: PathBuf,
}

/// Row counts across the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub schema_version: u32,
    pub sources: u64,
    pub unfetched_sources: u64,
    pub files: u64,
    pub transcribed_files: u64,
    pub segments: u64,
    pub embeddings: u64,
    pub contradictions: u64,
    pub settled_file_pairs: u64,
    pub storage_bytes: u64,
}
