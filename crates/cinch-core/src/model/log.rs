use serde::{Deserialize, Serialize};

use super::job::JobId;

/// Upper bound on a single log chunk. Workers are expected to flush well
/// below this; oversized chunks are truncated at publication.
pub const MAX_CHUNK_BYTES: usize = 64 * 1024;

/// Which output stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// One chunk of build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    /// Job the chunk belongs to.
    pub job_id: JobId,
    /// Execution attempt the chunk was produced by. Chunks from a lost
    /// attempt stay readable under that attempt after re-queue.
    pub attempt: i32,
    /// Output stream.
    pub stream: LogStream,
    /// Monotonic timestamp in milliseconds since job start.
    pub ts_ms: i64,
    /// Chunk payload.
    pub data: String,
}

impl LogChunk {
    /// Truncate the payload to the chunk bound, on a char boundary.
    pub fn bounded(mut self) -> Self {
        if self.data.len() > MAX_CHUNK_BYTES {
            let mut cut = MAX_CHUNK_BYTES;
            while !self.data.is_char_boundary(cut) {
                cut -= 1;
            }
            self.data.truncate(cut);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_roundtrip() {
        assert_eq!(LogStream::parse("stdout"), Some(LogStream::Stdout));
        assert_eq!(LogStream::parse("stderr"), Some(LogStream::Stderr));
        assert_eq!(LogStream::parse("combined"), None);
    }

    #[test]
    fn test_small_chunk_untouched() {
        let chunk = LogChunk {
            job_id: JobId::new(),
            attempt: 1,
            stream: LogStream::Stdout,
            ts_ms: 0,
            data: "hi".to_string(),
        };
        assert_eq!(chunk.clone().bounded().data, chunk.data);
    }

    #[test]
    fn test_oversized_chunk_truncated() {
        let chunk = LogChunk {
            job_id: JobId::new(),
            attempt: 1,
            stream: LogStream::Stderr,
            ts_ms: 0,
            data: "x".repeat(MAX_CHUNK_BYTES + 10),
        };
        assert_eq!(chunk.bounded().data.len(), MAX_CHUNK_BYTES);
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        // Fill so a multi-byte char straddles the bound.
        let mut data = "a".repeat(MAX_CHUNK_BYTES - 1);
        data.push('é'); // two bytes, crosses MAX_CHUNK_BYTES
        let chunk = LogChunk {
            job_id: JobId::new(),
            attempt: 1,
            stream: LogStream::Stdout,
            ts_ms: 0,
            data,
        };
        let bounded = chunk.bounded();
        assert!(bounded.data.len() <= MAX_CHUNK_BYTES);
        assert!(bounded.data.is_char_boundary(bounded.data.len()));
    }
}
