//! Test results returned by a completed job.
//!
//! Jobs return a gzip-compressed JSON document:
//!
//! ```json
//! {
//!   "cases": [
//!     { "name": "tast.audio.Microphone", "verdict": "PASS" },
//!     { "name": "tast.audio.Speaker", "verdict": "FAIL", "summary": "no signal" }
//!   ]
//! }
//! ```
//!
//! Verdicts are kept as raw strings here; classification happens at retry
//! time so an unknown verdict becomes a per-shard error, not a decode
//! failure.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

/// Maximum decompressed result size (100 MB).
pub const MAX_DECOMPRESSED_SIZE: usize = 100 * 1024 * 1024;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Per-test outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    pub name: String,

    /// Raw verdict, e.g. `PASS` or `FAIL`.
    pub verdict: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl CaseResult {
    pub fn new(name: impl Into<String>, verdict: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            verdict: verdict.into(),
            summary: None,
        }
    }
}

/// All test outcomes of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunResult {
    #[serde(default)]
    pub cases: Vec<CaseResult>,
}

/// Errors decoding job output.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("gzip: {0}")]
    Gzip(#[source] std::io::Error),

    #[error("result exceeds {0} bytes when decompressed")]
    TooLarge(usize),

    #[error("invalid result JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decodes job output: gzip (bounded) then JSON.
///
/// Uncompressed JSON is accepted as well, for services that do not
/// compress.
pub fn decode_test_result(data: &[u8]) -> Result<TestRunResult, DecodeError> {
    let json = if data.starts_with(&GZIP_MAGIC) {
        decompress(data)?
    } else {
        data.to_vec()
    };

    Ok(serde_json::from_slice(&json)?)
}

/// Encodes a result the way jobs return it.
pub fn encode_test_result(result: &TestRunResult) -> std::io::Result<Vec<u8>> {
    let json = serde_json::to_vec(result)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    encoder.finish()
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = decoder
            .read(&mut buffer)
            .map_err(DecodeError::Gzip)?;
        if bytes_read == 0 {
            break;
        }
        if decompressed.len() + bytes_read > MAX_DECOMPRESSED_SIZE {
            return Err(DecodeError::TooLarge(MAX_DECOMPRESSED_SIZE));
        }
        decompressed.extend_from_slice(&buffer[..bytes_read]);
    }

    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_gzip() {
        let result = TestRunResult {
            cases: vec![CaseResult::new("tast.a", "PASS"), CaseResult::new("tast.b", "FAIL")],
        };
        let bytes = encode_test_result(&result).unwrap();
        assert!(bytes.starts_with(&GZIP_MAGIC));

        assert_eq!(decode_test_result(&bytes).unwrap(), result);
    }

    #[test]
    fn test_decode_plain_json() {
        let decoded =
            decode_test_result(br#"{"cases":[{"name":"tast.a","verdict":"WEIRD"}]}"#).unwrap();
        assert_eq!(decoded.cases[0].verdict, "WEIRD");
        assert!(decoded.cases[0].summary.is_none());
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode_test_result(b"not json"),
            Err(DecodeError::Json(_))
        ));
        // Valid magic, truncated stream.
        assert!(matches!(
            decode_test_result(&[0x1f, 0x8b, 0x08]),
            Err(DecodeError::Gzip(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_output() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&vec![b' '; MAX_DECOMPRESSED_SIZE + 1]).unwrap();
        let bomb = encoder.finish().unwrap();

        let err = decode_test_result(&bomb).unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge(MAX_DECOMPRESSED_SIZE)));
        assert!(err.to_string().contains("exceeds"));
    }
}
