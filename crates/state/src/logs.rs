//! gzip + base64 packaging of captured service log tails.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use time::OffsetDateTime;

use crate::error::StateError;
use crate::types::CompressedLog;

pub fn compress_log(service_id: &str, content: &str) -> Result<CompressedLog, StateError> {
    let context = || format!("compressing log for {}", service_id);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(content.as_bytes())
        .map_err(|e| StateError::io(context(), e))?;
    let compressed = encoder.finish().map_err(|e| StateError::io(context(), e))?;

    Ok(CompressedLog {
        service_id: service_id.to_string(),
        content: STANDARD.encode(&compressed),
        original_lines: content.lines().count(),
        compressed_size: compressed.len(),
        captured_at: OffsetDateTime::now_utc(),
    })
}

pub fn decompress_log(log: &CompressedLog) -> Result<String, StateError> {
    let corrupt = |message: String| StateError::CorruptState {
        scenario: String::new(),
        message: format!("log {}: {}", log.service_id, message),
    };
    let compressed = STANDARD
        .decode(log.content.as_bytes())
        .map_err(|e| corrupt(format!("invalid base64: {}", e)))?;
    let mut content = String::new();
    GzDecoder::new(&compressed[..])
        .read_to_string(&mut content)
        .map_err(|e| corrupt(format!("invalid gzip stream: {}", e)))?;
    Ok(content)
}
