//! Pluggable batch compression.
//!
//! A batch is serialized as a whole and compressed with one of the supported
//! codecs. Compression is only kept when it pays for itself: if the compressed
//! payload is not at least 10% smaller than the original, the batch is sent
//! uncompressed instead.

use std::io::{Read, Write};
use std::str::FromStr;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{CompressionEnvelope, Metric, MetricsBatch};

/// Compressed/original size ratio at or above which compression is discarded.
pub const MAX_WORTHWHILE_RATIO: f64 = 0.9;

/// Default zstd level; favours speed on small devices.
const ZSTD_LEVEL: i32 = 3;

/// Errors raised while building, compressing or restoring a batch.
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("unsupported compression type: {0}")]
    Unsupported(String),

    #[error("compression I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize batch: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("decompressed size {actual} does not match original size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Supported compression codecs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl CompressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Zstd => "zstd",
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionType {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(CompressionType::None),
            "gzip" => Ok(CompressionType::Gzip),
            "zstd" => Ok(CompressionType::Zstd),
            other => Err(CompressionError::Unsupported(other.to_string())),
        }
    }
}

/// Uniform compress/decompress contract.
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    fn codec(&self) -> CompressionType;

    fn codec_name(&self) -> &'static str {
        self.codec().as_str()
    }
}

/// Identity codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }

    fn codec(&self) -> CompressionType {
        CompressionType::None
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: flate2::Compression,
}

impl GzipCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            level: flate2::Compression::new(level.min(9)),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self {
            level: flate2::Compression::default(),
        }
    }
}

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::with_capacity(data.len() * 4);
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }

    fn codec(&self) -> CompressionType {
        CompressionType::Gzip
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(ZSTD_LEVEL)
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(zstd::encode_all(data, self.level)?)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(zstd::decode_all(data)?)
    }

    fn codec(&self) -> CompressionType {
        CompressionType::Zstd
    }
}

/// Codec instance for a known compression type.
pub fn compressor_for(codec: CompressionType) -> Box<dyn Compressor> {
    match codec {
        CompressionType::None => Box::new(NoopCompressor),
        CompressionType::Gzip => Box::new(GzipCompressor::default()),
        CompressionType::Zstd => Box::new(ZstdCompressor::default()),
    }
}

/// Codec instance by name. Unknown names fail fast.
pub fn new_compressor(name: &str) -> Result<Box<dyn Compressor>, CompressionError> {
    Ok(compressor_for(name.parse()?))
}

/// A batch ready for the wire, plus the sizes needed for accounting.
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub batch: MetricsBatch,

    /// Size of the serialized record list before compression
    pub original_size: usize,

    /// Size of the payload that actually leaves the device
    pub wire_size: usize,
}

impl EncodedBatch {
    pub fn is_compressed(&self) -> bool {
        matches!(self.batch, MetricsBatch::Compressed(_))
    }

    /// Compressed/original size ratio; 1.0 for an uncompressed batch.
    pub fn ratio(&self) -> f64 {
        if self.original_size == 0 {
            return 1.0;
        }
        self.wire_size as f64 / self.original_size as f64
    }
}

/// Build a batch from records, compressing it when the codec earns its keep.
///
/// With `None` or the identity codec the records are carried directly.
pub fn encode_batch(
    metrics: Vec<Metric>,
    compressor: Option<&dyn Compressor>,
) -> Result<EncodedBatch, CompressionError> {
    let data = serde_json::to_vec(&metrics)?;
    let original_size = data.len();

    let compressor = match compressor {
        Some(c) if c.codec() != CompressionType::None => c,
        _ => return Ok(plain(metrics, original_size)),
    };

    let compressed = compressor.compress(&data)?;
    if original_size == 0 || compressed.len() as f64 / original_size as f64 >= MAX_WORTHWHILE_RATIO {
        return Ok(plain(metrics, original_size));
    }

    let wire_size = compressed.len();
    Ok(EncodedBatch {
        batch: MetricsBatch::Compressed(CompressionEnvelope {
            codec: compressor.codec(),
            data: compressed,
            original_size: original_size as u64,
        }),
        original_size,
        wire_size,
    })
}

fn plain(metrics: Vec<Metric>, original_size: usize) -> EncodedBatch {
    EncodedBatch {
        batch: MetricsBatch::Plain { metrics },
        original_size,
        wire_size: original_size,
    }
}

/// Restore the record list carried by a batch.
pub fn decode_batch(batch: &MetricsBatch) -> Result<Vec<Metric>, CompressionError> {
    match batch {
        MetricsBatch::Plain { metrics } => Ok(metrics.clone()),
        MetricsBatch::Compressed(envelope) => {
            let data = compressor_for(envelope.codec).decompress(&envelope.data)?;
            if data.len() as u64 != envelope.original_size {
                return Err(CompressionError::SizeMismatch {
                    expected: envelope.original_size,
                    actual: data.len() as u64,
                });
            }
            Ok(serde_json::from_slice(&data)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn repetitive_metrics(count: usize) -> Vec<Metric> {
        (0..count)
            .map(|i| {
                let mut labels = HashMap::new();
                labels.insert("interface".to_string(), "eth0".to_string());
                Metric::new("network_rx_bytes", 1024.0)
                    .with_id(i as i64 + 1)
                    .with_labels(labels)
            })
            .collect()
    }

    #[test]
    fn test_codec_parsing() {
        assert_eq!("gzip".parse::<CompressionType>().unwrap(), CompressionType::Gzip);
        assert_eq!("ZSTD".parse::<CompressionType>().unwrap(), CompressionType::Zstd);
        assert_eq!("".parse::<CompressionType>().unwrap(), CompressionType::None);

        let err = "lz77".parse::<CompressionType>().unwrap_err();
        assert!(matches!(err, CompressionError::Unsupported(ref name) if name == "lz77"));
    }

    #[test]
    fn test_new_compressor_fails_fast_on_unknown_codec() {
        assert!(new_compressor("brotli").is_err());
        assert_eq!(new_compressor("zstd").unwrap().codec_name(), "zstd");
    }

    #[test]
    fn test_noop_is_identity() {
        let data = b"hello edge";
        let c = NoopCompressor;
        assert_eq!(c.compress(data).unwrap(), data);
        assert_eq!(c.decompress(data).unwrap(), data);
    }

    #[test]
    fn test_gzip_and_zstd_restore_input() {
        let data = "cpu_usage=42;".repeat(200).into_bytes();
        for codec in [CompressionType::Gzip, CompressionType::Zstd] {
            let c = compressor_for(codec);
            let packed = c.compress(&data).unwrap();
            assert!(packed.len() < data.len());
            assert_eq!(c.decompress(&packed).unwrap(), data);
        }
    }

    #[test]
    fn test_compressible_batch_carries_only_envelope() {
        let metrics = repetitive_metrics(50);
        let zstd = ZstdCompressor::default();
        let encoded = encode_batch(metrics.clone(), Some(&zstd)).unwrap();

        assert!(encoded.is_compressed());
        assert!(encoded.ratio() < MAX_WORTHWHILE_RATIO);
        match &encoded.batch {
            MetricsBatch::Compressed(env) => {
                assert_eq!(env.codec, CompressionType::Zstd);
                assert_eq!(env.original_size as usize, encoded.original_size);
            }
            MetricsBatch::Plain { .. } => panic!("expected compressed batch"),
        }

        assert_eq!(decode_batch(&encoded.batch).unwrap(), metrics);
    }

    #[test]
    fn test_incompressible_batch_is_sent_plain() {
        // A single tiny record cannot shrink by 10% under gzip's header overhead
        let metrics = vec![Metric::new("x", 1.0).with_id(1)];
        let gzip = GzipCompressor::default();
        let encoded = encode_batch(metrics.clone(), Some(&gzip)).unwrap();

        assert!(!encoded.is_compressed());
        assert_eq!(encoded.wire_size, encoded.original_size);
        assert_eq!(encoded.batch, MetricsBatch::Plain { metrics });
    }

    #[test]
    fn test_disabled_compression_keeps_records() {
        let metrics = repetitive_metrics(10);
        let encoded = encode_batch(metrics.clone(), None).unwrap();
        assert!(!encoded.is_compressed());
        assert_eq!(encoded.ratio(), 1.0);
        assert_eq!(decode_batch(&encoded.batch).unwrap(), metrics);
    }

    #[test]
    fn test_corrupt_envelope_is_hard_error() {
        let batch = MetricsBatch::Compressed(CompressionEnvelope {
            codec: CompressionType::Gzip,
            data: vec![0x1f, 0x8b, 0x00, 0x01, 0x02],
            original_size: 100,
        });
        assert!(decode_batch(&batch).is_err());
    }

    #[test]
    fn test_size_mismatch_is_detected() {
        let data = serde_json::to_vec(&repetitive_metrics(20)).unwrap();
        let packed = ZstdCompressor::default().compress(&data).unwrap();
        let batch = MetricsBatch::Compressed(CompressionEnvelope {
            codec: CompressionType::Zstd,
            data: packed,
            original_size: data.len() as u64 + 1,
        });
        assert!(matches!(
            decode_batch(&batch),
            Err(CompressionError::SizeMismatch { .. })
        ));
    }
}
