//! Stream metadata, carried as the payload of the leading META frame.

use serde::{Deserialize, Serialize};

use crate::FormatError;

/// Container format revision written into new streams.
pub const STREAM_VERSION: u32 = 2;

/// Description of one stream file.
///
/// Serialized as JSON with camelCase keys. Unknown keys are ignored on
/// read so newer writers stay compatible; all fields below are mandatory
/// on write except the compression parameters, which are omitted for
/// uncompressed streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMetadata {
    /// Size of the source disk in bytes.
    pub virtual_size: u64,
    /// Sum of all DATA region lengths (uncompressed).
    pub data_size: u64,
    /// ISO-8601 timestamp of the backup run.
    pub date: String,
    /// Disk target name, e.g. `vda`.
    pub disk_name: String,
    /// Image format of the source disk, e.g. `qcow2` or `raw`.
    pub disk_format: String,
    /// Checkpoint created by this backup, empty for copy mode.
    pub checkpoint_name: String,
    /// Checkpoint this stream is a delta against, empty for full/copy.
    pub parent_checkpoint: String,
    /// True for inc and diff streams.
    pub incremental: bool,
    pub stream_version: u32,
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_level: Option<i32>,
}

impl StreamMetadata {
    /// Serialize to the canonical JSON byte string stored in the META
    /// frame. Key order is fixed by the field order above.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a META frame payload.
    pub fn from_bytes(data: &[u8]) -> Result<Self, FormatError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> StreamMetadata {
        StreamMetadata {
            virtual_size: 1024 * 1024,
            data_size: 12288,
            date: "2024-03-01T10:00:00+00:00".to_string(),
            disk_name: "vda".to_string(),
            disk_format: "qcow2".to_string(),
            checkpoint_name: "nbdvault.1".to_string(),
            parent_checkpoint: "nbdvault.0".to_string(),
            incremental: true,
            stream_version: STREAM_VERSION,
            compressed: false,
            compression_method: None,
            compression_level: None,
        }
    }

    #[test]
    fn roundtrip() -> Result<(), FormatError> {
        let meta = example();
        let bytes = meta.to_bytes()?;
        let parsed = StreamMetadata::from_bytes(&bytes)?;
        assert_eq!(parsed.virtual_size, meta.virtual_size);
        assert_eq!(parsed.checkpoint_name, meta.checkpoint_name);
        assert_eq!(parsed.incremental, meta.incremental);
        Ok(())
    }

    #[test]
    fn wire_keys_are_camel_case() -> Result<(), FormatError> {
        let bytes = example().to_bytes()?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        for key in [
            "virtualSize",
            "dataSize",
            "diskName",
            "diskFormat",
            "checkpointName",
            "parentCheckpoint",
            "streamVersion",
            "incremental",
            "compressed",
            "date",
        ] {
            assert!(value.get(key).is_some(), "missing key {}", key);
        }
        // omitted for uncompressed streams
        assert!(value.get("compressionMethod").is_none());
        Ok(())
    }

    #[test]
    fn unknown_keys_are_ignored() -> Result<(), FormatError> {
        let mut value = serde_json::to_value(example()).unwrap();
        value["futureKey"] = serde_json::json!("ignored");
        let bytes = serde_json::to_vec(&value).unwrap();
        StreamMetadata::from_bytes(&bytes)?;
        Ok(())
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let mut value = serde_json::to_value(example()).unwrap();
        value.as_object_mut().unwrap().remove("virtualSize");
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(StreamMetadata::from_bytes(&bytes).is_err());
    }
}
