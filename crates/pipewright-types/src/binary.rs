//! Binary payload descriptors.
//!
//! A descriptor is the JSON record stored in the normal key/value space for
//! a binary payload. Small payloads carry their bytes inline (base64);
//! large ones carry a reference into the binary storage backend.

use serde::{Deserialize, Serialize};

/// Value of the `__type__` marker on every descriptor.
pub const BINARY_TYPE_MARKER: &str = "binary";

/// Encoding used for inline payloads.
pub const INLINE_ENCODING: &str = "base64";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLocation {
    Inline,
    Referenced,
}

/// Where a referenced payload lives in the binary storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageReference {
    pub namespace: String,
    pub key: String,
}

/// Media family of a binary format; decides which metadata is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryCategory {
    Image,
    Video,
    Audio,
    Pdf,
    Other,
}

impl BinaryCategory {
    /// Classify a format string such as `"png"` or `"audio/wav"`.
    pub fn from_format(format: &str) -> Self {
        let format = format.to_ascii_lowercase();
        let subtype = format.rsplit('/').next().unwrap_or(&format);
        if format.starts_with("image/") {
            return BinaryCategory::Image;
        }
        if format.starts_with("video/") {
            return BinaryCategory::Video;
        }
        if format.starts_with("audio/") {
            return BinaryCategory::Audio;
        }
        match subtype {
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "tiff" => BinaryCategory::Image,
            "mp4" | "webm" | "avi" | "mov" | "mkv" => BinaryCategory::Video,
            "mp3" | "wav" | "ogg" | "flac" | "aac" | "m4a" => BinaryCategory::Audio,
            "pdf" => BinaryCategory::Pdf,
            _ => BinaryCategory::Other,
        }
    }

    /// Descriptor fields that must be present for this category.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            BinaryCategory::Image => &["dimensions"],
            BinaryCategory::Video => &["dimensions", "duration"],
            BinaryCategory::Audio => &["sample_rate", "channels"],
            BinaryCategory::Pdf => &["pages"],
            BinaryCategory::Other => &[],
        }
    }
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Caller-supplied metadata for a payload being saved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinaryMetadata {
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<u32>,
}

impl BinaryMetadata {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            ..Default::default()
        }
    }
}

/// The stored record describing a binary payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryDescriptor {
    #[serde(rename = "__type__")]
    pub type_marker: String,
    pub data_location: DataLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_reference: Option<StorageReference>,
    #[serde(flatten)]
    pub metadata: BinaryMetadata,
}

impl BinaryDescriptor {
    pub fn inline(data: String, metadata: BinaryMetadata) -> Self {
        Self {
            type_marker: BINARY_TYPE_MARKER.to_string(),
            data_location: DataLocation::Inline,
            encoding: Some(INLINE_ENCODING.to_string()),
            data: Some(data),
            storage_reference: None,
            metadata,
        }
    }

    pub fn referenced(reference: StorageReference, metadata: BinaryMetadata) -> Self {
        Self {
            type_marker: BINARY_TYPE_MARKER.to_string(),
            data_location: DataLocation::Referenced,
            encoding: None,
            data: None,
            storage_reference: Some(reference),
            metadata,
        }
    }

    /// Exactly one of inline data or a storage reference, matching `data_location`.
    pub fn is_consistent(&self) -> bool {
        match self.data_location {
            DataLocation::Inline => {
                self.data.is_some() && self.encoding.is_some() && self.storage_reference.is_none()
            }
            DataLocation::Referenced => self.storage_reference.is_some() && self.data.is_none(),
        }
    }

    /// Whether a stored JSON value looks like a binary descriptor.
    pub fn is_descriptor(value: &serde_json::Value) -> bool {
        value.get("__type__").and_then(|t| t.as_str()) == Some(BINARY_TYPE_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_category_from_extension_and_mime() {
        assert_eq!(BinaryCategory::from_format("PNG"), BinaryCategory::Image);
        assert_eq!(BinaryCategory::from_format("audio/x-custom"), BinaryCategory::Audio);
        assert_eq!(BinaryCategory::from_format("mp4"), BinaryCategory::Video);
        assert_eq!(BinaryCategory::from_format("application/pdf"), BinaryCategory::Pdf);
        assert_eq!(BinaryCategory::from_format("zip"), BinaryCategory::Other);
    }

    #[test]
    fn test_required_fields_per_category() {
        assert_eq!(BinaryCategory::Image.required_fields(), &["dimensions"]);
        assert!(BinaryCategory::Audio.required_fields().contains(&"sample_rate"));
        assert!(BinaryCategory::Other.required_fields().is_empty());
    }

    #[test]
    fn test_inline_descriptor_serializes_flat() {
        let mut metadata = BinaryMetadata::new("pdf");
        metadata.pages = Some(3);
        let descriptor = BinaryDescriptor::inline("aGk=".to_string(), metadata);
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["__type__"], "binary");
        assert_eq!(value["data_location"], "inline");
        assert_eq!(value["format"], "pdf");
        assert_eq!(value["pages"], 3);
        assert!(value.get("storage_reference").is_none());
        assert!(BinaryDescriptor::is_descriptor(&value));
        assert!(descriptor.is_consistent());
    }

    #[test]
    fn test_referenced_descriptor_roundtrips() {
        let descriptor = BinaryDescriptor::referenced(
            StorageReference {
                namespace: "media".to_string(),
                key: "clip".to_string(),
            },
            BinaryMetadata::new("bin"),
        );
        let value = serde_json::to_value(&descriptor).unwrap();
        let back: BinaryDescriptor = serde_json::from_value(value).unwrap();
        assert_eq!(back, descriptor);
        assert!(back.is_consistent());
        assert!(!BinaryDescriptor::is_descriptor(&json!({ "__type__": "text" })));
    }
}
