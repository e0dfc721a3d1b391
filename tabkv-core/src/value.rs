//! Stored values, change notifications and size accounting.

use serde::{Deserialize, Serialize};

/// An arbitrary structured value: mapping, list or scalar.
///
/// Absence is modelled as `None` in an `Option<StorageValue>`.
pub type StorageValue = serde_json::Value;

/// Serialize a value to its text form.
pub fn serialize_value(value: &StorageValue) -> String {
    // Serializing a `Value` into a `String` cannot fail: map keys are
    // always strings and there is no I/O.
    value.to_string()
}

/// Length of a string in two-byte code units, as counted by the backing medium.
pub fn text_units(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Serialized length of a value in code units.
pub fn serialized_len(value: &StorageValue) -> usize {
    text_units(&serialize_value(value))
}

/// Approximate bytes needed to persist `key` with `value`.
///
/// `2 × (key length + serialized value length)`.
pub fn record_size(key: &str, value: &StorageValue) -> usize {
    2 * (text_units(key) + serialized_len(value))
}

/// Notification that another facade changed a key in the shared table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Key that changed.
    pub key: String,
    /// New value, `None` when the key was deleted.
    pub value: Option<StorageValue>,
    /// Value before the change, `None` when the key was absent.
    pub previous_value: Option<StorageValue>,
}

impl ChangeEvent {
    /// Returns true if this change removed the key.
    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_size_counts_key_and_serialized_value() {
        // "\"Two\"" is 5 units, "k" is 1 unit
        assert_eq!(record_size("k", &json!("Two")), 2 * (1 + 5));
    }

    #[test]
    fn test_text_units_counts_utf16() {
        assert_eq!(text_units("abc"), 3);
        // U+1F600 needs a surrogate pair
        assert_eq!(text_units("\u{1F600}"), 2);
        assert_eq!(text_units("é"), 1);
    }

    #[test]
    fn test_serialized_len_structured() {
        let value = json!({"a": [1, 2]});
        assert_eq!(serialized_len(&value), r#"{"a":[1,2]}"#.len());
    }

    #[test]
    fn test_change_event_is_delete() {
        let delete = ChangeEvent {
            key: "x".to_string(),
            value: None,
            previous_value: Some(json!(1)),
        };
        assert!(delete.is_delete());

        let write = ChangeEvent {
            key: "x".to_string(),
            value: Some(json!(2)),
            previous_value: None,
        };
        assert!(!write.is_delete());
    }
}
