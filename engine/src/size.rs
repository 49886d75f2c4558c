//! Storage accounting.
//!
//! Sizes are estimates of the in-memory footprint of JSON-like values,
//! counting strings as UTF-16. They are deterministic: equal values always
//! report equal sizes.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Per-slot overhead of an array element.
const ARRAY_SLOT_BYTES: u64 = 8;
/// Per-property overhead of an object entry.
const PROPERTY_BYTES: u64 = 16;
/// Flat overhead of every object.
const OBJECT_BYTES: u64 = 32;

/// Values whose storage footprint can be estimated.
pub trait ByteSize {
    fn byte_size(&self) -> u64;
}

/// Estimate the size of a value in bytes.
pub fn calculate_object_size<T: ByteSize + ?Sized>(value: &T) -> u64 {
    value.byte_size()
}

fn string_size(s: &str) -> u64 {
    s.encode_utf16().count() as u64 * 2
}

fn property_size(key: &str, value: &impl ByteSize) -> u64 {
    string_size(key) + value.byte_size() + PROPERTY_BYTES
}

impl ByteSize for Value {
    fn byte_size(&self) -> u64 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 4,
            Value::Number(_) => 8,
            Value::String(s) => string_size(s),
            Value::Array(items) => items.as_slice().byte_size(),
            Value::Object(map) => {
                map.iter()
                    .map(|(key, value)| property_size(key, value))
                    .sum::<u64>()
                    + OBJECT_BYTES
            }
        }
    }
}

impl ByteSize for str {
    fn byte_size(&self) -> u64 {
        string_size(self)
    }
}

impl ByteSize for String {
    fn byte_size(&self) -> u64 {
        string_size(self)
    }
}

impl ByteSize for bool {
    fn byte_size(&self) -> u64 {
        4
    }
}

macro_rules! number_size {
    ($($ty:ty),*) => {
        $(impl ByteSize for $ty {
            fn byte_size(&self) -> u64 {
                8
            }
        })*
    };
}

number_size!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64, usize, isize);

impl<Tz: TimeZone> ByteSize for DateTime<Tz> {
    fn byte_size(&self) -> u64 {
        8
    }
}

impl ByteSize for NaiveDateTime {
    fn byte_size(&self) -> u64 {
        8
    }
}

impl ByteSize for NaiveDate {
    fn byte_size(&self) -> u64 {
        8
    }
}

impl<T: ByteSize> ByteSize for Option<T> {
    fn byte_size(&self) -> u64 {
        self.as_ref().map_or(0, ByteSize::byte_size)
    }
}

impl<T: ByteSize> ByteSize for [T] {
    fn byte_size(&self) -> u64 {
        self.iter().map(ByteSize::byte_size).sum::<u64>() + self.len() as u64 * ARRAY_SLOT_BYTES
    }
}

impl<T: ByteSize> ByteSize for Vec<T> {
    fn byte_size(&self) -> u64 {
        self.as_slice().byte_size()
    }
}

impl<T: ByteSize> ByteSize for BTreeMap<String, T> {
    fn byte_size(&self) -> u64 {
        self.iter()
            .map(|(key, value)| property_size(key, value))
            .sum::<u64>()
            + OBJECT_BYTES
    }
}

impl<T: ByteSize, S> ByteSize for HashMap<String, T, S> {
    fn byte_size(&self) -> u64 {
        self.iter()
            .map(|(key, value)| property_size(key, value))
            .sum::<u64>()
            + OBJECT_BYTES
    }
}

/// Format a byte count with binary units and one decimal place.
///
/// `0` formats as `0 B`. Units stop at GB.
pub fn format_storage_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Statistics of one partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub item_count: u64,
    pub storage_size: u64,
    pub unsynced_count: u64,
}

/// Aggregate statistics across the domain partitions and the sync queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub total_items: u64,
    pub unsynced_items: u64,
    pub sync_queue_size: u64,
    pub storage_size: u64,
}

/// Per-partition breakdown plus sync bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetailedStorageStats {
    pub totals: StorageStats,
    pub partitions: BTreeMap<String, StoreStats>,
    pub sync_queue: StoreStats,
    pub pending_conflicts: u64,
    pub last_sync: BTreeMap<String, Option<i64>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn primitive_sizes() {
        assert_eq!(calculate_object_size(&Value::Null), 0);
        assert_eq!(calculate_object_size(&json!(42)), 8);
        assert_eq!(calculate_object_size(&json!(4.2)), 8);
        assert_eq!(calculate_object_size(&json!(true)), 4);
        assert_eq!(calculate_object_size(&json!("abc")), 6);
        assert_eq!(calculate_object_size(&None::<String>), 0);
    }

    #[test]
    fn strings_count_utf16_units() {
        assert_eq!(calculate_object_size("a".repeat(10).as_str()), 20);
        // One astral-plane character is two UTF-16 code units.
        assert_eq!(calculate_object_size("\u{1F600}"), 4);
        assert_eq!(calculate_object_size("é"), 2);
    }

    #[test]
    fn dates_are_eight_bytes() {
        let now = chrono::Utc::now();
        assert_eq!(calculate_object_size(&now), 8);
        assert_eq!(calculate_object_size(&now.date_naive()), 8);
    }

    #[test]
    fn array_size() {
        // 3 numbers (24) + 3 slots (24)
        assert_eq!(calculate_object_size(&json!([1, 2, 3])), 48);
        assert_eq!(calculate_object_size(&json!([])), 0);
        assert_eq!(calculate_object_size(&vec![true, false]), 8 + 16);
    }

    #[test]
    fn object_size() {
        // key "a" (2) + number (8) + 16, plus 32
        assert_eq!(calculate_object_size(&json!({"a": 1})), 58);
        assert_eq!(calculate_object_size(&json!({})), 32);

        let nested = json!({"p": {"q": null}});
        // inner: 2 + 0 + 16 + 32 = 50; outer: 2 + 50 + 16 + 32 = 100
        assert_eq!(calculate_object_size(&nested), 100);
    }

    #[test]
    fn typed_maps_match_json_objects() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1_i64);
        assert_eq!(
            calculate_object_size(&map),
            calculate_object_size(&json!({"a": 1}))
        );
    }

    #[test]
    fn format_sizes() {
        assert_eq!(format_storage_size(0), "0 B");
        assert_eq!(format_storage_size(512), "512.0 B");
        assert_eq!(format_storage_size(1024), "1.0 KB");
        assert_eq!(format_storage_size(1536), "1.5 KB");
        assert_eq!(format_storage_size(1_048_576), "1.0 MB");
        assert_eq!(format_storage_size(1_073_741_824), "1.0 GB");
        assert_eq!(format_storage_size(5 * 1_099_511_627_776), "5120.0 GB");
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        fn json_leaf() -> impl Strategy<Value = Value> {
            prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::from),
                any::<i64>().prop_map(Value::from),
                ".{0,16}".prop_map(Value::from),
            ]
        }

        fn json_value() -> impl Strategy<Value = Value> {
            json_leaf().prop_recursive(3, 32, 6, |inner| {
                prop_oneof![
                    prop::collection::vec(inner.clone(), 0..6).prop_map(Value::from),
                    prop::collection::btree_map("[a-z]{1,8}", inner, 0..6)
                        .prop_map(|map| Value::Object(map.into_iter().collect())),
                ]
            })
        }

        proptest! {
            #[test]
            fn prop_size_is_deterministic(value in json_value()) {
                prop_assert_eq!(calculate_object_size(&value), calculate_object_size(&value.clone()));
            }

            #[test]
            fn prop_adding_a_field_grows_the_object(
                value in json_value(),
                key in "[a-z]{1,8}",
                extra in json_value(),
            ) {
                let mut object = serde_json::Map::new();
                object.insert("base".to_string(), value);
                let before = calculate_object_size(&Value::Object(object.clone()));

                prop_assume!(!object.contains_key(&key));
                object.insert(key, extra);
                let after = calculate_object_size(&Value::Object(object));
                prop_assert!(after > before);
            }

            #[test]
            fn prop_string_size_is_twice_utf16_len(s in ".{0,64}") {
                prop_assert_eq!(
                    calculate_object_size(s.as_str()),
                    2 * s.encode_utf16().count() as u64
                );
            }

            #[test]
            fn prop_format_has_one_decimal(bytes in 1u64..u64::MAX / 2) {
                let formatted = format_storage_size(bytes);
                let number = formatted.split(' ').next().unwrap();
                prop_assert_eq!(number.split('.').nth(1).map(str::len), Some(1));
            }
        }
    }
}
