// ABOUTME: Field Mapper - transforms one raw feed record into the target shape
// ABOUTME: Handles multi-value normalization, integer truncation, derived fields

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde_json::{Map, Value};

use crate::entity::EntityType;
use crate::error::SyncError;

/// A raw record as delivered by the feed: an open, untyped field mapping.
pub type RawRecord = Map<String, Value>;

/// A mapped record sharing the target schema's key space. Fields absent in
/// the source are explicitly `null`, never omitted, so an upsert
/// deterministically overwrites stale values.
pub type MappedRecord = Map<String, Value>;

/// How a target column is derived from the raw record.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    /// Copy the source value by name.
    Scalar,
    /// Normalize into a sequence of non-empty strings.
    MultiValued,
    /// Parse as a float and truncate toward zero.
    Integer,
    /// Extract the time-of-day component from a full timestamp field.
    TimeOfDay { source_timestamp: &'static str },
}

/// Declared derivation of one target column.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub target: &'static str,
    pub source: &'static str,
    pub kind: FieldKind,
}

const fn scalar(name: &'static str) -> FieldSpec {
    FieldSpec {
        target: name,
        source: name,
        kind: FieldKind::Scalar,
    }
}

const fn multi(name: &'static str) -> FieldSpec {
    FieldSpec {
        target: name,
        source: name,
        kind: FieldKind::MultiValued,
    }
}

const fn integer(name: &'static str) -> FieldSpec {
    FieldSpec {
        target: name,
        source: name,
        kind: FieldKind::Integer,
    }
}

const PROPERTY_FIELDS: &[FieldSpec] = &[
    scalar("ListingKey"),
    scalar("ModificationTimestamp"),
    scalar("ListPrice"),
    scalar("City"),
    scalar("StateOrProvince"),
    scalar("PostalCode"),
    scalar("StandardStatus"),
    scalar("PropertyType"),
    scalar("UnparsedAddress"),
    scalar("ListAgentKey"),
    scalar("PublicRemarks"),
    multi("Cooling"),
    multi("Heating"),
    multi("Appliances"),
    multi("Flooring"),
    multi("InteriorFeatures"),
    integer("TaxYear"),
    integer("BedroomsTotal"),
    integer("BathroomsTotalInteger"),
    integer("PhotosCount"),
    integer("LivingArea"),
    FieldSpec {
        target: "PhotosChangeTime",
        source: "PhotosChangeTimestamp",
        kind: FieldKind::TimeOfDay {
            source_timestamp: "PhotosChangeTimestamp",
        },
    },
];

const MEDIA_FIELDS: &[FieldSpec] = &[
    scalar("MediaKey"),
    scalar("ResourceRecordKey"),
    scalar("ModificationTimestamp"),
    scalar("MediaURL"),
    scalar("MediaCategory"),
    scalar("MimeType"),
    scalar("ShortDescription"),
    integer("Order"),
];

/// Composite room columns on the property table, derived from an auxiliary
/// list of room child records (or flat fields when none is supplied).
const ROOM_TARGETS: &[&str] = &["RoomType", "RoomDimensions", "RoomFeatures"];

/// Field derivations for an entity's flat columns.
pub fn field_specs(entity: EntityType) -> &'static [FieldSpec] {
    match entity {
        EntityType::Property => PROPERTY_FIELDS,
        EntityType::Media => MEDIA_FIELDS,
    }
}

/// Full declared capability set for an entity's target table.
pub fn declared_columns(entity: EntityType) -> Vec<String> {
    let mut cols: Vec<String> = field_specs(entity)
        .iter()
        .map(|s| s.target.to_string())
        .collect();
    if entity == EntityType::Property {
        cols.extend(ROOM_TARGETS.iter().map(|s| s.to_string()));
    }
    cols
}

/// Map one raw record into the target shape.
///
/// Pure and total over any input shape: a merely missing field maps to an
/// explicit `null`, never an error. The only failure is a structurally
/// invalid primary key, which aborts mapping for this single record.
///
/// For properties, `rooms` optionally carries the auxiliary room child
/// records used to derive the composite room columns.
pub fn map_record(
    entity: EntityType,
    raw: &RawRecord,
    rooms: Option<&[RawRecord]>,
) -> Result<MappedRecord, SyncError> {
    let key_field = entity.key_field();
    let key = record_key(raw, key_field)?;

    let mut mapped = MappedRecord::new();
    for spec in field_specs(entity) {
        let value = match spec.kind {
            FieldKind::Scalar => raw.get(spec.source).cloned().unwrap_or(Value::Null),
            FieldKind::MultiValued => normalize_multi_value(raw.get(spec.source)),
            FieldKind::Integer => to_integer(raw.get(spec.source))
                .map(|n| Value::Number(n.into()))
                .unwrap_or(Value::Null),
            FieldKind::TimeOfDay { source_timestamp } => {
                time_of_day(raw.get(source_timestamp))
                    .map(Value::String)
                    .unwrap_or(Value::Null)
            }
        };
        mapped.insert(spec.target.to_string(), value);
    }

    if entity == EntityType::Property {
        map_rooms(raw, rooms, &mut mapped);
    }

    // Keep the key a string in the target regardless of feed typing.
    mapped.insert(key_field.to_string(), Value::String(key));

    Ok(mapped)
}

/// Extract and validate the primary key of a raw record.
pub fn record_key(raw: &RawRecord, key_field: &str) -> Result<String, SyncError> {
    match raw.get(key_field) {
        None | Some(Value::Null) => Err(SyncError::InvalidPrimaryKey {
            field: key_field.to_string(),
            reason: "field is absent".to_string(),
        }),
        Some(Value::String(s)) if s.trim().is_empty() => Err(SyncError::InvalidPrimaryKey {
            field: key_field.to_string(),
            reason: "field is empty".to_string(),
        }),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(SyncError::InvalidPrimaryKey {
            field: key_field.to_string(),
            reason: format!("unsupported key type: {}", type_name(other)),
        }),
    }
}

/// Normalize a source value into a multi-valued target field.
///
/// Sequences are element-wise coerced to strings, trimmed, and emptied of
/// blanks. A string is first tried as a JSON array and otherwise wrapped as
/// a single element. Anything else is string-coerced then wrapped. An empty
/// result collapses to explicit absence (`null`), never an empty sequence.
pub fn normalize_multi_value(value: Option<&Value>) -> Value {
    let elements = match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => collect_elements(items),
        Some(Value::String(s)) => {
            match serde_json::from_str::<Value>(s) {
                Ok(Value::Array(items)) => collect_elements(&items),
                // Not a JSON array: the whole string is one element.
                _ => single_element(s),
            }
        }
        Some(other) => single_element(&coerce_to_string(other)),
    };

    if elements.is_empty() {
        Value::Null
    } else {
        Value::Array(elements.into_iter().map(Value::String).collect())
    }
}

fn collect_elements(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| {
            let s = coerce_to_string(item);
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

fn single_element(s: &str) -> Vec<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        Vec::new()
    } else {
        vec![trimmed.to_string()]
    }
}

fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Parse a source value as an integer, truncating toward zero.
///
/// Absent or unparseable sources map to `None`, never zero: a missing tax
/// year must not overwrite a real one with 0.
pub fn to_integer(value: Option<&Value>) -> Option<i64> {
    let f = match value {
        None | Some(Value::Null) => return None,
        Some(Value::Number(n)) => n.as_f64()?,
        Some(Value::String(s)) => s.trim().parse::<f64>().ok()?,
        Some(_) => return None,
    };
    if !f.is_finite() {
        return None;
    }
    Some(f.trunc() as i64)
}

/// Extract the local time-of-day component from a full timestamp value.
pub fn time_of_day(value: Option<&Value>) -> Option<String> {
    let ts = parse_timestamp(value?)?;
    let t = ts.time();
    Some(format!(
        "{:02}:{:02}:{:02}",
        t.hour(),
        t.minute(),
        t.second()
    ))
}

/// Parse a feed timestamp value. Accepts RFC 3339 and the feed's bare
/// `YYYY-MM-DDTHH:MM:SS[.fff]` form, which is taken as UTC.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Derive the composite room columns for a property.
///
/// When an auxiliary room list is supplied, the representative room is the
/// child with the lowest explicit `Order` (absent order counts as 0; ties
/// keep the first in original order). `RoomFeatures` is the union of every
/// child's features, deduplicated and order-preserving. Without an
/// auxiliary list, flat fields on the raw record itself are used.
fn map_rooms(raw: &RawRecord, rooms: Option<&[RawRecord]>, mapped: &mut MappedRecord) {
    match rooms {
        Some(children) if !children.is_empty() => {
            let Some(representative) = children
                .iter()
                .min_by_key(|room| to_integer(room.get("Order")).unwrap_or(0))
            else {
                return;
            };

            mapped.insert(
                "RoomType".to_string(),
                representative
                    .get("RoomType")
                    .cloned()
                    .unwrap_or(Value::Null),
            );
            mapped.insert(
                "RoomDimensions".to_string(),
                representative
                    .get("RoomDimensions")
                    .cloned()
                    .unwrap_or(Value::Null),
            );

            let mut seen = std::collections::HashSet::new();
            let mut features: Vec<Value> = Vec::new();
            for room in children {
                if let Value::Array(items) = normalize_multi_value(room.get("RoomFeatures")) {
                    for item in items {
                        if let Value::String(s) = &item {
                            if seen.insert(s.clone()) {
                                features.push(item);
                            }
                        }
                    }
                }
            }
            let value = if features.is_empty() {
                Value::Null
            } else {
                Value::Array(features)
            };
            mapped.insert("RoomFeatures".to_string(), value);
        }
        _ => {
            // No auxiliary list: fall back to flat fields on the record.
            mapped.insert(
                "RoomType".to_string(),
                raw.get("RoomType").cloned().unwrap_or(Value::Null),
            );
            mapped.insert(
                "RoomDimensions".to_string(),
                raw.get("RoomDimensions").cloned().unwrap_or(Value::Null),
            );
            mapped.insert(
                "RoomFeatures".to_string(),
                normalize_multi_value(raw.get("RoomFeatures")),
            );
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
