//! Test fixtures: a hand-built "test all types" layout exercising every
//! field shape, plus helpers shared by the unit tests. Available to
//! downstream crates for their own testing.

use std::sync::OnceLock;

use crate::arena::Arena;
use crate::decoding::DecodeOptions;
use crate::encoding::encode_vec;
use crate::tables::builder::{FieldCard, FieldSpec, build};
use crate::tables::{
    FieldType, MODE_SCALAR, MiniTable, MiniTableEnum, MiniTableField, MiniTableSub,
};

pub struct TestTables {
    pub table: &'static MiniTable,
    pub nested: &'static MiniTable,
    pub entry: &'static MiniTable,
}

fn spec(number: u32, ftype: FieldType, card: FieldCard, sub: u16) -> FieldSpec {
    FieldSpec {
        number,
        ftype,
        card,
        sub,
    }
}

/// A message with one field of every shape: presence-tracked scalars of
/// every type, a sub-message, an enum, a oneof, packed and unpacked
/// repeated fields, a map, a group, and a field with a two-byte tag.
pub fn test_tables() -> &'static TestTables {
    static TABLES: OnceLock<TestTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        use FieldCard::*;
        let nested = build(
            &[
                spec(1, FieldType::Int32, Optional, 0),
                spec(2, FieldType::String, Optional, 0),
            ],
            &[],
        );
        let entry = build(
            &[
                spec(1, FieldType::String, Implicit, 0),
                spec(2, FieldType::Int32, Implicit, 0),
            ],
            &[],
        );
        let nested_enum: &'static MiniTableEnum =
            Box::leak(Box::new(MiniTableEnum { values: &[0, 1, 2] }));
        let subs: &'static [MiniTableSub] = Vec::leak(vec![
            MiniTableSub::Message(nested),
            MiniTableSub::Enum(nested_enum),
            MiniTableSub::Message(entry),
        ]);
        let table = build(
            &[
                spec(1, FieldType::Int32, Optional, 0),
                spec(2, FieldType::Int64, Optional, 0),
                spec(3, FieldType::UInt32, Optional, 0),
                spec(4, FieldType::UInt64, Optional, 0),
                spec(5, FieldType::SInt32, Optional, 0),
                spec(6, FieldType::SInt64, Optional, 0),
                spec(7, FieldType::Fixed32, Optional, 0),
                spec(8, FieldType::Fixed64, Optional, 0),
                spec(9, FieldType::Bool, Optional, 0),
                spec(10, FieldType::String, Optional, 0),
                spec(11, FieldType::Bytes, Optional, 0),
                spec(12, FieldType::Float, Optional, 0),
                spec(13, FieldType::Double, Optional, 0),
                spec(14, FieldType::Message, Optional, 0),
                spec(15, FieldType::Enum, Optional, 1),
                spec(16, FieldType::UInt32, Oneof(0), 0),
                spec(17, FieldType::String, Oneof(0), 0),
                spec(18, FieldType::Int32, Packed, 0),
                spec(19, FieldType::String, Repeated, 0),
                spec(20, FieldType::Message, Repeated, 0),
                spec(21, FieldType::Message, Map, 2),
                spec(22, FieldType::Group, Optional, 0),
                spec(300, FieldType::Fixed32, Optional, 0),
            ],
            subs,
        );
        TestTables {
            table,
            nested,
            entry,
        }
    })
}

/// Self-referential layout for nesting-depth tests: field 1 is a message
/// of the same type. Defined statically, the way generated code resolves
/// recursive types.
pub mod recursive {
    use super::*;

    pub static FIELDS: [MiniTableField; 1] = [MiniTableField {
        number: 1,
        offset: 8,
        presence: 0,
        submsg_index: 0,
        descriptor_type: FieldType::Message,
        mode: MODE_SCALAR,
    }];
    pub static SUBS: [MiniTableSub; 1] = [MiniTableSub::Message(&TABLE)];
    pub static TABLE: MiniTable = MiniTable::new_static(16, 0, 1, &FIELDS, &SUBS);
}

/// Decode, re-encode, and expect the original bytes back.
pub fn assert_roundtrip(data: &[u8], table: &MiniTable) {
    let mut arena = Arena::new();
    let msg = crate::decode(data, table, &mut arena, DecodeOptions::default())
        .expect("decode should succeed");
    let out = encode_vec(msg, table).expect("encode should succeed");
    assert_eq!(out, data);
}

/// Decode the same bytes with and without the fast path and expect
/// identical re-encodings.
pub fn assert_fast_slow_equivalent(data: &[u8], table: &MiniTable) {
    let mut arena_fast = Arena::new();
    let mut arena_slow = Arena::new();
    let fast = crate::decode(data, table, &mut arena_fast, DecodeOptions::default());
    let slow = crate::decode(
        data,
        table,
        &mut arena_slow,
        DecodeOptions {
            disable_fast_path: true,
            ..DecodeOptions::default()
        },
    );
    match (fast, slow) {
        (Ok(f), Ok(s)) => {
            assert_eq!(
                encode_vec(f, table).expect("encode"),
                encode_vec(s, table).expect("encode"),
            );
        }
        (Err(f), Err(s)) => assert_eq!(f, s),
        (f, s) => panic!("fast/slow divergence: {:?} vs {:?}", f.is_ok(), s.is_ok()),
    }
}

#[cfg(feature = "json")]
pub mod json_names {
    use std::sync::OnceLock;

    use crate::json::{JsonEnumNames, JsonFieldName, JsonNameTable, JsonSub};

    const fn n(name: &'static str, json_name: &'static str) -> JsonFieldName {
        JsonFieldName { name, json_name }
    }

    /// Names parallel to [`super::test_tables`]'s field order.
    pub fn test_names() -> &'static JsonNameTable {
        static NAMES: OnceLock<JsonNameTable> = OnceLock::new();
        NAMES.get_or_init(|| {
            let nested: &'static JsonNameTable = Box::leak(Box::new(JsonNameTable {
                fields: Vec::leak(vec![n("a", "a"), n("b", "b")]),
                subs: &[],
            }));
            let entry: &'static JsonNameTable = Box::leak(Box::new(JsonNameTable {
                fields: Vec::leak(vec![n("key", "key"), n("value", "value")]),
                subs: &[],
            }));
            let nested_enum: &'static JsonEnumNames = Box::leak(Box::new(JsonEnumNames {
                entries: &[("FOO", 0), ("BAR", 1), ("BAZ", 2)],
            }));
            let subs: &'static [JsonSub] = Vec::leak(vec![
                JsonSub::Message(nested),
                JsonSub::Enum(nested_enum),
                JsonSub::Message(entry),
            ]);
            JsonNameTable {
                fields: Vec::leak(vec![
                    n("optional_int32", "optionalInt32"),
                    n("optional_int64", "optionalInt64"),
                    n("optional_uint32", "optionalUint32"),
                    n("optional_uint64", "optionalUint64"),
                    n("optional_sint32", "optionalSint32"),
                    n("optional_sint64", "optionalSint64"),
                    n("optional_fixed32", "optionalFixed32"),
                    n("optional_fixed64", "optionalFixed64"),
                    n("optional_bool", "optionalBool"),
                    n("optional_string", "optionalString"),
                    n("optional_bytes", "optionalBytes"),
                    n("optional_float", "optionalFloat"),
                    n("optional_double", "optionalDouble"),
                    n("optional_nested_message", "optionalNestedMessage"),
                    n("optional_nested_enum", "optionalNestedEnum"),
                    n("oneof_uint32", "oneofUint32"),
                    n("oneof_string", "oneofString"),
                    n("repeated_int32", "repeatedInt32"),
                    n("repeated_string", "repeatedString"),
                    n("repeated_nested_message", "repeatedNestedMessage"),
                    n("map_string_int32", "mapStringInt32"),
                    n("optionalgroup", "optionalgroup"),
                    n("far_fixed32", "farFixed32"),
                ]),
                subs,
            }
        })
    }
}
