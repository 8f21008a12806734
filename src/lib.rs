//! A compact protobuf runtime: arena-allocated messages described by binary
//! layout tables, decoded by a dispatch-table fast path with a generic
//! fallback, re-encoded by a single-pass backward writer, with typed
//! accessors and an optional JSON front-end.
//!
//! The decoder aliases string fields into the input buffer instead of
//! copying; [`decode`]'s signature borrows the buffer for as long as the
//! decoded message is reachable, so the aliasing cannot dangle.

#![cfg_attr(feature = "nightly", feature(likely_unlikely))]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod accessors;
pub mod arena;
pub mod base;
pub mod containers;
mod decode_fast;
mod decoding;
pub mod encoding;
#[cfg(feature = "json")]
pub mod json;
pub mod tables;
#[cfg(feature = "std")]
pub mod test_utils;
mod utils;
pub mod wire;

pub use accessors::FieldValue;
pub use arena::Arena;
pub use base::Message;
pub use containers::{Array, StringView};
pub use decoding::{DecodeError, DecodeOptions};
pub use encoding::{EncodeError, encode, encode_vec};
pub use tables::{FieldType, MiniTable, MiniTableEnum, MiniTableField, MiniTableSub};

/// Allocates an empty message of `table`'s layout in the arena.
///
/// The message's storage lives in the arena: it must not be touched after
/// the arena's fuse group is freed.
pub fn new_message<'msg>(table: &MiniTable, arena: &mut Arena<'_>) -> Option<&'msg mut Message> {
    base::Message::create_raw(table.size, arena).map(|p| unsafe { &mut *p.as_ptr() })
}

/// Decodes wire-format `buf` into a fresh message allocated from `arena`.
///
/// String and bytes fields in the result alias `buf` rather than copying,
/// so the message carries `buf`'s borrow. The message's storage lives in
/// the arena and must not be touched after the arena's fuse group is
/// freed; on error the partially-built message should be discarded with
/// its arena.
pub fn decode<'buf>(
    buf: &'buf [u8],
    table: &MiniTable,
    arena: &mut Arena<'_>,
    options: DecodeOptions,
) -> Result<&'buf mut Message, DecodeError> {
    let msg = base::Message::create_raw(table.size, arena).ok_or(DecodeError::OutOfMemory)?;
    if !buf.is_empty() {
        let (cursor, end) = wire::ReadCursor::new(buf);
        let fastend = if buf.len() > wire::FAST_SLACK {
            unsafe { buf.as_ptr().add(buf.len() - wire::FAST_SLACK) }
        } else {
            buf.as_ptr()
        };
        let mut d = decoding::DecodeState {
            limit: end,
            fastlimit: fastend.min(end),
            fastend,
            depth: options.max_depth,
            end_group: decoding::NO_GROUP,
            group_closed: false,
            disable_fast: options.disable_fast_path,
            err: DecodeError::Malformed,
            arena,
        };
        match unsafe { decode_fast::dispatch(&mut d, cursor, msg.as_ptr(), table, 0) } {
            Some(p) if p.as_const() == end => {}
            Some(_) => return Err(DecodeError::Malformed),
            None => return Err(d.err),
        }
    }
    if options.check_required
        && table.required_count > 0
        && !unsafe { decoding::has_required_fields(msg.as_ptr(), table) }
    {
        return Err(DecodeError::MissingRequired);
    }
    Ok(unsafe { &mut *msg.as_ptr() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessors::*;
    use crate::test_utils::{assert_fast_slow_equivalent, assert_roundtrip, recursive, test_tables};

    fn field(table: &'static MiniTable, number: u32) -> &'static MiniTableField {
        table.find_field_by_number(number).expect("field exists")
    }

    fn varint_bytes(mut n: u64) -> Vec<u8> {
        let mut out = Vec::new();
        while n >= 0x80 {
            out.push(n as u8 | 0x80);
            n >>= 7;
        }
        out.push(n as u8);
        out
    }

    /// Every field shape once, in canonical ascending order.
    fn kitchen_sink() -> Vec<u8> {
        let mut b = Vec::new();
        b.extend([0x08, 0x96, 0x01]); // 1: int32 150
        b.extend([0x10, 0x2a]); // 2: int64 42
        b.extend([0x28, 0x03]); // 5: sint32 -2
        b.extend([0x3d, 0x01, 0x00, 0x00, 0x00]); // 7: fixed32 1
        b.extend([0x41, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]); // 8: fixed64 2
        b.extend([0x48, 0x01]); // 9: bool true
        b.extend([0x52, 0x05]); // 10: string "hello"
        b.extend(b"hello");
        b.extend([0x5a, 0x03, 0x01, 0x02, 0x03]); // 11: bytes
        b.extend([0x65, 0x00, 0x00, 0x80, 0x3f]); // 12: float 1.0
        b.extend([0x69, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xf0, 0x3f]); // 13: double 1.0
        b.extend([0x72, 0x04, 0x08, 0x07, 0x12, 0x00]); // 14: nested {a: 7, b: ""}
        b.extend([0x78, 0x01]); // 15: enum BAR
        b.extend([0x8a, 0x01, 0x02]); // 17: oneof string "hi"
        b.extend(b"hi");
        b.extend([0x92, 0x01, 0x03, 0x01, 0x02, 0x03]); // 18: packed [1, 2, 3]
        b.extend([0x9a, 0x01, 0x01, 0x78]); // 19: "x"
        b.extend([0x9a, 0x01, 0x01, 0x79]); // 19: "y"
        b.extend([0xa2, 0x01, 0x02, 0x08, 0x01]); // 20: nested {a: 1}
        b.extend([0xa2, 0x01, 0x02, 0x08, 0x02]); // 20: nested {a: 2}
        b.extend([0xaa, 0x01, 0x06, 0x0a, 0x01, 0x6b, 0x10, 0x2a]); // 21: {"k": 42}
        b.extend([0xb3, 0x01, 0x08, 0x05, 0xb4, 0x01]); // 22: group {a: 5}
        b.extend([0xe5, 0x12, 0xef, 0xbe, 0xad, 0xde]); // 300: fixed32 0xdeadbeef
        b
    }

    #[test]
    fn test_varint_field() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let buf = [0x08, 0x96, 0x01];
        let msg = decode(&buf, t, &mut arena, DecodeOptions::default()).unwrap();
        let f1 = field(t, 1);
        assert!(has_field(msg, f1));
        assert_eq!(get_int32(msg, f1), 150);
        assert!(!has_field(msg, field(t, 2)));
    }

    #[test]
    fn test_string_field_aliases_input() {
        let t = test_tables().nested;
        let mut arena = Arena::new();
        let buf = [0x12, 0x05, 0x68, 0x65, 0x6c, 0x6c, 0x6f];
        let msg = decode(&buf, t, &mut arena, DecodeOptions::default()).unwrap();
        let view = get_string(msg, field(t, 2));
        assert_eq!(view.as_bytes(), b"hello");
        // Aliased, not copied: the view points into the input buffer.
        assert_eq!(view.as_bytes().as_ptr(), buf[2..].as_ptr());
    }

    #[test]
    fn test_max_varint() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let mut buf = vec![0x20];
        buf.extend([0xff; 9]);
        buf.push(0x01);
        let msg = decode(&buf, t, &mut arena, DecodeOptions::default()).unwrap();
        assert_eq!(get_uint64(msg, field(t, 4)), u64::MAX);

        // With enough trailing input the tag is dispatched on the fast
        // path, which must hand the long varint to the generic decoder
        // after the second continuation byte.
        buf.extend([0x52, 0x10]);
        buf.extend([b'a'; 16]);
        let mut arena = Arena::new();
        let msg = decode(&buf, t, &mut arena, DecodeOptions::default()).unwrap();
        assert_eq!(get_uint64(msg, field(t, 4)), u64::MAX);
        assert_eq!(get_string(msg, field(t, 10)).as_bytes(), &[b'a'; 16][..]);
    }

    #[test]
    fn test_kitchen_sink_decode() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let buf = kitchen_sink();
        let msg = decode(&buf, t, &mut arena, DecodeOptions::default()).unwrap();

        assert_eq!(get_int32(msg, field(t, 1)), 150);
        assert_eq!(get_int64(msg, field(t, 2)), 42);
        assert_eq!(get_int32(msg, field(t, 5)), -2);
        assert_eq!(get_uint32(msg, field(t, 7)), 1);
        assert_eq!(get_uint64(msg, field(t, 8)), 2);
        assert!(get_bool(msg, field(t, 9)));
        assert_eq!(get_string(msg, field(t, 10)).as_bytes(), b"hello");
        assert_eq!(get_string(msg, field(t, 11)).as_bytes(), &[1, 2, 3]);
        assert_eq!(get_float(msg, field(t, 12)), 1.0);
        assert_eq!(get_double(msg, field(t, 13)), 1.0);
        let nested = get_message(msg, field(t, 14)).expect("nested present");
        assert_eq!(get_int32(nested, field(test_tables().nested, 1)), 7);
        assert_eq!(get_enum(msg, field(t, 15)), 1);

        // Oneof: arm 17 is live, arm 16 is not.
        assert!(!has_field(msg, field(t, 16)));
        assert!(has_field(msg, field(t, 17)));
        assert_eq!(get_string(msg, field(t, 17)).as_bytes(), b"hi");

        let packed = get_array(msg, field(t, 18)).expect("packed present");
        assert_eq!(unsafe { packed.slice::<i32>() }, &[1, 2, 3]);
        let strings = get_array(msg, field(t, 19)).expect("strings present");
        assert_eq!(strings.len(), 2);
        let msgs = get_array(msg, field(t, 20)).expect("messages present");
        assert_eq!(msgs.len(), 2);
        let map = get_array(msg, field(t, 21)).expect("map present");
        assert_eq!(map.len(), 1);
        let group = get_message(msg, field(t, 22)).expect("group present");
        assert_eq!(get_int32(group, field(test_tables().nested, 1)), 5);
        assert_eq!(get_uint32(msg, field(t, 300)), 0xdead_beef);
    }

    #[test]
    fn test_kitchen_sink_roundtrip() {
        assert_roundtrip(&kitchen_sink(), test_tables().table);
    }

    #[test]
    fn test_fast_slow_equivalence() {
        let t = test_tables().table;
        assert_fast_slow_equivalent(&kitchen_sink(), t);
        assert_fast_slow_equivalent(&[0x08, 0x96, 0x01], t);
        assert_fast_slow_equivalent(&[], t);
        // Unpacked elements of a packed-default field.
        let mut buf = Vec::new();
        for v in [1u64, 300, 70000] {
            buf.extend([0x90, 0x01]);
            buf.extend(varint_bytes(v));
        }
        assert_fast_slow_equivalent(&buf, t);
        // Long repeated string runs exercise the capacity-growth handoff.
        let mut buf = Vec::new();
        for _ in 0..20 {
            buf.extend([0x9a, 0x01, 0x03]);
            buf.extend(b"abc");
        }
        assert_fast_slow_equivalent(&buf, t);
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let mut buf = vec![0x08, 0x2a]; // known field 1
        buf.extend([0x98, 0x06, 0x01]); // unknown field 99, varint 1
        buf.extend([0x92, 0x03, 0x02, 0xca, 0xfe]); // unknown field 50, 2 bytes
        let msg = decode(&buf, t, &mut arena, DecodeOptions::default()).unwrap();
        let out = encode_vec(msg, t).unwrap();
        assert_eq!(out, buf);
    }

    #[test]
    fn test_unknown_group_preserved() {
        let t = test_tables().nested;
        let mut arena = Arena::new();
        // Unknown field 5 as a group holding a varint, then a known field.
        let buf = [0x2b, 0x08, 0x07, 0x2c, 0x08, 0x2a];
        let msg = decode(&buf, t, &mut arena, DecodeOptions::default()).unwrap();
        assert_eq!(get_int32(msg, field(t, 1)), 42);
        let out = encode_vec(msg, t).unwrap();
        // Known field first, unknown group record at the tail.
        assert_eq!(out, [0x08, 0x2a, 0x2b, 0x08, 0x07, 0x2c]);
    }

    fn nested_buffer(levels: usize) -> Vec<u8> {
        let mut body = Vec::new();
        for _ in 0..levels {
            let mut out = vec![0x0a];
            out.extend(varint_bytes(body.len() as u64));
            out.extend(&body);
            body = out;
        }
        body
    }

    #[test]
    fn test_depth_limit() {
        let mut arena = Arena::new();
        let ok = nested_buffer(100);
        assert!(decode(&ok, &recursive::TABLE, &mut arena, DecodeOptions::default()).is_ok());

        let mut arena = Arena::new();
        let too_deep = nested_buffer(101);
        assert_eq!(
            decode(&too_deep, &recursive::TABLE, &mut arena, DecodeOptions::default()).unwrap_err(),
            DecodeError::MaxDepthExceeded,
        );
    }

    #[test]
    fn test_malformed_inputs() {
        let t = test_tables().table;
        for bad in [
            &[0x08][..],                   // truncated varint
            &[0x52, 0x05, 0x68][..],       // length past buffer end
            &[0x00][..],                   // field number zero
            &[0x0f][..],                   // wire type 7
            &[0xb4, 0x01][..],             // stray end-group
            &[0xb3, 0x01, 0x08, 0x05][..], // unterminated group
            &[0x52, 0x02, 0xff, 0xfe][..], // invalid UTF-8 in string field
        ] {
            let mut arena = Arena::new();
            assert!(
                decode(bad, t, &mut arena, DecodeOptions::default()).is_err(),
                "expected failure for {:02x?}",
                bad
            );
        }
    }

    #[test]
    fn test_empty_input() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = decode(&[], t, &mut arena, DecodeOptions::default()).unwrap();
        assert!(!has_field(msg, field(t, 1)));
        assert_eq!(encode_vec(msg, t).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_oneof_last_arm_wins() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let mut buf = vec![0x80, 0x01, 0x07]; // oneof_uint32 = 7
        buf.extend([0x8a, 0x01, 0x02]); // then oneof_string = "hi"
        buf.extend(b"hi");
        let msg = decode(&buf, t, &mut arena, DecodeOptions::default()).unwrap();
        assert!(!has_field(msg, field(t, 16)));
        assert!(has_field(msg, field(t, 17)));
        assert_eq!(get_string(msg, field(t, 17)).as_bytes(), b"hi");
    }

    #[test]
    fn test_repeated_submsg_growth_past_fast_capacity() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let mut buf = Vec::new();
        for i in 0..10u8 {
            buf.extend([0xa2, 0x01, 0x02, 0x08, i]);
        }
        let msg = decode(&buf, t, &mut arena, DecodeOptions::default()).unwrap();
        let arr = get_array(msg, field(t, 20)).unwrap();
        assert_eq!(arr.len(), 10);
        let nested_t = test_tables().nested;
        for i in 0..10 {
            let FieldValue::Message(m) = get_array_value(arr, i, FieldType::Message) else {
                panic!("expected message");
            };
            assert_eq!(get_int32(unsafe { &*m }, field(nested_t, 1)), i as i32);
        }
        assert_roundtrip(&buf, t);
    }

    #[test]
    fn test_accessor_set_and_encode() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = new_message(t, &mut arena).unwrap();
        set_int32(msg, field(t, 1), 150);
        set_bool(msg, field(t, 9), true);
        let out = encode_vec(msg, t).unwrap();
        assert_eq!(out, [0x08, 0x96, 0x01, 0x48, 0x01]);
    }

    #[test]
    fn test_accessor_clear() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = new_message(t, &mut arena).unwrap();
        set_int32(msg, field(t, 1), 5);
        assert!(has_field(msg, field(t, 1)));
        clear_field(msg, field(t, 1));
        assert!(!has_field(msg, field(t, 1)));
        assert_eq!(get_int32(msg, field(t, 1)), 0);
    }

    #[test]
    fn test_resize_array() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = new_message(t, &mut arena).unwrap();
        let f18 = field(t, 18);
        {
            let arr = resize_array(msg, f18, 3, &mut arena).unwrap();
            assert_eq!(arr.len(), 3);
            assert_eq!(unsafe { arr.slice::<i32>() }, &[0, 0, 0]);
            set_array_value(arr, 0, FieldValue::Int32(1));
            set_array_value(arr, 1, FieldValue::Int32(2));
            set_array_value(arr, 2, FieldValue::Int32(3));
        }
        // Growing keeps old elements; shrinking only changes the length.
        let arr = resize_array(msg, f18, 5, &mut arena).unwrap();
        assert_eq!(unsafe { arr.slice::<i32>() }, &[1, 2, 3, 0, 0]);
        let arr = resize_array(msg, f18, 2, &mut arena).unwrap();
        assert_eq!(unsafe { arr.slice::<i32>() }, &[1, 2]);
        let out = encode_vec(msg, t).unwrap();
        assert_eq!(out, [0x92, 0x01, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn test_get_mutable_message_installs() {
        let t = test_tables().table;
        let nested_t = test_tables().nested;
        let mut arena = Arena::new();
        let msg = new_message(t, &mut arena).unwrap();
        assert!(get_message(msg, field(t, 14)).is_none());
        {
            let child = get_mutable_message(msg, t, field(t, 14), &mut arena).unwrap();
            set_int32(child, field(nested_t, 1), 9);
        }
        let child = get_message(msg, field(t, 14)).unwrap();
        assert_eq!(get_int32(child, field(nested_t, 1)), 9);
        assert_eq!(encode_vec(msg, t).unwrap(), [0x72, 0x02, 0x08, 0x09]);
    }

    #[test]
    fn test_negative_int32_roundtrip() {
        let t = test_tables().table;
        // -1 as int32 is ten bytes on the wire.
        let mut buf = vec![0x08];
        buf.extend([0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]);
        let mut arena = Arena::new();
        let msg = decode(&buf, t, &mut arena, DecodeOptions::default()).unwrap();
        assert_eq!(get_int32(msg, field(t, 1)), -1);
        assert_eq!(encode_vec(msg, t).unwrap(), buf);
    }

    #[test]
    fn test_check_required() {
        use crate::tables::builder::{FieldCard, FieldSpec, build};
        let t = build(
            &[FieldSpec {
                number: 1,
                ftype: FieldType::Int32,
                card: FieldCard::Required,
                sub: 0,
            }],
            &[],
        );
        let opts = DecodeOptions {
            check_required: true,
            ..DecodeOptions::default()
        };
        let mut arena = Arena::new();
        assert_eq!(
            decode(&[], t, &mut arena, opts).unwrap_err(),
            DecodeError::MissingRequired
        );
        let mut arena = Arena::new();
        assert!(decode(&[0x08, 0x01], t, &mut arena, opts).is_ok());
    }
}
