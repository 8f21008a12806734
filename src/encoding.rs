//! Wire-format encoder.
//!
//! Serializes back-to-front: the cursor starts at the end of the buffer, so
//! a sub-message's length is simply how far the cursor moved while its body
//! was written, and no size precomputation pass is needed. Fields are walked
//! in descending number order, which makes the output ascending; unknown
//! fields are written first and therefore come out at the message tail.

use crate::base::Message;
use crate::containers::{Array, StringView};
use crate::tables::{FieldType, MODE_SCALAR, MiniTable, MiniTableField};
use crate::wire::{
    WIRE_DELIMITED, WIRE_END_GROUP, WIRE_FIXED32, WIRE_FIXED64, WIRE_START_GROUP, WIRE_VARINT,
    WriteCursor, zigzag_encode32, zigzag_encode64,
};

use alloc::vec::Vec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodeError {
    /// The output buffer cannot hold the message.
    BufferTooSmall,
    /// Sub-message nesting exceeded the encoder's depth cap.
    TooDeep,
}

impl core::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            EncodeError::BufferTooSmall => "output buffer too small",
            EncodeError::TooDeep => "message nesting too deep",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for EncodeError {}

const ENCODE_MAX_DEPTH: u32 = 100;

#[inline(always)]
fn check(r: Option<()>) -> Result<(), EncodeError> {
    r.ok_or(EncodeError::BufferTooSmall)
}

/// Serializes `msg` into the tail of `buf`, returning the written slice.
pub fn encode<'buf>(
    msg: &Message,
    table: &MiniTable,
    buf: &'buf mut [u8],
) -> Result<&'buf [u8], EncodeError> {
    let start = buf.as_ptr() as usize;
    let mut w = WriteCursor::new(buf);
    encode_message(&mut w, msg, table, ENCODE_MAX_DEPTH)?;
    let offset = w.pos() as usize - start;
    Ok(&buf[offset..])
}

/// Serializes into a freshly-allocated vector, growing as needed.
pub fn encode_vec(msg: &Message, table: &MiniTable) -> Result<Vec<u8>, EncodeError> {
    let mut cap = 64usize;
    loop {
        let mut buf = alloc::vec![0u8; cap];
        match encode(msg, table, &mut buf) {
            Ok(slice) => return Ok(slice.to_vec()),
            Err(EncodeError::BufferTooSmall) if cap < (1 << 30) => cap *= 2,
            Err(e) => return Err(e),
        }
    }
}

fn encode_message(
    w: &mut WriteCursor,
    msg: &Message,
    table: &MiniTable,
    depth: u32,
) -> Result<(), EncodeError> {
    if depth == 0 {
        return Err(EncodeError::TooDeep);
    }
    let unknown = msg.unknown_bytes();
    if !unknown.is_empty() {
        check(w.write_slice(unknown))?;
    }
    for field in table.fields.iter().rev() {
        if field.cardinality() == MODE_SCALAR {
            encode_scalar(w, msg, table, field, depth)?;
        } else {
            encode_repeated(w, msg, table, field, depth)?;
        }
    }
    Ok(())
}

fn scalar_present(msg: &Message, field: &MiniTableField) -> bool {
    if let Some(idx) = field.hasbit_index() {
        return msg.has_bit(idx);
    }
    if let Some(ofs) = field.oneof_case_offset() {
        return msg.oneof_case(ofs) == field.number;
    }
    let ofs = field.offset as usize;
    if field.is_sub_message() {
        return !msg.get::<*const Message>(ofs).is_null();
    }
    // Implicit presence: emit only non-default values.
    match field.descriptor_type {
        FieldType::Bool => msg.get::<u8>(ofs) != 0,
        FieldType::String | FieldType::Bytes => !msg.get::<StringView>(ofs).is_empty(),
        FieldType::Int32
        | FieldType::UInt32
        | FieldType::SInt32
        | FieldType::Enum
        | FieldType::Fixed32
        | FieldType::SFixed32
        | FieldType::Float => msg.get::<u32>(ofs) != 0,
        _ => msg.get::<u64>(ofs) != 0,
    }
}

fn encode_scalar(
    w: &mut WriteCursor,
    msg: &Message,
    table: &MiniTable,
    field: &MiniTableField,
    depth: u32,
) -> Result<(), EncodeError> {
    if !scalar_present(msg, field) {
        return Ok(());
    }
    let num = field.number;
    let ofs = field.offset as usize;
    match field.descriptor_type {
        FieldType::Bool => {
            check(w.write_varint((msg.get::<u8>(ofs) != 0) as u64))?;
            check(w.write_tag(num, WIRE_VARINT))?;
        }
        FieldType::Int32 | FieldType::Enum => {
            // Negative int32 goes on the wire sign-extended to ten bytes.
            check(w.write_varint(msg.get::<i32>(ofs) as i64 as u64))?;
            check(w.write_tag(num, WIRE_VARINT))?;
        }
        FieldType::UInt32 => {
            check(w.write_varint(msg.get::<u32>(ofs) as u64))?;
            check(w.write_tag(num, WIRE_VARINT))?;
        }
        FieldType::Int64 | FieldType::UInt64 => {
            check(w.write_varint(msg.get::<u64>(ofs)))?;
            check(w.write_tag(num, WIRE_VARINT))?;
        }
        FieldType::SInt32 => {
            check(w.write_varint(zigzag_encode32(msg.get::<i32>(ofs)) as u64))?;
            check(w.write_tag(num, WIRE_VARINT))?;
        }
        FieldType::SInt64 => {
            check(w.write_varint(zigzag_encode64(msg.get::<i64>(ofs))))?;
            check(w.write_tag(num, WIRE_VARINT))?;
        }
        FieldType::Fixed32 | FieldType::SFixed32 | FieldType::Float => {
            check(w.write_fixed(msg.get::<u32>(ofs)))?;
            check(w.write_tag(num, WIRE_FIXED32))?;
        }
        FieldType::Fixed64 | FieldType::SFixed64 | FieldType::Double => {
            check(w.write_fixed(msg.get::<u64>(ofs)))?;
            check(w.write_tag(num, WIRE_FIXED64))?;
        }
        FieldType::String | FieldType::Bytes => {
            let view = msg.get::<StringView>(ofs);
            check(w.write_slice(view.as_bytes()))?;
            check(w.write_varint(view.len() as u64))?;
            check(w.write_tag(num, WIRE_DELIMITED))?;
        }
        FieldType::Message => {
            let child = msg.get::<*const Message>(ofs);
            let mark = w.pos();
            encode_message(w, unsafe { &*child }, table.sub_table(field), depth - 1)?;
            check(w.write_varint(w.written_since(mark) as u64))?;
            check(w.write_tag(num, WIRE_DELIMITED))?;
        }
        FieldType::Group => {
            let child = msg.get::<*const Message>(ofs);
            check(w.write_tag(num, WIRE_END_GROUP))?;
            encode_message(w, unsafe { &*child }, table.sub_table(field), depth - 1)?;
            check(w.write_tag(num, WIRE_START_GROUP))?;
        }
    }
    Ok(())
}

fn encode_repeated(
    w: &mut WriteCursor,
    msg: &Message,
    table: &MiniTable,
    field: &MiniTableField,
    depth: u32,
) -> Result<(), EncodeError> {
    let arr = msg.get::<*const Array>(field.offset as usize);
    if arr.is_null() {
        return Ok(());
    }
    let arr = unsafe { &*arr };
    if arr.is_empty() {
        return Ok(());
    }
    let num = field.number;
    match field.descriptor_type {
        FieldType::Message => {
            let sub = table.sub_table(field);
            let elems: &[*const Message] = unsafe { arr.slice() };
            for &child in elems.iter().rev() {
                let mark = w.pos();
                encode_message(w, unsafe { &*child }, sub, depth - 1)?;
                check(w.write_varint(w.written_since(mark) as u64))?;
                check(w.write_tag(num, WIRE_DELIMITED))?;
            }
        }
        FieldType::Group => {
            let sub = table.sub_table(field);
            let elems: &[*const Message] = unsafe { arr.slice() };
            for &child in elems.iter().rev() {
                check(w.write_tag(num, WIRE_END_GROUP))?;
                encode_message(w, unsafe { &*child }, sub, depth - 1)?;
                check(w.write_tag(num, WIRE_START_GROUP))?;
            }
        }
        FieldType::String | FieldType::Bytes => {
            let elems: &[StringView] = unsafe { arr.slice() };
            for view in elems.iter().rev() {
                check(w.write_slice(view.as_bytes()))?;
                check(w.write_varint(view.len() as u64))?;
                check(w.write_tag(num, WIRE_DELIMITED))?;
            }
        }
        t => {
            if field.is_packed() {
                let mark = w.pos();
                encode_packed_payload(w, arr, t)?;
                check(w.write_varint(w.written_since(mark) as u64))?;
                check(w.write_tag(num, WIRE_DELIMITED))?;
            } else {
                encode_unpacked_elems(w, arr, t, num)?;
            }
        }
    }
    Ok(())
}

fn encode_packed_payload(w: &mut WriteCursor, arr: &Array, t: FieldType) -> Result<(), EncodeError> {
    match t {
        FieldType::Bool => {
            for &v in unsafe { arr.slice::<u8>() }.iter().rev() {
                check(w.write_varint((v != 0) as u64))?;
            }
        }
        FieldType::Int32 | FieldType::Enum => {
            for &v in unsafe { arr.slice::<i32>() }.iter().rev() {
                check(w.write_varint(v as i64 as u64))?;
            }
        }
        FieldType::UInt32 => {
            for &v in unsafe { arr.slice::<u32>() }.iter().rev() {
                check(w.write_varint(v as u64))?;
            }
        }
        FieldType::Int64 | FieldType::UInt64 => {
            for &v in unsafe { arr.slice::<u64>() }.iter().rev() {
                check(w.write_varint(v))?;
            }
        }
        FieldType::SInt32 => {
            for &v in unsafe { arr.slice::<i32>() }.iter().rev() {
                check(w.write_varint(zigzag_encode32(v) as u64))?;
            }
        }
        FieldType::SInt64 => {
            for &v in unsafe { arr.slice::<i64>() }.iter().rev() {
                check(w.write_varint(zigzag_encode64(v)))?;
            }
        }
        FieldType::Fixed32 | FieldType::SFixed32 | FieldType::Float => {
            for &v in unsafe { arr.slice::<u32>() }.iter().rev() {
                check(w.write_fixed(v))?;
            }
        }
        _ => {
            for &v in unsafe { arr.slice::<u64>() }.iter().rev() {
                check(w.write_fixed(v))?;
            }
        }
    }
    Ok(())
}

fn encode_unpacked_elems(
    w: &mut WriteCursor,
    arr: &Array,
    t: FieldType,
    num: u32,
) -> Result<(), EncodeError> {
    match t {
        FieldType::Bool => {
            for &v in unsafe { arr.slice::<u8>() }.iter().rev() {
                check(w.write_varint((v != 0) as u64))?;
                check(w.write_tag(num, WIRE_VARINT))?;
            }
        }
        FieldType::Int32 | FieldType::Enum => {
            for &v in unsafe { arr.slice::<i32>() }.iter().rev() {
                check(w.write_varint(v as i64 as u64))?;
                check(w.write_tag(num, WIRE_VARINT))?;
            }
        }
        FieldType::UInt32 => {
            for &v in unsafe { arr.slice::<u32>() }.iter().rev() {
                check(w.write_varint(v as u64))?;
                check(w.write_tag(num, WIRE_VARINT))?;
            }
        }
        FieldType::Int64 | FieldType::UInt64 => {
            for &v in unsafe { arr.slice::<u64>() }.iter().rev() {
                check(w.write_varint(v))?;
                check(w.write_tag(num, WIRE_VARINT))?;
            }
        }
        FieldType::SInt32 => {
            for &v in unsafe { arr.slice::<i32>() }.iter().rev() {
                check(w.write_varint(zigzag_encode32(v) as u64))?;
                check(w.write_tag(num, WIRE_VARINT))?;
            }
        }
        FieldType::SInt64 => {
            for &v in unsafe { arr.slice::<i64>() }.iter().rev() {
                check(w.write_varint(zigzag_encode64(v)))?;
                check(w.write_tag(num, WIRE_VARINT))?;
            }
        }
        FieldType::Fixed32 | FieldType::SFixed32 | FieldType::Float => {
            for &v in unsafe { arr.slice::<u32>() }.iter().rev() {
                check(w.write_fixed(v))?;
                check(w.write_tag(num, WIRE_FIXED32))?;
            }
        }
        _ => {
            for &v in unsafe { arr.slice::<u64>() }.iter().rev() {
                check(w.write_fixed(v))?;
                check(w.write_tag(num, WIRE_FIXED64))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessors::{set_bool, set_int32, set_string};
    use crate::arena::Arena;
    use crate::containers::StringView;
    use crate::test_utils::test_tables;

    #[test]
    fn test_encode_into_tail_of_buffer() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = crate::new_message(t, &mut arena).unwrap();
        set_int32(msg, t.find_field_by_number(1).unwrap(), 1);
        set_bool(msg, t.find_field_by_number(9).unwrap(), true);
        let mut buf = [0u8; 32];
        let out = encode(msg, t, &mut buf).unwrap();
        assert_eq!(out, [0x08, 0x01, 0x48, 0x01]);
        // The written slice is the tail of the caller's buffer.
        assert_eq!(out.as_ptr() as usize + out.len(), buf.as_ptr() as usize + 32);
    }

    #[test]
    fn test_encode_buffer_too_small() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = crate::new_message(t, &mut arena).unwrap();
        set_string(
            msg,
            t.find_field_by_number(10).unwrap(),
            StringView::from_slice(b"a string that will not fit"),
        );
        let mut buf = [0u8; 8];
        assert_eq!(encode(msg, t, &mut buf), Err(EncodeError::BufferTooSmall));
        // encode_vec grows until it fits.
        let out = encode_vec(msg, t).unwrap();
        assert_eq!(&out[2..], b"a string that will not fit");
    }
}
