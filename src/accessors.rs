//! Typed field accessors.
//!
//! Everything here is keyed by a [`MiniTableField`]: the field record says
//! where the value lives and how presence is tracked, the accessor supplies
//! the type. Using an accessor whose type does not match the field's
//! descriptor type is a programming error; debug builds assert on it.

use allocator_api2::alloc::AllocError;

use crate::arena::Arena;
use crate::base::Message;
use crate::containers::{Array, StringView};
use crate::tables::{FieldType, MiniTable, MiniTableField, elem_size_lg2};

/// A dynamically-typed field or array-element value.
#[derive(Clone, Copy, Debug)]
pub enum FieldValue {
    Bool(bool),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(StringView),
    Message(*const Message),
    Array(*const Array),
}

fn set_presence(msg: &mut Message, field: &MiniTableField) {
    if let Some(idx) = field.hasbit_index() {
        msg.set_has_bit(idx);
    } else if let Some(ofs) = field.oneof_case_offset() {
        msg.set_oneof_case(ofs, field.number);
    }
}

/// Presence check. Proto3 scalars without explicit presence always report
/// false; message fields report whether the pointer is set.
pub fn has_field(msg: &Message, field: &MiniTableField) -> bool {
    if let Some(idx) = field.hasbit_index() {
        return msg.has_bit(idx);
    }
    if let Some(ofs) = field.oneof_case_offset() {
        return msg.oneof_case(ofs) == field.number;
    }
    if field.is_scalar() && field.is_sub_message() {
        return !msg.get::<*const Message>(field.offset as usize).is_null();
    }
    false
}

/// Clears presence and zeroes the value slot.
pub fn clear_field(msg: &mut Message, field: &MiniTableField) {
    if let Some(idx) = field.hasbit_index() {
        msg.clear_has_bit(idx);
    } else if let Some(ofs) = field.oneof_case_offset() {
        if msg.oneof_case(ofs) != field.number {
            return; // A different arm is live; nothing to clear.
        }
        msg.set_oneof_case(ofs, 0);
    }
    let size = if field.is_scalar() {
        match field.descriptor_type {
            FieldType::Bool => 1,
            FieldType::String | FieldType::Bytes => core::mem::size_of::<StringView>(),
            FieldType::Int32
            | FieldType::UInt32
            | FieldType::SInt32
            | FieldType::Enum
            | FieldType::Fixed32
            | FieldType::SFixed32
            | FieldType::Float => 4,
            _ => 8,
        }
    } else {
        core::mem::size_of::<*const Array>()
    };
    unsafe {
        core::ptr::write_bytes(msg.base_mut().add(field.offset as usize), 0, size);
    }
}

pub fn get_bool(msg: &Message, field: &MiniTableField) -> bool {
    debug_assert!(matches!(field.descriptor_type, FieldType::Bool));
    msg.get::<u8>(field.offset as usize) != 0
}

pub fn set_bool(msg: &mut Message, field: &MiniTableField, value: bool) {
    debug_assert!(matches!(field.descriptor_type, FieldType::Bool));
    set_presence(msg, field);
    msg.set::<u8>(field.offset as usize, value as u8);
}

pub fn get_int32(msg: &Message, field: &MiniTableField) -> i32 {
    debug_assert!(matches!(
        field.descriptor_type,
        FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32
    ));
    msg.get(field.offset as usize)
}

pub fn set_int32(msg: &mut Message, field: &MiniTableField, value: i32) {
    debug_assert!(matches!(
        field.descriptor_type,
        FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32
    ));
    set_presence(msg, field);
    msg.set(field.offset as usize, value);
}

pub fn get_uint32(msg: &Message, field: &MiniTableField) -> u32 {
    debug_assert!(matches!(
        field.descriptor_type,
        FieldType::UInt32 | FieldType::Fixed32
    ));
    msg.get(field.offset as usize)
}

pub fn set_uint32(msg: &mut Message, field: &MiniTableField, value: u32) {
    debug_assert!(matches!(
        field.descriptor_type,
        FieldType::UInt32 | FieldType::Fixed32
    ));
    set_presence(msg, field);
    msg.set(field.offset as usize, value);
}

pub fn get_int64(msg: &Message, field: &MiniTableField) -> i64 {
    debug_assert!(matches!(
        field.descriptor_type,
        FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64
    ));
    msg.get(field.offset as usize)
}

pub fn set_int64(msg: &mut Message, field: &MiniTableField, value: i64) {
    debug_assert!(matches!(
        field.descriptor_type,
        FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64
    ));
    set_presence(msg, field);
    msg.set(field.offset as usize, value);
}

pub fn get_uint64(msg: &Message, field: &MiniTableField) -> u64 {
    debug_assert!(matches!(
        field.descriptor_type,
        FieldType::UInt64 | FieldType::Fixed64
    ));
    msg.get(field.offset as usize)
}

pub fn set_uint64(msg: &mut Message, field: &MiniTableField, value: u64) {
    debug_assert!(matches!(
        field.descriptor_type,
        FieldType::UInt64 | FieldType::Fixed64
    ));
    set_presence(msg, field);
    msg.set(field.offset as usize, value);
}

pub fn get_float(msg: &Message, field: &MiniTableField) -> f32 {
    debug_assert!(matches!(field.descriptor_type, FieldType::Float));
    msg.get(field.offset as usize)
}

pub fn set_float(msg: &mut Message, field: &MiniTableField, value: f32) {
    debug_assert!(matches!(field.descriptor_type, FieldType::Float));
    set_presence(msg, field);
    msg.set(field.offset as usize, value);
}

pub fn get_double(msg: &Message, field: &MiniTableField) -> f64 {
    debug_assert!(matches!(field.descriptor_type, FieldType::Double));
    msg.get(field.offset as usize)
}

pub fn set_double(msg: &mut Message, field: &MiniTableField, value: f64) {
    debug_assert!(matches!(field.descriptor_type, FieldType::Double));
    set_presence(msg, field);
    msg.set(field.offset as usize, value);
}

pub fn get_enum(msg: &Message, field: &MiniTableField) -> i32 {
    debug_assert!(matches!(field.descriptor_type, FieldType::Enum));
    msg.get(field.offset as usize)
}

pub fn set_enum(msg: &mut Message, field: &MiniTableField, value: i32) {
    debug_assert!(matches!(field.descriptor_type, FieldType::Enum));
    set_presence(msg, field);
    msg.set(field.offset as usize, value);
}

/// Returns the stored view. For decoded messages this aliases the input
/// buffer; the borrow rules on `decode` keep that buffer alive.
pub fn get_string(msg: &Message, field: &MiniTableField) -> StringView {
    debug_assert!(matches!(
        field.descriptor_type,
        FieldType::String | FieldType::Bytes
    ));
    msg.get(field.offset as usize)
}

pub fn set_string(msg: &mut Message, field: &MiniTableField, value: StringView) {
    debug_assert!(matches!(
        field.descriptor_type,
        FieldType::String | FieldType::Bytes
    ));
    set_presence(msg, field);
    msg.set(field.offset as usize, value);
}

pub fn get_message<'a>(msg: &'a Message, field: &MiniTableField) -> Option<&'a Message> {
    debug_assert!(field.is_sub_message() && field.is_scalar());
    let ptr = msg.get::<*const Message>(field.offset as usize);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

pub fn set_message(msg: &mut Message, field: &MiniTableField, value: *mut Message) {
    debug_assert!(field.is_sub_message() && field.is_scalar());
    set_presence(msg, field);
    msg.set(field.offset as usize, value);
}

/// Returns the sub-message, allocating and installing a fresh one of the
/// field's sub-layout if none is present.
pub fn get_mutable_message<'a>(
    msg: &'a mut Message,
    table: &MiniTable,
    field: &MiniTableField,
    arena: &mut Arena<'_>,
) -> Result<&'a mut Message, AllocError> {
    debug_assert!(field.is_sub_message() && field.is_scalar());
    let existing = msg.get::<*mut Message>(field.offset as usize);
    let child = if existing.is_null() {
        let sub = table.sub_table(field);
        let fresh = Message::create_raw(sub.size, arena).ok_or(AllocError)?;
        msg.set(field.offset as usize, fresh.as_ptr());
        set_presence(msg, field);
        fresh.as_ptr()
    } else {
        existing
    };
    Ok(unsafe { &mut *child })
}

pub fn get_array<'a>(msg: &'a Message, field: &MiniTableField) -> Option<&'a Array> {
    debug_assert!(!field.is_scalar());
    let ptr = msg.get::<*const Array>(field.offset as usize);
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

/// Sets the array's length to `new_len`, allocating the array and growing
/// its backing store as needed. New elements are zeroed. The allocation
/// never shrinks.
pub fn resize_array<'a>(
    msg: &'a mut Message,
    field: &MiniTableField,
    new_len: usize,
    arena: &mut Arena<'_>,
) -> Result<&'a mut Array, AllocError> {
    debug_assert!(!field.is_scalar());
    let slot = msg.ref_mut::<*mut Array>(field.offset as usize);
    if slot.is_null() {
        let lg2 = elem_size_lg2(field.descriptor_type);
        *slot = Array::new_raw(arena, new_len.max(4), lg2)
            .ok_or(AllocError)?
            .as_ptr();
    }
    let arr = unsafe { &mut **slot };
    if !arr.reserve(new_len, arena) {
        return Err(AllocError);
    }
    let old_len = arr.len();
    if new_len > old_len {
        let lg2 = arr.elem_lg2();
        unsafe {
            core::ptr::write_bytes(
                arr.data_ptr().add(old_len << lg2),
                0,
                (new_len - old_len) << lg2,
            );
        }
    }
    arr.set_len(new_len);
    Ok(arr)
}

/// Reads element `index`; `t` is the field's descriptor type.
pub fn get_array_value(arr: &Array, index: usize, t: FieldType) -> FieldValue {
    assert!(index < arr.len());
    unsafe {
        match t {
            FieldType::Bool => FieldValue::Bool(arr.slice::<u8>()[index] != 0),
            FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 => {
                FieldValue::Int32(arr.slice::<i32>()[index])
            }
            FieldType::Enum => FieldValue::Int32(arr.slice::<i32>()[index]),
            FieldType::UInt32 | FieldType::Fixed32 => FieldValue::UInt32(arr.slice::<u32>()[index]),
            FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => {
                FieldValue::Int64(arr.slice::<i64>()[index])
            }
            FieldType::UInt64 | FieldType::Fixed64 => FieldValue::UInt64(arr.slice::<u64>()[index]),
            FieldType::Float => FieldValue::Float(arr.slice::<f32>()[index]),
            FieldType::Double => FieldValue::Double(arr.slice::<f64>()[index]),
            FieldType::String | FieldType::Bytes => {
                FieldValue::String(arr.slice::<StringView>()[index])
            }
            FieldType::Message | FieldType::Group => {
                FieldValue::Message(arr.slice::<*const Message>()[index])
            }
        }
    }
}

/// Overwrites element `index`. The value's variant must match the array's
/// element size.
pub fn set_array_value(arr: &mut Array, index: usize, value: FieldValue) {
    assert!(index < arr.len());
    unsafe {
        match value {
            FieldValue::Bool(v) => arr.slice_mut::<u8>()[index] = v as u8,
            FieldValue::Int32(v) => arr.slice_mut::<i32>()[index] = v,
            FieldValue::UInt32(v) => arr.slice_mut::<u32>()[index] = v,
            FieldValue::Int64(v) => arr.slice_mut::<i64>()[index] = v,
            FieldValue::UInt64(v) => arr.slice_mut::<u64>()[index] = v,
            FieldValue::Float(v) => arr.slice_mut::<f32>()[index] = v,
            FieldValue::Double(v) => arr.slice_mut::<f64>()[index] = v,
            FieldValue::String(v) => arr.slice_mut::<StringView>()[index] = v,
            FieldValue::Message(v) => arr.slice_mut::<*const Message>()[index] = v,
            FieldValue::Array(_) => unreachable!("arrays do not nest"),
        }
    }
}
