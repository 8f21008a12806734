//! Generic wire-format decoder.
//!
//! Everything the fast path rejects lands here: field numbers outside the
//! dispatch table, varints longer than two bytes, lengths longer than one
//! byte, packed repeated encodings, groups, unknown fields, and array
//! growth. The generic path shares the fast path's [`DecodeState`] and
//! consumes exactly one field per call, so a fast-path parser can hand a
//! tag over and get control back for the next one.

use crate::arena::Arena;
use crate::base::Message;
use crate::containers::{Array, StringView};
use crate::tables::{
    FieldType, MODE_ARRAY, MODE_SCALAR, MiniTable, MiniTableField, elem_size_lg2, wire_type_of,
};
use crate::wire::{ReadCursor, WIRE_DELIMITED, WIRE_END_GROUP, zigzag_decode32, zigzag_decode64};

/// Why a decode failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeError {
    /// The input is not valid wire format for the mini-table.
    Malformed,
    /// Sub-message nesting exceeded `DecodeOptions::max_depth`.
    MaxDepthExceeded,
    /// The arena's block allocator failed.
    OutOfMemory,
    /// `check_required` was set and a required field was absent.
    MissingRequired,
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            DecodeError::Malformed => "malformed wire data",
            DecodeError::MaxDepthExceeded => "message nesting too deep",
            DecodeError::OutOfMemory => "arena allocation failed",
            DecodeError::MissingRequired => "missing required field",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for DecodeError {}

#[derive(Clone, Copy, Debug)]
pub struct DecodeOptions {
    /// Maximum sub-message nesting, groups included.
    pub max_depth: u32,
    /// Route every field through the generic decoder. The result is
    /// bit-for-bit identical; this exists for differential testing.
    pub disable_fast_path: bool,
    /// Verify that every required field of the decoded tree is present.
    pub check_required: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            max_depth: 100,
            disable_fast_path: false,
            check_required: false,
        }
    }
}

/// Sentinel for "not inside a group".
pub(crate) const NO_GROUP: u32 = u32::MAX;

/// Per-parse state shared by the fast and generic paths.
pub(crate) struct DecodeState<'a, 'alloc> {
    /// End of the current delimited region.
    pub limit: *const u8,
    /// `min(limit, fastend)`; the dispatcher only runs below this.
    pub fastlimit: *const u8,
    /// Input end minus the fast path's read slack.
    pub fastend: *const u8,
    pub depth: u32,
    /// Field number of the innermost open group, or [`NO_GROUP`].
    pub end_group: u32,
    /// Set when a matching end-group tag terminated the current scope.
    pub group_closed: bool,
    pub disable_fast: bool,
    pub err: DecodeError,
    pub arena: &'a mut Arena<'alloc>,
}

impl DecodeState<'_, '_> {
    #[inline(always)]
    pub(crate) fn set_limit(&mut self, new_limit: *const u8) -> *const u8 {
        let old = self.limit;
        self.limit = new_limit;
        self.fastlimit = new_limit.min(self.fastend);
        old
    }

    #[inline(always)]
    pub(crate) fn oom<T>(&mut self) -> Option<T> {
        self.err = DecodeError::OutOfMemory;
        None
    }
}

/// What a fast-path parser tells the dispatcher to do next.
pub(crate) enum Step {
    /// Field consumed; keep dispatching at the cursor.
    Tail(ReadCursor),
    /// Hand the tag at the cursor to the generic decoder.
    Fallback(ReadCursor),
    Error,
}

/// Result of one generic field decode.
pub(crate) enum FieldCtl {
    Ok(ReadCursor),
    /// A matching end-group tag closed the current scope.
    GroupEnd(ReadCursor),
}

fn packable(t: FieldType) -> bool {
    !matches!(
        t,
        FieldType::String | FieldType::Bytes | FieldType::Message | FieldType::Group
    )
}

fn wire_matches(field: &MiniTableField, wt: u32) -> bool {
    let primary = wire_type_of(field.descriptor_type);
    match field.cardinality() {
        MODE_SCALAR => wt == primary,
        MODE_ARRAY => {
            wt == primary || (wt == WIRE_DELIMITED && packable(field.descriptor_type))
        }
        // Map entries ride the wire as repeated messages.
        _ => wt == WIRE_DELIMITED,
    }
}

/// Decodes exactly one field (or one unknown-field record) starting at the
/// tag under `ptr`.
pub(crate) unsafe fn decode_field(
    d: &mut DecodeState<'_, '_>,
    ptr: ReadCursor,
    msg: *mut Message,
    table: &MiniTable,
) -> Option<FieldCtl> {
    let tag_start = ptr;
    let mut ptr = ptr;
    let tag = ptr.read_tag(d.limit)?;
    let num = tag >> 3;
    let wt = tag & 7;
    if num == 0 {
        return None;
    }
    if wt == WIRE_END_GROUP {
        if num == d.end_group {
            d.group_closed = true;
            return Some(FieldCtl::GroupEnd(ptr));
        }
        return None;
    }

    let field = match table.find_field_by_number(num) {
        Some(f) if wire_matches(f, wt) => f,
        _ => return unsafe { decode_unknown(d, tag_start, ptr, tag, msg) },
    };

    let ptr = if field.is_scalar() {
        unsafe { decode_scalar(d, ptr, msg, table, field, num)? }
    } else {
        unsafe { decode_repeated(d, ptr, msg, table, field, wt)? }
    };
    Some(FieldCtl::Ok(ptr))
}

unsafe fn decode_scalar(
    d: &mut DecodeState<'_, '_>,
    mut ptr: ReadCursor,
    msg: *mut Message,
    table: &MiniTable,
    field: &MiniTableField,
    num: u32,
) -> Option<ReadCursor> {
    let m = unsafe { &mut *msg };
    if let Some(idx) = field.hasbit_index() {
        m.set_has_bit(idx);
    } else if let Some(ofs) = field.oneof_case_offset() {
        m.set_oneof_case(ofs, num);
    }
    let ofs = field.offset as usize;
    match field.descriptor_type {
        FieldType::Bool => {
            let v = ptr.read_varint(d.limit)?;
            m.set::<u8>(ofs, (v != 0) as u8);
        }
        FieldType::Int32 | FieldType::UInt32 | FieldType::Enum => {
            let v = ptr.read_varint(d.limit)?;
            m.set::<u32>(ofs, v as u32);
        }
        FieldType::Int64 | FieldType::UInt64 => {
            let v = ptr.read_varint(d.limit)?;
            m.set::<u64>(ofs, v);
        }
        FieldType::SInt32 => {
            let v = ptr.read_varint(d.limit)?;
            m.set::<i32>(ofs, zigzag_decode32(v as u32));
        }
        FieldType::SInt64 => {
            let v = ptr.read_varint(d.limit)?;
            m.set::<i64>(ofs, zigzag_decode64(v));
        }
        FieldType::Fixed32 | FieldType::SFixed32 | FieldType::Float => {
            let v = ptr.read_fixed::<u32>(d.limit)?;
            m.set::<u32>(ofs, v);
        }
        FieldType::Fixed64 | FieldType::SFixed64 | FieldType::Double => {
            let v = ptr.read_fixed::<u64>(d.limit)?;
            m.set::<u64>(ofs, v);
        }
        FieldType::String | FieldType::Bytes => {
            let len = ptr.read_size(d.limit)?;
            let slice = ptr.read_slice(len, d.limit)?;
            if matches!(field.descriptor_type, FieldType::String)
                && core::str::from_utf8(slice).is_err()
            {
                return None;
            }
            m.set::<StringView>(ofs, StringView::from_slice(slice));
        }
        FieldType::Message => {
            let sub = table.sub_table(field);
            let slot: &mut *mut Message = m.ref_mut(ofs);
            if slot.is_null() {
                *slot = match Message::create_raw(sub.size, d.arena) {
                    Some(p) => p.as_ptr(),
                    None => return d.oom(),
                };
            }
            let child = *slot;
            return unsafe { decode_delimited_msg(d, ptr, child, sub) };
        }
        FieldType::Group => {
            let sub = table.sub_table(field);
            let slot: &mut *mut Message = m.ref_mut(ofs);
            if slot.is_null() {
                *slot = match Message::create_raw(sub.size, d.arena) {
                    Some(p) => p.as_ptr(),
                    None => return d.oom(),
                };
            }
            let child = *slot;
            return unsafe { decode_group_msg(d, ptr, child, sub, num) };
        }
    }
    Some(ptr)
}

/// Length-prefixed sub-message body: narrow the limits, dispatch, restore.
pub(crate) unsafe fn decode_delimited_msg(
    d: &mut DecodeState<'_, '_>,
    mut ptr: ReadCursor,
    child: *mut Message,
    sub: &MiniTable,
) -> Option<ReadCursor> {
    let len = ptr.read_size(d.limit)?;
    let sub_end = ptr.as_const() as usize + len;
    if sub_end > d.limit as usize {
        return None;
    }
    let sub_end = sub_end as *const u8;
    if d.depth == 0 {
        d.err = DecodeError::MaxDepthExceeded;
        return None;
    }
    d.depth -= 1;
    let saved_limit = d.set_limit(sub_end);
    let saved_group = d.end_group;
    d.end_group = NO_GROUP;
    let p = unsafe { crate::decode_fast::dispatch(d, ptr, child, sub, 0)? };
    if p.as_const() != d.limit {
        return None;
    }
    d.set_limit(saved_limit);
    d.end_group = saved_group;
    d.depth += 1;
    Some(p)
}

/// Group body: same limit, terminated by the matching end-group tag.
unsafe fn decode_group_msg(
    d: &mut DecodeState<'_, '_>,
    ptr: ReadCursor,
    child: *mut Message,
    sub: &MiniTable,
    num: u32,
) -> Option<ReadCursor> {
    if d.depth == 0 {
        d.err = DecodeError::MaxDepthExceeded;
        return None;
    }
    d.depth -= 1;
    let saved_group = d.end_group;
    d.end_group = num;
    let p = unsafe { crate::decode_fast::dispatch(d, ptr, child, sub, 0)? };
    if !d.group_closed {
        // Hit the limit before the end-group tag.
        return None;
    }
    d.group_closed = false;
    d.end_group = saved_group;
    d.depth += 1;
    Some(p)
}

unsafe fn get_or_create_array<'x>(
    d: &mut DecodeState<'_, '_>,
    msg: *mut Message,
    field: &MiniTableField,
) -> Option<&'x mut Array> {
    let slot: &mut *mut Array = unsafe { (*msg).ref_mut(field.offset as usize) };
    if slot.is_null() {
        let lg2 = elem_size_lg2(field.descriptor_type);
        *slot = Array::new_raw(d.arena, 4, lg2)?.as_ptr();
    }
    Some(unsafe { &mut **slot })
}

unsafe fn decode_repeated(
    d: &mut DecodeState<'_, '_>,
    mut ptr: ReadCursor,
    msg: *mut Message,
    table: &MiniTable,
    field: &MiniTableField,
    wt: u32,
) -> Option<ReadCursor> {
    let arr = match unsafe { get_or_create_array(d, msg, field) } {
        Some(a) => a,
        None => return d.oom(),
    };
    match field.descriptor_type {
        FieldType::Message => {
            let sub = table.sub_table(field);
            let child = match Message::create_raw(sub.size, d.arena) {
                Some(p) => p.as_ptr(),
                None => return d.oom(),
            };
            if !unsafe { arr.push::<*mut Message>(child, d.arena) } {
                return d.oom();
            }
            unsafe { decode_delimited_msg(d, ptr, child, sub) }
        }
        FieldType::Group => {
            let sub = table.sub_table(field);
            let child = match Message::create_raw(sub.size, d.arena) {
                Some(p) => p.as_ptr(),
                None => return d.oom(),
            };
            if !unsafe { arr.push::<*mut Message>(child, d.arena) } {
                return d.oom();
            }
            let num = field.number;
            unsafe { decode_group_msg(d, ptr, child, sub, num) }
        }
        FieldType::String | FieldType::Bytes => {
            let len = ptr.read_size(d.limit)?;
            let slice = ptr.read_slice(len, d.limit)?;
            if matches!(field.descriptor_type, FieldType::String)
                && core::str::from_utf8(slice).is_err()
            {
                return None;
            }
            if !unsafe { arr.push(StringView::from_slice(slice), d.arena) } {
                return d.oom();
            }
            Some(ptr)
        }
        t => {
            if wt == WIRE_DELIMITED {
                // Packed run of scalars.
                let len = ptr.read_size(d.limit)?;
                let end = ptr.as_const() as usize + len;
                if end > d.limit as usize {
                    return None;
                }
                let end = end as *const u8;
                while ptr.as_const() < end {
                    unsafe { decode_packed_elem(d, &mut ptr, arr, t, end)? };
                }
                if ptr.as_const() != end {
                    return None;
                }
                Some(ptr)
            } else {
                let limit = d.limit;
                unsafe { decode_packed_elem(d, &mut ptr, arr, t, limit)? };
                Some(ptr)
            }
        }
    }
}

unsafe fn decode_packed_elem(
    d: &mut DecodeState<'_, '_>,
    ptr: &mut ReadCursor,
    arr: &mut Array,
    t: FieldType,
    limit: *const u8,
) -> Option<()> {
    let ok = match t {
        FieldType::Bool => {
            let v = ptr.read_varint(limit)?;
            unsafe { arr.push::<u8>((v != 0) as u8, d.arena) }
        }
        FieldType::Int32 | FieldType::UInt32 | FieldType::Enum => {
            let v = ptr.read_varint(limit)?;
            unsafe { arr.push::<u32>(v as u32, d.arena) }
        }
        FieldType::Int64 | FieldType::UInt64 => {
            let v = ptr.read_varint(limit)?;
            unsafe { arr.push::<u64>(v, d.arena) }
        }
        FieldType::SInt32 => {
            let v = ptr.read_varint(limit)?;
            unsafe { arr.push::<i32>(zigzag_decode32(v as u32), d.arena) }
        }
        FieldType::SInt64 => {
            let v = ptr.read_varint(limit)?;
            unsafe { arr.push::<i64>(zigzag_decode64(v), d.arena) }
        }
        FieldType::Fixed32 | FieldType::SFixed32 | FieldType::Float => {
            let v = ptr.read_fixed::<u32>(limit)?;
            unsafe { arr.push::<u32>(v, d.arena) }
        }
        FieldType::Fixed64 | FieldType::SFixed64 | FieldType::Double => {
            let v = ptr.read_fixed::<u64>(limit)?;
            unsafe { arr.push::<u64>(v, d.arena) }
        }
        _ => return None,
    };
    if !ok {
        return d.oom();
    }
    Some(())
}

/// Skips an unrecognized field's value and copies the raw record (tag
/// included) to the message's unknown buffer so re-encoding preserves it.
unsafe fn decode_unknown(
    d: &mut DecodeState<'_, '_>,
    tag_start: ReadCursor,
    mut ptr: ReadCursor,
    tag: u32,
    msg: *mut Message,
) -> Option<FieldCtl> {
    let num = tag >> 3;
    match tag & 7 {
        0 => {
            ptr.read_varint(d.limit)?;
        }
        1 => {
            ptr.read_fixed::<u64>(d.limit)?;
        }
        2 => {
            let len = ptr.read_size(d.limit)?;
            ptr.read_slice(len, d.limit)?;
        }
        3 => {
            unsafe { skip_group_body(d, &mut ptr, num)? };
        }
        5 => {
            ptr.read_fixed::<u32>(d.limit)?;
        }
        _ => return None,
    }
    let len = ptr.as_const() as usize - tag_start.as_const() as usize;
    let raw = unsafe { core::slice::from_raw_parts(tag_start.as_const(), len) };
    if !unsafe { (*msg).append_unknown(raw, d.arena) } {
        return d.oom();
    }
    Some(FieldCtl::Ok(ptr))
}

unsafe fn skip_group_body(
    d: &mut DecodeState<'_, '_>,
    ptr: &mut ReadCursor,
    open_num: u32,
) -> Option<()> {
    if d.depth == 0 {
        d.err = DecodeError::MaxDepthExceeded;
        return None;
    }
    d.depth -= 1;
    loop {
        let tag = ptr.read_tag(d.limit)?;
        let num = tag >> 3;
        if num == 0 {
            return None;
        }
        match tag & 7 {
            0 => {
                ptr.read_varint(d.limit)?;
            }
            1 => {
                ptr.read_fixed::<u64>(d.limit)?;
            }
            2 => {
                let len = ptr.read_size(d.limit)?;
                ptr.read_slice(len, d.limit)?;
            }
            3 => {
                unsafe { skip_group_body(d, ptr, num)? };
            }
            4 => {
                if num != open_num {
                    return None;
                }
                d.depth += 1;
                return Some(());
            }
            5 => {
                ptr.read_fixed::<u32>(d.limit)?;
            }
            _ => return None,
        }
    }
}

/// Post-parse required-field verification, walking the decoded tree.
pub(crate) unsafe fn has_required_fields(msg: *const Message, table: &MiniTable) -> bool {
    let m = unsafe { &*msg };
    for field in table.fields {
        if field.is_required() {
            let present = if let Some(idx) = field.hasbit_index() {
                m.has_bit(idx)
            } else if field.is_sub_message() {
                !m.get::<*const Message>(field.offset as usize).is_null()
            } else {
                true
            };
            if !present {
                return false;
            }
        }
        if !field.is_sub_message() {
            continue;
        }
        let sub = table.sub_table(field);
        if field.is_scalar() {
            if field.oneof_case_offset().is_some_and(|ofs| m.oneof_case(ofs) != field.number) {
                continue;
            }
            let child = m.get::<*const Message>(field.offset as usize);
            if !child.is_null() && !unsafe { has_required_fields(child, sub) } {
                return false;
            }
        } else {
            let arr = m.get::<*const Array>(field.offset as usize);
            if arr.is_null() {
                continue;
            }
            let elems: &[*const Message] = unsafe { (*arr).slice() };
            for &child in elems {
                if !unsafe { has_required_fields(child, sub) } {
                    return false;
                }
            }
        }
    }
    true
}
