//! Dispatch-driven fast-path decoder.
//!
//! The dispatcher prefetches two tag bytes, indexes the mini-table's 32-slot
//! parser array with `(tag & 0xf8) >> 3`, and XORs the prefetch against the
//! slot's packed data word: when the low one or two bytes come out zero the
//! tag matched and the rest of the word carries the field's offset, hasbit
//! mask and oneof case in known bit positions. One indirect call per field.
//!
//! Rust gives no tail-call guarantee, so the C-style threaded loop becomes a
//! trampoline: parsers return a [`Step`] and the driver keeps dispatching.
//! Parsers bail to the generic decoder on tag mismatch, varints longer than
//! two bytes, string lengths longer than one byte, or full repeated arrays;
//! sub-messages recurse into the driver with narrowed limits.
//!
//! Data word layout, per cardinality (low bits always the expected tag):
//!
//! ```text
//! singular:  [63..48 offset]  [47..16 hasbit mask << 16]  [15..0 tag]
//! oneof:     [63..48 offset]  [47..32 case value] [31..16 case offset] [tag]
//! repeated:  [63..48 offset]  [15..0 tag]
//! submsg:    [63..48 field index]  (oneof bits as above)  [15..0 tag]
//! ```

use crate::base::Message;
use crate::containers::{Array, StringView};
use crate::decoding::{DecodeError, DecodeState, FieldCtl, NO_GROUP, Step, decode_field};
use crate::tables::{
    FieldType, MODE_ARRAY, MODE_CARD_MASK, MODE_IS_PACKED, MODE_SCALAR, MiniTable, MiniTableField,
    wire_type_of,
};
use crate::utils::unlikely;
use crate::wire::{ReadCursor, zigzag_decode32, zigzag_decode64};

pub(crate) type FieldParser = unsafe fn(
    &mut DecodeState<'_, '_>,
    ReadCursor,
    *mut Message,
    &MiniTable,
    &mut u64,
    u64,
) -> Step;

pub(crate) const CARD_S: u8 = 0;
pub(crate) const CARD_O: u8 = 1;
pub(crate) const CARD_R: u8 = 2;

/// The trampoline. Returns the cursor at the current limit (or just past a
/// matching end-group tag); `None` means the parse failed and
/// `DecodeState::err` says why.
pub(crate) unsafe fn dispatch(
    d: &mut DecodeState<'_, '_>,
    mut ptr: ReadCursor,
    msg: *mut Message,
    table: &MiniTable,
    mut hasbits: u64,
) -> Option<ReadCursor> {
    loop {
        if d.disable_fast || ptr.as_const() >= d.fastlimit {
            if ptr.as_const() == d.limit {
                unsafe { (*msg).flush_hasbits(hasbits) };
                return Some(ptr);
            }
            if ptr.as_const() > d.limit {
                return None;
            }
            // Inside the slack tail (or fast path disabled): bounds-checked
            // single-field steps.
            match unsafe { decode_field(d, ptr, msg, table)? } {
                FieldCtl::Ok(p) => {
                    ptr = p;
                    continue;
                }
                FieldCtl::GroupEnd(p) => {
                    unsafe { (*msg).flush_hasbits(hasbits) };
                    return Some(p);
                }
            }
        }
        let tag = ptr.peek_u16();
        let idx = ((tag & 0xf8) >> 3) as usize;
        let data = table.field_data[idx] ^ tag as u64;
        match unsafe { (table.field_parser[idx])(d, ptr, msg, table, &mut hasbits, data) } {
            Step::Tail(p) => ptr = p,
            Step::Fallback(p) => match unsafe { decode_field(d, p, msg, table)? } {
                FieldCtl::Ok(p) => ptr = p,
                FieldCtl::GroupEnd(p) => {
                    unsafe { (*msg).flush_hasbits(hasbits) };
                    return Some(p);
                }
            },
            Step::Error => return None,
        }
    }
}

#[inline(always)]
fn check_tag<const TB: usize>(data: u64) -> bool {
    if TB == 1 {
        data & 0xff == 0
    } else {
        data & 0xffff == 0
    }
}

#[inline(always)]
fn read_expected<const TB: usize>(ptr: ReadCursor) -> u16 {
    if TB == 1 { ptr[0usize] as u16 } else { ptr.peek_u16() }
}

#[inline(always)]
fn munge<const VB: usize, const ZZ: bool>(val: u64) -> u64 {
    if VB == 1 {
        (val != 0) as u64
    } else if ZZ {
        if VB == 4 {
            zigzag_decode32(val as u32) as u32 as u64
        } else {
            zigzag_decode64(val) as u64
        }
    } else {
        val
    }
}

#[inline(always)]
unsafe fn write_val<const VB: usize>(dst: *mut u8, val: u64) {
    unsafe {
        if VB == 1 {
            *dst = val as u8;
        } else if VB == 4 {
            core::ptr::write_unaligned(dst as *mut u32, val as u32);
        } else {
            core::ptr::write_unaligned(dst as *mut u64, val);
        }
    }
}

/// Singular / oneof presence bookkeeping; returns the field slot.
#[inline(always)]
unsafe fn getfield_dst<const CARD: u8>(msg: *mut Message, hasbits: &mut u64, data: u64) -> *mut u8 {
    let base = msg as *mut u8;
    if CARD == CARD_O {
        let case_ofs = ((data >> 16) & 0xffff) as usize;
        let case_val = ((data >> 32) & 0xffff) as u32;
        unsafe { ((base.add(case_ofs)) as *mut u32).write_unaligned(case_val) };
    } else {
        // The data word's middle bits are the pre-shifted hasbit mask; the
        // high offset bits are ORed along but shifted out at flush time.
        *hasbits |= data;
    }
    unsafe { base.add((data >> 48) as usize) }
}

#[inline(always)]
unsafe fn flush_hasbits(msg: *mut Message, hasbits: &mut u64) {
    unsafe { (*msg).flush_hasbits(*hasbits) };
    *hasbits = 0;
}

#[inline(always)]
unsafe fn getfield_array<'x>(
    d: &mut DecodeState<'_, '_>,
    msg: *mut Message,
    ofs: usize,
    lg2: usize,
) -> Option<&'x mut Array> {
    let slot = unsafe { &mut *((msg as *mut u8).add(ofs) as *mut *mut Array) };
    if unlikely(slot.is_null()) {
        *slot = Array::new_raw(d.arena, 4, lg2)?.as_ptr();
    }
    Some(unsafe { &mut **slot })
}

/// Appends without growth; the caller has checked capacity.
#[inline(always)]
unsafe fn append_raw<T>(arr: &mut Array, val: T) {
    let n = arr.len();
    unsafe { (arr.data_ptr() as *mut T).add(n).write(val) };
    arr.set_len(n + 1);
}

/* varint fields *************************************************************/

pub(crate) unsafe fn parse_varint<const TB: usize, const VB: usize, const CARD: u8, const ZZ: bool>(
    d: &mut DecodeState<'_, '_>,
    ptr: ReadCursor,
    msg: *mut Message,
    _table: &MiniTable,
    hasbits: &mut u64,
    data: u64,
) -> Step {
    if unlikely(!check_tag::<TB>(data)) {
        return Step::Fallback(ptr);
    }
    if CARD == CARD_R {
        return unsafe { parse_varint_repeated::<TB, VB, ZZ>(d, ptr, msg, hasbits, data) };
    }
    let dst = unsafe { getfield_dst::<CARD>(msg, hasbits, data) };
    let mut val = ptr[TB] as u64;
    let mut p = ptr + (TB + 1) as isize;
    if unlikely(val & 0x80 != 0) {
        let byte = ptr[TB + 1] as u64;
        // Folds the continuation bit of the first byte away; wrapping
        // arithmetic keeps non-canonical encodings like 80 00 correct.
        val = val.wrapping_add(byte.wrapping_sub(1) << 7);
        if unlikely(byte & 0x80 != 0) {
            // Three or more bytes: generic path.
            return Step::Fallback(ptr);
        }
        p += 1;
    }
    unsafe { write_val::<VB>(dst, munge::<VB, ZZ>(val)) };
    Step::Tail(p)
}

unsafe fn parse_varint_repeated<const TB: usize, const VB: usize, const ZZ: bool>(
    d: &mut DecodeState<'_, '_>,
    ptr: ReadCursor,
    msg: *mut Message,
    hasbits: &mut u64,
    data: u64,
) -> Step {
    unsafe { flush_hasbits(msg, hasbits) };
    let lg2 = match VB {
        1 => 0,
        4 => 2,
        _ => 3,
    };
    let arr = match unsafe { getfield_array(d, msg, (data >> 48) as usize, lg2) } {
        Some(a) => a,
        None => {
            d.err = DecodeError::OutOfMemory;
            return Step::Error;
        }
    };
    let expected = read_expected::<TB>(ptr);
    let mut p = ptr;
    loop {
        if arr.len() == arr.capacity() {
            // Let the generic path grow the array.
            return Step::Fallback(p);
        }
        let mut val = p[TB] as u64;
        let mut next = p + (TB + 1) as isize;
        if val & 0x80 != 0 {
            let byte = p[TB + 1] as u64;
            val = val.wrapping_add(byte.wrapping_sub(1) << 7);
            if byte & 0x80 != 0 {
                return Step::Fallback(p);
            }
            next += 1;
        }
        let val = munge::<VB, ZZ>(val);
        unsafe {
            match VB {
                1 => append_raw::<u8>(arr, val as u8),
                4 => append_raw::<u32>(arr, val as u32),
                _ => append_raw::<u64>(arr, val),
            }
        }
        p = next;
        if p.as_const() >= d.fastlimit || read_expected::<TB>(p) != expected {
            return Step::Tail(p);
        }
    }
}

/* fixed fields **************************************************************/

pub(crate) unsafe fn parse_fixed<const TB: usize, const VB: usize, const CARD: u8>(
    d: &mut DecodeState<'_, '_>,
    ptr: ReadCursor,
    msg: *mut Message,
    _table: &MiniTable,
    hasbits: &mut u64,
    data: u64,
) -> Step {
    if unlikely(!check_tag::<TB>(data)) {
        return Step::Fallback(ptr);
    }
    if CARD == CARD_R {
        return unsafe { parse_fixed_repeated::<TB, VB>(d, ptr, msg, hasbits, data) };
    }
    let dst = unsafe { getfield_dst::<CARD>(msg, hasbits, data) };
    let mut p = ptr + TB as isize;
    // Fixed payloads always fit inside the slack, but the value itself must
    // not cross the current limit.
    if unlikely(p.as_const() as usize + VB > d.limit as usize) {
        return Step::Error;
    }
    unsafe {
        if VB == 4 {
            let v = core::ptr::read_unaligned(p.as_const() as *const u32);
            write_val::<4>(dst, v as u64);
        } else {
            let v = core::ptr::read_unaligned(p.as_const() as *const u64);
            write_val::<8>(dst, v);
        }
    }
    p += VB as isize;
    Step::Tail(p)
}

unsafe fn parse_fixed_repeated<const TB: usize, const VB: usize>(
    d: &mut DecodeState<'_, '_>,
    ptr: ReadCursor,
    msg: *mut Message,
    hasbits: &mut u64,
    data: u64,
) -> Step {
    unsafe { flush_hasbits(msg, hasbits) };
    let lg2 = if VB == 4 { 2 } else { 3 };
    let arr = match unsafe { getfield_array(d, msg, (data >> 48) as usize, lg2) } {
        Some(a) => a,
        None => {
            d.err = DecodeError::OutOfMemory;
            return Step::Error;
        }
    };
    let expected = read_expected::<TB>(ptr);
    let mut p = ptr;
    loop {
        if arr.len() == arr.capacity() {
            return Step::Fallback(p);
        }
        let vp = p + TB as isize;
        if vp.as_const() as usize + VB > d.limit as usize {
            return Step::Error;
        }
        unsafe {
            if VB == 4 {
                append_raw::<u32>(arr, core::ptr::read_unaligned(vp.as_const() as *const u32));
            } else {
                append_raw::<u64>(arr, core::ptr::read_unaligned(vp.as_const() as *const u64));
            }
        }
        p = vp + VB as isize;
        if p.as_const() >= d.fastlimit || read_expected::<TB>(p) != expected {
            return Step::Tail(p);
        }
    }
}

/* string fields *************************************************************/

pub(crate) unsafe fn parse_string<const TB: usize, const CARD: u8, const VALIDATE: bool>(
    d: &mut DecodeState<'_, '_>,
    ptr: ReadCursor,
    msg: *mut Message,
    _table: &MiniTable,
    hasbits: &mut u64,
    data: u64,
) -> Step {
    if unlikely(!check_tag::<TB>(data)) {
        return Step::Fallback(ptr);
    }
    if CARD == CARD_R {
        return unsafe { parse_string_repeated::<TB, VALIDATE>(d, ptr, msg, hasbits, data) };
    }
    let dst = unsafe { getfield_dst::<CARD>(msg, hasbits, data) } as *mut StringView;
    let len = ptr[TB];
    if unlikely(len & 0x80 != 0) {
        // Length needs more than one byte: generic path.
        return Step::Fallback(ptr);
    }
    let mut p = ptr + (TB + 1) as isize;
    if unlikely(p.as_const() as usize + len as usize > d.limit as usize) {
        return Step::Error;
    }
    let slice = unsafe { core::slice::from_raw_parts(p.as_const(), len as usize) };
    if VALIDATE && core::str::from_utf8(slice).is_err() {
        return Step::Error;
    }
    // Aliased, not copied.
    unsafe { dst.write_unaligned(StringView::from_slice(slice)) };
    p += len as isize;
    Step::Tail(p)
}

unsafe fn parse_string_repeated<const TB: usize, const VALIDATE: bool>(
    d: &mut DecodeState<'_, '_>,
    ptr: ReadCursor,
    msg: *mut Message,
    hasbits: &mut u64,
    data: u64,
) -> Step {
    unsafe { flush_hasbits(msg, hasbits) };
    let arr = match unsafe { getfield_array(d, msg, (data >> 48) as usize, 4) } {
        Some(a) => a,
        None => {
            d.err = DecodeError::OutOfMemory;
            return Step::Error;
        }
    };
    let expected = read_expected::<TB>(ptr);
    let mut p = ptr;
    loop {
        if arr.len() == arr.capacity() {
            return Step::Fallback(p);
        }
        let len = p[TB];
        if len & 0x80 != 0 {
            return Step::Fallback(p);
        }
        let mut next = p + (TB + 1) as isize;
        if next.as_const() as usize + len as usize > d.limit as usize {
            return Step::Error;
        }
        let slice = unsafe { core::slice::from_raw_parts(next.as_const(), len as usize) };
        if VALIDATE && core::str::from_utf8(slice).is_err() {
            return Step::Error;
        }
        unsafe { append_raw::<StringView>(arr, StringView::from_slice(slice)) };
        next += len as isize;
        p = next;
        if p.as_const() >= d.fastlimit || read_expected::<TB>(p) != expected {
            return Step::Tail(p);
        }
    }
}

/* message fields ************************************************************/

pub(crate) unsafe fn parse_submsg<const TB: usize, const CARD: u8>(
    d: &mut DecodeState<'_, '_>,
    ptr: ReadCursor,
    msg: *mut Message,
    table: &MiniTable,
    hasbits: &mut u64,
    data: u64,
) -> Step {
    if unlikely(!check_tag::<TB>(data)) {
        return Step::Fallback(ptr);
    }
    let field = &table.fields[(data >> 48) as usize];
    let sub = table.sub_table(field);
    let ofs = field.offset as usize;
    let base = msg as *mut u8;

    if CARD == CARD_O {
        let case_ofs = ((data >> 16) & 0xffff) as usize;
        let case_val = ((data >> 32) & 0xffff) as u32;
        unsafe { (base.add(case_ofs) as *mut u32).write_unaligned(case_val) };
    }

    let expected = read_expected::<TB>(ptr);
    let mut p = ptr;

    if CARD == CARD_R {
        unsafe { flush_hasbits(msg, hasbits) };
        let arr = match unsafe { getfield_array(d, msg, ofs, 3) } {
            Some(a) => a,
            None => {
                d.err = DecodeError::OutOfMemory;
                return Step::Error;
            }
        };
        loop {
            if arr.len() == arr.capacity() {
                return Step::Fallback(p);
            }
            // A length longer than two bytes goes to the generic path.
            if p[TB] & 0x80 != 0 && p[TB + 1] & 0x80 != 0 {
                return Step::Fallback(p);
            }
            let child = match Message::create_raw(sub.size, d.arena) {
                Some(c) => c.as_ptr(),
                None => {
                    d.err = DecodeError::OutOfMemory;
                    return Step::Error;
                }
            };
            unsafe { append_raw::<*mut Message>(arr, child) };
            p = match unsafe { parse_submsg_body::<TB>(d, p, child, sub) } {
                Some(next) => next,
                None => return Step::Error,
            };
            if p.as_const() >= d.fastlimit || read_expected::<TB>(p) != expected {
                return Step::Tail(p);
            }
        }
    }

    let slot = unsafe { &mut *(base.add(ofs) as *mut *mut Message) };
    if slot.is_null() {
        *slot = match Message::create_raw(sub.size, d.arena) {
            Some(c) => c.as_ptr(),
            None => {
                d.err = DecodeError::OutOfMemory;
                return Step::Error;
            }
        };
    }
    let child = *slot;
    // A length longer than two bytes goes to the generic path before any
    // state is narrowed.
    if p[TB] & 0x80 != 0 && p[TB + 1] & 0x80 != 0 {
        return Step::Fallback(p);
    }
    match unsafe { parse_submsg_body::<TB>(d, p, child, sub) } {
        Some(next) => Step::Tail(next),
        None => Step::Error,
    }
}

/// Reads a one- or two-byte length, narrows the limits, recurses into the
/// dispatcher, and restores. The caller has ruled out longer lengths.
unsafe fn parse_submsg_body<const TB: usize>(
    d: &mut DecodeState<'_, '_>,
    ptr: ReadCursor,
    child: *mut Message,
    sub: &MiniTable,
) -> Option<ReadCursor> {
    let mut len = ptr[TB] as u32;
    let mut p = ptr + (TB + 1) as isize;
    if len & 0x80 != 0 {
        let byte = ptr[TB + 1] as u32;
        debug_assert!(byte & 0x80 == 0);
        len = len.wrapping_add(byte.wrapping_sub(1) << 7);
        p += 1;
    }
    let sub_end = p.as_const() as usize + len as usize;
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
    let ret = unsafe { dispatch(d, p, child, sub, 0)? };
    if ret.as_const() != d.limit {
        return None;
    }
    d.set_limit(saved_limit);
    d.end_group = saved_group;
    d.depth += 1;
    Some(ret)
}

/* fallback ******************************************************************/

pub(crate) unsafe fn parse_fallback(
    _d: &mut DecodeState<'_, '_>,
    ptr: ReadCursor,
    _msg: *mut Message,
    _table: &MiniTable,
    _hasbits: &mut u64,
    _data: u64,
) -> Step {
    Step::Fallback(ptr)
}

/* dispatch table construction ***********************************************/

const fn varint_parser(tb: usize, vb: usize, card: u8, zz: bool) -> Option<FieldParser> {
    if card == CARD_R && !cfg!(feature = "fast-repeated-varint") {
        return None;
    }
    Some(match (tb, vb, card, zz) {
        (1, 1, CARD_S, false) => parse_varint::<1, 1, { CARD_S }, false>,
        (1, 4, CARD_S, false) => parse_varint::<1, 4, { CARD_S }, false>,
        (1, 8, CARD_S, false) => parse_varint::<1, 8, { CARD_S }, false>,
        (1, 4, CARD_S, true) => parse_varint::<1, 4, { CARD_S }, true>,
        (1, 8, CARD_S, true) => parse_varint::<1, 8, { CARD_S }, true>,
        (1, 1, CARD_O, false) => parse_varint::<1, 1, { CARD_O }, false>,
        (1, 4, CARD_O, false) => parse_varint::<1, 4, { CARD_O }, false>,
        (1, 8, CARD_O, false) => parse_varint::<1, 8, { CARD_O }, false>,
        (1, 4, CARD_O, true) => parse_varint::<1, 4, { CARD_O }, true>,
        (1, 8, CARD_O, true) => parse_varint::<1, 8, { CARD_O }, true>,
        (1, 1, CARD_R, false) => parse_varint::<1, 1, { CARD_R }, false>,
        (1, 4, CARD_R, false) => parse_varint::<1, 4, { CARD_R }, false>,
        (1, 8, CARD_R, false) => parse_varint::<1, 8, { CARD_R }, false>,
        (1, 4, CARD_R, true) => parse_varint::<1, 4, { CARD_R }, true>,
        (1, 8, CARD_R, true) => parse_varint::<1, 8, { CARD_R }, true>,
        (2, 1, CARD_S, false) => parse_varint::<2, 1, { CARD_S }, false>,
        (2, 4, CARD_S, false) => parse_varint::<2, 4, { CARD_S }, false>,
        (2, 8, CARD_S, false) => parse_varint::<2, 8, { CARD_S }, false>,
        (2, 4, CARD_S, true) => parse_varint::<2, 4, { CARD_S }, true>,
        (2, 8, CARD_S, true) => parse_varint::<2, 8, { CARD_S }, true>,
        (2, 1, CARD_O, false) => parse_varint::<2, 1, { CARD_O }, false>,
        (2, 4, CARD_O, false) => parse_varint::<2, 4, { CARD_O }, false>,
        (2, 8, CARD_O, false) => parse_varint::<2, 8, { CARD_O }, false>,
        (2, 4, CARD_O, true) => parse_varint::<2, 4, { CARD_O }, true>,
        (2, 8, CARD_O, true) => parse_varint::<2, 8, { CARD_O }, true>,
        (2, 1, CARD_R, false) => parse_varint::<2, 1, { CARD_R }, false>,
        (2, 4, CARD_R, false) => parse_varint::<2, 4, { CARD_R }, false>,
        (2, 8, CARD_R, false) => parse_varint::<2, 8, { CARD_R }, false>,
        (2, 4, CARD_R, true) => parse_varint::<2, 4, { CARD_R }, true>,
        (2, 8, CARD_R, true) => parse_varint::<2, 8, { CARD_R }, true>,
        _ => return None,
    })
}

const fn fixed_parser(tb: usize, vb: usize, card: u8) -> Option<FieldParser> {
    Some(match (tb, vb, card) {
        (1, 4, CARD_S) => parse_fixed::<1, 4, { CARD_S }>,
        (1, 8, CARD_S) => parse_fixed::<1, 8, { CARD_S }>,
        (1, 4, CARD_O) => parse_fixed::<1, 4, { CARD_O }>,
        (1, 8, CARD_O) => parse_fixed::<1, 8, { CARD_O }>,
        (1, 4, CARD_R) => parse_fixed::<1, 4, { CARD_R }>,
        (1, 8, CARD_R) => parse_fixed::<1, 8, { CARD_R }>,
        (2, 4, CARD_S) => parse_fixed::<2, 4, { CARD_S }>,
        (2, 8, CARD_S) => parse_fixed::<2, 8, { CARD_S }>,
        (2, 4, CARD_O) => parse_fixed::<2, 4, { CARD_O }>,
        (2, 8, CARD_O) => parse_fixed::<2, 8, { CARD_O }>,
        (2, 4, CARD_R) => parse_fixed::<2, 4, { CARD_R }>,
        (2, 8, CARD_R) => parse_fixed::<2, 8, { CARD_R }>,
        _ => return None,
    })
}

const fn string_parser(tb: usize, card: u8, validate: bool) -> Option<FieldParser> {
    Some(match (tb, card, validate) {
        (1, CARD_S, true) => parse_string::<1, { CARD_S }, true>,
        (1, CARD_S, false) => parse_string::<1, { CARD_S }, false>,
        (1, CARD_O, true) => parse_string::<1, { CARD_O }, true>,
        (1, CARD_O, false) => parse_string::<1, { CARD_O }, false>,
        (1, CARD_R, true) => parse_string::<1, { CARD_R }, true>,
        (1, CARD_R, false) => parse_string::<1, { CARD_R }, false>,
        (2, CARD_S, true) => parse_string::<2, { CARD_S }, true>,
        (2, CARD_S, false) => parse_string::<2, { CARD_S }, false>,
        (2, CARD_O, true) => parse_string::<2, { CARD_O }, true>,
        (2, CARD_O, false) => parse_string::<2, { CARD_O }, false>,
        (2, CARD_R, true) => parse_string::<2, { CARD_R }, true>,
        (2, CARD_R, false) => parse_string::<2, { CARD_R }, false>,
        _ => return None,
    })
}

const fn submsg_parser(tb: usize, card: u8) -> Option<FieldParser> {
    Some(match (tb, card) {
        (1, CARD_S) => parse_submsg::<1, { CARD_S }>,
        (1, CARD_O) => parse_submsg::<1, { CARD_O }>,
        (1, CARD_R) => parse_submsg::<1, { CARD_R }>,
        (2, CARD_S) => parse_submsg::<2, { CARD_S }>,
        (2, CARD_O) => parse_submsg::<2, { CARD_O }>,
        (2, CARD_R) => parse_submsg::<2, { CARD_R }>,
        _ => return None,
    })
}

const fn select_parser(t: FieldType, card: u8, tb: usize) -> Option<FieldParser> {
    match t {
        FieldType::Bool => varint_parser(tb, 1, card, false),
        FieldType::Int32 | FieldType::UInt32 | FieldType::Enum => varint_parser(tb, 4, card, false),
        FieldType::Int64 | FieldType::UInt64 => varint_parser(tb, 8, card, false),
        FieldType::SInt32 => varint_parser(tb, 4, card, true),
        FieldType::SInt64 => varint_parser(tb, 8, card, true),
        FieldType::Fixed32 | FieldType::SFixed32 | FieldType::Float => fixed_parser(tb, 4, card),
        FieldType::Fixed64 | FieldType::SFixed64 | FieldType::Double => fixed_parser(tb, 8, card),
        FieldType::String => string_parser(tb, card, true),
        FieldType::Bytes => string_parser(tb, card, false),
        FieldType::Message => submsg_parser(tb, card),
        FieldType::Group => None,
    }
}

/// Computes the dispatch slot, parser and packed data word for field `i`,
/// or `None` if the field is not fast-path eligible.
const fn fast_entry(fields: &[MiniTableField], i: usize) -> Option<(usize, FieldParser, u64)> {
    let f = &fields[i];
    let num = f.number;
    let card = match f.mode & MODE_CARD_MASK {
        MODE_SCALAR => {
            if f.presence < 0 {
                CARD_O
            } else {
                CARD_S
            }
        }
        MODE_ARRAY => {
            if f.mode & MODE_IS_PACKED != 0 {
                return None;
            }
            CARD_R
        }
        _ => return None,
    };
    if matches!(f.descriptor_type, FieldType::Group) {
        return None;
    }
    let wt = wire_type_of(f.descriptor_type);
    let tag = (num << 3) | wt;
    let (slot, tb, expected) = if num >= 1 && num <= 15 {
        (num as usize, 1usize, tag as u64)
    } else if num <= 2047 {
        let lo = (tag & 0x7f) | 0x80;
        let hi = tag >> 7;
        ((16 + (num & 15)) as usize, 2usize, (lo as u64) | ((hi as u64) << 8))
    } else {
        return None;
    };
    let mut word = expected;
    if card == CARD_S {
        if f.presence > 0 {
            let idx = (f.presence - 1) as u64;
            if idx >= 32 {
                return None;
            }
            word |= 1u64 << (idx + 16);
        }
    } else if card == CARD_O {
        if num > 0xffff {
            return None;
        }
        let case_ofs = -(f.presence as i32);
        word |= (case_ofs as u64) << 16;
        word |= (num as u64) << 32;
    }
    if matches!(f.descriptor_type, FieldType::Message) {
        if i > 0xffff {
            return None;
        }
        word |= (i as u64) << 48;
    } else {
        word |= (f.offset as u64) << 48;
    }
    let parser = match select_parser(f.descriptor_type, card, tb) {
        Some(p) => p,
        None => return None,
    };
    Some((slot, parser, word))
}

/// Builds the 32-slot dispatch arrays for a sorted field list. Slots that
/// no eligible field claims (and collision losers) keep the generic
/// fallback. Const so statically-defined mini-tables get their tables at
/// compile time; the runtime builder calls it too.
pub(crate) const fn fast_tables(
    fields: &[MiniTableField],
) -> ([FieldParser; 32], [u64; 32]) {
    let mut parsers: [FieldParser; 32] = [parse_fallback as FieldParser; 32];
    let mut data = [0u64; 32];
    let mut claimed = [false; 32];
    let mut i = 0;
    while i < fields.len() {
        if let Some((slot, parser, word)) = fast_entry(fields, i) {
            if !claimed[slot] {
                claimed[slot] = true;
                parsers[slot] = parser;
                data[slot] = word;
            }
        }
        i += 1;
    }
    (parsers, data)
}
