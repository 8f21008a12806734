//! Message layout tables.
//!
//! A [`MiniTable`] is the compact binary description of one message type:
//! per-field records (wire number, slot offset, presence word, sub-table
//! index, descriptor type, cardinality), an indirection table of sub-layouts
//! for message- and enum-typed fields, and the 32-slot dispatch arrays the
//! fast-path decoder indexes with the low five bits of the tag.
//!
//! Generated code would emit these as statics; [`builder`] computes the same
//! layout at runtime for dynamic users and tests.

use crate::decode_fast::{FieldParser, fast_tables};

/// Protobuf descriptor types, in descriptor.proto numbering.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldType {
    Double = 1,
    Float = 2,
    Int64 = 3,
    UInt64 = 4,
    Int32 = 5,
    Fixed64 = 6,
    Fixed32 = 7,
    Bool = 8,
    String = 9,
    Group = 10,
    Message = 11,
    Bytes = 12,
    UInt32 = 13,
    Enum = 14,
    SFixed32 = 15,
    SFixed64 = 16,
    SInt32 = 17,
    SInt64 = 18,
}

/// Low two bits of `MiniTableField::mode`.
pub const MODE_MAP: u8 = 0;
pub const MODE_ARRAY: u8 = 1;
pub const MODE_SCALAR: u8 = 2;
pub const MODE_CARD_MASK: u8 = 3;
/// Repeated field whose wire default is the packed encoding.
pub const MODE_IS_PACKED: u8 = 4;
/// Proto2 required field; counted in `MiniTable::required_count`.
pub const MODE_IS_REQUIRED: u8 = 8;

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MiniTableField {
    pub number: u32,
    pub offset: u16,
    /// `> 0`: hasbit index + 1. `< 0`: negated byte offset of the oneof
    /// case word. `0`: no presence tracking.
    pub presence: i16,
    pub submsg_index: u16,
    pub descriptor_type: FieldType,
    pub mode: u8,
}

impl MiniTableField {
    #[inline(always)]
    pub fn cardinality(&self) -> u8 {
        self.mode & MODE_CARD_MASK
    }

    #[inline(always)]
    pub fn is_repeated(&self) -> bool {
        self.cardinality() == MODE_ARRAY
    }

    #[inline(always)]
    pub fn is_map(&self) -> bool {
        self.cardinality() == MODE_MAP
    }

    #[inline(always)]
    pub fn is_scalar(&self) -> bool {
        self.cardinality() == MODE_SCALAR
    }

    #[inline(always)]
    pub fn is_packed(&self) -> bool {
        self.mode & MODE_IS_PACKED != 0
    }

    #[inline(always)]
    pub fn is_required(&self) -> bool {
        self.mode & MODE_IS_REQUIRED != 0
    }

    #[inline(always)]
    pub fn hasbit_index(&self) -> Option<u16> {
        if self.presence > 0 {
            Some((self.presence - 1) as u16)
        } else {
            None
        }
    }

    #[inline(always)]
    pub fn oneof_case_offset(&self) -> Option<u16> {
        if self.presence < 0 {
            Some((-(self.presence as i32)) as u16)
        } else {
            None
        }
    }

    pub fn is_sub_message(&self) -> bool {
        matches!(self.descriptor_type, FieldType::Message | FieldType::Group)
    }
}

/// Known values of a closed enum, sorted ascending.
pub struct MiniTableEnum {
    pub values: &'static [i32],
}

impl MiniTableEnum {
    pub fn contains(&self, value: i32) -> bool {
        self.values.binary_search(&value).is_ok()
    }
}

/// Entry in a mini-table's sub-layout indirection table.
#[derive(Clone, Copy)]
pub enum MiniTableSub {
    Message(&'static MiniTable),
    Enum(&'static MiniTableEnum),
    None,
}

pub struct MiniTable {
    /// Message byte size: hasbit words, oneof case words, then field slots.
    pub size: u16,
    pub field_count: u16,
    pub required_count: u8,
    /// Extension policy; nonzero means unknown numbers may be extensions
    /// (they are preserved like unknown fields either way).
    pub ext: u8,
    /// Field numbers `1..=dense_below` index `fields` directly.
    pub dense_below: u32,
    /// Sorted by field number.
    pub fields: &'static [MiniTableField],
    pub subs: &'static [MiniTableSub],
    /// Fast-path dispatch: slot `(tag & 0xf8) >> 3` holds the specialized
    /// parser and its packed expected-tag/offset word. Slots with no fast
    /// parser hold the generic fallback.
    pub(crate) field_parser: [FieldParser; 32],
    pub(crate) field_data: [u64; 32],
}

impl MiniTable {
    /// Const constructor for statically-defined layouts; computes the
    /// dispatch arrays from the field records.
    pub const fn new_static(
        size: u16,
        required_count: u8,
        dense_below: u32,
        fields: &'static [MiniTableField],
        subs: &'static [MiniTableSub],
    ) -> MiniTable {
        let (field_parser, field_data) = fast_tables(fields);
        MiniTable {
            size,
            field_count: fields.len() as u16,
            required_count,
            ext: 0,
            dense_below,
            fields,
            subs,
            field_parser,
            field_data,
        }
    }

    pub fn find_field_by_number(&self, number: u32) -> Option<&MiniTableField> {
        if number != 0 && number <= self.dense_below {
            let f = &self.fields[(number - 1) as usize];
            debug_assert_eq!(f.number, number);
            return Some(f);
        }
        self.fields
            .binary_search_by_key(&number, |f| f.number)
            .ok()
            .map(|i| &self.fields[i])
    }

    pub(crate) fn sub_table(&self, field: &MiniTableField) -> &'static MiniTable {
        debug_assert!(field.is_sub_message());
        match self.subs[field.submsg_index as usize] {
            MiniTableSub::Message(t) => t,
            _ => unreachable!("message field without sub-table"),
        }
    }

    pub(crate) fn sub_enum(&self, field: &MiniTableField) -> Option<&'static MiniTableEnum> {
        match self.subs.get(field.submsg_index as usize) {
            Some(MiniTableSub::Enum(e)) => Some(e),
            _ => None,
        }
    }
}

/// Wire type a field of type `t` uses when not packed.
pub(crate) const fn wire_type_of(t: FieldType) -> u32 {
    match t {
        FieldType::Double | FieldType::Fixed64 | FieldType::SFixed64 => crate::wire::WIRE_FIXED64,
        FieldType::Float | FieldType::Fixed32 | FieldType::SFixed32 => crate::wire::WIRE_FIXED32,
        FieldType::String | FieldType::Bytes | FieldType::Message => crate::wire::WIRE_DELIMITED,
        FieldType::Group => crate::wire::WIRE_START_GROUP,
        _ => crate::wire::WIRE_VARINT,
    }
}

/// Log2 of a repeated field's element size.
pub(crate) const fn elem_size_lg2(t: FieldType) -> usize {
    match t {
        FieldType::Bool => 0,
        FieldType::Int32
        | FieldType::UInt32
        | FieldType::SInt32
        | FieldType::Fixed32
        | FieldType::SFixed32
        | FieldType::Float
        | FieldType::Enum => 2,
        FieldType::String | FieldType::Bytes => 4,
        _ => 3,
    }
}

/// Runtime layout construction: the job code generation does ahead of time,
/// for dynamic layouts and tests.
pub mod builder {
    use super::*;
    use crate::containers::StringView;
    use crate::utils::align_up;
    use alloc::vec::Vec;

    #[derive(Clone, Copy, Debug)]
    pub enum FieldCard {
        /// Proto3 scalar without presence tracking.
        Implicit,
        /// Explicit presence via hasbit (message fields track via pointer).
        Optional,
        Required,
        /// Member of the oneof with the given id.
        Oneof(u16),
        Repeated,
        /// Repeated with packed wire default.
        Packed,
        Map,
    }

    #[derive(Clone, Copy, Debug)]
    pub struct FieldSpec {
        pub number: u32,
        pub ftype: FieldType,
        pub card: FieldCard,
        /// Index into `subs` for message-, group- and enum-typed fields.
        pub sub: u16,
    }

    fn scalar_slot(ftype: FieldType) -> (usize, usize) {
        match ftype {
            FieldType::Bool => (1, 1),
            FieldType::String | FieldType::Bytes => (core::mem::size_of::<StringView>(), 8),
            FieldType::Message | FieldType::Group => (8, 8),
            FieldType::Double | FieldType::Fixed64 | FieldType::SFixed64 => (8, 8),
            FieldType::Int64 | FieldType::UInt64 | FieldType::SInt64 => (8, 8),
            _ => (4, 4),
        }
    }

    fn slot_of(spec: &FieldSpec) -> (usize, usize) {
        match spec.card {
            FieldCard::Repeated | FieldCard::Packed | FieldCard::Map => (8, 8),
            _ => scalar_slot(spec.ftype),
        }
    }

    /// Computes the message layout and dispatch tables for `specs`, leaking
    /// the result. Field order in `specs` is irrelevant; records come out
    /// sorted by number.
    pub fn build(specs: &[FieldSpec], subs: &'static [MiniTableSub]) -> &'static MiniTable {
        let mut specs: Vec<FieldSpec> = specs.to_vec();
        specs.sort_by_key(|s| s.number);

        // Presence-tracked scalars get hasbits; message presence rides on
        // the pointer itself.
        let mut hasbit_count: u16 = 0;
        let mut required_count: u8 = 0;
        let mut oneofs: Vec<u16> = Vec::new();
        for spec in &specs {
            debug_assert!(spec.number >= 1);
            match spec.card {
                FieldCard::Optional | FieldCard::Required => {
                    if !matches!(spec.ftype, FieldType::Message | FieldType::Group) {
                        hasbit_count += 1;
                    }
                    if matches!(spec.card, FieldCard::Required) {
                        required_count += 1;
                    }
                }
                FieldCard::Oneof(id) => {
                    if !oneofs.contains(&id) {
                        oneofs.push(id);
                    }
                }
                _ => {}
            }
        }

        let hasbit_bytes = ((hasbit_count as usize + 31) / 32) * 4;
        let case_base = hasbit_bytes;
        let fields_base = case_base + oneofs.len() * 4;

        // One slot per field, except oneof arms, which share their group's
        // slot sized for the widest arm.
        struct Slot {
            members: Vec<usize>,
            size: usize,
            align: usize,
        }
        let mut slots: Vec<Slot> = Vec::new();
        let mut oneof_slot: Vec<Option<usize>> = alloc::vec![None; oneofs.len()];
        for (i, spec) in specs.iter().enumerate() {
            let (size, align) = slot_of(spec);
            if let FieldCard::Oneof(id) = spec.card {
                let group = oneofs.iter().position(|&o| o == id).unwrap();
                match oneof_slot[group] {
                    Some(s) => {
                        slots[s].members.push(i);
                        slots[s].size = slots[s].size.max(size);
                        slots[s].align = slots[s].align.max(align);
                    }
                    None => {
                        oneof_slot[group] = Some(slots.len());
                        slots.push(Slot {
                            members: alloc::vec![i],
                            size,
                            align,
                        });
                    }
                }
            } else {
                slots.push(Slot {
                    members: alloc::vec![i],
                    size,
                    align,
                });
            }
        }
        let mut order: Vec<usize> = (0..slots.len()).collect();
        order.sort_by_key(|&s| core::cmp::Reverse((slots[s].align, slots[s].size)));

        let mut offsets: Vec<u16> = alloc::vec![0; specs.len()];
        let mut cursor = fields_base;
        for &s in &order {
            let slot = &slots[s];
            cursor = align_up(cursor, slot.align);
            for &m in &slot.members {
                offsets[m] = cursor as u16;
            }
            cursor += slot.size;
        }
        let size = align_up(cursor, 8).max(8);
        assert!(size <= u16::MAX as usize, "message layout too large");

        let mut hasbit_next: i16 = 0;
        let mut fields: Vec<MiniTableField> = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let mut mode;
            let presence;
            match spec.card {
                FieldCard::Implicit => {
                    mode = MODE_SCALAR;
                    presence = 0;
                }
                FieldCard::Optional | FieldCard::Required => {
                    mode = MODE_SCALAR;
                    if matches!(spec.card, FieldCard::Required) {
                        mode |= MODE_IS_REQUIRED;
                    }
                    if matches!(spec.ftype, FieldType::Message | FieldType::Group) {
                        presence = 0;
                    } else {
                        hasbit_next += 1;
                        presence = hasbit_next;
                    }
                }
                FieldCard::Oneof(id) => {
                    mode = MODE_SCALAR;
                    let group = oneofs.iter().position(|&o| o == id).unwrap();
                    presence = -((case_base + group * 4) as i16);
                }
                FieldCard::Repeated => {
                    mode = MODE_ARRAY;
                    presence = 0;
                }
                FieldCard::Packed => {
                    mode = MODE_ARRAY | MODE_IS_PACKED;
                    presence = 0;
                }
                FieldCard::Map => {
                    mode = MODE_MAP;
                    presence = 0;
                }
            }
            fields.push(MiniTableField {
                number: spec.number,
                offset: offsets[i],
                presence,
                submsg_index: spec.sub,
                descriptor_type: spec.ftype,
                mode,
            });
        }

        let mut dense_below = 0u32;
        while (dense_below as usize) < fields.len()
            && fields[dense_below as usize].number == dense_below + 1
        {
            dense_below += 1;
        }

        let fields: &'static [MiniTableField] = Vec::leak(fields);
        let table = MiniTable::new_static(
            size as u16,
            required_count,
            dense_below,
            fields,
            subs,
        );
        alloc::boxed::Box::leak(alloc::boxed::Box::new(table))
    }
}
