//! JSON text-format parser.
//!
//! A tokenizer plus an explicit frame stack that mirrors message nesting;
//! each member name is resolved against a [`JsonNameTable`] running parallel
//! to the mini-table, and each value token is routed to the right slot by
//! the field's descriptor type. Map fields synthesize one map-entry
//! sub-message per member, parsing the quoted key with the same scalar
//! machinery as ordinary values.
//!
//! String values that arrive contiguous and unescaped alias the input;
//! escape sequences (including UTF-16 surrogate pairs) force a copy.
//! `bytes` values accumulate and then base64-decode into the arena.

use alloc::borrow::Cow;
use alloc::string::String;
use alloc::vec::Vec;

use anyhow::{Result, anyhow};
use base64::Engine;

use crate::arena::Arena;
use crate::base::Message;
use crate::containers::{Array, StringView};
use crate::tables::{FieldType, MiniTable, MiniTableField, elem_size_lg2};

/// Proto and JSON (lowerCamel) spellings of one field, parallel to the
/// mini-table's field array.
pub struct JsonFieldName {
    pub name: &'static str,
    pub json_name: &'static str,
}

pub struct JsonEnumNames {
    pub entries: &'static [(&'static str, i32)],
}

impl JsonEnumNames {
    fn lookup(&self, name: &str) -> Option<i32> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, v)| v)
    }
}

/// Name-table analog of [`MiniTableSub`](crate::tables::MiniTableSub).
pub enum JsonSub {
    Message(&'static JsonNameTable),
    Enum(&'static JsonEnumNames),
    None,
}

/// Field and enum names for one message type, parallel to its mini-table.
pub struct JsonNameTable {
    pub fields: &'static [JsonFieldName],
    pub subs: &'static [JsonSub],
}

static EMPTY_NAMES: JsonNameTable = JsonNameTable {
    fields: &[],
    subs: &[],
};

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonOptions {
    /// Skip members whose names the table does not know instead of failing.
    pub ignore_unknown: bool,
}

const MAX_FRAMES: usize = 64;

/// Parses a JSON object into a fresh message of `table`'s layout. String
/// fields alias `input` where possible, so the message carries `input`'s
/// borrow. The message's storage lives in the arena and must not be used
/// after the arena's fuse group is freed.
pub fn parse<'s>(
    input: &'s str,
    table: &'static MiniTable,
    names: &'static JsonNameTable,
    arena: &mut Arena<'_>,
    options: JsonOptions,
) -> Result<&'s mut Message> {
    let root = Message::create_raw(table.size, arena)
        .ok_or_else(|| anyhow!("arena allocation failed"))?
        .as_ptr();
    let mut p = Parser {
        lex: Lexer {
            input: input.as_bytes(),
            pos: 0,
        },
        arena,
        frames: Vec::new(),
        options,
    };
    p.run(root, table, names)?;
    Ok(unsafe { &mut *root })
}

struct Frame {
    msg: *mut Message,
    table: &'static MiniTable,
    names: &'static JsonNameTable,
    /// Index of the field currently receiving values.
    field: Option<usize>,
    in_array: bool,
    /// Object frame of a map field; members synthesize entries.
    is_map: bool,
    /// Map-entry frame with no braces of its own; pops after one value.
    auto_pop: bool,
}

enum State {
    MemberFirst,
    Member,
    Value,
    PostValue,
}

/// A complete scalar-ish token.
enum Token<'s> {
    Num(&'s str),
    Str(Cow<'s, str>),
    Bool(bool),
    Null,
}

struct Parser<'s, 'a, 'alloc> {
    lex: Lexer<'s>,
    arena: &'a mut Arena<'alloc>,
    frames: Vec<Frame>,
    options: JsonOptions,
}

impl<'s, 'a, 'alloc> Parser<'s, 'a, 'alloc> {
    fn run(
        &mut self,
        root: *mut Message,
        table: &'static MiniTable,
        names: &'static JsonNameTable,
    ) -> Result<()> {
        self.lex.skip_ws();
        self.lex.expect(b'{')?;
        self.frames.push(Frame {
            msg: root,
            table,
            names,
            field: None,
            in_array: false,
            is_map: false,
            auto_pop: false,
        });
        let mut state = State::MemberFirst;
        loop {
            match state {
                State::MemberFirst => {
                    self.lex.skip_ws();
                    if self.lex.peek() == Some(b'}') {
                        self.lex.pos += 1;
                        if self.pop_object()? {
                            return self.finish();
                        }
                        state = State::PostValue;
                    } else {
                        state = State::Member;
                    }
                }
                State::Member => {
                    state = self.member()?;
                }
                State::Value => {
                    state = self.value()?;
                }
                State::PostValue => {
                    if self.top().auto_pop {
                        self.frames.pop();
                    }
                    self.lex.skip_ws();
                    let top = self.frames.last_mut().expect("frame stack underflow");
                    if top.in_array {
                        match self.lex.bump() {
                            Some(b',') => state = State::Value,
                            Some(b']') => {
                                top.in_array = false;
                                top.field = None;
                                // The member's whole value is now complete.
                            }
                            _ => return Err(self.lex.err("expected ',' or ']'")),
                        }
                    } else {
                        match self.lex.bump() {
                            Some(b',') => state = State::Member,
                            Some(b'}') => {
                                if self.pop_object()? {
                                    return self.finish();
                                }
                            }
                            _ => return Err(self.lex.err("expected ',' or '}'")),
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        self.lex.skip_ws();
        if self.lex.pos != self.lex.input.len() {
            return Err(self.lex.err("trailing characters after document"));
        }
        Ok(())
    }

    fn top(&self) -> &Frame {
        self.frames.last().expect("frame stack underflow")
    }

    /// Pops the frame closed by a '}'. Returns true when the root closed.
    fn pop_object(&mut self) -> Result<bool> {
        self.frames.pop();
        Ok(self.frames.is_empty())
    }

    fn member(&mut self) -> Result<State> {
        self.lex.skip_ws();
        let name = self.lex.parse_string()?;
        self.lex.skip_ws();
        self.lex.expect(b':')?;
        if self.top().is_map {
            return self.map_member(name);
        }
        let idx = self
            .top()
            .names
            .fields
            .iter()
            .position(|n| n.json_name == name.as_ref() || n.name == name.as_ref());
        match idx {
            Some(i) => {
                self.frames.last_mut().expect("frame stack underflow").field = Some(i);
                Ok(State::Value)
            }
            None if self.options.ignore_unknown => {
                self.lex.skip_value()?;
                Ok(State::PostValue)
            }
            None => Err(self.lex.err("unknown field name")),
        }
    }

    /// One `"key": value` member of a map object: synthesize an entry
    /// message, store the key, and leave an auto-pop frame expecting the
    /// value.
    fn map_member(&mut self, key: Cow<'s, str>) -> Result<State> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.lex.err("nesting too deep"));
        }
        let top = self.frames.last().expect("frame stack underflow");
        let map_field = &top.table.fields[top.field.expect("map frame without field")];
        let entry_table = top.table.sub_table(map_field);
        let entry_names = match top.names.subs.get(map_field.submsg_index as usize) {
            Some(JsonSub::Message(n)) => n,
            _ => &EMPTY_NAMES,
        };
        let top_msg = top.msg;

        let entry = Message::create_raw(entry_table.size, self.arena)
            .ok_or_else(|| anyhow!("arena allocation failed"))?
            .as_ptr();
        let arr = get_or_create_array(
            unsafe { &mut *top_msg },
            map_field,
            self.arena,
        )
        .ok_or_else(|| anyhow!("arena allocation failed"))?;
        if !unsafe { arr.push::<*mut Message>(entry, self.arena) } {
            return Err(anyhow!("arena allocation failed"));
        }

        let key_idx = entry_table
            .fields
            .iter()
            .position(|f| f.number == 1)
            .ok_or_else(|| self.lex.err("map entry layout missing key"))?;
        let value_idx = entry_table
            .fields
            .iter()
            .position(|f| f.number == 2)
            .ok_or_else(|| self.lex.err("map entry layout missing value"))?;

        // Keys go through the same scalar machinery as values.
        let key_field = &entry_table.fields[key_idx];
        let prim = self.token_to_prim(entry_table, key_field, entry_names, Token::Str(key), true)?;
        write_prim(unsafe { &mut *entry }, key_field, prim, self.arena, false)
            .map_err(|e| self.lex.err(e))?;

        self.frames.push(Frame {
            msg: entry,
            table: entry_table,
            names: entry_names,
            field: Some(value_idx),
            in_array: false,
            is_map: false,
            auto_pop: true,
        });
        Ok(State::Value)
    }

    fn value(&mut self) -> Result<State> {
        self.lex.skip_ws();
        match self.lex.peek() {
            Some(b'{') => {
                self.lex.pos += 1;
                self.begin_object()?;
                Ok(State::MemberFirst)
            }
            Some(b'[') => {
                let top = self.frames.last_mut().expect("frame stack underflow");
                let fi = top.field.ok_or_else(|| anyhow!("array with no field"))?;
                if top.in_array {
                    return Err(self.lex.err("nested arrays are not valid here"));
                }
                let field = &top.table.fields[fi];
                if !field.is_repeated() {
                    return Err(self.lex.err("array value for non-repeated field"));
                }
                top.in_array = true;
                self.lex.pos += 1;
                self.lex.skip_ws();
                if self.lex.peek() == Some(b']') {
                    self.lex.pos += 1;
                    let top = self.frames.last_mut().expect("frame stack underflow");
                    top.in_array = false;
                    top.field = None;
                    return Ok(State::PostValue);
                }
                Ok(State::Value)
            }
            Some(b'"') => {
                let s = self.lex.parse_string()?;
                self.deliver(Token::Str(s))?;
                Ok(State::PostValue)
            }
            Some(b't') | Some(b'f') => {
                let v = self.lex.parse_keyword()?;
                match v {
                    Keyword::True => self.deliver(Token::Bool(true))?,
                    Keyword::False => self.deliver(Token::Bool(false))?,
                    Keyword::Null => return Err(self.lex.err("unexpected keyword")),
                }
                Ok(State::PostValue)
            }
            Some(b'n') => {
                match self.lex.parse_keyword()? {
                    Keyword::Null => self.deliver(Token::Null)?,
                    _ => return Err(self.lex.err("unexpected keyword")),
                }
                Ok(State::PostValue)
            }
            Some(_) => {
                let tok = self.lex.parse_number_token()?;
                self.deliver(Token::Num(tok))?;
                Ok(State::PostValue)
            }
            None => Err(self.lex.err("unexpected end of input")),
        }
    }

    /// `{` seen where a value is expected: a sub-message or a map.
    fn begin_object(&mut self) -> Result<()> {
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.lex.err("nesting too deep"));
        }
        let top = self.frames.last().expect("frame stack underflow");
        let fi = top
            .field
            .ok_or_else(|| self.lex.err("object value with no field"))?;
        let field = &top.table.fields[fi];
        if field.is_map() {
            if top.in_array {
                return Err(self.lex.err("map field cannot be an array element"));
            }
            let frame = Frame {
                msg: top.msg,
                table: top.table,
                names: top.names,
                field: Some(fi),
                in_array: false,
                is_map: true,
                auto_pop: false,
            };
            self.frames.push(frame);
            return Ok(());
        }
        if !matches!(field.descriptor_type, FieldType::Message | FieldType::Group) {
            return Err(self.lex.err("object value for scalar field"));
        }
        let sub = top.table.sub_table(field);
        let sub_names = match top.names.subs.get(field.submsg_index as usize) {
            Some(JsonSub::Message(n)) => n,
            _ => &EMPTY_NAMES,
        };
        let in_array = top.in_array;
        let top_msg = top.msg;
        let child = if in_array {
            let arr = get_or_create_array(unsafe { &mut *top_msg }, field, self.arena)
                .ok_or_else(|| anyhow!("arena allocation failed"))?;
            let child = Message::create_raw(sub.size, self.arena)
                .ok_or_else(|| anyhow!("arena allocation failed"))?
                .as_ptr();
            if !unsafe { arr.push::<*mut Message>(child, self.arena) } {
                return Err(anyhow!("arena allocation failed"));
            }
            child
        } else {
            let msg = unsafe { &mut *top_msg };
            let slot = msg.ref_mut::<*mut Message>(field.offset as usize);
            if slot.is_null() {
                *slot = Message::create_raw(sub.size, self.arena)
                    .ok_or_else(|| anyhow!("arena allocation failed"))?
                    .as_ptr();
            }
            let child = *slot;
            if let Some(ofs) = field.oneof_case_offset() {
                msg.set_oneof_case(ofs, field.number);
            }
            child
        };
        self.frames.push(Frame {
            msg: child,
            table: sub,
            names: sub_names,
            field: None,
            in_array: false,
            is_map: false,
            auto_pop: false,
        });
        Ok(())
    }

    fn deliver(&mut self, tok: Token<'s>) -> Result<()> {
        let top = self.frames.last().expect("frame stack underflow");
        let fi = top
            .field
            .ok_or_else(|| self.lex.err("value with no field"))?;
        let field = &top.table.fields[fi];
        if matches!(tok, Token::Null) {
            // null leaves the field absent.
            if top.in_array {
                return Err(self.lex.err("null array element"));
            }
            return Ok(());
        }
        if field.is_repeated() && !top.in_array {
            return Err(self.lex.err("repeated field expects an array"));
        }
        if field.is_map() {
            return Err(self.lex.err("map field expects an object"));
        }
        let table = top.table;
        let names = top.names;
        let in_array = top.in_array;
        let msg = top.msg;
        let prim = self.token_to_prim(table, field, names, tok, false)?;
        write_prim(unsafe { &mut *msg }, field, prim, self.arena, in_array)
            .map_err(|e| self.lex.err(e))
    }

    fn token_to_prim(
        &mut self,
        table: &'static MiniTable,
        field: &MiniTableField,
        names: &'static JsonNameTable,
        tok: Token<'s>,
        from_key: bool,
    ) -> Result<Prim> {
        let t = field.descriptor_type;
        match t {
            FieldType::Bool => match tok {
                Token::Bool(b) => Ok(Prim::B(b)),
                Token::Str(s) if from_key && s.as_ref() == "true" => Ok(Prim::B(true)),
                Token::Str(s) if from_key && s.as_ref() == "false" => Ok(Prim::B(false)),
                _ => Err(self.lex.err("expected true or false")),
            },
            FieldType::Int32 | FieldType::SInt32 | FieldType::SFixed32 => {
                let v = self.tok_i64(&tok)?;
                if v < i32::MIN as i64 || v > i32::MAX as i64 {
                    return Err(self.lex.err("integer out of range for int32"));
                }
                Ok(Prim::I32(v as i32))
            }
            FieldType::Int64 | FieldType::SInt64 | FieldType::SFixed64 => {
                Ok(Prim::I64(self.tok_i64(&tok)?))
            }
            FieldType::UInt32 | FieldType::Fixed32 => {
                let v = self.tok_u64(&tok)?;
                if v > u32::MAX as u64 {
                    return Err(self.lex.err("integer out of range for uint32"));
                }
                Ok(Prim::U32(v as u32))
            }
            FieldType::UInt64 | FieldType::Fixed64 => Ok(Prim::U64(self.tok_u64(&tok)?)),
            FieldType::Float => {
                let v = self.tok_f64(&tok)?;
                let f = v as f32;
                if v.is_finite() && f.is_infinite() {
                    return Err(self.lex.err("number out of range for float"));
                }
                Ok(Prim::F32(f))
            }
            FieldType::Double => Ok(Prim::F64(self.tok_f64(&tok)?)),
            FieldType::Enum => match tok {
                Token::Num(n) => {
                    let v = json_i64(n).ok_or_else(|| self.lex.err("bad enum number"))?;
                    if v < i32::MIN as i64 || v > i32::MAX as i64 {
                        return Err(self.lex.err("enum number out of range"));
                    }
                    if let Some(known) = table.sub_enum(field) {
                        if !known.contains(v as i32) {
                            return Err(self.lex.err("unknown enum value"));
                        }
                    }
                    Ok(Prim::I32(v as i32))
                }
                Token::Str(s) => {
                    let enums = match names.subs.get(field.submsg_index as usize) {
                        Some(JsonSub::Enum(e)) => e,
                        _ => return Err(self.lex.err("enum field has no name table")),
                    };
                    match enums.lookup(s.as_ref()) {
                        Some(v) => Ok(Prim::I32(v)),
                        None => Err(self.lex.err("unknown enum name")),
                    }
                }
                _ => Err(self.lex.err("expected enum name or number")),
            },
            FieldType::String => match tok {
                Token::Str(Cow::Borrowed(s)) => Ok(Prim::S(StringView::from_slice(s.as_bytes()))),
                Token::Str(Cow::Owned(s)) => {
                    let copied = self
                        .arena
                        .copy_bytes(s.as_bytes())
                        .map_err(|_| anyhow!("arena allocation failed"))?;
                    Ok(Prim::S(StringView {
                        ptr: copied.as_ptr(),
                        len: s.len(),
                    }))
                }
                _ => Err(self.lex.err("expected string")),
            },
            FieldType::Bytes => match tok {
                Token::Str(s) => {
                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(s.as_ref())
                        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(s.as_ref()))
                        .map_err(|_| self.lex.err("invalid base64"))?;
                    let copied = self
                        .arena
                        .copy_bytes(&decoded)
                        .map_err(|_| anyhow!("arena allocation failed"))?;
                    Ok(Prim::S(StringView {
                        ptr: copied.as_ptr(),
                        len: decoded.len(),
                    }))
                }
                _ => Err(self.lex.err("expected base64 string")),
            },
            FieldType::Message | FieldType::Group => Err(self.lex.err("expected object")),
        }
    }

    fn tok_i64(&self, tok: &Token<'_>) -> Result<i64> {
        let s = match tok {
            Token::Num(n) => *n,
            Token::Str(s) => s.as_ref(),
            _ => return Err(self.lex.err("expected number")),
        };
        json_i64(s).ok_or_else(|| self.lex.err("bad integer"))
    }

    fn tok_u64(&self, tok: &Token<'_>) -> Result<u64> {
        let s = match tok {
            Token::Num(n) => *n,
            Token::Str(s) => s.as_ref(),
            _ => return Err(self.lex.err("expected number")),
        };
        json_u64(s).ok_or_else(|| self.lex.err("bad unsigned integer"))
    }

    fn tok_f64(&self, tok: &Token<'_>) -> Result<f64> {
        match tok {
            Token::Num(n) => n.parse::<f64>().map_err(|_| self.lex.err("bad number")),
            Token::Str(s) => match s.as_ref() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => other.parse::<f64>().map_err(|_| self.lex.err("bad number")),
            },
            _ => Err(self.lex.err("expected number")),
        }
    }
}

enum Prim {
    B(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    S(StringView),
}

fn get_or_create_array<'x>(
    msg: &mut Message,
    field: &MiniTableField,
    arena: &mut Arena<'_>,
) -> Option<&'x mut Array> {
    let slot = msg.ref_mut::<*mut Array>(field.offset as usize);
    if slot.is_null() {
        *slot = Array::new_raw(arena, 4, elem_size_lg2(field.descriptor_type))?.as_ptr();
    }
    Some(unsafe { &mut **slot })
}

fn write_prim(
    msg: &mut Message,
    field: &MiniTableField,
    prim: Prim,
    arena: &mut Arena<'_>,
    in_array: bool,
) -> core::result::Result<(), &'static str> {
    if in_array {
        let arr = get_or_create_array(msg, field, arena).ok_or("arena allocation failed")?;
        let ok = unsafe {
            match prim {
                Prim::B(v) => arr.push::<u8>(v as u8, arena),
                Prim::I32(v) => arr.push::<i32>(v, arena),
                Prim::U32(v) => arr.push::<u32>(v, arena),
                Prim::I64(v) => arr.push::<i64>(v, arena),
                Prim::U64(v) => arr.push::<u64>(v, arena),
                Prim::F32(v) => arr.push::<f32>(v, arena),
                Prim::F64(v) => arr.push::<f64>(v, arena),
                Prim::S(v) => arr.push::<StringView>(v, arena),
            }
        };
        if !ok {
            return Err("arena allocation failed");
        }
        return Ok(());
    }
    if let Some(idx) = field.hasbit_index() {
        msg.set_has_bit(idx);
    } else if let Some(ofs) = field.oneof_case_offset() {
        msg.set_oneof_case(ofs, field.number);
    }
    let ofs = field.offset as usize;
    match prim {
        Prim::B(v) => msg.set::<u8>(ofs, v as u8),
        Prim::I32(v) => msg.set::<i32>(ofs, v),
        Prim::U32(v) => msg.set::<u32>(ofs, v),
        Prim::I64(v) => msg.set::<i64>(ofs, v),
        Prim::U64(v) => msg.set::<u64>(ofs, v),
        Prim::F32(v) => msg.set::<f32>(ofs, v),
        Prim::F64(v) => msg.set::<f64>(ofs, v),
        Prim::S(v) => msg.set::<StringView>(ofs, v),
    }
    Ok(())
}

fn json_i64(s: &str) -> Option<i64> {
    if let Ok(v) = s.parse::<i64>() {
        return Some(v);
    }
    // Exponent forms like 1e3 are valid for integer fields when integral.
    let f = s.parse::<f64>().ok()?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn json_u64(s: &str) -> Option<u64> {
    if let Ok(v) = s.parse::<u64>() {
        return Some(v);
    }
    let f = s.parse::<f64>().ok()?;
    if f.fract() == 0.0 && f >= 0.0 && f <= u64::MAX as f64 {
        Some(f as u64)
    } else {
        None
    }
}

enum Keyword {
    True,
    False,
    Null,
}

struct Lexer<'s> {
    input: &'s [u8],
    pos: usize,
}

impl<'s> Lexer<'s> {
    fn err(&self, msg: &str) -> anyhow::Error {
        anyhow!("{} at byte {}", msg, self.pos)
    }

    fn skip_ws(&mut self) {
        while let Some(&c) = self.input.get(self.pos) {
            if c == b' ' || c == b'\t' || c == b'\n' || c == b'\r' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        if self.bump() == Some(c) {
            Ok(())
        } else {
            self.pos = self.pos.saturating_sub(1);
            Err(self.err("unexpected character"))
        }
    }

    fn parse_keyword(&mut self) -> Result<Keyword> {
        let rest = &self.input[self.pos..];
        if rest.starts_with(b"true") {
            self.pos += 4;
            Ok(Keyword::True)
        } else if rest.starts_with(b"false") {
            self.pos += 5;
            Ok(Keyword::False)
        } else if rest.starts_with(b"null") {
            self.pos += 4;
            Ok(Keyword::Null)
        } else {
            Err(self.err("unknown keyword"))
        }
    }

    fn parse_number_token(&mut self) -> Result<&'s str> {
        let start = self.pos;
        while let Some(&c) = self.input.get(self.pos) {
            if c.is_ascii_digit() || matches!(c, b'-' | b'+' | b'.' | b'e' | b'E') {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.err("expected a value"));
        }
        // The token came out of a &str, sliced at ASCII boundaries.
        Ok(unsafe { core::str::from_utf8_unchecked(&self.input[start..self.pos]) })
    }

    fn hex4(&mut self) -> Result<u32> {
        let mut cp = 0u32;
        for _ in 0..4 {
            let c = self.bump().ok_or_else(|| self.err("truncated \\u escape"))?;
            let digit = match c {
                b'0'..=b'9' => (c - b'0') as u32,
                b'a'..=b'f' => (c - b'a') as u32 + 10,
                b'A'..=b'F' => (c - b'A') as u32 + 10,
                _ => return Err(self.err("bad \\u escape")),
            };
            cp = cp << 4 | digit;
        }
        Ok(cp)
    }

    /// Parses a JSON string, borrowing from the input when it contains no
    /// escapes and accumulating into an owned buffer otherwise.
    fn parse_string(&mut self) -> Result<Cow<'s, str>> {
        self.expect(b'"')?;
        let start = self.pos;
        loop {
            match self.peek() {
                None => return Err(self.err("unterminated string")),
                Some(b'"') => {
                    let s = &self.input[start..self.pos];
                    self.pos += 1;
                    // Slice boundaries sit on ASCII quotes of a valid &str.
                    return Ok(Cow::Borrowed(unsafe { core::str::from_utf8_unchecked(s) }));
                }
                Some(b'\\') => break,
                Some(c) if c < 0x20 => return Err(self.err("control character in string")),
                Some(_) => self.pos += 1,
            }
        }
        // Escape seen: switch to an owned accumulator seeded with the
        // clean prefix.
        let mut buf: Vec<u8> = self.input[start..self.pos].to_vec();
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated string")),
                Some(b'"') => {
                    let s = String::from_utf8(buf)
                        .map_err(|_| self.err("invalid UTF-8 in string"))?;
                    return Ok(Cow::Owned(s));
                }
                Some(b'\\') => {
                    let esc = self.bump().ok_or_else(|| self.err("truncated escape"))?;
                    match esc {
                        b'"' => buf.push(b'"'),
                        b'\\' => buf.push(b'\\'),
                        b'/' => buf.push(b'/'),
                        b'b' => buf.push(0x08),
                        b'f' => buf.push(0x0c),
                        b'n' => buf.push(b'\n'),
                        b'r' => buf.push(b'\r'),
                        b't' => buf.push(b'\t'),
                        b'u' => {
                            let cp = self.hex4()?;
                            let ch = if (0xd800..=0xdbff).contains(&cp) {
                                // A lead surrogate must be followed by a
                                // \u-escaped trail surrogate.
                                if self.bump() != Some(b'\\') || self.bump() != Some(b'u') {
                                    return Err(self.err("unpaired surrogate"));
                                }
                                let trail = self.hex4()?;
                                if !(0xdc00..=0xdfff).contains(&trail) {
                                    return Err(self.err("unpaired surrogate"));
                                }
                                let combined =
                                    0x10000 + ((cp - 0xd800) << 10) + (trail - 0xdc00);
                                char::from_u32(combined)
                                    .ok_or_else(|| self.err("bad surrogate pair"))?
                            } else if (0xdc00..=0xdfff).contains(&cp) {
                                return Err(self.err("unpaired surrogate"));
                            } else {
                                char::from_u32(cp).ok_or_else(|| self.err("bad \\u escape"))?
                            };
                            let mut utf8 = [0u8; 4];
                            buf.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
                        }
                        _ => return Err(self.err("unknown escape")),
                    }
                }
                Some(c) if c < 0x20 => return Err(self.err("control character in string")),
                Some(c) => buf.push(c),
            }
        }
    }

    /// Skips one complete JSON value (used for unknown members).
    fn skip_value(&mut self) -> Result<()> {
        self.skip_ws();
        match self.peek() {
            Some(b'{') | Some(b'[') => {
                let mut depth = 0usize;
                loop {
                    match self.peek() {
                        None => return Err(self.err("unterminated value")),
                        Some(b'{') | Some(b'[') => {
                            depth += 1;
                            if depth > MAX_FRAMES {
                                return Err(self.err("nesting too deep"));
                            }
                            self.pos += 1;
                        }
                        Some(b'}') | Some(b']') => {
                            depth -= 1;
                            self.pos += 1;
                            if depth == 0 {
                                return Ok(());
                            }
                        }
                        Some(b'"') => {
                            self.parse_string()?;
                        }
                        Some(_) => self.pos += 1,
                    }
                }
            }
            Some(b'"') => {
                self.parse_string()?;
                Ok(())
            }
            Some(b't') | Some(b'f') | Some(b'n') => {
                self.parse_keyword()?;
                Ok(())
            }
            Some(_) => {
                self.parse_number_token()?;
                Ok(())
            }
            None => Err(self.err("unexpected end of input")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessors::*;
    use crate::test_utils::json_names::test_names;
    use crate::test_utils::test_tables;

    fn field(table: &'static MiniTable, number: u32) -> &'static MiniTableField {
        table.find_field_by_number(number).expect("field exists")
    }

    fn opts() -> JsonOptions {
        JsonOptions::default()
    }

    #[test]
    fn test_basic_members() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"optionalInt32": 42, "optionalBool": true}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        assert!(has_field(msg, field(t, 1)));
        assert!(has_field(msg, field(t, 9)));
        assert_eq!(get_int32(msg, field(t, 1)), 42);
        assert!(get_bool(msg, field(t, 9)));
    }

    #[test]
    fn test_proto_names_accepted() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"optional_int32": -7}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        assert_eq!(get_int32(msg, field(t, 1)), -7);
    }

    #[test]
    fn test_quoted_64bit_integers() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"optionalInt64": "-123456789012345", "optionalUint64": "18446744073709551615"}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        assert_eq!(get_int64(msg, field(t, 2)), -123456789012345);
        assert_eq!(get_uint64(msg, field(t, 4)), u64::MAX);
    }

    #[test]
    fn test_special_floats() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"optionalDouble": "NaN", "optionalFloat": "-Infinity"}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        assert!(get_double(msg, field(t, 13)).is_nan());
        assert_eq!(get_float(msg, field(t, 12)), f32::NEG_INFINITY);
    }

    #[test]
    fn test_string_escapes_and_surrogates() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"optionalString": "a\nbA 😀"}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        assert_eq!(
            get_string(msg, field(t, 10)).as_bytes(),
            "a\nbA \u{1F600}".as_bytes()
        );
    }

    #[test]
    fn test_unescaped_string_aliases_input() {
        let t = test_tables().table;
        let input = r#"{"optionalString": "plain"}"#;
        let mut arena = Arena::new();
        let msg = parse(input, t, test_names(), &mut arena, opts()).unwrap();
        let view = get_string(msg, field(t, 10));
        assert_eq!(view.as_bytes(), b"plain");
        let start = input.as_ptr() as usize;
        let p = view.as_bytes().as_ptr() as usize;
        assert!(p >= start && p < start + input.len());
    }

    #[test]
    fn test_unpaired_surrogate_rejected() {
        let t = test_tables().table;
        for bad in [
            r#"{"optionalString": "\uD83D"}"#,
            r#"{"optionalString": "\uD83Dx"}"#,
            r#"{"optionalString": "\uDE00"}"#,
            r#"{"optionalString": "\uD83DA"}"#,
        ] {
            let mut arena = Arena::new();
            assert!(parse(bad, t, test_names(), &mut arena, opts()).is_err());
        }
    }

    #[test]
    fn test_bytes_base64() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"optionalBytes": "aGVsbG8="}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        assert_eq!(get_string(msg, field(t, 11)).as_bytes(), b"hello");

        let mut arena = Arena::new();
        assert!(
            parse(
                r#"{"optionalBytes": "aGVsbG8"}"#,
                t,
                test_names(),
                &mut arena,
                opts()
            )
            .is_err()
        );
    }

    #[test]
    fn test_enum_values() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"optionalNestedEnum": "BAR"}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        assert_eq!(get_enum(msg, field(t, 15)), 1);

        let mut arena = Arena::new();
        let msg = parse(
            r#"{"optionalNestedEnum": 2}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        assert_eq!(get_enum(msg, field(t, 15)), 2);

        let mut arena = Arena::new();
        assert!(
            parse(
                r#"{"optionalNestedEnum": "NOPE"}"#,
                t,
                test_names(),
                &mut arena,
                opts()
            )
            .is_err()
        );

        // Integer literals are checked against the known values.
        let mut arena = Arena::new();
        assert!(
            parse(
                r#"{"optionalNestedEnum": 9}"#,
                t,
                test_names(),
                &mut arena,
                opts()
            )
            .is_err()
        );
    }

    #[test]
    fn test_nested_message() {
        let tables = test_tables();
        let t = tables.table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"optionalNestedMessage": {"a": 3, "b": "xy"}}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        let child = get_message(msg, field(t, 14)).expect("nested present");
        assert_eq!(get_int32(child, field(tables.nested, 1)), 3);
        assert_eq!(get_string(child, field(tables.nested, 2)).as_bytes(), b"xy");
    }

    #[test]
    fn test_repeated_fields() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"repeatedInt32": [1, 2, 3], "repeatedString": ["x", "y"], "repeatedNestedMessage": [{"a": 1}, {"a": 2}]}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        let ints = get_array(msg, field(t, 18)).expect("ints present");
        assert_eq!(unsafe { ints.slice::<i32>() }, &[1, 2, 3]);
        let strings = get_array(msg, field(t, 19)).expect("strings present");
        assert_eq!(strings.len(), 2);
        let msgs = get_array(msg, field(t, 20)).expect("messages present");
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn test_empty_array() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"repeatedInt32": []}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        assert!(get_array(msg, field(t, 18)).is_none());
    }

    #[test]
    fn test_map_entries() {
        let tables = test_tables();
        let t = tables.table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"mapStringInt32": {"k": 1, "j": 2}}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        let map = get_array(msg, field(t, 21)).expect("map present");
        assert_eq!(map.len(), 2);
        let FieldValue::Message(e0) = get_array_value(map, 0, FieldType::Message) else {
            panic!("expected message entry");
        };
        let e0 = unsafe { &*e0 };
        assert_eq!(get_string(e0, field(tables.entry, 1)).as_bytes(), b"k");
        assert_eq!(get_int32(e0, field(tables.entry, 2)), 1);
        let FieldValue::Message(e1) = get_array_value(map, 1, FieldType::Message) else {
            panic!("expected message entry");
        };
        let e1 = unsafe { &*e1 };
        assert_eq!(get_string(e1, field(tables.entry, 1)).as_bytes(), b"j");
        assert_eq!(get_int32(e1, field(tables.entry, 2)), 2);
    }

    #[test]
    fn test_oneof_member() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"oneofString": "s"}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        assert!(has_field(msg, field(t, 17)));
        assert!(!has_field(msg, field(t, 16)));
    }

    #[test]
    fn test_unknown_member() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        assert!(
            parse(
                r#"{"nope": 1}"#,
                t,
                test_names(),
                &mut arena,
                opts()
            )
            .is_err()
        );

        let mut arena = Arena::new();
        let msg = parse(
            r#"{"nope": {"deep": [1, {"x": "y"}]}, "optionalInt32": 5}"#,
            t,
            test_names(),
            &mut arena,
            JsonOptions {
                ignore_unknown: true,
            },
        )
        .unwrap();
        assert_eq!(get_int32(msg, field(t, 1)), 5);
    }

    #[test]
    fn test_rejects() {
        let t = test_tables().table;
        for bad in [
            r#"{"optionalBool": "true"}"#,   // bools must be literal
            r#"{"optionalInt32": 5000000000}"#, // out of range
            r#"{"optionalInt32": 1.5}"#,     // not integral
            r#"{"optionalInt32": 1} extra"#, // trailing input
            r#"{"optionalInt32": [1]}"#,     // array for singular field
            r#"{"optionalInt32""#,           // truncated
            r#"[1]"#,                        // root must be an object
        ] {
            let mut arena = Arena::new();
            assert!(
                parse(bad, t, test_names(), &mut arena, opts()).is_err(),
                "expected failure for {bad}"
            );
        }
    }

    #[test]
    fn test_null_leaves_field_absent() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"optionalInt32": null}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        assert!(!has_field(msg, field(t, 1)));
    }

    #[test]
    fn test_deep_unknown_value_capped() {
        let t = test_tables().table;
        let mut input = String::from(r#"{"nope": "#);
        for _ in 0..80 {
            input.push('[');
        }
        for _ in 0..80 {
            input.push(']');
        }
        input.push('}');
        let mut arena = Arena::new();
        assert!(
            parse(
                &input,
                t,
                test_names(),
                &mut arena,
                JsonOptions {
                    ignore_unknown: true,
                },
            )
            .is_err()
        );
    }

    #[test]
    fn test_json_then_wire_roundtrip() {
        let t = test_tables().table;
        let mut arena = Arena::new();
        let msg = parse(
            r#"{"optionalInt32": 150, "optionalString": "hello"}"#,
            t,
            test_names(),
            &mut arena,
            opts(),
        )
        .unwrap();
        let wire = crate::encoding::encode_vec(msg, t).unwrap();
        assert_eq!(wire, [0x08, 0x96, 0x01, 0x52, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }
}
