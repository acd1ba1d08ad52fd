//! Solidity ABI encoder implemented as a serde [Serializer](ser::Serializer).
//!
//! Encoding happens in up to four passes over the value: the size of the
//! static head is computed first, then the head is written (containing
//! offsets for dynamic members), then the tail. Tail sizes are computed on
//! demand to produce correct offsets.

use super::error::{Error, Result};
use serde::{
    ser::{
        self, SerializeMap, SerializeSeq, SerializeStruct, SerializeStructVariant, SerializeTuple,
        SerializeTupleStruct, SerializeTupleVariant,
    },
    Serialize,
};

/// Type name used for marking a struct as fake-dynamic (dynamic but
/// transparent). Chosen so that no real Rust type can have this name.
const MARK_DYNAMIC_NAME: &str = ":$&_DYNAMIC";

const SLOT_SIZE: usize = 32; // bytes

/// PhantomData type to mark a struct/tuple as dynamic, even if none of its
/// fields are.
///
/// `bytes32` (and other fixed-size bytes) need `serialize_bytes` to write
/// whole slots, so the dynamic `bytes` type is serialized as a tuple of
/// (DynamicMarker, length, data) instead, see [as_bytes][super::as_bytes].
/// The marker makes the tuple dynamic without an extra indirection.
///
/// # Important
/// Used wrong, the output does not represent any Solidity type. Prefer
/// [as_bytes][super::as_bytes].
pub struct DynamicMarker;

impl Serialize for DynamicMarker {
    fn serialize<S>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_unit_struct(MARK_DYNAMIC_NAME)
    }
}

pub trait Writer {
    fn write(&mut self, slot: &[u8]);
}

/// Writer for the size passes, which never write.
struct NoWriter;

impl Writer for NoWriter {
    fn write(&mut self, _: &[u8]) {
        unreachable!("size passes must not write");
    }
}

#[derive(Debug)]
enum Pass {
    /// Compute the head size and whether the value is dynamic.
    HeadSize(usize),
    /// Write the static part, `offset` is where the next dynamic value goes.
    Head { offset: usize },
    /// Compute the size of the dynamic part.
    TailSize(usize),
    /// Write the dynamic part.
    Tail,
}

pub struct Serializer<'a, W>
where
    W: Writer,
{
    writer: &'a mut W,
    pass: Pass,
    is_dynamic: bool,
    is_fake_dynamic: bool,
}

/// `abi.encode(value)`.
pub fn to_writer<T, W>(value: &T, writer: &mut W) -> Result<()>
where
    T: Serialize,
    W: Writer,
{
    to_writer_internal(value, writer, true)
}

/// `abi.encode(field_0, field_1, ...)`, treating the outer struct/tuple as
/// the argument list.
pub fn to_fnargs_writer<T, W>(value: &T, writer: &mut W) -> Result<()>
where
    T: Serialize,
    W: Writer,
{
    to_writer_internal(value, writer, false)
}

fn to_writer_internal<T, W>(value: &T, writer: &mut W, include_outer_struct: bool) -> Result<()>
where
    T: Serialize,
    W: Writer,
{
    let size = compute_size(value)?;

    let mut serializer = Serializer {
        writer,
        pass: Pass::Head {
            offset: size.head_size,
        },
        is_dynamic: size.is_dynamic,
        is_fake_dynamic: size.is_fake_dynamic,
    };

    if size.is_dynamic && include_outer_struct {
        serializer.write_right_aligned(SLOT_SIZE.to_be_bytes())
    }

    value.serialize(&mut serializer)?;
    if size.is_dynamic {
        serializer.pass = Pass::Tail;
        value.serialize(&mut serializer)?;
    }
    Ok(())
}

struct SizeInfo {
    head_size: usize,
    is_dynamic: bool,
    is_fake_dynamic: bool,
}

impl SizeInfo {
    /// Dynamic values that are not transparent are stored behind an offset.
    fn is_indirect(&self) -> bool {
        self.is_dynamic && !self.is_fake_dynamic
    }
}

fn compute_size<T>(value: &T) -> Result<SizeInfo>
where
    T: Serialize + ?Sized,
{
    let mut serializer = Serializer {
        writer: &mut NoWriter,
        pass: Pass::HeadSize(0),
        is_dynamic: false,
        is_fake_dynamic: false,
    };
    value.serialize(&mut serializer)?;

    match serializer.pass {
        Pass::HeadSize(head_size) => Ok(SizeInfo {
            head_size,
            is_dynamic: serializer.is_dynamic,
            is_fake_dynamic: serializer.is_fake_dynamic,
        }),
        _ => unreachable!("the serializer never changes the pass of a HeadSize run"),
    }
}

fn compute_tail_size<T>(value: &T) -> Result<usize>
where
    T: Serialize + ?Sized,
{
    let mut serializer = Serializer {
        writer: &mut NoWriter,
        pass: Pass::TailSize(0),
        is_dynamic: false,
        is_fake_dynamic: false,
    };
    value.serialize(&mut serializer)?;

    match serializer.pass {
        Pass::TailSize(tail_size) => Ok(tail_size),
        _ => unreachable!("the serializer never changes the pass of a TailSize run"),
    }
}

/// Number of bytes `len` bytes occupy when padded to full slots.
fn padded_len(len: usize) -> usize {
    let r = len % SLOT_SIZE;
    (len - r) + if r == 0 { 0 } else { SLOT_SIZE }
}

impl<'a, W> Serializer<'a, W>
where
    W: Writer,
{
    // Panics if v.len() > SLOT_SIZE
    fn write_left_aligned_slice(&mut self, v: &[u8]) {
        let mut bytes = [0u8; SLOT_SIZE];
        bytes[..v.len()].copy_from_slice(v);
        self.writer.write(bytes.as_slice());
    }

    // Panics if N > SLOT_SIZE
    fn write_right_aligned<const N: usize>(&mut self, v: [u8; N]) {
        let mut bytes = [0u8; SLOT_SIZE];
        bytes[SLOT_SIZE - N..].copy_from_slice(v.as_slice());
        self.writer.write(bytes.as_slice())
    }

    // Panics if N > SLOT_SIZE
    fn write_signed<const N: usize>(&mut self, negative: bool, v: [u8; N]) {
        let filler = if negative { 0xff } else { 0x00 };
        let mut bytes = [filler; SLOT_SIZE];
        bytes[SLOT_SIZE - N..].copy_from_slice(v.as_slice());
        self.writer.write(bytes.as_slice())
    }

    fn write_chunks(&mut self, v: &[u8]) {
        let iter = v.chunks_exact(SLOT_SIZE);
        let rem = iter.remainder();
        for chunk in iter {
            self.writer.write(chunk);
        }
        if !rem.is_empty() {
            self.write_left_aligned_slice(rem);
        }
    }

    /// Serialize a child value with a fresh serializer in the given pass.
    fn serialize_child<T>(&mut self, value: &T, pass: Pass) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let size = compute_size(value)?;
        let mut serializer = Serializer {
            writer: &mut *self.writer,
            pass,
            is_dynamic: size.is_dynamic,
            is_fake_dynamic: size.is_fake_dynamic,
        };
        value.serialize(&mut serializer)
    }

    /// Static elements are written completely in the head. Dynamic elements
    /// write an offset in the head and their content in the tail.
    ///
    /// `offset_base` is subtracted from the offset written in the head: the
    /// length slot of a dynamic array is not part of the offsets of its
    /// elements.
    fn encode_element<T>(&mut self, value: &T, offset_base: usize) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        match self.pass {
            Pass::HeadSize(ref mut head_size) => {
                let size = compute_size(value)?;
                *head_size += if size.is_indirect() {
                    SLOT_SIZE
                } else {
                    size.head_size
                };
                if offset_base == 0 {
                    self.is_dynamic |= size.is_dynamic || size.is_fake_dynamic;
                }
                Ok(())
            }
            Pass::Head { offset } => {
                let size = compute_size(value)?;
                if size.is_indirect() {
                    self.write_right_aligned((offset - offset_base).to_be_bytes());
                    self.pass = Pass::Head {
                        offset: offset + size.head_size + compute_tail_size(value)?,
                    };
                    Ok(())
                } else {
                    let child_offset = if offset_base == 0 {
                        offset
                    } else {
                        size.head_size
                    };
                    self.serialize_child(value, Pass::Head {
                        offset: child_offset,
                    })
                }
            }
            Pass::TailSize(size_so_far) => {
                let size = compute_size(value)?;
                let tail_size = compute_tail_size(value)?;
                self.pass = Pass::TailSize(
                    size_so_far
                        + if size.is_indirect() { size.head_size } else { 0 }
                        + tail_size,
                );
                Ok(())
            }
            Pass::Tail => {
                let size = compute_size(value)?;
                if size.is_indirect() {
                    // The offset given here is the head size of the child
                    // itself: it tells the child where its own tail begins.
                    self.serialize_child(value, Pass::Head {
                        offset: size.head_size,
                    })?;
                    self.serialize_child(value, Pass::Tail)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Every static scalar occupies exactly one head slot.
    fn scalar(&mut self, write: impl FnOnce(&mut Self)) -> Result<()> {
        match self.pass {
            Pass::HeadSize(ref mut head_size) => *head_size += SLOT_SIZE,
            Pass::Head { .. } => write(self),
            Pass::TailSize(_) | Pass::Tail => {}
        };
        Ok(())
    }
}

macro_rules! serialize_unsigned {
    ($($method:ident: $T:ty),* $(,)?) => {
        $(
            fn $method(self, v: $T) -> Result<()> {
                self.scalar(|s| s.write_right_aligned(v.to_be_bytes()))
            }
        )*
    };
}

macro_rules! serialize_signed {
    ($($method:ident: $T:ty),* $(,)?) => {
        $(
            fn $method(self, v: $T) -> Result<()> {
                self.scalar(|s| s.write_signed(v < 0, v.to_be_bytes()))
            }
        )*
    };
}

impl<'a, 'b, W> ser::Serializer for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.serialize_u8(u8::from(v))
    }

    serialize_signed!(
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_i128: i128,
    );

    serialize_unsigned!(
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64,
        serialize_u128: u128,
    );

    fn serialize_f32(self, _: f32) -> Result<()> {
        Err(Error::TypeNotRepresentable("f32"))
    }

    fn serialize_f64(self, _: f64) -> Result<()> {
        Err(Error::TypeNotRepresentable("f64"))
    }

    fn serialize_char(self, _: char) -> Result<()> {
        Err(Error::TypeNotYetSupported("char"))
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        // Same layout as dynamic `bytes`, but without the DynamicMarker
        // tuple since nothing else uses serialize_str.
        match self.pass {
            Pass::HeadSize(_) => {
                self.is_dynamic = true;
            }
            Pass::Head { .. } => {}
            Pass::TailSize(ref mut size) => {
                //      length    + data
                *size += SLOT_SIZE + padded_len(v.len());
            }
            Pass::Tail => {
                self.write_right_aligned(v.len().to_be_bytes());
                self.write_chunks(v.as_bytes());
            }
        };
        Ok(())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        match self.pass {
            Pass::HeadSize(ref mut head_size) => {
                *head_size += padded_len(v.len());
            }
            Pass::Head { .. } => self.write_chunks(v),
            Pass::TailSize(_) | Pass::Tail => {}
        }
        Ok(())
    }

    fn serialize_none(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("none"))
    }

    fn serialize_some<T: ?Sized>(self, _: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("some"))
    }

    fn serialize_unit(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("unit"))
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<()> {
        if name != MARK_DYNAMIC_NAME {
            return Err(Error::TypeNotRepresentable("unit struct"));
        }
        if let Pass::HeadSize(_) = self.pass {
            self.is_fake_dynamic = true;
        }
        Ok(())
    }

    fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Result<()> {
        Err(Error::TypeNotRepresentable("unit variant (enum)"))
    }

    fn serialize_newtype_struct<T: ?Sized>(self, _name: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.encode_element(value, 0)
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: &T,
    ) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("newtype variant (enum)"))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<Self::SerializeSeq> {
        // Sequences have to know their length up front, the length slot is
        // written before any element.
        let len = len.ok_or(Error::TypeNotYetSupported("sequence of unknown length"))?;
        match self.pass {
            Pass::HeadSize(ref mut head_size) => {
                self.is_dynamic = true;
                *head_size += SLOT_SIZE;
            }
            Pass::Head { .. } => self.write_right_aligned(len.to_be_bytes()),
            Pass::TailSize(_) | Pass::Tail => {}
        }
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::TypeNotRepresentable("tuple variant (enum)"))
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::TypeNotRepresentable("map"))
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::TypeNotRepresentable("struct variant"))
    }

    fn collect_str<T: ?Sized>(self, _value: &T) -> Result<()>
    where
        T: core::fmt::Display,
    {
        Err(Error::TypeNotYetSupported("collect_str"))
    }
}

impl<'a, 'b, W> SerializeSeq for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        // Offsets of dynamic array elements are relative to the first
        // element, not to the length slot in front of it.
        self.encode_element(value, SLOT_SIZE)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W> SerializeTuple for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.encode_element(value, 0)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W> SerializeTupleStruct for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.encode_element(value, 0)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl<'a, 'b, W> SerializeStruct for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, _name: &'static str, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        self.encode_element(value, 0)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

// Enums and maps are rejected when serialization starts, these are never
// reached.

impl<'a, 'b, W> SerializeTupleVariant for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, _value: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("tuple variant (enum)"))
    }

    fn end(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("tuple variant (enum)"))
    }
}

impl<'a, 'b, W> SerializeMap for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_key<T: ?Sized>(&mut self, _key: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("map"))
    }

    fn serialize_value<T: ?Sized>(&mut self, _value: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("map"))
    }

    fn end(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("map"))
    }
}

impl<'a, 'b, W> SerializeStructVariant for &'a mut Serializer<'b, W>
where
    W: Writer,
{
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: ?Sized>(&mut self, _key: &'static str, _value: &T) -> Result<()>
    where
        T: Serialize,
    {
        Err(Error::TypeNotRepresentable("struct variant"))
    }

    fn end(self) -> Result<()> {
        Err(Error::TypeNotRepresentable("struct variant"))
    }
}
