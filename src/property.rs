/*!
 * Typed, self-describing fields shared by atoms and descriptors.
 *
 * Every [`Property`] has a name used for path lookup, a [`PropertyValue`] and a [`Presence`] rule
 * deciding whether it appears on disk. Scalar kinds hold a vector of values so that table
 * columns and plain fields share one indexed get/set API.
 */

use std::io;

use winnow::{
    binary::u8 as any_u8,
    combinator::{fail, trace},
    error::StrContext,
    token::take,
    ModalResult, Parser,
};

use crate::{
    atom::util::{
        parser::{
            c_string, pascal_string, rest_vec, utf8_string, Stream, FIXED_POINT_16X16_SCALE,
            FIXED_POINT_8X8_SCALE,
        },
        HexPreview,
    },
    descriptor::{Descriptor, TagRange},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Always,
    /// Kept in memory only, never read from or written to disk.
    Implicit,
    /// Present while the given bit of the sibling `flags` property is clear.
    UnlessFlag(u32),
    /// Present while the named sibling integer is non-zero.
    IfNonZero(&'static str),
    /// Present while the named sibling integer is zero.
    IfZero(&'static str),
}

impl Presence {
    pub(crate) fn is_present(&self, siblings: &[Property]) -> bool {
        let sibling = |name: &str| {
            siblings
                .iter()
                .find(|p| p.name == name)
                .and_then(|p| p.integer(0).ok())
        };
        match *self {
            Presence::Always => true,
            Presence::Implicit => false,
            Presence::UnlessFlag(bit) => sibling("flags").is_none_or(|flags| flags & u64::from(bit) == 0),
            Presence::IfNonZero(name) => sibling(name).is_some_and(|v| v != 0),
            Presence::IfZero(name) => sibling(name).is_none_or(|v| v == 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatFormat {
    Ieee,
    Fixed16x16,
    Fixed8x8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFormat {
    NullTerminated,
    /// One length byte followed by at most 255 bytes.
    Counted,
    /// Exactly `n` bytes, NUL padded.
    Fixed(usize),
    ToEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BytesFormat {
    Fixed(usize),
    ToEnd,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// Sibling property holding the row count.
    pub(crate) count: &'static str,
    /// Rows run to the end of the container rather than being read from `count`.
    pub(crate) fill_to_end: bool,
    pub(crate) columns: Vec<Property>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorArray {
    pub(crate) tags: TagRange,
    pub(crate) max: Option<usize>,
    pub(crate) descriptors: Vec<Descriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Integer { bits: u8, values: Vec<u64> },
    Float { format: FloatFormat, values: Vec<f32> },
    String { format: StringFormat, values: Vec<String> },
    Bytes { format: BytesFormat, values: Vec<Vec<u8>> },
    /// Padding; parsed bytes are kept so unmodified files round-trip.
    Reserved(Vec<u8>),
    Table(Table),
    Descriptors(DescriptorArray),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PropertyKind {
    #[display("integer")]
    Integer,
    #[display("float")]
    Float,
    #[display("string")]
    String,
    #[display("bytes")]
    Bytes,
    #[display("reserved")]
    Reserved,
    #[display("table")]
    Table,
    #[display("descriptor")]
    Descriptor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub(crate) name: &'static str,
    pub(crate) value: PropertyValue,
    pub(crate) presence: Presence,
}

fn mask(bits: u8) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

// constructors
impl Property {
    fn new(name: &'static str, value: PropertyValue) -> Self {
        Self {
            name,
            value,
            presence: Presence::Always,
        }
    }

    pub fn bits(name: &'static str, bits: u8) -> Self {
        Self::new(
            name,
            PropertyValue::Integer {
                bits,
                values: vec![0],
            },
        )
    }

    pub fn u8(name: &'static str) -> Self {
        Self::bits(name, 8)
    }

    pub fn u16(name: &'static str) -> Self {
        Self::bits(name, 16)
    }

    pub fn u24(name: &'static str) -> Self {
        Self::bits(name, 24)
    }

    pub fn u32(name: &'static str) -> Self {
        Self::bits(name, 32)
    }

    pub fn u64(name: &'static str) -> Self {
        Self::bits(name, 64)
    }

    /// 32 or 64 bit integer depending on an atom version.
    pub fn versioned(name: &'static str, version: u8) -> Self {
        if version == 1 {
            Self::u64(name)
        } else {
            Self::u32(name)
        }
    }

    pub fn floating(name: &'static str, format: FloatFormat) -> Self {
        Self::new(
            name,
            PropertyValue::Float {
                format,
                values: vec![0.0],
            },
        )
    }

    pub fn text(name: &'static str, format: StringFormat) -> Self {
        Self::new(
            name,
            PropertyValue::String {
                format,
                values: vec![String::new()],
            },
        )
    }

    pub fn blob(name: &'static str, format: BytesFormat) -> Self {
        let initial = match format {
            BytesFormat::Fixed(n) => vec![0u8; n],
            BytesFormat::ToEnd => Vec::new(),
        };
        Self::new(
            name,
            PropertyValue::Bytes {
                format,
                values: vec![initial],
            },
        )
    }

    pub fn reserved(name: &'static str, len: usize) -> Self {
        Self::new(name, PropertyValue::Reserved(vec![0u8; len]))
    }

    /// Reserved bytes with a non-zero generated value.
    pub fn reserved_with(name: &'static str, bytes: &[u8]) -> Self {
        Self::new(name, PropertyValue::Reserved(bytes.to_vec()))
    }

    pub fn table(name: &'static str, count: &'static str, columns: Vec<Property>) -> Self {
        Self::new(
            name,
            PropertyValue::Table(Table {
                count,
                fill_to_end: false,
                columns: columns.into_iter().map(Property::cleared).collect(),
            }),
        )
    }

    /// Table whose rows extend to the end of the container; `count` is an implicit sibling.
    pub fn table_to_end(name: &'static str, count: &'static str, columns: Vec<Property>) -> Self {
        let mut table = Self::table(name, count, columns);
        if let PropertyValue::Table(t) = &mut table.value {
            t.fill_to_end = true;
        }
        table
    }

    pub fn descriptor_array(name: &'static str, tags: TagRange, max: Option<usize>) -> Self {
        Self::new(
            name,
            PropertyValue::Descriptors(DescriptorArray {
                tags,
                max,
                descriptors: Vec::new(),
            }),
        )
    }

    pub fn implicit(mut self) -> Self {
        self.presence = Presence::Implicit;
        self
    }

    pub fn unless_flag(mut self, bit: u32) -> Self {
        self.presence = Presence::UnlessFlag(bit);
        self
    }

    pub fn if_non_zero(mut self, sibling: &'static str) -> Self {
        self.presence = Presence::IfNonZero(sibling);
        self
    }

    pub fn if_zero(mut self, sibling: &'static str) -> Self {
        self.presence = Presence::IfZero(sibling);
        self
    }

    /// Turns a scalar template into a fixed-length array of `len` values.
    pub fn array(mut self, len: usize) -> Self {
        match &mut self.value {
            PropertyValue::Integer { values, .. } => values.resize(len, 0),
            PropertyValue::Float { values, .. } => values.resize(len, 0.0),
            PropertyValue::String { values, .. } => values.resize(len, String::new()),
            PropertyValue::Bytes { values, .. } => values.resize(len, Vec::new()),
            _ => {}
        }
        self
    }

    pub fn with_integer(mut self, value: u64) -> Self {
        if let PropertyValue::Integer { bits, values } = &mut self.value {
            values.iter_mut().for_each(|v| *v = value & mask(*bits));
        }
        self
    }

    pub fn with_integers(mut self, new_values: &[u64]) -> Self {
        if let PropertyValue::Integer { bits, values } = &mut self.value {
            *values = new_values.iter().map(|v| v & mask(*bits)).collect();
        }
        self
    }

    pub fn with_float(mut self, value: f32) -> Self {
        if let PropertyValue::Float { values, .. } = &mut self.value {
            values.iter_mut().for_each(|v| *v = value);
        }
        self
    }

    pub fn with_string(mut self, value: &str) -> Self {
        if let PropertyValue::String { values, .. } = &mut self.value {
            values.iter_mut().for_each(|v| *v = value.to_string());
        }
        self
    }

    pub fn with_bytes(mut self, value: Vec<u8>) -> Self {
        if let PropertyValue::Bytes { values, .. } = &mut self.value {
            *values = vec![value];
        }
        self
    }

    fn cleared(mut self) -> Self {
        self.truncate(0);
        self
    }
}

// accessors
impl Property {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn value(&self) -> &PropertyValue {
        &self.value
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    pub fn is_implicit(&self) -> bool {
        self.presence == Presence::Implicit
    }

    pub fn kind(&self) -> PropertyKind {
        match self.value {
            PropertyValue::Integer { .. } => PropertyKind::Integer,
            PropertyValue::Float { .. } => PropertyKind::Float,
            PropertyValue::String { .. } => PropertyKind::String,
            PropertyValue::Bytes { .. } => PropertyKind::Bytes,
            PropertyValue::Reserved(_) => PropertyKind::Reserved,
            PropertyValue::Table(_) => PropertyKind::Table,
            PropertyValue::Descriptors(_) => PropertyKind::Descriptor,
        }
    }

    /// Number of values, table rows or descriptors.
    pub fn len(&self) -> usize {
        match &self.value {
            PropertyValue::Integer { values, .. } => values.len(),
            PropertyValue::Float { values, .. } => values.len(),
            PropertyValue::String { values, .. } => values.len(),
            PropertyValue::Bytes { values, .. } => values.len(),
            PropertyValue::Reserved(_) => 1,
            PropertyValue::Table(table) => table.rows(),
            PropertyValue::Descriptors(array) => array.descriptors.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mismatch(&self, expected: PropertyKind) -> Error {
        Error::type_mismatch(format!(
            "{} is {}, not {expected}",
            self.name,
            self.kind()
        ))
    }

    fn out_of_range(&self, index: usize) -> Error {
        Error::not_found(format!("{}[{index}]", self.name))
    }

    pub fn integer(&self, index: usize) -> Result<u64> {
        match &self.value {
            PropertyValue::Integer { values, .. } => values
                .get(index)
                .copied()
                .ok_or_else(|| self.out_of_range(index)),
            _ => Err(self.mismatch(PropertyKind::Integer)),
        }
    }

    /// Values wider than the field are masked to its width.
    pub fn set_integer(&mut self, index: usize, value: u64) -> Result<()> {
        match &mut self.value {
            PropertyValue::Integer { bits, values } => {
                let bits = *bits;
                if let Some(slot) = values.get_mut(index) {
                    *slot = value & mask(bits);
                    return Ok(());
                }
            }
            _ => return Err(self.mismatch(PropertyKind::Integer)),
        }
        Err(self.out_of_range(index))
    }

    pub fn add_integer(&mut self, value: u64) -> Result<()> {
        match &mut self.value {
            PropertyValue::Integer { bits, values } => {
                values.push(value & mask(*bits));
                Ok(())
            }
            _ => Err(self.mismatch(PropertyKind::Integer)),
        }
    }

    pub fn increment(&mut self, index: usize, by: i64) -> Result<u64> {
        let value = self.integer(index)?.wrapping_add_signed(by);
        self.set_integer(index, value)?;
        self.integer(index)
    }

    pub fn float(&self, index: usize) -> Result<f32> {
        match &self.value {
            PropertyValue::Float { values, .. } => values
                .get(index)
                .copied()
                .ok_or_else(|| self.out_of_range(index)),
            _ => Err(self.mismatch(PropertyKind::Float)),
        }
    }

    pub fn set_float(&mut self, index: usize, value: f32) -> Result<()> {
        match &mut self.value {
            PropertyValue::Float { values, .. } => {
                if let Some(slot) = values.get_mut(index) {
                    *slot = value;
                    return Ok(());
                }
            }
            _ => return Err(self.mismatch(PropertyKind::Float)),
        }
        Err(self.out_of_range(index))
    }

    pub fn string(&self, index: usize) -> Result<String> {
        match &self.value {
            PropertyValue::String { values, .. } => values
                .get(index)
                .cloned()
                .ok_or_else(|| self.out_of_range(index)),
            _ => Err(self.mismatch(PropertyKind::String)),
        }
    }

    pub fn set_string(&mut self, index: usize, value: &str) -> Result<()> {
        match &mut self.value {
            PropertyValue::String { values, .. } => {
                if let Some(slot) = values.get_mut(index) {
                    *slot = value.to_string();
                    return Ok(());
                }
            }
            _ => return Err(self.mismatch(PropertyKind::String)),
        }
        Err(self.out_of_range(index))
    }

    pub fn add_string(&mut self, value: &str) -> Result<()> {
        match &mut self.value {
            PropertyValue::String { values, .. } => {
                values.push(value.to_string());
                Ok(())
            }
            _ => Err(self.mismatch(PropertyKind::String)),
        }
    }

    /// Returns an owned copy of the buffer.
    pub fn bytes(&self, index: usize) -> Result<Vec<u8>> {
        match &self.value {
            PropertyValue::Bytes { values, .. } => values
                .get(index)
                .cloned()
                .ok_or_else(|| self.out_of_range(index)),
            _ => Err(self.mismatch(PropertyKind::Bytes)),
        }
    }

    /// Fixed-width buffers are zero padded or truncated to their width.
    pub fn set_bytes(&mut self, index: usize, value: Vec<u8>) -> Result<()> {
        match &mut self.value {
            PropertyValue::Bytes { format, values } => {
                if let Some(slot) = values.get_mut(index) {
                    *slot = value;
                    if let BytesFormat::Fixed(n) = format {
                        slot.resize(*n, 0);
                    }
                    return Ok(());
                }
            }
            _ => return Err(self.mismatch(PropertyKind::Bytes)),
        }
        Err(self.out_of_range(index))
    }

    /// Removes value, row or descriptor `index`.
    pub fn delete(&mut self, index: usize) -> Result<()> {
        if index >= self.len() {
            return Err(self.out_of_range(index));
        }
        match &mut self.value {
            PropertyValue::Integer { values, .. } => {
                values.remove(index);
            }
            PropertyValue::Float { values, .. } => {
                values.remove(index);
            }
            PropertyValue::String { values, .. } => {
                values.remove(index);
            }
            PropertyValue::Bytes { values, .. } => {
                values.remove(index);
            }
            PropertyValue::Table(table) => {
                for column in &mut table.columns {
                    if index < column.len() {
                        column.delete(index)?;
                    }
                }
            }
            PropertyValue::Descriptors(array) => {
                array.descriptors.remove(index);
            }
            PropertyValue::Reserved(_) => return Err(self.mismatch(PropertyKind::Integer)),
        }
        Ok(())
    }

    pub(crate) fn truncate(&mut self, len: usize) {
        match &mut self.value {
            PropertyValue::Integer { values, .. } => values.truncate(len),
            PropertyValue::Float { values, .. } => values.truncate(len),
            PropertyValue::String { values, .. } => values.truncate(len),
            PropertyValue::Bytes { values, .. } => values.truncate(len),
            PropertyValue::Table(table) => table.columns.iter_mut().for_each(|c| c.truncate(len)),
            PropertyValue::Descriptors(array) => array.descriptors.truncate(len),
            PropertyValue::Reserved(_) => {}
        }
    }

    /// Appends a default value (zero, empty, or zero-filled to a fixed width).
    fn push_default(&mut self) {
        match &mut self.value {
            PropertyValue::Integer { values, .. } => values.push(0),
            PropertyValue::Float { values, .. } => values.push(0.0),
            PropertyValue::String { values, .. } => values.push(String::new()),
            PropertyValue::Bytes { format, values } => values.push(match format {
                BytesFormat::Fixed(n) => vec![0; *n],
                BytesFormat::ToEnd => Vec::new(),
            }),
            PropertyValue::Table(table) => table.columns.iter_mut().for_each(Property::push_default),
            PropertyValue::Reserved(_) | PropertyValue::Descriptors(_) => {}
        }
    }

    pub fn columns(&self) -> Option<&[Property]> {
        match &self.value {
            PropertyValue::Table(table) => Some(&table.columns),
            _ => None,
        }
    }

    pub fn columns_mut(&mut self) -> Option<&mut [Property]> {
        match &mut self.value {
            PropertyValue::Table(table) => Some(&mut table.columns),
            _ => None,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Property> {
        self.columns()?
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Property> {
        self.columns_mut()?
            .iter_mut()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn descriptors(&self) -> Option<&[Descriptor]> {
        match &self.value {
            PropertyValue::Descriptors(array) => Some(&array.descriptors),
            _ => None,
        }
    }

    pub fn descriptors_mut(&mut self) -> Option<&mut Vec<Descriptor>> {
        match &mut self.value {
            PropertyValue::Descriptors(array) => Some(&mut array.descriptors),
            _ => None,
        }
    }

    /// Appends a generated descriptor and returns it for further configuration.
    pub fn add_descriptor(&mut self, tag: u8) -> Result<&mut Descriptor> {
        let name = self.name;
        let mismatch = self.mismatch(PropertyKind::Descriptor);
        match &mut self.value {
            PropertyValue::Descriptors(array) => {
                if !array.tags.contains(tag) {
                    return Err(Error::invalid(format!(
                        "descriptor tag {tag:#04x} not allowed in {name}"
                    )));
                }
                array.descriptors.push(Descriptor::generate(tag));
                let index = array.descriptors.len() - 1;
                Ok(&mut array.descriptors[index])
            }
            _ => Err(mismatch),
        }
    }

    pub fn delete_descriptor(&mut self, index: usize) -> Result<()> {
        match self.kind() {
            PropertyKind::Descriptor => self.delete(index),
            _ => Err(self.mismatch(PropertyKind::Descriptor)),
        }
    }
}

impl Table {
    fn rows(&self) -> usize {
        self.columns
            .iter()
            .find(|c| !c.is_implicit())
            .or(self.columns.first())
            .map_or(0, Property::len)
    }

    /// Width of one row when every column has a fixed width.
    fn row_bits(&self) -> Option<u64> {
        self.columns
            .iter()
            .filter(|c| !c.is_implicit())
            .map(Property::fixed_value_bits)
            .sum()
    }
}

/// Appends an empty row and keeps the table's count sibling in step. Returns the new row index.
pub fn add_table_row(properties: &mut [Property], table: &str) -> Result<usize> {
    let (table_index, count) = table_and_count(properties, table)?;
    properties[table_index].push_default();
    let rows = properties[table_index].len();
    if let Some(count) = count {
        properties[count].set_integer(0, rows as u64)?;
    }
    Ok(rows - 1)
}

pub fn delete_table_row(properties: &mut [Property], table: &str, row: usize) -> Result<()> {
    let (table_index, count) = table_and_count(properties, table)?;
    properties[table_index].delete(row)?;
    let rows = properties[table_index].len();
    if let Some(count) = count {
        properties[count].set_integer(0, rows as u64)?;
    }
    Ok(())
}

fn table_and_count(properties: &[Property], table: &str) -> Result<(usize, Option<usize>)> {
    let table_index = properties
        .iter()
        .position(|p| p.name.eq_ignore_ascii_case(table))
        .ok_or_else(|| Error::not_found(table.to_string()))?;
    let PropertyValue::Table(t) = &properties[table_index].value else {
        return Err(properties[table_index].mismatch(PropertyKind::Table));
    };
    let count = properties.iter().position(|p| p.name == t.count);
    Ok((table_index, count))
}

/// Reads big-endian fields that may be narrower than a byte.
pub(crate) struct BitReader<'a, 'i> {
    input: &'a mut Stream<'i>,
    acc: u8,
    available: u8,
}

impl<'a, 'i> BitReader<'a, 'i> {
    pub fn new(input: &'a mut Stream<'i>) -> Self {
        Self {
            input,
            acc: 0,
            available: 0,
        }
    }

    /// Byte-aligned access to the underlying stream. Unread bits of a partial byte are dropped.
    pub fn input(&mut self) -> &mut Stream<'i> {
        self.available = 0;
        self.input
    }

    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    pub fn read_bits(&mut self, bits: u8) -> ModalResult<u64> {
        if self.available == 0 && bits % 8 == 0 {
            let bytes: &[u8] = take(usize::from(bits / 8)).parse_next(self.input)?;
            return Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)));
        }
        let mut value = 0u64;
        for _ in 0..bits {
            if self.available == 0 {
                self.acc = any_u8.parse_next(self.input)?;
                self.available = 8;
            }
            self.available -= 1;
            value = (value << 1) | u64::from((self.acc >> self.available) & 1);
        }
        Ok(value)
    }
}

pub(crate) struct BitWriter<'a> {
    out: &'a mut Vec<u8>,
    acc: u8,
    used: u8,
}

impl<'a> BitWriter<'a> {
    pub fn new(out: &'a mut Vec<u8>) -> Self {
        Self { out, acc: 0, used: 0 }
    }

    pub fn write_bits(&mut self, value: u64, bits: u8) {
        if self.used == 0 && bits % 8 == 0 {
            let bytes = value.to_be_bytes();
            self.out.extend_from_slice(&bytes[8 - usize::from(bits / 8)..]);
            return;
        }
        for i in (0..bits).rev() {
            self.acc = (self.acc << 1) | ((value >> i) & 1) as u8;
            self.used += 1;
            if self.used == 8 {
                self.out.push(self.acc);
                self.acc = 0;
                self.used = 0;
            }
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.align();
        self.out.extend_from_slice(bytes);
    }

    /// Zero pads a partially written byte.
    pub fn align(&mut self) {
        if self.used > 0 {
            self.out.push(self.acc << (8 - self.used));
            self.acc = 0;
            self.used = 0;
        }
    }

    pub fn out(&mut self) -> &mut Vec<u8> {
        self.align();
        self.out
    }
}

pub(crate) fn read_properties(
    reader: &mut BitReader<'_, '_>,
    properties: &mut [Property],
) -> ModalResult<()> {
    for i in 0..properties.len() {
        let (before, rest) = properties.split_at_mut(i);
        let property = &mut rest[0];
        if !property.presence.is_present(before) {
            continue;
        }
        property.read(reader, before)?;
    }
    Ok(())
}

pub(crate) fn write_properties(writer: &mut BitWriter<'_>, properties: &[Property]) {
    for property in properties {
        if property.presence.is_present(properties) {
            property.write(writer);
        }
    }
    writer.align();
}

/// Serialized size in bytes of the present properties.
pub(crate) fn properties_size(properties: &[Property]) -> u64 {
    let bits: u64 = properties
        .iter()
        .filter(|p| p.presence.is_present(properties))
        .map(Property::size_bits)
        .sum();
    bits.div_ceil(8)
}

// serialization
impl Property {
    pub(crate) fn read(
        &mut self,
        reader: &mut BitReader<'_, '_>,
        siblings: &mut [Property],
    ) -> ModalResult<()> {
        let name = self.name;
        match &mut self.value {
            PropertyValue::Reserved(bytes) => {
                let data: &[u8] = take(bytes.len())
                    .context(StrContext::Label(name))
                    .parse_next(reader.input())?;
                *bytes = data.to_vec();
            }
            PropertyValue::Table(table) => {
                let rows = if table.fill_to_end {
                    let row_bytes = table.row_bits().unwrap_or(0) / 8;
                    if row_bytes == 0 {
                        0
                    } else {
                        reader.remaining() as u64 / row_bytes
                    }
                } else {
                    siblings
                        .iter()
                        .find(|p| p.name == table.count)
                        .and_then(|p| p.integer(0).ok())
                        .unwrap_or(0)
                };
                table.columns.iter_mut().for_each(|c| c.truncate(0));
                for _ in 0..rows {
                    for column in &mut table.columns {
                        if column.is_implicit() {
                            column.push_default();
                        } else {
                            column.read_value(reader)?;
                        }
                    }
                }
                if table.fill_to_end {
                    if let Some(PropertyValue::Integer { values, .. }) = siblings
                        .iter_mut()
                        .find(|p| p.name == table.count)
                        .map(|p| &mut p.value)
                    {
                        *values = vec![rows];
                    }
                }
            }
            PropertyValue::Descriptors(array) => {
                array.descriptors.clear();
                let input = reader.input();
                while array.max.is_none_or(|max| array.descriptors.len() < max) {
                    match input.first() {
                        Some(tag) if array.tags.contains(*tag) => {
                            array.descriptors.push(Descriptor::parse(input)?);
                        }
                        _ => break,
                    }
                }
            }
            _ => {
                let n = self.len();
                self.truncate(0);
                for _ in 0..n {
                    self.read_value(reader)?;
                }
            }
        }
        Ok(())
    }

    /// Reads one value and appends it.
    fn read_value(&mut self, reader: &mut BitReader<'_, '_>) -> ModalResult<()> {
        let name = self.name;
        match &mut self.value {
            PropertyValue::Integer { bits, values } => {
                values.push(reader.read_bits(*bits)?);
            }
            PropertyValue::Float { format, values } => {
                let value = match format {
                    FloatFormat::Ieee => f32::from_bits(reader.read_bits(32)? as u32),
                    FloatFormat::Fixed16x16 => {
                        reader.read_bits(32)? as u32 as f32 / FIXED_POINT_16X16_SCALE
                    }
                    FloatFormat::Fixed8x8 => {
                        reader.read_bits(16)? as u16 as f32 / FIXED_POINT_8X8_SCALE
                    }
                };
                values.push(value);
            }
            PropertyValue::String { format, values } => {
                let input = reader.input();
                let value = match format {
                    StringFormat::NullTerminated => c_string.parse_next(input)?,
                    StringFormat::Counted => pascal_string.parse_next(input)?,
                    StringFormat::Fixed(n) => {
                        let data: &[u8] = take(*n).parse_next(input)?;
                        let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
                        String::from_utf8_lossy(&data[..end]).into_owned()
                    }
                    StringFormat::ToEnd => utf8_string.parse_next(input)?,
                };
                values.push(value);
            }
            PropertyValue::Bytes { format, values } => {
                let input = reader.input();
                let value = match format {
                    BytesFormat::Fixed(n) => {
                        let data: &[u8] = take(*n).parse_next(input)?;
                        data.to_vec()
                    }
                    BytesFormat::ToEnd => rest_vec.parse_next(input)?,
                };
                values.push(value);
            }
            PropertyValue::Reserved(_)
            | PropertyValue::Table(_)
            | PropertyValue::Descriptors(_) => {
                return trace("nested", fail)
                    .context(StrContext::Label(name))
                    .parse_next(reader.input());
            }
        }
        Ok(())
    }

    pub(crate) fn write(&self, writer: &mut BitWriter<'_>) {
        match &self.value {
            PropertyValue::Reserved(bytes) => writer.write_bytes(bytes),
            PropertyValue::Table(table) => {
                for row in 0..table.rows() {
                    for column in table.columns.iter().filter(|c| !c.is_implicit()) {
                        column.write_value(writer, row);
                    }
                }
            }
            PropertyValue::Descriptors(array) => {
                for descriptor in &array.descriptors {
                    descriptor.write(writer.out());
                }
            }
            _ => {
                for index in 0..self.len() {
                    self.write_value(writer, index);
                }
            }
        }
    }

    fn write_value(&self, writer: &mut BitWriter<'_>, index: usize) {
        match &self.value {
            PropertyValue::Integer { bits, values } => {
                writer.write_bits(values.get(index).copied().unwrap_or(0), *bits);
            }
            PropertyValue::Float { format, values } => {
                let value = values.get(index).copied().unwrap_or(0.0);
                match format {
                    FloatFormat::Ieee => writer.write_bits(u64::from(value.to_bits()), 32),
                    FloatFormat::Fixed16x16 => writer.write_bits(
                        u64::from((value * FIXED_POINT_16X16_SCALE) as u32),
                        32,
                    ),
                    FloatFormat::Fixed8x8 => writer.write_bits(
                        u64::from((value * FIXED_POINT_8X8_SCALE) as u16),
                        16,
                    ),
                }
            }
            PropertyValue::String { format, values } => {
                let value = values.get(index).map_or(&[][..], |s| s.as_bytes());
                match format {
                    StringFormat::NullTerminated => {
                        writer.write_bytes(value);
                        writer.write_bytes(&[0]);
                    }
                    StringFormat::Counted => {
                        let len = value.len().min(255);
                        writer.write_bytes(&[len as u8]);
                        writer.write_bytes(&value[..len]);
                    }
                    StringFormat::Fixed(n) => {
                        let mut buf = vec![0u8; *n];
                        let len = value.len().min(*n);
                        buf[..len].copy_from_slice(&value[..len]);
                        writer.write_bytes(&buf);
                    }
                    StringFormat::ToEnd => writer.write_bytes(value),
                }
            }
            PropertyValue::Bytes { values, .. } => {
                writer.write_bytes(values.get(index).map_or(&[][..], Vec::as_slice));
            }
            PropertyValue::Reserved(_)
            | PropertyValue::Table(_)
            | PropertyValue::Descriptors(_) => self.write(writer),
        }
    }

    fn fixed_value_bits(&self) -> Option<u64> {
        match &self.value {
            PropertyValue::Integer { bits, .. } => Some(u64::from(*bits)),
            PropertyValue::Float { format, .. } => Some(match format {
                FloatFormat::Fixed8x8 => 16,
                _ => 32,
            }),
            PropertyValue::String {
                format: StringFormat::Fixed(n),
                ..
            }
            | PropertyValue::Bytes {
                format: BytesFormat::Fixed(n),
                ..
            } => Some(*n as u64 * 8),
            _ => None,
        }
    }

    fn value_bits(&self, index: usize) -> u64 {
        if let Some(bits) = self.fixed_value_bits() {
            return bits;
        }
        match &self.value {
            PropertyValue::String { format, values } => {
                let len = values.get(index).map_or(0, String::len) as u64;
                8 * match format {
                    StringFormat::NullTerminated => len + 1,
                    StringFormat::Counted => 1 + len.min(255),
                    _ => len,
                }
            }
            PropertyValue::Bytes { values, .. } => {
                8 * values.get(index).map_or(0, Vec::len) as u64
            }
            _ => 0,
        }
    }

    pub(crate) fn size_bits(&self) -> u64 {
        match &self.value {
            PropertyValue::Reserved(bytes) => bytes.len() as u64 * 8,
            PropertyValue::Table(table) => (0..table.rows())
                .map(|row| {
                    table
                        .columns
                        .iter()
                        .filter(|c| !c.is_implicit())
                        .map(|c| c.value_bits(row))
                        .sum::<u64>()
                })
                .sum(),
            PropertyValue::Descriptors(array) => {
                array.descriptors.iter().map(|d| d.size() * 8).sum()
            }
            _ => (0..self.len()).map(|i| self.value_bits(i)).sum(),
        }
    }
}

// dump
impl Property {
    pub(crate) fn dump(
        &self,
        out: &mut dyn io::Write,
        indent: usize,
        dump_implicits: bool,
    ) -> io::Result<()> {
        if self.is_implicit() && !dump_implicits {
            return Ok(());
        }
        let pad = indent * 2;
        match &self.value {
            PropertyValue::Table(table) => {
                for row in 0..table.rows() {
                    for column in &table.columns {
                        if column.is_implicit() && !dump_implicits {
                            continue;
                        }
                        let label = format!("{}[{row}].{}", self.name, column.name);
                        column.dump_value(out, pad, &label, row)?;
                    }
                }
            }
            PropertyValue::Descriptors(array) => {
                for descriptor in &array.descriptors {
                    descriptor.dump(out, indent, dump_implicits)?;
                }
            }
            PropertyValue::Reserved(bytes) => {
                writeln!(out, "{:pad$}{} = {}", "", self.name, HexPreview(bytes))?;
            }
            _ => {
                let multi = self.len() > 1;
                for index in 0..self.len() {
                    let label = if multi {
                        format!("{}[{index}]", self.name)
                    } else {
                        self.name.to_string()
                    };
                    self.dump_value(out, pad, &label, index)?;
                }
            }
        }
        Ok(())
    }

    fn dump_value(
        &self,
        out: &mut dyn io::Write,
        pad: usize,
        label: &str,
        index: usize,
    ) -> io::Result<()> {
        match &self.value {
            PropertyValue::Integer { values, .. } => {
                let v = values.get(index).copied().unwrap_or(0);
                writeln!(out, "{:pad$}{label} = {v} ({v:#x})", "")
            }
            PropertyValue::Float { values, .. } => {
                let v = values.get(index).copied().unwrap_or(0.0);
                writeln!(out, "{:pad$}{label} = {v}", "")
            }
            PropertyValue::String { values, .. } => {
                let v = values.get(index).map_or("", String::as_str);
                writeln!(out, "{:pad$}{label} = {v:?}", "")
            }
            PropertyValue::Bytes { values, .. } => {
                let v = values.get(index).map_or(&[][..], Vec::as_slice);
                writeln!(out, "{:pad$}{label} = {}", "", HexPreview(v))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::util::parser::stream;

    fn read(properties: &mut [Property], data: &[u8]) {
        let mut input = stream(data);
        let mut reader = BitReader::new(&mut input);
        read_properties(&mut reader, properties).unwrap();
    }

    fn write(properties: &[Property]) -> Vec<u8> {
        let mut out = Vec::new();
        write_properties(&mut BitWriter::new(&mut out), properties);
        out
    }

    #[test]
    fn test_integer_widths() {
        let mut props = vec![
            Property::u8("a"),
            Property::u16("b"),
            Property::u24("c"),
            Property::u32("d"),
            Property::u64("e"),
        ];
        let data = [
            1, 0, 2, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0, 5,
        ];
        read(&mut props, &data);
        let values: Vec<u64> = props.iter().map(|p| p.integer(0).unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert_eq!(properties_size(&props), 18);
        assert_eq!(write(&props), data);
    }

    #[test]
    fn test_set_integer_masks_to_width() {
        let mut prop = Property::u24("c");
        prop.set_integer(0, 0x1234_5678).unwrap();
        assert_eq!(prop.integer(0).unwrap(), 0x34_5678);
    }

    #[test]
    fn test_bit_fields() {
        let mut props = vec![
            Property::bits("objectDescriptorId", 10),
            Property::bits("URLFlag", 1),
            Property::bits("includeInlineProfileLevelFlag", 1),
            Property::bits("reserved", 4),
        ];
        read(&mut props, &[0x00, 0x5F]);
        assert_eq!(props[0].integer(0).unwrap(), 1);
        assert_eq!(props[1].integer(0).unwrap(), 0);
        assert_eq!(props[2].integer(0).unwrap(), 1);
        assert_eq!(props[3].integer(0).unwrap(), 0xF);
        assert_eq!(write(&props), vec![0x00, 0x5F]);
    }

    #[test]
    fn test_table_with_sibling_count() {
        let mut props = vec![
            Property::u32("entryCount"),
            Property::table(
                "entries",
                "entryCount",
                vec![Property::u32("sampleCount"), Property::u32("sampleDelta")],
            ),
        ];
        let data = [0, 0, 0, 2, 0, 0, 0, 10, 0, 0, 0, 160, 0, 0, 0, 1, 0, 0, 0, 80];
        read(&mut props, &data);
        let table = &props[1];
        assert_eq!(table.len(), 2);
        assert_eq!(table.column("sampleDelta").unwrap().integer(1).unwrap(), 80);
        assert_eq!(write(&props), data);

        let row = add_table_row(&mut props, "entries").unwrap();
        assert_eq!(row, 2);
        assert_eq!(props[0].integer(0).unwrap(), 3);
        delete_table_row(&mut props, "entries", 0).unwrap();
        assert_eq!(props[0].integer(0).unwrap(), 2);
        assert_eq!(props[1].column("sampleCount").unwrap().integer(0).unwrap(), 1);
    }

    #[test]
    fn test_table_to_end_sets_implicit_count() {
        let mut props = vec![
            Property::u32("entryCount").implicit(),
            Property::table_to_end("entries", "entryCount", vec![Property::u32("trackId")]),
        ];
        let data = [0, 0, 0, 1, 0, 0, 0, 2];
        read(&mut props, &data);
        assert_eq!(props[0].integer(0).unwrap(), 2);
        assert_eq!(write(&props), data);
    }

    #[test]
    fn test_presence_rules() {
        let mut props = vec![
            Property::u32("flags"),
            Property::text("location", StringFormat::NullTerminated).unless_flag(1),
        ];
        props[0].set_integer(0, 1).unwrap();
        props[1].set_string(0, "file.mp4").unwrap();
        assert_eq!(write(&props), vec![0, 0, 0, 1]);

        props[0].set_integer(0, 0).unwrap();
        assert_eq!(properties_size(&props), 4 + 9);
    }

    #[test]
    fn test_reserved_bytes_retained() {
        let mut props = vec![Property::reserved("reserved", 3)];
        read(&mut props, &[1, 2, 3]);
        assert_eq!(write(&props), vec![1, 2, 3]);
    }

    #[test]
    fn test_type_mismatch() {
        let mut prop = Property::u32("timeScale");
        let err = prop.set_string(0, "nope").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::TypeMismatch);
        let err = prop.integer(4).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn test_fixed_point_floats() {
        let mut props = vec![
            Property::floating("rate", FloatFormat::Fixed16x16),
            Property::floating("volume", FloatFormat::Fixed8x8),
        ];
        read(&mut props, &[0, 1, 0, 0, 1, 0]);
        assert_eq!(props[0].float(0).unwrap(), 1.0);
        assert_eq!(props[1].float(0).unwrap(), 1.0);
    }
}
