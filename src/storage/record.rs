//! Variable-length record codec.
//!
//! A record is stored as a self-describing byte string:
//!
//! ```text
//! <null bitmap>\n<offset,size:offset,size:...>\n<fixed:fixed:...>\n<variable bytes>
//! ```
//!
//! Fixed-width columns are written as their textual value, `:`-separated, in
//! schema order. String columns are concatenated into the variable segment
//! and located by one `(offset, size)` pair each, relative to the start of
//! that segment. Bit `i` of the null bitmap is set iff column `i` holds a
//! non-empty value.
use std::{fmt::Display, str::FromStr};

use log::trace;

use super::{
    column::Schema,
    error::StorageError,
    header::record::{FIELD_SEP, LOCATION_SEP, TERM},
};

/// Byte range inside a record's variable segment or a block's record buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct LocationPair {
    offset: u32,
    size: u32,
}

impl LocationPair {
    pub fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub(crate) fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..self.end()
    }

    pub(crate) fn end(&self) -> usize {
        self.offset as usize + self.size as usize
    }
}

/// Lays the pairs out back to back: every offset becomes the sum of the
/// sizes before it.
pub(crate) fn recompute_offsets(locations: &mut [LocationPair]) {
    let mut offset = 0;
    for location in locations.iter_mut() {
        location.offset = offset;
        offset += location.size;
    }
}

pub(crate) fn encode_locations(locations: &[LocationPair], out: &mut Vec<u8>) {
    for (i, location) in locations.iter().enumerate() {
        if i > 0 {
            out.push(FIELD_SEP);
        }
        out.extend_from_slice(location.offset.to_string().as_bytes());
        out.push(LOCATION_SEP);
        out.extend_from_slice(location.size.to_string().as_bytes());
    }
}

pub(crate) fn encoded_locations_len(locations: &[LocationPair]) -> usize {
    let pairs: usize = locations
        .iter()
        .map(|l| digits(l.offset as u64) + 1 + digits(l.size as u64))
        .sum();
    pairs + locations.len().saturating_sub(1)
}

pub(crate) fn parse_locations(
    bytes: &[u8],
    context: &'static str,
) -> Result<Vec<LocationPair>, StorageError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    bytes
        .split(|b| *b == FIELD_SEP)
        .map(|pair| {
            let sep = pair
                .iter()
                .position(|b| *b == LOCATION_SEP)
                .ok_or_else(|| StorageError::parse(context, "location pair without ','"))?;
            Ok(LocationPair::new(
                parse_int(&pair[..sep], context)?,
                parse_int(&pair[sep + 1..], context)?,
            ))
        })
        .collect()
}

/// Checked textual integer parsing straight off the byte slice.
pub(crate) fn parse_int<T>(bytes: &[u8], context: &'static str) -> Result<T, StorageError>
where
    T: FromStr,
    T::Err: Display,
{
    let text =
        std::str::from_utf8(bytes).map_err(|e| StorageError::parse(context, e.to_string()))?;
    text.parse::<T>()
        .map_err(|e| StorageError::parse(context, format!("'{text}': {e}")))
}

pub(crate) fn digits(n: u64) -> usize {
    n.checked_ilog10().map_or(1, |d| d as usize + 1)
}

pub(crate) fn split_term<'a>(
    bytes: &'a [u8],
    term: u8,
    context: &'static str,
) -> Result<(&'a [u8], &'a [u8]), StorageError> {
    let pos = bytes
        .iter()
        .position(|b| *b == term)
        .ok_or_else(|| StorageError::parse(context, "missing terminator"))?;
    Ok((&bytes[..pos], &bytes[pos + 1..]))
}

/// Splits a serialized record into its bitmap, locations, fixed and variable
/// segments.
fn split_record(bytes: &[u8]) -> Result<(u64, Vec<LocationPair>, &[u8], &[u8]), StorageError> {
    let (bitmap, rest) = split_term(bytes, TERM, "record null bitmap")?;
    let null_bitmap = parse_int::<u64>(bitmap, "record null bitmap")?;

    let (locations, rest) = split_term(rest, TERM, "record locations")?;
    let locations = parse_locations(locations, "record locations")?;

    let (fixed, variable) = split_term(rest, TERM, "record fixed fields")?;
    Ok((null_bitmap, locations, fixed, variable))
}

fn checked_len(column: &str, len: usize) -> Result<u32, StorageError> {
    u32::try_from(len).map_err(|_| StorageError::InvalidValue {
        column: column.to_string(),
        reason: format!("{len} bytes exceeds the maximum field length"),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    null_bitmap: u64,
    locations: Vec<LocationPair>,
    fixed: Vec<u8>,
    variable: Vec<u8>,
}

impl Record {
    /// Builds a record from column values in schema order. Values missing at
    /// the tail are nulls.
    pub fn encode<V: AsRef<[u8]>>(schema: &Schema, values: &[V]) -> Result<Self, StorageError> {
        if values.len() > schema.len() {
            return Err(StorageError::InvalidValue {
                column: "record".into(),
                reason: format!(
                    "{} values supplied for {} columns",
                    values.len(),
                    schema.len()
                ),
            });
        }

        let mut record = Record::default();
        let mut fixed: Vec<&[u8]> = Vec::with_capacity(schema.fixed_count());

        for (i, column) in schema.columns().iter().enumerate() {
            let value: &[u8] = values.get(i).map(|v| v.as_ref()).unwrap_or_default();

            if column.kind.is_variable() {
                let offset = checked_len(&column.name, record.variable.len())?;
                let size = checked_len(&column.name, value.len())?;
                record.locations.push(LocationPair::new(offset, size));
                record.variable.extend_from_slice(value);
            } else {
                column
                    .kind
                    .validate(value)
                    .map_err(|reason| StorageError::InvalidValue {
                        column: column.name.clone(),
                        reason,
                    })?;
                fixed.push(value);
            }

            if !value.is_empty() {
                record.null_bitmap |= 1 << i;
            }
        }
        record.fixed = fixed.join(&FIELD_SEP);

        Ok(record)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (null_bitmap, locations, fixed, variable) = split_record(bytes)?;
        Self::from_parts(null_bitmap, locations, fixed, variable)
    }

    /// Decodes `bytes` written under `schema`. Also accepts location lists
    /// that carry one pair per column, fixed columns included: only the
    /// string columns' sizes are kept and their offsets are laid out again.
    pub fn decode_with(schema: &Schema, bytes: &[u8]) -> Result<Self, StorageError> {
        let (null_bitmap, mut locations, fixed, variable) = split_record(bytes)?;
        if locations.len() == schema.len() && schema.variable_count() < schema.len() {
            locations = schema
                .columns()
                .iter()
                .zip(locations)
                .filter(|(column, _)| column.kind.is_variable())
                .map(|(_, location)| location)
                .collect();
            recompute_offsets(&mut locations);
        }
        Self::from_parts(null_bitmap, locations, fixed, variable)
    }

    fn from_parts(
        null_bitmap: u64,
        locations: Vec<LocationPair>,
        fixed: &[u8],
        variable: &[u8],
    ) -> Result<Self, StorageError> {
        let mut expected = 0;
        for location in locations.iter() {
            if location.offset as usize != expected {
                return Err(StorageError::parse(
                    "record locations",
                    format!("offset {} does not follow {expected}", location.offset),
                ));
            }
            expected = location.end();
        }
        if expected != variable.len() {
            return Err(StorageError::parse(
                "record locations",
                format!(
                    "locations cover {expected} bytes but the variable segment holds {}",
                    variable.len()
                ),
            ));
        }

        Ok(Self {
            null_bitmap,
            locations,
            fixed: fixed.to_vec(),
            variable: variable.to_vec(),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(self.null_bitmap.to_string().as_bytes());
        out.push(TERM);
        encode_locations(&self.locations, &mut out);
        out.push(TERM);
        out.extend_from_slice(&self.fixed);
        out.push(TERM);
        out.extend_from_slice(&self.variable);
        out
    }

    /// Length of [`Record::serialize`]'s output.
    pub fn size(&self) -> usize {
        digits(self.null_bitmap)
            + 1
            + encoded_locations_len(&self.locations)
            + 1
            + self.fixed.len()
            + 1
            + self.variable.len()
    }

    pub fn null_bitmap(&self) -> u64 {
        self.null_bitmap
    }

    pub fn is_null(&self, index: usize) -> bool {
        self.null_bitmap & (1 << index) == 0
    }

    pub fn locations(&self) -> &[LocationPair] {
        &self.locations
    }

    /// Value of `name`, `None` when the column is unknown or null.
    pub fn get_field(&self, schema: &Schema, name: &str) -> Option<&[u8]> {
        let (index, column) = schema.column(name)?;
        if self.is_null(index) {
            return None;
        }

        let ordinal = schema.ordinal(index);
        let value = if column.kind.is_variable() {
            let location = self.locations.get(ordinal)?;
            self.variable.get(location.range())?
        } else {
            self.fixed.split(|b| *b == FIELD_SEP).nth(ordinal)?
        };

        (!value.is_empty()).then_some(value)
    }

    /// Every column's value in schema order.
    pub fn values<'a>(&'a self, schema: &'a Schema) -> Vec<Option<&'a [u8]>> {
        schema
            .columns()
            .iter()
            .map(|c| self.get_field(schema, &c.name))
            .collect()
    }

    /// Replaces the value of `name`. The splice path is chosen from the
    /// column's declared type; a size change of a string field shifts the
    /// offsets of the string fields after it.
    pub fn update_field(
        &mut self,
        schema: &Schema,
        name: &str,
        value: &[u8],
    ) -> Result<(), StorageError> {
        let (index, column) = schema
            .column(name)
            .ok_or_else(|| StorageError::ColumnNotFound(name.to_string()))?;
        let ordinal = schema.ordinal(index);

        if column.kind.is_variable() {
            let size = checked_len(name, value.len())?;
            while self.locations.len() <= ordinal {
                let end = checked_len(name, self.variable.len())?;
                self.locations.push(LocationPair::new(end, 0));
            }

            let location = self.locations[ordinal];
            trace!("splicing {name} at {location:?} with {} bytes", value.len());
            self.variable.splice(location.range(), value.iter().copied());
            self.locations[ordinal].set_size(size);
            recompute_offsets(&mut self.locations);
        } else {
            column
                .kind
                .validate(value)
                .map_err(|reason| StorageError::InvalidValue {
                    column: name.to_string(),
                    reason,
                })?;

            let mut tokens: Vec<&[u8]> = if self.fixed.is_empty() {
                Vec::new()
            } else {
                self.fixed.split(|b| *b == FIELD_SEP).collect()
            };
            while tokens.len() <= ordinal {
                tokens.push(&[]);
            }
            tokens[ordinal] = value;
            self.fixed = tokens.join(&FIELD_SEP);
        }

        if value.is_empty() {
            self.null_bitmap &= !(1 << index);
        } else {
            self.null_bitmap |= 1 << index;
        }
        Ok(())
    }

    /// Populates a column the record has no value for yet, e.g. one decoded
    /// from bytes written before the schema grew.
    pub fn add_field(
        &mut self,
        schema: &Schema,
        name: &str,
        value: &[u8],
    ) -> Result<(), StorageError> {
        let index = schema
            .position(name)
            .ok_or_else(|| StorageError::ColumnNotFound(name.to_string()))?;

        if !self.is_null(index) {
            return Err(StorageError::InvalidValue {
                column: name.to_string(),
                reason: "field already holds a value".into(),
            });
        }

        self.update_field(schema, name, value)
    }
}

/// Whether `value` looks like a number: optional `-`, digits with at most one
/// `.`, and an optional exponent. Rejects the spelled-out forms (`inf`,
/// `NaN`) that float parsing would take.
pub(crate) fn is_number(value: &[u8]) -> bool {
    let value = match value {
        [b'-', rest @ ..] => rest,
        v => v,
    };

    let mut seen_digit = false;
    let mut seen_dot = false;
    for (i, b) in value.iter().enumerate() {
        match b {
            b'0'..=b'9' => seen_digit = true,
            b'.' if !seen_dot => seen_dot = true,
            b'e' | b'E' if seen_digit => {
                let exponent = &value[i + 1..];
                let exponent = exponent.strip_prefix(b"+").unwrap_or(exponent);
                return !exponent.contains(&b'.') && is_number(exponent);
            }
            _ => return false,
        }
    }
    seen_digit
}
