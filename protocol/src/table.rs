/// Fixed-layout binary tables as stored in a shot file.
///
/// A `Table` is a sequence of rows, each row being a packed record described by a `Dtype`.
/// Every field has a fixed width, all numbers are little-endian and strings are zero-padded,
/// so the same rows always produce the same bytes.
use std::fmt;

use anyhow::anyhow;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::util;
use crate::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldFormat {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    /// Zero-padded byte string of the given width.
    Str(usize),
}

impl FieldFormat {
    pub fn size(&self) -> usize {
        match self {
            FieldFormat::U8 | FieldFormat::I8 => 1,
            FieldFormat::U16 | FieldFormat::I16 => 2,
            FieldFormat::U32 | FieldFormat::I32 | FieldFormat::F32 => 4,
            FieldFormat::U64 | FieldFormat::I64 | FieldFormat::F64 => 8,
            FieldFormat::Str(n) => *n,
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, FieldFormat::F32 | FieldFormat::F64 | FieldFormat::Str(_))
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            FieldFormat::I8 | FieldFormat::I16 | FieldFormat::I32 | FieldFormat::I64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, FieldFormat::F32 | FieldFormat::F64)
    }

    /// The value stored for "not specified" in optional fields.
    pub fn sentinel(&self) -> Value {
        match self {
            FieldFormat::F32 | FieldFormat::F64 => Value::Float(f64::NAN),
            FieldFormat::Str(_) => Value::Str(String::new()),
            x if x.is_signed() => Value::Int(-1),
            _ => Value::Uint(0),
        }
    }

    /// Smallest and largest storable value of integer formats.
    pub fn integer_bounds(&self) -> (i128, i128) {
        match self {
            FieldFormat::U8 => (0, u8::MAX as i128),
            FieldFormat::U16 => (0, u16::MAX as i128),
            FieldFormat::U32 => (0, u32::MAX as i128),
            FieldFormat::U64 => (0, u64::MAX as i128),
            FieldFormat::I8 => (i8::MIN as i128, i8::MAX as i128),
            FieldFormat::I16 => (i16::MIN as i128, i16::MAX as i128),
            FieldFormat::I32 => (i32::MIN as i128, i32::MAX as i128),
            FieldFormat::I64 => (i64::MIN as i128, i64::MAX as i128),
            _ => (0, 0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub format: FieldFormat,
}

impl Field {
    pub fn new<T: Into<String>>(name: T, format: FieldFormat) -> Self {
        Self {
            name: name.into(),
            format,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DtypeRepr")]
pub struct Dtype {
    fields: Vec<Field>,
}

#[derive(Deserialize)]
struct DtypeRepr {
    fields: Vec<Field>,
}

impl TryFrom<DtypeRepr> for Dtype {
    type Error = Error;

    fn try_from(x: DtypeRepr) -> Result<Self, Self::Error> {
        Dtype::new(x.fields)
    }
}

impl Dtype {
    pub fn new(fields: Vec<Field>) -> crate::Result<Self> {
        for (k, field) in fields.iter().enumerate() {
            if fields[..k].iter().any(|x| x.name == field.name) {
                return Err(Error::argument(anyhow!("Duplicate field `{}`", field.name)));
            }
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn row_size(&self) -> usize {
        self.fields.iter().map(|x| x.format.size()).sum()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|x| x.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|x| x.name == name)
    }

    fn offset_of(&self, idx: usize) -> usize {
        self.fields[..idx].iter().map(|x| x.format.size()).sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Uint(u64),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Uint(x) => Some(*x as f64),
            Value::Int(x) => Some(*x as f64),
            Value::Float(x) => Some(*x),
            Value::Str(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Uint(x) => i64::try_from(*x).ok(),
            Value::Int(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(x) => Some(x),
            _ => None,
        }
    }

    /// True for the NaN / -1 markers of unspecified optional values.
    pub fn is_sentinel(&self) -> bool {
        match self {
            Value::Float(x) => x.is_nan(),
            Value::Int(x) => *x == -1,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Uint(x) => write!(f, "{}", x),
            Value::Int(x) => write!(f, "{}", x),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(x) => f.write_str(x),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TableRepr")]
pub struct Table {
    dtype: Dtype,
    rows: usize,
    #[serde(with = "util::base64_bytes")]
    data: Vec<u8>,
}

#[derive(Deserialize)]
struct TableRepr {
    dtype: Dtype,
    rows: usize,
    #[serde(with = "util::base64_bytes")]
    data: Vec<u8>,
}

impl TryFrom<TableRepr> for Table {
    type Error = Error;

    fn try_from(x: TableRepr) -> Result<Self, Self::Error> {
        let expected = x.rows.checked_mul(x.dtype.row_size());
        if expected != Some(x.data.len()) {
            return Err(Error::storage(anyhow!(
                "Table of {} rows of {} bytes holds {} bytes",
                x.rows,
                x.dtype.row_size(),
                x.data.len()
            )));
        }
        Ok(Self {
            dtype: x.dtype,
            rows: x.rows,
            data: x.data,
        })
    }
}

impl Table {
    pub fn new(dtype: Dtype) -> Self {
        Self {
            dtype,
            rows: 0,
            data: Vec::new(),
        }
    }

    /// A table of `rows` rows with every byte set to zero.
    pub fn zeros(dtype: Dtype, rows: usize) -> Self {
        let data = vec![0; dtype.row_size() * rows];
        Self { dtype, rows, data }
    }

    pub fn dtype(&self) -> &Dtype {
        &self.dtype
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn row_bytes(&self, row: usize) -> crate::Result<&[u8]> {
        self.check_row(row)?;
        let size = self.dtype.row_size();
        Ok(&self.data[row * size..(row + 1) * size])
    }

    pub fn push_row(&mut self, values: &[Value]) -> crate::Result<()> {
        let fields = self.dtype.fields();
        if values.len() != fields.len() {
            return Err(Error::argument(anyhow!(
                "Row has {} values but the table has {} fields",
                values.len(),
                fields.len()
            )));
        }
        let mut row = vec![0_u8; self.dtype.row_size()];
        let mut offset = 0;
        for (field, value) in fields.iter().zip(values) {
            let size = field.format.size();
            encode(field, value, &mut row[offset..offset + size])?;
            offset += size;
        }
        self.data.extend_from_slice(&row);
        self.rows += 1;
        Ok(())
    }

    pub fn set(&mut self, row: usize, name: &str, value: Value) -> crate::Result<()> {
        self.check_row(row)?;
        let idx = self.field_index(name)?;
        let field = &self.dtype.fields()[idx];
        let start = row * self.dtype.row_size() + self.dtype.offset_of(idx);
        let size = field.format.size();
        encode(field, &value, &mut self.data[start..start + size])
    }

    pub fn get(&self, row: usize, name: &str) -> crate::Result<Value> {
        self.check_row(row)?;
        let idx = self.field_index(name)?;
        let field = &self.dtype.fields()[idx];
        let start = row * self.dtype.row_size() + self.dtype.offset_of(idx);
        Ok(decode(field.format, &self.data[start..start + field.format.size()]))
    }

    pub fn row(&self, row: usize) -> crate::Result<Vec<Value>> {
        let bytes = self.row_bytes(row)?;
        let mut offset = 0;
        let mut ret = Vec::with_capacity(self.dtype.fields().len());
        for field in self.dtype.fields() {
            let size = field.format.size();
            ret.push(decode(field.format, &bytes[offset..offset + size]));
            offset += size;
        }
        Ok(ret)
    }

    pub fn column(&self, name: &str) -> crate::Result<Vec<Value>> {
        (0..self.rows).map(|row| self.get(row, name)).collect()
    }

    /// Inserts a copy of the first row in front of the table.
    pub fn repeat_first_row(&mut self) -> crate::Result<()> {
        let first = self.row_bytes(0)?.to_vec();
        self.data.splice(0..0, first);
        self.rows += 1;
        Ok(())
    }

    fn check_row(&self, row: usize) -> crate::Result<()> {
        if row >= self.rows {
            return Err(Error::argument(anyhow!(
                "Row {} out of bounds for table of length {}",
                row,
                self.rows
            )));
        }
        Ok(())
    }

    fn field_index(&self, name: &str) -> crate::Result<usize> {
        self.dtype
            .index_of(name)
            .ok_or_else(|| Error::argument(anyhow!("No such field: `{}`", name)))
    }
}

fn encode(field: &Field, value: &Value, out: &mut [u8]) -> crate::Result<()> {
    let mismatch = || {
        Error::argument(anyhow!(
            "Cannot store {:?} in field `{}` of format {:?}",
            value,
            field.name,
            field.format
        ))
    };
    match field.format {
        FieldFormat::F32 => LittleEndian::write_f32(out, value.as_f64().ok_or_else(mismatch)? as f32),
        FieldFormat::F64 => LittleEndian::write_f64(out, value.as_f64().ok_or_else(mismatch)?),
        FieldFormat::Str(n) => {
            let bytes = value.as_str().ok_or_else(mismatch)?.as_bytes();
            let len = bytes.len().min(n);
            out[..len].copy_from_slice(&bytes[..len]);
            out[len..].iter_mut().for_each(|x| *x = 0);
        }
        format => {
            let x: i128 = match value {
                Value::Uint(x) => *x as i128,
                Value::Int(x) => *x as i128,
                _ => return Err(mismatch()),
            };
            let (min, max) = format.integer_bounds();
            if x < min || x > max {
                return Err(mismatch());
            }
            match format {
                FieldFormat::U8 => out[0] = x as u8,
                FieldFormat::I8 => out[0] = (x as i8) as u8,
                FieldFormat::U16 => LittleEndian::write_u16(out, x as u16),
                FieldFormat::I16 => LittleEndian::write_i16(out, x as i16),
                FieldFormat::U32 => LittleEndian::write_u32(out, x as u32),
                FieldFormat::I32 => LittleEndian::write_i32(out, x as i32),
                FieldFormat::U64 => LittleEndian::write_u64(out, x as u64),
                FieldFormat::I64 => LittleEndian::write_i64(out, x as i64),
                _ => return Err(mismatch()),
            }
        }
    }
    Ok(())
}

fn decode(format: FieldFormat, data: &[u8]) -> Value {
    match format {
        FieldFormat::U8 => Value::Uint(data[0] as u64),
        FieldFormat::U16 => Value::Uint(LittleEndian::read_u16(data) as u64),
        FieldFormat::U32 => Value::Uint(LittleEndian::read_u32(data) as u64),
        FieldFormat::U64 => Value::Uint(LittleEndian::read_u64(data)),
        FieldFormat::I8 => Value::Int(data[0] as i8 as i64),
        FieldFormat::I16 => Value::Int(LittleEndian::read_i16(data) as i64),
        FieldFormat::I32 => Value::Int(LittleEndian::read_i32(data) as i64),
        FieldFormat::I64 => Value::Int(LittleEndian::read_i64(data)),
        FieldFormat::F32 => Value::Float(LittleEndian::read_f32(data) as f64),
        FieldFormat::F64 => Value::Float(LittleEndian::read_f64(data)),
        FieldFormat::Str(_) => {
            let end = data.iter().position(|x| *x == 0).unwrap_or(data.len());
            Value::Str(String::from_utf8_lossy(&data[..end]).into_owned())
        }
    }
}
