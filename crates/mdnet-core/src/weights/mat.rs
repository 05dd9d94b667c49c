//! Level-5 MAT-file reader
//!
//! Covers what MatConvNet models use: numeric arrays of any class, char
//! arrays, cell and struct arrays, zlib-compressed variables and both byte
//! orders. Sparse, object and opaque arrays are skipped and surface as
//! [`MatValue::Unsupported`]. Numeric data is converted to `f32` and kept in
//! MATLAB's column-major order.
//!
//! ```text
//! header (128 bytes): text[116] subsys[8] version[2] endian["IM"|"MI"]
//! element: type u32 | nbytes u32 | data, padded to 8 bytes
//! small element: nbytes u16 | type u16 | data[<=4]   (one 8-byte word)
//! ```

use crate::error::{NetworkError, Result};
use flate2::read::ZlibDecoder;
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use std::io::Read;
use std::path::Path;
use tracing::debug;

pub const MAT5_MAGIC: &[u8] = b"MATLAB 5.0 MAT-file";
pub const MAT73_MAGIC: &[u8] = b"MATLAB 7.3 MAT-file";

const HEADER_LEN: usize = 128;
const HEADER_TEXT_LEN: usize = 116;
const VERSION: u16 = 0x0100;

pub(crate) const MI_INT8: u32 = 1;
pub(crate) const MI_UINT8: u32 = 2;
pub(crate) const MI_INT16: u32 = 3;
pub(crate) const MI_UINT16: u32 = 4;
pub(crate) const MI_INT32: u32 = 5;
pub(crate) const MI_UINT32: u32 = 6;
pub(crate) const MI_SINGLE: u32 = 7;
pub(crate) const MI_DOUBLE: u32 = 9;
pub(crate) const MI_INT64: u32 = 12;
pub(crate) const MI_UINT64: u32 = 13;
pub(crate) const MI_MATRIX: u32 = 14;
pub(crate) const MI_COMPRESSED: u32 = 15;
pub(crate) const MI_UTF8: u32 = 16;
pub(crate) const MI_UTF16: u32 = 17;
pub(crate) const MI_UTF32: u32 = 18;

const MX_CELL: u8 = 1;
const MX_STRUCT: u8 = 2;
const MX_CHAR: u8 = 4;
const MX_DOUBLE: u8 = 6;
const MX_UINT64: u8 = 15;

const FLAG_COMPLEX: u32 = 0x0800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

macro_rules! read_as {
    ($name:ident, $ty:ty) => {
        fn $name(self, bytes: &[u8]) -> $ty {
            let mut buf = [0u8; std::mem::size_of::<$ty>()];
            buf.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
            match self {
                ByteOrder::Little => <$ty>::from_le_bytes(buf),
                ByteOrder::Big => <$ty>::from_be_bytes(buf),
            }
        }
    };
}

impl ByteOrder {
    read_as!(read_u16, u16);
    read_as!(read_i16, i16);
    read_as!(read_u32, u32);
    read_as!(read_i32, i32);
    read_as!(read_u64, u64);
    read_as!(read_i64, i64);
    read_as!(read_f32, f32);
    read_as!(read_f64, f64);
}

/// Cell array; items are stored column-major
#[derive(Debug, Clone, PartialEq)]
pub struct MatCell {
    dims: Vec<usize>,
    items: Vec<MatValue>,
}

impl MatCell {
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item by linear (column-major) index
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&MatValue> {
        self.items.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MatValue> {
        self.items.iter()
    }
}

/// Struct array; `values[element * fields.len() + field]`
#[derive(Debug, Clone, PartialEq)]
pub struct MatStruct {
    dims: Vec<usize>,
    fields: Vec<String>,
    values: Vec<MatValue>,
}

impl MatStruct {
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[must_use]
    pub fn field_names(&self) -> &[String] {
        &self.fields
    }

    /// Number of struct elements
    #[must_use]
    pub fn len(&self) -> usize {
        if self.fields.is_empty() {
            self.dims.iter().product()
        } else {
            self.values.len() / self.fields.len()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn field(&self, element: usize, name: &str) -> Option<&MatValue> {
        let field = self.fields.iter().position(|f| f == name)?;
        self.values.get(element * self.fields.len() + field)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatValue {
    Numeric(ArrayD<f32>),
    Char(String),
    Cell(MatCell),
    Struct(MatStruct),
    Unsupported { class: u8 },
}

impl MatValue {
    #[must_use]
    pub fn as_numeric(&self) -> Option<&ArrayD<f32>> {
        match self {
            MatValue::Numeric(array) => Some(array),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MatValue::Char(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_cell(&self) -> Option<&MatCell> {
        match self {
            MatValue::Cell(cell) => Some(cell),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_struct(&self) -> Option<&MatStruct> {
        match self {
            MatValue::Struct(st) => Some(st),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            MatValue::Numeric(_) => "numeric",
            MatValue::Char(_) => "char",
            MatValue::Cell(_) => "cell",
            MatValue::Struct(_) => "struct",
            MatValue::Unsupported { .. } => "unsupported",
        }
    }
}

/// Parsed MAT-file: top-level variables in file order
#[derive(Debug, Clone)]
pub struct MatFile {
    description: String,
    byte_order: ByteOrder,
    variables: Vec<(String, MatValue)>,
}

impl MatFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let file = Self::parse(&bytes)?;
        debug!(
            "Read {} variables from {}: {}",
            file.variables.len(),
            path.display(),
            file.names().collect::<Vec<_>>().join(", ")
        );
        Ok(file)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.starts_with(MAT73_MAGIC) {
            return Err(NetworkError::Format(
                "MAT-file v7.3 (HDF5) is not supported".to_string(),
            ));
        }
        if bytes.len() < HEADER_LEN || !bytes.starts_with(MAT5_MAGIC) {
            return Err(NetworkError::Format("not a level-5 MAT-file".to_string()));
        }

        let byte_order = match &bytes[126..128] {
            b"IM" => ByteOrder::Little,
            b"MI" => ByteOrder::Big,
            other => {
                return Err(NetworkError::Format(format!(
                    "bad MAT-file endian indicator {other:?}"
                )))
            }
        };
        let version = byte_order.read_u16(&bytes[124..126]);
        if version != VERSION {
            return Err(NetworkError::Format(format!(
                "unsupported MAT-file version {version:#06x}"
            )));
        }
        let description = String::from_utf8_lossy(&bytes[..HEADER_TEXT_LEN])
            .trim_end_matches(['\0', ' '])
            .to_string();

        let mut variables = Vec::new();
        let mut elements = Elements::new(&bytes[HEADER_LEN..], byte_order);
        while let Some((data_type, body)) = elements.next_element()? {
            match data_type {
                MI_MATRIX => variables.push(parse_matrix(body, byte_order)?),
                MI_COMPRESSED => {
                    let inflated = inflate(body)?;
                    let mut inner = Elements::new(&inflated, byte_order);
                    while let Some((data_type, body)) = inner.next_element()? {
                        if data_type == MI_MATRIX {
                            variables.push(parse_matrix(body, byte_order)?);
                        }
                    }
                }
                other => debug!("Skipping top-level element of type {other}"),
            }
        }

        Ok(Self {
            description,
            byte_order,
            variables,
        })
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    #[must_use]
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MatValue> {
        self.variables
            .iter()
            .find(|(var, _)| var == name)
            .map(|(_, value)| value)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|(name, _)| name.as_str())
    }
}

fn inflate(body: &[u8]) -> Result<Vec<u8>> {
    let mut inflated = Vec::new();
    ZlibDecoder::new(body)
        .read_to_end(&mut inflated)
        .map_err(|e| NetworkError::Format(format!("corrupt compressed element: {e}")))?;
    Ok(inflated)
}

/// Sequential data-element reader over one buffer
struct Elements<'a> {
    data: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> Elements<'a> {
    fn new(data: &'a [u8], order: ByteOrder) -> Self {
        Self { data, pos: 0, order }
    }

    /// Next `(type, body)`; `None` at the end (trailing padding included)
    fn next_element(&mut self) -> Result<Option<(u32, &'a [u8])>> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        if rest.len() < 8 {
            return Ok(None);
        }

        let word = self.order.read_u32(rest);
        if word >> 16 != 0 {
            let data_type = word & 0xFFFF;
            let len = (word >> 16) as usize;
            if len > 4 {
                return Err(NetworkError::Format(format!(
                    "small data element claims {len} bytes"
                )));
            }
            self.pos += 8;
            return Ok(Some((data_type, &rest[4..4 + len])));
        }

        let data_type = word;
        let len = self.order.read_u32(&rest[4..]) as usize;
        let end = 8 + len;
        if end > rest.len() {
            return Err(NetworkError::Format(format!(
                "data element of {len} bytes overruns its container"
            )));
        }
        // compressed elements are not padded
        let advance = if data_type == MI_COMPRESSED {
            end
        } else {
            end.next_multiple_of(8).min(rest.len())
        };
        self.pos += advance;
        Ok(Some((data_type, &rest[8..end])))
    }

    /// Bytes not yet consumed
    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn require(&mut self, what: &str) -> Result<(u32, &'a [u8])> {
        self.next_element()?
            .ok_or_else(|| NetworkError::Format(format!("truncated array: missing {what}")))
    }
}

fn parse_matrix(body: &[u8], order: ByteOrder) -> Result<(String, MatValue)> {
    // empty cell entries are written as a bare zero-length matrix element
    if body.is_empty() {
        return Ok((String::new(), MatValue::Numeric(ArrayD::zeros(IxDyn(&[0, 0])))));
    }

    let mut elements = Elements::new(body, order);
    let (_, flags) = elements.require("array flags")?;
    if flags.len() < 4 {
        return Err(NetworkError::Format("short array flags".to_string()));
    }
    let flags = order.read_u32(flags);
    let class = (flags & 0xFF) as u8;

    let (_, raw_dims) = elements.require("dimensions")?;
    let dims: Vec<usize> = raw_dims
        .chunks_exact(4)
        .map(|b| order.read_i32(b).max(0) as usize)
        .collect();
    let (_, raw_name) = elements.require("array name")?;
    let name = String::from_utf8_lossy(raw_name).into_owned();
    let count = element_count(&dims)?;

    let value = match class {
        MX_CELL => {
            check_nested_count(count, &elements, "cell")?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(nested_matrix(&mut elements, order, "cell item")?);
            }
            MatValue::Cell(MatCell { dims, items })
        }
        MX_STRUCT => parse_struct(&mut elements, dims, count, order)?,
        MX_CHAR => {
            let (data_type, data) = elements.require("char data")?;
            MatValue::Char(decode_chars(data_type, data, order)?)
        }
        MX_DOUBLE..=MX_UINT64 => {
            let (data_type, data) = elements.require("real part")?;
            let values = decode_numeric(data_type, data, order)?;
            if values.len() != count {
                return Err(NetworkError::Format(format!(
                    "array {name:?} has {} values for dims {dims:?}",
                    values.len()
                )));
            }
            if flags & FLAG_COMPLEX != 0 {
                debug!("Dropping imaginary part of {name:?}");
            }
            MatValue::Numeric(ArrayD::from_shape_vec(IxDyn(&dims).f(), values)?)
        }
        other => MatValue::Unsupported { class: other },
    };

    Ok((name, value))
}

fn element_count(dims: &[usize]) -> Result<usize> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| NetworkError::Format(format!("dimensions {dims:?} overflow")))
}

/// Every nested matrix takes at least one 8-byte tag
fn check_nested_count(count: usize, elements: &Elements<'_>, what: &str) -> Result<()> {
    let available = elements.remaining() / 8;
    if count > available {
        return Err(NetworkError::Format(format!(
            "{what} declares {count} items but only {available} fit in its body"
        )));
    }
    Ok(())
}

fn nested_matrix(elements: &mut Elements<'_>, order: ByteOrder, what: &str) -> Result<MatValue> {
    let (data_type, body) = elements.require(what)?;
    if data_type != MI_MATRIX {
        return Err(NetworkError::Format(format!(
            "{what} has element type {data_type}, expected a matrix"
        )));
    }
    Ok(parse_matrix(body, order)?.1)
}

fn parse_struct(
    elements: &mut Elements<'_>,
    dims: Vec<usize>,
    count: usize,
    order: ByteOrder,
) -> Result<MatValue> {
    let (_, raw_len) = elements.require("field name length")?;
    if raw_len.len() < 4 {
        return Err(NetworkError::Format("short field name length".to_string()));
    }
    let name_len = order.read_i32(raw_len).max(0) as usize;
    let (_, raw_names) = elements.require("field names")?;
    let fields: Vec<String> = if name_len == 0 {
        Vec::new()
    } else {
        raw_names
            .chunks(name_len)
            .map(|chunk| {
                let end = chunk.iter().position(|&b| b == 0).unwrap_or(chunk.len());
                String::from_utf8_lossy(&chunk[..end]).into_owned()
            })
            .collect()
    };

    let total = count.checked_mul(fields.len()).ok_or_else(|| {
        NetworkError::Format(format!(
            "struct with {count} elements and {} fields overflows",
            fields.len()
        ))
    })?;
    check_nested_count(total, elements, "struct")?;
    let mut values = Vec::with_capacity(total);
    for _ in 0..total {
        values.push(nested_matrix(elements, order, "struct field")?);
    }
    Ok(MatValue::Struct(MatStruct {
        dims,
        fields,
        values,
    }))
}

fn decode_numeric(data_type: u32, data: &[u8], order: ByteOrder) -> Result<Vec<f32>> {
    let values = match data_type {
        MI_INT8 => data.iter().map(|&b| b as i8 as f32).collect(),
        MI_UINT8 => data.iter().map(|&b| b as f32).collect(),
        MI_INT16 => data.chunks_exact(2).map(|b| order.read_i16(b) as f32).collect(),
        MI_UINT16 => data.chunks_exact(2).map(|b| order.read_u16(b) as f32).collect(),
        MI_INT32 => data.chunks_exact(4).map(|b| order.read_i32(b) as f32).collect(),
        MI_UINT32 => data.chunks_exact(4).map(|b| order.read_u32(b) as f32).collect(),
        MI_SINGLE => data.chunks_exact(4).map(|b| order.read_f32(b)).collect(),
        MI_DOUBLE => data.chunks_exact(8).map(|b| order.read_f64(b) as f32).collect(),
        MI_INT64 => data.chunks_exact(8).map(|b| order.read_i64(b) as f32).collect(),
        MI_UINT64 => data.chunks_exact(8).map(|b| order.read_u64(b) as f32).collect(),
        other => {
            return Err(NetworkError::Format(format!(
                "element type {other} cannot hold numeric data"
            )))
        }
    };
    Ok(values)
}

fn decode_chars(data_type: u32, data: &[u8], order: ByteOrder) -> Result<String> {
    match data_type {
        MI_UTF8 | MI_INT8 | MI_UINT8 => Ok(String::from_utf8_lossy(data).into_owned()),
        MI_UTF16 | MI_UINT16 => {
            let units: Vec<u16> = data.chunks_exact(2).map(|b| order.read_u16(b)).collect();
            Ok(String::from_utf16_lossy(&units))
        }
        MI_UTF32 | MI_UINT32 | MI_INT32 => Ok(data
            .chunks_exact(4)
            .filter_map(|b| char::from_u32(order.read_u32(b)))
            .collect()),
        other => Err(NetworkError::Format(format!(
            "element type {other} cannot hold characters"
        ))),
    }
}
