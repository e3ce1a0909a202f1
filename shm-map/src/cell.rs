use core::fmt;

use bytemuck::{Pod, Zeroable};

use crate::alloc::Failure;
use crate::arena::Arena;
use crate::error::{Error, Result};

/// The kind of value a cell holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CellKind {
    String,
    Number,
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CellKind::String => "string",
            CellKind::Number => "number",
        })
    }
}

/// An owned value, read out of or to be written into a map.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    Number(f64),
}

/// A value that is borrowed, possibly straight from the mapped file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CellRef<'a> {
    String(&'a str),
    Number(f64),
}

impl Value {
    pub fn kind(&self) -> CellKind {
        self.as_cell().kind()
    }

    pub fn as_cell(&self) -> CellRef<'_> {
        match self {
            Value::String(s) => CellRef::String(s),
            Value::Number(n) => CellRef::Number(*n),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        self.as_cell().as_str()
    }

    pub fn as_number(&self) -> Result<f64> {
        self.as_cell().as_number()
    }
}

impl<'a> CellRef<'a> {
    pub fn kind(&self) -> CellKind {
        match self {
            CellRef::String(_) => CellKind::String,
            CellRef::Number(_) => CellKind::Number,
        }
    }

    pub fn as_str(&self) -> Result<&'a str> {
        match *self {
            CellRef::String(s) => Ok(s),
            CellRef::Number(_) => Err(Error::TypeMismatch {
                expected: CellKind::String,
                found: CellKind::Number,
            }),
        }
    }

    pub fn as_number(&self) -> Result<f64> {
        match *self {
            CellRef::Number(n) => Ok(n),
            CellRef::String(_) => Err(Error::TypeMismatch {
                expected: CellKind::Number,
                found: CellKind::String,
            }),
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            CellRef::String(s) => Value::String(s.to_owned()),
            CellRef::Number(n) => Value::Number(n),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_cell().fmt(f)
    }
}

impl fmt::Display for CellRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellRef::String(s) => f.write_str(s),
            CellRef::Number(n) => n.fmt(f),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n.into())
    }
}

impl<'a> From<&'a Value> for CellRef<'a> {
    fn from(value: &'a Value) -> Self {
        value.as_cell()
    }
}

impl<'a> From<&'a str> for CellRef<'a> {
    fn from(s: &'a str) -> Self {
        CellRef::String(s)
    }
}

impl From<f64> for CellRef<'_> {
    fn from(n: f64) -> Self {
        CellRef::Number(n)
    }
}

const TAG_STRING: u32 = 1;
const TAG_NUMBER: u32 = 2;

/// A cell as stored in a table node. Strings point to their bytes elsewhere in the arena.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct RawCell {
    tag: u32,
    len: u32,
    payload: u64,
}

impl RawCell {
    pub fn construct(arena: &mut Arena, value: CellRef<'_>) -> Result<Self, Failure> {
        match value {
            CellRef::Number(n) => Ok(RawCell {
                tag: TAG_NUMBER,
                len: 0,
                payload: n.to_bits(),
            }),
            CellRef::String(s) => {
                let len = u32::try_from(s.len())
                    .map_err(|_| Error::InvalidValue("strings are limited to 4 GiB"))?;
                let payload = store_bytes(arena, s.as_bytes())?;
                Ok(RawCell {
                    tag: TAG_STRING,
                    len,
                    payload,
                })
            }
        }
    }

    pub fn destroy(self, arena: &mut Arena) -> Result<()> {
        match self.tag {
            TAG_STRING if self.payload != 0 => arena.deallocate(self.payload),
            _ => Ok(()),
        }
    }

    pub fn read<'a>(&self, arena: &'a Arena) -> Result<CellRef<'a>> {
        match self.tag {
            TAG_NUMBER => Ok(CellRef::Number(f64::from_bits(self.payload))),
            TAG_STRING => {
                let bytes = arena.bytes(self.payload, self.len.into())?;
                let s = core::str::from_utf8(bytes)
                    .map_err(|_| arena.corrupt("a string value is not UTF-8"))?;
                Ok(CellRef::String(s))
            }
            tag => Err(arena.corrupt(format!("unknown cell tag {tag}"))),
        }
    }
}

/// A key whose bytes live in the arena.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct RawKey {
    offset: u64,
    len: u64,
}

impl RawKey {
    pub fn construct(arena: &mut Arena, key: &str) -> Result<Self, Failure> {
        let offset = store_bytes(arena, key.as_bytes())?;
        Ok(RawKey {
            offset,
            len: key.len() as u64,
        })
    }

    pub fn destroy(self, arena: &mut Arena) -> Result<()> {
        match self.offset {
            0 => Ok(()),
            offset => arena.deallocate(offset),
        }
    }

    pub fn read<'a>(&self, arena: &'a Arena) -> Result<&'a str> {
        let bytes = arena.bytes(self.offset, self.len)?;
        core::str::from_utf8(bytes).map_err(|_| arena.corrupt("a key is not UTF-8"))
    }

    pub fn matches(&self, arena: &Arena, key: &str) -> Result<bool> {
        Ok(self.len == key.len() as u64 && arena.bytes(self.offset, self.len)? == key.as_bytes())
    }
}

fn store_bytes(arena: &mut Arena, bytes: &[u8]) -> Result<u64, Failure> {
    if bytes.is_empty() {
        return Ok(0);
    }

    let offset = arena.allocate(bytes.len() as u64)?;
    arena.write_bytes(offset, bytes)?;
    Ok(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_check_the_kind() {
        let text = Value::from("forty-two");
        assert_eq!(text.as_str().unwrap(), "forty-two");
        assert!(matches!(
            text.as_number(),
            Err(Error::TypeMismatch {
                expected: CellKind::Number,
                found: CellKind::String
            })
        ));

        let number = Value::from(42);
        assert_eq!(number.as_number().unwrap(), 42.0);
        assert_eq!(number.kind(), CellKind::Number);
        assert!(number.as_str().is_err());
    }

    #[test]
    fn display_is_the_bare_value() {
        assert_eq!(Value::from("a b").to_string(), "a b");
        assert_eq!(Value::from(3.5).to_string(), "3.5");
        assert_eq!(CellRef::Number(-1.0).to_string(), "-1");
    }
}
