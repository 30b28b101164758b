use bytes::Bytes;

use crate::error::{Error, Result};
use crate::store::memory::Db;

/// Native rendering of a script, run by the memory store while it holds its
/// single dataset lock.
pub type LocalScript = fn(&mut Db, &[String], &[Bytes]) -> Result<Reply>;

/// A named atomic operation.
///
/// `lua` is what Redis runs (loaded once, invoked by digest).  `local` must
/// produce the same effects and reply against [`Db`].
#[derive(Debug)]
pub struct Script {
    pub name: &'static str,
    pub lua: &'static str,
    pub local: LocalScript,
}

/// Reply of a script or command, reduced to what Lua can return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Int(i64),
    Data(Bytes),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn data(value: impl Into<Bytes>) -> Self {
        Self::Data(value.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn into_int(self) -> Result<i64> {
        match self {
            Self::Int(n) => Ok(n),
            Self::Data(b) => std::str::from_utf8(&b)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::contract("expected an integer reply")),
            Self::Nil => Ok(0),
            Self::Array(_) => Err(Error::contract("expected an integer reply, got an array")),
        }
    }

    pub fn into_bytes(self) -> Result<Option<Bytes>> {
        match self {
            Self::Nil => Ok(None),
            Self::Data(b) => Ok(Some(b)),
            Self::Int(n) => Ok(Some(Bytes::from(n.to_string()))),
            Self::Array(_) => Err(Error::contract("expected a bulk reply, got an array")),
        }
    }

    pub fn into_string(self) -> Result<Option<String>> {
        self.into_bytes()?
            .map(|b| {
                String::from_utf8(b.to_vec())
                    .map_err(|_| Error::contract("reply is not valid UTF-8"))
            })
            .transpose()
    }

    /// Array elements; `Nil` reads as an empty array.
    pub fn into_array(self) -> Result<Vec<Reply>> {
        match self {
            Self::Array(items) => Ok(items),
            Self::Nil => Ok(Vec::new()),
            other => Err(Error::contract(format!("expected an array reply, got {other:?}"))),
        }
    }
}

pub fn key<'a>(keys: &'a [String], index: usize) -> Result<&'a str> {
    keys.get(index)
        .map(String::as_str)
        .ok_or_else(|| Error::Backend(format!("script key {} missing", index + 1)))
}

pub fn arg(args: &[Bytes], index: usize) -> Result<&Bytes> {
    args.get(index)
        .ok_or_else(|| Error::Backend(format!("script argument {} missing", index + 1)))
}

pub fn arg_str(args: &[Bytes], index: usize) -> Result<&str> {
    std::str::from_utf8(arg(args, index)?)
        .map_err(|_| Error::Backend(format!("script argument {} is not UTF-8", index + 1)))
}

pub fn arg_i64(args: &[Bytes], index: usize) -> Result<i64> {
    arg_str(args, index)?
        .parse()
        .map_err(|_| Error::Backend(format!("script argument {} is not a number", index + 1)))
}
