// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The two wire codecs spoken over the engine's platform channels: a binary
//! tagged-value codec and a JSON codec, plus the method-call and response
//! envelope framing plugins use on top of either.

pub mod json;
pub mod standard;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("short buffer, need {needed} more bytes")]
    ShortBuffer { needed: usize },
    #[error("invalid type tag: {0:#04x}")]
    InvalidTag(u8),
    #[error("invalid string: {0}")]
    InvalidString(#[from] std::string::FromUtf8Error),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(&'static str),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A value in the binary tagged-value codec's domain.
///
/// Maps are represented as ordered pairs rather than a hash map, because
/// values (notably floats) aren't hashable and because the wire format
/// preserves insertion order anyway.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    String(String),
    U8List(Vec<u8>),
    I32List(Vec<i32>),
    I64List(Vec<i64>),
    F64List(Vec<f64>),
    F32List(Vec<f32>),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I32(v) => Some(*v as i64),
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

/// A decoded method invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall<V> {
    pub method: String,
    pub args: V,
}

/// A decoded method response.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodResult<V> {
    Success(V),
    Error {
        code: String,
        message: Option<String>,
        details: V,
    },
}
