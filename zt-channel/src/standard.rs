// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The binary tagged-value codec. Each value is a type tag followed by a
//! payload; integers are little-endian, and multi-byte scalars and arrays are
//! aligned relative to the start of the message with zeroed padding.

use byteorder::{ByteOrder as _, LittleEndian};

use crate::{CodecError, MethodCall, MethodResult, Value};

const TAG_NULL: u8 = 0;
const TAG_TRUE: u8 = 1;
const TAG_FALSE: u8 = 2;
const TAG_I32: u8 = 3;
const TAG_I64: u8 = 4;
const TAG_LARGE_INT: u8 = 5; // Legacy; decoded as a string.
const TAG_F64: u8 = 6;
const TAG_STRING: u8 = 7;
const TAG_U8_LIST: u8 = 8;
const TAG_I32_LIST: u8 = 9;
const TAG_I64_LIST: u8 = 10;
const TAG_F64_LIST: u8 = 11;
const TAG_LIST: u8 = 12;
const TAG_MAP: u8 = 13;
const TAG_F32_LIST: u8 = 14;

const ENVELOPE_SUCCESS: u8 = 0;
const ENVELOPE_ERROR: u8 = 1;

/// Encodes a single value as a standalone message.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = Vec::with_capacity(encoded_hint(value));
    write_value(&mut buf, value);
    buf
}

/// Decodes a single value, requiring the message to be fully consumed.
pub fn decode_value(buf: &[u8]) -> Result<Value, CodecError> {
    let mut r = Reader::new(buf);
    let value = r.read_value()?;
    r.finish()?;
    Ok(value)
}

/// Encodes a method call as a string value followed by the argument value.
pub fn encode_method_call(call: &MethodCall<Value>) -> Vec<u8> {
    let mut buf = Vec::new();
    write_value(&mut buf, &Value::String(call.method.clone()));
    write_value(&mut buf, &call.args);
    buf
}

pub fn decode_method_call(buf: &[u8]) -> Result<MethodCall<Value>, CodecError> {
    let mut r = Reader::new(buf);
    let method = match r.read_value()? {
        Value::String(s) => s,
        _ => return Err(CodecError::InvalidEnvelope("method name is not a string")),
    };

    let args = r.read_value()?;
    r.finish()?;
    Ok(MethodCall { method, args })
}

/// Encodes a method response envelope: a status byte, then either the result
/// value or an error triple of code, message and details.
pub fn encode_response(result: &MethodResult<Value>) -> Vec<u8> {
    let mut buf = Vec::new();
    match result {
        MethodResult::Success(value) => {
            buf.push(ENVELOPE_SUCCESS);
            write_value(&mut buf, value);
        }
        MethodResult::Error {
            code,
            message,
            details,
        } => {
            buf.push(ENVELOPE_ERROR);
            write_value(&mut buf, &Value::String(code.clone()));
            match message {
                Some(msg) => write_value(&mut buf, &Value::String(msg.clone())),
                None => write_value(&mut buf, &Value::Null),
            }
            write_value(&mut buf, details);
        }
    }

    buf
}

pub fn decode_response(buf: &[u8]) -> Result<MethodResult<Value>, CodecError> {
    let mut r = Reader::new(buf);
    let status = r.read_u8()?;
    let result = match status {
        ENVELOPE_SUCCESS => MethodResult::Success(r.read_value()?),
        ENVELOPE_ERROR => {
            let code = match r.read_value()? {
                Value::String(s) => s,
                _ => return Err(CodecError::InvalidEnvelope("error code is not a string")),
            };

            let message = match r.read_value()? {
                Value::Null => None,
                Value::String(s) => Some(s),
                _ => return Err(CodecError::InvalidEnvelope("error message is not a string")),
            };

            MethodResult::Error {
                code,
                message,
                details: r.read_value()?,
            }
        }
        _ => return Err(CodecError::InvalidEnvelope("unknown status byte")),
    };

    r.finish()?;
    Ok(result)
}

fn encoded_hint(value: &Value) -> usize {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::I32(_) => 5,
        Value::I64(_) => 9,
        Value::F64(_) => 16,
        Value::String(s) => 6 + s.len(),
        Value::U8List(v) => 6 + v.len(),
        _ => 64,
    }
}

fn write_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(true) => buf.push(TAG_TRUE),
        Value::Bool(false) => buf.push(TAG_FALSE),
        Value::I32(v) => {
            buf.push(TAG_I32);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::I64(v) => {
            buf.push(TAG_I64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::F64(v) => {
            buf.push(TAG_F64);
            pad_to(buf, 8);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Value::String(s) => {
            buf.push(TAG_STRING);
            write_size(buf, s.len());
            buf.extend_from_slice(s.as_bytes());
        }
        Value::U8List(v) => {
            buf.push(TAG_U8_LIST);
            write_size(buf, v.len());
            buf.extend_from_slice(v);
        }
        Value::I32List(v) => {
            buf.push(TAG_I32_LIST);
            write_size(buf, v.len());
            pad_to(buf, 4);
            for x in v {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        Value::I64List(v) => {
            buf.push(TAG_I64_LIST);
            write_size(buf, v.len());
            pad_to(buf, 8);
            for x in v {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        Value::F64List(v) => {
            buf.push(TAG_F64_LIST);
            write_size(buf, v.len());
            pad_to(buf, 8);
            for x in v {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        Value::F32List(v) => {
            buf.push(TAG_F32_LIST);
            write_size(buf, v.len());
            pad_to(buf, 4);
            for x in v {
                buf.extend_from_slice(&x.to_le_bytes());
            }
        }
        Value::List(v) => {
            buf.push(TAG_LIST);
            write_size(buf, v.len());
            for x in v {
                write_value(buf, x);
            }
        }
        Value::Map(v) => {
            buf.push(TAG_MAP);
            write_size(buf, v.len());
            for (k, x) in v {
                write_value(buf, k);
                write_value(buf, x);
            }
        }
    }
}

/// Sizes below 254 are a single byte; up to 65535, 0xFE plus a u16; above
/// that, 0xFF plus a u32.
fn write_size(buf: &mut Vec<u8>, size: usize) {
    if size < 254 {
        buf.push(size as u8);
    } else if size <= 0xFFFF {
        buf.push(0xFE);
        buf.extend_from_slice(&(size as u16).to_le_bytes());
    } else {
        buf.push(0xFF);
        buf.extend_from_slice(&(size as u32).to_le_bytes());
    }
}

fn pad_to(buf: &mut Vec<u8>, alignment: usize) {
    while buf.len() % alignment != 0 {
        buf.push(0);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn finish(self) -> Result<(), CodecError> {
        if self.pos != self.buf.len() {
            return Err(CodecError::TrailingBytes(self.buf.len() - self.pos));
        }

        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < n {
            return Err(CodecError::ShortBuffer {
                needed: n - (self.buf.len() - self.pos),
            });
        }

        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn align(&mut self, alignment: usize) -> Result<(), CodecError> {
        let rem = self.pos % alignment;
        if rem != 0 {
            self.take(alignment - rem)?;
        }

        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_size(&mut self) -> Result<usize, CodecError> {
        match self.read_u8()? {
            0xFE => Ok(LittleEndian::read_u16(self.take(2)?) as usize),
            0xFF => Ok(LittleEndian::read_u32(self.take(4)?) as usize),
            n => Ok(n as usize),
        }
    }

    fn read_value(&mut self) -> Result<Value, CodecError> {
        let tag = self.read_u8()?;
        let value = match tag {
            TAG_NULL => Value::Null,
            TAG_TRUE => Value::Bool(true),
            TAG_FALSE => Value::Bool(false),
            TAG_I32 => Value::I32(LittleEndian::read_i32(self.take(4)?)),
            TAG_I64 => Value::I64(LittleEndian::read_i64(self.take(8)?)),
            TAG_F64 => {
                self.align(8)?;
                Value::F64(LittleEndian::read_f64(self.take(8)?))
            }
            TAG_STRING | TAG_LARGE_INT => {
                let size = self.read_size()?;
                Value::String(String::from_utf8(self.take(size)?.to_vec())?)
            }
            TAG_U8_LIST => {
                let size = self.read_size()?;
                Value::U8List(self.take(size)?.to_vec())
            }
            TAG_I32_LIST => {
                let size = self.read_size()?;
                self.align(4)?;
                let raw = self.take(size * 4)?;
                Value::I32List((0..size).map(|i| LittleEndian::read_i32(&raw[i * 4..])).collect())
            }
            TAG_I64_LIST => {
                let size = self.read_size()?;
                self.align(8)?;
                let raw = self.take(size * 8)?;
                Value::I64List((0..size).map(|i| LittleEndian::read_i64(&raw[i * 8..])).collect())
            }
            TAG_F64_LIST => {
                let size = self.read_size()?;
                self.align(8)?;
                let raw = self.take(size * 8)?;
                Value::F64List((0..size).map(|i| LittleEndian::read_f64(&raw[i * 8..])).collect())
            }
            TAG_F32_LIST => {
                let size = self.read_size()?;
                self.align(4)?;
                let raw = self.take(size * 4)?;
                Value::F32List((0..size).map(|i| LittleEndian::read_f32(&raw[i * 4..])).collect())
            }
            TAG_LIST => {
                let size = self.read_size()?;
                let mut out = Vec::with_capacity(size.min(1024));
                for _ in 0..size {
                    out.push(self.read_value()?);
                }

                Value::List(out)
            }
            TAG_MAP => {
                let size = self.read_size()?;
                let mut out = Vec::with_capacity(size.min(1024));
                for _ in 0..size {
                    let k = self.read_value()?;
                    let v = self.read_value()?;
                    out.push((k, v));
                }

                Value::Map(out)
            }
            tag => return Err(CodecError::InvalidTag(tag)),
        };

        Ok(value)
    }
}
