// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The JSON codec: RFC 8259 with minimal escaping. Values are plain
//! [serde_json::Value]s; method calls are `{"method": ..., "args": ...}`
//! objects, and responses are one-element (success) or three-element (error)
//! arrays.

use serde_json::{json, Value};

use crate::{CodecError, MethodCall, MethodResult};

pub fn encode_value(value: &Value) -> Vec<u8> {
    // Serialization of an in-memory value can't fail.
    serde_json::to_vec(value).unwrap()
}

pub fn decode_value(buf: &[u8]) -> Result<Value, CodecError> {
    Ok(serde_json::from_slice(buf)?)
}

pub fn encode_method_call(call: &MethodCall<Value>) -> Vec<u8> {
    encode_value(&json!({
        "method": call.method,
        "args": call.args,
    }))
}

pub fn decode_method_call(buf: &[u8]) -> Result<MethodCall<Value>, CodecError> {
    let value = decode_value(buf)?;
    let Value::Object(mut fields) = value else {
        return Err(CodecError::InvalidEnvelope("method call is not an object"));
    };

    let method = match fields.remove("method") {
        Some(Value::String(s)) => s,
        _ => return Err(CodecError::InvalidEnvelope("method name is not a string")),
    };

    Ok(MethodCall {
        method,
        args: fields.remove("args").unwrap_or(Value::Null),
    })
}

pub fn encode_response(result: &MethodResult<Value>) -> Vec<u8> {
    match result {
        MethodResult::Success(value) => encode_value(&json!([value])),
        MethodResult::Error {
            code,
            message,
            details,
        } => encode_value(&json!([code, message, details])),
    }
}

pub fn decode_response(buf: &[u8]) -> Result<MethodResult<Value>, CodecError> {
    let value = decode_value(buf)?;
    let Value::Array(mut items) = value else {
        return Err(CodecError::InvalidEnvelope("response is not an array"));
    };

    match items.len() {
        1 => Ok(MethodResult::Success(items.remove(0))),
        3 => {
            let details = items.pop().unwrap();
            let message = match items.pop().unwrap() {
                Value::Null => None,
                Value::String(s) => Some(s),
                _ => return Err(CodecError::InvalidEnvelope("error message is not a string")),
            };
            let code = match items.pop().unwrap() {
                Value::String(s) => s,
                _ => return Err(CodecError::InvalidEnvelope("error code is not a string")),
            };

            Ok(MethodResult::Error {
                code,
                message,
                details,
            })
        }
        _ => Err(CodecError::InvalidEnvelope("unexpected response arity")),
    }
}
