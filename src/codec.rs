//! Schema-driven payload codec.
//!
//! Each present field is written in schema order as `[tag:u8][value]`.
//! Integers are fixed-width big-endian, `bool` is a single `0`/`1` byte,
//! strings and byte blobs are `[len:u32][bytes]` and arrays are
//! `[count:u32]` followed by the elements.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::{RemoteError, Result, RpcError};
use crate::protocol::ReplyFrame;
use crate::schema::{FieldSpec, OperationSpec};
use crate::types::{FieldType, Record, Value};

/// Encode `args` against `schema`.
///
/// Unknown names fail with `UnknownArgument`; missing required fields and
/// values that do not fit their field type fail with `ArgumentType`.
pub fn encode_fields(operation: &str, schema: &[FieldSpec], args: &Record) -> Result<Bytes> {
    if let Some(unknown) = args
        .names()
        .find(|name| !schema.iter().any(|f| f.name == *name))
    {
        return Err(RpcError::UnknownArgument {
            operation: operation.to_string(),
            argument: unknown.to_string(),
        });
    }

    let mut buf = BytesMut::new();
    for field in schema {
        match args.get(&field.name) {
            Some(value) => {
                buf.put_u8(field.tag);
                put_value(&mut buf, &field.name, &field.ty, value)?;
            }
            None if field.required => {
                return Err(RpcError::argument_type(
                    &field.name,
                    "missing required argument",
                ));
            }
            None => {}
        }
    }
    Ok(buf.freeze())
}

/// Encode the arguments of a call to `operation`.
pub fn encode_call(operation: &OperationSpec, args: &Record) -> Result<Bytes> {
    encode_fields(&operation.name, &operation.args, args)
}

fn mismatch(field: &str, ty: &FieldType, value: &Value) -> RpcError {
    RpcError::argument_type(
        field,
        format!("expected {}, found {}", ty, value.type_name()),
    )
}

fn narrow<T: TryFrom<i128>>(field: &str, ty: &FieldType, value: &Value) -> Result<T> {
    let n = value.as_i128().ok_or_else(|| mismatch(field, ty, value))?;
    T::try_from(n).map_err(|_| RpcError::argument_type(field, format!("{} does not fit in {}", n, ty)))
}

fn put_len(buf: &mut BytesMut, field: &str, len: usize, max: Option<u32>) -> Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| RpcError::argument_type(field, format!("length {} is too large", len)))?;
    if let Some(max) = max {
        if len > max {
            return Err(RpcError::argument_type(
                field,
                format!("length {} exceeds maximum {}", len, max),
            ));
        }
    }
    buf.put_u32(len);
    Ok(())
}

fn put_value(buf: &mut BytesMut, field: &str, ty: &FieldType, value: &Value) -> Result<()> {
    match ty {
        FieldType::Int8 => buf.put_i8(narrow(field, ty, value)?),
        FieldType::Int16 => buf.put_i16(narrow(field, ty, value)?),
        FieldType::Int32 => buf.put_i32(narrow(field, ty, value)?),
        FieldType::Int64 => buf.put_i64(narrow(field, ty, value)?),
        FieldType::Uint8 => buf.put_u8(narrow(field, ty, value)?),
        FieldType::Uint16 => buf.put_u16(narrow(field, ty, value)?),
        FieldType::Uint32 => buf.put_u32(narrow(field, ty, value)?),
        FieldType::Uint64 => buf.put_u64(narrow(field, ty, value)?),
        FieldType::Bool => {
            let b = value.as_bool().ok_or_else(|| mismatch(field, ty, value))?;
            buf.put_u8(u8::from(b));
        }
        FieldType::String { max_len } => {
            let s = value.as_str().ok_or_else(|| mismatch(field, ty, value))?;
            put_len(buf, field, s.len(), *max_len)?;
            buf.put_slice(s.as_bytes());
        }
        FieldType::Bytes { max_len } => {
            let b = value.as_bytes().ok_or_else(|| mismatch(field, ty, value))?;
            put_len(buf, field, b.len(), *max_len)?;
            buf.put_slice(b);
        }
        FieldType::Array { element, max_count } => {
            let items = value.as_array().ok_or_else(|| mismatch(field, ty, value))?;
            put_len(buf, field, items.len(), Some(*max_count))?;
            for (i, item) in items.iter().enumerate() {
                put_value(buf, &format!("{}[{}]", field, i), element, item)?;
            }
        }
    }
    Ok(())
}

/// Decode a payload produced by [`encode_fields`] with the same schema.
pub fn decode_fields(schema: &[FieldSpec], payload: Bytes) -> Result<Record> {
    let mut buf = payload;
    let mut record = Record::new();

    while buf.has_remaining() {
        let tag = buf.get_u8();
        let field = schema
            .iter()
            .find(|f| f.tag == tag)
            .ok_or_else(|| RpcError::decode(format!("unknown field tag {}", tag)))?;
        if record.contains(&field.name) {
            return Err(RpcError::decode(format!(
                "field {} appears more than once",
                field.name
            )));
        }
        let value = get_value(&mut buf, &field.name, &field.ty)?;
        record.insert(field.name.clone(), value);
    }

    if let Some(missing) = schema
        .iter()
        .find(|f| f.required && !record.contains(&f.name))
    {
        return Err(RpcError::decode(format!(
            "missing required field {}",
            missing.name
        )));
    }

    Ok(record)
}

fn ensure(buf: &Bytes, needed: usize, field: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(RpcError::decode(format!(
            "field {} needs {} bytes, {} remaining",
            field,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_len(buf: &mut Bytes, field: &str, max: Option<u32>) -> Result<usize> {
    ensure(buf, 4, field)?;
    let len = buf.get_u32();
    if let Some(max) = max {
        if len > max {
            return Err(RpcError::decode(format!(
                "field {} length {} exceeds maximum {}",
                field, len, max
            )));
        }
    }
    Ok(len as usize)
}

fn get_value(buf: &mut Bytes, field: &str, ty: &FieldType) -> Result<Value> {
    let value = match ty {
        FieldType::Int8 => {
            ensure(buf, 1, field)?;
            Value::Int8(buf.get_i8())
        }
        FieldType::Int16 => {
            ensure(buf, 2, field)?;
            Value::Int16(buf.get_i16())
        }
        FieldType::Int32 => {
            ensure(buf, 4, field)?;
            Value::Int32(buf.get_i32())
        }
        FieldType::Int64 => {
            ensure(buf, 8, field)?;
            Value::Int64(buf.get_i64())
        }
        FieldType::Uint8 => {
            ensure(buf, 1, field)?;
            Value::Uint8(buf.get_u8())
        }
        FieldType::Uint16 => {
            ensure(buf, 2, field)?;
            Value::Uint16(buf.get_u16())
        }
        FieldType::Uint32 => {
            ensure(buf, 4, field)?;
            Value::Uint32(buf.get_u32())
        }
        FieldType::Uint64 => {
            ensure(buf, 8, field)?;
            Value::Uint64(buf.get_u64())
        }
        FieldType::Bool => {
            ensure(buf, 1, field)?;
            match buf.get_u8() {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => {
                    return Err(RpcError::decode(format!(
                        "field {} has invalid bool byte {}",
                        field, other
                    )))
                }
            }
        }
        FieldType::String { max_len } => {
            let len = get_len(buf, field, *max_len)?;
            ensure(buf, len, field)?;
            let raw = buf.split_to(len);
            let s = String::from_utf8(raw.to_vec())
                .map_err(|e| RpcError::decode(format!("field {} is not UTF-8: {}", field, e)))?;
            Value::String(s)
        }
        FieldType::Bytes { max_len } => {
            let len = get_len(buf, field, *max_len)?;
            ensure(buf, len, field)?;
            Value::Bytes(buf.split_to(len))
        }
        FieldType::Array { element, max_count } => {
            let count = get_len(buf, field, Some(*max_count))?;
            let mut items = Vec::with_capacity(count.min(buf.remaining()));
            for i in 0..count {
                items.push(get_value(buf, &format!("{}[{}]", field, i), element)?);
            }
            Value::Array(items)
        }
    };
    Ok(value)
}

/// Outcome of one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The remote handled the call and returned these fields.
    Result(Record),
    /// The remote reported an application error.
    Error(RemoteError),
    /// Sent without waiting for a reply.
    NoReply,
}

impl Reply {
    pub fn result(&self) -> Option<&Record> {
        match self {
            Reply::Result(record) => Some(record),
            _ => None,
        }
    }

    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            Reply::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Turn a remote error into `Err(RpcError::Remote)`.
    ///
    /// A fire-and-forget reply yields an empty record.
    pub fn into_result(self) -> Result<Record> {
        match self {
            Reply::Result(record) => Ok(record),
            Reply::Error(err) => Err(RpcError::Remote(err)),
            Reply::NoReply => Ok(Record::new()),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Result(record) => write!(f, "{}", record),
            Reply::Error(err) => write!(f, "error({})", err),
            Reply::NoReply => write!(f, "no reply"),
        }
    }
}

/// Decode a reply frame for a call to `operation`.
///
/// A non-ok status becomes `Reply::Error`; a malformed success payload is a
/// decode error.
pub fn decode_reply(operation: &OperationSpec, frame: ReplyFrame) -> Result<Reply> {
    if !frame.status.is_ok() {
        let err = RemoteError::from_payload(frame.status, &frame.payload);
        debug!(
            "Reply {} for {} carries remote error: {}",
            frame.sequence, operation.name, err
        );
        return Ok(Reply::Error(err));
    }
    decode_fields(&operation.reply, frame.payload).map(Reply::Result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;

    fn add_spec() -> OperationSpec {
        OperationSpec::new("add", 1)
            .arg("a", FieldType::Int32)
            .arg("b", FieldType::Int32)
            .returns("sum", FieldType::Int32)
    }

    #[test]
    fn test_add_layout() {
        let args = Record::new().with("a", 1000i32).with("b", 2044i32);
        let payload = encode_call(&add_spec(), &args).unwrap();
        assert_eq!(
            &payload[..],
            &[1, 0, 0, 0x03, 0xe8, 2, 0, 0, 0x07, 0xfc]
        );
    }

    #[test]
    fn test_integer_width_is_checked_by_value() {
        let spec = add_spec();
        let args = Record::new().with("a", 5u8).with("b", -3i64);
        assert!(encode_call(&spec, &args).is_ok());

        let args = Record::new().with("a", 1i32).with("b", i64::MAX);
        assert!(matches!(
            encode_call(&spec, &args),
            Err(RpcError::ArgumentType { field, .. }) if field == "b"
        ));
    }

    #[test]
    fn test_decode_remote_error() {
        let frame = ReplyFrame::new(3, Status::HandlerError, Bytes::from_static(b"nope"));
        let reply = decode_reply(&add_spec(), frame).unwrap();
        assert_eq!(
            reply,
            Reply::Error(RemoteError::new(Status::HandlerError, "nope"))
        );
        assert!(matches!(reply.into_result(), Err(RpcError::Remote(_))));
    }

    #[test]
    fn test_decode_success_reply() {
        let payload = encode_fields("add", &add_spec().reply, &Record::new().with("sum", 3044i32))
            .unwrap();
        let reply = decode_reply(&add_spec(), ReplyFrame::success(1, payload)).unwrap();
        assert_eq!(
            reply.result().and_then(|r| r.get("sum")),
            Some(&Value::Int32(3044))
        );
    }

    #[test]
    fn test_invalid_bool_byte() {
        let spec = OperationSpec::new("flag", 1).arg("on", FieldType::Bool);
        let result = decode_fields(&spec.args, Bytes::from_static(&[1, 2]));
        assert!(matches!(result, Err(RpcError::Decode(_))));
    }
}
