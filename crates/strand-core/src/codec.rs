//! The codec façade: how typed values become opaque message bodies.
//!
//! Codecs are chosen per endpoint. `encode`/`decode` are synchronous and
//! never suspend; the engine treats their output as opaque bytes, and any
//! codec failure surfaces as `internal`.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::status::Status;

/// Errors from encoding or decoding a message body.
#[derive(Debug, Clone)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(msg) => write!(f, "encode failed: {}", msg),
            CodecError::Decode(msg) => write!(f, "decode failed: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for Status {
    fn from(err: CodecError) -> Status {
        Status::internal(err.to_string())
    }
}

/// Marshal values of `T` to and from message bodies.
pub trait Marshal<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Bytes, CodecError>;
    fn decode(&self, data: &[u8]) -> Result<T, CodecError>;
}

/// Protobuf wire format via prost: varints, length-delimited fields,
/// fixed32/fixed64, per the standard encoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProtoCodec;

impl<T> Marshal<T> for ProtoCodec
where
    T: prost::Message + Default,
{
    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(value.encode_to_vec()))
    }

    fn decode(&self, data: &[u8]) -> Result<T, CodecError> {
        T::decode(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// JSON codec via serde_json.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<T> Marshal<T> for JsonCodec
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Identity codec over raw bodies. Used by byte-level handlers and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesCodec;

impl Marshal<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(value.clone()))
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        Ok(data.to_vec())
    }
}

impl Marshal<Bytes> for BytesCodec {
    fn encode(&self, value: &Bytes) -> Result<Bytes, CodecError> {
        Ok(value.clone())
    }

    fn decode(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[derive(Clone, PartialEq, prost::Message)]
    struct TestProto {
        #[prost(bytes = "vec", tag = "1")]
        payload: Vec<u8>,
        #[prost(string, tag = "2")]
        label: String,
    }

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct TestJson {
        id: u32,
        name: String,
    }

    #[test]
    fn proto_roundtrip() {
        let value = TestProto {
            payload: vec![0x48, 0x69],
            label: "hi".to_string(),
        };
        let encoded = ProtoCodec.encode(&value).unwrap();
        let decoded: TestProto = ProtoCodec.decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn proto_decode_garbage_fails() {
        let result: Result<TestProto, _> = ProtoCodec.decode(&[0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn json_roundtrip() {
        let value = TestJson {
            id: 7,
            name: "strand".to_string(),
        };
        let encoded = JsonCodec.encode(&value).unwrap();
        let decoded: TestJson = JsonCodec.decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn json_decode_garbage_fails() {
        let result: Result<TestJson, _> = JsonCodec.decode(b"not json");
        assert!(result.is_err());
    }

    #[test]
    fn bytes_codec_is_identity() {
        let data = vec![1u8, 2, 3];
        let encoded = BytesCodec.encode(&data).unwrap();
        assert_eq!(encoded.as_ref(), &[1, 2, 3]);
        let decoded: Vec<u8> = BytesCodec.decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn codec_failure_maps_to_internal() {
        let err = CodecError::Decode("boom".to_string());
        assert_eq!(Status::from(err).code(), Code::Internal);
    }
}
