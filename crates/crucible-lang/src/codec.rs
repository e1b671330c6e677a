//! Bytecode codec: source text to a self-contained, versioned blob and back.
//!
//! Layout: 4-byte magic, one version byte, then the CBOR encoding of the root
//! [`FunctionProto`]. The proto tree holds only structs, sequences and
//! scalars, so emission is a pure function of the source — no map ordering,
//! timestamps or nonces can leak in.

use crate::compiler;
use crate::error::{CompileError, DecodeError};
use crate::proto::FunctionProto;

pub const MAGIC: [u8; 4] = *b"CRBL";
pub const VERSION: u8 = 1;

/// Name tag carried by every compiled chunk.
pub const SOURCE_NAME: &str = "<script>";

/// Parses and compiles `source`, returning the persistable blob.
pub fn compile(source: &str) -> Result<Vec<u8>, CompileError> {
    let proto = compiler::compile(source, SOURCE_NAME)?;
    encode(&proto)
}

pub fn encode(proto: &FunctionProto) -> Result<Vec<u8>, CompileError> {
    let body = serde_cbor::to_vec(proto).map_err(|e| CompileError::Encode(e.to_string()))?;
    let mut blob = Vec::with_capacity(5 + body.len());
    blob.extend_from_slice(&MAGIC);
    blob.push(VERSION);
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Inverse of [`compile`]: succeeds on any output of the same codec version.
pub fn load(bytes: &[u8]) -> Result<FunctionProto, DecodeError> {
    if bytes.len() < 5 {
        return Err(DecodeError::Truncated);
    }
    if bytes[..4] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    if bytes[4] != VERSION {
        return Err(DecodeError::UnsupportedVersion(bytes[4]));
    }
    Ok(serde_cbor::from_slice(&bytes[5..])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_and_load() {
        let blob = compile("local a = 1\nthis.returns(a + 2)").unwrap();
        let proto = load(&blob).unwrap();
        assert_eq!(proto.source_name, SOURCE_NAME);
        assert_eq!(encode(&proto).unwrap(), blob);
    }

    #[test]
    fn emission_is_deterministic() {
        let source = r#"
            local greeting = "hello"
            local function shout(s) return s .. "!" end
            this.returns(shout(greeting))
        "#;
        assert_eq!(compile(source).unwrap(), compile(source).unwrap());
    }

    #[test]
    fn string_constants_survive() {
        let blob = compile(r#"this.returns("payload")"#).unwrap();
        let proto = load(&blob).unwrap();
        let has_payload = proto.constants.iter().any(|c| {
            matches!(c, crate::proto::Constant::Str(s) if s == "payload")
        });
        assert!(has_payload);
    }

    #[test]
    fn rejects_truncated_and_corrupt_blobs() {
        assert!(matches!(load(b"CR"), Err(DecodeError::Truncated)));
        assert!(matches!(load(b"NOPE\x01rest"), Err(DecodeError::BadMagic)));

        let mut blob = compile("return 1").unwrap();
        blob[4] = 9;
        assert!(matches!(load(&blob), Err(DecodeError::UnsupportedVersion(9))));

        let mut blob = compile("return 1").unwrap();
        blob.truncate(blob.len() - 3);
        assert!(matches!(load(&blob), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn surfaces_parse_location() {
        let err = compile("local a = \nlocal = 2").unwrap_err();
        assert!(matches!(err, CompileError::Parse { line: 2, .. }));
    }
}
