//! Header serialization formats.
//!
//! The frame's tag byte picks the codec, so each side can choose a format per message
//! without agreeing on it up front.
//!
//! - JSON: a single object with `code`, `language`, `version`, `opaque`, `flag`,
//!   `remark`, `extFields` and `serializeTypeCurrentRPC` keys.
//! - Binary: the same fields encoded positionally with `bincode` (big-endian, fixed-width
//!   integers, strings and maps length-prefixed).
use std::collections::HashMap;

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_slice, encode_to_vec,
};
use serde::{Deserialize, Serialize};

use crate::{
    RemotingError,
    error::Result,
    protocol::{LanguageCode, RemotingCommand, SerializeType},
};

/// A header never exceeds the 24 bits the frame descriptor can express.
const MAX_HEADER_LENGTH: usize = 0x00FF_FFFF;

type BinaryConfig = Configuration<BigEndian, Fixint, Limit<MAX_HEADER_LENGTH>>;

pub trait HeaderSerializer: Send + Sync {
    fn encode_header(&self, command: &RemotingCommand) -> Result<Vec<u8>>;

    /// Rebuild a command (without body) from header bytes.
    fn decode_header(&self, bytes: &[u8]) -> Result<RemotingCommand>;
}

/// Codec for the given serialize type.
pub fn serializer_for(serialize_type: SerializeType) -> &'static dyn HeaderSerializer {
    match serialize_type {
        SerializeType::Json => &JsonSerializer,
        SerializeType::Binary => &BinarySerializer,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonHeaderRef<'a> {
    code: i32,
    language: LanguageCode,
    version: i32,
    opaque: i32,
    flag: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    remark: Option<&'a str>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    ext_fields: &'a HashMap<String, String>,
    #[serde(rename = "serializeTypeCurrentRPC")]
    serialize_type: SerializeType,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonHeader {
    code: i32,
    #[serde(default)]
    language: LanguageCode,
    #[serde(default)]
    version: i32,
    opaque: i32,
    #[serde(default)]
    flag: i32,
    #[serde(default)]
    remark: Option<String>,
    #[serde(default)]
    ext_fields: Option<HashMap<String, String>>,
}

impl HeaderSerializer for JsonSerializer {
    fn encode_header(&self, command: &RemotingCommand) -> Result<Vec<u8>> {
        let header = JsonHeaderRef {
            code: command.code(),
            language: command.language(),
            version: command.version(),
            opaque: command.opaque(),
            flag: command.flag(),
            remark: command.remark(),
            ext_fields: command.ext_fields(),
            serialize_type: SerializeType::Json,
        };
        Ok(serde_json::to_vec(&header)?)
    }

    fn decode_header(&self, bytes: &[u8]) -> Result<RemotingCommand> {
        let header: JsonHeader = serde_json::from_slice(bytes)?;
        Ok(RemotingCommand::from_parts(
            header.code,
            header.language,
            header.version,
            header.opaque,
            header.flag,
            header.remark,
            header.ext_fields.unwrap_or_default(),
            SerializeType::Json,
        ))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BinarySerializer;

#[derive(Encode)]
struct BinaryHeaderRef<'a> {
    code: i32,
    language: LanguageCode,
    version: i32,
    opaque: i32,
    flag: i32,
    remark: Option<&'a str>,
    ext_fields: &'a HashMap<String, String>,
}

#[derive(Decode)]
struct BinaryHeader {
    code: i32,
    language: LanguageCode,
    version: i32,
    opaque: i32,
    flag: i32,
    remark: Option<String>,
    ext_fields: HashMap<String, String>,
}

impl BinarySerializer {
    fn config() -> BinaryConfig {
        bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding()
            .with_limit::<MAX_HEADER_LENGTH>()
    }
}

impl HeaderSerializer for BinarySerializer {
    fn encode_header(&self, command: &RemotingCommand) -> Result<Vec<u8>> {
        let header = BinaryHeaderRef {
            code: command.code(),
            language: command.language(),
            version: command.version(),
            opaque: command.opaque(),
            flag: command.flag(),
            remark: command.remark(),
            ext_fields: command.ext_fields(),
        };
        Ok(encode_to_vec(header, Self::config())?)
    }

    fn decode_header(&self, bytes: &[u8]) -> Result<RemotingCommand> {
        let (header, read): (BinaryHeader, usize) = decode_from_slice(bytes, Self::config())?;
        if read != bytes.len() {
            return Err(RemotingError::MalformedFrame(format!(
                "binary header has {} trailing bytes",
                bytes.len() - read
            )));
        }

        Ok(RemotingCommand::from_parts(
            header.code,
            header.language,
            header.version,
            header.opaque,
            header.flag,
            header.remark,
            header.ext_fields,
            SerializeType::Binary,
        ))
    }
}
