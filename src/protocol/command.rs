//! In-memory protocol message.
//!
//! A [`RemotingCommand`] is either a request or a response, never both. Requests carry a
//! request code; responses carry a status code from [`response_code`]. The `opaque` value
//! ties a response to the request it answers and is assigned from a process-wide counter
//! when a request is created.
//!
//! Typed headers are flattened into `ext_fields` when the command is built, so a command
//! is plain data from then on. See [`CustomHeader`] for the mapping rules.
//!
//! # Example
//! ```rust
//! use remoting::protocol::{RemotingCommand, response_code};
//!
//! let request = RemotingCommand::create_request(310).with_body(b"ping".to_vec());
//! assert!(!request.is_response_type());
//!
//! let response = RemotingCommand::create_response(response_code::SUCCESS, None)
//!     .with_opaque(request.opaque());
//! assert!(response.is_response_type());
//! assert_eq!(response.opaque(), request.opaque());
//! ```
use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::atomic::{AtomicI32, Ordering},
};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::{
    RemotingError,
    error::Result,
    protocol::header::{self, CustomHeader},
};

/// Protocol version stamped on every command this process creates.
pub const CURRENT_VERSION: i32 = 1;

const RPC_TYPE: i32 = 0; // bit 0: response
const RPC_ONEWAY: i32 = 1; // bit 1: one-way request

static NEXT_OPAQUE: AtomicI32 = AtomicI32::new(0);

/// Status codes carried by response commands.
pub mod response_code {
    pub const SUCCESS: i32 = 0;
    pub const SYSTEM_ERROR: i32 = 1;
    pub const SYSTEM_BUSY: i32 = 2;
    pub const REQUEST_CODE_NOT_SUPPORTED: i32 = 3;
}

/// Implementation language of the peer that produced a command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "UPPERCASE")]
pub enum LanguageCode {
    Java,
    Cpp,
    Dotnet,
    Python,
    Delphi,
    Erlang,
    Ruby,
    Other,
    Http,
    Go,
    Php,
    Oms,
    #[default]
    Rust,
}

/// Header serialization format. The discriminant is the tag stored in the top byte of the
/// frame's header descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SerializeType {
    #[default]
    #[serde(rename = "JSON")]
    Json = 0,
    #[serde(rename = "BINARY")]
    Binary = 1,
}

impl SerializeType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(SerializeType::Json),
            1 => Ok(SerializeType::Binary),
            other => Err(RemotingError::UnsupportedSerializeTag(other)),
        }
    }
}

impl FromStr for SerializeType {
    type Err = RemotingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "JSON" => Ok(SerializeType::Json),
            "BINARY" => Ok(SerializeType::Binary),
            other => Err(RemotingError::Remoting(format!(
                "unknown serialize type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for SerializeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializeType::Json => write!(f, "JSON"),
            SerializeType::Binary => write!(f, "BINARY"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemotingCommand {
    code: i32,
    language: LanguageCode,
    version: i32,
    opaque: i32,
    flag: i32,
    remark: Option<String>,
    ext_fields: HashMap<String, String>,
    body: Vec<u8>,
    serialize_type: SerializeType,
}

impl RemotingCommand {
    /// Bare command; used by the header codecs when rebuilding a decoded command.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        code: i32,
        language: LanguageCode,
        version: i32,
        opaque: i32,
        flag: i32,
        remark: Option<String>,
        ext_fields: HashMap<String, String>,
        serialize_type: SerializeType,
    ) -> Self {
        Self {
            code,
            language,
            version,
            opaque,
            flag,
            remark,
            ext_fields,
            body: Vec::new(),
            serialize_type,
        }
    }

    fn new(code: i32, opaque: i32) -> Self {
        Self::from_parts(
            code,
            LanguageCode::default(),
            CURRENT_VERSION,
            opaque,
            0,
            None,
            HashMap::new(),
            SerializeType::default(),
        )
    }

    pub fn create_request(code: i32) -> Self {
        Self::new(code, next_opaque())
    }

    /// Request whose typed header has been flattened into `ext_fields`.
    pub fn create_request_with_header<H: CustomHeader>(code: i32, header: &H) -> Result<Self> {
        let mut cmd = Self::create_request(code);
        header::write_fields(header, &mut cmd.ext_fields)?;
        Ok(cmd)
    }

    /// Response command, already marked as a response. The opaque is filled in by whoever
    /// sends it back.
    pub fn create_response(code: i32, remark: Option<String>) -> Self {
        let mut cmd = Self::new(code, 0);
        cmd.remark = remark;
        cmd.mark_response_type();
        cmd
    }

    pub fn create_response_with_header<H: CustomHeader>(
        code: i32,
        remark: Option<String>,
        header: &H,
    ) -> Result<Self> {
        let mut cmd = Self::create_response(code, remark);
        header::write_fields(header, &mut cmd.ext_fields)?;
        Ok(cmd)
    }

    /// Decode the typed header `H` from `ext_fields`.
    pub fn read_custom_header<H: CustomHeader>(&self) -> Result<H> {
        header::read_fields(&self.ext_fields)
    }

    pub fn mark_response_type(&mut self) {
        self.flag |= 1 << RPC_TYPE;
    }

    pub fn is_response_type(&self) -> bool {
        self.flag & (1 << RPC_TYPE) != 0
    }

    /// One-way is a request property; a response is never one-way.
    pub fn mark_oneway_rpc(&mut self) {
        if !self.is_response_type() {
            self.flag |= 1 << RPC_ONEWAY;
        }
    }

    pub fn is_oneway_rpc(&self) -> bool {
        self.flag & (1 << RPC_ONEWAY) != 0
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn set_code(&mut self, code: i32) {
        self.code = code;
    }

    pub fn language(&self) -> LanguageCode {
        self.language
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn opaque(&self) -> i32 {
        self.opaque
    }

    pub fn set_opaque(&mut self, opaque: i32) {
        self.opaque = opaque;
    }

    pub fn with_opaque(mut self, opaque: i32) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn flag(&self) -> i32 {
        self.flag
    }

    pub fn remark(&self) -> Option<&str> {
        self.remark.as_deref()
    }

    pub fn set_remark(&mut self, remark: impl Into<String>) {
        self.remark = Some(remark.into());
    }

    pub fn ext_fields(&self) -> &HashMap<String, String> {
        &self.ext_fields
    }

    pub fn ext_field(&self, key: &str) -> Option<&str> {
        self.ext_fields.get(key).map(String::as_str)
    }

    pub fn add_ext_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.ext_fields.insert(key.into(), value.into());
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn serialize_type(&self) -> SerializeType {
        self.serialize_type
    }

    pub fn set_serialize_type(&mut self, serialize_type: SerializeType) {
        self.serialize_type = serialize_type;
    }

    pub fn with_serialize_type(mut self, serialize_type: SerializeType) -> Self {
        self.serialize_type = serialize_type;
        self
    }
}

impl fmt::Display for RemotingCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RemotingCommand [code={}, language={:?}, version={}, opaque={}, flag(B)={:b}, remark={}, extFields={:?}, serializeTypeCurrentRPC={}]",
            self.code,
            self.language,
            self.version,
            self.opaque,
            self.flag,
            self.remark.as_deref().unwrap_or(""),
            self.ext_fields,
            self.serialize_type
        )
    }
}

/// Next process-unique correlation id. Wraps on overflow.
pub fn next_opaque() -> i32 {
    NEXT_OPAQUE.fetch_add(1, Ordering::Relaxed)
}
