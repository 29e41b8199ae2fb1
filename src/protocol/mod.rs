//! Wire protocol.
//!
//! This module defines how remoting peers exchange commands: the in-memory
//! [`RemotingCommand`], the typed-header mapping that fills its `ext_fields`, the two header
//! serialization formats, and the length-prefixed frame that carries a header and a body
//! over a byte stream.
//!
//! # Overview
//!
//! Every message is a command. A request names an operation by its `code`; a response
//! reports a status by its `code` and echoes the request's `opaque` so the caller can match
//! it. Commands are plain data: nothing here knows about connections or threads.
//!
//! # Key Components
//!
//! - [`RemotingCommand`]: a request or response, with flags, remark, `ext_fields` and body.
//! - [`CustomHeader`]: typed headers flattened into `ext_fields` through a static field table.
//! - [`HeaderSerializer`]: JSON and compact binary header formats.
//! - [`FrameCodec`]: frame encoding and bounded, validating decoding.
//! - [`FrameReader`] / [`FrameWriter`]: blocking frame I/O over any `Read`/`Write`.
//!
//! # Binary Format
//!
//! - A `u32` total length, then a `u32` descriptor whose top byte is the serialize tag and
//!   whose low 24 bits are the header length.
//! - The header, then the body filling the rest of the frame.
//! - All integers are big-endian.
//!
//! The tag chosen by the sender is authoritative, so peers can use different header formats
//! without shared configuration.
//!
//! # See Also
//!
//! - [`remoting`](crate::remoting): invocation, correlation and connection management on top
//!   of these types.
mod command;
pub mod frame;
mod header;
pub mod serializer;
mod transport;

pub use command::{
    CURRENT_VERSION, LanguageCode, RemotingCommand, SerializeType, next_opaque, response_code,
};
pub use frame::FrameCodec;
pub use header::{BoundaryType, CustomHeader, FieldKind, FieldSpec, FieldValue, FieldValues};
pub use serializer::{BinarySerializer, HeaderSerializer, JsonSerializer};
pub use transport::{FrameReader, FrameWriter, Inbound};
