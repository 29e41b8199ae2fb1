//! Length-prefixed frame codec.
//!
//! ```text
//! offset 0: u32 total_length       bytes following this field
//! offset 4: u32 header_descriptor  top 8 bits serialize tag, low 24 bits header length
//! offset 8: header bytes           JSON or binary, per tag
//! ......... body bytes             everything left, opaque
//! ```
//!
//! All integers are big-endian. The codec never trusts a declared length beyond the bytes
//! it was actually handed.
use log::trace;

use crate::{
    RemotingError,
    config::DEFAULT_MAX_FRAME_LENGTH,
    error::Result,
    protocol::{RemotingCommand, SerializeType, serializer::serializer_for},
};

pub const LENGTH_FIELD_SIZE: usize = 4;
pub const HEADER_DESCRIPTOR_SIZE: usize = 4;
pub const HEADER_LENGTH_MASK: u32 = 0x00FF_FFFF;

/// Pack the serialize tag and the header length into a descriptor.
pub fn mark_protocol_type(header_length: usize, serialize_type: SerializeType) -> Result<u32> {
    if header_length > HEADER_LENGTH_MASK as usize {
        return Err(RemotingError::MalformedFrame(format!(
            "header of {header_length} bytes does not fit in 24 bits"
        )));
    }
    Ok(((serialize_type.tag() as u32) << 24) | header_length as u32)
}

/// Split a descriptor into its serialize tag and header length.
pub fn split_descriptor(descriptor: u32) -> (u8, usize) {
    ((descriptor >> 24) as u8, (descriptor & HEADER_LENGTH_MASK) as usize)
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Validate a `total_length` prefix before anything is buffered.
    pub fn check_total_length(&self, total_length: usize) -> Result<()> {
        if total_length > self.max_frame_length {
            return Err(RemotingError::FrameTooLarge {
                size: total_length,
                max: self.max_frame_length,
            });
        }
        if total_length < HEADER_DESCRIPTOR_SIZE {
            return Err(RemotingError::MalformedFrame(format!(
                "total length {total_length} is shorter than the header descriptor"
            )));
        }
        Ok(())
    }

    /// Full frame, length prefix included.
    pub fn encode(&self, command: &RemotingCommand) -> Result<Vec<u8>> {
        let header = serializer_for(command.serialize_type()).encode_header(command)?;
        let descriptor = mark_protocol_type(header.len(), command.serialize_type())?;
        let total_length = HEADER_DESCRIPTOR_SIZE + header.len() + command.body().len();

        if total_length > self.max_frame_length {
            return Err(RemotingError::FrameTooLarge {
                size: total_length,
                max: self.max_frame_length,
            });
        }

        let mut frame = Vec::with_capacity(LENGTH_FIELD_SIZE + total_length);
        frame.extend_from_slice(&(total_length as u32).to_be_bytes());
        frame.extend_from_slice(&descriptor.to_be_bytes());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(command.body());

        trace!(
            "encoded frame opaque={} code={} total_length={total_length}",
            command.opaque(),
            command.code()
        );
        Ok(frame)
    }

    /// Decode one complete frame, length prefix included. The declared length must match
    /// the bytes supplied exactly.
    pub fn decode(&self, frame: &[u8]) -> Result<RemotingCommand> {
        let Some((prefix, payload)) = frame.split_first_chunk::<LENGTH_FIELD_SIZE>() else {
            return Err(RemotingError::MalformedFrame(format!(
                "{} bytes cannot hold a length prefix",
                frame.len()
            )));
        };

        let total_length = u32::from_be_bytes(*prefix) as usize;
        self.check_total_length(total_length)?;
        if payload.len() != total_length {
            return Err(RemotingError::MalformedFrame(format!(
                "declared {total_length} bytes after the prefix, {} available",
                payload.len()
            )));
        }

        self.decode_payload(payload)
    }

    /// Decode the bytes that follow the length prefix.
    pub fn decode_payload(&self, payload: &[u8]) -> Result<RemotingCommand> {
        let Some((descriptor, rest)) = payload.split_first_chunk::<HEADER_DESCRIPTOR_SIZE>()
        else {
            return Err(RemotingError::MalformedFrame(format!(
                "{} bytes cannot hold a header descriptor",
                payload.len()
            )));
        };

        let (tag, header_length) = split_descriptor(u32::from_be_bytes(*descriptor));
        if header_length > rest.len() {
            return Err(RemotingError::MalformedFrame(format!(
                "declared header length {header_length} exceeds the {} remaining bytes",
                rest.len()
            )));
        }

        let serialize_type = SerializeType::from_tag(tag)?;
        let (header, body) = rest.split_at(header_length);

        let mut command = serializer_for(serialize_type)
            .decode_header(header)
            .map_err(|e| match e {
                e if e.is_connection_fatal() => e,
                e => RemotingError::MalformedFrame(format!("undecodable header: {e}")),
            })?;
        command.set_body(body.to_vec());
        command.set_serialize_type(serialize_type);
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_request_round_trip() {
        let codec = FrameCodec::default();
        let request = RemotingCommand::create_request(310)
            .with_opaque(7)
            .with_body(b"ping".to_vec());

        let frame = codec.encode(&request).unwrap();
        let decoded = codec.decode(&frame).unwrap();

        assert_eq!(decoded.code(), 310);
        assert_eq!(decoded.opaque(), 7);
        assert_eq!(decoded.body(), b"ping");
        assert!(decoded.ext_fields().is_empty());
    }

    #[test]
    fn frame_layout() {
        let codec = FrameCodec::default();
        let request = RemotingCommand::create_request(1)
            .with_serialize_type(SerializeType::Binary)
            .with_body(vec![0xAA; 3]);
        let frame = codec.encode(&request).unwrap();

        let total = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
        assert_eq!(total, frame.len() - 4);

        let (tag, header_length) =
            split_descriptor(u32::from_be_bytes(frame[4..8].try_into().unwrap()));
        assert_eq!(tag, SerializeType::Binary.tag());
        assert_eq!(8 + header_length + 3, frame.len());
        assert_eq!(&frame[frame.len() - 3..], &[0xAA; 3]);
    }

    #[test]
    fn tag_selects_serializer() {
        let codec = FrameCodec::default();
        for serialize_type in [SerializeType::Json, SerializeType::Binary] {
            let mut request = RemotingCommand::create_request(12).with_serialize_type(serialize_type);
            request.add_ext_field("k", "v");
            let decoded = codec.decode(&codec.encode(&request).unwrap()).unwrap();
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn header_length_beyond_frame_is_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&8_u32.to_be_bytes());
        frame.extend_from_slice(&mark_protocol_type(5, SerializeType::Json).unwrap().to_be_bytes());
        frame.extend_from_slice(b"{}{}");

        let err = FrameCodec::default().decode(&frame).unwrap_err();
        assert!(matches!(err, RemotingError::MalformedFrame(_)));
    }

    #[test]
    fn short_frame_is_rejected() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&RemotingCommand::create_request(1)).unwrap();

        let err = codec.decode(&frame[..frame.len() - 1]).unwrap_err();
        assert!(matches!(err, RemotingError::MalformedFrame(_)));
        assert!(codec.decode(&frame[..2]).is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let codec = FrameCodec::default();
        let mut frame = codec.encode(&RemotingCommand::create_request(1)).unwrap();
        frame[4] = 0x7F;

        let err = codec.decode(&frame).unwrap_err();
        assert!(matches!(err, RemotingError::UnsupportedSerializeTag(0x7F)));
    }

    #[test]
    fn garbage_header_is_malformed() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&7_u32.to_be_bytes());
        frame.extend_from_slice(&mark_protocol_type(3, SerializeType::Json).unwrap().to_be_bytes());
        frame.extend_from_slice(b"{x}");

        let err = FrameCodec::default().decode(&frame).unwrap_err();
        assert!(err.is_connection_fatal());
    }

    #[test]
    fn oversized_frames() {
        let codec = FrameCodec::new(64);
        let request = RemotingCommand::create_request(1).with_body(vec![0; 128]);
        assert!(matches!(
            codec.encode(&request),
            Err(RemotingError::FrameTooLarge { max: 64, .. })
        ));

        let big = FrameCodec::default().encode(&request).unwrap();
        assert!(matches!(
            codec.decode(&big),
            Err(RemotingError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn descriptor_masks_low_24_bits() {
        let descriptor = mark_protocol_type(0x00AB_CDEF, SerializeType::Binary).unwrap();
        assert_eq!(split_descriptor(descriptor), (1, 0x00AB_CDEF));
        assert!(mark_protocol_type(0x0100_0000, SerializeType::Json).is_err());
    }
}
