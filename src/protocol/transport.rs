use std::io::{self, ErrorKind, Read, Write};

use crate::{
    RemotingError,
    error::Result,
    protocol::{FrameCodec, RemotingCommand, frame::LENGTH_FIELD_SIZE},
};

/// Outcome of one blocking read on a stream.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    Command(RemotingCommand),
    /// Read timeout elapsed with no partial frame pending.
    Idle,
    /// Peer closed the stream on a frame boundary.
    Closed,
}

enum Fill {
    Full,
    Idle,
    Eof,
}

/// Reads frames off a byte stream.
///
/// A read timeout configured on the underlying stream surfaces as [`Inbound::Idle`] between
/// frames. Inside a frame it is an error: the peer went a whole timeout period without
/// finishing the frame it started, and the stream cannot be resynced.
pub struct FrameReader<R: Read> {
    stream: R,
    codec: FrameCodec,
}

impl<R: Read> FrameReader<R> {
    pub fn new(stream: R, codec: FrameCodec) -> Self {
        Self { stream, codec }
    }

    pub fn read_command(&mut self) -> Result<Inbound> {
        let mut prefix = [0u8; LENGTH_FIELD_SIZE];
        match self.fill(&mut prefix, true)? {
            Fill::Full => {}
            Fill::Idle => return Ok(Inbound::Idle),
            Fill::Eof => return Ok(Inbound::Closed),
        }

        let total_length = u32::from_be_bytes(prefix) as usize;
        // Reject before buffering anything.
        self.codec.check_total_length(total_length)?;

        let mut payload = vec![0u8; total_length];
        self.fill(&mut payload, false)?;
        Ok(Inbound::Command(self.codec.decode_payload(&payload)?))
    }

    fn fill(&mut self, buf: &mut [u8], at_boundary: bool) -> Result<Fill> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) if at_boundary && filled == 0 => return Ok(Fill::Eof),
                Ok(0) => {
                    return Err(RemotingError::Io(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!("stream closed after {filled} of {} bytes", buf.len()),
                    )));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if is_timeout(&e) && at_boundary && filled == 0 => return Ok(Fill::Idle),
                Err(e) if is_timeout(&e) => {
                    return Err(RemotingError::Io(io::Error::new(
                        ErrorKind::TimedOut,
                        format!("peer stalled after {filled} of {} bytes", buf.len()),
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Fill::Full)
    }
}

/// Writes frames onto a byte stream.
pub struct FrameWriter<W: Write> {
    stream: W,
    codec: FrameCodec,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(stream: W, codec: FrameCodec) -> Self {
        Self { stream, codec }
    }

    pub fn write_command(&mut self, command: &RemotingCommand) -> Result<()> {
        let frame = self.codec.encode(command)?;
        self.write_frame(&frame)
    }

    /// Write an already encoded frame.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.stream.write_all(frame)?;
        self.stream.flush()?;
        Ok(())
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Seek};

    use super::*;

    #[test]
    fn read_write_request() {
        let codec = FrameCodec::default();
        let mut writer = FrameWriter::new(Cursor::new(Vec::new()), codec);

        let request = RemotingCommand::create_request(310).with_body(b"ping".to_vec());
        writer.write_command(&request).unwrap();
        writer.stream.seek(std::io::SeekFrom::Start(0)).unwrap();

        let mut reader = FrameReader::new(writer.stream, codec);
        assert_eq!(reader.read_command().unwrap(), Inbound::Command(request));
        assert_eq!(reader.read_command().unwrap(), Inbound::Closed);
    }

    #[test]
    fn back_to_back_frames() {
        let codec = FrameCodec::default();
        let mut writer = FrameWriter::new(Vec::new(), codec);
        let first = RemotingCommand::create_request(1);
        let second = RemotingCommand::create_response(0, Some("ok".into()));
        writer.write_command(&first).unwrap();
        writer.write_command(&second).unwrap();

        let mut reader = FrameReader::new(Cursor::new(writer.stream), codec);
        assert_eq!(reader.read_command().unwrap(), Inbound::Command(first));
        assert_eq!(reader.read_command().unwrap(), Inbound::Command(second));
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&RemotingCommand::create_request(1)).unwrap();

        let mut reader = FrameReader::new(Cursor::new(frame[..frame.len() - 2].to_vec()), codec);
        let err = reader.read_command().unwrap_err();
        assert!(matches!(err, RemotingError::Io(e) if e.kind() == ErrorKind::UnexpectedEof));
    }

    #[test]
    fn oversized_prefix_rejected_before_buffering() {
        let mut bytes = u32::MAX.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0; 16]);

        let mut reader = FrameReader::new(Cursor::new(bytes), FrameCodec::new(1024));
        assert!(matches!(
            reader.read_command(),
            Err(RemotingError::FrameTooLarge { .. })
        ));
    }

    /// Yields one timeout, then delegates.
    struct TimeoutOnce<R> {
        inner: R,
        fired: bool,
    }

    impl<R: Read> Read for TimeoutOnce<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.fired {
                self.fired = true;
                return Err(io::Error::new(ErrorKind::WouldBlock, "timeout"));
            }
            self.inner.read(buf)
        }
    }

    #[test]
    fn timeout_between_frames_is_idle() {
        let codec = FrameCodec::default();
        let request = RemotingCommand::create_request(9);
        let stream = TimeoutOnce {
            inner: Cursor::new(codec.encode(&request).unwrap()),
            fired: false,
        };

        let mut reader = FrameReader::new(stream, codec);
        assert_eq!(reader.read_command().unwrap(), Inbound::Idle);
        assert_eq!(reader.read_command().unwrap(), Inbound::Command(request));
    }

    /// Hands out `data`, then times out forever.
    struct Stalling {
        data: Cursor<Vec<u8>>,
    }

    impl Read for Stalling {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.data.read(buf)? {
                0 => Err(io::Error::new(ErrorKind::WouldBlock, "timeout")),
                n => Ok(n),
            }
        }
    }

    #[test]
    fn timeout_inside_frame_is_an_error() {
        let codec = FrameCodec::default();
        let frame = codec.encode(&RemotingCommand::create_request(9)).unwrap();

        for cut in [2, LENGTH_FIELD_SIZE + 3] {
            let mut reader = FrameReader::new(
                Stalling {
                    data: Cursor::new(frame[..cut].to_vec()),
                },
                codec,
            );
            let err = reader.read_command().unwrap_err();
            assert!(
                matches!(err, RemotingError::Io(ref e) if e.kind() == ErrorKind::TimedOut),
                "cut at {cut}: {err}"
            );
            assert!(!err.is_connection_fatal());
        }
    }
}
