use std::io::Cursor;

use bytes::Buf;
use mc_varint::{VarInt, VarIntRead, VarIntWrite};
use snafu::{Backtrace, OptionExt, Snafu};
use tracing::trace;

#[derive(Snafu, Debug)]
pub enum FrameError {
    /// Received an incomplete frame.
    Incomplete { backtrace: Backtrace },
    /// I/O error.
    #[snafu(display("I/O error: {source}"), context(false))]
    Io {
        source: std::io::Error,
        backtrace: Backtrace,
    },
    /// Received a frame with an invalid length.
    InvalidLength { backtrace: Backtrace },
    /// Received a frame with an invalid id.
    InvalidFrameId { id: i32, backtrace: Backtrace },
    /// A protocol string ran past its frame or was not UTF-8.
    InvalidString { backtrace: Backtrace },
    /// A protocol string was too long to encode.
    #[snafu(display("string of {length} bytes is too long to encode"))]
    StringTooLong { length: usize, backtrace: Backtrace },
}

/// Strings on the wire are a VarInt byte count followed by that many UTF-8
/// bytes. Append one to a packet body under construction.
pub(super) fn write_string(buf: &mut Vec<u8>, string: &str) -> Result<(), FrameError> {
    let len = i32::try_from(string.len())
        .ok()
        .context(StringTooLongSnafu {
            length: string.len(),
        })?;
    buf.write_var_int(VarInt::from(len))?;
    buf.extend_from_slice(string.as_bytes());
    Ok(())
}

/// Decode a length-prefixed string at the cursor, advancing past it. The
/// declared length must fit inside the already-validated frame.
pub(super) fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, FrameError> {
    let len = usize::try_from(i32::from(cursor.read_var_int()?))
        .ok()
        .context(InvalidStringSnafu)?;
    let bytes = cursor.chunk().get(..len).context(InvalidStringSnafu)?;
    let string = std::str::from_utf8(bytes)
        .ok()
        .context(InvalidStringSnafu)?
        .to_owned();
    cursor.advance(len);
    Ok(string)
}

/// The one clientbound frame of the status flow. The serverbound handshake
/// and status-request frames are built directly by the connection since the
/// controller never parses them.
#[derive(Debug)]
pub enum Frame {
    StatusResponse { json: String },
}

impl Frame {
    pub const PROTOCOL_VERSION: i32 = 767;
    pub const HANDSHAKE_ID: i32 = 0x00;
    pub const STATUS_REQUEST_ID: i32 = 0x00;
    pub const STATUS_RESPONSE_ID: i32 = 0x00;

    /// Checks if an entire frame can be decoded from `buf`, advancing the
    /// cursor past the length header.
    pub fn check(buf: &mut Cursor<&[u8]>) -> Result<(), FrameError> {
        let available_data = buf.get_ref().len();

        // the varint at the beginning contains the size of the rest of the frame
        let remaining_data_len: usize =
            i32::from(buf.read_var_int().ok().context(IncompleteSnafu)?)
                .try_into()
                .ok()
                .context(InvalidLengthSnafu)?;
        let header_len = buf.position() as usize;
        let total_len = header_len + remaining_data_len;

        if available_data >= total_len {
            trace!("complete frame: total {total_len}, buffered {available_data}");
            Ok(())
        } else {
            trace!("partial frame: total {total_len}, buffered {available_data}");
            IncompleteSnafu.fail()
        }
    }

    /// Parse the body of a frame after `check` has validated it.
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Frame, FrameError> {
        let id = i32::from(cursor.read_var_int()?);
        if id == Self::STATUS_RESPONSE_ID {
            let json = read_string(cursor)?;
            return Ok(Frame::StatusResponse { json });
        }
        InvalidFrameIdSnafu { id }.fail()
    }
}
