//! # Camera Command & Response Frames
//!
//! Fixed-layout byte frames exchanged with the PTC06 / VC0706-class module.
//!
//! ## Frame Formats
//!
//! ```text
//! Command:   56 00 <opcode> <param-len> <params...>
//! Ack:       76 00 <opcode> 00 <status>                   (5 bytes)
//! Length:    76 00 34 00 04 00 00 <len-hi> <len-lo>      (9 bytes)
//! Chunk:     76 00 32 00 00 | <data...> | 76 00 32 00 00  (envelope)
//! ```
//!
//! Only the first four bytes of an acknowledgment are checked; the status
//! byte varies between firmware revisions.

use heapless::Vec;
use serde::{Deserialize, Serialize};

/// First byte of every command sent to the module
pub const COMMAND_PREFIX: u8 = 0x56;

/// First byte of every reply from the module
pub const REPLY_PREFIX: u8 = 0x76;

/// Acknowledgment frame length
pub const ACK_LEN: usize = 5;

/// Length-query reply length
pub const LENGTH_REPLY_LEN: usize = 9;

/// Header and footer that wrap every chunk of image data
pub const CHUNK_ENVELOPE: [u8; 5] = [0x76, 0x00, 0x32, 0x00, 0x00];

/// Bytes of envelope around one chunk (header + footer)
pub const ENVELOPE_OVERHEAD: usize = 2 * CHUNK_ENVELOPE.len();

/// Longest encoded command (chunk read)
pub const MAX_COMMAND_LEN: usize = 16;

/// Opcodes understood by the module
pub mod opcode {
    pub const RESET: u8 = 0x26;
    pub const SET_BAUD: u8 = 0x24;
    pub const WRITE_DATA: u8 = 0x31;
    pub const READ_FBUF: u8 = 0x32;
    pub const GET_FBUF_LEN: u8 = 0x34;
    pub const FBUF_CTRL: u8 = 0x36;
}

/// Frame buffer control sub-commands
const FBUF_STOP_CURRENT: u8 = 0x00;
const FBUF_RESUME: u8 = 0x03;

/// Trailing delay field of the chunk read command (in 0.01 ms units)
const READ_FBUF_DELAY: [u8; 2] = [0x00, 0xFF];

/// Errors while decoding a reply frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("bad reply prefix")]
    BadPrefix,
    #[error("opcode mismatch: expected {expected:#04x}, got {actual:#04x}")]
    OpcodeMismatch { expected: u8, actual: u8 },
    #[error("malformed reply")]
    Malformed,
}

/// Capture resolution codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ImageSize {
    /// 160x120
    Qqvga = 0x22,
    /// 320x240
    Qvga = 0x11,
    /// 640x480
    Vga = 0x00,
}

impl TryFrom<u8> for ImageSize {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x22 => Ok(Self::Qqvga),
            0x11 => Ok(Self::Qvga),
            0x00 => Ok(Self::Vga),
            _ => Err(FrameError::Malformed),
        }
    }
}

/// One outbound instruction to the camera module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Soft reset; the ack is followed by a version banner
    Reset,
    /// Switch the module's baud rate until the next power cycle
    SetBaudTemp(u16),
    /// Select capture resolution
    SetImageSize(ImageSize),
    /// Select JPEG compression level
    SetCompression(u8),
    /// Freeze the current frame into the frame buffer
    TakePicture,
    /// Release the frozen frame so the next capture can start
    ClearCache,
    /// Query the frozen frame's length
    GetLength,
    /// Read `len` bytes of the frozen frame starting at `offset`
    ReadChunk { offset: u32, len: u16 },
}

impl Command {
    /// Opcode echoed back in the acknowledgment
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Reset => opcode::RESET,
            Command::SetBaudTemp(_) => opcode::SET_BAUD,
            Command::SetImageSize(_) | Command::SetCompression(_) => opcode::WRITE_DATA,
            Command::TakePicture | Command::ClearCache => opcode::FBUF_CTRL,
            Command::GetLength => opcode::GET_FBUF_LEN,
            Command::ReadChunk { .. } => opcode::READ_FBUF,
        }
    }

    /// Encode into the wire layout
    pub fn encode(&self) -> Vec<u8, MAX_COMMAND_LEN> {
        let mut frame = Vec::new();
        // Every layout below fits in MAX_COMMAND_LEN
        let mut put = |bytes: &[u8]| {
            let _ = frame.extend_from_slice(bytes);
        };

        put(&[COMMAND_PREFIX, 0x00, self.opcode()]);
        match *self {
            Command::Reset => put(&[0x00]),
            Command::SetBaudTemp(code) => {
                put(&[0x03, 0x01]);
                put(&code.to_be_bytes());
            }
            Command::SetImageSize(size) => put(&[0x05, 0x04, 0x01, 0x00, 0x19, size as u8]),
            Command::SetCompression(level) => put(&[0x05, 0x01, 0x01, 0x12, 0x04, level]),
            Command::TakePicture => put(&[0x01, FBUF_STOP_CURRENT]),
            Command::ClearCache => put(&[0x01, FBUF_RESUME]),
            Command::GetLength => put(&[0x01, 0x00]),
            Command::ReadChunk { offset, len } => {
                put(&[0x0C, 0x00, 0x0A]);
                put(&offset.to_be_bytes());
                put(&u32::from(len).to_be_bytes());
                put(&READ_FBUF_DELAY);
            }
        }
        frame
    }
}

/// Decoded acknowledgment frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ack {
    pub opcode: u8,
    pub status: u8,
}

impl Ack {
    /// Decode and check the first four bytes against `expected` opcode
    pub fn decode(bytes: &[u8], expected: u8) -> Result<Self, FrameError> {
        if bytes.len() < ACK_LEN {
            return Err(FrameError::TooShort(bytes.len()));
        }
        if bytes[0] != REPLY_PREFIX || bytes[1] != 0x00 || bytes[3] != 0x00 {
            return Err(FrameError::BadPrefix);
        }
        if bytes[2] != expected {
            return Err(FrameError::OpcodeMismatch {
                expected,
                actual: bytes[2],
            });
        }
        Ok(Self {
            opcode: bytes[2],
            status: bytes[4],
        })
    }

    /// Encode as sent by the module (used by emulators and tests)
    pub fn encode(&self) -> [u8; ACK_LEN] {
        [REPLY_PREFIX, 0x00, self.opcode, 0x00, self.status]
    }
}

/// Prefix of the length-query reply, also the unit of partial recovery
pub const LENGTH_REPLY_PREFIX: [u8; 4] = [REPLY_PREFIX, 0x00, opcode::GET_FBUF_LEN, 0x00];

/// Data-length byte that follows the length reply prefix
const LENGTH_REPLY_DATA_LEN: u8 = 0x04;

/// Decode the 9-byte length-query reply into the image length
pub fn decode_length(bytes: &[u8]) -> Result<u16, FrameError> {
    if bytes.len() < LENGTH_REPLY_LEN {
        return Err(FrameError::TooShort(bytes.len()));
    }
    if bytes[..4] != LENGTH_REPLY_PREFIX {
        return Err(FrameError::BadPrefix);
    }
    if bytes[4] != LENGTH_REPLY_DATA_LEN {
        return Err(FrameError::Malformed);
    }
    Ok(u16::from_be_bytes([bytes[7], bytes[8]]))
}

/// Encode a length-query reply (used by emulators and tests)
pub fn encode_length(len: u16) -> [u8; LENGTH_REPLY_LEN] {
    let [hi, lo] = len.to_be_bytes();
    [
        REPLY_PREFIX,
        0x00,
        opcode::GET_FBUF_LEN,
        0x00,
        LENGTH_REPLY_DATA_LEN,
        0x00,
        0x00,
        hi,
        lo,
    ]
}

/// Byte-exact check of a chunk header or footer
#[inline]
pub fn envelope_matches(bytes: &[u8]) -> bool {
    bytes == CHUNK_ENVELOPE
}

/// JPEG start-of-image marker
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
