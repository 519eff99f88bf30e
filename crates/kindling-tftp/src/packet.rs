//! TFTP packet codec.
//!
//! RFC 1350 packets plus option negotiation from RFC 2347, with the
//! blksize (RFC 2348) and timeout/tsize (RFC 2349) options. Unknown
//! options are ignored on parse, as RFC 2347 requires.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TftpError};

/// TFTP opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    /// Option acknowledgment (RFC 2347)
    Oack = 6,
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(TftpError::InvalidPacket(format!("unknown opcode: {value}"))),
        }
    }
}

/// TFTP error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    /// Option negotiation failed (RFC 2347)
    OptionNegotiationFailed = 8,
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        match value {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiationFailed,
            _ => ErrorCode::NotDefined,
        }
    }
}

/// TFTP transfer mode. PXE firmware always uses octet; netascii is
/// accepted and treated the same since everything we serve is binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Octet,
    NetAscii,
}

impl TransferMode {
    fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "octet" => Ok(TransferMode::Octet),
            "netascii" => Ok(TransferMode::NetAscii),
            _ => Err(TftpError::InvalidPacket(format!("unknown mode: {s}"))),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Octet => "octet",
            TransferMode::NetAscii => "netascii",
        }
    }
}

/// Negotiable transfer options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    /// Block size (RFC 2348)
    pub blksize: Option<u16>,
    /// Transfer size (RFC 2349); clients send 0 on a read to ask for it
    pub tsize: Option<u64>,
    /// Retransmission timeout in seconds (RFC 2349)
    pub timeout: Option<u8>,
}

impl TransferOptions {
    pub fn is_empty(&self) -> bool {
        self.blksize.is_none() && self.tsize.is_none() && self.timeout.is_none()
    }

    fn set(&mut self, key: &str, value: &str) {
        match key {
            "blksize" => self.blksize = value.parse().ok(),
            "tsize" => self.tsize = value.parse().ok(),
            "timeout" => self.timeout = value.parse().ok(),
            // Unknown options are ignored, not negotiated.
            _ => {}
        }
    }
}

/// A decoded TFTP packet.
#[derive(Debug, Clone)]
pub enum TftpPacket {
    ReadRequest {
        file_name: String,
        mode: TransferMode,
        options: TransferOptions,
    },
    WriteRequest {
        file_name: String,
        mode: TransferMode,
        options: TransferOptions,
    },
    Data {
        block: u16,
        data: Bytes,
    },
    Ack {
        block: u16,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Oack {
        options: TransferOptions,
    },
}

/// Iterator over the NUL-terminated strings in a request body.
fn strings(body: &[u8]) -> impl Iterator<Item = String> + '_ {
    body.split(|&b| b == 0)
        .map(|part| String::from_utf8_lossy(part).to_string())
}

fn parse_options(mut parts: impl Iterator<Item = String>) -> TransferOptions {
    let mut options = TransferOptions::default();
    while let (Some(key), Some(value)) = (parts.next(), parts.next()) {
        if key.is_empty() {
            break;
        }
        options.set(&key.to_lowercase(), &value);
    }
    options
}

impl TftpPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(TftpError::InvalidPacket("packet too short".to_string()));
        }
        let mut buf = data;
        let opcode = Opcode::try_from(buf.get_u16())?;

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let mut parts = strings(buf);
                let file_name = parts
                    .next()
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| TftpError::InvalidPacket("missing file name".to_string()))?;
                let mode = parts
                    .next()
                    .ok_or_else(|| TftpError::InvalidPacket("missing mode".to_string()))
                    .and_then(|mode| TransferMode::parse(&mode))?;
                let options = parse_options(parts);
                Ok(match opcode {
                    Opcode::Rrq => TftpPacket::ReadRequest {
                        file_name,
                        mode,
                        options,
                    },
                    _ => TftpPacket::WriteRequest {
                        file_name,
                        mode,
                        options,
                    },
                })
            }
            Opcode::Data => {
                if buf.len() < 2 {
                    return Err(TftpError::InvalidPacket("data packet too short".to_string()));
                }
                let block = buf.get_u16();
                Ok(TftpPacket::Data {
                    block,
                    data: Bytes::copy_from_slice(buf),
                })
            }
            Opcode::Ack => {
                if buf.len() < 2 {
                    return Err(TftpError::InvalidPacket("ack packet too short".to_string()));
                }
                Ok(TftpPacket::Ack {
                    block: buf.get_u16(),
                })
            }
            Opcode::Error => {
                if buf.len() < 2 {
                    return Err(TftpError::InvalidPacket("error packet too short".to_string()));
                }
                let code = ErrorCode::from(buf.get_u16());
                let message = strings(buf).next().unwrap_or_default();
                Ok(TftpPacket::Error { code, message })
            }
            Opcode::Oack => Ok(TftpPacket::Oack {
                options: parse_options(strings(buf)),
            }),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            TftpPacket::ReadRequest {
                file_name,
                mode,
                options,
            }
            | TftpPacket::WriteRequest {
                file_name,
                mode,
                options,
            } => {
                let opcode = match self {
                    TftpPacket::ReadRequest { .. } => Opcode::Rrq,
                    _ => Opcode::Wrq,
                };
                buf.put_u16(opcode as u16);
                put_cstr(&mut buf, file_name);
                put_cstr(&mut buf, mode.as_str());
                encode_options(&mut buf, options);
            }
            TftpPacket::Data { block, data } => {
                buf.put_u16(Opcode::Data as u16);
                buf.put_u16(*block);
                buf.put_slice(data);
            }
            TftpPacket::Ack { block } => {
                buf.put_u16(Opcode::Ack as u16);
                buf.put_u16(*block);
            }
            TftpPacket::Error { code, message } => {
                buf.put_u16(Opcode::Error as u16);
                buf.put_u16(*code as u16);
                put_cstr(&mut buf, message);
            }
            TftpPacket::Oack { options } => {
                buf.put_u16(Opcode::Oack as u16);
                encode_options(&mut buf, options);
            }
        }
        buf.freeze()
    }

    pub fn data(block: u16, data: impl Into<Bytes>) -> Self {
        TftpPacket::Data {
            block,
            data: data.into(),
        }
    }

    pub fn ack(block: u16) -> Self {
        TftpPacket::Ack { block }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        TftpPacket::Error {
            code,
            message: message.into(),
        }
    }

    pub fn oack(options: TransferOptions) -> Self {
        TftpPacket::Oack { options }
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn encode_options(buf: &mut BytesMut, options: &TransferOptions) {
    if let Some(blksize) = options.blksize {
        put_cstr(buf, "blksize");
        put_cstr(buf, &blksize.to_string());
    }
    if let Some(tsize) = options.tsize {
        put_cstr(buf, "tsize");
        put_cstr(buf, &tsize.to_string());
    }
    if let Some(timeout) = options.timeout {
        put_cstr(buf, "timeout");
        put_cstr(buf, &timeout.to_string());
    }
}
