//! Update commands and their responses.
//!
//! A frame payload starts with a command type byte; the remainder is
//! command-specific. Success responses echo the type with bit 7 set; any
//! failure is `0xFF` followed by the error code. Multi-byte integers are
//! big-endian.

use super::BootError;

pub const HANDSHAKE: u8 = 0x01;
pub const PREPARE_FLASH: u8 = 0x02;
pub const DATA: u8 = 0x03;
pub const VERIFY: u8 = 0x04;

pub const RESP_OK_BIT: u8 = 0x80;
pub const RESP_ERROR: u8 = 0xFF;

pub const PROTOCOL_VERSION: u16 = 0x0001;

#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Handshake { version: u16 },
    PrepareFlash { size: u32 },
    Data { chunk: &'a [u8] },
    Verify { size: u32, crc32: u32 },
}

impl<'a> Command<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, BootError> {
        let (&kind, rest) = payload.split_first().ok_or(BootError::InvalidRequest)?;
        match kind {
            HANDSHAKE => {
                let raw: [u8; 2] = rest.try_into().map_err(|_| BootError::InvalidRequest)?;
                Ok(Command::Handshake {
                    version: u16::from_be_bytes(raw),
                })
            }
            PREPARE_FLASH => {
                let raw: [u8; 4] = rest.try_into().map_err(|_| BootError::InvalidRequest)?;
                Ok(Command::PrepareFlash {
                    size: u32::from_be_bytes(raw),
                })
            }
            DATA => {
                if rest.is_empty() {
                    return Err(BootError::InvalidRequest);
                }
                Ok(Command::Data { chunk: rest })
            }
            VERIFY => {
                let raw: [u8; 8] = rest.try_into().map_err(|_| BootError::InvalidRequest)?;
                Ok(Command::Verify {
                    size: u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
                    crc32: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
                })
            }
            _ => Err(BootError::InvalidRequest),
        }
    }

    /// Serialize a request payload (host-side tooling and tests).
    pub fn write(&self, out: &mut [u8]) -> Result<usize, BootError> {
        match self {
            Command::Handshake { version } => {
                let out = out.get_mut(..3).ok_or(BootError::FrameSize)?;
                out[0] = HANDSHAKE;
                out[1..3].copy_from_slice(&version.to_be_bytes());
                Ok(3)
            }
            Command::PrepareFlash { size } => {
                let out = out.get_mut(..5).ok_or(BootError::FrameSize)?;
                out[0] = PREPARE_FLASH;
                out[1..5].copy_from_slice(&size.to_be_bytes());
                Ok(5)
            }
            Command::Data { chunk } => {
                let out = out.get_mut(..1 + chunk.len()).ok_or(BootError::FrameSize)?;
                out[0] = DATA;
                out[1..].copy_from_slice(chunk);
                Ok(1 + chunk.len())
            }
            Command::Verify { size, crc32 } => {
                let out = out.get_mut(..9).ok_or(BootError::FrameSize)?;
                out[0] = VERIFY;
                out[1..5].copy_from_slice(&size.to_be_bytes());
                out[5..9].copy_from_slice(&crc32.to_be_bytes());
                Ok(9)
            }
        }
    }
}

pub fn handshake_ok() -> [u8; 5] {
    let version = PROTOCOL_VERSION.to_be_bytes();
    [RESP_OK_BIT | HANDSHAKE, version[0], version[1], b'O', b'K']
}

pub fn prepare_ok() -> [u8; 3] {
    [RESP_OK_BIT | PREPARE_FLASH, b'O', b'K']
}

pub fn data_ok() -> [u8; 3] {
    [RESP_OK_BIT | DATA, b'O', b'K']
}

pub fn verify_ok(written: u16) -> [u8; 5] {
    let written = written.to_be_bytes();
    [RESP_OK_BIT | VERIFY, b'O', b'K', written[0], written[1]]
}

pub fn error_response(error: BootError) -> [u8; 2] {
    [RESP_ERROR, error.code()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips() {
        let mut buf = [0u8; 64];

        let cmd = Command::Handshake { version: 0x0102 };
        let n = cmd.write(&mut buf).unwrap();
        assert_eq!(Command::parse(&buf[..n]).unwrap(), cmd);

        let cmd = Command::PrepareFlash { size: 24 };
        let n = cmd.write(&mut buf).unwrap();
        assert_eq!(Command::parse(&buf[..n]).unwrap(), cmd);

        let chunk = [1u8, 2, 3, 4, 5];
        let cmd = Command::Data { chunk: &chunk };
        let n = cmd.write(&mut buf).unwrap();
        assert_eq!(Command::parse(&buf[..n]).unwrap(), Command::Data { chunk: &chunk });

        let cmd = Command::Verify {
            size: 24,
            crc32: 0xCAFE_F00D,
        };
        let n = cmd.write(&mut buf).unwrap();
        assert_eq!(Command::parse(&buf[..n]).unwrap(), cmd);
    }

    #[test]
    fn malformed_payloads_are_invalid_requests() {
        assert_eq!(Command::parse(&[]), Err(BootError::InvalidRequest));
        assert_eq!(Command::parse(&[0x09]), Err(BootError::InvalidRequest));
        assert_eq!(Command::parse(&[HANDSHAKE, 0x00]), Err(BootError::InvalidRequest));
        assert_eq!(
            Command::parse(&[PREPARE_FLASH, 0, 0, 1]),
            Err(BootError::InvalidRequest)
        );
        assert_eq!(Command::parse(&[DATA]), Err(BootError::InvalidRequest));
        assert_eq!(
            Command::parse(&[VERIFY, 0, 0, 0, 24, 0, 0, 0]),
            Err(BootError::InvalidRequest)
        );
    }

    #[test]
    fn responses_echo_type_with_ok_bit() {
        assert_eq!(handshake_ok()[0], 0x81);
        assert_eq!(prepare_ok(), [0x82, b'O', b'K']);
        assert_eq!(data_ok(), [0x83, b'O', b'K']);
        assert_eq!(verify_ok(24), [0x84, b'O', b'K', 0x00, 24]);
        assert_eq!(error_response(BootError::Crc)[0], RESP_ERROR);
    }
}
