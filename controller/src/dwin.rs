//! DWIN DGUS serial framing: `5A A5 <len> <cmd> <addr_hi> <addr_lo> <data...>`, where `len`
//! counts every byte after itself.

use growbox_common::DisplayEvent;
use thiserror::Error;

pub const HEADER: [u8; 2] = [0x5A, 0xA5];
pub const CMD_WRITE: u8 = 0x82;
pub const CMD_READ: u8 = 0x83;

/// Text input fields end with `FF FF` on the wire.
const TEXT_END: u8 = 0xFF;
const MAX_PAYLOAD: usize = u8::MAX as usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {0} bytes does not fit one frame")]
    TooLong(usize),
    #[error("frame shorter than its header claims")]
    Truncated,
    #[error("unexpected command {0:#04X}")]
    UnknownCommand(u8),
}

fn frame(command: u8, address: u16, data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = 3 + data.len();
    if len > MAX_PAYLOAD {
        return Err(FrameError::TooLong(len));
    }
    let mut out = Vec::with_capacity(3 + len);
    out.extend_from_slice(&HEADER);
    out.push(len as u8);
    out.push(command);
    out.extend_from_slice(&address.to_be_bytes());
    out.extend_from_slice(data);
    Ok(out)
}

/// Numeric VPs are one 16-bit word on the panel.
pub fn encode_value(address: u16, value: u8) -> Vec<u8> {
    let word = u16::from(value).to_be_bytes();
    // Four bytes of payload never exceed the limit.
    frame(CMD_WRITE, address, &word).unwrap_or_default()
}

pub fn encode_text(address: u16, text: &str) -> Result<Vec<u8>, FrameError> {
    frame(CMD_WRITE, address, text.as_bytes())
}

/// Parses the body of one frame (everything after the length byte).
/// `Ok(None)` for frames that carry no event, such as the panel's `OK` write acknowledgement.
pub fn decode_body(body: &[u8]) -> Result<Option<DisplayEvent>, FrameError> {
    let (&command, rest) = body.split_first().ok_or(FrameError::Truncated)?;
    match command {
        CMD_WRITE => Ok(None),
        CMD_READ => {
            let [hi, lo, _words, data @ ..] = rest else {
                return Err(FrameError::Truncated);
            };
            let address = u16::from_be_bytes([*hi, *lo]);
            let numeric = match data {
                [a, b, ..] => u16::from_be_bytes([*a, *b]),
                _ => 0,
            };
            let text_bytes: Vec<u8> = data
                .iter()
                .copied()
                .take_while(|byte| *byte != TEXT_END && *byte != 0)
                .collect();
            let text = String::from_utf8_lossy(&text_bytes).trim_end().to_string();
            Ok(Some(DisplayEvent {
                address,
                numeric,
                text,
            }))
        }
        other => Err(FrameError::UnknownCommand(other)),
    }
}

/// Reassembles frames from a byte stream, resynchronising on the header after garbage.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    rejected: usize,
}

impl FrameDecoder {
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DisplayEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        loop {
            let Some(start) = self.buffer.windows(2).position(|pair| pair == HEADER) else {
                // Keep a trailing 0x5A, it may be the first half of a header.
                let keep = usize::from(self.buffer.last() == Some(&HEADER[0]));
                self.buffer.drain(..self.buffer.len() - keep);
                break;
            };
            self.buffer.drain(..start);

            let Some(&len) = self.buffer.get(2) else {
                break;
            };
            let end = 3 + usize::from(len);
            if self.buffer.len() < end {
                break;
            }

            let body: Vec<u8> = self.buffer.drain(..end).skip(3).collect();
            match decode_body(&body) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(_) => self.rejected += 1,
            }
        }
        events
    }
}
