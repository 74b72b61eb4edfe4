//! WebSocket frame codec (RFC 6455 subset used by the app-server).
//!
//! Decoding is incremental: bytes are pushed into a [`FrameReader`] as they
//! arrive and complete messages are pulled out once enough bytes are buffered.
//! Fragmented data messages are reassembled; control frames are surfaced
//! immediately, even when they arrive between fragments.

use crate::error::FrameError;

/// Largest payload accepted for a single frame or reassembled message.
pub const MAX_PAYLOAD_LEN: u64 = 64 * 1024 * 1024;

const FIN_BIT: u8 = 0x80;
const RESERVED_BITS: u8 = 0x70;
const OPCODE_MASK: u8 = 0x0f;
const MASK_BIT: u8 = 0x80;
const LEN_MASK: u8 = 0x7f;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;
const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::ReservedOpcode(other)),
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(Opcode::Text, text.as_bytes())
    }

    pub fn pong(payload: &[u8]) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self::new(Opcode::Close, payload)
    }
}

/// A complete application-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: Option<u16>, reason: String },
}

/// Encode a frame, masking the payload when a key is given.
pub fn encode_frame(frame: &Frame, mask: Option<[u8; 4]>) -> Vec<u8> {
    let len = frame.payload.len();
    let mut out = Vec::with_capacity(len + 14);

    let mut first = frame.opcode.as_u8();
    if frame.fin {
        first |= FIN_BIT;
    }
    out.push(first);

    let mask_flag = if mask.is_some() { MASK_BIT } else { 0 };
    if len < usize::from(LEN_16) {
        out.push(mask_flag | len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(mask_flag | LEN_16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_flag | LEN_64);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.extend(
                frame
                    .payload
                    .iter()
                    .enumerate()
                    .map(|(index, byte)| byte ^ key[index % 4]),
            );
        }
        None => out.extend_from_slice(&frame.payload),
    }
    out
}

/// Encode a client-to-server frame with a fresh random mask.
pub fn encode_client_frame(frame: &Frame) -> Vec<u8> {
    let key: [u8; 4] = rand::random();
    encode_frame(frame, Some(key))
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the frame and the
/// number of bytes it occupied.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first = buf[0];
    let second = buf[1];
    if first & RESERVED_BITS != 0 {
        return Err(FrameError::ReservedBits);
    }
    let fin = first & FIN_BIT != 0;
    let opcode = Opcode::from_u8(first & OPCODE_MASK)?;
    let masked = second & MASK_BIT != 0;

    let mut offset = 2usize;
    let payload_len = match second & LEN_MASK {
        LEN_16 => {
            let Some(bytes) = buf.get(offset..offset + 2) else {
                return Ok(None);
            };
            offset += 2;
            u64::from(u16::from_be_bytes([bytes[0], bytes[1]]))
        }
        LEN_64 => {
            let Some(bytes) = buf.get(offset..offset + 8) else {
                return Ok(None);
            };
            offset += 8;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            u64::from_be_bytes(raw)
        }
        short => u64::from(short),
    };

    if opcode.is_control() {
        if !fin {
            return Err(FrameError::FragmentedControl);
        }
        if payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::ControlTooLong(payload_len as usize));
        }
    }
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(payload_len));
    }

    let mask = if masked {
        let Some(bytes) = buf.get(offset..offset + 4) else {
            return Ok(None);
        };
        offset += 4;
        Some([bytes[0], bytes[1], bytes[2], bytes[3]])
    } else {
        None
    };

    let payload_len = payload_len as usize;
    let Some(raw) = buf.get(offset..offset + payload_len) else {
        return Ok(None);
    };
    let payload = match mask {
        Some(key) => raw
            .iter()
            .enumerate()
            .map(|(index, byte)| byte ^ key[index % 4])
            .collect(),
        None => raw.to_vec(),
    };

    Ok(Some((
        Frame {
            fin,
            opcode,
            payload,
        },
        offset + payload_len,
    )))
}

/// Accumulating receive buffer plus fragment reassembly state.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
    fragments: Option<(Opcode, Vec<u8>)>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Pull the next complete message, or `Ok(None)` if more data is needed.
    pub fn next_message(&mut self) -> Result<Option<Message>, FrameError> {
        loop {
            let Some((frame, consumed)) = decode_frame(&self.buffer)? else {
                return Ok(None);
            };
            self.buffer.drain(..consumed);

            if let Some(message) = self.accept(frame)? {
                return Ok(Some(message));
            }
        }
    }

    fn accept(&mut self, frame: Frame) -> Result<Option<Message>, FrameError> {
        match frame.opcode {
            Opcode::Ping => Ok(Some(Message::Ping(frame.payload))),
            Opcode::Pong => Ok(Some(Message::Pong(frame.payload))),
            Opcode::Close => Ok(Some(parse_close(&frame.payload))),
            Opcode::Continuation => {
                let Some((opcode, mut assembled)) = self.fragments.take() else {
                    return Err(FrameError::UnexpectedContinuation);
                };
                assembled.extend_from_slice(&frame.payload);
                if assembled.len() as u64 > MAX_PAYLOAD_LEN {
                    return Err(FrameError::PayloadTooLarge(assembled.len() as u64));
                }
                if frame.fin {
                    finish_data(opcode, assembled).map(Some)
                } else {
                    self.fragments = Some((opcode, assembled));
                    Ok(None)
                }
            }
            Opcode::Text | Opcode::Binary => {
                if self.fragments.is_some() {
                    return Err(FrameError::InterleavedMessage);
                }
                if frame.fin {
                    finish_data(frame.opcode, frame.payload).map(Some)
                } else {
                    self.fragments = Some((frame.opcode, frame.payload));
                    Ok(None)
                }
            }
        }
    }
}

fn finish_data(opcode: Opcode, payload: Vec<u8>) -> Result<Message, FrameError> {
    if opcode == Opcode::Text {
        String::from_utf8(payload)
            .map(Message::Text)
            .map_err(|_| FrameError::InvalidUtf8)
    } else {
        Ok(Message::Binary(payload))
    }
}

fn parse_close(payload: &[u8]) -> Message {
    if payload.len() < 2 {
        return Message::Close {
            code: None,
            reason: String::new(),
        };
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    Message::Close {
        code: Some(code),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(len: usize) -> Vec<u8> {
        (0..len).map(|index| (index % 251) as u8).collect()
    }

    #[test]
    fn roundtrip_all_length_encodings_masked_and_unmasked() {
        for len in [0usize, 1, 125, 126, 65_535, 65_536, 70_000] {
            let frame = Frame::new(Opcode::Binary, payload_of(len));
            for mask in [None, Some([0x12, 0x34, 0x56, 0x78])] {
                let encoded = encode_frame(&frame, mask);
                let (decoded, consumed) = decode_frame(&encoded)
                    .expect("decode")
                    .expect("complete frame");
                assert_eq!(consumed, encoded.len());
                assert_eq!(decoded, frame, "len {len} mask {mask:?}");
            }
        }
    }

    #[test]
    fn encoder_picks_minimal_length_field() {
        let short = encode_frame(&Frame::new(Opcode::Text, payload_of(125)), None);
        assert_eq!(short[1], 125);
        assert_eq!(short.len(), 2 + 125);

        let medium = encode_frame(&Frame::new(Opcode::Text, payload_of(126)), None);
        assert_eq!(medium[1], LEN_16);
        assert_eq!(medium.len(), 4 + 126);

        let long = encode_frame(&Frame::new(Opcode::Text, payload_of(65_536)), None);
        assert_eq!(long[1], LEN_64);
        assert_eq!(long.len(), 10 + 65_536);
    }

    #[test]
    fn client_frames_are_always_masked() {
        let encoded = encode_client_frame(&Frame::text("hello"));
        assert_eq!(encoded[1] & MASK_BIT, MASK_BIT);
        let (decoded, _) = decode_frame(&encoded).expect("decode").expect("frame");
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn partial_input_needs_more_data() {
        let encoded = encode_frame(&Frame::text("partial payload"), Some([1, 2, 3, 4]));
        for cut in 0..encoded.len() {
            assert_eq!(decode_frame(&encoded[..cut]), Ok(None), "cut at {cut}");
        }

        let mut reader = FrameReader::new();
        let (head, tail) = encoded.split_at(5);
        reader.push(head);
        assert_eq!(reader.next_message(), Ok(None));
        reader.push(tail);
        assert_eq!(
            reader.next_message(),
            Ok(Some(Message::Text("partial payload".to_string())))
        );
        assert_eq!(reader.buffered_len(), 0);
    }

    #[test]
    fn fragmented_text_is_reassembled_across_frames() {
        let text = "{\"method\":\"turn/started\",\"params\":{}}";
        for parts in 1..=5usize {
            let chunk = text.len().div_ceil(parts);
            let pieces: Vec<&[u8]> = text.as_bytes().chunks(chunk).collect();
            let mut reader = FrameReader::new();
            for (index, piece) in pieces.iter().enumerate() {
                let frame = Frame {
                    fin: index + 1 == pieces.len(),
                    opcode: if index == 0 {
                        Opcode::Text
                    } else {
                        Opcode::Continuation
                    },
                    payload: piece.to_vec(),
                };
                reader.push(&encode_frame(&frame, Some([9, 8, 7, 6])));
            }
            assert_eq!(
                reader.next_message(),
                Ok(Some(Message::Text(text.to_string()))),
                "{parts} fragments"
            );
            assert_eq!(reader.next_message(), Ok(None));
        }
    }

    #[test]
    fn control_frames_pass_through_fragmented_message() {
        let mut reader = FrameReader::new();
        reader.push(&encode_frame(
            &Frame {
                fin: false,
                opcode: Opcode::Text,
                payload: b"hel".to_vec(),
            },
            None,
        ));
        reader.push(&encode_frame(&Frame::new(Opcode::Ping, b"beat".to_vec()), None));
        reader.push(&encode_frame(
            &Frame {
                fin: true,
                opcode: Opcode::Continuation,
                payload: b"lo".to_vec(),
            },
            None,
        ));

        assert_eq!(reader.next_message(), Ok(Some(Message::Ping(b"beat".to_vec()))));
        assert_eq!(
            reader.next_message(),
            Ok(Some(Message::Text("hello".to_string())))
        );
    }

    #[test]
    fn close_frame_carries_code_and_reason() {
        let mut reader = FrameReader::new();
        reader.push(&encode_frame(&Frame::close(1011, "server going away"), None));
        assert_eq!(
            reader.next_message(),
            Ok(Some(Message::Close {
                code: Some(1011),
                reason: "server going away".to_string(),
            }))
        );

        reader.push(&encode_frame(&Frame::new(Opcode::Close, Vec::new()), None));
        assert_eq!(
            reader.next_message(),
            Ok(Some(Message::Close {
                code: None,
                reason: String::new(),
            }))
        );
    }

    #[test]
    fn protocol_violations_are_reported() {
        assert_eq!(decode_frame(&[0x83, 0x00]), Err(FrameError::ReservedOpcode(3)));
        assert_eq!(decode_frame(&[0xC1, 0x00]), Err(FrameError::ReservedBits));
        assert_eq!(decode_frame(&[0x09, 0x00]), Err(FrameError::FragmentedControl));
        assert_eq!(decode_frame(&[0x89, 126, 0, 200]), Err(FrameError::ControlTooLong(200)));

        let mut reader = FrameReader::new();
        reader.push(&encode_frame(
            &Frame {
                fin: true,
                opcode: Opcode::Continuation,
                payload: b"orphan".to_vec(),
            },
            None,
        ));
        assert_eq!(reader.next_message(), Err(FrameError::UnexpectedContinuation));

        let mut reader = FrameReader::new();
        reader.push(&encode_frame(&Frame::new(Opcode::Text, vec![0xff, 0xfe]), None));
        assert_eq!(reader.next_message(), Err(FrameError::InvalidUtf8));
    }

    #[test]
    fn several_frames_in_one_chunk_decode_in_order() {
        let mut bytes = encode_frame(&Frame::text("one"), None);
        bytes.extend(encode_frame(&Frame::text("two"), Some([4, 3, 2, 1])));
        let mut reader = FrameReader::new();
        reader.push(&bytes);
        assert_eq!(reader.next_message(), Ok(Some(Message::Text("one".into()))));
        assert_eq!(reader.next_message(), Ok(Some(Message::Text("two".into()))));
        assert_eq!(reader.next_message(), Ok(None));
    }
}
