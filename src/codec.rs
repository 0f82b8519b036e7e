//! Resumable frame codec.
//!
//! The teacher's `read_frame` (in `read.rs`/`connection.rs`/`stream.rs`)
//! read a header, then extended-length bytes, then mask, then payload,
//! each with its own `read_exact` call directly against the socket. That
//! works for a single always-available stream but can't resume across a
//! partial TCP read. Here the same bit-twiddling is restructured into a
//! pure function over an append-only `BytesMut`, so the caller can read
//! whatever bytes are available, hand them to `Decoder::decode_frame`,
//! and simply try again once more bytes arrive.

use crate::error::Error;
use crate::frame::{Frame, OpCode};
use bytes::{Buf, BytesMut};

pub enum Decoded {
    Frame(Frame),
    NeedMoreData,
}

pub struct Decoder {
    max_frame_size: usize,
}

impl Decoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Attempts to decode exactly one frame from the front of `buf`,
    /// consuming its bytes on success. Leaves `buf` untouched and
    /// returns `NeedMoreData` if the buffer doesn't yet hold a complete
    /// frame.
    pub fn decode_frame(&self, buf: &mut BytesMut) -> Result<Decoded, Error> {
        if buf.len() < 2 {
            return Ok(Decoded::NeedMoreData);
        }

        let first = buf[0];
        let second = buf[1];

        let fin = first & 0b1000_0000 != 0;
        let rsv1 = first & 0b0100_0000 != 0;
        let rsv2 = first & 0b0010_0000 != 0;
        let rsv3 = first & 0b0001_0000 != 0;
        let opcode = OpCode::from_byte(first & 0b0000_1111)?;

        let masked = second & 0b1000_0000 != 0;
        let len_field = (second & 0b0111_1111) as u64;

        let mut header_len = 2usize;
        let payload_len: u64 = if len_field == 126 {
            header_len += 2;
            if buf.len() < header_len {
                return Ok(Decoded::NeedMoreData);
            }
            u16::from_be_bytes([buf[2], buf[3]]) as u64
        } else if len_field == 127 {
            header_len += 8;
            if buf.len() < header_len {
                return Ok(Decoded::NeedMoreData);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let value = u64::from_be_bytes(raw);
            if value & 0x8000_0000_0000_0000 != 0 {
                return Err(Error::Protocol("64-bit payload length has the high bit set".into()));
            }
            value
        } else {
            len_field
        };

        if masked {
            header_len += 4;
        }
        if buf.len() < header_len {
            return Ok(Decoded::NeedMoreData);
        }

        if payload_len > self.max_frame_size as u64 {
            return Err(Error::MessageTooBig);
        }
        let payload_len = payload_len as usize;

        let total_len = header_len + payload_len;
        if buf.len() < total_len {
            return Ok(Decoded::NeedMoreData);
        }

        let mask_key = if masked {
            let start = header_len - 4;
            Some([buf[start], buf[start + 1], buf[start + 2], buf[start + 3]])
        } else {
            None
        };

        buf.advance(header_len);
        let mut payload = buf.split_to(payload_len).to_vec();

        if let Some(key) = mask_key {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        let frame = Frame {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            masked,
            mask_key,
            payload,
        };
        frame.validate()?;

        // The server only ever decodes frames sent by a client, which
        // RFC 6455 requires to be masked.
        if !frame.masked {
            return Err(Error::Protocol("client frame is not masked".into()));
        }

        Ok(Decoded::Frame(frame))
    }
}

/// Encodes a frame for sending to a client. Server-to-client frames are
/// never masked, and the shortest legal length encoding is always used.
pub fn encode_frame(frame: &Frame) -> BytesMut {
    let payload_len = frame.payload.len();
    let mut out = BytesMut::with_capacity(14 + payload_len);

    let first = (frame.fin as u8) << 7
        | (frame.rsv1 as u8) << 6
        | (frame.rsv2 as u8) << 5
        | (frame.rsv3 as u8) << 4
        | frame.opcode.as_u8();
    out.extend_from_slice(&[first]);

    if payload_len <= 125 {
        out.extend_from_slice(&[payload_len as u8]);
    } else if payload_len <= 65535 {
        out.extend_from_slice(&[126]);
        out.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        out.extend_from_slice(&[127]);
        out.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }

    out.extend_from_slice(&frame.payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OpCode;

    fn masked_wire(fin: bool, opcode: OpCode, payload: &[u8], mask: [u8; 4]) -> BytesMut {
        let mut out = BytesMut::new();
        let first = (fin as u8) << 7 | opcode.as_u8();
        out.extend_from_slice(&[first]);

        let len = payload.len();
        if len <= 125 {
            out.extend_from_slice(&[0x80 | len as u8]);
        } else if len <= 65535 {
            out.extend_from_slice(&[0x80 | 126]);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.extend_from_slice(&[0x80 | 127]);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        out.extend_from_slice(&mask);
        let masked_payload: Vec<u8> = payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]).collect();
        out.extend_from_slice(&masked_payload);
        out
    }

    #[test]
    fn decodes_masked_text_frame() {
        let decoder = Decoder::new(1 << 20);
        let mut buf = masked_wire(true, OpCode::Text, b"Hello", [0x01, 0x02, 0x03, 0x04]);
        match decoder.decode_frame(&mut buf).unwrap() {
            Decoded::Frame(frame) => {
                assert_eq!(frame.opcode, OpCode::Text);
                assert_eq!(frame.payload, b"Hello");
                assert!(frame.fin);
            }
            Decoded::NeedMoreData => panic!("expected a complete frame"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn need_more_data_on_partial_header() {
        let decoder = Decoder::new(1 << 20);
        let mut buf = BytesMut::from(&[0x81u8][..]);
        assert!(matches!(decoder.decode_frame(&mut buf).unwrap(), Decoded::NeedMoreData));
    }

    #[test]
    fn need_more_data_on_partial_payload() {
        let decoder = Decoder::new(1 << 20);
        let full = masked_wire(true, OpCode::Text, b"Hello", [9, 9, 9, 9]);
        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        assert!(matches!(decoder.decode_frame(&mut partial).unwrap(), Decoded::NeedMoreData));
    }

    #[test]
    fn rejects_unmasked_client_frame() {
        let decoder = Decoder::new(1 << 20);
        let frame = Frame::new(true, OpCode::Text, b"hi".to_vec());
        let mut buf = encode_frame(&frame);
        assert!(decoder.decode_frame(&mut buf).is_err());
    }

    #[test]
    fn rejects_frame_over_limit() {
        let decoder = Decoder::new(10);
        let mut buf = masked_wire(true, OpCode::Binary, &[0u8; 20], [1, 2, 3, 4]);
        assert!(matches!(decoder.decode_frame(&mut buf), Err(Error::MessageTooBig)));
    }

    #[test]
    fn rejects_high_bit_set_on_64_bit_length() {
        let decoder = Decoder::new(u64::MAX as usize);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x82, 0xFF]);
        buf.extend_from_slice(&[0x80, 0, 0, 0, 0, 0, 0, 1]);
        assert!(decoder.decode_frame(&mut buf).is_err());
    }

    #[test]
    fn length_boundaries_use_expected_encoding() {
        for len in [125usize, 126, 65535, 65536] {
            let payload = vec![0x42u8; len];
            let frame = Frame::new(true, OpCode::Binary, payload.clone());
            let encoded = encode_frame(&frame);
            if len <= 125 {
                assert_eq!(encoded[1] as usize, len);
            } else if len <= 65535 {
                assert_eq!(encoded[1], 126);
            } else {
                assert_eq!(encoded[1], 127);
            }
        }
    }

    #[test]
    fn server_never_emits_masked_frames() {
        let frame = Frame::new(true, OpCode::Text, b"hi".to_vec());
        let encoded = encode_frame(&frame);
        assert_eq!(encoded[1] & 0x80, 0);
    }

    #[test]
    fn control_frame_with_125_byte_payload_is_accepted() {
        let decoder = Decoder::new(1 << 20);
        let mut buf = masked_wire(true, OpCode::Ping, &[0u8; 125], [1, 2, 3, 4]);
        assert!(matches!(decoder.decode_frame(&mut buf), Ok(Decoded::Frame(_))));
    }

    #[test]
    fn control_frame_with_126_byte_payload_is_rejected() {
        let decoder = Decoder::new(1 << 20);
        let mut buf = masked_wire(true, OpCode::Ping, &[0u8; 126], [1, 2, 3, 4]);
        assert!(decoder.decode_frame(&mut buf).is_err());
    }
}
