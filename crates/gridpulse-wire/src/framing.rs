//! Command-channel and data-channel frame layouts.
//!
//! Command frames carry a big-endian payload-size prefix followed by a
//! one-byte command code and command-specific bytes. Response frames carry
//! `responseCode, commandCode, dataSize, data`; on TCP they are preceded by a
//! big-endian total size so responses can be delimited on a byte stream,
//! while UDP datagram boundaries make the prefix unnecessary.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result, PAYLOAD_HEADER_SIZE, RESPONSE_HEADER_SIZE};

/// A decoded server response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub response: u8,
    pub command: u8,
    pub data: Bytes,
}

impl ResponseFrame {
    /// Decode a response body, i.e. everything after the TCP total-size
    /// prefix, or an entire UDP datagram.
    pub fn decode(mut body: Bytes) -> Result<Self> {
        if body.remaining() < RESPONSE_HEADER_SIZE + 4 {
            return Err(Error::Incomplete);
        }
        let response = body.get_u8();
        let command = body.get_u8();
        let data_size = body.get_u32() as usize;
        if body.remaining() < data_size {
            return Err(Error::Incomplete);
        }
        let data = body.slice(0..data_size);
        Ok(Self {
            response,
            command,
            data,
        })
    }
}

/// Encode a response frame. `include_size_prefix` selects the TCP layout;
/// UDP datagrams omit the leading total size.
pub fn encode_response(
    response: u8,
    command: u8,
    data: &[u8],
    include_size_prefix: bool,
) -> Bytes {
    let total = RESPONSE_HEADER_SIZE + 4 + data.len();
    let mut buf = BytesMut::with_capacity(total + PAYLOAD_HEADER_SIZE);
    if include_size_prefix {
        buf.put_u32(total as u32);
    }
    buf.put_u8(response);
    buf.put_u8(command);
    buf.put_u32(data.len() as u32);
    buf.extend_from_slice(data);
    buf.freeze()
}

/// Encode a client command frame: payload-size prefix, command code, payload.
pub fn encode_command(command: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PAYLOAD_HEADER_SIZE + 1 + payload.len());
    buf.put_u32((1 + payload.len()) as u32);
    buf.put_u8(command);
    buf.extend_from_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{server_command, server_response};

    #[test]
    fn tcp_response_round_trip() {
        let frame = encode_response(
            server_response::SUCCEEDED,
            server_command::SUBSCRIBE,
            b"client subscribed",
            true,
        );
        let total = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
        assert_eq!(total, frame.len() - PAYLOAD_HEADER_SIZE);

        let decoded = ResponseFrame::decode(frame.slice(PAYLOAD_HEADER_SIZE..)).expect("decode");
        assert_eq!(decoded.response, server_response::SUCCEEDED);
        assert_eq!(decoded.command, server_command::SUBSCRIBE);
        assert_eq!(decoded.data.as_ref(), b"client subscribed");
    }

    #[test]
    fn udp_response_has_no_prefix() {
        let frame = encode_response(
            server_response::DATA_PACKET,
            server_command::SUBSCRIBE,
            &[0x02, 0, 0, 0, 1],
            false,
        );
        let decoded = ResponseFrame::decode(frame).expect("decode");
        assert_eq!(decoded.response, server_response::DATA_PACKET);
        assert_eq!(decoded.data.len(), 5);
    }

    #[test]
    fn empty_data_round_trip() {
        let frame = encode_response(server_response::NO_OP, server_command::SUBSCRIBE, &[], false);
        assert_eq!(frame.len(), RESPONSE_HEADER_SIZE + 4);
        let decoded = ResponseFrame::decode(frame).expect("decode");
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn command_frame_prefix_counts_command_byte() {
        let frame = encode_command(server_command::DEFINE_OPERATIONAL_MODES, &2u32.to_be_bytes());
        assert_eq!(u32::from_be_bytes(frame[0..4].try_into().unwrap()), 5);
        assert_eq!(frame[4], server_command::DEFINE_OPERATIONAL_MODES);
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let mut body = BytesMut::new();
        body.put_u8(server_response::SUCCEEDED);
        body.put_u8(server_command::SUBSCRIBE);
        body.put_u32(10);
        body.extend_from_slice(b"short");
        assert!(matches!(
            ResponseFrame::decode(body.freeze()),
            Err(Error::Incomplete)
        ));
    }
}
