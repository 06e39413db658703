use bytes::{Buf, BytesMut};
use log::{debug, trace};

use crate::modbus::pdu::MAX_PDU_SIZE;
use crate::utils::error::FrameError;

/// MBAP header length: transaction id (2) + protocol id (2) + length (2) +
/// unit id (1).
pub const MBAP_HEADER_LEN: usize = 7;

/// Modbus protocol identifier. The only legal value.
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Smallest legal MBAP length field: unit id + function code.
const MIN_MBAP_LENGTH: u16 = 2;
/// Largest legal MBAP length field: unit id + maximum PDU.
const MAX_MBAP_LENGTH: u16 = (MAX_PDU_SIZE + 1) as u16;

/// A fully decoded request frame. The function byte is kept raw so the
/// dispatcher can echo unknown codes back in exception responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub function: u8,
    pub payload: Vec<u8>,
}

/// Incremental decoder over a connection's reassembly buffer.
///
/// TCP delivers a byte stream, not message-aligned packets, so `decode` is
/// resumable: it returns `Ok(None)` until a complete frame is buffered and
/// consumes exactly one frame's bytes per `Ok(Some(_))`. Bytes are never
/// lost or consumed twice across arbitrary read boundaries.
#[derive(Debug, Default)]
pub struct FrameDecoder;

impl FrameDecoder {
    pub fn new() -> Self {
        Self
    }

    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<RequestFrame>, FrameError> {
        if buf.len() < MBAP_HEADER_LEN {
            trace!("decoder waiting for header: {} bytes buffered", buf.len());
            return Ok(None);
        }

        // Peek the header without consuming; the PDU may not be complete yet.
        let transaction_id = u16::from_be_bytes([buf[0], buf[1]]);
        let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
        let length = u16::from_be_bytes([buf[4], buf[5]]);
        let unit_id = buf[6];

        if protocol_id != MODBUS_PROTOCOL_ID {
            return Err(FrameError::InvalidProtocolId(protocol_id));
        }
        if !(MIN_MBAP_LENGTH..=MAX_MBAP_LENGTH).contains(&length) {
            return Err(FrameError::InvalidLength(length));
        }

        // length counts unit id + PDU; unit id is part of the 7-byte header.
        let pdu_len = length as usize - 1;
        if buf.len() < MBAP_HEADER_LEN + pdu_len {
            trace!(
                "decoder waiting for PDU: have {}, need {}",
                buf.len(),
                MBAP_HEADER_LEN + pdu_len
            );
            return Ok(None);
        }

        buf.advance(MBAP_HEADER_LEN);
        let pdu = buf.split_to(pdu_len);
        let function = pdu[0];
        let payload = pdu[1..].to_vec();

        debug!(
            "decoded frame: tx={} unit={} fc=0x{:02x} payload={}",
            transaction_id,
            unit_id,
            function,
            hex::encode(&payload)
        );

        Ok(Some(RequestFrame {
            transaction_id,
            unit_id,
            function,
            payload,
        }))
    }
}

/// Encode a response frame: MBAP header followed by the PDU bytes
/// (function code + data). The length field counts unit id + PDU.
pub fn encode_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&MODBUS_PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    const READ_COILS_FRAME: [u8; 12] = [
        0x00, 0x01, // transaction 1
        0x00, 0x00, // protocol 0
        0x00, 0x06, // length 6
        0x01, // unit 1
        0x01, 0x00, 0x00, 0x00, 0x0A, // read 10 coils at 0
    ];

    #[test]
    fn test_decode_whole_frame() {
        let decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&READ_COILS_FRAME[..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.transaction_id, 1);
        assert_eq!(frame.unit_id, 1);
        assert_eq!(frame.function, 0x01);
        assert_eq!(frame.payload, vec![0x00, 0x00, 0x00, 0x0A]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_across_every_split_boundary() {
        let decoder = FrameDecoder::new();
        for split in 1..READ_COILS_FRAME.len() {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(&READ_COILS_FRAME[..split]);
            assert_eq!(decoder.decode(&mut buf).unwrap(), None, "split at {}", split);
            buf.extend_from_slice(&READ_COILS_FRAME[split..]);
            let frame = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.transaction_id, 1);
            assert_eq!(frame.payload, vec![0x00, 0x00, 0x00, 0x0A]);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_decode_two_frames_back_to_back() {
        let decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&READ_COILS_FRAME);
        buf.extend_from_slice(&READ_COILS_FRAME);
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_nonzero_protocol_id_is_fatal() {
        let decoder = FrameDecoder::new();
        let mut bad = READ_COILS_FRAME;
        bad[3] = 0x01;
        let mut buf = BytesMut::from(&bad[..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            FrameError::InvalidProtocolId(1)
        );
    }

    #[test]
    fn test_length_field_out_of_range() {
        let decoder = FrameDecoder::new();
        let mut bad = READ_COILS_FRAME;
        bad[4] = 0x01; // length 0x0106 > 254
        let mut buf = BytesMut::from(&bad[..]);
        assert!(matches!(
            decoder.decode(&mut buf).unwrap_err(),
            FrameError::InvalidLength(_)
        ));

        let mut too_short = READ_COILS_FRAME;
        too_short[5] = 0x01; // length 1: no room for a function code
        let mut buf = BytesMut::from(&too_short[..]);
        assert_eq!(
            decoder.decode(&mut buf).unwrap_err(),
            FrameError::InvalidLength(1)
        );
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let pdu = [0x03, 0x02, 0x12, 0x34];
        let encoded = encode_frame(0xBEEF, 0x11, &pdu);
        assert_eq!(&encoded[4..6], &[0x00, 0x05]); // unit id + 4 PDU bytes

        let decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&encoded[..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.transaction_id, 0xBEEF);
        assert_eq!(frame.unit_id, 0x11);
        assert_eq!(frame.function, 0x03);
        assert_eq!(frame.payload, vec![0x02, 0x12, 0x34]);
    }
}
