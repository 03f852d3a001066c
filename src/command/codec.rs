//! C3 — Text-Command Codec.
//!
//! Commands share the AVL framing envelope (preamble, length, trailing CRC)
//! but carry codec identifier `0x0C` and a small request/response header
//! instead of telemetry records.

use crate::crc::crc16_ibm;
use crate::error::{IngestError, Result};
use crate::frame::Frame;

const CODEC_COMMAND: u8 = 0x0C;
const TYPE_REQUEST: u8 = 0x05;
const TYPE_RESPONSE: u8 = 0x06;
const DEFAULT_COMMAND: &str = "getver";

/// Builds a fully framed codec `0x0C` request carrying `command_text`.
///
/// Empty text is replaced by the default `getver` command. The returned
/// buffer is ready to write to the socket as-is.
pub fn build(command_text: &str) -> Vec<u8> {
    let cmd = if command_text.is_empty() {
        DEFAULT_COMMAND
    } else {
        command_text
    };
    let cmd_bytes = cmd.as_bytes();

    let mut payload = Vec::with_capacity(7 + cmd_bytes.len() + 1);
    payload.push(CODEC_COMMAND);
    payload.push(0x01); // Qty1
    payload.push(TYPE_REQUEST);
    payload.extend_from_slice(&(cmd_bytes.len() as u32).to_be_bytes());
    payload.extend_from_slice(cmd_bytes);
    payload.push(0x01); // Qty2

    let crc = crc16_ibm(&payload);

    let mut out = Vec::with_capacity(8 + payload.len() + 4);
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&[0, 0, (crc >> 8) as u8, (crc & 0xFF) as u8]);
    out
}

/// Parses a codec `0x0C` response frame and returns its ASCII text.
///
/// Validates the codec byte, the response type byte, that the declared
/// response length plus the trailing quantity byte fit inside the payload,
/// that the trailing quantity byte is `1`, and that the payload's CRC
/// matches the frame's trailing field.
pub fn parse(frame: &Frame) -> Result<String> {
    parse_typed(frame, TYPE_RESPONSE)
}

/// Shared body of `parse`, parameterized on which type byte (request or
/// response) the frame is expected to carry. `build` always emits
/// `TYPE_REQUEST` and `parse` always expects `TYPE_RESPONSE` because the two
/// sides of this codec run in opposite directions on the wire (the server
/// builds requests, the device builds responses); this is what lets
/// `build`'s own output be parsed back in a test without a second public
/// entry point for a frame shape nothing in this server ever receives.
fn parse_typed(frame: &Frame, expected_type: u8) -> Result<String> {
    let trailing_crc = u16::from_be_bytes([frame.trailing[2], frame.trailing[3]]);
    if crc16_ibm(&frame.payload) != trailing_crc {
        return Err(IngestError::IntegrityFailed);
    }

    let payload = &frame.payload;
    if payload.len() < 7 || payload[0] != CODEC_COMMAND {
        return Err(IngestError::NotCommandResponse);
    }
    if payload[2] != expected_type {
        return Err(IngestError::NotCommandResponse);
    }

    let resp_len = u32::from_be_bytes(payload[3..7].try_into().unwrap()) as usize;
    let qty2_pos = 7 + resp_len;
    if qty2_pos >= payload.len() {
        return Err(IngestError::MalformedFrame(format!(
            "response length {resp_len} doesn't fit in {}-byte payload",
            payload.len()
        )));
    }
    if payload[qty2_pos] != 0x01 {
        return Err(IngestError::MalformedFrame("bad trailing quantity byte".into()));
    }

    String::from_utf8(payload[7..qty2_pos].to_vec())
        .map_err(|_| IngestError::MalformedFrame("response text is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_from_payload(payload: Vec<u8>) -> Frame {
        let crc = crc16_ibm(&payload);
        let trailing = [0, 0, (crc >> 8) as u8, (crc & 0xFF) as u8];
        Frame { payload, trailing }
    }

    #[test]
    fn build_frames_a_request() {
        let out = build("getver");
        assert_eq!(&out[0..4], &[0, 0, 0, 0]);
        let data_len = u32::from_be_bytes(out[4..8].try_into().unwrap()) as usize;
        assert_eq!(out.len(), 8 + data_len + 4);
        let payload = &out[8..8 + data_len];
        assert_eq!(payload[0], CODEC_COMMAND);
        assert_eq!(payload[1], 0x01);
        assert_eq!(payload[2], TYPE_REQUEST);
        assert_eq!(&payload[7..7 + 6], b"getver");
        assert_eq!(payload[payload.len() - 1], 0x01);
    }

    #[test]
    fn build_substitutes_default_for_empty_text() {
        let out = build("");
        let data_len = u32::from_be_bytes(out[4..8].try_into().unwrap()) as usize;
        let payload = &out[8..8 + data_len];
        assert_eq!(&payload[7..7 + 6], b"getver");
    }

    #[test]
    fn round_trips_build_then_parse() {
        // parse() only understands response frames (type 0x06); build a
        // response-shaped frame carrying the same text build() would send.
        let cmd = "Ver:03.25.14 Rev:01 Hw:FMC125 IMEI:356307042441013";
        let cmd_bytes = cmd.as_bytes();
        let mut payload = vec![CODEC_COMMAND, 0x01, TYPE_RESPONSE];
        payload.extend_from_slice(&(cmd_bytes.len() as u32).to_be_bytes());
        payload.extend_from_slice(cmd_bytes);
        payload.push(0x01);
        let frame = frame_from_payload(payload);
        assert_eq!(parse(&frame).unwrap(), cmd);
    }

    #[test]
    fn build_output_round_trips_through_the_shared_parser() {
        // build() always emits TYPE_REQUEST; parse() always expects
        // TYPE_RESPONSE, since the two run in opposite directions on the
        // real wire. parse_typed is what both share, so exercising it with
        // TYPE_REQUEST is a genuine parse(build(t)) == t round trip rather
        // than two independently-constructed frames that merely happen to
        // agree on layout.
        for text in ["getver", "getimeiccid", "getparam 219,220,221", "x"] {
            let out = build(text);
            let data_len = u32::from_be_bytes(out[4..8].try_into().unwrap()) as usize;
            let payload = out[8..8 + data_len].to_vec();
            let trailing = [out[out.len() - 4], out[out.len() - 3], out[out.len() - 2], out[out.len() - 1]];
            let frame = Frame { payload, trailing };
            assert_eq!(parse_typed(&frame, TYPE_REQUEST).unwrap(), text);
        }
    }

    #[test]
    fn rejects_wrong_codec_byte() {
        let payload = vec![0x08, 0x01, TYPE_RESPONSE, 0, 0, 0, 0, 0x01];
        let frame = frame_from_payload(payload);
        assert!(matches!(parse(&frame), Err(IngestError::NotCommandResponse)));
    }

    #[test]
    fn rejects_request_type_byte() {
        let payload = vec![CODEC_COMMAND, 0x01, TYPE_REQUEST, 0, 0, 0, 0, 0x01];
        let frame = frame_from_payload(payload);
        assert!(matches!(parse(&frame), Err(IngestError::NotCommandResponse)));
    }

    #[test]
    fn rejects_length_overrun() {
        let payload = vec![CODEC_COMMAND, 0x01, TYPE_RESPONSE, 0, 0, 0, 99, 0x01];
        let frame = frame_from_payload(payload);
        assert!(matches!(
            parse(&frame),
            Err(IngestError::MalformedFrame(_))
        ));
    }

    #[test]
    fn rejects_bad_trailing_quantity() {
        let mut payload = vec![CODEC_COMMAND, 0x01, TYPE_RESPONSE, 0, 0, 0, 2];
        payload.extend_from_slice(b"ok");
        payload.push(0x02); // should be 0x01
        let frame = frame_from_payload(payload);
        assert!(matches!(
            parse(&frame),
            Err(IngestError::MalformedFrame(_))
        ));
    }

    #[test]
    fn rejects_crc_mismatch() {
        let mut payload = vec![CODEC_COMMAND, 0x01, TYPE_RESPONSE, 0, 0, 0, 2];
        payload.extend_from_slice(b"ok");
        payload.push(0x01);
        let mut frame = frame_from_payload(payload);
        frame.trailing[3] ^= 0xFF;
        assert!(matches!(parse(&frame), Err(IngestError::IntegrityFailed)));
    }
}
