//! C2 — AVL Decoder.
//!
//! Decodes one frame's payload into an [`AvlPacket`]. Every read is
//! length-checked against the remaining buffer; anything past the end
//! yields [`IngestError::MalformedFrame`], never an out-of-bounds access.

use std::collections::BTreeMap;

use crate::avl::model::{AvlPacket, AvlRecord, Codec, GpsFix, IoValue};
use crate::crc::crc16_ibm;
use crate::error::{IngestError, Result};
use crate::frame::Frame;

/// A bounds-checked forward cursor over a byte slice.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(IngestError::MalformedFrame(format!(
                "need {n} bytes, only {} remaining",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Reads a count/identifier field whose width depends on the codec:
    /// 1 byte for `Codec::Basic`, 2 bytes for `Codec::Extended`.
    fn width_field(&mut self, codec: Codec) -> Result<u16> {
        match codec {
            Codec::Basic => self.u8().map(|v| v as u16),
            Codec::Extended => self.u16(),
        }
    }
}

/// Decodes a frame payload known to carry codec `0x08` or `0x8E`.
pub fn decode_avl_frame(frame: &Frame) -> Result<AvlPacket> {
    let payload = &frame.payload;
    let trailing_crc = u16::from_be_bytes([frame.trailing[2], frame.trailing[3]]);
    if crc16_ibm(payload) != trailing_crc {
        return Err(IngestError::IntegrityFailed);
    }

    let mut cur = Cursor::new(payload);
    let codec_byte = cur.u8()?;
    let codec = Codec::from_byte(codec_byte)
        .ok_or_else(|| IngestError::MalformedFrame(format!("unknown codec byte {codec_byte:#x}")))?;
    let n1 = cur.u8()?;

    let mut records = Vec::with_capacity(n1 as usize);
    for _ in 0..n1 {
        records.push(decode_record(&mut cur, codec)?);
    }

    let n2 = cur.u8()?;
    if n2 != n1 {
        return Err(IngestError::MalformedFrame(format!(
            "record count mismatch: n1={n1} n2={n2}"
        )));
    }

    Ok(AvlPacket { codec, records })
}

fn decode_record(cur: &mut Cursor, codec: Codec) -> Result<AvlRecord> {
    let timestamp_ms = cur.u64()?;
    let priority = cur.u8()?;

    let longitude_e7 = cur.u32()? as i32;
    let latitude_e7 = cur.u32()? as i32;
    let altitude_m = cur.u16()?;
    let heading_deg = cur.u16()?;
    let satellites = cur.u8()?;
    let speed_kmh = cur.u16()?;

    let gps = GpsFix {
        longitude_e7,
        latitude_e7,
        altitude_m,
        heading_deg,
        satellites,
        speed_kmh,
    };

    let event_io_id = cur.width_field(codec)?;
    let io_count_declared = cur.width_field(codec)?;

    let mut io = BTreeMap::new();
    decode_io_group(cur, codec, &mut io, |v| IoValue::U1(v as u8), 1)?;
    decode_io_group(cur, codec, &mut io, |v| IoValue::U2(v as u16), 2)?;
    decode_io_group(cur, codec, &mut io, |v| IoValue::U4(v as u32), 4)?;
    decode_io_group_u64(cur, codec, &mut io)?;
    decode_io_group_x(cur, codec, &mut io)?;

    Ok(AvlRecord {
        timestamp_ms,
        priority,
        gps,
        event_io_id,
        io_count_declared,
        io,
    })
}

/// Decodes one fixed-width group (1/2/4-byte values). `read_value` pulls the
/// group's native width and `make` tags it into an [`IoValue`]; last write
/// wins if an identifier repeats.
fn decode_io_group(
    cur: &mut Cursor,
    codec: Codec,
    io: &mut BTreeMap<u16, IoValue>,
    make: impl Fn(u64) -> IoValue,
    width: usize,
) -> Result<()> {
    let count = cur.width_field(codec)? as usize;
    // Declared counts are capped by remaining bytes so a malformed count
    // cannot force a loop against an empty buffer.
    let id_width = id_width(codec);
    let max_items = cur.remaining() / (id_width + width);
    let count = count.min(max_items);
    for _ in 0..count {
        let id = cur.width_field(codec)?;
        let raw = match width {
            1 => cur.u8()? as u64,
            2 => cur.u16()? as u64,
            4 => cur.u32()? as u64,
            _ => unreachable!(),
        };
        io.insert(id, make(raw));
    }
    Ok(())
}

fn decode_io_group_u64(cur: &mut Cursor, codec: Codec, io: &mut BTreeMap<u16, IoValue>) -> Result<()> {
    let count = cur.width_field(codec)? as usize;
    let id_width = id_width(codec);
    let max_items = cur.remaining() / (id_width + 8);
    let count = count.min(max_items);
    for _ in 0..count {
        let id = cur.width_field(codec)?;
        let val = cur.u64()?;
        io.insert(id, IoValue::U8(val));
    }
    Ok(())
}

fn decode_io_group_x(cur: &mut Cursor, codec: Codec, io: &mut BTreeMap<u16, IoValue>) -> Result<()> {
    let count = cur.width_field(codec)? as usize;
    let id_width = id_width(codec);
    // Minimum footprint per item is id + 2-byte length; this bounds the loop
    // even though each item's actual length is variable.
    let max_items = cur.remaining() / (id_width + 2);
    let count = count.min(max_items);
    for _ in 0..count {
        let id = cur.width_field(codec)?;
        let len = cur.u16()? as usize;
        let val = cur.take(len)?.to_vec();
        io.insert(id, IoValue::X(val));
    }
    Ok(())
}

fn id_width(codec: Codec) -> usize {
    match codec {
        Codec::Basic => 1,
        Codec::Extended => 2,
    }
}
