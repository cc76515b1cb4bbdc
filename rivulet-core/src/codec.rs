//! Framing of what travels over the transport. A record frame is the [RecordId] header followed by
//! the opaque payload; an ack frame is the header alone.
//!
//! ```text
//! +------+--------------+----------+----------+-----------------+
//! | kind | producer len | producer | sequence | payload (rest)  |
//! |  u8  |   u16 (BE)   |  utf-8   | u64 (BE) | only for records|
//! +------+--------------+----------+----------+-----------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::Result;
use crate::ack::AckEvent;
use crate::error::Error;
use crate::message::{Record, RecordId, Value};

const RECORD_FRAME: u8 = 1;
const ACK_FRAME: u8 = 2;

/// Encodes a record into a frame ready for `send_bytes`.
pub fn encode_record(record: &Record) -> Result<Bytes> {
    let payload = serde_json::to_vec(record.fields()).map_err(|e| Error::Codec(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(header_len(record.id()) + payload.len());
    buf.put_u8(RECORD_FRAME);
    put_id(&mut buf, record.id())?;
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decodes a record frame produced by [encode_record].
pub fn decode_record(mut frame: Bytes) -> Result<Record> {
    expect_kind(&mut frame, RECORD_FRAME)?;
    let id = get_id(&mut frame)?;
    let fields: Vec<Value> =
        serde_json::from_slice(&frame).map_err(|e| Error::Codec(e.to_string()))?;
    Record::new(id, fields).map_err(|e| Error::Codec(e.to_string()))
}

/// Encodes an acknowledgement.
pub fn encode_ack(ack: &AckEvent) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(header_len(&ack.id));
    buf.put_u8(ACK_FRAME);
    put_id(&mut buf, &ack.id)?;
    Ok(buf.freeze())
}

/// Decodes an acknowledgement produced by [encode_ack].
pub fn decode_ack(mut frame: Bytes) -> Result<AckEvent> {
    expect_kind(&mut frame, ACK_FRAME)?;
    let id = get_id(&mut frame)?;
    if frame.has_remaining() {
        return Err(Error::Codec(format!(
            "ack frame has {} trailing bytes",
            frame.remaining()
        )));
    }
    Ok(AckEvent { id })
}

fn header_len(id: &RecordId) -> usize {
    1 + 2 + id.producer().len() + 8
}

fn put_id(buf: &mut BytesMut, id: &RecordId) -> Result<()> {
    let producer = id.producer().as_bytes();
    let len = u16::try_from(producer.len())
        .map_err(|_| Error::Codec(format!("producer name too long: {} bytes", producer.len())))?;
    buf.put_u16(len);
    buf.put_slice(producer);
    buf.put_u64(id.sequence());
    Ok(())
}

fn get_id(frame: &mut Bytes) -> Result<RecordId> {
    if frame.remaining() < 2 {
        return Err(Error::Codec("frame too short for producer length".to_string()));
    }
    let len = frame.get_u16() as usize;
    if frame.remaining() < len + 8 {
        return Err(Error::Codec("frame too short for record id".to_string()));
    }
    let producer = frame.split_to(len);
    let producer = std::str::from_utf8(&producer)
        .map_err(|e| Error::Codec(format!("producer is not utf-8: {e}")))?;
    let sequence = frame.get_u64();
    Ok(RecordId::new(producer, sequence))
}

fn expect_kind(frame: &mut Bytes, kind: u8) -> Result<()> {
    if !frame.has_remaining() {
        return Err(Error::Codec("empty frame".to_string()));
    }
    let found = frame.get_u8();
    if found != kind {
        return Err(Error::Codec(format!(
            "unexpected frame kind {found}, expected {kind}"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn record() -> Record {
        Record::new(
            RecordId::new("words-0", 42),
            vec![
                Value::from("hello"),
                Value::from(3i64),
                Value::Null,
                Value::from(vec![1u8, 2, 3]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_record_frame_keeps_id_and_fields() {
        let original = record();
        let frame = encode_record(&original).unwrap();
        let decoded = decode_record(frame).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_non_finite_floats_survive_the_frame() {
        let original = Record::new(
            RecordId::new("sensor-0", 1),
            vec![
                Value::from(f64::NAN),
                Value::from(f64::INFINITY),
                Value::from(f64::NEG_INFINITY),
                Value::from(-0.25),
            ],
        )
        .unwrap();
        let decoded = decode_record(encode_record(&original).unwrap()).unwrap();

        let floats: Vec<f64> = decoded
            .fields()
            .iter()
            .map(|v| match v {
                Value::Float(f) => *f,
                other => panic!("expected a float, got {other:?}"),
            })
            .collect();
        assert_eq!(floats.len(), 4);
        assert!(floats[0].is_nan());
        assert_eq!(floats[1], f64::INFINITY);
        assert_eq!(floats[2], f64::NEG_INFINITY);
        assert_eq!(floats[3], -0.25);
        assert_eq!(decoded.id(), original.id());
    }

    #[test]
    fn test_unknown_float_text_is_a_codec_error() {
        let mut frame = BytesMut::new();
        frame.put_u8(RECORD_FRAME);
        put_id(&mut frame, &RecordId::new("sensor-0", 1)).unwrap();
        frame.put_slice(br#"[{"type":"float","value":"lots"}]"#);
        assert!(matches!(decode_record(frame.freeze()), Err(Error::Codec(_))));
    }

    #[test]
    fn test_ack_frame_is_header_only() {
        let ack = AckEvent {
            id: RecordId::new("words-0", 42),
        };
        let frame = encode_ack(&ack).unwrap();
        assert_eq!(frame.len(), 1 + 2 + "words-0".len() + 8);
        assert_eq!(decode_ack(frame).unwrap(), ack);
    }

    #[test]
    fn test_frame_kinds_are_not_interchangeable() {
        let record_frame = encode_record(&record()).unwrap();
        assert!(matches!(decode_ack(record_frame), Err(Error::Codec(_))));

        let ack_frame = encode_ack(&AckEvent {
            id: RecordId::new("x", 1),
        })
        .unwrap();
        assert!(matches!(decode_record(ack_frame), Err(Error::Codec(_))));
    }

    #[test]
    fn test_truncated_frames_are_rejected() {
        let frame = encode_record(&record()).unwrap();
        for len in [0, 1, 2, 5, 12] {
            assert!(decode_record(frame.slice(..len)).is_err(), "len {len}");
        }
    }
}
