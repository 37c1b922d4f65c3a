//! RESP framing: length-prefixed arrays of bulk strings.
//!
//! The same grammar frames client requests, AOF records, and the
//! replication stream: `*N\r\n` followed by N bulk strings, each
//! `$len\r\n<bytes>\r\n`. A request is decoded incrementally from a
//! connection buffer; AOF records are decoded from byte slices.

use crate::error::{ProtocolError, Result};
use bytes::{Buf, Bytes, BytesMut};

/// Hard cap on arguments per command; guards against hostile frames.
const MAX_ARGS: usize = 1024;

/// Hard cap on a single argument's length (64 MiB).
const MAX_ARG_LEN: usize = 64 * 1024 * 1024;

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    data[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn parse_int(data: &[u8]) -> Result<i64> {
    let s = std::str::from_utf8(data).map_err(|_| ProtocolError::Framing("bad length".into()))?;
    s.parse()
        .map_err(|_| ProtocolError::Framing(format!("bad length '{s}'")))
}

/// Try to decode one complete request frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. On success the frame is
/// consumed from the buffer.
pub fn parse_request(buf: &mut BytesMut) -> Result<Option<Vec<Bytes>>> {
    match decode_array(&buf[..])? {
        Some((args, consumed)) => {
            let args = args
                .into_iter()
                .map(|range| Bytes::copy_from_slice(&buf[range.0..range.1]))
                .collect();
            buf.advance(consumed);
            Ok(Some(args))
        }
        None => Ok(None),
    }
}

/// Decode one frame from a byte slice, returning argument byte vectors and
/// the number of bytes consumed. `Ok(None)` means the slice ends mid-frame.
pub fn decode_record(data: &[u8]) -> Result<Option<(Vec<Vec<u8>>, usize)>> {
    match decode_array(data)? {
        Some((args, consumed)) => Ok(Some((
            args.into_iter()
                .map(|range| data[range.0..range.1].to_vec())
                .collect(),
            consumed,
        ))),
        None => Ok(None),
    }
}

/// Common decoder: yields argument byte ranges into `data` plus the frame
/// length.
fn decode_array(data: &[u8]) -> Result<Option<(Vec<(usize, usize)>, usize)>> {
    if data.is_empty() {
        return Ok(None);
    }
    if data[0] != b'*' {
        return Err(ProtocolError::Framing(format!(
            "expected '*', got '{}'",
            data[0] as char
        )));
    }
    let Some(line_end) = find_crlf(data, 1) else {
        return Ok(None);
    };
    let count = parse_int(&data[1..line_end])?;
    if count < 0 || count as usize > MAX_ARGS {
        return Err(ProtocolError::Framing(format!("bad array length {count}")));
    }
    let mut pos = line_end + 2;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if pos >= data.len() {
            return Ok(None);
        }
        if data[pos] != b'$' {
            return Err(ProtocolError::Framing(format!(
                "expected '$', got '{}'",
                data[pos] as char
            )));
        }
        let Some(line_end) = find_crlf(data, pos + 1) else {
            return Ok(None);
        };
        let len = parse_int(&data[pos + 1..line_end])?;
        if len < 0 || len as usize > MAX_ARG_LEN {
            return Err(ProtocolError::Framing(format!("bad bulk length {len}")));
        }
        let start = line_end + 2;
        let end = start + len as usize;
        if data.len() < end + 2 {
            return Ok(None);
        }
        if &data[end..end + 2] != b"\r\n" {
            return Err(ProtocolError::Framing("missing bulk terminator".into()));
        }
        args.push((start, end));
        pos = end + 2;
    }
    Ok(Some((args, pos)))
}

/// Encode an argument list as a RESP array frame. This is the byte layout
/// of AOF records and the replication stream.
pub fn encode_array<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.as_ref().len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let arg = arg.as_ref();
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let frame = encode_array(&["SET", "fleet", "bus1"]);
        let (args, consumed) = decode_record(&frame).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(args, vec![b"SET".to_vec(), b"fleet".to_vec(), b"bus1".to_vec()]);
    }

    #[test]
    fn incremental_parse_waits_for_full_frame() {
        let frame = encode_array(&["PING"]);
        let mut buf = BytesMut::new();
        for (i, b) in frame.iter().enumerate() {
            buf.extend_from_slice(&[*b]);
            let res = parse_request(&mut buf).unwrap();
            if i + 1 < frame.len() {
                assert!(res.is_none(), "complete at byte {i}");
            } else {
                let args = res.unwrap();
                assert_eq!(args[0].as_ref(), b"PING");
                assert!(buf.is_empty());
            }
        }
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_array(&["PING"]));
        buf.extend_from_slice(&encode_array(&["SERVER"]));
        let a = parse_request(&mut buf).unwrap().unwrap();
        let b = parse_request(&mut buf).unwrap().unwrap();
        assert_eq!(a[0].as_ref(), b"PING");
        assert_eq!(b[0].as_ref(), b"SERVER");
        assert!(parse_request(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_non_array() {
        let mut buf = BytesMut::from(&b"GET fleet\r\n"[..]);
        assert!(parse_request(&mut buf).is_err());
    }

    #[test]
    fn empty_argument_is_preserved() {
        let frame = encode_array(&["SET", ""]);
        let (args, _) = decode_record(&frame).unwrap().unwrap();
        assert_eq!(args[1], b"".to_vec());
    }
}
