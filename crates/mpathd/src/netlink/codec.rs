//! Netlink wire codec.
//!
//! Everything the daemon exchanges with the kernel is a run of
//! 4-byte-aligned frames: a 16-byte `nlmsghdr`, an optional subsystem
//! header, then type/length attributes. The daemon always knows a
//! request's type, flags and sequence number before emission, so there
//! is no mutate-in-place message object here: [`message`] assembles a
//! complete frame around an already-encoded payload in one pass, and
//! the reading side is a pair of borrowing cursors ([`FrameReader`],
//! [`Attrs`]) plus checked value readers ([`take`]).

use crate::error::{Error, Result};

/// Byte length of `struct nlmsghdr`.
pub const HDR_LEN: usize = 16;

/// Byte length of an attribute header (`struct nlattr`).
pub const ATTR_HDR_LEN: usize = 4;

/// Round `len` up to the 4-byte netlink alignment.
#[inline]
pub const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// An `NLMSG_ERROR` frame: kernel error report, or ack when the
/// carried status is zero.
pub const NLMSG_ERROR: u16 = 2;
/// An `NLMSG_DONE` frame: end of a dump.
pub const NLMSG_DONE: u16 = 3;

/// rtnetlink message types consumed by the daemon.
pub mod rtm {
    pub const NEWLINK: u16 = 16;
    pub const DELLINK: u16 = 17;
    pub const GETLINK: u16 = 18;
    pub const NEWADDR: u16 = 20;
    pub const DELADDR: u16 = 21;
    pub const GETADDR: u16 = 22;
    pub const NEWROUTE: u16 = 24;
    pub const GETROUTE: u16 = 26;
}

/// This message is a request.
pub const NLM_F_REQUEST: u16 = 0x01;
/// The kernel must answer with an explicit ack.
pub const NLM_F_ACK: u16 = 0x04;
/// Dump everything matching the request (`NLM_F_ROOT | NLM_F_MATCH`).
pub const NLM_F_DUMP: u16 = 0x300;

/// Marks an attribute whose payload is itself an attribute run.
pub const ATTR_NESTED: u16 = 1 << 15;

/// High bits of the attribute type field that are flags, not type.
const ATTR_TYPE_MASK: u16 = 0x3fff;

/// Assemble a complete netlink message around `payload`.
///
/// The payload must already be aligned, which attribute buffers and
/// the fixed kernel header mirrors always are.
pub fn message(msg_type: u16, flags: u16, seq: u32, port: u32, payload: &[u8]) -> Vec<u8> {
    let total = HDR_LEN + payload.len();
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as u32).to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&port.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// One message carved out of a receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Control type, rtnetlink type, or a generic netlink family id.
    pub msg_type: u16,
    /// Sequence of the request this frame answers; 0 for multicast.
    pub seq: u32,
    /// Everything after the netlink header.
    pub payload: &'a [u8],
}

impl Frame<'_> {
    /// The status an `NLMSG_ERROR` frame carries: `Ok` for an ack,
    /// the kernel's errno otherwise.
    pub fn ack_status(&self) -> Result<()> {
        let status: [u8; 4] = self
            .payload
            .get(..4)
            .and_then(|raw| raw.try_into().ok())
            .ok_or_else(|| Error::InvalidMessage("NLMSG_ERROR frame carries no status".into()))?;
        match i32::from_ne_bytes(status) {
            0 => Ok(()),
            errno => Err(Error::from_errno(errno)),
        }
    }
}

/// Borrowing cursor over the frames in a receive buffer.
///
/// A malformed length ends the walk with an error: nothing after an
/// untrustworthy header boundary can be framed.
pub struct FrameReader<'a> {
    rest: &'a [u8],
}

impl<'a> FrameReader<'a> {
    /// Walk the frames in `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { rest: buf }
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = Result<Frame<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.rest;
        if cur.len() < HDR_LEN {
            return None;
        }

        let total = u32::from_ne_bytes([cur[0], cur[1], cur[2], cur[3]]) as usize;
        let msg_type = u16::from_ne_bytes([cur[4], cur[5]]);
        let seq = u32::from_ne_bytes([cur[8], cur[9], cur[10], cur[11]]);

        if total < HDR_LEN || total > cur.len() {
            self.rest = &[];
            return Some(Err(Error::InvalidMessage(format!(
                "frame claims {total} bytes"
            ))));
        }

        self.rest = cur.get(align4(total)..).unwrap_or_default();
        Some(Ok(Frame {
            msg_type,
            seq,
            payload: &cur[HDR_LEN..total],
        }))
    }
}

/// Borrowing cursor over the attributes in a payload.
///
/// A truncated trailing attribute ends the walk; attributes before it
/// remain usable. Flag bits are cleared from the yielded type.
pub struct Attrs<'a> {
    rest: &'a [u8],
}

impl<'a> Attrs<'a> {
    /// Walk the attributes in `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }
}

impl<'a> Iterator for Attrs<'a> {
    /// Attribute type and payload.
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.rest;
        if cur.len() < ATTR_HDR_LEN {
            return None;
        }

        let total = u16::from_ne_bytes([cur[0], cur[1]]) as usize;
        let ty = u16::from_ne_bytes([cur[2], cur[3]]) & ATTR_TYPE_MASK;

        let body = cur.get(ATTR_HDR_LEN..total)?;
        self.rest = cur.get(align4(total)..).unwrap_or_default();
        Some((ty, body))
    }
}

/// Append-only attribute buffer.
///
/// Command dialects encode their attributes into one of these; the
/// transport wraps the finished buffer in headers at send time.
#[derive(Debug, Clone, Default)]
pub struct AttrWriter {
    buf: Vec<u8>,
}

impl AttrWriter {
    /// Start an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// The encoded, aligned attribute bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn pad(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    /// Append one attribute.
    pub fn put(&mut self, ty: u16, body: &[u8]) {
        let total = (ATTR_HDR_LEN + body.len()) as u16;
        self.buf.extend_from_slice(&total.to_ne_bytes());
        self.buf.extend_from_slice(&ty.to_ne_bytes());
        self.buf.extend_from_slice(body);
        self.pad();
    }

    /// Append a u8 attribute.
    pub fn put_u8(&mut self, ty: u16, value: u8) {
        self.put(ty, &[value]);
    }

    /// Append a u16 attribute (host order).
    pub fn put_u16(&mut self, ty: u16, value: u16) {
        self.put(ty, &value.to_ne_bytes());
    }

    /// Append a u16 attribute (network order).
    pub fn put_u16_be(&mut self, ty: u16, value: u16) {
        self.put(ty, &value.to_be_bytes());
    }

    /// Append a u32 attribute (host order).
    pub fn put_u32(&mut self, ty: u16, value: u32) {
        self.put(ty, &value.to_ne_bytes());
    }

    /// Append an i32 attribute (host order).
    pub fn put_i32(&mut self, ty: u16, value: i32) {
        self.put(ty, &value.to_ne_bytes());
    }

    /// Append a NUL-terminated string attribute.
    pub fn put_cstr(&mut self, ty: u16, value: &str) {
        let total = (ATTR_HDR_LEN + value.len() + 1) as u16;
        self.buf.extend_from_slice(&total.to_ne_bytes());
        self.buf.extend_from_slice(&ty.to_ne_bytes());
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        self.pad();
    }

    /// Open a nested attribute run; close it with
    /// [`AttrWriter::nest_end`], passing the returned offset.
    pub fn nest_start(&mut self, ty: u16) -> usize {
        let at = self.buf.len();
        // Zero-length placeholder; the span is known only at close.
        self.put(ty | ATTR_NESTED, &[]);
        at
    }

    /// Close the nested attribute opened at `at`.
    pub fn nest_end(&mut self, at: usize) {
        // Bodies are padded on append, so the buffer end is aligned
        // and the span needs no trailing fix-up.
        let span = (self.buf.len() - at) as u16;
        self.buf[at..at + 2].copy_from_slice(&span.to_ne_bytes());
    }
}

/// Checked readers for attribute payloads.
///
/// Every fixed-width attribute has a declared wire size; these fail
/// rather than truncate or zero-fill when the payload disagrees.
pub mod take {
    use super::*;

    /// Exact-width payload.
    pub fn array<const N: usize>(data: &[u8]) -> Result<[u8; N]> {
        data.try_into().map_err(|_| {
            Error::InvalidAttribute(format!(
                "expected {N} payload bytes, found {}",
                data.len()
            ))
        })
    }

    /// A u8 payload.
    pub fn u8(data: &[u8]) -> Result<u8> {
        Ok(array::<1>(data)?[0])
    }

    /// A u16 payload (host order).
    pub fn u16_ne(data: &[u8]) -> Result<u16> {
        Ok(u16::from_ne_bytes(array(data)?))
    }

    /// A u16 payload (network order).
    pub fn u16_be(data: &[u8]) -> Result<u16> {
        Ok(u16::from_be_bytes(array(data)?))
    }

    /// A u32 payload (host order).
    pub fn u32_ne(data: &[u8]) -> Result<u32> {
        Ok(u32::from_ne_bytes(array(data)?))
    }

    /// An i32 payload (host order).
    pub fn i32_ne(data: &[u8]) -> Result<i32> {
        Ok(i32::from_ne_bytes(array(data)?))
    }

    /// A NUL-terminated string payload.
    pub fn cstr(data: &[u8]) -> Result<&str> {
        let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
        std::str::from_utf8(&data[..end])
            .map_err(|_| Error::InvalidAttribute("string attribute is not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_framing_roundtrip() {
        let mut w = AttrWriter::new();
        w.put_u32(1, 0xdeadbeef);
        let msg = message(0x18, NLM_F_REQUEST | NLM_F_ACK, 42, 77, &w.finish());

        let mut frames = FrameReader::new(&msg);
        let frame = frames.next().unwrap().unwrap();
        assert_eq!(frame.msg_type, 0x18);
        assert_eq!(frame.seq, 42);
        let attrs: Vec<_> = Attrs::new(frame.payload).collect();
        assert_eq!(attrs.len(), 1);
        assert_eq!(take::u32_ne(attrs[0].1).unwrap(), 0xdeadbeef);
        assert!(frames.next().is_none());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut buf = message(1, 0, 5, 0, &[]);
        buf.extend_from_slice(&message(2, 0, 6, 0, &[0xaa, 0xbb, 0xcc, 0xdd]));

        let frames: Vec<_> = FrameReader::new(&buf).map(Result::unwrap).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].msg_type, 1);
        assert!(frames[0].payload.is_empty());
        assert_eq!(frames[1].seq, 6);
        assert_eq!(frames[1].payload, [0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn test_bad_frame_length_stops_the_walk() {
        let mut buf = message(1, 0, 5, 0, &[]);
        // Corrupt the length field to reach past the buffer.
        buf[0..4].copy_from_slice(&0xffu32.to_ne_bytes());
        buf.extend_from_slice(&[0; 8]);

        let mut frames = FrameReader::new(&buf);
        assert!(frames.next().unwrap().is_err());
        assert!(frames.next().is_none());
    }

    #[test]
    fn test_ack_status() {
        let ack = message(NLMSG_ERROR, 0, 1, 0, &0i32.to_ne_bytes());
        let frame = FrameReader::new(&ack).next().unwrap().unwrap();
        assert!(frame.ack_status().is_ok());

        let nack = message(NLMSG_ERROR, 0, 1, 0, &(-libc::ENOENT).to_ne_bytes());
        let frame = FrameReader::new(&nack).next().unwrap().unwrap();
        let err = frame.ack_status().unwrap_err();
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[test]
    fn test_attr_walk_mixed_widths() {
        let mut w = AttrWriter::new();
        w.put_u8(2, 0x07);
        w.put_u16_be(5, 0x1234);
        w.put_cstr(9, "sspi");
        let buf = w.finish();

        let attrs: Vec<_> = Attrs::new(&buf).collect();
        assert_eq!(attrs.len(), 3);
        assert_eq!(take::u8(attrs[0].1).unwrap(), 7);
        assert_eq!(take::u16_be(attrs[1].1).unwrap(), 0x1234);
        assert_eq!(take::cstr(attrs[2].1).unwrap(), "sspi");
    }

    #[test]
    fn test_truncated_attr_ends_walk() {
        let mut w = AttrWriter::new();
        w.put_u8(1, 0xaa);
        let mut buf = w.finish();
        // A header promising more body than the buffer holds.
        buf.extend_from_slice(&64u16.to_ne_bytes());
        buf.extend_from_slice(&2u16.to_ne_bytes());

        let attrs: Vec<_> = Attrs::new(&buf).collect();
        assert_eq!(attrs.len(), 1);
    }

    #[test]
    fn test_nested_attr() {
        let mut w = AttrWriter::new();
        let nest = w.nest_start(1);
        w.put_u8(2, 100);
        w.put_u16(3, 200);
        w.nest_end(nest);
        let buf = w.finish();

        let outer: Vec<_> = Attrs::new(&buf).collect();
        assert_eq!(outer.len(), 1);
        // The nested flag is masked off the yielded type.
        assert_eq!(outer[0].0, 1);

        let inner: Vec<_> = Attrs::new(outer[0].1).collect();
        assert_eq!(inner.len(), 2);
        assert_eq!(take::u8(inner[0].1).unwrap(), 100);
        assert_eq!(take::u16_ne(inner[1].1).unwrap(), 200);
    }

    #[test]
    fn test_take_rejects_wrong_width() {
        assert!(take::u32_ne(&[1, 2]).is_err());
        assert!(take::u16_be(&[1, 2, 3]).is_err());
        assert!(take::u8(&[]).is_err());
        assert!(take::array::<4>(&[9, 9, 9, 9, 9]).is_err());
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align4(5), 8);

        let mut w = AttrWriter::new();
        w.put_u8(1, 0xff);
        // 4-byte header + 1-byte body pads to the next boundary.
        assert_eq!(w.finish().len(), 8);
    }
}
