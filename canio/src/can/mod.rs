pub mod bitrate;
pub mod mode;

use std::collections::HashSet;
use std::fmt;

/// Highest identifier representable with 11-bit (standard) addressing.
pub const STANDARD_ID_MAX: u32 = 0x07ff;
/// Highest identifier representable with 29-bit (extended) addressing.
pub const EXTENDED_ID_MAX: u32 = 0x1fff_ffff;
/// Set on the identifier handed to [`Driver::transmit`](crate::driver::Driver::transmit)
/// to force 29-bit addressing. Drivers strip it before touching the wire.
pub const EXTENDED_MARKER: u32 = 1 << 31;

pub const MAX_PAYLOAD: usize = 8;

/// A single classic CAN frame.
///
/// Frames are `Copy` and never change after construction; every consumer gets
/// its own copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame {
    id: u32,
    rtr: bool,
    extended: bool,
    len: u8,
    data: [u8; MAX_PAYLOAD],
}

impl Frame {
    /// Build a data frame. Returns `None` if the payload is longer than 8
    /// bytes or the identifier does not fit into 29 bits.
    pub fn new(id: u32, data: &[u8]) -> Option<Frame> {
        if id > EXTENDED_ID_MAX || data.len() > MAX_PAYLOAD {
            return None;
        }
        let mut buf = [0u8; MAX_PAYLOAD];
        buf[..data.len()].copy_from_slice(data);
        Some(Frame {
            id,
            rtr: false,
            extended: false,
            len: data.len() as u8,
            data: buf,
        })
    }

    /// Build a remote transmission request for `len` bytes.
    pub fn remote(id: u32, len: u8) -> Option<Frame> {
        if id > EXTENDED_ID_MAX || len as usize > MAX_PAYLOAD {
            return None;
        }
        Some(Frame {
            id,
            rtr: true,
            extended: false,
            len,
            data: [0u8; MAX_PAYLOAD],
        })
    }

    /// Force 29-bit addressing, even for identifiers that would fit into 11 bits.
    pub fn extended(mut self) -> Frame {
        self.extended = true;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_rtr(&self) -> bool {
        self.rtr
    }

    pub fn is_extended(&self) -> bool {
        self.extended || self.id > STANDARD_ID_MAX
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The meaningful part of the payload. Empty for remote frames.
    pub fn data(&self) -> &[u8] {
        if self.rtr {
            &[]
        } else {
            &self.data[..self.len as usize]
        }
    }

    /// Payload buffer up to `len`. For remote frames the bytes carry no
    /// meaning, but drivers take the request length from it.
    pub(crate) fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Identifier as handed to the driver's transmit call, including
    /// [`EXTENDED_MARKER`] for frames that need explicit 29-bit addressing.
    pub(crate) fn raw_id(&self) -> u32 {
        if self.extended {
            self.id | EXTENDED_MARKER
        } else {
            self.id
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended() {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        write!(f, " [{}]", self.len)?;
        if self.rtr {
            return write!(f, " remote request");
        }
        for byte in self.data() {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

/// Predicate for a filtered read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameFilter {
    /// Identifier is any of the set.
    Ids(HashSet<u32>),
    /// Identifier and exact payload length.
    IdAndLength { id: u32, len: u8 },
    /// Identifier with the RTR flag set.
    Remote { id: u32 },
}

impl FrameFilter {
    pub fn id(id: u32) -> Self {
        FrameFilter::Ids(HashSet::from([id]))
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        match self {
            FrameFilter::Ids(ids) => ids.contains(&frame.id),
            FrameFilter::IdAndLength { id, len } => frame.id == *id && frame.len == *len,
            FrameFilter::Remote { id } => frame.id == *id && frame.rtr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_oversized_payload_and_id() {
        assert!(Frame::new(0x100, &[0; 9]).is_none());
        assert!(Frame::new(EXTENDED_ID_MAX + 1, &[]).is_none());
        assert!(Frame::remote(0x100, 9).is_none());
        assert!(Frame::new(EXTENDED_ID_MAX, &[0; 8]).is_some());
    }

    #[test]
    fn payload_is_trimmed_to_length() {
        let frame = Frame::new(0x123, &[1, 2, 3]).unwrap();
        assert_eq!(frame.data(), &[1, 2, 3]);
        assert_eq!(frame.len(), 3);
        assert!(!frame.is_extended());
        assert!(Frame::remote(0x123, 4).unwrap().data().is_empty());
    }

    #[test]
    fn extended_addressing() {
        let low = Frame::new(0x10, &[]).unwrap();
        assert_eq!(low.raw_id(), 0x10);
        let forced = low.extended();
        assert!(forced.is_extended());
        assert_eq!(forced.raw_id(), 0x10 | EXTENDED_MARKER);

        // Large identifiers are extended by magnitude alone, no marker needed.
        let high = Frame::new(0x1234_5678 & EXTENDED_ID_MAX, &[]).unwrap();
        assert!(high.is_extended());
        assert_eq!(high.raw_id() & EXTENDED_MARKER, 0);
    }

    #[test]
    fn filters() {
        let data = Frame::new(0x100, &[0xaa, 0xbb]).unwrap();
        let rtr = Frame::remote(0x100, 2).unwrap();

        assert!(FrameFilter::id(0x100).matches(&data));
        assert!(!FrameFilter::id(0x101).matches(&data));
        assert!(FrameFilter::Ids(HashSet::from([0x1, 0x100])).matches(&data));

        assert!(FrameFilter::IdAndLength { id: 0x100, len: 2 }.matches(&data));
        assert!(!FrameFilter::IdAndLength { id: 0x100, len: 3 }.matches(&data));

        assert!(FrameFilter::Remote { id: 0x100 }.matches(&rtr));
        assert!(!FrameFilter::Remote { id: 0x100 }.matches(&data));
    }

    #[test]
    fn display() {
        let frame = Frame::new(0x1a, &[0x01, 0xff]).unwrap();
        assert_eq!(frame.to_string(), "01A [2] 01 FF");
        let frame = Frame::remote(0x1a, 1).unwrap().extended();
        assert_eq!(frame.to_string(), "0000001A [1] remote request");
    }
}
