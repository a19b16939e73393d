//! Ethernet frames and 802.1Q/802.1AD tag manipulation.
//!
//! Frames are values: every tag operation consumes a frame and returns a new
//! one, so a frame is never rewritten in place while another path still
//! looks at it. Tags are carried in-band (in the byte buffer); the optional
//! `FrameMeta::vlan` only records a tag that was stripped on delivery, the
//! way an offloaded tag travels next to the payload on a real NIC.

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol};

pub const ETH_ALEN: usize = 6;
pub const ETH_HLEN: usize = 14;
pub const VLAN_HLEN: usize = 4;

pub const ETH_P_8021Q: u16 = 0x8100;
pub const ETH_P_8021AD: u16 = 0x88a8;

pub const VLAN_VID_MASK: u16 = 0x0fff;
pub const VLAN_PRIO_MASK: u16 = 0xe000;
pub const VLAN_PRIO_SHIFT: u16 = 13;

/// Reserved VIDs that mark a tag as out-of-band rather than addressing.
pub const VID_EXCEPTION_LOW: u16 = 0;
pub const VID_EXCEPTION_HIGH: u16 = 0x0fff;

/// Offset of the first ether-type field (right after both MAC addresses).
const TYPE_OFFSET: usize = 2 * ETH_ALEN;

/// True for both single (802.1Q) and service (802.1AD) tag protocol ids.
#[inline]
pub fn eth_type_vlan(proto: u16) -> bool {
    proto == ETH_P_8021Q || proto == ETH_P_8021AD
}

/// True if the VID is one of the reserved exception values.
#[inline]
pub fn vid_is_exception(vid: u16) -> bool {
    let vid = vid & VLAN_VID_MASK;
    vid == VID_EXCEPTION_LOW || vid == VID_EXCEPTION_HIGH
}

/// A VLAN tag: tag protocol id plus tag control information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VlanTag {
    pub tpid: u16,
    pub tci: u16,
}

impl VlanTag {
    pub fn new(tpid: u16, vid: u16) -> Self {
        VlanTag {
            tpid,
            tci: vid & VLAN_VID_MASK,
        }
    }

    #[inline]
    pub fn vid(&self) -> u16 {
        self.tci & VLAN_VID_MASK
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        (self.tci >> VLAN_PRIO_SHIFT) as u8
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        vid_is_exception(self.tci)
    }
}

/// Metadata travelling with a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameMeta {
    /// Declared protocol: the ether-type after the outermost header.
    pub protocol: u16,
    /// 802.1p priority recovered from the outer tag.
    pub priority: u8,
    /// A tag removed from the byte stream but kept for the receiver.
    pub vlan: Option<VlanTag>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
    meta: FrameMeta,
}

impl Frame {
    /// Wrap raw wire bytes, deriving the declared protocol from the header.
    pub fn new(bytes: Vec<u8>) -> Self {
        let protocol = read_u16(&bytes, TYPE_OFFSET).unwrap_or(0);
        Frame {
            bytes,
            meta: FrameMeta {
                protocol,
                ..FrameMeta::default()
            },
        }
    }

    /// Build an untagged Ethernet frame.
    pub fn ethernet(
        dst: EthernetAddress,
        src: EthernetAddress,
        ethertype: u16,
        payload: &[u8],
    ) -> Self {
        let mut bytes = vec![0u8; ETH_HLEN + payload.len()];
        let mut frame = EthernetFrame::new_unchecked(&mut bytes);
        frame.set_dst_addr(dst);
        frame.set_src_addr(src);
        frame.set_ethertype(EthernetProtocol::from(ethertype));
        frame.payload_mut().copy_from_slice(payload);
        Frame::new(bytes)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn dst(&self) -> Option<EthernetAddress> {
        EthernetFrame::new_checked(&self.bytes[..])
            .ok()
            .map(|f| f.dst_addr())
    }

    pub fn src(&self) -> Option<EthernetAddress> {
        EthernetFrame::new_checked(&self.bytes[..])
            .ok()
            .map(|f| f.src_addr())
    }

    /// The first ether-type field on the wire.
    pub fn ethertype(&self) -> Option<u16> {
        read_u16(&self.bytes, TYPE_OFFSET)
    }

    /// The outermost in-band VLAN tag, if any.
    pub fn outer_tag(&self) -> Option<VlanTag> {
        let tpid = self.ethertype()?;
        if !eth_type_vlan(tpid) {
            return None;
        }
        let tci = read_u16(&self.bytes, TYPE_OFFSET + 2)?;
        // A tag must be followed by an encapsulated ether-type.
        read_u16(&self.bytes, TYPE_OFFSET + VLAN_HLEN)?;
        Some(VlanTag { tpid, tci })
    }

    /// Push a tag in front of the current ether-type.
    ///
    /// Returns `None` if the frame is too short to hold the MAC addresses.
    pub fn push_tag(self, tag: VlanTag) -> Option<Frame> {
        if self.bytes.len() < TYPE_OFFSET {
            return None;
        }
        let mut bytes = Vec::with_capacity(self.bytes.len() + VLAN_HLEN);
        bytes.extend_from_slice(&self.bytes[..TYPE_OFFSET]);
        bytes.extend_from_slice(&tag.tpid.to_be_bytes());
        bytes.extend_from_slice(&tag.tci.to_be_bytes());
        bytes.extend_from_slice(&self.bytes[TYPE_OFFSET..]);
        Some(Frame {
            bytes,
            meta: FrameMeta {
                protocol: tag.tpid,
                ..self.meta
            },
        })
    }

    /// Remove the outermost tag, returning it with the inner frame.
    ///
    /// The inner frame's declared protocol becomes the encapsulated ether-type.
    pub fn pop_tag(self) -> Result<(VlanTag, Frame), Frame> {
        let Some(tag) = self.outer_tag() else {
            return Err(self);
        };
        let mut bytes = self.bytes;
        bytes.drain(TYPE_OFFSET..TYPE_OFFSET + VLAN_HLEN);
        let protocol = read_u16(&bytes, TYPE_OFFSET).unwrap_or(0);
        Ok((
            tag,
            Frame {
                bytes,
                meta: FrameMeta {
                    protocol,
                    ..self.meta
                },
            },
        ))
    }

    pub fn with_priority(mut self, priority: u8) -> Frame {
        self.meta.priority = priority;
        self
    }

    pub fn with_vlan(mut self, vlan: Option<VlanTag>) -> Frame {
        self.meta.vlan = vlan;
        self
    }

    /// Bytes as they should appear on a wire that does not offload tags:
    /// a tag kept in metadata is re-inserted in front of the ether-type.
    pub fn to_wire(&self) -> Vec<u8> {
        match self.meta.vlan {
            Some(tag) if self.bytes.len() >= TYPE_OFFSET => {
                let mut bytes = Vec::with_capacity(self.bytes.len() + VLAN_HLEN);
                bytes.extend_from_slice(&self.bytes[..TYPE_OFFSET]);
                bytes.extend_from_slice(&tag.tpid.to_be_bytes());
                bytes.extend_from_slice(&tag.tci.to_be_bytes());
                bytes.extend_from_slice(&self.bytes[TYPE_OFFSET..]);
                bytes
            }
            _ => self.bytes.clone(),
        }
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let b = bytes.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}
