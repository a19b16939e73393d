//! Control message wire format.
//!
//! Every message starts with a 16 byte little-endian header:
//!
//! ```text
//! 0        8      12   14      15    16
//! | z64    | z32  |z16 |version| kind |
//! ```
//!
//! The z-fields are always zero; they keep a control message from ever
//! being mistaken for an Ethernet frame by a peer that multiplexes both.

use thiserror::Error;

use crate::counters::LinkStat;
use crate::proxy::{ProxyKind, Xid};

pub const MSG_VERSION: u8 = 3;
pub const HEADER_LEN: usize = 16;
pub const IFNAMSIZ: usize = 16;

/// Largest message the service will receive in one datagram.
pub const RX_BUF_SIZE: usize = 9728;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MsgError {
    #[error("message of {got} bytes is shorter than {need}")]
    Short { need: usize, got: usize },

    #[error("reserved header fields are not zero")]
    NonZeroHeader,

    #[error("unsupported version {0}")]
    Version(u8),

    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    #[error("unknown proxy kind {0}")]
    ProxyKind(u8),

    #[error("unknown link stat index {0}")]
    LinkStat(u32),

    #[error("interface name is not valid: {0}")]
    Ifname(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgKind {
    Break = 1,
    Ifinfo = 2,
    NetnsAdd = 3,
    NetnsDel = 4,
    DumpIfinfo = 5,
    Carrier = 6,
    LinkStat = 7,
    ProxyAdd = 8,
    ProxyDel = 9,
}

impl TryFrom<u8> for MsgKind {
    type Error = MsgError;

    fn try_from(v: u8) -> Result<Self, MsgError> {
        Ok(match v {
            1 => MsgKind::Break,
            2 => MsgKind::Ifinfo,
            3 => MsgKind::NetnsAdd,
            4 => MsgKind::NetnsDel,
            5 => MsgKind::DumpIfinfo,
            6 => MsgKind::Carrier,
            7 => MsgKind::LinkStat,
            8 => MsgKind::ProxyAdd,
            9 => MsgKind::ProxyDel,
            _ => return Err(MsgError::UnknownKind(v)),
        })
    }
}

/// Interface description sent to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ifinfo {
    pub ifname: String,
    pub xid: Xid,
    pub kind: ProxyKind,
    pub up: bool,
    pub carrier: bool,
    /// Identifier of the lower proxy a vlan is stacked on.
    pub link: Option<Xid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    Break,
    Ifinfo(Ifinfo),
    NetnsAdd { net: u64 },
    NetnsDel { net: u64 },
    DumpIfinfo,
    Carrier { xid: Xid, on: bool },
    LinkStat { xid: Xid, stat: LinkStat, count: u64 },
    /// `kind` stays a raw wire value; it is validated when the proxy is created.
    ProxyAdd { ifname: String, xid: Xid, kind: u8, link: Option<Xid> },
    ProxyDel { xid: Xid },
}

impl Msg {
    pub fn kind(&self) -> MsgKind {
        match self {
            Msg::Break => MsgKind::Break,
            Msg::Ifinfo(_) => MsgKind::Ifinfo,
            Msg::NetnsAdd { .. } => MsgKind::NetnsAdd,
            Msg::NetnsDel { .. } => MsgKind::NetnsDel,
            Msg::DumpIfinfo => MsgKind::DumpIfinfo,
            Msg::Carrier { .. } => MsgKind::Carrier,
            Msg::LinkStat { .. } => MsgKind::LinkStat,
            Msg::ProxyAdd { .. } => MsgKind::ProxyAdd,
            Msg::ProxyDel { .. } => MsgKind::ProxyDel,
        }
    }

    fn body_len(kind: MsgKind) -> usize {
        match kind {
            MsgKind::Break | MsgKind::DumpIfinfo => 0,
            MsgKind::Ifinfo => IFNAMSIZ + 4 + 4 + 4 + 4,
            MsgKind::NetnsAdd | MsgKind::NetnsDel => 8,
            MsgKind::Carrier | MsgKind::ProxyDel => 8,
            MsgKind::LinkStat => 16,
            MsgKind::ProxyAdd => IFNAMSIZ + 4 + 4 + 4 + 4,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + Self::body_len(self.kind())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer(Vec::with_capacity(self.encoded_len()));
        w.0.extend_from_slice(&[0u8; 14]);
        w.u8(MSG_VERSION);
        w.u8(self.kind() as u8);

        match self {
            Msg::Break | Msg::DumpIfinfo => {}
            Msg::Ifinfo(info) => {
                w.ifname(&info.ifname);
                w.u32(info.xid.raw());
                w.u8(info.kind.into());
                w.u8(u8::from(info.up));
                w.u8(u8::from(info.carrier));
                w.u8(0);
                w.u32(info.link.map_or(0, Xid::raw));
                w.u32(0);
            }
            Msg::NetnsAdd { net } | Msg::NetnsDel { net } => w.u64(*net),
            Msg::Carrier { xid, on } => {
                w.u32(xid.raw());
                w.u8(u8::from(*on));
                w.0.extend_from_slice(&[0u8; 3]);
            }
            Msg::LinkStat { xid, stat, count } => {
                w.u32(xid.raw());
                w.u32(*stat as u32);
                w.u64(*count);
            }
            Msg::ProxyAdd {
                ifname,
                xid,
                kind,
                link,
            } => {
                w.ifname(ifname);
                w.u32(xid.raw());
                w.u8(*kind);
                w.0.extend_from_slice(&[0u8; 3]);
                w.u32(link.map_or(0, Xid::raw));
                w.u32(0);
            }
            Msg::ProxyDel { xid } => {
                w.u32(xid.raw());
                w.u32(0);
            }
        }
        w.0
    }

    pub fn decode(buf: &[u8]) -> Result<Msg, MsgError> {
        let kind = parse_header(buf)?;
        let need = HEADER_LEN + Self::body_len(kind);
        if buf.len() < need {
            return Err(MsgError::Short {
                need,
                got: buf.len(),
            });
        }
        let mut r = Reader {
            buf,
            pos: HEADER_LEN,
        };

        Ok(match kind {
            MsgKind::Break => Msg::Break,
            MsgKind::DumpIfinfo => Msg::DumpIfinfo,
            MsgKind::Ifinfo => {
                let ifname = r.ifname()?;
                let xid = Xid(r.u32());
                let raw = r.u8();
                let kind = ProxyKind::try_from(raw).map_err(|_| MsgError::ProxyKind(raw))?;
                let up = r.u8() != 0;
                let carrier = r.u8() != 0;
                r.skip(1);
                let link = non_zero_xid(r.u32());
                Msg::Ifinfo(Ifinfo {
                    ifname,
                    xid,
                    kind,
                    up,
                    carrier,
                    link,
                })
            }
            MsgKind::NetnsAdd => Msg::NetnsAdd { net: r.u64() },
            MsgKind::NetnsDel => Msg::NetnsDel { net: r.u64() },
            MsgKind::Carrier => Msg::Carrier {
                xid: Xid(r.u32()),
                on: r.u8() != 0,
            },
            MsgKind::LinkStat => {
                let xid = Xid(r.u32());
                let index = r.u32();
                let stat = LinkStat::from_index(index).ok_or(MsgError::LinkStat(index))?;
                Msg::LinkStat {
                    xid,
                    stat,
                    count: r.u64(),
                }
            }
            MsgKind::ProxyAdd => {
                let ifname = r.ifname()?;
                let xid = Xid(r.u32());
                let kind = r.u8();
                r.skip(3);
                let link = non_zero_xid(r.u32());
                Msg::ProxyAdd {
                    ifname,
                    xid,
                    kind,
                    link,
                }
            }
            MsgKind::ProxyDel => Msg::ProxyDel { xid: Xid(r.u32()) },
        })
    }
}

/// Validate the fixed header and return the message kind.
pub fn parse_header(buf: &[u8]) -> Result<MsgKind, MsgError> {
    if buf.len() < HEADER_LEN {
        return Err(MsgError::Short {
            need: HEADER_LEN,
            got: buf.len(),
        });
    }
    if buf[..14].iter().any(|b| *b != 0) {
        return Err(MsgError::NonZeroHeader);
    }
    if buf[14] != MSG_VERSION {
        return Err(MsgError::Version(buf[14]));
    }
    MsgKind::try_from(buf[15])
}

/// Namespace inode of an outbound namespace-registration message, if `buf` is one.
pub fn netns_add_inum(buf: &[u8]) -> Option<u64> {
    match parse_header(buf) {
        Ok(MsgKind::NetnsAdd) => {
            let b = buf.get(HEADER_LEN..HEADER_LEN + 8)?;
            Some(u64::from_le_bytes(b.try_into().ok()?))
        }
        _ => None,
    }
}

fn non_zero_xid(v: u32) -> Option<Xid> {
    (v != 0).then_some(Xid(v))
}

struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    /// NUL padded, truncated to at most IFNAMSIZ-1 bytes on a char boundary.
    fn ifname(&mut self, name: &str) {
        let mut field = [0u8; IFNAMSIZ];
        let mut n = name.len().min(IFNAMSIZ - 1);
        while !name.is_char_boundary(n) {
            n -= 1;
        }
        field[..n].copy_from_slice(&name.as_bytes()[..n]);
        self.0.extend_from_slice(&field);
    }
}

/// Reads from a buffer whose length has already been checked.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn ifname(&mut self) -> Result<String, MsgError> {
        let field: [u8; IFNAMSIZ] = self.take();
        let end = field.iter().position(|b| *b == 0).unwrap_or(IFNAMSIZ);
        let name = std::str::from_utf8(&field[..end])
            .map_err(|e| MsgError::Ifname(e.to_string()))?;
        if name.is_empty() {
            return Err(MsgError::Ifname("empty".to_string()));
        }
        Ok(name.to_string())
    }
}
