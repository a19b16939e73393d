//! Mux configuration: a JSON file whose fields the daemon's command line
//! can override.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MuxError, Result};
use crate::uplink::UPLINK_SLOTS;

pub const DEFAULT_COMPATIBLE: &str = "xeth,mux";
pub const DEFAULT_BASE_PORT: u8 = 1;
pub const DEFAULT_PORTS: u32 = 32;

/// Longest interface name (IFNAMSIZ - 1).
pub const MAX_IFNAME: usize = 15;
pub const MAX_PRIV_FLAGS: usize = 32;

/// Private flag names of platforms that do not list their own.
const PLATINA_MK1: &str = "platina,mk1";
const PLATINA_MK1_FLAGS: [&str; 3] = ["copper", "fec74", "fec91"];

/// Encapsulation of proxy identifiers on the uplinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encap {
    #[default]
    Vlan,
    /// Not implemented; frames are counted as dropped.
    Vpls,
}

impl Encap {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encap::Vlan => "vlan",
            Encap::Vpls => "vpls",
        }
    }
}

impl TryFrom<u8> for Encap {
    type Error = MuxError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Encap::Vlan),
            1 => Ok(Encap::Vpls),
            _ => Err(MuxError::InvalidEncap(v)),
        }
    }
}

impl std::str::FromStr for Encap {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vlan" => Ok(Encap::Vlan),
            "vpls" => Ok(Encap::Vpls),
            _ => match s.parse::<u8>() {
                Ok(v) => Encap::try_from(v),
                Err(_) => Err(MuxError::UnknownEncap(s.to_string())),
            },
        }
    }
}

/// Mux configuration, normally read from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    pub name: Option<String>,
    pub compatible: Option<String>,
    pub encap: Encap,
    pub base_port: Option<u8>,
    pub ports: Option<u32>,
    /// Each entry lists alternative interface names separated by commas.
    pub uplinks: Vec<String>,
    pub flags: Option<Vec<String>>,
    pub stats: Vec<String>,
}

impl MuxConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| MuxError::ConfigRead(path.display().to_string(), e))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn compatible(&self) -> &str {
        self.compatible.as_deref().unwrap_or(DEFAULT_COMPATIBLE)
    }

    /// Interface name; defaults to the compatible string with `,` replaced by `-`.
    pub fn name(&self) -> String {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => self.compatible().replace(',', "-"),
        };
        truncate_ifname(&name)
    }

    /// Only the low bit is significant.
    pub fn base_port(&self) -> u8 {
        self.base_port.unwrap_or(DEFAULT_BASE_PORT) & 1
    }

    pub fn ports(&self) -> u32 {
        self.ports.unwrap_or(DEFAULT_PORTS)
    }

    /// Uplink alternatives, at most one entry per slot.
    pub fn uplink_akas(&self) -> Vec<Vec<String>> {
        self.uplinks
            .iter()
            .take(UPLINK_SLOTS)
            .map(|aka| {
                aka.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .collect()
    }

    pub fn priv_flag_names(&self) -> Vec<String> {
        let names = match &self.flags {
            Some(flags) => flags.clone(),
            None if self.compatible() == PLATINA_MK1 => {
                PLATINA_MK1_FLAGS.iter().map(|s| s.to_string()).collect()
            }
            None => Vec::new(),
        };
        names.into_iter().take(MAX_PRIV_FLAGS).collect()
    }
}

fn truncate_ifname(name: &str) -> String {
    let mut end = name.len().min(MAX_IFNAME);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
