//! Read-only views for telemetry consumers.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{MuxError, Result};

pub const MAX_STAT_NAMES: usize = 512;
/// Longest statistic name (ETH_GSTRING_LEN - 1).
pub const MAX_STAT_NAME_LEN: usize = 31;

/// Bounded list of named statistics, filled in by the controller.
#[derive(Debug, Default)]
pub struct StatNames {
    names: Mutex<Vec<String>>,
}

impl StatNames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one write.
    ///
    /// An empty write, or one starting with a newline, clears the list.
    /// Otherwise the text up to the first newline, truncated to
    /// `MAX_STAT_NAME_LEN` bytes, is appended.
    pub fn store(&self, text: &str) -> Result<()> {
        let mut names = self.names.lock().unwrap_or_else(|e| e.into_inner());
        if text.is_empty() || text.starts_with('\n') {
            names.clear();
            return Ok(());
        }
        if names.len() >= MAX_STAT_NAMES {
            return Err(MuxError::StatNamesFull);
        }
        let line = text.split('\n').next().unwrap_or_default();
        let mut end = line.len().min(MAX_STAT_NAME_LEN);
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        names.push(line[..end].to_string());
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.names.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.names.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyTelemetry {
    pub xid: u32,
    pub kind: &'static str,
    pub ifname: String,
    pub up: bool,
    pub carrier: bool,
    pub link_stats: BTreeMap<&'static str, u64>,
}

/// Point-in-time snapshot of a mux.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub encap: &'static str,
    pub base_port: u8,
    pub ports: u32,
    pub uplinks: Vec<String>,
    pub counters: BTreeMap<&'static str, u64>,
    pub flags: Vec<&'static str>,
    pub priv_flags: Vec<String>,
    pub stat_names: Vec<String>,
    pub link_stats: BTreeMap<&'static str, u64>,
    pub proxies: Vec<ProxyTelemetry>,
}
