//! Atomic counters: mux operational counters, interface link statistics
//! and the mux flag word.
//!
//! Every counter is independently atomic. Readers get eventually consistent,
//! monotonically non-decreasing values (except for the two gauges,
//! `sbtx_queued` and `sbtx_free`).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Mux operational counters, surfaced to telemetry by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MuxCounter {
    SbrxTicks,
    SbrxMsgs,
    SbrxInvalid,
    SbtxMsgs,
    SbtxRetries,
    SbtxQueued,
    SbtxFree,
    SbtxTicks,
    ExFrames,
    ExBytes,
}

impl MuxCounter {
    pub const COUNT: usize = 10;

    pub const ALL: [MuxCounter; Self::COUNT] = [
        MuxCounter::SbrxTicks,
        MuxCounter::SbrxMsgs,
        MuxCounter::SbrxInvalid,
        MuxCounter::SbtxMsgs,
        MuxCounter::SbtxRetries,
        MuxCounter::SbtxQueued,
        MuxCounter::SbtxFree,
        MuxCounter::SbtxTicks,
        MuxCounter::ExFrames,
        MuxCounter::ExBytes,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MuxCounter::SbrxTicks => "sbrx-ticks",
            MuxCounter::SbrxMsgs => "sbrx-msgs",
            MuxCounter::SbrxInvalid => "sbrx-invalid",
            MuxCounter::SbtxMsgs => "sbtx-msgs",
            MuxCounter::SbtxRetries => "sbtx-retries",
            MuxCounter::SbtxQueued => "sbtx-queued",
            MuxCounter::SbtxFree => "sbtx-free",
            MuxCounter::SbtxTicks => "sbtx-ticks",
            MuxCounter::ExFrames => "ex-frames",
            MuxCounter::ExBytes => "ex-bytes",
        }
    }
}

/// Per-mux counter block.
#[derive(Debug, Default)]
pub struct MuxCounters {
    values: [AtomicU64; MuxCounter::COUNT],
}

impl MuxCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self, c: MuxCounter) {
        self.add(c, 1);
    }

    #[inline]
    pub fn add(&self, c: MuxCounter, n: u64) {
        self.values[c as usize].fetch_add(n, Ordering::Relaxed);
    }

    /// Decrement a gauge, saturating at zero.
    pub fn dec(&self, c: MuxCounter) {
        let _ = self.values[c as usize].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    }

    #[inline]
    pub fn get(&self, c: MuxCounter) -> u64 {
        self.values[c as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        MuxCounter::ALL.iter().map(|c| (c.name(), self.get(*c))).collect()
    }
}

/// Interface statistics in rtnl_link_stats64 order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LinkStat {
    RxPackets,
    TxPackets,
    RxBytes,
    TxBytes,
    RxErrors,
    TxErrors,
    RxDropped,
    TxDropped,
    Multicast,
    Collisions,
    RxLengthErrors,
    RxOverErrors,
    RxCrcErrors,
    RxFrameErrors,
    RxFifoErrors,
    RxMissedErrors,
    TxAbortedErrors,
    TxCarrierErrors,
    TxFifoErrors,
    TxHeartbeatErrors,
    TxWindowErrors,
    RxCompressed,
    TxCompressed,
    RxNohandler,
}

impl LinkStat {
    pub const COUNT: usize = 24;

    pub const ALL: [LinkStat; Self::COUNT] = [
        LinkStat::RxPackets,
        LinkStat::TxPackets,
        LinkStat::RxBytes,
        LinkStat::TxBytes,
        LinkStat::RxErrors,
        LinkStat::TxErrors,
        LinkStat::RxDropped,
        LinkStat::TxDropped,
        LinkStat::Multicast,
        LinkStat::Collisions,
        LinkStat::RxLengthErrors,
        LinkStat::RxOverErrors,
        LinkStat::RxCrcErrors,
        LinkStat::RxFrameErrors,
        LinkStat::RxFifoErrors,
        LinkStat::RxMissedErrors,
        LinkStat::TxAbortedErrors,
        LinkStat::TxCarrierErrors,
        LinkStat::TxFifoErrors,
        LinkStat::TxHeartbeatErrors,
        LinkStat::TxWindowErrors,
        LinkStat::RxCompressed,
        LinkStat::TxCompressed,
        LinkStat::RxNohandler,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LinkStat::RxPackets => "rx-packets",
            LinkStat::TxPackets => "tx-packets",
            LinkStat::RxBytes => "rx-bytes",
            LinkStat::TxBytes => "tx-bytes",
            LinkStat::RxErrors => "rx-errors",
            LinkStat::TxErrors => "tx-errors",
            LinkStat::RxDropped => "rx-dropped",
            LinkStat::TxDropped => "tx-dropped",
            LinkStat::Multicast => "multicast",
            LinkStat::Collisions => "collisions",
            LinkStat::RxLengthErrors => "rx-length-errors",
            LinkStat::RxOverErrors => "rx-over-errors",
            LinkStat::RxCrcErrors => "rx-crc-errors",
            LinkStat::RxFrameErrors => "rx-frame-errors",
            LinkStat::RxFifoErrors => "rx-fifo-errors",
            LinkStat::RxMissedErrors => "rx-missed-errors",
            LinkStat::TxAbortedErrors => "tx-aborted-errors",
            LinkStat::TxCarrierErrors => "tx-carrier-errors",
            LinkStat::TxFifoErrors => "tx-fifo-errors",
            LinkStat::TxHeartbeatErrors => "tx-heartbeat-errors",
            LinkStat::TxWindowErrors => "tx-window-errors",
            LinkStat::RxCompressed => "rx-compressed",
            LinkStat::TxCompressed => "tx-compressed",
            LinkStat::RxNohandler => "rx-nohandler",
        }
    }

    /// Map a wire index (as carried by link-stat control messages) to a stat.
    pub fn from_index(index: u32) -> Option<LinkStat> {
        Self::ALL.get(index as usize).copied()
    }
}

/// A block of link statistics for the mux or a single proxy.
#[derive(Debug, Default)]
pub struct LinkStats {
    values: [AtomicU64; LinkStat::COUNT],
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self, s: LinkStat) {
        self.add(s, 1);
    }

    #[inline]
    pub fn add(&self, s: LinkStat, n: u64) {
        self.values[s as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(&self, s: LinkStat, n: u64) {
        self.values[s as usize].store(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self, s: LinkStat) -> u64 {
        self.values[s as usize].load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for v in &self.values {
            v.store(0, Ordering::Relaxed);
        }
    }

    /// Sum of every error and drop counter; handy for health checks.
    pub fn error_total(&self) -> u64 {
        [
            LinkStat::RxErrors,
            LinkStat::TxErrors,
            LinkStat::RxDropped,
            LinkStat::TxDropped,
        ]
        .iter()
        .map(|s| self.get(*s))
        .sum()
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        LinkStat::ALL.iter().map(|s| (s.name(), self.get(*s))).collect()
    }
}

/// Operational flag bits of a mux.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MuxFlag {
    MainTask = 0,
    SbListen = 1,
    SbConnection = 2,
}

impl MuxFlag {
    pub const ALL: [MuxFlag; 3] = [MuxFlag::MainTask, MuxFlag::SbListen, MuxFlag::SbConnection];

    pub fn name(&self) -> &'static str {
        match self {
            MuxFlag::MainTask => "main-task",
            MuxFlag::SbListen => "sb-listen",
            MuxFlag::SbConnection => "sb-connection",
        }
    }

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

#[derive(Debug, Default)]
pub struct MuxFlags(AtomicU32);

impl MuxFlags {
    pub fn set(&self, f: MuxFlag) {
        self.0.fetch_or(f.bit(), Ordering::SeqCst);
    }

    pub fn clear(&self, f: MuxFlag) {
        self.0.fetch_and(!f.bit(), Ordering::SeqCst);
    }

    pub fn test(&self, f: MuxFlag) -> bool {
        self.0.load(Ordering::SeqCst) & f.bit() != 0
    }

    /// Set `f`, returning whether it was already set.
    pub fn test_and_set(&self, f: MuxFlag) -> bool {
        self.0.fetch_or(f.bit(), Ordering::SeqCst) & f.bit() != 0
    }

    pub fn bits(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}
