//! Translation of host bit timing into the bxCAN `BTR` register.
//!
//! ```text
//! tq   = (BRP + 1) * tpclk
//! tsjw = tq * (SJW + 1)
//! tbs1 = tq * (TS1 + 1)
//! tbs2 = tq * (TS2 + 1)
//! baud = 1 / (tq * (1 + (TS1 + 1) + (TS2 + 1)))
//! ```

use usb8dev_protocol::{CtrlMode, OpenParams};

use crate::config::BridgeConfig;

const BRP_MASK: u32 = 0x3ff;
const TS1_SHIFT: u32 = 16;
const TS2_SHIFT: u32 = 20;
const SJW_SHIFT: u32 = 24;
const LBKM: u32 = 1 << 30;
const SILM: u32 = 1 << 31;

/// Bit timing with every segment stored 0-based, as the controller wants it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTiming {
    /// Synchronization jump width (in tq), 0-3
    pub sjw: u8,
    /// Bit segment 1 (in tq), 0-15
    pub ts1: u8,
    /// Bit segment 2 (in tq), 0-7
    pub ts2: u8,
    /// Bit-rate prescaler, already scaled to the device clock. 1-based.
    pub brp: u16,
}

impl BitTiming {
    pub const SJW_MAX: u8 = 3;
    pub const TS1_MAX: u8 = 15;
    pub const TS2_MAX: u8 = 7;
    pub const BRP_MAX: u16 = 1024;

    /// Converts the 1-based values of an OPEN command.
    ///
    /// Out of range segments are masked to their field width.
    pub fn from_host(params: &OpenParams, config: &BridgeConfig) -> Self {
        let sjw = params.sjw.wrapping_sub(1);
        let ts1 = params.ts1.wrapping_sub(1);
        let ts2 = params.ts2.wrapping_sub(1);
        if sjw > Self::SJW_MAX || ts1 > Self::TS1_MAX || ts2 > Self::TS2_MAX {
            log::warn!(
                "bit timing out of range: sjw={} ts1={} ts2={}",
                params.sjw,
                params.ts1,
                params.ts2
            );
        }
        Self {
            sjw: sjw & Self::SJW_MAX,
            ts1: ts1 & Self::TS1_MAX,
            ts2: ts2 & Self::TS2_MAX,
            brp: config.scale_prescaler(params.brp),
        }
    }
}

/// Raw value of the bxCAN bit timing register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTimingRegister(u32);

impl BitTimingRegister {
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Adds the loopback and silent mode bits.
    pub const fn with_mode(self, mode: CtrlMode) -> Self {
        let mut bits = self.0;
        if mode.contains(CtrlMode::LOOPBACK) {
            bits |= LBKM;
        }
        if mode.contains(CtrlMode::SILENT) {
            bits |= SILM;
        }
        Self(bits)
    }

    pub const fn sjw(&self) -> u8 {
        ((self.0 >> SJW_SHIFT) & 0x3) as u8
    }

    pub const fn ts1(&self) -> u8 {
        ((self.0 >> TS1_SHIFT) & 0xf) as u8
    }

    pub const fn ts2(&self) -> u8 {
        ((self.0 >> TS2_SHIFT) & 0x7) as u8
    }

    /// Prescaler, 1-based.
    pub const fn prescaler(&self) -> u16 {
        (self.0 & BRP_MASK) as u16 + 1
    }

    pub const fn loopback(&self) -> bool {
        self.0 & LBKM != 0
    }

    pub const fn silent(&self) -> bool {
        self.0 & SILM != 0
    }
}

/// Places each field at its register position.
pub fn compute(timing: &BitTiming) -> BitTimingRegister {
    let brp = timing.brp.clamp(1, BitTiming::BRP_MAX) as u32 - 1;
    BitTimingRegister(
        (brp & BRP_MASK)
            | ((timing.ts1 & BitTiming::TS1_MAX) as u32) << TS1_SHIFT
            | ((timing.ts2 & BitTiming::TS2_MAX) as u32) << TS2_SHIFT
            | ((timing.sjw & BitTiming::SJW_MAX) as u32) << SJW_SHIFT,
    )
}

/// Everything the CAN peripheral needs to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanConfig {
    /// Timing fields only, mode bits clear.
    pub timing: BitTimingRegister,
    pub silent: bool,
    pub loopback: bool,
    /// Cleared in one-shot mode.
    pub automatic_retransmit: bool,
}

impl CanConfig {
    pub fn new(timing: &BitTiming, mode: CtrlMode) -> Self {
        Self {
            timing: compute(timing),
            silent: mode.contains(CtrlMode::SILENT),
            loopback: mode.contains(CtrlMode::LOOPBACK),
            automatic_retransmit: !mode.contains(CtrlMode::ONE_SHOT),
        }
    }

    /// Full register value including mode bits.
    pub fn btr(&self) -> BitTimingRegister {
        let mut mode = CtrlMode::empty();
        mode.set(CtrlMode::SILENT, self.silent);
        mode.set(CtrlMode::LOOPBACK, self.loopback);
        self.timing.with_mode(mode)
    }
}
