use usb8dev_protocol::{VersionInfo, HOST_CLOCK_HZ};

use crate::bittiming::BitTiming;

/// Device identity and clocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// BCD, `0x0010` is v0.1
    pub firmware_version: u16,
    /// BCD, `0x0010` is v0.1
    pub hardware_version: u16,
    /// Clock feeding the CAN peripheral.
    pub device_clock_hz: u32,
}

impl BridgeConfig {
    pub const FIRMWARE_VERSION: u16 = 0x0010;
    pub const HARDWARE_VERSION: u16 = 0x0010;
    pub const DEVICE_CLOCK_HZ: u32 = 48_000_000;

    pub const fn new() -> Self {
        Self {
            firmware_version: Self::FIRMWARE_VERSION,
            hardware_version: Self::HARDWARE_VERSION,
            device_clock_hz: Self::DEVICE_CLOCK_HZ,
        }
    }

    pub const fn version(&self) -> VersionInfo {
        VersionInfo { firmware: self.firmware_version, hardware: self.hardware_version }
    }

    /// Rescales a prescaler computed by the host for [`HOST_CLOCK_HZ`] to this
    /// device's clock, truncating. The result is clamped to the range the
    /// controller can hold.
    pub fn scale_prescaler(&self, brp: u16) -> u16 {
        let scaled = brp as u64 * self.device_clock_hz as u64 / HOST_CLOCK_HZ as u64;
        scaled.clamp(1, BitTiming::BRP_MAX as u64) as u16
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prescaler_scales_by_one_and_a_half() {
        let config = BridgeConfig::default();
        assert_eq!(config.scale_prescaler(10), 15);
        assert_eq!(config.scale_prescaler(4), 6);
        // truncates like the float conversion it replaces
        assert_eq!(config.scale_prescaler(3), 4);
        assert_eq!(config.scale_prescaler(0), 1);
        assert_eq!(config.scale_prescaler(u16::MAX), BitTiming::BRP_MAX);
    }

    #[test]
    fn identity_at_host_clock() {
        let config = BridgeConfig { device_clock_hz: HOST_CLOCK_HZ, ..BridgeConfig::new() };
        assert_eq!(config.scale_prescaler(10), 10);
    }
}
