#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod bittiming;
pub mod bridge;
pub mod can;
pub mod command;
pub mod config;
pub mod data;
pub mod sched;
pub mod slot;
pub mod usb;
/// Host side client over nusb
#[cfg(feature = "host")]
pub mod host;

pub use bridge::{Bridge, Shared};
pub use config::BridgeConfig;
pub use usb8dev_protocol as protocol;
pub use usb8dev_protocol::CanFrame;
