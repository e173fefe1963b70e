//! Collaborator interfaces towards the USB device core and the board.

use usb8dev_protocol::{CMD_MSG_SIZE, IN_MSG_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// The endpoint still has a transfer in flight.
    Busy,
    Fail,
}

pub type UsbResult<T> = Result<T, UsbError>;

/// Bulk transfers of the vendor class, driven from the main loop.
pub trait UsbBulk {
    /// Starts an IN transfer on the command endpoint.
    fn transmit_command(&mut self, msg: &[u8; CMD_MSG_SIZE]) -> UsbResult<()>;
    /// Starts an IN transfer on the data endpoint.
    fn transmit_data(&mut self, msg: &[u8; IN_MSG_SIZE]) -> UsbResult<()>;
    /// Accepts the next OUT transfer on the command endpoint.
    fn arm_command_receive(&mut self) -> UsbResult<()>;
    /// Accepts the next OUT transfer on the data endpoint.
    fn arm_data_receive(&mut self) -> UsbResult<()>;
}

/// Callbacks the USB device core invokes from interrupt context.
pub trait ClassInterface {
    fn init(&self);
    fn deinit(&self);
    /// An OUT transfer completed on the command endpoint.
    fn receive_command(&self, buf: &[u8]);
    /// An OUT transfer completed on the data endpoint.
    fn receive_data(&self, buf: &[u8]);
}

/// Free running millisecond tick.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// Fault LED or whatever the board uses to signal trouble.
pub trait Indicator {
    fn fault(&mut self);
}
