#![no_std]

use bytemuck::{Pod, Zeroable};
use embedded_can::Frame;

mod frame;
pub use embedded_can;
pub use frame::{CanFrame, FrameError};

/// Data In bulk xfer endpoint (has top bit set)
pub const DATA_ENDPOINT_IN: u8 = 0x81;
/// Data Out bulk xfer endpoint
pub const DATA_ENDPOINT_OUT: u8 = 0x02;
/// Command In bulk xfer endpoint
pub const CMD_ENDPOINT_IN: u8 = 0x83;
/// Command Out bulk xfer endpoint
pub const CMD_ENDPOINT_OUT: u8 = 0x04;
/// Full speed max packet size, the same for all four endpoints.
pub const MAX_PACKET_SIZE: usize = 64;

/// Interface class/subclass/protocol: vendor specific.
pub const INTERFACE_CLASS: u8 = 0xff;
pub const INTERFACE_SUBCLASS: u8 = 0xff;
pub const INTERFACE_PROTOCOL: u8 = 0xff;

/// VID/PID the usb_8dev host driver binds to.
pub const USB_VID: u16 = 0x0483;
pub const USB_PID: u16 = 0x1234;

pub const CMD_START: u8 = 0x11;
pub const CMD_END: u8 = 0x22;
/// opt1 of a command response on success
pub const CMD_SUCCESS: u8 = 0;
/// opt1 of a command response on failure
pub const CMD_ERROR: u8 = 255;

pub const DATA_START: u8 = 0x55;
pub const DATA_END: u8 = 0xAA;

/// Reference clock the host driver computes bit timings against.
pub const HOST_CLOCK_HZ: u32 = 32_000_000;

pub const CMD_MSG_SIZE: usize = 16;
pub const IN_MSG_SIZE: usize = 21;
pub const OUT_MSG_SIZE: usize = 16;
/// Length of the command-specific payload of [`Usb8devCmdMsg`].
pub const CMD_PAYLOAD_SIZE: usize = 10;

const _: () = assert!(core::mem::size_of::<Usb8devCmdMsg>() == CMD_MSG_SIZE);
const _: () = assert!(core::mem::size_of::<Usb8devInMsg>() == IN_MSG_SIZE);
const _: () = assert!(core::mem::size_of::<Usb8devOutMsg>() == OUT_MSG_SIZE);

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum Command {
    /// not used
    Reset = 1,
    Open = 2,
    Close = 3,
    /// not used
    SetSpeed = 4,
    /// not used
    SetMaskFilter = 5,
    /// not used
    GetStatus = 6,
    /// not used
    GetStatistics = 7,
    /// not used
    GetSerial = 8,
    /// not used
    GetSoftwVer = 9,
    /// not used
    GetHardwVer = 10,
    /// not used
    ResetTimestamp = 11,
    GetSoftwHardwVer = 12,
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Command::Reset,
            2 => Command::Open,
            3 => Command::Close,
            4 => Command::SetSpeed,
            5 => Command::SetMaskFilter,
            6 => Command::GetStatus,
            7 => Command::GetStatistics,
            8 => Command::GetSerial,
            9 => Command::GetSoftwVer,
            10 => Command::GetHardwVer,
            11 => Command::ResetTimestamp,
            12 => Command::GetSoftwHardwVer,
            other => return Err(other),
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum FrameType {
    CanFrame = 0,
    ErrorFrame = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::CanFrame),
            3 => Ok(FrameType::ErrorFrame),
            other => Err(other),
        }
    }
}

bitflags::bitflags! {
    /// Flag byte carried by both data message directions.
    #[derive(Default)]
    pub struct MessageFlags: u8 {
        const EXT_ID = 0x01;
        const RTR = 0x02;
        const ERR = 0x04;
    }
}

bitflags::bitflags! {
    /// CAN control modes requested by the host on open.
    ///
    /// The host driver may also set 3-samples, error-reporting, FD, FD-non-ISO
    /// and presume-ACK bits. None of these are supported and they are dropped
    /// by [`CtrlMode::from_bits_truncate`].
    #[derive(Default)]
    pub struct CtrlMode: u8 {
        const SILENT = 0x01;
        const LOOPBACK = 0x02;
        const ONE_SHOT = 0x04;
    }
}

/// One-byte CAN status reported to the host in error frames.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0x00,
    Overrun = 0x01,
    ErrorWarning = 0x02,
    ErrorPassive = 0x03,
    BusOff = 0x04,
    Stuff = 0x20,
    Form = 0x21,
    Ack = 0x23,
    BitRecessive = 0x24,
    BitDominant = 0x25,
    Crc = 0x27,
    Unknown = 0xff,
}

impl From<ErrorCode> for u8 {
    fn from(value: ErrorCode) -> Self {
        value as u8
    }
}

impl From<u8> for ErrorCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ErrorCode::Ok,
            0x01 => ErrorCode::Overrun,
            0x02 => ErrorCode::ErrorWarning,
            0x03 => ErrorCode::ErrorPassive,
            0x04 => ErrorCode::BusOff,
            0x20 => ErrorCode::Stuff,
            0x21 => ErrorCode::Form,
            0x23 => ErrorCode::Ack,
            0x24 => ErrorCode::BitRecessive,
            0x25 => ErrorCode::BitDominant,
            0x27 => ErrorCode::Crc,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Receive/transmit error counters of the CAN controller.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct ErrorCounters {
    pub rx: u8,
    pub tx: u8,
}

/// Firmware and hardware versions, BCD encoded (`0x0010` is v0.1).
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct VersionInfo {
    pub firmware: u16,
    pub hardware: u16,
}

impl VersionInfo {
    /// Splits a BCD version into the (major, minor) bytes sent on the wire.
    pub const fn major_minor(version: u16) -> (u8, u8) {
        (((version & 0xff00) >> 8) as u8, ((version & 0x00f0) >> 4) as u8)
    }

    pub const fn encode(&self) -> [u8; 4] {
        let (fw_major, fw_minor) = Self::major_minor(self.firmware);
        let (hw_major, hw_minor) = Self::major_minor(self.hardware);
        [fw_major, fw_minor, hw_major, hw_minor]
    }

    pub const fn decode(data: &[u8; CMD_PAYLOAD_SIZE]) -> Self {
        Self {
            firmware: ((data[0] as u16) << 8) | ((data[1] as u16 & 0x0f) << 4),
            hardware: ((data[2] as u16) << 8) | ((data[3] as u16 & 0x0f) << 4),
        }
    }
}

/// Parameters of an OPEN command, as sent by the host.
///
/// Timing segments are 1-based time quanta counts computed for
/// [`HOST_CLOCK_HZ`]; the device rescales the prescaler for its own clock.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct OpenParams {
    /// prop_seg + phase_seg1
    pub ts1: u8,
    /// phase_seg2
    pub ts2: u8,
    pub sjw: u8,
    pub brp: u16,
    /// Control mode flags. Only the low byte is meaningful.
    pub ctrl_mode: u32,
}

impl OpenParams {
    pub fn encode(&self) -> [u8; CMD_PAYLOAD_SIZE] {
        let mut data = [0u8; CMD_PAYLOAD_SIZE];
        data[0] = self.ts1;
        data[1] = self.ts2;
        data[2] = self.sjw;
        data[3..5].copy_from_slice(&self.brp.to_be_bytes());
        data[5..9].copy_from_slice(&self.ctrl_mode.to_be_bytes());
        data
    }

    pub fn decode(data: &[u8; CMD_PAYLOAD_SIZE]) -> Self {
        Self {
            ts1: data[0],
            ts2: data[1],
            sjw: data[2],
            brp: u16::from_be_bytes([data[3], data[4]]),
            ctrl_mode: u32::from_be_bytes([data[5], data[6], data[7], data[8]]),
        }
    }

    pub fn ctrl_mode(&self) -> CtrlMode {
        CtrlMode::from_bits_truncate(self.ctrl_mode as u8)
    }
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() != expected {
        return Err(FrameError::BadLength { expected, actual: buf.len() });
    }
    Ok(())
}

/// Command message, identical in both directions.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct Usb8devCmdMsg {
    pub start: u8,
    /// Always zero.
    pub channel: u8,
    pub command: u8,
    /// Optional parameter. Return value in responses.
    pub opt1: u8,
    pub opt2: u8,
    pub data: [u8; CMD_PAYLOAD_SIZE],
    pub end: u8,
}

impl Usb8devCmdMsg {
    pub const SIZE: usize = CMD_MSG_SIZE;

    pub const fn new(command: Command, data: [u8; CMD_PAYLOAD_SIZE]) -> Self {
        Self {
            start: CMD_START,
            channel: 0,
            command: command as u8,
            opt1: 0,
            opt2: 0,
            data,
            end: CMD_END,
        }
    }

    /// Validates length and start/end markers.
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        check_len(buf, Self::SIZE)?;
        let msg: Self = bytemuck::pod_read_unaligned(buf);
        if !msg.is_framed() {
            return Err(FrameError::BadMarker);
        }
        Ok(msg)
    }

    pub fn encode(self) -> [u8; CMD_MSG_SIZE] {
        bytemuck::cast(self)
    }

    pub const fn is_framed(&self) -> bool {
        self.start == CMD_START && self.end == CMD_END
    }

    pub fn command(&self) -> Result<Command, u8> {
        Command::try_from(self.command)
    }

    /// Response template echoing channel, command and options of this request.
    pub const fn response(&self) -> Self {
        Self {
            start: CMD_START,
            channel: self.channel,
            command: self.command,
            opt1: self.opt1,
            opt2: self.opt2,
            data: [0u8; CMD_PAYLOAD_SIZE],
            end: CMD_END,
        }
    }

    pub const fn succeeded(&self) -> bool {
        self.opt1 == CMD_SUCCESS
    }
}

/// Data message sent device to host over [`DATA_ENDPOINT_IN`].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct Usb8devInMsg {
    pub start: u8,
    /// [`FrameType`]
    pub frame_type: u8,
    /// [`MessageFlags`]
    pub flags: u8,
    /// Arbitration id, big endian.
    pub id: u32,
    /// Data length code, 0-8
    pub dlc: u8,
    pub data: [u8; 8],
    /// Millisecond tick, device byte order (little endian).
    pub timestamp: u32,
    pub end: u8,
}

impl Usb8devInMsg {
    pub const SIZE: usize = IN_MSG_SIZE;

    pub fn can_frame(frame: &CanFrame, timestamp_ms: u32) -> Self {
        let mut flags = MessageFlags::empty();
        if frame.is_extended() {
            flags |= MessageFlags::EXT_ID;
        }
        if frame.is_remote_frame() {
            flags |= MessageFlags::RTR;
        }
        let mut data = [0u8; 8];
        let payload = frame.data();
        data[..payload.len()].copy_from_slice(payload);
        Self {
            start: DATA_START,
            frame_type: FrameType::CanFrame as u8,
            flags: flags.bits(),
            id: frame.raw_id().to_be(),
            dlc: frame.dlc() as u8,
            data,
            timestamp: timestamp_ms.to_le(),
            end: DATA_END,
        }
    }

    pub fn error_frame(code: ErrorCode, counters: ErrorCounters, timestamp_ms: u32) -> Self {
        let mut data = [0u8; 8];
        data[0] = code.into();
        data[2] = counters.rx;
        data[3] = counters.tx;
        Self {
            start: DATA_START,
            frame_type: FrameType::ErrorFrame as u8,
            flags: MessageFlags::ERR.bits(),
            id: 0,
            dlc: 4,
            data,
            timestamp: timestamp_ms.to_le(),
            end: DATA_END,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        check_len(buf, Self::SIZE)?;
        let msg: Self = bytemuck::pod_read_unaligned(buf);
        if !msg.is_framed() {
            return Err(FrameError::BadMarker);
        }
        Ok(msg)
    }

    pub fn encode(self) -> [u8; IN_MSG_SIZE] {
        bytemuck::cast(self)
    }

    pub const fn is_framed(&self) -> bool {
        self.start == DATA_START && self.end == DATA_END
    }

    pub fn frame_type(&self) -> Result<FrameType, u8> {
        FrameType::try_from(self.frame_type)
    }

    pub fn flags(&self) -> MessageFlags {
        MessageFlags::from_bits_truncate(self.flags)
    }

    pub fn id(&self) -> u32 {
        u32::from_be(self.id)
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_le(self.timestamp)
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from(self.data[0])
    }

    pub fn error_counters(&self) -> ErrorCounters {
        ErrorCounters { rx: self.data[2], tx: self.data[3] }
    }

    /// Decodes the CAN frame carried by a [`FrameType::CanFrame`] message.
    pub fn to_can_frame(&self) -> Result<CanFrame, FrameError> {
        let flags = self.flags();
        CanFrame::from_parts(
            self.id(),
            flags.contains(MessageFlags::EXT_ID),
            flags.contains(MessageFlags::RTR),
            self.dlc,
            self.data,
        )
    }
}

/// Data message sent host to device over [`DATA_ENDPOINT_OUT`].
#[derive(Debug, PartialEq, Eq, Clone, Copy, Pod, Zeroable)]
#[repr(C, packed)]
pub struct Usb8devOutMsg {
    pub start: u8,
    /// [`MessageFlags`]
    pub flags: u8,
    /// Arbitration id, big endian.
    pub id: u32,
    /// Data length code, 0-8
    pub dlc: u8,
    pub data: [u8; 8],
    pub end: u8,
}

impl Usb8devOutMsg {
    pub const SIZE: usize = OUT_MSG_SIZE;

    pub fn from_can_frame(frame: &CanFrame) -> Self {
        let mut flags = MessageFlags::empty();
        if frame.is_extended() {
            flags |= MessageFlags::EXT_ID;
        }
        if frame.is_remote_frame() {
            flags |= MessageFlags::RTR;
        }
        let mut data = [0u8; 8];
        let payload = frame.data();
        data[..payload.len()].copy_from_slice(payload);
        Self {
            start: DATA_START,
            flags: flags.bits(),
            id: frame.raw_id().to_be(),
            dlc: frame.dlc() as u8,
            data,
            end: DATA_END,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        check_len(buf, Self::SIZE)?;
        let msg: Self = bytemuck::pod_read_unaligned(buf);
        if !msg.is_framed() {
            return Err(FrameError::BadMarker);
        }
        Ok(msg)
    }

    pub fn encode(self) -> [u8; OUT_MSG_SIZE] {
        bytemuck::cast(self)
    }

    pub const fn is_framed(&self) -> bool {
        self.start == DATA_START && self.end == DATA_END
    }

    pub fn flags(&self) -> MessageFlags {
        MessageFlags::from_bits_truncate(self.flags)
    }

    pub fn id(&self) -> u32 {
        u32::from_be(self.id)
    }

    pub fn to_can_frame(&self) -> Result<CanFrame, FrameError> {
        let flags = self.flags();
        CanFrame::from_parts(
            self.id(),
            flags.contains(MessageFlags::EXT_ID),
            flags.contains(MessageFlags::RTR),
            self.dlc,
            self.data,
        )
    }
}
