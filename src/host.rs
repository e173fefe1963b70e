use std::time::Duration;

use async_ringbuf::{
    traits::{AsyncConsumer, AsyncProducer, Consumer, Producer, Split},
    AsyncHeapRb, AsyncRb,
};
use nusb::{transfer::RequestBuffer, DeviceInfo};
use ringbuf::storage::Heap;
use usb8dev_protocol::{
    CanFrame, Command, ErrorCode, ErrorCounters, FrameError, FrameType, OpenParams,
    Usb8devCmdMsg, Usb8devInMsg, Usb8devOutMsg, VersionInfo, CMD_ENDPOINT_IN, CMD_ENDPOINT_OUT,
    CMD_PAYLOAD_SIZE, DATA_ENDPOINT_IN, DATA_ENDPOINT_OUT, INTERFACE_CLASS, INTERFACE_PROTOCOL,
    INTERFACE_SUBCLASS, MAX_PACKET_SIZE, USB_PID, USB_VID,
};

/// How long the device gets to answer a command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);
/// opt1 of OPEN: bit timing is given explicitly.
pub const BAUD_MANUAL: u8 = 0x09;

/// Something the adapter reported on the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usb8devEvent {
    Frame { frame: CanFrame, timestamp_ms: u32 },
    Error { code: ErrorCode, counters: ErrorCounters, timestamp_ms: u32 },
}

#[derive(Debug)]
pub enum Usb8devHostError {
    NoDevice,
    NoInterface,
    NusbError(nusb::Error),
    TransferCancelled,
    EndpointStall,
    DeviceDisconnected,
    UsbFault,
    TransferUnknownError,
    DataDecodeError(FrameError),
    /// The response belongs to a different command.
    UnexpectedResponse(u8),
    /// The device answered with the failure status.
    CommandFailed(Command),
    Timeout,
}

impl std::fmt::Display for Usb8devHostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Usb8devHostError::NusbError(e) => write!(f, "usb error: {e}"),
            Usb8devHostError::DataDecodeError(e) => write!(f, "malformed message: {e:?}"),
            Usb8devHostError::CommandFailed(cmd) => write!(f, "device failed {cmd:?}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl std::error::Error for Usb8devHostError {}

impl From<nusb::Error> for Usb8devHostError {
    fn from(value: nusb::Error) -> Self {
        Self::NusbError(value)
    }
}

impl From<nusb::transfer::TransferError> for Usb8devHostError {
    fn from(value: nusb::transfer::TransferError) -> Self {
        match value {
            nusb::transfer::TransferError::Cancelled => Usb8devHostError::TransferCancelled,
            nusb::transfer::TransferError::Stall => Usb8devHostError::EndpointStall,
            nusb::transfer::TransferError::Disconnected => Usb8devHostError::DeviceDisconnected,
            nusb::transfer::TransferError::Fault => Usb8devHostError::UsbFault,
            nusb::transfer::TransferError::Unknown => Usb8devHostError::TransferUnknownError,
        }
    }
}

impl From<FrameError> for Usb8devHostError {
    fn from(value: FrameError) -> Self {
        Usb8devHostError::DataDecodeError(value)
    }
}

pub type Usb8devHostResult<T> = Result<T, Usb8devHostError>;

/// First attached adapter.
pub fn find_device() -> Usb8devHostResult<DeviceInfo> {
    nusb::list_devices()?
        .find(|dev| (dev.vendor_id(), dev.product_id()) == (USB_VID, USB_PID))
        .ok_or(Usb8devHostError::NoDevice)
}

/// Decodes one message received on the data IN endpoint.
pub fn decode_event(buf: &[u8]) -> Usb8devHostResult<Usb8devEvent> {
    let msg = Usb8devInMsg::parse(buf)?;
    let timestamp_ms = msg.timestamp();
    match msg.frame_type() {
        Ok(FrameType::CanFrame) => Ok(Usb8devEvent::Frame { frame: msg.to_can_frame()?, timestamp_ms }),
        Ok(FrameType::ErrorFrame) => Ok(Usb8devEvent::Error {
            code: msg.error_code(),
            counters: msg.error_counters(),
            timestamp_ms,
        }),
        Err(other) => Err(FrameError::UnknownFrameType(other).into()),
    }
}

/// Command channel of an opened adapter.
pub struct Usb8devHost {
    iface: nusb::Interface,
    // one command in flight at a time
    cmd_lock: tokio::sync::Mutex<()>,
}

/// Drives the data IN endpoint. Must be polled for [`Usb8devChannel`] to see anything.
pub struct Usb8devPoller {
    iface: nusb::Interface,
    rx_queue: <AsyncRb<Heap<Usb8devEvent>> as Split>::Prod,
}

impl Usb8devHost {
    /// Opens the device with the [`DeviceInfo`] and specified rx queue buffer size.
    pub fn open_device(
        dev_info: DeviceInfo,
        rx_q_size: usize,
    ) -> Usb8devHostResult<(Self, Usb8devPoller, Usb8devChannel)> {
        let Some(iface) = dev_info.interfaces().find(|iface| {
            iface.class() == INTERFACE_CLASS
                && iface.subclass() == INTERFACE_SUBCLASS
                && iface.protocol() == INTERFACE_PROTOCOL
        }) else {
            return Err(Usb8devHostError::NoInterface);
        };

        let handle = dev_info.open()?;
        let iface = handle.detach_and_claim_interface(iface.interface_number())?;
        log::debug!("claimed interface {}", iface.interface_number());

        let (prod, cons) = AsyncHeapRb::new(rx_q_size).split();
        Ok((
            Self { iface: iface.clone(), cmd_lock: tokio::sync::Mutex::new(()) },
            Usb8devPoller { iface: iface.clone(), rx_queue: prod },
            Usb8devChannel { iface, rx_queue: cons },
        ))
    }

    /// Sends a command and waits for its response.
    pub async fn command(
        &self,
        command: Command,
        opt1: u8,
        data: [u8; CMD_PAYLOAD_SIZE],
    ) -> Usb8devHostResult<Usb8devCmdMsg> {
        let _guard = self.cmd_lock.lock().await;
        let mut request = Usb8devCmdMsg::new(command, data);
        request.opt1 = opt1;

        let response = tokio::time::timeout(COMMAND_TIMEOUT, self.exchange(request))
            .await
            .map_err(|_| Usb8devHostError::Timeout)??;
        if response.command != request.command {
            return Err(Usb8devHostError::UnexpectedResponse(response.command));
        }
        if !response.succeeded() {
            return Err(Usb8devHostError::CommandFailed(command));
        }
        Ok(response)
    }

    async fn exchange(&self, request: Usb8devCmdMsg) -> Usb8devHostResult<Usb8devCmdMsg> {
        self.iface.bulk_out(CMD_ENDPOINT_OUT, request.encode().to_vec()).await.into_result()?;
        let buf = self
            .iface
            .bulk_in(CMD_ENDPOINT_IN, RequestBuffer::new(MAX_PACKET_SIZE))
            .await
            .into_result()?;
        Ok(Usb8devCmdMsg::parse(&buf)?)
    }

    pub async fn get_version(&self) -> Usb8devHostResult<VersionInfo> {
        let response = self.command(Command::GetSoftwHardwVer, 0, [0; CMD_PAYLOAD_SIZE]).await?;
        Ok(VersionInfo::decode(&response.data))
    }

    pub async fn open_bus(&self, params: &OpenParams) -> Usb8devHostResult<()> {
        self.command(Command::Open, BAUD_MANUAL, params.encode()).await?;
        Ok(())
    }

    pub async fn close_bus(&self) -> Usb8devHostResult<()> {
        self.command(Command::Close, 0, [0; CMD_PAYLOAD_SIZE]).await?;
        Ok(())
    }

    pub fn interface(&self) -> &nusb::Interface {
        &self.iface
    }
}

impl Usb8devPoller {
    /// This drives the event loop.
    ///
    /// **n_transfers** determines the maximum number of transfers to be flighted at a time.
    pub async fn poll(&mut self, n_transfers: usize, await_on_full: bool) -> Usb8devHostResult<()> {
        let mut read_queue = self.iface.bulk_in_queue(DATA_ENDPOINT_IN);

        while read_queue.pending() < n_transfers {
            read_queue.submit(RequestBuffer::new(MAX_PACKET_SIZE))
        }

        loop {
            let buf = read_queue.next_complete().await.into_result()?;
            // a transfer may carry several messages back to back
            for chunk in buf.chunks_exact(Usb8devInMsg::SIZE) {
                let event = match decode_event(chunk) {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("dropping data message: {e:?}");
                        continue;
                    }
                };
                if await_on_full {
                    self.rx_queue.push(event).await.ok();
                } else if self.rx_queue.try_push(event).is_err() {
                    log::debug!("rx queue full");
                }
            }

            read_queue.submit(RequestBuffer::reuse(buf, MAX_PACKET_SIZE))
        }
    }
}

/// Data channel of an opened adapter.
pub struct Usb8devChannel {
    iface: nusb::Interface,
    rx_queue: <AsyncRb<Heap<Usb8devEvent>> as Split>::Cons,
}

impl Usb8devChannel {
    pub async fn read(&mut self) -> Usb8devHostResult<Usb8devEvent> {
        match self.rx_queue.pop().await {
            Some(v) => Ok(v),
            None => Err(Usb8devHostError::DeviceDisconnected),
        }
    }

    pub fn try_read(&mut self) -> Option<Usb8devEvent> {
        self.rx_queue.try_pop()
    }

    pub async fn write(&mut self, frame: &CanFrame) -> Usb8devHostResult<()> {
        let v = Usb8devOutMsg::from_can_frame(frame).encode().to_vec();
        self.iface.bulk_out(DATA_ENDPOINT_OUT, v).await.into_result()?;
        Ok(())
    }

    pub fn interface(&self) -> &nusb::Interface {
        &self.iface
    }
}
