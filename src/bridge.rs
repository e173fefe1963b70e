//! Glue between the interrupt handlers and the main loop.
//!
//! [`Shared`] is the only state interrupt handlers touch. It is meant to live
//! in a `static`:
//!
//! ```ignore
//! static SHARED: Shared = Shared::new(BridgeConfig::new());
//!
//! let mut bridge = Bridge::new(&SHARED, can, usb, clock, led);
//! loop {
//!     bridge.poll();
//! }
//! ```
//!
//! The USB device core calls into `SHARED` through [`ClassInterface`], the CAN
//! interrupt through [`Shared::can_rx_complete`], [`Shared::can_tx_complete`]
//! and [`Shared::can_error`].

use core::cell::Cell;

use critical_section::Mutex;
use usb8dev_protocol::{CanFrame, FrameError, Usb8devCmdMsg};

use crate::can::{CanControl, CanErrorFlags, CanPeripheral, RxArm, TransmitError};
use crate::command::{parse_command, response_status, CommandAction, PendingCommand};
use crate::config::BridgeConfig;
use crate::data::{can_frame_message, error_message, parse_incoming_frame};
use crate::sched::{Dispatch, Request, RequestFlags};
use crate::slot::Slot;
use crate::usb::{ClassInterface, Clock, Indicator, UsbBulk, UsbError};

/// State shared between interrupt context and the main loop.
pub struct Shared {
    config: BridgeConfig,
    requests: RequestFlags,
    command: Slot<PendingCommand>,
    can_tx: Slot<CanFrame>,
    can_rx: Slot<CanFrame>,
    errors: Mutex<Cell<Option<CanErrorFlags>>>,
    session: Mutex<Cell<u32>>,
}

impl Shared {
    pub const fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            requests: RequestFlags::new(),
            command: Slot::new(),
            can_tx: Slot::new(),
            can_rx: Slot::new(),
            errors: Mutex::new(Cell::new(None)),
            session: Mutex::new(Cell::new(0)),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn requests(&self) -> &RequestFlags {
        &self.requests
    }

    /// A frame arrived on the bus. CAN interrupt context.
    pub fn can_rx_complete(&self, frame: CanFrame, rx: &mut impl RxArm) {
        let stored = self.can_rx.put(frame).is_ok();
        if let Err(e) = rx.arm_receive() {
            log::error!("can receive re-arm failed: {e:?}");
            self.requests.raise(Request::Fault);
        }
        if stored {
            self.requests.raise(Request::FrameReady);
        } else {
            log::warn!("rx slot busy, frame dropped");
            self.can_error(CanErrorFlags::RX_OVERRUN);
        }
    }

    /// The last queued frame left the mailbox. CAN interrupt context.
    pub fn can_tx_complete(&self) {
        self.requests.raise(Request::ArmData);
    }

    /// Accumulates controller errors until the next report goes out.
    ///
    /// An empty `flags` still queues a report, which tells the host the
    /// controller is back to error active.
    pub fn can_error(&self, flags: CanErrorFlags) {
        critical_section::with(|cs| {
            let errors = self.errors.borrow(cs);
            errors.set(Some(errors.get().unwrap_or_default() | flags));
        });
        self.requests.raise(Request::Error);
    }

    /// Errors waiting for a report. `None` when no report is due.
    pub fn pending_errors(&self) -> Option<CanErrorFlags> {
        critical_section::with(|cs| self.errors.borrow(cs).get())
    }

    /// Clears the reported errors, keeping any raised since they were read.
    fn clear_errors(&self, reported: CanErrorFlags) {
        critical_section::with(|cs| {
            let errors = self.errors.borrow(cs);
            let rest = errors.get().map(|e| e - reported).filter(|e| !e.is_empty());
            errors.set(rest);
        });
    }

    /// Bumped on every USB class init and deinit.
    pub fn session(&self) -> u32 {
        critical_section::with(|cs| self.session.borrow(cs).get())
    }

    fn new_session(&self) {
        critical_section::with(|cs| {
            let session = self.session.borrow(cs);
            session.set(session.get().wrapping_add(1));
        });
    }

    /// Malformed transfer. The buffer is dropped and reception stays unarmed.
    fn framing_error(&self, channel: &str, err: FrameError) {
        log::warn!("{channel} framing error: {err:?}");
        self.requests.raise(Request::Fault);
    }
}

impl ClassInterface for Shared {
    /// Vendor class configured. The device core arms both OUT endpoints
    /// afterwards.
    fn init(&self) {
        log::debug!("usb class init");
        self.command.clear();
        self.can_tx.clear();
        self.new_session();
    }

    fn deinit(&self) {
        log::debug!("usb class deinit");
        self.command.clear();
        self.new_session();
        self.requests.raise(Request::Close);
    }

    fn receive_command(&self, buf: &[u8]) {
        match parse_command(buf, &self.config) {
            Ok(cmd) => {
                let req = cmd.action.request();
                if self.command.put(cmd).is_err() {
                    log::warn!("command received while one is pending");
                    self.requests.raise(Request::Fault);
                    return;
                }
                self.requests.raise(req);
            }
            Err(e) => self.framing_error("command", e),
        }
    }

    fn receive_data(&self, buf: &[u8]) {
        match parse_incoming_frame(buf) {
            Ok(frame) => {
                if self.can_tx.put(frame).is_err() {
                    log::warn!("data received while a frame is pending");
                    self.requests.raise(Request::Fault);
                    return;
                }
                self.requests.raise(Request::Transmit);
            }
            Err(e) => self.framing_error("data", e),
        }
    }
}

/// Main loop side of the adapter.
pub struct Bridge<'a, C, U, K, L> {
    shared: &'a Shared,
    can: CanControl<C>,
    usb: U,
    clock: K,
    indicator: L,
    /// Response whose CAN action already ran but which is not sent yet.
    response: Option<Usb8devCmdMsg>,
    /// USB session `response` belongs to.
    session: u32,
}

impl<'a, C, U, K, L> Bridge<'a, C, U, K, L>
where
    C: CanPeripheral,
    U: UsbBulk,
    K: Clock,
    L: Indicator,
{
    pub fn new(shared: &'a Shared, can: C, usb: U, clock: K, indicator: L) -> Self {
        Self {
            shared,
            can: CanControl::new(can),
            usb,
            clock,
            indicator,
            response: None,
            session: shared.session(),
        }
    }

    /// Services everything pending once. Returns the number of requests done.
    pub fn poll(&mut self) -> usize {
        let shared = self.shared;
        let session = shared.session();
        if session != self.session {
            // the host that opened the bus or waits for `response` is gone
            self.session = session;
            self.response = None;
            self.close_silently();
        }
        shared.requests.drain(|req| self.dispatch(req))
    }

    fn dispatch(&mut self, req: Request) -> Dispatch {
        match req {
            Request::Version | Request::Open | Request::Close => self.service_command(req),
            Request::Transmit => self.service_transmit(),
            Request::ArmData => self.arm_data(),
            Request::Error => self.emit_can_error(),
            Request::FrameReady => self.emit_can_frame(),
            Request::Fault => {
                self.indicator.fault();
                Dispatch::Done
            }
        }
    }

    fn service_command(&mut self, req: Request) -> Dispatch {
        let Some(pending) = self.shared.command.peek() else {
            if req == Request::Close {
                // USB went away, nobody to answer
                self.close_silently();
            } else {
                log::debug!("{req:?} without a pending command");
            }
            return Dispatch::Done;
        };

        if let Some(response) = self.response {
            return self.transmit_response(response);
        }
        if pending.action.request() != req {
            log::warn!("{req:?} raised for {:?}", pending.action);
            return Dispatch::Done;
        }

        let status = match pending.action {
            CommandAction::Version => 0,
            CommandAction::Open { timing, mode } => {
                match self.can.open(&timing, mode) {
                    Ok(()) => 0,
                    Err(e) => e.status_code(),
                }
            }
            CommandAction::Close => match self.can.close() {
                Ok(()) => 0,
                Err(e) => e.status_code(),
            },
        };
        log::debug!("{:?} -> {status}", pending.action);
        self.send_response(pending.response, status)
    }

    fn close_silently(&mut self) {
        if let Err(e) = self.can.close() {
            log::warn!("close on usb deinit: {e:?}");
        }
    }

    /// Answers the pending command and re-arms command reception.
    ///
    /// `error_code` 0 reports success, anything else failure.
    pub fn send_response(&mut self, mut response: Usb8devCmdMsg, error_code: u8) -> Dispatch {
        response.opt1 = response_status(error_code);
        self.response = Some(response);
        self.transmit_response(response)
    }

    fn transmit_response(&mut self, response: Usb8devCmdMsg) -> Dispatch {
        match self.usb.transmit_command(&response.encode()) {
            Err(UsbError::Busy) => return Dispatch::Retry,
            Err(UsbError::Fail) => {
                log::error!("command response failed");
                self.indicator.fault();
            }
            Ok(()) => {}
        }
        self.response = None;
        self.shared.command.clear();
        if let Err(e) = self.usb.arm_command_receive() {
            log::error!("command re-arm failed: {e:?}");
            self.indicator.fault();
        }
        Dispatch::Done
    }

    fn service_transmit(&mut self) -> Dispatch {
        let Some(frame) = self.shared.can_tx.peek() else {
            return Dispatch::Done;
        };
        match self.can.transmit(&frame) {
            Ok(()) => {
                // completion interrupt re-arms the data endpoint
                self.shared.can_tx.clear();
                Dispatch::Done
            }
            Err(TransmitError::Busy) => Dispatch::Retry,
            Err(e) => {
                log::warn!("dropping host frame: {e:?}");
                self.shared.can_tx.clear();
                self.arm_data()
            }
        }
    }

    fn arm_data(&mut self) -> Dispatch {
        match self.usb.arm_data_receive() {
            Ok(()) => Dispatch::Done,
            Err(UsbError::Busy) => Dispatch::Retry,
            Err(UsbError::Fail) => {
                log::error!("data re-arm failed");
                self.indicator.fault();
                Dispatch::Done
            }
        }
    }

    /// Relays the frame waiting in the RX slot to the host.
    pub fn emit_can_frame(&mut self) -> Dispatch {
        let Some(frame) = self.shared.can_rx.peek() else {
            return Dispatch::Done;
        };
        let msg = can_frame_message(&frame, self.clock.now_ms());
        match self.usb.transmit_data(&msg.encode()) {
            Err(UsbError::Busy) => return Dispatch::Retry,
            Err(UsbError::Fail) => {
                log::error!("can frame relay failed");
                self.indicator.fault();
            }
            Ok(()) => {}
        }
        self.shared.can_rx.clear();
        Dispatch::Done
    }

    /// Reports the accumulated CAN errors as one error frame. An empty set
    /// goes out as [`ErrorCode::Ok`](usb8dev_protocol::ErrorCode::Ok).
    pub fn emit_can_error(&mut self) -> Dispatch {
        let Some(errors) = self.shared.pending_errors() else {
            return Dispatch::Done;
        };
        let msg = error_message(errors, self.can.error_counters(), self.clock.now_ms());
        log::debug!("can error {errors:?} -> {:?}", msg.error_code());
        match self.usb.transmit_data(&msg.encode()) {
            Err(UsbError::Busy) => return Dispatch::Retry,
            Err(UsbError::Fail) => {
                log::error!("can error report failed");
                self.indicator.fault();
            }
            Ok(()) => {}
        }
        self.shared.clear_errors(errors);
        Dispatch::Done
    }

    pub fn shared(&self) -> &'a Shared {
        self.shared
    }

    pub fn can_control(&self) -> &CanControl<C> {
        &self.can
    }

    pub fn can_control_mut(&mut self) -> &mut CanControl<C> {
        &mut self.can
    }

    pub fn usb(&self) -> &U {
        &self.usb
    }

    pub fn usb_mut(&mut self) -> &mut U {
        &mut self.usb
    }

    pub fn indicator(&self) -> &L {
        &self.indicator
    }

    pub fn clock(&self) -> &K {
        &self.clock
    }
}
