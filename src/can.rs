//! CAN control component and the peripheral collaborator it drives.

use usb8dev_protocol::{CanFrame, CtrlMode, ErrorCode, ErrorCounters};

use crate::bittiming::{BitTiming, CanConfig};

/// Status of a peripheral driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    Error,
    Busy,
    Timeout,
}

pub type HalResult<T> = Result<T, HalError>;

/// Receive filter setups the bridge asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Bank 0, 32-bit mask mode, all-zero mask, FIFO 0.
    AcceptAll,
}

/// Driver for the CAN controller. Main loop only, none of these calls are
/// interrupt safe.
pub trait CanPeripheral {
    fn init(&mut self, config: &CanConfig) -> HalResult<()>;
    fn configure_filter(&mut self, filter: Filter) -> HalResult<()>;
    /// Enables the receive interrupt.
    fn arm_receive(&mut self) -> HalResult<()>;
    fn deinit(&mut self) -> HalResult<()>;
    /// Queues `frame` in a free mailbox. `Busy` when all mailboxes are taken.
    fn transmit(&mut self, frame: &CanFrame) -> HalResult<()>;
    fn error_counters(&self) -> ErrorCounters;
}

/// Receive side handle owned by the CAN interrupt.
pub trait RxArm {
    /// Re-arms reception of the next frame. Must be called for every frame
    /// received or reception stops.
    fn arm_receive(&mut self) -> HalResult<()>;
}

bitflags::bitflags! {
    /// Error conditions reported by the controller.
    #[derive(Default)]
    pub struct CanErrorFlags: u16 {
        /// Error warning
        const EWG = 0x0001;
        /// Error passive
        const EPV = 0x0002;
        /// Bus-off
        const BOF = 0x0004;
        /// Stuff error
        const STF = 0x0008;
        /// Form error
        const FOR = 0x0010;
        /// Acknowledgment error
        const ACK = 0x0020;
        /// Bit recessive error
        const BR = 0x0040;
        /// Bit dominant error
        const BD = 0x0080;
        /// CRC error
        const CRC = 0x0100;
        /// Receive FIFO overrun
        const RX_OVERRUN = 0x0200;
    }
}

impl CanErrorFlags {
    /// Highest priority first.
    const PRIORITY: [(CanErrorFlags, ErrorCode); 10] = [
        (CanErrorFlags::BOF, ErrorCode::BusOff),
        (CanErrorFlags::EPV, ErrorCode::ErrorPassive),
        (CanErrorFlags::EWG, ErrorCode::ErrorWarning),
        (CanErrorFlags::RX_OVERRUN, ErrorCode::Overrun),
        (CanErrorFlags::STF, ErrorCode::Stuff),
        (CanErrorFlags::FOR, ErrorCode::Form),
        (CanErrorFlags::ACK, ErrorCode::Ack),
        (CanErrorFlags::BR, ErrorCode::BitRecessive),
        (CanErrorFlags::BD, ErrorCode::BitDominant),
        (CanErrorFlags::CRC, ErrorCode::Crc),
    ];

    /// Coalesces every pending error into the single code reported to the
    /// host.
    pub fn to_error_code(self) -> ErrorCode {
        if self.is_empty() {
            return ErrorCode::Ok;
        }
        Self::PRIORITY
            .iter()
            .find(|(flag, _)| self.contains(*flag))
            .map_or(ErrorCode::Unknown, |(_, code)| *code)
    }
}

/// Stage of [`CanControl::open`] that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpenError {
    Init = 1,
    Filter = 2,
    ArmReceive = 3,
}

impl OpenError {
    /// Byte handed to the command response.
    pub const fn status_code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseError {
    Deinit = 1,
}

impl CloseError {
    pub const fn status_code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitError {
    /// The bus is not open.
    Closed,
    /// All mailboxes are in use, try again later.
    Busy,
    Failed(HalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CanState {
    #[default]
    Closed,
    Open,
}

/// Open/close state machine around a [`CanPeripheral`].
pub struct CanControl<P> {
    peripheral: P,
    state: CanState,
}

impl<P: CanPeripheral> CanControl<P> {
    pub fn new(peripheral: P) -> Self {
        Self { peripheral, state: CanState::Closed }
    }

    pub fn state(&self) -> CanState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == CanState::Open
    }

    /// Configures the controller and starts reception.
    ///
    /// An open bus is closed first. On failure the peripheral is torn down
    /// again and the bus stays closed.
    pub fn open(&mut self, timing: &BitTiming, mode: CtrlMode) -> Result<(), OpenError> {
        if self.is_open() {
            log::debug!("reopen, closing bus first");
            if let Err(e) = self.close() {
                log::warn!("close before reopen failed: {e:?}");
            }
        }

        let config = CanConfig::new(timing, mode);
        log::debug!("can open: btr={:#010x} mode={:?}", config.btr().bits(), mode);

        self.peripheral.init(&config).map_err(|e| {
            log::error!("can init failed: {e:?}");
            OpenError::Init
        })?;
        if let Err(e) = self.peripheral.configure_filter(Filter::AcceptAll) {
            log::error!("can filter setup failed: {e:?}");
            self.abort_open();
            return Err(OpenError::Filter);
        }
        if let Err(e) = self.peripheral.arm_receive() {
            log::error!("can receive arm failed: {e:?}");
            self.abort_open();
            return Err(OpenError::ArmReceive);
        }

        self.state = CanState::Open;
        Ok(())
    }

    fn abort_open(&mut self) {
        if let Err(e) = self.peripheral.deinit() {
            log::warn!("deinit after failed open: {e:?}");
        }
    }

    /// Tears the peripheral down. Closing a closed bus does nothing.
    ///
    /// The bus counts as closed afterwards even if the driver reported an error.
    pub fn close(&mut self) -> Result<(), CloseError> {
        if !self.is_open() {
            return Ok(());
        }
        self.state = CanState::Closed;
        self.peripheral.deinit().map_err(|e| {
            log::error!("can deinit failed: {e:?}");
            CloseError::Deinit
        })
    }

    pub fn transmit(&mut self, frame: &CanFrame) -> Result<(), TransmitError> {
        if !self.is_open() {
            return Err(TransmitError::Closed);
        }
        match self.peripheral.transmit(frame) {
            Ok(()) => Ok(()),
            Err(HalError::Busy) => Err(TransmitError::Busy),
            Err(e) => Err(TransmitError::Failed(e)),
        }
    }

    pub fn error_counters(&self) -> ErrorCounters {
        self.peripheral.error_counters()
    }

    pub fn peripheral(&self) -> &P {
        &self.peripheral
    }

    pub fn peripheral_mut(&mut self) -> &mut P {
        &mut self.peripheral
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usb8dev_protocol::embedded_can::{Frame, StandardId};

    #[derive(Default)]
    struct Mock {
        fail_init: bool,
        fail_filter: bool,
        fail_arm: bool,
        fail_deinit: bool,
        tx_status: Option<HalError>,
        inits: Vec<CanConfig>,
        deinits: usize,
        sent: Vec<CanFrame>,
    }

    fn status(fail: bool) -> HalResult<()> {
        if fail {
            Err(HalError::Error)
        } else {
            Ok(())
        }
    }

    impl CanPeripheral for Mock {
        fn init(&mut self, config: &CanConfig) -> HalResult<()> {
            self.inits.push(*config);
            status(self.fail_init)
        }

        fn configure_filter(&mut self, filter: Filter) -> HalResult<()> {
            assert_eq!(filter, Filter::AcceptAll);
            status(self.fail_filter)
        }

        fn arm_receive(&mut self) -> HalResult<()> {
            status(self.fail_arm)
        }

        fn deinit(&mut self) -> HalResult<()> {
            self.deinits += 1;
            status(self.fail_deinit)
        }

        fn transmit(&mut self, frame: &CanFrame) -> HalResult<()> {
            match self.tx_status {
                Some(e) => Err(e),
                None => {
                    self.sent.push(*frame);
                    Ok(())
                }
            }
        }

        fn error_counters(&self) -> ErrorCounters {
            ErrorCounters { rx: 1, tx: 2 }
        }
    }

    const TIMING: BitTiming = BitTiming { sjw: 0, ts1: 12, ts2: 1, brp: 6 };

    #[test]
    fn bus_off_wins_over_everything() {
        let all = CanErrorFlags::all();
        assert_eq!(all.to_error_code(), ErrorCode::BusOff);
        assert_eq!((CanErrorFlags::EPV | CanErrorFlags::BOF).to_error_code(), ErrorCode::BusOff);
        assert_eq!((CanErrorFlags::EWG | CanErrorFlags::CRC).to_error_code(), ErrorCode::ErrorWarning);
        assert_eq!((CanErrorFlags::RX_OVERRUN | CanErrorFlags::STF).to_error_code(), ErrorCode::Overrun);
        assert_eq!(CanErrorFlags::empty().to_error_code(), ErrorCode::Ok);
    }

    #[test]
    fn each_flag_maps_to_its_code() {
        let table = [
            (CanErrorFlags::EWG, 0x02),
            (CanErrorFlags::EPV, 0x03),
            (CanErrorFlags::BOF, 0x04),
            (CanErrorFlags::STF, 0x20),
            (CanErrorFlags::FOR, 0x21),
            (CanErrorFlags::ACK, 0x23),
            (CanErrorFlags::BR, 0x24),
            (CanErrorFlags::BD, 0x25),
            (CanErrorFlags::CRC, 0x27),
            (CanErrorFlags::RX_OVERRUN, 0x01),
        ];
        for (flag, byte) in table {
            assert_eq!(u8::from(flag.to_error_code()), byte, "{flag:?}");
        }
    }

    #[test]
    fn open_then_close() {
        let mut can = CanControl::new(Mock::default());
        assert_eq!(can.open(&TIMING, CtrlMode::ONE_SHOT), Ok(()));
        assert_eq!(can.state(), CanState::Open);
        assert!(!can.peripheral().inits[0].automatic_retransmit);

        assert_eq!(can.close(), Ok(()));
        assert_eq!(can.state(), CanState::Closed);
        assert_eq!(can.peripheral().deinits, 1);
    }

    #[test]
    fn close_when_closed_is_noop() {
        let mut can = CanControl::new(Mock::default());
        assert_eq!(can.close(), Ok(()));
        assert_eq!(can.close(), Ok(()));
        assert_eq!(can.peripheral().deinits, 0);
    }

    #[test]
    fn open_reports_failing_stage() {
        let mut can = CanControl::new(Mock { fail_init: true, ..Default::default() });
        assert_eq!(can.open(&TIMING, CtrlMode::empty()), Err(OpenError::Init));
        assert_eq!(can.peripheral().deinits, 0);

        let mut can = CanControl::new(Mock { fail_filter: true, ..Default::default() });
        assert_eq!(can.open(&TIMING, CtrlMode::empty()).map_err(OpenError::status_code), Err(2));
        assert_eq!(can.peripheral().deinits, 1);

        let mut can = CanControl::new(Mock { fail_arm: true, ..Default::default() });
        assert_eq!(can.open(&TIMING, CtrlMode::empty()), Err(OpenError::ArmReceive));
        assert_eq!(can.state(), CanState::Closed);
    }

    #[test]
    fn reopen_closes_first() {
        let mut can = CanControl::new(Mock::default());
        can.open(&TIMING, CtrlMode::empty()).unwrap();
        can.open(&TIMING, CtrlMode::LOOPBACK).unwrap();
        assert_eq!(can.peripheral().inits.len(), 2);
        assert_eq!(can.peripheral().deinits, 1);
        assert!(can.peripheral().inits[1].loopback);
        assert!(can.is_open());
    }

    #[test]
    fn failed_deinit_still_closes() {
        let mut can = CanControl::new(Mock { fail_deinit: true, ..Default::default() });
        can.open(&TIMING, CtrlMode::empty()).unwrap();
        assert_eq!(can.close(), Err(CloseError::Deinit));
        assert!(!can.is_open());
        assert_eq!(can.close(), Ok(()));
    }

    #[test]
    fn transmit_status() {
        let frame = CanFrame::new(StandardId::new(0x10).unwrap(), &[1]).unwrap();
        let mut can = CanControl::new(Mock::default());
        assert_eq!(can.transmit(&frame), Err(TransmitError::Closed));

        can.open(&TIMING, CtrlMode::empty()).unwrap();
        assert_eq!(can.transmit(&frame), Ok(()));
        assert_eq!(can.peripheral().sent, [frame]);

        can.peripheral_mut().tx_status = Some(HalError::Busy);
        assert_eq!(can.transmit(&frame), Err(TransmitError::Busy));
        can.peripheral_mut().tx_status = Some(HalError::Timeout);
        assert_eq!(can.transmit(&frame), Err(TransmitError::Failed(HalError::Timeout)));
        assert_eq!(can.error_counters(), ErrorCounters { rx: 1, tx: 2 });
    }
}
