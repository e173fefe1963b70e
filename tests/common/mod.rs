#![allow(dead_code)]

use usb8dev::bittiming::CanConfig;
use usb8dev::can::{CanPeripheral, Filter, HalError, HalResult, RxArm};
use usb8dev::protocol::{
    CanFrame, Command, ErrorCounters, Usb8devCmdMsg, Usb8devInMsg, CMD_MSG_SIZE,
    CMD_PAYLOAD_SIZE, IN_MSG_SIZE,
};
use usb8dev::usb::{Clock, Indicator, UsbBulk, UsbError, UsbResult};
use usb8dev::{Bridge, BridgeConfig, Shared};

pub type TestBridge<'a> = Bridge<'a, MockCan, MockUsb, MockClock, MockLed>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn shared() -> Shared {
    init_logging();
    Shared::new(BridgeConfig::default())
}

pub fn bridge(shared: &Shared) -> TestBridge<'_> {
    Bridge::new(shared, MockCan::default(), MockUsb::default(), MockClock(0x0403_0201), MockLed::default())
}

pub fn command(command: Command, opt1: u8, opt2: u8, data: [u8; CMD_PAYLOAD_SIZE]) -> [u8; CMD_MSG_SIZE] {
    let mut msg = Usb8devCmdMsg::new(command, data);
    msg.opt1 = opt1;
    msg.opt2 = opt2;
    msg.encode()
}

/// OPEN with ts1=6 ts2=4 sjw=2 brp=10 as the host sends it.
pub fn open_command(ctrl_mode: u8) -> [u8; CMD_MSG_SIZE] {
    command(Command::Open, 0x09, 0, [6, 4, 2, 0x00, 0x0a, 0, 0, 0, ctrl_mode, 0])
}

pub fn data_out(flags: u8, id: u32, dlc: u8, data: [u8; 8]) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0] = 0x55;
    buf[1] = flags;
    buf[2..6].copy_from_slice(&id.to_be_bytes());
    buf[6] = dlc;
    buf[7..15].copy_from_slice(&data);
    buf[15] = 0xaa;
    buf
}

#[derive(Default)]
pub struct MockCan {
    pub fail_init: bool,
    pub fail_deinit: bool,
    /// Results handed out by `transmit`, front first. Empty means success.
    pub tx_results: Vec<HalResult<()>>,
    pub inits: Vec<CanConfig>,
    pub deinits: usize,
    pub sent: Vec<CanFrame>,
    pub counters: ErrorCounters,
}

impl CanPeripheral for MockCan {
    fn init(&mut self, config: &CanConfig) -> HalResult<()> {
        self.inits.push(*config);
        if self.fail_init {
            Err(HalError::Timeout)
        } else {
            Ok(())
        }
    }

    fn configure_filter(&mut self, _filter: Filter) -> HalResult<()> {
        Ok(())
    }

    fn arm_receive(&mut self) -> HalResult<()> {
        Ok(())
    }

    fn deinit(&mut self) -> HalResult<()> {
        self.deinits += 1;
        if self.fail_deinit {
            Err(HalError::Error)
        } else {
            Ok(())
        }
    }

    fn transmit(&mut self, frame: &CanFrame) -> HalResult<()> {
        let result = if self.tx_results.is_empty() { Ok(()) } else { self.tx_results.remove(0) };
        if result.is_ok() {
            self.sent.push(*frame);
        }
        result
    }

    fn error_counters(&self) -> ErrorCounters {
        self.counters
    }
}

#[derive(Default)]
pub struct MockUsb {
    pub cmd_tx: Vec<[u8; CMD_MSG_SIZE]>,
    pub data_tx: Vec<[u8; IN_MSG_SIZE]>,
    pub cmd_arms: usize,
    pub data_arms: usize,
    /// Number of upcoming IN transfers answered with `Busy`.
    pub cmd_busy: usize,
    pub data_busy: usize,
}

impl MockUsb {
    pub fn responses(&self) -> Vec<Usb8devCmdMsg> {
        self.cmd_tx.iter().map(|b| Usb8devCmdMsg::parse(b).unwrap()).collect()
    }

    pub fn data(&self) -> Vec<Usb8devInMsg> {
        self.data_tx.iter().map(|b| Usb8devInMsg::parse(b).unwrap()).collect()
    }
}

impl UsbBulk for MockUsb {
    fn transmit_command(&mut self, msg: &[u8; CMD_MSG_SIZE]) -> UsbResult<()> {
        if self.cmd_busy > 0 {
            self.cmd_busy -= 1;
            return Err(UsbError::Busy);
        }
        self.cmd_tx.push(*msg);
        Ok(())
    }

    fn transmit_data(&mut self, msg: &[u8; IN_MSG_SIZE]) -> UsbResult<()> {
        if self.data_busy > 0 {
            self.data_busy -= 1;
            return Err(UsbError::Busy);
        }
        self.data_tx.push(*msg);
        Ok(())
    }

    fn arm_command_receive(&mut self) -> UsbResult<()> {
        self.cmd_arms += 1;
        Ok(())
    }

    fn arm_data_receive(&mut self) -> UsbResult<()> {
        self.data_arms += 1;
        Ok(())
    }
}

pub struct MockClock(pub u32);

impl Clock for MockClock {
    fn now_ms(&self) -> u32 {
        self.0
    }
}

#[derive(Default)]
pub struct MockLed {
    pub faults: usize,
}

impl Indicator for MockLed {
    fn fault(&mut self) {
        self.faults += 1;
    }
}

#[derive(Default)]
pub struct MockRx {
    pub arms: usize,
}

impl RxArm for MockRx {
    fn arm_receive(&mut self) -> HalResult<()> {
        self.arms += 1;
        Ok(())
    }
}
