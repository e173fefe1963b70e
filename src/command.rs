//! Command channel: decoding host requests and shaping their responses.

use usb8dev_protocol::{
    Command, CtrlMode, FrameError, OpenParams, Usb8devCmdMsg, CMD_ERROR, CMD_SUCCESS,
};

use crate::bittiming::BitTiming;
use crate::config::BridgeConfig;
use crate::sched::Request;

/// Work the main loop performs before answering a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    Version,
    Open { timing: BitTiming, mode: CtrlMode },
    Close,
}

impl CommandAction {
    pub const fn request(&self) -> Request {
        match self {
            CommandAction::Version => Request::Version,
            CommandAction::Open { .. } => Request::Open,
            CommandAction::Close => Request::Close,
        }
    }
}

/// A decoded command together with the response that will answer it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommand {
    pub response: Usb8devCmdMsg,
    pub action: CommandAction,
}

/// Validates a command transfer and decodes what it asks for.
///
/// Only OPEN, CLOSE and GET_SOFTW_HARDW_VER are implemented, every other
/// code is rejected like a malformed frame.
pub fn parse_command(buf: &[u8], config: &BridgeConfig) -> Result<PendingCommand, FrameError> {
    let msg = Usb8devCmdMsg::parse(buf)?;
    let mut response = msg.response();

    let action = match msg.command() {
        Ok(Command::GetSoftwHardwVer) => {
            response.data[..4].copy_from_slice(&config.version().encode());
            CommandAction::Version
        }
        Ok(Command::Open) => {
            let params = OpenParams::decode(&msg.data);
            CommandAction::Open {
                timing: BitTiming::from_host(&params, config),
                mode: params.ctrl_mode(),
            }
        }
        Ok(Command::Close) => CommandAction::Close,
        Ok(other) => return Err(FrameError::UnknownCommand(other as u8)),
        Err(code) => return Err(FrameError::UnknownCommand(code)),
    };

    Ok(PendingCommand { response, action })
}

/// Maps an internal status code to the response's opt1 byte.
pub const fn response_status(code: u8) -> u8 {
    if code == 0 {
        CMD_SUCCESS
    } else {
        CMD_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usb8dev_protocol::CMD_PAYLOAD_SIZE;

    fn raw(command: u8, opt1: u8, opt2: u8, data: [u8; CMD_PAYLOAD_SIZE]) -> [u8; 16] {
        let mut msg = Usb8devCmdMsg::new(Command::Reset, data);
        msg.command = command;
        msg.opt1 = opt1;
        msg.opt2 = opt2;
        msg.encode()
    }

    #[test]
    fn version_fills_payload() {
        let cmd = parse_command(&raw(12, 0, 0, [0xff; 10]), &BridgeConfig::default()).unwrap();
        assert_eq!(cmd.action, CommandAction::Version);
        assert_eq!(cmd.action.request(), Request::Version);
        assert_eq!(cmd.response.data, [0, 1, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn open_decodes_timing_and_mode() {
        let data = [6, 4, 2, 0x00, 0x0a, 0, 0, 0, 0x05, 0];
        let cmd = parse_command(&raw(2, 0, 0x33, data), &BridgeConfig::default()).unwrap();
        assert_eq!(
            cmd.action,
            CommandAction::Open {
                timing: BitTiming { sjw: 1, ts1: 5, ts2: 3, brp: 15 },
                mode: CtrlMode::SILENT | CtrlMode::ONE_SHOT,
            }
        );
        assert_eq!(cmd.response.command, 2);
        assert_eq!(cmd.response.opt2, 0x33);
        assert_eq!(cmd.response.data, [0u8; CMD_PAYLOAD_SIZE]);
    }

    #[test]
    fn close() {
        let cmd = parse_command(&raw(3, 0, 0, [0; 10]), &BridgeConfig::default()).unwrap();
        assert_eq!(cmd.action.request(), Request::Close);
    }

    #[test]
    fn unused_codes_are_rejected() {
        let config = BridgeConfig::default();
        for code in [0u8, 1, 4, 5, 6, 7, 8, 9, 10, 11, 13, 0xff] {
            assert_eq!(
                parse_command(&raw(code, 0, 0, [0; 10]), &config),
                Err(FrameError::UnknownCommand(code))
            );
        }
    }

    #[test]
    fn bad_end_marker() {
        let mut buf = raw(12, 0, 0, [0; 10]);
        buf[15] = 0;
        assert_eq!(parse_command(&buf, &BridgeConfig::default()), Err(FrameError::BadMarker));
        assert!(matches!(
            parse_command(&buf[..8], &BridgeConfig::default()),
            Err(FrameError::BadLength { expected: 16, actual: 8 })
        ));
    }

    #[test]
    fn status_byte() {
        assert_eq!(response_status(0), 0);
        assert_eq!(response_status(1), 255);
        assert_eq!(response_status(3), 255);
    }
}
