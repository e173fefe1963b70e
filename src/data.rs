//! Data channel message building and parsing.

use usb8dev_protocol::{CanFrame, ErrorCounters, FrameError, Usb8devInMsg, Usb8devOutMsg};

use crate::can::CanErrorFlags;

/// Decodes a host data transfer into the frame to put on the bus.
pub fn parse_incoming_frame(buf: &[u8]) -> Result<CanFrame, FrameError> {
    Usb8devOutMsg::parse(buf)?.to_can_frame()
}

/// Device to host message relaying a received frame.
pub fn can_frame_message(frame: &CanFrame, timestamp_ms: u32) -> Usb8devInMsg {
    Usb8devInMsg::can_frame(frame, timestamp_ms)
}

/// Device to host error report covering every flag in `errors`.
pub fn error_message(errors: CanErrorFlags, counters: ErrorCounters, timestamp_ms: u32) -> Usb8devInMsg {
    Usb8devInMsg::error_frame(errors.to_error_code(), counters, timestamp_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use usb8dev_protocol::embedded_can::{ExtendedId, Frame, Id, StandardId};
    use usb8dev_protocol::{ErrorCode, FrameType, MessageFlags};

    #[test]
    fn scenario_standard_frame_to_host() {
        let frame = CanFrame::new(StandardId::new(0x123).unwrap(), &[0xaa, 0xbb]).unwrap();
        let bytes = can_frame_message(&frame, 0).encode();
        assert_eq!(bytes[1], FrameType::CanFrame as u8);
        assert_eq!(bytes[2], 0x00);
        assert_eq!(bytes[3..7], [0x00, 0x00, 0x01, 0x23]);
        assert_eq!(bytes[7], 2);
        assert_eq!(bytes[8..10], [0xaa, 0xbb]);
    }

    #[test]
    fn extended_remote_to_host() {
        let id = ExtendedId::new(0x1234_5678).unwrap();
        let frame = CanFrame::new_remote(id, 4).unwrap();
        let msg = can_frame_message(&frame, 77);
        assert_eq!(msg.flags(), MessageFlags::EXT_ID | MessageFlags::RTR);
        assert_eq!(msg.id(), 0x1234_5678);
        assert_eq!(msg.timestamp(), 77);
        assert_eq!(msg.to_can_frame(), Ok(frame));
    }

    #[test]
    fn incoming_frame() {
        let bytes = [0x55, 0x01, 0x00, 0x00, 0x07, 0xff, 8, 1, 2, 3, 4, 5, 6, 7, 8, 0xaa];
        let frame = parse_incoming_frame(&bytes).unwrap();
        assert_eq!(frame.id(), Id::from(ExtendedId::new(0x7ff).unwrap()));
        assert_eq!(frame.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn incoming_zero_length() {
        let bytes = [0x55, 0x00, 0, 0, 0, 0x42, 0, 9, 9, 9, 9, 9, 9, 9, 9, 0xaa];
        let frame = parse_incoming_frame(&bytes).unwrap();
        assert_eq!(frame.dlc(), 0);
        assert!(frame.data().is_empty());
    }

    #[test]
    fn incoming_rejects_malformed() {
        let mut bytes = [0x55, 0x00, 0, 0, 0, 0x42, 2, 0, 0, 0, 0, 0, 0, 0, 0, 0xaa];
        assert_eq!(
            parse_incoming_frame(&bytes[..15]),
            Err(FrameError::BadLength { expected: 16, actual: 15 })
        );
        bytes[0] = 0x54;
        assert_eq!(parse_incoming_frame(&bytes), Err(FrameError::BadMarker));
        bytes[0] = 0x55;
        bytes[6] = 15;
        assert_eq!(parse_incoming_frame(&bytes), Err(FrameError::BadDlc(15)));
    }

    #[test]
    fn error_report_picks_highest_flag() {
        let errors = CanErrorFlags::EPV | CanErrorFlags::BOF;
        let msg = error_message(errors, ErrorCounters { rx: 0, tx: 248 }, 3);
        assert_eq!(msg.error_code(), ErrorCode::BusOff);
        assert_eq!(msg.frame_type(), Ok(FrameType::ErrorFrame));
        let bytes = msg.encode();
        assert_eq!(bytes[2], MessageFlags::ERR.bits());
        assert_eq!(bytes[7], 4);
        assert_eq!(bytes[8..12], [0x04, 0, 0, 248]);
    }
}
