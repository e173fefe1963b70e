use embedded_can::{ExtendedId, Frame, Id, StandardId};

/// Reasons a USB message is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Transfer length differs from the fixed message size.
    BadLength { expected: usize, actual: usize },
    /// Start or end marker mismatch.
    BadMarker,
    /// Data length code above 8.
    BadDlc(u8),
    /// Command code the device does not implement.
    UnknownCommand(u8),
    /// Data message type other than CAN or error frame.
    UnknownFrameType(u8),
}

/// Classic CAN 2.0 frame, at most 8 data bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: Id,
    remote: bool,
    dlc: u8,
    data: [u8; 8],
}

impl CanFrame {
    pub const MAX_DLC: usize = 8;

    /// Builds a frame from wire fields. Identifiers are masked to 11 or 29 bits.
    pub fn from_parts(
        raw_id: u32,
        extended: bool,
        remote: bool,
        dlc: u8,
        data: [u8; 8],
    ) -> Result<Self, FrameError> {
        if dlc as usize > Self::MAX_DLC {
            return Err(FrameError::BadDlc(dlc));
        }
        let id: Id = if extended {
            ExtendedId::new(raw_id & ExtendedId::MAX.as_raw())
                .unwrap_or(ExtendedId::ZERO)
                .into()
        } else {
            StandardId::new((raw_id & StandardId::MAX.as_raw() as u32) as u16)
                .unwrap_or(StandardId::ZERO)
                .into()
        };
        let mut frame = Self { id, remote, dlc, data: [0u8; 8] };
        if !remote {
            frame.data[..dlc as usize].copy_from_slice(&data[..dlc as usize]);
        }
        Ok(frame)
    }

    /// Identifier without the standard/extended distinction.
    pub fn raw_id(&self) -> u32 {
        match self.id {
            Id::Standard(id) => id.as_raw() as u32,
            Id::Extended(id) => id.as_raw(),
        }
    }
}

impl Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > Self::MAX_DLC {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Some(Self { id: id.into(), remote: false, dlc: data.len() as u8, data: buf })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > Self::MAX_DLC {
            return None;
        }
        Some(Self { id: id.into(), remote: true, dlc: dlc as u8, data: [0u8; 8] })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..self.dlc as usize]
        }
    }
}
