//! Request flags handed from interrupt context to the main loop.
//!
//! Every unit of pending work is one bit in a single word. Producers (USB and
//! CAN interrupt hooks, protocol parsers) only ever set bits. The main loop is
//! the sole consumer and services the bits in the fixed order of
//! [`DISPATCH_ORDER`].

use core::cell::Cell;

use critical_section::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Request {
    /// Answer a GET_SOFTW_HARDW_VER command.
    Version = 1 << 0,
    /// Configure and start the CAN peripheral.
    Open = 1 << 1,
    /// Tear down the CAN peripheral.
    Close = 1 << 2,
    /// Send the frame waiting in the CAN TX slot.
    Transmit = 1 << 3,
    /// Accept the next USB data message; raised once the CAN transmit completed.
    ArmData = 1 << 4,
    /// Report accumulated CAN bus errors to the host.
    Error = 1 << 5,
    /// Relay the frame waiting in the CAN RX slot to the host.
    FrameReady = 1 << 6,
    /// Light the fault indicator.
    Fault = 1 << 7,
}

impl Request {
    pub const fn mask(self) -> u32 {
        self as u32
    }
}

/// Service priority, highest first.
pub const DISPATCH_ORDER: [Request; 8] = [
    Request::Version,
    Request::Open,
    Request::Close,
    Request::Transmit,
    Request::ArmData,
    Request::Error,
    Request::FrameReady,
    Request::Fault,
];

/// Outcome of servicing one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Done,
    /// The resource was busy; keep the request pending for the next pass.
    Retry,
}

pub struct RequestFlags {
    word: Mutex<Cell<u32>>,
}

impl RequestFlags {
    pub const fn new() -> Self {
        Self { word: Mutex::new(Cell::new(0)) }
    }

    /// Marks `req` pending. Safe from any context, never blocks.
    pub fn raise(&self, req: Request) {
        critical_section::with(|cs| {
            let word = self.word.borrow(cs);
            word.set(word.get() | req.mask());
        });
    }

    pub fn is_raised(&self, req: Request) -> bool {
        self.snapshot() & req.mask() != 0
    }

    pub fn snapshot(&self) -> u32 {
        critical_section::with(|cs| self.word.borrow(cs).get())
    }

    pub fn pending(&self) -> bool {
        self.snapshot() != 0
    }

    /// Atomically tests and clears a single bit.
    fn take(&self, req: Request) -> bool {
        critical_section::with(|cs| {
            let word = self.word.borrow(cs);
            let bits = word.get();
            word.set(bits & !req.mask());
            bits & req.mask() != 0
        })
    }

    /// Services every pending request in priority order.
    ///
    /// Only the bit being serviced is cleared, right before its handler runs,
    /// so a producer raising the same request meanwhile is never lost.
    /// Requests answered with [`Dispatch::Retry`] are raised again and stay
    /// pending for the next pass. Returns the number of requests completed.
    ///
    /// Must only be called from the main loop.
    pub fn drain(&self, mut handler: impl FnMut(Request) -> Dispatch) -> usize {
        let mut done = 0;
        for req in DISPATCH_ORDER {
            if !self.take(req) {
                continue;
            }
            match handler(req) {
                Dispatch::Done => done += 1,
                Dispatch::Retry => self.raise(req),
            }
        }
        done
    }
}

impl Default for RequestFlags {
    fn default() -> Self {
        Self::new()
    }
}
