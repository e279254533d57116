use serde::Serialize;
use std::fmt;

/// Highest setup passcode the commissioning protocol accepts.
pub const PASSCODE_CEILING: u32 = 99_999_998;

/// Passcodes the protocol refuses outright regardless of the device's real one.
pub const FORBIDDEN_PASSCODES: [u32; 12] = [
    0, 11111111, 22222222, 33333333, 44444444, 55555555, 66666666, 77777777, 88888888,
    99999999, 12345678, 87654321,
];

/// A candidate setup passcode submitted to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Passcode(u32);

impl Passcode {
    pub fn new(value: u32) -> Self {
        Passcode(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn is_forbidden(self) -> bool {
        self.0 > PASSCODE_CEILING || FORBIDDEN_PASSCODES.contains(&self.0)
    }
}

impl fmt::Display for Passcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strictly increasing source of candidate passcodes, shared by every cycle of a
/// campaign.
///
/// The reserved (known-correct) passcode is never issued. With `skip_forbidden`
/// set, protocol-forbidden values are stepped over as well and the sequence ends
/// at [`PASSCODE_CEILING`]. Otherwise it ends when `u32` is exhausted; it never
/// wraps.
#[derive(Debug, Clone)]
pub struct PasscodeSequence {
    next: Option<u32>,
    reserved: u32,
    skip_forbidden: bool,
    last_issued: Option<Passcode>,
}

impl PasscodeSequence {
    pub fn new(start: u32, reserved: u32) -> Self {
        Self {
            next: Some(start),
            reserved,
            skip_forbidden: false,
            last_issued: None,
        }
    }

    pub fn skip_forbidden(mut self, skip: bool) -> Self {
        self.skip_forbidden = skip;
        self
    }

    pub fn reserved(&self) -> Passcode {
        Passcode(self.reserved)
    }

    pub fn last_issued(&self) -> Option<Passcode> {
        self.last_issued
    }

    /// Issues the next candidate, or `None` once the representable range is used up.
    pub fn next_passcode(&mut self) -> Option<Passcode> {
        loop {
            let candidate = self.next?;
            self.next = candidate.checked_add(1);

            if candidate == self.reserved {
                continue;
            }
            let passcode = Passcode(candidate);
            if self.skip_forbidden && passcode.is_forbidden() {
                if candidate > PASSCODE_CEILING {
                    self.next = None;
                    return None;
                }
                continue;
            }
            self.last_issued = Some(passcode);
            return Some(passcode);
        }
    }
}
