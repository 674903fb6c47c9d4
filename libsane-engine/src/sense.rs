//! Sense data parsing and classification.
//!
//! Every dialect describes its sense codes as literal tables of [`SenseRule`]s.
//! A table is scanned in order and the first matching rule wins, so catch-all
//! rules must stay at the end of the table.

use bitflags::bitflags;
use std::fmt;

/// Generic result of a device exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
pub enum Outcome {
    Ready,
    Busy,
    NoMedium,
    Jammed,
    CoverOpen,
    IoError,
    Unsupported,
    Cancelled,
    InvalidParameter,
    OutOfMemory,
    EndOfData,
}

bitflags! {
    /// Device state as last reported through sense data. Empty means ready.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceStatus: u32 {
        const Busy = 1;
        const NoDocs = 2;
        const Processing = 4;
        const Error = 8;
        const Reissue = 16;
    }
}

/// Fixed format sense data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenseData {
    pub error_code: u8,
    pub key: u8,
    pub eom: bool,
    pub ili: bool,
    pub information: u32,
    pub additional_length: u8,
    pub asc: u8,
    pub ascq: u8,
    /// Number of sense bytes the device actually returned.
    pub len: usize,
}

impl SenseData {
    pub const MIN_LEN: usize = 14;

    /// Parse sense bytes. Missing bytes read as zero, so this never fails.
    pub fn parse(raw: &[u8]) -> Self {
        let at = |i: usize| raw.get(i).copied().unwrap_or(0);

        Self {
            error_code: at(0) & 0x7f,
            key: at(2) & 0x0f,
            eom: at(2) & 0x40 != 0,
            ili: at(2) & 0x20 != 0,
            information: u32::from_be_bytes([at(3), at(4), at(5), at(6)]),
            additional_length: at(7),
            asc: at(12),
            ascq: at(13),
            len: raw.len(),
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.len < Self::MIN_LEN
    }

    /// Length announced by the device, header included.
    pub fn announced_len(&self) -> usize {
        7 + self.additional_length as usize
    }

    /// Key, ASC and ASCQ packed as `0x00KKAAQQ`.
    pub fn code(&self) -> u32 {
        (self.key as u32) << 16 | (self.asc as u32) << 8 | self.ascq as u32
    }
}

impl fmt::Display for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "error code 0x{:02x}, key 0x{:x}, asc 0x{:02x}, ascq 0x{:02x}",
            self.error_code, self.key, self.asc, self.ascq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Match {
    Any,
    Exactly(u8),
}

impl Match {
    fn matches(self, value: u8) -> bool {
        match self {
            Match::Any => true,
            Match::Exactly(expected) => expected == value,
        }
    }
}

/// One row of a sense table.
#[derive(Debug, Clone, Copy)]
pub struct SenseRule {
    pub key: Match,
    pub asc: Match,
    pub ascq: Match,
    pub outcome: Outcome,
    pub text: &'static str,
}

impl SenseRule {
    pub const fn key(key: u8, outcome: Outcome, text: &'static str) -> Self {
        Self {
            key: Match::Exactly(key),
            asc: Match::Any,
            ascq: Match::Any,
            outcome,
            text,
        }
    }

    pub const fn additional(asc: u8, ascq: u8, outcome: Outcome, text: &'static str) -> Self {
        Self {
            key: Match::Any,
            asc: Match::Exactly(asc),
            ascq: Match::Exactly(ascq),
            outcome,
            text,
        }
    }

    pub const fn key_asc(key: u8, asc: u8, outcome: Outcome, text: &'static str) -> Self {
        Self {
            key: Match::Exactly(key),
            asc: Match::Exactly(asc),
            ascq: Match::Any,
            outcome,
            text,
        }
    }

    pub const fn catch_all(outcome: Outcome, text: &'static str) -> Self {
        Self {
            key: Match::Any,
            asc: Match::Any,
            ascq: Match::Any,
            outcome,
            text,
        }
    }

    pub fn matches(&self, sense: &SenseData) -> bool {
        self.key.matches(sense.key) && self.asc.matches(sense.asc) && self.ascq.matches(sense.ascq)
    }

    pub fn is_catch_all(&self) -> bool {
        self.key == Match::Any && self.asc == Match::Any && self.ascq == Match::Any
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SenseTable(pub &'static [SenseRule]);

impl SenseTable {
    pub fn lookup(&self, sense: &SenseData) -> Option<&'static SenseRule> {
        self.0.iter().find(|rule| rule.matches(sense))
    }

    /// Classify through the table; codes without a rule become [`Outcome::IoError`].
    pub fn classify(&self, sense: &SenseData) -> Outcome {
        match self.lookup(sense) {
            Some(rule) if rule.is_catch_all() => {
                log::warn!("Undocumented sense ({sense}), treat as {}", rule.outcome);
                rule.outcome
            }
            Some(rule) => {
                log::debug!("Sense ({sense}): {}", rule.text);
                rule.outcome
            }
            None => {
                log::warn!("Unknown sense ({sense}), treat as I/O error");
                Outcome::IoError
            }
        }
    }
}

/// Dialect hook mapping sense data onto an outcome, updating the status bitmask.
pub type SenseClassifier = fn(&SenseData, &mut DeviceStatus) -> Outcome;

/// Classifier used before a dialect is known: key 0 is good, everything else fails.
pub fn generic_classifier(sense: &SenseData, status: &mut DeviceStatus) -> Outcome {
    const TABLE: SenseTable = SenseTable(&[
        SenseRule::key(0x00, Outcome::Ready, "no sense"),
        SenseRule::key(0x02, Outcome::Busy, "not ready"),
        SenseRule::key(0x06, Outcome::Ready, "unit attention"),
        SenseRule::catch_all(Outcome::IoError, "error"),
    ]);

    let outcome = TABLE.classify(sense);
    status.set(DeviceStatus::Busy, outcome == Outcome::Busy);
    status.set(DeviceStatus::Error, outcome == Outcome::IoError);

    outcome
}
