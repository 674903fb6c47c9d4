//! Generic SCSI scanner commands.
//!
//! Builders here produce the standard layouts shared by every scanner family.
//! Device specific layouts (windows, vendor commands) live in the dialects.

use crate::{
    encode::CommandBlock,
    result::{Result, SaneError},
};
use bstr::BString;
use std::fmt;

/// SCSI operation codes.
pub mod opcode {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SELECT_6: u8 = 0x15;
    pub const RESERVE_UNIT: u8 = 0x16;
    pub const RELEASE_UNIT: u8 = 0x17;
    pub const MODE_SENSE_6: u8 = 0x1a;
    pub const SCAN: u8 = 0x1b;
    pub const SET_WINDOW: u8 = 0x24;
    pub const GET_WINDOW: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const SEND_10: u8 = 0x2a;
    pub const OBJECT_POSITION: u8 = 0x31;
    pub const GET_DATA_BUFFER_STATUS: u8 = 0x34;
}

/// Peripheral device types reported by INQUIRY.
pub mod device_type {
    pub const PROCESSOR: u8 = 0x03;
    pub const SCANNER: u8 = 0x06;
}

/// Sense keys.
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x0;
    pub const RECOVERED_ERROR: u8 = 0x1;
    pub const NOT_READY: u8 = 0x2;
    pub const MEDIUM_ERROR: u8 = 0x3;
    pub const HARDWARE_ERROR: u8 = 0x4;
    pub const ILLEGAL_REQUEST: u8 = 0x5;
    pub const UNIT_ATTENTION: u8 = 0x6;
    pub const ABORTED_COMMAND: u8 = 0xb;
}

/// A command ready for the transport.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    pub cdb: Vec<u8>,
    pub data_out: Option<Vec<u8>>,
    pub read_len: usize,
}

impl Command {
    pub fn new(cdb: CommandBlock) -> Self {
        Self {
            cdb: cdb.into_bytes(),
            data_out: None,
            read_len: 0,
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data_out = Some(data);
        self
    }

    pub fn reading(mut self, len: usize) -> Self {
        self.read_len = len;
        self
    }

    pub fn opcode(&self) -> u8 {
        self.cdb.first().copied().unwrap_or(0)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("cdb", &format_args!("{:02x?}", self.cdb))
            .field("data_out", &self.data_out.as_ref().map(Vec::len))
            .field("read_len", &self.read_len)
            .finish()
    }
}

/// One page of a MODE SELECT parameter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModePage {
    pub code: u8,
    pub params: [u8; 6],
}

impl ModePage {
    pub const MEASUREMENT_UNIT: u8 = 0x03;
    pub const WHITE_BALANCE: u8 = 0x20;
    pub const ADF_CONTROL: u8 = 0x26;
    pub const ENDORSER_CONTROL: u8 = 0x27;
    pub const SCAN_WAIT: u8 = 0x2b;

    /// Basic measurement unit (0 inch, 1 mm, 2 point) and its divisor.
    pub fn measurement_unit(bmu: u8, mud: u16) -> Self {
        let [hi, lo] = mud.to_be_bytes();
        Self {
            code: Self::MEASUREMENT_UNIT,
            params: [bmu, 0, hi, lo, 0, 0],
        }
    }

    pub fn white_balance(absolute: bool) -> Self {
        Self {
            code: Self::WHITE_BALANCE,
            params: [absolute as u8, 0, 0, 0, 0, 0],
        }
    }

    /// `selection`: 0 flatbed, 1 simplex feeder, 2 duplex feeder.
    pub fn adf_control(selection: u8, prefeed: bool, medium_wait: u8) -> Self {
        Self {
            code: Self::ADF_CONTROL,
            params: [selection, if prefeed { 0x04 } else { 0 }, medium_wait, 0, 0, 0],
        }
    }

    pub fn endorser_control(enabled: bool) -> Self {
        Self {
            code: Self::ENDORSER_CONTROL,
            params: [enabled as u8, 0, 0, 0, 0, 0],
        }
    }

    pub fn scan_wait(enabled: bool) -> Self {
        Self {
            code: Self::SCAN_WAIT,
            params: [enabled as u8, 0, 0, 0, 0, 0],
        }
    }

    /// Mode parameter header (all zero) followed by the page.
    pub fn parameter_list(&self) -> Vec<u8> {
        let mut list = vec![0, 0, 0, 0, self.code & 0x3f, self.params.len() as u8];
        list.extend_from_slice(&self.params);
        list
    }
}

/// Device independent description of what a dialect must encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    TestUnitReady,
    RequestSense,
    Inquiry,
    PageInquiry(u8),
    Reserve,
    Release,
    ModeSelect(ModePage),
    SetWindow,
    GetWindow,
    TriggerScan,
    BufferStatus,
    ReadImage(usize),
    ReadData { dtc: u8, len: usize },
    LoadMedia,
    EjectMedia,
    ResetMedia,
    ObjectPosition { load: bool },
    Focus(u32),
    Autofocus { x: u32, y: u32 },
    ReadFocus,
    GetExposure(u8),
    SendGamma,
    SendLut(u8),
    SendEndorser(BString),
    Calibrate,
    Execute,
    Abort,
}

pub const SENSE_LEN: usize = 18;
pub const INQUIRY_LEN: usize = 96;

pub fn test_unit_ready() -> Command {
    Command::new(CommandBlock::new(6))
}

pub fn request_sense(len: u8) -> Result<Command> {
    let cdb = CommandBlock::new(6)
        .byte(0, opcode::REQUEST_SENSE)?
        .byte(4, len)?;
    Ok(Command::new(cdb).reading(len as usize))
}

pub fn inquiry(len: u8) -> Result<Command> {
    let cdb = CommandBlock::new(6).byte(0, opcode::INQUIRY)?.byte(4, len)?;
    Ok(Command::new(cdb).reading(len as usize))
}

/// INQUIRY with the EVPD bit set.
pub fn page_inquiry(page: u8, len: u8) -> Result<Command> {
    let cdb = CommandBlock::new(6)
        .byte(0, opcode::INQUIRY)?
        .byte(1, 0x01)?
        .byte(2, page)?
        .byte(4, len)?;
    Ok(Command::new(cdb).reading(len as usize))
}

pub fn reserve_unit() -> Result<Command> {
    Ok(Command::new(CommandBlock::new(6).byte(0, opcode::RESERVE_UNIT)?))
}

pub fn release_unit() -> Result<Command> {
    Ok(Command::new(CommandBlock::new(6).byte(0, opcode::RELEASE_UNIT)?))
}

/// MODE SELECT(6) with the page format bit.
pub fn mode_select(page: &ModePage) -> Result<Command> {
    let data = page.parameter_list();
    let len = u64::try_from(data.len()).map_err(|_| SaneError::Inval)?;

    let cdb = CommandBlock::new(6)
        .byte(0, opcode::MODE_SELECT_6)?
        .byte(1, 0x10)?
        .field(4, 1, len)?;

    Ok(Command::new(cdb).with_data(data))
}

pub fn mode_sense(page: u8, len: u8) -> Result<Command> {
    let cdb = CommandBlock::new(6)
        .byte(0, opcode::MODE_SENSE_6)?
        .byte(2, page & 0x3f)?
        .byte(4, len)?;
    Ok(Command::new(cdb).reading(len as usize))
}

/// SCAN, optionally followed by the list of windows to acquire.
pub fn scan(window_ids: &[u8]) -> Result<Command> {
    let cdb = CommandBlock::new(6)
        .byte(0, opcode::SCAN)?
        .field(4, 1, window_ids.len() as u64)?;

    let command = Command::new(cdb);
    if window_ids.is_empty() {
        Ok(command)
    } else {
        Ok(command.with_data(window_ids.to_vec()))
    }
}

pub fn set_window(window: Vec<u8>) -> Result<Command> {
    let cdb = CommandBlock::new(10)
        .byte(0, opcode::SET_WINDOW)?
        .field(6, 3, window.len() as u64)?;
    Ok(Command::new(cdb).with_data(window))
}

pub fn get_window(window_id: u8, len: usize) -> Result<Command> {
    let cdb = CommandBlock::new(10)
        .byte(0, opcode::GET_WINDOW)?
        .byte(5, window_id)?
        .field(6, 3, len as u64)?;
    Ok(Command::new(cdb).reading(len))
}

pub fn read_10(dtc: u8, dtq: u16, len: usize) -> Result<Command> {
    let cdb = CommandBlock::new(10)
        .byte(0, opcode::READ_10)?
        .byte(2, dtc)?
        .field(4, 2, dtq as u64)?
        .field(6, 3, len as u64)?;
    Ok(Command::new(cdb).reading(len))
}

pub fn send_10(dtc: u8, dtq: u16, data: Vec<u8>) -> Result<Command> {
    let cdb = CommandBlock::new(10)
        .byte(0, opcode::SEND_10)?
        .byte(2, dtc)?
        .field(4, 2, dtq as u64)?
        .field(6, 3, data.len() as u64)?;
    Ok(Command::new(cdb).with_data(data))
}

/// OBJECT POSITION: 1 loads (feeds) a sheet, 0 unloads it.
pub fn object_position(load: bool) -> Result<Command> {
    let cdb = CommandBlock::new(10)
        .byte(0, opcode::OBJECT_POSITION)?
        .byte(1, load as u8)?;
    Ok(Command::new(cdb))
}

pub fn get_data_buffer_status(wait: bool, len: u16) -> Result<Command> {
    let cdb = CommandBlock::new(10)
        .byte(0, opcode::GET_DATA_BUFFER_STATUS)?
        .byte(1, wait as u8)?
        .field(7, 2, len as u64)?;
    Ok(Command::new(cdb).reading(len as usize))
}

/// Encode the operations whose layout is identical on every device.
pub fn encode_standard(op: &Operation) -> Result<Command> {
    match op {
        Operation::TestUnitReady => Ok(test_unit_ready()),
        Operation::RequestSense => request_sense(SENSE_LEN as u8),
        Operation::Inquiry => inquiry(INQUIRY_LEN as u8),
        Operation::PageInquiry(page) => page_inquiry(*page, 0xff),
        Operation::Reserve => reserve_unit(),
        Operation::Release => release_unit(),
        Operation::ModeSelect(page) => mode_select(page),
        Operation::ReadImage(len) => read_10(0, 0, *len),
        Operation::ReadData { dtc, len } => read_10(*dtc, 0, *len),
        Operation::ObjectPosition { load } => object_position(*load),
        _ => Err(SaneError::Unsupported),
    }
}
