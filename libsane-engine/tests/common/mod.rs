#![allow(dead_code)]

use libsane_engine::{transport::mock::Exchange, SaneError, Session};
use std::sync::{Arc, Mutex};

pub fn teco_inquiry() -> Vec<u8> {
    let mut raw = vec![0u8; 96];
    raw[0] = 0x06;
    raw[4] = 91;
    raw[8..16].copy_from_slice(b"TECO    ");
    raw[16..32].copy_from_slice(b"VM3552          ");
    raw[32..36].copy_from_slice(b"1.00");
    raw[0x2a..0x35].copy_from_slice(b"TECO VM3552");
    raw
}

pub fn ricoh_inquiry() -> Vec<u8> {
    let mut raw = vec![0u8; 96];
    raw[0] = 0x06;
    raw[4] = 91;
    raw[8..16].copy_from_slice(b"RICOH   ");
    raw[16..32].copy_from_slice(b"IS450           ");
    raw[32..36].copy_from_slice(b"1R08");
    raw
}

/// Vital product data: duplex feeder and endorser.
pub fn ricoh_vpd_page() -> Vec<u8> {
    let mut raw = vec![0u8; 16];
    raw[..8].copy_from_slice(&[0x06, 0xc0, 0x00, 0x0c, 0x02, 0x01, 0x00, 0x37]);
    raw
}

/// JIS page: 400 dpi basic resolution, 100..800 dpi.
pub fn ricoh_jis_page() -> Vec<u8> {
    vec![
        0x06, 0xf0, 0x00, 0x00, 0x19, 0x01, 0x90, 0x01, 0x90, 0x11, 0x03, 0x20, 0x03, 0x20, 0x00, 0x64, 0x00,
        0x64, 0x3f, 0xff, 0x00, 0x00, 0x12, 0xb3, 0x00, 0x00, 0x1a, 0x93, 0x0e, 0x00,
    ]
}

pub fn nikon_inquiry() -> Vec<u8> {
    let mut raw = vec![0u8; 36];
    raw[0] = 0x06;
    raw[4] = 31;
    raw[8..16].copy_from_slice(b"Nikon   ");
    raw[16..32].copy_from_slice(b"LS-4000 ED      ");
    raw[32..36].copy_from_slice(b"1.02");
    raw
}

/// Device page of an LS-4000: 4000 dpi, 3946 x 5959 pixels, one frame.
pub fn nikon_device_page() -> Vec<u8> {
    let mut page = vec![0u8; 84];
    page[1] = 0xc1;
    page[3] = 80;
    page[18..24].copy_from_slice(&[0x0f, 0xa0, 0x0f, 0xa0, 0x03, 0xe8]);
    page[36..40].copy_from_slice(&3946u32.to_be_bytes());
    page[40..46].copy_from_slice(&[0x0f, 0xa0, 0x0f, 0xa0, 0x03, 0xe8]);
    page[58..62].copy_from_slice(&5959u32.to_be_bytes());
    page[75] = 1;
    page[76..80].copy_from_slice(&[0x00, 0x00, 0x0c, 0x80]);
    page[82] = 14;
    page
}

/// Read the current frame until end of data.
pub fn read_frame(session: &mut Session) -> Result<Vec<u8>, SaneError> {
    let mut image = Vec::new();
    let mut buf = [0u8; 333];

    loop {
        match session.read(&mut buf) {
            Ok(count) => image.extend_from_slice(&buf[..count]),
            Err(SaneError::EOF) => return Ok(image),
            Err(err) => return Err(err),
        }
    }
}

pub fn opcodes(log: &Arc<Mutex<Vec<Exchange>>>) -> Vec<u8> {
    log.lock().unwrap().iter().map(|exchange| exchange.cdb[0]).collect()
}

pub fn count(log: &Arc<Mutex<Vec<Exchange>>>, opcode: u8) -> usize {
    opcodes(log).into_iter().filter(|op| *op == opcode).count()
}
