//! Linux SCSI generic transport (`/dev/sgN`, `SG_IO` ioctl).

use super::{Transport, TransportError};
use std::{
    ffi::{c_int, c_uchar, c_uint, c_ushort, c_void},
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd,
    ptr,
};

const SG_IO: libc::c_ulong = 0x2285;

const SG_DXFER_NONE: c_int = -1;
const SG_DXFER_TO_DEV: c_int = -2;
const SG_DXFER_FROM_DEV: c_int = -3;

const SENSE_BUFFER_LEN: usize = 32;
const TIMEOUT_MS: c_uint = 5 * 60 * 1000;

const STATUS_CHECK_CONDITION: c_uchar = 0x02;
const DRIVER_SENSE: c_ushort = 0x08;

/// `struct sg_io_hdr` from `<scsi/sg.h>`.
#[repr(C)]
struct SgIoHdr {
    interface_id: c_int,
    dxfer_direction: c_int,
    cmd_len: c_uchar,
    mx_sb_len: c_uchar,
    iovec_count: c_ushort,
    dxfer_len: c_uint,
    dxferp: *mut c_void,
    cmdp: *const c_uchar,
    sbp: *mut c_uchar,
    timeout: c_uint,
    flags: c_uint,
    pack_id: c_int,
    usr_ptr: *mut c_void,
    status: c_uchar,
    masked_status: c_uchar,
    msg_status: c_uchar,
    sb_len_wr: c_uchar,
    host_status: c_ushort,
    driver_status: c_ushort,
    resid: c_int,
    duration: c_uint,
    info: c_uint,
}

#[derive(Debug, Default)]
pub struct SgTransport {
    file: Option<File>,
}

impl SgTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for SgTransport {
    fn open(&mut self, device: &str) -> Result<(), TransportError> {
        let file = OpenOptions::new().read(true).write(true).open(device)?;
        self.file = Some(file);
        Ok(())
    }

    fn execute(
        &mut self,
        cdb: &[u8],
        data_out: Option<&[u8]>,
        read_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let file = self.file.as_ref().ok_or(TransportError::NotOpen)?;

        if data_out.is_some() && read_len > 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "bidirectional transfers are not supported",
            )
            .into());
        }

        let cmd_len = c_uchar::try_from(cdb.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "CDB too long"))?;

        let mut input = vec![0u8; read_len];
        let mut sense = [0u8; SENSE_BUFFER_LEN];

        let (direction, dxferp, dxfer_len) = match data_out {
            Some(data) => (SG_DXFER_TO_DEV, data.as_ptr() as *mut c_void, data.len()),
            None if read_len > 0 => (SG_DXFER_FROM_DEV, input.as_mut_ptr().cast(), read_len),
            None => (SG_DXFER_NONE, ptr::null_mut(), 0),
        };

        let dxfer_len = c_uint::try_from(dxfer_len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "transfer too long"))?;

        let mut hdr = SgIoHdr {
            interface_id: 'S' as c_int,
            dxfer_direction: direction,
            cmd_len,
            mx_sb_len: SENSE_BUFFER_LEN as c_uchar,
            iovec_count: 0,
            dxfer_len,
            dxferp,
            cmdp: cdb.as_ptr(),
            sbp: sense.as_mut_ptr(),
            timeout: TIMEOUT_MS,
            flags: 0,
            pack_id: 0,
            usr_ptr: ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        };

        // SAFETY: every pointer in `hdr` refers to a buffer that outlives the
        // call and whose length matches the corresponding length field.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), SG_IO as _, &mut hdr as *mut SgIoHdr) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let transferred = read_len.saturating_sub(hdr.resid.max(0) as usize);
        input.truncate(transferred);

        if hdr.status & 0x3e == STATUS_CHECK_CONDITION || hdr.driver_status & 0x0f == DRIVER_SENSE {
            let len = (hdr.sb_len_wr as usize).min(SENSE_BUFFER_LEN);
            return Err(TransportError::CheckCondition {
                sense: sense[..len].to_vec(),
                data: input,
            });
        }

        if hdr.status != 0 || hdr.host_status != 0 {
            return Err(io::Error::other(format!(
                "SCSI status 0x{:02x}, host status 0x{:04x}, driver status 0x{:04x}",
                hdr.status, hdr.host_status, hdr.driver_status
            ))
            .into());
        }

        Ok(input)
    }

    fn close(&mut self) {
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_header_layout() {
        assert_eq!(std::mem::size_of::<SgIoHdr>(), if cfg!(target_pointer_width = "64") { 88 } else { 64 });
    }

    #[test]
    fn test_execute_requires_open() {
        let mut sg = SgTransport::new();

        assert!(matches!(sg.execute(&[0; 6], None, 0), Err(TransportError::NotOpen)));
    }
}
