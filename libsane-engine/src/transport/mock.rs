//! Scripted transport for tests

use super::{Transport, TransportError};
use std::{
    collections::VecDeque,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

#[derive(Debug, Clone)]
enum MockReply {
    Data(Vec<u8>),
    Check { sense: Vec<u8>, data: Vec<u8> },
    Io,
    Panic,
}

/// One command seen by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub cdb: Vec<u8>,
    pub data_out: Option<Vec<u8>>,
    pub read_len: usize,
}

pub type ExchangeLog = Arc<Mutex<Vec<Exchange>>>;

/// Transport replaying scripted replies.
///
/// One-shot replies are consumed in order of insertion by the first command
/// whose CDB starts with the reply's prefix. Persistent replies answer every
/// matching command afterwards. Anything else gets `read_len` zero bytes.
pub struct MockTransport {
    queue: VecDeque<(Vec<u8>, MockReply)>,
    rules: Vec<(Vec<u8>, MockReply)>,
    log: ExchangeLog,
    open: Arc<AtomicBool>,
    fail_open: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            rules: Vec::new(),
            log: Arc::default(),
            open: Arc::default(),
            fail_open: false,
        }
    }

    /// Fixed format sense data with the given key and additional sense code.
    pub fn sense(key: u8, asc: u8, ascq: u8) -> Vec<u8> {
        Self::sense_with(0x70, key, 0, asc, ascq)
    }

    /// `key_and_flags` is stored as byte 2 (0x40 end of medium, 0x20 incorrect length).
    pub fn sense_with(error_code: u8, key_and_flags: u8, information: u32, asc: u8, ascq: u8) -> Vec<u8> {
        let mut sense = vec![0u8; 18];
        sense[0] = error_code;
        sense[2] = key_and_flags;
        sense[3..7].copy_from_slice(&information.to_be_bytes());
        sense[7] = 10;
        sense[12] = asc;
        sense[13] = ascq;
        sense
    }

    pub fn log(&self) -> ExchangeLog {
        Arc::clone(&self.log)
    }

    /// Shared flag telling whether the device is currently open.
    pub fn open_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.open)
    }

    pub fn fail_open(&mut self) {
        self.fail_open = true;
    }

    pub fn reply(&mut self, prefix: &[u8], data: Vec<u8>) -> &mut Self {
        self.rules.push((prefix.to_vec(), MockReply::Data(data)));
        self
    }

    pub fn check_condition(&mut self, prefix: &[u8], sense: Vec<u8>) -> &mut Self {
        self.rules.push((
            prefix.to_vec(),
            MockReply::Check {
                sense,
                data: Vec::new(),
            },
        ));
        self
    }

    pub fn push_reply(&mut self, prefix: &[u8], data: Vec<u8>) -> &mut Self {
        self.queue.push_back((prefix.to_vec(), MockReply::Data(data)));
        self
    }

    pub fn push_check_condition(&mut self, prefix: &[u8], sense: Vec<u8>) -> &mut Self {
        self.push_check_with_data(prefix, sense, Vec::new())
    }

    pub fn push_check_with_data(&mut self, prefix: &[u8], sense: Vec<u8>, data: Vec<u8>) -> &mut Self {
        self.queue
            .push_back((prefix.to_vec(), MockReply::Check { sense, data }));
        self
    }

    pub fn push_io_error(&mut self, prefix: &[u8]) -> &mut Self {
        self.queue.push_back((prefix.to_vec(), MockReply::Io));
        self
    }

    /// Panic on the next matching command, as a buggy driver would.
    pub fn push_panic(&mut self, prefix: &[u8]) -> &mut Self {
        self.queue.push_back((prefix.to_vec(), MockReply::Panic));
        self
    }

    fn find_reply(&mut self, cdb: &[u8]) -> Option<MockReply> {
        if let Some(pos) = self.queue.iter().position(|(prefix, _)| cdb.starts_with(prefix)) {
            return self.queue.remove(pos).map(|(_, reply)| reply);
        }

        self.rules
            .iter()
            .rev()
            .find(|(prefix, _)| cdb.starts_with(prefix))
            .map(|(_, reply)| reply.clone())
    }
}

impl Transport for MockTransport {
    fn open(&mut self, _device: &str) -> Result<(), TransportError> {
        if self.fail_open {
            return Err(io::Error::from(io::ErrorKind::NotFound).into());
        }

        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn execute(
        &mut self,
        cdb: &[u8],
        data_out: Option<&[u8]>,
        read_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen);
        }

        if let Ok(mut log) = self.log.lock() {
            log.push(Exchange {
                cdb: cdb.to_vec(),
                data_out: data_out.map(<[u8]>::to_vec),
                read_len,
            });
        }

        match self.find_reply(cdb) {
            Some(MockReply::Data(mut data)) => {
                data.truncate(read_len);
                Ok(data)
            }
            Some(MockReply::Check { sense, mut data }) => {
                data.truncate(read_len);
                Err(TransportError::CheckCondition { sense, data })
            }
            Some(MockReply::Io) => Err(io::Error::from(io::ErrorKind::BrokenPipe).into()),
            Some(MockReply::Panic) => panic!("scripted transport panic on CDB {cdb:02x?}"),
            None => Ok(vec![0; read_len]),
        }
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_queue_before_rules() {
        let mut mock = MockTransport::new();
        mock.reply(&[0x12], vec![1, 2, 3]);
        mock.push_reply(&[0x12], vec![9]);
        mock.open("mock").unwrap();

        assert_eq!(mock.execute(&[0x12, 0, 0, 0, 3, 0], None, 3).unwrap(), vec![9]);
        assert_eq!(mock.execute(&[0x12, 0, 0, 0, 3, 0], None, 3).unwrap(), vec![1, 2, 3]);
        assert_eq!(mock.execute(&[0x12, 0, 0, 0, 2, 0], None, 2).unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_default_reply_and_log() {
        let mut mock = MockTransport::new();
        let log = mock.log();
        mock.open("mock").unwrap();

        assert_eq!(mock.execute(&[0x28], None, 4).unwrap(), vec![0; 4]);
        mock.execute(&[0x2a], Some(&[1, 2]), 0).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].data_out, Some(vec![1, 2]));
    }

    #[test]
    fn test_closed_transport_rejects_commands() {
        let mut mock = MockTransport::new();

        assert!(matches!(mock.execute(&[0x00], None, 0), Err(TransportError::NotOpen)));
    }
}
