//! Command transport seam.
//!
//! - [`sg`] talks to Linux SCSI generic devices
//! - [`mock`] replays scripted replies for tests
//!
//! Dialects never see a [`Transport`] directly, they go through a [`Link`]
//! which classifies CHECK CONDITION replies with the dialect's sense tables.

pub mod mock;

#[cfg(target_os = "linux")]
pub mod sg;

use crate::{
    command::Command,
    result::{from_outcome, Result, SaneError},
    sense::{generic_classifier, DeviceStatus, Outcome, SenseClassifier, SenseData},
};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("check condition, {} sense bytes", sense.len())]
    CheckCondition { sense: Vec<u8>, data: Vec<u8> },

    #[error("transport is not open")]
    NotOpen,
}

/// Byte pipe to a device. Partial reads are not errors.
pub trait Transport: Send {
    fn open(&mut self, device: &str) -> ::core::result::Result<(), TransportError>;

    fn execute(
        &mut self,
        cdb: &[u8],
        data_out: Option<&[u8]>,
        read_len: usize,
    ) -> ::core::result::Result<Vec<u8>, TransportError>;

    fn close(&mut self);
}

/// Result of one exchange after sense classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub data: Vec<u8>,
    pub sense: Option<SenseData>,
    pub outcome: Outcome,
}

pub struct Link {
    transport: Box<dyn Transport>,
    classifier: SenseClassifier,
    status: DeviceStatus,
    last_sense: Option<SenseData>,
    device: Option<String>,
}

impl Link {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            classifier: generic_classifier,
            status: DeviceStatus::empty(),
            last_sense: None,
            device: None,
        }
    }

    pub fn with_classifier(mut self, classifier: SenseClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn set_classifier(&mut self, classifier: SenseClassifier) {
        self.classifier = classifier;
    }

    pub fn open(&mut self, device: &str) -> Result<()> {
        if self.device.as_deref() == Some(device) {
            return Ok(());
        }

        log::trace!("Open transport '{device}'");
        self.transport.open(device).map_err(|err| {
            log::warn!("Failed to open '{device}': {err}");
            match err {
                TransportError::Io(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                    SaneError::AccessDenied
                }
                _ => SaneError::IO,
            }
        })?;

        self.device = Some(device.to_owned());
        self.status = DeviceStatus::empty();

        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(device) = self.device.take() {
            log::trace!("Close transport '{device}'");
            self.transport.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn last_sense(&self) -> Option<&SenseData> {
        self.last_sense.as_ref()
    }

    /// Send a command and classify the reply. Transport failures are `IO`
    /// errors; device check conditions are returned as a [`Reply`].
    pub fn exchange(&mut self, command: &Command) -> Result<Reply> {
        if self.device.is_none() {
            return Err(SaneError::IO);
        }

        log::trace!(
            "Execute CDB {:02x?}, {} bytes out, {} bytes in",
            command.cdb,
            command.data_out.as_ref().map_or(0, Vec::len),
            command.read_len,
        );

        self.status = DeviceStatus::empty();

        let result = self.transport.execute(
            &command.cdb,
            command.data_out.as_deref(),
            command.read_len,
        );

        match result {
            Ok(data) => {
                self.last_sense = None;
                Ok(Reply {
                    data,
                    sense: None,
                    outcome: Outcome::Ready,
                })
            }
            Err(TransportError::CheckCondition { sense, data }) => {
                let sense = SenseData::parse(&sense);
                let outcome = (self.classifier)(&sense, &mut self.status);

                log::debug!("Command 0x{:02x} check condition: {sense} -> {outcome}", command.opcode());

                self.last_sense = Some(sense);
                Ok(Reply {
                    data,
                    sense: Some(sense),
                    outcome,
                })
            }
            Err(err) => {
                log::warn!("Command 0x{:02x} failed: {err}", command.opcode());
                self.status = DeviceStatus::Error;
                Err(SaneError::IO)
            }
        }
    }

    /// Send a command, failing on anything but a ready outcome.
    pub fn run(&mut self, command: &Command) -> Result<Vec<u8>> {
        let reply = self.exchange(command)?;
        from_outcome(reply.outcome)?;
        Ok(reply.data)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}
