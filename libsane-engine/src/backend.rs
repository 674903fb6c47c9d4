use crate::{
    command::{self, Operation},
    device::{DeviceProfile, Inquiry},
    dialect::DialectKind,
    result::{Result, SaneError},
    session::{ReaderConfig, Session},
    transport::{Link, Transport},
};
use bstr::BStr;
use std::{fmt::Debug, ops::Deref};

/// Registry of attached devices.
#[derive(Default)]
pub struct Backend {
    devices: Vec<Attached>,
}

struct Attached {
    profile: DeviceProfile,
    reader: ReaderConfig,
}

/// Attached device as listed by the registry.
#[derive(Debug, Clone, Copy)]
pub struct Device<'b> {
    profile: &'b DeviceProfile,
    pub reader: ReaderConfig,
}

impl Deref for Device<'_> {
    type Target = DeviceProfile;

    fn deref(&self) -> &Self::Target {
        self.profile
    }
}

impl std::fmt::Display for Device<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self.profile, f)
    }
}

impl Backend {
    pub fn new() -> Self {
        log::trace!("Call Backend::new()");
        Self::default()
    }

    /// Identify the device behind `path` and remember its profile.
    pub fn attach(&mut self, path: &str, transport: Box<dyn Transport>) -> Result<&DeviceProfile> {
        log::trace!("Call Backend::attach('{path}')");

        self.probe(path, transport, |inquiry| {
            DialectKind::detect(inquiry).ok_or_else(|| {
                log::debug!(
                    "No dialect for '{}' '{}' at '{path}'",
                    inquiry.vendor,
                    inquiry.product
                );
                SaneError::Unsupported
            })
        })
    }

    /// Attach with a dialect chosen by configuration instead of INQUIRY.
    pub fn attach_with(
        &mut self,
        path: &str,
        kind: DialectKind,
        transport: Box<dyn Transport>,
    ) -> Result<&DeviceProfile> {
        log::trace!("Call Backend::attach_with('{path}', {kind})");
        self.probe(path, transport, |_| Ok(kind))
    }

    fn probe<F>(&mut self, path: &str, transport: Box<dyn Transport>, pick: F) -> Result<&DeviceProfile>
    where
        F: FnOnce(&Inquiry) -> Result<DialectKind>,
    {
        let mut link = Link::new(transport);
        link.open(path)?;

        let profile = command::encode_standard(&Operation::Inquiry)
            .and_then(|inquiry| link.run(&inquiry))
            .and_then(|raw| Inquiry::parse(&raw))
            .and_then(|inquiry| {
                let kind = pick(&inquiry)?;
                log::debug!("Probe '{path}' as {kind}");
                kind.probe(&mut link, &inquiry, path)
            });

        link.close();
        let profile = profile?;

        log::debug!("Attached {profile}");

        let index = match self.devices.iter().position(|device| device.profile.name == path) {
            Some(index) => {
                self.devices[index].profile = profile;
                index
            }
            None => {
                self.devices.push(Attached {
                    profile,
                    reader: ReaderConfig::default(),
                });
                self.devices.len() - 1
            }
        };

        Ok(&self.devices[index].profile)
    }

    /// Read configuration used by sessions opened on `name`.
    pub fn set_reader_config<N>(&mut self, name: N, reader: ReaderConfig) -> Result<()>
    where
        N: AsRef<[u8]>,
    {
        let device = self
            .devices
            .iter_mut()
            .find(|device| BStr::new(device.profile.name.as_bytes()) == BStr::new(&name))
            .ok_or(SaneError::Inval)?;

        device.reader = reader;
        Ok(())
    }

    pub fn get_all_devices(&self) -> Vec<Device<'_>> {
        log::trace!("Call Backend::get_all_devices()");
        self.devices.iter().map(Attached::device).collect()
    }

    pub fn find_device_by_name<N>(&self, name: N) -> Option<Device<'_>>
    where
        N: AsRef<[u8]>,
    {
        self.devices
            .iter()
            .map(Attached::device)
            .find(|device| BStr::new(device.name.as_bytes()) == BStr::new(&name))
    }

    /// Open a session on an attached device.
    pub fn open<N>(&self, name: N, transport: Box<dyn Transport>) -> Result<Session>
    where
        N: AsRef<[u8]>,
    {
        let device = self.find_device_by_name(&name).ok_or_else(|| {
            log::debug!("Device '{}' is not attached", BStr::new(&name));
            SaneError::Inval
        })?;

        Ok(Session::open(device.profile.clone(), transport).with_reader(device.reader))
    }

    /// Forget every attached device.
    pub fn teardown(&mut self) {
        if !self.devices.is_empty() {
            log::debug!("Detach {} devices", self.devices.len());
            self.devices.clear();
        }
    }
}

impl Attached {
    fn device(&self) -> Device<'_> {
        Device {
            profile: &self.profile,
            reader: self.reader,
        }
    }
}

impl Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("devices", &self.devices.len())
            .finish()
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        log::trace!("Call Backend::teardown()");
        self.teardown();
    }
}
