//! Device dialects.
//!
//! A dialect turns the generic session calls into the command sequences of
//! one scanner family. The session owns the link, the options and the
//! reassembly pipeline and lends them to the dialect through a [`Context`].

pub mod coolscan;
pub mod hs2p;
pub mod teco;

use crate::{
    command::{self, Command, Operation},
    device::{DeviceProfile, Inquiry},
    options::{Info, OptionSet},
    parameters::Parameters,
    pipeline::Stage,
    reader::BlockSource,
    result::{from_outcome, Result, SaneError},
    sense::{Outcome, SenseClassifier},
    transport::Link,
    wait::{wait_until_ready, Probe, RetryPolicy, Sleeper},
};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DialectKind {
    Teco,
    Hs2p,
    Coolscan,
}

impl DialectKind {
    pub const ALL: [DialectKind; 3] = [DialectKind::Teco, DialectKind::Hs2p, DialectKind::Coolscan];

    /// Pick the dialect claiming this INQUIRY reply.
    pub fn detect(inquiry: &Inquiry) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| match kind {
            DialectKind::Teco => teco::matches(inquiry),
            DialectKind::Hs2p => hs2p::matches(inquiry),
            DialectKind::Coolscan => coolscan::matches(inquiry),
        })
    }

    /// Query the device for everything the profile needs.
    pub fn probe(self, link: &mut Link, inquiry: &Inquiry, name: &str) -> Result<DeviceProfile> {
        link.set_classifier(self.classifier());

        match self {
            DialectKind::Teco => teco::probe(link, inquiry, name),
            DialectKind::Hs2p => hs2p::probe(link, inquiry, name),
            DialectKind::Coolscan => coolscan::probe(link, inquiry, name),
        }
    }

    pub fn classifier(self) -> SenseClassifier {
        match self {
            DialectKind::Teco => teco::classify,
            DialectKind::Hs2p => hs2p::classify,
            DialectKind::Coolscan => coolscan::classify,
        }
    }

    pub fn instantiate(self, profile: &DeviceProfile) -> Box<dyn Dialect> {
        match self {
            DialectKind::Teco => Box::new(teco::Teco::new(profile)),
            DialectKind::Hs2p => Box::new(hs2p::Hs2p::new(profile)),
            DialectKind::Coolscan => Box::new(coolscan::Coolscan::new(profile)),
        }
    }
}

/// Borrowed session state handed to a dialect for one call.
pub struct Context<'a> {
    pub link: &'a mut Link,
    pub options: &'a mut OptionSet,
    pub profile: &'a DeviceProfile,
    pub sleeper: &'a mut dyn Sleeper,
    /// Busy retries spent by the waits of this call.
    pub retries: u32,
}

impl Context<'_> {
    pub fn run(&mut self, command: &Command) -> Result<Vec<u8>> {
        self.link.run(command)
    }

    /// Poll `probe` until the device is ready, within `policy`.
    pub fn wait_ready<F>(&mut self, policy: &RetryPolicy, what: &str, mut probe: F) -> Result<()>
    where
        F: FnMut(&mut Link) -> Result<Probe<()>>,
    {
        let link = &mut *self.link;
        let ((), retries) = wait_until_ready(policy, &mut *self.sleeper, what, || probe(link))?;
        self.retries += retries;
        Ok(())
    }

    /// Poll with TEST UNIT READY.
    pub fn wait_unit_ready(&mut self, policy: &RetryPolicy) -> Result<()> {
        self.wait_ready(policy, "Device", test_unit_ready)
    }
}

/// One TEST UNIT READY probe.
pub fn test_unit_ready(link: &mut Link) -> Result<Probe<()>> {
    let reply = link.exchange(&command::test_unit_ready())?;

    match reply.outcome {
        Outcome::Busy => Ok(Probe::Busy),
        outcome => from_outcome(outcome).map(Probe::Ready),
    }
}

/// A frame ready to be drained.
pub struct FramePlan {
    pub params: Parameters,
    pub stage: Stage,
    pub source: Box<dyn BlockSource>,
}

impl fmt::Debug for FramePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePlan")
            .field("params", &self.params)
            .field("stage", &self.stage)
            .field("remaining", &self.source.remaining())
            .finish()
    }
}

/// Device family specific behaviour plugged into the session.
pub trait Dialect: Send {
    fn kind(&self) -> DialectKind;

    fn classifier(&self) -> SenseClassifier {
        self.kind().classifier()
    }

    /// Busy wait budget used while configuring and triggering.
    fn wait_policy(&self) -> RetryPolicy;

    /// Build the command block for `op` from the current option values.
    fn encode(&self, op: &Operation, options: &OptionSet) -> Result<Command> {
        _ = options;
        command::encode_standard(op)
    }

    /// Option table for a freshly opened session.
    fn options(&self, profile: &DeviceProfile) -> OptionSet;

    /// Activation rule run once after option `index` changed.
    fn on_change(&self, options: &mut OptionSet, index: usize) -> Info;

    /// Execute a button option.
    fn press(&mut self, ctx: &mut Context, name: &str) -> Result<Info> {
        _ = ctx;
        log::debug!("Button '{name}' is not supported by {}", self.kind());
        Err(SaneError::Unsupported)
    }

    /// Parameters derived from options only.
    fn estimate(&self, profile: &DeviceProfile, options: &OptionSet) -> Result<Parameters>;

    /// Send every setup command of a new scan.
    fn configure(&mut self, ctx: &mut Context) -> Result<()>;

    /// Start the scan and describe the first frame.
    fn trigger(&mut self, ctx: &mut Context) -> Result<FramePlan>;

    /// Next frame of the same scan, if one is pending.
    fn next_frame(&mut self, ctx: &mut Context) -> Result<Option<FramePlan>> {
        _ = ctx;
        Ok(None)
    }

    /// A frame was fully drained. `side` holds its side channel bytes.
    /// Returns whether another frame of this scan is pending.
    fn end_frame(&mut self, ctx: &mut Context, side: Vec<u8>) -> Result<bool> {
        _ = (ctx, side);
        Ok(false)
    }

    /// Release the device after the last frame.
    fn finish(&mut self, ctx: &mut Context) -> Result<()>;

    /// Stop a running scan.
    fn abort(&mut self, ctx: &mut Context) -> Result<()>;
}

/// Millimetres to device units of `1 / per_inch` inch.
pub fn mm_to_units(mm: f64, per_inch: u32) -> u32 {
    (mm * per_inch as f64 / 25.4).round().max(0.0) as u32
}

/// Device units back to millimetres.
pub fn units_to_mm(units: u32, per_inch: u32) -> f64 {
    units as f64 * 25.4 / per_inch as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use pretty_assertions::assert_eq;
    use std::str::FromStr;

    #[test]
    fn test_kind_names() {
        assert_eq!(DialectKind::Hs2p.to_string(), "hs2p");
        assert_eq!(DialectKind::from_str("coolscan"), Ok(DialectKind::Coolscan));
        assert!(DialectKind::from_str("sharp").is_err());
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(mm_to_units(215.9, 300), 2550);
        assert_eq!(mm_to_units(25.4, 1200), 1200);
        assert_eq!(mm_to_units(-1.0, 300), 0);
        assert!((units_to_mm(2550, 300) - 215.9).abs() < 1e-9);
    }

    #[test]
    fn test_unit_ready_probe() {
        let mut mock = MockTransport::new();
        mock.push_check_condition(&[0x00], MockTransport::sense(0x02, 0x04, 0x01));
        mock.push_check_condition(&[0x00], MockTransport::sense(0x04, 0x00, 0x00));
        let mut link = Link::new(Box::new(mock));
        link.open("mock").unwrap();

        assert_eq!(test_unit_ready(&mut link), Ok(Probe::Busy));
        assert_eq!(test_unit_ready(&mut link), Err(SaneError::IO));
        assert_eq!(test_unit_ready(&mut link), Ok(Probe::Ready(())));
    }
}
