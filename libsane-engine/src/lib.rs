pub mod backend;
pub mod command;
pub mod device;
pub mod dialect;
pub mod encode;
pub mod options;
pub mod parameters;
pub mod pipeline;
pub mod reader;
pub mod result;
pub mod sense;
pub mod session;
pub mod transport;
pub mod wait;

pub use backend::{Backend, Device};
pub use device::{DeviceProfile, Quirks};
pub use dialect::DialectKind;
pub use options::{
    Capatibilities as OptionCapatibilities, Constraint as OptionConstraint, Info as OptionInfo,
    OptionDescriptor, OptionSet, SetOutcome, Type as OptionType, Unit as OptionUnit, Value as OptionValue,
};
pub use parameters::{FrameFormat, Parameters};
pub use result::{Result, SaneError};
pub use session::{PageReader, ReaderConfig, Session, State};
pub use transport::{Link, Transport, TransportError};
