//! Scan session state machine.
//!
//! A [`Session`] drives one opened device through
//! `Idle -> Configuring -> Ready -> Scanning -> Draining -> Idle`, lending its
//! link and options to the dialect for every device interaction. Raw blocks
//! are read either inline or by an [`OverlappedReader`] and go through the
//! reassembly [`Pipeline`] before they reach the caller.

use crate::{
    device::DeviceProfile,
    dialect::{Context, Dialect, FramePlan},
    options::{Info, OptionDescriptor, OptionSet, SetOutcome, Type, Value},
    parameters::Parameters,
    pipeline::Pipeline,
    reader::{block_len, read_block, Block, BlockSource, OverlappedReader},
    result::{Result, SaneError},
    transport::{Link, Transport},
    wait::{Sleeper, ThreadSleeper},
};
use serde::{Deserialize, Serialize};
use std::io;

pub const BUFFER_SIZE: usize = 128 * 1024;
pub const BUFFERS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum State {
    Idle,
    Configuring,
    Ready,
    Scanning,
    Draining,
    Cancelled,
}

/// How raw blocks are pulled from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Read ahead on a worker thread.
    pub overlapped: bool,
    pub buffers: usize,
    /// Upper bound of one read, rounded down to whole lines.
    pub buffer_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            overlapped: false,
            buffers: BUFFERS,
            buffer_size: BUFFER_SIZE,
        }
    }
}

enum Feed {
    Direct(Box<dyn BlockSource>),
    Overlapped(OverlappedReader),
}

struct Frame {
    pipeline: Pipeline,
    feed: Feed,
    params: Parameters,
    exhausted: bool,
}

/// Borrow the session parts a dialect call needs.
macro_rules! ctx {
    ($self:ident, $link:expr) => {
        Context {
            link: &mut *$link,
            options: &mut $self.options,
            profile: &$self.profile,
            sleeper: &mut *$self.sleeper,
            retries: 0,
        }
    };
}

pub struct Session {
    profile: DeviceProfile,
    dialect: Box<dyn Dialect>,
    options: OptionSet,
    /// Lent to the overlapped reader while a frame is drained.
    link: Option<Link>,
    state: State,
    frame: Option<Frame>,
    /// Authoritative parameters of the current or last frame.
    params: Option<Parameters>,
    /// Another frame of this scan waits for `start`.
    pending: bool,
    reader: ReaderConfig,
    sleeper: Box<dyn Sleeper>,
    last_wait_retries: u32,
}

impl Session {
    pub fn open(profile: DeviceProfile, transport: Box<dyn Transport>) -> Self {
        log::trace!("Call Session::open('{}')", profile.name);

        let dialect = profile.dialect.instantiate(&profile);
        let options = dialect.options(&profile);
        let link = Link::new(transport).with_classifier(dialect.classifier());

        log::debug!("Open {profile} with {} options", options.len());

        Self {
            profile,
            dialect,
            options,
            link: Some(link),
            state: State::Idle,
            frame: None,
            params: None,
            pending: false,
            reader: ReaderConfig::default(),
            sleeper: Box::new(ThreadSleeper),
            last_wait_retries: 0,
        }
    }

    pub fn with_reader(mut self, reader: ReaderConfig) -> Self {
        self.reader = reader;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &OptionSet {
        &self.options
    }

    /// Busy retries spent by the waits of the last device interaction.
    pub fn last_wait_retries(&self) -> u32 {
        self.last_wait_retries
    }

    pub fn describe(&self, index: usize) -> Result<&OptionDescriptor> {
        self.options.describe(index)
    }

    pub fn get_option(&self, index: usize) -> Result<Value> {
        log::trace!("Call get_option({index})");
        self.options.get(index)
    }

    pub fn set_option(&mut self, index: usize, value: Value) -> Result<SetOutcome> {
        log::trace!("Call set_option({index}, {value})");
        self.ensure_idle()?;

        let dialect = &*self.dialect;
        let mut outcome = self
            .options
            .set(index, value, |options, index| dialect.on_change(options, index))?;

        let descriptor = self.options.describe(index)?;
        if descriptor.ty == Type::Button {
            let name = descriptor.name;
            outcome.info |= self.press(name)?;
        }

        Ok(outcome)
    }

    /// Parse `text` according to the option's type and set it.
    pub fn set_option_by_name(&mut self, name: &str, text: &str) -> Result<SetOutcome> {
        let index = self.options.find(name).ok_or_else(|| {
            log::warn!("Option '{name}' does not exist");
            SaneError::Inval
        })?;
        let value = self.options.describe(index)?.parse_value(text)?;

        self.set_option(index, value)
    }

    pub fn set_auto(&mut self, index: usize) -> Result<Info> {
        log::trace!("Call set_auto({index})");
        self.ensure_idle()?;
        self.options.set_auto(index)
    }

    pub fn get_parameters(&self) -> Result<Parameters> {
        log::trace!("Call get_parameters()");

        match (self.state, self.params) {
            (State::Scanning | State::Draining, Some(params)) => Ok(params),
            (State::Ready, Some(params)) if self.pending => Ok(params),
            _ => self.dialect.estimate(&self.profile, &self.options),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        log::trace!("Call start()");

        match self.state {
            State::Scanning | State::Draining => return Err(SaneError::DeviceBusy),
            State::Ready if self.pending => return self.start_next_frame(),
            _ => {}
        }

        self.pending = false;
        self.params = None;

        match self.setup() {
            Ok(plan) => self.begin_frame(plan).map_err(|err| self.fail(err)),
            Err(err) => {
                log::debug!("Start failed: {err}");
                self.release();
                Err(err)
            }
        }
    }

    /// Start a frame and return a reader over it.
    pub fn start_page(&mut self) -> Result<PageReader<'_>> {
        self.start()?;
        Ok(PageReader(self))
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.state {
            State::Scanning | State::Draining => {}
            State::Cancelled => return Err(SaneError::Cancelled),
            _ => return Err(SaneError::Inval),
        }

        if buf.is_empty() {
            return Err(SaneError::Inval);
        }

        loop {
            let frame = self.frame.as_mut().ok_or(SaneError::Inval)?;

            let count = frame.pipeline.pull(buf);
            if count > 0 {
                return Ok(count);
            }

            if frame.exhausted {
                self.complete_frame().map_err(|err| self.fail(err))?;
                return Err(SaneError::EOF);
            }

            self.fill().map_err(|err| self.fail(err))?;
        }
    }

    pub fn cancel(&mut self) {
        log::trace!("Call cancel()");

        self.stop_reader();

        let running = matches!(self.state, State::Scanning | State::Draining) || self.pending;
        if let Some(link) = self.link.as_mut() {
            if running && link.is_open() {
                let mut ctx = ctx!(self, link);
                if let Err(err) = self.dialect.abort(&mut ctx) {
                    log::warn!("Failed to abort scan: {err}");
                }
            }
            link.close();
        }

        self.pending = false;
        self.set_state(State::Cancelled);
    }

    pub fn set_io_mode(&mut self, non_blocking: bool) -> Result<()> {
        log::trace!("Call set_io_mode({non_blocking})");

        if non_blocking {
            return Err(SaneError::Unsupported);
        }

        Ok(())
    }

    pub fn select_fd(&self) -> Result<i32> {
        Err(SaneError::Unsupported)
    }

    pub fn close(mut self) -> Result<()> {
        log::trace!("Call close()");
        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        if matches!(self.state, State::Scanning | State::Draining) || self.pending {
            self.cancel();
        }

        self.stop_reader();
        if let Some(link) = self.link.as_mut() {
            link.close();
        }
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.state {
            State::Scanning | State::Draining => Err(SaneError::DeviceBusy),
            _ => Ok(()),
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            log::debug!("Session {} -> {state}", self.state);
            self.state = state;
        }
    }

    fn press(&mut self, name: &'static str) -> Result<Info> {
        let link = self.link.as_mut().ok_or_else(link_lost)?;
        let was_open = link.is_open();
        link.open(&self.profile.name)?;

        let mut ctx = ctx!(self, link);
        let result = self.dialect.press(&mut ctx, name);
        self.last_wait_retries = ctx.retries;

        if !was_open {
            link.close();
        }

        result
    }

    fn setup(&mut self) -> Result<FramePlan> {
        let link = self.link.as_mut().ok_or_else(link_lost)?;
        link.open(&self.profile.name)?;

        let mut ctx = ctx!(self, link);
        let result = configure_and_trigger(self.dialect.as_mut(), &mut ctx, &mut self.state);
        self.last_wait_retries = ctx.retries;

        result
    }

    fn start_next_frame(&mut self) -> Result<()> {
        self.pending = false;

        let link = self.link.as_mut().ok_or_else(link_lost)?;
        let mut ctx = ctx!(self, link);

        match self.dialect.next_frame(&mut ctx) {
            Ok(Some(plan)) => self.begin_frame(plan).map_err(|err| self.fail(err)),
            Ok(None) => {
                log::warn!("No further frame to start");
                self.release();
                Err(SaneError::Inval)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn begin_frame(&mut self, plan: FramePlan) -> Result<()> {
        let FramePlan { params, stage, source } = plan;
        log::debug!("Frame {params:?}");

        let feed = if self.reader.overlapped {
            let link = self.link.take().ok_or_else(link_lost)?;
            Feed::Overlapped(OverlappedReader::spawn(
                link,
                source,
                self.reader.buffers,
                self.reader.buffer_size,
            )?)
        } else {
            Feed::Direct(source)
        };

        self.frame = Some(Frame {
            pipeline: Pipeline::new(stage),
            feed,
            params,
            exhausted: false,
        });
        self.params = Some(params);
        self.set_state(State::Scanning);

        Ok(())
    }

    /// Pull one raw block into the pipeline.
    fn fill(&mut self) -> Result<()> {
        let frame = self.frame.as_mut().ok_or(SaneError::Inval)?;

        let block = match &mut frame.feed {
            Feed::Direct(source) => {
                let link = self.link.as_mut().ok_or_else(link_lost)?;
                let max = block_len(source.line_len(), self.reader.buffer_size);

                match read_block(source.as_mut(), link, max, &mut *self.sleeper, None)? {
                    Block::Data(data) => Some(data),
                    Block::End => None,
                    Block::Busy => return Ok(()),
                }
            }
            Feed::Overlapped(reader) => reader.recv()?,
        };

        match block {
            Some(data) => {
                frame.pipeline.push(&data)?;
                log::trace!("Accepted {} raw bytes", data.len());

                if self.state == State::Scanning {
                    log::debug!("Session {} -> {}", self.state, State::Draining);
                    self.state = State::Draining;
                }
            }
            None => {
                log::debug!("Frame of {} bytes drained", frame.params.frame_size());
                frame.exhausted = true;
            }
        }

        Ok(())
    }

    fn complete_frame(&mut self) -> Result<()> {
        let Some(mut frame) = self.frame.take() else {
            return Ok(());
        };

        frame.pipeline.finish();
        let side = frame.pipeline.take_side();

        if let Feed::Overlapped(reader) = frame.feed {
            let (link, _) = reader.join().map_err(|err| {
                log::error!("Failed to join reader, device link lost: {err}");
                err
            })?;
            self.link = Some(link);
        }

        let link = self.link.as_mut().ok_or_else(link_lost)?;
        let mut ctx = ctx!(self, link);

        if self.dialect.end_frame(&mut ctx, side)? {
            log::debug!("Another frame is pending");
            self.pending = true;
            self.set_state(State::Ready);
            return Ok(());
        }

        let result = self.dialect.finish(&mut ctx);
        self.close_link();
        result
    }

    fn stop_reader(&mut self) {
        let Some(frame) = self.frame.take() else {
            return;
        };

        if let Feed::Overlapped(reader) = frame.feed {
            match reader.cancel() {
                Ok((link, _)) => self.link = Some(link),
                Err(err) => log::error!("Failed to stop reader, device link lost: {err}"),
            }
        }
    }

    /// Abort after a failed scan. Jams and open covers leave the session
    /// cancelled, anything else idle.
    fn fail(&mut self, err: SaneError) -> SaneError {
        log::debug!("Scan failed: {err}");

        self.stop_reader();

        if let Some(link) = self.link.as_mut() {
            if link.is_open() {
                let mut ctx = ctx!(self, link);
                if let Err(abort) = self.dialect.abort(&mut ctx) {
                    log::warn!("Failed to abort scan: {abort}");
                }
            }
        }

        self.pending = false;
        self.close_link();

        if err.is_fatal_to_scan() {
            self.set_state(State::Cancelled);
        }

        err
    }

    /// Give the device back after a scan that never started.
    fn release(&mut self) {
        if let Some(link) = self.link.as_mut() {
            if link.is_open() {
                let mut ctx = ctx!(self, link);
                if let Err(err) = self.dialect.finish(&mut ctx) {
                    log::debug!("Failed to release device: {err}");
                }
            }
        }

        self.close_link();
    }

    /// Back to idle, or cancelled for good when the link went down with the
    /// reader thread.
    fn close_link(&mut self) {
        self.frame = None;

        match self.link.as_mut() {
            Some(link) => {
                link.close();
                self.set_state(State::Idle);
            }
            None => self.set_state(State::Cancelled),
        }
    }
}

fn link_lost() -> SaneError {
    log::error!("Device link is gone, the session has to be reopened");
    SaneError::IO
}

fn configure_and_trigger(dialect: &mut dyn Dialect, ctx: &mut Context, state: &mut State) -> Result<FramePlan> {
    log::debug!("Session {state} -> {}", State::Configuring);
    *state = State::Configuring;
    dialect.configure(ctx)?;

    log::debug!("Session {state} -> {}", State::Ready);
    *state = State::Ready;
    dialect.trigger(ctx)
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One frame of a started session as a byte stream.
pub struct PageReader<'s>(&'s mut Session);

impl PageReader<'_> {
    pub fn get_parameters(&self) -> Result<Parameters> {
        self.0.get_parameters()
    }
}

impl io::Read for PageReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Err(io::ErrorKind::InvalidInput.into());
        }

        match self.0.read(buf) {
            Ok(count) => Ok(count),
            Err(SaneError::EOF) => Ok(0),
            Err(SaneError::IO) => Err(io::ErrorKind::BrokenPipe.into()),
            Err(SaneError::NoMem) => Err(io::ErrorKind::OutOfMemory.into()),
            Err(SaneError::AccessDenied) => Err(io::ErrorKind::PermissionDenied.into()),
            Err(err) => Err(io::Error::other(err)),
        }
    }
}

impl Drop for PageReader<'_> {
    fn drop(&mut self) {
        if matches!(self.0.state, State::Scanning | State::Draining) {
            self.0.cancel();
        }
    }
}
