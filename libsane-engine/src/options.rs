use crate::result::{Result, SaneError};
use bitflags::bitflags;
use bstr::{BStr, BString, ByteSlice};
use std::{fmt, ops::RangeInclusive};

/// Well known option names shared by frontends.
pub mod names {
    pub const MODE: &str = "mode";
    pub const RESOLUTION: &str = "resolution";
    pub const X_RESOLUTION: &str = "x-resolution";
    pub const Y_RESOLUTION: &str = "y-resolution";
    pub const PREVIEW: &str = "preview";
    pub const DEPTH: &str = "depth";
    pub const TL_X: &str = "tl-x";
    pub const TL_Y: &str = "tl-y";
    pub const BR_X: &str = "br-x";
    pub const BR_Y: &str = "br-y";
    pub const THRESHOLD: &str = "threshold";
    pub const CUSTOM_GAMMA: &str = "custom-gamma";
    pub const GAMMA_VECTOR: &str = "gamma-table";
    pub const GAMMA_VECTOR_R: &str = "red-gamma-table";
    pub const GAMMA_VECTOR_G: &str = "green-gamma-table";
    pub const GAMMA_VECTOR_B: &str = "blue-gamma-table";
    pub const SOURCE: &str = "source";
}

#[derive(Debug, Clone)]
pub struct OptionDescriptor {
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub ty: Type,
    pub unit: Unit,
    /// Number of words for vector options, 1 otherwise.
    pub size: usize,
    pub capatibilities: Capatibilities,
    pub constraint: Constraint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Type {
    Bool,
    Int,
    Fixed,
    String,
    Button,
    Group,
    Vector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Unit {
    None,
    Pixel,
    Bit,
    Mm,
    Dpi,
    Percent,
    Microsecond,
}

bitflags! {
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capatibilities: u32 {
        const SoftSelect = 1 << 0;
        const HardSelect = 1 << 1;
        const SoftDetect = 1 << 2;
        const Emulated = 1 << 3;
        const Automatic = 1 << 4;
        const Inactive = 1 << 5;
        const Advanced = 1 << 6;
    }
}

bitflags! {
    /// Side effects of a `set`, reported back to the caller.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Info: u32 {
        const Inexact = 1 << 0;
        const ReloadOptions = 1 << 1;
        const ReloadParams = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    None,
    Range {
        range: RangeInclusive<i32>,
        quant: i32,
    },
    WordList(Vec<i32>),
    StringList(Vec<&'static str>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bool(bool),
    Int(i32),
    /// 16.16 fixed point.
    Fixed(i32),
    String(BString),
    Vector(Vec<i32>),
    Button,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOutcome {
    pub value: Value,
    pub info: Info,
    /// Options whose activity changed as a side effect.
    pub toggled: Vec<usize>,
}

pub const fn fix_int(value: i32) -> i32 {
    value << 16
}

pub fn fix(value: f64) -> i32 {
    (value * 65536.0).round() as i32
}

pub fn unfix(word: i32) -> f64 {
    word as f64 / 65536.0
}

impl OptionDescriptor {
    pub fn new(name: &'static str, title: &'static str, description: &'static str, ty: Type) -> Self {
        Self {
            name,
            title,
            description,
            ty,
            unit: Unit::None,
            size: 1,
            capatibilities: Capatibilities::SoftSelect | Capatibilities::SoftDetect,
            constraint: Constraint::None,
        }
    }

    pub fn group(title: &'static str) -> Self {
        Self {
            capatibilities: Capatibilities::empty(),
            ..Self::new("", title, "", Type::Group)
        }
    }

    pub fn unit(mut self, unit: Unit) -> Self {
        self.unit = unit;
        self
    }

    pub fn range(mut self, range: RangeInclusive<i32>, quant: i32) -> Self {
        self.constraint = Constraint::Range { range, quant };
        self
    }

    pub fn word_list(mut self, words: Vec<i32>) -> Self {
        self.constraint = Constraint::WordList(words);
        self
    }

    pub fn string_list(mut self, strings: &[&'static str]) -> Self {
        self.constraint = Constraint::StringList(strings.to_vec());
        self
    }

    pub fn vector(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with(mut self, caps: Capatibilities) -> Self {
        self.capatibilities |= caps;
        self
    }

    pub fn inactive(self) -> Self {
        self.with(Capatibilities::Inactive)
    }

    pub fn advanced(self) -> Self {
        self.with(Capatibilities::Advanced)
    }

    pub fn read_only(mut self) -> Self {
        self.capatibilities.remove(Capatibilities::SoftSelect);
        self
    }

    pub fn is_settable(&self) -> bool {
        self.capatibilities.contains(Capatibilities::SoftSelect)
    }

    pub fn is_auto_settable(&self) -> bool {
        self.capatibilities.contains(Capatibilities::Automatic)
    }

    pub fn is_active(&self) -> bool {
        !self.capatibilities.contains(Capatibilities::Inactive)
    }

    /// Parse a textual value the way a command line would spell it.
    pub fn parse_value(&self, text: &str) -> Result<Value> {
        let text = text.trim();

        let value = match self.ty {
            Type::Bool => match text.to_ascii_lowercase().as_str() {
                "yes" | "true" | "on" | "1" => Value::Bool(true),
                "no" | "false" | "off" | "0" => Value::Bool(false),
                _ => return Err(SaneError::Inval),
            },
            Type::Int => Value::Int(text.parse().map_err(|_| SaneError::Inval)?),
            Type::Fixed => Value::Fixed(fix(text.parse().map_err(|_| SaneError::Inval)?)),
            Type::String => Value::String(text.into()),
            Type::Vector => Value::Vector(
                text.split(',')
                    .map(|word| word.trim().parse().map_err(|_| SaneError::Inval))
                    .collect::<Result<_>>()?,
            ),
            Type::Button => Value::Button,
            Type::Group => return Err(SaneError::Inval),
        };

        Ok(value)
    }

    /// Type check `value` and force it into the constraint.
    fn constrain(&self, value: Value) -> Result<(Value, bool)> {
        let value = match (self.ty, value) {
            (Type::Bool, value @ Value::Bool(_)) => value,
            (Type::Int, value @ Value::Int(_)) => value,
            (Type::Fixed, value @ Value::Fixed(_)) => value,
            (Type::Fixed, Value::Int(int)) => Value::Fixed(fix_int(int)),
            (Type::String, value @ Value::String(_)) => value,
            (Type::Vector, Value::Vector(words)) if words.len() == self.size => Value::Vector(words),
            (Type::Button, _) => return Ok((Value::Button, false)),
            _ => return Err(SaneError::Inval),
        };

        let constrained = match (&self.constraint, value) {
            (Constraint::Range { range, quant }, Value::Int(word)) => {
                Value::Int(constrain_word(word, range, *quant))
            }
            (Constraint::Range { range, quant }, Value::Fixed(word)) => {
                Value::Fixed(constrain_word(word, range, *quant))
            }
            (Constraint::Range { range, quant }, Value::Vector(words)) => Value::Vector(
                words
                    .into_iter()
                    .map(|word| constrain_word(word, range, *quant))
                    .collect(),
            ),
            (Constraint::WordList(words), Value::Int(word)) => Value::Int(nearest_word(word, words)),
            (Constraint::WordList(words), Value::Fixed(word)) => {
                Value::Fixed(nearest_word(word, words))
            }
            (Constraint::StringList(strings), Value::String(string)) => {
                match strings.iter().find(|entry| string.as_bstr() == entry.as_bytes()) {
                    Some(_) => Value::String(string),
                    None => {
                        let fallback = strings.first().copied().unwrap_or_default();
                        log::warn!(
                            "Unknown value '{string}' for option '{}', use '{fallback}'",
                            self.name
                        );
                        return Ok((Value::String(fallback.into()), true));
                    }
                }
            }
            (_, value) => value,
        };

        Ok((constrained, false))
    }
}

fn constrain_word(word: i32, range: &RangeInclusive<i32>, quant: i32) -> i32 {
    let (min, max) = (*range.start(), *range.end());
    let word = word.clamp(min, max);

    if quant <= 0 {
        return word;
    }

    let steps = (word as i64 - min as i64 + quant as i64 / 2) / quant as i64;
    let mut word = min as i64 + steps * quant as i64;
    if word > max as i64 {
        word -= quant as i64;
    }

    word as i32
}

fn nearest_word(word: i32, words: &[i32]) -> i32 {
    words
        .iter()
        .copied()
        .min_by_key(|candidate| (*candidate as i64 - word as i64).abs())
        .unwrap_or(word)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(value) => write!(f, "{}", if *value { "yes" } else { "no" }),
            Value::Int(value) => write!(f, "{value}"),
            Value::Fixed(value) => write!(f, "{:.3}", unfix(*value)),
            Value::String(value) => write!(f, "{value}"),
            Value::Vector(values) => write!(f, "[{} words]", values.len()),
            Value::Button => write!(f, "[button]"),
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constraint::None => Ok(()),
            Constraint::Range { range, quant } if *quant > 0 => {
                write!(f, "{}..{} (in steps of {quant})", range.start(), range.end())
            }
            Constraint::Range { range, .. } => write!(f, "{}..{}", range.start(), range.end()),
            Constraint::WordList(words) => {
                let words: Vec<String> = words.iter().map(i32::to_string).collect();
                write!(f, "{}", words.join("|"))
            }
            Constraint::StringList(strings) => write!(f, "{}", strings.join("|")),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    descriptor: OptionDescriptor,
    value: Value,
    default: Value,
}

/// Ordered, index-stable option table. Index 0 is the option count.
#[derive(Debug, Clone)]
pub struct OptionSet {
    entries: Vec<Entry>,
}

pub const NUM_OPTIONS: usize = 0;

impl Default for OptionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl OptionSet {
    pub fn new() -> Self {
        let count = OptionDescriptor::new(
            "",
            "Number of options",
            "Read-only option that specifies how many options a specific device supports.",
            Type::Int,
        );

        let count = OptionDescriptor {
            capatibilities: Capatibilities::SoftDetect,
            ..count
        };

        Self {
            entries: vec![Entry {
                descriptor: count,
                value: Value::Int(1),
                default: Value::Int(1),
            }],
        }
    }

    pub fn group(mut self, title: &'static str) -> Self {
        self.push(OptionDescriptor::group(title), Value::Button);
        self
    }

    pub fn option(mut self, descriptor: OptionDescriptor, default: Value) -> Self {
        self.push(descriptor, default);
        self
    }

    fn push(&mut self, descriptor: OptionDescriptor, default: Value) {
        self.entries.push(Entry {
            descriptor,
            value: default.clone(),
            default,
        });

        let count = Value::Int(self.entries.len() as i32);
        self.entries[NUM_OPTIONS].value = count.clone();
        self.entries[NUM_OPTIONS].default = count;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &OptionDescriptor)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (index, &entry.descriptor))
    }

    pub fn describe(&self, index: usize) -> Result<&OptionDescriptor> {
        self.entries
            .get(index)
            .map(|entry| &entry.descriptor)
            .ok_or(SaneError::Inval)
    }

    pub fn find<N: AsRef<[u8]>>(&self, name: N) -> Option<usize> {
        let name = BStr::new(&name);

        self.entries.iter().position(|entry| {
            entry.descriptor.ty != Type::Group
                && !entry.descriptor.name.is_empty()
                && entry.descriptor.name.as_bytes() == name.as_bytes()
        })
    }

    pub fn get(&self, index: usize) -> Result<Value> {
        let entry = self.entries.get(index).ok_or(SaneError::Inval)?;

        match entry.descriptor.ty {
            Type::Group | Type::Button => Err(SaneError::Inval),
            _ if !entry.descriptor.is_active() => Err(SaneError::Inval),
            _ => Ok(entry.value.clone()),
        }
    }

    /// Validate, constrain and store a value, then run `rule` once for the
    /// changed option so it can flip the activity of dependent options.
    pub fn set<F>(&mut self, index: usize, value: Value, rule: F) -> Result<SetOutcome>
    where
        F: FnOnce(&mut OptionSet, usize) -> Info,
    {
        if index == NUM_OPTIONS {
            return Err(SaneError::Inval);
        }

        let entry = self.entries.get_mut(index).ok_or(SaneError::Inval)?;
        let descriptor = &entry.descriptor;

        if descriptor.ty == Type::Group || !descriptor.is_settable() || !descriptor.is_active() {
            log::debug!("Option '{}' cannot be set", descriptor.name);
            return Err(SaneError::Inval);
        }

        let (constrained, fallback) = descriptor.constrain(value.clone())?;

        let mut info = Info::empty();
        if fallback || (constrained != value && descriptor.ty != Type::Button) {
            log::debug!("Option '{}' adjusted to {constrained}", descriptor.name);
            info |= Info::Inexact;
        }

        if descriptor.ty != Type::Button {
            entry.value = constrained.clone();
        }

        let before = self.activity();
        info |= rule(self, index);
        let toggled: Vec<usize> = self
            .activity()
            .into_iter()
            .zip(before)
            .enumerate()
            .filter_map(|(index, (now, was))| (now != was).then_some(index))
            .collect();

        if !toggled.is_empty() {
            info |= Info::ReloadOptions;
        }

        Ok(SetOutcome {
            value: constrained,
            info,
            toggled,
        })
    }

    /// Reset an option with automatic capability to its default.
    pub fn set_auto(&mut self, index: usize) -> Result<Info> {
        let entry = self.entries.get_mut(index).ok_or(SaneError::Inval)?;

        if !entry.descriptor.is_auto_settable() || !entry.descriptor.is_active() {
            return Err(SaneError::Inval);
        }

        let changed = entry.value != entry.default;
        entry.value = entry.default.clone();

        Ok(if changed {
            Info::ReloadParams
        } else {
            Info::empty()
        })
    }

    fn activity(&self) -> Vec<bool> {
        self.entries
            .iter()
            .map(|entry| entry.descriptor.is_active())
            .collect()
    }

    fn entry(&self, name: &str) -> Result<&Entry> {
        self.find(name)
            .map(|index| &self.entries[index])
            .ok_or_else(|| {
                log::warn!("Option '{name}' does not exist");
                SaneError::Inval
            })
    }

    /// Flip the activity of an option. Returns whether it changed.
    pub fn activate(&mut self, name: &str, active: bool) -> bool {
        let Some(index) = self.find(name) else {
            return false;
        };

        let caps = &mut self.entries[index].descriptor.capatibilities;
        let was_active = !caps.contains(Capatibilities::Inactive);
        caps.set(Capatibilities::Inactive, !active);

        was_active != active
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.entry(name)
            .map(|entry| entry.descriptor.is_active())
            .unwrap_or(false)
    }

    /// Store a value reported by the device, bypassing capability checks.
    pub fn store(&mut self, name: &str, value: Value) -> Result<()> {
        let index = self.find(name).ok_or(SaneError::Inval)?;
        self.entries[index].value = value;
        Ok(())
    }

    pub fn name_of(&self, index: usize) -> Option<&'static str> {
        self.entries.get(index).map(|entry| entry.descriptor.name)
    }

    pub fn value(&self, name: &str) -> Result<&Value> {
        self.entry(name).map(|entry| &entry.value)
    }

    pub fn int(&self, name: &str) -> Result<i32> {
        match self.value(name)? {
            Value::Int(value) | Value::Fixed(value) => Ok(*value),
            Value::Bool(value) => Ok(*value as i32),
            _ => Err(SaneError::Inval),
        }
    }

    pub fn fixed(&self, name: &str) -> Result<f64> {
        match self.value(name)? {
            Value::Fixed(value) => Ok(unfix(*value)),
            Value::Int(value) => Ok(*value as f64),
            _ => Err(SaneError::Inval),
        }
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        match self.value(name)? {
            Value::Bool(value) => Ok(*value),
            _ => Err(SaneError::Inval),
        }
    }

    pub fn string(&self, name: &str) -> Result<&BStr> {
        match self.value(name)? {
            Value::String(value) => Ok(value.as_bstr()),
            _ => Err(SaneError::Inval),
        }
    }

    pub fn vector(&self, name: &str) -> Result<&[i32]> {
        match self.value(name)? {
            Value::Vector(value) => Ok(value),
            _ => Err(SaneError::Inval),
        }
    }

    /// Position of the current value in a string list constraint.
    pub fn string_index(&self, name: &str) -> Result<usize> {
        let entry = self.entry(name)?;

        match (&entry.descriptor.constraint, &entry.value) {
            (Constraint::StringList(strings), Value::String(value)) => Ok(strings
                .iter()
                .position(|entry| value.as_bstr() == entry.as_bytes())
                .unwrap_or(0)),
            _ => Err(SaneError::Inval),
        }
    }
}
