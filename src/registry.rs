//! Canonical subscription keys.
//!
//! Every binding names a simulator variable by `(name, unit)`. Panels written
//! by different people spell the same quantity differently (`"Volts"`,
//! `"volt"`, `"VOLTS"`), so both halves are normalized here before the key is
//! used for cache lookup. Two requests for the same quantity always resolve to
//! one cache slot.
//!
//! Name rules:
//! - `A:` is the default kind for simulation variables and is stripped;
//!   simulation variable names are case-insensitive in the host and are
//!   uppercased.
//! - `L:` (local) variable names are case-sensitive and kept as written.
//! - `E:` (environment) variables are uppercased like simulation variables.

use crate::error::{Result, SyncError};
use crate::source::Value;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Canonical unit of a simulator variable.
///
/// `Display` yields the canonical spelling; parsing accepts every alias.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, AsRefStr, EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum Unit {
    #[strum(to_string = "Volts", serialize = "volt", serialize = "v")]
    Volts,
    #[strum(
        to_string = "Amperes",
        serialize = "ampere",
        serialize = "amp",
        serialize = "amps",
        serialize = "a"
    )]
    Amperes,
    #[strum(to_string = "Hz", serialize = "hertz")]
    Hertz,
    #[strum(to_string = "KHz", serialize = "kilohertz")]
    Kilohertz,
    #[strum(to_string = "MHz", serialize = "megahertz")]
    Megahertz,
    #[strum(to_string = "Frequency BCD16")]
    FrequencyBcd16,
    #[strum(to_string = "Frequency BCD32")]
    FrequencyBcd32,
    #[strum(to_string = "Bool", serialize = "boolean")]
    Bool,
    #[strum(to_string = "Number")]
    Number,
    #[strum(to_string = "Enum")]
    Enum,
    #[strum(to_string = "Position")]
    Position,
    #[strum(to_string = "Percent", serialize = "percentage", serialize = "%")]
    Percent,
    #[strum(to_string = "Percent over 100")]
    PercentOver100,
    #[strum(
        to_string = "Celsius",
        serialize = "degree celsius",
        serialize = "degrees celsius",
        serialize = "c"
    )]
    Celsius,
    #[strum(to_string = "Feet", serialize = "foot", serialize = "ft")]
    Feet,
    #[strum(to_string = "Knots", serialize = "knot", serialize = "kt", serialize = "kts")]
    Knots,
    #[strum(to_string = "Degrees", serialize = "degree", serialize = "deg")]
    Degrees,
    #[strum(to_string = "Radians", serialize = "radian", serialize = "rad")]
    Radians,
    #[strum(to_string = "Seconds", serialize = "second", serialize = "sec")]
    Seconds,
    #[strum(
        to_string = "Kilograms",
        serialize = "kilogram",
        serialize = "kg"
    )]
    Kilograms,
    #[strum(to_string = "Pounds", serialize = "pound", serialize = "lbs", serialize = "lb")]
    Pounds,
}

impl Unit {
    /// Parse a unit string, accepting any alias, case, extra whitespace,
    /// underscores as spaces and a trailing plural `s` on aliases of two or
    /// more characters (`kgs`, `volts`, but not `Vs`).
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || !trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '/' | '-' | '%'))
        {
            return Err(SyncError::InvalidUnit(raw.to_string()));
        }

        let normalized = trimmed
            .replace('_', " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        if let Ok(unit) = Unit::from_str(&normalized) {
            return Ok(unit);
        }
        if let Some(singular) = normalized
            .strip_suffix('s')
            .or_else(|| normalized.strip_suffix('S'))
            && singular.len() > 1
            && !singular.ends_with(['s', 'S'])
            && let Ok(unit) = Unit::from_str(singular)
        {
            return Ok(unit);
        }

        Err(SyncError::InvalidUnit(raw.to_string()))
    }

    /// Whether values of this unit are delivered as `Value::Bool`.
    pub fn is_boolean(&self) -> bool {
        matches!(self, Unit::Bool)
    }

    /// Coerce a raw value from the host into this unit's representation.
    ///
    /// Hosts report booleans as numbers; a non-zero number is `true`.
    pub fn coerce(&self, value: Value) -> Value {
        match (self.is_boolean(), value) {
            (true, Value::Number(n)) => Value::Bool(n != 0.0),
            (false, Value::Bool(b)) => Value::Number(if b { 1.0 } else { 0.0 }),
            (_, v) => v,
        }
    }
}

impl Serialize for Unit {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_ref())
    }
}

/// Canonical identity of a simulator variable.
///
/// Cheap to clone; the name is shared.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    name: Arc<str>,
    unit: Unit,
}

impl Key {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Whether this is a local (`L:`) variable.
    pub fn is_local(&self) -> bool {
        self.name.starts_with("L:")
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("Key", 2)?;
        state.serialize_field("name", self.name())?;
        state.serialize_field("unit", &self.unit)?;
        state.end()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.unit)
    }
}

/// Normalize `(name, unit)` into a canonical [`Key`].
pub fn canonicalize(name: &str, unit: &str) -> Result<Key> {
    let unit = Unit::parse(unit)?;
    let name = canonical_name(name)?;
    Ok(Key {
        name: Arc::from(name),
        unit,
    })
}

fn canonical_name(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidName(raw.to_string()));
    }

    let mut chars = trimmed.chars();
    let prefix = match (chars.next(), chars.next()) {
        (Some(kind), Some(':')) if matches!(kind, 'A' | 'a' | 'L' | 'l' | 'E' | 'e') => {
            Some(kind.to_ascii_uppercase())
        }
        _ => None,
    };

    let Some(kind) = prefix else {
        return Ok(trimmed.to_ascii_uppercase());
    };

    let rest = trimmed[2..].trim();
    if rest.is_empty() {
        return Err(SyncError::InvalidName(raw.to_string()));
    }
    Ok(match kind {
        'L' => format!("L:{rest}"),
        'E' => format!("E:{}", rest.to_ascii_uppercase()),
        _ => rest.to_ascii_uppercase(),
    })
}
