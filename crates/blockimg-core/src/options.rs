//! Image creation options
//!
//! A typed option bag passed to `create` and `clone`. Every option has a
//! fixed value type; setting it with the wrong type is rejected.

use blockimg_common::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Options understood by image creation
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImageOption {
    Format,
    Features,
    Order,
    StripeUnit,
    StripeCount,
    JournalOrder,
    JournalSplayWidth,
    JournalPool,
    FeaturesSet,
    FeaturesClear,
    DataPool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OptionKind {
    U64,
    Str,
}

impl ImageOption {
    const fn kind(self) -> OptionKind {
        match self {
            Self::JournalPool | Self::DataPool => OptionKind::Str,
            _ => OptionKind::U64,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Format => "format",
            Self::Features => "features",
            Self::Order => "order",
            Self::StripeUnit => "stripe_unit",
            Self::StripeCount => "stripe_count",
            Self::JournalOrder => "journal_order",
            Self::JournalSplayWidth => "journal_splay_width",
            Self::JournalPool => "journal_pool",
            Self::FeaturesSet => "features_set",
            Self::FeaturesClear => "features_clear",
            Self::DataPool => "data_pool",
        }
    }
}

/// Stored option value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OptionValue {
    U64(u64),
    Str(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U64(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Typed option bag
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageOptions {
    values: BTreeMap<ImageOption, OptionValue>,
}

impl ImageOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_u64(&mut self, option: ImageOption, value: u64) -> Result<()> {
        if option.kind() != OptionKind::U64 {
            return Err(Error::invalid_argument(format!(
                "option {} does not take an integer",
                option.name()
            )));
        }
        self.values.insert(option, OptionValue::U64(value));
        Ok(())
    }

    pub fn set_str(&mut self, option: ImageOption, value: impl Into<String>) -> Result<()> {
        if option.kind() != OptionKind::Str {
            return Err(Error::invalid_argument(format!(
                "option {} does not take a string",
                option.name()
            )));
        }
        self.values.insert(option, OptionValue::Str(value.into()));
        Ok(())
    }

    #[must_use]
    pub fn get_u64(&self, option: ImageOption) -> Option<u64> {
        match self.values.get(&option) {
            Some(OptionValue::U64(v)) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_str(&self, option: ImageOption) -> Option<&str> {
        match self.values.get(&option) {
            Some(OptionValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_set(&self, option: ImageOption) -> bool {
        self.values.contains_key(&option)
    }

    /// Returns whether the option was set
    pub fn unset(&mut self, option: ImageOption) -> bool {
        self.values.remove(&option).is_some()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for ImageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .values
            .iter()
            .map(|(k, v)| format!("{}={v}", k.name()))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}
