//! Test items and the machine attributes they are matched against.
//!
//! A [`TestItem`] names a test, the arguments to pass it, and two optional
//! constraint sets. A machine is described by an [`AttributeSet`]: the tags
//! that are true for it (board, pool membership, attached peripherals, ...).
//!
//! ```
//! use fleetrun::item::{AttributeSet, TestItem};
//!
//! let wifi_only = TestItem::new("network_WiFiConnect").with_include(["wifi"]);
//! let machine: AttributeSet = ["wifi", "board:eve"].into_iter().map(String::from).collect();
//!
//! assert!(wifi_only.validate(&machine));
//! assert!(!wifi_only.validate(&AttributeSet::new()));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Tags that are true for a machine.
pub type AttributeSet = BTreeSet<String>;

/// A schedulable test with machine constraints.
///
/// `include` and `exclude` are `None` when the test places no constraint of
/// that kind. An empty set is a constraint that is trivially satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestItem {
    /// Name of the test to execute.
    pub name: String,

    /// Arguments passed to the test.
    #[serde(default)]
    pub args: BTreeMap<String, serde_json::Value>,

    /// Attributes a machine must all have.
    #[serde(default)]
    pub include: Option<AttributeSet>,

    /// Attributes a machine must not have any of.
    #[serde(default)]
    pub exclude: Option<AttributeSet>,
}

impl TestItem {
    /// Creates an unconstrained test with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: BTreeMap::new(),
            include: None,
            exclude: None,
        }
    }

    /// Adds an argument.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Sets the attributes a machine must have.
    pub fn with_include<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = Some(attributes.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the attributes a machine must not have.
    pub fn with_exclude<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = Some(attributes.into_iter().map(Into::into).collect());
        self
    }

    /// Checks whether this test can run on a machine with `attributes`.
    ///
    /// The machine must carry every `include` attribute and none of the
    /// `exclude` attributes. A test with neither set is valid everywhere.
    pub fn validate(&self, attributes: &AttributeSet) -> bool {
        if let Some(include) = &self.include
            && !include.is_subset(attributes)
        {
            return false;
        }
        if let Some(exclude) = &self.exclude
            && !exclude.is_disjoint(attributes)
        {
            return false;
        }
        true
    }

    /// Renders the arguments as `key=value` words.
    ///
    /// String values are rendered bare, everything else as JSON.
    pub fn args_as_words(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(s) => format!("{}={}", key, s),
                other => format!("{}={}", key, other),
            })
            .collect()
    }
}

impl fmt::Display for TestItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.args_as_words().join(", "))?;
        if let Some(include) = self.include.as_ref().filter(|s| !s.is_empty()) {
            write!(f, " include={:?}", include)?;
        }
        if let Some(exclude) = self.exclude.as_ref().filter(|s| !s.is_empty()) {
            write!(f, " exclude={:?}", exclude)?;
        }
        Ok(())
    }
}
