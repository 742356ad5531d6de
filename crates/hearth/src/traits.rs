use indexmap::IndexMap;

use serde::{Deserialize, Serialize};

use serde_json::Value;

use crate::role::Role;

/// Definition of a single command inside a trait.
///
/// `parameters`, `progress` and `results` hold free-form schemas; the device
/// core only inspects `minimal_role`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDef {
    /// Parameter schema, if the command takes parameters.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
    /// The least privileged role allowed to issue the command.
    pub minimal_role: Role,
    /// Progress schema, for commands that report progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    /// Results schema, for commands that produce results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
}

/// Definition of a trait: its commands and its state properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraitDef {
    /// Commands declared by the trait, keyed by bare command name.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub commands: IndexMap<String, CommandDef>,
    /// State property schemas, keyed by property name.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub state: IndexMap<String, Value>,
}

impl TraitDef {
    /// Returns the definition of the given command, when declared.
    #[must_use]
    pub fn command(&self, name: &str) -> Option<&CommandDef> {
        self.commands.get(name)
    }
}

/// A fully qualified command name of the form `trait.command`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandName {
    /// The trait declaring the command.
    pub trait_name: String,
    /// The bare command name inside the trait.
    pub command: String,
}

impl CommandName {
    /// Parses a `trait.command` name.
    ///
    /// The return value is [`None`] unless the input consists of exactly two
    /// non-empty parts separated by a single `.`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.split('.');
        let trait_name = parts.next()?;
        let command = parts.next()?;
        if trait_name.is_empty() || command.is_empty() || parts.next().is_some() {
            return None;
        }
        Some(Self {
            trait_name: trait_name.to_owned(),
            command: command.to_owned(),
        })
    }
}

impl core::fmt::Display for CommandName {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "{}.{}", self.trait_name, self.command)
    }
}
