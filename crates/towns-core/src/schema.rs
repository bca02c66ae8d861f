//! Logical table registry and schema template formatting
//!
//! Schema templates and queries refer to tables through `%token%`
//! placeholders (`%user_data%`, `%town_data%`, `%claim_data%`). Formatting
//! swaps each placeholder for the physical table name configured for that
//! logical table, so every engine shares one logical schema.

use crate::error::{Result, TownsError};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::error;

static PLACEHOLDER: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"%(\w+)%").expect("placeholder pattern is valid"));

/// Statement separator used by schema resources
pub const STATEMENT_SEPARATOR: char = ';';

/// Logical tables known to the store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    UserData,
    TownData,
    ClaimData,
}

impl Table {
    pub fn all() -> &'static [Table] {
        &[Table::UserData, Table::TownData, Table::ClaimData]
    }

    /// Name used for placeholders and configuration keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::UserData => "user_data",
            Table::TownData => "town_data",
            Table::ClaimData => "claim_data",
        }
    }

    /// Physical name used when no override is configured
    pub fn default_name(&self) -> &'static str {
        match self {
            Table::UserData => "towns_users",
            Table::TownData => "towns_town_data",
            Table::ClaimData => "towns_claim_worlds",
        }
    }

    /// Match a placeholder token, ignoring case
    pub fn match_placeholder(token: &str) -> Result<Table> {
        Table::all()
            .iter()
            .copied()
            .find(|table| table.as_str().eq_ignore_ascii_case(token))
            .ok_or_else(|| {
                TownsError::Configuration(format!("Unknown table placeholder: %{}%", token))
            })
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resolves logical tables to configured physical names
pub trait TableNames {
    fn table_name(&self, table: Table) -> &str;
}

/// Default names only; handy where no settings are loaded
pub struct DefaultTableNames;

impl TableNames for DefaultTableNames {
    fn table_name(&self, table: Table) -> &str {
        table.default_name()
    }
}

/// Packaged schema templates, looked up by logical resource name
pub trait SchemaResources: Send + Sync {
    fn resource(&self, name: &str) -> Option<Cow<'static, str>>;
}

/// Replace every `%token%` placeholder with its physical table name.
///
/// Fails on the first unknown token; a partially substituted statement is
/// never returned.
pub fn format(statement: &str, names: &(impl TableNames + ?Sized)) -> Result<String> {
    let mut formatted = String::with_capacity(statement.len());
    let mut last = 0;
    for captures in PLACEHOLDER.captures_iter(statement) {
        let (Some(whole), Some(token)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let table = Table::match_placeholder(token.as_str())?;
        formatted.push_str(&statement[last..whole.start()]);
        formatted.push_str(names.table_name(table));
        last = whole.end();
    }
    formatted.push_str(&statement[last..]);
    Ok(formatted)
}

/// Split formatted schema text into trimmed, non-empty statements
pub fn split_statements(schema: &str) -> Vec<String> {
    schema
        .split(STATEMENT_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Load, format and split the schema resource `database/<schema_file>`.
///
/// A missing resource is logged and yields no statements, leaving the
/// backend uninitialized; an unknown placeholder is returned as an error.
pub fn load_schema(
    resources: &dyn SchemaResources,
    schema_file: &str,
    names: &(impl TableNames + ?Sized),
) -> Result<Vec<String>> {
    let resource_name = format!("database/{}", schema_file);
    let Some(schema) = resources.resource(&resource_name) else {
        error!("Failed to load database schema: no resource named {}", resource_name);
        return Ok(Vec::new());
    };
    Ok(split_statements(&format(&schema, names)?))
}
