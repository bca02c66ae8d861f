//! Schema templates packaged into the binary

use std::borrow::Cow;
use towns_core::schema::SchemaResources;

const SQLITE_SCHEMA: &str = include_str!("../../resources/database/sqlite_schema.sql");
const POSTGRESQL_SCHEMA: &str = include_str!("../../resources/database/postgresql_schema.sql");

pub struct PackagedSchemas;

impl SchemaResources for PackagedSchemas {
    fn resource(&self, name: &str) -> Option<Cow<'static, str>> {
        match name {
            "database/sqlite_schema.sql" => Some(Cow::Borrowed(SQLITE_SCHEMA)),
            "database/postgresql_schema.sql" => Some(Cow::Borrowed(POSTGRESQL_SCHEMA)),
            _ => None,
        }
    }
}
