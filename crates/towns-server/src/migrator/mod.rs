//! Data migrators available to the host

pub mod legacy;

pub use legacy::LegacyMigrator;

use std::sync::Arc;
use towns_core::{Migrator, Settings};

/// Names accepted by [`find_migrator`]
pub const MIGRATORS: &[&str] = &["legacy"];

/// Look up a migrator by name, ignoring case
pub fn find_migrator(name: &str, settings: Arc<Settings>) -> Option<Arc<dyn Migrator>> {
    match name.to_ascii_lowercase().as_str() {
        "legacy" => Some(Arc::new(LegacyMigrator::new(settings))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_migrator() {
        let settings = Arc::new(Settings::default());
        let migrator = find_migrator("Legacy", settings.clone()).unwrap();
        assert_eq!(migrator.name(), "Legacy");
        assert!(find_migrator("husk", settings).is_none());
    }
}
