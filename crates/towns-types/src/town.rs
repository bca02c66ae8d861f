//! Town types

use crate::{RecordError, User};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Role weights stored against each member
pub mod roles {
    pub const RESIDENT: u32 = 1;
    pub const TRUSTED: u32 = 2;
    pub const MAYOR: u32 = 3;
}

/// A town. The id is assigned by the store and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Town {
    pub id: i32,
    pub name: String,
    pub mayor: Uuid,
    #[serde(default)]
    pub members: BTreeMap<Uuid, u32>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub farewell: Option<String>,
    #[serde(default)]
    pub money: f64,
    #[serde(default = "default_level")]
    pub level: u32,
    pub founded: DateTime<Utc>,
}

fn default_level() -> u32 {
    1
}

impl Town {
    /// Build a freshly founded town with `creator` as its mayor
    pub fn new(id: i32, name: impl Into<String>, creator: &User) -> Self {
        let mut members = BTreeMap::new();
        members.insert(creator.uuid, roles::MAYOR);
        Self {
            id,
            name: name.into(),
            mayor: creator.uuid,
            members,
            bio: None,
            greeting: None,
            farewell: None,
            money: 0.0,
            level: default_level(),
            founded: Utc::now(),
        }
    }

    pub fn add_member(&mut self, uuid: Uuid, role: u32) {
        self.members.insert(uuid, role);
    }

    pub fn remove_member(&mut self, uuid: &Uuid) -> Result<(), RecordError> {
        self.members
            .remove(uuid)
            .map(|_| ())
            .ok_or(RecordError::NotAMember(*uuid))
    }

    /// Hand the town over to an existing member
    pub fn set_mayor(&mut self, uuid: Uuid) -> Result<(), RecordError> {
        if !self.members.contains_key(&uuid) {
            return Err(RecordError::NotAMember(uuid));
        }
        self.members.insert(self.mayor, roles::TRUSTED);
        self.members.insert(uuid, roles::MAYOR);
        self.mayor = uuid;
        Ok(())
    }

    pub fn is_member(&self, uuid: &Uuid) -> bool {
        self.members.contains_key(uuid)
    }
}
