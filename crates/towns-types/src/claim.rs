//! Claim types

use crate::RecordError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A game world on a server. Used as a lookup key, never stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct World {
    pub uuid: Uuid,
    pub name: String,
    pub environment: String,
}

impl World {
    pub fn new(uuid: Uuid, name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            environment: environment.into(),
        }
    }
}

impl std::fmt::Display for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Addresses a world across every server of a deployment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerWorld {
    pub server: String,
    pub world: World,
}

impl ServerWorld {
    pub fn new(server: impl Into<String>, world: World) -> Self {
        Self {
            server: server.into(),
            world,
        }
    }
}

impl std::fmt::Display for ServerWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.server, self.world.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Chunk {
    pub x: i32,
    pub z: i32,
}

impl Chunk {
    pub fn at(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimType {
    #[default]
    Claim,
    Farm,
    Plot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub chunk: Chunk,
    #[serde(default, rename = "type")]
    pub claim_type: ClaimType,
}

impl Claim {
    pub fn new(chunk: Chunk, claim_type: ClaimType) -> Self {
        Self { chunk, claim_type }
    }
}

/// Every claimed chunk of one world, grouped by owning town id.
///
/// One claim world exists per (server, world) pair; the id is assigned by
/// the store when the world is first created.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClaimWorld {
    #[serde(skip)]
    pub id: i32,
    #[serde(default)]
    pub claims: BTreeMap<i32, Vec<Claim>>,
    #[serde(default)]
    pub admin_claims: Vec<Claim>,
}

impl ClaimWorld {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn claim_count(&self) -> usize {
        self.claims.values().map(Vec::len).sum::<usize>() + self.admin_claims.len()
    }

    /// The owning town (`None` for admin claims) and claim at `chunk`
    pub fn claim_at(&self, chunk: Chunk) -> Option<(Option<i32>, &Claim)> {
        self.claims
            .iter()
            .find_map(|(town, claims)| {
                claims
                    .iter()
                    .find(|c| c.chunk == chunk)
                    .map(|c| (Some(*town), c))
            })
            .or_else(|| {
                self.admin_claims
                    .iter()
                    .find(|c| c.chunk == chunk)
                    .map(|c| (None, c))
            })
    }

    pub fn add_claim(&mut self, town_id: i32, claim: Claim) -> Result<(), RecordError> {
        self.ensure_unclaimed(claim.chunk)?;
        self.claims.entry(town_id).or_default().push(claim);
        Ok(())
    }

    pub fn add_admin_claim(&mut self, claim: Claim) -> Result<(), RecordError> {
        self.ensure_unclaimed(claim.chunk)?;
        self.admin_claims.push(claim);
        Ok(())
    }

    /// Drop every claim belonging to a town, returning how many were removed
    pub fn remove_town_claims(&mut self, town_id: i32) -> usize {
        self.claims.remove(&town_id).map_or(0, |c| c.len())
    }

    fn ensure_unclaimed(&self, chunk: Chunk) -> Result<(), RecordError> {
        match self.claim_at(chunk) {
            Some(_) => Err(RecordError::AlreadyClaimed {
                x: chunk.x,
                z: chunk.z,
            }),
            None => Ok(()),
        }
    }
}
