// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Participant identities and collective keys.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Reserved rank value meaning "every rank of the namespace".
pub const RANK_WILDCARD: u32 = 0xFFFF_FFFE;

/// One participating process: a rank within a namespace.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcId {
    /// Job launch the rank belongs to
    pub namespace: String,
    /// Rank within the namespace, or [`RANK_WILDCARD`]
    pub rank: u32,
}

impl ProcId {
    /// A single rank.
    pub fn new(namespace: impl Into<String>, rank: u32) -> Self {
        Self {
            namespace: namespace.into(),
            rank,
        }
    }

    /// Every rank of `namespace`.
    pub fn wildcard(namespace: impl Into<String>) -> Self {
        Self::new(namespace, RANK_WILDCARD)
    }

    /// Whether this entry stands for the whole namespace.
    pub fn is_wildcard(&self) -> bool {
        self.rank == RANK_WILDCARD
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            write!(f, "{}:*", self.namespace)
        } else {
            write!(f, "{}:{}", self.namespace, self.rank)
        }
    }
}

/// Ordered list of participants of one collective.
///
/// Equality is by value: two sets naming the same processes in the same order
/// identify the same collective.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct ParticipantSet(Vec<ProcId>);

impl ParticipantSet {
    /// Wrap an ordered list of participants.
    pub fn new(procs: Vec<ProcId>) -> Self {
        Self(procs)
    }

    /// Ranks `0..nprocs` of one namespace.
    pub fn ranks(namespace: &str, nprocs: u32) -> Self {
        Self((0..nprocs).map(|r| ProcId::new(namespace, r)).collect())
    }

    /// Number of entries (a wildcard counts once).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over entries in order.
    pub fn iter(&self) -> std::slice::Iter<'_, ProcId> {
        self.0.iter()
    }

    /// Entries as a slice.
    pub fn as_slice(&self) -> &[ProcId] {
        &self.0
    }
}

/// Kind of collective. Only fences exist today.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CollType {
    /// Barrier with data exchange
    Fence = 0,
}

impl CollType {
    /// Decode the wire value.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(CollType::Fence),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            CollType::Fence => "fence",
        }
    }
}

/// Identity of a collective instance: type plus participant set.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CollKey {
    /// Collective kind
    pub coll_type: CollType,
    /// Participants, compared by value
    pub participants: ParticipantSet,
}

impl CollKey {
    /// Key of a fence over `participants`.
    pub fn fence(participants: ParticipantSet) -> Self {
        Self {
            coll_type: CollType::Fence,
            participants,
        }
    }

    /// Stable short hash used to tag log lines.
    pub fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for CollKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{:08x}[{}]",
            self.coll_type.name(),
            self.digest() as u32,
            self.participants.len()
        )
    }
}
