// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Per-edge runtime type descriptors.
//!
//! Every stream edge carries a [`PacketType`] declared by its calculator's
//! contract. `SameAs` links tie two edges' types together (a pass-through node
//! produces whatever it consumes); they are resolved once at graph validation
//! time through [`resolve_same_as`], an explicit union-find over the graph's
//! edge type slots, so per-packet validation never chases links.

use crate::error::{FlowGraphError, Result};
use crate::packet::{type_key_of, Packet, TypeKey};

/// Reference to another edge of the same node, used by `SameAs` declarations
/// inside a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeRef {
    Input(usize),
    Output(usize),
}

/// The type descriptor of one edge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PacketType {
    /// Rejects every packet. The initial state of an undeclared edge; also
    /// usable for deliberately unused edges.
    #[default]
    None,
    /// Accepts any non-empty packet.
    Any,
    /// Accepts only payloads with this type key.
    Exactly { type_key: TypeKey },
    /// This edge's type is the same as another edge's. Must be resolved at
    /// validation time; validating against an unresolved link is an error.
    SameAs(EdgeRef),
}

impl PacketType {
    /// Declares a concrete payload type.
    pub fn set<T: 'static>(&mut self) {
        *self = Self::Exactly { type_key: type_key_of::<T>() };
    }

    pub fn set_any(&mut self) {
        *self = Self::Any;
    }

    pub fn set_none(&mut self) {
        *self = Self::None;
    }

    pub fn set_same_as(&mut self, other: EdgeRef) {
        *self = Self::SameAs(other);
    }

    pub const fn is_same_as(&self) -> bool {
        matches!(self, Self::SameAs(_))
    }

    /// Checks whether `packet` may be accepted onto an edge of this type.
    pub fn validate(&self, packet: &Packet) -> Result<()> {
        match self {
            Self::None => Err(FlowGraphError::InvalidArgument(
                "stream is typed None and accepts no packets".to_string(),
            )),
            Self::Any => {
                if packet.is_empty() {
                    Err(FlowGraphError::InvalidArgument(
                        "empty packet is not allowed on a stream".to_string(),
                    ))
                } else {
                    Ok(())
                }
            },
            Self::Exactly { type_key } => match packet.type_key() {
                Some(key) if key == *type_key => Ok(()),
                Some(key) => Err(FlowGraphError::InvalidArgument(format!(
                    "packet of type {key} is not allowed on a stream of type {type_key}"
                ))),
                None => Err(FlowGraphError::InvalidArgument(format!(
                    "empty packet is not allowed on a stream of type {type_key}"
                ))),
            },
            Self::SameAs(_) => Err(FlowGraphError::Internal(
                "SameAs packet type was not resolved at validation time".to_string(),
            )),
        }
    }
}

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u32>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect(), rank: vec![0; n] }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // Path compression.
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) -> usize {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return ra;
        }
        if self.rank[ra] < self.rank[rb] {
            self.parent[ra] = rb;
            rb
        } else if self.rank[ra] > self.rank[rb] {
            self.parent[rb] = ra;
            ra
        } else {
            self.parent[rb] = ra;
            self.rank[ra] += 1;
            ra
        }
    }
}

/// Resolves `SameAs` links across a set of edge type slots.
///
/// `constraints[i]` holds slot `i`'s own declared type (`None` for a slot
/// declared only through links), and each entry of `links` unifies two slots.
/// A set with no concrete constraint (including a pure link cycle) resolves to
/// `Any`; conflicting concrete constraints are a configuration error.
pub fn resolve_same_as(
    constraints: &[Option<PacketType>],
    links: &[(usize, usize)],
) -> Result<Vec<PacketType>> {
    let n = constraints.len();
    let mut uf = UnionFind::new(n);
    for &(a, b) in links {
        uf.union(a, b);
    }

    // Fold each slot's own constraint into its set representative.
    let mut resolved: Vec<Option<PacketType>> = vec![None; n];
    for (slot, constraint) in constraints.iter().enumerate() {
        let Some(constraint) = constraint else { continue };
        debug_assert!(!constraint.is_same_as(), "links must be passed separately");
        let root = uf.find(slot);
        match &resolved[root] {
            None | Some(PacketType::Any) => {
                if *constraint != PacketType::Any || resolved[root].is_none() {
                    resolved[root] = Some(constraint.clone());
                }
            },
            Some(existing) if existing == constraint || *constraint == PacketType::Any => {},
            Some(existing) => {
                return Err(FlowGraphError::Configuration(format!(
                    "conflicting types for linked edges: {existing:?} vs {constraint:?}"
                )));
            },
        }
    }

    Ok((0..n)
        .map(|slot| {
            let root = uf.find(slot);
            resolved[root].clone().unwrap_or(PacketType::Any)
        })
        .collect())
}
