// SPDX-FileCopyrightText: © 2025 FlowGraph Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The type-erased, timestamped value that flows on every edge.
//!
//! A [`Packet`] owns its payload through an `Arc`, so fan-out to many
//! downstream consumers is a refcount increment rather than a copy. Payloads
//! are immutable once packed; a calculator that wants to modify data builds a
//! new packet.
//!
//! Payload type identity is compared through a stable process-wide key
//! ([`TypeKey`], derived from `std::any::type_name`) rather than by pointer,
//! so type checks stay correct across dynamically loaded modules.

use crate::error::{FlowGraphError, Result};
use crate::timestamp::Timestamp;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Stable process-wide identifier for a payload type. Always compared by
/// content, never by address.
pub type TypeKey = &'static str;

/// Returns the [`TypeKey`] for a payload type.
pub fn type_key_of<T: 'static>() -> TypeKey {
    std::any::type_name::<T>()
}

struct Holder {
    payload: Box<dyn Any + Send + Sync>,
    type_key: TypeKey,
}

/// A type-erased, reference-counted, immutable value stamped with a
/// [`Timestamp`].
///
/// Cloning is cheap (one atomic increment) and shares the payload. An *empty*
/// packet carries no payload; the runtime uses empty packets to represent
/// "no data at this timestamp" in an input set.
#[derive(Clone)]
pub struct Packet {
    holder: Option<Arc<Holder>>,
    timestamp: Timestamp,
}

impl Packet {
    /// Creates an empty packet with an unset timestamp.
    pub const fn empty() -> Self {
        Self { holder: None, timestamp: Timestamp::UNSET }
    }

    /// Packs a value. The payload type is fixed from this point on.
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self {
            holder: Some(Arc::new(Holder {
                payload: Box::new(value),
                type_key: type_key_of::<T>(),
            })),
            timestamp: Timestamp::UNSET,
        }
    }

    /// Returns this packet restamped with `timestamp`.
    #[must_use]
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub const fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub const fn is_empty(&self) -> bool {
        self.holder.is_none()
    }

    /// The payload's type key, or `None` for an empty packet.
    pub fn type_key(&self) -> Option<TypeKey> {
        self.holder.as_ref().map(|h| h.type_key)
    }

    /// Borrows the payload as `T`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the packet is empty or holds a different
    /// payload type.
    pub fn get<T: 'static>(&self) -> Result<&T> {
        let holder = self.holder.as_ref().ok_or_else(|| {
            FlowGraphError::InvalidArgument(format!(
                "packet at {} is empty, expected payload of type {}",
                self.timestamp,
                type_key_of::<T>()
            ))
        })?;
        // TypeKey comparison is by string content, which stays stable across
        // dynamically loaded modules where vtable addresses do not.
        if holder.type_key != type_key_of::<T>() {
            return Err(FlowGraphError::InvalidArgument(format!(
                "packet holds payload of type {}, expected {}",
                holder.type_key,
                type_key_of::<T>()
            )));
        }
        holder.payload.downcast_ref::<T>().ok_or_else(|| {
            FlowGraphError::Internal(format!(
                "payload downcast failed despite matching type key {}",
                holder.type_key
            ))
        })
    }

    /// True when both packets share one payload allocation. Used by tests to
    /// assert zero-copy propagation.
    pub fn shares_payload_with(&self, other: &Self) -> bool {
        match (&self.holder, &other.holder) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.holder {
            Some(h) => write!(f, "Packet<{}> at {}", h.type_key, self.timestamp),
            None => write!(f, "Packet<empty> at {}", self.timestamp),
        }
    }
}
