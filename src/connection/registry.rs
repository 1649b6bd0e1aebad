//! Stream registry: id parity, limits, lifecycle
//!
//! Streams are owned here, keyed by id. Locally-originated ids share the
//! connection role's parity; ids arriving from the peer must carry the
//! opposite parity. A closed id is remembered and never reopened.

use super::Role;
use crate::packet::ErrorCode;
use crate::stream::{Stream, StreamId};
use std::collections::{BTreeMap, BTreeSet};

/// Fatal outcome of accepting a remote stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptError {
    /// Remote used our parity.
    WrongParity,
    /// Remote exceeded the advertised stream-id ceiling.
    BeyondLimit,
}

impl AcceptError {
    pub(crate) fn error_code(self) -> ErrorCode {
        match self {
            AcceptError::WrongParity => ErrorCode::ProtocolViolation,
            AcceptError::BeyondLimit => ErrorCode::StreamIdError,
        }
    }
}

/// Result of a successful accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Accepted {
    pub newly_created: bool,
    /// Set when the peer is nearing the id ceiling and a fresh
    /// ConnectionMaxStreamId advertisement is due.
    pub advertise_max: Option<u64>,
}

pub(crate) struct StreamRegistry {
    role: Role,
    streams: BTreeMap<StreamId, Stream>,
    closed: BTreeSet<StreamId>,
    next_stream_id: StreamId,
    /// Ceiling we enforce on remote-originated ids.
    local_max_stream_id: u64,
    /// Ceiling the remote enforces on our ids.
    remote_max_stream_id: u64,
    /// Remote-originated streams that have fully closed; each one frees
    /// capacity for another.
    closed_remote_count: u64,
    max_remote_streams: u64,
    last_advertised_max: u64,
    /// Initial outgoing data window for new streams, until the remote
    /// advertises its own.
    default_data_window: u64,
}

impl StreamRegistry {
    pub(crate) fn new(
        role: Role,
        max_remote_streams: u64,
        default_data_window: u64,
    ) -> StreamRegistry {
        let initial_max = 2 * max_remote_streams;
        StreamRegistry {
            role,
            streams: BTreeMap::new(),
            closed: BTreeSet::new(),
            next_stream_id: role.first_stream_id(),
            local_max_stream_id: initial_max,
            remote_max_stream_id: initial_max,
            closed_remote_count: 0,
            max_remote_streams,
            last_advertised_max: 0,
            default_data_window,
        }
    }

    pub(crate) fn get(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub(crate) fn is_closed(&self, id: StreamId) -> bool {
        self.closed.contains(&id)
    }

    pub(crate) fn ids(&self) -> Vec<StreamId> {
        self.streams.keys().copied().collect()
    }

    /// Streams in id order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Stream> {
        self.streams.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn remote_max_stream_id(&self) -> u64 {
        self.remote_max_stream_id
    }

    pub(crate) fn update_remote_max_stream_id(&mut self, max: u64) {
        self.remote_max_stream_id = self.remote_max_stream_id.max(max);
    }

    /// Open a locally-originated stream. `None` when the remote's ceiling
    /// blocks the next id; the caller advertises ConnectionStreamIdBlocked.
    pub(crate) fn create_local(&mut self) -> Option<StreamId> {
        let id = self.next_stream_id;
        if id > self.remote_max_stream_id {
            return None;
        }
        self.next_stream_id += 2;
        self.streams
            .insert(id, Stream::new(id, self.default_data_window));
        Some(id)
    }

    /// Ensure a remote-originated stream exists, enforcing parity and the
    /// id ceiling.
    pub(crate) fn accept_remote(&mut self, id: StreamId) -> Result<Accepted, AcceptError> {
        if self.role.owns_id(id) {
            return Err(AcceptError::WrongParity);
        }
        if id > self.local_max_stream_id {
            return Err(AcceptError::BeyondLimit);
        }

        let newly_created = if self.streams.contains_key(&id) {
            false
        } else {
            self.streams
                .insert(id, Stream::new(id, self.default_data_window));
            true
        };

        // Nearing the ceiling: advertise it so the peer keeps opening
        // streams without a round-trip stall. Re-advertised only once the
        // ceiling moves.
        let advertise_max = if 4 * id > 3 * self.local_max_stream_id
            && self.last_advertised_max < self.local_max_stream_id
        {
            self.last_advertised_max = self.local_max_stream_id;
            Some(self.local_max_stream_id)
        } else {
            None
        };

        Ok(Accepted {
            newly_created,
            advertise_max,
        })
    }

    /// Remove a stream for good. Remote-originated removals raise the id
    /// ceiling by one stream's worth.
    pub(crate) fn remove(&mut self, id: StreamId) -> Option<Stream> {
        let stream = self.streams.remove(&id)?;
        self.closed.insert(id);
        if !self.role.owns_id(id) {
            self.closed_remote_count += 1;
            self.local_max_stream_id =
                2 * self.max_remote_streams + 2 * self.closed_remote_count;
        }
        Some(stream)
    }

    pub(crate) fn local_max_stream_id(&self) -> u64 {
        self.local_max_stream_id
    }
}
