//! Connection-level data flow control
//!
//! Two independent byte windows, one per direction. Outgoing bytes are
//! bounded by the remote's ConnectionMaxData advertisements; incoming bytes
//! are bounded by our own buffer size above what the application has read.

use crate::MAX_DATA_SIZE;

pub(crate) struct FlowController {
    max_buffered_data: u64,
    /// Highest total outgoing byte offset the remote will accept.
    remote_max_offset: u64,
    /// Total fresh stream-data bytes dispatched (sum of stream sent
    /// cursors).
    total_sent: u64,
}

impl FlowController {
    pub(crate) fn new(max_buffered_data: u64) -> FlowController {
        FlowController {
            max_buffered_data,
            // Assume the remote runs the default window until it says
            // otherwise.
            remote_max_offset: max_buffered_data,
            total_sent: 0,
        }
    }

    pub(crate) fn max_buffered_data(&self) -> u64 {
        self.max_buffered_data
    }

    pub(crate) fn remote_max_offset(&self) -> u64 {
        self.remote_max_offset
    }

    /// Apply a ConnectionMaxData advertisement. Large values only ever
    /// raise the ceiling; small ones override it downward on the assumption
    /// the remote's buffer shrank.
    pub(crate) fn on_connection_max_data(&mut self, max_offset: u64) {
        if max_offset > 2 * MAX_DATA_SIZE as u64 {
            self.remote_max_offset = self.remote_max_offset.max(max_offset);
        } else {
            self.remote_max_offset = max_offset;
        }
    }

    /// Bytes of fresh stream data the connection may still dispatch.
    pub(crate) fn outgoing_window(&self) -> u64 {
        self.remote_max_offset.saturating_sub(self.total_sent)
    }

    pub(crate) fn add_sent(&mut self, bytes: u64) {
        self.total_sent = self.total_sent.saturating_add(bytes);
    }

    /// The ConnectionMaxData value to advertise: everything delivered to
    /// readers plus one full buffer.
    pub(crate) fn local_max_data(&self, total_read: u64) -> u64 {
        total_read.saturating_add(self.max_buffered_data)
    }

    /// Check the incoming side: the bytes currently buffered across all
    /// streams may not exceed one connection buffer.
    pub(crate) fn incoming_within_limits(&self, total_buffered: u64) -> bool {
        total_buffered <= self.max_buffered_data
    }
}
