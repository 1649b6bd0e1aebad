//! Per-stream value and data planes
//!
//! A [`Stream`] carries fungible value and ordered bytes in both directions.
//! The value plane tracks send/receive ceilings, running totals, and the
//! holds backing in-flight packets. The data plane reassembles incoming
//! bytes in offset order and queues outgoing bytes behind the remote's
//! advertised window.
//!
//! Streams live inside the connection's registry; every method here is
//! driven either by the application (through the connection's API) or by
//! the connection's send loop and inbound handler.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap, VecDeque};
use thiserror::Error;

/// Stream identifier. Odd ids are initiator-originated, even ids
/// responder-originated.
pub type StreamId = u64;

/// Stream-level errors
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream closed")]
    Closed,

    #[error("Byte offset overflow")]
    OffsetOverflow,
}

/// Incoming data-plane cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingOffsets {
    /// Highest byte offset received so far.
    pub max: u64,
    /// Read cursor: everything below has been handed to the reader.
    pub current: u64,
    /// Highest offset this stream will currently accept.
    pub max_acceptable: u64,
}

/// Outgoing data-plane cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingOffsets {
    /// Next fresh byte to leave this endpoint.
    pub current: u64,
    /// Offset the queue would reach if fully sent.
    pub end: u64,
}

/// A chunk of outgoing data pulled for one packet.
#[derive(Debug, Clone)]
pub struct DataChunk {
    pub data: Bytes,
    pub offset: u64,
}

/// One bidirectional money-and-data stream.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    open: bool,
    sent_end: bool,
    remote_closed: bool,
    remote_sent_end: bool,
    error_message: Option<String>,

    // value plane
    send_max: u64,
    total_sent: u64,
    receive_max: u64,
    total_received: u64,
    /// `None` until the remote advertises; treated as unlimited, since the
    /// remote guards its own ceiling and tells us where it is on rejection.
    remote_receive_max: Option<u64>,
    remote_received: u64,
    holds: HashMap<u64, u64>,

    // data plane, incoming
    incoming: BTreeMap<u64, Bytes>,
    read_offset: u64,
    max_received_offset: u64,
    buffered_bytes: u64,

    // data plane, outgoing
    outgoing: VecDeque<Bytes>,
    queued_bytes: u64,
    sent_offset: u64,
    retransmit: BTreeMap<u64, Bytes>,
    remote_max_offset: u64,
}

impl Stream {
    /// `remote_data_window` seeds the outgoing byte window with the
    /// default the remote is assumed to run until it advertises its own.
    pub(crate) fn new(id: StreamId, remote_data_window: u64) -> Stream {
        Stream {
            id,
            open: true,
            sent_end: false,
            remote_closed: false,
            remote_sent_end: false,
            error_message: None,
            send_max: 0,
            total_sent: 0,
            receive_max: 0,
            total_received: 0,
            remote_receive_max: None,
            remote_received: 0,
            holds: HashMap::new(),
            incoming: BTreeMap::new(),
            read_offset: 0,
            max_received_offset: 0,
            buffered_bytes: 0,
            outgoing: VecDeque::new(),
            queued_bytes: 0,
            sent_offset: 0,
            retransmit: BTreeMap::new(),
            remote_max_offset: remote_data_window,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// True until the local side ends the stream.
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn remote_closed(&self) -> bool {
        self.remote_closed
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// End the local side. Queued value and data still drain before the
    /// close is announced.
    pub fn end(&mut self, error_message: Option<String>) {
        self.open = false;
        if self.error_message.is_none() {
            self.error_message = error_message;
        }
    }

    pub(crate) fn sent_end(&self) -> bool {
        self.sent_end
    }

    pub(crate) fn mark_end_sent(&mut self) {
        self.sent_end = true;
    }

    pub(crate) fn mark_remote_end(&mut self, error_message: Option<String>) {
        self.remote_closed = true;
        self.remote_sent_end = true;
        if self.error_message.is_none() {
            self.error_message = error_message;
        }
    }

    // ----- value plane -----

    pub fn send_max(&self) -> u64 {
        self.send_max
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn receive_max(&self) -> u64 {
        self.receive_max
    }

    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    pub fn remote_receive_max(&self) -> Option<u64> {
        self.remote_receive_max
    }

    pub fn remote_received(&self) -> u64 {
        self.remote_received
    }

    /// Raise the total amount this stream intends to send. Never lowered.
    pub fn set_send_max(&mut self, send_max: u64) {
        self.send_max = self.send_max.max(send_max);
    }

    /// Raise the total amount this stream is willing to receive.
    pub fn set_receive_max(&mut self, receive_max: u64) {
        self.receive_max = self.receive_max.max(receive_max);
    }

    /// Value available for new outgoing holds.
    pub fn available_to_send(&self) -> u64 {
        let held: u64 = self.holds.values().sum();
        self.send_max
            .saturating_sub(self.total_sent)
            .saturating_sub(held)
    }

    /// Value this stream can still accept.
    pub fn can_receive(&self) -> u64 {
        self.receive_max.saturating_sub(self.total_received)
    }

    /// Reserve `amount` against the outbound packet `sequence`.
    pub fn hold_outgoing(&mut self, sequence: u64, amount: u64) {
        if amount > 0 {
            self.holds.insert(sequence, amount);
        }
    }

    /// The packet fulfilled: the hold becomes sent value.
    pub fn execute_hold(&mut self, sequence: u64) -> u64 {
        match self.holds.remove(&sequence) {
            Some(amount) => {
                self.total_sent = self.total_sent.saturating_add(amount);
                amount
            }
            None => 0,
        }
    }

    /// The packet was rejected: the hold returns to the sendable pool.
    pub fn cancel_hold(&mut self, sequence: u64) -> u64 {
        self.holds.remove(&sequence).unwrap_or(0)
    }

    pub(crate) fn holds_outstanding(&self) -> u64 {
        self.holds.values().sum()
    }

    pub(crate) fn cancel_all_holds(&mut self) {
        self.holds.clear();
    }

    /// Credit received value.
    pub fn add_received(&mut self, amount: u64) {
        self.total_received = self.total_received.saturating_add(amount);
    }

    /// Update the remote receive ceiling from a StreamMaxMoney frame.
    /// Both fields are monotone; stale frames cannot regress them.
    pub fn update_remote_money(&mut self, receive_max: u64, total_received: u64) {
        self.remote_receive_max = Some(match self.remote_receive_max {
            Some(current) => current.max(receive_max),
            None => receive_max,
        });
        self.remote_received = self.remote_received.max(total_received);
    }

    /// Value the remote can still accept, in its own units. Unlimited until
    /// the remote advertises a ceiling.
    pub fn remote_money_window(&self) -> u64 {
        match self.remote_receive_max {
            Some(max) => max.saturating_sub(self.remote_received),
            None => u64::MAX,
        }
    }

    // ----- data plane, outgoing -----

    /// Queue bytes to send.
    pub fn write(&mut self, data: Bytes) -> Result<(), StreamError> {
        if !self.open {
            return Err(StreamError::Closed);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.queued_bytes = self
            .queued_bytes
            .checked_add(data.len() as u64)
            .ok_or(StreamError::OffsetOverflow)?;
        self.outgoing.push_back(data);
        Ok(())
    }

    /// Update the remote's data window from a StreamMaxData frame.
    pub fn update_remote_max_offset(&mut self, max_offset: u64) {
        self.remote_max_offset = self.remote_max_offset.max(max_offset);
    }

    pub fn remote_max_offset(&self) -> u64 {
        self.remote_max_offset
    }

    /// Bytes queued but not yet dispatched (retransmits included).
    pub fn bytes_pending(&self) -> u64 {
        let retransmit: u64 = self.retransmit.values().map(|d| d.len() as u64).sum();
        self.queued_bytes + retransmit
    }

    /// True when data is queued but the remote window forbids sending it.
    pub fn is_data_blocked(&self) -> bool {
        self.queued_bytes > 0 && self.sent_offset >= self.remote_max_offset
    }

    /// Pull one contiguous chunk for the next packet: retransmits first,
    /// then fresh bytes up to both `max_bytes` and the remote window.
    pub fn get_available_data_to_send(&mut self, max_bytes: usize) -> Option<DataChunk> {
        if max_bytes == 0 {
            return None;
        }

        // Retransmitted data already fit the window when first sent.
        if let Some((&offset, _)) = self.retransmit.iter().next() {
            let mut data = self.retransmit.remove(&offset).unwrap_or_default();
            if data.len() > max_bytes {
                let tail = data.split_off(max_bytes);
                self.retransmit.insert(offset + max_bytes as u64, tail);
            }
            return Some(DataChunk { data, offset });
        }

        let window = self.remote_max_offset.saturating_sub(self.sent_offset);
        let budget = (max_bytes as u64).min(window).min(self.queued_bytes);
        if budget == 0 {
            return None;
        }

        let offset = self.sent_offset;
        let mut chunk = BytesMut::with_capacity(budget as usize);
        let mut remaining = budget as usize;
        while remaining > 0 {
            let Some(mut front) = self.outgoing.pop_front() else {
                break;
            };
            if front.len() > remaining {
                chunk.extend_from_slice(&front[..remaining]);
                front.advance(remaining);
                self.outgoing.push_front(front);
                remaining = 0;
            } else {
                remaining -= front.len();
                chunk.extend_from_slice(&front);
            }
        }

        let sent = chunk.len() as u64;
        self.queued_bytes -= sent;
        self.sent_offset += sent;
        Some(DataChunk {
            data: chunk.freeze(),
            offset,
        })
    }

    /// Return a rejected packet's data for retransmission.
    pub fn resend_outgoing_data(&mut self, data: Bytes, offset: u64) {
        if !data.is_empty() {
            self.retransmit.insert(offset, data);
        }
    }

    pub fn outgoing_offsets(&self) -> OutgoingOffsets {
        OutgoingOffsets {
            current: self.sent_offset,
            end: self.sent_offset + self.queued_bytes,
        }
    }

    // ----- data plane, incoming -----

    /// Accept bytes at an absolute offset. Overlaps with already-buffered or
    /// already-read ranges are clipped; gaps are held until filled.
    pub fn push_incoming_data(&mut self, data: Bytes, offset: u64) -> Result<(), StreamError> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(StreamError::OffsetOverflow)?;
        self.max_received_offset = self.max_received_offset.max(end);

        let mut offset = offset;
        let mut data = data;

        // Clip below the read cursor.
        if offset < self.read_offset {
            let skip = (self.read_offset - offset) as usize;
            if skip >= data.len() {
                return Ok(());
            }
            data.advance(skip);
            offset = self.read_offset;
        }

        // Clip against the chunk ending at or after our start.
        if let Some((&prev_offset, prev)) = self.incoming.range(..=offset).next_back() {
            let prev_end = prev_offset + prev.len() as u64;
            if prev_end > offset {
                let skip = (prev_end - offset) as usize;
                if skip >= data.len() {
                    return Ok(());
                }
                data.advance(skip);
                offset = prev_end;
            }
        }

        // Truncate at the next chunk's start so stored chunks never overlap.
        if let Some((&next_offset, _)) = self.incoming.range(offset..).next() {
            let max_len = (next_offset - offset) as usize;
            if max_len == 0 {
                return Ok(());
            }
            data.truncate(max_len);
        }

        if !data.is_empty() {
            self.buffered_bytes += data.len() as u64;
            self.incoming.insert(offset, data);
        }
        Ok(())
    }

    /// Contiguous bytes available at the read cursor.
    pub fn readable_length(&self) -> u64 {
        let mut cursor = self.read_offset;
        for (&offset, chunk) in self.incoming.range(self.read_offset..) {
            if offset != cursor {
                break;
            }
            cursor += chunk.len() as u64;
        }
        cursor - self.read_offset
    }

    /// Read up to `max_bytes` in offset order, stopping at the first gap.
    pub fn read(&mut self, max_bytes: usize) -> Bytes {
        let mut out = BytesMut::new();
        while out.len() < max_bytes {
            let Some((&offset, _)) = self.incoming.range(self.read_offset..).next() else {
                break;
            };
            if offset != self.read_offset {
                break; // gap
            }
            let mut chunk = self.incoming.remove(&offset).unwrap_or_default();
            let want = max_bytes - out.len();
            if chunk.len() > want {
                let tail = chunk.split_off(want);
                self.incoming.insert(offset + want as u64, tail);
            }
            self.read_offset += chunk.len() as u64;
            self.buffered_bytes -= chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }

    pub fn incoming_offsets(&self, max_buffered_data: u64) -> IncomingOffsets {
        IncomingOffsets {
            max: self.max_received_offset,
            current: self.read_offset,
            max_acceptable: self
                .read_offset
                .saturating_add(max_buffered_data)
                .saturating_sub(self.buffered_bytes),
        }
    }

    pub(crate) fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    pub(crate) fn read_offset(&self) -> u64 {
        self.read_offset
    }

    /// Everything the local side wanted to ship has left: no sendable
    /// value, no outstanding holds, no queued bytes.
    pub fn is_drained(&self) -> bool {
        self.available_to_send() == 0 && self.holds.is_empty() && self.bytes_pending() == 0
    }
}
