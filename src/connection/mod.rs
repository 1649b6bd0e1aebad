//! Connection core
//!
//! A [`Connection`] multiplexes money-and-data streams over one shared
//! secret. It owns every piece of mutable state (stream registry, flow
//! windows, sequence counter, queued control frames) and is driven from a
//! single logical task: the send loop builds and dispatches outbound
//! packets, and [`Connection::handle_prepare`] is invoked synchronously by
//! the transport driver for inbound ones. The two never run concurrently.

mod flow;
mod probe;
mod registry;

use crate::config::ConnectionConfig;
use crate::crypto::{random_condition, CryptoError, PacketCrypto};
use crate::packet::{ErrorCode, Frame, Packet, PacketType};
use crate::rate::Rate;
use crate::stream::{Stream, StreamId};
use crate::transport::{
    Fulfill, MaxPacketDetails, PacketOutcome, PacketSender, Prepare, Reject, RejectCode,
    TransportError,
};
use crate::MAX_DATA_SIZE;
use bytes::Bytes;
use flow::FlowController;
use registry::StreamRegistry;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// First retry delay after a temporary path error.
const RETRY_DELAY_START: Duration = Duration::from_millis(100);

/// Retry delays never grow past this.
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(12 * 60 * 60);

/// Reserved bytes per StreamData frame for its type, lengths, id, and
/// offset.
const STREAM_DATA_OVERHEAD: usize = 20;

/// Reserved bytes for the packet header fields around the frames.
const PACKET_HEADER_RESERVE: usize = 32;

/// Which endpoint this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection; originates odd stream ids.
    Initiator,
    /// Accepted the connection; originates even stream ids.
    Responder,
}

impl Role {
    pub(crate) fn first_stream_id(&self) -> StreamId {
        match self {
            Role::Initiator => 1,
            Role::Responder => 2,
        }
    }

    pub(crate) fn owns_id(&self, id: StreamId) -> bool {
        match self {
            Role::Initiator => id % 2 == 1,
            Role::Responder => id % 2 == 0,
        }
    }
}

/// Currency code and scale of one endpoint's asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDetails {
    pub code: String,
    pub scale: u8,
}

/// Notifications delivered to [`Connection::subscribe`] receivers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The first probe succeeded (initiator) or the peer announced itself
    /// (responder).
    Connect,
    /// The peer opened a stream.
    Stream(StreamId),
    /// Graceful close completed.
    End,
    /// The connection is gone, gracefully or not. Always the last event.
    Close,
    /// Fatal error; followed by `Close`.
    Error(ConnectionError),
}

/// Fatal connection errors surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    #[error("destination account unknown")]
    NoDestination,

    #[error("stream ids exhausted; blocked by the remote limit")]
    StreamIdBlocked,

    #[error("rate probe failed: {0}")]
    RateProbe(String),

    #[error("remote closed the connection: {code:?} {message}")]
    RemoteClosed { code: ErrorCode, message: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("flow control violated: {0}")]
    FlowControl(String),

    #[error("path error {code}: {message}")]
    Path { code: String, message: String },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("Connection timed out due to inactivity")]
    IdleTimeout,
}

impl ConnectionError {
    fn wire_code(&self) -> ErrorCode {
        match self {
            ConnectionError::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            ConnectionError::FlowControl(_) => ErrorCode::FlowControlError,
            ConnectionError::Closed
            | ConnectionError::IdleTimeout
            | ConnectionError::RemoteClosed { .. } => ErrorCode::NoError,
            _ => ErrorCode::InternalError,
        }
    }
}

/// Everything about one dispatched packet the response handlers need.
struct OutboundPacket {
    sequence: u64,
    source_amount: u64,
    min_destination: u64,
    packet: Packet,
    money: Vec<(StreamId, u64)>,
    data: Vec<(StreamId, u64, Bytes)>,
}

/// One endpoint of a payment-and-data streaming connection.
pub struct Connection<T: PacketSender> {
    transport: T,
    crypto: PacketCrypto,
    config: ConnectionConfig,
    role: Role,

    source_account: Option<String>,
    destination_account: Option<String>,
    local_asset: Option<AssetDetails>,
    remote_asset: Option<AssetDetails>,

    registry: StreamRegistry,
    flow: FlowController,

    next_sequence: u64,
    exchange_rate: Option<Rate>,
    max_packet_amount: Option<u64>,
    test_max_packet_amount: u64,
    last_packet_rate: Option<Rate>,

    total_sent: u64,
    total_delivered: u64,
    total_received: u64,

    queued_frames: Vec<Frame>,

    connected: bool,
    closed: bool,
    remote_closed: bool,
    remote_knows_our_address: bool,
    asset_details_sent: bool,
    sending: bool,
    close_requested: bool,
    close_frame_sent: bool,
    close_emitted: bool,

    last_error: Option<ConnectionError>,
    last_active: Instant,
    retry_delay: Duration,

    /// Read total as of the last window advertisement we queued.
    advertised_read_total: u64,

    subscribers: Vec<mpsc::UnboundedSender<ConnectionEvent>>,
    on_new_stream: Option<Box<dyn FnMut(&mut Stream) + Send>>,
}

impl<T: PacketSender> Connection<T> {
    /// Create a connection over `transport` from a shared secret of at
    /// least 32 bytes.
    pub fn new(
        transport: T,
        shared_secret: &[u8],
        role: Role,
        config: ConnectionConfig,
    ) -> Result<Connection<T>, crate::Error> {
        config.validate()?;
        let crypto = PacketCrypto::new(shared_secret)?;
        let registry = StreamRegistry::new(
            role,
            config.max_remote_streams,
            config.connection_buffer_size,
        );
        let flow = FlowController::new(config.connection_buffer_size);

        Ok(Connection {
            transport,
            crypto,
            role,
            source_account: None,
            destination_account: None,
            local_asset: None,
            remote_asset: None,
            registry,
            flow,
            next_sequence: 1,
            exchange_rate: None,
            max_packet_amount: None,
            test_max_packet_amount: u64::MAX,
            last_packet_rate: None,
            total_sent: 0,
            total_delivered: 0,
            total_received: 0,
            queued_frames: Vec::new(),
            connected: false,
            closed: false,
            remote_closed: false,
            remote_knows_our_address: false,
            asset_details_sent: false,
            sending: false,
            close_requested: false,
            close_frame_sent: false,
            close_emitted: false,
            last_error: None,
            last_active: Instant::now(),
            retry_delay: RETRY_DELAY_START,
            advertised_read_total: 0,
            subscribers: Vec::new(),
            on_new_stream: None,
            config,
        })
    }

    // ----- wiring -----

    pub fn set_source_account(&mut self, account: impl Into<String>) {
        self.source_account = Some(account.into());
    }

    pub fn set_destination_account(&mut self, account: impl Into<String>) {
        self.destination_account = Some(account.into());
    }

    pub fn set_local_asset(&mut self, code: impl Into<String>, scale: u8) {
        self.local_asset = Some(AssetDetails {
            code: code.into(),
            scale,
        });
    }

    /// Receive connection events. Every subscriber sees every event; a
    /// dropped receiver is silently forgotten.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Install a handler invoked synchronously when the peer opens a
    /// stream, before any of that packet's money is allocated. This is
    /// where a receiver raises the new stream's `receive_max`.
    pub fn set_stream_handler(&mut self, handler: impl FnMut(&mut Stream) + Send + 'static) {
        self.on_new_stream = Some(Box::new(handler));
    }

    // ----- accessors -----

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn destination_account(&self) -> Option<&str> {
        self.destination_account.as_deref()
    }

    pub fn remote_asset(&self) -> Option<&AssetDetails> {
        self.remote_asset.as_ref()
    }

    /// Measured exchange rate, once the probe has succeeded.
    pub fn exchange_rate(&self) -> Option<Rate> {
        self.exchange_rate
    }

    /// Delivered/sent ratio of the most recent fulfilled packet.
    pub fn last_packet_rate(&self) -> Option<Rate> {
        self.last_packet_rate
    }

    /// Path packet-size ceiling, once known.
    pub fn max_packet_amount(&self) -> Option<u64> {
        self.max_packet_amount
    }

    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    pub fn total_delivered(&self) -> u64 {
        self.total_delivered
    }

    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.registry.get(id)
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.registry.get_mut(id)
    }

    pub fn stream_count(&self) -> usize {
        self.registry.len()
    }

    /// Read up to `max_bytes` from a stream in offset order. Once reads
    /// free half a buffer's worth of window, fresh data-window
    /// advertisements are queued for the next outbound packet; follow up
    /// with [`Connection::maybe_start_send_loop`] to let a blocked sender
    /// resume.
    pub fn read_from_stream(&mut self, id: StreamId, max_bytes: usize) -> Bytes {
        let max_buffered = self.flow.max_buffered_data();
        let Some(stream) = self.registry.get_mut(id) else {
            return Bytes::new();
        };
        let data = stream.read(max_bytes);
        let stream_advert = stream.incoming_offsets(max_buffered).max_acceptable;

        let total_read: u64 = self.registry.iter().map(Stream::read_offset).sum();
        if total_read.saturating_sub(self.advertised_read_total) >= max_buffered / 2 {
            self.advertised_read_total = total_read;
            self.queued_frames.push(Frame::ConnectionMaxData {
                max_offset: self.flow.local_max_data(total_read),
            });
            self.queued_frames.push(Frame::StreamMaxData {
                stream_id: id,
                max_offset: stream_advert,
            });
        }
        data
    }

    // ----- lifecycle -----

    /// Open a locally-originated stream.
    pub fn create_stream(&mut self) -> Result<StreamId, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        match self.registry.create_local() {
            Some(id) => Ok(id),
            None => {
                self.queued_frames.push(Frame::ConnectionStreamIdBlocked {
                    max_stream_id: self.registry.remote_max_stream_id(),
                });
                Err(ConnectionError::StreamIdBlocked)
            }
        }
    }

    /// Bring the connection up. For the initiator this runs the send loop
    /// through its first successful probe; the responder becomes connected
    /// when the peer announces its address.
    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(self.last_error.clone().unwrap_or(ConnectionError::Closed));
        }
        if self.connected {
            return Ok(());
        }
        match self.role {
            Role::Initiator => {
                if self.destination_account.is_none() {
                    return Err(ConnectionError::NoDestination);
                }
                self.run_send_loop().await;
                if self.closed {
                    return Err(self.last_error.clone().unwrap_or(ConnectionError::Closed));
                }
                if !self.connected {
                    return Err(ConnectionError::RateProbe(
                        "connect did not complete".to_string(),
                    ));
                }
                Ok(())
            }
            Role::Responder => Ok(()),
        }
    }

    /// Graceful close: drain every stream's value and data, send
    /// ConnectionClose(NoError) in the final packet, emit `End` then
    /// `Close`.
    pub async fn end(&mut self) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        self.close_requested = true;
        for id in self.registry.ids() {
            if let Some(stream) = self.registry.get_mut(id) {
                stream.end(None);
            }
        }
        self.run_send_loop().await;
        if self.closed {
            // Destroyed while draining.
            return match &self.last_error {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            };
        }
        if !self.close_frame_sent {
            self.close_frame_sent = true;
            self.send_close_frame(ErrorCode::NoError, String::new()).await;
        }
        self.closed = true;
        if !self.close_emitted {
            self.close_emitted = true;
            self.emit(ConnectionEvent::End);
            self.emit(ConnectionEvent::Close);
        }
        Ok(())
    }

    /// Tear the connection down immediately. Never fails; at most one
    /// ConnectionClose leaves after this.
    pub async fn destroy(&mut self, error: Option<ConnectionError>) {
        if self.close_emitted {
            return;
        }
        debug!(?error, "destroying connection");
        self.closed = true;
        self.sending = false;
        for id in self.registry.ids() {
            if let Some(stream) = self.registry.get_mut(id) {
                stream.cancel_all_holds();
                stream.end(None);
            }
        }
        if !self.close_frame_sent {
            self.close_frame_sent = true;
            let code = error
                .as_ref()
                .map(ConnectionError::wire_code)
                .unwrap_or(ErrorCode::NoError);
            let message = error.as_ref().map(|e| e.to_string()).unwrap_or_default();
            self.send_close_frame(code, message).await;
        }
        self.finish_events(error);
    }

    async fn send_close_frame(&mut self, code: ErrorCode, message: String) {
        let mut packet = Packet::new(self.take_sequence(), PacketType::Prepare, 0);
        packet.frames.push(Frame::ConnectionClose { code, message });
        if let Ok(data) = self.seal_packet(&packet) {
            let prepare = Prepare {
                amount: 0,
                execution_condition: random_condition(),
                data,
            };
            // Best effort; the connection is going away regardless.
            let _ = self.transport.send_prepare(prepare).await;
            self.last_active = Instant::now();
        }
    }

    /// Time left on the idle clock, for the driver to sleep on. `None`
    /// when the timer is disabled or the connection is gone.
    pub fn time_until_idle(&self) -> Option<Duration> {
        if self.closed || self.config.idle_timeout_ms == 0 {
            return None;
        }
        let deadline = self.last_active + Duration::from_millis(self.config.idle_timeout_ms);
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    /// Destroy the connection if the idle deadline has passed. Returns
    /// whether it fired.
    pub async fn check_idle(&mut self) -> bool {
        if self.closed || self.config.idle_timeout_ms == 0 {
            return false;
        }
        if self.last_active.elapsed() >= Duration::from_millis(self.config.idle_timeout_ms) {
            self.destroy(Some(ConnectionError::IdleTimeout)).await;
            true
        } else {
            false
        }
    }

    // ----- send loop -----

    /// Idempotent wake-up: run the send loop unless one is already running.
    pub async fn maybe_start_send_loop(&mut self) {
        self.run_send_loop().await;
    }

    /// Single-flight send loop. Each iteration yields once so bursts of
    /// wake-ups coalesce into one packet, then builds and dispatches it.
    pub async fn run_send_loop(&mut self) {
        if self.sending || self.closed || self.destination_account.is_none() {
            return;
        }
        self.sending = true;
        loop {
            tokio::task::yield_now().await;
            if self.closed {
                break;
            }
            if self.exchange_rate.is_none() && !self.close_requested {
                match self.discover_path().await {
                    Ok(()) => {
                        if !self.connected {
                            self.connected = true;
                            self.emit(ConnectionEvent::Connect);
                        }
                        continue;
                    }
                    Err(error) => {
                        self.sending = false;
                        self.destroy(Some(error)).await;
                        return;
                    }
                }
            }
            let Some(outbound) = self.build_packet() else {
                break;
            };
            self.dispatch(outbound).await;
        }
        self.sending = false;
    }

    fn streams_drained(&self) -> bool {
        self.registry.iter().all(Stream::is_drained)
    }

    /// Assemble the next outbound packet, or `None` when nothing needs to
    /// move.
    fn build_packet(&mut self) -> Option<OutboundPacket> {
        let sequence = self.next_sequence;
        let mut frames: Vec<Frame> = std::mem::take(&mut self.queued_frames);
        let drained_control = !frames.is_empty();
        let mut has_close = false;

        // Announce locally-ended streams once they have nothing left to
        // drain.
        for id in self.registry.ids() {
            let Some(stream) = self.registry.get_mut(id) else {
                continue;
            };
            if !stream.is_open() && !stream.sent_end() && stream.is_drained() {
                let (code, message) = match stream.error_message() {
                    Some(msg) => (ErrorCode::ApplicationError, msg.to_string()),
                    None => (ErrorCode::NoError, String::new()),
                };
                stream.mark_end_sent();
                frames.push(Frame::StreamClose {
                    stream_id: id,
                    code,
                    message,
                });
                has_close = true;
            }
        }

        // Window advertisements for every open stream.
        let max_buffered = self.flow.max_buffered_data();
        for id in self.registry.ids() {
            let Some(stream) = self.registry.get(id) else {
                continue;
            };
            if !stream.is_open() {
                continue;
            }
            frames.push(Frame::StreamMaxMoney {
                stream_id: id,
                receive_max: stream.receive_max(),
                total_received: stream.total_received(),
            });
            frames.push(Frame::StreamMaxData {
                stream_id: id,
                max_offset: stream.incoming_offsets(max_buffered).max_acceptable,
            });
        }

        // Graceful close rides the last packet, once every stream drained.
        if self.close_requested && !self.close_frame_sent && self.streams_drained() {
            frames.push(Frame::ConnectionClose {
                code: ErrorCode::NoError,
                message: String::new(),
            });
            self.close_frame_sent = true;
            has_close = true;
        }

        // Money: allocate the packet's source amount across streams in id
        // order, capped by the packet-size ceiling and each stream's remote
        // window.
        let mut money: Vec<(StreamId, u64)> = Vec::new();
        let mut source_amount: u64 = 0;
        if let Some(rate) = self.exchange_rate {
            let mut remaining = self.test_max_packet_amount;
            for id in self.registry.ids() {
                if remaining == 0 {
                    break;
                }
                let Some(stream) = self.registry.get_mut(id) else {
                    continue;
                };
                let available = stream.available_to_send();
                if available == 0 {
                    continue;
                }
                let remote_cap = rate.div_ceil(stream.remote_money_window());
                let amount = available.min(remaining).min(remote_cap);
                if amount > 0 {
                    stream.hold_outgoing(sequence, amount);
                    frames.push(Frame::StreamMoney {
                        stream_id: id,
                        shares: amount,
                    });
                    money.push((id, amount));
                    source_amount += amount;
                    remaining -= amount;
                }
                if stream.available_to_send() > 0 && remote_cap <= amount && remaining > 0 {
                    frames.push(Frame::StreamMoneyBlocked {
                        stream_id: id,
                        send_max: stream.send_max(),
                        total_sent: stream.total_sent(),
                    });
                }
            }
        }

        // Data: fill what plaintext budget remains, bounded by the
        // connection-level window.
        let mut data: Vec<(StreamId, u64, Bytes)> = Vec::new();
        let frames_len: usize = frames.iter().map(Frame::encoded_len).sum();
        let mut budget = MAX_DATA_SIZE.saturating_sub(frames_len + PACKET_HEADER_RESERVE);
        let connection_window = self.flow.outgoing_window();
        let clamped = connection_window < budget as u64;
        if clamped {
            budget = connection_window as usize;
        }
        for id in self.registry.ids() {
            if budget <= STREAM_DATA_OVERHEAD {
                break;
            }
            let Some(stream) = self.registry.get_mut(id) else {
                continue;
            };
            let before = stream.outgoing_offsets().current;
            if let Some(chunk) = stream.get_available_data_to_send(budget - STREAM_DATA_OVERHEAD) {
                let fresh = stream.outgoing_offsets().current - before;
                self.flow.add_sent(fresh);
                budget = budget.saturating_sub(STREAM_DATA_OVERHEAD + chunk.data.len());
                frames.push(Frame::StreamData {
                    stream_id: id,
                    offset: chunk.offset,
                    data: chunk.data.clone(),
                });
                data.push((id, chunk.offset, chunk.data));
            }
            if stream.is_data_blocked() {
                frames.push(Frame::StreamDataBlocked {
                    stream_id: id,
                    max_offset: stream.remote_max_offset(),
                });
            }
        }
        if clamped && self.registry.iter().any(|s| s.bytes_pending() > 0) {
            frames.push(Frame::ConnectionDataBlocked {
                max_offset: self.flow.remote_max_offset(),
            });
        }

        // A packet with nothing but window advertisements is not worth a
        // transfer; stopping here is what lets the loop go idle.
        let must_send = source_amount > 0 || !data.is_empty() || has_close || drained_control;
        if !must_send {
            return None;
        }

        // Handshake frames lead the packet so the peer sets up its state
        // before processing the rest.
        let mut all_frames = self.handshake_frames();
        all_frames.extend(frames);

        let min_destination = match self.exchange_rate {
            Some(rate) => self
                .config
                .slippage
                .complement()
                .mul_floor(rate.mul_floor(source_amount)),
            None => 0,
        };

        let mut packet = Packet::new(sequence, PacketType::Prepare, min_destination);
        packet.frames = all_frames;
        self.next_sequence += 1;

        Some(OutboundPacket {
            sequence,
            source_amount,
            min_destination,
            packet,
            money,
            data,
        })
    }

    async fn dispatch(&mut self, outbound: OutboundPacket) {
        let data = match self.seal_packet(&outbound.packet) {
            Ok(data) => data,
            Err(error) => {
                self.destroy(Some(ConnectionError::Internal(error.to_string())))
                    .await;
                return;
            }
        };
        let condition = self.crypto.condition_for(&data);
        let prepare = Prepare {
            amount: outbound.source_amount,
            execution_condition: condition,
            data,
        };
        trace!(
            sequence = outbound.sequence,
            amount = outbound.source_amount,
            frames = outbound.packet.frames.len(),
            "dispatching packet"
        );

        match self.send_via_transport(prepare).await {
            Err(error) => {
                let message = error.to_string();
                self.destroy(Some(ConnectionError::Transport(message))).await;
            }
            Ok(PacketOutcome::Fulfilled(fulfill)) => self.on_fulfill(&outbound, condition, fulfill),
            Ok(PacketOutcome::Rejected(reject)) => self.on_reject(&outbound, reject).await,
        }
    }

    fn on_fulfill(&mut self, outbound: &OutboundPacket, condition: [u8; 32], fulfill: Fulfill) {
        if self.closed {
            return;
        }
        if PacketCrypto::condition(&fulfill.fulfillment) != condition {
            // The transport already released the money; note it and move on.
            warn!(sequence = outbound.sequence, "fulfillment does not match condition");
        }

        for (id, _) in &outbound.money {
            if let Some(stream) = self.registry.get_mut(*id) {
                stream.execute_hold(outbound.sequence);
            }
        }
        self.total_sent = self.total_sent.saturating_add(outbound.source_amount);
        self.mark_remote_knows_address();

        // Totals are recorded on every fulfillment; an undecodable response
        // still proves at least the demanded minimum arrived.
        let delivered =
            match self.open_response_packet(&fulfill.data, outbound.sequence, PacketType::Fulfill) {
                Some(response) => {
                    let amount = response.prepare_amount;
                    self.apply_control_frames(&response.frames);
                    amount
                }
                None => outbound.min_destination,
            };
        self.total_delivered = self.total_delivered.saturating_add(delivered);

        if outbound.source_amount > 0 {
            self.last_packet_rate = Rate::from_amounts(delivered, outbound.source_amount);

            // The ceiling held; feel for more headroom.
            if outbound.source_amount == self.test_max_packet_amount {
                self.test_max_packet_amount = match self.max_packet_amount {
                    Some(max) => self
                        .test_max_packet_amount
                        .saturating_add(max / 10)
                        .min(max),
                    None => self.test_max_packet_amount.saturating_mul(2),
                };
            }
        }
        self.retry_delay = RETRY_DELAY_START;
        self.reap_streams();
    }

    async fn on_reject(&mut self, outbound: &OutboundPacket, reject: Reject) {
        if self.closed {
            return;
        }
        for (id, _) in &outbound.money {
            if let Some(stream) = self.registry.get_mut(*id) {
                stream.cancel_hold(outbound.sequence);
            }
        }
        for (id, offset, data) in &outbound.data {
            if let Some(stream) = self.registry.get_mut(*id) {
                stream.resend_outgoing_data(data.clone(), *offset);
            }
        }

        let code = reject.code;
        if code == RejectCode::PACKET_TOO_LARGE {
            match MaxPacketDetails::from_bytes(&reject.data) {
                Some(details) if details.received > 0 => {
                    let cap = (outbound.source_amount as u128 * details.maximum as u128
                        / details.received as u128)
                        .min(u64::MAX as u128) as u64;
                    debug!(cap, "path reported packet-size ceiling");
                    if let Err(error) = self.reduce_max_packet(cap) {
                        self.destroy(Some(error)).await;
                    }
                }
                _ => {
                    // Ceiling unreported; halve the attempt.
                    self.test_max_packet_amount = (outbound.source_amount / 2).max(1);
                }
            }
        } else if code == RejectCode::APPLICATION_ERROR {
            if let Some(response) =
                self.open_response_packet(&reject.data, outbound.sequence, PacketType::Reject)
            {
                self.mark_remote_knows_address();
                self.apply_control_frames(&response.frames);
            }
        } else if code.is_temporary() {
            if code == RejectCode::INSUFFICIENT_LIQUIDITY {
                self.test_max_packet_amount = self
                    .test_max_packet_amount
                    .saturating_sub(self.test_max_packet_amount / 3)
                    .max(2);
            }
            debug!(code = %code, delay = ?self.retry_delay, "temporary path error; backing off");
            tokio::time::sleep(self.retry_delay).await;
            self.retry_delay = (self.retry_delay * 2).min(MAX_RETRY_DELAY);
        } else {
            self.destroy(Some(ConnectionError::Path {
                code: code.to_string(),
                message: reject.message,
            }))
            .await;
        }
    }

    // ----- inbound -----

    /// Handle one inbound transfer. Called synchronously by the transport
    /// driver; returns the response it should relay back.
    pub fn handle_prepare(&mut self, prepare: &Prepare) -> Result<Fulfill, Reject> {
        // Decrypt and decode; failures must leave connection state alone.
        let Ok(plaintext) = self.crypto.open(&prepare.data) else {
            return Err(Reject {
                code: RejectCode::UNEXPECTED_PAYMENT,
                message: "unable to decrypt packet".to_string(),
                data: Bytes::new(),
            });
        };
        let Ok(packet) = Packet::decode(&plaintext) else {
            return Err(Reject {
                code: RejectCode::UNEXPECTED_PAYMENT,
                message: "malformed packet".to_string(),
                data: Bytes::new(),
            });
        };
        self.last_active = Instant::now();
        let sequence = packet.sequence;

        if self.closed {
            return Err(self.build_reject(sequence, prepare.amount, Vec::new()));
        }
        if packet.packet_type != PacketType::Prepare {
            return Err(self.build_reject(sequence, prepare.amount, Vec::new()));
        }

        // Stream bookkeeping for every stream-bearing frame.
        let mut fresh_streams: Vec<StreamId> = Vec::new();
        for frame in &packet.frames {
            let Some(id) = frame.stream_id() else { continue };
            if self.registry.is_closed(id) {
                if frame.carries_value_or_data() {
                    self.queued_frames.push(Frame::StreamClose {
                        stream_id: id,
                        code: ErrorCode::StreamStateError,
                        message: "stream is closed".to_string(),
                    });
                    return Err(self.build_reject(sequence, prepare.amount, Vec::new()));
                }
                continue;
            }
            if self.role.owns_id(id) {
                if self.registry.get(id).is_none() {
                    return Err(self.fatal_reject(
                        sequence,
                        prepare.amount,
                        ErrorCode::ProtocolViolation,
                        "frame references a stream this endpoint never opened",
                    ));
                }
                continue;
            }
            match self.registry.accept_remote(id) {
                Ok(accepted) => {
                    if let Some(max) = accepted.advertise_max {
                        self.queued_frames
                            .push(Frame::ConnectionMaxStreamId { max_stream_id: max });
                    }
                    if accepted.newly_created {
                        fresh_streams.push(id);
                    }
                }
                Err(error) => {
                    return Err(self.fatal_reject(
                        sequence,
                        prepare.amount,
                        error.error_code(),
                        "stream id not acceptable",
                    ));
                }
            }
        }
        // Let the application size the new streams' windows before any of
        // this packet's money is allocated against them.
        if let Some(mut handler) = self.on_new_stream.take() {
            for id in &fresh_streams {
                if let Some(stream) = self.registry.get_mut(*id) {
                    handler(stream);
                }
            }
            self.on_new_stream = Some(handler);
        }
        for id in fresh_streams {
            debug!(stream = id, "remote opened stream");
            self.emit(ConnectionEvent::Stream(id));
        }

        // Control frames.
        self.apply_control_frames(&packet.frames);

        // Data frames, behind both flow-control windows. Byte delivery is
        // not conditional on the packet's money clearing.
        let max_buffered = self.flow.max_buffered_data();
        for frame in &packet.frames {
            let Frame::StreamData {
                stream_id,
                offset,
                data,
            } = frame
            else {
                continue;
            };
            let Some(stream) = self.registry.get_mut(*stream_id) else {
                continue;
            };
            let Some(end) = offset.checked_add(data.len() as u64) else {
                return Err(self.fatal_reject(
                    sequence,
                    prepare.amount,
                    ErrorCode::FlowControlError,
                    "data offset overflow",
                ));
            };
            let acceptable = stream.incoming_offsets(max_buffered).max_acceptable;
            if end > acceptable {
                warn!(
                    stream = stream_id,
                    end, acceptable, "stream data window violated"
                );
                return Err(self.fatal_reject(
                    sequence,
                    prepare.amount,
                    ErrorCode::FlowControlError,
                    "stream data exceeds advertised window",
                ));
            }
            if stream.push_incoming_data(data.clone(), *offset).is_err() {
                return Err(self.fatal_reject(
                    sequence,
                    prepare.amount,
                    ErrorCode::FlowControlError,
                    "data offset overflow",
                ));
            }
        }
        let total_buffered: u64 = self.registry.iter().map(Stream::buffered_bytes).sum();
        if !self.flow.incoming_within_limits(total_buffered) {
            return Err(self.fatal_reject(
                sequence,
                prepare.amount,
                ErrorCode::FlowControlError,
                "connection data window exceeded",
            ));
        }

        // The sender's minimum must have survived the path.
        if packet.prepare_amount > prepare.amount {
            trace!(
                want = packet.prepare_amount,
                got = prepare.amount,
                "rejecting: rate slipped below the sender's minimum"
            );
            return Err(self.build_reject(sequence, prepare.amount, Vec::new()));
        }

        // Can we actually claim this packet? Test packets land here.
        let fulfillment = self.crypto.fulfillment(&prepare.data);
        if PacketCrypto::condition(&fulfillment) != prepare.execution_condition {
            trace!(sequence, "rejecting unfulfillable packet");
            return Err(self.build_reject(sequence, prepare.amount, Vec::new()));
        }

        // Allocate money proportionally to shares.
        let money: Vec<(StreamId, u64)> = packet
            .frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::StreamMoney { stream_id, shares } => Some((*stream_id, *shares)),
                _ => None,
            })
            .collect();
        let total_shares: u128 = money.iter().map(|(_, shares)| *shares as u128).sum();
        let mut credits: Vec<(StreamId, u64)> = Vec::new();
        if total_shares > 0 {
            for (id, shares) in &money {
                let amount =
                    (prepare.amount as u128 * *shares as u128 / total_shares) as u64;
                let Some(stream) = self.registry.get_mut(*id) else {
                    continue;
                };
                if !stream.is_open() {
                    self.queued_frames.push(Frame::StreamClose {
                        stream_id: *id,
                        code: ErrorCode::StreamStateError,
                        message: "stream is closed".to_string(),
                    });
                    return Err(self.build_reject(sequence, prepare.amount, Vec::new()));
                }
                // 1% tolerance for connector rounding.
                if amount as u128 * 100 > stream.can_receive() as u128 * 101 {
                    trace!(stream = id, amount, "rejecting: stream receive limit exceeded");
                    let advert = Frame::StreamMaxMoney {
                        stream_id: *id,
                        receive_max: stream.receive_max(),
                        total_received: stream.total_received(),
                    };
                    self.queued_frames.push(advert);
                    return Err(self.build_reject(sequence, prepare.amount, Vec::new()));
                }
                credits.push((*id, amount));
            }
        }

        // Credit atomically with the fulfill decision.
        for (id, amount) in &credits {
            if let Some(stream) = self.registry.get_mut(*id) {
                stream.add_received(*amount);
            }
        }
        self.total_received = self.total_received.saturating_add(prepare.amount);

        // Respond with the fulfillment and our current windows.
        let frames = self.response_frames();
        let mut response = Packet::new(sequence, PacketType::Fulfill, prepare.amount);
        response.frames = frames;
        let data = self.seal_packet(&response).unwrap_or_default();
        self.reap_streams();
        Ok(Fulfill { fulfillment, data })
    }

    /// Frames attached to fulfill responses: our windows, asset details
    /// once, closes for streams that just drained, plus anything queued.
    fn response_frames(&mut self) -> Vec<Frame> {
        let mut frames = std::mem::take(&mut self.queued_frames);

        if !self.asset_details_sent {
            if let Some(asset) = self.local_asset.clone() {
                frames.push(Frame::ConnectionAssetDetails {
                    source_asset_code: asset.code,
                    source_asset_scale: asset.scale,
                });
                self.asset_details_sent = true;
            }
        }

        let total_read: u64 = self.registry.iter().map(Stream::read_offset).sum();
        self.advertised_read_total = total_read;
        frames.push(Frame::ConnectionMaxData {
            max_offset: self.flow.local_max_data(total_read),
        });

        let max_buffered = self.flow.max_buffered_data();
        for id in self.registry.ids() {
            let Some(stream) = self.registry.get_mut(id) else {
                continue;
            };
            if !stream.is_open() && !stream.sent_end() && stream.is_drained() {
                let (code, message) = match stream.error_message() {
                    Some(msg) => (ErrorCode::ApplicationError, msg.to_string()),
                    None => (ErrorCode::NoError, String::new()),
                };
                stream.mark_end_sent();
                frames.push(Frame::StreamClose {
                    stream_id: id,
                    code,
                    message,
                });
                continue;
            }
            if stream.is_open() {
                frames.push(Frame::StreamMaxMoney {
                    stream_id: id,
                    receive_max: stream.receive_max(),
                    total_received: stream.total_received(),
                });
                frames.push(Frame::StreamMaxData {
                    stream_id: id,
                    max_offset: stream.incoming_offsets(max_buffered).max_acceptable,
                });
            }
        }
        frames
    }

    /// Apply control frames from any packet: inbound prepares, fulfill
    /// responses, and decrypted reject responses all flow through here.
    pub(crate) fn apply_control_frames(&mut self, frames: &[Frame]) {
        for frame in frames {
            match frame {
                Frame::ConnectionNewAddress { source_account } => {
                    debug!(account = %source_account, "peer announced its address");
                    self.destination_account = Some(source_account.clone());
                    if !self.connected {
                        self.connected = true;
                        self.emit(ConnectionEvent::Connect);
                    }
                }
                Frame::ConnectionAssetDetails {
                    source_asset_code,
                    source_asset_scale,
                } => {
                    self.remote_asset = Some(AssetDetails {
                        code: source_asset_code.clone(),
                        scale: *source_asset_scale,
                    });
                }
                Frame::ConnectionClose { code, message } => {
                    debug!(?code, message, "remote closed the connection");
                    self.remote_closed = true;
                    self.closed = true;
                    self.sending = false;
                    self.close_frame_sent = true;
                    if *code == ErrorCode::NoError {
                        if !self.close_emitted {
                            self.close_emitted = true;
                            self.emit(ConnectionEvent::End);
                            self.emit(ConnectionEvent::Close);
                        }
                    } else {
                        self.finish_events(Some(ConnectionError::RemoteClosed {
                            code: *code,
                            message: message.clone(),
                        }));
                    }
                }
                Frame::ConnectionMaxData { max_offset } => {
                    self.flow.on_connection_max_data(*max_offset);
                }
                Frame::ConnectionMaxStreamId { max_stream_id } => {
                    self.registry.update_remote_max_stream_id(*max_stream_id);
                }
                Frame::ConnectionDataBlocked { max_offset } => {
                    trace!(max_offset, "peer is data-blocked at connection level");
                }
                Frame::ConnectionStreamIdBlocked { max_stream_id } => {
                    trace!(max_stream_id, "peer is blocked on stream ids");
                }
                Frame::StreamClose {
                    stream_id,
                    code,
                    message,
                } => {
                    if let Some(stream) = self.registry.get_mut(*stream_id) {
                        let error = if *code == ErrorCode::NoError || message.is_empty() {
                            None
                        } else {
                            Some(message.clone())
                        };
                        stream.mark_remote_end(error);
                        // A stream is bidirectional; the remote ending it
                        // ends our half as well, once drained.
                        stream.end(None);
                    }
                }
                Frame::StreamMaxMoney {
                    stream_id,
                    receive_max,
                    total_received,
                } => {
                    if let Some(stream) = self.registry.get_mut(*stream_id) {
                        stream.update_remote_money(*receive_max, *total_received);
                    }
                }
                Frame::StreamMaxData {
                    stream_id,
                    max_offset,
                } => {
                    if let Some(stream) = self.registry.get_mut(*stream_id) {
                        stream.update_remote_max_offset(*max_offset);
                    }
                }
                Frame::StreamMoneyBlocked { stream_id, .. } => {
                    trace!(stream = stream_id, "peer is money-blocked");
                }
                Frame::StreamDataBlocked { stream_id, .. } => {
                    trace!(stream = stream_id, "peer is data-blocked");
                }
                // Value and byte movement belongs to the prepare path.
                Frame::StreamMoney { .. } | Frame::StreamData { .. } => {}
            }
        }
    }

    /// Remove streams that both sides have closed, that hold nothing, and
    /// whose buffered bytes have all been read.
    fn reap_streams(&mut self) {
        for id in self.registry.ids() {
            let Some(stream) = self.registry.get(id) else {
                continue;
            };
            let finished = !stream.is_open()
                && stream.sent_end()
                && stream.remote_closed()
                && stream.holds_outstanding() == 0
                && stream.buffered_bytes() == 0;
            if finished {
                self.registry.remove(id);
            }
        }
    }

    // ----- rejects -----

    /// F99 reject carrying an encrypted inner packet; any frames queued so
    /// far are flushed into it.
    fn build_reject(&mut self, sequence: u64, received: u64, extra: Vec<Frame>) -> Reject {
        let mut frames = std::mem::take(&mut self.queued_frames);
        frames.extend(extra);
        let mut packet = Packet::new(sequence, PacketType::Reject, received);
        packet.frames = frames;
        let data = self.seal_packet(&packet).unwrap_or_default();
        Reject {
            code: RejectCode::APPLICATION_ERROR,
            message: String::new(),
            data,
        }
    }

    /// Reject carrying a ConnectionClose, and take the connection down
    /// locally. The close frame rides the response instead of a separate
    /// packet.
    fn fatal_reject(
        &mut self,
        sequence: u64,
        received: u64,
        code: ErrorCode,
        message: &str,
    ) -> Reject {
        let close = Frame::ConnectionClose {
            code,
            message: message.to_string(),
        };
        let reject = self.build_reject(sequence, received, vec![close]);
        let error = match code {
            ErrorCode::FlowControlError => ConnectionError::FlowControl(message.to_string()),
            _ => ConnectionError::ProtocolViolation(message.to_string()),
        };
        self.closed = true;
        self.sending = false;
        self.close_frame_sent = true;
        for id in self.registry.ids() {
            if let Some(stream) = self.registry.get_mut(id) {
                stream.cancel_all_holds();
            }
        }
        self.finish_events(Some(error));
        reject
    }

    // ----- shared plumbing -----

    fn emit(&mut self, event: ConnectionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn finish_events(&mut self, error: Option<ConnectionError>) {
        if self.close_emitted {
            return;
        }
        self.close_emitted = true;
        if let Some(error) = error {
            self.last_error = Some(error.clone());
            self.emit(ConnectionEvent::Error(error));
        }
        self.emit(ConnectionEvent::Close);
    }

    pub(crate) fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    pub(crate) fn seal_packet(&self, packet: &Packet) -> Result<Bytes, CryptoError> {
        let mut plaintext = packet.encode();
        if self.config.enable_padding && plaintext.len() < MAX_DATA_SIZE {
            plaintext.resize(MAX_DATA_SIZE, 0);
        }
        self.crypto.seal(&plaintext)
    }

    pub(crate) async fn send_via_transport(
        &mut self,
        prepare: Prepare,
    ) -> Result<PacketOutcome, TransportError> {
        let outcome = self.transport.send_prepare(prepare).await;
        self.last_active = Instant::now();
        outcome
    }

    /// Decrypt and validate a response packet: the sequence must match the
    /// request and the type must be the expected one.
    pub(crate) fn open_response_packet(
        &self,
        data: &[u8],
        sequence: u64,
        expected: PacketType,
    ) -> Option<Packet> {
        if data.is_empty() {
            return None;
        }
        let plaintext = self.crypto.open(data).ok()?;
        let packet = Packet::decode(&plaintext).ok()?;
        if packet.sequence != sequence {
            warn!(
                got = packet.sequence,
                want = sequence,
                "response sequence mismatch"
            );
            return None;
        }
        if packet.packet_type != expected {
            return None;
        }
        Some(packet)
    }

    /// Address and asset announcements, until a response proves the peer
    /// has decoded one of our packets.
    pub(crate) fn handshake_frames(&self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if !self.remote_knows_our_address {
            if let Some(account) = &self.source_account {
                frames.push(Frame::ConnectionNewAddress {
                    source_account: account.clone(),
                });
            }
            if let Some(asset) = &self.local_asset {
                frames.push(Frame::ConnectionAssetDetails {
                    source_asset_code: asset.code.clone(),
                    source_asset_scale: asset.scale,
                });
            }
        }
        frames
    }

    pub(crate) fn mark_remote_knows_address(&mut self) {
        self.remote_knows_our_address = true;
    }

    /// Lower the path packet-size ceiling; zero capacity is terminal.
    pub(crate) fn reduce_max_packet(&mut self, cap: u64) -> Result<(), ConnectionError> {
        let new_max = match self.max_packet_amount {
            Some(current) => current.min(cap),
            None => cap,
        };
        if new_max == 0 {
            return Err(ConnectionError::Path {
                code: "F08".to_string(),
                message: "path cannot carry any value".to_string(),
            });
        }
        self.max_packet_amount = Some(new_max);
        self.test_max_packet_amount = self.test_max_packet_amount.min(new_max);
        Ok(())
    }

    pub(crate) fn set_exchange_rate(&mut self, rate: Rate) {
        self.exchange_rate = Some(rate);
    }

    pub(crate) fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub(crate) fn set_retry_delay(&mut self, delay: Duration) {
        self.retry_delay = delay;
    }
}
