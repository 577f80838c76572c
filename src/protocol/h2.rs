use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::Method;
use tokio::sync::watch;

use crate::asgi::{AsgiMessage, HttpVersion};
use crate::codec::h2::{
    data_frame, goaway_frame, headers_frames, hpack, ping_frame, rst_frame, setting,
    settings_ack, settings_frame, window_update_frame, Frame, FrameCodec, FrameError, Reason,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE,
};
use crate::config::Config;
use crate::error::{BoxError, Error};
use crate::events::ConnectionEvent;
use crate::headers::header_value;
use crate::protocol::events::ProtocolEvent;
use crate::protocol::http_stream::HttpStream;
use crate::protocol::ws_stream::WsStream;
use crate::protocol::{Effect, Outbox, SendOutcome, StreamKind, StreamOut};
use crate::worker::WorkerContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    AwaitingPreface,
    Open,
    Closed,
}

struct H2Slot {
    stream: StreamKind,
    send_window: i64,
    pending: BytesMut,
    pending_end: bool,
    end_sent: bool,
    recv_done: bool,
    send_done: bool,
    pending_response_since: Option<tokio::time::Instant>,
}

struct Continuation {
    stream_id: u32,
    fragment: BytesMut,
    end_stream: bool,
}

/// HTTP/2 protocol driver: frame codec, stream multiplexing and flow
/// control in both directions.
pub(crate) struct H2Protocol {
    config: Arc<Config>,
    context: WorkerContext,
    ssl: bool,
    client: Option<SocketAddr>,
    server: Option<SocketAddr>,
    codec: FrameCodec,
    hpack_decoder: hpack::Decoder,
    hpack_encoder: hpack::Encoder,
    streams: HashMap<u32, H2Slot>,
    continuation: Option<Continuation>,
    state: ConnState,
    conn_send_window: i64,
    peer_initial_window: u32,
    peer_max_frame_size: u32,
    window_watch: watch::Sender<()>,
    highest_stream_id: u32,
    goaway_sent: bool,
}

impl H2Protocol {
    pub(crate) fn new(
        config: Arc<Config>,
        context: WorkerContext,
        ssl: bool,
        client: Option<SocketAddr>,
        server: Option<SocketAddr>,
    ) -> Self {
        let mut codec = FrameCodec::new();
        codec.set_max_frame_size(config.h2_max_inbound_frame_size);
        let hpack_decoder = hpack::Decoder::new(4096, config.h2_max_header_list_size as usize);
        let (window_watch, _) = watch::channel(());
        H2Protocol {
            codec,
            hpack_decoder,
            hpack_encoder: hpack::Encoder,
            streams: HashMap::new(),
            continuation: None,
            state: ConnState::AwaitingPreface,
            conn_send_window: DEFAULT_WINDOW_SIZE as i64,
            peer_initial_window: DEFAULT_WINDOW_SIZE,
            peer_max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            window_watch,
            highest_stream_id: 0,
            goaway_sent: false,
            config,
            context,
            ssl,
            client,
            server,
        }
    }

    /// Emit our SETTINGS and, for an h2c upgrade, replay the upgrading
    /// request as stream one.
    pub(crate) fn initiate(
        &mut self,
        upgrade: Option<(Vec<(Bytes, Bytes)>, String)>,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        out.raw(settings_frame(&[
            (
                setting::MAX_CONCURRENT_STREAMS,
                self.config.h2_max_concurrent_streams,
            ),
            (
                setting::MAX_HEADER_LIST_SIZE,
                self.config.h2_max_header_list_size,
            ),
            (
                setting::MAX_FRAME_SIZE,
                self.config.h2_max_inbound_frame_size,
            ),
            (setting::ENABLE_CONNECT_PROTOCOL, 1),
        ]));
        if let Some((headers, settings)) = upgrade {
            self.apply_h2c_settings(&settings)?;
            self.dispatch_request(1, headers, true, out)?;
        }
        Ok(())
    }

    fn apply_h2c_settings(&mut self, encoded: &str) -> Result<(), Error> {
        use base64::engine::Engine as _;
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|_| Error::H2(FrameError::Protocol("invalid http2-settings header")))?;
        if raw.len() % 6 != 0 {
            return Err(Error::H2(FrameError::Protocol(
                "invalid http2-settings header",
            )));
        }
        let entries: Vec<(u16, u32)> = raw
            .chunks(6)
            .map(|chunk| {
                (
                    u16::from_be_bytes([chunk[0], chunk[1]]),
                    u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
                )
            })
            .collect();
        self.apply_settings(&entries)
            .map_err(Error::H2)
    }

    pub(crate) fn idle(&self) -> bool {
        self.streams.is_empty()
    }

    pub(crate) fn oldest_pending_response(&self) -> Option<tokio::time::Instant> {
        self.streams
            .values()
            .filter_map(|slot| slot.pending_response_since)
            .min()
    }

    pub(crate) fn handle(&mut self, event: ConnectionEvent, out: &mut Outbox) -> Result<(), Error> {
        match event {
            ConnectionEvent::RawData { data, .. } => {
                if self.state == ConnState::Closed {
                    return Ok(());
                }
                self.codec.receive_data(&data);
                if self.state == ConnState::AwaitingPreface {
                    match self.codec.expect_preface() {
                        Ok(true) => self.state = ConnState::Open,
                        Ok(false) => return Ok(()),
                        Err(error) => {
                            self.connection_error(error.reason(), out);
                            return Ok(());
                        }
                    }
                }
                loop {
                    if self.state == ConnState::Closed {
                        break;
                    }
                    match self.codec.next_frame() {
                        Ok(Some(frame)) => self.handle_frame(frame, out)?,
                        Ok(None) => break,
                        Err(error) => {
                            tracing::debug!(target: "tricorn::h2", %error, "frame error");
                            self.connection_error(error.reason(), out);
                            break;
                        }
                    }
                }
                Ok(())
            }
            ConnectionEvent::Closed => {
                self.close_all(out);
                self.state = ConnState::Closed;
                Ok(())
            }
            ConnectionEvent::Updated { .. } => Ok(()),
        }
    }

    fn handle_frame(&mut self, frame: Frame, out: &mut Outbox) -> Result<(), Error> {
        match frame {
            Frame::Headers {
                stream_id,
                fragment,
                end_stream,
                end_headers,
            } => {
                if self.continuation.is_some() {
                    self.connection_error(Reason::PROTOCOL_ERROR, out);
                    return Ok(());
                }
                if end_headers {
                    self.begin_headers(stream_id, &fragment, end_stream, out)?;
                } else {
                    self.continuation = Some(Continuation {
                        stream_id,
                        fragment: BytesMut::from(fragment.as_ref()),
                        end_stream,
                    });
                }
            }
            Frame::Continuation {
                stream_id,
                fragment,
                end_headers,
            } => {
                let mut continuation = match self.continuation.take() {
                    Some(continuation) if continuation.stream_id == stream_id => continuation,
                    _ => {
                        self.connection_error(Reason::PROTOCOL_ERROR, out);
                        return Ok(());
                    }
                };
                continuation.fragment.extend_from_slice(&fragment);
                if end_headers {
                    let fragment = continuation.fragment.freeze();
                    self.begin_headers(stream_id, &fragment, continuation.end_stream, out)?;
                } else {
                    self.continuation = Some(continuation);
                }
            }
            Frame::Data {
                stream_id,
                data,
                end_stream,
                flow_len,
            } => {
                if flow_len > 0 {
                    out.raw(window_update_frame(0, flow_len));
                    if self.streams.contains_key(&stream_id) {
                        out.raw(window_update_frame(stream_id, flow_len));
                    }
                }
                if self.streams.contains_key(&stream_id) {
                    let websocket = self
                        .streams
                        .get(&stream_id)
                        .map(|slot| slot.stream.is_websocket())
                        .unwrap_or(false);
                    let event = if websocket {
                        ProtocolEvent::Data {
                            stream_id: stream_id as u64,
                            data,
                        }
                    } else {
                        ProtocolEvent::Body {
                            stream_id: stream_id as u64,
                            data,
                        }
                    };
                    self.deliver(stream_id, event, out)?;
                    if end_stream {
                        if !websocket {
                            self.deliver(
                                stream_id,
                                ProtocolEvent::EndBody {
                                    stream_id: stream_id as u64,
                                },
                                out,
                            )?;
                        }
                        if let Some(slot) = self.streams.get_mut(&stream_id) {
                            slot.recv_done = true;
                        }
                        self.maybe_finish(stream_id, out);
                    }
                }
            }
            Frame::Reset { stream_id, .. } => {
                self.close_slot(stream_id, out)?;
            }
            Frame::Settings { ack: false, entries } => {
                if let Err(error) = self.apply_settings(&entries) {
                    self.connection_error(error.reason(), out);
                    return Ok(());
                }
                out.raw(settings_ack());
                self.notify_windows();
                self.flush_all(out);
            }
            Frame::Settings { ack: true, .. } => {}
            Frame::Ping { ack: false, payload } => {
                out.raw(ping_frame(true, payload));
            }
            Frame::Ping { ack: true, .. } => {}
            Frame::GoAway { .. } => {
                self.close_all(out);
                out.wire(ConnectionEvent::Closed);
                self.state = ConnState::Closed;
            }
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            } => {
                self.conn_send_window += increment as i64;
                if self.conn_send_window > MAX_WINDOW_SIZE as i64 {
                    self.connection_error(Reason::FLOW_CONTROL_ERROR, out);
                    return Ok(());
                }
                self.notify_windows();
                self.flush_all(out);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.send_window += increment as i64;
                    if slot.send_window > MAX_WINDOW_SIZE as i64 {
                        out.raw(rst_frame(stream_id, Reason::FLOW_CONTROL_ERROR));
                        self.close_slot(stream_id, out)?;
                        return Ok(());
                    }
                    self.notify_windows();
                    self.flush_all(out);
                }
            }
            Frame::PushPromise { .. } => {
                // Clients never push.
                self.connection_error(Reason::PROTOCOL_ERROR, out);
            }
            Frame::Priority { .. } | Frame::Unknown => {}
        }
        Ok(())
    }

    fn begin_headers(
        &mut self,
        stream_id: u32,
        fragment: &[u8],
        end_stream: bool,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        let headers = match self.hpack_decoder.decode(fragment) {
            Ok(headers) => headers,
            Err(error) => {
                self.connection_error(FrameError::from(error).reason(), out);
                return Ok(());
            }
        };

        if self.streams.contains_key(&stream_id) {
            // Trailers; their fields are not surfaced to the app.
            if end_stream {
                self.deliver(
                    stream_id,
                    ProtocolEvent::EndBody {
                        stream_id: stream_id as u64,
                    },
                    out,
                )?;
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.recv_done = true;
                }
                self.maybe_finish(stream_id, out);
            } else {
                self.connection_error(Reason::PROTOCOL_ERROR, out);
            }
            return Ok(());
        }

        if stream_id % 2 == 0 || stream_id <= self.highest_stream_id {
            self.connection_error(Reason::PROTOCOL_ERROR, out);
            return Ok(());
        }
        if self.goaway_sent
            || self.streams.len() as u32 >= self.config.h2_max_concurrent_streams
        {
            out.raw(rst_frame(stream_id, Reason::REFUSED_STREAM));
            return Ok(());
        }
        self.dispatch_request(stream_id, headers, end_stream, out)
    }

    fn dispatch_request(
        &mut self,
        stream_id: u32,
        headers: Vec<(Bytes, Bytes)>,
        end_stream: bool,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        let mut method = None;
        let mut path = None;
        let mut authority = None;
        let mut protocol = None;
        let mut regular = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            match name.as_ref() {
                b":method" => method = Some(value),
                b":path" => path = Some(value),
                b":authority" => authority = Some(value),
                b":protocol" => protocol = Some(value),
                b":scheme" => {}
                _ if name.first() == Some(&b':') => {
                    self.connection_error(Reason::PROTOCOL_ERROR, out);
                    return Ok(());
                }
                _ => regular.push((name, value)),
            }
        }
        let method = match method.as_deref().and_then(|m| Method::from_bytes(m).ok()) {
            Some(method) => method,
            None => {
                out.raw(rst_frame(stream_id, Reason::PROTOCOL_ERROR));
                return Ok(());
            }
        };

        let websocket = method == Method::CONNECT;
        if websocket && protocol.as_deref() != Some(&b"websocket"[..]) {
            // Plain CONNECT tunnelling is not provided.
            out.raw(rst_frame(stream_id, Reason::REFUSED_STREAM));
            return Ok(());
        }
        let raw_path = match path {
            Some(path) => path,
            None => {
                out.raw(rst_frame(stream_id, Reason::PROTOCOL_ERROR));
                return Ok(());
            }
        };
        if let Some(authority) = authority {
            if header_value(&regular, b"host").is_none() {
                regular.insert(0, (Bytes::from_static(b"host"), authority));
            }
        }

        let stream = if websocket {
            StreamKind::Ws(WsStream::new(
                self.config.clone(),
                self.context.clone(),
                self.ssl,
                self.client,
                self.server,
                stream_id as u64,
            ))
        } else {
            StreamKind::Http(HttpStream::new(
                self.config.clone(),
                self.context.clone(),
                self.ssl,
                self.client,
                self.server,
                stream_id as u64,
            ))
        };
        self.highest_stream_id = stream_id;
        self.streams.insert(
            stream_id,
            H2Slot {
                stream,
                send_window: self.peer_initial_window as i64,
                pending: BytesMut::new(),
                pending_end: false,
                end_sent: false,
                recv_done: false,
                send_done: false,
                pending_response_since: Some(tokio::time::Instant::now()),
            },
        );
        out.wire(ConnectionEvent::Updated { idle: false });

        self.deliver(
            stream_id,
            ProtocolEvent::Request {
                stream_id: stream_id as u64,
                method,
                raw_path,
                http_version: HttpVersion::H2,
                headers: regular,
            },
            out,
        )?;
        if end_stream {
            self.deliver(
                stream_id,
                ProtocolEvent::EndBody {
                    stream_id: stream_id as u64,
                },
                out,
            )?;
            if let Some(slot) = self.streams.get_mut(&stream_id) {
                slot.recv_done = true;
            }
            self.maybe_finish(stream_id, out);
        }
        Ok(())
    }

    pub(crate) fn app_send(
        &mut self,
        stream_id: u64,
        message: AsgiMessage,
        out: &mut Outbox,
    ) -> Result<SendOutcome, Error> {
        let stream_id = stream_id as u32;
        let sout = match self.streams.get_mut(&stream_id) {
            Some(slot) => slot.stream.app_send(message)?,
            None => return Ok(SendOutcome::Done),
        };
        self.process_stream_out(stream_id, sout, out)
    }

    pub(crate) fn resume_send(
        &mut self,
        stream_id: u64,
        out: &mut Outbox,
    ) -> Result<SendOutcome, Error> {
        let stream_id = stream_id as u32;
        if !self.streams.contains_key(&stream_id) {
            return Ok(SendOutcome::Done);
        }
        Ok(self.flush_slot(stream_id, out))
    }

    pub(crate) fn app_exit(
        &mut self,
        stream_id: u64,
        error: Option<BoxError>,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        let stream_id = stream_id as u32;
        let sout = match self.streams.get_mut(&stream_id) {
            Some(slot) => slot.stream.app_exit(error),
            None => return Ok(()),
        };
        let _ = self.process_stream_out(stream_id, sout, out)?;
        Ok(())
    }

    pub(crate) fn shutdown(&mut self, out: &mut Outbox) {
        if self.goaway_sent || self.state == ConnState::Closed {
            return;
        }
        out.raw(goaway_frame(self.highest_stream_id, Reason::NO_ERROR));
        self.goaway_sent = true;
        if self.streams.is_empty() {
            out.wire(ConnectionEvent::Closed);
            self.state = ConnState::Closed;
        }
    }

    fn deliver(
        &mut self,
        stream_id: u32,
        event: ProtocolEvent,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        let sout = match self.streams.get_mut(&stream_id) {
            Some(slot) => slot.stream.handle(event)?,
            None => return Ok(()),
        };
        let _ = self.process_stream_out(stream_id, sout, out)?;
        Ok(())
    }

    fn process_stream_out(
        &mut self,
        stream_id: u32,
        sout: StreamOut,
        out: &mut Outbox,
    ) -> Result<SendOutcome, Error> {
        if let Some((scope, receiver)) = sout.spawn {
            out.effects.push(Effect::Spawn {
                stream_id: stream_id as u64,
                scope,
                receiver,
            });
        }
        for message in sout.app {
            if let Some(tx) = self
                .streams
                .get(&stream_id)
                .and_then(|slot| slot.stream.sender())
            {
                out.effects.push(Effect::App { tx, message });
            }
        }
        if sout.close_channel {
            if let Some(slot) = self.streams.get_mut(&stream_id) {
                slot.stream.close_channel();
            }
        }
        let mut outcome = SendOutcome::Done;
        for event in sout.events {
            outcome = self.stream_send_event(stream_id, event, out)?;
        }
        Ok(outcome)
    }

    fn stream_send_event(
        &mut self,
        stream_id: u32,
        event: ProtocolEvent,
        out: &mut Outbox,
    ) -> Result<SendOutcome, Error> {
        match event {
            ProtocolEvent::Response { status, headers, .. } => {
                let mut all = Vec::with_capacity(headers.len() + 1);
                all.push((
                    Bytes::from_static(b":status"),
                    Bytes::from(status.to_string()),
                ));
                all.extend(headers);
                let mut block = BytesMut::new();
                self.hpack_encoder.encode(&all, &mut block);
                for frame in headers_frames(stream_id, &block, false, self.peer_max_frame_size) {
                    out.raw(frame);
                }
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.pending_response_since = None;
                }
                Ok(SendOutcome::Done)
            }
            ProtocolEvent::Body { data, .. } | ProtocolEvent::Data { data, .. } => {
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.pending.extend_from_slice(&data);
                }
                Ok(self.flush_slot(stream_id, out))
            }
            ProtocolEvent::EndBody { .. } | ProtocolEvent::EndData { .. } => {
                if let Some(slot) = self.streams.get_mut(&stream_id) {
                    slot.pending_end = true;
                }
                Ok(self.flush_slot(stream_id, out))
            }
            ProtocolEvent::StreamClosed { .. } => {
                out.raw(rst_frame(stream_id, Reason::CANCEL));
                self.close_slot(stream_id, out)?;
                Ok(SendOutcome::Done)
            }
            ProtocolEvent::Request { .. } => Ok(SendOutcome::Done),
        }
    }

    fn flush_slot(&mut self, stream_id: u32, out: &mut Outbox) -> SendOutcome {
        let max_frame = self.peer_max_frame_size as i64;
        let mut finished = false;
        let outcome = match self.streams.get_mut(&stream_id) {
            Some(slot) => {
                let mut outcome = SendOutcome::Done;
                while !slot.pending.is_empty() {
                    let allowed = self.conn_send_window.min(slot.send_window).min(max_frame);
                    if allowed <= 0 {
                        outcome = SendOutcome::Blocked(self.window_watch.subscribe());
                        break;
                    }
                    let take = (allowed as usize).min(slot.pending.len());
                    let chunk = slot.pending.split_to(take);
                    let last = slot.pending.is_empty() && slot.pending_end;
                    out.raw(data_frame(stream_id, &chunk, last));
                    if last {
                        slot.end_sent = true;
                    }
                    self.conn_send_window -= take as i64;
                    slot.send_window -= take as i64;
                }
                if slot.pending.is_empty() && slot.pending_end && !slot.end_sent {
                    out.raw(data_frame(stream_id, b"", true));
                    slot.end_sent = true;
                }
                if slot.end_sent {
                    slot.send_done = true;
                    finished = true;
                }
                outcome
            }
            None => SendOutcome::Done,
        };
        if finished {
            self.maybe_finish(stream_id, out);
        }
        outcome
    }

    fn flush_all(&mut self, out: &mut Outbox) {
        let ids: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, slot)| !slot.pending.is_empty() || (slot.pending_end && !slot.end_sent))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let _ = self.flush_slot(id, out);
        }
    }

    fn maybe_finish(&mut self, stream_id: u32, out: &mut Outbox) {
        let done = self
            .streams
            .get(&stream_id)
            .map(|slot| slot.recv_done && slot.send_done)
            .unwrap_or(false);
        if done {
            if let Some(mut slot) = self.streams.remove(&stream_id) {
                slot.stream.close_channel();
            }
            self.after_stream_removed(out);
        }
    }

    fn close_slot(&mut self, stream_id: u32, out: &mut Outbox) -> Result<(), Error> {
        if let Some(mut slot) = self.streams.remove(&stream_id) {
            let sout = slot.stream.handle(ProtocolEvent::StreamClosed {
                stream_id: stream_id as u64,
            })?;
            for message in sout.app {
                if let Some(tx) = slot.stream.sender() {
                    out.effects.push(Effect::App { tx, message });
                }
            }
            slot.stream.close_channel();
            self.after_stream_removed(out);
        }
        Ok(())
    }

    fn after_stream_removed(&mut self, out: &mut Outbox) {
        out.wire(ConnectionEvent::Updated {
            idle: self.streams.is_empty(),
        });
        if self.goaway_sent && self.streams.is_empty() && self.state != ConnState::Closed {
            out.wire(ConnectionEvent::Closed);
            self.state = ConnState::Closed;
        }
    }

    fn close_all(&mut self, out: &mut Outbox) {
        let ids: Vec<u32> = self.streams.keys().copied().collect();
        for id in ids {
            let _ = self.close_slot(id, out);
        }
    }

    fn apply_settings(&mut self, entries: &[(u16, u32)]) -> Result<(), FrameError> {
        for &(id, value) in entries {
            match id {
                setting::INITIAL_WINDOW_SIZE => {
                    if value > MAX_WINDOW_SIZE {
                        return Err(FrameError::WindowOverflow);
                    }
                    let delta = value as i64 - self.peer_initial_window as i64;
                    for slot in self.streams.values_mut() {
                        slot.send_window += delta;
                    }
                    self.peer_initial_window = value;
                }
                setting::MAX_FRAME_SIZE => {
                    if !(DEFAULT_MAX_FRAME_SIZE..=16_777_215).contains(&value) {
                        return Err(FrameError::Protocol("invalid SETTINGS_MAX_FRAME_SIZE"));
                    }
                    self.peer_max_frame_size = value;
                }
                // The stateless encoder never grows the peer's table, and a
                // client's concurrency or list-size limits do not bind a
                // server that never initiates streams.
                setting::HEADER_TABLE_SIZE
                | setting::ENABLE_PUSH
                | setting::MAX_CONCURRENT_STREAMS
                | setting::MAX_HEADER_LIST_SIZE
                | setting::ENABLE_CONNECT_PROTOCOL => {}
                _ => {}
            }
        }
        Ok(())
    }

    fn notify_windows(&self) {
        let _ = self.window_watch.send(());
    }

    fn connection_error(&mut self, reason: Reason, out: &mut Outbox) {
        if self.state == ConnState::Closed {
            return;
        }
        out.raw(goaway_frame(self.highest_stream_id, reason));
        self.close_all(out);
        out.wire(ConnectionEvent::Closed);
        self.state = ConnState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asgi::Scope;
    use crate::clock::FixedClock;
    use crate::codec::h2::PREFACE;
    use crate::logging::NullAccessLog;

    fn protocol() -> H2Protocol {
        let context = WorkerContext::new()
            .with_clock(Arc::new(FixedClock::at_unix(5000)))
            .with_access_log(Arc::new(NullAccessLog));
        H2Protocol::new(Arc::new(Config::default()), context, false, None, None)
    }

    fn raw(data: impl Into<Bytes>) -> ConnectionEvent {
        ConnectionEvent::RawData {
            data: data.into(),
            address: None,
        }
    }

    fn wire_bytes(out: &Outbox) -> Vec<Bytes> {
        out.effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Wire(ConnectionEvent::RawData { data, .. }) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    fn spawned_scopes(out: &Outbox) -> Vec<&Scope> {
        out.effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Spawn { scope, .. } => Some(scope),
                _ => None,
            })
            .collect()
    }

    fn request_block(pseudo: &[(&[u8], &[u8])]) -> Bytes {
        let headers: Vec<(Bytes, Bytes)> = pseudo
            .iter()
            .map(|(n, v)| (Bytes::copy_from_slice(n), Bytes::copy_from_slice(v)))
            .collect();
        let mut block = BytesMut::new();
        hpack::Encoder.encode(&headers, &mut block);
        block.freeze()
    }

    fn open(protocol: &mut H2Protocol) -> Outbox {
        let mut out = Outbox::new();
        protocol.initiate(None, &mut out).unwrap();
        assert!(!wire_bytes(&out).is_empty());

        let mut preface = BytesMut::new();
        preface.extend_from_slice(PREFACE);
        preface.extend_from_slice(&settings_frame(&[]));
        let mut out = Outbox::new();
        protocol.handle(raw(preface.freeze()), &mut out).unwrap();
        // Our SETTINGS ack.
        assert_eq!(wire_bytes(&out), vec![settings_ack()]);
        out
    }

    fn get_request(protocol: &mut H2Protocol, stream_id: u32) -> Outbox {
        let block = request_block(&[
            (b":method", b"GET"),
            (b":scheme", b"http"),
            (b":path", b"/?x=1"),
            (b":authority", b"example"),
        ]);
        let frames = headers_frames(stream_id, &block, true, DEFAULT_MAX_FRAME_SIZE);
        let mut out = Outbox::new();
        protocol
            .handle(raw(frames.concat()), &mut out)
            .unwrap();
        out
    }

    #[tokio::test]
    async fn request_stream_is_dispatched() {
        let mut protocol = protocol();
        let _ = open(&mut protocol);
        let out = get_request(&mut protocol, 1);
        let scopes = spawned_scopes(&out);
        assert_eq!(scopes.len(), 1);
        match scopes[0] {
            Scope::Http(scope) => {
                assert_eq!(scope.http_version, HttpVersion::H2);
                assert_eq!(scope.path, "/");
                assert_eq!(scope.query_string.as_ref(), b"x=1");
                assert_eq!(
                    crate::headers::header_value(&scope.headers, b"host").unwrap().as_ref(),
                    b"example"
                );
            }
            other => panic!("unexpected scope {other:?}"),
        }
    }

    #[tokio::test]
    async fn response_round_trip() {
        let mut protocol = protocol();
        let _ = open(&mut protocol);
        let _ = get_request(&mut protocol, 1);

        let mut out = Outbox::new();
        protocol
            .app_send(
                1,
                AsgiMessage::HttpResponseStart {
                    status: 200,
                    headers: vec![],
                },
                &mut out,
            )
            .unwrap();
        protocol
            .app_send(
                1,
                AsgiMessage::HttpResponseBody {
                    body: Bytes::from_static(b"OK"),
                    more_body: false,
                },
                &mut out,
            )
            .unwrap();
        let frames = wire_bytes(&out);
        // HEADERS, the body DATA frame, then the END_STREAM marker.
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0][3], 0x1);
        assert_eq!(frames[1][3], 0x0);
        assert_eq!(&frames[1][9..], b"OK");
        assert_eq!(frames[2][3], 0x0);
        assert_eq!(frames[2][4] & 0x1, 0x1);
        assert_eq!(frames[2][9..].len(), 0);
        assert!(protocol.idle());
    }

    #[tokio::test]
    async fn zero_send_window_blocks_until_update() {
        let mut protocol = protocol();
        let mut out = Outbox::new();
        protocol.initiate(None, &mut out).unwrap();

        // Client preface with a 4 byte initial stream window.
        let mut bytes = BytesMut::new();
        bytes.extend_from_slice(PREFACE);
        bytes.extend_from_slice(&settings_frame(&[(setting::INITIAL_WINDOW_SIZE, 4)]));
        let mut out = Outbox::new();
        protocol.handle(raw(bytes.freeze()), &mut out).unwrap();
        let _ = get_request(&mut protocol, 1);

        let mut out = Outbox::new();
        protocol
            .app_send(
                1,
                AsgiMessage::HttpResponseStart {
                    status: 200,
                    headers: vec![],
                },
                &mut out,
            )
            .unwrap();
        let outcome = protocol
            .app_send(
                1,
                AsgiMessage::HttpResponseBody {
                    body: Bytes::from_static(b"0123456789"),
                    more_body: false,
                },
                &mut out,
            )
            .unwrap();
        assert!(matches!(outcome, SendOutcome::Blocked(_)));
        let data_frames: Vec<_> = wire_bytes(&out)
            .into_iter()
            .filter(|frame| frame[3] == 0x0)
            .collect();
        assert_eq!(&data_frames[0][9..], b"0123");

        // The window update lets the rest flow.
        let mut out = Outbox::new();
        protocol
            .handle(raw(window_update_frame(1, 100)), &mut out)
            .unwrap();
        let data_frames: Vec<_> = wire_bytes(&out)
            .into_iter()
            .filter(|frame| frame[3] == 0x0)
            .collect();
        assert_eq!(&data_frames[0][9..], b"456789");
        assert_eq!(data_frames[0][4] & 0x1, 0x1);
    }

    #[tokio::test]
    async fn ping_is_acknowledged() {
        let mut protocol = protocol();
        let _ = open(&mut protocol);
        let mut out = Outbox::new();
        protocol
            .handle(raw(ping_frame(false, *b"abcdefgh")), &mut out)
            .unwrap();
        assert_eq!(wire_bytes(&out), vec![ping_frame(true, *b"abcdefgh")]);
    }

    #[tokio::test]
    async fn reset_disconnects_the_stream() {
        let mut protocol = protocol();
        let _ = open(&mut protocol);
        let _ = get_request(&mut protocol, 1);
        let mut out = Outbox::new();
        protocol
            .handle(raw(rst_frame(1, Reason::CANCEL)), &mut out)
            .unwrap();
        let disconnects: Vec<_> = out
            .effects
            .iter()
            .filter(|effect| {
                matches!(
                    effect,
                    Effect::App {
                        message: AsgiMessage::HttpDisconnect,
                        ..
                    }
                )
            })
            .collect();
        assert_eq!(disconnects.len(), 1);
        assert!(protocol.idle());
    }

    #[tokio::test]
    async fn push_promise_from_client_is_a_connection_error() {
        let mut protocol = protocol();
        let _ = open(&mut protocol);
        // A PUSH_PROMISE frame header with an empty payload is enough to
        // trigger the rejection.
        let mut frame = BytesMut::new();
        frame.extend_from_slice(&[0, 0, 0, 0x5, 0, 0, 0, 0, 2]);
        let mut out = Outbox::new();
        protocol.handle(raw(frame.freeze()), &mut out).unwrap();
        let frames = wire_bytes(&out);
        assert_eq!(frames[0][3], 0x7);
        assert!(out
            .effects
            .iter()
            .any(|effect| matches!(effect, Effect::Wire(ConnectionEvent::Closed))));
    }

    #[tokio::test]
    async fn extended_connect_spawns_websocket_stream() {
        let mut protocol = protocol();
        let _ = open(&mut protocol);
        let block = request_block(&[
            (b":method", b"CONNECT"),
            (b":protocol", b"websocket"),
            (b":scheme", b"https"),
            (b":path", b"/chat"),
            (b":authority", b"example"),
            (b"sec-websocket-version", b"13"),
        ]);
        let frames = headers_frames(3, &block, false, DEFAULT_MAX_FRAME_SIZE);
        let mut out = Outbox::new();
        protocol.handle(raw(frames.concat()), &mut out).unwrap();
        match spawned_scopes(&out)[0] {
            Scope::Websocket(scope) => {
                assert_eq!(scope.path, "/chat");
                assert_eq!(scope.http_version, HttpVersion::H2);
            }
            other => panic!("unexpected scope {other:?}"),
        }

        // Accepting an extended CONNECT answers 200, not 101.
        let mut out = Outbox::new();
        protocol
            .app_send(3, AsgiMessage::WebsocketAccept { subprotocol: None }, &mut out)
            .unwrap();
        let frames = wire_bytes(&out);
        assert_eq!(frames[0][3], 0x1);
        let mut decoder = hpack::Decoder::new(4096, 65535);
        let headers = decoder.decode(&frames[0][9..]).unwrap();
        assert_eq!(headers[0].0.as_ref(), b":status");
        assert_eq!(headers[0].1.as_ref(), b"200");
    }

    #[tokio::test]
    async fn h2c_initiate_replays_the_upgrade_request() {
        let mut protocol = protocol();
        let mut out = Outbox::new();
        protocol
            .initiate(
                Some((
                    vec![
                        (Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
                        (Bytes::from_static(b":path"), Bytes::from_static(b"/")),
                        (
                            Bytes::from_static(b":authority"),
                            Bytes::from_static(b"example"),
                        ),
                        (Bytes::from_static(b"host"), Bytes::from_static(b"example")),
                    ],
                    String::new(),
                )),
                &mut out,
            )
            .unwrap();
        assert_eq!(spawned_scopes(&out).len(), 1);
        let request_end: Vec<_> = out
            .effects
            .iter()
            .filter(|effect| {
                matches!(
                    effect,
                    Effect::App {
                        message: AsgiMessage::HttpRequest {
                            more_body: false,
                            ..
                        },
                        ..
                    }
                )
            })
            .collect();
        assert_eq!(request_end.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_sends_goaway_and_drains() {
        let mut protocol = protocol();
        let _ = open(&mut protocol);
        let _ = get_request(&mut protocol, 1);
        let mut out = Outbox::new();
        protocol.shutdown(&mut out);
        let frames = wire_bytes(&out);
        assert_eq!(frames[0][3], 0x7);
        assert!(!out
            .effects
            .iter()
            .any(|effect| matches!(effect, Effect::Wire(ConnectionEvent::Closed))));

        // Finishing the last stream closes the connection.
        let mut out = Outbox::new();
        protocol
            .app_send(
                1,
                AsgiMessage::HttpResponseStart {
                    status: 204,
                    headers: vec![],
                },
                &mut out,
            )
            .unwrap();
        protocol
            .app_send(
                1,
                AsgiMessage::HttpResponseBody {
                    body: Bytes::new(),
                    more_body: false,
                },
                &mut out,
            )
            .unwrap();
        assert!(out
            .effects
            .iter()
            .any(|effect| matches!(effect, Effect::Wire(ConnectionEvent::Closed))));
    }
}
