//! The session driver task.
//!
//! One task owns the whole session: it opens the create/bind connection,
//! consumes decoded frames, sequences control requests through the
//! [`RequestManager`], detects stalls on an idle clock, runs the recovery
//! cycle with backoff, and turns every state change into an ordered
//! dispatcher event. Application calls never touch the session directly;
//! they post [`Command`]s and return immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use pushlink_dispatch::{ClientEvent, Dispatcher, Event, MessageEvent, SubscriptionEvent};
use pushlink_transport::{RequestHandle, Transport, TransportEvent};
use pushlink_wire::{end_is_recoverable, ControlRequest, Frame, FrameDecoder};

use crate::backoff::BackoffPolicy;
use crate::ids::IdGenerator;
use crate::registry::{
    MessageRegistry, RegistryError, SubscriptionRegistry, SubscriptionSpec,
};
use crate::requests::{QuietListener, RequestListener, RequestManager};
use crate::state::{ConnectionMode, SessionState, SessionStatus};

/// Driver-level session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Adapter set requested at session create
    pub adapter_set: String,
    /// Credentials, if the server requires them
    pub user: Option<String>,
    /// Credentials, if the server requires them
    pub password: Option<String>,
    /// Data connection mode
    pub mode: ConnectionMode,
    /// Keep-alive interval requested from the server
    pub keepalive: Duration,
    /// Reverse-heartbeat period; zero disables the timer
    pub reverse_heartbeat_interval: Duration,
    /// Inbound silence before the session is reported stalled
    pub stall_timeout: Duration,
    /// Further silence after stalling before recovery starts
    pub recovery_grace: Duration,
    /// Pacing and budget for session recovery binds
    pub recovery: BackoffPolicy,
    /// Pacing and budget for control request retransmission
    pub request_retry: BackoffPolicy,
    /// Per-request time budget
    pub request_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            adapter_set: "DEFAULT".to_string(),
            user: None,
            password: None,
            mode: ConnectionMode::Streaming,
            keepalive: Duration::from_secs(5),
            reverse_heartbeat_interval: Duration::from_secs(30),
            stall_timeout: Duration::from_secs(10),
            recovery_grace: Duration::from_secs(5),
            recovery: BackoffPolicy::recovery(),
            request_retry: BackoffPolicy::requests(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Application calls, posted to the driver task.
#[derive(Debug)]
pub enum Command {
    /// Subscribe under a facade-assigned subscription id.
    Subscribe {
        /// Subscription id assigned at subscribe time
        sub_id: u64,
        /// Items, fields, mode, snapshot flag
        spec: SubscriptionSpec,
    },
    /// Remove a subscription.
    Unsubscribe {
        /// Subscription id to remove
        sub_id: u64,
    },
    /// Submit a point-to-point message.
    SendMessage {
        /// Facade-assigned progressive number
        prog: u64,
        /// Message payload
        text: String,
        /// Ordering sequence
        sequence: String,
        /// Whether a server acknowledgment is requested
        needs_ack: bool,
    },
    /// Request a bandwidth constraint.
    Constrain {
        /// Requested maximum bandwidth
        max_bandwidth: f64,
    },
    /// Close the session and abort everything pending.
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindKind {
    Recover,
    Rebind,
}

/// Owns and runs one logical session against a streaming server.
pub struct SessionDriver {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    requests: Arc<RequestManager>,
    subscriptions: Arc<SubscriptionRegistry>,
    messages: Arc<MessageRegistry>,
    state: SessionState,
    decoder: FrameDecoder,
    read_buf: BytesMut,
    stream_handle: Option<RequestHandle>,
    stream_token: Option<u64>,
    stream_open: bool,
    recovery_attempts: u32,
    recover_at: Option<Instant>,
    pending_bind: BindKind,
    last_inbound: Instant,
    deferred: Vec<Command>,
}

impl SessionDriver {
    /// Build a driver around a transport and a dispatcher; `ids` is the
    /// client-owned identifier generator shared with the facade.
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        dispatcher: Dispatcher,
        ids: Arc<IdGenerator>,
    ) -> Self {
        let requests = Arc::new(RequestManager::new(
            Arc::clone(&ids),
            config.request_retry.clone(),
            config.request_timeout,
        ));
        Self {
            config,
            transport,
            dispatcher,
            requests,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            messages: Arc::new(MessageRegistry::new()),
            state: SessionState::new(),
            decoder: FrameDecoder::new(),
            read_buf: BytesMut::with_capacity(16 * 1024),
            stream_handle: None,
            stream_token: None,
            stream_open: false,
            recovery_attempts: 0,
            recover_at: None,
            pending_bind: BindKind::Recover,
            last_inbound: Instant::now(),
            deferred: Vec::new(),
        }
    }

    /// Run the session to completion: until an explicit disconnect, a
    /// non-recoverable server end, or an exhausted recovery budget.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> anyhow::Result<()> {
        self.open_session();

        let heartbeat_period = if self.config.reverse_heartbeat_interval.is_zero() {
            Duration::from_secs(3600)
        } else {
            self.config.reverse_heartbeat_interval
        };
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + heartbeat_period,
            heartbeat_period,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.state.status().is_terminal() {
                break;
            }

            let stall_at = self.stall_deadline();
            let recover_at = self.recover_at;
            // Retries require a live control channel.
            let retry_at = if self.control_channel_ready() {
                self.requests.next_retry_at()
            } else {
                None
            };

            tokio::select! {
                biased;

                maybe_event = transport_rx.recv() => {
                    match maybe_event {
                        Some(event) => self.on_transport_event(event),
                        None => {
                            warn!("transport event channel closed");
                            self.close_session(None);
                        }
                    }
                }

                maybe_cmd = commands.recv() => {
                    match maybe_cmd {
                        Some(cmd) => self.on_command(cmd),
                        None => {
                            debug!("command channel closed, disconnecting");
                            self.close_session(None);
                        }
                    }
                }

                _ = heartbeat.tick(),
                    if !self.config.reverse_heartbeat_interval.is_zero() => {
                    self.send_heartbeat();
                }

                _ = sleep_until(stall_at.unwrap_or_else(Instant::now)), if stall_at.is_some() => {
                    self.on_stall_deadline();
                }

                _ = sleep_until(recover_at.unwrap_or_else(Instant::now)), if recover_at.is_some() => {
                    self.issue_pending_bind();
                }

                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.pump_requests();
                }
            }
        }

        info!(
            "session ended after {} binds, progress {}",
            self.state.bind_count(),
            self.state.progress()
        );
        Ok(())
    }

    fn session_ready(&self) -> bool {
        self.state.session_id().is_some() && !self.state.status().is_terminal()
    }

    fn control_channel_ready(&self) -> bool {
        self.session_ready()
            && self.stream_open
            && matches!(
                self.state.status(),
                SessionStatus::Connected(_) | SessionStatus::Stalled
            )
    }

    fn set_status(&mut self, status: SessionStatus) {
        if self.state.set_status(status) {
            self.dispatcher.post(Event::Client(ClientEvent::StatusChange(
                status.as_str().to_string(),
            )));
        }
    }

    fn open_session(&mut self) {
        self.set_status(SessionStatus::Creating);
        self.decoder = FrameDecoder::new();
        self.read_buf.clear();

        let adapter_set = self.config.adapter_set.clone();
        let user = self.config.user.clone();
        let password = self.config.password.clone();
        let keepalive = self.config.keepalive.as_millis() as u64;
        let (req_id, body) = self.requests.begin_bind(
            |id| {
                ControlRequest::create_session(
                    id,
                    &adapter_set,
                    user.as_deref(),
                    password.as_deref(),
                    keepalive,
                )
                .encode()
            },
            Arc::new(QuietListener),
        );
        debug!("creating session (request {})", req_id);
        self.open_stream(body);
    }

    fn open_stream(&mut self, body: String) {
        let handle = self.transport.stream(body);
        self.stream_token = Some(handle.token());
        self.stream_open = false;
        self.last_inbound = Instant::now();
        self.requests.attach_bind_handle(handle.clone());
        self.stream_handle = Some(handle);
    }

    fn issue_pending_bind(&mut self) {
        self.recover_at = None;
        let Some(session_id) = self.state.session_id().map(str::to_string) else {
            // Interrupted before the session existed; start over.
            self.open_session();
            return;
        };

        let recovery_from = match self.pending_bind {
            BindKind::Recover => Some(self.state.progress()),
            BindKind::Rebind => None,
        };
        self.decoder = FrameDecoder::with_resume(self.state.progress());
        self.read_buf.clear();

        let keepalive = self.config.keepalive.as_millis() as u64;
        let (req_id, body) = self.requests.begin_bind(
            |id| ControlRequest::bind_session(id, &session_id, recovery_from, keepalive).encode(),
            Arc::new(QuietListener),
        );
        debug!(
            "bind {} for session {} (recovery_from: {:?})",
            req_id, session_id, recovery_from
        );
        self.open_stream(body);
    }

    fn enter_recovery(&mut self, reason: &str) {
        if self.state.status().is_terminal() {
            return;
        }
        if let Some(handle) = self.stream_handle.take() {
            handle.close(true);
        }
        self.stream_token = None;
        self.stream_open = false;
        self.requests.requeue_in_flight();

        self.recovery_attempts += 1;
        if !self.config.recovery.allows_another(self.recovery_attempts - 1) {
            warn!("recovery budget exhausted after {} attempts", self.recovery_attempts - 1);
            self.close_session(Some((0, "recovery budget exhausted".to_string())));
            return;
        }

        warn!(
            "session interrupted ({}), recovery attempt {}",
            reason, self.recovery_attempts
        );
        self.set_status(SessionStatus::Recovering);
        self.pending_bind = BindKind::Recover;
        let delay = self.config.recovery.delay_for_attempt(self.recovery_attempts);
        self.recover_at = Some(Instant::now() + delay);
    }

    fn close_session(&mut self, error: Option<(i32, String)>) {
        if self.state.status().is_terminal() {
            return;
        }
        self.recover_at = None;
        if let Some(handle) = self.stream_handle.take() {
            handle.close(true);
        }
        self.stream_token = None;
        self.stream_open = false;

        self.requests.abort_all();
        for prog in self.messages.abort_all() {
            self.dispatcher.post(Event::Message {
                prog,
                event: MessageEvent::Aborted,
            });
        }
        let mut sub_ids = self.subscriptions.all_ids();
        sub_ids.sort_unstable();
        for sub_id in sub_ids {
            self.subscriptions.remove(sub_id);
            self.dispatcher.post(Event::Subscription {
                sub_id,
                event: SubscriptionEvent::Unsubscribed,
            });
        }

        if let Some((code, message)) = error {
            self.dispatcher
                .post(Event::Client(ClientEvent::ServerError { code, message }));
        }

        // The terminal status change is the last notification this
        // session's listeners observe.
        self.set_status(SessionStatus::Closed);
    }

    fn stall_deadline(&self) -> Option<Instant> {
        match self.state.status() {
            SessionStatus::Connected(_) => Some(self.last_inbound + self.config.stall_timeout),
            SessionStatus::Stalled => Some(
                self.last_inbound + self.config.stall_timeout + self.config.recovery_grace,
            ),
            _ => None,
        }
    }

    fn on_stall_deadline(&mut self) {
        match self.state.status() {
            SessionStatus::Connected(_) => {
                warn!(
                    "no inbound frame for {:?}, session stalled",
                    self.config.stall_timeout
                );
                self.set_status(SessionStatus::Stalled);
            }
            SessionStatus::Stalled => {
                self.state.set_recoverable(true);
                self.enter_recovery("stalled past recovery grace");
            }
            _ => {}
        }
    }

    fn send_heartbeat(&mut self) {
        if !self.control_channel_ready() {
            return;
        }
        let session_id = self
            .state
            .session_id()
            .expect("control channel ready implies session id")
            .to_string();
        self.requests.submit(
            |id| ControlRequest::heartbeat(id, &session_id).encode(),
            Arc::new(QuietListener),
        );
        self.pump_requests();
    }

    fn pump_requests(&mut self) {
        if !self.control_channel_ready() {
            return;
        }
        for (req_id, body) in self.requests.transmittable(Instant::now()) {
            let handle = self.transport.send(body);
            self.requests.mark_on_wire(req_id, handle.token(), handle);
        }
    }

    fn on_command(&mut self, cmd: Command) {
        if matches!(cmd, Command::Disconnect) {
            info!("explicit disconnect");
            self.close_session(None);
            return;
        }
        if !self.session_ready() {
            // Queued until the session is established; transmitted once the
            // control channel is ready.
            self.deferred.push(cmd);
            return;
        }
        self.apply_command(cmd);
    }

    fn apply_command(&mut self, cmd: Command) {
        let session_id = self
            .state
            .session_id()
            .expect("commands applied only with a session")
            .to_string();

        match cmd {
            Command::Subscribe { sub_id, spec } => {
                self.subscriptions.insert(sub_id, spec.clone());
                let listener = Arc::new(SubscribeListener {
                    sub_id,
                    dispatcher: self.dispatcher.clone(),
                    registry: Arc::clone(&self.subscriptions),
                });
                self.requests.submit(
                    |id| {
                        ControlRequest::subscribe(
                            id,
                            sub_id,
                            &session_id,
                            &spec.items,
                            &spec.fields,
                            spec.mode,
                            spec.snapshot,
                        )
                        .encode()
                    },
                    listener,
                );
            }
            Command::Unsubscribe { sub_id } => {
                if !self.subscriptions.contains(sub_id) {
                    debug!("unsubscribe for unknown subscription {}", sub_id);
                    return;
                }
                let listener = Arc::new(UnsubscribeListener {
                    sub_id,
                    dispatcher: self.dispatcher.clone(),
                });
                self.requests.submit(
                    |id| ControlRequest::unsubscribe(id, sub_id, &session_id).encode(),
                    listener,
                );
            }
            Command::SendMessage {
                prog,
                text,
                sequence,
                needs_ack,
            } => {
                self.messages.track(prog, &sequence, needs_ack);
                let listener = Arc::new(MessageSubmitListener {
                    prog,
                    dispatcher: self.dispatcher.clone(),
                    registry: Arc::clone(&self.messages),
                });
                self.requests.submit(
                    |id| {
                        ControlRequest::message(id, &session_id, &text, &sequence, prog, needs_ack)
                            .encode()
                    },
                    listener,
                );
            }
            Command::Constrain { max_bandwidth } => {
                self.requests.submit(
                    |id| ControlRequest::constrain(id, &session_id, max_bandwidth).encode(),
                    Arc::new(QuietListener),
                );
            }
            Command::Disconnect => unreachable!("handled before deferral"),
        }
        self.pump_requests();
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        let token = event.token();
        if Some(token) == self.stream_token {
            match event {
                TransportEvent::Opened { .. } => {
                    debug!("stream connection {} open", token);
                    self.stream_open = true;
                }
                TransportEvent::Data { bytes, .. } => self.on_stream_data(bytes),
                TransportEvent::Closed { .. } | TransportEvent::Error { .. } => {
                    self.stream_open = false;
                    if !self.state.status().is_terminal() {
                        self.state.set_recoverable(true);
                        self.enter_recovery("transport interrupted");
                    }
                }
            }
        } else {
            match event {
                TransportEvent::Opened { .. } => {
                    // Control write flushed; the terminal outcome arrives as
                    // a REQOK/REQERR frame on the stream.
                }
                TransportEvent::Data { .. } => {
                    debug!("ignoring data on control token {}", token);
                }
                TransportEvent::Closed { .. } | TransportEvent::Error { .. } => {
                    self.requests.attempt_failed(token, Instant::now());
                }
            }
        }
    }

    fn on_stream_data(&mut self, bytes: Bytes) {
        self.last_inbound = Instant::now();
        if matches!(self.state.status(), SessionStatus::Stalled) {
            self.set_status(SessionStatus::Connected(self.config.mode));
        }

        self.read_buf.extend_from_slice(&bytes);
        loop {
            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(frame)) => {
                    let data_frame = frame.carries_data();
                    if let Err(e) = self.handle_frame(frame) {
                        warn!("inconsistent server frame: {}", e);
                        self.state.set_recoverable(true);
                        self.enter_recovery("protocol error");
                        break;
                    }
                    if data_frame {
                        self.state.note_data_frame();
                    }
                    // END/LOOP/close tear down this connection; the rest of
                    // the buffer belongs to the dead connection.
                    if self.state.status().is_terminal() || self.stream_token.is_none() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("protocol error: {}", e);
                    self.state.set_recoverable(true);
                    self.enter_recovery("protocol error");
                    break;
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), RegistryError> {
        match frame {
            Frame::SessionOk {
                session_id,
                request_limit,
                keepalive_millis,
                control_link,
            } => {
                self.requests.bind_succeeded();
                self.state
                    .session_established(&session_id, request_limit, keepalive_millis);
                self.recovery_attempts = 0;
                self.recover_at = None;
                if let Some(link) = control_link {
                    debug!("server directs further binds to {}", link);
                }
                // A rebind of the same logical session keeps the current
                // CONNECTED status, so listeners see no spurious change.
                self.set_status(SessionStatus::Connected(self.config.mode));

                let deferred = std::mem::take(&mut self.deferred);
                for cmd in deferred {
                    self.apply_command(cmd);
                }
                self.pump_requests();
            }
            Frame::SessionError { code, message } => {
                warn!("session refused: {} {}", code, message);
                self.requests.bind_denied(code, &message);
                self.close_session(Some((code, message)));
            }
            Frame::ServerName(name) => {
                self.dispatcher.post(Event::Client(ClientEvent::PropertyChange(
                    format!("server_name={}", name),
                )));
            }
            Frame::ClientIp(ip) => {
                self.dispatcher.post(Event::Client(ClientEvent::PropertyChange(
                    format!("client_ip={}", ip),
                )));
            }
            Frame::Progress(count) => {
                debug!(
                    "server progress {} (local {})",
                    count,
                    self.state.progress()
                );
            }
            Frame::Loop {
                expected_delay_millis,
            } => {
                debug!("rebind requested in {} ms", expected_delay_millis);
                if let Some(handle) = self.stream_handle.take() {
                    handle.close(false);
                }
                self.stream_token = None;
                self.stream_open = false;
                self.pending_bind = BindKind::Rebind;
                self.recover_at =
                    Some(Instant::now() + Duration::from_millis(expected_delay_millis));
            }
            Frame::End { code, message } => {
                if end_is_recoverable(code) {
                    info!("recoverable session end: {} {}", code, message);
                    self.state.set_recoverable(true);
                    self.enter_recovery("server end");
                } else {
                    warn!("non-recoverable session end: {} {}", code, message);
                    self.state.set_recoverable(false);
                    self.close_session(Some((code, message)));
                }
            }
            Frame::SubscribeOk { sub_id, .. } | Frame::SubscribeCommand { sub_id, .. } => {
                self.subscriptions.activate(sub_id)?;
                self.dispatcher.post(Event::Subscription {
                    sub_id,
                    event: SubscriptionEvent::Subscribed,
                });
            }
            Frame::UnsubscribeOk { sub_id } => {
                if self.subscriptions.remove(sub_id) {
                    self.dispatcher.post(Event::Subscription {
                        sub_id,
                        event: SubscriptionEvent::Unsubscribed,
                    });
                }
            }
            Frame::Update {
                sub_id,
                item,
                values,
            } => {
                let update = self.subscriptions.apply_update(sub_id, item, &values)?;
                self.dispatcher.post(Event::Subscription {
                    sub_id,
                    event: SubscriptionEvent::Update(update),
                });
            }
            Frame::Overflow { sub_id, item, lost } => {
                let item = self.subscriptions.record_lost(sub_id, item, lost)?;
                self.dispatcher.post(Event::Subscription {
                    sub_id,
                    event: SubscriptionEvent::LostUpdates { item, lost },
                });
            }
            Frame::EndOfSnapshot { sub_id, item } => {
                let item = self.subscriptions.end_of_snapshot(sub_id, item)?;
                self.dispatcher.post(Event::Subscription {
                    sub_id,
                    event: SubscriptionEvent::EndOfSnapshot { item },
                });
            }
            Frame::ClearSnapshot { sub_id, item } => {
                let item = self.subscriptions.clear_snapshot(sub_id, item)?;
                self.dispatcher.post(Event::Subscription {
                    sub_id,
                    event: SubscriptionEvent::ClearSnapshot { item },
                });
            }
            Frame::Configuration {
                sub_id,
                max_frequency,
            } => {
                self.dispatcher.post(Event::Subscription {
                    sub_id,
                    event: SubscriptionEvent::Configuration { max_frequency },
                });
            }
            Frame::MessageDone { prog, .. } => {
                if self.messages.complete(prog)? {
                    self.dispatcher.post(Event::Message {
                        prog,
                        event: MessageEvent::Processed,
                    });
                }
            }
            Frame::MessageFail {
                prog,
                code,
                message,
                ..
            } => {
                if self.messages.complete(prog)? {
                    self.dispatcher.post(Event::Message {
                        prog,
                        event: MessageEvent::Denied { code, message },
                    });
                }
            }
            Frame::RequestOk { req_id } => {
                if !self.requests.is_bind(req_id) && !self.requests.complete_processed(req_id) {
                    debug!("acknowledgment for unknown request {}", req_id);
                }
            }
            Frame::RequestError {
                req_id,
                code,
                message,
            } => {
                if self.requests.is_bind(req_id) {
                    self.requests.bind_denied(code, &message);
                    if self.state.session_id().is_some() {
                        self.state.set_recoverable(true);
                        self.enter_recovery("bind denied");
                    } else {
                        self.close_session(Some((code, message)));
                    }
                } else if !self.requests.complete_denied(req_id, code, &message) {
                    debug!("denial for unknown request {}", req_id);
                }
            }
            Frame::Probe => {
                // Keep-alive; receiving it already reset the stall clock.
            }
            Frame::Noop => {}
        }
        Ok(())
    }
}

fn sleep_until(deadline: Instant) -> tokio::time::Sleep {
    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline))
}

struct SubscribeListener {
    sub_id: u64,
    dispatcher: Dispatcher,
    registry: Arc<SubscriptionRegistry>,
}

impl RequestListener for SubscribeListener {
    fn on_denied(&self, _req_id: u64, code: i32, message: &str) {
        self.registry.remove(self.sub_id);
        self.dispatcher.post(Event::Subscription {
            sub_id: self.sub_id,
            event: SubscriptionEvent::Error {
                code,
                message: message.to_string(),
            },
        });
    }

    fn on_aborted(&self, _req_id: u64) {
        if self.registry.remove(self.sub_id) {
            self.dispatcher.post(Event::Subscription {
                sub_id: self.sub_id,
                event: SubscriptionEvent::Error {
                    code: 0,
                    message: "request aborted".to_string(),
                },
            });
        }
    }
}

struct UnsubscribeListener {
    sub_id: u64,
    dispatcher: Dispatcher,
}

impl RequestListener for UnsubscribeListener {
    fn on_denied(&self, _req_id: u64, code: i32, message: &str) {
        self.dispatcher.post(Event::Subscription {
            sub_id: self.sub_id,
            event: SubscriptionEvent::Error {
                code,
                message: message.to_string(),
            },
        });
    }
}

struct MessageSubmitListener {
    prog: u64,
    dispatcher: Dispatcher,
    registry: Arc<MessageRegistry>,
}

impl RequestListener for MessageSubmitListener {
    fn on_denied(&self, _req_id: u64, code: i32, message: &str) {
        if let Ok(true) = self.registry.complete(self.prog) {
            self.dispatcher.post(Event::Message {
                prog: self.prog,
                event: MessageEvent::Denied {
                    code,
                    message: message.to_string(),
                },
            });
        }
    }

    fn on_aborted(&self, _req_id: u64) {
        if let Ok(true) = self.registry.complete(self.prog) {
            self.dispatcher.post(Event::Message {
                prog: self.prog,
                event: MessageEvent::Aborted,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use pushlink_dispatch::{ClientListener, ItemUpdate, MessageListener, SubscriptionListener};
    use pushlink_transport::LoopTransport;
    use pushlink_wire::SubscriptionMode;

    #[derive(Default)]
    struct RecordingClient {
        statuses: Mutex<Vec<String>>,
        errors: Mutex<Vec<(i32, String)>>,
    }

    impl RecordingClient {
        fn statuses(&self) -> Vec<String> {
            self.statuses.lock().unwrap().clone()
        }
        fn errors(&self) -> Vec<(i32, String)> {
            self.errors.lock().unwrap().clone()
        }
    }

    impl ClientListener for RecordingClient {
        fn on_status_change(&self, status: &str) {
            self.statuses.lock().unwrap().push(status.to_string());
        }
        fn on_server_error(&self, code: i32, message: &str) {
            self.errors.lock().unwrap().push((code, message.to_string()));
        }
    }

    #[derive(Default)]
    struct RecordingSub {
        events: Mutex<Vec<String>>,
    }

    impl RecordingSub {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl SubscriptionListener for RecordingSub {
        fn on_subscribed(&self) {
            self.push("subscribed".to_string());
        }
        fn on_unsubscribed(&self) {
            self.push("unsubscribed".to_string());
        }
        fn on_item_update(&self, update: &ItemUpdate) {
            self.push(format!(
                "update:{}:{}",
                update.item_name(),
                update.value("bid").unwrap_or("-")
            ));
        }
        fn on_item_lost_updates(&self, item: &str, lost: u64) {
            self.push(format!("lost:{}:{}", item, lost));
        }
        fn on_subscription_error(&self, code: i32, _message: &str) {
            self.push(format!("error:{}", code));
        }
    }

    #[derive(Default)]
    struct RecordingMsg {
        events: Mutex<Vec<String>>,
    }

    impl RecordingMsg {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl MessageListener for RecordingMsg {
        fn on_processed(&self) {
            self.events.lock().unwrap().push("processed".to_string());
        }
        fn on_denied(&self, code: i32, _message: &str) {
            self.events.lock().unwrap().push(format!("denied:{}", code));
        }
        fn on_abort(&self) {
            self.events.lock().unwrap().push("aborted".to_string());
        }
    }

    struct Harness {
        transport: Arc<LoopTransport>,
        commands: mpsc::UnboundedSender<Command>,
        dispatcher: Dispatcher,
        client: Arc<RecordingClient>,
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            adapter_set: "DEMO".to_string(),
            reverse_heartbeat_interval: Duration::ZERO,
            stall_timeout: Duration::from_secs(30),
            recovery_grace: Duration::from_secs(30),
            recovery: BackoffPolicy {
                initial: Duration::from_millis(20),
                ceiling: Duration::from_millis(40),
                max_attempts: 5,
            },
            request_retry: BackoffPolicy {
                initial: Duration::from_millis(20),
                ceiling: Duration::from_millis(40),
                max_attempts: 3,
            },
            ..SessionConfig::default()
        }
    }

    fn start(config: SessionConfig) -> Harness {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(LoopTransport::new(event_tx));
        let dispatcher = Dispatcher::new();
        let client = Arc::new(RecordingClient::default());
        dispatcher.add_client_listener(client.clone());

        let driver = SessionDriver::new(
            config,
            Arc::clone(&transport) as Arc<dyn Transport>,
            dispatcher.clone(),
            Arc::new(IdGenerator::new()),
        );
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(driver.run(cmd_rx, event_rx));

        Harness {
            transport,
            commands: cmd_tx,
            dispatcher,
            client,
        }
    }

    async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    fn spec() -> SubscriptionSpec {
        SubscriptionSpec {
            items: vec!["itemA".to_string(), "itemB".to_string()],
            fields: vec!["bid".to_string(), "ask".to_string()],
            mode: SubscriptionMode::Merge,
            snapshot: true,
        }
    }

    fn req_id_of(body: &str) -> u64 {
        body.split('&')
            .find_map(|pair| pair.strip_prefix("LS_reqId="))
            .expect("body carries a request id")
            .parse()
            .expect("request id is numeric")
    }

    async fn connect(harness: &Harness) {
        eventually("create request", || !harness.transport.sent().is_empty()).await;
        assert!(harness.transport.sent()[0].contains("LS_op=create"));
        harness.transport.push_line("CONOK,S7812,10,5000,*");
        eventually("connected status", || {
            harness.client.statuses().last().map(String::as_str) == Some("CONNECTED:STREAMING")
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_flow_status_sequence() {
        let harness = start(test_config());
        connect(&harness).await;
        assert_eq!(
            harness.client.statuses(),
            vec!["CREATING", "CONNECTED:STREAMING"]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subscribe_queues_until_session_established() {
        let harness = start(test_config());
        let sub = Arc::new(RecordingSub::default());
        harness.dispatcher.add_subscription_listener(1, sub.clone());

        // Submitted before any session frame: must queue, not transmit.
        harness
            .commands
            .send(Command::Subscribe { sub_id: 1, spec: spec() })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let sent = harness.transport.sent();
        assert_eq!(sent.len(), 1, "only the create request is on the wire");

        connect(&harness).await;
        eventually("subscribe transmitted", || {
            harness
                .transport
                .sent()
                .iter()
                .any(|body| body.contains("LS_op=add") && body.contains("LS_subId=1"))
        })
        .await;

        harness.transport.push_line("SUBOK,1,2,2");
        eventually("subscribe-ok delivered", || {
            sub.events().contains(&"subscribed".to_string())
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recovery_delivers_updates_exactly_once() {
        let harness = start(test_config());
        let sub = Arc::new(RecordingSub::default());
        harness.dispatcher.add_subscription_listener(1, sub.clone());
        connect(&harness).await;

        harness
            .commands
            .send(Command::Subscribe { sub_id: 1, spec: spec() })
            .unwrap();
        eventually("subscribe transmitted", || {
            harness.transport.sent().iter().any(|b| b.contains("LS_op=add"))
        })
        .await;
        harness.transport.push_line("SUBOK,1,2,2");
        harness.transport.push_line("U,1,1,100.5|200.1");
        eventually("first update", || {
            sub.events().contains(&"update:itemA:100.5".to_string())
        })
        .await;

        // Transport drop: the session recovers with the progress marker and
        // the server's replay of the delivered update is suppressed.
        harness.transport.drop_stream();
        eventually("recovery bind", || {
            harness
                .transport
                .sent()
                .iter()
                .any(|b| b.contains("LS_op=bind") && b.contains("LS_recovery_from=1"))
        })
        .await;

        harness.transport.push_line("CONOK,S7812,10,5000,*");
        harness.transport.push_line("PROG,0");
        harness.transport.push_line("U,1,1,100.5|200.1");
        harness.transport.push_line("U,1,1,101.0|200.2");
        eventually("fresh update", || {
            sub.events().contains(&"update:itemA:101.0".to_string())
        })
        .await;

        let updates: Vec<String> = sub
            .events()
            .into_iter()
            .filter(|event| event.starts_with("update:"))
            .collect();
        assert_eq!(
            updates,
            vec!["update:itemA:100.5", "update:itemA:101.0"],
            "no update duplicated, none lost across the recovery boundary"
        );
        assert_eq!(
            harness.client.statuses(),
            vec![
                "CREATING",
                "CONNECTED:STREAMING",
                "RECOVERING",
                "CONNECTED:STREAMING"
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_recoverable_end_rebinds_with_progress_marker() {
        let harness = start(test_config());
        connect(&harness).await;

        harness.transport.push_line("END,31,temporary");
        eventually("recovering status", || {
            harness.client.statuses().contains(&"RECOVERING".to_string())
        })
        .await;
        eventually("recovery bind", || {
            harness
                .transport
                .sent()
                .iter()
                .any(|b| b.contains("LS_op=bind") && b.contains("LS_recovery_from=0"))
        })
        .await;

        harness.transport.push_line("CONOK,S7812,10,5000,*");
        eventually("reconnected", || {
            harness.client.statuses().last().map(String::as_str) == Some("CONNECTED:STREAMING")
        })
        .await;
        assert!(
            harness.client.errors().is_empty(),
            "recoverable interruption is invisible to the application"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_loop_rebind_keeps_status_quiet() {
        let harness = start(test_config());
        connect(&harness).await;

        harness.transport.push_line("LOOP,0");
        eventually("rebind request", || {
            harness.transport.sent().iter().any(|b| {
                b.contains("LS_op=bind") && !b.contains("LS_recovery_from")
            })
        })
        .await;
        harness.transport.push_line("CONOK,S7812,10,5000,*");
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Same logical session: no status change beyond the original pair.
        assert_eq!(
            harness.client.statuses(),
            vec!["CREATING", "CONNECTED:STREAMING"]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_recoverable_end_closes_with_final_status() {
        let harness = start(test_config());
        connect(&harness).await;

        harness.transport.push_line("END,70,forbidden");
        eventually("closed", || {
            harness.client.statuses().last().map(String::as_str) == Some("CLOSED")
        })
        .await;
        assert_eq!(harness.client.errors(), vec![(70, "forbidden".to_string())]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnect_aborts_pending_message() {
        let harness = start(test_config());
        let msg = Arc::new(RecordingMsg::default());
        harness.dispatcher.add_message_listener(1, msg.clone());
        connect(&harness).await;

        harness
            .commands
            .send(Command::SendMessage {
                prog: 1,
                text: "order".to_string(),
                sequence: "orders".to_string(),
                needs_ack: true,
            })
            .unwrap();
        eventually("message transmitted", || {
            harness.transport.sent().iter().any(|b| b.contains("LS_op=msg"))
        })
        .await;

        harness.commands.send(Command::Disconnect).unwrap();
        eventually("closed", || {
            harness.client.statuses().last().map(String::as_str) == Some("CLOSED")
        })
        .await;
        eventually("message aborted", || {
            msg.events() == vec!["aborted".to_string()]
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_message_outcomes_from_server_frames() {
        let harness = start(test_config());
        let done = Arc::new(RecordingMsg::default());
        let failed = Arc::new(RecordingMsg::default());
        harness.dispatcher.add_message_listener(1, done.clone());
        harness.dispatcher.add_message_listener(2, failed.clone());
        connect(&harness).await;

        for (prog, text) in [(1u64, "first"), (2u64, "second")] {
            harness
                .commands
                .send(Command::SendMessage {
                    prog,
                    text: text.to_string(),
                    sequence: "orders".to_string(),
                    needs_ack: false,
                })
                .unwrap();
        }
        eventually("messages transmitted", || {
            harness.transport.sent().iter().filter(|b| b.contains("LS_op=msg")).count() == 2
        })
        .await;

        harness.transport.push_line("MSGDONE,orders,1");
        harness.transport.push_line("MSGFAIL,orders,2,34,refused");
        eventually("outcomes delivered", || {
            done.events() == vec!["processed".to_string()]
                && failed.events() == vec!["denied:34".to_string()]
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_transport_failure_replays_same_request_id() {
        let harness = start(test_config());
        connect(&harness).await;

        harness.transport.fail_next_sends(1);
        harness
            .commands
            .send(Command::Subscribe { sub_id: 1, spec: spec() })
            .unwrap();

        eventually("retransmission", || {
            harness.transport.sent().iter().any(|b| b.contains("LS_op=add"))
        })
        .await;

        let adds: Vec<String> = harness
            .transport
            .sent()
            .into_iter()
            .filter(|b| b.contains("LS_op=add"))
            .collect();
        assert_eq!(adds.len(), 1, "failed attempt never reached the wire");
        // The create took id 1, so the subscribe replays under id 2.
        assert_eq!(req_id_of(&adds[0]), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_control_requests_transmit_in_ascending_id_order() {
        let harness = start(test_config());
        connect(&harness).await;

        for sub_id in 1..=50 {
            harness
                .commands
                .send(Command::Subscribe { sub_id, spec: spec() })
                .unwrap();
        }
        eventually("all transmitted", || {
            harness.transport.sent().iter().filter(|b| b.contains("LS_op=add")).count() == 50
        })
        .await;

        let ids: Vec<u64> = harness
            .transport
            .sent()
            .iter()
            .filter(|b| b.contains("LS_op=add"))
            .map(|b| req_id_of(b))
            .collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted, "wire order equals ascending request-id order");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reverse_heartbeat_fires_regardless_of_traffic() {
        let config = SessionConfig {
            reverse_heartbeat_interval: Duration::from_millis(50),
            ..test_config()
        };
        let harness = start(config);
        connect(&harness).await;

        // Inbound traffic does not reset the reverse-heartbeat timer.
        for _ in 0..20 {
            harness.transport.push_line("PROBE");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        eventually("heartbeat request", || {
            harness
                .transport
                .sent()
                .iter()
                .any(|b| b.contains("LS_op=heartbeat"))
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_frame_escalates_to_recovery() {
        let harness = start(test_config());
        connect(&harness).await;

        harness.transport.push_line("BOGUS,1,2,3");
        eventually("recovery after protocol error", || {
            harness.client.statuses().contains(&"RECOVERING".to_string())
        })
        .await;
        eventually("recovery bind issued", || {
            harness.transport.sent().iter().any(|b| b.contains("LS_op=bind"))
        })
        .await;
    }
}
