//! The client facade.
//!
//! [`PushClient`] is what applications hold: it validates calls
//! synchronously, assigns subscription and message identifiers, registers
//! listeners with the dispatcher, and forwards work to the session driver
//! task as commands. Every call returns immediately; outcomes arrive
//! through the registered listeners.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{error, info};

use pushlink_dispatch::{ClientListener, Dispatcher, ListenerKey};
use pushlink_session::{Command, IdGenerator, SessionConfig, SessionDriver};
use pushlink_transport::{TcpTransport, Transport, TransportEvent};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::subscription::{ClientMessage, Subscription};

/// Facade over one streaming client: session, subscriptions, messaging.
pub struct PushClient {
    config: ClientConfig,
    dispatcher: Dispatcher,
    ids: Arc<IdGenerator>,
    commands: mpsc::UnboundedSender<Command>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    connected: AtomicBool,
    client_listeners: DashMap<ListenerKey, Arc<dyn ClientListener>>,
    subscription_listeners: DashMap<u64, Vec<ListenerKey>>,
}

impl PushClient {
    /// Build a client; fails synchronously on invalid configuration.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            dispatcher: Dispatcher::new(),
            ids: Arc::new(IdGenerator::new()),
            commands,
            commands_rx: Mutex::new(Some(commands_rx)),
            connected: AtomicBool::new(false),
            client_listeners: DashMap::new(),
            subscription_listeners: DashMap::new(),
        })
    }

    /// Open the session over TCP against the configured server.
    pub fn connect(&self) -> Result<(), ClientError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = TcpTransport::new(self.config.server_address.clone(), event_tx);
        self.connect_with(Arc::new(transport), event_rx)
    }

    /// Open the session over a caller-supplied transport. The receiver must
    /// be the counterpart of the channel the transport reports events on.
    pub fn connect_with(
        &self,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Result<(), ClientError> {
        let commands_rx = self
            .commands_rx
            .lock()
            .expect("command receiver lock poisoned")
            .take()
            .ok_or_else(|| ClientError::IllegalState("client already connected".to_string()))?;

        let session_config = SessionConfig {
            adapter_set: self.config.adapter_set.clone(),
            user: self.config.user.clone(),
            password: self.config.password.clone(),
            keepalive: self.config.keepalive,
            reverse_heartbeat_interval: self.config.reverse_heartbeat_interval,
            stall_timeout: self.config.stall_timeout,
            recovery_grace: self.config.recovery_grace,
            recovery: self.config.recovery_policy(),
            request_retry: self.config.request_policy(),
            request_timeout: self.config.request_timeout,
            ..SessionConfig::default()
        };

        let driver = SessionDriver::new(
            session_config,
            transport,
            self.dispatcher.clone(),
            Arc::clone(&self.ids),
        );
        tokio::spawn(async move {
            if let Err(e) = driver.run(commands_rx, transport_events).await {
                error!("session driver failed: {:#}", e);
            }
        });

        self.connected.store(true, Ordering::SeqCst);
        info!("connecting to {}", self.config.server_address);
        Ok(())
    }

    /// Close the session; every pending request receives exactly one abort
    /// and the final status notification is the last event delivered.
    pub fn disconnect(&self) {
        self.commands.send(Command::Disconnect).ok();
    }

    /// Submit a subscription. The returned id is assigned immediately; the
    /// request queues until the control channel is ready and the attached
    /// listeners observe the outcome.
    pub fn subscribe(&self, subscription: Subscription) -> Result<u64, ClientError> {
        let sub_id = self.ids.next_subscription_id();
        let (spec, listeners) = subscription.into_parts();

        let keys: Vec<ListenerKey> = listeners
            .into_iter()
            .map(|listener| self.dispatcher.add_subscription_listener(sub_id, listener))
            .collect();
        self.subscription_listeners.insert(sub_id, keys);

        self.commands
            .send(Command::Subscribe { sub_id, spec })
            .map_err(|_| ClientError::IllegalState("client is shut down".to_string()))?;
        Ok(sub_id)
    }

    /// Remove a subscription by id. The listeners stay attached until
    /// [`PushClient::detach_subscription`] so they observe the closing
    /// notification.
    pub fn unsubscribe(&self, sub_id: u64) -> Result<(), ClientError> {
        self.commands
            .send(Command::Unsubscribe { sub_id })
            .map_err(|_| ClientError::IllegalState("client is shut down".to_string()))
    }

    /// Drop the listeners registered for a subscription id, effective
    /// immediately for anything not yet delivered.
    pub fn detach_subscription(&self, sub_id: u64) {
        if let Some((_, keys)) = self.subscription_listeners.remove(&sub_id) {
            for key in keys {
                self.dispatcher.remove(key);
            }
        }
    }

    /// Submit a point-to-point message; returns its progressive number.
    pub fn send_message(&self, message: ClientMessage) -> Result<u64, ClientError> {
        let prog = self.ids.next_message_prog();
        let (text, sequence, needs_ack, listeners) = message.into_parts();

        for listener in listeners {
            self.dispatcher.add_message_listener(prog, listener);
        }

        self.commands
            .send(Command::SendMessage {
                prog,
                text,
                sequence,
                needs_ack,
            })
            .map_err(|_| ClientError::IllegalState("client is shut down".to_string()))?;
        Ok(prog)
    }

    /// Ask the server to cap update bandwidth.
    pub fn constrain(&self, max_bandwidth: f64) -> Result<(), ClientError> {
        if !max_bandwidth.is_finite() || max_bandwidth <= 0.0 {
            return Err(ClientError::Configuration(format!(
                "max bandwidth must be positive, got {}",
                max_bandwidth
            )));
        }
        self.commands
            .send(Command::Constrain { max_bandwidth })
            .map_err(|_| ClientError::IllegalState("client is shut down".to_string()))
    }

    /// Attach a client listener; it observes status changes, server errors,
    /// and property changes from registration onward.
    pub fn add_listener(&self, listener: Arc<dyn ClientListener>) -> ListenerKey {
        listener.on_listen_start();
        let key = self.dispatcher.add_client_listener(Arc::clone(&listener));
        self.client_listeners.insert(key, listener);
        key
    }

    /// Detach a client listener, effective immediately for anything not yet
    /// delivered.
    pub fn remove_listener(&self, key: ListenerKey) {
        self.dispatcher.remove(key);
        if let Some((_, listener)) = self.client_listeners.remove(&key) {
            listener.on_listen_end();
        }
    }

    /// Whether [`PushClient::connect`] has been called.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
