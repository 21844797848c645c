//! Session controller
//!
//! A single task owns all session state. Host commands, signalling events,
//! peer callbacks and timer firings are posted to one inbox and handled in
//! order by [`SessionController::step`], so transitions never overlap.
//!
//! Work that outlives a step (connecting, generating descriptions, timers)
//! runs in spawned tasks that post back tagged with the session generation.
//! Inputs from an older generation are dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::inputs::{InputBinding, InputBindings};
use super::reconnect::{CloseContext, RECONNECT_DELAY};
use super::selection::{decide, resolve_wanted, ListDecision, StreamerCatalog};
use super::state::{NegotiationContext, SessionData, SessionState};
use crate::config::{overrides, AppConfig, SettingsStore};
use crate::error::{AppError, Result};
use crate::events::{EventBus, ObserverId, SessionEvent, SessionObserver};
use crate::signalling::transport::CLOSE_ABNORMAL;
use crate::signalling::{
    IceCandidate, InboundMessage, KeepaliveMonitor, OutboundMessage, PeerConnectionOptions,
    SessionDescriptionMessage, SignallingConnector, SignallingTransport, TransportEvent,
    CLOSE_NORMAL,
};
use crate::stats::{SessionInfo, StatsPipeline};
use crate::utils::LogThrottler;
use crate::webrtc::codec::{
    negotiate_codecs, order_codec_preferences, reselect_codec, CodecCapabilities, FALLBACK_CODEC,
};
use crate::webrtc::datachannel::RECV_DATACHANNEL_LABEL;
use crate::webrtc::ice::{turn_available, CandidatePolicy, TURN_UNAVAILABLE_REASON};
use crate::webrtc::peer::local_offer_bindings;
use crate::webrtc::protocol::{FieldValue, FromStreamerMessage, ProtocolTable, ToStreamerMessage};
use crate::webrtc::sdp::{mic_permitted, AudioParams, RuntimeProfile, SdpTransformer, TransformPolicy};
use crate::webrtc::{
    DataChannelTopology, MediaSession, PeerEvent, PeerFactory, PeerSettings, SdpKind,
    TransceiverPlan,
};
use crate::{debug_throttled, warn_throttled};

/// Interval between stats collections while connected
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Host requests
pub enum Command {
    Connect,
    /// Drop the current connection and connect again
    Reconnect { message: Option<String> },
    Close,
    /// Switch to another streamer
    SelectStreamer(String),
    /// Set the preferred codec; stops stats from overriding it
    SetPreferredCodec(String),
    SendToStreamer {
        kind: ToStreamerMessage,
        values: Vec<FieldValue>,
        reply: oneshot::Sender<Result<()>>,
    },
    GetState {
        reply: oneshot::Sender<SessionState>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Reconnect,
    StreamerRequery,
    KeepaliveTimeout,
}

/// Everything the controller reacts to
pub enum ControllerInput {
    Command(Command),
    SignallingAttached {
        generation: u64,
        transport: Arc<dyn SignallingTransport>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Peer {
        generation: u64,
        peer: u64,
        event: PeerEvent,
    },
    /// A local description was generated and applied
    Negotiated {
        generation: u64,
        kind: SdpKind,
        result: Result<String>,
    },
    Timer {
        generation: u64,
        kind: TimerKind,
    },
    StatsTick {
        generation: u64,
    },
}

pub struct SessionController {
    id: Uuid,
    settings: SettingsStore,
    events: Arc<EventBus>,
    connector: Arc<dyn SignallingConnector>,
    peers: Arc<dyn PeerFactory>,
    inputs: InputBindings,
    runtime: RuntimeProfile,

    inbox_tx: mpsc::UnboundedSender<ControllerInput>,
    inbox_rx: Option<mpsc::UnboundedReceiver<ControllerInput>>,
    shutdown: CancellationToken,
    /// Cancels scheduled work of the current generation
    timers: CancellationToken,
    stats_timer: Option<CancellationToken>,

    state: SessionState,
    session: SessionData,
    catalog: StreamerCatalog,
    transport: Option<Arc<dyn SignallingTransport>>,
    keepalive: Option<KeepaliveMonitor>,
    media: Option<Arc<dyn MediaSession>>,
    peer_seq: u64,
    peer_options: Option<PeerConnectionOptions>,
    protocol: ProtocolTable,
    stats: StatsPipeline,
    throttler: LogThrottler,
}

impl SessionController {
    pub fn new(
        settings: SettingsStore,
        connector: Arc<dyn SignallingConnector>,
        peers: Arc<dyn PeerFactory>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            settings,
            events: Arc::new(EventBus::new()),
            connector,
            peers,
            inputs: InputBindings::new(),
            runtime: RuntimeProfile::native(),
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            shutdown: CancellationToken::new(),
            timers: CancellationToken::new(),
            stats_timer: None,
            state: SessionState::Idle,
            session: SessionData::default(),
            catalog: StreamerCatalog::default(),
            transport: None,
            keepalive: None,
            media: None,
            peer_seq: 0,
            peer_options: None,
            protocol: ProtocolTable::new(),
            stats: StatsPipeline::new(),
            throttler: LogThrottler::default(),
        }
    }

    pub fn with_input(mut self, binding: Arc<dyn InputBinding>) -> Self {
        self.inputs.add(binding);
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeProfile) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            inbox: self.inbox_tx.clone(),
            events: self.events.clone(),
            settings: self.settings.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.session.generation
    }

    /// Most recent streamer list
    pub fn catalog(&self) -> &StreamerCatalog {
        &self.catalog
    }

    /// Run until [`SessionHandle::shutdown`] is called
    pub async fn run(mut self) {
        let Some(mut inbox) = self.inbox_rx.take() else {
            error!("Session controller {} is already running", self.id);
            return;
        };
        info!("Session controller {} started", self.id);

        self.apply_url_overrides().await;
        if self.settings.get().streamer.auto_connect {
            self.step(ControllerInput::Command(Command::Connect)).await;
        }

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                input = inbox.recv() => match input {
                    Some(input) => self.step(input).await,
                    None => break,
                },
            }
        }

        self.close_session().await;
        info!("Session controller {} stopped", self.id);
    }

    /// Handle one input
    pub async fn step(&mut self, input: ControllerInput) {
        match input {
            ControllerInput::Command(command) => self.handle_command(command).await,
            ControllerInput::SignallingAttached {
                generation,
                transport,
            } => {
                if generation != self.session.generation {
                    debug!("Closing signalling connection of stale generation {}", generation);
                    transport.close(CLOSE_NORMAL, "").await;
                    return;
                }
                self.transport = Some(transport);
            }
            ControllerInput::Transport { generation, event } => {
                if generation != self.session.generation {
                    debug!("Ignoring signalling event of stale generation {}", generation);
                    return;
                }
                self.handle_transport_event(event).await;
            }
            ControllerInput::Peer {
                generation,
                peer,
                event,
            } => {
                if generation != self.session.generation || peer != self.peer_seq {
                    debug!("Ignoring event from a previous peer connection");
                    return;
                }
                self.handle_peer_event(event).await;
            }
            ControllerInput::Negotiated {
                generation,
                kind,
                result,
            } => self.on_negotiated(generation, kind, result).await,
            ControllerInput::Timer { generation, kind } => {
                if generation != self.session.generation {
                    debug!("Ignoring {:?} timer of stale generation {}", kind, generation);
                    return;
                }
                self.handle_timer(kind).await;
            }
            ControllerInput::StatsTick { generation } => {
                if generation == self.session.generation {
                    self.on_stats_tick().await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if !self.state.can_connect() {
                    warn!("Connect ignored in state {}", self.state);
                    return;
                }
                self.session.enable_auto_reconnect = true;
                self.session.disconnect_message = None;
                self.session.locally_closed = false;
                self.start_connect().await;
            }
            Command::Reconnect { message } => self.reconnect(message).await,
            Command::Close => self.close_session().await,
            Command::SelectStreamer(id) => self.select_streamer(id).await,
            Command::SetPreferredCodec(codec) => {
                self.session.auto_update_codec = false;
                self.set_preferred_codec(codec).await;
            }
            Command::SendToStreamer {
                kind,
                values,
                reply,
            } => {
                let result = self.send_to_streamer(kind, &values).await;
                let _ = reply.send(result);
            }
            Command::GetState { reply } => {
                let _ = reply.send(self.state.clone());
            }
        }
    }

    async fn reconnect(&mut self, message: Option<String>) {
        info!("Reconnect requested");
        self.session.force_reconnect = true;
        self.session.reconnect_attempt = 0;
        self.session.locally_closed = false;
        self.session.disconnect_message = message.clone();
        self.cancel_timers();

        match self.transport.clone() {
            Some(transport) if transport.is_open() && self.session.signalling_live => {
                // The close path schedules the reconnect
                transport
                    .close(CLOSE_NORMAL, message.as_deref().unwrap_or_default())
                    .await;
            }
            _ => {
                self.emit(SessionEvent::AutoConnect);
                self.start_connect().await;
            }
        }
    }

    async fn close_session(&mut self) {
        if self.state == SessionState::Idle && self.transport.is_none() {
            return;
        }
        info!("Closing session");
        self.session.locally_closed = true;
        self.session.signalling_live = false;
        self.cancel_timers();
        self.stop_keepalive();
        if let Some(transport) = self.transport.take() {
            transport.close(CLOSE_NORMAL, "").await;
        }
        self.teardown_media().await;
        self.session.subscription_active = false;

        let reason = self
            .session
            .disconnect_message
            .take()
            .unwrap_or_else(|| "Session closed".to_string());
        self.emit(SessionEvent::Disconnected {
            reason,
            allow_manual_reconnect: true,
        });
        self.set_state(SessionState::Idle);
    }

    async fn select_streamer(&mut self, id: String) {
        if self.transport.is_none() {
            warn!("Cannot select streamer {}: not connected", id);
            return;
        }
        info!("Switching to streamer {}", id);
        self.teardown_media().await;
        self.session.subscription_active = false;
        self.set_state(SessionState::AwaitingStreamerList);
        self.subscribe(id).await;
    }

    async fn set_preferred_codec(&mut self, codec: String) {
        let value = codec.clone();
        if let Err(e) = self
            .settings
            .update("webrtc.preferred_codec", |c| {
                c.webrtc.preferred_codec.selected = codec;
            })
            .await
        {
            warn!("Failed to store preferred codec: {}", e);
            return;
        }
        self.emit(SessionEvent::SettingsChanged {
            key: "webrtc.preferred_codec".to_string(),
            value,
        });
    }

    async fn send_to_streamer(&self, kind: ToStreamerMessage, values: &[FieldValue]) -> Result<()> {
        let media = self
            .media
            .clone()
            .ok_or_else(|| AppError::WebRtcError("No media session".to_string()))?;
        let data = self.protocol.encode(kind, values)?;
        media.send_data(data).await
    }

    // ------------------------------------------------------------------
    // Signalling
    // ------------------------------------------------------------------

    async fn start_connect(&mut self) {
        self.stop_keepalive();
        if let Some(transport) = self.transport.take() {
            transport.close(CLOSE_NORMAL, "").await;
        }
        self.teardown_media().await;
        self.cancel_timers();

        self.session.generation += 1;
        self.session.signalling_live = true;
        self.session.subscription_active = false;
        self.session.codec_reselected = false;
        self.session.is_using_sfu = false;
        self.session.is_using_svc = false;
        self.peer_options = None;
        self.protocol = ProtocolTable::new();
        self.throttler.clear_all();

        let config = self.settings.get();
        let url = config.signalling.url.clone();
        let subprotocols = config.signalling.subprotocols.clone();
        let generation = self.session.generation;

        self.set_state(SessionState::SignallingConnecting);
        self.emit(SessionEvent::SignallingConnecting { url: url.clone() });
        info!("Connecting to signalling server {} (generation {})", url, generation);

        let connector = self.connector.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let (events_tx, mut events_rx) = mpsc::unbounded_channel();
            match connector.connect(&url, &subprotocols, events_tx).await {
                Ok(transport) => {
                    let _ = inbox.send(ControllerInput::SignallingAttached {
                        generation,
                        transport,
                    });
                    while let Some(event) = events_rx.recv().await {
                        if inbox
                            .send(ControllerInput::Transport { generation, event })
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!("Signalling connection to {} failed: {}", url, e);
                    let reason = e.to_string();
                    let _ = inbox.send(ControllerInput::Transport {
                        generation,
                        event: TransportEvent::Error(reason.clone()),
                    });
                    let _ = inbox.send(ControllerInput::Transport {
                        generation,
                        event: TransportEvent::Close {
                            code: CLOSE_ABNORMAL,
                            reason,
                        },
                    });
                }
            }
        });
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_signalling_open().await,
            TransportEvent::Message(message) => self.handle_message(message).await,
            TransportEvent::Close { code, reason } => self.on_signalling_close(code, reason).await,
            TransportEvent::Error(e) => warn!("Signalling error: {}", e),
        }
    }

    async fn on_signalling_open(&mut self) {
        self.session.reconnect_attempt = 0;
        self.session.force_reconnect = false;
        self.set_state(SessionState::AwaitingStreamerList);
        self.emit(SessionEvent::SignallingConnected);

        let delay = self.settings.get().signalling.keepalive_delay_ms;
        if delay > 0 {
            if let Some(transport) = self.transport.clone() {
                let inbox = self.inbox_tx.clone();
                let generation = self.session.generation;
                self.keepalive = Some(KeepaliveMonitor::start(
                    Duration::from_millis(delay),
                    transport,
                    Arc::new(move || {
                        let _ = inbox.send(ControllerInput::Timer {
                            generation,
                            kind: TimerKind::KeepaliveTimeout,
                        });
                    }),
                ));
            }
        }

        self.send(OutboundMessage::ListStreamers).await;
    }

    async fn on_signalling_close(&mut self, code: u16, reason: String) {
        if !self.session.signalling_live {
            debug!("Signalling close already handled ({} {})", code, reason);
            return;
        }
        self.session.signalling_live = false;

        let config = self.settings.get();
        let decision = CloseContext {
            code,
            force_reconnect: self.session.force_reconnect,
            enable_auto_reconnect: self.session.enable_auto_reconnect,
            max_attempts: config.streamer.max_reconnect_attempts,
            attempt: self.session.reconnect_attempt,
            locally_closed: self.session.locally_closed,
        }
        .decide();

        let message = self.session.disconnect_message.take().unwrap_or(reason);
        info!(
            "Signalling closed ({}): {} (retry: {}, attempt {})",
            code, message, decision.will_retry, self.session.reconnect_attempt
        );
        self.emit(SessionEvent::Disconnected {
            reason: message.clone(),
            allow_manual_reconnect: decision.allow_manual_reconnect(),
        });

        self.stop_keepalive();
        self.cancel_timers();
        self.transport = None;
        self.teardown_media().await;
        self.session.subscription_active = false;

        if decision.will_retry {
            self.set_state(SessionState::Disconnected {
                terminal: false,
                reason: message,
            });
            self.schedule(
                RECONNECT_DELAY,
                ControllerInput::Timer {
                    generation: self.session.generation,
                    kind: TimerKind::Reconnect,
                },
            );
        } else {
            self.session.force_reconnect = false;
            self.set_state(SessionState::Disconnected {
                terminal: true,
                reason: message,
            });
        }
    }

    /// End the session without any retry
    async fn abort_session(&mut self, reason: &str) {
        error!("{}", reason);
        self.session.signalling_live = false;
        self.session.enable_auto_reconnect = false;
        self.stop_keepalive();
        self.cancel_timers();
        if let Some(transport) = self.transport.take() {
            transport.close(CLOSE_NORMAL, reason).await;
        }
        self.teardown_media().await;
        self.session.subscription_active = false;

        self.emit(SessionEvent::Disconnected {
            reason: reason.to_string(),
            allow_manual_reconnect: false,
        });
        self.set_state(SessionState::Disconnected {
            terminal: true,
            reason: reason.to_string(),
        });
    }

    async fn handle_message(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Config {
                peer_connection_options,
                protocol_version,
            } => self.on_config(peer_connection_options, protocol_version).await,
            InboundMessage::Identify => debug!("Identify request ignored"),
            InboundMessage::Ping { time } => self.send(OutboundMessage::Pong { time }).await,
            InboundMessage::Pong { time } => {
                if let Some(ref keepalive) = self.keepalive {
                    keepalive.on_pong(time);
                    debug!("Signalling RTT {:.0} ms", keepalive.rtt_ms());
                }
            }
            InboundMessage::StreamerList { ids } => self.on_streamer_list(ids).await,
            InboundMessage::SubscribeFailed { message } => {
                warn!("Subscribe failed: {}", message);
                self.session.subscription_active = false;
                self.session.subscribed_streamer_id = None;
                self.emit(SessionEvent::SubscribeFailed { message });
            }
            InboundMessage::StreamerIdChanged { new_id } => {
                if let Some(old_id) = self.session.subscribed_streamer_id.replace(new_id.clone()) {
                    info!("Streamer {} renamed to {}", old_id, new_id);
                    self.catalog.rename(&old_id, &new_id);
                }
                self.emit(SessionEvent::StreamerIdChanged { new_id });
            }
            InboundMessage::StreamerDisconnected => {
                info!("Streamer disconnected, waiting for it to return");
                self.teardown_media().await;
                self.session.subscription_active = false;
                self.set_state(SessionState::AwaitingStreamerList);
                self.send(OutboundMessage::ListStreamers).await;
            }
            InboundMessage::PlayerCount { count } => {
                self.emit(SessionEvent::PlayerCount { count });
            }
            InboundMessage::Answer { sdp } => self.on_remote_answer(sdp).await,
            InboundMessage::Offer {
                sdp,
                sfu,
                scalability_mode,
            } => self.on_remote_offer(sdp, sfu, scalability_mode.is_some()).await,
            InboundMessage::PeerDataChannels {
                send_stream_id,
                recv_stream_id,
            } => self.on_peer_data_channels(send_stream_id, recv_stream_id).await,
            InboundMessage::IceCandidate { candidate } => self.on_remote_candidate(candidate).await,
        }
    }

    async fn on_config(&mut self, options: PeerConnectionOptions, protocol_version: Option<String>) {
        let config = self.settings.get();
        info!(
            "Received config ({} ICE servers, protocol {})",
            options.ice_servers.len(),
            protocol_version.as_deref().unwrap_or("unknown")
        );

        if config.webrtc.force_turn && !turn_available(&options) {
            self.abort_session(TURN_UNAVAILABLE_REASON).await;
            return;
        }

        self.peer_options = Some(options);
        if let Err(e) = self.ensure_media().await {
            error!("Failed to create peer connection: {}", e);
            self.emit(SessionEvent::Error {
                message: e.to_string(),
            });
            return;
        }

        if config.webrtc.offer_to_receive {
            self.start_local_offer(&config);
        }
    }

    async fn on_streamer_list(&mut self, ids: Vec<String>) {
        let config = self.settings.get();
        let wanted = resolve_wanted(
            config.streamer.streamer_id.as_deref(),
            self.session.subscribed_streamer_id.as_deref(),
        );
        let catalog = StreamerCatalog::new(ids, wanted, config.streamer.wait_for_streamer);
        let active = self
            .session
            .subscription_active
            .then_some(self.session.subscribed_streamer_id.as_deref())
            .flatten();

        let decision = decide(
            &catalog,
            active,
            config.streamer.wait_for_streamer,
            self.session.auto_join_attempt,
            config.streamer.max_reconnect_attempts,
        );

        self.emit(SessionEvent::StreamerList {
            streamers: catalog.streamers.clone(),
            auto_selected: catalog.auto_selection.clone(),
            wanted: catalog.wanted.clone(),
        });
        self.catalog = catalog;

        match decision {
            ListDecision::KeepSubscription => debug!("Already subscribed, ignoring streamer list"),
            ListDecision::Subscribe(id) => self.subscribe(id).await,
            ListDecision::Requery(attempt) => {
                self.session.auto_join_attempt = attempt;
                info!(
                    "Wanted streamer not available, asking again in {} ms (attempt {})",
                    config.streamer.auto_join_interval_ms, attempt
                );
                self.schedule(
                    Duration::from_millis(config.streamer.auto_join_interval_ms),
                    ControllerInput::Timer {
                        generation: self.session.generation,
                        kind: TimerKind::StreamerRequery,
                    },
                );
            }
            ListDecision::GiveUp => {
                warn!("Giving up waiting for streamer");
                self.session.auto_join_attempt = 0;
                self.session.enable_auto_reconnect = false;
                self.emit(SessionEvent::StreamerAutoSelectFailed);
            }
            ListDecision::NoSelection => debug!("No streamer selected"),
        }
    }

    async fn subscribe(&mut self, id: String) {
        info!("Subscribing to streamer {}", id);
        self.cancel_timers();
        self.send(OutboundMessage::Subscribe {
            streamer_id: id.clone(),
        })
        .await;
        self.session.subscribed_streamer_id = Some(id);
        self.session.subscription_active = true;
        self.session.reconnect_attempt = 0;
        self.session.auto_join_attempt = 0;
    }

    // ------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------

    async fn ensure_media(&mut self) -> Result<Arc<dyn MediaSession>> {
        if let Some(ref media) = self.media {
            return Ok(media.clone());
        }
        let options = self
            .peer_options
            .clone()
            .ok_or_else(|| AppError::WebRtcError("No peer configuration received".to_string()))?;
        let policy = CandidatePolicy::from_force_turn(self.settings.get().webrtc.force_turn);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let media = self
            .peers
            .create(PeerSettings { options, policy }, events_tx)
            .await?;

        self.peer_seq += 1;
        let peer = self.peer_seq;
        let generation = self.session.generation;
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if inbox
                    .send(ControllerInput::Peer {
                        generation,
                        peer,
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        self.media = Some(media.clone());
        Ok(media)
    }

    fn effective_mic(&self, config: &AppConfig) -> bool {
        if !config.webrtc.use_mic {
            return false;
        }
        let permitted = mic_permitted(&config.signalling.url);
        if !permitted {
            error!("Microphone needs a secure signalling connection or localhost, disabling it");
        }
        permitted
    }

    fn transformer(&self, config: &AppConfig, use_mic: bool) -> SdpTransformer {
        SdpTransformer::new(
            TransformPolicy {
                audio: AudioParams {
                    use_mic,
                    force_mono: config.webrtc.force_mono_audio,
                },
                enable_capture_time_ext: config.webrtc.enable_capture_time_ext,
            },
            self.runtime.clone(),
        )
    }

    fn transceiver_plan(
        local: &CodecCapabilities,
        config: &AppConfig,
        use_mic: bool,
    ) -> TransceiverPlan {
        let local = match local {
            CodecCapabilities::Available(codecs) => codecs.clone(),
            CodecCapabilities::Unavailable => vec![FALLBACK_CODEC.to_string()],
        };
        TransceiverPlan::new(
            use_mic,
            config.webrtc.use_camera,
            order_codec_preferences(&config.webrtc.preferred_codec.selected, &local),
        )
    }

    async fn store_codec_options(&mut self, codecs: Vec<String>) {
        if self.session.codec_reselected {
            return;
        }
        if let Err(e) = self
            .settings
            .update("webrtc.preferred_codec", |c| {
                c.webrtc.preferred_codec.set_options(codecs);
            })
            .await
        {
            warn!("Failed to store codec options: {}", e);
        }
    }

    /// Client-offer mode: create and send our own offer
    fn start_local_offer(&mut self, config: &AppConfig) {
        let Some(media) = self.media.clone() else {
            return;
        };
        let use_mic = self.effective_mic(config);
        let transformer = self.transformer(config, use_mic);
        let plan = Self::transceiver_plan(&media.local_codecs(), config, use_mic);
        self.session.negotiation = Some(NegotiationContext {
            use_mic,
            ..Default::default()
        });

        let generation = self.session.generation;
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result: Result<String> = async {
                media.create_data_channels(&local_offer_bindings()).await?;
                media.apply_transceiver_plan(&plan).await?;
                let offer = transformer.munge_local(&media.create_offer().await?);
                media
                    .set_local_description(SdpKind::Offer, offer.clone())
                    .await?;
                Ok(offer)
            }
            .await;
            let _ = inbox.send(ControllerInput::Negotiated {
                generation,
                kind: SdpKind::Offer,
                result,
            });
        });
    }

    async fn on_remote_offer(&mut self, sdp: String, sfu: bool, svc: bool) {
        if !self.session.subscription_active && !self.settings.get().webrtc.offer_to_receive {
            warn!("Ignoring offer without an active subscription (state {})", self.state);
            return;
        }
        if self.session.negotiation_pending() {
            warn!("Ignoring offer while another negotiation is in progress");
            return;
        }
        // The stream keeps flowing while a live session renegotiates
        let renegotiating = self.state == SessionState::Connected;
        let media = match self.ensure_media().await {
            Ok(media) => media,
            Err(e) => {
                error!("Cannot answer offer: {}", e);
                return;
            }
        };

        if sfu {
            self.session.is_using_sfu = true;
            if let Err(e) = self
                .settings
                .update("webrtc.preferred_codec", |c| {
                    c.webrtc.preferred_codec.selected.clear();
                })
                .await
            {
                warn!("Failed to clear preferred codec: {}", e);
            }
        }
        if svc {
            self.session.is_using_svc = true;
        }
        info!("Received offer (sfu: {}, svc: {})", sfu, svc);
        self.emit(SessionEvent::SdpOffer { sdp: sdp.clone() });

        let config = self.settings.get();
        let use_mic = self.effective_mic(&config);
        let transformer = self.transformer(&config, use_mic);
        let remote = transformer.prepare_remote(&sdp);
        let local = media.local_codecs();
        let codecs = negotiate_codecs(&remote, &local);
        debug!("Codec intersection: {:?}", codecs);
        self.store_codec_options(codecs.clone()).await;

        let config = self.settings.get();
        let plan = Self::transceiver_plan(&local, &config, use_mic);
        self.session.negotiation = Some(NegotiationContext {
            remote_sdp: Some(remote.clone()),
            codecs,
            use_mic,
            committed: false,
            remote_applied: false,
        });
        if renegotiating {
            info!("Renegotiating connected session");
        } else {
            self.set_state(SessionState::Negotiating);
            self.emit(SessionEvent::WebRtcConnecting);
        }

        let generation = self.session.generation;
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result: Result<String> = async {
                media.set_remote_description(SdpKind::Offer, remote).await?;
                media.apply_transceiver_plan(&plan).await?;
                let answer = transformer.munge_local(&media.create_answer().await?);
                media
                    .set_local_description(SdpKind::Answer, answer.clone())
                    .await?;
                Ok(answer)
            }
            .await;
            let _ = inbox.send(ControllerInput::Negotiated {
                generation,
                kind: SdpKind::Answer,
                result,
            });
        });
    }

    async fn on_negotiated(&mut self, generation: u64, kind: SdpKind, result: Result<String>) {
        if generation != self.session.generation || self.session.negotiation.is_none() {
            debug!("Dropping {:?} generated for a finished session", kind);
            return;
        }
        if kind == SdpKind::Answer
            && !matches!(self.state, SessionState::Negotiating | SessionState::Connected)
        {
            debug!("Dropping answer, state is now {}", self.state);
            return;
        }

        let sdp = match result {
            Ok(sdp) => sdp,
            Err(e) => {
                error!("Failed to create {:?}: {}", kind, e);
                self.session.negotiation = None;
                self.emit(SessionEvent::WebRtcFailed);
                self.emit(SessionEvent::Error {
                    message: e.to_string(),
                });
                return;
            }
        };

        let config = self.settings.get();
        let description = SessionDescriptionMessage::new(
            sdp.clone(),
            config.webrtc.min_bitrate_kbps,
            config.webrtc.max_bitrate_kbps,
        );

        if let Some(ref mut negotiation) = self.session.negotiation {
            negotiation.committed = true;
            if kind == SdpKind::Answer {
                negotiation.remote_applied = true;
            }
        }

        match kind {
            SdpKind::Offer => {
                info!("Sending offer");
                self.send(OutboundMessage::Offer(description)).await;
                self.emit(SessionEvent::SdpOffer { sdp });
            }
            SdpKind::Answer => {
                info!("Sending answer");
                self.send(OutboundMessage::Answer(description)).await;
                self.emit(SessionEvent::SdpAnswer { sdp });
                if self.session.is_using_sfu {
                    self.send(OutboundMessage::DataChannelRequest).await;
                }
                self.flush_pending_candidates().await;
            }
        }

        self.maybe_connected();
    }

    async fn on_remote_answer(&mut self, sdp: String) {
        let awaiting_answer = self
            .session
            .negotiation
            .as_ref()
            .is_some_and(|n| n.committed && !n.remote_applied);
        let Some(media) = self.media.clone().filter(|_| awaiting_answer) else {
            warn!("Unexpected answer, no local offer outstanding");
            return;
        };

        self.emit(SessionEvent::SdpAnswer { sdp: sdp.clone() });
        let config = self.settings.get();
        let use_mic = self
            .session
            .negotiation
            .as_ref()
            .is_some_and(|n| n.use_mic);
        let remote = self.transformer(&config, use_mic).prepare_remote(&sdp);

        if let Err(e) = media
            .set_remote_description(SdpKind::Answer, remote.clone())
            .await
        {
            error!("Failed to apply answer: {}", e);
            self.emit(SessionEvent::WebRtcFailed);
            return;
        }

        let codecs = negotiate_codecs(&remote, &media.local_codecs());
        self.store_codec_options(codecs.clone()).await;
        if let Some(ref mut negotiation) = self.session.negotiation {
            negotiation.remote_sdp = Some(remote);
            negotiation.codecs = codecs;
            negotiation.remote_applied = true;
        }
        self.set_state(SessionState::Negotiating);
        self.emit(SessionEvent::WebRtcConnecting);
        self.flush_pending_candidates().await;
        self.maybe_connected();
    }

    async fn on_peer_data_channels(&mut self, send_stream_id: u16, recv_stream_id: u16) {
        if self.session.topology != DataChannelTopology::Direct {
            warn!("Data channels are already bound for this session");
            return;
        }
        let media = match self.ensure_media().await {
            Ok(media) => media,
            Err(e) => {
                error!("Cannot bind data channels: {}", e);
                return;
            }
        };

        let topology = DataChannelTopology::relayed(send_stream_id, recv_stream_id);
        self.session.topology = topology;
        info!(
            "Binding relayed data channels (send {}, recv {})",
            send_stream_id, recv_stream_id
        );
        if let Err(e) = media.create_data_channels(&topology.bindings()).await {
            error!("Failed to create data channels: {}", e);
        }
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let policy = CandidatePolicy::from_force_turn(self.settings.get().webrtc.force_turn);
        if !policy.admits(&candidate) {
            debug_throttled!(
                self.throttler,
                "remote_candidate_dropped",
                "Dropping remote candidate: {}",
                candidate.candidate
            );
            return;
        }

        match self.media.clone() {
            Some(media) if self.session.remote_applied() => {
                self.add_remote_candidate(&media, candidate).await;
            }
            _ => self.session.pending_candidates.push(candidate),
        }
    }

    async fn flush_pending_candidates(&mut self) {
        let Some(media) = self.media.clone() else {
            return;
        };
        for candidate in std::mem::take(&mut self.session.pending_candidates) {
            self.add_remote_candidate(&media, candidate).await;
        }
    }

    async fn add_remote_candidate(&self, media: &Arc<dyn MediaSession>, candidate: IceCandidate) {
        match media.add_ice_candidate(candidate).await {
            // Re-arm the warning once candidates apply again
            Ok(()) => self.throttler.clear("add_candidate"),
            Err(e) => {
                warn_throttled!(self.throttler, "add_candidate", "Failed to add candidate: {}", e);
            }
        }
    }

    fn maybe_connected(&mut self) {
        let committed = self.session.negotiation.as_ref().is_some_and(|n| n.committed);
        if !committed || !self.session.ice_established || self.session.connected_emitted {
            return;
        }

        self.session.connected_emitted = true;
        self.session.connected_at = Some(Utc::now());
        self.stats.reset();
        self.set_state(SessionState::Connected);
        self.start_stats_timer();
        self.inputs.apply(&self.settings.get().input);
        info!("Media connected");
        self.emit(SessionEvent::Connected);
    }

    // ------------------------------------------------------------------
    // Peer callbacks
    // ------------------------------------------------------------------

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let policy = CandidatePolicy::from_force_turn(self.settings.get().webrtc.force_turn);
                if policy.admits(&candidate) {
                    self.send(OutboundMessage::IceCandidate { candidate }).await;
                } else {
                    debug_throttled!(
                        self.throttler,
                        "local_candidate_dropped",
                        "Not sending local candidate: {}",
                        candidate.candidate
                    );
                }
            }
            PeerEvent::IceConnectionState(state) => {
                info!("ICE connection state: {}", state);
                if state.is_established() {
                    self.session.ice_established = true;
                    self.maybe_connected();
                } else if state == crate::webrtc::IceConnectionState::Failed {
                    self.session.ice_established = false;
                    self.emit(SessionEvent::WebRtcFailed);
                }
            }
            PeerEvent::ConnectionFailed => self.emit(SessionEvent::WebRtcFailed),
            PeerEvent::DataChannelOpen { label } => {
                if self.session.topology.is_unidirectional() && label == RECV_DATACHANNEL_LABEL {
                    self.send(OutboundMessage::PeerDataChannelsReady).await;
                }
                self.emit(SessionEvent::DataChannelOpen { label });
            }
            PeerEvent::DataChannelClose { label } => {
                self.emit(SessionEvent::DataChannelClose { label });
            }
            PeerEvent::DataChannelMessage { label, data } => {
                if self.session.topology.is_unidirectional() && label != RECV_DATACHANNEL_LABEL {
                    debug!("Ignoring message on send-only channel {}", label);
                    return;
                }
                self.handle_streamer_data(&data).await;
            }
            PeerEvent::Track { kind } => debug!("Receiving {} track", kind),
        }
    }

    async fn handle_streamer_data(&mut self, data: &[u8]) {
        let message = match self.protocol.decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn_throttled!(self.throttler, "decode", "Undecodable streamer message: {}", e);
                return;
            }
        };

        match message.kind {
            FromStreamerMessage::Protocol => {
                match self.protocol.apply_protocol_json(&message.text()) {
                    Ok(update) => {
                        info!(
                            "Protocol updated ({:?}: {} updated, {} skipped)",
                            update.direction, update.updated, update.skipped
                        );
                        for kind in [
                            ToStreamerMessage::RequestInitialSettings,
                            ToStreamerMessage::RequestQualityControl,
                        ] {
                            if let Err(e) = self.send_to_streamer(kind, &[]).await {
                                warn!("Failed to send {}: {}", kind.name(), e);
                            }
                        }
                    }
                    Err(e) => error!("Invalid protocol message: {}", e),
                }
            }
            FromStreamerMessage::VideoEncoderAvgQP => match message.text().trim().parse::<i32>() {
                Ok(qp) => {
                    self.session.avg_qp = qp;
                    self.emit(SessionEvent::VideoEncoderAvgQp { qp });
                }
                Err(_) => warn!("Invalid encoder QP: {}", message.text()),
            },
            FromStreamerMessage::InitialSettings => {
                match serde_json::from_str::<serde_json::Value>(&message.text()) {
                    Ok(settings) => self.emit(SessionEvent::InitialSettings { settings }),
                    Err(e) => warn!("Invalid initial settings: {}", e),
                }
            }
            FromStreamerMessage::InputControlOwnership => {
                self.session.controls_stream_input = message.flag();
                self.emit(SessionEvent::StreamerMessage {
                    name: message.kind.name().to_string(),
                    payload: message.flag().unwrap_or_default().to_string(),
                });
            }
            FromStreamerMessage::QualityControlOwnership => {
                self.emit(SessionEvent::StreamerMessage {
                    name: message.kind.name().to_string(),
                    payload: message.flag().unwrap_or_default().to_string(),
                });
            }
            kind => self.emit(SessionEvent::StreamerMessage {
                name: kind.name().to_string(),
                payload: message.text(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Timers and stats
    // ------------------------------------------------------------------

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Reconnect => {
                self.session.reconnect_attempt += 1;
                self.session.force_reconnect = false;
                info!("Reconnecting (attempt {})", self.session.reconnect_attempt);
                self.set_state(SessionState::Reconnecting);
                self.emit(SessionEvent::AutoConnect);
                self.start_connect().await;
            }
            TimerKind::StreamerRequery => self.send(OutboundMessage::ListStreamers).await,
            TimerKind::KeepaliveTimeout => {
                if let Some(transport) = self.transport.clone() {
                    transport.close(CLOSE_NORMAL, "Keepalive timeout").await;
                }
                self.on_signalling_close(CLOSE_ABNORMAL, "Keepalive timeout".to_string())
                    .await;
            }
        }
    }

    fn start_stats_timer(&mut self) {
        self.stop_stats_timer();
        let token = self.timers.child_token();
        let task_token = token.clone();
        let inbox = self.inbox_tx.clone();
        let generation = self.session.generation;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + STATS_INTERVAL, STATS_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if inbox.send(ControllerInput::StatsTick { generation }).is_err() {
                            break;
                        }
                    }
                    _ = task_token.cancelled() => break,
                }
            }
        });
        self.stats_timer = Some(token);
    }

    fn stop_stats_timer(&mut self) {
        if let Some(token) = self.stats_timer.take() {
            token.cancel();
        }
    }

    async fn on_stats_tick(&mut self) {
        if self.state != SessionState::Connected {
            return;
        }
        let Some(media) = self.media.clone() else {
            return;
        };
        let raw = match media.stats().await {
            Ok(raw) => raw,
            Err(e) => {
                warn_throttled!(self.throttler, "stats", "Failed to collect stats: {}", e);
                return;
            }
        };

        let info = SessionInfo {
            connected_at: self.session.connected_at.unwrap_or_else(Utc::now),
            controls_stream_input: self.session.controls_stream_input,
            avg_qp: self.session.avg_qp,
        };
        let report = self.stats.process(&raw, info);

        if let Some(ref codec) = report.view.video_codec {
            self.reselect_codec_from_stats(codec).await;
        }

        self.emit(SessionEvent::StatsTick {
            stats: Box::new(report.view),
        });
        self.emit(SessionEvent::LatencyCalculated {
            latency: report.latency,
        });
    }

    async fn reselect_codec_from_stats(&mut self, in_use: &str) {
        if !self.session.auto_update_codec {
            return;
        }
        let config = self.settings.get();
        let preference = &config.webrtc.preferred_codec;
        let Some(selected) = reselect_codec(in_use, &preference.options) else {
            return;
        };
        self.session.codec_reselected = true;
        if selected == preference.selected {
            return;
        }
        info!("Codec in use is {}, updating preference", selected);
        self.set_preferred_codec(selected).await;
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn apply_url_overrides(&mut self) {
        let config = self.settings.get();
        if !config.signalling.use_url_params {
            return;
        }
        let url = config.signalling.url.clone();
        if let Err(e) = self
            .settings
            .update("url_params", |c| {
                let applied = overrides::apply_url_params(c, &url);
                debug!("Applied {} settings from the signalling URL", applied);
            })
            .await
        {
            warn!("Failed to apply URL settings: {}", e);
        }
    }

    async fn teardown_media(&mut self) {
        self.stop_stats_timer();
        self.inputs.disable_all();
        if let Some(media) = self.media.take() {
            // Late callbacks from the closed peer become stale
            self.peer_seq += 1;
            if let Err(e) = media.close().await {
                warn!("Failed to close peer connection: {}", e);
            }
        }
        self.session.reset_media();
        self.stats.reset();
    }

    fn stop_keepalive(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
    }

    /// Cancel scheduled work and start a fresh token
    fn cancel_timers(&mut self) {
        self.timers.cancel();
        self.timers = CancellationToken::new();
        self.stats_timer = None;
    }

    fn schedule(&self, delay: Duration, input: ControllerInput) {
        let token = self.timers.clone();
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = inbox.send(input);
                }
                _ = token.cancelled() => {}
            }
        });
    }

    async fn send(&self, message: OutboundMessage) {
        let Some(ref transport) = self.transport else {
            debug!("Not connected, dropping {:?}", message);
            return;
        };
        if let Err(e) = transport.send(message).await {
            warn!("Failed to send signalling message: {}", e);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        info!("Session state: {} -> {}", self.state, state);
        self.state = state;
        self.emit(SessionEvent::StateChanged {
            state: self.state.to_string(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        self.events.publish(event);
    }

    /// Handle everything queued, letting spawned tasks run in between
    #[cfg(test)]
    #[cfg(test)]
    pub(crate) fn throttler(&self) -> &LogThrottler {
        &self.throttler
    }

    pub(crate) async fn drain(&mut self) {
        loop {
            for _ in 0..32 {
                tokio::task::yield_now().await;
            }
            let next = self.inbox_rx.as_mut().and_then(|rx| rx.try_recv().ok());
            match next {
                Some(input) => self.step(input).await,
                None => return,
            }
        }
    }
}

/// Cloneable handle for the host
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    inbox: mpsc::UnboundedSender<ControllerInput>,
    events: Arc<EventBus>,
    settings: SettingsStore,
    shutdown: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    fn command(&self, command: Command) -> Result<()> {
        self.inbox
            .send(ControllerInput::Command(command))
            .map_err(|_| AppError::SessionClosed)
    }

    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    pub fn reconnect(&self, message: Option<String>) -> Result<()> {
        self.command(Command::Reconnect { message })
    }

    pub fn close(&self) -> Result<()> {
        self.command(Command::Close)
    }

    pub fn select_streamer(&self, id: impl Into<String>) -> Result<()> {
        self.command(Command::SelectStreamer(id.into()))
    }

    pub fn set_preferred_codec(&self, codec: impl Into<String>) -> Result<()> {
        self.command(Command::SetPreferredCodec(codec.into()))
    }

    /// Encode and send a message over the data channel
    pub async fn send_to_streamer(
        &self,
        kind: ToStreamerMessage,
        values: Vec<FieldValue>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::SendToStreamer {
            kind,
            values,
            reply,
        })?;
        rx.await.map_err(|_| AppError::SessionClosed)?
    }

    pub async fn state(&self) -> Result<SessionState> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::GetState { reply })?;
        rx.await.map_err(|_| AppError::SessionClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn register_observer(&self, observer: Arc<dyn SessionObserver>) -> ObserverId {
        self.events.observers().register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.events.observers().unregister(id)
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    /// Stop the controller task
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
