//! Peer Worker: drives one user's WebRTC peer connection through its
//! offer/answer/ICE lifecycle via the rtc message bus.

use std::sync::Arc;

use rivulet_protocol::{Config, IceCandidate, Message, SessionDescription};
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc_ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::session::SessionRegistry;
use crate::user::{SubStateValue, User};

#[derive(Debug, thiserror::Error)]
pub enum PeerSetupError {
    #[error("session no longer exists")]
    MissingSession,
    #[error("peer connection was not in the New state after construction")]
    NotNew,
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

/// Runs the whole lifetime of one user's peer connection: construction,
/// callback wiring, and the main select loop. `rtc_server_rx` is the
/// client-to-server lane of the user's rtc bus, handed off by whichever
/// caller constructed the `User` (the acceptor). Returns once either
/// substate is killed or construction fails.
pub async fn run(
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    user: Arc<User>,
    rtc_server_rx: mpsc::Receiver<Message>,
) {
    let built = match build_peer_connection(&config, &registry, &user).await {
        Ok(built) => built,
        Err(e) => {
            tracing::warn!(uid = %user.uid, session = user.session_id, "peer setup failed: {e}");
            user.state.rtc.set(SubStateValue::Done);
            return;
        }
    };

    wire_callbacks(Arc::clone(&user), &built);
    user.state.rtc.set(SubStateValue::AwaitingConnection);

    start_rtcp_reader(Arc::clone(&user), Arc::clone(&built.video_sender), "video");
    start_rtcp_reader(Arc::clone(&user), Arc::clone(&built.audio_sender), "audio");

    main_loop(Arc::clone(&user), built, rtc_server_rx).await;

    user.state.rtc.set(SubStateValue::Done);
    registry.sweep();
}

struct BuiltPeer {
    pc: Arc<RTCPeerConnection>,
    video_sender: Arc<RTCRtpSender>,
    audio_sender: Arc<RTCRtpSender>,
    current_offer: tokio::sync::Mutex<RTCSessionDescription>,
}

async fn build_peer_connection(
    config: &Config,
    registry: &SessionRegistry,
    user: &User,
) -> Result<BuiltPeer, PeerSetupError> {
    let mut setting_engine = SettingEngine::default();
    let range = config.server.ephemeral_udp_port_range;
    setting_engine.set_udp_network(UDPNetwork::Ephemeral(
        EphemeralUDP::new(range.min, range.max).map_err(webrtc::Error::from)?,
    ));
    if !config.server.nat_1to1_ips.is_empty() {
        setting_engine.set_nat_1to1_ips(
            config.server.nat_1to1_ips.clone(),
            RTCIceCandidateType::Host,
        );
    }
    setting_engine.set_lite(true);
    setting_engine.set_ice_timeouts(
        Some(user.timing.disconnect_timeout),
        Some(user.timing.failed_timeout),
        Some(user.timing.keepalive_interval),
    );

    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let mut registry_builder = Registry::new();
    registry_builder = register_default_interceptors(registry_builder, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_setting_engine(setting_engine)
        .with_interceptor_registry(registry_builder)
        .build();

    let rtc_config = RTCConfiguration {
        bundle_policy: RTCBundlePolicy::Balanced,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    };

    let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
    if pc.connection_state() != RTCPeerConnectionState::New {
        return Err(PeerSetupError::NotNew);
    }

    // Look up the session fresh rather than retaining any locally-built
    // track group: `SessionRegistry::get_or_create` is the single source of
    // truth for which track group a session keeps. See DESIGN.md.
    let session = registry
        .get(user.session_id)
        .ok_or(PeerSetupError::MissingSession)?;

    let video_sender = pc
        .add_track(Arc::clone(&session.tracks.video) as Arc<dyn TrackLocal + Send + Sync>)
        .await?;
    let audio_sender = pc
        .add_track(Arc::clone(&session.tracks.audio) as Arc<dyn TrackLocal + Send + Sync>)
        .await?;

    let offer = pc
        .create_offer(Some(RTCOfferOptions {
            voice_activity_detection: false,
            ice_restart: false,
        }))
        .await?;

    Ok(BuiltPeer {
        pc,
        video_sender,
        audio_sender,
        current_offer: tokio::sync::Mutex::new(offer),
    })
}

fn wire_callbacks(user: Arc<User>, built: &BuiltPeer) {
    let pc = Arc::clone(&built.pc);

    {
        let user = Arc::clone(&user);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let user = Arc::clone(&user);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let json = match candidate.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(uid = %user.uid, "failed to encode ice candidate: {e}");
                        return;
                    }
                };
                user.ws_bus
                    .send_to_client(Message::ice_candidate(&IceCandidate {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                        username_fragment: json.username_fragment,
                    }))
                    .await;
            })
        }));
    }

    let pc_for_state = Arc::clone(&built.pc);
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let user = Arc::clone(&user);
        let pc = Arc::clone(&pc_for_state);
        Box::pin(async move {
            tracing::info!(uid = %user.uid, session = user.session_id, ?state, "peer connection state changed");
            match state {
                RTCPeerConnectionState::Connected => {
                    user.state.rtc.set(SubStateValue::Connected);
                }
                RTCPeerConnectionState::Disconnected => {
                    if user.state.rtc.get() != SubStateValue::Connected
                        || pc.connection_state() == RTCPeerConnectionState::Closed
                    {
                        return;
                    }
                    user.state.rtc.set(SubStateValue::AwaitingConnection);
                    user.rtc_bus.send_to_server(Message::IceRestart).await;
                }
                RTCPeerConnectionState::Failed => {
                    user.rtc_bus
                        .send_to_server(Message::PcFailed(None))
                        .await;
                    user.state.rtc.kill();
                }
                _ => {}
            }
        })
    }));
}

fn start_rtcp_reader(user: Arc<User>, sender: Arc<RTCRtpSender>, kind: &'static str) {
    tokio::spawn(async move {
        while let Ok((packets, _attrs)) = sender.read_rtcp().await {
            if user.state.rtc.is_killed() {
                break;
            }
            for packet in &packets {
                log_unknown_rtcp(kind, packet.as_ref());
            }
        }
    });
}

/// Known RTCP types are drained silently to satisfy the underlying stack's
/// requirement that senders' RTCP streams not back up; only unrecognized
/// types are worth a log line.
fn log_unknown_rtcp(kind: &str, packet: &dyn rtcp::packet::Packet) {
    let any = packet.as_any();
    let known = any
        .downcast_ref::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
        .is_some()
        || any
            .downcast_ref::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
            .is_some()
        || any
            .downcast_ref::<rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate>()
            .is_some()
        || any
            .downcast_ref::<rtcp::receiver_report::ReceiverReport>()
            .is_some()
        || any
            .downcast_ref::<rtcp::sender_report::SenderReport>()
            .is_some()
        || any
            .downcast_ref::<rtcp::payload_feedbacks::slice_loss_indication::SliceLossIndication>()
            .is_some()
        || any
            .downcast_ref::<rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack>()
            .is_some();
    if !known {
        tracing::debug!(kind, "unrecognized rtcp packet type");
    }
}

async fn main_loop(user: Arc<User>, built: BuiltPeer, mut rtc_server_rx: mpsc::Receiver<Message>) {
    loop {
        tokio::select! {
            biased;
            _ = user.state.ws.killed() => break,
            _ = user.state.rtc.killed() => break,
            msg = rtc_server_rx.recv() => {
                let Some(msg) = msg else { break };
                handle_message(&user, &built, msg).await;
            }
        }
    }

    let _ = built.pc.close().await;
}

async fn handle_message(user: &Arc<User>, built: &BuiltPeer, msg: Message) {
    match msg {
        Message::StartRtc => {
            if built.pc.signaling_state() == webrtc::peer_connection::signaling_state::RTCSignalingState::HaveLocalOffer
                || user.state.rtc.get() == SubStateValue::Connected
            {
                return;
            }
            let offer = built.current_offer.lock().await.clone();
            if let Err(e) = built.pc.set_local_description(offer).await {
                send_pc_failed(user, &e.to_string()).await;
                return;
            }
            send_local_description_as_sdp(user, built).await;
        }
        Message::Sdp(_) => {
            // The signaling worker already validated this payload's shape
            // before forwarding it; a failure here means it raced a second,
            // independent parse and is logged, not surfaced as a pc failure.
            let sdp = match msg.parse_sdp() {
                Ok(sdp) => sdp,
                Err(e) => {
                    tracing::debug!(uid = %user.uid, "could not parse sdp payload: {e}");
                    return;
                }
            };
            let remote = match to_remote_description(sdp) {
                Ok(remote) => remote,
                Err(e) => {
                    send_pc_failed(user, &e.to_string()).await;
                    return;
                }
            };
            if let Err(e) = built.pc.set_remote_description(remote).await {
                send_pc_failed(user, &e.to_string()).await;
            }
        }
        Message::IceCandidate(_) => {
            let candidate = match msg.parse_ice_candidate() {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::debug!(uid = %user.uid, "could not parse icecandidate payload: {e}");
                    return;
                }
            };
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            };
            // Late candidates racing a torn-down connection are normal; only
            // log, never propagate.
            if let Err(e) = built.pc.add_ice_candidate(init).await {
                tracing::debug!(uid = %user.uid, "ignoring ice candidate add failure: {e}");
            }
        }
        Message::IceRestart => {
            let offer = built.current_offer.lock().await.clone();
            if let Err(e) = built.pc.set_local_description(offer).await {
                send_pc_failed(user, &e.to_string()).await;
                return;
            }
            send_local_description_as_sdp(user, built).await;
        }
        Message::PcFailed(_) => {
            // Self-dispatched by the state-change callback above; the kill
            // already happened there. Nothing further to do here.
        }
    }
}

async fn send_local_description_as_sdp(user: &Arc<User>, built: &BuiltPeer) {
    let Some(local) = built.pc.local_description().await else {
        send_pc_failed(user, "no local description after set_local_description").await;
        return;
    };
    user.ws_bus
        .send_to_client(Message::sdp(&SessionDescription {
            sdp_type: sdp_type_str(local.sdp_type).to_string(),
            sdp: local.sdp,
        }))
        .await;
}

async fn send_pc_failed(user: &Arc<User>, text: &str) {
    user.ws_bus
        .send_to_client(Message::PcFailed(Some(text.to_string())))
        .await;
}

fn to_remote_description(
    sdp: SessionDescription,
) -> Result<RTCSessionDescription, webrtc::Error> {
    match sdp.sdp_type.as_str() {
        "offer" => RTCSessionDescription::offer(sdp.sdp),
        "pranswer" => RTCSessionDescription::pranswer(sdp.sdp),
        _ => RTCSessionDescription::answer(sdp.sdp),
    }
}

fn sdp_type_str(sdp_type: RTCSdpType) -> &'static str {
    match sdp_type {
        RTCSdpType::Offer => "offer",
        RTCSdpType::Pranswer => "pranswer",
        RTCSdpType::Answer => "answer",
        RTCSdpType::Rollback => "rollback",
        RTCSdpType::Unspecified => "unspecified",
    }
}
