//! Signaling state machine
//!
//! Tracks one negotiation session from peer readiness to a connected media
//! transport. Pure state: the caller sends messages and drives the backend
//! with what each transition returns.

use super::WebRTCError;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Time allowed from peer readiness to a connected transport
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

/// SDP blob as exchanged on the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate as exchanged on the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    AwaitingPeerReady,
    Offering,
    AwaitingAnswer,
    Connected,
    Failed,
}

impl SignalingState {
    /// Between session creation and a terminal state
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            SignalingState::AwaitingPeerReady | SignalingState::Offering | SignalingState::AwaitingAnswer
        )
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State of the exchange with one peer
#[derive(Debug, Clone)]
pub struct NegotiationSession {
    pub id: u64,
    pub peer_id: Option<String>,
    pub local_description: Option<SessionDescription>,
    pub remote_description: Option<SessionDescription>,
    pub pending_candidates: Vec<IceCandidate>,
    pub deadline: Instant,
    remote_applied: bool,
    transport_connected: bool,
}

impl NegotiationSession {
    fn new(id: u64, peer_id: Option<String>, deadline: Instant) -> Self {
        Self {
            id,
            peer_id,
            local_description: None,
            remote_description: None,
            pending_candidates: Vec::new(),
            deadline,
            remote_applied: false,
            transport_connected: false,
        }
    }
}

/// What the caller must do after a `peer.ready`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyAction {
    /// Open a backend towards `peer_id`; `replaced` means a stale session was discarded
    Open { peer_id: String, replaced: bool },
    /// Nothing to do
    Ignore,
}

pub struct SignalingStateMachine {
    state: SignalingState,
    session: Option<NegotiationSession>,
    timeout: Duration,
    next_id: u64,
}

impl SignalingStateMachine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: SignalingState::Idle,
            session: None,
            timeout,
            next_id: 1,
        }
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn session(&self) -> Option<&NegotiationSession> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.peer_id.as_deref())
    }

    /// Deadline of the in-flight session
    pub fn deadline(&self) -> Option<Instant> {
        if self.state.is_in_flight() {
            self.session.as_ref().map(|s| s.deadline)
        } else {
            None
        }
    }

    /// Open a session that waits for a peer, discarding any previous one
    pub fn begin(&mut self, now: Instant) -> u64 {
        self.open_session(None, now)
    }

    pub fn on_peer_ready(&mut self, peer_id: &str, now: Instant) -> ReadyAction {
        match self.state {
            SignalingState::Connected => {
                debug!("peer.ready from {} ignored, already connected", peer_id);
                ReadyAction::Ignore
            }
            SignalingState::AwaitingPeerReady if self.peer_id().is_none() => {
                if let Some(session) = self.session.as_mut() {
                    session.peer_id = Some(peer_id.to_string());
                    info!("Negotiation session {} bound to peer {}", session.id, peer_id);
                }
                ReadyAction::Open {
                    peer_id: peer_id.to_string(),
                    replaced: false,
                }
            }
            state => {
                let replaced = state.is_in_flight();
                if replaced {
                    warn!("peer.ready from {} while {} in flight, discarding stale session", peer_id, state);
                }
                self.open_session(Some(peer_id.to_string()), now);
                ReadyAction::Open {
                    peer_id: peer_id.to_string(),
                    replaced,
                }
            }
        }
    }

    /// Local offer is ready; returns (target peer, offer to send)
    pub fn on_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(String, SessionDescription), WebRTCError> {
        self.expect_state(SignalingState::AwaitingPeerReady, "local description")?;
        let session = self.session_mut()?;
        let peer_id = session
            .peer_id
            .clone()
            .ok_or_else(|| WebRTCError::InvalidState("local description before peer bound".to_string()))?;
        session.local_description = Some(description.clone());
        self.state = SignalingState::Offering;
        Ok((peer_id, description))
    }

    /// Remote answer arrived; returns the description to apply
    pub fn on_remote_answer(&mut self, description: SessionDescription) -> Result<SessionDescription, WebRTCError> {
        self.expect_state(SignalingState::Offering, "remote answer")?;
        if description.kind != "answer" {
            return Err(WebRTCError::SdpError(format!("expected answer, got {}", description.kind)));
        }
        self.session_mut()?.remote_description = Some(description.clone());
        self.state = SignalingState::AwaitingAnswer;
        Ok(description)
    }

    /// Remote description applied; returns queued candidates in arrival order
    pub fn on_remote_description_applied(&mut self) -> Result<Vec<IceCandidate>, WebRTCError> {
        self.expect_state(SignalingState::AwaitingAnswer, "answer applied")?;
        let session = self.session_mut()?;
        session.remote_applied = true;
        let replay = std::mem::take(&mut session.pending_candidates);
        let connected = session.transport_connected;
        if connected {
            self.mark_connected();
        }
        Ok(replay)
    }

    /// Remote candidate; returned when it can be applied now, queued otherwise
    pub fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if !self.state.is_in_flight() && self.state != SignalingState::Connected {
            debug!("Candidate dropped in state {}", self.state);
            return None;
        }
        let session = self.session.as_mut()?;
        if session.remote_applied {
            Some(candidate)
        } else {
            session.pending_candidates.push(candidate);
            None
        }
    }

    /// Media transport reported connected; true on the transition to Connected
    pub fn on_transport_connected(&mut self) -> bool {
        if !self.state.is_in_flight() {
            return false;
        }
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        session.transport_connected = true;
        if session.remote_applied {
            self.mark_connected();
            return true;
        }
        false
    }

    /// Move to Failed. True only for the first failure of a live session.
    pub fn fail(&mut self, reason: &str) -> bool {
        if !self.state.is_in_flight() && self.state != SignalingState::Connected {
            return false;
        }
        warn!(
            "Negotiation session {:?} failed in {}: {}",
            self.session_id(),
            self.state,
            reason
        );
        self.state = SignalingState::Failed;
        true
    }

    /// Deadline timer fired for `session_id`. True when it failed the session.
    pub fn on_deadline(&mut self, session_id: u64, now: Instant) -> bool {
        if self.session_id() != Some(session_id) || !self.state.is_in_flight() {
            return false;
        }
        match self.deadline() {
            Some(deadline) if now >= deadline => self.fail("negotiation timed out"),
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        self.state = SignalingState::Idle;
        self.session = None;
    }

    fn open_session(&mut self, peer_id: Option<String>, now: Instant) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.session = Some(NegotiationSession::new(id, peer_id, now + self.timeout));
        self.state = SignalingState::AwaitingPeerReady;
        debug!("Negotiation session {} opened", id);
        id
    }

    fn mark_connected(&mut self) {
        self.state = SignalingState::Connected;
        if let Some(session) = &self.session {
            info!("Negotiation session {} connected", session.id);
        }
    }

    fn expect_state(&self, expected: SignalingState, event: &str) -> Result<(), WebRTCError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(WebRTCError::InvalidState(format!("{} in state {}", event, self.state)))
        }
    }

    fn session_mut(&mut self) -> Result<&mut NegotiationSession, WebRTCError> {
        self.session
            .as_mut()
            .ok_or_else(|| WebRTCError::InvalidState("no negotiation session".to_string()))
    }
}

impl Default for SignalingStateMachine {
    fn default() -> Self {
        Self::new(NEGOTIATION_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u8) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{}", n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn offering(now: Instant) -> SignalingStateMachine {
        let mut sm = SignalingStateMachine::default();
        sm.begin(now);
        sm.on_peer_ready("viewer", now);
        sm.on_local_description(SessionDescription::offer("o")).expect("offer");
        sm
    }

    #[test]
    fn full_exchange_reaches_connected() {
        let now = Instant::now();
        let mut sm = SignalingStateMachine::default();
        assert_eq!(
            sm.on_peer_ready("viewer", now),
            ReadyAction::Open {
                peer_id: "viewer".to_string(),
                replaced: false
            }
        );
        assert_eq!(sm.state(), SignalingState::AwaitingPeerReady);

        let (target, offer) = sm.on_local_description(SessionDescription::offer("o")).expect("offer");
        assert_eq!(target, "viewer");
        assert_eq!(offer.kind, "offer");
        assert_eq!(sm.state(), SignalingState::Offering);

        sm.on_remote_answer(SessionDescription::answer("a")).expect("answer");
        assert_eq!(sm.state(), SignalingState::AwaitingAnswer);
        assert!(sm.on_remote_description_applied().expect("applied").is_empty());
        assert!(sm.on_transport_connected());
        assert_eq!(sm.state(), SignalingState::Connected);
        assert!(sm.deadline().is_none());
    }

    #[test]
    fn early_candidates_are_replayed_in_order() {
        let now = Instant::now();
        let mut sm = offering(now);
        assert!(sm.on_remote_candidate(candidate(1)).is_none());
        assert!(sm.on_remote_candidate(candidate(2)).is_none());
        sm.on_remote_answer(SessionDescription::answer("a")).expect("answer");
        assert!(sm.on_remote_candidate(candidate(3)).is_none());

        let replay = sm.on_remote_description_applied().expect("applied");
        assert_eq!(replay, vec![candidate(1), candidate(2), candidate(3)]);
        assert_eq!(sm.on_remote_candidate(candidate(4)), Some(candidate(4)));
    }

    #[test]
    fn transport_before_answer_waits_for_apply() {
        let now = Instant::now();
        let mut sm = offering(now);
        sm.on_remote_answer(SessionDescription::answer("a")).expect("answer");
        assert!(!sm.on_transport_connected());
        sm.on_remote_description_applied().expect("applied");
        assert_eq!(sm.state(), SignalingState::Connected);
    }

    #[test]
    fn deadline_fails_exactly_once() {
        let now = Instant::now();
        let mut sm = SignalingStateMachine::default();
        let id = sm.begin(now);
        assert!(!sm.on_deadline(id, now + Duration::from_secs(9)));
        assert!(sm.on_deadline(id, now + NEGOTIATION_TIMEOUT));
        assert_eq!(sm.state(), SignalingState::Failed);
        assert!(!sm.on_deadline(id, now + Duration::from_secs(11)));
        assert!(!sm.fail("again"));
    }

    #[test]
    fn late_deadline_after_connect_is_noop() {
        let now = Instant::now();
        let mut sm = offering(now);
        let id = sm.session_id().expect("session");
        sm.on_remote_answer(SessionDescription::answer("a")).expect("answer");
        sm.on_remote_description_applied().expect("applied");
        sm.on_transport_connected();
        assert!(!sm.on_deadline(id, now + Duration::from_secs(30)));
        assert_eq!(sm.state(), SignalingState::Connected);
    }

    #[test]
    fn ready_binds_waiting_session_keeping_deadline() {
        let now = Instant::now();
        let mut sm = SignalingStateMachine::default();
        let id = sm.begin(now);
        let later = now + Duration::from_secs(4);
        sm.on_peer_ready("viewer", later);
        assert_eq!(sm.session_id(), Some(id));
        assert_eq!(sm.deadline(), Some(now + NEGOTIATION_TIMEOUT));
    }

    #[test]
    fn new_ready_discards_stale_session() {
        let now = Instant::now();
        let mut sm = offering(now);
        let stale = sm.session_id().expect("session");
        sm.on_remote_candidate(candidate(1));

        let later = now + Duration::from_secs(6);
        let action = sm.on_peer_ready("other", later);
        assert_eq!(
            action,
            ReadyAction::Open {
                peer_id: "other".to_string(),
                replaced: true
            }
        );
        assert_ne!(sm.session_id(), Some(stale));
        assert_eq!(sm.peer_id(), Some("other"));
        assert_eq!(sm.deadline(), Some(later + NEGOTIATION_TIMEOUT));
        assert!(sm.session().map(|s| s.pending_candidates.is_empty()).unwrap_or(false));
        // the stale session's timer is now a no-op
        assert!(!sm.on_deadline(stale, later + Duration::from_secs(20)));
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        let now = Instant::now();
        let mut sm = SignalingStateMachine::default();
        assert!(sm.on_remote_answer(SessionDescription::answer("a")).is_err());
        sm.begin(now);
        assert!(sm.on_local_description(SessionDescription::offer("o")).is_err());
        let mut sm = offering(now);
        assert!(sm.on_remote_answer(SessionDescription::offer("x")).is_err());
    }

    #[test]
    fn ready_while_connected_is_ignored() {
        let now = Instant::now();
        let mut sm = offering(now);
        sm.on_remote_answer(SessionDescription::answer("a")).expect("answer");
        sm.on_remote_description_applied().expect("applied");
        sm.on_transport_connected();
        assert_eq!(sm.on_peer_ready("late", now), ReadyAction::Ignore);
    }

    #[test]
    fn candidate_json_shape() {
        let json = serde_json::to_value(candidate(7)).expect("json");
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        let parsed: IceCandidate = serde_json::from_str(r#"{"candidate":"c"}"#).expect("parse");
        assert!(parsed.sdp_mid.is_none());
    }
}
