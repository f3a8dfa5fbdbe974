//! Pairing state machine
//!
//! [`PairingMachine`] is pure: it takes an input, moves to the next state and
//! returns the side effects the device has to carry out. Timers, packets and
//! certificate pins are all performed by the caller.
//!
//! ## Simultaneous requests
//!
//! When both sides request pairing at the same time, each receives the
//! other's `pair: true` while in `RequestedByMe` and treats it as the answer.
//! A `pair: true` arriving while already `Paired` is ignored, so no side
//! echoes another request and both converge on `Paired` after exactly one
//! request packet each.

use crate::packet::PACKET_TYPE_PAIR;
use crate::{Packet, ProtocolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// How long a pairing request stays open
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Pairing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    /// Not paired
    NotPaired,
    /// Pairing request received, awaiting the local user's decision
    RequestedByPeer,
    /// Pairing request sent, awaiting the peer's answer
    RequestedByMe,
    /// Successfully paired; the peer certificate is pinned
    Paired,
}

impl fmt::Display for PairingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PairingStatus::NotPaired => "not paired",
            PairingStatus::RequestedByPeer => "requested by peer",
            PairingStatus::RequestedByMe => "requested",
            PairingStatus::Paired => "paired",
        };
        f.write_str(text)
    }
}

/// Why a pairing attempt ended without pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingFailure {
    /// The other side said no
    Rejected,
    /// Nobody answered within the pairing timeout
    TimedOut,
}

impl fmt::Display for PairingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingFailure::Rejected => f.write_str("rejected"),
            PairingFailure::TimedOut => f.write_str("timed out"),
        }
    }
}

/// Pairing tuning
#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// How long a request waits for an answer
    pub timeout: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            timeout: PAIRING_TIMEOUT,
        }
    }
}

/// Something that happened to the pairing of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingInput {
    /// The local user asked to pair
    LocalRequest,
    /// The local user accepted the peer's request
    LocalAccept,
    /// The local user rejected the peer's request
    LocalReject,
    /// The local user asked to unpair
    LocalUnpair,
    /// The peer sent `kdeconnect.pair` with this value
    PeerPair(bool),
    /// The pairing timer fired
    Timeout,
    /// The peer presented a certificate other than the pinned one
    TrustViolation,
}

impl PairingInput {
    /// Inputs that can only be applied while a link is attached
    pub fn needs_link(self) -> bool {
        matches!(
            self,
            PairingInput::LocalRequest
                | PairingInput::LocalAccept
                | PairingInput::LocalReject
                | PairingInput::PeerPair(true)
        )
    }
}

/// Side effect the device must carry out after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingAction {
    /// Send `kdeconnect.pair` with this value
    SendPair(bool),
    /// Start the pairing timer
    StartTimer,
    /// Cancel any running pairing timer
    CancelTimer,
    /// Pin the certificate of the current link
    PinCertificate,
    /// Forget the pinned certificate
    UnpinCertificate,
    /// Ask the user to accept or reject
    NotifyRequested,
    /// Tell the user a pairing attempt failed
    NotifyFailed(PairingFailure),
}

/// Build a `kdeconnect.pair` packet
pub fn pair_packet(pair: bool) -> Packet {
    Packet::new(PACKET_TYPE_PAIR, json!({ "pair": pair }))
}

/// Pairing state of one device
#[derive(Debug, Clone)]
pub struct PairingMachine {
    status: PairingStatus,
}

impl PairingMachine {
    pub fn new(status: PairingStatus) -> Self {
        Self { status }
    }

    pub fn status(&self) -> PairingStatus {
        self.status
    }

    /// Apply an input
    ///
    /// Returns the actions to perform, in order. Accepting or rejecting when
    /// no request is pending is an error; every other input is accepted and
    /// may produce no actions at all.
    pub fn handle(&mut self, input: PairingInput) -> Result<Vec<PairingAction>> {
        use PairingAction::*;
        use PairingInput::*;
        use PairingStatus::*;

        let (next, actions) = match (self.status, input) {
            (_, TrustViolation) => (NotPaired, vec![CancelTimer, UnpinCertificate]),

            (NotPaired, LocalRequest) => (RequestedByMe, vec![SendPair(true), StartTimer]),
            (NotPaired, PeerPair(true)) => (RequestedByPeer, vec![StartTimer, NotifyRequested]),
            (NotPaired, LocalAccept | LocalReject) | (RequestedByMe, LocalAccept | LocalReject) => {
                return Err(ProtocolError::InvalidPairingState(format!(
                    "no pairing request to answer while {}",
                    self.status
                )))
            }
            (NotPaired, _) => (NotPaired, vec![]),

            (RequestedByMe, PeerPair(true)) => (Paired, vec![CancelTimer, PinCertificate]),
            (RequestedByMe, PeerPair(false)) => (
                NotPaired,
                vec![CancelTimer, NotifyFailed(PairingFailure::Rejected)],
            ),
            (RequestedByMe, Timeout) => {
                (NotPaired, vec![NotifyFailed(PairingFailure::TimedOut)])
            }
            (RequestedByMe, LocalUnpair) => (NotPaired, vec![CancelTimer, SendPair(false)]),
            (RequestedByMe, LocalRequest) => (RequestedByMe, vec![]),

            (RequestedByPeer, LocalAccept | LocalRequest) => (
                Paired,
                vec![CancelTimer, PinCertificate, SendPair(true)],
            ),
            (RequestedByPeer, LocalReject | LocalUnpair) => {
                (NotPaired, vec![CancelTimer, SendPair(false)])
            }
            (RequestedByPeer, PeerPair(false)) => (NotPaired, vec![CancelTimer]),
            (RequestedByPeer, Timeout) => {
                (NotPaired, vec![NotifyFailed(PairingFailure::TimedOut)])
            }
            (RequestedByPeer, PeerPair(true)) => (RequestedByPeer, vec![]),

            (Paired, LocalUnpair) => (NotPaired, vec![UnpinCertificate, SendPair(false)]),
            (Paired, PeerPair(false)) => (NotPaired, vec![UnpinCertificate]),
            (Paired, LocalAccept | LocalReject) => {
                return Err(ProtocolError::InvalidPairingState(
                    "device is already paired".to_string(),
                ))
            }
            (Paired, _) => (Paired, vec![]),
        };

        self.status = next;
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::PairingAction::*;
    use super::PairingInput::*;
    use super::PairingStatus::*;
    use super::*;

    fn machine(status: PairingStatus) -> PairingMachine {
        PairingMachine::new(status)
    }

    #[test]
    fn test_local_request_then_peer_accepts() {
        let mut m = machine(NotPaired);

        assert_eq!(m.handle(LocalRequest).unwrap(), vec![SendPair(true), StartTimer]);
        assert_eq!(m.status(), RequestedByMe);

        assert_eq!(m.handle(PeerPair(true)).unwrap(), vec![CancelTimer, PinCertificate]);
        assert_eq!(m.status(), Paired);
    }

    #[test]
    fn test_inputs_that_need_a_link() {
        for input in [LocalRequest, LocalAccept, LocalReject, PeerPair(true)] {
            assert!(input.needs_link(), "{:?}", input);
        }
        for input in [LocalUnpair, PeerPair(false), Timeout, TrustViolation] {
            assert!(!input.needs_link(), "{:?}", input);
        }
    }

    #[test]
    fn test_local_request_rejected_by_peer() {
        let mut m = machine(NotPaired);
        m.handle(LocalRequest).unwrap();

        let actions = m.handle(PeerPair(false)).unwrap();
        assert!(actions.contains(&NotifyFailed(PairingFailure::Rejected)));
        assert_eq!(m.status(), NotPaired);
    }

    #[test]
    fn test_peer_request_is_never_auto_accepted() {
        let mut m = machine(NotPaired);

        let actions = m.handle(PeerPair(true)).unwrap();
        assert_eq!(actions, vec![StartTimer, NotifyRequested]);
        assert!(!actions.iter().any(|a| matches!(a, SendPair(_))));
        assert_eq!(m.status(), RequestedByPeer);

        // a repeated request changes nothing
        assert!(m.handle(PeerPair(true)).unwrap().is_empty());
        assert_eq!(m.status(), RequestedByPeer);
    }

    #[test]
    fn test_local_accept_pins_and_answers() {
        let mut m = machine(RequestedByPeer);

        assert_eq!(
            m.handle(LocalAccept).unwrap(),
            vec![CancelTimer, PinCertificate, SendPair(true)]
        );
        assert_eq!(m.status(), Paired);
    }

    #[test]
    fn test_local_reject() {
        let mut m = machine(RequestedByPeer);

        assert_eq!(m.handle(LocalReject).unwrap(), vec![CancelTimer, SendPair(false)]);
        assert_eq!(m.status(), NotPaired);
    }

    #[test]
    fn test_every_request_state_times_out() {
        for status in [RequestedByMe, RequestedByPeer] {
            let mut m = machine(status);
            let actions = m.handle(Timeout).unwrap();

            assert_eq!(actions, vec![NotifyFailed(PairingFailure::TimedOut)]);
            assert_eq!(m.status(), NotPaired);
        }
    }

    #[test]
    fn test_stale_timeout_is_ignored() {
        for status in [NotPaired, Paired] {
            let mut m = machine(status);
            assert!(m.handle(Timeout).unwrap().is_empty());
            assert_eq!(m.status(), status);
        }
    }

    #[test]
    fn test_unpair_from_either_side() {
        let mut m = machine(Paired);
        assert_eq!(m.handle(LocalUnpair).unwrap(), vec![UnpinCertificate, SendPair(false)]);
        assert_eq!(m.status(), NotPaired);

        let mut m = machine(Paired);
        assert_eq!(m.handle(PeerPair(false)).unwrap(), vec![UnpinCertificate]);
        assert_eq!(m.status(), NotPaired);
    }

    #[test]
    fn test_request_while_paired_is_not_echoed() {
        let mut m = machine(Paired);

        assert!(m.handle(PeerPair(true)).unwrap().is_empty());
        assert!(m.handle(LocalRequest).unwrap().is_empty());
        assert_eq!(m.status(), Paired);
    }

    #[test]
    fn test_trust_violation_from_any_state() {
        for status in [NotPaired, RequestedByMe, RequestedByPeer, Paired] {
            let mut m = machine(status);
            let actions = m.handle(TrustViolation).unwrap();

            assert!(actions.contains(&UnpinCertificate));
            assert_eq!(m.status(), NotPaired);
        }
    }

    #[test]
    fn test_answering_without_request_is_an_error() {
        for status in [NotPaired, RequestedByMe, Paired] {
            let mut m = machine(status);
            assert!(m.handle(LocalAccept).is_err());
            assert!(m.handle(LocalReject).is_err());
            assert_eq!(m.status(), status);
        }
    }

    #[test]
    fn test_simultaneous_requests_converge() {
        let mut alpha = machine(NotPaired);
        let mut beta = machine(NotPaired);

        let from_alpha = alpha.handle(LocalRequest).unwrap();
        let from_beta = beta.handle(LocalRequest).unwrap();
        assert_eq!(from_alpha, vec![SendPair(true), StartTimer]);
        assert_eq!(from_beta, vec![SendPair(true), StartTimer]);

        // each side receives the other's request
        let alpha_reply = alpha.handle(PeerPair(true)).unwrap();
        let beta_reply = beta.handle(PeerPair(true)).unwrap();

        assert_eq!(alpha.status(), Paired);
        assert_eq!(beta.status(), Paired);
        assert!(!alpha_reply.iter().any(|a| matches!(a, SendPair(_))));
        assert!(!beta_reply.iter().any(|a| matches!(a, SendPair(_))));
    }

    /// Deliver every `SendPair` produced by one side to the other until
    /// neither side has anything left to send
    fn run_exchange(
        a: &mut PairingMachine,
        b: &mut PairingMachine,
        first: (bool, Vec<PairingAction>),
    ) -> usize {
        let mut pending = vec![first];
        let mut delivered = 0;

        while let Some((from_a, actions)) = pending.pop() {
            for action in actions {
                if let SendPair(value) = action {
                    delivered += 1;
                    let target = if from_a { &mut *b } else { &mut *a };
                    let reply = target.handle(PeerPair(value)).unwrap();
                    pending.push((!from_a, reply));
                }
            }
        }
        delivered
    }

    #[test]
    fn test_request_accept_sequences_settle() {
        for accept in [true, false] {
            let mut a = machine(NotPaired);
            let mut b = machine(NotPaired);

            let request = a.handle(LocalRequest).unwrap();
            run_exchange(&mut a, &mut b, (true, request));
            assert_eq!(b.status(), RequestedByPeer);

            let answer = if accept {
                b.handle(LocalAccept).unwrap()
            } else {
                b.handle(LocalReject).unwrap()
            };
            let sent = run_exchange(&mut a, &mut b, (false, answer));

            assert_eq!(sent, 1);
            let expected = if accept { Paired } else { NotPaired };
            assert_eq!(a.status(), expected);
            assert_eq!(b.status(), expected);
        }
    }

    #[test]
    fn test_pair_packet() {
        let packet = pair_packet(true);
        assert_eq!(packet.packet_type, "kdeconnect.pair");
        assert_eq!(packet.body, json!({"pair": true}));
    }
}
