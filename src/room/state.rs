use std::collections::HashMap;

use crate::peer::RemoteStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Connecting,
    Connected,
    Muted,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub peer_id: String,
    pub username: String,
    pub phase: PeerPhase,
    /// Store stamp of the newest document applied to this peer.
    pub stamp: u64,
    /// Presence record the current call was placed for.
    pub record_id: Option<String>,
    /// Outbound call attempt; bumps each time a call is placed.
    pub generation: u64,
    pub stream: Option<RemoteStream>,
}

/// Notification fed into the tracker, tagged with its source.
#[derive(Debug, Clone)]
pub enum Signal {
    PresenceAdded {
        peer_id: String,
        username: String,
        record_id: String,
        stamp: u64,
    },
    PresenceRemoved {
        peer_id: String,
        record_id: String,
    },
    StopStream {
        peer_id: String,
        stamp: u64,
    },
    Disconnect {
        peer_id: String,
        stamp: u64,
    },
    StreamReceived {
        peer_id: String,
        generation: u64,
        stream: RemoteStream,
    },
    CallFailed {
        peer_id: String,
        generation: u64,
    },
}

/// Work the controller performs after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    PlaceCall { peer_id: String, generation: u64 },
    Render { peer_id: String },
    Hide { peer_id: String },
    Show { peer_id: String },
    Teardown { peer_id: String },
    Release { stream: RemoteStream },
}

/// Per-room view of every remote peer, driven by [`Signal`]s.
///
/// Ordering between the three feeds is resolved by the store stamp: a
/// document only changes a peer if it is newer than the last one applied.
#[derive(Debug)]
pub struct PresenceTracker {
    self_id: String,
    peers: HashMap<String, RemotePeer>,
}

impl PresenceTracker {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            peers: HashMap::new(),
        }
    }

    pub fn peer(&self, peer_id: &str) -> Option<&RemotePeer> {
        self.peers.get(peer_id)
    }

    /// Every known peer ordered by id, tombstones included.
    pub fn peers(&self) -> Vec<&RemotePeer> {
        let mut peers: Vec<_> = self.peers.values().collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn apply(&mut self, signal: Signal) -> Vec<Effect> {
        match signal {
            Signal::PresenceAdded {
                peer_id,
                username,
                record_id,
                stamp,
            } => self.presence_added(peer_id, username, record_id, stamp),
            Signal::PresenceRemoved { peer_id, record_id } => {
                self.presence_removed(&peer_id, &record_id)
            }
            Signal::StopStream { peer_id, stamp } => self.stop_stream(&peer_id, stamp),
            Signal::Disconnect { peer_id, stamp } => self.disconnect(peer_id, stamp),
            Signal::StreamReceived {
                peer_id,
                generation,
                stream,
            } => self.stream_received(&peer_id, generation, stream),
            Signal::CallFailed {
                peer_id,
                generation,
            } => self.call_failed(&peer_id, generation),
        }
    }

    fn presence_added(
        &mut self,
        peer_id: String,
        username: String,
        record_id: String,
        stamp: u64,
    ) -> Vec<Effect> {
        if peer_id == self.self_id {
            return Vec::new();
        }
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            tracing::debug!(peer = %peer_id, record = %record_id, "new peer in room");
            self.peers.insert(
                peer_id.clone(),
                RemotePeer {
                    peer_id: peer_id.clone(),
                    username,
                    phase: PeerPhase::Connecting,
                    stamp,
                    record_id: Some(record_id),
                    generation: 1,
                    stream: None,
                },
            );
            return vec![Effect::PlaceCall {
                peer_id,
                generation: 1,
            }];
        };
        if stamp <= peer.stamp {
            tracing::debug!(peer = %peer_id, record = %record_id, "ignoring stale presence");
            return Vec::new();
        }
        peer.stamp = stamp;
        peer.username = username;
        peer.record_id = Some(record_id);
        match peer.phase {
            PeerPhase::Connecting | PeerPhase::Connected => Vec::new(),
            PeerPhase::Muted => {
                peer.phase = PeerPhase::Connected;
                vec![Effect::Show { peer_id }]
            }
            PeerPhase::Disconnected => {
                peer.phase = PeerPhase::Connecting;
                peer.generation += 1;
                peer.stream = None;
                vec![Effect::PlaceCall {
                    peer_id,
                    generation: peer.generation,
                }]
            }
        }
    }

    fn presence_removed(&mut self, peer_id: &str, record_id: &str) -> Vec<Effect> {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return Vec::new();
        };
        let current = peer.record_id.as_deref() == Some(record_id);
        match peer.phase {
            PeerPhase::Connecting | PeerPhase::Connected if current => {
                peer.phase = PeerPhase::Disconnected;
                peer.stream = None;
                vec![Effect::Teardown {
                    peer_id: peer_id.to_string(),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn stop_stream(&mut self, peer_id: &str, stamp: u64) -> Vec<Effect> {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return Vec::new();
        };
        if peer.phase != PeerPhase::Connected || stamp <= peer.stamp {
            return Vec::new();
        }
        peer.phase = PeerPhase::Muted;
        peer.stamp = stamp;
        vec![Effect::Hide {
            peer_id: peer_id.to_string(),
        }]
    }

    fn disconnect(&mut self, peer_id: String, stamp: u64) -> Vec<Effect> {
        if peer_id == self.self_id {
            return Vec::new();
        }
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            tracing::debug!(peer = %peer_id, "disconnect before presence, keeping tombstone");
            self.peers.insert(
                peer_id.clone(),
                RemotePeer {
                    peer_id,
                    username: String::new(),
                    phase: PeerPhase::Disconnected,
                    stamp,
                    record_id: None,
                    generation: 0,
                    stream: None,
                },
            );
            return Vec::new();
        };
        if stamp <= peer.stamp {
            return Vec::new();
        }
        peer.stamp = stamp;
        if peer.phase == PeerPhase::Disconnected {
            return Vec::new();
        }
        peer.phase = PeerPhase::Disconnected;
        peer.stream = None;
        vec![Effect::Teardown { peer_id }]
    }

    fn stream_received(
        &mut self,
        peer_id: &str,
        generation: u64,
        stream: RemoteStream,
    ) -> Vec<Effect> {
        match self.peers.get_mut(peer_id) {
            Some(peer) if peer.phase == PeerPhase::Connecting && peer.generation == generation => {
                peer.phase = PeerPhase::Connected;
                peer.stream = Some(stream);
                vec![Effect::Render {
                    peer_id: peer_id.to_string(),
                }]
            }
            _ => {
                tracing::debug!(peer = %peer_id, generation, "releasing stale stream");
                vec![Effect::Release { stream }]
            }
        }
    }

    fn call_failed(&mut self, peer_id: &str, generation: u64) -> Vec<Effect> {
        match self.peers.get_mut(peer_id) {
            Some(peer) if peer.phase == PeerPhase::Connecting && peer.generation == generation => {
                peer.phase = PeerPhase::Disconnected;
                vec![Effect::Teardown {
                    peer_id: peer_id.to_string(),
                }]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn added(peer: &str, record: &str, stamp: u64) -> Signal {
        Signal::PresenceAdded {
            peer_id: peer.to_string(),
            username: format!("{}-name", peer),
            record_id: record.to_string(),
            stamp,
        }
    }

    fn stream(peer: &str, call: &str) -> RemoteStream {
        RemoteStream {
            call_id: call.to_string(),
            peer_id: peer.to_string(),
            audio: true,
            video: true,
        }
    }

    fn received(peer: &str, generation: u64, call: &str) -> Signal {
        Signal::StreamReceived {
            peer_id: peer.to_string(),
            generation,
            stream: stream(peer, call),
        }
    }

    fn phase(tracker: &PresenceTracker, peer: &str) -> PeerPhase {
        tracker.peer(peer).unwrap().phase
    }

    #[test]
    fn own_presence_is_ignored() {
        let mut tracker = PresenceTracker::new("me");
        assert!(tracker.apply(added("me", "r1", 1)).is_empty());
        assert!(tracker.peer("me").is_none());
    }

    #[test]
    fn duplicate_presence_places_one_call() {
        let mut tracker = PresenceTracker::new("me");
        assert_eq!(
            tracker.apply(added("b", "r1", 1)),
            vec![Effect::PlaceCall {
                peer_id: "b".to_string(),
                generation: 1
            }]
        );
        assert!(tracker.apply(added("b", "r2", 2)).is_empty());
        assert_eq!(tracker.peer("b").unwrap().record_id.as_deref(), Some("r2"));

        assert_eq!(
            tracker.apply(received("b", 1, "c1")),
            vec![Effect::Render {
                peer_id: "b".to_string()
            }]
        );
        assert!(tracker.apply(added("b", "r3", 3)).is_empty());
        assert_eq!(phase(&tracker, "b"), PeerPhase::Connected);
    }

    #[test]
    fn presence_then_disconnect() {
        let mut tracker = PresenceTracker::new("me");
        tracker.apply(added("b", "r1", 1));
        tracker.apply(received("b", 1, "c1"));
        let effects = tracker.apply(Signal::Disconnect {
            peer_id: "b".to_string(),
            stamp: 2,
        });
        assert_eq!(
            effects,
            vec![Effect::Teardown {
                peer_id: "b".to_string()
            }]
        );
        assert_eq!(phase(&tracker, "b"), PeerPhase::Disconnected);
        assert!(tracker.peer("b").unwrap().stream.is_none());
    }

    #[test]
    fn disconnect_then_older_presence() {
        let mut tracker = PresenceTracker::new("me");
        assert!(tracker
            .apply(Signal::Disconnect {
                peer_id: "b".to_string(),
                stamp: 2,
            })
            .is_empty());
        assert!(tracker.apply(added("b", "r1", 1)).is_empty());
        assert_eq!(phase(&tracker, "b"), PeerPhase::Disconnected);

        // a newer presence supersedes the tombstone
        assert_eq!(
            tracker.apply(added("b", "r2", 3)),
            vec![Effect::PlaceCall {
                peer_id: "b".to_string(),
                generation: 1
            }]
        );
    }

    #[test]
    fn mute_cycle_keeps_the_call() {
        let mut tracker = PresenceTracker::new("me");
        tracker.apply(added("b", "r1", 1));
        tracker.apply(received("b", 1, "c1"));

        let hide = tracker.apply(Signal::StopStream {
            peer_id: "b".to_string(),
            stamp: 2,
        });
        assert_eq!(
            hide,
            vec![Effect::Hide {
                peer_id: "b".to_string()
            }]
        );
        assert!(tracker
            .apply(Signal::PresenceRemoved {
                peer_id: "b".to_string(),
                record_id: "r1".to_string(),
            })
            .is_empty());
        assert_eq!(phase(&tracker, "b"), PeerPhase::Muted);

        assert_eq!(
            tracker.apply(added("b", "r2", 3)),
            vec![Effect::Show {
                peer_id: "b".to_string()
            }]
        );
        let peer = tracker.peer("b").unwrap();
        assert_eq!(peer.phase, PeerPhase::Connected);
        assert_eq!(peer.generation, 1);
        assert_eq!(peer.stream.as_ref().unwrap().call_id, "c1");
    }

    #[test]
    fn stale_stop_stream_is_ignored() {
        let mut tracker = PresenceTracker::new("me");
        tracker.apply(added("b", "r2", 5));
        tracker.apply(received("b", 1, "c1"));
        assert!(tracker
            .apply(Signal::StopStream {
                peer_id: "b".to_string(),
                stamp: 3,
            })
            .is_empty());
        assert_eq!(phase(&tracker, "b"), PeerPhase::Connected);
    }

    #[test]
    fn removing_current_record_tears_down() {
        let mut tracker = PresenceTracker::new("me");
        tracker.apply(added("b", "r1", 1));
        tracker.apply(added("b", "r2", 2));
        assert!(tracker
            .apply(Signal::PresenceRemoved {
                peer_id: "b".to_string(),
                record_id: "r1".to_string(),
            })
            .is_empty());
        assert_eq!(
            tracker.apply(Signal::PresenceRemoved {
                peer_id: "b".to_string(),
                record_id: "r2".to_string(),
            }),
            vec![Effect::Teardown {
                peer_id: "b".to_string()
            }]
        );
    }

    #[test]
    fn superseded_stream_is_released() {
        let mut tracker = PresenceTracker::new("me");
        tracker.apply(added("b", "r1", 1));
        tracker.apply(Signal::Disconnect {
            peer_id: "b".to_string(),
            stamp: 2,
        });
        assert_eq!(
            tracker.apply(received("b", 1, "late")),
            vec![Effect::Release {
                stream: stream("b", "late")
            }]
        );

        tracker.apply(added("b", "r2", 3));
        assert_eq!(tracker.peer("b").unwrap().generation, 2);
        assert!(matches!(
            tracker.apply(received("b", 1, "old")).as_slice(),
            [Effect::Release { .. }]
        ));
        assert!(matches!(
            tracker.apply(received("b", 2, "new")).as_slice(),
            [Effect::Render { .. }]
        ));
    }

    #[test]
    fn failed_call_retries_on_newer_presence() {
        let mut tracker = PresenceTracker::new("me");
        tracker.apply(added("b", "r1", 1));
        assert_eq!(
            tracker.apply(Signal::CallFailed {
                peer_id: "b".to_string(),
                generation: 1,
            }),
            vec![Effect::Teardown {
                peer_id: "b".to_string()
            }]
        );
        assert!(tracker.apply(added("b", "r1", 1)).is_empty());
        assert_eq!(
            tracker.apply(added("b", "r2", 4)),
            vec![Effect::PlaceCall {
                peer_id: "b".to_string(),
                generation: 2
            }]
        );
    }
}
