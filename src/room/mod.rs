//! Room presence and signaling.
//!
//! A room is a document in the rooms collection with three sub-collections:
//! presence records, disconnect events and stop-stream events. The
//! [`controller`] runs one event loop per visit that feeds those change
//! feeds through the [`state`] machine.

pub mod controller;
pub mod documents;
pub mod listeners;
pub mod lookup;
pub mod state;

pub use self::controller::{
    acquire_media, PeerView, RoomContext, RoomSession, RoomStatus, RoomView,
};
pub use self::documents::{PresenceRecord, RoomDocuments, RoomPaths};
pub use self::listeners::Listeners;
pub use self::lookup::{create_room, resolve_room, room_id_from_link, share_link};
pub use self::state::{Effect, PeerPhase, PresenceTracker, RemotePeer, Signal};
