//! Room registry, per-room session state, and invite tracking.

pub mod invites;
pub mod registry;
pub mod room;

pub use invites::InviteManager;
pub use registry::{LeaveOutcome, RoomRegistry, generate_room_id};
pub use room::{AccessMode, Consumer, JoinOutcome, Room, RoomOptions, Transport};
