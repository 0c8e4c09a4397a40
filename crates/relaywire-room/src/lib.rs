//! Room membership for relaywire.
//!
//! A room is a named set of members. Membership is many-to-many: a member
//! can sit in any number of rooms and a room holds any number of members.
//! Rooms come into existence on first join and are never torn down, even
//! when they become empty.
//!
//! # Key types
//!
//! - [`RoomTable`]: the membership index, generic over the member id
//! - [`IntoRooms`]: accepts one room name or a collection of them

mod rooms;
mod table;

pub use rooms::IntoRooms;
pub use table::RoomTable;
