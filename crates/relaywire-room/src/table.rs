//! The room membership index.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

use crate::IntoRooms;

/// Tracks which members are in which rooms, in both directions.
///
/// The two maps are kept in lockstep: `m ∈ rooms[r]` exactly when
/// `r ∈ memberships[m]`.
pub struct RoomTable<M> {
    /// Room name → members.
    rooms: HashMap<String, HashSet<M>>,

    /// Member → room names, for `leave_all` and `rooms_of`.
    memberships: HashMap<M, BTreeSet<String>>,
}

impl<M> RoomTable<M>
where
    M: Eq + Hash + Clone + fmt::Display,
{
    /// Creates a new, empty table.
    pub fn new() -> Self {
        Self {
            rooms: HashMap::new(),
            memberships: HashMap::new(),
        }
    }

    /// Adds `member` to every named room, creating rooms as needed.
    ///
    /// Returns how many rooms the member was not already in.
    pub fn join(&mut self, member: &M, rooms: impl IntoRooms) -> usize {
        let mut joined = 0;
        for room in rooms.into_rooms() {
            let inserted = self
                .rooms
                .entry(room.clone())
                .or_default()
                .insert(member.clone());
            if inserted {
                tracing::debug!(%member, %room, "joined room");
                self.memberships
                    .entry(member.clone())
                    .or_default()
                    .insert(room);
                joined += 1;
            }
        }
        joined
    }

    /// Removes `member` from every named room. Rooms stay, even if empty.
    ///
    /// Returns how many rooms the member actually left.
    pub fn leave(&mut self, member: &M, rooms: impl IntoRooms) -> usize {
        let mut left = 0;
        for room in rooms.into_rooms() {
            let removed = self
                .rooms
                .get_mut(&room)
                .is_some_and(|members| members.remove(member));
            if removed {
                tracing::debug!(%member, %room, "left room");
                if let Some(joined) = self.memberships.get_mut(member) {
                    joined.remove(&room);
                    if joined.is_empty() {
                        self.memberships.remove(member);
                    }
                }
                left += 1;
            }
        }
        left
    }

    /// Removes `member` from every room it is in. Returns those rooms.
    pub fn leave_all(&mut self, member: &M) -> BTreeSet<String> {
        let rooms = self.memberships.remove(member).unwrap_or_default();
        for room in &rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(member);
            }
        }
        if !rooms.is_empty() {
            tracing::debug!(%member, count = rooms.len(), "left all rooms");
        }
        rooms
    }

    /// The members of one room. Unknown rooms have no members.
    pub fn members(&self, room: &str) -> Vec<M> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, room: &str, member: &M) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(member))
    }

    /// The rooms `member` is in, sorted by name.
    pub fn rooms_of(&self, member: &M) -> BTreeSet<String> {
        self.memberships.get(member).cloned().unwrap_or_default()
    }

    /// Everyone in any of `rooms`, minus `exclude`. Each member appears
    /// once no matter how many of the rooms it shares.
    pub fn union_members<'a>(
        &self,
        rooms: impl IntoIterator<Item = &'a str>,
        exclude: &HashSet<M>,
    ) -> HashSet<M> {
        let mut union = HashSet::new();
        for room in rooms {
            if let Some(members) = self.rooms.get(room) {
                union.extend(
                    members
                        .iter()
                        .filter(|member| !exclude.contains(*member))
                        .cloned(),
                );
            }
        }
        union
    }

    /// Number of rooms ever joined, including now-empty ones.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of members in one room.
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, HashSet::len)
    }

    /// All room names, sorted.
    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

impl<M> Default for RoomTable<M>
where
    M: Eq + Hash + Clone + fmt::Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for RoomTable<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomTable")
            .field("rooms", &self.rooms.len())
            .field("members", &self.memberships.len())
            .finish()
    }
}
