//! Conversions into a list of room names.

use std::collections::BTreeSet;

/// Anything that names one or more rooms.
///
/// Lets APIs accept `"lobby"`, `String`, `["a", "b"]`, or a `Vec` alike.
pub trait IntoRooms {
    fn into_rooms(self) -> Vec<String>;
}

impl IntoRooms for &str {
    fn into_rooms(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl IntoRooms for String {
    fn into_rooms(self) -> Vec<String> {
        vec![self]
    }
}

impl IntoRooms for &String {
    fn into_rooms(self) -> Vec<String> {
        vec![self.clone()]
    }
}

impl IntoRooms for Vec<String> {
    fn into_rooms(self) -> Vec<String> {
        self
    }
}

impl IntoRooms for Vec<&str> {
    fn into_rooms(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

impl IntoRooms for &[&str] {
    fn into_rooms(self) -> Vec<String> {
        self.iter().map(|room| (*room).to_string()).collect()
    }
}

impl IntoRooms for &[String] {
    fn into_rooms(self) -> Vec<String> {
        self.to_vec()
    }
}

impl<const N: usize> IntoRooms for [&str; N] {
    fn into_rooms(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

impl IntoRooms for BTreeSet<String> {
    fn into_rooms(self) -> Vec<String> {
        self.into_iter().collect()
    }
}
