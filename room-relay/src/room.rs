use std::collections::HashSet;

use crate::member::MemberRef;

/// A named set of members. Only the hub mutates it, under its table lock.
#[derive(Debug)]
pub struct Room {
    name: String,
    members: HashSet<MemberRef>,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `false` if the member was already present.
    pub fn insert(&mut self, member: MemberRef) -> bool {
        self.members.insert(member)
    }

    /// Returns `false` if the member was not present.
    pub fn remove(&mut self, member: &MemberRef) -> bool {
        self.members.remove(member)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberRef> {
        self.members.iter()
    }

    /// Current usernames, sorted.
    pub fn usernames(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .members
            .iter()
            .map(|member| member.username().to_string())
            .collect();
        users.sort_unstable();
        users
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = MemberRef> + '_ {
        self.members.drain()
    }
}
