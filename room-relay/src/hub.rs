//! The connection hub: room table, membership serialization and fan-out.
//!
//! Registration and unregistration mutate the room table under a single
//! write lock. Outgoing messages are only enqueued by callers; one delivery
//! loop ([`Hub::run`]) drains the queue, so every room sees its messages in
//! enqueue order and no caller ever waits on a slow receiver.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, trace, warn};

use crate::{
    member::{Member, MemberRef},
    message::RoomMessage,
    room::Room,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("hub is closed")]
    HubClosed,
}

/// Point-in-time view of one room, as served by `/rooms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub name: String,
    pub users: Vec<String>,
}

pub struct Hub {
    rooms: RwLock<HashMap<String, Room>>,
    // Unbounded: the delivery loop enqueues leave/presence for members it
    // evicts, so a bounded queue could wait on itself.
    queue: Mutex<Option<mpsc::UnboundedSender<RoomMessage>>>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<RoomMessage>>>,
    closed: AtomicBool,
}

impl Hub {
    pub fn new() -> Self {
        let (queue, inbox) = mpsc::unbounded_channel();
        Self {
            rooms: RwLock::new(HashMap::new()),
            queue: Mutex::new(Some(queue)),
            inbox: Mutex::new(Some(inbox)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Adds the member to its room, creating the room if needed, then
    /// announces it with `join` and, when others are present, `presence`.
    pub async fn register_member(&self, member: Arc<dyn Member>) -> Result<(), RegisterError> {
        let member = MemberRef::new(member);
        let mut rooms = self.rooms.write().await;

        if self.is_closed() {
            member.close_sink();
            return Err(RegisterError::HubClosed);
        }

        let room_name = member.current_room().to_string();
        let room = rooms
            .entry(room_name.clone())
            .or_insert_with(|| Room::new(room_name.clone()));
        if !room.insert(member.clone()) {
            return Ok(());
        }

        // Enqueued under the write lock so the pair reports this exact roster.
        self.broadcast_message(RoomMessage::join(&room_name, member.username()));
        if room.len() > 1 {
            self.broadcast_message(RoomMessage::presence(&room_name, room.usernames()));
        }
        drop(rooms);

        info!(room = %room_name, username = %member.username(), "member joined");
        Ok(())
    }

    /// Removes the member from its room, announcing `leave` and, if anyone
    /// remains, `presence`. The member's sink is closed in every case.
    pub async fn unregister_member(&self, member: &Arc<dyn Member>) {
        let member = MemberRef::new(Arc::clone(member));
        let room_name = member.current_room();
        let mut rooms = self.rooms.write().await;

        // `None` when the member was not registered, `Some(empty)` when the
        // room has just been emptied.
        let remaining = rooms.get_mut(room_name).and_then(|room| {
            if !room.remove(&member) {
                return None;
            }
            Some((!room.is_empty()).then(|| room.usernames()))
        });

        if let Some(roster) = remaining {
            self.broadcast_message(RoomMessage::leave(room_name, member.username()));
            match roster {
                Some(roster) => self.broadcast_message(RoomMessage::presence(room_name, roster)),
                None => {
                    rooms.remove(room_name);
                    debug!(room = %room_name, "room emptied and removed");
                }
            }
            info!(room = %room_name, username = %member.username(), "member left");
        }
        drop(rooms);

        member.close_sink();
    }

    /// Queues a message for fan-out. A no-op once the hub is closed.
    pub fn broadcast_message(&self, message: RoomMessage) {
        let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        match queue.as_ref() {
            Some(queue) => {
                if queue.send(message).is_err() {
                    trace!("delivery loop gone, dropping message");
                }
            }
            None => trace!(room = %message.room, "hub closed, dropping message"),
        }
    }

    /// The delivery loop. Returns once the hub is closed and the queue drained.
    pub async fn run(&self) {
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut inbox) = inbox else {
            warn!("hub delivery loop is already running");
            return;
        };

        while let Some(message) = inbox.recv().await {
            let evicted = self.deliver(Arc::new(message)).await;
            for member in evicted {
                debug!(
                    room = %member.current_room(),
                    username = %member.username(),
                    "evicting member that is not keeping up"
                );
                self.unregister_member(member.handle()).await;
            }
        }

        debug!("hub delivery loop stopped");
    }

    /// Attempts delivery to every member of the target room, returning the
    /// members whose queue refused the message.
    async fn deliver(&self, message: Arc<RoomMessage>) -> Vec<MemberRef> {
        let rooms = self.rooms.read().await;
        let Some(room) = rooms.get(&message.room) else {
            debug!(room = %message.room, "no such room, dropping message");
            return Vec::new();
        };

        room.members()
            .filter(|member| member.try_deliver(Arc::clone(&message)).is_err())
            .cloned()
            .collect()
    }

    /// Closes every member sink directly and stops the delivery loop after it
    /// drains. Safe to call more than once.
    pub async fn close(&self) {
        let mut rooms = self.rooms.write().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut closed = 0usize;
        for (_, mut room) in rooms.drain() {
            for member in room.drain() {
                member.close_sink();
                closed += 1;
            }
        }
        drop(rooms);

        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(members = closed, "hub closed");
    }

    /// Rooms currently in the table, sorted by name.
    pub async fn rooms(&self) -> Vec<RoomSnapshot> {
        let rooms = self.rooms.read().await;
        let mut snapshot: Vec<RoomSnapshot> = rooms
            .values()
            .map(|room| RoomSnapshot {
                name: room.name().to_string(),
                users: room.usernames(),
            })
            .collect();
        snapshot.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
