//! Room pool handed out by score

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::BattleConfig;

use super::Room;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct RoomRank {
    score: i64,
    /// Lower ids win ties
    id: Reverse<i32>,
}

/// Registry of all rooms plus a priority queue of rooms open for admission.
///
/// A room is absent from the queue between `pop` and `push`, so two
/// concurrent admissions never race on the same room through the manager.
pub struct RoomManager {
    rooms: DashMap<i32, Arc<Room>>,
    queue: Mutex<BinaryHeap<RoomRank>>,
}

impl RoomManager {
    pub fn new(room_count: usize, cfg: &BattleConfig) -> Self {
        let manager = Self {
            rooms: DashMap::new(),
            queue: Mutex::new(BinaryHeap::with_capacity(room_count)),
        };
        for id in 1..=room_count as i32 {
            let room = Arc::new(Room::new(id, cfg.clone()));
            manager.rooms.insert(id, room.clone());
            manager.push(room);
        }
        manager
    }

    /// Takes the best-scored room out of the queue
    pub fn pop(&self) -> Option<Arc<Room>> {
        let mut queue = self.queue.lock();
        while let Some(rank) = queue.pop() {
            if let Some(room) = self.get(rank.id.0) {
                debug!(room_id = rank.id.0, score = rank.score, "Popped room");
                return Some(room);
            }
        }
        None
    }

    /// Returns a popped room to the queue with its current score
    pub fn push(&self, room: Arc<Room>) {
        let rank = RoomRank {
            score: room.score(),
            id: Reverse(room.id()),
        };
        self.queue.lock().push(rank);
    }

    pub fn get(&self, id: i32) -> Option<Arc<Room>> {
        self.rooms.get(&id).map(|r| r.value().clone())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn total_players(&self) -> usize {
        self.rooms.iter().map(|r| r.value().player_count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::session::WsSession;

    #[test]
    fn idle_rooms_pop_by_id() {
        let manager = RoomManager::new(3, &BattleConfig::default());
        assert_eq!(manager.room_count(), 3);
        let ids: Vec<i32> = std::iter::from_fn(|| manager.pop().map(|r| r.id())).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(manager.pop().is_none());
    }

    #[test]
    fn partially_filled_room_is_preferred() {
        let manager = RoomManager::new(3, &BattleConfig::default());
        let first = manager.pop().unwrap();
        let second = manager.pop().unwrap();
        second.admit(10, 1, WsSession::new(10).1).unwrap();
        manager.push(first);
        manager.push(second);

        assert_eq!(manager.pop().unwrap().id(), 2);
        assert_eq!(manager.total_players(), 1);
    }
}
