//! Periodic full-frame broadcasts

use crate::battle::Battle;
use crate::ws::protocol::{WsResp, DOWNSYNC_MSG_ACT_ROOM_FRAME};

/// Decides when a room pushes its latest confirmed render frame to every seat
pub struct SnapshotBuilder {
    /// Frames since last snapshot
    frames_since_snapshot: u32,
    /// Snapshot interval in render frames
    snapshot_interval: u32,
    /// Render frame carried by the last snapshot
    last_snapshot_frame_id: i32,
}

impl SnapshotBuilder {
    pub fn new(snapshot_interval: u32) -> Self {
        Self {
            frames_since_snapshot: 0,
            snapshot_interval: snapshot_interval.max(1),
            last_snapshot_frame_id: -1,
        }
    }

    /// Check if it's time to send a snapshot
    pub fn should_send(&mut self) -> bool {
        self.frames_since_snapshot += 1;
        if self.frames_since_snapshot >= self.snapshot_interval {
            self.frames_since_snapshot = 0;
            true
        } else {
            false
        }
    }

    /// Force snapshot on next check (used after a seat drops)
    pub fn force_next(&mut self) {
        self.frames_since_snapshot = self.snapshot_interval;
    }

    /// Latest render frame derived from all-confirmed inputs, unless it was already sent
    pub fn build(&mut self, battle: &Battle) -> Option<WsResp> {
        let frame_id = battle.last_confirmed_render_frame_id();
        if frame_id <= self.last_snapshot_frame_id {
            return None;
        }
        let rdf = battle.render_frame(frame_id)?;
        self.last_snapshot_frame_id = frame_id;
        Some(WsResp::room_frame(DOWNSYNC_MSG_ACT_ROOM_FRAME, rdf.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BattleConfig;

    #[test]
    fn sends_every_interval() {
        let mut builder = SnapshotBuilder::new(3);
        let sent: Vec<bool> = (0..6).map(|_| builder.should_send()).collect();
        assert_eq!(sent, vec![false, false, true, false, false, true]);

        builder.force_next();
        assert!(builder.should_send());
    }

    #[test]
    fn same_frame_is_not_sent_twice() {
        let mut battle = Battle::new(BattleConfig::default()).unwrap();
        let initial = battle.initial_frame(&[(10, 1), (20, 1)]);
        battle.start(&initial).unwrap();

        let mut builder = SnapshotBuilder::new(1);
        let resp = builder.build(&battle).unwrap();
        assert_eq!(resp.rdf.unwrap().id, 0);
        assert!(builder.build(&battle).is_none());
    }
}
