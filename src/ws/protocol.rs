//! WebSocket protocol message definitions
//! These are the wire types for client-server communication, bincode-encoded in binary frames

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::battle::downsync::{InputFrameDownsync, RoomDownsyncFrame};

/// Result codes carried in `WsResp::ret`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrCode {
    Ok = 9000,
    UnknownError = 9001,
    RoomFull = 4001,
    DuplicatePlayer = 4002,
    RoomNotAcceptingPlayers = 4003,
    NoRoomAvailable = 4004,
}

impl ErrCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Upsync actions
pub const UPSYNC_MSG_ACT_HB_PING: i32 = 1;
pub const UPSYNC_MSG_ACT_PLAYER_CMD: i32 = 2;

/// Downsync actions
pub const DOWNSYNC_MSG_ACT_BATTLE_COLLIDER_INFO: i32 = -2;
pub const DOWNSYNC_MSG_ACT_BATTLE_START: i32 = 0;
pub const DOWNSYNC_MSG_ACT_HB_REQ: i32 = 1;
pub const DOWNSYNC_MSG_ACT_INPUT_BATCH: i32 = 2;
pub const DOWNSYNC_MSG_ACT_BATTLE_STOPPED: i32 = 3;
pub const DOWNSYNC_MSG_ACT_FORCED_RESYNC: i32 = 4;
pub const DOWNSYNC_MSG_ACT_PLAYER_DISCONNECTED: i32 = 5;
pub const DOWNSYNC_MSG_ACT_ROOM_FRAME: i32 = 6;

/// One input sampled by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFrameUpsync {
    pub input_frame_id: i32,
    pub encoded: u64,
}

/// Client to server envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsReq {
    pub msg_id: i32,
    pub player_id: i32,
    pub act: i32,
    pub join_index: usize,
    pub acking_frame_id: i32,
    pub acking_input_frame_id: i32,
    pub input_frame_upsync_batch: Vec<InputFrameUpsync>,
}

/// Static battle parameters sent once right after admission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleColliderInfo {
    pub stage_name: String,
    pub bound_room_id: i32,
    pub battle_duration_frames: i32,
    pub input_frame_upsync_delay_tolerance: i32,
    pub max_chasing_render_frames_per_update: i32,
    pub render_buffer_size: usize,
    pub bound_room_capacity: usize,
    pub battle_udp_tunnel: String,
    pub frame_data_logging_enabled: bool,
}

/// Server to client envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsResp {
    pub ret: i32,
    pub act: i32,
    pub rdf: Option<RoomDownsyncFrame>,
    pub input_frame_downsync_batch: Vec<InputFrameDownsync>,
    pub bci_frame: Option<BattleColliderInfo>,
    pub peer_join_index: usize,
}

impl WsResp {
    pub fn new(ret: ErrCode, act: i32) -> Self {
        Self {
            ret: ret.code(),
            act,
            rdf: None,
            input_frame_downsync_batch: Vec::new(),
            bci_frame: None,
            peer_join_index: 0,
        }
    }

    pub fn error(ret: ErrCode) -> Self {
        Self::new(ret, DOWNSYNC_MSG_ACT_BATTLE_COLLIDER_INFO)
    }

    pub fn battle_collider_info(bci: BattleColliderInfo, peer_join_index: usize) -> Self {
        Self {
            bci_frame: Some(bci),
            peer_join_index,
            ..Self::new(ErrCode::Ok, DOWNSYNC_MSG_ACT_BATTLE_COLLIDER_INFO)
        }
    }

    pub fn room_frame(act: i32, rdf: RoomDownsyncFrame) -> Self {
        Self {
            rdf: Some(rdf),
            ..Self::new(ErrCode::Ok, act)
        }
    }

    pub fn input_batch(batch: Vec<InputFrameDownsync>) -> Self {
        Self {
            input_frame_downsync_batch: batch,
            ..Self::new(ErrCode::Ok, DOWNSYNC_MSG_ACT_INPUT_BATCH)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(msg).map_err(CodecError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsync_envelope_survives_codec() {
        let req = WsReq {
            msg_id: 3,
            player_id: 42,
            act: UPSYNC_MSG_ACT_PLAYER_CMD,
            join_index: 1,
            acking_frame_id: 10,
            acking_input_frame_id: 2,
            input_frame_upsync_batch: vec![InputFrameUpsync {
                input_frame_id: 3,
                encoded: 0b10_0011,
            }],
        };
        let decoded: WsReq = decode(&encode(&req).unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_truncated_bytes_fail_to_decode() {
        let resp = WsResp::battle_collider_info(
            BattleColliderInfo {
                stage_name: "arena".to_string(),
                bound_room_capacity: 2,
                ..BattleColliderInfo::default()
            },
            1,
        );
        let bytes = encode(&resp).unwrap();
        let result: Result<WsResp, _> = decode(&bytes[..bytes.len() / 2]);
        assert!(matches!(result, Err(CodecError::Decode(_))));
    }

    #[test]
    fn test_error_response_carries_code() {
        let resp = WsResp::error(ErrCode::RoomFull);
        assert_eq!(resp.ret, 4001);
        assert!(resp.bci_frame.is_none());
    }
}
