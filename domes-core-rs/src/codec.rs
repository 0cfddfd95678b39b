//! Fixed-layout wire codec for pod frames
//!
//! Every frame is a 14-byte header followed by a payload whose length is
//! fixed per message type:
//! - Byte 0: wire version
//! - Byte 1: message type
//! - Bytes 2-3: sequence number (LE)
//! - Bytes 4-7: sender-local timestamp in microseconds, truncated (LE)
//! - Bytes 8-13: sender address
//!
//! Frames never exceed the 250-byte MTU of the broadcast medium.

use crate::error::CodecError;
use crate::types::{EffectParams, PodAddr, PriorityScore, ResignReason, TimeUs};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Current wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 14;

/// Maximum frame size (medium MTU)
pub const MAX_FRAME_SIZE: usize = 250;

/// Encoded size of a `PriorityScore`
const PRIORITY_SIZE: usize = 10;

/// Message type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // master -> pod primitives
    SetEffect = 0x01,
    ArmDetect = 0x02,
    PlaySound = 0x03,
    FireHaptic = 0x04,
    StopAll = 0x05,
    JoinSession = 0x06,

    // pod -> master events
    HitEvent = 0x10,
    TimeoutEvent = 0x11,
    StatusReport = 0x12,

    // election
    Discover = 0x30,
    DiscoverAck = 0x31,
    Candidate = 0x32,
    Vote = 0x33,
    MasterAnnounce = 0x34,
    Resign = 0x35,

    // clock
    SyncRequest = 0x40,
    SyncResponse = 0x41,
    TimeBeacon = 0x42,
}

impl MessageType {
    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        let msg_type = match byte {
            0x01 => MessageType::SetEffect,
            0x02 => MessageType::ArmDetect,
            0x03 => MessageType::PlaySound,
            0x04 => MessageType::FireHaptic,
            0x05 => MessageType::StopAll,
            0x06 => MessageType::JoinSession,
            0x10 => MessageType::HitEvent,
            0x11 => MessageType::TimeoutEvent,
            0x12 => MessageType::StatusReport,
            0x30 => MessageType::Discover,
            0x31 => MessageType::DiscoverAck,
            0x32 => MessageType::Candidate,
            0x33 => MessageType::Vote,
            0x34 => MessageType::MasterAnnounce,
            0x35 => MessageType::Resign,
            0x40 => MessageType::SyncRequest,
            0x41 => MessageType::SyncResponse,
            0x42 => MessageType::TimeBeacon,
            other => return Err(CodecError::UnknownType(other)),
        };
        Ok(msg_type)
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Human-readable name for logs
    pub fn name(self) -> &'static str {
        match self {
            MessageType::SetEffect => "SET_EFFECT",
            MessageType::ArmDetect => "ARM_DETECT",
            MessageType::PlaySound => "PLAY_SOUND",
            MessageType::FireHaptic => "FIRE_HAPTIC",
            MessageType::StopAll => "STOP_ALL",
            MessageType::JoinSession => "JOIN_SESSION",
            MessageType::HitEvent => "HIT_EVENT",
            MessageType::TimeoutEvent => "TIMEOUT_EVENT",
            MessageType::StatusReport => "STATUS_REPORT",
            MessageType::Discover => "DISCOVER",
            MessageType::DiscoverAck => "DISCOVER_ACK",
            MessageType::Candidate => "CANDIDATE",
            MessageType::Vote => "VOTE",
            MessageType::MasterAnnounce => "MASTER_ANNOUNCE",
            MessageType::Resign => "RESIGN",
            MessageType::SyncRequest => "SYNC_REQUEST",
            MessageType::SyncResponse => "SYNC_RESPONSE",
            MessageType::TimeBeacon => "TIME_BEACON",
        }
    }

    /// Fixed payload length for this type
    pub fn payload_len(self) -> usize {
        match self {
            MessageType::SetEffect => 16,
            MessageType::ArmDetect => 7,
            MessageType::PlaySound => 3,
            MessageType::FireHaptic => 2,
            MessageType::StopAll | MessageType::JoinSession => 0,
            MessageType::HitEvent => 9,
            MessageType::TimeoutEvent => 4,
            MessageType::StatusReport => 2,
            MessageType::Discover => PRIORITY_SIZE,
            MessageType::DiscoverAck => PRIORITY_SIZE + 6,
            MessageType::Candidate => PRIORITY_SIZE + 2,
            MessageType::Vote => 1 + PRIORITY_SIZE + 2,
            MessageType::MasterAnnounce => PRIORITY_SIZE + 2,
            MessageType::Resign => 1 + 6,
            MessageType::SyncRequest => 8,
            MessageType::SyncResponse => 24,
            MessageType::TimeBeacon => 9,
        }
    }

    /// Primitives sent by the master to pods (0x01-0x0F)
    pub fn is_primitive(self) -> bool {
        (0x01..=0x0F).contains(&self.to_byte())
    }

    /// Events sent by pods to the master (0x10-0x1F)
    pub fn is_pod_event(self) -> bool {
        (0x10..=0x1F).contains(&self.to_byte())
    }

    pub fn is_election(self) -> bool {
        (0x30..=0x35).contains(&self.to_byte())
    }

    pub fn is_clock(self) -> bool {
        (0x40..=0x44).contains(&self.to_byte())
    }
}

/// Common frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    pub sequence: u16,
    /// Sender's local clock, truncated to 32 bits
    pub timestamp_us: u32,
    pub sender: PodAddr,
}

/// Type-specific payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    SetEffect { params: EffectParams, duration_ms: u32 },
    /// `arm_id` is echoed by the resulting event
    ArmDetect { timeout_ms: u32, feedback_mode: u8, arm_id: u16 },
    PlaySound { sound_id: u16, volume: u8 },
    FireHaptic { effect_id: u8, intensity: u8 },
    StopAll,
    JoinSession,

    HitEvent { pod_id: u16, reaction_us: u32, strength: u8, arm_id: u16 },
    TimeoutEvent { pod_id: u16, arm_id: u16 },
    StatusReport { battery: u8, link_quality: u8 },

    Discover { priority: PriorityScore },
    DiscoverAck { priority: PriorityScore, current_master: Option<PodAddr> },
    Candidate { priority: PriorityScore, round: u16 },
    Vote { accept: bool, voter_priority: PriorityScore, round: u16 },
    MasterAnnounce { priority: PriorityScore, peer_count: u8, forced: bool },
    Resign { reason: ResignReason, successor: Option<PodAddr> },

    SyncRequest { t1: TimeUs },
    SyncResponse { t1: TimeUs, t2: TimeUs, t3: TimeUs },
    TimeBeacon { master_time: TimeUs, quality: u8 },
}

impl Payload {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Payload::SetEffect { .. } => MessageType::SetEffect,
            Payload::ArmDetect { .. } => MessageType::ArmDetect,
            Payload::PlaySound { .. } => MessageType::PlaySound,
            Payload::FireHaptic { .. } => MessageType::FireHaptic,
            Payload::StopAll => MessageType::StopAll,
            Payload::JoinSession => MessageType::JoinSession,
            Payload::HitEvent { .. } => MessageType::HitEvent,
            Payload::TimeoutEvent { .. } => MessageType::TimeoutEvent,
            Payload::StatusReport { .. } => MessageType::StatusReport,
            Payload::Discover { .. } => MessageType::Discover,
            Payload::DiscoverAck { .. } => MessageType::DiscoverAck,
            Payload::Candidate { .. } => MessageType::Candidate,
            Payload::Vote { .. } => MessageType::Vote,
            Payload::MasterAnnounce { .. } => MessageType::MasterAnnounce,
            Payload::Resign { .. } => MessageType::Resign,
            Payload::SyncRequest { .. } => MessageType::SyncRequest,
            Payload::SyncResponse { .. } => MessageType::SyncResponse,
            Payload::TimeBeacon { .. } => MessageType::TimeBeacon,
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        match *self {
            Payload::SetEffect { params, duration_ms } => {
                buf.put_u8(params.r);
                buf.put_u8(params.g);
                buf.put_u8(params.b);
                buf.put_u8(params.pattern);
                buf.put_u64_le(params.start_at);
                buf.put_u32_le(duration_ms);
            }
            Payload::ArmDetect { timeout_ms, feedback_mode, arm_id } => {
                buf.put_u32_le(timeout_ms);
                buf.put_u8(feedback_mode);
                buf.put_u16_le(arm_id);
            }
            Payload::PlaySound { sound_id, volume } => {
                buf.put_u16_le(sound_id);
                buf.put_u8(volume);
            }
            Payload::FireHaptic { effect_id, intensity } => {
                buf.put_u8(effect_id);
                buf.put_u8(intensity);
            }
            Payload::StopAll | Payload::JoinSession => {}
            Payload::HitEvent { pod_id, reaction_us, strength, arm_id } => {
                buf.put_u16_le(pod_id);
                buf.put_u32_le(reaction_us);
                buf.put_u8(strength);
                buf.put_u16_le(arm_id);
            }
            Payload::TimeoutEvent { pod_id, arm_id } => {
                buf.put_u16_le(pod_id);
                buf.put_u16_le(arm_id);
            }
            Payload::StatusReport { battery, link_quality } => {
                buf.put_u8(battery);
                buf.put_u8(link_quality);
            }
            Payload::Discover { priority } => put_priority(buf, &priority),
            Payload::DiscoverAck { priority, current_master } => {
                put_priority(buf, &priority);
                put_addr(buf, current_master);
            }
            Payload::Candidate { priority, round } => {
                put_priority(buf, &priority);
                buf.put_u16_le(round);
            }
            Payload::Vote { accept, voter_priority, round } => {
                buf.put_u8(accept as u8);
                put_priority(buf, &voter_priority);
                buf.put_u16_le(round);
            }
            Payload::MasterAnnounce { priority, peer_count, forced } => {
                put_priority(buf, &priority);
                buf.put_u8(peer_count);
                buf.put_u8(forced as u8);
            }
            Payload::Resign { reason, successor } => {
                buf.put_u8(reason.to_byte());
                put_addr(buf, successor);
            }
            Payload::SyncRequest { t1 } => buf.put_u64_le(t1),
            Payload::SyncResponse { t1, t2, t3 } => {
                buf.put_u64_le(t1);
                buf.put_u64_le(t2);
                buf.put_u64_le(t3);
            }
            Payload::TimeBeacon { master_time, quality } => {
                buf.put_u64_le(master_time);
                buf.put_u8(quality);
            }
        }
    }

    /// Decode a payload of the given type. `buf` must hold exactly the
    /// fixed payload length.
    fn decode(msg_type: MessageType, mut buf: &[u8]) -> Result<Self, CodecError> {
        let expected = msg_type.payload_len();
        if buf.len() != expected {
            return Err(CodecError::PayloadLength {
                msg_type: msg_type.name(),
                expected,
                actual: buf.len(),
            });
        }

        let payload = match msg_type {
            MessageType::SetEffect => {
                let r = buf.get_u8();
                let g = buf.get_u8();
                let b = buf.get_u8();
                let pattern = buf.get_u8();
                let start_at = buf.get_u64_le();
                let duration_ms = buf.get_u32_le();
                Payload::SetEffect {
                    params: EffectParams { r, g, b, pattern, start_at },
                    duration_ms,
                }
            }
            MessageType::ArmDetect => Payload::ArmDetect {
                timeout_ms: buf.get_u32_le(),
                feedback_mode: buf.get_u8(),
                arm_id: buf.get_u16_le(),
            },
            MessageType::PlaySound => Payload::PlaySound {
                sound_id: buf.get_u16_le(),
                volume: buf.get_u8(),
            },
            MessageType::FireHaptic => Payload::FireHaptic {
                effect_id: buf.get_u8(),
                intensity: buf.get_u8(),
            },
            MessageType::StopAll => Payload::StopAll,
            MessageType::JoinSession => Payload::JoinSession,
            MessageType::HitEvent => Payload::HitEvent {
                pod_id: buf.get_u16_le(),
                reaction_us: buf.get_u32_le(),
                strength: buf.get_u8(),
                arm_id: buf.get_u16_le(),
            },
            MessageType::TimeoutEvent => Payload::TimeoutEvent {
                pod_id: buf.get_u16_le(),
                arm_id: buf.get_u16_le(),
            },
            MessageType::StatusReport => Payload::StatusReport {
                battery: buf.get_u8(),
                link_quality: buf.get_u8(),
            },
            MessageType::Discover => Payload::Discover {
                priority: get_priority(&mut buf),
            },
            MessageType::DiscoverAck => Payload::DiscoverAck {
                priority: get_priority(&mut buf),
                current_master: get_addr(&mut buf),
            },
            MessageType::Candidate => Payload::Candidate {
                priority: get_priority(&mut buf),
                round: buf.get_u16_le(),
            },
            MessageType::Vote => Payload::Vote {
                accept: buf.get_u8() != 0,
                voter_priority: get_priority(&mut buf),
                round: buf.get_u16_le(),
            },
            MessageType::MasterAnnounce => Payload::MasterAnnounce {
                priority: get_priority(&mut buf),
                peer_count: buf.get_u8(),
                forced: buf.get_u8() != 0,
            },
            MessageType::Resign => Payload::Resign {
                reason: ResignReason::from_byte(buf.get_u8()),
                successor: get_addr(&mut buf),
            },
            MessageType::SyncRequest => Payload::SyncRequest { t1: buf.get_u64_le() },
            MessageType::SyncResponse => Payload::SyncResponse {
                t1: buf.get_u64_le(),
                t2: buf.get_u64_le(),
                t3: buf.get_u64_le(),
            },
            MessageType::TimeBeacon => Payload::TimeBeacon {
                master_time: buf.get_u64_le(),
                quality: buf.get_u8(),
            },
        };

        Ok(payload)
    }
}

fn put_priority(buf: &mut BytesMut, priority: &PriorityScore) {
    buf.put_u8(priority.battery);
    buf.put_u8(priority.link_quality);
    buf.put_u32_le(priority.uptime_s);
    buf.put_u32_le(priority.tiebreak);
}

fn get_priority(buf: &mut &[u8]) -> PriorityScore {
    PriorityScore {
        battery: buf.get_u8(),
        link_quality: buf.get_u8(),
        uptime_s: buf.get_u32_le(),
        tiebreak: buf.get_u32_le(),
    }
}

fn put_addr(buf: &mut BytesMut, addr: Option<PodAddr>) {
    buf.put_slice(&addr.unwrap_or(PodAddr::NONE).0);
}

fn get_addr(buf: &mut &[u8]) -> Option<PodAddr> {
    let mut raw = [0u8; 6];
    buf.copy_to_slice(&mut raw);
    let addr = PodAddr(raw);
    if addr.is_none() {
        None
    } else {
        Some(addr)
    }
}

/// A decoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Payload,
}

impl Message {
    /// Build a message; the header type is taken from the payload.
    pub fn new(sender: PodAddr, sequence: u16, local_time: TimeUs, payload: Payload) -> Self {
        Self {
            header: Header {
                version: WIRE_VERSION,
                msg_type: payload.msg_type(),
                sequence,
                timestamp_us: local_time as u32,
                sender,
            },
            payload,
        }
    }

    pub fn sender(&self) -> PodAddr {
        self.header.sender
    }

    pub fn msg_type(&self) -> MessageType {
        self.header.msg_type
    }

    /// Encode to a frame
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let len = HEADER_SIZE + self.header.msg_type.payload_len();
        if len > MAX_FRAME_SIZE {
            return Err(CodecError::TooLarge(len));
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.header.version);
        buf.put_u8(self.header.msg_type.to_byte());
        buf.put_u16_le(self.header.sequence);
        buf.put_u32_le(self.header.timestamp_us);
        buf.put_slice(&self.header.sender.0);
        self.payload.encode_into(&mut buf);

        Ok(buf.freeze())
    }

    /// Decode a frame
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(CodecError::TooLarge(frame.len()));
        }
        if frame.len() < HEADER_SIZE {
            return Err(CodecError::TooShort {
                expected: HEADER_SIZE,
                actual: frame.len(),
            });
        }

        let mut buf = &frame[..HEADER_SIZE];
        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(CodecError::BadVersion(version));
        }
        let msg_type = MessageType::from_byte(buf.get_u8())?;
        let sequence = buf.get_u16_le();
        let timestamp_us = buf.get_u32_le();
        let mut sender = [0u8; 6];
        buf.copy_to_slice(&mut sender);

        let payload = Payload::decode(msg_type, &frame[HEADER_SIZE..])?;

        Ok(Message {
            header: Header {
                version,
                msg_type,
                sequence,
                timestamp_us,
                sender: PodAddr(sender),
            },
            payload,
        })
    }
}
