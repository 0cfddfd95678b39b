//! Core types for the DOMES pod protocol

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Microseconds on some pod's clock. Which clock is always stated by the
/// caller: local (since boot) or network (master-relative).
pub type TimeUs = u64;

/// Milliseconds to microseconds
pub const fn ms(value: u64) -> TimeUs {
    value * 1_000
}

/// 6-byte radio address of a pod (the STA MAC on real hardware)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PodAddr(pub [u8; 6]);

impl PodAddr {
    /// Broadcast address of the medium
    pub const BROADCAST: PodAddr = PodAddr([0xFF; 6]);

    /// All-zero address, used on the wire for "no address"
    pub const NONE: PodAddr = PodAddr([0; 6]);

    /// Derive a stable, locally-administered address from a pod name.
    pub fn from_name(name: &str) -> Self {
        // FNV-1a, 64 bit
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in name.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let bytes = hash.to_be_bytes();
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&bytes[2..8]);
        addr[0] = (addr[0] & 0xFC) | 0x02;
        PodAddr(addr)
    }

    /// 16-bit pod id carried in event payloads (last two address bytes)
    pub fn short_id(&self) -> u16 {
        u16::from_be_bytes([self.0[4], self.0[5]])
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

impl fmt::Display for PodAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl FromStr for PodAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(format!("expected 6 octets, got {}", parts.len()));
        }
        let mut addr = [0u8; 6];
        for (slot, part) in addr.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16).map_err(|e| format!("bad octet {:?}: {}", part, e))?;
        }
        Ok(PodAddr(addr))
    }
}

impl Serialize for PodAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PodAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Election priority of a pod.
///
/// Ordered field by field: battery, then link quality, then uptime, then the
/// random tiebreak. Two pods drawing the same tiebreak are separated by their
/// address when ranked (see `election::Rank`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PriorityScore {
    /// Battery level, percent
    pub battery: u8,
    /// Link quality to the companion app, 0-255
    pub link_quality: u8,
    /// Seconds since boot
    pub uptime_s: u32,
    /// Random tiebreak drawn at boot
    pub tiebreak: u32,
}

impl PriorityScore {
    /// Create a score with a freshly drawn tiebreak
    pub fn new(battery: u8, link_quality: u8, uptime_s: u32) -> Self {
        Self {
            battery,
            link_quality,
            uptime_s,
            tiebreak: rand::thread_rng().gen(),
        }
    }

    pub fn with_tiebreak(battery: u8, link_quality: u8, uptime_s: u32, tiebreak: u32) -> Self {
        Self {
            battery,
            link_quality,
            uptime_s,
            tiebreak,
        }
    }
}

/// Information about a discovered peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub addr: PodAddr,
    pub priority: PriorityScore,
    /// Local time the peer was last heard from
    pub last_seen: TimeUs,
}

/// Election state of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ElectionState {
    /// Not participating
    #[default]
    Idle,
    /// Looking for peers and an existing master
    Discovering,
    /// Candidacy broadcast, collecting early rejects
    Campaigning,
    /// Candidacy window closed, last chance for votes
    WaitingForVotes,
    /// Elected coordinator
    Master,
    /// Deferring to a master
    Follower,
    /// Operator override
    ForcedMaster,
}

impl ElectionState {
    /// True for both kinds of master
    pub fn is_master(&self) -> bool {
        matches!(self, ElectionState::Master | ElectionState::ForcedMaster)
    }

    /// True while an election window is open
    pub fn is_electing(&self) -> bool {
        matches!(
            self,
            ElectionState::Discovering | ElectionState::Campaigning | ElectionState::WaitingForVotes
        )
    }
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElectionState::Idle => "idle",
            ElectionState::Discovering => "discovering",
            ElectionState::Campaigning => "campaigning",
            ElectionState::WaitingForVotes => "waiting-for-votes",
            ElectionState::Master => "master",
            ElectionState::Follower => "follower",
            ElectionState::ForcedMaster => "forced-master",
        };
        f.write_str(name)
    }
}

/// Why a master stepped down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResignReason {
    Shutdown,
    LowBattery,
    Operator,
    Other(u8),
}

impl ResignReason {
    pub fn to_byte(self) -> u8 {
        match self {
            ResignReason::Shutdown => 0,
            ResignReason::LowBattery => 1,
            ResignReason::Operator => 2,
            ResignReason::Other(code) => code,
        }
    }

    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => ResignReason::Shutdown,
            1 => ResignReason::LowBattery,
            2 => ResignReason::Operator,
            code => ResignReason::Other(code),
        }
    }
}

/// Visual effect parameters for a SET_EFFECT primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectParams {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    /// Pattern selector understood by the light driver (0 = solid)
    pub pattern: u8,
    /// Network time at which to start, 0 = immediately
    pub start_at: TimeUs,
}

impl EffectParams {
    pub fn solid(r: u8, g: u8, b: u8) -> Self {
        Self {
            r,
            g,
            b,
            pattern: 0,
            start_at: 0,
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.start_at != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_from_name_is_stable() {
        let a = PodAddr::from_name("pod-1");
        let b = PodAddr::from_name("pod-1");
        let c = PodAddr::from_name("pod-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        // locally administered, unicast
        assert_eq!(a.0[0] & 0x03, 0x02);
    }

    #[test]
    fn test_addr_display_parse() {
        let addr = PodAddr([0x02, 0xab, 0x00, 0x10, 0xfe, 0x01]);
        let text = addr.to_string();
        assert_eq!(text, "02:ab:00:10:fe:01");
        assert_eq!(text.parse::<PodAddr>().unwrap(), addr);
        assert!("02:ab".parse::<PodAddr>().is_err());
    }

    #[test]
    fn test_addr_serializes_as_string() {
        let addr = PodAddr([0x02, 0, 0, 0, 0, 0x0a]);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"02:00:00:00:00:0a\"");
        assert_eq!(serde_json::from_str::<PodAddr>(&json).unwrap(), addr);
    }

    #[test]
    fn test_short_id() {
        let addr = PodAddr([0, 0, 0, 0, 0x12, 0x34]);
        assert_eq!(addr.short_id(), 0x1234);
    }

    #[test]
    fn test_priority_order() {
        let low_battery = PriorityScore::with_tiebreak(20, 200, 1000, 9);
        let high_battery = PriorityScore::with_tiebreak(80, 10, 5, 1);
        assert!(high_battery > low_battery);

        let a = PriorityScore::with_tiebreak(50, 50, 50, 1);
        let b = PriorityScore::with_tiebreak(50, 50, 50, 2);
        assert!(b > a);
        assert_ne!(a.cmp(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn test_resign_reason_bytes() {
        for reason in [
            ResignReason::Shutdown,
            ResignReason::LowBattery,
            ResignReason::Operator,
            ResignReason::Other(42),
        ] {
            assert_eq!(ResignReason::from_byte(reason.to_byte()), reason);
        }
    }
}
