//! Stable opcode table for the TCP and UDP wire protocol.
//!
//! Values are bit-exact with the existing, non-updatable game client and must never
//! be renumbered.

pub const PROTOCOL_VERSION: u16 = 202;

/// Reserved CarID used for synthetic, non-counting server messages (e.g. the
/// first-update leaderboard backfill).
pub const SERVER_CAR_ID: u8 = 0xFF;

// --- TCP opcodes (client -> server) ---
pub const TCP_HANDSHAKE_BEGIN: u8 = 0x3D;
pub const TCP_MESSAGE_CHECKSUM: u8 = 0x65;
pub const TCP_MESSAGE_DISCONNECT: u8 = 0x7A;
pub const TCP_MESSAGE_TYRE_CHANGE: u8 = 0x68;
pub const TCP_MANDATORY_PIT_COMPLETED: u8 = 0x6B;
pub const TCP_MESSAGE_PUSH_TO_PASS: u8 = 0x6C;
pub const TCP_MESSAGE_CHAT: u8 = 0x47;
pub const TCP_MESSAGE_ADMIN_COMMAND: u8 = 0x4C;
pub const TCP_MESSAGE_LAP_COMPLETED: u8 = 0x56;

// --- TCP opcodes (server -> client) ---
pub const TCP_HANDSHAKE_SUCCESS: u8 = 0x43;
pub const TCP_HANDSHAKE_UNSUPPORTED_PROTOCOL: u8 = 0x46;
pub const TCP_HANDSHAKE_BLOCK_LISTED: u8 = 0x4B;
pub const TCP_HANDSHAKE_WRONG_PASSWORD: u8 = 0x41;
pub const TCP_HANDSHAKE_SESSION_CLOSED: u8 = 0x42;
pub const TCP_HANDSHAKE_NO_SLOTS_AVAILABLE: u8 = 0x44;
pub const TCP_HANDSHAKE_AUTH_FAILED: u8 = 0x45;
pub const TCP_HANDSHAKE_STILL_BOOKING: u8 = 0x4A;
pub const TCP_CURRENT_SESSION_INFO: u8 = 0x4F;
pub const TCP_SESSION_START: u8 = 0x55;
pub const TCP_SESSION_COMPLETED: u8 = 0x59;
pub const TCP_CONNECTED_ENTRANTS: u8 = 0x4D;
pub const TCP_MANDATORY_PIT_COMPLETED_BROADCAST: u8 = 0x6B;
pub const TCP_MESSAGE_PUSH_TO_PASS_BROADCAST: u8 = 0x6C;

// --- Self-assigned TCP opcodes: first-update sequence extras with no opcode
// named explicitly in the wire table, slotted into unused byte values. ---
pub const TCP_MESSAGE_WEATHER: u8 = 0x70;
pub const TCP_MESSAGE_BOP: u8 = 0x71;
pub const TCP_MESSAGE_MOTD: u8 = 0x72;
pub const TCP_MESSAGE_FIXED_SETUP: u8 = 0x73;
pub const TCP_MESSAGE_DRS_ZONES: u8 = 0x74;

/// HandshakeFailedVariants: the set of opcodes a failed handshake may reply with,
/// grouped under one name per the wire table (they remain distinct byte values).
pub mod handshake_failed {
    pub use super::{
        TCP_HANDSHAKE_AUTH_FAILED as AUTH_FAILED, TCP_HANDSHAKE_BLOCK_LISTED as BLOCK_LISTED,
        TCP_HANDSHAKE_NO_SLOTS_AVAILABLE as NO_SLOTS_AVAILABLE,
        TCP_HANDSHAKE_SESSION_CLOSED as SESSION_CLOSED,
        TCP_HANDSHAKE_STILL_BOOKING as STILL_BOOKING,
        TCP_HANDSHAKE_UNSUPPORTED_PROTOCOL as UNSUPPORTED_PROTOCOL,
        TCP_HANDSHAKE_WRONG_PASSWORD as WRONG_PASSWORD,
    };
}

// --- UDP opcodes ---
pub const UDP_MESSAGE_CAR_UPDATE: u8 = 0x4F;
pub const UDP_MESSAGE_SESSION_INFO: u8 = 0x4A;
pub const UDP_MESSAGE_PING: u8 = 0xF8;
pub const UDP_MESSAGE_PONG: u8 = 0xF9;

/// Self-assigned: body is just the car's own `CarID`. Sent once by the client
/// right after a successful TCP handshake to bind its UDP source address to its
/// car, since `CarUpdate` itself carries no identifying field.
pub const UDP_HANDSHAKE_ASSOCIATE: u8 = 0xF7;

/// Status bitflags carried on `CarUpdate.status_bytes`.
pub const STATUS_HEADLIGHT_BIT: u32 = 0b100000;
pub const STATUS_DRS_BIT: u32 = 0b10000000000;
