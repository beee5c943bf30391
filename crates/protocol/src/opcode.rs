//! Opcodes spoken by the DCP streaming core

/// Memcached / DCP opcodes the client sends or accepts
///
/// Anything outside this set is logged and dropped by the demultiplexer,
/// so new server-side opcodes never break the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    GetAllVbSeqnos = 0x48,
    DcpOpen = 0x50,
    DcpAddStream = 0x51,
    DcpCloseStream = 0x52,
    DcpStreamReq = 0x53,
    DcpGetFailoverLog = 0x54,
    DcpStreamEnd = 0x55,
    DcpSnapshotMarker = 0x56,
    DcpMutation = 0x57,
    DcpDeletion = 0x58,
    DcpExpiration = 0x59,
    DcpFlush = 0x5a,
    DcpSetVbucketState = 0x5b,
    DcpNoop = 0x5c,
    DcpBufferAck = 0x5d,
    DcpControl = 0x5e,
    DcpSystemEvent = 0x5f,
    DcpSeqnoAdvanced = 0x64,
    DcpOsoSnapshot = 0x65,
    GetCollectionsManifest = 0xba,
}

impl Opcode {
    /// Map a wire byte to a known opcode
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x20 => Self::SaslListMechs,
            0x21 => Self::SaslAuth,
            0x22 => Self::SaslStep,
            0x48 => Self::GetAllVbSeqnos,
            0x50 => Self::DcpOpen,
            0x51 => Self::DcpAddStream,
            0x52 => Self::DcpCloseStream,
            0x53 => Self::DcpStreamReq,
            0x54 => Self::DcpGetFailoverLog,
            0x55 => Self::DcpStreamEnd,
            0x56 => Self::DcpSnapshotMarker,
            0x57 => Self::DcpMutation,
            0x58 => Self::DcpDeletion,
            0x59 => Self::DcpExpiration,
            0x5a => Self::DcpFlush,
            0x5b => Self::DcpSetVbucketState,
            0x5c => Self::DcpNoop,
            0x5d => Self::DcpBufferAck,
            0x5e => Self::DcpControl,
            0x5f => Self::DcpSystemEvent,
            0x64 => Self::DcpSeqnoAdvanced,
            0x65 => Self::DcpOsoSnapshot,
            0xba => Self::GetCollectionsManifest,
            _ => return None,
        })
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> u8 {
        opcode as u8
    }
}
