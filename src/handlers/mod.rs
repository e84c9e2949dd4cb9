mod handshake;

pub use self::handshake::{
    AtCommand, DebugRoute, HandshakeConfig, HandshakeHandler, HandshakeMode, HandshakeProgress,
    HandshakeStart, LINE_TERMINATOR,
};
