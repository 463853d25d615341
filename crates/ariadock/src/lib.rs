pub mod client;
pub mod protocol;

/// Environment variable overriding the daemon socket path.
pub const SOCKET_ENV: &str = "ARIADOCK_SOCKET";
