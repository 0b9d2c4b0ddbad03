//! One-way message transport
//!
//! A [`Pusher`] dials a peer and writes frames from an outbound channel; a
//! [`Puller`] listens and fans decoded frames into an inbound channel. Two
//! pairs pointed at each other form a request/response circuit between any
//! two endpoints. Neither side assumes the other is up: the pusher redials
//! forever with capped exponential backoff and both sides tolerate message
//! loss while disconnected.

mod frame;
mod puller;
mod pusher;

pub use frame::{FRAME_HEADER_LEN, decode_message, encode_frame, encode_message, read_frame, write_frame};
pub use puller::Puller;
pub use pusher::Pusher;

use crate::error::{Error, Result};

/// Extract the `host:port` part of a `tcp://host:port` URL
pub fn parse_url(url: &str) -> Result<String> {
    let addr = url
        .strip_prefix("tcp://")
        .ok_or_else(|| Error::Transport(format!("unsupported url ({url}), expected tcp://host:port")))?;
    if addr.is_empty() || !addr.contains(':') {
        return Err(Error::Transport(format!("invalid url ({url}), expected tcp://host:port")));
    }
    Ok(addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_accepts_tcp() {
        assert_eq!(parse_url("tcp://127.0.0.1:4400").unwrap(), "127.0.0.1:4400");
        assert_eq!(parse_url("tcp://broker.local:4400").unwrap(), "broker.local:4400");
    }

    #[test]
    fn test_parse_url_rejects_other_schemes() {
        assert!(parse_url("ipc:///tmp/broker.sock").is_err());
        assert!(parse_url("127.0.0.1:4400").is_err());
        assert!(parse_url("tcp://").is_err());
        assert!(parse_url("tcp://nohost").is_err());
    }
}
