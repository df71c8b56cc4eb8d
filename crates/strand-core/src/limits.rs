//! Size and concurrency limits with their default values.

/// Largest RPC message body accepted by the reassembler (4 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Messages buffered on the producer side of a client-streaming call
/// before `send` suspends.
pub const DEFAULT_PRODUCER_BUFFER_DEPTH: usize = 100;

/// Connections a server accepts before rejecting with `resource_exhausted`.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Streams a server serves per connection before rejecting.
pub const DEFAULT_MAX_STREAMS_PER_CONNECTION: usize = 100;

/// Tunable limits shared by clients and servers.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_message_size: usize,
    pub producer_buffer_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            producer_buffer_depth: DEFAULT_PRODUCER_BUFFER_DEPTH,
        }
    }
}
