/// Errors returned by the local API surface of stream components.
///
/// Peer-reported errors travel as plain `i32` codes on the wire and are
/// surfaced through callbacks; this enum covers only local call failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The component has been shut down and rejects all further calls.
    #[error("component is shut down")]
    ShutDown,

    /// A receive is already outstanding on this receiver.
    #[error("a receive is already outstanding")]
    ReceiveOutstanding,

    /// A cancellation is already pending on this sender.
    #[error("a cancellation is already pending")]
    CancelPending,

    /// Frames must carry at least one byte.
    #[error("cannot send an empty frame")]
    EmptyFrame,

    /// The frame does not fit the wire's 32-bit length field.
    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(usize),

    /// The channel to the peer was lost.
    #[error("channel to the peer was lost")]
    ChannelLost,
}

pub type Result<T> = std::result::Result<T, StreamError>;
