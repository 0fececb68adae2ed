use bytes::Bytes;

/// Outbound side of a connection as seen by a [`SpliceUnit`](super::SpliceUnit).
///
/// Every method must return immediately. Implementations that run the
/// connection on its own task are expected to hand the operation over to that
/// task rather than perform I/O in place, since these methods are called from
/// the partner connection's callbacks.
///
/// Inbound events (data, end of input, inactivity, errors, writability
/// changes) are delivered the other way around, by calling the matching
/// callback on the unit attached to this adapter.
pub trait ChannelAdapter: Send + Sync {
    /// Queue `data` for writing. Nothing reaches the wire before [`flush`](Self::flush).
    fn write(&self, data: Bytes);

    fn flush(&self);

    /// Half-close: shut down the outbound direction once pending writes are out.
    fn close_output(&self);

    /// Terminate the connection in both directions.
    fn close(&self);

    /// Ask for one more batch of inbound data.
    fn read(&self);

    /// Withdraw an outstanding read demand, if any.
    fn stop_reading(&self);

    fn is_writable(&self) -> bool;
}
