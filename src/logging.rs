//! Thin `tracing` helpers shared by [`Reader`](crate::reader::Reader) and
//! [`Writer`](crate::writer::Writer) so every channel-lifecycle event carries
//! the same fields.

use tracing::Span;

/// A span covering one channel's construction, operation, and teardown.
///
/// Every event logged through a reader or writer is expected to happen inside
/// this span (entered once at construction and held for the value's
/// lifetime), so log lines never need to repeat `channel`/`role`/`pid`
/// by hand.
pub(crate) fn channel_span(channel: &str, role: &'static str) -> Span {
    tracing::debug_span!("zerobuffer_channel", channel, role, pid = std::process::id())
}
