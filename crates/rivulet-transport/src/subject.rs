//! Subject naming for inter-node replication.
//!
//! Stream leaders advertise inboxes derived from the stream identity and the
//! leader epoch, so followers of a past epoch address a subject nobody is
//! listening on rather than a new leader.

use rivulet_common::{Epoch, StreamId};

/// Fetch inbox served by the leader of `stream` for `epoch`.
pub fn replication_inbox(stream: &StreamId, epoch: Epoch) -> String {
    format!("replicate.{}.{}.{}", stream.subject, stream.name, epoch)
}

/// Epoch handshake inbox served by the current leader of `stream`.
pub fn epoch_inbox(stream: &StreamId) -> String {
    format!("epoch.{}.{}", stream.subject, stream.name)
}

/// Subject clients publish stream messages to.
pub fn publish_subject(stream_subject: &str) -> String {
    stream_subject.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_naming() {
        let stream = StreamId::new("foo", "bar");
        assert_eq!(replication_inbox(&stream, 3), "replicate.foo.bar.3");
        assert_eq!(epoch_inbox(&stream), "epoch.foo.bar");
        assert_eq!(publish_subject("foo"), "foo");
    }

    #[test]
    fn test_epoch_changes_fetch_inbox() {
        let stream = StreamId::new("foo", "bar");
        assert_ne!(replication_inbox(&stream, 1), replication_inbox(&stream, 2));
    }
}
