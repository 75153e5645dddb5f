use flume::Sender;
use tracing::warn;

use super::{Sink, WindowOutput};

/// Forwards window results into a queue for downstream consumers
pub struct ChannelSink<K, R> {
    sender: Option<Sender<WindowOutput<K, R>>>,
}

impl<K, R> ChannelSink<K, R> {
    pub fn new(sender: Sender<WindowOutput<K, R>>) -> Self {
        Self {
            sender: Some(sender),
        }
    }
}

impl<K, R> Sink<K, R> for ChannelSink<K, R>
where
    K: 'static,
    R: 'static,
{
    fn emit(&mut self, output: WindowOutput<K, R>) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };
        if sender.send(output).is_err() {
            warn!("All receivers of the channel sink are gone, discarding further output");
            self.sender = None;
        }
    }

    /// Drops the sender, so receivers observe the end of the stream
    fn finish(&mut self) {
        self.sender = None;
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    #[test]
    fn forwards_and_closes() {
        let (tx, rx) = flume::unbounded();
        let mut sink = ChannelSink::new(tx);
        sink.emit(WindowOutput::new(0, vec![("a", 1)]));
        sink.emit(WindowOutput::new(1, vec![]));
        sink.finish();

        let received = rx.iter().collect_vec();
        assert_eq!(
            received,
            vec![WindowOutput::new(0, vec![("a", 1)]), WindowOutput::new(1, vec![])]
        );
    }

    #[test]
    fn dropped_receiver_is_not_fatal() {
        let (tx, rx) = flume::unbounded();
        drop(rx);
        let mut sink = ChannelSink::new(tx);
        sink.emit(WindowOutput::new(0, vec![("a", 1)]));
        sink.emit(WindowOutput::new(1, vec![("a", 2)]));
        assert!(sink.sender.is_none());
    }
}
