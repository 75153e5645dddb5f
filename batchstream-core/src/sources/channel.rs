use std::io;

use flume::{Receiver, TryRecvError};

use super::{SourceError, SourceImpl, SourceReader, SourcePoll};

/// A source reading values from a queue.
/// The stream ends once every sender of the channel has been dropped.
pub struct ChannelSource<V> {
    receiver: Receiver<V>,
}

impl<V> ChannelSource<V> {
    pub fn new(receiver: Receiver<V>) -> Self {
        Self { receiver }
    }
}

impl<V> SourceImpl<V> for ChannelSource<V>
where
    V: Send + 'static,
{
    type Reader = ChannelReader<V>;

    fn open(&mut self) -> Result<Self::Reader, SourceError> {
        if self.receiver.is_disconnected() && self.receiver.is_empty() {
            return Err(SourceError::Unavailable {
                feed: self.describe(),
                source: io::Error::from(io::ErrorKind::NotConnected),
            });
        }
        Ok(ChannelReader {
            receiver: self.receiver.clone(),
        })
    }

    fn describe(&self) -> String {
        "channel".to_string()
    }
}

/// Reader of a [ChannelSource]
pub struct ChannelReader<V> {
    receiver: Receiver<V>,
}

impl<V> SourceReader<V> for ChannelReader<V>
where
    V: Send + 'static,
{
    fn poll(&mut self) -> Result<SourcePoll<V>, SourceError> {
        match self.receiver.try_recv() {
            Ok(v) => Ok(SourcePoll::Ready(v)),
            Err(TryRecvError::Empty) => Ok(SourcePoll::Pending),
            Err(TryRecvError::Disconnected) => Ok(SourcePoll::Finished),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_until_dropped() {
        let (tx, rx) = flume::unbounded();
        let mut reader = ChannelSource::new(rx).open().unwrap();
        assert_eq!(reader.poll().unwrap(), SourcePoll::Pending);
        tx.send(7).unwrap();
        assert_eq!(reader.poll().unwrap(), SourcePoll::Ready(7));
        drop(tx);
        assert_eq!(reader.poll().unwrap(), SourcePoll::Finished);
    }

    #[test]
    fn disconnected_is_unavailable() {
        let (tx, rx) = flume::unbounded::<i32>();
        drop(tx);
        assert!(matches!(
            ChannelSource::new(rx).open(),
            Err(SourceError::Unavailable { .. })
        ));
    }
}
