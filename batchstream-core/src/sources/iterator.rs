use std::io;

use super::{SourceError, SourceImpl, SourceReader, SourcePoll};

/// A source which yields the values of an in-memory iterator.
///
/// The iterator is handed to the first reader opened; opening a second time reports the
/// source as unavailable.
///
/// # Example
/// ```rust
/// use batchstream::batcher::Batcher;
/// use batchstream::sources::{IteratorSource, PacedSource};
///
/// let batcher: Batcher<i32> = Batcher::new();
/// let handle = PacedSource::unpaced(IteratorSource::new(0..3))
///     .start(batcher.input())
///     .unwrap();
/// while !handle.is_finished() {
///     std::thread::yield_now();
/// }
/// handle.stop().unwrap();
/// assert_eq!(batcher.cut().len(), 3);
/// ```
pub struct IteratorSource<V>(Option<Box<dyn Iterator<Item = V> + Send>>);

impl<V> IteratorSource<V> {
    /// Create a new source from an iterable value
    pub fn new<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = V>,
        <I as IntoIterator>::IntoIter: Send + 'static,
    {
        Self(Some(Box::new(iter.into_iter())))
    }
}

impl<V> SourceImpl<V> for IteratorSource<V>
where
    V: Send + 'static,
{
    type Reader = IteratorReader<V>;

    fn open(&mut self) -> Result<Self::Reader, SourceError> {
        self.0
            .take()
            .map(IteratorReader)
            .ok_or_else(|| SourceError::Unavailable {
                feed: self.describe(),
                source: io::Error::other("iterator was already consumed"),
            })
    }

    fn describe(&self) -> String {
        "iterator".to_string()
    }
}

/// Reader of an [IteratorSource]
pub struct IteratorReader<V>(Box<dyn Iterator<Item = V> + Send>);

impl<V> SourceReader<V> for IteratorReader<V>
where
    V: Send + 'static,
{
    fn poll(&mut self) -> Result<SourcePoll<V>, SourceError> {
        Ok(self.0.next().map_or(SourcePoll::Finished, SourcePoll::Ready))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_then_finishes() {
        let mut source = IteratorSource::new(["x", "y"]);
        let mut reader = source.open().unwrap();
        assert_eq!(reader.poll().unwrap(), SourcePoll::Ready("x"));
        assert_eq!(reader.poll().unwrap(), SourcePoll::Ready("y"));
        assert_eq!(reader.poll().unwrap(), SourcePoll::Finished);
    }

    #[test]
    fn opens_only_once() {
        let mut source = IteratorSource::new(0..1);
        assert!(source.open().is_ok());
        assert!(matches!(
            source.open(),
            Err(SourceError::Unavailable { .. })
        ));
    }
}
