use std::{
    io::{self, BufRead, BufReader},
    mem,
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

use super::{file::decode_line, SourceError, SourceImpl, SourceReader, SourcePoll};

/// Upper bound on how long a single poll blocks waiting for data
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Connects to a TCP server and emits every line of text it sends.
/// The stream ends when the server closes the connection.
pub struct TcpLineSource {
    addr: String,
    connect_timeout: Duration,
}

impl TcpLineSource {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let mut last_err = io::Error::new(io::ErrorKind::InvalidInput, "address did not resolve");
        for addr in self.addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(READ_TIMEOUT))?;
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}

impl SourceImpl<String> for TcpLineSource {
    type Reader = TcpLineReader;

    fn open(&mut self) -> Result<Self::Reader, SourceError> {
        let stream = self.connect().map_err(|source| SourceError::Unavailable {
            feed: self.describe(),
            source,
        })?;
        Ok(TcpLineReader {
            stream: BufReader::new(stream),
            partial: Vec::new(),
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// Reader of a [TcpLineSource], yielding one record per line
pub struct TcpLineReader {
    stream: BufReader<TcpStream>,
    /// Bytes of the current line received so far. A read timing out keeps what it read here,
    /// including the leading bytes of a character split across segments.
    partial: Vec<u8>,
}

impl SourceReader<String> for TcpLineReader {
    fn poll(&mut self) -> Result<SourcePoll<String>, SourceError> {
        match self.stream.read_until(b'\n', &mut self.partial) {
            Ok(0) if self.partial.is_empty() => Ok(SourcePoll::Finished),
            // a complete line, or an unterminated one the peer closed the connection after
            Ok(_) => decode_line(mem::take(&mut self.partial)).map(SourcePoll::Ready),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(SourcePoll::Pending)
            }
            Err(e) => Err(SourceError::Read(e)),
        }
    }

    fn close(&mut self) {
        // the peer may already be gone
        let _ = self.stream.get_ref().shutdown(Shutdown::Both);
    }
}
