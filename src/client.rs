//! Client side of the lap timing protocol.
//!
//! Every call opens a fresh connection, sends one request and reads the
//! scoreboard until the server closes the connection. Failures are
//! reported once; nothing is retried.

use crate::protocol::{
    parse_scoreboard, Crossing, ParseError, ParseResult, Request, MAX_ENTRIES,
};
use crate::race::{CompetitorId, ScoreEntry};
use crate::timing_file;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

/// Errors from a single client request
#[derive(Debug)]
pub enum ClientError {
    /// Server refused or is unreachable
    Connect(String, io::Error),
    /// Server did not accept within the bounded wait
    ConnectTimeout(String, Duration),
    /// Connection broke while sending or receiving
    Io(io::Error),
    /// Connection closed before a whole scoreboard arrived
    TruncatedResponse(usize),
    /// Scoreboard bytes could not be decoded
    MalformedResponse(ParseError),
    /// Timing file could not be read
    FileRead(PathBuf, io::Error),
    /// Batch larger than the server accepts in one request
    TooManyCrossings(usize),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Connect(addr, e) => write!(f, "Failed to connect to {}: {}", addr, e),
            ClientError::ConnectTimeout(addr, timeout) => {
                write!(f, "Timed out connecting to {} after {:?}", addr, timeout)
            }
            ClientError::Io(e) => write!(f, "Connection error: {}", e),
            ClientError::TruncatedResponse(len) => {
                write!(f, "Server closed the connection after {} bytes", len)
            }
            ClientError::MalformedResponse(e) => write!(f, "Malformed response: {}", e),
            ClientError::FileRead(path, e) => {
                write!(f, "Failed to read timing file '{}': {}", path.display(), e)
            }
            ClientError::TooManyCrossings(count) => {
                write!(f, "Too many crossings: {} (max {})", count, MAX_ENTRIES)
            }
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

/// Issues requests against one lap server
#[derive(Debug, Clone)]
pub struct ScoresClient {
    addr: String,
    connect_timeout: Duration,
}

impl ScoresClient {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }

    /// Register one crossing and return the resulting scoreboard
    pub async fn send_measurement(
        &self,
        competitor_id: CompetitorId,
        timestamp_millis: i64,
    ) -> Result<Vec<ScoreEntry>, ClientError> {
        debug!(competitor_id, timestamp_millis, "Sending measurement");
        self.request(Request::SaveMeasurement(Crossing::new(
            competitor_id,
            timestamp_millis,
        )))
        .await
    }

    /// Register a batch of crossings in order and return the scoreboard
    pub async fn get_scores(
        &self,
        crossings: Vec<Crossing>,
    ) -> Result<Vec<ScoreEntry>, ClientError> {
        if crossings.len() > MAX_ENTRIES as usize {
            return Err(ClientError::TooManyCrossings(crossings.len()));
        }
        debug!(crossings = crossings.len(), "Requesting scores");
        self.request(Request::GetScores(crossings)).await
    }

    /// Read a timing file and send all of its valid crossings
    pub async fn import_file(&self, path: &Path) -> Result<Vec<ScoreEntry>, ClientError> {
        let crossings = timing_file::read_timing_file(path)
            .map_err(|e| ClientError::FileRead(path.to_path_buf(), e))?;
        info!(path = %path.display(), crossings = crossings.len(), "Read timing file");
        self.get_scores(crossings).await
    }

    async fn connect(&self) -> Result<TcpStream, ClientError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ClientError::Connect(self.addr.clone(), e)),
            Err(_) => Err(ClientError::ConnectTimeout(
                self.addr.clone(),
                self.connect_timeout,
            )),
        }
    }

    async fn request(&self, request: Request) -> Result<Vec<ScoreEntry>, ClientError> {
        let mut stream = self.connect().await?;
        if let Ok(peer) = stream.peer_addr() {
            trace!(%peer, "Connected to server");
        }

        stream.write_all(&request.encode()).await?;
        stream.flush().await?;

        // The server closes the connection once the scoreboard is written
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;

        match parse_scoreboard(&response) {
            ParseResult::Complete(entries, _) => {
                debug!(entries = entries.len(), "Received scores");
                Ok(entries)
            }
            ParseResult::Incomplete => Err(ClientError::TruncatedResponse(response.len())),
            ParseResult::Error(e) => Err(ClientError::MalformedResponse(e)),
        }
    }
}
