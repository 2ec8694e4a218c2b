//! TCP server for lap timing sessions.
//!
//! Every accepted connection carries one request: it is decoded, applied
//! to the shared lap register, answered with the full scoreboard and then
//! closed.

use crate::config::Config;
use crate::protocol::{encode_scoreboard, parse_request, ParseResult, Request};
use crate::race::{LapRegister, ScoreEntry};
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    register: Arc<LapRegister>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let register = LapRegister::new(config.ordering);
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            register,
            connection_limit,
        }
    }

    /// Bind the listening socket. Failure here is fatal for the process.
    pub fn bind(&self) -> io::Result<TcpListener> {
        let addr: SocketAddr = self.config.listen.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid listen address '{}': {}", self.config.listen, e),
            )
        })?;
        TcpListener::from_std(create_listener(addr)?)
    }

    /// Bind and begin accepting connections
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept connections on `listener`, one task per connection
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Server listening");

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let register = Arc::clone(&self.register);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, register).await {
                            debug!(peer = %addr, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Get a reference to the register for testing
    #[cfg(test)]
    pub fn register(&self) -> &Arc<LapRegister> {
        &self.register
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind at once.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// Per-connection session state
#[derive(Debug)]
enum Session {
    /// Accumulating bytes until a whole request is buffered
    AwaitingRequest,
    /// A request has been decoded and must be applied
    Processing(Request),
    /// The scoreboard goes out and the connection closes
    RespondingAndClose(Vec<ScoreEntry>),
    /// Undecodable input; wait for the peer to go away
    Ignoring,
}

/// Handle a single client connection
pub async fn handle_connection<S>(
    mut stream: S,
    register: Arc<LapRegister>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut session = Session::AwaitingRequest;

    loop {
        session = match session {
            Session::AwaitingRequest => match parse_request(&buffer) {
                ParseResult::Complete(request, consumed) => {
                    if consumed < buffer.len() {
                        trace!(extra = buffer.len() - consumed, "Ignoring bytes after request");
                    }
                    Session::Processing(request)
                }
                ParseResult::Incomplete => {
                    let n = stream.read_buf(&mut buffer).await?;
                    if n == 0 {
                        if !buffer.is_empty() {
                            debug!(buffered = buffer.len(), "Connection closed mid-request");
                        }
                        return Ok(());
                    }
                    Session::AwaitingRequest
                }
                ParseResult::Error(e) => {
                    warn!(error = %e, "Ignoring malformed request");
                    Session::Ignoring
                }
            },

            Session::Processing(request) => {
                Session::RespondingAndClose(apply_request(&register, &request))
            }

            Session::RespondingAndClose(scoreboard) => {
                let response = encode_scoreboard(&scoreboard);
                stream.write_all(&response).await?;
                stream.flush().await?;
                stream.shutdown().await?;
                debug!(entries = scoreboard.len(), "Scores sent");
                return Ok(());
            }

            Session::Ignoring => {
                buffer.clear();
                let n = stream.read_buf(&mut buffer).await?;
                if n == 0 {
                    trace!("Connection closed by client");
                    return Ok(());
                }
                Session::Ignoring
            }
        };
    }
}

/// Register every crossing in `request`, then snapshot the scoreboard
pub fn apply_request(register: &LapRegister, request: &Request) -> Vec<ScoreEntry> {
    match request {
        Request::SaveMeasurement(crossing) => {
            register.register_crossing(crossing.competitor_id, crossing.timestamp_millis);
        }
        Request::GetScores(crossings) => {
            for crossing in crossings {
                register.register_crossing(crossing.competitor_id, crossing.timestamp_millis);
            }
        }
    }

    let stats = register.stats();
    debug!(
        crossings = request.crossing_count(),
        total_crossings = stats.crossings,
        competitors = stats.competitors,
        active = stats.active_competitors,
        "Processed request"
    );

    register.snapshot_scoreboard()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ScoresClient;
    use crate::config::Command;
    use crate::protocol::Crossing;
    use crate::race::OrderingPolicy;
    use std::time::Duration;

    fn test_config() -> Config {
        Config {
            command: Command::Serve,
            listen: "127.0.0.1:0".to_string(),
            workers: None,
            max_connections: 16,
            connect_timeout: Duration::from_secs(3),
            ordering: OrderingPolicy::Accept,
            log_level: "info".to_string(),
        }
    }

    /// Start a server on an ephemeral port and return a client for it
    fn spawn_server() -> (Arc<LapRegister>, ScoresClient) {
        let server = Server::new(test_config());
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let register = Arc::clone(server.register());

        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        (
            register,
            ScoresClient::new(addr.to_string(), Duration::from_secs(3)),
        )
    }

    #[test]
    fn test_server_creation() {
        let server = Server::new(test_config());
        assert_eq!(server.register().stats().competitors, 0);
    }

    #[test]
    fn test_apply_request() {
        let register = LapRegister::new(OrderingPolicy::Accept);

        let scoreboard = apply_request(
            &register,
            &Request::GetScores(vec![
                Crossing::new(7, 0),
                Crossing::new(7, 61_000),
                Crossing::new(7, 119_000),
                Crossing::new(7, 200_000),
            ]),
        );
        assert_eq!(
            scoreboard,
            vec![ScoreEntry {
                competitor_id: 7,
                best_lap_millis: 58_000,
                average_lap_millis: 66_666,
            }]
        );

        let scoreboard =
            apply_request(&register, &Request::SaveMeasurement(Crossing::new(3, 5_000)));
        assert_eq!(scoreboard.len(), 1);
        assert_eq!(scoreboard[0].competitor_id, 7);
    }

    #[tokio::test]
    async fn test_session_save_measurement_alone() {
        let register = LapRegister::new(OrderingPolicy::Accept);
        let request = Request::SaveMeasurement(Crossing::new(3, 5_000)).encode();

        let stream = tokio_test::io::Builder::new()
            .read(&request)
            .write(&encode_scoreboard(&[]))
            .build();

        handle_connection(stream, Arc::clone(&register)).await.unwrap();
        assert_eq!(register.record(3).unwrap().last_crossing_millis, 5_000);
    }

    #[tokio::test]
    async fn test_session_split_request() {
        let register = LapRegister::new(OrderingPolicy::Accept);
        register.register_crossing(1, 0);
        let request = Request::GetScores(vec![Crossing::new(1, 30_000)]).encode();

        let expected = encode_scoreboard(&[ScoreEntry {
            competitor_id: 1,
            best_lap_millis: 30_000,
            average_lap_millis: 30_000,
        }]);
        let stream = tokio_test::io::Builder::new()
            .read(&request[..3])
            .read(&request[3..])
            .write(&expected)
            .build();

        handle_connection(stream, register).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_truncated_request() {
        let register = LapRegister::new(OrderingPolicy::Accept);
        let request = Request::SaveMeasurement(Crossing::new(3, 5_000)).encode();

        // No write expected: the peer hangs up before the request completes
        let stream = tokio_test::io::Builder::new().read(&request[..6]).build();

        handle_connection(stream, Arc::clone(&register)).await.unwrap();
        assert!(register.record(3).is_none());
    }

    #[tokio::test]
    async fn test_session_unknown_tag() {
        let register = LapRegister::new(OrderingPolicy::Accept);

        let stream = tokio_test::io::Builder::new()
            .read(&[9, 0, 0, 0, 1])
            .read(&[0, 0, 0, 0, 0, 0, 0, 0])
            .build();

        handle_connection(stream, Arc::clone(&register)).await.unwrap();
        assert_eq!(register.stats().crossings, 0);
    }

    #[tokio::test]
    async fn test_end_to_end_scoreboard() {
        let (register, client) = spawn_server();

        let scoreboard = client.send_measurement(3, 5_000).await.unwrap();
        assert!(scoreboard.is_empty());

        let scoreboard = client
            .get_scores(vec![
                Crossing::new(7, 0),
                Crossing::new(7, 61_000),
                Crossing::new(7, 119_000),
                Crossing::new(7, 200_000),
            ])
            .await
            .unwrap();
        assert_eq!(
            scoreboard,
            vec![ScoreEntry {
                competitor_id: 7,
                best_lap_millis: 58_000,
                average_lap_millis: 66_666,
            }]
        );

        let mut scoreboard = client.send_measurement(3, 65_000).await.unwrap();
        scoreboard.sort_by_key(|e| e.competitor_id);
        assert_eq!(scoreboard.len(), 2);
        assert_eq!(scoreboard[0].competitor_id, 3);
        assert_eq!(scoreboard[0].best_lap_millis, 60_000);

        assert_eq!(register.stats().crossings, 6);
    }

    #[tokio::test]
    async fn test_concurrent_clients() {
        let (register, client) = spawn_server();

        let tasks: Vec<_> = (0..10)
            .map(|id| {
                let client = client.clone();
                tokio::spawn(async move {
                    client
                        .get_scores(vec![Crossing::new(id, 0), Crossing::new(id, 1_000 + id as i64)])
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let snapshot = register.snapshot_scoreboard();
        assert_eq!(snapshot.len(), 10);
        for entry in snapshot {
            assert_eq!(entry.best_lap_millis, 1_000 + entry.competitor_id as i64);
        }
    }

    #[tokio::test]
    async fn test_end_to_end_import() {
        let (_register, client) = spawn_server();
        let path = std::env::temp_dir()
            .join(format!("lap-board-import-{}.csv", std::process::id()));
        std::fs::write(&path, "1,00:01:00\n2,bad\n1,00:02:30\n3,00:02:30\n").unwrap();

        let scoreboard = client.import_file(&path).await;
        let _ = std::fs::remove_file(&path);

        assert_eq!(
            scoreboard.unwrap(),
            vec![ScoreEntry {
                competitor_id: 1,
                best_lap_millis: 90_000,
                average_lap_millis: 90_000,
            }]
        );
    }

    #[tokio::test]
    async fn test_largest_batch_is_answered() {
        let (register, client) = spawn_server();
        let crossings: Vec<_> = (0..crate::protocol::MAX_ENTRIES as i64)
            .map(|i| Crossing::new(5, i * 1_000))
            .collect();

        let scoreboard = tokio::time::timeout(Duration::from_secs(10), client.get_scores(crossings))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scoreboard.len(), 1);
        assert_eq!(scoreboard[0].best_lap_millis, 1_000);
        assert_eq!(register.stats().crossings, crate::protocol::MAX_ENTRIES as u64);
    }

    #[test]
    fn test_bind_invalid_address() {
        let mut config = test_config();
        config.listen = "not-an-address".to_string();
        let err = Server::new(config).bind().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
