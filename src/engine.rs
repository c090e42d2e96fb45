//! UCI engine client.
//!
//! Drives the line-oriented UCI dialog over TCP:
//!
//! 1. `uci` → wait for a line containing `uciok` (3 s)
//! 2. optional strength limiting via `setoption`
//! 3. `isready` → wait for `readyok` (2 s)
//! 4. `ucinewgame`, `position …`, `go movetime N`
//! 5. collect `info …` lines until `bestmove …` (think time + 5 s)
//!
//! Dialog timeouts are per-job errors, not breaker failures: an engine that
//! accepted the connection may merely be busy. The socket is owned by the
//! client and closed on every exit path when the client drops.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::job::MOVETIME_DEFAULT_MS;

/// TCP dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait budget for `uciok` after sending `uci`.
pub const UCIOK_TIMEOUT: Duration = Duration::from_secs(3);

/// Wait budget for `readyok` after sending `isready`.
pub const READYOK_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace added to the think time while waiting for `bestmove`.
pub const BESTMOVE_GRACE: Duration = Duration::from_secs(5);

/// Errors from the engine dialog.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("engine i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine closed the connection")]
    Disconnected,

    #[error("timeout waiting for {0}")]
    HandshakeTimeout(&'static str),

    #[error("timeout waiting for bestmove")]
    BestMoveTimeout,

    #[error("no bestmove received")]
    MissingBestMove,
}

/// Outcome of one `go movetime` computation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    /// Best move in coordinate notation, e.g. `e2e4`.
    pub bestmove: String,
    /// Expected reply, when the engine offered one.
    pub ponder: Option<String>,
    /// Raw `info …` lines emitted during the search, newline-joined.
    pub info: Option<String>,
}

/// A connected engine dialog.
#[derive(Debug)]
pub struct EngineClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl EngineClient {
    /// Dials the engine with a bounded timeout.
    pub async fn connect(addr: &str) -> Result<Self, EngineError> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| EngineError::ConnectTimeout(DIAL_TIMEOUT))??;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Runs the full dialog for one position and returns the analysis.
    ///
    /// An empty or whitespace FEN selects `position startpos`. A
    /// non-positive think time falls back to the default. `elo > 0` enables
    /// strength limiting.
    pub async fn analyse(
        &mut self,
        fen: &str,
        elo: i32,
        movetime_ms: i64,
    ) -> Result<Analysis, EngineError> {
        self.send("uci").await?;
        self.await_token("uciok", UCIOK_TIMEOUT).await?;

        if elo > 0 {
            self.send("setoption name UCI_LimitStrength value true")
                .await?;
            self.send(&format!("setoption name UCI_Elo value {}", elo))
                .await?;
        }

        self.send("isready").await?;
        self.await_token("readyok", READYOK_TIMEOUT).await?;

        self.send("ucinewgame").await?;

        if fen.trim().is_empty() {
            self.send("position startpos").await?;
        } else {
            self.send(&format!("position fen {}", fen)).await?;
        }

        let movetime = if movetime_ms <= 0 {
            MOVETIME_DEFAULT_MS
        } else {
            movetime_ms
        };
        self.send(&format!("go movetime {}", movetime)).await?;

        self.await_bestmove(Duration::from_millis(movetime as u64) + BESTMOVE_GRACE)
            .await
    }

    async fn send(&mut self, command: &str) -> Result<(), EngineError> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads one line, `None` at EOF. Trailing newline and whitespace are
    /// stripped.
    async fn read_line(&mut self) -> Result<Option<String>, std::io::Error> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    /// Reads lines until one contains `token`, within `timeout`.
    async fn await_token(
        &mut self,
        token: &'static str,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::HandshakeTimeout(token));
            }
            let line = tokio::time::timeout(remaining, self.read_line())
                .await
                .map_err(|_| EngineError::HandshakeTimeout(token))??;
            match line {
                Some(line) if line.contains(token) => return Ok(()),
                Some(_) => continue,
                None => return Err(EngineError::Disconnected),
            }
        }
    }

    /// Collects `info` lines until `bestmove` arrives, within `timeout`.
    async fn await_bestmove(&mut self, timeout: Duration) -> Result<Analysis, EngineError> {
        let deadline = Instant::now() + timeout;
        let mut info_lines: Vec<String> = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::BestMoveTimeout);
            }
            let line = tokio::time::timeout(remaining, self.read_line())
                .await
                .map_err(|_| EngineError::BestMoveTimeout)??;
            let Some(line) = line else {
                return Err(EngineError::Disconnected);
            };
            if line.is_empty() {
                continue;
            }
            if line.starts_with("info ") {
                info_lines.push(line);
                continue;
            }
            if line.starts_with("bestmove ") {
                let (bestmove, ponder) =
                    parse_bestmove(&line).ok_or(EngineError::MissingBestMove)?;
                let info = if info_lines.is_empty() {
                    None
                } else {
                    Some(info_lines.join("\n"))
                };
                return Ok(Analysis {
                    bestmove,
                    ponder,
                    info,
                });
            }
        }
    }
}

/// Parses a `bestmove` line into the move and optional ponder move.
///
/// Accepts `bestmove e2e4`, `bestmove e2e4 ponder e7e5`, and rejects a bare
/// `bestmove` with no move token.
pub fn parse_bestmove(line: &str) -> Option<(String, Option<String>)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 2 || fields[0] != "bestmove" || fields[1].is_empty() {
        return None;
    }
    let bestmove = fields[1].to_string();
    let ponder = match (fields.get(2), fields.get(3)) {
        (Some(&"ponder"), Some(mv)) => Some(mv.to_string()),
        _ => None,
    };
    Some((bestmove, ponder))
}

/// Health probe: dials the engine and checks it answers `uci` with `uciok`
/// inside `timeout`. Used by the worker's `/healthz`.
pub async fn probe(addr: &str, timeout: Duration) -> bool {
    let check = async {
        let stream = TcpStream::connect(addr).await.ok()?;
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"uci\n").await.ok()?;
        write_half.flush().await.ok()?;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader.read_line(&mut line).await.ok()?;
            if read == 0 {
                return None;
            }
            if line.contains("uciok") {
                return Some(());
            }
        }
    };

    tokio::time::timeout(timeout, check)
        .await
        .ok()
        .flatten()
        .is_some()
}
