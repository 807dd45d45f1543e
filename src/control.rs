//! Line-oriented control channel: schedule records are written one per line
//! as `id time size priority`; a line holding only the start code opens the
//! gate.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{ReplayError, Result};
use crate::replay::ReplayContext;
use crate::schedule::ScheduleRecord;

/// Start code: stop accepting the trace and begin delaying packets.
pub const CMD_FLOW_CONTROL: i64 = 723;

/// Bytes of a single write that are looked at.
const WRITE_LIMIT: usize = 512;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Record(ScheduleRecord),
    Start,
}

fn parse_record(input: &str) -> Option<ScheduleRecord> {
    let mut fields = input.split_whitespace();
    let id = fields.next()?.parse().ok()?;
    let release_time: u64 = fields.next()?.parse().ok()?;
    // times are compared on a signed millisecond clock
    if i64::try_from(release_time).is_err() {
        return None;
    }
    let size = fields.next()?.parse().ok()?;
    let priority = fields.next()?.parse().ok()?;
    Some(ScheduleRecord {
        id,
        release_time,
        size,
        priority,
    })
}

fn truncate_write(input: &str) -> &str {
    if input.len() <= WRITE_LIMIT {
        return input;
    }
    let mut end = WRITE_LIMIT;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

/// Parses one write. Four numeric fields make a record; otherwise a lone
/// start code is the only recognized command.
pub fn parse_command(input: &str) -> Result<ControlCommand> {
    let input = truncate_write(input);
    if let Some(record) = parse_record(input) {
        return Ok(ControlCommand::Record(record));
    }
    match input.split_whitespace().next().map(str::parse::<i64>) {
        Some(Ok(CMD_FLOW_CONTROL)) => Ok(ControlCommand::Start),
        _ => Err(ReplayError::MalformedControlInput(input.trim().to_string())),
    }
}

// ==========================================
// Channel bound to one replay run
// ==========================================
#[derive(Debug, Clone)]
pub struct ControlChannel {
    ctx: Arc<ReplayContext>,
}

impl ControlChannel {
    pub fn new(ctx: Arc<ReplayContext>) -> Self {
        Self { ctx }
    }

    /// Applies one write. Malformed input changes nothing and is only logged.
    pub fn write(&self, input: &str) -> Result<ControlCommand> {
        let command = match parse_command(input) {
            Ok(command) => command,
            Err(e) => {
                warn!("ignoring control input: {e}");
                return Err(e);
            }
        };
        match command {
            ControlCommand::Record(record) => self.ctx.load_record(record)?,
            ControlCommand::Start => self.ctx.start(),
        }
        Ok(command)
    }

    /// Applies one raw line. Blank lines and `#` comments yield `None`;
    /// bytes that are not UTF-8 count as malformed input.
    fn apply_line(&self, raw: &[u8]) -> Option<Result<ControlCommand>> {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim(),
            Err(_) => {
                let e = ReplayError::MalformedControlInput(
                    String::from_utf8_lossy(raw).trim().to_string(),
                );
                warn!("ignoring control input: {e}");
                return Some(Err(e));
            }
        };
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        Some(self.write(line))
    }

    /// Feeds every line of `reader` through [`ControlChannel::write`].
    /// Blank lines and `#` comments are skipped. Returns (applied, skipped).
    pub fn load<R: BufRead>(&self, mut reader: R) -> Result<(usize, usize)> {
        let mut applied = 0;
        let mut skipped = 0;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            match self.apply_line(&buf) {
                None => {}
                Some(Ok(_)) => applied += 1,
                Some(Err(ReplayError::MalformedControlInput(_))) => skipped += 1,
                Some(Err(e)) => return Err(e),
            }
        }
        if skipped > 0 {
            warn!("skipped {skipped} malformed control lines");
        }
        Ok((applied, skipped))
    }

    pub fn load_file(&self, path: &Path) -> Result<(usize, usize)> {
        let file = File::open(path)?;
        let (applied, skipped) = self.load(BufReader::new(file))?;
        info!(path = %path.display(), applied, skipped, "schedule file loaded");
        Ok((applied, skipped))
    }

    fn serve(&self, stream: UnixStream) {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let _ = self.apply_line(&buf);
                }
                Err(e) => {
                    warn!("control connection read failed: {e}");
                    break;
                }
            }
        }
        debug!("control connection closed");
    }
}

// ==========================================
// Unix socket front end
// ==========================================
/// A live connection: a clone of its stream for shutdown, and its thread.
type Connection = (UnixStream, JoinHandle<()>);

pub struct ControlServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    connections: Arc<Mutex<Vec<Connection>>>,
}

impl ControlServer {
    pub fn spawn(path: &Path, channel: ControlChannel) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale control socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        info!(path = %path.display(), "control channel listening");

        let stop = Arc::new(AtomicBool::new(false));
        let connections = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let stop = stop.clone();
            let connections = connections.clone();
            thread::Builder::new()
                .name("replay-control".into())
                .spawn(move || accept_loop(listener, channel, stop, connections))?
        };

        Ok(Self {
            path: path.to_path_buf(),
            stop,
            handle: Some(handle),
            connections,
        })
    }

    /// Stops accepting, hangs up on every open connection and waits for
    /// all control threads. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.join().is_err() {
            error!("control thread panicked");
        }

        let connections = std::mem::take(&mut *lock(&self.connections));
        for (stream, conn) in connections {
            let _ = stream.shutdown(Shutdown::Both);
            if conn.join().is_err() {
                error!("control connection thread panicked");
            }
        }
        let _ = fs::remove_file(&self.path);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(connections: &Mutex<Vec<Connection>>) -> MutexGuard<'_, Vec<Connection>> {
    connections.lock().unwrap_or_else(|e| e.into_inner())
}

fn accept_loop(
    listener: UnixListener,
    channel: ControlChannel,
    stop: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<Connection>>>,
) {
    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, _)) => {
                let peer = match stream.set_nonblocking(false).and_then(|()| stream.try_clone()) {
                    Ok(peer) => peer,
                    Err(e) => {
                        warn!("control connection setup failed: {e}");
                        continue;
                    }
                };
                let channel = channel.clone();
                let spawned = thread::Builder::new()
                    .name("replay-control-conn".into())
                    .spawn(move || channel.serve(stream));
                match spawned {
                    Ok(conn) => {
                        let mut connections = lock(&connections);
                        connections.retain(|(_, h)| !h.is_finished());
                        connections.push((peer, conn));
                    }
                    Err(e) => error!("cannot serve control connection: {e}"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                error!("control accept failed: {e}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::Ipv4Addr;
    use std::time::Instant;

    use super::*;
    use crate::ip_header::FingerprintOrder;

    fn channel() -> (Arc<ReplayContext>, ControlChannel) {
        let ctx = Arc::new(ReplayContext::new(
            Ipv4Addr::new(10, 0, 0, 2),
            FingerprintOrder::Network,
        ));
        (ctx.clone(), ControlChannel::new(ctx))
    }

    #[test]
    fn parses_record_fields() {
        assert_eq!(
            parse_command("48879 1700000000123 1448 -2\n").unwrap(),
            ControlCommand::Record(ScheduleRecord {
                id: 48879,
                release_time: 1_700_000_000_123,
                size: 1448,
                priority: -2,
            })
        );
    }

    #[test]
    fn start_code_only_as_lone_integer() {
        assert_eq!(parse_command("723").unwrap(), ControlCommand::Start);
        assert_eq!(parse_command("  723\n").unwrap(), ControlCommand::Start);
        assert!(matches!(
            parse_command("723 1 2 3").unwrap(),
            ControlCommand::Record(ScheduleRecord { id: 723, .. })
        ));
    }

    #[test]
    fn rejects_everything_else() {
        for bad in [
            "",
            "hello",
            "724",
            "1 2 3",
            "1 2 x 4",
            "-1 2 3 4",
            "1 9223372036854775808 60 0",
        ] {
            assert!(
                matches!(parse_command(bad), Err(ReplayError::MalformedControlInput(_))),
                "{bad:?}"
            );
        }
    }

    #[test]
    fn largest_signed_time_is_accepted() {
        assert!(matches!(
            parse_command("1 9223372036854775807 60 0").unwrap(),
            ControlCommand::Record(ScheduleRecord {
                release_time: 9_223_372_036_854_775_807,
                ..
            })
        ));
    }

    #[test]
    fn oversized_write_is_truncated() {
        let mut input = String::from("723");
        input.push_str(&" ".repeat(WRITE_LIMIT));
        input.push_str("garbage");
        assert_eq!(parse_command(&input).unwrap(), ControlCommand::Start);
    }

    #[test]
    fn write_loads_and_starts() {
        let (ctx, ch) = channel();
        ch.write("1 100 1500 0").unwrap();
        ch.write("2 150 1500 0").unwrap();
        assert!(ch.write("bogus").is_err());
        assert_eq!(ctx.store().len(), 2);
        assert!(!ctx.is_active());

        ch.write("723").unwrap();
        assert!(ctx.is_active());
    }

    #[test]
    fn load_counts_applied_and_skipped() {
        let (ctx, ch) = channel();
        let text = "# trace\n1 100 60 0\n\nnope\n2 120 60 1\n723\n";
        assert_eq!(ch.load(text.as_bytes()).unwrap(), (3, 1));
        assert_eq!(ctx.store().len(), 2);
        assert!(ctx.is_active());
    }

    #[test]
    fn invalid_utf8_line_is_skipped_during_load() {
        let (ctx, ch) = channel();
        let text: &[u8] = b"1 100 60 0\n\xff\xfe junk\n2 150 60 0\n723\n";
        assert_eq!(ch.load(text).unwrap(), (3, 1));
        assert_eq!(ctx.store().len(), 2);
        assert!(ctx.is_active());
    }

    fn socket_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nfq_replay_{tag}_{}.sock", std::process::id()))
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn invalid_utf8_line_keeps_the_connection_open() {
        let (ctx, ch) = channel();
        let path = socket_path("utf8");
        let mut server = ControlServer::spawn(&path, ch).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        client.write_all(b"\xff\n1 100 60 0\n2 150 60 0\n723\n").unwrap();
        drop(client);

        assert!(wait_until(|| ctx.is_active()));
        assert_eq!(ctx.store().len(), 2);
        server.stop();
    }

    #[test]
    fn stop_hangs_up_idle_clients() {
        let (ctx, ch) = channel();
        let path = socket_path("idle");
        let mut server = ControlServer::spawn(&path, ch).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        client.write_all(b"1 100 60 0\n").unwrap();
        assert!(wait_until(|| ctx.store().len() == 1));

        // client stays connected; stop must not wait on it
        let started = Instant::now();
        server.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(Arc::strong_count(&ctx), 1);

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn socket_accepts_lines() {
        let (ctx, ch) = channel();
        let path = socket_path("ctl");
        let mut server = ControlServer::spawn(&path, ch).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        client.write_all(b"1 100 60 0\n2 150 60 0\n723\n").unwrap();
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !ctx.is_active() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(ctx.is_active());
        assert_eq!(ctx.store().len(), 2);

        server.stop();
        server.stop();
        assert!(!path.exists());
    }
}
