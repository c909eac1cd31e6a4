//! Data-connection handler: header, mode gate, bulk byte loops

use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpListener;

use tracing::{debug, warn};

use crate::addr::SockName;
use crate::error::{EtdError, Result};
use crate::frame;
use crate::mode::OpenMode;
use crate::registry::{SharedState, TransferId};
use crate::transport::{self, Channel, TcpChannel};

/// Scratch buffer for bulk copies.
pub const DATA_BUF_SIZE: usize = 10 * 1024 * 1024;

/// A header must appear in the first 4 KiB or the peer is not going to
/// send one.
pub const HEADER_WINDOW: usize = 4 * 1024;

/// Serve one data connection: read the header, lock the referenced
/// transfer, move the bytes, exchange the ack. Repeats for further headers
/// on the same connection; a peer close at a header boundary ends the loop.
pub fn handle(mut conn: Box<dyn Channel>, state: SharedState) -> Result<()> {
    let mut buf = vec![0u8; DATA_BUF_SIZE];
    let mut cur = 0usize;

    loop {
        let hdr_end = loop {
            if let Some(end) = frame::find_header(&buf[..cur])? {
                break end;
            }
            if cur >= HEADER_WINDOW {
                return Err(EtdError::Protocol(
                    "no complete header within the first 4 KiB".to_string(),
                ));
            }
            let n = conn.read(&mut buf[cur..HEADER_WINDOW])?;
            if n == 0 {
                if cur == 0 {
                    return Ok(());
                }
                return Err(EtdError::ShortRead(
                    "connection closed inside a header".to_string(),
                ));
            }
            cur += n;
        };

        let kv = frame::parse_header(&buf[..hdr_end])?;
        let id: TransferId = kv
            .get("uuid")
            .ok_or_else(|| EtdError::Protocol("no uuid was sent".to_string()))?
            .parse()?;
        let sz: i64 = kv
            .get("sz")
            .ok_or_else(|| EtdError::Protocol("no amount was sent".to_string()))?
            .parse()
            .map_err(|_| EtdError::Protocol("sz is not a byte count".to_string()))?;
        if sz < 0 {
            return Err(EtdError::Protocol("sz is not a byte count".to_string()));
        }
        let push = match kv.get("push").map(String::as_str) {
            None => false,
            Some("1") => true,
            Some(_) => {
                return Err(EtdError::Protocol(
                    "push keyword may only take one specific value".to_string(),
                ))
            }
        };
        debug!("data header: uuid={id} sz={sz} push={push}");

        // The mode gate runs after the lock is won; checking earlier would
        // just repeat the test on every back-off round.
        let outcome = state.with_locked(&id, |transfer, file| {
            if push {
                if transfer.mode != OpenMode::Read {
                    return Err(EtdError::InvalidArgument(format!(
                        "transfer mode {} is not compatible with a push request",
                        transfer.mode
                    )));
                }
                push_n(sz as u64, file, conn.as_mut(), &mut buf)?;
                Ok((0, 0))
            } else {
                if !transfer.mode.is_data_writable() {
                    return Err(EtdError::InvalidArgument(format!(
                        "transfer mode {} is not compatible with a pull request",
                        transfer.mode
                    )));
                }
                pull_n(sz as u64, conn.as_mut(), file, &mut buf, hdr_end, cur)
            }
        });
        let (rd, end) = outcome.ok_or_else(|| {
            EtdError::InvalidArgument("no transfer associated with the UUID".to_string())
        })??;

        // surplus bytes past the payload start the next header
        buf.copy_within(rd..end, 0);
        cur = end - rd;
    }
}

/// Stream `n` bytes file -> connection, then wait for the receiver's ack.
fn push_n(mut n: u64, file: &mut File, conn: &mut dyn Channel, buf: &mut [u8]) -> Result<()> {
    while n > 0 {
        let c = (buf.len() as u64).min(n) as usize;
        file.read_exact(&mut buf[..c])
            .map_err(|e| EtdError::io("read from file", e))?;
        transport::write_all(conn, &buf[..c])?;
        n -= c as u64;
    }
    let mut ack = [0u8; 1];
    transport::read_exact(conn, &mut ack)?;
    Ok(())
}

/// Stream `n` bytes connection -> file, then ack with one byte. Bytes in
/// `buf[rd..end]` arrived together with the header and belong to the
/// payload; they are flushed first. Returns the buffered range left over
/// for the next command.
fn pull_n(
    mut n: u64,
    conn: &mut dyn Channel,
    file: &mut File,
    buf: &mut [u8],
    mut rd: usize,
    end: usize,
) -> Result<(usize, usize)> {
    if rd < end {
        let take = ((end - rd) as u64).min(n) as usize;
        file.write_all(&buf[rd..rd + take])
            .map_err(|e| EtdError::io("write to file", e))?;
        n -= take as u64;
        rd += take;
    }
    if n > 0 {
        // buffered bytes exhausted, the whole buffer is free again
        debug_assert_eq!(rd, end);
        while n > 0 {
            let want = (buf.len() as u64).min(n) as usize;
            let m = conn.read(&mut buf[..want])?;
            if m == 0 {
                return Err(EtdError::ShortRead(format!(
                    "{n} payload bytes still expected"
                )));
            }
            file.write_all(&buf[..m])
                .map_err(|e| EtdError::io("write to file", e))?;
            n -= m as u64;
        }
        rd = end;
    }
    transport::write_all(conn, b"y")?;
    Ok((rd, end))
}

/// Accept loop: one thread per data connection.
pub fn serve(listener: TcpListener, state: SharedState) {
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                debug!("data connection from {peer}");
                let state = state.clone();
                std::thread::spawn(move || {
                    if let Err(e) = handle(Box::new(TcpChannel::new(stream)), state) {
                        warn!("data connection {peer}: {e}");
                    }
                });
            }
            Err(e) => warn!("data accept error: {e}"),
        }
    }
}

/// Bind a data listener, advertise it in the shared state and serve it on a
/// background thread. When the bind address is a wildcard the advertised
/// host falls back to the machine's outbound IP.
pub fn spawn_listener(
    state: &SharedState,
    bind: &SockName,
    advertise_host: Option<&str>,
) -> Result<SockName> {
    let (listener, bound) = transport::bind_listener(bind)?;
    let host = match advertise_host {
        Some(h) => h.to_string(),
        None => match bound.host.parse::<std::net::IpAddr>() {
            Ok(ip) if ip.is_unspecified() => transport::local_ip()?.to_string(),
            _ => bound.host.clone(),
        },
    };
    let advertised = SockName::new("tcp", host, bound.port);
    state.advertise(advertised.clone());
    let state = state.clone();
    std::thread::spawn(move || serve(listener, state));
    Ok(advertised)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::OpenMode;
    use crate::registry::Transfer;
    use crate::transport::testing::ScriptedChannel;
    use std::sync::Arc;

    fn register(
        state: &SharedState,
        path: &std::path::Path,
        mode: OpenMode,
        file: File,
    ) -> TransferId {
        let id = TransferId::generate();
        state
            .lock()
            .transfers
            .insert(id.clone(), Arc::new(Transfer::new(path.into(), mode, file)));
        id
    }

    #[test]
    fn pull_writes_payload_and_acks() {
        let tmp = tempfile::tempdir().unwrap();
        let state = SharedState::new();
        let path = tmp.path().join("out");
        let file = OpenMode::New.open_options().open(&path).unwrap();
        let id = register(&state, &path, OpenMode::New, file);

        // header and payload arrive in one read
        let wire = format!("{{ uuid:{id}, sz:6}}012345");
        let chan = ScriptedChannel::new(wire.as_bytes(), 4096);
        let sink = chan.sink();
        handle(Box::new(chan), state).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"012345");
        assert_eq!(sink.lock().as_slice(), b"y");
    }

    #[test]
    fn push_streams_file_to_connection() {
        let tmp = tempfile::tempdir().unwrap();
        let state = SharedState::new();
        let path = tmp.path().join("src");
        std::fs::write(&path, b"012345").unwrap();
        let file = OpenMode::Read.open_options().open(&path).unwrap();
        let id = register(&state, &path, OpenMode::Read, file);

        let wire = format!("{{ uuid:{id}, push:1, sz:6}}y");
        // chunked reads keep the trailing ack out of the header read
        let header_len = wire.len() - 1;
        let chan = ScriptedChannel::new(wire.as_bytes(), header_len);
        let sink = chan.sink();
        handle(Box::new(chan), state).unwrap();
        assert_eq!(sink.lock().as_slice(), b"012345");
    }

    #[test]
    fn push_against_write_record_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let state = SharedState::new();
        let path = tmp.path().join("w");
        let file = OpenMode::New.open_options().open(&path).unwrap();
        let id = register(&state, &path, OpenMode::New, file);

        let wire = format!("{{ uuid:{id}, push:1, sz:1}}");
        let err = handle(Box::new(ScriptedChannel::new(wire.as_bytes(), 4096)), state).unwrap_err();
        assert!(matches!(err, EtdError::InvalidArgument(_)));
    }

    #[test]
    fn bad_push_value_is_a_protocol_error() {
        let state = SharedState::new();
        let wire = b"{ uuid:x-1, push:2, sz:1}";
        let err = handle(Box::new(ScriptedChannel::new(wire, 4096)), state).unwrap_err();
        assert!(matches!(err, EtdError::Protocol(_)));
    }

    #[test]
    fn unknown_uuid_is_rejected() {
        let state = SharedState::new();
        let wire = b"{ uuid:ghost, sz:1}";
        let err = handle(Box::new(ScriptedChannel::new(wire, 4096)), state).unwrap_err();
        assert!(matches!(err, EtdError::InvalidArgument(_)));
    }

    #[test]
    fn non_header_start_is_a_protocol_error() {
        let state = SharedState::new();
        let err = handle(
            Box::new(ScriptedChannel::new(b"GET / HTTP/1.1\r\n", 4096)),
            state,
        )
        .unwrap_err();
        assert!(matches!(err, EtdError::Protocol(_)));
    }

    #[test]
    fn immediate_close_is_clean() {
        let state = SharedState::new();
        assert!(handle(Box::new(ScriptedChannel::new(b"", 4096)), state).is_ok());
    }
}
