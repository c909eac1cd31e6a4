//! Control-connection dispatcher
//!
//! One loop per accepted connection, with its own service instance (and so
//! its own transfer handle). Service errors become `ERR` replies; a client
//! that sends something unrecognizable is disconnected without one.

use std::net::TcpListener;

use tracing::{debug, warn};

use crate::addr;
use crate::error::{EtdError, Result};
use crate::frame::{split_lines, LineBuf};
use crate::mode::OpenMode;
use crate::registry::{SharedState, TransferId};
use crate::server::EtdServer;
use crate::service::EtdService;
use crate::transport::{self, Channel, TcpChannel};

/// Commands are tiny; a client that fills this without completing one is
/// not speaking the protocol.
pub const CMD_BUF: usize = 2 * 1024;

enum Command<'a> {
    List(&'a str),
    WriteFile(&'a str, &'a str),
    ReadFile(&'a str, &'a str),
    DataChannelAddr,
    RemoveUuid(&'a str),
    SendFile(&'a str, &'a str, &'a str, &'a str),
    GetFile(&'a str, &'a str, &'a str, &'a str),
}

fn eq_icase(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// First whitespace-separated token and the remainder (leading whitespace
/// stripped).
fn split_token(s: &str) -> (&str, &str) {
    match s.find(|c: char| c.is_ascii_whitespace()) {
        Some(i) => (&s[..i], s[i..].trim_start()),
        None => (s, ""),
    }
}

fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn is_token(s: &str) -> bool {
    !s.is_empty() && !s.contains(char::is_whitespace)
}

/// Match one command line. `None` means the line matched nothing we know,
/// which is fatal for the connection.
fn parse_command(line: &str) -> Option<Command<'_>> {
    let (head, rest) = split_token(line);

    if eq_icase(head, "list") && !rest.is_empty() {
        return Some(Command::List(rest));
    }
    const WRITE_PREFIX: usize = "write-file-".len();
    if head.len() > WRITE_PREFIX
        && head
            .get(..WRITE_PREFIX)
            .is_some_and(|p| eq_icase(p, "write-file-"))
    {
        let mode = &head[WRITE_PREFIX..];
        if !rest.is_empty() {
            return Some(Command::WriteFile(mode, rest));
        }
    }
    if eq_icase(head, "read-file") {
        let (have, path) = split_token(rest);
        if is_decimal(have) && !path.is_empty() {
            return Some(Command::ReadFile(have, path));
        }
    }
    if eq_icase(head, "data-channel-addr") && rest.is_empty() {
        return Some(Command::DataChannelAddr);
    }
    if eq_icase(head, "remove-uuid") && is_token(rest) {
        return Some(Command::RemoveUuid(rest));
    }
    if eq_icase(head, "send-file") || eq_icase(head, "get-file") {
        let (src, rest) = split_token(rest);
        let (dst, rest) = split_token(rest);
        let (todo, addrs) = split_token(rest);
        if is_token(src) && is_token(dst) && is_decimal(todo) && is_token(addrs) {
            return Some(if eq_icase(head, "send-file") {
                Command::SendFile(src, dst, todo, addrs)
            } else {
                Command::GetFile(src, dst, todo, addrs)
            });
        }
    }
    None
}

fn parse_count(s: &str) -> Result<i64> {
    s.parse()
        .map_err(|_| EtdError::InvalidArgument(format!("'{s}' is not a byte count")))
}

/// Execute one command, producing the reply lines to emit.
fn run_command(server: &mut EtdServer, cmd: Command<'_>) -> Result<Vec<String>> {
    match cmd {
        Command::List(path) => {
            // remote listings never expand tildes
            let entries = server.list_path(path, false)?;
            let mut replies: Vec<String> = entries.iter().map(|e| format!("OK {e}")).collect();
            replies.push("OK".to_string());
            Ok(replies)
        }
        Command::WriteFile(mode, path) => {
            let grant = server.request_file_write(path, OpenMode::from_wire(mode)?)?;
            Ok(vec![
                format!("AlreadyHave:{}", grant.pos),
                format!("UUID:{}", grant.id),
                "OK".to_string(),
            ])
        }
        Command::ReadFile(have, path) => {
            let grant = server.request_file_read(path, parse_count(have)?)?;
            Ok(vec![
                format!("Remain:{}", grant.pos),
                format!("UUID:{}", grant.id),
                "OK".to_string(),
            ])
        }
        Command::DataChannelAddr => {
            let mut replies: Vec<String> = server
                .data_channel_addr()?
                .iter()
                .map(|a| format!("OK {a}"))
                .collect();
            replies.push("OK".to_string());
            Ok(replies)
        }
        Command::RemoveUuid(id) => {
            let id: TransferId = id.parse()?;
            Ok(vec![if server.remove_uuid(&id)? {
                "OK".to_string()
            } else {
                "ERR no such transfer".to_string()
            }])
        }
        Command::SendFile(src, dst, todo, addrs) => {
            let src: TransferId = src.parse()?;
            let dst: TransferId = dst.parse()?;
            let addrs = addr::parse_sockname_list(addrs)?;
            server.send_file(&src, &dst, parse_count(todo)?, &addrs)?;
            Ok(vec!["OK".to_string()])
        }
        Command::GetFile(src, dst, todo, addrs) => {
            let src: TransferId = src.parse()?;
            let dst: TransferId = dst.parse()?;
            let addrs = addr::parse_sockname_list(addrs)?;
            server.get_file(&src, &dst, parse_count(todo)?, &addrs)?;
            Ok(vec!["OK".to_string()])
        }
    }
}

/// Serve one control connection until the client disconnects or misbehaves.
pub fn handle(mut conn: Box<dyn Channel>, state: SharedState) -> Result<()> {
    let mut server = EtdServer::new(state);
    let mut buf = LineBuf::with_capacity(CMD_BUF);

    loop {
        if buf.is_full() {
            return Err(EtdError::Protocol(
                "command buffer filled without a complete command".to_string(),
            ));
        }
        let n = buf.fill(conn.as_mut())?;
        if n == 0 {
            if buf.is_empty() {
                debug!("control connection closed");
                return Ok(());
            }
            return Err(EtdError::ShortRead(
                "connection closed inside a command".to_string(),
            ));
        }

        let (lines, endpos) = split_lines(buf.data())?;
        for line in lines {
            debug!("command line '{line}'");
            let Some(cmd) = parse_command(line) else {
                // terminate without a reply
                return Err(EtdError::Protocol("client sent unknown command".to_string()));
            };
            let replies = match run_command(&mut server, cmd) {
                Ok(replies) => replies,
                Err(e) => vec![format!("ERR {e}")],
            };
            for reply in &replies {
                debug!("reply '{reply}'");
                transport::write_all(conn.as_mut(), reply.as_bytes())?;
                transport::write_all(conn.as_mut(), b"\n")?;
            }
        }
        buf.consume(endpos);
    }
}

/// Accept loop: one thread per control connection.
pub fn serve(listener: TcpListener, state: SharedState) {
    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                debug!("control connection from {peer}");
                let state = state.clone();
                std::thread::spawn(move || {
                    if let Err(e) = handle(Box::new(TcpChannel::new(stream)), state) {
                        warn!("control connection {peer}: {e}");
                    }
                });
            }
            Err(e) => warn!("control accept error: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedChannel;

    fn session(input: &str) -> (Result<()>, String) {
        let chan = ScriptedChannel::new(input.as_bytes(), 4096);
        let sink = chan.sink();
        let res = handle(Box::new(chan), SharedState::new());
        let out = String::from_utf8(sink.lock().clone()).unwrap();
        (res, out)
    }

    #[test]
    fn list_of_empty_dir_replies_bare_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let (res, out) = session(&format!("list {}/\n", tmp.path().display()));
        assert!(res.is_ok());
        assert_eq!(out, "OK\n");
    }

    #[test]
    fn write_file_reports_grant_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x");
        let (res, out) = session(&format!("write-file-2 {}\n", path.display()));
        assert!(res.is_ok());
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "AlreadyHave:0");
        assert!(lines[1].starts_with("UUID:"));
        assert_eq!(lines[2], "OK");
    }

    #[test]
    fn resume_reports_existing_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x");
        std::fs::write(&path, vec![0u8; 1024]).unwrap();
        let (res, out) = session(&format!("write-file-4 {}\n", path.display()));
        assert!(res.is_ok());
        assert!(out.starts_with("AlreadyHave:1024\n"));
    }

    #[test]
    fn read_file_reports_remainder() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x");
        std::fs::write(&path, vec![0u8; 2048]).unwrap();
        let (res, out) = session(&format!("read-file 512 {}\n", path.display()));
        assert!(res.is_ok());
        assert!(out.starts_with("Remain:1536\n"), "{out}");
    }

    #[test]
    fn service_errors_become_err_replies() {
        let (res, out) = session("write-file-2 \n");
        // empty path never parses as a command, so this is fatal instead
        assert!(res.is_err());
        assert_eq!(out, "");

        let tmp = tempfile::tempdir().unwrap();
        let (res, out) = session(&format!(
            "read-file 0 {}/does-not-exist\n",
            tmp.path().display()
        ));
        assert!(res.is_ok());
        assert!(out.starts_with("ERR i/o error:"), "{out}");
    }

    #[test]
    fn bad_open_mode_is_an_err_reply() {
        let (res, out) = session("write-file-banana /tmp/x\n");
        assert!(res.is_ok());
        assert!(out.starts_with("ERR invalid argument:"), "{out}");
    }

    #[test]
    fn unknown_command_terminates_without_reply() {
        let (res, out) = session("make-me-a-sandwich\n");
        assert!(res.is_err());
        assert_eq!(out, "");
    }

    #[test]
    fn remove_uuid_of_foreign_handle_is_an_err_reply() {
        let (res, out) = session("remove-uuid not-ours\n");
        assert!(res.is_ok());
        assert!(out.starts_with("ERR invalid argument:"), "{out}");
    }

    #[test]
    fn data_channel_addr_lists_advertised_sockets() {
        let state = SharedState::new();
        state.advertise(crate::addr::SockName::new("tcp", "files.example.com", 9000));
        let chan = ScriptedChannel::new(b"data-channel-addr\n", 4096);
        let sink = chan.sink();
        handle(Box::new(chan), state).unwrap();
        assert_eq!(
            String::from_utf8(sink.lock().clone()).unwrap(),
            "OK <tcp/files.example.com:9000>\nOK\n"
        );
    }

    #[test]
    fn commands_are_case_insensitive() {
        let tmp = tempfile::tempdir().unwrap();
        let (res, out) = session(&format!("LIST {}/\n", tmp.path().display()));
        assert!(res.is_ok());
        assert_eq!(out, "OK\n");
    }
}
