//! Remote service: speaks the control protocol to a far-end server
//!
//! Replies are parsed out of a bounded buffer; a reply that does not fit,
//! repeats a field, flips between `OK` and `ERR` mid-stream or leaves
//! unparsed bytes behind is a protocol error, never silently dropped.

use tracing::debug;

use crate::addr::{self, SockName};
use crate::error::{EtdError, Result};
use crate::frame::{split_lines, LineBuf};
use crate::mode::OpenMode;
use crate::registry::TransferId;
use crate::service::{EtdService, TransferGrant};
use crate::transport::{self, Channel};

/// Reply buffer for single- and few-line replies.
const SHORT_REPLY_BUF: usize = 2 * 1024;
/// Reply buffer for `list`, which can return many entries per batch.
const LIST_REPLY_BUF: usize = 16 * 1024;

pub struct EtdProxy {
    uuid: TransferId,
    conn: Box<dyn Channel>,
}

impl EtdProxy {
    pub fn new(conn: Box<dyn Channel>) -> Self {
        EtdProxy {
            uuid: TransferId::generate(),
            conn,
        }
    }
}

/// One `OK`/`ERR` line, payload trimmed of the separating whitespace.
enum ReplyLine<'a> {
    Ok(Option<&'a str>),
    Err(Option<&'a str>),
}

fn strip_prefix_icase<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

/// The tail of a reply line after its status tag: either nothing, or
/// whitespace followed by the payload. Anything else fails the match.
fn reply_payload(rest: &str) -> Option<Option<&str>> {
    if rest.is_empty() {
        return Some(None);
    }
    if rest.starts_with(|c: char| c.is_ascii_whitespace()) {
        let payload = rest.trim_start();
        return Some(if payload.is_empty() { None } else { Some(payload) });
    }
    None
}

fn parse_reply(line: &str) -> Option<ReplyLine<'_>> {
    if let Some(rest) = strip_prefix_icase(line, "OK") {
        if let Some(payload) = reply_payload(rest) {
            return Some(ReplyLine::Ok(payload));
        }
    }
    if let Some(rest) = strip_prefix_icase(line, "ERR") {
        if let Some(payload) = reply_payload(rest) {
            return Some(ReplyLine::Err(payload));
        }
    }
    None
}

fn parse_uuid_field(line: &str) -> Option<Result<TransferId>> {
    let rest = strip_prefix_icase(line, "UUID:")?;
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        return None;
    }
    Some(rest.parse())
}

fn parse_int_field(line: &str, prefix: &str, signed: bool) -> Option<i64> {
    let rest = strip_prefix_icase(line, prefix)?;
    let digits = if signed {
        rest.strip_prefix('-').unwrap_or(rest)
    } else {
        rest
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

fn remote_error(info: Option<&str>) -> EtdError {
    EtdError::from_remote(info.unwrap_or("<unknown reason>"))
}

impl EtdProxy {
    fn send_command(&mut self, msg: &str) -> Result<()> {
        debug!("sending command '{}'", msg.trim_end());
        transport::write_all(self.conn.as_mut(), msg.as_bytes())
    }

    /// Collect an `OK <entry>` stream closed by a bare `OK` sentinel.
    fn collect_stream(&mut self, msg: &str, bufsz: usize) -> Result<Vec<String>> {
        self.send_command(msg)?;
        let mut buf = LineBuf::with_capacity(bufsz);
        let mut entries = Vec::new();
        let mut finished = false;

        while !finished {
            if buf.is_full() {
                return Err(EtdError::Protocol(
                    "reply buffer filled without a complete reply".to_string(),
                ));
            }
            if buf.fill(self.conn.as_mut())? == 0 {
                return Err(EtdError::ShortRead(
                    "failed to read data from remote end".to_string(),
                ));
            }
            let (lines, endpos) = split_lines(buf.data())?;
            for line in lines {
                if finished {
                    return Err(EtdError::Protocol(
                        "unprocessed lines of reply after the end sentinel".to_string(),
                    ));
                }
                match parse_reply(line) {
                    Some(ReplyLine::Ok(None)) => finished = true,
                    Some(ReplyLine::Ok(Some(info))) => entries.push(info.to_string()),
                    Some(ReplyLine::Err(info)) => {
                        if entries.is_empty() {
                            return Err(remote_error(info));
                        }
                        // it was OK, OK, ... and now it is not
                        return Err(EtdError::Protocol(
                            "the server changed its mind in the middle of the reply".to_string(),
                        ));
                    }
                    None => {
                        return Err(EtdError::Protocol(format!(
                            "server replied with an invalid line: '{line}'"
                        )))
                    }
                }
            }
            buf.consume(endpos);
        }
        if !buf.is_empty() {
            return Err(EtdError::Protocol(
                "unconsumed reply bytes left in the input".to_string(),
            ));
        }
        Ok(entries)
    }

    /// Collect a transfer grant: a `UUID:` field, one position field, and a
    /// closing `OK`, in any order; or a single `ERR`.
    fn collect_grant(
        &mut self,
        msg: &str,
        pos_prefix: &str,
        pos_signed: bool,
    ) -> Result<TransferGrant> {
        self.send_command(msg)?;
        let mut buf = LineBuf::with_capacity(SHORT_REPLY_BUF);
        let mut id: Option<TransferId> = None;
        let mut pos: Option<i64> = None;
        let mut outcome: Option<(bool, Option<String>)> = None;

        while outcome.is_none() {
            if buf.is_full() {
                return Err(EtdError::Protocol(
                    "reply buffer filled without a complete reply".to_string(),
                ));
            }
            if buf.fill(self.conn.as_mut())? == 0 {
                return Err(EtdError::ShortRead(
                    "failed to read data from remote end".to_string(),
                ));
            }
            let (lines, endpos) = split_lines(buf.data())?;
            for line in lines {
                if outcome.is_some() {
                    return Err(EtdError::Protocol(
                        "unprocessed lines of reply after completion".to_string(),
                    ));
                }
                if let Some(parsed) = parse_uuid_field(line) {
                    if id.replace(parsed?).is_some() {
                        return Err(EtdError::Protocol(
                            "the server sent a UUID twice".to_string(),
                        ));
                    }
                } else if let Some(v) = parse_int_field(line, pos_prefix, pos_signed) {
                    if pos.replace(v).is_some() {
                        return Err(EtdError::Protocol(
                            "the server sent a file position twice".to_string(),
                        ));
                    }
                } else {
                    match parse_reply(line) {
                        Some(ReplyLine::Ok(info)) => {
                            outcome = Some((true, info.map(str::to_string)))
                        }
                        Some(ReplyLine::Err(info)) => {
                            outcome = Some((false, info.map(str::to_string)))
                        }
                        None => {
                            return Err(EtdError::Protocol(format!(
                                "the server sent a reply that was not recognized: '{line}'"
                            )))
                        }
                    }
                }
            }
            buf.consume(endpos);
        }
        if !buf.is_empty() {
            return Err(EtdError::Protocol(
                "unconsumed reply bytes left in the input".to_string(),
            ));
        }
        match outcome {
            Some((true, _)) => match (id, pos) {
                (Some(id), Some(pos)) => Ok(TransferGrant { id, pos }),
                _ => Err(EtdError::Protocol(
                    "the server did not send all required fields".to_string(),
                )),
            },
            Some((false, info)) => Err(remote_error(info.as_deref())),
            None => unreachable!(),
        }
    }

    /// Collect exactly one `OK`/`ERR` line.
    fn collect_single(&mut self, msg: &str) -> Result<(bool, Option<String>)> {
        self.send_command(msg)?;
        let mut buf = LineBuf::with_capacity(SHORT_REPLY_BUF);
        loop {
            if buf.is_full() {
                return Err(EtdError::Protocol(
                    "reply buffer filled without a complete reply".to_string(),
                ));
            }
            if buf.fill(self.conn.as_mut())? == 0 {
                return Err(EtdError::ShortRead(
                    "failed to read data from remote end".to_string(),
                ));
            }
            let (lines, endpos) = split_lines(buf.data())?;
            if lines.is_empty() {
                continue;
            }
            if lines.len() > 1 {
                return Err(EtdError::Protocol(
                    "the server sent the wrong number of responses".to_string(),
                ));
            }
            let reply = match parse_reply(lines[0]) {
                Some(ReplyLine::Ok(info)) => (true, info.map(str::to_string)),
                Some(ReplyLine::Err(info)) => (false, info.map(str::to_string)),
                None => {
                    return Err(EtdError::Protocol(format!(
                        "the server sent a non-conforming response: '{}'",
                        lines[0]
                    )))
                }
            };
            buf.consume(endpos);
            if !buf.is_empty() {
                return Err(EtdError::Protocol(
                    "unconsumed reply bytes left in the input".to_string(),
                ));
            }
            return Ok(reply);
        }
    }
}

impl EtdService for EtdProxy {
    fn uuid(&self) -> &TransferId {
        &self.uuid
    }

    // tilde expansion is never requested from the remote side
    fn list_path(&mut self, path: &str, _allow_tilde: bool) -> Result<Vec<String>> {
        if path.is_empty() {
            // an empty path would not even parse as a command over there
            return Err(EtdError::InvalidArgument(
                "listing an empty path is not allowed".to_string(),
            ));
        }
        self.collect_stream(&format!("list {path}\n"), LIST_REPLY_BUF)
    }

    fn request_file_write(&mut self, path: &str, mode: OpenMode) -> Result<TransferGrant> {
        self.collect_grant(
            &format!("write-file-{} {path}\n", mode.to_wire()),
            "AlreadyHave:",
            false,
        )
    }

    fn request_file_read(&mut self, path: &str, already_have: i64) -> Result<TransferGrant> {
        self.collect_grant(
            &format!("read-file {already_have} {path}\n"),
            "Remain:",
            true,
        )
    }

    fn data_channel_addr(&mut self) -> Result<Vec<SockName>> {
        let entries = self.collect_stream("data-channel-addr\n", SHORT_REPLY_BUF)?;
        entries
            .iter()
            .map(|e| {
                e.parse().map_err(|_| {
                    EtdError::Protocol(format!("the server sent an invalid data address: '{e}'"))
                })
            })
            .collect()
    }

    fn remove_uuid(&mut self, id: &TransferId) -> Result<bool> {
        match self.collect_single(&format!("remove-uuid {id}\n"))? {
            (true, _) => Ok(true),
            // the fixed encoding of a false return
            (false, Some(info)) if info == "no such transfer" => Ok(false),
            (false, info) => Err(remote_error(info.as_deref())),
        }
    }

    fn send_file(
        &mut self,
        src: &TransferId,
        dst: &TransferId,
        todo: i64,
        addrs: &[SockName],
    ) -> Result<bool> {
        if addrs.is_empty() {
            return Err(EtdError::AllAddressesFailed(
                "no data addresses given".to_string(),
            ));
        }
        let msg = format!(
            "send-file {src} {dst} {todo} {}\n",
            addr::format_sockname_list(addrs)
        );
        match self.collect_single(&msg)? {
            (true, _) => Ok(true),
            (false, info) => Err(remote_error(info.as_deref())),
        }
    }

    fn get_file(
        &mut self,
        src: &TransferId,
        dst: &TransferId,
        todo: i64,
        addrs: &[SockName],
    ) -> Result<bool> {
        if addrs.is_empty() {
            return Err(EtdError::AllAddressesFailed(
                "no data addresses given".to_string(),
            ));
        }
        let msg = format!(
            "get-file {src} {dst} {todo} {}\n",
            addr::format_sockname_list(addrs)
        );
        match self.collect_single(&msg)? {
            (true, _) => Ok(true),
            (false, info) => Err(remote_error(info.as_deref())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::ScriptedChannel;

    fn proxy(reply: &str, chunk: usize) -> (EtdProxy, std::sync::Arc<parking_lot::Mutex<Vec<u8>>>) {
        let chan = ScriptedChannel::new(reply.as_bytes(), chunk);
        let sink = chan.sink();
        (EtdProxy::new(Box::new(chan)), sink)
    }

    #[test]
    fn write_grant_parses_fields_in_any_order() {
        let (mut p, sink) = proxy("AlreadyHave:0\nUUID:abc-123\nOK\n", 7);
        let grant = p.request_file_write("/tmp/x", OpenMode::OverWrite).unwrap();
        assert_eq!(grant.id.as_str(), "abc-123");
        assert_eq!(grant.pos, 0);
        assert_eq!(sink.lock().as_slice(), b"write-file-2 /tmp/x\n");
    }

    #[test]
    fn resume_grant_reports_on_disk_bytes() {
        let (mut p, sink) = proxy("UUID:abc-124\nAlreadyHave:1024\nOK\n", 64);
        let grant = p.request_file_write("/tmp/x", OpenMode::Resume).unwrap();
        assert_eq!(grant.pos, 1024);
        assert_eq!(sink.lock().as_slice(), b"write-file-4 /tmp/x\n");
    }

    #[test]
    fn read_grant_parses_remain() {
        let (mut p, sink) = proxy("Remain:1536\nUUID:abc-125\nOK\n", 64);
        let grant = p.request_file_read("/tmp/x", 512).unwrap();
        assert_eq!(grant.id.as_str(), "abc-125");
        assert_eq!(grant.pos, 1536);
        assert_eq!(sink.lock().as_slice(), b"read-file 512 /tmp/x\n");
    }

    #[test]
    fn negative_remain_is_carried() {
        let (mut p, _) = proxy("Remain:-12\nUUID:u\nOK\n", 64);
        assert_eq!(p.request_file_read("/tmp/x", 512).unwrap().pos, -12);
    }

    #[test]
    fn list_of_empty_dir_is_empty() {
        let (mut p, sink) = proxy("OK\n", 64);
        assert!(p.list_path("/empty/", false).unwrap().is_empty());
        assert_eq!(sink.lock().as_slice(), b"list /empty/\n");
    }

    #[test]
    fn list_collects_entries_until_sentinel() {
        let (mut p, _) = proxy("OK /tmp/a\r\nOK /tmp/b/\nOK\n", 5);
        assert_eq!(
            p.list_path("/tmp/", false).unwrap(),
            vec!["/tmp/a".to_string(), "/tmp/b/".to_string()]
        );
    }

    #[test]
    fn list_err_carries_the_remote_kind() {
        let (mut p, _) = proxy("ERR invalid argument: bad glob pattern\n", 64);
        assert!(matches!(
            p.list_path("/[", false),
            Err(EtdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn empty_list_path_fails_before_the_wire() {
        let (mut p, sink) = proxy("", 64);
        assert!(matches!(
            p.list_path("", false),
            Err(EtdError::InvalidArgument(_))
        ));
        assert!(sink.lock().is_empty());
    }

    #[test]
    fn mid_stream_flip_is_a_protocol_error() {
        let (mut p, _) = proxy("OK /tmp/a\nERR it broke\n", 64);
        assert!(matches!(
            p.list_path("/tmp/", false),
            Err(EtdError::Protocol(_))
        ));
    }

    #[test]
    fn duplicate_uuid_field_is_a_protocol_error() {
        let (mut p, _) = proxy("UUID:a\nUUID:b\nOK\n", 64);
        assert!(matches!(
            p.request_file_write("/x", OpenMode::New),
            Err(EtdError::Protocol(_))
        ));
    }

    #[test]
    fn missing_field_is_a_protocol_error() {
        let (mut p, _) = proxy("UUID:a\nOK\n", 64);
        assert!(matches!(
            p.request_file_write("/x", OpenMode::New),
            Err(EtdError::Protocol(_))
        ));
    }

    #[test]
    fn unrecognized_line_is_a_protocol_error() {
        let (mut p, _) = proxy("HELLO there\n", 64);
        assert!(matches!(
            p.request_file_write("/x", OpenMode::New),
            Err(EtdError::Protocol(_))
        ));
    }

    #[test]
    fn residual_bytes_are_a_protocol_error() {
        let (mut p, _) = proxy("OK\ntrailing", 64);
        assert!(matches!(
            p.list_path("/tmp/", false),
            Err(EtdError::Protocol(_))
        ));
    }

    #[test]
    fn remote_path_conflict_is_rebuilt() {
        let (mut p, _) = proxy("ERR path conflict: /tmp/x is already in use\n", 64);
        let err = p.request_file_write("/tmp/x", OpenMode::New).unwrap_err();
        assert!(matches!(err, EtdError::PathConflict(_)));
    }

    #[test]
    fn remove_uuid_decodes_the_false_sentinel() {
        let (mut p, _) = proxy("ERR no such transfer\n", 64);
        let id = p.uuid().clone();
        assert_eq!(p.remove_uuid(&id).unwrap(), false);

        let (mut p, sink) = proxy("OK\n", 64);
        let id = p.uuid().clone();
        assert_eq!(p.remove_uuid(&id).unwrap(), true);
        assert_eq!(sink.lock().as_slice(), format!("remove-uuid {id}\n").as_bytes());
    }

    #[test]
    fn data_channel_addr_parses_designators() {
        let (mut p, _) = proxy("OK <tcp/files.example.com:9000>\nOK\n", 64);
        let addrs = p.data_channel_addr().unwrap();
        assert_eq!(addrs, vec![SockName::new("tcp", "files.example.com", 9000)]);
    }

    #[test]
    fn send_file_formats_the_address_list() {
        let (mut p, sink) = proxy("OK\n", 64);
        let src = p.uuid().clone();
        let dst: TransferId = "peer-1".parse().unwrap();
        let addrs = [
            SockName::new("tcp", "a.example", 1),
            SockName::new("tcp", "b.example", 2),
        ];
        assert!(p.send_file(&src, &dst, 42, &addrs).unwrap());
        let sent = String::from_utf8(sink.lock().clone()).unwrap();
        assert_eq!(
            sent,
            format!("send-file {src} peer-1 42 <tcp/a.example:1>,<tcp/b.example:2>\n")
        );
    }

    #[test]
    fn reply_case_is_insensitive() {
        let (mut p, _) = proxy("ok /tmp/a\nOk\n", 64);
        assert_eq!(p.list_path("/tmp/", false).unwrap(), vec!["/tmp/a"]);
    }
}
