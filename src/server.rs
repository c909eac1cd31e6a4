//! Local service: filesystem + registry
//!
//! An instance of this runs inside the daemon behind every control
//! connection, and inside the client whenever one end of the transfer is a
//! local path.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tracing::debug;

use crate::addr::SockName;
use crate::data::DATA_BUF_SIZE;
use crate::error::{EtdError, Result};
use crate::mode::OpenMode;
use crate::pathutil;
use crate::registry::{SharedState, Transfer, TransferId};
use crate::service::{EtdService, TransferGrant};
use crate::transport;

pub struct EtdServer {
    uuid: TransferId,
    state: SharedState,
}

impl EtdServer {
    pub fn new(state: SharedState) -> Self {
        EtdServer {
            uuid: TransferId::generate(),
            state,
        }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }
}

impl Drop for EtdServer {
    // a dying service takes its registration with it
    fn drop(&mut self) {
        self.state.remove(&self.uuid);
    }
}

impl EtdService for EtdServer {
    fn uuid(&self) -> &TransferId {
        &self.uuid
    }

    fn list_path(&mut self, path: &str, allow_tilde: bool) -> Result<Vec<String>> {
        pathutil::list_path(path, allow_tilde)
    }

    fn request_file_write(&mut self, path: &str, mode: OpenMode) -> Result<TransferGrant> {
        if !mode.is_write_mode() {
            return Err(EtdError::InvalidArgument(format!(
                "invalid open mode for a write request on '{path}'"
            )));
        }
        let npath = pathutil::normalize_path(path)?;

        // conflict check, open and insert are one atomic step
        let mut state = self.state.lock();
        if state.transfers.contains_key(&self.uuid) {
            return Err(EtdError::AlreadyBusy(
                "this service already owns a transfer".to_string(),
            ));
        }
        if state.path_registered(&npath) {
            return Err(EtdError::PathConflict(format!(
                "{} is already in use",
                npath.display()
            )));
        }
        if let Some(parent) = npath.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EtdError::io(format!("create {}", parent.display()), e))?;
        }
        let mut file = mode
            .open_options()
            .open(&npath)
            .map_err(|e| EtdError::io(format!("open {}", npath.display()), e))?;
        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|e| EtdError::io(format!("seek {}", npath.display()), e))? as i64;
        state
            .transfers
            .insert(self.uuid.clone(), Arc::new(Transfer::new(npath, mode, file)));
        debug!("registered write transfer {} ({mode}), {size} bytes on disk", self.uuid);
        Ok(TransferGrant {
            id: self.uuid.clone(),
            pos: size,
        })
    }

    fn request_file_read(&mut self, path: &str, already_have: i64) -> Result<TransferGrant> {
        if already_have < 0 {
            return Err(EtdError::InvalidArgument(format!(
                "negative resume offset {already_have}"
            )));
        }
        let npath = pathutil::normalize_path(path)?;

        let mut state = self.state.lock();
        if state.transfers.contains_key(&self.uuid) {
            return Err(EtdError::AlreadyBusy(
                "this service already owns a transfer".to_string(),
            ));
        }
        // multiple readers may share a path; any writer excludes us
        if state.path_registered_non_read(&npath) {
            return Err(EtdError::PathConflict(format!(
                "{} is already in use",
                npath.display()
            )));
        }
        let mut file = OpenMode::Read
            .open_options()
            .open(&npath)
            .map_err(|e| EtdError::io(format!("open {}", npath.display()), e))?;
        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|e| EtdError::io(format!("seek {}", npath.display()), e))? as i64;
        file.seek(SeekFrom::Start(already_have as u64)).map_err(|e| {
            EtdError::io(
                format!(
                    "cannot seek to position {already_have} in {}",
                    npath.display()
                ),
                e,
            )
        })?;
        state.transfers.insert(
            self.uuid.clone(),
            Arc::new(Transfer::new(npath, OpenMode::Read, file)),
        );
        debug!("registered read transfer {}, {} bytes remain", self.uuid, size - already_have);
        Ok(TransferGrant {
            id: self.uuid.clone(),
            pos: size - already_have,
        })
    }

    fn data_channel_addr(&mut self) -> Result<Vec<SockName>> {
        Ok(self.state.data_addrs())
    }

    fn remove_uuid(&mut self, id: &TransferId) -> Result<bool> {
        if *id != self.uuid {
            return Err(EtdError::InvalidArgument(
                "cannot remove someone else's transfer".to_string(),
            ));
        }
        Ok(self.state.remove(id))
    }

    fn send_file(
        &mut self,
        src: &TransferId,
        dst: &TransferId,
        todo: i64,
        addrs: &[SockName],
    ) -> Result<bool> {
        if *src != self.uuid {
            return Err(EtdError::InvalidArgument(format!(
                "the source handle '{src}' is not this service's"
            )));
        }
        if todo < 0 {
            return Err(EtdError::InvalidArgument(format!(
                "negative byte count {todo}"
            )));
        }
        if todo == 0 {
            return Ok(true);
        }
        self.state
            .with_locked(&self.uuid, |transfer, file| {
                if transfer.mode != OpenMode::Read {
                    return Err(EtdError::InvalidArgument(
                        "this service was initialized, but not for reading a file".to_string(),
                    ));
                }
                let mut conn = transport::connect_any(addrs)?;
                debug!("sendFile: {todo} bytes to {} for {dst}", conn.peer_name());
                transport::write_all(
                    conn.as_mut(),
                    format!("{{ uuid:{dst}, sz:{todo}}}").as_bytes(),
                )?;

                let mut buf = vec![0u8; DATA_BUF_SIZE];
                let mut left = todo as u64;
                while left > 0 {
                    let n = (buf.len() as u64).min(left) as usize;
                    file.read_exact(&mut buf[..n])
                        .map_err(|e| EtdError::io("read from file", e))?;
                    transport::write_all(conn.as_mut(), &buf[..n])?;
                    left -= n as u64;
                }
                let mut ack = [0u8; 1];
                transport::read_exact(conn.as_mut(), &mut ack)?;
                debug!("sendFile: done, ack received");
                Ok(true)
            })
            .unwrap_or_else(|| {
                Err(EtdError::InvalidArgument(
                    "this service was not initialized yet".to_string(),
                ))
            })
    }

    fn get_file(
        &mut self,
        src: &TransferId,
        dst: &TransferId,
        todo: i64,
        addrs: &[SockName],
    ) -> Result<bool> {
        if *dst != self.uuid {
            return Err(EtdError::InvalidArgument(format!(
                "the destination handle '{dst}' is not this service's"
            )));
        }
        if todo < 0 {
            return Err(EtdError::InvalidArgument(format!(
                "negative byte count {todo}"
            )));
        }
        if todo == 0 {
            return Ok(true);
        }
        self.state
            .with_locked(&self.uuid, |transfer, file| {
                if !transfer.mode.is_data_writable() {
                    return Err(EtdError::InvalidArgument(
                        "this service was initialized, but not for writing to a file".to_string(),
                    ));
                }
                let mut conn = transport::connect_any(addrs)?;
                debug!("getFile: {todo} bytes from {} for {src}", conn.peer_name());
                transport::write_all(
                    conn.as_mut(),
                    format!("{{ uuid:{src}, push:1, sz:{todo}}}").as_bytes(),
                )?;

                let mut buf = vec![0u8; DATA_BUF_SIZE];
                let mut left = todo as u64;
                while left > 0 {
                    let want = (buf.len() as u64).min(left) as usize;
                    let n = conn.read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(EtdError::ShortRead(format!(
                            "{left} bytes still expected from the data peer"
                        )));
                    }
                    file.write_all(&buf[..n])
                        .map_err(|e| EtdError::io("write to file", e))?;
                    left -= n as u64;
                }
                transport::write_all(conn.as_mut(), b"y")?;
                debug!("getFile: done, ack sent");
                Ok(true)
            })
            .unwrap_or_else(|| {
                Err(EtdError::InvalidArgument(
                    "this service was not initialized yet".to_string(),
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> (tempfile::TempDir, SharedState, EtdServer) {
        let tmp = tempfile::tempdir().unwrap();
        let state = SharedState::new();
        let srv = EtdServer::new(state.clone());
        (tmp, state, srv)
    }

    #[test]
    fn write_new_starts_at_zero() {
        let (tmp, _state, mut srv) = server();
        let path = tmp.path().join("fresh").display().to_string();
        let grant = srv.request_file_write(&path, OpenMode::New).unwrap();
        assert_eq!(grant.pos, 0);
        assert_eq!(&grant.id, srv.uuid());
    }

    #[test]
    fn resume_reports_on_disk_size() {
        let (tmp, _state, mut srv) = server();
        let path = tmp.path().join("partial");
        std::fs::write(&path, vec![7u8; 1024]).unwrap();
        let grant = srv
            .request_file_write(&path.display().to_string(), OpenMode::Resume)
            .unwrap();
        assert_eq!(grant.pos, 1024);
    }

    #[test]
    fn read_with_offset_reports_remainder() {
        let (tmp, _state, mut srv) = server();
        let path = tmp.path().join("data");
        std::fs::write(&path, vec![1u8; 2048]).unwrap();
        let grant = srv
            .request_file_read(&path.display().to_string(), 512)
            .unwrap();
        assert_eq!(grant.pos, 1536);
    }

    #[test]
    fn second_request_on_same_service_is_busy() {
        let (tmp, _state, mut srv) = server();
        let path = tmp.path().join("one").display().to_string();
        srv.request_file_write(&path, OpenMode::New).unwrap();
        let other = tmp.path().join("two").display().to_string();
        assert!(matches!(
            srv.request_file_write(&other, OpenMode::New),
            Err(EtdError::AlreadyBusy(_))
        ));
    }

    #[test]
    fn write_conflicts_with_registered_reader() {
        let (tmp, state, mut srv) = server();
        let path = tmp.path().join("shared");
        std::fs::write(&path, b"x").unwrap();
        let p = path.display().to_string();
        srv.request_file_read(&p, 0).unwrap();

        let mut other = EtdServer::new(state);
        assert!(matches!(
            other.request_file_write(&p, OpenMode::OverWrite),
            Err(EtdError::PathConflict(_))
        ));
    }

    #[test]
    fn readers_may_share_a_path() {
        let (tmp, state, mut srv) = server();
        let path = tmp.path().join("shared");
        std::fs::write(&path, b"x").unwrap();
        let p = path.display().to_string();
        srv.request_file_read(&p, 0).unwrap();

        let mut other = EtdServer::new(state.clone());
        other.request_file_read(&p, 0).unwrap();
        assert_eq!(state.lock().transfers.len(), 2);
    }

    #[test]
    fn skip_existing_refuses_present_target() {
        let (tmp, _state, mut srv) = server();
        let path = tmp.path().join("there");
        std::fs::write(&path, b"x").unwrap();
        assert!(matches!(
            srv.request_file_write(&path.display().to_string(), OpenMode::SkipExisting),
            Err(EtdError::Io { .. })
        ));
    }

    #[test]
    fn remove_rejects_foreign_handle() {
        let (_tmp, _state, mut srv) = server();
        assert!(matches!(
            srv.remove_uuid(&TransferId::generate()),
            Err(EtdError::InvalidArgument(_))
        ));
        // own handle with nothing registered: plain false
        let own = srv.uuid().clone();
        assert_eq!(srv.remove_uuid(&own).unwrap(), false);
    }

    #[test]
    fn drop_unregisters() {
        let (tmp, state, mut srv) = server();
        let path = tmp.path().join("cleanup").display().to_string();
        srv.request_file_write(&path, OpenMode::New).unwrap();
        assert_eq!(state.lock().transfers.len(), 1);
        drop(srv);
        assert!(state.lock().transfers.is_empty());
    }

    #[test]
    fn send_file_requires_read_mode() {
        let (tmp, _state, mut srv) = server();
        let path = tmp.path().join("w").display().to_string();
        srv.request_file_write(&path, OpenMode::New).unwrap();
        let own = srv.uuid().clone();
        let dst = TransferId::generate();
        let err = srv.send_file(&own, &dst, 4, &[]).unwrap_err();
        assert!(matches!(err, EtdError::InvalidArgument(_)));
    }

    #[test]
    fn send_file_with_no_reachable_address_fails() {
        let (tmp, _state, mut srv) = server();
        let path = tmp.path().join("r");
        std::fs::write(&path, b"abcd").unwrap();
        srv.request_file_read(&path.display().to_string(), 0).unwrap();
        let own = srv.uuid().clone();
        let dst = TransferId::generate();
        // reserved port on localhost, nobody listens
        let addrs = [crate::addr::SockName::new("tcp", "127.0.0.1", 1)];
        let err = srv.send_file(&own, &dst, 4, &addrs).unwrap_err();
        assert!(matches!(err, EtdError::AllAddressesFailed(_)));
    }
}
