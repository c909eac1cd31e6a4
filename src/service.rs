//! The service contract shared by the local server and the proxy

use crate::addr::SockName;
use crate::error::Result;
use crate::mode::OpenMode;
use crate::registry::TransferId;

/// Result of a `requestFileWrite`/`requestFileRead`: the transfer handle
/// and a byte position (bytes already on disk, or bytes remaining).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferGrant {
    pub id: TransferId,
    pub pos: i64,
}

/// One endpoint of a transfer. `EtdServer` implements it against the local
/// filesystem and registry; `EtdProxy` implements it by speaking the
/// control protocol to a remote server. A caller cannot tell them apart.
///
/// Every instance is bound to one [`TransferId`] at construction and owns
/// at most one registered transfer under that handle at a time.
pub trait EtdService {
    /// This service's own handle.
    fn uuid(&self) -> &TransferId;

    /// Expand `path` and return matching entries, directories marked with a
    /// trailing `/`. Tilde expansion only when the platform supports it and
    /// `allow_tilde` is set; proxies never request it from the remote side.
    fn list_path(&mut self, path: &str, allow_tilde: bool) -> Result<Vec<String>>;

    /// Open `path` for receiving bytes. Returns the handle and the number
    /// of bytes already on disk (0 unless resuming).
    fn request_file_write(&mut self, path: &str, mode: OpenMode) -> Result<TransferGrant>;

    /// Open `path` for sending bytes, positioned at `already_have`.
    /// Returns the handle and the number of bytes remaining from there.
    fn request_file_read(&mut self, path: &str, already_have: i64) -> Result<TransferGrant>;

    /// The data-channel addresses this endpoint advertises.
    fn data_channel_addr(&mut self) -> Result<Vec<SockName>>;

    /// Close and unregister this service's transfer. `false` when nothing
    /// is registered. Only the service's own handle may be passed.
    fn remove_uuid(&mut self, id: &TransferId) -> Result<bool>;

    /// Stream `todo` bytes from this side's `Read` transfer to the peer
    /// data server reachable at one of `addrs`, then await its ack byte.
    /// `src` must be this service's own handle.
    fn send_file(
        &mut self,
        src: &TransferId,
        dst: &TransferId,
        todo: i64,
        addrs: &[SockName],
    ) -> Result<bool>;

    /// Ask the peer data server at one of `addrs` to push `todo` bytes into
    /// this side's write-mode transfer, then ack with one byte. `dst` must
    /// be this service's own handle.
    fn get_file(
        &mut self,
        src: &TransferId,
        dst: &TransferId,
        todo: i64,
        addrs: &[SockName],
    ) -> Result<bool>;
}
