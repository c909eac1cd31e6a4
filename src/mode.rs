//! Transfer open modes and their wire encoding

use std::fmt;
use std::fs::OpenOptions;

use crate::error::{EtdError, Result};

/// How a transfer's file was (or is to be) opened. The numeric wire codes
/// appear in `write-file-<code>` commands; the OS flag translation happens
/// in [`OpenMode::open_options`], nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    New,
    OverWrite,
    Resume,
    /// Like `New`, but the caller's policy is to treat an existing target as
    /// "nothing to do" rather than an error, and the record must never be
    /// written through a data connection.
    SkipExisting,
}

impl OpenMode {
    /// Wire code used in `write-file-<code>`. `Read` has no wire form.
    pub fn to_wire(self) -> u8 {
        match self {
            OpenMode::Read => 0,
            OpenMode::New => 1,
            OpenMode::OverWrite => 2,
            OpenMode::Resume => 4,
            OpenMode::SkipExisting => 8,
        }
    }

    pub fn from_wire(code: &str) -> Result<Self> {
        match code {
            "1" => Ok(OpenMode::New),
            "2" => Ok(OpenMode::OverWrite),
            "4" => Ok(OpenMode::Resume),
            "8" => Ok(OpenMode::SkipExisting),
            other => Err(EtdError::InvalidArgument(format!(
                "unknown open mode code '{other}'"
            ))),
        }
    }

    /// Admissible for `requestFileWrite`.
    pub fn is_write_mode(self) -> bool {
        !matches!(self, OpenMode::Read)
    }

    /// Admissible as the target of a data-connection write. `SkipExisting`
    /// records exist only to hold the "do not touch" decision.
    pub fn is_data_writable(self) -> bool {
        matches!(self, OpenMode::New | OpenMode::OverWrite | OpenMode::Resume)
    }

    /// Translate to `OpenOptions`. Large-file support is requested where the
    /// platform spells it as an open flag.
    pub fn open_options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            OpenMode::Read => {
                opts.read(true);
            }
            OpenMode::New | OpenMode::SkipExisting => {
                opts.write(true).create_new(true);
            }
            OpenMode::OverWrite => {
                opts.write(true).create(true).truncate(true);
            }
            OpenMode::Resume => {
                opts.write(true).create(true);
            }
        }
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.custom_flags(libc::O_LARGEFILE);
        }
        opts
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpenMode::Read => "read",
            OpenMode::New => "new",
            OpenMode::OverWrite => "overwrite",
            OpenMode::Resume => "resume",
            OpenMode::SkipExisting => "skip-existing",
        };
        f.write_str(name)
    }
}
