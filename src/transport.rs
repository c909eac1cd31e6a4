//! Socket transport seam
//!
//! Control and data connections reach the engine through the [`Channel`]
//! trait; TCP is wired in here and other stream transports plug in at the
//! same seam. Counts returned by `read`/`write` are the bytes actually
//! moved; the exact-count helpers retry partial transfers and turn a
//! zero-byte result into a typed short-i/o error.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};

use tracing::debug;

use crate::addr::SockName;
use crate::error::{EtdError, Result};

pub trait Channel: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn peer_name(&self) -> String;
    fn local_name(&self) -> String;
}

pub struct TcpChannel {
    stream: TcpStream,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> Self {
        tune_socket(&stream);
        TcpChannel { stream }
    }
}

// Disable Nagle; bulk writes are large and command replies are latency bound.
fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
}

impl Channel for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream
            .read(buf)
            .map_err(|e| EtdError::io("read from connection", e))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream
            .write(buf)
            .map_err(|e| EtdError::io("write to connection", e))
    }

    fn peer_name(&self) -> String {
        self.stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    fn local_name(&self) -> String {
        self.stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

/// Open a connection to one advertised address.
pub fn connect(addr: &SockName) -> Result<Box<dyn Channel>> {
    match addr.protocol.as_str() {
        "tcp" => {
            let stream = TcpStream::connect((addr.host.as_str(), addr.port))
                .map_err(|e| EtdError::io(format!("connect {addr}"), e))?;
            debug!("connected to {addr}");
            Ok(Box::new(TcpChannel::new(stream)))
        }
        other => Err(EtdError::InvalidArgument(format!(
            "unsupported protocol '{other}'"
        ))),
    }
}

/// Try each advertised address in order, accumulating per-address
/// diagnostics; fail only when none of them accepts.
pub fn connect_any(addrs: &[SockName]) -> Result<Box<dyn Channel>> {
    let mut tried = String::new();
    for addr in addrs {
        match connect(addr) {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                if !tried.is_empty() {
                    tried.push_str(", ");
                }
                tried.push_str(&format!("{addr}: {e}"));
            }
        }
    }
    Err(EtdError::AllAddressesFailed(if tried.is_empty() {
        "no data addresses given".to_string()
    } else {
        tried
    }))
}

/// Bind a listener for one designator. Returns the listener and the
/// designator it actually bound (the port resolved if 0 was asked for).
pub fn bind_listener(addr: &SockName) -> Result<(TcpListener, SockName)> {
    if addr.protocol != "tcp" {
        return Err(EtdError::InvalidArgument(format!(
            "unsupported protocol '{}'",
            addr.protocol
        )));
    }
    let listener = TcpListener::bind((addr.host.as_str(), addr.port))
        .map_err(|e| EtdError::io(format!("bind {addr}"), e))?;
    let local = listener
        .local_addr()
        .map_err(|e| EtdError::io("local_addr", e))?;
    Ok((
        listener,
        SockName::new("tcp", local.ip().to_string(), local.port()),
    ))
}

/// Best guess at this host's outbound IP, for advertising data listeners
/// that were bound to a wildcard address.
pub fn local_ip() -> Result<std::net::IpAddr> {
    let socket =
        std::net::UdpSocket::bind("0.0.0.0:0").map_err(|e| EtdError::io("bind udp probe", e))?;
    socket
        .connect("8.8.8.8:80")
        .map_err(|e| EtdError::io("probe outbound route", e))?;
    Ok(socket
        .local_addr()
        .map_err(|e| EtdError::io("probe local addr", e))?
        .ip())
}

/// Write the whole buffer, retrying partial writes. A zero-byte write with
/// bytes still pending is a short write.
pub fn write_all(chan: &mut dyn Channel, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = chan.write(buf)?;
        if n == 0 {
            return Err(EtdError::ShortWrite(format!(
                "{} bytes still pending",
                buf.len()
            )));
        }
        buf = &buf[n..];
    }
    Ok(())
}

/// Fill the whole buffer, retrying partial reads. A zero-byte read with
/// bytes still expected is a short read.
pub fn read_exact(chan: &mut dyn Channel, mut buf: &mut [u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = chan.read(buf)?;
        if n == 0 {
            return Err(EtdError::ShortRead(format!(
                "{} bytes still expected",
                buf.len()
            )));
        }
        let rest = buf;
        buf = &mut rest[n..];
    }
    Ok(())
}
