// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unix stream connections: client, server, and server-accepted client.
//!
//! Three address forms are supported: a socket file on disk, a name in the
//! Linux abstract namespace (no filesystem inode), and unnamed (no bind at
//! all; the caller is responsible for making such a socket useful).

use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};
use crate::fdutil;
use crate::reactor::Reactor;
use crate::stream::StreamMessageConnection;
use std::cell::RefCell;
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::linux::net::SocketAddrExt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Address of a Unix stream or datagram socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixAddress {
    /// A socket file on disk.
    File(PathBuf),
    /// A name in the abstract socket namespace.
    Abstract(String),
    /// No address; the socket is never bound.
    Unnamed,
}

impl UnixAddress {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn abstract_name(name: impl Into<String>) -> Self {
        Self::Abstract(name.into())
    }
}

impl std::fmt::Display for UnixAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "unix:{}", path.display()),
            Self::Abstract(name) => write!(f, "unix-abstract:{name}"),
            Self::Unnamed => write!(f, "unix:"),
        }
    }
}

/// A message connection over a Unix stream socket.
pub type UnixMessageConnection = StreamMessageConnection<UnixStream>;

impl UnixMessageConnection {
    /// Connect to `address` and switch the socket to non-blocking mode.
    pub fn connect(name: &str, address: &UnixAddress) -> Result<Self> {
        let stream = match address {
            UnixAddress::File(path) => UnixStream::connect(path),
            UnixAddress::Abstract(abstract_name) => {
                match SocketAddr::from_abstract_name(abstract_name.as_bytes()) {
                    Ok(addr) => UnixStream::connect_addr(&addr),
                    Err(e) => {
                        return Err(Error::InvalidParameter(format!(
                            "invalid abstract socket name \"{abstract_name}\": {e}"
                        )));
                    }
                }
            }
            UnixAddress::Unnamed => {
                return Err(Error::InvalidParameter(
                    "cannot connect to an unnamed unix address".to_string(),
                ));
            }
        }
        .map_err(|e| Error::Initialization(format!("could not connect to {address}: {e}")))?;
        stream
            .set_nonblocking(true)
            .map_err(|e| Error::Initialization(format!("could not make socket non-blocking: {e}")))?;
        Ok(Self::from_stream(name, stream))
    }
}

pub type UnixAcceptCallback = Box<dyn FnMut(&mut Reactor, UnixStream) -> Result<()>>;

/// Server-side options beyond the address itself.
#[derive(Debug, Clone, Default)]
pub struct UnixServerOptions {
    /// Delete a stale socket file after probing that no server answers it.
    pub force_reuse: bool,
    /// Set close-on-exec on accepted sockets.
    pub close_on_exec: bool,
    /// chown the socket file to this group after bind.
    pub group: Option<libc::gid_t>,
    /// chmod the socket file to this mode after bind.
    pub mode: Option<u32>,
}

#[derive(Debug)]
enum ServerSocket {
    Listener(UnixListener),
    /// Unnamed form: a bare socket, never bound or listened on.
    Raw(OwnedFd),
}

/// A Unix stream listener.
pub struct UnixServerConnection {
    state: ConnectionState,
    socket: ServerSocket,
    address: UnixAddress,
    options: UnixServerOptions,
    on_accept: UnixAcceptCallback,
}

impl std::fmt::Debug for UnixServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixServerConnection")
            .field("state", &self.state)
            .field("socket", &self.socket)
            .field("address", &self.address)
            .field("options", &self.options)
            .field("on_accept", &"<callback>")
            .finish()
    }
}

impl UnixServerConnection {
    pub fn new(
        name: &str,
        address: UnixAddress,
        options: UnixServerOptions,
        on_accept: UnixAcceptCallback,
    ) -> Result<Rc<RefCell<Self>>> {
        let socket = match &address {
            UnixAddress::File(path) => {
                Self::prepare_socket_file(path, options.force_reuse)?;
                let listener = UnixListener::bind(path).map_err(|e| {
                    Error::Initialization(format!("could not bind to {address}: {e}"))
                })?;
                Self::apply_file_ownership(path, &options)?;
                ServerSocket::Listener(listener)
            }
            UnixAddress::Abstract(abstract_name) => {
                let addr = SocketAddr::from_abstract_name(abstract_name.as_bytes()).map_err(|e| {
                    Error::InvalidParameter(format!(
                        "invalid abstract socket name \"{abstract_name}\": {e}"
                    ))
                })?;
                let listener = UnixListener::bind_addr(&addr).map_err(|e| {
                    Error::Initialization(format!("could not bind to {address}: {e}"))
                })?;
                ServerSocket::Listener(listener)
            }
            UnixAddress::Unnamed => {
                // no bind, no listen; the caller knows what it is doing
                let socket = nix::sys::socket::socket(
                    nix::sys::socket::AddressFamily::Unix,
                    nix::sys::socket::SockType::Stream,
                    nix::sys::socket::SockFlag::SOCK_NONBLOCK,
                    None,
                )
                .map_err(|e| {
                    Error::Initialization(format!("could not create unnamed socket: {e}"))
                })?;
                ServerSocket::Raw(socket)
            }
        };
        if let ServerSocket::Listener(listener) = &socket {
            listener.set_nonblocking(true).map_err(|e| {
                Error::Initialization(format!("could not make listener non-blocking: {e}"))
            })?;
        }
        Ok(Rc::new(RefCell::new(Self {
            state: ConnectionState::new(name),
            socket,
            address,
            options,
            on_accept,
        })))
    }

    /// Make sure a socket file path is available for bind.
    ///
    /// An existing file that is not a socket is always an error. An
    /// existing socket is an error unless `force_reuse` is set and a
    /// connect probe shows no server is answering it, in which case the
    /// stale file is unlinked.
    fn prepare_socket_file(path: &Path, force_reuse: bool) -> Result<()> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(Error::Initialization(format!(
                    "could not stat \"{}\": {e}",
                    path.display()
                )));
            }
        };
        if !metadata.file_type().is_socket() {
            return Err(Error::Initialization(format!(
                "file \"{}\" already exists and is not a socket",
                path.display()
            )));
        }
        let mut available = false;
        if force_reuse {
            tracing::warn!(
                "connect-probing \"{}\" to check that the address is available",
                path.display()
            );
            available = UnixStream::connect(path).is_err();
        }
        if !available {
            return Err(Error::Initialization(format!(
                "socket \"{}\" already in use",
                path.display()
            )));
        }
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Initialization(format!(
                "could not unlink stale socket \"{}\": {e}",
                path.display()
            ))),
        }
    }

    fn apply_file_ownership(path: &Path, options: &UnixServerOptions) -> Result<()> {
        if let Some(group) = options.group {
            let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| {
                Error::InvalidParameter(format!(
                    "socket path \"{}\" contains a NUL byte",
                    path.display()
                ))
            })?;
            // Safety: `c_path` is a valid NUL terminated string.
            let r = unsafe { libc::chown(c_path.as_ptr(), u32::MAX, group) };
            if r != 0 {
                return Err(Error::Initialization(format!(
                    "could not chown \"{}\" to group {group} (errno {})",
                    path.display(),
                    nix::Error::last_raw()
                )));
            }
        }
        if let Some(mode) = options.mode {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(
                |e| {
                    Error::Initialization(format!(
                        "could not chmod \"{}\": {e}",
                        path.display()
                    ))
                },
            )?;
        }
        Ok(())
    }

    pub fn address(&self) -> &UnixAddress {
        &self.address
    }
}

impl Drop for UnixServerConnection {
    fn drop(&mut self) {
        if let UnixAddress::File(path) = &self.address {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        "could not remove socket file \"{}\": {e}",
                        path.display()
                    );
                }
            }
        }
    }
}

impl Connection for UnixServerConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    fn socket(&self) -> RawFd {
        match &self.socket {
            ServerSocket::Listener(listener) => listener.as_raw_fd(),
            ServerSocket::Raw(fd) => fd.as_raw_fd(),
        }
    }

    fn is_listener(&self) -> bool {
        matches!(self.socket, ServerSocket::Listener(_))
    }

    fn process_accept(&mut self, reactor: &mut Reactor) -> Result<()> {
        let ServerSocket::Listener(listener) = &self.socket else {
            return Ok(());
        };
        match listener.accept() {
            Ok((stream, _peer)) => {
                stream.set_nonblocking(true).map_err(|e| {
                    Error::Runtime(format!("could not make accepted socket non-blocking: {e}"))
                })?;
                fdutil::set_cloexec(stream.as_raw_fd(), self.options.close_on_exec)?;
                tracing::debug!("connection \"{}\" accepted a client", self.state.name());
                (self.on_accept)(reactor, stream)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                tracing::error!(
                    "accept() failed on connection \"{}\": {e}",
                    self.state.name()
                );
                self.process_error(reactor)
            }
        }
    }
}
