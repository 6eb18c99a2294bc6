//! The SFTP request/response engine and file operations.

use super::message::{SftpInbox, SftpMessage, SftpMessageType, SFTP_VERSION};
use super::types::{status_error, FileAttributes, FileOpenFlags, SftpErrorCode};
use crate::ssh::client::SshClient;
use crate::ssh::wire::{Reader, Writer};
use skiff_platform::{SkiffError, SkiffResult};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, trace};

/// Transfer chunk size for `get`/`put` and the read request length.
pub const SFTP_MAX_MSG_SIZE: u32 = 30000;

/// Open disposition for [`SftpSession::open_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOpenMode {
    /// Read-only.
    Read,
    /// Create/truncate for writing.
    Overwrite,
    /// Create/append for writing.
    Append,
}

impl FileOpenMode {
    fn pflags(&self) -> u32 {
        match self {
            FileOpenMode::Read => FileOpenFlags::READ,
            FileOpenMode::Overwrite => {
                FileOpenFlags::WRITE | FileOpenFlags::CREAT | FileOpenFlags::TRUNC
            }
            FileOpenMode::Append => {
                FileOpenFlags::WRITE | FileOpenFlags::CREAT | FileOpenFlags::APPEND
            }
        }
    }
}

/// An SFTP session over one subsystem channel.
///
/// Borrows the SSH session mutably: SFTP traffic and the channel pump run
/// on the caller's task, matching the single-worker model of the client.
pub struct SftpSession<'a> {
    ssh: &'a mut SshClient,
    channel: u32,
    next_request_id: u32,
    inbox: SftpInbox,
    timeout: Duration,
    /// REALPATH-canonicalised working directory for relative paths.
    cwd: Option<String>,
}

impl<'a> SftpSession<'a> {
    /// Performs the INIT/VERSION handshake over an sftp subsystem channel.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::SftpVersion`] when the server advertises a
    /// protocol version below 3.
    pub async fn init(ssh: &'a mut SshClient, channel: u32) -> SkiffResult<Self> {
        let timeout = ssh.read_timeout();
        let mut session = Self {
            ssh,
            channel,
            next_request_id: 1,
            inbox: SftpInbox::new(),
            timeout,
            cwd: None,
        };

        let mut init = Writer::new();
        init.u32(SFTP_VERSION);
        session
            .send_message(SftpMessage::new(SftpMessageType::Init, init.finish()))
            .await?;

        let version_msg = session.next_inbox_message().await?;
        if version_msg.msg_type != SftpMessageType::Version {
            return Err(SkiffError::MalformedPacket(format!(
                "expected SSH_FXP_VERSION, got {:?}",
                version_msg.msg_type
            )));
        }
        let mut r = Reader::new(&version_msg.payload);
        let version = r.u32()?;
        if version < 3 {
            return Err(SkiffError::SftpVersion(version));
        }
        info!(version, "SFTP session established");

        Ok(session)
    }

    /// Sets the timeout applied to every SFTP request.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    // ----- request/response engine -----------------------------------------

    fn next_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    async fn send_message(&mut self, msg: SftpMessage) -> SkiffResult<()> {
        trace!(msg_type = ?msg.msg_type, len = msg.payload.len(), "sending SFTP message");
        let bytes = msg.to_bytes();
        self.ssh.send(self.channel, &bytes).await
    }

    /// Pops the next framed message, pumping the channel as needed.
    async fn next_inbox_message(&mut self) -> SkiffResult<SftpMessage> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let data = self.ssh.read(self.channel).await?;
            self.inbox.extend(&data);

            if let Some(msg) = self.inbox.next_message()? {
                trace!(msg_type = ?msg.msg_type, "received SFTP message");
                return Ok(msg);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(SkiffError::Timeout);
            }
            self.ssh.pump_once(deadline - now).await?;
        }
    }

    /// Waits for the response carrying `request_id`.
    ///
    /// Responses with other ids belong to abandoned (timed-out) requests
    /// and are discarded.
    async fn receive_response(&mut self, request_id: u32) -> SkiffResult<SftpMessage> {
        loop {
            let msg = self.next_inbox_message().await?;
            let mut r = Reader::new(&msg.payload);
            let id = r.u32()?;
            if id == request_id {
                return Ok(msg);
            }
            debug!(stale = id, expected = request_id, "discarding stale SFTP response");
        }
    }

    /// Sends a request body and returns the matched response.
    async fn round_trip(
        &mut self,
        msg_type: SftpMessageType,
        request_id: u32,
        body: Vec<u8>,
    ) -> SkiffResult<SftpMessage> {
        self.send_message(SftpMessage::new(msg_type, body)).await?;
        self.receive_response(request_id).await
    }

    /// Parses a STATUS payload (after the request id).
    fn parse_status(msg: &SftpMessage) -> SkiffResult<(u32, String)> {
        let mut r = Reader::new(&msg.payload);
        let _request_id = r.u32()?;
        let code = r.u32()?;
        // Language tag and even the message are absent in some servers.
        let message = r
            .string()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .unwrap_or_default();
        Ok((code, message))
    }

    /// Interprets a response that should be STATUS OK.
    fn expect_status_ok(msg: &SftpMessage) -> SkiffResult<()> {
        if msg.msg_type != SftpMessageType::Status {
            return Err(SkiffError::MalformedPacket(format!(
                "expected SSH_FXP_STATUS, got {:?}",
                msg.msg_type
            )));
        }
        let (code, message) = Self::parse_status(msg)?;
        if code == SftpErrorCode::Ok as u32 {
            Ok(())
        } else {
            Err(status_error(code, message))
        }
    }

    /// Extracts the handle from a HANDLE response, or surfaces the status.
    fn expect_handle(msg: &SftpMessage) -> SkiffResult<Vec<u8>> {
        match msg.msg_type {
            SftpMessageType::Handle => {
                let mut r = Reader::new(&msg.payload);
                let _request_id = r.u32()?;
                Ok(r.string()?.to_vec())
            }
            SftpMessageType::Status => {
                let (code, message) = Self::parse_status(msg)?;
                Err(status_error(code, message))
            }
            other => Err(SkiffError::MalformedPacket(format!(
                "expected SSH_FXP_HANDLE, got {:?}",
                other
            ))),
        }
    }

    fn resolve(&self, path: &str) -> String {
        match (&self.cwd, path.starts_with('/')) {
            (Some(cwd), false) => {
                if cwd.ends_with('/') {
                    format!("{}{}", cwd, path)
                } else {
                    format!("{}/{}", cwd, path)
                }
            }
            _ => path.to_string(),
        }
    }

    // ----- handle-level operations -----------------------------------------

    /// Opens a remote file, returning the server's handle.
    pub async fn open_file(&mut self, path: &str, mode: FileOpenMode) -> SkiffResult<Vec<u8>> {
        let path = self.resolve(path);
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(path.as_bytes());
        w.u32(mode.pflags());
        w.raw(&FileAttributes::new().to_bytes());

        let response = self.round_trip(SftpMessageType::Open, id, w.finish()).await?;
        Self::expect_handle(&response)
    }

    /// Opens a remote directory, returning the server's handle.
    pub async fn open_dir(&mut self, path: &str) -> SkiffResult<Vec<u8>> {
        let path = self.resolve(path);
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(path.as_bytes());

        let response = self
            .round_trip(SftpMessageType::Opendir, id, w.finish())
            .await?;
        Self::expect_handle(&response)
    }

    /// Releases a file or directory handle.
    pub async fn close_handle(&mut self, handle: &[u8]) -> SkiffResult<()> {
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(handle);

        let response = self.round_trip(SftpMessageType::Close, id, w.finish()).await?;
        Self::expect_status_ok(&response)
    }

    /// Reads up to `len` bytes at `offset`; `None` at end of file.
    pub async fn read_chunk(
        &mut self,
        handle: &[u8],
        offset: u64,
        len: u32,
    ) -> SkiffResult<Option<Vec<u8>>> {
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(handle);
        w.u64(offset);
        w.u32(len);

        let response = self.round_trip(SftpMessageType::Read, id, w.finish()).await?;
        match response.msg_type {
            SftpMessageType::Data => {
                let mut r = Reader::new(&response.payload);
                let _request_id = r.u32()?;
                Ok(Some(r.string()?.to_vec()))
            }
            SftpMessageType::Status => {
                let (code, message) = Self::parse_status(&response)?;
                if code == SftpErrorCode::Eof as u32 {
                    Ok(None)
                } else {
                    Err(status_error(code, message))
                }
            }
            other => Err(SkiffError::MalformedPacket(format!(
                "expected SSH_FXP_DATA, got {:?}",
                other
            ))),
        }
    }

    /// Writes `data` at `offset`.
    pub async fn write_chunk(&mut self, handle: &[u8], offset: u64, data: &[u8]) -> SkiffResult<()> {
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(handle);
        w.u64(offset);
        w.string(data);

        let response = self.round_trip(SftpMessageType::Write, id, w.finish()).await?;
        Self::expect_status_ok(&response)
    }

    /// Stats an open handle.
    pub async fn fstat(&mut self, handle: &[u8]) -> SkiffResult<FileAttributes> {
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(handle);

        let response = self.round_trip(SftpMessageType::Fstat, id, w.finish()).await?;
        Self::expect_attrs(&response)
    }

    /// Sets attributes on an open handle.
    pub async fn fsetstat(&mut self, handle: &[u8], attrs: &FileAttributes) -> SkiffResult<()> {
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(handle);
        w.raw(&attrs.to_bytes());

        let response = self
            .round_trip(SftpMessageType::Fsetstat, id, w.finish())
            .await?;
        Self::expect_status_ok(&response)
    }

    fn expect_attrs(msg: &SftpMessage) -> SkiffResult<FileAttributes> {
        match msg.msg_type {
            SftpMessageType::Attrs => {
                let mut r = Reader::new(&msg.payload);
                let _request_id = r.u32()?;
                FileAttributes::read_from(&mut r)
            }
            SftpMessageType::Status => {
                let (code, message) = Self::parse_status(msg)?;
                Err(status_error(code, message))
            }
            other => Err(SkiffError::MalformedPacket(format!(
                "expected SSH_FXP_ATTRS, got {:?}",
                other
            ))),
        }
    }

    // ----- path-level operations -------------------------------------------

    /// Stats a path; `follow_symlinks` picks STAT over LSTAT.
    pub async fn stat(&mut self, path: &str, follow_symlinks: bool) -> SkiffResult<FileAttributes> {
        let path = self.resolve(path);
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(path.as_bytes());

        let msg_type = if follow_symlinks {
            SftpMessageType::Stat
        } else {
            SftpMessageType::Lstat
        };
        let response = self.round_trip(msg_type, id, w.finish()).await?;
        Self::expect_attrs(&response)
    }

    /// Sets attributes on a path.
    pub async fn setstat(&mut self, path: &str, attrs: &FileAttributes) -> SkiffResult<()> {
        let path = self.resolve(path);
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(path.as_bytes());
        w.raw(&attrs.to_bytes());

        let response = self
            .round_trip(SftpMessageType::Setstat, id, w.finish())
            .await?;
        Self::expect_status_ok(&response)
    }

    /// Removes a file.
    pub async fn rm(&mut self, path: &str) -> SkiffResult<()> {
        let path = self.resolve(path);
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(path.as_bytes());

        let response = self.round_trip(SftpMessageType::Remove, id, w.finish()).await?;
        Self::expect_status_ok(&response)
    }

    /// Renames or moves a file or directory.
    pub async fn mv(&mut self, old_path: &str, new_path: &str) -> SkiffResult<()> {
        let old_path = self.resolve(old_path);
        let new_path = self.resolve(new_path);
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(old_path.as_bytes());
        w.string(new_path.as_bytes());

        let response = self.round_trip(SftpMessageType::Rename, id, w.finish()).await?;
        Self::expect_status_ok(&response)
    }

    /// Creates a directory.
    pub async fn mkdir(&mut self, path: &str) -> SkiffResult<()> {
        let path = self.resolve(path);
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(path.as_bytes());
        w.raw(&FileAttributes::new().to_bytes());

        let response = self.round_trip(SftpMessageType::Mkdir, id, w.finish()).await?;
        Self::expect_status_ok(&response)
    }

    /// Removes a directory.
    pub async fn rmdir(&mut self, path: &str) -> SkiffResult<()> {
        let path = self.resolve(path);
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(path.as_bytes());

        let response = self.round_trip(SftpMessageType::Rmdir, id, w.finish()).await?;
        Self::expect_status_ok(&response)
    }

    /// Canonicalises a path via SSH_FXP_REALPATH.
    pub async fn realpath(&mut self, path: &str) -> SkiffResult<String> {
        let path = self.resolve(path);
        let id = self.next_request_id();
        let mut w = Writer::new();
        w.u32(id);
        w.string(path.as_bytes());

        let response = self
            .round_trip(SftpMessageType::Realpath, id, w.finish())
            .await?;
        match response.msg_type {
            SftpMessageType::Name => {
                let mut r = Reader::new(&response.payload);
                let _request_id = r.u32()?;
                let count = r.u32()?;
                if count < 1 {
                    return Err(SkiffError::MalformedPacket(
                        "REALPATH returned no names".to_string(),
                    ));
                }
                Ok(String::from_utf8_lossy(r.string()?).into_owned())
            }
            SftpMessageType::Status => {
                let (code, message) = Self::parse_status(&response)?;
                Err(status_error(code, message))
            }
            other => Err(SkiffError::MalformedPacket(format!(
                "expected SSH_FXP_NAME, got {:?}",
                other
            ))),
        }
    }

    /// Changes the working directory used to resolve relative paths.
    pub async fn cd(&mut self, path: &str) -> SkiffResult<()> {
        let canonical = self.realpath(path).await?;
        debug!(cwd = %canonical, "changed SFTP working directory");
        self.cwd = Some(canonical);
        Ok(())
    }

    /// The current working directory, once `cd` has run.
    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    /// Lists a directory; entries are (filename, longname, attrs).
    pub async fn readdir(
        &mut self,
        path: &str,
    ) -> SkiffResult<Vec<(String, String, FileAttributes)>> {
        let handle = self.open_dir(path).await?;
        let mut entries = Vec::new();

        let result = loop {
            let id = self.next_request_id();
            let mut w = Writer::new();
            w.u32(id);
            w.string(&handle);

            let response = match self.round_trip(SftpMessageType::Readdir, id, w.finish()).await {
                Ok(response) => response,
                Err(err) => break Err(err),
            };

            match response.msg_type {
                SftpMessageType::Name => {
                    let mut r = Reader::new(&response.payload);
                    if let Err(err) = (|| -> SkiffResult<()> {
                        let _request_id = r.u32()?;
                        let count = r.u32()?;
                        for _ in 0..count {
                            let filename = String::from_utf8_lossy(r.string()?).into_owned();
                            let longname = String::from_utf8_lossy(r.string()?).into_owned();
                            let attrs = FileAttributes::read_from(&mut r)?;
                            entries.push((filename, longname, attrs));
                        }
                        Ok(())
                    })() {
                        break Err(err);
                    }
                }
                SftpMessageType::Status => {
                    match Self::parse_status(&response) {
                        Ok((code, _)) if code == SftpErrorCode::Eof as u32 => break Ok(()),
                        Ok((code, message)) => break Err(status_error(code, message)),
                        Err(err) => break Err(err),
                    }
                }
                other => {
                    break Err(SkiffError::MalformedPacket(format!(
                        "expected SSH_FXP_NAME, got {:?}",
                        other
                    )))
                }
            }
        };

        self.close_handle(&handle).await?;
        result.map(|_| entries)
    }

    /// Directory listing as text; `long` selects `ls -l` style lines.
    pub async fn ls(&mut self, path: &str, long: bool) -> SkiffResult<String> {
        let entries = self.readdir(path).await?;
        let mut out = String::new();
        for (filename, longname, _) in &entries {
            out.push_str(if long { longname } else { filename });
            out.push('\n');
        }
        Ok(out)
    }

    // ----- transfers -------------------------------------------------------

    /// Downloads a remote file, chunk by chunk, until EOF.
    pub async fn get(&mut self, remote_path: &str, local_path: &str) -> SkiffResult<()> {
        info!(remote = %remote_path, local = %local_path, "SFTP get");
        let handle = self.open_file(remote_path, FileOpenMode::Read).await?;

        let mut local = tokio::fs::File::create(local_path)
            .await
            .map_err(SkiffError::IoFile)?;

        let mut offset = 0u64;
        let result = loop {
            eprintln!("CLIENT requesting read at offset={}", offset);
            match self.read_chunk(&handle, offset, SFTP_MAX_MSG_SIZE).await {
                Ok(Some(data)) => {
                    eprintln!("CLIENT got data len={}", data.len());
                    if data.is_empty() {
                        break Ok(());
                    }
                    if let Err(err) = local.write_all(&data).await {
                        break Err(SkiffError::IoFile(err));
                    }
                    offset += data.len() as u64;
                }
                Ok(None) => {
                    eprintln!("CLIENT got EOF");
                    break Ok(());
                }
                Err(err) => {
                    eprintln!("CLIENT read_chunk error: {:?}", err);
                    break Err(err);
                }
            }
        };

        if result.is_ok() {
            local.flush().await.map_err(SkiffError::IoFile)?;
        }
        eprintln!("CLIENT closing handle");
        self.close_handle(&handle).await?;
        eprintln!("CLIENT close_handle ok");
        debug!(bytes = offset, "transfer finished");
        result
    }

    /// Uploads a local file, chunk by chunk.
    pub async fn put(&mut self, local_path: &str, remote_path: &str) -> SkiffResult<()> {
        info!(local = %local_path, remote = %remote_path, "SFTP put");
        let mut local = tokio::fs::File::open(local_path)
            .await
            .map_err(SkiffError::IoFile)?;

        let handle = self.open_file(remote_path, FileOpenMode::Overwrite).await?;

        let mut buffer = vec![0u8; SFTP_MAX_MSG_SIZE as usize];
        let mut offset = 0u64;
        let result = loop {
            let read = match local.read(&mut buffer).await {
                Ok(n) => n,
                Err(err) => break Err(SkiffError::IoFile(err)),
            };
            if read == 0 {
                break Ok(());
            }
            if let Err(err) = self.write_chunk(&handle, offset, &buffer[..read]).await {
                break Err(err);
            }
            offset += read as u64;
        };

        self.close_handle(&handle).await?;
        debug!(bytes = offset, "transfer finished");
        result
    }

    // ----- attribute conveniences ------------------------------------------

    /// Changes permissions; `mode` is octal digits or a POSIX symbolic
    /// expression such as `ug+w`.
    ///
    /// Symbolic modes are applied against the current mode fetched with
    /// LSTAT.
    pub async fn chmod(&mut self, path: &str, mode: &str) -> SkiffResult<()> {
        let permissions = if is_octal_mode(mode) {
            u32::from_str_radix(mode, 8).map_err(|_| {
                SkiffError::MalformedPacket(format!("invalid octal mode '{}'", mode))
            })?
        } else {
            let current = self.stat(path, false).await?.permissions.unwrap_or(0);
            apply_symbolic_mode(current & 0o7777, mode)?
        };

        let attrs = FileAttributes {
            permissions: Some(permissions),
            ..Default::default()
        };
        self.setstat(path, &attrs).await
    }

    /// Changes ownership of a remote file.
    pub async fn chown(&mut self, path: &str, uid: u32, gid: u32) -> SkiffResult<()> {
        let attrs = FileAttributes {
            uid: Some(uid),
            gid: Some(gid),
            ..Default::default()
        };
        self.setstat(path, &attrs).await
    }

    /// Whether the remote path is a regular file.
    pub async fn is_file(&mut self, path: &str) -> SkiffResult<bool> {
        Ok(self.stat(path, true).await?.is_file())
    }

    /// Whether the remote path is a directory.
    pub async fn is_dir(&mut self, path: &str) -> SkiffResult<bool> {
        Ok(self.stat(path, true).await?.is_dir())
    }
}

fn is_octal_mode(mode: &str) -> bool {
    (mode.len() == 3 || mode.len() == 4) && mode.bytes().all(|b| (b'0'..=b'7').contains(&b))
}

/// Applies POSIX symbolic clauses (`[ugoa]*[-+=][rwx]+`, comma-separated)
/// against `current` permission bits.
fn apply_symbolic_mode(current: u32, expression: &str) -> SkiffResult<u32> {
    let mut mode = current;

    for clause in expression.split(',') {
        let op_pos = clause
            .find(|c| c == '+' || c == '-' || c == '=')
            .ok_or_else(|| {
                SkiffError::MalformedPacket(format!("invalid mode expression '{}'", clause))
            })?;
        let (who_part, rest) = clause.split_at(op_pos);
        let op = rest.as_bytes()[0] as char;
        let perm_part = &rest[1..];

        if perm_part.is_empty() && op != '=' {
            return Err(SkiffError::MalformedPacket(format!(
                "invalid mode expression '{}'",
                clause
            )));
        }

        // Shifts from the owner triad: u = 0, g = 3, o = 6.
        let mut shifts = Vec::new();
        let whos = if who_part.is_empty() { "a" } else { who_part };
        for who in whos.chars() {
            match who {
                'u' => shifts.push(0),
                'g' => shifts.push(3),
                'o' => shifts.push(6),
                'a' => shifts.extend_from_slice(&[0, 3, 6]),
                other => {
                    return Err(SkiffError::MalformedPacket(format!(
                        "invalid who '{}' in mode expression",
                        other
                    )))
                }
            }
        }

        let mut bits = 0u32;
        for perm in perm_part.chars() {
            let base = match perm {
                'r' => 0o400,
                'w' => 0o200,
                'x' => 0o100,
                other => {
                    return Err(SkiffError::MalformedPacket(format!(
                        "invalid permission '{}' in mode expression",
                        other
                    )))
                }
            };
            for shift in &shifts {
                bits |= base >> shift;
            }
        }

        match op {
            '+' => mode |= bits,
            '-' => mode &= !bits,
            '=' => {
                let mut mask = 0u32;
                for shift in &shifts {
                    mask |= 0o700 >> shift;
                }
                mode = (mode & !mask) | bits;
            }
            _ => unreachable!(),
        }
    }

    Ok(mode)
}
