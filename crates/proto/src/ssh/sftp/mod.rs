//! SFTP v3 subsystem client (draft-ietf-secsh-filexfer-02).
//!
//! SFTP runs over a session channel on which the `sftp` subsystem has been
//! started:
//!
//! ```text
//! Client                          Server
//!   |-- SSH_MSG_CHANNEL_OPEN ------>|
//!   |<- SSH_MSG_CHANNEL_OPEN_CONF --|
//!   |-- CHANNEL_REQUEST subsystem ->|
//!   |<- SSH_MSG_CHANNEL_SUCCESS ----|
//!   |-- SSH_FXP_INIT -------------->|
//!   |<- SSH_FXP_VERSION ------------|
//!   |-- SSH_FXP_OPEN -------------->|
//!   |<- SSH_FXP_HANDLE -------------|
//!   |   ...                         |
//! ```
//!
//! Every request carries a session-unique id; responses are matched by id
//! and stale responses (from timed-out requests) are discarded.
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::ssh::client::SshClient;
//! use skiff_proto::ssh::sftp::SftpSession;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (mut client, _shell) =
//!     SshClient::connect_with_password("host", 22, "user", "pw", false, 30).await?;
//!
//! let channel = client.open_sftp_channel().await?;
//! let mut sftp = SftpSession::init(&mut client, channel).await?;
//!
//! sftp.get("/remote/report.txt", "report.txt").await?;
//! sftp.put("notes.txt", "/remote/notes.txt").await?;
//! for line in sftp.ls("/remote", true).await?.lines() {
//!     println!("{}", line);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod message;
pub mod types;

pub use client::{FileOpenMode, SftpSession, SFTP_MAX_MSG_SIZE};
pub use message::{SftpMessage, SftpMessageType, SFTP_VERSION};
pub use types::{AttrFlags, FileAttributes, FileOpenFlags, SftpErrorCode};
