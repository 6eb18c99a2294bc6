//! # Skiff Proto
//!
//! A client-side SSH-2 library: authenticated, encrypted transport to a
//! remote server, multiplexed channels over it, interactive shell/command
//! execution, and an SFTP v3 subsystem for remote file operations.
//!
//! The supported algorithm families are the classic SSH2 suites: key
//! exchange with Diffie-Hellman group1/group14 and SHA-1, ssh-dss/ssh-rsa
//! host keys, the CBC cipher family (AES, 3DES, Blowfish, CAST-128,
//! Twofish) and HMAC-SHA1/HMAC-MD5 integrity.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use skiff_proto::ssh::client::SshClient;
//! use skiff_proto::ssh::sftp::SftpSession;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Interactive session.
//! let (mut client, shell) =
//!     SshClient::connect_with_password("198.51.100.7", 22, "user", "pw", true, 30).await?;
//! client.send(shell, b"ls /tmp\n").await?;
//! client
//!     .wait_for(shell, b"$ ", std::time::Duration::from_secs(5))
//!     .await?;
//! println!("{}", String::from_utf8_lossy(&client.read(shell).await?));
//!
//! // File transfer.
//! let channel = client.open_sftp_channel().await?;
//! let mut sftp = SftpSession::init(&mut client, channel).await?;
//! sftp.get("/var/log/syslog", "syslog").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Key management lives in [`ssh::privatekey`]:
//!
//! ```rust,no_run
//! use skiff_proto::ssh::privatekey::KeyPair;
//!
//! # fn main() -> skiff_platform::SkiffResult<()> {
//! let key = KeyPair::generate_rsa(2048)?;
//! key.write_key_files("user@example.org", "id_rsa", "id_rsa.pub")?;
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ssh;

pub use skiff_platform::{ErrorLog, ErrorRecord, SkiffError, SkiffResult};
