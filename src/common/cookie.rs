//! MIT-MAGIC-COOKIE generation and Xauthority files
//!
//! Every display gets a fresh shared secret that X clients must present.
//! The cookie is derived from system entropy mixed with per-process salt
//! and written into two authority files: one readable only by the slave
//! (handed to the X server) and one owned by the logged-in user.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// Authorization protocol name every entry carries.
pub const AUTH_NAME: &str = "MIT-MAGIC-COOKIE-1";

/// Xauthority address family for host-local connections.
pub const FAMILY_LOCAL: u16 = 0x0100;

/// Xauthority wildcard address family.
pub const FAMILY_WILD: u16 = 0xffff;

/// A display cookie in both the binary form stored in authority files and
/// the hex form sent over the daemon relay.
#[derive(Clone, PartialEq, Eq)]
pub struct Cookie {
    bytes: [u8; 16],
}

impl std::fmt::Debug for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret itself.
        f.write_str("Cookie(..)")
    }
}

impl Cookie {
    /// Generate a fresh cookie.
    ///
    /// Reads from the kernel entropy pool and stirs in pid and clock salt,
    /// then hashes the whole buffer down to 16 bytes. The hash step keeps
    /// the output uniform even if the entropy read came up short.
    pub fn generate() -> io::Result<Self> {
        let mut seed = [0u8; 32];
        let mut got = 0usize;
        if let Ok(mut urandom) = File::open("/dev/urandom") {
            got = urandom.read(&mut seed).unwrap_or(0);
        }
        let mut hasher = Sha256::new();
        hasher.update(&seed[..got]);
        hasher.update(std::process::id().to_ne_bytes());
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        hasher.update(now.as_nanos().to_ne_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Ok(Self { bytes })
    }

    /// Construct from raw bytes. Test helper and relay-side parser.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self { bytes }
    }

    /// Binary cookie value.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    /// Lowercase hex form used on the daemon relay and in logs meant for
    /// the daemon only.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(32);
        for byte in self.bytes {
            use std::fmt::Write as _;
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

/// One record of an Xauthority file.
pub struct XauthEntry<'a> {
    /// Address family (`FAMILY_LOCAL` for attached displays).
    pub family: u16,
    /// Address payload; the local hostname for `FAMILY_LOCAL`.
    pub address: &'a [u8],
    /// Display number as a decimal string.
    pub number: &'a str,
    /// Cookie to store.
    pub cookie: &'a Cookie,
}

impl XauthEntry<'_> {
    /// Serialize in the classic Xauthority framing: each field is a
    /// big-endian u16 length followed by the raw bytes.
    pub fn write_to(&self, out: &mut impl Write) -> io::Result<()> {
        out.write_all(&self.family.to_be_bytes())?;
        write_counted(out, self.address)?;
        write_counted(out, self.number.as_bytes())?;
        write_counted(out, AUTH_NAME.as_bytes())?;
        write_counted(out, self.cookie.as_bytes())?;
        Ok(())
    }
}

fn write_counted(out: &mut impl Write, data: &[u8]) -> io::Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "xauth field too long"))?;
    out.write_all(&len.to_be_bytes())?;
    out.write_all(data)
}

fn local_hostname() -> Vec<u8> {
    nix::unistd::gethostname()
        .map(|h| h.as_encoded_bytes().to_vec())
        .unwrap_or_else(|_| b"localhost".to_vec())
}

/// Write the slave-owned authority file handed to the X server.
///
/// The file is created mode 0600 under `auth_dir` and truncated if a stale
/// one is left over from a previous incarnation of the display.
pub fn write_server_auth(auth_dir: &Path, display_name: &str, number: u16, cookie: &Cookie) -> io::Result<PathBuf> {
    std::fs::create_dir_all(auth_dir)?;
    let sanitized = display_name.replace(':', "_");
    let path = auth_dir.join(format!("auth-{sanitized}"));
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)?;
    let number = number.to_string();
    let hostname = local_hostname();
    XauthEntry { family: FAMILY_LOCAL, address: &hostname, number: &number, cookie }
        .write_to(&mut file)?;
    file.sync_all()?;
    Ok(path)
}

/// Write the per-user authority file for an authenticated login.
///
/// Created mode 0600 and chowned to the session owner so the user's X
/// clients can authenticate after the privilege drop.
pub fn write_user_auth(
    path: &Path,
    number: u16,
    cookie: &Cookie,
    uid: u32,
    gid: u32,
) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    let number = number.to_string();
    let hostname = local_hostname();
    XauthEntry { family: FAMILY_LOCAL, address: &hostname, number: &number, cookie }
        .write_to(&mut file)?;
    file.sync_all()?;
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    )
    .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookies_are_unique_and_hex_is_stable() {
        let a = Cookie::generate().unwrap();
        let b = Cookie::generate().unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.to_hex().len(), 32);
        assert!(a.to_hex().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn debug_never_leaks_the_secret() {
        let cookie = Cookie::from_bytes([0xab; 16]);
        let printed = format!("{cookie:?}");
        assert!(!printed.contains("ab"));
    }

    #[test]
    fn xauth_entry_framing() {
        let cookie = Cookie::from_bytes([0x11; 16]);
        let entry = XauthEntry { family: FAMILY_LOCAL, address: b"host", number: "0", cookie: &cookie };
        let mut buf = Vec::new();
        entry.write_to(&mut buf).unwrap();

        // family, then length-prefixed address / number / name / data
        assert_eq!(&buf[0..2], &FAMILY_LOCAL.to_be_bytes());
        assert_eq!(&buf[2..4], &4u16.to_be_bytes());
        assert_eq!(&buf[4..8], b"host");
        assert_eq!(&buf[8..10], &1u16.to_be_bytes());
        assert_eq!(&buf[10..11], b"0");
        let name_len = u16::from_be_bytes([buf[11], buf[12]]) as usize;
        assert_eq!(&buf[13..13 + name_len], AUTH_NAME.as_bytes());
        let data_off = 13 + name_len;
        assert_eq!(
            u16::from_be_bytes([buf[data_off], buf[data_off + 1]]),
            16
        );
        assert_eq!(&buf[data_off + 2..], &[0x11; 16]);
    }

    #[test]
    fn server_auth_file_written_with_tight_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let cookie = Cookie::generate().unwrap();
        let path = write_server_auth(dir.path(), ":2", 2, &cookie).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert!(meta.len() > 20);
    }
}
