//! Identity & Key Store (spec §4.1).

use std::{
    fs,
    io,
    os::unix::fs::PermissionsExt,
    path::Path,
};

use wireguard_control::Key;

use crate::TunnelError;

const PRIVATE_KEY_FILE: &str = "private";
const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// Ensures a tunnel keypair exists under `dir`, generating one on first run.
///
/// Idempotent across restarts on the same host: if `dir/private` already
/// exists it is read and the public key re-derived, never regenerated.
/// Returns `(private_key, public_key)` as trimmed base64 strings.
pub fn ensure_keys(dir: &Path) -> Result<(String, String), TunnelError> {
    let key_path = dir.join(PRIVATE_KEY_FILE);

    if !key_path.exists() {
        fs::create_dir_all(dir).map_err(|source| TunnelError::KeyDir { source })?;
        set_mode(dir, DIR_MODE).map_err(|source| TunnelError::KeyDir { source })?;

        let private_key = Key::generate_private();
        write_private_key(&key_path, &private_key)?;
        tracing::info!(path = %key_path.display(), "generated new tunnel private key");
    }

    let private_key = read_private_key(&key_path)?;
    let public_key = private_key.get_public();

    Ok((private_key.to_base64(), public_key.to_base64()))
}

fn write_private_key(path: &Path, key: &Key) -> Result<(), TunnelError> {
    fs::write(path, key.to_base64()).map_err(|source| TunnelError::KeyWrite { source })?;
    set_mode(path, FILE_MODE).map_err(|source| TunnelError::KeyWrite { source })
}

fn read_private_key(path: &Path) -> Result<Key, TunnelError> {
    let raw = fs::read_to_string(path).map_err(|source| TunnelError::KeyRead { source })?;
    Key::from_base64(raw.trim()).map_err(|_| TunnelError::MalformedKey { path: path.to_path_buf() })
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generates_once_and_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("wg0");

        let (priv1, pub1) = ensure_keys(&dir).unwrap();
        let (priv2, pub2) = ensure_keys(&dir).unwrap();

        assert_eq!(priv1, priv2, "second run must not regenerate the private key");
        assert_eq!(pub1, pub2);

        let meta = fs::metadata(dir.join(PRIVATE_KEY_FILE)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, FILE_MODE);
    }
}
