//! Persistent state objects under the home directory.
//!
//! The engine owns the contents of these objects; the store only decides
//! where they live, keeps secret material owner-only, and coalesces
//! rewrites of identical bytes.

use crate::engine::StateObject;
use rand::Rng;
use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};
use tapmesh_shared::{chmod, ensure_dirs_exist, IoErrorContext, WrappedIoError};

pub(crate) const NETWORKS_DIR: &str = "networks.d";
pub(crate) const PEERS_DIR: &str = "peers.d";
pub(crate) const AUTHTOKEN_FILE: &str = "authtoken.secret";

const AUTHTOKEN_LEN: usize = 24;

/// Objects larger than this are truncated on read; nothing the engine
/// persists legitimately grows past it.
const MAX_STATE_OBJECT_SIZE: usize = 65535;

pub(crate) struct StateStore {
    home: PathBuf,
    allow_network_caching: bool,
    allow_peer_caching: bool,
}

impl StateStore {
    pub fn open(
        home: &Path,
        allow_network_caching: bool,
        allow_peer_caching: bool,
    ) -> Result<Self, WrappedIoError> {
        ensure_dirs_exist(&[home, &home.join(NETWORKS_DIR), &home.join(PEERS_DIR)])?;
        Ok(Self {
            home: home.to_path_buf(),
            allow_network_caching,
            allow_peer_caching,
        })
    }

    fn object_path(&self, object: StateObject) -> PathBuf {
        match object {
            StateObject::IdentityPublic => self.home.join("identity.public"),
            StateObject::IdentitySecret => self.home.join("identity.secret"),
            StateObject::Planet => self.home.join("planet"),
            StateObject::NetworkConfig(nwid) => {
                self.home.join(NETWORKS_DIR).join(format!("{nwid}.conf"))
            },
            StateObject::Peer(addr) => self.home.join(PEERS_DIR).join(format!("{addr}.peer")),
        }
    }

    fn is_secure(object: StateObject) -> bool {
        matches!(
            object,
            StateObject::IdentitySecret | StateObject::NetworkConfig(_)
        )
    }

    fn caching_allows(&self, object: StateObject) -> bool {
        match object {
            StateObject::NetworkConfig(_) => self.allow_network_caching,
            StateObject::Peer(_) => self.allow_peer_caching,
            _ => true,
        }
    }

    /// Writes (or with `None`, deletes) an object. Returns whether the disk
    /// was touched; a write of bytes identical to the current contents is
    /// skipped.
    pub fn put(&self, object: StateObject, data: Option<&[u8]>) -> io::Result<bool> {
        if !self.caching_allows(object) {
            log::trace!("dropping state object {object:?} (caching disabled)");
            return Ok(false);
        }
        let path = self.object_path(object);

        let data = match data {
            Some(data) => data,
            None => {
                return match fs::remove_file(&path) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e),
                };
            },
        };

        if let Ok(existing) = fs::read(&path) {
            if existing == data {
                return Ok(false);
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&path)?;
        if Self::is_secure(object) {
            chmod(&file, 0o600)?;
        }
        file.write_all(data)?;
        Ok(true)
    }

    /// Reads an object; missing files and read errors both come back as
    /// `None`.
    pub fn get(&self, object: StateObject) -> Option<Vec<u8>> {
        let mut data = fs::read(self.object_path(object)).ok()?;
        data.truncate(MAX_STATE_OBJECT_SIZE);
        Some(data)
    }

    /// Deletes cached peer state older than `max_age`. Returns how many
    /// files were removed.
    pub fn clean_peer_cache(&self, max_age: Duration) -> usize {
        let dir = self.home.join(PEERS_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("cannot scan {}: {}", dir.to_string_lossy(), e);
                return 0;
            },
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let age = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.map_or(false, |age| age > max_age) && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            log::debug!("reaped {removed} stale peer cache files");
        }
        removed
    }
}

/// Reads the node's auth token, generating and persisting a fresh one
/// (owner-only) if it is missing or malformed.
pub(crate) fn load_auth_token(home: &Path) -> Result<String, WrappedIoError> {
    let path = home.join(AUTHTOKEN_FILE);

    if let Ok(existing) = fs::read_to_string(&path) {
        let existing = existing.trim_end().to_string();
        if existing.len() == AUTHTOKEN_LEN
            && existing
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Ok(existing);
        }
        log::warn!("regenerating malformed {}", path.to_string_lossy());
    }

    let mut rng = rand::thread_rng();
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let token: String = (0..AUTHTOKEN_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();

    let mut file = File::create(&path).with_path(&path)?;
    chmod(&file, 0o600).with_path(&path)?;
    file.write_all(token.as_bytes()).with_path(&path)?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tapmesh_shared::{NetworkId, PeerAddr};

    fn open_store(home: &Path) -> StateStore {
        StateStore::open(home, true, true).unwrap()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let object = StateObject::NetworkConfig(NetworkId(0x8056c2e21c000001));

        assert!(store.put(object, Some(b"opaque config bytes")).unwrap());
        assert_eq!(store.get(object).unwrap(), b"opaque config bytes");
        assert!(dir
            .path()
            .join("networks.d/8056c2e21c000001.conf")
            .exists());
    }

    #[test]
    fn test_identical_put_is_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let object = StateObject::Planet;

        assert!(store.put(object, Some(b"planet")).unwrap());
        assert!(!store.put(object, Some(b"planet")).unwrap());
        assert!(store.put(object, Some(b"planet v2")).unwrap());
    }

    #[test]
    fn test_none_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let object = StateObject::Peer(PeerAddr(0x89e92ceee5));

        store.put(object, Some(b"cached")).unwrap();
        assert!(store.put(object, None).unwrap());
        assert_eq!(store.get(object), None);
        // Deleting again is a no-op, not an error.
        assert!(!store.put(object, None).unwrap());
    }

    #[test]
    fn test_secret_objects_are_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store
            .put(StateObject::IdentitySecret, Some(b"secret identity"))
            .unwrap();
        let mode = fs::metadata(dir.path().join("identity.secret"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_caching_flags_drop_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path(), false, false).unwrap();

        let network = StateObject::NetworkConfig(NetworkId(1));
        let peer = StateObject::Peer(PeerAddr(2));
        assert!(!store.put(network, Some(b"x")).unwrap());
        assert!(!store.put(peer, Some(b"x")).unwrap());
        assert_eq!(store.get(network), None);
        assert_eq!(store.get(peer), None);

        // Identity is unaffected by the caching flags.
        assert!(store.put(StateObject::IdentityPublic, Some(b"id")).unwrap());
    }

    #[test]
    fn test_peer_cache_reaping() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store
            .put(StateObject::Peer(PeerAddr(0x89e92ceee5)), Some(b"cached"))
            .unwrap();

        // A generous max age keeps the fresh file...
        assert_eq!(store.clean_peer_cache(Duration::from_secs(3600)), 0);
        // ...a zero max age reaps it.
        assert_eq!(store.clean_peer_cache(Duration::ZERO), 1);
        assert_eq!(store.get(StateObject::Peer(PeerAddr(0x89e92ceee5))), None);
    }

    #[test]
    fn test_auth_token_persists() {
        let dir = tempfile::tempdir().unwrap();
        let token = load_auth_token(dir.path()).unwrap();
        assert_eq!(token.len(), 24);
        assert!(token
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));

        let mode = fs::metadata(dir.path().join(AUTHTOKEN_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        assert_eq!(load_auth_token(dir.path()).unwrap(), token);
    }

    #[test]
    fn test_malformed_auth_token_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(AUTHTOKEN_FILE), "TOO SHORT").unwrap();
        let token = load_auth_token(dir.path()).unwrap();
        assert_eq!(token.len(), 24);
    }
}
