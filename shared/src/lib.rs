pub use anyhow::Error;
use std::{
    fs::{self, File, Permissions},
    io,
    net::IpAddr,
    os::unix::fs::PermissionsExt,
    path::Path,
};

pub mod types;

pub use types::*;

pub fn ensure_dirs_exist(dirs: &[&Path]) -> Result<(), WrappedIoError> {
    for dir in dirs {
        match fs::create_dir(dir).with_path(dir) {
            Ok(()) => {
                log::debug!("created dir {}", dir.to_string_lossy());
                std::fs::set_permissions(dir, Permissions::from_mode(0o700)).with_path(dir)?;
            },
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                warn_on_dangerous_mode(dir).with_path(dir)?;
            },
            Err(e) => {
                return Err(e);
            },
        }
    }
    Ok(())
}

pub fn warn_on_dangerous_mode(path: &Path) -> Result<(), io::Error> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    let permissions = metadata.permissions();
    let mode = permissions.mode() & 0o777;

    if mode & 0o007 != 0 {
        log::warn!(
            "{} is world-accessible (mode is {:#05o}). This is probably not what you want.",
            path.to_string_lossy(),
            mode
        );
    }
    Ok(())
}

/// Updates the permissions of a file or directory. Returns `Ok(true)` if
/// permissions had to be changed, `Ok(false)` if permissions were already
/// correct.
pub fn chmod(file: &File, new_mode: u32) -> Result<bool, io::Error> {
    let metadata = file.metadata()?;
    let mut permissions = metadata.permissions();
    let mode = permissions.mode() & 0o777;
    let updated = if mode != new_mode {
        permissions.set_mode(new_mode);
        file.set_permissions(permissions)?;
        true
    } else {
        false
    };

    Ok(updated)
}

/// An (interface name, address) pair that is a candidate for binding an
/// outbound UDP socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalInterfaceAddr {
    pub name: String,
    pub addr: IpAddr,
}

/// Enumerates the addresses of all local interfaces that are up, excluding
/// loopback and point-to-point links. Name-prefix and address blacklists are
/// the caller's concern, not ours.
pub fn local_interface_addrs() -> Result<Vec<LocalInterfaceAddr>, io::Error> {
    use nix::net::if_::InterfaceFlags;

    let addrs = nix::ifaddrs::getifaddrs()?
        .filter(|ifaddr| {
            ifaddr.flags.contains(InterfaceFlags::IFF_UP)
                && !ifaddr
                    .flags
                    .intersects(InterfaceFlags::IFF_LOOPBACK | InterfaceFlags::IFF_POINTOPOINT)
        })
        .filter_map(|ifaddr| {
            let storage = ifaddr.address?;
            let addr = if let Some(sin) = storage.as_sockaddr_in() {
                IpAddr::V4(sin.ip())
            } else if let Some(sin6) = storage.as_sockaddr_in6() {
                IpAddr::V6(sin6.ip())
            } else {
                return None;
            };
            Some(LocalInterfaceAddr {
                name: ifaddr.interface_name,
                addr,
            })
        })
        .collect();

    Ok(addrs)
}
