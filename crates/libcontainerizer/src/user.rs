//! Resolution of process users against a container rootfs and creation of
//! working directories owned by the container's root.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use nix::unistd::{chown, Gid, Uid};

use crate::error::{ContainerizerError, Result};

pub const DEFAULT_USER: &str = "root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecUser {
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl Default for ExecUser {
    fn default() -> Self {
        ExecUser {
            uid: 0,
            gid: 0,
            home: PathBuf::from("/"),
        }
    }
}

#[cfg_attr(test, automock)]
pub trait UserLookupper: Send + Sync {
    /// Resolves `user` (`name`, `uid`, `name:group` or `uid:gid`) inside the
    /// rootfs at `rootfs`.
    fn lookup(&self, rootfs: &Path, user: &str) -> Result<ExecUser>;
}

#[cfg_attr(test, automock)]
pub trait Mkdirer: Send + Sync {
    /// Creates `path` inside `rootfs`, chowning every directory it creates.
    fn mkdir_as(&self, rootfs: &Path, uid: u32, gid: u32, mode: u32, path: &Path) -> Result<()>;
}

/// Looks users up in `<rootfs>/etc/passwd` and `<rootfs>/etc/group`.
#[derive(Debug, Default, Clone)]
pub struct PasswdLookupper;

#[derive(Debug)]
struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
    home: PathBuf,
}

fn parse_passwd(contents: &str) -> Vec<PasswdEntry> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 6 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_owned(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: PathBuf::from(fields[5]),
            })
        })
        .collect()
}

fn parse_group(contents: &str) -> Vec<(String, u32)> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 {
                return None;
            }
            Some((fields[0].to_owned(), fields[2].parse().ok()?))
        })
        .collect()
}

fn read_optional(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(ContainerizerError::io(path, err)),
    }
}

impl UserLookupper for PasswdLookupper {
    fn lookup(&self, rootfs: &Path, user: &str) -> Result<ExecUser> {
        let (user_part, group_part) = match user.split_once(':') {
            Some((user, group)) => (user, Some(group)),
            None => (user, None),
        };

        let passwd = parse_passwd(&read_optional(&rootfs.join("etc/passwd"))?);
        let entry = passwd.iter().find(|entry| {
            entry.name == user_part || user_part.parse::<u32>().ok() == Some(entry.uid)
        });

        let mut resolved = match (entry, user_part.parse::<u32>()) {
            (Some(entry), _) => ExecUser {
                uid: entry.uid,
                gid: entry.gid,
                home: entry.home.clone(),
            },
            (None, Ok(uid)) => ExecUser {
                uid,
                ..ExecUser::default()
            },
            (None, Err(_)) if user_part.is_empty() => ExecUser::default(),
            (None, Err(_)) => {
                return Err(ContainerizerError::backend(
                    "lookup user",
                    format!("unable to find user {user_part}: no matching entries in passwd file"),
                ))
            }
        };

        if let Some(group) = group_part {
            resolved.gid = match group.parse::<u32>() {
                Ok(gid) => gid,
                Err(_) => {
                    let groups = parse_group(&read_optional(&rootfs.join("etc/group"))?);
                    groups
                        .iter()
                        .find(|(name, _)| name == group)
                        .map(|(_, gid)| *gid)
                        .ok_or_else(|| {
                            ContainerizerError::backend(
                                "lookup user",
                                format!("unable to find group {group}: no matching entries in group file"),
                            )
                        })?
                }
            };
        }

        Ok(resolved)
    }
}

/// Creates directories inside a rootfs with host ownership.
#[derive(Debug, Default, Clone)]
pub struct RootfsMkdirer;

impl Mkdirer for RootfsMkdirer {
    fn mkdir_as(&self, rootfs: &Path, uid: u32, gid: u32, mode: u32, path: &Path) -> Result<()> {
        let mut current = rootfs.to_path_buf();
        for component in path.components() {
            // `..` and the root are skipped so the path never escapes the rootfs
            let Component::Normal(part) = component else {
                continue;
            };
            current.push(part);

            if current.exists() {
                continue;
            }

            fs::DirBuilder::new()
                .mode(mode)
                .create(&current)
                .map_err(|err| ContainerizerError::io(&current, err))?;
            // mode is masked by the umask on creation
            fs::set_permissions(&current, fs::Permissions::from_mode(mode))
                .map_err(|err| ContainerizerError::io(&current, err))?;
            chown(
                &current,
                Some(Uid::from_raw(uid)),
                Some(Gid::from_raw(gid)),
            )
            .map_err(|err| ContainerizerError::io(&current, err.into()))?;
        }

        Ok(())
    }
}
