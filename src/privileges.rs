//! Process identity handling. One invocation may move between three
//! capability levels: the invoking operator, the service account that owns
//! all instance data, and root for systemd and ownership changes.
//!
//! Real-identity changes happen exactly once, in [`ensure_privilege`], by
//! replacing the whole process under sudo. Everything after that point only
//! toggles *effective* ids through scoped [`IdentityGuard`]s, so an error
//! return can never leave the process at the wrong privilege.

use std::{
    ffi::{CStr, CString},
    io, mem,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::Command,
    ptr,
};

use crate::settings::Settings;

#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    #[error("Unknown user: {0}")]
    UnknownUser(String),
    #[error("failed to re-execute under sudo: {0}")]
    Exec(io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Minimum starting identity a command declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    Operator,
    Service,
    Root,
}

#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub home: PathBuf,
}

pub fn lookup_user(name: &str) -> Result<User, PrivilegeError> {
    let cname = CString::new(name).map_err(|_| PrivilegeError::UnknownUser(name.to_string()))?;
    let mut pwd: libc::passwd = unsafe { mem::zeroed() };
    let mut buf = vec![0i8; 4096];
    let mut result: *mut libc::passwd = ptr::null_mut();

    let rc = unsafe {
        libc::getpwnam_r(
            cname.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 {
        return Err(PrivilegeError::Io(io::Error::from_raw_os_error(rc)));
    }
    if result.is_null() {
        return Err(PrivilegeError::UnknownUser(name.to_string()));
    }

    let home = unsafe { CStr::from_ptr(pwd.pw_dir) }
        .to_string_lossy()
        .into_owned();
    Ok(User {
        name: name.to_string(),
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
        home: PathBuf::from(home),
    })
}

pub fn real_uid() -> libc::uid_t {
    unsafe { libc::getuid() }
}

/// The invoking user's passwd entry.
pub fn current_user() -> Result<User, PrivilegeError> {
    let uid = real_uid();
    let mut pwd: libc::passwd = unsafe { mem::zeroed() };
    let mut buf = vec![0i8; 4096];
    let mut result: *mut libc::passwd = ptr::null_mut();

    let rc = unsafe {
        libc::getpwuid_r(
            uid,
            &mut pwd,
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 {
        return Err(PrivilegeError::Io(io::Error::from_raw_os_error(rc)));
    }
    if result.is_null() {
        return Err(PrivilegeError::UnknownUser(format!("uid {uid}")));
    }

    let name = unsafe { CStr::from_ptr(pwd.pw_name) }
        .to_string_lossy()
        .into_owned();
    let home = unsafe { CStr::from_ptr(pwd.pw_dir) }
        .to_string_lossy()
        .into_owned();
    Ok(User {
        name,
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
        home: PathBuf::from(home),
    })
}

/// Whether a process with real uid `real` already satisfies `target`.
/// Root satisfies every target.
fn is_sufficient(real: libc::uid_t, target: libc::uid_t) -> bool {
    real == 0 || real == target
}

/// Make sure the process runs with at least `required` real identity.
/// If it does not, the process is replaced with `sudo [-u user] <argv>`
/// and this call never returns. This is the only place full-process
/// replacement occurs, which keeps sudo's audit log the single record of
/// every elevation.
pub fn ensure_privilege(required: Identity, settings: &Settings) -> Result<(), PrivilegeError> {
    let target = match required {
        Identity::Operator => return Ok(()),
        Identity::Service => lookup_user(&settings.system.server_user)?,
        Identity::Root => User {
            name: "root".to_string(),
            uid: 0,
            gid: 0,
            home: PathBuf::from("/root"),
        },
    };

    if is_sufficient(real_uid(), target.uid) {
        return Ok(());
    }

    tracing::info!(user = %target.name, "re-executing under sudo");
    let mut cmd = Command::new("sudo");
    if target.uid != 0 {
        cmd.args(["-u", &target.name]);
    }
    cmd.args(std::env::args_os());
    Err(PrivilegeError::Exec(cmd.exec()))
}

/// Scoped effective-identity switch. Restores the previous effective ids on
/// drop, on every exit path. Guards nest; each one remembers the ids it
/// replaced.
#[derive(Debug)]
pub struct IdentityGuard {
    prev_euid: libc::uid_t,
    prev_egid: libc::gid_t,
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        if let Err(err) = set_effective_ids(self.prev_euid, self.prev_egid) {
            tracing::error!(error = %err, "failed to restore effective identity");
        }
    }
}

/// Run the rest of the scope with the given effective ids.
pub fn run_as(uid: libc::uid_t, gid: libc::gid_t) -> Result<IdentityGuard, PrivilegeError> {
    let prev_euid = unsafe { libc::geteuid() };
    let prev_egid = unsafe { libc::getegid() };
    set_effective_ids(uid, gid)?;
    Ok(IdentityGuard {
        prev_euid,
        prev_egid,
    })
}

pub fn run_as_user(user: &User) -> Result<IdentityGuard, PrivilegeError> {
    run_as(user.uid, user.gid)
}

/// Regain full privilege for the duration of the guard. Only meaningful
/// after the process was started (or re-executed) as root.
pub fn run_elevated() -> Result<IdentityGuard, PrivilegeError> {
    run_as(0, 0)
}

/// Best-effort elevation for operations that degrade gracefully without
/// root, like re-owning files the current account already owns. A process
/// whose real identity is not root keeps its effective ids.
pub fn try_elevate() -> Option<IdentityGuard> {
    if real_uid() != 0 {
        return None;
    }
    match run_elevated() {
        Ok(guard) => Some(guard),
        Err(err) => {
            tracing::warn!(error = %err, "could not regain root");
            None
        }
    }
}

fn set_effective_ids(uid: libc::uid_t, gid: libc::gid_t) -> io::Result<()> {
    unsafe {
        // The saved set-user-ID stays root after sudo, so stepping back up
        // before switching groups is always permitted.
        if libc::geteuid() != 0 && libc::seteuid(0) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setegid(gid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if uid != 0 && libc::seteuid(uid) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Drop a child process to the service account before exec. The switch is
/// of the *real* ids, so the server cannot climb back up.
pub fn demote_child(cmd: &mut Command, user: &User) {
    let uid = user.uid;
    let gid = user.gid;
    unsafe {
        cmd.pre_exec(move || {
            if libc::getuid() == 0 || libc::geteuid() == 0 {
                libc::seteuid(0);
                libc::setegid(0);
                if libc::setgid(gid) != 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::setuid(uid) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_satisfies_everything() {
        assert!(is_sufficient(0, 0));
        assert!(is_sufficient(0, 1000));
    }

    #[test]
    fn matching_uid_is_sufficient() {
        assert!(is_sufficient(1000, 1000));
        assert!(!is_sufficient(1000, 0));
        assert!(!is_sufficient(1000, 1001));
    }

    #[test]
    fn operator_never_re_executes() {
        let settings = Settings::default();
        ensure_privilege(Identity::Operator, &settings).unwrap();
    }

    #[test]
    fn lookup_unknown_user_fails() {
        let err = lookup_user("craftctl-no-such-user").unwrap_err();
        assert!(matches!(err, PrivilegeError::UnknownUser(_)));
    }

    #[test]
    fn lookup_root_resolves() {
        let root = lookup_user("root").unwrap();
        assert_eq!(root.uid, 0);
    }
}
