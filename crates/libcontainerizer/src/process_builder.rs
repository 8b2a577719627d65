//! Builds the OCI process for an exec from the API-level process spec.

use std::path::PathBuf;

use oci_spec::runtime::{
    Box as ConsoleBox, BoxBuilder, Capabilities, Capability, LinuxCapabilities,
    LinuxCapabilitiesBuilder,
    PosixRlimit, PosixRlimitBuilder, PosixRlimitType, Process, ProcessBuilder as OciProcessBuilder,
    UserBuilder,
};
use serde::{Deserialize, Serialize};

use crate::bundle::BundleSpec;
use crate::error::{ContainerizerError, Result};
use crate::user::{ExecUser, DEFAULT_USER};

pub const DEFAULT_ROOT_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
pub const DEFAULT_PATH: &str = "PATH=/usr/local/bin:/usr/bin:/bin";

const DEFAULT_CONSOLE_WIDTH: u64 = 80;
const DEFAULT_CONSOLE_HEIGHT: u64 = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtySpec {
    #[serde(default)]
    pub window_size: Option<WindowSize>,
}

/// Per-process rlimits; each limit sets both the soft and the hard value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    #[serde(rename = "as")]
    pub as_: Option<u64>,
    pub core: Option<u64>,
    pub cpu: Option<u64>,
    pub data: Option<u64>,
    pub fsize: Option<u64>,
    pub locks: Option<u64>,
    pub memlock: Option<u64>,
    pub msgqueue: Option<u64>,
    pub nice: Option<u64>,
    pub nofile: Option<u64>,
    pub nproc: Option<u64>,
    pub rss: Option<u64>,
    pub rtprio: Option<u64>,
    pub sigpending: Option<u64>,
    pub stack: Option<u64>,
}

impl ResourceLimits {
    fn rlimits(&self) -> Result<Vec<PosixRlimit>> {
        [
            (PosixRlimitType::RlimitAs, self.as_),
            (PosixRlimitType::RlimitCore, self.core),
            (PosixRlimitType::RlimitCpu, self.cpu),
            (PosixRlimitType::RlimitData, self.data),
            (PosixRlimitType::RlimitFsize, self.fsize),
            (PosixRlimitType::RlimitLocks, self.locks),
            (PosixRlimitType::RlimitMemlock, self.memlock),
            (PosixRlimitType::RlimitMsgqueue, self.msgqueue),
            (PosixRlimitType::RlimitNice, self.nice),
            (PosixRlimitType::RlimitNofile, self.nofile),
            (PosixRlimitType::RlimitNproc, self.nproc),
            (PosixRlimitType::RlimitRss, self.rss),
            (PosixRlimitType::RlimitRtprio, self.rtprio),
            (PosixRlimitType::RlimitSigpending, self.sigpending),
            (PosixRlimitType::RlimitStack, self.stack),
        ]
        .into_iter()
        .filter_map(|(typ, value)| value.map(|value| (typ, value)))
        .map(|(typ, value)| {
            PosixRlimitBuilder::default()
                .typ(typ)
                .soft(value)
                .hard(value)
                .build()
                .map_err(|err| ContainerizerError::backend("build rlimit", err))
        })
        .collect()
    }
}

/// A process as requested through the container API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSpec {
    pub id: String,
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub user: String,
    pub dir: String,
    pub tty: Option<TtySpec>,
    pub limits: ResourceLimits,
}

/// Container env first, then process env; `USER` and `PATH` are added when
/// neither provides them.
pub fn unix_env_for(bundle: &BundleSpec, spec: &ProcessSpec, container_uid: u32) -> Vec<String> {
    let mut env: Vec<String> = bundle
        .process()
        .and_then(|process| process.env().clone())
        .unwrap_or_default();
    env.extend(spec.env.iter().cloned());

    let has = |env: &[String], key: &str| {
        env.iter()
            .any(|var| var.split_once('=').map(|(k, _)| k) == Some(key))
    };

    if !has(&env, "USER") {
        let user = if spec.user.is_empty() {
            DEFAULT_USER
        } else {
            spec.user.as_str()
        };
        env.push(format!("USER={user}"));
    }

    if !has(&env, "PATH") {
        let path = if container_uid == 0 {
            DEFAULT_ROOT_PATH
        } else {
            DEFAULT_PATH
        };
        env.push(path.to_owned());
    }

    env
}

/// The most a non-root process may keep from its container's bounding set:
/// the unprivileged container set plus CAP_SYS_ADMIN.
pub fn default_non_root_max_caps() -> Capabilities {
    [
        Capability::Chown,
        Capability::DacOverride,
        Capability::Fsetid,
        Capability::Fowner,
        Capability::Mknod,
        Capability::NetRaw,
        Capability::Setgid,
        Capability::Setuid,
        Capability::Setfcap,
        Capability::Setpcap,
        Capability::NetBindService,
        Capability::SysChroot,
        Capability::Kill,
        Capability::AuditWrite,
        Capability::SysAdmin,
    ]
    .into_iter()
    .collect()
}

#[derive(Debug, Clone)]
pub struct ProcessBuilder {
    non_root_max_caps: Capabilities,
}

impl Default for ProcessBuilder {
    fn default() -> Self {
        ProcessBuilder::new(default_non_root_max_caps())
    }
}

impl ProcessBuilder {
    pub fn new(non_root_max_caps: Capabilities) -> Self {
        ProcessBuilder { non_root_max_caps }
    }

    /// Builds the OCI process for `spec` running as `user` (container ids).
    pub fn build_process(
        &self,
        bundle: &BundleSpec,
        spec: &ProcessSpec,
        user: &ExecUser,
    ) -> Result<Process> {
        let mut args = Vec::with_capacity(spec.args.len() + 1);
        args.push(spec.path.clone());
        args.extend(spec.args.iter().cloned());

        let oci_user = UserBuilder::default()
            .uid(user.uid)
            .gid(user.gid)
            .additional_gids(Vec::<u32>::new())
            .username(spec.user.clone())
            .build()
            .map_err(|err| ContainerizerError::backend("build process user", err))?;

        let rlimits = spec.limits.rlimits()?;

        let mut process = OciProcessBuilder::default()
            .args(args)
            .env(unix_env_for(bundle, spec, user.uid))
            .user(oci_user)
            .cwd(PathBuf::from(&spec.dir))
            .terminal(spec.tty.is_some())
            .console_size(console(spec)?)
            .build()
            .map_err(|err| ContainerizerError::backend("build process", err))?;

        process.set_capabilities(self.capabilities(bundle, user.uid)?);
        process.set_rlimits((!rlimits.is_empty()).then_some(rlimits));
        process.set_apparmor_profile(bundle.apparmor_profile().map(str::to_owned));

        Ok(process)
    }

    fn capabilities(
        &self,
        bundle: &BundleSpec,
        container_uid: u32,
    ) -> Result<Option<LinuxCapabilities>> {
        let mut caps: Capabilities = bundle
            .capabilities()
            .and_then(|caps| caps.bounding().clone())
            .unwrap_or_default();
        if container_uid != 0 {
            caps.retain(|cap| self.non_root_max_caps.contains(cap));
        }

        if caps.is_empty() {
            return Ok(None);
        }

        let mut linux_caps = LinuxCapabilitiesBuilder::default()
            .bounding(caps.clone())
            .inheritable(caps.clone())
            .permitted(caps)
            .build()
            .map_err(|err| ContainerizerError::backend("build capabilities", err))?;
        linux_caps.set_effective(None);
        linux_caps.set_ambient(None);

        Ok(Some(linux_caps))
    }
}

fn console(spec: &ProcessSpec) -> Result<ConsoleBox> {
    let (width, height) = match spec.tty.as_ref().and_then(|tty| tty.window_size) {
        Some(size) => (u64::from(size.columns), u64::from(size.rows)),
        None => (DEFAULT_CONSOLE_WIDTH, DEFAULT_CONSOLE_HEIGHT),
    };

    BoxBuilder::default()
        .width(width)
        .height(height)
        .build()
        .map_err(|err| ContainerizerError::backend("build console size", err))
}
