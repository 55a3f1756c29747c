use shellbox_core::ExecutionRequest;
use std::time::Duration;

const CPU_PERIOD_MICROS: i64 = 100_000;
const SANDBOX_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Administrator-tunable resource ceilings. Everything else about the
/// isolation profile is fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub image: String,
    /// Memory ceiling in bytes. Swap is capped at the same value.
    pub memory_limit: u64,
    /// Max number of PIDs (fork bomb protection).
    pub pids_limit: u32,
    /// Per-process file size ceiling in bytes (`RLIMIT_FSIZE`).
    pub file_size_limit: u64,
    /// Share of one CPU core, in percent.
    pub cpu_percent: u32,
    /// Size cap of each writable tmpfs mount, in bytes.
    pub tmpfs_size: u64,
    pub uid: u32,
    pub gid: u32,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_owned(),
            memory_limit: 128 * 1024 * 1024, // 128 MiB
            pids_limit: 10,
            file_size_limit: 1024 * 1024, // 1 MiB
            cpu_percent: 50,
            tmpfs_size: 16 * 1024 * 1024, // 16 MiB
            uid: 1000,
            gid: 1000,
        }
    }
}

/// Container network mode. Sandboxed scripts never get a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    None,
}

impl NetworkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
        }
    }
}

/// A writable scratch mount inside an otherwise read-only root filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TmpfsMount {
    pub path: String,
    pub size: u64,
}

impl TmpfsMount {
    /// Mount options: writable, but nothing on it can be executed or setuid.
    pub fn options(&self) -> String {
        format!("rw,noexec,nosuid,nodev,size={}", self.size)
    }
}

/// Complete isolation and resource policy for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxProfile {
    pub image: String,
    pub working_dir: String,
    /// Numeric `uid:gid`, never root.
    pub user: String,
    pub network: NetworkMode,
    pub memory_limit: u64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub pids_limit: u32,
    pub file_size_limit: u64,
    pub read_only_root: bool,
    pub tmpfs: Vec<TmpfsMount>,
    /// Capabilities dropped at create time. `ALL` leaves an empty set.
    pub cap_drop: Vec<String>,
    pub no_new_privileges: bool,
    /// The full container environment; nothing is inherited from the host.
    pub env: Vec<String>,
    /// Hard cutoff enforced by `timeout` inside the container, independent
    /// of the capture deadline.
    pub wall_clock_cutoff: Duration,
    pub auto_remove: bool,
}

impl SandboxProfile {
    /// Argv for the container: the script runs under an in-container
    /// `timeout`, passed as a single argument so it is never re-quoted.
    pub fn command(&self, script: &str) -> Vec<String> {
        vec![
            "timeout".to_owned(),
            "-s".to_owned(),
            "KILL".to_owned(),
            self.wall_clock_cutoff.as_secs().to_string(),
            "sh".to_owned(),
            "-c".to_owned(),
            script.to_owned(),
        ]
    }
}

/// Turns accepted requests into isolation profiles.
#[derive(Debug, Clone, Default)]
pub struct ProfileBuilder {
    limits: SandboxLimits,
}

impl ProfileBuilder {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Build the profile for `request`. Only the (already clamped) timeout
    /// flows from the request into the profile.
    pub fn build(&self, request: &ExecutionRequest) -> SandboxProfile {
        let limits = &self.limits;
        let cpu_quota = (CPU_PERIOD_MICROS * i64::from(limits.cpu_percent.clamp(1, 100)) / 100)
            .max(1_000);

        SandboxProfile {
            image: limits.image.clone(),
            working_dir: "/tmp".to_owned(),
            user: format!("{}:{}", limits.uid.max(1), limits.gid.max(1)),
            network: NetworkMode::None,
            memory_limit: limits.memory_limit,
            cpu_period: CPU_PERIOD_MICROS,
            cpu_quota,
            pids_limit: limits.pids_limit.max(1),
            file_size_limit: limits.file_size_limit,
            read_only_root: true,
            tmpfs: ["/tmp", "/var/tmp"]
                .into_iter()
                .map(|path| TmpfsMount {
                    path: path.to_owned(),
                    size: limits.tmpfs_size,
                })
                .collect(),
            cap_drop: vec!["ALL".to_owned()],
            no_new_privileges: true,
            env: vec![
                SANDBOX_PATH.to_owned(),
                "HOME=/tmp".to_owned(),
                "LANG=C.UTF-8".to_owned(),
            ],
            wall_clock_cutoff: in_container_cutoff(request.timeout()),
            auto_remove: true,
        }
    }
}

/// Whole seconds for the in-container `timeout`: rounded up, plus one second
/// of grace so the external deadline normally fires first.
fn in_container_cutoff(timeout: Duration) -> Duration {
    let millis = timeout.as_millis().max(1);
    let secs = millis.div_ceil(1000) + 1;
    Duration::from_secs(u64::try_from(secs).unwrap_or(u64::MAX))
}

/// Parse a size string like "2g", "128m", "1024k" into bytes.
pub fn parse_size(s: &str) -> anyhow::Result<u64> {
    let s = s.trim().to_ascii_lowercase();
    if s.is_empty() || s == "0" {
        return Ok(0);
    }

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('g') {
        (n, 1024 * 1024 * 1024u64)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 1024 * 1024u64)
    } else if let Some(n) = s.strip_suffix('k') {
        (n, 1024u64)
    } else {
        (s.as_str(), 1u64)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid size '{s}': {e}"))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("size '{s}' overflows"))
}
