//! Network and syscall policy applied to every sandbox.
//!
//! Egress is denied by default; a spec's allow-list is translated into
//! backend rules (firewall entries, CNI annotations, or an advisory
//! environment marker for local processes). Syscall filtering blocks a
//! fixed deny-list of classes; the concrete syscall table behind each
//! class is produced per variant since it varies by host kernel.

use serde::{Deserialize, Serialize};

use crate::spec::EgressPolicy;

/// Signal delivered by the kernel when a seccomp filter kills a process.
/// An exec that dies with this signal is a policy violation.
pub const SIGSYS: i32 = 31;

/// Environment marker set inside sandboxes whose network access is
/// denied, so well-behaved tooling can skip network probes.
pub const NETWORK_DISABLED_ENV_VAR: &str = "REQ2RUN_SANDBOX_NETWORK_DISABLED";

// ============================================================================
// Syscall classes
// ============================================================================

/// Classes of syscalls every sandbox denies regardless of spec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyscallClass {
    Ptrace,
    Mount,
    ModuleLoad,
    Reboot,
    RawSocket,
    KernelKeyring,
    UserNamespace,
}

impl SyscallClass {
    /// The full deny-list. Fixed at compile time; new classes require
    /// explicit linkage here and in each variant's filter table.
    pub const DENY_LIST: [SyscallClass; 7] = [
        SyscallClass::Ptrace,
        SyscallClass::Mount,
        SyscallClass::ModuleLoad,
        SyscallClass::Reboot,
        SyscallClass::RawSocket,
        SyscallClass::KernelKeyring,
        SyscallClass::UserNamespace,
    ];

    /// Representative syscall names for this class on a Linux host.
    #[must_use]
    pub fn syscall_names(self) -> &'static [&'static str] {
        match self {
            Self::Ptrace => &["ptrace", "process_vm_readv", "process_vm_writev"],
            Self::Mount => &["mount", "umount", "umount2", "pivot_root", "move_mount"],
            Self::ModuleLoad => &["init_module", "finit_module", "delete_module"],
            Self::Reboot => &["reboot", "kexec_load", "kexec_file_load"],
            Self::RawSocket => &["socket"], // filtered by AF_PACKET/SOCK_RAW args
            Self::KernelKeyring => &["add_key", "request_key", "keyctl"],
            Self::UserNamespace => &["unshare", "setns"],
        }
    }
}

// ============================================================================
// NetworkPolicy
// ============================================================================

/// Effective network policy for one run's sandboxes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    egress: EgressPolicy,
}

impl NetworkPolicy {
    #[must_use]
    pub fn from_egress(egress: EgressPolicy) -> Self {
        Self { egress }
    }

    #[must_use]
    pub fn deny_all() -> Self {
        Self {
            egress: EgressPolicy::DenyAll,
        }
    }

    #[must_use]
    pub fn is_deny_all(&self) -> bool {
        self.egress.is_deny_all()
    }

    /// Allow-listed endpoints, empty under deny-all.
    #[must_use]
    pub fn allowed_endpoints(&self) -> &[String] {
        match &self.egress {
            EgressPolicy::DenyAll => &[],
            EgressPolicy::AllowList(endpoints) => endpoints,
        }
    }

    /// Whether an observed destination is covered by the allow-list.
    #[must_use]
    pub fn permits(&self, destination: &str) -> bool {
        self.allowed_endpoints()
            .iter()
            .any(|allowed| allowed == destination)
    }
}

/// Minimal seccomp profile (Docker/OCI JSON shape) denying the fixed
/// syscall classes, used by the container variant.
#[must_use]
pub fn seccomp_profile_json() -> serde_json::Value {
    let mut names: Vec<&str> = Vec::new();
    for class in SyscallClass::DENY_LIST {
        names.extend_from_slice(class.syscall_names());
    }
    serde_json::json!({
        "defaultAction": "SCMP_ACT_ALLOW",
        "syscalls": [{
            "names": names,
            "action": "SCMP_ACT_KILL_PROCESS",
        }],
    })
}
