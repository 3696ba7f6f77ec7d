//! Guard policy: which syscall filter and namespaces wrap the child

use serde::{Deserialize, Serialize};

use crate::isolation::{NamespaceConfig, SeccompFilter};

/// Syscall filtering and namespace isolation toggles.
///
/// The four flags are independent; any combination, including none, is valid.
/// `seccomp_deny_common` has no effect unless `seccomp_enabled` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardPolicy {
    /// Install a seccomp filter (always sets no-new-privs)
    pub seccomp_enabled: bool,
    /// Use the "deny common" syscall preset
    pub seccomp_deny_common: bool,
    /// Mount, PID, IPC, UTS and cgroup namespaces
    pub isolate_common: bool,
    /// Network namespace
    pub isolate_network: bool,
}

impl GuardPolicy {
    /// No filtering, no isolation
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Every guard on
    pub fn strict() -> Self {
        Self {
            seccomp_enabled: true,
            seccomp_deny_common: true,
            isolate_common: true,
            isolate_network: true,
        }
    }

    /// Expand the single-flag form, where one switch controls every namespace
    pub fn from_legacy(seccomp_enabled: bool, seccomp_deny_common: bool, unshare_enabled: bool) -> Self {
        Self {
            seccomp_enabled,
            seccomp_deny_common,
            isolate_common: unshare_enabled,
            isolate_network: unshare_enabled,
        }
    }

    /// Namespaces the child is created in, before any user namespace is added
    pub fn namespaces(&self) -> NamespaceConfig {
        let mut config = NamespaceConfig::none();
        if self.isolate_common {
            config = config.merge(NamespaceConfig::common());
        }
        if self.isolate_network {
            config = config.merge(NamespaceConfig::network());
        }
        config
    }

    /// Filter to install, `None` when filtering is disabled.
    ///
    /// Without a network namespace the child shares the host's interfaces, so
    /// the deny preset also blocks raw and packet sockets.
    pub fn seccomp_filter(&self) -> Option<SeccompFilter> {
        if !self.seccomp_enabled {
            return None;
        }
        if !self.seccomp_deny_common {
            return Some(SeccompFilter::allow_all());
        }

        let filter = SeccompFilter::deny_common();
        Some(if self.isolate_network {
            filter
        } else {
            filter.with_raw_sockets_denied()
        })
    }

    pub fn is_disabled(&self) -> bool {
        !self.seccomp_enabled && !self.isolate_common && !self.isolate_network
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_guard() {
        let guard = GuardPolicy::disabled();
        assert!(guard.is_disabled());
        assert!(guard.seccomp_filter().is_none());
        assert_eq!(guard.namespaces().enabled_count(), 0);
    }

    #[test]
    fn test_legacy_unshare_expands_to_both_isolation_flags() {
        let guard = GuardPolicy::from_legacy(true, true, true);
        assert_eq!(guard, GuardPolicy::strict());

        let guard = GuardPolicy::from_legacy(true, false, false);
        assert!(guard.seccomp_enabled);
        assert!(!guard.isolate_common);
        assert!(!guard.isolate_network);
    }

    #[test]
    fn test_deny_common_without_seccomp_is_inert() {
        let guard = GuardPolicy {
            seccomp_deny_common: true,
            ..Default::default()
        };
        assert!(guard.seccomp_filter().is_none());
        assert!(guard.is_disabled());
    }

    #[test]
    fn test_seccomp_without_preset_is_allow_all() {
        let guard = GuardPolicy {
            seccomp_enabled: true,
            ..Default::default()
        };
        assert!(guard.seccomp_filter().unwrap().is_empty());
    }

    #[test]
    fn test_raw_sockets_denied_only_without_network_namespace() {
        let shared_net = GuardPolicy::from_legacy(true, true, false);
        assert!(shared_net.seccomp_filter().unwrap().denies_raw_sockets());

        let own_net = GuardPolicy::strict();
        assert!(!own_net.seccomp_filter().unwrap().denies_raw_sockets());
    }

    #[test]
    fn test_namespace_mapping() {
        let network_only = GuardPolicy {
            isolate_network: true,
            ..Default::default()
        };
        let ns = network_only.namespaces();
        assert!(ns.net);
        assert!(!ns.pid && !ns.mount);

        let ns = GuardPolicy::strict().namespaces();
        assert!(ns.net && ns.pid && ns.mount && ns.ipc && ns.uts && ns.cgroup);
        assert!(!ns.user);
    }
}
