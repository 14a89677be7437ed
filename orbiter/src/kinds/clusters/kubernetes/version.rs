use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::nodeagent::{Package, Software};

/// A Kubernetes release, `vMAJOR.MINOR.PATCH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KubernetesVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KubernetesVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Software a node needs to run this release.
    pub fn define_software(&self) -> Software {
        let version = self.to_string();
        Software {
            container_runtime: Package::new(self.container_runtime()),
            kubelet: Package::new(version.clone()),
            kubeadm: Package::new(version.clone()),
            kubectl: Package::new(version),
            ..Default::default()
        }
    }

    fn container_runtime(&self) -> &'static str {
        match self.minor {
            0..=19 => "docker-ce 19.03.15",
            20..=23 => "docker-ce 20.10.7",
            _ => "containerd 1.6.8",
        }
    }

    /// The next release on the way to `target`.
    ///
    /// Minor versions are never skipped: a node at `v1.19.4` heading for
    /// `v1.21.2` goes to `v1.20.0` first.
    pub fn next_toward(&self, target: &KubernetesVersion) -> KubernetesVersion {
        if self.major != target.major || self.minor >= target.minor {
            return *target;
        }
        KubernetesVersion::new(self.major, self.minor + 1, 0)
    }
}

impl fmt::Display for KubernetesVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for KubernetesVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::validation(format!("invalid kubernetes version {s:?}"));
        let mut parts = s.strip_prefix('v').ok_or_else(invalid)?.split('.');
        let mut next = || -> Result<u32> {
            parts
                .next()
                .ok_or_else(invalid)?
                .parse()
                .map_err(|_| invalid())
        };
        let version = KubernetesVersion::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}
