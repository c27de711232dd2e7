//! Per-distribution package manager policy.
//!
//! The compiler never formats a package manager command itself: it asks the
//! distribution for the install command, the wrapping needed around it
//! (index refresh, isolation from upstream repositories, cache cleanup), and
//! the local repository definition used when isolating.

use crate::lock::PackagePin;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Mount point of the local package mirror inside the build container.
pub const PACKAGES_MOUNT_TARGET: &str = "/var/kiln-packages";

/// Marker carried by package-index archives shipped alongside real packages.
pub const META_MARKER: &str = "__META__";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DistributionError {
    #[error("unknown distribution '{0}', expected one of: ubuntu, debian, centos, alpine")]
    Unknown(String),
    #[error("unknown architecture '{0}', expected x86_64 or aarch64")]
    UnknownArchitecture(String),
    #[error("{0} does not support installing from an isolated local repository")]
    UnsupportedIsolation(OsDistribution),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsDistribution {
    Ubuntu,
    Debian,
    Centos,
    Alpine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Yum,
    Apk,
}

/// Local repository definition written into the ephemeral repos mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoConfig {
    /// File name relative to the repos directory.
    pub file_name: String,
    pub contents: String,
    /// Path in the build container that replaces the upstream definitions.
    pub mount_target: &'static str,
    /// Whether the whole repos directory is mounted, or only `file_name`.
    pub mount_directory: bool,
}

impl OsDistribution {
    pub const ALL: [OsDistribution; 4] = [Self::Ubuntu, Self::Debian, Self::Centos, Self::Alpine];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ubuntu => "ubuntu",
            Self::Debian => "debian",
            Self::Centos => "centos",
            Self::Alpine => "alpine",
        }
    }

    pub fn package_manager(self) -> PackageManager {
        match self {
            Self::Ubuntu | Self::Debian => PackageManager::Apt,
            Self::Centos => PackageManager::Yum,
            Self::Alpine => PackageManager::Apk,
        }
    }

    /// Install command for already-rendered pins.
    pub fn install_command(self, pins: &[String]) -> String {
        let prefix = match self.package_manager() {
            PackageManager::Apt => "apt-get install -y",
            PackageManager::Yum => "yum install --setopt=skip_missing_names_on_install=False -y",
            PackageManager::Apk => "apk add",
        };
        if pins.is_empty() {
            prefix.to_owned()
        } else {
            format!("{prefix} {}", pins.join(" "))
        }
    }

    /// Surround an install command with the index refresh and cleanup steps
    /// this package manager needs. With `isolate`, the upstream repositories
    /// are replaced by the local mirror before the command runs and every
    /// trace of the index is removed afterwards.
    pub fn wrap_install(
        self,
        isolate: bool,
        install: String,
    ) -> Result<Vec<String>, DistributionError> {
        let mut commands = Vec::new();
        match self.package_manager() {
            PackageManager::Apt => {
                if isolate {
                    commands.push(format!(
                        "cp {PACKAGES_MOUNT_TARGET}/{META_MARKER}Packages* {PACKAGES_MOUNT_TARGET}/Packages.gz"
                    ));
                } else {
                    commands.push("rm -f /etc/apt/apt.conf.d/docker-clean".to_owned());
                    commands.push(
                        "echo 'Binary::apt::APT::Keep-Downloaded-Packages \"true\";' > /etc/apt/apt.conf.d/docker-dirty"
                            .to_owned(),
                    );
                }
                commands.push("apt-get update".to_owned());
                commands.push(install);
                if isolate {
                    commands.push("apt-get clean".to_owned());
                    commands.push(
                        "rm -rf /var/lib/apt/lists/* /tmp/* /var/tmp/* /etc/apt/apt.conf.d/90sslConfig"
                            .to_owned(),
                    );
                }
            }
            PackageManager::Yum => {
                if isolate {
                    commands.push(format!("cd {PACKAGES_MOUNT_TARGET}/"));
                    commands.push(format!("tar -xf {META_MARKER}repodata*"));
                }
                commands.push(install);
                if isolate {
                    commands.push("yum clean all".to_owned());
                    commands.push("rm -rf /var/cache/yum /tmp/* /var/tmp/*".to_owned());
                }
            }
            PackageManager::Apk => {
                if isolate {
                    return Err(DistributionError::UnsupportedIsolation(self));
                }
                commands.push("apk update".to_owned());
                commands.push(install);
                commands.push("rm -rf /var/cache/apk/*".to_owned());
            }
        }
        Ok(commands)
    }

    /// Repository definition pointing the package manager at the local mirror.
    pub fn local_repo_config(self, name: &str) -> Result<RepoConfig, DistributionError> {
        match self.package_manager() {
            PackageManager::Apt => Ok(RepoConfig {
                file_name: "sources.list".to_owned(),
                contents: format!("deb [trusted=yes] file://{PACKAGES_MOUNT_TARGET} /\n"),
                mount_target: "/etc/apt/sources.list",
                mount_directory: false,
            }),
            PackageManager::Yum => Ok(RepoConfig {
                file_name: format!("{name}.repo"),
                contents: format!(
                    "[{name}]\nname={name}\nbaseurl=file://{PACKAGES_MOUNT_TARGET}\nenabled=1\ngpgcheck=0\n"
                ),
                mount_target: "/etc/yum.repos.d",
                mount_directory: true,
            }),
            PackageManager::Apk => Err(DistributionError::UnsupportedIsolation(self)),
        }
    }

    /// Shell command run inside the base image to snapshot the candidate
    /// version of every requested package.
    pub fn query_command(self, packages: &[String]) -> String {
        let names = packages.join(" ");
        match self.package_manager() {
            PackageManager::Apt => {
                format!("apt-get update -qq >/dev/null && apt-cache show --no-all-versions {names}")
            }
            PackageManager::Yum => format!(
                "yum install -q -y yum-utils >/dev/null 2>&1; repoquery --latest-limit=1 --qf '%{{name}} %{{version}} %{{release}} %{{arch}}' {names}"
            ),
            PackageManager::Apk => format!("apk update -q >/dev/null && apk list {names}"),
        }
    }

    /// Parse the output of [`query_command`](Self::query_command) into pins.
    /// Lines that do not describe a package are ignored.
    pub fn parse_query_output(self, output: &str) -> Vec<PackagePin> {
        match self.package_manager() {
            PackageManager::Apt => parse_apt_show(output),
            PackageManager::Yum => output
                .lines()
                .filter_map(|line| {
                    let mut parts = line.split_whitespace();
                    Some(PackagePin::new(
                        parts.next()?,
                        parts.next()?,
                        parts.next()?,
                        parts.next()?,
                    ))
                })
                .collect(),
            PackageManager::Apk => output.lines().filter_map(parse_apk_list_line).collect(),
        }
    }
}

fn parse_apt_show(output: &str) -> Vec<PackagePin> {
    let mut pins = Vec::new();
    for stanza in output.split("\n\n") {
        let mut name = None;
        let mut version = None;
        let mut arch = None;
        for line in stanza.lines() {
            if let Some(v) = line.strip_prefix("Package: ") {
                name = Some(v.trim());
            } else if let Some(v) = line.strip_prefix("Version: ") {
                version = Some(v.trim());
            } else if let Some(v) = line.strip_prefix("Architecture: ") {
                arch = Some(v.trim());
            }
        }
        if let (Some(name), Some(full), Some(arch)) = (name, version, arch) {
            // Debian revision follows the last hyphen; upstream versions may contain more.
            let (version, release) = full.rsplit_once('-').unwrap_or((full, ""));
            pins.push(PackagePin::new(name, version, release, arch));
        }
    }
    pins
}

// `curl-8.5.0-r0 x86_64 {curl} (MIT)`
fn parse_apk_list_line(line: &str) -> Option<PackagePin> {
    let mut parts = line.split_whitespace();
    let nvr = parts.next()?;
    let arch = parts.next()?;
    let (rest, release) = nvr.rsplit_once('-')?;
    let (name, version) = rest.rsplit_once('-')?;
    Some(PackagePin::new(name, version, release, arch))
}

impl fmt::Display for OsDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OsDistribution {
    type Err = DistributionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ubuntu" => Ok(Self::Ubuntu),
            "debian" => Ok(Self::Debian),
            "centos" => Ok(Self::Centos),
            "alpine" => Ok(Self::Alpine),
            other => Err(DistributionError::Unknown(other.to_owned())),
        }
    }
}

/// Target CPU architecture of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl Architecture {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
        }
    }

    /// Value for the engine's `--platform` flag.
    pub fn platform(self) -> &'static str {
        match self {
            Self::X86_64 => "linux/amd64",
            Self::Aarch64 => "linux/arm64",
        }
    }

    /// Architecture name as the given package manager spells it.
    pub fn package_arch(self, manager: PackageManager) -> &'static str {
        match (manager, self) {
            (PackageManager::Apt, Self::X86_64) => "amd64",
            (PackageManager::Apt, Self::Aarch64) => "arm64",
            (_, Self::X86_64) => "x86_64",
            (_, Self::Aarch64) => "aarch64",
        }
    }

    pub fn host() -> Result<Self, DistributionError> {
        std::env::consts::ARCH.parse()
    }
}

/// Package architectures installable on every CPU.
pub fn is_arch_independent(package_arch: &str) -> bool {
    matches!(package_arch, "noarch" | "all")
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = DistributionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86_64" | "amd64" => Ok(Self::X86_64),
            "aarch64" | "arm64" => Ok(Self::Aarch64),
            other => Err(DistributionError::UnknownArchitecture(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_command_per_family() {
        let pins = vec!["curl=7.68.0-1ubuntu2".to_owned()];
        assert_eq!(
            OsDistribution::Ubuntu.install_command(&pins),
            "apt-get install -y curl=7.68.0-1ubuntu2"
        );
        assert_eq!(
            OsDistribution::Centos.install_command(&["curl-7.61.1-22.el8.x86_64".to_owned()]),
            "yum install --setopt=skip_missing_names_on_install=False -y curl-7.61.1-22.el8.x86_64"
        );
        assert_eq!(
            OsDistribution::Alpine.install_command(&["curl=8.5.0-r0".to_owned()]),
            "apk add curl=8.5.0-r0"
        );
    }

    #[test]
    fn apt_isolated_wrapping_uses_local_mirror_and_cleans_up() {
        let cmds = OsDistribution::Debian
            .wrap_install(true, "apt-get install -y x=1".to_owned())
            .unwrap();
        assert_eq!(
            cmds[0],
            "cp /var/kiln-packages/__META__Packages* /var/kiln-packages/Packages.gz"
        );
        assert_eq!(cmds[1], "apt-get update");
        assert_eq!(cmds[2], "apt-get install -y x=1");
        assert_eq!(cmds[3], "apt-get clean");
        assert!(cmds[4].starts_with("rm -rf /var/lib/apt/lists/*"));
        assert_eq!(cmds.len(), 5);
    }

    #[test]
    fn apt_open_wrapping_keeps_downloaded_packages() {
        let cmds = OsDistribution::Ubuntu
            .wrap_install(false, "apt-get install -y x=1".to_owned())
            .unwrap();
        assert_eq!(cmds[0], "rm -f /etc/apt/apt.conf.d/docker-clean");
        assert!(cmds[1].contains("Keep-Downloaded-Packages"));
        assert_eq!(cmds.last().unwrap(), "apt-get install -y x=1");
    }

    #[test]
    fn yum_isolated_wrapping_expands_repodata() {
        let cmds = OsDistribution::Centos
            .wrap_install(true, "yum install -y x".to_owned())
            .unwrap();
        assert_eq!(
            cmds,
            vec![
                "cd /var/kiln-packages/",
                "tar -xf __META__repodata*",
                "yum install -y x",
                "yum clean all",
                "rm -rf /var/cache/yum /tmp/* /var/tmp/*",
            ]
        );
    }

    #[test]
    fn alpine_rejects_isolation() {
        assert_eq!(
            OsDistribution::Alpine.wrap_install(true, "apk add x".to_owned()),
            Err(DistributionError::UnsupportedIsolation(OsDistribution::Alpine))
        );
        assert!(OsDistribution::Alpine.local_repo_config("r").is_err());
    }

    #[test]
    fn yum_repo_config_points_at_mirror() {
        let cfg = OsDistribution::Centos.local_repo_config("kiln").unwrap();
        assert_eq!(cfg.file_name, "kiln.repo");
        assert!(cfg.contents.contains("baseurl=file:///var/kiln-packages"));
        assert!(cfg.contents.contains("gpgcheck=0"));
        assert_eq!(cfg.mount_target, "/etc/yum.repos.d");
        assert!(cfg.mount_directory);
    }

    #[test]
    fn apt_repo_config_is_single_sources_list() {
        let cfg = OsDistribution::Ubuntu.local_repo_config("kiln").unwrap();
        assert_eq!(cfg.file_name, "sources.list");
        assert_eq!(
            cfg.contents,
            "deb [trusted=yes] file:///var/kiln-packages /\n"
        );
        assert!(!cfg.mount_directory);
    }

    #[test]
    fn parses_apt_cache_show() {
        let out = "Package: curl\nVersion: 7.68.0-1ubuntu2\nArchitecture: amd64\nDepends: libc6\n\n\
                   Package: tzdata\nVersion: 2024a-0ubuntu0.20.04\nArchitecture: all\n";
        let pins = OsDistribution::Ubuntu.parse_query_output(out);
        assert_eq!(pins.len(), 2);
        assert_eq!(pins[0], PackagePin::new("curl", "7.68.0", "1ubuntu2", "amd64"));
        assert_eq!(pins[1].release, "0ubuntu0.20.04");
        assert_eq!(pins[1].architecture, "all");
    }

    #[test]
    fn parses_repoquery_lines() {
        let out = "curl 7.61.1 22.el8 x86_64\n\nbogus\n";
        let pins = OsDistribution::Centos.parse_query_output(out);
        assert_eq!(pins, vec![PackagePin::new("curl", "7.61.1", "22.el8", "x86_64")]);
    }

    #[test]
    fn parses_apk_list() {
        let out = "ca-certificates-20240226-r0 x86_64 {ca-certificates} (MPL-2.0 AND MIT)\n";
        let pins = OsDistribution::Alpine.parse_query_output(out);
        assert_eq!(
            pins,
            vec![PackagePin::new("ca-certificates", "20240226", "r0", "x86_64")]
        );
    }

    #[test]
    fn architecture_names() {
        assert_eq!(Architecture::Aarch64.platform(), "linux/arm64");
        assert_eq!(Architecture::X86_64.package_arch(PackageManager::Apt), "amd64");
        assert_eq!(Architecture::X86_64.package_arch(PackageManager::Yum), "x86_64");
        assert_eq!("arm64".parse::<Architecture>().unwrap(), Architecture::Aarch64);
        assert!("sparc".parse::<Architecture>().is_err());
    }

    #[test]
    fn distribution_parses_case_insensitively() {
        assert_eq!("CentOS".parse::<OsDistribution>().unwrap(), OsDistribution::Centos);
        assert!("gentoo".parse::<OsDistribution>().is_err());
    }
}
