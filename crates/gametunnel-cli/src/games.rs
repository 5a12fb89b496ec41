//! Running game detection.
//!
//! Each `[[games]]` profile names an executable. A profile matches the first
//! running process, by ascending pid, whose name contains the executable
//! name, ignoring case.

use serde::{Deserialize, Serialize};
use sysinfo::{ProcessesToUpdate, System};

/// One `[[games]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameProfile {
    /// Display name
    pub name: String,
    /// Executable name, matched as a case-insensitive substring
    pub executable: String,
    /// Ports the game talks to
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Transport protocol
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Optimization hint
    #[serde(default = "default_optimization")]
    pub optimization: String,
}

fn default_protocol() -> String {
    "udp".to_string()
}

fn default_optimization() -> String {
    "default".to_string()
}

/// A profile matched against a running process
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedGame {
    /// Profile that matched
    pub profile: GameProfile,
    /// Process id
    pub pid: u32,
    /// Process name
    pub process_name: String,
}

impl DetectedGame {
    /// Whether the local UDP intercept can carry this game's traffic
    #[must_use]
    pub fn is_tunnelable(&self) -> bool {
        self.profile.protocol.eq_ignore_ascii_case("udp")
    }
}

/// Matches game profiles against the process table
#[derive(Debug, Clone, Default)]
pub struct GameDetector {
    profiles: Vec<GameProfile>,
}

impl GameDetector {
    /// Create a detector over the configured profiles
    #[must_use]
    pub fn new(profiles: Vec<GameProfile>) -> Self {
        Self { profiles }
    }

    /// Scan the running processes
    #[must_use]
    pub fn detect(&self) -> Vec<DetectedGame> {
        if self.profiles.is_empty() {
            return Vec::new();
        }

        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let processes = system
            .processes()
            .iter()
            .map(|(pid, process)| (pid.as_u32(), process.name().to_string_lossy().into_owned()));

        let detected = self.match_processes(processes);
        tracing::debug!(
            "Scanned {} processes, {} games detected",
            system.processes().len(),
            detected.len()
        );
        detected
    }

    /// Match profiles against `(pid, name)` pairs
    pub fn match_processes<I>(&self, processes: I) -> Vec<DetectedGame>
    where
        I: IntoIterator<Item = (u32, String)>,
    {
        let mut processes: Vec<(u32, String)> = processes.into_iter().collect();
        processes.sort_by_key(|(pid, _)| *pid);

        self.profiles
            .iter()
            .filter(|profile| !profile.executable.is_empty())
            .filter_map(|profile| {
                let executable = profile.executable.to_lowercase();
                processes
                    .iter()
                    .find(|(_, name)| name.to_lowercase().contains(&executable))
                    .map(|(pid, name)| DetectedGame {
                        profile: profile.clone(),
                        pid: *pid,
                        process_name: name.clone(),
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, executable: &str, protocol: &str) -> GameProfile {
        GameProfile {
            name: name.to_string(),
            executable: executable.to_string(),
            ports: vec![27015],
            protocol: protocol.to_string(),
            optimization: "low-latency".to_string(),
        }
    }

    #[test]
    fn test_match_processes() {
        let detector = GameDetector::new(vec![
            profile("Counter-Strike 2", "cs2", "udp"),
            profile("Minecraft", "javaw", "tcp"),
            profile("Dota 2", "dota2", "udp"),
        ]);

        let detected = detector.match_processes(vec![
            (900, "CS2.exe".to_string()),
            (12, "cs2_helper".to_string()),
            (40, "javaw.exe".to_string()),
            (7, "explorer.exe".to_string()),
        ]);

        assert_eq!(detected.len(), 2);
        assert_eq!(detected[0].profile.name, "Counter-Strike 2");
        assert_eq!(detected[0].pid, 12);
        assert!(detected[0].is_tunnelable());
        assert_eq!(detected[1].profile.name, "Minecraft");
        assert!(!detected[1].is_tunnelable());
    }

    #[test]
    fn test_empty_executable_never_matches() {
        let detector = GameDetector::new(vec![profile("Anything", "", "udp")]);
        assert!(
            detector
                .match_processes(vec![(1, "init".to_string())])
                .is_empty()
        );
    }

    #[test]
    fn test_profile_defaults() {
        let profile: GameProfile = toml::from_str(
            r#"
            name = "Valorant"
            executable = "VALORANT-Win64-Shipping"
            "#,
        )
        .unwrap();
        assert_eq!(profile.protocol, "udp");
        assert_eq!(profile.optimization, "default");
        assert!(profile.ports.is_empty());
    }

    #[test]
    fn test_detect_without_profiles_skips_scan() {
        assert!(GameDetector::default().detect().is_empty());
    }
}
