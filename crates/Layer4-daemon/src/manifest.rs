//! Manifest - 기동할 워크스페이스/컨테이너/트랙 목록
//!
//! ```toml
//! [[workspaces]]
//! id = 1
//!
//! [[workspaces.containers]]
//! id = 1
//! slug = "kali-ws1"
//! image = "kestrel/kali-msf:latest"
//! tracks = [1, 2]
//! ```

use anyhow::{bail, Context, Result};
use kestrel_foundation::{ContainerId, TrackId, WorkspaceId};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub workspaces: Vec<WorkspaceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkspaceEntry {
    pub id: WorkspaceId,
    #[serde(default)]
    pub containers: Vec<ContainerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerEntry {
    pub id: ContainerId,
    pub slug: String,
    pub image: String,
    #[serde(default)]
    pub tracks: Vec<TrackId>,
    /// false면 등록만 하고 시작하지 않음
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

fn default_autostart() -> bool {
    true
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let manifest = Self::parse(&content)
            .with_context(|| format!("invalid manifest {}", path.display()))?;
        Ok(manifest)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let manifest: Manifest = toml::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// ID는 전역에서 유일해야 함 (컨테이너와 트랙은 데이터 계층의 키)
    fn validate(&self) -> Result<()> {
        let mut workspaces = HashSet::new();
        let mut containers = HashSet::new();
        let mut tracks = HashSet::new();

        for workspace in &self.workspaces {
            if !workspaces.insert(workspace.id) {
                bail!("duplicate workspace {}", workspace.id);
            }
            for container in &workspace.containers {
                if !containers.insert(container.id) {
                    bail!("duplicate container {}", container.id);
                }
                if container.slug.trim().is_empty() || container.image.trim().is_empty() {
                    bail!("{} needs a slug and an image", container.id);
                }
                for track in &container.tracks {
                    if !tracks.insert(*track) {
                        bail!("duplicate track {}", track);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn container_count(&self) -> usize {
        self.workspaces.iter().map(|w| w.containers.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let manifest = Manifest::parse(
            r#"
            [[workspaces]]
            id = 1

            [[workspaces.containers]]
            id = 10
            slug = "kali-ws1"
            image = "kestrel/kali-msf:latest"
            tracks = [100, 101]

            [[workspaces.containers]]
            id = 11
            slug = "kali-ws1-b"
            image = "kestrel/kali-msf:latest"
            autostart = false
            "#,
        )
        .unwrap();

        assert_eq!(manifest.workspaces.len(), 1);
        assert_eq!(manifest.container_count(), 2);
        let first = &manifest.workspaces[0].containers[0];
        assert_eq!(first.id, ContainerId(10));
        assert_eq!(first.tracks, vec![TrackId(100), TrackId(101)]);
        assert!(first.autostart);
        assert!(!manifest.workspaces[0].containers[1].autostart);
    }

    #[test]
    fn test_duplicate_track_is_rejected() {
        let err = Manifest::parse(
            r#"
            [[workspaces]]
            id = 1

            [[workspaces.containers]]
            id = 10
            slug = "a"
            image = "kali"
            tracks = [1]

            [[workspaces.containers]]
            id = 11
            slug = "b"
            image = "kali"
            tracks = [1]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate track"));
    }

    #[test]
    fn test_empty_manifest() {
        let manifest = Manifest::parse("").unwrap();
        assert_eq!(manifest.container_count(), 0);
    }
}
