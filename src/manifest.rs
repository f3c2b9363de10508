//! Discovery manifest
//!
//! Maps each public verb to the command line that implements it. Installers
//! and orchestration engines resolve commands through this file rather than
//! hardcoding paths.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::{Error, Result};

pub const DEFAULT_MANIFEST_PATH: &str = "/usr/share/vmhost/manifest.json";

/// The stable public command surface
pub const VERBS: &[&str] = &[
    "create", "destroy", "start", "stop", "kill", "status", "list", "gc", "resume", "mint",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: String,
    /// verb -> argv prefix, e.g. `create -> ["vmhost", "create"]`
    pub commands: BTreeMap<String, Vec<String>>,
}

impl Manifest {
    /// Manifest for every verb served by one executable
    pub fn for_executable(exe: &str) -> Self {
        let commands = VERBS
            .iter()
            .map(|verb| (verb.to_string(), vec![exe.to_string(), verb.to_string()]))
            .collect();
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            commands,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read manifest {}: {}", path.display(), e)))?;
        let manifest: Manifest = serde_json::from_str(&raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.validate()?;
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Every verb must be present and map to a non-empty command line
    pub fn validate(&self) -> Result<()> {
        for verb in VERBS {
            match self.commands.get(*verb) {
                Some(argv) if argv.first().is_some_and(|exe| !exe.is_empty()) => {}
                _ => return Err(Error::Config(format!("manifest has no command for '{}'", verb))),
            }
        }
        Ok(())
    }

    pub fn resolve(&self, verb: &str) -> Result<&[String]> {
        self.commands
            .get(verb)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::NotFound(format!("verb '{}'", verb)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest_covers_all_verbs() {
        let m = Manifest::for_executable("vmhost");
        m.validate().unwrap();
        assert_eq!(m.resolve("gc").unwrap(), ["vmhost", "gc"]);
        assert!(matches!(m.resolve("reboot"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_load_rejects_incomplete() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");

        let mut m = Manifest::for_executable("/usr/bin/vmhost");
        m.save(&path).unwrap();
        assert_eq!(Manifest::load(&path).unwrap(), m);

        m.commands.remove("destroy");
        std::fs::write(&path, serde_json::to_string(&m).unwrap()).unwrap();
        assert!(matches!(Manifest::load(&path), Err(Error::Config(_))));
    }
}
