use std::path::Path;

use serde::Deserialize;

use crate::runner::{CommandSpec, sh_quote};
use crate::targets::TargetSpec;

/// Resource name the runtime's SEA loader looks up.
pub const SEA_RESOURCE: &str = "NODE_SEA_BLOB";
/// Fuse string baked into the Node.js binary; postject flips it on injection.
pub const SENTINEL_FUSE: &str = "NODE_SEA_FUSE_fce680ab2cc467b6e072b8b5df1996b2";

fn default_node() -> String {
    "node".into()
}

fn default_postject() -> Vec<String> {
    vec!["npx".into(), "postject".into()]
}

fn default_codesign() -> String {
    "codesign".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub node: String,
    /// Launcher words for postject, e.g. `["npx", "postject"]`.
    pub postject: Vec<String>,
    pub codesign: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            node: default_node(),
            postject: default_postject(),
            codesign: default_codesign(),
        }
    }
}

fn path_arg(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

impl ToolchainConfig {
    pub fn generate_blob(&self, sea_config: &Path) -> CommandSpec {
        CommandSpec::new(&self.node)
            .arg("--experimental-sea-config")
            .arg(path_arg(sea_config))
    }

    /// Copy of the local host runtime. Windows hosts copy through the runtime
    /// itself; elsewhere the binary on PATH is copied by the shell.
    pub fn copy_host_runtime(&self, dest: &Path) -> CommandSpec {
        if cfg!(windows) {
            CommandSpec::new(&self.node)
                .arg("-e")
                .arg("require('fs').copyFileSync(process.execPath, process.argv[1])")
                .arg(path_arg(dest))
        } else {
            CommandSpec::shell(format!(
                "cp \"$(command -v {})\" {}",
                self.node,
                sh_quote(&path_arg(dest))
            ))
        }
    }

    pub fn strip_signature(&self, binary: &Path) -> CommandSpec {
        CommandSpec::new(&self.codesign)
            .arg("--remove-signature")
            .arg(path_arg(binary))
    }

    /// Runs through the shell: `npx` is a script shim on some hosts.
    pub fn inject(&self, spec: &TargetSpec, binary: &Path, blob: &Path) -> CommandSpec {
        let mut words: Vec<String> = self.postject.clone();
        words.push(sh_quote(&path_arg(binary)));
        words.push(SEA_RESOURCE.into());
        words.push(sh_quote(&path_arg(blob)));
        words.push("--sentinel-fuse".into());
        words.push(SENTINEL_FUSE.into());
        words.extend(spec.inject_extra.iter().map(|s| s.to_string()));
        CommandSpec::shell(words.join(" "))
    }

    pub fn sign(&self, binary: &Path) -> CommandSpec {
        CommandSpec::new(&self.codesign)
            .args(["--sign", "-"])
            .arg(path_arg(binary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::Target;

    #[test]
    fn blob_generation_uses_sea_config_flag() {
        let tc = ToolchainConfig::default();
        let cmd = tc.generate_blob(Path::new("/out/.sealpack/linux/sea-config.json"));
        assert_eq!(cmd.program, "node");
        assert_eq!(
            cmd.args,
            vec![
                "--experimental-sea-config",
                "/out/.sealpack/linux/sea-config.json"
            ]
        );
        assert!(!cmd.shell);
    }

    #[test]
    fn inject_carries_fuse_and_macho_segment_only_on_macos() {
        let tc = ToolchainConfig::default();
        let bin = Path::new("/out/node-macos");
        let blob = Path::new("/out/sea-prep.blob");

        let mac = tc.inject(Target::Macos.spec(), bin, blob);
        assert!(mac.shell);
        assert!(mac.program.starts_with("npx postject "), "{}", mac.program);
        assert!(mac.program.contains(&format!("--sentinel-fuse {SENTINEL_FUSE}")));
        assert!(mac.program.contains(SEA_RESOURCE));
        assert!(mac.program.ends_with("--macho-segment-name NODE_SEA"));

        let linux = tc.inject(Target::Linux.spec(), bin, blob);
        assert!(!linux.program.contains("--macho-segment-name"));
    }

    #[test]
    fn signing_commands() {
        let tc = ToolchainConfig::default();
        let bin = Path::new("/out/node-macos");
        assert_eq!(
            tc.strip_signature(bin).to_string(),
            "codesign --remove-signature /out/node-macos"
        );
        assert_eq!(tc.sign(bin).to_string(), "codesign --sign - /out/node-macos");
    }

    #[cfg(unix)]
    #[test]
    fn unix_runtime_copy_goes_through_the_shell() {
        let tc = ToolchainConfig::default();
        let cmd = tc.copy_host_runtime(Path::new("/out/node-linux"));
        assert!(cmd.shell);
        assert_eq!(cmd.program, "cp \"$(command -v node)\" '/out/node-linux'");
    }
}
