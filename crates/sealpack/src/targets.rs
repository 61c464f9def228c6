use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Linux,
    #[serde(alias = "darwin")]
    Macos,
    #[serde(alias = "windows")]
    Win,
}

/// One row of the target matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSpec {
    pub target: Target,
    pub label: &'static str,
    pub exe_suffix: &'static str,
    pub strip_signature: bool,
    pub resign: bool,
    pub inject_extra: &'static [&'static str],
}

const MATRIX: [TargetSpec; 3] = [
    TargetSpec {
        target: Target::Linux,
        label: "linux",
        exe_suffix: "",
        strip_signature: false,
        resign: false,
        inject_extra: &[],
    },
    TargetSpec {
        target: Target::Macos,
        label: "macos",
        exe_suffix: "",
        strip_signature: true,
        resign: true,
        inject_extra: &["--macho-segment-name", "NODE_SEA"],
    },
    TargetSpec {
        target: Target::Win,
        label: "win",
        exe_suffix: ".exe",
        strip_signature: false,
        resign: false,
        inject_extra: &[],
    },
];

impl Target {
    pub const ALL: [Target; 3] = [Target::Linux, Target::Macos, Target::Win];

    pub fn spec(self) -> &'static TargetSpec {
        match self {
            Target::Linux => &MATRIX[0],
            Target::Macos => &MATRIX[1],
            Target::Win => &MATRIX[2],
        }
    }

    pub fn label(self) -> &'static str {
        self.spec().label
    }

    /// `<base>-<target>[.exe]`
    pub fn binary_name(self, base: &str) -> String {
        format!("{base}-{}{}", self.label(), self.spec().exe_suffix)
    }

    /// Matrix order, duplicates dropped.
    pub fn ordered(selected: &[Target]) -> Vec<Target> {
        Target::ALL
            .into_iter()
            .filter(|t| selected.contains(t))
            .collect()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(Target::Linux),
            "macos" | "darwin" => Ok(Target::Macos),
            "win" | "windows" => Ok(Target::Win),
            other => Err(Error::config(format!(
                "unknown target '{other}' (expected one of: linux, macos, win)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_rows_match_targets() {
        for t in Target::ALL {
            assert_eq!(t.spec().target, t);
        }
    }

    #[test]
    fn only_macos_touches_signatures() {
        for t in Target::ALL {
            let s = t.spec();
            assert_eq!(s.strip_signature, t == Target::Macos);
            assert_eq!(s.resign, t == Target::Macos);
            assert_eq!(s.inject_extra.is_empty(), t != Target::Macos);
        }
    }

    #[test]
    fn binary_names() {
        assert_eq!(Target::Linux.binary_name("app"), "app-linux");
        assert_eq!(Target::Macos.binary_name("app"), "app-macos");
        assert_eq!(Target::Win.binary_name("app"), "app-win.exe");
    }

    #[test]
    fn toml_lists_accept_the_same_aliases() {
        #[derive(Deserialize)]
        struct Pkg {
            targets: Vec<Target>,
        }
        let pkg: Pkg = toml::from_str("targets = [\"darwin\", \"windows\", \"linux\"]")
            .expect("targets");
        assert_eq!(pkg.targets, vec![Target::Macos, Target::Win, Target::Linux]);
    }

    #[test]
    fn parse_aliases_and_order() {
        assert_eq!("darwin".parse::<Target>().expect("darwin"), Target::Macos);
        assert_eq!("Windows".parse::<Target>().expect("windows"), Target::Win);
        assert!("solaris".parse::<Target>().is_err());
        assert_eq!(
            Target::ordered(&[Target::Win, Target::Linux, Target::Win]),
            vec![Target::Linux, Target::Win]
        );
    }
}
