use std::fmt;

use serde::Serialize;

use crate::targets::TargetSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Configure,
    GeneratePayload,
    CopyRuntime,
    StripSignature,
    InjectPayload,
    Sign,
    Finalize,
    Fingerprint,
}

impl Stage {
    pub fn id(self) -> &'static str {
        match self {
            Stage::Configure => "configure",
            Stage::GeneratePayload => "generate-payload",
            Stage::CopyRuntime => "copy-runtime",
            Stage::StripSignature => "strip-signature",
            Stage::InjectPayload => "inject-payload",
            Stage::Sign => "sign",
            Stage::Finalize => "finalize",
            Stage::Fingerprint => "fingerprint",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::Configure => "Write SEA config",
            Stage::GeneratePayload => "Generate SEA blob",
            Stage::CopyRuntime => "Copy host runtime",
            Stage::StripSignature => "Remove signature",
            Stage::InjectPayload => "Inject blob",
            Stage::Sign => "Sign binary",
            Stage::Finalize => "Rename final binary",
            Stage::Fingerprint => "Hash final binary",
        }
    }

    /// State a target is in once this stage has completed.
    pub fn reached(self) -> TargetState {
        match self {
            Stage::Configure => TargetState::Configuring,
            Stage::GeneratePayload => TargetState::PayloadGenerated,
            Stage::CopyRuntime => TargetState::RuntimeCopied,
            Stage::StripSignature => TargetState::SignatureStripped,
            Stage::InjectPayload => TargetState::PayloadInjected,
            Stage::Sign => TargetState::Signed,
            Stage::Finalize => TargetState::Finalized,
            Stage::Fingerprint => TargetState::Fingerprinted,
        }
    }

    pub fn sequence(spec: &TargetSpec) -> Vec<Stage> {
        let mut out = vec![Stage::Configure, Stage::GeneratePayload, Stage::CopyRuntime];
        if spec.strip_signature {
            out.push(Stage::StripSignature);
        }
        out.push(Stage::InjectPayload);
        if spec.resign {
            out.push(Stage::Sign);
        }
        out.push(Stage::Finalize);
        out.push(Stage::Fingerprint);
        out
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum TargetState {
    Pending,
    Configuring,
    PayloadGenerated,
    RuntimeCopied,
    SignatureStripped,
    PayloadInjected,
    Signed,
    Finalized,
    Fingerprinted,
    Failed {
        stage: Stage,
        exit_code: Option<i32>,
        error: String,
    },
}

impl TargetState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TargetState::Fingerprinted | TargetState::Failed { .. })
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, TargetState::Fingerprinted)
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            TargetState::Failed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
