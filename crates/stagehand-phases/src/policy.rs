use stagehand_core::FailPolicy;

/// Operation classes the fail-policy matrix distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ReceiptCheck,
    PackageInstall,
    ScriptExecution,
    FilePlacement,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReceiptCheck => "package receipt check",
            Self::PackageInstall => "package installation",
            Self::ScriptExecution => "script execution",
            Self::FilePlacement => "file placement",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDecision {
    Stop,
    Continue,
}

pub fn evaluate(policy: FailPolicy, operation: Operation) -> FailDecision {
    match policy {
        FailPolicy::FailureIsNotAnOption => FailDecision::Stop,
        FailPolicy::Failable => FailDecision::Continue,
        FailPolicy::FailableExecution => {
            if operation == Operation::ScriptExecution {
                FailDecision::Continue
            } else {
                FailDecision::Stop
            }
        }
        // Unreachable through a validated manifest; stop to stay safe.
        FailPolicy::Unknown => FailDecision::Stop,
    }
}
