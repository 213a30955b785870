use stagehand_core::SkipIf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostArch {
    Intel,
    AppleSilicon,
}

pub fn detect() -> HostArch {
    if cfg!(target_arch = "aarch64") {
        HostArch::AppleSilicon
    } else {
        HostArch::Intel
    }
}

/// `intel`/`x86_64` and `arm64`/`apple_silicon` are synonyms; anything
/// unrecognised never skips.
pub fn should_skip(skip_if: Option<SkipIf>, host: HostArch) -> bool {
    match skip_if {
        Some(SkipIf::Intel) | Some(SkipIf::X86_64) => host == HostArch::Intel,
        Some(SkipIf::Arm64) | Some(SkipIf::AppleSilicon) => host == HostArch::AppleSilicon,
        Some(SkipIf::Unknown) | None => false,
    }
}
