use std::env::consts;

/// Facts about the machine the repository lives on, in the vocabulary image configs use.
#[derive(Debug, Clone, Default)]
pub struct HostInfo;

impl HostInfo {
    pub fn new() -> Self {
        Self
    }

    /// Host architecture using Docker/OCI names (`amd64`, `arm64`, ...).
    pub fn arch(&self) -> String {
        oci_arch(consts::ARCH).to_string()
    }

    pub fn osversion(&self) -> String {
        consts::OS.to_string()
    }
}

fn oci_arch(rust_arch: &str) -> &str {
    match rust_arch {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "arm" => "arm",
        "powerpc64" => "ppc64le",
        "s390x" => "s390x",
        "riscv64" => "riscv64",
        "mips64" => "mips64le",
        other => other,
    }
}
