#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    TarGz,
    Tar,
    Zip,
    Raw,
}

impl ArchiveType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TarGz => "tar.gz",
            Self::Tar => "tar",
            Self::Zip => "zip",
            Self::Raw => "raw",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "tar.gz" | "tgz" => Some(Self::TarGz),
            "tar" => Some(Self::Tar),
            "zip" => Some(Self::Zip),
            "raw" | "bin" => Some(Self::Raw),
            _ => None,
        }
    }

    /// Archive type implied by an asset file name. Names without a known
    /// archive extension are installed as a single file.
    pub fn infer_from_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            return Self::TarGz;
        }
        if lower.ends_with(".tar") {
            return Self::Tar;
        }
        if lower.ends_with(".zip") {
            return Self::Zip;
        }
        Self::Raw
    }

    pub fn is_archive(self) -> bool {
        !matches!(self, Self::Raw)
    }
}
