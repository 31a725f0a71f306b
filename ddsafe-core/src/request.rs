//! Operation requests and the builder that assembles them field by field.
//!
//! The interactive front-end populates a [`RequestBuilder`] one prompt at a
//! time; a test harness or another front-end can fill the same fields in one
//! go. Once built, an [`OperationRequest`] never changes except for the
//! one-way [`confirm`](OperationRequest::confirm) step.
use crate::device::Device;
use crate::error::{Error, Result};
use crate::image::ImageFile;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// The four operations ddsafe supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Device to image file.
    Backup,
    /// Image file to device.
    Restore,
    /// Device to device.
    Clone,
    /// Generated fill to device.
    Wipe,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Backup,
        OperationKind::Restore,
        OperationKind::Clone,
        OperationKind::Wipe,
    ];

    /// Whether the operation overwrites a device.
    pub fn is_destructive(self) -> bool {
        !matches!(self, OperationKind::Backup)
    }

    /// The checksum used when the operator does not pick one.
    pub fn default_checksum(self) -> ChecksumAlgorithm {
        match self {
            OperationKind::Wipe => ChecksumAlgorithm::None,
            _ => ChecksumAlgorithm::Sha256,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
            OperationKind::Clone => "clone",
            OperationKind::Wipe => "wipe",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        OperationKind::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidRequest(format!("unknown operation '{s}'")))
    }
}

/// Hash function used for post-transfer verification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    None,
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub const ALL: [ChecksumAlgorithm; 3] = [
        ChecksumAlgorithm::None,
        ChecksumAlgorithm::Md5,
        ChecksumAlgorithm::Sha256,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumAlgorithm::None => "none",
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "none" | "off" => Ok(ChecksumAlgorithm::None),
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            other => Err(Error::InvalidRequest(format!(
                "unsupported checksum '{other}' (expected none, md5 or sha256)"
            ))),
        }
    }
}

/// Chunk size handed to the executor for each read/write call.
///
/// Always a power of two between 512 bytes and 1 GiB.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockSize(u64);

impl BlockSize {
    pub const MIN: u64 = 512;
    pub const MAX: u64 = 1024 * 1024 * 1024;
    pub const DEFAULT: BlockSize = BlockSize(4 * 1024 * 1024);

    pub fn new(bytes: u64) -> Result<Self> {
        if !bytes.is_power_of_two() {
            return Err(Error::InvalidRequest(format!(
                "block size {bytes} is not a power of two"
            )));
        }
        if !(Self::MIN..=Self::MAX).contains(&bytes) {
            return Err(Error::InvalidRequest(format!(
                "block size {bytes} is outside {}..={}",
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(Self(bytes))
    }

    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 3] = [(1 << 30, "G"), (1 << 20, "M"), (1 << 10, "K")];
        for (scale, suffix) in UNITS {
            if self.0 >= scale && self.0 % scale == 0 {
                return write!(f, "{}{}", self.0 / scale, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

/// Accepts plain byte counts and `dd`-style suffixes: `512`, `64K`, `4M`, `4MiB`, `1G`.
impl FromStr for BlockSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (number, suffix) = s.split_at(digits_end);
        let number: u64 = number
            .parse()
            .map_err(|_| Error::InvalidRequest(format!("invalid block size '{s}'")))?;

        let scale: u64 = match suffix.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" | "KIB" => 1 << 10,
            "M" | "MB" | "MIB" => 1 << 20,
            "G" | "GB" | "GIB" => 1 << 30,
            _ => return Err(Error::InvalidRequest(format!("invalid block size '{s}'"))),
        };

        let bytes = number
            .checked_mul(scale)
            .ok_or_else(|| Error::InvalidRequest(format!("block size '{s}' overflows")))?;
        BlockSize::new(bytes)
    }
}

impl Serialize for BlockSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for BlockSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bytes(n) => BlockSize::new(n),
            Raw::Text(s) => s.parse(),
        }
        .map_err(serde::de::Error::custom)
    }
}

/// What a wipe writes over the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillPattern {
    #[default]
    Zero,
    Random,
}

impl FillPattern {
    /// The kernel device `dd` reads the fill from.
    pub fn device(self) -> &'static Path {
        match self {
            FillPattern::Zero => Path::new("/dev/zero"),
            FillPattern::Random => Path::new("/dev/urandom"),
        }
    }
}

impl fmt::Display for FillPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillPattern::Zero => f.write_str("zeros"),
            FillPattern::Random => f.write_str("random data"),
        }
    }
}

/// Generated wipe input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fill {
    pub pattern: FillPattern,
    pub passes: u32,
}

impl Default for Fill {
    fn default() -> Self {
        Self {
            pattern: FillPattern::Zero,
            passes: 1,
        }
    }
}

/// Where the bytes come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Device(Device),
    Image(ImageFile),
    Fill(Fill),
}

impl Source {
    /// Bytes the source contributes to one pass, when known up front.
    pub fn extent(&self) -> Option<u64> {
        match self {
            Source::Device(device) => Some(device.size_bytes),
            Source::Image(image) => image.decoded_len(),
            Source::Fill(_) => None,
        }
    }

    pub fn device(&self) -> Option<&Device> {
        match self {
            Source::Device(device) => Some(device),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Device(device) => write!(f, "{}", device.path.display()),
            Source::Image(image) => write!(f, "{}", image.path().display()),
            Source::Fill(fill) if fill.passes > 1 => {
                write!(f, "{} ({} passes)", fill.pattern, fill.passes)
            }
            Source::Fill(fill) => write!(f, "{}", fill.pattern),
        }
    }
}

/// Where the bytes go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Device(Device),
    Image(PathBuf),
}

impl Target {
    pub fn path(&self) -> &Path {
        match self {
            Target::Device(device) => &device.path,
            Target::Image(path) => path,
        }
    }

    pub fn device(&self) -> Option<&Device> {
        match self {
            Target::Device(device) => Some(device),
            Target::Image(_) => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().display())
    }
}

/// A fully specified operation, ready for the Safety Gate.
#[derive(Clone, Debug)]
pub struct OperationRequest {
    kind: OperationKind,
    source: Source,
    target: Target,
    block_size: BlockSize,
    checksum: ChecksumAlgorithm,
    force_unmount: bool,
    confirmed: bool,
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    pub fn checksum(&self) -> ChecksumAlgorithm {
        self.checksum
    }

    /// The operator asked for a mounted destination to be unmounted first.
    pub fn force_unmount(&self) -> bool {
        self.force_unmount
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Number of times the source is written over the target.
    pub fn passes(&self) -> u32 {
        match &self.source {
            Source::Fill(fill) => fill.passes.max(1),
            _ => 1,
        }
    }

    /// Total bytes the executor is expected to move, when known.
    pub fn expected_bytes(&self) -> Option<u64> {
        let per_pass = match (&self.source, &self.target) {
            (Source::Fill(_), Target::Device(device)) => Some(device.size_bytes),
            (source, _) => source.extent(),
        }?;
        per_pass.checked_mul(u64::from(self.passes()))
    }

    /// Records the operator's acknowledgment. There is no way back.
    pub fn confirm(mut self) -> Self {
        self.confirmed = true;
        self
    }
}

/// Incrementally assembles an [`OperationRequest`].
#[derive(Clone, Debug)]
pub struct RequestBuilder {
    kind: OperationKind,
    source: Option<Source>,
    target: Option<Target>,
    block_size: BlockSize,
    checksum: Option<ChecksumAlgorithm>,
    force_unmount: bool,
}

impl RequestBuilder {
    pub fn new(kind: OperationKind) -> Self {
        let source = match kind {
            OperationKind::Wipe => Some(Source::Fill(Fill::default())),
            _ => None,
        };
        Self {
            kind,
            source,
            target: None,
            block_size: BlockSize::default(),
            checksum: None,
            force_unmount: false,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn source_device(mut self, device: Device) -> Self {
        self.source = Some(Source::Device(device));
        self
    }

    pub fn source_image(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.source = Some(Source::Image(ImageFile::open(path.as_ref())?));
        Ok(self)
    }

    pub fn fill(mut self, pattern: FillPattern, passes: u32) -> Self {
        self.source = Some(Source::Fill(Fill { pattern, passes }));
        self
    }

    pub fn target_device(mut self, device: Device) -> Self {
        self.target = Some(Target::Device(device));
        self
    }

    pub fn target_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.target = Some(Target::Image(path.into()));
        self
    }

    pub fn block_size(mut self, block_size: BlockSize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn checksum(mut self, checksum: ChecksumAlgorithm) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn force_unmount(mut self, force: bool) -> Self {
        self.force_unmount = force;
        self
    }

    /// Checks the source/target roles for the operation kind and builds the request.
    pub fn build(self) -> Result<OperationRequest> {
        let kind = self.kind;
        let source = self
            .source
            .ok_or_else(|| Error::InvalidRequest(format!("{kind} needs a source")))?;
        let target = self
            .target
            .ok_or_else(|| Error::InvalidRequest(format!("{kind} needs a destination")))?;

        let roles_ok = matches!(
            (kind, &source, &target),
            (OperationKind::Backup, Source::Device(_), Target::Image(_))
                | (OperationKind::Restore, Source::Image(_), Target::Device(_))
                | (OperationKind::Clone, Source::Device(_), Target::Device(_))
                | (OperationKind::Wipe, Source::Fill(_), Target::Device(_))
        );
        if !roles_ok {
            return Err(Error::InvalidRequest(format!(
                "{kind} cannot copy from {source} to {target}"
            )));
        }

        if let Source::Fill(fill) = &source {
            if fill.passes == 0 {
                return Err(Error::InvalidRequest("a wipe needs at least one pass".into()));
            }
        }

        Ok(OperationRequest {
            kind,
            source,
            target,
            block_size: self.block_size,
            checksum: self.checksum.unwrap_or(kind.default_checksum()),
            force_unmount: self.force_unmount,
            confirmed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    fn disk(path: &str, size_bytes: u64) -> Device {
        Device {
            path: PathBuf::from(path),
            name: path.trim_start_matches("/dev/").to_string(),
            size_bytes,
            kind: DeviceKind::Disk,
            mount_points: Vec::new(),
            removable: true,
            model: None,
            system: false,
        }
    }

    #[test]
    fn kind_table() {
        assert!(!OperationKind::Backup.is_destructive());
        assert!(OperationKind::Restore.is_destructive());
        assert!(OperationKind::Clone.is_destructive());
        assert!(OperationKind::Wipe.is_destructive());

        assert_eq!(OperationKind::Backup.default_checksum(), ChecksumAlgorithm::Sha256);
        assert_eq!(OperationKind::Restore.default_checksum(), ChecksumAlgorithm::Sha256);
        assert_eq!(OperationKind::Clone.default_checksum(), ChecksumAlgorithm::Sha256);
        assert_eq!(OperationKind::Wipe.default_checksum(), ChecksumAlgorithm::None);
    }

    #[test]
    fn parses_kind_and_checksum() {
        assert_eq!("Clone".parse::<OperationKind>().unwrap(), OperationKind::Clone);
        assert!("format".parse::<OperationKind>().is_err());
        assert_eq!("SHA-256".parse::<ChecksumAlgorithm>().unwrap(), ChecksumAlgorithm::Sha256);
        assert_eq!("md5".parse::<ChecksumAlgorithm>().unwrap(), ChecksumAlgorithm::Md5);
        assert!("crc32".parse::<ChecksumAlgorithm>().is_err());
    }

    #[test]
    fn block_size_parsing() {
        assert_eq!("4M".parse::<BlockSize>().unwrap().bytes(), 4 * 1024 * 1024);
        assert_eq!("4MiB".parse::<BlockSize>().unwrap().bytes(), 4 * 1024 * 1024);
        assert_eq!("64k".parse::<BlockSize>().unwrap().bytes(), 64 * 1024);
        assert_eq!("512".parse::<BlockSize>().unwrap().bytes(), 512);
        assert!("3M".parse::<BlockSize>().is_err());
        assert!("256".parse::<BlockSize>().is_err());
        assert!("2G".parse::<BlockSize>().is_err());
        assert!("M".parse::<BlockSize>().is_err());
        assert_eq!(BlockSize::DEFAULT.to_string(), "4M");
        assert_eq!(BlockSize::new(512).unwrap().to_string(), "512");
    }

    #[test]
    fn builder_enforces_roles() {
        let err = RequestBuilder::new(OperationKind::Backup)
            .source_device(disk("/dev/sda", 100))
            .target_device(disk("/dev/sdb", 100))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));

        let err = RequestBuilder::new(OperationKind::Clone)
            .source_device(disk("/dev/sda", 100))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("needs a destination"));
    }

    #[test]
    fn built_request_is_unconfirmed_with_kind_default_checksum() {
        let req = RequestBuilder::new(OperationKind::Clone)
            .source_device(disk("/dev/sda", 100))
            .target_device(disk("/dev/sdb", 100))
            .build()
            .unwrap();
        assert!(!req.is_confirmed());
        assert_eq!(req.checksum(), ChecksumAlgorithm::Sha256);
        assert_eq!(req.expected_bytes(), Some(100));
        assert!(req.confirm().is_confirmed());
    }

    #[test]
    fn wipe_expected_bytes_cover_every_pass() {
        let req = RequestBuilder::new(OperationKind::Wipe)
            .fill(FillPattern::Random, 3)
            .target_device(disk("/dev/sdb", 1000))
            .build()
            .unwrap();
        assert_eq!(req.passes(), 3);
        assert_eq!(req.expected_bytes(), Some(3000));
        assert_eq!(req.checksum(), ChecksumAlgorithm::None);
        assert_eq!(req.source().to_string(), "random data (3 passes)");
    }

    #[test]
    fn wipe_rejects_zero_passes() {
        let err = RequestBuilder::new(OperationKind::Wipe)
            .fill(FillPattern::Zero, 0)
            .target_device(disk("/dev/sdb", 1000))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}
