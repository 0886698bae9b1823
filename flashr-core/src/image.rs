use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

/// The declared type of an image, taken from its file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    /// A raw disk image (`.img`, `.raw`, `.bin`).
    Img,
    Iso,
    Dmg,
    Other,
}

impl ImageKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match ext.as_str() {
            "img" | "raw" | "bin" => ImageKind::Img,
            "iso" => ImageKind::Iso,
            "dmg" => ImageKind::Dmg,
            _ => ImageKind::Other,
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageKind::Img => "img",
            ImageKind::Iso => "iso",
            ImageKind::Dmg => "dmg",
            ImageKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// An image selected for flashing.
///
/// Everything but the checksum is fixed at construction; the checksum is
/// attached once it has been computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    path: PathBuf,
    size: u64,
    kind: ImageKind,
    checksum: Option<String>,
}

impl ImageDescriptor {
    pub fn new(path: impl Into<PathBuf>, size: u64, kind: ImageKind) -> Self {
        Self {
            path: path.into(),
            size,
            kind,
            checksum: None,
        }
    }

    /// Describes the file at `path`, reading its size from the filesystem.
    pub fn from_path(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let size = std::fs::metadata(&path)?.len();
        let kind = ImageKind::from_path(&path);
        Ok(Self::new(path, size, kind))
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.attach_checksum(checksum);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    /// The SHA-256 of the image as lowercase hex, if known.
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn attach_checksum(&mut self, checksum: impl Into<String>) {
        self.checksum = Some(checksum.into().to_lowercase());
    }
}

/// Resolves an image reference to a readable byte stream.
///
/// Implementations may sit on top of sandboxed or permission-scoped file
/// access; the core only ever asks whether the image is reachable and for a
/// fresh stream positioned at its first byte.
pub trait ImageAccess: Send + Sync {
    fn exists(&self, image: &ImageDescriptor) -> bool;

    fn open(&self, image: &ImageDescriptor) -> io::Result<Box<dyn Read + Send>>;
}

/// Plain filesystem access.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileImageAccess;

impl ImageAccess for FileImageAccess {
    fn exists(&self, image: &ImageDescriptor) -> bool {
        image.path().is_file()
    }

    fn open(&self, image: &ImageDescriptor) -> io::Result<Box<dyn Read + Send>> {
        let file = File::open(image.path())?;
        Ok(Box::new(BufReader::new(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn kind_follows_extension() {
        assert_eq!(ImageKind::from_path(Path::new("a/raspios.IMG")), ImageKind::Img);
        assert_eq!(ImageKind::from_path(Path::new("ubuntu.iso")), ImageKind::Iso);
        assert_eq!(ImageKind::from_path(Path::new("installer.dmg")), ImageKind::Dmg);
        assert_eq!(ImageKind::from_path(Path::new("README")), ImageKind::Other);
    }

    #[test]
    fn from_path_reads_size_and_opens() {
        let mut file = NamedTempFile::with_suffix(".img").unwrap();
        file.write_all(b"hello image").unwrap();

        let image = ImageDescriptor::from_path(file.path()).unwrap();
        assert_eq!(image.size(), 11);
        assert_eq!(image.kind(), ImageKind::Img);
        assert_eq!(image.checksum(), None);

        let access = FileImageAccess;
        assert!(access.exists(&image));
        let mut contents = String::new();
        access.open(&image).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello image");
    }

    #[test]
    fn attached_checksums_are_lowercased() {
        let image = ImageDescriptor::new("x.img", 1, ImageKind::Img).with_checksum("ABCDEF");
        assert_eq!(image.checksum(), Some("abcdef"));
    }

    #[test]
    fn missing_image_does_not_exist() {
        let image = ImageDescriptor::new("/definitely/not/here.img", 1, ImageKind::Img);
        assert!(!FileImageAccess.exists(&image));
    }
}
