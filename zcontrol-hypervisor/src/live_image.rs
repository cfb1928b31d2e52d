//! Live image artifacts for the simulated network boot.
//!
//! A partition that cannot boot from the network natively is IPLed from a
//! small rescue image instead. The hypervisor loads that image with its
//! native `.ins` mechanism, so the artifact is a gzip tarball of:
//!
//! ```text
//! kernel             loaded at 0x00000000
//! initrd.addrsize    loaded at 0x00010408, initrd offset and size
//! parmfile           loaded at 0x00010480, kernel command line
//! initrd             loaded at the configured offset
//! <name>.ins         the descriptor listing the four files above
//! ```
//!
//! `initrd.addrsize` records the size of the initrd it was built for, so a
//! tarball has to be rebuilt whenever the embedded payload changes size.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::{debug, info};

pub const KERNEL_ADDR: u64 = 0x0000_0000;
pub const ADDRSIZE_ADDR: u64 = 0x0001_0408;
pub const PARMFILE_ADDR: u64 = 0x0001_0480;
pub const DEFAULT_INITRD_ADDR: u64 = 0x0200_0000;

/// Longest kernel command line the loader accepts.
pub const MAX_PARMFILE: usize = 4096;

pub const KERNEL_FILE: &str = "kernel";
pub const INITRD_FILE: &str = "initrd";
pub const ADDRSIZE_FILE: &str = "initrd.addrsize";
pub const PARMFILE_FILE: &str = "parmfile";

#[derive(Error, Debug)]
pub enum LiveImageError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Value {value:#x} does not fit a {width}-bit initrd.addrsize")]
    AddressOverflow { value: u64, width: u32 },

    #[error("Kernel of {kernel} bytes overlaps the initrd at {initrd_addr:#010x}")]
    Overlap { kernel: u64, initrd_addr: u64 },

    #[error("Parmfile is {len} bytes, at most {max} are allowed", max = MAX_PARMFILE)]
    ParmfileTooLong { len: usize },

    #[error("Malformed live image {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, LiveImageError>;

fn io(path: &Path) -> impl FnOnce(std::io::Error) -> LiveImageError + '_ {
    move |source| LiveImageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Width of the fields in `initrd.addrsize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddrWidth {
    Bits32,
    #[default]
    Bits64,
}

impl AddrWidth {
    fn bits(self) -> u32 {
        match self {
            AddrWidth::Bits32 => 32,
            AddrWidth::Bits64 => 64,
        }
    }
}

/// Encode the initrd offset and size, big-endian.
pub fn addrsize(offset: u64, size: u64, width: AddrWidth) -> Result<Vec<u8>> {
    match width {
        AddrWidth::Bits64 => {
            let mut out = Vec::with_capacity(16);
            out.extend_from_slice(&offset.to_be_bytes());
            out.extend_from_slice(&size.to_be_bytes());
            Ok(out)
        }
        AddrWidth::Bits32 => {
            let narrow = |value: u64| {
                u32::try_from(value).map_err(|_| LiveImageError::AddressOverflow {
                    value,
                    width: width.bits(),
                })
            };
            let mut out = Vec::with_capacity(8);
            out.extend_from_slice(&narrow(offset)?.to_be_bytes());
            out.extend_from_slice(&narrow(size)?.to_be_bytes());
            Ok(out)
        }
    }
}

/// Decode `initrd.addrsize` back into (offset, size). The width follows
/// from the length.
pub fn parse_addrsize(bytes: &[u8]) -> Option<(u64, u64)> {
    match bytes.len() {
        8 => {
            let offset = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
            let size = u32::from_be_bytes(bytes[4..8].try_into().ok()?);
            Some((offset.into(), size.into()))
        }
        16 => {
            let offset = u64::from_be_bytes(bytes[0..8].try_into().ok()?);
            let size = u64::from_be_bytes(bytes[8..16].try_into().ok()?);
            Some((offset, size))
        }
        _ => None,
    }
}

/// Contents of a live image before packing.
#[derive(Debug, Clone)]
pub struct LiveImage {
    name: String,
    kernel: Vec<u8>,
    initrd: Vec<u8>,
    parmfile: String,
    initrd_addr: u64,
    width: AddrWidth,
}

impl LiveImage {
    pub fn new(name: impl Into<String>, kernel: Vec<u8>, initrd: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kernel,
            initrd,
            parmfile: String::new(),
            initrd_addr: DEFAULT_INITRD_ADDR,
            width: AddrWidth::default(),
        }
    }

    /// Read kernel and initrd from disk.
    pub fn from_files(name: impl Into<String>, kernel: &Path, initrd: &Path) -> Result<Self> {
        let kernel_bytes = std::fs::read(kernel).map_err(io(kernel))?;
        let initrd_bytes = std::fs::read(initrd).map_err(io(initrd))?;
        Ok(Self::new(name, kernel_bytes, initrd_bytes))
    }

    pub fn with_parmfile(mut self, cmdline: impl Into<String>) -> Self {
        self.parmfile = cmdline.into();
        self
    }

    pub fn with_initrd_addr(mut self, addr: u64) -> Self {
        self.initrd_addr = addr;
        self
    }

    pub fn with_width(mut self, width: AddrWidth) -> Self {
        self.width = width;
        self
    }

    pub fn descriptor_name(&self) -> String {
        format!("{}.ins", self.name)
    }

    pub fn initrd_size(&self) -> u64 {
        self.initrd.len() as u64
    }

    /// The `.ins` descriptor, one `file address` line per component.
    pub fn descriptor(&self) -> String {
        format!(
            "* {} live image\n{} {:#010x}\n{} {:#010x}\n{} {:#010x}\n{} {:#010x}\n",
            self.name,
            KERNEL_FILE,
            KERNEL_ADDR,
            INITRD_FILE,
            self.initrd_addr,
            ADDRSIZE_FILE,
            ADDRSIZE_ADDR,
            PARMFILE_FILE,
            PARMFILE_ADDR,
        )
    }

    fn check(&self) -> Result<()> {
        if self.parmfile.len() > MAX_PARMFILE {
            return Err(LiveImageError::ParmfileTooLong {
                len: self.parmfile.len(),
            });
        }
        let kernel = self.kernel.len() as u64;
        if kernel > self.initrd_addr {
            return Err(LiveImageError::Overlap {
                kernel,
                initrd_addr: self.initrd_addr,
            });
        }
        Ok(())
    }

    /// Pack the image as a gzip tarball into `writer`.
    pub fn pack<W: Write>(&self, writer: W) -> std::io::Result<W> {
        let invalid = |e: LiveImageError| std::io::Error::new(std::io::ErrorKind::InvalidInput, e);
        self.check().map_err(invalid)?;
        let addrsize = addrsize(self.initrd_addr, self.initrd_size(), self.width).map_err(invalid)?;
        let mut parmfile = self.parmfile.clone();
        parmfile.push('\n');
        let descriptor = self.descriptor();
        let descriptor_name = self.descriptor_name();
        let mtime = Utc::now().timestamp().max(0) as u64;

        let entries: [(&str, &[u8]); 5] = [
            (KERNEL_FILE, &self.kernel),
            (INITRD_FILE, &self.initrd),
            (ADDRSIZE_FILE, &addrsize),
            (PARMFILE_FILE, parmfile.as_bytes()),
            (descriptor_name.as_str(), descriptor.as_bytes()),
        ];

        let mut builder = tar::Builder::new(GzEncoder::new(writer, Compression::default()));
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(mtime);
            header.set_cksum();
            builder.append_data(&mut header, name, data)?;
        }
        builder.into_inner()?.finish()
    }

    /// Write the tarball to `path`.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        self.check()?;
        let file = File::create(path).map_err(io(path))?;
        let mut file = self.pack(file).map_err(io(path))?;
        file.flush().map_err(io(path))?;
        info!(
            path = %path.display(),
            kernel = self.kernel.len(),
            initrd = self.initrd.len(),
            initrd_addr = %format!("{:#010x}", self.initrd_addr),
            "Live image written"
        );
        Ok(())
    }
}

/// Read the (offset, size) pair recorded in a live image tarball.
pub fn recorded_addrsize(path: &Path) -> Result<(u64, u64)> {
    let file = File::open(path).map_err(io(path))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries().map_err(io(path))? {
        let mut entry = entry.map_err(io(path))?;
        if entry.path().map_err(io(path))?.as_ref() != Path::new(ADDRSIZE_FILE) {
            continue;
        }
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(io(path))?;
        return parse_addrsize(&bytes).ok_or_else(|| LiveImageError::Malformed {
            path: path.to_path_buf(),
            reason: format!("{} has {} bytes", ADDRSIZE_FILE, bytes.len()),
        });
    }
    Err(LiveImageError::Malformed {
        path: path.to_path_buf(),
        reason: format!("no {} entry", ADDRSIZE_FILE),
    })
}

/// Whether the tarball at `path` has to be rebuilt for an initrd of
/// `payload_size` bytes. A missing tarball always does.
pub fn needs_regeneration(path: &Path, payload_size: u64) -> Result<bool> {
    if !path.exists() {
        debug!(path = %path.display(), "No live image yet");
        return Ok(true);
    }
    let (_, recorded) = recorded_addrsize(path)?;
    if recorded != payload_size {
        info!(
            path = %path.display(),
            recorded,
            current = payload_size,
            "Initrd size changed, live image is stale"
        );
    }
    Ok(recorded != payload_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn unpack(path: &Path) -> HashMap<String, Vec<u8>> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    #[test]
    fn test_addrsize_encoding() {
        assert_eq!(
            addrsize(0x0200_0000, 0x1234, AddrWidth::Bits32).unwrap(),
            vec![0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34]
        );
        let wide = addrsize(0x0200_0000, 0x1234, AddrWidth::Bits64).unwrap();
        assert_eq!(wide.len(), 16);
        assert_eq!(&wide[4..8], &[0x02, 0x00, 0x00, 0x00]);
        assert_eq!(&wide[14..16], &[0x12, 0x34]);
        assert_eq!(parse_addrsize(&wide), Some((0x0200_0000, 0x1234)));

        let err = addrsize(0x1_0000_0000, 1, AddrWidth::Bits32).unwrap_err();
        assert!(matches!(err, LiveImageError::AddressOverflow { width: 32, .. }));
        assert_eq!(parse_addrsize(&[0; 5]), None);
    }

    #[test]
    fn test_descriptor_lists_load_addresses() {
        let image = LiveImage::new("rescue", vec![0; 16], vec![1; 8]).with_initrd_addr(0x0300_0000);
        let descriptor = image.descriptor();
        let lines: Vec<&str> = descriptor.lines().skip(1).collect();
        assert_eq!(
            lines,
            vec![
                "kernel 0x00000000",
                "initrd 0x03000000",
                "initrd.addrsize 0x00010408",
                "parmfile 0x00010480",
            ]
        );
        assert_eq!(image.descriptor_name(), "rescue.ins");
    }

    #[test]
    fn test_write_and_regenerate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rescue.tgz");
        assert!(needs_regeneration(&path, 3).unwrap());

        let image = LiveImage::new("rescue", b"KERNEL".to_vec(), b"abc".to_vec())
            .with_parmfile("root=/dev/ram0 ip=dhcp")
            .with_width(AddrWidth::Bits32);
        image.write_to(&path).unwrap();

        let files = unpack(&path);
        assert_eq!(files["kernel"], b"KERNEL");
        assert_eq!(files["initrd"], b"abc");
        assert_eq!(files["parmfile"], b"root=/dev/ram0 ip=dhcp\n");
        assert_eq!(files["initrd.addrsize"].len(), 8);
        assert!(String::from_utf8_lossy(&files["rescue.ins"]).contains("parmfile 0x00010480"));

        assert_eq!(recorded_addrsize(&path).unwrap(), (DEFAULT_INITRD_ADDR, 3));
        assert!(!needs_regeneration(&path, 3).unwrap());
        assert!(needs_regeneration(&path, 4).unwrap());
    }

    #[test]
    fn test_rejects_bad_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tgz");

        let long = LiveImage::new("rescue", vec![0; 4], vec![0; 4]).with_parmfile("x".repeat(MAX_PARMFILE + 1));
        assert!(matches!(long.write_to(&path), Err(LiveImageError::ParmfileTooLong { .. })));

        let overlap = LiveImage::new("rescue", vec![0; 32], vec![0; 4]).with_initrd_addr(16);
        assert!(matches!(overlap.write_to(&path), Err(LiveImageError::Overlap { .. })));

        std::fs::write(&path, b"not a tarball").unwrap();
        assert!(recorded_addrsize(&path).is_err());
    }

    #[test]
    fn test_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("image");
        let initrd = dir.path().join("initrd.img");
        std::fs::write(&kernel, b"k").unwrap();
        std::fs::write(&initrd, b"initrd-bytes").unwrap();
        let image = LiveImage::from_files("live", &kernel, &initrd).unwrap();
        assert_eq!(image.initrd_size(), 12);
        assert!(LiveImage::from_files("live", &dir.path().join("missing"), &initrd).is_err());
    }
}
