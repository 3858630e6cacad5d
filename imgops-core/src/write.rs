//! Contains the logic for writing an image file to a drive.
//!
//! This module handles the multi-stage process behind a `burn` operation:
//! 1.  Opening the image as a byte stream, decompressing it on-the-fly if it is
//!     compressed (`.gz`, `.xz`, `.zst`).
//! 2.  Writing the (decompressed) image data to the target drive.
//! 3.  Optionally verifying the written data against the source image.
//!
//! Each stage reports [`BurnProgress`] through a callback.
use anyhow::{Result, anyhow};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::{NamedTempFile, TempPath};
use tokio_util::sync::CancellationToken;
use xz2::read::XzDecoder;
use zstd::stream::read::Decoder as ZstdDecoder;

use crate::error::PipelineError;

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

// O_DIRECT requires buffers, offsets and lengths aligned to the sector size.
const BLOCK_SIZE: usize = 512;

/// Which part of a burn a progress report belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BurnStage {
    Decompress,
    Write,
    Verify,
}

/// A progress report from a burn.
#[derive(Clone, Debug, PartialEq)]
pub struct BurnProgress {
    pub stage: BurnStage,
    /// Bytes processed so far in this stage.
    pub transferred: u64,
    /// Total bytes this stage will process, when known.
    pub length: Option<u64>,
    pub percentage: Option<f64>,
    /// Bytes per second since the stage started.
    pub speed: f64,
    pub eta: Option<Duration>,
}

/// Turns byte counts into [`BurnProgress`] reports for one stage.
struct ProgressMeter {
    stage: BurnStage,
    length: Option<u64>,
    started: Instant,
}

impl ProgressMeter {
    fn new(stage: BurnStage, length: Option<u64>) -> Self {
        Self {
            stage,
            length,
            started: Instant::now(),
        }
    }

    fn report(&self, transferred: u64) -> BurnProgress {
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            transferred as f64 / elapsed
        } else {
            0.0
        };

        let percentage = self
            .length
            .filter(|&len| len > 0)
            .map(|len| (transferred as f64 / len as f64 * 100.0).min(100.0));

        let eta = match self.length {
            Some(len) if speed > 0.0 => Some(Duration::from_secs_f64(
                len.saturating_sub(transferred) as f64 / speed,
            )),
            _ => None,
        };

        BurnProgress {
            stage: self.stage,
            transferred,
            length: self.length,
            percentage,
            speed,
            eta,
        }
    }
}

/// Returns `true` if the file extension marks a compressed image.
pub fn is_compressed(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| {
            matches!(
                e.to_lowercase().as_str(),
                "gz" | "gzip" | "xz" | "zst" | "zstd"
            )
        })
}

/// An image opened for burning.
///
/// If the image was decompressed to a temp file, this struct holds the handle
/// and the file is deleted on drop.
pub struct ImageStream {
    file: File,
    path: PathBuf,
    length: Option<u64>,
    _temp_handle: Option<TempPath>,
}

impl ImageStream {
    /// Opens an uncompressed image file as-is.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            path: path.to_path_buf(),
            length: None,
            _temp_handle: None,
        })
    }

    /// Opens an image, decompressing it to a temporary file first if its
    /// extension says it is compressed.
    pub fn open<F>(image_path: &Path, cancel: &CancellationToken, on_progress: F) -> Result<Self>
    where
        F: FnMut(BurnProgress),
    {
        let ext = image_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let input = BufReader::new(File::open(image_path)?);

        // Create a reader based on the file extension.
        let reader: Box<dyn Read> = match ext.as_str() {
            "gz" | "gzip" => Box::new(GzDecoder::new(input)),
            "xz" => Box::new(XzDecoder::new(input)),
            "zst" | "zstd" => Box::new(ZstdDecoder::new(input)?),
            _ => return Ok(Self::from_file(image_path)?),
        };

        let temp_path = decompress(reader, cancel, on_progress)?;
        Ok(Self {
            file: File::open(&temp_path)?,
            path: temp_path.to_path_buf(),
            length: None,
            _temp_handle: Some(temp_path),
        })
    }

    /// Sets the stream length.
    pub fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    /// Fills in the stream length from the underlying file's size, unless a
    /// length is already known. Returns the length.
    pub fn attach_length(&mut self) -> io::Result<u64> {
        match self.length {
            Some(length) => Ok(length),
            None => {
                let length = self.file.metadata()?.len();
                self.length = Some(length);
                Ok(length)
            }
        }
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Path of the bytes being streamed: the image itself, or the
    /// decompressed temporary copy.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for ImageStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

fn decompress<F>(
    mut reader: Box<dyn Read>,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<TempPath>
where
    F: FnMut(BurnProgress),
{
    let meter = ProgressMeter::new(BurnStage::Decompress, None);
    let mut temp_file = NamedTempFile::new()?;
    {
        let mut writer = BufWriter::new(&mut temp_file);
        let mut buffer = [0u8; 8192];
        let mut total: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled.into());
            }

            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            total += n as u64;
            on_progress(meter.report(total));
        }
        writer.flush()?;
    }

    Ok(temp_file.into_temp_path())
}

/// Writes an image stream to a drive.
///
/// This is the disk-write primitive a `burn` operation delegates to. It runs
/// on a blocking thread.
pub trait DriveWriter: Send + Sync {
    fn write_image(
        &self,
        drive: &Path,
        image: ImageStream,
        verify: bool,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(BurnProgress),
    ) -> Result<()>;
}

/// Writes to block devices (or plain files) with large sequential chunks,
/// bypassing the page cache on Linux block devices.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlockDeviceWriter;

#[cfg(unix)]
fn is_block_device(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
}

#[cfg(not(unix))]
fn is_block_device(_path: &Path) -> bool {
    false
}

/// Opens the drive for writing. Returns whether unbuffered I/O is in use.
fn open_drive(path: &Path) -> io::Result<(File, bool)> {
    let mut options = OpenOptions::new();
    options.write(true);

    let direct = cfg!(target_os = "linux") && is_block_device(path);
    #[cfg(target_os = "linux")]
    if direct {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_DIRECT);
    }

    Ok((options.open(path)?, direct))
}

impl DriveWriter for BlockDeviceWriter {
    fn write_image(
        &self,
        drive: &Path,
        mut image: ImageStream,
        verify: bool,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(BurnProgress),
    ) -> Result<()> {
        let image_len = image.attach_length()?;
        let (mut device_file, direct) = open_drive(drive)?;

        // Align buffer to the block size for O_DIRECT compatibility.
        let mut buf = vec![0u8; BUFFER_SIZE + BLOCK_SIZE];
        let offset = buf.as_ptr().align_offset(BLOCK_SIZE);
        let buffer = &mut buf[offset..offset + BUFFER_SIZE];

        let meter = ProgressMeter::new(BurnStage::Write, Some(image_len));
        let mut written: u64 = 0;
        while written < image_len {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled.into());
            }

            let to_read = std::cmp::min(BUFFER_SIZE as u64, image_len - written) as usize;
            image.read_exact(&mut buffer[..to_read])?;

            // The last chunk may not be a multiple of the block size. Unbuffered
            // writes need it padded with zeros.
            let write_size = if direct && to_read % BLOCK_SIZE != 0 {
                let padded = to_read.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
                buffer[to_read..padded].fill(0);
                padded
            } else {
                to_read
            };

            device_file.write_all(&buffer[..write_size])?;
            written += to_read as u64;
            on_progress(meter.report(written));
        }

        device_file.flush()?;
        device_file.sync_all()?;

        if verify {
            verify_drive(image.path(), drive, image_len, cancel, on_progress)?;
        }

        Ok(())
    }
}

/// Compares the first `len` bytes of the drive against the image by hash.
fn verify_drive(
    image_path: &Path,
    drive: &Path,
    len: u64,
    cancel: &CancellationToken,
    on_progress: &mut dyn FnMut(BurnProgress),
) -> Result<()> {
    let mut image_file = File::open(image_path)?;
    let mut device_file = File::open(drive)?;

    let meter = ProgressMeter::new(BurnStage::Verify, Some(len));
    let mut image_hasher = Sha256::new();
    let mut device_hasher = Sha256::new();

    let mut image_buf = vec![0u8; BUFFER_SIZE];
    let mut device_buf = vec![0u8; BUFFER_SIZE];

    let mut remaining = len;
    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled.into());
        }

        let chunk = std::cmp::min(BUFFER_SIZE as u64, remaining) as usize;
        image_file.read_exact(&mut image_buf[..chunk])?;
        device_file.read_exact(&mut device_buf[..chunk])?;

        image_hasher.update(&image_buf[..chunk]);
        device_hasher.update(&device_buf[..chunk]);

        remaining -= chunk as u64;
        on_progress(meter.report(len - remaining));
    }

    if image_hasher.finalize() != device_hasher.finalize() {
        return Err(anyhow!("Verification failed: hash mismatch."));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tempfile::tempdir;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn detects_compressed_extensions() {
        assert!(is_compressed(Path::new("os.img.xz")));
        assert!(is_compressed(Path::new("os.img.GZ")));
        assert!(is_compressed(Path::new("os.img.zst")));
        assert!(!is_compressed(Path::new("os.img")));
        assert!(!is_compressed(Path::new("image")));
    }

    #[test]
    fn attach_length_keeps_a_known_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("os.img");
        std::fs::write(&path, sample(1000)).unwrap();

        let mut stream = ImageStream::from_file(&path).unwrap();
        assert_eq!(stream.length(), None);
        assert_eq!(stream.attach_length().unwrap(), 1000);

        let mut stream = ImageStream::from_file(&path).unwrap().with_length(4096);
        assert_eq!(stream.attach_length().unwrap(), 4096);
    }

    #[test]
    fn gzip_images_are_decompressed_before_writing() {
        let dir = tempdir().unwrap();
        let data = sample(3 * 8192 + 17);
        let path = dir.path().join("os.img.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(&data).unwrap();
        encoder.finish().unwrap();

        let mut reports = Vec::new();
        let cancel = CancellationToken::new();
        let mut stream = ImageStream::open(&path, &cancel, |p| reports.push(p)).unwrap();

        assert_eq!(stream.attach_length().unwrap(), data.len() as u64);
        let mut contents = Vec::new();
        stream.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, data);

        let last = reports.last().unwrap();
        assert_eq!(last.stage, BurnStage::Decompress);
        assert_eq!(last.transferred, data.len() as u64);
        assert_eq!(last.percentage, None);
    }

    #[test]
    fn writes_and_verifies_a_plain_file_drive() {
        let dir = tempdir().unwrap();
        let data = sample(BUFFER_SIZE + 777);
        let image = dir.path().join("os.img");
        let drive = dir.path().join("drive.bin");
        std::fs::write(&image, &data).unwrap();
        File::create(&drive).unwrap();

        let mut reports = Vec::new();
        BlockDeviceWriter
            .write_image(
                &drive,
                ImageStream::from_file(&image).unwrap(),
                true,
                &CancellationToken::new(),
                &mut |p| reports.push(p),
            )
            .unwrap();

        assert_eq!(std::fs::read(&drive).unwrap(), data);
        let writes: Vec<_> = reports
            .iter()
            .filter(|p| p.stage == BurnStage::Write)
            .collect();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].percentage, Some(100.0));
        assert_eq!(reports.last().unwrap().stage, BurnStage::Verify);
    }

    #[test]
    fn cancelled_burn_stops_before_writing() {
        let dir = tempdir().unwrap();
        let image = dir.path().join("os.img");
        let drive = dir.path().join("drive.bin");
        std::fs::write(&image, sample(4096)).unwrap();
        File::create(&drive).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = BlockDeviceWriter
            .write_image(
                &drive,
                ImageStream::from_file(&image).unwrap(),
                false,
                &cancel,
                &mut |_| {},
            )
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Cancelled)
        ));
        assert!(std::fs::read(&drive).unwrap().is_empty());
    }
}
