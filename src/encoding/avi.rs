// Streaming AVI writer (uncompressed BGR24)
//
// Frames are appended to the `movi` list as they arrive, so an interrupted
// recording still holds every frame written before the interruption. The RIFF
// sizes, frame counts and the `idx1` seek index are written by finish().
// If the process dies first, repair_avi_file() rebuilds them from the chunks
// on disk.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::video::{Frame, FrameGeometry, BYTES_PER_PIXEL};

use super::{ContainerFormat, RecorderError, RecordingSink, Result, SinkFactory};

// Fixed header layout: RIFF(12) + hdrl LIST(200) + movi LIST header(12)
const HEADER_LEN: u64 = 224;
const RIFF_SIZE_OFFSET: u64 = 4;
const TOTAL_FRAMES_OFFSET: u64 = 48;
const STREAM_LENGTH_OFFSET: u64 = 140;
const MOVI_SIZE_OFFSET: u64 = 216;
const MOVI_FOURCC_OFFSET: u64 = 220;

const FRAME_CHUNK_ID: &[u8; 4] = b"00db";
const AVIF_HASINDEX: u32 = 0x10;
const AVIIF_KEYFRAME: u32 = 0x10;

/// RIFF sizes are 32-bit; stop accepting frames well before they overflow
const MAX_RIFF_BYTES: u64 = u32::MAX as u64 - 16 * 1024 * 1024;

/// Flush to disk at least this often
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    /// Offset of the chunk header, relative to the `movi` fourcc
    offset: u32,
    size: u32,
}

/// Writes RGB24 frames into an uncompressed AVI file
pub struct AviStreamWriter {
    out: BufWriter<File>,
    path: PathBuf,
    geometry: FrameGeometry,
    stride: usize,
    index: Vec<IndexEntry>,
    /// Bytes written after the `movi` fourcc
    movi_bytes: u64,
    scratch: Vec<u8>,
    last_flush: Instant,
    fitted_warned: bool,
}

impl AviStreamWriter {
    pub fn create(path: &Path, geometry: FrameGeometry, fps: f64) -> Result<Self> {
        if geometry.width == 0 || geometry.height == 0 {
            return Err(RecorderError::Geometry(format!(
                "{}x{} is not a recordable size",
                geometry.width, geometry.height
            )));
        }
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 30.0 };

        let file = File::create(path).map_err(|e| RecorderError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut out = BufWriter::new(file);

        let stride = row_stride(geometry.width);
        let frame_bytes = (stride * geometry.height as usize) as u32;
        out.write_all(&header(geometry, fps, frame_bytes))?;
        out.flush()?;

        log::debug!(
            "AVI stream opened: {} ({}x{} @ {:.2} fps)",
            path.display(),
            geometry.width,
            geometry.height,
            fps
        );

        Ok(Self {
            out,
            path: path.to_path_buf(),
            geometry,
            stride,
            index: Vec::new(),
            movi_bytes: 4,
            scratch: Vec::with_capacity(frame_bytes as usize),
            last_flush: Instant::now(),
            fitted_warned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_count(&self) -> usize {
        self.index.len()
    }

    /// Convert to bottom-up BGR rows padded to 4 bytes. Frames of another size
    /// are cropped or padded with black to the stream geometry.
    fn pack(&mut self, frame: &Frame) -> Result<()> {
        if !frame.is_well_formed() {
            return Err(RecorderError::Geometry(format!(
                "frame declares {}x{} but carries {} bytes",
                frame.width,
                frame.height,
                frame.data.len()
            )));
        }
        if frame.geometry() != self.geometry && !self.fitted_warned {
            log::warn!(
                "Frame size {}x{} differs from recording size {}x{}, fitting",
                frame.width,
                frame.height,
                self.geometry.width,
                self.geometry.height
            );
            self.fitted_warned = true;
        }

        let (dst_w, dst_h) = (self.geometry.width as usize, self.geometry.height as usize);
        let src_w = frame.width as usize;
        let copy_w = dst_w.min(src_w);

        self.scratch.clear();
        self.scratch.resize(self.stride * dst_h, 0);

        for y in 0..dst_h.min(frame.height as usize) {
            let src = &frame.data[y * src_w * BYTES_PER_PIXEL..][..copy_w * BYTES_PER_PIXEL];
            let dst_start = (dst_h - 1 - y) * self.stride;
            let dst = &mut self.scratch[dst_start..dst_start + copy_w * BYTES_PER_PIXEL];
            for (d, s) in dst.chunks_exact_mut(3).zip(src.chunks_exact(3)) {
                d[0] = s[2];
                d[1] = s[1];
                d[2] = s[0];
            }
        }
        Ok(())
    }

    fn finalize(mut self) -> Result<u64> {
        let entries = self.index.len() as u32;

        self.out.write_all(b"idx1")?;
        self.out.write_all(&(entries * 16).to_le_bytes())?;
        for entry in &self.index {
            self.out.write_all(FRAME_CHUNK_ID)?;
            self.out.write_all(&AVIIF_KEYFRAME.to_le_bytes())?;
            self.out.write_all(&entry.offset.to_le_bytes())?;
            self.out.write_all(&entry.size.to_le_bytes())?;
        }
        self.out.flush()?;

        let file = self.out.get_mut();
        let file_len = file.seek(SeekFrom::End(0))?;
        patch_sizes(file, file_len, entries, self.movi_bytes as u32)?;
        file.sync_all()?;

        log::debug!("AVI stream finished: {} ({} frames, {} bytes)", self.path.display(), entries, file_len);
        Ok(file_len)
    }
}

impl RecordingSink for AviStreamWriter {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        self.pack(frame)?;

        let size = self.scratch.len() as u64;
        if HEADER_LEN + self.movi_bytes + 8 + size + 16 * (self.index.len() as u64 + 1) > MAX_RIFF_BYTES {
            return Err(RecorderError::Write("AVI size limit reached".into()));
        }

        self.out
            .write_all(FRAME_CHUNK_ID)
            .and_then(|_| self.out.write_all(&(size as u32).to_le_bytes()))
            .and_then(|_| self.out.write_all(&self.scratch))
            .map_err(|e| RecorderError::Write(e.to_string()))?;

        self.index.push(IndexEntry {
            offset: self.movi_bytes as u32,
            size: size as u32,
        });
        self.movi_bytes += 8 + size;

        if self.last_flush.elapsed() >= FLUSH_INTERVAL {
            self.out.flush().map_err(|e| RecorderError::Write(e.to_string()))?;
            self.last_flush = Instant::now();
        }
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        HEADER_LEN - 4 + self.movi_bytes
    }

    fn finish(self: Box<Self>) -> Result<u64> {
        (*self).finalize()
    }
}

/// Opens [`AviStreamWriter`] sinks
#[derive(Debug, Clone, Copy, Default)]
pub struct AviSinkFactory;

impl SinkFactory for AviSinkFactory {
    fn open(&self, path: &Path, geometry: FrameGeometry, fps: f64) -> Result<Box<dyn RecordingSink>> {
        Ok(Box::new(AviStreamWriter::create(path, geometry, fps)?))
    }

    fn format(&self) -> ContainerFormat {
        ContainerFormat::Avi
    }
}

fn row_stride(width: u32) -> usize {
    (width as usize * BYTES_PER_PIXEL + 3) & !3
}

fn header(geometry: FrameGeometry, fps: f64, frame_bytes: u32) -> Vec<u8> {
    let mut h = Vec::with_capacity(HEADER_LEN as usize);
    let u32le = |h: &mut Vec<u8>, v: u32| h.extend_from_slice(&v.to_le_bytes());
    let rate = (fps * 1000.0).round() as u32;

    h.extend_from_slice(b"RIFF");
    u32le(&mut h, 0); // patched at finish
    h.extend_from_slice(b"AVI ");

    h.extend_from_slice(b"LIST");
    u32le(&mut h, 192);
    h.extend_from_slice(b"hdrl");

    // Main header
    h.extend_from_slice(b"avih");
    u32le(&mut h, 56);
    u32le(&mut h, (1_000_000.0 / fps).round() as u32);
    u32le(&mut h, (frame_bytes as f64 * fps).min(u32::MAX as f64) as u32);
    u32le(&mut h, 0);
    u32le(&mut h, AVIF_HASINDEX);
    u32le(&mut h, 0); // total frames, patched at finish
    u32le(&mut h, 0);
    u32le(&mut h, 1);
    u32le(&mut h, frame_bytes);
    u32le(&mut h, geometry.width);
    u32le(&mut h, geometry.height);
    h.extend_from_slice(&[0u8; 16]);

    h.extend_from_slice(b"LIST");
    u32le(&mut h, 116);
    h.extend_from_slice(b"strl");

    // Stream header
    h.extend_from_slice(b"strh");
    u32le(&mut h, 56);
    h.extend_from_slice(b"vids");
    h.extend_from_slice(b"DIB ");
    u32le(&mut h, 0);
    h.extend_from_slice(&[0u8; 4]); // priority, language
    u32le(&mut h, 0);
    u32le(&mut h, 1000); // scale
    u32le(&mut h, rate);
    u32le(&mut h, 0);
    u32le(&mut h, 0); // length, patched at finish
    u32le(&mut h, frame_bytes);
    u32le(&mut h, u32::MAX); // quality: default
    u32le(&mut h, 0);
    h.extend_from_slice(&0u16.to_le_bytes());
    h.extend_from_slice(&0u16.to_le_bytes());
    h.extend_from_slice(&(geometry.width as u16).to_le_bytes());
    h.extend_from_slice(&(geometry.height as u16).to_le_bytes());

    // BITMAPINFOHEADER, positive height = bottom-up rows
    h.extend_from_slice(b"strf");
    u32le(&mut h, 40);
    u32le(&mut h, 40);
    u32le(&mut h, geometry.width);
    u32le(&mut h, geometry.height);
    h.extend_from_slice(&1u16.to_le_bytes());
    h.extend_from_slice(&24u16.to_le_bytes());
    u32le(&mut h, 0);
    u32le(&mut h, frame_bytes);
    h.extend_from_slice(&[0u8; 16]);

    h.extend_from_slice(b"LIST");
    u32le(&mut h, 0); // movi size, patched at finish
    h.extend_from_slice(b"movi");

    debug_assert_eq!(h.len() as u64, HEADER_LEN);
    h
}

fn patch_sizes(file: &mut File, file_len: u64, frames: u32, movi_size: u32) -> std::io::Result<()> {
    for (offset, value) in [
        (RIFF_SIZE_OFFSET, (file_len - 8) as u32),
        (TOTAL_FRAMES_OFFSET, frames),
        (STREAM_LENGTH_OFFSET, frames),
        (MOVI_SIZE_OFFSET, movi_size),
    ] {
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&value.to_le_bytes())?;
    }
    file.flush()
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// True if an AVI file's RIFF size does not match its length (interrupted write)
pub fn avi_file_needs_repair(file_path: &Path) -> bool {
    let Ok(mut file) = File::open(file_path) else { return false };
    let Ok(meta) = file.metadata() else { return false };
    if meta.len() < HEADER_LEN {
        return false;
    }

    let mut riff = [0u8; 12];
    if file.read_exact(&mut riff).is_err() {
        return false;
    }
    if &riff[0..4] != b"RIFF" || &riff[8..12] != b"AVI " {
        return false;
    }
    read_u32(&riff, 4) as u64 != meta.len() - 8
}

/// Rebuild sizes and the seek index of an interrupted recording.
/// A partial trailing frame is cut off. Returns the number of frames kept.
pub fn repair_avi_file(file_path: &Path) -> anyhow::Result<u32> {
    let mut file = OpenOptions::new().read(true).write(true).open(file_path)?;
    let file_len = file.metadata()?.len();
    if file_len < HEADER_LEN {
        anyhow::bail!("File too small to be an AVI recording");
    }

    let mut header = vec![0u8; HEADER_LEN as usize];
    file.read_exact(&mut header)?;
    if &header[0..4] != b"RIFF"
        || &header[8..12] != b"AVI "
        || &header[MOVI_FOURCC_OFFSET as usize..HEADER_LEN as usize] != b"movi"
    {
        anyhow::bail!("Not an AVI recording written by this application");
    }

    // Walk the frame chunks until the data runs out
    let mut index = Vec::new();
    let mut pos = HEADER_LEN;
    loop {
        let mut chunk = [0u8; 8];
        if pos + 8 > file_len || file.read_exact(&mut chunk).is_err() {
            break;
        }
        let size = read_u32(&chunk, 4) as u64;
        if &chunk[0..4] != FRAME_CHUNK_ID || pos + 8 + size > file_len {
            break;
        }
        index.push(IndexEntry {
            offset: (pos - MOVI_FOURCC_OFFSET) as u32,
            size: size as u32,
        });
        pos += 8 + size;
        file.seek(SeekFrom::Start(pos))?;
    }

    file.set_len(pos)?;
    file.seek(SeekFrom::Start(pos))?;
    let frames = index.len() as u32;
    let mut idx1 = Vec::with_capacity(8 + index.len() * 16);
    idx1.extend_from_slice(b"idx1");
    idx1.extend_from_slice(&(frames * 16).to_le_bytes());
    for entry in &index {
        idx1.extend_from_slice(FRAME_CHUNK_ID);
        idx1.extend_from_slice(&AVIIF_KEYFRAME.to_le_bytes());
        idx1.extend_from_slice(&entry.offset.to_le_bytes());
        idx1.extend_from_slice(&entry.size.to_le_bytes());
    }
    file.write_all(&idx1)?;

    let new_len = pos + idx1.len() as u64;
    patch_sizes(&mut file, new_len, frames, (pos - MOVI_FOURCC_OFFSET) as u32)?;

    log::info!("Repaired AVI recording {} ({} frames, {} bytes)", file_path.display(), frames, new_len);
    Ok(frames)
}
