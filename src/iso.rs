//! Native ISO9660 + Joliet image writer and a minimal reader.
//!
//! Images are flat: every file sits in the root directory. Sector layout:
//!
//! ```text
//! 0-15   system area
//! 16     primary volume descriptor
//! 17     Joliet supplementary volume descriptor
//! 18     descriptor set terminator
//! 19-22  path tables (primary L/M, Joliet L/M)
//! 23..   primary root directory, Joliet root directory, file data
//! ```

use crate::disc::{DiscEntry, DiscPlan};
use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SECTOR_SIZE: usize = 2048;

const SYSTEM_AREA_SECTORS: u32 = 16;
const PVD_SECTOR: u32 = 16;
const PATH_TABLE_PVD_L: u32 = 19;
const PATH_TABLE_PVD_M: u32 = 20;
const PATH_TABLE_JOLIET_L: u32 = 21;
const PATH_TABLE_JOLIET_M: u32 = 22;
const FIRST_DIRECTORY_SECTOR: u32 = 23;

/// Root-only path table: one 10-byte record.
const PATH_TABLE_SIZE: u32 = 10;
const ROOT_RECORD_LEN: usize = 34;
const FLAG_DIRECTORY: u8 = 0x02;
const STANDARD_ID: &[u8; 5] = b"CD001";
const JOLIET_ESCAPE: &[u8; 3] = b"%/E";
const APPLICATION_ID: &str = "DISCPRESS";

/// A completely written image, ready to burn.
///
/// The file is removed when the value is dropped; [`FinalizedImage::discard`]
/// removes it explicitly and reports failures.
#[derive(Debug)]
pub struct FinalizedImage {
    path: PathBuf,
    size: u64,
    volume_label: String,
    file_count: usize,
    removed: bool,
}

impl FinalizedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn volume_label(&self) -> &str {
        &self.volume_label
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }

    /// Delete the image file now.
    pub fn discard(mut self) -> std::io::Result<()> {
        self.removed = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Keep the image on disk and return its path.
    pub fn persist(mut self) -> PathBuf {
        self.removed = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for FinalizedImage {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove disc image {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Removes a half-written image unless disarmed.
struct PartialImage<'a> {
    path: &'a Path,
    armed: bool,
}

impl Drop for PartialImage<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Removing partial image {}", self.path.display());
            let _ = std::fs::remove_file(self.path);
        }
    }
}

struct FileExtent<'a> {
    entry: &'a DiscEntry,
    lba: u32,
    size: u32,
}

struct Layout<'a> {
    files: Vec<FileExtent<'a>>,
    pvd_ids: Vec<Vec<u8>>,
    joliet_ids: Vec<Vec<u8>>,
    /// Indices into `files` in directory record order.
    pvd_order: Vec<usize>,
    joliet_order: Vec<usize>,
    pvd_root_lba: u32,
    pvd_root_size: u32,
    joliet_root_lba: u32,
    joliet_root_size: u32,
    total_sectors: u32,
}

fn sectors_for(bytes: u64) -> u64 {
    bytes.div_ceil(SECTOR_SIZE as u64)
}

fn record_len(identifier_len: usize) -> usize {
    let len = 33 + identifier_len;
    if identifier_len % 2 == 0 {
        len + 1
    } else {
        len
    }
}

/// Size of a directory extent holding records of the given lengths, with no
/// record crossing a sector boundary.
fn directory_size(record_lens: impl IntoIterator<Item = usize>) -> u32 {
    let mut sectors = 1u32;
    let mut used = 0usize;
    for len in record_lens {
        if used + len > SECTOR_SIZE {
            sectors += 1;
            used = 0;
        }
        used += len;
    }
    sectors * SECTOR_SIZE as u32
}

fn pvd_identifier(entry: &DiscEntry) -> Vec<u8> {
    // The separator is mandatory even without an extension
    if entry.short_name.contains('.') {
        format!("{};1", entry.short_name).into_bytes()
    } else {
        format!("{}.;1", entry.short_name).into_bytes()
    }
}

fn joliet_identifier(entry: &DiscEntry) -> Vec<u8> {
    entry
        .long_name
        .encode_utf16()
        .flat_map(|unit| unit.to_be_bytes())
        .collect()
}

impl<'a> Layout<'a> {
    fn compute(plan: &'a DiscPlan) -> Result<Self> {
        let pvd_ids: Vec<Vec<u8>> = plan.entries.iter().map(pvd_identifier).collect();
        let joliet_ids: Vec<Vec<u8>> = plan.entries.iter().map(joliet_identifier).collect();

        // Directories are sized in the same sorted order they are packed in
        let mut pvd_order: Vec<usize> = (0..plan.entries.len()).collect();
        pvd_order.sort_by(|&a, &b| compare_pvd_identifiers(&pvd_ids[a], &pvd_ids[b]));
        let mut joliet_order: Vec<usize> = (0..plan.entries.len()).collect();
        joliet_order.sort_by(|&a, &b| joliet_ids[a].cmp(&joliet_ids[b]));

        let dots = [ROOT_RECORD_LEN, ROOT_RECORD_LEN];
        let pvd_root_size = directory_size(
            dots.into_iter()
                .chain(pvd_order.iter().map(|&i| record_len(pvd_ids[i].len()))),
        );
        let joliet_root_size = directory_size(
            dots.into_iter()
                .chain(joliet_order.iter().map(|&i| record_len(joliet_ids[i].len()))),
        );

        let pvd_root_lba = FIRST_DIRECTORY_SECTOR;
        let joliet_root_lba = pvd_root_lba + pvd_root_size / SECTOR_SIZE as u32;
        let mut next = joliet_root_lba as u64 + (joliet_root_size / SECTOR_SIZE as u32) as u64;

        let mut files = Vec::with_capacity(plan.entries.len());
        for entry in &plan.entries {
            let size = u32::try_from(entry.size).map_err(|_| {
                Error::image(format!(
                    "{} is too large for an ISO9660 file ({} bytes)",
                    entry.source.display(),
                    entry.size
                ))
            })?;
            files.push(FileExtent {
                entry,
                lba: next as u32,
                size,
            });
            // Empty files still get a sector of their own so extents stay distinct
            next += sectors_for(entry.size).max(1);
        }

        let total_sectors = u32::try_from(next)
            .map_err(|_| Error::image("image exceeds the ISO9660 volume size limit"))?;

        Ok(Self {
            files,
            pvd_ids,
            joliet_ids,
            pvd_order,
            joliet_order,
            pvd_root_lba,
            pvd_root_size,
            joliet_root_lba,
            joliet_root_size,
            total_sectors,
        })
    }
}

fn put_u16_both(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    buf[offset + 2..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_u32_both(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    buf[offset + 4..offset + 8].copy_from_slice(&value.to_be_bytes());
}

fn fill_ascii(buf: &mut [u8], offset: usize, len: usize, text: &str) {
    let field = &mut buf[offset..offset + len];
    field.fill(b' ');
    for (dst, src) in field.iter_mut().zip(text.bytes()) {
        *dst = src;
    }
}

fn fill_ucs2(buf: &mut [u8], offset: usize, len: usize, text: &str) {
    let field = &mut buf[offset..offset + len];
    for pair in field.chunks_mut(2) {
        pair.copy_from_slice(&[0x00, 0x20][..pair.len()]);
    }
    for (i, unit) in text.encode_utf16().take(len / 2).enumerate() {
        field[i * 2..i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
    }
}

fn record_date(now: &DateTime<Utc>) -> [u8; 7] {
    [
        (now.year() - 1900).clamp(0, 255) as u8,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
        now.second() as u8,
        0,
    ]
}

fn volume_date(now: &DateTime<Utc>) -> [u8; 17] {
    let mut out = [0u8; 17];
    let digits = now.format("%Y%m%d%H%M%S00").to_string();
    out[..16].copy_from_slice(&digits.as_bytes()[..16]);
    out
}

fn unset_volume_date() -> [u8; 17] {
    let mut out = [b'0'; 17];
    out[16] = 0;
    out
}

fn directory_record(lba: u32, size: u32, flags: u8, identifier: &[u8], date: &[u8; 7]) -> Vec<u8> {
    let len = record_len(identifier.len());
    let mut rec = vec![0u8; len];
    rec[0] = len as u8;
    put_u32_both(&mut rec, 2, lba);
    put_u32_both(&mut rec, 10, size);
    rec[18..25].copy_from_slice(date);
    rec[25] = flags;
    put_u16_both(&mut rec, 28, 1);
    rec[32] = identifier.len() as u8;
    rec[33..33 + identifier.len()].copy_from_slice(identifier);
    rec
}

/// ISO9660 ordering: name part, then extension, each compared as if padded
/// with spaces.
fn compare_pvd_identifiers(a: &[u8], b: &[u8]) -> Ordering {
    fn split(id: &[u8]) -> (&[u8], &[u8]) {
        let id = match id.iter().position(|&c| c == b';') {
            Some(i) => &id[..i],
            None => id,
        };
        match id.iter().position(|&c| c == b'.') {
            Some(i) => (&id[..i], &id[i + 1..]),
            None => (id, &[][..]),
        }
    }
    fn padded_cmp(a: &[u8], b: &[u8]) -> Ordering {
        let len = a.len().max(b.len());
        let pad = |s: &[u8], i: usize| s.get(i).copied().unwrap_or(b' ');
        (0..len)
            .map(|i| pad(a, i).cmp(&pad(b, i)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
    let (a_name, a_ext) = split(a);
    let (b_name, b_ext) = split(b);
    padded_cmp(a_name, b_name).then_with(|| padded_cmp(a_ext, b_ext))
}

fn pack_directory(
    self_lba: u32,
    self_size: u32,
    mut records: Vec<Vec<u8>>,
    date: &[u8; 7],
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(self_size as usize);
    // Root is its own parent
    out.extend(directory_record(self_lba, self_size, FLAG_DIRECTORY, &[0x00], date));
    out.extend(directory_record(self_lba, self_size, FLAG_DIRECTORY, &[0x01], date));

    for rec in records.drain(..) {
        let used = out.len() % SECTOR_SIZE;
        if used + rec.len() > SECTOR_SIZE {
            out.resize(out.len() + SECTOR_SIZE - used, 0);
        }
        out.extend(rec);
    }
    if out.len() > self_size as usize {
        return Err(Error::image(format!(
            "directory records need {} bytes but only {} were allotted",
            out.len(),
            self_size
        )));
    }
    out.resize(self_size as usize, 0);
    Ok(out)
}

fn path_table(root_lba: u32, big_endian: bool) -> [u8; SECTOR_SIZE] {
    let mut sector = [0u8; SECTOR_SIZE];
    sector[0] = 1; // identifier length
    let lba = if big_endian {
        root_lba.to_be_bytes()
    } else {
        root_lba.to_le_bytes()
    };
    sector[2..6].copy_from_slice(&lba);
    let parent = if big_endian {
        1u16.to_be_bytes()
    } else {
        1u16.to_le_bytes()
    };
    sector[6..8].copy_from_slice(&parent);
    sector
}

struct Descriptor<'a> {
    joliet: bool,
    volume_label: &'a str,
    total_sectors: u32,
    path_table_l: u32,
    path_table_m: u32,
    root_lba: u32,
    root_size: u32,
}

fn volume_descriptor(d: &Descriptor<'_>, now: &DateTime<Utc>) -> [u8; SECTOR_SIZE] {
    let mut s = [0u8; SECTOR_SIZE];
    s[0] = if d.joliet { 2 } else { 1 };
    s[1..6].copy_from_slice(STANDARD_ID);
    s[6] = 1;

    let fill: fn(&mut [u8], usize, usize, &str) = if d.joliet { fill_ucs2 } else { fill_ascii };
    fill(&mut s, 8, 32, "");
    fill(&mut s, 40, 32, d.volume_label);

    put_u32_both(&mut s, 80, d.total_sectors);
    if d.joliet {
        s[88..91].copy_from_slice(JOLIET_ESCAPE);
    }
    put_u16_both(&mut s, 120, 1);
    put_u16_both(&mut s, 124, 1);
    put_u16_both(&mut s, 128, SECTOR_SIZE as u16);
    put_u32_both(&mut s, 132, PATH_TABLE_SIZE);
    s[140..144].copy_from_slice(&d.path_table_l.to_le_bytes());
    s[148..152].copy_from_slice(&d.path_table_m.to_be_bytes());

    let root = directory_record(d.root_lba, d.root_size, FLAG_DIRECTORY, &[0x00], &record_date(now));
    s[156..156 + ROOT_RECORD_LEN].copy_from_slice(&root);

    fill(&mut s, 190, 128, "");
    fill(&mut s, 318, 128, "");
    fill(&mut s, 446, 128, "");
    fill(&mut s, 574, 128, APPLICATION_ID);
    fill(&mut s, 702, 37, "");
    fill(&mut s, 739, 37, "");
    fill(&mut s, 776, 37, "");

    let created = volume_date(now);
    s[813..830].copy_from_slice(&created);
    s[830..847].copy_from_slice(&created);
    s[847..864].copy_from_slice(&unset_volume_date());
    s[864..881].copy_from_slice(&unset_volume_date());
    s[881] = 1;
    s
}

fn terminator() -> [u8; SECTOR_SIZE] {
    let mut s = [0u8; SECTOR_SIZE];
    s[0] = 255;
    s[1..6].copy_from_slice(STANDARD_ID);
    s[6] = 1;
    s
}

/// Write `plan` as an ISO9660 + Joliet image at `output`.
///
/// On any failure the partially written file is removed.
pub fn build_image(plan: &DiscPlan, output: &Path) -> Result<FinalizedImage> {
    info!(
        "Authoring disc image: {} ({} files, volume {})",
        output.display(),
        plan.entries.len(),
        plan.volume_label
    );

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut guard = PartialImage {
        path: output,
        armed: true,
    };

    let size = write_image(plan, output).map_err(|e| match e {
        Error::ImageBuild(_) => e,
        other => Error::image(other.to_string()),
    })?;

    guard.armed = false;
    info!("Disc image finalized: {} bytes", size);

    Ok(FinalizedImage {
        path: output.to_path_buf(),
        size,
        volume_label: plan.volume_label.clone(),
        file_count: plan.entries.len(),
        removed: false,
    })
}

fn write_image(plan: &DiscPlan, output: &Path) -> Result<u64> {
    let layout = Layout::compute(plan)?;
    let now = Utc::now();
    let date = record_date(&now);

    let records = |order: &[usize], ids: &[Vec<u8>]| -> Vec<Vec<u8>> {
        order
            .iter()
            .map(|&i| {
                let file = &layout.files[i];
                directory_record(file.lba, file.size, 0, &ids[i], &date)
            })
            .collect()
    };
    let pvd_records = records(&layout.pvd_order, &layout.pvd_ids);
    let joliet_records = records(&layout.joliet_order, &layout.joliet_ids);

    let file = File::create(output)?;
    let mut out = BufWriter::new(file);

    out.write_all(&vec![0u8; SYSTEM_AREA_SECTORS as usize * SECTOR_SIZE])?;
    out.write_all(&volume_descriptor(
        &Descriptor {
            joliet: false,
            volume_label: &plan.volume_label,
            total_sectors: layout.total_sectors,
            path_table_l: PATH_TABLE_PVD_L,
            path_table_m: PATH_TABLE_PVD_M,
            root_lba: layout.pvd_root_lba,
            root_size: layout.pvd_root_size,
        },
        &now,
    ))?;
    out.write_all(&volume_descriptor(
        &Descriptor {
            joliet: true,
            volume_label: &plan.volume_label,
            total_sectors: layout.total_sectors,
            path_table_l: PATH_TABLE_JOLIET_L,
            path_table_m: PATH_TABLE_JOLIET_M,
            root_lba: layout.joliet_root_lba,
            root_size: layout.joliet_root_size,
        },
        &now,
    ))?;
    out.write_all(&terminator())?;

    out.write_all(&path_table(layout.pvd_root_lba, false))?;
    out.write_all(&path_table(layout.pvd_root_lba, true))?;
    out.write_all(&path_table(layout.joliet_root_lba, false))?;
    out.write_all(&path_table(layout.joliet_root_lba, true))?;

    out.write_all(&pack_directory(
        layout.pvd_root_lba,
        layout.pvd_root_size,
        pvd_records,
        &date,
    )?)?;
    out.write_all(&pack_directory(
        layout.joliet_root_lba,
        layout.joliet_root_size,
        joliet_records,
        &date,
    )?)?;

    for extent in &layout.files {
        debug!(
            "Writing {} at sector {} ({} bytes)",
            extent.entry.source.display(),
            extent.lba,
            extent.size
        );
        let source = File::open(&extent.entry.source).map_err(|e| {
            Error::image(format!("cannot read {}: {}", extent.entry.source.display(), e))
        })?;
        let copied = std::io::copy(&mut source.take(extent.size as u64 + 1), &mut out)?;
        if copied != extent.size as u64 {
            return Err(Error::image(format!(
                "{} changed size during authoring ({} bytes planned, {} read)",
                extent.entry.source.display(),
                extent.size,
                copied
            )));
        }
        let allotted = sectors_for(extent.size as u64).max(1) * SECTOR_SIZE as u64;
        let padding = (allotted - extent.size as u64) as usize;
        if padding != 0 {
            out.write_all(&vec![0u8; padding])?;
        }
    }

    let file = out
        .into_inner()
        .map_err(|e| Error::image(format!("flush failed: {}", e.error())))?;
    file.sync_all()?;
    let size = file.metadata()?.len();
    drop(file);

    let expected = layout.total_sectors as u64 * SECTOR_SIZE as u64;
    if size != expected {
        return Err(Error::image(format!(
            "image size {} does not match layout size {}",
            size, expected
        )));
    }
    Ok(size)
}

/// One file as seen when reading an image back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    /// Primary name without the `;1` version suffix.
    pub short_name: String,
    pub long_name: Option<String>,
    pub lba: u32,
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct ImageListing {
    pub volume_label: String,
    pub volume_sectors: u32,
    pub joliet: bool,
    /// Files ordered by extent location.
    pub entries: Vec<ListedEntry>,
}

struct RawRecord {
    lba: u32,
    size: u32,
    flags: u8,
    identifier: Vec<u8>,
}

fn read_sector(file: &mut File, lba: u32) -> Result<[u8; SECTOR_SIZE]> {
    let mut sector = [0u8; SECTOR_SIZE];
    file.seek(SeekFrom::Start(lba as u64 * SECTOR_SIZE as u64))?;
    file.read_exact(&mut sector)?;
    Ok(sector)
}

fn le_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_directory(file: &mut File, lba: u32, size: u32) -> Result<Vec<RawRecord>> {
    let mut records = Vec::new();
    let sectors = sectors_for(size as u64) as u32;
    for i in 0..sectors {
        let sector = read_sector(file, lba + i)?;
        let mut pos = 0;
        while pos < SECTOR_SIZE {
            let len = sector[pos] as usize;
            if len == 0 {
                break;
            }
            if len < 34 || pos + len > SECTOR_SIZE {
                return Err(Error::image(format!("malformed directory record at sector {}", lba + i)));
            }
            let rec = &sector[pos..pos + len];
            let id_len = rec[32] as usize;
            if 33 + id_len > len {
                return Err(Error::image("directory identifier overruns its record"));
            }
            records.push(RawRecord {
                lba: le_u32(rec, 2),
                size: le_u32(rec, 10),
                flags: rec[25],
                identifier: rec[33..33 + id_len].to_vec(),
            });
            pos += len;
        }
    }
    Ok(records
        .into_iter()
        .filter(|r| !(r.identifier == [0x00] || r.identifier == [0x01]))
        .collect())
}

fn trim_padding(text: &str) -> String {
    text.trim_end_matches([' ', '\0']).to_string()
}

fn strip_version(name: &str) -> String {
    let name = name.split(';').next().unwrap_or(name);
    name.strip_suffix('.').unwrap_or(name).to_string()
}

fn decode_ucs2(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Read the root directories of an ISO9660 image, pairing primary and
/// Joliet names by extent.
pub fn read_listing(path: &Path) -> Result<ImageListing> {
    let mut file = File::open(path)?;

    let mut primary: Option<[u8; SECTOR_SIZE]> = None;
    let mut joliet: Option<[u8; SECTOR_SIZE]> = None;

    for lba in PVD_SECTOR.. {
        let sector = read_sector(&mut file, lba)?;
        if &sector[1..6] != STANDARD_ID {
            return Err(Error::image(format!(
                "{} is not an ISO9660 image",
                path.display()
            )));
        }
        match sector[0] {
            1 => primary = Some(sector),
            2 if matches!(&sector[88..91], b"%/@" | b"%/C" | b"%/E") => joliet = Some(sector),
            255 => break,
            _ => {}
        }
        if lba > PVD_SECTOR + 32 {
            return Err(Error::image("volume descriptor set is not terminated"));
        }
    }

    let primary = primary.ok_or_else(|| Error::image("missing primary volume descriptor"))?;
    let volume_label = trim_padding(&String::from_utf8_lossy(&primary[40..72]));
    let volume_sectors = le_u32(&primary, 80);

    let pvd_root = &primary[156..156 + ROOT_RECORD_LEN];
    let mut entries: Vec<ListedEntry> = read_directory(&mut file, le_u32(pvd_root, 2), le_u32(pvd_root, 10))?
        .into_iter()
        .filter(|r| r.flags & FLAG_DIRECTORY == 0)
        .map(|r| ListedEntry {
            short_name: strip_version(&String::from_utf8_lossy(&r.identifier)),
            long_name: None,
            lba: r.lba,
            size: r.size,
        })
        .collect();

    if let Some(svd) = &joliet {
        let root = &svd[156..156 + ROOT_RECORD_LEN];
        for record in read_directory(&mut file, le_u32(root, 2), le_u32(root, 10))? {
            if record.flags & FLAG_DIRECTORY != 0 {
                continue;
            }
            let name = strip_version(&decode_ucs2(&record.identifier));
            if let Some(entry) = entries.iter_mut().find(|e| e.lba == record.lba && e.long_name.is_none()) {
                entry.long_name = Some(name);
            }
        }
    }

    entries.sort_by_key(|e| e.lba);

    Ok(ImageListing {
        volume_label,
        volume_sectors,
        joliet: joliet.is_some(),
        entries,
    })
}
