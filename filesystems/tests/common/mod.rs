// Disk images for the integration tests, laid out byte by byte so the tests
// need no host mkfs tools and no privileges.
#![allow(dead_code)]

use std::fs;
use std::io::{Seek, SeekFrom, Write};
use tempfile::NamedTempFile;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A sparse image: its length plus the byte ranges that are not zero.
/// Later writes win where ranges overlap.
pub struct Image {
    len: u64,
    patches: Vec<(u64, Vec<u8>)>,
}

impl Image {
    pub fn new(len: u64) -> Self {
        Self {
            len,
            patches: Vec::new(),
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn write(&mut self, offset: u64, bytes: &[u8]) {
        assert!(offset + bytes.len() as u64 <= self.len, "write past image end at {:#x}", offset);
        self.patches.push((offset, bytes.to_vec()));
    }

    /// Place another image (a partition) at `offset`.
    pub fn embed(&mut self, offset: u64, inner: Image) {
        assert!(offset + inner.len <= self.len);
        for (at, bytes) in inner.patches {
            self.patches.push((offset + at, bytes));
        }
    }

    pub fn into_file(self) -> NamedTempFile {
        let tmp = NamedTempFile::new().unwrap();
        let mut file = tmp.reopen().unwrap();
        file.set_len(self.len).unwrap();
        for (offset, bytes) in &self.patches {
            file.seek(SeekFrom::Start(*offset)).unwrap();
            file.write_all(bytes).unwrap();
        }
        file.flush().unwrap();
        tmp
    }
}

pub fn locator(tmp: &NamedTempFile) -> String {
    tmp.path().to_str().unwrap().to_string()
}

pub fn file_bytes(tmp: &NamedTempFile) -> Vec<u8> {
    fs::read(tmp.path()).unwrap()
}

fn put_u16(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

fn utf16(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

/// Deterministic file content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

// ---------------------------------------------------------------------------
// FAT12/16/32

pub const FAT_ATTR_VOLUME_ID: u8 = 0x08;
pub const FAT_ATTR_DIRECTORY: u8 = 0x10;
pub const FAT_ATTR_ARCHIVE: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatKind {
    Fat12,
    Fat16,
    Fat32,
}

pub struct FatBuilder {
    kind: FatKind,
    sectors_per_cluster: u8,
    reserved: u16,
    fats: u8,
    root_entries: u16,
    total_sectors: u32,
    fat_size: u32,
    media: u8,
    volume_id: u32,
    bpb_label: [u8; 11],
    fat: Vec<u32>,
    next_cluster: u32,
    root_cluster: u32,
    image: Image,
}

impl FatBuilder {
    fn new(kind: FatKind, spc: u8, reserved: u16, root_entries: u16, total: u32, fat_size: u32, media: u8) -> Self {
        let eoc = match kind {
            FatKind::Fat12 => 0xFFF,
            FatKind::Fat16 => 0xFFFF,
            FatKind::Fat32 => 0x0FFF_FFFF,
        };
        Self {
            kind,
            sectors_per_cluster: spc,
            reserved,
            fats: 2,
            root_entries,
            total_sectors: total,
            fat_size,
            media,
            volume_id: 0x1234_5678,
            bpb_label: *b"NO NAME    ",
            fat: vec![(eoc & !0xFF) | media as u32, eoc],
            next_cluster: 2,
            root_cluster: 0,
            image: Image::new(total as u64 * 512),
        }
    }

    /// 1.44 MB floppy layout: 512-byte clusters, 224 root entries.
    pub fn fat12() -> Self {
        Self::new(FatKind::Fat12, 1, 1, 224, 2880, 9, 0xF0)
    }

    /// 16 MiB, 2 KiB clusters.
    pub fn fat16() -> Self {
        Self::new(FatKind::Fat16, 4, 4, 512, 32768, 32, 0xF8)
    }

    /// 100 MiB, 512-byte clusters (enough clusters to be FAT32).
    pub fn fat32() -> Self {
        Self::new(FatKind::Fat32, 1, 32, 0, 204800, 1600, 0xF8)
    }

    /// 100 MiB, 4 KiB clusters: FAT32 layout with a FAT16-range cluster
    /// count, as `mkfs.fat -F 32 -s 8` writes it.
    pub fn small_fat32() -> Self {
        Self::new(FatKind::Fat32, 8, 32, 0, 204800, 200, 0xF8)
    }

    pub fn bpb_label(mut self, label: &[u8; 11]) -> Self {
        self.bpb_label = *label;
        self
    }

    pub fn cluster_size(&self) -> usize {
        self.sectors_per_cluster as usize * 512
    }

    fn root_dir_offset(&self) -> u64 {
        (self.reserved as u64 + self.fats as u64 * self.fat_size as u64) * 512
    }

    fn data_offset(&self) -> u64 {
        self.root_dir_offset() + (self.root_entries as u64 * 32).div_ceil(512) * 512
    }

    pub fn cluster_count(&self) -> u64 {
        (self.total_sectors as u64 - self.data_offset() / 512) / self.sectors_per_cluster as u64
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset() + (cluster as u64 - 2) * self.cluster_size() as u64
    }

    fn eoc(&self) -> u32 {
        self.fat[1]
    }

    fn set_fat(&mut self, cluster: u32, value: u32) {
        let index = cluster as usize;
        if self.fat.len() <= index {
            self.fat.resize(index + 1, 0);
        }
        self.fat[index] = value;
    }

    /// Allocate `count` linked clusters, leaving `gap` free clusters between
    /// neighbours so the chain is fragmented.
    pub fn alloc(&mut self, count: usize, gap: u32) -> Vec<u32> {
        let mut chain = Vec::with_capacity(count);
        for i in 0..count {
            if i > 0 {
                self.next_cluster += gap;
            }
            chain.push(self.next_cluster);
            self.next_cluster += 1;
        }
        for pair in chain.windows(2) {
            self.set_fat(pair[0], pair[1]);
        }
        if let Some(&last) = chain.last() {
            let eoc = self.eoc();
            self.set_fat(last, eoc);
        }
        chain
    }

    fn write_chain(&mut self, chain: &[u32], data: &[u8]) {
        let cs = self.cluster_size();
        for (i, &cluster) in chain.iter().enumerate() {
            let start = i * cs;
            if start >= data.len() {
                break;
            }
            let end = (start + cs).min(data.len());
            let offset = self.cluster_offset(cluster);
            self.image.write(offset, &data[start..end]);
        }
    }

    /// Store file content; returns the first cluster (0 for empty files).
    pub fn add_file(&mut self, data: &[u8], gap: u32) -> u32 {
        if data.is_empty() {
            return 0;
        }
        let chain = self.alloc(data.len().div_ceil(self.cluster_size()), gap);
        self.write_chain(&chain, data);
        chain[0]
    }

    /// Allocate a directory's clusters without content yet.
    pub fn reserve_dir(&mut self, entries: usize) -> Vec<u32> {
        let clusters = (entries * 32).div_ceil(self.cluster_size()).max(1);
        self.alloc(clusters, 0)
    }

    pub fn write_dir(&mut self, chain: &[u32], entries: &[[u8; 32]]) {
        let data: Vec<u8> = entries.iter().flatten().copied().collect();
        self.write_chain(chain, &data);
    }

    pub fn set_root(&mut self, entries: &[[u8; 32]]) {
        match self.kind {
            FatKind::Fat32 => {
                let chain = self.reserve_dir(entries.len());
                self.root_cluster = chain[0];
                self.write_dir(&chain, entries);
            }
            _ => {
                assert!(entries.len() <= self.root_entries as usize);
                let data: Vec<u8> = entries.iter().flatten().copied().collect();
                let offset = self.root_dir_offset();
                self.image.write(offset, &data);
            }
        }
    }

    fn used_clusters(&self) -> u64 {
        self.fat.iter().skip(2).filter(|&&v| v != 0).count() as u64
    }

    pub fn expected_free(&self) -> u64 {
        self.cluster_count() - self.used_clusters()
    }

    fn encode_fat(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.fat_size as usize * 512];
        for (n, &value) in self.fat.iter().enumerate() {
            match self.kind {
                FatKind::Fat12 => {
                    let at = n + n / 2;
                    let v = value & 0xFFF;
                    if n % 2 == 0 {
                        buf[at] = v as u8;
                        buf[at + 1] = (buf[at + 1] & 0xF0) | (v >> 8) as u8;
                    } else {
                        buf[at] = (buf[at] & 0x0F) | ((v << 4) & 0xF0) as u8;
                        buf[at + 1] = (v >> 4) as u8;
                    }
                }
                FatKind::Fat16 => put_u16(&mut buf, n * 2, value as u16),
                FatKind::Fat32 => put_u32(&mut buf, n * 4, value),
            }
        }
        buf
    }

    fn boot_sector(&self) -> Vec<u8> {
        let mut b = vec![0u8; 512];
        let fat32 = self.kind == FatKind::Fat32;
        b[0..3].copy_from_slice(&[0xEB, if fat32 { 0x58 } else { 0x3C }, 0x90]);
        b[3..11].copy_from_slice(b"MSWIN4.1");
        put_u16(&mut b, 11, 512);
        b[13] = self.sectors_per_cluster;
        put_u16(&mut b, 14, self.reserved);
        b[16] = self.fats;
        put_u16(&mut b, 17, self.root_entries);
        if !fat32 && self.total_sectors < 0x10000 {
            put_u16(&mut b, 19, self.total_sectors as u16);
        } else {
            put_u32(&mut b, 32, self.total_sectors);
        }
        b[21] = self.media;
        put_u16(&mut b, 24, 63);
        put_u16(&mut b, 26, 255);
        let ext = if fat32 {
            put_u32(&mut b, 36, self.fat_size);
            put_u32(&mut b, 44, self.root_cluster);
            put_u16(&mut b, 48, 1);
            put_u16(&mut b, 50, 6);
            64
        } else {
            put_u16(&mut b, 22, self.fat_size as u16);
            36
        };
        b[ext] = 0x80;
        b[ext + 2] = 0x29;
        put_u32(&mut b, ext + 3, self.volume_id);
        b[ext + 7..ext + 18].copy_from_slice(&self.bpb_label);
        let fs_name: &[u8; 8] = match self.kind {
            FatKind::Fat12 => b"FAT12   ",
            FatKind::Fat16 => b"FAT16   ",
            FatKind::Fat32 => b"FAT32   ",
        };
        b[ext + 18..ext + 26].copy_from_slice(fs_name);
        b[510] = 0x55;
        b[511] = 0xAA;
        b
    }

    pub fn finish(mut self) -> Image {
        let boot = self.boot_sector();
        self.image.write(0, &boot);
        if self.kind == FatKind::Fat32 {
            let mut info = vec![0u8; 512];
            put_u32(&mut info, 0, 0x4161_5252);
            put_u32(&mut info, 484, 0x6141_7272);
            put_u32(&mut info, 488, self.expected_free() as u32);
            put_u32(&mut info, 492, self.next_cluster);
            put_u32(&mut info, 508, 0xAA55_0000);
            self.image.write(512, &info);
            self.image.write(6 * 512, &boot);
        }
        let fat = self.encode_fat();
        for copy in 0..self.fats as u64 {
            let offset = (self.reserved as u64 + copy * self.fat_size as u64) * 512;
            self.image.write(offset, &fat);
        }
        self.image
    }
}

pub fn fat_short_entry(name83: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; 32] {
    let mut e = [0u8; 32];
    e[0..11].copy_from_slice(name83);
    e[11] = attr;
    put_u16(&mut e, 20, (cluster >> 16) as u16);
    put_u16(&mut e, 26, cluster as u16);
    put_u32(&mut e, 28, size);
    e
}

pub fn fat_label_entry(label: &[u8; 11]) -> [u8; 32] {
    fat_short_entry(label, FAT_ATTR_VOLUME_ID, 0, 0)
}

pub fn fat_dot_entries(own: u32, parent: u32) -> Vec<[u8; 32]> {
    vec![
        fat_short_entry(b".          ", FAT_ATTR_DIRECTORY, own, 0),
        fat_short_entry(b"..         ", FAT_ATTR_DIRECTORY, parent, 0),
    ]
}

fn fat_checksum(name83: &[u8; 11]) -> u8 {
    name83.iter().fold(0u8, |sum, &b| sum.rotate_right(1).wrapping_add(b))
}

/// LFN fragments followed by the 8.3 entry, in on-disk order.
pub fn fat_long_entry(long: &str, name83: &[u8; 11], attr: u8, cluster: u32, size: u32) -> Vec<[u8; 32]> {
    let mut units: Vec<u16> = long.encode_utf16().collect();
    if units.len() % 13 != 0 {
        units.push(0);
    }
    while units.len() % 13 != 0 {
        units.push(0xFFFF);
    }
    let checksum = fat_checksum(name83);
    let count = units.len() / 13;
    let mut out = Vec::new();
    for ordinal in (1..=count).rev() {
        let chunk = &units[(ordinal - 1) * 13..ordinal * 13];
        let mut e = [0u8; 32];
        e[0] = ordinal as u8 | if ordinal == count { 0x40 } else { 0 };
        e[11] = 0x0F;
        e[13] = checksum;
        let offsets = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
        for (unit, &at) in chunk.iter().zip(offsets.iter()) {
            put_u16(&mut e, at, *unit);
        }
        out.push(e);
    }
    out.push(fat_short_entry(name83, attr, cluster, size));
    out
}

pub const FAT_README: &[u8] = b"Hello from FAT\n";
pub const FAT_NOTES: &[u8] = b"meeting notes\n";
pub const FAT_LONG_NAME: &str = "Long File Name.txt";

/// Standard tree used for every FAT variant:
///
/// ```text
/// TESTVOL (label)
/// README.TXT
/// Long File Name.txt   (fragmented chain, 3.5 clusters)
/// lower.txt            (8.3 name with NT lowercase flags)
/// DOCS/NOTES.TXT
/// DOCS/Deleted entry (0xE5, hidden)
/// MANY/FILE00.TXT .. FILE24.TXT (empty files)
/// ```
pub fn fat_image(mut b: FatBuilder) -> Image {
    let cs = b.cluster_size();
    let readme = b.add_file(FAT_README, 0);
    let long_data = pattern(cs * 3 + cs / 2, 7);
    let long = b.add_file(&long_data, 1);
    let lower = b.add_file(b"lowercase", 0);
    let notes = b.add_file(FAT_NOTES, 0);

    let docs = b.reserve_dir(6);
    let mut docs_entries = fat_dot_entries(docs[0], 0);
    let mut deleted = fat_short_entry(b"OLD     TXT", FAT_ATTR_ARCHIVE, 0, 0);
    deleted[0] = 0xE5;
    docs_entries.push(deleted);
    docs_entries.push(fat_short_entry(b"NOTES   TXT", FAT_ATTR_ARCHIVE, notes, FAT_NOTES.len() as u32));
    b.write_dir(&docs, &docs_entries);

    let many = b.reserve_dir(27);
    let mut many_entries = fat_dot_entries(many[0], 0);
    for i in 0..25 {
        let name = format!("FILE{:02}  TXT", i);
        let mut raw = [0u8; 11];
        raw.copy_from_slice(name.as_bytes());
        many_entries.push(fat_short_entry(&raw, FAT_ATTR_ARCHIVE, 0, 0));
    }
    b.write_dir(&many, &many_entries);

    let mut root = vec![fat_label_entry(b"TESTVOL    ")];
    root.push(fat_short_entry(b"README  TXT", FAT_ATTR_ARCHIVE, readme, FAT_README.len() as u32));
    root.extend(fat_long_entry(
        FAT_LONG_NAME,
        b"LONGFI~1TXT",
        FAT_ATTR_ARCHIVE,
        long,
        long_data.len() as u32,
    ));
    let mut lower_entry = fat_short_entry(b"LOWER   TXT", FAT_ATTR_ARCHIVE, lower, 9);
    lower_entry[12] = 0x18;
    root.push(lower_entry);
    root.push(fat_short_entry(b"DOCS       ", FAT_ATTR_DIRECTORY, docs[0], 0));
    root.push(fat_short_entry(b"MANY       ", FAT_ATTR_DIRECTORY, many[0], 0));
    b.set_root(&root);
    b.finish()
}

/// Content of "Long File Name.txt" for a builder's cluster size.
pub fn fat_long_content(cluster_size: usize) -> Vec<u8> {
    pattern(cluster_size * 3 + cluster_size / 2, 7)
}

// ---------------------------------------------------------------------------
// exFAT

pub const EXFAT_HELLO: &[u8] = b"Hello from exFAT\n";
pub const EXFAT_LONG_NAME: &str = "A long exFAT file name that needs several name entries.txt";
const EXFAT_HEAP: u64 = 256 * 512;
const EXFAT_CLUSTER: u64 = 4096;
const EXFAT_CLUSTERS: u32 = 16352;

fn exfat_cluster(cluster: u32) -> u64 {
    EXFAT_HEAP + (cluster as u64 - 2) * EXFAT_CLUSTER
}

fn exfat_file_set(name: &str, attributes: u16, first_cluster: u32, valid: u64, size: u64, contiguous: bool) -> Vec<[u8; 32]> {
    let units: Vec<u16> = name.encode_utf16().collect();
    let name_entries = units.len().div_ceil(15);
    let mut file = [0u8; 32];
    file[0] = 0x85;
    file[1] = 1 + name_entries as u8;
    put_u16(&mut file, 4, attributes);

    let mut stream = [0u8; 32];
    stream[0] = 0xC0;
    stream[1] = 0x01 | if contiguous { 0x02 } else { 0 };
    stream[3] = units.len() as u8;
    put_u64(&mut stream, 8, valid);
    put_u32(&mut stream, 20, first_cluster);
    put_u64(&mut stream, 24, size);

    let mut set = vec![file, stream];
    for chunk in units.chunks(15) {
        let mut n = [0u8; 32];
        n[0] = 0xC1;
        for (i, u) in chunk.iter().enumerate() {
            put_u16(&mut n, 2 + i * 2, *u);
        }
        set.push(n);
    }
    set
}

/// 64 MiB exFAT volume "EXFATVOL":
///
/// ```text
/// hello.txt      contiguous, cluster 5
/// Docs/inner.txt Docs chained at 6, inner.txt contiguous at 8
/// frag.bin       FAT chain 7 -> 9, 6000 bytes
/// partial.bin    4096 bytes allocated, 4 valid
/// <long name>    contiguous at 11
/// gone.txt       deleted set (hidden)
/// ```
pub fn exfat_image() -> Image {
    let mut img = Image::new(131072 * 512);

    let mut b = vec![0u8; 512];
    b[0..3].copy_from_slice(&[0xEB, 0x76, 0x90]);
    b[3..11].copy_from_slice(b"EXFAT   ");
    put_u64(&mut b, 72, 131072);
    put_u32(&mut b, 80, 128);
    put_u32(&mut b, 84, 128);
    put_u32(&mut b, 88, 256);
    put_u32(&mut b, 92, EXFAT_CLUSTERS);
    put_u32(&mut b, 96, 4);
    put_u32(&mut b, 100, 0xCAFE_F00D);
    put_u16(&mut b, 104, 0x0100);
    b[108] = 9;
    b[109] = 3;
    b[110] = 1;
    b[112] = 1;
    b[510] = 0x55;
    b[511] = 0xAA;
    img.write(0, &b);

    // FAT: bitmap(2), upcase(3), root(4), Docs(6) are single clusters,
    // frag.bin runs 7 -> 9. Contiguous streams leave their entries at 0.
    let mut fat = vec![0u8; 12 * 4];
    put_u32(&mut fat, 0, 0xFFFF_FFF8);
    put_u32(&mut fat, 4, 0xFFFF_FFFF);
    for cluster in [2usize, 3, 4, 6, 9] {
        put_u32(&mut fat, cluster * 4, 0xFFFF_FFFF);
    }
    put_u32(&mut fat, 7 * 4, 9);
    img.write(128 * 512, &fat);

    // Clusters 2..=11 are allocated.
    img.write(exfat_cluster(2), &[0xFF, 0x03]);

    let mut root: Vec<[u8; 32]> = Vec::new();
    let mut label = [0u8; 32];
    label[0] = 0x83;
    label[1] = 8;
    label[2..18].copy_from_slice(&utf16("EXFATVOL"));
    root.push(label);
    let mut bitmap = [0u8; 32];
    bitmap[0] = 0x81;
    put_u32(&mut bitmap, 20, 2);
    put_u64(&mut bitmap, 24, (EXFAT_CLUSTERS as u64).div_ceil(8));
    root.push(bitmap);
    let mut upcase = [0u8; 32];
    upcase[0] = 0x82;
    put_u32(&mut upcase, 20, 3);
    put_u64(&mut upcase, 24, 128);
    root.push(upcase);

    let hello_len = EXFAT_HELLO.len() as u64;
    root.extend(exfat_file_set("hello.txt", 0x20, 5, hello_len, hello_len, true));
    root.extend(exfat_file_set("Docs", 0x10, 6, 4096, 4096, false));
    let mut gone = exfat_file_set("gone.txt", 0x20, 10, 4, 4, true);
    for e in gone.iter_mut() {
        e[0] &= 0x7F;
    }
    root.extend(gone);
    root.extend(exfat_file_set("frag.bin", 0x20, 7, 6000, 6000, false));
    root.extend(exfat_file_set("partial.bin", 0x20, 10, 4, 4096, true));
    root.extend(exfat_file_set(EXFAT_LONG_NAME, 0x20, 11, 4, 4, true));
    let root_bytes: Vec<u8> = root.iter().flatten().copied().collect();
    img.write(exfat_cluster(4), &root_bytes);

    img.write(exfat_cluster(5), EXFAT_HELLO);

    let docs: Vec<u8> = exfat_file_set("inner.txt", 0x20, 8, 6, 6, true)
        .iter()
        .flatten()
        .copied()
        .collect();
    img.write(exfat_cluster(6), &docs);
    img.write(exfat_cluster(8), b"inside");

    img.write(exfat_cluster(7), &vec![b'x'; 4096]);
    img.write(exfat_cluster(9), &vec![b'y'; 1904]);
    // Stale bytes past the valid length must not leak into previews.
    let mut partial = vec![b'Z'; 4096];
    partial[..4].copy_from_slice(b"abcd");
    img.write(exfat_cluster(10), &partial);
    img.write(exfat_cluster(11), b"long");
    img
}

pub const EXFAT_FREE_CLUSTERS: u64 = EXFAT_CLUSTERS as u64 - 10;

// ---------------------------------------------------------------------------
// ext2/3/4

pub const EXT_HELLO: &[u8] = b"Hello, ext4!\n";
const EXT_BLOCK: u64 = 4096;
const EXT_BLOCKS: u32 = 2048;
const EXT_INODES: u32 = 128;
const EXT_INODE_SIZE: u64 = 256;
const EXT_INODE_TABLE: u64 = 5;

const INCOMPAT_FILETYPE: u32 = 0x0002;
const INCOMPAT_EXTENTS: u32 = 0x0040;
const EXTENTS_FL: u32 = 0x0008_0000;

pub const FT_REG: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_SYMLINK: u8 = 7;

pub struct ExtBuilder {
    image: Image,
    extents: bool,
    journal: bool,
    label: String,
    next_block: u32,
    inodes_used: u32,
}

impl ExtBuilder {
    pub fn ext4() -> Self {
        Self::new(true, false)
    }

    pub fn ext2() -> Self {
        Self::new(false, false)
    }

    pub fn ext3() -> Self {
        Self::new(false, true)
    }

    fn new(extents: bool, journal: bool) -> Self {
        Self {
            image: Image::new(EXT_BLOCKS as u64 * EXT_BLOCK),
            extents,
            journal,
            label: "rawdisk".to_string(),
            next_block: 32,
            inodes_used: 11,
        }
    }

    fn alloc(&mut self, count: u32) -> u32 {
        let first = self.next_block;
        self.next_block += count;
        assert!(self.next_block < EXT_BLOCKS);
        first
    }

    fn write_inode(&mut self, ino: u32, mode: u16, size: u64, flags: u32, block: &[u8; 60]) {
        let mut raw = vec![0u8; EXT_INODE_SIZE as usize];
        put_u16(&mut raw, 0x00, mode);
        put_u32(&mut raw, 0x04, size as u32);
        put_u16(&mut raw, 0x1A, 1);
        put_u32(&mut raw, 0x20, flags);
        raw[0x28..0x28 + 60].copy_from_slice(block);
        put_u32(&mut raw, 0x6C, (size >> 32) as u32);
        let offset = EXT_INODE_TABLE * EXT_BLOCK + (ino as u64 - 1) * EXT_INODE_SIZE;
        self.image.write(offset, &raw);
        self.inodes_used = self.inodes_used.max(ino);
    }

    fn extent_root(first: u32, count: u32) -> [u8; 60] {
        let mut block = [0u8; 60];
        put_u16(&mut block, 0, 0xF30A);
        put_u16(&mut block, 2, 1);
        put_u16(&mut block, 4, 4);
        put_u32(&mut block, 12, 0);
        put_u16(&mut block, 16, count as u16);
        put_u32(&mut block, 20, first);
        block
    }

    /// Lay `data` out in fresh blocks and write the inode mapping them.
    fn store(&mut self, ino: u32, mode: u16, data: &[u8], use_extents: bool) {
        let count = (data.len() as u64).div_ceil(EXT_BLOCK).max(1) as u32;
        if use_extents {
            let first = self.alloc(count);
            self.image.write(first as u64 * EXT_BLOCK, data);
            let root = Self::extent_root(first, count);
            self.write_inode(ino, mode, data.len() as u64, EXTENTS_FL, &root);
            return;
        }
        assert!(count <= 12 + 1024);
        let mut pointers = [0u8; 60];
        let mut indirect = Vec::new();
        for i in 0..count {
            let block = self.alloc(1);
            let start = (i as u64 * EXT_BLOCK) as usize;
            let end = (start + EXT_BLOCK as usize).min(data.len());
            if start < end {
                self.image.write(block as u64 * EXT_BLOCK, &data[start..end]);
            }
            if i < 12 {
                put_u32(&mut pointers, i as usize * 4, block);
            } else {
                indirect.extend_from_slice(&block.to_le_bytes());
            }
        }
        if !indirect.is_empty() {
            let table = self.alloc(1);
            self.image.write(table as u64 * EXT_BLOCK, &indirect);
            put_u32(&mut pointers, 48, table);
        }
        self.write_inode(ino, mode, data.len() as u64, 0, &pointers);
    }

    pub fn file(&mut self, ino: u32, data: &[u8]) {
        let extents = self.extents;
        self.store(ino, 0x81A4, data, extents);
    }

    /// A file whose single extent claims to start at `physical`, with no
    /// data written anywhere.
    pub fn file_at(&mut self, ino: u32, physical: u64, size: u64) {
        let count = size.div_ceil(EXT_BLOCK).max(1) as u32;
        let mut root = Self::extent_root(physical as u32, count);
        put_u16(&mut root, 18, (physical >> 32) as u16);
        self.write_inode(ino, 0x81A4, size, EXTENTS_FL, &root);
    }

    /// A file mapped through classic direct and indirect block pointers,
    /// which ext4 still allows per inode.
    pub fn block_mapped_file(&mut self, ino: u32, data: &[u8]) {
        self.store(ino, 0x81A4, data, false);
    }

    pub fn symlink(&mut self, ino: u32, target: &str) {
        let mut block = [0u8; 60];
        block[..target.len()].copy_from_slice(target.as_bytes());
        self.write_inode(ino, 0xA1FF, target.len() as u64, 0, &block);
    }

    /// A one-block directory with "." and ".." followed by `entries`.
    pub fn dir(&mut self, ino: u32, parent: u32, entries: &[(&str, u32, u8)]) {
        let mut all = vec![(".", ino, FT_DIR), ("..", parent, FT_DIR)];
        all.extend_from_slice(entries);
        let mut data = vec![0u8; EXT_BLOCK as usize];
        let mut pos = 0usize;
        for (i, (name, inode, ftype)) in all.iter().enumerate() {
            let natural = (8 + name.len() + 3) & !3;
            let rec_len = if i + 1 == all.len() { EXT_BLOCK as usize - pos } else { natural };
            put_u32(&mut data, pos, *inode);
            put_u16(&mut data, pos + 4, rec_len as u16);
            data[pos + 6] = name.len() as u8;
            data[pos + 7] = *ftype;
            data[pos + 8..pos + 8 + name.len()].copy_from_slice(name.as_bytes());
            pos += rec_len;
        }
        let extents = self.extents;
        self.store(ino, 0x41ED, &data, extents);
    }

    pub fn superblock(&self) -> Vec<u8> {
        let mut sb = vec![0u8; 1024];
        put_u32(&mut sb, 0, EXT_INODES);
        put_u32(&mut sb, 4, EXT_BLOCKS);
        put_u32(&mut sb, 12, EXT_BLOCKS - self.next_block);
        put_u32(&mut sb, 16, EXT_INODES - self.inodes_used);
        put_u32(&mut sb, 20, 0);
        put_u32(&mut sb, 24, 2);
        put_u32(&mut sb, 32, 32768);
        put_u32(&mut sb, 40, EXT_INODES);
        put_u16(&mut sb, 56, 0xEF53);
        put_u16(&mut sb, 58, 1);
        put_u32(&mut sb, 76, 1);
        put_u32(&mut sb, 84, 11);
        put_u16(&mut sb, 88, EXT_INODE_SIZE as u16);
        put_u32(&mut sb, 92, if self.journal { 0x0004 } else { 0 });
        let incompat = INCOMPAT_FILETYPE | if self.extents { INCOMPAT_EXTENTS } else { 0 };
        put_u32(&mut sb, 96, incompat);
        put_u32(&mut sb, 100, 0x0003);
        sb[104..120].copy_from_slice(&[0x11; 16]);
        sb[120..120 + self.label.len()].copy_from_slice(self.label.as_bytes());
        sb
    }

    pub fn expected_free_blocks(&self) -> u64 {
        (EXT_BLOCKS - self.next_block) as u64
    }

    pub fn finish(mut self) -> Image {
        let sb = self.superblock();
        self.image.write(1024, &sb);
        let mut gdt = vec![0u8; 32];
        put_u32(&mut gdt, 0x00, 3);
        put_u32(&mut gdt, 0x04, 4);
        put_u32(&mut gdt, 0x08, EXT_INODE_TABLE as u32);
        self.image.write(EXT_BLOCK, &gdt);
        self.image
    }
}

/// Legacy file content: 14 blocks, so two land behind the indirect block.
pub fn ext_legacy_content() -> Vec<u8> {
    pattern(13 * EXT_BLOCK as usize + 100, 3)
}

/// Standard ext tree:
///
/// ```text
/// lost+found/
/// hello.txt
/// docs/nested.txt
/// legacy.bin   (block-mapped, single indirect)
/// link -> hello.txt
/// ```
pub fn ext_tree(mut b: ExtBuilder) -> (Image, u64) {
    b.dir(
        2,
        2,
        &[
            ("lost+found", 11, FT_DIR),
            ("hello.txt", 12, FT_REG),
            ("docs", 13, FT_DIR),
            ("legacy.bin", 14, FT_REG),
            ("link", 15, FT_SYMLINK),
        ],
    );
    b.dir(11, 2, &[]);
    b.file(12, EXT_HELLO);
    b.dir(13, 2, &[("nested.txt", 16, FT_REG)]);
    b.block_mapped_file(14, &ext_legacy_content());
    b.symlink(15, "hello.txt");
    b.file(16, b"nested file\n");
    let free = b.expected_free_blocks();
    (b.finish(), free)
}

// ---------------------------------------------------------------------------
// NTFS

pub const NTFS_HELLO: &[u8] = b"Hello from NTFS\n";
const NTFS_CLUSTER: u64 = 4096;
const NTFS_RECORD: usize = 1024;
const NTFS_MFT_LCN: u64 = 4;
const NTFS_TOTAL_SECTORS: u64 = 16383;
const NTFS_INDEX_LCN: u64 = 20;
const NTFS_BITMAP_LCN: u64 = 30;
const NTFS_BIG_LCNS: [u64; 2] = [40, 50];

const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_VOLUME_NAME: u32 = 0x60;
const ATTR_VOLUME_INFORMATION: u32 = 0x70;
const ATTR_DATA: u32 = 0x80;
const ATTR_INDEX_ROOT: u32 = 0x90;
const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
const ATTR_BITMAP: u32 = 0xB0;
const NTFS_MIRROR_LCN: u64 = 12;

const NS_POSIX: u8 = 0;
const NS_WIN32: u8 = 1;
const NS_DOS: u8 = 2;

/// One MFT record under construction.
pub struct NtfsRecord {
    flags: u16,
    sequence: u16,
    attrs: Vec<Vec<u8>>,
}

impl NtfsRecord {
    pub fn file() -> Self {
        Self { flags: 0x0001, sequence: 1, attrs: Vec::new() }
    }

    pub fn directory() -> Self {
        Self { flags: 0x0003, sequence: 1, attrs: Vec::new() }
    }

    /// A record released by its last owner.
    pub fn free() -> Self {
        Self { flags: 0, sequence: 2, attrs: Vec::new() }
    }

    pub fn sequence(mut self, sequence: u16) -> Self {
        self.sequence = sequence;
        self
    }

    fn header(type_code: u32, non_resident: bool, name: &str, body_len: usize, flags: u16) -> (Vec<u8>, usize) {
        let name_units = name.encode_utf16().count();
        let name_off = if non_resident { 64 } else { 24 };
        let body_off = (name_off + name_units * 2 + 7) & !7;
        let total = (body_off + body_len + 7) & !7;
        let mut a = vec![0u8; total];
        put_u32(&mut a, 0, type_code);
        put_u32(&mut a, 4, total as u32);
        a[8] = non_resident as u8;
        a[9] = name_units as u8;
        put_u16(&mut a, 10, name_off as u16);
        put_u16(&mut a, 12, flags);
        let encoded = utf16(name);
        a[name_off..name_off + encoded.len()].copy_from_slice(&encoded);
        (a, body_off)
    }

    pub fn resident(mut self, type_code: u32, name: &str, value: &[u8]) -> Self {
        let (mut a, off) = Self::header(type_code, false, name, value.len(), 0);
        put_u32(&mut a, 16, value.len() as u32);
        put_u16(&mut a, 20, off as u16);
        a[off..off + value.len()].copy_from_slice(value);
        self.attrs.push(a);
        self
    }

    pub fn non_resident(mut self, type_code: u32, name: &str, runs: &[u8], size: u64, flags: u16) -> Self {
        let (mut a, off) = Self::header(type_code, true, name, runs.len() + 1, flags);
        put_u16(&mut a, 32, off as u16);
        put_u64(&mut a, 40, size.div_ceil(NTFS_CLUSTER) * NTFS_CLUSTER);
        put_u64(&mut a, 48, size);
        put_u64(&mut a, 56, size);
        a[off..off + runs.len()].copy_from_slice(runs);
        self.attrs.push(a);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut r = vec![0u8; NTFS_RECORD];
        let strides = NTFS_RECORD / 512;
        r[0..4].copy_from_slice(b"FILE");
        put_u16(&mut r, 4, 0x30);
        put_u16(&mut r, 6, (strides + 1) as u16);
        put_u16(&mut r, 0x10, self.sequence);
        let first = (0x30 + (strides + 1) * 2 + 7) & !7;
        put_u16(&mut r, 0x14, first as u16);
        put_u16(&mut r, 0x16, self.flags);
        let mut pos = first;
        for a in &self.attrs {
            r[pos..pos + a.len()].copy_from_slice(a);
            pos += a.len();
        }
        put_u32(&mut r, pos, 0xFFFF_FFFF);
        pos += 8;
        put_u32(&mut r, 0x18, pos as u32);
        put_u32(&mut r, 0x1C, NTFS_RECORD as u32);
        protect(&mut r, 0x30);
        r
    }
}

/// Install the update sequence array (check value 1) over every 512-byte
/// stride.
fn protect(buf: &mut [u8], usa_offset: usize) {
    let strides = buf.len() / 512;
    put_u16(buf, usa_offset, 1);
    for i in 1..=strides {
        let end = i * 512;
        let saved = [buf[end - 2], buf[end - 1]];
        buf[usa_offset + i * 2..usa_offset + i * 2 + 2].copy_from_slice(&saved);
        put_u16(buf, end - 2, 1);
    }
}

fn file_name_key(parent: u64, name: &str, namespace: u8, is_dir: bool, size: u64) -> Vec<u8> {
    let encoded = utf16(name);
    let mut v = vec![0u8; 66 + encoded.len()];
    put_u64(&mut v, 0, parent);
    put_u64(&mut v, 40, size);
    put_u64(&mut v, 48, size);
    put_u32(&mut v, 56, if is_dir { 0x1000_0000 } else { 0x20 });
    v[64] = (encoded.len() / 2) as u8;
    v[65] = namespace;
    v[66..].copy_from_slice(&encoded);
    v
}

/// A file reference with an explicit sequence number. Plain record numbers
/// get sequence 1.
pub fn ntfs_ref(record: u64, sequence: u16) -> u64 {
    record | (sequence as u64) << 48
}

/// Index entries (with a terminating end entry) for `(mft_ref, key)` pairs.
fn index_entries(entries: &[(u64, Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (mft, key) in entries {
        let len = (16 + key.len() + 7) & !7;
        let mut e = vec![0u8; len];
        let reference = if mft >> 48 == 0 { ntfs_ref(*mft, 1) } else { *mft };
        put_u64(&mut e, 0, reference);
        put_u16(&mut e, 8, len as u16);
        put_u16(&mut e, 10, key.len() as u16);
        e[16..16 + key.len()].copy_from_slice(key);
        body.extend(e);
    }
    let mut end = vec![0u8; 16];
    put_u16(&mut end, 8, 16);
    put_u16(&mut end, 12, 0x02);
    body.extend(end);
    body
}

fn index_root_value(entries: &[(u64, Vec<u8>)], large: bool) -> Vec<u8> {
    let body = index_entries(entries);
    let mut v = vec![0u8; 32];
    put_u32(&mut v, 0, ATTR_FILE_NAME);
    put_u32(&mut v, 4, 1);
    put_u32(&mut v, 8, NTFS_CLUSTER as u32);
    v[12] = 1;
    put_u32(&mut v, 16, 16);
    let total = 16 + body.len() as u32;
    put_u32(&mut v, 20, total);
    put_u32(&mut v, 24, total);
    v[28] = large as u8;
    v.extend(body);
    v
}

fn index_block(entries: &[(u64, Vec<u8>)]) -> Vec<u8> {
    let mut block = vec![0u8; NTFS_CLUSTER as usize];
    block[0..4].copy_from_slice(b"INDX");
    put_u16(&mut block, 4, 0x28);
    put_u16(&mut block, 6, 9);
    let entries_at = 0x40usize;
    let body = index_entries(entries);
    block[entries_at..entries_at + body.len()].copy_from_slice(&body);
    let node = 0x18usize;
    put_u32(&mut block, node, (entries_at - node) as u32);
    put_u32(&mut block, node + 4, (entries_at - node + body.len()) as u32);
    put_u32(&mut block, node + 8, (NTFS_CLUSTER as usize - node) as u32);
    protect(&mut block, 0x28);
    block
}

/// 8 MiB NTFS volume "NTFSVOL":
///
/// ```text
/// root index: hello.txt (+ DOS alias), Docs   (in $INDEX_ROOT)
///             big.bin, $MFT, zeta.txt         (in one INDX block)
/// Docs/inner.txt
/// big.bin: 6000 bytes in two runs
/// ```
pub fn ntfs_image() -> Image {
    build_ntfs(false)
}

/// `ntfs_image` after some churn in the root directory:
///
/// ```text
/// INDX block 0 (in use): also zeta-link.txt (second name of zeta.txt),
///                        old.txt (record 22, since freed),
///                        reused.txt (record 19 at an older sequence),
///                        huge.bin (run length past any volume)
/// INDX block 1 (free):   ghost.txt, with torn fixups
/// ```
pub fn ntfs_image_with_history() -> Image {
    build_ntfs(true)
}

/// Byte offset of the primary $MFT record 0.
pub const NTFS_MFT_OFFSET: u64 = NTFS_MFT_LCN * NTFS_CLUSTER;

fn build_ntfs(history: bool) -> Image {
    let mut img = Image::new((NTFS_TOTAL_SECTORS + 1) * 512);

    let mut b = vec![0u8; 512];
    b[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
    b[3..11].copy_from_slice(b"NTFS    ");
    put_u16(&mut b, 11, 512);
    b[13] = 8;
    b[21] = 0xF8;
    put_u64(&mut b, 0x28, NTFS_TOTAL_SECTORS);
    put_u64(&mut b, 0x30, NTFS_MFT_LCN);
    put_u64(&mut b, 0x38, 12);
    b[0x40] = 0xF6;
    b[0x44] = 1;
    put_u64(&mut b, 0x48, 0x0123_4567_89AB_CDEF);
    b[510] = 0x55;
    b[511] = 0xAA;
    img.write(0, &b);

    let mft_size = 32 * NTFS_RECORD as u64;
    let mut records: Vec<(u64, Vec<u8>)> = Vec::new();
    let mft_record = NtfsRecord::file()
        .non_resident(ATTR_DATA, "", &[0x11, 0x08, NTFS_MFT_LCN as u8], mft_size, 0)
        .build();
    img.write(NTFS_MIRROR_LCN * NTFS_CLUSTER, &mft_record);
    records.push((0, mft_record));
    let mut volume_info = vec![0u8; 12];
    volume_info[8] = 3;
    volume_info[9] = 1;
    records.push((
        3,
        NtfsRecord::file()
            .resident(ATTR_VOLUME_NAME, "", &utf16("NTFSVOL"))
            .resident(ATTR_VOLUME_INFORMATION, "", &volume_info)
            .build(),
    ));
    let root = NtfsRecord::directory().resident(
        ATTR_INDEX_ROOT,
        "$I30",
        &index_root_value(
            &[
                (16, file_name_key(5, "hello.txt", NS_WIN32, false, NTFS_HELLO.len() as u64)),
                (16, file_name_key(5, "HELLO~1.TXT", NS_DOS, false, NTFS_HELLO.len() as u64)),
                (17, file_name_key(5, "Docs", NS_WIN32, true, 0)),
            ],
            true,
        ),
    );
    let root = if history {
        root.non_resident(ATTR_INDEX_ALLOCATION, "$I30", &[0x11, 0x02, NTFS_INDEX_LCN as u8], 2 * NTFS_CLUSTER, 0)
            .resident(ATTR_BITMAP, "$I30", &[0x01, 0, 0, 0, 0, 0, 0, 0])
    } else {
        root.non_resident(ATTR_INDEX_ALLOCATION, "$I30", &[0x11, 0x01, NTFS_INDEX_LCN as u8], NTFS_CLUSTER, 0)
    };
    records.push((5, root.build()));
    let bitmap_bytes = (NTFS_TOTAL_SECTORS / 8).div_ceil(8);
    records.push((
        6,
        NtfsRecord::file()
            .non_resident(ATTR_DATA, "", &[0x11, 0x01, NTFS_BITMAP_LCN as u8], bitmap_bytes, 0)
            .build(),
    ));
    records.push((16, NtfsRecord::file().resident(ATTR_DATA, "", NTFS_HELLO).build()));
    records.push((
        17,
        NtfsRecord::directory()
            .resident(
                ATTR_INDEX_ROOT,
                "$I30",
                &index_root_value(&[(20, file_name_key(17, "inner.txt", NS_POSIX, false, 5))], false),
            )
            .build(),
    ));
    let delta = (NTFS_BIG_LCNS[1] - NTFS_BIG_LCNS[0]) as u8;
    records.push((
        18,
        NtfsRecord::file()
            .non_resident(ATTR_DATA, "", &[0x11, 0x01, NTFS_BIG_LCNS[0] as u8, 0x11, 0x01, delta], 6000, 0)
            .build(),
    ));
    records.push((19, NtfsRecord::file().resident(ATTR_DATA, "", b"z").build()));
    records.push((20, NtfsRecord::file().resident(ATTR_DATA, "", b"inner").build()));
    records.push((
        21,
        NtfsRecord::file()
            .non_resident(ATTR_DATA, "", &[0x11, 0x01, 60], 100, 0x0001)
            .build(),
    ));
    let mut root_block = vec![
        (18, file_name_key(5, "big.bin", NS_WIN32, false, 6000)),
        (0, file_name_key(5, "$MFT", NS_WIN32, false, mft_size)),
        (21, file_name_key(5, "packed.dat", NS_WIN32, false, 100)),
        (19, file_name_key(5, "zeta.txt", NS_WIN32, false, 1)),
    ];
    if history {
        records.push((22, NtfsRecord::free().resident(ATTR_DATA, "", b"gone").build()));
        records.push((19, NtfsRecord::file().sequence(3).resident(ATTR_DATA, "", b"z").build()));
        let mut huge_run = vec![0x18];
        huge_run.extend([0xFF; 7]);
        huge_run.extend([0x7F, 0x01]);
        records.push((23, NtfsRecord::file().non_resident(ATTR_DATA, "", &huge_run, 100, 0).build()));
        root_block = vec![
            (18, file_name_key(5, "big.bin", NS_WIN32, false, 6000)),
            (23, file_name_key(5, "huge.bin", NS_WIN32, false, 100)),
            (22, file_name_key(5, "old.txt", NS_WIN32, false, 4)),
            (21, file_name_key(5, "packed.dat", NS_WIN32, false, 100)),
            (ntfs_ref(19, 2), file_name_key(5, "reused.txt", NS_WIN32, false, 1)),
            (ntfs_ref(19, 3), file_name_key(5, "zeta-link.txt", NS_WIN32, false, 1)),
            (ntfs_ref(19, 3), file_name_key(5, "zeta.txt", NS_WIN32, false, 1)),
        ];
        let mut ghost = index_block(&[(24, file_name_key(5, "ghost.txt", NS_WIN32, false, 1))]);
        ghost[510] ^= 0xFF;
        img.write((NTFS_INDEX_LCN + 1) * NTFS_CLUSTER, &ghost);
    }
    // Later pushes for the same record number win.
    for (number, raw) in records {
        img.write(NTFS_MFT_LCN * NTFS_CLUSTER + number * NTFS_RECORD as u64, &raw);
    }

    img.write(NTFS_INDEX_LCN * NTFS_CLUSTER, &index_block(&root_block));

    // Clusters 0..=63 in use.
    img.write(NTFS_BITMAP_LCN * NTFS_CLUSTER, &[0xFF; 8]);

    img.write(NTFS_BIG_LCNS[0] * NTFS_CLUSTER, &vec![b'A'; 4096]);
    img.write(NTFS_BIG_LCNS[1] * NTFS_CLUSTER, &vec![b'B'; 4096]);
    img
}

pub const NTFS_TOTAL_CLUSTERS: u64 = NTFS_TOTAL_SECTORS / 8;
pub const NTFS_FREE_CLUSTERS: u64 = NTFS_TOTAL_CLUSTERS - 64;

// ---------------------------------------------------------------------------
// Btrfs and XFS (superblocks only)

pub fn btrfs_image() -> Image {
    let mut img = Image::new(1024 * 1024);
    let mut sb = vec![0u8; 4096];
    sb[0x20..0x30].copy_from_slice(&[0x42; 16]);
    put_u64(&mut sb, 0x30, 0x10000);
    sb[0x40..0x48].copy_from_slice(b"_BHRfS_M");
    put_u64(&mut sb, 0x48, 7);
    put_u64(&mut sb, 0x70, 1 << 30);
    put_u64(&mut sb, 0x78, 256 << 20);
    put_u64(&mut sb, 0x88, 1);
    put_u32(&mut sb, 0x90, 4096);
    put_u32(&mut sb, 0x94, 16384);
    put_u64(&mut sb, 0xBC, 0x0001 | 0x0100);
    sb[0x12B..0x12B + 4].copy_from_slice(b"pool");
    let csum = crc32c::crc32c(&sb[0x20..]);
    put_u32(&mut sb, 0, csum);
    img.write(0x10000, &sb);
    img
}

pub fn xfs_image() -> Image {
    let mut img = Image::new(1024 * 1024);
    let mut sb = vec![0u8; 512];
    sb[0..4].copy_from_slice(b"XFSB");
    sb[4..8].copy_from_slice(&4096u32.to_be_bytes());
    sb[8..16].copy_from_slice(&65536u64.to_be_bytes());
    sb[32..48].copy_from_slice(&[0x5A; 16]);
    sb[84..88].copy_from_slice(&16384u32.to_be_bytes());
    sb[88..92].copy_from_slice(&4u32.to_be_bytes());
    sb[100..102].copy_from_slice(&0xB4A5u16.to_be_bytes());
    sb[102..104].copy_from_slice(&512u16.to_be_bytes());
    sb[104..106].copy_from_slice(&512u16.to_be_bytes());
    sb[108..115].copy_from_slice(b"scratch");
    sb[120] = 12;
    sb[144..152].copy_from_slice(&60000u64.to_be_bytes());
    sb[200..204].copy_from_slice(&0x018Au32.to_be_bytes());
    img.write(0, &sb);
    img
}

// ---------------------------------------------------------------------------
// Partition tables

fn mbr_slot(sector: &mut [u8], slot: usize, status: u8, ptype: u8, start: u32, len: u32) {
    let base = 446 + slot * 16;
    sector[base] = status;
    sector[base + 4] = ptype;
    put_u32(sector, base + 8, start);
    put_u32(sector, base + 12, len);
}

fn boot_signed(mut sector: Vec<u8>) -> Vec<u8> {
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

pub const MBR_FAT12_LBA: u64 = 2048;
pub const MBR_EXTENDED_LBA: u32 = 6000;

/// 16 MiB disk: FAT12 primary at LBA 2048, an extended partition at 6000
/// holding two logical partitions (Linux, then NTFS).
pub fn mbr_disk() -> Image {
    let mut img = Image::new(32768 * 512);
    let mut mbr = vec![0u8; 512];
    mbr_slot(&mut mbr, 0, 0x80, 0x01, MBR_FAT12_LBA as u32, 2880);
    mbr_slot(&mut mbr, 1, 0x00, 0x05, MBR_EXTENDED_LBA, 10000);
    img.write(0, &boot_signed(mbr));

    let mut ebr1 = vec![0u8; 512];
    mbr_slot(&mut ebr1, 0, 0, 0x83, 63, 1000);
    mbr_slot(&mut ebr1, 1, 0, 0x05, 2000, 600);
    img.write(MBR_EXTENDED_LBA as u64 * 512, &boot_signed(ebr1));

    let mut ebr2 = vec![0u8; 512];
    mbr_slot(&mut ebr2, 0, 0, 0x07, 63, 500);
    img.write((MBR_EXTENDED_LBA as u64 + 2000) * 512, &boot_signed(ebr2));

    img.embed(MBR_FAT12_LBA * 512, fat_image(FatBuilder::fat12()));
    img
}

/// GUID string to its on-disk mixed-endian bytes.
pub fn guid_bytes(guid: &str) -> [u8; 16] {
    let hex: String = guid.chars().filter(|c| *c != '-').collect();
    let mut raw = [0u8; 16];
    for (i, byte) in raw.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).unwrap();
    }
    raw[0..4].reverse();
    raw[4..6].reverse();
    raw[6..8].reverse();
    raw
}

pub const GPT_LINUX_FS: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";
pub const GPT_BASIC_DATA: &str = "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7";

fn gpt_header(current: u64, backup: u64, entries_lba: u64, entries_crc: u32) -> Vec<u8> {
    let mut h = vec![0u8; 512];
    h[0..8].copy_from_slice(b"EFI PART");
    put_u32(&mut h, 8, 0x0001_0000);
    put_u32(&mut h, 12, 92);
    put_u64(&mut h, 24, current);
    put_u64(&mut h, 32, backup);
    put_u64(&mut h, 40, 34);
    put_u64(&mut h, 48, GPT_DISK_SECTORS - 34);
    h[56..72].copy_from_slice(&[0x77; 16]);
    put_u64(&mut h, 72, entries_lba);
    put_u32(&mut h, 80, 128);
    put_u32(&mut h, 84, 128);
    put_u32(&mut h, 88, entries_crc);
    let crc = crc32fast::hash(&h[..92]);
    put_u32(&mut h, 16, crc);
    h
}

pub const GPT_DISK_SECTORS: u64 = 65536;
pub const GPT_EXT_LBA: u64 = 2048;
pub const GPT_EXT_SECTORS: u64 = 16384;

/// 32 MiB GPT disk: "linux-data" holds the ext4 tree, "win-data" is empty.
/// With `corrupt_primary` the primary header CRC is broken so the backup
/// header has to be used.
pub fn gpt_disk(corrupt_primary: bool) -> Image {
    let mut img = Image::new(GPT_DISK_SECTORS * 512);
    let mut mbr = vec![0u8; 512];
    mbr_slot(&mut mbr, 0, 0x00, 0xEE, 1, 0xFFFF_FFFF);
    img.write(0, &boot_signed(mbr));

    let mut entries = vec![0u8; 128 * 128];
    let mut entry = |index: usize, type_guid: &str, first: u64, last: u64, name: &str| {
        let e = &mut entries[index * 128..(index + 1) * 128];
        e[0..16].copy_from_slice(&guid_bytes(type_guid));
        e[16..32].copy_from_slice(&[index as u8 + 1; 16]);
        put_u64(e, 32, first);
        put_u64(e, 40, last);
        let encoded = utf16(name);
        e[56..56 + encoded.len()].copy_from_slice(&encoded);
    };
    entry(0, GPT_LINUX_FS, GPT_EXT_LBA, GPT_EXT_LBA + GPT_EXT_SECTORS - 1, "linux-data");
    entry(1, GPT_BASIC_DATA, 20480, 61439, "win-data");
    let crc = crc32fast::hash(&entries);

    let mut primary = gpt_header(1, GPT_DISK_SECTORS - 1, 2, crc);
    if corrupt_primary {
        primary[40] ^= 0xFF;
    }
    img.write(512, &primary);
    img.write(2 * 512, &entries);
    let backup_entries_lba = GPT_DISK_SECTORS - 33;
    img.write(backup_entries_lba * 512, &entries);
    img.write(
        (GPT_DISK_SECTORS - 1) * 512,
        &gpt_header(GPT_DISK_SECTORS - 1, 1, backup_entries_lba, crc),
    );

    let (ext, _) = ext_tree(ExtBuilder::ext4());
    img.embed(GPT_EXT_LBA * 512, ext);
    img
}
