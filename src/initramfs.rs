// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Read-only cpio-newc archive access (boot file system)
//! OWNERS: @kernel-team
//! PUBLIC API: Initramfs, InitramfsFile
//! DEPENDS_ON: none (pure parsing over a borrowed image)
//! INVARIANTS: Every access is bounds-checked against the image; a malformed
//! archive terminates the walk, it never panics

/// Location of one file's payload inside the archive image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitramfsFile {
    offset: usize,
    len: usize,
}

impl InitramfsFile {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

const HEADER_LEN: usize = 110;
const MAGIC_NEWC: &[u8; 6] = b"070701";
const MAGIC_NEWC_CRC: &[u8; 6] = b"070702";
const TRAILER: &[u8] = b"TRAILER!!!";

fn parse_hex(field: &[u8]) -> Option<usize> {
    let mut value = 0usize;
    for &b in field {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        value = value.checked_mul(16)?.checked_add(digit as usize)?;
    }
    Some(value)
}

#[inline]
fn align4(v: usize) -> Option<usize> {
    v.checked_add(3).map(|v| v & !3)
}

/// Borrowed view of a cpio-newc boot archive.
pub struct Initramfs<'a> {
    image: &'a [u8],
}

impl<'a> Initramfs<'a> {
    pub fn new(image: &'a [u8]) -> Self {
        Self { image }
    }

    fn entry_at(&self, pos: usize) -> Option<(&'a [u8], InitramfsFile, usize)> {
        let header = self.image.get(pos..pos.checked_add(HEADER_LEN)?)?;
        let magic = &header[..6];
        if magic != MAGIC_NEWC && magic != MAGIC_NEWC_CRC {
            return None;
        }
        let file_len = parse_hex(&header[54..62])?;
        let name_len = parse_hex(&header[94..102])?;

        let name_start = pos + HEADER_LEN;
        let name_end = name_start.checked_add(name_len)?;
        // namesize counts the terminating NUL.
        let name = self.image.get(name_start..name_end.checked_sub(1)?)?;

        let data_start = align4(name_end)?;
        let data_end = data_start.checked_add(file_len)?;
        if data_end > self.image.len() {
            return None;
        }
        let next = align4(data_end)?;
        Some((name, InitramfsFile { offset: data_start, len: file_len }, next))
    }

    /// Finds the file stored under `path` (no leading slash, as cpio names
    /// are archived).
    pub fn lookup(&self, path: &str) -> Option<InitramfsFile> {
        let mut pos = 0;
        loop {
            let (name, file, next) = self.entry_at(pos)?;
            if name == TRAILER {
                return None;
            }
            if name == path.as_bytes() {
                return Some(file);
            }
            if next <= pos {
                return None;
            }
            pos = next;
        }
    }

    /// Copies file bytes starting at `offset` into `buf`; returns the number
    /// copied (short at end of file, 0 past it).
    pub fn read(&self, file: &InitramfsFile, offset: usize, buf: &mut [u8]) -> usize {
        if offset >= file.len {
            return 0;
        }
        let n = buf.len().min(file.len - offset);
        let start = file.offset + offset;
        match self.image.get(start..start + n) {
            Some(src) => {
                buf[..n].copy_from_slice(src);
                n
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_entry(image: &mut Vec<u8>, name: &str, data: &[u8]) {
        let name_len = name.len() + 1;
        image.extend_from_slice(
            format!(
                "070701{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}",
                1, 0o100644, 0, 0, 1, 0, data.len(), 0, 0, 0, 0, name_len, 0
            )
            .as_bytes(),
        );
        image.extend_from_slice(name.as_bytes());
        image.push(0);
        while image.len() % 4 != 0 {
            image.push(0);
        }
        image.extend_from_slice(data);
        while image.len() % 4 != 0 {
            image.push(0);
        }
    }

    fn archive() -> Vec<u8> {
        let mut image = Vec::new();
        push_entry(&mut image, "bin/init", b"#!ELF not really");
        push_entry(&mut image, "etc/motd", b"welcome aboard");
        push_entry(&mut image, "TRAILER!!!", b"");
        image
    }

    #[test]
    fn lookup_finds_archived_files() {
        let image = archive();
        let fs = Initramfs::new(&image);
        let motd = fs.lookup("etc/motd").unwrap();
        assert_eq!(motd.len(), 14);
        assert!(fs.lookup("bin/init").is_some());
        assert!(fs.lookup("missing").is_none());
        assert!(fs.lookup("TRAILER!!!").is_none());
    }

    #[test]
    fn read_respects_offsets_and_bounds() {
        let image = archive();
        let fs = Initramfs::new(&image);
        let motd = fs.lookup("etc/motd").unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(fs.read(&motd, 0, &mut buf), 14);
        assert_eq!(&buf[..14], b"welcome aboard");
        assert_eq!(fs.read(&motd, 8, &mut buf), 6);
        assert_eq!(&buf[..6], b"aboard");
        assert_eq!(fs.read(&motd, 14, &mut buf), 0);
        assert_eq!(fs.read(&motd, 1000, &mut buf), 0);
    }

    #[test]
    fn truncated_and_garbage_images_fail_closed() {
        let image = archive();
        let fs = Initramfs::new(&image[..image.len() / 2]);
        assert!(fs.lookup("etc/motd").is_none());
        let fs = Initramfs::new(b"not a cpio archive at all");
        assert!(fs.lookup("anything").is_none());
        let fs = Initramfs::new(b"");
        assert!(fs.lookup("anything").is_none());
    }
}
