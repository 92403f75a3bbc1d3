//! Byte-exact output assembly primitives.
//!
//! Everything here works on output containers: regular files are kept sparse
//! wherever possible (hole punching for zero fills, `SEEK_DATA`/`SEEK_HOLE`
//! extent walks for copies), block devices are opened exclusively and written
//! directly.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use color_eyre::{
	eyre::{bail, eyre, WrapErr},
	Result,
};
use nix::libc;
use tracing::{debug, warn};

const CHUNK: usize = 4096;

/// A byte range `[start, end)` containing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
	pub start: u64,
	pub end: u64,
}

/// Whether `path` names a block device.
#[must_use]
pub fn is_block_device(path: &Path) -> bool {
	std::fs::metadata(path).map(|m| m.file_type().is_block_device()).unwrap_or(false)
}

/// Size of a block device, by seeking to its end.
pub fn block_device_size(blkdev: &Path) -> Result<u64> {
	let mut f = File::open(blkdev).wrap_err_with(|| format!("open {}", blkdev.display()))?;
	Ok(f.seek(SeekFrom::End(0))?)
}

fn open_out(path: &Path) -> Result<File> {
	let mut options = OpenOptions::new();
	options.read(true).write(true);
	if is_block_device(path) {
		options.custom_flags(libc::O_EXCL);
	} else {
		options.create(true);
	}
	options.open(path).wrap_err_with(|| format!("open {}", path.display()))
}

/// Prepare the output container. A regular file is truncated to zero and
/// then extended to `size`, yielding a sparse file; a block device gets its
/// first 2048 bytes zeroed to obliterate any previous partition signature.
pub fn prepare_image(outfile: &Path, size: u64) -> Result<()> {
	if is_block_device(outfile) {
		debug!("clearing partition signature on {}", outfile.display());
		let mut f = open_out(outfile)?;
		f.write_all(&[0u8; 2048])?;
	} else {
		let f = File::create(outfile).wrap_err_with(|| format!("open {}", outfile.display()))?;
		f.set_len(size)?;
	}
	Ok(())
}

/// Write `data` at `offset` into `outfile`, creating the file if needed.
pub fn insert_data(outfile: &Path, data: &[u8], offset: u64) -> Result<()> {
	let mut f = open_out(outfile)?;
	f.seek(SeekFrom::Start(offset))?;
	f.write_all(data).wrap_err_with(|| format!("write {}", outfile.display()))?;
	Ok(())
}

/// Grow `outfile` to `size`. The file being already larger is an error.
pub fn extend_file(outfile: &Path, size: u64) -> Result<()> {
	let f = open_out(outfile)?;
	let current = f.metadata()?.len();
	if current > size {
		bail!("{} is already larger ({current}) than requested size {size}", outfile.display());
	}
	f.set_len(size)?;
	Ok(())
}

/// Enumerate the data extents of an open file, sorted by offset. Filesystems
/// without `SEEK_DATA` support report one extent covering the whole file.
pub fn map_file_extents(file: &File, size: u64) -> Result<Vec<Extent>> {
	let fd = file.as_raw_fd();
	let mut extents = Vec::new();
	let mut pos: i64 = 0;
	while (pos as u64) < size {
		// SAFETY: plain lseek on a fd we own; no memory is passed.
		let start = unsafe { libc::lseek(fd, pos, libc::SEEK_DATA) };
		if start < 0 {
			let errno = std::io::Error::last_os_error();
			return match errno.raw_os_error() {
				// past the last data extent
				Some(libc::ENXIO) => Ok(extents),
				// not supported here; treat the whole file as data
				Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) => Ok(vec![Extent { start: 0, end: size }]),
				_ => Err(eyre!("lseek(SEEK_DATA): {errno}")),
			};
		}
		// SAFETY: see above.
		let end = unsafe { libc::lseek(fd, start, libc::SEEK_HOLE) };
		if end < 0 {
			bail!("lseek(SEEK_HOLE): {}", std::io::Error::last_os_error());
		}
		extents.push(Extent { start: start as u64, end: (end as u64).min(size) });
		pos = end;
	}
	Ok(extents)
}

fn punch_hole(f: &File, offset: u64, len: u64) -> bool {
	// SAFETY: fallocate only touches the fd's file range.
	let ret = unsafe {
		libc::fallocate(
			f.as_raw_fd(),
			libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
			offset as libc::off_t,
			len as libc::off_t,
		)
	};
	ret == 0
}

fn write_fill(f: &mut File, offset: u64, len: u64, byte: u8) -> Result<()> {
	let buf = [byte; CHUNK];
	f.seek(SeekFrom::Start(offset))?;
	let mut left = len;
	while left > 0 {
		let now = left.min(CHUNK as u64) as usize;
		f.write_all(&buf[..now])?;
		left -= now as u64;
	}
	Ok(())
}

fn fill_range(f: &mut File, offset: u64, len: u64, byte: u8, blockdev: bool) -> Result<()> {
	if len == 0 {
		return Ok(());
	}
	if byte != 0 || blockdev {
		return write_fill(f, offset, len, byte);
	}
	// zero fill on a regular file: prefer leaving the range unwritten
	let current = f.metadata()?.len();
	if offset < current {
		let upper = current.min(offset + len);
		if !punch_hole(f, offset, upper - offset) {
			write_fill(f, offset, upper - offset, 0)?;
		}
	}
	if offset + len > current {
		f.set_len(offset + len)?;
	}
	Ok(())
}

fn copy_range(dst: &mut File, src: &mut File, src_off: u64, dst_off: u64, len: u64) -> Result<()> {
	let mut buf = [0u8; CHUNK];
	src.seek(SeekFrom::Start(src_off))?;
	dst.seek(SeekFrom::Start(dst_off))?;
	let mut left = len;
	while left > 0 {
		let now = left.min(CHUNK as u64) as usize;
		src.read_exact(&mut buf[..now])?;
		dst.write_all(&buf[..now])?;
		left -= now as u64;
	}
	Ok(())
}

/// Write exactly `size` bytes at `offset` in `outfile`.
///
/// With a source file, its content is copied preserving holes: source holes
/// become unwritten regions (or `fill`-byte runs when `fill != 0`), and if
/// the source is shorter than `size` the remainder is filled with `fill`.
/// Without a source the whole range is filled. A source larger than `size`
/// is an error.
pub fn insert_image(
	outfile: &Path, infile: Option<&Path>, size: u64, offset: u64, fill: u8,
) -> Result<()> {
	let blockdev = is_block_device(outfile);
	let mut dst = open_out(outfile)?;

	let Some(infile) = infile else {
		return fill_range(&mut dst, offset, size, fill, blockdev);
	};

	let mut src = File::open(infile).wrap_err_with(|| format!("open {}", infile.display()))?;
	let srclen = src.metadata()?.len();
	if srclen > size {
		bail!("input file '{}' too large ({srclen} > {size})", infile.display());
	}

	let mut cursor = 0;
	for extent in map_file_extents(&src, srclen)? {
		fill_range(&mut dst, offset + cursor, extent.start - cursor, fill, blockdev)?;
		copy_range(&mut dst, &mut src, extent.start, offset + extent.start, extent.end - extent.start)?;
		cursor = extent.end;
	}
	fill_range(&mut dst, offset + cursor, size - cursor, fill, blockdev)
}

const BLKRRPART: libc::c_ulong = 0x125F; // _IO(0x12, 95), linux/fs.h

/// Ask the kernel to re-read a block device's partition table. A failure is
/// logged, not fatal.
pub fn reload_partitions(blkdev: &Path) {
	let f = match OpenOptions::new().read(true).write(true).open(blkdev) {
		Ok(f) => f,
		Err(e) => {
			warn!("reread partition table on {}: {e}", blkdev.display());
			return;
		},
	};
	// SAFETY: BLKRRPART takes no argument.
	let ret = unsafe { libc::ioctl(f.as_raw_fd(), BLKRRPART) };
	if ret != 0 {
		warn!(
			"reread partition table on {}: {}",
			blkdev.display(),
			std::io::Error::last_os_error()
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn prepare_makes_sparse_file_of_requested_size() {
		let dir = tempfile::tempdir().unwrap();
		let out = dir.path().join("img");
		prepare_image(&out, 1 << 20).unwrap();
		assert_eq!(std::fs::metadata(&out).unwrap().len(), 1 << 20);
	}

	#[test]
	fn insert_data_at_offset() {
		let dir = tempfile::tempdir().unwrap();
		let out = dir.path().join("img");
		prepare_image(&out, 1024).unwrap();
		insert_data(&out, b"\x55\xAA", 510).unwrap();
		let data = std::fs::read(&out).unwrap();
		assert_eq!(&data[510..512], b"\x55\xAA");
		assert_eq!(data[509], 0);
		assert_eq!(data.len(), 1024);
	}

	#[test]
	fn extend_refuses_to_shrink() {
		let dir = tempfile::tempdir().unwrap();
		let out = dir.path().join("img");
		prepare_image(&out, 2048).unwrap();
		assert!(extend_file(&out, 1024).is_err());
		extend_file(&out, 4096).unwrap();
		assert_eq!(std::fs::metadata(&out).unwrap().len(), 4096);
	}

	#[test]
	fn insert_image_copies_and_fills_tail() {
		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("src");
		let out = dir.path().join("img");
		std::fs::write(&src, vec![0x55u8; 1000]).unwrap();
		prepare_image(&out, 4096).unwrap();
		insert_image(&out, Some(&src), 2048, 1024, 0xFF).unwrap();
		let data = std::fs::read(&out).unwrap();
		assert!(data[..1024].iter().all(|&b| b == 0));
		assert!(data[1024..2024].iter().all(|&b| b == 0x55));
		assert!(data[2024..3072].iter().all(|&b| b == 0xFF));
		assert!(data[3072..].iter().all(|&b| b == 0));
	}

	#[test]
	fn insert_image_preserves_source_holes() {
		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("src");
		let out = dir.path().join("img");
		// sparse source: 64k hole, 4k data, 60k hole
		let f = File::create(&src).unwrap();
		f.set_len(128 << 10).unwrap();
		insert_data(&src, &[0xABu8; 4096], 64 << 10).unwrap();
		prepare_image(&out, 128 << 10).unwrap();
		insert_image(&out, Some(&src), 128 << 10, 0, 0).unwrap();
		let want = std::fs::read(&src).unwrap();
		let got = std::fs::read(&out).unwrap();
		assert_eq!(got, want);
	}

	#[test]
	fn insert_image_rejects_oversized_source() {
		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("src");
		let out = dir.path().join("img");
		std::fs::write(&src, [0u8; 512]).unwrap();
		prepare_image(&out, 4096).unwrap();
		assert!(insert_image(&out, Some(&src), 256, 0, 0).is_err());
	}

	#[test]
	fn fill_without_source() {
		let dir = tempfile::tempdir().unwrap();
		let out = dir.path().join("img");
		prepare_image(&out, 1024).unwrap();
		insert_image(&out, None, 512, 256, 0xEE).unwrap();
		let data = std::fs::read(&out).unwrap();
		assert!(data[..256].iter().all(|&b| b == 0));
		assert!(data[256..768].iter().all(|&b| b == 0xEE));
		assert!(data[768..].iter().all(|&b| b == 0));
	}

	#[test]
	fn extents_cover_written_data() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f");
		std::fs::write(&path, vec![1u8; 8192]).unwrap();
		let f = File::open(&path).unwrap();
		let extents = map_file_extents(&f, 8192).unwrap();
		assert!(!extents.is_empty());
		assert_eq!(extents.first().unwrap().start, 0);
		assert_eq!(extents.last().unwrap().end, 8192);
	}
}
