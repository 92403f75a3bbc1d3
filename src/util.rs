use std::path::Path;

use color_eyre::Result;

/// Round `value` up to the next multiple of `align`.
///
/// `align` must not be zero; callers validate alignment before layouting.
#[must_use]
pub const fn roundup(value: u64, align: u64) -> u64 {
	((value + align - 1) / align) * align
}

/// Round `value` down to a multiple of `align`.
#[must_use]
pub const fn rounddown(value: u64, align: u64) -> u64 {
	value - (value % align)
}

/// Turn a virtual path into a flat file-name-safe slug.
#[must_use]
pub fn sanitize_path(path: &str) -> String {
	path.trim_matches('/').replace('/', "-")
}

/// Total size in bytes of all regular files below `dir`.
///
/// Used to resolve percent-sizes against the effective source directory.
/// Symlinks are counted by their own length, not their target's.
pub fn dir_size(dir: &Path) -> Result<u64> {
	let mut total = 0;
	for entry in std::fs::read_dir(dir)? {
		let entry = entry?;
		let meta = entry.path().symlink_metadata()?;
		if meta.is_dir() {
			total += dir_size(&entry.path())?;
		} else {
			total += meta.len();
		}
	}
	Ok(total)
}

/// zlib-style CRC-32 (IEEE 802.3, init/xorout 0xFFFFFFFF).
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
	crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundup_rounddown() {
		assert_eq!(roundup(1, 512), 512);
		assert_eq!(roundup(512, 512), 512);
		assert_eq!(roundup(513, 512), 1024);
		assert_eq!(rounddown(513, 512), 512);
		assert_eq!(rounddown(512, 512), 512);
	}

	#[test]
	fn sanitize() {
		assert_eq!(sanitize_path("boot/efi"), "boot-efi");
		assert_eq!(sanitize_path("/boot/efi/"), "boot-efi");
		assert_eq!(sanitize_path("data"), "data");
	}

	#[test]
	fn crc32_matches_zlib() {
		// zlib crc32 of "123456789"
		assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
	}

	#[test]
	fn dir_size_counts_files() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("a"), [0u8; 100]).unwrap();
		std::fs::create_dir(dir.path().join("sub")).unwrap();
		std::fs::write(dir.path().join("sub/b"), [0u8; 50]).unwrap();
		assert_eq!(dir_size(dir.path()).unwrap(), 150);
	}
}
