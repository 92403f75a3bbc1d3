//! Raw flash (MTD) images.
//!
//! A much simpler planner than `hdimage`: partitions live on erase-block
//! boundaries of the attached flash geometry, the last partition may claim
//! the remaining erase blocks, and the image is assembled with `0xFF` (the
//! erased-NAND pattern) filling every gap and partition tail.

use serde::{Deserialize, Serialize};
use tracing::info;

use color_eyre::{eyre::bail, Result};

use crate::handlers::Handler;
use crate::image::{Child, Context, Image};
use crate::io;

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct FlashImageOpts {}

pub struct Flash {
	#[allow(dead_code)]
	opts: FlashImageOpts,
}

fn find_child<'a>(children: &'a [Option<Child>], name: &str) -> Option<&'a Child> {
	children.iter().flatten().find(|c| c.file == name)
}

impl Flash {
	#[must_use]
	pub fn new(opts: FlashImageOpts) -> Self {
		Self { opts }
	}
}

impl Handler for Flash {
	fn ty(&self) -> &'static str {
		"flash"
	}

	fn no_rootpath(&self) -> bool {
		true
	}

	fn setup(&mut self, ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		let tag = image.tag();
		let ft = ctx.flash_type(image)?;
		let pebsize = ft.pebsize.bytes;
		if pebsize == 0 {
			bail!("{tag}: flash type has no pebsize");
		}
		let flashsize = pebsize * ft.numpebs.bytes;

		let mut now = 0;
		let last = image.partitions.len().checked_sub(1);
		for idx in 0..image.partitions.len() {
			let child_size = {
				let part = &image.partitions[idx];
				let name = part
					.image
					.as_deref()
					.ok_or_else(|| color_eyre::eyre::eyre!("{tag}: partition {}: no input file given", part.name))?;
				find_child(children, name)
					.ok_or_else(|| color_eyre::eyre::eyre!("{tag}: could not find {name}"))?
					.size
			};
			let part = &mut image.partitions[idx];
			if part.offset == 0 && idx > 0 {
				part.offset = now;
			}
			if part.offset % pebsize != 0 {
				bail!(
					"{tag}: partition {} offset ({}) is not a multiple of the erase block size ({pebsize})",
					part.name,
					part.offset
				);
			}
			if part.size == 0 {
				if Some(idx) != last {
					bail!("{tag}: only the last partition may have size 0");
				}
				if part.offset > flashsize {
					bail!("{tag}: size of partitions exceeds flash size ({flashsize})");
				}
				part.size = flashsize - part.offset;
			}
			if part.size % pebsize != 0 {
				bail!(
					"{tag}: partition {} size ({}) is not a multiple of the erase block size ({pebsize})",
					part.name,
					part.size
				);
			}
			if part.offset < now {
				bail!("{tag}: partition {} overlaps previous partition", part.name);
			}
			if child_size > part.size {
				bail!(
					"{tag}: image for partition {} is bigger than the partition ({child_size} > {})",
					part.name,
					part.size
				);
			}
			now = part.offset + part.size;
		}

		if now > flashsize {
			bail!("{tag}: size of partitions ({now}) exceeds flash size ({flashsize})");
		}
		if image.size == 0 {
			image.size = now;
		} else if now > image.size {
			bail!("{tag}: partitions exceed image size");
		}
		Ok(())
	}

	fn generate(&self, _ctx: &Context, image: &mut Image, children: &[Option<Child>]) -> Result<()> {
		io::prepare_image(&image.outfile, image.size)?;
		let mut now = 0;
		for part in &image.partitions {
			let Some(name) = part.image.as_deref() else {
				bail!("{}: partition {}: no input file given", image.tag(), part.name);
			};
			let child = find_child(children, name)
				.ok_or_else(|| color_eyre::eyre::eyre!("could not find {name}"))?;
			if part.offset > now {
				io::insert_image(&image.outfile, None, part.offset - now, now, 0xFF)?;
			}
			info!("{}: writing '{}' at offset 0x{:x}", image.tag(), child.file, part.offset);
			io::insert_image(&image.outfile, Some(&child.outfile), part.size, part.offset, 0xFF)?;
			now = part.offset + part.size;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{FlashSpec, Size};
	use crate::image::Partition;
	use crate::opts::Opts;
	use std::cell::RefCell;
	use std::ffi::OsString;
	use std::path::Path;

	const PEB: u64 = 16 * 1024;

	fn test_ctx(dir: &Path) -> Context {
		let argv: Vec<OsString> = vec![
			OsString::from("genimage"),
			OsString::from("--outputpath"),
			dir.to_path_buf().into_os_string(),
		];
		let mut flash_types = indexmap::IndexMap::new();
		flash_types.insert(
			"nand".to_owned(),
			FlashSpec {
				pebsize: Size::bytes(PEB),
				numpebs: Size::bytes(8),
				..FlashSpec::default()
			},
		);
		Context {
			opts: Opts::load(&argv, None).unwrap(),
			flash_types,
			mdraid: RefCell::default(),
		}
	}

	fn flash_image(dir: &Path, partitions: Vec<Partition>) -> Image {
		let mut image = Image::blank();
		image.file = "flash.img".to_owned();
		image.flash_type = Some("nand".to_owned());
		image.empty = true;
		image.partitions = partitions;
		image.outfile = dir.join("flash.img");
		image
	}

	fn part(name: &str, offset: u64, size: u64, image: &str) -> Partition {
		Partition {
			name: name.to_owned(),
			offset,
			size,
			image: Some(image.to_owned()),
			..Partition::default()
		}
	}

	fn child(dir: &Path, name: &str, len: usize, byte: u8) -> Option<Child> {
		let outfile = dir.join(name);
		std::fs::write(&outfile, vec![byte; len]).unwrap();
		Some(Child { file: name.to_owned(), size: len as u64, outfile, holes: Vec::new() })
	}

	#[test]
	fn last_partition_claims_remaining_pebs() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let children = vec![child(dir.path(), "boot.bin", 100, 0x11), child(dir.path(), "fs.bin", 200, 0x22)];
		let mut image = flash_image(
			dir.path(),
			vec![part("boot", 0, 2 * PEB, "boot.bin"), part("fs", 0, 0, "fs.bin")],
		);
		let mut flash = Flash::new(FlashImageOpts::default());
		flash.setup(&ctx, &mut image, &children).unwrap();
		assert_eq!(image.partitions[1].offset, 2 * PEB);
		assert_eq!(image.partitions[1].size, 6 * PEB);
		assert_eq!(image.size, 8 * PEB);
	}

	#[test]
	fn unaligned_offset_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let children = vec![child(dir.path(), "a.bin", 10, 0)];
		let mut image = flash_image(dir.path(), vec![part("a", 512, PEB, "a.bin")]);
		let mut flash = Flash::new(FlashImageOpts::default());
		let err = flash.setup(&ctx, &mut image, &children).unwrap_err();
		assert!(format!("{err:#}").contains("not a multiple of the erase block size"));
	}

	#[test]
	fn oversized_layout_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let children = vec![child(dir.path(), "a.bin", 10, 0)];
		let mut image = flash_image(dir.path(), vec![part("a", 0, 9 * PEB, "a.bin")]);
		let mut flash = Flash::new(FlashImageOpts::default());
		let err = flash.setup(&ctx, &mut image, &children).unwrap_err();
		assert!(format!("{err:#}").contains("exceeds flash size"));
	}

	#[test]
	fn gaps_and_tails_are_erased_flash() {
		let dir = tempfile::tempdir().unwrap();
		let ctx = test_ctx(dir.path());
		let children =
			vec![child(dir.path(), "a.bin", 100, 0x11), child(dir.path(), "b.bin", 200, 0x22)];
		let mut image = flash_image(
			dir.path(),
			vec![part("a", 0, PEB, "a.bin"), part("b", 2 * PEB, PEB, "b.bin")],
		);
		let mut flash = Flash::new(FlashImageOpts::default());
		flash.setup(&ctx, &mut image, &children).unwrap();
		flash.generate(&ctx, &mut image, &children).unwrap();

		let data = std::fs::read(dir.path().join("flash.img")).unwrap();
		assert_eq!(data.len(), (3 * PEB) as usize);
		assert!(data[..100].iter().all(|&b| b == 0x11));
		// partition tail is erased-flash fill
		assert!(data[100..PEB as usize].iter().all(|&b| b == 0xFF));
		// inter-partition gap too
		assert!(data[PEB as usize..2 * PEB as usize].iter().all(|&b| b == 0xFF));
		assert!(data[2 * PEB as usize..2 * PEB as usize + 200].iter().all(|&b| b == 0x22));
		assert!(data[2 * PEB as usize + 200..].iter().all(|&b| b == 0xFF));
	}
}
