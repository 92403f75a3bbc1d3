use std::path::PathBuf;

use color_eyre::{eyre::WrapErr, Result};
use serde::{Deserialize, Serialize};

use crate::config::{parse_extent, Size};
use crate::handlers::Handler;
use crate::image::{Child, Context, Image};
use crate::io::{self, Extent};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct FileOpts {
	/// Source file below inputpath; defaults to the image's own name.
	pub name: Option<String>,
	/// Where the content lands inside the output file.
	#[serde(default)]
	pub offset: Size,
	#[serde(default)]
	pub holes: Vec<String>,
}

/// Plain file pass-through: the output is the input from `inputpath`,
/// copied hole-preserving, optionally at an offset.
pub struct FileCopy {
	opts: FileOpts,
	src: PathBuf,
}

impl FileCopy {
	#[must_use]
	pub fn new(opts: FileOpts) -> Self {
		Self { opts, src: PathBuf::new() }
	}
}

impl Handler for FileCopy {
	fn ty(&self) -> &'static str {
		"file"
	}

	fn no_rootpath(&self) -> bool {
		true
	}

	fn parse(&mut self, image: &mut Image) -> Result<()> {
		for hole in &self.opts.holes {
			let (start, end) = parse_extent(hole)?;
			image.holes.push(Extent { start, end });
		}
		Ok(())
	}

	fn setup(&mut self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		let name = self.opts.name.clone().unwrap_or_else(|| image.file.clone());
		let name = PathBuf::from(name);
		self.src = if name.is_absolute() { name } else { ctx.opts.inputpath().join(name) };
		let meta = std::fs::metadata(&self.src)
			.wrap_err_with(|| format!("{}: stat {}", image.tag(), self.src.display()))?;
		let end = self.opts.offset.bytes + meta.len();
		if image.size == 0 {
			image.size = end;
		} else if end > image.size {
			color_eyre::eyre::bail!(
				"{}: '{}' does not fit into the configured size ({} > {})",
				image.tag(),
				self.src.display(),
				end,
				image.size
			);
		}
		Ok(())
	}

	fn generate(&self, _ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		io::prepare_image(&image.outfile, image.size)?;
		io::insert_image(
			&image.outfile,
			Some(&self.src),
			image.size - self.opts.offset.bytes,
			self.opts.offset.bytes,
			0,
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::opts::Opts;
	use std::cell::RefCell;
	use std::ffi::OsString;
	use std::path::Path;

	fn test_ctx(dir: &Path) -> Context {
		let argv: Vec<OsString> = vec![
			OsString::from("genimage"),
			OsString::from("--inputpath"),
			dir.join("input").into_os_string(),
			OsString::from("--outputpath"),
			dir.join("images").into_os_string(),
		];
		Context {
			opts: Opts::load(&argv, None).unwrap(),
			flash_types: indexmap::IndexMap::new(),
			mdraid: RefCell::default(),
		}
	}

	#[test]
	fn copies_input_and_adopts_size() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("input")).unwrap();
		std::fs::create_dir_all(dir.path().join("images")).unwrap();
		std::fs::write(dir.path().join("input/blob.bin"), vec![0x5Au8; 1000]).unwrap();

		let ctx = test_ctx(dir.path());
		let mut image = Image::blank();
		image.file = "blob.bin".to_owned();
		image.outfile = dir.path().join("images/blob.bin");

		let mut h = FileCopy::new(FileOpts::default());
		h.setup(&ctx, &mut image, &[]).unwrap();
		assert_eq!(image.size, 1000);
		h.generate(&ctx, &mut image, &[]).unwrap();
		assert_eq!(std::fs::read(dir.path().join("images/blob.bin")).unwrap(), vec![0x5Au8; 1000]);
	}

	#[test]
	fn offset_shifts_content() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("input")).unwrap();
		std::fs::create_dir_all(dir.path().join("images")).unwrap();
		std::fs::write(dir.path().join("input/b"), [0xAAu8; 16]).unwrap();

		let ctx = test_ctx(dir.path());
		let mut image = Image::blank();
		image.file = "out".to_owned();
		image.outfile = dir.path().join("images/out");

		let mut h = FileCopy::new(FileOpts {
			name: Some("b".to_owned()),
			offset: Size::bytes(512),
			holes: Vec::new(),
		});
		h.setup(&ctx, &mut image, &[]).unwrap();
		assert_eq!(image.size, 528);
		h.generate(&ctx, &mut image, &[]).unwrap();
		let data = std::fs::read(dir.path().join("images/out")).unwrap();
		assert!(data[..512].iter().all(|&b| b == 0));
		assert!(data[512..].iter().all(|&b| b == 0xAA));
	}

	#[test]
	fn missing_input_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::create_dir_all(dir.path().join("input")).unwrap();
		let ctx = test_ctx(dir.path());
		let mut image = Image::blank();
		image.file = "nope.bin".to_owned();
		let mut h = FileCopy::new(FileOpts::default());
		assert!(h.setup(&ctx, &mut image, &[]).is_err());
	}
}
