use color_eyre::{eyre::bail, Result};
use serde::{Deserialize, Serialize};

use crate::config::Size;
use crate::exec;
use crate::handlers::{finalize_size, split_args, Handler};
use crate::image::{Child, Context, Image};

fn default_compression() -> String {
	"gzip".to_owned()
}

fn default_block_size() -> Size {
	Size::bytes(4096)
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct SquashfsOpts {
	pub extraargs: Option<String>,
	/// gzip, lzo, lz4, xz, zstd, lzma or `none` (disables all compression
	/// kinds, useful for binary diffs).
	#[serde(default = "default_compression")]
	pub compression: String,
	#[serde(default = "default_block_size")]
	pub block_size: Size,
}

impl Default for SquashfsOpts {
	fn default() -> Self {
		Self {
			extraargs: None,
			compression: default_compression(),
			block_size: default_block_size(),
		}
	}
}

pub struct Squashfs {
	opts: SquashfsOpts,
}

impl Squashfs {
	#[must_use]
	pub fn new(opts: SquashfsOpts) -> Self {
		Self { opts }
	}

	fn compression_args(&self) -> Vec<String> {
		if self.opts.compression.eq_ignore_ascii_case("none") {
			[
				"-comp",
				"gzip",
				"-noInodeCompression",
				"-noDataCompression",
				"-noFragmentCompression",
				"-noXattrCompression",
			]
			.map(ToOwned::to_owned)
			.to_vec()
		} else {
			vec!["-comp".to_owned(), self.opts.compression.clone()]
		}
	}
}

impl Handler for Squashfs {
	fn ty(&self) -> &'static str {
		"squashfs"
	}

	fn setup(&mut self, _ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		if self.opts.block_size.bytes == 0 {
			bail!("{}: block-size must not be zero", image.tag());
		}
		Ok(())
	}

	fn generate(&self, ctx: &Context, image: &mut Image, _children: &[Option<Child>]) -> Result<()> {
		let src = image.srcdir()?;
		let mut cmd = exec::tool(ctx.opts.tool("mksquashfs"));
		cmd.arg(src)
			.arg(&image.outfile)
			.arg("-b")
			.arg(self.opts.block_size.bytes.to_string())
			.arg("-noappend")
			.args(self.compression_args())
			.args(split_args(&self.opts.extraargs));
		exec::run(&mut cmd)?;
		finalize_size(image)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn none_compression_expands() {
		let sq = Squashfs::new(SquashfsOpts {
			compression: "none".to_owned(),
			..SquashfsOpts::default()
		});
		let args = sq.compression_args();
		assert!(args.contains(&"-noDataCompression".to_owned()));
		assert_eq!(args[1], "gzip");
	}

	#[test]
	fn named_compression_passes_through() {
		let sq = Squashfs::new(SquashfsOpts {
			compression: "zstd".to_owned(),
			..SquashfsOpts::default()
		});
		assert_eq!(sq.compression_args(), vec!["-comp".to_owned(), "zstd".to_owned()]);
	}
}
